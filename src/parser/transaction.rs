use super::common::{identifier, keyword, string_literal, table_ref, ws};
use super::statement::{
    Completion, StatementDescriptor, StatementKind, StatementParams, TableLockType, TableRef,
};
use nom::{
    branch::alt,
    character::complete::char,
    combinator::{map, opt},
    multi::separated_list1,
    sequence::{pair, preceded},
    IResult,
};

#[derive(Debug, Clone, Copy)]
enum BeginOption {
    ReadOnly,
    ReadWrite,
    ConsistentSnapshot,
}

fn begin_option(input: &str) -> IResult<&str, BeginOption> {
    alt((
        map(pair(keyword("READ"), keyword("ONLY")), |_| BeginOption::ReadOnly),
        map(pair(keyword("READ"), keyword("WRITE")), |_| BeginOption::ReadWrite),
        map(
            pair(pair(keyword("WITH"), keyword("CONSISTENT")), keyword("SNAPSHOT")),
            |_| BeginOption::ConsistentSnapshot,
        ),
    ))(input)
}

pub fn begin_transaction(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, options) = alt((
        map(pair(keyword("BEGIN"), opt(keyword("WORK"))), |_| Vec::new()),
        preceded(
            pair(keyword("START"), keyword("TRANSACTION")),
            map(
                opt(separated_list1(ws(char(',')), begin_option)),
                Option::unwrap_or_default,
            ),
        ),
    ))(input)?;

    let mut read_only = None;
    let mut consistent_snapshot = false;
    for option in options {
        match option {
            BeginOption::ReadOnly => read_only = Some(true),
            BeginOption::ReadWrite => read_only = Some(false),
            BeginOption::ConsistentSnapshot => consistent_snapshot = true,
        }
    }

    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::Begin,
            Vec::new(),
            StatementParams::Begin {
                read_only,
                consistent_snapshot,
            },
        ),
    ))
}

fn completion(input: &str) -> IResult<&str, Completion> {
    let (input, _) = opt(keyword("WORK"))(input)?;
    let (input, chain) = opt(preceded(
        keyword("AND"),
        alt((
            map(pair(keyword("NO"), keyword("CHAIN")), |_| false),
            map(keyword("CHAIN"), |_| true),
        )),
    ))(input)?;
    let (input, release) = opt(alt((
        map(pair(keyword("NO"), keyword("RELEASE")), |_| false),
        map(keyword("RELEASE"), |_| true),
    )))(input)?;
    Ok((
        input,
        Completion {
            chain: chain.unwrap_or(false),
            release: release.unwrap_or(false),
        },
    ))
}

pub fn commit_transaction(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("COMMIT")(input)?;
    let (input, completion) = completion(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::Commit,
            Vec::new(),
            StatementParams::Completion(completion),
        ),
    ))
}

/// ROLLBACK, or ROLLBACK TO [SAVEPOINT] name.
pub fn rollback_transaction(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("ROLLBACK")(input)?;
    let (input, _) = opt(keyword("WORK"))(input)?;
    let (input, savepoint) = opt(preceded(
        pair(keyword("TO"), opt(keyword("SAVEPOINT"))),
        identifier,
    ))(input)?;
    if let Some(name) = savepoint {
        return Ok((
            input,
            StatementDescriptor::new(
                StatementKind::RollbackToSavepoint,
                Vec::new(),
                StatementParams::Savepoint(name),
            ),
        ));
    }
    let (input, completion) = completion(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::Rollback,
            Vec::new(),
            StatementParams::Completion(completion),
        ),
    ))
}

pub fn savepoint(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("SAVEPOINT")(input)?;
    let (input, name) = identifier(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::Savepoint,
            Vec::new(),
            StatementParams::Savepoint(name),
        ),
    ))
}

pub fn release_savepoint(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("RELEASE")(input)?;
    let (input, _) = keyword("SAVEPOINT")(input)?;
    let (input, name) = identifier(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::ReleaseSavepoint,
            Vec::new(),
            StatementParams::Savepoint(name),
        ),
    ))
}

fn xid(input: &str) -> IResult<&str, String> {
    alt((string_literal, identifier))(input)
}

pub fn xa(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("XA")(input)?;
    let (input, kind) = alt((
        map(alt((keyword("START"), keyword("BEGIN"))), |_| StatementKind::XaStart),
        map(keyword("END"), |_| StatementKind::XaEnd),
        map(keyword("PREPARE"), |_| StatementKind::XaPrepare),
        map(keyword("COMMIT"), |_| StatementKind::XaCommit),
        map(keyword("ROLLBACK"), |_| StatementKind::XaRollback),
        map(keyword("RECOVER"), |_| StatementKind::XaRecover),
    ))(input)?;

    if kind == StatementKind::XaRecover {
        return Ok((
            input,
            StatementDescriptor::new(kind, Vec::new(), StatementParams::None),
        ));
    }

    let (input, xid) = xid(input)?;
    let (input, one_phase) = if kind == StatementKind::XaCommit {
        map(opt(pair(keyword("ONE"), keyword("PHASE"))), |o| o.is_some())(input)?
    } else {
        (input, false)
    };
    Ok((
        input,
        StatementDescriptor::new(kind, Vec::new(), StatementParams::Xa { xid, one_phase }),
    ))
}

fn lock_item(input: &str) -> IResult<&str, (TableRef, TableLockType)> {
    let (input, table) = table_ref(input)?;
    let (input, _) = opt(pair(opt(keyword("AS")), identifier))(input)?;
    let (input, lock) = alt((
        map(pair(keyword("READ"), opt(keyword("LOCAL"))), |_| TableLockType::Read),
        map(pair(opt(keyword("LOW_PRIORITY")), keyword("WRITE")), |_| {
            TableLockType::Write
        }),
    ))(input)?;
    Ok((input, (table, lock)))
}

pub fn lock_tables(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("LOCK")(input)?;
    let (input, _) = alt((keyword("TABLES"), keyword("TABLE")))(input)?;
    let (input, items) = separated_list1(ws(char(',')), lock_item)(input)?;
    let (tables, locks) = items.into_iter().unzip();
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::LockTables,
            tables,
            StatementParams::LockTables(locks),
        ),
    ))
}

pub fn unlock_tables(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("UNLOCK")(input)?;
    let (input, _) = alt((keyword("TABLES"), keyword("TABLE")))(input)?;
    Ok((
        input,
        StatementDescriptor::new(StatementKind::UnlockTables, Vec::new(), StatementParams::None),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_transaction_read_only() {
        let (_, stmt) =
            begin_transaction("START TRANSACTION READ ONLY, WITH CONSISTENT SNAPSHOT").unwrap();
        assert_eq!(
            stmt.params,
            StatementParams::Begin {
                read_only: Some(true),
                consistent_snapshot: true
            }
        );
        let (_, stmt) = begin_transaction("BEGIN").unwrap();
        assert_eq!(
            stmt.params,
            StatementParams::Begin {
                read_only: None,
                consistent_snapshot: false
            }
        );
    }

    #[test]
    fn test_commit_and_chain() {
        let (_, stmt) = commit_transaction("COMMIT WORK AND CHAIN NO RELEASE").unwrap();
        assert_eq!(
            stmt.params,
            StatementParams::Completion(Completion {
                chain: true,
                release: false
            })
        );
    }

    #[test]
    fn test_rollback_to_savepoint() {
        let (_, stmt) = rollback_transaction("ROLLBACK TO SAVEPOINT sp1").unwrap();
        assert_eq!(stmt.kind, StatementKind::RollbackToSavepoint);
        assert_eq!(stmt.params, StatementParams::Savepoint("sp1".into()));
        let (_, stmt) = rollback_transaction("ROLLBACK").unwrap();
        assert_eq!(stmt.kind, StatementKind::Rollback);
    }

    #[test]
    fn test_xa_commit_one_phase() {
        let (_, stmt) = xa("XA COMMIT 'trx1' ONE PHASE").unwrap();
        assert_eq!(stmt.kind, StatementKind::XaCommit);
        assert_eq!(
            stmt.params,
            StatementParams::Xa {
                xid: "trx1".into(),
                one_phase: true
            }
        );
    }

    #[test]
    fn test_lock_tables_modes() {
        let (_, stmt) = lock_tables("LOCK TABLES a READ, b WRITE").unwrap();
        assert_eq!(stmt.tables.len(), 2);
        assert_eq!(
            stmt.params,
            StatementParams::LockTables(vec![TableLockType::Read, TableLockType::Write])
        );
    }
}
