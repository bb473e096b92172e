use super::common::{
    account_name, identifier, keyword, rest_of_statement, set_value, string_literal, table_ref,
    unsigned, ws,
};
use super::statement::{
    FlushTarget, HandlerRead, StatementDescriptor, StatementKind, StatementParams, TxScope,
    VarAssignment, VarScope,
};
use crate::transaction::IsolationLevel;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::char,
    combinator::{map, opt},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

fn var_name(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
        |s: &str| s.to_lowercase(),
    )(input)
}

fn assign_op(input: &str) -> IResult<&str, &str> {
    ws(alt((tag(":="), tag("="))))(input)
}

/// Target of one assignment in `SET a = 1, @@global.b = 2, @u = 3`.
fn assignment_target(input: &str) -> IResult<&str, (VarScope, String)> {
    alt((
        preceded(
            ws(tag("@@")),
            alt((
                map(preceded(tag_no_case("global."), var_name), |n| {
                    (VarScope::Global, n)
                }),
                map(preceded(tag_no_case("session."), var_name), |n| {
                    (VarScope::Session, n)
                }),
                map(preceded(tag_no_case("local."), var_name), |n| {
                    (VarScope::Session, n)
                }),
                map(var_name, |n| (VarScope::Session, n)),
            )),
        ),
        map(preceded(ws(char('@')), var_name), |n| (VarScope::User, n)),
        map(preceded(keyword("GLOBAL"), ws(var_name)), |n| {
            (VarScope::Global, n)
        }),
        map(
            preceded(alt((keyword("SESSION"), keyword("LOCAL"))), ws(var_name)),
            |n| (VarScope::Session, n),
        ),
        map(ws(var_name), |n| (VarScope::Session, n)),
    ))(input)
}

fn assignment(input: &str) -> IResult<&str, VarAssignment> {
    let (input, (scope, name)) = assignment_target(input)?;
    let (input, _) = assign_op(input)?;
    let (input, value) = set_value(input)?;
    Ok((input, VarAssignment { scope, name, value }))
}

/// `SET NAMES utf8mb4 [COLLATE x]` / `SET CHARACTER SET x`.
fn set_names(input: &str) -> IResult<&str, Vec<VarAssignment>> {
    let (input, name) = alt((
        map(keyword("NAMES"), |_| "names"),
        map(pair(keyword("CHARACTER"), keyword("SET")), |_| {
            "character_set_client"
        }),
        map(keyword("CHARSET"), |_| "character_set_client"),
    ))(input)?;
    let (input, value) = set_value(input)?;
    let (input, _) = opt(preceded(keyword("COLLATE"), set_value))(input)?;
    Ok((
        input,
        vec![VarAssignment {
            scope: VarScope::Session,
            name: name.to_string(),
            value,
        }],
    ))
}

fn isolation_level(input: &str) -> IResult<&str, IsolationLevel> {
    let (input, _) = keyword("ISOLATION")(input)?;
    let (input, _) = keyword("LEVEL")(input)?;
    alt((
        map(pair(keyword("READ"), keyword("UNCOMMITTED")), |_| {
            IsolationLevel::ReadUncommitted
        }),
        map(pair(keyword("READ"), keyword("COMMITTED")), |_| {
            IsolationLevel::ReadCommitted
        }),
        map(pair(keyword("REPEATABLE"), keyword("READ")), |_| {
            IsolationLevel::RepeatableRead
        }),
        map(keyword("SERIALIZABLE"), |_| IsolationLevel::Serializable),
    ))(input)
}

#[derive(Debug, Clone, Copy)]
enum TxCharacteristic {
    Isolation(IsolationLevel),
    ReadOnly(bool),
}

fn tx_characteristic(input: &str) -> IResult<&str, TxCharacteristic> {
    alt((
        map(isolation_level, TxCharacteristic::Isolation),
        map(pair(keyword("READ"), keyword("ONLY")), |_| {
            TxCharacteristic::ReadOnly(true)
        }),
        map(pair(keyword("READ"), keyword("WRITE")), |_| {
            TxCharacteristic::ReadOnly(false)
        }),
    ))(input)
}

fn set_transaction(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, scope) = map(
        opt(alt((
            map(keyword("GLOBAL"), |_| TxScope::Global),
            map(keyword("SESSION"), |_| TxScope::Session),
            map(keyword("LOCAL"), |_| TxScope::Session),
        ))),
        |s| s.unwrap_or(TxScope::Next),
    )(input)?;
    let (input, _) = keyword("TRANSACTION")(input)?;
    let (input, characteristics) = separated_list1(ws(char(',')), tx_characteristic)(input)?;

    let mut read_only = None;
    let mut isolation = None;
    for c in characteristics {
        match c {
            TxCharacteristic::Isolation(level) => isolation = Some(level),
            TxCharacteristic::ReadOnly(ro) => read_only = Some(ro),
        }
    }
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::SetTransaction,
            Vec::new(),
            StatementParams::SetTransaction {
                scope,
                read_only,
                isolation,
            },
        ),
    ))
}

fn set_password(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("PASSWORD")(input)?;
    let (input, user) = opt(preceded(keyword("FOR"), account_name))(input)?;
    let (input, _) = assign_op(input)?;
    let (input, password) = alt((
        delimited(
            pair(keyword("PASSWORD"), ws(char('('))),
            string_literal,
            ws(char(')')),
        ),
        string_literal,
    ))(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::SetPassword,
            Vec::new(),
            StatementParams::SetPassword { user, password },
        ),
    ))
}

pub fn set_statement(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("SET")(input)?;
    if let Ok(done) = set_transaction(input) {
        return Ok(done);
    }
    if let Ok(done) = set_password(input) {
        return Ok(done);
    }
    let (input, assignments) = alt((
        set_names,
        separated_list1(ws(char(',')), assignment),
    ))(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::SetOption,
            Vec::new(),
            StatementParams::Set(assignments),
        ),
    ))
}

pub fn use_database(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("USE")(input)?;
    let (input, name) = identifier(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::ChangeDb,
            Vec::new(),
            StatementParams::UseDb(name),
        ),
    ))
}

pub fn kill(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("KILL")(input)?;
    let (input, mode) = opt(alt((
        map(keyword("QUERY"), |_| true),
        map(keyword("CONNECTION"), |_| false),
    )))(input)?;
    let (input, id) = unsigned(input)?;
    let query_only = mode.unwrap_or(false);
    let id = u32::try_from(id).unwrap_or(u32::MAX);
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::Kill,
            Vec::new(),
            StatementParams::Kill { id, query_only },
        ),
    ))
}

fn like_clause(input: &str) -> IResult<&str, String> {
    preceded(keyword("LIKE"), string_literal)(input)
}

fn show_scope(input: &str) -> IResult<&str, bool> {
    map(
        opt(alt((
            map(keyword("GLOBAL"), |_| true),
            map(keyword("SESSION"), |_| false),
            map(keyword("LOCAL"), |_| false),
        ))),
        |g| g.unwrap_or(false),
    )(input)
}

pub fn show(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("SHOW")(input)?;
    let (input, full) = map(opt(keyword("FULL")), |f| f.is_some())(input)?;
    let (input, global) = show_scope(input)?;
    let (input, kind) = alt((
        map(alt((keyword("DATABASES"), keyword("SCHEMAS"))), |_| {
            StatementKind::ShowDatabases
        }),
        map(keyword("TABLES"), |_| StatementKind::ShowTables),
        map(keyword("PROCESSLIST"), |_| StatementKind::ShowProcesslist),
        map(keyword("STATUS"), |_| StatementKind::ShowStatus),
        map(keyword("VARIABLES"), |_| StatementKind::ShowVariables),
        map(keyword("WARNINGS"), |_| StatementKind::ShowWarnings),
        map(keyword("ERRORS"), |_| StatementKind::ShowErrors),
    ))(input)?;
    let (input, from) = opt(preceded(alt((keyword("FROM"), keyword("IN"))), identifier))(input)?;
    let (input, like) = opt(like_clause)(input)?;
    let (input, _) = opt(preceded(keyword("LIMIT"), unsigned))(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            kind,
            Vec::new(),
            StatementParams::Show {
                global,
                full,
                from,
                like,
            },
        ),
    ))
}

fn flush_target(input: &str) -> IResult<&str, FlushTarget> {
    alt((
        map(alt((keyword("TABLES"), keyword("TABLE"))), |_| FlushTarget::Tables),
        map(keyword("PRIVILEGES"), |_| FlushTarget::Privileges),
        map(keyword("STATUS"), |_| FlushTarget::Status),
        map(
            pair(
                opt(alt((
                    keyword("BINARY"),
                    keyword("ENGINE"),
                    keyword("ERROR"),
                    keyword("GENERAL"),
                    keyword("SLOW"),
                ))),
                keyword("LOGS"),
            ),
            |_| FlushTarget::Logs,
        ),
    ))(input)
}

pub fn flush(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("FLUSH")(input)?;
    let (input, _) = opt(alt((keyword("LOCAL"), keyword("NO_WRITE_TO_BINLOG"))))(input)?;
    let (input, targets) = separated_list1(ws(char(',')), flush_target)(input)?;
    Ok((
        input,
        StatementDescriptor::new(StatementKind::Flush, Vec::new(), StatementParams::Flush(targets)),
    ))
}

pub fn shutdown(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("SHUTDOWN")(input)?;
    Ok((
        input,
        StatementDescriptor::new(StatementKind::Shutdown, Vec::new(), StatementParams::None),
    ))
}

/// `HANDLER t OPEN [AS a]`, `HANDLER t READ FIRST|NEXT [LIMIT n]`,
/// `HANDLER t CLOSE`.
pub fn handler(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("HANDLER")(input)?;
    let (input, table) = table_ref(input)?;
    let (input, (kind, params)) = alt((
        map(
            pair(keyword("OPEN"), opt(pair(opt(keyword("AS")), identifier))),
            |_| (StatementKind::HaOpen, StatementParams::None),
        ),
        map(
            tuple((
                keyword("READ"),
                alt((
                    map(keyword("FIRST"), |_| HandlerRead::First),
                    map(keyword("NEXT"), |_| HandlerRead::Next),
                )),
                opt(preceded(keyword("LIMIT"), unsigned)),
            )),
            |(_, read, _)| (StatementKind::HaRead, StatementParams::HandlerRead(read)),
        ),
        map(keyword("CLOSE"), |_| {
            (StatementKind::HaClose, StatementParams::None)
        }),
    ))(input)?;
    Ok((input, StatementDescriptor::new(kind, vec![table], params)))
}

fn definer(input: &str) -> IResult<&str, ()> {
    let (input, _) = keyword("DEFINER")(input)?;
    let (input, _) = ws(char('='))(input)?;
    let (input, _) = account_name(input)?;
    Ok((input, ()))
}

/// Stored routines and replication control: recognised so that they fail
/// with a clear "not supported" error instead of a syntax error.
pub fn unsupported(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, kind) = alt((
        map(
            tuple((
                keyword("CREATE"),
                opt(definer),
                alt((keyword("PROCEDURE"), keyword("FUNCTION"))),
            )),
            |_| StatementKind::CreateProcedure,
        ),
        map(
            pair(keyword("DROP"), alt((keyword("PROCEDURE"), keyword("FUNCTION")))),
            |_| StatementKind::DropProcedure,
        ),
        map(keyword("CALL"), |_| StatementKind::Call),
        map(
            pair(keyword("START"), alt((keyword("SLAVE"), keyword("REPLICA")))),
            |_| StatementKind::StartSlave,
        ),
        map(
            pair(keyword("STOP"), alt((keyword("SLAVE"), keyword("REPLICA")))),
            |_| StatementKind::StopSlave,
        ),
        map(
            pair(keyword("CHANGE"), alt((keyword("MASTER"), keyword("REPLICATION")))),
            |_| StatementKind::ChangeMaster,
        ),
    ))(input)?;
    let (input, _) = rest_of_statement(input)?;
    Ok((
        input,
        StatementDescriptor::new(kind, Vec::new(), StatementParams::None),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    #[test]
    fn test_set_mixed_scopes() {
        let (_, stmt) =
            set_statement("SET autocommit = 0, @@global.read_only = ON, @x := 'a'").unwrap();
        let StatementParams::Set(assignments) = stmt.params else {
            panic!("expected set params");
        };
        assert_eq!(assignments.len(), 3);
        assert_eq!(assignments[0].scope, VarScope::Session);
        assert_eq!(assignments[0].value, Value::Integer(0));
        assert_eq!(assignments[1].scope, VarScope::Global);
        assert_eq!(assignments[1].name, "read_only");
        assert_eq!(assignments[1].value, Value::Text("ON".into()));
        assert_eq!(assignments[2].scope, VarScope::User);
    }

    #[test]
    fn test_set_session_keyword() {
        let (_, stmt) = set_statement("SET SESSION max_execution_time = 50").unwrap();
        let StatementParams::Set(assignments) = stmt.params else {
            panic!("expected set params");
        };
        assert_eq!(assignments[0].name, "max_execution_time");
        assert_eq!(assignments[0].scope, VarScope::Session);
    }

    #[test]
    fn test_set_transaction_forms() {
        let (_, stmt) = set_statement("SET TRANSACTION READ ONLY").unwrap();
        assert_eq!(
            stmt.params,
            StatementParams::SetTransaction {
                scope: TxScope::Next,
                read_only: Some(true),
                isolation: None
            }
        );
        let (_, stmt) =
            set_statement("SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED").unwrap();
        assert_eq!(
            stmt.params,
            StatementParams::SetTransaction {
                scope: TxScope::Session,
                read_only: None,
                isolation: Some(IsolationLevel::ReadCommitted)
            }
        );
    }

    #[test]
    fn test_set_password() {
        let (_, stmt) = set_statement("SET PASSWORD FOR 'bob'@'%' = 'secret'").unwrap();
        assert_eq!(
            stmt.params,
            StatementParams::SetPassword {
                user: Some("bob".into()),
                password: "secret".into()
            }
        );
    }

    #[test]
    fn test_kill_forms() {
        let (_, stmt) = kill("KILL QUERY 12").unwrap();
        assert_eq!(
            stmt.params,
            StatementParams::Kill {
                id: 12,
                query_only: true
            }
        );
        let (_, stmt) = kill("KILL 7").unwrap();
        assert_eq!(
            stmt.params,
            StatementParams::Kill {
                id: 7,
                query_only: false
            }
        );
    }

    #[test]
    fn test_show_variants() {
        let (_, stmt) = show("SHOW GLOBAL STATUS LIKE 'Com_%'").unwrap();
        assert_eq!(stmt.kind, StatementKind::ShowStatus);
        assert_eq!(
            stmt.params,
            StatementParams::Show {
                global: true,
                full: false,
                from: None,
                like: Some("Com_%".into())
            }
        );
        let (_, stmt) = show("SHOW FULL PROCESSLIST").unwrap();
        assert_eq!(stmt.kind, StatementKind::ShowProcesslist);
    }

    #[test]
    fn test_handler_read() {
        let (_, stmt) = handler("HANDLER t READ NEXT").unwrap();
        assert_eq!(stmt.kind, StatementKind::HaRead);
        assert_eq!(stmt.params, StatementParams::HandlerRead(HandlerRead::Next));
    }

    #[test]
    fn test_unsupported_kinds() {
        let (_, stmt) = unsupported("CREATE DEFINER = root PROCEDURE p() BEGIN END").unwrap();
        assert_eq!(stmt.kind, StatementKind::CreateProcedure);
        let (_, stmt) = unsupported("START SLAVE").unwrap();
        assert_eq!(stmt.kind, StatementKind::StartSlave);
    }
}
