use super::common::{
    account_name, identifier, keyword, keywords, optional_equals, rest_of_statement,
    string_literal, table_list, table_ref, unsigned, ws,
};
use super::statement::{
    AlterTableOp, CreateTableParams, StatementDescriptor, StatementKind, StatementParams, TableRef,
};
use crate::core::Privileges;
use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::char,
    combinator::{map, opt},
    multi::separated_list1,
    sequence::{pair, preceded, tuple},
    IResult,
};

const CONSTRAINT_WORDS: [&str; 7] = [
    "PRIMARY",
    "KEY",
    "INDEX",
    "UNIQUE",
    "CONSTRAINT",
    "FOREIGN",
    "CHECK",
];

/// Takes the parenthesised body of CREATE TABLE and returns the column
/// names. Types and constraints are not interpreted.
fn column_block(input: &str) -> IResult<&str, Vec<String>> {
    let (input, _) = ws(char('('))(input)?;
    let mut depth = 1usize;
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut consumed = input.len();

    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    items.push(std::mem::take(&mut current));
                    consumed = i + 1;
                    break;
                }
                current.push(c);
            }
            ',' if depth == 1 => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if depth != 0 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        )));
    }

    let mut columns = Vec::new();
    for item in &items {
        let first_word = item
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();
        if first_word.is_empty() || CONSTRAINT_WORDS.contains(&first_word.as_str()) {
            continue;
        }
        let Ok((_, name)) = identifier(item.as_str()) else {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Alpha,
            )));
        };
        columns.push(name);
    }
    if columns.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::SeparatedList,
        )));
    }
    Ok((&input[consumed..], columns))
}

fn engine_option(input: &str) -> IResult<&str, String> {
    let (input, _) = keyword("ENGINE")(input)?;
    let (input, _) = optional_equals(input)?;
    let (input, name) = ws(take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'))(input)?;
    Ok((input, name.to_uppercase()))
}

fn if_not_exists(input: &str) -> IResult<&str, bool> {
    map(opt(keywords(&["IF", "NOT", "EXISTS"])), |o| o.is_some())(input)
}

fn if_exists(input: &str) -> IResult<&str, bool> {
    map(opt(keywords(&["IF", "EXISTS"])), |o| o.is_some())(input)
}

pub fn create_table(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("CREATE")(input)?;
    let (input, temporary) = opt(keyword("TEMPORARY"))(input)?;
    let (input, _) = keyword("TABLE")(input)?;
    let (input, if_not_exists) = if_not_exists(input)?;
    let (input, mut table) = table_ref(input)?;
    let (input, columns) = column_block(input)?;
    let (input, engine) = opt(engine_option)(input)?;
    let (input, _) = rest_of_statement(input)?;
    table.temporary = temporary.is_some();

    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::CreateTable,
            vec![table],
            StatementParams::CreateTable(CreateTableParams {
                columns,
                if_not_exists,
                engine,
            }),
        ),
    ))
}

pub fn drop_table(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("DROP")(input)?;
    let (input, temporary) = opt(keyword("TEMPORARY"))(input)?;
    let (input, _) = keyword("TABLE")(input)?;
    let (input, if_exists) = if_exists(input)?;
    let (input, mut tables) = table_list(input)?;
    for table in &mut tables {
        table.temporary = temporary.is_some();
    }

    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::DropTable,
            tables,
            StatementParams::DropTable { if_exists },
        ),
    ))
}

pub fn alter_table(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("ALTER")(input)?;
    let (input, _) = keyword("TABLE")(input)?;
    let (input, table) = table_ref(input)?;
    let (input, op) = alt((
        map(
            preceded(pair(keyword("ADD"), opt(keyword("COLUMN"))), identifier),
            AlterTableOp::AddColumn,
        ),
        map(
            preceded(pair(keyword("DROP"), opt(keyword("COLUMN"))), identifier),
            AlterTableOp::DropColumn,
        ),
    ))(input)?;
    let (input, _) = rest_of_statement(input)?;

    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::AlterTable,
            vec![table],
            StatementParams::AlterTable(op),
        ),
    ))
}

/// `RENAME TABLE a TO b, c TO d`; tables are listed as old/new pairs.
pub fn rename_table(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("RENAME")(input)?;
    let (input, _) = keyword("TABLE")(input)?;
    let (input, pairs) = separated_list1(
        ws(char(',')),
        tuple((table_ref, keyword("TO"), table_ref)),
    )(input)?;
    let tables = pairs
        .into_iter()
        .flat_map(|(from, _, to)| [from, to])
        .collect();

    Ok((
        input,
        StatementDescriptor::new(StatementKind::RenameTable, tables, StatementParams::None),
    ))
}

pub fn truncate(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("TRUNCATE")(input)?;
    let (input, _) = opt(keyword("TABLE"))(input)?;
    let (input, table) = table_ref(input)?;
    Ok((
        input,
        StatementDescriptor::new(StatementKind::Truncate, vec![table], StatementParams::None),
    ))
}

pub fn create_index(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("CREATE")(input)?;
    let (input, _) = opt(keyword("UNIQUE"))(input)?;
    let (input, _) = keyword("INDEX")(input)?;
    let (input, name) = identifier(input)?;
    let (input, _) = keyword("ON")(input)?;
    let (input, table) = table_ref(input)?;
    let (input, _) = rest_of_statement(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::CreateIndex,
            vec![table],
            StatementParams::Index { name },
        ),
    ))
}

pub fn drop_index(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("DROP")(input)?;
    let (input, _) = keyword("INDEX")(input)?;
    let (input, name) = identifier(input)?;
    let (input, _) = keyword("ON")(input)?;
    let (input, table) = table_ref(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::DropIndex,
            vec![table],
            StatementParams::Index { name },
        ),
    ))
}

fn database_word(input: &str) -> IResult<&str, &str> {
    alt((keyword("DATABASE"), keyword("SCHEMA")))(input)
}

pub fn create_database(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("CREATE")(input)?;
    let (input, _) = database_word(input)?;
    let (input, if_flag) = if_not_exists(input)?;
    let (input, name) = identifier(input)?;
    let (input, _) = rest_of_statement(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::CreateDb,
            Vec::new(),
            StatementParams::Database { name, if_flag },
        ),
    ))
}

pub fn drop_database(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("DROP")(input)?;
    let (input, _) = database_word(input)?;
    let (input, if_flag) = if_exists(input)?;
    let (input, name) = identifier(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::DropDb,
            Vec::new(),
            StatementParams::Database { name, if_flag },
        ),
    ))
}

fn read_only_option(input: &str) -> IResult<&str, u8> {
    let (input, _) = keyword("READ_ONLY")(input)?;
    let (input, _) = optional_equals(input)?;
    let (input, level) = alt((
        map(unsigned, |n| n.min(u64::from(u8::MAX)) as u8),
        map(keyword("DEFAULT"), |_| 0),
    ))(input)?;
    Ok((input, level))
}

/// `ALTER DATABASE [name] READ_ONLY [=] {0|1|2|DEFAULT}`; other options are
/// accepted and ignored.
pub fn alter_database(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("ALTER")(input)?;
    let (input, _) = database_word(input)?;
    let (input, read_only) = opt(read_only_option)(input)?;
    let (input, name) = if read_only.is_some() {
        (input, None)
    } else {
        opt(identifier)(input)?
    };
    let (input, read_only) = match read_only {
        Some(level) => (input, Some(level)),
        None => opt(read_only_option)(input)?,
    };
    let (input, _) = rest_of_statement(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::AlterDb,
            Vec::new(),
            StatementParams::AlterDatabase { name, read_only },
        ),
    ))
}

fn identified_by(input: &str) -> IResult<&str, String> {
    let (input, _) = keyword("IDENTIFIED")(input)?;
    let (input, _) = opt(pair(
        keyword("WITH"),
        ws(take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')),
    ))(input)?;
    let (input, _) = keyword("BY")(input)?;
    string_literal(input)
}

pub fn create_user(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("CREATE")(input)?;
    let (input, _) = keyword("USER")(input)?;
    let (input, if_not_exists) = if_not_exists(input)?;
    let (input, user) = account_name(input)?;
    let (input, password) = opt(identified_by)(input)?;
    let (input, _) = rest_of_statement(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::CreateUser,
            Vec::new(),
            StatementParams::CreateUser {
                user,
                password,
                if_not_exists,
            },
        ),
    ))
}

pub fn drop_user(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("DROP")(input)?;
    let (input, _) = keyword("USER")(input)?;
    let (input, if_exists) = if_exists(input)?;
    let (input, user) = account_name(input)?;
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::DropUser,
            Vec::new(),
            StatementParams::DropUser { user, if_exists },
        ),
    ))
}

pub fn alter_user(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("ALTER")(input)?;
    let (input, _) = keyword("USER")(input)?;
    let (input, _) = opt(keywords(&["IF", "EXISTS"]))(input)?;
    let (input, user) = account_name(input)?;
    let (input, password) = opt(identified_by)(input)?;
    let (input, expire) = opt(pair(keyword("PASSWORD"), keyword("EXPIRE")))(input)?;
    let (input, _) = rest_of_statement(input)?;
    if password.is_none() && expire.is_none() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Alt,
        )));
    }
    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::AlterUser,
            Vec::new(),
            StatementParams::AlterUser {
                user,
                password,
                expire: expire.is_some(),
            },
        ),
    ))
}

fn privilege_word(input: &str) -> IResult<&str, &str> {
    ws(take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'))(input)
}

/// One privilege name, possibly several words (`LOCK TABLES`,
/// `CREATE TEMPORARY TABLES`).
fn privilege_name(input: &str) -> IResult<&str, Privileges> {
    let mut rest = input;
    let mut words = Vec::new();
    while let Ok((next, word)) = privilege_word(rest) {
        if word.eq_ignore_ascii_case("ON") {
            break;
        }
        words.push(word);
        rest = next;
    }
    match Privileges::from_name(&words.join(" ")) {
        Some(privileges) if !words.is_empty() => Ok((rest, privileges)),
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

fn privilege_list(input: &str) -> IResult<&str, Privileges> {
    let (input, list) = separated_list1(ws(char(',')), privilege_name)(input)?;
    Ok((
        input,
        list.into_iter().fold(Privileges::NONE, |acc, p| acc | p),
    ))
}

/// `*.*`, `*`, `db.*`, `db.t` or `t`.
fn grant_target(input: &str) -> IResult<&str, (Option<String>, Option<String>)> {
    alt((
        map(tuple((ws(char('*')), ws(char('.')), ws(char('*')))), |_| {
            (None, None)
        }),
        map(tuple((identifier, ws(char('.')), ws(char('*')))), |(db, _, _)| {
            (Some(db), None)
        }),
        map(table_ref, |t: TableRef| (t.db, Some(t.name))),
        map(ws(char('*')), |_| (None, None)),
    ))(input)
}

pub fn grant(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, kind) = alt((
        map(keyword("GRANT"), |_| StatementKind::Grant),
        map(keyword("REVOKE"), |_| StatementKind::Revoke),
    ))(input)?;
    let (input, privileges) = privilege_list(input)?;
    let (input, _) = keyword("ON")(input)?;
    let (input, (db, table)) = grant_target(input)?;
    let (input, _) = alt((keyword("TO"), keyword("FROM")))(input)?;
    let (input, user) = account_name(input)?;
    let (input, _) = rest_of_statement(input)?;
    let tables = match (&db, &table) {
        (_, Some(name)) => vec![TableRef::new(db.clone(), name.clone())],
        _ => Vec::new(),
    };
    Ok((
        input,
        StatementDescriptor::new(
            kind,
            tables,
            StatementParams::Grant {
                privileges,
                db,
                table,
                user,
            },
        ),
    ))
}
