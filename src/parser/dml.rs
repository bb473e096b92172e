use super::common::{
    identifier, keyword, literal, rest_of_statement, table_ref, unsigned, where_clause, ws,
};
use super::statement::{
    Expr, InsertParams, SelectItem, SelectParams, StatementDescriptor, StatementKind,
    StatementParams, UpdateParams,
};
use crate::core::Value;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::char,
    combinator::{map, opt},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

fn sleep_expr(input: &str) -> IResult<&str, Expr> {
    let (input, _) = keyword("SLEEP")(input)?;
    let (input, arg) = delimited(ws(char('(')), literal, ws(char(')')))(input)?;
    let seconds = match arg {
        Value::Integer(i) => i as f64,
        Value::Real(r) => r,
        Value::Text(t) => t.trim().parse::<f64>().unwrap_or(0.0),
        Value::Null => 0.0,
    };
    Ok((input, Expr::Sleep(seconds)))
}

fn count_star(input: &str) -> IResult<&str, Expr> {
    let (input, _) = keyword("COUNT")(input)?;
    let (input, _) = ws(char('('))(input)?;
    let (input, _) = ws(char('*'))(input)?;
    let (input, _) = ws(char(')'))(input)?;
    Ok((input, Expr::CountStar))
}

fn system_variable(input: &str) -> IResult<&str, Expr> {
    let (input, _) = ws(tag("@@"))(input)?;
    let (input, scope) = opt(alt((
        map(tag_no_case("global."), |_| true),
        map(tag_no_case("session."), |_| false),
        map(tag_no_case("local."), |_| false),
    )))(input)?;
    let (input, name) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)?;
    Ok((
        input,
        Expr::SystemVariable {
            global: scope.unwrap_or(false),
            name: name.to_lowercase(),
        },
    ))
}

fn user_variable(input: &str) -> IResult<&str, Expr> {
    let (input, _) = ws(char('@'))(input)?;
    let (input, name) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)?;
    Ok((input, Expr::UserVariable(name.to_lowercase())))
}

const FUNCTIONS: [&str; 9] = [
    "CONNECTION_ID",
    "DATABASE",
    "SCHEMA",
    "USER",
    "CURRENT_USER",
    "VERSION",
    "NOW",
    "LAST_INSERT_ID",
    "ROW_COUNT",
];

fn function_call(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = ws(take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'))(input)?;
    let upper = name.to_uppercase();
    if !FUNCTIONS.contains(&upper.as_str()) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    let (rest, _) = ws(char('('))(rest)?;
    let (rest, _) = ws(char(')'))(rest)?;
    Ok((rest, Expr::Function(upper)))
}

pub fn expression(input: &str) -> IResult<&str, Expr> {
    alt((
        map(ws(char('*')), |_| Expr::Star),
        count_star,
        sleep_expr,
        system_variable,
        user_variable,
        function_call,
        map(literal, Expr::Literal),
        map(identifier, Expr::Column),
    ))(input)
}

fn select_item(input: &str) -> IResult<&str, SelectItem> {
    let start = input.trim_start();
    let (input, expr) = expression(input)?;
    let written = start[..start.len() - input.len()].trim().to_string();
    let (input, alias) = opt(preceded(opt(keyword("AS")), identifier))(input)?;
    let label = alias.unwrap_or_else(|| match &expr {
        Expr::Literal(Value::Text(s)) => s.clone(),
        _ => written,
    });
    Ok((input, SelectItem { expr, label }))
}

fn locking_clause(input: &str) -> IResult<&str, (bool, bool)> {
    alt((
        map(pair(keyword("FOR"), keyword("UPDATE")), |_| (true, false)),
        map(
            tuple((keyword("LOCK"), keyword("IN"), keyword("SHARE"), keyword("MODE"))),
            |_| (false, true),
        ),
    ))(input)
}

pub fn select(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("SELECT")(input)?;
    let (input, items) = separated_list1(ws(char(',')), select_item)(input)?;
    let (input, from) = opt(preceded(keyword("FROM"), table_ref))(input)?;
    let (input, filter) = opt(where_clause)(input)?;
    let (input, limit) = opt(preceded(keyword("LIMIT"), unsigned))(input)?;
    let (input, locking) = opt(locking_clause)(input)?;
    let (for_update, lock_in_share_mode) = locking.unwrap_or((false, false));

    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::Select,
            from.into_iter().collect(),
            StatementParams::Select(SelectParams {
                items,
                filter,
                limit,
                for_update,
                lock_in_share_mode,
            }),
        ),
    ))
}

fn value_row(input: &str) -> IResult<&str, Vec<Value>> {
    delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), literal),
        ws(char(')')),
    )(input)
}

fn column_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), identifier),
        ws(char(')')),
    )(input)
}

pub fn insert(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, kind) = alt((
        map(keyword("INSERT"), |_| StatementKind::Insert),
        map(keyword("REPLACE"), |_| StatementKind::Replace),
    ))(input)?;
    let (input, _) = opt(alt((keyword("LOW_PRIORITY"), keyword("IGNORE"))))(input)?;
    let (input, _) = opt(keyword("INTO"))(input)?;
    let (input, table) = table_ref(input)?;
    let (input, columns) = opt(column_list)(input)?;
    let (input, _) = alt((keyword("VALUES"), keyword("VALUE")))(input)?;
    let (input, rows) = separated_list1(ws(char(',')), value_row)(input)?;

    Ok((
        input,
        StatementDescriptor::new(
            kind,
            vec![table],
            StatementParams::Insert(InsertParams { columns, rows }),
        ),
    ))
}

fn assignment(input: &str) -> IResult<&str, (String, Value)> {
    let (input, column) = identifier(input)?;
    let (input, _) = ws(char('='))(input)?;
    let (input, value) = literal(input)?;
    Ok((input, (column, value)))
}

pub fn update(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("UPDATE")(input)?;
    let (input, _) = opt(keyword("LOW_PRIORITY"))(input)?;
    let (input, table) = table_ref(input)?;
    let (input, _) = keyword("SET")(input)?;
    let (input, assignments) = separated_list1(ws(char(',')), assignment)(input)?;
    let (input, filter) = opt(where_clause)(input)?;

    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::Update,
            vec![table],
            StatementParams::Update(UpdateParams {
                assignments,
                filter,
            }),
        ),
    ))
}

pub fn delete(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("DELETE")(input)?;
    let (input, _) = opt(keyword("LOW_PRIORITY"))(input)?;
    let (input, _) = keyword("FROM")(input)?;
    let (input, table) = table_ref(input)?;
    let (input, filter) = opt(where_clause)(input)?;

    Ok((
        input,
        StatementDescriptor::new(
            StatementKind::Delete,
            vec![table],
            StatementParams::Delete { filter },
        ),
    ))
}

pub fn do_statement(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("DO")(input)?;
    let (input, exprs) = separated_list1(ws(char(',')), expression)(input)?;
    Ok((
        input,
        StatementDescriptor::new(StatementKind::Do, Vec::new(), StatementParams::Do(exprs)),
    ))
}

/// `LOAD DATA ...` is recognised so it fails with "not supported" rather
/// than a syntax error.
pub fn load_data(input: &str) -> IResult<&str, StatementDescriptor> {
    let (input, _) = keyword("LOAD")(input)?;
    let (input, _) = keyword("DATA")(input)?;
    let (input, _) = rest_of_statement(input)?;
    Ok((
        input,
        StatementDescriptor::new(StatementKind::LoadData, Vec::new(), StatementParams::None),
    ))
}
