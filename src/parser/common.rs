use crate::core::Value;
use super::statement::{Filter, TableRef};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, not, opt, peek, recognize, value as nom_value, verify},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

pub fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

const fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Case-insensitive keyword that must end on a word boundary, so `SET`
/// does not match the start of `SETTINGS`.
pub fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    ws(nom::sequence::terminated(
        tag_no_case(kw),
        not(peek(take_while1(is_ident_char))),
    ))
}

/// Sequence of keywords separated by whitespace, e.g. `keywords(&["IF", "NOT", "EXISTS"])`.
pub fn keywords<'a>(kws: &'static [&'static str]) -> impl FnMut(&'a str) -> IResult<&'a str, ()> {
    move |mut input: &'a str| {
        for kw in kws {
            let (rest, _) = keyword(kw)(input)?;
            input = rest;
        }
        Ok((input, ()))
    }
}

const RESERVED: [&str; 24] = [
    "SELECT", "FROM", "WHERE", "SET", "VALUES", "VALUE", "INTO", "LIMIT", "FOR", "LOCK", "AS",
    "AND", "OR", "NOT", "ON", "TO", "READ", "WRITE", "ENGINE", "ORDER", "GROUP", "BY", "LOW_PRIORITY",
    "LOCAL",
];

fn plain_identifier(input: &str) -> IResult<&str, String> {
    map(
        verify(
            recognize(pair(
                take_while1(|c: char| c.is_ascii_alphabetic() || c == '_' || c == '$'),
                take_while(is_ident_char),
            )),
            |s: &str| !RESERVED.iter().any(|kw| kw.eq_ignore_ascii_case(s)),
        ),
        |s: &str| s.to_lowercase(),
    )(input)
}

fn quoted_identifier(input: &str) -> IResult<&str, String> {
    map(
        delimited(char('`'), take_while(|c: char| c != '`'), char('`')),
        |s: &str| s.to_lowercase(),
    )(input)
}

/// Identifier, plain or backtick-quoted, folded to lower case.
pub fn identifier(input: &str) -> IResult<&str, String> {
    ws(alt((quoted_identifier, plain_identifier)))(input)
}

/// `[db.]table`
pub fn table_ref(input: &str) -> IResult<&str, TableRef> {
    let (input, first) = identifier(input)?;
    let (input, second) = opt(preceded(ws(char('.')), identifier))(input)?;
    let table = match second {
        Some(name) => TableRef::new(Some(first), name),
        None => TableRef::new(None, first),
    };
    Ok((input, table))
}

pub fn table_list(input: &str) -> IResult<&str, Vec<TableRef>> {
    separated_list1(ws(char(',')), table_ref)(input)
}

/// Single or double quoted string with backslash and doubled-quote escapes.
pub fn string_literal(input: &str) -> IResult<&str, String> {
    ws(alt((quoted_with('\''), quoted_with('"'))))(input)
}

fn quoted_with(quote: char) -> impl Fn(&str) -> IResult<&str, String> {
    move |input: &str| {
        let (mut rest, _) = char(quote)(input)?;
        let mut out = String::new();
        loop {
            let mut chars = rest.chars();
            match chars.next() {
                None => {
                    return Err(nom::Err::Error(nom::error::Error::new(
                        rest,
                        nom::error::ErrorKind::Char,
                    )));
                }
                Some('\\') => {
                    let escaped = chars.next().unwrap_or('\\');
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                    rest = chars.as_str();
                }
                Some(c) if c == quote => {
                    if chars.as_str().starts_with(quote) {
                        out.push(quote);
                        rest = &chars.as_str()[quote.len_utf8()..];
                    } else {
                        return Ok((chars.as_str(), out));
                    }
                }
                Some(c) => {
                    out.push(c);
                    rest = chars.as_str();
                }
            }
        }
    }
}

fn number(input: &str) -> IResult<&str, Value> {
    let (input, text) = recognize(tuple((
        opt(alt((char('-'), char('+')))),
        digit1,
        opt(pair(char('.'), digit1)),
    )))(input)?;
    let parsed = if text.contains('.') {
        text.parse::<f64>().ok().map(Value::Real)
    } else {
        text.parse::<i64>().ok().map(Value::Integer)
    };
    match parsed {
        Some(v) => Ok((input, v)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            text,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

/// Literal value: number, string, NULL, TRUE/FALSE.
pub fn literal(input: &str) -> IResult<&str, Value> {
    ws(alt((
        number,
        map(string_literal, Value::Text),
        nom_value(Value::Null, keyword("NULL")),
        nom_value(Value::Integer(1), keyword("TRUE")),
        nom_value(Value::Integer(0), keyword("FALSE")),
    )))(input)
}

/// Right-hand side of `SET var = ...`: literals plus bare words such as ON,
/// OFF or a charset name.
pub fn set_value(input: &str) -> IResult<&str, Value> {
    alt((
        literal,
        map(
            ws(take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')),
            |s: &str| Value::Text(s.to_string()),
        ),
    ))(input)
}

pub fn unsigned(input: &str) -> IResult<&str, u64> {
    ws(map_res(digit1, |s: &str| s.parse::<u64>()))(input)
}

/// `WHERE column = value`
pub fn where_clause(input: &str) -> IResult<&str, Filter> {
    let (input, _) = keyword("WHERE")(input)?;
    let (input, column) = identifier(input)?;
    let (input, _) = ws(char('='))(input)?;
    let (input, value) = literal(input)?;
    Ok((input, Filter { column, value }))
}

/// Account name: `user`, `'user'`, optionally followed by `@host`.
pub fn account_name(input: &str) -> IResult<&str, String> {
    let (input, user) = alt((string_literal, identifier))(input)?;
    let (input, _) = opt(preceded(
        ws(char('@')),
        alt((
            string_literal,
            map(ws(take_while1(|c: char| is_ident_char(c) || c == '%' || c == '.')), |s: &str| {
                s.to_string()
            }),
        )),
    ))(input)?;
    Ok((input, user))
}

/// Everything up to the end of input; used for recognised but unsupported
/// statements.
pub fn rest_of_statement(input: &str) -> IResult<&str, &str> {
    Ok(("", input))
}

/// `=` that may be omitted, as in `ENGINE InnoDB`.
pub fn optional_equals(input: &str) -> IResult<&str, ()> {
    map(opt(ws(tag("="))), |_| ())(input)
}

pub fn whitespace1(input: &str) -> IResult<&str, &str> {
    multispace1(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_boundary() {
        assert!(keyword("SET")("SET x").is_ok());
        assert!(keyword("SET")("SETTINGS").is_err());
        assert!(keyword("set")("SET").is_ok());
    }

    #[test]
    fn test_identifier_forms() {
        assert_eq!(identifier("Users ").unwrap().1, "users");
        assert_eq!(identifier("`Order Items`").unwrap().1, "order items");
        assert!(identifier("FROM").is_err());
    }

    #[test]
    fn test_table_ref_with_db() {
        let (_, t) = table_ref("shop.items").unwrap();
        assert_eq!(t.db.as_deref(), Some("shop"));
        assert_eq!(t.name, "items");
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(string_literal("'it''s'").unwrap().1, "it's");
        assert_eq!(string_literal(r"'a\'b'").unwrap().1, "a'b");
        assert_eq!(string_literal("\"x\"").unwrap().1, "x");
        assert!(string_literal("'open").is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal("42").unwrap().1, Value::Integer(42));
        assert_eq!(literal("-7").unwrap().1, Value::Integer(-7));
        assert_eq!(literal("2.5").unwrap().1, Value::Real(2.5));
        assert_eq!(literal("NULL").unwrap().1, Value::Null);
        assert_eq!(literal("true").unwrap().1, Value::Integer(1));
    }

    #[test]
    fn test_account_name_drops_host() {
        assert_eq!(account_name("'bob'@'%'").unwrap().1, "bob");
        assert_eq!(account_name("alice@localhost").unwrap().1, "alice");
    }
}
