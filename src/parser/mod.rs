//! SQL text to `StatementDescriptor`.
//!
//! The grammar covers what the execution core needs to classify and run a
//! statement; it is not a general SQL parser.

mod admin;
mod common;
mod ddl;
mod dml;
mod statement;
mod transaction;

pub use statement::{
    AlterTableOp, Completion, CreateTableParams, Expr, Filter, FlushTarget, HandlerRead,
    InsertParams, SelectItem, SelectParams, StatementDescriptor, StatementKind, StatementParams,
    TableLockType, TableRef, TxScope, UpdateParams, VarAssignment, VarScope,
};

use crate::core::ServerError;
use nom::branch::alt;

/// Longest excerpt quoted back in a syntax error.
const NEAR_LIMIT: usize = 80;

/// Parses the statement that starts at `offset` in `text`.
///
/// Returns the descriptor and the offset of the next statement, or `None`
/// when nothing but whitespace, comments and separators follows.
pub fn parse(text: &str, offset: usize) -> Result<(StatementDescriptor, Option<usize>), ServerError> {
    let rest = text.get(offset..).unwrap_or_default();
    let end = statement_end(rest);
    let raw = &rest[..end.unwrap_or(rest.len())];

    let next = end.and_then(|e| {
        let after = offset + e + 1;
        let tail = &text[after..];
        if is_blank(tail) {
            None
        } else {
            Some(after + (tail.len() - tail.trim_start().len()))
        }
    });

    let mut descriptor = parse_statement(raw)?;
    descriptor.text = raw.trim().to_string();
    Ok((descriptor, next))
}

/// Parses a single statement with no separator handling.
pub fn parse_statement(raw: &str) -> Result<StatementDescriptor, ServerError> {
    let stripped = strip_comments(raw);
    let input = stripped.trim();
    if input.is_empty() {
        return Err(ServerError::EmptyQuery);
    }

    // Split into groups due to nom's 21-element tuple limit
    let result = alt((
        alt((
            dml::select,
            dml::insert,
            dml::update,
            dml::delete,
            dml::do_statement,
            dml::load_data,
        )),
        alt((
            ddl::create_table,
            ddl::drop_table,
            ddl::alter_table,
            ddl::rename_table,
            ddl::truncate,
            ddl::create_index,
            ddl::drop_index,
            ddl::create_database,
            ddl::drop_database,
            ddl::alter_database,
            ddl::create_user,
            ddl::drop_user,
            ddl::alter_user,
            ddl::grant,
        )),
        alt((
            transaction::begin_transaction,
            transaction::commit_transaction,
            transaction::rollback_transaction,
            transaction::savepoint,
            transaction::release_savepoint,
            transaction::xa,
            transaction::lock_tables,
            transaction::unlock_tables,
        )),
        alt((
            admin::unsupported,
            admin::set_statement,
            admin::use_database,
            admin::kill,
            admin::show,
            admin::flush,
            admin::shutdown,
            admin::handler,
        )),
    ))(input);

    match result {
        Ok((remaining, descriptor)) if remaining.trim().is_empty() => Ok(descriptor),
        Ok((remaining, _)) => Err(syntax_error(remaining)),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            // nom reports the last alternative tried; fall back to the
            // whole statement when that points at its very start
            let near = if e.input.len() < input.len() { e.input } else { input };
            Err(syntax_error(near))
        }
        Err(nom::Err::Incomplete(_)) => Err(syntax_error(input)),
    }
}

fn syntax_error(near: &str) -> ServerError {
    let near = near.trim_start();
    let excerpt: String = near.chars().take(NEAR_LIMIT).collect();
    ServerError::Parse(excerpt)
}

/// Byte offset of the first `;` outside quotes and comments.
fn statement_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'#' => i = skip_line(bytes, i),
            b'-' if is_dash_comment(bytes, i) => i = skip_line(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b';' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn is_dash_comment(bytes: &[u8], i: usize) -> bool {
    bytes.get(i + 1) == Some(&b'-')
        && bytes
            .get(i + 2)
            .is_none_or(|c| c.is_ascii_whitespace())
}

/// Index just past the closing quote (or the end of input).
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' && quote != b'`' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_line(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| start + p + 1)
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start + 2..]
        .windows(2)
        .position(|w| w == b"*/")
        .map_or(bytes.len(), |p| start + 2 + p + 2)
}

/// Removes comments outside quotes. The body of a `/*! ... */` executable
/// comment is kept, minus its optional version number.
fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut copied = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'#' => {
                out.push_str(&text[copied..i]);
                out.push(' ');
                i = skip_line(bytes, i);
                copied = i;
            }
            b'-' if is_dash_comment(bytes, i) => {
                out.push_str(&text[copied..i]);
                out.push(' ');
                i = skip_line(bytes, i);
                copied = i;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                out.push_str(&text[copied..i]);
                let end = skip_block_comment(bytes, i);
                if bytes.get(i + 2) == Some(&b'!') {
                    let body_end = if text[..end].ends_with("*/") { end - 2 } else { end };
                    let body = text[i + 3..body_end].trim_start_matches(|c: char| c.is_ascii_digit());
                    out.push(' ');
                    out.push_str(body);
                }
                out.push(' ');
                i = end;
                copied = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// Only whitespace, separators and comments.
fn is_blank(text: &str) -> bool {
    strip_comments(text)
        .chars()
        .all(|c| c.is_whitespace() || c == ';')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_statement() {
        let (stmt, next) = parse("SELECT 1", 0).unwrap();
        assert_eq!(stmt.kind, StatementKind::Select);
        assert_eq!(stmt.text, "SELECT 1");
        assert_eq!(next, None);
    }

    #[test]
    fn test_parse_walks_a_batch() {
        let text = "SELECT 1; INSERT INTO t VALUES (1);  UPDATE t SET a = 2";
        let (first, next) = parse(text, 0).unwrap();
        assert_eq!(first.kind, StatementKind::Select);
        let offset = next.unwrap();
        assert!(text[offset..].starts_with("INSERT"));
        let (second, next) = parse(text, offset).unwrap();
        assert_eq!(second.kind, StatementKind::Insert);
        let (third, next) = parse(text, next.unwrap()).unwrap();
        assert_eq!(third.kind, StatementKind::Update);
        assert_eq!(next, None);
    }

    #[test]
    fn test_trailing_separators_end_the_batch() {
        let (_, next) = parse("SELECT 1; ; -- done\n", 0).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_separator_inside_quotes_and_comments() {
        let text = "SELECT 'a;b' /* ; */ # ;\n; SELECT 2";
        let (stmt, next) = parse(text, 0).unwrap();
        let StatementParams::Select(p) = stmt.params else {
            panic!("expected select params");
        };
        assert_eq!(p.items[0].label, "a;b");
        assert!(text[next.unwrap()..].starts_with("SELECT 2"));
    }

    #[test]
    fn test_syntax_error_reports_near_text() {
        let err = parse("BAD SYNTAX", 0).unwrap_err();
        assert_eq!(err, ServerError::Parse("BAD SYNTAX".into()));
        let err = parse("SELECT 1 garbage here", 0).unwrap_err();
        assert!(matches!(err, ServerError::Parse(near) if near.starts_with("here")));
    }

    #[test]
    fn test_empty_statement() {
        assert_eq!(parse("   ", 0).unwrap_err(), ServerError::EmptyQuery);
        assert_eq!(parse("/* only */", 0).unwrap_err(), ServerError::EmptyQuery);
    }

    #[test]
    fn test_executable_comment_kept() {
        let stmt = parse_statement("/*!40101 SET NAMES utf8mb4 */").unwrap();
        assert_eq!(stmt.kind, StatementKind::SetOption);
    }

    #[test]
    fn test_unsupported_kinds_are_recognised() {
        assert_eq!(
            parse_statement("CALL p(1)").unwrap().kind,
            StatementKind::Call
        );
        assert_eq!(
            parse_statement("LOAD DATA INFILE 'x' INTO TABLE t").unwrap().kind,
            StatementKind::LoadData
        );
        assert_eq!(
            parse_statement("CHANGE MASTER TO MASTER_HOST='h'").unwrap().kind,
            StatementKind::ChangeMaster
        );
    }

    #[test]
    fn test_statement_kinds() {
        let cases = [
            ("CREATE TABLE t (a INT)", StatementKind::CreateTable),
            ("DROP DATABASE IF EXISTS d", StatementKind::DropDb),
            ("START TRANSACTION READ ONLY", StatementKind::Begin),
            ("ROLLBACK TO sp", StatementKind::RollbackToSavepoint),
            ("SET autocommit = 1", StatementKind::SetOption),
            ("USE shop", StatementKind::ChangeDb),
            ("KILL QUERY 4", StatementKind::Kill),
            ("FLUSH TABLES", StatementKind::Flush),
            ("HANDLER t OPEN", StatementKind::HaOpen),
            ("XA RECOVER", StatementKind::XaRecover),
            ("SHOW DATABASES", StatementKind::ShowDatabases),
            ("UNLOCK TABLES", StatementKind::UnlockTables),
            ("GRANT ALL ON shop.* TO bob", StatementKind::Grant),
            ("SHUTDOWN", StatementKind::Shutdown),
        ];
        for (text, kind) in cases {
            assert_eq!(parse_statement(text).unwrap().kind, kind, "{text}");
        }
    }
}
