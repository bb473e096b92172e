//! Runs the SQL text of one COM_QUERY: splits it into statements, executes
//! them in order and keeps the per-statement accounting.
//!
//! The batch stops at the first failing statement. A kill that lands
//! between two statements is noticed before the next one starts.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::logging::{GENERAL_LOG_TARGET, SLOW_LOG_TARGET};
use crate::core::{ErrorClass, ServerError, ServerInstance};
use crate::engine::ExecOutcome;
use crate::executor;
use crate::network::constants::status;
use crate::network::response::{ResponseBuffer, ResultWriter};
use crate::parser::{self, StatementDescriptor, StatementKind};
use crate::session::Session;

use super::accounting::SlowLogRecord;
use super::classify::Flags;

/// Longest statement excerpt shown in the process list.
const PROCESS_INFO_LIMIT: usize = 1024;

const REDACTED: &str = "'<secret>'";

/// Executes every statement of `text`. Responses go to `out`, one final
/// response per executed statement plus one error if the batch failed.
pub fn run_batch(
    instance: &ServerInstance,
    session: &mut Session,
    text: &str,
    out: &mut dyn ResultWriter,
) -> Result<(), ServerError> {
    let buffer = trim_batch(text);
    if buffer.is_empty() {
        session.diagnostics.reset();
        session.send_ok(out, &ExecOutcome::affected(0));
        return Ok(());
    }

    let mut offset = 0;
    let mut first = true;
    let result = loop {
        if !first {
            instance.status.questions.fetch_add(1, Ordering::Relaxed);
            session.counters.questions += 1;
        }
        first = false;

        if let Err(e) = session.kill.check() {
            session.diagnostics.reset();
            session.send_error(out, &e);
            break Err(e);
        }

        let (stmt, next) = match parser::parse(buffer, offset) {
            Ok(parsed) => parsed,
            Err(e) => {
                session.diagnostics.reset();
                session.stmt.status_extra &= !status::MORE_RESULTS_EXISTS;
                session.send_error(out, &e);
                break Err(e);
            }
        };

        if let Some(next) = next {
            if !session.multi_statements() {
                let e = ServerError::Parse(buffer[next..].chars().take(80).collect());
                session.diagnostics.reset();
                session.send_error(out, &e);
                break Err(e);
            }
            session.stmt.status_extra |= status::MORE_RESULTS_EXISTS;
        } else {
            session.stmt.status_extra &= !status::MORE_RESULTS_EXISTS;
        }

        if let Err(e) = run_statement(instance, session, &stmt, out) {
            break Err(e);
        }
        match next {
            Some(n) => offset = n,
            None => break Ok(()),
        }
    };
    session.stmt.status_extra &= !status::MORE_RESULTS_EXISTS;
    result
}

/// One parsed statement through the executor, with logging, the statement
/// timer and accounting around it. Shared with COM_STMT_EXECUTE.
pub fn run_statement(
    instance: &ServerInstance,
    session: &mut Session,
    stmt: &StatementDescriptor,
    out: &mut dyn ResultWriter,
) -> Result<(), ServerError> {
    let flags = instance.classification.statement(stmt.kind);
    if flags.contains(Flags::DIAGNOSTIC_STATEMENT) {
        session.diagnostics.clear_status();
    } else {
        session.diagnostics.reset();
    }
    session.stmt.status_extra &= !status::QUERY_WAS_SLOW;

    let logged = redact_credentials(stmt);
    begin_statement(instance, session, &logged);

    let timer = if stmt.is_plain_select() {
        match session.vars.get_u64("max_execution_time") {
            0 => None,
            ms => Some(instance.timer.arm(Duration::from_millis(ms), &session.kill)),
        }
    } else {
        None
    };

    let started = Instant::now();
    let mut held = ResponseBuffer::new();
    let result = executor::execute(instance, session, stmt, &mut held);
    let elapsed = started.elapsed();
    drop(timer);

    let slow = account_statement(instance, session, stmt, flags, &logged, elapsed, &result);
    for mut response in held.take() {
        if slow {
            response.add_status(status::QUERY_WAS_SLOW);
        }
        out.write(response);
    }
    session.set_process_info("", None);
    result
}

fn begin_statement(instance: &ServerInstance, session: &mut Session, logged: &str) {
    session.stmt.query = logged.to_string();
    session.stmt.query_id = instance.status.queries.fetch_add(1, Ordering::Relaxed) + 1;
    session.stmt.started = Some(Instant::now());
    session.stmt.rows_sent = 0;
    session.stmt.rows_examined = 0;

    let excerpt: String = logged.chars().take(PROCESS_INFO_LIMIT).collect();
    session.set_process_info("executing", Some(&excerpt));

    if instance.global_flag("general_log") {
        info!(
            target: GENERAL_LOG_TARGET,
            session = session.id(),
            user = %session.user().username,
            db = session.db().unwrap_or(""),
            query = %logged,
            "Query"
        );
    }
}

/// Counters, latency and the slow log. Returns whether the statement was
/// slow.
fn account_statement(
    instance: &ServerInstance,
    session: &mut Session,
    stmt: &StatementDescriptor,
    flags: Flags,
    logged: &str,
    elapsed: Duration,
    result: &Result<(), ServerError>,
) -> bool {
    instance.status.count_statement(stmt.kind);
    session.counters.statements[stmt.kind.index()] += 1;
    instance.status.record_latency(stmt.kind, elapsed);
    if result.is_ok() && flags.contains(Flags::CAN_GENERATE_CHANGE_EVENTS) {
        instance.status.change_events.fetch_add(1, Ordering::Relaxed);
    }

    let interrupted = result
        .as_ref()
        .err()
        .is_some_and(|e| e.class() == ErrorClass::Interrupted);
    let long_query_time = Duration::try_from_secs_f64(session.vars.get_f64("long_query_time"))
        .unwrap_or(Duration::MAX);
    let slow = elapsed >= long_query_time
        && session.stmt.rows_examined >= session.vars.get_u64("min_examined_row_limit")
        && (!interrupted || instance.config.logging.log_slow_interrupted);
    debug!(
        session = session.id(),
        kind = stmt.kind.name(),
        elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        ok = result.is_ok(),
        "statement finished"
    );
    if !slow {
        return false;
    }

    session.stmt.status_extra |= status::QUERY_WAS_SLOW;
    session.counters.slow_queries += 1;
    instance.status.slow_queries.fetch_add(1, Ordering::Relaxed);
    if instance.global_flag("slow_query_log") {
        let record = SlowLogRecord {
            session_id: session.id(),
            user: &session.conn.user.username,
            host: &session.conn.host,
            db: session.db.as_deref(),
            query_time_secs: elapsed.as_secs_f64(),
            rows_sent: session.stmt.rows_sent,
            rows_examined: session.stmt.rows_examined,
            interrupted,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            query: logged,
        };
        match serde_json::to_string(&record) {
            Ok(json) => info!(target: SLOW_LOG_TARGET, "{json}"),
            Err(e) => debug!(error = %e, "slow log record not serialised"),
        }
    }
    true
}

/// Drops surrounding whitespace and trailing separators.
fn trim_batch(text: &str) -> &str {
    text.trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Statement text safe for the general and slow logs: password literals
/// of account statements are replaced.
#[must_use]
pub fn redact_credentials(stmt: &StatementDescriptor) -> String {
    let markers: &[&str] = match stmt.kind {
        StatementKind::CreateUser | StatementKind::AlterUser => &["IDENTIFIED BY"],
        StatementKind::SetPassword => &["="],
        _ => return stmt.text.clone(),
    };
    let mut text = stmt.text.clone();
    for marker in markers {
        text = redact_after(&text, marker);
    }
    text
}

/// Replaces the first quoted literal following each `marker`.
fn redact_after(text: &str, marker: &str) -> String {
    let upper = text.to_ascii_uppercase();
    let mut result = String::with_capacity(text.len());
    let mut copied = 0;
    let mut search = 0;
    while let Some(found) = upper[search..].find(marker) {
        let after = search + found + marker.len();
        let Some((start, end)) = next_literal(text, after) else {
            break;
        };
        result.push_str(&text[copied..start]);
        result.push_str(REDACTED);
        copied = end;
        search = end;
    }
    result.push_str(&text[copied..]);
    result
}

/// Byte range of the next `'...'` or `"..."` literal at or after `from`.
fn next_literal(text: &str, from: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let start = from + bytes[from..].iter().position(|b| *b == b'\'' || *b == b'"')?;
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => {
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return Some((start, i + 1));
                }
            }
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServerConfig;
    use crate::network::response::Response;
    use crate::parser::parse_statement;
    use crate::session::KillState;

    fn session(instance: &ServerInstance) -> Session {
        let mut s = instance
            .open_session(instance.users.get("root").unwrap(), "localhost", 0)
            .unwrap();
        s.set_db(Some("test".to_string()));
        s.set_multi_statements(true);
        s
    }

    fn parsed(sql: &str) -> StatementDescriptor {
        let mut stmt = parse_statement(sql).unwrap();
        stmt.text = sql.to_string();
        stmt
    }

    #[test]
    fn test_batch_stops_at_parse_error() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let mut out = ResponseBuffer::new();
        let result = run_batch(&instance, &mut s, "SELECT 1; BAD SYNTAX; SELECT 2", &mut out);
        assert!(matches!(result, Err(ServerError::Parse(_))));

        let responses = out.take();
        assert_eq!(responses.len(), 2);
        assert!(responses[0].result_set().is_some());
        assert_ne!(responses[0].status().unwrap() & status::MORE_RESULTS_EXISTS, 0);
        assert!(responses[1].is_error());
        assert_eq!(instance.status.statement_count(StatementKind::Select), 1);
    }

    #[test]
    fn test_empty_batch_is_ok() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let mut out = ResponseBuffer::new();
        run_batch(&instance, &mut s, "  ;; \n", &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.last().unwrap().is_ok());
    }

    #[test]
    fn test_multi_statements_need_the_capability() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        s.set_multi_statements(false);
        let mut out = ResponseBuffer::new();
        let result = run_batch(&instance, &mut s, "SELECT 1; SELECT 2", &mut out);
        assert!(matches!(result, Err(ServerError::Parse(_))));
        assert_eq!(out.len(), 1);

        // a trailing separator alone is fine
        run_batch(&instance, &mut s, "SELECT 1;", &mut out).unwrap();
    }

    #[test]
    fn test_last_statement_clears_more_results() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let mut out = ResponseBuffer::new();
        run_batch(&instance, &mut s, "DO 1; DO 2", &mut out).unwrap();
        let responses = out.take();
        assert_eq!(responses.len(), 2);
        assert_ne!(responses[0].status().unwrap() & status::MORE_RESULTS_EXISTS, 0);
        assert_eq!(responses[1].status().unwrap() & status::MORE_RESULTS_EXISTS, 0);
        assert_eq!(s.counters().questions, 1);
    }

    #[test]
    fn test_kill_before_statement_reports_interrupted() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        s.kill_token().kill(KillState::QueryKilled);
        let mut out = ResponseBuffer::new();
        let result = run_batch(&instance, &mut s, "SELECT 1", &mut out);
        assert_eq!(result, Err(ServerError::QueryInterrupted));
        assert_eq!(out.len(), 1);
    }

    /// Marks the session killed once the first response is out.
    struct KillAfterFirstResponse {
        kill: crate::session::KillToken,
        sent: ResponseBuffer,
    }

    impl ResultWriter for KillAfterFirstResponse {
        fn write(&mut self, response: Response) {
            self.sent.write(response);
            self.kill.kill(KillState::QueryKilled);
        }
    }

    #[test]
    fn test_kill_between_statements_stops_batch() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        run_batch(&instance, &mut s, "CREATE TABLE t1 (a)", &mut ResponseBuffer::new()).unwrap();

        let mut out = KillAfterFirstResponse {
            kill: s.kill_token().clone(),
            sent: ResponseBuffer::new(),
        };
        let result = run_batch(
            &instance,
            &mut s,
            "INSERT INTO t1 VALUES (1); INSERT INTO t1 VALUES (2); INSERT INTO t1 VALUES (3)",
            &mut out,
        );
        assert_eq!(result, Err(ServerError::QueryInterrupted));
        let codes: Vec<_> = out.sent.take().iter().map(Response::error_code).collect();
        assert_eq!(codes, [None, Some(ServerError::QueryInterrupted.code())]);

        let mut other = session(&instance);
        let mut out = ResponseBuffer::new();
        run_batch(&instance, &mut other, "SELECT * FROM t1", &mut out).unwrap();
        assert_eq!(out.last().and_then(Response::result_set).map(|rs| rs.row_count()), Some(1));
    }

    #[test]
    fn test_slow_statement_flagged() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let mut out = ResponseBuffer::new();
        run_batch(&instance, &mut s, "SET long_query_time = 0", &mut out).unwrap();
        out.take();
        run_batch(&instance, &mut s, "SELECT 1", &mut out).unwrap();
        let flags = out.last().and_then(Response::status).unwrap();
        assert_ne!(flags & status::QUERY_WAS_SLOW, 0);
        assert!(s.counters().slow_queries >= 1);
    }

    #[test]
    fn test_statement_timer_only_for_plain_select() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let mut out = ResponseBuffer::new();
        run_batch(&instance, &mut s, "SET max_execution_time = 50", &mut out).unwrap();
        let result = run_batch(&instance, &mut s, "SELECT SLEEP(5)", &mut out);
        assert_eq!(result, Err(ServerError::QueryTimeout));
        assert_eq!(instance.timer.armed(), 0);
    }

    #[test]
    fn test_redact_credentials() {
        let create = parsed("CREATE USER 'bob' IDENTIFIED BY 's3cret'");
        assert_eq!(
            redact_credentials(&create),
            "CREATE USER 'bob' IDENTIFIED BY '<secret>'"
        );
        let set = parsed("SET PASSWORD FOR 'bob' = 'it''s'");
        assert_eq!(redact_credentials(&set), "SET PASSWORD FOR 'bob' = '<secret>'");
        let select = parsed("SELECT 'IDENTIFIED BY x'");
        assert_eq!(redact_credentials(&select), "SELECT 'IDENTIFIED BY x'");
    }

    #[test]
    fn test_trim_batch() {
        assert_eq!(trim_batch("  SELECT 1 ;; \n"), "SELECT 1");
        assert_eq!(trim_batch(";"), "");
    }
}
