//! Command dispatcher: one decoded client command in, responses out.
//!
//! Every command goes through the same frame: reset the per-command state,
//! gate on an expired password, count it, run its handler, then finalize.
//! Finalizing lives in the `Drop` of [`CommandScope`] so it runs exactly
//! once however the handler left.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::core::{Privileges, ServerError, ServerInstance};
use crate::dispatch::access::{check_global_access, check_table_access};
use crate::engine::ExecOutcome;
use crate::executor::queries::like_match;
use crate::network::constants::{Command, refresh, set_option, status};
use crate::network::handshake::{ChangeUserRequest, split_query_attrs};
use crate::network::packet::{CommandEnvelope, get_null_str, get_u8, get_u16, get_u32};
use crate::network::prepared_statements::{
    decode_execute_params, substitute_parameters,
};
use crate::network::response::{Column, Response, ResultWriter};
use crate::parser::{
    self, FlushTarget, StatementDescriptor, StatementKind, StatementParams, TableRef,
};
use crate::session::Session;

use super::classify::Flags;
use super::orchestrator::{run_batch, run_statement};

/// What the connection loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

/// Commands a session with an expired password may still send.
const EXPIRED_PASSWORD_ALLOWED: [Command; 7] = [
    Command::Query,
    Command::QueryAttrs,
    Command::StmtClose,
    Command::StmtSendLongData,
    Command::Ping,
    Command::Quit,
    Command::ChangeUser,
];

/// Finalizes the command when dropped.
struct CommandScope<'s> {
    session: &'s mut Session,
    command: &'static str,
    started: Instant,
}

impl<'s> CommandScope<'s> {
    fn enter(session: &'s mut Session, command: &'static str) -> Self {
        session.set_command(command);
        Self {
            session,
            command,
            started: Instant::now(),
        }
    }
}

impl Deref for CommandScope<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for CommandScope<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for CommandScope<'_> {
    fn drop(&mut self) {
        let session = &mut *self.session;
        session.mdl.release_statement_locks();
        session.stmt.query.clear();
        session.stmt.started = None;
        session.conn.query_attrs.clear();
        session.finalized_commands += 1;
        session.set_command("Sleep");
        debug!(
            session = session.id,
            command = self.command,
            elapsed_us = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "command finished"
        );
    }
}

/// Rewrites result sets into the binary row format of prepared statements.
struct BinaryResults<'a> {
    inner: &'a mut dyn ResultWriter,
}

impl ResultWriter for BinaryResults<'_> {
    fn write(&mut self, mut response: Response) {
        if let Response::ResultSet { binary, .. } = &mut response {
            *binary = true;
        }
        self.inner.write(response);
    }
}

/// Routes commands to their handlers. Holds nothing but the runtime
/// context, so one dispatcher can serve every connection.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'a> {
    instance: &'a ServerInstance,
}

impl<'a> Dispatcher<'a> {
    #[must_use]
    pub const fn new(instance: &'a ServerInstance) -> Self {
        Self { instance }
    }

    /// Runs one command. Errors are answered on `out`; only QUIT, a
    /// connection kill, a SHUTDOWN or `... RELEASE` end the session.
    pub fn dispatch(
        &self,
        session: &mut Session,
        envelope: &CommandEnvelope,
        out: &mut dyn ResultWriter,
    ) -> Flow {
        let command = envelope.command();
        let name = command.map_or("Unknown", Command::name);
        let mut scope = CommandScope::enter(session, name);

        scope.diagnostics.reset();
        scope.stmt.status_extra &= !status::CLEAR_SET;
        scope.kill.reset_query();
        scope.refresh_user(self.instance);
        if scope.kill.is_connection_killed() {
            return Flow::Terminate;
        }

        let flags = self.instance.classification.command(envelope.code());
        if !flags.contains(Flags::SKIP_ACCOUNTING) {
            self.instance.status.questions.fetch_add(1, Ordering::Relaxed);
            scope.counters.questions += 1;
        }
        self.instance.status.count_command(envelope.code());

        let result = match command {
            Some(cmd)
                if scope.conn.user.password_expired && !EXPIRED_PASSWORD_ALLOWED.contains(&cmd) =>
            {
                Err(ServerError::MustChangePassword)
            }
            Some(cmd) => self.run_command(&mut scope, cmd, envelope.payload().clone(), out),
            None => Err(ServerError::UnknownCommand),
        };

        let flow = match result {
            Ok(flow) => flow,
            Err(e) => {
                debug!(session = scope.id, command = name, error = %e, "command failed");
                scope.send_error(out, &e);
                Flow::Continue
            }
        };
        if flow == Flow::Terminate
            || scope.take_release_request()
            || scope.kill.is_connection_killed()
        {
            Flow::Terminate
        } else {
            Flow::Continue
        }
    }

    fn run_command(
        &self,
        session: &mut Session,
        command: Command,
        payload: Bytes,
        out: &mut dyn ResultWriter,
    ) -> Result<Flow, ServerError> {
        let instance = self.instance;
        match command {
            Command::Quit => return Ok(Flow::Terminate),
            Command::Query => {
                let text = String::from_utf8_lossy(&payload);
                self.query(session, &text, out);
            }
            Command::QueryAttrs => {
                let (attrs, text) = split_query_attrs(payload)?;
                session.conn.query_attrs = attrs;
                let text = String::from_utf8_lossy(&text);
                self.query(session, &text, out);
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(&payload).into_owned();
                let text = format!("USE `{db}`");
                let stmt = descriptor(StatementKind::ChangeDb, StatementParams::UseDb(db), text);
                self.statement(session, &stmt, out);
            }
            Command::CreateDb | Command::DropDb => {
                let name = String::from_utf8_lossy(&payload).into_owned();
                let (kind, verb) = if command == Command::CreateDb {
                    (StatementKind::CreateDb, "CREATE")
                } else {
                    (StatementKind::DropDb, "DROP")
                };
                let text = format!("{verb} DATABASE `{name}`");
                let params = StatementParams::Database {
                    name,
                    if_flag: false,
                };
                self.statement(session, &descriptor(kind, params, text), out);
            }
            Command::Refresh => {
                let mut payload = payload;
                let options = u32::from(get_u8(&mut payload)?);
                let stmt = descriptor(
                    StatementKind::Flush,
                    StatementParams::Flush(refresh_targets(options)),
                    "FLUSH".to_string(),
                );
                self.statement(session, &stmt, out);
            }
            Command::ProcessInfo => {
                let stmt = descriptor(
                    StatementKind::ShowProcesslist,
                    StatementParams::Show {
                        global: false,
                        full: false,
                        from: None,
                        like: None,
                    },
                    "SHOW PROCESSLIST".to_string(),
                );
                self.statement(session, &stmt, out);
            }
            Command::ProcessKill => {
                let mut payload = payload;
                let id = get_u32(&mut payload)?;
                let stmt = descriptor(
                    StatementKind::Kill,
                    StatementParams::Kill {
                        id,
                        query_only: false,
                    },
                    format!("KILL {id}"),
                );
                self.statement(session, &stmt, out);
            }
            Command::Shutdown => {
                check_global_access(session, Privileges::SHUTDOWN)?;
                session.send_eof(out);
                instance.request_shutdown(Some(session.id()));
                return Ok(Flow::Terminate);
            }
            Command::Statistics => {
                let text = statistics(instance);
                if session.diagnostics.mark_sent() {
                    out.write(Response::Text(text));
                }
            }
            Command::Debug => {
                check_global_access(session, Privileges::SUPER)?;
                for handle in instance.registry.handles() {
                    info!(
                        id = handle.id,
                        info = ?handle.info(),
                        killed = ?handle.kill.state(),
                        "session dump"
                    );
                }
                info!(
                    sessions = instance.registry.len(),
                    timers = instance.timer.armed(),
                    "server dump"
                );
                session.send_eof(out);
            }
            Command::Ping => session.send_ok(out, &ExecOutcome::affected(0)),
            Command::ChangeUser => self.change_user(session, payload, out)?,
            Command::FieldList => self.field_list(session, payload, out)?,
            Command::StmtPrepare => self.stmt_prepare(session, &payload, out)?,
            Command::StmtExecute => self.stmt_execute(session, payload, out)?,
            Command::StmtSendLongData => stmt_send_long_data(session, payload),
            Command::StmtClose => {
                let mut payload = payload;
                if let Ok(id) = get_u32(&mut payload) {
                    session.prepared.remove_statement(id);
                }
            }
            Command::StmtReset => {
                let mut payload = payload;
                let id = get_u32(&mut payload)?;
                let stmt = session.prepared.get_statement_mut(id).ok_or_else(|| {
                    ServerError::UnknownStatementHandler {
                        id: id.to_string(),
                        command: "mysqld_stmt_reset".to_string(),
                    }
                })?;
                stmt.reset();
                session.send_ok(out, &ExecOutcome::affected(0));
            }
            Command::StmtFetch => {
                let mut payload = payload;
                let id = get_u32(&mut payload)?;
                return Err(ServerError::StmtHasNoOpenCursor(id));
            }
            Command::SetOption => {
                let mut payload = payload;
                match get_u16(&mut payload)? {
                    set_option::MULTI_STATEMENTS_ON => session.set_multi_statements(true),
                    set_option::MULTI_STATEMENTS_OFF => session.set_multi_statements(false),
                    _ => return Err(ServerError::UnknownCommand),
                }
                session.send_eof(out);
            }
            Command::ResetConnection => {
                session.reset_state(instance);
                session.send_ok(out, &ExecOutcome::affected(0));
            }
            Command::Sleep
            | Command::Connect
            | Command::Time
            | Command::DelayedInsert
            | Command::BinlogDump
            | Command::TableDump
            | Command::ConnectOut
            | Command::RegisterSlave
            | Command::Daemon
            | Command::BinlogDumpGtid => return Err(ServerError::UnknownCommand),
        }
        Ok(Flow::Continue)
    }

    fn query(&self, session: &mut Session, text: &str, out: &mut dyn ResultWriter) {
        if let Err(e) = run_batch(self.instance, session, text, out) {
            debug!(session = session.id(), error = %e, "batch stopped");
        }
    }

    /// A command that maps onto a statement runs through the same
    /// lifecycle as the statement itself.
    fn statement(&self, session: &mut Session, stmt: &StatementDescriptor, out: &mut dyn ResultWriter) {
        if let Err(e) = run_statement(self.instance, session, stmt, out) {
            debug!(session = session.id(), kind = stmt.kind.name(), error = %e, "command statement failed");
        }
    }

    fn change_user(
        &self,
        session: &mut Session,
        payload: Bytes,
        out: &mut dyn ResultWriter,
    ) -> Result<(), ServerError> {
        let request = ChangeUserRequest::parse(payload, session.capabilities())?;
        let user = self.instance.users.authenticate(
            &request.username,
            &session.conn.scramble,
            &request.auth_response,
            session.host(),
        )?;
        if let Some(db) = &request.database {
            if !user.has_any_on_db(db) {
                return Err(ServerError::DbAccessDenied {
                    user: user.username,
                    host: session.host().to_string(),
                    db: db.clone(),
                });
            }
            if !self.instance.engine.database_exists(db) {
                return Err(ServerError::UnknownDatabase(db.clone()));
            }
        }
        info!(session = session.id(), from = %session.user().username, to = %user.username, "change user");
        session.change_user(self.instance, user, request.database);
        session.send_ok(out, &ExecOutcome::affected(0));
        Ok(())
    }

    /// COM_FIELD_LIST: column definitions of one table, optionally
    /// filtered by a LIKE pattern.
    fn field_list(
        &self,
        session: &mut Session,
        payload: Bytes,
        out: &mut dyn ResultWriter,
    ) -> Result<(), ServerError> {
        let mut payload = payload;
        let table = get_null_str(&mut payload);
        let wildcard = String::from_utf8_lossy(&payload).into_owned();
        if table.is_empty() {
            return Err(ServerError::NoTablesUsed);
        }
        let db = session
            .db()
            .ok_or(ServerError::NoDatabaseSelected)?
            .to_string();
        check_table_access(
            session,
            Privileges::SELECT,
            &[TableRef::new(Some(db.clone()), table.clone())],
        )?;
        let columns = self
            .instance
            .engine
            .columns(&db, &table)?
            .into_iter()
            .filter(|c| wildcard.is_empty() || like_match(c, &wildcard))
            .map(|c| Column::of_table(&db, &table, c))
            .collect();
        if session.diagnostics.mark_sent() {
            out.write(Response::FieldList {
                columns,
                status: session.status(),
            });
        }
        Ok(())
    }

    fn stmt_prepare(
        &self,
        session: &mut Session,
        payload: &Bytes,
        out: &mut dyn ResultWriter,
    ) -> Result<(), ServerError> {
        let query = String::from_utf8_lossy(payload).trim().to_string();
        let prepared = session.prepared.add_statement(query);
        let (id, params) = (prepared.id, prepared.param_count);
        let trial = substitute_parameters(&prepared.query, &vec![None; usize::from(params)]);
        match parser::parse(&trial, 0) {
            Ok((_, None)) => {}
            Ok((_, Some(next))) => {
                session.prepared.remove_statement(id);
                return Err(ServerError::Parse(trial[next..].chars().take(80).collect()));
            }
            Err(e) => {
                session.prepared.remove_statement(id);
                return Err(e);
            }
        }
        if session.diagnostics.mark_sent() {
            out.write(Response::Prepared {
                statement_id: id,
                params,
                warnings: 0,
            });
        }
        Ok(())
    }

    fn stmt_execute(
        &self,
        session: &mut Session,
        payload: Bytes,
        out: &mut dyn ResultWriter,
    ) -> Result<(), ServerError> {
        let mut payload = payload;
        let id = get_u32(&mut payload)?;
        let _cursor_flags = get_u8(&mut payload)?;
        let _iterations = get_u32(&mut payload)?;

        let prepared = session.prepared.get_statement_mut(id).ok_or_else(|| {
            ServerError::UnknownStatementHandler {
                id: id.to_string(),
                command: "mysqld_stmt_execute".to_string(),
            }
        })?;
        let params = decode_execute_params(&mut payload, prepared)?;
        let text = substitute_parameters(&prepared.query, &params);
        prepared.reset();

        let mut stmt = parser::parse_statement(&text)?;
        stmt.text = text;
        let mut binary = BinaryResults { inner: out };
        if let Err(e) = run_statement(self.instance, session, &stmt, &mut binary) {
            debug!(session = session.id(), statement = id, error = %e, "prepared statement failed");
        }
        Ok(())
    }
}

fn descriptor(kind: StatementKind, params: StatementParams, text: String) -> StatementDescriptor {
    let mut stmt = StatementDescriptor::new(kind, Vec::new(), params);
    stmt.text = text;
    stmt
}

/// COM_REFRESH option bits to FLUSH targets.
fn refresh_targets(options: u32) -> Vec<FlushTarget> {
    [
        (refresh::GRANT, FlushTarget::Privileges),
        (refresh::LOG, FlushTarget::Logs),
        (refresh::TABLES, FlushTarget::Tables),
        (refresh::STATUS, FlushTarget::Status),
    ]
    .into_iter()
    .filter(|(bit, _)| options & bit != 0)
    .map(|(_, target)| target)
    .collect()
}

/// Appends a chunk to a parameter. Never answered, even on error.
fn stmt_send_long_data(session: &mut Session, payload: Bytes) {
    let mut payload = payload;
    let (Ok(id), Ok(param)) = (get_u32(&mut payload), get_u16(&mut payload)) else {
        warn!(session = session.id(), "malformed COM_STMT_SEND_LONG_DATA");
        return;
    };
    match session.prepared.get_statement_mut(id) {
        Some(stmt) if param < stmt.param_count => {
            stmt.long_data.entry(param).or_default().extend_from_slice(&payload);
        }
        _ => debug!(session = session.id(), statement = id, param, "long data for unknown parameter"),
    }
}

/// COM_STATISTICS text.
fn statistics(instance: &ServerInstance) -> String {
    let uptime = instance.uptime().as_secs();
    let questions = instance.status.questions.load(Ordering::Relaxed);
    let qps = if uptime == 0 {
        0.0
    } else {
        questions as f64 / uptime as f64
    };
    format!(
        "Uptime: {uptime}  Threads: {}  Questions: {questions}  Slow queries: {}  Opens: 0  Flush tables: 0  Open tables: 0  Queries per second avg: {qps:.3}",
        instance.registry.len(),
        instance.status.slow_queries.load(Ordering::Relaxed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ServerConfig, scramble_password};
    use crate::network::constants::capability;
    use crate::network::response::ResponseBuffer;
    use bytes::{BufMut, BytesMut};

    fn session(instance: &ServerInstance) -> Session {
        let mut s = instance
            .open_session(
                instance.users.get("root").unwrap(),
                "localhost",
                capability::SERVER_DEFAULT,
            )
            .unwrap();
        s.set_db(Some("test".to_string()));
        s
    }

    fn send(
        instance: &ServerInstance,
        s: &mut Session,
        command: Command,
        payload: &[u8],
    ) -> (Flow, Vec<Response>) {
        let mut out = ResponseBuffer::new();
        let envelope = CommandEnvelope::from_command(command, payload.to_vec());
        let flow = Dispatcher::new(instance).dispatch(s, &envelope, &mut out);
        (flow, out.take())
    }

    #[test]
    fn test_finalize_runs_once_per_command() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        send(&instance, &mut s, Command::Query, b"SELECT 1");
        send(&instance, &mut s, Command::Query, b"SELEC 1");
        send(&instance, &mut s, Command::Sleep, b"");
        send(&instance, &mut s, Command::ProcessKill, b"\x01");
        send(&instance, &mut s, Command::StmtClose, b"\x07\x00\x00\x00");
        assert_eq!(s.finalized_commands(), 5);
    }

    #[test]
    fn test_empty_packet_is_sleep() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let mut out = ResponseBuffer::new();
        let envelope = CommandEnvelope::from_packet(Bytes::new());
        let flow = Dispatcher::new(&instance).dispatch(&mut s, &envelope, &mut out);
        let (sleep_flow, sleep) = send(&instance, &mut s, Command::Sleep, b"");
        assert_eq!(flow, Flow::Continue);
        assert_eq!(flow, sleep_flow);
        assert_eq!(out.take(), sleep);
        assert_eq!(sleep[0].error_code(), Some(ServerError::UnknownCommand.code()));
    }

    #[test]
    fn test_short_kill_packet_is_statement_error() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let (flow, responses) = send(&instance, &mut s, Command::ProcessKill, b"\x01\x00");
        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            responses[0].error_code(),
            Some(ServerError::MalformedPacket.code())
        );
    }

    #[test]
    fn test_quit_and_release_terminate() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let (flow, responses) = send(&instance, &mut s, Command::Quit, b"");
        assert_eq!(flow, Flow::Terminate);
        assert!(responses.is_empty());

        let mut s = session(&instance);
        let (flow, responses) = send(&instance, &mut s, Command::Query, b"COMMIT RELEASE");
        assert_eq!(flow, Flow::Terminate);
        assert!(responses[0].is_ok());
    }

    #[test]
    fn test_questions_skip_ping() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        send(&instance, &mut s, Command::Ping, b"");
        assert_eq!(s.counters().questions, 0);
        send(&instance, &mut s, Command::Query, b"SELECT 1; SELECT 2");
        assert_eq!(s.counters().questions, 2);
    }

    #[test]
    fn test_expired_password_allow_list() {
        let instance = ServerInstance::new(ServerConfig::default());
        instance.users.create_user("old", "pw", Privileges::NONE).unwrap();
        instance.users.grant("old", Privileges::SELECT, Some("test")).unwrap();
        instance.users.expire_password("old").unwrap();
        let mut s = instance
            .open_session(instance.users.get("old").unwrap(), "localhost", 0)
            .unwrap();

        let (_, responses) = send(&instance, &mut s, Command::InitDb, b"test");
        assert_eq!(
            responses[0].error_code(),
            Some(ServerError::MustChangePassword.code())
        );
        let (_, responses) = send(&instance, &mut s, Command::Ping, b"");
        assert!(responses[0].is_ok());
        let (_, responses) = send(&instance, &mut s, Command::Query, b"SET PASSWORD = 'fresh'");
        assert!(responses[0].is_ok());
        let (_, responses) = send(&instance, &mut s, Command::InitDb, b"test");
        assert!(responses[0].is_ok());
    }

    #[test]
    fn test_set_option_toggles_multi_statements() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let (_, responses) = send(&instance, &mut s, Command::SetOption, &[1, 0]);
        assert!(matches!(responses[0], Response::Eof { .. }));
        assert!(!s.multi_statements());
        let (_, responses) = send(&instance, &mut s, Command::Query, b"SELECT 1; SELECT 2");
        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_error());
    }

    #[test]
    fn test_prepared_statement_round() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        send(&instance, &mut s, Command::Query, b"CREATE TABLE t1 (a, b)");
        let (_, responses) = send(&instance, &mut s, Command::StmtPrepare, b"INSERT INTO t1 VALUES (?, ?)");
        let Response::Prepared { statement_id, params, .. } = responses[0] else {
            panic!("expected prepare OK, got {:?}", responses[0]);
        };
        assert_eq!(params, 2);

        let mut p = BytesMut::new();
        p.put_u32_le(statement_id);
        p.put_u8(0);
        p.put_u32_le(1);
        p.put_u8(0b0000_0010); // second parameter NULL
        p.put_u8(1);
        p.put_u16_le(u16::from(crate::network::constants::column_type::LONGLONG));
        p.put_u16_le(u16::from(crate::network::constants::column_type::VAR_STRING));
        p.put_u64_le(42);
        let (_, responses) = send(&instance, &mut s, Command::StmtExecute, &p);
        assert!(responses[0].is_ok(), "{responses:?}");

        let (_, responses) = send(&instance, &mut s, Command::StmtPrepare, b"SELECT * FROM t1 WHERE a = ?");
        let Response::Prepared { statement_id, .. } = responses[0] else {
            panic!("expected prepare OK");
        };
        let mut p = BytesMut::new();
        p.put_u32_le(statement_id);
        p.put_u8(0);
        p.put_u32_le(1);
        p.put_u8(0);
        p.put_u8(1);
        p.put_u16_le(u16::from(crate::network::constants::column_type::LONGLONG));
        p.put_u64_le(42);
        let (_, responses) = send(&instance, &mut s, Command::StmtExecute, &p);
        match &responses[0] {
            Response::ResultSet { result, binary, .. } => {
                assert!(*binary);
                assert_eq!(result.row_count(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        let (_, responses) = send(&instance, &mut s, Command::StmtFetch, &statement_id.to_le_bytes());
        assert_eq!(
            responses[0].error_code(),
            Some(ServerError::StmtHasNoOpenCursor(statement_id).code())
        );
    }

    #[test]
    fn test_prepare_rejects_bad_syntax() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let (_, responses) = send(&instance, &mut s, Command::StmtPrepare, b"SELEKT ?");
        assert!(responses[0].is_error());
        assert!(s.prepared.is_empty());
    }

    #[test]
    fn test_change_user() {
        let instance = ServerInstance::new(ServerConfig::default());
        instance.users.create_user("eve", "pw", Privileges::NONE).unwrap();
        instance.users.grant("eve", Privileges::SELECT, Some("test")).unwrap();
        let mut s = session(&instance);
        let scramble = [7u8; 20];
        s.set_scramble(&scramble);
        send(&instance, &mut s, Command::Query, b"SET @x = 1");

        let token = scramble_password(&scramble, "pw");
        let mut p = BytesMut::new();
        p.put_slice(b"eve\0");
        p.put_u8(u8::try_from(token.len()).unwrap());
        p.put_slice(&token);
        p.put_slice(b"test\0");
        let (_, responses) = send(&instance, &mut s, Command::ChangeUser, &p);
        assert!(responses[0].is_ok(), "{responses:?}");
        assert_eq!(s.user().username, "eve");
        assert_eq!(s.db(), Some("test"));
        assert!(s.user_variable("x").is_none());

        let mut p = BytesMut::new();
        p.put_slice(b"eve\0");
        p.put_u8(1);
        p.put_u8(0);
        p.put_slice(b"\0");
        let (_, responses) = send(&instance, &mut s, Command::ChangeUser, &p);
        assert!(responses[0].is_error());
    }

    #[test]
    fn test_field_list_and_statistics() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        send(&instance, &mut s, Command::Query, b"CREATE TABLE t1 (id, name, note)");
        let (_, responses) = send(&instance, &mut s, Command::FieldList, b"t1\0n%");
        match &responses[0] {
            Response::FieldList { columns, .. } => {
                let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
                assert_eq!(names, ["name", "note"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let (_, responses) = send(&instance, &mut s, Command::Statistics, b"");
        assert!(matches!(&responses[0], Response::Text(t) if t.starts_with("Uptime:")));
    }

    #[test]
    fn test_shutdown_command() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = session(&instance);
        let other = session(&instance);
        let (flow, responses) = send(&instance, &mut s, Command::Shutdown, &[0]);
        assert_eq!(flow, Flow::Terminate);
        assert!(matches!(responses[0], Response::Eof { .. }));
        assert!(instance.is_shutting_down());
        assert!(other.kill_token().is_connection_killed());
        assert!(!s.kill_token().is_killed());
    }

    #[test]
    fn test_refresh_targets() {
        assert_eq!(
            refresh_targets(refresh::TABLES | refresh::STATUS),
            vec![FlushTarget::Tables, FlushTarget::Status]
        );
        assert!(refresh_targets(refresh::HOSTS).is_empty());
    }
}
