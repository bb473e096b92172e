/// Read-only statements
///
/// SELECT (with or without a table), DO, the SHOW family and the HANDLER
/// cursor statements. Table reads go to the engine; everything that only
/// looks at server or session state is answered here.
use crate::core::{Privileges, ServerError, ServerInstance, Value};
use crate::dispatch::access::{check_db_access, check_table_access};
use crate::engine::{ExecContext, ExecOutcome};
use crate::network::response::{Column, ResultSet};
use crate::parser::{Expr, HandlerRead, StatementDescriptor, StatementKind, StatementParams};
use crate::session::variables::VARIABLES;
use crate::session::{Level, OpenHandler, Session};
use crate::transaction::{MdlDuration, MdlKey, MdlMode};

use super::{ScalarScope, lock_wait_timeout, run_engine};

/// Longest `Info` shown by SHOW PROCESSLIST without FULL.
const PROCESSLIST_INFO_LIMIT: usize = 100;

pub struct QueryExecutor;

impl QueryExecutor {
    pub fn select(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        if !stmt.tables.is_empty() {
            check_table_access(session, Privileges::SELECT, &stmt.tables)?;
            return run_engine(instance, session, stmt);
        }

        let params = stmt
            .select_params()
            .ok_or_else(|| ServerError::Internal("SELECT without select list".to_string()))?;
        let scope = ScalarScope::of(instance, session);
        let mut result = ResultSet::new(
            params
                .items
                .iter()
                .map(|item| Column::new(item.label.clone()))
                .collect(),
        );
        let mut row = Vec::with_capacity(params.items.len());
        for item in &params.items {
            row.push(scope.eval(&item.expr)?.to_text_cell());
        }
        // a WHERE without a table can only compare against nothing
        if params.filter.is_none() && params.limit != Some(0) {
            result.push_row(row);
        }
        Ok(ExecOutcome::rows(result, 0))
    }

    pub fn do_statement(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::Do(exprs) = &stmt.params else {
            return Err(ServerError::Internal("DO without expressions".to_string()));
        };
        let scope = ScalarScope::of(instance, session);
        for expr in exprs {
            scope.eval(expr)?;
        }
        Ok(ExecOutcome::affected(0))
    }

    pub fn show_databases(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let (_, _, _, like) = show_params(stmt);
        let mut result = ResultSet::with_column_names(&["Database"]);
        for db in instance.engine.databases() {
            if !session.user().has_any_on_db(&db) {
                continue;
            }
            if like.is_some_and(|p| !like_match(&db, p)) {
                continue;
            }
            result.push_row(vec![Some(db)]);
        }
        let examined = result.row_count() as u64;
        Ok(ExecOutcome::rows(result, examined))
    }

    pub fn show_tables(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let (_, full, from, like) = show_params(stmt);
        let db = from
            .or(session.db())
            .ok_or(ServerError::NoDatabaseSelected)?
            .to_string();
        check_db_access(session, &db)?;
        if !instance.engine.database_exists(&db) {
            return Err(ServerError::UnknownDatabase(db));
        }

        let name_column = format!("Tables_in_{db}");
        let mut result = if full {
            ResultSet::with_column_names(&[name_column.as_str(), "Table_type"])
        } else {
            ResultSet::with_column_names(&[name_column.as_str()])
        };
        for table in instance.engine.tables(&db)? {
            if like.is_some_and(|p| !like_match(&table, p)) {
                continue;
            }
            let mut row = vec![Some(table)];
            if full {
                row.push(Some("BASE TABLE".to_string()));
            }
            result.push_row(row);
        }
        let examined = result.row_count() as u64;
        Ok(ExecOutcome::rows(result, examined))
    }

    /// Without PROCESS only the user's own sessions are listed.
    pub fn show_processlist(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let (_, full, _, _) = show_params(stmt);
        let see_all = session
            .user()
            .global_privileges
            .contains(Privileges::PROCESS);
        let mut result = ResultSet::with_column_names(&[
            "Id", "User", "Host", "db", "Command", "Time", "State", "Info",
        ]);
        for handle in instance.registry.handles() {
            let Some(info) = handle.info() else {
                continue;
            };
            if !see_all && info.user != session.user().username {
                continue;
            }
            let text = info.info.map(|q| {
                if full || q.chars().count() <= PROCESSLIST_INFO_LIMIT {
                    q
                } else {
                    q.chars().take(PROCESSLIST_INFO_LIMIT).collect()
                }
            });
            let command = if handle.kill.is_connection_killed() {
                "Killed"
            } else {
                info.command
            };
            result.push_row(vec![
                Some(handle.id.to_string()),
                Some(info.user),
                Some(info.host),
                info.db,
                Some(command.to_string()),
                Some(info.since.elapsed().as_secs().to_string()),
                Some(info.state.to_string()),
                text,
            ]);
        }
        let examined = result.row_count() as u64;
        Ok(ExecOutcome::rows(result, examined))
    }

    pub fn show_status(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let (global, _, _, like) = show_params(stmt);
        let mut rows: Vec<(String, String)> = if global {
            let mut rows: Vec<(String, String)> = instance
                .status
                .snapshot()
                .into_iter()
                .map(|(name, value)| (name, value.to_string()))
                .collect();
            rows.push((
                "Threads_connected".to_string(),
                instance.registry.len().to_string(),
            ));
            rows.push((
                "Threads_running".to_string(),
                instance.registry.running().to_string(),
            ));
            rows.push((
                "Uptime".to_string(),
                instance.uptime().as_secs().to_string(),
            ));
            rows
        } else {
            let counters = session.counters();
            let mut rows = vec![
                ("Questions".to_string(), counters.questions.to_string()),
                ("Slow_queries".to_string(), counters.slow_queries.to_string()),
            ];
            for kind in StatementKind::ALL {
                let count = counters.statements.get(kind.index()).copied().unwrap_or(0);
                rows.push((format!("Com_{}", kind.name()), count.to_string()));
            }
            rows
        };
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut result = ResultSet::with_column_names(&["Variable_name", "Value"]);
        for (name, value) in rows {
            if like.is_some_and(|p| !like_match(&name, p)) {
                continue;
            }
            result.push_row(vec![Some(name), Some(value)]);
        }
        Ok(ExecOutcome::rows(result, 0))
    }

    pub fn show_variables(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let (global, _, _, like) = show_params(stmt);
        let globals = instance.global_variables();
        let scope = ScalarScope::of(instance, session);

        let mut result = ResultSet::with_column_names(&["Variable_name", "Value"]);
        for def in VARIABLES {
            if like.is_some_and(|p| !like_match(def.name, p)) {
                continue;
            }
            let value = if global {
                globals.get(def.name).cloned().unwrap_or(Value::Null)
            } else {
                scope.eval(&Expr::SystemVariable {
                    global: false,
                    name: def.name.to_string(),
                })?
            };
            result.push_row(vec![Some(def.name.to_string()), Some(def.display(&value))]);
        }
        Ok(ExecOutcome::rows(result, 0))
    }

    /// SHOW WARNINGS / SHOW ERRORS: the conditions the previous statement
    /// left in the diagnostics area.
    pub fn show_diagnostics(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let errors_only = stmt.kind == StatementKind::ShowErrors;
        let mut result = ResultSet::with_column_names(&["Level", "Code", "Message"]);
        for w in session.diagnostics().warnings() {
            if errors_only && w.level != Level::Error {
                continue;
            }
            result.push_row(vec![
                Some(w.level.name().to_string()),
                Some(w.code.to_string()),
                Some(w.message.clone()),
            ]);
        }
        Ok(ExecOutcome::rows(result, 0))
    }

    pub fn handler_open(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let table = first_table(stmt)?;
        check_table_access(session, Privileges::SELECT, std::slice::from_ref(table))?;
        let db = table
            .db
            .clone()
            .or_else(|| session.db.clone())
            .ok_or(ServerError::NoDatabaseSelected)?;
        if !session.engine.is_temporary(&db, &table.name)
            && !instance.engine.table_exists(&db, &table.name)
        {
            return Err(ServerError::NoSuchTable {
                db,
                table: table.name.clone(),
            });
        }

        let alias = table.name.to_lowercase();
        if let Some(previous) = session.handlers.remove(&alias) {
            session
                .mdl
                .release_explicit(&MdlKey::table(&previous.db, &previous.table));
        }
        let timeout = lock_wait_timeout(&session.vars);
        session.mdl.acquire(
            MdlKey::table(&db, &table.name),
            MdlMode::Shared,
            MdlDuration::Explicit,
            timeout,
            &session.kill,
        )?;
        session.handlers.insert(
            alias,
            OpenHandler {
                db,
                table: table.name.clone(),
                position: 0,
            },
        );
        Ok(ExecOutcome::affected(0))
    }

    pub fn handler_read(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let table = first_table(stmt)?;
        let read = match &stmt.params {
            StatementParams::HandlerRead(read) => *read,
            _ => HandlerRead::Next,
        };

        let Session {
            id,
            kill,
            conn,
            db,
            tx,
            stmt: current,
            vars,
            user_vars,
            engine,
            handlers,
            ..
        } = session;
        let handler = handlers
            .get_mut(&table.name.to_lowercase())
            .ok_or_else(|| ServerError::UnknownHandlerTable(table.name.clone()))?;

        let scope = ScalarScope {
            instance,
            session_id: *id,
            kill,
            user: &conn.user,
            host: &conn.host,
            db: db.as_deref(),
            tx,
            stmt: current,
            vars,
            user_vars,
        };
        let scalar = |expr: &Expr| scope.eval(expr);
        let ctx = ExecContext {
            session_id: *id,
            db: Some(handler.db.as_str()),
            kill,
            lock_wait_timeout: lock_wait_timeout(vars),
            scalar: &scalar,
        };
        let target = crate::parser::TableRef::new(Some(handler.db.clone()), handler.table.clone());
        let result = engine.handler_read(&ctx, &target, read, &mut handler.position)?;
        let examined = result.row_count() as u64;
        Ok(ExecOutcome::rows(result, examined))
    }

    pub fn handler_close(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let table = first_table(stmt)?;
        let handler = session
            .handlers
            .remove(&table.name.to_lowercase())
            .ok_or_else(|| ServerError::UnknownHandlerTable(table.name.clone()))?;
        session
            .mdl
            .release_explicit(&MdlKey::table(&handler.db, &handler.table));
        Ok(ExecOutcome::affected(0))
    }
}

fn first_table(stmt: &StatementDescriptor) -> Result<&crate::parser::TableRef, ServerError> {
    stmt.tables
        .first()
        .ok_or_else(|| ServerError::Internal(format!("{} without a table", stmt.kind.name())))
}

/// (global, full, from, like) of a SHOW statement.
fn show_params(stmt: &StatementDescriptor) -> (bool, bool, Option<&str>, Option<&str>) {
    match &stmt.params {
        StatementParams::Show {
            global,
            full,
            from,
            like,
        } => (*global, *full, from.as_deref(), like.as_deref()),
        _ => (false, false, None, None),
    }
}

/// SQL LIKE, case-insensitive: `%` matches any run, `_` one character,
/// `\` escapes the next one.
pub(crate) fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();

    let (mut t, mut p) = (0, 0);
    // last `%` seen and the text position it is currently matched up to
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some('\\') if pattern.get(p + 1) == Some(&text[t]) => {
                p += 2;
                t += 1;
                continue;
            }
            Some('_') => {
                p += 1;
                t += 1;
                continue;
            }
            Some(c) if *c != '\\' && *c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, matched)) => {
                p = star + 1;
                t = matched + 1;
                backtrack = Some((star, matched + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServerConfig;
    use crate::executor::execute;
    use crate::network::response::{ResponseBuffer, Response};
    use crate::parser::parse_statement;

    fn setup() -> (ServerInstance, Session) {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut session = instance
            .open_session(instance.users.get("root").unwrap(), "localhost", 0)
            .unwrap();
        session.set_db(Some("test".to_string()));
        (instance, session)
    }

    fn query(instance: &ServerInstance, session: &mut Session, sql: &str) -> ResultSet {
        let stmt = parse_statement(sql).unwrap();
        let mut out = ResponseBuffer::new();
        session.diagnostics.reset();
        execute(instance, session, &stmt, &mut out).unwrap();
        match out.take().pop() {
            Some(Response::ResultSet { result, .. }) => result,
            other => panic!("expected a result set, got {other:?}"),
        }
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("autocommit", "auto%"));
        assert!(like_match("Com_select", "com\\_sel%"));
        assert!(like_match("abc", "a_c"));
        assert!(like_match("abc", "%"));
        assert!(!like_match("abc", "a_"));
        assert!(!like_match("comXselect", "com\\_%"));
        assert!(like_match("transaction_read_only", "%read%only"));
    }

    #[test]
    fn test_select_without_table() {
        let (instance, mut s) = setup();
        let rs = query(&instance, &mut s, "SELECT 1 AS one, @@autocommit, DATABASE()");
        assert_eq!(rs.row_count(), 1);
        assert_eq!(rs.cell(0, "one"), Some("1"));
        assert_eq!(rs.cell(0, "DATABASE()"), Some("test"));
    }

    #[test]
    fn test_show_variables_like() {
        let (instance, mut s) = setup();
        let rs = query(&instance, &mut s, "SHOW VARIABLES LIKE 'autocommit'");
        assert_eq!(rs.row_count(), 1);
        assert_eq!(rs.cell(0, "Value"), Some("ON"));
    }

    #[test]
    fn test_show_tables_and_databases() {
        let (instance, mut s) = setup();
        let stmt = parse_statement("CREATE TABLE t1 (a)").unwrap();
        execute(&instance, &mut s, &stmt, &mut ResponseBuffer::new()).unwrap();

        let rs = query(&instance, &mut s, "SHOW TABLES");
        assert_eq!(rs.cell(0, "Tables_in_test"), Some("t1"));
        let rs = query(&instance, &mut s, "SHOW DATABASES LIKE 'te%'");
        assert_eq!(rs.row_count(), 1);
    }

    #[test]
    fn test_show_warnings_reads_previous_statement() {
        let (instance, mut s) = setup();
        let stmt = parse_statement("DROP TABLE IF EXISTS nope").unwrap();
        execute(&instance, &mut s, &stmt, &mut ResponseBuffer::new()).unwrap();

        let stmt = parse_statement("SHOW WARNINGS").unwrap();
        let mut out = ResponseBuffer::new();
        s.diagnostics.clear_status();
        execute(&instance, &mut s, &stmt, &mut out).unwrap();
        let rs = out.last().and_then(Response::result_set).unwrap();
        assert_eq!(rs.row_count(), 1);
        assert_eq!(rs.cell(0, "Code"), Some("1051"));
    }

    #[test]
    fn test_processlist_hides_other_users_without_process() {
        let instance = ServerInstance::new(ServerConfig::default());
        instance.users.create_user("app", "", Privileges::DB_ALL).unwrap();
        let _root = instance
            .open_session(instance.users.get("root").unwrap(), "localhost", 0)
            .unwrap();
        let mut app = instance
            .open_session(instance.users.get("app").unwrap(), "localhost", 0)
            .unwrap();
        let rs = query(&instance, &mut app, "SHOW PROCESSLIST");
        assert_eq!(rs.row_count(), 1);
        assert_eq!(rs.cell(0, "User"), Some("app"));
    }

    #[test]
    fn test_handler_cursor_walks_rows() {
        let (instance, mut s) = setup();
        for sql in ["CREATE TABLE t1 (a)", "INSERT INTO t1 VALUES (1), (2)", "HANDLER t1 OPEN"] {
            let stmt = parse_statement(sql).unwrap();
            execute(&instance, &mut s, &stmt, &mut ResponseBuffer::new()).unwrap();
        }
        let first = query(&instance, &mut s, "HANDLER t1 READ FIRST");
        assert_eq!(first.cell(0, "a"), Some("1"));
        let next = query(&instance, &mut s, "HANDLER t1 READ NEXT");
        assert_eq!(next.cell(0, "a"), Some("2"));
        let end = query(&instance, &mut s, "HANDLER t1 READ NEXT");
        assert_eq!(end.row_count(), 0);

        let stmt = parse_statement("HANDLER t1 CLOSE").unwrap();
        execute(&instance, &mut s, &stmt, &mut ResponseBuffer::new()).unwrap();
        assert!(s.mdl().is_empty());
    }
}
