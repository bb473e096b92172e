//! Execute state machine for one parsed statement.
//!
//! `execute` runs the cross-cutting pre-checks, calls the handler for the
//! statement kind through `HandlerTable`, then ends the statement
//! transaction and decides what happens to the normal transaction and the
//! metadata locks. Exactly one response is written per call.

use tracing::debug;

use super::{
    AdminExecutor, DdlExecutor, DmlExecutor, QueryExecutor, TransactionExecutor,
    commit_transaction, lock_wait_timeout, rollback_transaction,
};
use crate::core::{DbReadOnly, ServerError, ServerInstance, ThrottleKind};
use crate::dispatch::admission::Permit;
use crate::dispatch::classify::Flags;
use crate::engine::ExecOutcome;
use crate::network::response::ResultWriter;
use crate::parser::{StatementDescriptor, StatementKind, StatementParams, TableLockType};
use crate::session::{Session, Warning};
use crate::transaction::{MdlDuration, MdlKey, MdlMode};

/// Entry point of one statement kind.
pub type StatementHandler =
    fn(&ServerInstance, &mut Session, &StatementDescriptor) -> Result<ExecOutcome, ServerError>;

/// Handlers indexed by statement kind.
pub struct HandlerTable {
    handlers: [StatementHandler; StatementKind::COUNT],
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.handlers.len())
            .finish()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: StatementKind::ALL.map(handler_for),
        }
    }

    #[must_use]
    pub const fn get(&self, kind: StatementKind) -> StatementHandler {
        self.handlers[kind.index()]
    }
}

fn handler_for(kind: StatementKind) -> StatementHandler {
    use StatementKind as K;
    match kind {
        K::Select => QueryExecutor::select,
        K::Do => QueryExecutor::do_statement,
        K::ShowDatabases => QueryExecutor::show_databases,
        K::ShowTables => QueryExecutor::show_tables,
        K::ShowProcesslist => QueryExecutor::show_processlist,
        K::ShowStatus => QueryExecutor::show_status,
        K::ShowVariables => QueryExecutor::show_variables,
        K::ShowWarnings | K::ShowErrors => QueryExecutor::show_diagnostics,
        K::HaOpen => QueryExecutor::handler_open,
        K::HaRead => QueryExecutor::handler_read,
        K::HaClose => QueryExecutor::handler_close,
        K::Insert | K::Replace | K::Update | K::Delete => DmlExecutor::execute,
        K::CreateTable
        | K::DropTable
        | K::AlterTable
        | K::RenameTable
        | K::Truncate
        | K::CreateIndex
        | K::DropIndex => DdlExecutor::table_ddl,
        K::CreateDb | K::DropDb => DdlExecutor::database_ddl,
        K::AlterDb => DdlExecutor::alter_database,
        K::Begin => TransactionExecutor::begin,
        K::Commit => TransactionExecutor::commit,
        K::Rollback => TransactionExecutor::rollback,
        K::Savepoint => TransactionExecutor::savepoint,
        K::RollbackToSavepoint => TransactionExecutor::rollback_to_savepoint,
        K::ReleaseSavepoint => TransactionExecutor::release_savepoint,
        K::LockTables => TransactionExecutor::lock_tables,
        K::UnlockTables => TransactionExecutor::unlock_tables,
        K::XaStart
        | K::XaEnd
        | K::XaPrepare
        | K::XaCommit
        | K::XaRollback
        | K::XaRecover => TransactionExecutor::xa,
        K::ChangeDb => AdminExecutor::use_database,
        K::SetOption => AdminExecutor::set_variables,
        K::SetTransaction => AdminExecutor::set_transaction,
        K::SetPassword => AdminExecutor::set_password,
        K::CreateUser | K::DropUser | K::AlterUser => AdminExecutor::account,
        K::Grant | K::Revoke => AdminExecutor::grant,
        K::Kill => AdminExecutor::kill,
        K::Flush => AdminExecutor::flush,
        K::Shutdown => AdminExecutor::shutdown,
        K::CreateProcedure
        | K::DropProcedure
        | K::Call
        | K::StartSlave
        | K::StopSlave
        | K::ChangeMaster
        | K::LoadData => AdminExecutor::unsupported,
    }
}

/// A table reference with its database resolved.
#[derive(Debug, Clone)]
struct Resolved {
    db: Option<String>,
    name: String,
    temporary: bool,
}

/// Tables of the statement as the pre-checks see them.
#[derive(Debug, Default)]
struct StatementTables {
    tables: Vec<Resolved>,
    /// Non-empty and every table is a temporary table of this session.
    all_temporary: bool,
}

impl StatementTables {
    fn resolve(session: &Session, stmt: &StatementDescriptor, must_resolve: bool) -> Result<Self, ServerError> {
        let mut tables = Vec::with_capacity(stmt.tables.len());
        for t in &stmt.tables {
            let db = t.db.clone().or_else(|| session.db.clone());
            let temporary = t.temporary
                || db
                    .as_deref()
                    .is_some_and(|db| session.engine.is_temporary(db, &t.name));
            if must_resolve && db.is_none() {
                return Err(ServerError::NoDatabaseSelected);
            }
            tables.push(Resolved {
                db,
                name: t.name.clone(),
                temporary,
            });
        }
        let all_temporary = !tables.is_empty() && tables.iter().all(|t| t.temporary);
        Ok(Self {
            tables,
            all_temporary,
        })
    }

    fn persistent(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables
            .iter()
            .filter(|t| !t.temporary)
            .filter_map(|t| t.db.as_deref().map(|db| (db, t.name.as_str())))
    }
}

/// CREATE/DROP TEMPORARY TABLE neither commits nor needs a boundary.
fn is_temporary_ddl(stmt: &StatementDescriptor) -> bool {
    matches!(stmt.kind, StatementKind::CreateTable | StatementKind::DropTable)
        && !stmt.tables.is_empty()
        && stmt.tables.iter().all(|t| t.temporary)
}

/// Database named by CREATE/DROP/ALTER DATABASE, if any.
fn target_database<'a>(session: &'a Session, stmt: &'a StatementDescriptor) -> Option<&'a str> {
    match &stmt.params {
        StatementParams::Database { name, .. } => Some(name.as_str()),
        StatementParams::AlterDatabase { name, .. } => name.as_deref().or(session.db()),
        _ => None,
    }
}

/// Runs one statement and writes its response.
pub fn execute(
    instance: &ServerInstance,
    session: &mut Session,
    stmt: &StatementDescriptor,
    out: &mut dyn ResultWriter,
) -> Result<(), ServerError> {
    let flags = instance.classification.statement(stmt.kind);
    session.tx.begin_statement();

    let result = match prepare(instance, session, stmt, flags) {
        Ok(permit) => {
            let handler = instance.handlers.get(stmt.kind);
            let result = handler(instance, session, stmt)
                .and_then(|outcome| session.kill.check().map(|()| outcome));
            drop(permit);
            finish(session, stmt, flags, result)
        }
        Err(e) => {
            refuse(session);
            Err(e)
        }
    };
    session.tx.end_statement();

    match result {
        Ok(mut outcome) => {
            session.stmt.rows_examined += outcome.examined;
            if outcome.result.is_some() {
                session.stmt.row_count = -1;
            } else {
                session.stmt.row_count = i64::try_from(outcome.affected).unwrap_or(i64::MAX);
            }
            if outcome.last_insert_id != 0 {
                session.stmt.last_insert_id = outcome.last_insert_id;
            }
            session.diagnostics.extend(outcome.warnings.drain(..));
            session.send_outcome(out, outcome);
            Ok(())
        }
        Err(e) => {
            session.stmt.row_count = -1;
            debug!(session = session.id, code = e.code(), error = %e, "statement failed");
            session.send_error(out, &e);
            Err(e)
        }
    }
}

/// Pre-checks. Every refusal comes before the implicit commit, so an error
/// leaves only diagnostics behind. The returned permit holds the admission
/// slot.
fn prepare(
    instance: &ServerInstance,
    session: &mut Session,
    stmt: &StatementDescriptor,
    flags: Flags,
) -> Result<Option<Permit>, ServerError> {
    use StatementKind as K;

    if session.conn.user.password_expired
        && !matches!(stmt.kind, K::SetPassword | K::AlterUser)
    {
        return Err(ServerError::MustChangePassword);
    }

    let tables = StatementTables::resolve(
        session,
        stmt,
        flags.contains(Flags::PREOPEN_TEMP_TABLES),
    )?;
    let temporary_ddl = is_temporary_ddl(stmt);

    if flags.contains(Flags::DISALLOWED_IN_READONLY_TXN)
        && session.tx.is_read_only()
        && !tables.all_temporary
    {
        return Err(ServerError::ReadOnlyTransaction);
    }

    let implicit_commit = flags.contains(Flags::AUTO_COMMIT_BOUNDARY) && !temporary_ddl;
    if implicit_commit {
        session.tx.xa().ensure_closed()?;
    }

    if flags.contains(Flags::CHANGES_DATA) && !tables.all_temporary {
        check_read_only(instance, session, stmt, &tables)?;
    }

    if let Some(locked) = &session.locked_tables {
        if !matches!(stmt.kind, K::LockTables | K::UnlockTables) {
            for (db, name) in tables.persistent() {
                let entry = locked
                    .iter()
                    .find(|l| l.db.eq_ignore_ascii_case(db) && l.table.eq_ignore_ascii_case(name));
                match entry {
                    None => return Err(ServerError::TableNotLocked(name.to_string())),
                    Some(l) if l.lock == TableLockType::Read && flags.contains(Flags::CHANGES_DATA) => {
                        return Err(ServerError::TableNotLockedForWrite(name.to_string()));
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let permit = if session.is_super() {
        None
    } else if flags.contains(Flags::CHANGES_DATA) && !temporary_ddl {
        Some(instance.admission.try_admit(ThrottleKind::Write)?)
    } else if matches!(stmt.kind, K::Select | K::HaRead) {
        Some(instance.admission.try_admit(ThrottleKind::Read)?)
    } else {
        None
    };

    if implicit_commit {
        if session.tx.is_explicit() || session.engine.in_transaction() {
            debug!(session = session.id, kind = stmt.kind.name(), "implicit commit");
        }
        commit_transaction(session)?;
    }

    if flags.contains(Flags::CLOSE_OPEN_HANDLES_FIRST) {
        close_handlers(session, stmt, &tables);
    }

    if session.locked_tables.is_none() {
        acquire_metadata_locks(session, stmt, flags, &tables)?;
    }

    Ok(permit)
}

/// Global `read_only`/`super_read_only`, then per-database levels.
fn check_read_only(
    instance: &ServerInstance,
    session: &Session,
    stmt: &StatementDescriptor,
    tables: &StatementTables,
) -> Result<(), ServerError> {
    let (read_only, super_read_only) = instance.read_only_mode();
    if super_read_only {
        return Err(ServerError::OptionPreventsStatement("--super-read-only".into()));
    }
    if read_only && !session.is_super() {
        return Err(ServerError::OptionPreventsStatement("--read-only".into()));
    }

    // ALTER DATABASE must stay possible, it is how the level is lowered
    if stmt.kind == StatementKind::AlterDb {
        return Ok(());
    }
    let databases = tables
        .persistent()
        .map(|(db, _)| db)
        .chain(target_database(session, stmt));
    for db in databases {
        match instance.db_read_only(db) {
            DbReadOnly::SuperReadOnly => return Err(ServerError::DatabaseReadOnly(db.to_string())),
            DbReadOnly::ReadOnly if !session.is_super() => {
                return Err(ServerError::DatabaseReadOnly(db.to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Closes HANDLER cursors on tables (or the database) the DDL touches.
fn close_handlers(session: &mut Session, stmt: &StatementDescriptor, tables: &StatementTables) {
    let dropped_db = match (&stmt.kind, &stmt.params) {
        (StatementKind::DropDb, StatementParams::Database { name, .. }) => Some(name.to_lowercase()),
        _ => None,
    };
    let doomed: Vec<String> = session
        .handlers
        .iter()
        .filter(|(_, h)| {
            dropped_db.as_deref().is_some_and(|db| h.db.eq_ignore_ascii_case(db))
                || tables.tables.iter().any(|t| {
                    t.name.eq_ignore_ascii_case(&h.table)
                        && t.db.as_deref().is_some_and(|db| db.eq_ignore_ascii_case(&h.db))
                })
        })
        .map(|(alias, _)| alias.clone())
        .collect();
    for alias in doomed {
        if let Some(h) = session.handlers.remove(&alias) {
            session.mdl.release_explicit(&MdlKey::table(&h.db, &h.table));
            debug!(session = session.id, table = %h.table, "handler closed before DDL");
        }
    }
}

fn acquire_metadata_locks(
    session: &mut Session,
    stmt: &StatementDescriptor,
    flags: Flags,
    tables: &StatementTables,
) -> Result<(), ServerError> {
    use StatementKind as K;

    if matches!(
        stmt.kind,
        K::LockTables | K::UnlockTables | K::HaOpen | K::HaRead | K::HaClose
    ) {
        return Ok(());
    }

    let mode = if flags.contains(Flags::AUTO_COMMIT_BOUNDARY | Flags::CHANGES_DATA) {
        MdlMode::Exclusive
    } else if flags.contains(Flags::CHANGES_DATA) {
        MdlMode::SharedWrite
    } else {
        MdlMode::Shared
    };
    let timeout = lock_wait_timeout(&session.vars);

    let mut keys: Vec<MdlKey> = tables
        .persistent()
        .map(|(db, name)| MdlKey::table(db, name))
        .collect();
    if matches!(stmt.kind, K::CreateDb | K::DropDb | K::AlterDb) {
        if let Some(db) = target_database(session, stmt) {
            keys.push(MdlKey::schema(db));
        }
    }
    for key in keys {
        session
            .mdl
            .acquire(key, mode, MdlDuration::Transaction, timeout, &session.kill)?;
    }
    Ok(())
}

/// A statement refused before its handler ran: only its statement
/// transaction and the locks taken for it are dropped. An open normal
/// transaction, its access mode and XA state stay as they were.
fn refuse(session: &mut Session) {
    session.engine.rollback_statement();
    session.force_rollback = false;
    if session.tx.in_multi_statement_mode() {
        session.mdl.release_statement_locks();
    } else {
        session.mdl.release_transactional_locks();
    }
}

/// Post-checks: statement transaction, then the normal transaction and the
/// metadata locks. An engine rollback request always wins over the
/// statement's own outcome.
fn finish(
    session: &mut Session,
    stmt: &StatementDescriptor,
    flags: Flags,
    mut result: Result<ExecOutcome, ServerError>,
) -> Result<ExecOutcome, ServerError> {
    if result.is_err() || session.force_rollback {
        let report = session.engine.rollback_statement();
        if report.unsafe_tables {
            session.tx.mark_unsafe_rollback();
            session.diagnostics.push(Warning::unsafe_rollback());
        }
    } else if let Err(e) = session.engine.commit_statement() {
        session.engine.rollback_statement();
        result = Err(e);
    }
    session.force_rollback = false;

    if session.engine.take_rollback_request() {
        debug!(session = session.id, "engine requested transaction rollback");
        rollback_transaction(session);
    } else if flags.contains(Flags::AUTO_COMMIT_BOUNDARY) && !is_temporary_ddl(stmt) {
        let committed = commit_transaction(session);
        if let (Ok(_), Err(e)) = (&result, committed) {
            result = Err(e);
        }
    } else if !session.tx.in_multi_statement_mode() {
        if result.is_ok() {
            if let Err(e) = session.engine.commit_transaction() {
                rollback_transaction(session);
                return Err(e);
            }
        } else {
            session.engine.rollback_transaction();
        }
        session.mdl.release_transactional_locks();
    } else {
        session.mdl.release_statement_locks();
    }
    result
}
