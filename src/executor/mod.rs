/// Executor module - runs one parsed statement
///
/// Structure:
/// - dispatcher: handler table and the execute state machine (pre-checks,
///   handler call, statement/transaction end)
/// - queries: SELECT, DO, SHOW, HANDLER
/// - dml: INSERT/REPLACE/UPDATE/DELETE
/// - ddl: table and database DDL
/// - transaction: BEGIN/COMMIT/ROLLBACK, savepoints, XA, LOCK TABLES
/// - admin: USE, SET, accounts, KILL, FLUSH, SHUTDOWN
/// - system_functions: scalar evaluation needing session state
pub mod admin;
pub mod ddl;
pub mod dispatcher;
pub mod dml;
pub mod queries;
pub mod system_functions;
pub mod transaction;

pub use admin::AdminExecutor;
pub use ddl::DdlExecutor;
pub use dispatcher::{HandlerTable, StatementHandler, execute};
pub use dml::DmlExecutor;
pub use queries::QueryExecutor;
pub use system_functions::{ScalarScope, SystemFunctions};
pub use transaction::TransactionExecutor;

use crate::core::{ServerError, ServerInstance, Timeout};
use crate::engine::{ExecContext, ExecOutcome};
use crate::parser::{Expr, StatementDescriptor};
use crate::session::{Session, Warning};

/// Hands a statement to the engine session with a scalar evaluator over the
/// rest of the session.
pub(crate) fn run_engine(
    instance: &ServerInstance,
    session: &mut Session,
    stmt: &StatementDescriptor,
) -> Result<ExecOutcome, ServerError> {
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
        ..
    } = session;

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
        db: db.as_deref(),
        kill,
        lock_wait_timeout: lock_wait_timeout(vars),
        scalar: &scalar,
    };
    engine.execute(&ctx, stmt)
}

pub(crate) fn lock_wait_timeout(vars: &crate::session::VariableSet) -> Timeout {
    Timeout::from_seconds(vars.get_u32("lock_wait_timeout"))
}

/// Rolls back the whole transaction and notes what could not be undone.
pub(crate) fn rollback_transaction(session: &mut Session) {
    let report = session.engine.rollback_transaction();
    if report.unsafe_tables || session.tx.unsafe_rollback() {
        session.diagnostics.push(Warning::unsafe_rollback());
    }
    session.tx.end();
    session.mdl.release_transactional_locks();
}

/// Commits the normal transaction (COMMIT, implicit commit).
pub(crate) fn commit_transaction(session: &mut Session) -> Result<(), ServerError> {
    let result = session.engine.commit_transaction();
    session.tx.end();
    session.mdl.release_transactional_locks();
    result
}
