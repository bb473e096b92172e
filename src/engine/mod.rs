//! Storage / transaction collaborator.
//!
//! The execution core only talks to the traits below. `MemoryEngine` is
//! the in-process implementation the server ships with.

mod locks;
mod memory;

pub use memory::MemoryEngine;

use crate::core::{ServerError, Timeout, Value};
use crate::network::response::ResultSet;
use crate::parser::{Expr, HandlerRead, StatementDescriptor, TableRef};
use crate::session::{KillToken, Warning};

/// Evaluates expressions that need session state (`@@var`, `SLEEP`,
/// `CONNECTION_ID()`); the engine only resolves columns and literals.
pub type ScalarEval<'a> = dyn Fn(&Expr) -> Result<Value, ServerError> + 'a;

/// Per-call view of the session handed to the engine.
pub struct ExecContext<'a> {
    pub session_id: u32,
    /// Session default database.
    pub db: Option<&'a str>,
    pub kill: &'a KillToken,
    pub lock_wait_timeout: Timeout,
    pub scalar: &'a ScalarEval<'a>,
}

impl ExecContext<'_> {
    /// Database a table reference resolves to.
    pub fn resolve_db<'t>(&'t self, table: &'t TableRef) -> Result<&'t str, ServerError> {
        table
            .db
            .as_deref()
            .or(self.db)
            .ok_or(ServerError::NoDatabaseSelected)
    }
}

/// What a statement produced.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub affected: u64,
    pub last_insert_id: u64,
    pub examined: u64,
    pub result: Option<ResultSet>,
    /// Text of the OK packet's info field, e.g. "Rows matched: 2  Changed: 1".
    pub info: Option<String>,
    pub warnings: Vec<Warning>,
}

impl ExecOutcome {
    #[must_use]
    pub fn affected(rows: u64) -> Self {
        Self {
            affected: rows,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn rows(result: ResultSet, examined: u64) -> Self {
        Self {
            examined,
            result: Some(result),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// What a rollback could not undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackReport {
    /// Non-transactional tables were changed and keep their changes.
    pub unsafe_tables: bool,
}

/// Shared catalog and session factory.
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    fn databases(&self) -> Vec<String>;

    fn database_exists(&self, db: &str) -> bool;

    /// Base tables of `db`, sorted.
    fn tables(&self, db: &str) -> Result<Vec<String>, ServerError>;

    fn table_exists(&self, db: &str, table: &str) -> bool;

    fn columns(&self, db: &str, table: &str) -> Result<Vec<String>, ServerError>;

    fn open_session(&self, session_id: u32) -> Box<dyn EngineSession>;
}

/// Per-connection engine state: undo, data locks, temporary tables.
pub trait EngineSession: Send {
    /// BEGIN / START TRANSACTION.
    fn begin(&mut self) -> Result<(), ServerError>;

    fn commit_statement(&mut self) -> Result<(), ServerError>;

    fn rollback_statement(&mut self) -> RollbackReport;

    /// Ends the normal transaction and drops its data locks.
    fn commit_transaction(&mut self) -> Result<(), ServerError>;

    fn rollback_transaction(&mut self) -> RollbackReport;

    fn savepoint(&mut self, name: &str) -> Result<(), ServerError>;

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<RollbackReport, ServerError>;

    fn release_savepoint(&mut self, name: &str) -> Result<(), ServerError>;

    /// True once if the engine decided the whole transaction must roll
    /// back (deadlock victim).
    fn take_rollback_request(&mut self) -> bool;

    /// Open transaction with undo or data locks.
    fn in_transaction(&self) -> bool;

    fn is_temporary(&self, db: &str, table: &str) -> bool;

    fn temporary_tables(&self) -> Vec<(String, String)>;

    fn execute(
        &mut self,
        ctx: &ExecContext<'_>,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError>;

    /// One row of `HANDLER t READ`; `position` is the handler cursor.
    fn handler_read(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        read: HandlerRead,
        position: &mut usize,
    ) -> Result<ResultSet, ServerError>;

    /// Connection end: roll back and drop temporary tables.
    fn close(&mut self);
}
