//! Per-connection state.
//!
//! A `Session` owns everything one connection needs between commands. Its
//! state is split into sub-states (connection, transaction, statement) so
//! the dispatcher and the executor can borrow them independently. The only
//! thing other sessions may touch is the kill token, through the registry.

pub mod diagnostics;
pub mod kill;
pub mod registry;
pub mod variables;

pub use diagnostics::{DiagnosticsArea, Level, Warning};
pub use kill::{KillState, KillToken};
pub use registry::{ProcessInfo, Registration, SessionHandle, SessionRegistry};
pub use variables::{VarDef, VariableSet};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use crate::core::{Privileges, ServerError, ServerInstance, User, Value};
use crate::engine::{EngineSession, ExecOutcome};
use crate::network::prepared_statements::PreparedStatementCache;
use crate::network::response::{OkPacket, ResultSet, ResultWriter};
use crate::parser::{StatementKind, TableLockType};
use crate::transaction::{MdlContext, TransactionState};

/// Who is connected and what the client negotiated.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Account as of the start of the current command.
    pub user: User,
    pub host: String,
    pub capabilities: u32,
    /// COM_SET_OPTION can flip this after the handshake.
    pub multi_statements: bool,
    /// Salt sent in the handshake; COM_CHANGE_USER verifies against it.
    pub scramble: Vec<u8>,
    /// Attributes of the current COM_QUERY_ATTRS command.
    pub query_attrs: Vec<(String, String)>,
}

/// Bookkeeping of the statement currently running.
#[derive(Debug, Clone, Default)]
pub struct StatementState {
    pub query: String,
    pub query_id: u64,
    pub started: Option<Instant>,
    pub rows_sent: u64,
    pub rows_examined: u64,
    /// ROW_COUNT(): affected rows of the last DML, -1 after a result set.
    pub row_count: i64,
    pub last_insert_id: u64,
    /// Status bits raised by the current command on top of the
    /// transaction bits (MORE_RESULTS_EXISTS, QUERY_WAS_SLOW, ...).
    pub status_extra: u16,
}

/// An open `HANDLER t` cursor.
#[derive(Debug, Clone)]
pub struct OpenHandler {
    pub db: String,
    pub table: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedTable {
    pub db: String,
    pub table: String,
    pub lock: TableLockType,
}

#[derive(Debug, Clone, Default)]
pub struct SessionCounters {
    pub questions: u64,
    pub slow_queries: u64,
    /// Com_xxx, indexed by statement kind.
    pub statements: Vec<u64>,
}

pub struct Session {
    pub(crate) id: u32,
    pub(crate) kill: KillToken,
    pub(crate) conn: ConnectionState,
    pub(crate) db: Option<String>,
    pub(crate) tx: TransactionState,
    pub(crate) stmt: StatementState,
    pub(crate) vars: VariableSet,
    pub(crate) user_vars: HashMap<String, Value>,
    pub(crate) diagnostics: DiagnosticsArea,
    pub(crate) engine: Box<dyn EngineSession>,
    pub(crate) mdl: MdlContext,
    pub(crate) prepared: PreparedStatementCache,
    /// Keyed by lower-case table name.
    pub(crate) handlers: BTreeMap<String, OpenHandler>,
    /// `Some` while in LOCK TABLES mode.
    pub(crate) locked_tables: Option<Vec<LockedTable>>,
    pub(crate) counters: SessionCounters,
    pub(crate) info: Arc<Mutex<ProcessInfo>>,
    /// Roll the statement back even if it succeeded.
    pub(crate) force_rollback: bool,
    /// COMMIT/ROLLBACK ... RELEASE: close the connection after the reply.
    pub(crate) release_requested: bool,
    /// Commands that went through the finalize step.
    pub(crate) finalized_commands: u64,
    pub(crate) _registration: Registration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.conn.user.username)
            .field("db", &self.db)
            .field("tx", &self.tx)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a session for an authenticated account and registers it.
    pub fn new(
        instance: &ServerInstance,
        id: u32,
        user: User,
        host: &str,
        capabilities: u32,
    ) -> Result<Self, ServerError> {
        let kill = KillToken::new();
        let info = Arc::new(Mutex::new(ProcessInfo::new(&user.username, host)));
        let registration = Registration::new(
            Arc::clone(&instance.registry),
            SessionHandle::new(id, kill.clone(), Arc::clone(&info)),
        )?;
        let globals = instance.global_variables();
        let vars = VariableSet::session_from(&globals);

        let mut session = Self {
            id,
            kill,
            conn: ConnectionState {
                user,
                host: host.to_string(),
                capabilities,
                multi_statements: capabilities
                    & crate::network::constants::capability::MULTI_STATEMENTS
                    != 0,
                scramble: Vec::new(),
                query_attrs: Vec::new(),
            },
            db: None,
            tx: TransactionState::new(true),
            stmt: StatementState::default(),
            vars,
            user_vars: HashMap::new(),
            diagnostics: DiagnosticsArea::new(),
            engine: instance.engine.open_session(id),
            mdl: MdlContext::new(id, Arc::clone(&instance.mdl)),
            prepared: PreparedStatementCache::new(),
            handlers: BTreeMap::new(),
            locked_tables: None,
            counters: SessionCounters {
                statements: vec![0; StatementKind::COUNT],
                ..SessionCounters::default()
            },
            info,
            force_rollback: false,
            release_requested: false,
            finalized_commands: 0,
            _registration: registration,
        };
        session.apply_transaction_defaults();
        debug!(session = id, user = %session.conn.user.username, "session opened");
        Ok(session)
    }

    /// Transaction settings from the session variables.
    fn apply_transaction_defaults(&mut self) {
        let isolation = self
            .vars
            .get("transaction_isolation")
            .and_then(Value::as_text)
            .and_then(crate::transaction::IsolationLevel::parse);
        self.tx = TransactionState::new(self.vars.get_bool("autocommit"));
        self.tx
            .set_session_characteristics(Some(self.vars.get_bool("transaction_read_only")), isolation);
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn kill_token(&self) -> &KillToken {
        &self.kill
    }

    #[must_use]
    pub fn user(&self) -> &User {
        &self.conn.user
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.conn.host
    }

    #[must_use]
    pub fn db(&self) -> Option<&str> {
        self.db.as_deref()
    }

    pub fn set_db(&mut self, db: Option<String>) {
        if let Ok(mut info) = self.info.lock() {
            info.db.clone_from(&db);
        }
        self.db = db;
    }

    #[must_use]
    pub const fn transaction(&self) -> &TransactionState {
        &self.tx
    }

    #[must_use]
    pub const fn diagnostics(&self) -> &DiagnosticsArea {
        &self.diagnostics
    }

    #[must_use]
    pub const fn statement(&self) -> &StatementState {
        &self.stmt
    }

    #[must_use]
    pub const fn variables(&self) -> &VariableSet {
        &self.vars
    }

    #[must_use]
    pub const fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// True once after COMMIT/ROLLBACK ... RELEASE.
    pub fn take_release_request(&mut self) -> bool {
        std::mem::take(&mut self.release_requested)
    }

    #[must_use]
    pub const fn finalized_commands(&self) -> u64 {
        self.finalized_commands
    }

    #[must_use]
    pub fn user_variable(&self, name: &str) -> Option<&Value> {
        self.user_vars.get(&name.to_lowercase())
    }

    #[must_use]
    pub const fn mdl(&self) -> &MdlContext {
        &self.mdl
    }

    #[must_use]
    pub const fn multi_statements(&self) -> bool {
        self.conn.multi_statements
    }

    pub fn set_multi_statements(&mut self, on: bool) {
        self.conn.multi_statements = on;
    }

    #[must_use]
    pub const fn capabilities(&self) -> u32 {
        self.conn.capabilities
    }

    pub fn set_scramble(&mut self, scramble: &[u8]) {
        self.conn.scramble = scramble.to_vec();
    }

    /// Holder of SUPER bypasses read-only mode and admission ceilings.
    #[must_use]
    pub const fn is_super(&self) -> bool {
        self.conn.user.global_privileges.contains(Privileges::SUPER)
    }

    #[must_use]
    pub const fn in_lock_tables_mode(&self) -> bool {
        self.locked_tables.is_some()
    }

    /// Server status word for the next response.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.tx.status_bits(self.engine.in_transaction()) | self.stmt.status_extra
    }

    pub fn set_command(&self, command: &'static str) {
        if let Ok(mut info) = self.info.lock() {
            info.command = command;
            info.since = Instant::now();
            if command == "Sleep" {
                info.info = None;
                info.state = "";
            }
        }
    }

    pub fn set_process_info(&self, state: &'static str, query: Option<&str>) {
        if let Ok(mut info) = self.info.lock() {
            info.state = state;
            info.info = query.map(str::to_string);
        }
    }

    /// Re-reads the account so grants and password changes made by other
    /// sessions apply from the next command on.
    pub fn refresh_user(&mut self, instance: &ServerInstance) {
        if let Some(user) = instance.users.get(&self.conn.user.username) {
            self.conn.user = user;
        }
    }

    pub fn send_ok(&mut self, out: &mut dyn ResultWriter, outcome: &ExecOutcome) {
        if !self.diagnostics.mark_sent() {
            return;
        }
        out.send_ok(OkPacket {
            affected_rows: outcome.affected,
            last_insert_id: outcome.last_insert_id,
            status: self.status(),
            warnings: self.diagnostics.warning_count(),
            info: outcome.info.clone().unwrap_or_default(),
        });
    }

    pub fn send_result_set(&mut self, out: &mut dyn ResultWriter, result: ResultSet) {
        if !self.diagnostics.mark_sent() {
            return;
        }
        self.stmt.rows_sent += result.row_count() as u64;
        let status = self.status();
        out.send_result_set(result, status, self.diagnostics.warning_count());
    }

    pub fn send_eof(&mut self, out: &mut dyn ResultWriter) {
        if !self.diagnostics.mark_sent() {
            return;
        }
        out.send_eof(self.status(), self.diagnostics.warning_count());
    }

    /// Records the error in the diagnostics area and sends it, unless a
    /// final response already went out.
    pub fn send_error(&mut self, out: &mut dyn ResultWriter, err: &ServerError) {
        self.diagnostics.set_error(err);
        if !self.diagnostics.mark_sent() {
            return;
        }
        out.send_error(err);
    }

    /// Sends what a statement produced: its rows or an OK.
    pub fn send_outcome(&mut self, out: &mut dyn ResultWriter, mut outcome: ExecOutcome) {
        match outcome.result.take() {
            Some(rows) => self.send_result_set(out, rows),
            None => self.send_ok(out, &outcome),
        }
    }

    /// Ends every transaction and scope the session holds: what a
    /// disconnect, COM_CHANGE_USER and COM_RESET_CONNECTION share.
    pub fn reset_state(&mut self, instance: &ServerInstance) {
        self.engine.close();
        self.mdl.release_all();
        self.handlers.clear();
        self.locked_tables = None;
        self.prepared.clear();
        self.user_vars.clear();
        self.diagnostics.reset();
        self.stmt = StatementState::default();
        self.force_rollback = false;
        self.vars = VariableSet::session_from(&instance.global_variables());
        self.apply_transaction_defaults();
    }

    /// Switches the connection to another account (COM_CHANGE_USER).
    pub fn change_user(&mut self, instance: &ServerInstance, user: User, db: Option<String>) {
        self.reset_state(instance);
        if let Ok(mut info) = self.info.lock() {
            info.user.clone_from(&user.username);
        }
        self.conn.user = user;
        self.set_db(db);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.engine.close();
        debug!(session = self.id, "session closed");
    }
}
