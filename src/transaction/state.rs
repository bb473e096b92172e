use crate::core::ServerError;
use crate::network::constants::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Value shown by `@@transaction_isolation`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ-UNCOMMITTED",
            Self::ReadCommitted => "READ-COMMITTED",
            Self::RepeatableRead => "REPEATABLE-READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// Accepts both `REPEATABLE READ` and `REPEATABLE-READ`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text
            .trim()
            .to_uppercase()
            .replace('-', " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        match normalized.as_str() {
            "READ UNCOMMITTED" => Some(Self::ReadUncommitted),
            "READ COMMITTED" => Some(Self::ReadCommitted),
            "REPEATABLE READ" => Some(Self::RepeatableRead),
            "SERIALIZABLE" => Some(Self::Serializable),
            _ => None,
        }
    }
}

/// XA branch state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum XaState {
    #[default]
    NotStarted,
    Active(String),
    Idle(String),
    Prepared(String),
}

impl XaState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "NON-EXISTING",
            Self::Active(_) => "ACTIVE",
            Self::Idle(_) => "IDLE",
            Self::Prepared(_) => "PREPARED",
        }
    }

    #[must_use]
    pub fn xid(&self) -> Option<&str> {
        match self {
            Self::NotStarted => None,
            Self::Active(x) | Self::Idle(x) | Self::Prepared(x) => Some(x),
        }
    }

    /// An XA branch exists and must be finished by XA statements.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self, Self::NotStarted)
    }

    /// Fails with XAER_RMFAIL while a branch is open.
    pub fn ensure_closed(&self) -> Result<(), ServerError> {
        if self.is_open() {
            Err(ServerError::XaRmFail(self.name().to_string()))
        } else {
            Ok(())
        }
    }
}

/// Statement-level boundary. The explicit-transaction flag is kept apart
/// from it: while set, transactional locks survive the statement end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Boundary {
    #[default]
    NoTransaction,
    StatementActive,
}

/// Per-session transaction bookkeeping. Engine state (undo, row locks)
/// lives in the engine session; this tracks what the protocol and the
/// dispatcher need.
#[derive(Debug, Clone)]
pub struct TransactionState {
    boundary: Boundary,
    explicit: bool,
    autocommit: bool,
    read_only: bool,
    isolation: IsolationLevel,
    session_read_only: bool,
    session_isolation: IsolationLevel,
    next_read_only: Option<bool>,
    next_isolation: Option<IsolationLevel>,
    xa: XaState,
    unsafe_rollback: bool,
}

impl TransactionState {
    #[must_use]
    pub fn new(autocommit: bool) -> Self {
        Self {
            boundary: Boundary::NoTransaction,
            explicit: false,
            autocommit,
            read_only: false,
            isolation: IsolationLevel::default(),
            session_read_only: false,
            session_isolation: IsolationLevel::default(),
            next_read_only: None,
            next_isolation: None,
            xa: XaState::NotStarted,
            unsafe_rollback: false,
        }
    }

    #[must_use]
    pub const fn boundary(&self) -> Boundary {
        self.boundary
    }

    pub fn begin_statement(&mut self) {
        self.boundary = Boundary::StatementActive;
    }

    pub fn end_statement(&mut self) {
        self.boundary = Boundary::NoTransaction;
    }

    /// BEGIN / START TRANSACTION was issued and not yet ended.
    #[must_use]
    pub const fn is_explicit(&self) -> bool {
        self.explicit
    }

    #[must_use]
    pub const fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Statements accumulate into one transaction until COMMIT/ROLLBACK,
    /// either because of BEGIN or because autocommit is off.
    #[must_use]
    pub const fn in_multi_statement_mode(&self) -> bool {
        self.explicit || !self.autocommit
    }

    /// Read-only setting in force for the statement about to run.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        if self.explicit {
            self.read_only
        } else {
            self.next_read_only.unwrap_or(self.session_read_only)
        }
    }

    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        if self.explicit {
            self.isolation
        } else {
            self.next_isolation.unwrap_or(self.session_isolation)
        }
    }

    #[must_use]
    pub const fn session_read_only(&self) -> bool {
        self.session_read_only
    }

    #[must_use]
    pub const fn session_isolation(&self) -> IsolationLevel {
        self.session_isolation
    }

    /// Opens an explicit transaction; one-shot characteristics set by
    /// `SET TRANSACTION` are consumed here.
    pub fn begin(&mut self, read_only: Option<bool>) {
        self.read_only = read_only
            .or(self.next_read_only)
            .unwrap_or(self.session_read_only);
        self.isolation = self.next_isolation.unwrap_or(self.session_isolation);
        self.next_read_only = None;
        self.next_isolation = None;
        self.explicit = true;
    }

    /// COMMIT, ROLLBACK or an implicit commit closed the transaction.
    pub fn end(&mut self) {
        self.explicit = false;
        self.read_only = false;
        self.unsafe_rollback = false;
        self.next_read_only = None;
        self.next_isolation = None;
        self.xa = XaState::NotStarted;
    }

    /// Returns true when the value changed.
    pub fn set_autocommit(&mut self, on: bool) -> bool {
        let changed = self.autocommit != on;
        self.autocommit = on;
        if on {
            self.explicit = false;
            self.read_only = false;
        }
        changed
    }

    /// `SET TRANSACTION ...` without scope: applies to the next transaction.
    pub fn set_next_characteristics(
        &mut self,
        read_only: Option<bool>,
        isolation: Option<IsolationLevel>,
    ) -> Result<(), ServerError> {
        if self.explicit {
            return Err(ServerError::TxCharacteristicsLocked);
        }
        if read_only.is_some() {
            self.next_read_only = read_only;
        }
        if isolation.is_some() {
            self.next_isolation = isolation;
        }
        Ok(())
    }

    pub fn set_session_characteristics(
        &mut self,
        read_only: Option<bool>,
        isolation: Option<IsolationLevel>,
    ) {
        if let Some(ro) = read_only {
            self.session_read_only = ro;
        }
        if let Some(level) = isolation {
            self.session_isolation = level;
        }
    }

    #[must_use]
    pub const fn xa(&self) -> &XaState {
        &self.xa
    }

    pub fn set_xa(&mut self, state: XaState) {
        self.xa = state;
    }

    pub fn mark_unsafe_rollback(&mut self) {
        self.unsafe_rollback = true;
    }

    #[must_use]
    pub const fn unsafe_rollback(&self) -> bool {
        self.unsafe_rollback
    }

    /// Transaction bits of the server status word. `engine_active` tells
    /// whether the engine holds an open transaction (autocommit off case).
    #[must_use]
    pub fn status_bits(&self, engine_active: bool) -> u16 {
        let mut bits = 0;
        if self.autocommit {
            bits |= status::AUTOCOMMIT;
        }
        let in_trans = self.explicit || (!self.autocommit && engine_active);
        if in_trans {
            bits |= status::IN_TRANS;
            if self.is_read_only() {
                bits |= status::IN_TRANS_READONLY;
            }
        }
        bits
    }
}

impl Default for TransactionState {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_parse() {
        assert_eq!(
            IsolationLevel::parse("repeatable read"),
            Some(IsolationLevel::RepeatableRead)
        );
        assert_eq!(
            IsolationLevel::parse("READ-COMMITTED"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(IsolationLevel::parse("chaos"), None);
    }

    #[test]
    fn test_read_only_lives_until_end() {
        let mut tx = TransactionState::new(true);
        tx.begin(Some(true));
        assert!(tx.is_read_only());
        assert!(tx.is_explicit());
        tx.end_statement();
        assert!(tx.is_read_only());
        tx.end();
        assert!(!tx.is_read_only());
        assert!(!tx.is_explicit());
    }

    #[test]
    fn test_next_characteristics_consumed_by_begin() {
        let mut tx = TransactionState::new(true);
        tx.set_next_characteristics(Some(true), Some(IsolationLevel::Serializable))
            .unwrap();
        assert!(tx.is_read_only());
        tx.begin(None);
        assert!(tx.is_read_only());
        assert_eq!(tx.isolation(), IsolationLevel::Serializable);
        assert_eq!(
            tx.set_next_characteristics(Some(false), None).unwrap_err(),
            ServerError::TxCharacteristicsLocked
        );
        tx.end();
        assert!(!tx.is_read_only());
        assert_eq!(tx.isolation(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_set_autocommit_is_idempotent() {
        let mut tx = TransactionState::new(true);
        assert!(tx.set_autocommit(false));
        assert!(!tx.set_autocommit(false));
        assert!(tx.in_multi_statement_mode());
        assert!(tx.set_autocommit(true));
        assert!(!tx.in_multi_statement_mode());
    }

    #[test]
    fn test_status_bits() {
        let mut tx = TransactionState::new(true);
        assert_eq!(tx.status_bits(false), status::AUTOCOMMIT);
        tx.begin(Some(true));
        assert_eq!(
            tx.status_bits(false),
            status::AUTOCOMMIT | status::IN_TRANS | status::IN_TRANS_READONLY
        );
        tx.end();
        tx.set_autocommit(false);
        assert_eq!(tx.status_bits(true), status::IN_TRANS);
    }

    #[test]
    fn test_xa_blocks_while_open() {
        let xa = XaState::Idle("x1".into());
        assert_eq!(
            xa.ensure_closed().unwrap_err(),
            ServerError::XaRmFail("IDLE".into())
        );
        assert!(XaState::NotStarted.ensure_closed().is_ok());
    }
}
