use thiserror::Error;

/// Codes this server assigns itself; MySQL leaves 50000+ unused.
pub const ER_QUERY_THROTTLED: u16 = 50_001;
pub const ER_DB_READ_ONLY: u16 = 50_002;

/// Coarse failure classes, used by the dispatcher to decide whether the
/// session survives the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Framing or transport problem; the session ends.
    Protocol,
    /// Statement refused before touching storage.
    Admission,
    /// Parser rejected the text.
    Parse,
    /// Engine or statement logic failed.
    Execution,
    /// Kill or statement timer fired.
    Interrupted,
    /// Process-level condition (shutdown).
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleKind {
    Write,
    Read,
}

impl std::fmt::Display for ThrottleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write => f.write_str("write"),
            Self::Read => f.write_str("read"),
        }
    }
}

const fn yes_no(flag: &bool) -> &'static str {
    if *flag { "YES" } else { "NO" }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    // Protocol
    #[error("Got a packet bigger than 'max_allowed_packet' bytes")]
    PacketTooLarge,
    #[error("Got timeout reading communication packets")]
    NetReadTimeout,
    #[error("Got an error reading communication packets")]
    NetReadError,
    #[error("Malformed communication packet.")]
    MalformedPacket,
    #[error("Bad handshake")]
    BadHandshake,
    #[error("Unknown command")]
    UnknownCommand,

    // Admission
    #[error("You must reset your password using ALTER USER statement before executing this statement.")]
    MustChangePassword,
    #[error("Cannot execute statement in a READ ONLY transaction.")]
    ReadOnlyTransaction,
    #[error("The MySQL server is running with the {0} option so it cannot execute this statement")]
    OptionPreventsStatement(String),
    #[error("Database '{0}' is in read-only mode")]
    DatabaseReadOnly(String),
    #[error("Too many concurrent {kind} queries (limit {limit})")]
    Throttled { kind: ThrottleKind, limit: usize },
    #[error("Access denied for user '{user}'@'{host}' (using password: {})", yes_no(.using_password))]
    AccessDenied {
        user: String,
        host: String,
        using_password: bool,
    },
    #[error("Access denied for user '{user}'@'{host}' to database '{db}'")]
    DbAccessDenied { user: String, host: String, db: String },
    #[error("{command} command denied to user '{user}'@'{host}' for table '{table}'")]
    TableAccessDenied {
        command: String,
        user: String,
        host: String,
        table: String,
    },
    #[error("Access denied; you need (at least one of) the {0} privilege(s) for this operation")]
    SpecificAccessDenied(String),
    #[error("You are not owner of thread {0}")]
    KillDenied(u32),

    // Parse
    #[error("You have an error in your SQL syntax; check the manual that corresponds to your MySQL server version for the right syntax to use near '{0}' at line 1")]
    Parse(String),
    #[error("Query was empty")]
    EmptyQuery,

    // Execution
    #[error("No database selected")]
    NoDatabaseSelected,
    #[error("Unknown database '{0}'")]
    UnknownDatabase(String),
    #[error("Can't create database '{0}'; database exists")]
    DatabaseExists(String),
    #[error("Can't drop database '{0}'; database doesn't exist")]
    DatabaseNotExists(String),
    #[error("Table '{db}.{table}' doesn't exist")]
    NoSuchTable { db: String, table: String },
    #[error("Table '{0}' already exists")]
    TableExists(String),
    #[error("Unknown table '{0}'")]
    BadTable(String),
    #[error("Unknown column '{column}' in '{table}'")]
    BadField { column: String, table: String },
    #[error("Column count doesn't match value count at row {0}")]
    ColumnCountMismatch(usize),
    #[error("Duplicate column name '{0}'")]
    DuplicateColumn(String),
    #[error("Lock wait timeout exceeded; try restarting transaction")]
    LockWaitTimeout,
    #[error("Deadlock found when trying to get lock; try restarting transaction")]
    Deadlock,
    #[error("Unknown thread id: {0}")]
    NoSuchThread(u32),
    #[error("SAVEPOINT {0} does not exist")]
    SavepointNotExist(String),
    #[error("XAER_RMFAIL: The command cannot be executed when global transaction is in the  {0} state")]
    XaRmFail(String),
    #[error("XAER_OUTSIDE: Some work is done outside global transaction")]
    XaOutside,
    #[error("XAER_NOTA: Unknown XID")]
    XaNota,
    #[error("Transaction characteristics can't be changed while a transaction is in progress")]
    TxCharacteristicsLocked,
    #[error("Can't execute the given command because you have active locked tables or an active transaction")]
    LockOrActiveTransaction,
    #[error("Table '{0}' was not locked with LOCK TABLES")]
    TableNotLocked(String),
    #[error("Table '{0}' was locked with a READ lock and can't be updated")]
    TableNotLockedForWrite(String),
    #[error("Duplicate key name '{0}'")]
    DuplicateKeyName(String),
    #[error("Can't DROP '{0}'; check that column/key exists")]
    CantDropKey(String),
    #[error("The statement ({0}) has no open cursor.")]
    StmtHasNoOpenCursor(u32),
    #[error("Unknown table '{0}' in HANDLER")]
    UnknownHandlerTable(String),
    #[error("Unknown prepared statement handler ({id}) given to {command}")]
    UnknownStatementHandler { id: String, command: String },
    #[error("Incorrect arguments to {0}")]
    WrongArguments(String),
    #[error("Unknown system variable '{0}'")]
    UnknownSystemVariable(String),
    #[error("Variable '{var}' can't be set to the value of '{value}'")]
    WrongValueForVariable { var: String, value: String },
    #[error("Variable '{0}' is a GLOBAL variable and should be set with SET GLOBAL")]
    GlobalVariable(String),
    #[error("Variable '{0}' is a SESSION variable and can't be used with SET GLOBAL")]
    SessionVariable(String),
    #[error("Variable '{0}' is a read only variable")]
    ReadOnlyVariable(String),
    #[error("No tables used")]
    NoTablesUsed,
    #[error("This version of MySQL doesn't yet support '{0}'")]
    NotSupported(String),
    #[error("Operation {op} failed for '{user}'")]
    CannotUser { op: String, user: String },
    #[error("Can't find any matching row in the user table")]
    PasswordNoMatch,
    #[error("Got error '{0}' from storage engine")]
    Engine(String),

    // Interrupted
    #[error("Query execution was interrupted")]
    QueryInterrupted,
    #[error("Query execution was interrupted, maximum statement execution time exceeded")]
    QueryTimeout,

    // Fatal
    #[error("Server shutdown in progress")]
    ServerShutdown,
    #[error("Unknown error: {0}")]
    Internal(String),
}

impl ServerError {
    /// MySQL error number sent in the ERR packet.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::PacketTooLarge => 1153,
            Self::NetReadTimeout => 1159,
            Self::NetReadError => 1158,
            Self::MalformedPacket => 1835,
            Self::BadHandshake => 1043,
            Self::UnknownCommand => 1047,
            Self::MustChangePassword => 1820,
            Self::ReadOnlyTransaction => 1792,
            Self::OptionPreventsStatement(_) => 1290,
            Self::DatabaseReadOnly(_) => ER_DB_READ_ONLY,
            Self::Throttled { .. } => ER_QUERY_THROTTLED,
            Self::AccessDenied { .. } => 1045,
            Self::DbAccessDenied { .. } => 1044,
            Self::TableAccessDenied { .. } => 1142,
            Self::SpecificAccessDenied(_) => 1227,
            Self::KillDenied(_) => 1095,
            Self::Parse(_) => 1064,
            Self::EmptyQuery => 1065,
            Self::NoDatabaseSelected => 1046,
            Self::UnknownDatabase(_) => 1049,
            Self::DatabaseExists(_) => 1007,
            Self::DatabaseNotExists(_) => 1008,
            Self::NoSuchTable { .. } => 1146,
            Self::TableExists(_) => 1050,
            Self::BadTable(_) => 1051,
            Self::BadField { .. } => 1054,
            Self::ColumnCountMismatch(_) => 1136,
            Self::DuplicateColumn(_) => 1060,
            Self::LockWaitTimeout => 1205,
            Self::Deadlock => 1213,
            Self::NoSuchThread(_) => 1094,
            Self::SavepointNotExist(_) => 1305,
            Self::XaRmFail(_) => 1399,
            Self::XaOutside => 1400,
            Self::XaNota => 1397,
            Self::TxCharacteristicsLocked => 1568,
            Self::LockOrActiveTransaction => 1192,
            Self::TableNotLocked(_) => 1100,
            Self::TableNotLockedForWrite(_) => 1099,
            Self::DuplicateKeyName(_) => 1061,
            Self::CantDropKey(_) => 1091,
            Self::StmtHasNoOpenCursor(_) => 1421,
            Self::UnknownHandlerTable(_) => 1109,
            Self::UnknownStatementHandler { .. } => 1243,
            Self::WrongArguments(_) => 1210,
            Self::UnknownSystemVariable(_) => 1193,
            Self::WrongValueForVariable { .. } => 1231,
            Self::GlobalVariable(_) => 1229,
            Self::SessionVariable(_) => 1228,
            Self::ReadOnlyVariable(_) => 1238,
            Self::NoTablesUsed => 1096,
            Self::NotSupported(_) => 1235,
            Self::CannotUser { .. } => 1396,
            Self::PasswordNoMatch => 1133,
            Self::Engine(_) => 1030,
            Self::QueryInterrupted => 1317,
            Self::QueryTimeout => 3024,
            Self::ServerShutdown => 1053,
            Self::Internal(_) => 1105,
        }
    }

    /// Five character SQLSTATE.
    #[must_use]
    pub const fn sqlstate(&self) -> &'static str {
        match self {
            Self::PacketTooLarge
            | Self::NetReadTimeout
            | Self::NetReadError
            | Self::BadHandshake
            | Self::UnknownCommand
            | Self::ServerShutdown => "08S01",
            Self::ReadOnlyTransaction => "25006",
            Self::AccessDenied { .. } => "28000",
            Self::DbAccessDenied { .. }
            | Self::TableAccessDenied { .. }
            | Self::SpecificAccessDenied(_)
            | Self::Parse(_)
            | Self::EmptyQuery
            | Self::UnknownDatabase(_)
            | Self::SavepointNotExist(_)
            | Self::WrongValueForVariable { .. }
            | Self::UnknownSystemVariable(_)
            | Self::NotSupported(_)
            | Self::PasswordNoMatch
            | Self::DuplicateKeyName(_)
            | Self::CantDropKey(_) => "42000",
            Self::NoDatabaseSelected => "3D000",
            Self::NoSuchTable { .. } | Self::BadTable(_) | Self::UnknownHandlerTable(_) => "42S02",
            Self::TableExists(_) => "42S01",
            Self::BadField { .. } => "42S22",
            Self::DuplicateColumn(_) => "42S21",
            Self::ColumnCountMismatch(_) => "21S01",
            Self::Deadlock => "40001",
            Self::XaRmFail(_) => "XAE07",
            Self::XaOutside => "XAE09",
            Self::XaNota => "XAE04",
            Self::TxCharacteristicsLocked => "25001",
            Self::QueryInterrupted => "70100",
            _ => "HY000",
        }
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::PacketTooLarge
            | Self::NetReadTimeout
            | Self::NetReadError
            | Self::MalformedPacket
            | Self::BadHandshake => ErrorClass::Protocol,
            Self::MustChangePassword
            | Self::ReadOnlyTransaction
            | Self::OptionPreventsStatement(_)
            | Self::DatabaseReadOnly(_)
            | Self::Throttled { .. }
            | Self::AccessDenied { .. }
            | Self::DbAccessDenied { .. }
            | Self::TableAccessDenied { .. }
            | Self::SpecificAccessDenied(_)
            | Self::KillDenied(_) => ErrorClass::Admission,
            Self::Parse(_) | Self::EmptyQuery => ErrorClass::Parse,
            Self::QueryInterrupted | Self::QueryTimeout => ErrorClass::Interrupted,
            Self::ServerShutdown | Self::Internal(_) => ErrorClass::Fatal,
            _ => ErrorClass::Execution,
        }
    }

    /// Storage-engine signals after which the statement decision must be
    /// re-checked against the engine's rollback request.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockWaitTimeout | Self::Deadlock)
    }
}
