use crate::core::{Privileges, Value};
use crate::transaction::IsolationLevel;

/// Every statement kind the server recognises. Fieldless so that
/// `kind as usize` indexes the classification and handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Do,
    CreateTable,
    DropTable,
    AlterTable,
    RenameTable,
    Truncate,
    CreateIndex,
    DropIndex,
    CreateDb,
    DropDb,
    AlterDb,
    ChangeDb,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    RollbackToSavepoint,
    ReleaseSavepoint,
    SetOption,
    SetTransaction,
    SetPassword,
    CreateUser,
    DropUser,
    AlterUser,
    Grant,
    Revoke,
    Kill,
    LockTables,
    UnlockTables,
    HaOpen,
    HaRead,
    HaClose,
    XaStart,
    XaEnd,
    XaPrepare,
    XaCommit,
    XaRollback,
    XaRecover,
    ShowDatabases,
    ShowTables,
    ShowProcesslist,
    ShowStatus,
    ShowVariables,
    ShowWarnings,
    ShowErrors,
    Flush,
    Shutdown,
    CreateProcedure,
    DropProcedure,
    Call,
    StartSlave,
    StopSlave,
    ChangeMaster,
    LoadData,
}

impl StatementKind {
    pub const COUNT: usize = 59;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Select,
        Self::Insert,
        Self::Replace,
        Self::Update,
        Self::Delete,
        Self::Do,
        Self::CreateTable,
        Self::DropTable,
        Self::AlterTable,
        Self::RenameTable,
        Self::Truncate,
        Self::CreateIndex,
        Self::DropIndex,
        Self::CreateDb,
        Self::DropDb,
        Self::AlterDb,
        Self::ChangeDb,
        Self::Begin,
        Self::Commit,
        Self::Rollback,
        Self::Savepoint,
        Self::RollbackToSavepoint,
        Self::ReleaseSavepoint,
        Self::SetOption,
        Self::SetTransaction,
        Self::SetPassword,
        Self::CreateUser,
        Self::DropUser,
        Self::AlterUser,
        Self::Grant,
        Self::Revoke,
        Self::Kill,
        Self::LockTables,
        Self::UnlockTables,
        Self::HaOpen,
        Self::HaRead,
        Self::HaClose,
        Self::XaStart,
        Self::XaEnd,
        Self::XaPrepare,
        Self::XaCommit,
        Self::XaRollback,
        Self::XaRecover,
        Self::ShowDatabases,
        Self::ShowTables,
        Self::ShowProcesslist,
        Self::ShowStatus,
        Self::ShowVariables,
        Self::ShowWarnings,
        Self::ShowErrors,
        Self::Flush,
        Self::Shutdown,
        Self::CreateProcedure,
        Self::DropProcedure,
        Self::Call,
        Self::StartSlave,
        Self::StopSlave,
        Self::ChangeMaster,
        Self::LoadData,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Suffix of the `Com_xxx` status counter.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Replace => "replace",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Do => "do",
            Self::CreateTable => "create_table",
            Self::DropTable => "drop_table",
            Self::AlterTable => "alter_table",
            Self::RenameTable => "rename_table",
            Self::Truncate => "truncate",
            Self::CreateIndex => "create_index",
            Self::DropIndex => "drop_index",
            Self::CreateDb => "create_db",
            Self::DropDb => "drop_db",
            Self::AlterDb => "alter_db",
            Self::ChangeDb => "change_db",
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Savepoint => "savepoint",
            Self::RollbackToSavepoint => "rollback_to_savepoint",
            Self::ReleaseSavepoint => "release_savepoint",
            Self::SetOption => "set_option",
            Self::SetTransaction => "set_transaction",
            Self::SetPassword => "set_password",
            Self::CreateUser => "create_user",
            Self::DropUser => "drop_user",
            Self::AlterUser => "alter_user",
            Self::Grant => "grant",
            Self::Revoke => "revoke",
            Self::Kill => "kill",
            Self::LockTables => "lock_tables",
            Self::UnlockTables => "unlock_tables",
            Self::HaOpen => "ha_open",
            Self::HaRead => "ha_read",
            Self::HaClose => "ha_close",
            Self::XaStart => "xa_start",
            Self::XaEnd => "xa_end",
            Self::XaPrepare => "xa_prepare",
            Self::XaCommit => "xa_commit",
            Self::XaRollback => "xa_rollback",
            Self::XaRecover => "xa_recover",
            Self::ShowDatabases => "show_databases",
            Self::ShowTables => "show_tables",
            Self::ShowProcesslist => "show_processlist",
            Self::ShowStatus => "show_status",
            Self::ShowVariables => "show_variables",
            Self::ShowWarnings => "show_warnings",
            Self::ShowErrors => "show_errors",
            Self::Flush => "flush",
            Self::Shutdown => "shutdown",
            Self::CreateProcedure => "create_procedure",
            Self::DropProcedure => "drop_procedure",
            Self::Call => "call_procedure",
            Self::StartSlave => "slave_start",
            Self::StopSlave => "slave_stop",
            Self::ChangeMaster => "change_master",
            Self::LoadData => "load",
        }
    }
}

/// Table named by a statement. `db` is `None` when the statement relies on
/// the session's default database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub db: Option<String>,
    pub name: String,
    /// Written with TEMPORARY (CREATE/DROP TEMPORARY TABLE).
    pub temporary: bool,
}

impl TableRef {
    #[must_use]
    pub fn new(db: Option<String>, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
            temporary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column(String),
    Star,
    CountStar,
    /// SLEEP(seconds)
    Sleep(f64),
    /// `@@[global.|session.]name`
    SystemVariable { global: bool, name: String },
    /// `@name`
    UserVariable(String),
    /// Zero-argument built-in such as CONNECTION_ID() or DATABASE().
    Function(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    /// Column label: the alias or the expression as written.
    pub label: String,
}

/// `WHERE column = value`
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectParams {
    pub items: Vec<SelectItem>,
    pub filter: Option<Filter>,
    pub limit: Option<u64>,
    pub for_update: bool,
    pub lock_in_share_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertParams {
    pub columns: Option<Vec<String>>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateParams {
    pub assignments: Vec<(String, Value)>,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableParams {
    pub columns: Vec<String>,
    pub if_not_exists: bool,
    pub engine: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterTableOp {
    AddColumn(String),
    DropColumn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    Session,
    Global,
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarAssignment {
    pub scope: VarScope,
    pub name: String,
    pub value: Value,
}

/// Where `SET ... TRANSACTION` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxScope {
    Next,
    Session,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLockType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRead {
    First,
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    Tables,
    Privileges,
    Status,
    Logs,
}

/// COMMIT / ROLLBACK completion options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    pub chain: bool,
    pub release: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementParams {
    None,
    Select(SelectParams),
    Insert(InsertParams),
    Update(UpdateParams),
    Delete { filter: Option<Filter> },
    Do(Vec<Expr>),
    CreateTable(CreateTableParams),
    DropTable { if_exists: bool },
    AlterTable(AlterTableOp),
    Index { name: String },
    Database { name: String, if_flag: bool },
    AlterDatabase { name: Option<String>, read_only: Option<u8> },
    UseDb(String),
    Begin { read_only: Option<bool>, consistent_snapshot: bool },
    Completion(Completion),
    Savepoint(String),
    Set(Vec<VarAssignment>),
    SetTransaction {
        scope: TxScope,
        read_only: Option<bool>,
        isolation: Option<IsolationLevel>,
    },
    SetPassword { user: Option<String>, password: String },
    CreateUser { user: String, password: Option<String>, if_not_exists: bool },
    DropUser { user: String, if_exists: bool },
    AlterUser { user: String, password: Option<String>, expire: bool },
    Grant {
        privileges: Privileges,
        db: Option<String>,
        table: Option<String>,
        user: String,
    },
    Kill { id: u32, query_only: bool },
    /// One entry per table in the descriptor's table list.
    LockTables(Vec<TableLockType>),
    HandlerRead(HandlerRead),
    Xa { xid: String, one_phase: bool },
    Show {
        global: bool,
        full: bool,
        from: Option<String>,
        like: Option<String>,
    },
    Flush(Vec<FlushTarget>),
}

/// Parsed statement handed to the execution layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementDescriptor {
    pub kind: StatementKind,
    pub tables: Vec<TableRef>,
    pub params: StatementParams,
    /// Statement text as written, without the separator.
    pub text: String,
}

impl StatementDescriptor {
    /// Text is filled in by the splitter once the statement boundary is known.
    #[must_use]
    pub fn new(kind: StatementKind, tables: Vec<TableRef>, params: StatementParams) -> Self {
        Self {
            kind,
            tables,
            params,
            text: String::new(),
        }
    }

    #[must_use]
    pub fn select_params(&self) -> Option<&SelectParams> {
        match &self.params {
            StatementParams::Select(p) => Some(p),
            _ => None,
        }
    }

    /// Plain SELECT, not a locking read. Only these get the statement timer.
    #[must_use]
    pub fn is_plain_select(&self) -> bool {
        self.kind == StatementKind::Select
            && self
                .select_params()
                .is_some_and(|p| !p.for_update && !p.lock_in_share_mode)
    }
}
