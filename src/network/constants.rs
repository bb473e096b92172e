// MySQL wire constants (command codes, status and capability bits)
//
// Numeric values are a compatibility contract with existing client drivers.

/// Largest payload a single frame can carry; longer payloads continue in the
/// next frame.
pub const MAX_PACKET_LENGTH: usize = 0x00FF_FFFF;

pub const PROTOCOL_VERSION: u8 = 10;
pub const SERVER_VERSION: &str = "5.6.99-myrustql";
pub const SCRAMBLE_LENGTH: usize = 20;
pub const UTF8MB4_GENERAL_CI: u8 = 45;
pub const AUTH_PLUGIN_NAME: &str = "mysql_native_password";

/// Client commands, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Sleep = 0,
    Quit = 1,
    InitDb = 2,
    Query = 3,
    FieldList = 4,
    CreateDb = 5,
    DropDb = 6,
    Refresh = 7,
    Shutdown = 8,
    Statistics = 9,
    ProcessInfo = 10,
    Connect = 11,
    ProcessKill = 12,
    Debug = 13,
    Ping = 14,
    Time = 15,
    DelayedInsert = 16,
    ChangeUser = 17,
    BinlogDump = 18,
    TableDump = 19,
    ConnectOut = 20,
    RegisterSlave = 21,
    StmtPrepare = 22,
    StmtExecute = 23,
    StmtSendLongData = 24,
    StmtClose = 25,
    StmtReset = 26,
    SetOption = 27,
    StmtFetch = 28,
    Daemon = 29,
    BinlogDumpGtid = 30,
    ResetConnection = 31,
    QueryAttrs = 255,
}

impl Command {
    pub const ALL: [Self; 33] = [
        Self::Sleep,
        Self::Quit,
        Self::InitDb,
        Self::Query,
        Self::FieldList,
        Self::CreateDb,
        Self::DropDb,
        Self::Refresh,
        Self::Shutdown,
        Self::Statistics,
        Self::ProcessInfo,
        Self::Connect,
        Self::ProcessKill,
        Self::Debug,
        Self::Ping,
        Self::Time,
        Self::DelayedInsert,
        Self::ChangeUser,
        Self::BinlogDump,
        Self::TableDump,
        Self::ConnectOut,
        Self::RegisterSlave,
        Self::StmtPrepare,
        Self::StmtExecute,
        Self::StmtSendLongData,
        Self::StmtClose,
        Self::StmtReset,
        Self::SetOption,
        Self::StmtFetch,
        Self::Daemon,
        Self::BinlogDumpGtid,
        Self::ResetConnection,
        Self::QueryAttrs,
    ];

    #[must_use]
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0..=31 => Some(Self::ALL[code as usize]),
            255 => Some(Self::QueryAttrs),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Name shown in the process list.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sleep => "Sleep",
            Self::Quit => "Quit",
            Self::InitDb => "Init DB",
            Self::Query => "Query",
            Self::FieldList => "Field List",
            Self::CreateDb => "Create DB",
            Self::DropDb => "Drop DB",
            Self::Refresh => "Refresh",
            Self::Shutdown => "Shutdown",
            Self::Statistics => "Statistics",
            Self::ProcessInfo => "Processlist",
            Self::Connect => "Connect",
            Self::ProcessKill => "Kill",
            Self::Debug => "Debug",
            Self::Ping => "Ping",
            Self::Time => "Time",
            Self::DelayedInsert => "Delayed insert",
            Self::ChangeUser => "Change user",
            Self::BinlogDump => "Binlog Dump",
            Self::TableDump => "Table Dump",
            Self::ConnectOut => "Connect Out",
            Self::RegisterSlave => "Register Slave",
            Self::StmtPrepare => "Prepare",
            Self::StmtExecute => "Execute",
            Self::StmtSendLongData => "Long Data",
            Self::StmtClose => "Close stmt",
            Self::StmtReset => "Reset stmt",
            Self::SetOption => "Set option",
            Self::StmtFetch => "Fetch",
            Self::Daemon => "Daemon",
            Self::BinlogDumpGtid => "Binlog Dump GTID",
            Self::ResetConnection => "Reset Connection",
            Self::QueryAttrs => "Query Attributes",
        }
    }
}

/// Server status bits sent in OK and EOF packets.
pub mod status {
    pub const IN_TRANS: u16 = 1;
    pub const AUTOCOMMIT: u16 = 2;
    pub const MORE_RESULTS_EXISTS: u16 = 8;
    pub const QUERY_NO_GOOD_INDEX_USED: u16 = 16;
    pub const QUERY_NO_INDEX_USED: u16 = 32;
    pub const CURSOR_EXISTS: u16 = 64;
    pub const LAST_ROW_SENT: u16 = 128;
    pub const DB_DROPPED: u16 = 256;
    pub const NO_BACKSLASH_ESCAPES: u16 = 512;
    pub const METADATA_CHANGED: u16 = 1024;
    pub const QUERY_WAS_SLOW: u16 = 2048;
    pub const PS_OUT_PARAMS: u16 = 4096;
    pub const IN_TRANS_READONLY: u16 = 8192;
    pub const SESSION_STATE_CHANGED: u16 = 1 << 14;

    /// Bits the engine only ever sets; they are dropped at the start of each
    /// command.
    pub const CLEAR_SET: u16 = QUERY_NO_GOOD_INDEX_USED
        | QUERY_NO_INDEX_USED
        | MORE_RESULTS_EXISTS
        | METADATA_CHANGED
        | QUERY_WAS_SLOW
        | DB_DROPPED
        | CURSOR_EXISTS
        | LAST_ROW_SENT;
}

/// Client capability bits.
pub mod capability {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const NO_SCHEMA: u32 = 16;
    pub const COMPRESS: u32 = 32;
    pub const LOCAL_FILES: u32 = 128;
    pub const IGNORE_SPACE: u32 = 256;
    pub const PROTOCOL_41: u32 = 512;
    pub const INTERACTIVE: u32 = 1024;
    pub const SSL: u32 = 2048;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const SESSION_TRACK: u32 = 1 << 23;
    pub const DEPRECATE_EOF: u32 = 1 << 24;

    /// What this server offers in the initial handshake. No TLS, no
    /// compression.
    pub const SERVER_DEFAULT: u32 = LONG_PASSWORD
        | FOUND_ROWS
        | LONG_FLAG
        | CONNECT_WITH_DB
        | IGNORE_SPACE
        | PROTOCOL_41
        | INTERACTIVE
        | TRANSACTIONS
        | SECURE_CONNECTION
        | MULTI_STATEMENTS
        | MULTI_RESULTS
        | PS_MULTI_RESULTS
        | PLUGIN_AUTH
        | CONNECT_ATTRS
        | PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CAN_HANDLE_EXPIRED_PASSWORDS;
}

/// COM_REFRESH option bits.
pub mod refresh {
    pub const GRANT: u32 = 1;
    pub const LOG: u32 = 2;
    pub const TABLES: u32 = 4;
    pub const HOSTS: u32 = 8;
    pub const STATUS: u32 = 16;
    pub const THREADS: u32 = 32;
    pub const SLAVE: u32 = 64;
    pub const MASTER: u32 = 128;
    pub const ERROR_LOG: u32 = 256;
    pub const ENGINE_LOG: u32 = 512;
    pub const BINARY_LOG: u32 = 1024;
    pub const RELAY_LOG: u32 = 2048;
    pub const GENERAL_LOG: u32 = 4096;
    pub const SLOW_LOG: u32 = 8192;
    pub const READ_LOCK: u32 = 16384;
}

/// COM_SHUTDOWN levels.
pub mod shutdown {
    pub const DEFAULT: u8 = 0;
    pub const WAIT_CONNECTIONS: u8 = 1;
    pub const WAIT_TRANSACTIONS: u8 = 2;
    pub const WAIT_UPDATES: u8 = 8;
    pub const WAIT_ALL_BUFFERS: u8 = 16;
    pub const WAIT_CRITICAL_BUFFERS: u8 = 17;
    pub const KILL_QUERY: u8 = 254;
    pub const KILL_CONNECTION: u8 = 255;
}

/// COM_SET_OPTION values.
pub mod set_option {
    pub const MULTI_STATEMENTS_ON: u16 = 0;
    pub const MULTI_STATEMENTS_OFF: u16 = 1;
}

/// Column types used by the text and binary protocols.
pub mod column_type {
    pub const DECIMAL: u8 = 0x00;
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const NULL: u8 = 0x06;
    pub const TIMESTAMP: u8 = 0x07;
    pub const LONGLONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const DATE: u8 = 0x0a;
    pub const TIME: u8 = 0x0b;
    pub const DATETIME: u8 = 0x0c;
    pub const YEAR: u8 = 0x0d;
    pub const VARCHAR: u8 = 0x0f;
    pub const BIT: u8 = 0x10;
    pub const NEWDECIMAL: u8 = 0xf6;
    pub const ENUM: u8 = 0xf7;
    pub const SET: u8 = 0xf8;
    pub const TINY_BLOB: u8 = 0xf9;
    pub const MEDIUM_BLOB: u8 = 0xfa;
    pub const LONG_BLOB: u8 = 0xfb;
    pub const BLOB: u8 = 0xfc;
    pub const VAR_STRING: u8 = 0xfd;
    pub const STRING: u8 = 0xfe;

    /// High bit of the 2-byte parameter type in COM_STMT_EXECUTE.
    pub const UNSIGNED_FLAG: u16 = 0x8000;
}
