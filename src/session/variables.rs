//! System variables: the catalog of known names and the value sets kept per
//! server and per session.

use std::collections::BTreeMap;

use crate::core::{ServerConfig, ServerError, Value};
use crate::network::constants::SERVER_VERSION;
use crate::transaction::IsolationLevel;

/// Where a variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Session,
    Global,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Bool,
    UInt,
    Real,
    Text,
    Isolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarDef {
    pub name: &'static str,
    pub scope: Scope,
    pub read_only: bool,
    pub ty: VarType,
}

const fn def(name: &'static str, scope: Scope, ty: VarType) -> VarDef {
    VarDef {
        name,
        scope,
        read_only: false,
        ty,
    }
}

const fn fixed(name: &'static str, scope: Scope, ty: VarType) -> VarDef {
    VarDef {
        name,
        scope,
        read_only: true,
        ty,
    }
}

/// Sorted by name; SHOW VARIABLES relies on it.
pub const VARIABLES: &[VarDef] = &[
    def("autocommit", Scope::Both, VarType::Bool),
    def("character_set_client", Scope::Both, VarType::Text),
    def("character_set_connection", Scope::Both, VarType::Text),
    def("character_set_results", Scope::Both, VarType::Text),
    def("general_log", Scope::Global, VarType::Bool),
    def("lock_wait_timeout", Scope::Both, VarType::UInt),
    def("long_query_time", Scope::Both, VarType::Real),
    def("max_allowed_packet", Scope::Global, VarType::UInt),
    def("max_execution_time", Scope::Both, VarType::UInt),
    def("max_running_reads", Scope::Global, VarType::UInt),
    def("max_running_writes", Scope::Global, VarType::UInt),
    def("min_examined_row_limit", Scope::Both, VarType::UInt),
    def("net_read_timeout", Scope::Both, VarType::UInt),
    def("read_only", Scope::Global, VarType::Bool),
    def("slow_query_log", Scope::Global, VarType::Bool),
    def("sql_mode", Scope::Both, VarType::Text),
    def("super_read_only", Scope::Global, VarType::Bool),
    def("time_zone", Scope::Both, VarType::Text),
    def("transaction_isolation", Scope::Both, VarType::Isolation),
    def("transaction_read_only", Scope::Both, VarType::Bool),
    fixed("version", Scope::Global, VarType::Text),
    fixed("version_comment", Scope::Global, VarType::Text),
    def("wait_timeout", Scope::Both, VarType::UInt),
];

/// Finds a variable, accepting the pre-8.0 names of the transaction ones.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static VarDef> {
    let name = name.to_lowercase();
    let canonical = match name.as_str() {
        "tx_isolation" => "transaction_isolation",
        "tx_read_only" => "transaction_read_only",
        "names" => "character_set_client",
        other => other,
    };
    VARIABLES
        .binary_search_by(|d| d.name.cmp(canonical))
        .ok()
        .map(|i| &VARIABLES[i])
}

impl VarDef {
    #[must_use]
    pub const fn has_session(&self) -> bool {
        matches!(self.scope, Scope::Session | Scope::Both)
    }

    #[must_use]
    pub const fn has_global(&self) -> bool {
        matches!(self.scope, Scope::Global | Scope::Both)
    }

    /// Converts an assigned value to the variable's canonical form.
    pub fn coerce(&self, value: &Value) -> Result<Value, ServerError> {
        let wrong = || ServerError::WrongValueForVariable {
            var: self.name.to_string(),
            value: value.to_string(),
        };
        match self.ty {
            VarType::Bool => match value {
                Value::Integer(0) => Ok(Value::Integer(0)),
                Value::Integer(1) => Ok(Value::Integer(1)),
                Value::Text(t) => match t.to_uppercase().as_str() {
                    "ON" | "TRUE" | "1" => Ok(Value::Integer(1)),
                    "OFF" | "FALSE" | "0" => Ok(Value::Integer(0)),
                    _ => Err(wrong()),
                },
                _ => Err(wrong()),
            },
            VarType::UInt => match value {
                Value::Integer(i) if *i >= 0 => Ok(Value::Integer(*i)),
                Value::Text(t) => t
                    .trim()
                    .parse::<u32>()
                    .map(|v| Value::Integer(i64::from(v)))
                    .map_err(|_| wrong()),
                _ => Err(wrong()),
            },
            VarType::Real => match value {
                Value::Integer(i) if *i >= 0 => Ok(Value::Real(*i as f64)),
                Value::Real(r) if *r >= 0.0 => Ok(Value::Real(*r)),
                _ => Err(wrong()),
            },
            VarType::Text => match value {
                Value::Null => Err(wrong()),
                other => Ok(Value::Text(other.to_string())),
            },
            VarType::Isolation => value
                .as_text()
                .and_then(IsolationLevel::parse)
                .map(|level| Value::Text(level.name().to_string()))
                .ok_or_else(wrong),
        }
    }

    /// Rendering used by SHOW VARIABLES.
    #[must_use]
    pub fn display(&self, value: &Value) -> String {
        match (self.ty, value) {
            (VarType::Bool, Value::Integer(0)) => "OFF".to_string(),
            (VarType::Bool, Value::Integer(_)) => "ON".to_string(),
            (VarType::Real, Value::Real(r)) => format!("{r:.6}"),
            (_, other) => other.to_string(),
        }
    }
}

/// Values of one variable set (the server's globals or one session's).
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    values: BTreeMap<&'static str, Value>,
}

impl VariableSet {
    /// Server globals as configured at startup.
    #[must_use]
    pub fn globals(config: &ServerConfig) -> Self {
        let mut set = Self::default();
        let flag = |b: bool| Value::Integer(i64::from(b));
        let uint = |v: u64| Value::Integer(i64::try_from(v).unwrap_or(i64::MAX));

        set.values.insert("autocommit", Value::Integer(1));
        for charset in [
            "character_set_client",
            "character_set_connection",
            "character_set_results",
        ] {
            set.values.insert(charset, Value::Text("utf8mb4".to_string()));
        }
        set.values.insert("general_log", flag(config.logging.general_log));
        set.values.insert(
            "lock_wait_timeout",
            uint(u64::from(config.limits.lock_wait_timeout_secs)),
        );
        set.values.insert(
            "long_query_time",
            Value::Real(config.logging.long_query_time_secs),
        );
        set.values.insert(
            "max_allowed_packet",
            uint(config.network.max_allowed_packet as u64),
        );
        set.values.insert(
            "max_execution_time",
            uint(u64::from(config.limits.max_execution_time_ms)),
        );
        set.values.insert(
            "max_running_reads",
            uint(config.limits.max_running_reads as u64),
        );
        set.values.insert(
            "max_running_writes",
            uint(config.limits.max_running_writes as u64),
        );
        set.values.insert(
            "min_examined_row_limit",
            uint(config.logging.min_examined_row_limit),
        );
        set.values.insert(
            "net_read_timeout",
            uint(u64::from(config.network.net_read_timeout_secs)),
        );
        set.values.insert("read_only", flag(config.read_only.read_only));
        set.values.insert("slow_query_log", flag(config.logging.slow_log));
        set.values.insert(
            "sql_mode",
            Value::Text("STRICT_TRANS_TABLES,NO_ENGINE_SUBSTITUTION".to_string()),
        );
        set.values.insert("super_read_only", flag(config.read_only.super_read_only));
        set.values.insert("time_zone", Value::Text("SYSTEM".to_string()));
        set.values.insert(
            "transaction_isolation",
            Value::Text(IsolationLevel::default().name().to_string()),
        );
        set.values.insert("transaction_read_only", Value::Integer(0));
        set.values.insert("version", Value::Text(SERVER_VERSION.to_string()));
        set.values.insert(
            "version_comment",
            Value::Text(format!("myrustql {}", env!("CARGO_PKG_VERSION"))),
        );
        set.values.insert(
            "wait_timeout",
            uint(u64::from(config.network.wait_timeout_secs)),
        );
        set
    }

    /// A new session's copy: every variable that has a session value.
    #[must_use]
    pub fn session_from(globals: &Self) -> Self {
        let values = globals
            .values
            .iter()
            .filter(|(name, _)| lookup(name).is_some_and(VarDef::has_session))
            .map(|(name, value)| (*name, value.clone()))
            .collect();
        Self { values }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        let def = lookup(name)?;
        self.values.get(def.name)
    }

    pub fn set(&mut self, def: &'static VarDef, value: Value) {
        self.values.insert(def.name, value);
    }

    #[must_use]
    pub fn get_u64(&self, name: &str) -> u64 {
        self.get(name)
            .and_then(Value::as_int)
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_u32(&self, name: &str) -> u32 {
        u32::try_from(self.get_u64(name)).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> bool {
        self.get_u64(name) != 0
    }

    #[must_use]
    pub fn get_f64(&self, name: &str) -> f64 {
        match self.get(name) {
            Some(Value::Real(r)) => *r,
            Some(Value::Integer(i)) => *i as f64,
            _ => 0.0,
        }
    }

    /// Name/value pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(name, value)| (*name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_sorted() {
        assert!(VARIABLES.windows(2).all(|w| w[0].name < w[1].name));
    }

    #[test]
    fn test_lookup_aliases() {
        assert_eq!(lookup("TX_ISOLATION").unwrap().name, "transaction_isolation");
        assert_eq!(lookup("autocommit").unwrap().ty, VarType::Bool);
        assert!(lookup("no_such_thing").is_none());
    }

    #[test]
    fn test_coerce() {
        let autocommit = lookup("autocommit").unwrap();
        assert_eq!(autocommit.coerce(&Value::Text("off".into())).unwrap(), Value::Integer(0));
        assert_eq!(autocommit.coerce(&Value::Integer(1)).unwrap(), Value::Integer(1));
        assert!(matches!(
            autocommit.coerce(&Value::Integer(7)),
            Err(ServerError::WrongValueForVariable { .. })
        ));

        let iso = lookup("transaction_isolation").unwrap();
        assert_eq!(
            iso.coerce(&Value::Text("read-committed".into())).unwrap(),
            Value::Text("READ-COMMITTED".into())
        );

        let timeout = lookup("max_execution_time").unwrap();
        assert!(timeout.coerce(&Value::Integer(-1)).is_err());
    }

    #[test]
    fn test_session_copy_skips_global_only() {
        let globals = VariableSet::globals(&ServerConfig::default());
        let session = VariableSet::session_from(&globals);
        assert!(session.get("read_only").is_none());
        assert_eq!(session.get_u64("lock_wait_timeout"), 50);
        assert!(session.get_bool("autocommit"));
        assert_eq!(globals.get("version").and_then(Value::as_text), Some(SERVER_VERSION));
    }
}
