/// Scalar evaluation that needs session state
///
/// Implements what the engine cannot resolve on its own:
/// - `@@var`, `@@global.var` - system variables
/// - `@name` - user variables
/// - `SLEEP(n)` - interruptible by KILL and the statement timer
/// - `CONNECTION_ID()`, `DATABASE()`, `USER()`, `VERSION()`, `NOW()`,
///   `LAST_INSERT_ID()`, `ROW_COUNT()`
use std::collections::HashMap;
use std::time::Duration;

use crate::core::{ServerError, ServerInstance, User, Value};
use crate::network::constants::SERVER_VERSION;
use crate::parser::Expr;
use crate::session::variables::lookup;
use crate::session::{KillToken, Session, StatementState, VariableSet};
use crate::transaction::TransactionState;

/// Borrowed view of everything a scalar expression may read. Built from
/// disjoint session fields so the engine session can be borrowed mutably
/// at the same time.
pub struct ScalarScope<'a> {
    pub instance: &'a ServerInstance,
    pub session_id: u32,
    pub kill: &'a KillToken,
    pub user: &'a User,
    pub host: &'a str,
    pub db: Option<&'a str>,
    pub tx: &'a TransactionState,
    pub stmt: &'a StatementState,
    pub vars: &'a VariableSet,
    pub user_vars: &'a HashMap<String, Value>,
}

impl<'a> ScalarScope<'a> {
    #[must_use]
    pub fn of(instance: &'a ServerInstance, session: &'a Session) -> Self {
        Self {
            instance,
            session_id: session.id,
            kill: &session.kill,
            user: &session.conn.user,
            host: &session.conn.host,
            db: session.db.as_deref(),
            tx: &session.tx,
            stmt: &session.stmt,
            vars: &session.vars,
            user_vars: &session.user_vars,
        }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, ServerError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Column(name) => Err(ServerError::BadField {
                column: name.clone(),
                table: "field list".to_string(),
            }),
            Expr::Star => Err(ServerError::NoTablesUsed),
            Expr::CountStar => Ok(Value::Integer(1)),
            Expr::Sleep(secs) => {
                let secs = if secs.is_finite() { secs.max(0.0) } else { 0.0 };
                self.kill.sleep(Duration::from_secs_f64(secs))?;
                Ok(Value::Integer(0))
            }
            Expr::SystemVariable { global, name } => self.system_variable(*global, name),
            Expr::UserVariable(name) => Ok(self
                .user_vars
                .get(&name.to_lowercase())
                .cloned()
                .unwrap_or(Value::Null)),
            Expr::Function(name) => SystemFunctions::evaluate(name, self),
        }
    }

    fn system_variable(&self, global: bool, name: &str) -> Result<Value, ServerError> {
        let def = lookup(name).ok_or_else(|| ServerError::UnknownSystemVariable(name.to_string()))?;
        if global {
            if !def.has_global() {
                return Err(ServerError::SessionVariable(def.name.to_string()));
            }
            return Ok(self
                .instance
                .global_variables()
                .get(def.name)
                .cloned()
                .unwrap_or(Value::Null));
        }
        // transaction settings live in the transaction state
        match def.name {
            "autocommit" => return Ok(Value::Integer(i64::from(self.tx.autocommit()))),
            "transaction_read_only" => {
                return Ok(Value::Integer(i64::from(self.tx.session_read_only())));
            }
            "transaction_isolation" => {
                return Ok(Value::Text(self.tx.session_isolation().name().to_string()));
            }
            _ => {}
        }
        let value = if def.has_session() {
            self.vars.get(def.name).cloned()
        } else {
            self.instance.global_variables().get(def.name).cloned()
        };
        Ok(value.unwrap_or(Value::Null))
    }
}

pub struct SystemFunctions;

impl SystemFunctions {
    /// Check if function name is a system function
    #[must_use]
    pub fn is_system_function(name: &str) -> bool {
        matches!(
            name.to_uppercase().as_str(),
            "CONNECTION_ID"
                | "DATABASE"
                | "SCHEMA"
                | "USER"
                | "CURRENT_USER"
                | "SESSION_USER"
                | "SYSTEM_USER"
                | "VERSION"
                | "NOW"
                | "CURRENT_TIMESTAMP"
                | "LAST_INSERT_ID"
                | "ROW_COUNT"
        )
    }

    pub fn evaluate(name: &str, scope: &ScalarScope<'_>) -> Result<Value, ServerError> {
        let value = match name.to_uppercase().as_str() {
            "CONNECTION_ID" => Value::Integer(i64::from(scope.session_id)),
            "DATABASE" | "SCHEMA" => scope
                .db
                .map_or(Value::Null, |db| Value::Text(db.to_string())),
            "USER" | "CURRENT_USER" | "SESSION_USER" | "SYSTEM_USER" => {
                Value::Text(format!("{}@{}", scope.user.username, scope.host))
            }
            "VERSION" => Value::Text(SERVER_VERSION.to_string()),
            "NOW" | "CURRENT_TIMESTAMP" => Value::Text(
                chrono::Local::now()
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ),
            "LAST_INSERT_ID" => {
                Value::Integer(i64::try_from(scope.stmt.last_insert_id).unwrap_or(i64::MAX))
            }
            "ROW_COUNT" => Value::Integer(scope.stmt.row_count),
            _ => return Err(ServerError::NotSupported(format!("function {name}"))),
        };
        Ok(value)
    }
}
