/// Administrative statements
///
/// USE, SET (variables and transaction characteristics), account
/// management, GRANT/REVOKE, KILL, FLUSH and SHUTDOWN. Kinds the server
/// recognises but does not run (stored routines, replication, LOAD DATA)
/// also land here.
use tracing::info;

use crate::core::{PrivilegeScope, Privileges, ServerError, ServerInstance, Value};
use crate::dispatch::access::{
    check_db_access, check_global_access, check_kill_permission, check_privilege,
};
use crate::engine::ExecOutcome;
use crate::parser::{
    FlushTarget, StatementDescriptor, StatementKind, StatementParams, TxScope, VarAssignment,
    VarScope,
};
use crate::session::variables::{self, VarDef};
use crate::session::{KillState, Session, Warning};
use crate::transaction::{IsolationLevel, MdlKey};

use super::commit_transaction;

const ER_USER_ALREADY_EXISTS: u16 = 3163;
const ER_USER_DOES_NOT_EXIST: u16 = 3162;

/// A validated `SET` assignment, applied only once every assignment in
/// the statement has passed its checks.
enum Assignment {
    User(String, Value),
    Session(&'static VarDef, Value),
    Global(&'static VarDef, Value),
}

pub struct AdminExecutor;

impl AdminExecutor {
    pub fn use_database(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::UseDb(db) = &stmt.params else {
            return Err(ServerError::NoDatabaseSelected);
        };
        check_db_access(session, db)?;
        if !instance.engine.database_exists(db) {
            return Err(ServerError::UnknownDatabase(db.clone()));
        }
        session.set_db(Some(db.clone()));
        Ok(ExecOutcome::affected(0))
    }

    pub fn set_variables(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::Set(assignments) = &stmt.params else {
            return Err(ServerError::Internal("SET without assignments".to_string()));
        };
        let validated = assignments
            .iter()
            .map(|a| Self::validate(session, a))
            .collect::<Result<Vec<_>, _>>()?;

        for assignment in validated {
            match assignment {
                Assignment::User(name, value) => {
                    session.user_vars.insert(name, value);
                }
                Assignment::Global(def, value) => instance.set_global(def, value)?,
                Assignment::Session(def, value) => Self::set_session(session, def, value)?,
            }
        }
        Ok(ExecOutcome::affected(0))
    }

    fn validate(session: &Session, assignment: &VarAssignment) -> Result<Assignment, ServerError> {
        if assignment.scope == VarScope::User {
            return Ok(Assignment::User(
                assignment.name.to_lowercase(),
                assignment.value.clone(),
            ));
        }
        let def = variables::lookup(&assignment.name)
            .ok_or_else(|| ServerError::UnknownSystemVariable(assignment.name.clone()))?;
        if def.read_only {
            return Err(ServerError::ReadOnlyVariable(def.name.to_string()));
        }
        let value = def.coerce(&assignment.value)?;
        if assignment.scope == VarScope::Global {
            if !def.has_global() {
                return Err(ServerError::SessionVariable(def.name.to_string()));
            }
            check_global_access(session, Privileges::SUPER)?;
            Ok(Assignment::Global(def, value))
        } else {
            if !def.has_session() {
                return Err(ServerError::GlobalVariable(def.name.to_string()));
            }
            Ok(Assignment::Session(def, value))
        }
    }

    fn set_session(session: &mut Session, def: &'static VarDef, value: Value) -> Result<(), ServerError> {
        match def.name {
            "autocommit" => {
                let on = value.as_int() == Some(1);
                // switching on ends whatever the session had open; the same
                // value again is a no-op
                if on != session.tx.autocommit() {
                    if on {
                        session.tx.xa().ensure_closed()?;
                        if session.tx.in_multi_statement_mode() {
                            commit_transaction(session)?;
                        }
                    }
                    session.tx.set_autocommit(on);
                }
            }
            "transaction_read_only" => {
                let read_only = value.as_int() == Some(1);
                session.tx.set_session_characteristics(Some(read_only), None);
            }
            "transaction_isolation" => {
                let level = value.as_text().and_then(IsolationLevel::parse);
                session.tx.set_session_characteristics(None, level);
            }
            _ => {}
        }
        session.vars.set(def, value);
        Ok(())
    }

    /// `SET [GLOBAL | SESSION] TRANSACTION ...`.
    pub fn set_transaction(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::SetTransaction {
            scope,
            read_only,
            isolation,
        } = &stmt.params
        else {
            return Err(ServerError::Internal("SET TRANSACTION without options".to_string()));
        };
        let updates = characteristic_values(*read_only, *isolation);
        match scope {
            TxScope::Next => session.tx.set_next_characteristics(*read_only, *isolation)?,
            TxScope::Session => {
                session.tx.set_session_characteristics(*read_only, *isolation);
                for (def, value) in updates {
                    session.vars.set(def, value);
                }
            }
            TxScope::Global => {
                check_global_access(session, Privileges::SUPER)?;
                for (def, value) in updates {
                    instance.set_global(def, value)?;
                }
            }
        }
        Ok(ExecOutcome::affected(0))
    }

    /// `SET PASSWORD [FOR user] = '...'`.
    pub fn set_password(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::SetPassword { user, password } = &stmt.params else {
            return Err(ServerError::Internal("SET PASSWORD without a password".to_string()));
        };
        let target = user
            .clone()
            .unwrap_or_else(|| session.user().username.clone());
        Self::change_password(instance, session, &target, password)?;
        Ok(ExecOutcome::affected(0))
    }

    fn change_password(
        instance: &ServerInstance,
        session: &mut Session,
        target: &str,
        password: &str,
    ) -> Result<(), ServerError> {
        let own = target == session.user().username;
        if !own {
            check_global_access(session, Privileges::CREATE_USER)?;
        }
        instance.users.set_password(target, password)?;
        if own {
            session.refresh_user(instance);
        }
        info!(session = session.id(), user = target, "password changed");
        Ok(())
    }

    /// CREATE USER / DROP USER / ALTER USER.
    pub fn account(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        match &stmt.params {
            StatementParams::CreateUser {
                user,
                password,
                if_not_exists,
            } => {
                check_global_access(session, Privileges::CREATE_USER)?;
                if *if_not_exists && instance.users.exists(user) {
                    return Ok(ExecOutcome::affected(0).with_warning(Warning::note(
                        ER_USER_ALREADY_EXISTS,
                        format!("Authorization ID '{user}' already exists."),
                    )));
                }
                instance.users.create_user(
                    user,
                    password.as_deref().unwrap_or_default(),
                    Privileges::NONE,
                )?;
                info!(session = session.id(), user = %user, "user created");
            }
            StatementParams::DropUser { user, if_exists } => {
                check_global_access(session, Privileges::CREATE_USER)?;
                if *if_exists && !instance.users.exists(user) {
                    return Ok(ExecOutcome::affected(0).with_warning(Warning::note(
                        ER_USER_DOES_NOT_EXIST,
                        format!("Authorization ID '{user}' does not exist."),
                    )));
                }
                instance.users.drop_user(user)?;
                info!(session = session.id(), user = %user, "user dropped");
            }
            StatementParams::AlterUser {
                user,
                password,
                expire,
            } => {
                if let Some(password) = password {
                    Self::change_password(instance, session, user, password)?;
                }
                if *expire {
                    check_global_access(session, Privileges::CREATE_USER)?;
                    instance.users.expire_password(user)?;
                    if *user == session.user().username {
                        session.refresh_user(instance);
                    }
                }
            }
            _ => return Err(ServerError::Internal(format!("{} without an account", stmt.kind.name()))),
        }
        Ok(ExecOutcome::affected(0))
    }

    /// GRANT / REVOKE on `*.*` or `db.*`.
    pub fn grant(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::Grant {
            privileges,
            db,
            table,
            user,
        } = &stmt.params
        else {
            return Err(ServerError::Internal(format!("{} without privileges", stmt.kind.name())));
        };
        if table.is_some() {
            return Err(ServerError::NotSupported("table-level privileges".to_string()));
        }
        let scope = db
            .as_deref()
            .map_or(PrivilegeScope::Global, PrivilegeScope::Database);
        check_privilege(session, *privileges | Privileges::GRANT, scope)?;
        if !instance.users.exists(user) {
            return Err(ServerError::CannotUser {
                op: stmt.kind.name().to_string(),
                user: user.clone(),
            });
        }
        if stmt.kind == StatementKind::Revoke {
            instance.users.revoke(user, *privileges, db.as_deref())?;
        } else {
            instance.users.grant(user, *privileges, db.as_deref())?;
        }
        info!(
            session = session.id(),
            kind = stmt.kind.name(),
            user = %user,
            privileges = %privileges,
            db = db.as_deref().unwrap_or("*"),
            "privileges changed"
        );
        Ok(ExecOutcome::affected(0))
    }

    /// `KILL [QUERY | CONNECTION] id`.
    pub fn kill(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::Kill { id, query_only } = &stmt.params else {
            return Err(ServerError::Internal("KILL without an id".to_string()));
        };
        Self::kill_session(instance, session, *id, *query_only)?;
        Ok(ExecOutcome::affected(0))
    }

    /// Shared with COM_PROCESS_KILL. Killing oneself reports the kill at
    /// once instead of an OK.
    pub fn kill_session(
        instance: &ServerInstance,
        session: &Session,
        id: u32,
        query_only: bool,
    ) -> Result<(), ServerError> {
        let target = instance
            .registry
            .get(id)
            .ok_or(ServerError::NoSuchThread(id))?;
        check_kill_permission(session, &target)?;
        let state = if query_only {
            KillState::QueryKilled
        } else {
            KillState::ConnectionKilled
        };
        target.kill.kill(state);
        info!(session = session.id(), target = id, ?state, "kill requested");
        if id == session.id() {
            return Err(state.error().unwrap_or(ServerError::QueryInterrupted));
        }
        Ok(())
    }

    pub fn flush(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::Flush(targets) = &stmt.params else {
            return Err(ServerError::Internal("FLUSH without targets".to_string()));
        };
        check_global_access(session, Privileges::RELOAD)?;
        for target in targets {
            match target {
                FlushTarget::Tables => {
                    let handlers = std::mem::take(&mut session.handlers);
                    for handler in handlers.values() {
                        session
                            .mdl
                            .release_explicit(&MdlKey::table(&handler.db, &handler.table));
                    }
                }
                FlushTarget::Status => {
                    instance.status.flush();
                    session.counters.slow_queries = 0;
                    session.counters.statements.iter_mut().for_each(|c| *c = 0);
                }
                FlushTarget::Privileges => session.refresh_user(instance),
                FlushTarget::Logs => {}
            }
            info!(session = session.id(), ?target, "flush");
        }
        Ok(ExecOutcome::affected(0))
    }

    /// SHUTDOWN statement. The reply still goes out; the other sessions are
    /// killed and the listener stops.
    pub fn shutdown(
        instance: &ServerInstance,
        session: &mut Session,
        _stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        check_global_access(session, Privileges::SHUTDOWN)?;
        instance.request_shutdown(Some(session.id()));
        Ok(ExecOutcome::affected(0))
    }

    pub fn unsupported(
        _instance: &ServerInstance,
        _session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        Err(ServerError::NotSupported(stmt.kind.name().to_string()))
    }
}

fn characteristic_values(
    read_only: Option<bool>,
    isolation: Option<IsolationLevel>,
) -> Vec<(&'static VarDef, Value)> {
    let mut values = Vec::new();
    if let (Some(ro), Some(def)) = (read_only, variables::lookup("transaction_read_only")) {
        values.push((def, Value::Integer(i64::from(ro))));
    }
    if let (Some(level), Some(def)) = (isolation, variables::lookup("transaction_isolation")) {
        values.push((def, Value::Text(level.name().to_string())));
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServerConfig;
    use crate::executor::execute;
    use crate::network::response::ResponseBuffer;
    use crate::parser::parse_statement;

    fn run(instance: &ServerInstance, s: &mut Session, sql: &str) -> Result<(), ServerError> {
        let stmt = parse_statement(sql).unwrap();
        s.diagnostics.reset();
        execute(instance, s, &stmt, &mut ResponseBuffer::new())
    }

    fn root(instance: &ServerInstance) -> Session {
        let mut s = instance
            .open_session(instance.users.get("root").unwrap(), "localhost", 0)
            .unwrap();
        s.set_db(Some("test".to_string()));
        s
    }

    #[test]
    fn test_set_autocommit_is_idempotent() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        run(&instance, &mut s, "CREATE TABLE t1 (a)").unwrap();
        run(&instance, &mut s, "BEGIN").unwrap();
        run(&instance, &mut s, "INSERT INTO t1 VALUES (1)").unwrap();

        // already on: the open transaction survives
        run(&instance, &mut s, "SET autocommit = 1").unwrap();
        run(&instance, &mut s, "SET autocommit = 1").unwrap();
        assert!(s.transaction().is_explicit());
        run(&instance, &mut s, "ROLLBACK").unwrap();

        run(&instance, &mut s, "SET autocommit = 0").unwrap();
        let once = (s.transaction().autocommit(), s.status());
        run(&instance, &mut s, "SET autocommit = 0").unwrap();
        assert_eq!((s.transaction().autocommit(), s.status()), once);
        assert_eq!(s.variables().get("autocommit"), Some(&Value::Integer(0)));
    }

    #[test]
    fn test_autocommit_on_commits_pending_work() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        run(&instance, &mut s, "CREATE TABLE t1 (a)").unwrap();
        run(&instance, &mut s, "SET autocommit = OFF").unwrap();
        run(&instance, &mut s, "INSERT INTO t1 VALUES (1)").unwrap();
        assert!(s.mdl().count(crate::transaction::MdlDuration::Transaction) > 0);

        run(&instance, &mut s, "SET autocommit = ON").unwrap();
        assert!(s.mdl().is_empty());
        run(&instance, &mut s, "ROLLBACK").unwrap();

        let mut other = root(&instance);
        let stmt = parse_statement("SELECT * FROM t1").unwrap();
        let mut out = ResponseBuffer::new();
        execute(&instance, &mut other, &stmt, &mut out).unwrap();
        let rows = out.last().and_then(|r| r.result_set()).map(|rs| rs.row_count());
        assert_eq!(rows, Some(1));
    }

    #[test]
    fn test_set_checks_every_assignment_first() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        let err = run(&instance, &mut s, "SET @a = 1, no_such_variable = 2").unwrap_err();
        assert_eq!(err, ServerError::UnknownSystemVariable("no_such_variable".to_string()));
        assert!(s.user_variable("a").is_none());

        assert!(matches!(
            run(&instance, &mut s, "SET version = 'x'"),
            Err(ServerError::ReadOnlyVariable(_))
        ));
        run(&instance, &mut s, "SET GLOBAL autocommit = 1").unwrap();
        assert!(matches!(
            run(&instance, &mut s, "SET max_running_reads = 3"),
            Err(ServerError::GlobalVariable(_))
        ));
        assert!(matches!(
            run(&instance, &mut s, "SET autocommit = 'maybe'"),
            Err(ServerError::WrongValueForVariable { .. })
        ));
    }

    #[test]
    fn test_set_global_needs_super() {
        let instance = ServerInstance::new(ServerConfig::default());
        instance.users.create_user("app", "", Privileges::NONE).unwrap();
        let mut s = instance
            .open_session(instance.users.get("app").unwrap(), "localhost", 0)
            .unwrap();
        assert!(matches!(
            run(&instance, &mut s, "SET GLOBAL read_only = 1"),
            Err(ServerError::SpecificAccessDenied(_))
        ));
        assert_eq!(instance.read_only_mode(), (false, false));

        let mut r = root(&instance);
        run(&instance, &mut r, "SET GLOBAL super_read_only = ON").unwrap();
        assert_eq!(instance.read_only_mode(), (true, true));
        run(&instance, &mut r, "SET GLOBAL read_only = OFF").unwrap();
        assert_eq!(instance.read_only_mode(), (false, false));
    }

    #[test]
    fn test_set_transaction_scopes() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        run(&instance, &mut s, "SET TRANSACTION READ ONLY").unwrap();
        assert!(s.transaction().is_read_only());
        assert!(!s.transaction().session_read_only());

        run(&instance, &mut s, "SET SESSION TRANSACTION ISOLATION LEVEL SERIALIZABLE").unwrap();
        assert_eq!(s.transaction().session_isolation(), IsolationLevel::Serializable);
        assert_eq!(
            s.variables().get("transaction_isolation"),
            Some(&Value::Text("SERIALIZABLE".to_string()))
        );

        run(&instance, &mut s, "BEGIN").unwrap();
        assert_eq!(
            run(&instance, &mut s, "SET TRANSACTION READ WRITE"),
            Err(ServerError::TxCharacteristicsLocked)
        );
    }

    #[test]
    fn test_accounts_and_grants() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        run(&instance, &mut s, "CREATE USER 'dave' IDENTIFIED BY 'pw'").unwrap();
        assert!(instance.users.exists("dave"));

        run(&instance, &mut s, "CREATE USER IF NOT EXISTS 'dave'").unwrap();
        assert_eq!(s.diagnostics().warning_count(), 1);
        assert!(matches!(
            run(&instance, &mut s, "CREATE USER 'dave'"),
            Err(ServerError::CannotUser { .. })
        ));

        run(&instance, &mut s, "GRANT SELECT, INSERT ON test.* TO 'dave'").unwrap();
        let dave = instance.users.get("dave").unwrap();
        assert!(
            dave.privileges_in(PrivilegeScope::Database("test"))
                .contains(Privileges::SELECT | Privileges::INSERT)
        );
        run(&instance, &mut s, "REVOKE INSERT ON test.* FROM 'dave'").unwrap();
        let dave = instance.users.get("dave").unwrap();
        assert!(!dave.privileges_in(PrivilegeScope::Database("test")).contains(Privileges::INSERT));

        run(&instance, &mut s, "DROP USER 'dave'").unwrap();
        run(&instance, &mut s, "DROP USER IF EXISTS 'dave'").unwrap();
        assert!(!instance.users.exists("dave"));
    }

    #[test]
    fn test_expired_password_reset_by_owner() {
        let instance = ServerInstance::new(ServerConfig::default());
        instance.users.create_user("erin", "old", Privileges::NONE).unwrap();
        instance.users.expire_password("erin").unwrap();
        let mut s = instance
            .open_session(instance.users.get("erin").unwrap(), "localhost", 0)
            .unwrap();

        assert_eq!(
            run(&instance, &mut s, "SELECT 1"),
            Err(ServerError::MustChangePassword)
        );
        run(&instance, &mut s, "SET PASSWORD = 'new'").unwrap();
        run(&instance, &mut s, "SELECT 1").unwrap();
        assert!(instance.users.get("erin").unwrap().verify_password("new"));
    }

    #[test]
    fn test_kill_other_and_self() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut a = root(&instance);
        let b = root(&instance);

        run(&instance, &mut a, &format!("KILL QUERY {}", b.id())).unwrap();
        assert_eq!(b.kill_token().state(), KillState::QueryKilled);

        assert_eq!(
            run(&instance, &mut a, "KILL 99999"),
            Err(ServerError::NoSuchThread(99999))
        );

        let own = format!("KILL {}", a.id());
        assert_eq!(run(&instance, &mut a, &own), Err(ServerError::QueryInterrupted));
        assert!(a.kill_token().is_connection_killed());
    }

    #[test]
    fn test_kill_denied_for_other_users() {
        let instance = ServerInstance::new(ServerConfig::default());
        instance.users.create_user("app", "", Privileges::NONE).unwrap();
        let victim = root(&instance);
        let mut s = instance
            .open_session(instance.users.get("app").unwrap(), "localhost", 0)
            .unwrap();
        assert_eq!(
            run(&instance, &mut s, &format!("KILL {}", victim.id())),
            Err(ServerError::KillDenied(victim.id()))
        );
        assert!(!victim.kill_token().is_killed());
    }

    #[test]
    fn test_use_and_unsupported() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        assert!(matches!(
            run(&instance, &mut s, "USE nowhere"),
            Err(ServerError::UnknownDatabase(_))
        ));
        assert_eq!(s.db(), Some("test"));
        assert!(matches!(
            run(&instance, &mut s, "CALL p()"),
            Err(ServerError::NotSupported(_))
        ));
    }
}
