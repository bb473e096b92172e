//! Access-control gate shared by the command dispatcher and the statement
//! handlers.

use crate::core::{PrivilegeScope, Privileges, ServerError};
use crate::parser::TableRef;
use crate::session::{Session, SessionHandle};

/// Fails unless the session holds every bit of `required` in `scope`.
pub fn check_privilege(
    session: &Session,
    required: Privileges,
    scope: PrivilegeScope<'_>,
) -> Result<(), ServerError> {
    let granted = session.user().privileges_in(scope);
    if granted.contains(required) {
        return Ok(());
    }
    let user = session.user().username.clone();
    let host = session.host().to_string();
    Err(match scope {
        PrivilegeScope::Global => ServerError::SpecificAccessDenied(required.to_string()),
        PrivilegeScope::Database(db) => ServerError::DbAccessDenied {
            user,
            host,
            db: db.to_string(),
        },
        PrivilegeScope::Table { table, .. } => ServerError::TableAccessDenied {
            command: required
                .difference(granted)
                .names()
                .first()
                .copied()
                .unwrap_or("ANY")
                .to_string(),
            user,
            host,
            table: table.to_string(),
        },
    })
}

/// Passes when the session holds at least one of `any_of` globally.
pub fn check_global_access(session: &Session, any_of: Privileges) -> Result<(), ServerError> {
    if session.user().global_privileges.intersects(any_of) {
        Ok(())
    } else {
        Err(ServerError::SpecificAccessDenied(any_of.to_string()))
    }
}

/// USE / COM_INIT_DB: any privilege on the database will do.
pub fn check_db_access(session: &Session, db: &str) -> Result<(), ServerError> {
    if session.user().has_any_on_db(db) {
        Ok(())
    } else {
        Err(ServerError::DbAccessDenied {
            user: session.user().username.clone(),
            host: session.host().to_string(),
            db: db.to_string(),
        })
    }
}

/// Checks `required` on every table of a statement. Temporary tables
/// belong to the session and are not checked.
pub fn check_table_access(
    session: &Session,
    required: Privileges,
    tables: &[TableRef],
) -> Result<(), ServerError> {
    for table in tables {
        let db = match table.db.as_deref().or(session.db()) {
            Some(db) => db,
            None => return Err(ServerError::NoDatabaseSelected),
        };
        if table.temporary || session.engine.is_temporary(db, &table.name) {
            continue;
        }
        check_privilege(
            session,
            required,
            PrivilegeScope::Table {
                db,
                table: &table.name,
            },
        )?;
    }
    Ok(())
}

/// Own connections may always be killed; others need SUPER.
pub fn check_kill_permission(session: &Session, target: &SessionHandle) -> Result<(), ServerError> {
    if target.id == session.id()
        || session.is_super()
        || target.user() == session.user().username
    {
        Ok(())
    } else {
        Err(ServerError::KillDenied(target.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ServerConfig, ServerInstance};

    fn instance_with_bob() -> ServerInstance {
        let instance = ServerInstance::new(ServerConfig::default());
        instance.users.create_user("bob", "pw", Privileges::NONE).unwrap();
        instance
            .users
            .grant("bob", Privileges::SELECT, Some("test"))
            .unwrap();
        instance
    }

    #[test]
    fn test_scope_specific_errors() {
        let instance = instance_with_bob();
        let bob = instance
            .open_session(instance.users.get("bob").unwrap(), "localhost", 0)
            .unwrap();

        assert!(check_privilege(&bob, Privileges::SELECT, PrivilegeScope::Database("test")).is_ok());
        assert!(matches!(
            check_privilege(&bob, Privileges::SHUTDOWN, PrivilegeScope::Global),
            Err(ServerError::SpecificAccessDenied(_))
        ));
        assert!(matches!(
            check_privilege(&bob, Privileges::INSERT, PrivilegeScope::Database("test")),
            Err(ServerError::DbAccessDenied { .. })
        ));
        let err = check_privilege(
            &bob,
            Privileges::INSERT,
            PrivilegeScope::Table { db: "test", table: "t1" },
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "INSERT command denied to user 'bob'@'localhost' for table 't1'"
        );
    }

    #[test]
    fn test_db_access_and_global_any_of() {
        let instance = instance_with_bob();
        let bob = instance
            .open_session(instance.users.get("bob").unwrap(), "localhost", 0)
            .unwrap();
        assert!(check_db_access(&bob, "test").is_ok());
        assert!(check_db_access(&bob, "mysql").is_err());
        assert!(check_global_access(&bob, Privileges::SUPER | Privileges::RELOAD).is_err());
    }

    #[test]
    fn test_kill_permission() {
        let instance = instance_with_bob();
        let root = instance
            .open_session(instance.users.get("root").unwrap(), "localhost", 0)
            .unwrap();
        let bob = instance
            .open_session(instance.users.get("bob").unwrap(), "localhost", 0)
            .unwrap();
        let bob_again = instance
            .open_session(instance.users.get("bob").unwrap(), "localhost", 0)
            .unwrap();

        let root_handle = instance.registry.get(root.id()).unwrap();
        let bob_handle = instance.registry.get(bob_again.id()).unwrap();
        assert!(matches!(
            check_kill_permission(&bob, &root_handle),
            Err(ServerError::KillDenied(_))
        ));
        assert!(check_kill_permission(&bob, &bob_handle).is_ok());
        assert!(check_kill_permission(&root, &bob_handle).is_ok());
    }
}
