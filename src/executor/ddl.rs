/// DDL (Data Definition Language) operations
///
/// CREATE/DROP/ALTER/RENAME/TRUNCATE TABLE, CREATE/DROP INDEX and the
/// database statements. The dispatcher has already committed the open
/// transaction and taken exclusive metadata locks by the time these run.
use tracing::info;

use crate::core::{DbReadOnly, PrivilegeScope, Privileges, ServerError, ServerInstance};
use crate::dispatch::access::{check_privilege, check_table_access};
use crate::engine::ExecOutcome;
use crate::parser::{StatementDescriptor, StatementKind, StatementParams, TableRef};
use crate::session::Session;

use super::run_engine;

pub struct DdlExecutor;

impl DdlExecutor {
    pub fn table_ddl(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        Self::check_table_privileges(session, stmt)?;
        let outcome = run_engine(instance, session, stmt)?;
        info!(
            session = session.id(),
            kind = stmt.kind.name(),
            tables = ?stmt.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "table DDL"
        );
        Ok(outcome)
    }

    fn check_table_privileges(session: &Session, stmt: &StatementDescriptor) -> Result<(), ServerError> {
        match stmt.kind {
            StatementKind::CreateTable => {
                let Some(table) = stmt.tables.first() else {
                    return Ok(());
                };
                if table.temporary {
                    let db = table
                        .db
                        .as_deref()
                        .or(session.db())
                        .ok_or(ServerError::NoDatabaseSelected)?;
                    check_privilege(
                        session,
                        Privileges::CREATE_TMP_TABLE,
                        PrivilegeScope::Database(db),
                    )
                } else {
                    check_table_access(session, Privileges::CREATE, &stmt.tables)
                }
            }
            StatementKind::DropTable | StatementKind::Truncate => {
                check_table_access(session, Privileges::DROP, &stmt.tables)
            }
            StatementKind::AlterTable => check_table_access(session, Privileges::ALTER, &stmt.tables),
            StatementKind::CreateIndex | StatementKind::DropIndex => {
                check_table_access(session, Privileges::INDEX, &stmt.tables)
            }
            StatementKind::RenameTable => {
                // tables come as old/new pairs
                let (old, new): (Vec<TableRef>, Vec<TableRef>) = stmt
                    .tables
                    .chunks(2)
                    .filter_map(|pair| match pair {
                        [from, to] => Some((from.clone(), to.clone())),
                        _ => None,
                    })
                    .unzip();
                check_table_access(session, Privileges::ALTER | Privileges::DROP, &old)?;
                check_table_access(session, Privileges::CREATE | Privileges::INSERT, &new)
            }
            _ => Ok(()),
        }
    }

    /// CREATE DATABASE / DROP DATABASE.
    pub fn database_ddl(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::Database { name, .. } = &stmt.params else {
            return Err(ServerError::Internal(format!("{} without a name", stmt.kind.name())));
        };
        let required = if stmt.kind == StatementKind::CreateDb {
            Privileges::CREATE
        } else {
            Privileges::DROP
        };
        check_privilege(session, required, PrivilegeScope::Database(name))?;

        let outcome = run_engine(instance, session, stmt)?;
        if stmt.kind == StatementKind::DropDb {
            instance.set_db_read_only(name, DbReadOnly::Off);
            if session.db().is_some_and(|db| db.eq_ignore_ascii_case(name)) {
                session.set_db(None);
            }
        }
        info!(session = session.id(), kind = stmt.kind.name(), db = %name, "database DDL");
        Ok(outcome)
    }

    /// `ALTER DATABASE [db] READ_ONLY = level`.
    pub fn alter_database(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::AlterDatabase { name, read_only } = &stmt.params else {
            return Err(ServerError::Internal("ALTER DATABASE without options".to_string()));
        };
        let db = name
            .as_deref()
            .or(session.db())
            .ok_or(ServerError::NoDatabaseSelected)?
            .to_string();
        check_privilege(session, Privileges::ALTER, PrivilegeScope::Database(&db))?;
        if !instance.engine.database_exists(&db) {
            return Err(ServerError::UnknownDatabase(db));
        }

        if let Some(level) = *read_only {
            let level = DbReadOnly::from_level(level).ok_or_else(|| {
                ServerError::WrongValueForVariable {
                    var: "READ_ONLY".to_string(),
                    value: level.to_string(),
                }
            })?;
            instance.set_db_read_only(&db, level);
            info!(session = session.id(), db = %db, level = level.level(), "database read-only level changed");
        }
        Ok(ExecOutcome::affected(1))
    }
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
    fn test_drop_current_database_clears_default() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        run(&instance, &mut s, "CREATE DATABASE shop").unwrap();
        run(&instance, &mut s, "USE shop").unwrap();
        assert_eq!(s.db(), Some("shop"));
        run(&instance, &mut s, "DROP DATABASE shop").unwrap();
        assert_eq!(s.db(), None);
        assert_eq!(
            run(&instance, &mut s, "CREATE TABLE t1 (a)").unwrap_err(),
            ServerError::NoDatabaseSelected
        );
    }

    #[test]
    fn test_alter_database_rejects_bad_level() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        assert!(matches!(
            run(&instance, &mut s, "ALTER DATABASE test READ_ONLY = 7"),
            Err(ServerError::WrongValueForVariable { .. })
        ));
        run(&instance, &mut s, "ALTER DATABASE test READ_ONLY = 1").unwrap();
        assert_eq!(instance.db_read_only("test"), DbReadOnly::ReadOnly);
        assert!(matches!(
            run(&instance, &mut s, "ALTER DATABASE nope READ_ONLY = 1"),
            Err(ServerError::UnknownDatabase(_))
        ));
    }

    #[test]
    fn test_temporary_table_needs_only_tmp_privilege() {
        let instance = ServerInstance::new(ServerConfig::default());
        instance.users.create_user("tmp", "", Privileges::NONE).unwrap();
        instance
            .users
            .grant("tmp", Privileges::CREATE_TMP_TABLE | Privileges::SELECT, Some("test"))
            .unwrap();
        let mut s = instance
            .open_session(instance.users.get("tmp").unwrap(), "localhost", 0)
            .unwrap();
        s.set_db(Some("test".to_string()));

        run(&instance, &mut s, "CREATE TEMPORARY TABLE scratch (a)").unwrap();
        run(&instance, &mut s, "INSERT INTO scratch VALUES (1)").unwrap();
        assert!(matches!(
            run(&instance, &mut s, "CREATE TABLE t1 (a)"),
            Err(ServerError::TableAccessDenied { .. })
        ));
    }

    #[test]
    fn test_ddl_commits_open_transaction() {
        let instance = ServerInstance::new(ServerConfig::default());
        let mut s = root(&instance);
        run(&instance, &mut s, "CREATE TABLE t1 (a)").unwrap();
        run(&instance, &mut s, "BEGIN").unwrap();
        run(&instance, &mut s, "INSERT INTO t1 VALUES (1)").unwrap();
        run(&instance, &mut s, "CREATE INDEX i1 ON t1 (a)").unwrap();
        run(&instance, &mut s, "ROLLBACK").unwrap();

        let mut other = root(&instance);
        let stmt = parse_statement("SELECT * FROM t1").unwrap();
        let mut out = ResponseBuffer::new();
        execute(&instance, &mut other, &stmt, &mut out).unwrap();
        let rows = out.last().and_then(|r| r.result_set()).map(|rs| rs.row_count());
        assert_eq!(rows, Some(1));
    }
}
