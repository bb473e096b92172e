/// Transaction control
///
/// BEGIN / COMMIT / ROLLBACK with their chain and release options,
/// savepoints, XA branches and LOCK TABLES. Every path that ends a
/// transaction goes through `commit_transaction` / `rollback_transaction`
/// so the transaction state and the transactional metadata locks always
/// end together.
use tracing::debug;

use crate::core::{PrivilegeScope, Privileges, ServerError, ServerInstance};
use crate::dispatch::access::{check_privilege, check_table_access};
use crate::engine::ExecOutcome;
use crate::network::response::ResultSet;
use crate::parser::{Completion, StatementDescriptor, StatementKind, StatementParams, TableLockType};
use crate::session::{LockedTable, Session, Warning};
use crate::transaction::{MdlDuration, MdlKey, MdlMode, XaState};

use super::{commit_transaction, lock_wait_timeout, rollback_transaction};

pub struct TransactionExecutor;

impl TransactionExecutor {
    /// BEGIN / START TRANSACTION. Commits whatever was open and leaves
    /// LOCK TABLES mode first.
    pub fn begin(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let read_only = match &stmt.params {
            StatementParams::Begin { read_only, .. } => *read_only,
            _ => None,
        };
        session.tx.xa().ensure_closed()?;
        Self::leave_lock_tables_mode(session);
        commit_transaction(session)?;

        session.tx.begin(read_only);
        session.engine.begin()?;
        debug!(session = session.id, read_only = session.tx.is_read_only(), "transaction started");
        Ok(ExecOutcome::affected(0))
    }

    pub fn commit(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        session.tx.xa().ensure_closed()?;
        let completion = completion(stmt);
        let read_only = session.tx.is_explicit().then(|| session.tx.is_read_only());
        commit_transaction(session)?;
        Self::complete(session, completion, read_only)?;
        Ok(ExecOutcome::affected(0))
    }

    pub fn rollback(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        session.tx.xa().ensure_closed()?;
        let completion = completion(stmt);
        let read_only = session.tx.is_explicit().then(|| session.tx.is_read_only());
        rollback_transaction(session);
        Self::complete(session, completion, read_only)?;
        Ok(ExecOutcome::affected(0))
    }

    /// AND CHAIN starts a new transaction with the same access mode;
    /// RELEASE ends the connection after the reply.
    fn complete(
        session: &mut Session,
        completion: Completion,
        read_only: Option<bool>,
    ) -> Result<(), ServerError> {
        if completion.chain {
            session.tx.begin(read_only);
            session.engine.begin()?;
        }
        if completion.release {
            session.release_requested = true;
        }
        Ok(())
    }

    pub fn savepoint(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        session.engine.savepoint(savepoint_name(stmt)?)?;
        Ok(ExecOutcome::affected(0))
    }

    pub fn rollback_to_savepoint(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let report = session.engine.rollback_to_savepoint(savepoint_name(stmt)?)?;
        let outcome = ExecOutcome::affected(0);
        if report.unsafe_tables {
            return Ok(outcome.with_warning(Warning::unsafe_rollback()));
        }
        Ok(outcome)
    }

    pub fn release_savepoint(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        session.engine.release_savepoint(savepoint_name(stmt)?)?;
        Ok(ExecOutcome::affected(0))
    }

    /// LOCK TABLES: replaces any previous lock list. The metadata locks are
    /// explicit so they survive COMMIT until UNLOCK TABLES.
    pub fn lock_tables(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        let StatementParams::LockTables(modes) = &stmt.params else {
            return Err(ServerError::Internal("LOCK TABLES without lock list".to_string()));
        };
        check_table_access(session, Privileges::SELECT, &stmt.tables)?;
        Self::leave_lock_tables_mode(session);

        let timeout = lock_wait_timeout(&session.vars);
        let mut locked = Vec::with_capacity(stmt.tables.len());
        for (table, mode) in stmt.tables.iter().zip(modes) {
            let db = table
                .db
                .clone()
                .or_else(|| session.db.clone())
                .ok_or(ServerError::NoDatabaseSelected)?;
            let result = if session.engine.is_temporary(&db, &table.name) {
                Ok(())
            } else {
                check_privilege(session, Privileges::LOCK_TABLES, PrivilegeScope::Database(&db))
                    .and_then(|()| {
                        if instance.engine.table_exists(&db, &table.name) {
                            Ok(())
                        } else {
                            Err(ServerError::NoSuchTable {
                                db: db.clone(),
                                table: table.name.clone(),
                            })
                        }
                    })
                    .and_then(|()| {
                        let mdl_mode = match mode {
                            TableLockType::Read => MdlMode::Shared,
                            TableLockType::Write => MdlMode::Exclusive,
                        };
                        session.mdl.acquire(
                            MdlKey::table(&db, &table.name),
                            mdl_mode,
                            MdlDuration::Explicit,
                            timeout,
                            &session.kill,
                        )
                    })
            };
            if let Err(e) = result {
                for l in &locked {
                    release_table_lock(session, l);
                }
                return Err(e);
            }
            locked.push(LockedTable {
                db,
                table: table.name.clone(),
                lock: *mode,
            });
        }
        debug!(session = session.id, tables = locked.len(), "LOCK TABLES");
        session.locked_tables = Some(locked);
        Ok(ExecOutcome::affected(0))
    }

    /// UNLOCK TABLES commits when it actually leaves LOCK TABLES mode.
    pub fn unlock_tables(
        _instance: &ServerInstance,
        session: &mut Session,
        _stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        if session.locked_tables.is_some() {
            commit_transaction(session)?;
            Self::leave_lock_tables_mode(session);
        }
        Ok(ExecOutcome::affected(0))
    }

    fn leave_lock_tables_mode(session: &mut Session) {
        if let Some(locked) = session.locked_tables.take() {
            for l in &locked {
                release_table_lock(session, l);
            }
        }
    }

    /// XA START / END / PREPARE / COMMIT / ROLLBACK / RECOVER.
    pub fn xa(
        _instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        if stmt.kind == StatementKind::XaRecover {
            return Ok(Self::xa_recover(session));
        }
        let StatementParams::Xa { xid, one_phase } = &stmt.params else {
            return Err(ServerError::Internal("XA statement without xid".to_string()));
        };
        let state = session.tx.xa().clone();
        let rm_fail = ServerError::XaRmFail(state.name().to_string());
        if state.xid().is_some_and(|current| current != xid.as_str()) {
            return Err(ServerError::XaNota);
        }

        match (stmt.kind, &state) {
            (StatementKind::XaStart, XaState::NotStarted) => {
                if session.tx.is_explicit() || session.locked_tables.is_some() {
                    return Err(ServerError::XaOutside);
                }
                commit_transaction(session)?;
                session.tx.begin(None);
                session.engine.begin()?;
                session.tx.set_xa(XaState::Active(xid.clone()));
            }
            (StatementKind::XaEnd, XaState::Active(x)) => session.tx.set_xa(XaState::Idle(x.clone())),
            (StatementKind::XaPrepare, XaState::Idle(x)) => {
                session.tx.set_xa(XaState::Prepared(x.clone()));
            }
            (StatementKind::XaCommit, XaState::Idle(_)) if *one_phase => commit_transaction(session)?,
            (StatementKind::XaCommit, XaState::Prepared(_)) if !*one_phase => {
                commit_transaction(session)?;
            }
            (StatementKind::XaRollback, XaState::Idle(_) | XaState::Prepared(_)) => {
                rollback_transaction(session);
            }
            (StatementKind::XaStart, _) => return Err(rm_fail),
            (_, XaState::NotStarted) => return Err(ServerError::XaNota),
            _ => return Err(rm_fail),
        }
        debug!(session = session.id, xa = session.tx.xa().name(), "XA state");
        Ok(ExecOutcome::affected(0))
    }

    /// Lists this session's prepared branch, if any.
    fn xa_recover(session: &Session) -> ExecOutcome {
        let mut result =
            ResultSet::with_column_names(&["formatID", "gtrid_length", "bqual_length", "data"]);
        if let XaState::Prepared(xid) = session.tx.xa() {
            result.push_row(vec![
                Some("1".to_string()),
                Some(xid.len().to_string()),
                Some("0".to_string()),
                Some(xid.clone()),
            ]);
        }
        ExecOutcome::rows(result, 0)
    }
}

fn completion(stmt: &StatementDescriptor) -> Completion {
    match &stmt.params {
        StatementParams::Completion(c) => *c,
        _ => Completion::default(),
    }
}

fn savepoint_name(stmt: &StatementDescriptor) -> Result<&str, ServerError> {
    match &stmt.params {
        StatementParams::Savepoint(name) => Ok(name),
        _ => Err(ServerError::Internal("savepoint statement without a name".to_string())),
    }
}

fn release_table_lock(session: &mut Session, locked: &LockedTable) {
    session
        .mdl
        .release_explicit(&MdlKey::table(&locked.db, &locked.table));
}
