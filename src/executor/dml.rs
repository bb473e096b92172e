/// DML (Data Manipulation Language) operations
///
/// INSERT, REPLACE, UPDATE, DELETE. Privileges are checked here; rows are
/// changed by the engine session under the statement transaction the
/// dispatcher opened.
use crate::core::{Privileges, ServerError, ServerInstance};
use crate::dispatch::access::check_table_access;
use crate::engine::ExecOutcome;
use crate::parser::{StatementDescriptor, StatementKind, StatementParams};
use crate::session::Session;

use super::run_engine;

pub struct DmlExecutor;

impl DmlExecutor {
    pub fn execute(
        instance: &ServerInstance,
        session: &mut Session,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        check_table_access(session, Self::required_privileges(stmt), &stmt.tables)?;
        run_engine(instance, session, stmt)
    }

    /// REPLACE may delete; a WHERE clause reads.
    fn required_privileges(stmt: &StatementDescriptor) -> Privileges {
        let filtered = match &stmt.params {
            StatementParams::Update(p) => p.filter.is_some(),
            StatementParams::Delete { filter } => filter.is_some(),
            _ => false,
        };
        let base = match stmt.kind {
            StatementKind::Insert => Privileges::INSERT,
            StatementKind::Replace => Privileges::INSERT | Privileges::DELETE,
            StatementKind::Update => Privileges::UPDATE,
            _ => Privileges::DELETE,
        };
        if filtered {
            base | Privileges::SELECT
        } else {
            base
        }
    }
}
