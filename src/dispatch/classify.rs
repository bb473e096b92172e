//! Behaviour flags per command code and per statement kind.
//!
//! Both tables are filled once when the `ServerInstance` is built and only
//! read afterwards.

use std::ops::{BitOr, BitOrAssign};

use crate::network::constants::Command;
use crate::parser::StatementKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Self = Self(0);
    /// Not counted in Questions.
    pub const SKIP_ACCOUNTING: Self = Self(1 << 0);
    pub const CHANGES_DATA: Self = Self(1 << 1);
    /// Produces row or schema change events (Com_change_events).
    pub const CAN_GENERATE_CHANGE_EVENTS: Self = Self(1 << 2);
    /// Commits the open transaction before and after running.
    pub const AUTO_COMMIT_BOUNDARY: Self = Self(1 << 3);
    pub const DISALLOWED_IN_READONLY_TXN: Self = Self(1 << 4);
    pub const PREOPEN_TEMP_TABLES: Self = Self(1 << 5);
    pub const CLOSE_OPEN_HANDLES_FIRST: Self = Self(1 << 6);
    /// Reports on the previous statement; keeps its diagnostics.
    pub const DIAGNOSTIC_STATEMENT: Self = Self(1 << 7);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for Flags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationTable {
    commands: [Flags; 256],
    statements: [Flags; StatementKind::COUNT],
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassificationTable {
    #[must_use]
    pub fn new() -> Self {
        let mut commands = [Flags::NONE; 256];
        for cmd in [
            Command::Statistics,
            Command::Ping,
            Command::StmtPrepare,
            Command::StmtClose,
            Command::StmtReset,
        ] {
            commands[usize::from(cmd.code())] |= Flags::SKIP_ACCOUNTING;
        }

        let statements = StatementKind::ALL.map(statement_flags);
        Self {
            commands,
            statements,
        }
    }

    #[must_use]
    pub const fn command(&self, code: u8) -> Flags {
        self.commands[code as usize]
    }

    #[must_use]
    pub const fn statement(&self, kind: StatementKind) -> Flags {
        self.statements[kind.index()]
    }
}

fn statement_flags(kind: StatementKind) -> Flags {
    use StatementKind as K;

    let data_change = Flags::CHANGES_DATA | Flags::CAN_GENERATE_CHANGE_EVENTS;
    let ddl = data_change
        | Flags::AUTO_COMMIT_BOUNDARY
        | Flags::DISALLOWED_IN_READONLY_TXN
        | Flags::CLOSE_OPEN_HANDLES_FIRST;

    match kind {
        K::Insert | K::Replace | K::Update | K::Delete => {
            data_change | Flags::DISALLOWED_IN_READONLY_TXN | Flags::PREOPEN_TEMP_TABLES
        }
        K::LoadData => data_change | Flags::DISALLOWED_IN_READONLY_TXN,
        K::Select | K::Do | K::HaRead => Flags::PREOPEN_TEMP_TABLES,
        K::CreateTable | K::DropTable | K::Truncate => ddl | Flags::PREOPEN_TEMP_TABLES,
        K::AlterTable | K::RenameTable | K::CreateIndex | K::DropIndex => ddl,
        K::CreateDb | K::DropDb | K::AlterDb => ddl,
        K::CreateUser | K::DropUser | K::AlterUser | K::Grant | K::Revoke | K::SetPassword => {
            Flags::CHANGES_DATA | Flags::AUTO_COMMIT_BOUNDARY
        }
        K::CreateProcedure | K::DropProcedure => {
            Flags::CHANGES_DATA | Flags::AUTO_COMMIT_BOUNDARY
        }
        K::LockTables | K::Flush | K::StartSlave | K::StopSlave | K::ChangeMaster => {
            Flags::AUTO_COMMIT_BOUNDARY
        }
        K::Call => Flags::CHANGES_DATA,
        K::ShowWarnings | K::ShowErrors => Flags::DIAGNOSTIC_STATEMENT,
        _ => Flags::NONE,
    }
}
