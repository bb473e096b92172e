use std::ops::{BitOr, BitOrAssign};

/// Privilege bitset, MySQL ACL style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Privileges(u32);

impl Privileges {
    pub const NONE: Self = Self(0);
    pub const SELECT: Self = Self(1 << 0);
    pub const INSERT: Self = Self(1 << 1);
    pub const UPDATE: Self = Self(1 << 2);
    pub const DELETE: Self = Self(1 << 3);
    pub const CREATE: Self = Self(1 << 4);
    pub const DROP: Self = Self(1 << 5);
    pub const RELOAD: Self = Self(1 << 6);
    pub const SHUTDOWN: Self = Self(1 << 7);
    pub const PROCESS: Self = Self(1 << 8);
    pub const GRANT: Self = Self(1 << 9);
    pub const INDEX: Self = Self(1 << 10);
    pub const ALTER: Self = Self(1 << 11);
    /// Also bypasses `read_only` and admission ceilings.
    pub const SUPER: Self = Self(1 << 12);
    pub const CREATE_TMP_TABLE: Self = Self(1 << 13);
    pub const LOCK_TABLES: Self = Self(1 << 14);
    pub const CREATE_USER: Self = Self(1 << 15);

    /// Grantable on a single database.
    pub const DB_ALL: Self = Self(
        Self::SELECT.0
            | Self::INSERT.0
            | Self::UPDATE.0
            | Self::DELETE.0
            | Self::CREATE.0
            | Self::DROP.0
            | Self::INDEX.0
            | Self::ALTER.0
            | Self::CREATE_TMP_TABLE.0
            | Self::LOCK_TABLES.0,
    );

    pub const ALL: Self = Self((1 << 16) - 1);

    const NAMES: [(Self, &'static str); 16] = [
        (Self::SELECT, "SELECT"),
        (Self::INSERT, "INSERT"),
        (Self::UPDATE, "UPDATE"),
        (Self::DELETE, "DELETE"),
        (Self::CREATE, "CREATE"),
        (Self::DROP, "DROP"),
        (Self::RELOAD, "RELOAD"),
        (Self::SHUTDOWN, "SHUTDOWN"),
        (Self::PROCESS, "PROCESS"),
        (Self::GRANT, "GRANT OPTION"),
        (Self::INDEX, "INDEX"),
        (Self::ALTER, "ALTER"),
        (Self::SUPER, "SUPER"),
        (Self::CREATE_TMP_TABLE, "CREATE TEMPORARY TABLES"),
        (Self::LOCK_TABLES, "LOCK TABLES"),
        (Self::CREATE_USER, "CREATE USER"),
    ];

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Parses a privilege name as written in GRANT.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_uppercase();
        let normalized = upper.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.as_str() {
            "ALL" | "ALL PRIVILEGES" => Some(Self::ALL),
            "USAGE" => Some(Self::NONE),
            "CREATE TEMPORARY TABLES" | "CREATE TEMPORARY TABLE" => Some(Self::CREATE_TMP_TABLE),
            "GRANT OPTION" | "GRANT" => Some(Self::GRANT),
            other => Self::NAMES
                .iter()
                .find(|(_, n)| *n == other)
                .map(|(p, _)| *p),
        }
    }

    /// Names of the set bits, for error messages.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(p, _)| self.contains(*p))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl BitOr for Privileges {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Privileges {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for Privileges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("USAGE");
        }
        f.write_str(&self.names().join(", "))
    }
}

/// Where a privilege is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeScope<'a> {
    Global,
    Database(&'a str),
    Table { db: &'a str, table: &'a str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_union() {
        let p = Privileges::SELECT | Privileges::INSERT;
        assert!(p.contains(Privileges::SELECT));
        assert!(!p.contains(Privileges::SELECT | Privileges::DELETE));
        assert!(p.intersects(Privileges::SELECT | Privileges::DELETE));
        assert!(Privileges::ALL.contains(Privileges::SUPER));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Privileges::from_name("select"), Some(Privileges::SELECT));
        assert_eq!(Privileges::from_name("ALL PRIVILEGES"), Some(Privileges::ALL));
        assert_eq!(
            Privileges::from_name("create   temporary tables"),
            Some(Privileges::CREATE_TMP_TABLE)
        );
        assert_eq!(Privileges::from_name("FLY"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Privileges::NONE.to_string(), "USAGE");
        assert_eq!((Privileges::SELECT | Privileges::SUPER).to_string(), "SELECT, SUPER");
    }
}
