use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::RwLock;

use super::error::ServerError;
use super::privilege::{PrivilegeScope, Privileges};

/// Database account.
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    /// `*` + upper-case hex of SHA1(SHA1(password)), empty for no password.
    pub password_hash: String,
    pub global_privileges: Privileges,
    /// Per-database grants: db name -> privileges
    pub db_privileges: HashMap<String, Privileges>,
    /// Only SET PASSWORD / ALTER USER run until the password changes.
    pub password_expired: bool,
}

impl User {
    #[must_use]
    pub fn new(username: String, password: &str, privileges: Privileges) -> Self {
        Self {
            username,
            password_hash: Self::hash_password(password),
            global_privileges: privileges,
            db_privileges: HashMap::new(),
            password_expired: false,
        }
    }

    /// mysql_native_password storage format.
    #[must_use]
    pub fn hash_password(password: &str) -> String {
        if password.is_empty() {
            return String::new();
        }
        let stage1 = Sha1::digest(password.as_bytes());
        let stage2 = Sha1::digest(stage1);
        format!("*{}", hex::encode_upper(stage2))
    }

    /// Checks a clear-text password.
    #[must_use]
    pub fn verify_password(&self, password: &str) -> bool {
        self.password_hash == Self::hash_password(password)
    }

    /// Checks a mysql_native_password scramble response against the stored hash.
    #[must_use]
    pub fn verify_scramble(&self, scramble: &[u8], token: &[u8]) -> bool {
        if self.password_hash.is_empty() {
            return token.is_empty();
        }
        if token.len() != 20 {
            return false;
        }
        let Ok(stage2) = hex::decode(self.password_hash.trim_start_matches('*')) else {
            return false;
        };

        let mut hasher = Sha1::new();
        hasher.update(scramble);
        hasher.update(&stage2);
        let mix = hasher.finalize();

        let candidate_stage1: Vec<u8> = token.iter().zip(mix.iter()).map(|(a, b)| a ^ b).collect();
        Sha1::digest(&candidate_stage1).as_slice() == stage2.as_slice()
    }

    pub fn set_password(&mut self, password: &str) {
        self.password_hash = Self::hash_password(password);
        self.password_expired = false;
    }

    /// Effective privileges in a scope: global grants plus database grants.
    #[must_use]
    pub fn privileges_in(&self, scope: PrivilegeScope<'_>) -> Privileges {
        match scope {
            PrivilegeScope::Global => self.global_privileges,
            PrivilegeScope::Database(db) | PrivilegeScope::Table { db, .. } => {
                let db_grant = self
                    .db_privileges
                    .get(&db.to_lowercase())
                    .copied()
                    .unwrap_or_default();
                self.global_privileges | db_grant
            }
        }
    }

    /// Any privilege at all on the database (needed for USE).
    #[must_use]
    pub fn has_any_on_db(&self, db: &str) -> bool {
        self.global_privileges.intersects(Privileges::DB_ALL)
            || self
                .db_privileges
                .get(&db.to_lowercase())
                .is_some_and(|p| !p.is_empty())
    }
}

/// Client scramble token for a clear-text password; used by tests and tools.
#[must_use]
pub fn scramble_password(scramble: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let mix = hasher.finalize();
    stage1.iter().zip(mix.iter()).map(|(a, b)| a ^ b).collect()
}

/// Account table shared by all sessions.
#[derive(Debug, Default)]
pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
}

impl UserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, username: &str) -> Option<User> {
        self.users
            .read()
            .ok()
            .and_then(|users| users.get(username).cloned())
    }

    #[must_use]
    pub fn exists(&self, username: &str) -> bool {
        self.get(username).is_some()
    }

    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        privileges: Privileges,
    ) -> Result<(), ServerError> {
        let mut users = self.write()?;
        if users.contains_key(username) {
            return Err(ServerError::CannotUser {
                op: "CREATE USER".to_string(),
                user: username.to_string(),
            });
        }
        users.insert(
            username.to_string(),
            User::new(username.to_string(), password, privileges),
        );
        Ok(())
    }

    pub fn drop_user(&self, username: &str) -> Result<(), ServerError> {
        let mut users = self.write()?;
        users
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| ServerError::CannotUser {
                op: "DROP USER".to_string(),
                user: username.to_string(),
            })
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<(), ServerError> {
        self.modify(username, |user| user.set_password(password))
            .map_err(|_| ServerError::PasswordNoMatch)
    }

    pub fn expire_password(&self, username: &str) -> Result<(), ServerError> {
        self.modify(username, |user| user.password_expired = true)
            .map_err(|_| ServerError::CannotUser {
                op: "ALTER USER".to_string(),
                user: username.to_string(),
            })
    }

    /// `db = None` grants globally.
    pub fn grant(
        &self,
        username: &str,
        privileges: Privileges,
        db: Option<&str>,
    ) -> Result<(), ServerError> {
        self.modify(username, |user| match db {
            None => user.global_privileges |= privileges,
            Some(db) => {
                *user.db_privileges.entry(db.to_lowercase()).or_default() |= privileges;
            }
        })
    }

    pub fn revoke(
        &self,
        username: &str,
        privileges: Privileges,
        db: Option<&str>,
    ) -> Result<(), ServerError> {
        self.modify(username, |user| match db {
            None => user.global_privileges = user.global_privileges.difference(privileges),
            Some(db) => {
                if let Some(p) = user.db_privileges.get_mut(&db.to_lowercase()) {
                    *p = p.difference(privileges);
                }
            }
        })
    }

    /// Checks a handshake response and returns the account on success.
    pub fn authenticate(
        &self,
        username: &str,
        scramble: &[u8],
        token: &[u8],
        host: &str,
    ) -> Result<User, ServerError> {
        let denied = || ServerError::AccessDenied {
            user: username.to_string(),
            host: host.to_string(),
            using_password: !token.is_empty(),
        };
        let user = self.get(username).ok_or_else(denied)?;
        if user.verify_scramble(scramble, token) {
            Ok(user)
        } else {
            Err(denied())
        }
    }

    fn modify(&self, username: &str, f: impl FnOnce(&mut User)) -> Result<(), ServerError> {
        let mut users = self.write()?;
        let user = users
            .get_mut(username)
            .ok_or_else(|| ServerError::CannotUser {
                op: "GRANT".to_string(),
                user: username.to_string(),
            })?;
        f(user);
        Ok(())
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, User>>, ServerError> {
        self.users
            .write()
            .map_err(|_| ServerError::Internal("user table lock poisoned".to_string()))
    }
}
