//! Metadata locks: serialise DDL against concurrent users of the same
//! schema object.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::{ServerError, Timeout};
use crate::session::KillToken;

/// How often a waiter re-checks its kill token.
const KILL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MdlKey {
    Schema(String),
    Table { db: String, name: String },
}

impl MdlKey {
    #[must_use]
    pub fn table(db: &str, name: &str) -> Self {
        Self::Table {
            db: db.to_lowercase(),
            name: name.to_lowercase(),
        }
    }

    #[must_use]
    pub fn schema(db: &str) -> Self {
        Self::Schema(db.to_lowercase())
    }
}

impl std::fmt::Display for MdlKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(db) => write!(f, "{db}"),
            Self::Table { db, name } => write!(f, "{db}.{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MdlMode {
    /// Readers.
    Shared,
    /// DML writers; compatible with readers and other writers.
    SharedWrite,
    /// DDL and LOCK TABLES ... WRITE.
    Exclusive,
}

impl MdlMode {
    const fn compatible(self, other: Self) -> bool {
        !matches!(self, Self::Exclusive) && !matches!(other, Self::Exclusive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdlDuration {
    /// Released when the statement ends.
    Statement,
    /// Released when the transaction ends.
    Transaction,
    /// Released explicitly (LOCK TABLES, HANDLER).
    Explicit,
}

impl MdlDuration {
    /// A lock held for `self` is still held whenever one for `other` would be.
    const fn covers(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::Statement, Self::Statement)
                | (Self::Transaction, Self::Statement | Self::Transaction)
                | (Self::Explicit, Self::Statement | Self::Explicit)
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Grant {
    owner: u32,
    mode: MdlMode,
}

/// Process-wide lock table.
#[derive(Debug, Default)]
pub struct MdlManager {
    grants: Mutex<HashMap<MdlKey, Vec<Grant>>>,
    released: Condvar,
}

impl MdlManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<MdlKey, Vec<Grant>>>, ServerError> {
        self.grants
            .lock()
            .map_err(|_| ServerError::Internal("metadata lock table poisoned".into()))
    }

    /// Blocks until `mode` can be granted on `key`. A session never conflicts
    /// with its own grants.
    pub fn acquire(
        &self,
        owner: u32,
        key: &MdlKey,
        mode: MdlMode,
        timeout: Timeout,
        kill: &KillToken,
    ) -> Result<(), ServerError> {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut table = self.table()?;
        loop {
            let grantable = table.get(key).is_none_or(|grants| {
                grants
                    .iter()
                    .all(|g| g.owner == owner || g.mode.compatible(mode))
            });
            if grantable {
                table
                    .entry(key.clone())
                    .or_default()
                    .push(Grant { owner, mode });
                return Ok(());
            }

            kill.check()?;
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(owner, %key, ?mode, "metadata lock wait timed out");
                        return Err(ServerError::LockWaitTimeout);
                    }
                    (deadline - now).min(KILL_POLL)
                }
                None => KILL_POLL,
            };
            let (next, _) = self
                .released
                .wait_timeout(table, wait)
                .map_err(|_| ServerError::Internal("metadata lock table poisoned".into()))?;
            table = next;
        }
    }

    pub fn release(&self, owner: u32, key: &MdlKey, mode: MdlMode) {
        let Ok(mut table) = self.table() else {
            return;
        };
        if let Some(grants) = table.get_mut(key) {
            if let Some(pos) = grants.iter().position(|g| g.owner == owner && g.mode == mode) {
                grants.swap_remove(pos);
            }
            if grants.is_empty() {
                table.remove(key);
            }
        }
        drop(table);
        self.released.notify_all();
    }

    /// Number of grants on `key`, across all owners.
    #[must_use]
    pub fn holders(&self, key: &MdlKey) -> usize {
        self.table().map_or(0, |t| t.get(key).map_or(0, Vec::len))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    key: MdlKey,
    mode: MdlMode,
    duration: MdlDuration,
}

/// Locks held by one session. Everything still held is released on drop.
#[derive(Debug)]
pub struct MdlContext {
    owner: u32,
    manager: Arc<MdlManager>,
    tickets: Vec<Ticket>,
}

impl MdlContext {
    #[must_use]
    pub fn new(owner: u32, manager: Arc<MdlManager>) -> Self {
        Self {
            owner,
            manager,
            tickets: Vec::new(),
        }
    }

    /// Takes `mode` on `key` unless a ticket already held covers it. A weaker
    /// ticket of the same duration is upgraded in place.
    pub fn acquire(
        &mut self,
        key: MdlKey,
        mode: MdlMode,
        duration: MdlDuration,
        timeout: Timeout,
        kill: &KillToken,
    ) -> Result<(), ServerError> {
        if self
            .tickets
            .iter()
            .any(|t| t.key == key && t.mode >= mode && t.duration.covers(duration))
        {
            return Ok(());
        }
        self.manager.acquire(self.owner, &key, mode, timeout, kill)?;

        let weaker = self
            .tickets
            .iter_mut()
            .find(|t| t.key == key && t.duration == duration && t.mode < mode);
        match weaker {
            Some(ticket) => {
                self.manager.release(self.owner, &ticket.key, ticket.mode);
                ticket.mode = mode;
            }
            None => self.tickets.push(Ticket {
                key,
                mode,
                duration,
            }),
        }
        Ok(())
    }

    fn release_where(&mut self, mut pred: impl FnMut(&Ticket) -> bool) -> usize {
        let mut released = 0;
        let manager = Arc::clone(&self.manager);
        let owner = self.owner;
        self.tickets.retain(|t| {
            if pred(t) {
                manager.release(owner, &t.key, t.mode);
                released += 1;
                false
            } else {
                true
            }
        });
        released
    }

    pub fn release_statement_locks(&mut self) -> usize {
        self.release_where(|t| t.duration == MdlDuration::Statement)
    }

    /// Statement and transaction locks; explicit ones survive.
    pub fn release_transactional_locks(&mut self) -> usize {
        self.release_where(|t| t.duration != MdlDuration::Explicit)
    }

    pub fn release_explicit(&mut self, key: &MdlKey) -> usize {
        self.release_where(|t| t.duration == MdlDuration::Explicit && &t.key == key)
    }

    pub fn release_all_explicit(&mut self) -> usize {
        self.release_where(|t| t.duration == MdlDuration::Explicit)
    }

    pub fn release_all(&mut self) -> usize {
        self.release_where(|_| true)
    }

    #[must_use]
    pub fn holds(&self, key: &MdlKey) -> bool {
        self.tickets.iter().any(|t| &t.key == key)
    }

    #[must_use]
    pub fn count(&self, duration: MdlDuration) -> usize {
        self.tickets.iter().filter(|t| t.duration == duration).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

impl Drop for MdlContext {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::KillState;
    use std::thread;

    fn key() -> MdlKey {
        MdlKey::table("shop", "items")
    }

    #[test]
    fn test_shared_locks_coexist() {
        let manager = Arc::new(MdlManager::new());
        let kill = KillToken::new();
        let mut a = MdlContext::new(1, Arc::clone(&manager));
        let mut b = MdlContext::new(2, Arc::clone(&manager));
        a.acquire(key(), MdlMode::Shared, MdlDuration::Statement, Timeout::from_millis(10), &kill)
            .unwrap();
        b.acquire(key(), MdlMode::SharedWrite, MdlDuration::Transaction, Timeout::from_millis(10), &kill)
            .unwrap();
        assert_eq!(manager.holders(&key()), 2);
    }

    #[test]
    fn test_exclusive_times_out_against_reader() {
        let manager = Arc::new(MdlManager::new());
        let kill = KillToken::new();
        let mut reader = MdlContext::new(1, Arc::clone(&manager));
        let mut ddl = MdlContext::new(2, Arc::clone(&manager));
        reader
            .acquire(key(), MdlMode::Shared, MdlDuration::Transaction, Timeout::infinite(), &kill)
            .unwrap();
        let err = ddl
            .acquire(key(), MdlMode::Exclusive, MdlDuration::Statement, Timeout::from_millis(30), &kill)
            .unwrap_err();
        assert_eq!(err, ServerError::LockWaitTimeout);

        reader.release_transactional_locks();
        ddl.acquire(key(), MdlMode::Exclusive, MdlDuration::Statement, Timeout::from_millis(30), &kill)
            .unwrap();
    }

    #[test]
    fn test_own_locks_never_conflict() {
        let manager = Arc::new(MdlManager::new());
        let kill = KillToken::new();
        let mut ctx = MdlContext::new(7, manager);
        ctx.acquire(key(), MdlMode::Shared, MdlDuration::Transaction, Timeout::from_millis(0), &kill)
            .unwrap();
        ctx.acquire(key(), MdlMode::Exclusive, MdlDuration::Statement, Timeout::from_millis(0), &kill)
            .unwrap();
        assert_eq!(ctx.release_statement_locks(), 1);
        assert_eq!(ctx.release_transactional_locks(), 1);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_held_ticket_is_reused() {
        let manager = Arc::new(MdlManager::new());
        let kill = KillToken::new();
        let mut ctx = MdlContext::new(7, Arc::clone(&manager));
        for _ in 0..100 {
            ctx.acquire(key(), MdlMode::Shared, MdlDuration::Transaction, Timeout::infinite(), &kill)
                .unwrap();
        }
        assert_eq!(ctx.count(MdlDuration::Transaction), 1);
        assert_eq!(manager.holders(&key()), 1);

        // an explicit lock already outlives the statement
        ctx.acquire(key(), MdlMode::Exclusive, MdlDuration::Explicit, Timeout::infinite(), &kill)
            .unwrap();
        ctx.acquire(key(), MdlMode::SharedWrite, MdlDuration::Statement, Timeout::infinite(), &kill)
            .unwrap();
        assert_eq!(ctx.count(MdlDuration::Statement), 0);
        assert_eq!(manager.holders(&key()), 2);
    }

    #[test]
    fn test_stronger_mode_upgrades_ticket() {
        let manager = Arc::new(MdlManager::new());
        let kill = KillToken::new();
        let mut ctx = MdlContext::new(7, Arc::clone(&manager));
        ctx.acquire(key(), MdlMode::Shared, MdlDuration::Transaction, Timeout::infinite(), &kill)
            .unwrap();
        ctx.acquire(key(), MdlMode::SharedWrite, MdlDuration::Transaction, Timeout::infinite(), &kill)
            .unwrap();
        assert_eq!(ctx.count(MdlDuration::Transaction), 1);
        assert_eq!(manager.holders(&key()), 1);

        // the upgraded grant still blocks DDL from another session
        let mut ddl = MdlContext::new(8, Arc::clone(&manager));
        let err = ddl
            .acquire(key(), MdlMode::Exclusive, MdlDuration::Statement, Timeout::from_millis(20), &kill)
            .unwrap_err();
        assert_eq!(err, ServerError::LockWaitTimeout);
        ctx.release_transactional_locks();
        assert_eq!(manager.holders(&key()), 0);
    }

    #[test]
    fn test_wait_interrupted_by_kill() {
        let manager = Arc::new(MdlManager::new());
        let holder_kill = KillToken::new();
        let mut holder = MdlContext::new(1, Arc::clone(&manager));
        holder
            .acquire(key(), MdlMode::Exclusive, MdlDuration::Explicit, Timeout::infinite(), &holder_kill)
            .unwrap();

        let kill = KillToken::new();
        let killer = kill.clone();
        let waiter = thread::spawn(move || {
            let mut ctx = MdlContext::new(2, manager);
            ctx.acquire(key(), MdlMode::Shared, MdlDuration::Statement, Timeout::infinite(), &kill)
        });
        thread::sleep(Duration::from_millis(60));
        killer.kill(KillState::QueryKilled);
        assert_eq!(waiter.join().unwrap().unwrap_err(), ServerError::QueryInterrupted);
    }

    #[test]
    fn test_drop_releases_everything() {
        let manager = Arc::new(MdlManager::new());
        let kill = KillToken::new();
        {
            let mut ctx = MdlContext::new(1, Arc::clone(&manager));
            ctx.acquire(key(), MdlMode::Exclusive, MdlDuration::Explicit, Timeout::infinite(), &kill)
                .unwrap();
        }
        assert_eq!(manager.holders(&key()), 0);
    }
}
