//! Table-granularity data locks held to transaction end, with waits-for
//! deadlock detection.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::{ServerError, Timeout};
use crate::session::KillToken;

const KILL_POLL: Duration = Duration::from_millis(25);

pub type LockKey = (String, String);

#[derive(Debug, Default)]
struct Entry {
    exclusive: Option<u32>,
    shared: HashSet<u32>,
}

impl Entry {
    fn blockers(&self, session: u32, exclusive: bool) -> HashSet<u32> {
        let mut out = HashSet::new();
        if let Some(owner) = self.exclusive {
            if owner != session {
                out.insert(owner);
            }
        }
        if exclusive {
            out.extend(self.shared.iter().copied().filter(|s| *s != session));
        }
        out
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<LockKey, Entry>,
    waits_for: HashMap<u32, HashSet<u32>>,
}

impl State {
    /// Is `target` reachable from `from` through the waits-for graph?
    fn reaches(&self, from: u32, target: u32) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = self.waits_for.get(&node) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<State>,
    released: Condvar,
}

impl LockTable {
    fn state(&self) -> Result<MutexGuard<'_, State>, ServerError> {
        self.state
            .lock()
            .map_err(|_| ServerError::Internal("data lock table poisoned".into()))
    }

    /// Waits for a shared or exclusive lock. `Deadlock` means this session
    /// closed a cycle and was chosen as the victim.
    pub fn acquire(
        &self,
        session: u32,
        key: &LockKey,
        exclusive: bool,
        timeout: Timeout,
        kill: &KillToken,
    ) -> Result<(), ServerError> {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut state = self.state()?;
        loop {
            let blockers = state
                .entries
                .get(key)
                .map(|e| e.blockers(session, exclusive))
                .unwrap_or_default();

            if blockers.is_empty() {
                state.waits_for.remove(&session);
                let entry = state.entries.entry(key.clone()).or_default();
                if exclusive {
                    entry.shared.remove(&session);
                    entry.exclusive = Some(session);
                } else if entry.exclusive != Some(session) {
                    entry.shared.insert(session);
                }
                return Ok(());
            }

            if blockers.iter().any(|b| state.reaches(*b, session)) {
                state.waits_for.remove(&session);
                info!(session, table = %format!("{}.{}", key.0, key.1), "deadlock detected, rolling back requester");
                return Err(ServerError::Deadlock);
            }
            state.waits_for.insert(session, blockers);

            if let Err(err) = kill.check() {
                state.waits_for.remove(&session);
                return Err(err);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waits_for.remove(&session);
                        debug!(session, "data lock wait timed out");
                        return Err(ServerError::LockWaitTimeout);
                    }
                    (deadline - now).min(KILL_POLL)
                }
                None => KILL_POLL,
            };
            let (next, _) = self
                .released
                .wait_timeout(state, wait)
                .map_err(|_| ServerError::Internal("data lock table poisoned".into()))?;
            state = next;
        }
    }

    pub fn release_all(&self, session: u32) {
        let Ok(mut state) = self.state() else {
            return;
        };
        state.entries.retain(|_, entry| {
            if entry.exclusive == Some(session) {
                entry.exclusive = None;
            }
            entry.shared.remove(&session);
            !entry.is_free()
        });
        state.waits_for.remove(&session);
        drop(state);
        self.released.notify_all();
    }

    /// Sessions holding any lock on `key`.
    #[must_use]
    pub fn holders(&self, key: &LockKey) -> Vec<u32> {
        let Ok(state) = self.state() else {
            return Vec::new();
        };
        state.entries.get(key).map_or_else(Vec::new, |e| {
            e.exclusive.into_iter().chain(e.shared.iter().copied()).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(name: &str) -> LockKey {
        ("db".to_string(), name.to_string())
    }

    #[test]
    fn test_shared_and_exclusive() {
        let table = LockTable::default();
        let kill = KillToken::new();
        table.acquire(1, &key("a"), false, Timeout::from_millis(10), &kill).unwrap();
        table.acquire(2, &key("a"), false, Timeout::from_millis(10), &kill).unwrap();
        let err = table
            .acquire(3, &key("a"), true, Timeout::from_millis(20), &kill)
            .unwrap_err();
        assert_eq!(err, ServerError::LockWaitTimeout);
        table.release_all(1);
        table.release_all(2);
        table.acquire(3, &key("a"), true, Timeout::from_millis(10), &kill).unwrap();
        assert_eq!(table.holders(&key("a")), vec![3]);
    }

    #[test]
    fn test_deadlock_victim_is_requester() {
        let table = Arc::new(LockTable::default());
        let kill = KillToken::new();
        table.acquire(1, &key("a"), true, Timeout::infinite(), &kill).unwrap();
        table.acquire(2, &key("b"), true, Timeout::infinite(), &kill).unwrap();

        let t = Arc::clone(&table);
        let waiter = thread::spawn(move || {
            let kill = KillToken::new();
            t.acquire(1, &key("b"), true, Timeout::from_seconds(5), &kill)
        });
        thread::sleep(Duration::from_millis(80));
        let err = table
            .acquire(2, &key("a"), true, Timeout::from_seconds(5), &kill)
            .unwrap_err();
        assert_eq!(err, ServerError::Deadlock);
        table.release_all(2);
        assert!(waiter.join().unwrap().is_ok());
    }
}
