use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::ServerError;

/// Kill state of a session, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum KillState {
    NotKilled = 0,
    QueryKilled = 1,
    /// The statement timer fired.
    QueryTimedOut = 2,
    ConnectionKilled = 3,
}

impl KillState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotKilled,
            1 => Self::QueryKilled,
            2 => Self::QueryTimedOut,
            _ => Self::ConnectionKilled,
        }
    }

    /// Error reported by the statement that observes this state.
    #[must_use]
    pub const fn error(self) -> Option<ServerError> {
        match self {
            Self::NotKilled => None,
            Self::QueryTimedOut => Some(ServerError::QueryTimeout),
            Self::QueryKilled | Self::ConnectionKilled => Some(ServerError::QueryInterrupted),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: AtomicU8,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cancellation flag shared between a session and whoever may kill it
/// (KILL from another session, the statement timer, shutdown).
///
/// A kill never downgrades: a connection kill stays a connection kill even
/// if a query kill arrives later.
#[derive(Debug, Clone, Default)]
pub struct KillToken {
    inner: Arc<Inner>,
}

impl KillToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> KillState {
        KillState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.state() != KillState::NotKilled
    }

    #[must_use]
    pub fn is_connection_killed(&self) -> bool {
        self.state() == KillState::ConnectionKilled
    }

    /// Raises the kill state; returns false when it was already at least as
    /// severe.
    pub fn kill(&self, state: KillState) -> bool {
        let raised = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (state as u8 > current).then_some(state as u8)
            })
            .is_ok();
        if raised {
            let _guard = self.inner.lock.lock();
            self.inner.wake.notify_all();
        }
        raised
    }

    /// Clears a query-level kill. Called at the start of each command; a
    /// connection kill is never cleared.
    pub fn reset_query(&self) {
        let _ = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current == KillState::QueryKilled as u8
                    || current == KillState::QueryTimedOut as u8)
                    .then_some(KillState::NotKilled as u8)
            });
    }

    /// Cooperative cancellation point.
    pub fn check(&self) -> Result<(), ServerError> {
        match self.state().error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Sleeps for `duration` unless killed first.
    pub fn sleep(&self, duration: Duration) -> Result<(), ServerError> {
        let deadline = Instant::now() + duration;
        let mut guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| ServerError::Internal("kill token poisoned".into()))?;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (next, _) = self
                .inner
                .wake
                .wait_timeout(guard, deadline - now)
                .map_err(|_| ServerError::Internal("kill token poisoned".into()))?;
            guard = next;
        }
    }
}
