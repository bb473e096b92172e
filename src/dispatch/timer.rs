//! Statement timer: marks a session's query killed once its deadline passes.
//!
//! One background thread serves every armed timer. Arming returns a guard;
//! dropping the guard disarms the timer if it has not fired yet.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::session::{KillState, KillToken};

#[derive(Debug, Default)]
struct Timers {
    /// (deadline, timer id) -> token to kill
    armed: BTreeMap<(Instant, u64), KillToken>,
    next_id: u64,
    stopping: bool,
}

#[derive(Debug, Default)]
struct Shared {
    timers: Mutex<Timers>,
    changed: Condvar,
}

#[derive(Debug)]
pub struct TimerService {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService {
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("statement-timer".to_string())
            .spawn(move || run(&worker_shared))
            .map_err(|e| warn!(error = %e, "statement timer thread not started"))
            .ok();
        Self { shared, worker }
    }

    /// Kills the query behind `kill` with `QueryTimedOut` after `after`.
    pub fn arm(&self, after: Duration, kill: &KillToken) -> TimerGuard {
        let deadline = Instant::now() + after;
        let Ok(mut timers) = self.shared.timers.lock() else {
            return TimerGuard {
                shared: Arc::clone(&self.shared),
                key: None,
            };
        };
        let id = timers.next_id;
        timers.next_id += 1;
        timers.armed.insert((deadline, id), kill.clone());
        drop(timers);
        self.shared.changed.notify_all();
        TimerGuard {
            shared: Arc::clone(&self.shared),
            key: Some((deadline, id)),
        }
    }

    #[must_use]
    pub fn armed(&self) -> usize {
        self.shared.timers.lock().map_or(0, |t| t.armed.len())
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.shared.timers.lock() {
            timers.stopping = true;
        }
        self.shared.changed.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(shared: &Shared) {
    let Ok(mut timers) = shared.timers.lock() else {
        return;
    };
    loop {
        if timers.stopping {
            return;
        }
        let now = Instant::now();
        while let Some(entry) = timers.armed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let kill = entry.remove();
            if kill.kill(KillState::QueryTimedOut) {
                debug!("statement timer fired");
            }
        }
        let wait = timers
            .armed
            .keys()
            .next()
            .map_or(Duration::from_secs(3600), |(deadline, _)| {
                deadline.saturating_duration_since(now)
            });
        timers = match shared.changed.wait_timeout(timers, wait) {
            Ok((guard, _)) => guard,
            Err(_) => return,
        };
    }
}

/// Disarms its timer when dropped.
#[derive(Debug)]
pub struct TimerGuard {
    shared: Arc<Shared>,
    key: Option<(Instant, u64)>,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Ok(mut timers) = self.shared.timers.lock() {
                timers.armed.remove(&key);
            }
        }
    }
}
