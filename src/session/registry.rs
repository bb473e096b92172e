//! Live sessions, for the process list, KILL and shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::info;

use super::kill::{KillState, KillToken};
use crate::core::ServerError;

/// What other sessions may see of a session: `SHOW PROCESSLIST` row data.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub user: String,
    pub host: String,
    pub db: Option<String>,
    pub command: &'static str,
    pub state: &'static str,
    pub info: Option<String>,
    pub since: Instant,
}

impl ProcessInfo {
    #[must_use]
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
            db: None,
            command: "Sleep",
            state: "",
            info: None,
            since: Instant::now(),
        }
    }
}

/// Registry entry. Cloning it is cheap: the kill token and process info
/// are shared with the owning session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u32,
    pub kill: KillToken,
    info: Arc<Mutex<ProcessInfo>>,
    /// Raised by the packet reader while the connection waits for a command.
    idle: Arc<AtomicBool>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(id: u32, kill: KillToken, info: Arc<Mutex<ProcessInfo>>) -> Self {
        Self {
            id,
            kill,
            info,
            idle: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn idle_marker(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.idle)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// Snapshot of the process info; `None` if its lock is poisoned.
    #[must_use]
    pub fn info(&self) -> Option<ProcessInfo> {
        self.info.lock().ok().map(|i| i.clone())
    }

    #[must_use]
    pub fn user(&self) -> String {
        self.info().map(|i| i.user).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU32,
    sessions: Mutex<BTreeMap<u32, SessionHandle>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> Result<MutexGuard<'_, BTreeMap<u32, SessionHandle>>, ServerError> {
        self.sessions
            .lock()
            .map_err(|_| ServerError::Internal("session registry poisoned".into()))
    }

    /// Connection id for a new connection; sent in the initial handshake.
    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, handle: SessionHandle) -> Result<(), ServerError> {
        self.sessions()?.insert(handle.id, handle);
        Ok(())
    }

    pub fn unregister(&self, id: u32) {
        if let Ok(mut sessions) = self.sessions() {
            sessions.remove(&id);
        }
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<SessionHandle> {
        self.sessions().ok()?.get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().map(|s| s.len()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of every live session, ordered by id.
    #[must_use]
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions not parked waiting for their next command.
    #[must_use]
    pub fn running(&self) -> usize {
        self.handles().iter().filter(|h| !h.is_idle()).count()
    }

    pub fn kill(&self, id: u32, state: KillState) -> Result<(), ServerError> {
        let handle = self.get(id).ok_or(ServerError::NoSuchThread(id))?;
        handle.kill.kill(state);
        Ok(())
    }

    /// Used by shutdown. Returns how many sessions were signalled.
    pub fn kill_all(&self, state: KillState, except: Option<u32>) -> usize {
        let handles = self.handles();
        let mut killed = 0;
        for handle in handles.iter().filter(|h| Some(h.id) != except) {
            if handle.kill.kill(state) {
                killed += 1;
            }
        }
        info!(killed, "signalled sessions");
        killed
    }
}

/// Unregisters the session when dropped.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<SessionRegistry>,
    id: u32,
}

impl Registration {
    pub fn new(registry: Arc<SessionRegistry>, handle: SessionHandle) -> Result<Self, ServerError> {
        let id = handle.id;
        registry.register(handle)?;
        Ok(Self { registry, id })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(registry: &SessionRegistry, user: &str) -> SessionHandle {
        let id = registry.allocate_id();
        SessionHandle::new(
            id,
            KillToken::new(),
            Arc::new(Mutex::new(ProcessInfo::new(user, "localhost"))),
        )
    }

    #[test]
    fn test_registration_is_scoped() {
        let registry = Arc::new(SessionRegistry::new());
        let h = handle(&registry, "alice");
        let id = h.id;
        {
            let _reg = Registration::new(Arc::clone(&registry), h).unwrap();
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.get(id).unwrap().user(), "alice");
        }
        assert!(registry.is_empty());
        assert_eq!(registry.kill(id, KillState::QueryKilled), Err(ServerError::NoSuchThread(id)));
    }

    #[test]
    fn test_kill_all_skips_caller() {
        let registry = Arc::new(SessionRegistry::new());
        let a = handle(&registry, "a");
        let b = handle(&registry, "b");
        let (a_kill, b_kill, a_id) = (a.kill.clone(), b.kill.clone(), a.id);
        let _ra = Registration::new(Arc::clone(&registry), a).unwrap();
        let _rb = Registration::new(Arc::clone(&registry), b).unwrap();

        assert_eq!(registry.kill_all(KillState::ConnectionKilled, Some(a_id)), 1);
        assert!(!a_kill.is_killed());
        assert!(b_kill.is_connection_killed());
    }

    #[test]
    fn test_running_skips_idle_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let a = handle(&registry, "a");
        let idle = a.idle_marker();
        let _ra = Registration::new(Arc::clone(&registry), a).unwrap();
        let _rb = Registration::new(Arc::clone(&registry), handle(&registry, "b")).unwrap();
        assert_eq!(registry.running(), 2);
        idle.store(true, Ordering::Relaxed);
        assert_eq!(registry.running(), 1);
    }
}
