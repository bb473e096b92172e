use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use super::config::ServerConfig;
use super::error::ServerError;
use super::privilege::Privileges;
use super::user::{User, UserStore};
use super::value::Value;
use crate::dispatch::{Admission, ClassificationTable, GlobalStatus, TimerService};
use crate::engine::{Engine, MemoryEngine};
use crate::executor::HandlerTable;
use crate::session::{KillState, Session, SessionRegistry, VarDef, VariableSet};
use crate::transaction::MdlManager;

/// Per-database read-only level (`ALTER DATABASE ... READ_ONLY = n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbReadOnly {
    #[default]
    Off,
    /// Writes refused unless the session has SUPER.
    ReadOnly,
    /// Writes refused for everyone.
    SuperReadOnly,
}

impl DbReadOnly {
    #[must_use]
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Off),
            1 => Some(Self::ReadOnly),
            2 => Some(Self::SuperReadOnly),
            _ => None,
        }
    }

    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::ReadOnly => 1,
            Self::SuperReadOnly => 2,
        }
    }
}

/// Runtime context shared by every session: the collaborators, the
/// read-only lookup tables built at startup, and the server-wide counters.
///
/// Built once before the first connection is accepted and handed to the
/// dispatcher explicitly; nothing here is a process global.
pub struct ServerInstance {
    pub config: ServerConfig,
    pub users: UserStore,
    pub engine: Arc<dyn Engine>,
    pub mdl: Arc<MdlManager>,
    pub registry: Arc<SessionRegistry>,
    pub classification: ClassificationTable,
    pub handlers: HandlerTable,
    pub status: GlobalStatus,
    pub admission: Admission,
    pub timer: TimerService,
    globals: RwLock<VariableSet>,
    db_read_only: RwLock<HashMap<String, DbReadOnly>>,
    started: Instant,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("engine", &self.engine.name())
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl ServerInstance {
    /// Server over the in-memory engine, with the superuser account and the
    /// initial database from the config.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let engine = MemoryEngine::with_databases(&[config.server.initial_database.as_str()]);
        Self::with_engine(config, Arc::new(engine))
    }

    #[must_use]
    pub fn with_engine(config: ServerConfig, engine: Arc<dyn Engine>) -> Self {
        let users = UserStore::new();
        if let Err(e) = users.create_user(
            &config.server.superuser,
            &config.server.superuser_password,
            Privileges::ALL,
        ) {
            warn!(error = %e, "could not create superuser");
        }

        let mut db_read_only = HashMap::new();
        for db in &config.read_only.databases {
            db_read_only.insert(db.to_lowercase(), DbReadOnly::ReadOnly);
        }
        for db in &config.read_only.super_databases {
            db_read_only.insert(db.to_lowercase(), DbReadOnly::SuperReadOnly);
        }

        let (shutdown, _) = watch::channel(false);
        Self {
            users,
            engine,
            mdl: Arc::new(MdlManager::new()),
            registry: Arc::new(SessionRegistry::new()),
            classification: ClassificationTable::new(),
            handlers: HandlerTable::new(),
            status: GlobalStatus::new(),
            admission: Admission::new(
                config.limits.max_running_writes,
                config.limits.max_running_reads,
            ),
            timer: TimerService::new(),
            globals: RwLock::new(VariableSet::globals(&config)),
            db_read_only: RwLock::new(db_read_only),
            started: Instant::now(),
            shutdown,
            config,
        }
    }

    /// Opens a session under a freshly allocated connection id.
    pub fn open_session(
        &self,
        user: User,
        host: &str,
        capabilities: u32,
    ) -> Result<Session, ServerError> {
        let id = self.registry.allocate_id();
        Session::new(self, id, user, host, capabilities)
    }

    /// Snapshot of the global variables.
    #[must_use]
    pub fn global_variables(&self) -> VariableSet {
        self.globals
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|_| VariableSet::globals(&self.config))
    }

    /// `SET GLOBAL`; live settings take effect immediately.
    pub fn set_global(&self, def: &'static VarDef, value: Value) -> Result<(), ServerError> {
        let limit = value
            .as_int()
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or_default();
        match def.name {
            "max_running_writes" => self.admission.set_limits(Some(limit), None),
            "max_running_reads" => self.admission.set_limits(None, Some(limit)),
            _ => {}
        }
        let mut globals = self
            .globals
            .write()
            .map_err(|_| ServerError::Internal("global variables poisoned".into()))?;
        globals.set(def, value.clone());
        // super_read_only implies read_only, and clearing read_only clears both
        match (def.name, value.as_int()) {
            ("super_read_only", Some(1)) => {
                if let Some(ro) = crate::session::variables::lookup("read_only") {
                    globals.set(ro, Value::Integer(1));
                }
            }
            ("read_only", Some(0)) => {
                if let Some(sro) = crate::session::variables::lookup("super_read_only") {
                    globals.set(sro, Value::Integer(0));
                }
            }
            _ => {}
        }
        info!(variable = def.name, %value, "global variable changed");
        Ok(())
    }

    /// Current value of a boolean global such as `general_log`.
    #[must_use]
    pub fn global_flag(&self, name: &str) -> bool {
        self.globals.read().is_ok_and(|g| g.get_bool(name))
    }

    /// `(read_only, super_read_only)`.
    #[must_use]
    pub fn read_only_mode(&self) -> (bool, bool) {
        self.globals.read().map_or((false, false), |g| {
            let super_ro = g.get_bool("super_read_only");
            (g.get_bool("read_only") || super_ro, super_ro)
        })
    }

    #[must_use]
    pub fn db_read_only(&self, db: &str) -> DbReadOnly {
        self.db_read_only
            .read()
            .ok()
            .and_then(|m| m.get(&db.to_lowercase()).copied())
            .unwrap_or_default()
    }

    pub fn set_db_read_only(&self, db: &str, level: DbReadOnly) {
        if let Ok(mut map) = self.db_read_only.write() {
            if level == DbReadOnly::Off {
                map.remove(&db.to_lowercase());
            } else {
                map.insert(db.to_lowercase(), level);
            }
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stops accepting connections and kills every session except the
    /// initiator, which still has its reply to send.
    pub fn request_shutdown(&self, initiator: Option<u32>) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!(?initiator, "shutdown requested");
        self.registry.kill_all(KillState::ConnectionKilled, initiator);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
