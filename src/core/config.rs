use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use super::timeout::Timeout;

/// Config files probed when no explicit path is given, first match wins.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["/etc/myrustql/myrustql.toml", "./myrustql.toml"];

/// Server configuration.
///
/// Priority: defaults < config file < `MYRUSTQL__SECTION__KEY` environment < CLI args
/// (the last layer is applied by the binary).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub network: NetworkSection,
    pub limits: LimitsSection,
    pub read_only: ReadOnlySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub superuser: String,
    pub superuser_password: String,
    pub initial_database: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            superuser: "root".to_string(),
            superuser_password: String::new(),
            initial_database: "test".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Bound on reading the rest of a command once its first byte arrived.
    pub net_read_timeout_secs: u32,
    /// Bound on waiting for the next command while idle.
    pub wait_timeout_secs: u32,
    pub max_allowed_packet: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            net_read_timeout_secs: 30,
            wait_timeout_secs: 8 * 60 * 60,
            max_allowed_packet: 64 * 1024 * 1024,
        }
    }
}

impl NetworkSection {
    #[must_use]
    pub const fn read_timeout(&self) -> Timeout {
        Timeout::from_seconds(self.net_read_timeout_secs)
    }

    #[must_use]
    pub const fn wait_timeout(&self) -> Timeout {
        Timeout::from_seconds(self.wait_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// 0 disables the ceiling.
    pub max_running_writes: usize,
    /// 0 disables the ceiling.
    pub max_running_reads: usize,
    pub lock_wait_timeout_secs: u32,
    /// Default per-session SELECT time limit, 0 disables it.
    pub max_execution_time_ms: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_running_writes: 0,
            max_running_reads: 0,
            lock_wait_timeout_secs: 50,
            max_execution_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReadOnlySection {
    pub read_only: bool,
    pub super_read_only: bool,
    /// Databases refusing writes from sessions without SUPER.
    pub databases: Vec<String>,
    /// Databases refusing writes from everyone.
    pub super_databases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// Per-target level overrides, e.g. `general_log = "info"`.
    pub targets: HashMap<String, String>,
    pub general_log: bool,
    pub slow_log: bool,
    pub long_query_time_secs: f64,
    pub min_examined_row_limit: u64,
    pub log_slow_interrupted: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            targets: HashMap::new(),
            general_log: false,
            slow_log: true,
            long_query_time_secs: 10.0,
            min_examined_row_limit: 0,
            log_slow_interrupted: false,
        }
    }
}

impl ServerConfig {
    /// Loads defaults, then the config file, then the environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        match explicit {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                for path in &DEFAULT_CONFIG_PATHS {
                    if Path::new(path).exists() {
                        builder = builder.add_source(File::with_name(path));
                        break;
                    }
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("MYRUSTQL")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("read_only.databases")
                .with_list_parse_key("read_only.super_databases")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.server.port, 3306);
        assert_eq!(config.network.read_timeout(), Timeout::from_seconds(30));
        assert_eq!(config.limits.max_running_writes, 0);
        assert!(!config.read_only.read_only);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 4406

[limits]
max_running_writes = 8

[read_only]
read_only = true
databases = ["archive"]
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 4406);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.limits.max_running_writes, 8);
        assert!(config.read_only.read_only);
        assert_eq!(config.read_only.databases, vec!["archive".to_string()]);
    }
}
