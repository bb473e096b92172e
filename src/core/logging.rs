// Logging - tracing-subscriber with an EnvFilter assembled from config.
//
// Targets of interest besides module paths:
//   general_log - every statement after credential redaction
//   slow_log    - slow statement records (JSON)

use std::collections::HashMap;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::config::LoggingSection;

pub const GENERAL_LOG_TARGET: &str = "general_log";
pub const SLOW_LOG_TARGET: &str = "slow_log";

/// Builds the filter: base level, quiet third-party crates, then overrides.
pub fn build_env_filter(
    level: &str,
    targets: &HashMap<String, String>,
) -> Result<EnvFilter, String> {
    let mut directives = vec![level.to_string()];

    for (target, lvl) in [("tokio", "warn"), ("mio", "warn")] {
        directives.push(format!("{target}={lvl}"));
    }

    for (target, lvl) in targets {
        directives.push(format!("{target}={lvl}"));
    }

    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| format!("Invalid tracing filter '{filter_str}': {e}"))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingSection) -> Result<(), String> {
    let filter = build_env_filter(&config.level, &config.targets)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| format!("Failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_env_filter_with_overrides() {
        let mut targets = HashMap::new();
        targets.insert(GENERAL_LOG_TARGET.to_string(), "debug".to_string());
        let filter = build_env_filter("info", &targets).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("general_log=debug"));
        assert!(rendered.contains("tokio=warn"));
    }

    #[test]
    fn test_build_env_filter_rejects_garbage() {
        assert!(build_env_filter("info,general_log=loudest", &HashMap::new()).is_err());
    }
}
