//! Environment configuration.

use crate::error::ControllerError;
use kindstore::ListWatchOptions;
use std::env;
use std::time::Duration;

const DEFAULT_RESYNC_PERIOD_SECS: u64 = 60;
const DEFAULT_BACKOFF_MIN_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Controller settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Namespace to watch Sleepers in; all namespaces when unset
    pub namespace: Option<String>,
    /// Resync period; `RESYNC_PERIOD_SECS=0` disables resync
    pub resync_period: Option<Duration>,
    /// First delay before relisting after a failed list or dropped watch
    pub min_backoff: Duration,
    /// Cap on that delay as failures repeat
    pub max_backoff: Duration,
}

impl Config {
    /// Read `WATCH_NAMESPACE`, `RESYNC_PERIOD_SECS`, `WATCH_BACKOFF_MIN_MS`
    /// and `WATCH_BACKOFF_MAX_MS`.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());
        let resync_secs = parse_u64(&lookup, "RESYNC_PERIOD_SECS", DEFAULT_RESYNC_PERIOD_SECS)?;
        let min_ms = parse_u64(&lookup, "WATCH_BACKOFF_MIN_MS", DEFAULT_BACKOFF_MIN_MS)?;
        let max_ms = parse_u64(&lookup, "WATCH_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)?;

        if min_ms == 0 {
            return Err(ControllerError::InvalidConfig(
                "WATCH_BACKOFF_MIN_MS must be greater than zero".to_string(),
            ));
        }
        if max_ms < min_ms {
            return Err(ControllerError::InvalidConfig(format!(
                "WATCH_BACKOFF_MAX_MS ({max_ms}) is below WATCH_BACKOFF_MIN_MS ({min_ms})"
            )));
        }

        Ok(Self {
            namespace,
            resync_period: (resync_secs > 0).then(|| Duration::from_secs(resync_secs)),
            min_backoff: Duration::from_millis(min_ms),
            max_backoff: Duration::from_millis(max_ms),
        })
    }

    /// Options for the store's and watcher's list-watch loops
    pub fn list_watch_options(&self) -> ListWatchOptions {
        ListWatchOptions {
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            resync_period: self.resync_period,
        }
    }
}

fn parse_u64<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{key} must be a non-negative integer, got {raw:?}: {e}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.namespace, None);
        assert_eq!(config.resync_period, Some(Duration::from_secs(60)));
        assert_eq!(config.min_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("WATCH_NAMESPACE", "naps"),
            ("RESYNC_PERIOD_SECS", "0"),
            ("WATCH_BACKOFF_MIN_MS", "100"),
            ("WATCH_BACKOFF_MAX_MS", "1000"),
        ])
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("naps"));
        assert_eq!(config.resync_period, None);

        let options = config.list_watch_options();
        assert_eq!(options.min_backoff, Duration::from_millis(100));
        assert_eq!(options.max_backoff, Duration::from_secs(1));
        assert_eq!(options.resync_period, None);
    }

    #[test]
    fn test_empty_namespace_means_all() {
        let config = config_from(&[("WATCH_NAMESPACE", "")]).unwrap();
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("RESYNC_PERIOD_SECS", "soon")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            config_from(&[("WATCH_BACKOFF_MIN_MS", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            config_from(&[("WATCH_BACKOFF_MIN_MS", "2000"), ("WATCH_BACKOFF_MAX_MS", "1000")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
