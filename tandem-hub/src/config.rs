//! Server configuration.
//!
//! | Variable                    | Default   | Field                 |
//! |-----------------------------|-----------|-----------------------|
//! | `HOST`                      | `0.0.0.0` | `host`                |
//! | `PORT`                      | `4444`    | `port`                |
//! | `YPERSISTENCE`              | unset     | `storage_path`        |
//! | `GC`                        | enabled   | `gc`                  |
//! | `CALLBACK_DEBOUNCE_WAIT`    | 2000 ms   | `debounce.wait`       |
//! | `CALLBACK_DEBOUNCE_MAXWAIT` | 10000 ms  | `debounce.max_wait`   |
//!
//! The liveness interval is not read from the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default liveness ping interval.
pub const PING_INTERVAL: Duration = Duration::from_millis(30_000);

/// Configuration errors. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Quiet window and forced-invocation bound for the mutation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Mutations closer together than this coalesce.
    pub wait: Duration,
    /// Upper bound between the first pending mutation and an invocation.
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(2000),
            max_wait: Duration::from_millis(10_000),
        }
    }
}

/// Hub and listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to listen on
    pub host: String,
    /// TCP port (0 picks a free port)
    pub port: u16,
    /// Storage directory; `None` disables persistence
    pub storage_path: Option<PathBuf>,
    /// History garbage collection on session documents
    pub gc: bool,
    /// Liveness ping interval
    pub ping_interval: Duration,
    /// Mutation callback debouncing
    pub debounce: DebounceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4444,
            storage_path: None,
            gc: true,
            ping_interval: PING_INTERVAL,
            debounce: DebounceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Missing or empty keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get("HOST") {
            config.host = host;
        }
        if let Some(port) = get("PORT") {
            config.port = parse("PORT", &port)?;
        }
        config.storage_path = get("YPERSISTENCE").map(PathBuf::from);
        if let Some(gc) = get("GC") {
            config.gc = !matches!(gc.trim(), "false" | "0");
        }
        if let Some(wait) = get("CALLBACK_DEBOUNCE_WAIT") {
            config.debounce.wait = Duration::from_millis(parse("CALLBACK_DEBOUNCE_WAIT", &wait)?);
        }
        if let Some(max_wait) = get("CALLBACK_DEBOUNCE_MAXWAIT") {
            config.debounce.max_wait =
                Duration::from_millis(parse("CALLBACK_DEBOUNCE_MAXWAIT", &max_wait)?);
        }

        Ok(config)
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:4444");
        assert!(config.storage_path.is_none());
        assert!(config.gc);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.debounce.wait, Duration::from_millis(2000));
        assert_eq!(config.debounce.max_wait, Duration::from_millis(10_000));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "1234"),
            ("YPERSISTENCE", "/var/lib/tandem"),
            ("GC", "false"),
            ("CALLBACK_DEBOUNCE_WAIT", "500"),
            ("CALLBACK_DEBOUNCE_MAXWAIT", "3000"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr(), "127.0.0.1:1234");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/tandem")));
        assert!(!config.gc);
        assert_eq!(config.debounce.wait, Duration::from_millis(500));
        assert_eq!(config.debounce.max_wait, Duration::from_millis(3000));
    }

    #[test]
    fn test_gc_values() {
        for (value, expected) in [("0", false), ("false", false), ("true", true), ("1", true)] {
            let config = ServerConfig::from_lookup(lookup(&[("GC", value)])).unwrap();
            assert_eq!(config.gc, expected, "GC={value}");
        }
    }

    #[test]
    fn test_empty_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[("PORT", ""), ("YPERSISTENCE", "")])).unwrap();
        assert_eq!(config.port, 4444);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_invalid_port() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PORT",
                value: "http".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_debounce() {
        assert!(ServerConfig::from_lookup(lookup(&[("CALLBACK_DEBOUNCE_WAIT", "-5")])).is_err());
    }
}
