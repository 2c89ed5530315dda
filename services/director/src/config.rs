//! Configuration for the director.

use std::time::Duration;

use drydock_reconcile::DEFAULT_MAX_IN_FLIGHT;

use crate::{DirectorError, DirectorResult};

/// Director configuration.
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Upper bound on concurrent units in any task pool.
    pub max_threads: usize,

    /// Whether DNS records are published for instances.
    pub dns_enabled: bool,

    /// How long to wait for a lease lock before giving up.
    pub lock_timeout: Duration,

    /// Lifetime of a lease before it must be renewed.
    pub lock_expiry: Duration,

    /// Number of polls a watch window is split into.
    pub watch_intervals: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Path of the plan file read by the binary.
    pub plan_path: Option<String>,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_IN_FLIGHT,
            dns_enabled: false,
            lock_timeout: Duration::from_secs(10),
            lock_expiry: Duration::from_secs(10),
            watch_intervals: 10,
            log_level: "info".to_string(),
            plan_path: None,
        }
    }
}

impl DirectorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> DirectorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DirectorResult<Self> {
        let defaults = Self::default();

        let max_threads = parse_or(&lookup, "DRYDOCK_MAX_THREADS", defaults.max_threads)?;
        if max_threads == 0 {
            return Err(DirectorError::Config(
                "DRYDOCK_MAX_THREADS must be at least 1".to_string(),
            ));
        }

        let dns_enabled = parse_or(&lookup, "DRYDOCK_DNS_ENABLED", defaults.dns_enabled)?;

        let lock_timeout = Duration::from_secs(parse_or(
            &lookup,
            "DRYDOCK_LOCK_TIMEOUT_SECS",
            defaults.lock_timeout.as_secs(),
        )?);

        let lock_expiry = Duration::from_secs(parse_or(
            &lookup,
            "DRYDOCK_LOCK_EXPIRY_SECS",
            defaults.lock_expiry.as_secs(),
        )?);
        if lock_expiry.is_zero() {
            return Err(DirectorError::Config(
                "DRYDOCK_LOCK_EXPIRY_SECS must be at least 1".to_string(),
            ));
        }

        let watch_intervals =
            parse_or(&lookup, "DRYDOCK_WATCH_INTERVALS", defaults.watch_intervals)?.max(1);

        let log_level = lookup("DRYDOCK_LOG_LEVEL").unwrap_or(defaults.log_level);
        let plan_path = lookup("DRYDOCK_PLAN");

        Ok(Self {
            max_threads,
            dns_enabled,
            lock_timeout,
            lock_expiry,
            watch_intervals,
            log_level,
            plan_path,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> DirectorResult<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DirectorError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
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
        let config = DirectorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_threads, 32);
        assert!(!config.dns_enabled);
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.watch_intervals, 10);
        assert_eq!(config.log_level, "info");
        assert!(config.plan_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = DirectorConfig::from_lookup(lookup(&[
            ("DRYDOCK_MAX_THREADS", "4"),
            ("DRYDOCK_DNS_ENABLED", "true"),
            ("DRYDOCK_LOCK_TIMEOUT_SECS", "3"),
            ("DRYDOCK_PLAN", "/tmp/plan.json"),
        ]))
        .unwrap();
        assert_eq!(config.max_threads, 4);
        assert!(config.dns_enabled);
        assert_eq!(config.lock_timeout, Duration::from_secs(3));
        assert_eq!(config.plan_path.as_deref(), Some("/tmp/plan.json"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(DirectorConfig::from_lookup(lookup(&[("DRYDOCK_MAX_THREADS", "0")])).is_err());
        assert!(DirectorConfig::from_lookup(lookup(&[("DRYDOCK_DNS_ENABLED", "maybe")])).is_err());
    }
}
