use std::env;
use std::time::Duration;
use thiserror::Error;

pub const RESYNC_SECS_VAR: &str = "CHARCOUNTER_RESYNC_SECS";
pub const ERROR_BACKOFF_SECS_VAR: &str = "CHARCOUNTER_ERROR_BACKOFF_SECS";
pub const WATCH_NAMESPACE_VAR: &str = "CHARCOUNTER_WATCH_NAMESPACE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive number of seconds, got {value:?}")]
    InvalidSeconds { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Coarse periodic re-sync of every CharacterCounter, independent of changes.
    pub resync_interval: Duration,
    /// Delay before retrying a reconcile that failed transiently.
    pub error_backoff: Duration,
    /// Only watch this namespace; all namespaces when unset.
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            resync_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(10),
            watch_namespace: None,
        }
    }
}

fn parse_seconds(var: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::InvalidSeconds { var, value }),
        },
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ControllerConfig::default();
        Ok(ControllerConfig {
            resync_interval: parse_seconds(RESYNC_SECS_VAR, lookup(RESYNC_SECS_VAR), defaults.resync_interval)?,
            error_backoff: parse_seconds(
                ERROR_BACKOFF_SECS_VAR,
                lookup(ERROR_BACKOFF_SECS_VAR),
                defaults.error_backoff,
            )?,
            watch_namespace: lookup(WATCH_NAMESPACE_VAR).filter(|ns| !ns.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn unset_variables_use_defaults() {
        let config = ControllerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = ControllerConfig::from_lookup(lookup_from(&[
            (RESYNC_SECS_VAR, "300"),
            (ERROR_BACKOFF_SECS_VAR, " 5 "),
            (WATCH_NAMESPACE_VAR, "team-a"),
        ]))
        .unwrap();
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.error_backoff, Duration::from_secs(5));
        assert_eq!(config.watch_namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn zero_or_garbage_is_rejected() {
        let err = ControllerConfig::from_lookup(lookup_from(&[(RESYNC_SECS_VAR, "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidSeconds {
                var: RESYNC_SECS_VAR,
                value: "0".to_string()
            }
        );
        assert!(ControllerConfig::from_lookup(lookup_from(&[(ERROR_BACKOFF_SECS_VAR, "soon")])).is_err());
    }
}
