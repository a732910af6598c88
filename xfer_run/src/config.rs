//! Runtime configuration.
//!
//! Values can be set programmatically through the builder-style setters on [`RuntimeConfig`] or
//! read from the environment with [`RuntimeConfig::from_env`]:
//!
//! | Variable                  | Field            |
//! |---------------------------|------------------|
//! | `XFER_RUN_EVENT_CAPACITY` | `event_capacity` |
//! | `XFER_RUN_TICK_BUDGET`    | `tick_budget`    |
//! | `XFER_RUN_METRICS_ADDR`   | `metrics_addr`   |

use std::net::SocketAddr;

use thiserror::Error;

pub const EVENT_CAPACITY_VAR: &str = "XFER_RUN_EVENT_CAPACITY";
pub const TICK_BUDGET_VAR: &str = "XFER_RUN_TICK_BUDGET";
pub const METRICS_ADDR_VAR: &str = "XFER_RUN_METRICS_ADDR";

const DEFAULT_EVENT_CAPACITY: usize = 1024;
const DEFAULT_TICK_BUDGET: usize = 61;

/// Errors produced while building a [`RuntimeConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got `{value}`")]
    InvalidCount { var: &'static str, value: String },

    #[error("{var} must be a socket address, got `{value}`")]
    InvalidAddr { var: &'static str, value: String },
}

/// Tunables for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Capacity of the reactor's event buffer per poll.
    pub event_capacity: usize,
    /// Maximum number of task polls per turn before the reactor is checked for I/O.
    pub tick_budget: usize,
    /// When set, a Prometheus exporter listens on this address.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            tick_budget: DEFAULT_TICK_BUDGET,
            metrics_addr: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn tick_budget(mut self, budget: usize) -> Self {
        self.tick_budget = budget.max(1);
        self
    }

    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Reads the configuration from the process environment.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(EVENT_CAPACITY_VAR) {
            config.event_capacity = parse_count(EVENT_CAPACITY_VAR, &value)?;
        }
        if let Some(value) = lookup(TICK_BUDGET_VAR) {
            config.tick_budget = parse_count(TICK_BUDGET_VAR, &value)?;
        }
        if let Some(value) = lookup(METRICS_ADDR_VAR) {
            let addr = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidAddr {
                    var: METRICS_ADDR_VAR,
                    value: value.clone(),
                })?;
            config.metrics_addr = Some(addr);
        }

        Ok(config)
    }
}

fn parse_count(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidCount {
            var,
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn reads_all_variables() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (EVENT_CAPACITY_VAR, "256"),
            (TICK_BUDGET_VAR, " 8 "),
            (METRICS_ADDR_VAR, "127.0.0.1:9000"),
        ]))
        .unwrap();

        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.tick_budget, 8);
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let err = RuntimeConfig::from_lookup(lookup(&[(TICK_BUDGET_VAR, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCount { .. }));

        let err =
            RuntimeConfig::from_lookup(lookup(&[(METRICS_ADDR_VAR, "localhost")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddr { .. }));
    }

    #[test]
    fn setters_clamp_to_one() {
        let config = RuntimeConfig::new().event_capacity(0).tick_budget(0);
        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.tick_budget, 1);
    }
}
