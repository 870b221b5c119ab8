//! Engine configuration using config-rs.
//!
//! Supports TOML files and environment variable overrides. All values are
//! validated before an engine is built; validation failures name the
//! offending field.

use crate::error::{Error, Result};
use crate::id::{DispatcherName, SUBSCRIPTIONS_DISPATCHER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Inclusive bounds for per-processor message queue capacity
pub const MIN_QUEUE_SIZE: usize = 1;
pub const MAX_QUEUE_SIZE: usize = 1_000_000;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Thread pool size reserved for the delayed-delivery scheduler
    pub scheduler_pool_size: usize,
    /// Default per-processor message queue capacity
    pub default_queue_size: usize,
    /// Dispatcher assignment per worker thread: one worker is spawned per
    /// outer entry, servicing the inner list of dispatcher names in
    /// round-robin order
    pub thread_dispatcher_assignment: Vec<Vec<String>>,
    /// Idle backoff configuration
    pub backoff: BackoffConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_pool_size: 2,
            default_queue_size: 10_000,
            thread_dispatcher_assignment: vec![
                vec![SUBSCRIPTIONS_DISPATCHER.to_string()],
                vec![String::new()],
            ],
            backoff: BackoffConfig::default(),
        }
    }
}

impl EngineConfig {
    /// A minimal configuration running every dispatcher on a single worker
    /// thread. Useful for tests and degenerate deployments.
    pub fn single_threaded() -> Self {
        Self {
            thread_dispatcher_assignment: vec![vec![
                SUBSCRIPTIONS_DISPATCHER.to_string(),
                String::new(),
            ]],
            ..Default::default()
        }
    }

    /// Load configuration from an optional TOML file, then apply
    /// `EVENTUM__`-prefixed environment overrides. Missing file means
    /// defaults. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("EVENTUM")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .map_err(|e| Error::config_invalid("engine", e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::config_invalid("engine", e.to_string()))?;

        settings.engine.validate()?;
        Ok(settings.engine)
    }

    /// Parse configuration from a TOML string (validated)
    pub fn from_toml(toml: &str) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .map_err(|e| Error::config_invalid("engine", e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::config_invalid("engine", e.to_string()))?;

        settings.engine.validate()?;
        Ok(settings.engine)
    }

    /// Validate all fields, failing with a `ConfigInvalid` error naming
    /// the first offending field
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_pool_size < 1 {
            return Err(Error::config_invalid(
                "scheduler_pool_size",
                "must be at least 1",
            ));
        }
        if self.default_queue_size < MIN_QUEUE_SIZE || self.default_queue_size > MAX_QUEUE_SIZE {
            return Err(Error::config_invalid(
                "default_queue_size",
                format!("must be in [{MIN_QUEUE_SIZE}, {MAX_QUEUE_SIZE}]"),
            ));
        }
        if self.thread_dispatcher_assignment.is_empty() {
            return Err(Error::config_invalid(
                "thread_dispatcher_assignment",
                "at least one worker thread must be assigned",
            ));
        }
        for (idx, assigned) in self.thread_dispatcher_assignment.iter().enumerate() {
            if assigned.is_empty() {
                return Err(Error::config_invalid(
                    "thread_dispatcher_assignment",
                    format!("worker {idx} has no dispatchers assigned"),
                ));
            }
        }
        if !self
            .thread_dispatcher_assignment
            .iter()
            .flatten()
            .any(|name| name == SUBSCRIPTIONS_DISPATCHER)
        {
            return Err(Error::config_invalid(
                "thread_dispatcher_assignment",
                format!("no worker thread is pinned to the reserved {SUBSCRIPTIONS_DISPATCHER:?} dispatcher"),
            ));
        }
        self.backoff.validate()?;
        Ok(())
    }

    /// The set of dispatcher names processors may be pinned to: the union
    /// of all names appearing in the thread assignment, in lexicographic
    /// order
    pub fn valid_dispatcher_names(&self) -> BTreeSet<DispatcherName> {
        self.thread_dispatcher_assignment
            .iter()
            .flatten()
            .map(|name| DispatcherName::new(name.clone()))
            .collect()
    }

    /// Number of worker threads the engine will spawn
    pub fn worker_count(&self) -> usize {
        self.thread_dispatcher_assignment.len()
    }
}

/// Idle backoff configuration.
///
/// Workers that find no dispatchable work park for a delay that grows
/// geometrically from `base_delay_micros` up to `max_delay_micros`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial park delay in microseconds
    pub base_delay_micros: u64,
    /// Growth factor applied after each fruitless pass
    pub multiplier: f64,
    /// Ceiling for the park delay in microseconds
    pub max_delay_micros: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_micros: 10,
            multiplier: 1.5,
            max_delay_micros: 10_000,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_micros(self.base_delay_micros)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_micros(self.max_delay_micros)
    }

    fn validate(&self) -> Result<()> {
        if self.base_delay_micros < 1 {
            return Err(Error::config_invalid(
                "backoff.base_delay_micros",
                "must be at least 1",
            ));
        }
        if self.multiplier <= 1.0 {
            return Err(Error::config_invalid(
                "backoff.multiplier",
                "must be greater than 1.0",
            ));
        }
        if self.max_delay_micros < self.base_delay_micros {
            return Err(Error::config_invalid(
                "backoff.max_delay_micros",
                "must be at least base_delay_micros",
            ));
        }
        Ok(())
    }
}

/// Top-level settings file shape: `[engine]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    engine: EngineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_queue_size, 10_000);
        assert_eq!(config.worker_count(), 2);
    }

    #[test]
    fn test_valid_dispatcher_names_union() {
        let config = EngineConfig::default();
        let names = config.valid_dispatcher_names();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&DispatcherName::default_dispatcher()));
        assert!(names.contains(&DispatcherName::subscriptions()));
    }

    #[test]
    fn test_rejects_zero_queue_size() {
        let config = EngineConfig {
            default_queue_size: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_queue_size"));
    }

    #[test]
    fn test_rejects_oversized_queue() {
        let config = EngineConfig {
            default_queue_size: MAX_QUEUE_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_assignment() {
        let config = EngineConfig {
            thread_dispatcher_assignment: Vec::new(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("thread_dispatcher_assignment"));
    }

    #[test]
    fn test_rejects_worker_with_no_dispatchers() {
        let config = EngineConfig {
            thread_dispatcher_assignment: vec![
                vec![SUBSCRIPTIONS_DISPATCHER.to_string()],
                vec![],
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_missing_subscriptions_dispatcher() {
        let config = EngineConfig {
            thread_dispatcher_assignment: vec![vec![String::new()], vec!["io".to_string()]],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("subscriptions"));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let mut config = EngineConfig::default();
        config.backoff.multiplier = 1.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.backoff.max_delay_micros = 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.backoff.base_delay_micros = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_threaded_helper() {
        let config = EngineConfig::single_threaded();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count(), 1);
        assert_eq!(config.valid_dispatcher_names().len(), 2);
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml(
            r#"
            [engine]
            scheduler_pool_size = 4
            default_queue_size = 500

            [engine.backoff]
            base_delay_micros = 20
            multiplier = 2.0
            max_delay_micros = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler_pool_size, 4);
        assert_eq!(config.default_queue_size, 500);
        assert_eq!(config.backoff.base_delay_micros, 20);
        // Unspecified fields fall back to defaults
        assert_eq!(config.worker_count(), 2);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let err = EngineConfig::from_toml(
            r#"
            [engine]
            default_queue_size = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("default_queue_size"));
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.default_queue_size, deserialized.default_queue_size);
        assert_eq!(
            config.thread_dispatcher_assignment,
            deserialized.thread_dispatcher_assignment
        );
    }
}
