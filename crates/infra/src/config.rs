//! Configuration loading and representation.
//!
//! Everything is read from environment variables with defaults, and the
//! strategy is validated at load time so a misconfigured step fails at
//! provisioning rather than on the first event.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DOCREDUCE_STRATEGY` | `time_window` (`time_window` \| `static_counter`) |
//! | `DOCREDUCE_WINDOW_SECS` | `15` |
//! | `DOCREDUCE_JITTER_SECS` | `5` |
//! | `DOCREDUCE_EXPIRY_GRACE_SECS` | `172800` |
//! | `DOCREDUCE_EXPECTED_COUNT` | required for `static_counter` |
//! | `DOCREDUCE_MAX_WAIT_SECS` | `172800` |
//! | `DOCREDUCE_RETENTION_SECS` | `172800` |
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `REDIS_URL` | unset (in-memory sink) |
//! | `REDIS_CHANNEL` | `reducer.composite.created` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use docreduce_core::strategy::{DEFAULT_EXPIRY_GRACE, DEFAULT_MAX_WAIT};
use docreduce_core::{DomainError, StaticCounter, Strategy, StrategyKind, TimeWindow};
use docreduce_events::CompositeEvent;

use crate::reducer::reaper::DEFAULT_RETENTION;
use crate::scheduler::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Strategy(#[from] DomainError),
}

/// Strategy parameters of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    TimeWindow {
        window_secs: u64,
        #[serde(default)]
        jitter_secs: u64,
        #[serde(default)]
        expiry_grace_secs: Option<u64>,
    },
    StaticCounter {
        expected_count: u32,
        #[serde(default)]
        max_wait_secs: Option<u64>,
    },
}

impl StrategyConfig {
    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategyConfig::TimeWindow { .. } => StrategyKind::TimeWindow,
            StrategyConfig::StaticCounter { .. } => StrategyKind::StaticCounter,
        }
    }

    /// Validate and build the runtime strategy.
    pub fn build(&self) -> Result<Strategy, DomainError> {
        match *self {
            StrategyConfig::TimeWindow {
                window_secs,
                jitter_secs,
                expiry_grace_secs,
            } => {
                let window = TimeWindow::new(
                    Duration::from_secs(window_secs),
                    Duration::from_secs(jitter_secs),
                )?
                .with_expiry_grace(
                    expiry_grace_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_EXPIRY_GRACE),
                );
                Ok(Strategy::TimeWindow(window))
            }
            StrategyConfig::StaticCounter {
                expected_count,
                max_wait_secs,
            } => {
                let counter = StaticCounter::with_max_wait(
                    expected_count,
                    max_wait_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_MAX_WAIT),
                )?;
                Ok(Strategy::StaticCounter(counter))
            }
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::TimeWindow {
            window_secs: 15,
            jitter_secs: 5,
            expiry_grace_secs: None,
        }
    }
}

/// Group reaper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub retention_secs: u64,
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            retention_secs: DEFAULT_RETENTION.as_secs(),
            batch_size: crate::store::query::DEFAULT_LIMIT,
        }
    }
}

impl ReaperConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Store and sink backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_channel: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            redis_url: None,
            redis_channel: CompositeEvent::EVENT_TYPE.to_string(),
        }
    }
}

/// Full reducer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReducerConfig {
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl ReducerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind = match lookup("DOCREDUCE_STRATEGY") {
            Some(raw) => StrategyKind::parse(raw.trim()).map_err(|e| ConfigError::Invalid {
                key: "DOCREDUCE_STRATEGY",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => StrategyKind::TimeWindow,
        };

        let strategy = match kind {
            StrategyKind::TimeWindow => StrategyConfig::TimeWindow {
                window_secs: parse(&lookup, "DOCREDUCE_WINDOW_SECS")?.unwrap_or(15),
                jitter_secs: parse(&lookup, "DOCREDUCE_JITTER_SECS")?.unwrap_or(5),
                expiry_grace_secs: parse(&lookup, "DOCREDUCE_EXPIRY_GRACE_SECS")?,
            },
            StrategyKind::StaticCounter => StrategyConfig::StaticCounter {
                expected_count: parse(&lookup, "DOCREDUCE_EXPECTED_COUNT")?
                    .ok_or(ConfigError::Missing("DOCREDUCE_EXPECTED_COUNT"))?,
                max_wait_secs: parse(&lookup, "DOCREDUCE_MAX_WAIT_SECS")?,
            },
        };

        let reaper = ReaperConfig {
            retention_secs: parse(&lookup, "DOCREDUCE_RETENTION_SECS")?
                .unwrap_or(DEFAULT_RETENTION.as_secs()),
            ..Default::default()
        };

        let use_persistent_stores = parse(&lookup, "USE_PERSISTENT_STORES")?.unwrap_or(false);
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let backend = BackendConfig {
            use_persistent_stores,
            database_url,
            redis_url: lookup("REDIS_URL").filter(|v| !v.trim().is_empty()),
            redis_channel: lookup("REDIS_CHANNEL")
                .unwrap_or_else(|| CompositeEvent::EVENT_TYPE.to_string()),
        };

        let config = Self {
            strategy,
            reaper,
            retry: RetryPolicy::default(),
            backend,
        };
        config.strategy.build()?;
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_to_a_fifteen_second_window() {
        let config = ReducerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.strategy, StrategyConfig::default());
        assert!(!config.backend.use_persistent_stores);
        assert_eq!(config.reaper.retention(), DEFAULT_RETENTION);
    }

    #[test]
    fn static_counter_requires_an_expected_count() {
        let err = ReducerConfig::from_lookup(lookup(&[("DOCREDUCE_STRATEGY", "static_counter")]))
            .unwrap_err();

        assert!(matches!(err, ConfigError::Missing("DOCREDUCE_EXPECTED_COUNT")));
    }

    #[test]
    fn zero_expected_count_is_rejected_at_load() {
        let err = ReducerConfig::from_lookup(lookup(&[
            ("DOCREDUCE_STRATEGY", "static_counter"),
            ("DOCREDUCE_EXPECTED_COUNT", "0"),
        ]))
        .unwrap_err();

        assert!(matches!(err, ConfigError::Strategy(DomainError::InvalidConfiguration(_))));
    }

    #[test]
    fn out_of_range_window_is_rejected_at_load() {
        let err = ReducerConfig::from_lookup(lookup(&[("DOCREDUCE_WINDOW_SECS", "0")])).unwrap_err();

        assert!(matches!(err, ConfigError::Strategy(_)));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = ReducerConfig::from_lookup(lookup(&[("DOCREDUCE_JITTER_SECS", "five")])).unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { key: "DOCREDUCE_JITTER_SECS", .. }));
    }

    #[test]
    fn persistent_stores_need_a_database_url() {
        let err = ReducerConfig::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));

        let config = ReducerConfig::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/docreduce"),
            ("REDIS_URL", "redis://localhost:6379"),
        ]))
        .unwrap();
        assert!(config.backend.use_persistent_stores);
        assert_eq!(config.backend.redis_channel, CompositeEvent::EVENT_TYPE);
    }

    #[test]
    fn strategy_config_deserializes_from_json() {
        let config: StrategyConfig = serde_json::from_str(
            r#"{ "kind": "static_counter", "expected_count": 3, "max_wait_secs": 60 }"#,
        )
        .unwrap();

        let strategy = config.build().unwrap();
        assert_eq!(strategy.kind(), StrategyKind::StaticCounter);
    }
}
