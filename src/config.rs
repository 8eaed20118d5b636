//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `CHARTFLEET_DATABASE_URL`: PostgreSQL connection string (required)
//! - `CHARTFLEET_INSTANCE_ID`: UUID of this instance (default: random)
//! - `CHARTFLEET_STARTUP_GRACE_PERIOD_MS`: Wait after overthrow before adopting (default: 5000)
//! - `CHARTFLEET_STARTUP_ADOPTION_FREQUENCY_MS`: Adoption retry period (default: 1000)
//! - `CHARTFLEET_DEATH_NOTE_INTERVAL_MS`: Dying-flag poll period (default: 500)
//! - `CHARTFLEET_DEFERRED_EVENTS_BATCH_SIZE`: Deferred events claimed per poll (default: 100)
//! - `CHARTFLEET_DEFERRED_EVENTS_LOOK_AHEAD_MS`: Claim window ahead of now (default: 30000)
//! - `CHARTFLEET_DEFERRED_EVENTS_INTERVAL_MS`: Deferred event poll period (default: 10000)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::model::InstanceId;

pub const DATABASE_URL_VAR: &str = "CHARTFLEET_DATABASE_URL";
const INSTANCE_ID_VAR: &str = "CHARTFLEET_INSTANCE_ID";
const GRACE_PERIOD_VAR: &str = "CHARTFLEET_STARTUP_GRACE_PERIOD_MS";
const ADOPTION_FREQUENCY_VAR: &str = "CHARTFLEET_STARTUP_ADOPTION_FREQUENCY_MS";
const DEATH_NOTE_INTERVAL_VAR: &str = "CHARTFLEET_DEATH_NOTE_INTERVAL_MS";
const BATCH_SIZE_VAR: &str = "CHARTFLEET_DEFERRED_EVENTS_BATCH_SIZE";
const LOOK_AHEAD_VAR: &str = "CHARTFLEET_DEFERRED_EVENTS_LOOK_AHEAD_MS";
const INTERVAL_VAR: &str = "CHARTFLEET_DEFERRED_EVENTS_INTERVAL_MS";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {var} value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be positive")]
    ZeroStartupInterval(&'static str),
    #[error("deferred events batch size must be positive")]
    ZeroBatchSize,
    #[error("deferred events poll interval must be positive")]
    ZeroInterval,
    #[error("deferred events look-ahead ({look_ahead_ms}ms) is shorter than the poll interval ({interval_ms}ms)")]
    LookAheadShorterThanInterval { look_ahead_ms: u128, interval_ms: u128 },
}

/// Startup sequence timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupConfig {
    /// Wait between overthrowing the cluster and the first adoption pass.
    pub grace_period: Duration,
    /// Period of the adoption retry loop.
    pub adoption_frequency: Duration,
    /// Period of the dying-flag poll behind death notes.
    pub death_note_interval: Duration,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(5000),
            adoption_frequency: Duration::from_millis(1000),
            death_note_interval: Duration::from_millis(500),
        }
    }
}

impl StartupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adoption_frequency.is_zero() {
            return Err(ConfigError::ZeroStartupInterval("adoption frequency"));
        }
        if self.death_note_interval.is_zero() {
            return Err(ConfigError::ZeroStartupInterval("death note interval"));
        }
        Ok(())
    }
}

/// Deferred event polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredEventsConfig {
    pub batch_size: usize,
    pub look_ahead: Duration,
    pub interval: Duration,
}

impl Default for DeferredEventsConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            look_ahead: Duration::from_millis(30_000),
            interval: Duration::from_millis(10_000),
        }
    }
}

impl DeferredEventsConfig {
    /// Reject settings that would leave gaps between look-ahead windows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.look_ahead < self.interval {
            return Err(ConfigError::LookAheadShorterThanInterval {
                look_ahead_ms: self.look_ahead.as_millis(),
                interval_ms: self.interval.as_millis(),
            });
        }
        Ok(())
    }
}

/// Everything one engine instance needs, minus the store connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineConfig {
    pub instance_id: InstanceId,
    pub startup: StartupConfig,
    pub deferred_events: DeferredEventsConfig,
}

impl EngineConfig {
    /// Read engine settings through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();
        let instance_id = match parse_var::<Uuid, _>(&lookup, INSTANCE_ID_VAR)? {
            Some(uuid) => InstanceId(uuid),
            None => defaults.instance_id,
        };
        let startup = StartupConfig {
            grace_period: millis_var(&lookup, GRACE_PERIOD_VAR)?
                .unwrap_or(defaults.startup.grace_period),
            adoption_frequency: millis_var(&lookup, ADOPTION_FREQUENCY_VAR)?
                .unwrap_or(defaults.startup.adoption_frequency),
            death_note_interval: millis_var(&lookup, DEATH_NOTE_INTERVAL_VAR)?
                .unwrap_or(defaults.startup.death_note_interval),
        };
        let deferred_events = DeferredEventsConfig {
            batch_size: parse_var(&lookup, BATCH_SIZE_VAR)?
                .unwrap_or(defaults.deferred_events.batch_size),
            look_ahead: millis_var(&lookup, LOOK_AHEAD_VAR)?
                .unwrap_or(defaults.deferred_events.look_ahead),
            interval: millis_var(&lookup, INTERVAL_VAR)?
                .unwrap_or(defaults.deferred_events.interval),
        };
        let config = Self {
            instance_id,
            startup,
            deferred_events,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a background loop spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.startup.validate()?;
        self.deferred_events.validate()
    }
}

/// Binary configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var(DATABASE_URL_VAR)
            .with_context(|| format!("{DATABASE_URL_VAR} environment variable is required"))?;
        let engine = EngineConfig::from_lookup(|key| env::var(key).ok())
            .context("invalid engine configuration")?;

        Ok(Self {
            database_url,
            engine,
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|err: T::Err| ConfigError::Invalid {
            var,
            value: value.clone(),
            reason: err.to_string(),
        })
}

fn millis_var<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<u64, _>(lookup, var)?.map(Duration::from_millis))
}
