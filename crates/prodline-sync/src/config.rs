//! Runtime configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Tuning for the local engine and the scene's visual effects.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Interval between local engine ticks
    pub tick_interval: Duration,
    /// Chance per tick that a product arrives in a random queue (0.0 - 1.0)
    pub arrival_probability: f64,
    /// How long a machine flash stays visible
    pub flash_duration: Duration,
    /// Lower bound for a new machine's processing time, in ms
    pub min_processing_ms: u64,
    /// Upper bound for a new machine's processing time, in ms
    pub max_processing_ms: u64,
    /// Seed for deterministic runs; entropy when absent
    pub seed: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1500),
            arrival_probability: 0.5,
            flash_duration: Duration::from_millis(500),
            min_processing_ms: 1000,
            max_processing_ms: 4000,
            seed: None,
        }
    }
}

impl SyncConfig {
    /// Create config from `PRODLINE_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let tick_ms = parse_var(&lookup, "PRODLINE_TICK_MS")?
            .unwrap_or(defaults.tick_interval.as_millis() as u64);
        let flash_ms = parse_var(&lookup, "PRODLINE_FLASH_MS")?
            .unwrap_or(defaults.flash_duration.as_millis() as u64);

        let config = Self {
            tick_interval: Duration::from_millis(tick_ms),
            arrival_probability: parse_var(&lookup, "PRODLINE_ARRIVAL_PROBABILITY")?
                .unwrap_or(defaults.arrival_probability),
            flash_duration: Duration::from_millis(flash_ms),
            min_processing_ms: parse_var(&lookup, "PRODLINE_MIN_PROCESSING_MS")?
                .unwrap_or(defaults.min_processing_ms),
            max_processing_ms: parse_var(&lookup, "PRODLINE_MAX_PROCESSING_MS")?
                .unwrap_or(defaults.max_processing_ms),
            seed: parse_var(&lookup, "PRODLINE_SEED")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants between fields.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::Config("tick interval must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.arrival_probability) {
            return Err(Error::Config(format!(
                "arrival probability {} outside 0.0..=1.0",
                self.arrival_probability
            )));
        }
        if self.min_processing_ms == 0 || self.min_processing_ms > self.max_processing_ms {
            return Err(Error::Config(format!(
                "processing range {}..={} ms is empty",
                self.min_processing_ms, self.max_processing_ms
            )));
        }
        Ok(())
    }

    /// Builder-style seed override.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builder-style tick override.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Builder-style arrival probability override.
    #[must_use]
    pub fn with_arrival_probability(mut self, probability: f64) -> Self {
        self.arrival_probability = probability;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid {key}: {raw:?}"))),
    }
}
