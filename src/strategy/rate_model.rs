//! Time-based rate decay for unfilled offers.

use crate::config::{Config, DecayConfig};
use crate::error::{LendingError, Result};
use crate::exchange::{Currency, Offer};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Per-currency decay parameters.
#[derive(Debug, Clone, Default)]
pub struct DecaySchedule {
    configs: HashMap<Currency, DecayConfig>,
}

impl DecaySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule covering every currency in the configuration.
    pub fn from_config(config: &Config) -> Self {
        Currency::ALL
            .into_iter()
            .fold(Self::new(), |schedule, currency| {
                schedule.with(currency, config.currency(currency).decay.clone())
            })
    }

    pub fn with(mut self, currency: Currency, decay: DecayConfig) -> Self {
        self.configs.insert(currency, decay);
        self
    }

    pub fn get(&self, currency: Currency) -> Result<&DecayConfig> {
        self.configs
            .get(&currency)
            .ok_or_else(|| LendingError::UnrecognizedCurrency(currency.to_string()))
    }

    /// Rate an offer should be moved to, or `None` to leave it alone.
    ///
    /// One decay step is applied per whole `decrement_interval` since the
    /// offer was submitted. Offers already at or below the floor, or younger
    /// than one interval, are left unchanged.
    pub fn next_rate(&self, offer: &Offer, now: DateTime<Utc>) -> Result<Option<Decimal>> {
        let decay = self.get(offer.currency)?;

        if offer.rate <= decay.min_rate {
            return Ok(None);
        }

        let intervals = intervals_elapsed(offer.submitted_at, now, decay.decrement_interval());
        if intervals == 0 {
            return Ok(None);
        }

        Ok(Some(decay_rate(offer.rate, decay, intervals)))
    }
}

/// Whole decay intervals between `submitted_at` and `now`.
pub fn intervals_elapsed(
    submitted_at: DateTime<Utc>,
    now: DateTime<Utc>,
    interval: chrono::Duration,
) -> u64 {
    let elapsed_ms = (now - submitted_at).num_milliseconds();
    let interval_ms = interval.num_milliseconds();
    if elapsed_ms <= 0 || interval_ms <= 0 {
        return 0;
    }
    (elapsed_ms / interval_ms) as u64
}

/// Apply `intervals` decay steps to `rate` and clamp at the floor.
pub fn decay_rate(rate: Decimal, decay: &DecayConfig, intervals: u64) -> Decimal {
    let mut rate = rate;
    for _ in 0..intervals {
        rate -= decay.rate_decrement;
        // Asymptote at min_rate rather than at zero
        rate = (rate - decay.min_rate) * decay.decay_multiplier + decay.min_rate;
        // With non-negative decrement and multiplier the rate can't climb back over the floor.
        if rate <= decay.min_rate {
            break;
        }
    }
    rate.max(decay.min_rate)
}
