//! Configuration management for the cascade lender.
//!
//! Loads settings from an optional config file and environment variables.
//! Built once at startup and passed by reference; nothing reloads it.

use crate::exchange::{BackoffPolicy, Currency};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange API credentials and endpoint
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Request quota enforced locally
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Backoff for transient request failures
    #[serde(default)]
    pub retry: RetryConfig,
    /// Main loop timing
    #[serde(default)]
    pub poll: PollConfig,
    /// USD lending parameters
    #[serde(default = "default_usd")]
    pub usd: CurrencyConfig,
    /// BTC lending parameters
    #[serde(default = "default_btc")]
    pub btc: CurrencyConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key sent with every authenticated request
    #[serde(default)]
    pub api_key: String,
    /// Secret used to sign request payloads
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

// Keeps the secret out of logs.
impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .field("base_url", &self.base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests admitted in any trailing window
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    /// Window length in seconds
    #[serde(default = "default_rate_limit_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry; doubles each attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Give up after this many retries (unset = retry forever)
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Cap on a single backoff delay (unset = uncapped)
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Target time between the starts of two cycles
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
}

/// Lending parameters for one currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyConfig {
    /// Make offers in this currency at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Rate for fresh offers, percent per year
    pub start_rate: Decimal,
    /// Days we're willing to lend for (exchange allows 2-30)
    #[serde(default = "default_lend_period")]
    pub lend_period_days: u32,
    /// Smallest offer the exchange accepts
    pub minimum_amount: Decimal,
    /// How unfilled offers lose rate over time
    pub decay: DecayConfig,
}

/// Rate decay schedule for one currency.
///
/// Each elapsed interval applies the linear decrement and then the
/// exponential pull toward `min_rate`. Normally only one is active:
/// `rate_decrement = 0` with `decay_multiplier < 1`, or
/// `decay_multiplier = 1` with `rate_decrement > 0`. Setting both applies both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Floor, percent per year
    pub min_rate: Decimal,
    /// Subtracted from the rate each interval, percent per year
    #[serde(default)]
    pub rate_decrement: Decimal,
    /// new_rate = (rate - min_rate) * multiplier + min_rate
    #[serde(default = "default_decay_multiplier")]
    pub decay_multiplier: Decimal,
    /// Seconds between decay steps
    #[serde(default = "default_decrement_interval")]
    pub decrement_interval_secs: u64,
}

/// Longest accepted decay step: one year.
pub const MAX_DECREMENT_INTERVAL_SECS: u64 = 365 * 24 * 3600;

impl DecayConfig {
    /// Step length, capped at [`MAX_DECREMENT_INTERVAL_SECS`].
    pub fn decrement_interval(&self) -> chrono::Duration {
        let secs = self.decrement_interval_secs.min(MAX_DECREMENT_INTERVAL_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}

// Default value functions
fn default_base_url() -> String {
    "https://api.bitfinex.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_requests() -> usize {
    60
}

fn default_rate_limit_interval() -> u64 {
    70 // Exchange counts 60 requests per minute; 70s leaves slack for clock skew
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

fn default_lend_period() -> u32 {
    2
}

fn default_decay_multiplier() -> Decimal {
    Decimal::ONE // linear decay only
}

fn default_decrement_interval() -> u64 {
    3600
}

fn default_usd() -> CurrencyConfig {
    CurrencyConfig {
        enabled: true,
        start_rate: Decimal::new(30, 0), // 30% APR
        lend_period_days: default_lend_period(),
        minimum_amount: Decimal::new(50, 0), // exchange rejects offers under $50
        decay: DecayConfig {
            min_rate: Decimal::new(5, 0),
            rate_decrement: Decimal::new(1, 0),
            decay_multiplier: default_decay_multiplier(),
            decrement_interval_secs: default_decrement_interval(),
        },
    }
}

fn default_btc() -> CurrencyConfig {
    CurrencyConfig {
        enabled: false,
        start_rate: Decimal::new(5, 0),
        lend_period_days: default_lend_period(),
        minimum_amount: Decimal::new(1, 1), // 0.1 BTC
        decay: DecayConfig {
            min_rate: Decimal::new(1, 0),
            rate_decrement: Decimal::new(25, 2), // 0.25% per interval
            decay_multiplier: default_decay_multiplier(),
            decrement_interval_secs: default_decrement_interval(),
        },
    }
}

fn mask(key: &str) -> String {
    if key.chars().count() <= 6 {
        "***".to_string()
    } else {
        format!("{}***", key.chars().take(6).collect::<String>())
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        // Defaults are the bottom layer so a partial section keeps its other fields.
        let defaults = config::Config::try_from(&Self::default())
            .context("Failed to serialize default configuration")?;

        let config = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("CASCADE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Parameters for one currency.
    pub fn currency(&self, currency: Currency) -> &CurrencyConfig {
        match currency {
            Currency::Usd => &self.usd,
            Currency::Btc => &self.btc,
        }
    }

    /// Currencies with lending switched on, in a fixed order.
    pub fn enabled_currencies(&self) -> Vec<Currency> {
        Currency::ALL
            .into_iter()
            .filter(|c| self.currency(*c).enabled)
            .collect()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.rate_limit.max_requests > 0 && self.rate_limit.interval_secs > 0,
            "rate_limit.max_requests and rate_limit.interval_secs must be positive"
        );

        anyhow::ensure!(
            self.poll.interval_secs > 0,
            "poll.interval_secs must be positive"
        );

        anyhow::ensure!(
            self.retry.base_delay_ms > 0,
            "retry.base_delay_ms must be positive"
        );

        anyhow::ensure!(
            !self.enabled_currencies().is_empty(),
            "at least one currency must be enabled"
        );

        for currency in self.enabled_currencies() {
            self.currency(currency)
                .validate()
                .with_context(|| format!("invalid {} configuration", currency))?;
        }

        Ok(())
    }

    /// Live trading needs credentials; paper trading does not.
    pub fn validate_credentials(&self) -> Result<()> {
        anyhow::ensure!(
            !self.exchange.api_key.is_empty() && !self.exchange.api_secret.is_empty(),
            "exchange.api_key and exchange.api_secret are required for live lending"
        );
        Ok(())
    }
}

impl CurrencyConfig {
    fn validate(&self) -> Result<()> {
        let decay = &self.decay;

        anyhow::ensure!(
            decay.min_rate >= Decimal::ZERO,
            "min_rate must not be negative"
        );

        anyhow::ensure!(
            self.start_rate > decay.min_rate,
            "start_rate must be above min_rate"
        );

        anyhow::ensure!(
            decay.rate_decrement >= Decimal::ZERO,
            "rate_decrement must not be negative"
        );

        anyhow::ensure!(
            decay.decay_multiplier > Decimal::ZERO && decay.decay_multiplier <= Decimal::ONE,
            "decay_multiplier must be in (0, 1]"
        );

        anyhow::ensure!(
            decay.rate_decrement > Decimal::ZERO || decay.decay_multiplier < Decimal::ONE,
            "rate_decrement > 0 or decay_multiplier < 1 is needed for rates to decay"
        );

        anyhow::ensure!(
            decay.decrement_interval_secs > 0
                && decay.decrement_interval_secs <= MAX_DECREMENT_INTERVAL_SECS,
            "decrement_interval_secs must be between 1 and {}",
            MAX_DECREMENT_INTERVAL_SECS
        );

        anyhow::ensure!(
            (2..=30).contains(&self.lend_period_days),
            "lend_period_days must be between 2 and 30"
        );

        anyhow::ensure!(
            self.minimum_amount > Decimal::ZERO,
            "minimum_amount must be positive"
        );

        Ok(())
    }
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl RetryConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_retries: self.max_retries,
            max_delay: self.max_delay_secs.map(Duration::from_secs),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            usd: default_usd(),
            btc: default_btc(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            interval_secs: default_rate_limit_interval(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_retries: None,
            max_delay_secs: None,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
        }
    }
}
