//! # Cascade Lender
//!
//! Margin-funding lending bot for Bitfinex. Offers start at a high rate and
//! step down over time until they fill or reach a floor.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `error`: Library error type
//! - `exchange`: Signed REST client, rate limiter, gateway, and paper exchange
//! - `strategy`: Rate decay, offer rebalancing, and the poll loop
//! - `utils`: Injectable clock

pub mod config;
pub mod error;
pub mod exchange;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{LendingError, Result};
