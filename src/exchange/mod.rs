//! Exchange integration for margin-funding offers.
//!
//! - `client`: signed, rate-limited, retrying REST client
//! - `gateway`: typed funding operations on top of the client
//! - `mock`: in-memory paper exchange for dry runs and tests

mod client;
mod gateway;
pub mod mock;
mod rate_limiter;
mod retry;
mod traits;
mod types;

pub use client::SignedRequestClient;
pub use gateway::BitfinexGateway;
pub use mock::{ExchangeCall, PaperExchange};
pub use rate_limiter::RateLimiter;
pub use retry::BackoffPolicy;
pub use traits::LendingExchange;
pub use types::*;
