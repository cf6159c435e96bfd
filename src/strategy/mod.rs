//! Lending strategy.
//!
//! Contains the core logic for:
//! - Time-based rate decay of unfilled offers
//! - Cancelling decayed offers and re-offering the pooled funds
//! - The poll loop that drives both on a fixed interval

mod poll_loop;
mod rate_model;
mod rebalancer;

pub use poll_loop::{CycleReport, LoopStats, PollLoop};
pub use rate_model::{decay_rate, intervals_elapsed, DecaySchedule};
pub use rebalancer::{
    BucketOutcome, CancelledOffer, OfferRebalancer, RebalanceReport, SkipReason,
};
