//! Exchange-agnostic lending operations.
//!
//! The strategy layer only talks to this trait, so the live gateway and the
//! in-memory paper exchange are interchangeable.

use super::types::{AvailableBalances, Currency, Lendbook, Offer, OffersByCurrency};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Typed funding-market operations.
#[async_trait]
pub trait LendingExchange: Send + Sync {
    /// Open fixed-rate lend offers, partitioned by currency.
    ///
    /// Borrow demands and flash-return-rate offers are excluded.
    async fn list_offers(&self) -> Result<OffersByCurrency>;

    /// Cancel an offer.
    ///
    /// Returns the offer as the exchange saw it at cancellation; its amount
    /// is what actually came back to the wallet and may be lower than the
    /// local snapshot if a partial fill happened in between.
    async fn cancel_offer(&self, offer: &Offer) -> Result<Offer>;

    /// Create a lend offer and return it as the exchange recorded it.
    async fn new_offer(
        &self,
        currency: Currency,
        amount: Decimal,
        rate: Decimal,
        period_days: u32,
    ) -> Result<Offer>;

    /// Available funds in the deposit wallet.
    async fn available_balances(&self) -> Result<AvailableBalances>;

    /// Public funding book for one currency.
    async fn lendbook(&self, currency: Currency) -> Result<Lendbook>;
}
