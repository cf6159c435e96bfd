//! In-memory paper exchange for dry runs and tests.
//!
//! Holds offers and deposit balances, records every call, and fills offers
//! whose rate is at or below a simulated market rate.

use super::traits::LendingExchange;
use super::types::*;
use crate::error::{LendingError, Result};
use crate::utils::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A call made against the paper exchange, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeCall {
    ListOffers,
    Cancel { offer_id: u64 },
    New {
        currency: Currency,
        amount: Decimal,
        rate: Decimal,
        period_days: u32,
    },
    Balances,
    Lendbook { currency: Currency },
}

/// Simulated account state.
#[derive(Debug, Default)]
pub struct PaperState {
    pub offers: Vec<Offer>,
    pub available: BTreeMap<Currency, Decimal>,
    /// Principal that has been lent out through fills
    pub lent: BTreeMap<Currency, Decimal>,
    /// Offers at or below this rate fill in full on the next listing
    pub market_rates: BTreeMap<Currency, Decimal>,
    pub calls: Vec<ExchangeCall>,
    pub reject_new_offers: bool,
    next_id: u64,
}

/// Paper-trading implementation of [`LendingExchange`].
pub struct PaperExchange {
    state: Arc<RwLock<PaperState>>,
    clock: Arc<dyn Clock>,
}

impl PaperExchange {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let state = PaperState {
            next_id: 1,
            ..PaperState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            clock,
        }
    }

    /// Credit the deposit wallet.
    pub async fn deposit(&self, currency: Currency, amount: Decimal) {
        let mut state = self.state.write().await;
        *state.available.entry(currency).or_default() += amount;
    }

    /// Place an offer directly, as if it had been created in an earlier run.
    /// Does not touch balances.
    pub async fn seed_offer(
        &self,
        currency: Currency,
        rate: Decimal,
        amount: Decimal,
        submitted_at: DateTime<Utc>,
    ) -> Offer {
        let mut state = self.state.write().await;
        let offer = Offer {
            id: state.next_id,
            currency,
            rate,
            submitted_at,
            amount,
        };
        state.next_id += 1;
        state.offers.push(offer.clone());
        offer
    }

    /// Fill part of an open offer right now.
    pub async fn fill(&self, offer_id: u64, amount: Decimal) {
        let mut state = self.state.write().await;
        let Some(index) = state.offers.iter().position(|o| o.id == offer_id) else {
            return;
        };
        let filled = amount.min(state.offers[index].amount);
        let currency = state.offers[index].currency;
        state.offers[index].amount -= filled;
        *state.lent.entry(currency).or_default() += filled;
        if state.offers[index].amount.is_zero() {
            state.offers.remove(index);
        }
    }

    /// Simulated best borrower rate; cheaper offers fill on the next listing.
    pub async fn set_market_rate(&self, currency: Currency, rate: Decimal) {
        self.state.write().await.market_rates.insert(currency, rate);
    }

    /// Make `new_offer` fail the way the exchange rejects a bad offer.
    pub async fn reject_new_offers(&self, reject: bool) {
        self.state.write().await.reject_new_offers = reject;
    }

    pub async fn calls(&self) -> Vec<ExchangeCall> {
        self.state.read().await.calls.clone()
    }

    pub async fn open_offers(&self) -> Vec<Offer> {
        self.state.read().await.offers.clone()
    }

    pub async fn available(&self, currency: Currency) -> Decimal {
        self.state
            .read()
            .await
            .available
            .get(&currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn lent(&self, currency: Currency) -> Decimal {
        self.state
            .read()
            .await
            .lent
            .get(&currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn match_market(state: &mut PaperState) {
        let market_rates = state.market_rates.clone();
        let mut filled = Vec::new();
        state.offers.retain(|offer| {
            let fills = market_rates
                .get(&offer.currency)
                .is_some_and(|market| offer.rate <= *market);
            if fills {
                filled.push(offer.clone());
            }
            !fills
        });
        for offer in filled {
            info!(
                offer_id = offer.id,
                currency = %offer.currency,
                rate = %offer.rate,
                amount = %offer.amount,
                "[PAPER] Offer filled"
            );
            *state.lent.entry(offer.currency).or_default() += offer.amount;
        }
    }
}

fn rejected(path: &str, message: &str) -> LendingError {
    LendingError::Request {
        path: path.to_string(),
        status: 400,
        body: format!(r#"{{"message":"{}"}}"#, message),
    }
}

#[async_trait]
impl LendingExchange for PaperExchange {
    async fn list_offers(&self) -> Result<OffersByCurrency> {
        let mut state = self.state.write().await;
        state.calls.push(ExchangeCall::ListOffers);
        Self::match_market(&mut state);
        Ok(state
            .offers
            .iter()
            .filter(|o| !o.rate.is_zero())
            .cloned()
            .collect())
    }

    async fn cancel_offer(&self, offer: &Offer) -> Result<Offer> {
        let mut state = self.state.write().await;
        state.calls.push(ExchangeCall::Cancel { offer_id: offer.id });

        let index = state
            .offers
            .iter()
            .position(|o| o.id == offer.id)
            .ok_or_else(|| rejected("/v1/offer/cancel", "Offer could not be cancelled."))?;
        let cancelled = state.offers.remove(index);
        *state.available.entry(cancelled.currency).or_default() += cancelled.amount;

        debug!(offer_id = cancelled.id, remaining = %cancelled.amount, "[PAPER] Offer cancelled");
        Ok(cancelled)
    }

    async fn new_offer(
        &self,
        currency: Currency,
        amount: Decimal,
        rate: Decimal,
        period_days: u32,
    ) -> Result<Offer> {
        let mut state = self.state.write().await;
        state.calls.push(ExchangeCall::New {
            currency,
            amount,
            rate,
            period_days,
        });

        if state.reject_new_offers {
            return Err(rejected("/v1/offer/new", "Invalid offer."));
        }
        let available = state.available.get(&currency).copied().unwrap_or(Decimal::ZERO);
        if amount <= Decimal::ZERO || amount > available {
            return Err(rejected(
                "/v1/offer/new",
                "Invalid offer: not enough balance",
            ));
        }

        state.available.insert(currency, available - amount);
        let offer = Offer {
            id: state.next_id,
            currency,
            rate,
            submitted_at: self.clock.now(),
            amount,
        };
        state.next_id += 1;
        state.offers.push(offer.clone());

        debug!(offer_id = offer.id, %currency, %rate, %amount, "[PAPER] Offer created");
        Ok(offer)
    }

    async fn available_balances(&self) -> Result<AvailableBalances> {
        let mut state = self.state.write().await;
        state.calls.push(ExchangeCall::Balances);

        let mut balances = AvailableBalances::default();
        for (currency, available) in &state.available {
            balances.set(*currency, *available);
        }
        Ok(balances)
    }

    async fn lendbook(&self, currency: Currency) -> Result<Lendbook> {
        let mut state = self.state.write().await;
        state.calls.push(ExchangeCall::Lendbook { currency });
        // No simulated borrowers, so the book is always empty.
        Ok(Lendbook::default())
    }
}
