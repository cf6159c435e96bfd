//! Offer rebalancing: cancel decayed offers and re-pool their funds.

use super::rate_model::DecaySchedule;
use crate::error::{LendingError, Result};
use crate::exchange::{Currency, LendingExchange, Offer};
use crate::utils::Clock;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a rate bucket was not re-offered.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Pooled amount does not exceed the exchange's minimum offer size
    BelowMinimum { minimum: Decimal },
}

/// Result for one target-rate bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketOutcome {
    Created {
        rate: Decimal,
        amount: Decimal,
        offer: Offer,
    },
    Skipped {
        rate: Decimal,
        amount: Decimal,
        reason: SkipReason,
    },
}

/// An offer pulled for re-pricing.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelledOffer {
    /// Local snapshot that was decided on
    pub original: Offer,
    /// Exchange's view at cancellation
    pub cancelled: Offer,
    pub new_rate: Decimal,
}

/// Everything one rebalancing pass did.
#[derive(Debug, Clone, Default)]
pub struct RebalanceReport {
    pub currency: Option<Currency>,
    pub cancelled: Vec<CancelledOffer>,
    pub outcomes: Vec<BucketOutcome>,
}

impl RebalanceReport {
    pub fn created(&self) -> impl Iterator<Item = &Offer> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            BucketOutcome::Created { offer, .. } => Some(offer),
            BucketOutcome::Skipped { .. } => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &BucketOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, BucketOutcome::Skipped { .. }))
    }

    pub fn is_noop(&self) -> bool {
        self.cancelled.is_empty() && self.outcomes.is_empty()
    }
}

/// Moves aged offers down the decay schedule.
pub struct OfferRebalancer {
    schedule: DecaySchedule,
    clock: Arc<dyn Clock>,
}

impl OfferRebalancer {
    pub fn new(schedule: DecaySchedule, clock: Arc<dyn Clock>) -> Self {
        Self { schedule, clock }
    }

    /// Offers whose rate should change, paired with their new rate.
    ///
    /// Pure: decides without touching the exchange.
    pub fn plan<'a>(&self, offers: &'a [Offer]) -> Result<Vec<(&'a Offer, Decimal)>> {
        let now = self.clock.now();
        let mut plan = Vec::new();
        for offer in offers {
            if let Some(rate) = self.schedule.next_rate(offer, now)? {
                plan.push((offer, rate));
            }
        }
        Ok(plan)
    }

    /// Run one rebalancing pass over offers of a single currency.
    ///
    /// Each decayed offer is cancelled and the amount the exchange hands
    /// back is pooled by target rate. One new offer is placed per pool that
    /// exceeds `minimum_amount`; smaller pools are skipped and stay in the
    /// wallet until the next balance sweep re-offers them at the start rate.
    pub async fn rebalance<E: LendingExchange + ?Sized>(
        &self,
        exchange: &E,
        offers: &[Offer],
        lend_period_days: u32,
        minimum_amount: Decimal,
    ) -> Result<RebalanceReport> {
        let Some(first) = offers.first() else {
            return Ok(RebalanceReport::default());
        };
        let currency = first.currency;
        if let Some(other) = offers.iter().find(|o| o.currency != currency) {
            return Err(LendingError::MixedCurrencies {
                expected: currency,
                found: other.currency,
            });
        }

        let mut report = RebalanceReport {
            currency: Some(currency),
            ..RebalanceReport::default()
        };

        let plan = self.plan(offers)?;
        if plan.is_empty() {
            debug!(%currency, offers = offers.len(), "No offers due for a rate change");
            return Ok(report);
        }

        let mut buckets: BTreeMap<Decimal, Decimal> = BTreeMap::new();
        for (offer, new_rate) in plan {
            let cancelled = exchange.cancel_offer(offer).await?;
            info!(
                %currency,
                offer_id = offer.id,
                old_rate = %offer.rate,
                new_rate = %new_rate,
                amount = %cancelled.amount,
                "Cancelled offer for re-pricing"
            );
            *buckets.entry(new_rate).or_default() += cancelled.amount;
            report.cancelled.push(CancelledOffer {
                original: offer.clone(),
                cancelled,
                new_rate,
            });
        }

        for (rate, amount) in buckets {
            if amount > minimum_amount {
                let offer = exchange
                    .new_offer(currency, amount, rate, lend_period_days)
                    .await?;
                info!(
                    %currency,
                    offer_id = offer.id,
                    %rate,
                    %amount,
                    period_days = lend_period_days,
                    "Re-offered pooled funds"
                );
                report.outcomes.push(BucketOutcome::Created {
                    rate,
                    amount,
                    offer,
                });
            } else {
                warn!(
                    %currency,
                    %rate,
                    %amount,
                    minimum = %minimum_amount,
                    "Pooled amount below minimum offer size, skipping"
                );
                report.outcomes.push(BucketOutcome::Skipped {
                    rate,
                    amount,
                    reason: SkipReason::BelowMinimum {
                        minimum: minimum_amount,
                    },
                });
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecayConfig;
    use crate::exchange::{ExchangeCall, PaperExchange};
    use crate::utils::ManualClock;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap()
    }

    fn hours_ago(hours: i64) -> DateTime<Utc> {
        now() - chrono::Duration::hours(hours)
    }

    fn setup() -> (PaperExchange, OfferRebalancer) {
        let clock = Arc::new(ManualClock::new(now()));
        let usd = DecayConfig {
            min_rate: dec!(0),
            rate_decrement: dec!(1),
            decay_multiplier: Decimal::ONE,
            decrement_interval_secs: 3600,
        };
        let btc = DecayConfig {
            min_rate: dec!(1),
            ..usd.clone()
        };
        let schedule = DecaySchedule::new()
            .with(Currency::Usd, usd)
            .with(Currency::Btc, btc);
        (
            PaperExchange::new(clock.clone()),
            OfferRebalancer::new(schedule, clock),
        )
    }

    fn new_offer_calls(calls: &[ExchangeCall]) -> Vec<ExchangeCall> {
        calls
            .iter()
            .filter(|c| matches!(c, ExchangeCall::New { .. }))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_empty_input_is_noop() {
        let (exchange, rebalancer) = setup();

        let report = rebalancer.rebalance(&exchange, &[], 2, dec!(50)).await.unwrap();

        assert!(report.is_noop());
        assert!(exchange.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_decays_to_distinct_buckets() {
        let (exchange, rebalancer) = setup();
        let a = exchange
            .seed_offer(Currency::Usd, dec!(5), dec!(100), hours_ago(2))
            .await;
        let b = exchange
            .seed_offer(Currency::Usd, dec!(4), dec!(200), hours_ago(2))
            .await;

        let report = rebalancer
            .rebalance(&exchange, &[a.clone(), b.clone()], 2, dec!(50))
            .await
            .unwrap();

        assert_eq!(report.cancelled.len(), 2);
        let created: Vec<(Decimal, Decimal)> =
            report.created().map(|o| (o.rate, o.amount)).collect();
        assert_eq!(created, vec![(dec!(2), dec!(200)), (dec!(3), dec!(100))]);

        let calls = exchange.calls().await;
        assert_eq!(calls[0], ExchangeCall::Cancel { offer_id: a.id });
        assert_eq!(calls[1], ExchangeCall::Cancel { offer_id: b.id });
        assert_eq!(new_offer_calls(&calls).len(), 2);
    }

    #[tokio::test]
    async fn test_offers_landing_on_same_rate_are_pooled() {
        let (exchange, rebalancer) = setup();
        // 6% after 3h and 4% after 1h both land on 3%.
        let a = exchange
            .seed_offer(Currency::Usd, dec!(6), dec!(120), hours_ago(3))
            .await;
        let b = exchange
            .seed_offer(Currency::Usd, dec!(4), dec!(80.5), hours_ago(1))
            .await;

        let report = rebalancer
            .rebalance(&exchange, &[a, b], 2, dec!(50))
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(
            new_offer_calls(&exchange.calls().await),
            vec![ExchangeCall::New {
                currency: Currency::Usd,
                amount: dec!(200.5),
                rate: dec!(3),
                period_days: 2,
            }]
        );
    }

    #[tokio::test]
    async fn test_uses_amount_returned_by_cancel() {
        let (exchange, rebalancer) = setup();
        let offer = exchange
            .seed_offer(Currency::Usd, dec!(8), dec!(500), hours_ago(1))
            .await;
        // Partial fill lands between listing and cancellation.
        exchange.fill(offer.id, dec!(180)).await;

        let report = rebalancer
            .rebalance(&exchange, &[offer], 2, dec!(50))
            .await
            .unwrap();

        let created: Vec<&Offer> = report.created().collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].amount, dec!(320));
        assert_eq!(created[0].rate, dec!(7));
    }

    #[tokio::test]
    async fn test_bucket_below_minimum_is_reported_not_submitted() {
        let (exchange, rebalancer) = setup();
        let small = exchange
            .seed_offer(Currency::Usd, dec!(10), dec!(50), hours_ago(2))
            .await;
        let large = exchange
            .seed_offer(Currency::Usd, dec!(9), dec!(400), hours_ago(2))
            .await;

        let report = rebalancer
            .rebalance(&exchange, &[small, large], 2, dec!(50))
            .await
            .unwrap();

        // Equal to the minimum is not enough.
        let skipped: Vec<&BucketOutcome> = report.skipped().collect();
        assert_eq!(
            skipped,
            vec![&BucketOutcome::Skipped {
                rate: dec!(8),
                amount: dec!(50),
                reason: SkipReason::BelowMinimum { minimum: dec!(50) },
            }]
        );
        assert_eq!(report.created().count(), 1);
        assert_eq!(new_offer_calls(&exchange.calls().await).len(), 1);
        // The skipped funds sit in the wallet for the next balance sweep.
        assert_eq!(exchange.available(Currency::Usd).await, dec!(50));
    }

    #[tokio::test]
    async fn test_fresh_and_floored_offers_are_left_alone() {
        let (exchange, rebalancer) = setup();
        let fresh = exchange
            .seed_offer(Currency::Btc, dec!(4), dec!(1), now())
            .await;
        let floored = exchange
            .seed_offer(Currency::Btc, dec!(1), dec!(1), hours_ago(48))
            .await;

        let report = rebalancer
            .rebalance(&exchange, &[fresh, floored], 2, dec!(0.1))
            .await
            .unwrap();

        assert!(report.is_noop());
        assert_eq!(report.currency, Some(Currency::Btc));
        assert!(exchange.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_currencies_rejected_before_any_request() {
        let (exchange, rebalancer) = setup();
        let usd = exchange
            .seed_offer(Currency::Usd, dec!(5), dec!(100), hours_ago(2))
            .await;
        let btc = exchange
            .seed_offer(Currency::Btc, dec!(5), dec!(1), hours_ago(2))
            .await;

        let err = rebalancer
            .rebalance(&exchange, &[usd, btc], 2, dec!(50))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LendingError::MixedCurrencies {
                expected: Currency::Usd,
                found: Currency::Btc
            }
        ));
        assert!(exchange.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_new_offer_propagates() {
        let (exchange, rebalancer) = setup();
        let offer = exchange
            .seed_offer(Currency::Usd, dec!(5), dec!(100), hours_ago(2))
            .await;
        exchange.reject_new_offers(true).await;

        let err = rebalancer
            .rebalance(&exchange, &[offer], 2, dec!(50))
            .await
            .unwrap_err();

        assert!(matches!(err, LendingError::Request { status: 400, .. }));
    }
}
