//! Main lending cycle: re-price aged offers, then lend idle balance.

use super::rebalancer::{OfferRebalancer, RebalanceReport};
use crate::config::Config;
use crate::error::Result;
use crate::exchange::{Currency, LendingExchange, Offer};
use crate::utils::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Longest single sleep between shutdown checks.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub rebalances: Vec<RebalanceReport>,
    /// Fresh offers placed from idle balance at the start rate
    pub placed: Vec<Offer>,
}

/// Counters kept across cycles for the shutdown summary.
#[derive(Debug, Default, Clone)]
pub struct LoopStats {
    pub cycles: u64,
    pub offers_cancelled: u64,
    pub offers_repriced: u64,
    pub buckets_skipped: u64,
    pub offers_placed: u64,
}

impl LoopStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        for rebalance in &report.rebalances {
            self.offers_cancelled += rebalance.cancelled.len() as u64;
            self.offers_repriced += rebalance.created().count() as u64;
            self.buckets_skipped += rebalance.skipped().count() as u64;
        }
        self.offers_placed += report.placed.len() as u64;
    }
}

/// Drives the lending cycle on a fixed interval. Owns timing, not decisions.
pub struct PollLoop<E: LendingExchange> {
    exchange: E,
    rebalancer: OfferRebalancer,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl<E: LendingExchange> PollLoop<E> {
    pub fn new(
        exchange: E,
        rebalancer: OfferRebalancer,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            exchange,
            rebalancer,
            config,
            clock,
        }
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// One pass: list offers, rebalance each enabled currency, then offer
    /// any available balance at the start rate.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let enabled = self.config.enabled_currencies();

        let offers = self.exchange.list_offers().await?;
        for currency in Currency::ALL {
            let open = offers.get(currency);
            if !open.is_empty() {
                debug!(%currency, count = open.len(), "Open lend offers");
                for offer in open {
                    debug!("   {}", offer);
                }
            }
        }

        for &currency in &enabled {
            let settings = self.config.currency(currency);
            let rebalance = self
                .rebalancer
                .rebalance(
                    &self.exchange,
                    offers.get(currency),
                    settings.lend_period_days,
                    settings.minimum_amount,
                )
                .await?;
            report.rebalances.push(rebalance);
        }

        let balances = self.exchange.available_balances().await?;
        for &currency in &enabled {
            let settings = self.config.currency(currency);
            let available = balances.get(currency);
            if available < settings.minimum_amount {
                debug!(
                    %currency,
                    %available,
                    minimum = %settings.minimum_amount,
                    "Available balance below minimum, not lending"
                );
                continue;
            }

            let offer = self
                .exchange
                .new_offer(
                    currency,
                    available,
                    settings.start_rate,
                    settings.lend_period_days,
                )
                .await?;
            info!(
                %currency,
                offer_id = offer.id,
                amount = %offer.amount,
                rate = %offer.rate,
                period_days = settings.lend_period_days,
                "Lent available balance at start rate"
            );
            report.placed.push(offer);
        }

        Ok(report)
    }

    /// Run cycles until `shutdown` is set or a cycle fails.
    ///
    /// A failed cycle ends the loop with its error; the exchange state is
    /// left for the next start to pick up.
    pub async fn run(&self, shutdown: &AtomicBool) -> Result<LoopStats> {
        let mut stats = LoopStats::default();
        let interval = self.config.poll.interval();

        while !shutdown.load(Ordering::SeqCst) {
            let started = self.clock.now();

            match self.run_cycle().await {
                Ok(report) => stats.record(&report),
                Err(e) => {
                    error!(cycle = stats.cycles + 1, error = %e, "Lending cycle failed");
                    return Err(e);
                }
            }

            let elapsed = (self.clock.now() - started).to_std().unwrap_or(Duration::ZERO);
            let mut remaining = interval.saturating_sub(elapsed);
            info!(
                cycle = stats.cycles,
                elapsed_ms = elapsed.as_millis() as u64,
                sleep_secs = remaining.as_secs_f64(),
                "Done processing, sleeping"
            );

            while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
                let step = remaining.min(SHUTDOWN_CHECK_INTERVAL);
                self.clock.sleep(step).await;
                remaining -= step;
            }
        }

        info!(
            cycles = stats.cycles,
            cancelled = stats.offers_cancelled,
            repriced = stats.offers_repriced,
            skipped = stats.buckets_skipped,
            placed = stats.offers_placed,
            "Poll loop stopped"
        );
        Ok(stats)
    }
}
