//! Type definitions for Bitfinex v1 funding API payloads.

use crate::error::{LendingError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Currencies the bot knows how to lend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Btc,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Usd, Currency::Btc];

    /// Symbol as the exchange spells it in offer payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Btc => "BTC",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = LendingError;

    // Offers say "USD", balances say "usd".
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "BTC" => Ok(Currency::Btc),
            _ => Err(LendingError::UnrecognizedCurrency(s.to_string())),
        }
    }
}

/// Raw offer as returned by `/v1/offers`, `/v1/offer/cancel` and `/v1/offer/new`.
#[derive(Debug, Clone, Deserialize)]
pub struct OfferResponse {
    pub id: u64,
    pub currency: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub timestamp: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub remaining_amount: Decimal,
    #[serde(default)]
    pub direction: String,
}

impl OfferResponse {
    /// Fixed-rate lend offer, as opposed to a borrow demand or an FRR offer.
    pub fn is_fixed_rate_lend(&self) -> bool {
        self.direction == "lend" && !self.rate.is_zero()
    }
}

/// An unfilled lending offer.
///
/// A value snapshot: the exchange never edits an offer in place, the bot
/// cancels and recreates instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Offer {
    pub id: u64,
    pub currency: Currency,
    /// Annualized percentage
    pub rate: Decimal,
    pub submitted_at: DateTime<Utc>,
    /// Remaining unfilled principal
    pub amount: Decimal,
}

impl TryFrom<OfferResponse> for Offer {
    type Error = LendingError;

    fn try_from(raw: OfferResponse) -> Result<Self> {
        let currency = raw.currency.parse()?;
        let seconds = raw.timestamp.trunc().to_i64().ok_or_else(|| {
            LendingError::InvalidResponse(format!("offer {} timestamp out of range", raw.id))
        })?;
        let submitted_at = DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
            LendingError::InvalidResponse(format!("offer {} timestamp out of range", raw.id))
        })?;

        Ok(Self {
            id: raw.id,
            currency,
            rate: raw.rate,
            submitted_at,
            amount: raw.remaining_amount,
        })
    }
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Offer(id={}, currency={}, rate={}%, amount={}, submitted_at={})",
            self.id,
            self.currency,
            self.rate,
            self.amount,
            self.submitted_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Lend offers partitioned by currency, each list in exchange response order.
#[derive(Debug, Clone, Default)]
pub struct OffersByCurrency {
    offers: BTreeMap<Currency, Vec<Offer>>,
}

impl OffersByCurrency {
    pub fn push(&mut self, offer: Offer) {
        self.offers.entry(offer.currency).or_default().push(offer);
    }

    /// Offers for one currency; empty if there are none.
    pub fn get(&self, currency: Currency) -> &[Offer] {
        self.offers.get(&currency).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.offers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Offer> {
        self.offers.values().flatten()
    }
}

impl FromIterator<Offer> for OffersByCurrency {
    fn from_iter<I: IntoIterator<Item = Offer>>(iter: I) -> Self {
        let mut partitioned = Self::default();
        for offer in iter {
            partitioned.push(offer);
        }
        partitioned
    }
}

/// Wallet balance entry from `/v1/balances`.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceEntry {
    #[serde(rename = "type")]
    pub wallet_type: String,
    pub currency: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available: Decimal,
}

/// Available funds in the deposit (funding) wallet, per currency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvailableBalances {
    balances: BTreeMap<Currency, Decimal>,
}

impl AvailableBalances {
    /// Keep deposit-wallet entries in supported currencies; everything else is ignored.
    pub fn from_entries(entries: &[BalanceEntry]) -> Self {
        let balances = entries
            .iter()
            .filter(|entry| entry.wallet_type == "deposit")
            .filter_map(|entry| {
                entry
                    .currency
                    .parse::<Currency>()
                    .ok()
                    .map(|currency| (currency, entry.available))
            })
            .collect();
        Self { balances }
    }

    pub fn set(&mut self, currency: Currency, available: Decimal) {
        self.balances.insert(currency, available);
    }

    /// Available amount, zero when the exchange reported nothing.
    pub fn get(&self, currency: Currency) -> Decimal {
        self.balances.get(&currency).copied().unwrap_or(Decimal::ZERO)
    }
}

/// One level of the public funding book.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LendbookEntry {
    #[serde(with = "rust_decimal::serde::str")]
    pub rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub period: u32,
    pub timestamp: String,
    /// "Yes" for flash-return-rate entries
    pub frr: String,
}

impl LendbookEntry {
    pub fn is_frr(&self) -> bool {
        self.frr.eq_ignore_ascii_case("yes")
    }
}

/// Public funding book from `/v1/lendbook/{currency}`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Lendbook {
    #[serde(default)]
    pub bids: Vec<LendbookEntry>,
    #[serde(default)]
    pub asks: Vec<LendbookEntry>,
}

impl Lendbook {
    /// Fixed-rate bids at or above `min_rate`.
    pub fn bids_at_or_above(&self, min_rate: Decimal) -> impl Iterator<Item = &LendbookEntry> {
        self.bids
            .iter()
            .filter(move |bid| !bid.is_frr() && bid.rate >= min_rate)
    }
}
