//! Typed Bitfinex funding operations on top of the signed client.

use super::client::SignedRequestClient;
use super::traits::LendingExchange;
use super::types::*;
use crate::error::{LendingError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

/// Live exchange gateway.
pub struct BitfinexGateway {
    client: SignedRequestClient,
}

impl BitfinexGateway {
    pub fn new(client: SignedRequestClient) -> Self {
        Self { client }
    }
}

fn parse<T: DeserializeOwned>(path: &str, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| LendingError::InvalidResponse(format!("{}: {}", path, e)))
}

#[async_trait]
impl LendingExchange for BitfinexGateway {
    #[instrument(skip(self))]
    async fn list_offers(&self) -> Result<OffersByCurrency> {
        let body = self.client.post("/v1/offers", Map::new()).await?;
        let raw: Vec<OfferResponse> = parse("/v1/offers", body)?;
        let total = raw.len();

        let offers = raw
            .into_iter()
            .filter(OfferResponse::is_fixed_rate_lend)
            .map(Offer::try_from)
            .collect::<Result<OffersByCurrency>>()?;

        debug!(total, lend_offers = offers.len(), "Fetched offers");
        Ok(offers)
    }

    #[instrument(skip(self, offer), fields(offer_id = offer.id, currency = %offer.currency))]
    async fn cancel_offer(&self, offer: &Offer) -> Result<Offer> {
        let mut params = Map::new();
        params.insert("offer_id".to_string(), Value::from(offer.id));

        let body = self.client.post("/v1/offer/cancel", params).await?;
        let cancelled: OfferResponse = parse("/v1/offer/cancel", body)?;
        let cancelled = Offer::try_from(cancelled)?;

        info!(
            rate = %cancelled.rate,
            remaining = %cancelled.amount,
            "Offer cancelled"
        );
        Ok(cancelled)
    }

    #[instrument(skip(self))]
    async fn new_offer(
        &self,
        currency: Currency,
        amount: Decimal,
        rate: Decimal,
        period_days: u32,
    ) -> Result<Offer> {
        let mut params = Map::new();
        params.insert("currency".to_string(), Value::from(currency.as_str()));
        params.insert("amount".to_string(), Value::from(amount.to_string()));
        params.insert("rate".to_string(), Value::from(rate.to_string()));
        params.insert("period".to_string(), Value::from(period_days));
        params.insert("direction".to_string(), Value::from("lend"));

        let body = self.client.post("/v1/offer/new", params).await?;
        let created: OfferResponse = parse("/v1/offer/new", body)?;
        let created = Offer::try_from(created)?;

        info!(offer_id = created.id, "Offer created");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn available_balances(&self) -> Result<AvailableBalances> {
        let body = self.client.post("/v1/balances", Map::new()).await?;
        let entries: Vec<BalanceEntry> = parse("/v1/balances", body)?;
        Ok(AvailableBalances::from_entries(&entries))
    }

    #[instrument(skip(self))]
    async fn lendbook(&self, currency: Currency) -> Result<Lendbook> {
        let path = format!("/v1/lendbook/{}", currency.as_str());
        let body = self.client.get(&path).await?;
        parse(&path, body)
    }
}
