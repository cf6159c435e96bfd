//! Authenticated Bitfinex v1 REST client.
//!
//! Every request is signed (nonce + base64 payload + HMAC-SHA384), admitted
//! by the sliding-window rate limiter, and retried with exponential backoff
//! on connection failures and HTTP 500.

use super::rate_limiter::RateLimiter;
use super::retry::BackoffPolicy;
use crate::config::Config;
use crate::error::{LendingError, Result};
use crate::utils::Clock;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value};
use sha2::Sha384;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Signs, rate-limits and retries requests against the exchange.
pub struct SignedRequestClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    nonce: AtomicU64,
    rate_limiter: RateLimiter,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl SignedRequestClient {
    /// Create a client from configuration.
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let rate_limiter = RateLimiter::new(
            config.rate_limit.max_requests,
            config.rate_limit.interval(),
            clock.clone(),
        );
        Self::new(
            &config.exchange.api_key,
            &config.exchange.api_secret,
            &config.exchange.base_url,
            Duration::from_secs(config.exchange.request_timeout_secs),
            rate_limiter,
            config.retry.backoff_policy(),
            clock,
        )
    }

    pub fn new(
        api_key: &str,
        api_secret: &str,
        base_url: &str,
        timeout: Duration,
        rate_limiter: RateLimiter,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        // Nonces must never repeat or go backwards for this key, so seed from wall-clock seconds.
        let seed = clock.now().timestamp().max(0) as u64;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            nonce: AtomicU64::new(seed),
            rate_limiter,
            backoff,
            clock,
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    /// Merge `request` and `nonce` into the parameters and base64 the JSON.
    fn encode_payload(path: &str, mut params: Map<String, Value>, nonce: u64) -> Result<String> {
        params.insert("request".to_string(), Value::String(path.to_string()));
        params.insert("nonce".to_string(), Value::String(nonce.to_string()));
        let json = serde_json::to_vec(&Value::Object(params))?;
        Ok(BASE64_STANDARD.encode(json))
    }

    /// Generate HMAC-SHA384 signature of the encoded payload.
    fn sign(&self, payload: &str) -> String {
        let mut mac = Hmac::<Sha384>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Authenticated POST.
    pub async fn post(&self, path: &str, params: Map<String, Value>) -> Result<Value> {
        self.send(Method::POST, path, params).await
    }

    /// Authenticated GET for read-only lookups.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(Method::GET, path, Map::new()).await
    }

    /// Send one logical request and return the parsed JSON body.
    ///
    /// Takes exactly one rate-limiter slot no matter how many attempts the
    /// retry loop makes.
    pub async fn send(&self, method: Method, path: &str, params: Map<String, Value>) -> Result<Value> {
        self.rate_limiter.acquire().await;

        let nonce = self.next_nonce();
        let payload = Self::encode_payload(path, params, nonce)?;
        let signature = self.sign(&payload);
        let url = format!("{}{}", self.base_url, path);

        debug!(%method, path, nonce, "Sending signed request");

        let mut retry_count = 0u32;
        let (status, body) = loop {
            let attempt = self
                .http
                .request(method.clone(), &url)
                .header("X-BFX-APIKEY", &self.api_key)
                .header("X-BFX-PAYLOAD", &payload)
                .header("X-BFX-SIGNATURE", &signature)
                .send()
                .await;

            let reason = match attempt {
                Ok(response) if response.status() == StatusCode::INTERNAL_SERVER_ERROR => {
                    "500 internal server error".to_string()
                }
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        Ok(body) => break (status, body),
                        Err(e) if is_transient(&e) => format!("connection failed: {}", e),
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) if is_transient(&e) => format!("connection failed: {}", e),
                Err(e) => return Err(e.into()),
            };

            if !self.backoff.should_retry(retry_count) {
                error!(path, attempts = retry_count + 1, %reason, "Giving up on request");
                return Err(LendingError::RetriesExhausted {
                    path: path.to_string(),
                    attempts: retry_count + 1,
                });
            }

            let delay = self.backoff.delay(retry_count);
            warn!(
                path,
                retry_count,
                delay_secs = delay.as_secs_f64(),
                %reason,
                "Request failed, sleeping before retrying"
            );
            self.clock.sleep(delay).await;
            retry_count += 1;
        };

        if status != StatusCode::OK {
            error!(path, status = status.as_u16(), %body, "Request rejected by exchange");
            return Err(LendingError::Request {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

/// Connection refused, reset or dropped mid-response, and timeouts.
/// Builder, redirect and decode errors are not retried.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::rate_limiter::DEFAULT_INTERVAL;
    use crate::utils::ManualClock;
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "test-secret";

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn client_for(base_url: &str, clock: Arc<ManualClock>, backoff: BackoffPolicy) -> SignedRequestClient {
        let limiter = RateLimiter::new(60, DEFAULT_INTERVAL, clock.clone());
        SignedRequestClient::new(
            "test-key",
            SECRET,
            base_url,
            Duration::from_secs(5),
            limiter,
            backoff,
            clock,
        )
        .unwrap()
    }

    fn decode_payload(header: &str) -> Value {
        let bytes = BASE64_STANDARD.decode(header).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_retries_500_with_exponential_backoff_using_one_slot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/offers"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/offers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let clock = manual_clock();
        let client = client_for(&server.uri(), clock.clone(), BackoffPolicy::default());

        let body = client.post("/v1/offers", Map::new()).await.unwrap();

        assert_eq!(body, serde_json::json!([]));
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(client.rate_limiter().timestamps().await.len(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_non_500_error_is_fatal_and_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/offer/new"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"message":"Invalid offer: incorrect amount"}"#),
            )
            .mount(&server)
            .await;

        let clock = manual_clock();
        let client = client_for(&server.uri(), clock.clone(), BackoffPolicy::default());

        let err = client.post("/v1/offer/new", Map::new()).await.unwrap_err();

        match err {
            LendingError::Request { path, status, body } => {
                assert_eq!(path, "/v1/offer/new");
                assert_eq!(status, 400);
                assert!(body.contains("incorrect amount"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(clock.sleeps().is_empty());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_signed_headers_and_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/offer/cancel"))
            .and(header_exists("X-BFX-APIKEY"))
            .and(header_exists("X-BFX-PAYLOAD"))
            .and(header_exists("X-BFX-SIGNATURE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(2)
            .mount(&server)
            .await;

        let clock = manual_clock();
        let client = client_for(&server.uri(), clock.clone(), BackoffPolicy::default());

        let mut params = Map::new();
        params.insert("offer_id".to_string(), serde_json::json!(42));
        client.post("/v1/offer/cancel", params.clone()).await.unwrap();
        client.post("/v1/offer/cancel", params).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let mut nonces = Vec::new();
        for request in &requests {
            let api_key = request.headers.get("X-BFX-APIKEY").unwrap().to_str().unwrap();
            let payload = request.headers.get("X-BFX-PAYLOAD").unwrap().to_str().unwrap();
            let signature = request.headers.get("X-BFX-SIGNATURE").unwrap().to_str().unwrap();
            assert_eq!(api_key, "test-key");

            let mut mac = Hmac::<Sha384>::new_from_slice(SECRET.as_bytes()).unwrap();
            mac.update(payload.as_bytes());
            assert_eq!(signature, hex::encode(mac.finalize().into_bytes()));

            let decoded = decode_payload(payload);
            assert_eq!(decoded["request"], "/v1/offer/cancel");
            assert_eq!(decoded["offer_id"], 42);
            let nonce: u64 = decoded["nonce"].as_str().unwrap().parse().unwrap();
            nonces.push(nonce);
        }

        let seed = clock.now().timestamp() as u64;
        assert_eq!(nonces, vec![seed, seed + 1]);
    }

    #[tokio::test]
    async fn test_get_is_used_for_lookups() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/lendbook/USD"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"bids": [], "asks": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), manual_clock(), BackoffPolicy::default());
        let body = client.get("/v1/lendbook/USD").await.unwrap();
        assert_eq!(body["bids"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_connection_failure_retries_until_policy_gives_up() {
        // Bind then drop a listener so the port is known to refuse connections.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let clock = manual_clock();
        let backoff = BackoffPolicy {
            max_retries: Some(2),
            ..BackoffPolicy::default()
        };
        let client = client_for(&format!("http://{}", addr), clock.clone(), backoff);

        let err = client.post("/v1/balances", Map::new()).await.unwrap_err();

        assert!(matches!(
            err,
            LendingError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_dropped_connection_is_retried() {
        // Accept each connection and close it before any response is written.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let clock = manual_clock();
        let backoff = BackoffPolicy {
            max_retries: Some(2),
            ..BackoffPolicy::default()
        };
        let client = client_for(&format!("http://{}", addr), clock.clone(), backoff);

        let err = client.post("/v1/offers", Map::new()).await.unwrap_err();

        assert!(
            matches!(err, LendingError::RetriesExhausted { attempts: 3, .. }),
            "unexpected error: {:?}",
            err
        );
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert!(accepted.load(Ordering::SeqCst) >= 3);
        assert_eq!(client.rate_limiter().timestamps().await.len(), 1);
    }
}
