use alloy_primitives::{Address, B256, U256};
use mevscope_common::{
    metrics::RELAY_PAGES, serde_utils::as_str, BlsPublicKey, RelayEntry, RelayPayload,
    RetryPolicy, PAYLOADS_DELIVERED_PATH,
};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{error::RelayClientError, rate_limit::TokenBucket};

/// One bid-trace row from `proposer_payload_delivered`. Every number is a
/// decimal string on the wire; fields beyond this set vary per relay and are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveredPayload {
    #[serde(with = "as_str")]
    pub slot: u64,
    pub parent_hash: B256,
    pub block_hash: B256,
    pub builder_pubkey: BlsPublicKey,
    pub proposer_pubkey: BlsPublicKey,
    pub proposer_fee_recipient: Address,
    #[serde(with = "as_str")]
    pub gas_limit: u64,
    #[serde(with = "as_str")]
    pub gas_used: u64,
    #[serde(with = "as_str")]
    pub value: U256,
    #[serde(with = "as_str")]
    pub block_number: u64,
    #[serde(with = "as_str", default = "default_num_tx")]
    pub num_tx: u32,
}

fn default_num_tx() -> u32 {
    0
}

impl DeliveredPayload {
    pub fn into_payload(self, relay: &str) -> RelayPayload {
        RelayPayload {
            relay: relay.to_string(),
            slot: self.slot,
            block_number: Some(self.block_number),
            parent_hash: self.parent_hash,
            block_hash: self.block_hash,
            builder_pubkey: self.builder_pubkey,
            proposer_pubkey: self.proposer_pubkey,
            proposer_fee_recipient: self.proposer_fee_recipient,
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            value: self.value,
            num_tx: self.num_tx,
        }
    }
}

/// One page of payloads plus the cursor for the next, older page.
#[derive(Debug)]
pub struct PayloadPage {
    pub payloads: Vec<RelayPayload>,
    pub next_cursor: Option<u64>,
}

/// Driver for one relay's data API: slot-cursor pagination, token-bucket
/// pacing, retry with backoff. One relay's failures never touch another's
/// driver.
pub struct RelayClient {
    entry: RelayEntry,
    http: reqwest::Client,
    bucket: TokenBucket,
    retry: RetryPolicy,
    base_url: Url,
}

impl RelayClient {
    pub fn new(entry: RelayEntry) -> Result<Self, RelayClientError> {
        Self::with_base_url(entry, format!("https://{}", entry.host))
    }

    /// Test seam: point the driver at an arbitrary endpoint.
    pub fn with_base_url(
        entry: RelayEntry,
        base_url: impl AsRef<str>,
    ) -> Result<Self, RelayClientError> {
        let base_url =
            Url::parse(base_url.as_ref()).map_err(|e| RelayClientError::Url(e.to_string()))?;
        Ok(Self {
            entry,
            http: reqwest::Client::new(),
            bucket: TokenBucket::new(entry.requests_per_sec, entry.burst),
            retry: RetryPolicy::default(),
            base_url,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn host(&self) -> &'static str {
        self.entry.host
    }

    /// One page of payloads at or below `cursor` (latest page when None),
    /// newest first. Rows are deduplicated by slot within the page; the next
    /// cursor is one below the oldest slot seen.
    pub async fn page(&self, cursor: Option<u64>) -> Result<PayloadPage, RelayClientError> {
        let mut query = vec![("limit", self.entry.page_limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let rows = self.fetch_payloads(&query).await?;

        // Relays occasionally repeat a slot within one page; last row wins.
        let mut payloads: Vec<RelayPayload> = Vec::with_capacity(rows.len());
        for row in rows {
            let payload = row.into_payload(self.entry.host);
            match payloads.iter_mut().find(|p| p.slot == payload.slot) {
                Some(existing) => *existing = payload,
                None => payloads.push(payload),
            }
        }

        let next_cursor = payloads
            .iter()
            .map(|p| p.slot)
            .min()
            .and_then(|oldest| oldest.checked_sub(1));

        Ok(PayloadPage { payloads, next_cursor })
    }

    /// Payloads the relay delivered for one block. Used by the live stage
    /// after the publication delay.
    pub async fn payloads_for_block(
        &self,
        block_number: u64,
    ) -> Result<Vec<RelayPayload>, RelayClientError> {
        let query = vec![("block_number", block_number.to_string())];
        let rows = self.fetch_payloads(&query).await?;
        Ok(rows.into_iter().map(|row| row.into_payload(self.entry.host)).collect())
    }

    async fn fetch_payloads(
        &self,
        query: &[(&str, String)],
    ) -> Result<Vec<DeliveredPayload>, RelayClientError> {
        let url = self
            .base_url
            .join(PAYLOADS_DELIVERED_PATH)
            .map_err(|e| RelayClientError::Url(e.to_string()))?;

        let mut attempt = 0;
        loop {
            self.bucket.acquire().await;

            match self.fetch_once(url.clone(), query).await {
                Ok(rows) => {
                    RELAY_PAGES.with_label_values(&[self.entry.host]).inc();
                    return Ok(rows);
                }
                // 429 backs off on the bucket without consuming retry budget.
                Err(FetchError::RateLimited) => {
                    warn!(relay = self.entry.host, "rate limited, backing off");
                    tokio::time::sleep(self.retry.base_delay).await;
                }
                // 404 means no rows for the query, not a failure.
                Err(FetchError::NotFound) => return Ok(Vec::new()),
                Err(FetchError::Decode(message)) => {
                    return Err(RelayClientError::Decode(message));
                }
                Err(FetchError::Status(status)) if status.is_client_error() => {
                    return Err(RelayClientError::Http { status });
                }
                Err(err) if self.retry.is_exhausted(attempt) => {
                    return Err(RelayClientError::Transport {
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    let backoff = self.retry.backoff(attempt);
                    debug!(relay = self.entry.host, attempt, ?backoff, %err, "retrying page");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<Vec<DeliveredPayload>, FetchError> {
        let response = self.http.get(url).query(query).send().await?;
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status if !status.is_success() => Err(FetchError::Status(status)),
            _ => {
                let body = response.text().await?;
                serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rate limited")]
    RateLimited,
    #[error("not found")]
    NotFound,
    #[error("status {0}")]
    Status(StatusCode),
    #[error("decode: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_entry() -> RelayEntry {
        RelayEntry {
            host: "boost-relay.flashbots.net",
            page_limit: 200,
            requests_per_sec: 1_000.0,
            burst: 1_000,
        }
    }

    fn trace_json(slot: u64, value: &str) -> String {
        format!(
            r#"{{"slot":"{slot}","parent_hash":"0x{ph}","block_hash":"0x{bh}",
               "builder_pubkey":"0x{pk}","proposer_pubkey":"0x{pk}",
               "proposer_fee_recipient":"0x{addr}","gas_limit":"30000000",
               "gas_used":"15000000","value":"{value}","num_tx":"120",
               "block_number":"18000000"}}"#,
            ph = "11".repeat(32),
            bh = "22".repeat(32),
            pk = "33".repeat(48),
            addr = "44".repeat(20),
        )
    }

    #[tokio::test]
    async fn page_parses_and_dedups_slots() {
        let mut server = mockito::Server::new_async().await;
        let body = format!("[{},{},{}]", trace_json(100, "1"), trace_json(99, "2"), trace_json(100, "3"));
        let _mock = server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "200".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let client = RelayClient::with_base_url(test_entry(), server.url()).unwrap();
        let page = client.page(None).await.unwrap();

        assert_eq!(page.payloads.len(), 2);
        assert_eq!(page.payloads[0].slot, 100);
        // duplicate slot 100: last row wins
        assert_eq!(page.payloads[0].value, U256::from(3u64));
        assert_eq!(page.next_cursor, Some(98));
    }

    #[tokio::test]
    async fn empty_page_has_no_cursor() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = RelayClient::with_base_url(test_entry(), server.url()).unwrap();
        let page = client.page(Some(5_000_000)).await.unwrap();

        assert!(page.payloads.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn not_found_is_empty() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let client = RelayClient::with_base_url(test_entry(), server.url()).unwrap();
        let payloads = client.payloads_for_block(18_000_000).await.unwrap();

        assert!(payloads.is_empty());
    }

    #[tokio::test]
    async fn transport_errors_exhaust_retry_budget() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(502)
            .expect_at_least(2)
            .create_async()
            .await;

        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let client = RelayClient::with_base_url(test_entry(), server.url())
            .unwrap()
            .with_retry_policy(retry);

        let err = client.page(None).await.unwrap_err();
        assert!(matches!(err, RelayClientError::Transport { attempts: 2, .. }));
    }
}
