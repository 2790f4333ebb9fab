use alloy_primitives::{B256, I256, U256};
use chrono::Utc;
use mevscope_common::{
    serde_utils::as_opt_str, Adjustment, BlsPublicKey, RetryPolicy, ULTRASOUND_ADJUSTMENTS_PATH,
    ULTRASOUND_RELAY,
};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::RelayClientError;

#[derive(Debug, Deserialize)]
struct AdjustmentsEnvelope {
    #[serde(default)]
    data: Vec<AdjustmentData>,
}

/// One adjustment row. Wei values are decimal strings; `delta` is signed.
#[derive(Debug, Deserialize)]
struct AdjustmentData {
    #[serde(default)]
    adjusted_block_hash: Option<B256>,
    #[serde(default, with = "as_opt_str")]
    adjusted_value: Option<U256>,
    #[serde(default)]
    block_number: Option<u64>,
    #[serde(default)]
    builder_pubkey: Option<BlsPublicKey>,
    #[serde(default, with = "as_opt_str")]
    delta: Option<I256>,
    #[serde(default)]
    submitted_block_hash: Option<B256>,
    #[serde(default)]
    submitted_received_at: Option<String>,
    #[serde(default, with = "as_opt_str")]
    submitted_value: Option<U256>,
}

/// Client for the ultrasound relay's per-slot bid adjustment feed.
pub struct AdjustmentsClient {
    http: reqwest::Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl AdjustmentsClient {
    pub fn new() -> Result<Self, RelayClientError> {
        Self::with_base_url(format!("https://{ULTRASOUND_RELAY}"))
    }

    pub fn with_base_url(base_url: impl AsRef<str>) -> Result<Self, RelayClientError> {
        let base_url =
            Url::parse(base_url.as_ref()).map_err(|e| RelayClientError::Url(e.to_string()))?;
        Ok(Self { http: reqwest::Client::new(), base_url, retry: RetryPolicy::default() })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetches the adjustment for one slot. A successful fetch with no
    /// adjustment yields a marker record so the slot is not re-queried.
    pub async fn fetch_for_slot(&self, slot: u64) -> Result<Adjustment, RelayClientError> {
        let mut url = self
            .base_url
            .join(ULTRASOUND_ADJUSTMENTS_PATH)
            .map_err(|e| RelayClientError::Url(e.to_string()))?;
        url.set_query(Some(&format!("slot={slot}")));

        let mut attempt = 0;
        let envelope = loop {
            match self.fetch_once(url.clone()).await {
                Ok(envelope) => break envelope,
                Err(err) if self.retry.is_exhausted(attempt) => {
                    return Err(RelayClientError::Transport {
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    let backoff = self.retry.backoff(attempt);
                    debug!(slot, attempt, ?backoff, %err, "retrying adjustment fetch");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        };

        Ok(match envelope.data.into_iter().next() {
            Some(data) => Adjustment {
                slot,
                relay: ULTRASOUND_RELAY.to_string(),
                block_number: data.block_number,
                builder_pubkey: data.builder_pubkey,
                delta: data.delta,
                adjusted_value: data.adjusted_value,
                submitted_value: data.submitted_value,
                adjusted_block_hash: data.adjusted_block_hash,
                submitted_block_hash: data.submitted_block_hash,
                submitted_received_at: data.submitted_received_at,
                has_adjustment: true,
                fetched_at: Utc::now(),
            },
            None => Adjustment {
                slot,
                relay: ULTRASOUND_RELAY.to_string(),
                block_number: None,
                builder_pubkey: None,
                delta: None,
                adjusted_value: None,
                submitted_value: None,
                adjusted_block_hash: None,
                submitted_block_hash: None,
                submitted_received_at: None,
                has_adjustment: false,
                fetched_at: Utc::now(),
            },
        })
    }

    async fn fetch_once(&self, url: Url) -> Result<AdjustmentsEnvelope, FetchError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status {0}")]
    Status(StatusCode),
    #[error("decode: {0}")]
    Decode(String),
}
