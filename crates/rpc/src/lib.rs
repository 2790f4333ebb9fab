//! Batched Ethereum JSON-RPC client.
//!
//! Batch requests carry one id per sub-request; nodes may answer out of
//! order, so responses are reassembled by id before results are handed back
//! in input order. A semaphore bounds the number of in-flight batches.

pub mod error;
pub mod types;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use alloy_primitives::{Address, I256, U256};
use futures::{stream, StreamExt, TryStreamExt};
use mevscope_common::{metrics::RPC_BATCHES, BalanceDelta, RetryPolicy, RpcConfig};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::warn;
use url::Url;

pub use error::RpcError;
pub use types::{BalanceChange, ExecutionHeader};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: Url,
    config: RpcConfig,
    retry: RetryPolicy,
    batch_permits: Arc<Semaphore>,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .expect("http client");
        let batch_permits = Arc::new(Semaphore::new(config.max_concurrent_batches));
        Self {
            http,
            endpoint: config.url.clone(),
            config,
            retry: RetryPolicy::default(),
            batch_permits,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// One batched request. Returns each sub-request's `result` in input
    /// order. Transport failures and 5xx are retried with backoff; malformed
    /// bodies are not.
    async fn batch(&self, calls: &[(&str, Value)]) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let _permit = self.batch_permits.acquire().await.expect("semaphore open");

        let base_id = self.next_id.fetch_add(calls.len() as u64, Ordering::Relaxed);
        let payload: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(idx, (method, params))| {
                json!({
                    "jsonrpc": "2.0",
                    "method": method,
                    "params": params,
                    "id": base_id + idx as u64,
                })
            })
            .collect();

        if let Some((method, _)) = calls.first() {
            RPC_BATCHES.with_label_values(&[method]).inc();
        }

        let body = self.send_with_retry(&payload).await?;

        let mut responses: Vec<RpcResponse> = serde_json::from_str(&body)
            .map_err(|e| RpcError::Protocol(format!("invalid batch response: {e}")))?;
        if responses.len() != calls.len() {
            return Err(RpcError::Protocol(format!(
                "expected {} results, got {}",
                calls.len(),
                responses.len()
            )));
        }

        // Reassemble by id; responses may arrive out of order.
        responses.sort_unstable_by_key(|r| r.id);
        Ok(responses
            .into_iter()
            .map(|response| match response.error {
                Some(err) => Err(RpcError::Rpc { code: err.code, message: err.message }),
                None => Ok(response.result.unwrap_or(Value::Null)),
            })
            .collect())
    }

    async fn send_with_retry(&self, payload: &[Value]) -> Result<String, RpcError> {
        let mut attempt = 0;
        loop {
            match self.send_once(payload).await {
                Ok(body) => return Ok(body),
                Err(err) if self.retry.is_exhausted(attempt) => {
                    return Err(RpcError::Transport {
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(attempt, ?backoff, %err, "rpc batch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_once(&self, payload: &[Value]) -> Result<String, TransientError> {
        let response = self.http.post(self.endpoint.clone()).json(payload).send().await?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransientError::Status(status));
        }
        let response = response.error_for_status()?;
        Ok(response.text().await?)
    }

    /// Headers for `numbers`, in input order. One batched call per chunk of
    /// `header_batch_size`, `max_concurrent_batches` chunks in flight.
    pub async fn get_block_headers(
        &self,
        numbers: &[u64],
    ) -> Result<Vec<ExecutionHeader>, RpcError> {
        let chunks: Vec<Vec<u64>> =
            numbers.chunks(self.config.header_batch_size).map(|c| c.to_vec()).collect();

        let headers: Vec<Vec<ExecutionHeader>> = stream::iter(chunks)
            .map(|chunk| async move { self.header_chunk(&chunk).await })
            .buffered(self.config.max_concurrent_batches)
            .try_collect()
            .await?;

        Ok(headers.into_iter().flatten().collect())
    }

    async fn header_chunk(&self, numbers: &[u64]) -> Result<Vec<ExecutionHeader>, RpcError> {
        let calls: Vec<(&str, Value)> = numbers
            .iter()
            .map(|n| ("eth_getBlockByNumber", json!([format!("{n:#x}"), false])))
            .collect();

        let results = self.batch(&calls).await?;
        numbers
            .iter()
            .zip(results)
            .map(|(number, result)| match result? {
                Value::Null => Err(RpcError::NotFound(*number)),
                value => serde_json::from_value(value)
                    .map_err(|e| RpcError::Protocol(format!("block {number}: {e}"))),
            })
            .collect()
    }

    /// Balances for `(address, block)` pairs, in input order.
    pub async fn get_balances(
        &self,
        requests: &[(Address, u64)],
    ) -> Result<Vec<U256>, RpcError> {
        let chunks: Vec<Vec<(Address, u64)>> =
            requests.chunks(self.config.balance_batch_size).map(|c| c.to_vec()).collect();

        let balances: Vec<Vec<U256>> = stream::iter(chunks)
            .map(|chunk| async move { self.balance_chunk(&chunk).await })
            .buffered(self.config.max_concurrent_batches)
            .try_collect()
            .await?;

        Ok(balances.into_iter().flatten().collect())
    }

    async fn balance_chunk(&self, requests: &[(Address, u64)]) -> Result<Vec<U256>, RpcError> {
        let calls: Vec<(&str, Value)> = requests
            .iter()
            .map(|(address, block)| {
                ("eth_getBalance", json!([format!("{address:#x}"), format!("{block:#x}")]))
            })
            .collect();

        let results = self.batch(&calls).await?;
        results
            .into_iter()
            .map(|result| {
                let value = result?;
                let raw: String = serde_json::from_value(value)
                    .map_err(|e| RpcError::Protocol(format!("balance: {e}")))?;
                U256::from_str_radix(raw.trim_start_matches("0x"), 16)
                    .map_err(|e| RpcError::Protocol(format!("balance {raw}: {e}")))
            })
            .collect()
    }

    /// Before/after balances across one block for each pair. All reads for a
    /// pair come from the same logical unit; any failed read fails the call
    /// so no partial row is written.
    pub async fn get_balance_changes(
        &self,
        requests: &[(Address, u64)],
    ) -> Result<Vec<BalanceChange>, RpcError> {
        let mut reads = Vec::with_capacity(requests.len() * 2);
        for (address, block_number) in requests {
            reads.push((*address, block_number - 1));
            reads.push((*address, *block_number));
        }

        let balances = self.get_balances(&reads).await?;

        Ok(requests
            .iter()
            .zip(balances.chunks_exact(2))
            .map(|((address, block_number), pair)| BalanceChange {
                address: *address,
                block_number: *block_number,
                balance_before: pair[0],
                balance_after: pair[1],
            })
            .collect())
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let results = self.batch(&[("eth_blockNumber", json!([]))]).await?;
        let raw: String = serde_json::from_value(results.into_iter().next().unwrap_or(Ok(Value::Null))?)
            .map_err(|e| RpcError::Protocol(format!("block number: {e}")))?;
        u64::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|e| RpcError::Protocol(format!("block number {raw}: {e}")))
    }
}

impl BalanceChange {
    pub fn into_balance_delta(self) -> BalanceDelta {
        BalanceDelta::new(self.block_number, self.address, self.balance_before, self.balance_after)
    }

    pub fn balance_increase(&self) -> I256 {
        I256::from_raw(self.balance_after).wrapping_sub(I256::from_raw(self.balance_before))
    }
}

#[derive(Debug, thiserror::Error)]
enum TransientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status {0}")]
    Status(StatusCode),
}
