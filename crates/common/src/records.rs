//! Domain records shared by the ingestion stages, the backfillers and the
//! aggregator. Raw facts are write-once by their producing stage; upserts by
//! primary key keep every stage re-runnable.

use alloy_primitives::{Address, Bytes, FixedBytes, B256, B64, I256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 48-byte BLS public key, hex encoded on the wire.
pub type BlsPublicKey = FixedBytes<48>;

/// An execution-layer block header as stored in the `blocks` table.
/// Immutable after insert; upsert-by-number is the only mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub nonce: B64,
    pub sha3_uncles: B256,
    pub transactions_root: B256,
    pub state_root: B256,
    pub receipts_root: B256,
    /// The block's coinbase. Under PBS this is usually the builder.
    pub fee_recipient: Address,
    pub size: u64,
    /// Opaque builder tag, up to 32 bytes. Input to name normalization.
    pub extra_data: Bytes,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: DateTime<Utc>,
    pub transaction_count: u32,
    pub base_fee_per_gas: Option<u64>,
}

/// Fee-recipient balance change across one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub block_number: u64,
    pub address: Address,
    /// Balance at block N-1, wei.
    pub balance_before: U256,
    /// Balance at block N, wei.
    pub balance_after: U256,
    /// after - before; negative when the builder overpaid for the block.
    pub balance_increase: I256,
}

impl BalanceDelta {
    pub fn new(block_number: u64, address: Address, before: U256, after: U256) -> Self {
        let balance_increase = I256::from_raw(after).wrapping_sub(I256::from_raw(before));
        Self { block_number, address, balance_before: before, balance_after: after, balance_increase }
    }
}

/// Balance change of one known auxiliary builder wallet across one block.
/// Zero or more rows per block, keyed by `(block_number, address)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryBuilderDelta {
    pub block_number: u64,
    /// The auxiliary wallet being tracked.
    pub address: Address,
    /// The block's fee recipient that selected this auxiliary set.
    pub fee_recipient: Address,
    pub balance_before: U256,
    pub balance_after: U256,
    pub balance_increase: I256,
}

/// One relay's record of a delivered payload, keyed by `(relay, slot)`.
/// Several relays may deliver the same block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPayload {
    pub relay: String,
    pub slot: u64,
    /// Absent for bid rows that never won delivery.
    pub block_number: Option<u64>,
    pub parent_hash: B256,
    pub block_hash: B256,
    pub builder_pubkey: BlsPublicKey,
    pub proposer_pubkey: BlsPublicKey,
    pub proposer_fee_recipient: Address,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Bid value in wei; the authoritative builder -> proposer payment.
    pub value: U256,
    pub num_tx: u32,
}

/// Post-hoc bid adjustment published by a relay, keyed by slot.
/// Rows with `has_adjustment == false` record that the relay was queried and
/// had nothing, so the slot is not re-fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub slot: u64,
    pub relay: String,
    pub block_number: Option<u64>,
    pub builder_pubkey: Option<BlsPublicKey>,
    /// adjusted_value - submitted_value, wei. Negative when the relay
    /// reduced the winning bid.
    pub delta: Option<I256>,
    pub adjusted_value: Option<U256>,
    pub submitted_value: Option<U256>,
    pub adjusted_block_hash: Option<B256>,
    pub submitted_block_hash: Option<B256>,
    pub submitted_received_at: Option<String>,
    pub has_adjustment: bool,
    pub fetched_at: DateTime<Utc>,
}

/// The derived per-block record, fully recomputable from the raw tables.
/// Monetary fields are in ETH; wei arithmetic happens before conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    /// Consensus slot from relay payloads; None for vanilla blocks.
    pub slot: Option<u64>,
    pub builder_name: String,
    pub proposer_name: String,
    pub is_block_vanilla: bool,
    /// Delivering relays in insertion order; empty iff vanilla.
    pub relays: Vec<String>,
    pub n_relays: i32,
    pub builder_balance_increase: f64,
    pub builder_extra_transfers: f64,
    pub proposer_subsidy: f64,
    pub relay_fee: f64,
    pub total_value: f64,
}

/// Progress marker for one backfill stream. Streams are independent;
/// advancing one never blocks another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stream_key: String,
    /// Low-water mark for streams that also walk backwards (relay payloads).
    pub cursor: Option<i64>,
    pub last_processed_marker: Option<i64>,
    pub completed: bool,
}

impl Checkpoint {
    pub fn empty(stream_key: impl Into<String>) -> Self {
        Self { stream_key: stream_key.into(), cursor: None, last_processed_marker: None, completed: false }
    }
}

/// Checkpoint stream keys. One key per resumable backfill stream.
pub mod streams {
    pub const BLOCK_ARCHIVE: &str = "blocks::archive";
    pub const BUILDER_BALANCES: &str = "builder_balances";
    pub const EXTRA_BUILDER_BALANCES: &str = "extra_builder_balances";
    pub const ADJUSTMENTS: &str = "adjustments";
    pub const PBS_AGGREGATES: &str = "pbs_aggregates";

    pub fn relay_payloads(relay: &str) -> String {
        format!("relay_payloads::{relay}")
    }
}
