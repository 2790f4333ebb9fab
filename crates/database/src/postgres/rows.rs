//! Row -> record parsing helpers. Hashes, addresses and pubkeys are stored
//! as 0x-prefixed hex text.

use std::str::FromStr;

use alloy_primitives::{Address, Bytes, B256, B64};
use mevscope_common::{
    Adjustment, AuxiliaryBuilderDelta, BalanceDelta, BlockRecord, BlsPublicKey, Checkpoint,
    RelayPayload,
};
use tokio_postgres::Row;

use crate::{
    error::DatabaseError,
    postgres::numeric::{PgNumeric, PgSignedNumeric},
};

pub fn parse_hex<T: FromStr>(raw: &str) -> Result<T, DatabaseError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().map_err(DatabaseError::row_parsing)
}

fn opt_hex<T: FromStr>(raw: Option<&str>) -> Result<Option<T>, DatabaseError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(parse_hex).transpose()
}

pub fn parse_block_row(row: &Row) -> Result<BlockRecord, DatabaseError> {
    Ok(BlockRecord {
        number: row.get::<_, i64>("number") as u64,
        hash: parse_hex::<B256>(row.get("hash"))?,
        parent_hash: parse_hex::<B256>(row.get("parent_hash"))?,
        nonce: parse_hex::<B64>(row.get("nonce"))?,
        sha3_uncles: parse_hex::<B256>(row.get("sha3_uncles"))?,
        transactions_root: parse_hex::<B256>(row.get("transactions_root"))?,
        state_root: parse_hex::<B256>(row.get("state_root"))?,
        receipts_root: parse_hex::<B256>(row.get("receipts_root"))?,
        fee_recipient: parse_hex::<Address>(row.get("fee_recipient"))?,
        size: row.get::<_, i64>("size") as u64,
        extra_data: parse_hex::<Bytes>(row.get("extra_data"))?,
        gas_limit: row.get::<_, i64>("gas_limit") as u64,
        gas_used: row.get::<_, i64>("gas_used") as u64,
        timestamp: row.get("timestamp"),
        transaction_count: row.get::<_, i32>("transaction_count") as u32,
        base_fee_per_gas: row.get::<_, Option<i64>>("base_fee_per_gas").map(|v| v as u64),
    })
}

pub fn parse_balance_delta_row(row: &Row) -> Result<BalanceDelta, DatabaseError> {
    Ok(BalanceDelta {
        block_number: row.get::<_, i64>("block_number") as u64,
        address: parse_hex::<Address>(row.get("address"))?,
        balance_before: row.get::<_, PgNumeric>("balance_before").into(),
        balance_after: row.get::<_, PgNumeric>("balance_after").into(),
        balance_increase: row.get::<_, PgSignedNumeric>("balance_increase").into(),
    })
}

pub fn parse_auxiliary_delta_row(row: &Row) -> Result<AuxiliaryBuilderDelta, DatabaseError> {
    Ok(AuxiliaryBuilderDelta {
        block_number: row.get::<_, i64>("block_number") as u64,
        address: parse_hex::<Address>(row.get("address"))?,
        fee_recipient: parse_hex::<Address>(row.get("fee_recipient"))?,
        balance_before: row.get::<_, PgNumeric>("balance_before").into(),
        balance_after: row.get::<_, PgNumeric>("balance_after").into(),
        balance_increase: row.get::<_, PgSignedNumeric>("balance_increase").into(),
    })
}

pub fn parse_relay_payload_row(row: &Row) -> Result<RelayPayload, DatabaseError> {
    Ok(RelayPayload {
        relay: row.get("relay"),
        slot: row.get::<_, i64>("slot") as u64,
        block_number: row.get::<_, Option<i64>>("block_number").map(|n| n as u64),
        parent_hash: parse_hex::<B256>(row.get("parent_hash"))?,
        block_hash: parse_hex::<B256>(row.get("block_hash"))?,
        builder_pubkey: parse_hex::<BlsPublicKey>(row.get("builder_pubkey"))?,
        proposer_pubkey: parse_hex::<BlsPublicKey>(row.get("proposer_pubkey"))?,
        proposer_fee_recipient: parse_hex::<Address>(row.get("proposer_fee_recipient"))?,
        gas_limit: row.get::<_, i64>("gas_limit") as u64,
        gas_used: row.get::<_, i64>("gas_used") as u64,
        value: row.get::<_, PgNumeric>("value").into(),
        num_tx: row.get::<_, i32>("num_tx") as u32,
    })
}

pub fn parse_adjustment_row(row: &Row) -> Result<Adjustment, DatabaseError> {
    Ok(Adjustment {
        slot: row.get::<_, i64>("slot") as u64,
        relay: row.get("relay"),
        block_number: row.get::<_, Option<i64>>("block_number").map(|n| n as u64),
        builder_pubkey: opt_hex::<BlsPublicKey>(row.get("builder_pubkey"))?,
        delta: row.get::<_, Option<PgSignedNumeric>>("delta").map(Into::into),
        adjusted_value: row.get::<_, Option<PgNumeric>>("adjusted_value").map(Into::into),
        submitted_value: row.get::<_, Option<PgNumeric>>("submitted_value").map(Into::into),
        adjusted_block_hash: opt_hex::<B256>(row.get("adjusted_block_hash"))?,
        submitted_block_hash: opt_hex::<B256>(row.get("submitted_block_hash"))?,
        submitted_received_at: row.get("submitted_received_at"),
        has_adjustment: row.get("has_adjustment"),
        fetched_at: row.get("fetched_at"),
    })
}

pub fn parse_checkpoint_row(row: &Row) -> Checkpoint {
    Checkpoint {
        stream_key: row.get("stream_key"),
        cursor: row.get("cursor"),
        last_processed_marker: row.get("last_processed_marker"),
        completed: row.get("completed"),
    }
}
