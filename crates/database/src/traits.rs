use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::NaiveDate;
use mevscope_common::{
    Adjustment, AggregateRecord, AuxiliaryBuilderDelta, BalanceDelta, BlockRecord, Checkpoint,
    RelayPayload,
};

use crate::error::DatabaseError;

/// Storage interface consumed by the live stages, the backfillers and the
/// aggregator. Every write is an upsert keyed by the entity's primary key, so
/// each stage is safely re-runnable.
#[async_trait]
pub trait DatabaseService: Send + Sync + Clone {
    async fn upsert_blocks(&self, blocks: &[BlockRecord]) -> Result<(), DatabaseError>;

    async fn upsert_balance_deltas(&self, deltas: &[BalanceDelta]) -> Result<(), DatabaseError>;

    async fn upsert_auxiliary_deltas(
        &self,
        deltas: &[AuxiliaryBuilderDelta],
    ) -> Result<(), DatabaseError>;

    async fn upsert_relay_payloads(&self, payloads: &[RelayPayload]) -> Result<(), DatabaseError>;

    /// Upserts payload rows and advances the relay's checkpoint in the same
    /// transaction, so a crash never records progress past committed rows.
    async fn upsert_relay_payloads_with_checkpoint(
        &self,
        payloads: &[RelayPayload],
        checkpoint: &Checkpoint,
    ) -> Result<(), DatabaseError>;

    async fn upsert_adjustments(&self, adjustments: &[Adjustment]) -> Result<(), DatabaseError>;

    async fn upsert_aggregates(&self, records: &[AggregateRecord]) -> Result<(), DatabaseError>;

    async fn get_checkpoint(&self, stream_key: &str) -> Result<Option<Checkpoint>, DatabaseError>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError>;

    /// Dates for which the block-archive backfill committed a full day.
    async fn completed_archive_dates(&self) -> Result<Vec<NaiveDate>, DatabaseError>;

    /// Marks one archive date complete together with the rows it covers.
    async fn upsert_blocks_with_archive_date(
        &self,
        blocks: &[BlockRecord],
        date: NaiveDate,
    ) -> Result<(), DatabaseError>;

    async fn block_number_range(&self) -> Result<Option<(u64, u64)>, DatabaseError>;

    /// Holes in the dense block-number sequence within `[lo, hi]`.
    async fn missing_block_numbers(
        &self,
        lo: u64,
        hi: u64,
        limit: i64,
    ) -> Result<Vec<u64>, DatabaseError>;

    /// Blocks without a fee-recipient balance delta, newest first.
    async fn blocks_missing_balance_deltas(
        &self,
        limit: i64,
    ) -> Result<Vec<(u64, Address)>, DatabaseError>;

    /// Blocks proposed by a known auxiliary-builder fee recipient that have
    /// no auxiliary delta rows yet, newest first.
    async fn blocks_missing_auxiliary_deltas(
        &self,
        fee_recipients: &[Address],
        limit: i64,
    ) -> Result<Vec<(u64, Address)>, DatabaseError>;

    /// Blocks without an aggregate record, newest first.
    async fn blocks_missing_aggregates(&self, limit: i64) -> Result<Vec<u64>, DatabaseError>;

    /// Delivered ultrasound slots with no adjustment row yet, newest first.
    async fn unadjusted_slots(&self, relay: &str, limit: i64) -> Result<Vec<u64>, DatabaseError>;

    async fn get_blocks_in_range(&self, lo: u64, hi: u64)
        -> Result<Vec<BlockRecord>, DatabaseError>;

    async fn get_balance_deltas_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<BalanceDelta>, DatabaseError>;

    async fn get_auxiliary_deltas_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<AuxiliaryBuilderDelta>, DatabaseError>;

    async fn get_relay_payloads_for_blocks(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<RelayPayload>, DatabaseError>;

    async fn get_adjustments_for_slots(
        &self,
        slots: &[u64],
    ) -> Result<Vec<Adjustment>, DatabaseError>;

    /// Payload counts per UTC day for one relay, for gap detection.
    async fn relay_daily_counts(
        &self,
        relay: &str,
    ) -> Result<Vec<(NaiveDate, i64)>, DatabaseError>;
}
