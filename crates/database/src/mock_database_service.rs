//! In-memory stand-in for the postgres service, used by stage and backfill
//! tests. Mirrors the upsert-by-primary-key semantics of the real service,
//! including insertion-order retention for relay payloads.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::NaiveDate;
use mevscope_common::{
    chain::slot_to_date, streams, Adjustment, AggregateRecord, AuxiliaryBuilderDelta,
    BalanceDelta, BlockRecord, Checkpoint, RelayPayload,
};
use parking_lot::Mutex;

use crate::{error::DatabaseError, DatabaseService};

#[derive(Default)]
struct MockState {
    blocks: BTreeMap<u64, BlockRecord>,
    balance_deltas: BTreeMap<u64, BalanceDelta>,
    auxiliary_deltas: BTreeMap<(u64, Address), AuxiliaryBuilderDelta>,
    /// Insertion-ordered; an upsert of an existing (relay, slot) replaces in
    /// place, like the real table.
    relay_payloads: Vec<RelayPayload>,
    adjustments: BTreeMap<u64, Adjustment>,
    aggregates: BTreeMap<u64, AggregateRecord>,
    checkpoints: HashMap<String, Checkpoint>,
    fail_writes: bool,
}

#[derive(Clone, Default)]
pub struct MockDatabaseService {
    state: Arc<Mutex<MockState>>,
}

impl MockDatabaseService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, for failure-isolation tests.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn stored_blocks(&self) -> Vec<BlockRecord> {
        self.state.lock().blocks.values().cloned().collect()
    }

    pub fn stored_balance_deltas(&self) -> Vec<BalanceDelta> {
        self.state.lock().balance_deltas.values().cloned().collect()
    }

    pub fn stored_auxiliary_deltas(&self) -> Vec<AuxiliaryBuilderDelta> {
        self.state.lock().auxiliary_deltas.values().cloned().collect()
    }

    pub fn stored_relay_payloads(&self) -> Vec<RelayPayload> {
        self.state.lock().relay_payloads.clone()
    }

    pub fn stored_adjustments(&self) -> Vec<Adjustment> {
        self.state.lock().adjustments.values().cloned().collect()
    }

    pub fn stored_aggregates(&self) -> Vec<AggregateRecord> {
        self.state.lock().aggregates.values().cloned().collect()
    }

    fn check_writable(state: &MockState) -> Result<(), DatabaseError> {
        if state.fail_writes {
            return Err(DatabaseError::Migration("mock write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseService for MockDatabaseService {
    async fn upsert_blocks(&self, blocks: &[BlockRecord]) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        for block in blocks {
            state.blocks.insert(block.number, block.clone());
        }
        Ok(())
    }

    async fn upsert_balance_deltas(&self, deltas: &[BalanceDelta]) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        for delta in deltas {
            state.balance_deltas.insert(delta.block_number, delta.clone());
        }
        Ok(())
    }

    async fn upsert_auxiliary_deltas(
        &self,
        deltas: &[AuxiliaryBuilderDelta],
    ) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        for delta in deltas {
            state.auxiliary_deltas.insert((delta.block_number, delta.address), delta.clone());
        }
        Ok(())
    }

    async fn upsert_relay_payloads(&self, payloads: &[RelayPayload]) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        for payload in payloads {
            match state
                .relay_payloads
                .iter_mut()
                .find(|p| p.relay == payload.relay && p.slot == payload.slot)
            {
                Some(existing) => *existing = payload.clone(),
                None => state.relay_payloads.push(payload.clone()),
            }
        }
        Ok(())
    }

    async fn upsert_relay_payloads_with_checkpoint(
        &self,
        payloads: &[RelayPayload],
        checkpoint: &Checkpoint,
    ) -> Result<(), DatabaseError> {
        self.upsert_relay_payloads(payloads).await?;
        self.save_checkpoint(checkpoint).await
    }

    async fn upsert_adjustments(&self, adjustments: &[Adjustment]) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        for adjustment in adjustments {
            state.adjustments.insert(adjustment.slot, adjustment.clone());
        }
        Ok(())
    }

    async fn upsert_aggregates(&self, records: &[AggregateRecord]) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        for record in records {
            state.aggregates.insert(record.block_number, record.clone());
        }
        Ok(())
    }

    async fn get_checkpoint(&self, stream_key: &str) -> Result<Option<Checkpoint>, DatabaseError> {
        Ok(self.state.lock().checkpoints.get(stream_key).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        state.checkpoints.insert(checkpoint.stream_key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn completed_archive_dates(&self) -> Result<Vec<NaiveDate>, DatabaseError> {
        let prefix = format!("{}::", streams::BLOCK_ARCHIVE);
        let mut dates: Vec<NaiveDate> = self
            .state
            .lock()
            .checkpoints
            .values()
            .filter(|cp| cp.completed)
            .filter_map(|cp| cp.stream_key.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse().ok())
            .collect();
        dates.sort_unstable();
        Ok(dates)
    }

    async fn upsert_blocks_with_archive_date(
        &self,
        blocks: &[BlockRecord],
        date: NaiveDate,
    ) -> Result<(), DatabaseError> {
        self.upsert_blocks(blocks).await?;
        self.save_checkpoint(&Checkpoint {
            stream_key: format!("{}::{}", streams::BLOCK_ARCHIVE, date),
            cursor: None,
            last_processed_marker: Some(blocks.len() as i64),
            completed: true,
        })
        .await
    }

    async fn block_number_range(&self) -> Result<Option<(u64, u64)>, DatabaseError> {
        let state = self.state.lock();
        let min = state.blocks.keys().next().copied();
        let max = state.blocks.keys().next_back().copied();
        Ok(min.zip(max))
    }

    async fn missing_block_numbers(
        &self,
        lo: u64,
        hi: u64,
        limit: i64,
    ) -> Result<Vec<u64>, DatabaseError> {
        let state = self.state.lock();
        Ok((lo..=hi)
            .filter(|n| !state.blocks.contains_key(n))
            .take(limit as usize)
            .collect())
    }

    async fn blocks_missing_balance_deltas(
        &self,
        limit: i64,
    ) -> Result<Vec<(u64, Address)>, DatabaseError> {
        let state = self.state.lock();
        Ok(state
            .blocks
            .values()
            .rev()
            .filter(|b| !state.balance_deltas.contains_key(&b.number))
            .map(|b| (b.number, b.fee_recipient))
            .take(limit as usize)
            .collect())
    }

    async fn blocks_missing_auxiliary_deltas(
        &self,
        fee_recipients: &[Address],
        limit: i64,
    ) -> Result<Vec<(u64, Address)>, DatabaseError> {
        let state = self.state.lock();
        Ok(state
            .blocks
            .values()
            .rev()
            .filter(|b| fee_recipients.contains(&b.fee_recipient))
            .filter(|b| !state.auxiliary_deltas.keys().any(|(n, _)| *n == b.number))
            .map(|b| (b.number, b.fee_recipient))
            .take(limit as usize)
            .collect())
    }

    async fn blocks_missing_aggregates(&self, limit: i64) -> Result<Vec<u64>, DatabaseError> {
        let state = self.state.lock();
        Ok(state
            .blocks
            .keys()
            .rev()
            .filter(|n| !state.aggregates.contains_key(n))
            .copied()
            .take(limit as usize)
            .collect())
    }

    async fn unadjusted_slots(&self, relay: &str, limit: i64) -> Result<Vec<u64>, DatabaseError> {
        let state = self.state.lock();
        let mut slots: Vec<u64> = state
            .relay_payloads
            .iter()
            .filter(|p| p.relay == relay)
            .filter(|p| !state.adjustments.contains_key(&p.slot))
            .map(|p| p.slot)
            .collect();
        slots.sort_unstable_by(|a, b| b.cmp(a));
        slots.dedup();
        slots.truncate(limit as usize);
        Ok(slots)
    }

    async fn get_blocks_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<BlockRecord>, DatabaseError> {
        Ok(self.state.lock().blocks.range(lo..=hi).map(|(_, b)| b.clone()).collect())
    }

    async fn get_balance_deltas_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<BalanceDelta>, DatabaseError> {
        Ok(self.state.lock().balance_deltas.range(lo..=hi).map(|(_, d)| d.clone()).collect())
    }

    async fn get_auxiliary_deltas_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<AuxiliaryBuilderDelta>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .auxiliary_deltas
            .range((lo, Address::ZERO)..=(hi, Address::repeat_byte(0xff)))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn get_relay_payloads_for_blocks(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<RelayPayload>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .relay_payloads
            .iter()
            .filter(|p| p.block_number.is_some_and(|n| lo <= n && n <= hi))
            .cloned()
            .collect())
    }

    async fn get_adjustments_for_slots(
        &self,
        slots: &[u64],
    ) -> Result<Vec<Adjustment>, DatabaseError> {
        let state = self.state.lock();
        Ok(slots.iter().filter_map(|slot| state.adjustments.get(slot).cloned()).collect())
    }

    async fn relay_daily_counts(
        &self,
        relay: &str,
    ) -> Result<Vec<(NaiveDate, i64)>, DatabaseError> {
        let state = self.state.lock();
        let mut counts: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for payload in state.relay_payloads.iter().filter(|p| p.relay == relay) {
            *counts.entry(slot_to_date(payload.slot)).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}
