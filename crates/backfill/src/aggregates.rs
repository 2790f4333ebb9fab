//! Aggregate recompute backfill: derives `pbs_aggregates` rows for blocks
//! that have none, newest first. Rerunning over the same range converges to
//! an identical row set.

use async_trait::async_trait;
use mevscope_aggregate::Aggregator;
use mevscope_common::streams;
use mevscope_database::DatabaseService;

use crate::driver::{BackfillError, BackfillSource, MAX_WORK_PER_SELECT};

const BLOCKS_PER_UNIT: usize = 1_000;

pub struct AggregateBackfill<D: DatabaseService> {
    db: D,
    aggregator: Aggregator<D>,
}

impl<D: DatabaseService> AggregateBackfill<D> {
    pub fn new(db: D) -> Self {
        let aggregator = Aggregator::new(db.clone());
        Self { db, aggregator }
    }
}

#[async_trait]
impl<D: DatabaseService> BackfillSource for AggregateBackfill<D> {
    type Unit = (u64, u64);

    fn stream_key(&self) -> String {
        streams::PBS_AGGREGATES.to_string()
    }

    async fn select_work(&self) -> Result<Vec<(u64, u64)>, BackfillError> {
        let mut missing = self.db.blocks_missing_aggregates(MAX_WORK_PER_SELECT).await?;
        missing.sort_unstable();

        // fold missing numbers into contiguous [lo, hi] ranges
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for number in missing {
            match ranges.last_mut() {
                Some((lo, hi)) if number == *hi + 1 && (number - *lo) < BLOCKS_PER_UNIT as u64 => {
                    *hi = number;
                }
                _ => ranges.push((number, number)),
            }
        }

        // newest ranges first
        ranges.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        Ok(ranges)
    }

    async fn process_unit(&self, (lo, hi): (u64, u64)) -> Result<(), BackfillError> {
        self.aggregator.aggregate_and_store(lo, hi).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use alloy_primitives::{Address, Bytes, B256, B64};
    use chrono::{TimeZone, Utc};
    use mevscope_common::BlockRecord;
    use mevscope_database::MockDatabaseService;

    use super::*;
    use crate::driver::run_backfill;

    fn block(number: u64) -> BlockRecord {
        BlockRecord {
            number,
            hash: B256::with_last_byte(number as u8),
            parent_hash: B256::ZERO,
            nonce: B64::ZERO,
            sha3_uncles: B256::ZERO,
            transactions_root: B256::ZERO,
            state_root: B256::ZERO,
            receipts_root: B256::ZERO,
            fee_recipient: Address::ZERO,
            size: 0,
            extra_data: Bytes::from_static(b"geth/v1.13.0"),
            gas_limit: 30_000_000,
            gas_used: 0,
            timestamp: Utc.timestamp_opt(1_700_000_000 + number as i64 * 12, 0).unwrap(),
            transaction_count: 0,
            base_fee_per_gas: None,
        }
    }

    #[tokio::test]
    async fn contiguous_blocks_fold_into_ranges() {
        let db = MockDatabaseService::new();
        db.upsert_blocks(&[block(1), block(2), block(3), block(7), block(8)]).await.unwrap();

        let backfill = AggregateBackfill::new(db);
        let ranges = backfill.select_work().await.unwrap();
        assert_eq!(ranges, vec![(7, 8), (1, 3)]);
    }

    #[tokio::test]
    async fn all_stored_blocks_gain_aggregates() {
        let db = MockDatabaseService::new();
        db.upsert_blocks(&[block(1), block(2), block(5)]).await.unwrap();

        let backfill = Arc::new(AggregateBackfill::new(db.clone()));
        let report = run_backfill(backfill, 2).await.unwrap();

        assert_eq!(report.units_processed, 2);
        let aggregates = db.stored_aggregates();
        assert_eq!(aggregates.len(), 3);
        assert!(aggregates.iter().all(|a| a.is_block_vanilla && a.builder_name == "unknown"));
    }
}
