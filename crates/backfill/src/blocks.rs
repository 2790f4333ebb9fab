//! Block history backfills: the parquet archive for bulk history, batched
//! RPC for holes the archive cannot cover.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::NaiveDate;
use mevscope_archive::ArchiveReader;
use mevscope_database::DatabaseService;
use mevscope_rpc::RpcClient;
use tracing::{info, warn};

use crate::driver::{BackfillError, BackfillSource, MAX_WORK_PER_SELECT};

/// Dates handed out per selector round.
const DATES_PER_ROUND: usize = 100;

/// Missing blocks fetched per RPC unit.
const BLOCKS_PER_RPC_UNIT: usize = 50;

/// Date-ascending archive backfill. One date is one atomic unit: all of the
/// date's rows and its checkpoint commit together.
pub struct BlockArchiveBackfill<D> {
    db: D,
    archive: ArchiveReader,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

impl<D: DatabaseService> BlockArchiveBackfill<D> {
    pub fn new(db: D, archive: ArchiveReader, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self { db, archive, start_date, end_date }
    }
}

#[async_trait]
impl<D: DatabaseService> BackfillSource for BlockArchiveBackfill<D> {
    type Unit = NaiveDate;

    fn stream_key(&self) -> String {
        mevscope_common::streams::BLOCK_ARCHIVE.to_string()
    }

    async fn select_work(&self) -> Result<Vec<NaiveDate>, BackfillError> {
        let completed: HashSet<NaiveDate> =
            self.db.completed_archive_dates().await?.into_iter().collect();

        let mut pending = Vec::new();
        let mut date = self.start_date;
        while date <= self.end_date && pending.len() < DATES_PER_ROUND {
            if !completed.contains(&date) {
                pending.push(date);
            }
            date = date.succ_opt().expect("date in range");
        }
        Ok(pending)
    }

    async fn process_unit(&self, date: NaiveDate) -> Result<(), BackfillError> {
        let blocks = self.archive.blocks_for_date(date).await?;
        if blocks.is_empty() {
            // listed but empty partition: treat like a missing date
            return Err(BackfillError::Unit(format!("empty archive partition for {date}")));
        }
        let count = blocks.len();
        self.db.upsert_blocks_with_archive_date(&blocks, date).await?;
        info!(%date, blocks = count, "archived date committed");
        Ok(())
    }
}

/// Fills holes in the dense block-number sequence with batched
/// `eth_getBlockByNumber` calls. Covers the tail beyond the archive's last
/// partition and any days the archive skipped.
pub struct BlockGapRepair<D> {
    db: D,
    rpc: Arc<RpcClient>,
}

impl<D: DatabaseService> BlockGapRepair<D> {
    pub fn new(db: D, rpc: Arc<RpcClient>) -> Self {
        Self { db, rpc }
    }
}

#[async_trait]
impl<D: DatabaseService> BackfillSource for BlockGapRepair<D> {
    type Unit = Vec<u64>;

    fn stream_key(&self) -> String {
        "blocks::gap_repair".to_string()
    }

    async fn select_work(&self) -> Result<Vec<Vec<u64>>, BackfillError> {
        let Some((lo, hi)) = self.db.block_number_range().await? else {
            return Ok(Vec::new());
        };

        let missing = self.db.missing_block_numbers(lo, hi, MAX_WORK_PER_SELECT).await?;
        if !missing.is_empty() {
            warn!(holes = missing.len(), lo, hi, "found holes in block sequence");
        }
        Ok(missing.chunks(BLOCKS_PER_RPC_UNIT).map(|c| c.to_vec()).collect())
    }

    async fn process_unit(&self, numbers: Vec<u64>) -> Result<(), BackfillError> {
        let headers = self.rpc.get_block_headers(&numbers).await?;
        let blocks = headers
            .into_iter()
            .map(|header| header.into_record())
            .collect::<Result<Vec<_>, _>>()?;
        self.db.upsert_blocks(&blocks).await?;
        Ok(())
    }
}
