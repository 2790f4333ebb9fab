//! Fee-recipient balance delta backfill, newest first. Recent blocks matter
//! most to the dashboards, so work is selected descending by number.

use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use mevscope_common::streams;
use mevscope_database::DatabaseService;
use mevscope_rpc::RpcClient;

use crate::driver::{BackfillError, BackfillSource, MAX_WORK_PER_SELECT};

/// (block, fee recipient) pairs per unit; each pair costs two balance reads.
const PAIRS_PER_UNIT: usize = 50;

pub struct BalanceBackfill<D> {
    db: D,
    rpc: Arc<RpcClient>,
}

impl<D: DatabaseService> BalanceBackfill<D> {
    pub fn new(db: D, rpc: Arc<RpcClient>) -> Self {
        Self { db, rpc }
    }
}

#[async_trait]
impl<D: DatabaseService> BackfillSource for BalanceBackfill<D> {
    type Unit = Vec<(u64, Address)>;

    fn stream_key(&self) -> String {
        streams::BUILDER_BALANCES.to_string()
    }

    async fn select_work(&self) -> Result<Vec<Self::Unit>, BackfillError> {
        let missing = self.db.blocks_missing_balance_deltas(MAX_WORK_PER_SELECT).await?;
        Ok(missing.chunks(PAIRS_PER_UNIT).map(|c| c.to_vec()).collect())
    }

    async fn process_unit(&self, pairs: Vec<(u64, Address)>) -> Result<(), BackfillError> {
        let requests: Vec<(Address, u64)> =
            pairs.iter().map(|(number, address)| (*address, *number)).collect();

        // all reads for a block come from one call; a failure writes nothing
        let changes = self.rpc.get_balance_changes(&requests).await?;
        let deltas: Vec<_> = changes.into_iter().map(|c| c.into_balance_delta()).collect();
        self.db.upsert_balance_deltas(&deltas).await?;
        Ok(())
    }
}
