//! Auxiliary builder wallet balance backfill. Only blocks proposed by a fee
//! recipient with a known auxiliary set are selected; each block yields one
//! row per auxiliary wallet.

use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use mevscope_common::{auxiliary_addresses_for, streams, AuxiliaryBuilderDelta, KNOWN_AUXILIARY_BUILDERS};
use mevscope_database::DatabaseService;
use mevscope_rpc::RpcClient;

use crate::driver::{BackfillError, BackfillSource, MAX_WORK_PER_SELECT};

const BLOCKS_PER_UNIT: usize = 50;

pub struct AuxiliaryBalanceBackfill<D> {
    db: D,
    rpc: Arc<RpcClient>,
}

impl<D: DatabaseService> AuxiliaryBalanceBackfill<D> {
    pub fn new(db: D, rpc: Arc<RpcClient>) -> Self {
        Self { db, rpc }
    }

    fn tracked_fee_recipients() -> Vec<Address> {
        KNOWN_AUXILIARY_BUILDERS.iter().map(|set| set.fee_recipient).collect()
    }
}

#[async_trait]
impl<D: DatabaseService> BackfillSource for AuxiliaryBalanceBackfill<D> {
    type Unit = Vec<(u64, Address)>;

    fn stream_key(&self) -> String {
        streams::EXTRA_BUILDER_BALANCES.to_string()
    }

    async fn select_work(&self) -> Result<Vec<Self::Unit>, BackfillError> {
        let recipients = Self::tracked_fee_recipients();
        let missing =
            self.db.blocks_missing_auxiliary_deltas(&recipients, MAX_WORK_PER_SELECT).await?;
        Ok(missing.chunks(BLOCKS_PER_UNIT).map(|c| c.to_vec()).collect())
    }

    async fn process_unit(&self, blocks: Vec<(u64, Address)>) -> Result<(), BackfillError> {
        // expand each block into its auxiliary wallet reads
        let mut requests: Vec<(Address, u64)> = Vec::new();
        let mut owners: Vec<(u64, Address)> = Vec::new();
        for (number, fee_recipient) in &blocks {
            for auxiliary in auxiliary_addresses_for(fee_recipient) {
                requests.push((*auxiliary, *number));
                owners.push((*number, *fee_recipient));
            }
        }
        if requests.is_empty() {
            return Ok(());
        }

        let changes = self.rpc.get_balance_changes(&requests).await?;

        let deltas: Vec<AuxiliaryBuilderDelta> = changes
            .into_iter()
            .zip(owners)
            .map(|(change, (number, fee_recipient))| AuxiliaryBuilderDelta {
                block_number: number,
                address: change.address,
                fee_recipient,
                balance_before: change.balance_before,
                balance_after: change.balance_after,
                balance_increase: change.balance_increase(),
            })
            .collect();

        self.db.upsert_auxiliary_deltas(&deltas).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mevscope_database::MockDatabaseService;

    use super::*;

    #[tokio::test]
    async fn only_tracked_fee_recipients_are_selected() {
        use alloy_primitives::{Bytes, B256, B64};
        use chrono::{TimeZone, Utc};
        use mevscope_common::BlockRecord;

        let tracked = KNOWN_AUXILIARY_BUILDERS[0].fee_recipient;
        let make_block = |number: u64, fee_recipient: Address| BlockRecord {
            number,
            hash: B256::with_last_byte(number as u8),
            parent_hash: B256::ZERO,
            nonce: B64::ZERO,
            sha3_uncles: B256::ZERO,
            transactions_root: B256::ZERO,
            state_root: B256::ZERO,
            receipts_root: B256::ZERO,
            fee_recipient,
            size: 0,
            extra_data: Bytes::new(),
            gas_limit: 30_000_000,
            gas_used: 0,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            transaction_count: 0,
            base_fee_per_gas: None,
        };

        let db = MockDatabaseService::new();
        db.upsert_blocks(&[make_block(1, tracked), make_block(2, Address::repeat_byte(0x99))])
            .await
            .unwrap();

        let rpc = Arc::new(RpcClient::new(mevscope_common::RpcConfig {
            url: "http://127.0.0.1:1".parse().unwrap(),
            header_batch_size: 50,
            balance_batch_size: 10,
            max_concurrent_batches: 2,
            request_timeout_secs: 5,
        }));
        let backfill = AuxiliaryBalanceBackfill::new(db, rpc);

        let units = backfill.select_work().await.unwrap();
        let selected: Vec<u64> = units.concat().iter().map(|(n, _)| *n).collect();
        assert_eq!(selected, vec![1]);
    }
}
