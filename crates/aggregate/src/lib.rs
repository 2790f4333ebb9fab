//! The PBS aggregator: fuses blocks, balance deltas, auxiliary builder
//! deltas, relay payloads and bid adjustments into one derived record per
//! block. Arithmetic stays in 256-bit wei; ETH conversion happens once, at
//! the end.

pub mod builder_name;
pub mod proposer_names;

use std::collections::HashMap;

use alloy_primitives::I256;
use mevscope_common::{
    Adjustment, AggregateRecord, AuxiliaryBuilderDelta, BalanceDelta, BlockRecord, RelayPayload,
};
use mevscope_database::{DatabaseError, DatabaseService};
use thiserror::Error;
use tracing::debug;

pub use builder_name::{normalize_builder_name, parse_builder_name_from_extra_data};
pub use proposer_names::{proposer_name_for, proposer_name_for_pubkey};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Converts a wei amount to ETH. Lossy by design: aggregate rows are
/// dashboard metrics, not accounting entries.
pub fn wei_to_eth(value: impl ToString) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(0.0) / 1e18
}

/// Everything known about one block, in insertion order where it matters.
#[derive(Debug, Clone, Default)]
pub struct BlockInputs {
    pub block: Option<BlockRecord>,
    pub balance_delta: Option<BalanceDelta>,
    pub auxiliary_deltas: Vec<AuxiliaryBuilderDelta>,
    pub payloads: Vec<RelayPayload>,
    /// Adjustments for the slots of `payloads`.
    pub adjustments: Vec<Adjustment>,
}

/// Applies the aggregation rules to one block's inputs.
///
/// Returns None without a block row: every aggregate must reference a stored
/// block.
pub fn aggregate_block(inputs: &BlockInputs) -> Option<AggregateRecord> {
    let block = inputs.block.as_ref()?;

    // delivering relays, insertion order, one entry per relay
    let mut relays: Vec<String> = Vec::new();
    for payload in &inputs.payloads {
        if !relays.contains(&payload.relay) {
            relays.push(payload.relay.clone());
        }
    }
    let n_relays = relays.len() as i32;
    let is_block_vanilla = relays.is_empty();

    let slot = inputs.payloads.iter().map(|p| p.slot).min();

    let subsidy_wei = inputs.payloads.iter().map(|p| p.value).max().unwrap_or_default();

    let relay_fee_wei: I256 = inputs
        .adjustments
        .iter()
        .filter(|a| a.has_adjustment)
        .filter_map(|a| a.delta)
        .fold(I256::ZERO, |acc, delta| acc + delta);

    let balance_increase_wei =
        inputs.balance_delta.as_ref().map(|d| d.balance_increase).unwrap_or(I256::ZERO);

    // refunds only: negative auxiliary movements are builder-internal
    let extra_transfers_wei: I256 = inputs
        .auxiliary_deltas
        .iter()
        .filter(|d| d.balance_increase > I256::ZERO)
        .fold(I256::ZERO, |acc, d| acc + d.balance_increase);

    let naive_total_wei = balance_increase_wei + I256::from_raw(subsidy_wei);
    let total_value_wei = if naive_total_wei < I256::ZERO {
        naive_total_wei + extra_transfers_wei
    } else {
        naive_total_wei
    };

    Some(AggregateRecord {
        block_number: block.number,
        block_timestamp: block.timestamp,
        slot,
        builder_name: parse_builder_name_from_extra_data(&block.extra_data),
        proposer_name: inputs
            .payloads
            .first()
            .and_then(|p| {
                proposer_name_for(&p.proposer_fee_recipient)
                    .or_else(|| proposer_name_for_pubkey(&p.proposer_pubkey))
            })
            .unwrap_or("unknown")
            .to_string(),
        is_block_vanilla,
        relays,
        n_relays,
        builder_balance_increase: wei_to_eth(balance_increase_wei),
        builder_extra_transfers: wei_to_eth(extra_transfers_wei),
        proposer_subsidy: wei_to_eth(subsidy_wei),
        relay_fee: wei_to_eth(relay_fee_wei),
        total_value: wei_to_eth(total_value_wei),
    })
}

/// Range-driven aggregation over the raw tables. Rerunnable: the output for
/// `[lo, hi]` depends only on the stored inputs.
pub struct Aggregator<D: DatabaseService> {
    db: D,
}

impl<D: DatabaseService> Aggregator<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    pub async fn aggregate_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<AggregateRecord>, AggregateError> {
        let blocks = self.db.get_blocks_in_range(lo, hi).await?;
        if blocks.is_empty() {
            return Ok(Vec::new());
        }

        let mut inputs: HashMap<u64, BlockInputs> = blocks
            .into_iter()
            .map(|block| (block.number, BlockInputs { block: Some(block), ..Default::default() }))
            .collect();

        for delta in self.db.get_balance_deltas_in_range(lo, hi).await? {
            if let Some(entry) = inputs.get_mut(&delta.block_number) {
                entry.balance_delta = Some(delta);
            }
        }

        for delta in self.db.get_auxiliary_deltas_in_range(lo, hi).await? {
            if let Some(entry) = inputs.get_mut(&delta.block_number) {
                entry.auxiliary_deltas.push(delta);
            }
        }

        let payloads = self.db.get_relay_payloads_for_blocks(lo, hi).await?;
        let slots: Vec<u64> = payloads.iter().map(|p| p.slot).collect();
        for payload in payloads {
            let Some(number) = payload.block_number else { continue };
            if let Some(entry) = inputs.get_mut(&number) {
                entry.payloads.push(payload);
            }
        }

        let mut adjustments_by_slot: HashMap<u64, Adjustment> = self
            .db
            .get_adjustments_for_slots(&slots)
            .await?
            .into_iter()
            .map(|a| (a.slot, a))
            .collect();
        for entry in inputs.values_mut() {
            for payload in &entry.payloads {
                if let Some(adjustment) = adjustments_by_slot.remove(&payload.slot) {
                    entry.adjustments.push(adjustment);
                }
            }
        }

        let mut numbers: Vec<u64> = inputs.keys().copied().collect();
        numbers.sort_unstable();

        let records: Vec<AggregateRecord> =
            numbers.iter().filter_map(|n| aggregate_block(&inputs[n])).collect();
        debug!(lo, hi, records = records.len(), "aggregated block range");
        Ok(records)
    }

    pub async fn aggregate_and_store(&self, lo: u64, hi: u64) -> Result<usize, AggregateError> {
        let records = self.aggregate_range(lo, hi).await?;
        self.db.upsert_aggregates(&records).await?;
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, Bytes, B256, B64, U256};
    use chrono::{TimeZone, Utc};
    use mevscope_database::MockDatabaseService;

    use super::*;

    fn block(number: u64, extra_data: &[u8]) -> BlockRecord {
        BlockRecord {
            number,
            hash: B256::repeat_byte(1),
            parent_hash: B256::repeat_byte(2),
            nonce: B64::ZERO,
            sha3_uncles: B256::repeat_byte(3),
            transactions_root: B256::repeat_byte(4),
            state_root: B256::repeat_byte(5),
            receipts_root: B256::repeat_byte(6),
            fee_recipient: Address::repeat_byte(7),
            size: 100_000,
            extra_data: Bytes::copy_from_slice(extra_data),
            gas_limit: 30_000_000,
            gas_used: 15_000_000,
            timestamp: Utc.timestamp_opt(1_693_407_671, 0).unwrap(),
            transaction_count: 150,
            base_fee_per_gas: Some(20_000_000_000),
        }
    }

    fn payload(relay: &str, slot: u64, block_number: u64, value_wei: u64) -> RelayPayload {
        RelayPayload {
            relay: relay.to_string(),
            slot,
            block_number: Some(block_number),
            parent_hash: B256::repeat_byte(2),
            block_hash: B256::repeat_byte(1),
            builder_pubkey: Default::default(),
            proposer_pubkey: Default::default(),
            proposer_fee_recipient: Address::repeat_byte(9),
            gas_limit: 30_000_000,
            gas_used: 15_000_000,
            value: U256::from(value_wei),
            num_tx: 150,
        }
    }

    fn balance_delta(block_number: u64, before: u64, after: u64) -> BalanceDelta {
        BalanceDelta::new(block_number, Address::repeat_byte(7), U256::from(before), U256::from(after))
    }

    fn aux_delta(block_number: u64, tag: u8, increase: i64) -> AuxiliaryBuilderDelta {
        let before = 1_000_000_000_000_000_000u64;
        let after = (before as i64 + increase) as u64;
        AuxiliaryBuilderDelta {
            block_number,
            address: Address::repeat_byte(tag),
            fee_recipient: Address::repeat_byte(7),
            balance_before: U256::from(before),
            balance_after: U256::from(after),
            balance_increase: I256::try_from(increase).unwrap(),
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        let tolerance = 1e-12 * expected.abs().max(1.0);
        assert!(
            (actual - expected).abs() < tolerance,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn pure_vanilla_block() {
        let inputs = BlockInputs {
            block: Some(block(100, b"geth/v1.13.0")),
            balance_delta: Some(balance_delta(100, 1_000_000_000_000_000_000, 1_000_000_000_000_012_345)),
            ..Default::default()
        };

        let record = aggregate_block(&inputs).unwrap();
        assert!(record.is_block_vanilla);
        assert_eq!(record.n_relays, 0);
        assert!(record.relays.is_empty());
        assert_eq!(record.builder_name, "unknown");
        assert_eq!(record.proposer_name, "unknown");
        assert_eq!(record.slot, None);
        assert_close(record.proposer_subsidy, 0.0);
        assert_close(record.builder_balance_increase, 0.000000000000012345);
        assert_close(record.total_value, 0.000000000000012345);
    }

    #[test]
    fn two_relay_mev_boost_block() {
        let inputs = BlockInputs {
            block: Some(block(200, b"beaverbuild.org")),
            balance_delta: Some(balance_delta(
                200,
                1_000_000_000_000_000_000,
                1_052_000_000_000_000_000,
            )),
            payloads: vec![
                payload("relay-analytics.ultrasound.money", 7_000_000, 200, 50_000_000_000_000_000),
                payload("boost-relay.flashbots.net", 7_000_000, 200, 48_000_000_000_000_000),
            ],
            ..Default::default()
        };

        let record = aggregate_block(&inputs).unwrap();
        assert!(!record.is_block_vanilla);
        assert_eq!(record.n_relays, 2);
        assert_eq!(
            record.relays,
            vec!["relay-analytics.ultrasound.money", "boost-relay.flashbots.net"]
        );
        assert_eq!(record.slot, Some(7_000_000));
        assert_eq!(record.builder_name, "BuilderNet (Beaver)");
        assert_close(record.proposer_subsidy, 0.050);
        assert_close(record.builder_balance_increase, 0.052);
        assert_close(record.total_value, 0.102);
    }

    #[test]
    fn overbid_block_with_positive_naive_total() {
        // naive total = -0.003 + 0.010 = 0.007 >= 0: refunds stay separate
        let inputs = BlockInputs {
            block: Some(block(300, b"titanbuilder.xyz")),
            balance_delta: Some(balance_delta(
                300,
                1_003_000_000_000_000_000,
                1_000_000_000_000_000_000,
            )),
            payloads: vec![payload("titanrelay.xyz", 7_000_100, 300, 10_000_000_000_000_000)],
            auxiliary_deltas: vec![aux_delta(300, 0xaa, 4_000_000_000_000_000)],
            ..Default::default()
        };

        let record = aggregate_block(&inputs).unwrap();
        assert_close(record.builder_balance_increase, -0.003);
        assert_close(record.proposer_subsidy, 0.010);
        assert_close(record.builder_extra_transfers, 0.004);
        assert_close(record.total_value, 0.007);
    }

    #[test]
    fn overbid_block_with_refund_applied() {
        // naive total = -0.020 + 0.010 = -0.010 < 0: refunds offset the loss
        let inputs = BlockInputs {
            block: Some(block(400, b"titanbuilder.xyz")),
            balance_delta: Some(balance_delta(
                400,
                1_020_000_000_000_000_000,
                1_000_000_000_000_000_000,
            )),
            payloads: vec![payload("titanrelay.xyz", 7_000_200, 400, 10_000_000_000_000_000)],
            auxiliary_deltas: vec![aux_delta(400, 0xaa, 4_000_000_000_000_000)],
            ..Default::default()
        };

        let record = aggregate_block(&inputs).unwrap();
        assert_close(record.total_value, -0.006);
        assert_close(record.builder_extra_transfers, 0.004);
    }

    #[test]
    fn negative_auxiliary_movements_are_ignored() {
        let inputs = BlockInputs {
            block: Some(block(500, b"titanbuilder.xyz")),
            balance_delta: Some(balance_delta(
                500,
                1_020_000_000_000_000_000,
                1_000_000_000_000_000_000,
            )),
            payloads: vec![payload("titanrelay.xyz", 7_000_300, 500, 10_000_000_000_000_000)],
            auxiliary_deltas: vec![
                aux_delta(500, 0xaa, 4_000_000_000_000_000),
                aux_delta(500, 0xbb, -9_000_000_000_000_000),
            ],
            ..Default::default()
        };

        let record = aggregate_block(&inputs).unwrap();
        assert_close(record.builder_extra_transfers, 0.004);
        assert_close(record.total_value, -0.006);
    }

    #[test]
    fn proposer_name_falls_back_to_pubkey() {
        let (pubkey, name) = proposer_names::PROPOSER_NAMES_BY_PUBKEY[0];

        // the fee recipient is unmapped; the pubkey table must still resolve
        let mut with_known_pubkey =
            payload("aestus.live", 7_000_400, 700, 1_000_000_000_000_000);
        with_known_pubkey.proposer_pubkey = pubkey;
        let inputs = BlockInputs {
            block: Some(block(700, b"beaverbuild.org")),
            payloads: vec![with_known_pubkey.clone()],
            ..Default::default()
        };
        let record = aggregate_block(&inputs).unwrap();
        assert_eq!(record.proposer_name, name);

        // a mapped fee recipient wins over the pubkey table
        let lido = alloy_primitives::address!("388c818ca8b9251b393131c08a736a67ccb19297");
        let mut with_known_recipient = with_known_pubkey;
        with_known_recipient.proposer_fee_recipient = lido;
        let inputs = BlockInputs {
            block: Some(block(700, b"beaverbuild.org")),
            payloads: vec![with_known_recipient],
            ..Default::default()
        };
        let record = aggregate_block(&inputs).unwrap();
        assert_eq!(record.proposer_name, "Lido");
    }

    #[test]
    fn relay_fee_sums_adjustments() {
        let mut adjustment = Adjustment {
            slot: 7_000_000,
            relay: "relay-analytics.ultrasound.money".to_string(),
            block_number: Some(200),
            builder_pubkey: None,
            delta: Some(I256::try_from(-2_000_000_000_000_000i64).unwrap()),
            adjusted_value: None,
            submitted_value: None,
            adjusted_block_hash: None,
            submitted_block_hash: None,
            submitted_received_at: None,
            has_adjustment: true,
            fetched_at: Utc::now(),
        };

        let inputs = BlockInputs {
            block: Some(block(200, b"beaverbuild.org")),
            payloads: vec![payload(
                "relay-analytics.ultrasound.money",
                7_000_000,
                200,
                50_000_000_000_000_000,
            )],
            adjustments: vec![adjustment.clone()],
            ..Default::default()
        };
        let record = aggregate_block(&inputs).unwrap();
        assert_close(record.relay_fee, -0.002);

        // marker rows contribute nothing
        adjustment.has_adjustment = false;
        adjustment.delta = None;
        let inputs = BlockInputs { adjustments: vec![adjustment], ..inputs };
        let record = aggregate_block(&inputs).unwrap();
        assert_close(record.relay_fee, 0.0);
    }

    #[test]
    fn vanilla_equivalence_holds() {
        for n_payloads in 0..4u64 {
            let payloads: Vec<RelayPayload> = (0..n_payloads)
                .map(|i| payload("aestus.live", 7_100_000 + i, 600, 1_000_000_000_000_000))
                .collect();
            let inputs = BlockInputs {
                block: Some(block(600, b"some-builder.xyz")),
                payloads,
                ..Default::default()
            };
            let record = aggregate_block(&inputs).unwrap();

            assert_eq!(record.is_block_vanilla, record.n_relays == 0);
            assert_eq!(record.is_block_vanilla, record.relays.is_empty());
            assert_eq!(record.is_block_vanilla, record.proposer_subsidy == 0.0);
        }
    }

    #[tokio::test]
    async fn aggregation_is_deterministic_and_rerunnable() {
        let db = MockDatabaseService::new();
        db.upsert_blocks(&[block(100, b"beaverbuild.org"), block(101, b"geth/v1.13.0")])
            .await
            .unwrap();
        db.upsert_balance_deltas(&[balance_delta(
            100,
            1_000_000_000_000_000_000,
            1_052_000_000_000_000_000,
        )])
        .await
        .unwrap();
        db.upsert_relay_payloads(&[
            payload("relay-analytics.ultrasound.money", 7_000_000, 100, 50_000_000_000_000_000),
            payload("boost-relay.flashbots.net", 7_000_000, 100, 48_000_000_000_000_000),
        ])
        .await
        .unwrap();

        let aggregator = Aggregator::new(db.clone());
        let first = aggregator.aggregate_range(100, 101).await.unwrap();
        let second = aggregator.aggregate_range(100, 101).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].block_number, 100);
        assert!(!first[0].is_block_vanilla);
        assert!(first[1].is_block_vanilla);

        // storing twice leaves an identical row set
        let stored = aggregator.aggregate_and_store(100, 101).await.unwrap();
        assert_eq!(stored, 2);
        let after_first = db.stored_aggregates();
        aggregator.aggregate_and_store(100, 101).await.unwrap();
        assert_eq!(db.stored_aggregates(), after_first);
    }
}
