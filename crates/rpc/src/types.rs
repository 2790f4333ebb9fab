use alloy_primitives::{Address, Bytes, B256, B64, U256, U64};
use chrono::DateTime;
use mevscope_common::BlockRecord;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Execution-layer header as returned by `eth_getBlockByNumber(_, false)`
/// and by `newHeads` notifications. Quantities arrive as 0x-hex strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHeader {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub nonce: B64,
    pub sha3_uncles: B256,
    pub transactions_root: B256,
    pub state_root: B256,
    pub receipts_root: B256,
    pub miner: Address,
    #[serde(default)]
    pub size: Option<U64>,
    pub extra_data: Bytes,
    pub gas_limit: U64,
    pub gas_used: U64,
    pub timestamp: U64,
    #[serde(default)]
    pub base_fee_per_gas: Option<U64>,
    /// Transaction hashes; absent on newHeads notifications.
    #[serde(default)]
    pub transactions: Option<Vec<B256>>,
}

impl ExecutionHeader {
    pub fn number(&self) -> u64 {
        self.number.to::<u64>()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.to::<u64>()
    }

    pub fn into_record(self) -> Result<BlockRecord, RpcError> {
        let timestamp = DateTime::from_timestamp(self.timestamp() as i64, 0)
            .ok_or_else(|| RpcError::Protocol(format!("invalid timestamp {}", self.timestamp)))?;
        Ok(BlockRecord {
            number: self.number.to(),
            hash: self.hash,
            parent_hash: self.parent_hash,
            nonce: self.nonce,
            sha3_uncles: self.sha3_uncles,
            transactions_root: self.transactions_root,
            state_root: self.state_root,
            receipts_root: self.receipts_root,
            fee_recipient: self.miner,
            size: self.size.map(|s| s.to()).unwrap_or_default(),
            extra_data: self.extra_data,
            gas_limit: self.gas_limit.to(),
            gas_used: self.gas_used.to(),
            timestamp,
            transaction_count: self.transactions.as_ref().map(|txs| txs.len() as u32).unwrap_or(0),
            base_fee_per_gas: self.base_fee_per_gas.map(|f| f.to()),
        })
    }
}

/// Balance movement of one address across one block.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange {
    pub address: Address,
    pub block_number: u64,
    pub balance_before: U256,
    pub balance_after: U256,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_JSON: &str = r#"{
        "number": "0x112a880",
        "hash": "0x43ab8f7f090036723a5a2fe741892e46cef8a2b97acc3bb9997d1a7083cbe4c0",
        "parentHash": "0x4eafb14dfc9bb7550ca92513a8a25b1b424c189c662dd490b48b60c4dcd8ae2a",
        "nonce": "0x0000000000000000",
        "sha3Uncles": "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
        "transactionsRoot": "0x7121144a0c20f843b2d3109b770cfaa039b912c8b1f75db5267dbeb9a4115ac2",
        "stateRoot": "0x6e30a2ba68ebf6534d8321eb037f9f3cdfd1494a7751baf419bd6c2b98d1876f",
        "receiptsRoot": "0x7121144a0c20f843b2d3109b770cfaa039b912c8b1f75db5267dbeb9a4115ac2",
        "miner": "0x1f9090aae28b8a3dceadf281b0f12828e676c326",
        "size": "0x1234",
        "extraData": "0x7273796e632d6275696c6465722e78797a",
        "gasLimit": "0x1c9c380",
        "gasUsed": "0xf3b268",
        "timestamp": "0x64ef59b7",
        "baseFeePerGas": "0x90b4eb4b7",
        "transactions": [
            "0x3a1a1b8d2a9c62d24e1b8d3f70b2b3815d243b4b0d7b30fd51b3b7f70cdd0c1e"
        ]
    }"#;

    #[test]
    fn header_decodes_hex_quantities() {
        let header: ExecutionHeader = serde_json::from_str(HEADER_JSON).unwrap();
        assert_eq!(header.number(), 18_000_000);
        assert_eq!(header.gas_limit.to::<u64>(), 30_000_000);
        assert_eq!(header.timestamp(), 1_693_407_671);
    }

    #[test]
    fn header_converts_to_record() {
        let header: ExecutionHeader = serde_json::from_str(HEADER_JSON).unwrap();
        let record = header.into_record().unwrap();
        assert_eq!(record.number, 18_000_000);
        assert_eq!(record.transaction_count, 1);
        assert_eq!(record.extra_data.as_ref(), b"rsync-builder.xyz");
        assert_eq!(record.base_fee_per_gas, Some(38_847_930_551));
        assert_eq!(record.timestamp.timestamp(), 1_693_407_671);
    }

    #[test]
    fn newheads_header_without_transactions() {
        let mut value: serde_json::Value = serde_json::from_str(HEADER_JSON).unwrap();
        value.as_object_mut().unwrap().remove("transactions");
        value.as_object_mut().unwrap().remove("size");
        let header: ExecutionHeader = serde_json::from_value(value).unwrap();
        let record = header.into_record().unwrap();
        assert_eq!(record.transaction_count, 0);
        assert_eq!(record.size, 0);
    }
}
