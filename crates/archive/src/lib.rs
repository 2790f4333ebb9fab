//! Reader for the date-partitioned parquet block archive.
//!
//! Layout: `<base>/v1.0/eth/blocks/date=YYYY-MM-DD/<part>.parquet`, one row
//! per block. One date is one atomic unit of work for the block backfiller:
//! a missing date is reported but not checkpointed, a parse error is fatal
//! for that date.

use std::str::FromStr;

use alloy_primitives::{Address, Bytes as EvmBytes, B256, B64};
use arrow_array::{
    cast::AsArray,
    types::{Float64Type, Int64Type},
    Array, RecordBatch,
};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate};
use mevscope_common::{ArchiveConfig, BlockRecord};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use thiserror::Error;
use tracing::debug;
use url::Url;

const BLOCKS_PREFIX: &str = "v1.0/eth/blocks";

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// No partition for the date. Reported, not fatal; the checkpoint is not
    /// advanced so the date retries on the next run.
    #[error("no archive data for date {0}")]
    MissingDate(NaiveDate),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Undecodable partition content. Fatal for the date.
    #[error("parse error for date {date}: {message}")]
    Parse { date: NaiveDate, message: String },
}

#[derive(Clone)]
pub struct ArchiveReader {
    http: reqwest::Client,
    base_url: Url,
}

impl ArchiveReader {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self { http: reqwest::Client::new(), base_url: config.base_url.clone() }
    }

    /// All block records for one date, in file order.
    pub async fn blocks_for_date(&self, date: NaiveDate) -> Result<Vec<BlockRecord>, ArchiveError> {
        let prefix = format!("{BLOCKS_PREFIX}/date={date}/");

        let mut list_url = self.base_url.clone();
        list_url.set_query(Some(&format!("list-type=2&prefix={prefix}")));
        let listing = self.http.get(list_url).send().await?.error_for_status()?.text().await?;

        let keys = extract_keys(&listing);
        let parquet_key =
            keys.iter().find(|k| k.ends_with(".parquet")).or_else(|| keys.first());
        let Some(key) = parquet_key else {
            return Err(ArchiveError::MissingDate(date));
        };

        let object_url = self
            .base_url
            .join(key)
            .map_err(|e| ArchiveError::Parse { date, message: e.to_string() })?;
        debug!(%object_url, "fetching archive partition");

        let body = self.http.get(object_url).send().await?.error_for_status()?.bytes().await?;
        let blocks = decode_blocks(body, date)?;
        debug!(count = blocks.len(), %date, "decoded archive partition");
        Ok(blocks)
    }
}

/// `<Key>` values from an S3 ListObjectsV2 XML response. The response shape
/// is stable enough that a scan beats pulling in an XML parser.
fn extract_keys(xml: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Key>") {
        rest = &rest[start + "<Key>".len()..];
        let Some(end) = rest.find("</Key>") else { break };
        keys.push(rest[..end].to_string());
        rest = &rest[end + "</Key>".len()..];
    }
    keys
}

/// Decodes one parquet partition into block records.
pub fn decode_blocks(data: Bytes, date: NaiveDate) -> Result<Vec<BlockRecord>, ArchiveError> {
    let parse = |message: String| ArchiveError::Parse { date, message };

    let reader = ParquetRecordBatchReaderBuilder::try_new(data)
        .map_err(|e| parse(e.to_string()))?
        .build()
        .map_err(|e| parse(e.to_string()))?;

    let mut blocks = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| parse(e.to_string()))?;
        decode_batch(&batch, date, &mut blocks)?;
    }
    Ok(blocks)
}

fn decode_batch(
    batch: &RecordBatch,
    date: NaiveDate,
    out: &mut Vec<BlockRecord>,
) -> Result<(), ArchiveError> {
    let parse = |message: String| ArchiveError::Parse { date, message };

    let string_col = |name: &str| {
        batch
            .column_by_name(name)
            .and_then(|col| col.as_string_opt::<i32>())
            .ok_or_else(|| parse(format!("missing string column {name}")))
    };
    let i64_col = |name: &str| {
        batch
            .column_by_name(name)
            .and_then(|col| col.as_primitive_opt::<Int64Type>())
            .ok_or_else(|| parse(format!("missing int64 column {name}")))
    };

    let number = i64_col("number")?;
    let hash = string_col("hash")?;
    let parent_hash = string_col("parent_hash")?;
    let nonce = string_col("nonce")?;
    let sha3_uncles = string_col("sha3_uncles")?;
    let transactions_root = string_col("transactions_root")?;
    let state_root = string_col("state_root")?;
    let receipts_root = string_col("receipts_root")?;
    let miner = string_col("miner")?;
    let size = i64_col("size")?;
    let extra_data = string_col("extra_data")?;
    let gas_limit = i64_col("gas_limit")?;
    let gas_used = i64_col("gas_used")?;
    let transaction_count = i64_col("transaction_count")?;
    let timestamps = timestamp_seconds(batch, date)?;

    let base_fee = batch.column_by_name("base_fee_per_gas");

    for row in 0..batch.num_rows() {
        let hex_field = |name: &'static str, raw: &str| {
            parse(format!("row {row}: bad {name}: {raw}"))
        };

        let base_fee_per_gas = base_fee.and_then(|col| {
            if col.is_null(row) {
                return None;
            }
            if let Some(floats) = col.as_primitive_opt::<Float64Type>() {
                return Some(floats.value(row) as u64);
            }
            col.as_primitive_opt::<Int64Type>().map(|ints| ints.value(row) as u64)
        });

        let timestamp = DateTime::from_timestamp(timestamps[row], 0)
            .ok_or_else(|| parse(format!("row {row}: bad timestamp")))?;

        out.push(BlockRecord {
            number: number.value(row) as u64,
            hash: B256::from_str(hash.value(row)).map_err(|_| hex_field("hash", hash.value(row)))?,
            parent_hash: B256::from_str(parent_hash.value(row))
                .map_err(|_| hex_field("parent_hash", parent_hash.value(row)))?,
            nonce: B64::from_str(nonce.value(row))
                .map_err(|_| hex_field("nonce", nonce.value(row)))?,
            sha3_uncles: B256::from_str(sha3_uncles.value(row))
                .map_err(|_| hex_field("sha3_uncles", sha3_uncles.value(row)))?,
            transactions_root: B256::from_str(transactions_root.value(row))
                .map_err(|_| hex_field("transactions_root", transactions_root.value(row)))?,
            state_root: B256::from_str(state_root.value(row))
                .map_err(|_| hex_field("state_root", state_root.value(row)))?,
            receipts_root: B256::from_str(receipts_root.value(row))
                .map_err(|_| hex_field("receipts_root", receipts_root.value(row)))?,
            fee_recipient: Address::from_str(miner.value(row))
                .map_err(|_| hex_field("miner", miner.value(row)))?,
            size: size.value(row) as u64,
            extra_data: EvmBytes::from_str(extra_data.value(row))
                .map_err(|_| hex_field("extra_data", extra_data.value(row)))?,
            gas_limit: gas_limit.value(row) as u64,
            gas_used: gas_used.value(row) as u64,
            timestamp,
            transaction_count: transaction_count.value(row) as u32,
            base_fee_per_gas,
        });
    }
    Ok(())
}

/// Timestamps normalized to unix seconds regardless of the file's precision.
fn timestamp_seconds(batch: &RecordBatch, date: NaiveDate) -> Result<Vec<i64>, ArchiveError> {
    use arrow_array::types::{
        TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
        TimestampSecondType,
    };

    let col = batch
        .column_by_name("timestamp")
        .ok_or_else(|| ArchiveError::Parse { date, message: "missing timestamp column".into() })?;

    let values: Vec<i64> = if let Some(a) = col.as_primitive_opt::<TimestampSecondType>() {
        a.values().iter().copied().collect()
    } else if let Some(a) = col.as_primitive_opt::<TimestampMillisecondType>() {
        a.values().iter().map(|v| v / 1_000).collect()
    } else if let Some(a) = col.as_primitive_opt::<TimestampMicrosecondType>() {
        a.values().iter().map(|v| v / 1_000_000).collect()
    } else if let Some(a) = col.as_primitive_opt::<TimestampNanosecondType>() {
        a.values().iter().map(|v| v / 1_000_000_000).collect()
    } else if let Some(a) = col.as_primitive_opt::<Int64Type>() {
        a.values().iter().copied().collect()
    } else {
        return Err(ArchiveError::Parse {
            date,
            message: format!("unsupported timestamp type {:?}", col.data_type()),
        });
    };

    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::{Int64Array, StringArray, TimestampSecondArray};
    use arrow_schema::{DataType, Field, Schema, TimeUnit};
    use parquet::arrow::ArrowWriter;

    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>aws-public-blockchain</Name>
  <Contents>
    <Key>v1.0/eth/blocks/date=2023-09-01/part-00000.snappy.parquet</Key>
    <Size>12345</Size>
  </Contents>
</ListBucketResult>"#;

    #[test]
    fn listing_keys_are_extracted() {
        let keys = extract_keys(LISTING);
        assert_eq!(keys, vec!["v1.0/eth/blocks/date=2023-09-01/part-00000.snappy.parquet"]);
    }

    #[test]
    fn empty_listing_has_no_keys() {
        assert!(extract_keys("<ListBucketResult></ListBucketResult>").is_empty());
    }

    fn sample_parquet() -> Bytes {
        let schema = Arc::new(Schema::new(vec![
            Field::new("number", DataType::Int64, false),
            Field::new("hash", DataType::Utf8, false),
            Field::new("parent_hash", DataType::Utf8, false),
            Field::new("nonce", DataType::Utf8, false),
            Field::new("sha3_uncles", DataType::Utf8, false),
            Field::new("transactions_root", DataType::Utf8, false),
            Field::new("state_root", DataType::Utf8, false),
            Field::new("receipts_root", DataType::Utf8, false),
            Field::new("miner", DataType::Utf8, false),
            Field::new("size", DataType::Int64, false),
            Field::new("extra_data", DataType::Utf8, false),
            Field::new("gas_limit", DataType::Int64, false),
            Field::new("gas_used", DataType::Int64, false),
            Field::new("timestamp", DataType::Timestamp(TimeUnit::Second, None), false),
            Field::new("transaction_count", DataType::Int64, false),
        ]));

        let zero_hash = format!("0x{}", "00".repeat(32));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![18_000_000i64])),
                Arc::new(StringArray::from(vec![zero_hash.clone()])),
                Arc::new(StringArray::from(vec![zero_hash.clone()])),
                Arc::new(StringArray::from(vec!["0x0000000000000000".to_string()])),
                Arc::new(StringArray::from(vec![zero_hash.clone()])),
                Arc::new(StringArray::from(vec![zero_hash.clone()])),
                Arc::new(StringArray::from(vec![zero_hash.clone()])),
                Arc::new(StringArray::from(vec![zero_hash.clone()])),
                Arc::new(StringArray::from(vec![format!("0x{}", "11".repeat(20))])),
                Arc::new(Int64Array::from(vec![100_000i64])),
                Arc::new(StringArray::from(vec!["0x6265617665726275696c642e6f7267".to_string()])),
                Arc::new(Int64Array::from(vec![30_000_000i64])),
                Arc::new(Int64Array::from(vec![15_000_000i64])),
                Arc::new(TimestampSecondArray::from(vec![1_693_407_671i64])),
                Arc::new(Int64Array::from(vec![150i64])),
            ],
        )
        .unwrap();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        Bytes::from(buffer)
    }

    #[test]
    fn parquet_partition_decodes() {
        let date = NaiveDate::from_ymd_opt(2023, 9, 1).unwrap();
        let blocks = decode_blocks(sample_parquet(), date).unwrap();

        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.number, 18_000_000);
        assert_eq!(block.extra_data.as_ref(), b"beaverbuild.org");
        assert_eq!(block.transaction_count, 150);
        assert_eq!(block.timestamp.timestamp(), 1_693_407_671);
        assert_eq!(block.base_fee_per_gas, None);
    }

    #[tokio::test]
    async fn missing_date_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body("<ListBucketResult></ListBucketResult>")
            .create_async()
            .await;

        let config = ArchiveConfig { base_url: Url::parse(&server.url()).unwrap() };
        let reader = ArchiveReader::new(&config);
        let date = NaiveDate::from_ymd_opt(2023, 9, 2).unwrap();

        assert!(matches!(
            reader.blocks_for_date(date).await,
            Err(ArchiveError::MissingDate(d)) if d == date
        ));
    }
}
