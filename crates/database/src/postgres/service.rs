use std::{ops::DerefMut, str::FromStr, sync::Arc};

use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Config, GenericClient, ManagerConfig, Pool, PoolConfig, RecyclingMethod};
use mevscope_common::{
    metrics::ROWS_UPSERTED, streams, Adjustment, AggregateRecord, AuxiliaryBuilderDelta,
    BalanceDelta, BlockRecord, Checkpoint, PostgresConfig, RelayPayload,
};
use tokio_postgres::{types::ToSql, NoTls};
use tracing::info;

use crate::{
    error::DatabaseError,
    postgres::{
        init::run_migrations_async,
        numeric::{PgNumeric, PgSignedNumeric},
        rows::{
            parse_adjustment_row, parse_auxiliary_delta_row, parse_balance_delta_row,
            parse_block_row, parse_checkpoint_row, parse_relay_payload_row,
        },
    },
    DatabaseService,
};

/// Rows per INSERT statement. Bounded so the widest row stays well under
/// postgres' 65,535 bind parameter limit.
const UPSERT_CHUNK_SIZE: usize = 1_000;

#[derive(Clone)]
pub struct PostgresDatabaseService {
    pool: Arc<Pool>,
}

impl PostgresDatabaseService {
    pub fn new(config: &PostgresConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url.clone());
        cfg.manager = Some(ManagerConfig { recycling_method: RecyclingMethod::Fast });
        cfg.pool = Some(PoolConfig::new(config.pool_size));
        let pool = cfg
            .create_pool(None, NoTls)
            .map_err(|e| DatabaseError::InvalidConnectionString(e.to_string()))?;
        Ok(PostgresDatabaseService { pool: Arc::new(pool) })
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.get().await?;
        let client = conn.deref_mut().deref_mut();
        let report = run_migrations_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        info!(applied = report.applied_migrations().len(), "applied migrations");
        Ok(())
    }
}

/// `($1, $2, ...), ($k+1, ...)` clauses for a multi-row VALUES insert.
fn values_clauses(rows: usize, params_per_row: usize) -> String {
    (0..rows)
        .map(|row| {
            let placeholders: Vec<String> =
                (1..=params_per_row).map(|n| format!("${}", row * params_per_row + n)).collect();
            format!("({})", placeholders.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn hex<T: std::fmt::LowerHex>(value: T) -> String {
    format!("{value:#x}")
}

struct BlockParams {
    number: i64,
    hash: String,
    parent_hash: String,
    nonce: String,
    sha3_uncles: String,
    transactions_root: String,
    state_root: String,
    receipts_root: String,
    fee_recipient: String,
    size: i64,
    extra_data: String,
    gas_limit: i64,
    gas_used: i64,
    timestamp: DateTime<Utc>,
    transaction_count: i32,
    base_fee_per_gas: Option<i64>,
}

impl From<&BlockRecord> for BlockParams {
    fn from(b: &BlockRecord) -> Self {
        BlockParams {
            number: b.number as i64,
            hash: hex(b.hash),
            parent_hash: hex(b.parent_hash),
            nonce: hex(b.nonce),
            sha3_uncles: hex(b.sha3_uncles),
            transactions_root: hex(b.transactions_root),
            state_root: hex(b.state_root),
            receipts_root: hex(b.receipts_root),
            fee_recipient: hex(b.fee_recipient),
            size: b.size as i64,
            extra_data: b.extra_data.to_string(),
            gas_limit: b.gas_limit as i64,
            gas_used: b.gas_used as i64,
            timestamp: b.timestamp,
            transaction_count: b.transaction_count as i32,
            base_fee_per_gas: b.base_fee_per_gas.map(|v| v as i64),
        }
    }
}

async fn exec_upsert_blocks<C: GenericClient>(
    client: &C,
    blocks: &[BlockRecord],
) -> Result<(), DatabaseError> {
    for chunk in blocks.chunks(UPSERT_CHUNK_SIZE) {
        let structured: Vec<BlockParams> = chunk.iter().map(Into::into).collect();
        let params: Vec<&(dyn ToSql + Sync)> = structured
            .iter()
            .flat_map(|p| {
                vec![
                    &p.number as &(dyn ToSql + Sync),
                    &p.hash,
                    &p.parent_hash,
                    &p.nonce,
                    &p.sha3_uncles,
                    &p.transactions_root,
                    &p.state_root,
                    &p.receipts_root,
                    &p.fee_recipient,
                    &p.size,
                    &p.extra_data,
                    &p.gas_limit,
                    &p.gas_used,
                    &p.timestamp,
                    &p.transaction_count,
                    &p.base_fee_per_gas,
                ]
            })
            .collect();

        let mut sql = String::from(
            "INSERT INTO blocks (number, hash, parent_hash, nonce, sha3_uncles, \
             transactions_root, state_root, receipts_root, fee_recipient, size, extra_data, \
             gas_limit, gas_used, timestamp, transaction_count, base_fee_per_gas) VALUES ",
        );
        sql.push_str(&values_clauses(chunk.len(), 16));
        sql.push_str(
            " ON CONFLICT (number) DO UPDATE SET hash = excluded.hash, \
             parent_hash = excluded.parent_hash, nonce = excluded.nonce, \
             sha3_uncles = excluded.sha3_uncles, transactions_root = excluded.transactions_root, \
             state_root = excluded.state_root, receipts_root = excluded.receipts_root, \
             fee_recipient = excluded.fee_recipient, size = excluded.size, \
             extra_data = excluded.extra_data, gas_limit = excluded.gas_limit, \
             gas_used = excluded.gas_used, timestamp = excluded.timestamp, \
             transaction_count = excluded.transaction_count, \
             base_fee_per_gas = excluded.base_fee_per_gas",
        );

        client.execute(&sql, &params[..]).await?;
        ROWS_UPSERTED.with_label_values(&["blocks"]).inc_by(chunk.len() as u64);
    }
    Ok(())
}

struct PayloadParams {
    relay: String,
    slot: i64,
    block_number: Option<i64>,
    parent_hash: String,
    block_hash: String,
    builder_pubkey: String,
    proposer_pubkey: String,
    proposer_fee_recipient: String,
    gas_limit: i64,
    gas_used: i64,
    value: PgNumeric,
    num_tx: i32,
}

impl From<&RelayPayload> for PayloadParams {
    fn from(p: &RelayPayload) -> Self {
        PayloadParams {
            relay: p.relay.clone(),
            slot: p.slot as i64,
            block_number: p.block_number.map(|n| n as i64),
            parent_hash: hex(p.parent_hash),
            block_hash: hex(p.block_hash),
            builder_pubkey: hex(p.builder_pubkey),
            proposer_pubkey: hex(p.proposer_pubkey),
            proposer_fee_recipient: hex(p.proposer_fee_recipient),
            gas_limit: p.gas_limit as i64,
            gas_used: p.gas_used as i64,
            value: p.value.into(),
            num_tx: p.num_tx as i32,
        }
    }
}

async fn exec_upsert_relay_payloads<C: GenericClient>(
    client: &C,
    payloads: &[RelayPayload],
) -> Result<(), DatabaseError> {
    for chunk in payloads.chunks(UPSERT_CHUNK_SIZE) {
        let structured: Vec<PayloadParams> = chunk.iter().map(Into::into).collect();
        let params: Vec<&(dyn ToSql + Sync)> = structured
            .iter()
            .flat_map(|p| {
                vec![
                    &p.relay as &(dyn ToSql + Sync),
                    &p.slot,
                    &p.block_number,
                    &p.parent_hash,
                    &p.block_hash,
                    &p.builder_pubkey,
                    &p.proposer_pubkey,
                    &p.proposer_fee_recipient,
                    &p.gas_limit,
                    &p.gas_used,
                    &p.value,
                    &p.num_tx,
                ]
            })
            .collect();

        let mut sql = String::from(
            "INSERT INTO relay_payloads (relay, slot, block_number, parent_hash, block_hash, \
             builder_pubkey, proposer_pubkey, proposer_fee_recipient, gas_limit, gas_used, \
             value, num_tx) VALUES ",
        );
        sql.push_str(&values_clauses(chunk.len(), 12));
        sql.push_str(
            " ON CONFLICT (relay, slot) DO UPDATE SET block_number = excluded.block_number, \
             parent_hash = excluded.parent_hash, block_hash = excluded.block_hash, \
             builder_pubkey = excluded.builder_pubkey, proposer_pubkey = excluded.proposer_pubkey, \
             proposer_fee_recipient = excluded.proposer_fee_recipient, \
             gas_limit = excluded.gas_limit, gas_used = excluded.gas_used, \
             value = excluded.value, num_tx = excluded.num_tx",
        );

        client.execute(&sql, &params[..]).await?;
        ROWS_UPSERTED.with_label_values(&["relay_payloads"]).inc_by(chunk.len() as u64);
    }
    Ok(())
}

async fn exec_save_checkpoint<C: GenericClient>(
    client: &C,
    checkpoint: &Checkpoint,
) -> Result<(), DatabaseError> {
    client
        .execute(
            "INSERT INTO checkpoints (stream_key, \"cursor\", last_processed_marker, completed) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (stream_key) DO UPDATE SET \"cursor\" = excluded.\"cursor\", \
             last_processed_marker = excluded.last_processed_marker, \
             completed = excluded.completed",
            &[
                &checkpoint.stream_key,
                &checkpoint.cursor,
                &checkpoint.last_processed_marker,
                &checkpoint.completed,
            ],
        )
        .await?;
    Ok(())
}

#[async_trait]
impl DatabaseService for PostgresDatabaseService {
    async fn upsert_blocks(&self, blocks: &[BlockRecord]) -> Result<(), DatabaseError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let client = self.pool.get().await?;
        exec_upsert_blocks(&client, blocks).await
    }

    async fn upsert_balance_deltas(&self, deltas: &[BalanceDelta]) -> Result<(), DatabaseError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let client = self.pool.get().await?;

        for chunk in deltas.chunks(UPSERT_CHUNK_SIZE) {
            let structured: Vec<_> = chunk
                .iter()
                .map(|d| {
                    (
                        d.block_number as i64,
                        hex(d.address),
                        PgNumeric(d.balance_before),
                        PgNumeric(d.balance_after),
                        PgSignedNumeric(d.balance_increase),
                    )
                })
                .collect();
            let params: Vec<&(dyn ToSql + Sync)> = structured
                .iter()
                .flat_map(|p| {
                    vec![&p.0 as &(dyn ToSql + Sync), &p.1, &p.2, &p.3, &p.4]
                })
                .collect();

            let mut sql = String::from(
                "INSERT INTO builder_balances (block_number, address, balance_before, \
                 balance_after, balance_increase) VALUES ",
            );
            sql.push_str(&values_clauses(chunk.len(), 5));
            sql.push_str(
                " ON CONFLICT (block_number) DO UPDATE SET address = excluded.address, \
                 balance_before = excluded.balance_before, \
                 balance_after = excluded.balance_after, \
                 balance_increase = excluded.balance_increase",
            );

            client.execute(&sql, &params[..]).await?;
            ROWS_UPSERTED.with_label_values(&["builder_balances"]).inc_by(chunk.len() as u64);
        }
        Ok(())
    }

    async fn upsert_auxiliary_deltas(
        &self,
        deltas: &[AuxiliaryBuilderDelta],
    ) -> Result<(), DatabaseError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let client = self.pool.get().await?;

        for chunk in deltas.chunks(UPSERT_CHUNK_SIZE) {
            let structured: Vec<_> = chunk
                .iter()
                .map(|d| {
                    (
                        d.block_number as i64,
                        hex(d.address),
                        hex(d.fee_recipient),
                        PgNumeric(d.balance_before),
                        PgNumeric(d.balance_after),
                        PgSignedNumeric(d.balance_increase),
                    )
                })
                .collect();
            let params: Vec<&(dyn ToSql + Sync)> = structured
                .iter()
                .flat_map(|p| {
                    vec![&p.0 as &(dyn ToSql + Sync), &p.1, &p.2, &p.3, &p.4, &p.5]
                })
                .collect();

            let mut sql = String::from(
                "INSERT INTO extra_builder_balances (block_number, address, fee_recipient, \
                 balance_before, balance_after, balance_increase) VALUES ",
            );
            sql.push_str(&values_clauses(chunk.len(), 6));
            sql.push_str(
                " ON CONFLICT (block_number, address) DO UPDATE SET \
                 fee_recipient = excluded.fee_recipient, \
                 balance_before = excluded.balance_before, \
                 balance_after = excluded.balance_after, \
                 balance_increase = excluded.balance_increase",
            );

            client.execute(&sql, &params[..]).await?;
            ROWS_UPSERTED
                .with_label_values(&["extra_builder_balances"])
                .inc_by(chunk.len() as u64);
        }
        Ok(())
    }

    async fn upsert_relay_payloads(&self, payloads: &[RelayPayload]) -> Result<(), DatabaseError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let client = self.pool.get().await?;
        exec_upsert_relay_payloads(&client, payloads).await
    }

    async fn upsert_relay_payloads_with_checkpoint(
        &self,
        payloads: &[RelayPayload],
        checkpoint: &Checkpoint,
    ) -> Result<(), DatabaseError> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        exec_upsert_relay_payloads(&transaction, payloads).await?;
        exec_save_checkpoint(&transaction, checkpoint).await?;
        transaction.commit().await?;
        Ok(())
    }

    async fn upsert_adjustments(&self, adjustments: &[Adjustment]) -> Result<(), DatabaseError> {
        if adjustments.is_empty() {
            return Ok(());
        }
        let client = self.pool.get().await?;

        for chunk in adjustments.chunks(UPSERT_CHUNK_SIZE) {
            let structured: Vec<_> = chunk
                .iter()
                .map(|a| {
                    (
                        a.slot as i64,
                        a.relay.clone(),
                        a.block_number.map(|n| n as i64),
                        a.builder_pubkey.map(hex),
                        a.delta.map(PgSignedNumeric),
                        a.adjusted_value.map(PgNumeric),
                        a.submitted_value.map(PgNumeric),
                        a.adjusted_block_hash.map(hex),
                        a.submitted_block_hash.map(hex),
                        a.submitted_received_at.clone(),
                        a.has_adjustment,
                        a.fetched_at,
                    )
                })
                .collect();
            let params: Vec<&(dyn ToSql + Sync)> = structured
                .iter()
                .flat_map(|p| {
                    vec![
                        &p.0 as &(dyn ToSql + Sync),
                        &p.1,
                        &p.2,
                        &p.3,
                        &p.4,
                        &p.5,
                        &p.6,
                        &p.7,
                        &p.8,
                        &p.9,
                        &p.10,
                        &p.11,
                    ]
                })
                .collect();

            let mut sql = String::from(
                "INSERT INTO relay_adjustments (slot, relay, block_number, builder_pubkey, \
                 delta, adjusted_value, submitted_value, adjusted_block_hash, \
                 submitted_block_hash, submitted_received_at, has_adjustment, fetched_at) VALUES ",
            );
            sql.push_str(&values_clauses(chunk.len(), 12));
            sql.push_str(
                " ON CONFLICT (slot) DO UPDATE SET relay = excluded.relay, \
                 block_number = excluded.block_number, builder_pubkey = excluded.builder_pubkey, \
                 delta = excluded.delta, adjusted_value = excluded.adjusted_value, \
                 submitted_value = excluded.submitted_value, \
                 adjusted_block_hash = excluded.adjusted_block_hash, \
                 submitted_block_hash = excluded.submitted_block_hash, \
                 submitted_received_at = excluded.submitted_received_at, \
                 has_adjustment = excluded.has_adjustment, fetched_at = excluded.fetched_at",
            );

            client.execute(&sql, &params[..]).await?;
            ROWS_UPSERTED.with_label_values(&["relay_adjustments"]).inc_by(chunk.len() as u64);
        }
        Ok(())
    }

    async fn upsert_aggregates(&self, records: &[AggregateRecord]) -> Result<(), DatabaseError> {
        if records.is_empty() {
            return Ok(());
        }
        let client = self.pool.get().await?;

        for chunk in records.chunks(UPSERT_CHUNK_SIZE) {
            let structured: Vec<_> = chunk
                .iter()
                .map(|r| {
                    (
                        r.block_number as i64,
                        r.block_timestamp,
                        r.slot.map(|s| s as i64),
                        r.builder_name.clone(),
                        r.proposer_name.clone(),
                        r.is_block_vanilla,
                        r.relays.clone(),
                        r.n_relays,
                        r.builder_balance_increase,
                        r.builder_extra_transfers,
                        r.proposer_subsidy,
                        r.relay_fee,
                        r.total_value,
                    )
                })
                .collect();
            let params: Vec<&(dyn ToSql + Sync)> = structured
                .iter()
                .flat_map(|p| {
                    vec![
                        &p.0 as &(dyn ToSql + Sync),
                        &p.1,
                        &p.2,
                        &p.3,
                        &p.4,
                        &p.5,
                        &p.6,
                        &p.7,
                        &p.8,
                        &p.9,
                        &p.10,
                        &p.11,
                        &p.12,
                    ]
                })
                .collect();

            let mut sql = String::from(
                "INSERT INTO pbs_aggregates (block_number, block_timestamp, slot, builder_name, \
                 proposer_name, is_block_vanilla, relays, n_relays, builder_balance_increase, \
                 builder_extra_transfers, proposer_subsidy, relay_fee, total_value) VALUES ",
            );
            sql.push_str(&values_clauses(chunk.len(), 13));
            sql.push_str(
                " ON CONFLICT (block_number) DO UPDATE SET \
                 block_timestamp = excluded.block_timestamp, slot = excluded.slot, \
                 builder_name = excluded.builder_name, proposer_name = excluded.proposer_name, \
                 is_block_vanilla = excluded.is_block_vanilla, relays = excluded.relays, \
                 n_relays = excluded.n_relays, \
                 builder_balance_increase = excluded.builder_balance_increase, \
                 builder_extra_transfers = excluded.builder_extra_transfers, \
                 proposer_subsidy = excluded.proposer_subsidy, relay_fee = excluded.relay_fee, \
                 total_value = excluded.total_value",
            );

            client.execute(&sql, &params[..]).await?;
            ROWS_UPSERTED.with_label_values(&["pbs_aggregates"]).inc_by(chunk.len() as u64);
        }
        Ok(())
    }

    async fn get_checkpoint(&self, stream_key: &str) -> Result<Option<Checkpoint>, DatabaseError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT stream_key, \"cursor\", last_processed_marker, completed \
                 FROM checkpoints WHERE stream_key = $1",
                &[&stream_key],
            )
            .await?;
        Ok(row.map(|row| parse_checkpoint_row(&row)))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        let client = self.pool.get().await?;
        exec_save_checkpoint(&client, checkpoint).await
    }

    async fn completed_archive_dates(&self) -> Result<Vec<NaiveDate>, DatabaseError> {
        let client = self.pool.get().await?;
        let prefix = format!("{}::", streams::BLOCK_ARCHIVE);
        let rows = client
            .query(
                "SELECT stream_key FROM checkpoints WHERE stream_key LIKE $1 AND completed",
                &[&format!("{prefix}%")],
            )
            .await?;
        let mut dates = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("stream_key");
            let date = key
                .strip_prefix(&prefix)
                .and_then(|suffix| NaiveDate::from_str(suffix).ok())
                .ok_or_else(|| DatabaseError::CheckpointNotFound(key.clone()))?;
            dates.push(date);
        }
        dates.sort_unstable();
        Ok(dates)
    }

    async fn upsert_blocks_with_archive_date(
        &self,
        blocks: &[BlockRecord],
        date: NaiveDate,
    ) -> Result<(), DatabaseError> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        exec_upsert_blocks(&transaction, blocks).await?;
        let checkpoint = Checkpoint {
            stream_key: format!("{}::{}", streams::BLOCK_ARCHIVE, date),
            cursor: None,
            last_processed_marker: Some(blocks.len() as i64),
            completed: true,
        };
        exec_save_checkpoint(&transaction, &checkpoint).await?;
        transaction.commit().await?;
        Ok(())
    }

    async fn block_number_range(&self) -> Result<Option<(u64, u64)>, DatabaseError> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT MIN(number), MAX(number) FROM blocks", &[]).await?;
        let min: Option<i64> = row.get(0);
        let max: Option<i64> = row.get(1);
        Ok(min.zip(max).map(|(lo, hi)| (lo as u64, hi as u64)))
    }

    async fn missing_block_numbers(
        &self,
        lo: u64,
        hi: u64,
        limit: i64,
    ) -> Result<Vec<u64>, DatabaseError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "WITH expected AS (SELECT generate_series($1::bigint, $2::bigint) AS number) \
                 SELECT e.number FROM expected e \
                 LEFT JOIN blocks b ON e.number = b.number \
                 WHERE b.number IS NULL ORDER BY e.number LIMIT $3",
                &[&(lo as i64), &(hi as i64), &limit],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, i64>(0) as u64).collect())
    }

    async fn blocks_missing_balance_deltas(
        &self,
        limit: i64,
    ) -> Result<Vec<(u64, Address)>, DatabaseError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT b.number, b.fee_recipient FROM blocks b \
                 WHERE NOT EXISTS (SELECT 1 FROM builder_balances d \
                                   WHERE d.block_number = b.number) \
                 ORDER BY b.number DESC LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let address = crate::postgres::rows::parse_hex::<Address>(row.get(1))?;
                Ok((row.get::<_, i64>(0) as u64, address))
            })
            .collect()
    }

    async fn blocks_missing_auxiliary_deltas(
        &self,
        fee_recipients: &[Address],
        limit: i64,
    ) -> Result<Vec<(u64, Address)>, DatabaseError> {
        if fee_recipients.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let recipients: Vec<String> = fee_recipients.iter().map(hex).collect();
        let rows = client
            .query(
                "SELECT b.number, b.fee_recipient FROM blocks b \
                 WHERE b.fee_recipient = ANY($1) \
                 AND NOT EXISTS (SELECT 1 FROM extra_builder_balances e \
                                 WHERE e.block_number = b.number) \
                 ORDER BY b.number DESC LIMIT $2",
                &[&recipients, &limit],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let address = crate::postgres::rows::parse_hex::<Address>(row.get(1))?;
                Ok((row.get::<_, i64>(0) as u64, address))
            })
            .collect()
    }

    async fn blocks_missing_aggregates(&self, limit: i64) -> Result<Vec<u64>, DatabaseError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT b.number FROM blocks b \
                 WHERE NOT EXISTS (SELECT 1 FROM pbs_aggregates a \
                                   WHERE a.block_number = b.number) \
                 ORDER BY b.number DESC LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, i64>(0) as u64).collect())
    }

    async fn unadjusted_slots(&self, relay: &str, limit: i64) -> Result<Vec<u64>, DatabaseError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT DISTINCT rp.slot FROM relay_payloads rp \
                 LEFT JOIN relay_adjustments ra ON rp.slot = ra.slot \
                 WHERE rp.relay = $1 AND ra.slot IS NULL \
                 ORDER BY rp.slot DESC LIMIT $2",
                &[&relay, &limit],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, i64>(0) as u64).collect())
    }

    async fn get_blocks_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<BlockRecord>, DatabaseError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM blocks WHERE number BETWEEN $1 AND $2 ORDER BY number",
                &[&(lo as i64), &(hi as i64)],
            )
            .await?;
        rows.iter().map(parse_block_row).collect()
    }

    async fn get_balance_deltas_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<BalanceDelta>, DatabaseError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM builder_balances WHERE block_number BETWEEN $1 AND $2 \
                 ORDER BY block_number",
                &[&(lo as i64), &(hi as i64)],
            )
            .await?;
        rows.iter().map(parse_balance_delta_row).collect()
    }

    async fn get_auxiliary_deltas_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<AuxiliaryBuilderDelta>, DatabaseError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM extra_builder_balances WHERE block_number BETWEEN $1 AND $2 \
                 ORDER BY block_number, address",
                &[&(lo as i64), &(hi as i64)],
            )
            .await?;
        rows.iter().map(parse_auxiliary_delta_row).collect()
    }

    async fn get_relay_payloads_for_blocks(
        &self,
        lo: u64,
        hi: u64,
    ) -> Result<Vec<RelayPayload>, DatabaseError> {
        let client = self.pool.get().await?;
        // inserted_at keeps the aggregate `relays` array in insertion order
        let rows = client
            .query(
                "SELECT * FROM relay_payloads WHERE block_number BETWEEN $1 AND $2 \
                 ORDER BY block_number, inserted_at, relay",
                &[&(lo as i64), &(hi as i64)],
            )
            .await?;
        rows.iter().map(parse_relay_payload_row).collect()
    }

    async fn get_adjustments_for_slots(
        &self,
        slots: &[u64],
    ) -> Result<Vec<Adjustment>, DatabaseError> {
        if slots.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let slots: Vec<i64> = slots.iter().map(|s| *s as i64).collect();
        let rows = client
            .query("SELECT * FROM relay_adjustments WHERE slot = ANY($1)", &[&slots])
            .await?;
        rows.iter().map(parse_adjustment_row).collect()
    }

    async fn relay_daily_counts(
        &self,
        relay: &str,
    ) -> Result<Vec<(NaiveDate, i64)>, DatabaseError> {
        let client = self.pool.get().await?;
        let genesis = mevscope_common::chain::BEACON_GENESIS_TIMESTAMP as i64;
        let rows = client
            .query(
                "SELECT ((to_timestamp($2 + slot * 12) AT TIME ZONE 'UTC')::date) AS day, \
                 COUNT(*)::bigint AS payloads \
                 FROM relay_payloads WHERE relay = $1 GROUP BY day ORDER BY day",
                &[&relay, &genesis],
            )
            .await?;
        Ok(rows.iter().map(|row| (row.get("day"), row.get("payloads"))).collect())
    }
}
