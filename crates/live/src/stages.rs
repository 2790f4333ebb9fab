//! The six per-block stages.
//!
//! The header stage consumes raw heads, stores the full block and forwards
//! it to the four mid stages (balances, auxiliary balances, relay payloads,
//! adjustments). Each mid stage reports a completion to the aggregate
//! trigger, which derives the block's aggregate once all four have answered
//! with success or defined failure. Stage errors are logged and isolated;
//! the next head proceeds normally.

use std::{collections::HashMap, sync::Arc};

use futures::future::join_all;
use mevscope_aggregate::Aggregator;
use mevscope_common::{
    auxiliary_addresses_for,
    chain::timestamp_to_slot,
    metrics::{QUEUE_DEPTH, STAGE_OUTCOMES},
    AuxiliaryBuilderDelta, BlockRecord, LiveConfig,
};
use mevscope_database::DatabaseService;
use mevscope_relays::{AdjustmentsClient, RelayClient};
use mevscope_rpc::{ExecutionHeader, RpcClient};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    BlockHeader,
    BalanceDelta,
    AuxiliaryDeltas,
    RelayPayloads,
    Adjustments,
    Aggregate,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::BlockHeader => "block_header",
            Stage::BalanceDelta => "balance_delta",
            Stage::AuxiliaryDeltas => "auxiliary_deltas",
            Stage::RelayPayloads => "relay_payloads",
            Stage::Adjustments => "adjustments",
            Stage::Aggregate => "aggregate",
        }
    }
}

/// The four stages the aggregate trigger waits on.
pub const AGGREGATE_PREREQUISITES: [Stage; 4] =
    [Stage::BalanceDelta, Stage::AuxiliaryDeltas, Stage::RelayPayloads, Stage::Adjustments];

/// Success or defined-failure report from one stage for one block.
#[derive(Debug, Clone, Copy)]
pub struct StageCompletion {
    pub block_number: u64,
    pub stage: Stage,
    pub ok: bool,
}

fn report(completions: &mpsc::Sender<StageCompletion>, block_number: u64, stage: Stage, ok: bool) {
    STAGE_OUTCOMES
        .with_label_values(&[stage.name(), if ok { "ok" } else { "failed" }])
        .inc();
    // a dropped completion only delays the block's aggregate until the
    // aggregate backfill sweeps it up
    if let Err(err) = completions.try_send(StageCompletion { block_number, stage, ok }) {
        warn!(%err, stage = stage.name(), block_number, "completion channel full, dropping");
    }
}

/// Forwards a job to a stage queue, warning once the queue hits its
/// high-water mark, then applying backpressure.
async fn forward(tx: &mpsc::Sender<Arc<BlockRecord>>, stage: Stage, job: Arc<BlockRecord>) {
    let depth = (tx.max_capacity() - tx.capacity()) as i64;
    QUEUE_DEPTH.with_label_values(&[stage.name()]).set(depth);

    if let Err(err) = tx.try_send(job) {
        match err {
            mpsc::error::TrySendError::Full(job) => {
                warn!(stage = stage.name(), "stage queue full, backpressuring");
                if tx.send(job).await.is_err() {
                    error!(stage = stage.name(), "stage queue closed");
                }
            }
            mpsc::error::TrySendError::Closed(_) => {
                error!(stage = stage.name(), "stage queue closed");
            }
        }
    }
}

/// Header stage: fetch the full block, store it, fan out. The block row is
/// committed before any downstream stage sees the header, which is the
/// happens-before edge every other stage relies on.
pub async fn run_header_stage<D: DatabaseService>(
    db: D,
    rpc: Arc<RpcClient>,
    mut heads_rx: mpsc::Receiver<ExecutionHeader>,
    fanout: Vec<(Stage, mpsc::Sender<Arc<BlockRecord>>)>,
    completions: mpsc::Sender<StageCompletion>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let header = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            header = heads_rx.recv() => match header {
                Some(header) => header,
                None => break,
            },
        };

        let number = header.number();
        match store_block(&db, &rpc, header).await {
            Ok(record) => {
                report(&completions, number, Stage::BlockHeader, true);
                let record = Arc::new(record);
                for (stage, tx) in &fanout {
                    forward(tx, *stage, record.clone()).await;
                }
            }
            Err(err) => {
                error!(%err, number, "header stage failed");
                report(&completions, number, Stage::BlockHeader, false);
            }
        }
    }
    info!("header stage stopped");
}

async fn store_block<D: DatabaseService>(
    db: &D,
    rpc: &RpcClient,
    header: ExecutionHeader,
) -> Result<BlockRecord, StageError> {
    // refetch by number: newHeads notifications omit the transaction list
    let number = header.number();
    let fetched = rpc.get_block_headers(&[number]).await?;
    let full = fetched.into_iter().next().ok_or(StageError::MissingBlock(number))?;
    let record = full.into_record()?;
    db.upsert_blocks(&[record.clone()]).await?;
    Ok(record)
}

/// Balance stage: fee-recipient delta across the block.
pub async fn run_balance_stage<D: DatabaseService>(
    db: D,
    rpc: Arc<RpcClient>,
    mut jobs_rx: mpsc::Receiver<Arc<BlockRecord>>,
    completions: mpsc::Sender<StageCompletion>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let block = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = jobs_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let result = async {
            let changes =
                rpc.get_balance_changes(&[(block.fee_recipient, block.number)]).await?;
            let deltas: Vec<_> = changes.into_iter().map(|c| c.into_balance_delta()).collect();
            db.upsert_balance_deltas(&deltas).await?;
            Ok::<_, StageError>(())
        }
        .await;

        match result {
            Ok(()) => report(&completions, block.number, Stage::BalanceDelta, true),
            Err(err) => {
                error!(%err, number = block.number, "balance stage failed");
                report(&completions, block.number, Stage::BalanceDelta, false);
            }
        }
    }
    info!("balance stage stopped");
}

/// Auxiliary builder stage: one delta row per known auxiliary wallet of the
/// block's fee recipient. Blocks without a known set complete with no rows.
pub async fn run_auxiliary_stage<D: DatabaseService>(
    db: D,
    rpc: Arc<RpcClient>,
    mut jobs_rx: mpsc::Receiver<Arc<BlockRecord>>,
    completions: mpsc::Sender<StageCompletion>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let block = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = jobs_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let auxiliaries = auxiliary_addresses_for(&block.fee_recipient);
        if auxiliaries.is_empty() {
            report(&completions, block.number, Stage::AuxiliaryDeltas, true);
            continue;
        }

        let result = async {
            let requests: Vec<_> =
                auxiliaries.iter().map(|address| (*address, block.number)).collect();
            let changes = rpc.get_balance_changes(&requests).await?;
            let deltas: Vec<AuxiliaryBuilderDelta> = changes
                .into_iter()
                .map(|change| AuxiliaryBuilderDelta {
                    block_number: block.number,
                    address: change.address,
                    fee_recipient: block.fee_recipient,
                    balance_before: change.balance_before,
                    balance_after: change.balance_after,
                    balance_increase: change.balance_increase(),
                })
                .collect();
            db.upsert_auxiliary_deltas(&deltas).await?;
            Ok::<_, StageError>(())
        }
        .await;

        match result {
            Ok(()) => report(&completions, block.number, Stage::AuxiliaryDeltas, true),
            Err(err) => {
                error!(%err, number = block.number, "auxiliary stage failed");
                report(&completions, block.number, Stage::AuxiliaryDeltas, false);
            }
        }
    }
    info!("auxiliary stage stopped");
}

/// Relay stage: wait out the publication lag, then query every relay for the
/// block. Relays fail independently; any successful relay's rows commit.
pub async fn run_relay_stage<D: DatabaseService>(
    db: D,
    clients: Vec<Arc<RelayClient>>,
    config: LiveConfig,
    mut jobs_rx: mpsc::Receiver<Arc<BlockRecord>>,
    completions: mpsc::Sender<StageCompletion>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let block = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = jobs_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        // relays publish with lag; the wait is cancellable on shutdown
        if !wait_for_publication(&block, config.relay_publication_delay(), &mut shutdown).await {
            break;
        }

        let fetches = clients.iter().map(|client| {
            let client = client.clone();
            let number = block.number;
            async move { (client.host(), client.payloads_for_block(number).await) }
        });

        let mut stored = 0usize;
        let mut failures = 0usize;
        for (relay, result) in join_all(fetches).await {
            match result {
                Ok(payloads) => {
                    if payloads.is_empty() {
                        continue;
                    }
                    match db.upsert_relay_payloads(&payloads).await {
                        Ok(()) => stored += payloads.len(),
                        Err(err) => {
                            failures += 1;
                            error!(%err, relay, number = block.number, "payload store failed");
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(%err, relay, number = block.number, "relay fetch failed");
                }
            }
        }

        debug!(number = block.number, stored, failures, "relay stage done");
        report(&completions, block.number, Stage::RelayPayloads, failures == 0);
    }
    info!("relay stage stopped");
}

/// Sleeps until `publication_delay` past the block's timestamp. Returns
/// false if shutdown ended the wait.
async fn wait_for_publication(
    block: &BlockRecord,
    publication_delay: std::time::Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let age = chrono::Utc::now()
        .signed_duration_since(block.timestamp)
        .to_std()
        .unwrap_or_default();
    let Some(remaining) = publication_delay.checked_sub(age) else {
        return true;
    };

    tokio::select! {
        _ = tokio::time::sleep(remaining) => true,
        _ = shutdown.changed() => false,
    }
}

/// Adjustment stage: per-slot delta fetch from the publishing relay subset.
/// Post-merge, block timestamps land exactly on slot boundaries, so the slot
/// derives from the timestamp.
pub async fn run_adjustment_stage<D: DatabaseService>(
    db: D,
    client: Arc<AdjustmentsClient>,
    config: LiveConfig,
    mut jobs_rx: mpsc::Receiver<Arc<BlockRecord>>,
    completions: mpsc::Sender<StageCompletion>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let block = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = jobs_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if !wait_for_publication(&block, config.relay_publication_delay(), &mut shutdown).await {
            break;
        }

        let slot = timestamp_to_slot(block.timestamp.timestamp() as u64);
        let result = async {
            let adjustment = client.fetch_for_slot(slot).await?;
            db.upsert_adjustments(&[adjustment]).await?;
            Ok::<_, StageError>(())
        }
        .await;

        match result {
            Ok(()) => report(&completions, block.number, Stage::Adjustments, true),
            Err(err) => {
                warn!(%err, number = block.number, slot, "adjustment stage failed");
                report(&completions, block.number, Stage::Adjustments, false);
            }
        }
    }
    info!("adjustment stage stopped");
}

/// Aggregate trigger: collects completions and derives the block's aggregate
/// once all four mid stages reported. A failed prerequisite still counts as
/// answered (defined failure); the aggregate is computed from whatever was
/// stored and recomputed by the backfill later.
pub async fn run_aggregate_trigger<D: DatabaseService>(
    db: D,
    mut completions_rx: mpsc::Receiver<StageCompletion>,
    mut shutdown: watch::Receiver<bool>,
) {
    let aggregator = Aggregator::new(db);
    let mut pending: HashMap<u64, Vec<Stage>> = HashMap::new();

    loop {
        let completion = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            completion = completions_rx.recv() => match completion {
                Some(completion) => completion,
                None => break,
            },
        };

        if !AGGREGATE_PREREQUISITES.contains(&completion.stage) {
            continue;
        }

        let answered = pending.entry(completion.block_number).or_default();
        if !answered.contains(&completion.stage) {
            answered.push(completion.stage);
        }
        if answered.len() < AGGREGATE_PREREQUISITES.len() {
            continue;
        }
        pending.remove(&completion.block_number);

        let number = completion.block_number;
        match aggregator.aggregate_and_store(number, number).await {
            Ok(stored) => {
                info!(number, stored, "aggregate derived");
                STAGE_OUTCOMES.with_label_values(&[Stage::Aggregate.name(), "ok"]).inc();
            }
            Err(err) => {
                error!(%err, number, "aggregate stage failed");
                STAGE_OUTCOMES.with_label_values(&[Stage::Aggregate.name(), "failed"]).inc();
            }
        }

        // heads that never completed fall behind the current one by more
        // than the queue can hold; drop their bookkeeping
        let watermark = number.saturating_sub(1_000);
        pending.retain(|n, _| *n >= watermark);
    }
    info!("aggregate trigger stopped");
}

#[derive(Debug, thiserror::Error)]
enum StageError {
    #[error("rpc error: {0}")]
    Rpc(#[from] mevscope_rpc::RpcError),
    #[error("relay error: {0}")]
    Relay(#[from] mevscope_relays::RelayClientError),
    #[error("database error: {0}")]
    Database(#[from] mevscope_database::DatabaseError),
    #[error("aggregate error: {0}")]
    Aggregate(#[from] mevscope_aggregate::AggregateError),
    #[error("block {0} missing after successful response")]
    MissingBlock(u64),
}
