use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};
use mevscope_aggregate::Aggregator;
use mevscope_archive::ArchiveReader;
use mevscope_backfill::{
    run_backfill, AdjustmentBackfill, AggregateBackfill, AuxiliaryBalanceBackfill,
    BalanceBackfill, BlockArchiveBackfill, BlockGapRepair, RelayGapRepair, RelayPayloadBackfill,
    DEFAULT_UNIT_CONCURRENCY,
};
use mevscope_common::{
    chain::timestamp_to_slot, logging::init_tracing_log, metrics::start_metrics_server,
    utcnow_sec, PipelineConfig, MAINNET_RELAYS,
};
use mevscope_database::{start_db_service, PostgresDatabaseService};
use mevscope_live::LiveCoordinator;
use mevscope_relays::{AdjustmentsClient, RelayClient};
use mevscope_rpc::RpcClient;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mevscope", about = "Ethereum PBS market data pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream new heads and run the per-block ingestion stages.
    Live,
    /// Run one resumable historical backfill stream.
    Backfill {
        #[command(subcommand)]
        stream: BackfillStream,
    },
    /// Recompute aggregate records over a block range.
    Aggregate {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },
    /// Detect relay collection gaps and repair them.
    RepairGaps {
        /// Report gaps without re-querying the relays.
        #[arg(long)]
        detect_only: bool,
    },
}

#[derive(Subcommand)]
enum BackfillStream {
    /// Block history from the parquet archive, date-ascending.
    Blocks {
        #[arg(long, default_value = "2022-09-15")]
        start_date: NaiveDate,
        /// Defaults to yesterday; the archive partitions trail the chain.
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
    /// Holes in the stored block sequence, fetched over RPC.
    BlockGaps,
    /// Fee-recipient balance deltas, newest first.
    Balances,
    /// Auxiliary builder wallet deltas, newest first.
    ExtraBuilders,
    /// Relay payloads for every registered relay, two-phase resume.
    Relays {
        /// Defaults to the current wall-clock slot minus a safety buffer.
        #[arg(long)]
        latest_slot: Option<u64>,
        #[arg(long, default_value_t = 0)]
        end_slot: u64,
    },
    /// Ultrasound bid adjustments, newest first.
    Adjustments,
    /// Aggregate records for blocks that have none.
    Aggregates,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let _guard = init_tracing_log(&config.logging);
    start_metrics_server(config.metrics_port);

    if let Err(err) = run(cli.command, config).await {
        error!(%err, "mevscope exited with error");
        std::process::exit(1);
    }
}

async fn run(command: Command, config: PipelineConfig) -> eyre::Result<()> {
    let db = start_db_service(&config.postgres).await.wrap_err("database startup failed")?;
    let rpc = Arc::new(RpcClient::new(config.rpc.clone()));

    match command {
        Command::Live => run_live(db, rpc, config).await,
        Command::Backfill { stream } => run_backfill_stream(stream, db, rpc, config).await,
        Command::Aggregate { from, to } => {
            let aggregator = Aggregator::new(db);
            let stored = aggregator.aggregate_and_store(from, to).await?;
            info!(from, to, stored, "aggregation complete");
            Ok(())
        }
        Command::RepairGaps { detect_only } => run_gap_repair(db, detect_only).await,
    }
}

async fn run_live(
    db: PostgresDatabaseService,
    rpc: Arc<RpcClient>,
    config: PipelineConfig,
) -> eyre::Result<()> {
    let relay_clients = relay_clients()?;
    let adjustments_client = Arc::new(AdjustmentsClient::new().map_err(|e| eyre!("{e}"))?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    let coordinator =
        LiveCoordinator::new(db, rpc, relay_clients, adjustments_client, config.live.clone());
    coordinator.run(shutdown_rx).await?;
    Ok(())
}

async fn run_backfill_stream(
    stream: BackfillStream,
    db: PostgresDatabaseService,
    rpc: Arc<RpcClient>,
    config: PipelineConfig,
) -> eyre::Result<()> {
    match stream {
        BackfillStream::Blocks { start_date, end_date } => {
            let end_date = end_date
                .or_else(|| Utc::now().date_naive().pred_opt())
                .ok_or_else(|| eyre!("no end date"))?;
            let archive = ArchiveReader::new(&config.archive);
            let source = Arc::new(BlockArchiveBackfill::new(db, archive, start_date, end_date));
            run_backfill(source, DEFAULT_UNIT_CONCURRENCY).await?;
        }
        BackfillStream::BlockGaps => {
            let source = Arc::new(BlockGapRepair::new(db, rpc));
            run_backfill(source, DEFAULT_UNIT_CONCURRENCY).await?;
        }
        BackfillStream::Balances => {
            let source = Arc::new(BalanceBackfill::new(db, rpc));
            run_backfill(source, DEFAULT_UNIT_CONCURRENCY).await?;
        }
        BackfillStream::ExtraBuilders => {
            let source = Arc::new(AuxiliaryBalanceBackfill::new(db, rpc));
            run_backfill(source, DEFAULT_UNIT_CONCURRENCY).await?;
        }
        BackfillStream::Relays { latest_slot, end_slot } => {
            // leave the freshest slots to the live path; relays publish late
            let latest = latest_slot
                .unwrap_or_else(|| timestamp_to_slot(utcnow_sec()).saturating_sub(50));
            let backfill = RelayPayloadBackfill::new(db, relay_clients()?, end_slot);
            let outcomes = backfill.run(latest).await;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(rows) => info!(relay = %outcome.relay, rows, "relay complete"),
                    Err(err) => {
                        failed += 1;
                        error!(relay = %outcome.relay, %err, "relay failed");
                    }
                }
            }
            if failed == outcomes.len() && failed > 0 {
                return Err(eyre!("every relay backfill failed"));
            }
        }
        BackfillStream::Adjustments => {
            let client = Arc::new(AdjustmentsClient::new().map_err(|e| eyre!("{e}"))?);
            let source = Arc::new(AdjustmentBackfill::new(db, client));
            run_backfill(source, DEFAULT_UNIT_CONCURRENCY).await?;
        }
        BackfillStream::Aggregates => {
            let source = Arc::new(AggregateBackfill::new(db));
            run_backfill(source, DEFAULT_UNIT_CONCURRENCY).await?;
        }
    }
    Ok(())
}

async fn run_gap_repair(db: PostgresDatabaseService, detect_only: bool) -> eyre::Result<()> {
    let repair = RelayGapRepair::new(db, relay_clients()?);

    if detect_only {
        let gaps = repair.detect().await?;
        for gap in &gaps {
            info!(
                relay = %gap.relay,
                from_slot = gap.from_slot,
                to_slot = gap.to_slot,
                days = gap.dates.len(),
                missing_estimate = gap.estimated_missing_slots(),
                "gap detected"
            );
        }
        info!(gaps = gaps.len(), "gap detection complete");
        return Ok(());
    }

    let outcomes = repair.repair_all().await?;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(merged) => {
                info!(relay = %outcome.gap.relay, merged, "gap repaired")
            }
            Err(err) => error!(relay = %outcome.gap.relay, %err, "gap repair failed"),
        }
    }
    Ok(())
}

fn relay_clients() -> eyre::Result<Vec<Arc<RelayClient>>> {
    MAINNET_RELAYS
        .iter()
        .map(|entry| RelayClient::new(*entry).map(Arc::new).map_err(|e| eyre!("{e}")))
        .collect()
}
