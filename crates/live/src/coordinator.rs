//! The live coordinator: owns the websocket subscription, the bounded
//! fan-out queues and the stage tasks, and drives graceful shutdown.

use std::sync::Arc;

use mevscope_common::{task::spawn_named, ConfigError, LiveConfig};
use mevscope_database::DatabaseService;
use mevscope_relays::{AdjustmentsClient, RelayClient};
use mevscope_rpc::RpcClient;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::{
    stages::{
        run_adjustment_stage, run_aggregate_trigger, run_auxiliary_stage, run_balance_stage,
        run_header_stage, run_relay_stage, Stage,
    },
    ws::HeadSubscriber,
};

/// Completions buffer: four reports per in-flight block.
const COMPLETIONS_CAPACITY: usize = 1_024;

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub struct LiveCoordinator<D: DatabaseService + 'static> {
    db: D,
    rpc: Arc<RpcClient>,
    relay_clients: Vec<Arc<RelayClient>>,
    adjustments_client: Arc<AdjustmentsClient>,
    config: LiveConfig,
}

impl<D: DatabaseService + 'static> LiveCoordinator<D> {
    pub fn new(
        db: D,
        rpc: Arc<RpcClient>,
        relay_clients: Vec<Arc<RelayClient>>,
        adjustments_client: Arc<AdjustmentsClient>,
        config: LiveConfig,
    ) -> Self {
        Self { db, rpc, relay_clients, adjustments_client, config }
    }

    /// Runs until the shutdown signal flips, then drains in-flight stages
    /// within the grace window and returns.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), LiveError> {
        let ws_url = self.config.require_ws_url()?;
        let capacity = self.config.queue_capacity;

        let (heads_tx, heads_rx) = mpsc::channel(capacity);
        let (completions_tx, completions_rx) = mpsc::channel(COMPLETIONS_CAPACITY);

        let (balance_tx, balance_rx) = mpsc::channel(capacity);
        let (auxiliary_tx, auxiliary_rx) = mpsc::channel(capacity);
        let (relay_tx, relay_rx) = mpsc::channel(capacity);
        let (adjustment_tx, adjustment_rx) = mpsc::channel(capacity);

        let fanout = vec![
            (Stage::BalanceDelta, balance_tx),
            (Stage::AuxiliaryDeltas, auxiliary_tx),
            (Stage::RelayPayloads, relay_tx),
            (Stage::Adjustments, adjustment_tx),
        ];

        let subscriber =
            HeadSubscriber::new(ws_url, self.config.ping_interval());

        let mut handles = Vec::new();
        handles.push(spawn_named("head_subscriber", subscriber.run(heads_tx, shutdown.clone())));
        handles.push(spawn_named(
            Stage::BlockHeader.name(),
            run_header_stage(
                self.db.clone(),
                self.rpc.clone(),
                heads_rx,
                fanout,
                completions_tx.clone(),
                shutdown.clone(),
            ),
        ));
        handles.push(spawn_named(
            Stage::BalanceDelta.name(),
            run_balance_stage(
                self.db.clone(),
                self.rpc.clone(),
                balance_rx,
                completions_tx.clone(),
                shutdown.clone(),
            ),
        ));
        handles.push(spawn_named(
            Stage::AuxiliaryDeltas.name(),
            run_auxiliary_stage(
                self.db.clone(),
                self.rpc.clone(),
                auxiliary_rx,
                completions_tx.clone(),
                shutdown.clone(),
            ),
        ));
        handles.push(spawn_named(
            Stage::RelayPayloads.name(),
            run_relay_stage(
                self.db.clone(),
                self.relay_clients.clone(),
                self.config.clone(),
                relay_rx,
                completions_tx.clone(),
                shutdown.clone(),
            ),
        ));
        handles.push(spawn_named(
            Stage::Adjustments.name(),
            run_adjustment_stage(
                self.db.clone(),
                self.adjustments_client.clone(),
                self.config.clone(),
                adjustment_rx,
                completions_tx,
                shutdown.clone(),
            ),
        ));
        handles.push(spawn_named(
            Stage::Aggregate.name(),
            run_aggregate_trigger(self.db.clone(), completions_rx, shutdown.clone()),
        ));

        info!(stages = handles.len(), "live coordinator started");

        // wait for the shutdown signal
        let mut shutdown_wait = shutdown.clone();
        if !*shutdown_wait.borrow() {
            let _ = shutdown_wait.changed().await;
        }

        info!(grace = ?self.config.shutdown_grace(), "draining in-flight stages");
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(self.config.shutdown_grace(), drain).await.is_err() {
            warn!("grace window elapsed, cancelling remaining stages");
            for abort in aborts {
                abort.abort();
            }
        }

        info!("live coordinator stopped");
        Ok(())
    }
}
