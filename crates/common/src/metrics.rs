use std::net::SocketAddr;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use eyre::bail;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder, GaugeVec,
    IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static! {
    pub static ref MEVSCOPE_METRICS_REGISTRY: Registry =
        Registry::new_custom(Some("mevscope".to_string()), None).unwrap();

    /// Heads received over the websocket subscription.
    pub static ref HEADS_RECEIVED: IntCounterVec = register_int_counter_vec_with_registry!(
        "heads_received_total",
        "New head notifications received",
        &[],
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();

    /// Per-stage outcomes on the live path.
    pub static ref STAGE_OUTCOMES: IntCounterVec = register_int_counter_vec_with_registry!(
        "stage_outcomes_total",
        "Live stage completions by outcome",
        &["stage", "outcome"],
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();

    /// Pages fetched from relay data APIs.
    pub static ref RELAY_PAGES: IntCounterVec = register_int_counter_vec_with_registry!(
        "relay_pages_total",
        "Relay data API pages fetched",
        &["relay"],
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();

    /// Batched JSON-RPC requests issued.
    pub static ref RPC_BATCHES: IntCounterVec = register_int_counter_vec_with_registry!(
        "rpc_batches_total",
        "Batched JSON-RPC requests by method",
        &["method"],
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();

    /// Rows written per table.
    pub static ref ROWS_UPSERTED: IntCounterVec = register_int_counter_vec_with_registry!(
        "rows_upserted_total",
        "Rows upserted by table",
        &["table"],
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();

    /// Depth of the live fan-out queues.
    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec_with_registry!(
        "queue_depth",
        "Live stage queue depth",
        &["stage"],
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();

    /// 1 while the websocket subscription is live.
    pub static ref WS_CONNECTED: IntGauge = register_int_gauge_with_registry!(
        "ws_connected",
        "Websocket subscription state",
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();

    /// Backfill progress fraction per stream.
    pub static ref BACKFILL_PROGRESS: GaugeVec = register_gauge_vec_with_registry!(
        "backfill_progress",
        "Backfill completion fraction per stream",
        &["stream"],
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();

    pub static ref TASK_COUNT: IntGaugeVec = register_int_gauge_vec_with_registry!(
        "task_count",
        "Live pipeline tasks by component",
        &["task"],
        MEVSCOPE_METRICS_REGISTRY
    )
    .unwrap();
}

pub fn start_metrics_server(port: u16) {
    tokio::spawn(async move {
        if let Err(err) = MetricsProvider::new(port).run().await {
            error!(%err, "metrics server stopped");
        }
    });
}

pub struct MetricsProvider {
    port: u16,
}

impl MetricsProvider {
    pub fn new(port: u16) -> Self {
        MetricsProvider { port }
    }

    pub async fn run(self) -> eyre::Result<()> {
        info!("starting metrics server on port {}", self.port);

        let router = axum::Router::new()
            .route("/metrics", get(handle_metrics))
            .route("/status", get(|| async { StatusCode::OK }));
        let address = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(&address).await?;

        axum::serve(listener, router).await?;

        bail!("metrics server stopped")
    }
}

async fn handle_metrics() -> Response {
    match prepare_metrics() {
        Ok(response) => response,
        Err(err) => {
            error!(?err, "failed to prepare metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn prepare_metrics() -> Result<Response, MetricsError> {
    let encoder = TextEncoder::new();
    let metrics = MEVSCOPE_METRICS_REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer)?;

    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(MetricsError::from)
}

#[derive(Debug, thiserror::Error)]
enum MetricsError {
    #[error("encode error: {0}")]
    Encode(#[from] prometheus::Error),
    #[error("http error: {0}")]
    Http(#[from] axum::http::Error),
}
