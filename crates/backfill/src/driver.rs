//! Shared backfill skeleton: checkpointed work selection, bounded unit
//! concurrency, progress reporting with ETA.
//!
//! A unit failure marks the unit for retry on the next invocation and the
//! run continues; a fatal error (transport budget exhausted, database down)
//! stops the run, leaving every committed checkpoint intact.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use mevscope_common::metrics::BACKFILL_PROGRESS;
use mevscope_database::DatabaseError;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Units processed concurrently per round.
pub const DEFAULT_UNIT_CONCURRENCY: usize = 5;

/// Most work items a selector may return per call, to bound memory and
/// database load.
pub const MAX_WORK_PER_SELECT: i64 = 10_000;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// The unit failed; it stays unprocessed and retries next run.
    #[error("unit failed: {0}")]
    Unit(String),

    /// The whole run must stop.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<mevscope_rpc::RpcError> for BackfillError {
    fn from(err: mevscope_rpc::RpcError) -> Self {
        match err {
            mevscope_rpc::RpcError::Transport { .. } => BackfillError::Fatal(err.to_string()),
            other => BackfillError::Unit(other.to_string()),
        }
    }
}

impl From<mevscope_archive::ArchiveError> for BackfillError {
    fn from(err: mevscope_archive::ArchiveError) -> Self {
        BackfillError::Unit(err.to_string())
    }
}

impl From<mevscope_relays::RelayClientError> for BackfillError {
    fn from(err: mevscope_relays::RelayClientError) -> Self {
        match err {
            mevscope_relays::RelayClientError::Transport { .. } => {
                BackfillError::Fatal(err.to_string())
            }
            other => BackfillError::Unit(other.to_string()),
        }
    }
}

impl From<mevscope_aggregate::AggregateError> for BackfillError {
    fn from(err: mevscope_aggregate::AggregateError) -> Self {
        match err {
            mevscope_aggregate::AggregateError::Database(db) => BackfillError::Database(db),
        }
    }
}

/// One resumable backfill stream: a selector for what's missing and a
/// processor for one unit. The processor commits its own rows and checkpoint
/// advance.
#[async_trait]
pub trait BackfillSource: Send + Sync {
    type Unit: Send + 'static;

    fn stream_key(&self) -> String;

    /// Next batch of pending units, bounded by [`MAX_WORK_PER_SELECT`].
    /// An empty batch ends the run.
    async fn select_work(&self) -> Result<Vec<Self::Unit>, BackfillError>;

    async fn process_unit(&self, unit: Self::Unit) -> Result<(), BackfillError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub stream: String,
    pub units_processed: usize,
    pub units_failed: usize,
}

/// Drives one stream to completion: select, process up to `concurrency`
/// units at once, repeat until the selector runs dry or a round makes no
/// progress (every remaining unit failing).
pub async fn run_backfill<S: BackfillSource>(
    source: Arc<S>,
    concurrency: usize,
) -> Result<BackfillReport, BackfillError> {
    let stream_key = source.stream_key();
    let mut report = BackfillReport { stream: stream_key.clone(), ..Default::default() };

    loop {
        let units = source.select_work().await?;
        if units.is_empty() {
            break;
        }

        let progress = ProgressReporter::new(&stream_key, units.len());

        let outcomes: Vec<Result<(), BackfillError>> = stream::iter(units)
            .map(|unit| {
                let source = source.clone();
                let progress = &progress;
                async move {
                    let result = source.process_unit(unit).await;
                    match &result {
                        Ok(()) => progress.advance(),
                        Err(BackfillError::Unit(cause)) => {
                            warn!(stream = %source.stream_key(), %cause, "unit failed, will retry next run");
                        }
                        Err(err) => error!(stream = %source.stream_key(), %err, "backfill aborting"),
                    }
                    result
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut succeeded = 0usize;
        for outcome in outcomes {
            match outcome {
                Ok(()) => succeeded += 1,
                Err(BackfillError::Unit(_)) => report.units_failed += 1,
                Err(fatal) => return Err(fatal),
            }
        }
        report.units_processed += succeeded;
        progress.finish();

        // Nothing moved this round: every remaining unit is failing, so a
        // tighter loop would just spin. They retry on the next invocation.
        if succeeded == 0 {
            break;
        }
    }

    info!(
        stream = %report.stream,
        processed = report.units_processed,
        failed = report.units_failed,
        "backfill run finished"
    );
    Ok(report)
}

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Rate/ETA progress, reported as structured log records and a gauge.
pub struct ProgressReporter {
    stream: String,
    total: usize,
    done: AtomicUsize,
    started: Instant,
    last_log: Mutex<Instant>,
}

impl ProgressReporter {
    pub fn new(stream: &str, total: usize) -> Self {
        let now = Instant::now();
        Self {
            stream: stream.to_string(),
            total,
            done: AtomicUsize::new(0),
            started: now,
            last_log: Mutex::new(now),
        }
    }

    pub fn advance(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if self.total > 0 {
            BACKFILL_PROGRESS
                .with_label_values(&[&self.stream])
                .set(done as f64 / self.total as f64);
        }

        let mut last_log = self.last_log.lock();
        if last_log.elapsed() < PROGRESS_LOG_INTERVAL && done != self.total {
            return;
        }
        *last_log = Instant::now();
        drop(last_log);

        let elapsed = self.started.elapsed().as_secs_f64().max(f64::MIN_POSITIVE);
        let rate = done as f64 / elapsed;
        let remaining = self.total.saturating_sub(done);
        let eta_secs = if rate > 0.0 { remaining as f64 / rate } else { f64::INFINITY };

        info!(
            stream = %self.stream,
            done,
            total = self.total,
            rate_per_sec = format_args!("{rate:.1}"),
            eta_secs = format_args!("{eta_secs:.0}"),
            "backfill progress"
        );
    }

    pub fn finish(&self) {
        let done = self.done.load(Ordering::Relaxed);
        info!(stream = %self.stream, done, total = self.total, "round complete");
    }
}
