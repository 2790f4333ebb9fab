//! Bid-adjustment backfill for the relay subset that publishes them.
//! Work selection is newest-first over delivered ultrasound slots without an
//! adjustment row; "no adjustment" answers are recorded as marker rows so a
//! slot is fetched exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use mevscope_common::{streams, ULTRASOUND_RELAY};
use mevscope_database::DatabaseService;
use mevscope_relays::AdjustmentsClient;
use tracing::warn;

use crate::driver::{BackfillError, BackfillSource, MAX_WORK_PER_SELECT};

const SLOTS_PER_UNIT: usize = 100;

pub struct AdjustmentBackfill<D> {
    db: D,
    client: Arc<AdjustmentsClient>,
}

impl<D: DatabaseService> AdjustmentBackfill<D> {
    pub fn new(db: D, client: Arc<AdjustmentsClient>) -> Self {
        Self { db, client }
    }
}

#[async_trait]
impl<D: DatabaseService> BackfillSource for AdjustmentBackfill<D> {
    type Unit = Vec<u64>;

    fn stream_key(&self) -> String {
        streams::ADJUSTMENTS.to_string()
    }

    async fn select_work(&self) -> Result<Vec<Vec<u64>>, BackfillError> {
        let slots = self.db.unadjusted_slots(ULTRASOUND_RELAY, MAX_WORK_PER_SELECT).await?;
        Ok(slots.chunks(SLOTS_PER_UNIT).map(|c| c.to_vec()).collect())
    }

    async fn process_unit(&self, slots: Vec<u64>) -> Result<(), BackfillError> {
        let total = slots.len();
        let fetches = join_all(slots.into_iter().map(|slot| self.client.fetch_for_slot(slot))).await;

        let mut adjustments = Vec::with_capacity(fetches.len());
        let mut failed = 0usize;
        for fetch in fetches {
            match fetch {
                Ok(adjustment) => adjustments.push(adjustment),
                // skipped slots stay unadjusted and are retried next run
                Err(err) => {
                    failed += 1;
                    warn!(%err, "adjustment fetch failed");
                }
            }
        }

        self.db.upsert_adjustments(&adjustments).await?;

        if failed == total {
            return Err(BackfillError::Unit(format!("all {total} adjustment fetches failed")));
        }
        Ok(())
    }
}
