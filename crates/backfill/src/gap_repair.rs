//! Targeted repair of relay collection gaps.
//!
//! Daily payload counts per relay are screened statistically; consolidated
//! outlier ranges are re-paged with slot-scoped pagination and any missing
//! rows are merged by upsert. Repair never moves the relay's checkpoint:
//! it fills holes inside already-covered history.

use std::sync::Arc;

use futures::future::join_all;
use mevscope_common::RelayPayload;
use mevscope_database::DatabaseService;
use mevscope_relays::{gaps::detect_gaps, GapRange, RelayClient};
use tracing::{info, warn};

use crate::driver::BackfillError;

const MAX_CONSECUTIVE_EMPTY: u32 = 2;

#[derive(Debug)]
pub struct GapRepairOutcome {
    pub gap: GapRange,
    pub result: Result<usize, BackfillError>,
}

pub struct RelayGapRepair<D> {
    db: D,
    clients: Vec<Arc<RelayClient>>,
}

impl<D: DatabaseService> RelayGapRepair<D> {
    pub fn new(db: D, clients: Vec<Arc<RelayClient>>) -> Self {
        Self { db, clients }
    }

    /// Screens every relay's history for outlier days.
    pub async fn detect(&self) -> Result<Vec<GapRange>, BackfillError> {
        let mut gaps = Vec::new();
        for client in &self.clients {
            let daily = self.db.relay_daily_counts(client.host()).await?;
            let relay_gaps = detect_gaps(client.host(), &daily);
            if !relay_gaps.is_empty() {
                warn!(
                    relay = client.host(),
                    gaps = relay_gaps.len(),
                    "relay has gap-suspect days"
                );
            }
            gaps.extend(relay_gaps);
        }
        Ok(gaps)
    }

    /// Detects and repairs every gap, isolating failures per gap.
    pub async fn repair_all(&self) -> Result<Vec<GapRepairOutcome>, BackfillError> {
        let gaps = self.detect().await?;

        let repairs = gaps.into_iter().map(|gap| async move {
            let result = self.repair_gap(&gap).await;
            if let Err(err) = &result {
                warn!(relay = %gap.relay, %err, "gap repair failed");
            }
            GapRepairOutcome { gap, result }
        });

        Ok(join_all(repairs).await)
    }

    /// Re-pages one relay over `[from_slot, to_slot]` and merges the rows.
    async fn repair_gap(&self, gap: &GapRange) -> Result<usize, BackfillError> {
        let client = self
            .clients
            .iter()
            .find(|c| c.host() == gap.relay)
            .ok_or_else(|| BackfillError::Unit(format!("no client for relay {}", gap.relay)))?;

        let mut cursor = gap.to_slot;
        let mut consecutive_empty = 0u32;
        let mut merged = 0usize;

        loop {
            let page = client.page(Some(cursor)).await?;

            if page.payloads.is_empty() {
                consecutive_empty += 1;
                if consecutive_empty >= MAX_CONSECUTIVE_EMPTY || cursor <= gap.from_slot {
                    break;
                }
                cursor = cursor.saturating_sub(mevscope_common::chain::SLOTS_PER_DAY).max(gap.from_slot);
                continue;
            }
            consecutive_empty = 0;

            let oldest = page.payloads.iter().map(|p| p.slot).min().expect("non-empty page");

            let in_range: Vec<RelayPayload> = page
                .payloads
                .into_iter()
                .filter(|p| gap.from_slot <= p.slot && p.slot <= gap.to_slot)
                .collect();
            merged += in_range.len();
            self.db.upsert_relay_payloads(&in_range).await?;

            if oldest <= gap.from_slot {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = next,
                None => break,
            }
        }

        info!(relay = %gap.relay, from = gap.from_slot, to = gap.to_slot, merged, "gap repaired");
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use mevscope_common::{
        chain::date_to_slot_range, RelayEntry, PAYLOADS_DELIVERED_PATH,
    };
    use mevscope_database::MockDatabaseService;

    use super::*;

    fn entry() -> RelayEntry {
        RelayEntry {
            host: "aestus.live",
            page_limit: 100,
            requests_per_sec: 10_000.0,
            burst: 10_000,
        }
    }

    fn stored_payload(slot: u64) -> RelayPayload {
        RelayPayload {
            relay: "aestus.live".to_string(),
            slot,
            block_number: Some(slot),
            parent_hash: Default::default(),
            block_hash: Default::default(),
            builder_pubkey: Default::default(),
            proposer_pubkey: Default::default(),
            proposer_fee_recipient: Default::default(),
            gas_limit: 30_000_000,
            gas_used: 0,
            value: alloy_primitives::U256::from(1u64),
            num_tx: 0,
        }
    }

    fn trace(slot: u64) -> String {
        format!(
            r#"{{"slot":"{slot}","parent_hash":"0x{h}","block_hash":"0x{h}",
               "builder_pubkey":"0x{pk}","proposer_pubkey":"0x{pk}",
               "proposer_fee_recipient":"0x{a}","gas_limit":"30000000",
               "gas_used":"0","value":"1","num_tx":"0","block_number":"{slot}"}}"#,
            h = "11".repeat(32),
            pk = "22".repeat(48),
            a = "33".repeat(20),
        )
    }

    async fn seeded_db() -> MockDatabaseService {
        let db = MockDatabaseService::new();

        // healthy day, broken day, healthy day
        let days = ["2023-09-01", "2023-09-02", "2023-09-03"];
        for (i, day) in days.iter().enumerate() {
            let (start, _) = date_to_slot_range(day.parse().unwrap());
            let count = if i == 1 { 2 } else { 100 };
            let rows: Vec<RelayPayload> =
                (0..count).map(|k| stored_payload(start + k as u64)).collect();
            db.upsert_relay_payloads(&rows).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn broken_day_is_detected() {
        let db = seeded_db().await;
        let client = Arc::new(RelayClient::with_base_url(entry(), "http://127.0.0.1:1").unwrap());
        let repair = RelayGapRepair::new(db, vec![client]);

        let gaps = repair.detect().await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].relay, "aestus.live");
        assert_eq!(gaps[0].dates, vec!["2023-09-02".parse().unwrap()]);
    }

    #[tokio::test]
    async fn repair_merges_missing_rows() {
        let db = seeded_db().await;
        let broken_day: chrono::NaiveDate = "2023-09-02".parse().unwrap();
        let (day_start, _) = date_to_slot_range(broken_day);

        // the relay actually has rows for the broken day
        let mut server = mockito::Server::new_async().await;
        let rows: Vec<String> = (day_start..day_start + 50).rev().map(trace).collect();
        let _mock = server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!("[{}]", rows.join(",")))
            .create_async()
            .await;

        let client = Arc::new(RelayClient::with_base_url(entry(), server.url()).unwrap());
        let repair = RelayGapRepair::new(db.clone(), vec![client]);

        let before = db.stored_relay_payloads().len();
        let outcomes = repair.repair_all().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(*outcomes[0].result.as_ref().unwrap(), 50);

        // 2 of the 50 were already stored
        assert_eq!(db.stored_relay_payloads().len(), before + 48);
    }
}
