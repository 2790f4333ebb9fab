//! Per-relay payload backfill with two-phase resume.
//!
//! Each relay keeps one checkpoint: `cursor` is the historical low-water
//! slot, `last_processed_marker` the high-water slot. A run first pulls new
//! data (latest -> high water), then continues the historical walk (low
//! water -> target). Every page commits with its checkpoint advance in one
//! transaction. All relays run concurrently; outcomes are collected per
//! relay so one failure never cancels the others.

use std::sync::Arc;

use futures::future::join_all;
use mevscope_common::{streams, Checkpoint, RelayPayload};
use mevscope_database::DatabaseService;
use mevscope_relays::RelayClient;
use tracing::{info, warn};

use crate::driver::BackfillError;

/// Cursor jump when a relay returns empty pages over sparse history.
const EMPTY_PAGE_JUMP: u64 = 50_000;
const MAX_CONSECUTIVE_EMPTY: u32 = 2;

#[derive(Debug)]
pub struct RelayRunOutcome {
    pub relay: String,
    pub result: Result<usize, BackfillError>,
}

pub struct RelayPayloadBackfill<D> {
    db: D,
    clients: Vec<Arc<RelayClient>>,
    target_end_slot: u64,
}

impl<D: DatabaseService + 'static> RelayPayloadBackfill<D> {
    pub fn new(db: D, clients: Vec<Arc<RelayClient>>, target_end_slot: u64) -> Self {
        Self { db, clients, target_end_slot }
    }

    /// Backfills every relay down from `latest_slot`, isolating failures.
    pub async fn run(&self, latest_slot: u64) -> Vec<RelayRunOutcome> {
        let runs = self.clients.iter().map(|client| {
            let walker = RelayWalker {
                db: self.db.clone(),
                client: client.clone(),
                target_end_slot: self.target_end_slot,
            };
            async move {
                let relay = walker.client.host().to_string();
                let result = walker.backfill(latest_slot).await;
                if let Err(err) = &result {
                    warn!(relay = %relay, %err, "relay backfill failed");
                }
                RelayRunOutcome { relay, result }
            }
        });
        join_all(runs).await
    }
}

struct RelayWalker<D> {
    db: D,
    client: Arc<RelayClient>,
    target_end_slot: u64,
}

impl<D: DatabaseService> RelayWalker<D> {
    fn stream_key(&self) -> String {
        streams::relay_payloads(self.client.host())
    }

    async fn backfill(&self, latest_slot: u64) -> Result<usize, BackfillError> {
        let checkpoint = self.db.get_checkpoint(&self.stream_key()).await?;

        let resumed = checkpoint
            .as_ref()
            .and_then(|cp| Some((cp.cursor? as u64, cp.last_processed_marker? as u64)));

        let mut total = 0;
        match resumed {
            Some((mut low, mut high)) => {
                // phase 1: new payloads since the last run
                if high < latest_slot {
                    total += self
                        .walk(latest_slot, high, Phase::New, &mut low, &mut high)
                        .await?;
                }
                // phase 2: continue the historical walk
                if low > self.target_end_slot {
                    total += self
                        .walk(low, self.target_end_slot, Phase::Historical, &mut low, &mut high)
                        .await?;
                }
            }
            None => {
                // first run: everything is historical
                let (mut low, mut high) = (latest_slot, self.target_end_slot);
                total += self
                    .walk(latest_slot, self.target_end_slot, Phase::Historical, &mut low, &mut high)
                    .await?;
            }
        }

        info!(relay = self.client.host(), rows = total, "relay backfill finished");
        Ok(total)
    }

    /// Pages newest-to-oldest from `start` until the oldest slot in a page
    /// reaches `stop_slot`. The checkpoint advances with every committed
    /// page.
    async fn walk(
        &self,
        start: u64,
        stop_slot: u64,
        phase: Phase,
        low: &mut u64,
        high: &mut u64,
    ) -> Result<usize, BackfillError> {
        let mut cursor = start;
        let mut consecutive_empty = 0u32;
        let mut total = 0usize;

        loop {
            let page = self.client.page(Some(cursor)).await?;

            if page.payloads.is_empty() {
                consecutive_empty += 1;
                if consecutive_empty >= MAX_CONSECUTIVE_EMPTY || cursor <= stop_slot {
                    break;
                }
                // probe further back; sparse relays have long silent spans
                cursor = cursor.saturating_sub(EMPTY_PAGE_JUMP).max(stop_slot);
                continue;
            }
            consecutive_empty = 0;

            let oldest = page.payloads.iter().map(|p| p.slot).min().expect("non-empty page");
            let newest = page.payloads.iter().map(|p| p.slot).max().expect("non-empty page");

            // phase 1 only takes rows above the old high water; everything
            // below is already committed
            let rows: Vec<RelayPayload> = match phase {
                Phase::New => {
                    page.payloads.into_iter().filter(|p| p.slot > stop_slot).collect()
                }
                Phase::Historical => page.payloads,
            };

            match phase {
                Phase::New => *high = (*high).max(newest),
                Phase::Historical => {
                    *low = (*low).min(oldest);
                    *high = (*high).max(newest);
                }
            }

            let checkpoint = Checkpoint {
                stream_key: self.stream_key(),
                cursor: Some(*low as i64),
                last_processed_marker: Some(*high as i64),
                completed: *low <= self.target_end_slot,
            };
            self.db.upsert_relay_payloads_with_checkpoint(&rows, &checkpoint).await?;
            total += rows.len();

            if oldest <= stop_slot {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = next,
                None => break,
            }
        }

        Ok(total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Historical,
}

#[cfg(test)]
mod tests {
    use mevscope_common::{RelayEntry, PAYLOADS_DELIVERED_PATH};
    use mevscope_database::MockDatabaseService;

    use super::*;

    fn entry() -> RelayEntry {
        RelayEntry {
            host: "boost-relay.flashbots.net",
            page_limit: 200,
            requests_per_sec: 10_000.0,
            burst: 10_000,
        }
    }

    fn trace(slot: u64) -> String {
        format!(
            r#"{{"slot":"{slot}","parent_hash":"0x{h}","block_hash":"0x{h}",
               "builder_pubkey":"0x{pk}","proposer_pubkey":"0x{pk}",
               "proposer_fee_recipient":"0x{a}","gas_limit":"30000000",
               "gas_used":"15000000","value":"1000000000000000","num_tx":"10",
               "block_number":"{bn}"}}"#,
            h = "11".repeat(32),
            pk = "22".repeat(48),
            a = "33".repeat(20),
            bn = slot - 1_000_000,
        )
    }

    fn stored_payload(slot: u64) -> RelayPayload {
        RelayPayload {
            relay: "boost-relay.flashbots.net".to_string(),
            slot,
            block_number: Some(slot - 1_000_000),
            parent_hash: Default::default(),
            block_hash: Default::default(),
            builder_pubkey: Default::default(),
            proposer_pubkey: Default::default(),
            proposer_fee_recipient: Default::default(),
            gas_limit: 30_000_000,
            gas_used: 15_000_000,
            value: alloy_primitives::U256::from(1u64),
            num_tx: 10,
        }
    }

    /// Resume semantics: with the checkpoint at slot S and rows >= S already
    /// committed, a page spanning S+2 down to S-100 only inserts rows above
    /// S, and the marker advances to the newest slot seen.
    #[tokio::test]
    async fn resume_only_inserts_rows_above_the_high_water() {
        const S: u64 = 7_400_000;

        let mut server = mockito::Server::new_async().await;
        let rows: Vec<String> = (S - 100..=S + 2).rev().map(trace).collect();
        let _mock = server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!("[{}]", rows.join(",")))
            .create_async()
            .await;

        let db = MockDatabaseService::new();
        db.upsert_relay_payloads(&[stored_payload(S), stored_payload(S + 1_000)]).await.unwrap();
        db.save_checkpoint(&Checkpoint {
            stream_key: streams::relay_payloads("boost-relay.flashbots.net"),
            cursor: Some(0),
            last_processed_marker: Some(S as i64),
            completed: true,
        })
        .await
        .unwrap();

        let client =
            Arc::new(RelayClient::with_base_url(entry(), server.url()).unwrap());
        let backfill = RelayPayloadBackfill::new(db.clone(), vec![client], 0);

        let outcomes = backfill.run(S + 2).await;
        assert_eq!(outcomes.len(), 1);
        // rows above S: S+1, S+2
        assert_eq!(*outcomes[0].result.as_ref().unwrap(), 2);

        let stored = db.stored_relay_payloads();
        assert!(stored.iter().all(|p| p.slot >= S));

        let checkpoint = db
            .get_checkpoint(&streams::relay_payloads("boost-relay.flashbots.net"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_processed_marker, Some((S + 2) as i64));
        assert_eq!(checkpoint.cursor, Some(0));
    }

    /// Checkpoint monotonicity: markers only move up, the historical cursor
    /// only moves down.
    #[tokio::test]
    async fn checkpoint_markers_are_monotonic() {
        const S: u64 = 7_500_000;

        let mut server = mockito::Server::new_async().await;
        let rows: Vec<String> = (S - 50..=S).rev().map(trace).collect();
        let _mock = server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!("[{}]", rows.join(",")))
            .create_async()
            .await;

        let db = MockDatabaseService::new();
        let stream_key = streams::relay_payloads("boost-relay.flashbots.net");
        db.save_checkpoint(&Checkpoint {
            stream_key: stream_key.clone(),
            cursor: Some((S - 10) as i64),
            last_processed_marker: Some((S - 10) as i64),
            completed: false,
        })
        .await
        .unwrap();

        let client =
            Arc::new(RelayClient::with_base_url(entry(), server.url()).unwrap());
        let backfill = RelayPayloadBackfill::new(db.clone(), vec![client], S - 50);

        backfill.run(S).await;

        let checkpoint = db.get_checkpoint(&stream_key).await.unwrap().unwrap();
        assert!(checkpoint.last_processed_marker.unwrap() >= (S - 10) as i64);
        assert!(checkpoint.cursor.unwrap() <= (S - 10) as i64);
        assert_eq!(checkpoint.last_processed_marker, Some(S as i64));
        assert_eq!(checkpoint.cursor, Some((S - 50) as i64));
    }

    /// One relay failing on every page must not block another relay's rows.
    #[tokio::test]
    async fn failing_relay_does_not_block_others() {
        const S: u64 = 7_600_000;

        let mut good_server = mockito::Server::new_async().await;
        let rows: Vec<String> = (S - 5..=S).rev().map(trace).collect();
        let _good = good_server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!("[{}]", rows.join(",")))
            .create_async()
            .await;

        let mut bad_server = mockito::Server::new_async().await;
        let _bad = bad_server
            .mock("GET", PAYLOADS_DELIVERED_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("not json at all")
            .create_async()
            .await;

        let bad_entry = RelayEntry {
            host: "titanrelay.xyz",
            page_limit: 100,
            requests_per_sec: 10_000.0,
            burst: 10_000,
        };

        let db = MockDatabaseService::new();
        let clients = vec![
            Arc::new(RelayClient::with_base_url(entry(), good_server.url()).unwrap()),
            Arc::new(RelayClient::with_base_url(bad_entry, bad_server.url()).unwrap()),
        ];
        let backfill = RelayPayloadBackfill::new(db.clone(), clients, S - 5);

        let outcomes = backfill.run(S).await;

        let good = outcomes.iter().find(|o| o.relay == "boost-relay.flashbots.net").unwrap();
        let bad = outcomes.iter().find(|o| o.relay == "titanrelay.xyz").unwrap();
        assert!(good.result.is_ok());
        assert!(bad.result.is_err());

        // the healthy relay's rows are committed regardless
        assert_eq!(db.stored_relay_payloads().len(), 6);
    }
}
