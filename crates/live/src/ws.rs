//! WebSocket head subscriber.
//!
//! Connects to the node's websocket endpoint, subscribes to `newHeads` and
//! feeds headers into the bounded head queue. Reconnects with exponential
//! backoff on any disconnect; the backoff resets after a successful
//! subscription. A ping goes out every `ping_interval`; a ping that is still
//! unanswered at the next tick counts as a dead connection.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mevscope_common::metrics::{HEADS_RECEIVED, WS_CONNECTED};
use mevscope_rpc::ExecutionHeader;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Reader lifecycle. `Shutdown` is terminal from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Init,
    Connecting,
    Subscribed,
    Disconnected,
    Shutdown,
}

pub struct HeadSubscriber {
    url: Url,
    ping_interval: Duration,
    max_backoff: Duration,
    state: ReaderState,
}

impl HeadSubscriber {
    pub fn new(url: Url, ping_interval: Duration) -> Self {
        Self { url, ping_interval, max_backoff: Duration::from_secs(60), state: ReaderState::Init }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Runs until shutdown. Heads are delivered in order through
    /// `heads_tx`; a full queue blocks the reader (backpressure, no drops).
    pub async fn run(
        mut self,
        heads_tx: mpsc::Sender<ExecutionHeader>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Duration::from_secs(1);

        while !*shutdown.borrow() {
            self.state = ReaderState::Connecting;
            info!(url = %self.url, "connecting to websocket");

            match self.connect_and_stream(&heads_tx, &mut shutdown, &mut backoff).await {
                Ok(()) => break, // clean shutdown
                Err(err) => {
                    self.state = ReaderState::Disconnected;
                    WS_CONNECTED.set(0);
                    warn!(%err, ?backoff, "websocket disconnected, reconnecting");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }

        self.state = ReaderState::Shutdown;
        WS_CONNECTED.set(0);
        info!("head subscriber stopped");
    }

    async fn connect_and_stream(
        &mut self,
        heads_tx: &mpsc::Sender<ExecutionHeader>,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> Result<(), WsError> {
        let (mut socket, _) = connect_async(self.url.as_str()).await?;

        let subscribe = json!({
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"],
        });
        socket.send(Message::Text(subscribe.to_string())).await?;

        // wait for the subscription confirmation
        let subscription_id = loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => match parse_subscription_ack(&text) {
                    Some(id) => break id,
                    None => return Err(WsError::SubscriptionRejected(text)),
                },
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(WsError::Closed),
            }
        };

        info!(%subscription_id, "subscribed to newHeads");
        self.state = ReaderState::Subscribed;
        WS_CONNECTED.set(1);
        *backoff = Duration::from_secs(1);

        let mut ping_timer = tokio::time::interval(self.ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.reset();
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = socket.close(None).await;
                    return Ok(());
                }

                _ = ping_timer.tick() => {
                    if awaiting_pong {
                        return Err(WsError::HeartbeatMissed);
                    }
                    awaiting_pong = true;
                    socket.send(Message::Ping(Vec::new())).await?;
                }

                message = socket.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(header) = parse_head_notification(&text) {
                            HEADS_RECEIVED.with_label_values(&[]).inc();
                            debug!(number = header.number(), "new head");
                            if heads_tx.send(header).await.is_err() {
                                return Ok(()); // coordinator gone
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Ping(payload))) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        error!(?frame, "websocket closed by peer");
                        return Err(WsError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(WsError::Closed),
                },
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WsError {
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),
    #[error("connection closed")]
    Closed,
    #[error("heartbeat missed")]
    HeartbeatMissed,
}

#[derive(Debug, Deserialize)]
struct AckMessage {
    #[serde(default)]
    result: Option<serde_json::Value>,
}

/// Subscription id from the `eth_subscribe` response.
fn parse_subscription_ack(text: &str) -> Option<String> {
    let ack: AckMessage = serde_json::from_str(text).ok()?;
    match ack.result? {
        serde_json::Value::String(id) => Some(id),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct NotificationMessage {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<NotificationParams>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    result: serde_json::Value,
}

/// Header carried by an `eth_subscription` notification, if `text` is one.
fn parse_head_notification(text: &str) -> Option<ExecutionHeader> {
    let message: NotificationMessage = serde_json::from_str(text).ok()?;
    if message.method.as_deref() != Some("eth_subscription") {
        return None;
    }
    match serde_json::from_value(message.params?.result) {
        Ok(header) => Some(header),
        Err(err) => {
            error!(%err, "undecodable head notification");
            None
        }
    }
}
