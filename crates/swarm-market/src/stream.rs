//! Market-data WebSocket stream.
//!
//! Maintains one connection carrying up to `max_assets` subscriptions,
//! dispatches `book` snapshots and `price_change` deltas into the shared
//! replica map, and emits `StreamEvent`s for downstream consumers.
//!
//! ## Lifecycle
//!
//! `IDLE -> CONNECTING -> SUBSCRIBED -> { STREAMING <-> RESYNCING } -> CLOSED`
//!
//! After every (re)connect the stream is in resync: each subscribed asset
//! must receive a fresh `book` snapshot before deltas for it are applied.
//! Deltas arriving for an asset still awaiting its snapshot are discarded.
//!
//! Keep-alive: a `{"type":"ping"}` is sent every `ping_interval`; if nothing
//! is received within two intervals the connection is torn down and
//! reconnected with exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, info, warn};

use swarm_common::PriceLevel;

use crate::orderbook::{BookSide, OrderBookReplica};
use crate::types::{SubscribeMessage, WsEnvelope, WsLevel, WsMessage};

/// Shared map of asset ID to its order-book replica.
pub type ReplicaMap = Arc<DashMap<String, OrderBookReplica>>;

/// Errors from the market-data stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("no pong within two ping intervals")]
    PongTimeout,

    #[error("stream ended unexpectedly")]
    StreamEnded,

    #[error("event channel closed")]
    ChannelClosed,

    #[error("too many assets: requested {requested}, max {max}")]
    TooManyAssets { requested: usize, max: usize },
}

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Subscribed,
    Streaming,
    Resyncing,
    Closed,
}

/// Events emitted to the consumer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Connection established and subscription sent.
    Connected,
    /// Connection lost; the stream will reconnect.
    Disconnected { reason: String },
    /// A full snapshot was applied to the asset's replica.
    SnapshotApplied { asset_id: String },
    /// A delta was applied to the asset's replica.
    DeltaApplied { asset_id: String },
    /// A malformed message forced a connection reset.
    ProtocolViolation { detail: String },
}

/// Configuration for the market-data stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Keep-alive ping cadence.
    pub ping_interval: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Initial reconnect delay.
    pub reconnect_base: Duration,
    /// Maximum reconnect delay.
    pub reconnect_max: Duration,
    /// Maximum assets on one connection.
    pub max_assets: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ping_interval: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            max_assets: 500,
        }
    }
}

/// Connection-independent stream state: the subscription set, the replica
/// map, and the resync bookkeeping. Split out from the socket loop so the
/// message handling is testable without a server.
#[derive(Debug)]
pub struct StreamCore {
    books: ReplicaMap,
    subscribed: HashSet<String>,
    awaiting_snapshot: HashSet<String>,
    state: StreamState,
    max_assets: usize,
    /// Deltas discarded while the asset was awaiting a snapshot.
    pub discarded_deltas: u64,
}

/// Result of handling one inbound text frame.
#[derive(Debug, Default)]
pub struct HandleOutcome {
    pub events: Vec<StreamEvent>,
    /// A server ping was seen and must be echoed.
    pub echo_ping: bool,
}

impl StreamCore {
    pub fn new(books: ReplicaMap, max_assets: usize) -> Self {
        Self {
            books,
            subscribed: HashSet::new(),
            awaiting_snapshot: HashSet::new(),
            state: StreamState::Idle,
            max_assets,
            discarded_deltas: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn subscribed_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.subscribed.iter().cloned().collect();
        assets.sort();
        assets
    }

    /// Add assets to the watched set.
    pub fn subscribe_assets<I: IntoIterator<Item = String>>(
        &mut self,
        assets: I,
    ) -> Result<(), StreamError> {
        let mut next = self.subscribed.clone();
        next.extend(assets);
        if next.len() > self.max_assets {
            return Err(StreamError::TooManyAssets {
                requested: next.len(),
                max: self.max_assets,
            });
        }
        self.subscribed = next;
        Ok(())
    }

    /// Drop an asset and destroy its replica.
    pub fn unsubscribe_asset(&mut self, asset_id: &str) {
        self.subscribed.remove(asset_id);
        self.awaiting_snapshot.remove(asset_id);
        self.books.remove(asset_id);
    }

    /// Enter resync: every subscribed asset must see a fresh snapshot
    /// before its deltas are applied again.
    pub fn begin_resync(&mut self) {
        self.awaiting_snapshot = self.subscribed.clone();
        self.state = if self.awaiting_snapshot.is_empty() {
            StreamState::Streaming
        } else {
            StreamState::Resyncing
        };
    }

    pub fn mark_connecting(&mut self) {
        self.state = StreamState::Connecting;
    }

    pub fn mark_subscribed(&mut self) {
        self.state = StreamState::Subscribed;
    }

    pub fn mark_closed(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Handle one inbound text frame (single message or batch).
    pub fn handle_text(&mut self, text: &str) -> Result<HandleOutcome, StreamError> {
        let envelope: WsEnvelope = serde_json::from_str(text)
            .map_err(|e| StreamError::Protocol(format!("unparseable frame: {e}")))?;
        let mut outcome = HandleOutcome::default();
        for msg in envelope.into_messages() {
            match msg {
                WsMessage::Book { asset_id, bids, asks } => {
                    if let Some(event) = self.apply_book(&asset_id, &bids, &asks)? {
                        outcome.events.push(event);
                    }
                }
                WsMessage::PriceChange { asset_id, side, price, size } => {
                    if let Some(event) = self.apply_price_change(&asset_id, &side, &price, &size)? {
                        outcome.events.push(event);
                    }
                }
                WsMessage::Ping => outcome.echo_ping = true,
                WsMessage::Pong => {}
            }
        }
        Ok(outcome)
    }

    fn apply_book(
        &mut self,
        asset_id: &str,
        bids: &[WsLevel],
        asks: &[WsLevel],
    ) -> Result<Option<StreamEvent>, StreamError> {
        if !self.subscribed.contains(asset_id) {
            debug!(asset_id, "book for unsubscribed asset ignored");
            return Ok(None);
        }
        let bids = parse_levels(bids)?;
        let asks = parse_levels(asks)?;
        self.books
            .entry(asset_id.to_string())
            .or_default()
            .apply_snapshot(&bids, &asks);
        self.awaiting_snapshot.remove(asset_id);
        if self.awaiting_snapshot.is_empty() {
            self.state = StreamState::Streaming;
        }
        Ok(Some(StreamEvent::SnapshotApplied {
            asset_id: asset_id.to_string(),
        }))
    }

    fn apply_price_change(
        &mut self,
        asset_id: &str,
        side: &str,
        price: &str,
        size: &str,
    ) -> Result<Option<StreamEvent>, StreamError> {
        if !self.subscribed.contains(asset_id) {
            return Ok(None);
        }
        if self.awaiting_snapshot.contains(asset_id) {
            self.discarded_deltas += 1;
            debug!(asset_id, "delta discarded during resync");
            return Ok(None);
        }
        let side = BookSide::parse(side)
            .ok_or_else(|| StreamError::Protocol(format!("unknown side {side:?}")))?;
        let price: Decimal = price
            .parse()
            .map_err(|_| StreamError::Protocol(format!("bad price {price:?}")))?;
        let size: Decimal = size
            .parse()
            .map_err(|_| StreamError::Protocol(format!("bad size {size:?}")))?;
        match self.books.get_mut(asset_id) {
            Some(mut replica) => replica.apply_delta(side, price, size),
            // Delta before any snapshot: the replica does not exist yet and
            // the asset must be waiting for one. Treat as discard.
            None => {
                self.discarded_deltas += 1;
                return Ok(None);
            }
        }
        Ok(Some(StreamEvent::DeltaApplied {
            asset_id: asset_id.to_string(),
        }))
    }
}

fn parse_levels(levels: &[WsLevel]) -> Result<Vec<PriceLevel>, StreamError> {
    levels
        .iter()
        .map(|l| {
            let price: Decimal = l
                .price
                .parse()
                .map_err(|_| StreamError::Protocol(format!("bad price {:?}", l.price)))?;
            let size: Decimal = l
                .size
                .parse()
                .map_err(|_| StreamError::Protocol(format!("bad size {:?}", l.size)))?;
            Ok(PriceLevel::new(price, size))
        })
        .collect()
}

/// WebSocket client feeding the replica map.
pub struct MarketDataStream {
    config: StreamConfig,
    core: StreamCore,
    event_tx: mpsc::Sender<StreamEvent>,
}

impl MarketDataStream {
    /// Create a stream watching `assets`. Returns the stream, the shared
    /// replica map, and the event receiver.
    pub fn new(
        config: StreamConfig,
        assets: Vec<String>,
    ) -> Result<(Self, ReplicaMap, mpsc::Receiver<StreamEvent>), StreamError> {
        let books: ReplicaMap = Arc::new(DashMap::new());
        let mut core = StreamCore::new(books.clone(), config.max_assets);
        core.subscribe_assets(assets)?;
        let (event_tx, event_rx) = mpsc::channel(1024);
        Ok((
            Self {
                config,
                core,
                event_tx,
            },
            books,
            event_rx,
        ))
    }

    /// Run until shutdown. Reconnects with exponential backoff on any
    /// connection failure; a clean shutdown resolves `Ok`.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), StreamError> {
        let mut delay = self.config.reconnect_base;
        loop {
            self.core.mark_connecting();
            match self.connect_and_stream(&mut shutdown, &mut delay).await {
                Ok(()) => {
                    info!("market data stream closed");
                    self.core.mark_closed();
                    return Ok(());
                }
                Err(StreamError::ChannelClosed) => {
                    self.core.mark_closed();
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, reconnect_in = ?delay, "stream disconnected");
                    if matches!(e, StreamError::Protocol(_)) {
                        self.emit(StreamEvent::ProtocolViolation {
                            detail: e.to_string(),
                        })
                        .await?;
                    }
                    self.emit(StreamEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await?;
                    tokio::select! {
                        _ = shutdown.recv() => {
                            self.core.mark_closed();
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.config.reconnect_max);
                }
            }
        }
    }

    async fn emit(&self, event: StreamEvent) -> Result<(), StreamError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    async fn connect_and_stream(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
        delay: &mut Duration,
    ) -> Result<(), StreamError> {
        let connect = timeout(
            self.config.connect_timeout,
            connect_async(self.config.url.as_str()),
        )
        .await
        .map_err(|_| StreamError::ConnectTimeout)?;
        let (ws, _) = connect.map_err(StreamError::WebSocket)?;
        let (mut sink, mut source) = ws.split();

        let subscribe = SubscribeMessage::new(self.core.subscribed_assets());
        sink.send(Message::Text(serde_json::to_string(&subscribe)?))
            .await?;
        self.core.mark_subscribed();
        self.core.begin_resync();
        *delay = self.config.reconnect_base;
        info!(
            assets = self.core.subscribed_assets().len(),
            "subscribed to market data feed"
        );
        self.emit(StreamEvent::Connected).await?;

        let mut ping = interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.reset();
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    if last_rx.elapsed() > self.config.ping_interval * 2 {
                        return Err(StreamError::PongTimeout);
                    }
                    sink.send(Message::Text("{\"type\":\"ping\"}".to_string())).await?;
                }
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_rx = Instant::now();
                        let outcome = self.core.handle_text(&text)?;
                        if outcome.echo_ping {
                            sink.send(Message::Text("{\"type\":\"ping\"}".to_string())).await?;
                        }
                        for event in outcome.events {
                            self.emit(event).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_rx = Instant::now();
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {
                        last_rx = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(StreamError::StreamEnded),
                    Some(Err(e)) => return Err(StreamError::WebSocket(e)),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn core_with(assets: &[&str]) -> StreamCore {
        let books: ReplicaMap = Arc::new(DashMap::new());
        let mut core = StreamCore::new(books, 500);
        core.subscribe_assets(assets.iter().map(|s| s.to_string()))
            .unwrap();
        core
    }

    fn book_frame(asset: &str, bid: &str, ask: &str) -> String {
        format!(
            r#"{{"type":"book","asset_id":"{asset}","bids":[{{"price":"{bid}","size":"100"}}],"asks":[{{"price":"{ask}","size":"100"}}]}}"#
        )
    }

    fn delta_frame(asset: &str, side: &str, price: &str, size: &str) -> String {
        format!(
            r#"{{"type":"price_change","asset_id":"{asset}","side":"{side}","price":"{price}","size":"{size}"}}"#
        )
    }

    #[test]
    fn snapshot_then_delta_streams() {
        let mut core = core_with(&["tok"]);
        core.begin_resync();
        assert_eq!(core.state(), StreamState::Resyncing);

        let outcome = core.handle_text(&book_frame("tok", "0.47", "0.49")).unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(core.state(), StreamState::Streaming);

        let outcome = core
            .handle_text(&delta_frame("tok", "bid", "0.48", "50"))
            .unwrap();
        assert_eq!(outcome.events.len(), 1);

        let book = core.books.get("tok").unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(0.48));
    }

    // Deltas injected while an asset awaits its post-reconnect snapshot are
    // discarded; the fresh snapshot is authoritative.
    #[test]
    fn resync_discards_deltas_until_snapshot() {
        let mut core = core_with(&["tok"]);
        core.begin_resync();
        core.handle_text(&book_frame("tok", "0.47", "0.49")).unwrap();

        // Connection drops; resync starts again.
        core.begin_resync();
        assert_eq!(core.state(), StreamState::Resyncing);

        let outcome = core
            .handle_text(&delta_frame("tok", "bid", "0.10", "999"))
            .unwrap();
        assert!(outcome.events.is_empty());
        let outcome = core
            .handle_text(&delta_frame("tok", "ask", "0.90", "999"))
            .unwrap();
        assert!(outcome.events.is_empty());
        assert_eq!(core.discarded_deltas, 2);

        core.handle_text(&book_frame("tok", "0.45", "0.51")).unwrap();
        assert_eq!(core.state(), StreamState::Streaming);

        let book = core.books.get("tok").unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(0.45));
        assert_eq!(book.best_ask().unwrap().price, dec!(0.51));
        assert_eq!(book.bid_levels(), 1);
        assert_eq!(book.ask_levels(), 1);
    }

    #[test]
    fn resync_waits_for_every_asset() {
        let mut core = core_with(&["a", "b"]);
        core.begin_resync();
        core.handle_text(&book_frame("a", "0.40", "0.60")).unwrap();
        assert_eq!(core.state(), StreamState::Resyncing);
        core.handle_text(&book_frame("b", "0.30", "0.70")).unwrap();
        assert_eq!(core.state(), StreamState::Streaming);
    }

    #[test]
    fn unsubscribed_asset_ignored() {
        let mut core = core_with(&["tok"]);
        core.begin_resync();
        let outcome = core.handle_text(&book_frame("other", "0.4", "0.6")).unwrap();
        assert!(outcome.events.is_empty());
        assert!(core.books.get("other").is_none());
    }

    #[test]
    fn unsubscribe_destroys_replica() {
        let mut core = core_with(&["tok"]);
        core.begin_resync();
        core.handle_text(&book_frame("tok", "0.47", "0.49")).unwrap();
        assert!(core.books.get("tok").is_some());
        core.unsubscribe_asset("tok");
        assert!(core.books.get("tok").is_none());
    }

    #[test]
    fn server_ping_is_echoed() {
        let mut core = core_with(&["tok"]);
        let outcome = core.handle_text(r#"{"type":"ping"}"#).unwrap();
        assert!(outcome.echo_ping);
    }

    #[test]
    fn batched_frames_handled_in_order() {
        let mut core = core_with(&["tok"]);
        core.begin_resync();
        let frame = format!(
            "[{},{}]",
            book_frame("tok", "0.47", "0.49"),
            delta_frame("tok", "bid", "0.48", "10")
        );
        let outcome = core.handle_text(&frame).unwrap();
        assert_eq!(outcome.events.len(), 2);
        let book = core.books.get("tok").unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(0.48));
    }

    #[test]
    fn malformed_frame_is_protocol_error() {
        let mut core = core_with(&["tok"]);
        assert!(matches!(
            core.handle_text("not json"),
            Err(StreamError::Protocol(_))
        ));
        let bad_price = delta_frame("tok", "bid", "abc", "10");
        core.begin_resync();
        core.handle_text(&book_frame("tok", "0.47", "0.49")).unwrap();
        assert!(matches!(
            core.handle_text(&bad_price),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn asset_cap_enforced() {
        let books: ReplicaMap = Arc::new(DashMap::new());
        let mut core = StreamCore::new(books, 2);
        let result = core.subscribe_assets(vec!["a".into(), "b".into(), "c".into()]);
        assert!(matches!(result, Err(StreamError::TooManyAssets { .. })));
    }
}
