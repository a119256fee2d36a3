//! Wire types for the market-data feed and catalog service.
//!
//! Feed messages carry prices and sizes as strings; they are parsed into
//! `Decimal` at the replica boundary so no float ever touches book state.

use serde::{Deserialize, Serialize};

/// Subscription message sent on connect.
#[derive(Debug, Serialize)]
pub struct SubscribeMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub assets_ids: Vec<String>,
}

impl SubscribeMessage {
    pub fn new(assets_ids: Vec<String>) -> Self {
        Self {
            msg_type: "market",
            assets_ids,
        }
    }
}

/// One `{price, size}` level as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsLevel {
    pub price: String,
    pub size: String,
}

/// Message envelope from the feed, tagged by `type`.
///
/// The server MAY batch messages as a JSON array; `WsEnvelope` accepts both
/// shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Full refresh of both sides for one asset.
    Book {
        asset_id: String,
        #[serde(default)]
        bids: Vec<WsLevel>,
        #[serde(default)]
        asks: Vec<WsLevel>,
    },
    /// Delta update for one price level.
    PriceChange {
        asset_id: String,
        side: String,
        price: String,
        size: String,
    },
    /// Server ping; echoed back.
    Ping,
    /// Server acknowledgement of our ping.
    Pong,
}

/// Single message or server-side batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WsEnvelope {
    One(WsMessage),
    Many(Vec<WsMessage>),
}

impl WsEnvelope {
    /// Flatten into a message list regardless of wire shape.
    pub fn into_messages(self) -> Vec<WsMessage> {
        match self {
            WsEnvelope::One(msg) => vec![msg],
            WsEnvelope::Many(msgs) => msgs,
        }
    }
}

/// Outcome token from the market catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketToken {
    pub token_id: String,
    /// "Yes" or "No".
    pub outcome: String,
}

/// Market descriptor from `GET /markets`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDescriptor {
    pub id: String,
    pub question: Option<String>,
    pub end_date_iso: Option<String>,
    pub volume: Option<f64>,
    #[serde(default)]
    pub tokens: Vec<MarketToken>,
}
