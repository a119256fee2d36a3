//! Market-facing plumbing for the swarm trading system.
//!
//! - `orderbook`: in-memory replica of one asset's order book
//! - `stream`: WebSocket client feeding replicas from delta updates
//! - `catalog`: HTTP client for the market catalog service
//! - `types`: wire types for the feed and catalog

pub mod catalog;
pub mod orderbook;
pub mod stream;
pub mod types;

pub use catalog::{CatalogClient, CatalogConfig, CatalogError};
pub use orderbook::{BookSide, OrderBookReplica};
pub use stream::{
    MarketDataStream, ReplicaMap, StreamConfig, StreamCore, StreamError, StreamEvent, StreamState,
};
pub use types::{MarketDescriptor, MarketToken, WsEnvelope, WsLevel, WsMessage};
