//! Order book replica state.
//!
//! Mirrors best prices and aggregated liquidity for a single asset, fed by
//! snapshot and delta events from the market-data stream. Both sides are
//! ordered maps so best-price reads are O(1) and updates O(log n).
//!
//! Invariants:
//! - `best_bid < best_ask` whenever both sides are non-empty
//! - every stored level has strictly positive size; size zero deletes

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use swarm_common::PriceLevel;

/// Which side of the book a delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    /// Parse the feed's side tag. Accepts the buy/sell aliases some venues
    /// send on trade-derived deltas.
    pub fn parse(s: &str) -> Option<BookSide> {
        match s.to_ascii_lowercase().as_str() {
            "bid" | "buy" => Some(BookSide::Bid),
            "ask" | "sell" => Some(BookSide::Ask),
            _ => None,
        }
    }
}

/// In-memory replica of one asset's order book.
#[derive(Debug, Clone, Default)]
pub struct OrderBookReplica {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    /// Timestamp of the last applied event.
    pub last_update: Option<DateTime<Utc>>,
}

impl OrderBookReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both sides atomically from a full snapshot.
    ///
    /// Levels with non-positive size are skipped rather than stored.
    pub fn apply_snapshot(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            if level.size > Decimal::ZERO {
                self.bids.insert(level.price, level.size);
            }
        }
        for level in asks {
            if level.size > Decimal::ZERO {
                self.asks.insert(level.price, level.size);
            }
        }
        self.last_update = Some(Utc::now());
    }

    /// Apply a single delta. Size zero removes the level; removal of an
    /// absent level is a no-op.
    pub fn apply_delta(&mut self, side: BookSide, price: Decimal, size: Decimal) {
        let book = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if size > Decimal::ZERO {
            book.insert(price, size);
        } else {
            book.remove(&price);
        }
        self.last_update = Some(Utc::now());
    }

    /// Best bid price and aggregated size, if the side is non-empty.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(p, s)| PriceLevel::new(*p, *s))
    }

    /// Best ask price and aggregated size, if the side is non-empty.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(p, s)| PriceLevel::new(*p, *s))
    }

    /// Mid price, defined only when both sides are non-empty.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// First `n` levels per side, best-first, for diagnostic snapshots.
    pub fn depth(&self, n: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, s)| PriceLevel::new(*p, *s))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(p, s)| PriceLevel::new(*p, *s))
            .collect();
        (bids, asks)
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
