//! Signal records carried on the bus.
//!
//! A `Signal` is an immutable record carrying one datum from a producing
//! agent to zero or more consumers. Scores and confidences are advisory
//! analytics and use `f64`; anything denominated in money stays `Decimal`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use swarm_common::{PriceLevel, Side};

/// Delivery priority. LOW signals may be shed under back-pressure; HIGH and
/// CRITICAL never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl SignalPriority {
    /// Numeric priority value.
    pub fn value(&self) -> u8 {
        match self {
            SignalPriority::Low => 25,
            SignalPriority::Medium => 50,
            SignalPriority::High => 75,
            SignalPriority::Critical => 100,
        }
    }
}

/// Closed set of signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    GlobalSentiment,
    HotToken,
    WhaleMove,
    NewsEvent,
    MarketOpportunity,
    RiskAlert,
    PositionUpdate,
    MarketState,
}

impl SignalKind {
    /// All kinds, for iterating histories.
    pub const ALL: [SignalKind; 8] = [
        SignalKind::GlobalSentiment,
        SignalKind::HotToken,
        SignalKind::WhaleMove,
        SignalKind::NewsEvent,
        SignalKind::MarketOpportunity,
        SignalKind::RiskAlert,
        SignalKind::PositionUpdate,
        SignalKind::MarketState,
    ];
}

/// Market-wide sentiment summary from the news pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSentiment {
    /// Aggregate sentiment in [-1, 1].
    pub score: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub dominant_topic: String,
    pub top_entities: Vec<String>,
    pub news_count_last_hour: u32,
}

/// Why a token is hot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotReason {
    WhaleBuy,
    NewsSpike,
    StatArb,
}

/// A token with unusual activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotToken {
    pub token_id: String,
    pub market_id: String,
    pub market_name: String,
    pub volume_1h: Decimal,
    pub velocity_per_min: f64,
    pub volatility: f64,
    pub reason: HotReason,
}

/// A large wallet's trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleMove {
    pub wallet_id: String,
    pub wallet_label: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub usd_amount: Decimal,
    pub price: Decimal,
    /// Underlying entity (e.g. "Bitcoin").
    pub entity: String,
}

/// News impact classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsImpact {
    Low,
    Medium,
    High,
}

/// A scored news item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsEvent {
    pub headline: String,
    pub entities: Vec<String>,
    /// Sentiment in [-1, 1].
    pub sentiment: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub impact: NewsImpact,
    pub source: String,
    pub related_markets: Vec<String>,
}

/// Kind of opportunity advertised on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    PureArb,
    StatArb,
    NewsArb,
}

/// A tradable opportunity, possibly claimed by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOpportunity {
    pub opportunity_id: String,
    pub opp_kind: OpportunityKind,
    pub market_ids: Vec<String>,
    pub token_ids: Vec<String>,
    pub expected_profit_usd: Decimal,
    pub confidence: f64,
    /// Set when an agent owns the opportunity.
    pub claimed_by: Option<String>,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Warning,
    High,
    Critical,
}

/// Alert scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertScope {
    Agent,
    Portfolio,
}

/// Risk alert published by the risk controller or an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    pub severity: AlertSeverity,
    pub scope: AlertScope,
    pub reason: String,
}

/// Position change published by an agent after processing a fill (or a
/// denial, with `size` zero and the reason in `note`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub agent: String,
    pub token_id: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    /// Denial reason or free-form annotation.
    pub note: Option<String>,
}

/// Top-of-book state derived from a replica update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStateUpdate {
    pub token_id: String,
    pub best_bid: Option<PriceLevel>,
    pub best_ask: Option<PriceLevel>,
    pub mid: Option<Decimal>,
    pub depth_sample: Vec<PriceLevel>,
}

/// Typed signal payload; the variant determines the signal kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignalPayload {
    GlobalSentiment(GlobalSentiment),
    HotToken(HotToken),
    WhaleMove(WhaleMove),
    NewsEvent(NewsEvent),
    MarketOpportunity(MarketOpportunity),
    RiskAlert(RiskAlert),
    PositionUpdate(PositionUpdate),
    MarketState(MarketStateUpdate),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::GlobalSentiment(_) => SignalKind::GlobalSentiment,
            SignalPayload::HotToken(_) => SignalKind::HotToken,
            SignalPayload::WhaleMove(_) => SignalKind::WhaleMove,
            SignalPayload::NewsEvent(_) => SignalKind::NewsEvent,
            SignalPayload::MarketOpportunity(_) => SignalKind::MarketOpportunity,
            SignalPayload::RiskAlert(_) => SignalKind::RiskAlert,
            SignalPayload::PositionUpdate(_) => SignalKind::PositionUpdate,
            SignalPayload::MarketState(_) => SignalKind::MarketState,
        }
    }
}

/// Immutable record on the bus. Never mutated after publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub priority: SignalPriority,
    /// Producing agent.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// Time-to-live in seconds; `None` means no expiry.
    pub ttl_secs: Option<u64>,
    pub payload: SignalPayload,
}

impl Signal {
    pub fn new(
        source: impl Into<String>,
        priority: SignalPriority,
        ttl_secs: Option<u64>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            source: source.into(),
            timestamp: Utc::now(),
            ttl_secs,
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_secs {
            Some(ttl) => self.age(now) > Duration::seconds(ttl as i64),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_values() {
        assert_eq!(SignalPriority::Critical.value(), 100);
        assert_eq!(SignalPriority::High.value(), 75);
        assert_eq!(SignalPriority::Medium.value(), 50);
        assert_eq!(SignalPriority::Low.value(), 25);
        assert!(SignalPriority::Low < SignalPriority::Critical);
    }

    #[test]
    fn kind_follows_payload() {
        let signal = Signal::new(
            "risk",
            SignalPriority::Critical,
            None,
            SignalPayload::RiskAlert(RiskAlert {
                severity: AlertSeverity::Critical,
                scope: AlertScope::Portfolio,
                reason: "daily loss".into(),
            }),
        );
        assert_eq!(signal.kind(), SignalKind::RiskAlert);
    }

    #[test]
    fn ttl_expiry() {
        let mut signal = Signal::new(
            "news",
            SignalPriority::Medium,
            Some(60),
            SignalPayload::NewsEvent(NewsEvent {
                headline: "h".into(),
                entities: vec![],
                sentiment: 0.0,
                confidence: 0.5,
                impact: NewsImpact::Low,
                source: "wire".into(),
                related_markets: vec![],
            }),
        );
        let now = signal.timestamp;
        assert!(!signal.is_expired(now + Duration::seconds(59)));
        assert!(signal.is_expired(now + Duration::seconds(61)));

        signal.ttl_secs = None;
        assert!(!signal.is_expired(now + Duration::days(365)));
    }
}
