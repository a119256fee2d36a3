//! In-process signal bus and the derived market-intelligence aggregates.

pub mod aggregates;
pub mod bus;
pub mod types;

pub use bus::{BusConfig, BusCountersSnapshot, BusError, SignalBus, SubscriptionHandle};
pub use types::{
    AlertScope, AlertSeverity, GlobalSentiment, HotReason, HotToken, MarketOpportunity,
    MarketStateUpdate, NewsEvent, NewsImpact, OpportunityKind, PositionUpdate, RiskAlert, Signal,
    SignalKind, SignalPayload, SignalPriority, WhaleMove,
};
