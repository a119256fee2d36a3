//! Swarm coordination substrate for binary prediction-market trading agents.
//!
//! Independent strategies share a capital pool and a real-time market view.
//! The substrate keeps them from double-committing funds, racing the same
//! arbitrage, or issuing conflicting nonces:
//!
//! - `signal`: in-process pub/sub bus with TTL, priority, history, and
//!   derived aggregates (signal strength, position multiplier)
//! - `store`: key-value coordination store (in-memory or Redis) with
//!   compare-and-set and TTL named locks
//! - `budget`: capital ledger and budget manager issuing reservations and
//!   blockchain nonces under distributed locks
//! - `risk`: portfolio limits and the circuit breaker
//! - `gateway`: typed wrappers over the order-entry service
//! - `agent`: the agent trait, the pure-arbitrage agent, and the supervisor

pub mod agent;
pub mod budget;
pub mod config;
pub mod gateway;
pub mod risk;
pub mod signal;
pub mod store;

pub use agent::{Agent, AgentContext, AgentError, ArbitrageAgent, Heartbeat};
pub use agent::supervisor::{AgentSupervisor, SupervisorConfig, SupervisorOutcome};
pub use budget::{BudgetConfig, BudgetError, BudgetManager, LedgerSnapshot, Reservation, ReservePriority};
pub use config::{ConfigError, SwarmConfig};
pub use gateway::{
    GatewayError, OrderGateway, OrderRequest, OrderResult, OrderStatus, PaperGateway,
    TimeInForce,
};
pub use risk::{
    CircuitBreaker, EntryRequest, RiskDecision, RiskController, RiskLimits,
};
pub use signal::{
    AlertScope, AlertSeverity, BusConfig, BusError, Signal, SignalBus, SignalKind,
    SignalPayload, SignalPriority, SubscriptionHandle,
};
pub use store::{CoordStore, LockGuard, MemoryStore, RedisStore, StoreError};
