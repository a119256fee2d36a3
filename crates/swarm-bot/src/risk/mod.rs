//! Portfolio risk controls.

pub mod circuit_breaker;
pub mod controller;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use controller::{EntryRequest, RiskController, RiskDecision, RiskLimits, TrackedPosition};
