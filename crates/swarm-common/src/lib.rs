//! Shared types for the swarm trading system.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod types;

pub use types::{MarketPair, Outcome, PriceLevel, Side};
