//! Capital ledger and budget manager.
//!
//! Arbitrates the shared capital pool and blockchain nonces through the
//! coordination store. No trade is committed without a reservation; no two
//! strategies can spend the same dollar.

pub mod ledger;
pub mod manager;

pub use ledger::{keys, LedgerSnapshot, Reservation, ReservePriority, StrategyMetrics, RESERVE};
pub use manager::{
    BudgetConfig, BudgetError, BudgetManager, CoordinationFault, NonceSource, StaticNonceSource,
};
