//! Ledger records and their store encoding.
//!
//! The capital ledger lives in the coordination store as flat keys:
//!
//! ```text
//! balance:<strategy>   string-encoded decimal, unreserved capital
//! reservation:<id>     hash {strategy, amount, created_at, priority, ...}
//! nonce:<wallet>       integer (wallet lowercased)
//! metric:<strategy>    hash {trades, wins, losses, realized_pnl, updated_at}
//! executed             string-encoded decimal, total capital spent
//! ```

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Balance key of the shared reserve buffer.
pub const RESERVE: &str = "reserve";

/// Key construction for the ledger layout.
pub mod keys {
    /// Named lock serializing all multi-key budget updates.
    pub const BUDGET_LOCK: &str = "budget:lock";
    /// Index set of outstanding reservation IDs.
    pub const RESERVATION_INDEX: &str = "reservations";
    /// Running total of executed (spent) capital.
    pub const EXECUTED: &str = "executed";

    pub fn balance(strategy: &str) -> String {
        format!("balance:{strategy}")
    }

    pub fn reservation(id: &str) -> String {
        format!("reservation:{id}")
    }

    pub fn nonce(wallet: &str) -> String {
        format!("nonce:{}", wallet.to_lowercase())
    }

    pub fn nonce_lock(wallet: &str) -> String {
        format!("nonce:{}:lock", wallet.to_lowercase())
    }

    pub fn metric(strategy: &str) -> String {
        format!("metric:{strategy}")
    }
}

/// Reservation priority. `High` may draw from the reserve buffer;
/// `Critical` may additionally draw from other strategies' allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservePriority {
    Normal,
    High,
    Critical,
}

impl ReservePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservePriority::Normal => "normal",
            ReservePriority::High => "high",
            ReservePriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(ReservePriority::Normal),
            "high" => Some(ReservePriority::High),
            "critical" => Some(ReservePriority::Critical),
            _ => None,
        }
    }
}

/// An earmarked amount of a strategy's capital, tracked until release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: String,
    pub strategy: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub priority: ReservePriority,
    /// Portion drawn from the reserve buffer.
    pub draws_from_reserve: Decimal,
    /// Portions drawn from other strategies' balances (critical only).
    pub draws_from_others: BTreeMap<String, Decimal>,
}

impl Reservation {
    /// Portion drawn from the owning strategy's own balance.
    pub fn own_amount(&self) -> Decimal {
        self.amount - self.draws_from_reserve - self.others_total()
    }

    pub fn others_total(&self) -> Decimal {
        self.draws_from_others.values().copied().sum()
    }

    /// Age in whole seconds at `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }

    /// Encode as store hash fields.
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("strategy".into(), self.strategy.clone());
        fields.insert("amount".into(), self.amount.to_string());
        fields.insert("created_at".into(), self.created_at.to_rfc3339());
        fields.insert("priority".into(), self.priority.as_str().into());
        fields.insert(
            "draws_from_reserve".into(),
            self.draws_from_reserve.to_string(),
        );
        fields.insert(
            "draws_from_others".into(),
            serde_json::to_string(&self.draws_from_others).unwrap_or_else(|_| "{}".into()),
        );
        fields
    }

    /// Decode from store hash fields.
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let key = keys::reservation(id);
        let field = |name: &str| -> Result<&String, StoreError> {
            fields.get(name).ok_or_else(|| StoreError::Malformed {
                key: key.clone(),
                detail: format!("missing field {name}"),
            })
        };
        let malformed = |detail: &str| StoreError::Malformed {
            key: key.clone(),
            detail: detail.into(),
        };

        let amount: Decimal = field("amount")?
            .parse()
            .map_err(|_| malformed("bad amount"))?;
        let created_at = DateTime::parse_from_rfc3339(field("created_at")?)
            .map_err(|_| malformed("bad created_at"))?
            .to_utc();
        let priority = ReservePriority::parse(field("priority")?)
            .ok_or_else(|| malformed("bad priority"))?;
        let draws_from_reserve: Decimal = field("draws_from_reserve")?
            .parse()
            .map_err(|_| malformed("bad draws_from_reserve"))?;
        let draws_from_others: BTreeMap<String, Decimal> =
            serde_json::from_str(field("draws_from_others")?)
                .map_err(|_| malformed("bad draws_from_others"))?;

        Ok(Self {
            id: id.to_string(),
            strategy: field("strategy")?.clone(),
            amount,
            created_at,
            priority,
            draws_from_reserve,
            draws_from_others,
        })
    }
}

/// Per-strategy trade metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyMetrics {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub realized_pnl: Decimal,
}

impl StrategyMetrics {
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("trades".into(), self.trades.to_string());
        fields.insert("wins".into(), self.wins.to_string());
        fields.insert("losses".into(), self.losses.to_string());
        fields.insert("realized_pnl".into(), self.realized_pnl.to_string());
        fields.insert("updated_at".into(), Utc::now().to_rfc3339());
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let int = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };
        Self {
            trades: int("trades"),
            wins: int("wins"),
            losses: int("losses"),
            realized_pnl: fields
                .get("realized_pnl")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }
    }
}

/// Read-only view of the ledger.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    /// Balances including the reserve buffer.
    pub balances: BTreeMap<String, Decimal>,
    /// Outstanding reservations.
    pub reservations: Vec<Reservation>,
    /// Total capital spent through released reservations.
    pub executed: Decimal,
}

impl LedgerSnapshot {
    /// Sum of all balances, outstanding reservations, and executed capital.
    /// Equals the seeded total while the ledger is conserved.
    pub fn committed_total(&self) -> Decimal {
        let balances: Decimal = self.balances.values().copied().sum();
        let reserved: Decimal = self.reservations.iter().map(|r| r.amount).sum();
        balances + reserved + self.executed
    }

    pub fn reserved_total(&self) -> Decimal {
        self.reservations.iter().map(|r| r.amount).sum()
    }
}
