//! Budget manager.
//!
//! Single writer of the capital ledger within a process. Every multi-key
//! update runs under the `budget:lock` named lock; nonce issuance runs
//! under a per-wallet lock. All denial paths fail closed: a store error is
//! never reported as capital.
//!
//! A lock observed to have expired while held is a coordination fault. It
//! is logged CRITICAL and surfaced through `CoordinationFault`, which the
//! supervisor treats as unrecoverable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{acquire_lock_with_deadline, CoordStore, LockGuard, StoreError};

use super::ledger::{keys, LedgerSnapshot, Reservation, ReservePriority, StrategyMetrics, RESERVE};

/// Errors from the budget manager.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ledger already seeded; pass --reset to reseed")]
    LedgerExists,

    #[error("nonce source failed for {wallet}: {detail}")]
    NonceSource { wallet: String, detail: String },

    #[error("nonce regression for {wallet}: {prev} -> {next}")]
    NonceRegression { wallet: String, prev: i64, next: i64 },
}

/// Latched flag for unrecoverable coordination faults (lost locks, ledger
/// invariant violations, nonce regressions). The supervisor waits on it and
/// shuts the swarm down with exit code 3.
#[derive(Debug, Default)]
pub struct CoordinationFault {
    tripped: AtomicBool,
    notify: Notify,
}

impl CoordinationFault {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trip(&self, reason: &str) {
        if !self.tripped.swap(true, Ordering::AcqRel) {
            error!(reason, "CRITICAL coordination fault");
        }
        self.notify.notify_waiters();
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Resolve once the fault trips. Usable from multiple waiters.
    pub async fn wait(&self) {
        loop {
            if self.is_tripped() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_tripped() {
                return;
            }
            notified.await;
        }
    }
}

/// Authoritative source for a wallet's on-chain transaction count, consulted
/// once per wallet to initialize the nonce counter.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn current_nonce(&self, wallet: &str) -> Result<i64, BudgetError>;
}

/// Fixed-value nonce source for tests and dry runs.
#[derive(Debug, Default)]
pub struct StaticNonceSource {
    pub start: i64,
}

#[async_trait]
impl NonceSource for StaticNonceSource {
    async fn current_nonce(&self, _wallet: &str) -> Result<i64, BudgetError> {
        Ok(self.start)
    }
}

/// Configuration for the budget manager.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Fraction of total capital held back as the reserve buffer.
    pub reserve_fraction: Decimal,
    /// Per-strategy allocation fractions. Together with the reserve these
    /// must sum to exactly 1 (validated at config load).
    pub allocations: BTreeMap<String, Decimal>,
    /// Reservation TTL before the janitor reclaims it.
    pub reservation_ttl: Duration,
    /// TTL of `budget:lock`.
    pub budget_lock_ttl: Duration,
    /// TTL of per-wallet nonce locks.
    pub nonce_lock_ttl: Duration,
    /// How long to poll for a contended lock before giving up.
    pub lock_deadline: Duration,
    /// Janitor sweep cadence.
    pub janitor_interval: Duration,
    /// Max fraction of another strategy's balance a critical reservation
    /// may draw.
    pub critical_cross_draw_cap: Decimal,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        let mut allocations = BTreeMap::new();
        allocations.insert("arb".to_string(), Decimal::new(40, 2));
        allocations.insert("statarb".to_string(), Decimal::new(30, 2));
        allocations.insert("mimic".to_string(), Decimal::new(20, 2));
        Self {
            reserve_fraction: Decimal::new(10, 2),
            allocations,
            reservation_ttl: Duration::from_secs(60),
            budget_lock_ttl: Duration::from_secs(5),
            nonce_lock_ttl: Duration::from_secs(10),
            lock_deadline: Duration::from_secs(1),
            janitor_interval: Duration::from_secs(5),
            critical_cross_draw_cap: Decimal::new(50, 2),
        }
    }
}

/// Budget manager: issues capital reservations and nonces under the
/// coordination store's named locks.
pub struct BudgetManager {
    store: Arc<dyn CoordStore>,
    config: BudgetConfig,
    fault: Arc<CoordinationFault>,
    nonce_source: Arc<dyn NonceSource>,
    refuse: AtomicBool,
}

impl BudgetManager {
    pub fn new(
        store: Arc<dyn CoordStore>,
        config: BudgetConfig,
        fault: Arc<CoordinationFault>,
        nonce_source: Arc<dyn NonceSource>,
    ) -> Self {
        Self {
            store,
            config,
            fault,
            nonce_source,
            refuse: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Stop granting reservations (circuit breaker tripped).
    pub fn refuse_new_reservations(&self) {
        self.refuse.store(true, Ordering::Release);
    }

    /// Resume granting reservations after a manual breaker reset.
    pub fn allow_new_reservations(&self) {
        self.refuse.store(false, Ordering::Release);
    }

    pub fn is_refusing(&self) -> bool {
        self.refuse.load(Ordering::Acquire)
    }

    /// Whether the ledger has been seeded.
    pub async fn is_seeded(&self) -> Result<bool, BudgetError> {
        Ok(self.store.get(&keys::balance(RESERVE)).await?.is_some())
    }

    /// Seed a fresh ledger: reserve buffer plus per-strategy allocations.
    /// Reseeding an existing ledger requires `reset`.
    pub async fn seed(&self, total_capital: Decimal, reset: bool) -> Result<(), BudgetError> {
        if self.is_seeded().await? && !reset {
            return Err(BudgetError::LedgerExists);
        }
        let guard = self.lock_budget().await?;
        let result = self.seed_under_lock(total_capital).await;
        self.finish_lock(guard).await;
        result
    }

    async fn seed_under_lock(&self, total_capital: Decimal) -> Result<(), BudgetError> {
        let reserve = total_capital * self.config.reserve_fraction;
        self.write_decimal(&keys::balance(RESERVE), reserve).await?;
        for (strategy, fraction) in &self.config.allocations {
            let amount = total_capital * fraction;
            self.write_decimal(&keys::balance(strategy), amount).await?;
            info!(%strategy, %amount, "seeded strategy balance");
        }
        self.write_decimal(keys::EXECUTED, Decimal::ZERO).await?;
        for id in self.store.smembers(keys::RESERVATION_INDEX).await? {
            self.store.del(&keys::reservation(&id)).await?;
            self.store.srem(keys::RESERVATION_INDEX, &id).await?;
        }
        info!(%total_capital, %reserve, "ledger seeded");
        Ok(())
    }

    /// Request a capital reservation. Returns the reservation ID, or `None`
    /// when denied. Fails closed: any store trouble is a denial.
    pub async fn request_reservation(
        &self,
        strategy: &str,
        amount: Decimal,
        priority: ReservePriority,
    ) -> Option<String> {
        if self.is_refusing() {
            warn!(%strategy, %amount, "DENY:BUDGET reservations refused (circuit breaker)");
            return None;
        }
        if amount <= Decimal::ZERO {
            warn!(%strategy, %amount, "DENY:BUDGET non-positive amount");
            return None;
        }
        if !self.config.allocations.contains_key(strategy) {
            warn!(%strategy, "DENY:BUDGET unknown strategy");
            return None;
        }
        let guard = match self.lock_budget().await {
            Ok(guard) => guard,
            Err(e) => {
                error!(%strategy, error = %e, "DENY:BUDGET store unavailable");
                return None;
            }
        };
        let result = self.reserve_under_lock(strategy, amount, priority).await;
        self.finish_lock(guard).await;
        match result {
            Ok(id) => id,
            Err(e) => {
                error!(%strategy, error = %e, "DENY:BUDGET reservation failed");
                None
            }
        }
    }

    async fn reserve_under_lock(
        &self,
        strategy: &str,
        amount: Decimal,
        priority: ReservePriority,
    ) -> Result<Option<String>, BudgetError> {
        let balance = self.read_decimal(&keys::balance(strategy)).await?;
        let mut from_own = amount;
        let mut from_reserve = Decimal::ZERO;
        let mut from_others: BTreeMap<String, Decimal> = BTreeMap::new();

        if balance < amount {
            if priority == ReservePriority::Normal {
                info!(%strategy, %amount, %balance, "DENY:BUDGET insufficient balance");
                return Ok(None);
            }
            from_own = balance;
            let mut shortfall = amount - balance;

            let reserve = self.read_decimal(&keys::balance(RESERVE)).await?;
            from_reserve = shortfall.min(reserve);
            shortfall -= from_reserve;

            if shortfall > Decimal::ZERO && priority == ReservePriority::Critical {
                for other in self.config.allocations.keys() {
                    if other == strategy || shortfall == Decimal::ZERO {
                        continue;
                    }
                    let other_balance = self.read_decimal(&keys::balance(other)).await?;
                    let cap = other_balance * self.config.critical_cross_draw_cap;
                    let take = shortfall.min(cap);
                    if take > Decimal::ZERO {
                        from_others.insert(other.clone(), take);
                        shortfall -= take;
                    }
                }
            }

            if shortfall > Decimal::ZERO {
                info!(%strategy, %amount, %balance, "DENY:BUDGET insufficient balance and reserve");
                return Ok(None);
            }
            if from_reserve > Decimal::ZERO {
                warn!(%strategy, drawn = %from_reserve, "reserve buffer tapped");
            }
        }

        self.write_decimal(&keys::balance(strategy), balance - from_own)
            .await?;
        if from_reserve > Decimal::ZERO {
            let reserve = self.read_decimal(&keys::balance(RESERVE)).await?;
            self.write_decimal(&keys::balance(RESERVE), reserve - from_reserve)
                .await?;
        }
        for (other, take) in &from_others {
            let other_balance = self.read_decimal(&keys::balance(other)).await?;
            self.write_decimal(&keys::balance(other), other_balance - take)
                .await?;
            warn!(%strategy, from = %other, drawn = %take, "critical cross-strategy draw");
        }

        let reservation = Reservation {
            id: Uuid::new_v4().to_string(),
            strategy: strategy.to_string(),
            amount,
            created_at: Utc::now(),
            priority,
            draws_from_reserve: from_reserve,
            draws_from_others: from_others,
        };
        self.store
            .hset_all(&keys::reservation(&reservation.id), &reservation.to_fields())
            .await?;
        self.store
            .sadd(keys::RESERVATION_INDEX, &reservation.id)
            .await?;
        info!(%strategy, %amount, id = %reservation.id, "reservation granted");
        Ok(Some(reservation.id))
    }

    /// How much the strategy could reserve right now at the given
    /// priority: its own balance, plus the reserve for high/critical, plus
    /// the capped cross-strategy draw for critical. Read-only and fail
    /// closed: store trouble reports zero headroom.
    pub async fn available_reservation(
        &self,
        strategy: &str,
        priority: ReservePriority,
    ) -> Decimal {
        if self.is_refusing() || !self.config.allocations.contains_key(strategy) {
            return Decimal::ZERO;
        }
        let guard = match self.lock_budget().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%strategy, error = %e, "headroom query failed closed");
                return Decimal::ZERO;
            }
        };
        let result = self.headroom_under_lock(strategy, priority).await;
        self.finish_lock(guard).await;
        match result {
            Ok(headroom) => headroom,
            Err(e) => {
                warn!(%strategy, error = %e, "headroom query failed closed");
                Decimal::ZERO
            }
        }
    }

    async fn headroom_under_lock(
        &self,
        strategy: &str,
        priority: ReservePriority,
    ) -> Result<Decimal, BudgetError> {
        let mut headroom = self.read_decimal(&keys::balance(strategy)).await?;
        if priority != ReservePriority::Normal {
            headroom += self.read_decimal(&keys::balance(RESERVE)).await?;
        }
        if priority == ReservePriority::Critical {
            for other in self.config.allocations.keys() {
                if other == strategy {
                    continue;
                }
                let balance = self.read_decimal(&keys::balance(other)).await?;
                headroom += balance * self.config.critical_cross_draw_cap;
            }
        }
        Ok(headroom)
    }

    /// Release a reservation: `actually_spent` moves to the executed
    /// counter, the remainder returns pro-rata to where it was drawn from.
    /// Releasing an already-reclaimed reservation is a no-op.
    pub async fn release_reservation(
        &self,
        strategy: &str,
        reservation_id: &str,
        actually_spent: Decimal,
    ) -> Result<(), BudgetError> {
        let guard = self.lock_budget().await?;
        let result = self
            .release_under_lock(strategy, reservation_id, actually_spent)
            .await;
        self.finish_lock(guard).await;
        result
    }

    async fn release_under_lock(
        &self,
        strategy: &str,
        reservation_id: &str,
        actually_spent: Decimal,
    ) -> Result<(), BudgetError> {
        let fields = self
            .store
            .hget_all(&keys::reservation(reservation_id))
            .await?;
        if fields.is_empty() {
            debug!(id = %reservation_id, "reservation already reclaimed");
            return Ok(());
        }
        let reservation = Reservation::from_fields(reservation_id, &fields)?;
        if reservation.strategy != strategy {
            warn!(
                id = %reservation_id,
                expected = %reservation.strategy,
                got = %strategy,
                "release by non-owning strategy"
            );
        }
        self.credit_back(&reservation, actually_spent).await?;
        self.bump_metrics(&reservation.strategy, |m| m.trades += 1)
            .await?;
        self.store.del(&keys::reservation(reservation_id)).await?;
        self.store
            .srem(keys::RESERVATION_INDEX, reservation_id)
            .await?;
        debug!(id = %reservation_id, spent = %actually_spent, "reservation released");
        Ok(())
    }

    /// Return the unspent remainder pro-rata to its sources. The owning
    /// strategy's share absorbs rounding so the ledger stays conserved.
    async fn credit_back(
        &self,
        reservation: &Reservation,
        actually_spent: Decimal,
    ) -> Result<(), BudgetError> {
        let spent = actually_spent.clamp(Decimal::ZERO, reservation.amount);
        let unspent = reservation.amount - spent;

        let mut remaining = unspent;
        if unspent > Decimal::ZERO && reservation.amount > Decimal::ZERO {
            let reserve_back = (unspent * reservation.draws_from_reserve / reservation.amount)
                .round_dp(9);
            if reserve_back > Decimal::ZERO {
                let reserve = self.read_decimal(&keys::balance(RESERVE)).await?;
                self.write_decimal(&keys::balance(RESERVE), reserve + reserve_back)
                    .await?;
                remaining -= reserve_back;
            }
            for (other, drawn) in &reservation.draws_from_others {
                let back = (unspent * drawn / reservation.amount).round_dp(9);
                if back > Decimal::ZERO {
                    let balance = self.read_decimal(&keys::balance(other)).await?;
                    self.write_decimal(&keys::balance(other), balance + back)
                        .await?;
                    remaining -= back;
                }
            }
            let balance = self
                .read_decimal(&keys::balance(&reservation.strategy))
                .await?;
            self.write_decimal(&keys::balance(&reservation.strategy), balance + remaining)
                .await?;
        }

        if spent > Decimal::ZERO {
            let executed = self.read_decimal(keys::EXECUTED).await?;
            self.write_decimal(keys::EXECUTED, executed + spent).await?;
        }
        Ok(())
    }

    /// Record a settled trade's outcome in the strategy metrics.
    pub async fn record_trade_result(
        &self,
        strategy: &str,
        realized_pnl: Decimal,
    ) -> Result<(), BudgetError> {
        let guard = self.lock_budget().await?;
        let result = self
            .bump_metrics(strategy, |m| {
                if realized_pnl >= Decimal::ZERO {
                    m.wins += 1;
                } else {
                    m.losses += 1;
                }
                m.realized_pnl += realized_pnl;
            })
            .await;
        self.finish_lock(guard).await;
        result
    }

    async fn bump_metrics<F>(&self, strategy: &str, update: F) -> Result<(), BudgetError>
    where
        F: FnOnce(&mut StrategyMetrics),
    {
        let key = keys::metric(strategy);
        let mut metrics = StrategyMetrics::from_fields(&self.store.hget_all(&key).await?);
        update(&mut metrics);
        self.store.hset_all(&key, &metrics.to_fields()).await?;
        Ok(())
    }

    pub async fn metrics(&self, strategy: &str) -> Result<StrategyMetrics, BudgetError> {
        Ok(StrategyMetrics::from_fields(
            &self.store.hget_all(&keys::metric(strategy)).await?,
        ))
    }

    /// Next nonce for a wallet, strictly monotonic across the process tree.
    /// Initialized once from the authoritative source.
    pub async fn next_nonce(&self, wallet: &str) -> Result<i64, BudgetError> {
        let guard = acquire_lock_with_deadline(
            self.store.as_ref(),
            &keys::nonce_lock(wallet),
            self.config.nonce_lock_ttl,
            self.config.lock_deadline,
        )
        .await?;

        let result = self.next_nonce_under_lock(wallet).await;
        self.finish_lock(guard).await;
        result
    }

    async fn next_nonce_under_lock(&self, wallet: &str) -> Result<i64, BudgetError> {
        let key = keys::nonce(wallet);
        let prev = match self.store.get(&key).await? {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::Malformed {
                key: key.clone(),
                detail: "not an integer".into(),
            })?,
            None => {
                let initial = self.nonce_source.current_nonce(wallet).await?;
                self.store.set(&key, &initial.to_string()).await?;
                info!(%wallet, initial, "nonce initialized from authoritative source");
                initial
            }
        };
        let next = self.store.incr_by(&key, 1).await?;
        if next <= prev {
            self.fault
                .trip(&format!("nonce regression for {wallet}: {prev} -> {next}"));
            return Err(BudgetError::NonceRegression {
                wallet: wallet.to_string(),
                prev,
                next,
            });
        }
        Ok(next)
    }

    /// Read-only snapshot of balances, outstanding reservations, and the
    /// executed counter. Taken under the budget lock so the view is
    /// consistent with the conservation invariant.
    pub async fn snapshot(&self) -> Result<LedgerSnapshot, BudgetError> {
        let guard = self.lock_budget().await?;
        let result = self.snapshot_under_lock().await;
        self.finish_lock(guard).await;
        result
    }

    async fn snapshot_under_lock(&self) -> Result<LedgerSnapshot, BudgetError> {
        let mut balances = BTreeMap::new();
        balances.insert(
            RESERVE.to_string(),
            self.read_decimal(&keys::balance(RESERVE)).await?,
        );
        for strategy in self.config.allocations.keys() {
            balances.insert(
                strategy.clone(),
                self.read_decimal(&keys::balance(strategy)).await?,
            );
        }
        let mut reservations = Vec::new();
        for id in self.store.smembers(keys::RESERVATION_INDEX).await? {
            let fields = self.store.hget_all(&keys::reservation(&id)).await?;
            if !fields.is_empty() {
                reservations.push(Reservation::from_fields(&id, &fields)?);
            }
        }
        let executed = self.read_decimal(keys::EXECUTED).await?;
        Ok(LedgerSnapshot {
            balances,
            reservations,
            executed,
        })
    }

    /// Reclaim reservations older than the TTL, returning their amounts to
    /// the originating balances. Returns how many were reclaimed.
    pub async fn reclaim_expired(&self) -> Result<usize, BudgetError> {
        let guard = self.lock_budget().await?;
        let result = self.reclaim_under_lock().await;
        self.finish_lock(guard).await;
        result
    }

    async fn reclaim_under_lock(&self) -> Result<usize, BudgetError> {
        let now = Utc::now();
        let ttl_secs = self.config.reservation_ttl.as_secs() as i64;
        let mut reclaimed = 0;
        for id in self.store.smembers(keys::RESERVATION_INDEX).await? {
            let fields = self.store.hget_all(&keys::reservation(&id)).await?;
            if fields.is_empty() {
                self.store.srem(keys::RESERVATION_INDEX, &id).await?;
                continue;
            }
            let reservation = Reservation::from_fields(&id, &fields)?;
            if reservation.age_secs(now) > ttl_secs {
                warn!(
                    id = %id,
                    strategy = %reservation.strategy,
                    amount = %reservation.amount,
                    "janitor reclaiming expired reservation"
                );
                self.credit_back(&reservation, Decimal::ZERO).await?;
                self.store.del(&keys::reservation(&id)).await?;
                self.store.srem(keys::RESERVATION_INDEX, &id).await?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Spawn the reservation janitor. Runs until shutdown.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.janitor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tick.tick() => {
                        if let Err(e) = manager.reclaim_expired().await {
                            warn!(error = %e, "janitor sweep failed");
                        }
                    }
                }
            }
        })
    }

    async fn lock_budget(&self) -> Result<LockGuard, BudgetError> {
        Ok(acquire_lock_with_deadline(
            self.store.as_ref(),
            keys::BUDGET_LOCK,
            self.config.budget_lock_ttl,
            self.config.lock_deadline,
        )
        .await?)
    }

    /// Release a held lock; an expired or lost lock is a coordination fault.
    async fn finish_lock(&self, guard: LockGuard) {
        if guard.is_expired() {
            self.fault
                .trip(&format!("lock {} TTL expired while held", guard.name));
        }
        if let Err(StoreError::LockLost(name)) = self.store.release_lock(guard).await {
            self.fault.trip(&format!("lock {name} lost before release"));
        }
    }

    async fn read_decimal(&self, key: &str) -> Result<Decimal, BudgetError> {
        match self.store.get(key).await? {
            Some(raw) => raw.parse().map_err(|_| {
                BudgetError::Store(StoreError::Malformed {
                    key: key.to_string(),
                    detail: "not a decimal".into(),
                })
            }),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn write_decimal(&self, key: &str, value: Decimal) -> Result<(), BudgetError> {
        Ok(self.store.set(key, &value.normalize().to_string()).await?)
    }
}
