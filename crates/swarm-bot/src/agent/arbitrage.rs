//! Pure-arbitrage agent.
//!
//! Detects binary markets where the YES and NO asks sum to less than one
//! unit net of fees and gas, then executes both legs with minimal leg risk:
//!
//! ```text
//! IDLE -> CLAIM -> RESERVE -> PLACE_A -> PLACE_B -> SETTLED
//!                                 |          |
//!                                 v          v
//!                               ABORT   MARKET_CLOSE_A -> ABORT
//! ```
//!
//! Orders are IOC limits priced `best_ask * (1 + max_slippage)`; an IOC
//! that does not fill is a rejection. If leg B rejects after leg A filled,
//! the residual is closed at market within `leg_risk_timeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use swarm_common::{MarketPair, Outcome, PriceLevel, Side};
use swarm_market::ReplicaMap;

use crate::budget::{BudgetManager, ReservePriority};
use crate::gateway::{
    submit_with_retry, OrderGateway, OrderRequest, OrderResult, TimeInForce,
};
use crate::risk::{EntryRequest, RiskController, RiskDecision};
use crate::signal::{
    AlertScope, AlertSeverity, MarketOpportunity, OpportunityKind, PositionUpdate, RiskAlert,
    Signal, SignalBus, SignalKind, SignalPayload, SignalPriority, SubscriptionHandle,
};

use super::{Agent, AgentContext, AgentError};

/// Configuration for the arbitrage agent.
#[derive(Debug, Clone)]
pub struct ArbConfig {
    /// Budget strategy this agent draws from.
    pub strategy: String,
    /// Minimum profit per unit of matched pairs.
    pub min_profit_per_unit: Decimal,
    /// IOC limit premium over the best ask.
    pub max_slippage: Decimal,
    /// Market-maker fee per unit.
    pub fee_per_unit: Decimal,
    /// Flat gas cost per two-leg trade.
    pub gas_per_trade: Decimal,
    /// Per-order ceiling on executable size. The effective cap per
    /// opportunity is the smaller of this and the reservation headroom
    /// reported by the budget manager.
    pub size_cap: Decimal,
    /// Scan cadence.
    pub scan_interval: Duration,
    /// Scan cadence while the scan-frequency gate is hot.
    pub boosted_scan_interval: Duration,
    /// Deadline to close residual leg-A exposure at market.
    pub leg_risk_timeout: Duration,
    /// A reservation whose legs have not begun executing by this deadline
    /// is released.
    pub execution_deadline: Duration,
    /// Transient-error retry budget per order.
    pub retry_attempts: u32,
    /// Price tick precision (decimal places).
    pub price_dp: u32,
}

impl Default for ArbConfig {
    fn default() -> Self {
        Self {
            strategy: "arb".to_string(),
            min_profit_per_unit: Decimal::new(1, 2),
            max_slippage: Decimal::new(2, 2),
            fee_per_unit: Decimal::ZERO,
            gas_per_trade: Decimal::ZERO,
            size_cap: Decimal::new(50, 0),
            scan_interval: Duration::from_secs(1),
            boosted_scan_interval: Duration::from_millis(500),
            leg_risk_timeout: Duration::from_secs(5),
            execution_deadline: Duration::from_secs(10),
            retry_attempts: 3,
            price_dp: 4,
        }
    }
}

/// A detected pure-arbitrage opportunity.
#[derive(Debug, Clone)]
pub struct ArbOpportunity {
    /// Deterministic ID shared by every agent seeing the same market.
    pub opportunity_id: String,
    pub pair: MarketPair,
    pub yes_ask: PriceLevel,
    pub no_ask: PriceLevel,
    /// Executable size: the lesser of both ask depths, the per-order
    /// ceiling, and the reservation headroom at the quoted pair cost.
    pub size: Decimal,
    /// Expected profit net of fees and gas.
    pub expected_profit: Decimal,
}

impl ArbOpportunity {
    /// Combined cost per unit (`a + b`).
    pub fn pair_cost(&self) -> Decimal {
        self.yes_ask.price + self.no_ask.price
    }

    /// Capital required at the quoted asks.
    pub fn notional(&self) -> Decimal {
        self.pair_cost() * self.size
    }
}

struct HedgeOutcome {
    pnl: Decimal,
    proceeds: Decimal,
}

/// Pure-arbitrage agent. Exemplar consumer of the coordination substrate.
pub struct ArbitrageAgent {
    id: String,
    config: ArbConfig,
    bus: SignalBus,
    budget: Arc<BudgetManager>,
    risk: Arc<RiskController>,
    gateway: Arc<dyn OrderGateway>,
    books: ReplicaMap,
    pairs: RwLock<Vec<MarketPair>>,
    boosted: AtomicBool,
    /// Opportunities observed claimed by another agent, with claim time.
    externally_claimed: DashMap<String, DateTime<Utc>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl ArbitrageAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ArbConfig,
        bus: SignalBus,
        budget: Arc<BudgetManager>,
        risk: Arc<RiskController>,
        gateway: Arc<dyn OrderGateway>,
        books: ReplicaMap,
        pairs: Vec<MarketPair>,
    ) -> Arc<Self> {
        for pair in &pairs {
            risk.register_entity(&pair.yes_token_id, &pair.question);
            risk.register_entity(&pair.no_token_id, &pair.question);
        }
        Arc::new(Self {
            id: config.strategy.clone(),
            config,
            bus,
            budget,
            risk,
            gateway,
            books,
            pairs: RwLock::new(pairs),
            boosted: AtomicBool::new(false),
            externally_claimed: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Replace the watched pair set (market discovery refresh).
    pub fn set_pairs(&self, pairs: Vec<MarketPair>) {
        for pair in &pairs {
            self.risk.register_entity(&pair.yes_token_id, &pair.question);
            self.risk.register_entity(&pair.no_token_id, &pair.question);
        }
        *self.pairs.write() = pairs;
    }

    fn install_subscriptions(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        // The bus must not keep the agent alive: callbacks hold a Weak and
        // the supervisor unsubscribes via stop() before dropping us.
        for kind in [
            SignalKind::MarketState,
            SignalKind::NewsEvent,
            SignalKind::MarketOpportunity,
        ] {
            let weak = Arc::downgrade(self);
            let handle = self.bus.subscribe(kind, self.id.clone(), move |signal| {
                if let Some(agent) = weak.upgrade() {
                    agent.handle_signal(signal);
                }
            });
            subscriptions.push(handle);
        }
    }

    fn update_boost(&self) {
        let pairs = self.pairs.read();
        let hot = pairs
            .iter()
            .any(|p| self.bus.should_increase_scan_frequency(&p.question));
        self.boosted.store(hot, Ordering::Release);
    }

    fn scan_interval(&self) -> Duration {
        if self.boosted.load(Ordering::Acquire) {
            self.config.boosted_scan_interval
        } else {
            self.config.scan_interval
        }
    }

    /// Detect the best currently viable opportunity, if any.
    pub async fn detect_best(&self) -> Option<ArbOpportunity> {
        let mut opportunities = self.detect_all().await;
        opportunities.sort_by(|x, y| {
            y.expected_profit
                .cmp(&x.expected_profit)
                .then(x.pair_cost().cmp(&y.pair_cost()))
                .then(x.pair.market_id.cmp(&y.pair.market_id))
        });
        opportunities.into_iter().next()
    }

    async fn detect_all(&self) -> Vec<ArbOpportunity> {
        // The budget manager is the authority on how much this strategy
        // could reserve right now; a pair's executable size never exceeds
        // what that headroom buys at the quoted pair cost.
        let headroom = self
            .budget
            .available_reservation(&self.config.strategy, ReservePriority::Normal)
            .await;
        let now = Utc::now();
        let pairs = self.pairs.read().clone();
        let mut opportunities = Vec::new();
        for pair in pairs {
            let Some(yes_ask) = self.best_ask(&pair.yes_token_id) else {
                continue;
            };
            let Some(no_ask) = self.best_ask(&pair.no_token_id) else {
                continue;
            };
            let pair_cost = yes_ask.price + no_ask.price;
            if pair_cost <= Decimal::ZERO {
                continue;
            }
            let budget_cap = (headroom / pair_cost).floor();
            let size = yes_ask
                .size
                .min(no_ask.size)
                .min(self.config.size_cap)
                .min(budget_cap);
            if size <= Decimal::ZERO {
                continue;
            }
            let cost = pair_cost * size;
            let overhead = self.config.fee_per_unit * size + self.config.gas_per_trade;
            let expected_profit = size - cost - overhead;
            if expected_profit < self.config.min_profit_per_unit * size {
                continue;
            }
            let opportunity_id = format!("pure_arb:{}", pair.market_id);
            if self.is_claimed_elsewhere(&opportunity_id, now) {
                continue;
            }
            opportunities.push(ArbOpportunity {
                opportunity_id,
                pair,
                yes_ask,
                no_ask,
                size,
                expected_profit,
            });
        }
        opportunities
    }

    fn best_ask(&self, token_id: &str) -> Option<PriceLevel> {
        self.books.get(token_id).and_then(|book| book.best_ask())
    }

    fn is_claimed_elsewhere(&self, opportunity_id: &str, now: DateTime<Utc>) -> bool {
        if let Some(owner) = self.bus.claimant(opportunity_id) {
            if owner != self.id {
                return true;
            }
        }
        let stale = match self.externally_claimed.get(opportunity_id) {
            Some(at) => {
                if (now - *at).num_seconds() < 60 {
                    return true;
                }
                true
            }
            None => false,
        };
        if stale {
            self.externally_claimed.remove(opportunity_id);
        }
        false
    }

    /// Claim and execute one opportunity end to end. The claim is released
    /// on every exit path.
    pub async fn execute_opportunity(&self, opp: &ArbOpportunity) {
        if !self.bus.claim(&opp.opportunity_id, &self.id) {
            debug!(id = %opp.opportunity_id, "claim denied, opportunity taken");
            return;
        }
        self.publish_claim(opp);
        self.run_legs(opp).await;
        self.bus.release_claim(&opp.opportunity_id, &self.id);
    }

    async fn run_legs(&self, opp: &ArbOpportunity) {
        let notional = opp.notional();
        let decision = self.risk.evaluate(&EntryRequest {
            agent: self.id.clone(),
            token_id: opp.pair.yes_token_id.clone(),
            entity: opp.pair.question.clone(),
            notional_usd: notional,
            signal_gated: false,
        });
        if let RiskDecision::Deny { reason } = decision {
            self.publish_denial(&opp.pair.yes_token_id, &reason);
            return;
        }

        let Some(reservation_id) = self
            .budget
            .request_reservation(&self.config.strategy, notional, ReservePriority::Normal)
            .await
        else {
            self.publish_denial(&opp.pair.yes_token_id, "budget denied");
            return;
        };

        // PLACE_A: YES leg. The execution deadline bounds a gateway that
        // hangs past its own timeouts; an expired deadline releases the
        // reservation untouched (the janitor backs this up).
        let order_a = self.ioc_buy(&opp.pair, Outcome::Yes, opp.yes_ask.price, opp.size);
        let result_a = match timeout(
            self.config.execution_deadline,
            submit_with_retry(self.gateway.as_ref(), order_a, self.config.retry_attempts),
        )
        .await
        {
            Err(_) => {
                warn!(id = %opp.opportunity_id, "execution deadline elapsed before leg A");
                self.release(&reservation_id, Decimal::ZERO).await;
                return;
            }
            Ok(Err(e)) => {
                self.publish_agent_alert(&format!("leg A submit failed: {e}"));
                self.release(&reservation_id, Decimal::ZERO).await;
                return;
            }
            Ok(Ok(result)) => result,
        };
        if !result_a.any_fill() {
            debug!(id = %opp.opportunity_id, "leg A IOC unfilled, treated as rejected");
            self.release(&reservation_id, Decimal::ZERO).await;
            return;
        }
        let fill_a = result_a.filled_size;
        let cost_a = fill_a * result_a.avg_price;

        // PLACE_B: NO leg, immediately, sized to the leg-A fill.
        let order_b = self.ioc_buy(&opp.pair, Outcome::No, opp.no_ask.price, fill_a);
        let result_b =
            submit_with_retry(self.gateway.as_ref(), order_b, self.config.retry_attempts).await;

        match result_b {
            Ok(result_b) if result_b.any_fill() => {
                self.settle(opp, &reservation_id, &result_a, &result_b).await;
            }
            other => {
                if let Err(e) = &other {
                    if !e.is_transient() {
                        self.publish_agent_alert(&format!("leg B submit failed: {e}"));
                    }
                }
                // Leg risk realized: close leg A at market, report the loss.
                let hedge = self.hedge_leg_a(&opp.pair, fill_a, result_a.avg_price).await;
                let spent = cost_a - hedge.proceeds;
                self.release(&reservation_id, spent).await;
                self.record_result(hedge.pnl).await;
                self.publish_fill(
                    &opp.pair.yes_token_id,
                    Decimal::ZERO,
                    result_a.avg_price,
                    hedge.pnl,
                );
            }
        }
    }

    async fn settle(
        &self,
        opp: &ArbOpportunity,
        reservation_id: &str,
        result_a: &OrderResult,
        result_b: &OrderResult,
    ) {
        let fill_a = result_a.filled_size;
        let fill_b = result_b.filled_size;
        let matched = fill_a.min(fill_b);
        let pair_cost = result_a.avg_price + result_b.avg_price;
        let mut realized = matched * (Decimal::ONE - pair_cost)
            - self.config.fee_per_unit * matched
            - self.config.gas_per_trade;
        let mut spent = fill_a * result_a.avg_price + fill_b * result_b.avg_price;

        if fill_b < fill_a {
            // Leg B partially filled: the residual of leg A is naked.
            let residual = fill_a - fill_b;
            let hedge = self.hedge_leg_a(&opp.pair, residual, result_a.avg_price).await;
            realized += hedge.pnl;
            spent -= hedge.proceeds;
        }

        self.release(reservation_id, spent).await;
        self.record_result(realized).await;
        self.publish_fill(&opp.pair.yes_token_id, matched, pair_cost, realized);
        info!(
            id = %opp.opportunity_id,
            matched = %matched,
            pair_cost = %pair_cost,
            profit = %realized,
            "arbitrage settled"
        );
    }

    /// MARKET_CLOSE_A: sell the naked leg-A position at market within the
    /// leg-risk deadline.
    async fn hedge_leg_a(&self, pair: &MarketPair, size: Decimal, entry_price: Decimal) -> HedgeOutcome {
        warn!(
            market = %pair.market_id,
            size = %size,
            "LEG_RISK:HEDGE closing leg A at market"
        );
        let bid = self
            .books
            .get(&pair.yes_token_id)
            .and_then(|book| book.best_bid())
            .map(|level| level.price)
            .unwrap_or(entry_price);
        let price = (bid * (Decimal::ONE - self.config.max_slippage)).round_dp(self.config.price_dp);
        let order = OrderRequest {
            token_id: pair.yes_token_id.clone(),
            side: Side::Sell,
            limit_price: price,
            size,
            time_in_force: TimeInForce::Ioc,
            max_slippage_bps: self.slippage_bps(),
        };
        match timeout(
            self.config.leg_risk_timeout,
            submit_with_retry(self.gateway.as_ref(), order, self.config.retry_attempts),
        )
        .await
        {
            Ok(Ok(result)) if result.any_fill() => HedgeOutcome {
                pnl: (result.avg_price - entry_price) * result.filled_size,
                proceeds: result.filled_size * result.avg_price,
            },
            _ => {
                self.publish_agent_alert("leg A hedge did not fill within deadline");
                HedgeOutcome {
                    pnl: Decimal::ZERO,
                    proceeds: Decimal::ZERO,
                }
            }
        }
    }

    fn ioc_buy(
        &self,
        pair: &MarketPair,
        outcome: Outcome,
        best_ask: Decimal,
        size: Decimal,
    ) -> OrderRequest {
        let limit = (best_ask * (Decimal::ONE + self.config.max_slippage))
            .round_dp(self.config.price_dp);
        OrderRequest {
            token_id: pair.token_for(outcome).to_string(),
            side: Side::Buy,
            limit_price: limit,
            size,
            time_in_force: TimeInForce::Ioc,
            max_slippage_bps: self.slippage_bps(),
        }
    }

    fn slippage_bps(&self) -> u32 {
        use rust_decimal::prelude::ToPrimitive;
        (self.config.max_slippage * Decimal::new(10_000, 0))
            .to_u32()
            .unwrap_or(200)
    }

    async fn release(&self, reservation_id: &str, spent: Decimal) {
        if let Err(e) = self
            .budget
            .release_reservation(&self.config.strategy, reservation_id, spent)
            .await
        {
            warn!(error = %e, id = %reservation_id, "reservation release failed");
        }
    }

    async fn record_result(&self, realized: Decimal) {
        if let Err(e) = self
            .budget
            .record_trade_result(&self.config.strategy, realized)
            .await
        {
            warn!(error = %e, "trade metrics update failed");
        }
    }

    fn publish_claim(&self, opp: &ArbOpportunity) {
        let signal = Signal::new(
            self.id.clone(),
            SignalPriority::High,
            Some(60),
            SignalPayload::MarketOpportunity(MarketOpportunity {
                opportunity_id: opp.opportunity_id.clone(),
                opp_kind: OpportunityKind::PureArb,
                market_ids: vec![opp.pair.market_id.clone()],
                token_ids: vec![
                    opp.pair.yes_token_id.clone(),
                    opp.pair.no_token_id.clone(),
                ],
                expected_profit_usd: opp.expected_profit,
                confidence: 1.0,
                claimed_by: Some(self.id.clone()),
            }),
        );
        let _ = self.bus.publish(signal);
    }

    fn publish_fill(&self, token_id: &str, size: Decimal, avg_price: Decimal, realized: Decimal) {
        let signal = Signal::new(
            self.id.clone(),
            SignalPriority::High,
            None,
            SignalPayload::PositionUpdate(PositionUpdate {
                agent: self.id.clone(),
                token_id: token_id.to_string(),
                side: Side::Buy,
                size,
                avg_price,
                realized_pnl: realized,
                unrealized_pnl: Decimal::ZERO,
                note: None,
            }),
        );
        let _ = self.bus.publish(signal);
    }

    /// Denials are published as size-zero position updates for observability.
    fn publish_denial(&self, token_id: &str, reason: &str) {
        let signal = Signal::new(
            self.id.clone(),
            SignalPriority::Medium,
            Some(300),
            SignalPayload::PositionUpdate(PositionUpdate {
                agent: self.id.clone(),
                token_id: token_id.to_string(),
                side: Side::Buy,
                size: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                realized_pnl: Decimal::ZERO,
                unrealized_pnl: Decimal::ZERO,
                note: Some(reason.to_string()),
            }),
        );
        let _ = self.bus.publish(signal);
    }

    fn publish_agent_alert(&self, reason: &str) {
        let signal = Signal::new(
            self.id.clone(),
            SignalPriority::High,
            Some(600),
            SignalPayload::RiskAlert(RiskAlert {
                severity: AlertSeverity::High,
                scope: AlertScope::Agent,
                reason: reason.to_string(),
            }),
        );
        let _ = self.bus.publish(signal);
    }
}

#[async_trait]
impl Agent for ArbitrageAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(self: Arc<Self>, mut ctx: AgentContext) -> Result<(), AgentError> {
        self.install_subscriptions();
        info!(agent = %self.id, pairs = self.pairs.read().len(), "arbitrage agent online");
        loop {
            ctx.beat(&self.id);
            tokio::select! {
                _ = ctx.shutdown.recv() => break,
                _ = tokio::time::sleep(self.scan_interval()) => {}
            }
            // Once an opportunity is in flight the legs run to completion;
            // cancellation is only observed between scans.
            if let Some(opp) = self.detect_best().await {
                self.execute_opportunity(&opp).await;
            }
        }
        self.stop().await;
        info!(agent = %self.id, "arbitrage agent stopped");
        Ok(())
    }

    async fn stop(&self) {
        let handles: Vec<SubscriptionHandle> = self.subscriptions.lock().drain(..).collect();
        for handle in handles {
            self.bus.unsubscribe(handle);
        }
    }

    fn handle_signal(&self, signal: Arc<Signal>) {
        match &signal.payload {
            SignalPayload::NewsEvent(_) => self.update_boost(),
            SignalPayload::MarketOpportunity(opp) => {
                if let Some(owner) = &opp.claimed_by {
                    if owner != &self.id {
                        self.externally_claimed
                            .insert(opp.opportunity_id.clone(), signal.timestamp);
                    }
                }
            }
            _ => {}
        }
    }
}
