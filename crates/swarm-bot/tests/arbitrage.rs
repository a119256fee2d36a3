//! Integration tests for the arbitrage agent's two-leg state machine.
//!
//! A scripted gateway plays back fills and rejections so the happy path,
//! the leg-risk hedge, denial paths, and tie-breaking are all exercised
//! deterministically.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use swarm_bot::agent::{ArbConfig, ArbitrageAgent};
use swarm_bot::budget::{
    BudgetConfig, BudgetManager, CoordinationFault, StaticNonceSource,
};
use swarm_bot::gateway::{
    CancelResult, GatewayError, OrderGateway, OrderRequest, OrderResult, OrderStatus,
};
use swarm_bot::risk::circuit_breaker::CircuitBreakerConfig;
use swarm_bot::risk::{CircuitBreaker, RiskController, RiskLimits};
use swarm_bot::signal::{BusConfig, SignalBus, SignalKind, SignalPayload};
use swarm_bot::store::MemoryStore;
use swarm_common::{MarketPair, PriceLevel, Side};
use swarm_market::{OrderBookReplica, ReplicaMap};

/// Gateway that plays back a script of responses and records submissions.
struct ScriptedGateway {
    script: Mutex<VecDeque<Result<OrderResult, GatewayError>>>,
    submitted: Mutex<Vec<OrderRequest>>,
}

impl ScriptedGateway {
    fn new(script: Vec<Result<OrderResult, GatewayError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            submitted: Mutex::new(Vec::new()),
        })
    }

    fn submissions(&self) -> Vec<OrderRequest> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl OrderGateway for ScriptedGateway {
    async fn submit(&self, order: OrderRequest) -> Result<OrderResult, GatewayError> {
        self.submitted.lock().push(order);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Temporary("script exhausted".into())))
    }

    async fn cancel(&self, _order_id: &str) -> Result<CancelResult, GatewayError> {
        Ok(CancelResult {
            status: "CANCELLED".into(),
        })
    }
}

fn fill(id: &str, size: Decimal, price: Decimal) -> Result<OrderResult, GatewayError> {
    Ok(OrderResult {
        order_id: id.into(),
        status: OrderStatus::Filled,
        filled_size: size,
        avg_price: price,
    })
}

fn rejected(id: &str) -> Result<OrderResult, GatewayError> {
    Ok(OrderResult {
        order_id: id.into(),
        status: OrderStatus::Rejected,
        filled_size: Decimal::ZERO,
        avg_price: Decimal::ZERO,
    })
}

fn pair(market_id: &str) -> MarketPair {
    MarketPair {
        market_id: market_id.into(),
        question: format!("Will {market_id} settle YES?"),
        yes_token_id: format!("{market_id}-yes"),
        no_token_id: format!("{market_id}-no"),
        end_date: None,
    }
}

fn set_book(books: &ReplicaMap, token: &str, bid: Option<PriceLevel>, ask: PriceLevel) {
    let mut replica = OrderBookReplica::new();
    let bids: Vec<PriceLevel> = bid.into_iter().collect();
    replica.apply_snapshot(&bids, &[ask]);
    books.insert(token.to_string(), replica);
}

struct Harness {
    bus: SignalBus,
    budget: Arc<BudgetManager>,
    risk: Arc<RiskController>,
    books: ReplicaMap,
}

async fn harness() -> Harness {
    let bus = SignalBus::new(BusConfig::default());
    let budget = Arc::new(BudgetManager::new(
        Arc::new(MemoryStore::new()),
        BudgetConfig::default(),
        CoordinationFault::new(),
        Arc::new(StaticNonceSource::default()),
    ));
    budget.seed(dec!(1000), false).await.unwrap();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
    let risk = RiskController::new(RiskLimits::default(), breaker, bus.clone(), budget.clone());
    risk.start();
    let books: ReplicaMap = Arc::new(DashMap::new());
    Harness {
        bus,
        budget,
        risk,
        books,
    }
}

fn arb_config() -> ArbConfig {
    ArbConfig {
        min_profit_per_unit: dec!(0.02),
        size_cap: dec!(50),
        leg_risk_timeout: Duration::from_secs(5),
        ..ArbConfig::default()
    }
}

fn agent_with(h: &Harness, gateway: Arc<ScriptedGateway>, pairs: Vec<MarketPair>) -> Arc<ArbitrageAgent> {
    ArbitrageAgent::new(
        arb_config(),
        h.bus.clone(),
        h.budget.clone(),
        h.risk.clone(),
        gateway,
        h.books.clone(),
        pairs,
    )
}

// ============================================================================
// Happy path
// ============================================================================

// YES ask 0.48x100, NO ask 0.49x100, cap 50, fees+gas 0: reserve 48.5,
// buy both legs IOC at 0.4896/0.4998, settle with +1.50 realized.
#[tokio::test]
async fn pure_arb_happy_path() {
    let h = harness().await;
    let p = pair("m1");
    set_book(&h.books, "m1-yes", None, PriceLevel::new(dec!(0.48), dec!(100)));
    set_book(&h.books, "m1-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    let gateway = ScriptedGateway::new(vec![
        fill("a", dec!(50), dec!(0.48)),
        fill("b", dec!(50), dec!(0.49)),
    ]);
    let agent = agent_with(&h, gateway.clone(), vec![p]);

    let opp = agent.detect_best().await.expect("opportunity visible");
    assert_eq!(opp.size, dec!(50));
    assert_eq!(opp.expected_profit, dec!(1.5));
    assert_eq!(opp.notional(), dec!(48.5));

    agent.execute_opportunity(&opp).await;

    let orders = gateway.submissions();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].token_id, "m1-yes");
    assert_eq!(orders[0].limit_price, dec!(0.4896));
    assert_eq!(orders[0].size, dec!(50));
    assert_eq!(orders[1].token_id, "m1-no");
    assert_eq!(orders[1].limit_price, dec!(0.4998));
    assert_eq!(orders[1].size, dec!(50));

    // Reservation fully spent, ledger conserved.
    let snapshot = h.budget.snapshot().await.unwrap();
    assert!(snapshot.reservations.is_empty());
    assert_eq!(snapshot.executed, dec!(48.5));
    assert_eq!(snapshot.balances["arb"], dec!(351.5));
    assert_eq!(snapshot.committed_total(), dec!(1000));

    // Position update carries the realized profit.
    let updates = h.bus.recent(SignalKind::PositionUpdate, Duration::from_secs(60));
    let update = updates
        .iter()
        .find_map(|s| match &s.payload {
            SignalPayload::PositionUpdate(u) if u.size > Decimal::ZERO => Some(u.clone()),
            _ => None,
        })
        .expect("fill update published");
    assert_eq!(update.realized_pnl, dec!(1.50));
    assert_eq!(update.size, dec!(50));

    // Claim released after settlement.
    assert!(h.bus.claim(&opp.opportunity_id, "someone-else"));

    let metrics = h.budget.metrics("arb").await.unwrap();
    assert_eq!(metrics.trades, 1);
    assert_eq!(metrics.wins, 1);
    assert_eq!(metrics.realized_pnl, dec!(1.50));
}

// ============================================================================
// Leg risk
// ============================================================================

// Leg B rejects after leg A fills: the naked leg is closed at market
// within the deadline and the loss is reported; the breaker stays closed.
#[tokio::test]
async fn leg_b_rejection_forces_market_close() {
    let h = harness().await;
    let p = pair("m1");
    set_book(
        &h.books,
        "m1-yes",
        Some(PriceLevel::new(dec!(0.47), dec!(200))),
        PriceLevel::new(dec!(0.48), dec!(100)),
    );
    set_book(&h.books, "m1-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    let gateway = ScriptedGateway::new(vec![
        fill("a", dec!(50), dec!(0.48)),
        rejected("b"),
        // MARKET_CLOSE_A fills at 0.46.
        fill("hedge", dec!(50), dec!(0.46)),
    ]);
    let agent = agent_with(&h, gateway.clone(), vec![p]);

    let opp = agent.detect_best().await.unwrap();
    agent.execute_opportunity(&opp).await;

    let orders = gateway.submissions();
    assert_eq!(orders.len(), 3);
    assert_eq!(orders[2].token_id, "m1-yes");
    assert_eq!(orders[2].side, Side::Sell);
    assert_eq!(orders[2].size, dec!(50));

    // Net spend 24 - 23 = 1; loss -1 recorded; ledger conserved.
    let snapshot = h.budget.snapshot().await.unwrap();
    assert!(snapshot.reservations.is_empty());
    assert_eq!(snapshot.executed, dec!(1));
    assert_eq!(snapshot.committed_total(), dec!(1000));

    let metrics = h.budget.metrics("arb").await.unwrap();
    assert_eq!(metrics.losses, 1);
    assert_eq!(metrics.realized_pnl, dec!(-1));

    let updates = h.bus.recent(SignalKind::PositionUpdate, Duration::from_secs(60));
    let realized: Vec<Decimal> = updates
        .iter()
        .filter_map(|s| match &s.payload {
            SignalPayload::PositionUpdate(u) => Some(u.realized_pnl),
            _ => None,
        })
        .collect();
    assert!(realized.contains(&dec!(-1)));

    // A single hedged loss stays far below the daily limit.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.risk.breaker().is_tripped());
}

// After any leg-A fill the exposure is bounded: either leg B offsets it or
// the market close does, even when the hedge needs the order book's bid.
#[tokio::test]
async fn partial_leg_b_fill_hedges_residual() {
    let h = harness().await;
    let p = pair("m1");
    set_book(
        &h.books,
        "m1-yes",
        Some(PriceLevel::new(dec!(0.47), dec!(200))),
        PriceLevel::new(dec!(0.48), dec!(100)),
    );
    set_book(&h.books, "m1-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    let gateway = ScriptedGateway::new(vec![
        fill("a", dec!(50), dec!(0.48)),
        // Leg B fills only 30 of 50.
        Ok(OrderResult {
            order_id: "b".into(),
            status: OrderStatus::PartiallyFilled,
            filled_size: dec!(30),
            avg_price: dec!(0.49),
        }),
        fill("hedge", dec!(20), dec!(0.46)),
    ]);
    let agent = agent_with(&h, gateway.clone(), vec![p]);

    let opp = agent.detect_best().await.unwrap();
    agent.execute_opportunity(&opp).await;

    let orders = gateway.submissions();
    assert_eq!(orders.len(), 3);
    assert_eq!(orders[2].side, Side::Sell);
    assert_eq!(orders[2].size, dec!(20));

    // 30 matched pairs profit 0.03 each, 20 residual lose 0.02 each.
    let metrics = h.budget.metrics("arb").await.unwrap();
    assert_eq!(metrics.realized_pnl, dec!(0.90) - dec!(0.40));
    let snapshot = h.budget.snapshot().await.unwrap();
    assert_eq!(snapshot.committed_total(), dec!(1000));
}

// ============================================================================
// Denials and rejections
// ============================================================================

// An unfilled IOC on leg A aborts: reservation returned, no second order.
#[tokio::test]
async fn unfilled_leg_a_aborts_cleanly() {
    let h = harness().await;
    let p = pair("m1");
    set_book(&h.books, "m1-yes", None, PriceLevel::new(dec!(0.48), dec!(100)));
    set_book(&h.books, "m1-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    let gateway = ScriptedGateway::new(vec![rejected("a")]);
    let agent = agent_with(&h, gateway.clone(), vec![p]);

    let opp = agent.detect_best().await.unwrap();
    agent.execute_opportunity(&opp).await;

    assert_eq!(gateway.submissions().len(), 1);
    let snapshot = h.budget.snapshot().await.unwrap();
    assert!(snapshot.reservations.is_empty());
    assert_eq!(snapshot.executed, Decimal::ZERO);
    assert_eq!(snapshot.balances["arb"], dec!(400));
    // Claim released on abort.
    assert!(h.bus.claim(&opp.opportunity_id, "someone-else"));
}

// Capital committed between detection and reservation: the request is
// denied, no order is submitted, and a size-zero denial update appears.
#[tokio::test]
async fn budget_denial_skips_execution() {
    let h = harness().await;
    let p = pair("m1");
    set_book(&h.books, "m1-yes", None, PriceLevel::new(dec!(0.48), dec!(100)));
    set_book(&h.books, "m1-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    let gateway = ScriptedGateway::new(vec![]);
    let agent = agent_with(&h, gateway.clone(), vec![p]);

    // Sized against the full 400 headroom.
    let opp = agent.detect_best().await.unwrap();
    assert_eq!(opp.size, dec!(50));

    // Another opportunity drains the allocation before this one reserves.
    h.budget
        .request_reservation("arb", dec!(390), swarm_bot::budget::ReservePriority::Normal)
        .await
        .unwrap();

    agent.execute_opportunity(&opp).await;

    assert!(gateway.submissions().is_empty());
    let updates = h.bus.recent(SignalKind::PositionUpdate, Duration::from_secs(60));
    let denial = updates
        .iter()
        .find_map(|s| match &s.payload {
            SignalPayload::PositionUpdate(u) if u.note.is_some() => Some(u.clone()),
            _ => None,
        })
        .expect("denial update published");
    assert_eq!(denial.size, Decimal::ZERO);
}

// With the allocation exhausted up front, detection sizes to the remaining
// headroom instead of surfacing an unaffordable opportunity.
#[tokio::test]
async fn detection_sizes_to_budget_headroom() {
    let h = harness().await;
    let p = pair("m1");
    set_book(&h.books, "m1-yes", None, PriceLevel::new(dec!(0.48), dec!(100)));
    set_book(&h.books, "m1-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    let gateway = ScriptedGateway::new(vec![]);
    let agent = agent_with(&h, gateway, vec![p]);

    // Leave 20 in the arb allocation: floor(20 / 0.97) = 20 units.
    h.budget
        .request_reservation("arb", dec!(380), swarm_bot::budget::ReservePriority::Normal)
        .await
        .unwrap();
    let opp = agent.detect_best().await.unwrap();
    assert_eq!(opp.size, dec!(20));
    assert_eq!(opp.notional(), dec!(19.40));

    // Fully drained: nothing tradable is surfaced at all.
    h.budget
        .request_reservation("arb", dec!(20), swarm_bot::budget::ReservePriority::Normal)
        .await
        .unwrap();
    assert!(agent.detect_best().await.is_none());
}

// No opportunity exists when the pair sums above the edge threshold.
#[tokio::test]
async fn no_opportunity_without_edge() {
    let h = harness().await;
    let p = pair("m1");
    set_book(&h.books, "m1-yes", None, PriceLevel::new(dec!(0.50), dec!(100)));
    set_book(&h.books, "m1-no", None, PriceLevel::new(dec!(0.50), dec!(100)));
    let gateway = ScriptedGateway::new(vec![]);
    let agent = agent_with(&h, gateway, vec![p]);
    assert!(agent.detect_best().await.is_none());
}

// ============================================================================
// Tie-breaking
// ============================================================================

// Higher absolute expected profit wins; equal profit falls back to the
// tighter pair cost, then to the lexicographically smaller market ID.
#[tokio::test]
async fn tie_breaks_are_deterministic() {
    let h = harness().await;
    let pairs = vec![pair("m-a"), pair("m-b")];
    let gateway = ScriptedGateway::new(vec![]);
    let agent = agent_with(&h, gateway, pairs);

    // m-b has the larger edge: picked on profit.
    set_book(&h.books, "m-a-yes", None, PriceLevel::new(dec!(0.48), dec!(100)));
    set_book(&h.books, "m-a-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    set_book(&h.books, "m-b-yes", None, PriceLevel::new(dec!(0.47), dec!(100)));
    set_book(&h.books, "m-b-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    assert_eq!(agent.detect_best().await.unwrap().pair.market_id, "m-b");

    // Equal profit and equal pair cost: lexicographic market ID.
    set_book(&h.books, "m-a-yes", None, PriceLevel::new(dec!(0.48), dec!(100)));
    set_book(&h.books, "m-a-no", None, PriceLevel::new(dec!(0.48), dec!(100)));
    assert_eq!(agent.detect_best().await.unwrap().pair.market_id, "m-a");
}

// The size cap and the thinner side both bound the executable size.
#[tokio::test]
async fn executable_size_is_min_of_depth_and_cap() {
    let h = harness().await;
    let p = pair("m1");
    set_book(&h.books, "m1-yes", None, PriceLevel::new(dec!(0.48), dec!(30)));
    set_book(&h.books, "m1-no", None, PriceLevel::new(dec!(0.49), dec!(100)));
    let gateway = ScriptedGateway::new(vec![]);
    let agent = agent_with(&h, gateway, vec![p]);
    assert_eq!(agent.detect_best().await.unwrap().size, dec!(30));
}
