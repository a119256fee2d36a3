//! Risk controller.
//!
//! Enforces the portfolio limits the budget manager alone cannot express,
//! gates signal-driven strategies on signal quality, and owns the circuit
//! breaker. Positions are tracked by subscribing to `POSITION_UPDATE`
//! signals; the `realized_pnl` on each update is the delta attributable to
//! that event.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{info, warn};

use swarm_common::Side;

use crate::budget::BudgetManager;
use crate::signal::{
    AlertScope, AlertSeverity, RiskAlert, Signal, SignalBus, SignalKind, SignalPayload,
    SignalPriority, SubscriptionHandle,
};

use super::circuit_breaker::CircuitBreaker;

/// Portfolio limit configuration.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Max notional per position (USD).
    pub max_position_size_usd: Decimal,
    /// Max notional across all agents (USD).
    pub max_total_exposure_usd: Decimal,
    /// Max notional per underlying entity (USD).
    pub max_entity_exposure_usd: Decimal,
    /// Max open positions per agent.
    pub max_positions_per_agent: usize,
    /// Max aggregate daily loss (USD).
    pub max_daily_loss_usd: Decimal,
    /// Minimum |signal_strength| for signal-gated strategies.
    pub min_signal_quality: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_usd: Decimal::new(200, 0),
            max_total_exposure_usd: Decimal::new(800, 0),
            max_entity_exposure_usd: Decimal::new(400, 0),
            max_positions_per_agent: 5,
            max_daily_loss_usd: Decimal::new(100, 0),
            min_signal_quality: 0.6,
        }
    }
}

/// A prospective entry submitted for approval.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub agent: String,
    pub token_id: String,
    /// Underlying entity (e.g. "Bitcoin").
    pub entity: String,
    /// Notional value of the prospective position (USD).
    pub notional_usd: Decimal,
    /// Whether this strategy is gated on signal quality.
    pub signal_gated: bool,
}

/// Outcome of `evaluate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDecision {
    Approve,
    Deny { reason: String },
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approve)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            RiskDecision::Approve => None,
            RiskDecision::Deny { reason } => Some(reason),
        }
    }
}

/// An open position as seen by the risk controller.
#[derive(Debug, Clone)]
pub struct TrackedPosition {
    pub agent: String,
    pub token_id: String,
    pub entity: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl TrackedPosition {
    /// Notional exposure of the position.
    pub fn exposure(&self) -> Decimal {
        self.size * self.avg_price
    }
}

/// Portfolio risk controller.
pub struct RiskController {
    limits: RiskLimits,
    breaker: CircuitBreaker,
    bus: SignalBus,
    budget: Arc<BudgetManager>,
    /// Open positions keyed `agent:token_id`.
    positions: DashMap<String, TrackedPosition>,
    /// Token-to-entity mapping registered by agents.
    entities: DashMap<String, String>,
    subscription: parking_lot::Mutex<Option<SubscriptionHandle>>,
}

impl RiskController {
    pub fn new(
        limits: RiskLimits,
        breaker: CircuitBreaker,
        bus: SignalBus,
        budget: Arc<BudgetManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            limits,
            breaker,
            bus,
            budget,
            positions: DashMap::new(),
            entities: DashMap::new(),
            subscription: parking_lot::Mutex::new(None),
        })
    }

    /// Subscribe to position updates. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let handle = self
            .bus
            .subscribe(SignalKind::PositionUpdate, "risk-controller", move |signal| {
                controller.on_position_update(&signal);
            });
        *self.subscription.lock() = Some(handle);
    }

    /// Unsubscribe from the bus. Called by the supervisor on shutdown.
    pub fn stop(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            self.bus.unsubscribe(handle);
        }
    }

    /// Map a token to its underlying entity for exposure accounting.
    pub fn register_entity(&self, token_id: &str, entity: &str) {
        self.entities.insert(token_id.to_string(), entity.to_string());
    }

    fn entity_of(&self, token_id: &str) -> String {
        self.entities
            .get(token_id)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| token_id.to_string())
    }

    fn on_position_update(&self, signal: &Signal) {
        let SignalPayload::PositionUpdate(update) = &signal.payload else {
            return;
        };
        // Size-zero updates with a note are denial observability, not fills.
        if update.size == Decimal::ZERO && update.note.is_some() {
            return;
        }
        let key = format!("{}:{}", update.agent, update.token_id);
        if update.size == Decimal::ZERO {
            self.positions.remove(&key);
        } else {
            self.positions.insert(
                key,
                TrackedPosition {
                    agent: update.agent.clone(),
                    token_id: update.token_id.clone(),
                    entity: self.entity_of(&update.token_id),
                    side: update.side,
                    size: update.size,
                    avg_price: update.avg_price,
                    unrealized_pnl: update.unrealized_pnl,
                },
            );
        }
        if update.realized_pnl != Decimal::ZERO {
            self.record_realized(update.realized_pnl);
        } else {
            self.refresh_unrealized();
        }
    }

    /// Feed one realized P&L event into the breaker; publishes the CRITICAL
    /// alert and freezes the budget on a fresh trip.
    pub fn record_realized(&self, pnl: Decimal) {
        if self.breaker.record_realized(pnl) {
            self.on_trip();
        }
        self.refresh_unrealized();
    }

    fn refresh_unrealized(&self) {
        let unrealized: Decimal = self
            .positions
            .iter()
            .map(|p| p.value().unrealized_pnl)
            .sum();
        if self.breaker.set_unrealized(unrealized) {
            self.on_trip();
        }
    }

    fn on_trip(&self) {
        self.budget.refuse_new_reservations();
        let reason = self
            .breaker
            .trip_reason()
            .unwrap_or_else(|| "circuit breaker tripped".into());
        let alert = Signal::new(
            "risk-controller",
            SignalPriority::Critical,
            None,
            SignalPayload::RiskAlert(RiskAlert {
                severity: AlertSeverity::Critical,
                scope: AlertScope::Portfolio,
                reason,
            }),
        );
        if let Err(e) = self.bus.publish(alert) {
            warn!(error = %e, "failed to publish circuit breaker alert");
        }
    }

    /// Manual breaker reset by an operator; resumes reservations.
    pub fn reset_breaker(&self, operator: &str) {
        self.breaker.reset(operator);
        self.budget.allow_new_reservations();
        info!(operator, "risk controller resumed after manual reset");
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Decide whether a prospective entry may proceed.
    pub fn evaluate(&self, request: &EntryRequest) -> RiskDecision {
        if self.breaker.is_tripped() {
            return self.deny(request, "circuit breaker open");
        }

        if request.notional_usd > self.limits.max_position_size_usd {
            return self.deny(request, "max_position_size_usd exceeded");
        }

        let total: Decimal = self.positions.iter().map(|p| p.value().exposure()).sum();
        if total + request.notional_usd > self.limits.max_total_exposure_usd {
            return self.deny(request, "max_total_exposure_usd exceeded");
        }

        let entity_total: Decimal = self
            .positions
            .iter()
            .filter(|p| p.value().entity == request.entity)
            .map(|p| p.value().exposure())
            .sum();
        if entity_total + request.notional_usd > self.limits.max_entity_exposure_usd {
            return self.deny(request, "max_entity_exposure_usd exceeded");
        }

        let agent_positions = self
            .positions
            .iter()
            .filter(|p| p.value().agent == request.agent)
            .count();
        if agent_positions + 1 > self.limits.max_positions_per_agent {
            return self.deny(request, "max_positions_per_agent exceeded");
        }

        if self.breaker.daily_loss() > self.limits.max_daily_loss_usd {
            return self.deny(request, "max_daily_loss_usd exceeded");
        }

        if request.signal_gated {
            let strength = self.bus.signal_strength(&request.entity).abs();
            if strength < self.limits.min_signal_quality {
                return self.deny(request, "low signal quality");
            }
        }

        RiskDecision::Approve
    }

    fn deny(&self, request: &EntryRequest, reason: &str) -> RiskDecision {
        info!(
            agent = %request.agent,
            token = %request.token_id,
            notional = %request.notional_usd,
            reason,
            "DENY:RISK entry denied"
        );
        RiskDecision::Deny {
            reason: reason.to_string(),
        }
    }

    /// Open positions snapshot.
    pub fn positions(&self) -> Vec<TrackedPosition> {
        self.positions.iter().map(|p| p.value().clone()).collect()
    }
}
