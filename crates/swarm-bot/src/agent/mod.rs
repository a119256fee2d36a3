//! Agent abstraction and lifecycle plumbing.
//!
//! Agents are polymorphic over `{run, stop, handle_signal}` plus the
//! heartbeat side channel carried in `AgentContext`. The supervisor owns
//! spawning, heartbeat monitoring, restarts, and shutdown.

pub mod arbitrage;
pub mod supervisor;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::budget::BudgetError;
use crate::gateway::GatewayError;
use crate::signal::{BusError, Signal};

pub use arbitrage::{ArbConfig, ArbOpportunity, ArbitrageAgent};

/// Errors an agent's run loop can surface to the supervisor.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("agent failed: {0}")]
    Fatal(String),
}

/// Liveness beat published by an agent on its side channel.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub agent_id: String,
    pub at: DateTime<Utc>,
}

/// Per-agent runtime handles provided by the supervisor.
pub struct AgentContext {
    /// Resolved on swarm shutdown.
    pub shutdown: broadcast::Receiver<()>,
    /// Heartbeat side channel to the supervisor.
    pub heartbeat: mpsc::Sender<Heartbeat>,
}

impl AgentContext {
    /// Emit a heartbeat. Never blocks; a full channel drops the beat.
    pub fn beat(&self, agent_id: &str) {
        let _ = self.heartbeat.try_send(Heartbeat {
            agent_id: agent_id.to_string(),
            at: Utc::now(),
        });
    }
}

/// A strategy agent scheduled by the supervisor.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Stable agent identifier (also the heartbeat key).
    fn id(&self) -> &str;

    /// Main loop. Must honor `ctx.shutdown` and beat regularly.
    async fn run(self: Arc<Self>, ctx: AgentContext) -> Result<(), AgentError>;

    /// Graceful teardown: release reservations, unsubscribe from the bus.
    /// The supervisor calls this before dropping the agent.
    async fn stop(&self);

    /// Inline signal delivery. Runs on the bus dispatch task; must not block.
    fn handle_signal(&self, signal: Arc<Signal>);
}
