//! Agent lifecycle supervisor.
//!
//! Spawns each agent as an independent task, monitors heartbeats, restarts
//! crashed or silent agents with exponential backoff, quarantines agents
//! that restart too often, and coordinates shutdown: broadcast the stop,
//! give agents a grace period to unwind, then abort stragglers and emit a
//! final ledger/bus snapshot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::budget::{BudgetManager, CoordinationFault};
use crate::risk::RiskController;
use crate::signal::{
    AlertScope, AlertSeverity, RiskAlert, Signal, SignalBus, SignalPayload, SignalPriority,
};

use super::{Agent, AgentContext, AgentError, Heartbeat};

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Expected heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Heartbeats missed before an agent is considered dead.
    pub missed_heartbeats: u32,
    /// Initial restart backoff.
    pub restart_base: Duration,
    /// Maximum restart backoff.
    pub restart_max: Duration,
    /// Restarts tolerated within `restart_window` before quarantine.
    pub max_restarts: usize,
    /// Window for counting restarts.
    pub restart_window: Duration,
    /// Grace period for agents to unwind on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats: 3,
            restart_base: Duration::from_secs(5),
            restart_max: Duration::from_secs(60),
            max_restarts: 5,
            restart_window: Duration::from_secs(15 * 60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Why the supervisor returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// All agents finished or an operator stop was requested.
    Clean,
    /// SIGINT.
    Interrupted,
    /// An agent exhausted its restart budget.
    Quarantined { agent: String },
    /// Coordination fault (lost lock, ledger corruption, nonce regression).
    Fault,
}

impl SupervisorOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorOutcome::Clean => 0,
            SupervisorOutcome::Interrupted => 130,
            SupervisorOutcome::Quarantined { .. } | SupervisorOutcome::Fault => 3,
        }
    }
}

struct Slot {
    agent: Arc<dyn Agent>,
    handle: Option<JoinHandle<Result<(), AgentError>>>,
    last_beat: Instant,
    restarts: VecDeque<Instant>,
    backoff: Duration,
    restart_at: Option<Instant>,
    quarantined: bool,
    finished: bool,
}

/// Starts agents, monitors liveness, coordinates shutdown.
pub struct AgentSupervisor {
    config: SupervisorConfig,
    bus: SignalBus,
    budget: Arc<BudgetManager>,
    risk: Arc<RiskController>,
    fault: Arc<CoordinationFault>,
    shutdown_tx: broadcast::Sender<()>,
    stop_tx: broadcast::Sender<()>,
}

impl AgentSupervisor {
    pub fn new(
        config: SupervisorConfig,
        bus: SignalBus,
        budget: Arc<BudgetManager>,
        risk: Arc<RiskController>,
        fault: Arc<CoordinationFault>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let (stop_tx, _) = broadcast::channel(4);
        Self {
            config,
            bus,
            budget,
            risk,
            fault,
            shutdown_tx,
            stop_tx,
        }
    }

    /// Shutdown broadcast for auxiliary tasks (stream, janitor).
    pub fn shutdown_subscriber(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Operator stop handle: a send shuts the swarm down cleanly.
    pub fn stopper(&self) -> broadcast::Sender<()> {
        self.stop_tx.clone()
    }

    /// Run the swarm until completion, SIGINT, quarantine, or fault.
    pub async fn run(&self, agents: Vec<Arc<dyn Agent>>) -> SupervisorOutcome {
        let (hb_tx, mut hb_rx) = mpsc::channel::<Heartbeat>(256);
        let mut slots: Vec<Slot> = agents
            .into_iter()
            .map(|agent| Slot {
                agent,
                handle: None,
                last_beat: Instant::now(),
                restarts: VecDeque::new(),
                backoff: self.config.restart_base,
                restart_at: None,
                quarantined: false,
                finished: false,
            })
            .collect();
        for slot in &mut slots {
            self.spawn_slot(slot, &hb_tx);
        }
        info!(agents = slots.len(), "supervisor online");

        let mut stop_rx = self.stop_tx.subscribe();
        let mut check = tokio::time::interval(self.config.heartbeat_interval);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!(error = %e, "signal handler failed");
                    }
                    info!("SIGINT received, shutting down");
                    break SupervisorOutcome::Interrupted;
                }
                _ = stop_rx.recv() => {
                    info!("operator stop requested");
                    break SupervisorOutcome::Clean;
                }
                _ = self.fault.wait() => {
                    break SupervisorOutcome::Fault;
                }
                Some(beat) = hb_rx.recv() => {
                    if let Some(slot) = slots.iter_mut().find(|s| s.agent.id() == beat.agent_id) {
                        slot.last_beat = Instant::now();
                    }
                }
                _ = check.tick() => {
                    if let Some(agent) = self.sweep(&mut slots, &hb_tx).await {
                        break SupervisorOutcome::Quarantined { agent };
                    }
                    if slots.iter().all(|s| s.finished || s.quarantined) {
                        info!("all agents finished");
                        break SupervisorOutcome::Clean;
                    }
                }
            }
        };

        self.shutdown(&mut slots).await;
        outcome
    }

    fn spawn_slot(&self, slot: &mut Slot, hb_tx: &mpsc::Sender<Heartbeat>) {
        let ctx = AgentContext {
            shutdown: self.shutdown_tx.subscribe(),
            heartbeat: hb_tx.clone(),
        };
        slot.handle = Some(tokio::spawn(slot.agent.clone().run(ctx)));
        slot.last_beat = Instant::now();
        slot.finished = false;
    }

    /// One liveness pass. Returns an agent ID if it was just quarantined.
    async fn sweep(
        &self,
        slots: &mut Vec<Slot>,
        hb_tx: &mpsc::Sender<Heartbeat>,
    ) -> Option<String> {
        let now = Instant::now();
        let stale_after = self.config.heartbeat_interval * self.config.missed_heartbeats;

        for slot in slots.iter_mut() {
            if slot.quarantined || slot.finished {
                continue;
            }
            if let Some(at) = slot.restart_at {
                if now >= at {
                    slot.restart_at = None;
                    info!(agent = slot.agent.id(), "restarting agent");
                    self.spawn_slot(slot, hb_tx);
                }
                continue;
            }

            let finished = slot.handle.as_ref().map_or(true, |h| h.is_finished());
            if finished {
                let result = match slot.handle.take() {
                    Some(handle) => handle.await,
                    None => continue,
                };
                match result {
                    Ok(Ok(())) => {
                        slot.finished = true;
                        info!(agent = slot.agent.id(), "agent completed");
                        continue;
                    }
                    Ok(Err(e)) => {
                        warn!(agent = slot.agent.id(), error = %e, "agent failed");
                    }
                    Err(e) => {
                        warn!(agent = slot.agent.id(), error = %e, "agent task panicked");
                    }
                }
            } else if now.duration_since(slot.last_beat) > stale_after {
                warn!(agent = slot.agent.id(), "missed heartbeats, cancelling task");
                if let Some(handle) = slot.handle.take() {
                    handle.abort();
                }
            } else {
                continue;
            }

            // Restart path: record, prune the window, quarantine if exhausted.
            slot.restarts.push_back(now);
            while matches!(slot.restarts.front(), Some(t) if now.duration_since(*t) > self.config.restart_window)
            {
                slot.restarts.pop_front();
            }
            if slot.restarts.len() > self.config.max_restarts {
                slot.quarantined = true;
                let agent = slot.agent.id().to_string();
                error!(agent = %agent, "agent quarantined after repeated restarts");
                self.publish_quarantine_alert(&agent);
                return Some(agent);
            }
            if slot.restarts.len() == 1 {
                slot.backoff = self.config.restart_base;
            }
            slot.restart_at = Some(now + slot.backoff);
            slot.backoff = (slot.backoff * 2).min(self.config.restart_max);
        }
        None
    }

    async fn shutdown(&self, slots: &mut Vec<Slot>) {
        let _ = self.shutdown_tx.send(());
        let deadline = Instant::now() + self.config.shutdown_grace;

        for slot in slots.iter_mut() {
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!(agent = slot.agent.id(), "grace period elapsed, aborting task");
                abort.abort();
            }
        }

        // Unsubscribe agents from the bus before dropping them.
        for slot in slots.iter() {
            slot.agent.stop().await;
        }
        self.risk.stop();

        match self.budget.snapshot().await {
            Ok(snapshot) => {
                info!(
                    balances = ?snapshot.balances,
                    outstanding = snapshot.reservations.len(),
                    executed = %snapshot.executed,
                    "final ledger snapshot"
                );
            }
            Err(e) => warn!(error = %e, "final snapshot unavailable"),
        }
        let counters = self.bus.counters();
        info!(
            published = counters.published,
            delivered = counters.delivered,
            dropped_low = counters.dropped_low,
            callback_errors = counters.callback_errors,
            "final bus counters"
        );
    }

    fn publish_quarantine_alert(&self, agent: &str) {
        let signal = Signal::new(
            "supervisor",
            SignalPriority::Critical,
            None,
            SignalPayload::RiskAlert(RiskAlert {
                severity: AlertSeverity::High,
                scope: AlertScope::Agent,
                reason: format!("agent {agent} quarantined after repeated restarts"),
            }),
        );
        if let Err(e) = self.bus.publish(signal) {
            warn!(error = %e, "failed to publish quarantine alert");
        }
    }
}
