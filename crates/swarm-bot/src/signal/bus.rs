//! In-process signal bus.
//!
//! Low-latency fan-out of immutable `Signal` records with per-kind bounded
//! history, TTL eviction, priority-aware delivery, and opportunity claims.
//!
//! ## Scheduling
//!
//! `publish` appends to history and hands the signal to a dedicated dispatch
//! task over an unbounded channel; it never waits on subscribers. Subscriber
//! callbacks run on the dispatch task in registration order and MUST NOT
//! block. A panicking callback is isolated and counted; a callback exceeding
//! the soft budget is flagged for the risk controller but stays registered.
//!
//! ## Back-pressure
//!
//! When the dispatch queue is deeper than `dispatch_high_water`, LOW-priority
//! signals are shed from delivery (never from history). HIGH and CRITICAL
//! are never shed.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::types::{
    GlobalSentiment, HotToken, NewsEvent, Signal, SignalKind, SignalPayload, SignalPriority,
    WhaleMove,
};

/// Errors from the signal bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("malformed signal: {0}")]
    Malformed(String),

    #[error("dispatch task is gone")]
    DispatcherClosed,
}

/// Configuration for the signal bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-kind ring buffer length.
    pub history_capacity: usize,
    /// Soft per-callback time budget; slower subscribers are flagged.
    pub callback_budget: Duration,
    /// Dispatch queue depth beyond which LOW deliveries are shed.
    pub dispatch_high_water: usize,
    /// Default opportunity claim TTL.
    pub claim_ttl: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            callback_budget: Duration::from_millis(50),
            dispatch_high_water: 512,
            claim_ttl: Duration::from_secs(30),
        }
    }
}

/// Subscriber callback. Runs on the dispatch task; must not block.
pub type SignalCallback = Arc<dyn Fn(Arc<Signal>) + Send + Sync>;

struct Subscriber {
    id: u64,
    agent_id: String,
    callback: SignalCallback,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    kind: SignalKind,
    id: u64,
}

/// Soft lock recording which agent owns an opportunity.
#[derive(Debug, Clone)]
struct Claim {
    agent_id: String,
    claimed_at: DateTime<Utc>,
    ttl: Duration,
}

impl Claim {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.claimed_at).to_std().unwrap_or_default() > self.ttl
    }
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_low: AtomicU64,
    callback_errors: AtomicU64,
    slow_callbacks: AtomicU64,
}

/// Point-in-time view of the bus counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusCountersSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped_low: u64,
    pub callback_errors: u64,
    pub slow_callbacks: u64,
}

struct BusInner {
    config: BusConfig,
    histories: RwLock<HashMap<SignalKind, VecDeque<Arc<Signal>>>>,
    subscribers: RwLock<HashMap<SignalKind, Vec<Subscriber>>>,
    claims: DashMap<String, Claim>,
    /// Agents whose callbacks exceeded the soft budget, with counts.
    slow_agents: DashMap<String, u64>,
    next_sub_id: AtomicU64,
    queue_depth: AtomicUsize,
    counters: BusCounters,
    dispatch_tx: mpsc::UnboundedSender<Arc<Signal>>,
}

/// Cloneable handle to the bus. All clones share state.
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl SignalBus {
    /// Create the bus and spawn its dispatch task. Requires a tokio runtime.
    pub fn new(config: BusConfig) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BusInner {
            config,
            histories: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            claims: DashMap::new(),
            slow_agents: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
            queue_depth: AtomicUsize::new(0),
            counters: BusCounters::default(),
            dispatch_tx,
        });
        tokio::spawn(dispatch_loop(inner.clone(), dispatch_rx));
        Self { inner }
    }

    /// Publish a signal: append to history, fan out to subscribers.
    ///
    /// Never waits for subscribers. Fails only on a malformed signal or if
    /// the dispatch task is gone.
    pub fn publish(&self, signal: Signal) -> Result<(), BusError> {
        if signal.source.is_empty() {
            return Err(BusError::Malformed("empty source".into()));
        }
        let signal = Arc::new(signal);
        let kind = signal.kind();
        let now = Utc::now();
        {
            let mut histories = self.inner.histories.write();
            let history = histories.entry(kind).or_default();
            history.retain(|s| !s.is_expired(now));
            history.push_back(signal.clone());
            while history.len() > self.inner.config.history_capacity {
                history.pop_front();
            }
        }
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.queue_depth.fetch_add(1, Ordering::AcqRel);
        self.inner
            .dispatch_tx
            .send(signal)
            .map_err(|_| BusError::DispatcherClosed)?;
        Ok(())
    }

    /// Register a callback for future publications of `kind`. A late
    /// subscriber does not see history; use `recent` for that.
    pub fn subscribe<F>(
        &self,
        kind: SignalKind,
        agent_id: impl Into<String>,
        callback: F,
    ) -> SubscriptionHandle
    where
        F: Fn(Arc<Signal>) + Send + Sync + 'static,
    {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id,
            agent_id: agent_id.into(),
            callback: Arc::new(callback),
        };
        self.inner
            .subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(subscriber);
        SubscriptionHandle { kind, id }
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subscribers = self.inner.subscribers.write();
        if let Some(subs) = subscribers.get_mut(&handle.kind) {
            subs.retain(|s| s.id != handle.id);
        }
    }

    /// Unexpired history of `kind` no older than `window`.
    pub fn recent(&self, kind: SignalKind, window: Duration) -> Vec<Arc<Signal>> {
        let now = Utc::now();
        let histories = self.inner.histories.read();
        histories
            .get(&kind)
            .map(|history| {
                history
                    .iter()
                    .filter(|s| {
                        !s.is_expired(now)
                            && s.age(now).to_std().unwrap_or_default() <= window
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Latest unexpired global sentiment, if any.
    pub fn global_sentiment(&self) -> Option<GlobalSentiment> {
        let now = Utc::now();
        let histories = self.inner.histories.read();
        histories
            .get(&SignalKind::GlobalSentiment)?
            .iter()
            .rev()
            .find(|s| !s.is_expired(now))
            .and_then(|s| match &s.payload {
                SignalPayload::GlobalSentiment(g) => Some(g.clone()),
                _ => None,
            })
    }

    /// Current hot tokens, newest entry per token, ordered by velocity,
    /// capped at `n`.
    pub fn hot_tokens(&self, n: usize) -> Vec<HotToken> {
        let now = Utc::now();
        let histories = self.inner.histories.read();
        let mut seen: HashMap<String, HotToken> = HashMap::new();
        if let Some(history) = histories.get(&SignalKind::HotToken) {
            // Newest-last iteration; later entries overwrite earlier ones.
            for signal in history.iter().filter(|s| !s.is_expired(now)) {
                if let SignalPayload::HotToken(hot) = &signal.payload {
                    seen.insert(hot.token_id.clone(), hot.clone());
                }
            }
        }
        let mut tokens: Vec<HotToken> = seen.into_values().collect();
        tokens.sort_by(|a, b| {
            b.velocity_per_min
                .partial_cmp(&a.velocity_per_min)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        tokens.truncate(n);
        tokens
    }

    /// Whale moves within `window`.
    pub fn whale_moves(&self, window: Duration) -> Vec<WhaleMove> {
        self.recent(SignalKind::WhaleMove, window)
            .iter()
            .filter_map(|s| match &s.payload {
                SignalPayload::WhaleMove(w) => Some(w.clone()),
                _ => None,
            })
            .collect()
    }

    /// News events within `window`.
    pub fn news_events(&self, window: Duration) -> Vec<NewsEvent> {
        self.recent(SignalKind::NewsEvent, window)
            .iter()
            .filter_map(|s| match &s.payload {
                SignalPayload::NewsEvent(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    /// Claim an opportunity for `agent_id`. Exactly one agent holds an
    /// unexpired claim at a time; re-claiming by the owner succeeds.
    pub fn claim(&self, opportunity_id: &str, agent_id: &str) -> bool {
        let now = Utc::now();
        let ttl = self.inner.config.claim_ttl;
        match self.inner.claims.entry(opportunity_id.to_string()) {
            dashmap::Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    entry.insert(Claim {
                        agent_id: agent_id.to_string(),
                        claimed_at: now,
                        ttl,
                    });
                    true
                } else {
                    entry.get().agent_id == agent_id
                }
            }
            dashmap::Entry::Vacant(entry) => {
                entry.insert(Claim {
                    agent_id: agent_id.to_string(),
                    claimed_at: now,
                    ttl,
                });
                true
            }
        }
    }

    /// Release a claim held by `agent_id`. Idempotent; a non-owner release
    /// is a no-op.
    pub fn release_claim(&self, opportunity_id: &str, agent_id: &str) {
        self.inner
            .claims
            .remove_if(opportunity_id, |_, claim| claim.agent_id == agent_id);
    }

    /// Current unexpired claimant of an opportunity.
    pub fn claimant(&self, opportunity_id: &str) -> Option<String> {
        let now = Utc::now();
        self.inner
            .claims
            .get(opportunity_id)
            .filter(|claim| !claim.is_expired(now))
            .map(|claim| claim.agent_id.clone())
    }

    /// Agents flagged for exceeding the callback budget, with counts.
    pub fn slow_subscribers(&self) -> Vec<(String, u64)> {
        self.inner
            .slow_agents
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn counters(&self) -> BusCountersSnapshot {
        let c = &self.inner.counters;
        BusCountersSnapshot {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped_low: c.dropped_low.load(Ordering::Relaxed),
            callback_errors: c.callback_errors.load(Ordering::Relaxed),
            slow_callbacks: c.slow_callbacks.load(Ordering::Relaxed),
        }
    }

    /// History capacity, exposed for aggregate readers.
    pub(crate) fn history_capacity(&self) -> usize {
        self.inner.config.history_capacity
    }
}

async fn dispatch_loop(inner: Arc<BusInner>, mut rx: mpsc::UnboundedReceiver<Arc<Signal>>) {
    while let Some(signal) = rx.recv().await {
        let depth = inner.queue_depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        let shed_low = depth > inner.config.dispatch_high_water;
        let kind = signal.kind();

        // Snapshot the subscriber list so callbacks run without the lock.
        let subscribers: Vec<(String, SignalCallback)> = {
            let map = inner.subscribers.read();
            map.get(&kind)
                .map(|subs| {
                    subs.iter()
                        .map(|s| (s.agent_id.clone(), s.callback.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        if shed_low && signal.priority == SignalPriority::Low {
            inner
                .counters
                .dropped_low
                .fetch_add(subscribers.len() as u64, Ordering::Relaxed);
            debug!(?kind, depth, "shedding LOW delivery under back-pressure");
            continue;
        }

        for (agent_id, callback) in subscribers {
            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| callback(signal.clone())));
            let elapsed = started.elapsed();
            match result {
                Ok(()) => {
                    inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    inner.counters.callback_errors.fetch_add(1, Ordering::Relaxed);
                    error!(agent = %agent_id, ?kind, "subscriber callback panicked");
                }
            }
            if elapsed > inner.config.callback_budget {
                inner.counters.slow_callbacks.fetch_add(1, Ordering::Relaxed);
                *inner.slow_agents.entry(agent_id.clone()).or_insert(0) += 1;
                warn!(
                    agent = %agent_id,
                    ?kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "subscriber exceeded callback budget"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::types::{
        MarketOpportunity, NewsImpact, OpportunityKind, RiskAlert, AlertScope, AlertSeverity,
    };
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    fn news(source: &str, ttl: Option<u64>) -> Signal {
        Signal::new(
            source,
            SignalPriority::Medium,
            ttl,
            SignalPayload::NewsEvent(super::super::types::NewsEvent {
                headline: "headline".into(),
                entities: vec!["BTC".into()],
                sentiment: 0.5,
                confidence: 0.8,
                impact: NewsImpact::Medium,
                source: "wire".into(),
                related_markets: vec![],
            }),
        )
    }

    #[tokio::test]
    async fn publish_and_deliver() {
        let bus = SignalBus::new(BusConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        bus.subscribe(SignalKind::NewsEvent, "listener", move |_s| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        bus.publish(news("producer", None)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(bus.counters().delivered, 1);
    }

    #[tokio::test]
    async fn delivery_in_registration_order() {
        let bus = SignalBus::new(BusConfig::default());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(SignalKind::NewsEvent, name, move |_s| {
                order.lock().push(name);
            });
        }
        bus.publish(news("producer", None)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn malformed_signal_rejected() {
        let bus = SignalBus::new(BusConfig::default());
        let result = bus.publish(news("", None));
        assert!(matches!(result, Err(BusError::Malformed(_))));
    }

    #[tokio::test]
    async fn history_ring_evicts_oldest() {
        let bus = SignalBus::new(BusConfig {
            history_capacity: 3,
            ..Default::default()
        });
        for i in 0..5 {
            bus.publish(news(&format!("p{i}"), None)).unwrap();
        }
        let recent = bus.recent(SignalKind::NewsEvent, Duration::from_secs(3600));
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].source, "p2");
        assert_eq!(recent[2].source, "p4");
    }

    #[tokio::test]
    async fn panicking_subscriber_is_isolated() {
        let bus = SignalBus::new(BusConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        bus.subscribe(SignalKind::NewsEvent, "bad", |_s| panic!("boom"));
        let seen = hits.clone();
        bus.subscribe(SignalKind::NewsEvent, "good", move |_s| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        bus.publish(news("producer", None)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(bus.counters().callback_errors, 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = SignalBus::new(BusConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let handle = bus.subscribe(SignalKind::NewsEvent, "listener", move |_s| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        bus.unsubscribe(handle);
        bus.unsubscribe(handle);

        bus.publish(news("producer", None)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let bus = SignalBus::new(BusConfig::default());
        assert!(bus.claim("opp-1", "alpha"));
        assert!(!bus.claim("opp-1", "beta"));
        // Owner re-claim is fine.
        assert!(bus.claim("opp-1", "alpha"));
        assert_eq!(bus.claimant("opp-1").as_deref(), Some("alpha"));

        // Non-owner release is a no-op.
        bus.release_claim("opp-1", "beta");
        assert_eq!(bus.claimant("opp-1").as_deref(), Some("alpha"));

        bus.release_claim("opp-1", "alpha");
        assert!(bus.claim("opp-1", "beta"));
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimable() {
        let bus = SignalBus::new(BusConfig {
            claim_ttl: Duration::from_millis(10),
            ..Default::default()
        });
        assert!(bus.claim("opp-1", "alpha"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(bus.claim("opp-1", "beta"));
        assert_eq!(bus.claimant("opp-1").as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn accessors_return_typed_payloads() {
        let bus = SignalBus::new(BusConfig::default());
        bus.publish(news("producer", None)).unwrap();
        bus.publish(Signal::new(
            "arb",
            SignalPriority::High,
            Some(60),
            SignalPayload::MarketOpportunity(MarketOpportunity {
                opportunity_id: "opp-1".into(),
                opp_kind: OpportunityKind::PureArb,
                market_ids: vec!["m1".into()],
                token_ids: vec!["t1".into(), "t2".into()],
                expected_profit_usd: dec!(1.50),
                confidence: 0.9,
                claimed_by: Some("arb".into()),
            }),
        ))
        .unwrap();
        bus.publish(Signal::new(
            "risk",
            SignalPriority::Critical,
            None,
            SignalPayload::RiskAlert(RiskAlert {
                severity: AlertSeverity::Critical,
                scope: AlertScope::Portfolio,
                reason: "daily loss limit".into(),
            }),
        ))
        .unwrap();

        assert_eq!(bus.news_events(Duration::from_secs(60)).len(), 1);
        assert_eq!(
            bus.recent(SignalKind::MarketOpportunity, Duration::from_secs(60)).len(),
            1
        );
        assert_eq!(bus.recent(SignalKind::RiskAlert, Duration::from_secs(60)).len(), 1);
        // Histories are per kind.
        assert_eq!(bus.recent(SignalKind::WhaleMove, Duration::from_secs(60)).len(), 0);
    }
}
