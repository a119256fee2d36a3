//! Integration tests for the capital ledger and budget manager.
//!
//! Covers budget conservation under concurrent reservation/release pairs,
//! nonce monotonicity under contention, and the denial path.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use swarm_bot::budget::{
    BudgetConfig, BudgetManager, CoordinationFault, ReservePriority, StaticNonceSource,
};
use swarm_bot::store::MemoryStore;

fn new_manager(config: BudgetConfig) -> Arc<BudgetManager> {
    Arc::new(BudgetManager::new(
        Arc::new(MemoryStore::new()),
        config,
        CoordinationFault::new(),
        Arc::new(StaticNonceSource { start: 100 }),
    ))
}

async fn seeded_manager() -> Arc<BudgetManager> {
    let manager = new_manager(BudgetConfig::default());
    manager.seed(dec!(1000), false).await.unwrap();
    manager
}

// ============================================================================
// Budget conservation
// ============================================================================

// Concurrent reservation/release pairs never create or destroy capital:
// at every atomic checkpoint, balances + outstanding reservations +
// executed capital equal the seeded total.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn budget_conservation_under_concurrency() {
    let manager = seeded_manager().await;
    let strategies = ["arb", "statarb", "mimic"];

    let mut workers = Vec::new();
    for worker in 0..12 {
        let manager = manager.clone();
        let strategy = strategies[worker % strategies.len()];
        workers.push(tokio::spawn(async move {
            for _ in 0..8 {
                let Some(id) = manager
                    .request_reservation(strategy, dec!(7.5), ReservePriority::Normal)
                    .await
                else {
                    continue;
                };
                tokio::task::yield_now().await;
                // Spend a third, return the rest. Retry through lock
                // contention: the release must eventually land.
                loop {
                    if manager
                        .release_reservation(strategy, &id, dec!(2.5))
                        .await
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }));
    }

    let checker = {
        let manager = manager.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                if let Ok(snapshot) = manager.snapshot().await {
                    assert_eq!(
                        snapshot.committed_total(),
                        dec!(1000),
                        "conservation violated at checkpoint: {snapshot:?}"
                    );
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
    };

    for worker in workers {
        worker.await.unwrap();
    }
    checker.await.unwrap();

    let snapshot = manager.snapshot().await.unwrap();
    assert_eq!(snapshot.committed_total(), dec!(1000));
    assert!(snapshot.reservations.is_empty());
    assert!(snapshot.executed > Decimal::ZERO);
}

// ============================================================================
// Nonce monotonicity
// ============================================================================

// next_nonce returns strictly increasing values even under concurrent
// callers sharing one wallet.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nonces_strictly_increase_under_contention() {
    let manager = seeded_manager().await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..20 {
                loop {
                    match manager.next_nonce("0xWallet").await {
                        Ok(nonce) => {
                            got.push(nonce);
                            break;
                        }
                        // Lock contention: try again.
                        Err(_) => tokio::task::yield_now().await,
                    }
                }
            }
            got
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        let got = task.await.unwrap();
        // Per caller, values are strictly increasing.
        assert!(got.windows(2).all(|w| w[0] < w[1]));
        all.extend(got);
    }

    all.sort_unstable();
    assert_eq!(all.len(), 160);
    all.dedup();
    assert_eq!(all.len(), 160, "duplicate nonce issued");
    assert_eq!(*all.first().unwrap(), 101);
    assert_eq!(*all.last().unwrap(), 260);
}

// ============================================================================
// Denial paths
// ============================================================================

// A strategy with 10 left cannot reserve 48.5 at normal priority; no trade,
// no ledger movement.
#[tokio::test]
async fn denial_when_balance_exhausted() {
    let manager = seeded_manager().await;
    // Drain arb down to 10.
    let drain = manager
        .request_reservation("arb", dec!(390), ReservePriority::Normal)
        .await
        .unwrap();

    assert!(manager
        .request_reservation("arb", dec!(48.5), ReservePriority::Normal)
        .await
        .is_none());

    let snapshot = manager.snapshot().await.unwrap();
    assert_eq!(snapshot.balances["arb"], dec!(10));
    assert_eq!(snapshot.committed_total(), dec!(1000));

    manager
        .release_reservation("arb", &drain, dec!(0))
        .await
        .unwrap();
}

// Unknown strategies are denied outright rather than creating balances.
#[tokio::test]
async fn denial_for_unknown_strategy() {
    let manager = seeded_manager().await;
    assert!(manager
        .request_reservation("mystery", dec!(1), ReservePriority::Critical)
        .await
        .is_none());
}

// Custom allocations flow through seeding exactly.
#[tokio::test]
async fn custom_allocations_seed_exactly() {
    let mut allocations = BTreeMap::new();
    allocations.insert("alpha".to_string(), dec!(0.60));
    allocations.insert("beta".to_string(), dec!(0.25));
    let config = BudgetConfig {
        reserve_fraction: dec!(0.15),
        allocations,
        ..BudgetConfig::default()
    };
    let manager = new_manager(config);
    manager.seed(dec!(2000), false).await.unwrap();

    let snapshot = manager.snapshot().await.unwrap();
    assert_eq!(snapshot.balances["alpha"], dec!(1200));
    assert_eq!(snapshot.balances["beta"], dec!(500));
    assert_eq!(snapshot.balances["reserve"], dec!(300));
}
