//! Order gateway abstraction.
//!
//! The substrate is agnostic to the order-entry service's encoding; it
//! requires only `submit` and `cancel`. `HttpGateway` talks to the real
//! JSON service; `PaperGateway` fills instantly for dry runs and tests.

pub mod http;
pub mod paper;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use swarm_common::Side;

pub use http::{HttpGateway, HttpGatewayConfig};
pub use paper::PaperGateway;

/// Errors from the order gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transient failure worth retrying (TEMPORARY rejection, 5xx, reset).
    #[error("temporary gateway error: {0}")]
    Temporary(String),

    #[error("gateway request timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed response; the peer is misbehaving.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Whether the local retry policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Temporary(_) | GatewayError::Timeout)
    }
}

/// Time-in-force for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Immediate-or-cancel. An unfilled IOC is treated as rejected.
    Ioc,
    /// Good-till-cancelled.
    Gtc,
}

/// Order submission parameters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: Side,
    pub limit_price: Decimal,
    pub size: Decimal,
    pub time_in_force: TimeInForce,
    pub max_slippage_bps: u32,
}

/// Terminal status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    Rejected,
    Open,
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub avg_price: Decimal,
}

impl OrderResult {
    /// Whether any quantity filled.
    pub fn any_fill(&self) -> bool {
        self.filled_size > Decimal::ZERO
    }
}

/// Result of a cancellation.
#[derive(Debug, Clone)]
pub struct CancelResult {
    pub status: String,
}

/// External order-entry service.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit(&self, order: OrderRequest) -> Result<OrderResult, GatewayError>;

    async fn cancel(&self, order_id: &str) -> Result<CancelResult, GatewayError>;
}

/// Submit with up to `attempts` tries on transient errors, backing off with
/// jitter between tries. Non-transient errors surface immediately.
pub async fn submit_with_retry(
    gateway: &dyn OrderGateway,
    order: OrderRequest,
    attempts: u32,
) -> Result<OrderResult, GatewayError> {
    let mut last = None;
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            let base = Duration::from_millis(200) * (1 << (attempt - 1));
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
            tokio::time::sleep(base + jitter).await;
        }
        match gateway.submit(order.clone()).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                warn!(attempt, error = %e, token = %order.token_id, "transient submit failure");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| GatewayError::Temporary("no attempts made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    struct FlakyGateway {
        failures_before_success: Mutex<u32>,
    }

    #[async_trait]
    impl OrderGateway for FlakyGateway {
        async fn submit(&self, order: OrderRequest) -> Result<OrderResult, GatewayError> {
            let mut left = self.failures_before_success.lock();
            if *left > 0 {
                *left -= 1;
                return Err(GatewayError::Temporary("busy".into()));
            }
            Ok(OrderResult {
                order_id: "o1".into(),
                status: OrderStatus::Filled,
                filled_size: order.size,
                avg_price: order.limit_price,
            })
        }

        async fn cancel(&self, _order_id: &str) -> Result<CancelResult, GatewayError> {
            Ok(CancelResult { status: "CANCELLED".into() })
        }
    }

    fn order() -> OrderRequest {
        OrderRequest {
            token_id: "tok".into(),
            side: Side::Buy,
            limit_price: dec!(0.49),
            size: dec!(50),
            time_in_force: TimeInForce::Ioc,
            max_slippage_bps: 200,
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let gateway = FlakyGateway {
            failures_before_success: Mutex::new(2),
        };
        let result = submit_with_retry(&gateway, order(), 3).await.unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn surfaces_after_retry_budget() {
        let gateway = FlakyGateway {
            failures_before_success: Mutex::new(10),
        };
        let result = submit_with_retry(&gateway, order(), 3).await;
        assert!(matches!(result, Err(GatewayError::Temporary(_))));
    }
}
