//! Paper gateway for dry runs.
//!
//! Fills every order instantly at its limit price. No order leaves the
//! process; everything else in the execution path behaves as in live mode.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use super::{CancelResult, GatewayError, OrderGateway, OrderRequest, OrderResult, OrderStatus};

/// Instant-fill gateway.
#[derive(Debug, Default)]
pub struct PaperGateway {
    next_id: AtomicU64,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn submit(&self, order: OrderRequest) -> Result<OrderResult, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            token = %order.token_id,
            side = %order.side,
            price = %order.limit_price,
            size = %order.size,
            "paper fill"
        );
        Ok(OrderResult {
            order_id: format!("paper-{id}"),
            status: OrderStatus::Filled,
            filled_size: order.size,
            avg_price: order.limit_price,
        })
    }

    async fn cancel(&self, _order_id: &str) -> Result<CancelResult, GatewayError> {
        Ok(CancelResult {
            status: "CANCELLED".into(),
        })
    }
}
