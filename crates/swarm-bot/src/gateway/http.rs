//! HTTP order gateway.
//!
//! Typed wrapper over the JSON order-entry service. A REJECTED response
//! whose reason is `TEMPORARY` surfaces as a transient error so the retry
//! policy applies; any other rejection is a terminal order result.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use super::{CancelResult, GatewayError, OrderGateway, OrderRequest, OrderResult, OrderStatus};

/// Configuration for the HTTP gateway.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    /// Order-entry base URL.
    pub base_url: String,
    /// API key sent as a bearer token, from the environment.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    order_id: String,
    status: OrderStatus,
    #[serde(default)]
    filled_size: Decimal,
    #[serde(default)]
    avg_price: Decimal,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    status: String,
}

/// JSON order-entry client.
pub struct HttpGateway {
    config: HttpGatewayConfig,
    client: Client,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl OrderGateway for HttpGateway {
    async fn submit(&self, order: OrderRequest) -> Result<OrderResult, GatewayError> {
        let response = self
            .authorize(self.client.post(self.url("/orders")))
            .json(&order)
            .send()
            .await
            .map_err(classify_reqwest)?;

        if response.status().is_server_error() {
            return Err(GatewayError::Temporary(format!(
                "server error {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(GatewayError::Protocol(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("bad submit response: {e}")))?;

        if body.status == OrderStatus::Rejected
            && body.reason.as_deref() == Some("TEMPORARY")
        {
            return Err(GatewayError::Temporary("order rejected: TEMPORARY".into()));
        }

        debug!(
            order_id = %body.order_id,
            status = ?body.status,
            filled = %body.filled_size,
            "order submitted"
        );
        Ok(OrderResult {
            order_id: body.order_id,
            status: body.status,
            filled_size: body.filled_size,
            avg_price: body.avg_price,
        })
    }

    async fn cancel(&self, order_id: &str) -> Result<CancelResult, GatewayError> {
        let response = self
            .authorize(
                self.client
                    .delete(self.url(&format!("/orders/{order_id}"))),
            )
            .send()
            .await
            .map_err(classify_reqwest)?;
        let body: CancelResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("bad cancel response: {e}")))?;
        Ok(CancelResult { status: body.status })
    }
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: i64,
}

#[async_trait]
impl crate::budget::NonceSource for HttpGateway {
    /// The order-entry service fronts the chain and reports the wallet's
    /// current transaction count.
    async fn current_nonce(&self, wallet: &str) -> Result<i64, crate::budget::BudgetError> {
        let url = self.url(&format!("/wallets/{}/nonce", wallet.to_lowercase()));
        let fetch = async {
            let body: NonceResponse = self
                .authorize(self.client.get(&url))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok::<i64, reqwest::Error>(body.nonce)
        };
        fetch.await.map_err(|e| crate::budget::BudgetError::NonceSource {
            wallet: wallet.to_string(),
            detail: e.to_string(),
        })
    }
}

fn classify_reqwest(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else if e.is_connect() {
        GatewayError::Temporary(e.to_string())
    } else {
        GatewayError::Http(e)
    }
}
