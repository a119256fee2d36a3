//! Configuration for the swarm.
//!
//! Loaded from a TOML file, then overridden by environment variables
//! (secrets only come from the environment) and CLI flags. Validation is
//! strict: allocation fractions that do not sum with the reserve to exactly
//! 1 are rejected, never renormalized.
//!
//! Decimal fields are written as strings in the TOML file (`"0.40"`) so no
//! float conversion ever touches them.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::agent::supervisor::SupervisorConfig;
use crate::agent::ArbConfig;
use crate::budget::BudgetConfig;
use crate::risk::circuit_breaker::CircuitBreakerConfig;
use crate::risk::RiskLimits;
use crate::signal::BusConfig;

/// Environment variable carrying the wallet private key.
pub const ENV_WALLET_KEY: &str = "SWARM_WALLET_KEY";
/// Environment variable carrying the wallet address (for nonce issuance).
pub const ENV_WALLET_ADDRESS: &str = "SWARM_WALLET_ADDRESS";
/// Environment variable carrying the coordination store URL.
pub const ENV_STORE_URL: &str = "SWARM_STORE_URL";
/// Environment variable carrying the order gateway API key.
pub const ENV_GATEWAY_KEY: &str = "SWARM_GATEWAY_KEY";

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// External service endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Market-data WebSocket URL.
    pub stream_url: String,
    /// Market catalog base URL.
    pub catalog_url: String,
    /// Order-entry base URL.
    pub order_url: String,
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// No orders are submitted; everything else behaves as live.
    pub dry_run: bool,
    pub verbose: bool,
    /// Seed the ledger with this total capital on startup.
    pub budget_seed: Option<Decimal>,
    /// Allow reseeding an existing ledger.
    pub reset_ledger: bool,
    /// Coordination store URL; in-memory store when absent.
    pub store_url: Option<String>,
    /// Agents to enable. Must be a subset of the allocation keys.
    pub enabled_agents: Vec<String>,
    pub endpoints: Endpoints,
    /// Order gateway API key (environment only).
    pub gateway_key: Option<String>,
    /// Wallet address for nonce issuance (environment only).
    pub wallet_address: Option<String>,
    /// Wallet private key (environment only, never logged).
    pub wallet_key: Option<String>,
    /// Markets fetched from the catalog per discovery pass.
    pub catalog_limit: usize,
    pub budget: BudgetConfig,
    pub risk: RiskLimits,
    pub breaker: CircuitBreakerConfig,
    pub bus: BusConfig,
    pub arb: ArbConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        let budget = BudgetConfig::default();
        let enabled_agents = budget.allocations.keys().cloned().collect();
        Self {
            dry_run: false,
            verbose: false,
            budget_seed: None,
            reset_ledger: false,
            store_url: None,
            enabled_agents,
            endpoints: Endpoints::default(),
            gateway_key: None,
            wallet_address: None,
            wallet_key: None,
            catalog_limit: 200,
            budget,
            risk: RiskLimits::default(),
            breaker: CircuitBreakerConfig::default(),
            bus: BusConfig::default(),
            arb: ArbConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Raw TOML file model. Everything optional; defaults fill the gaps.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    endpoints: Endpoints,
    agents: Option<Vec<String>>,
    catalog_limit: Option<usize>,
    budget: RawBudget,
    risk: RawRisk,
    arb: RawArb,
    supervisor: RawSupervisor,
    bus: RawBus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBudget {
    reserve_fraction: Option<Decimal>,
    allocations: Option<BTreeMap<String, Decimal>>,
    reservation_ttl_secs: Option<u64>,
    critical_cross_draw_cap: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRisk {
    max_position_size_usd: Option<Decimal>,
    max_total_exposure_usd: Option<Decimal>,
    max_entity_exposure_usd: Option<Decimal>,
    max_positions_per_agent: Option<usize>,
    max_daily_loss_usd: Option<Decimal>,
    min_signal_quality: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawArb {
    min_profit_per_unit: Option<Decimal>,
    max_slippage: Option<Decimal>,
    fee_per_unit: Option<Decimal>,
    gas_per_trade: Option<Decimal>,
    size_cap: Option<Decimal>,
    scan_interval_ms: Option<u64>,
    leg_risk_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSupervisor {
    heartbeat_interval_secs: Option<u64>,
    shutdown_grace_secs: Option<u64>,
    max_restarts: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBus {
    history_capacity: Option<usize>,
    callback_budget_ms: Option<u64>,
}

impl SwarmConfig {
    /// Load from a TOML file, filling unset fields with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(&std::fs::read_to_string(path)?)?;
        let mut config = SwarmConfig::default();

        config.endpoints = raw.endpoints;
        if let Some(agents) = raw.agents {
            config.enabled_agents = agents;
        }
        if let Some(limit) = raw.catalog_limit {
            config.catalog_limit = limit;
        }

        if let Some(v) = raw.budget.reserve_fraction {
            config.budget.reserve_fraction = v;
        }
        if let Some(v) = raw.budget.allocations {
            config.budget.allocations = v;
            config.enabled_agents = config.budget.allocations.keys().cloned().collect();
        }
        if let Some(v) = raw.budget.reservation_ttl_secs {
            config.budget.reservation_ttl = Duration::from_secs(v);
        }
        if let Some(v) = raw.budget.critical_cross_draw_cap {
            config.budget.critical_cross_draw_cap = v;
        }

        if let Some(v) = raw.risk.max_position_size_usd {
            config.risk.max_position_size_usd = v;
        }
        if let Some(v) = raw.risk.max_total_exposure_usd {
            config.risk.max_total_exposure_usd = v;
        }
        if let Some(v) = raw.risk.max_entity_exposure_usd {
            config.risk.max_entity_exposure_usd = v;
        }
        if let Some(v) = raw.risk.max_positions_per_agent {
            config.risk.max_positions_per_agent = v;
        }
        if let Some(v) = raw.risk.max_daily_loss_usd {
            config.risk.max_daily_loss_usd = v;
            config.breaker.max_daily_loss = v;
        }
        if let Some(v) = raw.risk.min_signal_quality {
            config.risk.min_signal_quality = v;
        }

        if let Some(v) = raw.arb.min_profit_per_unit {
            config.arb.min_profit_per_unit = v;
        }
        if let Some(v) = raw.arb.max_slippage {
            config.arb.max_slippage = v;
        }
        if let Some(v) = raw.arb.fee_per_unit {
            config.arb.fee_per_unit = v;
        }
        if let Some(v) = raw.arb.gas_per_trade {
            config.arb.gas_per_trade = v;
        }
        if let Some(v) = raw.arb.size_cap {
            config.arb.size_cap = v;
        }
        if let Some(v) = raw.arb.scan_interval_ms {
            config.arb.scan_interval = Duration::from_millis(v);
            config.arb.boosted_scan_interval = Duration::from_millis(v / 2);
        }
        if let Some(v) = raw.arb.leg_risk_timeout_secs {
            config.arb.leg_risk_timeout = Duration::from_secs(v);
        }

        if let Some(v) = raw.supervisor.heartbeat_interval_secs {
            config.supervisor.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = raw.supervisor.shutdown_grace_secs {
            config.supervisor.shutdown_grace = Duration::from_secs(v);
        }
        if let Some(v) = raw.supervisor.max_restarts {
            config.supervisor.max_restarts = v;
        }

        if let Some(v) = raw.bus.history_capacity {
            config.bus.history_capacity = v;
        }
        if let Some(v) = raw.bus.callback_budget_ms {
            config.bus.callback_budget = Duration::from_millis(v);
        }

        Ok(config)
    }

    /// Pull secrets and overrides from the environment. Secrets are never
    /// read from disk.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_STORE_URL) {
            if !url.is_empty() {
                self.store_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var(ENV_GATEWAY_KEY) {
            if !key.is_empty() {
                self.gateway_key = Some(key);
            }
        }
        if let Ok(address) = std::env::var(ENV_WALLET_ADDRESS) {
            if !address.is_empty() {
                self.wallet_address = Some(address.to_lowercase());
            }
        }
        if let Ok(key) = std::env::var(ENV_WALLET_KEY) {
            if !key.is_empty() {
                self.wallet_key = Some(key);
            }
        }
    }

    /// Apply CLI flags, which win over file and environment.
    pub fn apply_cli_overrides(
        &mut self,
        dry_run: bool,
        verbose: bool,
        budget: Option<Decimal>,
        reset: bool,
        agents: Option<Vec<String>>,
        store_url: Option<String>,
    ) {
        if dry_run {
            self.dry_run = true;
        }
        if verbose {
            self.verbose = true;
        }
        if budget.is_some() {
            self.budget_seed = budget;
        }
        if reset {
            self.reset_ledger = true;
        }
        if let Some(agents) = agents {
            self.enabled_agents = agents;
        }
        if store_url.is_some() {
            self.store_url = store_url;
        }
    }

    /// Strict validation. Rejects rather than repairs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reserve = self.budget.reserve_fraction;
        if reserve < Decimal::ZERO || reserve >= Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "reserve_fraction {reserve} must be in [0, 1)"
            )));
        }
        if self.budget.allocations.is_empty() {
            return Err(ConfigError::Invalid("no strategy allocations".into()));
        }
        let mut sum = Decimal::ZERO;
        for (strategy, fraction) in &self.budget.allocations {
            if *fraction <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "allocation for {strategy} must be positive, got {fraction}"
                )));
            }
            sum += fraction;
        }
        if sum + reserve != Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "allocations ({sum}) plus reserve ({reserve}) must equal 1"
            )));
        }
        for agent in &self.enabled_agents {
            if !self.budget.allocations.contains_key(agent) {
                return Err(ConfigError::Invalid(format!(
                    "enabled agent {agent} has no allocation"
                )));
            }
        }
        if let Some(seed) = self.budget_seed {
            if seed <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "budget seed {seed} must be positive"
                )));
            }
        }
        if !self.dry_run && self.endpoints.order_url.is_empty() {
            return Err(ConfigError::Invalid(
                "order gateway URL required outside --dry-run".into(),
            ));
        }
        Ok(())
    }
}
