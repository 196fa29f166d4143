//! Configuration management for the Fusion resolver
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::types::StageOffsets;

use anyhow::{Context, Result};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
    pub profitability: ProfitabilityConfig,
    pub pricing: PricingConfig,
    pub timelocks: StageOffsets,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    pub max_concurrent_orders: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_secs: u64,
    /// How long the executor waits for the maker's secret
    #[serde(default = "default_secret_wait_secs")]
    pub secret_wait_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_reconcile_lookback_blocks")]
    pub reconcile_lookback_blocks: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
}

fn default_secret_wait_secs() -> u64 {
    60
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_reconcile_lookback_blocks() -> u64 {
    100
}

fn default_max_block_range() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    #[default]
    Evm,
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    #[serde(default)]
    pub kind: ChainKind,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    /// Contract emitting `OrderCreated`
    #[serde(default)]
    pub order_source_address: String,
    /// Escrow factory emitting escrow lifecycle events
    #[serde(default)]
    pub escrow_factory_address: String,
    /// Resolver contract (or EOA on simulated chains) acting as taker
    pub resolver_address: String,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_gas_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    /// Minimum escrow safety deposit in basis points of the amount (simulated chains)
    #[serde(default)]
    pub min_safety_deposit_bps: u16,
    pub enabled: bool,
}

fn default_confirmation_blocks() -> u64 {
    1
}

fn default_gas_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}

fn default_max_gas_price_gwei() -> u64 {
    200
}

impl ChainConfig {
    pub fn resolver(&self) -> Result<Address> {
        parse_address(&self.resolver_address)
            .with_context(|| format!("Invalid resolver address for chain {}", self.name))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the resolver's private key
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfitabilityConfig {
    pub min_profit_wei: u128,
    pub large_order_wei: u128,
    #[serde(default)]
    pub accept_high_risk: bool,
    /// Gas units budgeted for one full execution (both legs)
    pub estimated_gas_units: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    pub fee_bps: u16,
    pub default_slippage_bps: u16,
    pub quote_ttl_secs: u64,
    pub large_order_usd: Decimal,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub chain_id: u64,
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    pub price_usd: Decimal,
}

impl Settings {
    /// Load settings from the file named by `FUSION_RESOLVER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("FUSION_RESOLVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if !chain.enabled {
                continue;
            }
            chain.resolver()?;
            if chain.min_safety_deposit_bps > 10_000 {
                anyhow::bail!("Chain {} min_safety_deposit_bps must not exceed 10000", name);
            }
            if chain.kind == ChainKind::Evm {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.order_source_address.is_empty() {
                    tracing::warn!("Chain {} has no order source address - orders will not be discovered", name);
                }
            }
        }

        if self.resolver.max_concurrent_orders == 0 {
            anyhow::bail!("max_concurrent_orders must be at least 1");
        }

        if self.pricing.fee_bps > 10_000 || self.pricing.default_slippage_bps > 10_000 {
            anyhow::bail!("Pricing basis points must not exceed 10000");
        }

        for token in &self.pricing.tokens {
            parse_address(&token.address)
                .with_context(|| format!("Invalid token address for {}", token.symbol))?;
            if token.price_usd <= Decimal::ZERO {
                anyhow::bail!("Token {} must have a positive USD price", token.symbol);
            }
        }

        crate::types::Timelocks::pack(&self.timelocks, 0)
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

pub fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw.trim()).map_err(|e| anyhow::anyhow!("invalid address {}: {}", raw, e))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
