//! Chain module - uniform access to source and destination chains
//!
//! This module provides:
//! - The `ChainClient` trait the monitor and executor drive
//! - An ethers-backed EVM client with multi-RPC failover
//! - An in-process simulated chain backed by the escrow registry
//! - The manager that owns one client per configured chain

pub mod client;
pub mod provider;
pub mod simulated;

pub use client::EvmChainClient;
pub use provider::{ChainProvider, GasPrice};
pub use simulated::{Clock, SimulatedChain};

use crate::config::{ChainKind, Settings};
use crate::error::{ResolverError, ResolverResult};
use crate::escrow::EscrowRegistry;
use crate::events::ContractEvent;
use crate::tx::TransactionSender;
use crate::types::{EscrowSide, Immutables, Secret};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_KEY_ENV: &str = "RESOLVER_PRIVATE_KEY";

/// Operations the resolver performs against one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Address acting as taker for escrows on this chain
    fn resolver_address(&self) -> Address;

    async fn block_number(&self) -> ResolverResult<u64>;

    /// Chain clock in unix seconds, as escrow timelocks see it
    async fn timestamp(&self) -> ResolverResult<u64>;

    /// Order and escrow events in the inclusive block range
    async fn order_events(&self, from_block: u64, to_block: u64) -> ResolverResult<Vec<ContractEvent>>;

    /// Cost in wei of spending `gas_units` at current prices
    async fn estimate_gas_cost(&self, gas_units: u64) -> ResolverResult<U256>;

    /// Fill the order into a locked source escrow
    async fn deploy_src_escrow(&self, immutables: &Immutables) -> ResolverResult<H256>;

    /// Fund and lock the destination escrow
    async fn deploy_dst_escrow(&self, immutables: &Immutables) -> ResolverResult<H256>;

    async fn withdraw(
        &self,
        side: EscrowSide,
        immutables: &Immutables,
        secret: &Secret,
    ) -> ResolverResult<H256>;

    async fn cancel(&self, side: EscrowSide, immutables: &Immutables) -> ResolverResult<H256>;

    async fn health_check(&self) -> bool;
}

/// Owns the client for every enabled chain
pub struct ChainManager {
    clients: DashMap<u64, Arc<dyn ChainClient>>,
    simulated: DashMap<u64, Arc<SimulatedChain>>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            simulated: DashMap::new(),
        }
    }

    /// Build clients for all enabled chains
    pub async fn from_settings(settings: &Settings) -> ResolverResult<Self> {
        let manager = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {}, {:?})",
                name, chain_config.chain_id, chain_config.kind
            );

            let resolver = chain_config
                .resolver()
                .map_err(|e| ResolverError::Config(e.to_string()))?;

            match chain_config.kind {
                ChainKind::Simulated => {
                    let chain = Arc::new(SimulatedChain::with_registry(
                        chain_config.chain_id,
                        resolver,
                        Clock::System,
                        EscrowRegistry::with_min_safety_deposit_bps(
                            chain_config.min_safety_deposit_bps,
                        ),
                    ));
                    manager.register_simulated(chain);
                }
                ChainKind::Evm => {
                    let key_env = settings
                        .wallet
                        .private_key_env
                        .as_deref()
                        .unwrap_or(DEFAULT_KEY_ENV);
                    let wallet = TransactionSender::load_wallet(key_env)?;
                    let client =
                        EvmChainClient::connect(chain_config, wallet, &settings.resolver).await?;
                    manager.register(Arc::new(client));
                }
            }

            info!("Chain {} initialized successfully", name);
        }

        if manager.clients.is_empty() {
            warn!("No chains initialized");
        }

        Ok(manager)
    }

    pub fn register(&self, client: Arc<dyn ChainClient>) {
        self.clients.insert(client.chain_id(), client);
    }

    pub fn register_simulated(&self, chain: Arc<SimulatedChain>) {
        self.simulated.insert(chain.chain_id(), chain.clone());
        self.register(chain);
    }

    /// Get client for a specific chain
    pub fn get(&self, chain_id: u64) -> ResolverResult<Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(ResolverError::UnsupportedChain { chain_id })
    }

    /// Get a simulated chain, for demo endpoints and tests
    pub fn simulated(&self, chain_id: u64) -> ResolverResult<Arc<SimulatedChain>> {
        self.simulated
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(ResolverError::UnsupportedChain { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let clients: Vec<_> = self.clients.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::with_capacity(clients.len());

        for client in clients {
            let chain_id = client.chain_id();
            let healthy = client.health_check().await;
            crate::metrics::record_chain_health(chain_id, healthy);
            results.push((chain_id, healthy));
        }

        results.sort_by_key(|(id, _)| *id);
        results
    }

    /// All connected chain IDs, ascending
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;

    #[tokio::test]
    async fn test_from_settings_builds_simulated_chains() {
        let manager = ChainManager::from_settings(&sample_settings()).await.unwrap();
        assert_eq!(manager.connected_chains(), vec![1, 137]);
        assert!(manager.simulated(137).is_ok());

        let health = manager.health_check().await;
        assert!(health.iter().all(|(_, healthy)| *healthy));
    }

    #[test]
    fn test_unknown_chain() {
        let manager = ChainManager::new();
        let err = manager.get(42).err().unwrap();
        assert_eq!(err.to_string(), "Unsupported chain 42");
    }

    #[test]
    fn test_register_mock_client() {
        let mut mock = MockChainClient::new();
        mock.expect_chain_id().return_const(10u64);
        let manager = ChainManager::new();
        manager.register(Arc::new(mock));
        assert_eq!(manager.connected_chains(), vec![10]);
        assert!(manager.simulated(10).is_err());
    }
}
