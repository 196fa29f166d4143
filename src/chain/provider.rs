//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{ResolverError, ResolverResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

const GWEI: u64 = 1_000_000_000;

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain_id: u64,
    gas_price_strategy: GasPriceStrategy,
    max_gas_price_gwei: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: AtomicU64,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: &ChainConfig) -> ResolverResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(ResolverError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id: config.chain_id,
            gas_price_strategy: config.gas_price_strategy.clone(),
            max_gas_price_gwei: config.max_gas_price_gwei,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: AtomicU64::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    fn connection_error(&self, message: impl Into<String>) -> ResolverError {
        ResolverError::ChainConnection {
            chain_id: self.chain_id,
            message: message.into(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> ResolverResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    self.last_block.store(block_num, Ordering::Relaxed);
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Timestamp of the latest block
    pub async fn get_block_timestamp(&self) -> ResolverResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block(BlockNumber::Latest).await {
                Ok(Some(block)) => return Ok(block.timestamp.as_u64()),
                Ok(None) => return Err(self.connection_error("latest block unavailable")),
                Err(e) => {
                    warn!("Failed to get latest block from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Last block number observed by `get_block_number`
    pub fn last_block(&self) -> u64 {
        self.last_block.load(Ordering::Relaxed)
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> ResolverResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e.to_string()))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> ResolverResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }

    /// Get the on-chain transaction count of an account
    pub async fn get_transaction_count(&self, address: Address) -> ResolverResult<u64> {
        self.http()
            .get_transaction_count(address, None)
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ResolverError::Nonce {
                chain_id: self.chain_id,
                message: e.to_string(),
            })
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> ResolverResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| ResolverError::GasEstimation(e.to_string()))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> ResolverResult<GasPrice> {
        match self.gas_price_strategy {
            // Arbitrum's L1 + L2 model is priced through eth_gasPrice
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| ResolverError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(self.cap(price)))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> ResolverResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| ResolverError::GasEstimation(e.to_string()))?
            .ok_or_else(|| ResolverError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| ResolverError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2 * GWEI);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = self.cap(base_fee * 2 + priority_fee);

        Ok((max_fee, priority_fee))
    }

    fn cap(&self, price: U256) -> U256 {
        let max = U256::from(self.max_gas_price_gwei) * U256::from(GWEI);
        std::cmp::min(price, max)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain_id, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Upper bound paid per gas unit
    pub fn per_gas(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }
}
