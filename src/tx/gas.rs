//! Gas estimation with safety buffers

use crate::chain::{ChainProvider, GasPrice};
use crate::error::ResolverResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::{debug, warn};

/// Gas estimator for escrow transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    /// Limit used when the node cannot estimate the call
    fallback_gas_limit: U256,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
            fallback_gas_limit: U256::from(300_000),
        }
    }

    /// Gas limit for a call, with buffer
    pub async fn estimate_limit(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
    ) -> ResolverResult<U256> {
        let base = match provider.estimate_gas(tx).await {
            Ok(gas) => gas,
            Err(e) => {
                warn!(
                    "Gas estimation failed on chain {}, using fallback: {}",
                    provider.chain_id(),
                    e
                );
                self.fallback_gas_limit
            }
        };
        Ok(self.with_limit_buffer(base))
    }

    fn with_limit_buffer(&self, gas: U256) -> U256 {
        gas + gas * self.gas_limit_buffer_percent / 100
    }

    /// Get buffered gas price for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> ResolverResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.with_price_buffer(gas_price);
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn with_price_buffer(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }

    /// Worst-case cost in wei of spending `gas_units` at the current price
    pub async fn estimate_cost(
        &self,
        provider: &ChainProvider,
        gas_units: u64,
    ) -> ResolverResult<U256> {
        let price = self.get_gas_price(provider).await?;
        Ok(Self::calculate_cost(
            self.with_limit_buffer(U256::from(gas_units)),
            &price,
        ))
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        gas_limit.saturating_mul(gas_price.per_gas())
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers() {
        let estimator = GasEstimator::new();
        assert_eq!(estimator.with_limit_buffer(U256::from(100_000)), U256::from(120_000));

        match estimator.with_price_buffer(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(100),
            max_priority_fee_per_gas: U256::from(10),
        }) {
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, U256::from(110));
                assert_eq!(max_priority_fee_per_gas, U256::from(11));
            }
            other => panic!("unexpected price {:?}", other),
        }
    }

    #[test]
    fn test_calculate_cost() {
        let cost = GasEstimator::calculate_cost(
            U256::from(21_000),
            &GasPrice::Legacy(U256::from(1_000_000_000u64)),
        );
        assert_eq!(cost, U256::from(21_000_000_000_000u64));
    }
}
