//! Transaction sender with retry logic and receipt tracking

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{ChainProvider, GasPrice};
use crate::config::ResolverConfig;
use crate::error::{ResolverError, ResolverResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(180);
const RECEIPT_POLL: Duration = Duration::from_secs(2);

/// Signs and submits transactions for one chain
pub struct TransactionSender {
    provider: Arc<ChainProvider>,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    /// Wallet bound to the chain id
    wallet: LocalWallet,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl TransactionSender {
    pub async fn new(
        provider: Arc<ChainProvider>,
        wallet: LocalWallet,
        config: &ResolverConfig,
    ) -> ResolverResult<Self> {
        let chain_id = provider.chain_id();
        let wallet = wallet.with_chain_id(chain_id);
        let nonce_manager = NonceManager::new(chain_id, wallet.address());

        if let Err(e) = nonce_manager.init(&provider).await {
            warn!("Failed to init nonce for chain {}: {}", chain_id, e);
        }

        info!(
            "Transaction sender for chain {} using wallet {:?}",
            chain_id,
            wallet.address()
        );

        Ok(Self {
            provider,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            max_retries: config.max_retries.max(1),
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    /// Load the signing key from the named environment variable
    pub fn load_wallet(env_name: &str) -> ResolverResult<LocalWallet> {
        let key = std::env::var(env_name).map_err(|_| {
            ResolverError::Wallet(format!("No wallet configured. Set {}", env_name))
        })?;
        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| ResolverError::Wallet(format!("Invalid private key: {}", e)))
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn gas_estimator(&self) -> &GasEstimator {
        &self.gas_estimator
    }

    /// Submit a contract call and wait for it to be mined
    pub async fn submit(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> ResolverResult<TransactionReceipt> {
        let chain_id = self.provider.chain_id();
        let nonce = self.nonce_manager.next().await?;

        if self.nonce_manager.pending_count().await > 0 {
            // Keep the local view honest before stacking more transactions
            if let Err(e) = self.nonce_manager.sync(&self.provider).await {
                debug!("Nonce sync on chain {} failed: {}", chain_id, e);
            }
        }

        let gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;
        let mut tx = self.build_tx(to, data, value, nonce, &gas_price);
        let gas_limit = self.gas_estimator.estimate_limit(&self.provider, &tx).await?;
        tx.set_gas(gas_limit);

        let tx_hash = match self.send_with_retry(&tx).await {
            Ok(hash) => hash,
            Err(e) => {
                self.nonce_manager.release(nonce).await?;
                return Err(e);
            }
        };
        self.nonce_manager.mark_pending(nonce, tx_hash).await?;
        crate::metrics::record_tx_submitted(chain_id);

        let receipt = self.wait_for_receipt(tx_hash).await?;
        self.nonce_manager.confirm(nonce).await?;

        if receipt.status != Some(U64::from(1)) {
            return Err(ResolverError::Transaction(format!(
                "Transaction {:?} reverted on chain {}",
                tx_hash, chain_id
            )));
        }

        Ok(receipt)
    }

    fn build_tx(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
        nonce: u64,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        let chain_id = self.provider.chain_id();
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(self.wallet.address())
                .to(to)
                .data(data)
                .value(value)
                .nonce(nonce)
                .gas_price(*price)
                .chain_id(chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(self.wallet.address())
                .to(to)
                .data(data)
                .value(value)
                .nonce(nonce)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(chain_id)
                .into(),
        }
    }

    /// Send transaction with retry logic
    async fn send_with_retry(&self, tx: &TypedTransaction) -> ResolverResult<H256> {
        let chain_id = self.provider.chain_id();
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.max_retries {
            attempts += 1;

            let signed_tx = match self.wallet.sign_transaction(tx).await {
                Ok(sig) => tx.rlp_signed(&sig),
                Err(e) => {
                    error!("Failed to sign transaction: {}", e);
                    return Err(ResolverError::Wallet(e.to_string()));
                }
            };

            let result = timeout(
                SEND_TIMEOUT,
                self.provider.http().send_raw_transaction(signed_tx),
            )
            .await;

            match result {
                Ok(Ok(pending_tx)) => {
                    let tx_hash = pending_tx.tx_hash();
                    info!(
                        "Transaction sent on chain {}: {:?} (attempt {}/{})",
                        chain_id, tx_hash, attempts, self.max_retries
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    let error_msg = e.to_string();

                    if error_msg.contains("nonce too low") {
                        warn!("Nonce too low on chain {}, syncing", chain_id);
                        self.nonce_manager.sync(&self.provider).await?;
                        return Err(ResolverError::Nonce {
                            chain_id,
                            message: "Nonce too low".to_string(),
                        });
                    } else if error_msg.contains("insufficient funds") {
                        let have = self.get_balance().await.unwrap_or_default();
                        return Err(ResolverError::InsufficientBalance {
                            chain_id,
                            have: have.to_string(),
                            need: tx.value().copied().unwrap_or_default().to_string(),
                        });
                    } else if error_msg.contains("rate limit") || error_msg.contains("429") {
                        last_error = Some(ResolverError::RateLimited { chain_id });
                        self.provider.failover();
                    } else {
                        last_error = Some(ResolverError::Transaction(error_msg));
                    }
                }
                Err(_) => {
                    warn!("Transaction send timeout (attempt {})", attempts);
                    last_error = Some(ResolverError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                }
            }

            if attempts < self.max_retries {
                tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| ResolverError::Transaction("Unknown error".to_string())))
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> ResolverResult<TransactionReceipt> {
        let poll = async {
            loop {
                match self.provider.get_transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => debug!("Receipt lookup for {:?} failed: {}", tx_hash, e),
                }
                tokio::time::sleep(RECEIPT_POLL).await;
            }
        };

        timeout(RECEIPT_TIMEOUT, poll)
            .await
            .map_err(|_| ResolverError::Timeout {
                operation: format!("receipt for {:?}", tx_hash),
            })
    }

    /// Get wallet balance
    pub async fn get_balance(&self) -> ResolverResult<U256> {
        self.provider
            .http()
            .get_balance(self.wallet.address(), None)
            .await
            .map_err(|e| ResolverError::ChainConnection {
                chain_id: self.provider.chain_id(),
                message: e.to_string(),
            })
    }
}
