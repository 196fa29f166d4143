//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking to avoid conflicts between concurrent executions
//! - Nonce gap detection and recovery
//! - Release of nonces whose transaction never reached the mempool

use crate::chain::ChainProvider;
use crate::error::{ResolverError, ResolverResult};

use ethers::types::{Address, H256};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Submitted but unconfirmed: nonce -> tx hash
    pending: HashMap<u64, H256>,
    /// Highest confirmed nonce
    confirmed: Option<u64>,
}

/// Nonce allocator for one wallet on one chain
pub struct NonceManager {
    chain_id: u64,
    wallet_address: Address,
    state: Mutex<Option<NonceState>>,
}

impl NonceManager {
    pub fn new(chain_id: u64, wallet_address: Address) -> Self {
        Self {
            chain_id,
            wallet_address,
            state: Mutex::new(None),
        }
    }

    /// Seed the local counter from an explicit starting nonce
    pub async fn init_at(&self, nonce: u64) {
        *self.state.lock().await = Some(NonceState {
            current: nonce,
            pending: HashMap::new(),
            confirmed: nonce.checked_sub(1),
        });
        debug!("Initialized nonce for chain {}: {}", self.chain_id, nonce);
    }

    /// Seed the local counter from the chain
    pub async fn init(&self, provider: &ChainProvider) -> ResolverResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        self.init_at(on_chain).await;
        Ok(())
    }

    fn not_initialized(&self) -> ResolverError {
        ResolverError::Nonce {
            chain_id: self.chain_id,
            message: "Chain not initialized".to_string(),
        }
    }

    /// Allocate the next nonce
    pub async fn next(&self) -> ResolverResult<u64> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;
        let nonce = state.current;
        state.current += 1;

        debug!("Allocated nonce {} for chain {}", nonce, self.chain_id);
        Ok(nonce)
    }

    pub async fn mark_pending(&self, nonce: u64, tx_hash: H256) -> ResolverResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;
        state.pending.insert(nonce, tx_hash);
        Ok(())
    }

    /// Confirm a nonce (transaction mined)
    pub async fn confirm(&self, nonce: u64) -> ResolverResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;
        state.pending.remove(&nonce);
        if state.confirmed.map_or(true, |c| nonce > c) {
            state.confirmed = Some(nonce);
        }
        Ok(())
    }

    /// Release a nonce whose transaction was never accepted
    pub async fn release(&self, nonce: u64) -> ResolverResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed out again
        if state.current == nonce + 1 {
            state.current = nonce;
        }
        Ok(())
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, provider: &ChainProvider) -> ResolverResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        self.sync_to(on_chain).await
    }

    async fn sync_to(&self, on_chain: u64) -> ResolverResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;

        let expected = state.confirmed.map_or(0, |c| c + 1);
        if on_chain > expected {
            warn!(
                "Nonce gap detected on chain {}: expected {}, got {}",
                self.chain_id, expected, on_chain
            );
        }

        state.pending.retain(|nonce, _| *nonce >= on_chain);
        state.confirmed = on_chain.checked_sub(1);
        if state.current < on_chain {
            state.current = on_chain;
        }

        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }
}
