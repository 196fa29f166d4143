//! Revealed-secret store
//!
//! Secrets reach the resolver from the maker (API) or from `EscrowClaimed`
//! events. A secret is only accepted for a registered order and only if it
//! opens that order's hashlock.

use crate::error::{EscrowError, ResolverError, ResolverResult};
use crate::types::{Hashlock, Secret};

use dashmap::DashMap;
use ethers::types::H256;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

pub struct SecretStore {
    hashlocks: DashMap<H256, Hashlock>,
    secrets: DashMap<H256, Secret>,
    notify: Notify,
}

impl SecretStore {
    pub fn new() -> Self {
        Self {
            hashlocks: DashMap::new(),
            secrets: DashMap::new(),
            notify: Notify::new(),
        }
    }

    /// Track an order so secrets for it can be accepted
    pub fn register(&self, order_hash: H256, hashlock: Hashlock) {
        self.hashlocks.insert(order_hash, hashlock);
    }

    /// Accept a secret. Returns `false` if it was already known.
    pub fn submit(&self, order_hash: H256, secret: Secret) -> ResolverResult<bool> {
        let hashlock = self
            .hashlocks
            .get(&order_hash)
            .map(|h| *h)
            .ok_or_else(|| ResolverError::OrderNotFound {
                order_hash: format!("{:?}", order_hash),
            })?;

        if !hashlock.verify(&secret) {
            return Err(EscrowError::InvalidSecret.into());
        }

        if self.secrets.insert(order_hash, secret).is_some() {
            debug!("Secret for order {:?} already known", order_hash);
            return Ok(false);
        }

        info!("Secret received for order {:?}", order_hash);
        crate::metrics::record_secret_received();
        self.notify.notify_waiters();
        Ok(true)
    }

    pub fn get(&self, order_hash: H256) -> Option<Secret> {
        self.secrets.get(&order_hash).map(|s| *s)
    }

    /// Wait until the secret for an order is known
    pub async fn wait_for(&self, order_hash: H256, timeout: Duration) -> ResolverResult<Secret> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking to avoid missing a wakeup
            let notified = self.notify.notified();
            if let Some(secret) = self.get(order_hash) {
                return Ok(secret);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ResolverError::SecretUnavailable {
                    order_hash: format!("{:?}", order_hash),
                });
            }
        }
    }

    /// Drop all state for a finished order
    pub fn forget(&self, order_hash: H256) {
        self.hashlocks.remove(&order_hash);
        self.secrets.remove(&order_hash);
    }

    pub fn tracked(&self) -> usize {
        self.hashlocks.len()
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}
