//! Per-chain order monitoring
//!
//! Polls the chain client for new events in bounded block ranges, persists a
//! checkpoint after each range and forwards every event it has not seen before.
//! A periodic reconciliation pass re-scans recent blocks to pick up events a
//! node indexed late.

use crate::chain::ChainClient;
use crate::config::ResolverConfig;
use crate::error::ResolverResult;
use crate::events::ContractEvent;
use crate::state::StateStore;
use crate::types::EscrowSide;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

type EventKey = (H256, &'static str, Option<EscrowSide>);

/// Monitor tuning, taken from the resolver section of the settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_lookback_blocks: u64,
    pub max_block_range: u64,
}

impl From<&ResolverConfig> for MonitorConfig {
    fn from(config: &ResolverConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs),
            reconcile_lookback_blocks: config.reconcile_lookback_blocks,
            max_block_range: config.max_block_range.max(1),
        }
    }
}

/// Watches one chain for order and escrow events
pub struct OrderMonitor {
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    store: Arc<dyn StateStore>,
    event_tx: broadcast::Sender<ContractEvent>,
    config: MonitorConfig,
    /// Events already forwarded, with their block; pruned behind the lookback window
    seen: DashMap<EventKey, u64>,
    /// Last processed block; `None` until the first poll
    last_processed: Mutex<Option<u64>>,
}

impl OrderMonitor {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn StateStore>,
        event_tx: broadcast::Sender<ContractEvent>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            chain_id: client.chain_id(),
            client,
            store,
            event_tx,
            config,
            seen: DashMap::new(),
            last_processed: Mutex::new(None),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Main loop: poll on every tick, reconcile on its own interval
    pub async fn run(self: Arc<Self>, shutdown: Arc<RwLock<bool>>) {
        info!("Monitoring chain {}", self.chain_id);

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut reconcile = tokio::time::interval(self.config.reconcile_interval);
        // The first reconcile tick fires immediately; skip it
        reconcile.tick().await;

        loop {
            if *shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("Chain {}: poll failed: {}", self.chain_id, e);
                    }
                }
                _ = reconcile.tick() => {
                    match self.reconcile_once().await {
                        Ok(0) => {}
                        Ok(n) => info!("Chain {}: reconciliation recovered {} events", self.chain_id, n),
                        Err(e) => error!("Chain {}: reconciliation failed: {}", self.chain_id, e),
                    }
                }
            }
        }

        info!("Monitor for chain {} stopped", self.chain_id);
    }

    /// Process every block up to the current head. Returns events forwarded.
    pub async fn poll_once(&self) -> ResolverResult<usize> {
        let head = self.client.block_number().await?;
        let mut last_processed = self.last_processed.lock().await;

        let mut last = match *last_processed {
            Some(block) => block,
            None => self.starting_block(head).await?,
        };
        *last_processed = Some(last);

        let mut forwarded = 0;
        while last < head {
            let from_block = last + 1;
            let to_block = std::cmp::min(head, from_block + self.config.max_block_range - 1);

            debug!(
                "Chain {}: processing blocks {} to {}",
                self.chain_id, from_block, to_block
            );

            // A failed range leaves the checkpoint untouched and is retried next poll
            let events = self.client.order_events(from_block, to_block).await?;
            for event in events {
                if self.forward(event) {
                    forwarded += 1;
                }
            }

            last = to_block;
            *last_processed = Some(last);
            if let Err(e) = self.store.save_checkpoint(self.chain_id, last).await {
                warn!("Failed to save checkpoint for chain {}: {}", self.chain_id, e);
            }
            crate::metrics::record_block_height(self.chain_id, last);
        }

        Ok(forwarded)
    }

    /// Re-scan the lookback window and forward anything missed
    pub async fn reconcile_once(&self) -> ResolverResult<usize> {
        let last = match *self.last_processed.lock().await {
            Some(block) => block,
            None => return Ok(0),
        };
        if last == 0 {
            return Ok(0);
        }

        let from_block = last
            .saturating_sub(self.config.reconcile_lookback_blocks)
            .max(1);
        let mut forwarded = 0;
        let mut start = from_block;
        while start <= last {
            let end = std::cmp::min(last, start + self.config.max_block_range - 1);
            for event in self.client.order_events(start, end).await? {
                if self.forward(event) {
                    forwarded += 1;
                }
            }
            start = end + 1;
        }

        // Blocks before the window are never scanned again
        self.seen.retain(|_, block| *block >= from_block);

        Ok(forwarded)
    }

    /// Resume after the checkpoint, or just behind the head on a fresh start
    async fn starting_block(&self, head: u64) -> ResolverResult<u64> {
        let checkpoint = self.store.get_checkpoint(self.chain_id).await?;
        let start = checkpoint
            .unwrap_or_else(|| head.saturating_sub(self.config.reconcile_lookback_blocks));
        info!(
            "Chain {}: starting after block {} (checkpoint {:?}, head {})",
            self.chain_id, start, checkpoint, head
        );
        Ok(start)
    }

    /// Forward an event unless it was already seen
    fn forward(&self, event: ContractEvent) -> bool {
        let key = match event_key(&event) {
            Some(key) => key,
            None => return false,
        };
        match self.seen.entry(key) {
            Entry::Occupied(_) => {
                debug!("Chain {}: duplicate {} ignored", self.chain_id, event.name());
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(event.block_number());
            }
        }

        crate::metrics::record_event(self.chain_id, &event);
        // No receivers is fine
        let _ = self.event_tx.send(event);
        true
    }
}

fn event_key(event: &ContractEvent) -> Option<EventKey> {
    let side = match event {
        ContractEvent::EscrowCreated { side, .. }
        | ContractEvent::EscrowLocked { side, .. }
        | ContractEvent::EscrowClaimed { side, .. }
        | ContractEvent::EscrowCancelled { side, .. } => Some(*side),
        _ => None,
    };
    event.order_hash().map(|hash| (hash, event.name(), side))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Clock, MockChainClient, SimulatedChain};
    use crate::state::MemoryStore;
    use crate::types::order::tests::sample_intent;
    use crate::types::{Secret, StageOffsets, Timelocks};
    use ethers::types::{Address, U256};

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(10),
            reconcile_interval: Duration::from_secs(1),
            reconcile_lookback_blocks: 100,
            max_block_range: 1000,
        }
    }

    fn order_event(salt: u64, block_number: u64) -> ContractEvent {
        let mut intent = sample_intent();
        intent.salt = U256::from(salt);
        ContractEvent::OrderCreated {
            chain_id: 1,
            order_hash: intent.order_hash(),
            intent,
            hashlock: Secret::new([1u8; 32]).hashlock(),
            timelocks: Timelocks::default(),
            block_number,
            tx_hash: H256::zero(),
        }
    }

    async fn submit(chain: &SimulatedChain, salt: u64) -> H256 {
        let mut intent = sample_intent();
        intent.salt = U256::from(salt);
        chain
            .submit_order(
                intent,
                Secret::random().hashlock(),
                Timelocks::pack(&StageOffsets::default(), 0),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_poll_forwards_new_orders_once() {
        let chain = Arc::new(SimulatedChain::new(1, Address::repeat_byte(0xbb), Clock::manual(1_000)));
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = broadcast::channel(16);
        let monitor = OrderMonitor::new(chain.clone(), store.clone(), tx, config());

        let first = submit(&chain, 1).await;
        submit(&chain, 2).await;

        assert_eq!(monitor.poll_once().await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap().order_hash(), Some(first));
        assert_eq!(store.get_checkpoint(1).await.unwrap(), Some(2));

        // Nothing new
        assert_eq!(monitor.poll_once().await.unwrap(), 0);

        submit(&chain, 3).await;
        assert_eq!(monitor.poll_once().await.unwrap(), 1);
        assert_eq!(store.get_checkpoint(1).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint() {
        let chain = Arc::new(SimulatedChain::new(1, Address::repeat_byte(0xbb), Clock::manual(1_000)));
        let store = Arc::new(MemoryStore::new());
        submit(&chain, 1).await;
        submit(&chain, 2).await;
        store.save_checkpoint(1, 1).await.unwrap();

        let (tx, _rx) = broadcast::channel(16);
        let monitor = OrderMonitor::new(chain, store, tx, config());
        assert_eq!(monitor.poll_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_block_ranges_are_bounded() {
        let mut mock = MockChainClient::new();
        mock.expect_chain_id().return_const(1u64);
        mock.expect_block_number().returning(|| Ok(2_500));
        let mut seq = mockall::Sequence::new();
        for (from, to) in [(1u64, 1_000u64), (1_001, 2_000), (2_001, 2_500)] {
            mock.expect_order_events()
                .withf(move |f, t| *f == from && *t == to)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(Vec::new()));
        }

        let store = Arc::new(MemoryStore::new());
        store.save_checkpoint(1, 0).await.unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let monitor = OrderMonitor::new(Arc::new(mock), store.clone(), tx, config());

        monitor.poll_once().await.unwrap();
        assert_eq!(store.get_checkpoint(1).await.unwrap(), Some(2_500));
    }

    #[tokio::test]
    async fn test_failed_range_keeps_checkpoint() {
        let mut mock = MockChainClient::new();
        mock.expect_chain_id().return_const(1u64);
        mock.expect_block_number().returning(|| Ok(50));
        mock.expect_order_events().returning(|_, _| {
            Err(crate::error::ResolverError::ChainConnection {
                chain_id: 1,
                message: "down".to_string(),
            })
        });

        let store = Arc::new(MemoryStore::new());
        store.save_checkpoint(1, 10).await.unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let monitor = OrderMonitor::new(Arc::new(mock), store.clone(), tx, config());

        assert!(monitor.poll_once().await.is_err());
        assert_eq!(store.get_checkpoint(1).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_reconcile_emits_only_missed_events() {
        let early = order_event(1, 5);
        let late = order_event(2, 6);

        let mut mock = MockChainClient::new();
        mock.expect_chain_id().return_const(1u64);
        mock.expect_block_number().returning(|| Ok(10));
        let (first, second) = (early.clone(), late.clone());
        let mut calls = 0;
        mock.expect_order_events()
            .withf(|f, t| *f == 1 && *t == 10)
            .returning(move |_, _| {
                calls += 1;
                // The node only indexes the second event after the first poll
                if calls == 1 {
                    Ok(vec![first.clone()])
                } else {
                    Ok(vec![first.clone(), second.clone()])
                }
            });

        let store = Arc::new(MemoryStore::new());
        store.save_checkpoint(1, 0).await.unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        let monitor = OrderMonitor::new(Arc::new(mock), store, tx, config());

        assert_eq!(monitor.poll_once().await.unwrap(), 1);
        assert_eq!(monitor.reconcile_once().await.unwrap(), 1);
        assert_eq!(monitor.reconcile_once().await.unwrap(), 0);

        assert_eq!(rx.recv().await.unwrap(), early);
        assert_eq!(rx.recv().await.unwrap(), late);
    }

    #[tokio::test]
    async fn test_reconcile_prunes_keys_behind_window() {
        let old = order_event(1, 5);
        let recent = order_event(2, 150);

        let mut mock = MockChainClient::new();
        mock.expect_chain_id().return_const(1u64);
        mock.expect_block_number().returning(|| Ok(200));
        let (a, b) = (old.clone(), recent.clone());
        mock.expect_order_events().returning(move |from, to| {
            Ok([a.clone(), b.clone()]
                .into_iter()
                .filter(|e| (from..=to).contains(&e.block_number()))
                .collect())
        });

        let store = Arc::new(MemoryStore::new());
        store.save_checkpoint(1, 0).await.unwrap();
        let (tx, _rx) = broadcast::channel(16);
        let monitor = OrderMonitor::new(Arc::new(mock), store, tx, config());

        assert_eq!(monitor.poll_once().await.unwrap(), 2);
        assert_eq!(monitor.seen.len(), 2);

        // Window is blocks 100..=200: the block 5 key goes, block 150 stays
        assert_eq!(monitor.reconcile_once().await.unwrap(), 0);
        assert_eq!(monitor.seen.len(), 1);
        assert!(monitor.seen.iter().all(|e| *e.value() == 150));
    }

    #[tokio::test]
    async fn test_reconcile_before_first_poll_is_noop() {
        let mut mock = MockChainClient::new();
        mock.expect_chain_id().return_const(1u64);
        let (tx, _rx) = broadcast::channel(16);
        let monitor = OrderMonitor::new(Arc::new(mock), Arc::new(MemoryStore::new()), tx, config());
        assert_eq!(monitor.reconcile_once().await.unwrap(), 0);
    }
}
