//! Main coordination engine for order evaluation and execution

use super::executor::{CrossChainExecutor, ExecutionReport};
use super::secrets::SecretStore;
use crate::chain::ChainManager;
use crate::config::Settings;
use crate::error::{EscrowError, ResolverError, ResolverResult};
use crate::events::ContractEvent;
use crate::pricing::{ProfitabilityAnalyzer, QuoteEngine};
use crate::state::StateStore;
use crate::types::{
    now_secs, EscrowSide, Hashlock, Immutables, Intent, Order, OrderStatus, Secret, Stage,
    Timelocks,
};

use dashmap::{DashMap, DashSet};
use ethers::types::H256;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// Slack added to recovered refund deadlines for clock skew between resolver and chain
const REFUND_MARGIN_SECS: u64 = 60;

/// A locked escrow leg of a failed order, cancelled once its timelock opens
#[derive(Debug, Clone)]
struct PendingRefund {
    chain_id: u64,
    immutables: Immutables,
    /// Chain time before which cancelling cannot succeed
    not_before: u64,
}

/// Consumes monitor events and drives orders through evaluation and execution
pub struct CoordinationEngine {
    /// Chain manager for multi-chain access
    chains: Arc<ChainManager>,
    /// Order persistence
    store: Arc<dyn StateStore>,
    secrets: Arc<SecretStore>,
    quotes: Arc<QuoteEngine>,
    analyzer: ProfitabilityAnalyzer,
    executor: Arc<CrossChainExecutor>,
    /// Bounds concurrent executions
    permits: Arc<Semaphore>,
    /// Orders in flight; terminal orders are guarded by the store instead
    seen: DashSet<H256>,
    refunds: DashMap<(H256, EscrowSide), PendingRefund>,
    executions: Mutex<JoinSet<()>>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl CoordinationEngine {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn StateStore>,
        secrets: Arc<SecretStore>,
        quotes: Arc<QuoteEngine>,
        settings: &Settings,
        shutdown: Arc<RwLock<bool>>,
    ) -> Self {
        let resolver = &settings.resolver;
        let executor = Arc::new(CrossChainExecutor::new(
            chains.clone(),
            secrets.clone(),
            resolver.max_retries,
            Duration::from_millis(resolver.retry_delay_ms),
            Duration::from_secs(resolver.secret_wait_secs),
        ));

        Self {
            chains,
            store,
            secrets,
            quotes,
            analyzer: ProfitabilityAnalyzer::new(settings.profitability.clone()),
            executor,
            permits: Arc::new(Semaphore::new(resolver.max_concurrent_orders.max(1))),
            seen: DashSet::new(),
            refunds: DashMap::new(),
            executions: Mutex::new(JoinSet::new()),
            shutdown,
        }
    }

    /// Reload unfinished orders after a restart.
    ///
    /// Evaluated orders still valid are dispatched again. Orders interrupted
    /// mid-flight are marked failed and any escrow they may have locked is
    /// queued for cancellation.
    pub async fn recover(self: &Arc<Self>) -> ResolverResult<()> {
        let pending = self.store.pending_orders().await?;
        if pending.is_empty() {
            return Ok(());
        }
        info!("Recovering {} unfinished orders", pending.len());

        for mut order in pending {
            match order.status {
                OrderStatus::Evaluated => {
                    if let Err(e) = order.intent.validate(now_secs()) {
                        warn!("Recovered order {:?} rejected: {}", order.order_hash, e);
                        order.error = Some(e.to_string());
                        order.set_status(OrderStatus::Rejected);
                        self.store.upsert_order(&order).await?;
                        continue;
                    }
                    self.seen.insert(order.order_hash);
                    self.secrets
                        .register(order.order_hash, order.src_immutables.hashlock);
                    self.dispatch(order).await;
                }
                OrderStatus::Executing => {
                    // Local time of the last status change stands in for the lock time
                    let started = order.updated_at.timestamp().max(0) as u64;
                    for side in [EscrowSide::Source, EscrowSide::Destination] {
                        self.queue_refund(&order, side, started + REFUND_MARGIN_SECS);
                    }
                    order.error = Some("interrupted by restart".to_string());
                    order.set_status(OrderStatus::Failed);
                    self.store.upsert_order(&order).await?;
                }
                _ => {
                    order.error = Some("interrupted by restart".to_string());
                    order.set_status(OrderStatus::Failed);
                    self.store.upsert_order(&order).await?;
                }
            }
        }
        Ok(())
    }

    /// Main coordination loop
    pub async fn run(self: Arc<Self>, mut event_rx: broadcast::Receiver<ContractEvent>) {
        let mut cleanup_interval = interval(CLEANUP_INTERVAL);
        let mut shutdown_check = interval(SHUTDOWN_CHECK_INTERVAL);

        info!("Coordination engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                received = event_rx.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("Error handling event: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Reconciliation re-delivers anything dropped here
                        warn!("Coordination engine lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        warn!("Event channel closed");
                        break;
                    }
                },

                _ = cleanup_interval.tick() => {
                    self.cleanup().await;
                }

                _ = shutdown_check.tick() => {}
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.drain()).await.is_err() {
            warn!("Executions still running after {:?}, aborting", SHUTDOWN_GRACE);
            self.executions.lock().await.shutdown().await;
        }

        info!("Coordination engine stopped");
    }

    /// Handle an incoming contract event
    pub async fn handle_event(self: &Arc<Self>, event: ContractEvent) -> ResolverResult<()> {
        if !event.requires_action() {
            debug!("No action for {} on chain {}", event.name(), event.chain_id());
            return Ok(());
        }
        debug!("Handling event: {}", event.name());

        match event {
            ContractEvent::OrderCreated {
                chain_id,
                order_hash,
                intent,
                hashlock,
                timelocks,
                block_number,
                ..
            } => {
                self.handle_order_created(chain_id, order_hash, intent, hashlock, timelocks, block_number)
                    .await?;
            }

            ContractEvent::EscrowClaimed {
                chain_id,
                order_hash,
                side,
                secret,
                ..
            } => {
                debug!(
                    "Secret revealed for order {:?} on chain {} ({})",
                    order_hash, chain_id, side
                );
                match self.secrets.submit(order_hash, secret) {
                    Ok(_) => {}
                    Err(ResolverError::OrderNotFound { .. }) => {
                        debug!("Ignoring claim for untracked order {:?}", order_hash);
                    }
                    Err(e) => return Err(e),
                }
            }

            ContractEvent::EscrowCancelled {
                chain_id,
                order_hash,
                side,
                ..
            } => {
                warn!(
                    "Escrow for order {:?} cancelled on chain {} ({})",
                    order_hash, chain_id, side
                );
                if self.refunds.remove(&(order_hash, side)).is_some() {
                    debug!("Refund for order {:?} ({}) no longer pending", order_hash, side);
                }
            }

            _ => {
                debug!("Unhandled event type: {}", event.name());
            }
        }

        Ok(())
    }

    async fn handle_order_created(
        self: &Arc<Self>,
        chain_id: u64,
        order_hash: H256,
        intent: Intent,
        hashlock: Hashlock,
        timelocks: Timelocks,
        block_number: u64,
    ) -> ResolverResult<()> {
        if !self.seen.insert(order_hash) {
            debug!("Order {:?} already handled", order_hash);
            return Ok(());
        }
        if let Some(existing) = self.store.get_order(order_hash).await? {
            debug!("Order {:?} already persisted ({})", order_hash, existing.status.as_str());
            if existing.status.is_terminal() {
                self.seen.remove(&order_hash);
            }
            return Ok(());
        }

        info!(
            "New order {:?} on chain {}: chain {} -> chain {}",
            order_hash, chain_id, intent.src_chain_id, intent.dst_chain_id
        );

        let rejection = self.check_intent(chain_id, &intent).err();
        let resolver_on = |id: u64| {
            self.chains
                .get(id)
                .map(|c| c.resolver_address())
                .unwrap_or_default()
        };
        let (src_resolver, dst_resolver) =
            (resolver_on(intent.src_chain_id), resolver_on(intent.dst_chain_id));

        let mut order = Order::from_intent(
            intent,
            hashlock,
            timelocks,
            src_resolver,
            dst_resolver,
            block_number,
        );

        if let Some(e) = rejection {
            warn!("Order {:?} rejected: {}", order_hash, e);
            crate::metrics::record_order_evaluated(false);
            order.error = Some(e.to_string());
            order.set_status(OrderStatus::Rejected);
            self.store.upsert_order(&order).await?;
            self.seen.remove(&order_hash);
            return Ok(());
        }
        self.store.upsert_order(&order).await?;

        let src = self.chains.get(order.intent.src_chain_id)?;
        let gas_cost = match src
            .estimate_gas_cost(self.analyzer.estimated_gas_units())
            .await
        {
            Ok(cost) => cost,
            Err(e) => {
                order.error = Some(e.to_string());
                order.set_status(OrderStatus::Rejected);
                self.store.upsert_order(&order).await?;
                self.seen.remove(&order_hash);
                return Err(e);
            }
        };

        let estimate = self.analyzer.analyze_order(&order, gas_cost, now_secs());
        crate::metrics::record_order_evaluated(estimate.profitable);
        let profitable = estimate.profitable;

        if !profitable {
            info!(
                "Order {:?} rejected: net profit {} wei, risk {:?} ({})",
                order_hash,
                estimate.net_profit_wei,
                estimate.risk,
                estimate.reasons.join(", ")
            );
            order.error = Some(format!("unprofitable: {}", estimate.reasons.join(", ")));
            order.profit = Some(estimate);
            order.set_status(OrderStatus::Rejected);
            self.store.upsert_order(&order).await?;
            self.seen.remove(&order_hash);
            return Ok(());
        }

        debug!(
            "Order {:?} accepted: net profit {} wei, priority {}",
            order_hash, estimate.net_profit_wei, estimate.priority
        );
        order.profit = Some(estimate);
        order.set_status(OrderStatus::Evaluated);
        self.store.upsert_order(&order).await?;
        self.secrets.register(order_hash, hashlock);

        self.dispatch(order).await;
        Ok(())
    }

    /// Checks an intent must pass before it is priced
    fn check_intent(&self, chain_id: u64, intent: &Intent) -> ResolverResult<()> {
        if intent.src_chain_id != chain_id {
            return Err(ResolverError::InvalidIntent(format!(
                "order emitted on chain {} claims source chain {}",
                chain_id, intent.src_chain_id
            )));
        }
        intent.validate(now_secs())?;
        self.chains.get(intent.src_chain_id)?;
        self.chains.get(intent.dst_chain_id)?;
        Ok(())
    }

    /// Spawn execution; it starts once a permit is free
    async fn dispatch(self: &Arc<Self>, mut order: Order) {
        let engine = self.clone();

        self.executions.lock().await.spawn(async move {
            let _permit = match engine.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            order.set_status(OrderStatus::Executing);
            if let Err(e) = engine.store.upsert_order(&order).await {
                error!("Failed to persist order {:?}: {}", order.order_hash, e);
            }

            let report = engine.executor.execute(&order).await;
            if report.completed {
                info!("Order {:?} completed", order.order_hash);
                order.set_status(OrderStatus::Completed);
            } else {
                warn!(
                    "Order {:?} failed: {}",
                    order.order_hash,
                    report.error.as_deref().unwrap_or("unknown error")
                );
                order.error = report.error.clone();
                order.set_status(OrderStatus::Failed);
                engine.schedule_refunds(&order, &report).await;
            }
            crate::metrics::record_order_finished(report.completed);

            if let Err(e) = engine.store.upsert_order(&order).await {
                error!("Failed to persist order {:?}: {}", order.order_hash, e);
            }
            engine.secrets.forget(order.order_hash);
            engine.seen.remove(&order.order_hash);
        });
    }

    /// Queue cancellation of every leg a failed execution left locked
    async fn schedule_refunds(&self, order: &Order, report: &ExecutionReport) {
        for side in report.unsettled_legs() {
            let chain_id = chain_for(order, side);
            let locked_at = match self.chains.get(chain_id) {
                Ok(client) => client.timestamp().await.unwrap_or_else(|_| now_secs()),
                Err(_) => now_secs(),
            };
            self.queue_refund(order, side, locked_at);
        }
    }

    fn queue_refund(&self, order: &Order, side: EscrowSide, locked_at: u64) {
        let immutables = order.immutables(side).clone();
        let stage = match side {
            EscrowSide::Source => Stage::SrcCancellation,
            EscrowSide::Destination => Stage::DstCancellation,
        };
        let not_before = locked_at + u64::from(immutables.timelocks.offset(stage));
        info!(
            "Order {:?}: {} escrow refund queued for chain time {}",
            order.order_hash, side, not_before
        );
        self.refunds.insert(
            (order.order_hash, side),
            PendingRefund {
                chain_id: chain_for(order, side),
                immutables,
                not_before,
            },
        );
    }

    /// Cancel queued escrows whose cancellation stage has opened.
    /// Returns how many were cancelled.
    async fn process_refunds(&self) -> usize {
        let queued: Vec<_> = self
            .refunds
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut cancelled = 0;
        for ((order_hash, side), refund) in queued {
            let client = match self.chains.get(refund.chain_id) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Dropping refund for order {:?} ({}): {}", order_hash, side, e);
                    self.refunds.remove(&(order_hash, side));
                    continue;
                }
            };
            match client.timestamp().await {
                Ok(now) if now >= refund.not_before => {}
                Ok(_) => continue,
                Err(e) => {
                    debug!("Chain {} clock unavailable: {}", refund.chain_id, e);
                    continue;
                }
            }

            match client.cancel(side, &refund.immutables).await {
                Ok(tx_hash) => {
                    info!(
                        "Order {:?}: {} escrow cancelled on chain {} ({:?})",
                        order_hash, side, refund.chain_id, tx_hash
                    );
                    self.refunds.remove(&(order_hash, side));
                    cancelled += 1;
                }
                Err(ResolverError::Escrow(EscrowError::TimelockNotReached { .. })) => {}
                Err(e) if e.is_retryable() => {
                    debug!("Refund for order {:?} ({}) will be retried: {}", order_hash, side, e);
                }
                Err(e) => {
                    warn!("Giving up refund for order {:?} ({}): {}", order_hash, side, e);
                    self.refunds.remove(&(order_hash, side));
                }
            }
        }
        cancelled
    }

    pub fn pending_refunds(&self) -> usize {
        self.refunds.len()
    }

    /// Accept a secret from the maker
    pub fn submit_secret(&self, order_hash: H256, secret: Secret) -> ResolverResult<bool> {
        self.secrets.submit(order_hash, secret)
    }

    /// Wait for every dispatched execution to finish
    pub async fn drain(&self) {
        let mut executions = self.executions.lock().await;
        while let Some(result) = executions.join_next().await {
            if let Err(e) = result {
                error!("Execution task failed: {}", e);
            }
        }
    }

    pub async fn active_executions(&self) -> usize {
        self.executions.lock().await.len()
    }

    async fn cleanup(&self) {
        let purged = self.quotes.purge_expired(now_secs());
        if purged > 0 {
            debug!("Purged {} expired quotes", purged);
        }

        let refunded = self.process_refunds().await;
        if refunded > 0 {
            info!("Cancelled {} expired escrows", refunded);
        }

        let mut executions = self.executions.lock().await;
        while let Some(result) = executions.try_join_next() {
            if let Err(e) = result {
                error!("Execution task failed: {}", e);
            }
        }
    }
}

fn chain_for(order: &Order, side: EscrowSide) -> u64 {
    match side {
        EscrowSide::Source => order.intent.src_chain_id,
        EscrowSide::Destination => order.intent.dst_chain_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainClient, Clock, SimulatedChain};
    use crate::config::tests::sample_settings;
    use crate::escrow::EscrowState;
    use crate::state::MemoryStore;
    use crate::types::order::tests::sample_intent;
    use crate::types::EscrowSide;
    use ethers::types::{Address, U256};

    const T0: u64 = 1_700_000_000;

    struct Harness {
        engine: Arc<CoordinationEngine>,
        store: Arc<MemoryStore>,
        src: Arc<SimulatedChain>,
        dst: Arc<SimulatedChain>,
    }

    fn harness() -> Harness {
        let settings = sample_settings();
        let resolver = Address::repeat_byte(0xbb);
        let src = Arc::new(SimulatedChain::new(1, resolver, Clock::manual(T0)));
        let dst = Arc::new(SimulatedChain::new(137, resolver, Clock::manual(T0)));
        let chains = Arc::new(ChainManager::new());
        chains.register_simulated(src.clone());
        chains.register_simulated(dst.clone());

        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(CoordinationEngine::new(
            chains,
            store.clone(),
            Arc::new(SecretStore::new()),
            Arc::new(QuoteEngine::new(&settings.pricing).unwrap()),
            &settings,
            Arc::new(RwLock::new(false)),
        ));

        Harness {
            engine,
            store,
            src,
            dst,
        }
    }

    /// An order event as a chain would report it, without the source chain's checks
    fn order_created(chain_id: u64, intent: Intent) -> ContractEvent {
        ContractEvent::OrderCreated {
            chain_id,
            order_hash: intent.order_hash(),
            intent,
            hashlock: Secret::random().hashlock(),
            timelocks: Timelocks::pack(&sample_settings().timelocks, 0),
            block_number: 1,
            tx_hash: H256::zero(),
        }
    }

    async fn assert_rejected(h: &Harness, event: ContractEvent, reason: &str) {
        let order_hash = event.order_hash().unwrap();
        h.engine.handle_event(event).await.unwrap();

        let order = h.store.get_order(order_hash).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(order.error.as_deref().unwrap().contains(reason), "{:?}", order.error);
        assert_eq!(h.engine.active_executions().await, 0);
        assert!(h.src.registry().is_empty());
        assert!(h.dst.registry().is_empty());
        assert!(!h.engine.seen.contains(&order_hash));
    }

    async fn publish(h: &Harness, intent: Intent, secret: &Secret) -> ContractEvent {
        let offsets = sample_settings().timelocks;
        h.src
            .submit_order(intent, secret.hashlock(), Timelocks::pack(&offsets, 0))
            .await
            .unwrap();
        let head = h.src.block_number().await.unwrap();
        h.src.order_events(head, head).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_profitable_order_is_executed() {
        let h = harness();
        let secret = Secret::random();
        let event = publish(&h, sample_intent(), &secret).await;
        let order_hash = event.order_hash().unwrap();

        h.engine.handle_event(event).await.unwrap();
        assert!(h.engine.submit_secret(order_hash, secret).unwrap());
        h.engine.drain().await;

        let order = h.store.get_order(order_hash).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed, "{:?}", order.error);
        assert!(order.profit.unwrap().profitable);

        let dst_escrow = h
            .dst
            .registry()
            .get(order_hash, EscrowSide::Destination)
            .unwrap();
        assert_eq!(dst_escrow.state, EscrowState::Claimed);
        assert_eq!(h.engine.secrets.tracked(), 0);
    }

    #[tokio::test]
    async fn test_unprofitable_order_is_rejected() {
        let h = harness();
        let mut intent = sample_intent();
        intent.resolver_fee = U256::zero();
        let event = publish(&h, intent, &Secret::random()).await;
        let order_hash = event.order_hash().unwrap();

        h.engine.handle_event(event).await.unwrap();
        assert_eq!(h.engine.active_executions().await, 0);

        let order = h.store.get_order(order_hash).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(order.error.unwrap().contains("no net profit"));
        assert!(h.src.registry().get(order_hash, EscrowSide::Source).is_none());
    }

    #[tokio::test]
    async fn test_expired_intent_is_rejected() {
        let h = harness();
        let mut intent = sample_intent();
        intent.expiry = 1;
        assert_rejected(&h, order_created(1, intent), "intent expired").await;
    }

    #[tokio::test]
    async fn test_same_chain_intent_is_rejected() {
        let h = harness();
        let mut intent = sample_intent();
        intent.dst_chain_id = 1;
        assert_rejected(&h, order_created(1, intent), "must differ").await;
    }

    #[tokio::test]
    async fn test_order_from_foreign_chain_is_rejected() {
        let h = harness();
        // Seen on chain 137 but claiming chain 1 as its source
        assert_rejected(
            &h,
            order_created(137, sample_intent()),
            "emitted on chain 137 claims source chain 1",
        )
        .await;
    }

    #[tokio::test]
    async fn test_unknown_destination_is_rejected() {
        let h = harness();
        let mut intent = sample_intent();
        intent.dst_chain_id = 42;
        assert_rejected(&h, order_created(1, intent), "Unsupported chain 42").await;
    }

    #[tokio::test]
    async fn test_finished_orders_leave_dedup_set() {
        let h = harness();
        let secret = Secret::random();
        let event = publish(&h, sample_intent(), &secret).await;
        let order_hash = event.order_hash().unwrap();

        h.engine.handle_event(event.clone()).await.unwrap();
        assert!(h.engine.seen.contains(&order_hash));
        h.engine.submit_secret(order_hash, secret).unwrap();
        h.engine.drain().await;
        assert!(h.engine.seen.is_empty());

        // A replayed event is caught by the store
        h.engine.handle_event(event).await.unwrap();
        assert_eq!(h.engine.active_executions().await, 0);
        assert!(h.engine.seen.is_empty());
        let order = h.store.get_order(order_hash).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_order_escrows_are_cancelled_after_timeout() {
        let h = harness();
        let event = publish(&h, sample_intent(), &Secret::random()).await;
        let order_hash = event.order_hash().unwrap();

        // No secret arrives, so both legs stay locked
        h.engine.handle_event(event).await.unwrap();
        h.engine.drain().await;
        assert_eq!(h.engine.pending_refunds(), 2);

        assert_eq!(h.engine.process_refunds().await, 0);
        h.dst.advance_time(250);
        assert_eq!(h.engine.process_refunds().await, 1);
        h.src.advance_time(300);
        assert_eq!(h.engine.process_refunds().await, 1);
        assert_eq!(h.engine.pending_refunds(), 0);

        for (chain, side) in [(&h.src, EscrowSide::Source), (&h.dst, EscrowSide::Destination)] {
            let escrow = chain.registry().get(order_hash, side).unwrap();
            assert_eq!(escrow.state, EscrowState::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_cancel_event_clears_pending_refund() {
        let h = harness();
        let event = publish(&h, sample_intent(), &Secret::random()).await;
        let order_hash = event.order_hash().unwrap();
        h.engine.handle_event(event).await.unwrap();
        h.engine.drain().await;

        let cancelled = ContractEvent::EscrowCancelled {
            chain_id: 137,
            order_hash,
            side: EscrowSide::Destination,
            recipient: Address::repeat_byte(0xbb),
            block_number: 9,
            tx_hash: H256::zero(),
        };
        h.engine.handle_event(cancelled).await.unwrap();
        assert_eq!(h.engine.pending_refunds(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_order_is_ignored() {
        let h = harness();
        let event = publish(&h, sample_intent(), &Secret::random()).await;

        h.engine.handle_event(event.clone()).await.unwrap();
        h.engine.handle_event(event).await.unwrap();

        assert_eq!(h.engine.active_executions().await, 1);
    }

    #[tokio::test]
    async fn test_claim_event_feeds_secret_store() {
        let h = harness();
        let secret = Secret::random();
        let event = publish(&h, sample_intent(), &secret).await;
        let order_hash = event.order_hash().unwrap();
        h.engine.handle_event(event).await.unwrap();

        let claimed = ContractEvent::EscrowClaimed {
            chain_id: 137,
            order_hash,
            side: EscrowSide::Destination,
            secret,
            recipient: Address::repeat_byte(0xab),
            block_number: 9,
            tx_hash: H256::zero(),
        };
        h.engine.handle_event(claimed).await.unwrap();
        h.engine.drain().await;

        let order = h.store.get_order(order_hash).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_claim_for_untracked_order_is_ignored() {
        let h = harness();
        let claimed = ContractEvent::EscrowClaimed {
            chain_id: 1,
            order_hash: H256::repeat_byte(9),
            side: EscrowSide::Source,
            secret: Secret::random(),
            recipient: Address::zero(),
            block_number: 1,
            tx_hash: H256::zero(),
        };
        tokio_test::assert_ok!(h.engine.handle_event(claimed).await);
    }

    #[tokio::test]
    async fn test_missing_secret_fails_order() {
        let h = harness();
        let event = publish(&h, sample_intent(), &Secret::random()).await;
        let order_hash = event.order_hash().unwrap();

        h.engine.handle_event(event).await.unwrap();
        h.engine.drain().await;

        let order = h.store.get_order(order_hash).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert!(order.error.unwrap().contains("complete_source"));
    }

    #[tokio::test]
    async fn test_recover_fails_interrupted_orders() {
        let h = harness();
        let mut order = Order::from_intent(
            sample_intent(),
            Secret::random().hashlock(),
            Timelocks::default(),
            Address::repeat_byte(0xbb),
            Address::repeat_byte(0xbb),
            1,
        );
        order.set_status(OrderStatus::Executing);
        h.store.upsert_order(&order).await.unwrap();

        h.engine.recover().await.unwrap();

        let recovered = h.store.get_order(order.order_hash).await.unwrap().unwrap();
        assert_eq!(recovered.status, OrderStatus::Failed);
        assert!(h.engine.seen.is_empty());
        assert_eq!(h.engine.pending_refunds(), 2);
    }

    #[tokio::test]
    async fn test_recover_rejects_expired_evaluated_orders() {
        let h = harness();
        let mut intent = sample_intent();
        intent.expiry = 1;
        let mut order = Order::from_intent(
            intent,
            Secret::random().hashlock(),
            Timelocks::default(),
            Address::repeat_byte(0xbb),
            Address::repeat_byte(0xbb),
            1,
        );
        order.set_status(OrderStatus::Evaluated);
        h.store.upsert_order(&order).await.unwrap();

        h.engine.recover().await.unwrap();

        let recovered = h.store.get_order(order.order_hash).await.unwrap().unwrap();
        assert_eq!(recovered.status, OrderStatus::Rejected);
        assert_eq!(h.engine.active_executions().await, 0);
    }
}
