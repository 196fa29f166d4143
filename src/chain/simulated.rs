//! In-process chain backed by the escrow registry
//!
//! Every state change mines one block. Escrow events are taken from the
//! registry's broadcast channel and appended to the chain's log, so monitors
//! observe a simulated chain exactly like an EVM chain.

use super::ChainClient;
use crate::error::{EscrowError, ResolverError, ResolverResult};
use crate::escrow::{EscrowEvent, EscrowRegistry};
use crate::events::ContractEvent;
use crate::types::{keccak256, now_secs, EscrowSide, Hashlock, Immutables, Intent, Secret, Timelocks};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

const SIMULATED_GAS_PRICE_WEI: u64 = 1_000_000_000;

/// Time source for a simulated chain
pub enum Clock {
    System,
    Manual(AtomicU64),
}

impl Clock {
    pub fn manual(start: u64) -> Self {
        Clock::Manual(AtomicU64::new(start))
    }

    pub fn now(&self) -> u64 {
        match self {
            Clock::System => now_secs(),
            Clock::Manual(t) => t.load(Ordering::SeqCst),
        }
    }
}

pub struct SimulatedChain {
    chain_id: u64,
    resolver: Address,
    registry: Arc<EscrowRegistry>,
    clock: Clock,
    block: AtomicU64,
    log: RwLock<Vec<ContractEvent>>,
    /// Registry events not yet mined; the lock also serializes transactions
    escrow_events: Mutex<broadcast::Receiver<EscrowEvent>>,
}

impl SimulatedChain {
    pub fn new(chain_id: u64, resolver: Address, clock: Clock) -> Self {
        Self::with_registry(chain_id, resolver, clock, EscrowRegistry::new())
    }

    pub fn with_registry(
        chain_id: u64,
        resolver: Address,
        clock: Clock,
        registry: EscrowRegistry,
    ) -> Self {
        let escrow_events = Mutex::new(registry.subscribe());
        Self {
            chain_id,
            resolver,
            registry: Arc::new(registry),
            clock,
            block: AtomicU64::new(0),
            log: RwLock::new(Vec::new()),
            escrow_events,
        }
    }

    pub fn registry(&self) -> Arc<EscrowRegistry> {
        self.registry.clone()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Move a manual clock forward; no-op on the system clock
    pub fn advance_time(&self, secs: u64) {
        if let Clock::Manual(t) = &self.clock {
            t.fetch_add(secs, Ordering::SeqCst);
        }
    }

    /// Mine an empty block
    pub fn mine(&self) -> u64 {
        self.block.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish a maker's order, as the order source contract would
    pub async fn submit_order(
        &self,
        intent: Intent,
        hashlock: Hashlock,
        timelocks: Timelocks,
    ) -> ResolverResult<H256> {
        if intent.src_chain_id != self.chain_id {
            return Err(ResolverError::InvalidIntent(format!(
                "intent source chain {} does not match chain {}",
                intent.src_chain_id, self.chain_id
            )));
        }
        intent.validate(self.now())?;
        timelocks.validate()?;

        let order_hash = intent.order_hash();
        let block_number = self.mine();
        let event = ContractEvent::OrderCreated {
            chain_id: self.chain_id,
            order_hash,
            intent,
            hashlock,
            timelocks,
            block_number,
            tx_hash: tx_hash(self.chain_id, block_number),
        };
        self.log.write().await.push(event);

        debug!("Chain {}: order {:?} created at block {}", self.chain_id, order_hash, block_number);
        Ok(order_hash)
    }

    /// Run registry calls as one transaction and mine the events they emit
    async fn transact<T>(
        &self,
        op: impl FnOnce(u64) -> Result<T, EscrowError>,
    ) -> ResolverResult<H256> {
        let mut pending = self.escrow_events.lock().await;
        let result = op(self.now());

        let mut events = Vec::new();
        loop {
            match pending.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Chain {}: {} escrow events dropped", self.chain_id, skipped);
                }
                Err(_) => break,
            }
        }
        // A reverted transaction mines nothing
        result?;

        let block_number = self.mine();
        let hash = tx_hash(self.chain_id, block_number);
        let mut log = self.log.write().await;
        for event in events {
            log.push(ContractEvent::from_escrow_event(self.chain_id, block_number, hash, event));
        }
        Ok(hash)
    }

    /// Create and lock an escrow in one transaction, funded by `funder`
    async fn deploy(
        &self,
        side: EscrowSide,
        immutables: &Immutables,
        funder: Address,
    ) -> ResolverResult<H256> {
        let order_hash = immutables.order_hash;
        self.transact(|now| {
            self.registry.create(side, immutables.clone())?;
            self.registry
                .lock(order_hash, side, funder, immutables.required_deposit(), now)
        })
        .await
    }
}

fn tx_hash(chain_id: u64, block_number: u64) -> H256 {
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&chain_id.to_be_bytes());
    seed[8..].copy_from_slice(&block_number.to_be_bytes());
    H256(keccak256(&seed))
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn resolver_address(&self) -> Address {
        self.resolver
    }

    async fn block_number(&self) -> ResolverResult<u64> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn timestamp(&self) -> ResolverResult<u64> {
        Ok(self.now())
    }

    async fn order_events(&self, from_block: u64, to_block: u64) -> ResolverResult<Vec<ContractEvent>> {
        Ok(self
            .log
            .read()
            .await
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number()))
            .cloned()
            .collect())
    }

    async fn estimate_gas_cost(&self, gas_units: u64) -> ResolverResult<U256> {
        Ok(U256::from(gas_units) * U256::from(SIMULATED_GAS_PRICE_WEI))
    }

    async fn deploy_src_escrow(&self, immutables: &Immutables) -> ResolverResult<H256> {
        // Filling the order pulls the maker's funds into the escrow
        self.deploy(EscrowSide::Source, immutables, immutables.maker).await
    }

    async fn deploy_dst_escrow(&self, immutables: &Immutables) -> ResolverResult<H256> {
        self.deploy(EscrowSide::Destination, immutables, self.resolver).await
    }

    async fn withdraw(
        &self,
        side: EscrowSide,
        immutables: &Immutables,
        secret: &Secret,
    ) -> ResolverResult<H256> {
        self.transact(|now| {
            self.registry
                .claim(immutables.order_hash, side, self.resolver, secret, now)
        })
        .await
    }

    async fn cancel(&self, side: EscrowSide, immutables: &Immutables) -> ResolverResult<H256> {
        self.transact(|now| {
            self.registry
                .cancel(immutables.order_hash, side, self.resolver, now)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::EscrowState;
    use crate::types::order::tests::sample_intent;
    use crate::types::{Order, Stage, StageOffsets};

    const T0: u64 = 1_700_000_000;

    fn offsets() -> StageOffsets {
        crate::config::tests::sample_settings().timelocks
    }

    fn chain(chain_id: u64) -> SimulatedChain {
        SimulatedChain::new(chain_id, Address::repeat_byte(0xbb), Clock::manual(T0))
    }

    fn order(secret: &Secret) -> Order {
        let resolver = Address::repeat_byte(0xbb);
        Order::from_intent(
            sample_intent(),
            secret.hashlock(),
            Timelocks::pack(&offsets(), 0),
            resolver,
            resolver,
            1,
        )
    }

    #[tokio::test]
    async fn test_submit_order_is_logged() {
        let src = chain(1);
        let secret = Secret::random();
        let hash = src
            .submit_order(sample_intent(), secret.hashlock(), Timelocks::pack(&offsets(), 0))
            .await
            .unwrap();

        assert_eq!(src.block_number().await.unwrap(), 1);
        let events = src.order_events(1, 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_hash(), Some(hash));
        assert!(src.order_events(2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_order_on_wrong_chain() {
        let dst = chain(137);
        let err = dst
            .submit_order(sample_intent(), Secret::random().hashlock(), Timelocks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::InvalidIntent(_)));
    }

    #[tokio::test]
    async fn test_source_leg_lifecycle() {
        let src = chain(1);
        let secret = Secret::random();
        let order = order(&secret);

        src.deploy_src_escrow(&order.src_immutables).await.unwrap();
        let escrow = src.registry().get(order.order_hash, EscrowSide::Source).unwrap();
        assert_eq!(escrow.state, EscrowState::Locked);
        assert_eq!(escrow.get_timelock(Stage::SrcCancellation), T0 + 300);

        let wrong = Secret::new([0u8; 32]);
        assert!(src
            .withdraw(EscrowSide::Source, &order.src_immutables, &wrong)
            .await
            .is_err());

        src.advance_time(10);
        src.withdraw(EscrowSide::Source, &order.src_immutables, &secret)
            .await
            .unwrap();

        let names: Vec<_> = src
            .order_events(0, 100)
            .await
            .unwrap()
            .iter()
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["escrow_created", "escrow_locked", "escrow_claimed"]);
    }

    #[tokio::test]
    async fn test_destination_cancel_after_timeout() {
        let dst = chain(137);
        let order = order(&Secret::random());
        dst.deploy_dst_escrow(&order.dst_immutables).await.unwrap();

        dst.advance_time(249);
        assert!(dst.cancel(EscrowSide::Destination, &order.dst_immutables).await.is_err());
        dst.advance_time(1);
        dst.cancel(EscrowSide::Destination, &order.dst_immutables)
            .await
            .unwrap();

        let escrow = dst.registry().get(order.order_hash, EscrowSide::Destination).unwrap();
        assert_eq!(escrow.state, EscrowState::Cancelled);
    }

    #[tokio::test]
    async fn test_reverted_deploy_mines_nothing() {
        let src = SimulatedChain::with_registry(
            1,
            Address::repeat_byte(0xbb),
            Clock::manual(T0),
            EscrowRegistry::with_min_safety_deposit_bps(500),
        );
        let order = order(&Secret::random());

        let err = src.deploy_src_escrow(&order.src_immutables).await.unwrap_err();
        assert!(err.to_string().starts_with("Insufficient safety deposit"));
        assert_eq!(src.block_number().await.unwrap(), 0);
        assert!(src.order_events(0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_deploy_rejected() {
        let src = chain(1);
        let order = order(&Secret::random());
        src.deploy_src_escrow(&order.src_immutables).await.unwrap();
        let err = src.deploy_src_escrow(&order.src_immutables).await.unwrap_err();
        assert!(err.to_string().contains("Escrow already exists"));
    }
}
