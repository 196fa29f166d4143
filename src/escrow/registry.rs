//! In-process escrow factory keyed by order hash and side

use super::state::{Escrow, EscrowEvent, Settlement};
use crate::error::EscrowError;
use crate::types::{EscrowSide, Immutables, Secret, Stage};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use tokio::sync::broadcast;
use tracing::{debug, info};

type EscrowKey = (H256, EscrowSide);

/// Escrow factory: creates escrows and routes transitions to them
pub struct EscrowRegistry {
    escrows: DashMap<EscrowKey, Escrow>,
    /// Minimum safety deposit as basis points of the escrowed amount
    min_safety_deposit_bps: u16,
    event_tx: broadcast::Sender<EscrowEvent>,
}

impl EscrowRegistry {
    pub fn new() -> Self {
        Self::with_min_safety_deposit_bps(0)
    }

    pub fn with_min_safety_deposit_bps(min_safety_deposit_bps: u16) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            escrows: DashMap::new(),
            min_safety_deposit_bps: min_safety_deposit_bps.min(10_000),
            event_tx,
        }
    }

    /// Subscribe to escrow events
    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.event_tx.subscribe()
    }

    /// Safety deposit an escrow of `amount` must carry
    pub fn required_safety_deposit(&self, amount: U256) -> U256 {
        amount.saturating_mul(U256::from(self.min_safety_deposit_bps)) / U256::from(10_000u64)
    }

    /// Create a new escrow in `Created` state
    pub fn create(&self, side: EscrowSide, immutables: Immutables) -> Result<(), EscrowError> {
        let need = self.required_safety_deposit(immutables.amount);
        if immutables.safety_deposit < need {
            return Err(EscrowError::InsufficientSafetyDeposit {
                have: immutables.safety_deposit.to_string(),
                need: need.to_string(),
            });
        }

        let order_hash = immutables.order_hash;
        match self.escrows.entry((order_hash, side)) {
            Entry::Occupied(_) => {
                return Err(EscrowError::AlreadyExists {
                    order_hash: format!("{:?}", order_hash),
                    side,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Escrow::new(side, immutables)?);
            }
        }

        info!("Escrow created for order {:?} ({})", order_hash, side);
        self.emit(EscrowEvent::EscrowCreated { order_hash, side });
        Ok(())
    }

    pub fn lock(
        &self,
        order_hash: H256,
        side: EscrowSide,
        caller: Address,
        deposit: U256,
        now: u64,
    ) -> Result<EscrowEvent, EscrowError> {
        let event = self.with_escrow(order_hash, side, |e| e.lock(caller, deposit, now))?;
        self.emit(event.clone());
        Ok(event)
    }

    pub fn claim(
        &self,
        order_hash: H256,
        side: EscrowSide,
        caller: Address,
        secret: &Secret,
        now: u64,
    ) -> Result<Settlement, EscrowError> {
        let settlement = self.with_escrow(order_hash, side, |e| e.claim(caller, secret, now))?;
        self.emit(settlement.event.clone());
        Ok(settlement)
    }

    pub fn public_claim(
        &self,
        order_hash: H256,
        side: EscrowSide,
        caller: Address,
        secret: &Secret,
        now: u64,
    ) -> Result<Settlement, EscrowError> {
        let settlement =
            self.with_escrow(order_hash, side, |e| e.public_claim(caller, secret, now))?;
        self.emit(settlement.event.clone());
        Ok(settlement)
    }

    pub fn cancel(
        &self,
        order_hash: H256,
        side: EscrowSide,
        caller: Address,
        now: u64,
    ) -> Result<Settlement, EscrowError> {
        let settlement = self.with_escrow(order_hash, side, |e| e.cancel(caller, now))?;
        self.emit(settlement.event.clone());
        Ok(settlement)
    }

    pub fn public_cancel(
        &self,
        order_hash: H256,
        side: EscrowSide,
        caller: Address,
        now: u64,
    ) -> Result<Settlement, EscrowError> {
        let settlement = self.with_escrow(order_hash, side, |e| e.public_cancel(caller, now))?;
        self.emit(settlement.event.clone());
        Ok(settlement)
    }

    /// Snapshot of an escrow
    pub fn get(&self, order_hash: H256, side: EscrowSide) -> Option<Escrow> {
        self.escrows.get(&(order_hash, side)).map(|e| e.clone())
    }

    /// Absolute timestamp of a stage for an existing escrow
    pub fn get_timelock(
        &self,
        order_hash: H256,
        side: EscrowSide,
        stage: Stage,
    ) -> Result<u64, EscrowError> {
        self.escrows
            .get(&(order_hash, side))
            .map(|e| e.get_timelock(stage))
            .ok_or_else(|| Self::not_found(order_hash, side))
    }

    pub fn len(&self) -> usize {
        self.escrows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.escrows.is_empty()
    }

    fn with_escrow<T>(
        &self,
        order_hash: H256,
        side: EscrowSide,
        f: impl FnOnce(&mut Escrow) -> Result<T, EscrowError>,
    ) -> Result<T, EscrowError> {
        let mut escrow = self
            .escrows
            .get_mut(&(order_hash, side))
            .ok_or_else(|| Self::not_found(order_hash, side))?;
        f(escrow.value_mut())
    }

    fn emit(&self, event: EscrowEvent) {
        debug!("Escrow event: {:?}", event);
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn not_found(order_hash: H256, side: EscrowSide) -> EscrowError {
        EscrowError::NotFound {
            order_hash: format!("{:?}", order_hash),
            side,
        }
    }
}

impl Default for EscrowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::state::tests::{immutables, maker, taker, T0};
    use crate::escrow::EscrowState;

    #[test]
    fn test_duplicate_create_rejected() {
        let registry = EscrowRegistry::new();
        let secret = Secret::random();
        registry.create(EscrowSide::Source, immutables(&secret)).unwrap();

        let err = registry
            .create(EscrowSide::Source, immutables(&secret))
            .unwrap_err();
        assert!(err.to_string().starts_with("Escrow already exists"));

        // The other leg of the same order is a separate escrow.
        registry
            .create(EscrowSide::Destination, immutables(&secret))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_create_keeps_first_escrow() {
        let registry = std::sync::Arc::new(EscrowRegistry::new());
        let secret = Secret::random();
        let imm = immutables(&secret);
        let order_hash = imm.order_hash;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let imm = imm.clone();
                std::thread::spawn(move || registry.create(EscrowSide::Source, imm).is_ok())
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(created, 1);

        let deposit = imm.required_deposit();
        registry
            .lock(order_hash, EscrowSide::Source, maker(), deposit, T0)
            .unwrap();
        assert!(registry.create(EscrowSide::Source, imm).is_err());
        assert_eq!(
            registry.get(order_hash, EscrowSide::Source).unwrap().state,
            EscrowState::Locked
        );
    }

    #[test]
    fn test_minimum_safety_deposit() {
        // 1 ETH with a 0.01 ETH deposit is exactly 100 bps
        let registry = EscrowRegistry::with_min_safety_deposit_bps(100);
        let secret = Secret::random();
        assert_eq!(registry.required_safety_deposit(U256::exp10(18)), U256::exp10(16));
        registry.create(EscrowSide::Source, immutables(&secret)).unwrap();

        let strict = EscrowRegistry::with_min_safety_deposit_bps(500);
        let err = strict
            .create(EscrowSide::Source, immutables(&secret))
            .unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientSafetyDeposit { .. }));
        assert!(strict.is_empty());

        let mut zero = immutables(&secret);
        zero.safety_deposit = U256::zero();
        assert!(registry.create(EscrowSide::Destination, zero).is_err());
    }

    #[tokio::test]
    async fn test_full_lifecycle_emits_events() {
        let registry = EscrowRegistry::new();
        let mut events = registry.subscribe();
        let secret = Secret::random();
        let imm = immutables(&secret);
        let order_hash = imm.order_hash;
        let deposit = imm.required_deposit();

        registry.create(EscrowSide::Source, imm).unwrap();
        registry
            .lock(order_hash, EscrowSide::Source, maker(), deposit, T0)
            .unwrap();
        assert_eq!(
            registry
                .get_timelock(order_hash, EscrowSide::Source, Stage::SrcCancellation)
                .unwrap(),
            T0 + 121
        );
        registry
            .claim(order_hash, EscrowSide::Source, taker(), &secret, T0 + 30)
            .unwrap();

        assert!(matches!(events.recv().await.unwrap(), EscrowEvent::EscrowCreated { .. }));
        assert!(matches!(events.recv().await.unwrap(), EscrowEvent::EscrowLocked { .. }));
        match events.recv().await.unwrap() {
            EscrowEvent::EscrowClaimed { secret: revealed, .. } => assert_eq!(revealed, secret),
            other => panic!("unexpected event {:?}", other),
        }

        let escrow = registry.get(order_hash, EscrowSide::Source).unwrap();
        assert_eq!(escrow.state, EscrowState::Claimed);
    }

    #[test]
    fn test_operations_on_missing_escrow() {
        let registry = EscrowRegistry::new();
        let err = registry
            .cancel(H256::zero(), EscrowSide::Source, taker(), T0)
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotFound { .. }));
        assert!(registry
            .get_timelock(H256::zero(), EscrowSide::Source, Stage::SrcWithdrawal)
            .is_err());
    }

    #[test]
    fn test_public_cancel_through_registry() {
        let registry = EscrowRegistry::new();
        let secret = Secret::random();
        let imm = immutables(&secret);
        let order_hash = imm.order_hash;
        let deposit = imm.required_deposit();
        registry.create(EscrowSide::Source, imm).unwrap();
        registry
            .lock(order_hash, EscrowSide::Source, maker(), deposit, T0)
            .unwrap();

        let anyone = Address::repeat_byte(0x42);
        assert!(registry
            .public_cancel(order_hash, EscrowSide::Source, anyone, T0 + 121)
            .is_err());
        let settlement = registry
            .public_cancel(order_hash, EscrowSide::Source, anyone, T0 + 122)
            .unwrap();
        assert_eq!(settlement.payouts[0].recipient, maker());
        assert!(registry
            .public_claim(order_hash, EscrowSide::Source, anyone, &secret, T0 + 122)
            .is_err());
    }
}
