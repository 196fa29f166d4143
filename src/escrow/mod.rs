//! Hashlock/timelock escrow engine
//!
//! `Escrow` is the per-leg state machine (`Created → Locked → Claimed | Cancelled`);
//! `EscrowRegistry` is the factory that owns escrows and publishes their events.

pub mod registry;
pub mod state;

pub use registry::EscrowRegistry;
pub use state::{Escrow, EscrowEvent, EscrowState, Payout, Settlement};
