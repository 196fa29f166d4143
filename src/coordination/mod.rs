//! Coordination of cross-chain order execution
//!
//! The coordination engine:
//! 1. Consumes order and escrow events from every chain monitor
//! 2. Scores new orders and dispatches the profitable ones
//! 3. Runs the four-step escrow sequence for each dispatched order
//! 4. Collects revealed secrets from the maker and from claim events

pub mod engine;
pub mod executor;
pub mod secrets;

pub use engine::CoordinationEngine;
pub use executor::{CrossChainExecutor, ExecutionReport, ExecutionStep, StepRecord};
pub use secrets::SecretStore;
