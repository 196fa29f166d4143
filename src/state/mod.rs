//! Resolver state persistence
//!
//! Handles:
//! - Block checkpoints for restart recovery
//! - Order records and their lifecycle status
//! - Order statistics for the status API
//!
//! `MemoryStore` is used when no database is configured; `PgStore` persists
//! to PostgreSQL.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::ResolverResult;
use crate::types::{Order, OrderStatus};

use async_trait::async_trait;
use ethers::types::H256;
use serde::Serialize;

/// Persistence backend for checkpoints and order records
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last fully processed block for a chain, if any
    async fn get_checkpoint(&self, chain_id: u64) -> ResolverResult<Option<u64>>;

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> ResolverResult<()>;

    /// Insert or replace an order record
    async fn upsert_order(&self, order: &Order) -> ResolverResult<()>;

    async fn get_order(&self, order_hash: H256) -> ResolverResult<Option<Order>>;

    /// Orders not yet in a terminal status
    async fn pending_orders(&self) -> ResolverResult<Vec<Order>>;

    /// One page of orders, newest first
    async fn list_orders(&self, query: &OrderQuery) -> ResolverResult<Vec<Order>>;

    async fn stats(&self) -> ResolverResult<OrderStats>;

    async fn health_check(&self) -> ResolverResult<()>;

    fn backend(&self) -> &'static str;
}

pub const DEFAULT_PAGE_SIZE: u32 = 30;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Filter and page for order listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderQuery {
    pub status: Option<OrderStatus>,
    pub offset: u64,
    pub limit: Option<u32>,
}

impl OrderQuery {
    /// Requested page size, clamped to `1..=MAX_PAGE_SIZE`
    pub fn page_size(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

/// Order counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderStats {
    pub discovered: u64,
    pub evaluated: u64,
    pub rejected: u64,
    pub executing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl OrderStats {
    pub fn record(&mut self, status: OrderStatus) {
        let slot = match status {
            OrderStatus::Discovered => &mut self.discovered,
            OrderStatus::Evaluated => &mut self.evaluated,
            OrderStatus::Rejected => &mut self.rejected,
            OrderStatus::Executing => &mut self.executing,
            OrderStatus::Completed => &mut self.completed,
            OrderStatus::Failed => &mut self.failed,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u64 {
        self.discovered
            + self.evaluated
            + self.rejected
            + self.executing
            + self.completed
            + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_clamped() {
        assert_eq!(OrderQuery::default().page_size(), DEFAULT_PAGE_SIZE);
        let query = OrderQuery {
            limit: Some(1_000),
            ..Default::default()
        };
        assert_eq!(query.page_size(), MAX_PAGE_SIZE);
        let query = OrderQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(query.page_size(), 1);
    }
}
