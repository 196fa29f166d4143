//! In-memory state store

use super::{OrderQuery, OrderStats, StateStore};
use crate::error::ResolverResult;
use crate::types::Order;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::H256;

/// Volatile store; state is lost on restart
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: DashMap<u64, u64>,
    orders: DashMap<H256, Order>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_checkpoint(&self, chain_id: u64) -> ResolverResult<Option<u64>> {
        Ok(self.checkpoints.get(&chain_id).map(|b| *b))
    }

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> ResolverResult<()> {
        self.checkpoints.insert(chain_id, block_number);
        Ok(())
    }

    async fn upsert_order(&self, order: &Order) -> ResolverResult<()> {
        self.orders.insert(order.order_hash, order.clone());
        Ok(())
    }

    async fn get_order(&self, order_hash: H256) -> ResolverResult<Option<Order>> {
        Ok(self.orders.get(&order_hash).map(|o| o.clone()))
    }

    async fn pending_orders(&self) -> ResolverResult<Vec<Order>> {
        let mut pending: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.clone())
            .collect();
        pending.sort_by_key(|o| o.created_at);
        Ok(pending)
    }

    async fn list_orders(&self, query: &OrderQuery) -> ResolverResult<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| query.status.map_or(true, |status| o.status == status))
            .map(|o| o.clone())
            .collect();
        orders.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.order_hash.cmp(&b.order_hash))
        });

        Ok(orders
            .into_iter()
            .skip(query.offset as usize)
            .take(query.page_size() as usize)
            .collect())
    }

    async fn stats(&self) -> ResolverResult<OrderStats> {
        let mut stats = OrderStats::default();
        for order in self.orders.iter() {
            stats.record(order.status);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> ResolverResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
