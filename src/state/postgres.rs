//! PostgreSQL state store

use super::{OrderQuery, OrderStats, StateStore};
use crate::config::DatabaseConfig;
use crate::error::{ResolverError, ResolverResult};
use crate::types::Order;

use async_trait::async_trait;
use ethers::types::H256;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

/// State store backed by PostgreSQL
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run migrations
    pub async fn connect(config: &DatabaseConfig) -> ResolverResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create tables inline
    pub async fn run_migrations(&self) -> ResolverResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain_id BIGINT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_hash VARCHAR(66) PRIMARY KEY,
                src_chain_id BIGINT NOT NULL,
                dst_chain_id BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_status
            ON orders (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn hash_key(order_hash: H256) -> String {
    format!("{:?}", order_hash)
}

#[async_trait]
impl StateStore for PgStore {
    async fn get_checkpoint(&self, chain_id: u64) -> ResolverResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE chain_id = $1")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> ResolverResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain_id, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id)
            DO UPDATE SET block_number = $2, updated_at = NOW()
            "#,
        )
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for chain {}: block {}", chain_id, block_number);
        Ok(())
    }

    async fn upsert_order(&self, order: &Order) -> ResolverResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (order_hash, src_chain_id, dst_chain_id, status, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_hash)
            DO UPDATE SET status = $4, record = $5, updated_at = $7
            "#,
        )
        .bind(hash_key(order.order_hash))
        .bind(order.intent.src_chain_id as i64)
        .bind(order.intent.dst_chain_id as i64)
        .bind(order.status.as_str())
        .bind(Json(order))
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_order(&self, order_hash: H256) -> ResolverResult<Option<Order>> {
        let row = sqlx::query("SELECT record FROM orders WHERE order_hash = $1")
            .bind(hash_key(order_hash))
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            r.try_get::<Json<Order>, _>("record")
                .map(|json| json.0)
                .map_err(ResolverError::Database)
        })
        .transpose()
    }

    async fn pending_orders(&self) -> ResolverResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM orders
            WHERE status NOT IN ('completed', 'failed', 'rejected')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                r.try_get::<Json<Order>, _>("record")
                    .map(|json| json.0)
                    .map_err(ResolverError::Database)
            })
            .collect()
    }

    async fn list_orders(&self, query: &OrderQuery) -> ResolverResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM orders
            WHERE ($1::VARCHAR IS NULL OR status = $1)
            ORDER BY created_at DESC, order_hash
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(query.status.map(|s| s.as_str()))
        .bind(i64::from(query.page_size()))
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                r.try_get::<Json<Order>, _>("record")
                    .map(|json| json.0)
                    .map_err(ResolverError::Database)
            })
            .collect()
    }

    async fn stats(&self) -> ResolverResult<OrderStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'discovered') as discovered,
                COUNT(*) FILTER (WHERE status = 'evaluated') as evaluated,
                COUNT(*) FILTER (WHERE status = 'rejected') as rejected,
                COUNT(*) FILTER (WHERE status = 'executing') as executing,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM orders
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OrderStats {
            discovered: row.get::<i64, _>("discovered") as u64,
            evaluated: row.get::<i64, _>("evaluated") as u64,
            rejected: row.get::<i64, _>("rejected") as u64,
            executing: row.get::<i64, _>("executing") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }

    async fn health_check(&self) -> ResolverResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
