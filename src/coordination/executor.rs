//! Cross-chain execution sequence
//!
//! One order is executed as four independent chain calls. Retryable failures
//! are retried with exponential backoff; any other failure stops the sequence.
//! Nothing is rolled back: the escrow timelocks return funds on their own.

use super::secrets::SecretStore;
use crate::chain::{ChainClient, ChainManager};
use crate::error::{ResolverError, ResolverResult};
use crate::types::{EscrowSide, Order, Secret};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use ethers::types::H256;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStep {
    /// Fill the order into the source escrow
    MatchSource,
    /// Fund the destination escrow
    LockDestination,
    /// Reveal the secret on the source chain
    CompleteSource,
    /// Release the destination funds to the maker
    SettleDestination,
}

impl ExecutionStep {
    pub const ALL: [ExecutionStep; 4] = [
        ExecutionStep::MatchSource,
        ExecutionStep::LockDestination,
        ExecutionStep::CompleteSource,
        ExecutionStep::SettleDestination,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionStep::MatchSource => "match_source",
            ExecutionStep::LockDestination => "lock_destination",
            ExecutionStep::CompleteSource => "complete_source",
            ExecutionStep::SettleDestination => "settle_destination",
        }
    }
}

impl fmt::Display for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: ExecutionStep,
    pub attempts: u32,
    pub tx_hash: Option<H256>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub order_hash: H256,
    pub steps: Vec<StepRecord>,
    pub completed: bool,
    /// First error encountered, if the sequence aborted
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn failed_step(&self) -> Option<ExecutionStep> {
        self.steps.iter().find(|s| s.error.is_some()).map(|s| s.step)
    }

    /// Escrows this run locked but never withdrew from
    pub fn unsettled_legs(&self) -> Vec<EscrowSide> {
        let done = |step: ExecutionStep| {
            self.steps
                .iter()
                .any(|s| s.step == step && s.error.is_none())
        };

        let mut legs = Vec::new();
        if done(ExecutionStep::MatchSource) && !done(ExecutionStep::CompleteSource) {
            legs.push(EscrowSide::Source);
        }
        if done(ExecutionStep::LockDestination) && !done(ExecutionStep::SettleDestination) {
            legs.push(EscrowSide::Destination);
        }
        legs
    }
}

pub struct CrossChainExecutor {
    chains: Arc<ChainManager>,
    secrets: Arc<SecretStore>,
    max_retries: u32,
    retry_delay: Duration,
    secret_wait: Duration,
}

impl CrossChainExecutor {
    pub fn new(
        chains: Arc<ChainManager>,
        secrets: Arc<SecretStore>,
        max_retries: u32,
        retry_delay: Duration,
        secret_wait: Duration,
    ) -> Self {
        Self {
            chains,
            secrets,
            max_retries: max_retries.max(1),
            retry_delay,
            secret_wait,
        }
    }

    /// Run all steps for an order
    pub async fn execute(&self, order: &Order) -> ExecutionReport {
        let mut report = ExecutionReport {
            order_hash: order.order_hash,
            steps: Vec::with_capacity(ExecutionStep::ALL.len()),
            completed: false,
            error: None,
        };

        let clients = self
            .chains
            .get(order.intent.src_chain_id)
            .and_then(|src| Ok((src, self.chains.get(order.intent.dst_chain_id)?)));
        let (src, dst) = match clients {
            Ok(pair) => pair,
            Err(e) => {
                report.error = Some(e.to_string());
                return report;
            }
        };

        let mut secret: Option<Secret> = None;

        for step in ExecutionStep::ALL {
            if step == ExecutionStep::CompleteSource {
                match self.secrets.wait_for(order.order_hash, self.secret_wait).await {
                    Ok(s) => secret = Some(s),
                    Err(e) => {
                        self.abort(&mut report, step, 0, e);
                        return report;
                    }
                }
            }

            let started = Instant::now();
            let (attempts, result) = self
                .with_retry(step, || self.run_step(step, order, &src, &dst, secret.as_ref()))
                .await;
            crate::metrics::record_step(step.name(), result.is_ok(), started.elapsed());

            match result {
                Ok(tx_hash) => {
                    info!(
                        "Order {:?}: {} done in {} attempt(s) ({:?})",
                        order.order_hash, step, attempts, tx_hash
                    );
                    report.steps.push(StepRecord {
                        step,
                        attempts,
                        tx_hash: Some(tx_hash),
                        error: None,
                    });
                }
                Err(e) => {
                    self.abort(&mut report, step, attempts, e);
                    return report;
                }
            }
        }

        report.completed = true;
        report
    }

    fn abort(&self, report: &mut ExecutionReport, step: ExecutionStep, attempts: u32, err: ResolverError) {
        if err.should_alert() {
            error!("Order {:?}: {} failed, operator action needed: {}", report.order_hash, step, err);
        } else {
            warn!("Order {:?}: {} failed: {}", report.order_hash, step, err);
        }
        let wrapped = ResolverError::Execution {
            step: step.name().to_string(),
            message: err.to_string(),
        };
        report.steps.push(StepRecord {
            step,
            attempts,
            tx_hash: None,
            error: Some(err.to_string()),
        });
        report.error = Some(wrapped.to_string());
    }

    async fn run_step(
        &self,
        step: ExecutionStep,
        order: &Order,
        src: &Arc<dyn ChainClient>,
        dst: &Arc<dyn ChainClient>,
        secret: Option<&Secret>,
    ) -> ResolverResult<H256> {
        match step {
            ExecutionStep::MatchSource => src.deploy_src_escrow(&order.src_immutables).await,
            ExecutionStep::LockDestination => dst.deploy_dst_escrow(&order.dst_immutables).await,
            ExecutionStep::CompleteSource => {
                let secret = secret.ok_or_else(|| ResolverError::SecretUnavailable {
                    order_hash: format!("{:?}", order.order_hash),
                })?;
                src.withdraw(EscrowSide::Source, &order.src_immutables, secret)
                    .await
            }
            ExecutionStep::SettleDestination => {
                let secret = secret.ok_or_else(|| ResolverError::SecretUnavailable {
                    order_hash: format!("{:?}", order.order_hash),
                })?;
                dst.withdraw(EscrowSide::Destination, &order.dst_immutables, secret)
                    .await
            }
        }
    }

    /// Retry retryable failures up to `max_retries` attempts in total
    async fn with_retry<F, Fut>(&self, step: ExecutionStep, mut call: F) -> (u32, ResolverResult<H256>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResolverResult<H256>>,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry_delay,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            match call().await {
                Ok(hash) => return (attempts, Ok(hash)),
                Err(e) if e.is_retryable() && attempts < self.max_retries => {
                    let delay = backoff.next_backoff().unwrap_or(self.retry_delay);
                    warn!(
                        "{} failed, attempt {}/{}, retrying in {:?}: {}",
                        step, attempts, self.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (attempts, Err(e)),
            }
        }
    }
}
