//! EVM chain client
//!
//! Reads order and escrow events through the failover provider and drives the
//! resolver contract with manually ABI-encoded calls.

use super::{ChainClient, ChainProvider};
use crate::config::{parse_address, ChainConfig, ResolverConfig};
use crate::error::{ResolverError, ResolverResult};
use crate::events::{ContractEvent, EventParser};
use crate::tx::TransactionSender;
use crate::types::{EscrowSide, Immutables, Secret};

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::signers::LocalWallet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolver contract entry points
pub mod calls {
    pub const DEPLOY_SRC: &str =
        "deploySrc((bytes32,bytes32,address,address,address,uint256,uint256,uint256))";
    pub const DEPLOY_DST: &str =
        "deployDst((bytes32,bytes32,address,address,address,uint256,uint256,uint256))";
    pub const WITHDRAW: &str =
        "withdraw(uint8,bytes32,(bytes32,bytes32,address,address,address,uint256,uint256,uint256))";
    pub const CANCEL: &str =
        "cancel(uint8,(bytes32,bytes32,address,address,address,uint256,uint256,uint256))";
}

/// Selector followed by the ABI-encoded arguments
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = ethers::utils::id(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

pub struct EvmChainClient {
    chain_id: u64,
    provider: Arc<ChainProvider>,
    sender: TransactionSender,
    parser: EventParser,
    resolver: Address,
    /// Contracts whose logs the monitor reads
    watched: Vec<Address>,
    /// Blocks behind head considered final
    confirmations: u64,
}

impl EvmChainClient {
    pub async fn connect(
        config: &ChainConfig,
        wallet: LocalWallet,
        resolver_config: &ResolverConfig,
    ) -> ResolverResult<Self> {
        let provider = Arc::new(ChainProvider::new(config)?);
        let resolver = config
            .resolver()
            .map_err(|e| ResolverError::Config(e.to_string()))?;

        let mut watched = Vec::new();
        for raw in [&config.order_source_address, &config.escrow_factory_address] {
            if raw.is_empty() {
                continue;
            }
            watched.push(parse_address(raw).map_err(|e| ResolverError::Config(e.to_string()))?);
        }

        let sender = TransactionSender::new(provider.clone(), wallet, resolver_config).await?;

        Ok(Self {
            chain_id: config.chain_id,
            provider,
            sender,
            parser: EventParser::new(config.chain_id),
            resolver,
            watched,
            confirmations: config.confirmation_blocks.saturating_sub(1),
        })
    }

    async fn call_resolver(&self, signature: &str, args: &[Token], value: U256) -> ResolverResult<H256> {
        let data = encode_call(signature, args);
        debug!("Chain {}: calling {}", self.chain_id, signature);
        let receipt = self.sender.submit(self.resolver, data, value).await?;
        Ok(receipt.transaction_hash)
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn resolver_address(&self) -> Address {
        self.resolver
    }

    async fn block_number(&self) -> ResolverResult<u64> {
        let head = self.provider.get_block_number().await?;
        Ok(head.saturating_sub(self.confirmations))
    }

    async fn timestamp(&self) -> ResolverResult<u64> {
        self.provider.get_block_timestamp().await
    }

    async fn order_events(&self, from_block: u64, to_block: u64) -> ResolverResult<Vec<ContractEvent>> {
        if self.watched.is_empty() {
            return Ok(Vec::new());
        }

        let topics = EventParser::known_topics().into_iter().map(Some).collect();
        let filter = Filter::new()
            .address(self.watched.clone())
            .topic0(ValueOrArray::Array(topics))
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.provider.get_logs(&filter).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            match self.parser.parse_log(&log) {
                Ok(ContractEvent::Unknown { topic, .. }) => {
                    debug!("Chain {}: skipping unknown event {:?}", self.chain_id, topic);
                }
                Ok(event) => events.push(event),
                Err(e) => warn!("Chain {}: failed to parse log: {}", self.chain_id, e),
            }
        }
        Ok(events)
    }

    async fn estimate_gas_cost(&self, gas_units: u64) -> ResolverResult<U256> {
        self.sender
            .gas_estimator()
            .estimate_cost(&self.provider, gas_units)
            .await
    }

    async fn deploy_src_escrow(&self, immutables: &Immutables) -> ResolverResult<H256> {
        self.call_resolver(
            calls::DEPLOY_SRC,
            &[immutables.to_token()],
            immutables.safety_deposit,
        )
        .await
    }

    async fn deploy_dst_escrow(&self, immutables: &Immutables) -> ResolverResult<H256> {
        self.call_resolver(
            calls::DEPLOY_DST,
            &[immutables.to_token()],
            immutables.safety_deposit,
        )
        .await
    }

    async fn withdraw(
        &self,
        side: EscrowSide,
        immutables: &Immutables,
        secret: &Secret,
    ) -> ResolverResult<H256> {
        self.call_resolver(
            calls::WITHDRAW,
            &[
                Token::Uint(U256::from(side.as_u8())),
                Token::FixedBytes(secret.as_bytes().to_vec()),
                immutables.to_token(),
            ],
            U256::zero(),
        )
        .await
    }

    async fn cancel(&self, side: EscrowSide, immutables: &Immutables) -> ResolverResult<H256> {
        self.call_resolver(
            calls::CANCEL,
            &[Token::Uint(U256::from(side.as_u8())), immutables.to_token()],
            U256::zero(),
        )
        .await
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}
