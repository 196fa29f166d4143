//! Swap intents, escrow immutables and resolver-side order records

use super::secret::{keccak256, Hashlock};
use super::timelocks::Timelocks;
use super::u256_dec;
use crate::error::{ResolverError, ResolverResult};
use crate::pricing::ProfitEstimate;

use chrono::{DateTime, Utc};
use ethers::abi::{self, Token};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which leg of the swap an escrow holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowSide {
    Source,
    Destination,
}

impl EscrowSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowSide::Source => "source",
            EscrowSide::Destination => "destination",
        }
    }

    /// Encoding used in resolver contract calls and events
    pub fn as_u8(&self) -> u8 {
        match self {
            EscrowSide::Source => 0,
            EscrowSide::Destination => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EscrowSide::Source),
            1 => Some(EscrowSide::Destination),
            _ => None,
        }
    }
}

impl fmt::Display for EscrowSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscrowSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "src" | "source" => Ok(EscrowSide::Source),
            "dst" | "destination" => Ok(EscrowSide::Destination),
            other => Err(format!("unknown escrow side: {}", other)),
        }
    }
}

/// A maker's requested cross-chain swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub src_chain_id: u64,
    pub dst_chain_id: u64,
    pub src_token: Address,
    pub dst_token: Address,
    #[serde(with = "u256_dec")]
    pub src_amount: U256,
    /// Minimum amount the maker accepts on the destination chain
    #[serde(with = "u256_dec")]
    pub dst_amount: U256,
    pub maker: Address,
    /// Destination address receiving the swapped funds
    pub receiver: Address,
    #[serde(default)]
    pub slippage_bps: u16,
    #[serde(with = "u256_dec", default)]
    pub resolver_fee: U256,
    #[serde(with = "u256_dec", default)]
    pub safety_deposit: U256,
    /// Unix timestamp after which the intent can no longer be filled
    pub expiry: u64,
    #[serde(with = "u256_dec", default)]
    pub salt: U256,
}

impl Intent {
    pub fn validate(&self, now: u64) -> ResolverResult<()> {
        if self.src_amount.is_zero() || self.dst_amount.is_zero() {
            return Err(ResolverError::InvalidIntent(
                "amounts must be non-zero".to_string(),
            ));
        }
        if self.src_chain_id == self.dst_chain_id {
            return Err(ResolverError::InvalidIntent(
                "source and destination chain must differ".to_string(),
            ));
        }
        if self.slippage_bps > 10_000 {
            return Err(ResolverError::InvalidIntent(format!(
                "slippage {} bps exceeds 100%",
                self.slippage_bps
            )));
        }
        if self.expiry <= now {
            return Err(ResolverError::InvalidIntent("intent expired".to_string()));
        }
        if self.maker.is_zero() {
            return Err(ResolverError::InvalidIntent("maker is required".to_string()));
        }
        Ok(())
    }

    /// keccak256 over the ABI encoding of every intent field
    pub fn order_hash(&self) -> H256 {
        let encoded = abi::encode(&[
            Token::Uint(U256::from(self.src_chain_id)),
            Token::Uint(U256::from(self.dst_chain_id)),
            Token::Address(self.src_token),
            Token::Address(self.dst_token),
            Token::Uint(self.src_amount),
            Token::Uint(self.dst_amount),
            Token::Address(self.maker),
            Token::Address(self.receiver),
            Token::Uint(U256::from(self.slippage_bps)),
            Token::Uint(self.resolver_fee),
            Token::Uint(self.safety_deposit),
            Token::Uint(U256::from(self.expiry)),
            Token::Uint(self.salt),
        ]);
        H256(keccak256(&encoded))
    }

    /// Seconds left until expiry, zero once expired
    pub fn time_to_expiry(&self, now: u64) -> u64 {
        self.expiry.saturating_sub(now)
    }
}

/// On-chain committed form of one swap leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Immutables {
    pub order_hash: H256,
    pub hashlock: Hashlock,
    pub maker: Address,
    pub taker: Address,
    pub token: Address,
    #[serde(with = "u256_dec")]
    pub amount: U256,
    #[serde(with = "u256_dec")]
    pub safety_deposit: U256,
    pub timelocks: Timelocks,
}

impl Immutables {
    /// ABI tuple `(bytes32,bytes32,address,address,address,uint256,uint256,uint256)`
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::FixedBytes(self.order_hash.as_bytes().to_vec()),
            Token::FixedBytes(self.hashlock.as_h256().as_bytes().to_vec()),
            Token::Address(self.maker),
            Token::Address(self.taker),
            Token::Address(self.token),
            Token::Uint(self.amount),
            Token::Uint(self.safety_deposit),
            Token::Uint(self.timelocks.as_u256()),
        ])
    }

    pub fn hash(&self) -> H256 {
        H256(keccak256(&abi::encode(&[self.to_token()])))
    }

    /// Total value an escrow must receive when locked
    pub fn required_deposit(&self) -> U256 {
        self.amount.saturating_add(self.safety_deposit)
    }
}

/// Lifecycle of an order as seen by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Discovered,
    Evaluated,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Discovered => "discovered",
            OrderStatus::Evaluated => "evaluated",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Executing => "executing",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Rejected | OrderStatus::Completed | OrderStatus::Failed
        )
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(OrderStatus::Discovered),
            "evaluated" => Ok(OrderStatus::Evaluated),
            "rejected" => Ok(OrderStatus::Rejected),
            "executing" => Ok(OrderStatus::Executing),
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Resolver-side record of a discovered order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_hash: H256,
    pub intent: Intent,
    pub src_immutables: Immutables,
    pub dst_immutables: Immutables,
    pub status: OrderStatus,
    pub profit: Option<ProfitEstimate>,
    pub error: Option<String>,
    pub src_block: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Commit an intent into an order.
    ///
    /// The order takes ownership of the intent; both legs share the order
    /// hash, hashlock and timelocks. The resolver is the taker on each side.
    pub fn from_intent(
        intent: Intent,
        hashlock: Hashlock,
        timelocks: Timelocks,
        src_resolver: Address,
        dst_resolver: Address,
        src_block: u64,
    ) -> Self {
        let order_hash = intent.order_hash();
        let now = Utc::now();

        let src_immutables = Immutables {
            order_hash,
            hashlock,
            maker: intent.maker,
            taker: src_resolver,
            token: intent.src_token,
            amount: intent.src_amount,
            safety_deposit: intent.safety_deposit,
            timelocks,
        };

        let dst_immutables = Immutables {
            order_hash,
            hashlock,
            maker: intent.receiver,
            taker: dst_resolver,
            token: intent.dst_token,
            amount: intent.dst_amount,
            safety_deposit: intent.safety_deposit,
            timelocks,
        };

        Self {
            order_hash,
            intent,
            src_immutables,
            dst_immutables,
            status: OrderStatus::Discovered,
            profit: None,
            error: None,
            src_block,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn immutables(&self, side: EscrowSide) -> &Immutables {
        match side {
            EscrowSide::Source => &self.src_immutables,
            EscrowSide::Destination => &self.dst_immutables,
        }
    }

    pub fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
