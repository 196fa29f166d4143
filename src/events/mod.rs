//! Contract event types and parsing
//!
//! Defines the events emitted by the order source (`OrderCreated`) and the
//! escrow factory (`EscrowCreated/Locked/Claimed/Cancelled`) contracts, and
//! the decoder that turns raw EVM logs into them.

use crate::error::{ResolverError, ResolverResult};
use crate::escrow::EscrowEvent;
use crate::types::{Hashlock, Intent, Secret, Timelocks};
use crate::types::EscrowSide;

use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};

/// Event signatures, hashed into the first log topic
pub mod signatures {
    pub const ORDER_CREATED: &str = "OrderCreated(bytes32,address,bytes32,uint256,(uint256,uint256,address,address,uint256,uint256,address,address,uint256,uint256,uint256,uint256,uint256))";
    pub const ESCROW_CREATED: &str = "EscrowCreated(bytes32,uint8,bytes32)";
    pub const ESCROW_LOCKED: &str = "EscrowLocked(bytes32,uint8,uint256,uint256)";
    pub const ESCROW_CLAIMED: &str = "EscrowClaimed(bytes32,uint8,bytes32,address)";
    pub const ESCROW_CANCELLED: &str = "EscrowCancelled(bytes32,uint8,address)";
}

/// Event topic hashes (keccak256 of the event signature)
pub mod topics {
    use super::signatures;
    use crate::types::keccak256;
    use ethers::types::H256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref ORDER_CREATED: H256 = H256(keccak256(signatures::ORDER_CREATED.as_bytes()));
        pub static ref ESCROW_CREATED: H256 = H256(keccak256(signatures::ESCROW_CREATED.as_bytes()));
        pub static ref ESCROW_LOCKED: H256 = H256(keccak256(signatures::ESCROW_LOCKED.as_bytes()));
        pub static ref ESCROW_CLAIMED: H256 = H256(keccak256(signatures::ESCROW_CLAIMED.as_bytes()));
        pub static ref ESCROW_CANCELLED: H256 =
            H256(keccak256(signatures::ESCROW_CANCELLED.as_bytes()));
    }
}

/// Events observed on a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContractEvent {
    /// A maker published a new swap order
    OrderCreated {
        chain_id: u64,
        order_hash: H256,
        intent: Intent,
        hashlock: Hashlock,
        timelocks: Timelocks,
        block_number: u64,
        tx_hash: H256,
    },

    EscrowCreated {
        chain_id: u64,
        order_hash: H256,
        side: EscrowSide,
        block_number: u64,
        tx_hash: H256,
    },

    EscrowLocked {
        chain_id: u64,
        order_hash: H256,
        side: EscrowSide,
        amount: U256,
        deployed_at: u64,
        block_number: u64,
        tx_hash: H256,
    },

    /// Escrow withdrawn; carries the revealed secret
    EscrowClaimed {
        chain_id: u64,
        order_hash: H256,
        side: EscrowSide,
        secret: Secret,
        recipient: Address,
        block_number: u64,
        tx_hash: H256,
    },

    EscrowCancelled {
        chain_id: u64,
        order_hash: H256,
        side: EscrowSide,
        recipient: Address,
        block_number: u64,
        tx_hash: H256,
    },

    /// Unknown event
    Unknown {
        chain_id: u64,
        topic: H256,
        block_number: u64,
        tx_hash: H256,
    },
}

impl ContractEvent {
    /// Get the chain ID for this event
    pub fn chain_id(&self) -> u64 {
        match self {
            ContractEvent::OrderCreated { chain_id, .. }
            | ContractEvent::EscrowCreated { chain_id, .. }
            | ContractEvent::EscrowLocked { chain_id, .. }
            | ContractEvent::EscrowClaimed { chain_id, .. }
            | ContractEvent::EscrowCancelled { chain_id, .. }
            | ContractEvent::Unknown { chain_id, .. } => *chain_id,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            ContractEvent::OrderCreated { block_number, .. }
            | ContractEvent::EscrowCreated { block_number, .. }
            | ContractEvent::EscrowLocked { block_number, .. }
            | ContractEvent::EscrowClaimed { block_number, .. }
            | ContractEvent::EscrowCancelled { block_number, .. }
            | ContractEvent::Unknown { block_number, .. } => *block_number,
        }
    }

    /// Order the event belongs to, if any
    pub fn order_hash(&self) -> Option<H256> {
        match self {
            ContractEvent::OrderCreated { order_hash, .. }
            | ContractEvent::EscrowCreated { order_hash, .. }
            | ContractEvent::EscrowLocked { order_hash, .. }
            | ContractEvent::EscrowClaimed { order_hash, .. }
            | ContractEvent::EscrowCancelled { order_hash, .. } => Some(*order_hash),
            ContractEvent::Unknown { .. } => None,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            ContractEvent::OrderCreated { .. } => "order_created",
            ContractEvent::EscrowCreated { .. } => "escrow_created",
            ContractEvent::EscrowLocked { .. } => "escrow_locked",
            ContractEvent::EscrowClaimed { .. } => "escrow_claimed",
            ContractEvent::EscrowCancelled { .. } => "escrow_cancelled",
            ContractEvent::Unknown { .. } => "unknown",
        }
    }

    /// Check if this event requires coordination action
    pub fn requires_action(&self) -> bool {
        matches!(
            self,
            ContractEvent::OrderCreated { .. }
                | ContractEvent::EscrowClaimed { .. }
                | ContractEvent::EscrowCancelled { .. }
        )
    }

    /// Lift an in-process escrow event into a chain event
    pub fn from_escrow_event(
        chain_id: u64,
        block_number: u64,
        tx_hash: H256,
        event: EscrowEvent,
    ) -> Self {
        match event {
            EscrowEvent::EscrowCreated { order_hash, side } => ContractEvent::EscrowCreated {
                chain_id,
                order_hash,
                side,
                block_number,
                tx_hash,
            },
            EscrowEvent::EscrowLocked {
                order_hash,
                side,
                amount,
                deployed_at,
            } => ContractEvent::EscrowLocked {
                chain_id,
                order_hash,
                side,
                amount,
                deployed_at: u64::from(deployed_at),
                block_number,
                tx_hash,
            },
            EscrowEvent::EscrowClaimed {
                order_hash,
                side,
                secret,
                recipient,
            } => ContractEvent::EscrowClaimed {
                chain_id,
                order_hash,
                side,
                secret,
                recipient,
                block_number,
                tx_hash,
            },
            EscrowEvent::EscrowCancelled {
                order_hash,
                side,
                recipient,
            } => ContractEvent::EscrowCancelled {
                chain_id,
                order_hash,
                side,
                recipient,
                block_number,
                tx_hash,
            },
        }
    }
}

/// ABI layout of the intent tuple in `OrderCreated`
fn intent_param() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
    ])
}

/// ABI encoding of an intent as carried in `OrderCreated` data
pub fn intent_token(intent: &Intent) -> Token {
    Token::Tuple(vec![
        Token::Uint(U256::from(intent.src_chain_id)),
        Token::Uint(U256::from(intent.dst_chain_id)),
        Token::Address(intent.src_token),
        Token::Address(intent.dst_token),
        Token::Uint(intent.src_amount),
        Token::Uint(intent.dst_amount),
        Token::Address(intent.maker),
        Token::Address(intent.receiver),
        Token::Uint(U256::from(intent.slippage_bps)),
        Token::Uint(intent.resolver_fee),
        Token::Uint(intent.safety_deposit),
        Token::Uint(U256::from(intent.expiry)),
        Token::Uint(intent.salt),
    ])
}

/// Event parser for the order source and escrow factory contracts
pub struct EventParser {
    chain_id: u64,
}

impl EventParser {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    /// Topics this parser understands, for log filters
    pub fn known_topics() -> Vec<H256> {
        vec![
            *topics::ORDER_CREATED,
            *topics::ESCROW_CREATED,
            *topics::ESCROW_LOCKED,
            *topics::ESCROW_CLAIMED,
            *topics::ESCROW_CANCELLED,
        ]
    }

    /// Parse a log entry into a ContractEvent
    pub fn parse_log(&self, log: &Log) -> ResolverResult<ContractEvent> {
        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let tx_hash = log.transaction_hash.unwrap_or_default();

        let topic = log.topics.first().copied().unwrap_or_default();

        if topic == *topics::ORDER_CREATED {
            self.parse_order_created(log, block_number, tx_hash)
        } else if topic == *topics::ESCROW_CREATED {
            let (order_hash, side) = self.order_and_side(log)?;
            Ok(ContractEvent::EscrowCreated {
                chain_id: self.chain_id,
                order_hash,
                side,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::ESCROW_LOCKED {
            let (order_hash, side) = self.order_and_side(log)?;
            let data = decode_data(&[ParamType::Uint(256), ParamType::Uint(256)], log)?;
            Ok(ContractEvent::EscrowLocked {
                chain_id: self.chain_id,
                order_hash,
                side,
                amount: uint(&data[0])?,
                deployed_at: small_uint(&data[1], "deployed_at")?,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::ESCROW_CLAIMED {
            let (order_hash, side) = self.order_and_side(log)?;
            let data = decode_data(&[ParamType::FixedBytes(32), ParamType::Address], log)?;
            Ok(ContractEvent::EscrowClaimed {
                chain_id: self.chain_id,
                order_hash,
                side,
                secret: Secret::new(bytes32(&data[0])?.0),
                recipient: address(&data[1])?,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::ESCROW_CANCELLED {
            let (order_hash, side) = self.order_and_side(log)?;
            let data = decode_data(&[ParamType::Address], log)?;
            Ok(ContractEvent::EscrowCancelled {
                chain_id: self.chain_id,
                order_hash,
                side,
                recipient: address(&data[0])?,
                block_number,
                tx_hash,
            })
        } else {
            Ok(ContractEvent::Unknown {
                chain_id: self.chain_id,
                topic,
                block_number,
                tx_hash,
            })
        }
    }

    /// Parse OrderCreated event data
    fn parse_order_created(
        &self,
        log: &Log,
        block_number: u64,
        tx_hash: H256,
    ) -> ResolverResult<ContractEvent> {
        // Indexed: orderHash, maker
        let order_hash = topic(log, 1)?;

        let data = decode_data(
            &[ParamType::FixedBytes(32), ParamType::Uint(256), intent_param()],
            log,
        )?;
        let hashlock = Hashlock::from_h256(bytes32(&data[0])?);
        let timelocks = Timelocks::from_u256(uint(&data[1])?);

        let fields = match &data[2] {
            Token::Tuple(fields) if fields.len() == 13 => fields,
            _ => return Err(ResolverError::EventParsing("malformed intent tuple".to_string())),
        };
        let slippage = small_uint(&fields[8], "slippage")?;
        let intent = Intent {
            src_chain_id: small_uint(&fields[0], "src chain id")?,
            dst_chain_id: small_uint(&fields[1], "dst chain id")?,
            src_token: address(&fields[2])?,
            dst_token: address(&fields[3])?,
            src_amount: uint(&fields[4])?,
            dst_amount: uint(&fields[5])?,
            maker: address(&fields[6])?,
            receiver: address(&fields[7])?,
            slippage_bps: u16::try_from(slippage)
                .map_err(|_| ResolverError::EventParsing("slippage out of range".to_string()))?,
            resolver_fee: uint(&fields[9])?,
            safety_deposit: uint(&fields[10])?,
            expiry: small_uint(&fields[11], "expiry")?,
            salt: uint(&fields[12])?,
        };

        if intent.order_hash() != order_hash {
            return Err(ResolverError::EventParsing(format!(
                "order hash mismatch for {:?}",
                order_hash
            )));
        }

        Ok(ContractEvent::OrderCreated {
            chain_id: self.chain_id,
            order_hash,
            intent,
            hashlock,
            timelocks,
            block_number,
            tx_hash,
        })
    }

    fn order_and_side(&self, log: &Log) -> ResolverResult<(H256, EscrowSide)> {
        let order_hash = topic(log, 1)?;
        let raw_side = U256::from_big_endian(topic(log, 2)?.as_bytes());
        let side = Some(raw_side)
            .filter(|raw| *raw <= U256::from(u8::MAX))
            .and_then(|raw| EscrowSide::from_u8(raw.low_u32() as u8))
            .ok_or_else(|| ResolverError::EventParsing(format!("invalid escrow side {}", raw_side)))?;
        Ok((order_hash, side))
    }
}

fn topic(log: &Log, index: usize) -> ResolverResult<H256> {
    log.topics
        .get(index)
        .copied()
        .ok_or_else(|| ResolverError::EventParsing(format!("missing topic {}", index)))
}

fn decode_data(params: &[ParamType], log: &Log) -> ResolverResult<Vec<Token>> {
    abi::decode(params, &log.data).map_err(|e| ResolverError::EventParsing(e.to_string()))
}

fn uint(token: &Token) -> ResolverResult<U256> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| ResolverError::EventParsing("expected uint".to_string()))
}

/// A uint that must fit in 64 bits
fn small_uint(token: &Token, what: &str) -> ResolverResult<u64> {
    let value = uint(token)?;
    if value > U256::from(u64::MAX) {
        return Err(ResolverError::EventParsing(format!("{} out of range", what)));
    }
    Ok(value.as_u64())
}

fn address(token: &Token) -> ResolverResult<Address> {
    token
        .clone()
        .into_address()
        .ok_or_else(|| ResolverError::EventParsing("expected address".to_string()))
}

fn bytes32(token: &Token) -> ResolverResult<H256> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => Ok(H256::from_slice(bytes)),
        _ => Err(ResolverError::EventParsing("expected bytes32".to_string())),
    }
}
