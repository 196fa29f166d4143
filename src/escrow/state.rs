//! HTLC escrow state machine for one swap leg

use crate::error::EscrowError;
use crate::types::{EscrowSide, Immutables, Secret, Stage};

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Escrow lifecycle. `Claimed` and `Cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowState {
    Created,
    Locked,
    Claimed,
    Cancelled,
}

impl EscrowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowState::Created => "created",
            EscrowState::Locked => "locked",
            EscrowState::Claimed => "claimed",
            EscrowState::Cancelled => "cancelled",
        }
    }
}

/// Events emitted on every escrow transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscrowEvent {
    EscrowCreated {
        order_hash: H256,
        side: EscrowSide,
    },
    EscrowLocked {
        order_hash: H256,
        side: EscrowSide,
        amount: U256,
        deployed_at: u32,
    },
    EscrowClaimed {
        order_hash: H256,
        side: EscrowSide,
        secret: Secret,
        recipient: Address,
    },
    EscrowCancelled {
        order_hash: H256,
        side: EscrowSide,
        recipient: Address,
    },
}

/// A transfer released by a claim or cancel. `token == Address::zero()` is native value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub recipient: Address,
    pub token: Address,
    pub amount: U256,
}

/// Result of a terminal transition: funds released plus the emitted event
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub payouts: Vec<Payout>,
    pub event: EscrowEvent,
}

/// One escrow (source or destination) holding locked funds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub side: EscrowSide,
    pub immutables: Immutables,
    pub state: EscrowState,
    pub deposited: U256,
    pub revealed_secret: Option<Secret>,
}

impl Escrow {
    pub fn new(side: EscrowSide, immutables: Immutables) -> Result<Self, EscrowError> {
        immutables.timelocks.validate()?;
        Ok(Self {
            side,
            immutables,
            state: EscrowState::Created,
            deposited: U256::zero(),
            revealed_secret: None,
        })
    }

    /// Lock funds. Source escrows are funded by the maker, destination
    /// escrows by the taker. Stamps the deployment time into the timelocks.
    pub fn lock(&mut self, caller: Address, deposit: U256, now: u64) -> Result<EscrowEvent, EscrowError> {
        self.require_state(EscrowState::Created)?;

        let (expected, funder) = match self.side {
            EscrowSide::Source => ("maker", self.immutables.maker),
            EscrowSide::Destination => ("taker", self.immutables.taker),
        };
        if caller != funder {
            return Err(EscrowError::Unauthorized {
                action: "lock",
                expected,
            });
        }

        // Payouts release exactly amount + safety deposit, so nothing more may be held
        let need = self.immutables.required_deposit();
        if deposit < need {
            return Err(EscrowError::InsufficientBalance {
                have: deposit.to_string(),
                need: need.to_string(),
            });
        }
        if deposit > need {
            return Err(EscrowError::ExcessDeposit {
                have: deposit.to_string(),
                need: need.to_string(),
            });
        }

        let deployed_at = u32::try_from(now)
            .map_err(|_| EscrowError::InvalidTimelocks(format!("timestamp {} overflows", now)))?;
        self.immutables.timelocks = self.immutables.timelocks.with_deployed_at(deployed_at);
        self.deposited = deposit;
        self.state = EscrowState::Locked;

        Ok(EscrowEvent::EscrowLocked {
            order_hash: self.immutables.order_hash,
            side: self.side,
            amount: self.immutables.amount,
            deployed_at,
        })
    }

    /// Taker-only withdrawal during the private withdrawal window
    pub fn claim(&mut self, caller: Address, secret: &Secret, now: u64) -> Result<Settlement, EscrowError> {
        self.require_state(EscrowState::Locked)?;
        if caller != self.immutables.taker {
            return Err(EscrowError::Unauthorized {
                action: "claim",
                expected: "taker",
            });
        }
        self.require_secret(secret)?;

        let (opens, closes) = match self.side {
            EscrowSide::Source => (Stage::SrcWithdrawal, Stage::SrcCancellation),
            EscrowSide::Destination => (Stage::DstWithdrawal, Stage::DstCancellation),
        };
        self.require_window(opens, Some(closes), now)?;

        Ok(self.settle_claim(caller, secret))
    }

    /// Withdrawal by any caller once the public withdrawal stage opens
    pub fn public_claim(&mut self, caller: Address, secret: &Secret, now: u64) -> Result<Settlement, EscrowError> {
        self.require_state(EscrowState::Locked)?;
        self.require_secret(secret)?;

        let (opens, closes) = match self.side {
            EscrowSide::Source => (Stage::SrcPublicWithdrawal, Stage::SrcCancellation),
            EscrowSide::Destination => (Stage::DstPublicWithdrawal, Stage::DstCancellation),
        };
        self.require_window(opens, Some(closes), now)?;

        Ok(self.settle_claim(caller, secret))
    }

    /// Taker-only refund during the private cancellation window
    pub fn cancel(&mut self, caller: Address, now: u64) -> Result<Settlement, EscrowError> {
        self.require_state(EscrowState::Locked)?;
        if caller != self.immutables.taker {
            return Err(EscrowError::Unauthorized {
                action: "cancel",
                expected: "taker",
            });
        }

        match self.side {
            EscrowSide::Source => self.require_window(
                Stage::SrcCancellation,
                Some(Stage::SrcPublicCancellation),
                now,
            )?,
            EscrowSide::Destination => self.require_window(Stage::DstCancellation, None, now)?,
        }

        Ok(self.settle_cancel(caller))
    }

    /// Refund by any caller after the public cancellation stage (source only)
    pub fn public_cancel(&mut self, caller: Address, now: u64) -> Result<Settlement, EscrowError> {
        if self.side == EscrowSide::Destination {
            return Err(EscrowError::UnsupportedOperation {
                operation: "public cancel",
                side: self.side,
            });
        }
        self.require_state(EscrowState::Locked)?;
        self.require_window(Stage::SrcPublicCancellation, None, now)?;

        Ok(self.settle_cancel(caller))
    }

    /// Absolute timestamp of a timelock stage
    pub fn get_timelock(&self, stage: Stage) -> u64 {
        self.immutables.timelocks.get(stage)
    }

    fn settle_claim(&mut self, caller: Address, secret: &Secret) -> Settlement {
        // Source funds go to the resolver, destination funds to the maker.
        let recipient = match self.side {
            EscrowSide::Source => self.immutables.taker,
            EscrowSide::Destination => self.immutables.maker,
        };

        self.state = EscrowState::Claimed;
        self.revealed_secret = Some(*secret);

        Settlement {
            payouts: self.payouts(recipient, caller),
            event: EscrowEvent::EscrowClaimed {
                order_hash: self.immutables.order_hash,
                side: self.side,
                secret: *secret,
                recipient,
            },
        }
    }

    fn settle_cancel(&mut self, caller: Address) -> Settlement {
        // Funds return to whoever locked them.
        let recipient = match self.side {
            EscrowSide::Source => self.immutables.maker,
            EscrowSide::Destination => self.immutables.taker,
        };

        self.state = EscrowState::Cancelled;

        Settlement {
            payouts: self.payouts(recipient, caller),
            event: EscrowEvent::EscrowCancelled {
                order_hash: self.immutables.order_hash,
                side: self.side,
                recipient,
            },
        }
    }

    fn payouts(&self, recipient: Address, caller: Address) -> Vec<Payout> {
        let mut payouts = vec![Payout {
            recipient,
            token: self.immutables.token,
            amount: self.immutables.amount,
        }];
        if !self.immutables.safety_deposit.is_zero() {
            payouts.push(Payout {
                recipient: caller,
                token: Address::zero(),
                amount: self.immutables.safety_deposit,
            });
        }
        payouts
    }

    fn require_state(&self, expected: EscrowState) -> Result<(), EscrowError> {
        if self.state != expected {
            return Err(EscrowError::InvalidState {
                expected: expected.as_str(),
                found: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn require_secret(&self, secret: &Secret) -> Result<(), EscrowError> {
        if !self.immutables.hashlock.verify(secret) {
            return Err(EscrowError::InvalidSecret);
        }
        Ok(())
    }

    /// `now` must be in `[opens, closes)`
    fn require_window(&self, opens: Stage, closes: Option<Stage>, now: u64) -> Result<(), EscrowError> {
        let opens_at = self.get_timelock(opens);
        if now < opens_at {
            return Err(EscrowError::TimelockNotReached {
                stage: opens,
                opens_at,
                now,
            });
        }
        if let Some(closes) = closes {
            let closed_at = self.get_timelock(closes);
            if now >= closed_at {
                return Err(EscrowError::TimelockExpired {
                    stage: closes,
                    closed_at,
                    now,
                });
            }
        }
        Ok(())
    }
}
