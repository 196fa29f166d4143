//! Packed timelock stages
//!
//! Layout of the 256-bit word (least significant bits first):
//!
//! ```text
//! bits 0..32     SrcWithdrawal
//! bits 32..64    SrcPublicWithdrawal
//! bits 64..96    SrcCancellation
//! bits 96..128   SrcPublicCancellation
//! bits 128..160  DstWithdrawal
//! bits 160..192  DstPublicWithdrawal
//! bits 192..224  DstCancellation
//! bits 224..256  deployed_at
//! ```
//!
//! Stage values are offsets in seconds from `deployed_at`, which is stamped
//! when the escrow is locked.

use crate::error::EscrowError;

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

const DEPLOYED_AT_SHIFT: usize = 224;
const STAGE_BITS: usize = 32;

/// One of the seven ordered timelock stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SrcWithdrawal,
    SrcPublicWithdrawal,
    SrcCancellation,
    SrcPublicCancellation,
    DstWithdrawal,
    DstPublicWithdrawal,
    DstCancellation,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::SrcWithdrawal,
        Stage::SrcPublicWithdrawal,
        Stage::SrcCancellation,
        Stage::SrcPublicCancellation,
        Stage::DstWithdrawal,
        Stage::DstPublicWithdrawal,
        Stage::DstCancellation,
    ];

    /// Position of the stage in the packed word
    pub fn index(self) -> usize {
        match self {
            Stage::SrcWithdrawal => 0,
            Stage::SrcPublicWithdrawal => 1,
            Stage::SrcCancellation => 2,
            Stage::SrcPublicCancellation => 3,
            Stage::DstWithdrawal => 4,
            Stage::DstPublicWithdrawal => 5,
            Stage::DstCancellation => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::SrcWithdrawal => "src_withdrawal",
            Stage::SrcPublicWithdrawal => "src_public_withdrawal",
            Stage::SrcCancellation => "src_cancellation",
            Stage::SrcPublicCancellation => "src_public_cancellation",
            Stage::DstWithdrawal => "dst_withdrawal",
            Stage::DstPublicWithdrawal => "dst_public_withdrawal",
            Stage::DstCancellation => "dst_cancellation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unpacked stage offsets in seconds, also used as the `[timelocks]` config section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOffsets {
    pub src_withdrawal: u32,
    pub src_public_withdrawal: u32,
    pub src_cancellation: u32,
    pub src_public_cancellation: u32,
    pub dst_withdrawal: u32,
    pub dst_public_withdrawal: u32,
    pub dst_cancellation: u32,
}

impl StageOffsets {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::SrcWithdrawal => self.src_withdrawal,
            Stage::SrcPublicWithdrawal => self.src_public_withdrawal,
            Stage::SrcCancellation => self.src_cancellation,
            Stage::SrcPublicCancellation => self.src_public_cancellation,
            Stage::DstWithdrawal => self.dst_withdrawal,
            Stage::DstPublicWithdrawal => self.dst_public_withdrawal,
            Stage::DstCancellation => self.dst_cancellation,
        }
    }

    fn set(&mut self, stage: Stage, value: u32) {
        let slot = match stage {
            Stage::SrcWithdrawal => &mut self.src_withdrawal,
            Stage::SrcPublicWithdrawal => &mut self.src_public_withdrawal,
            Stage::SrcCancellation => &mut self.src_cancellation,
            Stage::SrcPublicCancellation => &mut self.src_public_cancellation,
            Stage::DstWithdrawal => &mut self.dst_withdrawal,
            Stage::DstPublicWithdrawal => &mut self.dst_public_withdrawal,
            Stage::DstCancellation => &mut self.dst_cancellation,
        };
        *slot = value;
    }
}

/// Seven timelock stages and the deployment timestamp in one 256-bit word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timelocks(U256);

impl Timelocks {
    pub fn pack(offsets: &StageOffsets, deployed_at: u32) -> Self {
        let mut word = U256::from(deployed_at) << DEPLOYED_AT_SHIFT;
        for stage in Stage::ALL {
            word = word | (U256::from(offsets.get(stage)) << (stage.index() * STAGE_BITS));
        }
        Self(word)
    }

    pub fn unpack(&self) -> (StageOffsets, u32) {
        let mut offsets = StageOffsets::default();
        for stage in Stage::ALL {
            offsets.set(stage, self.offset(stage));
        }
        (offsets, self.deployed_at())
    }

    pub fn from_u256(word: U256) -> Self {
        Self(word)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn deployed_at(&self) -> u32 {
        (self.0 >> DEPLOYED_AT_SHIFT).low_u32()
    }

    /// Raw offset of a stage relative to `deployed_at`
    pub fn offset(&self, stage: Stage) -> u32 {
        (self.0 >> (stage.index() * STAGE_BITS)).low_u32()
    }

    /// Absolute unix timestamp at which `stage` begins
    pub fn get(&self, stage: Stage) -> u64 {
        self.deployed_at() as u64 + self.offset(stage) as u64
    }

    /// Replace the deployment timestamp, keeping every stage offset
    pub fn with_deployed_at(self, deployed_at: u32) -> Self {
        let mask = U256::from(u32::MAX) << DEPLOYED_AT_SHIFT;
        Self((self.0 & !mask) | (U256::from(deployed_at) << DEPLOYED_AT_SHIFT))
    }

    /// Stages must be ordered on each side, and the destination leg must
    /// become cancellable no later than the source leg.
    pub fn validate(&self) -> Result<(), EscrowError> {
        let (o, _) = self.unpack();

        let ordered = |stages: &[Stage]| {
            stages
                .windows(2)
                .all(|pair| o.get(pair[0]) <= o.get(pair[1]))
        };

        if !ordered(&[
            Stage::SrcWithdrawal,
            Stage::SrcPublicWithdrawal,
            Stage::SrcCancellation,
            Stage::SrcPublicCancellation,
        ]) {
            return Err(EscrowError::InvalidTimelocks(
                "source stages are out of order".to_string(),
            ));
        }

        if !ordered(&[
            Stage::DstWithdrawal,
            Stage::DstPublicWithdrawal,
            Stage::DstCancellation,
        ]) {
            return Err(EscrowError::InvalidTimelocks(
                "destination stages are out of order".to_string(),
            ));
        }

        if o.dst_cancellation > o.src_cancellation {
            return Err(EscrowError::InvalidTimelocks(
                "destination cancellation must not follow source cancellation".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offsets() -> StageOffsets {
        StageOffsets {
            src_withdrawal: 10,
            src_public_withdrawal: 120,
            src_cancellation: 121,
            src_public_cancellation: 122,
            dst_withdrawal: 10,
            dst_public_withdrawal: 100,
            dst_cancellation: 101,
        }
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let offsets = sample_offsets();
        let packed = Timelocks::pack(&offsets, 1_700_000_000);
        let (unpacked, deployed_at) = packed.unpack();
        assert_eq!(unpacked, offsets);
        assert_eq!(deployed_at, 1_700_000_000);
    }

    #[test]
    fn test_roundtrip_extreme_values() {
        let offsets = StageOffsets {
            src_withdrawal: 0,
            src_public_withdrawal: u32::MAX,
            src_cancellation: 1,
            src_public_cancellation: u32::MAX - 1,
            dst_withdrawal: 0x8000_0000,
            dst_public_withdrawal: 0xdead_beef,
            dst_cancellation: 7,
        };
        let packed = Timelocks::pack(&offsets, u32::MAX);
        assert_eq!(packed.unpack(), (offsets, u32::MAX));
        assert_eq!(Timelocks::from_u256(packed.as_u256()), packed);
    }

    #[test]
    fn test_stage_layout() {
        let offsets = StageOffsets {
            src_withdrawal: 1,
            ..Default::default()
        };
        assert_eq!(Timelocks::pack(&offsets, 0).as_u256(), U256::from(1));

        let offsets = StageOffsets {
            src_public_withdrawal: 1,
            ..Default::default()
        };
        assert_eq!(Timelocks::pack(&offsets, 0).as_u256(), U256::from(1) << 32usize);

        let packed = Timelocks::pack(&StageOffsets::default(), 1);
        assert_eq!(packed.as_u256(), U256::from(1) << 224usize);
    }

    #[test]
    fn test_get_is_absolute() {
        let packed = Timelocks::pack(&sample_offsets(), 1_000);
        assert_eq!(packed.get(Stage::SrcWithdrawal), 1_010);
        assert_eq!(packed.get(Stage::SrcCancellation), 1_121);
        assert_eq!(packed.get(Stage::DstCancellation), 1_101);
    }

    #[test]
    fn test_with_deployed_at_keeps_offsets() {
        let packed = Timelocks::pack(&sample_offsets(), 5);
        let moved = packed.with_deployed_at(2_000_000_000);
        assert_eq!(moved.deployed_at(), 2_000_000_000);
        assert_eq!(moved.unpack().0, sample_offsets());
        assert_eq!(moved.get(Stage::SrcPublicCancellation), 2_000_000_122);
    }

    #[test]
    fn test_validate_rejects_unordered_stages() {
        assert!(Timelocks::pack(&sample_offsets(), 0).validate().is_ok());

        let mut bad = sample_offsets();
        bad.src_cancellation = 5;
        assert!(matches!(
            Timelocks::pack(&bad, 0).validate(),
            Err(EscrowError::InvalidTimelocks(_))
        ));

        let mut bad = sample_offsets();
        bad.dst_cancellation = 500;
        bad.dst_public_withdrawal = 400;
        assert!(Timelocks::pack(&bad, 0).validate().is_err());
    }
}
