//! HTLC secrets and hashlocks

use ethers::core::rand::{thread_rng, RngCore};
use ethers::types::H256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// keccak256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn decode_32(s: &str) -> Result<[u8; 32], String> {
    let raw = s.trim().trim_start_matches("0x");
    let bytes = hex::decode(raw).map_err(|e| format!("invalid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected 32 bytes, got {}", b.len()))
}

/// The preimage a maker reveals to release escrowed funds
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random secret
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hashlock(&self) -> Hashlock {
        Hashlock(H256(keccak256(&self.0)))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

// Secrets never show up in logs by accident.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(..)")
    }
}

impl FromStr for Secret {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s).map(Self)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// keccak256 commitment to a `Secret`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hashlock(H256);

impl Hashlock {
    pub fn from_h256(hash: H256) -> Self {
        Self(hash)
    }

    pub fn as_h256(&self) -> H256 {
        self.0
    }

    /// True when `secret` is the preimage of this hashlock
    pub fn verify(&self, secret: &Secret) -> bool {
        secret.hashlock() == *self
    }
}

impl fmt::Display for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Hashlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_32(s).map(|b| Self(H256(b)))
    }
}

impl Serialize for Hashlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hashlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
