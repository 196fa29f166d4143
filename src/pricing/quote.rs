//! Quote generation for swap intents
//!
//! Converts the source amount into destination units through configured USD
//! prices, deducts the solver fee and applies the slippage floor. Quotes are
//! kept in a TTL cache so they can be looked up by id until they expire.

use crate::config::{parse_address, PricingConfig};
use crate::error::{ResolverError, ResolverResult};
use crate::types::{u256_dec, Intent};

use dashmap::DashMap;
use ethers::types::{Address, U256};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

const BPS: u64 = 10_000;
const ROUTE_PROTOCOL: &str = "fusion-plus";
const BASE_CONFIDENCE: f64 = 0.95;
/// Slippage tolerances below this leave little room for price movement
const TIGHT_SLIPPAGE_BPS: u16 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub src_chain_id: u64,
    pub dst_chain_id: u64,
    pub src_token: Address,
    pub dst_token: Address,
    #[serde(with = "u256_dec")]
    pub src_amount: U256,
    /// Falls back to the configured default when absent
    #[serde(default)]
    pub slippage_bps: Option<u16>,
}

impl From<&Intent> for QuoteRequest {
    fn from(intent: &Intent) -> Self {
        Self {
            src_chain_id: intent.src_chain_id,
            dst_chain_id: intent.dst_chain_id,
            src_token: intent.src_token,
            dst_token: intent.dst_token,
            src_amount: intent.src_amount,
            slippage_bps: Some(intent.slippage_bps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteHop {
    pub chain_id: u64,
    pub token: Address,
    pub symbol: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: Uuid,
    pub src_chain_id: u64,
    pub dst_chain_id: u64,
    pub src_token: Address,
    pub dst_token: Address,
    #[serde(with = "u256_dec")]
    pub src_amount: U256,
    /// Destination amount after the solver fee
    #[serde(with = "u256_dec")]
    pub dst_amount: U256,
    /// Slippage floor the maker should sign for
    #[serde(with = "u256_dec")]
    pub min_dst_amount: U256,
    /// Solver fee, in destination token units
    #[serde(with = "u256_dec")]
    pub fee: U256,
    pub fee_bps: u16,
    pub slippage_bps: u16,
    pub usd_value: Decimal,
    pub route: Vec<RouteHop>,
    pub confidence: f64,
    pub created_at: u64,
    pub valid_until: u64,
}

impl Quote {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.valid_until
    }
}

#[derive(Debug, Clone)]
struct TokenInfo {
    symbol: String,
    decimals: u8,
    price_usd: Decimal,
}

pub struct QuoteEngine {
    tokens: HashMap<(u64, Address), TokenInfo>,
    chains: HashSet<u64>,
    fee_bps: u16,
    default_slippage_bps: u16,
    ttl_secs: u64,
    large_order_usd: Decimal,
    cache: DashMap<Uuid, Quote>,
}

impl QuoteEngine {
    pub fn new(config: &PricingConfig) -> ResolverResult<Self> {
        let mut tokens = HashMap::new();
        let mut chains = HashSet::new();

        for token in &config.tokens {
            let address = parse_address(&token.address)
                .map_err(|e| ResolverError::Config(e.to_string()))?;
            chains.insert(token.chain_id);
            tokens.insert(
                (token.chain_id, address),
                TokenInfo {
                    symbol: token.symbol.clone(),
                    decimals: token.decimals,
                    price_usd: token.price_usd,
                },
            );
        }

        Ok(Self {
            tokens,
            chains,
            fee_bps: config.fee_bps,
            default_slippage_bps: config.default_slippage_bps,
            ttl_secs: config.quote_ttl_secs,
            large_order_usd: config.large_order_usd,
            cache: DashMap::new(),
        })
    }

    /// Quote an intent and cache the result
    pub fn quote_intent(&self, intent: &Intent, now: u64) -> ResolverResult<Quote> {
        self.quote(&QuoteRequest::from(intent), now)
    }

    pub fn quote(&self, request: &QuoteRequest, now: u64) -> ResolverResult<Quote> {
        if request.src_amount.is_zero() {
            return Err(ResolverError::Quote("Source amount must be non-zero".to_string()));
        }
        let slippage_bps = request.slippage_bps.unwrap_or(self.default_slippage_bps);
        if u64::from(slippage_bps) > BPS {
            return Err(ResolverError::Quote(format!(
                "Slippage {} bps exceeds 100%",
                slippage_bps
            )));
        }

        let src = self.token(request.src_chain_id, request.src_token)?;
        let dst = self.token(request.dst_chain_id, request.dst_token)?;

        let src_units = to_decimal(request.src_amount)? / scale(src.decimals)?;
        let usd_value = checked(src_units.checked_mul(src.price_usd))?;
        let dst_units = checked(usd_value.checked_div(dst.price_usd))?;
        let gross = checked(dst_units.checked_mul(scale(dst.decimals)?))?.trunc();

        let fee = bps_of(gross, u64::from(self.fee_bps))?;
        let net = gross - fee;
        let min_dst = bps_of(net, BPS - u64::from(slippage_bps))?;

        let quote = Quote {
            id: Uuid::new_v4(),
            src_chain_id: request.src_chain_id,
            dst_chain_id: request.dst_chain_id,
            src_token: request.src_token,
            dst_token: request.dst_token,
            src_amount: request.src_amount,
            dst_amount: to_u256(net)?,
            min_dst_amount: to_u256(min_dst)?,
            fee: to_u256(fee)?,
            fee_bps: self.fee_bps,
            slippage_bps,
            usd_value: usd_value.round_dp(2),
            route: vec![
                RouteHop {
                    chain_id: request.src_chain_id,
                    token: request.src_token,
                    symbol: src.symbol.clone(),
                    protocol: ROUTE_PROTOCOL.to_string(),
                },
                RouteHop {
                    chain_id: request.dst_chain_id,
                    token: request.dst_token,
                    symbol: dst.symbol.clone(),
                    protocol: ROUTE_PROTOCOL.to_string(),
                },
            ],
            confidence: self.confidence(usd_value, slippage_bps),
            created_at: now,
            valid_until: now + self.ttl_secs,
        };

        debug!(
            "Quoted {} {} -> {} {} (id {})",
            request.src_amount, src.symbol, quote.dst_amount, dst.symbol, quote.id
        );

        self.cache.insert(quote.id, quote.clone());
        Ok(quote)
    }

    /// Cached quote, if it has not expired
    pub fn get(&self, id: &Uuid, now: u64) -> Option<Quote> {
        self.cache
            .get(id)
            .filter(|q| !q.is_expired(now))
            .map(|q| q.clone())
    }

    /// Drop expired quotes, returning how many were removed
    pub fn purge_expired(&self, now: u64) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, q| !q.is_expired(now));
        before.saturating_sub(self.cache.len())
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn token(&self, chain_id: u64, address: Address) -> ResolverResult<&TokenInfo> {
        if !self.chains.contains(&chain_id) {
            return Err(ResolverError::UnsupportedChain { chain_id });
        }
        self.tokens.get(&(chain_id, address)).ok_or_else(|| {
            ResolverError::Quote(format!(
                "Unsupported token {:?} on chain {}",
                address, chain_id
            ))
        })
    }

    fn confidence(&self, usd_value: Decimal, slippage_bps: u16) -> f64 {
        let mut confidence = BASE_CONFIDENCE;
        if usd_value > self.large_order_usd {
            confidence -= 0.15;
        }
        if slippage_bps < TIGHT_SLIPPAGE_BPS {
            confidence -= 0.05;
        }
        confidence.clamp(0.1, 1.0)
    }
}

fn scale(decimals: u8) -> ResolverResult<Decimal> {
    10u64
        .checked_pow(u32::from(decimals))
        .map(Decimal::from)
        .ok_or_else(|| ResolverError::Quote(format!("Unsupported token decimals {}", decimals)))
}

fn to_decimal(amount: U256) -> ResolverResult<Decimal> {
    if amount > U256::from(u128::MAX) {
        return Err(ResolverError::Quote("Amount too large".to_string()));
    }
    Decimal::from_u128(amount.as_u128())
        .ok_or_else(|| ResolverError::Quote("Amount too large".to_string()))
}

fn to_u256(value: Decimal) -> ResolverResult<U256> {
    value
        .to_u128()
        .map(U256::from)
        .ok_or_else(|| ResolverError::Quote(format!("Amount out of range: {}", value)))
}

/// `value * bps / 10_000`, rounded down
fn bps_of(value: Decimal, bps: u64) -> ResolverResult<Decimal> {
    let scaled = checked(value.checked_mul(Decimal::from(bps)))?;
    Ok(checked(scaled.checked_div(Decimal::from(BPS)))?.trunc())
}

fn checked(value: Option<Decimal>) -> ResolverResult<Decimal> {
    value.ok_or_else(|| ResolverError::Quote("Arithmetic overflow".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;

    fn engine() -> QuoteEngine {
        QuoteEngine::new(&sample_settings().pricing).unwrap()
    }

    fn weth() -> Address {
        Address::repeat_byte(0x11)
    }

    fn usdc() -> Address {
        Address::repeat_byte(0x22)
    }

    fn request(src_amount: U256) -> QuoteRequest {
        QuoteRequest {
            src_chain_id: 1,
            dst_chain_id: 137,
            src_token: weth(),
            dst_token: usdc(),
            src_amount,
            slippage_bps: None,
        }
    }

    #[test]
    fn test_quote_math() {
        // 1 WETH at $2000 into 6-decimal USDC, 30 bps fee, 50 bps slippage
        let quote = engine().quote(&request(U256::exp10(18)), 1_000).unwrap();

        assert_eq!(quote.fee, U256::from(6_000_000u64));
        assert_eq!(quote.dst_amount, U256::from(1_994_000_000u64));
        assert_eq!(quote.min_dst_amount, U256::from(1_984_030_000u64));
        assert_eq!(quote.usd_value, Decimal::from(2000));
        assert_eq!(quote.slippage_bps, 50);
        assert_eq!(quote.valid_until, 1_030);
        assert_eq!(quote.route.len(), 2);
        assert_eq!(quote.route[1].symbol, "USDC");
        assert!(quote.route.iter().all(|hop| hop.protocol == "fusion-plus"));
        assert!((quote.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_confidence_drops_for_large_and_tight_orders() {
        let mut req = request(U256::exp10(18) * 100);
        req.slippage_bps = Some(10);
        let quote = engine().quote(&req, 0).unwrap();
        // $200k is above the $100k threshold
        assert!((quote.confidence - 0.75).abs() < 1e-9);
        assert_eq!(quote.min_dst_amount, quote.dst_amount * 9_990 / 10_000);
    }

    #[test]
    fn test_unsupported_chain_and_token() {
        let mut req = request(U256::exp10(18));
        req.dst_chain_id = 42;
        let err = engine().quote(&req, 0).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported chain 42");

        let mut req = request(U256::exp10(18));
        req.src_token = Address::repeat_byte(0x99);
        let err = engine().quote(&req, 0).unwrap_err();
        assert!(err.to_string().contains("Unsupported token"));
    }

    #[test]
    fn test_rejects_zero_and_oversized_amounts() {
        assert!(engine().quote(&request(U256::zero()), 0).is_err());
        assert!(engine().quote(&request(U256::MAX), 0).is_err());
    }

    #[test]
    fn test_cache_expiry() {
        let engine = engine();
        let quote = engine.quote(&request(U256::exp10(18)), 100).unwrap();

        assert_eq!(engine.get(&quote.id, 129).unwrap().id, quote.id);
        assert!(engine.get(&quote.id, 130).is_none());
        assert!(engine.get(&Uuid::new_v4(), 100).is_none());

        engine.quote(&request(U256::exp10(17)), 200).unwrap();
        assert_eq!(engine.cached(), 2);
        assert_eq!(engine.purge_expired(200), 1);
        assert_eq!(engine.cached(), 1);
    }

    #[test]
    fn test_quote_from_intent_uses_its_slippage() {
        let intent = crate::types::order::tests::sample_intent();
        let quote = engine().quote_intent(&intent, 0).unwrap();
        assert_eq!(quote.slippage_bps, intent.slippage_bps);
        assert_eq!(quote.src_amount, intent.src_amount);
    }
}
