//! Order profitability scoring
//!
//! A stateless scoring function: net profit, a risk bucket accumulated from
//! a fixed rule set, and a 1-10 priority used to order executions.

use crate::config::ProfitabilityConfig;
use crate::types::{u256_dec, Order};

use ethers::types::U256;
use serde::{Deserialize, Serialize};

const WEI_PER_ETH: f64 = 1e18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    fn from_points(points: u8) -> Self {
        match points {
            0..=1 => RiskLevel::Low,
            2..=3 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

/// Inputs to the scoring function
#[derive(Debug, Clone)]
pub struct ProfitInputs {
    pub resolver_fee: U256,
    pub estimated_gas_cost: U256,
    pub safety_deposit: U256,
    pub time_to_expiry_secs: u64,
    pub order_size: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitEstimate {
    /// Resolver fee minus gas cost, in wei
    pub net_profit_wei: i128,
    #[serde(with = "u256_dec")]
    pub gas_cost_wei: U256,
    pub risk: RiskLevel,
    pub risk_points: u8,
    pub priority: u8,
    pub profitable: bool,
    /// Risk rules that fired
    pub reasons: Vec<String>,
}

pub struct ProfitabilityAnalyzer {
    config: ProfitabilityConfig,
}

impl ProfitabilityAnalyzer {
    pub fn new(config: ProfitabilityConfig) -> Self {
        Self { config }
    }

    pub fn estimated_gas_units(&self) -> u64 {
        self.config.estimated_gas_units
    }

    /// Score an order given the current gas cost estimate
    pub fn analyze_order(&self, order: &Order, estimated_gas_cost: U256, now: u64) -> ProfitEstimate {
        self.analyze(&ProfitInputs {
            resolver_fee: order.intent.resolver_fee,
            estimated_gas_cost,
            safety_deposit: order.intent.safety_deposit,
            time_to_expiry_secs: order.intent.time_to_expiry(now),
            order_size: order.intent.src_amount,
        })
    }

    pub fn analyze(&self, inputs: &ProfitInputs) -> ProfitEstimate {
        let net_profit_wei = to_i128(inputs.resolver_fee) - to_i128(inputs.estimated_gas_cost);

        let mut points = 0u8;
        let mut reasons = Vec::new();
        let mut flag = |weight: u8, reason: &str| {
            points += weight;
            reasons.push(reason.to_string());
        };

        if inputs.time_to_expiry_secs < 300 {
            flag(2, "expires within 5 minutes");
        } else if inputs.time_to_expiry_secs < 1800 {
            flag(1, "expires within 30 minutes");
        }
        if inputs.order_size >= U256::from(self.config.large_order_wei) {
            flag(1, "large order");
        }
        if inputs.safety_deposit > inputs.order_size / 10 {
            flag(1, "safety deposit above 10% of order size");
        }
        if inputs.estimated_gas_cost > inputs.resolver_fee / 2 {
            flag(1, "gas cost above half the resolver fee");
        }
        if net_profit_wei <= 0 {
            flag(2, "no net profit");
        }

        let risk = RiskLevel::from_points(points);
        let priority = priority(net_profit_wei, risk, inputs.time_to_expiry_secs);
        let profitable = net_profit_wei >= 0
            && net_profit_wei as u128 >= self.config.min_profit_wei
            && (risk != RiskLevel::High || self.config.accept_high_risk);

        ProfitEstimate {
            net_profit_wei,
            gas_cost_wei: inputs.estimated_gas_cost,
            risk,
            risk_points: points,
            priority,
            profitable,
            reasons,
        }
    }
}

/// Priority 1..=10 from profit magnitude, risk and time pressure
fn priority(net_profit_wei: i128, risk: RiskLevel, time_to_expiry_secs: u64) -> u8 {
    let profit_eth = net_profit_wei as f64 / WEI_PER_ETH;
    let profit_score: u8 = if profit_eth >= 0.1 {
        4
    } else if profit_eth >= 0.01 {
        3
    } else if profit_eth >= 0.001 {
        2
    } else if profit_eth > 0.0 {
        1
    } else {
        0
    };

    let risk_score: u8 = match risk {
        RiskLevel::Low => 3,
        RiskLevel::Medium => 1,
        RiskLevel::High => 0,
    };

    // Orders close to expiry need to be picked up first.
    let time_score: u8 = if time_to_expiry_secs < 600 {
        3
    } else if time_to_expiry_secs < 3600 {
        2
    } else {
        1
    };

    (profit_score + risk_score + time_score).clamp(1, 10)
}

fn to_i128(value: U256) -> i128 {
    if value > U256::from(i128::MAX as u128) {
        i128::MAX
    } else {
        value.as_u128() as i128
    }
}
