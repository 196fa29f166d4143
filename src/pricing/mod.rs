//! Order economics: profitability scoring and quote generation

pub mod profitability;
pub mod quote;

pub use profitability::{ProfitEstimate, ProfitInputs, ProfitabilityAnalyzer, RiskLevel};
pub use quote::{Quote, QuoteEngine, QuoteRequest, RouteHop};
