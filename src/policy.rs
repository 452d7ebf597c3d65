//! Cost and limit policy: accepting or rejecting server quotes and pinning
//! the per-swap fee ceilings the rest of the swap must respect.

use crate::api::{LoopInQuote, LoopOutQuote};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Policy configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Expansion factor applied to the quoted miner fee to absorb mempool
    /// volatility between quote and sweep time.
    pub miner_fee_multiplier: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            miner_fee_multiplier: 100,
        }
    }
}

/// User-declared cost ceilings for a swap. `None` leaves the corresponding
/// cost unbounded (the quote still has to be accepted explicitly).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SwapLimits {
    pub max_swap_fee: Option<u64>,
    pub max_prepay_amount: Option<u64>,
    pub max_swap_routing_fee: Option<u64>,
    pub max_prepay_routing_fee: Option<u64>,
    pub max_miner_fee: Option<u64>,
}

/// Finalised cost ceilings, written into the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostCeilings {
    pub max_swap_fee: u64,
    pub max_prepay_amount: Option<u64>,
    pub max_swap_routing_fee: Option<u64>,
    pub max_prepay_routing_fee: Option<u64>,
    pub max_miner_fee: u64,
}

/// Validate a Loop Out quote against the user's limits.
///
/// Every quoted value must fit under its declared ceiling; the miner fee
/// ceiling is expanded by the configured multiplier.
pub fn validate_loop_out_quote(
    quote: &LoopOutQuote,
    limits: &SwapLimits,
    config: &PolicyConfig,
) -> Result<CostCeilings> {
    check_ceiling("swap_fee", quote.swap_fee, limits.max_swap_fee)?;
    check_ceiling("prepay_amount", quote.prepay_amount, limits.max_prepay_amount)?;
    let max_miner_fee = miner_fee_ceiling(quote.miner_fee, limits, config)?;

    Ok(CostCeilings {
        max_swap_fee: limits.max_swap_fee.unwrap_or(quote.swap_fee),
        max_prepay_amount: Some(limits.max_prepay_amount.unwrap_or(quote.prepay_amount)),
        max_swap_routing_fee: limits.max_swap_routing_fee,
        max_prepay_routing_fee: limits.max_prepay_routing_fee,
        max_miner_fee,
    })
}

/// Validate a Loop In quote against the user's limits.
pub fn validate_loop_in_quote(
    quote: &LoopInQuote,
    limits: &SwapLimits,
    config: &PolicyConfig,
) -> Result<CostCeilings> {
    check_ceiling("swap_fee", quote.swap_fee, limits.max_swap_fee)?;
    let max_miner_fee = miner_fee_ceiling(quote.miner_fee, limits, config)?;

    Ok(CostCeilings {
        max_swap_fee: limits.max_swap_fee.unwrap_or(quote.swap_fee),
        max_prepay_amount: None,
        max_swap_routing_fee: limits.max_swap_routing_fee,
        max_prepay_routing_fee: None,
        max_miner_fee,
    })
}

/// Whether an observed, actually-paid cost fits under its stored ceiling.
///
/// A live swap fails on an observed cost strictly exceeding its ceiling,
/// never because an estimate moved.
pub fn observed_cost_within(observed: u64, ceiling: Option<u64>) -> bool {
    match ceiling {
        Some(ceiling) => observed <= ceiling,
        None => true,
    }
}

fn miner_fee_ceiling(quoted: u64, limits: &SwapLimits, config: &PolicyConfig) -> Result<u64> {
    match limits.max_miner_fee {
        Some(limit) => {
            check_ceiling("miner_fee", quoted, Some(limit))?;
            Ok(limit)
        }
        None => Ok(quoted.saturating_mul(config.miner_fee_multiplier)),
    }
}

fn check_ceiling(field: &'static str, quoted: u64, limit: Option<u64>) -> Result<()> {
    if let Some(limit) = limit {
        if quoted > limit {
            return Err(Error::QuoteExceedsLimit {
                field,
                quoted,
                limit,
            });
        }
    }
    Ok(())
}
