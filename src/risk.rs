//! Risk gates (§4.5): depeg detection, single-rebalance and cumulative
//! portfolio loss limits, the consecutive-error budget, and the gas-cost/
//! spike gate. Grounded on `cooprefr-bettersys/src/backtest_v2/risk.rs` and
//! `.../pre_trade_risk.rs`, which return a verdict enum from a gate rather
//! than throwing, with an "ALERT"/"EMERGENCY" notifier message framing.

use serde::{Deserialize, Serialize};

use crate::gas::{estimate_rebalance_cost_usd, GasInfo};
use crate::ticks::tick_to_price;

/// Single-rebalance loss threshold, fixed per §6.
pub const SINGLE_REBALANCE_LOSS_THRESHOLD_PCT: f64 = 2.0;
/// Default depeg threshold when a pool doesn't configure one, per §3.
pub const DEFAULT_DEPEG_THRESHOLD_PCT: f64 = 5.0;
/// Consecutive chain-writing failures before the engine halts, per §4.5.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Outcome of the depeg check (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DepegVerdict {
    Ok,
    Depegged { current_price: f64, deviation_pct: f64 },
}

/// Checks `tick`'s implied price against `expected_price_ratio` (if the pool
/// configured one) and `threshold_pct`. A pool with no configured expected
/// ratio can never depeg by definition (§4.5: "Only if
/// `expectedPriceRatio` is configured").
pub fn check_depeg(
    tick: i32,
    expected_price_ratio: Option<f64>,
    threshold_pct: f64,
) -> DepegVerdict {
    let Some(expected) = expected_price_ratio else {
        return DepegVerdict::Ok;
    };
    let current_price = tick_to_price(tick);
    let deviation_pct = ((current_price - expected) / expected).abs() * 100.0;
    if deviation_pct > threshold_pct {
        DepegVerdict::Depegged {
            current_price,
            deviation_pct,
        }
    } else {
        DepegVerdict::Ok
    }
}

/// Fires when `post_value < pre_value * (1 - threshold/100)` (§4.5).
pub fn single_rebalance_loss_exceeded(pre_value: f64, post_value: f64) -> bool {
    post_value < pre_value * (1.0 - SINGLE_REBALANCE_LOSS_THRESHOLD_PCT / 100.0)
}

/// Fires when `post_value < initial_value_usd * (1 - max_total_loss_pct/100)`.
pub fn portfolio_loss_exceeded(post_value: f64, initial_value_usd: f64, max_total_loss_pct: f64) -> bool {
    post_value < initial_value_usd * (1.0 - max_total_loss_pct / 100.0)
}

/// Tracks consecutive chain-writing failures (§4.5). Any success resets
/// the counter; reaching [`MAX_CONSECUTIVE_ERRORS`] signals the engine
/// should transition to `Error` and trigger an emergency stop.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConsecutiveErrorBudget {
    count: u32,
}

impl ConsecutiveErrorBudget {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn record_failure(&mut self) -> bool {
        self.count += 1;
        self.exhausted()
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.count >= MAX_CONSECUTIVE_ERRORS
    }
}

/// Whether a position is considered "out of range" for the gas gate's
/// purposes (§4.5: "The current core treats trigger-band entries as
/// 'out of range' (always proceeds)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    InRange,
    OutOfRange,
}

/// Verdict of the gas gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GasVerdict {
    Proceed,
    Skip { reason: GasSkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GasSkipReason {
    Spike,
    OverBudget,
}

/// A gas spike or an over-budget cost estimate skips a rebalance only if the
/// position is still in range; an out-of-range position proceeds regardless
/// (§4.5). `max_gas_cost_usd` is the pool's configured ceiling.
pub fn gas_gate(
    gas_info: GasInfo,
    is_spike: bool,
    eth_price_usd: f64,
    max_gas_cost_usd: f64,
    range_state: RangeState,
) -> GasVerdict {
    if range_state == RangeState::OutOfRange {
        return GasVerdict::Proceed;
    }
    if is_spike {
        return GasVerdict::Skip {
            reason: GasSkipReason::Spike,
        };
    }
    let cost = estimate_rebalance_cost_usd(gas_info.gas_price_gwei, eth_price_usd);
    if cost > max_gas_cost_usd {
        return GasVerdict::Skip {
            reason: GasSkipReason::OverBudget,
        };
    }
    GasVerdict::Proceed
}
