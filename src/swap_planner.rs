//! Swap-ratio planner (§4.3).
//!
//! Computes the swap needed to bring wallet balances toward a target band's
//! token0:token1 ratio. Grounded on `uniswap-v3-sdk-rs`'s
//! `utils::max_liquidity_for_amounts` for the amount0-vs-amount1-for-unit-
//! liquidity relationship this approximates, simplified to a closed-form
//! share comparison since the core never needs an exact
//! liquidity-for-amounts solve — only "which side is in excess".

use serde::{Deserialize, Serialize};

use crate::band::Direction;

/// Minimum ratio deviation worth acting on; smaller deviations return `None`
/// (§4.3: `|ideal - current| < 0.01`).
const RATIO_DEADBAND: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Token {
    Token0,
    Token1,
}

/// A proposed swap: `amount_in` of `token_in`, with `token_out` implied by
/// the pair (there are only two tokens).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwapPlan {
    pub token_in: Token,
    pub token_out: Token,
    pub amount_in: f64,
}

/// General-purpose planner used when minting a fresh band against an
/// arbitrary target range (§4.3, the "otherwise" / ideal-vs-current
/// share branch). `price` is token1 per token0 at the current tick.
pub fn plan_swap_for_band(
    current_tick: i32,
    band_lower: i32,
    band_upper: i32,
    bal0: f64,
    bal1: f64,
    price: f64,
    amount0_for_unit_liquidity: f64,
    amount1_for_unit_liquidity: f64,
) -> Option<SwapPlan> {
    if current_tick >= band_upper {
        // Entirely below the current price: band only needs token1.
        return non_zero_plan(Token::Token0, Token::Token1, bal0);
    }
    if current_tick < band_lower {
        // Entirely above the current price: band only needs token0.
        return non_zero_plan(Token::Token1, Token::Token0, bal1);
    }

    let a0 = amount0_for_unit_liquidity;
    let a1 = amount1_for_unit_liquidity;
    let ideal_share0 = a0 / (a0 + a1 * price);
    let current_share0 = bal0 / (bal0 + bal1 * price);

    if (ideal_share0 - current_share0).abs() < RATIO_DEADBAND {
        return None;
    }

    if current_share0 > ideal_share0 {
        // Too much token0 relative to target: sell the excess into token1.
        let excess_value0 = (current_share0 - ideal_share0) * (bal0 + bal1 * price);
        let amount = (excess_value0 / price).min(bal0);
        non_zero_plan(Token::Token0, Token::Token1, amount)
    } else {
        let excess_value1 = (ideal_share0 - current_share0) * (bal0 + bal1 * price);
        let amount = excess_value1.min(bal1);
        non_zero_plan(Token::Token1, Token::Token0, amount)
    }
}

fn non_zero_plan(token_in: Token, token_out: Token, amount_in: f64) -> Option<SwapPlan> {
    if amount_in <= 0.0 {
        return None;
    }
    Some(SwapPlan {
        token_in,
        token_out,
        amount_in,
    })
}

/// The simpler rule the engine actually uses for band rebalances (
/// §4.3 "For band rebalances the engine uses a simpler rule"): dissolving
/// the opposite band yields exactly the token needed, so swap all of it.
/// `direction` is the rebalance direction, `bal0`/`bal1` are the balances
/// freed by the withdraw step.
pub fn plan_rebalance_swap(direction: Direction, bal0: f64, bal1: f64) -> Option<SwapPlan> {
    match direction {
        Direction::Lower if bal0 > 0.0 => non_zero_plan(Token::Token0, Token::Token1, bal0),
        Direction::Upper if bal1 > 0.0 => non_zero_plan(Token::Token1, Token::Token0, bal1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_entirely_above_tick_needs_only_token1() {
        let plan = plan_swap_for_band(0, 10, 20, 100.0, 0.0, 1.0, 1.0, 1.0).unwrap();
        assert_eq!(plan.token_in, Token::Token0);
        assert_eq!(plan.token_out, Token::Token1);
        assert_eq!(plan.amount_in, 100.0);
    }

    #[test]
    fn band_entirely_below_tick_needs_only_token0() {
        let plan = plan_swap_for_band(30, 10, 20, 0.0, 50.0, 1.0, 1.0, 1.0).unwrap();
        assert_eq!(plan.token_in, Token::Token1);
        assert_eq!(plan.token_out, Token::Token0);
        assert_eq!(plan.amount_in, 50.0);
    }

    #[test]
    fn no_plan_when_zero_balance_on_the_needed_side() {
        assert!(plan_swap_for_band(0, 10, 20, 0.0, 0.0, 1.0, 1.0, 1.0).is_none());
    }

    #[test]
    fn within_deadband_returns_none() {
        // balanced 50/50 at price 1, ideal also 50/50
        let plan = plan_swap_for_band(15, 10, 20, 50.0, 50.0, 1.0, 1.0, 1.0);
        assert!(plan.is_none());
    }

    #[test]
    fn excess_token0_swaps_into_token1() {
        let plan = plan_swap_for_band(15, 10, 20, 90.0, 10.0, 1.0, 1.0, 1.0).unwrap();
        assert_eq!(plan.token_in, Token::Token0);
        assert_eq!(plan.token_out, Token::Token1);
        assert!(plan.amount_in > 0.0);
    }

    #[test]
    fn rebalance_swap_lower_direction_swaps_token0() {
        let plan = plan_rebalance_swap(Direction::Lower, 50.0, 0.0).unwrap();
        assert_eq!(plan.token_in, Token::Token0);
        assert_eq!(plan.amount_in, 50.0);
    }

    #[test]
    fn rebalance_swap_upper_direction_swaps_token1() {
        let plan = plan_rebalance_swap(Direction::Upper, 0.0, 75.0).unwrap();
        assert_eq!(plan.token_in, Token::Token1);
        assert_eq!(plan.amount_in, 75.0);
    }

    #[test]
    fn rebalance_swap_skipped_when_relevant_side_is_zero() {
        assert!(plan_rebalance_swap(Direction::Lower, 0.0, 50.0).is_none());
        assert!(plan_rebalance_swap(Direction::Upper, 50.0, 0.0).is_none());
    }
}
