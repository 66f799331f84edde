//! Portfolio valuation (§4.6).
//!
//! Values a two-token balance in token1 units. Grounded on
//! `cooprefr-bettersys/src/backtest_v2/portfolio.rs`'s
//! snapshot-then-value pipeline shape, simplified to a single formula
//! since there is no multi-asset portfolio here.

use serde::{Deserialize, Serialize};

/// A point-in-time balance snapshot, used transiently by the risk gates
/// (§3 PortfolioSnapshot).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub token0_balance: f64,
    pub token1_balance: f64,
    pub price_at_snapshot: f64,
    pub value_in_token1_units: f64,
}

/// `value = bal0 * price + bal1`, expressed in token1 units.
///
/// Rejects non-finite and non-positive prices by returning `0.0` rather than
/// an error: the risk gates that consume this are deliberately permissive
/// about bad oracle reads, per §4.6, to avoid a stale/garbage price
/// reading spuriously tripping a loss gate. This assumes a stablecoin pair
/// where token1 is the numeraire (§9 Q3); a non-stable pair needs an
/// external USD oracle instead, which this core does not provide.
pub fn portfolio_value(bal0: f64, bal1: f64, price: f64) -> f64 {
    if !price.is_finite() || price <= 0.0 {
        return 0.0;
    }
    bal0 * price + bal1
}

pub fn snapshot(bal0: f64, bal1: f64, price: f64) -> PortfolioSnapshot {
    PortfolioSnapshot {
        token0_balance: bal0,
        token1_balance: bal1,
        price_at_snapshot: price,
        value_in_token1_units: portfolio_value(bal0, bal1, price),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_balances_at_given_price() {
        assert_eq!(portfolio_value(10.0, 5.0, 2.0), 25.0);
    }

    #[test]
    fn rejects_non_positive_price() {
        assert_eq!(portfolio_value(10.0, 5.0, 0.0), 0.0);
        assert_eq!(portfolio_value(10.0, 5.0, -1.0), 0.0);
    }

    #[test]
    fn rejects_non_finite_price() {
        assert_eq!(portfolio_value(10.0, 5.0, f64::NAN), 0.0);
        assert_eq!(portfolio_value(10.0, 5.0, f64::INFINITY), 0.0);
    }

    #[test]
    fn snapshot_embeds_the_computed_value() {
        let snap = snapshot(1.0, 1.0, 3.0);
        assert_eq!(snap.value_in_token1_units, 4.0);
    }
}
