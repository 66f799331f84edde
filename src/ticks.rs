//! Tick / range math (§4.1).
//!
//! Pure functions over integers and doubles: tick <-> price conversion,
//! tick-spacing alignment, and the seven-band layout computation. Ported in
//! spirit from `uniswap-v3-sdk-rs::utils::{tick_math, nearest_usable_tick}`,
//! using `f64` rather than the SDK's `U256`/`I24` Q64.96 machinery because
//! the core only ever needs tick <-> price for band geometry, never an
//! on-chain-exact sqrt ratio.

use crate::errors::CoreError;

/// Smallest tick usable by the AMM. Mirrors `uniswap-v3-sdk-rs`'s `MIN_TICK`.
pub const MIN_TICK: i32 = -887_272;
/// Largest tick usable by the AMM. Mirrors `uniswap-v3-sdk-rs`'s `MAX_TICK`.
pub const MAX_TICK: i32 = 887_272;

/// `1.0001^tick`. Ticks outside `[MIN_TICK, MAX_TICK]` still compute a value;
/// callers that need the AMM's hard bounds call [`price_to_tick`] or validate
/// separately, matching `tickToPrice`'s definition in §4.1 (no bounds
/// check there).
pub fn tick_to_price(tick: i32) -> f64 {
    1.0001f64.powi(tick)
}

/// Inverse of [`tick_to_price`].
pub fn price_to_tick(price: f64) -> i32 {
    (price.ln() / 1.0001f64.ln()).round() as i32
}

/// Tick spacing for a Uniswap-V3-style fee tier, in hundredths of a basis
/// point (100 = 0.01%, 500 = 0.05%, 3000 = 0.3%, 10000 = 1%).
pub fn fee_to_tick_spacing(fee: u32) -> Result<i32, CoreError> {
    match fee {
        100 => Ok(1),
        500 => Ok(10),
        3000 => Ok(60),
        10000 => Ok(200),
        other => Err(CoreError::InvalidTickSpacing(other as i32)),
    }
}

/// Rounds `tick` to the nearest multiple of `spacing`, half-away-from-zero,
/// matching the AMM's `nearestUsableTick` convention (see
/// `uniswap-v3-sdk-rs::utils::nearest_usable_tick`).
pub fn align_tick(tick: i32, spacing: i32) -> Result<i32, CoreError> {
    if spacing <= 0 {
        return Err(CoreError::InvalidTickSpacing(spacing));
    }
    // Floor division + a nonnegative remainder, then round the quotient up
    // whenever the remainder reaches half the spacing. This is the exact
    // `nearestUsableTick` rule (see `uniswap-v3-sdk-rs::utils::nearest_usable_tick`),
    // which despite its "half-away-from-zero" name rounds ties toward positive
    // infinity: `nearest_usable_tick(-5, 10) == 0`, not `-10`.
    let quotient = tick.div_euclid(spacing);
    let remainder = tick.rem_euclid(spacing);
    let half = spacing / 2;
    let rounded = if remainder >= half && half > 0 {
        (quotient + 1) * spacing
    } else {
        quotient * spacing
    };
    Ok(rounded.clamp(MIN_TICK, MAX_TICK))
}

/// Result of [`compute_band_layout`]: seven half-open `[tickLower, tickUpper)`
/// ranges in ascending order plus the common `bandTickWidth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandLayout {
    pub ticks: [(i32, i32); 7],
    pub band_tick_width: i32,
}

/// Computes the seven contiguous band boundaries around `center_tick` for a
/// total range width of `width_percent` (e.g. `3.0` for 3%), per §4.1
/// steps 1-5.
pub fn compute_band_layout(
    center_tick: i32,
    width_percent: f64,
    fee: u32,
) -> Result<BandLayout, CoreError> {
    let spacing = fee_to_tick_spacing(fee)?;

    // Step 1: half-width in ticks.
    let tick_offset = ((1.0 + width_percent / 200.0).ln() / 1.0001f64.ln()).floor() as i32;

    // Step 2-3: raw band width, snapped down to a spacing multiple, never zero.
    let raw_band_width = (2 * tick_offset) / 7;
    let band_tick_width = ((raw_band_width / spacing) * spacing).max(spacing);

    // Step 4: align the center, place band 3 (index 3, zero-based) symmetrically.
    let center = align_tick(center_tick, spacing)?;
    let half = band_tick_width / 2;
    let center_lower = align_tick(center - half, spacing)?;
    let center_upper = center_lower + band_tick_width;

    let mut ticks = [(0i32, 0i32); 7];
    ticks[3] = (center_lower, center_upper);
    for i in (0..3).rev() {
        let upper = ticks[i + 1].0;
        ticks[i] = (upper - band_tick_width, upper);
    }
    for i in 4..7 {
        let lower = ticks[i - 1].1;
        ticks[i] = (lower, lower + band_tick_width);
    }

    // Step 5: clamp to global bounds; fail if clamping collapses a band.
    for (i, (lower, upper)) in ticks.iter_mut().enumerate() {
        *lower = (*lower).clamp(MIN_TICK, MAX_TICK);
        *upper = (*upper).clamp(MIN_TICK, MAX_TICK);
        if *lower >= *upper {
            return Err(CoreError::LayoutCollapsed {
                lower: *lower,
                upper: *upper,
            });
        }
        let _ = i;
    }

    Ok(BandLayout {
        ticks,
        band_tick_width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_price_roundtrip() {
        for t in [-887272, -10000, -1, 0, 1, 10000, 887272] {
            let p = tick_to_price(t);
            assert_eq!(price_to_tick(p), t, "roundtrip failed for tick {t}");
        }
    }

    #[test]
    fn fee_tiers_map_to_spacing() {
        assert_eq!(fee_to_tick_spacing(100).unwrap(), 1);
        assert_eq!(fee_to_tick_spacing(500).unwrap(), 10);
        assert_eq!(fee_to_tick_spacing(3000).unwrap(), 60);
        assert_eq!(fee_to_tick_spacing(10000).unwrap(), 200);
        assert!(fee_to_tick_spacing(42).is_err());
    }

    #[test]
    fn align_tick_rounds_half_away_from_zero() {
        assert_eq!(align_tick(5, 10).unwrap(), 10);
        assert_eq!(align_tick(4, 10).unwrap(), 0);
        assert_eq!(align_tick(-5, 10).unwrap(), 0);
        assert_eq!(align_tick(-6, 10).unwrap(), -10);
    }

    #[test]
    fn align_tick_clamps_to_bounds() {
        assert_eq!(align_tick(MAX_TICK, 7).unwrap(), MAX_TICK);
        assert_eq!(align_tick(MIN_TICK, 7).unwrap(), MIN_TICK);
    }

    #[test]
    fn align_tick_rejects_nonpositive_spacing() {
        assert!(align_tick(1, 0).is_err());
        assert!(align_tick(1, -1).is_err());
    }

    /// Scenario 1 from §8: tick=0, width=3%, fee=100 (spacing=1).
    #[test]
    fn scenario_initial_layout_tick0_width3pct_fee100() {
        let layout = compute_band_layout(0, 3.0, 100).unwrap();
        assert_eq!(layout.band_tick_width, 42);
        let lowers: Vec<i32> = layout.ticks.iter().map(|(l, _)| *l).collect();
        assert_eq!(lowers, vec![-147, -105, -63, -21, 21, 63, 105]);
        for i in 0..6 {
            assert_eq!(layout.ticks[i].1, layout.ticks[i + 1].0, "band {i} not contiguous");
        }
        for (lower, upper) in layout.ticks {
            assert_eq!(upper - lower, layout.band_tick_width);
        }
    }

    #[test]
    fn layout_is_symmetric_around_aligned_center_modulo_clamping() {
        let layout = compute_band_layout(1000, 3.0, 500).unwrap();
        let center = (layout.ticks[3].0 + layout.ticks[3].1) as f64 / 2.0;
        let span_lo = layout.ticks[0].0 as f64;
        let span_hi = layout.ticks[6].1 as f64;
        assert!((center - span_lo - (span_hi - center)).abs() < layout.band_tick_width as f64);
    }

    #[test]
    fn layout_fails_when_clamped_to_a_point() {
        let result = compute_band_layout(MAX_TICK, 3.0, 10000);
        assert!(result.is_err());
    }
}
