//! Band ledger (§3 Band/BandLedger, §4.2).
//!
//! The in-memory ordered set of seven concentrated-liquidity positions the
//! engine maintains for one pool. Grounded on `uniswap-v3-sdk-rs`'s
//! ordered-tick-list contract (sorted, contiguous, half-open membership),
//! with plain `Serialize`/`Deserialize`-derived data types throughout.

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// One concentrated-liquidity NFT position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    /// Position within the ordered ledger, recomputed on every mutation.
    pub index: usize,
    /// Decimal-string NFT id. Never parsed as a number for arithmetic —
    /// tokenIds can exceed the 53-bit float-safe range (§9).
    pub token_id: String,
    pub tick_lower: i32,
    pub tick_upper: i32,
}

impl Band {
    pub fn new(token_id: impl Into<String>, tick_lower: i32, tick_upper: i32) -> Result<Self, CoreError> {
        let token_id = token_id.into();
        if token_id.is_empty() || token_id == "0" {
            return Err(CoreError::ZeroTokenId);
        }
        if tick_lower >= tick_upper {
            return Err(CoreError::InvalidTickRange(tick_lower, tick_upper));
        }
        Ok(Self {
            index: 0,
            token_id,
            tick_lower,
            tick_upper,
        })
    }

    pub fn width(&self) -> i32 {
        self.tick_upper - self.tick_lower
    }

    /// Half-open membership test: `[tickLower, tickUpper)`.
    pub fn contains(&self, tick: i32) -> bool {
        tick >= self.tick_lower && tick < self.tick_upper
    }
}

/// Direction a trigger/rebalance resolves toward — the side of the band
/// array that is being dissolved/extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Price has drifted down into or below the lower trigger bands.
    Lower,
    /// Price has drifted up into or above the upper trigger bands.
    Upper,
}

/// Where a tick falls relative to the seven-band ledger, per §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Tick is inside the center three bands (index 2, 3, or 4).
    Safe,
    /// Tick is in a lower trigger/buffer band (index 0 or 1), or below all
    /// bands entirely.
    Lower,
    /// Tick is in an upper trigger/buffer band (index 5 or 6), or above all
    /// bands entirely.
    Upper,
    /// No bands exist, or (in principle) a tick that matches none of the
    /// above — the ledger is always full or empty in practice, so this is
    /// reserved for a not-yet-initialized ledger.
    NoAction,
}

/// Insertion point for [`BandLedger::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Start,
    End,
}

/// The ordered 7-band set plus the fixed `bandTickWidth` for this ledger's
/// lifetime (§3 BandLedger).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandLedger {
    bands: Vec<Band>,
    band_tick_width: i32,
}

impl BandLedger {
    pub fn empty() -> Self {
        Self {
            bands: Vec::new(),
            band_tick_width: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn band_tick_width(&self) -> i32 {
        self.band_tick_width
    }

    /// Sorts by `tickLower`, asserts contiguity and uniform width, and
    /// replaces the ledger's contents. `width` becomes fixed for the
    /// ledger's lifetime (§3).
    pub fn set_bands(&mut self, mut bands: Vec<Band>, width: i32) -> Result<(), CoreError> {
        if bands.len() != 7 {
            return Err(CoreError::WrongBandCount(bands.len()));
        }
        bands.sort_by_key(|b| b.tick_lower);

        let mut seen = std::collections::HashSet::new();
        for b in &bands {
            if !seen.insert(b.token_id.clone()) {
                return Err(CoreError::DuplicateTokenId(b.token_id.clone()));
            }
        }

        for (i, b) in bands.iter().enumerate() {
            if b.width() != width {
                return Err(CoreError::WrongBandWidth {
                    index: i,
                    width: b.width(),
                    expected: width,
                });
            }
        }
        for i in 0..bands.len() - 1 {
            if bands[i].tick_upper != bands[i + 1].tick_lower {
                return Err(CoreError::NonContiguousBands(i));
            }
        }

        for (i, b) in bands.iter_mut().enumerate() {
            b.index = i;
        }

        self.bands = bands;
        self.band_tick_width = width;
        Ok(())
    }

    /// Index of the band containing `tick` by the `[lower, upper)` rule, or
    /// `-1` if outside all bands (§4.2).
    pub fn band_index_for_tick(&self, tick: i32) -> i64 {
        for b in &self.bands {
            if b.contains(tick) {
                return b.index as i64;
            }
        }
        -1
    }

    /// Classifies `tick` against the ledger per §4.1's safe/trigger rule.
    pub fn classify(&self, tick: i32) -> Classification {
        if self.bands.is_empty() {
            return Classification::NoAction;
        }
        let idx = self.band_index_for_tick(tick);
        if idx >= 0 {
            return match idx {
                2 | 3 | 4 => Classification::Safe,
                0 | 1 => Classification::Lower,
                5 | 6 => Classification::Upper,
                _ => Classification::NoAction,
            };
        }
        // Not inside any band: below the lowest band's lower bound, or at/above
        // the highest band's upper bound. §9 Q4 notes this "below all
        // bands is a lower trigger" rule leaves the ledger fully out of range
        // with no re-centering logic; implemented literally as specified.
        if tick < self.bands.first().unwrap().tick_lower {
            Classification::Lower
        } else {
            Classification::Upper
        }
    }

    /// The band to dissolve for a rebalance in `dir`: the highest band for a
    /// `Lower` rebalance, the lowest for an `Upper` rebalance (§4.2).
    pub fn band_to_dissolve(&self, dir: Direction) -> Option<&Band> {
        match dir {
            Direction::Lower => self.bands.last(),
            Direction::Upper => self.bands.first(),
        }
    }

    /// The tick range for the new band a rebalance in `dir` mints (§4.2).
    pub fn new_band_ticks(&self, dir: Direction) -> Result<(i32, i32), CoreError> {
        if self.bands.is_empty() {
            return Err(CoreError::EmptyLedger);
        }
        let width = self.band_tick_width;
        match dir {
            Direction::Lower => {
                let lowest = self.bands.first().unwrap();
                Ok((lowest.tick_lower - width, lowest.tick_lower))
            }
            Direction::Upper => {
                let highest = self.bands.last().unwrap();
                Ok((highest.tick_upper, highest.tick_upper + width))
            }
        }
    }

    /// Removes the band with the given `tokenId`, reindexing the remainder.
    pub fn remove(&mut self, token_id: &str) -> Option<Band> {
        let pos = self.bands.iter().position(|b| b.token_id == token_id)?;
        let removed = self.bands.remove(pos);
        for (i, b) in self.bands.iter_mut().enumerate() {
            b.index = i;
        }
        Some(removed)
    }

    /// Inserts `band` at `position`, reindexing the whole ledger.
    pub fn add(&mut self, band: Band, position: Position) {
        match position {
            Position::Start => self.bands.insert(0, band),
            Position::End => self.bands.push(band),
        }
        for (i, b) in self.bands.iter_mut().enumerate() {
            b.index = i;
        }
    }

    /// Clears the ledger and resets `bandTickWidth` — used on emergency
    /// withdraw and on crash recovery (§4.4 `initialize`).
    pub fn clear(&mut self) {
        self.bands.clear();
        self.band_tick_width = 0;
    }

    /// Adopts an arbitrary, possibly non-7, possibly non-contiguous set of
    /// existing on-chain positions found during `initialize` (§4.4 step
    /// 4: "accept ≠ 7; the engine will not rebalance into 7 from a partial
    /// set until the next empty-ledger path"). Only tokenId uniqueness is
    /// enforced; `width` is recorded as-is (0 if `bands` is empty) and is not
    /// treated as authoritative until a subsequent `set_bands` call.
    pub fn adopt_partial(&mut self, mut bands: Vec<Band>, width: i32) -> Result<(), CoreError> {
        bands.sort_by_key(|b| b.tick_lower);
        let mut seen = std::collections::HashSet::new();
        for b in &bands {
            if !seen.insert(b.token_id.clone()) {
                return Err(CoreError::DuplicateTokenId(b.token_id.clone()));
            }
        }
        for (i, b) in bands.iter_mut().enumerate() {
            b.index = i;
        }
        self.bands = bands;
        self.band_tick_width = width;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_seven(width: i32) -> Vec<Band> {
        (0..7)
            .map(|i| {
                let lower = -147 + i as i32 * width;
                Band::new(format!("{}", 1000 + i), lower, lower + width).unwrap()
            })
            .collect()
    }

    #[test]
    fn set_bands_accepts_contiguous_equal_width() {
        let mut ledger = BandLedger::empty();
        ledger.set_bands(make_seven(42), 42).unwrap();
        assert_eq!(ledger.len(), 7);
        assert_eq!(ledger.band_tick_width(), 42);
        for (i, b) in ledger.bands().iter().enumerate() {
            assert_eq!(b.index, i);
        }
    }

    #[test]
    fn set_bands_rejects_wrong_count() {
        let mut ledger = BandLedger::empty();
        let bands = make_seven(42)[..6].to_vec();
        assert!(ledger.set_bands(bands, 42).is_err());
    }

    #[test]
    fn set_bands_rejects_non_contiguous() {
        let mut ledger = BandLedger::empty();
        let mut bands = make_seven(42);
        bands[3].tick_upper += 1; // break contiguity with band 4
        assert!(ledger.set_bands(bands, 42).is_err());
    }

    #[test]
    fn set_bands_rejects_duplicate_token_ids() {
        let mut ledger = BandLedger::empty();
        let mut bands = make_seven(42);
        bands[1].token_id = bands[0].token_id.clone();
        assert!(ledger.set_bands(bands, 42).is_err());
    }

    #[test]
    fn band_index_for_tick_is_unique_or_negative_one() {
        let mut ledger = BandLedger::empty();
        ledger.set_bands(make_seven(42), 42).unwrap();
        assert_eq!(ledger.band_index_for_tick(0), 3);
        assert_eq!(ledger.band_index_for_tick(-147), 0);
        assert_eq!(ledger.band_index_for_tick(-148), -1);
        assert_eq!(ledger.band_index_for_tick(147), -1); // == last upper bound
    }

    #[test]
    fn classify_center_three_is_safe() {
        let mut ledger = BandLedger::empty();
        ledger.set_bands(make_seven(42), 42).unwrap();
        for tick in [-63, 0, 62] {
            assert_eq!(ledger.classify(tick), Classification::Safe);
        }
    }

    #[test]
    fn classify_outer_two_each_side_are_triggers() {
        let mut ledger = BandLedger::empty();
        ledger.set_bands(make_seven(42), 42).unwrap();
        assert_eq!(ledger.classify(-147), Classification::Lower);
        assert_eq!(ledger.classify(-106), Classification::Lower);
        assert_eq!(ledger.classify(105), Classification::Upper);
        assert_eq!(ledger.classify(146), Classification::Upper);
    }

    #[test]
    fn classify_outside_all_bands() {
        let mut ledger = BandLedger::empty();
        ledger.set_bands(make_seven(42), 42).unwrap();
        assert_eq!(ledger.classify(-1000), Classification::Lower);
        assert_eq!(ledger.classify(1000), Classification::Upper);
    }

    #[test]
    fn band_to_dissolve_and_new_band_ticks() {
        let mut ledger = BandLedger::empty();
        ledger.set_bands(make_seven(42), 42).unwrap();
        assert_eq!(ledger.band_to_dissolve(Direction::Lower).unwrap().token_id, "1006");
        assert_eq!(ledger.band_to_dissolve(Direction::Upper).unwrap().token_id, "1000");
        assert_eq!(ledger.new_band_ticks(Direction::Lower).unwrap(), (-189, -147));
        assert_eq!(ledger.new_band_ticks(Direction::Upper).unwrap(), (147, 189));
    }

    #[test]
    fn remove_then_add_reindexes() {
        let mut ledger = BandLedger::empty();
        ledger.set_bands(make_seven(42), 42).unwrap();
        let removed = ledger.remove("1006").unwrap();
        assert_eq!(removed.token_id, "1006");
        assert_eq!(ledger.len(), 6);

        let (lo, hi) = ledger.new_band_ticks(Direction::Lower).unwrap();
        let new_band = Band::new("2000", lo, hi).unwrap();
        ledger.add(new_band, Position::Start);
        assert_eq!(ledger.len(), 7);
        assert_eq!(ledger.bands()[0].token_id, "2000");
        assert_eq!(ledger.bands()[0].index, 0);
        assert_eq!(ledger.bands()[6].index, 6);
    }

    #[test]
    fn token_ids_are_unique_across_ledger() {
        let mut ledger = BandLedger::empty();
        ledger.set_bands(make_seven(42), 42).unwrap();
        let ids: std::collections::HashSet<_> = ledger.bands().iter().map(|b| &b.token_id).collect();
        assert_eq!(ids.len(), 7);
    }
}
