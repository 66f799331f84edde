//! Typed errors for the parts of the core that can diagnose their own
//! failures. Collaborator-boundary failures (chain calls, persistence I/O,
//! notification) are classified into [`ChainErrorKind`] and otherwise
//! propagated as `anyhow::Error` — see `SPEC_FULL.md` §10.3.

use thiserror::Error;

/// Errors the core itself can raise without consulting a collaborator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("tick {0} is outside [MIN_TICK, MAX_TICK]")]
    TickOutOfBounds(i32),

    #[error("tick spacing must be positive, got {0}")]
    InvalidTickSpacing(i32),

    #[error("band layout collapsed: lower {lower} >= upper {upper} after clamping")]
    LayoutCollapsed { lower: i32, upper: i32 },

    #[error("expected exactly 7 bands, got {0}")]
    WrongBandCount(usize),

    #[error("bands are not contiguous at index {0}")]
    NonContiguousBands(usize),

    #[error("band {index} has width {width}, expected {expected}")]
    WrongBandWidth {
        index: usize,
        width: i32,
        expected: i32,
    },

    #[error("bands are not sorted ascending by tickLower")]
    UnsortedBands,

    #[error("duplicate tokenId {0} in ledger")]
    DuplicateTokenId(String),

    #[error("tokenId must be non-zero")]
    ZeroTokenId,

    #[error("tickLower ({0}) must be < tickUpper ({1})")]
    InvalidTickRange(i32, i32),

    #[error("ledger is empty")]
    EmptyLedger,

    #[error("unknown pool id {0}")]
    UnknownPool(String),
}

/// Classification of a failed collaborator call, per §7.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorKind {
    /// RPC failure, timeout, nonce mismatch; the adapter already exhausted
    /// its retry budget before surfacing this.
    #[error("transient chain error")]
    Transient,
    /// On-chain revert: slippage, insufficient balance, band collision.
    #[error("reverted")]
    Revert,
    /// Transaction succeeded but the expected log was absent; treated as a
    /// revert because the caller cannot know the actual outcome.
    #[error("expected event missing")]
    EventMissing,
}
