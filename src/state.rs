//! Core data model shared by the engine and the persistence contract
//! (§3): `EngineState`, `RebalanceCheckpoint`, `PersistedPoolState`,
//! and `PriceTick`.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::band::Band;

/// The state-machine driver's current phase (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Monitoring,
    Evaluating,
    Withdrawing,
    Swapping,
    Minting,
    Error,
    Stopped,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Error | EngineState::Stopped)
    }
}

impl Default for EngineState {
    fn default() -> Self {
        EngineState::Idle
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "IDLE",
            EngineState::Monitoring => "MONITORING",
            EngineState::Evaluating => "EVALUATING",
            EngineState::Withdrawing => "WITHDRAWING",
            EngineState::Swapping => "SWAPPING",
            EngineState::Minting => "MINTING",
            EngineState::Error => "ERROR",
            EngineState::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

/// Which write a mid-flight rebalance last durably completed, so a crash can
/// be recovered unambiguously (§3 RebalanceCheckpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStage {
    Withdrawn,
    Swapped,
}

impl std::fmt::Display for CheckpointStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointStage::Withdrawn => "WITHDRAWN",
            CheckpointStage::Swapped => "SWAPPED",
        };
        write!(f, "{s}")
    }
}

/// Durable marker present iff a rebalance is mid-flight across a crash
/// boundary (§3 RebalanceCheckpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceCheckpoint {
    pub stage: CheckpointStage,
    pub pending_tx_hashes: Vec<String>,
}

/// A price/liquidity update delivered by the external pool monitor
/// (§3 PriceTick). Only `tick` and `timestamp_ms` are consumed by the
/// core; `sqrt_price` and `liquidity` are carried through for observability.
/// `sqrt_price` is a `U256` rather than a machine int (§9 "big-integer
/// arithmetic"): a Q64.96 sqrtPriceX96 needs up to 160 bits, which a `u128`
/// cannot hold without truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub tick: i32,
    pub sqrt_price: U256,
    pub liquidity: u128,
    pub timestamp_ms: i64,
}

/// What the persistence contract stores for one pool (§3
/// PersistedPoolState). Invariant: `rebalance_stage.is_some()` implies
/// `bands` reflects the ledger *after* that stage's write — WITHDRAWN means
/// the dissolved band is already gone from `bands`, SWAPPED means `bands`
/// is unchanged since WITHDRAWN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedPoolState {
    pub bands: Vec<Band>,
    pub band_tick_width: i32,
    pub last_rebalance_time_ms: i64,
    pub last_nonce: Option<u64>,
    pub rebalance_stage: Option<CheckpointStage>,
    pub pending_tx_hashes: Vec<String>,
    pub initial_value_usd: Option<f64>,
}

/// Top-level persisted document: multiple engines' state in one file, keyed
/// by pool id (§5, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub version: u32,
    pub started_at: String,
    pub pools: std::collections::HashMap<String, PersistedPoolState>,
}
