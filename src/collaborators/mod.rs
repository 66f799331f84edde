//! External collaborator contracts (§6). These are deliberately thin: the
//! configuration loader, pool-price polling loop, RPC/contract driver,
//! swap-router/NFT-position-manager wrappers, notification sinks, the
//! health-status surface, the history log, and persisted-state file I/O
//! are all named as required-but-out-of-scope. `persistence.rs` supplies the one
//! contract the engine's recovery logic is tight enough to need a real
//! implementation of; the rest are trait contracts here plus in-memory
//! fakes under `fakes.rs` so the engine can be exercised end-to-end without
//! a live chain (§1, §11).

pub mod fakes;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::ChainErrorKind;
use crate::state::PriceTick;

/// A typed collaborator failure: the classification from §7 plus a
/// human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CollaboratorError {
    pub kind: ChainErrorKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ChainErrorKind::Transient,
            message: message.into(),
        }
    }
    pub fn revert(message: impl Into<String>) -> Self {
        Self {
            kind: ChainErrorKind::Revert,
            message: message.into(),
        }
    }
    pub fn event_missing(message: impl Into<String>) -> Self {
        Self {
            kind: ChainErrorKind::EventMissing,
            message: message.into(),
        }
    }
}

pub type ChainResult<T> = Result<T, CollaboratorError>;

// ─── NFT Position Manager ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintParams {
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub amount0_desired: f64,
    pub amount1_desired: f64,
    pub slippage_tolerance_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintResult {
    pub token_id: String,
    pub liquidity: u128,
    pub amount0: f64,
    pub amount1: f64,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoveTxHashes {
    pub decrease: Option<String>,
    pub collect: Option<String>,
    pub burn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveResult {
    pub amount0: f64,
    pub amount1: f64,
    pub fee0: f64,
    pub fee1: f64,
    pub tx_hashes: RemoveTxHashes,
}

impl RemoveResult {
    pub fn tx_hashes_as_vec(&self) -> Vec<String> {
        self.tx_hashes.clone().into_vec()
    }
}

impl RemoveTxHashes {
    /// Flattens the three optional hashes into the order they were issued,
    /// dropping any that never happened (a partial-failure remove).
    pub fn into_vec(self) -> Vec<String> {
        [self.decrease, self.collect, self.burn].into_iter().flatten().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub token_id: String,
    pub liquidity: u128,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub tokens_owed0: f64,
    pub tokens_owed1: f64,
}

/// NFT position manager contract (§6). `remove_position` performs
/// three chained transactions (decrease, collect, burn); partial success
/// surfaces as an `Err` with `tx_hashes` populated up to the last success so
/// the caller can still checkpoint what actually happened on-chain.
#[async_trait]
pub trait NftPositionManager: Send + Sync {
    async fn mint(&self, params: MintParams) -> ChainResult<MintResult>;
    async fn remove_position(
        &self,
        token_id: &str,
        liquidity: u128,
        slippage_tolerance_percent: f64,
    ) -> Result<RemoveResult, (CollaboratorError, RemoveTxHashes)>;
    async fn get_position(&self, token_id: &str) -> ChainResult<PositionInfo>;
    async fn find_positions_for(
        &self,
        owner: &str,
        token0: &str,
        token1: &str,
        fee_tier: u32,
    ) -> ChainResult<Vec<PositionInfo>>;
    async fn approve(&self, token0: &str, token1: &str) -> ChainResult<()>;
}

// ─── Balance reader ──────────────────────────────────────────────────────────

/// Reads the engine's wallet balances of the pool's two tokens. Not named as
/// a distinct collaborator in §6, but implied by §4.4's "read balances
/// of both tokens" and §4.4's "read fresh balances" — folded into the
/// on-chain RPC/contract driver already placed out of scope (§1).
#[async_trait]
pub trait BalanceReader: Send + Sync {
    async fn balances(&self, pool_id: &str) -> ChainResult<(f64, f64)>;
}

// ─── Swap Router ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapResult {
    pub amount_out: f64,
    pub tx_hash: String,
}

/// Swap router contract (§6). Reverts if `amount_out` would be zero or
/// below the slippage-adjusted minimum.
#[async_trait]
pub trait SwapRouter: Send + Sync {
    async fn execute_swap(
        &self,
        token_in: &str,
        token_out: &str,
        fee_tier: u32,
        amount_in: f64,
        slippage_tolerance_percent: f64,
    ) -> ChainResult<SwapResult>;
    async fn approve(&self, token0: &str, token1: &str) -> ChainResult<()>;
}

// ─── History log ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HistoryEventKind {
    Mint,
    Rebalance,
    EmergencyStop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub pool_id: String,
    pub kind: HistoryEventKind,
    pub timestamp_ms: i64,
    pub detail: String,
    pub tx_hashes: Vec<String>,
}

/// Append-only history log (§6). Loss of entries is tolerated.
#[async_trait]
pub trait HistoryLog: Send + Sync {
    async fn append(&self, event: HistoryEvent);
}

// ─── Notifier ────────────────────────────────────────────────────────────────

/// Best-effort notification sink (§6); errors are swallowed by callers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

// ─── Health surface ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatusUpdate {
    pub state: Option<String>,
    pub band_count: Option<usize>,
    pub last_rebalance_time_ms: Option<i64>,
    pub consecutive_errors: Option<u32>,
    pub last_error: Option<String>,
    pub portfolio_value_usd: Option<f64>,
}

/// Process-wide observability sink, written by engines but never read back
/// by them (§6, §9 "no global mutable state in the core").
#[async_trait]
pub trait HealthSurface: Send + Sync {
    async fn update_pool_status(&self, pool_id: &str, update: PoolStatusUpdate);
}

// ─── Price source ────────────────────────────────────────────────────────────

/// Pull-based timer publishing ticks to a bounded, drop-oldest channel (
/// §9 "Event-driven polling loop"): a dropped tick is not a correctness
/// problem because the next tick reflects the latest state.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Spawns the polling loop and returns the receiving end of a
    /// capacity-1 channel.
    fn subscribe(&self) -> mpsc::Receiver<PriceTick>;
}
