//! In-memory fakes for the external collaborators, used by tests and by the
//! binary's "dry" demo mode (§11). Plain structs behind a
//! `tokio::Mutex`, with counters for request bookkeeping.
//!
//! Virtual tokenIds start at the reserved range `900_000_000` and strictly
//! increase, per §6.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use super::{
    BalanceReader, ChainResult, CollaboratorError, HistoryEvent, HistoryLog, MintParams,
    MintResult, NftPositionManager, Notifier, PoolStatusUpdate, PositionInfo, PriceSource,
    RemoveResult, RemoveTxHashes, SwapResult, SwapRouter,
};
use crate::gas::{GasInfo, GasOracle};
use crate::state::PriceTick;

/// First virtual tokenId minted by [`FakeNftPositionManager`] (§6).
pub const VIRTUAL_TOKEN_ID_BASE: u64 = 900_000_000;

#[derive(Debug, Clone)]
struct FakePosition {
    info: PositionInfo,
}

/// In-memory NFT position manager. Mints succeed deterministically unless
/// `fail_next_mint`/`fail_next_remove` is armed, letting tests exercise the
/// consecutive-error budget and crash-recovery paths.
pub struct FakeNftPositionManager {
    next_token_id: AtomicU64,
    positions: Mutex<HashMap<String, FakePosition>>,
    fail_next_mint: std::sync::atomic::AtomicBool,
    fail_next_remove: std::sync::atomic::AtomicBool,
}

impl Default for FakeNftPositionManager {
    fn default() -> Self {
        Self {
            next_token_id: AtomicU64::new(VIRTUAL_TOKEN_ID_BASE),
            positions: Mutex::new(HashMap::new()),
            fail_next_mint: std::sync::atomic::AtomicBool::new(false),
            fail_next_remove: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl FakeNftPositionManager {
    pub fn arm_mint_failure(&self) {
        self.fail_next_mint.store(true, Ordering::SeqCst);
    }

    pub fn arm_remove_failure(&self) {
        self.fail_next_remove.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NftPositionManager for FakeNftPositionManager {
    async fn mint(&self, params: MintParams) -> ChainResult<MintResult> {
        if self.fail_next_mint.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::revert("simulated mint revert"));
        }
        let token_id = self.next_token_id.fetch_add(1, Ordering::SeqCst).to_string();
        let liquidity = ((params.amount0_desired + params.amount1_desired) * 1e6) as u128 + 1;
        let info = PositionInfo {
            token_id: token_id.clone(),
            liquidity,
            tick_lower: params.tick_lower,
            tick_upper: params.tick_upper,
            tokens_owed0: 0.0,
            tokens_owed1: 0.0,
        };
        self.positions
            .lock()
            .await
            .insert(token_id.clone(), FakePosition { info });
        Ok(MintResult {
            token_id: token_id.clone(),
            liquidity,
            amount0: params.amount0_desired,
            amount1: params.amount1_desired,
            tx_hash: format!("0xmint{token_id}"),
        })
    }

    async fn remove_position(
        &self,
        token_id: &str,
        _liquidity: u128,
        _slippage_tolerance_percent: f64,
    ) -> Result<RemoveResult, (CollaboratorError, RemoveTxHashes)> {
        if self.fail_next_remove.swap(false, Ordering::SeqCst) {
            return Err((
                CollaboratorError::revert("simulated burn revert"),
                RemoveTxHashes {
                    decrease: Some(format!("0xdecrease{token_id}")),
                    collect: Some(format!("0xcollect{token_id}")),
                    burn: None,
                },
            ));
        }
        let mut positions = self.positions.lock().await;
        let removed = positions.remove(token_id).ok_or_else(|| {
            (
                CollaboratorError::revert("unknown position"),
                RemoveTxHashes::default(),
            )
        })?;
        let liquidity = removed.info.liquidity as f64 / 1e6;
        Ok(RemoveResult {
            amount0: liquidity / 2.0,
            amount1: liquidity / 2.0,
            fee0: 0.0,
            fee1: 0.0,
            tx_hashes: RemoveTxHashes {
                decrease: Some(format!("0xdecrease{token_id}")),
                collect: Some(format!("0xcollect{token_id}")),
                burn: Some(format!("0xburn{token_id}")),
            },
        })
    }

    async fn get_position(&self, token_id: &str) -> ChainResult<PositionInfo> {
        self.positions
            .lock()
            .await
            .get(token_id)
            .map(|p| p.info.clone())
            .ok_or_else(|| CollaboratorError::revert("unknown position"))
    }

    async fn find_positions_for(
        &self,
        _owner: &str,
        _token0: &str,
        _token1: &str,
        _fee_tier: u32,
    ) -> ChainResult<Vec<PositionInfo>> {
        Ok(self
            .positions
            .lock()
            .await
            .values()
            .map(|p| p.info.clone())
            .collect())
    }

    async fn approve(&self, _token0: &str, _token1: &str) -> ChainResult<()> {
        Ok(())
    }
}

/// In-memory swap router: always fills at 1:1 minus a notional spread, which
/// is all the engine's internal math needs to exercise the swap step.
#[derive(Default)]
pub struct FakeSwapRouter {
    fail_next_swap: std::sync::atomic::AtomicBool,
    counter: AtomicU64,
}

impl FakeSwapRouter {
    pub fn arm_swap_failure(&self) {
        self.fail_next_swap.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SwapRouter for FakeSwapRouter {
    async fn execute_swap(
        &self,
        _token_in: &str,
        _token_out: &str,
        _fee_tier: u32,
        amount_in: f64,
        _slippage_tolerance_percent: f64,
    ) -> ChainResult<SwapResult> {
        if self.fail_next_swap.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::revert("simulated swap revert"));
        }
        if amount_in <= 0.0 {
            return Err(CollaboratorError::revert("zero amount_in"));
        }
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(SwapResult {
            amount_out: amount_in * 0.997,
            tx_hash: format!("0xswap{id}"),
        })
    }

    async fn approve(&self, _token0: &str, _token1: &str) -> ChainResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FakeChainPosition {
    info: PositionInfo,
    amount0: f64,
    amount1: f64,
}

/// A single self-consistent simulated chain: one wallet, one NFT position
/// manager and one swap router sharing the same token balances, so an
/// end-to-end engine test can assert on wallet state after a rebalance
/// rather than only on individual collaborator calls. Standalone
/// `FakeNftPositionManager`/`FakeSwapRouter` above remain for tests that
/// only need to exercise one collaborator in isolation.
pub struct FakeChain {
    token0_address: String,
    token1_address: String,
    bal0: Mutex<f64>,
    bal1: Mutex<f64>,
    positions: Mutex<HashMap<String, FakeChainPosition>>,
    next_token_id: AtomicU64,
    fail_next_mint: std::sync::atomic::AtomicBool,
    fail_next_remove: std::sync::atomic::AtomicBool,
    fail_next_swap: std::sync::atomic::AtomicBool,
    swap_counter: AtomicU64,
}

impl FakeChain {
    pub fn new(token0_address: impl Into<String>, token1_address: impl Into<String>, bal0: f64, bal1: f64) -> Self {
        Self {
            token0_address: token0_address.into(),
            token1_address: token1_address.into(),
            bal0: Mutex::new(bal0),
            bal1: Mutex::new(bal1),
            positions: Mutex::new(HashMap::new()),
            next_token_id: AtomicU64::new(VIRTUAL_TOKEN_ID_BASE),
            fail_next_mint: std::sync::atomic::AtomicBool::new(false),
            fail_next_remove: std::sync::atomic::AtomicBool::new(false),
            fail_next_swap: std::sync::atomic::AtomicBool::new(false),
            swap_counter: AtomicU64::new(0),
        }
    }

    pub fn arm_mint_failure(&self) {
        self.fail_next_mint.store(true, Ordering::SeqCst);
    }
    pub fn arm_remove_failure(&self) {
        self.fail_next_remove.store(true, Ordering::SeqCst);
    }
    pub fn arm_swap_failure(&self) {
        self.fail_next_swap.store(true, Ordering::SeqCst);
    }

    pub async fn wallet(&self) -> (f64, f64) {
        (*self.bal0.lock().await, *self.bal1.lock().await)
    }

    pub async fn position_count(&self) -> usize {
        self.positions.lock().await.len()
    }
}

#[async_trait]
impl NftPositionManager for FakeChain {
    async fn mint(&self, params: MintParams) -> ChainResult<MintResult> {
        if self.fail_next_mint.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::revert("simulated mint revert"));
        }
        let mut bal0 = self.bal0.lock().await;
        let mut bal1 = self.bal1.lock().await;
        let amount0 = params.amount0_desired.min(*bal0);
        let amount1 = params.amount1_desired.min(*bal1);
        *bal0 -= amount0;
        *bal1 -= amount1;
        drop(bal0);
        drop(bal1);

        let token_id = self.next_token_id.fetch_add(1, Ordering::SeqCst).to_string();
        let liquidity = ((amount0 + amount1) * 1e6) as u128 + 1;
        let info = PositionInfo {
            token_id: token_id.clone(),
            liquidity,
            tick_lower: params.tick_lower,
            tick_upper: params.tick_upper,
            tokens_owed0: 0.0,
            tokens_owed1: 0.0,
        };
        self.positions.lock().await.insert(
            token_id.clone(),
            FakeChainPosition {
                info,
                amount0,
                amount1,
            },
        );
        Ok(MintResult {
            token_id: token_id.clone(),
            liquidity,
            amount0,
            amount1,
            tx_hash: format!("0xmint{token_id}"),
        })
    }

    async fn remove_position(
        &self,
        token_id: &str,
        _liquidity: u128,
        _slippage_tolerance_percent: f64,
    ) -> Result<RemoveResult, (CollaboratorError, RemoveTxHashes)> {
        if self.fail_next_remove.swap(false, Ordering::SeqCst) {
            return Err((
                CollaboratorError::revert("simulated burn revert"),
                RemoveTxHashes {
                    decrease: Some(format!("0xdecrease{token_id}")),
                    collect: Some(format!("0xcollect{token_id}")),
                    burn: None,
                },
            ));
        }
        let removed = self
            .positions
            .lock()
            .await
            .remove(token_id)
            .ok_or_else(|| (CollaboratorError::revert("unknown position"), RemoveTxHashes::default()))?;
        *self.bal0.lock().await += removed.amount0;
        *self.bal1.lock().await += removed.amount1;
        Ok(RemoveResult {
            amount0: removed.amount0,
            amount1: removed.amount1,
            fee0: 0.0,
            fee1: 0.0,
            tx_hashes: RemoveTxHashes {
                decrease: Some(format!("0xdecrease{token_id}")),
                collect: Some(format!("0xcollect{token_id}")),
                burn: Some(format!("0xburn{token_id}")),
            },
        })
    }

    async fn get_position(&self, token_id: &str) -> ChainResult<PositionInfo> {
        self.positions
            .lock()
            .await
            .get(token_id)
            .map(|p| p.info.clone())
            .ok_or_else(|| CollaboratorError::revert("unknown position"))
    }

    async fn find_positions_for(
        &self,
        _owner: &str,
        _token0: &str,
        _token1: &str,
        _fee_tier: u32,
    ) -> ChainResult<Vec<PositionInfo>> {
        Ok(self.positions.lock().await.values().map(|p| p.info.clone()).collect())
    }

    async fn approve(&self, _token0: &str, _token1: &str) -> ChainResult<()> {
        Ok(())
    }
}

#[async_trait]
impl SwapRouter for FakeChain {
    async fn execute_swap(
        &self,
        token_in: &str,
        _token_out: &str,
        _fee_tier: u32,
        amount_in: f64,
        _slippage_tolerance_percent: f64,
    ) -> ChainResult<SwapResult> {
        if self.fail_next_swap.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::revert("simulated swap revert"));
        }
        if amount_in <= 0.0 {
            return Err(CollaboratorError::revert("zero amount_in"));
        }
        let amount_out = amount_in * 0.997;
        if token_in == self.token0_address {
            let mut bal0 = self.bal0.lock().await;
            if amount_in > *bal0 {
                return Err(CollaboratorError::revert("insufficient token0 balance"));
            }
            *bal0 -= amount_in;
            *self.bal1.lock().await += amount_out;
        } else if token_in == self.token1_address {
            let mut bal1 = self.bal1.lock().await;
            if amount_in > *bal1 {
                return Err(CollaboratorError::revert("insufficient token1 balance"));
            }
            *bal1 -= amount_in;
            *self.bal0.lock().await += amount_out;
        } else {
            return Err(CollaboratorError::revert("unknown token_in address"));
        }
        let id = self.swap_counter.fetch_add(1, Ordering::SeqCst);
        Ok(SwapResult {
            amount_out,
            tx_hash: format!("0xswap{id}"),
        })
    }

    async fn approve(&self, _token0: &str, _token1: &str) -> ChainResult<()> {
        Ok(())
    }
}

#[async_trait]
impl BalanceReader for FakeChain {
    async fn balances(&self, _pool_id: &str) -> ChainResult<(f64, f64)> {
        Ok((*self.bal0.lock().await, *self.bal1.lock().await))
    }
}

/// In-memory gas oracle usable directly as a [`GasOracle`] without the EMA
/// machinery in `gas.rs`, for tests that want a fixed reading.
pub struct FixedGasOracle {
    pub info: GasInfo,
    pub spike: bool,
    pub eth_price_usd: f64,
}

#[async_trait]
impl GasOracle for FixedGasOracle {
    async fn get_gas_info(&self) -> anyhow::Result<GasInfo> {
        Ok(self.info)
    }
    async fn is_spike(&self, _x: f64) -> bool {
        self.spike
    }
    async fn eth_price_usd(&self) -> f64 {
        self.eth_price_usd
    }
}

/// Captures every event appended, for assertions in tests.
#[derive(Default)]
pub struct InMemoryHistoryLog {
    events: Mutex<Vec<HistoryEvent>>,
}

impl InMemoryHistoryLog {
    pub async fn events(&self) -> Vec<HistoryEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl HistoryLog for InMemoryHistoryLog {
    async fn append(&self, event: HistoryEvent) {
        self.events.lock().await.push(event);
    }
}

/// Captures every notification sent, for assertions in tests.
#[derive(Default)]
pub struct InMemoryNotifier {
    messages: Mutex<Vec<String>>,
}

impl InMemoryNotifier {
    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().await.push(message.to_string());
        info!(message, "notifier");
    }
}

/// Captures the latest status per pool, for assertions in tests.
#[derive(Default)]
pub struct InMemoryHealthSurface {
    statuses: Mutex<HashMap<String, PoolStatusUpdate>>,
}

impl InMemoryHealthSurface {
    pub async fn status_of(&self, pool_id: &str) -> Option<PoolStatusUpdate> {
        self.statuses.lock().await.get(pool_id).cloned()
    }
}

#[async_trait]
impl super::HealthSurface for InMemoryHealthSurface {
    async fn update_pool_status(&self, pool_id: &str, update: PoolStatusUpdate) {
        self.statuses.lock().await.insert(pool_id.to_string(), update);
    }
}

/// A price source whose ticks are pushed by the test/demo driver rather than
/// a live chain poller; the subscribe-time channel is still capacity-1
/// drop-oldest, matching the real collaborator's contract.
#[derive(Default)]
pub struct ManualPriceSource {
    tx_for_push: std::sync::Mutex<Option<mpsc::Sender<PriceTick>>>,
}

impl ManualPriceSource {
    /// Pushes a tick to the current subscriber, if any. Drops the tick
    /// silently if the channel is full or no one has subscribed yet.
    pub fn push(&self, tick: PriceTick) {
        if let Some(tx) = self.tx_for_push.lock().unwrap().as_ref() {
            let _ = tx.try_send(tick);
        }
    }
}

impl PriceSource for ManualPriceSource {
    fn subscribe(&self) -> mpsc::Receiver<PriceTick> {
        let (tx, rx) = mpsc::channel(1);
        *self.tx_for_push.lock().unwrap() = Some(tx);
        rx
    }
}

/// The binary's "dry" demo price source (no live chain connection, §1):
/// oscillates around `center_tick` on a sine wave so a demo run exercises
/// both safe-zone and trigger-band ticks without any external dependency.
pub struct DemoOscillatorPriceSource {
    center_tick: i32,
    amplitude_ticks: i32,
    poll_interval: std::time::Duration,
}

impl DemoOscillatorPriceSource {
    pub fn new(center_tick: i32, amplitude_ticks: i32, poll_interval: std::time::Duration) -> Self {
        Self {
            center_tick,
            amplitude_ticks,
            poll_interval,
        }
    }
}

impl PriceSource for DemoOscillatorPriceSource {
    fn subscribe(&self) -> mpsc::Receiver<PriceTick> {
        let (tx, rx) = mpsc::channel(1);
        let center_tick = self.center_tick;
        let amplitude_ticks = self.amplitude_ticks;
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            let mut step: u64 = 0;
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }
                let phase = step as f64 * 0.1;
                let tick = center_tick + (amplitude_ticks as f64 * phase.sin()).round() as i32;
                let price_tick = PriceTick {
                    tick,
                    sqrt_price: alloy_primitives::U256::ZERO,
                    liquidity: 0,
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                };
                let _ = tx.try_send(price_tick);
                step = step.wrapping_add(1);
            }
        });
        rx
    }
}
