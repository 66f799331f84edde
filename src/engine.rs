//! State-machine driver (§4.4): the per-pool rebalance engine.
//!
//! Follows a single-struct driver shape (a lock-guarded mutable core plus
//! injected collaborators) dispatched through §4.4's transition table
//! rather than a polymorphic state hierarchy. The rebalance lock is a
//! `tokio::Mutex<()>`
//! whose guard is held for a whole entry point's duration (§9
//! "Resource scoping": scoped acquisition, guaranteed release on every exit
//! path) combined with `try_lock` for `on_price_tick`'s non-reentrancy rule
//! (§5: "concurrent onPriceTick invocations while the lock is held are
//! dropped silently").

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::band::{Band, BandLedger, Classification, Direction, Position};
use crate::collaborators::{
    BalanceReader, HealthSurface, HistoryEvent, HistoryEventKind, HistoryLog, MintParams,
    NftPositionManager, Notifier, PoolStatusUpdate, SwapRouter,
};
use crate::config::PoolConfig;
use crate::gas::GasOracle;
use crate::persistence::{Persistence, PoolStateUpdate};
use crate::risk::{self, ConsecutiveErrorBudget, DepegVerdict, GasVerdict, RangeState};
use crate::state::{CheckpointStage, EngineState, PriceTick};
use crate::swap_planner::{self, Token};
use crate::ticks;
use crate::valuation;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The external collaborators one engine needs, bundled so `RebalanceEngine`
/// doesn't grow an eight-argument constructor.
pub struct Collaborators {
    pub nft_manager: Arc<dyn NftPositionManager>,
    pub swap_router: Arc<dyn SwapRouter>,
    pub balances: Arc<dyn BalanceReader>,
    pub gas_oracle: Arc<dyn GasOracle>,
    pub persistence: Arc<dyn Persistence>,
    pub history: Arc<dyn HistoryLog>,
    pub notifier: Arc<dyn Notifier>,
    pub health: Arc<dyn HealthSurface>,
}

#[derive(Default)]
struct EngineInner {
    state: EngineState,
    ledger: BandLedger,
    consecutive_errors: ConsecutiveErrorBudget,
    last_rebalance_time_ms: i64,
    initial_value_usd: Option<f64>,
    last_portfolio_value_usd: Option<f64>,
}

/// One pool's rebalance engine (§3 "ownership": exclusively owns the
/// BandLedger, EngineState, and rebalance lock).
pub struct RebalanceEngine {
    pool_id: String,
    config: PoolConfig,
    owner_address: String,
    nft_manager: Arc<dyn NftPositionManager>,
    swap_router: Arc<dyn SwapRouter>,
    balances: Arc<dyn BalanceReader>,
    gas_oracle: Arc<dyn GasOracle>,
    persistence: Arc<dyn Persistence>,
    history: Arc<dyn HistoryLog>,
    notifier: Arc<dyn Notifier>,
    health: Arc<dyn HealthSurface>,
    rebalance_lock: Mutex<()>,
    inner: RwLock<EngineInner>,
}

impl RebalanceEngine {
    pub fn new(
        pool_id: impl Into<String>,
        config: PoolConfig,
        owner_address: impl Into<String>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            config,
            owner_address: owner_address.into(),
            nft_manager: collaborators.nft_manager,
            swap_router: collaborators.swap_router,
            balances: collaborators.balances,
            gas_oracle: collaborators.gas_oracle,
            persistence: collaborators.persistence,
            history: collaborators.history,
            notifier: collaborators.notifier,
            health: collaborators.health,
            rebalance_lock: Mutex::new(()),
            inner: RwLock::new(EngineInner::default()),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub async fn state(&self) -> EngineState {
        self.inner.read().await.state
    }

    pub async fn ledger_snapshot(&self) -> BandLedger {
        self.inner.read().await.ledger.clone()
    }

    pub async fn consecutive_error_count(&self) -> u32 {
        self.inner.read().await.consecutive_errors.count()
    }

    // ─── initialize ──────────────────────────────────────────────────────

    /// Idempotent startup sequence (§4.4 `initialize`). Acquires the
    /// rebalance lock for its whole duration.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let _guard = self.rebalance_lock.lock().await;

        let persisted = self.persistence.get_pool_state(&self.pool_id).await?;

        if let Some(p) = &persisted {
            if !p.bands.is_empty() {
                let mut inner = self.inner.write().await;
                // `adopt_partial` rather than `set_bands`: a persisted ledger
                // caught mid-rebalance can legitimately hold 6 bands (after a
                // WITHDRAWN checkpoint, before the replacement is minted), so
                // the 7-band invariant can't be enforced here.
                inner
                    .ledger
                    .adopt_partial(p.bands.clone(), p.band_tick_width)
                    .map_err(|e| anyhow::anyhow!("persisted bands failed to restore: {e}"))?;
                inner.last_rebalance_time_ms = p.last_rebalance_time_ms;
                inner.initial_value_usd = p.initial_value_usd;
            }
            for hash in &p.pending_tx_hashes {
                // The receipt-query step (§4.4 step 2) belongs to the
                // out-of-scope RPC/contract driver (§1); the core only
                // surfaces that a hash was carried over from a prior run.
                info!(pool_id = %self.pool_id, tx_hash = %hash, "pending tx hash from prior run");
            }
        }

        match persisted.as_ref().and_then(|p| p.rebalance_stage) {
            Some(stage) => {
                {
                    let mut inner = self.inner.write().await;
                    inner.ledger.clear();
                }
                self.persistence
                    .update_pool_state(
                        &self.pool_id,
                        PoolStateUpdate {
                            bands: Some(Vec::new()),
                            band_tick_width: Some(0),
                            clear_rebalance_stage: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.persistence.save().await;
                let msg = format!("RECOVERY: {} recovering from stage={stage}", self.pool_id);
                warn!(pool_id = %self.pool_id, %stage, "recovering from crash mid-rebalance");
                self.notifier.notify(&msg).await;
            }
            None if persisted.is_none() => {
                self.adopt_existing_positions().await?;
            }
            None => {}
        }

        self.nft_manager
            .approve(&self.config.token0_address, &self.config.token1_address)
            .await
            .map_err(|e| anyhow::anyhow!("nft manager approval failed: {e}"))?;
        self.swap_router
            .approve(&self.config.token0_address, &self.config.token1_address)
            .await
            .map_err(|e| anyhow::anyhow!("swap router approval failed: {e}"))?;

        {
            let mut inner = self.inner.write().await;
            inner.state = EngineState::Monitoring;
        }
        self.push_health_status().await;
        Ok(())
    }

    /// §4.4 step 4: no persisted state at all — ask the NFT manager for
    /// positions the wallet already owns in this pool and adopt them as a
    /// (possibly partial, possibly non-contiguous) ledger.
    async fn adopt_existing_positions(&self) -> anyhow::Result<()> {
        let positions = self
            .nft_manager
            .find_positions_for(
                &self.owner_address,
                &self.config.token0_address,
                &self.config.token1_address,
                self.config.fee_tier,
            )
            .await
            .map_err(|e| anyhow::anyhow!("find_positions_for failed: {e}"))?;
        let nonzero: Vec<_> = positions.into_iter().filter(|p| p.liquidity > 0).collect();
        if nonzero.is_empty() {
            return Ok(());
        }
        let width = nonzero[0].tick_upper - nonzero[0].tick_lower;
        let bands = nonzero
            .iter()
            .map(|p| Band::new(p.token_id.clone(), p.tick_lower, p.tick_upper))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("adopted position failed validation: {e}"))?;
        let count = bands.len();
        let mut inner = self.inner.write().await;
        inner
            .ledger
            .adopt_partial(bands, width)
            .map_err(|e| anyhow::anyhow!("failed to adopt existing positions: {e}"))?;
        drop(inner);
        info!(pool_id = %self.pool_id, count, "adopted existing on-chain positions");
        Ok(())
    }

    // ─── onPriceTick ─────────────────────────────────────────────────────

    /// The main event (§4.4 `onPriceTick`). Non-reentrant: a tick
    /// delivered while a previous one is still being handled is dropped.
    pub async fn on_price_tick(&self, tick: PriceTick) {
        let _guard = match self.rebalance_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(pool_id = %self.pool_id, "tick dropped: rebalance lock held");
                return;
            }
        };

        let state = { self.inner.read().await.state };
        if !matches!(state, EngineState::Idle | EngineState::Monitoring) {
            return;
        }

        if let DepegVerdict::Depegged {
            current_price,
            deviation_pct,
        } = risk::check_depeg(tick.tick, self.config.expected_price_ratio, self.config.depeg_threshold_percent)
        {
            let msg = format!(
                "ALERT: DEPEG {} price={current_price:.6} deviation={deviation_pct:.2}%",
                self.pool_id
            );
            error!(pool_id = %self.pool_id, current_price, deviation_pct, "depeg detected");
            self.notifier.notify(&msg).await;
            self.emergency_withdraw_inner().await;
            return;
        }

        let ledger_empty = { self.inner.read().await.ledger.is_empty() };
        if ledger_empty {
            self.mint_initial_bands(tick.tick).await;
            return;
        }

        let classification = { self.inner.read().await.ledger.classify(tick.tick) };
        match classification {
            Classification::Safe | Classification::NoAction => {}
            Classification::Lower => self.execute_band_rebalance(tick, Direction::Lower).await,
            Classification::Upper => self.execute_band_rebalance(tick, Direction::Upper).await,
        }
    }

    // ─── mintInitialBands ────────────────────────────────────────────────

    /// §4.4 `mintInitialBands`. Called only from `on_price_tick`, which
    /// already holds the rebalance lock.
    async fn mint_initial_bands(&self, tick: i32) {
        let layout = match ticks::compute_band_layout(tick, self.config.range_width_percent, self.config.fee_tier) {
            Ok(l) => l,
            Err(e) => {
                self.record_failure(&format!("band layout computation failed: {e}")).await;
                return;
            }
        };

        let (bal0, bal1) = match self.balances.balances(&self.pool_id).await {
            Ok(b) => b,
            Err(e) => {
                self.record_failure(&format!("failed to read balances: {e}")).await;
                return;
            }
        };

        let mut minted_bands = Vec::with_capacity(7);
        let mut tx_hashes = Vec::with_capacity(7);
        for (i, (lower, upper)) in layout.ticks.iter().enumerate() {
            // §4.4: "offer a descending share balance/(7-i)". Taken
            // literally against the *original* total balance, not a running
            // remainder — §9 flags this as possibly unintended; see
            // DESIGN.md's Open Question decision.
            let share_divisor = (7 - i) as f64;
            let params = MintParams {
                tick_lower: *lower,
                tick_upper: *upper,
                amount0_desired: bal0 / share_divisor,
                amount1_desired: bal1 / share_divisor,
                slippage_tolerance_percent: self.config.slippage_tolerance_percent,
            };
            match self.nft_manager.mint(params).await {
                Ok(result) => {
                    tx_hashes.push(result.tx_hash.clone());
                    match Band::new(result.token_id, *lower, *upper) {
                        Ok(band) => minted_bands.push(band),
                        Err(e) => {
                            self.record_failure(&format!("minted band {i} failed validation: {e}")).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.record_failure(&format!("mint failed for band {i}: {e}")).await;
                    return;
                }
            }
        }

        let initial_value = valuation::portfolio_value(bal0, bal1, ticks::tick_to_price(tick));
        {
            let mut inner = self.inner.write().await;
            if let Err(e) = inner.ledger.set_bands(minted_bands, layout.band_tick_width) {
                drop(inner);
                self.record_failure(&format!("minted bands failed ledger invariants: {e}")).await;
                return;
            }
            inner.initial_value_usd = Some(initial_value);
            inner.last_portfolio_value_usd = Some(initial_value);
            inner.consecutive_errors.record_success();
        }

        let bands = { self.inner.read().await.ledger.bands().to_vec() };
        let _ = self
            .persistence
            .update_pool_state(
                &self.pool_id,
                PoolStateUpdate {
                    bands: Some(bands),
                    band_tick_width: Some(layout.band_tick_width),
                    initial_value_usd: Some(initial_value),
                    ..Default::default()
                },
            )
            .await;
        self.persistence.save().await;

        self.history
            .append(HistoryEvent {
                pool_id: self.pool_id.clone(),
                kind: HistoryEventKind::Mint,
                timestamp_ms: now_ms(),
                detail: format!("minted 7 initial bands around tick {tick}"),
                tx_hashes,
            })
            .await;
        self.notifier.notify(&format!("minted 7 initial bands for {}", self.pool_id)).await;
        self.push_health_status().await;
    }

    // ─── executeBandRebalance ────────────────────────────────────────────

    /// §4.4 `executeBandRebalance`. Called only from `on_price_tick`,
    /// which already holds the rebalance lock.
    async fn execute_band_rebalance(&self, tick: PriceTick, direction: Direction) {
        { self.inner.write().await.state = EngineState::Evaluating; }
        self.push_health_status().await;

        let now = now_ms();
        let last_rebalance_time_ms = { self.inner.read().await.last_rebalance_time_ms };
        let min_interval_ms = self.config.min_rebalance_interval_minutes as i64 * 60_000;
        if now - last_rebalance_time_ms < min_interval_ms {
            debug!(pool_id = %self.pool_id, "rebalance skipped: inside min rebalance interval");
            { self.inner.write().await.state = EngineState::Monitoring; }
            self.push_health_status().await;
            return;
        }

        let gas_info = match self.gas_oracle.get_gas_info().await {
            Ok(g) => g,
            Err(e) => {
                self.record_failure(&format!("gas oracle read failed: {e}")).await;
                return;
            }
        };
        let is_spike = self.gas_oracle.is_spike(gas_info.gas_price_gwei).await;
        let eth_price_usd = self.gas_oracle.eth_price_usd().await;
        // Trigger-band entries are always treated as "out of range" (
        // §4.5: "the current core treats trigger-band entries as out of
        // range (always proceeds)").
        if let GasVerdict::Skip { reason } =
            risk::gas_gate(gas_info, is_spike, eth_price_usd, self.config.max_gas_cost_usd, RangeState::OutOfRange)
        {
            info!(pool_id = %self.pool_id, ?reason, "rebalance skipped by gas gate");
            { self.inner.write().await.state = EngineState::Monitoring; }
            self.push_health_status().await;
            return;
        }

        let (bal0_pre, bal1_pre) = match self.balances.balances(&self.pool_id).await {
            Ok(b) => b,
            Err(e) => {
                self.record_failure(&format!("failed to read pre-rebalance balances: {e}")).await;
                return;
            }
        };
        let price = ticks::tick_to_price(tick.tick);
        let pre_value = valuation::portfolio_value(bal0_pre, bal1_pre, price);

        { self.inner.write().await.state = EngineState::Withdrawing; }

        let Some(dissolve) = ({ self.inner.read().await.ledger.band_to_dissolve(direction).cloned() }) else {
            self.record_failure("no band available to dissolve").await;
            return;
        };

        let position = match self.nft_manager.get_position(&dissolve.token_id).await {
            Ok(p) => p,
            Err(e) => {
                self.record_failure(&format!("failed to read dissolve-candidate position: {e}")).await;
                return;
            }
        };

        let mut withdrawn_tx_hashes = Vec::new();
        if position.liquidity > 0 {
            match self
                .nft_manager
                .remove_position(&dissolve.token_id, position.liquidity, self.config.slippage_tolerance_percent)
                .await
            {
                Ok(result) => withdrawn_tx_hashes = result.tx_hashes_as_vec(),
                Err((e, tx_hashes)) => {
                    let _ = self.checkpoint(CheckpointStage::Withdrawn, tx_hashes.into_vec()).await;
                    self.record_failure(&format!("remove_position failed: {e}")).await;
                    return;
                }
            }
        }

        { self.inner.write().await.ledger.remove(&dissolve.token_id); }

        if let Err(e) = self.checkpoint(CheckpointStage::Withdrawn, withdrawn_tx_hashes.clone()).await {
            self.record_failure(&format!("failed to persist Withdrawn checkpoint: {e}")).await;
            return;
        }

        { self.inner.write().await.state = EngineState::Swapping; }

        let (bal0_mid, bal1_mid) = match self.balances.balances(&self.pool_id).await {
            Ok(b) => b,
            Err(e) => {
                self.record_failure(&format!("failed to read post-withdraw balances: {e}")).await;
                return;
            }
        };

        let mut swap_tx_hashes = withdrawn_tx_hashes;
        if let Some(plan) = swap_planner::plan_rebalance_swap(direction, bal0_mid, bal1_mid) {
            let (token_in, token_out) = self.token_addresses(plan.token_in, plan.token_out);
            match self
                .swap_router
                .execute_swap(&token_in, &token_out, self.config.fee_tier, plan.amount_in, self.config.slippage_tolerance_percent)
                .await
            {
                Ok(result) => swap_tx_hashes.push(result.tx_hash),
                Err(e) => {
                    self.record_failure(&format!("swap failed: {e}")).await;
                    return;
                }
            }
        }

        if let Err(e) = self.checkpoint(CheckpointStage::Swapped, swap_tx_hashes.clone()).await {
            self.record_failure(&format!("failed to persist Swapped checkpoint: {e}")).await;
            return;
        }

        { self.inner.write().await.state = EngineState::Minting; }

        let (bal0_for_mint, bal1_for_mint) = match self.balances.balances(&self.pool_id).await {
            Ok(b) => b,
            Err(e) => {
                self.record_failure(&format!("failed to read pre-mint balances: {e}")).await;
                return;
            }
        };

        let new_ticks = { self.inner.read().await.ledger.new_band_ticks(direction) };
        let (new_lower, new_upper) = match new_ticks {
            Ok(t) => t,
            Err(e) => {
                self.record_failure(&format!("failed to compute new band ticks: {e}")).await;
                return;
            }
        };

        let mint_result = match self
            .nft_manager
            .mint(MintParams {
                tick_lower: new_lower,
                tick_upper: new_upper,
                amount0_desired: bal0_for_mint,
                amount1_desired: bal1_for_mint,
                slippage_tolerance_percent: self.config.slippage_tolerance_percent,
            })
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(&format!("mint failed: {e}")).await;
                return;
            }
        };
        let new_band = match Band::new(mint_result.token_id.clone(), new_lower, new_upper) {
            Ok(b) => b,
            Err(e) => {
                self.record_failure(&format!("minted band failed validation: {e}")).await;
                return;
            }
        };

        let insert_position = match direction {
            Direction::Lower => Position::Start,
            Direction::Upper => Position::End,
        };
        {
            let mut inner = self.inner.write().await;
            inner.ledger.add(new_band, insert_position);
            inner.last_rebalance_time_ms = now_ms();
            inner.consecutive_errors.record_success();
        }

        let mut all_tx_hashes = swap_tx_hashes;
        all_tx_hashes.push(mint_result.tx_hash);

        let (bal0_final, bal1_final) = self.balances.balances(&self.pool_id).await.unwrap_or((bal0_for_mint, bal1_for_mint));
        let post_value = valuation::portfolio_value(bal0_final, bal1_final, ticks::tick_to_price(tick.tick));
        { self.inner.write().await.last_portfolio_value_usd = Some(post_value); }

        if risk::single_rebalance_loss_exceeded(pre_value, post_value) {
            let msg = format!(
                "ALERT: Rebalance loss too high for {} (pre={pre_value:.4} post={post_value:.4})",
                self.pool_id
            );
            self.notifier.notify(&msg).await;
            { self.inner.write().await.state = EngineState::Stopped; }
            self.finish_rebalance(direction, &all_tx_hashes, tick).await;
            self.push_health_status().await;
            return;
        }

        let initial_value_usd = { self.inner.read().await.initial_value_usd };
        if let Some(initial) = initial_value_usd {
            if risk::portfolio_loss_exceeded(post_value, initial, self.config.max_total_loss_percent) {
                let msg = format!(
                    "ALERT: Portfolio loss limit exceeded for {} (post={post_value:.4} initial={initial:.4})",
                    self.pool_id
                );
                self.notifier.notify(&msg).await;
                self.finish_rebalance(direction, &all_tx_hashes, tick).await;
                self.emergency_withdraw_inner().await;
                return;
            }
        }

        self.finish_rebalance(direction, &all_tx_hashes, tick).await;
        { self.inner.write().await.state = EngineState::Monitoring; }
        self.push_health_status().await;
    }

    async fn checkpoint(&self, stage: CheckpointStage, tx_hashes: Vec<String>) -> anyhow::Result<()> {
        let (bands, width) = {
            let inner = self.inner.read().await;
            (inner.ledger.bands().to_vec(), inner.ledger.band_tick_width())
        };
        self.persistence
            .update_pool_state(
                &self.pool_id,
                PoolStateUpdate {
                    bands: Some(bands),
                    band_tick_width: Some(width),
                    rebalance_stage: Some(stage),
                    pending_tx_hashes: Some(tx_hashes),
                    ..Default::default()
                },
            )
            .await?;
        // Fail-fast per §5's ordering guarantee 3: a checkpoint that
        // cannot be durably written aborts the rebalance before the next
        // chain call.
        self.persistence.save_or_throw().await
    }

    async fn finish_rebalance(&self, direction: Direction, tx_hashes: &[String], tick: PriceTick) {
        let (last_rebalance_time_ms, bands, width) = {
            let inner = self.inner.read().await;
            (inner.last_rebalance_time_ms, inner.ledger.bands().to_vec(), inner.ledger.band_tick_width())
        };
        let _ = self
            .persistence
            .update_pool_state(
                &self.pool_id,
                PoolStateUpdate {
                    bands: Some(bands),
                    band_tick_width: Some(width),
                    last_rebalance_time_ms: Some(last_rebalance_time_ms),
                    clear_rebalance_stage: true,
                    ..Default::default()
                },
            )
            .await;
        // Terminal persist uses the lossy path: a lost write just re-triggers
        // recovery next boot, which is safe (§5 ordering guarantee 3).
        self.persistence.save().await;

        self.history
            .append(HistoryEvent {
                pool_id: self.pool_id.clone(),
                kind: HistoryEventKind::Rebalance,
                timestamp_ms: now_ms(),
                detail: format!("direction={direction:?} tick={}", tick.tick),
                tx_hashes: tx_hashes.to_vec(),
            })
            .await;
        self.notifier.notify(&format!("rebalanced {} direction={direction:?}", self.pool_id)).await;
    }

    fn token_addresses(&self, token_in: Token, token_out: Token) -> (String, String) {
        let addr_of = |t: Token| match t {
            Token::Token0 => self.config.token0_address.clone(),
            Token::Token1 => self.config.token1_address.clone(),
        };
        (addr_of(token_in), addr_of(token_out))
    }

    // ─── emergencyWithdraw / stop ────────────────────────────────────────

    /// Public entry point (§4.4 transition table: "any → Stopped").
    /// Acquires the rebalance lock itself; call this from outside an
    /// in-flight tick. `onPriceTick`'s internal depeg path calls the
    /// lock-free inner implementation directly since it already holds the
    /// lock.
    pub async fn emergency_withdraw(&self) {
        let _guard = self.rebalance_lock.lock().await;
        self.emergency_withdraw_inner().await;
    }

    /// §4.5 "Emergency withdraw": iterate the ledger, remove every band
    /// with non-zero liquidity, continuing past individual failures;
    /// transition to `Stopped` regardless of outcome.
    async fn emergency_withdraw_inner(&self) {
        let bands = { self.inner.read().await.ledger.bands().to_vec() };
        let total = bands.len();
        let mut closed = 0usize;
        let mut any_failure = false;
        let mut all_tx_hashes = Vec::new();

        for band in &bands {
            match self.nft_manager.get_position(&band.token_id).await {
                Ok(position) if position.liquidity > 0 => {
                    match self
                        .nft_manager
                        .remove_position(&band.token_id, position.liquidity, self.config.slippage_tolerance_percent)
                        .await
                    {
                        Ok(result) => {
                            closed += 1;
                            all_tx_hashes.extend(result.tx_hashes_as_vec());
                        }
                        Err((e, tx_hashes)) => {
                            any_failure = true;
                            all_tx_hashes.extend(tx_hashes.into_vec());
                            error!(pool_id = %self.pool_id, token_id = %band.token_id, error = %e, "emergency withdraw: remove failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    any_failure = true;
                    error!(pool_id = %self.pool_id, token_id = %band.token_id, error = %e, "emergency withdraw: failed to read position");
                }
            }
        }

        {
            let mut inner = self.inner.write().await;
            inner.ledger.clear();
            inner.state = EngineState::Stopped;
        }

        let _ = self
            .persistence
            .update_pool_state(
                &self.pool_id,
                PoolStateUpdate {
                    bands: Some(Vec::new()),
                    band_tick_width: Some(0),
                    clear_rebalance_stage: true,
                    ..Default::default()
                },
            )
            .await;
        self.persistence.save().await;

        self.history
            .append(HistoryEvent {
                pool_id: self.pool_id.clone(),
                kind: HistoryEventKind::EmergencyStop,
                timestamp_ms: now_ms(),
                detail: format!("closed {closed}/{total} bands"),
                tx_hashes: all_tx_hashes,
            })
            .await;

        let msg = if any_failure {
            format!("CRITICAL: Emergency withdraw FAILED for {} — manual intervention required", self.pool_id)
        } else {
            format!("EMERGENCY: All {total} bands closed for {}", self.pool_id)
        };
        self.notifier.notify(&msg).await;
        self.push_health_status().await;
    }

    /// Explicit operator-requested stop (§4.4 transition table: "any →
    /// Stopped"; §5 "graceful shutdown asks each engine to transition
    /// to Stopped at the next reachable boundary").
    pub async fn stop(&self) {
        let _guard = self.rebalance_lock.lock().await;
        { self.inner.write().await.state = EngineState::Stopped; }
        self.push_health_status().await;
    }

    async fn record_failure(&self, context: &str) {
        let exhausted = {
            let mut inner = self.inner.write().await;
            inner.consecutive_errors.record_failure()
        };
        error!(pool_id = %self.pool_id, %context, "rebalance step failed");
        if exhausted {
            { self.inner.write().await.state = EngineState::Error; }
            let msg = format!(
                "ALERT: {} stopped after {} errors ({context})",
                self.pool_id,
                risk::MAX_CONSECUTIVE_ERRORS
            );
            self.notifier.notify(&msg).await;
            self.emergency_withdraw_inner().await;
        } else {
            { self.inner.write().await.state = EngineState::Monitoring; }
            self.push_health_status().await;
        }
    }

    async fn push_health_status(&self) {
        let inner = self.inner.read().await;
        let update = PoolStatusUpdate {
            state: Some(inner.state.to_string()),
            band_count: Some(inner.ledger.len()),
            last_rebalance_time_ms: Some(inner.last_rebalance_time_ms),
            consecutive_errors: Some(inner.consecutive_errors.count()),
            last_error: None,
            portfolio_value_usd: inner.last_portfolio_value_usd,
        };
        drop(inner);
        self.health.update_pool_status(&self.pool_id, update).await;
    }
}

// Black-box scenario coverage for the whole state machine (§8's
// 7-scenario table) lives in `tests/engine_scenarios.rs` against the public
// API, per the test-tooling convention for cross-module integration
// behavior. Only the non-reentrancy check below needs the private lock
// field, so it stays here.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::collaborators::fakes::{FakeChain, FixedGasOracle, InMemoryHealthSurface, InMemoryHistoryLog, InMemoryNotifier};
    use crate::gas::GasInfo;
    use crate::persistence::FilePersistence;

    fn sample_config() -> PoolConfig {
        PoolConfig {
            pool_id: "usdc-usdt".to_string(),
            token0_address: "0xtoken0".to_string(),
            token1_address: "0xtoken1".to_string(),
            token0_decimals: 6,
            token1_decimals: 18,
            fee_tier: 100,
            pool_address: "0xpool".to_string(),
            nft_manager_address: "0xnftmgr".to_string(),
            router_address: "0xrouter".to_string(),
            range_width_percent: 3.0,
            min_rebalance_interval_minutes: 0,
            max_gas_cost_usd: 1_000_000.0,
            slippage_tolerance_percent: 0.5,
            expected_price_ratio: None,
            depeg_threshold_percent: 5.0,
            max_total_loss_percent: 100.0,
            check_interval_seconds: 0,
        }
    }

    struct Harness {
        engine: RebalanceEngine,
        _chain: Arc<FakeChain>,
        _tempdir: tempfile::TempDir,
    }

    async fn build_harness(config: PoolConfig) -> Harness {
        let chain = Arc::new(FakeChain::new(&config.token0_address, &config.token1_address, 10_000.0, 10_000.0));
        let tempdir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(FilePersistence::open(tempdir.path().join("state.json")).await.unwrap());
        let gas_oracle = Arc::new(FixedGasOracle {
            info: GasInfo { gas_price_gwei: 20.0, is_eip1559: true },
            spike: false,
            eth_price_usd: 2000.0,
        });

        let pool_id = config.pool_id.clone();
        let engine = RebalanceEngine::new(
            pool_id,
            config,
            "0xowner",
            Collaborators {
                nft_manager: chain.clone(),
                swap_router: chain.clone(),
                balances: chain.clone(),
                gas_oracle,
                persistence,
                history: Arc::new(InMemoryHistoryLog::default()),
                notifier: Arc::new(InMemoryNotifier::default()),
                health: Arc::new(InMemoryHealthSurface::default()),
            },
        );

        Harness {
            engine,
            _chain: chain,
            _tempdir: tempdir,
        }
    }

    fn tick(t: i32) -> PriceTick {
        PriceTick {
            tick: t,
            sqrt_price: alloy_primitives::U256::ZERO,
            liquidity: 0,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn concurrent_ticks_while_locked_are_dropped() {
        let h = build_harness(sample_config()).await;
        h.engine.initialize().await.unwrap();

        let _guard = h.engine.rebalance_lock.lock().await;
        // Engine is already "mid-rebalance"; a concurrent tick must return
        // immediately rather than block.
        h.engine.on_price_tick(tick(0)).await;
        assert!(h.engine.ledger_snapshot().await.is_empty());
    }
}
