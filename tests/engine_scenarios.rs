//! Black-box coverage of the full 7-scenario table against the public
//! `RebalanceEngine` API, using in-memory fakes instead of a live chain.

use std::sync::Arc;

use rangekeeper_core::band::Band;
use rangekeeper_core::collaborators::fakes::{
    FakeChain, FixedGasOracle, InMemoryHealthSurface, InMemoryHistoryLog, InMemoryNotifier,
};
use rangekeeper_core::collaborators::HistoryEventKind;
use rangekeeper_core::config::PoolConfig;
use rangekeeper_core::engine::{Collaborators, RebalanceEngine};
use rangekeeper_core::gas::GasInfo;
use rangekeeper_core::persistence::{FilePersistence, PoolStateUpdate};
use rangekeeper_core::state::{CheckpointStage, EngineState, PriceTick};

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

fn tick(t: i32) -> PriceTick {
    PriceTick {
        tick: t,
        sqrt_price: alloy_primitives::U256::ZERO,
        liquidity: 0,
        timestamp_ms: 0,
    }
}

struct Harness {
    engine: RebalanceEngine,
    chain: Arc<FakeChain>,
    history: Arc<InMemoryHistoryLog>,
    notifier: Arc<InMemoryNotifier>,
    health: Arc<InMemoryHealthSurface>,
    _tempdir: tempfile::TempDir,
}

async fn build_harness(config: PoolConfig) -> Harness {
    let chain = Arc::new(FakeChain::new(
        &config.token0_address,
        &config.token1_address,
        10_000.0,
        10_000.0,
    ));
    let history = Arc::new(InMemoryHistoryLog::default());
    let notifier = Arc::new(InMemoryNotifier::default());
    let health = Arc::new(InMemoryHealthSurface::default());
    let tempdir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(
        FilePersistence::open(tempdir.path().join("state.json"))
            .await
            .unwrap(),
    );
    let gas_oracle = Arc::new(FixedGasOracle {
        info: GasInfo {
            gas_price_gwei: 20.0,
            is_eip1559: true,
        },
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
            history: history.clone(),
            notifier: notifier.clone(),
            health: health.clone(),
        },
    );

    Harness {
        engine,
        chain,
        history,
        notifier,
        health,
        _tempdir: tempdir,
    }
}

/// Scenario 1: initial mint at tick=0, width=3%, fee=100.
#[tokio::test]
async fn scenario_initial_mint() {
    let h = build_harness(sample_config()).await;
    h.engine.initialize().await.unwrap();
    h.engine.on_price_tick(tick(0)).await;

    let ledger = h.engine.ledger_snapshot().await;
    assert_eq!(ledger.len(), 7);
    assert_eq!(ledger.band_tick_width(), 42);
    assert_eq!(h.engine.state().await, EngineState::Monitoring);
    assert_eq!(h.chain.position_count().await, 7);
    assert_eq!(h.history.events().await.len(), 1);
    assert!(h.health.status_of(h.engine.pool_id()).await.is_some());
}

/// Scenario 2: a safe-zone tick after the initial mint does nothing.
#[tokio::test]
async fn scenario_safe_zone_tick_is_a_no_op() {
    let h = build_harness(sample_config()).await;
    h.engine.initialize().await.unwrap();
    h.engine.on_price_tick(tick(0)).await;
    let events_before = h.history.events().await.len();
    let positions_before = h.chain.position_count().await;

    h.engine.on_price_tick(tick(0)).await;

    assert_eq!(h.history.events().await.len(), events_before);
    assert_eq!(h.chain.position_count().await, positions_before);
    assert_eq!(h.engine.state().await, EngineState::Monitoring);
}

/// Scenario 3: a lower-trigger tick dissolves the top band, swaps, and mints
/// a new band at the start.
#[tokio::test]
async fn scenario_lower_trigger_rebalances() {
    let h = build_harness(sample_config()).await;
    h.engine.initialize().await.unwrap();
    h.engine.on_price_tick(tick(0)).await;

    let ledger_before = h.engine.ledger_snapshot().await;
    let lowest_before = ledger_before.bands()[0].clone();

    // Midpoint of band index 1, a lower trigger band.
    let midpoint = (ledger_before.bands()[1].tick_lower + ledger_before.bands()[1].tick_upper) / 2;
    h.engine.on_price_tick(tick(midpoint)).await;

    let ledger_after = h.engine.ledger_snapshot().await;
    assert_eq!(ledger_after.len(), 7);
    assert_eq!(h.engine.state().await, EngineState::Monitoring);
    assert_eq!(ledger_after.bands()[0].tick_upper, lowest_before.tick_lower);

    let events = h.history.events().await;
    assert!(events.iter().any(|e| matches!(e.kind, HistoryEventKind::Rebalance)));
    let messages = h.notifier.messages().await;
    assert!(messages.iter().any(|m| m.contains("rebalanced")));
}

/// Scenario 4: mirror of scenario 3 for an upper trigger.
#[tokio::test]
async fn scenario_upper_trigger_rebalances() {
    let h = build_harness(sample_config()).await;
    h.engine.initialize().await.unwrap();
    h.engine.on_price_tick(tick(0)).await;

    let ledger_before = h.engine.ledger_snapshot().await;
    let highest_before = ledger_before.bands()[6].clone();
    let midpoint = (ledger_before.bands()[5].tick_lower + ledger_before.bands()[5].tick_upper) / 2;

    h.engine.on_price_tick(tick(midpoint)).await;

    let ledger_after = h.engine.ledger_snapshot().await;
    assert_eq!(ledger_after.len(), 7);
    assert_eq!(ledger_after.bands()[6].tick_lower, highest_before.tick_upper);
    assert_eq!(h.engine.state().await, EngineState::Monitoring);
}

/// Scenario 5: a depeg tick closes every band and halts the engine.
#[tokio::test]
async fn scenario_depeg_closes_all_bands() {
    let mut config = sample_config();
    config.expected_price_ratio = Some(1.0);
    let h = build_harness(config).await;
    h.engine.initialize().await.unwrap();
    h.engine.on_price_tick(tick(0)).await;
    assert_eq!(h.engine.ledger_snapshot().await.len(), 7);

    h.engine.on_price_tick(tick(600)).await;

    assert_eq!(h.engine.state().await, EngineState::Stopped);
    assert!(h.engine.ledger_snapshot().await.is_empty());
    let messages = h.notifier.messages().await;
    assert!(messages.iter().any(|m| m.contains("ALERT: DEPEG")));
}

/// Scenario 6: a crash mid-rebalance is recovered on initialize, and the
/// next tick re-mints a fresh 7-band ledger.
#[tokio::test]
async fn scenario_crash_recovery() {
    let config = sample_config();
    let h = build_harness(config.clone()).await;

    let tempdir = tempfile::tempdir().unwrap();
    let persistence = FilePersistence::open(tempdir.path().join("state.json"))
        .await
        .unwrap();
    persistence
        .update_pool_state(
            &config.pool_id,
            PoolStateUpdate {
                bands: Some(vec![
                    Band::new("111", -84, -42).unwrap(),
                    Band::new("222", -42, 0).unwrap(),
                ]),
                band_tick_width: Some(42),
                rebalance_stage: Some(CheckpointStage::Withdrawn),
                pending_tx_hashes: Some(vec!["0xabc".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    persistence.save_or_throw().await.unwrap();

    let engine = RebalanceEngine::new(
        config.pool_id.clone(),
        config,
        "0xowner",
        Collaborators {
            nft_manager: h.chain.clone(),
            swap_router: h.chain.clone(),
            balances: h.chain.clone(),
            gas_oracle: Arc::new(FixedGasOracle {
                info: GasInfo {
                    gas_price_gwei: 20.0,
                    is_eip1559: true,
                },
                spike: false,
                eth_price_usd: 2000.0,
            }),
            persistence: Arc::new(persistence),
            history: h.history.clone(),
            notifier: h.notifier.clone(),
            health: h.health.clone(),
        },
    );

    engine.initialize().await.unwrap();
    assert!(engine.ledger_snapshot().await.is_empty());
    assert_eq!(engine.state().await, EngineState::Monitoring);
    let messages = h.notifier.messages().await;
    assert!(messages.iter().any(|m| m.contains("RECOVERY")));

    engine.on_price_tick(tick(0)).await;
    assert_eq!(engine.ledger_snapshot().await.len(), 7);
}

/// Scenario 7: three consecutive mint failures halt the engine; two failures
/// followed by a success leaves the error counter at zero.
#[tokio::test]
async fn scenario_three_consecutive_failures_halt() {
    let h = build_harness(sample_config()).await;
    h.engine.initialize().await.unwrap();

    for _ in 0..3 {
        h.chain.arm_mint_failure();
        h.engine.on_price_tick(tick(0)).await;
    }

    assert!(h.engine.state().await.is_terminal());
    let messages = h.notifier.messages().await;
    assert!(messages.iter().any(|m| m.contains("stopped after 3 errors")));
}

#[tokio::test]
async fn two_failures_then_success_resets_error_counter() {
    let h = build_harness(sample_config()).await;
    h.engine.initialize().await.unwrap();

    h.chain.arm_mint_failure();
    h.engine.on_price_tick(tick(0)).await;
    h.chain.arm_mint_failure();
    h.engine.on_price_tick(tick(0)).await;
    assert_eq!(h.engine.consecutive_error_count().await, 2);

    h.engine.on_price_tick(tick(0)).await;
    assert_eq!(h.engine.consecutive_error_count().await, 0);
    assert_eq!(h.engine.ledger_snapshot().await.len(), 7);
}
