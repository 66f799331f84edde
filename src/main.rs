//! `rangekeeper` binary (§10.1, §11 "multi-pool process wiring").
//!
//! Loads a `RangeKeeperConfig`, builds one `RebalanceEngine` per configured
//! pool sharing a single persistence file, spawns one price-source task per
//! pool, and serves an `axum` health/status/metrics surface: `dotenvy::dotenv()`
//! plus `tracing_subscriber` init at startup, a `tokio::spawn`'d loop per
//! pool, and an `axum::serve` HTTP surface running alongside them.
//!
//! The collaborators wired in here are the in-memory fakes from
//! `rangekeeper_core::collaborators::fakes`: the real RPC/contract driver is
//! out of scope for this core (§1), so this binary only demonstrates
//! the engine end-to-end in a "dry" mode. A production deployment swaps
//! `FakeChain`/`EmaGasOracle` for RPC-backed implementations of the same
//! traits without touching `rangekeeper_core`.

mod observability;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use rangekeeper_core::collaborators::fakes::{DemoOscillatorPriceSource, InMemoryHistoryLog};
use rangekeeper_core::collaborators::{HealthSurface, HistoryEvent, HistoryLog, Notifier, PoolStatusUpdate, PriceSource};
use rangekeeper_core::config::RangeKeeperConfig;
use rangekeeper_core::engine::{Collaborators, RebalanceEngine};
use rangekeeper_core::persistence::{FilePersistence, Persistence};

use observability::PrometheusHealthSurface;

/// Starting wallet balance of each token seeded into the demo chain, absent a
/// real RPC-backed balance reader (§1: the RPC driver is out of scope).
const DEMO_STARTING_BALANCE: f64 = 250_000.0;
/// Fallback ETH/USD price for the gas oracle when no live feed is wired up
/// (§4.5: "configured or fallback ETH price").
const DEMO_ETH_PRICE_USD: f64 = 2_500.0;
/// Seed baseline for the gas oracle's EMA tracker.
const DEMO_GAS_BASELINE_GWEI: f64 = 20.0;
/// How often the demo oscillator price source emits a tick, absent a real
/// pool-price polling loop (§1).
const DEMO_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Oscillation amplitude around each pool's configured center tick, sized so
/// a demo run visits both safe-zone and trigger bands.
const DEMO_OSCILLATION_AMPLITUDE_TICKS: i32 = 200;

#[derive(Parser, Debug)]
#[command(name = "rangekeeper", about = "Autonomous concentrated-liquidity rebalancing agent")]
struct Cli {
    /// Path to the TOML pool configuration file.
    #[arg(long, env = "RANGEKEEPER_CONFIG", default_value = "rangekeeper.toml")]
    config: String,

    /// Overrides the config file's `state_file` (the shared persistence path).
    #[arg(long, env = "RANGEKEEPER_STATE_FILE")]
    state_file: Option<String>,

    /// Port for the axum health/status/metrics HTTP surface.
    #[arg(long, env = "RANGEKEEPER_PORT", default_value_t = 8090)]
    port: u16,

    /// Emit JSON-formatted logs instead of the default human-readable format.
    #[arg(long, env = "RANGEKEEPER_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

/// Sends every notification through both the structured logger (§10.2:
/// "RECOVERY/EMERGENCY/CRITICAL/ALERT prefixes are also logged at matching
/// severity") and an in-memory ring the `/status` route can surface, so a
/// real notifier (Slack, PagerDuty, ...) can be substituted later without the
/// engine code changing.
struct LoggingNotifier {
    pool_id: String,
}

#[async_trait::async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, message: &str) {
        let pool_id = &self.pool_id;
        if message.starts_with("CRITICAL") {
            tracing::error!(pool_id, message, "notification");
        } else if message.starts_with("EMERGENCY") || message.starts_with("ALERT") {
            tracing::warn!(pool_id, message, "notification");
        } else if message.starts_with("RECOVERY") {
            tracing::warn!(pool_id, message, "notification");
        } else {
            tracing::info!(pool_id, message, "notification");
        }
    }
}

/// Writes every mint/rebalance/emergency-stop event through both the
/// configured `HistoryLog` and the structured logger, mirroring the
/// notifier's dual-sink shape.
struct LoggingHistoryLog {
    inner: InMemoryHistoryLog,
}

#[async_trait::async_trait]
impl HistoryLog for LoggingHistoryLog {
    async fn append(&self, event: HistoryEvent) {
        info!(
            pool_id = %event.pool_id,
            kind = ?event.kind,
            detail = %event.detail,
            tx_hashes = ?event.tx_hashes,
            "history event"
        );
        self.inner.append(event).await;
    }
}

struct RunningPool {
    engine: Arc<RebalanceEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rangekeeper=info,rangekeeper_core=info".into());
    if cli.log_json {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!(config = %cli.config, "=== RangeKeeper ===");

    let config = RangeKeeperConfig::load_from_file(&cli.config)
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", cli.config))?;
    let state_file = cli.state_file.unwrap_or_else(|| config.state_file.clone());

    let persistence: Arc<dyn Persistence> = Arc::new(FilePersistence::open(&state_file).await?);
    let prometheus: Arc<PrometheusHealthSurface> = Arc::new(PrometheusHealthSurface::new()?);
    let health: Arc<dyn HealthSurface> = prometheus.clone();

    if config.pools.is_empty() {
        warn!("config defines no pools; nothing to run");
    }

    let eth_price_usd = rangekeeper_core::gas::fetch_eth_price_usd(DEMO_ETH_PRICE_USD).await;
    info!(eth_price_usd, "gas oracle ETH/USD price seeded");

    let mut running = Vec::with_capacity(config.pools.len());
    for pool_config in config.pools {
        let pool_id = pool_config.pool_id.clone();
        let chain = Arc::new(
            rangekeeper_core::collaborators::fakes::FakeChain::new(
                pool_config.token0_address.clone(),
                pool_config.token1_address.clone(),
                DEMO_STARTING_BALANCE,
                DEMO_STARTING_BALANCE,
            ),
        );
        let gas_oracle = Arc::new(rangekeeper_core::gas::EmaGasOracle::new(
            DEMO_GAS_BASELINE_GWEI,
            eth_price_usd,
        ));

        let engine = Arc::new(RebalanceEngine::new(
            pool_id.clone(),
            pool_config.clone(),
            "0xdemo-owner",
            Collaborators {
                nft_manager: chain.clone(),
                swap_router: chain.clone(),
                balances: chain.clone(),
                gas_oracle,
                persistence: persistence.clone(),
                history: Arc::new(LoggingHistoryLog {
                    inner: InMemoryHistoryLog::default(),
                }),
                notifier: Arc::new(LoggingNotifier {
                    pool_id: pool_id.clone(),
                }),
                health: health.clone(),
            },
        ));

        engine
            .initialize()
            .await
            .map_err(|e| anyhow::anyhow!("failed to initialize pool {pool_id}: {e}"))?;

        let center_tick = rangekeeper_core::ticks::align_tick(
            0,
            rangekeeper_core::ticks::fee_to_tick_spacing(pool_config.fee_tier)?,
        )?;
        let poll_interval = if pool_config.check_interval_seconds > 0 {
            Duration::from_secs(pool_config.check_interval_seconds)
        } else {
            DEMO_POLL_INTERVAL
        };
        let price_source = DemoOscillatorPriceSource::new(center_tick, DEMO_OSCILLATION_AMPLITUDE_TICKS, poll_interval);
        let mut ticks = price_source.subscribe();

        let tick_engine = engine.clone();
        let tick_pool_id = pool_id.clone();
        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                tick_engine.on_price_tick(tick).await;
            }
            info!(pool_id = %tick_pool_id, "price tick stream ended");
        });

        info!(pool_id = %pool_id, "pool engine started");
        running.push(RunningPool { engine });
    }

    let app_state = AppState {
        pools: Arc::new(running),
        prometheus,
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/status/:pool_id", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP surface listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received; stopping all pool engines");
            for pool in app_state.pools.iter() {
                pool.engine.stop().await;
            }
        }
    }

    Ok(())
}

#[derive(Clone)]
struct AppState {
    pools: Arc<Vec<RunningPool>>,
    prometheus: Arc<PrometheusHealthSurface>,
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Reads the most recently pushed status for `pool_id` (§6 HealthSurface,
/// written by the engine on every transition) rather than re-deriving it from
/// the engine directly, so this route reflects exactly what the engine last
/// reported rather than a fresh-but-unlocked snapshot.
async fn status_handler(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> Result<Json<PoolStatusUpdate>, StatusCode> {
    if !state.pools.iter().any(|p| p.engine.pool_id() == pool_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    state
        .prometheus
        .status_of(&pool_id)
        .await
        .map(Json)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.prometheus.render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
