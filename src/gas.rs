//! Gas oracle (§4.5, §6 GasOracle, §11 supplemented).
//!
//! The external `GasOracle` collaborator is specified only by its contract;
//! this module supplies the EMA baseline/spike-detection logic the gate in
//! `risk.rs` needs to call: an exponential moving-average baseline
//! (`avg = (avg*7 + new*3)/10`-style smoothing) generalized to 0.95/0.05
//! weights, with a spike multiplier over the baseline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Current gas conditions as read from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GasInfo {
    pub gas_price_gwei: f64,
    pub is_eip1559: bool,
}

/// Fixed gas budget for a full remove/swap/mint rebalance cycle, in gas units.
pub const GAS_BUDGET: f64 = 800_000.0;

/// EMA weight applied to the existing baseline on each sample.
const EMA_OLD_WEIGHT: f64 = 0.95;
/// EMA weight applied to the new sample.
const EMA_NEW_WEIGHT: f64 = 0.05;
/// A price above `baseline * SPIKE_MULTIPLIER` is a spike.
const SPIKE_MULTIPLIER: f64 = 10.0;

/// Contract consumed by the risk gate: current gas conditions plus a
/// spike classifier relative to a maintained baseline (§6).
#[async_trait]
pub trait GasOracle: Send + Sync {
    async fn get_gas_info(&self) -> anyhow::Result<GasInfo>;
    /// True if `x` exceeds the maintained EMA baseline by the spike multiplier.
    async fn is_spike(&self, x: f64) -> bool;
    /// ETH/USD price to convert a gas estimate into USD; a fixed fallback
    /// value is acceptable per §4.5 ("configured or fallback ETH price").
    async fn eth_price_usd(&self) -> f64;
}

/// One-shot ETH/USD lookup used to seed an oracle at startup; falls back to
/// `fallback_usd` on any network, status, or parse error so gas-cost
/// estimation never blocks on a flaky price feed (§4.5: "configured or
/// fallback ETH price").
pub async fn fetch_eth_price_usd(fallback_usd: f64) -> f64 {
    match fetch_eth_price_usd_inner().await {
        Ok(price) if price > 0.0 => price,
        Ok(_) => fallback_usd,
        Err(_) => fallback_usd,
    }
}

async fn fetch_eth_price_usd_inner() -> anyhow::Result<f64> {
    #[derive(Deserialize)]
    struct SpotResponse {
        data: SpotData,
    }
    #[derive(Deserialize)]
    struct SpotData {
        amount: String,
    }

    let response: SpotResponse = reqwest::Client::new()
        .get("https://api.coinbase.com/v2/prices/ETH-USD/spot")
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(response.data.amount.parse()?)
}

/// In-memory gas oracle maintaining an exponential moving-average baseline,
/// seeded with an ETH/USD price from [`fetch_eth_price_usd`] or a configured
/// override.
pub struct EmaGasOracle {
    baseline: Mutex<f64>,
    eth_price_usd: f64,
    sampler: Box<dyn Fn() -> f64 + Send + Sync>,
}

impl EmaGasOracle {
    /// `initial_baseline` seeds the EMA (a fresh oracle has no history to
    /// average against); `eth_price_usd` is the configured or fallback price.
    pub fn new(initial_baseline_gwei: f64, eth_price_usd: f64) -> Self {
        Self {
            baseline: Mutex::new(initial_baseline_gwei),
            eth_price_usd,
            sampler: Box::new(|| initial_baseline_gwei),
        }
    }

    /// Test/demo constructor with an injectable sampling function instead of
    /// a live RPC call.
    pub fn with_sampler(
        initial_baseline_gwei: f64,
        eth_price_usd: f64,
        sampler: impl Fn() -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            baseline: Mutex::new(initial_baseline_gwei),
            eth_price_usd,
            sampler: Box::new(sampler),
        }
    }

    async fn sample_and_update(&self) -> f64 {
        let sample = (self.sampler)();
        let mut baseline = self.baseline.lock().await;
        *baseline = *baseline * EMA_OLD_WEIGHT + sample * EMA_NEW_WEIGHT;
        sample
    }
}

#[async_trait]
impl GasOracle for EmaGasOracle {
    async fn get_gas_info(&self) -> anyhow::Result<GasInfo> {
        let gas_price_gwei = self.sample_and_update().await;
        Ok(GasInfo {
            gas_price_gwei,
            is_eip1559: true,
        })
    }

    async fn is_spike(&self, x: f64) -> bool {
        let baseline = *self.baseline.lock().await;
        baseline > 0.0 && x > baseline * SPIKE_MULTIPLIER
    }

    async fn eth_price_usd(&self) -> f64 {
        self.eth_price_usd
    }
}

/// Estimated USD cost of one full rebalance cycle at `gas_price_gwei`,
/// per §4.5's fixed `GAS_BUDGET` formula.
pub fn estimate_rebalance_cost_usd(gas_price_gwei: f64, eth_price_usd: f64) -> f64 {
    gas_price_gwei * 1e-9 * GAS_BUDGET * eth_price_usd
}
