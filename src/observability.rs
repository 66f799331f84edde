//! The binary's concrete `HealthSurface` (§6, §10.6): a `prometheus`
//! registry the engines write to and an in-memory status cache the `/status`
//! HTTP route reads back from. One gauge set per pool, labeled by `pool_id`,
//! since this binary runs many engines side by side.

use std::collections::HashMap;

use async_trait::async_trait;
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::Mutex;

use rangekeeper_core::collaborators::{HealthSurface, PoolStatusUpdate};

/// Maps an `EngineState::to_string()` value to a small integer so it can
/// ride a Prometheus gauge; operators read the label for the string form.
fn state_code(state: &str) -> i64 {
    match state {
        "IDLE" => 0,
        "MONITORING" => 1,
        "EVALUATING" => 2,
        "WITHDRAWING" => 3,
        "SWAPPING" => 4,
        "MINTING" => 5,
        "ERROR" => 6,
        "STOPPED" => 7,
        _ => -1,
    }
}

pub struct PrometheusHealthSurface {
    registry: Registry,
    state_gauge: GaugeVec,
    band_count: IntGaugeVec,
    consecutive_errors: IntGaugeVec,
    last_rebalance_time_ms: GaugeVec,
    portfolio_value_usd: GaugeVec,
    latest: Mutex<HashMap<String, PoolStatusUpdate>>,
}

impl PrometheusHealthSurface {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let state_gauge = GaugeVec::new(
            Opts::new("rangekeeper_pool_state", "Current engine state, numerically coded"),
            &["pool_id"],
        )?;
        let band_count = IntGaugeVec::new(
            Opts::new("rangekeeper_pool_band_count", "Number of bands currently held"),
            &["pool_id"],
        )?;
        let consecutive_errors = IntGaugeVec::new(
            Opts::new("rangekeeper_pool_consecutive_errors", "Consecutive rebalance failures"),
            &["pool_id"],
        )?;
        let last_rebalance_time_ms = GaugeVec::new(
            Opts::new("rangekeeper_pool_last_rebalance_time_ms", "Unix millis of the last completed rebalance"),
            &["pool_id"],
        )?;
        let portfolio_value_usd = GaugeVec::new(
            Opts::new("rangekeeper_pool_portfolio_value_usd", "Most recently observed portfolio value in USD"),
            &["pool_id"],
        )?;

        registry.register(Box::new(state_gauge.clone()))?;
        registry.register(Box::new(band_count.clone()))?;
        registry.register(Box::new(consecutive_errors.clone()))?;
        registry.register(Box::new(last_rebalance_time_ms.clone()))?;
        registry.register(Box::new(portfolio_value_usd.clone()))?;

        Ok(Self {
            registry,
            state_gauge,
            band_count,
            consecutive_errors,
            last_rebalance_time_ms,
            portfolio_value_usd,
            latest: Mutex::new(HashMap::new()),
        })
    }

    pub async fn status_of(&self, pool_id: &str) -> Option<PoolStatusUpdate> {
        self.latest.lock().await.get(pool_id).cloned()
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[async_trait]
impl HealthSurface for PrometheusHealthSurface {
    async fn update_pool_status(&self, pool_id: &str, update: PoolStatusUpdate) {
        if let Some(state) = &update.state {
            self.state_gauge.with_label_values(&[pool_id]).set(state_code(state) as f64);
        }
        if let Some(count) = update.band_count {
            self.band_count.with_label_values(&[pool_id]).set(count as i64);
        }
        if let Some(errors) = update.consecutive_errors {
            self.consecutive_errors.with_label_values(&[pool_id]).set(errors as i64);
        }
        if let Some(t) = update.last_rebalance_time_ms {
            self.last_rebalance_time_ms.with_label_values(&[pool_id]).set(t as f64);
        }
        if let Some(v) = update.portfolio_value_usd {
            self.portfolio_value_usd.with_label_values(&[pool_id]).set(v);
        }
        self.latest.lock().await.insert(pool_id.to_string(), update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_status_is_readable_back_and_rendered() {
        let surface = PrometheusHealthSurface::new().unwrap();
        surface
            .update_pool_status(
                "usdc-usdt",
                PoolStatusUpdate {
                    state: Some("MONITORING".to_string()),
                    band_count: Some(7),
                    last_rebalance_time_ms: Some(1000),
                    consecutive_errors: Some(0),
                    last_error: None,
                    portfolio_value_usd: Some(20_000.0),
                },
            )
            .await;

        let status = surface.status_of("usdc-usdt").await.unwrap();
        assert_eq!(status.band_count, Some(7));

        let rendered = surface.render().unwrap();
        assert!(rendered.contains("rangekeeper_pool_band_count"));
        assert!(rendered.contains("usdc-usdt"));
    }
}
