//! Persistence contract (§3 PersistedPoolState, §4.4, §5, §6, §7).
//!
//! Grounded on `cooprefr-bettersys/src/backtest_v2/artifact_store.rs`'s
//! "single file, keyed by id" shape. The contract exposes both a fail-fast
//! write (`save_or_throw`, used between chained rebalance operations so a
//! durability failure aborts before the next chain call) and a lossy write
//! (`save`, used for the terminal persist — a lost terminal write is safe
//! because it just re-triggers recovery on the next boot, per §5.3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::band::Band;
use crate::state::{CheckpointStage, PersistedDocument, PersistedPoolState};

/// A merge-style partial update to one pool's persisted state. `None` fields
/// are left unchanged; `Some(None)`-shaped clears are expressed with the
/// explicit `clear_*` flags since `Option<Option<T>>` would be ambiguous to
/// construct at call sites.
#[derive(Debug, Clone, Default)]
pub struct PoolStateUpdate {
    pub bands: Option<Vec<Band>>,
    pub band_tick_width: Option<i32>,
    pub last_rebalance_time_ms: Option<i64>,
    pub last_nonce: Option<u64>,
    pub rebalance_stage: Option<CheckpointStage>,
    pub clear_rebalance_stage: bool,
    pub pending_tx_hashes: Option<Vec<String>>,
    pub initial_value_usd: Option<f64>,
}

impl PoolStateUpdate {
    fn apply(self, state: &mut PersistedPoolState) {
        if let Some(bands) = self.bands {
            state.bands = bands;
        }
        if let Some(width) = self.band_tick_width {
            state.band_tick_width = width;
        }
        if let Some(t) = self.last_rebalance_time_ms {
            state.last_rebalance_time_ms = t;
        }
        if let Some(nonce) = self.last_nonce {
            state.last_nonce = Some(nonce);
        }
        if self.clear_rebalance_stage {
            state.rebalance_stage = None;
            state.pending_tx_hashes.clear();
        } else if let Some(stage) = self.rebalance_stage {
            state.rebalance_stage = Some(stage);
        }
        if let Some(hashes) = self.pending_tx_hashes {
            state.pending_tx_hashes = hashes;
        }
        if let Some(v) = self.initial_value_usd {
            state.initial_value_usd = Some(v);
        }
    }
}

/// External persistence contract (§6). Implementations must serialize
/// writes to the backing file since multiple engines share it (§5).
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_pool_state(&self, id: &str) -> anyhow::Result<Option<PersistedPoolState>>;
    async fn update_pool_state(&self, id: &str, update: PoolStateUpdate) -> anyhow::Result<()>;
    /// Best-effort write: logs and swallows failures.
    async fn save(&self);
    /// Fail-fast write: propagates failures so the caller can abort before
    /// issuing the next chain call.
    async fn save_or_throw(&self) -> anyhow::Result<()>;
}

/// JSON-file-backed implementation. One file holds every engine's state,
/// keyed by pool id; a `tokio::Mutex` serializes writes across engines in
/// this process.
pub struct FilePersistence {
    path: PathBuf,
    doc: Arc<Mutex<PersistedDocument>>,
}

impl FilePersistence {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let contents = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&contents)?
        } else {
            PersistedDocument {
                version: 1,
                started_at: chrono::Utc::now().to_rfc3339(),
                pools: HashMap::new(),
            }
        };
        Ok(Self {
            path,
            doc: Arc::new(Mutex::new(doc)),
        })
    }

    async fn write_to_disk(&self) -> anyhow::Result<()> {
        let doc = self.doc.lock().await;
        let json = serde_json::to_string_pretty(&*doc)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn get_pool_state(&self, id: &str) -> anyhow::Result<Option<PersistedPoolState>> {
        let doc = self.doc.lock().await;
        Ok(doc.pools.get(id).cloned())
    }

    async fn update_pool_state(&self, id: &str, update: PoolStateUpdate) -> anyhow::Result<()> {
        let mut doc = self.doc.lock().await;
        let entry = doc.pools.entry(id.to_string()).or_default();
        update.apply(entry);
        Ok(())
    }

    async fn save(&self) {
        if let Err(e) = self.write_to_disk().await {
            warn!(error = %e, "lossy persistence write failed; will be recovered on next boot if needed");
        }
    }

    async fn save_or_throw(&self) -> anyhow::Result<()> {
        self.write_to_disk().await.map_err(|e| {
            error!(error = %e, "fail-fast persistence write failed");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_pool_state_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = FilePersistence::open(&path).await.unwrap();
            store
                .update_pool_state(
                    "pool-a",
                    PoolStateUpdate {
                        band_tick_width: Some(42),
                        last_rebalance_time_ms: Some(1000),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            store.save_or_throw().await.unwrap();
        }

        let reopened = FilePersistence::open(&path).await.unwrap();
        let state = reopened.get_pool_state("pool-a").await.unwrap().unwrap();
        assert_eq!(state.band_tick_width, 42);
        assert_eq!(state.last_rebalance_time_ms, 1000);
    }

    #[tokio::test]
    async fn unknown_pool_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::open(dir.path().join("state.json")).await.unwrap();
        assert!(store.get_pool_state("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_rebalance_stage_also_clears_pending_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::open(dir.path().join("state.json")).await.unwrap();
        store
            .update_pool_state(
                "pool-a",
                PoolStateUpdate {
                    rebalance_stage: Some(CheckpointStage::Withdrawn),
                    pending_tx_hashes: Some(vec!["0xabc".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_pool_state(
                "pool-a",
                PoolStateUpdate {
                    clear_rebalance_stage: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let state = store.get_pool_state("pool-a").await.unwrap().unwrap();
        assert_eq!(state.rebalance_stage, None);
        assert!(state.pending_tx_hashes.is_empty());
    }
}
