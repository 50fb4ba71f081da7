use std::time::Duration;

use anyhow::{anyhow, Result};
use layerfit_contracts::models::{ModelSelector, RankedCandidates, Task};

use crate::codec::CompressionBounds;

pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPOSE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);
pub const DEFAULT_CACHE_CEILING_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Requested detection models, in preference order. Empty means the
    /// registry's default ranking.
    pub detect_models: Vec<String>,
    pub compose_models: Vec<String>,
    pub detect_timeout: Duration,
    pub compose_timeout: Duration,
    pub persist_debounce: Duration,
    /// Serialized sessions larger than this skip the local cache tier.
    pub cache_ceiling_bytes: usize,
    pub compression: CompressionBounds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detect_models: Vec::new(),
            compose_models: Vec::new(),
            detect_timeout: DEFAULT_DETECT_TIMEOUT,
            compose_timeout: DEFAULT_COMPOSE_TIMEOUT,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
            cache_ceiling_bytes: DEFAULT_CACHE_CEILING_BYTES,
            compression: CompressionBounds::default(),
        }
    }
}

impl EngineConfig {
    /// Uses the same per-candidate timeout for both tasks.
    pub fn with_candidate_timeout(mut self, timeout: Duration) -> Self {
        self.detect_timeout = timeout;
        self.compose_timeout = timeout;
        self
    }

    pub fn rank(&self, selector: &ModelSelector, task: Task) -> Result<RankedCandidates> {
        let requested = match task {
            Task::Detect => &self.detect_models,
            Task::Compose => &self.compose_models,
        };
        let ranked = selector.rank(requested, task).map_err(|err| anyhow!(err))?;
        for note in &ranked.skipped {
            tracing::warn!(%task, "{note}");
        }
        if let Some(reason) = ranked.fallback_reason.as_deref() {
            tracing::debug!(%task, "{reason}");
        }
        Ok(ranked)
    }
}
