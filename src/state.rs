use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::chain::Pipeline;
use crate::history::HistoryStore;
use crate::retrieval::fusion::FusionSettings;

/// Retrieval and history tunables. `top_n`, `redundancy_threshold`,
/// `long_context_reorder` and `strategy_timeout_secs` are read per request
/// and admins can change them at runtime; the rest apply at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fused documents kept per corpus after deduplication.
    pub top_n: usize,
    /// Hits each retrieval strategy returns before fusion.
    pub search_k: usize,
    pub fetch_k: usize,
    pub mmr_lambda: f32,
    pub redundancy_threshold: f32,
    pub long_context_reorder: bool,
    pub strategy_timeout_secs: u64,
    pub history_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_n: 7,
            search_k: 7,
            fetch_k: 20,
            mmr_lambda: 0.5,
            redundancy_threshold: 0.95,
            long_context_reorder: true,
            strategy_timeout_secs: 20,
            history_k: 4,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    dotenv::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            top_n: env_or("TOP_N", d.top_n),
            search_k: env_or("SEARCH_K", d.search_k),
            fetch_k: env_or("FETCH_K", d.fetch_k),
            mmr_lambda: env_or("MMR_LAMBDA", d.mmr_lambda),
            redundancy_threshold: env_or("REDUNDANCY_THRESHOLD", d.redundancy_threshold),
            long_context_reorder: env_or("LONG_CONTEXT_REORDER", d.long_context_reorder),
            strategy_timeout_secs: env_or("STRATEGY_TIMEOUT_SECS", d.strategy_timeout_secs),
            history_k: env_or("HISTORY_K", d.history_k),
        }
    }

    pub fn fusion_settings(&self) -> FusionSettings {
        FusionSettings {
            top_n: self.top_n,
            redundancy_threshold: self.redundancy_threshold,
            long_context_reorder: self.long_context_reorder,
            strategy_timeout: Duration::from_secs(self.strategy_timeout_secs),
        }
    }
}

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub history: Arc<dyn HistoryStore>,
    pub admin_ids: HashSet<u64>,
    pub config: Arc<RwLock<PipelineConfig>>,
}

impl AppState {
    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

pub type Context<'a> = poise::Context<'a, AppState, anyhow::Error>;
