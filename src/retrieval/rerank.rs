use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::RagError;

const COHERE_RERANK_URL: &str = "https://api.cohere.com/v1/rerank";

/// Cross-encoder relevance scoring of documents against a query.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns `(index into docs, relevance)` for at most `top_n` documents,
    /// most relevant first.
    async fn rerank(&self, query: &str, docs: &[String], top_n: usize) -> Result<Vec<(usize, f32)>>;
}

pub struct CohereReranker {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl CohereReranker {
    /// `Ok(None)` when no `COHERE_API_KEY` is configured; fusion then
    /// truncates without reranking.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(api_key) = dotenv::var("COHERE_API_KEY").ok().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let model = dotenv::var("COHERE_RERANK_MODEL")
            .unwrap_or_else(|_| "rerank-multilingual-v3.0".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create rerank HTTP client")?;
        Ok(Some(Self {
            client,
            api_key,
            model,
        }))
    }
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[async_trait]
impl Reranker for CohereReranker {
    async fn rerank(&self, query: &str, docs: &[String], top_n: usize) -> Result<Vec<(usize, f32)>> {
        if docs.is_empty() || top_n == 0 {
            return Ok(vec![]);
        }
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": docs,
            "top_n": top_n.min(docs.len()),
        });
        let resp = self
            .client
            .post(COHERE_RERANK_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RagError::from_reqwest("rerank", e))?;
        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| RagError::from_reqwest("rerank", e))?;

        let mut ranked: Vec<(usize, f32)> = parsed
            .results
            .into_iter()
            .filter(|r| r.index < docs.len())
            .map(|r| (r.index, r.relevance_score))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(top_n);
        debug!(model = %self.model, candidates = docs.len(), kept = ranked.len(), "rerank");
        Ok(ranked)
    }
}
