//! Fan-out over the strategies of one corpus, then dedup, rerank and reorder.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::mmr::{long_context_reorder, non_redundant_indices};
use super::rerank::Reranker;
use super::RetrievalStrategy;
use crate::docs::{Document, ScoredDocument};
use crate::llm::Embedder;
use crate::question::Question;

/// Upper bound on strategies searched at once within one fusion unit.
const MAX_PARALLEL_STRATEGIES: usize = 4;

#[derive(Debug, Clone)]
pub struct FusionSettings {
    pub top_n: usize,
    pub redundancy_threshold: f32,
    pub long_context_reorder: bool,
    pub strategy_timeout: Duration,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            top_n: 7,
            redundancy_threshold: 0.95,
            long_context_reorder: true,
            strategy_timeout: Duration::from_secs(20),
        }
    }
}

/// All retrieval strategies over one corpus, fused into one ranked context.
pub struct FusionUnit {
    name: String,
    strategies: Vec<Arc<dyn RetrievalStrategy>>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl FusionUnit {
    pub fn new(
        name: impl Into<String>,
        strategies: Vec<Arc<dyn RetrievalStrategy>>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            name: name.into(),
            strategies,
            embedder,
            reranker,
        }
    }

    /// Run every strategy with its own timeout. Results come back in
    /// strategy-priority order; failed or timed-out strategies yield nothing.
    async fn gather(&self, question: &Question, timeout: Duration) -> Vec<ScoredDocument> {
        let per_strategy: Vec<Vec<ScoredDocument>> = futures::stream::iter(self.strategies.iter())
            .map(|strategy| async move {
                match tokio::time::timeout(timeout, strategy.search(question)).await {
                    Ok(Ok(hits)) => {
                        debug!(unit = %self.name, strategy = strategy.name(), hits = hits.len(), "strategy done");
                        hits
                    }
                    Ok(Err(e)) => {
                        warn!(unit = %self.name, strategy = strategy.name(), error = %e, "strategy failed, contributing no documents");
                        vec![]
                    }
                    Err(_) => {
                        warn!(unit = %self.name, strategy = strategy.name(), timeout_secs = timeout.as_secs(), "strategy timed out, contributing no documents");
                        vec![]
                    }
                }
            })
            .buffered(MAX_PARALLEL_STRATEGIES)
            .collect()
            .await;
        per_strategy.into_iter().flatten().collect()
    }

    /// Hits from backends that do not return stored vectors are embedded here
    /// so the redundancy filter compares like with like.
    async fn ensure_embeddings(&self, hits: &mut [ScoredDocument]) {
        let missing: Vec<usize> = hits
            .iter()
            .enumerate()
            .filter(|(_, h)| h.embedding.is_empty())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return;
        }
        let texts: Vec<String> = missing.iter().map(|&i| hits[i].document.content.clone()).collect();
        match self.embedder.embed(&texts).await {
            Ok(vectors) => {
                for (i, v) in missing.into_iter().zip(vectors) {
                    hits[i].embedding = v;
                }
            }
            // Exact-content dedup still applies without vectors
            Err(e) => warn!(unit = %self.name, error = %e, "embedding hits failed"),
        }
    }

    pub async fn fuse(&self, question: &Question, settings: &FusionSettings) -> Result<Vec<Document>> {
        let mut hits = self.gather(question, settings.strategy_timeout).await;
        let gathered = hits.len();
        if hits.is_empty() {
            info!(unit = %self.name, "no documents from any strategy");
            return Ok(vec![]);
        }

        self.ensure_embeddings(&mut hits).await;

        let embeddings: Vec<Vec<f32>> = hits.iter().map(|h| h.embedding.clone()).collect();
        let hashes: Vec<blake3::Hash> = hits.iter().map(|h| h.document.content_hash()).collect();
        let keep = non_redundant_indices(&embeddings, &hashes, settings.redundancy_threshold);
        let mut slots: Vec<Option<ScoredDocument>> = hits.into_iter().map(Some).collect();
        let unique: Vec<Document> = keep
            .into_iter()
            .filter_map(|i| slots.get_mut(i).and_then(Option::take))
            .map(|h| h.document)
            .collect();
        let deduped = unique.len();

        let mut docs = self.rank(question, unique, settings.top_n).await;
        if settings.long_context_reorder {
            docs = long_context_reorder(docs);
        }

        info!(
            unit = %self.name,
            gathered,
            deduped,
            returned = docs.len(),
            reranked = self.reranker.is_some(),
            "fusion complete"
        );
        Ok(docs)
    }

    /// Rerank and truncate to `top_n`; plain truncation when no reranker is
    /// configured or the reranker fails.
    async fn rank(&self, question: &Question, docs: Vec<Document>, top_n: usize) -> Vec<Document> {
        let Some(reranker) = &self.reranker else {
            return docs.into_iter().take(top_n).collect();
        };
        let texts: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
        match reranker.rerank(question.text(), &texts, top_n).await {
            Ok(order) => {
                let mut slots: Vec<Option<Document>> = docs.into_iter().map(Some).collect();
                order
                    .into_iter()
                    .filter_map(|(i, _)| slots.get_mut(i).and_then(Option::take))
                    .take(top_n)
                    .collect()
            }
            Err(e) => {
                warn!(unit = %self.name, error = %e, "rerank failed, keeping retrieval order");
                docs.into_iter().take(top_n).collect()
            }
        }
    }
}
