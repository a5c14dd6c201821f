pub mod elastic;
pub mod filter;
pub mod fusion;
pub mod mmr;
pub mod rerank;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::docs::ScoredDocument;
use crate::llm::Embedder;
use crate::question::Question;

use filter::AttributeFilter;

/// Candidate selection algorithm applied by a vector backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    /// Top-k nearest neighbours.
    Similarity,
    /// Maximal marginal relevance over `fetch_k` nearest neighbours.
    Mmr { fetch_k: usize, lambda: f32 },
}

/// Similarity/diversity search over one embedded corpus.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Index (corpus) name, for logs.
    fn index(&self) -> &str;

    /// Hits carry their stored embeddings so callers can de-duplicate
    /// without re-embedding.
    async fn search(
        &self,
        embedding: &[f32],
        mode: SearchMode,
        k: usize,
        filter: Option<&AttributeFilter>,
    ) -> Result<Vec<ScoredDocument>>;
}

/// One configured way of finding candidate documents for a question.
#[async_trait]
pub trait RetrievalStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &Question) -> Result<Vec<ScoredDocument>>;
}

/// Narrow nearest-neighbour candidates down to `k` per `mode`.
/// Backends that cannot do MMR server-side fetch `fetch_k` hits and call this.
pub fn apply_mode(
    query: &[f32],
    hits: Vec<ScoredDocument>,
    mode: SearchMode,
    k: usize,
) -> Vec<ScoredDocument> {
    match mode {
        SearchMode::Similarity => hits.into_iter().take(k).collect(),
        SearchMode::Mmr { lambda, .. } => {
            let embeddings: Vec<Vec<f32>> = hits.iter().map(|h| h.embedding.clone()).collect();
            let picked = mmr::maximal_marginal_relevance(query, &embeddings, k, lambda);
            let mut slots: Vec<Option<ScoredDocument>> = hits.into_iter().map(Some).collect();
            picked
                .into_iter()
                .filter_map(|i| slots.get_mut(i).and_then(Option::take))
                .collect()
        }
    }
}

/// Plain vector search: embed the question, query the backend.
pub struct VectorSearchStrategy {
    name: String,
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    mode: SearchMode,
    k: usize,
}

impl VectorSearchStrategy {
    pub fn similarity(backend: Arc<dyn VectorBackend>, embedder: Arc<dyn Embedder>, k: usize) -> Self {
        Self {
            name: format!("{}:similarity", backend.index()),
            backend,
            embedder,
            mode: SearchMode::Similarity,
            k,
        }
    }

    pub fn mmr(
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
        k: usize,
        fetch_k: usize,
        lambda: f32,
    ) -> Self {
        Self {
            name: format!("{}:mmr", backend.index()),
            backend,
            embedder,
            mode: SearchMode::Mmr { fetch_k, lambda },
            k,
        }
    }

    /// Search with an explicit query text and optional attribute filter.
    pub async fn search_text(
        &self,
        text: &str,
        filter: Option<&AttributeFilter>,
    ) -> Result<Vec<ScoredDocument>> {
        let embedding = self
            .embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let hits = self
            .backend
            .search(&embedding, self.mode, self.k, filter)
            .await?;
        debug!(
            strategy = %self.name,
            filtered = filter.is_some(),
            hits = hits.len(),
            "vector search"
        );
        Ok(hits)
    }
}

#[async_trait]
impl RetrievalStrategy for VectorSearchStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &Question) -> Result<Vec<ScoredDocument>> {
        self.search_text(query.text(), None).await
    }
}

/// In-memory fakes for the retrieval seams, shared by tests across modules.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::docs::Document;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub fn scored(content: &str, id: &str, embedding: Vec<f32>) -> ScoredDocument {
        let metadata = serde_json::json!({
            "regulation_number": id,
            "file_url": format!("https://example.go.id/{}.pdf", id.replace(['/', ' '], "-")),
        });
        ScoredDocument {
            document: Document::new(content, metadata.as_object().cloned().unwrap_or_default()),
            embedding,
            score: 1.0,
        }
    }

    /// Embeds every text as the same fixed vector.
    pub struct ConstEmbedder(pub Vec<f32>);

    #[async_trait]
    impl Embedder for ConstEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    /// Returns canned hits and records every filter it was called with.
    pub struct FakeBackend {
        pub hits: Vec<ScoredDocument>,
        pub reject_filters: bool,
        pub seen_filters: Mutex<Vec<Option<AttributeFilter>>>,
    }

    impl FakeBackend {
        pub fn new(hits: Vec<ScoredDocument>) -> Self {
            Self {
                hits,
                reject_filters: false,
                seen_filters: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VectorBackend for FakeBackend {
        fn index(&self) -> &str {
            "fake"
        }

        async fn search(
            &self,
            embedding: &[f32],
            mode: SearchMode,
            k: usize,
            filter: Option<&AttributeFilter>,
        ) -> Result<Vec<ScoredDocument>> {
            self.seen_filters
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(filter.cloned());
            if filter.is_some() && self.reject_filters {
                anyhow::bail!("search_phase_execution_exception");
            }
            Ok(apply_mode(embedding, self.hits.clone(), mode, k))
        }
    }

    /// A strategy with fixed output, optional delay and call counting.
    pub struct StaticStrategy {
        pub name: String,
        pub hits: Vec<ScoredDocument>,
        pub delay: Option<std::time::Duration>,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl StaticStrategy {
        pub fn new(name: &str, hits: Vec<ScoredDocument>) -> Self {
            Self {
                name: name.to_string(),
                hits,
                delay: None,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RetrievalStrategy for StaticStrategy {
        fn name(&self) -> &str {
            &self.name
        }

        async fn search(&self, _query: &Question) -> Result<Vec<ScoredDocument>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            Ok(self.hits.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_apply_mode_similarity_truncates() {
        let hits = vec![
            scored("a", "A", vec![1.0, 0.0]),
            scored("b", "B", vec![0.9, 0.1]),
            scored("c", "C", vec![0.0, 1.0]),
        ];
        let out = apply_mode(&[1.0, 0.0], hits, SearchMode::Similarity, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].document.content, "a");
    }

    #[test]
    fn test_apply_mode_mmr_diversifies() {
        let hits = vec![
            scored("a", "A", vec![1.0, 0.0]),
            scored("a2", "A2", vec![0.99, 0.01]),
            scored("c", "C", vec![0.7, 0.7]),
        ];
        let mode = SearchMode::Mmr {
            fetch_k: 3,
            lambda: 0.3,
        };
        let out = apply_mode(&[1.0, 0.0], hits, mode, 2);
        let contents: Vec<_> = out.iter().map(|h| h.document.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_vector_strategy_passes_mode() {
        let backend = Arc::new(FakeBackend::new(vec![
            scored("a", "A", vec![1.0, 0.0]),
            scored("b", "B", vec![0.0, 1.0]),
        ]));
        let strategy =
            VectorSearchStrategy::similarity(backend, Arc::new(ConstEmbedder(vec![1.0, 0.0])), 1);
        let hits = strategy.search(&Question::new("modal minimum bank")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(strategy.name(), "fake:similarity");
    }
}
