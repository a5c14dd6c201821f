use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::filter::{AttributeFilter, Comparator};
use super::{apply_mode, SearchMode, VectorBackend};
use crate::docs::{Document, ScoredDocument};
use crate::error::RagError;

const TEXT_FIELD: &str = "text";
const VECTOR_FIELD: &str = "vector";
const METADATA_FIELD: &str = "metadata";

/// Elasticsearch dense-vector index using the `text`/`vector`/`metadata`
/// document layout.
pub struct ElasticBackend {
    client: reqwest::Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticBackend {
    pub fn from_env(index: &str) -> Result<Self> {
        let base_url = dotenv::var("ES_URL").unwrap_or_else(|_| "http://localhost:9200".to_string());
        let username = dotenv::var("ES_USERNAME").ok().filter(|s| !s.is_empty());
        let password = dotenv::var("ES_PASSWORD").ok().filter(|s| !s.is_empty());
        let timeout_secs = dotenv::var("ES_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(15);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create Elasticsearch HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
            username,
            password,
        })
    }

    fn search_body(embedding: &[f32], size: usize, filter: Option<&AttributeFilter>) -> Value {
        let mut knn = json!({
            "field": VECTOR_FIELD,
            "query_vector": embedding,
            "k": size,
            "num_candidates": (size * 5).max(50),
        });
        if let Some(filter) = filter {
            knn["filter"] = to_query(filter);
        }
        json!({
            "size": size,
            "knn": knn,
            "_source": [TEXT_FIELD, VECTOR_FIELD, METADATA_FIELD],
        })
    }
}

/// Translate an attribute filter into an Elasticsearch query clause.
pub fn to_query(filter: &AttributeFilter) -> Value {
    match filter {
        AttributeFilter::Compare {
            attribute,
            comparator,
            value,
        } => {
            let field = format!("{}.{}", METADATA_FIELD, attribute);
            let keyword = format!("{}.keyword", field);
            match comparator {
                Comparator::Eq => json!({ "term": { keyword: value } }),
                Comparator::Ne => json!({ "bool": { "must_not": [{ "term": { keyword: value } }] } }),
                Comparator::Contain => {
                    json!({ "match": { field: { "query": value, "fuzziness": "AUTO" } } })
                }
                Comparator::Gt => json!({ "range": { keyword: { "gt": value } } }),
                Comparator::Gte => json!({ "range": { keyword: { "gte": value } } }),
                Comparator::Lt => json!({ "range": { keyword: { "lt": value } } }),
                Comparator::Lte => json!({ "range": { keyword: { "lte": value } } }),
            }
        }
        AttributeFilter::And(args) => {
            json!({ "bool": { "must": args.iter().map(to_query).collect::<Vec<_>>() } })
        }
        AttributeFilter::Or(args) => json!({
            "bool": {
                "should": args.iter().map(to_query).collect::<Vec<_>>(),
                "minimum_should_match": 1,
            }
        }),
        AttributeFilter::Not(inner) => json!({ "bool": { "must_not": [to_query(inner)] } }),
    }
}

fn parse_hit(hit: &Value) -> Option<ScoredDocument> {
    let source = hit.get("_source")?;
    let content = source.get(TEXT_FIELD)?.as_str()?.to_string();
    let metadata: Map<String, Value> = source
        .get(METADATA_FIELD)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let embedding = source
        .get(VECTOR_FIELD)
        .and_then(Value::as_array)
        .map(|v| v.iter().filter_map(Value::as_f64).map(|f| f as f32).collect())
        .unwrap_or_default();
    let score = hit.get("_score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
    Some(ScoredDocument {
        document: Document::new(content, metadata),
        embedding,
        score,
    })
}

#[async_trait]
impl VectorBackend for ElasticBackend {
    fn index(&self) -> &str {
        &self.index
    }

    async fn search(
        &self,
        embedding: &[f32],
        mode: SearchMode,
        k: usize,
        filter: Option<&AttributeFilter>,
    ) -> Result<Vec<ScoredDocument>> {
        let size = match mode {
            SearchMode::Similarity => k,
            SearchMode::Mmr { fetch_k, .. } => fetch_k.max(k),
        };
        let body = Self::search_body(embedding, size, filter);

        let mut req = self
            .client
            .post(format!("{}/{}/_search", self.base_url, self.index))
            .json(&body);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_ref());
        }

        let resp = req
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RagError::from_reqwest("vector search", e))?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| RagError::from_reqwest("vector search", e))?;

        let hits: Vec<ScoredDocument> = json["hits"]["hits"]
            .as_array()
            .map(|arr| arr.iter().filter_map(parse_hit).collect())
            .unwrap_or_default();
        debug!(index = %self.index, size, hits = hits.len(), "elasticsearch knn");

        Ok(apply_mode(embedding, hits, mode, k))
    }
}
