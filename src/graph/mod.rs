//! Graph evidence: question → Cypher → rows → natural-language evidence.

pub mod cypher;
pub mod neo4j;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::chain::prompts;
use crate::docs::citations::{collect_citations, unmentioned};
use crate::docs::{Citation, Document};
use crate::error::{is_recoverable, RagError};
use crate::llm::Generator;
use crate::question::Question;

pub type Row = Map<String, Value>;

/// Graph query capability.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn run(&self, query: &str) -> Result<Vec<Row>>;
}

/// Rendered graph evidence for one question.
#[derive(Debug, Clone)]
pub struct GraphEvidence {
    pub text: String,
    /// One document per regulation node or identifier found in the rows.
    pub documents: Vec<Document>,
    /// False when the graph had nothing; `text` is then the explicit
    /// "unknown" answer.
    pub found: bool,
}

impl GraphEvidence {
    fn unknown(question: &Question) -> Self {
        Self {
            text: prompts::graph_unknown_answer(question.language()).to_string(),
            documents: vec![],
            found: false,
        }
    }

    pub fn citations(&self) -> Vec<Citation> {
        collect_citations(&self.documents)
    }
}

pub struct GraphEvidenceUnit {
    generator: Arc<dyn Generator>,
    backend: Arc<dyn GraphBackend>,
    schema: String,
}

impl GraphEvidenceUnit {
    pub fn new(generator: Arc<dyn Generator>, backend: Arc<dyn GraphBackend>) -> Self {
        Self {
            generator,
            backend,
            schema: prompts::GRAPH_SCHEMA.to_string(),
        }
    }

    async fn generate_query(&self, question: &Question) -> Result<String> {
        let prompt = prompts::GRAPH_CYPHER
            .replace("{schema}", &self.schema)
            .replace("{question}", question.text());
        let reply = self.generator.complete(&prompt).await?;
        let query = cypher::extract_cypher(&reply)
            .ok_or_else(|| RagError::malformed("cypher", "empty reply"))?;
        cypher::ensure_read_only(&query)?;
        Ok(query)
    }

    async fn query_rows(&self, question: &Question) -> Result<Vec<Row>> {
        let query = self.generate_query(question).await?;
        debug!(query = %query, "generated cypher");
        self.backend.run(&query).await
    }

    /// Graph evidence for the question. Invalid queries and graph failures
    /// yield the "unknown" evidence, never an error.
    pub async fn evaluate(&self, question: &Question) -> Result<GraphEvidence> {
        let rows = match self.query_rows(question).await {
            Ok(rows) => rows,
            Err(e) if is_recoverable(&e) => {
                warn!(error = %e, "graph query failed, treating as no evidence");
                vec![]
            }
            Err(e) => return Err(e),
        };

        let rows: Vec<Row> = rows
            .into_iter()
            .filter(|r| r.values().any(|v| !v.is_null()))
            .collect();
        if rows.is_empty() {
            info!("graph returned no rows");
            return Ok(GraphEvidence::unknown(question));
        }

        let documents = regulation_documents(&rows);
        let rendered = serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string());
        let prompt = prompts::GRAPH_QA
            .replace("{question}", question.text())
            .replace("{context}", &rendered)
            .replace("{language}", question.language().name());

        let answer = match self.generator.complete(&prompt).await {
            Ok(a) if !a.trim().is_empty() => a.trim().to_string(),
            Ok(_) => rendered.clone(),
            Err(e) if is_recoverable(&e) => {
                warn!(error = %e, "graph answer generation failed, using raw rows");
                rendered.clone()
            }
            Err(e) => return Err(e),
        };

        let text = with_missing_relations(answer, &documents, question);
        info!(rows = rows.len(), regulations = documents.len(), "graph evidence ready");
        Ok(GraphEvidence {
            text,
            documents,
            found: true,
        })
    }
}

/// Append the regulation identifiers the answer left out, so revoking or
/// amending regulations found in the graph are always named.
fn with_missing_relations(answer: String, documents: &[Document], question: &Question) -> String {
    let citations = collect_citations(documents);
    let missing: Vec<String> = unmentioned(&answer, &citations)
        .into_iter()
        .map(|c| c.to_markdown())
        .collect();
    if missing.is_empty() {
        return answer;
    }
    format!(
        "{}\n\n{}: {}",
        answer,
        prompts::related_heading(question.language()),
        missing.join(", ")
    )
}

/// Regulation numbers have the form `7/33/PBI/2005` or `POJK 11/2022`.
fn looks_like_regulation_number(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty() && s.len() <= 64 && s.contains('/') && s.chars().any(|c| c.is_ascii_digit())
}

fn collect_regulations(value: &Value, column: &str, out: &mut Vec<Document>) {
    match value {
        Value::Object(node) => {
            if node.get("nomor_ketentuan").and_then(Value::as_str).is_some() {
                let content = node
                    .get("judul_ketentuan")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                out.push(Document::new(content, node.clone()));
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_regulations(item, column, out);
            }
        }
        Value::String(s) if looks_like_regulation_number(s) => {
            let mut metadata = Map::new();
            metadata.insert("nomor_ketentuan".into(), Value::String(s.trim().to_string()));
            metadata.insert("relation".into(), Value::String(column.to_string()));
            out.push(Document::new("", metadata));
        }
        _ => {}
    }
}

/// Documents for every regulation appearing in the rows, deduplicated by
/// identifier with node-backed entries (which carry URLs) preferred.
fn regulation_documents(rows: &[Row]) -> Vec<Document> {
    let mut found = Vec::new();
    for row in rows {
        for (column, value) in row {
            collect_regulations(value, column, &mut found);
        }
    }
    found.sort_by_key(|d| d.file_url().is_none());
    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|d| d.regulation_id().is_some_and(|id| seen.insert(id)))
        .collect()
}
