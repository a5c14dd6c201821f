//! Attribute-filtered retrieval: the model decomposes a question into a
//! search string plus a structured metadata filter, constrained to a
//! per-corpus whitelist of attributes.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{RetrievalStrategy, VectorSearchStrategy};
use crate::chain::prompts;
use crate::docs::ScoredDocument;
use crate::error::{is_recoverable, RagError};
use crate::llm::Generator;
use crate::question::Question;

/// Marker the model returns when no filter applies.
pub const NO_FILTER: &str = "NO_FILTER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contain,
}

impl Comparator {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "contain" | "like" => Self::Contain,
            _ => return None,
        })
    }

    fn is_ordering(&self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeFilter {
    Compare {
        attribute: String,
        comparator: Comparator,
        value: Value,
    },
    And(Vec<AttributeFilter>),
    Or(Vec<AttributeFilter>),
    Not(Box<AttributeFilter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Text,
    /// `YYYY/MM/DD`
    Date,
}

#[derive(Debug, Clone)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: AttributeKind,
}

/// The filterable attributes of one corpus.
#[derive(Debug, Clone)]
pub struct FilterSchema {
    pub content_description: &'static str,
    pub attributes: Vec<AttributeSpec>,
}

/// A decomposed question: what to embed and how to filter.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredQuery {
    pub query: String,
    pub filter: Option<AttributeFilter>,
}

fn text(name: &'static str, description: &'static str) -> AttributeSpec {
    AttributeSpec {
        name,
        description,
        kind: AttributeKind::Text,
    }
}

fn date(name: &'static str, description: &'static str) -> AttributeSpec {
    AttributeSpec {
        name,
        description,
        kind: AttributeKind::Date,
    }
}

impl FilterSchema {
    /// OJK and BI regulation corpora share one metadata layout.
    pub fn regulations() -> Self {
        Self {
            content_description: "The content of the regulation document",
            attributes: vec![
                text("title", "The title of the regulation document (\"judul\")"),
                text("sector", "The sector of the regulation (\"sektor\")"),
                text("subsector", "The subsector of the regulation (\"subsektor\")"),
                text("regulation_type", "The type of the regulation (\"tipe regulasi\")"),
                text(
                    "regulation_number",
                    "The number of the regulation (\"nomor regulasi\")",
                ),
                date(
                    "effective_date",
                    "The effective date of the regulation (\"tanggal berlaku\")",
                ),
            ],
        }
    }

    /// SIKEPO provisions corpus.
    pub fn provisions() -> Self {
        Self {
            content_description: "Isi ketentuan dari peraturan",
            attributes: vec![
                text("jenis_ketentuan", "Jenis peraturan atau ketentuan"),
                text("judul_ketentuan", "Judul peraturan atau ketentuan"),
                text("kodifikasi_ketentuan", "Kategori kodifikasi ketentuan"),
                text("nomor_ketentuan", "Nomor dari ketentuan"),
                date("tanggal_ketentuan", "Tanggal ketika ketentuan diterbitkan"),
            ],
        }
    }

    fn attribute(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn prompt(&self, question: &str) -> String {
        let attributes = self
            .attributes
            .iter()
            .map(|a| {
                let kind = match a.kind {
                    AttributeKind::Text => "string",
                    AttributeKind::Date => "date, format YYYY/MM/DD",
                };
                format!("- {} ({}): {}", a.name, kind, a.description)
            })
            .collect::<Vec<_>>()
            .join("\n");
        prompts::QUERY_CONSTRUCTOR
            .replace("{content}", self.content_description)
            .replace("{attributes}", &attributes)
            .replace("{question}", question)
    }

    /// Parse and validate the model's structured query. Anything outside the
    /// grammar or the whitelist is a `MalformedOutput` error.
    pub fn parse(&self, raw: &str) -> Result<StructuredQuery> {
        let json = extract_json_object(raw)
            .ok_or_else(|| RagError::malformed("structured query", "no JSON object"))?;
        let value: Value = serde_json::from_str(json)
            .map_err(|e| RagError::malformed("structured query", e.to_string()))?;

        let query = value["query"].as_str().unwrap_or("").trim().to_string();
        let filter = match &value["filter"] {
            Value::Null => None,
            Value::String(s) if s.trim() == NO_FILTER => None,
            other => Some(self.parse_filter(other)?),
        };
        Ok(StructuredQuery { query, filter })
    }

    fn parse_filter(&self, value: &Value) -> Result<AttributeFilter> {
        let op = value["op"]
            .as_str()
            .ok_or_else(|| RagError::malformed("filter", "missing op"))?
            .to_lowercase();

        match op.as_str() {
            "and" | "or" | "not" => {
                let args = value["args"]
                    .as_array()
                    .ok_or_else(|| RagError::malformed("filter", format!("{} without args", op)))?
                    .iter()
                    .map(|a| self.parse_filter(a))
                    .collect::<Result<Vec<_>>>()?;
                match (op.as_str(), args.len()) {
                    (_, 0) => Err(RagError::malformed("filter", format!("empty {}", op)).into()),
                    ("not", 1) => Ok(AttributeFilter::Not(Box::new(
                        args.into_iter().next().ok_or_else(|| {
                            RagError::malformed("filter", "not without operand")
                        })?,
                    ))),
                    ("not", n) => Err(RagError::malformed(
                        "filter",
                        format!("not takes one operand, got {}", n),
                    )
                    .into()),
                    ("and", _) => Ok(AttributeFilter::And(args)),
                    _ => Ok(AttributeFilter::Or(args)),
                }
            }
            other => {
                let comparator = Comparator::parse(other)
                    .ok_or_else(|| RagError::malformed("filter", format!("unknown op {}", other)))?;
                let attribute = value["attribute"]
                    .as_str()
                    .ok_or_else(|| RagError::malformed("filter", "missing attribute"))?;
                let spec = self.attribute(attribute).ok_or_else(|| {
                    RagError::malformed("filter", format!("attribute {} not allowed", attribute))
                })?;
                let value = value
                    .get("value")
                    .cloned()
                    .filter(|v| v.is_string() || v.is_number())
                    .ok_or_else(|| RagError::malformed("filter", "missing scalar value"))?;

                match spec.kind {
                    AttributeKind::Date => {
                        let raw = value.as_str().unwrap_or_default();
                        if chrono::NaiveDate::parse_from_str(raw, "%Y/%m/%d").is_err() {
                            return Err(RagError::malformed(
                                "filter",
                                format!("{} value {:?} is not YYYY/MM/DD", attribute, raw),
                            )
                            .into());
                        }
                    }
                    AttributeKind::Text if comparator.is_ordering() => {
                        return Err(RagError::malformed(
                            "filter",
                            format!("ordering comparison on text attribute {}", attribute),
                        )
                        .into());
                    }
                    AttributeKind::Text => {}
                }

                Ok(AttributeFilter::Compare {
                    attribute: attribute.to_string(),
                    comparator,
                    value,
                })
            }
        }
    }
}

/// The outermost `{...}` span, which tolerates code fences and chatter.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Self-query strategy with a deterministic fallback to unfiltered search.
pub struct SelfQueryStrategy {
    name: String,
    generator: Arc<dyn Generator>,
    schema: FilterSchema,
    inner: VectorSearchStrategy,
}

impl SelfQueryStrategy {
    pub fn new(generator: Arc<dyn Generator>, schema: FilterSchema, inner: VectorSearchStrategy) -> Self {
        Self {
            name: format!("self-query/{}", inner.name()),
            generator,
            schema,
            inner,
        }
    }

    async fn construct(&self, question: &Question) -> Result<StructuredQuery> {
        let raw = self
            .generator
            .complete(&self.schema.prompt(question.text()))
            .await?;
        self.schema.parse(&raw)
    }

    async fn unfiltered(&self, question: &Question, reason: &anyhow::Error) -> Result<Vec<ScoredDocument>> {
        warn!(
            strategy = %self.name,
            error = %reason,
            "self-query failed, falling back to unfiltered search"
        );
        self.inner.search_text(question.text(), None).await
    }
}

#[async_trait]
impl RetrievalStrategy for SelfQueryStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, question: &Question) -> Result<Vec<ScoredDocument>> {
        let structured = match self.construct(question).await {
            Ok(s) => s,
            Err(e) if is_recoverable(&e) => return self.unfiltered(question, &e).await,
            Err(e) => return Err(e),
        };

        let query = if structured.query.is_empty() {
            question.text()
        } else {
            structured.query.as_str()
        };
        debug!(
            strategy = %self.name,
            query,
            filter = ?structured.filter,
            "structured query"
        );

        match &structured.filter {
            None => self.inner.search_text(query, None).await,
            Some(filter) => match self.inner.search_text(query, Some(filter)).await {
                Ok(hits) => Ok(hits),
                Err(e) if is_recoverable(&e) => self.unfiltered(question, &e).await,
                Err(e) => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::ScriptedGenerator;
    use crate::retrieval::testing::*;

    fn schema() -> FilterSchema {
        FilterSchema::regulations()
    }

    #[test]
    fn test_parse_no_filter() {
        let sq = schema()
            .parse(r#"{"query": "modal inti minimum", "filter": "NO_FILTER"}"#)
            .unwrap();
        assert_eq!(sq.query, "modal inti minimum");
        assert!(sq.filter.is_none());
    }

    #[test]
    fn test_parse_nested_filter_in_code_fence() {
        let raw = "```json\n{\"query\": \"kredit\", \"filter\": {\"op\": \"and\", \"args\": [\
            {\"op\": \"eq\", \"attribute\": \"sector\", \"value\": \"Perbankan\"},\
            {\"op\": \"gte\", \"attribute\": \"effective_date\", \"value\": \"2021/01/01\"}]}}\n```";
        let sq = schema().parse(raw).unwrap();
        match sq.filter {
            Some(AttributeFilter::And(args)) => assert_eq!(args.len(), 2),
            other => panic!("unexpected filter {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_attribute() {
        let raw = r#"{"query": "x", "filter": {"op": "eq", "attribute": "author", "value": "OJK"}}"#;
        assert!(schema().parse(raw).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_date() {
        let raw = r#"{"query": "x", "filter": {"op": "gt", "attribute": "effective_date", "value": "1 Januari 2021"}}"#;
        let err = schema().parse(raw).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RagError>(),
            Some(RagError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_ordering_on_text() {
        let raw = r#"{"query": "x", "filter": {"op": "lt", "attribute": "title", "value": "B"}}"#;
        assert!(schema().parse(raw).is_err());
    }

    #[test]
    fn test_prompt_lists_whitelist() {
        let p = FilterSchema::provisions().prompt("apa itu kodifikasi?");
        assert!(p.contains("nomor_ketentuan"));
        assert!(p.contains("apa itu kodifikasi?"));
    }

    fn strategy(reply: &str, backend: Arc<FakeBackend>) -> SelfQueryStrategy {
        let inner = VectorSearchStrategy::similarity(
            backend,
            Arc::new(ConstEmbedder(vec![1.0, 0.0])),
            4,
        );
        SelfQueryStrategy::new(
            Arc::new(ScriptedGenerator::new(vec![reply.to_string()])),
            schema(),
            inner,
        )
    }

    #[tokio::test]
    async fn test_invalid_filter_fails_closed_to_unfiltered() {
        let backend = Arc::new(FakeBackend::new(vec![scored("a", "A", vec![1.0, 0.0])]));
        let s = strategy(
            r#"{"query": "x", "filter": {"op": "eq", "attribute": "bogus", "value": 1}}"#,
            backend.clone(),
        );
        let hits = s.search(&Question::new("peraturan sektor perbankan")).await.unwrap();
        assert_eq!(hits.len(), 1);
        let seen = backend.seen_filters.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_none());
    }

    #[tokio::test]
    async fn test_backend_rejection_falls_back() {
        let mut fake = FakeBackend::new(vec![scored("a", "A", vec![1.0, 0.0])]);
        fake.reject_filters = true;
        let backend = Arc::new(fake);
        let s = strategy(
            r#"{"query": "kredit", "filter": {"op": "eq", "attribute": "sector", "value": "Perbankan"}}"#,
            backend.clone(),
        );
        let hits = s.search(&Question::new("kredit sektor perbankan")).await.unwrap();
        assert_eq!(hits.len(), 1);
        let seen = backend.seen_filters.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_some());
        assert!(seen[1].is_none());
    }
}
