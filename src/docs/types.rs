use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata keys that carry a regulation identifier, in lookup order.
/// OJK/BI corpora use `regulation_number`; SIKEPO uses `nomor_ketentuan`.
const IDENTIFIER_KEYS: &[&str] = &["regulation_number", "nomor_ketentuan", "title"];
const URL_KEYS: &[&str] = &["file_url", "url", "file_link"];

/// A retrieval result: opaque text plus backend metadata. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(content: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            content: content.into(),
            metadata,
        }
    }

    /// Content-addressed identity (blake3), used for exact-duplicate detection.
    pub fn content_hash(&self) -> blake3::Hash {
        blake3::hash(self.content.as_bytes())
    }

    fn meta_str(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| match self.metadata.get(*k) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn regulation_id(&self) -> Option<String> {
        self.meta_str(IDENTIFIER_KEYS)
    }

    pub fn file_url(&self) -> Option<String> {
        self.meta_str(URL_KEYS)
    }

    /// Page numbers arrive as ints, floats (`3.0`) or strings depending on the indexer.
    pub fn page_number(&self) -> Option<u32> {
        match self.metadata.get("page_number")? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f as u64))
                .map(|p| p as u32),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as u32),
            _ => None,
        }
    }

    /// The citation this document supports, if it names a regulation.
    pub fn citation(&self) -> Option<Citation> {
        Some(Citation {
            regulation_id: self.regulation_id()?,
            url: self.file_url(),
            page: self.page_number(),
        })
    }
}

/// A vector hit: the document, its stored embedding, and the backend score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub embedding: Vec<f32>,
    pub score: f32,
}

/// A reference to a regulation backing an answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub regulation_id: String,
    pub url: Option<String>,
    pub page: Option<u32>,
}

impl Citation {
    /// Page fragments only apply to paginated (PDF) locators.
    pub fn locator(&self) -> Option<String> {
        let url = self.url.as_ref()?;
        match self.page {
            Some(page) if url.to_lowercase().ends_with(".pdf") => {
                Some(format!("{}#page={}", url, page))
            }
            _ => Some(url.clone()),
        }
    }

    /// `[regulation_number](file_url)` or `[regulation_number](file_url#page=N)`;
    /// the bare identifier when no locator is known.
    pub fn to_markdown(&self) -> String {
        match self.locator() {
            Some(locator) => format!("[{}]({})", self.regulation_id, locator),
            None => self.regulation_id.clone(),
        }
    }
}

/// The synthesized answer returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub text: String,
    pub citations: Vec<Citation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(meta: Value) -> Document {
        Document::new("isi", meta.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_citation_from_ojk_metadata() {
        let d = doc(json!({
            "regulation_number": "POJK 11/2022",
            "file_url": "https://ojk.go.id/pojk-11-2022.pdf",
            "page_number": 4.0,
        }));
        let c = d.citation().unwrap();
        assert_eq!(c.regulation_id, "POJK 11/2022");
        assert_eq!(
            c.to_markdown(),
            "[POJK 11/2022](https://ojk.go.id/pojk-11-2022.pdf#page=4)"
        );
    }

    #[test]
    fn test_citation_from_sikepo_metadata_without_url() {
        let d = doc(json!({ "nomor_ketentuan": "7/33/PBI/2005" }));
        let c = d.citation().unwrap();
        assert_eq!(c.to_markdown(), "7/33/PBI/2005");
    }

    #[test]
    fn test_page_ignored_for_html_locator() {
        let c = Citation {
            regulation_id: "SEOJK 3/2023".into(),
            url: Some("https://ojk.go.id/seojk-3".into()),
            page: Some(2),
        };
        assert_eq!(c.to_markdown(), "[SEOJK 3/2023](https://ojk.go.id/seojk-3)");
    }

    #[test]
    fn test_no_identifier_no_citation() {
        assert!(doc(json!({ "file_url": "https://bi.go.id/x.pdf" }))
            .citation()
            .is_none());
    }
}
