pub mod citations;
pub mod types;

use serde_json::Value;

pub use types::{Citation, Document, FinalAnswer, ScoredDocument};

/// Indexer bookkeeping keys that are noise to the model.
const HIDDEN_METADATA: &[&str] = &[
    "file_name",
    "file_id",
    "standardized_file_name",
    "standardized_extracted_file_name",
];

/// Render documents as the JSON context block handed to the model:
/// `[{"metadata": {...}, "page_content": "..."}, ...]`.
pub fn render_context(docs: &[Document]) -> String {
    let list: Vec<Value> = docs
        .iter()
        .map(|d| {
            let mut metadata = d.metadata.clone();
            for key in HIDDEN_METADATA {
                metadata.remove(*key);
            }
            serde_json::json!({
                "metadata": metadata,
                "page_content": d.content,
            })
        })
        .collect();
    serde_json::to_string_pretty(&list).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_context_hides_file_name() {
        let d = Document::new(
            "Bank wajib melaporkan.",
            json!({ "file_name": "a.pdf", "regulation_number": "POJK 1/2020" })
                .as_object()
                .cloned()
                .unwrap(),
        );
        let rendered = render_context(&[d]);
        assert!(rendered.contains("POJK 1/2020"));
        assert!(rendered.contains("Bank wajib melaporkan."));
        assert!(!rendered.contains("a.pdf"));
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_context(&[]), "[]");
    }
}
