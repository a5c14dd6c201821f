use anyhow::Result;

use crate::error::RagError;

/// Clauses that modify the graph. Generated queries must be read-only.
const WRITE_CLAUSES: &[&str] = &["CREATE", "MERGE", "DELETE", "DETACH", "SET", "REMOVE", "DROP"];

/// Pull the Cypher statement out of a model reply. Fenced blocks are
/// preferred; a bare reply is taken as the statement itself.
pub fn extract_cypher(reply: &str) -> Option<String> {
    let patterns = ["```cypher", "```sql", "```"];
    let mut best_start = None;

    for pat in &patterns {
        if let Some(idx) = reply.find(pat) {
            match best_start {
                None => best_start = Some((idx, pat.len())),
                Some((prev, _)) if idx < prev => best_start = Some((idx, pat.len())),
                _ => {}
            }
        }
    }

    let code = match best_start {
        Some((start_idx, pat_len)) => {
            let after_tag = &reply[start_idx + pat_len..];
            let code_start = after_tag.find('\n').map(|i| i + 1).unwrap_or(0);
            let code_region = &after_tag[code_start..];
            let end = code_region.find("```").unwrap_or(code_region.len());
            code_region[..end].trim()
        }
        None => reply
            .trim()
            .trim_start_matches("Cypher:")
            .trim_start_matches("cypher")
            .trim(),
    };

    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

/// Remove quoted literals so words inside property values are not read as clauses.
fn without_literals(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    for c in query.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' || c == '`' => quote = Some(c),
            None => out.push(c),
        }
    }
    out
}

/// Validate that a generated statement is a read-only query.
pub fn ensure_read_only(query: &str) -> Result<()> {
    let stripped = without_literals(query).to_uppercase();
    let words: Vec<&str> = stripped
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();

    if let Some(clause) = words.iter().find(|w| WRITE_CLAUSES.contains(*w)) {
        return Err(RagError::malformed("cypher", format!("write clause {}", clause)).into());
    }
    if words.windows(2).any(|w| w[0] == "LOAD" && w[1] == "CSV") {
        return Err(RagError::malformed("cypher", "LOAD CSV is not allowed").into());
    }
    if !words.contains(&"RETURN") {
        return Err(RagError::malformed("cypher", "statement has no RETURN").into());
    }
    Ok(())
}
