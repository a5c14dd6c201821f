use std::collections::HashSet;

use super::types::{Citation, Document};

/// A markdown link `[label](target)` found in generated text.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub label: String,
    pub target: String,
    /// Byte range of the whole link in the source text.
    pub span: (usize, usize),
}

/// Unique citations supported by the documents, in document order.
/// A regulation cited by several chunks is listed once, at its best rank.
pub fn collect_citations(docs: &[Document]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    docs.iter()
        .filter_map(Document::citation)
        .filter(|c| seen.insert(c.regulation_id.clone()))
        .collect()
}

/// Find every `[label](target)` link in the text.
pub fn extract_links(text: &str) -> Vec<Link> {
    let mut links = Vec::new();
    let mut from = 0;

    while let Some(rel) = text[from..].find('[') {
        let open = from + rel;
        let Some(close_rel) = text[open..].find("](") else {
            break;
        };
        let close = open + close_rel;
        let label = &text[open + 1..close];
        // A nested bracket means the first '[' was not a link opener
        if label.contains(['[', ']', '\n']) {
            from = open + 1;
            continue;
        }
        let target_start = close + 2;
        let Some(end_rel) = text[target_start..].find(')') else {
            break;
        };
        let end = target_start + end_rel;
        let target = &text[target_start..end];
        if !target.contains(char::is_whitespace) {
            links.push(Link {
                label: label.to_string(),
                target: target.to_string(),
                span: (open, end + 1),
            });
        }
        from = end + 1;
    }

    links
}

/// Strip the `#page=` fragment so locators compare by document.
fn base_locator(target: &str) -> &str {
    target.split('#').next().unwrap_or(target)
}

/// Identifiers compare without case, emphasis markers or extra spacing.
fn normalize_identifier(label: &str) -> String {
    label
        .trim_matches(|c: char| c == '*' || c == '_' || c == '`' || c.is_whitespace())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Unlink every link that does not pair a supplied identifier with that
/// same citation's locator. The label text is kept; only the link is removed.
/// Returns the cleaned text and the number of links removed.
pub fn strip_unsupported_links(text: &str, citations: &[Citation]) -> (String, usize) {
    let allowed: HashSet<(String, &str)> = citations
        .iter()
        .filter_map(|c| Some((normalize_identifier(&c.regulation_id), base_locator(c.url.as_deref()?))))
        .collect();

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut removed = 0;

    for link in extract_links(text) {
        let supported = allowed.contains(&(normalize_identifier(&link.label), base_locator(&link.target)));
        if !link.target.starts_with("http") || supported {
            continue;
        }
        out.push_str(&text[cursor..link.span.0]);
        out.push_str(&link.label);
        cursor = link.span.1;
        removed += 1;
    }
    out.push_str(&text[cursor..]);
    (out, removed)
}

/// Start of a `[` that could still become a link once more text arrives.
fn pending_link_start(text: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = text[from..].find('[') {
        let open = from + rel;
        let rest = &text[open + 1..];
        let Some(close) = rest.find(']') else {
            if rest.contains(['[', '\n']) {
                from = open + 1;
                continue;
            }
            return Some(open);
        };
        let label = &rest[..close];
        let after = &rest[close + 1..];
        if label.contains(['[', '\n']) || !(after.is_empty() || after.starts_with('(')) {
            from = open + 1;
            continue;
        }
        let Some(target) = after.strip_prefix('(') else {
            return Some(open);
        };
        match target.find(')') {
            Some(end) => from = open + 1 + close + 2 + end + 1,
            None if target.contains(char::is_whitespace) => from = open + 1,
            None => return Some(open),
        }
    }
    None
}

/// Releases streamed text only once every link in it is complete, with
/// unsupported links already unlinked.
pub struct LinkGuard {
    citations: Vec<Citation>,
    pending: String,
    removed: usize,
}

impl LinkGuard {
    pub fn new(citations: Vec<Citation>) -> Self {
        Self {
            citations,
            pending: String::new(),
            removed: 0,
        }
    }

    /// Text safe to show after this fragment; may be empty.
    pub fn push(&mut self, fragment: &str) -> String {
        self.pending.push_str(fragment);
        let cut = pending_link_start(&self.pending).unwrap_or(self.pending.len());
        let ready: String = self.pending.drain(..cut).collect();
        self.clean(&ready)
    }

    /// Whatever was held back, and how many links were removed in total.
    pub fn finish(mut self) -> (String, usize) {
        let rest = std::mem::take(&mut self.pending);
        let text = self.clean(&rest);
        (text, self.removed)
    }

    fn clean(&mut self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let (clean, removed) = strip_unsupported_links(text, &self.citations);
        self.removed += removed;
        clean
    }
}

/// Citations whose identifier does not appear anywhere in the answer text.
pub fn unmentioned<'a>(text: &str, citations: &'a [Citation]) -> Vec<&'a Citation> {
    let lower = text.to_lowercase();
    citations
        .iter()
        .filter(|c| !lower.contains(&c.regulation_id.to_lowercase()))
        .collect()
}
