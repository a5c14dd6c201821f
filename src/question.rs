use serde::{Deserialize, Serialize};

/// Function words that tell Indonesian from English. Corpus vocabulary
/// ("peraturan", "ketentuan") counts too since English questions quote it
/// less often than they use "regulation".
const INDONESIAN_MARKERS: &[&str] = &[
    "apa", "apakah", "yang", "dan", "untuk", "dengan", "dari", "ini", "itu", "tidak", "masih",
    "berlaku", "bagaimana", "adalah", "dalam", "atau", "siapa", "kapan", "mengapa", "jelaskan",
    "tentang", "peraturan", "ketentuan", "mengenai", "oleh", "sudah", "belum", "bisa", "saja",
    "tersebut", "terkait", "dicabut", "diubah", "pasal", "nomor",
];

const ENGLISH_MARKERS: &[&str] = &[
    "the", "is", "are", "what", "which", "how", "of", "and", "to", "does", "do", "still",
    "valid", "regulation", "regulations", "about", "for", "with", "this", "that", "explain",
    "who", "when", "why", "has", "been", "revoked", "amended", "article", "number", "can",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    Indonesian,
    English,
}

impl Language {
    /// Score both marker lists; ties resolve to Indonesian, the corpora's language.
    pub fn detect(text: &str) -> Self {
        let mut id_score = 0usize;
        let mut en_score = 0usize;
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            let word = word.to_lowercase();
            if INDONESIAN_MARKERS.contains(&word.as_str()) {
                id_score += 1;
            }
            if ENGLISH_MARKERS.contains(&word.as_str()) {
                en_score += 1;
            }
        }
        if en_score > id_score {
            Language::English
        } else {
            Language::Indonesian
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Language::Indonesian => "Indonesian",
            Language::English => "English",
        }
    }
}

/// A user question. The language is detected once from the raw input and
/// carried through rewrites so the answer matches what the user typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    text: String,
    language: Language,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let language = Language::detect(&text);
        Self { text, language }
    }

    pub fn with_language(text: impl Into<String>, language: Language) -> Self {
        Self {
            text: text.into(),
            language,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// A rewritten form of this question, keeping the detected language.
    pub fn rephrased(&self, text: impl Into<String>) -> Self {
        Self::with_language(text, self.language)
    }
}
