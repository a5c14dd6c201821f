//! Sequential cascade over answer sources, gated by a responsiveness check.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::prompts;
use super::synthesize::{EvidenceBundle, Synthesizer};
use crate::docs::{Document, FinalAnswer};
use crate::error::RagError;
use crate::llm::Generator;
use crate::question::Question;
use crate::retrieval::fusion::{FusionSettings, FusionUnit};

/// Phrases of answers that do not address the question.
const UNRESPONSIVE_PATTERNS: &[&str] = &[
    "i don't have the ability",
    "i cannot access",
    "i apologize",
    "i'm unable to",
    "i can't access",
    "don't have access",
    "i don't know",
    "i do not know",
    "no relevant information",
    "does not contain specific",
    "there is no mention",
    "not contain content related",
    "is not available in the provided context",
    "informasi tersebut tidak ditemukan",
    "tidak ditemukan dalam konteks",
    "tidak tersedia dalam konteks",
    "tidak ada informasi",
    "saya tidak tahu",
    "tidak dapat menemukan",
    "tidak memiliki informasi",
    "konteks yang diberikan tidak",
];

/// Whether a drafted answer addresses the question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Yes,
    No,
}

impl Verdict {
    /// The first word decides; anything but YES (or "ya") is NO.
    pub fn parse(raw: &str) -> Self {
        let first = raw
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_uppercase();
        match first.as_str() {
            "YES" | "YA" => Verdict::Yes,
            _ => Verdict::No,
        }
    }
}

/// Text up to the first sentence break.
fn opening_sentence(answer: &str) -> &str {
    let answer = answer.trim();
    [". ", "! ", "? ", "\n"]
        .iter()
        .filter_map(|end| answer.find(end))
        .min()
        .map_or(answer, |i| &answer[..i])
}

/// Heuristic pre-check: an answer opening with refusal or not-found phrasing
/// is judged NO without asking the classifier.
pub fn looks_unresponsive(answer: &str) -> bool {
    let opening = opening_sentence(answer).to_lowercase();
    opening.is_empty() || UNRESPONSIVE_PATTERNS.iter().any(|p| opening.contains(p))
}

pub struct ResponsivenessJudge {
    generator: Arc<dyn Generator>,
}

impl ResponsivenessJudge {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    pub async fn judge(&self, question: &Question, answer: &str) -> Verdict {
        if looks_unresponsive(answer) {
            return Verdict::No;
        }
        let prompt = prompts::RESPONSIVENESS
            .replace("{question}", question.text())
            .replace("{answer}", answer);
        match self.generator.complete(&prompt).await {
            Ok(raw) => Verdict::parse(&raw),
            Err(e) => {
                warn!(error = %e, "responsiveness check failed, treating as NO");
                Verdict::No
            }
        }
    }
}

/// One corpus in the cascade: how to retrieve and how to answer from it.
pub struct AnswerSource {
    pub name: String,
    pub fusion: Arc<FusionUnit>,
    pub synthesizer: Arc<Synthesizer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub source: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone)]
pub struct EscalationOutcome {
    pub answer: FinalAnswer,
    /// The accepted source, `None` on fallback.
    pub source: Option<String>,
    /// Documents behind the accepted answer.
    pub context: Vec<Document>,
    pub attempts: Vec<Attempt>,
}

enum State {
    Try(usize),
    Accept {
        index: usize,
        answer: FinalAnswer,
        context: Vec<Document>,
    },
    Fallback,
}

pub struct EscalationChain {
    sources: Vec<AnswerSource>,
    judge: ResponsivenessJudge,
}

impl EscalationChain {
    pub fn new(sources: Vec<AnswerSource>, judge: ResponsivenessJudge) -> Self {
        Self { sources, judge }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }

    /// Try sources in configured order and stop at the first responsive
    /// answer. Later sources are never queried. Synthesis failures abort, and
    /// so does `cancel` before the next source is tried.
    pub async fn answer(
        &self,
        question: &Question,
        settings: &FusionSettings,
        cancel: &CancellationToken,
    ) -> Result<EscalationOutcome> {
        let mut attempts = Vec::new();
        let mut state = State::Try(0);

        loop {
            state = match state {
                State::Try(_) if cancel.is_cancelled() => {
                    info!(tried = attempts.len(), "client gone, escalation stopped");
                    return Err(RagError::Cancelled.into());
                }
                State::Try(i) if i >= self.sources.len() => State::Fallback,
                State::Try(i) => {
                    let source = &self.sources[i];
                    let documents = source.fusion.fuse(question, settings).await?;
                    let evidence = EvidenceBundle::from_documents(documents);
                    let draft = source.synthesizer.synthesize(question, &evidence).await?;
                    let verdict = self.judge.judge(question, &draft.text).await;
                    info!(
                        source = %source.name,
                        documents = evidence.documents.len(),
                        verdict = ?verdict,
                        "escalation attempt"
                    );
                    attempts.push(Attempt {
                        source: source.name.clone(),
                        verdict,
                    });
                    match verdict {
                        Verdict::Yes => State::Accept {
                            index: i,
                            answer: draft,
                            context: evidence.documents,
                        },
                        Verdict::No => State::Try(i + 1),
                    }
                }
                State::Accept {
                    index,
                    answer,
                    context,
                } => {
                    return Ok(EscalationOutcome {
                        answer,
                        source: Some(self.sources[index].name.clone()),
                        context,
                        attempts,
                    });
                }
                State::Fallback => {
                    info!(tried = attempts.len(), "no responsive source, falling back");
                    return Ok(EscalationOutcome {
                        answer: FinalAnswer {
                            text: prompts::fallback_answer(question.language()).to_string(),
                            citations: vec![],
                        },
                        source: None,
                        context: vec![],
                        attempts,
                    });
                }
            };
        }
    }
}
