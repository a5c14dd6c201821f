use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use super::prompts;
use crate::docs::citations::{collect_citations, strip_unsupported_links};
use crate::docs::{render_context, Document, FinalAnswer};
use crate::error::RagError;
use crate::graph::GraphEvidence;
use crate::llm::{Generator, TextStream};
use crate::question::Question;

/// The material backing one candidate answer.
#[derive(Debug, Clone, Default)]
pub struct EvidenceBundle {
    /// Context block handed to the model.
    pub context: String,
    /// Documents the context was built from. Citations come only from here.
    pub documents: Vec<Document>,
}

impl EvidenceBundle {
    pub fn from_documents(documents: Vec<Document>) -> Self {
        if documents.is_empty() {
            return Self::default();
        }
        Self {
            context: render_context(&documents),
            documents,
        }
    }

    /// Graph answer first, retrieved documents as supplement.
    pub fn record_track(graph: GraphEvidence, documents: Vec<Document>) -> Self {
        if !graph.found && documents.is_empty() {
            return Self::default();
        }
        let structured = if graph.found { graph.text.as_str() } else { "" };
        let context = prompts::RECORD_TRACK_CONTEXT
            .replace("{structured}", structured)
            .replace("{unstructured}", &render_context(&documents));
        let mut all = graph.documents;
        all.extend(documents);
        Self {
            context,
            documents: all,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.context.trim().is_empty()
    }
}

/// Produces cited answers from one corpus' evidence.
pub struct Synthesizer {
    generator: Arc<dyn Generator>,
    /// How the corpus names its identifier field, for the prompt.
    identifier_hint: &'static str,
}

impl Synthesizer {
    pub fn new(generator: Arc<dyn Generator>, identifier_hint: &'static str) -> Self {
        Self {
            generator,
            identifier_hint,
        }
    }

    fn prompt(&self, question: &Question, evidence: &EvidenceBundle) -> String {
        prompts::QA
            .replace("{language}", question.language().name())
            .replace("{identifier_hint}", self.identifier_hint)
            .replace("{question}", question.text())
            .replace("{context}", &evidence.context)
    }

    /// The explicit answer for empty evidence; no model call, no citations.
    pub fn not_found(question: &Question) -> FinalAnswer {
        FinalAnswer {
            text: prompts::not_found_answer(question.language()).to_string(),
            citations: vec![],
        }
    }

    pub async fn synthesize(&self, question: &Question, evidence: &EvidenceBundle) -> Result<FinalAnswer> {
        if evidence.is_empty() {
            debug!("empty evidence, answering not found");
            return Ok(Self::not_found(question));
        }
        let text = self
            .generator
            .complete(&self.prompt(question, evidence))
            .await
            .map_err(|e| RagError::Synthesis(e.to_string()))?;
        Ok(self.finalize(&text, evidence))
    }

    /// Token stream for non-empty evidence. The caller collects the text and
    /// passes it to `finalize`.
    pub async fn stream(&self, question: &Question, evidence: &EvidenceBundle) -> Result<TextStream> {
        self.generator
            .stream(&self.prompt(question, evidence))
            .await
            .map_err(|e| RagError::Synthesis(e.to_string()).into())
    }

    /// Attach the evidence citations and unlink any locator the evidence
    /// does not contain.
    pub fn finalize(&self, text: &str, evidence: &EvidenceBundle) -> FinalAnswer {
        let citations = collect_citations(&evidence.documents);
        let (text, removed) = strip_unsupported_links(text.trim(), &citations);
        if removed > 0 {
            warn!(removed, "removed links not backed by the evidence");
        }
        FinalAnswer { text, citations }
    }
}
