use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::prompts;
use crate::llm::Generator;
use crate::question::Question;

/// Which downstream path answers a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    /// Validity and amendment history ("rekam jejak").
    HistoryValidity,
    /// Content of the regulations ("ketentuan terkait"). The default.
    SubstantiveExplanation,
}

impl RouteDecision {
    pub fn label(&self) -> &'static str {
        match self {
            RouteDecision::HistoryValidity => "rekam_jejak",
            RouteDecision::SubstantiveExplanation => "ketentuan_terkait",
        }
    }

    /// Only an unambiguous `rekam_jejak` label selects the validity path;
    /// anything else resolves to the substantive path.
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase().replace([' ', '-'], "_");
        let validity = normalized.contains("rekam_jejak");
        let substantive = normalized.contains("ketentuan_terkait");
        if validity && !substantive {
            RouteDecision::HistoryValidity
        } else {
            RouteDecision::SubstantiveExplanation
        }
    }
}

pub struct SourceRouter {
    generator: Arc<dyn Generator>,
}

impl SourceRouter {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    /// Never fails: a classifier error resolves to the default route.
    pub async fn route(&self, question: &Question) -> RouteDecision {
        let prompt = prompts::ROUTER.replace("{question}", question.text());
        let decision = match self.generator.complete(&prompt).await {
            Ok(raw) => RouteDecision::parse(&raw),
            Err(e) => {
                warn!(error = %e, "router call failed, using default route");
                RouteDecision::SubstantiveExplanation
            }
        };
        info!(route = decision.label(), "question routed");
        decision
    }
}
