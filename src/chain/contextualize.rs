use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use super::prompts;
use crate::error::is_recoverable;
use crate::history::{format_history, Turn};
use crate::llm::Generator;
use crate::question::Question;

/// Rewrites follow-up questions into standalone ones using the chat history.
pub struct Contextualizer {
    generator: Arc<dyn Generator>,
}

impl Contextualizer {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    /// Without history the question is already standalone and no model call
    /// is made. A failed rewrite keeps the original question.
    pub async fn rewrite(&self, question: &Question, history: &[Turn]) -> Result<Question> {
        if history.is_empty() {
            return Ok(question.clone());
        }

        let prompt = prompts::CONTEXTUALIZE
            .replace("{chat_history}", &format_history(history))
            .replace("{question}", question.text());

        let reply = match self.generator.complete(&prompt).await {
            Ok(reply) => reply,
            Err(e) if is_recoverable(&e) => {
                warn!(error = %e, "contextualization failed, using the question as asked");
                return Ok(question.clone());
            }
            Err(e) => return Err(e),
        };

        let rewritten = clean_reply(&reply);
        if rewritten.is_empty() {
            return Ok(question.clone());
        }
        debug!(original = question.text(), rewritten = %rewritten, "question contextualized");
        Ok(question.rephrased(rewritten))
    }
}

/// Drop echoed labels and wrapping quotes.
fn clean_reply(reply: &str) -> String {
    let mut text = reply.trim();
    for label in ["Standalone Question:", "Standalone question:"] {
        if let Some(rest) = text.strip_prefix(label) {
            text = rest.trim();
        }
    }
    text.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::ScriptedGenerator;
    use crate::question::Language;

    #[tokio::test]
    async fn test_no_history_no_model_call() {
        let generator = Arc::new(ScriptedGenerator::new(vec![]));
        let c = Contextualizer::new(generator.clone());
        let q = Question::new("Apa itu modal inti?");
        assert_eq!(c.rewrite(&q, &[]).await.unwrap(), q);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_follow_up_names_regulation() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            "Standalone Question: \"Apakah peraturan 7/33/PBI/2005 masih berlaku?\"".to_string(),
        ]));
        let c = Contextualizer::new(generator.clone());
        let history = vec![Turn::new(
            "Apa isi peraturan 7/33/PBI/2005?",
            "Peraturan 7/33/PBI/2005 mengatur pencabutan izin usaha bank.",
        )];
        let rewritten = c
            .rewrite(&Question::new("dan untuk yang itu?"), &history)
            .await
            .unwrap();
        assert_eq!(rewritten.text(), "Apakah peraturan 7/33/PBI/2005 masih berlaku?");
        assert_eq!(rewritten.language(), Language::Indonesian);
        assert!(generator.prompts()[0].contains("Human: Apa isi peraturan 7/33/PBI/2005?"));
    }

    #[tokio::test]
    async fn test_failed_rewrite_keeps_question() {
        // An exhausted script errors like an unavailable provider
        let c = Contextualizer::new(Arc::new(ScriptedGenerator::new(vec![])));
        let history = vec![Turn::new("a", "b")];
        let q = Question::new("dan yang itu?");
        assert_eq!(c.rewrite(&q, &history).await.unwrap(), q);
    }
}
