use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::RagError;

/// Lazily produced answer fragments. Finite and not restartable.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Text generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    async fn stream(&self, prompt: &str) -> Result<TextStream>;
}

/// Embedding capability. One vector per input text, same order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// OpenAI-compatible client for chat completions and embeddings.
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    sub_model: String,
    embedding_model: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn from_env() -> Result<Self> {
        let base_url = dotenv::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:1234/v1".to_string());
        let model = dotenv::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let sub_model = dotenv::var("LLM_SUB_MODEL").unwrap_or_else(|_| model.clone());
        let embedding_model = dotenv::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let api_key = dotenv::var("LLM_API_KEY").ok().filter(|k| !k.is_empty());
        let timeout_secs = dotenv::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(120);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            model,
            sub_model,
            embedding_model,
            api_key,
        })
    }

    /// Resolve an API route (`chat/completions`, `embeddings`) from the base URL.
    fn endpoint(&self, route: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/{}", base, route)
        } else {
            format!("{}/v1/{}", base, route)
        }
    }

    fn post(&self, route: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(self.endpoint(route)).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }

    /// Non-streaming chat completion.
    pub async fn chat(&self, messages: &[Message], model_override: Option<&str>) -> Result<String> {
        let model = model_override.unwrap_or(&self.model);
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": 0.0,
            "max_tokens": 2048,
        });

        let resp = self
            .post("chat/completions", &body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RagError::from_reqwest("llm", e))?;
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RagError::from_reqwest("llm", e))?;

        // choices[0].message.content may be null
        let content = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or("")
            .to_string();

        debug!(model, content_len = content.len(), "chat completion");
        Ok(content)
    }

    /// Streaming chat completion. Fragments arrive through a bounded channel;
    /// dropping the returned stream stops the reader task.
    pub async fn chat_stream(
        &self,
        messages: &[Message],
        model_override: Option<&str>,
    ) -> Result<TextStream> {
        let model = model_override.unwrap_or(&self.model);
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": 0.0,
            "max_tokens": 2048,
            "stream": true,
        });

        let resp = self
            .post("chat/completions", &body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RagError::from_reqwest("llm", e))?;

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let chunks = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| anyhow::Error::from(RagError::from_reqwest("llm", e))));
        tokio::spawn(forward_sse(chunks, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait]
impl Generator for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.chat(&[Message::user(prompt)], None).await
    }

    async fn stream(&self, prompt: &str) -> Result<TextStream> {
        self.chat_stream(&[Message::user(prompt)], None).await
    }
}

#[async_trait]
impl Embedder for LlmClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": texts,
        });
        let resp = self
            .post("embeddings", &body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RagError::from_reqwest("embedding", e))?;

        #[derive(Deserialize)]
        struct Item {
            index: usize,
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<Item>,
        }

        let mut parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| RagError::from_reqwest("embedding", e))?;
        if parsed.data.len() != texts.len() {
            return Err(RagError::malformed(
                "embedding response",
                format!("expected {} vectors, got {}", texts.len(), parsed.data.len()),
            )
            .into());
        }
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// Generator over the client's sub-model, used for the cheap classification
/// calls (routing, responsiveness verdicts, filter construction).
pub struct SubModel(pub Arc<LlmClient>);

#[async_trait]
impl Generator for SubModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.0
            .chat(&[Message::user(prompt)], Some(&self.0.sub_model))
            .await
    }

    async fn stream(&self, prompt: &str) -> Result<TextStream> {
        self.0
            .chat_stream(&[Message::user(prompt)], Some(&self.0.sub_model))
            .await
    }
}

enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseLine::Skip;
    };
    match json["choices"]
        .get(0)
        .and_then(|c| c["delta"]["content"].as_str())
    {
        Some(text) if !text.is_empty() => SseLine::Fragment(text.to_string()),
        _ => SseLine::Skip,
    }
}

/// Splits an SSE body into lines. Only complete lines are decoded, so a
/// character split across network chunks survives intact.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            lines.push(parse_sse_line(String::from_utf8_lossy(&line).trim()));
        }
        lines
    }

    /// The unterminated last line, if the body did not end with a newline.
    fn finish(&mut self) -> Option<SseLine> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Some(parse_sse_line(String::from_utf8_lossy(&line).trim()))
    }
}

/// Forward fragments until `[DONE]`. A body that ends without it is reported
/// as a failed synthesis, never as a short answer.
async fn forward_sse<S, B>(chunks: S, tx: mpsc::Sender<Result<String>>)
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut decoder = SseDecoder::default();
    while let Some(chunk) = chunks.next().await {
        let lines = match chunk {
            Ok(bytes) => decoder.push(bytes.as_ref()),
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        for line in lines {
            match line {
                SseLine::Fragment(text) => {
                    if tx.send(Ok(text)).await.is_err() {
                        debug!("stream consumer dropped, stop reading");
                        return;
                    }
                }
                SseLine::Done => return,
                SseLine::Skip => {}
            }
        }
    }
    match decoder.finish() {
        Some(SseLine::Done) => return,
        Some(SseLine::Fragment(text)) => {
            let _ = tx.send(Ok(text)).await;
        }
        _ => {}
    }
    warn!("model stream ended before [DONE]");
    let _ = tx
        .send(Err(RagError::Synthesis("model stream ended before [DONE]".into()).into()))
        .await;
}
