use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tracing::{info, warn};

use super::session_key;
use crate::chain::{ChatRequest, ChatResponse, StreamEvent};
use crate::state::Context;

/// Discord rejects messages over 2000 chars.
const MESSAGE_LIMIT: usize = 1990;
/// Minimum gap between edits of the streaming reply.
const EDIT_INTERVAL: Duration = Duration::from_millis(1200);

/// Ask a question about OJK, BI and SIKEPO regulations
#[poise::command(slash_command, guild_only)]
pub async fn ask(
    ctx: Context<'_>,
    #[description = "Your question (Indonesian or English)"] question: String,
    #[description = "Show route and source (admin only)"] debug: Option<bool>,
) -> Result<(), anyhow::Error> {
    let show_debug = debug.unwrap_or(false) && ctx.data().is_admin(ctx.author().id.get());
    let key = session_key(&ctx);
    let request = ChatRequest {
        question: question.clone(),
        user_id: key.user_id,
        conversation_id: key.conversation_id,
    };
    info!(user = ctx.author().name, question, "ask started");

    let reply = ctx.say("Mencari regulasi terkait…").await?;
    let mut events = ctx.data().pipeline.ask_stream(request);
    let mut interpreted = None;
    let mut partial = String::new();
    let mut last_edit = Instant::now();

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Rewritten { question: rewritten } => {
                if rewritten.trim() != question.trim() {
                    interpreted = Some(rewritten);
                }
            }
            StreamEvent::Answer { answer } => {
                partial.push_str(&answer);
                if last_edit.elapsed() >= EDIT_INTERVAL {
                    let preview = format!("{}▌", tail(&partial, MESSAGE_LIMIT - 4));
                    if let Err(e) = reply.edit(ctx, poise::CreateReply::default().content(preview)).await {
                        warn!(error = %e, "streaming edit failed");
                    }
                    last_edit = Instant::now();
                }
            }
            StreamEvent::Done { response } => {
                info!(
                    route = response.route.label(),
                    source = ?response.source,
                    citations = response.citations.len(),
                    "ask complete"
                );
                let full = render(&response, interpreted.as_deref(), show_debug);
                let mut parts = chunks(&full).into_iter();
                let first = parts.next().unwrap_or_default();
                reply
                    .edit(ctx, poise::CreateReply::default().content(first))
                    .await?;
                for part in parts {
                    ctx.say(part).await?;
                }
                return Ok(());
            }
            StreamEvent::Error { message } => {
                reply
                    .edit(
                        ctx,
                        poise::CreateReply::default()
                            .content(format!("Maaf, terjadi kesalahan saat menyusun jawaban: {}", message)),
                    )
                    .await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

fn render(response: &ChatResponse, interpreted: Option<&str>, show_debug: bool) -> String {
    let mut full = String::new();
    if let Some(q) = interpreted {
        full.push_str(&format!("_{}_\n\n", q));
    }
    full.push_str(&response.answer);

    if !response.citations.is_empty() {
        full.push_str("\n\n**Sumber:**\n");
        for citation in &response.citations {
            full.push_str(&format!("- {}\n", citation.to_markdown()));
        }
    }

    if show_debug {
        full.push_str(&format!(
            "\n---\n**[Debug]** route `{}` | source `{}` | context {} doc(s)",
            response.route.label(),
            response.source.as_deref().unwrap_or("-"),
            response.context.len()
        ));
    }
    full
}

/// The last `max` bytes of `text`, on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Split into Discord-sized pieces, preferring line then word breaks.
fn chunks(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let mut limit = remaining.len().min(MESSAGE_LIMIT);
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|i| i + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        out.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::router::RouteDecision;
    use crate::docs::Citation;

    #[test]
    fn test_chunks_respect_limit_and_keep_text() {
        let text = "kata ".repeat(900);
        let parts = chunks(&text);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.len() <= MESSAGE_LIMIT));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_chunks_multibyte() {
        let text = "é".repeat(1500);
        let parts = chunks(&text);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_tail_on_char_boundary() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("aébc", 3), "bc");
    }

    #[test]
    fn test_render_lists_sources() {
        let response = ChatResponse {
            rewritten_question: "Apakah PBI 7/33/PBI/2005 masih berlaku?".into(),
            answer: "Sudah dicabut.".into(),
            context: vec![],
            citations: vec![Citation {
                regulation_id: "11/8/PBI/2009".into(),
                url: Some("https://bi.go.id/a.pdf".into()),
                page: Some(3),
            }],
            route: RouteDecision::HistoryValidity,
            source: None,
        };
        let text = render(&response, Some("Apakah PBI 7/33/PBI/2005 masih berlaku?"), false);
        assert!(text.starts_with("_Apakah"));
        assert!(text.contains("- [11/8/PBI/2009](https://bi.go.id/a.pdf#page=3)"));
        assert!(!text.contains("[Debug]"));
    }
}
