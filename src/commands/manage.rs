use poise::serenity_prelude as serenity;
use tracing::info;

use super::session_key;
use crate::state::Context;

/// Clear the history of this conversation, or of all your conversations
#[poise::command(slash_command, guild_only)]
pub async fn clear(
    ctx: Context<'_>,
    #[description = "Clear every conversation you have"] all: Option<bool>,
) -> Result<(), anyhow::Error> {
    let key = session_key(&ctx);
    let history = &ctx.data().history;
    if all.unwrap_or(false) {
        let removed = history.clear_user(&key.user_id).await?;
        info!(user = %key.user_id, removed, "cleared all conversations");
        ctx.say(format!("Cleared {} conversation(s).", removed)).await?;
    } else {
        history.clear(&key).await?;
        info!(session = %key, "conversation cleared");
        ctx.say("Conversation history cleared.").await?;
    }
    Ok(())
}

/// Start a new conversation in its own thread
#[poise::command(slash_command, guild_only)]
pub async fn thread(
    ctx: Context<'_>,
    #[description = "Thread name"] name: Option<String>,
) -> Result<(), anyhow::Error> {
    let thread_name = name.unwrap_or_else(|| format!("Regbot - {}", ctx.author().name));

    let thread = ctx
        .channel_id()
        .create_thread(
            ctx.http(),
            serenity::CreateThread::new(thread_name.clone()).kind(serenity::ChannelType::PublicThread),
        )
        .await?;

    ctx.say(format!(
        "Created thread <#{}>. Questions asked there share one history.",
        thread.id
    ))
    .await?;
    Ok(())
}

/// Show the remembered turns of this conversation
#[poise::command(slash_command, guild_only)]
pub async fn history(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let key = session_key(&ctx);
    let turns = ctx.data().history.get(&key).await?;
    if turns.is_empty() {
        ctx.say("No history in this conversation yet.").await?;
        return Ok(());
    }

    let mut out = format!(
        "**Last {} of up to {} turn(s):**\n",
        turns.len(),
        ctx.data().history.capacity()
    );
    for turn in &turns {
        out.push_str(&format!(
            "\n**Q:** {}\n**A:** {}\n",
            turn.question,
            preview(&turn.answer, 240)
        ));
    }
    ctx.say(preview(&out, 1990)).await?;
    Ok(())
}

/// List your conversations, most recent first
#[poise::command(slash_command, guild_only)]
pub async fn conversations(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let user_id = ctx.author().id.get().to_string();
    let list = ctx.data().history.list_conversations(&user_id).await?;
    if list.is_empty() {
        ctx.say("You have no conversations yet.").await?;
        return Ok(());
    }

    let mut out = String::from("**Your conversations:**\n");
    for c in list.iter().take(20) {
        out.push_str(&format!(
            "- <#{}> **{}** ({} turn(s), {})\n",
            c.conversation_id,
            c.title,
            c.turns,
            c.updated_at.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    ctx.say(out).await?;
    Ok(())
}

/// Rename this conversation
#[poise::command(slash_command, guild_only)]
pub async fn rename(
    ctx: Context<'_>,
    #[description = "New title"] title: String,
) -> Result<(), anyhow::Error> {
    let key = session_key(&ctx);
    match ctx.data().history.rename(&key, title.trim()).await {
        Ok(()) => ctx.say(format!("Conversation renamed to **{}**.", title.trim())).await?,
        Err(e) => ctx.say(format!("Could not rename: {}", e)).await?,
    };
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut)
}
