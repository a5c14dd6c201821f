mod ask;
mod config;
mod manage;

use crate::history::SessionKey;
use crate::state::Context;

/// A conversation is one Discord user in one channel or thread.
fn session_key(ctx: &Context<'_>) -> SessionKey {
    SessionKey::new(ctx.author().id.get().to_string(), ctx.channel_id().get().to_string())
}

/// Regbot - regulatory compliance assistant for OJK, BI and SIKEPO
#[poise::command(
    slash_command,
    subcommands(
        "ask::ask",
        "manage::clear",
        "manage::history",
        "manage::conversations",
        "manage::rename",
        "manage::thread",
        "config::config"
    )
)]
pub async fn regbot(_ctx: Context<'_>) -> Result<(), anyhow::Error> {
    Ok(())
}
