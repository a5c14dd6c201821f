use crate::state::{Context, PipelineConfig};

const TUNABLES: &str = "`top_n`, `redundancy_threshold`, `long_context_reorder`, `strategy_timeout_secs`";

/// Apply one runtime setting. Returns the confirmation text.
fn apply(config: &mut PipelineConfig, key: &str, value: &str) -> Result<String, String> {
    let invalid = |what: &str| format!("`{}` expects {}, got `{}`", key, what, value);
    match key {
        "top_n" => {
            let n = value.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| invalid("a positive integer"))?;
            config.top_n = n;
        }
        "redundancy_threshold" => {
            let t = value
                .parse::<f32>()
                .ok()
                .filter(|t| (0.0..=1.0).contains(t))
                .ok_or_else(|| invalid("a number between 0 and 1"))?;
            config.redundancy_threshold = t;
        }
        "long_context_reorder" => {
            config.long_context_reorder = value.parse::<bool>().map_err(|_| invalid("`true` or `false`"))?;
        }
        "strategy_timeout_secs" => {
            let secs = value.parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| invalid("a positive integer"))?;
            config.strategy_timeout_secs = secs;
        }
        "search_k" | "fetch_k" | "mmr_lambda" | "history_k" => {
            return Err(format!("`{}` is fixed at startup; set it in the environment.", key));
        }
        _ => return Err(format!("Unknown param `{}`. Valid: {}", key, TUNABLES)),
    }
    Ok(format!("`{}` set to {}", key, value))
}

/// Show or change retrieval settings (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn config(
    ctx: Context<'_>,
    #[description = "top_n | redundancy_threshold | long_context_reorder | strategy_timeout_secs"] param: Option<String>,
    #[description = "New value"] value: Option<String>,
) -> Result<(), anyhow::Error> {
    let user_id = ctx.author().id.get();
    if !ctx.data().is_admin(user_id) {
        ctx.say("This command is admin-only.").await?;
        return Ok(());
    }

    match (param.as_deref(), value) {
        (None, _) => {
            let config = ctx.data().config.read().await;
            ctx.say(format!(
                "**Pipeline configuration:**\n\
                 `top_n` (fused documents kept): {}\n\
                 `redundancy_threshold`: {}\n\
                 `long_context_reorder`: {}\n\
                 `strategy_timeout_secs`: {}\n\
                 _startup only:_ `search_k`: {} | `fetch_k`: {} | `mmr_lambda`: {} | `history_k`: {}\n\
                 _escalation order:_ {}",
                config.top_n,
                config.redundancy_threshold,
                config.long_context_reorder,
                config.strategy_timeout_secs,
                config.search_k,
                config.fetch_k,
                config.mmr_lambda,
                config.history_k,
                ctx.data().pipeline.escalation_order().join(" → ")
            ))
            .await?;
        }
        (Some(key), Some(val)) => {
            let result = {
                let mut config = ctx.data().config.write().await;
                apply(&mut config, key, val.trim())
            };
            match result {
                Ok(msg) => {
                    tracing::info!(user_id, key, value = %val, "pipeline config changed");
                    ctx.say(msg).await?
                }
                Err(msg) => ctx.say(msg).await?,
            };
        }
        (Some(_), None) => {
            ctx.say("Provide both `param` and `value`. Example: `/regbot config top_n 5`")
                .await?;
        }
    }

    Ok(())
}
