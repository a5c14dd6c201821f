mod chain;
mod commands;
mod docs;
mod error;
mod graph;
mod history;
mod llm;
mod question;
mod retrieval;
mod state;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use poise::{Framework, FrameworkOptions};
use tokio::sync::RwLock;
use tracing::{error, info, Level};

use chain::contextualize::Contextualizer;
use chain::escalation::{AnswerSource, EscalationChain, ResponsivenessJudge};
use chain::record_track::RecordTrackPath;
use chain::router::SourceRouter;
use chain::synthesize::Synthesizer;
use chain::Pipeline;
use graph::neo4j::Neo4jBackend;
use graph::GraphEvidenceUnit;
use history::{CnidariumHistoryStore, HistoryStore, MemoryHistoryStore};
use llm::{Embedder, Generator, LlmClient, SubModel};
use retrieval::elastic::ElasticBackend;
use retrieval::filter::{FilterSchema, SelfQueryStrategy};
use retrieval::fusion::FusionUnit;
use retrieval::rerank::{CohereReranker, Reranker};
use retrieval::{RetrievalStrategy, VectorBackend, VectorSearchStrategy};
use state::{AppState, PipelineConfig};

/// One searchable corpus and how its metadata is shaped.
struct Corpus {
    index: &'static str,
    schema: fn() -> FilterSchema,
    identifier_hint: &'static str,
}

const OJK: Corpus = Corpus {
    index: "ojk",
    schema: FilterSchema::regulations,
    identifier_hint: "regulation_number",
};
const BI: Corpus = Corpus {
    index: "bi",
    schema: FilterSchema::regulations,
    identifier_hint: "regulation_number",
};
const SIKEPO_PROVISIONS: Corpus = Corpus {
    index: "sikepo-ketentuan-terkait",
    schema: FilterSchema::provisions,
    identifier_hint: "nomor_ketentuan",
};
const SIKEPO_RECORD_TRACK: Corpus = Corpus {
    index: "sikepo-rekam-jejak",
    schema: FilterSchema::provisions,
    identifier_hint: "nomor_ketentuan",
};

/// Shared clients every corpus is built from.
struct Clients {
    generator: Arc<dyn Generator>,
    classifier: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
}

/// Similarity, MMR and self-query strategies over one index, fused.
fn corpus_fusion(corpus: &Corpus, clients: &Clients, config: &PipelineConfig) -> anyhow::Result<FusionUnit> {
    let backend: Arc<dyn VectorBackend> = Arc::new(ElasticBackend::from_env(corpus.index)?);
    let k = config.search_k;
    let strategies: Vec<Arc<dyn RetrievalStrategy>> = vec![
        Arc::new(VectorSearchStrategy::similarity(
            backend.clone(),
            clients.embedder.clone(),
            k,
        )),
        Arc::new(VectorSearchStrategy::mmr(
            backend.clone(),
            clients.embedder.clone(),
            k,
            config.fetch_k,
            config.mmr_lambda,
        )),
        Arc::new(SelfQueryStrategy::new(
            clients.classifier.clone(),
            (corpus.schema)(),
            VectorSearchStrategy::similarity(backend, clients.embedder.clone(), k),
        )),
    ];
    info!(index = corpus.index, strategies = strategies.len(), "corpus ready");
    Ok(FusionUnit::new(
        corpus.index,
        strategies,
        clients.embedder.clone(),
        clients.reranker.clone(),
    ))
}

fn answer_source(name: &str, clients: &Clients, config: &PipelineConfig) -> anyhow::Result<AnswerSource> {
    let corpus = match name {
        "sikepo" => &SIKEPO_PROVISIONS,
        "ojk" => &OJK,
        "bi" => &BI,
        other => anyhow::bail!("unknown escalation source `{}` (expected sikepo, ojk or bi)", other),
    };
    Ok(AnswerSource {
        name: name.to_string(),
        fusion: Arc::new(corpus_fusion(corpus, clients, config)?),
        synthesizer: Arc::new(Synthesizer::new(clients.generator.clone(), corpus.identifier_hint)),
    })
}

async fn history_store(k: usize) -> anyhow::Result<Arc<dyn HistoryStore>> {
    let backend = dotenv::var("HISTORY_BACKEND").unwrap_or_else(|_| "memory".to_string());
    match backend.trim() {
        "memory" => Ok(Arc::new(MemoryHistoryStore::new(k))),
        "cnidarium" => {
            let dir = PathBuf::from(
                dotenv::var("HISTORY_DIR").unwrap_or_else(|_| "./data/history".to_string()),
            );
            let store = CnidariumHistoryStore::new(&dir, k)
                .await
                .with_context(|| format!("opening history store at {:?}", dir))?;
            info!("History store initialized at {:?}", dir);
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("HISTORY_BACKEND must be `memory` or `cnidarium`, got `{}`", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    let level = dotenv::var("LOG_LEVEL")
        .ok()
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let token = dotenv::var("DISCORD_TOKEN").expect("DISCORD_TOKEN required");
    let guild_id: Option<serenity::GuildId> = dotenv::var("DISCORD_GUILD_ID")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(serenity::GuildId::new);

    let config = PipelineConfig::from_env();
    info!(?config, "pipeline configuration");

    let llm_client = Arc::new(LlmClient::from_env()?);
    let reranker = CohereReranker::from_env()?.map(|r| Arc::new(r) as Arc<dyn Reranker>);
    if reranker.is_none() {
        info!("COHERE_API_KEY not set, fused results are truncated without reranking");
    }
    let clients = Clients {
        generator: llm_client.clone(),
        classifier: Arc::new(SubModel(llm_client.clone())),
        embedder: llm_client.clone(),
        reranker,
    };
    info!("LLM client initialized");

    let record_track = RecordTrackPath::new(
        GraphEvidenceUnit::new(clients.generator.clone(), Arc::new(Neo4jBackend::from_env()?)),
        corpus_fusion(&SIKEPO_RECORD_TRACK, &clients, &config)?,
        Synthesizer::new(clients.generator.clone(), SIKEPO_RECORD_TRACK.identifier_hint),
    );

    let order = dotenv::var("ESCALATION_ORDER").unwrap_or_else(|_| "sikepo,ojk,bi".to_string());
    let sources = order
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| answer_source(name, &clients, &config))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let escalation = EscalationChain::new(sources, ResponsivenessJudge::new(clients.classifier.clone()));
    info!(order = ?escalation.source_names(), "escalation order");

    let history = history_store(config.history_k).await?;
    let config = Arc::new(RwLock::new(config));

    let pipeline = Arc::new(Pipeline::new(
        Contextualizer::new(clients.generator.clone()),
        SourceRouter::new(clients.classifier.clone()),
        record_track,
        escalation,
        history.clone(),
        config.clone(),
    ));

    let admin_ids: HashSet<u64> = dotenv::var("ADMIN_USER_IDS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse::<u64>().ok())
        .collect();
    if !admin_ids.is_empty() {
        info!(count = admin_ids.len(), "Admin users configured");
    }

    let app_state = AppState {
        pipeline,
        history,
        admin_ids,
        config,
    };

    let intents = serenity::GatewayIntents::GUILDS | serenity::GatewayIntents::GUILD_MESSAGES;

    let framework = Framework::builder()
        .options(FrameworkOptions {
            commands: vec![commands::regbot()],
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot connected as: {} ({})", ready.user.name, ready.user.id);

                let commands = &framework.options().commands;
                for cmd in commands {
                    info!("  /{} ({} subcommands)", cmd.name, cmd.subcommands.len());
                    for sub in &cmd.subcommands {
                        info!("    /{} {}", cmd.name, sub.name);
                    }
                }

                if let Some(gid) = guild_id {
                    info!("Registering to guild {} (instant)", gid);
                    poise::builtins::register_in_guild(ctx, &framework.options().commands, gid).await?;
                } else {
                    info!("Registering globally (up to 1 hour delay)");
                    poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                }

                Ok(app_state)
            })
        })
        .build();

    info!("Starting regbot...");

    let mut client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    if let Err(e) = client.start().await {
        error!("Client error: {}", e);
    }

    Ok(())
}
