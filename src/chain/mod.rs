//! Orchestration: contextualize → route → {record track | escalation} →
//! synthesize → persist.

pub mod contextualize;
pub mod escalation;
pub mod prompts;
pub mod record_track;
pub mod router;
pub mod synthesize;

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::docs::citations::{collect_citations, LinkGuard};
use crate::docs::{Citation, Document, FinalAnswer};
use crate::error::{is_cancelled, RagError};
use crate::history::{HistoryStore, SessionKey, Turn};
use crate::question::Question;
use crate::retrieval::fusion::FusionSettings;
use crate::state::PipelineConfig;

use contextualize::Contextualizer;
use escalation::EscalationChain;
use record_track::RecordTrackPath;
use router::{RouteDecision, SourceRouter};
use synthesize::Synthesizer;

/// Fragments of a buffered answer are replayed in chunks of about this size.
const REPLAY_CHUNK_CHARS: usize = 48;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    pub user_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub rewritten_question: String,
    pub answer: String,
    pub context: Vec<Document>,
    pub citations: Vec<Citation>,
    pub route: RouteDecision,
    /// Corpus whose answer was accepted; `None` for the validity path and
    /// for the fallback answer.
    pub source: Option<String>,
}

/// Events of the incremental variant. `Answer` chunks carry `{answer: fragment}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Rewritten { question: String },
    Answer { answer: String },
    Done { response: ChatResponse },
    Error { message: String },
}

struct Prepared {
    key: SessionKey,
    question: Question,
    rewritten: Question,
    route: RouteDecision,
    settings: FusionSettings,
}

pub struct Pipeline {
    contextualizer: Contextualizer,
    router: SourceRouter,
    record_track: RecordTrackPath,
    escalation: EscalationChain,
    history: Arc<dyn HistoryStore>,
    config: Arc<RwLock<PipelineConfig>>,
}

impl Pipeline {
    pub fn new(
        contextualizer: Contextualizer,
        router: SourceRouter,
        record_track: RecordTrackPath,
        escalation: EscalationChain,
        history: Arc<dyn HistoryStore>,
        config: Arc<RwLock<PipelineConfig>>,
    ) -> Self {
        Self {
            contextualizer,
            router,
            record_track,
            escalation,
            history,
            config,
        }
    }

    pub fn escalation_order(&self) -> Vec<&str> {
        self.escalation.source_names()
    }

    /// History read, rewrite and routing: everything before retrieval.
    async fn prepare(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<Prepared> {
        let key = SessionKey::new(request.user_id.clone(), request.conversation_id.clone());
        let history = match self.history.get(&key).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(session = %key, error = %e, "history unavailable, answering without it");
                vec![]
            }
        };

        let question = Question::new(request.question.trim());
        let rewritten = self.contextualizer.rewrite(&question, &history).await?;
        if cancel.is_cancelled() {
            return Err(RagError::Cancelled.into());
        }
        let route = self.router.route(&rewritten).await;
        let settings = self.config.read().await.fusion_settings();

        info!(
            session = %key,
            language = question.language().name(),
            history_turns = history.len(),
            rewritten = rewritten.text(),
            route = route.label(),
            "request prepared"
        );
        Ok(Prepared {
            key,
            question,
            rewritten,
            route,
            settings,
        })
    }

    /// A failed write is logged; the answer has already been produced.
    async fn persist(&self, key: &SessionKey, question: &Question, answer: &FinalAnswer) {
        match self
            .history
            .append(key, Turn::new(question.text(), answer.text.clone()))
            .await
        {
            Ok(()) => debug!(session = %key, "history updated"),
            Err(e) => warn!(session = %key, error = %e, "answer delivered, history not updated"),
        }
    }

    fn response(
        prepared: &Prepared,
        answer: FinalAnswer,
        context: Vec<Document>,
        source: Option<String>,
    ) -> ChatResponse {
        ChatResponse {
            rewritten_question: prepared.rewritten.text().to_string(),
            answer: answer.text,
            context,
            citations: answer.citations,
            route: prepared.route,
            source,
        }
    }

    /// Single-shot call.
    pub async fn ask(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let cancel = CancellationToken::new();
        let prepared = self.prepare(request, &cancel).await?;

        let (answer, context, source) = match prepared.route {
            RouteDecision::HistoryValidity => {
                let (answer, context) = self
                    .record_track
                    .answer(&prepared.rewritten, &prepared.settings)
                    .await?;
                (answer, context, None)
            }
            RouteDecision::SubstantiveExplanation => {
                let outcome = self
                    .escalation
                    .answer(&prepared.rewritten, &prepared.settings, &cancel)
                    .await?;
                debug!(attempts = ?outcome.attempts, "escalation finished");
                (outcome.answer, outcome.context, outcome.source)
            }
        };

        self.persist(&prepared.key, &prepared.question, &answer).await;
        Ok(Self::response(&prepared, answer, context, source))
    }

    /// Incremental call. Events arrive through a bounded channel; dropping
    /// the stream cancels the request before its next stage, so no further
    /// corpus is queried for a client that has gone.
    pub fn ask_stream(self: &Arc<Self>, request: ChatRequest) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let cancel = CancellationToken::new();

        let watcher = (tx.clone(), cancel.clone());
        tokio::spawn(async move {
            let (tx, cancel) = watcher;
            tokio::select! {
                _ = tx.closed() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Releases the watcher once the request is over
            let _finished = cancel.clone().drop_guard();
            match this.run_stream(&request, &tx, &cancel).await {
                Ok(response) => {
                    let _ = tx.send(StreamEvent::Done { response }).await;
                }
                Err(e) if is_cancelled(&e) => debug!("client disconnected, stream abandoned"),
                Err(e) => {
                    error!(error = %e, "streaming request failed");
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run_stream(
        &self,
        request: &ChatRequest,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let prepared = self.prepare(request, cancel).await?;
        emit(
            tx,
            StreamEvent::Rewritten {
                question: prepared.rewritten.text().to_string(),
            },
        )
        .await?;

        let (answer, context, source) = match prepared.route {
            RouteDecision::HistoryValidity => {
                let evidence = self
                    .record_track
                    .evidence(&prepared.rewritten, &prepared.settings)
                    .await?;
                if cancel.is_cancelled() {
                    return Err(RagError::Cancelled.into());
                }
                let synthesizer = self.record_track.synthesizer();
                let answer = if evidence.is_empty() {
                    let answer = Synthesizer::not_found(&prepared.rewritten);
                    replay(tx, &answer.text).await?;
                    answer
                } else {
                    // A link is shown only once it is complete and checked
                    let mut guard = LinkGuard::new(collect_citations(&evidence.documents));
                    let mut stream = synthesizer.stream(&prepared.rewritten, &evidence).await?;
                    let mut shown = String::new();
                    while let Some(fragment) = stream.next().await {
                        let fragment = fragment.map_err(|e| RagError::Synthesis(e.to_string()))?;
                        let safe = guard.push(&fragment);
                        if !safe.is_empty() {
                            shown.push_str(&safe);
                            emit(tx, StreamEvent::Answer { answer: safe }).await?;
                        }
                    }
                    let (rest, removed) = guard.finish();
                    if !rest.is_empty() {
                        shown.push_str(&rest);
                        emit(tx, StreamEvent::Answer { answer: rest }).await?;
                    }
                    if removed > 0 {
                        warn!(removed, "unlinked streamed locators not backed by the evidence");
                    }
                    synthesizer.finalize(&shown, &evidence)
                };
                (answer, evidence.documents, None)
            }
            RouteDecision::SubstantiveExplanation => {
                // Drafts must be judged whole, so the accepted one is replayed
                let outcome = self
                    .escalation
                    .answer(&prepared.rewritten, &prepared.settings, cancel)
                    .await?;
                debug!(attempts = ?outcome.attempts, "escalation finished");
                replay(tx, &outcome.answer.text).await?;
                (outcome.answer, outcome.context, outcome.source)
            }
        };

        self.persist(&prepared.key, &prepared.question, &answer).await;
        Ok(Self::response(&prepared, answer, context, source))
    }
}

/// A closed channel means the client went away.
async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<()> {
    tx.send(event).await.map_err(|_| RagError::Cancelled.into())
}

/// Send a complete answer as a sequence of fragments.
async fn replay(tx: &mpsc::Sender<StreamEvent>, text: &str) -> Result<()> {
    let mut chunk = String::new();
    for piece in text.split_inclusive(char::is_whitespace) {
        chunk.push_str(piece);
        if chunk.len() >= REPLAY_CHUNK_CHARS {
            let answer = std::mem::take(&mut chunk);
            emit(tx, StreamEvent::Answer { answer }).await?;
        }
    }
    if !chunk.is_empty() {
        emit(tx, StreamEvent::Answer { answer: chunk }).await?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::escalation::{AnswerSource, ResponsivenessJudge};
    use super::testing::ScriptedGenerator;
    use super::*;
    use crate::graph::testing::FakeGraph;
    use crate::graph::GraphEvidenceUnit;
    use crate::history::{ConversationSummary, MemoryHistoryStore};
    use crate::retrieval::fusion::FusionUnit;
    use crate::retrieval::testing::*;
    use crate::retrieval::RetrievalStrategy;
    use async_trait::async_trait;
    use serde_json::json;

    fn scripted(replies: &[&str]) -> Arc<ScriptedGenerator> {
        Arc::new(ScriptedGenerator::new(
            replies.iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn fusion(strategy: Arc<StaticStrategy>) -> FusionUnit {
        let name = strategy.name().to_string();
        FusionUnit::new(
            &name,
            vec![strategy as Arc<dyn RetrievalStrategy>],
            Arc::new(ConstEmbedder(vec![1.0, 0.0])),
            None,
        )
    }

    struct Script<'a> {
        /// Latency of the first answer source's retrieval.
        first_source_delay: Option<std::time::Duration>,
        contextualize: &'a [&'a str],
        route: &'a [&'a str],
        graph: &'a [&'a str],
        graph_rows: Vec<serde_json::Value>,
        validity_answer: &'a [&'a str],
        verdicts: &'a [&'a str],
        /// One scripted draft per answer source, in escalation order.
        drafts: &'a [&'a str],
    }

    impl Default for Script<'_> {
        fn default() -> Self {
            Self {
                first_source_delay: None,
                contextualize: &[],
                route: &["ketentuan_terkait"],
                graph: &[],
                graph_rows: vec![],
                validity_answer: &[],
                verdicts: &[],
                drafts: &[],
            }
        }
    }

    fn pipeline(script: Script<'_>, history: Arc<dyn HistoryStore>) -> Arc<Pipeline> {
        pipeline_with_strategies(script, history).0
    }

    /// Also returns the retrieval strategy of each answer source.
    fn pipeline_with_strategies(
        script: Script<'_>,
        history: Arc<dyn HistoryStore>,
    ) -> (Arc<Pipeline>, Vec<Arc<StaticStrategy>>) {
        let record_track = RecordTrackPath::new(
            GraphEvidenceUnit::new(scripted(script.graph), Arc::new(FakeGraph::new(script.graph_rows))),
            fusion(Arc::new(StaticStrategy::new("sikepo-rekam-jejak", vec![]))),
            Synthesizer::new(scripted(script.validity_answer), "nomor_ketentuan"),
        );
        let mut strategies = vec![];
        let sources = script
            .drafts
            .iter()
            .enumerate()
            .map(|(i, draft)| {
                let name = format!("source-{}", i);
                let id = format!("POJK {}/2020", i + 1);
                let mut strategy =
                    StaticStrategy::new(&name, vec![scored(&format!("isi {}", id), &id, vec![1.0, 0.0])]);
                if i == 0 {
                    strategy.delay = script.first_source_delay;
                }
                let strategy = Arc::new(strategy);
                strategies.push(strategy.clone());
                AnswerSource {
                    fusion: Arc::new(fusion(strategy)),
                    synthesizer: Arc::new(Synthesizer::new(scripted(&[*draft]), "regulation_number")),
                    name,
                }
            })
            .collect();
        let pipeline = Arc::new(Pipeline::new(
            Contextualizer::new(scripted(script.contextualize)),
            SourceRouter::new(scripted(script.route)),
            record_track,
            EscalationChain::new(sources, ResponsivenessJudge::new(scripted(script.verdicts))),
            history,
            Arc::new(RwLock::new(PipelineConfig::default())),
        ));
        (pipeline, strategies)
    }

    fn request(question: &str) -> ChatRequest {
        ChatRequest {
            question: question.to_string(),
            user_id: "u1".to_string(),
            conversation_id: "c1".to_string(),
        }
    }

    const REVOKED_CYPHER: &str = "```cypher\nMATCH (p:Peraturan {nomor_ketentuan: '7/33/PBI/2005'})\n\
        OPTIONAL MATCH (p)-[:DICABUT]->(newer:Peraturan)\nRETURN p.nomor_ketentuan AS peraturan, newer AS dicabut_oleh\n```";

    fn revoked_rows() -> Vec<serde_json::Value> {
        vec![json!({
            "peraturan": "7/33/PBI/2005",
            "dicabut_oleh": {
                "nomor_ketentuan": "11/8/PBI/2009",
                "file_url": "https://bi.go.id/pbi-11-8-2009.pdf"
            }
        })]
    }

    #[tokio::test]
    async fn test_validity_question_uses_graph() {
        let history = Arc::new(MemoryHistoryStore::new(5));
        let p = pipeline(
            Script {
                route: &["rekam_jejak"],
                graph: &[REVOKED_CYPHER, "Peraturan 7/33/PBI/2005 telah dicabut oleh 11/8/PBI/2009."],
                graph_rows: revoked_rows(),
                validity_answer: &[
                    "Peraturan 7/33/PBI/2005 sudah tidak berlaku karena telah dicabut oleh \
                     [11/8/PBI/2009](https://bi.go.id/pbi-11-8-2009.pdf).",
                ],
                ..Script::default()
            },
            history.clone(),
        );

        let resp = p
            .ask(&request("Apakah peraturan 7/33/PBI/2005 masih berlaku?"))
            .await
            .unwrap();
        assert_eq!(resp.route, RouteDecision::HistoryValidity);
        assert!(resp.answer.contains("tidak berlaku"));
        assert!(resp.answer.contains("11/8/PBI/2009"));
        assert!(resp.citations.iter().any(|c| c.regulation_id == "11/8/PBI/2009"));
        assert!(resp.source.is_none());
        assert_eq!(history.get(&SessionKey::new("u1", "c1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_substantive_escalates_to_second_source() {
        let p = pipeline(
            Script {
                route: &["I am not sure which one"],
                verdicts: &["NO", "YES"],
                drafts: &["Draf pertama.", "Modal inti minimum Rp3 triliun.", "Draf ketiga."],
                ..Script::default()
            },
            Arc::new(MemoryHistoryStore::new(5)),
        );
        let resp = p.ask(&request("Bagaimana dengan modal inti?")).await.unwrap();
        assert_eq!(resp.route, RouteDecision::SubstantiveExplanation);
        assert_eq!(resp.source.as_deref(), Some("source-1"));
        assert_eq!(resp.answer, "Modal inti minimum Rp3 triliun.");
        assert_eq!(resp.citations[0].regulation_id, "POJK 2/2020");
    }

    #[tokio::test]
    async fn test_follow_up_is_rewritten_with_history() {
        let history = Arc::new(MemoryHistoryStore::new(5));
        history
            .append(
                &SessionKey::new("u1", "c1"),
                Turn::new("Apa isi peraturan 7/33/PBI/2005?", "Mengatur pencabutan izin bank."),
            )
            .await
            .unwrap();
        let p = pipeline(
            Script {
                contextualize: &["Apakah peraturan 7/33/PBI/2005 masih berlaku?"],
                verdicts: &["YES"],
                drafts: &["Jawaban."],
                ..Script::default()
            },
            history.clone(),
        );
        let resp = p.ask(&request("dan untuk yang itu?")).await.unwrap();
        assert_eq!(resp.rewritten_question, "Apakah peraturan 7/33/PBI/2005 masih berlaku?");
        let turns = history.get(&SessionKey::new("u1", "c1")).await.unwrap();
        // The stored question is what the user typed
        assert_eq!(turns.last().unwrap().question, "dan untuk yang itu?");
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_reported_and_not_persisted() {
        let history = Arc::new(MemoryHistoryStore::new(5));
        let p = pipeline(
            Script {
                route: &["rekam_jejak"],
                graph: &[REVOKED_CYPHER, "Dicabut."],
                graph_rows: revoked_rows(),
                validity_answer: &[],
                ..Script::default()
            },
            history.clone(),
        );
        let err = p
            .ask(&request("Apakah peraturan 7/33/PBI/2005 masih berlaku?"))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<RagError>(), Some(RagError::Synthesis(_))));
        assert!(history.get(&SessionKey::new("u1", "c1")).await.unwrap().is_empty());
    }

    /// Every operation fails.
    struct BrokenHistory;

    #[async_trait]
    impl HistoryStore for BrokenHistory {
        fn capacity(&self) -> usize {
            5
        }
        async fn get(&self, _key: &SessionKey) -> Result<Vec<Turn>> {
            anyhow::bail!("redis down")
        }
        async fn append(&self, _key: &SessionKey, _turn: Turn) -> Result<()> {
            anyhow::bail!("redis down")
        }
        async fn clear(&self, _key: &SessionKey) -> Result<()> {
            anyhow::bail!("redis down")
        }
        async fn list_conversations(&self, _user_id: &str) -> Result<Vec<ConversationSummary>> {
            anyhow::bail!("redis down")
        }
        async fn rename(&self, _key: &SessionKey, _title: &str) -> Result<()> {
            anyhow::bail!("redis down")
        }
        async fn clear_user(&self, _user_id: &str) -> Result<usize> {
            anyhow::bail!("redis down")
        }
    }

    #[tokio::test]
    async fn test_history_outage_still_answers() {
        let p = pipeline(
            Script {
                verdicts: &["YES"],
                drafts: &["Modal inti minimum Rp3 triliun."],
                ..Script::default()
            },
            Arc::new(BrokenHistory),
        );
        let resp = p.ask(&request("Berapa modal inti minimum?")).await.unwrap();
        assert_eq!(resp.answer, "Modal inti minimum Rp3 triliun.");
    }

    #[tokio::test]
    async fn test_stream_events_in_order() {
        let p = pipeline(
            Script {
                route: &["rekam_jejak"],
                graph: &[REVOKED_CYPHER, "Dicabut oleh 11/8/PBI/2009."],
                graph_rows: revoked_rows(),
                validity_answer: &["Peraturan 7/33/PBI/2005 sudah dicabut oleh 11/8/PBI/2009."],
                ..Script::default()
            },
            Arc::new(MemoryHistoryStore::new(5)),
        );
        let events: Vec<StreamEvent> = p
            .ask_stream(request("Apakah peraturan 7/33/PBI/2005 masih berlaku?"))
            .collect()
            .await;

        assert!(matches!(events.first(), Some(StreamEvent::Rewritten { .. })));
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Answer { answer } => Some(answer.as_str()),
                _ => None,
            })
            .collect();
        match events.last() {
            Some(StreamEvent::Done { response }) => assert_eq!(response.answer, streamed),
            other => panic!("unexpected last event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replayed_fallback_matches_answer() {
        let p = pipeline(
            Script {
                verdicts: &["NO"],
                drafts: &["Draf yang tidak menjawab."],
                ..Script::default()
            },
            Arc::new(MemoryHistoryStore::new(5)),
        );
        let events: Vec<StreamEvent> = p.ask_stream(request("Apa aturan kripto?")).collect().await;
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Answer { answer } => Some(answer.as_str()),
                _ => None,
            })
            .collect();
        match events.last() {
            Some(StreamEvent::Done { response }) => {
                assert_eq!(response.answer, streamed);
                assert!(response.citations.is_empty());
                assert!(response.source.is_none());
            }
            other => panic!("unexpected last event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_streamed_fragments_never_show_invented_links() {
        let p = pipeline(
            Script {
                route: &["rekam_jejak"],
                graph: &[REVOKED_CYPHER, "Dicabut oleh 11/8/PBI/2009."],
                graph_rows: revoked_rows(),
                validity_answer: &[
                    "Peraturan 7/33/PBI/2005 dicabut oleh [11/8/PBI/2009](https://bi.go.id/pbi-11-8-2009.pdf) \
                     dan diubah oleh [POJK 99/2099](https://fake.example/pojk-99.pdf).",
                ],
                ..Script::default()
            },
            Arc::new(MemoryHistoryStore::new(5)),
        );
        let events: Vec<StreamEvent> = p
            .ask_stream(request("Apakah peraturan 7/33/PBI/2005 masih berlaku?"))
            .collect()
            .await;

        let fragments: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Answer { answer } => Some(answer.as_str()),
                _ => None,
            })
            .collect();
        assert!(fragments.iter().all(|f| !f.contains("fake.example")));
        let streamed = fragments.concat();
        assert!(streamed.contains("[11/8/PBI/2009](https://bi.go.id/pbi-11-8-2009.pdf)"));
        match events.last() {
            Some(StreamEvent::Done { response }) => assert_eq!(response.answer, streamed.trim()),
            other => panic!("unexpected last event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_stream_stops_escalation() {
        let (p, strategies) = pipeline_with_strategies(
            Script {
                first_source_delay: Some(std::time::Duration::from_millis(50)),
                verdicts: &["NO", "NO", "NO"],
                drafts: &["Draf satu.", "Draf dua.", "Draf tiga."],
                ..Script::default()
            },
            Arc::new(MemoryHistoryStore::new(5)),
        );
        let mut stream = p.ask_stream(request("Apa aturan kripto?"));
        assert!(matches!(stream.next().await, Some(StreamEvent::Rewritten { .. })));
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(strategies[0].calls() <= 1);
        assert_eq!(strategies[1].calls(), 0);
        assert_eq!(strategies[2].calls(), 0);
    }

    #[test]
    fn test_stream_event_shape() {
        let chunk = serde_json::to_value(StreamEvent::Answer {
            answer: "Peraturan".into(),
        })
        .unwrap();
        assert_eq!(chunk["answer"], json!("Peraturan"));
        assert_eq!(chunk["event"], json!("answer"));
    }
}
