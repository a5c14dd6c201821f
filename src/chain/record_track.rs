use anyhow::Result;
use tracing::info;

use super::synthesize::{EvidenceBundle, Synthesizer};
use crate::docs::{Document, FinalAnswer};
use crate::graph::GraphEvidenceUnit;
use crate::question::Question;
use crate::retrieval::fusion::{FusionSettings, FusionUnit};

/// The validity ("rekam jejak") path: graph evidence merged with retrieval
/// over the record-track corpus, then one synthesis.
pub struct RecordTrackPath {
    graph: GraphEvidenceUnit,
    fusion: FusionUnit,
    synthesizer: Synthesizer,
}

impl RecordTrackPath {
    pub fn new(graph: GraphEvidenceUnit, fusion: FusionUnit, synthesizer: Synthesizer) -> Self {
        Self {
            graph,
            fusion,
            synthesizer,
        }
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    /// Graph and corpus are independent, so both are gathered at once.
    pub async fn evidence(&self, question: &Question, settings: &FusionSettings) -> Result<EvidenceBundle> {
        let (graph, documents) = tokio::join!(
            self.graph.evaluate(question),
            self.fusion.fuse(question, settings)
        );
        let (graph, documents) = (graph?, documents?);
        info!(
            graph_found = graph.found,
            graph_regulations = graph.citations().len(),
            documents = documents.len(),
            "record-track evidence gathered"
        );
        Ok(EvidenceBundle::record_track(graph, documents))
    }

    pub async fn answer(
        &self,
        question: &Question,
        settings: &FusionSettings,
    ) -> Result<(FinalAnswer, Vec<Document>)> {
        let evidence = self.evidence(question, settings).await?;
        let answer = self.synthesizer.synthesize(question, &evidence).await?;
        Ok((answer, evidence.documents))
    }
}
