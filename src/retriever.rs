//! Question → ranked, attributed context.

use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Number, Settings, DEFAULT_TOP_K};
use crate::embedder::Embedder;
use crate::error::{IndexError, RetrieveError};
use crate::index::{QueryHit, VectorIndex};
use crate::segmenter::Chunk;

/// Why a result is (or is not) fit to ground an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grounding {
    Sufficient,
    /// Nothing has been indexed yet.
    EmptyCorpus,
    /// Records exist, but none scored at or above the relevance floor.
    BelowRelevanceFloor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: Number,
}

impl From<QueryHit> for RetrievedChunk {
    fn from(hit: QueryHit) -> Self {
        Self {
            chunk: Chunk {
                id: hit.id,
                text: hit.text,
                metadata: hit.metadata,
            },
            score: hit.score,
        }
    }
}

/// Ranked hits, best first. An empty result means the answer generator must not answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub question: String,
    pub grounding: Grounding,
    pub hits: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    pub fn empty(question: &str, grounding: Grounding) -> Self {
        Self {
            question: question.to_string(),
            grounding,
            hits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_grounded(&self) -> bool {
        self.grounding == Grounding::Sufficient
    }

    /// Attributed context block handed to the answer generator, one section per hit.
    pub fn render_context(&self) -> String {
        let mut out = String::new();
        for hit in &self.hits {
            let meta = &hit.chunk.metadata;
            let _ = write!(out, "[Chunk {}", meta.ordinal);
            if let Some(page) = meta.source_page {
                let _ = write!(out, " | page {}", page);
            }
            if let Some(source) = &meta.source {
                let _ = write!(out, " | {}", source);
            }
            let _ = writeln!(out, " | score {:.3}]", hit.score);
            out.push_str(&hit.chunk.text);
            out.push_str("\n\n");
        }
        out.truncate(out.trim_end().len());
        out
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    top_k: usize,
    relevance_floor: Option<Number>,
}

impl Retriever {
    /// Fails if the embedder does not match the dimension and model the index was built with.
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>) -> Result<Self, IndexError> {
        ensure_compatible(embedder.as_ref(), &index)?;
        Ok(Self {
            embedder,
            index,
            top_k: DEFAULT_TOP_K,
            relevance_floor: None,
        })
    }

    pub fn from_settings(
        settings: &Settings,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
    ) -> Result<Self, IndexError> {
        Ok(Self::new(embedder, index)?
            .with_top_k(settings.top_k)
            .with_relevance_floor(settings.relevance_floor))
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Absolute cosine threshold; hits below it are dropped.
    pub fn with_relevance_floor(mut self, floor: Option<Number>) -> Self {
        self.relevance_floor = floor;
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn retrieve(&self, question: &str) -> Result<RetrievalResult, RetrieveError> {
        self.retrieve_k(question, self.top_k)
    }

    /// Like [`Retriever::retrieve`] with an explicit `k`; zero is treated as one.
    pub fn retrieve_k(&self, question: &str, k: usize) -> Result<RetrievalResult, RetrieveError> {
        if self.index.is_empty()? {
            debug!("retrieval against empty corpus");
            return Ok(RetrievalResult::empty(question, Grounding::EmptyCorpus));
        }

        let query_vector = self.embedder.embed(question)?;
        let hits = self.index.query(&query_vector, k.max(1))?;
        if hits.is_empty() {
            return Ok(RetrievalResult::empty(question, Grounding::EmptyCorpus));
        }

        let hits: Vec<RetrievedChunk> = match self.relevance_floor {
            Some(floor) => hits
                .into_iter()
                .filter(|hit| hit.score >= floor)
                .map(RetrievedChunk::from)
                .collect(),
            None => hits.into_iter().map(RetrievedChunk::from).collect(),
        };

        if hits.is_empty() {
            debug!(floor = ?self.relevance_floor, "no hit cleared the relevance floor");
            return Ok(RetrievalResult::empty(question, Grounding::BelowRelevanceFloor));
        }

        debug!(
            hits = hits.len(),
            top_score = hits[0].score,
            "retrieval complete"
        );
        Ok(RetrievalResult {
            question: question.to_string(),
            grounding: Grounding::Sufficient,
            hits,
        })
    }
}

pub(crate) fn ensure_compatible(embedder: &dyn Embedder, index: &VectorIndex) -> Result<(), IndexError> {
    let manifest = index.manifest();
    if embedder.dimension() != manifest.dimension {
        return Err(IndexError::DimensionMismatch {
            expected: manifest.dimension,
            actual: embedder.dimension(),
        });
    }
    if embedder.model_id() != manifest.embedder {
        return Err(IndexError::EmbedderMismatch {
            expected: manifest.embedder.clone(),
            actual: embedder.model_id().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashingEmbedder;
    use crate::index::{IndexOptions, VectorRecord};
    use crate::segmenter::segment;

    fn setup(dir: &std::path::Path) -> (Arc<dyn Embedder>, Arc<VectorIndex>) {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let mut options = IndexOptions::new("docs", 256, embedder.model_id());
        options.map_size = 64 * 1024 * 1024;
        let index = Arc::new(VectorIndex::open(dir, options).unwrap());
        (embedder, index)
    }

    fn index_sentences(embedder: &dyn Embedder, index: &VectorIndex, sentences: &[&str]) {
        let records: Vec<VectorRecord> = sentences
            .iter()
            .enumerate()
            .map(|(ordinal, sentence)| {
                let mut chunk = segment(sentence, 1000, 200).unwrap().remove(0);
                chunk.metadata.ordinal = ordinal;
                chunk.id = crate::segmenter::chunk_id(ordinal, &chunk.text);
                let embedding = embedder.embed(&chunk.text).unwrap();
                VectorRecord::from_chunk(chunk, embedding)
            })
            .collect();
        index.upsert(&records).unwrap();
    }

    #[test]
    fn empty_corpus_yields_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let (embedder, index) = setup(dir.path());
        let retriever = Retriever::new(embedder, index).unwrap();
        let result = retriever.retrieve("anything").unwrap();
        assert!(result.is_empty());
        assert_eq!(result.grounding, Grounding::EmptyCorpus);
        assert!(!result.is_grounded());
    }

    #[test]
    fn budget_question_finds_budget_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (embedder, index) = setup(dir.path());
        index_sentences(
            embedder.as_ref(),
            &index,
            &[
                "The budget is $1.2 million.",
                "Risks include market volatility.",
                "Unrelated sentence about weather.",
            ],
        );
        let retriever = Retriever::new(embedder, index).unwrap();
        let result = retriever.retrieve("What is the budget?").unwrap();
        assert_eq!(result.grounding, Grounding::Sufficient);
        assert_eq!(result.len(), 3);
        assert_eq!(result.hits[0].chunk.text, "The budget is $1.2 million.");
        assert!(result.hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn relevance_floor_discards_weak_matches() {
        let dir = tempfile::tempdir().unwrap();
        let (embedder, index) = setup(dir.path());
        index_sentences(
            embedder.as_ref(),
            &index,
            &["Risks include market volatility.", "Unrelated sentence about weather."],
        );
        let retriever = Retriever::new(embedder, index)
            .unwrap()
            .with_relevance_floor(Some(0.9));
        let result = retriever.retrieve("quarterly budget figures").unwrap();
        assert!(result.is_empty());
        assert_eq!(result.grounding, Grounding::BelowRelevanceFloor);

        let exact = retriever.retrieve("Risks include market volatility.").unwrap();
        assert_eq!(exact.len(), 1);
        assert!(exact.is_grounded());
    }

    #[test]
    fn mismatched_embedder_is_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let (_, index) = setup(dir.path());
        let other: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(128));
        assert!(matches!(
            Retriever::new(other, index),
            Err(IndexError::DimensionMismatch { expected: 256, actual: 128 })
        ));
    }

    #[test]
    fn embedder_failures_are_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let (embedder, index) = setup(dir.path());
        index_sentences(embedder.as_ref(), &index, &["Some indexed text."]);
        let retriever = Retriever::new(embedder, index).unwrap();
        assert!(matches!(
            retriever.retrieve("?!"),
            Err(RetrieveError::Embedder(_))
        ));
    }

    #[test]
    fn context_block_carries_attribution() {
        let result = RetrievalResult {
            question: "q".to_string(),
            grounding: Grounding::Sufficient,
            hits: vec![RetrievedChunk {
                chunk: Chunk {
                    id: "chunk_2_abc".to_string(),
                    text: "The budget is $1.2 million.".to_string(),
                    metadata: crate::segmenter::ChunkMetadata {
                        ordinal: 2,
                        source_page: Some(4),
                        source: Some("plan.pdf".to_string()),
                        char_start: 0,
                        char_end: 27,
                    },
                },
                score: 0.8,
            }],
        };
        assert_eq!(
            result.render_context(),
            "[Chunk 2 | page 4 | plan.pdf | score 0.800]\nThe budget is $1.2 million."
        );
    }
}
