//! Segment → embed → upsert, in bounded batches.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::embedder::Embedder;
use crate::error::{IndexError, IngestError};
use crate::index::{VectorIndex, VectorRecord};
use crate::retriever::ensure_compatible;
use crate::segmenter::{Document, Segmenter};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub chunks: usize,
    pub batches: usize,
    pub inserted: usize,
    pub updated: usize,
}

pub struct Ingestor {
    segmenter: Segmenter,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        segmenter: Segmenter,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        batch_size: usize,
    ) -> Result<Self, IndexError> {
        ensure_compatible(embedder.as_ref(), &index)?;
        Ok(Self {
            segmenter,
            embedder,
            index,
            batch_size: batch_size.max(1),
        })
    }

    /// Each batch is committed before the next is embedded, so a failure only
    /// loses the failing batch; re-running the same document is idempotent.
    pub fn ingest(&self, document: &Document) -> Result<IngestReport, IngestError> {
        self.ingest_all(std::slice::from_ref(document))
    }

    /// Ingests several documents as one upload; chunk ordinals run across all of them.
    pub fn ingest_all(&self, documents: &[Document]) -> Result<IngestReport, IngestError> {
        let start = Instant::now();
        let chunks = self.segmenter.segment_documents(documents)?;
        let mut report = IngestReport {
            chunks: chunks.len(),
            ..IngestReport::default()
        };

        for (batch, group) in chunks.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = group.iter().map(|chunk| chunk.text.clone()).collect();
            let embeddings = self
                .embedder
                .embed_batch(&texts)
                .map_err(|source| IngestError::Embedder { batch, source })?;

            let records: Vec<VectorRecord> = group
                .iter()
                .cloned()
                .zip(embeddings)
                .map(|(chunk, embedding)| VectorRecord::from_chunk(chunk, embedding))
                .collect();

            let upserted = self
                .index
                .upsert(&records)
                .map_err(|source| IngestError::Index { batch, source })?;
            report.inserted += upserted.inserted;
            report.updated += upserted.updated;
            report.batches += 1;
            debug!(batch, records = records.len(), "ingested batch");
        }

        info!(
            documents = documents.len(),
            chunks = report.chunks,
            batches = report.batches,
            inserted = report.inserted,
            updated = report.updated,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "upload ingested"
        );
        Ok(report)
    }

    pub fn ingest_text(&self, name: Option<String>, text: &str) -> Result<IngestReport, IngestError> {
        self.ingest(&Document::from_text(name, text))
    }
}
