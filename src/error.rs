//! Error taxonomy for the retrieval core.
//!
//! "Nothing indexed" and "nothing relevant" are not errors; they surface as an
//! empty [`crate::retriever::RetrievalResult`] with a [`crate::retriever::Grounding`] status.

use thiserror::Error;

/// Malformed input handed to the segmenter. Callers may retry with sanitized text.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("text contains a NUL character at offset {offset}")]
    NulCharacter { offset: usize },

    #[error("invalid chunk sizes: overlap {overlap} must be smaller than max chunk size {max_chunk_size}")]
    InvalidSizes {
        max_chunk_size: usize,
        overlap: usize,
    },

    #[error("page {page} appears more than once")]
    DuplicatePage { page: u32 },
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("text has no embeddable content")]
    EmptyInput,

    #[error("embedding model failed: {0}")]
    Model(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index was built with embedder '{expected}', but '{actual}' is configured")]
    EmbedderMismatch { expected: String, actual: String },

    #[error("record '{id}' has an invalid embedding: {reason}")]
    InvalidEmbedding { id: String, reason: &'static str },

    #[error("index storage unavailable: {0}")]
    Unavailable(#[from] heed::Error),

    #[error("index storage unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("index is corrupt: {0}")]
    Corrupt(String),
}

/// Retrieval failures, tagged with the component that failed.
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("embedder failed: {0}")]
    Embedder(#[from] EmbedError),

    #[error("vector index failed: {0}")]
    Index(#[from] IndexError),
}

/// Ingestion failures. Batches before `batch` have already been committed.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("segmenter failed: {0}")]
    Segmenter(#[from] SegmentError),

    #[error("embedder failed on batch {batch}: {source}")]
    Embedder {
        batch: usize,
        #[source]
        source: EmbedError,
    },

    #[error("vector index failed on batch {batch}: {source}")]
    Index {
        batch: usize,
        #[source]
        source: IndexError,
    },
}

#[derive(Debug, Error)]
#[error("unknown search method '{0}', expected 'exact' or 'ann'")]
pub struct UnknownSearchMethod(pub String);

#[derive(Debug, Error)]
#[error("unknown embedding model '{0}', expected 'all-MiniLM-L6-v2', 'bge-small-en-v1.5', 'bge-base-en-v1.5' or 'hashing'")]
pub struct UnknownEmbeddingModel(pub String);
