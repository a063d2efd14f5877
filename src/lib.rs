//! Retrieval core for grounded document question answering: segmentation,
//! embedding, a persistent vector index and a retriever that selects the
//! context an answer may be drawn from.

pub mod ann;
pub mod config;
pub mod embedder;
pub mod error;
pub mod index;
pub mod ingest;
pub mod retriever;
pub mod segmenter;
pub mod vector_ops;

pub use config::{Number, Settings};
pub use embedder::{EmbeddingModelName, Embedder, HashingEmbedder};
#[cfg(feature = "semantic-search")]
pub use embedder::FastEmbedder;
pub use error::{EmbedError, IndexError, IngestError, RetrieveError, SegmentError, UnknownEmbeddingModel};
pub use index::{IndexManifest, IndexOptions, QueryHit, SearchMethod, UpsertReport, VectorIndex, VectorRecord};
pub use ingest::{IngestReport, Ingestor};
pub use retriever::{Grounding, RetrievalResult, RetrievedChunk, Retriever};
pub use segmenter::{normalize, segment, Chunk, ChunkMetadata, Document, Page, Segmenter};
