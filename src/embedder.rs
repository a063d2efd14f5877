//! Text to unit-norm vector mapping.
//!
//! The default encoder is a sentence-embedding model run locally through
//! `fastembed`. [`HashingEmbedder`] needs no model files and backs the tests
//! and benches.

use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{Number, Settings, EPSILON};
use crate::error::{EmbedError, UnknownEmbeddingModel};
use crate::vector_ops::{l2_norm, normalize_vector};

/// A deterministic, fixed-dimension text encoder producing unit-norm vectors.
///
/// Implementations must be safe for concurrent use; model weights are read-only
/// after construction.
pub trait Embedder: Send + Sync {
    /// Identifier recorded in the index manifest; changing it invalidates stored vectors.
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<Number>, EmbedError>;

    /// Element-for-element identical to calling [`Embedder::embed`] on each text.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<Number>>, EmbedError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Encoders selectable through the `embedding_model` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingModelName {
    /// [`HashingEmbedder`]; its dimension comes from `embedding_dimension`.
    Hashing,
    AllMiniLmL6V2,
    BgeSmallEnV15,
    BgeBaseEnV15,
}

impl EmbeddingModelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingModelName::Hashing => HashingEmbedder::MODEL_FAMILY,
            EmbeddingModelName::AllMiniLmL6V2 => "all-MiniLM-L6-v2",
            EmbeddingModelName::BgeSmallEnV15 => "bge-small-en-v1.5",
            EmbeddingModelName::BgeBaseEnV15 => "bge-base-en-v1.5",
        }
    }

    /// Output width fixed by the model weights; `None` when it is configurable.
    pub fn dimension(&self) -> Option<usize> {
        match self {
            EmbeddingModelName::Hashing => None,
            EmbeddingModelName::AllMiniLmL6V2 | EmbeddingModelName::BgeSmallEnV15 => Some(384),
            EmbeddingModelName::BgeBaseEnV15 => Some(768),
        }
    }
}

impl FromStr for EmbeddingModelName {
    type Err = UnknownEmbeddingModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hashing" | "hashing-v1" => Ok(EmbeddingModelName::Hashing),
            "all-minilm-l6-v2" | "allminilml6v2" => Ok(EmbeddingModelName::AllMiniLmL6V2),
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(EmbeddingModelName::BgeSmallEnV15),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(EmbeddingModelName::BgeBaseEnV15),
            _ => Err(UnknownEmbeddingModel(s.to_string())),
        }
    }
}

impl fmt::Display for EmbeddingModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the encoder named by `settings.embedding_model`.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn Embedder>, EmbedError> {
    match settings.embedding_model {
        EmbeddingModelName::Hashing => Ok(Arc::new(HashingEmbedder::new(settings.embedding_dimension))),
        #[cfg(feature = "semantic-search")]
        model => Ok(Arc::new(FastEmbedder::new(model)?)),
        #[cfg(not(feature = "semantic-search"))]
        model => Err(EmbedError::Model(format!(
            "'{}' needs the semantic-search feature; rebuild with it or use 'hashing'",
            model
        ))),
    }
}

/// Local sentence-embedding model; outputs are re-normalized to unit length.
#[cfg(feature = "semantic-search")]
pub struct FastEmbedder {
    model: fastembed::TextEmbedding,
    name: EmbeddingModelName,
    dimension: usize,
}

#[cfg(feature = "semantic-search")]
impl FastEmbedder {
    /// Loads the model, downloading the weights into the shared cache on first use.
    pub fn new(name: EmbeddingModelName) -> Result<Self, EmbedError> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let (model, dimension) = match (name, name.dimension()) {
            (EmbeddingModelName::AllMiniLmL6V2, Some(dim)) => (EmbeddingModel::AllMiniLML6V2, dim),
            (EmbeddingModelName::BgeSmallEnV15, Some(dim)) => (EmbeddingModel::BGESmallENV15, dim),
            (EmbeddingModelName::BgeBaseEnV15, Some(dim)) => (EmbeddingModel::BGEBaseENV15, dim),
            _ => {
                return Err(EmbedError::Model(format!(
                    "'{}' is not a sentence-embedding model",
                    name
                )))
            }
        };

        let cache_dir = std::env::var("FASTEMBED_CACHE_PATH")
            .ok()
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|home| format!("{}/.cache/fastembed", home))
            })
            .unwrap_or_else(|| ".fastembed_cache".to_string());

        let model = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(std::path::PathBuf::from(&cache_dir))
                .with_show_download_progress(false),
        )
        .map_err(|e| EmbedError::Model(format!("failed to load {}: {}", name, e)))?;

        tracing::info!(model = %name, dimension, cache_dir = %cache_dir, "embedding model loaded");
        Ok(Self {
            model,
            name,
            dimension,
        })
    }
}

#[cfg(feature = "semantic-search")]
impl Embedder for FastEmbedder {
    fn model_id(&self) -> &str {
        self.name.as_str()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<Number>, EmbedError> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| EmbedError::Model("model returned no embedding".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<Number>>, EmbedError> {
        if texts.iter().any(|text| text.trim().is_empty()) {
            return Err(EmbedError::EmptyInput);
        }
        let mut embeddings = self
            .model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbedError::Model(e.to_string()))?;
        if embeddings.len() != texts.len() {
            return Err(EmbedError::Model(format!(
                "model returned {} embeddings for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }
        for embedding in &mut embeddings {
            if embedding.len() != self.dimension {
                return Err(EmbedError::Model(format!(
                    "model returned {} dimensions, expected {}",
                    embedding.len(),
                    self.dimension
                )));
            }
            normalize_vector(embedding);
        }
        Ok(embeddings)
    }
}

const WORD_WEIGHT: Number = 1.0;
const STOPWORD_WEIGHT: Number = 0.25;
const TRIGRAM_WEIGHT: Number = 0.5;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "for", "from", "has", "in", "is", "it",
    "of", "on", "or", "that", "the", "this", "to", "was", "what", "which", "with",
];

/// Signed feature-hashing embedder over words and character trigrams.
///
/// Lexically related texts land close together; paraphrases that share no
/// vocabulary do not, so production corpora should use a [`FastEmbedder`] model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub const MODEL_FAMILY: &'static str = "hashing-v1";

    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: Self::MODEL_FAMILY.to_string(),
        }
    }

    fn accumulate(&self, vector: &mut [Number], feature: &[u8], weight: Number) {
        let hash = fnv1a(feature);
        let slot = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<Number>, EmbedError> {
        if self.dimension == 0 {
            return Err(EmbedError::Model("embedding dimension is zero".to_string()));
        }

        let mut vector = vec![0.0; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            if STOPWORDS.contains(&token) {
                self.accumulate(&mut vector, format!("w:{}", token).as_bytes(), STOPWORD_WEIGHT);
                continue;
            }
            self.accumulate(&mut vector, format!("w:{}", token).as_bytes(), WORD_WEIGHT);

            let bounded: Vec<char> = format!("^{}$", token).chars().collect();
            if bounded.len() > 4 {
                for gram in bounded.windows(3) {
                    let gram: String = gram.iter().collect();
                    self.accumulate(&mut vector, format!("g:{}", gram).as_bytes(), TRIGRAM_WEIGHT);
                }
            }
        }

        if l2_norm(&vector) < EPSILON {
            return Err(EmbedError::EmptyInput);
        }
        normalize_vector(&mut vector);
        Ok(vector)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<Number>>, EmbedError> {
        texts.par_iter().map(|text| self.embed(text)).collect()
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_ops::{dot_product_simd, is_unit_norm};

    #[test]
    fn output_is_unit_norm_with_fixed_dimension() {
        let embedder = HashingEmbedder::new(384);
        let v = embedder.embed("The budget is $1.2 million.").unwrap();
        assert_eq!(v.len(), 384);
        assert!(is_unit_norm(&v));
    }

    #[test]
    fn embedding_is_deterministic() {
        let a = HashingEmbedder::new(256).embed("Risks include market volatility.").unwrap();
        let b = HashingEmbedder::new(256).embed("Risks include market volatility.").unwrap();
        assert!(dot_product_simd(&a, &b) >= 0.9999);
        assert_eq!(a, b);
    }

    #[test]
    fn batch_matches_individual_calls() {
        let embedder = HashingEmbedder::new(128);
        let texts: Vec<String> = ["alpha beta", "gamma", "delta epsilon zeta"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let batch = embedder.embed_batch(&texts).unwrap();
        for (text, vector) in texts.iter().zip(&batch) {
            assert_eq!(&embedder.embed(text).unwrap(), vector);
        }
    }

    #[test]
    fn text_without_features_is_rejected() {
        let embedder = HashingEmbedder::new(64);
        assert!(matches!(embedder.embed("   ?! "), Err(EmbedError::EmptyInput)));
        let texts = vec!["fine".to_string(), "...".to_string()];
        assert!(embedder.embed_batch(&texts).is_err());
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder.embed("What is the budget?").unwrap();
        let budget = embedder.embed("The budget is $1.2 million.").unwrap();
        let weather = embedder.embed("Unrelated sentence about weather.").unwrap();
        assert!(dot_product_simd(&query, &budget) > dot_product_simd(&query, &weather));
    }

    #[test]
    fn model_names_parse_case_insensitively() {
        assert_eq!(
            "All-MiniLM-L6-v2".parse::<EmbeddingModelName>().unwrap(),
            EmbeddingModelName::AllMiniLmL6V2
        );
        assert_eq!(" hashing ".parse::<EmbeddingModelName>().unwrap(), EmbeddingModelName::Hashing);
        assert_eq!(EmbeddingModelName::BgeBaseEnV15.dimension(), Some(768));
        assert!("mpnet".parse::<EmbeddingModelName>().is_err());
    }

    #[test]
    fn hashing_model_is_built_from_settings() {
        let settings = Settings::default()
            .with_embedding_model(EmbeddingModelName::Hashing)
            .with_embedding_dimension(96);
        let embedder = from_settings(&settings).unwrap();
        assert_eq!(embedder.model_id(), HashingEmbedder::MODEL_FAMILY);
        assert_eq!(embedder.dimension(), 96);
    }

    #[cfg(feature = "semantic-search")]
    #[test]
    #[ignore = "downloads model weights"]
    fn sentence_model_matches_paraphrases() {
        let embedder = FastEmbedder::new(EmbeddingModelName::AllMiniLmL6V2).unwrap();
        assert_eq!(embedder.model_id(), "all-MiniLM-L6-v2");

        let query = embedder.embed("How much money was allocated?").unwrap();
        let budget = embedder.embed("The budget is $1.2 million.").unwrap();
        let weather = embedder.embed("Unrelated sentence about weather.").unwrap();
        assert_eq!(query.len(), 384);
        assert!(is_unit_norm(&budget));
        assert!(dot_product_simd(&query, &budget) > dot_product_simd(&query, &weather));

        let texts = vec!["The budget is $1.2 million.".to_string()];
        let batch = embedder.embed_batch(&texts).unwrap();
        assert!(dot_product_simd(&batch[0], &budget) >= 0.9999);
    }
}
