use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::embedder::EmbeddingModelName;
use crate::index::SearchMethod;

pub type Number = f32;

pub const EPSILON: f32 = 1e-6;

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_OVERLAP_SIZE: usize = 200;
pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;
pub const DEFAULT_INGEST_BATCH_SIZE: usize = 64;
pub const DEFAULT_MAP_SIZE_MB: usize = 10 * 1024;

/// Raw view of the layered configuration sources. Every key is optional, but a
/// key that is present must parse.
#[derive(Deserialize)]
pub struct DocragConfig {
    pub data_dir: Option<String>,
    pub corpus: Option<String>,
    pub max_chunk_size: Option<usize>,
    pub overlap_size: Option<usize>,
    pub top_k: Option<usize>,
    pub relevance_floor: Option<Number>,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<usize>,
    pub search_method: Option<String>,
    pub ingest_batch_size: Option<usize>,
    pub map_size_mb: Option<usize>,
}

impl DocragConfig {
    pub fn try_from(config: &Config) -> Result<Self, ConfigError> {
        Ok(DocragConfig {
            data_dir: optional(config, "data_dir")?,
            corpus: optional(config, "corpus")?,
            max_chunk_size: optional(config, "max_chunk_size")?,
            overlap_size: optional(config, "overlap_size")?,
            top_k: optional(config, "top_k")?,
            relevance_floor: optional(config, "relevance_floor")?,
            embedding_model: optional(config, "embedding_model")?,
            embedding_dimension: optional(config, "embedding_dimension")?,
            search_method: optional(config, "search_method")?,
            ingest_batch_size: optional(config, "ingest_batch_size")?,
            map_size_mb: optional(config, "map_size_mb")?,
        })
    }
}

fn optional<T: DeserializeOwned>(config: &Config, key: &str) -> Result<Option<T>, ConfigError> {
    match config.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Resolved, validated settings shared by every component of a process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub corpus: String,
    pub max_chunk_size: usize,
    pub overlap_size: usize,
    pub top_k: usize,
    pub relevance_floor: Option<Number>,
    pub embedding_model: EmbeddingModelName,
    pub embedding_dimension: usize,
    pub search_method: SearchMethod,
    pub ingest_batch_size: usize,
    pub map_size_mb: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./docrag_data"),
            corpus: "documents".to_string(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            overlap_size: DEFAULT_OVERLAP_SIZE,
            top_k: DEFAULT_TOP_K,
            relevance_floor: None,
            embedding_model: EmbeddingModelName::AllMiniLmL6V2,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            search_method: SearchMethod::Exact,
            ingest_batch_size: DEFAULT_INGEST_BATCH_SIZE,
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }
}

impl Settings {
    /// Defaults, then `docrag_config.*` in the working directory, then `DOCRAG_*` variables.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(ConfigFile::with_name("docrag_config").required(false))
            .add_source(Environment::with_prefix("DOCRAG"))
            .build()
            .context("Failed to read docrag configuration")?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let raw = DocragConfig::try_from(config).context("Invalid docrag configuration")?;
        let defaults = Settings::default();

        let search_method = match raw.search_method {
            Some(method) => method.parse()?,
            None => defaults.search_method,
        };
        let embedding_model = match raw.embedding_model {
            Some(model) => model.parse()?,
            None => defaults.embedding_model,
        };

        let settings = Self {
            data_dir: raw.data_dir.map(PathBuf::from).unwrap_or(defaults.data_dir),
            corpus: raw.corpus.unwrap_or(defaults.corpus),
            max_chunk_size: raw.max_chunk_size.unwrap_or(defaults.max_chunk_size),
            overlap_size: raw.overlap_size.unwrap_or(defaults.overlap_size),
            top_k: raw.top_k.unwrap_or(defaults.top_k),
            relevance_floor: raw.relevance_floor,
            embedding_model,
            embedding_dimension: raw
                .embedding_dimension
                .unwrap_or(defaults.embedding_dimension),
            search_method,
            ingest_batch_size: raw.ingest_batch_size.unwrap_or(defaults.ingest_batch_size),
            map_size_mb: raw.map_size_mb.unwrap_or(defaults.map_size_mb),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.corpus.trim().is_empty() {
            anyhow::bail!("DOCRAG_CORPUS must not be empty.");
        }
        if self.max_chunk_size == 0 {
            anyhow::bail!("DOCRAG_MAX_CHUNK_SIZE must be greater than zero.");
        }
        if self.overlap_size >= self.max_chunk_size {
            anyhow::bail!(
                "DOCRAG_OVERLAP_SIZE ({}) must be smaller than DOCRAG_MAX_CHUNK_SIZE ({}).",
                self.overlap_size,
                self.max_chunk_size
            );
        }
        if self.top_k == 0 {
            anyhow::bail!("DOCRAG_TOP_K must be greater than zero.");
        }
        if self.embedding_dimension == 0 {
            anyhow::bail!("DOCRAG_EMBEDDING_DIMENSION must be greater than zero.");
        }
        if let Some(model_dimension) = self.embedding_model.dimension() {
            if model_dimension != self.embedding_dimension {
                anyhow::bail!(
                    "DOCRAG_EMBEDDING_DIMENSION ({}) does not match {} ({} dimensions).",
                    self.embedding_dimension,
                    self.embedding_model,
                    model_dimension
                );
            }
        }
        if self.ingest_batch_size == 0 {
            anyhow::bail!("DOCRAG_INGEST_BATCH_SIZE must be greater than zero.");
        }
        if self.map_size_mb == 0 {
            anyhow::bail!("DOCRAG_MAP_SIZE_MB must be greater than zero.");
        }
        if let Some(floor) = self.relevance_floor {
            if !(-1.0..=1.0).contains(&floor) {
                anyhow::bail!("DOCRAG_RELEVANCE_FLOOR must lie within [-1, 1], got {}.", floor);
            }
        }
        Ok(())
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_corpus(mut self, corpus: impl Into<String>) -> Self {
        self.corpus = corpus.into();
        self
    }

    pub fn with_chunking(mut self, max_chunk_size: usize, overlap_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self.overlap_size = overlap_size;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_relevance_floor(mut self, floor: Option<Number>) -> Self {
        self.relevance_floor = floor;
        self
    }

    pub fn with_embedding_model(mut self, model: EmbeddingModelName) -> Self {
        self.embedding_model = model;
        self
    }

    pub fn with_embedding_dimension(mut self, dimension: usize) -> Self {
        self.embedding_dimension = dimension;
        self
    }

    pub fn with_search_method(mut self, method: SearchMethod) -> Self {
        self.search_method = method;
        self
    }

    pub fn with_ingest_batch_size(mut self, batch_size: usize) -> Self {
        self.ingest_batch_size = batch_size;
        self
    }

    /// On-disk location of the configured corpus.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.corpus)
    }

    pub fn map_size_bytes(&self) -> usize {
        self.map_size_mb * 1024 * 1024
    }

    pub fn print_config(&self) {
        println!("data_dir={}", self.data_dir.display());
        println!("corpus={}", self.corpus);
        println!("index_path={}", self.index_path().display());
        println!("max_chunk_size={}", self.max_chunk_size);
        println!("overlap_size={}", self.overlap_size);
        println!("top_k={}", self.top_k);
        match self.relevance_floor {
            Some(floor) => println!("relevance_floor={}", floor),
            None => println!("relevance_floor=none"),
        }
        println!("embedding_model={}", self.embedding_model);
        println!("embedding_dimension={}", self.embedding_dimension);
        println!("search_method={}", self.search_method);
        println!("ingest_batch_size={}", self.ingest_batch_size);
        println!("map_size_mb={}", self.map_size_mb);
    }
}

/// Installs the stderr subscriber. `DOCRAG_LOG` wins; otherwise `DOCRAG_VERBOSE=true` means debug.
pub fn init_logging() {
    let verbose = env::var("DOCRAG_VERBOSE").unwrap_or_else(|_| "false".to_string()) == "true";
    let filter = EnvFilter::try_from_env("DOCRAG_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.max_chunk_size, 1000);
        assert_eq!(settings.overlap_size, 200);
        assert_eq!(settings.top_k, 3);
        assert!(settings.relevance_floor.is_none());
        assert_eq!(settings.search_method, SearchMethod::Exact);
        assert_eq!(settings.embedding_model, EmbeddingModelName::AllMiniLmL6V2);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let settings = Settings::default().with_chunking(100, 100);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn relevance_floor_is_range_checked() {
        assert!(Settings::default()
            .with_relevance_floor(Some(1.5))
            .validate()
            .is_err());
        assert!(Settings::default()
            .with_relevance_floor(Some(0.25))
            .validate()
            .is_ok());
    }

    fn from_toml(body: &str) -> Result<Settings> {
        let config = Config::builder()
            .add_source(ConfigFile::from_str(body, ::config::FileFormat::Toml))
            .build()?;
        Settings::from_config(&config)
    }

    #[test]
    fn file_values_override_defaults() {
        let settings = from_toml(
            "top_k = 5\nrelevance_floor = 0.3\nsearch_method = \"ann\"\nembedding_model = \"hashing\"\nembedding_dimension = 128",
        )
        .unwrap();
        assert_eq!(settings.top_k, 5);
        assert_eq!(settings.relevance_floor, Some(0.3));
        assert_eq!(settings.search_method, SearchMethod::Ann);
        assert_eq!(settings.embedding_model, EmbeddingModelName::Hashing);
        assert_eq!(settings.embedding_dimension, 128);
    }

    #[test]
    fn malformed_values_fail_instead_of_defaulting() {
        assert!(from_toml("top_k = \"three\"").is_err());
        assert!(from_toml("relevance_floor = \"0.5x\"").is_err());
        assert!(from_toml("embedding_model = \"mpnet\"").is_err());
        assert!(from_toml("search_method = \"fuzzy\"").is_err());
    }

    #[test]
    fn malformed_environment_fails_load() {
        env::set_var("DOCRAG_RELEVANCE_FLOOR", "0.5x");
        env::set_var("DOCRAG_TOP_K", "three");
        let result = Settings::load();
        env::remove_var("DOCRAG_RELEVANCE_FLOOR");
        env::remove_var("DOCRAG_TOP_K");
        assert!(result.is_err());

        env::set_var("DOCRAG_TOP_K", "7");
        let result = Settings::load();
        env::remove_var("DOCRAG_TOP_K");
        assert_eq!(result.unwrap().top_k, 7);
    }

    #[test]
    fn fixed_width_model_requires_matching_dimension() {
        let settings = Settings::default().with_embedding_model(EmbeddingModelName::BgeBaseEnV15);
        assert!(settings.validate().is_err());
        assert!(settings.with_embedding_dimension(768).validate().is_ok());
        assert!(Settings::default()
            .with_embedding_model(EmbeddingModelName::Hashing)
            .with_embedding_dimension(64)
            .validate()
            .is_ok());
    }

    #[test]
    fn index_path_joins_corpus() {
        let settings = Settings::default()
            .with_data_dir("/tmp/docrag")
            .with_corpus("reports");
        assert_eq!(settings.index_path(), PathBuf::from("/tmp/docrag/reports"));
    }
}
