//! Persistent vector index backed by LMDB.
//!
//! Two named databases live in one environment: `records` maps chunk id to the
//! whole stored record, `meta` holds the [`IndexManifest`]. Every record is a
//! single LMDB value, so readers observe either the old or the new record,
//! never a mix. Commits are synced before `upsert` returns.

use heed::types::{SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::ann::RandomProjectionIndex;
use crate::config::{Number, Settings};
use crate::embedder::Embedder;
use crate::error::{IndexError, UnknownSearchMethod};
use crate::segmenter::{Chunk, ChunkMetadata};
use crate::vector_ops::{dot_product_simd, is_unit_norm, normalize_vector};

const RECORDS_DB: &str = "records";
const META_DB: &str = "meta";
const MANIFEST_KEY: &str = "manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    /// Brute-force cosine scan over every record.
    Exact,
    /// LSH shortlist re-scored exactly; falls back to `Exact` when the shortlist is short.
    Ann,
}

impl FromStr for SearchMethod {
    type Err = UnknownSearchMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(SearchMethod::Exact),
            "ann" => Ok(SearchMethod::Ann),
            other => Err(UnknownSearchMethod(other.to_string())),
        }
    }
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMethod::Exact => f.write_str("exact"),
            SearchMethod::Ann => f.write_str("ann"),
        }
    }
}

/// Written once when the index is created; `next_seq` advances with every new id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub corpus: String,
    pub dimension: usize,
    pub embedder: String,
    pub created_at_epoch_s: u64,
    pub next_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    seq: u64,
    embedding: Vec<Number>,
    text: String,
    metadata: ChunkMetadata,
}

/// Unit of insertion: a chunk together with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<Number>,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl VectorRecord {
    pub fn from_chunk(chunk: Chunk, embedding: Vec<Number>) -> Self {
        Self {
            id: chunk.id,
            embedding,
            text: chunk.text,
            metadata: chunk.metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: Number,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub corpus: String,
    pub dimension: usize,
    pub embedder: String,
    pub search_method: SearchMethod,
    pub map_size: usize,
}

impl IndexOptions {
    pub fn new(corpus: impl Into<String>, dimension: usize, embedder: impl Into<String>) -> Self {
        Self {
            corpus: corpus.into(),
            dimension,
            embedder: embedder.into(),
            search_method: SearchMethod::Exact,
            map_size: 1024 * 1024 * 1024,
        }
    }

    /// Dimension and model id come from the embedder, so a mismatched model is caught at open.
    pub fn from_settings(settings: &Settings, embedder: &dyn Embedder) -> Self {
        Self {
            corpus: settings.corpus.clone(),
            dimension: embedder.dimension(),
            embedder: embedder.model_id().to_string(),
            search_method: settings.search_method,
            map_size: settings.map_size_bytes(),
        }
    }

    pub fn with_search_method(mut self, method: SearchMethod) -> Self {
        self.search_method = method;
        self
    }
}

struct AnnState {
    lsh: RandomProjectionIndex,
    ids: HashMap<u64, String>,
}

pub struct VectorIndex {
    path: PathBuf,
    env: Env,
    records: Database<Str, SerdeBincode<StoredRecord>>,
    meta: Database<Str, SerdeBincode<IndexManifest>>,
    manifest: IndexManifest,
    search_method: SearchMethod,
    writer: Mutex<()>,
    ann: Option<RwLock<AnnState>>,
}

impl VectorIndex {
    /// True when an index has already been created at `path`.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().join("data.mdb").is_file()
    }

    /// Opens the index at `path`, creating it on first use.
    ///
    /// An existing index whose manifest disagrees with `options` on dimension or
    /// embedder is rejected here rather than producing wrong scores later.
    pub fn open<P: AsRef<Path>>(path: P, options: IndexOptions) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size)
                .max_dbs(2)
                .open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let records: Database<Str, SerdeBincode<StoredRecord>> =
            env.create_database(&mut wtxn, Some(RECORDS_DB))?;
        let meta: Database<Str, SerdeBincode<IndexManifest>> =
            env.create_database(&mut wtxn, Some(META_DB))?;

        let manifest = match meta.get(&wtxn, MANIFEST_KEY)? {
            Some(existing) => {
                if existing.dimension != options.dimension {
                    return Err(IndexError::DimensionMismatch {
                        expected: existing.dimension,
                        actual: options.dimension,
                    });
                }
                if existing.embedder != options.embedder {
                    return Err(IndexError::EmbedderMismatch {
                        expected: existing.embedder,
                        actual: options.embedder,
                    });
                }
                existing
            }
            None => {
                let created = IndexManifest {
                    corpus: options.corpus.clone(),
                    dimension: options.dimension,
                    embedder: options.embedder.clone(),
                    created_at_epoch_s: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0),
                    next_seq: 0,
                };
                meta.put(&mut wtxn, MANIFEST_KEY, &created)?;
                info!(corpus = %created.corpus, dimension = created.dimension, path = %path.display(), "created vector index");
                created
            }
        };
        wtxn.commit()?;

        let mut index = Self {
            path,
            env,
            records,
            meta,
            manifest,
            search_method: options.search_method,
            writer: Mutex::new(()),
            ann: None,
        };

        if index.search_method == SearchMethod::Ann {
            index.ann = Some(RwLock::new(index.build_ann()?));
        }

        debug!(
            path = %index.path.display(),
            records = index.len()?,
            search_method = %index.search_method,
            "opened vector index"
        );
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Manifest as read at open time; `next_seq` may lag behind later upserts.
    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn dimension(&self) -> usize {
        self.manifest.dimension
    }

    pub fn search_method(&self) -> SearchMethod {
        self.search_method
    }

    pub fn len(&self) -> Result<usize, IndexError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.records.len(&rtxn)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<VectorRecord>, IndexError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.records.get(&rtxn, id)?.map(|stored| VectorRecord {
            id: id.to_string(),
            embedding: stored.embedding,
            text: stored.text,
            metadata: stored.metadata,
        }))
    }

    /// Record ids in insertion order.
    pub fn ids(&self) -> Result<Vec<String>, IndexError> {
        let rtxn = self.env.read_txn()?;
        let mut entries = self
            .records
            .iter(&rtxn)?
            .map(|result| result.map(|(id, stored)| (stored.seq, id.to_string())))
            .collect::<Result<Vec<_>, heed::Error>>()?;
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    /// Inserts new records and replaces existing ones with the same id.
    ///
    /// The whole batch is validated before anything is written, so a bad
    /// embedding leaves the index untouched. A replaced record keeps its
    /// original insertion position for tie-breaking.
    pub fn upsert(&self, records: &[VectorRecord]) -> Result<UpsertReport, IndexError> {
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            prepared.push((record, self.prepare_embedding(&record.id, &record.embedding)?));
        }
        if prepared.is_empty() {
            return Ok(UpsertReport::default());
        }

        let _writer = self
            .writer
            .lock()
            .map_err(|_| IndexError::Corrupt("writer lock poisoned".to_string()))?;

        let mut wtxn = self.env.write_txn()?;
        let mut manifest = self
            .meta
            .get(&wtxn, MANIFEST_KEY)?
            .ok_or_else(|| IndexError::Corrupt("manifest missing".to_string()))?;

        let mut report = UpsertReport::default();
        let mut ann_changes = Vec::with_capacity(prepared.len());
        for (record, embedding) in prepared {
            let previous = self.records.get(&wtxn, record.id.as_str())?;
            let seq = match &previous {
                Some(existing) => {
                    report.updated += 1;
                    existing.seq
                }
                None => {
                    report.inserted += 1;
                    let seq = manifest.next_seq;
                    manifest.next_seq += 1;
                    seq
                }
            };

            let stored = StoredRecord {
                seq,
                embedding,
                text: record.text.clone(),
                metadata: record.metadata.clone(),
            };
            self.records.put(&mut wtxn, record.id.as_str(), &stored)?;
            ann_changes.push((
                seq,
                record.id.clone(),
                previous.map(|p| p.embedding),
                stored.embedding,
            ));
        }
        self.meta.put(&mut wtxn, MANIFEST_KEY, &manifest)?;
        wtxn.commit()?;

        if let Some(ann) = &self.ann {
            let needs_rebuild = {
                let mut state = ann
                    .write()
                    .map_err(|_| IndexError::Corrupt("ann lock poisoned".to_string()))?;
                for (seq, id, old, new) in ann_changes {
                    if let Some(old) = old {
                        state.lsh.remove(seq, &old);
                    }
                    state.lsh.add(seq, &new);
                    state.ids.insert(seq, id);
                }
                state.lsh.needs_rebuild()
            };
            if needs_rebuild {
                let rebuilt = self.build_ann()?;
                *ann.write()
                    .map_err(|_| IndexError::Corrupt("ann lock poisoned".to_string()))? = rebuilt;
            }
        }

        debug!(inserted = report.inserted, updated = report.updated, "upsert committed");
        Ok(report)
    }

    /// Top `k` records by cosine similarity, best first; equal scores keep insertion order.
    pub fn query(&self, query_vector: &[Number], k: usize) -> Result<Vec<QueryHit>, IndexError> {
        let query = self.prepare_embedding("<query>", query_vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let hits = match (&self.ann, self.search_method) {
            (Some(ann), SearchMethod::Ann) => self.search_ann(ann, &query, k)?,
            _ => self.search_exact(&query, k)?,
        };
        debug!(
            results = hits.len(),
            k,
            elapsed_us = start.elapsed().as_micros() as u64,
            "query complete"
        );
        Ok(hits)
    }

    /// Exact brute-force ranking regardless of the configured method; the ground truth for recall.
    pub fn query_exact(&self, query_vector: &[Number], k: usize) -> Result<Vec<QueryHit>, IndexError> {
        let query = self.prepare_embedding("<query>", query_vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        self.search_exact(&query, k)
    }

    /// Deletes every record. Operator action only; nothing in the retrieval path calls it.
    pub fn reset(&self) -> Result<(), IndexError> {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| IndexError::Corrupt("writer lock poisoned".to_string()))?;

        let mut wtxn = self.env.write_txn()?;
        let mut manifest = self
            .meta
            .get(&wtxn, MANIFEST_KEY)?
            .ok_or_else(|| IndexError::Corrupt("manifest missing".to_string()))?;
        self.records.clear(&mut wtxn)?;
        manifest.next_seq = 0;
        self.meta.put(&mut wtxn, MANIFEST_KEY, &manifest)?;
        wtxn.commit()?;

        if let Some(ann) = &self.ann {
            let fresh = AnnState {
                lsh: RandomProjectionIndex::new(self.manifest.dimension, 0),
                ids: HashMap::new(),
            };
            *ann.write()
                .map_err(|_| IndexError::Corrupt("ann lock poisoned".to_string()))? = fresh;
        }
        info!(corpus = %self.manifest.corpus, "vector index reset");
        Ok(())
    }

    fn prepare_embedding(&self, id: &str, embedding: &[Number]) -> Result<Vec<Number>, IndexError> {
        if embedding.len() != self.manifest.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.manifest.dimension,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::InvalidEmbedding {
                id: id.to_string(),
                reason: "non-finite component",
            });
        }
        let mut normalized = embedding.to_vec();
        normalize_vector(&mut normalized);
        if !is_unit_norm(&normalized) {
            return Err(IndexError::InvalidEmbedding {
                id: id.to_string(),
                reason: "zero vector",
            });
        }
        Ok(normalized)
    }

    fn search_exact(&self, query: &[Number], k: usize) -> Result<Vec<QueryHit>, IndexError> {
        let entries = {
            let rtxn = self.env.read_txn()?;
            let entries = self
                .records
                .iter(&rtxn)?
                .map(|result| result.map(|(id, stored)| (id.to_string(), stored)))
                .collect::<Result<Vec<_>, heed::Error>>()?;
            entries
        };

        let dimension = self.manifest.dimension;
        let scored = entries
            .into_par_iter()
            .map(|(id, stored)| {
                if stored.embedding.len() != dimension {
                    return Err(IndexError::Corrupt(format!(
                        "record '{}' has dimension {}",
                        id,
                        stored.embedding.len()
                    )));
                }
                Ok((dot_product_simd(query, &stored.embedding), id, stored))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;

        Ok(rank(scored, k))
    }

    fn search_ann(
        &self,
        ann: &RwLock<AnnState>,
        query: &[Number],
        k: usize,
    ) -> Result<Vec<QueryHit>, IndexError> {
        let shortlist: Vec<String> = {
            let state = ann
                .read()
                .map_err(|_| IndexError::Corrupt("ann lock poisoned".to_string()))?;
            let shortlist = state
                .lsh
                .candidates(query)
                .into_iter()
                .filter_map(|seq| state.ids.get(&seq).cloned())
                .collect();
            shortlist
        };

        if shortlist.len() < k {
            debug!(candidates = shortlist.len(), k, "ann shortlist too small, scanning exactly");
            return self.search_exact(query, k);
        }

        let rtxn = self.env.read_txn()?;
        let mut scored = Vec::with_capacity(shortlist.len());
        for id in shortlist {
            if let Some(stored) = self.records.get(&rtxn, id.as_str())? {
                let score = dot_product_simd(query, &stored.embedding);
                scored.push((score, id, stored));
            }
        }
        Ok(rank(scored, k))
    }

    fn build_ann(&self) -> Result<AnnState, IndexError> {
        let rtxn = self.env.read_txn()?;
        let count = self.records.len(&rtxn)? as usize;
        let mut lsh = RandomProjectionIndex::new(self.manifest.dimension, count);
        let mut ids = HashMap::with_capacity(count);
        for result in self.records.iter(&rtxn)? {
            let (id, stored) = result?;
            lsh.add(stored.seq, &stored.embedding);
            ids.insert(stored.seq, id.to_string());
        }
        debug!(records = count, "built ann index");
        Ok(AnnState { lsh, ids })
    }
}

fn rank(mut scored: Vec<(Number, String, StoredRecord)>, k: usize) -> Vec<QueryHit> {
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.2.seq.cmp(&b.2.seq)));
    scored.truncate(k);
    scored
        .into_iter()
        .map(|(score, id, stored)| QueryHit {
            id,
            text: stored.text,
            metadata: stored.metadata,
            score,
        })
        .collect()
}
