//! Random-projection LSH used to shortlist candidates for approximate search.
//!
//! Candidates are always re-scored exactly by the index, so the structure only
//! affects recall, never the reported scores. The recall contract is
//! [`ANN_RECALL_TARGET`] recall@k against an exact scan.

use rand::prelude::*;
use rand_distr::StandardNormal;
use std::collections::{BTreeSet, HashMap};

use crate::config::Number;
use crate::vector_ops::dot_product_simd;

/// Minimum recall@k the approximate path must reach against exact search.
pub const ANN_RECALL_TARGET: f64 = 0.95;

const SEED: u64 = 42;
const MIN_PROJECTIONS: usize = 2;
const MAX_PROJECTIONS: usize = 16;
const MIN_TABLES: usize = 1;
const MAX_TABLES: usize = 8;
/// Tables are sized for at least this many records so small corpora are not over-bucketed.
const MIN_TUNING_SIZE: usize = 1024;

pub struct RandomProjectionIndex {
    random_vectors: Vec<Vec<Number>>,
    hash_tables: Vec<HashMap<u64, Vec<u64>>>,
    num_tables: usize,
    num_projections: usize,
    built_for: usize,
    len: usize,
}

impl RandomProjectionIndex {
    pub fn new(dim: usize, data_size: usize) -> Self {
        let built_for = data_size.max(MIN_TUNING_SIZE);
        let (num_projections, num_tables) = Self::calculate_params(built_for);
        tracing::debug!(
            num_projections,
            num_tables,
            built_for,
            "initializing random projection index"
        );

        let mut rng = StdRng::seed_from_u64(SEED);
        let random_vectors: Vec<Vec<Number>> = (0..num_tables * num_projections)
            .map(|_| (0..dim).map(|_| rng.sample(StandardNormal)).collect())
            .collect();

        RandomProjectionIndex {
            random_vectors,
            hash_tables: vec![HashMap::new(); num_tables],
            num_tables,
            num_projections,
            built_for,
            len: 0,
        }
    }

    fn calculate_params(data_size: usize) -> (usize, usize) {
        let log_size = (data_size as f64).log2() as usize;
        let num_projections = (log_size + 2).clamp(MIN_PROJECTIONS, MAX_PROJECTIONS);
        let num_tables = (log_size / 2 + 2).clamp(MIN_TABLES, MAX_TABLES);
        (num_projections, num_tables)
    }

    fn hash_vector(&self, vector: &[Number], table_index: usize) -> u64 {
        let start = table_index * self.num_projections;
        let end = start + self.num_projections;

        self.random_vectors[start..end]
            .iter()
            .map(|rv| dot_product_simd(rv, vector))
            .enumerate()
            .fold(0u64, |acc, (i, proj)| {
                if proj >= 0.0 {
                    acc | (1 << i)
                } else {
                    acc
                }
            })
    }

    pub fn add(&mut self, seq: u64, vector: &[Number]) {
        for i in 0..self.num_tables {
            let hash = self.hash_vector(vector, i);
            self.hash_tables[i].entry(hash).or_default().push(seq);
        }
        self.len += 1;
    }

    /// `vector` must be the one `seq` was added with.
    pub fn remove(&mut self, seq: u64, vector: &[Number]) {
        let mut removed = false;
        for i in 0..self.num_tables {
            let hash = self.hash_vector(vector, i);
            if let Some(bucket) = self.hash_tables[i].get_mut(&hash) {
                let before = bucket.len();
                bucket.retain(|&s| s != seq);
                removed |= bucket.len() != before;
                if bucket.is_empty() {
                    self.hash_tables[i].remove(&hash);
                }
            }
        }
        if removed {
            self.len = self.len.saturating_sub(1);
        }
    }

    /// Sequence numbers sharing a bucket with `query`, probing every bucket one bit away.
    pub fn candidates(&self, query: &[Number]) -> BTreeSet<u64> {
        let mut candidates = BTreeSet::new();

        for i in 0..self.num_tables {
            let query_hash = self.hash_vector(query, i);
            let probes =
                std::iter::once(query_hash).chain((0..self.num_projections).map(|j| query_hash ^ (1 << j)));
            for probe in probes {
                if let Some(bucket) = self.hash_tables[i].get(&probe) {
                    candidates.extend(bucket);
                }
            }
        }

        tracing::debug!(candidates = candidates.len(), "ann candidate shortlist");
        candidates
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once the corpus has outgrown the size the tables were tuned for.
    pub fn needs_rebuild(&self) -> bool {
        self.len > self.built_for * 2
    }
}

/// Fraction of `exact` ids that also appear in `approximate`.
pub fn recall_at_k(approximate: &[String], exact: &[String]) -> f64 {
    if exact.is_empty() {
        return 1.0;
    }
    let found = exact.iter().filter(|id| approximate.contains(id)).count();
    found as f64 / exact.len() as f64
}
