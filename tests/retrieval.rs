use std::path::Path;
use std::sync::Arc;

use docrag::vector_ops::dot_product_simd;
use docrag::{
    normalize, segment, Document, Embedder, Grounding, HashingEmbedder, IndexError, IndexOptions,
    Ingestor, Retriever, Segmenter, VectorIndex,
};

const DIMENSION: usize = 384;

const REPORT: &str = "--- PAGE 1 ---
Project Atlas overview. The budget is $1.2 million [1]. Funding is released quarterly.

--- PAGE 2 ---
Risks include market volatility and supplier delays [2]. Mitigation relies on hedging.

--- PAGE 3 ---
Unrelated sentence about weather. It rained on the site visit.";

fn open_index(dir: &Path, embedder: &dyn Embedder) -> Arc<VectorIndex> {
    let mut options = IndexOptions::new("docs", embedder.dimension(), embedder.model_id());
    options.map_size = 64 * 1024 * 1024;
    Arc::new(VectorIndex::open(dir, options).unwrap())
}

fn ingest_report(dir: &Path) -> (Arc<dyn Embedder>, Arc<VectorIndex>) {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(DIMENSION));
    let index = open_index(dir, embedder.as_ref());
    let ingestor = Ingestor::new(Segmenter::new(120, 20).unwrap(), embedder.clone(), index.clone(), 4).unwrap();
    let document = Document::from_marked_text(Some("atlas.txt".into()), REPORT).unwrap();
    ingestor.ingest(&document).unwrap();
    (embedder, index)
}

#[test]
fn ingesting_twice_leaves_the_index_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (embedder, index) = ingest_report(dir.path());
    let ids = index.ids().unwrap();

    let ingestor = Ingestor::new(Segmenter::new(120, 20).unwrap(), embedder, index.clone(), 4).unwrap();
    let document = Document::from_marked_text(Some("atlas.txt".into()), REPORT).unwrap();
    let report = ingestor.ingest(&document).unwrap();

    assert_eq!(report.inserted, 0);
    assert_eq!(index.ids().unwrap(), ids);
}

#[test]
fn chunks_respect_size_and_overlap() {
    let text = "Sentence number one is here. ".repeat(80);
    for (max, overlap) in [(100, 0), (100, 20), (250, 50), (1000, 200)] {
        let chunks = segment(&text, max, overlap).unwrap();
        assert!(chunks.iter().all(|c| c.char_len() <= max));
        for pair in chunks.windows(2) {
            let tail: String = pair[0].text.chars().skip(pair[0].char_len() - overlap).collect();
            let head: String = pair[1].text.chars().take(overlap).collect();
            assert_eq!(tail, head);
        }
    }
}

#[test]
fn normalization_is_idempotent() {
    for text in [REPORT, "a [1][2] b", "x [[3]] y", "  spaced\t\tout \n text  "] {
        let once = normalize(text);
        assert_eq!(normalize(&once), once);
    }
}

#[test]
fn budget_question_grounds_on_the_budget_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let (embedder, index) = ingest_report(dir.path());
    let retriever = Retriever::new(embedder, index).unwrap().with_top_k(1);

    let result = retriever.retrieve("What is the budget?").unwrap();
    assert_eq!(result.grounding, Grounding::Sufficient);
    assert_eq!(result.len(), 1);
    let top = &result.hits[0].chunk;
    assert!(top.text.contains("$1.2 million"));
    assert_eq!(top.source_page(), Some(1));
    assert!(!top.text.contains("[1]"));
}

#[test]
fn query_results_are_ordered_by_score() {
    let dir = tempfile::tempdir().unwrap();
    let (embedder, index) = ingest_report(dir.path());
    let query = embedder.embed("supplier risk and weather").unwrap();
    let hits = index.query(&query, 5).unwrap();
    assert_eq!(hits.len(), index.len().unwrap().min(5));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn empty_index_retrieves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(DIMENSION));
    let index = open_index(dir.path(), embedder.as_ref());
    let result = Retriever::new(embedder, index).unwrap().retrieve("What is the budget?").unwrap();
    assert!(result.is_empty());
    assert_eq!(result.grounding, Grounding::EmptyCorpus);
}

#[test]
fn wrong_dimension_query_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_, index) = ingest_report(dir.path());
    let short = HashingEmbedder::new(DIMENSION / 2).embed("budget").unwrap();
    assert!(matches!(
        index.query(&short, 3),
        Err(IndexError::DimensionMismatch { .. })
    ));
}

#[test]
fn embedding_the_same_text_twice_agrees() {
    let embedder = HashingEmbedder::new(DIMENSION);
    let a = embedder.embed("Risks include market volatility.").unwrap();
    let b = embedder.embed("Risks include market volatility.").unwrap();
    assert!(dot_product_simd(&a, &b) >= 0.9999);
}

#[test]
fn index_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let ids = {
        let (_, index) = ingest_report(dir.path());
        index.ids().unwrap()
    };
    assert!(VectorIndex::exists(dir.path()));

    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(DIMENSION));
    let index = open_index(dir.path(), embedder.as_ref());
    assert_eq!(index.ids().unwrap(), ids);

    let result = Retriever::new(embedder, index).unwrap().retrieve("budget million").unwrap();
    assert!(result.hits[0].chunk.text.contains("budget"));
}
