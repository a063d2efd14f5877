use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use docrag::config::{self, Settings};
use docrag::{
    embedder, Document, Embedder, Grounding, IndexOptions, Ingestor, RetrievalResult, Retriever,
    Segmenter, VectorIndex,
};

#[derive(Parser)]
#[command(name = "docrag")]
#[command(version = "0.1")]
#[command(about = "Grounded retrieval over uploaded documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment, embed and index one or more text files (`-` reads stdin) as a single upload.
    /// `--- PAGE n ---` lines mark pages; restarted numbering within a file starts a new document.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Source name recorded with every chunk of a single file; defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Retrieve the chunks that best ground an answer to QUESTION.
    Ask {
        question: String,
        #[arg(long)]
        k: Option<usize>,
        /// Print the attributed context block instead of JSON.
        #[arg(long)]
        context: bool,
    },
    /// List indexed chunk ids in insertion order.
    List,
    Config,
    /// Delete every record in the configured corpus.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

fn open_index(settings: &Settings, embedder: &dyn Embedder) -> Result<Arc<VectorIndex>> {
    let path = settings.index_path();
    let index = VectorIndex::open(&path, IndexOptions::from_settings(settings, embedder))
        .with_context(|| format!("Failed to open index at '{}'", path.display()))?;
    Ok(Arc::new(index))
}

fn read_source(file: &Path) -> Result<String> {
    if file.as_os_str() == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).context("Failed to read stdin")?;
        Ok(buf)
    } else {
        fs::read_to_string(file).with_context(|| format!("Failed to read '{}'", file.display()))
    }
}

fn ingest_command(settings: &Settings, embedder: Arc<dyn Embedder>, files: Vec<PathBuf>, name: Option<String>) -> Result<()> {
    if name.is_some() && files.len() > 1 {
        anyhow::bail!("--name applies to a single file; got {} files.", files.len());
    }
    if files.iter().filter(|file| file.as_os_str() == "-").count() > 1 {
        anyhow::bail!("stdin ('-') can only be read once.");
    }

    let mut documents = Vec::new();
    for file in &files {
        let raw = read_source(file)?;
        let source = name.clone().or_else(|| {
            file.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .filter(|n| n != "-")
        });
        documents.extend(Document::split_marked_text(source, &raw));
    }

    let index = open_index(settings, embedder.as_ref())?;
    let ingestor = Ingestor::new(
        Segmenter::from_settings(settings)?,
        embedder,
        index.clone(),
        settings.ingest_batch_size,
    )?;
    let report = ingestor.ingest_all(&documents)?;

    let output = serde_json::json!({
        "corpus": settings.corpus,
        "files": files.len(),
        "documents": documents.iter().map(|d| d.name.clone()).collect::<Vec<_>>(),
        "pages": documents.iter().map(|d| d.pages.len()).sum::<usize>(),
        "report": report,
        "database_record_count": index.len()?,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn ask_command(settings: &Settings, embedder: Arc<dyn Embedder>, question: &str, k: Option<usize>, context: bool) -> Result<()> {
    let k = k.unwrap_or(settings.top_k);
    // querying must not create the corpus as a side effect
    let result = if VectorIndex::exists(settings.index_path()) {
        let index = open_index(settings, embedder.as_ref())?;
        let retriever = Retriever::from_settings(settings, embedder, index)?;
        retriever.retrieve_k(question, k)?
    } else {
        RetrievalResult::empty(question, Grounding::EmptyCorpus)
    };

    if context {
        println!("{}", result.render_context());
        return Ok(());
    }

    let output = serde_json::json!({
        "question": result.question,
        "grounding": result.grounding,
        "results": result.hits.iter().map(|hit| {
            serde_json::json!({
                "id": hit.chunk.id,
                "similarity": hit.score,
                "text": hit.chunk.text,
                "metadata": hit.chunk.metadata,
            })
        }).collect::<Vec<_>>(),
        "actual_results_count": result.len(),
        "requested_results_count": k,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn list_command(settings: &Settings, embedder: Arc<dyn Embedder>) -> Result<()> {
    if !VectorIndex::exists(settings.index_path()) {
        return Ok(());
    }
    let index = open_index(settings, embedder.as_ref())?;
    for id in index.ids()? {
        println!("{}", id);
    }
    Ok(())
}

fn reset_command(settings: &Settings, embedder: Arc<dyn Embedder>, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to reset corpus '{}' without --yes.", settings.corpus);
    }
    if !VectorIndex::exists(settings.index_path()) {
        return Ok(());
    }
    open_index(settings, embedder.as_ref())?.reset()?;
    eprintln!("Corpus '{}' reset.", settings.corpus);
    Ok(())
}

fn main() -> Result<()> {
    config::init_logging();
    let args = Cli::parse();
    let settings = Settings::load()?;

    if let Commands::Config = args.command {
        settings.print_config();
        return Ok(());
    }
    let embedder = embedder::from_settings(&settings)
        .with_context(|| format!("Failed to load embedding model '{}'", settings.embedding_model))?;

    match args.command {
        Commands::Ingest { files, name } => ingest_command(&settings, embedder, files, name)?,
        Commands::Ask { question, k, context } => ask_command(&settings, embedder, &question, k, context)?,
        Commands::List => list_command(&settings, embedder)?,
        Commands::Config => settings.print_config(),
        Commands::Reset { yes } => reset_command(&settings, embedder, yes)?,
    }
    Ok(())
}
