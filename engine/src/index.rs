//! Contract of the indexer sink that receives alert documents.
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde_json::Value;

/// Options for one indexing call.
#[derive(Debug, Clone)]
pub struct IndexingOpts {
    /// Metric name the documents are indexed under.
    pub metric_name: String,
}

/// Sink for measurement documents.
pub trait Indexer: Send + Sync {
    /// Bulk-index documents, returning a short receipt for logging.
    fn index(&self, docs: &[Value], opts: &IndexingOpts) -> Result<String>;
}

/// Indexer appending JSON lines below a local directory, one file per metric.
pub struct LocalIndexer {
    directory: PathBuf,
}

impl LocalIndexer {
    /// Create the indexer, ensuring the target directory exists.
    pub fn new(directory: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("creating {}", directory.display()))?;
        Ok(Self { directory })
    }
}

impl Indexer for LocalIndexer {
    fn index(&self, docs: &[Value], opts: &IndexingOpts) -> Result<String> {
        let path = self.directory.join(format!("{}.json", opts.metric_name));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        for doc in docs {
            serde_json::to_writer(&mut file, doc)?;
            file.write_all(b"\n")?;
        }
        Ok(format!(
            "indexed {} documents into {}",
            docs.len(),
            path.display()
        ))
    }
}
