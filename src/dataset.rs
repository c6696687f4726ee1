//! Pre-tokenized datasets and the registries that resolve them.

use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::DatasetSource;
use crate::error::{Result, TuneError};

/// One tokenized training record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedRecord {
    /// Token ids.
    pub input_ids: Vec<u32>,
    /// Attention mask, if the producer stored one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention_mask: Option<Vec<u8>>,
}

impl TokenizedRecord {
    /// Record with ids only.
    #[must_use]
    pub fn new(input_ids: Vec<u32>) -> Self {
        Self {
            input_ids,
            attention_mask: None,
        }
    }

    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the record has no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// One split of a tokenized dataset.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    split: String,
    rows: Vec<TokenizedRecord>,
}

impl Dataset {
    /// Wrap already loaded records.
    pub fn new(split: impl Into<String>, rows: Vec<TokenizedRecord>) -> Self {
        Self {
            split: split.into(),
            rows,
        }
    }

    /// Split name.
    #[must_use]
    pub fn split(&self) -> &str {
        &self.split
    }

    /// Records in order.
    #[must_use]
    pub fn rows(&self) -> &[TokenizedRecord] {
        &self.rows
    }

    /// Number of records.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Whether the split is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Approximate token count: rows times the length of the first row.
    ///
    /// Records are assumed to be packed to a common length; 0 for an empty
    /// split.
    #[must_use]
    pub fn token_volume(&self) -> usize {
        self.rows
            .first()
            .map_or(0, |first| self.rows.len() * first.len())
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dataset({{ split: {}, features: [input_ids], num_rows: {} }})",
            self.split,
            self.rows.len()
        )
    }
}

/// Source of tokenized datasets.
pub trait DatasetRegistry {
    /// Load the split named in `source`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::DatasetNotFound`] if the dataset or split does not
    /// exist.
    fn load(&self, source: &DatasetSource) -> Result<Dataset>;
}

/// Read a JSONL file of [`TokenizedRecord`]s. Blank lines are skipped.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line does not parse.
pub fn read_jsonl(path: &Path) -> Result<Vec<TokenizedRecord>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: TokenizedRecord = serde_json::from_str(&line).map_err(|e| {
            TuneError::Dataset(format!("{}:{}: {e}", path.display(), idx + 1))
        })?;
        rows.push(record);
    }
    Ok(rows)
}

/// Write records as JSONL.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_jsonl(path: &Path, rows: &[TokenizedRecord]) -> Result<()> {
    let mut content = String::new();
    for row in rows {
        content.push_str(&serde_json::to_string(row)?);
        content.push('\n');
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Datasets stored as `<root>/<repo_id>/<split>.jsonl`.
#[derive(Debug, Clone)]
pub struct LocalDatasetRegistry {
    root: PathBuf,
}

impl LocalDatasetRegistry {
    /// Create a registry rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path a split is read from.
    #[must_use]
    pub fn split_path(&self, source: &DatasetSource) -> PathBuf {
        self.root
            .join(&source.repo_id)
            .join(format!("{}.jsonl", source.split))
    }
}

impl DatasetRegistry for LocalDatasetRegistry {
    fn load(&self, source: &DatasetSource) -> Result<Dataset> {
        let path = self.split_path(source);
        if !path.is_file() {
            return Err(TuneError::DatasetNotFound(format!(
                "{} (split {}) not found under {}",
                source.repo_id,
                source.split,
                self.root.display()
            )));
        }
        let rows = read_jsonl(&path)?;
        tracing::debug!("Read {} records from {}", rows.len(), path.display());
        Ok(Dataset::new(source.split.clone(), rows))
    }
}

#[cfg(feature = "hub")]
pub use hub::HubDatasetRegistry;

#[cfg(feature = "hub")]
mod hub {
    use hf_hub::api::sync::{Api, ApiBuilder};

    use super::{read_jsonl, Dataset, DatasetRegistry};
    use crate::config::DatasetSource;
    use crate::error::{Result, TuneError};

    /// Dataset repositories on the Hugging Face hub holding `<split>.jsonl`.
    pub struct HubDatasetRegistry {
        api: Api,
    }

    impl HubDatasetRegistry {
        /// Create a registry using `HF_TOKEN` and the default cache.
        ///
        /// # Errors
        ///
        /// Returns an error if the hub client cannot be built.
        pub fn new() -> Result<Self> {
            let api = ApiBuilder::new()
                .with_token(std::env::var("HF_TOKEN").ok())
                .build()
                .map_err(|e| TuneError::Other(format!("hub client: {e}")))?;
            Ok(Self { api })
        }
    }

    impl DatasetRegistry for HubDatasetRegistry {
        fn load(&self, source: &DatasetSource) -> Result<Dataset> {
            let file = format!("{}.jsonl", source.split);
            let path = self
                .api
                .dataset(source.repo_id.clone())
                .get(&file)
                .map_err(|e| TuneError::DatasetNotFound(format!("{}/{file}: {e}", source.repo_id)))?;
            Ok(Dataset::new(source.split.clone(), read_jsonl(&path)?))
        }
    }
}
