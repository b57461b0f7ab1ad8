//! Local dataset registry
//!
//! Datasets are declared in configuration (or on the command line) and read
//! from disk on demand. A file that fails to load is logged and left out of
//! the bundle; it never stops the other datasets from reaching the sandbox.
//!
//! Parsed tables are cached per dataset and reused while the file's CRC32 is
//! unchanged, so repeated executions only pay for a read and a checksum.

use lru::LruCache;
use python_sandbox::{DatasetBundle, DatasetProvider, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::tabular_parser::{parse_tabular_file, DatasetError, FileType, ParsedTable, TabularOptions};

/// A dataset file and how to read it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDataset {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub description: String,
    /// Detected from the extension when absent
    #[serde(default)]
    pub file_type: Option<FileType>,
    #[serde(default)]
    pub options: TabularOptions,
}

impl LocalDataset {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            description: String::new(),
            file_type: None,
            options: TabularOptions::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn load(&self) -> Result<ParsedTable, DatasetError> {
        parse_tabular_file(&self.path, self.file_type, &self.options)
    }

    fn file_type_label(&self) -> String {
        match self.file_type {
            Some(file_type) => file_type.to_string(),
            None => FileType::from_path(&self.path)
                .map(|t| t.to_string())
                .unwrap_or_else(|_| "unsupported".to_string()),
        }
    }
}

/// One line of `list_datasets`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub path: String,
    pub description: String,
    pub file_type: String,
}

/// Metadata available without loading the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetInfo {
    #[serde(flatten)]
    pub summary: DatasetSummary,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

const PARSE_CACHE_CAPACITY: usize = 16;

struct CachedTable {
    crc: u32,
    table: Arc<Table>,
}

#[derive(Clone)]
pub struct LocalDatasetManager {
    datasets: BTreeMap<String, LocalDataset>,
    /// Parsed tables keyed by dataset name
    parse_cache: Arc<Mutex<LruCache<String, CachedTable>>>,
}

impl Default for LocalDatasetManager {
    fn default() -> Self {
        let capacity = NonZeroUsize::new(PARSE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            datasets: BTreeMap::new(),
            parse_cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }
}

impl std::fmt::Debug for LocalDatasetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDatasetManager")
            .field("datasets", &self.datasets)
            .finish_non_exhaustive()
    }
}

impl LocalDatasetManager {
    pub fn new(datasets: impl IntoIterator<Item = LocalDataset>) -> Self {
        let mut manager = Self::default();
        for dataset in datasets {
            manager.add_dataset(dataset);
        }
        manager
    }

    /// Register a dataset, replacing any with the same name
    pub fn add_dataset(&mut self, dataset: LocalDataset) {
        if self.datasets.contains_key(&dataset.name) {
            tracing::warn!(dataset = %dataset.name, "replacing previously registered dataset");
            self.cache().pop(&dataset.name);
        }
        self.datasets.insert(dataset.name.clone(), dataset);
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    fn lookup(&self, name: &str) -> Result<&LocalDataset, DatasetError> {
        self.datasets.get(name).ok_or_else(|| DatasetError::UnknownDataset {
            name: name.to_string(),
            available: self.datasets.keys().cloned().collect(),
        })
    }

    /// Load one dataset by name
    pub fn get_dataset(&self, name: &str) -> Result<ParsedTable, DatasetError> {
        self.lookup(name)?.load()
    }

    pub fn list_datasets(&self) -> Vec<DatasetSummary> {
        self.datasets.values().map(summarize).collect()
    }

    pub fn get_dataset_info(&self, name: &str) -> Result<DatasetInfo, DatasetError> {
        let dataset = self.lookup(name)?;
        let metadata = std::fs::metadata(&dataset.path).ok();
        Ok(DatasetInfo {
            summary: summarize(dataset),
            exists: metadata.is_some(),
            file_size: metadata.map(|m| m.len()),
        })
    }

    /// Load every registered dataset; failures are logged and skipped
    pub fn load_all_datasets(&self) -> DatasetBundle {
        let mut bundle = DatasetBundle::new();
        for (name, dataset) in &self.datasets {
            match self.load_table(name, dataset) {
                Ok(table) => {
                    tracing::info!(
                        dataset = %name,
                        rows = table.row_count(),
                        columns = table.column_count(),
                        "loaded dataset"
                    );
                    bundle.insert_shared(name.clone(), table);
                }
                Err(e) => tracing::error!(dataset = %name, path = %dataset.path.display(), error = %e, "failed to load dataset"),
            }
        }
        bundle
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, CachedTable>> {
        self.parse_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Parse `dataset`, or reuse the cached table when the file is unchanged
    fn load_table(&self, name: &str, dataset: &LocalDataset) -> Result<Arc<Table>, DatasetError> {
        let bytes = std::fs::read(&dataset.path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => DatasetError::NotFound(dataset.path.clone()),
            _ => DatasetError::Io {
                path: dataset.path.clone(),
                source,
            },
        })?;
        let crc = crc32fast::hash(&bytes);

        if let Some(cached) = self.cache().get(name).filter(|cached| cached.crc == crc) {
            tracing::debug!(dataset = %name, crc, "dataset unchanged, reusing parsed table");
            return Ok(Arc::clone(&cached.table));
        }

        let table = Arc::new(dataset.load()?.table);
        self.cache().put(
            name.to_string(),
            CachedTable {
                crc,
                table: Arc::clone(&table),
            },
        );
        Ok(table)
    }
}

fn summarize(dataset: &LocalDataset) -> DatasetSummary {
    DatasetSummary {
        name: dataset.name.clone(),
        path: display_path(&dataset.path),
        description: dataset.description.clone(),
        file_type: dataset.file_type_label(),
    }
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

impl DatasetProvider for LocalDatasetManager {
    /// Reads the files again on every call, so edits show up in the next run
    fn load_all(&self) -> DatasetBundle {
        self.load_all_datasets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn csv_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_unknown_dataset_lists_available() {
        let manager = LocalDatasetManager::new([LocalDataset::new("sales", "/tmp/none.csv")]);
        match manager.get_dataset("orders") {
            Err(DatasetError::UnknownDataset { name, available }) => {
                assert_eq!(name, "orders");
                assert_eq!(available, vec!["sales".to_string()]);
            }
            other => panic!("expected unknown dataset, got {:?}", other.map(|p| p.file_name)),
        }
    }

    #[test]
    fn test_info_reports_existence_and_size() {
        let file = csv_file("a,b\n1,2\n");
        let manager = LocalDatasetManager::new([
            LocalDataset::new("present", file.path()).with_description("two columns"),
            LocalDataset::new("absent", "/nonexistent/absent.csv"),
        ]);

        let info = manager.get_dataset_info("present").unwrap();
        assert!(info.exists);
        assert_eq!(info.file_size, Some(8));
        assert_eq!(info.summary.file_type, "csv");
        assert_eq!(info.summary.description, "two columns");

        let info = manager.get_dataset_info("absent").unwrap();
        assert!(!info.exists);
        assert_eq!(info.file_size, None);
    }

    #[test]
    fn test_load_all_skips_broken_datasets() {
        let file = csv_file("region,units\nnorth,3\n");
        let manager = LocalDatasetManager::new([
            LocalDataset::new("sales", file.path()),
            LocalDataset::new("missing", "/nonexistent/missing.csv"),
            LocalDataset::new("columnar", "/nonexistent/facts.parquet"),
        ]);

        let bundle = manager.load_all();
        assert_eq!(bundle.names().collect::<Vec<_>>(), vec!["sales"]);
        assert_eq!(bundle.get("sales").unwrap().row_count(), 1);
    }

    #[test]
    fn test_unchanged_files_reuse_the_parsed_table() {
        let file = csv_file("region,units\nnorth,3\n");
        let manager = LocalDatasetManager::new([LocalDataset::new("sales", file.path())]);

        let first = manager.load_all();
        let second = manager.load_all();
        assert!(Arc::ptr_eq(first.get("sales").unwrap(), second.get("sales").unwrap()));

        std::fs::write(file.path(), "region,units\nnorth,3\nsouth,4\n").unwrap();
        let third = manager.load_all();
        assert!(!Arc::ptr_eq(first.get("sales").unwrap(), third.get("sales").unwrap()));
        assert_eq!(third.get("sales").unwrap().row_count(), 2);
    }

    #[test]
    fn test_replacing_a_dataset_drops_its_cached_table() {
        let first_file = csv_file("a\n1\n");
        let second_file = csv_file("a\n1\n");
        let mut manager = LocalDatasetManager::new([LocalDataset::new("numbers", first_file.path())]);
        let before = manager.load_all();

        let options = TabularOptions {
            max_rows: Some(0),
            ..TabularOptions::default()
        };
        let mut replacement = LocalDataset::new("numbers", second_file.path());
        replacement.options = options;
        manager.add_dataset(replacement);

        let after = manager.load_all();
        assert_eq!(before.get("numbers").unwrap().row_count(), 1);
        assert_eq!(after.get("numbers").unwrap().row_count(), 0);
    }

    #[test]
    fn test_list_is_ordered_by_name() {
        let manager = LocalDatasetManager::new([
            LocalDataset::new("zeta", "z.csv"),
            LocalDataset::new("alpha", "a.json"),
        ]);
        let listed = manager.list_datasets();
        assert_eq!(listed[0].name, "alpha");
        assert_eq!(listed[0].file_type, "json");
        assert_eq!(listed[1].name, "zeta");
    }

    #[test]
    fn test_dataset_entry_deserializes_with_defaults() {
        let dataset: LocalDataset = serde_json::from_value(serde_json::json!({
            "name": "regions",
            "path": "data/regions.txt",
            "file_type": "tsv",
            "options": {"max_rows": 10}
        }))
        .unwrap();
        assert_eq!(dataset.file_type, Some(FileType::Tsv));
        assert_eq!(dataset.options.max_rows, Some(10));
        assert_eq!(dataset.description, "");
    }
}
