//! Pre-loaded tabular datasets handed to executors

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A single typed cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// ISO 8601 timestamp text
    DateTime(String),
    Text(String),
}

/// Stand-in for cells missing from a short row
pub(crate) static NULL_CELL: CellValue = CellValue::Null;

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(i) => Some(*i as f64),
            CellValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Int(i) => write!(f, "{}", i),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::DateTime(s) | CellValue::Text(s) => f.write_str(s),
        }
    }
}

/// Column-named rows of cells. Rows shorter than the header are padded with nulls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, CellValue::Null);
                row
            })
            .collect();
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, top to bottom
    pub fn column(&self, name: &str) -> Option<Vec<&CellValue>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).unwrap_or(&NULL_CELL))
                .collect(),
        )
    }
}

/// Named datasets, ordered by name
#[derive(Debug, Clone, Default)]
pub struct DatasetBundle {
    datasets: BTreeMap<String, Arc<Table>>,
}

impl DatasetBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a dataset; returns the previous one under that name
    pub fn insert(&mut self, name: impl Into<String>, table: Table) -> Option<Arc<Table>> {
        self.datasets.insert(name.into(), Arc::new(table))
    }

    pub fn insert_shared(&mut self, name: impl Into<String>, table: Arc<Table>) -> Option<Arc<Table>> {
        self.datasets.insert(name.into(), table)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Table>> {
        self.datasets.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Table>)> {
        self.datasets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

impl FromIterator<(String, Table)> for DatasetBundle {
    fn from_iter<I: IntoIterator<Item = (String, Table)>>(iter: I) -> Self {
        let mut bundle = DatasetBundle::new();
        for (name, table) in iter {
            bundle.insert(name, table);
        }
        bundle
    }
}

/// Source of the datasets an executor injects into every namespace
pub trait DatasetProvider: Send + Sync {
    fn load_all(&self) -> DatasetBundle;
}

impl DatasetProvider for DatasetBundle {
    fn load_all(&self) -> DatasetBundle {
        // Tables are shared, only the map is cloned
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(
            vec!["region".into(), "revenue".into()],
            vec![
                vec![CellValue::Text("north".into()), CellValue::Int(120)],
                vec![CellValue::Text("south".into())],
            ],
        )
    }

    #[test]
    fn test_short_rows_are_padded() {
        let table = sample();
        assert_eq!(table.rows[1], vec![CellValue::Text("south".into()), CellValue::Null]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.column_count(), 2);
    }

    #[test]
    fn test_column_lookup() {
        let table = sample();
        let revenue = table.column("revenue").unwrap();
        assert_eq!(revenue, vec![&CellValue::Int(120), &CellValue::Null]);
        assert!(table.column("missing").is_none());
    }

    #[test]
    fn test_column_lookup_tolerates_unpadded_rows() {
        let table: Table = serde_json::from_value(serde_json::json!({
            "columns": ["region", "revenue"],
            "rows": [["north", 120], ["south"]]
        }))
        .unwrap();
        assert_eq!(table.column("revenue").unwrap(), vec![&CellValue::Int(120), &CellValue::Null]);
    }

    #[test]
    fn test_bundle_shares_tables() {
        let bundle: DatasetBundle = vec![("sales".to_string(), sample())].into_iter().collect();
        let loaded = bundle.load_all();
        assert!(Arc::ptr_eq(bundle.get("sales").unwrap(), loaded.get("sales").unwrap()));
        assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["sales"]);
    }

    #[test]
    fn test_cell_display() {
        assert_eq!(CellValue::Float(2.5).to_string(), "2.5");
        assert_eq!(CellValue::Null.to_string(), "");
        assert_eq!(CellValue::DateTime("2024-01-15T00:00:00".into()).to_string(), "2024-01-15T00:00:00");
    }
}
