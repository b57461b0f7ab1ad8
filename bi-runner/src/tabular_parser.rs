//! Tabular file parsing with automatic type inference.
//!
//! Reads CSV, TSV, spreadsheet and JSON-records files into a
//! [`python_sandbox::Table`] of typed cells, so snippets receive numbers as
//! numbers and blanks as `None` without any cleaning of their own:
//! - Missing markers (`N/A`, `null`, `-`, ...) become `Null`
//! - Currency symbols, thousands separators and accounting negatives are stripped
//! - Percentages become fractions
//! - Recognized dates become ISO 8601 text

use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use python_sandbox::{CellValue, Table};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Why a dataset file could not be turned into a table
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset file not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("workbook error: {0}")]
    Workbook(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed dataset: {0}")]
    Malformed(String),

    #[error("dataset '{name}' not found; available: {available:?}")]
    UnknownDataset { name: String, available: Vec<String> },
}

/// On-disk format of a dataset file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
    Tsv,
    Excel,
    Json,
    /// Delimiter sniffed from the first line
    Delimited,
}

impl FileType {
    /// Guess from the file extension. Unknown extensions are sniffed as
    /// delimited text; columnar binary formats are refused.
    pub fn from_path(path: &Path) -> Result<FileType, DatasetError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "parquet" | "feather" | "arrow" => Err(DatasetError::UnsupportedFileType(extension)),
            _ => Ok(extension.parse().unwrap_or(FileType::Delimited)),
        }
    }
}

impl FromStr for FileType {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(FileType::Csv),
            "tsv" | "tab" => Ok(FileType::Tsv),
            "excel" | "xls" | "xlsx" | "xlsm" | "xlsb" | "ods" => Ok(FileType::Excel),
            "json" => Ok(FileType::Json),
            "txt" | "delimited" => Ok(FileType::Delimited),
            other => Err(DatasetError::UnsupportedFileType(other.to_string())),
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileType::Csv => "csv",
            FileType::Tsv => "tsv",
            FileType::Excel => "excel",
            FileType::Json => "json",
            FileType::Delimited => "delimited",
        };
        f.write_str(name)
    }
}

/// Reader options a dataset entry may carry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabularOptions {
    /// Field delimiter for text formats, overriding the format default
    pub delimiter: Option<char>,
    /// Worksheet to read; the first one when absent
    pub sheet: Option<String>,
    /// Stop after this many data rows
    pub max_rows: Option<usize>,
}

/// Inferred column type, as shown when describing a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    DateTime,
    #[serde(rename = "str")]
    Text,
    /// More than one non-numeric type in the column
    Mixed,
}

impl ColumnType {
    fn of(cell: &CellValue) -> Option<ColumnType> {
        match cell {
            CellValue::Null => None,
            CellValue::Bool(_) => Some(ColumnType::Bool),
            CellValue::Int(_) => Some(ColumnType::Int),
            CellValue::Float(_) => Some(ColumnType::Float),
            CellValue::DateTime(_) => Some(ColumnType::DateTime),
            CellValue::Text(_) => Some(ColumnType::Text),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::DateTime => "datetime",
            ColumnType::Text => "str",
            ColumnType::Mixed => "mixed",
        };
        f.write_str(name)
    }
}

/// Per-column summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
    pub null_count: usize,
    pub sample_values: Vec<String>,
}

/// A parsed file: the table plus its column summary
#[derive(Debug, Clone)]
pub struct ParsedTable {
    pub file_name: String,
    pub file_type: FileType,
    pub table: Table,
    pub columns: Vec<ColumnInfo>,
}

impl ParsedTable {
    pub fn row_count(&self) -> usize {
        self.table.row_count()
    }
}

/// Parse `path` as `file_type` (detected from the extension when `None`)
pub fn parse_tabular_file(
    path: &Path,
    file_type: Option<FileType>,
    options: &TabularOptions,
) -> Result<ParsedTable, DatasetError> {
    if !path.exists() {
        return Err(DatasetError::NotFound(path.to_path_buf()));
    }
    let file_type = match file_type {
        Some(file_type) => file_type,
        None => FileType::from_path(path)?,
    };

    let (columns, mut rows) = match file_type {
        FileType::Csv => read_delimited(path, delimiter_byte(options, b',')?)?,
        FileType::Tsv => read_delimited(path, delimiter_byte(options, b'\t')?)?,
        FileType::Delimited => {
            let delimiter = match options.delimiter {
                Some(_) => delimiter_byte(options, b',')?,
                None => sniff_delimiter(path)?,
            };
            read_delimited(path, delimiter)?
        }
        FileType::Excel => read_workbook(path, options.sheet.as_deref())?,
        FileType::Json => read_json_records(path)?,
    };

    if let Some(limit) = options.max_rows {
        rows.truncate(limit);
    }

    let table = Table::new(columns, rows);
    let columns = describe_columns(&table);
    tracing::debug!(
        path = %path.display(),
        %file_type,
        rows = table.row_count(),
        columns = table.column_count(),
        "parsed tabular file"
    );

    Ok(ParsedTable {
        file_name: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string(),
        file_type,
        table,
        columns,
    })
}

type RawTable = (Vec<String>, Vec<Vec<CellValue>>);

fn delimiter_byte(options: &TabularOptions, default: u8) -> Result<u8, DatasetError> {
    match options.delimiter {
        None => Ok(default),
        Some(c) if c.is_ascii() => Ok(c as u8),
        Some(c) => Err(DatasetError::Malformed(format!("delimiter {:?} is not a single-byte character", c))),
    }
}

fn read_delimited(path: &Path, delimiter: u8) -> Result<RawTable, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(infer_cell).collect());
    }
    Ok((columns, rows))
}

/// Pick the most frequent of `,`, `\t` and `;` in the first line
fn sniff_delimiter(path: &Path) -> Result<u8, DatasetError> {
    let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let header = content.lines().next().unwrap_or_default();

    let delimiter = [b',', b'\t', b';']
        .into_iter()
        .max_by_key(|d| (header.matches(*d as char).count(), *d == b','))
        .unwrap_or(b',');
    Ok(delimiter)
}

fn read_workbook(path: &Path, sheet: Option<&str>) -> Result<RawTable, DatasetError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| DatasetError::Workbook(e.to_string()))?;

    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| DatasetError::Workbook("workbook has no worksheets".to_string()))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| DatasetError::Workbook(format!("sheet '{}': {}", sheet_name, e)))?;

    let mut sheet_rows = range.rows();
    let columns = sheet_rows
        .next()
        .map(|header| header.iter().map(header_text).collect())
        .unwrap_or_default();
    let rows = sheet_rows
        .map(|row| row.iter().map(workbook_cell).collect())
        .collect();
    Ok((columns, rows))
}

fn header_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Spreadsheet cells arrive typed; only text still needs inference
fn workbook_cell(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Null,
        Data::Bool(b) => CellValue::Bool(*b),
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => whole_or_float(*f),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => infer_cell(s),
        Data::DateTime(dt) => excel_serial_to_iso(dt.as_f64())
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Float(dt.as_f64())),
    }
}

fn whole_or_float(f: f64) -> CellValue {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        CellValue::Int(f as i64)
    } else {
        CellValue::Float(f)
    }
}

/// Spreadsheet serial dates count days from 1899-12-30
fn excel_serial_to_iso(serial: f64) -> Option<String> {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    let moment = epoch.checked_add_signed(Duration::milliseconds(millis))?;
    if moment.num_seconds_from_midnight() == 0 {
        Some(moment.date().format("%Y-%m-%d").to_string())
    } else {
        Some(moment.format("%Y-%m-%dT%H:%M:%S").to_string())
    }
}

/// A JSON array of objects; columns in first-seen key order
fn read_json_records(path: &Path) -> Result<RawTable, DatasetError> {
    let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let Value::Array(records) = serde_json::from_str::<Value>(&content)? else {
        return Err(DatasetError::Malformed("expected a JSON array of records".to_string()));
    };

    let mut columns: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in &records {
        let Value::Object(fields) = record else {
            return Err(DatasetError::Malformed("every record must be a JSON object".to_string()));
        };
        for key in fields.keys() {
            if !index.contains_key(key) {
                index.insert(key.clone(), columns.len());
                columns.push(key.clone());
            }
        }
    }

    let rows = records
        .iter()
        .filter_map(Value::as_object)
        .map(|fields| {
            let mut row = vec![CellValue::Null; columns.len()];
            for (key, value) in fields {
                if let Some(&i) = index.get(key) {
                    row[i] = json_cell(value);
                }
            }
            row
        })
        .collect();
    Ok((columns, rows))
}

fn json_cell(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::Null,
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CellValue::Int(i),
            None => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Null),
        },
        Value::String(s) => infer_cell(s),
        nested => CellValue::Text(nested.to_string()),
    }
}

// ============ Type Inference ============

const MISSING_MARKERS: &[&str] = &["n/a", "na", "null", "nil", "none", "-", "--", ".", "#n/a", "#null", "nan"];

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₹', '₽', '₩', '฿'];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

// US order wins over EU order when both parse
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m/%d/%y",
    "%m-%d-%Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d %Y",
    "%B %d %Y",
];

/// Infer the type of one raw text cell
pub fn infer_cell(raw: &str) -> CellValue {
    let text = raw.trim();
    if is_missing(text) {
        CellValue::Null
    } else if let Some(b) = parse_bool(text) {
        CellValue::Bool(b)
    } else if let Some(number) = parse_number(text) {
        number
    } else if let Some(iso) = parse_datetime(text) {
        CellValue::DateTime(iso)
    } else {
        CellValue::Text(text.to_string())
    }
}

fn is_missing(text: &str) -> bool {
    text.is_empty() || MISSING_MARKERS.contains(&text.to_lowercase().as_str())
}

/// Word booleans only; `1`/`0` stay integers
fn parse_bool(text: &str) -> Option<bool> {
    match text.to_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<CellValue> {
    let (body, percent) = match text.strip_suffix('%') {
        Some(body) => (body.trim_end(), true),
        None => (text, false),
    };

    let mut cleaned: String = body
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c) && *c != ',')
        .collect();
    if let Some(inner) = cleaned.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        cleaned = format!("-{}", inner.trim());
    }
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(i) = cleaned.parse::<i64>() {
        return Some(if percent {
            CellValue::Float(i as f64 / 100.0)
        } else {
            CellValue::Int(i)
        });
    }

    // `inf` and `nan` parse as floats but are text here
    let f = cleaned.parse::<f64>().ok().filter(|f| f.is_finite())?;
    Some(CellValue::Float(if percent { f / 100.0 } else { f }))
}

fn parse_datetime(text: &str) -> Option<String> {
    if let Some(moment) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
    {
        return Some(moment.format("%Y-%m-%dT%H:%M:%S").to_string());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

// ============ Column Analysis ============

/// Dominant type, null count and a few samples for every column
pub fn describe_columns(table: &Table) -> Vec<ColumnInfo> {
    table
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut types: HashMap<ColumnType, usize> = HashMap::new();
            let mut null_count = 0;
            let mut sample_values = Vec::new();

            for row in &table.rows {
                match row.get(i).and_then(|cell| ColumnType::of(cell).map(|t| (cell, t))) {
                    Some((cell, column_type)) => {
                        *types.entry(column_type).or_default() += 1;
                        if sample_values.len() < 3 {
                            sample_values.push(sample_text(cell));
                        }
                    }
                    None => null_count += 1,
                }
            }

            ColumnInfo {
                name: name.clone(),
                column_type: dominant_type(&types),
                null_count,
                sample_values,
            }
        })
        .collect()
}

fn dominant_type(types: &HashMap<ColumnType, usize>) -> ColumnType {
    let mut present = types.keys().copied();
    match (present.next(), present.next()) {
        // All null
        (None, _) => ColumnType::Text,
        (Some(only), None) => only,
        _ if types.keys().all(|t| matches!(t, ColumnType::Int | ColumnType::Float)) => ColumnType::Float,
        _ => ColumnType::Mixed,
    }
}

fn sample_text(cell: &CellValue) -> String {
    match cell {
        CellValue::Float(f) => format!("{:.2}", f),
        CellValue::Text(s) if s.chars().count() > 20 => {
            format!("{}...", s.chars().take(17).collect::<String>())
        }
        CellValue::Text(s) => format!("\"{}\"", s),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_markers() {
        for marker in ["", "N/A", "null", "NULL", "-", "NA", "NaN", "#N/A"] {
            assert_eq!(infer_cell(marker), CellValue::Null, "{:?}", marker);
        }
        assert_eq!(infer_cell("0"), CellValue::Int(0));
        assert_eq!(infer_cell("  "), CellValue::Null);
    }

    #[test]
    fn test_word_booleans_only() {
        assert_eq!(infer_cell("TRUE"), CellValue::Bool(true));
        assert_eq!(infer_cell("no"), CellValue::Bool(false));
        assert_eq!(infer_cell("1"), CellValue::Int(1));
        assert_eq!(infer_cell("Y"), CellValue::Text("Y".into()));
    }

    #[test]
    fn test_numbers_with_decoration() {
        assert_eq!(infer_cell("  123 "), CellValue::Int(123));
        assert_eq!(infer_cell(".5"), CellValue::Float(0.5));
        assert_eq!(infer_cell("$1,234.56"), CellValue::Float(1234.56));
        assert_eq!(infer_cell("£1,000"), CellValue::Int(1000));
        assert_eq!(infer_cell("12.5%"), CellValue::Float(0.125));
        assert_eq!(infer_cell("50 %"), CellValue::Float(0.5));
        assert_eq!(infer_cell("(123)"), CellValue::Int(-123));
        assert_eq!(infer_cell("($1,234.56)"), CellValue::Float(-1234.56));
        assert_eq!(infer_cell("inf"), CellValue::Text("inf".into()));
        assert_eq!(infer_cell("$"), CellValue::Text("$".into()));
    }

    #[test]
    fn test_dates_become_iso() {
        assert_eq!(infer_cell("2024-01-15"), CellValue::DateTime("2024-01-15".into()));
        assert_eq!(infer_cell("12/25/2024"), CellValue::DateTime("2024-12-25".into()));
        assert_eq!(infer_cell("25/12/2024"), CellValue::DateTime("2024-12-25".into()));
        assert_eq!(infer_cell("Jan 5, 2024"), CellValue::DateTime("2024-01-05".into()));
        assert_eq!(
            infer_cell("2024-01-15 14:30:00"),
            CellValue::DateTime("2024-01-15T14:30:00".into())
        );
    }

    #[test]
    fn test_excel_serial_dates() {
        assert_eq!(excel_serial_to_iso(45306.0).as_deref(), Some("2024-01-15"));
        assert_eq!(excel_serial_to_iso(45306.5).as_deref(), Some("2024-01-15T12:00:00"));
    }

    #[test]
    fn test_column_types() {
        let table = Table::new(
            vec!["name".into(), "value".into(), "when".into(), "odd".into()],
            vec![
                vec![CellValue::Text("a".into()), CellValue::Int(1), CellValue::Null, CellValue::Int(1)],
                vec![CellValue::Text("b".into()), CellValue::Float(2.5), CellValue::Null, CellValue::Text("x".into())],
            ],
        );
        let columns = describe_columns(&table);
        assert_eq!(columns[0].column_type, ColumnType::Text);
        assert_eq!(columns[1].column_type, ColumnType::Float);
        assert_eq!(columns[2].column_type, ColumnType::Text);
        assert_eq!(columns[2].null_count, 2);
        assert_eq!(columns[3].column_type, ColumnType::Mixed);
        assert_eq!(columns[0].sample_values, vec!["\"a\"", "\"b\""]);
    }

    #[test]
    fn test_sniffed_semicolons() {
        let file = write_temp(".txt", "region;units\nnorth;12\nsouth;7\n");
        let parsed = parse_tabular_file(file.path(), None, &TabularOptions::default()).unwrap();
        assert_eq!(parsed.file_type, FileType::Delimited);
        assert_eq!(parsed.table.columns, vec!["region", "units"]);
        assert_eq!(parsed.table.rows[1][1], CellValue::Int(7));
    }

    #[test]
    fn test_json_records_union_columns() {
        let file = write_temp(
            ".json",
            r#"[{"region": "north", "units": 3}, {"region": "south", "opened": "2023-04-01"}]"#,
        );
        let parsed = parse_tabular_file(file.path(), None, &TabularOptions::default()).unwrap();
        assert_eq!(parsed.table.columns, vec!["region", "units", "opened"]);
        assert_eq!(parsed.table.rows[0][2], CellValue::Null);
        assert_eq!(parsed.table.rows[1][2], CellValue::DateTime("2023-04-01".into()));
    }

    #[test]
    fn test_json_must_be_records() {
        let file = write_temp(".json", r#"{"region": "north"}"#);
        let err = parse_tabular_file(file.path(), None, &TabularOptions::default()).unwrap_err();
        assert!(matches!(err, DatasetError::Malformed(_)));
    }

    #[test]
    fn test_max_rows_and_explicit_delimiter() {
        let file = write_temp(".csv", "a|b\n1|2\n3|4\n5|6\n");
        let options = TabularOptions {
            delimiter: Some('|'),
            max_rows: Some(2),
            ..Default::default()
        };
        let parsed = parse_tabular_file(file.path(), Some(FileType::Csv), &options).unwrap();
        assert_eq!(parsed.row_count(), 2);
        assert_eq!(parsed.table.rows[1], vec![CellValue::Int(3), CellValue::Int(4)]);
    }

    #[test]
    fn test_file_type_names() {
        assert_eq!("XLSX".parse::<FileType>().unwrap(), FileType::Excel);
        assert_eq!(FileType::from_path(Path::new("data/sales.tsv")).unwrap(), FileType::Tsv);
        assert_eq!(FileType::from_path(Path::new("data/sales.dat")).unwrap(), FileType::Delimited);
        assert!(FileType::from_path(Path::new("data/sales.parquet")).is_err());
        assert!(matches!(
            "parquet".parse::<FileType>(),
            Err(DatasetError::UnsupportedFileType(name)) if name == "parquet"
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = parse_tabular_file(Path::new("/nonexistent/sales.csv"), None, &TabularOptions::default()).unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }
}
