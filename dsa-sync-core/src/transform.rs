//! Spreadsheet → JSON conversion.
//!
//! The first sheet of a workbook becomes an array of row objects keyed by the
//! header row. A TMA structure workbook (`tma-structure.xlsx`) is reshaped into
//! a tissue microarray design document instead.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader};
use serde_json::{json, Map, Number, Value};
use tracing::{debug, error, info};

use crate::contract::{SheetTransformer, TransformError};

pub type Row = Map<String, Value>;

pub const STRUCTURE_FILE_NAME: &str = "tma-structure.xlsx";

/// Fields copied verbatim onto each core, in output order.
pub const CORE_BASE_PROPERTIES: &[&str] = &[
    "study_core_id",
    "core_id",
    "core_label",
    "tma_number",
    "row_index",
    "row_label",
    "col_index",
    "col_label",
    "is_empty",
];

pub const TMA_NAME_FIELD: &str = "tma_name";
pub const TMA_DOCUMENT_TYPE: &str = "tissue_microarray";
pub const TMA_LAYOUT: &str = "landscape";

/// Reads workbooks from disk with calamine.
#[derive(Debug, Clone)]
pub struct WorkbookTransformer {
    structure_file_name: String,
}

impl Default for WorkbookTransformer {
    fn default() -> Self {
        Self {
            structure_file_name: STRUCTURE_FILE_NAME.to_string(),
        }
    }
}

impl WorkbookTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different file name to trigger the structure reshaping.
    pub fn with_structure_file_name(name: impl Into<String>) -> Self {
        Self {
            structure_file_name: name.into(),
        }
    }
}

impl SheetTransformer for WorkbookTransformer {
    fn convert(&self, path: &Path, file_name: &str) -> Result<Value, TransformError> {
        let rows = read_first_sheet(path)?;
        info!(file = file_name, rows = rows.len(), "Read spreadsheet");
        Ok(transform_rows(rows, file_name, &self.structure_file_name))
    }
}

/// Pick the output shape for `file_name` and build it from already-parsed rows.
pub fn transform_rows(rows: Vec<Row>, file_name: &str, structure_file_name: &str) -> Value {
    if file_name == structure_file_name {
        debug!(file = file_name, "Reshaping rows as a TMA structure");
        reshape_structure(&rows)
    } else {
        Value::Array(rows.into_iter().map(Value::Object).collect())
    }
}

/// Build the tissue microarray design document from structure rows.
pub fn reshape_structure(rows: &[Row]) -> Value {
    let cores: Vec<Row> = rows.iter().map(core_from_row).collect();

    let num_rows = max_index(&cores, "row_index");
    let num_cols = max_index(&cores, "col_index");

    let name = rows
        .first()
        .and_then(|row| row.get(TMA_NAME_FIELD))
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()));

    json!({
        "type": TMA_DOCUMENT_TYPE,
        "name": name,
        "design": {
            "num_rows": num_rows,
            "num_cols": num_cols,
            "layout": TMA_LAYOUT,
            "cores": cores,
        }
    })
}

fn core_from_row(row: &Row) -> Row {
    let mut core = Map::new();
    for key in CORE_BASE_PROPERTIES {
        if let Some(value) = row.get(*key) {
            core.insert((*key).to_string(), value.clone());
        }
    }

    let annotations: Row = row
        .iter()
        .filter(|(key, _)| {
            !CORE_BASE_PROPERTIES.contains(&key.as_str()) && key.as_str() != TMA_NAME_FIELD
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    core.insert("core_annotations".to_string(), Value::Object(annotations));
    core
}

/// Largest numeric value of `field` across cores; missing or non-numeric counts as 0.
fn max_index(cores: &[Row], field: &str) -> Value {
    let max = cores
        .iter()
        .map(|core| core.get(field).and_then(as_index).unwrap_or(0.0))
        .fold(0.0_f64, f64::max);
    number_value(max).unwrap_or_else(|| json!(0))
}

fn as_index(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Whole numbers serialize as integers, like the spreadsheet shows them.
fn number_value(n: f64) -> Option<Value> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Some(Value::Number(Number::from(n as i64)))
    } else {
        Number::from_f64(n).map(Value::Number)
    }
}

fn read_first_sheet(path: &Path) -> Result<Vec<Row>, TransformError> {
    if !path.exists() {
        error!(path = %path.display(), "Spreadsheet not found");
        return Err(TransformError::NotFound(path.display().to_string()));
    }

    let mut workbook = open_workbook_auto(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to open workbook");
        TransformError::Workbook(e.to_string())
    })?;

    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| TransformError::EmptyWorkbook(path.display().to_string()))?;

    let range = workbook.worksheet_range(&sheet).map_err(|e| {
        error!(path = %path.display(), sheet = %sheet, error = %e, "Failed to read sheet");
        TransformError::Workbook(e.to_string())
    })?;

    Ok(rows_to_objects(&range))
}

/// First row is the header; blank rows are dropped and empty cells omitted.
pub fn rows_to_objects(range: &Range<Data>) -> Vec<Row> {
    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Vec::new();
    };
    let headers = header_keys(header_row);

    rows.filter_map(|cells| {
        let row: Row = headers
            .iter()
            .zip(cells.iter())
            .filter_map(|(key, cell)| cell_value(cell).map(|value| (key.clone(), value)))
            .collect();
        (!row.is_empty()).then_some(row)
    })
    .collect()
}

/// Header texts, with blanks named `__EMPTY` and repeats suffixed `_1`, `_2`, ...
fn header_keys(cells: &[Data]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(cells.len());
    for cell in cells {
        let base = match cell_value(cell) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => "__EMPTY".to_string(),
        };
        let mut key = base.clone();
        let mut n = 0;
        while keys.contains(&key) {
            n += 1;
            key = format!("{base}_{n}");
        }
        keys.push(key);
    }
    keys
}

fn cell_value(cell: &Data) -> Option<Value> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) => Some(Value::String(s.clone())),
        Data::Int(i) => Some(json!(i)),
        Data::Float(f) => number_value(*f),
        Data::Bool(b) => Some(Value::Bool(*b)),
        // Serial day number, as the sheet stores it.
        Data::DateTime(dt) => number_value(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(Value::String(s.clone())),
    }
}
