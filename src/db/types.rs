//! Request and result types for statement execution.
//!
//! Defines the values, rows and options exchanged between callers and a `Session`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::cursor::RowCursor;

/// A single value read from or bound to the engine, one variant per SQLite storage class.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Signed 64-bit integer.
    Integer(i64),

    /// Floating point number.
    Real(f64),

    /// Text value.
    Text(String),

    /// Binary data.
    Blob(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the numeric payload as a float, converting integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the text payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => format!("<{} bytes>", b.len()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

/// A row exactly as the engine reports it: column name and value, in column order.
pub type KeyedRow = Vec<(String, Value)>;

/// Name of one result column, discovered from the first fetched row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Output shape of rows, decided once per execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowMode {
    /// Values in field order.
    #[default]
    Array,
    /// Field name to value mapping.
    Object,
}

/// One result row in the shape selected by [`RowMode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Row {
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Row {
    /// Shapes an engine row for the given mode.
    ///
    /// Array rows keep the engine's column order, which is the order fields were derived in.
    pub(crate) fn from_keyed(keyed: KeyedRow, mode: RowMode) -> Self {
        match mode {
            RowMode::Array => Row::Array(keyed.into_iter().map(|(_, value)| value).collect()),
            RowMode::Object => Row::Object(keyed.into_iter().collect()),
        }
    }

    /// Looks up a value by field name. Array rows resolve the position through `fields`.
    pub fn get<'a>(&'a self, fields: &[FieldDescriptor], name: &str) -> Option<&'a Value> {
        match self {
            Row::Object(map) => map.get(name),
            Row::Array(values) => fields
                .iter()
                .position(|f| f.name == name)
                .and_then(|i| values.get(i)),
        }
    }

    /// Looks up a value by position. Object rows resolve the name through `fields`.
    pub fn get_index(&self, fields: &[FieldDescriptor], index: usize) -> Option<&Value> {
        match self {
            Row::Array(values) => values.get(index),
            Row::Object(map) => fields.get(index).and_then(|f| map.get(&f.name)),
        }
    }

    /// Returns the number of values in the row.
    pub fn len(&self) -> usize {
        match self {
            Row::Array(values) => values.len(),
            Row::Object(map) => map.len(),
        }
    }

    /// Returns true if the row has no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    /// Maximum rows to fetch; 0 means unbounded.
    pub fetch_rows: usize,
    /// Return a live cursor instead of materialized rows.
    pub cursor: bool,
    /// Row shape.
    pub row_mode: RowMode,
    /// Commit right after the statement instead of leaving a transaction open.
    pub auto_commit: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            fetch_rows: 0,
            cursor: false,
            row_mode: RowMode::Array,
            auto_commit: true,
        }
    }
}

impl ExecuteOptions {
    pub fn with_fetch_rows(mut self, fetch_rows: usize) -> Self {
        self.fetch_rows = fetch_rows;
        self
    }

    pub fn with_cursor(mut self, cursor: bool) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_row_mode(mut self, row_mode: RowMode) -> Self {
        self.row_mode = row_mode;
        self
    }

    pub fn with_object_rows(self) -> Self {
        self.with_row_mode(RowMode::Object)
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }
}

/// A compiled statement with its positional (`?`) bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub sql: String,
    pub values: Vec<Value>,
    pub options: ExecuteOptions,
}

impl ExecuteRequest {
    /// Creates a request with no bind values and default options.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            values: Vec::new(),
            options: ExecuteOptions::default(),
        }
    }

    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of an execute: materialized rows or a live cursor.
#[derive(Debug)]
pub enum ExecuteResult {
    /// Rows fetched within the execute call; the statement is already finalized.
    Rows {
        fields: Vec<FieldDescriptor>,
        rows: Vec<Row>,
    },
    /// An open cursor; fields become available once the first row is fetched.
    Cursor(RowCursor),
}

impl ExecuteResult {
    /// Returns the known fields. Empty for a cursor that has not fetched yet.
    pub fn fields(&self) -> &[FieldDescriptor] {
        match self {
            Self::Rows { fields, .. } => fields,
            Self::Cursor(cursor) => cursor.fields(),
        }
    }

    /// Returns materialized rows, or None for a cursor result.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows { rows, .. } => Some(rows),
            Self::Cursor(_) => None,
        }
    }

    /// Consumes the result, returning materialized rows (None for a cursor result).
    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            Self::Rows { rows, .. } => Some(rows),
            Self::Cursor(_) => None,
        }
    }

    /// Consumes the result, returning the cursor (None for materialized rows).
    pub fn into_cursor(self) -> Option<RowCursor> {
        match self {
            Self::Rows { .. } => None,
            Self::Cursor(cursor) => Some(cursor),
        }
    }
}
