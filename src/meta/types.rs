//! Schema metadata types.
//!
//! Rows of the metadata shadow tables, the virtual metadata namespace, and the
//! classification of declared column types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::{Row, Value};
use crate::error::{Result, SessionError};

/// Coarse type family of a column, derived from its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataTypeMean {
    Integer,
    BigInt,
    Blob,
    Number,
    Timestamp,
    Varchar,
}

impl DataTypeMean {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Blob => "BLOB",
            Self::Number => "NUMBER",
            Self::Timestamp => "TIMESTAMP",
            Self::Varchar => "VARCHAR",
        }
    }

    /// Parses the stored form. Unknown names are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INTEGER" => Some(Self::Integer),
            "BIGINT" => Some(Self::BigInt),
            "BLOB" => Some(Self::Blob),
            "NUMBER" => Some(Self::Number),
            "TIMESTAMP" => Some(Self::Timestamp),
            "VARCHAR" => Some(Self::Varchar),
            _ => None,
        }
    }
}

impl fmt::Display for DataTypeMean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a declared column type such as `VARCHAR(20)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeClass {
    /// Declared type without the length suffix, upper-cased.
    pub data_type: String,
    pub mean: DataTypeMean,
    /// Character length; only set for `VARCHAR` columns.
    pub char_length: Option<i64>,
    /// Size or precision; set for every other family.
    pub data_size: Option<i64>,
}

/// Classifies a declared type string.
///
/// The first keyword decides the family: `BIGINT`, `INTEGER` and `BLOB` map to
/// themselves, `DOUBLE`, `REAL`, `DECIMAL` and `NUMERIC` to `NUMBER`, `INT` to
/// `INTEGER`, `DATETIME` to `TIMESTAMP`, anything else to `VARCHAR`. A
/// parenthesized length is kept as `char_length` for `VARCHAR`, as `data_size`
/// otherwise.
pub fn classify_type(declared: &str) -> TypeClass {
    let declared = declared.trim().to_uppercase();
    let (base, length) = match declared.split_once('(') {
        Some((base, rest)) => {
            let inner = rest.split(')').next().unwrap_or("");
            let length = inner
                .split(',')
                .next()
                .and_then(|n| n.trim().parse::<i64>().ok());
            (base.trim().to_string(), length)
        }
        None => (declared.clone(), None),
    };

    let keyword = base.split_whitespace().next().unwrap_or("");
    let mean = match keyword {
        "BIGINT" => DataTypeMean::BigInt,
        "INTEGER" | "INT" => DataTypeMean::Integer,
        "BLOB" => DataTypeMean::Blob,
        "DOUBLE" | "REAL" | "DECIMAL" | "NUMERIC" => DataTypeMean::Number,
        "DATETIME" => DataTypeMean::Timestamp,
        _ => DataTypeMean::Varchar,
    };

    let (char_length, data_size) = match mean {
        DataTypeMean::Varchar => (length, None),
        _ => (None, length),
    };

    TypeClass {
        data_type: base,
        mean,
        char_length,
        data_size,
    }
}

/// Kind of a reflected constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintType {
    #[serde(rename = "P")]
    PrimaryKey,
    #[serde(rename = "F")]
    ForeignKey,
}

impl ConstraintType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryKey => "P",
            Self::ForeignKey => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P" => Some(Self::PrimaryKey),
            "F" => Some(Self::ForeignKey),
            _ => None,
        }
    }
}

/// One physical column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowColumnRow {
    pub table_name: String,
    pub column_name: String,
    /// 1-based position within the table.
    pub column_number: i64,
    pub data_type: String,
    pub data_type_mean: DataTypeMean,
    pub char_length: Option<i64>,
    pub data_size: Option<i64>,
    pub default_value: Option<String>,
    pub is_notnull: bool,
    pub pk: bool,
}

impl ShadowColumnRow {
    /// Shadow table column order, matching [`ShadowColumnRow::to_values`].
    pub const COLUMNS: [&'static str; 10] = [
        "table_name",
        "column_name",
        "column_number",
        "data_type",
        "data_type_mean",
        "char_length",
        "data_size",
        "default_value",
        "is_notnull",
        "pk",
    ];

    pub(crate) fn to_values(&self) -> Vec<Value> {
        vec![
            self.table_name.as_str().into(),
            self.column_name.as_str().into(),
            self.column_number.into(),
            self.data_type.as_str().into(),
            self.data_type_mean.as_str().into(),
            self.char_length.into(),
            self.data_size.into(),
            self.default_value.clone().into(),
            self.is_notnull.into(),
            self.pk.into(),
        ]
    }

    pub(crate) fn from_row(row: &Row) -> Result<Self> {
        let r = RowReader(row);
        let mean = r.text("data_type_mean")?;
        Ok(Self {
            table_name: r.text("table_name")?,
            column_name: r.text("column_name")?,
            column_number: r.int("column_number")?,
            data_type: r.opt_text("data_type").unwrap_or_default(),
            data_type_mean: DataTypeMean::parse(&mean).ok_or_else(|| {
                SessionError::internal(format!("Unknown data_type_mean '{mean}'"))
            })?,
            char_length: r.opt_int("char_length"),
            data_size: r.opt_int("data_size"),
            default_value: r.opt_text("default_value"),
            is_notnull: r.int("is_notnull")? != 0,
            pk: r.int("pk")? != 0,
        })
    }
}

/// One primary-key column or one foreign-key column mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowConstraintRow {
    pub table_name: String,
    pub constraint_name: String,
    pub constraint_type: ConstraintType,
    pub column_name: String,
    pub foreign_table_name: Option<String>,
    pub foreign_column_name: Option<String>,
}

impl ShadowConstraintRow {
    /// Shadow table column order, matching [`ShadowConstraintRow::to_values`].
    pub const COLUMNS: [&'static str; 6] = [
        "table_name",
        "constraint_name",
        "constraint_type",
        "column_name",
        "foreign_table_name",
        "foreign_column_name",
    ];

    /// Primary-key column of `table`.
    pub fn primary_key(table: &str, column: impl Into<String>) -> Self {
        Self {
            table_name: table.to_string(),
            constraint_name: format!("PK_{table}"),
            constraint_type: ConstraintType::PrimaryKey,
            column_name: column.into(),
            foreign_table_name: None,
            foreign_column_name: None,
        }
    }

    /// Foreign-key column mapping; `id` groups the columns of one composite key.
    pub fn foreign_key(
        table: &str,
        id: i64,
        column: impl Into<String>,
        foreign_table: impl Into<String>,
        foreign_column: Option<String>,
    ) -> Self {
        Self {
            table_name: table.to_string(),
            constraint_name: format!("FK_{table}_{id}"),
            constraint_type: ConstraintType::ForeignKey,
            column_name: column.into(),
            foreign_table_name: Some(foreign_table.into()),
            foreign_column_name: foreign_column,
        }
    }

    pub(crate) fn to_values(&self) -> Vec<Value> {
        vec![
            self.table_name.as_str().into(),
            self.constraint_name.as_str().into(),
            self.constraint_type.as_str().into(),
            self.column_name.as_str().into(),
            self.foreign_table_name.clone().into(),
            self.foreign_column_name.clone().into(),
        ]
    }

    pub(crate) fn from_row(row: &Row) -> Result<Self> {
        let r = RowReader(row);
        let kind = r.text("constraint_type")?;
        Ok(Self {
            table_name: r.text("table_name")?,
            constraint_name: r.text("constraint_name")?,
            constraint_type: ConstraintType::parse(&kind).ok_or_else(|| {
                SessionError::internal(format!("Unknown constraint_type '{kind}'"))
            })?,
            column_name: r.text("column_name")?,
            foreign_table_name: r.opt_text("foreign_table_name"),
            foreign_column_name: r.opt_text("foreign_column_name"),
        })
    }
}

/// A reflected table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub table_name: String,
    pub column_count: i64,
}

impl TableRow {
    pub(crate) fn from_row(row: &Row) -> Result<Self> {
        let r = RowReader(row);
        Ok(Self {
            table_name: r.text("table_name")?,
            column_count: r.int("column_count")?,
        })
    }
}

/// An attached database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRow {
    pub schema_name: String,
}

impl SchemaRow {
    pub(crate) fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            schema_name: RowReader(row).text("schema_name")?,
        })
    }
}

/// Tables of the virtual metadata namespace answered by the reflector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaTable {
    Schemas,
    Tables,
    Columns,
    PrimaryKeys,
    ForeignKeys,
}

impl MetaTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schemas => "schemas",
            Self::Tables => "tables",
            Self::Columns => "columns",
            Self::PrimaryKeys => "primary_keys",
            Self::ForeignKeys => "foreign_keys",
        }
    }

    /// Parses a virtual table name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "schemas" => Some(Self::Schemas),
            "tables" => Some(Self::Tables),
            "columns" => Some(Self::Columns),
            "primary_keys" => Some(Self::PrimaryKeys),
            "foreign_keys" => Some(Self::ForeignKeys),
            _ => None,
        }
    }

    /// Whether answering requires the shadow tables.
    pub fn uses_shadow_tables(&self) -> bool {
        !matches!(self, Self::Schemas)
    }
}

impl fmt::Display for MetaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed access to the values of an object row.
struct RowReader<'a>(&'a Row);

impl RowReader<'_> {
    fn value(&self, name: &str) -> Option<&Value> {
        self.0.get(&[], name)
    }

    fn text(&self, name: &str) -> Result<String> {
        self.opt_text(name)
            .ok_or_else(|| SessionError::internal(format!("Metadata row lacks text '{name}'")))
    }

    fn opt_text(&self, name: &str) -> Option<String> {
        match self.value(name)? {
            Value::Text(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_display_string()),
        }
    }

    fn int(&self, name: &str) -> Result<i64> {
        self.opt_int(name)
            .ok_or_else(|| SessionError::internal(format!("Metadata row lacks integer '{name}'")))
    }

    fn opt_int(&self, name: &str) -> Option<i64> {
        self.value(name)?.as_i64()
    }
}
