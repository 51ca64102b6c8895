//! Engine type system
//!
//! Columns carry a [`LogicalType`] derived from their declared type. Values
//! cross the engine boundary as [`Value`], which mirrors the engine's storage
//! classes without borrowing from a statement.

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalType {
    /// BOOLEAN
    Boolean,
    /// SMALLINT (16-bit)
    SmallInt,
    /// INTEGER (32-bit)
    Integer,
    /// BIGINT (64-bit)
    BigInt,
    /// FLOAT / REAL (single precision)
    Float,
    /// DOUBLE (double precision)
    Double,
    /// DECIMAL / NUMERIC, stored with REAL affinity and reported as numeric
    Decimal,
    /// VARCHAR / TEXT
    Varchar,
    /// BLOB / BYTEA
    Blob,
    /// DATE
    Date,
    /// TIME
    Time,
    /// TIMESTAMP
    Timestamp,
    /// UUID
    Uuid,
    /// No declared type or a type the engine does not know
    Unknown,
}

impl LogicalType {
    /// Derive the logical type from a column's declared type
    ///
    /// Exact type names are matched first; anything else falls back to the
    /// engine's affinity rules.
    pub fn from_decl_type(decl_type: Option<&str>) -> Self {
        let decl = match decl_type {
            Some(decl) => decl,
            None => return LogicalType::Unknown,
        };
        let base = decl
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase();

        match base.as_str() {
            "BOOL" | "BOOLEAN" => LogicalType::Boolean,
            "TINYINT" | "INT1" | "SMALLINT" | "INT2" => LogicalType::SmallInt,
            "INT" | "INTEGER" | "INT4" | "MEDIUMINT" | "SIGNED" => LogicalType::Integer,
            "BIGINT" | "INT8" | "LONG" | "HUGEINT" => LogicalType::BigInt,
            "FLOAT" | "FLOAT4" | "REAL" => LogicalType::Float,
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT8" => LogicalType::Double,
            "DECIMAL" | "NUMERIC" => LogicalType::Decimal,
            "VARCHAR" | "CHAR" | "BPCHAR" | "TEXT" | "STRING" | "CLOB" | "CHARACTER VARYING" => {
                LogicalType::Varchar
            }
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => LogicalType::Blob,
            "DATE" => LogicalType::Date,
            "TIME" => LogicalType::Time,
            "TIMESTAMP" | "DATETIME" => LogicalType::Timestamp,
            "UUID" => LogicalType::Uuid,
            _ if base.contains("INT") => LogicalType::BigInt,
            _ if base.contains("CHAR") || base.contains("CLOB") || base.contains("TEXT") => {
                LogicalType::Varchar
            }
            _ if base.contains("BLOB") => LogicalType::Blob,
            _ if base.contains("REAL") || base.contains("FLOA") || base.contains("DOUB") => {
                LogicalType::Double
            }
            _ => LogicalType::Unknown,
        }
    }

    /// Upper-case SQL name of the type
    pub fn name(&self) -> &'static str {
        match self {
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::SmallInt => "SMALLINT",
            LogicalType::Integer => "INTEGER",
            LogicalType::BigInt => "BIGINT",
            LogicalType::Float => "FLOAT",
            LogicalType::Double => "DOUBLE",
            LogicalType::Decimal => "DECIMAL",
            LogicalType::Varchar => "VARCHAR",
            LogicalType::Blob => "BLOB",
            LogicalType::Date => "DATE",
            LogicalType::Time => "TIME",
            LogicalType::Timestamp => "TIMESTAMP",
            LogicalType::Uuid => "UUID",
            LogicalType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name as reported by the engine
    pub name: String,

    /// Logical type derived from the declared type
    pub logical_type: LogicalType,

    /// Declared type, if the column comes straight from a table
    pub decl_type: Option<String>,
}

impl Column {
    /// Create a column from its name and declared type
    pub fn new(name: impl Into<String>, decl_type: Option<&str>) -> Self {
        Self {
            name: name.into(),
            logical_type: LogicalType::from_decl_type(decl_type),
            decl_type: decl_type.map(str::to_string),
        }
    }
}

/// An owned engine value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// 64-bit integer (also used for booleans)
    Integer(i64),
    /// Double precision float
    Real(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl Value {
    /// Whether the value is SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render the value as text, the way the engine would cast it
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}
