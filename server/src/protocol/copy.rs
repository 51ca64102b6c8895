//! COPY sub-protocol support
//!
//! Only the text format is handled: tab delimited columns, newline
//! terminated rows, `\N` for NULL and backslash escapes for special bytes.

use crate::error::SqlError;
use duckdb_pgwire_core::sqlstate;
use duckdb_pgwire_core::Value;
use sqlparser::ast::{self, CopyLegacyOption, CopyOption, CopyTarget, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Direction of a COPY statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDirection {
    /// COPY ... TO STDOUT
    ToStdout,
    /// COPY ... FROM STDIN
    FromStdin,
}

/// Where rows come from or go to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// A table with an optional column list
    Table {
        /// Table name as written
        table: String,
        /// Column names, empty for all columns
        columns: Vec<String>,
    },
    /// A parenthesised query (TO STDOUT only)
    Query(String),
}

/// A parsed COPY statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyCommand {
    /// Table or query
    pub source: CopySource,
    /// Direction
    pub direction: CopyDirection,
}

impl CopyCommand {
    /// Parse a COPY statement
    pub fn parse(sql: &str) -> Result<Self, SqlError> {
        // COPY ... FROM STDIN only parses with its terminator present
        let text = format!("{};", sql.trim_end().trim_end_matches(';'));
        let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, &text)
            .map_err(|e| SqlError::error(sqlstate::SYNTAX_ERROR, e.to_string()))?;
        let statement = match (statements.pop(), statements.is_empty()) {
            (Some(statement), true) => statement,
            _ => return Err(SqlError::error(sqlstate::SYNTAX_ERROR, "expected a single COPY statement")),
        };

        let (source, to, target, options, legacy_options) = match statement {
            Statement::Copy {
                source,
                to,
                target,
                options,
                legacy_options,
                ..
            } => (source, to, target, options, legacy_options),
            _ => return Err(SqlError::error(sqlstate::SYNTAX_ERROR, "not a COPY statement")),
        };

        let direction = match (target, to) {
            (CopyTarget::Stdout, true) => CopyDirection::ToStdout,
            (CopyTarget::Stdin, false) => CopyDirection::FromStdin,
            (target, _) => {
                return Err(SqlError::error(
                    sqlstate::FEATURE_NOT_SUPPORTED,
                    format!(
                        "only COPY ... TO STDOUT and COPY ... FROM STDIN are supported, not {}",
                        target
                    ),
                ))
            }
        };
        check_options(&options, &legacy_options)?;

        let source = match source {
            ast::CopySource::Table { table_name, columns } => CopySource::Table {
                table: table_name.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
            },
            ast::CopySource::Query(query) => CopySource::Query(query.to_string()),
        };

        Ok(Self { source, direction })
    }

    /// Query producing the rows for COPY TO STDOUT
    pub fn select_sql(&self) -> String {
        match &self.source {
            CopySource::Query(query) => query.clone(),
            CopySource::Table { table, columns } if columns.is_empty() => format!("SELECT * FROM {}", table),
            CopySource::Table { table, columns } => format!("SELECT {} FROM {}", columns.join(", "), table),
        }
    }
}

/// Only the default text format is accepted
fn check_options(options: &[CopyOption], legacy_options: &[CopyLegacyOption]) -> Result<(), SqlError> {
    let unsupported = options
        .iter()
        .map(|option| match option {
            CopyOption::Format(format) if format.value.eq_ignore_ascii_case("text") => None,
            other => Some(other.to_string()),
        })
        .chain(legacy_options.iter().map(|option| Some(option.to_string())))
        .flatten()
        .collect::<Vec<_>>();

    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(SqlError::error(
            sqlstate::FEATURE_NOT_SUPPORTED,
            format!("COPY options are not supported: {}", unsupported.join(", ")),
        ))
    }
}

/// Encode one row as a text-format COPY line, including the newline
pub fn encode_row(values: &[Option<String>]) -> String {
    let mut line = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        match value {
            None => line.push_str("\\N"),
            Some(text) => escape_into(&mut line, text),
        }
    }
    line.push('\n');
    line
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

/// Decode one text-format COPY line (without its newline)
pub fn decode_row(line: &str) -> Result<Vec<Value>, SqlError> {
    line.split('\t').map(decode_field).collect()
}

fn decode_field(field: &str) -> Result<Value, SqlError> {
    if field == "\\N" {
        return Ok(Value::Null);
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {
                return Err(SqlError::error(
                    sqlstate::BAD_COPY_FILE_FORMAT,
                    "unterminated escape sequence in COPY data",
                ))
            }
        }
    }
    Ok(Value::Text(out))
}

/// Collects CopyData chunks for COPY FROM STDIN
///
/// Chunks need not align with rows; a partial line is kept until the rest
/// arrives.
#[derive(Debug, Default)]
pub struct CopyInState {
    /// Target table
    pub table: String,
    /// Target columns, empty for all
    pub columns: Vec<String>,
    partial: Vec<u8>,
    rows: Vec<Vec<Value>>,
    finished: bool,
}

impl CopyInState {
    /// Start collecting rows for a table
    pub fn new(table: String, columns: Vec<String>) -> Self {
        Self {
            table,
            columns,
            ..Self::default()
        }
    }

    /// Feed a CopyData payload
    pub fn push(&mut self, data: &[u8]) -> Result<(), SqlError> {
        self.partial.extend_from_slice(data);
        while let Some(end) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            self.push_line(&line[..line.len() - 1])?;
        }
        Ok(())
    }

    fn push_line(&mut self, line: &[u8]) -> Result<(), SqlError> {
        if self.finished {
            return Ok(());
        }
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        // End-of-data marker used by older clients
        if line == b"\\." {
            self.finished = true;
            return Ok(());
        }
        let text = std::str::from_utf8(line).map_err(|_| {
            SqlError::error(
                sqlstate::BAD_COPY_FILE_FORMAT,
                "invalid UTF-8 in COPY data",
            )
        })?;
        self.rows.push(decode_row(text)?);
        Ok(())
    }

    /// Finish on CopyDone and hand back the rows
    pub fn finish(mut self) -> Result<Vec<Vec<Value>>, SqlError> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.push_line(&rest)?;
        }
        Ok(self.rows)
    }

    /// Rows decoded so far
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
