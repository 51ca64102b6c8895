//! Statement splitting and classification
//!
//! Query strings arrive from clients in PostgreSQL syntax. They are tokenized
//! once, split on top-level semicolons, and each statement is rewritten into
//! the form the engine accepts (`$n` placeholders become `?n`).

use crate::error::{EngineError, Result};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::fmt::Write;

/// Statement classification, used for command tags and transaction tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, VALUES, WITH ... SELECT, TABLE
    Select,
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// BEGIN / START TRANSACTION
    Begin,
    /// COMMIT / END
    Commit,
    /// ROLLBACK / ABORT (but not ROLLBACK TO SAVEPOINT)
    Rollback,
    /// COPY
    Copy,
    /// Anything else, carrying the command tag to report
    Other(String),
}

impl StatementKind {
    /// Command tag reported in CommandComplete
    pub fn command_tag(&self, rows: usize) -> String {
        match self {
            StatementKind::Select => format!("SELECT {}", rows),
            StatementKind::Insert => format!("INSERT 0 {}", rows),
            StatementKind::Update => format!("UPDATE {}", rows),
            StatementKind::Delete => format!("DELETE {}", rows),
            StatementKind::Begin => "BEGIN".to_string(),
            StatementKind::Commit => "COMMIT".to_string(),
            StatementKind::Rollback => "ROLLBACK".to_string(),
            StatementKind::Copy => format!("COPY {}", rows),
            StatementKind::Other(tag) => tag.clone(),
        }
    }

    /// Whether the statement controls the transaction block
    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self,
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback
        )
    }

    /// Whether the statement ends a transaction block
    pub fn ends_transaction(&self) -> bool {
        matches!(self, StatementKind::Commit | StatementKind::Rollback)
    }
}

/// A single statement ready for the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    /// Statement text with engine-style placeholders, without the terminator
    pub sql: String,

    /// Classification of the statement
    pub kind: StatementKind,

    /// Highest `$n` placeholder referenced
    pub param_count: usize,
}

impl SqlStatement {
    /// SQL the engine should run for this statement
    ///
    /// Transaction control is normalised to the engine's spelling
    /// (`START TRANSACTION`, `END` and `ABORT` are not understood natively).
    pub fn engine_sql(&self) -> &str {
        match self.kind {
            StatementKind::Begin => "BEGIN",
            StatementKind::Commit => "COMMIT",
            StatementKind::Rollback => "ROLLBACK",
            _ => &self.sql,
        }
    }
}

/// Split a query string into statements
///
/// Empty statements (bare terminators, whitespace, comments) are dropped, so
/// an empty query string yields an empty vector.
pub fn split_statements(query: &str) -> Result<Vec<SqlStatement>> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, query)
        .tokenize()
        .map_err(|e| EngineError::Syntax(e.to_string()))?;

    let mut statements = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    for token in tokens {
        if token == Token::SemiColon {
            if let Some(statement) = build_statement(&current)? {
                statements.push(statement);
            }
            current.clear();
        } else {
            current.push(token);
        }
    }
    if let Some(statement) = build_statement(&current)? {
        statements.push(statement);
    }

    Ok(statements)
}

fn build_statement(tokens: &[Token]) -> Result<Option<SqlStatement>> {
    let significant: Vec<&Token> = tokens.iter().filter(|t| !is_trivia(t)).collect();
    if significant.is_empty() {
        return Ok(None);
    }

    let mut sql = String::new();
    let mut param_count = 0;
    for token in tokens {
        match token {
            Token::Placeholder(p) if p.starts_with('$') => {
                let index: usize = p[1..]
                    .parse()
                    .map_err(|_| EngineError::Syntax(format!("invalid parameter reference {}", p)))?;
                if index == 0 {
                    return Err(EngineError::Syntax(format!(
                        "invalid parameter reference {}",
                        p
                    )));
                }
                param_count = param_count.max(index);
                let _ = write!(sql, "?{}", index);
            }
            Token::SingleQuotedString(s) | Token::EscapedStringLiteral(s) => quote_literal(&mut sql, s),
            Token::DollarQuotedString(s) => quote_literal(&mut sql, &s.value),
            Token::Whitespace(Whitespace::SingleLineComment { .. }) => sql.push('\n'),
            Token::Whitespace(Whitespace::MultiLineComment(_)) => sql.push(' '),
            other => {
                let _ = write!(sql, "{}", other);
            }
        }
    }

    Ok(Some(SqlStatement {
        sql: sql.trim().to_string(),
        kind: classify(&significant),
        param_count,
    }))
}

fn quote_literal(sql: &mut String, value: &str) {
    sql.push('\'');
    sql.push_str(&value.replace('\'', "''"));
    sql.push('\'');
}

fn is_trivia(token: &Token) -> bool {
    matches!(token, Token::Whitespace(_) | Token::EOF)
}

fn keyword(token: Option<&&Token>) -> Option<String> {
    match token {
        Some(Token::Word(word)) if word.quote_style.is_none() => {
            Some(word.value.to_ascii_uppercase())
        }
        _ => None,
    }
}

fn classify(tokens: &[&Token]) -> StatementKind {
    let first = match keyword(tokens.first()) {
        Some(word) => word,
        None => {
            // Parenthesised queries such as `(SELECT 1)`
            return if tokens.first() == Some(&&Token::LParen) {
                StatementKind::Select
            } else {
                StatementKind::Other(String::new())
            };
        }
    };
    let second = keyword(tokens.get(1));

    match first.as_str() {
        "SELECT" | "VALUES" | "TABLE" | "WITH" => StatementKind::Select,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "BEGIN" => StatementKind::Begin,
        "START" if second.as_deref() == Some("TRANSACTION") => StatementKind::Begin,
        "COMMIT" | "END" => StatementKind::Commit,
        "ROLLBACK" | "ABORT" => {
            if tokens.iter().skip(1).any(|t| keyword(Some(t)).as_deref() == Some("TO")) {
                StatementKind::Other("ROLLBACK".to_string())
            } else {
                StatementKind::Rollback
            }
        }
        "COPY" => StatementKind::Copy,
        "CREATE" | "DROP" | "ALTER" => {
            let object = tokens
                .iter()
                .skip(1)
                .filter_map(|t| keyword(Some(t)))
                .find(|w| !matches!(w.as_str(), "TEMP" | "TEMPORARY" | "UNIQUE" | "OR" | "IF" | "NOT" | "EXISTS" | "REPLACE"));
            match object {
                Some(object) => StatementKind::Other(format!("{} {}", first, object)),
                None => StatementKind::Other(first),
            }
        }
        _ => StatementKind::Other(first),
    }
}
