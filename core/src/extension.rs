//! Scalar function registry and the pgwire extension functions
//!
//! Functions are registered once on a [`FunctionRegistry`] and installed on
//! every engine connection the database hands out.

use crate::error::{EngineError, Result};
use crate::types::Value;
use log::debug;
use rusqlite::functions::FunctionFlags;
use std::fmt;

/// Name the extension registers under
pub const EXTENSION_NAME: &str = "duckdb_pgwire";

/// Body of a scalar function
pub type ScalarBody = fn(&[Value]) -> Result<Value>;

/// A scalar SQL function
#[derive(Clone)]
pub struct ScalarFunction {
    /// SQL-visible name
    pub name: String,

    /// Number of arguments (-1 for variadic)
    pub arity: i32,

    /// Whether the result only depends on the arguments
    pub deterministic: bool,

    /// Function body
    pub body: ScalarBody,
}

impl ScalarFunction {
    /// Create a deterministic scalar function
    pub fn new(name: impl Into<String>, arity: i32, body: ScalarBody) -> Self {
        Self {
            name: name.into(),
            arity,
            deterministic: true,
            body,
        }
    }

    /// Evaluate the function outside of the engine
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        if self.arity >= 0 && args.len() != self.arity as usize {
            return Err(EngineError::Unsupported(format!(
                "function {} expects {} arguments, got {}",
                self.name,
                self.arity,
                args.len()
            )));
        }
        (self.body)(args)
    }
}

impl fmt::Debug for ScalarFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("deterministic", &self.deterministic)
            .finish()
    }
}

/// Functions installed on every engine connection
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: Vec<ScalarFunction>,
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the pgwire extension already loaded
    pub fn with_pgwire_extension() -> Self {
        let mut registry = Self::new();
        load_pgwire_extension(&mut registry);
        registry
    }

    /// Register a function, replacing any previous function with the same name and arity
    pub fn register(&mut self, function: ScalarFunction) {
        self.functions
            .retain(|f| !(f.name.eq_ignore_ascii_case(&function.name) && f.arity == function.arity));
        self.functions.push(function);
    }

    /// Look up a function by name
    pub fn get(&self, name: &str) -> Option<&ScalarFunction> {
        self.functions.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Names of all registered functions
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.name.as_str())
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Install every registered function on an engine connection
    pub fn install(&self, conn: &rusqlite::Connection) -> Result<()> {
        for function in &self.functions {
            let mut flags = FunctionFlags::SQLITE_UTF8;
            if function.deterministic {
                flags |= FunctionFlags::SQLITE_DETERMINISTIC;
            }
            let body = function.body;
            conn.create_scalar_function(function.name.as_str(), function.arity, flags, move |ctx| {
                let args: Vec<Value> = (0..ctx.len()).map(|i| Value::from(ctx.get_raw(i))).collect();
                body(&args).map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
            })?;
            debug!("Installed scalar function {}/{}", function.name, function.arity);
        }
        Ok(())
    }
}

/// Register the functions provided by the pgwire extension
pub fn load_pgwire_extension(registry: &mut FunctionRegistry) {
    registry.register(ScalarFunction::new("duckdb_pgwire", 1, duckdb_pgwire));
    registry.register(ScalarFunction::new(
        "duckdb_pgwire_openssl_version",
        1,
        duckdb_pgwire_openssl_version,
    ));
    registry.register(ScalarFunction::new("pg_is_in_recovery", 0, pg_is_in_recovery));
}

/// Version string of the OpenSSL library linked into the process
pub fn linked_openssl_version() -> &'static str {
    openssl::version::version()
}

fn duckdb_pgwire(args: &[Value]) -> Result<Value> {
    Ok(match args.first().and_then(Value::as_text) {
        Some(name) => Value::Text(format!("DuckdbPgwire {} 🐥", name)),
        None => Value::Null,
    })
}

fn duckdb_pgwire_openssl_version(args: &[Value]) -> Result<Value> {
    Ok(match args.first().and_then(Value::as_text) {
        Some(name) => Value::Text(format!(
            "DuckdbPgwire {}, my linked OpenSSL version is {}",
            name,
            linked_openssl_version()
        )),
        None => Value::Null,
    })
}

fn pg_is_in_recovery(_args: &[Value]) -> Result<Value> {
    Ok(Value::from(false))
}
