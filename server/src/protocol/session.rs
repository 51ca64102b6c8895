//! Per-connection statement and portal registry
//!
//! Names are scoped to one connection. The unnamed statement and portal may
//! be replaced freely; named ones must be closed before they are reused.

use crate::bridge::{Portal, PreparedStatement};
use crate::error::SqlError;
use duckdb_pgwire_core::sqlstate;
use log::trace;
use std::collections::HashMap;
use std::sync::Arc;

/// Prepared statements and portals of one session
#[derive(Debug, Default)]
pub struct SessionRegistry {
    statements: HashMap<String, Arc<PreparedStatement>>,
    portals: HashMap<String, Portal>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prepared statement
    pub fn add_statement(&mut self, statement: PreparedStatement) -> Result<(), SqlError> {
        let name = statement.name.clone();
        if !name.is_empty() && self.statements.contains_key(&name) {
            return Err(SqlError::error(
                sqlstate::DUPLICATE_PREPARED_STATEMENT,
                format!("prepared statement \"{}\" already exists", name),
            ));
        }
        trace!("Registering statement {:?}", name);
        self.statements.insert(name, Arc::new(statement));
        Ok(())
    }

    /// Look up a prepared statement
    pub fn statement(&self, name: &str) -> Result<Arc<PreparedStatement>, SqlError> {
        self.statements.get(name).cloned().ok_or_else(|| {
            SqlError::error(
                sqlstate::INVALID_SQL_STATEMENT_NAME,
                format!("prepared statement \"{}\" does not exist", name),
            )
        })
    }

    /// Register a portal
    pub fn add_portal(&mut self, portal: Portal) -> Result<(), SqlError> {
        let name = portal.name.clone();
        if !name.is_empty() && self.portals.contains_key(&name) {
            return Err(SqlError::error(
                sqlstate::DUPLICATE_CURSOR,
                format!("portal \"{}\" already exists", name),
            ));
        }
        trace!("Registering portal {:?}", name);
        self.portals.insert(name, portal);
        Ok(())
    }

    /// Take a portal out for execution; put it back with [`restore_portal`](Self::restore_portal)
    pub fn take_portal(&mut self, name: &str) -> Result<Portal, SqlError> {
        self.portals.remove(name).ok_or_else(|| unknown_portal(name))
    }

    /// Return a portal taken with [`take_portal`](Self::take_portal)
    ///
    /// The portal holds its own reference to the statement it was bound
    /// from, so it survives that statement being replaced by a new Parse.
    pub fn restore_portal(&mut self, portal: Portal) {
        self.portals.insert(portal.name.clone(), portal);
    }

    /// Look up a portal
    pub fn portal(&self, name: &str) -> Result<&Portal, SqlError> {
        self.portals.get(name).ok_or_else(|| unknown_portal(name))
    }

    /// Close a statement and every portal created from it
    ///
    /// Closing a name that does not exist is not an error.
    pub fn close_statement(&mut self, name: &str) {
        if let Some(statement) = self.statements.remove(name) {
            self.portals
                .retain(|_, portal| !Arc::ptr_eq(&portal.statement, &statement));
        }
    }

    /// Close a portal; unknown names are ignored
    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }

    /// Drop the unnamed portal
    pub fn clear_unnamed_portal(&mut self) {
        self.portals.remove("");
    }

    /// Drop the unnamed statement and portal
    ///
    /// Named portals bound from the unnamed statement stay open.
    pub fn clear_unnamed(&mut self) {
        self.statements.remove("");
        self.clear_unnamed_portal();
    }

    /// Drop every statement and portal, releasing their engine cursors
    pub fn clear(&mut self) {
        self.portals.clear();
        self.statements.clear();
    }

    /// Number of registered statements
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Number of open portals
    pub fn portal_count(&self) -> usize {
        self.portals.len()
    }
}

fn unknown_portal(name: &str) -> SqlError {
    SqlError::error(
        sqlstate::INVALID_CURSOR_NAME,
        format!("portal \"{}\" does not exist", name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckdb_pgwire_core::Column;

    fn statement(name: &str) -> PreparedStatement {
        PreparedStatement {
            name: name.to_string(),
            statement: None,
            param_types: vec![],
            columns: vec![Column::new("x", Some("INTEGER"))],
        }
    }

    fn bind(registry: &SessionRegistry, statement: &str, portal: &str) -> Portal {
        let statement = registry.statement(statement).unwrap();
        Portal::for_test(portal, statement)
    }

    #[test]
    fn test_named_statements_must_be_unique() {
        let mut registry = SessionRegistry::new();
        registry.add_statement(statement("s1")).unwrap();
        let err = registry.add_statement(statement("s1")).unwrap_err();
        assert_eq!(err.code, sqlstate::DUPLICATE_PREPARED_STATEMENT);
    }

    #[test]
    fn test_unnamed_statement_is_replaced() {
        let mut registry = SessionRegistry::new();
        registry.add_statement(statement("")).unwrap();
        registry.add_statement(statement("")).unwrap();
        assert_eq!(registry.statement_count(), 1);
    }

    #[test]
    fn test_unknown_names() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.statement("nope").unwrap_err().code, sqlstate::INVALID_SQL_STATEMENT_NAME);
        assert_eq!(registry.portal("nope").unwrap_err().code, sqlstate::INVALID_CURSOR_NAME);
    }

    #[test]
    fn test_closing_a_statement_drops_its_portals() {
        let mut registry = SessionRegistry::new();
        registry.add_statement(statement("s1")).unwrap();
        registry.add_statement(statement("s2")).unwrap();
        let p1 = bind(&registry, "s1", "p1");
        let p2 = bind(&registry, "s2", "p2");
        registry.add_portal(p1).unwrap();
        registry.add_portal(p2).unwrap();

        registry.close_statement("s1");
        assert!(registry.portal("p1").is_err());
        assert!(registry.portal("p2").is_ok());

        // Unknown names close silently
        registry.close_statement("s1");
        registry.close_portal("missing");
    }

    #[test]
    fn test_clear_unnamed_keeps_named_entries() {
        let mut registry = SessionRegistry::new();
        registry.add_statement(statement("")).unwrap();
        registry.add_statement(statement("kept")).unwrap();
        let unnamed = bind(&registry, "kept", "");
        registry.add_portal(unnamed).unwrap();

        registry.clear_unnamed();
        assert_eq!(registry.statement_count(), 1);
        assert_eq!(registry.portal_count(), 0);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut registry = SessionRegistry::new();
        registry.add_statement(statement("s1")).unwrap();
        let portal = bind(&registry, "s1", "p1");
        registry.add_portal(portal).unwrap();

        registry.clear();
        assert_eq!(registry.statement_count(), 0);
        assert_eq!(registry.portal_count(), 0);
    }

    #[test]
    fn test_take_and_restore_portal() {
        let mut registry = SessionRegistry::new();
        registry.add_statement(statement("s1")).unwrap();
        let portal = bind(&registry, "s1", "p1");
        registry.add_portal(portal).unwrap();

        let portal = registry.take_portal("p1").unwrap();
        assert!(registry.portal("p1").is_err());
        registry.restore_portal(portal);
        assert!(registry.portal("p1").is_ok());
    }

    #[test]
    fn test_portal_outlives_replaced_unnamed_statement() {
        let mut registry = SessionRegistry::new();
        registry.add_statement(statement("")).unwrap();
        let portal = bind(&registry, "", "p1");
        let source = portal.statement.clone();
        registry.add_portal(portal).unwrap();

        let portal = registry.take_portal("p1").unwrap();
        registry.add_statement(statement("")).unwrap();
        registry.restore_portal(portal);

        let portal = registry.portal("p1").unwrap();
        assert!(Arc::ptr_eq(&portal.statement, &source));
        assert!(!Arc::ptr_eq(&registry.statement("").unwrap(), &source));

        registry.clear_unnamed();
        assert!(registry.portal("p1").is_ok());
    }
}
