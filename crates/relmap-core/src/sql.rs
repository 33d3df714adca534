//! Shared SQL fragments: compiled statements, raw expressions, quoting.
//!
//! Statements target a MySQL-flavored dialect (`?` placeholders, backtick
//! identifier quoting) because the batch writer relies on `REPLACE`,
//! `INSERT IGNORE`, and `ON DUPLICATE KEY UPDATE`. Connections may override
//! the quoting hooks on [`crate::Connection`].

use crate::value::Value;

/// A compiled SQL statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    #[must_use]
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A raw SQL fragment with positional `?` parameters.
///
/// When a payload cell holds an expression, the fragment is spliced verbatim
/// into the statement at the cell's position and its parameters are appended
/// to the statement parameter list in splice order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlExpr {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlExpr {
    /// A parameterless fragment, e.g. `now()`.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// A fragment with positional parameters, e.g. `coalesce(?, 0) + 1`.
    #[must_use]
    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Quote a single identifier.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a table name, quoting each dotted part separately so
/// `db.table` becomes `` `db`.`table` ``.
#[must_use]
pub fn quote_table(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}
