//! Database connection trait.
//!
//! All operations are async and take a `Cx` context for cancellation and
//! timeout handling. Implementations must be `Send + Sync`.
//!
//! Transactions are bracketed through `execute`: the writer issues `BEGIN`
//! once per top-level call and `COMMIT`/`ROLLBACK` at the end; nested
//! cascade steps reuse the open transaction and never start their own.

use crate::error::Error;
use crate::row::Row;
use crate::sql;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// A database connection capable of executing queries.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT * FROM `users` WHERE `id` = ?", &[Value::Int(1)]).await?;
/// ```
pub trait Connection: Send + Sync {
    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute an INSERT and return the last generated key (0 when the
    /// driver has none to report).
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;

    /// Quote a single identifier.
    fn quote_identifier(&self, name: &str) -> String {
        sql::quote_ident(name)
    }

    /// Quote a (possibly schema-qualified) table name.
    fn quote_table(&self, name: &str) -> String {
        sql::quote_table(name)
    }

    /// Begin a transaction.
    fn begin_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move { self.execute(cx, "BEGIN", &[]).await.map(|_| ()) }
    }

    /// Commit the open transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move { self.execute(cx, "COMMIT", &[]).await.map(|_| ()) }
    }

    /// Roll back the open transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move { self.execute(cx, "ROLLBACK", &[]).await.map(|_| ()) }
    }
}
