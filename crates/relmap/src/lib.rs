//! relmap - record mapping over relational stores.
//!
//! relmap maps structured payloads to table rows, resolves declared
//! relations between tables, and batches multi-row writes into as few
//! statements as possible:
//!
//! - [`EagerLoader`] joins sets of primary records to their related rows in
//!   one query per relation level, via normalized-key buckets
//! - [`BatchCompiler`] turns arrays of row payloads into one multi-row
//!   INSERT/UPSERT, one CASE-based batch UPDATE, or one keyed DELETE
//! - [`TableWriter`] applies nested payload trees recursively to declared
//!   child relations inside a single transaction
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//! use std::sync::Arc;
//!
//! let items = Arc::new(
//!     TableSpec::new("items")
//!         .primary_key(["id"])
//!         .column("id", SqlType::Int)
//!         .column("order_id", SqlType::Int)
//!         .column("sku", SqlType::Text),
//! );
//! let orders = Arc::new(
//!     TableSpec::new("orders")
//!         .primary_key(["id"])
//!         .column("id", SqlType::Int)
//!         .column("name", SqlType::Text)
//!         .relation(RelationSpec::many("items", items).link("order_id", "id")),
//! );
//!
//! async fn example(cx: &Cx, conn: &impl Connection, orders: Arc<TableSpec>) {
//!     // One statement per table level, one transaction for the whole tree.
//!     let writer = TableWriter::new(conn, Arc::clone(&orders));
//!     let payload = Payload::from_json(serde_json::json!({
//!         "id": 1,
//!         "name": "first",
//!         "items": [{"id": 10, "sku": "a"}, {"id": 11, "sku": "b"}]
//!     })).unwrap();
//!     let created = writer.create(cx, vec![payload], true).await.unwrap();
//!
//!     // Reattach children on the read path without N+1 queries.
//!     let loader = EagerLoader::new(conn);
//!     let mut records = created;
//!     loader.resolve_relations(cx, &orders, &["items"], &mut records).await.unwrap();
//! }
//! ```

pub use relmap_batch::{BatchCompiler, InsertMode, TableWriter, UpdateOptions};
pub use relmap_core::{
    CascadeBlockedError, Cell, ColumnSchema, Condition, Connection, Cx, DeletePolicy, Error,
    FieldValidationError, InverseSpec, MutationError, Outcome, Payload, PayloadValue, QueryError,
    Record, Related, RelationSpec, Result, Row, Rule, SqlExpr, SqlType, StaleObjectError,
    Statement, TableSpec, ValidationError, ValidationErrorKind, Validator, Value, Via,
};
pub use relmap_query::{EagerLoader, find_all, find_one};

/// Commonly used imports.
pub mod prelude {
    pub use relmap_batch::{BatchCompiler, InsertMode, TableWriter, UpdateOptions};
    pub use relmap_core::{
        Condition, Connection, Cx, DeletePolicy, Error, Outcome, Payload, PayloadValue, Record,
        Related, RelationSpec, Result, Row, Rule, SqlExpr, SqlType, TableSpec, Validator, Value,
    };
    pub use relmap_query::EagerLoader;
}
