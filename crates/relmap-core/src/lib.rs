//! Core types and traits for relmap.
//!
//! This crate provides the foundational abstractions for record mapping:
//!
//! - `Value` for dynamically-typed SQL values
//! - `Record` for attribute maps with dirty tracking and a relation cache
//! - `TableSpec` / `ColumnSchema` for shared immutable schema descriptors
//! - `RelationSpec` for the declarative relation registry
//! - `Payload` for nested write trees
//! - `Connection` trait for database access
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod condition;
pub mod connection;
pub mod error;
pub mod key;
pub mod payload;
pub mod record;
pub mod relation;
pub mod row;
pub mod schema;
pub mod sql;
pub mod validate;
pub mod value;

pub use condition::Condition;
pub use connection::Connection;
pub use error::{
    CascadeBlockedError, Error, FieldValidationError, MutationError, QueryError, Result,
    StaleObjectError, ValidationError, ValidationErrorKind,
};
pub use key::{composite_key, normalize_key};
pub use payload::{Payload, PayloadValue};
pub use record::{Record, Related};
pub use relation::{DeleteHook, DeletePolicy, InverseSpec, RelationSpec, Via};
pub use row::{ColumnInfo, Row};
pub use schema::{Cell, ColumnSchema, SqlType, TableSpec};
pub use sql::{SqlExpr, Statement, quote_ident, quote_table};
pub use validate::{Rule, Validator};
pub use value::Value;

/// Propagate a non-`Ok` [`Outcome`] to the caller, unwrapping the `Ok` value.
///
/// The error branch converts via `Into`, so callers can propagate across
/// error types that implement `From`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e.into()),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}
