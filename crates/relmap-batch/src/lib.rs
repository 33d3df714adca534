//! Write path for relmap: the bulk mutation compiler and the cascading
//! table writer.
//!
//! The compiler turns homogeneous payload batches into single statements:
//! one multi-row INSERT/UPSERT, one CASE-based UPDATE, or one keyed DELETE.
//! The writer decomposes nested payloads into parent columns plus relation
//! sub-payloads and applies the compiler level by level inside one
//! transaction.

pub mod cascade;
pub mod compiler;

pub use cascade::{TableWriter, UpdateOptions};
pub use compiler::{BatchCompiler, InsertMode};
