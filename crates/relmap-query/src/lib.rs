//! Read-path helpers for relmap: condition-based finders and the
//! eager-loading relation resolver.
//!
//! The resolver joins a set of primary records to their related rows in one
//! query per relation level, distributing results through normalized-key
//! buckets instead of issuing one query per record.

pub mod find;
pub mod loader;

pub use find::{find_all, find_one};
pub use loader::EagerLoader;
