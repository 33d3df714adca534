//! Shared schema descriptors and column type casting.
//!
//! A [`TableSpec`] is the immutable description of one mapped table: its
//! name, primary key, column schemas, relation registry, validation rules,
//! and optional optimistic-lock column. Loaders, compilers, and writers all
//! borrow the same spec; per-row work never clones a live object.
//!
//! A table whose column map is empty is treated as schema-unknown: no
//! column filtering and no casting is applied to its payloads.

use crate::relation::RelationSpec;
use crate::sql::SqlExpr;
use crate::validate::Validator;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bool,
    Int,
    Double,
    Decimal,
    Text,
    Bytes,
    Json,
}

/// The shape of a payload cell after casting.
///
/// The compiler handles each shape differently: scalars bind as positional
/// placeholders, JSON values serialize to their string form, and raw
/// expressions are spliced verbatim with their parameters appended.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Scalar(Value),
    Json(Value),
    Expr(SqlExpr),
}

/// An injected cast function for one column.
pub type CastFn = Arc<dyn Fn(&Value) -> Cell + Send + Sync>;

/// Schema of a single column: its type plus an optional injected cast.
#[derive(Clone)]
pub struct ColumnSchema {
    name: String,
    ty: SqlType,
    cast: Option<CastFn>,
}

impl fmt::Debug for ColumnSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnSchema")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("cast", &self.cast.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ColumnSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: SqlType) -> Self {
        Self {
            name: name.into(),
            ty,
            cast: None,
        }
    }

    /// Replace the default cast with an injected function.
    #[must_use]
    pub fn with_cast(mut self, cast: CastFn) -> Self {
        self.cast = Some(cast);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn ty(&self) -> SqlType {
        self.ty
    }

    /// Cast a raw value into its storage cell.
    #[must_use]
    pub fn cast(&self, value: &Value) -> Cell {
        if let Some(cast) = &self.cast {
            return cast(value);
        }
        if value.is_null() {
            return Cell::Scalar(Value::Null);
        }
        match self.ty {
            SqlType::Json => Cell::Json(value.clone()),
            SqlType::Bool => Cell::Scalar(match value {
                Value::Bool(_) => value.clone(),
                Value::Int(i) => Value::Bool(*i != 0),
                Value::Text(s) if s == "true" || s == "1" => Value::Bool(true),
                Value::Text(s) if s == "false" || s == "0" => Value::Bool(false),
                other => other.clone(),
            }),
            SqlType::Int => Cell::Scalar(match value {
                Value::Int(_) => value.clone(),
                Value::Bool(b) => Value::Int(i64::from(*b)),
                Value::Text(s) => s.parse().map_or_else(|_| value.clone(), Value::Int),
                other => other.clone(),
            }),
            SqlType::Double => Cell::Scalar(match value {
                Value::Double(_) => value.clone(),
                Value::Int(i) => Value::Double(*i as f64),
                Value::Text(s) => s.parse().map_or_else(|_| value.clone(), Value::Double),
                other => other.clone(),
            }),
            SqlType::Decimal => Cell::Scalar(match value {
                Value::Decimal(_) | Value::Text(_) => value.clone(),
                Value::Int(i) => Value::Decimal(i.to_string()),
                Value::Double(d) => Value::Decimal(format!("{d}")),
                other => other.clone(),
            }),
            SqlType::Text => Cell::Scalar(match value {
                Value::Text(_) => value.clone(),
                Value::Int(i) => Value::Text(i.to_string()),
                Value::Double(d) => Value::Text(format!("{d}")),
                Value::Decimal(s) => Value::Text(s.clone()),
                Value::Bool(b) => Value::Text(if *b { "1" } else { "0" }.to_string()),
                other => other.clone(),
            }),
            SqlType::Bytes => Cell::Scalar(match value {
                Value::Bytes(_) => value.clone(),
                Value::Text(s) => Value::Bytes(s.clone().into_bytes()),
                other => other.clone(),
            }),
        }
    }
}

/// Immutable descriptor of one mapped table.
#[derive(Debug, Clone, Default)]
pub struct TableSpec {
    table: String,
    primary_key: Vec<String>,
    columns: BTreeMap<String, ColumnSchema>,
    relations: Vec<RelationSpec>,
    validator: Validator,
    lock_column: Option<String>,
    defaults: BTreeMap<String, Value>,
}

impl TableSpec {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Declare the primary key columns, in order.
    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare a column with its storage type.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, ty: SqlType) -> Self {
        let name = name.into();
        self.columns
            .insert(name.clone(), ColumnSchema::new(name, ty));
        self
    }

    /// Declare a column with a prebuilt schema (custom cast).
    #[must_use]
    pub fn column_schema(mut self, schema: ColumnSchema) -> Self {
        self.columns.insert(schema.name().to_string(), schema);
        self
    }

    /// Register a relation.
    #[must_use]
    pub fn relation(mut self, spec: RelationSpec) -> Self {
        self.relations.push(spec);
        self
    }

    /// Attach validation rules and callbacks.
    #[must_use]
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Declare the optimistic-lock column.
    #[must_use]
    pub fn lock_column(mut self, column: impl Into<String>) -> Self {
        self.lock_column = Some(column.into());
        self
    }

    /// Declare a default value applied on the per-row create path when the
    /// payload omits the column.
    #[must_use]
    pub fn default_value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(column.into(), value);
        self
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, ColumnSchema> {
        &self.columns
    }

    #[must_use]
    pub fn column_of(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.get(name)
    }

    /// Whether the column map is known. An unknown schema disables column
    /// filtering and casting.
    #[must_use]
    pub fn is_schema_known(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Whether `name` is writable under this schema: any column when the
    /// schema is unknown, declared columns otherwise.
    #[must_use]
    pub fn accepts_column(&self, name: &str) -> bool {
        !self.is_schema_known() || self.columns.contains_key(name)
    }

    /// Cast a value for a column; schema-unknown columns pass through.
    #[must_use]
    pub fn cast(&self, column: &str, value: &Value) -> Cell {
        match self.columns.get(column) {
            Some(schema) => schema.cast(value),
            None => Cell::Scalar(value.clone()),
        }
    }

    #[must_use]
    pub fn relations(&self) -> &[RelationSpec] {
        &self.relations
    }

    #[must_use]
    pub fn relation_of(&self, name: &str) -> Option<&RelationSpec> {
        self.relations.iter().find(|r| r.name == name)
    }

    #[must_use]
    pub fn rules(&self) -> &Validator {
        &self.validator
    }

    #[must_use]
    pub fn lock(&self) -> Option<&str> {
        self.lock_column.as_deref()
    }

    #[must_use]
    pub fn defaults(&self) -> &BTreeMap<String, Value> {
        &self.defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_schema_accepts_everything() {
        let spec = TableSpec::new("blobs");
        assert!(!spec.is_schema_known());
        assert!(spec.accepts_column("anything"));
        assert_eq!(
            spec.cast("anything", &Value::Int(1)),
            Cell::Scalar(Value::Int(1))
        );
    }

    #[test]
    fn known_schema_filters_columns() {
        let spec = TableSpec::new("users").column("id", SqlType::Int);
        assert!(spec.is_schema_known());
        assert!(spec.accepts_column("id"));
        assert!(!spec.accepts_column("ghost"));
    }

    #[test]
    fn default_int_cast_parses_text() {
        let schema = ColumnSchema::new("id", SqlType::Int);
        assert_eq!(
            schema.cast(&Value::Text("42".into())),
            Cell::Scalar(Value::Int(42))
        );
    }

    #[test]
    fn json_column_casts_to_json_cell() {
        let schema = ColumnSchema::new("meta", SqlType::Json);
        let v = Value::Json(serde_json::json!({"a": 1}));
        assert_eq!(schema.cast(&v), Cell::Json(v.clone()));
    }

    #[test]
    fn null_skips_type_coercion() {
        let schema = ColumnSchema::new("meta", SqlType::Json);
        assert_eq!(schema.cast(&Value::Null), Cell::Scalar(Value::Null));
    }

    #[test]
    fn injected_cast_wins() {
        let schema = ColumnSchema::new("stamp", SqlType::Text).with_cast(Arc::new(|_| {
            Cell::Expr(SqlExpr::new("now()"))
        }));
        assert_eq!(
            schema.cast(&Value::Text("ignored".into())),
            Cell::Expr(SqlExpr::new("now()"))
        );
    }

    #[test]
    fn relation_lookup_by_name() {
        let child = Arc::new(TableSpec::new("items"));
        let spec = TableSpec::new("orders")
            .relation(RelationSpec::many("items", child).link("order_id", "id"));
        assert!(spec.relation_of("items").is_some());
        assert!(spec.relation_of("ghosts").is_none());
    }
}
