//! Nested write payloads.
//!
//! A payload is the tree a caller hands to the writer: a map whose keys are
//! either column names (scalar or expression cells) or relation names
//! (nested payloads). Payloads live only for the duration of one call.
//!
//! Iteration order is the sorted key order, which fixes the column order of
//! compiled batch statements.

use crate::error::{Error, Result};
use crate::sql::SqlExpr;
use crate::value::Value;
use std::collections::BTreeMap;

/// One payload entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    /// A column cell.
    Scalar(Value),
    /// A raw SQL expression cell.
    Expr(SqlExpr),
    /// A single nested sub-payload under a relation name.
    One(Payload),
    /// A list of nested sub-payloads under a relation name.
    Many(Vec<Payload>),
}

impl PayloadValue {
    /// Whether this entry is a column cell rather than a nested payload.
    #[must_use]
    pub const fn is_cell(&self) -> bool {
        matches!(self, PayloadValue::Scalar(_) | PayloadValue::Expr(_))
    }
}

/// A nested write payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    entries: BTreeMap<String, PayloadValue>,
}

impl Payload {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style scalar entry.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, PayloadValue::Scalar(value.into()));
        self
    }

    /// Builder-style expression entry.
    #[must_use]
    pub fn with_expr(mut self, name: impl Into<String>, expr: SqlExpr) -> Self {
        self.set(name, PayloadValue::Expr(expr));
        self
    }

    /// Builder-style single nested payload.
    #[must_use]
    pub fn with_one(mut self, name: impl Into<String>, payload: Payload) -> Self {
        self.set(name, PayloadValue::One(payload));
        self
    }

    /// Builder-style nested payload list.
    #[must_use]
    pub fn with_many(mut self, name: impl Into<String>, payloads: Vec<Payload>) -> Self {
        self.set(name, PayloadValue::Many(payloads));
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: PayloadValue) {
        self.entries.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PayloadValue> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PayloadValue> {
        self.entries.remove(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate entries in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.entries.iter()
    }

    /// The scalar value under `name`, if the entry is a scalar cell.
    #[must_use]
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        match self.entries.get(name) {
            Some(PayloadValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    /// Iterate only the column cells (scalar and expression entries).
    pub fn cells(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.entries.iter().filter(|(_, v)| v.is_cell())
    }

    /// The scalar cells as an attribute map (expressions and nested
    /// payloads are skipped).
    #[must_use]
    pub fn scalar_attributes(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .filter_map(|(name, value)| match value {
                PayloadValue::Scalar(v) => Some((name.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    /// Convert a JSON object into a payload.
    ///
    /// Object values become single nested payloads, arrays of objects become
    /// payload lists, everything else becomes a scalar cell (arrays of
    /// scalars collapse to an array value, e.g. an array-valued foreign
    /// key).
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = json else {
            return Err(Error::invalid_argument(format!(
                "payload must be a JSON object, got {json}"
            )));
        };
        let mut payload = Payload::new();
        for (key, value) in map {
            let entry = match value {
                serde_json::Value::Object(_) => PayloadValue::One(Payload::from_json(value)?),
                serde_json::Value::Array(items)
                    if !items.is_empty() && items.iter().all(serde_json::Value::is_object) =>
                {
                    let subs = items
                        .into_iter()
                        .map(Payload::from_json)
                        .collect::<Result<Vec<_>>>()?;
                    PayloadValue::Many(subs)
                }
                other => PayloadValue::Scalar(Value::from_json(other)),
            };
            payload.set(key, entry);
        }
        Ok(payload)
    }

    /// Normalize a JSON body into a payload list: an array of objects maps
    /// element-wise, a single object becomes a one-element list.
    pub fn list_from_json(json: serde_json::Value) -> Result<Vec<Self>> {
        match json {
            serde_json::Value::Array(items) => {
                items.into_iter().map(Payload::from_json).collect()
            }
            obj @ serde_json::Value::Object(_) => Ok(vec![Payload::from_json(obj)?]),
            other => Err(Error::invalid_argument(format!(
                "payload body must be a JSON object or array of objects, got {other}"
            ))),
        }
    }
}

impl<'a> IntoIterator for &'a Payload {
    type Item = (&'a String, &'a PayloadValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, PayloadValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
