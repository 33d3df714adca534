//! Records: attribute maps with dirty tracking and a relation cache.

use crate::key::composite_key;
use crate::row::Row;
use crate::schema::TableSpec;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};

/// A resolved relation result cached on a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// Single-valued relation; `None` when no related row exists.
    One(Option<Box<Record>>),
    /// Multi-valued relation.
    Many(Vec<Record>),
}

impl Related {
    /// An empty result matching the given multiplicity.
    #[must_use]
    pub fn empty(multiple: bool) -> Self {
        if multiple {
            Related::Many(Vec::new())
        } else {
            Related::One(None)
        }
    }

    /// Number of related records.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Related::One(one) => usize::from(one.is_some()),
            Related::Many(many) => many.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One mapped row: current attributes, the persisted snapshot, and a cache
/// of resolved relations.
///
/// The old-attribute snapshot is `None` for a record that has never been
/// persisted; dirty computation is the symmetric difference between the
/// current attributes and the snapshot, optionally restricted to a subset.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    attributes: BTreeMap<String, Value>,
    old_attributes: Option<BTreeMap<String, Value>>,
    related: HashMap<String, Related>,
}

impl Record {
    /// A new, unpersisted record with no attributes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, unpersisted record from an attribute map.
    #[must_use]
    pub fn from_attributes(attributes: BTreeMap<String, Value>) -> Self {
        Self {
            attributes,
            old_attributes: None,
            related: HashMap::new(),
        }
    }

    /// A record hydrated from a query row. The snapshot equals the current
    /// attributes: a fetched record starts clean.
    #[must_use]
    pub fn from_row(row: &Row) -> Self {
        let attributes = row.to_attributes();
        Self {
            old_attributes: Some(attributes.clone()),
            attributes,
            related: HashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Whether this record has never been persisted.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.old_attributes.is_none()
    }

    #[must_use]
    pub fn old_attribute(&self, name: &str) -> Option<&Value> {
        self.old_attributes.as_ref().and_then(|old| old.get(name))
    }

    /// Replace the persisted snapshot (e.g. with a freshly fetched baseline).
    pub fn set_old_attributes(&mut self, old: Option<BTreeMap<String, Value>>) {
        self.old_attributes = old;
    }

    /// Snapshot the current attributes as persisted, clearing dirtiness.
    pub fn sync_old(&mut self) {
        self.old_attributes = Some(self.attributes.clone());
    }

    /// Attributes that differ from the persisted snapshot, optionally
    /// restricted to `names`. With no snapshot, every (requested) attribute
    /// is dirty.
    #[must_use]
    pub fn dirty_attributes(&self, names: Option<&[String]>) -> BTreeMap<String, Value> {
        let wanted = |name: &str| names.is_none_or(|ns| ns.iter().any(|n| n == name));
        match &self.old_attributes {
            None => self
                .attributes
                .iter()
                .filter(|(name, _)| wanted(name))
                .map(|(n, v)| (n.clone(), v.clone()))
                .collect(),
            Some(old) => self
                .attributes
                .iter()
                .filter(|(name, value)| wanted(name) && old.get(*name) != Some(*value))
                .map(|(n, v)| (n.clone(), v.clone()))
                .collect(),
        }
    }

    /// Primary-key values in declared order; `None` when any component is
    /// missing or NULL.
    #[must_use]
    pub fn primary_key(&self, spec: &TableSpec) -> Option<Vec<Value>> {
        let columns = spec.primary_key_columns();
        if columns.is_empty() {
            return None;
        }
        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            match self.attributes.get(column) {
                Some(v) if !v.is_null() => values.push(v.clone()),
                _ => return None,
            }
        }
        Some(values)
    }

    /// Normalized bucket key over the given columns. Missing attributes
    /// contribute an empty component, matching NULL.
    #[must_use]
    pub fn key_of(&self, columns: &[&str]) -> String {
        let null = Value::Null;
        composite_key(
            columns
                .iter()
                .map(|c| self.attributes.get(*c).unwrap_or(&null)),
        )
    }

    /// Cache a resolved relation result.
    pub fn set_related(&mut self, name: impl Into<String>, related: Related) {
        self.related.insert(name.into(), related);
    }

    #[must_use]
    pub fn related(&self, name: &str) -> Option<&Related> {
        self.related.get(name)
    }

    #[must_use]
    pub fn is_relation_populated(&self, name: &str) -> bool {
        self.related.contains_key(name)
    }

    /// All cached relation results.
    #[must_use]
    pub fn related_records(&self) -> &HashMap<String, Related> {
        &self.related
    }

    /// Convert to a JSON object, nesting cached relations under their names.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.attributes {
            map.insert(name.clone(), value.to_json());
        }
        for (name, related) in &self.related {
            let nested = match related {
                Related::One(Some(rec)) => rec.to_json(),
                Related::One(None) => serde_json::Value::Null,
                Related::Many(recs) => {
                    serde_json::Value::Array(recs.iter().map(Record::to_json).collect())
                }
            };
            map.insert(name.clone(), nested);
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SqlType;

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(n, v)| ((*n).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn new_record_is_fully_dirty() {
        let rec = Record::from_attributes(attrs(&[
            ("id", Value::Int(1)),
            ("name", Value::Text("a".into())),
        ]));
        assert!(rec.is_new());
        assert_eq!(rec.dirty_attributes(None).len(), 2);
    }

    #[test]
    fn dirty_is_symmetric_difference_against_snapshot() {
        let mut rec = Record::from_attributes(attrs(&[
            ("id", Value::Int(1)),
            ("name", Value::Text("a".into())),
        ]));
        rec.sync_old();
        assert!(rec.dirty_attributes(None).is_empty());

        rec.set("name", "b");
        rec.set("age", 30_i64);
        let dirty = rec.dirty_attributes(None);
        assert_eq!(dirty.len(), 2);
        assert!(dirty.contains_key("name"));
        assert!(dirty.contains_key("age"));
    }

    #[test]
    fn dirty_respects_requested_subset() {
        let mut rec = Record::from_attributes(attrs(&[("id", Value::Int(1))]));
        rec.sync_old();
        rec.set("id", 2_i64);
        rec.set("name", "x");

        let only_name = rec.dirty_attributes(Some(&["name".to_string()]));
        assert_eq!(only_name.len(), 1);
        assert!(only_name.contains_key("name"));
    }

    #[test]
    fn from_row_starts_clean() {
        let row = Row::new(vec!["id".into()], vec![Value::Int(5)]);
        let rec = Record::from_row(&row);
        assert!(!rec.is_new());
        assert!(rec.dirty_attributes(None).is_empty());
    }

    #[test]
    fn primary_key_requires_all_components() {
        let spec = TableSpec::new("t")
            .primary_key(["a", "b"])
            .column("a", SqlType::Int)
            .column("b", SqlType::Int);
        let rec = Record::from_attributes(attrs(&[("a", Value::Int(1)), ("b", Value::Int(2))]));
        assert_eq!(
            rec.primary_key(&spec),
            Some(vec![Value::Int(1), Value::Int(2)])
        );

        let partial = Record::from_attributes(attrs(&[("a", Value::Int(1))]));
        assert_eq!(partial.primary_key(&spec), None);

        let with_null =
            Record::from_attributes(attrs(&[("a", Value::Int(1)), ("b", Value::Null)]));
        assert_eq!(with_null.primary_key(&spec), None);
    }

    #[test]
    fn key_of_treats_missing_as_null() {
        let rec = Record::from_attributes(attrs(&[("a", Value::Int(1))]));
        assert_eq!(rec.key_of(&["a"]), "1");
        assert_eq!(rec.key_of(&["missing"]), "");
    }

    #[test]
    fn relation_cache_roundtrip() {
        let mut rec = Record::new();
        assert!(!rec.is_relation_populated("items"));
        rec.set_related("items", Related::Many(vec![Record::new()]));
        assert!(rec.is_relation_populated("items"));
        assert_eq!(rec.related("items").unwrap().len(), 1);
    }

    #[test]
    fn to_json_nests_relations() {
        let mut rec = Record::from_attributes(attrs(&[("id", Value::Int(1))]));
        let child = Record::from_attributes(attrs(&[("id", Value::Int(10))]));
        rec.set_related("items", Related::Many(vec![child]));
        let json = rec.to_json();
        assert_eq!(json["id"], serde_json::json!(1));
        assert_eq!(json["items"][0]["id"], serde_json::json!(10));
    }
}
