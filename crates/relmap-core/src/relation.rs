//! Declarative relation metadata.
//!
//! Relations are registered on a [`TableSpec`] at construction and looked up
//! by name. A relation links child columns to parent columns (composite keys
//! keep their declared order), is single- or multi-valued, and may be reached
//! through one level of indirection (`via`). Deeper indirection is expressed
//! by nesting via-relations, never by flattening.

use crate::condition::Condition;
use crate::payload::Payload;
use crate::schema::TableSpec;
use std::fmt;
use std::sync::Arc;

/// How related rows are cleaned up when a relation's payload is saved or the
/// parent is deleted.
///
/// Dispatched explicitly on the variant; the hook computes a delete
/// condition from the child payloads rather than issuing its own SQL, which
/// keeps the open transaction out of user code.
#[derive(Clone)]
pub enum DeletePolicy {
    /// Delete child rows matching a fixed condition.
    Condition(Condition),
    /// Compute the delete condition from the child table and the pending
    /// child payloads. Returning `None` skips the cleanup.
    Hook(DeleteHook),
}

/// The callback form of a [`DeletePolicy`].
pub type DeleteHook = Arc<dyn Fn(&TableSpec, &[Payload]) -> Option<Condition> + Send + Sync>;

impl fmt::Debug for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletePolicy::Condition(c) => f.debug_tuple("Condition").field(c).finish(),
            DeletePolicy::Hook(_) => f.debug_tuple("Hook").field(&"<fn>").finish(),
        }
    }
}

/// An indirect path to the related table.
#[derive(Debug, Clone)]
pub enum Via {
    /// Through a named relation declared on the same parent. Resolving the
    /// outer relation populates this one on the primaries as a side effect.
    Relation(Box<RelationSpec>),
    /// Through an ad-hoc junction table that is not itself a declared
    /// relation; its rows are fetched but never cached on the primaries.
    Junction(Box<RelationSpec>),
}

impl Via {
    /// The inner relation spec regardless of variant.
    #[must_use]
    pub fn spec(&self) -> &RelationSpec {
        match self {
            Via::Relation(s) | Via::Junction(s) => s,
        }
    }

    /// Whether resolving this via should populate the primaries' caches.
    #[must_use]
    pub const fn populates(&self) -> bool {
        matches!(self, Via::Relation(_))
    }
}

/// The inverse side of a relation, used for back-population without a
/// second query.
///
/// `link` overrides the mirrored link of the owning relation; leave it
/// `None` for direct relations, where mirroring is exact.
#[derive(Debug, Clone)]
pub struct InverseSpec {
    pub name: String,
    pub multiple: bool,
    pub link: Option<Vec<(String, String)>>,
}

/// Declarative description of one relation.
#[derive(Debug, Clone)]
pub struct RelationSpec {
    /// Relation name; also the payload key and the relation-cache key.
    pub name: String,
    /// The related table's descriptor.
    pub target: Arc<TableSpec>,
    /// Ordered link pairs `(child_column, parent_column)`. Never empty for a
    /// usable relation; resolvers reject an empty link.
    pub link: Vec<(String, String)>,
    /// Multi-valued (`true`) or single-valued (`false`).
    pub multiple: bool,
    /// Optional single level of indirection.
    pub via: Option<Via>,
    /// Optional inverse side for back-population.
    pub inverse: Option<InverseSpec>,
    /// Optional cleanup applied before the relation's payload is saved.
    pub delete_policy: Option<DeletePolicy>,
    /// Index multi-valued results by this column instead of renumbering.
    pub index_by: Option<String>,
}

impl RelationSpec {
    /// A single-valued relation.
    #[must_use]
    pub fn one(name: impl Into<String>, target: Arc<TableSpec>) -> Self {
        Self {
            name: name.into(),
            target,
            link: Vec::new(),
            multiple: false,
            via: None,
            inverse: None,
            delete_policy: None,
            index_by: None,
        }
    }

    /// A multi-valued relation.
    #[must_use]
    pub fn many(name: impl Into<String>, target: Arc<TableSpec>) -> Self {
        let mut spec = Self::one(name, target);
        spec.multiple = true;
        spec
    }

    /// Add a link pair: `child_column` on the related table matches
    /// `parent_column` on the owner. Call repeatedly for composite keys;
    /// order is preserved.
    #[must_use]
    pub fn link(mut self, child_column: impl Into<String>, parent_column: impl Into<String>) -> Self {
        self.link
            .push((child_column.into(), parent_column.into()));
        self
    }

    /// Reach the related table through a named relation of the owner.
    #[must_use]
    pub fn via(mut self, relation: RelationSpec) -> Self {
        self.via = Some(Via::Relation(Box::new(relation)));
        self
    }

    /// Reach the related table through an ad-hoc junction table.
    #[must_use]
    pub fn via_junction(mut self, junction: RelationSpec) -> Self {
        self.via = Some(Via::Junction(Box::new(junction)));
        self
    }

    /// Declare the inverse side. `multiple` is the inverse relation's own
    /// multiplicity on the related record.
    #[must_use]
    pub fn inverse_of(mut self, name: impl Into<String>, multiple: bool) -> Self {
        self.inverse = Some(InverseSpec {
            name: name.into(),
            multiple,
            link: None,
        });
        self
    }

    /// Declare the inverse side with an explicit link (needed when the
    /// mirrored link of this relation is not the inverse's own link, e.g.
    /// for via-relations).
    #[must_use]
    pub fn inverse_with_link(
        mut self,
        name: impl Into<String>,
        multiple: bool,
        link: Vec<(String, String)>,
    ) -> Self {
        self.inverse = Some(InverseSpec {
            name: name.into(),
            multiple,
            link: Some(link),
        });
        self
    }

    /// Attach a delete policy.
    #[must_use]
    pub fn delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = Some(policy);
        self
    }

    /// Index multi-valued results by a column.
    #[must_use]
    pub fn index_by(mut self, column: impl Into<String>) -> Self {
        self.index_by = Some(column.into());
        self
    }

    /// Child-side link columns, in declared order.
    #[must_use]
    pub fn child_columns(&self) -> Vec<&str> {
        self.link.iter().map(|(c, _)| c.as_str()).collect()
    }

    /// Parent-side link columns, in declared order.
    #[must_use]
    pub fn parent_columns(&self) -> Vec<&str> {
        self.link.iter().map(|(_, p)| p.as_str()).collect()
    }

    /// The inverse link: explicit if declared, otherwise this relation's
    /// link mirrored.
    #[must_use]
    pub fn inverse_link(&self) -> Vec<(String, String)> {
        match self.inverse.as_ref().and_then(|inv| inv.link.clone()) {
            Some(link) => link,
            None => self
                .link
                .iter()
                .map(|(c, p)| (p.clone(), c.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SqlType;

    fn items_spec() -> Arc<TableSpec> {
        Arc::new(
            TableSpec::new("items")
                .primary_key(["id"])
                .column("id", SqlType::Int)
                .column("order_id", SqlType::Int),
        )
    }

    #[test]
    fn link_order_is_preserved() {
        let rel = RelationSpec::many("items", items_spec())
            .link("order_id", "id")
            .link("tenant", "tenant");
        assert_eq!(rel.child_columns(), vec!["order_id", "tenant"]);
        assert_eq!(rel.parent_columns(), vec!["id", "tenant"]);
    }

    #[test]
    fn mirrored_inverse_link() {
        let rel = RelationSpec::many("items", items_spec()).link("order_id", "id");
        assert_eq!(
            rel.inverse_link(),
            vec![("id".to_string(), "order_id".to_string())]
        );
    }

    #[test]
    fn explicit_inverse_link_wins() {
        let rel = RelationSpec::many("items", items_spec())
            .link("order_id", "id")
            .inverse_with_link("order", false, vec![("x".into(), "y".into())]);
        assert_eq!(rel.inverse_link(), vec![("x".to_string(), "y".to_string())]);
    }

    #[test]
    fn via_variants() {
        let junction = RelationSpec::many("links", items_spec()).link("order_id", "id");
        let rel = RelationSpec::many("products", items_spec())
            .link("id", "product_id")
            .via_junction(junction);
        let via = rel.via.as_ref().unwrap();
        assert!(!via.populates());
        assert_eq!(via.spec().name, "links");
    }
}
