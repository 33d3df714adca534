//! Minimal filter conditions.
//!
//! This is the small amount of condition plumbing the loader, delete
//! policies, and mass edits need: equality, AND/OR grouping, and
//! (composite-capable) IN lists. It is not a general query DSL.

use crate::sql::quote_ident;
use crate::value::Value;
use std::collections::BTreeMap;

/// A filter condition compiled to SQL with `?` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = ?` (or `column IS NULL`).
    Eq(String, Value),
    /// `(col1, col2) IN ((?, ?), ...)`; single-column lists render as a
    /// plain `IN`.
    In(Vec<String>, Vec<Vec<Value>>),
    /// Conjunction.
    All(Vec<Condition>),
    /// Disjunction.
    Any(Vec<Condition>),
}

impl Condition {
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq(column.into(), value.into())
    }

    /// Single-column IN list.
    #[must_use]
    pub fn in_column(column: impl Into<String>, values: Vec<Value>) -> Self {
        Condition::In(
            vec![column.into()],
            values.into_iter().map(|v| vec![v]).collect(),
        )
    }

    /// Composite IN over column tuples.
    #[must_use]
    pub fn in_tuples(columns: Vec<String>, tuples: Vec<Vec<Value>>) -> Self {
        Condition::In(columns, tuples)
    }

    #[must_use]
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All(conditions)
    }

    #[must_use]
    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Any(conditions)
    }

    /// Build an AND condition from an equality map. Array values become IN
    /// lists, everything else an equality check.
    #[must_use]
    pub fn from_equality_map(map: &BTreeMap<String, Value>) -> Self {
        let conditions = map
            .iter()
            .map(|(column, value)| match value {
                Value::Array(items) => Condition::in_column(column.clone(), items.clone()),
                other => Condition::Eq(column.clone(), other.clone()),
            })
            .collect();
        Condition::All(conditions)
    }

    /// Render to SQL, appending bound parameters to `params`.
    ///
    /// An empty IN list renders as `0 = 1`; callers that must not execute a
    /// query at all in that case (the eager loader) short-circuit before
    /// building the condition.
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        match self {
            Condition::Eq(column, value) => {
                if value.is_null() {
                    format!("{} IS NULL", quote_ident(column))
                } else {
                    params.push(value.clone());
                    format!("{} = ?", quote_ident(column))
                }
            }
            Condition::In(columns, tuples) => {
                if columns.is_empty() || tuples.is_empty() {
                    return "0 = 1".to_string();
                }
                if columns.len() == 1 {
                    let placeholders: Vec<&str> = tuples
                        .iter()
                        .filter_map(|t| t.first())
                        .map(|v| {
                            params.push(v.clone());
                            "?"
                        })
                        .collect();
                    format!(
                        "{} IN ({})",
                        quote_ident(&columns[0]),
                        placeholders.join(", ")
                    )
                } else {
                    let cols = columns
                        .iter()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let groups = tuples
                        .iter()
                        .map(|tuple| {
                            let marks = tuple
                                .iter()
                                .map(|v| {
                                    params.push(v.clone());
                                    "?"
                                })
                                .collect::<Vec<_>>()
                                .join(", ");
                            format!("({marks})")
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({cols}) IN ({groups})")
                }
            }
            Condition::All(conditions) => Self::join(conditions, " AND ", params),
            Condition::Any(conditions) => Self::join(conditions, " OR ", params),
        }
    }

    fn join(conditions: &[Condition], sep: &str, params: &mut Vec<Value>) -> String {
        match conditions.len() {
            0 => "1 = 1".to_string(),
            1 => conditions[0].to_sql(params),
            _ => conditions
                .iter()
                .map(|c| format!("({})", c.to_sql(params)))
                .collect::<Vec<_>>()
                .join(sep),
        }
    }
}
