//! Condition-based SELECT helpers.

use asupersync::{Cx, Outcome};
use relmap_core::{Condition, Connection, Error, Record, TableSpec, try_outcome};

/// Fetch every row of `spec`'s table matching `condition`.
pub async fn find_all<C: Connection>(
    cx: &Cx,
    conn: &C,
    spec: &TableSpec,
    condition: &Condition,
) -> Outcome<Vec<Record>, Error> {
    let mut params = Vec::new();
    let where_sql = condition.to_sql(&mut params);
    let sql = format!(
        "SELECT * FROM {} WHERE {}",
        conn.quote_table(spec.table()),
        where_sql
    );
    tracing::trace!(sql = %sql, "find_all");
    let rows = try_outcome!(conn.query(cx, &sql, &params).await);
    Outcome::Ok(rows.iter().map(Record::from_row).collect())
}

/// Fetch the first row of `spec`'s table matching `condition`.
pub async fn find_one<C: Connection>(
    cx: &Cx,
    conn: &C,
    spec: &TableSpec,
    condition: &Condition,
) -> Outcome<Option<Record>, Error> {
    let mut params = Vec::new();
    let where_sql = condition.to_sql(&mut params);
    let sql = format!(
        "SELECT * FROM {} WHERE {}",
        conn.quote_table(spec.table()),
        where_sql
    );
    tracing::trace!(sql = %sql, "find_one");
    let row = try_outcome!(conn.query_one(cx, &sql, &params).await);
    Outcome::Ok(row.as_ref().map(Record::from_row))
}
