//! The bulk mutation compiler.
//!
//! N logical rows compile to exactly one statement: a multi-row VALUES
//! insert (optionally with an upsert clause), a CASE-per-column batch
//! update, or a keyed delete. Compilation is pure; execution belongs to the
//! caller.
//!
//! The column set of a batch is fixed by the first row's schema-known
//! columns. A later row that misses one of them is rejected before any SQL
//! is assembled; silently binding NULL would write data nobody asked for.

use relmap_core::{
    Cell, Condition, Error, Payload, PayloadValue, Result, Statement, TableSpec, Value,
    quote_ident, quote_table,
};

/// Insert statement flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertMode {
    /// Plain `INSERT`.
    #[default]
    Insert,
    /// `REPLACE`: delete-and-insert on key conflict.
    Replace,
    /// `INSERT IGNORE`: skip conflicting rows.
    InsertIgnore,
}

impl InsertMode {
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            InsertMode::Insert => "INSERT",
            InsertMode::Replace => "REPLACE",
            InsertMode::InsertIgnore => "INSERT IGNORE",
        }
    }
}

/// Compiles batches of row payloads against one table spec.
pub struct BatchCompiler<'a> {
    spec: &'a TableSpec,
}

impl<'a> BatchCompiler<'a> {
    #[must_use]
    pub fn new(spec: &'a TableSpec) -> Self {
        Self { spec }
    }

    /// Compile a multi-row INSERT. Returns `Ok(None)` for an empty batch
    /// (a no-op, not an error).
    ///
    /// With `with_upsert`, appends `ON DUPLICATE KEY UPDATE col = VALUES(col)`
    /// for every non-key column not listed in `exclude`.
    pub fn compile_insert(
        &self,
        rows: &[Payload],
        mode: InsertMode,
        with_upsert: bool,
        exclude: &[String],
    ) -> Result<Option<Statement>> {
        if rows.is_empty() {
            return Ok(None);
        }

        let columns = self.batch_columns(&rows[0], &[]);
        if columns.is_empty() {
            tracing::debug!(
                table = self.spec.table(),
                "no schema-known columns in batch; nothing to insert"
            );
            return Ok(None);
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "{} INTO {} ({}) VALUES ",
            mode.as_sql(),
            quote_table(self.spec.table()),
            column_list
        );
        let mut params: Vec<Value> = Vec::new();

        for (i, row) in rows.iter().enumerate() {
            let mut placeholders: Vec<String> = Vec::with_capacity(columns.len());
            for column in &columns {
                match self.cell(row, i, column)? {
                    Cell::Expr(expr) => {
                        placeholders.push(expr.sql);
                        params.extend(expr.params);
                    }
                    Cell::Json(value) => {
                        placeholders.push("?".to_string());
                        params.push(Value::Text(json_text(&value)));
                    }
                    Cell::Scalar(value) => {
                        placeholders.push("?".to_string());
                        params.push(value);
                    }
                }
            }
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            sql.push_str(&placeholders.join(", "));
            sql.push(')');
        }

        if with_upsert {
            let keys = self.spec.primary_key_columns();
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !keys.iter().any(|k| k == *c) && !exclude.iter().any(|e| e == *c))
                .map(|c| format!("{} = VALUES({})", quote_ident(c), quote_ident(c)))
                .collect();
            if !updates.is_empty() {
                sql.push_str(" ON DUPLICATE KEY UPDATE ");
                sql.push_str(&updates.join(", "));
            }
        }

        tracing::debug!(
            table = self.spec.table(),
            rows = rows.len(),
            columns = columns.len(),
            "compiled batch insert"
        );
        Ok(Some(Statement::new(sql, params)))
    }

    /// Compile a CASE-based batch UPDATE identifying rows by
    /// `reference_columns` (the primary key when `None`).
    ///
    /// Every row must supply every reference column with a scalar value;
    /// otherwise the call fails before any SQL exists. Returns `Ok(None)`
    /// when the batch is empty or carries no updatable columns.
    pub fn compile_batch_update(
        &self,
        rows: &[Payload],
        reference_columns: Option<&[String]>,
    ) -> Result<Option<Statement>> {
        if rows.is_empty() {
            return Ok(None);
        }

        let refs: Vec<String> = match reference_columns {
            Some(columns) if !columns.is_empty() => columns.to_vec(),
            _ => self.spec.primary_key_columns().to_vec(),
        };
        if refs.is_empty() {
            return Err(Error::invalid_argument(format!(
                "batch update on `{}` needs reference columns, and the table declares no primary key",
                self.spec.table()
            )));
        }

        // Validate references first: the whole call must fail before any
        // statement text exists. Distinct values are collected per reference
        // position in first-seen order.
        let mut wheres: Vec<Vec<Value>> = vec![Vec::new(); refs.len()];
        let mut ref_matrix: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let mut tuple = Vec::with_capacity(refs.len());
            for (pos, reference) in refs.iter().enumerate() {
                let value = match row.get(reference) {
                    Some(PayloadValue::Scalar(v)) if !v.is_null() => v,
                    Some(PayloadValue::Scalar(_)) | None => {
                        return Err(Error::invalid_argument(format!(
                            "row {i} is missing reference column `{reference}`"
                        )));
                    }
                    Some(_) => {
                        return Err(Error::invalid_argument(format!(
                            "reference column `{reference}` of row {i} is not a scalar"
                        )));
                    }
                };
                let Cell::Scalar(cast) = self.spec.cast(reference, value) else {
                    return Err(Error::invalid_argument(format!(
                        "reference column `{reference}` of row {i} does not cast to a scalar"
                    )));
                };
                if !cast.is_scalar() {
                    return Err(Error::invalid_argument(format!(
                        "reference column `{reference}` of row {i} must be a string or number, got {}",
                        cast.type_name()
                    )));
                }
                if !wheres[pos].contains(&cast) {
                    wheres[pos].push(cast.clone());
                }
                tuple.push(cast);
            }
            ref_matrix.push(tuple);
        }

        let update_columns = self.batch_columns(&rows[0], &refs);
        if update_columns.is_empty() {
            return Ok(None);
        }

        let mut params: Vec<Value> = Vec::new();
        let mut sets: Vec<String> = Vec::with_capacity(update_columns.len());
        for column in &update_columns {
            let mut set_sql = format!("{} = CASE", quote_ident(column));
            for (i, row) in rows.iter().enumerate() {
                let mut when = String::new();
                for (pos, reference) in refs.iter().enumerate() {
                    if pos > 0 {
                        when.push_str(" AND ");
                    }
                    when.push_str(&quote_ident(reference));
                    when.push_str(" = ?");
                    params.push(ref_matrix[i][pos].clone());
                }
                match self.cell(row, i, column)? {
                    Cell::Expr(expr) => {
                        set_sql.push_str(&format!(" WHEN {when} THEN {}", expr.sql));
                        params.extend(expr.params);
                    }
                    Cell::Json(value) => {
                        set_sql.push_str(&format!(" WHEN {when} THEN ?"));
                        params.push(Value::Text(json_text(&value)));
                    }
                    Cell::Scalar(value) => {
                        set_sql.push_str(&format!(" WHEN {when} THEN ?"));
                        params.push(value);
                    }
                }
            }
            set_sql.push_str(&format!(" ELSE {} END", quote_ident(column)));
            sets.push(set_sql);
        }

        // Column-major tuple assembly: the j-th tuple combines the j-th
        // distinct value seen per reference position.
        let tuple_count = wheres.iter().map(Vec::len).min().unwrap_or(0);
        let tuples: Vec<Vec<Value>> = (0..tuple_count)
            .map(|j| wheres.iter().map(|column| column[j].clone()).collect())
            .collect();
        let where_sql = Condition::in_tuples(refs, tuples).to_sql(&mut params);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_table(self.spec.table()),
            sets.join(", "),
            where_sql
        );
        tracing::debug!(
            table = self.spec.table(),
            rows = rows.len(),
            columns = update_columns.len(),
            "compiled batch update"
        );
        Ok(Some(Statement::new(sql, params)))
    }

    /// Compile a keyed batch DELETE from the primary-key tuples of `rows`.
    ///
    /// A table without a declared primary key cannot be batch-deleted.
    /// Rows lacking a complete key are skipped; duplicate tuples collapse,
    /// preserving first-seen order.
    pub fn compile_delete(&self, rows: &[Payload]) -> Result<Option<Statement>> {
        if rows.is_empty() {
            return Ok(None);
        }
        let keys = self.spec.primary_key_columns();
        if keys.is_empty() {
            return Err(Error::invalid_argument(format!(
                "table `{}` declares no primary key; batch delete requires one",
                self.spec.table()
            )));
        }

        let mut tuples: Vec<Vec<Value>> = Vec::new();
        for row in rows {
            let mut tuple = Vec::with_capacity(keys.len());
            let mut complete = true;
            for key in keys {
                match row.scalar(key) {
                    Some(v) if !v.is_null() => {
                        let Cell::Scalar(cast) = self.spec.cast(key, v) else {
                            return Err(Error::invalid_argument(format!(
                                "primary key column `{key}` does not cast to a scalar"
                            )));
                        };
                        tuple.push(cast);
                    }
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                if !tuples.contains(&tuple) {
                    tuples.push(tuple);
                }
            } else {
                tracing::warn!(
                    table = self.spec.table(),
                    "skipping delete for a row without a complete primary key"
                );
            }
        }
        if tuples.is_empty() {
            return Ok(None);
        }

        let mut params: Vec<Value> = Vec::new();
        let where_sql = Condition::in_tuples(keys.to_vec(), tuples).to_sql(&mut params);
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_table(self.spec.table()),
            where_sql
        );
        Ok(Some(Statement::new(sql, params)))
    }

    /// The batch column set: the first row's cells, filtered to schema-known
    /// columns and stripped of `skip` entries, in sorted order.
    fn batch_columns(&self, first_row: &Payload, skip: &[String]) -> Vec<String> {
        first_row
            .cells()
            .filter(|(name, _)| {
                self.spec.accepts_column(name) && !skip.iter().any(|s| s == *name)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The cast cell of `column` in `row`, rejecting rows that miss a column
    /// of the batch column set.
    fn cell(&self, row: &Payload, row_index: usize, column: &str) -> Result<Cell> {
        match row.get(column) {
            Some(PayloadValue::Scalar(v)) => Ok(self.spec.cast(column, v)),
            Some(PayloadValue::Expr(e)) => Ok(Cell::Expr(e.clone())),
            Some(_) => Err(Error::invalid_argument(format!(
                "column `{column}` of row {row_index} holds a nested payload"
            ))),
            None => Err(Error::invalid_argument(format!(
                "row {row_index} is missing column `{column}` of the batch column set"
            ))),
        }
    }
}

/// The bound text of a JSON cell: pre-encoded strings pass through,
/// everything else serializes.
pub(crate) fn json_text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => serde_json::to_string(&other.to_json()).unwrap_or_else(|_| "null".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{SqlExpr, SqlType};

    fn users_spec() -> TableSpec {
        TableSpec::new("users")
            .primary_key(["id"])
            .column("id", SqlType::Int)
            .column("name", SqlType::Text)
            .column("age", SqlType::Int)
    }

    fn user(id: i64, name: &str, age: i64) -> Payload {
        Payload::new().with("id", id).with("name", name).with("age", age)
    }

    #[test]
    fn insert_compiles_one_statement_with_n_tuples() {
        let spec = users_spec();
        let rows = vec![user(1, "a", 20), user(2, "b", 30), user(3, "c", 40)];
        let stmt = BatchCompiler::new(&spec)
            .compile_insert(&rows, InsertMode::Insert, true, &[])
            .unwrap()
            .unwrap();

        assert_eq!(
            stmt.sql,
            "INSERT INTO `users` (`age`, `id`, `name`) VALUES (?, ?, ?), (?, ?, ?), (?, ?, ?) \
             ON DUPLICATE KEY UPDATE `age` = VALUES(`age`), `name` = VALUES(`name`)"
        );
        assert_eq!(stmt.params.len(), 9);
        assert_eq!(stmt.params[0], Value::Int(20));
        assert_eq!(stmt.params[1], Value::Int(1));
        assert_eq!(stmt.params[2], Value::Text("a".into()));
    }

    #[test]
    fn upsert_clause_excludes_keys_and_requested_columns() {
        let spec = users_spec();
        let rows = vec![user(1, "a", 20)];
        let stmt = BatchCompiler::new(&spec)
            .compile_insert(&rows, InsertMode::Insert, true, &["age".to_string()])
            .unwrap()
            .unwrap();
        assert!(stmt.sql.ends_with("ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"));
        assert!(!stmt.sql.contains("`id` = VALUES"));
    }

    #[test]
    fn insert_modes_change_the_verb() {
        let spec = users_spec();
        let rows = vec![user(1, "a", 20)];
        let compiler = BatchCompiler::new(&spec);

        let replace = compiler
            .compile_insert(&rows, InsertMode::Replace, false, &[])
            .unwrap()
            .unwrap();
        assert!(replace.sql.starts_with("REPLACE INTO `users`"));

        let ignore = compiler
            .compile_insert(&rows, InsertMode::InsertIgnore, false, &[])
            .unwrap()
            .unwrap();
        assert!(ignore.sql.starts_with("INSERT IGNORE INTO `users`"));
    }

    #[test]
    fn unknown_columns_are_dropped_silently() {
        let spec = users_spec();
        let rows = vec![user(1, "a", 20).with("ghost", "boo")];
        let stmt = BatchCompiler::new(&spec)
            .compile_insert(&rows, InsertMode::Insert, false, &[])
            .unwrap()
            .unwrap();
        assert!(!stmt.sql.contains("ghost"));
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn unknown_schema_binds_every_column() {
        let spec = TableSpec::new("raw");
        let rows = vec![Payload::new().with("anything", 1_i64)];
        let stmt = BatchCompiler::new(&spec)
            .compile_insert(&rows, InsertMode::Insert, false, &[])
            .unwrap()
            .unwrap();
        assert!(stmt.sql.contains("`anything`"));
    }

    #[test]
    fn row_missing_a_batch_column_is_rejected() {
        let spec = users_spec();
        let rows = vec![user(1, "a", 20), Payload::new().with("id", 2_i64)];
        let err = BatchCompiler::new(&spec)
            .compile_insert(&rows, InsertMode::Insert, false, &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn expression_cells_splice_with_their_params() {
        let spec = users_spec();
        let rows = vec![
            Payload::new()
                .with("id", 1_i64)
                .with_expr("age", SqlExpr::with_params("`age` + ?", vec![Value::Int(5)]))
                .with("name", "a"),
        ];
        let stmt = BatchCompiler::new(&spec)
            .compile_insert(&rows, InsertMode::Insert, false, &[])
            .unwrap()
            .unwrap();
        assert!(stmt.sql.contains("VALUES (`age` + ?, ?, ?)"));
        // Splice-position ordering: the expression param comes first.
        assert_eq!(stmt.params[0], Value::Int(5));
        assert_eq!(stmt.params[1], Value::Int(1));
    }

    #[test]
    fn json_cells_serialize_unless_pre_encoded() {
        let spec = TableSpec::new("docs")
            .primary_key(["id"])
            .column("id", SqlType::Int)
            .column("meta", SqlType::Json);

        let rows = vec![
            Payload::new()
                .with("id", 1_i64)
                .with("meta", Value::Json(serde_json::json!({"a": 1}))),
        ];
        let stmt = BatchCompiler::new(&spec)
            .compile_insert(&rows, InsertMode::Insert, false, &[])
            .unwrap()
            .unwrap();
        assert_eq!(stmt.params[1], Value::Text("{\"a\":1}".into()));

        let rows = vec![
            Payload::new()
                .with("id", 1_i64)
                .with("meta", Value::Text("{\"pre\":true}".into())),
        ];
        let stmt = BatchCompiler::new(&spec)
            .compile_insert(&rows, InsertMode::Insert, false, &[])
            .unwrap()
            .unwrap();
        assert_eq!(stmt.params[1], Value::Text("{\"pre\":true}".into()));
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let spec = users_spec();
        let compiler = BatchCompiler::new(&spec);
        assert!(compiler
            .compile_insert(&[], InsertMode::Insert, true, &[])
            .unwrap()
            .is_none());
        assert!(compiler.compile_batch_update(&[], None).unwrap().is_none());
        assert!(compiler.compile_delete(&[]).unwrap().is_none());
    }

    #[test]
    fn batch_update_builds_one_when_branch_per_row() {
        let spec = users_spec();
        let rows = vec![user(1, "a", 20), user(2, "a", 21), user(3, "a", 22)];
        let stmt = BatchCompiler::new(&spec)
            .compile_batch_update(&rows, None)
            .unwrap()
            .unwrap();

        assert_eq!(stmt.sql.matches("CASE").count(), 2); // age and name columns
        let age_case = stmt
            .sql
            .split(", `name` = CASE")
            .next()
            .unwrap()
            .to_string();
        assert_eq!(age_case.matches("WHEN").count(), 3);
        assert!(stmt.sql.ends_with("WHERE `id` IN (?, ?, ?)"));
    }

    #[test]
    fn batch_update_where_lists_distinct_references_in_first_seen_order() {
        let spec = users_spec();
        // Row 2 repeats reference id=1: the WHERE-IN must list 1, 3 only.
        let rows = vec![user(1, "a", 20), user(1, "b", 21), user(3, "c", 22)];
        let stmt = BatchCompiler::new(&spec)
            .compile_batch_update(&rows, None)
            .unwrap()
            .unwrap();
        assert!(stmt.sql.ends_with("WHERE `id` IN (?, ?)"));
        let n = stmt.params.len();
        assert_eq!(stmt.params[n - 2], Value::Int(1));
        assert_eq!(stmt.params[n - 1], Value::Int(3));
    }

    #[test]
    fn batch_update_missing_reference_fails_before_sql() {
        let spec = users_spec();
        let rows = vec![user(1, "a", 20), Payload::new().with("name", "b").with("age", 9_i64)];
        let err = BatchCompiler::new(&spec)
            .compile_batch_update(&rows, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn batch_update_rejects_structured_references() {
        let spec = users_spec();
        let rows = vec![
            Payload::new()
                .with("id", Value::Array(vec![Value::Int(1)]))
                .with("name", "a")
                .with("age", 1_i64),
        ];
        let err = BatchCompiler::new(&spec)
            .compile_batch_update(&rows, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn batch_update_with_custom_references_uses_composite_tuples() {
        let spec = TableSpec::new("prices")
            .primary_key(["id"])
            .column("id", SqlType::Int)
            .column("region", SqlType::Text)
            .column("sku", SqlType::Text)
            .column("price", SqlType::Double);

        let refs = vec!["region".to_string(), "sku".to_string()];
        let rows = vec![
            Payload::new().with("region", "eu").with("sku", "a").with("price", 1.5),
            Payload::new().with("region", "us").with("sku", "b").with("price", 2.5),
        ];
        let stmt = BatchCompiler::new(&spec)
            .compile_batch_update(&rows, Some(refs.as_slice()))
            .unwrap()
            .unwrap();
        assert!(stmt.sql.contains("WHEN `region` = ? AND `sku` = ? THEN ?"));
        assert!(stmt.sql.ends_with("WHERE (`region`, `sku`) IN ((?, ?), (?, ?))"));
    }

    #[test]
    fn batch_update_expression_values_splice_into_then() {
        let spec = users_spec();
        let rows = vec![
            Payload::new()
                .with("id", 1_i64)
                .with_expr("age", SqlExpr::new("`age` + 1")),
        ];
        let stmt = BatchCompiler::new(&spec)
            .compile_batch_update(&rows, None)
            .unwrap()
            .unwrap();
        assert!(stmt.sql.contains("WHEN `id` = ? THEN `age` + 1"));
    }

    #[test]
    fn batch_update_with_only_reference_columns_is_a_no_op() {
        let spec = users_spec();
        let rows = vec![Payload::new().with("id", 1_i64)];
        assert!(BatchCompiler::new(&spec)
            .compile_batch_update(&rows, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn delete_reduces_rows_to_key_tuples() {
        let spec = users_spec();
        let rows = vec![user(1, "a", 20), user(2, "b", 30), user(1, "dup", 40)];
        let stmt = BatchCompiler::new(&spec).compile_delete(&rows).unwrap().unwrap();
        assert_eq!(stmt.sql, "DELETE FROM `users` WHERE `id` IN (?, ?)");
        assert_eq!(stmt.params, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn delete_composite_key_uses_tuple_in() {
        let spec = TableSpec::new("grants")
            .primary_key(["user_id", "role_id"])
            .column("user_id", SqlType::Int)
            .column("role_id", SqlType::Int);
        let rows = vec![
            Payload::new().with("user_id", 1_i64).with("role_id", 2_i64),
            Payload::new().with("user_id", 3_i64).with("role_id", 4_i64),
        ];
        let stmt = BatchCompiler::new(&spec).compile_delete(&rows).unwrap().unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM `grants` WHERE (`user_id`, `role_id`) IN ((?, ?), (?, ?))"
        );
    }

    #[test]
    fn delete_without_primary_key_is_a_policy_error() {
        let spec = TableSpec::new("logs").column("line", SqlType::Text);
        let rows = vec![Payload::new().with("line", "x")];
        let err = BatchCompiler::new(&spec).compile_delete(&rows).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn delete_skips_rows_without_complete_keys() {
        let spec = users_spec();
        let rows = vec![Payload::new().with("name", "keyless"), user(5, "e", 50)];
        let stmt = BatchCompiler::new(&spec).compile_delete(&rows).unwrap().unwrap();
        assert_eq!(stmt.params, vec![Value::Int(5)]);
    }
}
