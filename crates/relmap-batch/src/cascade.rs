//! The cascading table writer.
//!
//! A writer decomposes a nested payload into parent columns plus relation
//! sub-payloads, injects the declared link columns into every child, and
//! applies the batch compiler (or the per-row lifecycle) level by level.
//! Relation levels are processed sequentially so values produced at one
//! level are available to the next.
//!
//! Every top-level call runs in one transaction opened here; nested steps
//! reuse it, and any failure at any depth rolls the whole call back.
//! Deletes run depth-first: children go before their parent, and a nested
//! delete that affects no rows aborts the call with an overall result of 0.

use crate::compiler::{BatchCompiler, InsertMode, json_text};
use asupersync::{Cx, Outcome};
use relmap_core::{
    CascadeBlockedError, Cell, Condition, Connection, DeletePolicy, Error, Payload, PayloadValue,
    Record, Related, RelationSpec, Result, StaleObjectError, Statement, TableSpec, Value,
    key::normalize_key, try_outcome,
};
use relmap_query::find;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Options for [`TableWriter::update`].
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Compile one CASE-based batch UPDATE instead of upserting.
    pub only_update: bool,
    /// Columns identifying the target rows; the primary key when `None`.
    pub reference_columns: Option<Vec<String>>,
    /// Compiled bulk path (`true`) or per-row lifecycle path (`false`).
    pub batch: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            only_update: false,
            reference_columns: None,
            batch: true,
        }
    }
}

/// Applies create/update/delete payload trees to one table and its declared
/// relations, inside a single transaction per top-level call.
pub struct TableWriter<'a, C: Connection> {
    conn: &'a C,
    spec: Arc<TableSpec>,
}

impl<'a, C: Connection> TableWriter<'a, C> {
    #[must_use]
    pub fn new(conn: &'a C, spec: Arc<TableSpec>) -> Self {
        Self { conn, spec }
    }

    /// Insert `payloads` and their nested relations.
    ///
    /// The batch path compiles one statement per relation level; the
    /// per-row path applies defaults, runs callback validators, and captures
    /// driver-generated keys one record at a time.
    pub async fn create(
        &self,
        cx: &Cx,
        payloads: Vec<Payload>,
        batch: bool,
    ) -> Outcome<Vec<Record>, Error> {
        if payloads.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        try_outcome!(self.conn.begin_transaction(cx).await);
        let out = self.create_inner(cx, payloads, batch).await;
        self.finish(cx, out).await
    }

    /// Update `payloads` and their nested relations. See [`UpdateOptions`].
    ///
    /// A single payload carrying an `edit` entry (with a `where` entry) is a
    /// mass edit: one conditioned UPDATE, no cascading, empty result list.
    pub async fn update(
        &self,
        cx: &Cx,
        payloads: Vec<Payload>,
        options: UpdateOptions,
    ) -> Outcome<Vec<Record>, Error> {
        if payloads.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        try_outcome!(self.conn.begin_transaction(cx).await);
        let out = self.update_inner(cx, payloads, options).await;
        self.finish(cx, out).await
    }

    /// Delete `payloads` and their nested relations, children first.
    ///
    /// Returns the rows affected at the top level, or 0 when a nested delete
    /// affected nothing (the whole call is rolled back in that case).
    pub async fn delete(&self, cx: &Cx, payloads: Vec<Payload>) -> Outcome<u64, Error> {
        if payloads.is_empty() {
            return Outcome::Ok(0);
        }
        try_outcome!(self.conn.begin_transaction(cx).await);
        let out = self.delete_several(cx, &self.spec, payloads).await;
        match self.finish(cx, out).await {
            Outcome::Err(Error::CascadeBlocked(blocked)) => {
                tracing::info!(table = %blocked.table, "nested delete affected no rows; nothing happened");
                Outcome::Ok(0)
            }
            other => other,
        }
    }

    /// Delete by a map-form payload: primary-key values select the parent
    /// rows, relation entries are treated as child delete conditions, and a
    /// `where` entry alone performs a conditioned bulk delete.
    pub async fn delete_by(&self, cx: &Cx, body: Payload) -> Outcome<u64, Error> {
        try_outcome!(self.conn.begin_transaction(cx).await);
        let out = self.delete_by_inner(cx, body).await;
        match self.finish(cx, out).await {
            Outcome::Err(Error::CascadeBlocked(blocked)) => {
                tracing::info!(table = %blocked.table, "nested delete affected no rows; nothing happened");
                Outcome::Ok(0)
            }
            other => other,
        }
    }

    // ========================================================================
    // Transaction bracketing
    // ========================================================================

    /// Commit on success, roll back on any other outcome.
    async fn finish<T>(&self, cx: &Cx, out: Outcome<T, Error>) -> Outcome<T, Error> {
        match out {
            Outcome::Ok(v) => match self.conn.commit(cx).await {
                Outcome::Ok(()) => Outcome::Ok(v),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            Outcome::Err(e) => {
                if let Outcome::Err(rollback_err) = self.conn.rollback(cx).await {
                    tracing::warn!(error = %rollback_err, "rollback failed after error");
                }
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                let _ = self.conn.rollback(cx).await;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                let _ = self.conn.rollback(cx).await;
                Outcome::Panicked(p)
            }
        }
    }

    /// Execute a compiled mutation statement. Driver failures surface as
    /// mutation errors: the statement was rejected, not the data.
    async fn execute_mutation(
        &self,
        cx: &Cx,
        operation: &'static str,
        stmt: &Statement,
    ) -> Outcome<u64, Error> {
        match self.conn.execute(cx, &stmt.sql, &stmt.params).await {
            Outcome::Ok(n) => Outcome::Ok(n),
            Outcome::Err(Error::Validation(e)) => Outcome::Err(Error::Validation(e)),
            Outcome::Err(e) => {
                tracing::error!(error = %e, sql = %stmt.sql, "mutation failed");
                Outcome::Err(Error::mutation(operation, e.to_string()))
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    async fn create_inner(
        &self,
        cx: &Cx,
        payloads: Vec<Payload>,
        batch: bool,
    ) -> Outcome<Vec<Record>, Error> {
        if batch {
            let mut results = Vec::with_capacity(payloads.len());
            for payload in &payloads {
                match payload_to_record(&self.spec, payload) {
                    Ok(record) => results.push(record),
                    Err(e) => return Outcome::Err(e),
                }
            }
            try_outcome!(
                self.save_several(cx, &self.spec, payloads, InsertMode::Insert, false, &[])
                    .await
            );
            Outcome::Ok(results)
        } else {
            let mut results = Vec::with_capacity(payloads.len());
            for payload in payloads {
                results.push(try_outcome!(
                    self.create_model(cx, Arc::clone(&self.spec), payload).await
                ));
            }
            Outcome::Ok(results)
        }
    }

    /// The compiled bulk save: one INSERT (optionally upserting) for the
    /// parent rows, then one recursive call per relation with the children
    /// of that relation grouped across all parents.
    fn save_several<'f>(
        &'f self,
        cx: &'f Cx,
        spec: &'f TableSpec,
        payloads: Vec<Payload>,
        mode: InsertMode,
        with_update: bool,
        exclude: &'f [String],
    ) -> Pin<Box<dyn Future<Output = Outcome<u64, Error>> + Send + 'f>> {
        Box::pin(async move {
            if payloads.is_empty() {
                return Outcome::Ok(0);
            }
            for payload in &payloads {
                if let Err(e) = spec.rules().validate_rules(&payload.scalar_attributes()) {
                    return Outcome::Err(Error::Validation(e));
                }
            }

            let mut rows = payloads;
            let mut groups: Vec<(&RelationSpec, Vec<Payload>)> = Vec::new();
            for rel in spec.relations() {
                let mut children: Vec<Payload> = Vec::new();
                for row in &mut rows {
                    let Some(entry) = row.remove(&rel.name) else {
                        continue;
                    };
                    let mut subs = match entry {
                        PayloadValue::One(p) => vec![p],
                        PayloadValue::Many(list) => list,
                        // A column cell sharing a relation name stays a column.
                        cell => {
                            row.set(rel.name.clone(), cell);
                            continue;
                        }
                    };
                    if subs.is_empty() {
                        continue;
                    }
                    for sub in &mut subs {
                        if let Err(e) = inject_link(rel, row, sub) {
                            return Outcome::Err(e);
                        }
                    }
                    children.append(&mut subs);
                }
                if children.is_empty() {
                    continue;
                }
                if let Some(condition) = delete_policy_condition(rel, &children) {
                    try_outcome!(self.delete_where(cx, &rel.target, &condition).await);
                }
                groups.push((rel, children));
            }

            let statement = match BatchCompiler::new(spec).compile_insert(
                &rows,
                mode,
                with_update,
                exclude,
            ) {
                Ok(s) => s,
                Err(e) => return Outcome::Err(e),
            };
            let mut affected = 0;
            if let Some(stmt) = statement {
                affected = try_outcome!(self.execute_mutation(cx, "insert", &stmt).await);
            }
            tracing::debug!(
                table = spec.table(),
                affected,
                relations = groups.len(),
                "saved batch level"
            );

            for (rel, children) in groups {
                try_outcome!(
                    self.save_several(cx, &rel.target, children, InsertMode::Insert, true, &[])
                        .await
                );
            }
            Outcome::Ok(affected)
        })
    }

    /// The per-row lifecycle: defaults, full validation, single-row insert
    /// with generated-key capture, then each relation child created through
    /// the same lifecycle with link values taken from the saved record.
    fn create_model<'f>(
        &'f self,
        cx: &'f Cx,
        spec: Arc<TableSpec>,
        payload: Payload,
    ) -> Pin<Box<dyn Future<Output = Outcome<Record, Error>> + Send + 'f>> {
        Box::pin(async move {
            let (mut row, nested) = split_payload(&spec, payload);
            for (column, value) in spec.defaults() {
                if row.get(column).is_none() {
                    row.set(column.clone(), PayloadValue::Scalar(value.clone()));
                }
            }
            if let Err(e) = spec.rules().validate_full(&row.scalar_attributes()) {
                return Outcome::Err(Error::Validation(e));
            }

            let statement = match BatchCompiler::new(&spec).compile_insert(
                std::slice::from_ref(&row),
                InsertMode::Insert,
                false,
                &[],
            ) {
                Ok(s) => s,
                Err(e) => return Outcome::Err(e),
            };

            let mut record = Record::from_attributes(schema_attributes(&spec, &row));
            if let Some(stmt) = statement {
                let key = match self.conn.insert(cx, &stmt.sql, &stmt.params).await {
                    Outcome::Ok(k) => k,
                    Outcome::Err(Error::Validation(e)) => {
                        return Outcome::Err(Error::Validation(e));
                    }
                    Outcome::Err(e) => {
                        return Outcome::Err(Error::mutation("insert", e.to_string()));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                if key > 0 {
                    if let [pk] = spec.primary_key_columns() {
                        if record.get(pk).is_none_or(Value::is_null) {
                            record.set(pk.clone(), Value::Int(key));
                        }
                    }
                }
            }
            record.sync_old();

            for rel in spec.relations() {
                let Some(entry) = nested.get(&rel.name) else {
                    continue;
                };
                let subs: Vec<Payload> = match entry {
                    PayloadValue::One(p) => vec![p.clone()],
                    PayloadValue::Many(list) => list.clone(),
                    _ => continue,
                };
                let mut children = Vec::with_capacity(subs.len());
                for mut sub in subs {
                    if let Err(e) = inject_link_from_record(rel, &record, &mut sub) {
                        return Outcome::Err(e);
                    }
                    children.push(try_outcome!(
                        self.create_model(cx, Arc::clone(&rel.target), sub).await
                    ));
                }
                let related = if rel.multiple {
                    Related::Many(children)
                } else {
                    Related::One(children.into_iter().next().map(Box::new))
                };
                record.set_related(rel.name.clone(), related);
            }
            Outcome::Ok(record)
        })
    }

    // ========================================================================
    // Update
    // ========================================================================

    async fn update_inner(
        &self,
        cx: &Cx,
        payloads: Vec<Payload>,
        options: UpdateOptions,
    ) -> Outcome<Vec<Record>, Error> {
        if payloads.len() == 1 && payloads[0].contains("edit") {
            let (set, condition) = match parse_mass_edit(&payloads[0]) {
                Ok(v) => v,
                Err(e) => return Outcome::Err(e),
            };
            let affected = try_outcome!(self.update_where(cx, &self.spec, &set, &condition).await);
            tracing::info!(table = self.spec.table(), affected, "mass edit applied");
            return Outcome::Ok(Vec::new());
        }

        if options.only_update {
            let statement = match BatchCompiler::new(&self.spec)
                .compile_batch_update(&payloads, options.reference_columns.as_deref())
            {
                Ok(s) => s,
                Err(e) => return Outcome::Err(e),
            };
            if let Some(stmt) = statement {
                try_outcome!(self.execute_mutation(cx, "update", &stmt).await);
            }
            let results = payloads
                .iter()
                .map(|p| Record::from_attributes(schema_attributes(&self.spec, p)))
                .collect();
            return Outcome::Ok(results);
        }

        if options.batch {
            let mut results = Vec::with_capacity(payloads.len());
            for payload in &payloads {
                match payload_to_record(&self.spec, payload) {
                    Ok(record) => results.push(record),
                    Err(e) => return Outcome::Err(e),
                }
            }
            let exclude = options.reference_columns.clone().unwrap_or_default();
            try_outcome!(
                self.save_several(cx, &self.spec, payloads, InsertMode::Insert, true, &exclude)
                    .await
            );
            return Outcome::Ok(results);
        }

        // Per-row path: fetch the persisted baselines so dirty computation
        // and optimistic locking have correct ground truth.
        let exists = try_outcome!(self.find_exists(cx, &self.spec, &payloads).await);
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let baseline = check_exist(&payload, &exists, &self.spec);
            results.push(try_outcome!(
                self.update_model(cx, Arc::clone(&self.spec), payload, baseline)
                    .await
            ));
        }
        Outcome::Ok(results)
    }

    /// Rows already persisted for the given payloads, fetched by primary
    /// key in one query. Payloads without a complete key contribute nothing.
    async fn find_exists(
        &self,
        cx: &Cx,
        spec: &TableSpec,
        payloads: &[Payload],
    ) -> Outcome<Vec<Record>, Error> {
        let keys = spec.primary_key_columns();
        if keys.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let mut tuples: Vec<Vec<Value>> = Vec::new();
        for payload in payloads {
            let mut tuple = Vec::with_capacity(keys.len());
            let mut complete = true;
            for key in keys {
                match payload.scalar(key) {
                    Some(v) if !v.is_null() => tuple.push(v.clone()),
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete && !tuples.contains(&tuple) {
                tuples.push(tuple);
            }
        }
        if tuples.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        find::find_all(
            cx,
            self.conn,
            spec,
            &Condition::in_tuples(keys.to_vec(), tuples),
        )
        .await
    }

    /// Per-row update lifecycle against an optional persisted baseline;
    /// recurses into relation children the same way.
    fn update_model<'f>(
        &'f self,
        cx: &'f Cx,
        spec: Arc<TableSpec>,
        payload: Payload,
        baseline: Option<Record>,
    ) -> Pin<Box<dyn Future<Output = Outcome<Record, Error>> + Send + 'f>> {
        Box::pin(async move {
            let (row, nested) = split_payload(&spec, payload);
            if let Err(e) = spec.rules().validate_full(&row.scalar_attributes()) {
                return Outcome::Err(Error::Validation(e));
            }

            let mut record = Record::from_attributes(schema_attributes(&spec, &row));
            match baseline {
                Some(exist) => {
                    record.set_old_attributes(Some(exist.attributes().clone()));
                    let dirty: BTreeMap<String, Value> = record
                        .dirty_attributes(None)
                        .into_iter()
                        .filter(|(column, _)| {
                            spec.accepts_column(column) && Some(column.as_str()) != spec.lock()
                        })
                        .collect();
                    if dirty.is_empty() {
                        tracing::debug!(table = spec.table(), "no dirty attributes; skipping update");
                    } else {
                        try_outcome!(self.update_row(cx, &spec, &exist, &dirty).await);
                    }
                }
                None => {
                    // No persisted baseline: this row is new.
                    let statement = match BatchCompiler::new(&spec).compile_insert(
                        std::slice::from_ref(&row),
                        InsertMode::Insert,
                        false,
                        &[],
                    ) {
                        Ok(s) => s,
                        Err(e) => return Outcome::Err(e),
                    };
                    if let Some(stmt) = statement {
                        let key = match self.conn.insert(cx, &stmt.sql, &stmt.params).await {
                            Outcome::Ok(k) => k,
                            Outcome::Err(Error::Validation(e)) => {
                                return Outcome::Err(Error::Validation(e));
                            }
                            Outcome::Err(e) => {
                                return Outcome::Err(Error::mutation("insert", e.to_string()));
                            }
                            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                            Outcome::Panicked(p) => return Outcome::Panicked(p),
                        };
                        if key > 0 {
                            if let [pk] = spec.primary_key_columns() {
                                if record.get(pk).is_none_or(Value::is_null) {
                                    record.set(pk.clone(), Value::Int(key));
                                }
                            }
                        }
                    }
                }
            }
            record.sync_old();

            for rel in spec.relations() {
                let Some(entry) = nested.get(&rel.name) else {
                    continue;
                };
                let subs: Vec<Payload> = match entry {
                    PayloadValue::One(p) => vec![p.clone()],
                    PayloadValue::Many(list) => list.clone(),
                    _ => continue,
                };
                if subs.is_empty() {
                    continue;
                }
                if let Some(condition) = delete_policy_condition(rel, &subs) {
                    try_outcome!(self.delete_where(cx, &rel.target, &condition).await);
                }
                let child_exists = try_outcome!(self.find_exists(cx, &rel.target, &subs).await);
                let mut children = Vec::with_capacity(subs.len());
                for mut sub in subs {
                    if let Err(e) = inject_link_from_record(rel, &record, &mut sub) {
                        return Outcome::Err(e);
                    }
                    // A child payload may itself carry a mass edit directive,
                    // bypassing per-row cascading for that child table.
                    if sub.contains("edit") {
                        let (set, condition) = match parse_mass_edit(&sub) {
                            Ok(v) => v,
                            Err(e) => return Outcome::Err(e),
                        };
                        try_outcome!(self.update_where(cx, &rel.target, &set, &condition).await);
                        continue;
                    }
                    let child_baseline = check_exist(&sub, &child_exists, &rel.target);
                    children.push(try_outcome!(
                        self.update_model(cx, Arc::clone(&rel.target), sub, child_baseline)
                            .await
                    ));
                }
                let related = if rel.multiple {
                    Related::Many(children)
                } else {
                    Related::One(children.into_iter().next().map(Box::new))
                };
                record.set_related(rel.name.clone(), related);
            }
            Outcome::Ok(record)
        })
    }

    /// One UPDATE for the dirty columns of one row, keyed by primary key
    /// and, when declared, the optimistic-lock column. Zero affected rows
    /// with a lock in play means the baseline went stale.
    async fn update_row(
        &self,
        cx: &Cx,
        spec: &TableSpec,
        exist: &Record,
        dirty: &BTreeMap<String, Value>,
    ) -> Outcome<u64, Error> {
        let Some(pk_values) = exist.primary_key(spec) else {
            return Outcome::Err(Error::invalid_argument(format!(
                "cannot update a `{}` row without its primary key",
                spec.table()
            )));
        };

        let mut params: Vec<Value> = Vec::new();
        let mut assigns: Vec<String> = Vec::new();
        for (column, value) in dirty {
            match spec.cast(column, value) {
                Cell::Expr(expr) => {
                    assigns.push(format!(
                        "{} = {}",
                        self.conn.quote_identifier(column),
                        expr.sql
                    ));
                    params.extend(expr.params);
                }
                Cell::Json(json) => {
                    assigns.push(format!("{} = ?", self.conn.quote_identifier(column)));
                    params.push(Value::Text(json_text(&json)));
                }
                Cell::Scalar(value) => {
                    assigns.push(format!("{} = ?", self.conn.quote_identifier(column)));
                    params.push(value);
                }
            }
        }

        let mut lock_check = None;
        if let Some(lock) = spec.lock() {
            if let Some(version) = exist.get(lock).and_then(Value::as_i64) {
                assigns.push(format!("{} = ?", self.conn.quote_identifier(lock)));
                params.push(Value::Int(version + 1));
                lock_check = Some((lock.to_string(), version));
            }
        }
        if assigns.is_empty() {
            return Outcome::Ok(0);
        }

        let mut conditions: Vec<Condition> = spec
            .primary_key_columns()
            .iter()
            .zip(pk_values)
            .map(|(column, value)| Condition::Eq(column.clone(), value))
            .collect();
        if let Some((lock, version)) = &lock_check {
            conditions.push(Condition::Eq(lock.clone(), Value::Int(*version)));
        }
        let where_sql = Condition::All(conditions).to_sql(&mut params);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.conn.quote_table(spec.table()),
            assigns.join(", "),
            where_sql
        );
        let affected =
            try_outcome!(self.execute_mutation(cx, "update", &Statement::new(sql, params)).await);
        if affected == 0 && lock_check.is_some() {
            return Outcome::Err(Error::StaleObject(StaleObjectError {
                table: spec.table().to_string(),
                message: "the row being updated is outdated".to_string(),
            }));
        }
        Outcome::Ok(affected)
    }

    /// A direct conditioned UPDATE (the mass `edit` directive).
    async fn update_where(
        &self,
        cx: &Cx,
        spec: &TableSpec,
        set: &BTreeMap<String, Value>,
        condition: &Condition,
    ) -> Outcome<u64, Error> {
        let mut params: Vec<Value> = Vec::new();
        let mut assigns: Vec<String> = Vec::new();
        for (column, value) in set {
            if !spec.accepts_column(column) {
                continue;
            }
            match spec.cast(column, value) {
                Cell::Expr(expr) => {
                    assigns.push(format!(
                        "{} = {}",
                        self.conn.quote_identifier(column),
                        expr.sql
                    ));
                    params.extend(expr.params);
                }
                Cell::Json(json) => {
                    assigns.push(format!("{} = ?", self.conn.quote_identifier(column)));
                    params.push(Value::Text(json_text(&json)));
                }
                Cell::Scalar(value) => {
                    assigns.push(format!("{} = ?", self.conn.quote_identifier(column)));
                    params.push(value);
                }
            }
        }
        if assigns.is_empty() {
            return Outcome::Ok(0);
        }
        let where_sql = condition.to_sql(&mut params);
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.conn.quote_table(spec.table()),
            assigns.join(", "),
            where_sql
        );
        self.execute_mutation(cx, "update", &Statement::new(sql, params))
            .await
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Depth-first recursive delete. Children of every row are deleted
    /// before the rows themselves; a child level affecting zero rows raises
    /// the cascade block that unwinds the whole call.
    fn delete_several<'f>(
        &'f self,
        cx: &'f Cx,
        spec: &'f TableSpec,
        payloads: Vec<Payload>,
    ) -> Pin<Box<dyn Future<Output = Outcome<u64, Error>> + Send + 'f>> {
        Box::pin(async move {
            if payloads.is_empty() {
                return Outcome::Ok(0);
            }
            let mut rows = payloads;
            for rel in spec.relations() {
                let mut children: Vec<Payload> = Vec::new();
                for row in &mut rows {
                    match row.remove(&rel.name) {
                        Some(PayloadValue::One(p)) => children.push(p),
                        Some(PayloadValue::Many(list)) => children.extend(list),
                        Some(cell) => row.set(rel.name.clone(), cell),
                        None => {}
                    }
                }
                if children.is_empty() {
                    continue;
                }
                let affected = try_outcome!(self.delete_several(cx, &rel.target, children).await);
                if affected == 0 {
                    return Outcome::Err(Error::CascadeBlocked(CascadeBlockedError {
                        table: rel.target.table().to_string(),
                    }));
                }
            }

            let statement = match BatchCompiler::new(spec).compile_delete(&rows) {
                Ok(s) => s,
                Err(e) => return Outcome::Err(e),
            };
            match statement {
                Some(stmt) => self.execute_mutation(cx, "delete", &stmt).await,
                None => Outcome::Ok(0),
            }
        })
    }

    async fn delete_by_inner(&self, cx: &Cx, body: Payload) -> Outcome<u64, Error> {
        let spec = Arc::clone(&self.spec);
        let keys = spec.primary_key_columns();

        let mut key_map = BTreeMap::new();
        for key in keys {
            if let Some(value) = body.scalar(key) {
                if !value.is_null() {
                    key_map.insert(key.clone(), value.clone());
                }
            }
        }
        if !key_map.is_empty() {
            for rel in spec.relations() {
                let condition = match body.get(&rel.name) {
                    Some(PayloadValue::One(sub)) => {
                        Some(Condition::from_equality_map(&sub.scalar_attributes()))
                    }
                    Some(PayloadValue::Many(subs)) if !subs.is_empty() => Some(Condition::any(
                        subs.iter()
                            .map(|s| Condition::from_equality_map(&s.scalar_attributes()))
                            .collect(),
                    )),
                    _ => None,
                };
                if let Some(condition) = condition {
                    let affected =
                        try_outcome!(self.delete_where(cx, &rel.target, &condition).await);
                    if affected == 0 {
                        return Outcome::Err(Error::CascadeBlocked(CascadeBlockedError {
                            table: rel.target.table().to_string(),
                        }));
                    }
                }
            }
            return self
                .delete_where(cx, &spec, &Condition::from_equality_map(&key_map))
                .await;
        }

        if let Some(PayloadValue::One(where_map)) = body.get("where") {
            return self
                .delete_where(
                    cx,
                    &spec,
                    &Condition::from_equality_map(&where_map.scalar_attributes()),
                )
                .await;
        }
        Outcome::Ok(0)
    }

    /// A direct conditioned DELETE (delete policies, map-form deletes).
    async fn delete_where(
        &self,
        cx: &Cx,
        spec: &TableSpec,
        condition: &Condition,
    ) -> Outcome<u64, Error> {
        let mut params = Vec::new();
        let where_sql = condition.to_sql(&mut params);
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.conn.quote_table(spec.table()),
            where_sql
        );
        self.execute_mutation(cx, "delete", &Statement::new(sql, params))
            .await
    }
}

// ============================================================================
// Payload decomposition helpers
// ============================================================================

/// Resolve a relation's delete policy against its pending child payloads.
fn delete_policy_condition(rel: &RelationSpec, children: &[Payload]) -> Option<Condition> {
    match rel.delete_policy.as_ref()? {
        DeletePolicy::Condition(condition) => Some(condition.clone()),
        DeletePolicy::Hook(hook) => hook(&rel.target, children),
    }
}

/// Copy the declared link values from a parent payload into a child payload.
fn inject_link(rel: &RelationSpec, parent: &Payload, child: &mut Payload) -> Result<()> {
    for (child_column, parent_column) in &rel.link {
        let Some(value) = parent.scalar(parent_column) else {
            return Err(Error::invalid_argument(format!(
                "payload is missing `{parent_column}` needed to link relation `{}`",
                rel.name
            )));
        };
        child.set(child_column.clone(), PayloadValue::Scalar(value.clone()));
    }
    Ok(())
}

/// Copy the declared link values from a saved parent record into a child
/// payload; the record carries driver-generated keys the payload may lack.
fn inject_link_from_record(rel: &RelationSpec, parent: &Record, child: &mut Payload) -> Result<()> {
    for (child_column, parent_column) in &rel.link {
        let Some(value) = parent.get(parent_column) else {
            return Err(Error::invalid_argument(format!(
                "saved record is missing `{parent_column}` needed to link relation `{}`",
                rel.name
            )));
        };
        child.set(child_column.clone(), PayloadValue::Scalar(value.clone()));
    }
    Ok(())
}

/// Split a payload into its column part and its relation entries.
fn split_payload(spec: &TableSpec, mut payload: Payload) -> (Payload, BTreeMap<String, PayloadValue>) {
    let mut nested = BTreeMap::new();
    for rel in spec.relations() {
        if matches!(
            payload.get(&rel.name),
            Some(PayloadValue::One(_) | PayloadValue::Many(_))
        ) {
            if let Some(entry) = payload.remove(&rel.name) {
                nested.insert(rel.name.clone(), entry);
            }
        }
    }
    (payload, nested)
}

/// The schema-known scalar attributes of a payload row.
fn schema_attributes(spec: &TableSpec, payload: &Payload) -> BTreeMap<String, Value> {
    payload
        .scalar_attributes()
        .into_iter()
        .filter(|(column, _)| spec.accepts_column(column))
        .collect()
}

/// Build the result record for a payload row without touching the database:
/// schema-known columns plus nested children with link values injected.
fn payload_to_record(spec: &TableSpec, payload: &Payload) -> Result<Record> {
    let mut record = Record::from_attributes(schema_attributes(spec, payload));
    for rel in spec.relations() {
        match payload.get(&rel.name) {
            Some(PayloadValue::One(sub)) => {
                let mut sub = sub.clone();
                inject_link(rel, payload, &mut sub)?;
                record.set_related(
                    rel.name.clone(),
                    Related::One(Some(Box::new(payload_to_record(&rel.target, &sub)?))),
                );
            }
            Some(PayloadValue::Many(subs)) => {
                let mut children = Vec::with_capacity(subs.len());
                for sub in subs {
                    let mut sub = sub.clone();
                    inject_link(rel, payload, &mut sub)?;
                    children.push(payload_to_record(&rel.target, &sub)?);
                }
                record.set_related(rel.name.clone(), Related::Many(children));
            }
            _ => {}
        }
    }
    Ok(record)
}

/// Find the persisted row matching a payload's primary-key values.
fn check_exist(payload: &Payload, exists: &[Record], spec: &TableSpec) -> Option<Record> {
    let keys = spec.primary_key_columns();
    if keys.is_empty() || exists.is_empty() {
        return None;
    }
    exists
        .iter()
        .find(|record| {
            keys.iter().all(|key| {
                match (payload.scalar(key), record.get(key)) {
                    // Key values may come back from the driver in a
                    // different type than the payload carries.
                    (Some(a), Some(b)) => normalize_key(a) == normalize_key(b),
                    _ => false,
                }
            })
        })
        .cloned()
}

/// Parse the mass `edit` directive: `edit` holds the attribute set, `where`
/// the equality condition scoping it.
fn parse_mass_edit(payload: &Payload) -> Result<(BTreeMap<String, Value>, Condition)> {
    let Some(PayloadValue::One(set)) = payload.get("edit") else {
        return Err(Error::invalid_argument(
            "`edit` must hold the attribute map to apply",
        ));
    };
    let Some(PayloadValue::One(where_map)) = payload.get("where") else {
        return Err(Error::invalid_argument(
            "a mass edit requires a `where` condition",
        ));
    };
    let set = set.scalar_attributes();
    if set.is_empty() {
        return Err(Error::invalid_argument("`edit` carries no attributes"));
    }
    let condition = Condition::from_equality_map(&where_map.scalar_attributes());
    Ok((set, condition))
}
