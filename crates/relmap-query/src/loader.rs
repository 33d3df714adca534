//! The eager-loading relation resolver.
//!
//! Given a set of primary records and a relation, the resolver issues one
//! query against the related table, buckets the returned rows by their
//! normalized child-side key, and assigns each primary its bucket. Via
//! relations resolve the intermediate relation first and merge transitively
//! through a two-level bucket. Declared inverse relations are back-populated
//! from memory without a second query.
//!
//! An empty link-value set short-circuits: no query is sent and empty
//! results are cached. Sending `IN ()` to the database, or treating it as
//! fetch-all, would both be wrong.

use crate::find;
use asupersync::{Cx, Outcome};
use relmap_core::{
    Condition, Connection, Error, InverseSpec, Record, Related, RelationSpec, TableSpec, Value,
    key::normalize_key, try_outcome,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Upper bound on via-relation nesting. A chain this deep is a
/// configuration error, not a real schema.
const MAX_VIA_DEPTH: usize = 16;

/// Resolves relations for sets of primary records.
pub struct EagerLoader<'a, C: Connection> {
    conn: &'a C,
}

impl<'a, C: Connection> EagerLoader<'a, C> {
    #[must_use]
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Resolve one relation against `primaries`, populating each primary's
    /// relation cache and returning the related records.
    pub async fn resolve(
        &self,
        cx: &Cx,
        spec: &RelationSpec,
        primaries: &mut [Record],
    ) -> Outcome<Vec<Record>, Error> {
        self.resolve_inner(cx, spec, primaries, true, 0).await
    }

    /// Resolve several relations of `table` against `records`.
    pub async fn resolve_relations(
        &self,
        cx: &Cx,
        table: &TableSpec,
        names: &[&str],
        records: &mut [Record],
    ) -> Outcome<(), Error> {
        for name in names {
            let Some(spec) = table.relation_of(name) else {
                return Outcome::Err(Error::spec(format!(
                    "table `{}` declares no relation `{name}`",
                    table.table()
                )));
            };
            try_outcome!(self.resolve_inner(cx, spec, records, true, 0).await);
        }
        Outcome::Ok(())
    }

    fn resolve_inner<'f>(
        &'f self,
        cx: &'f Cx,
        spec: &'f RelationSpec,
        primaries: &'f mut [Record],
        populate: bool,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Outcome<Vec<Record>, Error>> + Send + 'f>> {
        Box::pin(async move {
            if spec.link.is_empty() {
                return Outcome::Err(Error::spec(format!(
                    "relation `{}` has an empty link map",
                    spec.name
                )));
            }
            if depth > MAX_VIA_DEPTH {
                return Outcome::Err(Error::spec(format!(
                    "relation `{}` nests via-relations deeper than {MAX_VIA_DEPTH}",
                    spec.name
                )));
            }
            if primaries.is_empty() {
                return Outcome::Ok(Vec::new());
            }

            // An indirect relation resolves its via first, against the same
            // primaries; the related query then filters by the via rows.
            let via_records = match &spec.via {
                Some(via) => Some(try_outcome!(
                    self.resolve_inner(cx, via.spec(), primaries, via.populates(), depth + 1)
                        .await
                )),
                None => None,
            };
            let via_link = spec.via.as_ref().map(|v| v.spec().link.as_slice());

            let filter_tuples = match &via_records {
                Some(rows) => collect_filter_tuples(rows, &spec.link),
                None => collect_filter_tuples(primaries, &spec.link),
            };
            if filter_tuples.is_empty() {
                tracing::debug!(relation = %spec.name, "empty link filter; skipping query");
                if populate {
                    for primary in primaries.iter_mut() {
                        primary.set_related(spec.name.clone(), Related::empty(spec.multiple));
                    }
                }
                return Outcome::Ok(Vec::new());
            }

            let child_cols: Vec<String> = spec.link.iter().map(|(c, _)| c.clone()).collect();
            let condition = Condition::in_tuples(child_cols, filter_tuples);

            // Common "fetch one with relations" path: a single primary with
            // a single-valued relation needs no bucket machinery.
            if !spec.multiple && primaries.len() == 1 {
                let found = try_outcome!(
                    find::find_one(cx, self.conn, &spec.target, &condition).await
                );
                let mut found: Vec<Record> = found.into_iter().collect();
                if let Some(inv) = &spec.inverse {
                    apply_inverse(spec, inv, primaries, &mut found);
                }
                if populate {
                    primaries[0].set_related(
                        spec.name.clone(),
                        Related::One(found.first().cloned().map(Box::new)),
                    );
                }
                return Outcome::Ok(found);
            }

            let mut models =
                try_outcome!(find::find_all(cx, self.conn, &spec.target, &condition).await);
            tracing::debug!(
                relation = %spec.name,
                primaries = primaries.len(),
                rows = models.len(),
                "resolved related rows"
            );

            // Back-populate the inverse before buckets are built so the
            // copies distributed to the primaries carry it too.
            if let Some(inv) = &spec.inverse {
                apply_inverse(spec, inv, primaries, &mut models);
            }

            if !populate {
                return Outcome::Ok(models);
            }

            let mut buckets = match (&via_records, via_link) {
                (Some(rows), Some(vlink)) => build_buckets_via(&models, &spec.link, rows, vlink),
                _ => build_buckets(&models, &spec.link),
            };
            if let (Some(col), true) = (&spec.index_by, spec.multiple) {
                index_buckets(&mut buckets, col);
            }

            // With a via, the primary's key comes from the via link's
            // parent-side columns.
            let key_link = via_link.unwrap_or(&spec.link);
            let parent_cols: Vec<&str> = key_link.iter().map(|(_, p)| p.as_str()).collect();

            for primary in primaries.iter_mut() {
                let value = related_for_primary(primary, spec, &parent_cols, &buckets);
                primary.set_related(spec.name.clone(), value);
            }

            Outcome::Ok(models)
        })
    }
}

/// Collect the de-duplicated link-value tuples of `records`, flattening
/// array-valued attributes and skipping NULL/absent components.
fn collect_filter_tuples(records: &[Record], link: &[(String, String)]) -> Vec<Vec<Value>> {
    let mut seen: Vec<Vec<Value>> = Vec::new();
    let mut push = |tuple: Vec<Value>| {
        if !seen.contains(&tuple) {
            seen.push(tuple);
        }
    };
    if link.len() == 1 {
        let parent_col = &link[0].1;
        for record in records {
            match record.get(parent_col) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => {
                    for item in items {
                        if !item.is_null() {
                            push(vec![item.clone()]);
                        }
                    }
                }
                Some(v) => push(vec![v.clone()]),
            }
        }
    } else {
        for record in records {
            let mut tuple = Vec::with_capacity(link.len());
            let mut complete = true;
            for (_, parent_col) in link {
                match record.get(parent_col) {
                    Some(v) if !v.is_null() => tuple.push(v.clone()),
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                push(tuple);
            }
        }
    }
    seen
}

/// Bucket related rows by their child-side link key.
fn build_buckets(models: &[Record], link: &[(String, String)]) -> HashMap<String, Vec<Record>> {
    let child_cols: Vec<&str> = link.iter().map(|(c, _)| c.as_str()).collect();
    let mut buckets: HashMap<String, Vec<Record>> = HashMap::new();
    for model in models {
        buckets
            .entry(model.key_of(&child_cols))
            .or_default()
            .push(model.clone());
    }
    buckets
}

/// Two-level buckets for a via relation: junction rows map related keys to
/// parent keys, and each related row lands in every parent bucket reachable
/// through a matching junction row.
fn build_buckets_via(
    models: &[Record],
    link: &[(String, String)],
    via_rows: &[Record],
    via_link: &[(String, String)],
) -> HashMap<String, Vec<Record>> {
    let via_child_cols: Vec<&str> = via_link.iter().map(|(c, _)| c.as_str()).collect();
    let link_parent_cols: Vec<&str> = link.iter().map(|(_, p)| p.as_str()).collect();

    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for via_row in via_rows {
        let parent_key = via_row.key_of(&via_child_cols);
        let related_key = via_row.key_of(&link_parent_cols);
        let parents = map.entry(related_key).or_default();
        if !parents.contains(&parent_key) {
            parents.push(parent_key);
        }
    }

    let child_cols: Vec<&str> = link.iter().map(|(c, _)| c.as_str()).collect();
    let mut buckets: HashMap<String, Vec<Record>> = HashMap::new();
    for model in models {
        if let Some(parent_keys) = map.get(&model.key_of(&child_cols)) {
            for parent_key in parent_keys {
                buckets
                    .entry(parent_key.clone())
                    .or_default()
                    .push(model.clone());
            }
        }
    }
    buckets
}

/// De-duplicate each bucket by the index column: a later row with the same
/// index replaces the earlier one in place, so positions never renumber.
fn index_buckets(buckets: &mut HashMap<String, Vec<Record>>, index_by: &str) {
    for bucket in buckets.values_mut() {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut deduped: Vec<Record> = Vec::with_capacity(bucket.len());
        for record in bucket.drain(..) {
            let index_key = record.key_of(&[index_by]);
            match positions.get(&index_key) {
                Some(&pos) => deduped[pos] = record,
                None => {
                    positions.insert(index_key, deduped.len());
                    deduped.push(record);
                }
            }
        }
        *bucket = deduped;
    }
}

/// Compute the relation value one primary receives from the buckets.
fn related_for_primary(
    primary: &Record,
    spec: &RelationSpec,
    parent_cols: &[&str],
    buckets: &HashMap<String, Vec<Record>>,
) -> Related {
    // A single array-valued link attribute: every element looks up the
    // bucket independently and the results are merged.
    if spec.multiple && parent_cols.len() == 1 {
        if let Some(Value::Array(keys)) = primary.get(parent_cols[0]) {
            let mut merged: Vec<Record> = Vec::new();
            match &spec.index_by {
                Some(col) => {
                    let mut positions: HashMap<String, usize> = HashMap::new();
                    for key in keys {
                        if let Some(bucket) = buckets.get(&normalize_key(key)) {
                            for record in bucket {
                                let index_key = record.key_of(&[col.as_str()]);
                                match positions.get(&index_key) {
                                    Some(&pos) => merged[pos] = record.clone(),
                                    None => {
                                        positions.insert(index_key, merged.len());
                                        merged.push(record.clone());
                                    }
                                }
                            }
                        }
                    }
                }
                None => {
                    for key in keys {
                        if let Some(bucket) = buckets.get(&normalize_key(key)) {
                            merged.extend(bucket.iter().cloned());
                        }
                    }
                }
            }
            return Related::Many(merged);
        }
    }

    let key = primary.key_of(parent_cols);
    match buckets.get(&key) {
        Some(bucket) if spec.multiple => Related::Many(bucket.clone()),
        // Single-valued: the first row returned for a key wins.
        Some(bucket) => Related::One(bucket.first().cloned().map(Box::new)),
        None => Related::empty(spec.multiple),
    }
}

/// Assign the primaries into every related record's inverse relation,
/// entirely from memory.
fn apply_inverse(
    spec: &RelationSpec,
    inv: &InverseSpec,
    primaries: &[Record],
    models: &mut [Record],
) {
    if primaries.is_empty() || models.is_empty() {
        return;
    }
    let inv_link = spec.inverse_link();
    let primary_cols: Vec<&str> = inv_link.iter().map(|(c, _)| c.as_str()).collect();
    let model_cols: Vec<&str> = inv_link.iter().map(|(_, p)| p.as_str()).collect();

    if inv.multiple {
        let mut buckets: HashMap<String, Vec<Record>> = HashMap::new();
        for primary in primaries {
            buckets
                .entry(primary.key_of(&primary_cols))
                .or_default()
                .push(primary.clone());
        }
        for model in models.iter_mut() {
            let key = model.key_of(&model_cols);
            model.set_related(
                inv.name.clone(),
                Related::Many(buckets.get(&key).cloned().unwrap_or_default()),
            );
        }
    } else {
        let mut owners: HashMap<String, Record> = HashMap::new();
        for primary in primaries {
            owners
                .entry(primary.key_of(&primary_cols))
                .or_insert_with(|| primary.clone());
        }
        for model in models.iter_mut() {
            let key = model.key_of(&model_cols);
            model.set_related(
                inv.name.clone(),
                Related::One(owners.get(&key).cloned().map(Box::new)),
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::{Row, SqlType};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[derive(Debug, Default)]
    struct MockState {
        query_calls: usize,
        query_one_calls: usize,
        queries: Vec<(String, Vec<Value>)>,
    }

    /// Canned rows per table name; queries are answered by substring match
    /// on the quoted table name.
    #[derive(Clone)]
    struct MockConnection {
        state: Arc<Mutex<MockState>>,
        tables: Arc<Vec<(&'static str, Vec<Row>)>>,
    }

    impl MockConnection {
        fn new(state: Arc<Mutex<MockState>>, tables: Vec<(&'static str, Vec<Row>)>) -> Self {
            Self {
                state,
                tables: Arc::new(tables),
            }
        }

        fn rows_for(&self, sql: &str) -> Vec<Row> {
            self.tables
                .iter()
                .find(|(table, _)| sql.contains(&format!("`{table}`")))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default()
        }
    }

    impl Connection for MockConnection {
        fn query(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            let rows = self.rows_for(sql);
            let state = Arc::clone(&self.state);
            let sql = sql.to_string();
            let params = params.to_vec();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                guard.query_calls += 1;
                guard.queries.push((sql, params));
                Outcome::Ok(rows)
            }
        }

        fn query_one(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
            let row = self.rows_for(sql).into_iter().next();
            let state = Arc::clone(&self.state);
            let sql = sql.to_string();
            let params = params.to_vec();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                guard.query_one_calls += 1;
                guard.queries.push((sql, params));
                Outcome::Ok(row)
            }
        }

        fn execute(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            async { Outcome::Ok(0) }
        }

        fn insert(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<i64, Error>> + Send {
            async { Outcome::Ok(0) }
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        Row::new(
            pairs.iter().map(|(n, _)| (*n).to_string()).collect(),
            pairs.iter().map(|(_, v)| v.clone()).collect(),
        )
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        let attrs: BTreeMap<String, Value> = pairs
            .iter()
            .map(|(n, v)| ((*n).to_string(), v.clone()))
            .collect();
        Record::from_attributes(attrs)
    }

    fn items_table() -> Arc<TableSpec> {
        Arc::new(
            TableSpec::new("items")
                .primary_key(["id"])
                .column("id", SqlType::Int)
                .column("order_id", SqlType::Int)
                .column("sku", SqlType::Text),
        )
    }

    fn items_relation() -> RelationSpec {
        RelationSpec::many("items", items_table()).link("order_id", "id")
    }

    #[test]
    fn shared_fk_resolves_with_one_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(
            Arc::clone(&state),
            vec![(
                "items",
                vec![
                    row(&[
                        ("id", Value::Int(10)),
                        ("order_id", Value::Int(1)),
                        ("sku", Value::Text("a".into())),
                    ]),
                    row(&[
                        ("id", Value::Int(11)),
                        ("order_id", Value::Int(1)),
                        ("sku", Value::Text("b".into())),
                    ]),
                ],
            )],
        );

        let mut orders = vec![
            record(&[("id", Value::Int(1))]),
            record(&[("id", Value::Int(1))]),
            record(&[("id", Value::Int(2))]),
        ];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let spec = items_relation();
            let models = unwrap_outcome(loader.resolve(&cx, &spec, &mut orders).await);
            assert_eq!(models.len(), 2);

            // Exactly one query regardless of primary count.
            assert_eq!(state.lock().unwrap().query_calls, 1);

            // Both records with the same key got deep-equal sets.
            let first = orders[0].related("items").unwrap();
            let second = orders[1].related("items").unwrap();
            assert_eq!(first, second);
            assert_eq!(first.len(), 2);

            // The unmatched key got an empty list, not a missing entry.
            let third = orders[2].related("items").unwrap();
            assert_eq!(third, &Related::Many(vec![]));
        });
    }

    #[test]
    fn empty_link_values_skip_the_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state), vec![("items", vec![])]);

        let mut orders = vec![
            record(&[("id", Value::Null)]),
            Record::from_attributes(BTreeMap::new()),
        ];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let spec = items_relation();
            let models = unwrap_outcome(loader.resolve(&cx, &spec, &mut orders).await);
            assert!(models.is_empty());
            assert_eq!(state.lock().unwrap().query_calls, 0);
            assert_eq!(state.lock().unwrap().query_one_calls, 0);
            assert_eq!(orders[0].related("items").unwrap(), &Related::Many(vec![]));
            assert_eq!(orders[1].related("items").unwrap(), &Related::Many(vec![]));
        });
    }

    #[test]
    fn single_valued_bucket_keeps_first_row() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(
            Arc::clone(&state),
            vec![(
                "items",
                vec![
                    row(&[
                        ("id", Value::Int(10)),
                        ("order_id", Value::Int(1)),
                        ("sku", Value::Text("first".into())),
                    ]),
                    row(&[
                        ("id", Value::Int(11)),
                        ("order_id", Value::Int(1)),
                        ("sku", Value::Text("second".into())),
                    ]),
                ],
            )],
        );

        // Two primaries force the bucket path instead of the one-row shortcut.
        let mut orders = vec![
            record(&[("id", Value::Int(1))]),
            record(&[("id", Value::Int(2))]),
        ];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let spec = RelationSpec::one("first_item", items_table()).link("order_id", "id");
            unwrap_outcome(loader.resolve(&cx, &spec, &mut orders).await);

            let Related::One(Some(item)) = orders[0].related("first_item").unwrap() else {
                std::panic::panic_any("expected a single related record");
            };
            assert_eq!(item.get("sku"), Some(&Value::Text("first".into())));
        });
    }

    #[test]
    fn single_primary_single_valued_uses_query_one() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(
            Arc::clone(&state),
            vec![(
                "items",
                vec![row(&[
                    ("id", Value::Int(10)),
                    ("order_id", Value::Int(1)),
                    ("sku", Value::Text("only".into())),
                ])],
            )],
        );

        let mut orders = vec![record(&[("id", Value::Int(1))])];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let spec = RelationSpec::one("first_item", items_table()).link("order_id", "id");
            let models = unwrap_outcome(loader.resolve(&cx, &spec, &mut orders).await);
            assert_eq!(models.len(), 1);
            assert_eq!(state.lock().unwrap().query_calls, 0);
            assert_eq!(state.lock().unwrap().query_one_calls, 1);
            assert!(matches!(
                orders[0].related("first_item").unwrap(),
                Related::One(Some(_))
            ));
        });
    }

    #[test]
    fn via_junction_merges_transitively() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let junction_table = Arc::new(
            TableSpec::new("order_items")
                .column("order_id", SqlType::Int)
                .column("item_id", SqlType::Int),
        );

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(
            Arc::clone(&state),
            vec![
                (
                    "order_items",
                    vec![
                        row(&[("order_id", Value::Int(1)), ("item_id", Value::Int(10))]),
                        row(&[("order_id", Value::Int(1)), ("item_id", Value::Int(11))]),
                        row(&[("order_id", Value::Int(2)), ("item_id", Value::Int(10))]),
                    ],
                ),
                (
                    "items",
                    vec![
                        row(&[("id", Value::Int(10)), ("sku", Value::Text("a".into()))]),
                        row(&[("id", Value::Int(11)), ("sku", Value::Text("b".into()))]),
                    ],
                ),
            ],
        );

        let mut orders = vec![
            record(&[("id", Value::Int(1))]),
            record(&[("id", Value::Int(2))]),
        ];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let junction =
                RelationSpec::many("order_items", junction_table).link("order_id", "id");
            let spec = RelationSpec::many("products", items_table())
                .link("id", "item_id")
                .via_junction(junction);

            let models = unwrap_outcome(loader.resolve(&cx, &spec, &mut orders).await);
            assert_eq!(models.len(), 2);
            // One query for the junction, one for the related table.
            assert_eq!(state.lock().unwrap().query_calls, 2);

            let first = orders[0].related("products").unwrap();
            assert_eq!(first.len(), 2);
            let second = orders[1].related("products").unwrap();
            assert_eq!(second.len(), 1);
            let Related::Many(rows) = second else {
                std::panic::panic_any("expected a list");
            };
            assert_eq!(rows[0].get("sku"), Some(&Value::Text("a".into())));

            // The junction rows themselves were not cached on the primaries.
            assert!(!orders[0].is_relation_populated("order_items"));
        });
    }

    #[test]
    fn array_valued_key_concatenates_matches() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let tags_table = Arc::new(
            TableSpec::new("tags")
                .primary_key(["id"])
                .column("id", SqlType::Int)
                .column("label", SqlType::Text),
        );

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(
            Arc::clone(&state),
            vec![(
                "tags",
                vec![
                    row(&[("id", Value::Int(1)), ("label", Value::Text("red".into()))]),
                    row(&[("id", Value::Int(2)), ("label", Value::Text("blue".into()))]),
                    row(&[("id", Value::Int(3)), ("label", Value::Text("green".into()))]),
                ],
            )],
        );

        let mut posts = vec![record(&[
            ("id", Value::Int(100)),
            (
                "tag_ids",
                Value::Array(vec![Value::Int(3), Value::Int(1), Value::Int(2)]),
            ),
        ])];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let spec = RelationSpec::many("tags", tags_table).link("id", "tag_ids");
            let models = unwrap_outcome(loader.resolve(&cx, &spec, &mut posts).await);
            assert_eq!(models.len(), 3);
            assert_eq!(state.lock().unwrap().query_calls, 1);

            let Related::Many(rows) = posts[0].related("tags").unwrap() else {
                std::panic::panic_any("expected a list");
            };
            // Exactly the three referenced rows, in key order, not renumbered away.
            assert_eq!(rows.len(), 3);
            assert_eq!(rows[0].get("label"), Some(&Value::Text("green".into())));
            assert_eq!(rows[1].get("label"), Some(&Value::Text("red".into())));
            assert_eq!(rows[2].get("label"), Some(&Value::Text("blue".into())));
        });
    }

    #[test]
    fn inverse_back_population_needs_no_extra_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(
            Arc::clone(&state),
            vec![(
                "items",
                vec![
                    row(&[("id", Value::Int(10)), ("order_id", Value::Int(1))]),
                    row(&[("id", Value::Int(11)), ("order_id", Value::Int(2))]),
                ],
            )],
        );

        let mut orders = vec![
            record(&[("id", Value::Int(1)), ("ref", Value::Text("A".into()))]),
            record(&[("id", Value::Int(2)), ("ref", Value::Text("B".into()))]),
        ];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let spec = RelationSpec::many("items", items_table())
                .link("order_id", "id")
                .inverse_of("order", false);
            let models = unwrap_outcome(loader.resolve(&cx, &spec, &mut orders).await);
            assert_eq!(state.lock().unwrap().query_calls, 1);

            // Returned models carry their owning order.
            let Related::One(Some(owner)) = models[0].related("order").unwrap() else {
                std::panic::panic_any("expected the inverse to be populated");
            };
            assert_eq!(owner.get("ref"), Some(&Value::Text("A".into())));

            // The copies cached on the primaries carry it too.
            let Related::Many(items) = orders[1].related("items").unwrap() else {
                std::panic::panic_any("expected a list");
            };
            let Related::One(Some(owner)) = items[0].related("order").unwrap() else {
                std::panic::panic_any("expected the inverse to be populated");
            };
            assert_eq!(owner.get("ref"), Some(&Value::Text("B".into())));
        });
    }

    #[test]
    fn unknown_relation_name_is_a_spec_error() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state), vec![]);
        let table = TableSpec::new("orders").primary_key(["id"]);
        let mut records = vec![record(&[("id", Value::Int(1))])];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let out = loader
                .resolve_relations(&cx, &table, &["ghost"], &mut records)
                .await;
            assert!(matches!(out, Outcome::Err(Error::Spec(_))));
        });
    }

    #[test]
    fn empty_link_map_is_rejected() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state), vec![]);
        let mut records = vec![record(&[("id", Value::Int(1))])];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let spec = RelationSpec::many("items", items_table());
            let out = loader.resolve(&cx, &spec, &mut records).await;
            assert!(matches!(out, Outcome::Err(Error::Spec(_))));
            assert_eq!(state.lock().unwrap().query_calls, 0);
        });
    }

    #[test]
    fn index_by_merge_replaces_instead_of_renumbering() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(
            Arc::clone(&state),
            vec![(
                "items",
                vec![
                    row(&[
                        ("id", Value::Int(10)),
                        ("order_id", Value::Int(1)),
                        ("sku", Value::Text("x".into())),
                    ]),
                    row(&[
                        ("id", Value::Int(11)),
                        ("order_id", Value::Int(1)),
                        ("sku", Value::Text("x".into())),
                    ]),
                    row(&[
                        ("id", Value::Int(12)),
                        ("order_id", Value::Int(1)),
                        ("sku", Value::Text("y".into())),
                    ]),
                ],
            )],
        );

        let mut orders = vec![
            record(&[("id", Value::Int(1))]),
            record(&[("id", Value::Int(2))]),
        ];

        rt.block_on(async {
            let loader = EagerLoader::new(&conn);
            let spec = RelationSpec::many("items", items_table())
                .link("order_id", "id")
                .index_by("sku");
            unwrap_outcome(loader.resolve(&cx, &spec, &mut orders).await);

            let Related::Many(rows) = orders[0].related("items").unwrap() else {
                std::panic::panic_any("expected a list");
            };
            // Two distinct skus; the duplicate "x" replaced in place.
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].get("id"), Some(&Value::Int(11)));
            assert_eq!(rows[1].get("id"), Some(&Value::Int(12)));
        });
    }
}
