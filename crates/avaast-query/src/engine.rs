//! Plan execution — the query engine.
//!
//! Rows flow through the pipeline as `WorkRow`s (a row plus, after
//! grouping, the bag of group members). Selection projects rows and
//! captures order-by keys at the same time, so sorting still sees
//! source fields after projection has dropped them.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use avaast_core::query::{Join, JoinKind, NullsOrder, OrderDirection, OrderKey, Query, Source};
use avaast_core::Expression;

use crate::error::{QueryError, QueryResult};
use crate::eval::{evaluate, EvalContext};
use crate::planner::{self, Plan, PipelineStep};
use crate::source::DataSource;
use crate::value::{canonical, canonical_row, compare_values, is_truthy, Row};

/// A row in flight, carrying its group bag after a `group` step.
#[derive(Debug, Clone)]
struct WorkRow {
    values: Row,
    bag: Option<Vec<Row>>,
}

impl WorkRow {
    fn plain(values: Row) -> Self {
        Self { values, bag: None }
    }
}

/// A projected output row with its captured sort keys.
#[derive(Debug, Clone)]
struct Projected {
    row: Row,
    sort_keys: Vec<Value>,
}

/// Executes plans against a data source.
pub struct QueryEngine {
    source: Arc<dyn DataSource>,
    authority_id: String,
}

impl QueryEngine {
    pub fn new(source: Arc<dyn DataSource>, authority_id: impl Into<String>) -> Self {
        Self {
            source,
            authority_id: authority_id.into(),
        }
    }

    /// Plan and execute a query.
    pub async fn execute(
        &self,
        query: &Query,
        params: &HashMap<String, String>,
    ) -> QueryResult<Vec<Row>> {
        let plan = planner::plan(query);
        self.execute_plan(&plan, params).await
    }

    /// Execute a prepared plan.
    pub async fn execute_plan(
        &self,
        plan: &Plan,
        params: &HashMap<String, String>,
    ) -> QueryResult<Vec<Row>> {
        // Order-by keys are evaluated during selection, before the
        // projection drops source fields.
        let order_keys: Vec<OrderKey> = plan
            .pipeline
            .iter()
            .find_map(|step| match step {
                PipelineStep::OrderBy { keys } => Some(keys.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let mut work: Vec<WorkRow> = Vec::new();
        let mut projected: Vec<Projected> = Vec::new();

        for step in &plan.pipeline {
            match step {
                PipelineStep::Fetch { source } => {
                    work = self
                        .fetch_rows(source)
                        .await?
                        .into_iter()
                        .map(WorkRow::plain)
                        .collect();
                }

                PipelineStep::Join { join } => {
                    let right = self.fetch_rows(&join.source).await?;
                    work = join_rows(work, right, join, params)?;
                }

                PipelineStep::Filter { expr } => {
                    work = filter_rows(work, expr, params)?;
                }

                PipelineStep::Group { by } => {
                    work = group_rows(work, by, params)?;
                }

                PipelineStep::Having { expr } => {
                    work = filter_rows(work, expr, params)?;
                }

                PipelineStep::Select { fields } => {
                    projected = Vec::with_capacity(work.len());
                    for wr in &work {
                        let ctx =
                            EvalContext::new(&wr.values, params).with_bag(wr.bag.as_deref());
                        let mut row = Row::new();
                        for field in fields {
                            row.insert(field.alias.clone(), evaluate(&field.expr, &ctx)?);
                        }
                        let mut sort_keys = Vec::with_capacity(order_keys.len());
                        for key in &order_keys {
                            sort_keys.push(evaluate(&key.expr, &ctx)?);
                        }
                        projected.push(Projected { row, sort_keys });
                    }
                }

                PipelineStep::Distinct => {
                    let mut seen = std::collections::HashSet::new();
                    projected.retain(|p| seen.insert(canonical_row(&p.row)));
                }

                PipelineStep::OrderBy { keys } => {
                    // Vec::sort_by is stable; ties preserve input order.
                    projected.sort_by(|a, b| compare_sort_keys(&a.sort_keys, &b.sort_keys, keys));
                }

                PipelineStep::Limit { limit, offset } => {
                    let start = offset.unwrap_or(0).min(projected.len());
                    let end = match limit {
                        Some(l) => (start + l).min(projected.len()),
                        None => projected.len(),
                    };
                    projected = projected[start..end].to_vec();
                }
            }
        }

        debug!(rows = projected.len(), "plan executed");
        Ok(projected.into_iter().map(|p| p.row).collect())
    }

    /// Fetch and alias-prefix the rows of one source.
    async fn fetch_rows(&self, source: &Source) -> QueryResult<Vec<Row>> {
        let rows = self.source.fetch(source, &self.authority_id).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(k, v)| (format!("{}.{}", source.alias, k), v))
                    .collect()
            })
            .collect())
    }
}

fn filter_rows(
    work: Vec<WorkRow>,
    expr: &Expression,
    params: &HashMap<String, String>,
) -> QueryResult<Vec<WorkRow>> {
    let mut kept = Vec::with_capacity(work.len());
    for wr in work {
        let ctx = EvalContext::new(&wr.values, params).with_bag(wr.bag.as_deref());
        if is_truthy(&evaluate(expr, &ctx)?) {
            kept.push(wr);
        }
    }
    Ok(kept)
}

/// Nested-loop join: iterate the left input, scanning the right input
/// fully for each row. Joins run in declaration order.
fn join_rows(
    left: Vec<WorkRow>,
    right: Vec<Row>,
    join: &Join,
    params: &HashMap<String, String>,
) -> QueryResult<Vec<WorkRow>> {
    if join.kind == JoinKind::Cross {
        let mut out = Vec::with_capacity(left.len() * right.len());
        for l in &left {
            for r in &right {
                out.push(WorkRow::plain(merge(&l.values, r)));
            }
        }
        return Ok(out);
    }

    let on = join.on.as_ref().ok_or_else(|| {
        QueryError::Eval(format!("{:?} join requires an `on` predicate", join.kind))
    })?;

    let mut out = Vec::new();
    let mut right_matched = vec![false; right.len()];

    for l in &left {
        let mut matched = false;
        for (idx, r) in right.iter().enumerate() {
            let merged = merge(&l.values, r);
            let ctx = EvalContext::new(&merged, params);
            if is_truthy(&evaluate(on, &ctx)?) {
                matched = true;
                right_matched[idx] = true;
                out.push(WorkRow::plain(merged));
            }
        }
        if !matched && join.kind == JoinKind::Left {
            out.push(WorkRow::plain(l.values.clone()));
        }
    }

    if join.kind == JoinKind::Right {
        for (idx, r) in right.iter().enumerate() {
            if !right_matched[idx] {
                out.push(WorkRow::plain(r.clone()));
            }
        }
    }

    Ok(out)
}

fn merge(left: &Row, right: &Row) -> Row {
    let mut merged = left.clone();
    for (k, v) in right {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Group rows by the canonical serialization of their key tuple. The
/// first row of each group is the representative; all members ride in
/// the bag for downstream aggregates.
fn group_rows(
    work: Vec<WorkRow>,
    by: &[Expression],
    params: &HashMap<String, String>,
) -> QueryResult<Vec<WorkRow>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Row, Vec<Row>)> = HashMap::new();

    for wr in work {
        let ctx = EvalContext::new(&wr.values, params);
        let mut key_values = Vec::with_capacity(by.len());
        for expr in by {
            key_values.push(evaluate(expr, &ctx)?);
        }
        let key = canonical(&Value::Array(key_values));
        match groups.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().1.push(wr.values);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                order.push(entry.key().clone());
                entry.insert((wr.values.clone(), vec![wr.values]));
            }
        }
    }

    Ok(order
        .into_iter()
        .map(|key| {
            let (representative, members) = groups.remove(&key).expect("group vanished");
            WorkRow {
                values: representative,
                bag: Some(members),
            }
        })
        .collect())
}

/// Multi-key comparison: nulls place last unless `nulls: "first"`;
/// direction flips value order; ties fall through to the next key.
fn compare_sort_keys(a: &[Value], b: &[Value], keys: &[OrderKey]) -> Ordering {
    for (i, key) in keys.iter().enumerate() {
        let (av, bv) = (&a[i], &b[i]);
        let nulls_first = key.nulls == Some(NullsOrder::First);
        let descending = key.direction == Some(OrderDirection::Desc);

        let ord = match (av.is_null(), bv.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if nulls_first {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, true) => {
                if nulls_first {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, false) => {
                let ord = compare_values(av, bv).unwrap_or(Ordering::Equal);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticDataSource;
    use avaast_core::expr::ComparisonOp;
    use avaast_core::query::SelectField;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn engine_with(collections: &[(&str, Vec<Row>)]) -> QueryEngine {
        let source = StaticDataSource::new();
        for (name, rows) in collections {
            source.insert(name, rows.clone());
        }
        QueryEngine::new(Arc::new(source), "did:plc:alice")
    }

    fn src(alias: &str, collection: &str) -> Source {
        Source {
            alias: alias.to_string(),
            collection: collection.to_string(),
            authority_id: None,
        }
    }

    fn select(alias: &str, expr: Expression) -> SelectField {
        SelectField {
            alias: alias.to_string(),
            expr,
        }
    }

    fn eq(left: Expression, right: Expression) -> Expression {
        Expression::Comparison {
            op: ComparisonOp::Eq,
            left: Box::new(left),
            right: Some(Box::new(right)),
        }
    }

    async fn run(engine: &QueryEngine, query: &Query) -> Vec<Row> {
        engine.execute(query, &HashMap::new()).await.unwrap()
    }

    #[tokio::test]
    async fn select_literal_against_empty_source_is_empty() {
        let engine = engine_with(&[("c", vec![])]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("v", Expression::integer(42)));
        assert!(run(&engine, &q).await.is_empty());
    }

    #[tokio::test]
    async fn select_literal_against_one_row_yields_the_literal() {
        let engine = engine_with(&[("c", vec![row(&[("x", json!(1))])])]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("v", Expression::integer(42)));
        let rows = run(&engine, &q).await;
        assert_eq!(rows, vec![row(&[("v", json!(42))])]);
    }

    #[tokio::test]
    async fn filter_never_grows_the_row_set() {
        let data: Vec<Row> = (0..10).map(|i| row(&[("n", json!(i))])).collect();
        let engine = engine_with(&[("c", data.clone())]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("n", Expression::field("a", "n")));
        q.where_clause = Some(Expression::Comparison {
            op: ComparisonOp::Gte,
            left: Box::new(Expression::field("a", "n")),
            right: Some(Box::new(Expression::integer(5))),
        });
        let rows = run(&engine, &q).await;
        assert!(rows.len() <= data.len());
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn synthetic_fields_survive_prefixing() {
        let engine = engine_with(&[(
            "c",
            vec![row(&[("_uri", json!("at://r1")), ("_cid", json!("bafy"))])],
        )]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("uri", Expression::field("a", "_uri")));
        q.select.push(select("cid", Expression::field("a", "_cid")));
        let rows = run(&engine, &q).await;
        assert_eq!(rows[0]["uri"], json!("at://r1"));
        assert_eq!(rows[0]["cid"], json!("bafy"));
    }

    #[tokio::test]
    async fn inner_join_matches_pairs() {
        let engine = engine_with(&[
            (
                "left",
                vec![
                    row(&[("id", json!(1))]),
                    row(&[("id", json!(2))]),
                ],
            ),
            (
                "right",
                vec![
                    row(&[("fk", json!(1)), ("tag", json!("one"))]),
                    row(&[("fk", json!(1)), ("tag", json!("uno"))]),
                    row(&[("fk", json!(3)), ("tag", json!("orphan"))]),
                ],
            ),
        ]);
        let mut q = Query::from_source(src("l", "left"));
        q.joins.push(Join {
            kind: JoinKind::Inner,
            source: src("r", "right"),
            on: Some(eq(Expression::field("l", "id"), Expression::field("r", "fk"))),
        });
        q.select.push(select("tag", Expression::field("r", "tag")));
        let rows = run(&engine, &q).await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn left_join_keeps_unmatched_left_rows() {
        let engine = engine_with(&[
            (
                "left",
                vec![row(&[("id", json!(1))]), row(&[("id", json!(2))])],
            ),
            ("right", vec![row(&[("fk", json!(1)), ("tag", json!("x"))])]),
        ]);
        let mut q = Query::from_source(src("l", "left"));
        q.joins.push(Join {
            kind: JoinKind::Left,
            source: src("r", "right"),
            on: Some(eq(Expression::field("l", "id"), Expression::field("r", "fk"))),
        });
        q.select.push(select("id", Expression::field("l", "id")));
        q.select.push(select("tag", Expression::field("r", "tag")));
        let rows = run(&engine, &q).await;
        assert_eq!(rows.len(), 2);
        let unmatched = rows.iter().find(|r| r["id"] == json!(2)).unwrap();
        assert_eq!(unmatched["tag"], Value::Null);
    }

    #[tokio::test]
    async fn right_join_emits_unmatched_right_rows() {
        let engine = engine_with(&[
            ("left", vec![row(&[("id", json!(1))])]),
            (
                "right",
                vec![
                    row(&[("fk", json!(1)), ("tag", json!("hit"))]),
                    row(&[("fk", json!(9)), ("tag", json!("alone"))]),
                ],
            ),
        ]);
        let mut q = Query::from_source(src("l", "left"));
        q.joins.push(Join {
            kind: JoinKind::Right,
            source: src("r", "right"),
            on: Some(eq(Expression::field("l", "id"), Expression::field("r", "fk"))),
        });
        q.select.push(select("tag", Expression::field("r", "tag")));
        q.select.push(select("id", Expression::field("l", "id")));
        let rows = run(&engine, &q).await;
        assert_eq!(rows.len(), 2);
        let alone = rows.iter().find(|r| r["tag"] == json!("alone")).unwrap();
        assert_eq!(alone["id"], Value::Null);
    }

    #[tokio::test]
    async fn cross_join_is_cartesian() {
        let engine = engine_with(&[
            ("left", vec![row(&[("a", json!(1))]), row(&[("a", json!(2))])]),
            (
                "right",
                vec![
                    row(&[("b", json!("x"))]),
                    row(&[("b", json!("y"))]),
                    row(&[("b", json!("z"))]),
                ],
            ),
        ]);
        let mut q = Query::from_source(src("l", "left"));
        q.joins.push(Join {
            kind: JoinKind::Cross,
            source: src("r", "right"),
            on: None,
        });
        q.select.push(select("a", Expression::field("l", "a")));
        q.select.push(select("b", Expression::field("r", "b")));
        let rows = run(&engine, &q).await;
        assert_eq!(rows.len(), 6);
    }

    #[tokio::test]
    async fn group_and_count_with_left_join() {
        // Three avasts; three ayes on the first, one on the second.
        let avasts: Vec<Row> = (1..=3)
            .map(|i| {
                row(&[
                    ("_uri", json!(format!("at://avast/{i}"))),
                    ("createdAt", json!(format!("2026-01-0{i}T00:00:00Z"))),
                ])
            })
            .collect();
        let ayes = vec![
            row(&[("subject", json!("at://avast/1")), ("_uri", json!("at://aye/1"))]),
            row(&[("subject", json!("at://avast/1")), ("_uri", json!("at://aye/2"))]),
            row(&[("subject", json!("at://avast/1")), ("_uri", json!("at://aye/3"))]),
            row(&[("subject", json!("at://avast/2")), ("_uri", json!("at://aye/4"))]),
        ];
        let engine = engine_with(&[("avast", avasts), ("aye", ayes)]);

        let mut q = Query::from_source(src("a", "avast"));
        q.joins.push(Join {
            kind: JoinKind::Left,
            source: src("aye", "aye"),
            on: Some(eq(
                Expression::field("a", "_uri"),
                Expression::field("aye", "subject"),
            )),
        });
        q.group_by.push(Expression::field("a", "_uri"));
        q.select.push(select("uri", Expression::field("a", "_uri")));
        q.select.push(select(
            "ayeCount",
            Expression::BuiltinCall {
                name: "count".to_string(),
                args: vec![Expression::field("aye", "_uri")],
            },
        ));
        q.order_by.push(OrderKey {
            expr: Expression::field("a", "createdAt"),
            direction: Some(OrderDirection::Desc),
            nulls: None,
        });

        let rows = run(&engine, &q).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["ayeCount"], json!(0));
        assert_eq!(rows[1]["ayeCount"], json!(1));
        assert_eq!(rows[2]["ayeCount"], json!(3));
    }

    #[tokio::test]
    async fn having_filters_groups() {
        let data = vec![
            row(&[("k", json!("a"))]),
            row(&[("k", json!("a"))]),
            row(&[("k", json!("b"))]),
        ];
        let engine = engine_with(&[("c", data)]);
        let mut q = Query::from_source(src("a", "c"));
        q.group_by.push(Expression::field("a", "k"));
        q.having = Some(Expression::Comparison {
            op: ComparisonOp::Gt,
            left: Box::new(Expression::BuiltinCall {
                name: "count".to_string(),
                args: vec![],
            }),
            right: Some(Box::new(Expression::integer(1))),
        });
        q.select.push(select("k", Expression::field("a", "k")));
        let rows = run(&engine, &q).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["k"], json!("a"));
    }

    #[tokio::test]
    async fn distinct_rows_are_pairwise_non_equal() {
        let data = vec![
            row(&[("k", json!("a"))]),
            row(&[("k", json!("a"))]),
            row(&[("k", json!("b"))]),
        ];
        let engine = engine_with(&[("c", data)]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("k", Expression::field("a", "k")));
        q.distinct = true;
        let rows = run(&engine, &q).await;
        assert_eq!(rows.len(), 2);
        let mut seen = std::collections::HashSet::new();
        assert!(rows.iter().all(|r| seen.insert(canonical_row(r))));
    }

    #[tokio::test]
    async fn order_by_is_deterministic_and_nulls_sort_last() {
        let data = vec![
            row(&[("n", json!(2))]),
            row(&[("x", json!("no n field"))]),
            row(&[("n", json!(1))]),
            row(&[("n", json!(3))]),
        ];
        let engine = engine_with(&[("c", data)]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("n", Expression::field("a", "n")));
        q.order_by.push(OrderKey {
            expr: Expression::field("a", "n"),
            direction: Some(OrderDirection::Asc),
            nulls: None,
        });

        let first = run(&engine, &q).await;
        let second = run(&engine, &q).await;
        assert_eq!(first, second);
        assert_eq!(first[0]["n"], json!(1));
        assert_eq!(first[1]["n"], json!(2));
        assert_eq!(first[2]["n"], json!(3));
        assert_eq!(first[3]["n"], Value::Null);
    }

    #[tokio::test]
    async fn order_by_strings_uses_collation_order() {
        let data = vec![
            row(&[("name", json!("Banana"))]),
            row(&[("name", json!("apple"))]),
            row(&[("name", json!("cherry"))]),
        ];
        let engine = engine_with(&[("c", data)]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("name", Expression::field("a", "name")));
        q.order_by.push(OrderKey {
            expr: Expression::field("a", "name"),
            direction: Some(OrderDirection::Asc),
            nulls: None,
        });
        let rows = run(&engine, &q).await;
        // Byte order would put "Banana" first; collation interleaves case.
        assert_eq!(rows[0]["name"], json!("apple"));
        assert_eq!(rows[1]["name"], json!("Banana"));
        assert_eq!(rows[2]["name"], json!("cherry"));
    }

    #[tokio::test]
    async fn nulls_first_overrides_default() {
        let data = vec![row(&[("n", json!(1))]), row(&[("x", json!(true))])];
        let engine = engine_with(&[("c", data)]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("n", Expression::field("a", "n")));
        q.order_by.push(OrderKey {
            expr: Expression::field("a", "n"),
            direction: Some(OrderDirection::Asc),
            nulls: Some(NullsOrder::First),
        });
        let rows = run(&engine, &q).await;
        assert_eq!(rows[0]["n"], Value::Null);
    }

    #[tokio::test]
    async fn limit_and_offset_window() {
        let data: Vec<Row> = (0..10).map(|i| row(&[("n", json!(i))])).collect();
        let engine = engine_with(&[("c", data)]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("n", Expression::field("a", "n")));
        q.order_by.push(OrderKey {
            expr: Expression::field("a", "n"),
            direction: Some(OrderDirection::Asc),
            nulls: None,
        });
        q.limit = Some(3);
        q.offset = Some(4);
        let rows = run(&engine, &q).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["n"], json!(4));
        assert_eq!(rows[2]["n"], json!(6));
    }

    #[tokio::test]
    async fn offset_past_end_is_empty() {
        let engine = engine_with(&[("c", vec![row(&[("n", json!(1))])])]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("n", Expression::field("a", "n")));
        q.offset = Some(100);
        assert!(run(&engine, &q).await.is_empty());
    }

    #[tokio::test]
    async fn params_flow_into_filters() {
        let data = vec![
            row(&[("tag", json!("keep"))]),
            row(&[("tag", json!("drop"))]),
        ];
        let engine = engine_with(&[("c", data)]);
        let mut q = Query::from_source(src("a", "c"));
        q.select.push(select("tag", Expression::field("a", "tag")));
        q.where_clause = Some(eq(
            Expression::field("a", "tag"),
            Expression::field("$params", "tag"),
        ));

        let mut params = HashMap::new();
        params.insert("tag".to_string(), "keep".to_string());
        let rows = engine.execute(&q, &params).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["tag"], json!("keep"));
    }

    #[tokio::test]
    async fn non_cross_join_without_predicate_errors() {
        let engine = engine_with(&[("l", vec![]), ("r", vec![])]);
        let mut q = Query::from_source(src("l", "l"));
        q.joins.push(Join {
            kind: JoinKind::Inner,
            source: src("r", "r"),
            on: None,
        });
        q.select.push(select("x", Expression::null()));
        let err = engine.execute(&q, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, QueryError::Eval(_)));
    }
}
