//! Query planning — a pure `Query → Plan` transformation.
//!
//! The plan is a linear pipeline in canonical order: one fetch, one join
//! per declared join, then filter, group, having, select, distinct,
//! order-by, and limit as the query requires. No validation happens
//! here; semantic errors surface at execution.

use serde::Serialize;

use avaast_core::query::{Join, OrderKey, Query, SelectField, Source};
use avaast_core::Expression;

/// One step of the execution pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum PipelineStep {
    Fetch { source: Source },
    Join { join: Join },
    Filter { expr: Expression },
    Group { by: Vec<Expression> },
    Having { expr: Expression },
    Select { fields: Vec<SelectField> },
    Distinct,
    OrderBy { keys: Vec<OrderKey> },
    Limit {
        limit: Option<usize>,
        offset: Option<usize>,
    },
}

/// A planned query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub sources: Vec<Source>,
    pub pipeline: Vec<PipelineStep>,
}

/// Plan a query. Pure: equal inputs produce equal plans.
pub fn plan(query: &Query) -> Plan {
    let mut sources = vec![query.from.clone()];
    let mut pipeline = vec![PipelineStep::Fetch {
        source: query.from.clone(),
    }];

    for join in &query.joins {
        sources.push(join.source.clone());
        pipeline.push(PipelineStep::Join { join: join.clone() });
    }

    if let Some(filter) = &query.where_clause {
        pipeline.push(PipelineStep::Filter {
            expr: filter.clone(),
        });
    }

    if !query.group_by.is_empty() {
        pipeline.push(PipelineStep::Group {
            by: query.group_by.clone(),
        });
    }

    if let Some(having) = &query.having {
        pipeline.push(PipelineStep::Having {
            expr: having.clone(),
        });
    }

    pipeline.push(PipelineStep::Select {
        fields: query.select.clone(),
    });

    if query.distinct {
        pipeline.push(PipelineStep::Distinct);
    }

    if !query.order_by.is_empty() {
        pipeline.push(PipelineStep::OrderBy {
            keys: query.order_by.clone(),
        });
    }

    if query.limit.is_some() || query.offset.is_some() {
        pipeline.push(PipelineStep::Limit {
            limit: query.limit,
            offset: query.offset,
        });
    }

    Plan { sources, pipeline }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avaast_core::query::{JoinKind, OrderDirection};
    use avaast_core::Expression;

    fn source(alias: &str, collection: &str) -> Source {
        Source {
            alias: alias.to_string(),
            collection: collection.to_string(),
            authority_id: None,
        }
    }

    fn minimal_query() -> Query {
        let mut q = Query::from_source(source("a", "chat.pirate.avast"));
        q.select.push(SelectField {
            alias: "uri".to_string(),
            expr: Expression::field("a", "_uri"),
        });
        q
    }

    #[test]
    fn minimal_plan_is_fetch_then_select() {
        let plan = plan(&minimal_query());
        assert_eq!(plan.pipeline.len(), 2);
        assert!(matches!(plan.pipeline[0], PipelineStep::Fetch { .. }));
        assert!(matches!(plan.pipeline[1], PipelineStep::Select { .. }));
        assert_eq!(plan.sources.len(), 1);
    }

    #[test]
    fn full_query_plans_in_canonical_order() {
        let mut q = minimal_query();
        q.joins.push(Join {
            kind: JoinKind::Left,
            source: source("b", "chat.pirate.aye"),
            on: Some(Expression::boolean(true)),
        });
        q.where_clause = Some(Expression::boolean(true));
        q.group_by.push(Expression::field("a", "_uri"));
        q.having = Some(Expression::boolean(true));
        q.order_by.push(OrderKey {
            expr: Expression::field("a", "createdAt"),
            direction: Some(OrderDirection::Desc),
            nulls: None,
        });
        q.limit = Some(10);
        q.offset = Some(5);
        q.distinct = true;

        let plan = plan(&q);
        let kinds: Vec<&str> = plan
            .pipeline
            .iter()
            .map(|s| match s {
                PipelineStep::Fetch { .. } => "fetch",
                PipelineStep::Join { .. } => "join",
                PipelineStep::Filter { .. } => "filter",
                PipelineStep::Group { .. } => "group",
                PipelineStep::Having { .. } => "having",
                PipelineStep::Select { .. } => "select",
                PipelineStep::Distinct => "distinct",
                PipelineStep::OrderBy { .. } => "orderBy",
                PipelineStep::Limit { .. } => "limit",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "fetch", "join", "filter", "group", "having", "select", "distinct", "orderBy",
                "limit"
            ]
        );
        assert_eq!(plan.sources.len(), 2);
    }

    #[test]
    fn planning_is_pure() {
        let q = minimal_query();
        assert_eq!(plan(&q), plan(&q));
    }

    #[test]
    fn offset_alone_still_plans_a_limit_step() {
        let mut q = minimal_query();
        q.offset = Some(3);
        let plan = plan(&q);
        assert!(matches!(
            plan.pipeline.last(),
            Some(PipelineStep::Limit {
                limit: None,
                offset: Some(3)
            })
        ));
    }
}
