//! SQL rendering from a finalized plan.
//!
//! Produces Snowflake-flavored SQL: predicate-filtered aggregations use
//! `COUNT_IF` and `IFF`, identifiers in join keys are double-quoted, and
//! every statement ends with `LIMIT 1001` so the transport can detect
//! truncation.

use serde_json::Value;
use tracing::debug;

use crate::planner::join::{compute_join_path, JoinPath};
use crate::planner::plan::{FinalizedPlan, PlanError};
use crate::semantic::{
    expand_expr, qualify_simple_column, quote_ident, AggregationType, Cardinality, Entity,
    ExpandContext, MacroError, Metric, Registry, StructuredFilter,
};

/// Row cap on every generated statement. The transport treats a result of
/// this size as truncated.
pub const ROW_LIMIT: usize = 1001;

/// Errors raised while rendering a plan. Fatal for the request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Macro(#[from] MacroError),

    #[error("metric '{0}' not found in any selected entity")]
    MetricNotFound(String),

    #[error("entity '{0}' has no time dimension to anchor the time range")]
    NoTimeDimension(String),

    #[error("entity '{0}' is not loaded")]
    EntityNotLoaded(String),

    #[error("measure '{0}' requires an sql expression")]
    MissingMeasureSql(String),

    #[error("plan selects no dimensions and no metrics")]
    EmptySelection,
}

/// A rendered statement plus the join context it was built in.
///
/// The join path is kept for downstream repair: column qualification
/// needs the alias map.
#[derive(Debug, Clone)]
pub struct RenderedSql {
    pub sql: String,
    pub join_path: JoinPath,
    pub select_labels: Vec<String>,
    pub dimension_count: usize,
}

/// Render a finalized plan into SQL against a loaded registry.
///
/// The registry must hold every entity in `selected_entities` and every
/// join-graph endpoint. Output is deterministic for identical inputs.
pub fn render(plan: &FinalizedPlan, registry: &Registry) -> Result<RenderedSql, RenderError> {
    plan.check()?;

    for name in plan.referenced_entities() {
        if !registry.contains(&name) {
            return Err(RenderError::EntityNotLoaded(name));
        }
    }

    let base_name = plan.base_entity()?;
    let path = compute_join_path(base_name, &plan.selected_entities, registry)?;
    let ctx = ExpandContext {
        registry,
        aliases: &path.alias_by_entity,
    };
    let base = registry
        .get(base_name)
        .ok_or_else(|| RenderError::EntityNotLoaded(base_name.to_string()))?;

    if plan.intent.dimensions.is_empty() && plan.intent.metrics.is_empty() {
        return Err(RenderError::EmptySelection);
    }

    // SELECT list: dimensions first, then metric aggregations.
    let mut select_items = Vec::new();
    let mut select_labels = Vec::new();
    for dim in &plan.intent.dimensions {
        let label = dim.rsplit('.').next().unwrap_or(dim.as_str());
        let expr = expand_expr(ctx, base, &format!("{{{dim}}}"))?;
        select_items.push(format!("{expr} AS {}", quote_ident(label)));
        select_labels.push(label.to_string());
    }
    for name in &plan.intent.metrics {
        let (host, metric) = resolve_metric(name, &path, registry)?;
        let agg = build_aggregate(ctx, host, &metric)?;
        select_items.push(format!("{agg} AS {}", quote_ident(name)));
        select_labels.push(name.clone());
    }

    // WHERE: time range first, then structured predicates.
    let mut where_parts = Vec::new();
    if let Some(range) = &plan.intent.time_range {
        let anchor = base
            .first_time_dimension()
            .ok_or_else(|| RenderError::NoTimeDimension(base.name.clone()))?;
        let time_expr = expand_expr(ctx, base, &anchor.sql)?;
        where_parts.push(format!(
            "{time_expr} >= {} AND {time_expr} < {}",
            quote_literal(&range.start),
            quote_literal(&range.end)
        ));
    }
    for filter in &plan.intent.structured_filters {
        where_parts.push(lower_predicate(ctx, base, filter)?);
    }

    let mut sql = String::new();

    // Free-text filters stay advisory: comment lines, never predicates.
    for note in &plan.intent.filters {
        let flat = note.replace(['\r', '\n'], " ");
        sql.push_str("-- note: ");
        sql.push_str(&flat);
        sql.push('\n');
    }

    sql.push_str("SELECT\n  ");
    sql.push_str(&select_items.join(",\n  "));
    sql.push('\n');
    sql.push_str(&format!("FROM {} t0\n", base.table));

    for edge in &path.edges {
        let from_entity = registry
            .get(&edge.from)
            .ok_or_else(|| RenderError::EntityNotLoaded(edge.from.clone()))?;
        let to_entity = registry
            .get(&edge.to)
            .ok_or_else(|| RenderError::EntityNotLoaded(edge.to.clone()))?;
        let join_kind = match edge.relationship {
            Cardinality::ManyToMany => "INNER JOIN",
            _ => "LEFT JOIN",
        };
        let to_alias = path
            .alias(&edge.to)
            .ok_or_else(|| RenderError::EntityNotLoaded(edge.to.clone()))?;
        sql.push_str(&format!(
            "{join_kind} {} {} ON {} = {}\n",
            to_entity.table,
            to_alias,
            qualify_simple_column(ctx, from_entity, &edge.from_field)?,
            qualify_simple_column(ctx, to_entity, &edge.to_field)?,
        ));
    }

    if !where_parts.is_empty() {
        sql.push_str("WHERE ");
        sql.push_str(&where_parts.join("\n  AND "));
        sql.push('\n');
    }

    let dimension_count = plan.intent.dimensions.len();
    if dimension_count > 0 {
        let ordinals: Vec<String> = (1..=dimension_count).map(|i| i.to_string()).collect();
        sql.push_str(&format!("GROUP BY {}\n", ordinals.join(", ")));
    }

    sql.push_str(&format!("LIMIT {ROW_LIMIT}"));

    debug!(base = base_name, entities = path.ordered_entities.len(), "plan rendered");

    Ok(RenderedSql {
        sql,
        join_path: path,
        select_labels,
        dimension_count,
    })
}

/// Find the metric a name refers to: metrics (by name or alias) across
/// the joined entities first, then bare measures, which are wrapped into
/// a synthetic atomic metric anchored on the host's first time dimension.
fn resolve_metric<'a>(
    name: &str,
    path: &JoinPath,
    registry: &'a Registry,
) -> Result<(&'a Entity, Metric), RenderError> {
    for entity_name in &path.ordered_entities {
        let Some(entity) = registry.get(entity_name) else {
            continue;
        };
        if let Some(metric) = entity.metric(name) {
            return Ok((entity.as_ref(), metric.clone()));
        }
    }
    for entity_name in &path.ordered_entities {
        let Some(entity) = registry.get(entity_name) else {
            continue;
        };
        if let Some(measure) = entity.measure(name) {
            let synthesized = Metric {
                name: name.to_string(),
                kind: Default::default(),
                measure: measure.name.clone(),
                anchor_date: entity.first_time_dimension().map(|d| d.name.clone()),
                filters: Vec::new(),
                aliases: Vec::new(),
                description: None,
            };
            return Ok((entity.as_ref(), synthesized));
        }
    }
    Err(RenderError::MetricNotFound(name.to_string()))
}

/// Build the aggregation expression for a metric on its host entity.
fn build_aggregate(
    ctx: ExpandContext<'_>,
    host: &Entity,
    metric: &Metric,
) -> Result<String, RenderError> {
    let measure = host
        .measure(&metric.measure)
        .ok_or_else(|| RenderError::MetricNotFound(metric.measure.clone()))?;

    let input = match &measure.sql {
        Some(sql) => Some(expand_expr(ctx, host, sql)?),
        None => None,
    };

    let mut predicates = Vec::new();
    for filter in &metric.filters {
        predicates.push(lower_predicate(ctx, host, filter)?);
    }
    let predicate = match predicates.len() {
        0 => None,
        1 => Some(predicates.remove(0)),
        _ => Some(
            predicates
                .iter()
                .map(|p| format!("({p})"))
                .collect::<Vec<_>>()
                .join(" AND "),
        ),
    };

    let expr = match measure.agg {
        AggregationType::Count => match predicate {
            None => "COUNT(*)".to_string(),
            Some(pred) => format!("COUNT_IF({pred})"),
        },
        AggregationType::CountDistinct => {
            let input =
                input.ok_or_else(|| RenderError::MissingMeasureSql(measure.name.clone()))?;
            match predicate {
                None => format!("COUNT(DISTINCT {input})"),
                Some(pred) => format!("COUNT(DISTINCT IFF({pred}, {input}, NULL))"),
            }
        }
        AggregationType::Sum | AggregationType::Avg | AggregationType::Min | AggregationType::Max => {
            let input =
                input.ok_or_else(|| RenderError::MissingMeasureSql(measure.name.clone()))?;
            let op = measure.agg.sql_function();
            match predicate {
                None => format!("{op}({input})"),
                Some(pred) => format!("{op}(IFF({pred}, {input}, NULL))"),
            }
        }
    };

    Ok(expr)
}

/// Lower one structured filter into a predicate in `entity`'s context.
///
/// Dotted fields resolve against the named entity; bare fields against
/// the context entity.
pub(crate) fn lower_predicate(
    ctx: ExpandContext<'_>,
    entity: &Entity,
    filter: &StructuredFilter,
) -> Result<String, RenderError> {
    filter
        .check_arity()
        .map_err(|m| RenderError::Plan(PlanError::Invalid(m)))?;

    let expr = expand_expr(ctx, entity, &format!("{{{}}}", filter.field))?;

    if filter.operator.is_list() {
        let values: Vec<String> = filter.values.iter().map(render_literal).collect();
        Ok(format!(
            "{expr} {} ({})",
            filter.operator.sql(),
            values.join(", ")
        ))
    } else {
        Ok(format!(
            "{expr} {} {}",
            filter.operator.sql(),
            render_literal(&filter.values[0])
        ))
    }
}

/// Render a JSON scalar as a SQL literal: numbers verbatim, booleans
/// `TRUE`/`FALSE`, strings single-quoted with embedded quotes doubled.
fn render_literal(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan::{QueryIntent, TimeRange};
    use crate::semantic::entity::fixtures;
    use crate::semantic::{Dimension, FilterOp, Measure, MetricKind};
    use std::sync::Arc;

    fn plan_for(entities: &[&str], intent: QueryIntent) -> FinalizedPlan {
        FinalizedPlan {
            intent,
            selected_entities: entities.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn opportunities() -> crate::semantic::Entity {
        let mut entity = crate::semantic::Entity::new(
            "opportunities",
            "dwh_prod.analytics.opportunities",
            "one row per opportunity",
        )
        .with_dimension(fixtures::dim("OPPORTUNITY_TYPE"))
        .with_dimension(fixtures::dim("NEW_BUSINESS_ANNUAL_RECURRING_REVENUE"))
        .with_time_dimension(fixtures::time_dim("CLOSE_DATE"))
        .with_measure(Measure {
            name: "new_arr_sum".to_string(),
            agg: AggregationType::Sum,
            sql: Some("{CUBE}.NEW_BUSINESS_ANNUAL_RECURRING_REVENUE".to_string()),
            description: None,
        })
        .with_metric(Metric {
            name: "NEW_ARR".to_string(),
            kind: MetricKind::Atomic,
            measure: "new_arr_sum".to_string(),
            anchor_date: Some("CLOSE_DATE".to_string()),
            filters: Vec::new(),
            aliases: Vec::new(),
            description: None,
        });
        entity.finish().unwrap();
        entity
    }

    #[test]
    fn test_count_grouped_by_tier() {
        let registry = fixtures::registry();
        let plan = plan_for(
            &["accounts"],
            QueryIntent {
                metrics: vec!["count".to_string()],
                dimensions: vec!["ACCOUNT_TIER".to_string()],
                ..Default::default()
            },
        );

        let rendered = render(&plan, &registry).unwrap();
        let sql = &rendered.sql;

        assert!(sql.contains("t0.ACCOUNT_TIER AS \"ACCOUNT_TIER\""));
        assert!(sql.contains("COUNT(*) AS \"count\""));
        assert!(sql.contains("FROM dwh_prod.analytics.accounts t0"));
        assert!(sql.contains("GROUP BY 1"));
        assert!(sql.ends_with("LIMIT 1001"));
        assert_eq!(sql.matches("LIMIT 1001").count(), 1);
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn test_sum_with_filter_and_time_range() {
        let mut registry = Registry::new();
        registry.insert(Arc::new(opportunities()));

        let plan = plan_for(
            &["opportunities"],
            QueryIntent {
                metrics: vec!["NEW_ARR".to_string()],
                structured_filters: vec![StructuredFilter {
                    field: "OPPORTUNITY_TYPE".to_string(),
                    operator: FilterOp::In,
                    values: vec![
                        serde_json::json!("Net New Business"),
                        serde_json::json!("Upgrade from Pro/Legacy"),
                    ],
                }],
                time_range: Some(TimeRange {
                    start: "2025-03-26".to_string(),
                    end: "2025-09-26".to_string(),
                    grain: None,
                }),
                ..Default::default()
            },
        );

        let rendered = render(&plan, &registry).unwrap();
        let sql = &rendered.sql;

        assert!(sql.contains(
            "SUM(t0.NEW_BUSINESS_ANNUAL_RECURRING_REVENUE) AS \"NEW_ARR\""
        ));
        assert!(sql.contains("t0.CLOSE_DATE >= '2025-03-26' AND t0.CLOSE_DATE < '2025-09-26'"));
        assert!(sql
            .contains("t0.OPPORTUNITY_TYPE IN ('Net New Business', 'Upgrade from Pro/Legacy')"));
        assert!(!sql.contains("GROUP BY"));
        assert!(sql.ends_with("LIMIT 1001"));
    }

    #[test]
    fn test_join_rendering() {
        let registry = fixtures::registry();
        let plan = plan_for(
            &["accounts", "companies"],
            QueryIntent {
                metrics: vec!["count".to_string()],
                dimensions: vec!["companies.SEGMENT".to_string()],
                ..Default::default()
            },
        );

        let rendered = render(&plan, &registry).unwrap();
        let sql = &rendered.sql;

        assert!(sql.contains(
            "LEFT JOIN dwh_prod.crm.companies t1 ON t0.\"COMPANY_ID\" = t1.\"ID\""
        ));
        assert!(sql.contains("t1.SEGMENT AS \"SEGMENT\""));
        assert_eq!(rendered.join_path.alias("companies"), Some("t1"));
    }

    #[test]
    fn test_metric_with_predicates_uses_count_if() {
        let registry = fixtures::registry();
        let plan = plan_for(
            &["accounts"],
            QueryIntent {
                metrics: vec!["paid_accounts".to_string()],
                ..Default::default()
            },
        );

        let rendered = render(&plan, &registry).unwrap();
        // paid_accounts is a count_distinct with one predicate filter.
        assert!(rendered.sql.contains(
            "COUNT(DISTINCT IFF(t0.ACCOUNT_TIER != 'free', t0.ID, NULL)) AS \"paid_accounts\""
        ));
    }

    #[test]
    fn test_metric_not_found() {
        let registry = fixtures::registry();
        let plan = plan_for(
            &["accounts"],
            QueryIntent {
                metrics: vec!["no_such_metric".to_string()],
                ..Default::default()
            },
        );
        let err = render(&plan, &registry).unwrap_err();
        assert_eq!(err, RenderError::MetricNotFound("no_such_metric".to_string()));
    }

    #[test]
    fn test_measure_promoted_to_metric() {
        let registry = fixtures::registry();
        // paid_count is a measure, not a metric; it still renders.
        let plan = plan_for(
            &["accounts"],
            QueryIntent {
                metrics: vec!["paid_count".to_string()],
                ..Default::default()
            },
        );
        let rendered = render(&plan, &registry).unwrap();
        assert!(rendered.sql.contains("COUNT(DISTINCT t0.ID) AS \"paid_count\""));
    }

    #[test]
    fn test_advisory_filters_are_comments() {
        let registry = fixtures::registry();
        let plan = plan_for(
            &["accounts"],
            QueryIntent {
                metrics: vec!["count".to_string()],
                filters: vec!["only active accounts".to_string()],
                ..Default::default()
            },
        );
        let rendered = render(&plan, &registry).unwrap();
        assert!(rendered.sql.starts_with("-- note: only active accounts\n"));
        assert!(!rendered.sql.contains("active accounts'"));
    }

    #[test]
    fn test_group_by_ordinals_match_dimension_count() {
        let registry = fixtures::registry();
        let plan = plan_for(
            &["accounts"],
            QueryIntent {
                metrics: vec!["count".to_string()],
                dimensions: vec!["ACCOUNT_TIER".to_string(), "COMPANY_ID".to_string()],
                ..Default::default()
            },
        );
        let rendered = render(&plan, &registry).unwrap();
        assert!(rendered.sql.contains("GROUP BY 1, 2"));
        assert_eq!(rendered.dimension_count, 2);
    }

    #[test]
    fn test_string_literal_escaping() {
        let mut registry = Registry::new();
        registry.insert(Arc::new(opportunities()));

        let plan = plan_for(
            &["opportunities"],
            QueryIntent {
                metrics: vec!["NEW_ARR".to_string()],
                structured_filters: vec![StructuredFilter {
                    field: "OPPORTUNITY_TYPE".to_string(),
                    operator: FilterOp::Eq,
                    values: vec![serde_json::json!("O'Brien")],
                }],
                ..Default::default()
            },
        );
        let rendered = render(&plan, &registry).unwrap();
        assert!(rendered.sql.contains("= 'O''Brien'"));
    }

    #[test]
    fn test_empty_selection_rejected() {
        let registry = fixtures::registry();
        let plan = plan_for(&["accounts"], QueryIntent::default());
        assert_eq!(render(&plan, &registry).unwrap_err(), RenderError::EmptySelection);
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let registry = fixtures::registry();
        let plan = plan_for(
            &["accounts", "companies"],
            QueryIntent {
                metrics: vec!["count".to_string()],
                dimensions: vec!["companies.NAME".to_string(), "ACCOUNT_TIER".to_string()],
                ..Default::default()
            },
        );
        let first = render(&plan, &registry).unwrap();
        for _ in 0..5 {
            assert_eq!(render(&plan, &registry).unwrap().sql, first.sql);
        }
    }

    #[test]
    fn test_dimension_alias_expansion() {
        let registry = fixtures::registry();
        let plan = plan_for(
            &["accounts"],
            QueryIntent {
                metrics: vec!["count".to_string()],
                dimensions: vec!["tier".to_string()],
                ..Default::default()
            },
        );
        let rendered = render(&plan, &registry).unwrap();
        // Alias expands to the canonical column but keeps the requested label.
        assert!(rendered.sql.contains("t0.ACCOUNT_TIER AS \"tier\""));
    }
}
