//! Planning-phase tools: catalog recall, descriptor inspection, entity
//! loading, and the three terminal tools.

use std::collections::VecDeque;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{error_value, parse_args};
use crate::agent::{AgentError, ToolContext};
use crate::planner::join::compute_join_path;
use crate::planner::plan::FinalizedPlan;
use crate::semantic::{expression_dependencies, Entity, SemanticError};

/// Results returned by `search_schema` before truncation.
const SCHEMA_SEARCH_CAP: usize = 20;

pub(super) fn list_entities(ctx: &ToolContext) -> Result<Value, AgentError> {
    let entities = ctx.store.list_entities()?;
    Ok(json!({"ok": true, "entities": entities}))
}

#[derive(Deserialize)]
struct SearchCatalogArgs {
    query: String,
}

pub(super) fn search_catalog(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: SearchCatalogArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    let catalog = ctx.store.load_catalog()?;
    let hits = catalog.search(&args.query, 5);
    Ok(json!({"ok": true, "hits": hits}))
}

#[derive(Deserialize)]
struct EntityArgs {
    entity: String,
}

pub(super) fn read_entity_descriptor(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: EntityArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    let raw = ctx.store.read_raw(&args.entity)?;
    Ok(json!({"ok": true, "entity": args.entity, "raw": raw}))
}

pub(super) fn load_entity(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: EntityArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    let entity = ctx.store.load_entity(&args.entity)?;
    ctx.state().registry.insert(entity.clone());
    Ok(json!({"ok": true, "entity": entity_summary(&entity)}))
}

#[derive(Deserialize)]
struct EntitiesArgs {
    entities: Vec<String>,
}

pub(super) fn load_entities(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: EntitiesArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    let mut summaries = Vec::new();
    for name in &args.entities {
        let entity = ctx.store.load_entity(name)?;
        ctx.state().registry.insert(entity.clone());
        summaries.push(entity_summary(&entity));
    }
    Ok(json!({"ok": true, "entities": summaries}))
}

#[derive(Deserialize)]
struct SearchSchemaArgs {
    query: String,
}

pub(super) fn search_schema(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: SearchSchemaArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    let needle = args.query.to_lowercase();
    if needle.is_empty() {
        return Ok(error_value("query must not be empty"));
    }

    let mut matches = Vec::new();
    'outer: for name in ctx.store.list_entities()? {
        let raw = ctx.store.read_raw(&name)?;
        for (line_no, line) in raw.lines().enumerate() {
            if line.to_lowercase().contains(&needle) {
                matches.push(json!({
                    "entity": name,
                    "line": line_no + 1,
                    "text": line.trim(),
                }));
                if matches.len() >= SCHEMA_SEARCH_CAP {
                    break 'outer;
                }
            }
        }
    }
    Ok(json!({"ok": true, "matches": matches}))
}

#[derive(Deserialize)]
struct ScanArgs {
    entity: String,
    fields: Vec<String>,
}

/// Selective hydration: the requested fields plus the closure of fields
/// their SQL expressions reference.
pub(super) fn scan_entity_properties(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: ScanArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    let entity = ctx.store.load_entity(&args.entity)?;
    ctx.state().registry.insert(entity.clone());

    let mut wanted_fields: Vec<String> = Vec::new();
    let mut wanted_measures: Vec<String> = Vec::new();
    let mut wanted_metrics: Vec<String> = Vec::new();
    let mut external_refs: Vec<String> = Vec::new();
    let mut queue: VecDeque<String> = VecDeque::new();

    for requested in &args.fields {
        if let Some(metric) = entity.metric(requested) {
            if !wanted_metrics.contains(&metric.name) {
                wanted_metrics.push(metric.name.clone());
            }
            wanted_measures.push(metric.measure.clone());
            if let Some(measure) = entity.measure(&metric.measure) {
                if let Some(sql) = &measure.sql {
                    enqueue_deps(sql, &mut queue, &mut external_refs);
                }
            }
            if let Some(anchor) = &metric.anchor_date {
                queue.push_back(anchor.clone());
            }
            for filter in &metric.filters {
                queue.push_back(filter.field.clone());
            }
        } else if let Some(measure) = entity.measure(requested) {
            if !wanted_measures.contains(&measure.name) {
                wanted_measures.push(measure.name.clone());
            }
            if let Some(sql) = &measure.sql {
                enqueue_deps(sql, &mut queue, &mut external_refs);
            }
        } else {
            queue.push_back(requested.clone());
        }
    }

    while let Some(surface) = queue.pop_front() {
        let Some(field) = entity.field(&surface) else {
            continue;
        };
        if wanted_fields.contains(&field.name) {
            continue;
        }
        wanted_fields.push(field.name.clone());
        enqueue_deps(&field.sql, &mut queue, &mut external_refs);
    }

    wanted_measures.dedup();

    let dimensions: Vec<Value> = entity
        .dimensions
        .iter()
        .filter(|d| wanted_fields.contains(&d.name))
        .map(|d| json!({"name": d.name, "sql": d.sql, "type": d.data_type, "aliases": d.aliases}))
        .collect();
    let time_dimensions: Vec<Value> = entity
        .time_dimensions
        .iter()
        .filter(|d| wanted_fields.contains(&d.name))
        .map(|d| json!({"name": d.name, "sql": d.sql, "type": d.data_type}))
        .collect();
    let measures: Vec<Value> = entity
        .measures
        .iter()
        .filter(|m| wanted_measures.contains(&m.name))
        .map(|m| json!({"name": m.name, "agg": m.agg, "sql": m.sql}))
        .collect();
    let metrics: Vec<Value> = entity
        .metrics
        .iter()
        .filter(|m| wanted_metrics.contains(&m.name))
        .map(|m| {
            json!({
                "name": m.name,
                "measure": m.measure,
                "anchor_date": m.anchor_date,
                "filters": m.filters,
            })
        })
        .collect();

    Ok(json!({
        "ok": true,
        "entity": entity.name,
        "dimensions": dimensions,
        "time_dimensions": time_dimensions,
        "measures": measures,
        "metrics": metrics,
        "external_refs": external_refs,
    }))
}

fn enqueue_deps(sql: &str, queue: &mut VecDeque<String>, external: &mut Vec<String>) {
    for dep in expression_dependencies(sql) {
        match dep.entity {
            Some(entity) => {
                let qualified = format!("{entity}.{}", dep.field);
                if !external.contains(&qualified) {
                    external.push(qualified);
                }
            }
            None => queue.push_back(dep.field),
        }
    }
}

pub(super) fn assess_coverage(args: Value) -> Result<Value, AgentError> {
    // Annotation only; echoed back so it lands in the transcript.
    Ok(json!({"ok": true, "recorded": args}))
}

pub(super) fn finalize_plan(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let plan: FinalizedPlan = match parse_args(args) {
        Ok(p) => p,
        Err(e) => return Ok(e),
    };
    if let Err(e) = plan.check() {
        return Ok(error_value(e.to_string()));
    }

    // Load everything the plan references. An unknown name is the model's
    // mistake, reported back as a structured note; a corrupt descriptor
    // is fatal.
    for name in plan.referenced_entities() {
        match ctx.store.load_entity(&name) {
            Ok(entity) => ctx.state().registry.insert(entity),
            Err(SemanticError::DescriptorNotFound { entity, .. }) => {
                return Ok(error_value(format!(
                    "plan references unknown entity '{entity}'"
                )));
            }
            Err(other) => return Err(other.into()),
        }
    }

    // Reachability gate: every selected entity must join to the base.
    let registry = ctx.state().registry.clone();
    let base = match plan.base_entity() {
        Ok(b) => b.to_string(),
        Err(e) => return Ok(error_value(e.to_string())),
    };
    if let Err(e) = compute_join_path(&base, &plan.selected_entities, &registry) {
        return Ok(error_value(e.to_string()));
    }

    info!(
        entities = plan.selected_entities.len(),
        metrics = plan.intent.metrics.len(),
        "plan finalized"
    );
    let echo = serde_json::to_value(&plan).unwrap_or(Value::Null);
    ctx.state().plan = Some(plan);
    Ok(json!({"ok": true, "plan": echo}))
}

#[derive(Deserialize)]
struct NoDataArgs {
    answer: String,
}

pub(super) fn finalize_no_data(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: NoDataArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    ctx.state().no_data_answer = Some(args.answer);
    Ok(json!({"ok": true}))
}

#[derive(Deserialize)]
struct ClarifyArgs {
    question: String,
}

pub(super) fn clarify_intent(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: ClarifyArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    ctx.state().clarification = Some(args.question);
    Ok(json!({"ok": true}))
}

fn entity_summary(entity: &Entity) -> Value {
    json!({
        "name": entity.name,
        "table": entity.table,
        "grain": entity.grain,
        "dimensions": entity.dimensions.iter().map(|d| json!({
            "name": d.name, "type": d.data_type, "aliases": d.aliases,
        })).collect::<Vec<_>>(),
        "time_dimensions": entity.time_dimensions.iter().map(|d| json!({
            "name": d.name,
        })).collect::<Vec<_>>(),
        "measures": entity.measures.iter().map(|m| json!({
            "name": m.name, "agg": m.agg,
        })).collect::<Vec<_>>(),
        "metrics": entity.metrics.iter().map(|m| json!({
            "name": m.name, "measure": m.measure, "anchor_date": m.anchor_date,
        })).collect::<Vec<_>>(),
        "joins": entity.joins.iter().map(|j| json!({
            "target_entity": j.target_entity,
            "relationship": j.relationship,
            "from_field": j.from_field,
            "to_field": j.to_field,
        })).collect::<Vec<_>>(),
    })
}
