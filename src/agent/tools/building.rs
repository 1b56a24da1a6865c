//! Building-phase tools: join path, rendering, validation, finalize.

use serde_json::{json, Value};
use tracing::info;

use super::error_value;
use crate::agent::{AgentError, ToolContext};
use crate::planner::join::compute_join_path as plan_join_path;
use crate::sql::{render, semantic_scan, syntax_scan};

pub(super) fn compute_join_path(ctx: &ToolContext) -> Result<Value, AgentError> {
    let (plan, registry) = {
        let state = ctx.state();
        match &state.plan {
            Some(plan) => (plan.clone(), state.registry.clone()),
            None => return Ok(error_value("no finalized plan; call finalize_plan first")),
        }
    };

    let base = plan.base_entity()?.to_string();
    let path = plan_join_path(&base, &plan.selected_entities, &registry)?;
    Ok(json!({
        "ok": true,
        "edges": path.edges,
        "alias_by_entity": path.alias_by_entity,
        "ordered_entities": path.ordered_entities,
    }))
}

pub(super) fn build_sql(ctx: &ToolContext) -> Result<Value, AgentError> {
    let (plan, registry) = {
        let state = ctx.state();
        match &state.plan {
            Some(plan) => (plan.clone(), state.registry.clone()),
            None => return Ok(error_value("no finalized plan; call finalize_plan first")),
        }
    };

    let rendered = render(&plan, &registry)?;
    info!(bytes = rendered.sql.len(), "sql rendered");
    let sql = rendered.sql.clone();
    {
        let mut state = ctx.state();
        state.rendered = Some(rendered);
        state.validated = false;
    }
    Ok(json!({"ok": true, "sql": sql}))
}

pub(super) fn validate_sql(ctx: &ToolContext) -> Result<Value, AgentError> {
    let (plan, registry, sql) = {
        let state = ctx.state();
        let Some(rendered) = &state.rendered else {
            return Ok(error_value("no rendered SQL; call build_sql first"));
        };
        let Some(plan) = &state.plan else {
            return Ok(error_value("no finalized plan; call finalize_plan first"));
        };
        (plan.clone(), state.registry.clone(), rendered.sql.clone())
    };

    let syntax = syntax_scan(&sql);
    let schemas = ctx.settings.policy.effective_schemas();
    let semantic = semantic_scan(&plan, &registry, &schemas);
    let ok = syntax.ok && semantic.ok;

    ctx.state().validated = ok;
    Ok(json!({"ok": ok, "syntax": syntax, "semantic": semantic}))
}

pub(super) fn finalize_build(ctx: &ToolContext) -> Result<Value, AgentError> {
    let state = ctx.state();
    if state.rendered.is_none() {
        return Ok(error_value("nothing to finalize; call build_sql first"));
    }
    if !state.validated {
        return Ok(error_value(
            "SQL has not passed validation; call validate_sql and fix any issues",
        ));
    }
    Ok(json!({"ok": true}))
}
