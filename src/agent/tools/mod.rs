//! Tool definitions and dispatch.
//!
//! Every tool takes JSON arguments and returns a JSON value. Recoverable
//! problems (bad arguments, plan validation issues, failed execution)
//! come back as `{ok: false, error}` objects the model can react to;
//! unrecoverable ones (descriptor corruption, macro cycles, policy
//! violations) propagate as [`AgentError`] and terminate the request.

pub mod building;
pub mod execution;
pub mod planning;
pub mod reporting;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::llm::ToolDefinition;
use super::phase::Phase;
use super::{AgentError, ToolContext};

/// Dispatch one tool call.
pub(crate) async fn dispatch(
    ctx: &ToolContext,
    name: &str,
    args: Value,
) -> Result<Value, AgentError> {
    match name {
        "list_entities" => planning::list_entities(ctx),
        "search_catalog" => planning::search_catalog(ctx, args),
        "read_entity_descriptor" => planning::read_entity_descriptor(ctx, args),
        "load_entity" => planning::load_entity(ctx, args),
        "load_entities" => planning::load_entities(ctx, args),
        "search_schema" => planning::search_schema(ctx, args),
        "scan_entity_properties" => planning::scan_entity_properties(ctx, args),
        "assess_coverage" => planning::assess_coverage(args),
        "finalize_plan" => planning::finalize_plan(ctx, args),
        "finalize_no_data" => planning::finalize_no_data(ctx, args),
        "clarify_intent" => planning::clarify_intent(ctx, args),

        "compute_join_path" => building::compute_join_path(ctx),
        "build_sql" => building::build_sql(ctx),
        "validate_sql" => building::validate_sql(ctx),
        "finalize_build" => building::finalize_build(ctx),

        "estimate_cost" => execution::estimate_cost(ctx).await,
        "execute_sql" => execution::execute_sql(ctx).await,

        "sanity_check" => reporting::sanity_check(ctx),
        "format_results" => reporting::format_results(ctx),
        "explain_results" => reporting::explain_results(ctx, args),
        "finalize_report" => reporting::finalize_report(ctx, args),

        other => Ok(error_value(format!("unknown tool '{other}'"))),
    }
}

/// `{ok: false, error}` payload for recoverable tool problems.
pub(crate) fn error_value(message: impl Into<String>) -> Value {
    json!({"ok": false, "error": message.into()})
}

/// Parse tool arguments, turning serde errors into a recoverable payload.
pub(crate) fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, Value> {
    serde_json::from_value(args).map_err(|e| error_value(format!("invalid arguments: {e}")))
}

/// Tool definitions for one phase.
pub fn definitions(phase: Phase) -> Vec<ToolDefinition> {
    all_definitions()
        .into_iter()
        .filter(|d| phase.allows(&d.name))
        .collect()
}

fn tool(name: &str, description: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn no_args() -> Value {
    json!({"type": "object", "properties": {}})
}

fn all_definitions() -> Vec<ToolDefinition> {
    vec![
        tool(
            "list_entities",
            "List every entity available in the semantic model.",
            no_args(),
        ),
        tool(
            "search_catalog",
            "Keyword search over the entity catalog (names, descriptions, example questions). Returns the top 5 matches.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Keywords from the user's question"}
                },
                "required": ["query"]
            }),
        ),
        tool(
            "read_entity_descriptor",
            "Read one entity's raw descriptor document.",
            json!({
                "type": "object",
                "properties": {"entity": {"type": "string"}},
                "required": ["entity"]
            }),
        ),
        tool(
            "load_entity",
            "Load and validate one entity; returns its normalized dimensions, measures, metrics, and joins.",
            json!({
                "type": "object",
                "properties": {"entity": {"type": "string"}},
                "required": ["entity"]
            }),
        ),
        tool(
            "load_entities",
            "Load several entities at once.",
            json!({
                "type": "object",
                "properties": {
                    "entities": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["entities"]
            }),
        ),
        tool(
            "search_schema",
            "Substring search over raw descriptor text across all entities; returns matching lines with context.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        ),
        tool(
            "scan_entity_properties",
            "Hydrate selected fields of an entity, following SQL expression dependencies.",
            json!({
                "type": "object",
                "properties": {
                    "entity": {"type": "string"},
                    "fields": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["entity", "fields"]
            }),
        ),
        tool(
            "assess_coverage",
            "Annotate how well the loaded entities cover the question. Recording only; no effect on the plan.",
            json!({
                "type": "object",
                "properties": {
                    "covered": {"type": "array", "items": {"type": "string"}},
                    "gaps": {"type": "array", "items": {"type": "string"}},
                    "notes": {"type": "string"}
                }
            }),
        ),
        tool(
            "finalize_plan",
            "Commit the finalized plan: selected entities (1-3), intent (metrics, dimensions, structured_filters, time_range), assumptions, risks, join_graph.",
            json!({
                "type": "object",
                "properties": {
                    "intent": {
                        "type": "object",
                        "properties": {
                            "metrics": {"type": "array", "items": {"type": "string"}},
                            "dimensions": {"type": "array", "items": {"type": "string"}},
                            "structured_filters": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "field": {"type": "string"},
                                        "operator": {"type": "string", "enum": ["=", "!=", ">", ">=", "<", "<=", "in", "not_in"]},
                                        "values": {"type": "array"}
                                    },
                                    "required": ["field", "operator", "values"]
                                }
                            },
                            "filters": {"type": "array", "items": {"type": "string"}},
                            "time_range": {
                                "type": "object",
                                "properties": {
                                    "start": {"type": "string"},
                                    "end": {"type": "string"},
                                    "grain": {"type": "string"}
                                },
                                "required": ["start", "end"]
                            },
                            "grain": {"type": "string"},
                            "compare": {"type": "string"}
                        }
                    },
                    "selected_entities": {"type": "array", "items": {"type": "string"}, "minItems": 1, "maxItems": 3},
                    "required_fields": {"type": "array", "items": {"type": "string"}},
                    "assumptions": {"type": "array", "items": {"type": "string"}},
                    "risks": {"type": "array", "items": {"type": "string"}},
                    "join_graph": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "from": {"type": "string"},
                                "to": {"type": "string"},
                                "on": {
                                    "type": "object",
                                    "properties": {"from": {"type": "string"}, "to": {"type": "string"}},
                                    "required": ["from", "to"]
                                },
                                "relationship": {"type": "string", "enum": ["one_to_one", "one_to_many", "many_to_one", "many_to_many"]}
                            },
                            "required": ["from", "to", "on", "relationship"]
                        }
                    }
                },
                "required": ["intent", "selected_entities"]
            }),
        ),
        tool(
            "finalize_no_data",
            "Answer directly without querying: schema questions or out-of-scope requests.",
            json!({
                "type": "object",
                "properties": {"answer": {"type": "string"}},
                "required": ["answer"]
            }),
        ),
        tool(
            "clarify_intent",
            "Pause and ask the user one clarifying question.",
            json!({
                "type": "object",
                "properties": {"question": {"type": "string"}},
                "required": ["question"]
            }),
        ),
        tool(
            "compute_join_path",
            "Compute the join path for the finalized plan's selected entities.",
            no_args(),
        ),
        tool(
            "build_sql",
            "Render the finalized plan into SQL.",
            no_args(),
        ),
        tool(
            "validate_sql",
            "Run the syntax scan and the semantic scan over the rendered SQL.",
            no_args(),
        ),
        tool(
            "finalize_build",
            "Commit the rendered, validated SQL and move on to execution.",
            no_args(),
        ),
        tool(
            "estimate_cost",
            "Score the statement's EXPLAIN plan 0-100 for expensive shapes, with recommendations.",
            no_args(),
        ),
        tool(
            "execute_sql",
            "Execute the built SQL under the execution guard (timeout, retries, breaker, cache, auto-repair).",
            no_args(),
        ),
        tool(
            "sanity_check",
            "Check the result for null-heavy columns, negative counts, and implausible percentages.",
            no_args(),
        ),
        tool(
            "format_results",
            "Produce the CSV artifact (first 1000 rows, base64) and a 30-row preview.",
            no_args(),
        ),
        tool(
            "explain_results",
            "Record the user-facing narrative and your confidence in it.",
            json!({
                "type": "object",
                "properties": {
                    "narrative": {"type": "string"},
                    "confidence": {"type": "number", "minimum": 0, "maximum": 1}
                },
                "required": ["narrative", "confidence"]
            }),
        ),
        tool(
            "finalize_report",
            "Finish the request. Optionally set a summary if explain_results was not called.",
            json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string"},
                    "confidence": {"type": "number"}
                }
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_allowed_tool_has_a_definition() {
        for phase in [
            Phase::Planning,
            Phase::Building,
            Phase::Execution,
            Phase::Reporting,
        ] {
            let defs = definitions(phase);
            let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
            for tool in phase.allowed_tools() {
                assert!(names.contains(tool), "{tool} missing in {phase}");
            }
            assert_eq!(defs.len(), phase.allowed_tools().len());
        }
    }
}
