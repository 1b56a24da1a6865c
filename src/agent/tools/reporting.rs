//! Reporting-phase tools: sanity check, CSV artifact, narrative.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{error_value, parse_args};
use crate::agent::report::{build_artifact, sanity_check as check_result, Narrative};
use crate::agent::{AgentError, ToolContext};

pub(super) fn sanity_check(ctx: &ToolContext) -> Result<Value, AgentError> {
    let (columns, rows) = {
        let state = ctx.state();
        match state.execution.as_ref().and_then(|e| e.result.as_ref()) {
            Some(result) => (result.columns.clone(), result.rows.clone()),
            None => {
                return Ok(error_value(
                    "no successful execution result; nothing to check",
                ))
            }
        }
    };

    let report = check_result(&columns, &rows);
    Ok(json!({"ok": true, "report": report}))
}

pub(super) fn format_results(ctx: &ToolContext) -> Result<Value, AgentError> {
    let (columns, rows, truncated) = {
        let state = ctx.state();
        match state.execution.as_ref().and_then(|e| e.result.as_ref()) {
            Some(result) => (
                result.columns.clone(),
                result.rows.clone(),
                result.truncated,
            ),
            None => {
                return Ok(error_value(
                    "no successful execution result; nothing to format",
                ))
            }
        }
    };

    let artifact = match build_artifact(&columns, &rows, truncated) {
        Ok(a) => a,
        Err(e) => return Ok(error_value(format!("csv encoding failed: {e}"))),
    };

    let output = json!({
        "ok": true,
        "total_rows": artifact.total_rows,
        "truncated": artifact.truncated,
        "preview": artifact.preview,
        "csv_bytes": artifact.csv_base64.len(),
    });
    info!(rows = artifact.total_rows, "result artifact built");
    ctx.state().artifact = Some(artifact);
    Ok(output)
}

#[derive(Deserialize)]
struct ExplainResultsArgs {
    narrative: String,
    confidence: f64,
}

pub(super) fn explain_results(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: ExplainResultsArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };
    if !(0.0..=1.0).contains(&args.confidence) {
        return Ok(error_value("confidence must be between 0 and 1"));
    }
    ctx.state().narrative = Some(Narrative {
        text: args.narrative,
        confidence: args.confidence,
    });
    Ok(json!({"ok": true}))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FinalizeReportArgs {
    summary: Option<String>,
    confidence: Option<f64>,
}

pub(super) fn finalize_report(ctx: &ToolContext, args: Value) -> Result<Value, AgentError> {
    let args: FinalizeReportArgs = match parse_args(args) {
        Ok(a) => a,
        Err(e) => return Ok(e),
    };

    let mut state = ctx.state();
    if state.narrative.is_none() {
        if let Some(summary) = args.summary {
            state.narrative = Some(Narrative {
                text: summary,
                confidence: args.confidence.unwrap_or(0.5),
            });
        }
    }
    Ok(json!({"ok": true}))
}
