//! Execution-phase tools: EXPLAIN cost heuristics and guarded execution.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::error_value;
use crate::agent::report::PREVIEW_ROWS;
use crate::agent::{AgentError, ExecutionSummary, ToolContext};
use crate::exec::{ExecError, RepairContext};

pub(super) async fn estimate_cost(ctx: &ToolContext) -> Result<Value, AgentError> {
    let sql = {
        let state = ctx.state();
        match &state.rendered {
            Some(rendered) => rendered.sql.clone(),
            None => return Ok(error_value("no rendered SQL; finish the building phase first")),
        }
    };

    let plan_text = match ctx.guard.explain(&sql).await {
        Ok(text) => text,
        Err(e) => return Ok(error_value(format!("explain failed: {e}"))),
    };

    let estimate = score_explain(&plan_text);
    Ok(json!({
        "ok": true,
        "score": estimate.score,
        "signals": estimate.signals,
        "recommendations": estimate.recommendations,
    }))
}

pub(super) async fn execute_sql(ctx: &ToolContext) -> Result<Value, AgentError> {
    let (sql, registry, join_path) = {
        let state = ctx.state();
        match &state.rendered {
            Some(rendered) => (
                rendered.sql.clone(),
                state.registry.clone(),
                rendered.join_path.clone(),
            ),
            None => return Ok(error_value("no rendered SQL; finish the building phase first")),
        }
    };

    let repair_ctx = RepairContext {
        registry: &registry,
        join_path: Some(&join_path),
    };

    match ctx.guard.execute_with_repair(&sql, repair_ctx).await {
        Ok(result) => {
            info!(
                rows = result.rows.len(),
                from_cache = result.from_cache,
                repaired = result.repaired,
                "execution succeeded"
            );
            let preview: Vec<&Vec<Value>> = result.rows.iter().take(PREVIEW_ROWS).collect();
            let output = json!({
                "ok": true,
                "row_count": result.rows.len(),
                "columns": result.columns,
                "preview": preview,
                "truncated": result.truncated,
                "from_cache": result.from_cache,
                "repaired": result.repaired,
                "repair_reason": result.repair_reason,
            });
            ctx.state().execution = Some(ExecutionSummary {
                ok: true,
                result: Some(result),
                error: None,
                attempted_sql: None,
                repaired: false,
                repair_reason: None,
            });
            Ok(output)
        }
        Err(ExecError::Policy(message)) => Err(AgentError::Policy(message)),
        Err(ExecError::BreakerOpen { retry_in_ms }) => {
            let message = format!("circuit breaker open, retry in {retry_in_ms} ms");
            warn!("{message}");
            ctx.state().execution = Some(ExecutionSummary {
                ok: false,
                result: None,
                error: Some(message.clone()),
                attempted_sql: Some(sql),
                repaired: false,
                repair_reason: None,
            });
            Ok(error_value(message))
        }
        Err(ExecError::Failed {
            message,
            attempted_sql,
            repaired,
            repair_reason,
        }) => {
            warn!(error = %message, repaired, "execution failed");
            let output = json!({
                "ok": false,
                "error": message,
                "attempted_sql": attempted_sql,
                "repaired": repaired,
                "repair_reason": repair_reason,
            });
            ctx.state().execution = Some(ExecutionSummary {
                ok: false,
                result: None,
                error: Some(message),
                attempted_sql: Some(attempted_sql),
                repaired,
                repair_reason,
            });
            Ok(output)
        }
    }
}

/// One contributing signal of the cost estimate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CostSignal {
    pub name: String,
    pub points: u32,
    pub detail: String,
}

/// Heuristic cost estimate over an EXPLAIN plan, scored 0-100.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CostEstimate {
    pub score: u32,
    pub signals: Vec<CostSignal>,
    pub recommendations: Vec<String>,
}

static ROWS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)rows[=:]\s*([0-9][0-9_,]*)").unwrap());

/// Sum heuristic signals over an EXPLAIN plan.
pub fn score_explain(plan: &str) -> CostEstimate {
    let lower = plan.to_lowercase();
    let mut signals = Vec::new();
    let mut recommendations = Vec::new();

    if lower.contains("cartesian") || lower.contains("cross join") {
        signals.push(CostSignal {
            name: "cartesian_join".to_string(),
            points: 40,
            detail: "plan contains a cartesian product".to_string(),
        });
        recommendations
            .push("add a join predicate between the involved tables".to_string());
    }

    let scans = lower.matches("tablescan").count() + lower.matches("full scan").count()
        + lower.matches("seq scan").count();
    if scans > 0 {
        signals.push(CostSignal {
            name: "full_scan".to_string(),
            points: 30,
            detail: format!("{scans} full table scan(s)"),
        });
        if !lower.contains("filter") {
            signals.push(CostSignal {
                name: "unfiltered_scan".to_string(),
                points: 10,
                detail: "scan without any filter".to_string(),
            });
            recommendations.push("add a time range or filter to narrow the scan".to_string());
        }
    }

    let max_rows = ROWS_RE
        .captures_iter(plan)
        .filter_map(|c| c[1].replace(['_', ','], "").parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    if max_rows > 10_000_000 {
        signals.push(CostSignal {
            name: "very_large_input".to_string(),
            points: 20,
            detail: format!("estimated {max_rows} input rows"),
        });
        recommendations.push("restrict the time range before running".to_string());
    } else if max_rows > 1_000_000 {
        signals.push(CostSignal {
            name: "large_input".to_string(),
            points: 10,
            detail: format!("estimated {max_rows} input rows"),
        });
    }

    let joins = lower.matches("join").count();
    if joins > 3 {
        signals.push(CostSignal {
            name: "many_joins".to_string(),
            points: 10,
            detail: format!("{joins} joins"),
        });
    }

    let score = signals.iter().map(|s| s.points).sum::<u32>().min(100);
    CostEstimate {
        score,
        signals,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_plan_scores_low() {
        let estimate = score_explain("Filter -> IndexScan accounts rows=1200");
        assert_eq!(estimate.score, 0);
    }

    #[test]
    fn test_cartesian_scores_high() {
        let estimate = score_explain("CartesianJoin\n  TableScan a rows=20000000\n  TableScan b");
        assert!(estimate.score >= 70, "score was {}", estimate.score);
        assert!(!estimate.recommendations.is_empty());
    }

    #[test]
    fn test_score_is_clamped() {
        let plan = "cross join tablescan tablescan rows=99999999 \
                    join join join join join";
        assert!(score_explain(plan).score <= 100);
    }
}
