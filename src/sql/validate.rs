//! Syntax and semantic validation of generated SQL.
//!
//! The syntax scan is a static, regex-driven policy check: a single
//! statement, no write/DDL verbs, balanced block comments. The semantic
//! scan checks a plan against the loaded registry and the schema
//! allow-list. Both return structured issue lists the agent can react to.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::planner::plan::FinalizedPlan;
use crate::semantic::Registry;

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Scan outcome: `ok` iff no issues were found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub ok: bool,
    pub issues: Vec<ValidationIssue>,
}

impl Validation {
    fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            ok: issues.is_empty(),
            issues,
        }
    }
}

static DENIED_VERB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(drop|truncate|alter|create|insert|update|delete|merge|copy|put|get)\b")
        .unwrap()
});

/// Static syntax scan over a SQL string.
pub fn syntax_scan(sql: &str) -> Validation {
    let mut issues = Vec::new();

    // A single statement only: at most one semicolon, and only trailing.
    let semicolons = sql.matches(';').count();
    if semicolons > 1 {
        issues.push(ValidationIssue::new(
            "multi_statement",
            format!("expected a single statement, found {semicolons} semicolons"),
        ));
    } else if semicolons == 1 && !sql.trim_end().ends_with(';') {
        issues.push(ValidationIssue::new(
            "multi_statement",
            "semicolon is only allowed at the end of the statement",
        ));
    }

    let mut denied: Vec<String> = DENIED_VERB_RE
        .find_iter(sql)
        .map(|m| m.as_str().to_uppercase())
        .collect();
    denied.sort_unstable();
    denied.dedup();
    for verb in denied {
        issues.push(ValidationIssue::new(
            "denied_verb",
            format!("statement contains disallowed verb {verb}"),
        ));
    }

    if !block_comments_balanced(sql) {
        issues.push(ValidationIssue::new(
            "unbalanced_comment",
            "unbalanced block comment",
        ));
    }

    Validation::from_issues(issues)
}

fn block_comments_balanced(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut depth: i64 = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    depth == 0
}

/// Semantic scan of a plan against the loaded registry.
pub fn semantic_scan(
    plan: &FinalizedPlan,
    registry: &Registry,
    allowed_schemas: &[String],
) -> Validation {
    let mut issues = Vec::new();

    // Policy: every loaded table must be schema-qualified and on-list.
    for entity in registry.iter_sorted() {
        match entity.schema() {
            None => issues.push(ValidationIssue::new(
                "unqualified_table",
                format!("entity '{}': table '{}' is not schema-qualified", entity.name, entity.table),
            )),
            Some(schema) => {
                let schema = schema.to_lowercase();
                if !allowed_schemas.iter().any(|s| s.eq_ignore_ascii_case(&schema)) {
                    issues.push(ValidationIssue::new(
                        "schema_not_allowed",
                        format!(
                            "entity '{}': schema '{schema}' is not in the allow-list",
                            entity.name
                        ),
                    ));
                }
            }
        }
    }

    for name in &plan.selected_entities {
        if !registry.contains(name) {
            issues.push(ValidationIssue::new(
                "unknown_entity",
                format!("selected entity '{name}' is not loaded"),
            ));
        }
    }
    for edge in &plan.join_graph {
        for endpoint in [&edge.from, &edge.to] {
            if !registry.contains(endpoint) {
                issues.push(ValidationIssue::new(
                    "unknown_entity",
                    format!("join graph references unloaded entity '{endpoint}'"),
                ));
            }
        }
    }

    for dim in &plan.intent.dimensions {
        if !field_resolves(dim, registry) {
            issues.push(ValidationIssue::new(
                "unknown_dimension",
                format!("dimension '{dim}' does not resolve in any loaded entity"),
            ));
        }
    }

    for metric in &plan.intent.metrics {
        if !metric_resolves(metric, registry) {
            issues.push(ValidationIssue::new(
                "unknown_metric",
                format!("metric '{metric}' does not resolve in any loaded entity"),
            ));
        }
    }

    if plan.intent.time_range.is_some()
        && !registry
            .iter_sorted()
            .iter()
            .any(|e| e.first_time_dimension().is_some())
    {
        issues.push(ValidationIssue::new(
            "no_time_dimension",
            "plan has a time range but no loaded entity exposes a time dimension",
        ));
    }

    Validation::from_issues(issues)
}

/// Resolve `field` or `entity.field` against the registry. Dotted names
/// resolve against the named entity only.
fn field_resolves(name: &str, registry: &Registry) -> bool {
    if let Some((entity_name, field)) = name.split_once('.') {
        return registry
            .get_by_surface(entity_name)
            .map(|e| e.field(field).is_some())
            .unwrap_or(false);
    }
    registry
        .iter_sorted()
        .iter()
        .any(|e| e.field(name).is_some())
}

fn metric_resolves(name: &str, registry: &Registry) -> bool {
    if let Some((entity_name, metric)) = name.split_once('.') {
        return registry
            .get_by_surface(entity_name)
            .map(|e| e.metric(metric).is_some() || e.measure(metric).is_some())
            .unwrap_or(false);
    }
    registry
        .iter_sorted()
        .iter()
        .any(|e| e.metric(name).is_some() || e.measure(name).is_some())
}
