//! The four phases of a request and their tool allow-lists.

use serde::{Deserialize, Serialize};

/// Phase of the agent state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Building,
    Execution,
    Reporting,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Building => "building",
            Phase::Execution => "execution",
            Phase::Reporting => "reporting",
        }
    }

    /// Tools callable in this phase.
    pub fn allowed_tools(&self) -> &'static [&'static str] {
        match self {
            Phase::Planning => &[
                "list_entities",
                "search_catalog",
                "read_entity_descriptor",
                "load_entity",
                "load_entities",
                "search_schema",
                "scan_entity_properties",
                "assess_coverage",
                "finalize_plan",
                "finalize_no_data",
                "clarify_intent",
            ],
            Phase::Building => &[
                "compute_join_path",
                "build_sql",
                "validate_sql",
                "finalize_build",
            ],
            Phase::Execution => &["estimate_cost", "execute_sql"],
            Phase::Reporting => &[
                "sanity_check",
                "format_results",
                "explain_results",
                "finalize_report",
            ],
        }
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools().contains(&tool)
    }

    /// Per-phase system prompt.
    pub fn system_prompt(&self) -> &'static str {
        match self {
            Phase::Planning => PLANNING_PROMPT,
            Phase::Building => BUILDING_PROMPT,
            Phase::Execution => EXECUTION_PROMPT,
            Phase::Reporting => REPORTING_PROMPT,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const PLANNING_PROMPT: &str = "\
You are the planning phase of a data analytics agent over a governed \
warehouse. Map the user's question onto the semantic model: find relevant \
entities with search_catalog and list_entities, inspect them with \
load_entity, scan_entity_properties, or read_entity_descriptor, and \
decide which metrics, dimensions, and filters answer the question.

Finish with exactly one of:
- finalize_plan: a complete plan with 1-3 selected entities, the intent \
(metrics, dimensions, structured_filters, optional time_range), \
assumptions, and risks.
- finalize_no_data: the question is about the schema itself or cannot be \
answered from the available entities; answer directly.
- clarify_intent: the question is ambiguous in a way you cannot resolve; \
ask one precise question.

Never invent entity or field names: everything in the plan must come from \
loaded entities.";

const BUILDING_PROMPT: &str = "\
You are the building phase. Turn the finalized plan into SQL: call \
build_sql to render the statement, validate_sql to run the syntax and \
semantic checks, and compute_join_path if you need to inspect the join \
topology. If validation reports issues you can fix by revising the plan's \
intent, fix them once; then call finalize_build.";

const EXECUTION_PROMPT: &str = "\
You are the execution phase. Optionally call estimate_cost to check the \
statement's EXPLAIN plan for expensive shapes, then call execute_sql to \
run it under the execution guard. Execution failures are reported back as \
structured results; do not retry yourself, the guard already did.";

const REPORTING_PROMPT: &str = "\
You are the reporting phase. Inspect the result with sanity_check, \
produce the CSV artifact with format_results, and write the user-facing \
narrative with explain_results: answer the question directly, state the \
time window and filters that applied, and disclose truncation or \
failures. If execution failed, say so plainly with low confidence. Finish \
with finalize_report.";
