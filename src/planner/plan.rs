//! The finalized plan: the handoff artifact from Planning to Building.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::semantic::{Cardinality, StructuredFilter};

/// Result type for plan operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors raised while validating or executing against a plan.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("plan must select between 1 and 3 entities, got {0}")]
    SelectionSize(usize),

    #[error("plan references unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("no join path from '{base}' to '{target}'")]
    Unreachable { base: String, target: String },

    #[error("invalid plan: {0}")]
    Invalid(String),

    #[error("invalid time range: {0}")]
    TimeRange(String),
}

/// A half-open time window `[start, end)` over the base entity's first
/// time dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeRange {
    /// Inclusive start, `YYYY-MM-DD`.
    pub start: String,
    /// Exclusive end, `YYYY-MM-DD`.
    pub end: String,
    #[serde(default)]
    pub grain: Option<String>,
}

impl TimeRange {
    /// Check both bounds parse as ISO dates and the window is non-empty.
    pub fn check(&self) -> PlanResult<()> {
        let start = NaiveDate::parse_from_str(&self.start, "%Y-%m-%d")
            .map_err(|_| PlanError::TimeRange(format!("bad start date '{}'", self.start)))?;
        let end = NaiveDate::parse_from_str(&self.end, "%Y-%m-%d")
            .map_err(|_| PlanError::TimeRange(format!("bad end date '{}'", self.end)))?;
        if start >= end {
            return Err(PlanError::TimeRange(format!(
                "start '{}' is not before end '{}'",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// What the user asked for, in semantic-model vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueryIntent {
    /// Metric or measure names to aggregate.
    pub metrics: Vec<String>,
    /// Dimension names to group by, `field` or `entity.field`.
    pub dimensions: Vec<String>,
    /// Structured predicates lowered into WHERE.
    pub structured_filters: Vec<StructuredFilter>,
    /// Free-text filter notes. Advisory only: rendered as SQL comments,
    /// never as predicates.
    pub filters: Vec<String>,
    pub time_range: Option<TimeRange>,
    pub grain: Option<String>,
    pub compare: Option<String>,
}

/// Join key pair of a plan edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinOn {
    pub from: String,
    pub to: String,
}

/// One edge of the plan's join graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinGraphEdge {
    pub from: String,
    pub to: String,
    pub on: JoinOn,
    pub relationship: Cardinality,
}

/// The Planning-phase output that Building consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FinalizedPlan {
    pub intent: QueryIntent,
    /// 1 to 3 entity names; the first is the rendering base.
    pub selected_entities: Vec<String>,
    pub required_fields: Vec<String>,
    pub assumptions: Vec<String>,
    pub risks: Vec<String>,
    pub join_graph: Vec<JoinGraphEdge>,
}

impl FinalizedPlan {
    /// Structural validation: selection size, filter arity, time range.
    ///
    /// Entity existence and reachability are checked against a loaded
    /// registry by the semantic scan and the join planner.
    pub fn check(&self) -> PlanResult<()> {
        if self.selected_entities.is_empty() || self.selected_entities.len() > 3 {
            return Err(PlanError::SelectionSize(self.selected_entities.len()));
        }
        for filter in &self.intent.structured_filters {
            filter.check_arity().map_err(PlanError::Invalid)?;
        }
        if let Some(range) = &self.intent.time_range {
            range.check()?;
        }
        for edge in &self.join_graph {
            if edge.from.is_empty() || edge.to.is_empty() {
                return Err(PlanError::Invalid(
                    "join graph edge with empty endpoint".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The rendering base: first selected entity.
    pub fn base_entity(&self) -> PlanResult<&str> {
        self.selected_entities
            .first()
            .map(|s| s.as_str())
            .ok_or(PlanError::SelectionSize(0))
    }

    /// Every entity name the plan touches: selection plus join-graph
    /// endpoints, deduplicated, selection order first.
    pub fn referenced_entities(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in &self.selected_entities {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        for edge in &self.join_graph {
            if !names.contains(&edge.from) {
                names.push(edge.from.clone());
            }
            if !names.contains(&edge.to) {
                names.push(edge.to.clone());
            }
        }
        names
    }
}
