//! Query planning: the finalized plan handed from Planning to Building,
//! and the shortest-path join planner.

pub mod join;
pub mod plan;

pub use join::{compute_join_path, JoinEdge, JoinPath};
pub use plan::{FinalizedPlan, JoinGraphEdge, JoinOn, PlanError, PlanResult, QueryIntent, TimeRange};
