//! # Augur
//!
//! A semantic-layer analytics agent: natural-language questions become
//! validated, safely-executable SQL against a governed warehouse.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Semantic Model                        │
//! │   (entities, dimensions, measures, metrics, joins)        │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!        Planning ─► Building ─► Execution ─► Reporting
//!        (catalog     (join path,  (guarded     (sanity check,
//!         recall,      renderer,    execution,   CSV artifact,
//!         plan)        validator)   repair)      narrative)
//! ```
//!
//! The [`agent`] module drives an LLM tool loop through the four phases.
//! Planning resolves the question against the semantic model and emits a
//! [`planner::FinalizedPlan`]; Building renders it to SQL through the
//! [`sql`] renderer and validates it; Execution runs it under the
//! [`exec::ExecutionGuard`] (timeout, retries, circuit breaker, result
//! cache, deterministic auto-repair); Reporting produces the rows, a CSV
//! artifact, and a narrative.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use augur::prelude::*;
//!
//! let settings = Arc::new(Settings::load()?);
//! let store = Arc::new(SemanticStore::new(settings.model.dir.clone()));
//! let guard = Arc::new(ExecutionGuard::new(driver, (&settings.guard).into()));
//! let session = AgentSession::new(store, guard, settings, model, EventSink::disabled());
//!
//! let outcome = session.run("How many accounts per tier?").await?;
//! ```

pub mod agent;
pub mod config;
pub mod exec;
pub mod planner;
pub mod semantic;
pub mod sql;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::agent::{
        AgentError, AgentEvent, AgentOutcome, AgentSession, EventSink, LanguageModel, ModelTurn,
        Phase, ScriptedModel,
    };
    pub use crate::config::Settings;
    pub use crate::exec::{
        ColumnInfo, DriverError, ExecutionGuard, ExecutionResult, GuardConfig, QueryOutput,
        WarehouseDriver,
    };
    pub use crate::planner::{compute_join_path, FinalizedPlan, JoinPath, QueryIntent};
    pub use crate::semantic::{Entity, Registry, SemanticStore};
    pub use crate::sql::{render, semantic_scan, syntax_scan};
}
