//! The semantic model: entities, catalog, descriptor store, and macro
//! expansion.
//!
//! An [`Entity`] describes one analytical warehouse table: its dimensions,
//! time dimensions, pre-defined measures and metrics, and outgoing joins.
//! Entities are read from one-file-per-entity JSON descriptors by the
//! [`SemanticStore`], validated against cross-field invariants, and cached
//! for the process lifetime. The [`expand`] module resolves templated field
//! references (`{CUBE}.col`, `{field}`, `{entity.field}`) inside dimension
//! and measure SQL.

pub mod catalog;
pub mod entity;
pub mod error;
pub mod expand;
pub mod store;

pub use catalog::{Catalog, CatalogSearchHit, EntityCard};
pub use entity::{
    AggregationType, Cardinality, Dimension, Entity, FilterOp, JoinDef, Measure, Metric,
    MetricKind, Registry, StructuredFilter,
};
pub use error::{SemanticError, SemanticResult};
pub use expand::{
    expand_expr, expression_dependencies, qualify_simple_column, quote_ident, ExpandContext,
    ExprRef, MacroError,
};
pub use store::SemanticStore;
