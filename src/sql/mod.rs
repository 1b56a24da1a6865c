//! SQL materialization and validation.
//!
//! [`render`] lowers a finalized plan into a single SELECT statement;
//! [`validate`] provides the static syntax scan and the registry-backed
//! semantic scan that gate execution.

pub mod render;
pub mod validate;

pub use render::{render, RenderError, RenderedSql};
pub use validate::{semantic_scan, syntax_scan, Validation, ValidationIssue};
