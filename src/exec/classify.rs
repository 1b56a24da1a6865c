//! Classification of driver error messages.
//!
//! Repair selection keys off substring patterns in the driver's message.
//! Unmatched messages are opaque and never repaired.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Classified execution error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorClass {
    /// One or more identifiers the warehouse does not recognize.
    ColumnNotFound { identifiers: Vec<String> },
    /// An identifier that resolves in more than one joined table.
    AmbiguousColumn { identifiers: Vec<String> },
    /// Statement or connection timeout.
    Timeout,
    /// Anything else; no repair applies.
    Opaque,
}

static INVALID_IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)invalid identifier '([^']+)'").unwrap());
static COLUMN_NOT_FOUND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)column\s+["']?([A-Za-z0-9_.]+)["']?\s+not\s+found"#).unwrap());
static QUOTED_IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["']([A-Za-z0-9_.]+)["']"#).unwrap());

/// Classify a driver error message.
pub fn classify(message: &str) -> ErrorClass {
    let mut identifiers: Vec<String> = INVALID_IDENT_RE
        .captures_iter(message)
        .map(|c| c[1].to_string())
        .collect();
    if identifiers.is_empty() {
        identifiers = COLUMN_NOT_FOUND_RE
            .captures_iter(message)
            .map(|c| c[1].to_string())
            .collect();
    }
    if !identifiers.is_empty() {
        identifiers.dedup();
        return ErrorClass::ColumnNotFound { identifiers };
    }

    let lower = message.to_lowercase();
    if lower.contains("ambiguous") && lower.contains("column") {
        let mut identifiers: Vec<String> = QUOTED_IDENT_RE
            .captures_iter(message)
            .map(|c| c[1].to_string())
            .collect();
        identifiers.dedup();
        return ErrorClass::AmbiguousColumn { identifiers };
    }

    if lower.contains("timeout") {
        return ErrorClass::Timeout;
    }

    ErrorClass::Opaque
}
