//! Deterministic SQL repair strategies.
//!
//! Each strategy takes the classified error, the failing SQL, and the
//! loaded semantic context, and produces a mutated statement aimed at
//! eliminating the cause. No strategy ever contacts the warehouse.

use strsim::levenshtein;
use tracing::debug;

use super::classify::ErrorClass;
use crate::planner::join::JoinPath;
use crate::semantic::{quote_ident, Registry};
use crate::sql::render::ROW_LIMIT;

/// Semantic context of the failing statement.
#[derive(Debug, Clone, Copy)]
pub struct RepairContext<'a> {
    pub registry: &'a Registry,
    pub join_path: Option<&'a JoinPath>,
}

/// A repaired statement and the reason it should fare better.
#[derive(Debug, Clone, PartialEq)]
pub struct Repair {
    pub sql: String,
    pub reason: String,
}

/// Attempt a repair for a classified error. `None` means no deterministic
/// fix applies and the error should surface.
pub fn attempt_repair(class: &ErrorClass, sql: &str, ctx: &RepairContext<'_>) -> Option<Repair> {
    match class {
        ErrorClass::ColumnNotFound { identifiers } => repair_missing_columns(identifiers, sql, ctx),
        ErrorClass::AmbiguousColumn { identifiers } => {
            repair_ambiguous_columns(identifiers, sql, ctx)
        }
        ErrorClass::Timeout => Some(repair_timeout(sql)),
        ErrorClass::Opaque => None,
    }
}

/// Missing identifiers: qualify dotted names through the join path, or
/// fuzzy-rename bare names against known dimensions and aliases.
fn repair_missing_columns(
    identifiers: &[String],
    sql: &str,
    ctx: &RepairContext<'_>,
) -> Option<Repair> {
    let mut current = sql.to_string();
    let mut reasons = Vec::new();

    for identifier in identifiers {
        let replacement = if let Some((entity_surface, column)) = identifier.split_once('.') {
            qualify_via_join_path(entity_surface, column, ctx)
        } else {
            fuzzy_rename(identifier, ctx)
        };
        let Some(replacement) = replacement else {
            continue;
        };

        let (updated, changed) = replace_word_outside_strings(&current, identifier, &replacement);
        if changed {
            reasons.push(format!("replaced '{identifier}' with '{replacement}'"));
            current = updated;
        }
    }

    if reasons.is_empty() {
        None
    } else {
        debug!(substitutions = reasons.len(), "column repair applied");
        Some(Repair {
            sql: current,
            reason: reasons.join("; "),
        })
    }
}

fn qualify_via_join_path(
    entity_surface: &str,
    column: &str,
    ctx: &RepairContext<'_>,
) -> Option<String> {
    let entity = ctx.registry.get_by_surface(entity_surface)?;
    let alias = ctx.join_path?.alias(&entity.name)?;
    let canonical = entity.canonical_field(column).unwrap_or(column);
    Some(format!("{alias}.{}", quote_ident(canonical)))
}

/// Best fuzzy match across all dimensions and their aliases in all
/// loaded entities. Accepted when the edit distance is at most
/// `min(3, ceil(0.3 * len))`.
fn fuzzy_rename(identifier: &str, ctx: &RepairContext<'_>) -> Option<String> {
    let target = identifier.to_lowercase();
    let tolerance = fuzzy_tolerance(identifier);

    let mut best: Option<(usize, String)> = None;
    for entity in ctx.registry.iter_sorted() {
        for dim in entity.dimensions.iter().chain(entity.time_dimensions.iter()) {
            let mut surfaces = vec![dim.name.clone()];
            surfaces.extend(entity.aliases_of(&dim.name).iter().cloned());
            for surface in surfaces {
                let distance = levenshtein(&target, &surface.to_lowercase());
                if distance > tolerance {
                    continue;
                }
                // Canonical column, not the alias, goes into the SQL.
                let candidate = (distance, dim.name.clone());
                best = match best.take() {
                    None => Some(candidate),
                    Some(current) => {
                        if candidate.0 < current.0
                            || (candidate.0 == current.0 && candidate.1 < current.1)
                        {
                            Some(candidate)
                        } else {
                            Some(current)
                        }
                    }
                };
            }
        }
    }

    best.map(|(_, name)| name)
}

fn fuzzy_tolerance(identifier: &str) -> usize {
    let proportional = (identifier.len() as f64 * 0.3).ceil() as usize;
    proportional.min(3)
}

/// Ambiguous identifiers: qualify with the alias of the unique owning
/// entity. Identifiers owned by zero or several entities are skipped.
fn repair_ambiguous_columns(
    identifiers: &[String],
    sql: &str,
    ctx: &RepairContext<'_>,
) -> Option<Repair> {
    let mut current = sql.to_string();
    let mut reasons = Vec::new();

    for identifier in identifiers {
        let owners: Vec<_> = ctx
            .registry
            .iter_sorted()
            .into_iter()
            .filter(|e| e.field(identifier).is_some())
            .collect();
        if owners.len() != 1 {
            continue;
        }
        let owner = owners[0];
        let Some(alias) = ctx.join_path.and_then(|p| p.alias(&owner.name)) else {
            continue;
        };
        let canonical = owner.canonical_field(identifier).unwrap_or(identifier);
        let replacement = format!("{alias}.{}", quote_ident(canonical));

        let (updated, changed) = replace_word_outside_strings(&current, identifier, &replacement);
        if changed {
            reasons.push(format!("qualified '{identifier}' as '{replacement}'"));
            current = updated;
        }
    }

    if reasons.is_empty() {
        None
    } else {
        Some(Repair {
            sql: current,
            reason: reasons.join("; "),
        })
    }
}

/// Timeout: drop a trailing ORDER BY and make sure a LIMIT exists.
/// Always yields a candidate.
fn repair_timeout(sql: &str) -> Repair {
    let mut current = sql.trim_end().trim_end_matches(';').to_string();
    let mut reasons = Vec::new();

    if let Some(stripped) = strip_trailing_order_by(&current) {
        current = stripped;
        reasons.push("dropped trailing ORDER BY".to_string());
    }

    let has_limit = current.to_ascii_lowercase().contains("limit ");
    if !has_limit {
        current = format!("{}\nLIMIT {ROW_LIMIT}", current.trim_end());
        reasons.push(format!("appended LIMIT {ROW_LIMIT}"));
    }

    if reasons.is_empty() {
        reasons.push("re-ran unchanged after timeout".to_string());
    }

    Repair {
        sql: current,
        reason: reasons.join("; "),
    }
}

/// Heuristic ORDER BY removal: take the last `ORDER BY` occurrence; if
/// everything after it (up to an optional LIMIT) contains no closing
/// paren, it is a top-level sort and can be dropped.
fn strip_trailing_order_by(sql: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    let idx = lower.rfind("order by")?;
    let tail = &sql[idx..];

    let limit_offset = tail.to_ascii_lowercase().find("limit ");
    let clause = match limit_offset {
        Some(off) => &tail[..off],
        None => tail,
    };
    if clause.contains(')') {
        return None;
    }

    let mut out = sql[..idx].trim_end().to_string();
    if let Some(off) = limit_offset {
        out.push('\n');
        out.push_str(tail[off..].trim_end());
    }
    Some(out)
}

/// Replace a word-bounded identifier everywhere outside single-quoted
/// string literals. The match is case-insensitive; boundaries reject
/// adjacent word characters, dots, and double quotes so already-qualified
/// or already-quoted occurrences are left alone.
fn replace_word_outside_strings(sql: &str, target: &str, replacement: &str) -> (String, bool) {
    // ASCII-lowering keeps byte offsets aligned with the original text.
    let lower_sql = sql.to_ascii_lowercase();
    let lower_target = target.to_ascii_lowercase();
    if lower_target.is_empty() {
        return (sql.to_string(), false);
    }

    let protected = string_literal_mask(sql);
    let bytes = sql.as_bytes();

    let mut out = String::with_capacity(sql.len());
    let mut changed = false;
    let mut i = 0;

    while i < sql.len() {
        if let Some(found) = lower_sql[i..].find(&lower_target) {
            let start = i + found;
            let end = start + lower_target.len();

            out.push_str(&sql[i..start]);

            let boundary_ok = boundary_char_ok(bytes, start.checked_sub(1))
                && boundary_char_ok(bytes, Some(end).filter(|&e| e < bytes.len()));
            if boundary_ok && !protected[start] {
                out.push_str(replacement);
                changed = true;
            } else {
                out.push_str(&sql[start..end]);
            }
            i = end;
        } else {
            out.push_str(&sql[i..]);
            break;
        }
    }

    (out, changed)
}

fn boundary_char_ok(bytes: &[u8], index: Option<usize>) -> bool {
    match index {
        None => true,
        Some(i) => {
            let c = bytes[i] as char;
            !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '"')
        }
    }
}

/// Byte mask of positions inside single-quoted string literals.
fn string_literal_mask(sql: &str) -> Vec<bool> {
    let mut mask = vec![false; sql.len()];
    let mut in_string = false;
    for (i, c) in sql.char_indices() {
        if c == '\'' {
            in_string = !in_string;
            mask[i] = true;
        } else if in_string {
            mask[i] = true;
        }
    }
    mask
}
