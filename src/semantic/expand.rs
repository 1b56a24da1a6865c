//! Macro expansion over SQL field expressions.
//!
//! Dimension and measure SQL may reference other fields through three
//! token forms:
//!
//! - `{CUBE}.FIELD`: FIELD resolved (canonical or alias) in the current
//!   entity.
//! - `{FIELD}`: same resolution rule.
//! - `{ENTITY.FIELD}`: resolved within ENTITY, which must carry a table
//!   alias in the current join context.
//!
//! A field whose own `sql` is a simple `{CUBE}.COL` (or `{E.COL}`) lowers
//! to `alias.COL`; anything else is expanded recursively in the owning
//! entity's context. A stack of `entity.field` keys along the expansion
//! path detects cycles.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::entity::{Entity, Registry};

/// Errors raised during macro expansion. Fatal for the request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MacroError {
    #[error("entity '{entity}': field '{field}' not found during macro expansion")]
    FieldNotFound { entity: String, field: String },

    #[error("unknown entity '{name}' referenced in macro expansion")]
    UnknownEntity { name: String },

    #[error("entity '{entity}' has no table alias in the current join context")]
    MissingAlias { entity: String },

    #[error("cyclic macro expansion: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("expected a simple column token, got '{token}'")]
    NotSimple { token: String },
}

/// Context for one expansion: the loaded registry and the table alias of
/// every entity participating in the join.
#[derive(Debug, Clone, Copy)]
pub struct ExpandContext<'a> {
    pub registry: &'a Registry,
    pub aliases: &'a HashMap<String, String>,
}

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_.]+)\}(\.([A-Za-z0-9_]+))?").unwrap());
static SIMPLE_CUBE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{CUBE\}\.([A-Za-z0-9_]+)$").unwrap());
static SIMPLE_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{([A-Za-z0-9_]+)\.([A-Za-z0-9_]+)\}$").unwrap());
static SIMPLE_COLUMN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Double-quote a SQL identifier, escaping embedded double quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Expand every macro token in `expr` within `entity`'s context.
///
/// Pure: identical inputs produce identical output. An expression without
/// tokens is returned unchanged.
pub fn expand_expr(
    ctx: ExpandContext<'_>,
    entity: &Entity,
    expr: &str,
) -> Result<String, MacroError> {
    let mut stack = Vec::new();
    expand_inner(ctx, entity, expr, &mut stack)
}

fn expand_inner(
    ctx: ExpandContext<'_>,
    entity: &Entity,
    expr: &str,
    stack: &mut Vec<String>,
) -> Result<String, MacroError> {
    let mut out = String::with_capacity(expr.len());
    let mut last = 0;

    for caps in TOKEN_RE.captures_iter(expr) {
        let whole = caps.get(0).unwrap();
        out.push_str(&expr[last..whole.start()]);
        last = whole.end();

        let inner = &caps[1];
        let suffix = caps.get(3).map(|m| m.as_str());

        let replacement = if inner == "CUBE" {
            match suffix {
                // {CUBE}.FIELD
                Some(field) => resolve_field(ctx, entity, field, stack)?,
                // A bare {CUBE} stands for the current table alias.
                None => alias_of(ctx, entity)?.to_string(),
            }
        } else if let Some((entity_name, field)) = inner.split_once('.') {
            // {ENTITY.FIELD}
            let target = ctx
                .registry
                .get_by_surface(entity_name)
                .ok_or_else(|| MacroError::UnknownEntity {
                    name: entity_name.to_string(),
                })?
                .clone();
            if !ctx.aliases.contains_key(&target.name) {
                return Err(MacroError::MissingAlias {
                    entity: target.name.clone(),
                });
            }
            let mut resolved = resolve_field(ctx, &target, field, stack)?;
            if let Some(extra) = suffix {
                // `{E.FIELD}.X` keeps the literal suffix.
                resolved.push('.');
                resolved.push_str(extra);
            }
            resolved
        } else {
            // {FIELD}
            let mut resolved = resolve_field(ctx, entity, inner, stack)?;
            if let Some(extra) = suffix {
                resolved.push('.');
                resolved.push_str(extra);
            }
            resolved
        };

        out.push_str(&replacement);
    }
    out.push_str(&expr[last..]);
    Ok(out)
}

/// Resolve one field reference to SQL within `entity`.
fn resolve_field(
    ctx: ExpandContext<'_>,
    entity: &Entity,
    surface: &str,
    stack: &mut Vec<String>,
) -> Result<String, MacroError> {
    let field = entity
        .field(surface)
        .ok_or_else(|| MacroError::FieldNotFound {
            entity: entity.name.clone(),
            field: surface.to_string(),
        })?;

    let key = format!("{}.{}", entity.name, field.name);
    if stack.contains(&key) {
        let mut path = stack.clone();
        path.push(key);
        return Err(MacroError::Cycle { path });
    }

    // A simple {CUBE}.COL lowers straight to alias.COL.
    if let Some(caps) = SIMPLE_CUBE_RE.captures(&field.sql) {
        return Ok(format!("{}.{}", alias_of(ctx, entity)?, &caps[1]));
    }
    // A simple {E.COL} lowers to E's alias.
    if let Some(caps) = SIMPLE_REF_RE.captures(&field.sql) {
        let target = ctx
            .registry
            .get_by_surface(&caps[1])
            .ok_or_else(|| MacroError::UnknownEntity {
                name: caps[1].to_string(),
            })?
            .clone();
        return Ok(format!("{}.{}", alias_of(ctx, &target)?, &caps[2]));
    }

    stack.push(key);
    let expanded = expand_inner(ctx, entity, &field.sql, stack)?;
    stack.pop();
    Ok(expanded)
}

fn alias_of<'a>(ctx: ExpandContext<'a>, entity: &Entity) -> Result<&'a str, MacroError> {
    ctx.aliases
        .get(&entity.name)
        .map(|s| s.as_str())
        .ok_or_else(|| MacroError::MissingAlias {
            entity: entity.name.clone(),
        })
}

/// One field reference found in an expression, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprRef {
    /// `Some` for `{ENTITY.FIELD}` tokens, `None` for same-entity tokens.
    pub entity: Option<String>,
    pub field: String,
}

/// List the field references an expression's macro tokens name, without
/// resolving them. Used for selective descriptor hydration.
pub fn expression_dependencies(expr: &str) -> Vec<ExprRef> {
    let mut refs = Vec::new();
    for caps in TOKEN_RE.captures_iter(expr) {
        let inner = &caps[1];
        let suffix = caps.get(3).map(|m| m.as_str());

        let item = if inner == "CUBE" {
            match suffix {
                Some(field) => ExprRef {
                    entity: None,
                    field: field.to_string(),
                },
                None => continue,
            }
        } else if let Some((entity, field)) = inner.split_once('.') {
            ExprRef {
                entity: Some(entity.to_string()),
                field: field.to_string(),
            }
        } else {
            ExprRef {
                entity: None,
                field: inner.to_string(),
            }
        };
        if !refs.contains(&item) {
            refs.push(item);
        }
    }
    refs
}

/// Qualify an exact simple column token as `alias."COL"`.
///
/// Used by the renderer for JOIN key predicates, where identifier quoting
/// is required.
pub fn qualify_simple_column(
    ctx: ExpandContext<'_>,
    entity: &Entity,
    column: &str,
) -> Result<String, MacroError> {
    if !SIMPLE_COLUMN_RE.is_match(column) {
        return Err(MacroError::NotSimple {
            token: column.to_string(),
        });
    }
    Ok(format!("{}.{}", alias_of(ctx, entity)?, quote_ident(column)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::entity::fixtures;
    use crate::semantic::entity::Dimension;
    use std::sync::Arc;

    fn aliases() -> HashMap<String, String> {
        HashMap::from([
            ("accounts".to_string(), "t0".to_string()),
            ("companies".to_string(), "t1".to_string()),
        ])
    }

    #[test]
    fn test_simple_cube_token() {
        let registry = fixtures::registry();
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        let out = expand_expr(ctx, &accounts, "{CUBE}.ACCOUNT_TIER").unwrap();
        assert_eq!(out, "t0.ACCOUNT_TIER");
    }

    #[test]
    fn test_bare_field_and_alias_token() {
        let registry = fixtures::registry();
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        assert_eq!(expand_expr(ctx, &accounts, "{ACCOUNT_TIER}").unwrap(), "t0.ACCOUNT_TIER");
        // Alias resolves to the canonical column.
        assert_eq!(expand_expr(ctx, &accounts, "{tier}").unwrap(), "t0.ACCOUNT_TIER");
    }

    #[test]
    fn test_cross_entity_token() {
        let registry = fixtures::registry();
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        let out = expand_expr(ctx, &accounts, "{companies.NAME}").unwrap();
        assert_eq!(out, "t1.NAME");
    }

    #[test]
    fn test_cross_entity_without_alias_fails() {
        let registry = fixtures::registry();
        let aliases = HashMap::from([("accounts".to_string(), "t0".to_string())]);
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        let err = expand_expr(ctx, &accounts, "{companies.NAME}").unwrap_err();
        assert!(matches!(err, MacroError::MissingAlias { .. }));
    }

    #[test]
    fn test_composite_expression_recurses() {
        let mut accounts = fixtures::accounts();
        accounts.dimensions.push(Dimension {
            name: "TIER_LABEL".to_string(),
            sql: "UPPER({ACCOUNT_TIER})".to_string(),
            data_type: "string".to_string(),
            description: None,
            aliases: Vec::new(),
            primary_key: false,
        });
        accounts.finish().unwrap();

        let mut registry = fixtures::registry();
        registry.insert(Arc::new(accounts));
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        let out = expand_expr(ctx, &accounts, "{TIER_LABEL}").unwrap();
        assert_eq!(out, "UPPER(t0.ACCOUNT_TIER)");
    }

    #[test]
    fn test_cycle_detection() {
        let mut accounts = fixtures::accounts();
        accounts.dimensions.push(Dimension {
            name: "A".to_string(),
            sql: "LOWER({B})".to_string(),
            data_type: "string".to_string(),
            description: None,
            aliases: Vec::new(),
            primary_key: false,
        });
        accounts.dimensions.push(Dimension {
            name: "B".to_string(),
            sql: "UPPER({A})".to_string(),
            data_type: "string".to_string(),
            description: None,
            aliases: Vec::new(),
            primary_key: false,
        });
        accounts.finish().unwrap();

        let mut registry = fixtures::registry();
        registry.insert(Arc::new(accounts));
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        let err = expand_expr(ctx, &accounts, "{A}").unwrap_err();
        assert!(matches!(err, MacroError::Cycle { .. }));
    }

    #[test]
    fn test_unknown_field_names_entity() {
        let registry = fixtures::registry();
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        let err = expand_expr(ctx, &accounts, "{NOPE}").unwrap_err();
        assert_eq!(
            err,
            MacroError::FieldNotFound {
                entity: "accounts".to_string(),
                field: "NOPE".to_string()
            }
        );
    }

    #[test]
    fn test_expansion_is_idempotent_on_simple_tokens() {
        let registry = fixtures::registry();
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        let once = expand_expr(ctx, &accounts, "{CUBE}.COMPANY_ID").unwrap();
        let twice = expand_expr(ctx, &accounts, &once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_qualify_simple_column() {
        let registry = fixtures::registry();
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        let out = qualify_simple_column(ctx, &accounts, "COMPANY_ID").unwrap();
        assert_eq!(out, "t0.\"COMPANY_ID\"");

        let err = qualify_simple_column(ctx, &accounts, "a.b").unwrap_err();
        assert!(matches!(err, MacroError::NotSimple { .. }));
    }

    #[test]
    fn test_no_tokens_passes_through() {
        let registry = fixtures::registry();
        let aliases = aliases();
        let ctx = ExpandContext {
            registry: &registry,
            aliases: &aliases,
        };
        let accounts = registry.get("accounts").unwrap().clone();

        assert_eq!(expand_expr(ctx, &accounts, "1 + 1").unwrap(), "1 + 1");
    }
}
