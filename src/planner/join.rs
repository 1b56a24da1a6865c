//! Shortest-path join planning with deterministic aliasing.
//!
//! Declared joins form an undirected graph over entities; each declared
//! edge is traversable in both directions, with the key fields swapped
//! and the cardinality reversed on the way back. The planner takes the
//! union of BFS shortest paths from the base to every required entity,
//! deduplicated by `(from, to, from_field=to_field)`, preserving the
//! traversal direction of first discovery.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use super::plan::{PlanError, PlanResult};
use crate::semantic::{Cardinality, Registry};

/// One traversed join edge, in traversal direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinEdge {
    pub from: String,
    pub to: String,
    pub from_field: String,
    pub to_field: String,
    pub relationship: Cardinality,
}

/// The minimal join subgraph connecting a base entity to every required
/// entity, with deterministic table aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPath {
    pub edges: Vec<JoinEdge>,
    /// entity name → table alias (`t0`, `t1`, …).
    pub alias_by_entity: HashMap<String, String>,
    /// Base first, then every other joined entity in lexicographic order.
    pub ordered_entities: Vec<String>,
}

impl JoinPath {
    /// Alias of an entity, if it participates in the join.
    pub fn alias(&self, entity: &str) -> Option<&str> {
        self.alias_by_entity.get(entity).map(|s| s.as_str())
    }
}

/// Compute the join path from `base` to all of `required`.
///
/// Deterministic: identical inputs produce identical edges, aliases, and
/// ordering.
pub fn compute_join_path(
    base: &str,
    required: &[String],
    registry: &Registry,
) -> PlanResult<JoinPath> {
    if !registry.contains(base) {
        return Err(PlanError::UnknownEntity(base.to_string()));
    }
    for name in required {
        if !registry.contains(name) {
            return Err(PlanError::UnknownEntity(name.clone()));
        }
    }

    let (graph, node_of) = build_graph(registry);

    let mut edges: Vec<JoinEdge> = Vec::new();
    let mut seen: HashSet<(String, String, String, String)> = HashSet::new();

    for target in required {
        if target == base {
            continue;
        }
        let path = bfs_path(&graph, &node_of, base, target).ok_or_else(|| {
            PlanError::Unreachable {
                base: base.to_string(),
                target: target.clone(),
            }
        })?;
        for edge in path {
            let key = (
                edge.from.clone(),
                edge.to.clone(),
                edge.from_field.clone(),
                edge.to_field.clone(),
            );
            if seen.insert(key) {
                edges.push(edge);
            }
        }
    }

    // Base gets t0; the rest of the joined entities get t1, t2, ... in
    // lexicographic order.
    let mut others: Vec<String> = edges
        .iter()
        .flat_map(|e| [e.from.clone(), e.to.clone()])
        .filter(|name| name != base)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    others.sort_unstable();

    let mut alias_by_entity = HashMap::new();
    alias_by_entity.insert(base.to_string(), "t0".to_string());
    for (i, name) in others.iter().enumerate() {
        alias_by_entity.insert(name.clone(), format!("t{}", i + 1));
    }

    let mut ordered_entities = Vec::with_capacity(others.len() + 1);
    ordered_entities.push(base.to_string());
    ordered_entities.extend(others);

    Ok(JoinPath {
        edges,
        alias_by_entity,
        ordered_entities,
    })
}

/// Directed record of a traversable join.
#[derive(Debug, Clone)]
struct EdgeRecord {
    from_field: String,
    to_field: String,
    relationship: Cardinality,
}

/// Build the traversal graph: both directions for every declared join.
///
/// Entities and edges are added in sorted order so traversal is
/// deterministic regardless of registry iteration order.
fn build_graph(registry: &Registry) -> (DiGraph<String, EdgeRecord>, HashMap<String, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut node_of = HashMap::new();

    for entity in registry.iter_sorted() {
        let idx = graph.add_node(entity.name.clone());
        node_of.insert(entity.name.clone(), idx);
    }

    for entity in registry.iter_sorted() {
        let Some(&from_idx) = node_of.get(&entity.name) else {
            continue;
        };
        for join in &entity.joins {
            let Some(&to_idx) = node_of.get(&join.target_entity) else {
                // Target not loaded; the edge is unusable this request.
                continue;
            };
            graph.add_edge(
                from_idx,
                to_idx,
                EdgeRecord {
                    from_field: join.from_field.clone(),
                    to_field: join.to_field.clone(),
                    relationship: join.relationship,
                },
            );
            graph.add_edge(
                to_idx,
                from_idx,
                EdgeRecord {
                    from_field: join.to_field.clone(),
                    to_field: join.from_field.clone(),
                    relationship: join.relationship.reverse(),
                },
            );
        }
    }

    (graph, node_of)
}

/// BFS shortest path, reconstructed as traversal-direction edges.
fn bfs_path(
    graph: &DiGraph<String, EdgeRecord>,
    node_of: &HashMap<String, NodeIndex>,
    base: &str,
    target: &str,
) -> Option<Vec<JoinEdge>> {
    let start = *node_of.get(base)?;
    let goal = *node_of.get(target)?;

    let mut queue = VecDeque::new();
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut predecessor: HashMap<NodeIndex, (NodeIndex, EdgeRecord)> = HashMap::new();

    queue.push_back(start);
    visited.insert(start);

    while let Some(node) = queue.pop_front() {
        if node == goal {
            break;
        }
        // Sort neighbors by name so tie-breaks between equal-length paths
        // are stable.
        let mut neighbors: Vec<(NodeIndex, EdgeRecord)> = graph
            .edges(node)
            .map(|edge| (edge.target(), edge.weight().clone()))
            .collect();
        neighbors.sort_by(|a, b| {
            graph[a.0]
                .cmp(&graph[b.0])
                .then_with(|| a.1.from_field.cmp(&b.1.from_field))
                .then_with(|| a.1.to_field.cmp(&b.1.to_field))
        });

        for (next, record) in neighbors {
            if visited.insert(next) {
                predecessor.insert(next, (node, record));
                queue.push_back(next);
            }
        }
    }

    if !visited.contains(&goal) {
        return None;
    }

    let mut path = Vec::new();
    let mut node = goal;
    while node != start {
        let (prev, record) = predecessor.get(&node)?.clone();
        path.push(JoinEdge {
            from: graph[prev].clone(),
            to: graph[node].clone(),
            from_field: record.from_field,
            to_field: record.to_field,
            relationship: record.relationship,
        });
        node = prev;
    }
    path.reverse();
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::entity::fixtures;
    use crate::semantic::entity::{Cardinality, Entity, JoinDef};
    use std::sync::Arc;

    fn three_hop_registry() -> Registry {
        // accounts -> companies (declared on accounts), people -> companies.
        let mut registry = fixtures::registry();

        let mut people = Entity::new("people", "dwh_prod.crm.people", "one row per person")
            .with_dimension(fixtures::dim("ID"))
            .with_dimension(fixtures::dim("COMPANY_ID"))
            .with_dimension(fixtures::dim("NAME"))
            .with_join(JoinDef {
                target_entity: "companies".to_string(),
                relationship: Cardinality::ManyToOne,
                from_field: "COMPANY_ID".to_string(),
                to_field: "ID".to_string(),
            });
        people.finish().unwrap();
        registry.insert(Arc::new(people));
        registry
    }

    #[test]
    fn test_single_entity_path_is_empty() {
        let registry = fixtures::registry();
        let path = compute_join_path("accounts", &["accounts".to_string()], &registry).unwrap();
        assert!(path.edges.is_empty());
        assert_eq!(path.alias("accounts"), Some("t0"));
        assert_eq!(path.ordered_entities, vec!["accounts"]);
    }

    #[test]
    fn test_direct_edge() {
        let registry = fixtures::registry();
        let path = compute_join_path(
            "accounts",
            &["accounts".to_string(), "companies".to_string()],
            &registry,
        )
        .unwrap();

        assert_eq!(path.edges.len(), 1);
        let edge = &path.edges[0];
        assert_eq!(edge.from, "accounts");
        assert_eq!(edge.to, "companies");
        assert_eq!(edge.from_field, "COMPANY_ID");
        assert_eq!(edge.to_field, "ID");
        assert_eq!(edge.relationship, Cardinality::ManyToOne);

        assert_eq!(path.alias("accounts"), Some("t0"));
        assert_eq!(path.alias("companies"), Some("t1"));
    }

    #[test]
    fn test_reverse_traversal() {
        // Path declared on accounts but traversed from companies.
        let registry = fixtures::registry();
        let path = compute_join_path(
            "companies",
            &["companies".to_string(), "accounts".to_string()],
            &registry,
        )
        .unwrap();

        assert_eq!(path.edges.len(), 1);
        let edge = &path.edges[0];
        assert_eq!(edge.from, "companies");
        assert_eq!(edge.to, "accounts");
        assert_eq!(edge.from_field, "ID");
        assert_eq!(edge.to_field, "COMPANY_ID");
        assert_eq!(edge.relationship, Cardinality::OneToMany);
    }

    #[test]
    fn test_two_hop_path_through_intermediate() {
        let registry = three_hop_registry();
        let path = compute_join_path(
            "accounts",
            &["accounts".to_string(), "people".to_string()],
            &registry,
        )
        .unwrap();

        assert_eq!(path.edges.len(), 2);
        assert_eq!(path.edges[0].from, "accounts");
        assert_eq!(path.edges[0].to, "companies");
        assert_eq!(path.edges[1].from, "companies");
        assert_eq!(path.edges[1].to, "people");

        // Intermediate entity is aliased too: companies < people.
        assert_eq!(path.alias("accounts"), Some("t0"));
        assert_eq!(path.alias("companies"), Some("t1"));
        assert_eq!(path.alias("people"), Some("t2"));
        assert_eq!(path.ordered_entities, vec!["accounts", "companies", "people"]);
    }

    #[test]
    fn test_unreachable_target() {
        let mut registry = fixtures::registry();
        let mut island = Entity::new("island", "dwh_prod.analytics.island", "isolated");
        island.finish().unwrap();
        registry.insert(Arc::new(island));

        let err = compute_join_path(
            "accounts",
            &["accounts".to_string(), "island".to_string()],
            &registry,
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::Unreachable {
                base: "accounts".to_string(),
                target: "island".to_string()
            }
        );
    }

    #[test]
    fn test_alias_determinism() {
        let registry = three_hop_registry();
        let required = vec![
            "accounts".to_string(),
            "people".to_string(),
            "companies".to_string(),
        ];
        let first = compute_join_path("accounts", &required, &registry).unwrap();
        for _ in 0..10 {
            let again = compute_join_path("accounts", &required, &registry).unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_unknown_entity() {
        let registry = fixtures::registry();
        let err =
            compute_join_path("ghost", &["ghost".to_string()], &registry).unwrap_err();
        assert_eq!(err, PlanError::UnknownEntity("ghost".to_string()));
    }
}
