//! Entity definitions: the declarative description of a warehouse table.
//!
//! An entity carries its physical table, row grain, dimensions (plus
//! time dimensions used as anchors for time-range predicates), measures,
//! metrics, and outgoing join edges. Loading an entity builds derived
//! name/alias indexes and checks cross-field invariants; those indexes are
//! never serialized.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{SemanticError, SemanticResult};

/// Cardinality of a join edge between entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    /// Does traversing this relationship cause row multiplication?
    pub fn causes_fanout(&self) -> bool {
        matches!(self, Cardinality::OneToMany | Cardinality::ManyToMany)
    }

    /// Get the reverse cardinality.
    pub fn reverse(&self) -> Self {
        match self {
            Cardinality::OneToOne => Cardinality::OneToOne,
            Cardinality::OneToMany => Cardinality::ManyToOne,
            Cardinality::ManyToOne => Cardinality::OneToMany,
            Cardinality::ManyToMany => Cardinality::ManyToMany,
        }
    }
}

impl std::fmt::Display for Cardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cardinality::OneToOne => write!(f, "1:1"),
            Cardinality::OneToMany => write!(f, "1:N"),
            Cardinality::ManyToOne => write!(f, "N:1"),
            Cardinality::ManyToMany => write!(f, "M:N"),
        }
    }
}

/// Aggregation recipe of a measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregationType {
    /// Every aggregation except plain `count` needs an input expression.
    pub fn requires_sql(&self) -> bool {
        !matches!(self, AggregationType::Count)
    }

    /// SQL function name for the simple (unfiltered) form.
    pub fn sql_function(&self) -> &'static str {
        match self {
            AggregationType::Count => "COUNT",
            AggregationType::CountDistinct => "COUNT",
            AggregationType::Sum => "SUM",
            AggregationType::Avg => "AVG",
            AggregationType::Min => "MIN",
            AggregationType::Max => "MAX",
        }
    }
}

/// Comparison operator of a structured filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
}

impl FilterOp {
    /// Does this operator take a list of values?
    pub fn is_list(&self) -> bool {
        matches!(self, FilterOp::In | FilterOp::NotIn)
    }

    /// SQL rendering of the scalar operators.
    pub fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::In => "IN",
            FilterOp::NotIn => "NOT IN",
        }
    }
}

/// A structured predicate: field, operator, values.
///
/// `in`/`not_in` require a non-empty value list; scalar operators exactly
/// one value. Values are JSON scalars (string, number, boolean).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredFilter {
    pub field: String,
    pub operator: FilterOp,
    pub values: Vec<serde_json::Value>,
}

impl StructuredFilter {
    /// Check operator/value arity and value shapes.
    pub fn check_arity(&self) -> Result<(), String> {
        if self.operator.is_list() {
            if self.values.is_empty() {
                return Err(format!(
                    "filter on '{}': '{}' requires a non-empty value list",
                    self.field,
                    self.operator.sql()
                ));
            }
        } else if self.values.len() != 1 {
            return Err(format!(
                "filter on '{}': '{}' requires exactly one value, got {}",
                self.field,
                self.operator.sql(),
                self.values.len()
            ));
        }
        for v in &self.values {
            if !(v.is_string() || v.is_number() || v.is_boolean()) {
                return Err(format!(
                    "filter on '{}': values must be scalars, got {}",
                    self.field, v
                ));
            }
        }
        Ok(())
    }
}

/// A named, typed column projection on an entity.
///
/// `sql` is a macro-expandable expression, commonly `{CUBE}.COL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    pub name: String,
    pub sql: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub primary_key: bool,
}

/// A named aggregation recipe on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Measure {
    pub name: String,
    pub agg: AggregationType,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Metric kind. Only atomic metrics (a wrapper around one measure) exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    Atomic,
}

/// A named, documented wrapper around one measure, optionally with
/// predicate filters, anchored on one of the entity's time dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: MetricKind,
    pub measure: String,
    #[serde(default)]
    pub anchor_date: Option<String>,
    #[serde(default)]
    pub filters: Vec<StructuredFilter>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// An outgoing join edge to another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinDef {
    pub target_entity: String,
    pub relationship: Cardinality,
    pub from_field: String,
    pub to_field: String,
}

/// Where a surface name points within an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldSlot {
    Dim(usize),
    Time(usize),
}

/// An entity: the declarative description of a single warehouse table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Entity {
    pub name: String,
    pub table: String,
    pub grain: String,
    pub description: Option<String>,
    pub aliases: Vec<String>,
    pub dimensions: Vec<Dimension>,
    pub time_dimensions: Vec<Dimension>,
    pub measures: Vec<Measure>,
    pub metrics: Vec<Metric>,
    pub joins: Vec<JoinDef>,
    pub common_filters: Vec<String>,

    // Derived indexes, rebuilt on load. Keys are lowercased surface names.
    #[serde(skip)]
    field_index: HashMap<String, FieldSlot>,
    #[serde(skip)]
    measure_index: HashMap<String, usize>,
    #[serde(skip)]
    metric_index: HashMap<String, usize>,
    #[serde(skip)]
    alias_to_canonical: HashMap<String, String>,
    #[serde(skip)]
    canonical_aliases: HashMap<String, Vec<String>>,
}

impl Entity {
    /// Create an entity with the required header fields. Populate it with
    /// the `with_*` builders, then call [`Entity::finish`].
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        grain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            grain: grain.into(),
            ..Default::default()
        }
    }

    /// Add a dimension.
    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    /// Add a time dimension.
    pub fn with_time_dimension(mut self, dimension: Dimension) -> Self {
        self.time_dimensions.push(dimension);
        self
    }

    /// Add a measure.
    pub fn with_measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    /// Add a metric.
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }

    /// Add an outgoing join edge.
    pub fn with_join(mut self, join: JoinDef) -> Self {
        self.joins.push(join);
        self
    }

    /// Build the derived indexes and check cross-field invariants.
    ///
    /// Called once by the store after deserialization. Fails on any
    /// invariant violation; a failed entity is never cached.
    pub fn finish(&mut self) -> SemanticResult<()> {
        self.build_indexes()?;
        self.check_invariants()
    }

    fn invariant(&self, message: impl Into<String>) -> SemanticError {
        SemanticError::Invariant {
            entity: self.name.clone(),
            message: message.into(),
        }
    }

    fn build_indexes(&mut self) -> SemanticResult<()> {
        self.field_index.clear();
        self.measure_index.clear();
        self.metric_index.clear();
        self.alias_to_canonical.clear();
        self.canonical_aliases.clear();

        let mut insert_field = |index: &mut HashMap<String, FieldSlot>,
                                aliases: &mut HashMap<String, String>,
                                reverse: &mut HashMap<String, Vec<String>>,
                                surface: &str,
                                canonical: &str,
                                slot: FieldSlot,
                                entity: &str|
         -> SemanticResult<()> {
            let key = surface.to_lowercase();
            if index.insert(key, slot).is_some() {
                return Err(SemanticError::Invariant {
                    entity: entity.to_string(),
                    message: format!("field surface name '{surface}' maps to more than one field"),
                });
            }
            if surface != canonical {
                aliases.insert(surface.to_lowercase(), canonical.to_string());
                reverse
                    .entry(canonical.to_string())
                    .or_default()
                    .push(surface.to_string());
            }
            Ok(())
        };

        for (i, dim) in self.dimensions.iter().enumerate() {
            insert_field(
                &mut self.field_index,
                &mut self.alias_to_canonical,
                &mut self.canonical_aliases,
                &dim.name,
                &dim.name,
                FieldSlot::Dim(i),
                &self.name,
            )?;
            for alias in &dim.aliases {
                insert_field(
                    &mut self.field_index,
                    &mut self.alias_to_canonical,
                    &mut self.canonical_aliases,
                    alias,
                    &dim.name,
                    FieldSlot::Dim(i),
                    &self.name,
                )?;
            }
        }
        for (i, dim) in self.time_dimensions.iter().enumerate() {
            insert_field(
                &mut self.field_index,
                &mut self.alias_to_canonical,
                &mut self.canonical_aliases,
                &dim.name,
                &dim.name,
                FieldSlot::Time(i),
                &self.name,
            )?;
            for alias in &dim.aliases {
                insert_field(
                    &mut self.field_index,
                    &mut self.alias_to_canonical,
                    &mut self.canonical_aliases,
                    alias,
                    &dim.name,
                    FieldSlot::Time(i),
                    &self.name,
                )?;
            }
        }

        for (i, measure) in self.measures.iter().enumerate() {
            if self
                .measure_index
                .insert(measure.name.to_lowercase(), i)
                .is_some()
            {
                return Err(self.invariant(format!("duplicate measure '{}'", measure.name)));
            }
        }

        for (i, metric) in self.metrics.iter().enumerate() {
            if self
                .metric_index
                .insert(metric.name.to_lowercase(), i)
                .is_some()
            {
                return Err(self.invariant(format!("duplicate metric '{}'", metric.name)));
            }
            for alias in &metric.aliases {
                if self.metric_index.insert(alias.to_lowercase(), i).is_some() {
                    return Err(self.invariant(format!(
                        "metric alias '{}' maps to more than one metric",
                        alias
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_invariants(&self) -> SemanticResult<()> {
        if self.name.is_empty() {
            return Err(self.invariant("entity name must not be empty"));
        }
        if self.table.split('.').count() < 2 {
            return Err(self.invariant(format!(
                "table '{}' must be schema-qualified (schema.table or db.schema.table)",
                self.table
            )));
        }

        // Join locality: every local field is a declared dimension.
        for join in &self.joins {
            if self.field(&join.from_field).is_none() {
                return Err(self.invariant(format!(
                    "join to '{}': local field '{}' is not a declared dimension",
                    join.target_entity, join.from_field
                )));
            }
        }

        // Metric source and anchor.
        for metric in &self.metrics {
            if self.measure(&metric.measure).is_none() {
                return Err(self.invariant(format!(
                    "metric '{}': measure '{}' does not exist",
                    metric.name, metric.measure
                )));
            }
            match &metric.anchor_date {
                None => {
                    return Err(self.invariant(format!(
                        "metric '{}': anchor_date is required",
                        metric.name
                    )))
                }
                Some(anchor) => {
                    if !self.is_time_dimension(anchor) {
                        return Err(self.invariant(format!(
                            "metric '{}': anchor_date '{}' is not a time dimension",
                            metric.name, anchor
                        )));
                    }
                }
            }
            for filter in &metric.filters {
                filter
                    .check_arity()
                    .map_err(|message| self.invariant(message))?;
            }
        }

        // Aggregation inputs.
        for measure in &self.measures {
            if measure.agg.requires_sql() && measure.sql.is_none() {
                return Err(self.invariant(format!(
                    "measure '{}': aggregation requires an sql expression",
                    measure.name
                )));
            }
        }

        Ok(())
    }

    /// Resolve a surface name (canonical or alias, case-insensitive) to a
    /// dimension or time dimension.
    pub fn field(&self, surface: &str) -> Option<&Dimension> {
        match self.field_index.get(&surface.to_lowercase())? {
            FieldSlot::Dim(i) => self.dimensions.get(*i),
            FieldSlot::Time(i) => self.time_dimensions.get(*i),
        }
    }

    /// Canonical name for a field surface name, if the surface resolves.
    pub fn canonical_field(&self, surface: &str) -> Option<&str> {
        self.field(surface).map(|d| d.name.as_str())
    }

    /// Is the surface name a time dimension of this entity?
    pub fn is_time_dimension(&self, surface: &str) -> bool {
        matches!(
            self.field_index.get(&surface.to_lowercase()),
            Some(FieldSlot::Time(_))
        )
    }

    /// The first declared time dimension, the default anchor for
    /// time-range predicates.
    pub fn first_time_dimension(&self) -> Option<&Dimension> {
        self.time_dimensions.first()
    }

    /// Resolve a measure by name (case-insensitive).
    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measure_index
            .get(&name.to_lowercase())
            .and_then(|i| self.measures.get(*i))
    }

    /// Resolve a metric by name or alias (case-insensitive).
    pub fn metric(&self, surface: &str) -> Option<&Metric> {
        self.metric_index
            .get(&surface.to_lowercase())
            .and_then(|i| self.metrics.get(*i))
    }

    /// Aliases declared for a canonical field name.
    pub fn aliases_of(&self, canonical: &str) -> &[String] {
        self.canonical_aliases
            .get(canonical)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// All field surface names (canonical and alias), lowercased.
    pub fn field_surfaces(&self) -> impl Iterator<Item = &String> {
        self.field_index.keys()
    }

    /// Schema part of the physical table identifier.
    ///
    /// `db.schema.table` and `schema.table` both resolve to `schema`;
    /// an unqualified name has none.
    pub fn schema(&self) -> Option<&str> {
        let parts: Vec<&str> = self.table.split('.').collect();
        if parts.len() >= 2 {
            Some(parts[parts.len() - 2])
        } else {
            None
        }
    }

    /// Does this surface name refer to the entity itself?
    pub fn matches_name(&self, surface: &str) -> bool {
        self.name.eq_ignore_ascii_case(surface)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(surface))
    }
}

/// An in-memory collection of loaded entities, keyed by name.
///
/// Borrowed read-only by the macro expander, join planner, renderer, and
/// validator within one request.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entities: HashMap<String, Arc<Entity>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity under its declared name.
    pub fn insert(&mut self, entity: Arc<Entity>) {
        self.entities.insert(entity.name.clone(), entity);
    }

    /// Look up an entity by exact name.
    pub fn get(&self, name: &str) -> Option<&Arc<Entity>> {
        self.entities.get(name)
    }

    /// Look up an entity by name or declared entity alias.
    pub fn get_by_surface(&self, surface: &str) -> Option<&Arc<Entity>> {
        if let Some(e) = self.entities.get(surface) {
            return Some(e);
        }
        self.entities.values().find(|e| e.matches_name(surface))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Entity names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Entities in name order, for deterministic traversal.
    pub fn iter_sorted(&self) -> Vec<&Arc<Entity>> {
        let mut entities: Vec<&Arc<Entity>> = self.entities.values().collect();
        entities.sort_by(|a, b| a.name.cmp(&b.name));
        entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
