//! The entity catalog: a flat list of cards used for keyword recall
//! during Planning.

use serde::{Deserialize, Serialize};

/// A catalog document: version plus one card per entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    pub version: u32,
    pub entities: Vec<EntityCard>,
}

/// One catalog card: enough context to decide whether an entity is worth
/// loading, without hydrating the full descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EntityCard {
    pub name: String,
    pub grain: String,
    pub num_rows: Option<u64>,
    pub domain: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<String>,
    pub example_questions: Vec<String>,
    pub use_cases: Vec<String>,
    pub owners: Vec<String>,
    pub tags: Vec<String>,
}

impl Default for EntityCard {
    fn default() -> Self {
        Self {
            name: String::new(),
            grain: String::new(),
            num_rows: None,
            domain: None,
            description: None,
            fields: Vec::new(),
            example_questions: Vec::new(),
            use_cases: Vec::new(),
            owners: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// A scored catalog search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSearchHit {
    pub name: String,
    pub score: u32,
    pub grain: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl Catalog {
    /// Keyword-scored recall over name, description, example questions,
    /// and tags. Returns the top `limit` cards with a non-zero score,
    /// ordered by score descending then name.
    pub fn search(&self, query: &str, limit: usize) -> Vec<CatalogSearchHit> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<CatalogSearchHit> = self
            .entities
            .iter()
            .filter_map(|card| {
                let score = score_card(card, &tokens);
                if score == 0 {
                    return None;
                }
                Some(CatalogSearchHit {
                    name: card.name.clone(),
                    score,
                    grain: card.grain.clone(),
                    description: card.description.clone(),
                    tags: card.tags.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        hits.truncate(limit);
        hits
    }

    /// Look up a card by entity name.
    pub fn card(&self, name: &str) -> Option<&EntityCard> {
        self.entities.iter().find(|c| c.name == name)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

fn score_card(card: &EntityCard, tokens: &[String]) -> u32 {
    let name = card.name.to_lowercase();
    let description = card
        .description
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let questions = card.example_questions.join(" ").to_lowercase();
    let tags = card.tags.join(" ").to_lowercase();

    let mut score = 0;
    for token in tokens {
        if name.contains(token.as_str()) {
            score += 3;
        }
        if tags.contains(token.as_str()) {
            score += 2;
        }
        if questions.contains(token.as_str()) {
            score += 2;
        }
        if description.contains(token.as_str()) {
            score += 1;
        }
    }
    score
}
