//! Descriptor store: one JSON file per entity plus a catalog document.
//!
//! Entities are parsed, schema-validated, invariant-checked, and memoized
//! on first reference. The caches live for the process lifetime and are
//! dropped only by an explicit [`SemanticStore::reset`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::debug;

use super::catalog::Catalog;
use super::entity::Entity;
use super::error::{SemanticError, SemanticResult};

/// File name of the catalog document inside the model directory.
const CATALOG_FILE: &str = "_catalog.json";

/// Loads and caches entity descriptors from a directory tree.
pub struct SemanticStore {
    dir: PathBuf,
    entities: DashMap<String, Arc<Entity>>,
    catalog: Mutex<Option<Arc<Catalog>>>,
}

impl SemanticStore {
    /// Create a store over a model directory. The directory is not read
    /// until the first lookup.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entities: DashMap::new(),
            catalog: Mutex::new(None),
        }
    }

    /// The model directory this store reads from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Enumerate descriptor names: every `*.json` file except the catalog
    /// and other underscore-prefixed documents, sorted.
    pub fn list_entities(&self) -> SemanticResult<Vec<String>> {
        let read = fs::read_dir(&self.dir).map_err(|source| SemanticError::ModelDir {
            path: self.dir.clone(),
            source,
        })?;

        let mut names = Vec::new();
        for item in read {
            let item = item.map_err(|source| SemanticError::ModelDir {
                path: self.dir.clone(),
                source,
            })?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('_') {
                continue;
            }
            names.push(stem.to_string());
        }
        names.sort_unstable();
        Ok(names)
    }

    /// Load the catalog document, caching the snapshot.
    pub fn load_catalog(&self) -> SemanticResult<Arc<Catalog>> {
        let mut slot = self.catalog.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(snapshot) = slot.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let path = self.dir.join(CATALOG_FILE);
        if !path.exists() {
            return Err(SemanticError::CatalogNotFound(path));
        }
        let text = fs::read_to_string(&path).map_err(SemanticError::CatalogRead)?;
        let catalog: Catalog =
            serde_json::from_str(&text).map_err(SemanticError::CatalogParse)?;

        let snapshot = Arc::new(catalog);
        *slot = Some(Arc::clone(&snapshot));
        debug!(entities = snapshot.entities.len(), "catalog loaded");
        Ok(snapshot)
    }

    /// Load an entity by name: read, parse, validate, memoize.
    ///
    /// Repeated calls return the same `Arc`. A descriptor that fails any
    /// validation step is never cached.
    pub fn load_entity(&self, name: &str) -> SemanticResult<Arc<Entity>> {
        if let Some(cached) = self.entities.get(name) {
            return Ok(Arc::clone(&cached));
        }

        let path = self.descriptor_path(name);
        if !path.exists() {
            return Err(SemanticError::DescriptorNotFound {
                entity: name.to_string(),
                path,
            });
        }
        let text = fs::read_to_string(&path).map_err(|source| SemanticError::Read {
            entity: name.to_string(),
            source,
        })?;
        let mut entity: Entity =
            serde_json::from_str(&text).map_err(|source| SemanticError::Parse {
                entity: name.to_string(),
                source,
            })?;
        if entity.name != name {
            return Err(SemanticError::Invariant {
                entity: name.to_string(),
                message: format!(
                    "descriptor file '{name}.json' declares entity name '{}'",
                    entity.name
                ),
            });
        }
        entity.finish()?;

        let entity = Arc::new(entity);
        self.entities.insert(name.to_string(), Arc::clone(&entity));
        debug!(entity = name, "entity loaded");
        Ok(entity)
    }

    /// Load several entities, failing on the first error.
    pub fn load_entities(&self, names: &[String]) -> SemanticResult<Vec<Arc<Entity>>> {
        names.iter().map(|n| self.load_entity(n)).collect()
    }

    /// Raw descriptor text, for prompt injection.
    pub fn read_raw(&self, name: &str) -> SemanticResult<String> {
        let path = self.descriptor_path(name);
        if !path.exists() {
            return Err(SemanticError::DescriptorNotFound {
                entity: name.to_string(),
                path,
            });
        }
        fs::read_to_string(&path).map_err(|source| SemanticError::Read {
            entity: name.to_string(),
            source,
        })
    }

    /// Drop both caches. The next lookup re-reads from disk.
    pub fn reset(&self) {
        self.entities.clear();
        *self.catalog.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn descriptor_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::entity::fixtures;
    use std::io::Write;

    fn write_model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();

        let accounts = serde_json::to_string_pretty(&fixtures::accounts()).unwrap();
        let companies = serde_json::to_string_pretty(&fixtures::companies()).unwrap();
        fs::write(dir.path().join("accounts.json"), accounts).unwrap();
        fs::write(dir.path().join("companies.json"), companies).unwrap();

        let catalog = serde_json::json!({
            "version": 1,
            "entities": [
                {"name": "accounts", "grain": "one row per account"},
                {"name": "companies", "grain": "one row per company"}
            ]
        });
        let mut f = fs::File::create(dir.path().join(CATALOG_FILE)).unwrap();
        write!(f, "{catalog}").unwrap();

        dir
    }

    #[test]
    fn test_list_entities_sorted_without_catalog() {
        let dir = write_model_dir();
        let store = SemanticStore::new(dir.path());
        assert_eq!(store.list_entities().unwrap(), vec!["accounts", "companies"]);
    }

    #[test]
    fn test_load_entity_is_memoized() {
        let dir = write_model_dir();
        let store = SemanticStore::new(dir.path());

        let first = store.load_entity("accounts").unwrap();
        let second = store.load_entity("accounts").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        store.reset();
        let third = store.load_entity("accounts").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_load_entity_missing() {
        let dir = write_model_dir();
        let store = SemanticStore::new(dir.path());
        let err = store.load_entity("nope").unwrap_err();
        assert!(matches!(err, SemanticError::DescriptorNotFound { .. }));
    }

    #[test]
    fn test_invalid_descriptor_is_not_cached() {
        let dir = write_model_dir();
        fs::write(
            dir.path().join("broken.json"),
            r#"{"name": "broken", "table": "unqualified", "grain": "?"}"#,
        )
        .unwrap();
        let store = SemanticStore::new(dir.path());

        assert!(store.load_entity("broken").is_err());

        // A corrected descriptor loads after the failure.
        fs::write(
            dir.path().join("broken.json"),
            r#"{"name": "broken", "table": "analytics.broken", "grain": "?"}"#,
        )
        .unwrap();
        assert!(store.load_entity("broken").is_ok());
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let dir = write_model_dir();
        fs::write(
            dir.path().join("misnamed.json"),
            r#"{"name": "other", "table": "analytics.other", "grain": "?"}"#,
        )
        .unwrap();
        let store = SemanticStore::new(dir.path());
        let err = store.load_entity("misnamed").unwrap_err();
        assert!(err.to_string().contains("misnamed"));
    }

    #[test]
    fn test_load_catalog_cached() {
        let dir = write_model_dir();
        let store = SemanticStore::new(dir.path());

        let first = store.load_catalog().unwrap();
        let second = store.load_catalog().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.entities.len(), 2);
    }

    #[test]
    fn test_read_raw() {
        let dir = write_model_dir();
        let store = SemanticStore::new(dir.path());
        let raw = store.read_raw("accounts").unwrap();
        assert!(raw.contains("ACCOUNT_TIER"));
    }
}
