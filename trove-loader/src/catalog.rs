use crate::error::{TroveError, TroveResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trove_base::hashing::HashMap;
use trove_base::ResourceLocation;

/// Maps keys to the locations that can be loaded for them
pub trait ResourceLocator: Send + Sync {
    fn locator_id(&self) -> &str;

    fn locate(
        &self,
        key: &str,
    ) -> Option<Vec<Arc<ResourceLocation>>>;
}

#[derive(Default)]
pub struct ResourceLocationMap {
    locator_id: String,
    locations: HashMap<String, Vec<Arc<ResourceLocation>>>,
}

impl ResourceLocationMap {
    pub fn new(locator_id: impl Into<String>) -> Self {
        ResourceLocationMap {
            locator_id: locator_id.into(),
            locations: Default::default(),
        }
    }

    pub fn add(
        &mut self,
        key: impl Into<String>,
        location: Arc<ResourceLocation>,
    ) {
        self.locations
            .entry(key.into())
            .or_default()
            .push(location);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.locations.keys().map(|x| x.as_str())
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

impl ResourceLocator for ResourceLocationMap {
    fn locator_id(&self) -> &str {
        &self.locator_id
    }

    fn locate(
        &self,
        key: &str,
    ) -> Option<Vec<Arc<ResourceLocation>>> {
        self.locations.get(key).cloned()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentCatalogEntry {
    pub keys: Vec<String>,
    pub internal_id: String,
    pub provider_id: String,
    // Keys of other entries that must be loaded first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Serialized form of a catalog
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentCatalogData {
    pub locator_id: String,
    #[serde(default)]
    pub provider_ids: Vec<String>,
    pub entries: Vec<ContentCatalogEntry>,
}

impl ContentCatalogData {
    pub fn from_json(json: &str) -> TroveResult<Self> {
        profiling::scope!("ContentCatalogData::from_json");
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> TroveResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Builds every entry into a location, registered under each of the entry's keys. Dependencies
    /// are resolved by key and may appear in any order, cycles are an error.
    pub fn create_locator(&self) -> TroveResult<ResourceLocationMap> {
        let mut entries_by_key: HashMap<&str, Vec<usize>> = HashMap::default();
        for (index, entry) in self.entries.iter().enumerate() {
            for key in &entry.keys {
                entries_by_key.entry(key.as_str()).or_default().push(index);
            }
        }

        let mut builder = LocationBuilder {
            catalog: self,
            entries_by_key,
            built: vec![None; self.entries.len()],
            visiting: vec![false; self.entries.len()],
        };

        let mut map = ResourceLocationMap::new(self.locator_id.clone());
        for (index, entry) in self.entries.iter().enumerate() {
            let location = builder.build(index)?;
            for key in &entry.keys {
                map.add(key.clone(), location.clone());
            }
        }

        Ok(map)
    }
}

struct LocationBuilder<'a> {
    catalog: &'a ContentCatalogData,
    entries_by_key: HashMap<&'a str, Vec<usize>>,
    built: Vec<Option<Arc<ResourceLocation>>>,
    visiting: Vec<bool>,
}

impl<'a> LocationBuilder<'a> {
    fn build(
        &mut self,
        index: usize,
    ) -> TroveResult<Arc<ResourceLocation>> {
        if let Some(location) = &self.built[index] {
            return Ok(location.clone());
        }

        let catalog = self.catalog;
        let entry = &catalog.entries[index];
        if self.visiting[index] {
            return Err(TroveError::StringError(format!(
                "Catalog {} has a dependency cycle through {}",
                catalog.locator_id, entry.internal_id
            )));
        }

        if entry.internal_id.is_empty() || entry.provider_id.is_empty() {
            return Err(TroveError::StringError(format!(
                "Catalog {} has an entry without an internal id or provider id",
                catalog.locator_id
            )));
        }

        self.visiting[index] = true;
        let mut dependencies = Vec::default();
        for key in &entry.dependencies {
            let dependency_indices = self.entries_by_key.get(key.as_str()).cloned();
            let dependency_indices = dependency_indices.ok_or_else(|| {
                TroveError::StringError(format!(
                    "Catalog {} entry {} depends on unknown key {}",
                    catalog.locator_id, entry.internal_id, key
                ))
            })?;

            for dependency_index in dependency_indices {
                dependencies.push(self.build(dependency_index)?);
            }
        }
        self.visiting[index] = false;

        let primary_key = entry
            .keys
            .first()
            .cloned()
            .unwrap_or_else(|| entry.internal_id.clone());
        let mut location =
            ResourceLocation::new(primary_key, entry.internal_id.clone(), entry.provider_id.clone())
                .with_dependencies(dependencies);
        if let Some(data) = &entry.data {
            location = location.with_data(data.clone());
        }

        let location = Arc::new(location);
        self.built[index] = Some(location.clone());
        Ok(location)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(
        keys: &[&str],
        internal_id: &str,
        provider_id: &str,
        dependencies: &[&str],
    ) -> ContentCatalogEntry {
        ContentCatalogEntry {
            keys: keys.iter().map(|x| x.to_string()).collect(),
            internal_id: internal_id.to_string(),
            provider_id: provider_id.to_string(),
            dependencies: dependencies.iter().map(|x| x.to_string()).collect(),
            data: None,
        }
    }

    #[test]
    fn check_create_locator_resolves_dependencies() {
        let catalog = ContentCatalogData {
            locator_id: "main".to_string(),
            provider_ids: vec!["SyncArchiveProvider".to_string()],
            entries: vec![
                entry(&["hero", "characters/hero"], "hero", "BundledAssetProvider", &["chars.bundle"]),
                entry(&["chars.bundle"], "chars.bundle", "SyncArchiveProvider", &[]),
            ],
        };

        let json = catalog.to_json().unwrap();
        let catalog = ContentCatalogData::from_json(&json).unwrap();
        let locator = catalog.create_locator().unwrap();
        assert_eq!(locator.locator_id(), "main");
        assert_eq!(locator.len(), 3);

        let hero = locator.locate("characters/hero").unwrap();
        assert_eq!(hero.len(), 1);
        assert_eq!(hero[0].primary_key(), "hero");
        assert_eq!(hero[0].dependencies().len(), 1);
        assert_eq!(hero[0].dependencies()[0].internal_id(), "chars.bundle");

        // Both keys share one location
        let by_other_key = locator.locate("hero").unwrap();
        assert!(Arc::ptr_eq(&hero[0], &by_other_key[0]));

        // The dependency is the same location registered under its own key
        let bundle = locator.locate("chars.bundle").unwrap();
        assert!(Arc::ptr_eq(&hero[0].dependencies()[0], &bundle[0]));

        assert!(locator.locate("missing").is_none());
    }

    #[test]
    fn check_create_locator_rejects_cycles() {
        let catalog = ContentCatalogData {
            locator_id: "cyclic".to_string(),
            provider_ids: Vec::default(),
            entries: vec![
                entry(&["a"], "a", "P", &["b"]),
                entry(&["b"], "b", "P", &["a"]),
            ],
        };
        assert!(catalog.create_locator().is_err());

        let catalog = ContentCatalogData {
            locator_id: "unknown".to_string(),
            provider_ids: Vec::default(),
            entries: vec![entry(&["a"], "a", "P", &["nope"])],
        };
        assert!(catalog.create_locator().is_err());
    }
}
