use super::local_path;
use crate::catalog::ContentCatalogData;
use crate::error::{TroveError, TroveResult};
use crate::provider::{ProvideHandle, ProviderBehaviourFlags, ResourceProvider};
use std::path::Path;
use std::sync::Arc;
use trove_base::{ErasedObject, ResourceLocation, ResultType};

// Positions of the hash files in a catalog location's dependencies
const DEPENDENCY_INDEX_REMOTE: usize = 0;
const DEPENDENCY_INDEX_CACHE: usize = 1;

/// Where a freshly downloaded catalog should be cached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogCacheWrite {
    pub data_path: String,
    pub hash_path: String,
    pub hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogLoadPlan {
    pub id_to_load: String,
    pub save_to: Option<CatalogCacheWrite>,
}

/// Loads a catalog, choosing between the bundled copy, a cached download and a fresh remote copy.
///
/// A catalog location may have two dependencies, the remote hash and the cached hash (both loaded as
/// text). The catalog itself is loaded through `json_provider_id` as `ContentCatalogData`.
pub struct ContentCatalogProvider {
    provider_id: String,
    json_provider_id: String,
}

impl Default for ContentCatalogProvider {
    fn default() -> Self {
        ContentCatalogProvider {
            provider_id: Self::PROVIDER_ID.to_string(),
            json_provider_id: "JsonAssetProvider".to_string(),
        }
    }
}

fn hash_text(value: Option<&ErasedObject>) -> String {
    value
        .and_then(|x| x.clone().downcast::<String>().ok())
        .map(|x| x.trim().to_string())
        .unwrap_or_default()
}

impl ContentCatalogProvider {
    pub const PROVIDER_ID: &'static str = "ContentCatalogProvider";

    pub fn with_provider_id(
        mut self,
        provider_id: impl Into<String>,
    ) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_json_provider_id(
        mut self,
        json_provider_id: impl Into<String>,
    ) -> Self {
        self.json_provider_id = json_provider_id.into();
        self
    }

    /// Chooses the catalog id to load from the remote and cached hashes. Anything other than exactly
    /// two dependencies falls back to the location's own id.
    pub fn determine_id_to_load(
        location: &ResourceLocation,
        dependency_results: &[Option<ErasedObject>],
    ) -> CatalogLoadPlan {
        let mut plan = CatalogLoadPlan {
            id_to_load: location.internal_id().to_string(),
            save_to: None,
        };

        let dependencies = location.dependencies();
        if dependency_results.len() != 2 || dependencies.len() != 2 {
            return plan;
        }

        let remote_hash = hash_text(dependency_results[DEPENDENCY_INDEX_REMOTE].as_ref());
        let cached_hash = hash_text(dependency_results[DEPENDENCY_INDEX_CACHE].as_ref());
        let cache_id = dependencies[DEPENDENCY_INDEX_CACHE].internal_id();
        let cache_data_id = cache_id.replace(".hash", ".json");

        if remote_hash.is_empty() {
            // Offline, use the cached copy if there is one
            if !cached_hash.is_empty() {
                plan.id_to_load = cache_data_id;
            }
        } else if remote_hash == cached_hash {
            plan.id_to_load = cache_data_id;
        } else {
            plan.id_to_load = dependencies[DEPENDENCY_INDEX_REMOTE]
                .internal_id()
                .replace(".hash", ".json");
            plan.save_to = Some(CatalogCacheWrite {
                data_path: cache_data_id,
                hash_path: cache_id.to_string(),
                hash: remote_hash,
            });
        }

        plan
    }

    fn write_cache(
        cache_write: &CatalogCacheWrite,
        catalog: &ContentCatalogData,
    ) -> TroveResult<()> {
        let data_path = Path::new(local_path(&cache_write.data_path));
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(data_path, catalog.to_json()?)?;
        std::fs::write(local_path(&cache_write.hash_path), &cache_write.hash)?;
        log::info!("Cached catalog {} at {}", catalog.locator_id, cache_write.data_path);
        Ok(())
    }
}

impl ResourceProvider for ContentCatalogProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn default_type(
        &self,
        _location: &ResourceLocation,
    ) -> ResultType {
        ResultType::single::<ContentCatalogData>()
    }

    // A missing remote or cached hash just means there is nothing to compare against
    fn behaviour_flags(&self) -> ProviderBehaviourFlags {
        ProviderBehaviourFlags::CAN_PROVIDE_WITH_FAILED_DEPENDENCIES
    }

    fn provide(
        &self,
        handle: ProvideHandle,
    ) {
        let plan = Self::determine_id_to_load(handle.location(), &handle.dependencies());
        log::debug!("Loading catalog {} from {}", handle.location(), plan.id_to_load);

        let manager = match handle.manager() {
            Ok(manager) => manager,
            Err(e) => {
                log::warn!("Catalog manager is gone: {}", e);
                return;
            }
        };

        let location = Arc::new(ResourceLocation::new(
            plan.id_to_load.clone(),
            plan.id_to_load.clone(),
            self.json_provider_id.clone(),
        ));
        let catalog = manager.provide_resource::<ContentCatalogData>(&location);

        // Owns the reference returned above, released once the catalog is complete
        let owned = catalog.clone();
        let completion_handle = handle.clone();
        let registered = catalog.on_completed(move |catalog| {
            let completed = match catalog.result() {
                Ok(Some(data)) => {
                    if let Some(cache_write) = &plan.save_to {
                        if let Err(e) = Self::write_cache(cache_write, &data) {
                            log::warn!("Failed to cache catalog {}: {}", plan.id_to_load, e);
                        }
                    }
                    completion_handle.complete_erased(Some(data as ErasedObject), true, None)
                }
                _ => {
                    let error = catalog
                        .operation_error()
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| {
                            TroveError::ProvideFailed(format!(
                                "Unable to load catalog at {}",
                                plan.id_to_load
                            ))
                        });
                    completion_handle.fail(error)
                }
            };

            if let Err(e) = completed {
                log::warn!("Could not complete catalog load: {}", e);
            }

            if let Err(e) = owned.release() {
                log::error!("Failed to release catalog load: {}", e);
            }
        });

        if let Err(e) = registered {
            if let Err(e) = handle.fail(e) {
                log::warn!("Could not fail catalog load: {}", e);
            }
        }
    }
}
