use crate::archive::LoadedArchive;
use crate::error::TroveError;
use crate::provider::{ProvideHandle, ResourceProvider};
use trove_base::{ResourceLocation, ResultShape, ResultType};

/// Extracts a named object from an archive. The archive is expected among the location's
/// dependencies, the first one found is used. Array and list requests return every object stored
/// under the name.
pub struct BundledAssetProvider {
    provider_id: String,
}

impl Default for BundledAssetProvider {
    fn default() -> Self {
        BundledAssetProvider {
            provider_id: Self::PROVIDER_ID.to_string(),
        }
    }
}

impl BundledAssetProvider {
    pub const PROVIDER_ID: &'static str = "BundledAssetProvider";

    pub fn with_provider_id(
        mut self,
        provider_id: impl Into<String>,
    ) -> Self {
        self.provider_id = provider_id.into();
        self
    }
}

impl ResourceProvider for BundledAssetProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    // Blob archives store raw bytes
    fn default_type(
        &self,
        _location: &ResourceLocation,
    ) -> ResultType {
        ResultType::single::<Vec<u8>>()
    }

    // The stored type is only known once the archive is open
    fn can_provide(
        &self,
        _result_type: &ResultType,
        _location: &ResourceLocation,
    ) -> bool {
        true
    }

    fn provide(
        &self,
        handle: ProvideHandle,
    ) {
        let archive = handle
            .dependencies()
            .into_iter()
            .flatten()
            .find_map(|x| x.downcast::<LoadedArchive>().ok());

        let name = handle.location().internal_id();
        let completed = match archive {
            None => handle.fail(TroveError::ProvideFailed(format!(
                "Unable to load dependent archive from location {}",
                handle.location()
            ))),
            Some(archive) => match handle.result_type().shape() {
                ResultShape::Single => match archive.contents().load_asset(name) {
                    Some(asset) => handle.complete_erased(Some(asset), true, None),
                    None => handle.fail(TroveError::ProvideFailed(format!(
                        "Unable to load asset {} from archive {}",
                        name,
                        archive.internal_id()
                    ))),
                },
                ResultShape::Array | ResultShape::List => {
                    handle.complete_many(archive.contents().load_sub_assets(name), true, None)
                }
            },
        };

        if let Err(e) = completed {
            log::warn!("BundledAssetProvider could not complete {}: {}", handle.location(), e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::BlobArchive;
    use crate::providers::SyncArchiveProvider;
    use crate::test_util::{test_manager, TempDir};
    use crate::OperationStatus;
    use std::sync::Arc;

    fn setup(dir: &TempDir) -> Arc<ResourceLocation> {
        let path = dir.path().join("sounds.bundle");
        let mut archive = BlobArchive::default();
        archive.add_asset("click", vec![1]);
        archive.add_asset("steps", vec![2]);
        archive.add_asset("steps", vec![3]);
        archive.write_to_file(&path).unwrap();

        Arc::new(ResourceLocation::new(
            "sounds",
            path.to_string_lossy(),
            SyncArchiveProvider::PROVIDER_ID,
        ))
    }

    #[test]
    fn check_single_and_list_shapes() {
        let dir = TempDir::new("bundled_asset");
        let archive = setup(&dir);
        let manager = test_manager(vec![
            Arc::new(SyncArchiveProvider::default()),
            Arc::new(BundledAssetProvider::default()),
        ]);

        let click = Arc::new(
            ResourceLocation::new("click", "click", BundledAssetProvider::PROVIDER_ID)
                .with_dependencies(vec![archive.clone()]),
        );
        let steps = Arc::new(
            ResourceLocation::new("steps", "steps", BundledAssetProvider::PROVIDER_ID)
                .with_dependencies(vec![archive.clone()]),
        );

        let single = manager.provide_resource::<Vec<u8>>(&click);
        assert_eq!(*single.result().unwrap().unwrap(), vec![1]);

        let list = manager.provide_resource_list::<Vec<u8>>(&steps);
        let list_result = list.result().unwrap().unwrap();
        assert_eq!(list_result.len(), 2);
        assert_eq!(*list_result[1], vec![3]);

        let array = manager.provide_resource_array::<Vec<u8>>(&steps);
        assert_eq!(array.result().unwrap().unwrap().len(), 2);

        // Same dependency list, one shared group and one archive load
        assert_eq!(manager.operation_cache_count(), 5);

        single.release().unwrap();
        list.release().unwrap();
        array.release().unwrap();
        assert_eq!(manager.operation_cache_count(), 0);
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_wrong_type_fails() {
        let dir = TempDir::new("bundled_asset_type");
        let archive = setup(&dir);
        let manager = test_manager(vec![
            Arc::new(SyncArchiveProvider::default()),
            Arc::new(BundledAssetProvider::default()),
        ]);

        let click = Arc::new(
            ResourceLocation::new("click", "click", BundledAssetProvider::PROVIDER_ID)
                .with_dependencies(vec![archive]),
        );
        let handle = manager.provide_resource::<String>(&click);
        assert_eq!(handle.status().unwrap(), OperationStatus::Failed);
        assert!(matches!(
            handle.operation_error().unwrap(),
            Some(TroveError::TypeMismatch { .. })
        ));

        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_failed_archive_fails_asset() {
        let dir = TempDir::new("bundled_asset_missing");
        let manager = test_manager(vec![
            Arc::new(SyncArchiveProvider::default()),
            Arc::new(BundledAssetProvider::default()),
        ]);

        let archive = Arc::new(ResourceLocation::new(
            "missing",
            dir.path().join("missing.bundle").to_string_lossy(),
            SyncArchiveProvider::PROVIDER_ID,
        ));
        let click = Arc::new(
            ResourceLocation::new("click", "click", BundledAssetProvider::PROVIDER_ID)
                .with_dependencies(vec![archive]),
        );

        let handle = manager.provide_resource::<Vec<u8>>(&click);
        assert_eq!(handle.status().unwrap(), OperationStatus::Failed);
        assert!(matches!(
            handle.operation_error().unwrap(),
            Some(TroveError::DependencyFailed(_))
        ));

        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }
}
