use super::local_path;
use crate::archive::{load_blob_archive, LoadedArchive};
use crate::error::TroveError;
use crate::provider::{ProvideHandle, ResourceProvider};
use std::path::Path;
use trove_base::{ErasedObject, ResourceLocation, ResultType};

/// Reads archives from local disk inside `provide`. The operation is always complete when `provide`
/// returns, which callers that can't wait a tick rely on.
pub struct SyncArchiveProvider {
    provider_id: String,
}

impl Default for SyncArchiveProvider {
    fn default() -> Self {
        SyncArchiveProvider {
            provider_id: Self::PROVIDER_ID.to_string(),
        }
    }
}

impl SyncArchiveProvider {
    pub const PROVIDER_ID: &'static str = "SyncArchiveProvider";

    pub fn with_provider_id(
        mut self,
        provider_id: impl Into<String>,
    ) -> Self {
        self.provider_id = provider_id.into();
        self
    }
}

impl ResourceProvider for SyncArchiveProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn default_type(
        &self,
        _location: &ResourceLocation,
    ) -> ResultType {
        ResultType::single::<LoadedArchive>()
    }

    fn provide(
        &self,
        handle: ProvideHandle,
    ) {
        let internal_id = handle.location().internal_id();
        let path = Path::new(local_path(internal_id));
        let completed = if !path.exists() {
            handle.fail(TroveError::InvalidPath(format!(
                "Invalid path in SyncArchiveProvider: '{}'",
                internal_id
            )))
        } else {
            match load_blob_archive(internal_id, path) {
                Ok(archive) => handle.complete(Some(archive), true, None),
                Err(e) => handle.fail(e),
            }
        };

        if let Err(e) = completed {
            log::warn!("SyncArchiveProvider could not complete {}: {}", handle.location(), e);
        }
    }

    fn release(
        &self,
        _location: &ResourceLocation,
        asset: Option<ErasedObject>,
    ) {
        if let Some(archive) = asset.and_then(|x| x.downcast::<LoadedArchive>().ok()) {
            archive.contents().unload();
        }
    }
}
