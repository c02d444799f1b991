use crate::error::{TroveError, TroveResult};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use trove_base::{ErasedObject, ResourceLocation};

/// An opened archive that named objects can be extracted from
pub trait ArchiveResource: Send + Sync {
    fn load_asset(
        &self,
        name: &str,
    ) -> Option<ErasedObject>;

    /// Every object stored under `name`
    fn load_sub_assets(
        &self,
        name: &str,
    ) -> Vec<ErasedObject>;

    fn unload(&self);
}

/// Result of loading an archive location
#[derive(Clone)]
pub struct LoadedArchive {
    internal_id: String,
    contents: Arc<dyn ArchiveResource>,
}

impl LoadedArchive {
    pub fn new(
        internal_id: impl Into<String>,
        contents: Arc<dyn ArchiveResource>,
    ) -> Self {
        LoadedArchive {
            internal_id: internal_id.into(),
            contents,
        }
    }

    pub fn internal_id(&self) -> &str {
        &self.internal_id
    }

    pub fn contents(&self) -> &Arc<dyn ArchiveResource> {
        &self.contents
    }
}

impl fmt::Debug for LoadedArchive {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LoadedArchive")
            .field("internal_id", &self.internal_id)
            .finish()
    }
}

/// Per-location archive options, stored as JSON in the location's data. `hash` and `crc` are passed
/// through to the `ArchiveLoader` for cache validation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveRequestOptions {
    pub hash: String,
    pub crc: u32,
    // Seconds of update time before ArchiveProvider gives up on a request, 0 means no timeout
    pub timeout: u32,
    pub retry_count: u32,
    // Name of the on-demand pack
    pub bundle_name: String,
    // Expected file size in bytes, checked by DiskArchiveLoader when not 0
    pub bundle_size: u64,
}

impl ArchiveRequestOptions {
    pub fn from_location(location: &ResourceLocation) -> TroveResult<Option<Self>> {
        match location.data() {
            Some(data) => Ok(Some(serde_json::from_value(data.clone())?)),
            None => Ok(None),
        }
    }
}

/// Progress of an in-flight archive load, written by the loader and read by the operation
#[derive(Clone, Default)]
pub struct ArchiveLoadProgress(Arc<AtomicU32>);

impl ArchiveLoadProgress {
    pub fn set(
        &self,
        progress: f32,
    ) {
        self.0.store(progress.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

pub struct ArchiveLoadRequest {
    pub request_id: u64,
    pub internal_id: String,
    pub options: Option<ArchiveRequestOptions>,
    pub result_tx: Sender<ArchiveLoadResult>,
    pub progress: ArchiveLoadProgress,
}

pub struct ArchiveLoadResult {
    pub request_id: u64,
    pub result: TroveResult<LoadedArchive>,
}

/// Loads archives in the background. Every request must eventually produce exactly one result on its
/// `result_tx`.
pub trait ArchiveLoader: Send + Sync {
    fn begin_load(
        &self,
        request: ArchiveLoadRequest,
    );
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobAsset {
    pub name: String,
    pub data: Vec<u8>,
}

/// Archive format read by the bundled loaders: a list of named byte blobs, bincode encoded
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobArchive {
    pub name: String,
    pub assets: Vec<BlobAsset>,
}

impl BlobArchive {
    pub fn add_asset(
        &mut self,
        name: impl Into<String>,
        data: Vec<u8>,
    ) {
        self.assets.push(BlobAsset {
            name: name.into(),
            data,
        });
    }

    pub fn read_from_file(path: &Path) -> TroveResult<BlobArchive> {
        profiling::scope!("BlobArchive::read_from_file");
        let file = std::fs::File::open(path)?;
        let archive = bincode::deserialize_from(BufReader::new(file))?;
        Ok(archive)
    }

    pub fn write_to_file(
        &self,
        path: &Path,
    ) -> TroveResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }
}

// Objects loaded from a blob archive are `Vec<u8>`
pub(crate) struct BlobArchiveResource {
    archive: BlobArchive,
    unloaded: AtomicBool,
}

impl BlobArchiveResource {
    pub(crate) fn new(archive: BlobArchive) -> Self {
        BlobArchiveResource {
            archive,
            unloaded: AtomicBool::new(false),
        }
    }
}

impl ArchiveResource for BlobArchiveResource {
    fn load_asset(
        &self,
        name: &str,
    ) -> Option<ErasedObject> {
        if self.unloaded.load(Ordering::Acquire) {
            return None;
        }

        self.archive
            .assets
            .iter()
            .find(|x| x.name == name)
            .map(|x| Arc::new(x.data.clone()) as ErasedObject)
    }

    fn load_sub_assets(
        &self,
        name: &str,
    ) -> Vec<ErasedObject> {
        if self.unloaded.load(Ordering::Acquire) {
            return Vec::default();
        }

        self.archive
            .assets
            .iter()
            .filter(|x| x.name == name)
            .map(|x| Arc::new(x.data.clone()) as ErasedObject)
            .collect()
    }

    fn unload(&self) {
        log::debug!("Unload archive {}", self.archive.name);
        self.unloaded.store(true, Ordering::Release);
    }
}

/// Reads and opens a blob archive file, blocking the calling thread
pub fn load_blob_archive(
    internal_id: &str,
    path: &Path,
) -> TroveResult<LoadedArchive> {
    let archive = BlobArchive::read_from_file(path).map_err(|e| {
        TroveError::ProvideFailed(format!("Failed to load archive {}: {}", internal_id, e))
    })?;

    Ok(LoadedArchive::new(
        internal_id,
        Arc::new(BlobArchiveResource::new(archive)),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::TempDir;

    #[test]
    fn check_blob_archive_load_assets() {
        let dir = TempDir::new("blob_archive");
        let path = dir.path().join("textures.bundle");

        let mut archive = BlobArchive {
            name: "textures".to_string(),
            ..Default::default()
        };
        archive.add_asset("grass", vec![1, 2, 3]);
        archive.add_asset("sprites", vec![4]);
        archive.add_asset("sprites", vec![5]);
        archive.write_to_file(&path).unwrap();

        let loaded = load_blob_archive("textures.bundle", &path).unwrap();
        assert_eq!(loaded.internal_id(), "textures.bundle");

        let grass = loaded.contents().load_asset("grass").unwrap();
        assert_eq!(*grass.downcast::<Vec<u8>>().unwrap(), vec![1, 2, 3]);
        assert!(loaded.contents().load_asset("missing").is_none());
        assert_eq!(loaded.contents().load_sub_assets("sprites").len(), 2);

        loaded.contents().unload();
        assert!(loaded.contents().load_asset("grass").is_none());
    }

    #[test]
    fn check_missing_archive_fails() {
        let dir = TempDir::new("blob_archive_missing");
        let result = load_blob_archive("missing.bundle", &dir.path().join("missing.bundle"));
        assert!(matches!(result, Err(TroveError::ProvideFailed(_))));
    }

    #[test]
    fn check_request_options_from_location_data() {
        let location = ResourceLocation::new("a", "a.bundle", "ArchiveProvider").with_data(
            serde_json::json!({ "hash": "abc", "retry_count": 2, "bundle_name": "a" }),
        );
        let options = ArchiveRequestOptions::from_location(&location)
            .unwrap()
            .unwrap();
        assert_eq!(options.hash, "abc");
        assert_eq!(options.retry_count, 2);
        assert_eq!(options.timeout, 0);

        let location = ResourceLocation::new("b", "b.bundle", "ArchiveProvider");
        assert!(ArchiveRequestOptions::from_location(&location)
            .unwrap()
            .is_none());
    }
}
