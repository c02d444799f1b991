use super::ArchiveProvider;
use crate::archive::{load_blob_archive, ArchiveRequestOptions, LoadedArchive};
use crate::error::{TroveError, TroveResult};
use crate::provider::{ProvideHandle, ResourceProvider};
use crate::resource_manager::ResourceManager;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use trove_base::{ErasedObject, ResourceLocation, ResultType};

/// Platform facility that downloads named resource packs on demand
pub trait ResourceDelivery: Send + Sync {
    fn request(
        &self,
        bundle_name: &str,
    ) -> TroveResult<Arc<dyn ResourceDeliveryRequest>>;
}

/// Polled every update until it is done or reports an error
pub trait ResourceDeliveryRequest: Send + Sync {
    fn progress(&self) -> f32;

    fn is_done(&self) -> bool;

    fn error(&self) -> Option<String>;

    /// Local path of the delivered archive once done
    fn path(&self) -> Option<PathBuf>;
}

/// Resolves archives through a `ResourceDelivery` when the platform has one, otherwise behaves like
/// the `ArchiveProvider` it wraps.
pub struct OdrArchiveProvider {
    provider_id: String,
    delivery: Option<Arc<dyn ResourceDelivery>>,
    fallback: ArchiveProvider,
    pending: Mutex<Vec<(ProvideHandle, Arc<dyn ResourceDeliveryRequest>)>>,
}

impl OdrArchiveProvider {
    pub const PROVIDER_ID: &'static str = "OdrArchiveProvider";

    pub fn new(
        delivery: Option<Arc<dyn ResourceDelivery>>,
        fallback: ArchiveProvider,
    ) -> Self {
        OdrArchiveProvider {
            provider_id: Self::PROVIDER_ID.to_string(),
            delivery,
            fallback,
            pending: Default::default(),
        }
    }

    pub fn with_provider_id(
        mut self,
        provider_id: impl Into<String>,
    ) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    // The pack name comes from the location's options, or the file name of its id
    fn bundle_name(location: &ResourceLocation) -> TroveResult<String> {
        let options = ArchiveRequestOptions::from_location(location)?;
        if let Some(options) = options {
            if !options.bundle_name.is_empty() {
                return Ok(options.bundle_name);
            }
        }

        let file_name = Path::new(location.internal_id())
            .file_stem()
            .map(|x| x.to_string_lossy().to_string());
        Ok(file_name.unwrap_or_else(|| location.internal_id().to_string()))
    }

    // Some(result) once the request reached a terminal state
    fn poll(
        handle: &ProvideHandle,
        request: &Arc<dyn ResourceDeliveryRequest>,
    ) -> Option<TroveResult<LoadedArchive>> {
        if let Some(error) = request.error() {
            return Some(Err(TroveError::ProvideFailed(format!(
                "On-demand delivery of {} failed: {}",
                handle.location(),
                error
            ))));
        }

        if !request.is_done() {
            return None;
        }

        Some(match request.path() {
            Some(path) => load_blob_archive(handle.location().internal_id(), &path),
            None => Err(TroveError::ProvideFailed(format!(
                "On-demand delivery of {} finished without a path",
                handle.location()
            ))),
        })
    }
}

impl ResourceProvider for OdrArchiveProvider {
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
        let delivery = match &self.delivery {
            Some(delivery) => delivery,
            None => {
                self.fallback.provide(handle);
                return;
            }
        };

        let request = Self::bundle_name(handle.location())
            .and_then(|bundle_name| delivery.request(&bundle_name));
        match request {
            Ok(request) => {
                let progress = request.clone();
                handle.set_progress_callback(Arc::new(move || progress.progress()));
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((handle, request));
            }
            Err(e) => {
                if let Err(e) = handle.fail(e) {
                    log::warn!("OdrArchiveProvider could not fail {}: {}", handle.location(), e);
                }
            }
        }
    }

    fn release(
        &self,
        location: &ResourceLocation,
        asset: Option<ErasedObject>,
    ) {
        self.fallback.release(location, asset);
    }

    fn update(
        &self,
        manager: &ResourceManager,
        delta_time: f32,
    ) {
        self.fallback.update(manager, delta_time);

        // Completing runs callbacks that may request more packs, so nothing is locked while polling
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let mut still_pending = Vec::default();
        for (handle, request) in pending {
            if handle.is_destroyed() {
                log::debug!("Dropping on-demand request for destroyed {}", handle.location());
                continue;
            }

            let completed = match Self::poll(&handle, &request) {
                None => {
                    still_pending.push((handle, request));
                    continue;
                }
                Some(Ok(archive)) => handle.complete(Some(archive), true, None),
                Some(Err(e)) => handle.fail(e),
            };

            if let Err(e) = completed {
                log::warn!("OdrArchiveProvider could not complete {}: {}", handle.location(), e);
            }
        }

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(still_pending);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::BlobArchive;
    use crate::disk_io::DiskArchiveLoader;
    use crate::test_util::{test_manager, TempDir};
    use crate::OperationStatus;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    struct FakeRequest {
        done: AtomicBool,
        error: Mutex<Option<String>>,
        path: PathBuf,
    }

    impl ResourceDeliveryRequest for FakeRequest {
        fn progress(&self) -> f32 {
            if self.done.load(Ordering::SeqCst) {
                1.0
            } else {
                0.25
            }
        }

        fn is_done(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }

        fn error(&self) -> Option<String> {
            self.error.lock().unwrap().clone()
        }

        fn path(&self) -> Option<PathBuf> {
            Some(self.path.clone())
        }
    }

    struct FakeDelivery {
        request: Arc<FakeRequest>,
        requested: Mutex<Vec<String>>,
    }

    impl ResourceDelivery for FakeDelivery {
        fn request(
            &self,
            bundle_name: &str,
        ) -> TroveResult<Arc<dyn ResourceDeliveryRequest>> {
            self.requested.lock().unwrap().push(bundle_name.to_string());
            Ok(self.request.clone())
        }
    }

    fn setup(dir: &TempDir) -> (Arc<FakeDelivery>, ResourceManager, Arc<ResourceLocation>) {
        let path = dir.path().join("pack.bundle");
        BlobArchive::default().write_to_file(&path).unwrap();

        let delivery = Arc::new(FakeDelivery {
            request: Arc::new(FakeRequest {
                done: AtomicBool::new(false),
                error: Mutex::new(None),
                path,
            }),
            requested: Mutex::new(Vec::default()),
        });

        let fallback = ArchiveProvider::new(Arc::new(DiskArchiveLoader::new(1).unwrap()));
        let provider = OdrArchiveProvider::new(Some(delivery.clone()), fallback);
        let manager = test_manager(vec![Arc::new(provider)]);
        let location = Arc::new(ResourceLocation::new(
            "pack",
            "odr://pack.bundle",
            OdrArchiveProvider::PROVIDER_ID,
        ));
        (delivery, manager, location)
    }

    #[test]
    fn check_delivery_polled_in_update() {
        let dir = TempDir::new("odr_delivery");
        let (delivery, manager, location) = setup(&dir);

        let handle = manager.provide_resource::<LoadedArchive>(&location);
        assert_eq!(delivery.requested.lock().unwrap().as_slice(), ["pack"]);
        assert_eq!(handle.percent_complete().unwrap(), 0.25);

        manager.update(0.0);
        assert!(!handle.is_done().unwrap());

        delivery.request.done.store(true, Ordering::SeqCst);
        manager.update(0.0);
        assert_eq!(handle.status().unwrap(), OperationStatus::Succeeded);

        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_delivery_error_fails_operation() {
        let dir = TempDir::new("odr_delivery_error");
        let (delivery, manager, location) = setup(&dir);

        let handle = manager.provide_resource::<LoadedArchive>(&location);
        *delivery.request.error.lock().unwrap() = Some("disk full".to_string());
        manager.update(0.0);

        assert_eq!(handle.status().unwrap(), OperationStatus::Failed);
        let error = handle.operation_error().unwrap().unwrap().to_string();
        assert!(error.contains("disk full"));

        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_without_delivery_uses_fallback() {
        let dir = TempDir::new("odr_fallback");
        let path = dir.path().join("pack.bundle");
        let mut archive = BlobArchive::default();
        archive.add_asset("map", vec![4]);
        archive.write_to_file(&path).unwrap();

        let fallback = ArchiveProvider::new(Arc::new(DiskArchiveLoader::new(1).unwrap()));
        let manager = test_manager(vec![Arc::new(OdrArchiveProvider::new(None, fallback))]);
        let location = Arc::new(ResourceLocation::new(
            "pack",
            path.to_string_lossy().to_string(),
            OdrArchiveProvider::PROVIDER_ID,
        ));

        let handle = manager.provide_resource::<LoadedArchive>(&location);
        let start = Instant::now();
        while !handle.is_done().unwrap() && start.elapsed() < Duration::from_secs(10) {
            manager.update(0.0);
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(handle.status().unwrap(), OperationStatus::Succeeded);
        let archive = handle.result().unwrap().unwrap();
        assert!(archive.contents().load_asset("map").is_some());

        // Releasing goes through the fallback, which unloads the archive
        handle.release().unwrap();
        assert!(archive.contents().load_asset("map").is_none());
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_released_request_is_dropped() {
        let dir = TempDir::new("odr_released");
        let path = dir.path().join("pack.bundle");
        BlobArchive::default().write_to_file(&path).unwrap();

        let delivery = Arc::new(FakeDelivery {
            request: Arc::new(FakeRequest {
                done: AtomicBool::new(false),
                error: Mutex::new(None),
                path,
            }),
            requested: Mutex::new(Vec::default()),
        });
        let fallback = ArchiveProvider::new(Arc::new(DiskArchiveLoader::new(1).unwrap()));
        let provider = Arc::new(OdrArchiveProvider::new(Some(delivery.clone()), fallback));
        let manager = test_manager(vec![provider.clone()]);
        let location = Arc::new(ResourceLocation::new(
            "pack",
            "odr://pack.bundle",
            OdrArchiveProvider::PROVIDER_ID,
        ));

        let handle = manager.provide_resource::<LoadedArchive>(&location);
        assert_eq!(provider.pending.lock().unwrap().len(), 1);
        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);

        delivery.request.done.store(true, Ordering::SeqCst);
        manager.update(0.0);

        assert!(provider.pending.lock().unwrap().is_empty());
        assert_eq!(manager.operation_count(), 0);
        assert_eq!(manager.operation_cache_count(), 0);
    }
}
