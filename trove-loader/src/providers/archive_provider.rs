use super::local_path;
use crate::archive::{
    ArchiveLoadProgress, ArchiveLoadRequest, ArchiveLoadResult, ArchiveLoader,
    ArchiveRequestOptions, LoadedArchive,
};
use crate::error::TroveError;
use crate::provider::{ProvideHandle, ResourceProvider};
use crate::resource_manager::ResourceManager;
use crossbeam_channel::{Receiver, Sender};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use trove_base::hashing::HashMap;
use trove_base::{ErasedObject, ResourceLocation, ResultType};

struct InFlightArchive {
    handle: ProvideHandle,
    remote: bool,
    retries_left: u32,
    options: Option<ArchiveRequestOptions>,
    // Seconds of update time spent waiting on the loader
    elapsed: f32,
}

impl InFlightArchive {
    fn timed_out(&self) -> bool {
        match &self.options {
            Some(options) if options.timeout > 0 => self.elapsed >= options.timeout as f32,
            _ => false,
        }
    }
}

/// Loads archives asynchronously through an `ArchiveLoader`. Local paths go to `loader`, urls go to the
/// optional remote loader. Results are collected in `update`.
pub struct ArchiveProvider {
    provider_id: String,
    loader: Arc<dyn ArchiveLoader>,
    remote_loader: Option<Arc<dyn ArchiveLoader>>,
    result_tx: Sender<ArchiveLoadResult>,
    result_rx: Receiver<ArchiveLoadResult>,
    next_request_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, InFlightArchive>>,
}

impl ArchiveProvider {
    pub const PROVIDER_ID: &'static str = "ArchiveProvider";

    pub fn new(loader: Arc<dyn ArchiveLoader>) -> Self {
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        ArchiveProvider {
            provider_id: Self::PROVIDER_ID.to_string(),
            loader,
            remote_loader: None,
            result_tx,
            result_rx,
            next_request_id: AtomicU64::new(1),
            in_flight: Default::default(),
        }
    }

    pub fn with_provider_id(
        mut self,
        provider_id: impl Into<String>,
    ) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_remote_loader(
        mut self,
        remote_loader: Arc<dyn ArchiveLoader>,
    ) -> Self {
        self.remote_loader = Some(remote_loader);
        self
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn start_request(
        &self,
        handle: ProvideHandle,
        remote: bool,
        retries_left: u32,
        options: Option<ArchiveRequestOptions>,
    ) {
        let loader = if remote {
            self.remote_loader.clone()
        } else {
            Some(self.loader.clone())
        };

        let loader = match loader {
            Some(loader) => loader,
            None => {
                let error = TroveError::InvalidPath(format!(
                    "Invalid path in ArchiveProvider: '{}'",
                    handle.location().internal_id()
                ));
                if let Err(e) = handle.fail(error) {
                    log::warn!("ArchiveProvider could not fail {}: {}", handle.location(), e);
                }
                return;
            }
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let progress = ArchiveLoadProgress::default();
        let progress_reader = progress.clone();
        handle.set_progress_callback(Arc::new(move || progress_reader.get()));

        let internal_id = handle.location().internal_id().to_string();
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                request_id,
                InFlightArchive {
                    handle,
                    remote,
                    retries_left,
                    options: options.clone(),
                    elapsed: 0.0,
                },
            );

        loader.begin_load(ArchiveLoadRequest {
            request_id,
            internal_id,
            options,
            result_tx: self.result_tx.clone(),
            progress,
        });
    }

    fn handle_result(
        &self,
        result: ArchiveLoadResult,
    ) {
        let request = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&result.request_id);

        let request = match request {
            Some(request) => request,
            // Timed out requests are forgotten, their late results only need unloading
            None => {
                log::debug!("Archive result for unknown request {}", result.request_id);
                if let Ok(archive) = result.result {
                    archive.contents().unload();
                }
                return;
            }
        };

        // Everyone released the operation while the load was in flight
        if request.handle.is_destroyed() {
            log::debug!(
                "Dropping archive {} loaded for a destroyed operation",
                request.handle.location()
            );
            if let Ok(archive) = result.result {
                archive.contents().unload();
            }
            return;
        }

        match result.result {
            Ok(archive) => {
                if let Err(e) = request.handle.complete(Some(archive), true, None) {
                    log::warn!("ArchiveProvider could not complete request {}: {}", result.request_id, e);
                }
            }
            Err(e) => self.retry_or_fail(request, e),
        }
    }

    fn retry_or_fail(
        &self,
        request: InFlightArchive,
        error: TroveError,
    ) {
        if request.retries_left > 0 {
            log::warn!(
                "Retrying archive {} after error, {} retries left: {}",
                request.handle.location(),
                request.retries_left,
                error
            );
            self.start_request(
                request.handle,
                request.remote,
                request.retries_left - 1,
                request.options,
            );
        } else if let Err(e) = request.handle.fail(error) {
            log::warn!("ArchiveProvider could not fail {}: {}", request.handle.location(), e);
        }
    }

    // Removes requests that waited longer than their timeout option allows
    fn take_timed_out(
        &self,
        delta_time: f32,
    ) -> Vec<InFlightArchive> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        for request in in_flight.values_mut() {
            request.elapsed += delta_time;
        }

        let timed_out: Vec<u64> = in_flight
            .iter()
            .filter(|(_, request)| request.timed_out())
            .map(|(request_id, _)| *request_id)
            .collect();
        timed_out
            .into_iter()
            .filter_map(|request_id| in_flight.remove(&request_id))
            .collect()
    }
}

impl ResourceProvider for ArchiveProvider {
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
        let options = match ArchiveRequestOptions::from_location(handle.location()) {
            Ok(options) => options,
            Err(e) => {
                if let Err(e) = handle.fail(e) {
                    log::warn!("ArchiveProvider could not fail {}: {}", handle.location(), e);
                }
                return;
            }
        };

        let internal_id = handle.location().internal_id();
        let remote = if Path::new(local_path(internal_id)).exists() {
            false
        } else if internal_id.contains("://") && !internal_id.starts_with("file://") {
            true
        } else {
            let error = TroveError::InvalidPath(format!(
                "Invalid path in ArchiveProvider: '{}'",
                internal_id
            ));
            if let Err(e) = handle.fail(error) {
                log::warn!("ArchiveProvider could not fail {}: {}", handle.location(), e);
            }
            return;
        };

        let retries = options.as_ref().map(|x| x.retry_count).unwrap_or(0);
        self.start_request(handle, remote, retries, options);
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

    fn update(
        &self,
        _manager: &ResourceManager,
        delta_time: f32,
    ) {
        while let Ok(result) = self.result_rx.try_recv() {
            self.handle_result(result);
        }

        for request in self.take_timed_out(delta_time) {
            if request.handle.is_destroyed() {
                continue;
            }

            let timeout = request.options.as_ref().map(|x| x.timeout).unwrap_or(0);
            let error = TroveError::ProvideFailed(format!(
                "Archive {} timed out after {}s",
                request.handle.location(),
                timeout
            ));
            self.retry_or_fail(request, error);
        }
    }
}
