use crate::archive::{load_blob_archive, ArchiveLoadRequest, ArchiveLoadResult, ArchiveLoader, LoadedArchive};
use crate::error::{TroveError, TroveResult};
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

// Thread that tries to take jobs out of the request channel and ends when the finish channel is signalled
struct DiskArchiveWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DiskArchiveWorkerThread {
    fn new(
        request_rx: Receiver<ArchiveLoadRequest>,
        active_request_count: Arc<AtomicUsize>,
        thread_index: usize,
    ) -> std::io::Result<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("Archive IO Thread {}", thread_index))
            .spawn(move || {
                profiling::register_thread!(&format!("DiskArchiveWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            let request = match msg {
                                Ok(request) => request,
                                // The pool is gone
                                Err(_) => return,
                            };

                            profiling::scope!("DiskArchiveLoad");
                            log::trace!("Start archive read {}", request.internal_id);

                            let path = PathBuf::from(request.internal_id.trim_start_matches("file://"));
                            let result = read_archive(&request, &path);
                            request.progress.set(1.0);

                            log::trace!("Finished archive read {} ok: {}", request.internal_id, result.is_ok());

                            // The receiver is dropped if the provider went away, nobody wants the result then
                            let _ = request.result_tx.send(ArchiveLoadResult {
                                request_id: request.request_id,
                                result,
                            });
                            active_request_count.fetch_sub(1, Ordering::Release);
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })?;

        Ok(DiskArchiveWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

fn read_archive(
    request: &ArchiveLoadRequest,
    path: &Path,
) -> TroveResult<LoadedArchive> {
    let expected_size = request.options.as_ref().map(|x| x.bundle_size).unwrap_or(0);
    if expected_size > 0 {
        let size = std::fs::metadata(path)?.len();
        if size != expected_size {
            return Err(TroveError::ProvideFailed(format!(
                "Archive {} is {} bytes, expected {}",
                request.internal_id, size, expected_size
            )));
        }
    }

    load_blob_archive(&request.internal_id, path)
}

// The request still gets its one result when it can't be queued
fn reject_request(
    request: ArchiveLoadRequest,
    reason: &str,
) {
    log::error!("{}, failing request {}", reason, request.internal_id);
    let _ = request.result_tx.send(ArchiveLoadResult {
        request_id: request.request_id,
        result: Err(TroveError::StringError(format!(
            "{}: {}",
            reason, request.internal_id
        ))),
    });
}

// Spans N threads, proxies messages to them, and kills the threads when the pool is finished
struct DiskArchiveThreadPool {
    worker_threads: Vec<DiskArchiveWorkerThread>,
    request_tx: Sender<ArchiveLoadRequest>,
    active_request_count: Arc<AtomicUsize>,
}

impl DiskArchiveThreadPool {
    fn new(thread_count: usize) -> std::io::Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<ArchiveLoadRequest>();
        let active_request_count = Arc::new(AtomicUsize::new(0));

        let mut worker_threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count {
            let worker = DiskArchiveWorkerThread::new(
                request_rx.clone(),
                active_request_count.clone(),
                thread_index,
            )?;
            worker_threads.push(worker);
        }

        Ok(DiskArchiveThreadPool {
            request_tx,
            worker_threads,
            active_request_count,
        })
    }

    fn add_request(
        &self,
        request: ArchiveLoadRequest,
    ) {
        self.active_request_count.fetch_add(1, Ordering::Release);
        if let Err(e) = self.request_tx.send(request) {
            self.active_request_count.fetch_sub(1, Ordering::Release);
            reject_request(e.into_inner(), "Archive IO threads are gone");
        }
    }

    fn finish(self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads {
            if worker_thread.join_handle.join().is_err() {
                log::error!("Archive IO thread panicked");
            }
        }
    }
}

/// Loads blob archives from local disk on a pool of worker threads
pub struct DiskArchiveLoader {
    thread_pool: Mutex<Option<DiskArchiveThreadPool>>,
}

impl DiskArchiveLoader {
    pub fn new(thread_count: usize) -> std::io::Result<Self> {
        let thread_pool = DiskArchiveThreadPool::new(thread_count.max(1))?;
        Ok(DiskArchiveLoader {
            thread_pool: Mutex::new(Some(thread_pool)),
        })
    }

    pub fn active_request_count(&self) -> usize {
        self.thread_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|x| x.active_request_count.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl Drop for DiskArchiveLoader {
    fn drop(&mut self) {
        let thread_pool = self
            .thread_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread_pool) = thread_pool {
            thread_pool.finish();
        }
    }
}

impl ArchiveLoader for DiskArchiveLoader {
    fn begin_load(
        &self,
        request: ArchiveLoadRequest,
    ) {
        log::debug!("begin archive load {}", request.internal_id);
        let thread_pool = self
            .thread_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match thread_pool.as_ref() {
            Some(thread_pool) => thread_pool.add_request(request),
            None => reject_request(request, "DiskArchiveLoader is shut down"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::{ArchiveLoadProgress, ArchiveRequestOptions, BlobArchive};
    use crate::providers::ArchiveProvider;
    use crate::test_util::{test_manager, TempDir};
    use crate::OperationStatus;
    use std::time::Duration;
    use trove_base::ResourceLocation;

    #[test]
    fn check_disk_loader_reads_archive() {
        let dir = TempDir::new("disk_loader");
        let path = dir.path().join("level.bundle");
        let mut archive = BlobArchive::default();
        archive.add_asset("map", vec![7, 7]);
        archive.write_to_file(&path).unwrap();

        let loader = DiskArchiveLoader::new(2).unwrap();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let progress = ArchiveLoadProgress::default();
        loader.begin_load(ArchiveLoadRequest {
            request_id: 5,
            internal_id: path.to_string_lossy().to_string(),
            options: None,
            result_tx: result_tx.clone(),
            progress: progress.clone(),
        });
        loader.begin_load(ArchiveLoadRequest {
            request_id: 6,
            internal_id: dir.path().join("missing.bundle").to_string_lossy().to_string(),
            options: None,
            result_tx,
            progress: ArchiveLoadProgress::default(),
        });

        let mut results = vec![
            result_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            result_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        ];
        results.sort_by_key(|x| x.request_id);

        assert_eq!(results[0].request_id, 5);
        let loaded = results[0].result.as_ref().unwrap();
        assert!(loaded.contents().load_asset("map").is_some());
        assert_eq!(progress.get(), 1.0);

        assert_eq!(results[1].request_id, 6);
        assert!(results[1].result.is_err());
    }

    #[test]
    fn check_shut_down_loader_fails_requests() {
        let dir = TempDir::new("disk_loader_shut_down");
        let path = dir.path().join("level.bundle");
        BlobArchive::default().write_to_file(&path).unwrap();

        let loader = Arc::new(DiskArchiveLoader {
            thread_pool: Mutex::new(None),
        });
        let provider = Arc::new(ArchiveProvider::new(loader.clone()));
        let manager = test_manager(vec![provider.clone()]);
        let location = Arc::new(ResourceLocation::new(
            "level",
            path.to_string_lossy().to_string(),
            ArchiveProvider::PROVIDER_ID,
        ));

        let handle = manager.provide_resource::<LoadedArchive>(&location);
        manager.update(0.0);

        assert_eq!(handle.status().unwrap(), OperationStatus::Failed);
        let error = handle.operation_error().unwrap().unwrap().to_string();
        assert!(error.contains("shut down"));
        assert_eq!(provider.in_flight_count(), 0);
        assert_eq!(loader.active_request_count(), 0);

        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_bundle_size_mismatch_fails() {
        let dir = TempDir::new("disk_loader_size");
        let path = dir.path().join("level.bundle");
        BlobArchive::default().write_to_file(&path).unwrap();
        let size = std::fs::metadata(&path).unwrap().len();

        let loader = DiskArchiveLoader::new(1).unwrap();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        for (request_id, bundle_size) in [(1, size), (2, size + 1)] {
            loader.begin_load(ArchiveLoadRequest {
                request_id,
                internal_id: path.to_string_lossy().to_string(),
                options: Some(ArchiveRequestOptions {
                    bundle_size,
                    ..Default::default()
                }),
                result_tx: result_tx.clone(),
                progress: ArchiveLoadProgress::default(),
            });
        }

        let mut results = vec![
            result_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            result_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        ];
        results.sort_by_key(|x| x.request_id);

        assert!(results[0].result.is_ok());
        let error = results[1].result.as_ref().err().unwrap().to_string();
        assert!(error.contains("expected"));
    }
}
