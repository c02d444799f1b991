use crate::config::ResourceManagerConfig;
use crate::error::TroveError;
use crate::provider::{ProvideHandle, ProviderBehaviourFlags, ResourceProvider};
use crate::resource_manager::ResourceManager;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use trove_base::{ErasedObject, ResourceLocation, ResultType};

static NEXT_TEMP_DIR: AtomicUsize = AtomicUsize::new(0);

// Directory under the system temp dir, removed when dropped
pub(crate) struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub(crate) fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "trove-test-{}-{}-{}",
            std::process::id(),
            NEXT_TEMP_DIR.fetch_add(1, Ordering::Relaxed),
            name
        ));
        std::fs::create_dir_all(&path).unwrap();
        TempDir { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub(crate) fn test_manager(providers: Vec<Arc<dyn ResourceProvider>>) -> ResourceManager {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = ResourceManagerConfig::default().with_log_failures(false);
    for provider in providers {
        config = config.with_provider(provider);
    }
    ResourceManager::new(config)
}

enum MockBehavior {
    Succeed(i32),
    Fail(String),
    // Handles are kept until the test completes them
    Manual,
}

/// Provides an `i32` and counts how often it was asked to
pub(crate) struct MockProvider {
    provider_id: String,
    behavior: MockBehavior,
    flags: ProviderBehaviourFlags,
    provide_count: AtomicUsize,
    release_count: AtomicUsize,
    update_count: AtomicUsize,
    pending: Mutex<Vec<ProvideHandle>>,
}

impl MockProvider {
    fn new(
        provider_id: &str,
        behavior: MockBehavior,
    ) -> Self {
        MockProvider {
            provider_id: provider_id.to_string(),
            behavior,
            flags: ProviderBehaviourFlags::NONE,
            provide_count: AtomicUsize::new(0),
            release_count: AtomicUsize::new(0),
            update_count: AtomicUsize::new(0),
            pending: Mutex::new(Vec::default()),
        }
    }

    pub(crate) fn sync(
        provider_id: &str,
        value: i32,
    ) -> Self {
        Self::new(provider_id, MockBehavior::Succeed(value))
    }

    pub(crate) fn failing(
        provider_id: &str,
        message: &str,
    ) -> Self {
        Self::new(provider_id, MockBehavior::Fail(message.to_string()))
    }

    pub(crate) fn manual(provider_id: &str) -> Self {
        Self::new(provider_id, MockBehavior::Manual)
    }

    pub(crate) fn with_flags(
        mut self,
        flags: ProviderBehaviourFlags,
    ) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn provide_count(&self) -> usize {
        self.provide_count.load(Ordering::SeqCst)
    }

    pub(crate) fn release_count(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }

    pub(crate) fn update_count(&self) -> usize {
        self.update_count.load(Ordering::SeqCst)
    }

    pub(crate) fn take_pending(&self) -> Vec<ProvideHandle> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

impl ResourceProvider for MockProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn default_type(
        &self,
        _location: &ResourceLocation,
    ) -> ResultType {
        ResultType::single::<i32>()
    }

    fn provide(
        &self,
        handle: ProvideHandle,
    ) {
        self.provide_count.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            MockBehavior::Succeed(value) => {
                let _ = handle.complete(Some(*value), true, None);
            }
            MockBehavior::Fail(message) => {
                let _ = handle.fail(TroveError::ProvideFailed(message.clone()));
            }
            MockBehavior::Manual => self.pending.lock().unwrap().push(handle),
        }
    }

    fn release(
        &self,
        _location: &ResourceLocation,
        _asset: Option<ErasedObject>,
    ) {
        self.release_count.fetch_add(1, Ordering::SeqCst);
    }

    fn behaviour_flags(&self) -> ProviderBehaviourFlags {
        self.flags
    }

    fn update(
        &self,
        _manager: &ResourceManager,
        _delta_time: f32,
    ) {
        self.update_count.fetch_add(1, Ordering::SeqCst);
    }
}
