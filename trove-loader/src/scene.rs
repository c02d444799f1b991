use crate::error::{TroveError, TroveResult};
use crate::handle::{GenericHandle, OperationHandle};
use crate::operation::{AsyncOperation, OperationContext, OperationStatus};
use crate::resource_manager::ResourceManager;
use std::fmt;
use std::sync::Arc;
use trove_base::ResourceLocation;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadSceneMode {
    // Unloads every other scene
    Single,
    Additive,
}

/// A scene load started by a `SceneLoader`
pub trait SceneLoadRequest: Send + Sync {
    fn progress(&self) -> f32;

    fn is_done(&self) -> bool;

    /// While false, the load stops short of activating the scene
    fn set_allow_activation(
        &self,
        allow_activation: bool,
    );
}

/// Engine side of scene loading, used by `DefaultSceneProvider`
pub trait SceneLoader: Send + Sync {
    fn begin_load(
        &self,
        internal_id: &str,
        mode: LoadSceneMode,
        priority: i32,
    ) -> TroveResult<Arc<dyn SceneLoadRequest>>;

    fn unload(
        &self,
        scene: &SceneInstance,
    ) -> TroveResult<()>;
}

/// A loaded scene. Scenes loaded without activation stay inactive until `activate` is called.
#[derive(Clone)]
pub struct SceneInstance {
    name: String,
    request: Arc<dyn SceneLoadRequest>,
}

impl SceneInstance {
    pub fn new(
        name: impl Into<String>,
        request: Arc<dyn SceneLoadRequest>,
    ) -> Self {
        SceneInstance {
            name: name.into(),
            request,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activate(&self) {
        self.request.set_allow_activation(true);
    }

    pub fn is_activated(&self) -> bool {
        self.request.is_done()
    }
}

impl fmt::Debug for SceneInstance {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SceneInstance")
            .field("name", &self.name)
            .finish()
    }
}

pub trait SceneProvider: Send + Sync {
    fn provide_scene(
        &self,
        manager: &ResourceManager,
        location: &Arc<ResourceLocation>,
        mode: LoadSceneMode,
        activate_on_load: bool,
        priority: i32,
    ) -> OperationHandle<SceneInstance>;

    /// Consumes the caller's reference to `scene`. The returned operation completes once the scene
    /// operation is destroyed.
    fn release_scene(
        &self,
        manager: &ResourceManager,
        scene: OperationHandle<SceneInstance>,
    ) -> OperationHandle<SceneInstance>;
}

pub struct DefaultSceneProvider {
    loader: Arc<dyn SceneLoader>,
}

impl DefaultSceneProvider {
    pub fn new(loader: Arc<dyn SceneLoader>) -> Self {
        DefaultSceneProvider { loader }
    }
}

impl SceneProvider for DefaultSceneProvider {
    fn provide_scene(
        &self,
        manager: &ResourceManager,
        location: &Arc<ResourceLocation>,
        mode: LoadSceneMode,
        activate_on_load: bool,
        priority: i32,
    ) -> OperationHandle<SceneInstance> {
        // Archives the scene lives in are its location's dependencies
        let dependencies = if location.has_dependencies() {
            Some(manager.provide_resource_group(location.dependencies()))
        } else {
            None
        };

        let operation = SceneOperation {
            loader: self.loader.clone(),
            location: location.clone(),
            mode,
            activate_on_load,
            priority,
            request: None,
        };
        let handle = manager.start_operation(operation, dependencies.as_deref());

        if let Some(dependencies) = dependencies {
            if let Err(e) = dependencies.release() {
                log::error!("Failed to release scene dependencies of {}: {}", location, e);
            }
        }

        handle
    }

    fn release_scene(
        &self,
        manager: &ResourceManager,
        scene: OperationHandle<SceneInstance>,
    ) -> OperationHandle<SceneInstance> {
        manager.start_operation(
            UnloadSceneOperation {
                loader: self.loader.clone(),
                scene: Some(scene),
            },
            None,
        )
    }
}

struct SceneOperation {
    loader: Arc<dyn SceneLoader>,
    location: Arc<ResourceLocation>,
    mode: LoadSceneMode,
    activate_on_load: bool,
    priority: i32,
    request: Option<Arc<dyn SceneLoadRequest>>,
}

impl SceneOperation {
    fn complete_if_loaded(
        &self,
        context: &OperationContext,
    ) {
        let request = match &self.request {
            Some(request) => request,
            None => return,
        };

        // Without activation the load parks at 90%
        let loaded = request.is_done() || (!self.activate_on_load && request.progress() >= 0.9);
        if loaded {
            context.complete(
                Some(SceneInstance::new(self.location.internal_id(), request.clone())),
                true,
                None,
            );
        }
    }
}

impl AsyncOperation for SceneOperation {
    fn execute(
        &mut self,
        context: &OperationContext,
    ) {
        if let Some(dependencies) = context.dependencies().first() {
            let members = dependencies.clone().typed::<Vec<GenericHandle>>().result();
            let failed = match members {
                Ok(Some(members)) => members
                    .iter()
                    .any(|x| x.status().ok() != Some(OperationStatus::Succeeded)),
                _ => true,
            };

            if failed {
                context.fail(TroveError::DependencyFailed(format!(
                    "Failed to load archives of scene {}",
                    self.location
                )));
                return;
            }
        }

        match self
            .loader
            .begin_load(self.location.internal_id(), self.mode, self.priority)
        {
            Ok(request) => {
                request.set_allow_activation(self.activate_on_load);
                let progress = request.clone();
                context.set_progress_callback(Arc::new(move || progress.progress()));
                self.request = Some(request);
                self.complete_if_loaded(context);
            }
            Err(e) => context.fail(e),
        }
    }

    fn receives_updates(&self) -> bool {
        true
    }

    fn update(
        &mut self,
        context: &OperationContext,
        _delta_time: f32,
    ) {
        self.complete_if_loaded(context);
    }

    fn debug_name(&self) -> String {
        format!("Scene({})", self.location.internal_id())
    }
}

struct UnloadSceneOperation {
    loader: Arc<dyn SceneLoader>,
    scene: Option<OperationHandle<SceneInstance>>,
}

impl AsyncOperation for UnloadSceneOperation {
    fn execute(
        &mut self,
        context: &OperationContext,
    ) {
        let scene = match self.scene.take() {
            Some(scene) => scene,
            None => return,
        };

        let instance = match scene.result() {
            Ok(instance) => instance,
            Err(e) => {
                context.fail(e);
                return;
            }
        };

        if let Some(instance) = &instance {
            if let Err(e) = self.loader.unload(instance) {
                log::warn!("Failed to unload scene {}: {}", instance.name(), e);
            }
        }

        let completer = context.completer();
        let registered = scene.on_destroyed(move |_| {
            let result = instance.map(|x| (*x).clone());
            if let Err(e) = completer.complete(result, true, None) {
                log::warn!("Could not complete scene unload: {}", e);
            }
        });

        match registered {
            Ok(()) => {
                if let Err(e) = scene.release() {
                    log::error!("Failed to release unloaded scene: {}", e);
                }
            }
            Err(e) => context.fail(e),
        }
    }

    fn debug_name(&self) -> String {
        "UnloadSceneOperation".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{test_manager, MockProvider};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeRequest {
        // progress in percent
        progress: AtomicU32,
        allow_activation: AtomicBool,
    }

    impl SceneLoadRequest for FakeRequest {
        fn progress(&self) -> f32 {
            self.progress.load(Ordering::SeqCst) as f32 / 100.0
        }

        fn is_done(&self) -> bool {
            self.progress.load(Ordering::SeqCst) >= 100
        }

        fn set_allow_activation(
            &self,
            allow_activation: bool,
        ) {
            self.allow_activation.store(allow_activation, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        request: Arc<FakeRequest>,
        unloaded: AtomicUsize,
    }

    impl SceneLoader for FakeLoader {
        fn begin_load(
            &self,
            _internal_id: &str,
            _mode: LoadSceneMode,
            _priority: i32,
        ) -> TroveResult<Arc<dyn SceneLoadRequest>> {
            Ok(self.request.clone())
        }

        fn unload(
            &self,
            _scene: &SceneInstance,
        ) -> TroveResult<()> {
            self.unloaded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn check_scene_completes_when_loaded() {
        let loader = Arc::new(FakeLoader::default());
        let provider = DefaultSceneProvider::new(loader.clone());
        let manager = test_manager(vec![]);
        let location = Arc::new(ResourceLocation::new("level", "level", "SceneProvider"));

        let scene = provider.provide_scene(&manager, &location, LoadSceneMode::Single, true, 0);
        assert!(loader.request.allow_activation.load(Ordering::SeqCst));

        loader.request.progress.store(95, Ordering::SeqCst);
        manager.update(0.0);
        assert!(!scene.is_done().unwrap());
        assert_eq!(scene.percent_complete().unwrap(), 0.95);

        loader.request.progress.store(100, Ordering::SeqCst);
        manager.update(0.0);
        assert_eq!(scene.status().unwrap(), OperationStatus::Succeeded);
        assert_eq!(scene.result().unwrap().unwrap().name(), "level");

        let unload = provider.release_scene(&manager, scene);
        assert_eq!(unload.status().unwrap(), OperationStatus::Succeeded);
        assert_eq!(loader.unloaded.load(Ordering::SeqCst), 1);

        unload.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_scene_without_activation_completes_at_ninety_percent() {
        let loader = Arc::new(FakeLoader::default());
        let provider = DefaultSceneProvider::new(loader.clone());
        let manager = test_manager(vec![]);
        let location = Arc::new(ResourceLocation::new("level", "level", "SceneProvider"));

        let scene = provider.provide_scene(&manager, &location, LoadSceneMode::Additive, false, 0);
        assert!(!loader.request.allow_activation.load(Ordering::SeqCst));

        loader.request.progress.store(90, Ordering::SeqCst);
        manager.update(0.0);
        assert_eq!(scene.status().unwrap(), OperationStatus::Succeeded);

        let instance = scene.result().unwrap().unwrap();
        assert!(!instance.is_activated());
        instance.activate();
        assert!(loader.request.allow_activation.load(Ordering::SeqCst));

        let unload = provider.release_scene(&manager, scene);
        unload.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_unload_waits_for_other_references() {
        let loader = Arc::new(FakeLoader::default());
        loader.request.progress.store(100, Ordering::SeqCst);
        let provider = DefaultSceneProvider::new(loader.clone());
        let manager = test_manager(vec![]);
        let location = Arc::new(ResourceLocation::new("level", "level", "SceneProvider"));

        let scene = provider.provide_scene(&manager, &location, LoadSceneMode::Single, true, 0);
        assert!(scene.is_done().unwrap());
        let other = scene.acquire().unwrap();

        let unload = provider.release_scene(&manager, scene);
        assert!(!unload.is_done().unwrap());

        other.release().unwrap();
        assert!(unload.is_done().unwrap());

        unload.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_scene_fails_when_archive_fails() {
        let loader = Arc::new(FakeLoader::default());
        let provider = DefaultSceneProvider::new(loader.clone());
        let manager = test_manager(vec![Arc::new(MockProvider::failing("mock", "missing archive"))]);
        let archive = Arc::new(ResourceLocation::new("level.bundle", "level.bundle", "mock"));
        let location = Arc::new(
            ResourceLocation::new("level", "level", "SceneProvider").with_dependencies(vec![archive]),
        );

        let scene = provider.provide_scene(&manager, &location, LoadSceneMode::Single, true, 0);
        assert_eq!(scene.status().unwrap(), OperationStatus::Failed);
        assert!(!loader.request.allow_activation.load(Ordering::SeqCst));

        scene.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
        assert_eq!(manager.operation_cache_count(), 0);
    }
}
