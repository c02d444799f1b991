use crate::error::{TroveError, TroveResult};
use crate::handle::GenericHandle;
use crate::operation::{AsyncOperation, OperationContext, OperationStatus};
use crate::resource_manager::ResourceManager;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use trove_base::hashing::HashMap;
use trove_base::ErasedObject;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An object created from a loaded prefab
#[derive(Clone)]
pub struct Instance {
    id: InstanceId,
    object: ErasedObject,
    scene: Option<String>,
}

impl Instance {
    pub fn new(
        object: ErasedObject,
        scene: Option<String>,
    ) -> Self {
        Instance {
            id: InstanceId::next(),
            object,
            scene,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn object(&self) -> &ErasedObject {
        &self.object
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.object.clone().downcast::<T>().ok()
    }

    /// Scene the instance was created into
    pub fn scene(&self) -> Option<&str> {
        self.scene.as_deref()
    }
}

impl fmt::Debug for Instance {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("scene", &self.scene)
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstantiationParameters {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub parent: Option<String>,
    pub scene: Option<String>,
}

/// Creates and destroys instances of loaded prefabs
pub trait InstanceProvider: Send + Sync {
    /// `prefab` has completed successfully. Implementations that keep the prefab alive for the lifetime
    /// of the instance acquire it here.
    fn provide_instance(
        &self,
        manager: &ResourceManager,
        prefab: &GenericHandle,
        parameters: &InstantiationParameters,
    ) -> TroveResult<Instance>;

    /// Releases whatever `provide_instance` acquired and destroys the instance. Unknown or missing
    /// instances are logged and otherwise ignored.
    fn release_instance(
        &self,
        instance: Option<&Instance>,
    );
}

/// Engine side of instantiation, used by `DefaultInstanceProvider`
pub trait Instantiator: Send + Sync {
    fn instantiate(
        &self,
        prefab: &ErasedObject,
        parameters: &InstantiationParameters,
    ) -> TroveResult<ErasedObject>;

    fn destroy(
        &self,
        object: &ErasedObject,
    );
}

/// Keeps each instance's prefab acquired until the instance is released
pub struct DefaultInstanceProvider {
    instantiator: Arc<dyn Instantiator>,
    instances: Mutex<HashMap<InstanceId, GenericHandle>>,
}

impl DefaultInstanceProvider {
    pub fn new(instantiator: Arc<dyn Instantiator>) -> Self {
        DefaultInstanceProvider {
            instantiator,
            instances: Default::default(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl InstanceProvider for DefaultInstanceProvider {
    fn provide_instance(
        &self,
        _manager: &ResourceManager,
        prefab: &GenericHandle,
        parameters: &InstantiationParameters,
    ) -> TroveResult<Instance> {
        let prefab_object = prefab.result_erased()?.ok_or_else(|| {
            TroveError::ProvideFailed(format!("Prefab {:?} has no result", prefab.id()))
        })?;

        let object = self.instantiator.instantiate(&prefab_object, parameters)?;
        let prefab = prefab.acquire()?;
        let instance = Instance::new(object, parameters.scene.clone());
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance.id(), prefab);
        Ok(instance)
    }

    fn release_instance(
        &self,
        instance: Option<&Instance>,
    ) {
        let instance = match instance {
            Some(instance) => instance,
            None => {
                log::warn!("Releasing a null instance");
                return;
            }
        };

        let prefab = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&instance.id());

        match prefab {
            Some(prefab) => {
                if let Err(e) = prefab.release() {
                    log::error!("Failed to release prefab of {:?}: {}", instance.id(), e);
                }
            }
            None => log::warn!(
                "Releasing unknown instance {:?}, its prefab is not released",
                instance.id()
            ),
        }

        self.instantiator.destroy(instance.object());
    }
}

// Depends on the prefab load, produces an `Instance`
pub(crate) struct InstanceOperation {
    provider: Arc<dyn InstanceProvider>,
    parameters: InstantiationParameters,
    instance: Option<Instance>,
}

impl InstanceOperation {
    pub(crate) fn new(
        provider: Arc<dyn InstanceProvider>,
        parameters: InstantiationParameters,
    ) -> Self {
        InstanceOperation {
            provider,
            parameters,
            instance: None,
        }
    }
}

impl AsyncOperation for InstanceOperation {
    fn execute(
        &mut self,
        context: &OperationContext,
    ) {
        let prefab = match context.dependencies().first() {
            Some(prefab) => prefab.clone(),
            None => {
                context.fail(TroveError::DependencyFailed(
                    "Instance operation has no prefab".to_string(),
                ));
                return;
            }
        };

        if prefab.status().ok() != Some(OperationStatus::Succeeded) {
            let inner = prefab
                .operation_error()
                .ok()
                .flatten()
                .map(|x| x.to_string())
                .unwrap_or_default();
            context.fail(TroveError::DependencyFailed(format!(
                "Failed to load prefab for instance\n{}",
                inner
            )));
            return;
        }

        match self
            .provider
            .provide_instance(context.manager(), &prefab, &self.parameters)
        {
            Ok(instance) => {
                context.manager().track_instance(
                    instance.id(),
                    context.operation_id(),
                    instance.scene().map(|x| x.to_string()),
                );
                self.instance = Some(instance.clone());
                context.complete(Some(instance), true, None);
            }
            Err(e) => context.fail(e),
        }
    }

    fn destroy(
        &mut self,
        _context: &OperationContext,
    ) {
        if let Some(instance) = self.instance.take() {
            self.provider.release_instance(Some(&instance));
        }
    }

    fn debug_name(&self) -> String {
        "InstanceOperation".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{test_manager, MockProvider};
    use std::sync::atomic::AtomicUsize;
    use trove_base::ResourceLocation;

    #[derive(Default)]
    struct CountingInstantiator {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl Instantiator for CountingInstantiator {
        fn instantiate(
            &self,
            prefab: &ErasedObject,
            _parameters: &InstantiationParameters,
        ) -> TroveResult<ErasedObject> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let value = prefab.clone().downcast::<i32>().unwrap();
            Ok(Arc::new(*value * 2))
        }

        fn destroy(
            &self,
            _object: &ErasedObject,
        ) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn check_release_instance_decrements_prefab_once() {
        let manager = test_manager(vec![]);
        let instantiator = Arc::new(CountingInstantiator::default());
        let provider = DefaultInstanceProvider::new(instantiator.clone());

        let prefab = manager.create_completed_operation(Some(21), None);
        assert_eq!(prefab.reference_count().unwrap(), 1);

        let instance = provider
            .provide_instance(&manager, &prefab, &InstantiationParameters::default())
            .unwrap();
        assert_eq!(*instance.downcast::<i32>().unwrap(), 42);
        assert_eq!(prefab.reference_count().unwrap(), 2);

        provider.release_instance(Some(&instance));
        assert_eq!(prefab.reference_count().unwrap(), 1);
        assert_eq!(instantiator.destroyed.load(Ordering::SeqCst), 1);

        // Second release warns and leaves the prefab alone
        provider.release_instance(Some(&instance));
        assert_eq!(prefab.reference_count().unwrap(), 1);
        provider.release_instance(None);
        assert_eq!(provider.instance_count(), 0);

        prefab.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_manager_instance_round_trip() {
        let mock = Arc::new(MockProvider::sync("mock", 5));
        let manager = test_manager(vec![mock.clone()]);
        let instantiator = Arc::new(CountingInstantiator::default());
        let provider = Arc::new(DefaultInstanceProvider::new(instantiator.clone()));

        let location = Arc::new(ResourceLocation::new("prefab", "prefab", "mock"));
        let parameters = InstantiationParameters {
            scene: Some("level1".to_string()),
            ..Default::default()
        };
        let handle = manager.provide_instance(provider.clone(), &location, parameters);
        assert_eq!(handle.status().unwrap(), OperationStatus::Succeeded);

        let instance = handle.result().unwrap().unwrap();
        assert_eq!(*instance.downcast::<i32>().unwrap(), 10);
        assert_eq!(instance.scene(), Some("level1"));
        assert_eq!(provider.instance_count(), 1);

        assert!(manager.release_instance(&instance));
        assert_eq!(instantiator.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(provider.instance_count(), 0);
        assert_eq!(mock.release_count(), 1);
        assert_eq!(manager.operation_count(), 0);

        // Already released, nothing changes
        assert!(!manager.release_instance(&instance));
        assert_eq!(instantiator.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.operation_cache_count(), 0);
    }

    #[test]
    fn check_cleanup_scene_instances() {
        let manager = test_manager(vec![Arc::new(MockProvider::sync("mock", 1))]);
        let provider = Arc::new(DefaultInstanceProvider::new(Arc::new(
            CountingInstantiator::default(),
        )));
        let location = Arc::new(ResourceLocation::new("prefab", "prefab", "mock"));

        let in_scene = |scene: &str| InstantiationParameters {
            scene: Some(scene.to_string()),
            ..Default::default()
        };
        let _a = manager.provide_instance(provider.clone(), &location, in_scene("menu"));
        let _b = manager.provide_instance(provider.clone(), &location, in_scene("menu"));
        let c = manager.provide_instance(provider.clone(), &location, in_scene("level"));
        assert_eq!(provider.instance_count(), 3);

        assert_eq!(manager.cleanup_scene_instances("menu"), 2);
        assert_eq!(provider.instance_count(), 1);

        let instance = c.result().unwrap().unwrap();
        assert!(manager.release_instance(&instance));
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_failed_prefab_fails_instance() {
        let manager = test_manager(vec![Arc::new(MockProvider::failing("mock", "no prefab"))]);
        let provider = Arc::new(DefaultInstanceProvider::new(Arc::new(
            CountingInstantiator::default(),
        )));
        let location = Arc::new(ResourceLocation::new("prefab", "prefab", "mock"));

        let handle =
            manager.provide_instance(provider, &location, InstantiationParameters::default());
        assert_eq!(handle.status().unwrap(), OperationStatus::Failed);
        let error = handle.operation_error().unwrap().unwrap().to_string();
        assert!(error.contains("no prefab"));

        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }
}
