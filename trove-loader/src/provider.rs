use crate::error::{TroveError, TroveResult};
use crate::handle::GenericHandle;
use crate::operation::{OperationCompleter, ProgressCallback};
use crate::resource_manager::ResourceManager;
use std::any::Any;
use std::sync::Arc;
use trove_base::{ErasedObject, ResourceLocation, ResultType};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderBehaviourFlags(u32);

impl ProviderBehaviourFlags {
    pub const NONE: ProviderBehaviourFlags = ProviderBehaviourFlags(0);
    // Provide is still called when some dependencies failed, instead of failing the operation
    pub const CAN_PROVIDE_WITH_FAILED_DEPENDENCIES: ProviderBehaviourFlags =
        ProviderBehaviourFlags(1);

    pub fn contains(
        self,
        other: ProviderBehaviourFlags,
    ) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ProviderBehaviourFlags {
    type Output = ProviderBehaviourFlags;

    fn bitor(
        self,
        rhs: Self,
    ) -> Self::Output {
        ProviderBehaviourFlags(self.0 | rhs.0)
    }
}

/// Turns a location into a loaded object.
///
/// Providers are shared between operations and called without the manager locked, so `provide` may
/// call back into the manager (for example to load another location) and may complete the handle
/// before returning.
pub trait ResourceProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// The type loaded when the caller does not ask for one
    fn default_type(
        &self,
        location: &ResourceLocation,
    ) -> ResultType;

    fn can_provide(
        &self,
        result_type: &ResultType,
        location: &ResourceLocation,
    ) -> bool {
        self.default_type(location).element_type_id() == result_type.element_type_id()
    }

    /// Starts producing the object. Must eventually complete `handle` exactly once.
    fn provide(
        &self,
        handle: ProvideHandle,
    );

    /// Called when an object this provider produced is no longer referenced
    fn release(
        &self,
        _location: &ResourceLocation,
        _asset: Option<ErasedObject>,
    ) {
    }

    fn behaviour_flags(&self) -> ProviderBehaviourFlags {
        ProviderBehaviourFlags::NONE
    }

    // Called once per manager update, used by providers that poll in-flight requests
    fn update(
        &self,
        _manager: &ResourceManager,
        _delta_time: f32,
    ) {
    }
}

/// Given to `ResourceProvider::provide`. Valid until the operation completes or is destroyed,
/// after that every attempt to complete it is rejected and the rejected object is handed back to
/// the provider's `release`.
#[derive(Clone)]
pub struct ProvideHandle {
    completer: OperationCompleter,
    location: Arc<ResourceLocation>,
    result_type: ResultType,
    dependency: Option<GenericHandle>,
    provider: Arc<dyn ResourceProvider>,
}

impl ProvideHandle {
    pub(crate) fn new(
        completer: OperationCompleter,
        location: Arc<ResourceLocation>,
        result_type: ResultType,
        dependency: Option<GenericHandle>,
        provider: Arc<dyn ResourceProvider>,
    ) -> Self {
        ProvideHandle {
            completer,
            location,
            result_type,
            dependency,
            provider,
        }
    }

    pub fn location(&self) -> &Arc<ResourceLocation> {
        &self.location
    }

    pub fn result_type(&self) -> &ResultType {
        &self.result_type
    }

    pub fn manager(&self) -> TroveResult<ResourceManager> {
        self.completer.manager()
    }

    /// Non-owning handle to the operation being provided
    pub fn handle(&self) -> GenericHandle {
        self.completer.handle()
    }

    pub fn is_destroyed(&self) -> bool {
        self.completer.is_destroyed()
    }

    /// False once the operation completed or was destroyed
    pub fn is_valid(&self) -> bool {
        !self.is_destroyed() && !self.handle().is_done().unwrap_or(true)
    }

    pub fn dependency_count(&self) -> usize {
        self.location.dependencies().len()
    }

    /// Results of the location's dependencies, in the same order as `location().dependencies()`
    pub fn dependencies(&self) -> Vec<Option<ErasedObject>> {
        let members = match &self.dependency {
            Some(dependency) => dependency.clone().typed::<Vec<GenericHandle>>().result(),
            None => return Vec::default(),
        };

        match members {
            Ok(Some(members)) => members
                .iter()
                .map(|x| x.result_erased().ok().flatten())
                .collect(),
            _ => Vec::default(),
        }
    }

    pub fn set_progress_callback(
        &self,
        callback: ProgressCallback,
    ) {
        if let Ok(manager) = self.manager() {
            manager.set_progress_callback(self.completer.operation_id(), callback);
        }
    }

    pub fn complete<T: Any + Send + Sync>(
        &self,
        result: Option<T>,
        success: bool,
        error: Option<TroveError>,
    ) -> TroveResult<()> {
        self.complete_erased(result.map(|x| Arc::new(x) as ErasedObject), success, error)
    }

    pub fn complete_erased(
        &self,
        result: Option<ErasedObject>,
        success: bool,
        error: Option<TroveError>,
    ) -> TroveResult<()> {
        let result = match result {
            Some(result) if !self.result_type.matches(&result) => {
                let error = TroveError::TypeMismatch {
                    expected: self.result_type.element_name(),
                    context: format!(
                        "Provider with id {} for location {}",
                        self.provider.provider_id(),
                        self.location
                    ),
                };
                self.provider.release(&self.location, Some(result));
                return self.completer.fail(error);
            }
            result => result,
        };

        let rejected = result.clone();
        let completed = self.completer.complete_erased(result, success, error);
        if let Err(e) = &completed {
            log::warn!(
                "Provider {} completed {} after the operation finished: {}",
                self.provider.provider_id(),
                self.location,
                e
            );
            if rejected.is_some() {
                self.provider.release(&self.location, rejected);
            }
        }

        completed
    }

    /// Completes with several loaded objects, collected into the requested result shape
    pub fn complete_many(
        &self,
        items: Vec<ErasedObject>,
        success: bool,
        error: Option<TroveError>,
    ) -> TroveResult<()> {
        match self.result_type.collect(items) {
            Some(result) => self.complete_erased(Some(result), success, error),
            None => self.completer.fail(TroveError::TypeMismatch {
                expected: self.result_type.element_name(),
                context: format!(
                    "Provider with id {} for location {}",
                    self.provider.provider_id(),
                    self.location
                ),
            }),
        }
    }

    pub fn fail(
        &self,
        error: TroveError,
    ) -> TroveResult<()> {
        self.completer.fail(error)
    }
}
