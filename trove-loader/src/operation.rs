use crate::error::{TroveError, TroveResult};
use crate::handle::GenericHandle;
use crate::resource_manager::{ManagerShared, ResourceManager};
use std::any::Any;
use std::sync::{Arc, Weak};
use trove_base::{ErasedObject, OperationId};

/// Lifecycle of an operation. Transitions only move forward: None -> InProgress -> Succeeded/Failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    None,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_done(self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }
}

/// Returns completion in the range 0..=1 while an operation is in flight
pub type ProgressCallback = Arc<dyn Fn() -> f32 + Send + Sync>;

/// A unit of work driven by the resource manager.
///
/// The manager calls `execute` once, after every dependency reached a terminal state. The operation
/// must eventually complete itself through the context (or a completer taken from it). `destroy` runs
/// once when the last reference is released. Dependencies are acquired and released by the manager,
/// implementations only release handles they acquired themselves.
///
/// None of these are called while the manager is locked, so implementations may freely call back
/// into the manager.
pub trait AsyncOperation: Send {
    fn execute(
        &mut self,
        context: &OperationContext,
    );

    fn destroy(
        &mut self,
        _context: &OperationContext,
    ) {
    }

    fn debug_name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    // Operations that return true here get `update` every tick until they complete
    fn receives_updates(&self) -> bool {
        false
    }

    fn update(
        &mut self,
        _context: &OperationContext,
        _delta_time: f32,
    ) {
    }
}

/// Completes an operation from outside of its `execute` call, for example from a callback or a
/// provider update. Cloning it does not keep the operation alive.
#[derive(Clone)]
pub struct OperationCompleter {
    manager: Weak<ManagerShared>,
    id: OperationId,
}

impl OperationCompleter {
    pub(crate) fn new(
        manager: Weak<ManagerShared>,
        id: OperationId,
    ) -> Self {
        OperationCompleter { manager, id }
    }

    pub fn operation_id(&self) -> OperationId {
        self.id
    }

    pub fn handle(&self) -> GenericHandle {
        GenericHandle::new(self.manager.clone(), self.id)
    }

    pub fn manager(&self) -> TroveResult<ResourceManager> {
        self.manager
            .upgrade()
            .map(ResourceManager::from_shared)
            .ok_or(TroveError::InvalidHandle)
    }

    /// True once nobody can observe a result from this operation anymore. Long-running work should
    /// check this before doing more work on its behalf.
    pub fn is_destroyed(&self) -> bool {
        match self.manager() {
            Ok(manager) => !manager.is_operation_alive(self.id),
            Err(_) => true,
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
        self.manager()?
            .complete_operation(self.id, result, success, error)
    }

    pub fn fail(
        &self,
        error: TroveError,
    ) -> TroveResult<()> {
        self.complete_erased(None, false, Some(error))
    }
}

/// Passed to every `AsyncOperation` callback
pub struct OperationContext<'a> {
    manager: &'a ResourceManager,
    completer: OperationCompleter,
    dependencies: Vec<GenericHandle>,
}

impl<'a> OperationContext<'a> {
    pub(crate) fn new(
        manager: &'a ResourceManager,
        id: OperationId,
        dependencies: &[OperationId],
    ) -> Self {
        let weak = manager.downgrade();
        let dependencies = dependencies
            .iter()
            .map(|x| GenericHandle::new(weak.clone(), *x))
            .collect();

        OperationContext {
            manager,
            completer: OperationCompleter::new(weak, id),
            dependencies,
        }
    }

    pub fn manager(&self) -> &ResourceManager {
        self.manager
    }

    pub fn operation_id(&self) -> OperationId {
        self.completer.id
    }

    /// Non-owning handle to the operation being driven
    pub fn handle(&self) -> GenericHandle {
        self.completer.handle()
    }

    /// Non-owning handles to the dependencies this operation was started with, in order
    pub fn dependencies(&self) -> &[GenericHandle] {
        &self.dependencies
    }

    pub fn completer(&self) -> OperationCompleter {
        self.completer.clone()
    }

    pub fn set_progress_callback(
        &self,
        callback: ProgressCallback,
    ) {
        self.manager.set_progress_callback(self.completer.id, callback);
    }

    pub fn complete<T: Any + Send + Sync>(
        &self,
        result: Option<T>,
        success: bool,
        error: Option<TroveError>,
    ) {
        if let Err(e) = self.completer.complete(result, success, error) {
            log::warn!("Could not complete {:?}: {}", self.completer.id, e);
        }
    }

    pub fn complete_erased(
        &self,
        result: Option<ErasedObject>,
        success: bool,
        error: Option<TroveError>,
    ) {
        if let Err(e) = self.completer.complete_erased(result, success, error) {
            log::warn!("Could not complete {:?}: {}", self.completer.id, e);
        }
    }

    pub fn fail(
        &self,
        error: TroveError,
    ) {
        self.complete_erased(None, false, Some(error))
    }
}
