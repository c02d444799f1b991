use crate::error::{TroveError, TroveResult};
use crate::operation::OperationStatus;
use crate::resource_manager::{ManagerShared, ResourceManager};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use trove_base::{ErasedObject, OperationId};

/// Untyped reference to an operation.
///
/// Cloning a handle does not change the operation's reference count. Every handle returned by a
/// manager API owns one reference that must be given back with `release`; `acquire` hands out an
/// additional owning handle. Using a handle after its operation was destroyed returns
/// `TroveError::InvalidHandle`.
#[derive(Clone)]
pub struct GenericHandle {
    manager: Weak<ManagerShared>,
    id: OperationId,
}

impl GenericHandle {
    pub(crate) fn new(
        manager: Weak<ManagerShared>,
        id: OperationId,
    ) -> Self {
        GenericHandle { manager, id }
    }

    fn manager(&self) -> TroveResult<ResourceManager> {
        self.manager
            .upgrade()
            .map(ResourceManager::from_shared)
            .ok_or(TroveError::InvalidHandle)
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn typed<T: Any + Send + Sync>(self) -> OperationHandle<T> {
        OperationHandle {
            inner: self,
            phantom_data: PhantomData,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.manager()
            .map(|manager| manager.is_operation_alive(self.id))
            .unwrap_or(false)
    }

    pub fn status(&self) -> TroveResult<OperationStatus> {
        self.manager()?.operation_status(self.id)
    }

    pub fn is_done(&self) -> TroveResult<bool> {
        Ok(self.status()?.is_done())
    }

    pub fn result_erased(&self) -> TroveResult<Option<ErasedObject>> {
        self.manager()?.operation_result(self.id)
    }

    /// The error the operation failed with, if it failed
    pub fn operation_error(&self) -> TroveResult<Option<TroveError>> {
        self.manager()?.operation_error(self.id)
    }

    pub fn percent_complete(&self) -> TroveResult<f32> {
        self.manager()?.operation_percent_complete(self.id)
    }

    pub fn reference_count(&self) -> TroveResult<u32> {
        self.manager()?.operation_reference_count(self.id)
    }

    pub fn debug_name(&self) -> TroveResult<String> {
        self.manager()?.operation_debug_name(self.id)
    }

    /// Adds a reference and returns the handle that owns it
    pub fn acquire(&self) -> TroveResult<GenericHandle> {
        self.manager()?.acquire_operation(self.id)?;
        Ok(self.clone())
    }

    /// Gives back the reference this handle owns. The operation is destroyed when the last reference
    /// is released.
    pub fn release(self) -> TroveResult<()> {
        self.manager()?.release_operation(self.id)
    }

    /// Runs `callback` once the operation completes. If it already completed, the callback runs on
    /// the next `ResourceManager::update` and the operation is kept alive until then.
    pub fn on_completed<F>(
        &self,
        callback: F,
    ) -> TroveResult<()>
    where
        F: FnOnce(&GenericHandle) + Send + 'static,
    {
        self.manager()?
            .register_completed_callback(self.id, Box::new(callback))
    }

    /// Runs `callback` while the operation is being destroyed. The result can still be read but the
    /// reference count can no longer change.
    pub fn on_destroyed<F>(
        &self,
        callback: F,
    ) -> TroveResult<()>
    where
        F: FnOnce(&GenericHandle) + Send + 'static,
    {
        self.manager()?
            .register_destroyed_callback(self.id, Box::new(callback))
    }
}

impl PartialEq for GenericHandle {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.id == other.id && self.manager.ptr_eq(&other.manager)
    }
}

impl Eq for GenericHandle {}

impl fmt::Debug for GenericHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("GenericHandle").field(&self.id).finish()
    }
}

/// Typed reference to an operation that produces a `T`
pub struct OperationHandle<T> {
    inner: GenericHandle,
    phantom_data: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> OperationHandle<T> {
    pub fn untyped(&self) -> GenericHandle {
        self.inner.clone()
    }

    pub fn into_untyped(self) -> GenericHandle {
        self.inner
    }

    /// Reinterprets the result type. Reading the result fails if the stored value is not a `U`.
    pub fn convert<U: Any + Send + Sync>(self) -> OperationHandle<U> {
        self.inner.typed()
    }

    /// The result, if the operation completed with one
    pub fn result(&self) -> TroveResult<Option<Arc<T>>> {
        match self.inner.result_erased()? {
            Some(result) => match result.downcast::<T>() {
                Ok(result) => Ok(Some(result)),
                Err(_) => Err(TroveError::TypeMismatch {
                    expected: std::any::type_name::<T>(),
                    context: format!("Operation {:?}", self.inner.id),
                }),
            },
            None => Ok(None),
        }
    }

    pub fn acquire(&self) -> TroveResult<OperationHandle<T>> {
        Ok(self.inner.acquire()?.typed())
    }

    pub fn release(self) -> TroveResult<()> {
        self.inner.release()
    }

    pub fn on_completed<F>(
        &self,
        callback: F,
    ) -> TroveResult<()>
    where
        F: FnOnce(&OperationHandle<T>) + Send + 'static,
    {
        self.inner
            .on_completed(move |handle| callback(&handle.clone().typed()))
    }

    pub fn on_destroyed<F>(
        &self,
        callback: F,
    ) -> TroveResult<()>
    where
        F: FnOnce(&OperationHandle<T>) + Send + 'static,
    {
        self.inner
            .on_destroyed(move |handle| callback(&handle.clone().typed()))
    }
}

impl<T> Deref for OperationHandle<T> {
    type Target = GenericHandle;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> Clone for OperationHandle<T> {
    fn clone(&self) -> Self {
        OperationHandle {
            inner: self.inner.clone(),
            phantom_data: PhantomData,
        }
    }
}

impl<T> PartialEq for OperationHandle<T> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.inner == other.inner
    }
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.inner.id)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: Any + Send + Sync> From<OperationHandle<T>> for GenericHandle {
    fn from(handle: OperationHandle<T>) -> Self {
        handle.inner
    }
}
