use crate::error::TroveError;
use crate::handle::{GenericHandle, OperationHandle};
use crate::operation::{AsyncOperation, OperationContext, OperationStatus, ProgressCallback};
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

type ChainCallback<TDep, TOut> =
    Box<dyn FnOnce(&OperationHandle<TDep>) -> OperationHandle<TOut> + Send>;

pub(crate) struct ChainOperation<TDep, TOut> {
    callback: Option<ChainCallback<TDep, TOut>>,
    // Operation returned by the callback, owned by the chain until it is destroyed
    wrapped: Arc<Mutex<Option<GenericHandle>>>,
}

impl<TDep: Any + Send + Sync, TOut: Any + Send + Sync> ChainOperation<TDep, TOut> {
    pub(crate) fn new<F>(callback: F) -> Self
    where
        F: FnOnce(&OperationHandle<TDep>) -> OperationHandle<TOut> + Send + 'static,
    {
        ChainOperation {
            callback: Some(Box::new(callback)),
            wrapped: Arc::default(),
        }
    }

    // Half of the progress comes from the dependency, the other half from the wrapped operation
    pub(crate) fn progress_callback(
        &self,
        dependency: GenericHandle,
    ) -> ProgressCallback {
        let wrapped = self.wrapped.clone();
        Arc::new(move || {
            let dependency_progress = dependency.percent_complete().unwrap_or(1.0);
            let wrapped = wrapped
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let wrapped_progress = wrapped
                .map(|x| x.percent_complete().unwrap_or(1.0))
                .unwrap_or(0.0);
            (dependency_progress + wrapped_progress) / 2.0
        })
    }
}

impl<TDep: Any + Send + Sync, TOut: Any + Send + Sync> AsyncOperation for ChainOperation<TDep, TOut> {
    fn execute(
        &mut self,
        context: &OperationContext,
    ) {
        let dependency = match context.dependencies().first() {
            Some(dependency) => dependency.clone().typed::<TDep>(),
            None => {
                context.fail(TroveError::DependencyFailed(format!(
                    "ChainOperation of Type: {} has no dependency",
                    std::any::type_name::<TOut>()
                )));
                return;
            }
        };

        if dependency.status().ok() != Some(OperationStatus::Succeeded) {
            let inner = dependency
                .operation_error()
                .ok()
                .flatten()
                .map(|x| x.to_string())
                .unwrap_or_default();
            context.fail(TroveError::DependencyFailed(format!(
                "ChainOperation of Type: {} failed because dependent operation failed\n{}",
                std::any::type_name::<TOut>(),
                inner
            )));
            return;
        }

        let callback = match self.callback.take() {
            Some(callback) => callback,
            None => return,
        };

        let wrapped = callback(&dependency);
        *self.wrapped.lock().unwrap_or_else(PoisonError::into_inner) = Some(wrapped.untyped());

        let completer = context.completer();
        let registered = wrapped.on_completed(move |wrapped| {
            let success = wrapped.status().ok() == Some(OperationStatus::Succeeded);
            let result = wrapped.result_erased().ok().flatten();
            let error = wrapped.operation_error().ok().flatten();
            if let Err(e) = completer.complete_erased(result, success, error) {
                log::debug!("Chain {:?} not completed: {}", completer.operation_id(), e);
            }
        });

        if let Err(e) = registered {
            context.fail(e);
        }
    }

    fn destroy(
        &mut self,
        _context: &OperationContext,
    ) {
        let wrapped = self
            .wrapped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(wrapped) = wrapped {
            if let Err(e) = wrapped.release() {
                log::error!("Failed to release operation wrapped by chain: {}", e);
            }
        }
    }

    fn debug_name(&self) -> String {
        format!("ChainOperation<{}>", std::any::type_name::<TOut>())
    }
}
