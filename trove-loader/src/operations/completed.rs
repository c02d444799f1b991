use crate::error::TroveError;
use crate::operation::{AsyncOperation, OperationContext};
use trove_base::ErasedObject;

// Completes as soon as it executes, failed if an error was given
pub(crate) struct CompletedOperation {
    result: Option<ErasedObject>,
    error: Option<TroveError>,
}

impl CompletedOperation {
    pub(crate) fn new(
        result: Option<ErasedObject>,
        error: Option<TroveError>,
    ) -> Self {
        CompletedOperation { result, error }
    }
}

impl AsyncOperation for CompletedOperation {
    fn execute(
        &mut self,
        context: &OperationContext,
    ) {
        let success = self.error.is_none();
        context.complete_erased(self.result.take(), success, self.error.take());
    }

    fn debug_name(&self) -> String {
        "CompletedOperation".to_string()
    }
}
