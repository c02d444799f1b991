use crate::operation::{AsyncOperation, OperationContext};

// Executes once every member reached a terminal state. Always succeeds, the result lists the members so
// the caller can check which of them failed.
#[derive(Default)]
pub(crate) struct GroupOperation;

impl AsyncOperation for GroupOperation {
    fn execute(
        &mut self,
        context: &OperationContext,
    ) {
        let members = context.dependencies().to_vec();
        context.complete(Some(members), true, None);
    }

    fn debug_name(&self) -> String {
        "GroupOperation".to_string()
    }
}
