use crate::error::TroveError;
use crate::handle::GenericHandle;
use crate::operation::{AsyncOperation, OperationContext, OperationStatus};
use crate::provider::{ProvideHandle, ProviderBehaviourFlags, ResourceProvider};
use std::sync::Arc;
use trove_base::{ResourceLocation, ResultType};

// Loads one location through a provider. The only dependency, if any, is the group operation loading the
// location's dependencies.
pub(crate) struct ProviderOperation {
    provider: Arc<dyn ResourceProvider>,
    location: Arc<ResourceLocation>,
    result_type: ResultType,
}

impl ProviderOperation {
    pub(crate) fn new(
        provider: Arc<dyn ResourceProvider>,
        location: Arc<ResourceLocation>,
        result_type: ResultType,
    ) -> Self {
        ProviderOperation {
            provider,
            location,
            result_type,
        }
    }
}

// Error messages of every failed member of a dependency group
fn dependency_failures(group: &GenericHandle) -> Vec<String> {
    let members = match group.clone().typed::<Vec<GenericHandle>>().result() {
        Ok(Some(members)) => members,
        _ => return vec![format!("Dependency group {:?} has no result", group.id())],
    };

    members
        .iter()
        .filter(|x| x.status().ok() != Some(OperationStatus::Succeeded))
        .map(|x| {
            x.operation_error()
                .ok()
                .flatten()
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("{:?} did not succeed", x.id()))
        })
        .collect()
}

impl AsyncOperation for ProviderOperation {
    fn execute(
        &mut self,
        context: &OperationContext,
    ) {
        let dependency = context.dependencies().first().cloned();
        if let Some(dependency) = &dependency {
            let allow_failures = self
                .provider
                .behaviour_flags()
                .contains(ProviderBehaviourFlags::CAN_PROVIDE_WITH_FAILED_DEPENDENCIES);
            if !allow_failures {
                let failures = dependency_failures(dependency);
                if !failures.is_empty() {
                    context.fail(TroveError::DependencyFailed(format!(
                        "Dependency failed while providing {}:\n{}",
                        self.location,
                        failures.join("\n")
                    )));
                    return;
                }
            }
        }

        // Providers that report real progress replace this
        context.set_progress_callback(Arc::new(|| 0.5));

        let handle = ProvideHandle::new(
            context.completer(),
            self.location.clone(),
            self.result_type,
            dependency,
            self.provider.clone(),
        );
        self.provider.provide(handle);
    }

    fn destroy(
        &mut self,
        context: &OperationContext,
    ) {
        let handle = context.handle();
        if handle.status().ok() == Some(OperationStatus::Succeeded) {
            let result = handle.result_erased().ok().flatten();
            self.provider.release(&self.location, result);
        }
    }

    fn debug_name(&self) -> String {
        format!(
            "Resource<{}>({})",
            self.result_type.element_name(),
            self.location.internal_id()
        )
    }
}
