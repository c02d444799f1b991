mod chain;
pub(crate) use chain::ChainOperation;

mod completed;
pub(crate) use completed::CompletedOperation;

mod group;
pub(crate) use group::GroupOperation;

mod provider_operation;
pub(crate) use provider_operation::ProviderOperation;
