pub use trove_base;

mod error;
pub use error::{TroveError, TroveResult};

mod config;
pub use config::{DiagnosticsCallback, ErrorSink, ResourceManagerConfig};

mod diagnostics;
pub use diagnostics::{DiagnosticEvent, DiagnosticEventType};

mod operation;
pub use operation::{
    AsyncOperation, OperationCompleter, OperationContext, OperationStatus, ProgressCallback,
};

mod handle;
pub use handle::{GenericHandle, OperationHandle};

mod operations;

mod resource_manager;
pub use resource_manager::{ResourceManager, UpdateReceiver, UpdateReceiverId};

mod provider;
pub use provider::{ProvideHandle, ProviderBehaviourFlags, ResourceProvider};

pub mod providers;

pub mod archive;
pub use archive::{ArchiveLoader, ArchiveResource, BlobArchive, LoadedArchive};

mod disk_io;
pub use disk_io::DiskArchiveLoader;

pub mod catalog;
pub use catalog::{ContentCatalogData, ResourceLocationMap, ResourceLocator};

pub mod instance;
pub use instance::{
    DefaultInstanceProvider, Instance, InstanceId, InstanceProvider, InstantiationParameters,
    Instantiator,
};

pub mod scene;
pub use scene::{DefaultSceneProvider, LoadSceneMode, SceneInstance, SceneLoader, SceneProvider};

pub use trove_base::{ErasedObject, OperationId, ResourceLocation, ResultShape, ResultType};

#[cfg(test)]
mod test_util;
