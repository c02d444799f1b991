use crate::error::{TroveError, TroveResult};
use crate::provider::{ProvideHandle, ResourceProvider};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::marker::PhantomData;
use trove_base::{ResourceLocation, ResultType};

/// Strips a `file://` scheme, leaving any other id untouched
pub(crate) fn local_path(internal_id: &str) -> &str {
    internal_id.strip_prefix("file://").unwrap_or(internal_id)
}

fn read_text(location: &ResourceLocation) -> TroveResult<String> {
    let path = local_path(location.internal_id());
    if path.contains("://") {
        return Err(TroveError::InvalidPath(format!(
            "Only local files can be read as text: '{}'",
            location.internal_id()
        )));
    }

    std::fs::read_to_string(path).map_err(|e| {
        TroveError::ProvideFailed(format!("Failed to read text at {}: {}", path, e))
    })
}

/// Loads a local file as a `String`
pub struct TextDataProvider {
    provider_id: String,
    // A failed read completes successfully without a result
    ignore_failures: bool,
}

impl Default for TextDataProvider {
    fn default() -> Self {
        TextDataProvider {
            provider_id: Self::PROVIDER_ID.to_string(),
            ignore_failures: false,
        }
    }
}

impl TextDataProvider {
    pub const PROVIDER_ID: &'static str = "TextDataProvider";

    pub fn with_provider_id(
        mut self,
        provider_id: impl Into<String>,
    ) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_ignore_failures(
        mut self,
        ignore_failures: bool,
    ) -> Self {
        self.ignore_failures = ignore_failures;
        self
    }
}

impl ResourceProvider for TextDataProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn default_type(
        &self,
        _location: &ResourceLocation,
    ) -> ResultType {
        ResultType::single::<String>()
    }

    fn provide(
        &self,
        handle: ProvideHandle,
    ) {
        let completed = match read_text(handle.location()) {
            Ok(text) => handle.complete(Some(text), true, None),
            Err(e) if self.ignore_failures => {
                log::debug!("Ignoring failed text load: {}", e);
                handle.complete::<String>(None, true, None)
            }
            Err(e) => handle.fail(e),
        };

        if let Err(e) = completed {
            log::warn!("TextDataProvider could not complete {}: {}", handle.location(), e);
        }
    }
}

/// Loads a local JSON file and deserializes it as a `T`
pub struct JsonAssetProvider<T> {
    provider_id: String,
    ignore_failures: bool,
    phantom_data: PhantomData<fn() -> T>,
}

impl<T> Default for JsonAssetProvider<T> {
    fn default() -> Self {
        JsonAssetProvider {
            provider_id: "JsonAssetProvider".to_string(),
            ignore_failures: false,
            phantom_data: PhantomData,
        }
    }
}

impl<T> JsonAssetProvider<T> {
    pub fn with_provider_id(
        mut self,
        provider_id: impl Into<String>,
    ) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_ignore_failures(
        mut self,
        ignore_failures: bool,
    ) -> Self {
        self.ignore_failures = ignore_failures;
        self
    }
}

impl<T: DeserializeOwned + Any + Send + Sync> ResourceProvider for JsonAssetProvider<T> {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn default_type(
        &self,
        _location: &ResourceLocation,
    ) -> ResultType {
        ResultType::single::<T>()
    }

    fn provide(
        &self,
        handle: ProvideHandle,
    ) {
        let loaded = read_text(handle.location()).and_then(|text| {
            profiling::scope!("serde_json::from_str");
            Ok(serde_json::from_str::<T>(&text)?)
        });

        let completed = match loaded {
            Ok(value) => handle.complete(Some(value), true, None),
            Err(e) if self.ignore_failures => {
                log::debug!("Ignoring failed json load: {}", e);
                handle.complete::<T>(None, true, None)
            }
            Err(e) => handle.fail(e),
        };

        if let Err(e) = completed {
            log::warn!("JsonAssetProvider could not complete {}: {}", handle.location(), e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{test_manager, TempDir};
    use crate::OperationStatus;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Settings {
        volume: u32,
    }

    #[test]
    fn check_text_provider_reads_file() {
        let dir = TempDir::new("text_provider");
        let path = dir.path().join("greeting.txt");
        std::fs::write(&path, "hello").unwrap();

        let manager = test_manager(vec![Arc::new(TextDataProvider::default())]);
        let location = Arc::new(ResourceLocation::new(
            "greeting",
            format!("file://{}", path.to_string_lossy()),
            TextDataProvider::PROVIDER_ID,
        ));
        let handle = manager.provide_resource::<String>(&location);
        assert_eq!(handle.status().unwrap(), OperationStatus::Succeeded);
        assert_eq!(*handle.result().unwrap().unwrap(), "hello");

        handle.release().unwrap();
        assert_eq!(manager.operation_cache_count(), 0);
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_text_provider_ignore_failures() {
        let dir = TempDir::new("text_provider_missing");
        let path = dir.path().join("missing.txt");
        let location = Arc::new(ResourceLocation::new(
            "missing",
            path.to_string_lossy(),
            TextDataProvider::PROVIDER_ID,
        ));

        let manager = test_manager(vec![Arc::new(TextDataProvider::default())]);
        let handle = manager.provide_resource::<String>(&location);
        assert_eq!(handle.status().unwrap(), OperationStatus::Failed);
        handle.release().unwrap();

        let manager = test_manager(vec![Arc::new(
            TextDataProvider::default().with_ignore_failures(true),
        )]);
        let handle = manager.provide_resource::<String>(&location);
        assert_eq!(handle.status().unwrap(), OperationStatus::Succeeded);
        assert!(handle.result().unwrap().is_none());
        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }

    #[test]
    fn check_json_provider_deserializes() {
        let dir = TempDir::new("json_provider");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "volume": 11 }"#).unwrap();

        let manager = test_manager(vec![Arc::new(JsonAssetProvider::<Settings>::default())]);
        let location = Arc::new(ResourceLocation::new(
            "settings",
            path.to_string_lossy(),
            "JsonAssetProvider",
        ));
        let handle = manager.provide_resource::<Settings>(&location);
        assert_eq!(*handle.result().unwrap().unwrap(), Settings { volume: 11 });
        handle.release().unwrap();
        assert_eq!(manager.operation_count(), 0);
    }
}
