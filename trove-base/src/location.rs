use crate::hashing::{combine_hash, stable_hash};
use crate::result_type::ResultType;
use std::fmt;
use std::sync::Arc;

/// Describes what to load, where it lives and which provider loads it.
///
/// Locations are immutable once built. They are normally created while reading a catalog and shared
/// as `Arc<ResourceLocation>` between the catalog and every operation that loads them.
pub struct ResourceLocation {
    // Key the location was registered under, used for display and catalog lookups
    primary_key: String,
    // Opaque id handed to the provider, usually a path or url
    internal_id: String,
    provider_id: String,
    dependencies: Vec<Arc<ResourceLocation>>,
    // Provider-specific payload, for example archive request options
    data: Option<serde_json::Value>,
    hash: u64,
    dependency_hash: u64,
}

impl ResourceLocation {
    pub fn new(
        primary_key: impl Into<String>,
        internal_id: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        let primary_key = primary_key.into();
        let internal_id = internal_id.into();
        let provider_id = provider_id.into();
        debug_assert!(!internal_id.is_empty());
        debug_assert!(!provider_id.is_empty());

        let hash = combine_hash(
            combine_hash(stable_hash(primary_key.as_str()), stable_hash(internal_id.as_str())),
            stable_hash(provider_id.as_str()),
        );

        let mut location = ResourceLocation {
            primary_key,
            internal_id,
            provider_id,
            dependencies: Vec::default(),
            data: None,
            hash,
            dependency_hash: 0,
        };
        location.dependency_hash = Self::compute_dependency_hash(&location.dependencies);
        location
    }

    pub fn with_dependencies(
        mut self,
        dependencies: Vec<Arc<ResourceLocation>>,
    ) -> Self {
        self.dependency_hash = Self::compute_dependency_hash(&dependencies);
        self.dependencies = dependencies;
        self
    }

    pub fn with_data(
        mut self,
        data: serde_json::Value,
    ) -> Self {
        self.data = Some(data);
        self
    }

    fn compute_dependency_hash(dependencies: &[Arc<ResourceLocation>]) -> u64 {
        let mut hash = 17;
        for dependency in dependencies {
            hash = combine_hash(hash, dependency.hash);
        }
        hash
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn internal_id(&self) -> &str {
        &self.internal_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn dependencies(&self) -> &[Arc<ResourceLocation>] {
        &self.dependencies
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    /// Hash of the location itself, ignoring dependencies and data
    pub fn location_hash(&self) -> u64 {
        self.hash
    }

    /// Hash of this location loaded as `result_type`. Two requests with equal hashes share one
    /// operation while it is alive.
    pub fn hash(
        &self,
        result_type: &ResultType,
    ) -> u64 {
        combine_hash(self.hash, result_type.type_hash())
    }

    /// Hash over the ordered dependency list. Locations with identical dependency lists share one
    /// dependency group operation.
    pub fn dependency_hash(&self) -> u64 {
        self.dependency_hash
    }
}

impl fmt::Debug for ResourceLocation {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResourceLocation")
            .field("primary_key", &self.primary_key)
            .field("internal_id", &self.internal_id)
            .field("provider_id", &self.provider_id)
            .field("dependency_count", &self.dependencies.len())
            .finish()
    }
}

impl fmt::Display for ResourceLocation {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.internal_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_hash_depends_on_type() {
        let location = ResourceLocation::new("key", "path/to/asset", "TestProvider");
        assert_ne!(
            location.hash(&ResultType::single::<u32>()),
            location.hash(&ResultType::single::<String>())
        );
        assert_eq!(
            location.hash(&ResultType::single::<u32>()),
            ResourceLocation::new("key", "path/to/asset", "TestProvider")
                .hash(&ResultType::single::<u32>())
        );
    }

    #[test]
    fn check_dependency_hash() {
        let a = Arc::new(ResourceLocation::new("a", "a", "TestProvider"));
        let b = Arc::new(ResourceLocation::new("b", "b", "TestProvider"));

        let no_deps = ResourceLocation::new("c", "c", "TestProvider");
        assert_eq!(no_deps.dependency_hash(), 17);

        let ab = ResourceLocation::new("c", "c", "TestProvider")
            .with_dependencies(vec![a.clone(), b.clone()]);
        let ab_other = ResourceLocation::new("d", "d", "TestProvider")
            .with_dependencies(vec![a.clone(), b.clone()]);
        let ba = ResourceLocation::new("c", "c", "TestProvider").with_dependencies(vec![b, a]);

        assert_eq!(ab.dependency_hash(), ab_other.dependency_hash());
        assert_ne!(ab.dependency_hash(), ba.dependency_hash());
        // Dependencies never change the hash of the location itself
        assert_eq!(ab.location_hash(), no_deps.location_hash());
    }
}
