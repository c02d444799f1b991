mod archive_provider;
pub use archive_provider::ArchiveProvider;

mod bundled_asset;
pub use bundled_asset::BundledAssetProvider;

mod content_catalog;
pub use content_catalog::{CatalogCacheWrite, CatalogLoadPlan, ContentCatalogProvider};

mod odr_archive;
pub use odr_archive::{OdrArchiveProvider, ResourceDelivery, ResourceDeliveryRequest};

mod sync_archive;
pub use sync_archive::SyncArchiveProvider;

mod text;
pub use text::{JsonAssetProvider, TextDataProvider};
pub(crate) use text::local_path;
