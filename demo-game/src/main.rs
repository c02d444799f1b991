use std::path::{Path, PathBuf};
use std::sync::Arc;
use trove::loader::catalog::ContentCatalogEntry;
use trove::loader::providers::{ArchiveProvider, BundledAssetProvider, TextDataProvider};
use trove::loader::{
    BlobArchive, ContentCatalogData, DiskArchiveLoader, GenericHandle, OperationStatus,
    ResourceLocator, ResourceManager, ResourceManagerConfig,
};

pub fn demo_data_path() -> PathBuf {
    std::env::temp_dir().join("trove-demo-game")
}

fn entry(
    key: &str,
    internal_id: &Path,
    provider_id: &str,
    dependencies: &[&str],
) -> ContentCatalogEntry {
    ContentCatalogEntry {
        keys: vec![key.to_string()],
        internal_id: internal_id.to_string_lossy().to_string(),
        provider_id: provider_id.to_string(),
        dependencies: dependencies.iter().map(|x| x.to_string()).collect(),
        data: None,
    }
}

// Writes a text file, an archive and a catalog that describes both
fn write_demo_data(root: &Path) -> PathBuf {
    std::fs::create_dir_all(root).unwrap();

    let greeting_path = root.join("greeting.txt");
    std::fs::write(&greeting_path, "hello from trove").unwrap();

    let archive_path = root.join("level1.bundle");
    let mut archive = BlobArchive::default();
    archive.add_asset("map", vec![1, 2, 3, 4]);
    archive.add_asset("tiles", vec![10]);
    archive.add_asset("tiles", vec![20]);
    archive.add_asset("tiles", vec![30]);
    archive.write_to_file(&archive_path).unwrap();

    let mut level = entry("level1.bundle", &archive_path, ArchiveProvider::PROVIDER_ID, &[]);
    level.data = Some(serde_json::json!({ "retry_count": 2 }));

    let catalog = ContentCatalogData {
        locator_id: "demo".to_string(),
        provider_ids: vec![
            TextDataProvider::PROVIDER_ID.to_string(),
            ArchiveProvider::PROVIDER_ID.to_string(),
            BundledAssetProvider::PROVIDER_ID.to_string(),
        ],
        entries: vec![
            entry("greeting", &greeting_path, TextDataProvider::PROVIDER_ID, &[]),
            level,
            entry(
                "map",
                Path::new("map"),
                BundledAssetProvider::PROVIDER_ID,
                &["level1.bundle"],
            ),
            entry(
                "tiles",
                Path::new("tiles"),
                BundledAssetProvider::PROVIDER_ID,
                &["level1.bundle"],
            ),
        ],
    };

    let catalog_path = root.join("catalog.json");
    std::fs::write(&catalog_path, catalog.to_json().unwrap()).unwrap();
    catalog_path
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let catalog_path = write_demo_data(&demo_data_path());
    let catalog_json = std::fs::read_to_string(&catalog_path).unwrap();
    let locator = ContentCatalogData::from_json(&catalog_json)
        .unwrap()
        .create_locator()
        .unwrap();

    let disk_loader = Arc::new(DiskArchiveLoader::new(2).unwrap());
    let config = ResourceManagerConfig::default()
        .with_provider(Arc::new(TextDataProvider::default()))
        .with_provider(Arc::new(ArchiveProvider::new(disk_loader)))
        .with_provider(Arc::new(BundledAssetProvider::default()));
    let manager = ResourceManager::new(config);

    let locate = |key: &str| locator.locate(key).unwrap()[0].clone();

    let greeting = manager.provide_resource::<String>(&locate("greeting"));
    let map = manager.provide_resource::<Vec<u8>>(&locate("map"));
    let tiles = manager.provide_resource_list::<Vec<u8>>(&locate("tiles"));

    let chain_manager = manager.clone();
    let shouted = manager.create_chain_operation(&greeting, move |greeting| {
        let text = greeting.result().unwrap().unwrap();
        chain_manager.create_completed_operation(Some(text.to_uppercase()), None)
    });

    let all: Vec<GenericHandle> = vec![
        greeting.untyped(),
        map.untyped(),
        tiles.untyped(),
        shouted.untyped(),
    ];

    loop {
        std::thread::sleep(std::time::Duration::from_millis(15));
        manager.update(0.015);
        profiling::finish_frame!();

        let done = all.iter().all(|x| x.is_done().unwrap_or(true));
        for handle in &all {
            log::info!(
                "{} {:.0}%",
                handle.debug_name().unwrap_or_default(),
                handle.percent_complete().unwrap_or(1.0) * 100.0
            );
        }

        if done {
            break;
        }
    }

    for handle in &all {
        if handle.status().ok() != Some(OperationStatus::Succeeded) {
            log::error!("{:?} failed: {:?}", handle, handle.operation_error());
        }
    }

    println!("greeting {:?}", greeting.result());
    println!("shouted {:?}", shouted.result());
    println!("map {:?}", map.result());
    if let Ok(Some(tiles)) = tiles.result() {
        println!("tiles {:?}", tiles.iter().map(|x| x.as_slice()).collect::<Vec<_>>());
    }

    for handle in all {
        handle.release().unwrap();
    }

    println!(
        "operations left: {} cached: {}",
        manager.operation_count(),
        manager.operation_cache_count()
    );
}
