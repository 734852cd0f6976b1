//! Real encodes through the pure Rust driver, wired from config the way the
//! binary wires it. Needs no system tools.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use picture_forge::catalog::VariantCatalog;
use picture_forge::config::{self, TranscodeConfig};
use picture_forge::imaging::{Dimensions, DriverId, Format};
use picture_forge::orchestrator::Transcoder;
use picture_forge::registry::DriverRegistry;
use picture_forge::source::{self, SourceImage};
use picture_forge::storage::{IndexedRepository, LocalStorage, Storage, VariantRepository};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

fn native_only_config() -> TranscodeConfig {
    let overlay: toml::Value = toml::from_str(
        r#"
formats = ["webp", "jpeg"]
variants = [
    { name = "thumbnail", max_dimension = 150 },
    { name = "full" },
]

[drivers]
priority = ["native"]
"#,
    )
    .unwrap();
    config::resolve_config(config::stock_defaults_value(), Some(overlay)).unwrap()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn transcoder(cfg: &TranscodeConfig) -> Transcoder {
    let registry = DriverRegistry::from_config(cfg).unwrap();
    Transcoder::from_config(Arc::new(registry), cfg)
}

#[test]
fn thumbnail_webp_has_scaled_dimensions() {
    let cfg = native_only_config();
    let t = transcoder(&cfg);
    let source = SourceImage::new("gradient", png(640, 480));
    let thumbnail = &cfg.variants[0];

    let out = t
        .transcode(&source, thumbnail, Format::Webp, &cfg.limits)
        .unwrap();
    assert_eq!(out.driver, DriverId::Native);
    assert_eq!(out.format, Format::Webp);
    assert_eq!((out.width, out.height), (150, 113));

    let decoded = image::load_from_memory_with_format(&out.bytes, ImageFormat::WebP).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (150, 113));
}

#[test]
fn dimensions_come_from_the_header() {
    let cfg = native_only_config();
    let t = transcoder(&cfg);
    let source = SourceImage::new("gradient", png(300, 500));

    let dims = source.dimensions_with(t.analyzer()).unwrap();
    assert_eq!(dims, Dimensions::new(300, 500));
    assert_eq!(source.known_dimensions(), Some(dims));
}

#[test]
fn garbage_source_is_invalid() {
    let cfg = native_only_config();
    let t = transcoder(&cfg);
    let source = SourceImage::new("junk", b"definitely not an image".to_vec());

    let err = t
        .transcode(&source, &cfg.variants[0], Format::Jpeg, &cfg.limits)
        .unwrap_err();
    assert_eq!(err.kind().as_str(), "invalid_source");
}

#[test]
fn materialized_rows_survive_reopen() {
    let cfg = native_only_config();
    let store = TempDir::new().unwrap();
    let source = SourceImage::new("gradient", png(640, 480));

    {
        let catalog = VariantCatalog::from_config(
            Arc::new(transcoder(&cfg)),
            Arc::new(LocalStorage::new(store.path())),
            Arc::new(IndexedRepository::open(store.path())),
            &cfg,
        );
        let report = catalog.materialize_parallel(&source).unwrap();
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(report.created.len(), 4);
    }

    let repository = IndexedRepository::open(store.path());
    let rows = repository.list("gradient").unwrap();
    assert_eq!(rows.len(), 4);

    let storage = LocalStorage::new(store.path());
    let full_jpeg = repository
        .find("gradient", "full", Format::Jpeg)
        .unwrap()
        .unwrap();
    let bytes = storage.get(&full_jpeg.path).unwrap();
    assert_eq!(bytes.len() as u64, full_jpeg.byte_size);
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (640, 480));

    // A second catalog over the same store has nothing left to do
    let catalog = VariantCatalog::from_config(
        Arc::new(transcoder(&cfg)),
        Arc::new(storage),
        Arc::new(repository),
        &cfg,
    );
    assert!(catalog.materialize(&source).unwrap().created.is_empty());
}

#[test]
fn same_stem_sources_are_catalogued_separately() {
    let cfg = native_only_config();
    let input = TempDir::new().unwrap();
    let store = input.path().join("variants");
    std::fs::write(input.path().join("dawn.png"), png(320, 240)).unwrap();
    std::fs::create_dir(input.path().join("trip")).unwrap();
    std::fs::write(input.path().join("trip/dawn.png"), png(240, 320)).unwrap();

    let catalog = VariantCatalog::from_config(
        Arc::new(transcoder(&cfg)),
        Arc::new(LocalStorage::new(&store)),
        Arc::new(IndexedRepository::open(&store)),
        &cfg,
    );
    for file in source::collect_sources(&[input.path().to_path_buf()], Some(store.as_path())) {
        let report = catalog.materialize(&SourceImage::from_file(&file).unwrap()).unwrap();
        assert_eq!(report.created.len(), 4, "{}", file.id);
    }

    // The store now sits inside the input tree and is not read back
    let again = source::collect_sources(&[input.path().to_path_buf()], Some(store.as_path()));
    assert_eq!(again.len(), 2);

    let landscape = catalog.rows("dawn.png").unwrap();
    let portrait = catalog.rows("trip/dawn.png").unwrap();
    let full = |rows: &[picture_forge::catalog::OptimizedVariant]| {
        rows.iter()
            .find(|r| r.variant == "full")
            .map(|r| (r.width, r.height))
    };
    assert_eq!(full(&landscape), Some((320, 240)));
    assert_eq!(full(&portrait), Some((240, 320)));
}
