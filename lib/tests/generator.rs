mod common;

use restyle::{
    DevicePreference, Engine, Error, GeneratorEngine, GeneratorParams, OutputFormat, Resolution,
    Restyler, StyleDecl,
};
use std::path::Path;

fn params(models_dir: &Path, styles: Vec<StyleDecl>) -> GeneratorParams {
    GeneratorParams {
        models_dir: models_dir.to_owned(),
        device: DevicePreference::Cpu,
        resolution: Resolution {
            image_size: 16,
            ..Default::default()
        },
        arch: common::tiny_arch(),
        output: OutputFormat::Png,
        styles,
    }
}

fn write_checkpoint(dir: &Path, name: &str, seed: u64) {
    common::generator_checkpoint(seed, &common::tiny_arch())
        .save(dir.join(name))
        .unwrap();
}

#[test]
fn only_loadable_styles_are_listed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path(), "vangogh.bin", 1);
    write_checkpoint(dir.path(), "monet.bin", 2);

    let engine = GeneratorEngine::new(&params(
        dir.path(),
        vec![
            StyleDecl::new("vangogh", "Van Gogh", "vangogh.bin"),
            StyleDecl::new("cezanne", "Cezanne", "cezanne.bin"),
            StyleDecl::new("monet", "Monet", "monet.bin"),
        ],
    ))
    .unwrap();

    let keys: Vec<_> = engine
        .available_styles()
        .into_iter()
        .map(|s| (s.key, s.display_name))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("vangogh".to_owned(), "Van Gogh".to_owned()),
            ("monet".to_owned(), "Monet".to_owned())
        ]
    );

    // The missing style is still known, just not usable
    assert_eq!(engine.entries().len(), 3);
    assert!(!engine.entries()[1].is_loaded());
}

#[test]
fn stylize_output_has_the_working_resolution() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path(), "monet.bin", 3);

    let engine = GeneratorEngine::new(&params(
        dir.path(),
        vec![StyleDecl::new("monet", "Monet", "monet.bin")],
    ))
    .unwrap();

    let photo = common::png(common::gradient(40, 24, 1));
    let output = engine.stylize(photo.as_slice().into(), "monet").unwrap();
    assert_eq!(output.dims(), (3, 16, 16));
    assert!(output.as_array().iter().all(|v| (0.0..=1.0).contains(v)));

    let encoded = engine.stylize_encoded(photo.as_slice().into(), "monet").unwrap();
    let decoded = restyle::image::load_from_memory(&encoded).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (16, 16));
}

#[test]
fn unknown_styles_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path(), "monet.bin", 4);
    let engine = GeneratorEngine::new(&params(
        dir.path(),
        vec![
            StyleDecl::new("monet", "Monet", "monet.bin"),
            StyleDecl::new("ukiyoe", "Ukiyo-e", "ukiyoe.bin"),
        ],
    ))
    .unwrap();

    let photo = common::png(common::gradient(16, 16, 2));
    for key in &["picasso", "ukiyoe"] {
        match engine.stylize(photo.as_slice().into(), key) {
            Err(Error::UnknownStyle(k)) => assert_eq!(&k, key),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }
}

#[test]
fn model_files_cant_escape_the_models_dir() {
    let root = tempfile::tempdir().unwrap();
    let models = root.path().join("models");
    std::fs::create_dir(&models).unwrap();

    // A valid checkpoint right outside the models directory
    write_checkpoint(root.path(), "outside.bin", 5);

    let engine = GeneratorEngine::new(&params(
        &models,
        vec![StyleDecl::new("sneaky", "Sneaky", "../outside.bin")],
    ))
    .unwrap();

    assert!(!engine.is_usable());
    assert_eq!(
        engine.entries()[0].model_file.as_deref(),
        Some(models.join("outside.bin").as_path())
    );
}

#[test]
fn broken_checkpoints_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.bin"), b"not a checkpoint").unwrap();
    write_checkpoint(dir.path(), "good.bin", 6);

    let engine = GeneratorEngine::new(&params(
        dir.path(),
        vec![
            StyleDecl::new("broken", "Broken", "broken.bin"),
            StyleDecl::new("good", "Good", "good.bin"),
            StyleDecl::new("good", "Duplicate", "broken.bin"),
        ],
    ))
    .unwrap();

    let styles = engine.available_styles();
    assert_eq!(styles.len(), 1);
    assert_eq!(styles[0].key, "good");
    assert_eq!(engine.entries().len(), 2);
}

#[test]
fn facade_disables_an_empty_generator() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(
        dir.path(),
        vec![StyleDecl::new("monet", "Monet", "monet.bin")],
    );

    let restyler = Restyler::from_params(None, Some(&params));
    assert!(restyler.list_styles().is_empty());

    let photo = common::png(common::gradient(8, 8, 3));
    assert!(matches!(
        restyler.run_generator_stylize(photo.as_slice(), "monet"),
        Err(Error::NotInitialized(Engine::Generator))
    ));
}

#[test]
fn facade_lists_and_applies_styles() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path(), "monet.bin", 7);
    let params = params(
        dir.path(),
        vec![StyleDecl::new("monet", "Monet", "monet.bin")],
    );

    let restyler = Restyler::from_params(None, Some(&params));
    assert_eq!(restyler.list_styles().len(), 1);

    let photo = common::png(common::gradient(20, 20, 4));
    let png = restyler.run_generator_stylize(photo.as_slice(), "monet").unwrap();
    assert_eq!(&png[1..4], b"PNG");
}
