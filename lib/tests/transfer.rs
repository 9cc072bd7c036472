mod common;

use restyle::{
    codec::{self, Fit},
    Backbone, BackboneFormat, DevicePreference, Engine, Error, ImageSource, OutputFormat,
    ProgressUpdate, Restyler, StyleTransfer,
};

fn engine(num_steps: usize) -> StyleTransfer {
    StyleTransfer::builder()
        .backbone(Backbone::from_archive(&common::small_archive(1)).unwrap())
        .device(DevicePreference::Cpu)
        .image_size(16)
        .num_steps(num_steps)
        .output_format(OutputFormat::Png)
        .build()
        .unwrap()
}

#[test]
fn zero_steps_returns_the_content() {
    let style = common::png(common::gradient(20, 12, 1));
    let content = common::png(common::gradient(16, 16, 2));

    let output = engine(0)
        .run(style.as_slice(), content.as_slice(), None)
        .unwrap();

    let expected = codec::decode(ImageSource::Memory(&content), Fit::Stretch(16)).unwrap();
    assert_eq!(output.dims(), (3, 16, 16));
    assert!(output.max_abs_diff(&expected).unwrap() < 1e-6);
}

#[test]
fn refinement_stays_in_range() {
    let style = common::png(common::gradient(24, 24, 3));
    let content = common::png(common::gradient(30, 18, 4));

    let mut updates = Vec::new();
    let output = engine(2)
        .run(
            style.as_slice(),
            content.as_slice(),
            Some(Box::new(|update: ProgressUpdate| updates.push(update))),
        )
        .unwrap();

    assert_eq!(output.dims(), (3, 16, 16));
    assert!(output
        .as_array()
        .iter()
        .all(|v| v.is_finite() && (0.0..=1.0).contains(v)));

    assert!(!updates.is_empty());
    assert_eq!(updates[0].step, 0);
    assert!(updates.iter().all(|u| u.num_steps == 2));
    assert_eq!(updates.last().map(|u| u.evaluation), Some(updates.len()));
}

#[test]
fn encoded_output_uses_the_configured_format() {
    let img = common::png(common::gradient(16, 16, 5));
    let bytes = engine(1).run_encoded(img.as_slice(), img.as_slice()).unwrap();

    let decoded = restyle::image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (16, 16));
    assert_eq!(&bytes[1..4], b"PNG");
}

#[test]
fn both_backbone_formats_load() {
    let dir = tempfile::tempdir().unwrap();

    let full = dir.path().join("vgg19.bin");
    common::vgg19_state_dict(2, 2).save(&full).unwrap();

    let shrunk = dir.path().join("vgg19_shrunk.bin");
    common::small_archive(3).save(&shrunk).unwrap();

    let from_full = Backbone::load(&full, BackboneFormat::FullStateDict).unwrap();
    assert_eq!(from_full.len(), 37);

    let from_archive = Backbone::load(&shrunk, BackboneFormat::TruncatedObject).unwrap();
    assert_eq!(from_archive.len(), 11);

    // Loading a file with the wrong format fails cleanly
    assert!(matches!(
        Backbone::load(&shrunk, BackboneFormat::FullStateDict),
        Err(Error::Weights(_))
    ));
}

#[test]
fn shrunk_backbone_keeps_the_requested_layers() {
    let dir = tempfile::tempdir().unwrap();
    let full = Backbone::vgg19_from_state_dict(&common::vgg19_state_dict(4, 2)).unwrap();

    // conv_5 is the 11th layer of VGG19
    let path = dir.path().join("shrunk.bin");
    full.truncated(11).to_archive().save(&path).unwrap();

    let engine = StyleTransfer::builder()
        .backbone_path(&path, BackboneFormat::TruncatedObject)
        .device(DevicePreference::Cpu)
        .image_size(16)
        .num_steps(1)
        .build()
        .unwrap();
    assert_eq!(engine.backbone().len(), 11);

    let img = common::png(common::gradient(16, 16, 6));
    let output = engine.run(img.as_slice(), img.as_slice(), None).unwrap();
    assert_eq!(output.dims(), (3, 16, 16));
}

#[test]
fn unsupported_layers_fail_before_optimizing() {
    let mut archive = common::small_archive(5);
    archive
        .layers
        .insert(1, restyle::weights::LayerRecord::bare("Dropout"));

    let engine = StyleTransfer::builder()
        .backbone(Backbone::from_archive(&archive).unwrap())
        .device(DevicePreference::Cpu)
        .image_size(8)
        .build()
        .unwrap();

    let img = common::png(common::gradient(8, 8, 7));
    match engine.run(img.as_slice(), img.as_slice(), None) {
        Err(Error::UnsupportedLayer(ul)) => {
            assert_eq!(ul.index, 1);
            assert_eq!(ul.kind, "Dropout");
        }
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
}

#[test]
fn undecodable_inputs_are_decode_errors() {
    let img = common::png(common::gradient(8, 8, 8));
    let res = engine(1).run(&b"definitely not an image"[..], img.as_slice(), None);
    assert!(matches!(res, Err(Error::Decode(_))));
}

#[test]
fn disabled_transfer_is_not_initialized() {
    let restyler = Restyler::new(None, None);
    let img = common::png(common::gradient(8, 8, 9));
    assert!(matches!(
        restyler.run_style_transfer(img.as_slice(), img.as_slice()),
        Err(Error::NotInitialized(Engine::Transfer))
    ));
}

#[test]
fn facade_runs_a_configured_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backbone.bin");
    common::small_archive(10).save(&path).unwrap();

    let params = restyle::TransferParams {
        backbone_path: Some(path),
        device: DevicePreference::Cpu,
        num_steps: 1,
        resolution: restyle::Resolution {
            image_size: 8,
            ..Default::default()
        },
        ..Default::default()
    };

    let restyler = Restyler::from_params(Some(&params), None);
    let img = common::png(common::gradient(8, 8, 10));
    let jpeg = restyler
        .run_style_transfer(img.as_slice(), img.as_slice())
        .unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
}
