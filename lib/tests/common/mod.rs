#![allow(dead_code)]

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use restyle::{
    image::{DynamicImage, ImageOutputFormat, RgbImage},
    weights::{BackboneArchive, LayerRecord, StateDict, TensorRecord},
    GeneratorArch,
};
use std::{io::Cursor, path::Path};

pub fn rng(seed: u64) -> Pcg32 {
    Pcg32::seed_from_u64(seed)
}

pub fn tensor(rng: &mut Pcg32, shape: Vec<usize>, scale: f32) -> TensorRecord {
    let len = shape.iter().product();
    let data = (0..len).map(|_| rng.gen_range(-scale..scale)).collect();
    TensorRecord::new(shape, data).unwrap()
}

fn conv(rng: &mut Pcg32, input: usize, output: usize) -> (TensorRecord, TensorRecord) {
    let scale = 1.0 / ((input * 9) as f32).sqrt();
    (
        tensor(rng, vec![output, input, 3, 3], scale),
        tensor(rng, vec![output], 0.1),
    )
}

/// A tiny backbone with 5 convolutions and a pool after the second one
pub fn small_archive(seed: u64) -> BackboneArchive {
    let mut rng = rng(seed);
    let mut layers = Vec::new();
    let mut channels = 3;

    for i in 0..5 {
        let (weight, bias) = conv(&mut rng, channels, 4);
        layers.push(LayerRecord::conv2d(weight, Some(bias), 1, 1));
        layers.push(LayerRecord::relu());
        if i == 1 {
            layers.push(LayerRecord::max_pool2d(2, 2));
        }
        channels = 4;
    }

    BackboneArchive { layers }
}

/// A complete VGG19 feature stack in the `features.{i}` layout, every
/// convolution being `width` filters wide
pub fn vgg19_state_dict(seed: u64, width: usize) -> StateDict {
    const CONVS_PER_STAGE: [usize; 5] = [2, 2, 4, 4, 4];

    let mut rng = rng(seed);
    let mut dict = StateDict::new();
    let mut index = 0;
    let mut channels = 3;

    for &convs in CONVS_PER_STAGE.iter() {
        for _ in 0..convs {
            let (weight, bias) = conv(&mut rng, channels, width);
            dict.insert(format!("features.{}.weight", index), weight);
            dict.insert(format!("features.{}.bias", index), bias);
            channels = width;
            // conv + relu
            index += 2;
        }
        // pool
        index += 1;
    }

    // Classifier weights ride along in real checkpoints
    dict.insert("classifier.0.bias", tensor(&mut rng, vec![4], 0.1));
    dict
}

/// A generator checkpoint with every parameter `arch` expects
pub fn generator_checkpoint(seed: u64, arch: &GeneratorArch) -> StateDict {
    let mut rng = rng(seed);
    let mut dict = StateDict::new();
    for (name, shape) in arch.parameters() {
        dict.insert(name, tensor(&mut rng, shape, 0.3));
    }
    dict
}

pub fn tiny_arch() -> GeneratorArch {
    GeneratorArch {
        ngf: 2,
        n_blocks: 1,
        ..Default::default()
    }
}

pub fn gradient(w: u32, h: u32, seed: u8) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| {
        restyle::image::Rgb([
            (x * 255 / w.max(1)) as u8,
            (y * 255 / h.max(1)) as u8,
            seed.wrapping_mul(37),
        ])
    })
}

pub fn png(img: RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .unwrap();
    bytes
}

pub fn write_png(path: &Path, img: RgbImage) {
    std::fs::write(path, png(img)).unwrap();
}
