use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use restyle as rs;
use rs::weights::{BackboneArchive, LayerRecord, StateDict, TensorRecord};
use std::time::{Duration, Instant};

fn random_tensor(rng: &mut rand_pcg::Pcg32, shape: Vec<usize>, scale: f32) -> TensorRecord {
    let len = shape.iter().product();
    let data = (0..len).map(|_| rng.gen_range(-scale..scale)).collect();
    TensorRecord::new(shape, data).unwrap()
}

// Roughly the first two VGG stages, at a quarter of the width
fn backbone() -> rs::Backbone {
    let mut rng = rand_pcg::Pcg32::seed_from_u64(42);
    let mut layers = Vec::new();
    let mut channels = 3;

    for (i, &width) in [16, 16, 32, 32, 64].iter().enumerate() {
        let scale = 1.0 / ((channels * 9) as f32).sqrt();
        let weight = random_tensor(&mut rng, vec![width, channels, 3, 3], scale);
        let bias = random_tensor(&mut rng, vec![width], 0.1);
        layers.push(LayerRecord::conv2d(weight, Some(bias), 1, 1));
        layers.push(LayerRecord::relu());
        if i == 1 || i == 3 {
            layers.push(LayerRecord::max_pool2d(2, 2));
        }
        channels = width;
    }

    rs::Backbone::from_archive(&BackboneArchive { layers }).unwrap()
}

fn image(dim: u32, seed: u32) -> rs::image::DynamicImage {
    rs::image::DynamicImage::ImageRgb8(rs::image::RgbImage::from_fn(dim, dim, |x, y| {
        rs::image::Rgb([
            ((x * 7 + seed) % 256) as u8,
            ((y * 5 + seed) % 256) as u8,
            ((x ^ y) % 256) as u8,
        ])
    }))
}

fn style_transfer(c: &mut Criterion) {
    static DIM: u32 = 32;

    // Build the backbone once, every engine gets its own copy
    let backbone = backbone();

    let mut group = c.benchmark_group("style_transfer");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, &dim| {
            let engine = rs::StyleTransfer::builder()
                .backbone(backbone.clone())
                .device(rs::DevicePreference::Cpu)
                .image_size(dim)
                .num_steps(1)
                .build()
                .unwrap();

            b.iter_custom(|iters| {
                let mut total_elapsed = Duration::new(0, 0);
                for _i in 0..iters {
                    let (style, content) = (image(dim, 1), image(dim, 90));

                    let start = Instant::now();
                    black_box(engine.run(style, content, None).unwrap());
                    total_elapsed += start.elapsed();
                }

                total_elapsed
            });
        });
    }
    group.finish();
}

fn generator(c: &mut Criterion) {
    let arch = rs::GeneratorArch {
        ngf: 16,
        n_blocks: 3,
        ..Default::default()
    };

    let mut rng = rand_pcg::Pcg32::seed_from_u64(7);
    let mut dict = StateDict::new();
    for (name, shape) in arch.parameters() {
        dict.insert(name, random_tensor(&mut rng, shape, 0.1));
    }
    let generator = rs::ResnetGenerator::from_state_dict(&dict, arch).unwrap();

    let mut group = c.benchmark_group("generator");
    group.sample_size(10);

    for dim in [64usize, 128].iter() {
        let input = rs::ImageTensor::zeros(3, *dim, *dim);
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, _| {
            b.iter(|| black_box(generator.forward(&input).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, style_transfer, generator);
criterion_main!(benches);
