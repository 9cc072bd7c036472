mod common;

use restyle::{Backbone, DevicePreference, OutputFormat, StyleTransfer};

#[test]
fn one_engine_serves_many_threads() {
    let engine = StyleTransfer::builder()
        .backbone(Backbone::from_archive(&common::small_archive(11)).unwrap())
        .device(DevicePreference::Cpu)
        .image_size(8)
        .num_steps(1)
        .output_format(OutputFormat::Png)
        .build()
        .unwrap();

    let inputs: Vec<_> = (0..4u8)
        .map(|i| {
            (
                common::png(common::gradient(12, 8, i)),
                common::png(common::gradient(8, 12, i + 10)),
            )
        })
        .collect();

    let results = crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|(style, content)| {
                let engine = &engine;
                s.spawn(move |_| engine.run(style.as_slice(), content.as_slice(), None))
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    // The same inputs run on a single thread give the same result
    for ((style, content), res) in inputs.iter().zip(results) {
        let threaded = res.unwrap();
        let serial = engine.run(style.as_slice(), content.as_slice(), None).unwrap();
        assert!(threaded.max_abs_diff(&serial).unwrap() < 1e-6);
    }
}
