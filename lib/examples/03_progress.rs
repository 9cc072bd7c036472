use restyle as rs;

fn main() -> Result<(), rs::Error> {
    let engine = rs::StyleTransfer::builder()
        .backbone_path("models/vgg19_shrunk.bin", rs::BackboneFormat::TruncatedObject)
        .device(rs::DevicePreference::Cpu)
        .image_size(128)
        .num_steps(20)
        .style_weight(1e5)
        .build()?;

    let progress = |update: rs::ProgressUpdate| {
        if update.evaluation % 10 == 0 {
            println!(
                "step {}/{} style {:.3} content {:.3}",
                update.step + 1,
                update.num_steps,
                update.style_score,
                update.content_score
            );
        }
    };

    let result = engine.run(
        &"imgs/styles/the_scream.jpg",
        &"imgs/tom.jpg",
        Some(Box::new(progress)),
    )?;

    let png = rs::codec::encode(&result, rs::OutputFormat::Png)?;
    std::fs::create_dir_all("out")?;
    std::fs::write("out/03.png", png)?;
    Ok(())
}
