use restyle as rs;

fn main() -> Result<(), rs::Error> {
    let engine = rs::StyleTransfer::builder()
        // a backbone shrunk with `restyle shrink`, the full VGG19 state dict
        // works too with `BackboneFormat::FullStateDict`
        .backbone_path("models/vgg19_shrunk.bin", rs::BackboneFormat::TruncatedObject)
        // fewer steps than the default, for a quicker preview
        .num_steps(50)
        .build()?;

    // apply the style of "starry_night.jpg" to "tom.jpg"
    let jpeg = engine.run_encoded(&"imgs/styles/starry_night.jpg", &"imgs/tom.jpg")?;

    // save the result to the disk
    std::fs::create_dir_all("out")?;
    std::fs::write("out/01.jpg", jpeg)?;
    Ok(())
}
