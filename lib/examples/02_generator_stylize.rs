use restyle as rs;

fn main() -> Result<(), rs::Error> {
    let params = rs::GeneratorParams {
        models_dir: "models".into(),
        styles: vec![
            rs::StyleDecl::new("monet", "Monet", "style_monet.bin"),
            rs::StyleDecl::new("vangogh", "Van Gogh", "style_vangogh.bin"),
        ],
        ..Default::default()
    };

    // styles whose checkpoint can't be loaded are simply not listed
    let restyler = rs::Restyler::from_params(None, Some(&params));
    std::fs::create_dir_all("out")?;

    for style in restyler.list_styles() {
        let jpeg = restyler.run_generator_stylize(&"imgs/tom.jpg", &style.key)?;
        std::fs::write(format!("out/02_{}.jpg", style.key), jpeg)?;
        println!("stylized with {}", style.display_name);
    }

    Ok(())
}
