mod config;
mod progress;

use structopt::StructOpt;

use config::Config;
use progress::ProgressBars;
use restyle::{
    self as rs, BackboneFormat, DevicePreference, OutputFormat, Restyler, StyleTransfer,
    TransferProgress,
};
use std::{
    io::Write,
    path::{Path, PathBuf},
};

type Result<T, E = Box<dyn std::error::Error>> = std::result::Result<T, E>;

fn parse_output_format(input: &str) -> Result<OutputFormat, String> {
    input.parse()
}

fn parse_device(input: &str) -> DevicePreference {
    DevicePreference::from(input)
}

fn parse_backbone_format(input: &str) -> Result<BackboneFormat, String> {
    let fmt = match input {
        "truncated-object" | "shrunk_object" => BackboneFormat::TruncatedObject,
        "full-state-dict" | "full_statedict" => BackboneFormat::FullStateDict,
        other => {
            return Err(format!(
                "backbone format `{}` not one of: 'truncated-object', 'full-state-dict'",
                other
            ))
        }
    };

    Ok(fmt)
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Transfer {
    /// The image from which the style will be sourced
    #[structopt(long, parse(from_os_str), required_unless = "default-style")]
    style: Option<PathBuf>,
    /// One of the bundled style images, by display name or file stem. See
    /// `restyle defaults` for the list.
    #[structopt(long, conflicts_with = "style")]
    default_style: Option<String>,
    /// Path to the backbone weights, overrides the configuration
    #[structopt(long, parse(from_os_str))]
    backbone: Option<PathBuf>,
    /// How the backbone weights are laid out, 'truncated-object' or 'full-state-dict'
    #[structopt(long, parse(try_from_str = parse_backbone_format))]
    backbone_format: Option<BackboneFormat>,
    /// The device to prefer, 'auto', 'gpu' or 'cpu'
    #[structopt(long, parse(from_str = parse_device))]
    device: Option<DevicePreference>,
    /// The number of optimization steps, 0 returns the content as is
    #[structopt(long)]
    steps: Option<usize>,
    /// Side of the square working resolution, regardless of the device
    #[structopt(long)]
    image_size: Option<u32>,
    /// How much matching the style matters
    #[structopt(long)]
    style_weight: Option<f32>,
    /// How much keeping the content matters
    #[structopt(long)]
    content_weight: Option<f32>,
    /// Path(s) to the content images to restyle
    #[structopt(parse(from_os_str), required = true)]
    contents: Vec<PathBuf>,
}

#[derive(StructOpt)]
struct Stylize {
    /// Key of the style to apply, see `restyle styles` for the list
    #[structopt(long)]
    style: String,
    /// Path(s) to the images to stylize
    #[structopt(parse(from_os_str), required = true)]
    images: Vec<PathBuf>,
}

#[derive(StructOpt)]
struct Defaults {
    /// Directory holding the style images, overrides the configuration
    #[structopt(long, parse(from_os_str))]
    dir: Option<PathBuf>,
}

#[derive(StructOpt)]
struct Shrink {
    /// A full VGG19 state dict
    #[structopt(parse(from_os_str))]
    input: PathBuf,
    /// Where the truncated backbone is saved
    #[structopt(parse(from_os_str))]
    output: PathBuf,
    /// The number of leading layers to keep, the default keeps everything up
    /// to and including `conv_5`
    #[structopt(long, default_value = "11")]
    layers: usize,
}

#[derive(StructOpt)]
enum Subcommand {
    /// Transfers the style of an image onto one or more content images
    #[structopt(name = "transfer")]
    Transfer(Transfer),
    /// Applies a pretrained generator to one or more images
    #[structopt(name = "stylize")]
    Stylize(Stylize),
    /// Lists the generator styles that could be loaded
    #[structopt(name = "styles")]
    Styles,
    /// Lists the bundled style images
    #[structopt(name = "defaults")]
    Defaults(Defaults),
    /// Keeps only the leading layers of a full backbone
    #[structopt(name = "shrink")]
    Shrink(Shrink),
}

#[derive(StructOpt)]
#[structopt(
    name = "restyle",
    about = "Restyles images with neural style transfer or pretrained generators",
    rename_all = "kebab-case"
)]
struct Opt {
    /// Path to the configuration file, `restyle.toml` in the current
    /// directory is used if it exists
    #[structopt(long, short, parse(from_os_str))]
    config: Option<PathBuf>,
    /// The path to save the result to. With more than one input this is a
    /// directory, and each result is named after its input. You may use `-`
    /// for stdout.
    #[structopt(long = "out", short, parse(from_os_str), default_value = "out")]
    output_path: PathBuf,
    /// The format to save results as, 'jpg', 'png' or 'bmp'.
    ///
    /// NOTE: if not specified, the extension of the path provided to `-o`
    /// is used, and then the format of the configuration
    #[structopt(long, parse(try_from_str = parse_output_format))]
    out_fmt: Option<OutputFormat>,
    /// The maximum number of images processed at the same time. Defaults to
    /// the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    /// Don't show progress bars
    #[structopt(long)]
    no_progress: bool,
    #[structopt(subcommand)]
    cmd: Subcommand,
}

impl Opt {
    fn output_format(&self) -> Option<OutputFormat> {
        self.out_fmt.or_else(|| {
            if self.is_stdout() {
                None
            } else {
                OutputFormat::from_path(&self.output_path)
            }
        })
    }

    fn is_stdout(&self) -> bool {
        self.output_path.to_str() == Some("-")
    }

    fn threads(&self) -> usize {
        self.max_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Where the result for `input` goes, `None` meaning stdout
    fn output_for(&self, input: &Path, suffix: &str, format: OutputFormat, batch: bool) -> Option<PathBuf> {
        if self.is_stdout() {
            return None;
        }

        if !batch && self.output_path.extension().is_some() {
            return Some(self.output_path.clone());
        }

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_owned());

        Some(
            self.output_path
                .join(format!("{}_{}.{}", stem, suffix, format.extension())),
        )
    }
}

fn init_tracing() {
    let ansi = atty::is(atty::Stream::Stderr);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .init();
}

fn main() {
    init_tracing();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let args = Opt::from_args();
    let config = Config::load(args.config.as_deref())?;

    match &args.cmd {
        Subcommand::Transfer(transfer) => cmd_transfer(transfer, &args, config),
        Subcommand::Stylize(stylize) => cmd_stylize(stylize, &args, config),
        Subcommand::Styles => {
            let restyler = Restyler::from_params(None, config.generator.as_ref());
            for style in restyler.list_styles() {
                println!("{}\t{}", style.key, style.display_name);
            }
            Ok(())
        }
        Subcommand::Defaults(defaults) => {
            for style in rs::default_styles(styles_dir(defaults.dir.as_deref(), &config))? {
                println!("{}\t{}", style.display_name, style.path.display());
            }
            Ok(())
        }
        Subcommand::Shrink(shrink) => {
            let full = rs::Backbone::load(&shrink.input, BackboneFormat::FullStateDict)?;
            if shrink.layers > full.len() {
                tracing::warn!(
                    layers = shrink.layers,
                    available = full.len(),
                    "the backbone has fewer layers than requested, keeping all of them"
                );
            }

            let shrunk = full.truncated(shrink.layers);
            shrunk.to_archive().save(&shrink.output)?;
            tracing::info!(layers = shrunk.len(), path = %shrink.output.display(), "saved shrunk backbone");
            Ok(())
        }
    }
}

fn styles_dir(flag: Option<&Path>, config: &Config) -> PathBuf {
    flag.map(Path::to_owned)
        .or_else(|| config.styles_dir.clone())
        .unwrap_or_else(|| PathBuf::from("imgs/styles"))
}

fn find_default_style(name: &str, config: &Config) -> Result<PathBuf> {
    let styles = rs::default_styles(styles_dir(None, config))?;

    styles
        .iter()
        .find(|style| {
            style.display_name.eq_ignore_ascii_case(name)
                || style
                    .path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().eq_ignore_ascii_case(name))
                    .unwrap_or(false)
        })
        .map(|style| style.path.clone())
        .ok_or_else(|| format!("no default style named '{}'", name).into())
}

fn cmd_transfer(args: &Transfer, opts: &Opt, config: Config) -> Result<()> {
    let style = match (&args.style, &args.default_style) {
        (Some(style), _) => style.clone(),
        (None, Some(name)) => find_default_style(name, &config)?,
        (None, None) => return Err("either --style or --default-style is required".into()),
    };

    let mut params = config.transfer.unwrap_or_default();
    if let Some(backbone) = &args.backbone {
        params.backbone_path = Some(backbone.clone());
    }
    if let Some(format) = args.backbone_format {
        params.backbone_format = format;
    }
    if let Some(device) = &args.device {
        params.device = device.clone();
    }
    if let Some(steps) = args.steps {
        params.num_steps = steps;
    }
    if let Some(size) = args.image_size {
        params.resolution.image_size = size;
        params.resolution.image_size_gpu = None;
        params.resolution.image_size_cpu = None;
    }
    if let Some(weight) = args.style_weight {
        params.style_weight = weight;
    }
    if let Some(weight) = args.content_weight {
        params.content_weight = weight;
    }
    if let Some(format) = opts.output_format() {
        params.output = format;
    }

    let format = params.output;
    let num_steps = params.num_steps;
    let engine = StyleTransfer::builder().params(params).build()?;

    let batch = args.contents.len() > 1;
    if batch && opts.is_stdout() {
        return Err("only a single image can be written to stdout".into());
    }

    let suffix = style
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "styled".to_owned());

    let mut bars = if opts.no_progress {
        None
    } else {
        Some(ProgressBars::new())
    };

    let jobs: Vec<_> = args
        .contents
        .iter()
        .map(|content| {
            let bar = bars.as_ref().map(|bars| {
                let name = content
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                bars.add(&name, num_steps)
            });
            (content, bar)
        })
        .collect();

    let drawer = bars.as_mut().and_then(ProgressBars::draw);

    let results = dispatch(jobs, opts.threads(), |(content, bar)| {
        let progress = bar.map(|bar| Box::new(bar) as Box<dyn TransferProgress>);
        let result = engine
            .run(&style, content, progress)
            .and_then(|output| rs::codec::encode(&output, format));

        (content, result)
    });

    if let Some(drawer) = drawer {
        finish_drawing(drawer);
    }

    report(results, |content| opts.output_for(content, &suffix, format, batch))
}

/// Waits for the progress bars to be drawn for the last time, returns false
/// if the drawing thread panicked
fn finish_drawing(drawer: std::thread::JoinHandle<()>) -> bool {
    let finished = drawer.join().is_ok();
    if !finished {
        tracing::warn!("the progress bar thread panicked");
    }
    finished
}

fn cmd_stylize(args: &Stylize, opts: &Opt, config: Config) -> Result<()> {
    let mut params = match config.generator {
        Some(params) => params,
        None => return Err("the configuration has no [generator] section".into()),
    };
    if let Some(format) = opts.output_format() {
        params.output = format;
    }
    let format = params.output;

    let restyler = Restyler::from_params(None, Some(&params));

    let batch = args.images.len() > 1;
    if batch && opts.is_stdout() {
        return Err("only a single image can be written to stdout".into());
    }

    let results = dispatch(args.images.iter().collect(), opts.threads(), |image| {
        (image, restyler.run_generator_stylize(image, &args.style))
    });

    report(results, |image| opts.output_for(image, &args.style, format, batch))
}

/// Writes every successful result and reports every failure. Nothing is
/// written for an input that failed.
fn report<F>(results: Vec<(&PathBuf, Result<Vec<u8>, rs::Error>)>, output_for: F) -> Result<()>
where
    F: Fn(&Path) -> Option<PathBuf>,
{
    let total = results.len();
    let mut failed = 0;

    for (input, result) in results {
        let written = result.map_err(Box::<dyn std::error::Error>::from).and_then(|bytes| {
            match output_for(input.as_path()) {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, bytes)?;
                    tracing::info!(input = %input.display(), output = %path.display(), "saved result");
                }
                None => {
                    let out = std::io::stdout();
                    let mut out = out.lock();
                    out.write_all(&bytes)?;
                    out.flush()?;
                }
            }
            Ok(())
        });

        if let Err(e) = written {
            failed += 1;
            tracing::error!(input = %input.display(), error = %e, "failed to restyle");
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} images failed", failed, total).into());
    }

    Ok(())
}

/// Runs `work` on every job with at most `max_threads` scoped threads,
/// results are returned in the order of the jobs
fn dispatch<J, R, F>(jobs: Vec<J>, max_threads: usize, work: F) -> Vec<R>
where
    J: Send,
    R: Send,
    F: Fn(J) -> R + Sync,
{
    let threads = max_threads.max(1).min(jobs.len().max(1));
    let mut buckets: Vec<Vec<(usize, J)>> = (0..threads).map(|_| Vec::new()).collect();
    for (i, job) in jobs.into_iter().enumerate() {
        buckets[i % threads].push((i, job));
    }

    let work = &work;
    let mut results: Vec<(usize, R)> = crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = buckets
            .into_iter()
            .map(|bucket| {
                s.spawn(move |_| {
                    bucket
                        .into_iter()
                        .map(|(i, job)| (i, work(job)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
    .unwrap_or_else(|e| std::panic::resume_unwind(e));

    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drawing_thread_panics_are_reported() {
        assert!(finish_drawing(std::thread::spawn(|| {})));
        assert!(!finish_drawing(std::thread::spawn(|| panic!("bars"))));
    }

    #[test]
    fn dispatch_keeps_the_job_order() {
        let jobs: Vec<u32> = (0..17).collect();
        let results = dispatch(jobs, 4, |j| j * 2);
        assert_eq!(results, (0..17).map(|j| j * 2).collect::<Vec<_>>());

        assert!(dispatch(Vec::<u32>::new(), 8, |j| j).is_empty());
    }

    #[test]
    fn outputs_are_named_after_inputs_in_batches() {
        let opt = Opt::from_iter(&["restyle", "-o", "results", "styles"]);
        let path = opt.output_for(Path::new("photos/cat.png"), "monet", OutputFormat::Png, true);
        assert_eq!(path, Some(PathBuf::from("results/cat_monet.png")));

        let opt = Opt::from_iter(&["restyle", "-o", "cat.bmp", "styles"]);
        assert_eq!(opt.output_format(), Some(OutputFormat::Bmp));
        let path = opt.output_for(Path::new("cat.png"), "monet", OutputFormat::Bmp, false);
        assert_eq!(path, Some(PathBuf::from("cat.bmp")));

        let opt = Opt::from_iter(&["restyle", "-o", "-", "styles"]);
        assert_eq!(opt.output_format(), None);
        assert_eq!(opt.output_for(Path::new("cat.png"), "x", OutputFormat::Png, false), None);
    }

    #[test]
    fn backbone_formats_parse() {
        assert_eq!(
            parse_backbone_format("full_statedict"),
            Ok(BackboneFormat::FullStateDict)
        );
        assert!(parse_backbone_format("onnx").is_err());
    }
}
