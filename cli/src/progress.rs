use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use restyle::{ProgressUpdate, TransferProgress};

/// One bar per style transfer job, all drawn together
pub(crate) struct ProgressBars {
    multi: Option<MultiProgress>,
    style: ProgressStyle,
}

impl ProgressBars {
    pub(crate) fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {prefix:>12} {bar:40.cyan/blue} {pos}/{len} {msg}")
            .progress_chars("##-");

        Self {
            multi: Some(MultiProgress::new()),
            style,
        }
    }

    pub(crate) fn add(&self, name: &str, num_steps: usize) -> StepBar {
        let pb = ProgressBar::new(num_steps as u64);
        let pb = match &self.multi {
            Some(multi) => multi.add(pb),
            None => pb,
        };
        pb.set_style(self.style.clone());
        pb.set_prefix(name);

        StepBar { pb }
    }

    /// Draws the bars on a separate thread until every `StepBar` is dropped
    pub(crate) fn draw(&mut self) -> Option<std::thread::JoinHandle<()>> {
        self.multi.take().map(|multi| {
            std::thread::spawn(move || {
                if let Err(err) = multi.join() {
                    tracing::warn!(error = %err, "failed to draw the progress bars");
                }
            })
        })
    }
}

pub(crate) struct StepBar {
    pb: ProgressBar,
}

impl TransferProgress for StepBar {
    fn update(&mut self, info: ProgressUpdate) {
        // Steps that are still running don't count as done
        self.pb.set_position(info.step as u64);
        self.pb.set_message(&format!(
            "style {:.4} content {:.4}",
            info.style_score, info.content_score
        ));
    }
}

impl Drop for StepBar {
    fn drop(&mut self) {
        self.pb.finish();
    }
}
