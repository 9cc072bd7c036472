use crate::{
    errors::OptimizationError,
    graph::{FeatureGraph, LossWeights, Probes},
    lbfgs::{Lbfgs, LbfgsConfig},
    tensor::ImageTensor,
    Error,
};
use ndarray::{Array4, ArrayView4};

/// Evaluations between two progress log lines
const LOG_INTERVAL: usize = 50;

/// The state of the optimization after an evaluation of the objective
#[derive(Copy, Clone, Debug)]
pub struct ProgressUpdate {
    /// The outer step being run, starting at 0
    pub step: usize,
    /// Total number of outer steps that will be run
    pub num_steps: usize,
    /// Number of evaluations done so far, including this one
    pub evaluation: usize,
    /// Weighted sum of the style losses
    pub style_score: f32,
    /// Weighted sum of the content losses
    pub content_score: f32,
}

/// Allows the optimization loop to update external callers with its progress
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate) + Send,
{
    fn update(&mut self, info: ProgressUpdate) {
        self(info)
    }
}

/// Refines a copy of `content` for exactly `num_steps` L-BFGS steps.
///
/// The working image is clamped into `[0, 1]` before every evaluation and
/// once more at the end, so `num_steps == 0` yields the clamped content.
pub fn refine(
    graph: &FeatureGraph<'_>,
    probes: &mut Probes,
    content: &ImageTensor,
    num_steps: usize,
    weights: LossWeights,
    config: LbfgsConfig,
    progress: Option<Box<dyn TransferProgress + '_>>,
) -> Result<ImageTensor, Error> {
    descend(content, num_steps, config, progress, |x| {
        let trace = graph.forward_view(x, probes)?;
        let style_score = weights.style * probes.style_score();
        let content_score = weights.content * probes.content_score();
        let grad = graph.backward(&trace, probes, weights)?;
        Ok((style_score, content_score, grad))
    })
}

/// The outer loop of [`refine`], `evaluate` returns the weighted style and
/// content scores at a clamped image along with the gradient of their sum
fn descend<F>(
    content: &ImageTensor,
    num_steps: usize,
    config: LbfgsConfig,
    mut progress: Option<Box<dyn TransferProgress + '_>>,
    mut evaluate: F,
) -> Result<ImageTensor, Error>
where
    F: FnMut(ArrayView4<'_, f32>) -> Result<(f32, f32, Array4<f32>), Error>,
{
    let mut working = content.as_array().clone();
    let mut lbfgs = Lbfgs::new(config);
    let mut evaluation = 0;

    for step in 0..num_steps {
        let res = lbfgs.step(&mut working, |x| {
            x.mapv_inplace(|v| v.max(0.0).min(1.0));

            let (style_score, content_score, grad) = evaluate(x.view())?;

            evaluation += 1;
            if evaluation % LOG_INTERVAL == 0 {
                tracing::info!(
                    evaluation,
                    style_loss = style_score,
                    content_loss = content_score,
                    "refining"
                );
            }

            if let Some(progress) = &mut progress {
                progress.update(ProgressUpdate {
                    step,
                    num_steps,
                    evaluation,
                    style_score,
                    content_score,
                });
            }

            Ok::<_, Error>((style_score + content_score, grad))
        });

        if let Err(source) = res {
            return Err(Error::Optimization(OptimizationError {
                step,
                source: Box::new(source),
            }));
        }
    }

    let mut result = ImageTensor::new(working)?;
    result.clamp(0.0, 1.0);
    Ok(result)
}
