//! The truncated feature graph.
//!
//! The graph is a straight line of nodes: an input normalization, the named
//! backbone layers, and the probes spliced in after the layers they watch.
//! It borrows the layers from the backbone and ends right after its deepest
//! probe. The probes themselves live in a separate [`Probes`] value so that a
//! graph can be evaluated with probes that are created fresh for every run.

use crate::{
    backbone::{Backbone, Layer, LayerKind},
    loss::{ContentProbe, StyleProbe},
    tensor::{self, ImageTensor},
    Error,
};
use ndarray::{Array4, ArrayView4};
use std::collections::HashSet;

/// Per-channel input normalization applied before the first layer
#[derive(Clone, Debug, PartialEq)]
pub struct Normalization {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalization {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self, Error> {
        if mean.len() != 3 || std.len() != 3 {
            return Err(Error::InvalidNormalization(mean.len(), std.len()));
        }

        if let Some(&bad) = std.iter().find(|s| s.is_nan() || **s <= 0.0) {
            return Err(Error::InvalidRange(crate::errors::InvalidRange {
                min: f32::EPSILON,
                max: f32::MAX,
                value: bad,
                name: "normalization-std",
            }));
        }

        Ok(Self { mean, std })
    }

    /// The mean and std the backbones were trained with
    pub fn imagenet() -> Self {
        Self {
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }

    fn check(&self, x: &ArrayView4<'_, f32>) -> Result<(), Error> {
        let (n, c, h, w) = x.dim();
        if c != self.mean.len() {
            return Err(Error::shape_mismatch(
                "normalization input",
                &[n, self.mean.len(), h, w],
                &[n, c, h, w],
            ));
        }
        Ok(())
    }

    fn forward(&self, x: ArrayView4<'_, f32>) -> Result<Array4<f32>, Error> {
        self.check(&x)?;
        let scale: Vec<f32> = self.std.iter().map(|s| 1.0 / s).collect();
        let shift: Vec<f32> = self.mean.iter().zip(&self.std).map(|(m, s)| -m / s).collect();
        Ok(tensor::channel_affine(x, &scale, &shift))
    }

    fn backward(&self, grad: ArrayView4<'_, f32>) -> Array4<f32> {
        let scale: Vec<f32> = self.std.iter().map(|s| 1.0 / s).collect();
        let zeros = vec![0.0; scale.len()];
        tensor::channel_affine(grad, &scale, &zeros)
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::imagenet()
    }
}

/// A backbone layer along with the name probes address it by
#[derive(Debug)]
pub struct NamedLayer<'b> {
    pub name: String,
    pub kind: LayerKind,
    layer: &'b Layer,
}

/// Which probe a graph node refers to, indices are into [`Probes`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProbeHandle {
    Content(usize),
    Style(usize),
}

#[derive(Debug)]
enum Node<'b> {
    Normalize(Normalization),
    Layer(NamedLayer<'b>),
    Probe(ProbeHandle),
}

/// The mutable loss state of a single run
#[derive(Clone, Debug, Default)]
pub struct Probes {
    pub content: Vec<ContentProbe>,
    pub style: Vec<StyleProbe>,
}

impl Probes {
    pub fn content_score(&self) -> f32 {
        self.content.iter().map(ContentProbe::loss).sum()
    }

    pub fn style_score(&self) -> f32 {
        self.style.iter().map(StyleProbe::loss).sum()
    }
}

/// How much each kind of probe contributes to the objective
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub style: f32,
    pub content: f32,
}

/// Synthesizes `{prefix}_{counter}` names, the counter only moves on
/// convolutions, eg. `conv_1, relu_1, pool_1, conv_2`
pub fn layer_names<I: IntoIterator<Item = LayerKind>>(kinds: I) -> Vec<String> {
    let mut counter = 0;
    kinds
        .into_iter()
        .map(|kind| {
            if kind == LayerKind::Conv {
                counter += 1;
            }
            format!("{}_{}", kind.prefix(), counter)
        })
        .collect()
}

/// Activations recorded by a forward pass, consumed by the backward pass
pub struct Trace {
    outputs: Vec<Array4<f32>>,
}

#[derive(Debug)]
pub struct FeatureGraph<'b> {
    nodes: Vec<Node<'b>>,
}

impl<'b> FeatureGraph<'b> {
    /// Builds the graph and seeds its probes from the style and content
    /// images. Every backbone layer is classified up front, so an
    /// unsupported layer fails the build before anything is evaluated.
    pub fn build(
        backbone: &'b Backbone,
        normalization: Normalization,
        style: &ImageTensor,
        content: &ImageTensor,
        content_layers: &[String],
        style_layers: &[String],
    ) -> Result<(Self, Probes), Error> {
        let specs = backbone.feature_specs()?;
        let names = layer_names(specs.iter().map(|s| s.kind));

        for requested in content_layers.iter().chain(style_layers) {
            if !names.contains(requested) {
                tracing::warn!(layer = %requested, "requested layer is not part of the backbone");
            }
        }

        let content_set: HashSet<&str> = content_layers.iter().map(String::as_str).collect();
        let style_set: HashSet<&str> = style_layers.iter().map(String::as_str).collect();
        let deepest = names
            .iter()
            .rposition(|n| content_set.contains(n.as_str()) || style_set.contains(n.as_str()));

        let mut content_features = normalization.forward(content.view())?;
        let mut style_features = normalization.forward(style.view())?;

        let mut nodes = vec![Node::Normalize(normalization)];
        let mut probes = Probes::default();

        let depth = deepest.map_or(0, |d| d + 1);
        for ((spec, name), layer) in specs.iter().zip(names).zip(backbone.layers()).take(depth) {
            content_features = layer.forward(content_features.view())?;
            style_features = layer.forward(style_features.view())?;

            let is_content = content_set.contains(name.as_str());
            let is_style = style_set.contains(name.as_str());

            nodes.push(Node::Layer(NamedLayer {
                name,
                kind: spec.kind,
                layer,
            }));

            if is_content {
                nodes.push(Node::Probe(ProbeHandle::Content(probes.content.len())));
                probes.content.push(ContentProbe::new(content_features.clone()));
            }

            if is_style {
                nodes.push(Node::Probe(ProbeHandle::Style(probes.style.len())));
                probes.style.push(StyleProbe::new(style_features.view()));
            }
        }

        tracing::debug!(
            nodes = nodes.len(),
            content_probes = probes.content.len(),
            style_probes = probes.style.len(),
            "built feature graph"
        );

        Ok((Self { nodes }, probes))
    }

    /// Number of nodes, including the normalization and the probes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names of the backbone layers that made it into the graph, in order
    pub fn layer_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Layer(nl) => Some(nl.name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Position of every probe in the node sequence
    pub fn probe_positions(&self) -> Vec<(usize, ProbeHandle)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| match node {
                Node::Probe(handle) => Some((i, *handle)),
                _ => None,
            })
            .collect()
    }

    /// Runs `input` through the graph, refreshing the loss of every probe
    pub fn forward(&self, input: &ImageTensor, probes: &mut Probes) -> Result<Trace, Error> {
        self.forward_view(input.view(), probes)
    }

    pub(crate) fn forward_view(
        &self,
        input: ArrayView4<'_, f32>,
        probes: &mut Probes,
    ) -> Result<Trace, Error> {
        let mut outputs = vec![input.to_owned()];

        for node in &self.nodes {
            let current = outputs.last().map(|o| o.view());
            let current = match current {
                Some(current) => current,
                None => break,
            };

            match node {
                Node::Normalize(norm) => {
                    let next = norm.forward(current)?;
                    outputs.push(next);
                }
                Node::Layer(nl) => {
                    let next = nl.layer.forward(current)?;
                    outputs.push(next);
                }
                Node::Probe(ProbeHandle::Content(i)) => {
                    probe_mut(&mut probes.content, *i)?.measure(current)?;
                }
                Node::Probe(ProbeHandle::Style(i)) => {
                    probe_mut(&mut probes.style, *i)?.measure(current)?;
                }
            }
        }

        Ok(Trace { outputs })
    }

    /// Gradient of `weights.style * Σstyle + weights.content * Σcontent`
    /// with respect to the graph input
    pub fn backward(
        &self,
        trace: &Trace,
        probes: &Probes,
        weights: LossWeights,
    ) -> Result<Array4<f32>, Error> {
        let outputs = &trace.outputs;
        let mut depth = outputs.len() - 1;
        let mut grad = Array4::zeros(outputs[depth].dim());

        for node in self.nodes.iter().rev() {
            match node {
                Node::Probe(ProbeHandle::Content(i)) => {
                    let g = probe(&probes.content, *i)?.gradient(outputs[depth].view())?;
                    grad.scaled_add(weights.content, &g);
                }
                Node::Probe(ProbeHandle::Style(i)) => {
                    let g = probe(&probes.style, *i)?.gradient(outputs[depth].view())?;
                    grad.scaled_add(weights.style, &g);
                }
                Node::Layer(nl) => {
                    grad = nl.layer.backward(outputs[depth - 1].view(), grad.view())?;
                    depth -= 1;
                }
                Node::Normalize(norm) => {
                    grad = norm.backward(grad.view());
                    depth -= 1;
                }
            }
        }

        Ok(grad)
    }
}

fn probe<T>(probes: &[T], index: usize) -> Result<&T, Error> {
    probes
        .get(index)
        .ok_or_else(|| Error::shape_mismatch("probe list", &[index + 1], &[probes.len()]))
}

fn probe_mut<T>(probes: &mut [T], index: usize) -> Result<&mut T, Error> {
    let len = probes.len();
    probes
        .get_mut(index)
        .ok_or_else(|| Error::shape_mismatch("probe list", &[index + 1], &[len]))
}
