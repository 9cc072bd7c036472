//! Content and style probes.
//!
//! A probe sits between two layers of the feature graph. It leaves the
//! features flowing through it untouched and records how far they are from a
//! detached target, along with the gradient of that distance for the backward
//! pass.

use crate::{tensor, Error};
use ndarray::{Array2, Array4, ArrayView4, Axis, Zip};

/// Gram matrix of a `(1, C, H, W)` feature map, `F·Fᵀ / (C·H·W)`
pub fn gram(features: ArrayView4<'_, f32>) -> Array2<f32> {
    let (_, c, h, w) = features.dim();
    let flat = tensor::flatten(features.index_axis(Axis(0), 0));
    let norm = (c * h * w).max(1) as f32;
    flat.dot(&flat.t()) / norm
}

/// Mean of the squared element-wise differences
fn mse<D: ndarray::Dimension>(
    a: ndarray::ArrayView<'_, f32, D>,
    b: ndarray::ArrayView<'_, f32, D>,
) -> f32 {
    let sum = Zip::from(&a).and(&b).fold(0.0, |acc, x, y| acc + (x - y) * (x - y));
    sum / a.len().max(1) as f32
}

#[derive(Clone, Debug)]
pub struct ContentProbe {
    target: Array4<f32>,
    loss: f32,
}

impl ContentProbe {
    pub fn new(target: Array4<f32>) -> Self {
        Self { target, loss: 0.0 }
    }

    pub fn loss(&self) -> f32 {
        self.loss
    }

    fn check(&self, features: &ArrayView4<'_, f32>) -> Result<(), Error> {
        if features.shape() != self.target.shape() {
            return Err(Error::shape_mismatch(
                "content features",
                self.target.shape(),
                features.shape(),
            ));
        }
        Ok(())
    }

    pub fn measure(&mut self, features: ArrayView4<'_, f32>) -> Result<f32, Error> {
        self.check(&features)?;
        self.loss = mse(features, self.target.view());
        Ok(self.loss)
    }

    /// Gradient of the loss with respect to `features`
    pub fn gradient(&self, features: ArrayView4<'_, f32>) -> Result<Array4<f32>, Error> {
        self.check(&features)?;
        let n = features.len().max(1) as f32;
        Ok((&features - &self.target) * (2.0 / n))
    }
}

#[derive(Clone, Debug)]
pub struct StyleProbe {
    target: Array2<f32>,
    loss: f32,
}

impl StyleProbe {
    /// Creates a probe whose target is the Gram matrix of `features`
    pub fn new(features: ArrayView4<'_, f32>) -> Self {
        Self {
            target: gram(features),
            loss: 0.0,
        }
    }

    pub fn loss(&self) -> f32 {
        self.loss
    }

    pub fn target(&self) -> &Array2<f32> {
        &self.target
    }

    fn current(&self, features: ArrayView4<'_, f32>) -> Result<Array2<f32>, Error> {
        let g = gram(features);
        if g.shape() != self.target.shape() {
            return Err(Error::shape_mismatch(
                "style gram matrix",
                self.target.shape(),
                g.shape(),
            ));
        }
        Ok(g)
    }

    pub fn measure(&mut self, features: ArrayView4<'_, f32>) -> Result<f32, Error> {
        let g = self.current(features)?;
        self.loss = mse(g.view(), self.target.view());
        Ok(self.loss)
    }

    pub fn gradient(&self, features: ArrayView4<'_, f32>) -> Result<Array4<f32>, Error> {
        let g = self.current(features)?;
        let (_, c, h, w) = features.dim();

        // d(mse)/dG, then through G = F·Fᵀ / N which is symmetric
        let dg = (&g - &self.target) * (2.0 / (c * c).max(1) as f32);
        let flat = tensor::flatten(features.index_axis(Axis(0), 0));
        let df = dg.dot(&flat) * (2.0 / (c * h * w).max(1) as f32);

        df.into_shape((1, c, h, w))
            .map_err(|_| Error::shape_mismatch("style gradient", &[1, c, h, w], &[c, h * w]))
    }
}
