//! Image tensors and the host-side kernels used by the frozen networks.
//!
//! Every kernel is out of place: inputs are borrowed and a fresh array is
//! returned, so activations cached for the backward pass are never clobbered.
//! Only gradients with respect to the *input* are computed, the weights of
//! both the backbone and the generators are frozen.

use crate::Error;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};

/// A single image laid out as `(1, channels, height, width)`.
#[derive(Clone, Debug)]
pub struct ImageTensor(pub(crate) Array4<f32>);

impl ImageTensor {
    /// Wraps an array, which must hold exactly one image
    pub fn new(data: Array4<f32>) -> Result<Self, Error> {
        let (batch, channels, height, width) = data.dim();
        if batch != 1 {
            return Err(Error::shape_mismatch(
                "image tensor",
                &[1, channels, height, width],
                data.shape(),
            ));
        }

        Ok(Self(data))
    }

    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self(Array4::zeros((1, channels, height, width)))
    }

    /// `(channels, height, width)`
    pub fn dims(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.0.dim();
        (c, h, w)
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.0
    }

    pub fn into_inner(self) -> Array4<f32> {
        self.0
    }

    /// Clamps every value into `[min, max]` in place
    pub fn clamp(&mut self, min: f32, max: f32) {
        self.0.mapv_inplace(|v| v.max(min).min(max));
    }

    /// Largest absolute element-wise difference, or `None` if the shapes differ
    pub fn max_abs_diff(&self, other: &ImageTensor) -> Option<f32> {
        if self.0.shape() != other.0.shape() {
            return None;
        }

        Some(
            Zip::from(&self.0)
                .and(&other.0)
                .fold(0.0f32, |acc, a, b| acc.max((a - b).abs())),
        )
    }
}

/// Square sliding window shared by convolutions and pooling
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Window {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Window {
    pub fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel,
            stride,
            padding,
        }
    }

    /// Number of window positions along an axis of `input` elements
    pub fn output_len(&self, input: usize) -> usize {
        match (input + 2 * self.padding).checked_sub(self.kernel) {
            Some(span) => span / self.stride.max(1) + 1,
            None => 0,
        }
    }

    /// Maps a grid position and kernel offset to a source coordinate, if it
    /// falls inside `len`
    #[inline]
    fn source(&self, grid: usize, offset: usize, len: usize) -> Option<usize> {
        let pos = (grid * self.stride + offset) as isize - self.padding as isize;
        if pos >= 0 && (pos as usize) < len {
            Some(pos as usize)
        } else {
            None
        }
    }
}

/// Flattens a `(channels, height, width)` view into a `(channels, height * width)` matrix
pub(crate) fn flatten(x: ArrayView3<'_, f32>) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let mut out = Array2::zeros((c, h * w));
    for (mut row, plane) in out.outer_iter_mut().zip(x.outer_iter()) {
        for (dst, src) in row.iter_mut().zip(plane.iter()) {
            *dst = *src;
        }
    }
    out
}

fn into_image(a: Array2<f32>, (c, h, w): (usize, usize, usize)) -> Result<Array4<f32>, Error> {
    let actual = a.shape().to_vec();
    a.into_shape((1, c, h, w))
        .map_err(|_| Error::shape_mismatch("kernel output", &[1, c, h, w], &actual))
}

/// Gathers every window of `x` into a column, rows are ordered by
/// `(channel, ky, kx)`, columns by grid position.
fn im2col(x: ArrayView3<'_, f32>, win: Window, (gh, gw): (usize, usize)) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let k = win.kernel;
    let mut cols = Array2::zeros((c * k * k, gh * gw));

    for ch in 0..c {
        for ky in 0..k {
            for kx in 0..k {
                let row = (ch * k + ky) * k + kx;
                for gy in 0..gh {
                    let sy = match win.source(gy, ky, h) {
                        Some(sy) => sy,
                        None => continue,
                    };
                    for gx in 0..gw {
                        if let Some(sx) = win.source(gx, kx, w) {
                            cols[[row, gy * gw + gx]] = x[[ch, sy, sx]];
                        }
                    }
                }
            }
        }
    }

    cols
}

/// The adjoint of `im2col`, overlapping windows accumulate
fn col2im(
    cols: ArrayView2<'_, f32>,
    channels: usize,
    win: Window,
    (gh, gw): (usize, usize),
    (h, w): (usize, usize),
) -> Array3<f32> {
    let k = win.kernel;
    let mut out = Array3::zeros((channels, h, w));

    for ch in 0..channels {
        for ky in 0..k {
            for kx in 0..k {
                let row = (ch * k + ky) * k + kx;
                for gy in 0..gh {
                    let ty = match win.source(gy, ky, h) {
                        Some(ty) => ty,
                        None => continue,
                    };
                    for gx in 0..gw {
                        if let Some(tx) = win.source(gx, kx, w) {
                            out[[ch, ty, tx]] += cols[[row, gy * gw + gx]];
                        }
                    }
                }
            }
        }
    }

    out
}

fn add_bias(out: &mut Array2<f32>, bias: Option<&Array1<f32>>) {
    if let Some(bias) = bias {
        for (mut row, &b) in out.outer_iter_mut().zip(bias.iter()) {
            row.mapv_inplace(|v| v + b);
        }
    }
}

/// 2D convolution, `weight` is `(out_channels, in_channels * k * k)`
pub(crate) fn conv2d(
    x: ArrayView4<'_, f32>,
    weight: &Array2<f32>,
    bias: Option<&Array1<f32>>,
    win: Window,
) -> Result<Array4<f32>, Error> {
    let x = x.index_axis(Axis(0), 0);
    let (c, h, w) = x.dim();
    let k = win.kernel;

    if weight.ncols() != c * k * k {
        return Err(Error::shape_mismatch(
            "convolution input",
            &[1, weight.ncols() / (k * k).max(1), h, w],
            &[1, c, h, w],
        ));
    }

    let (ho, wo) = (win.output_len(h), win.output_len(w));
    let cols = im2col(x, win, (ho, wo));
    let mut out = weight.dot(&cols);
    add_bias(&mut out, bias);

    into_image(out, (weight.nrows(), ho, wo))
}

/// Gradient of `conv2d` with respect to its input of `(height, width)`
pub(crate) fn conv2d_input_grad(
    grad: ArrayView4<'_, f32>,
    weight: &Array2<f32>,
    win: Window,
    (h, w): (usize, usize),
) -> Array4<f32> {
    let grad = grad.index_axis(Axis(0), 0);
    let (_, gh, gw) = grad.dim();
    let channels = weight.ncols() / (win.kernel * win.kernel).max(1);

    let cols = weight.t().dot(&flatten(grad));
    col2im(cols.view(), channels, win, (gh, gw), (h, w)).insert_axis(Axis(0))
}

/// Transposed 2D convolution, `weight` is `(in_channels, out_channels * k * k)`
pub(crate) fn conv_transpose2d(
    x: ArrayView4<'_, f32>,
    weight: &Array2<f32>,
    bias: Option<&Array1<f32>>,
    win: Window,
    output_padding: usize,
) -> Result<Array4<f32>, Error> {
    let x = x.index_axis(Axis(0), 0);
    let (c, h, w) = x.dim();
    let k = win.kernel;

    if weight.nrows() != c {
        return Err(Error::shape_mismatch(
            "transposed convolution input",
            &[1, weight.nrows(), h, w],
            &[1, c, h, w],
        ));
    }

    let out_channels = weight.ncols() / (k * k).max(1);
    let grow = |len: usize| {
        ((len.max(1) - 1) * win.stride + k + output_padding).saturating_sub(2 * win.padding)
    };
    let (ho, wo) = (grow(h), grow(w));

    let cols = weight.t().dot(&flatten(x));
    let out = col2im(cols.view(), out_channels, win, (h, w), (ho, wo));
    let mut out = flatten(out.view());
    add_bias(&mut out, bias);

    into_image(out, (out_channels, ho, wo))
}

pub(crate) fn relu(x: ArrayView4<'_, f32>) -> Array4<f32> {
    x.mapv(|v| v.max(0.0))
}

pub(crate) fn relu_grad(x: ArrayView4<'_, f32>, grad: ArrayView4<'_, f32>) -> Array4<f32> {
    let mut out = grad.to_owned();
    Zip::from(&mut out).and(&x).for_each(|g, &v| {
        if v <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

pub(crate) fn tanh(x: ArrayView4<'_, f32>) -> Array4<f32> {
    x.mapv(f32::tanh)
}

/// Position of the largest value inside one pooling window, first one wins ties
fn pool_argmax(
    plane: ArrayView2<'_, f32>,
    win: Window,
    (oy, ox): (usize, usize),
) -> Option<(usize, usize)> {
    let (h, w) = plane.dim();
    let mut best: Option<((usize, usize), f32)> = None;

    for ky in 0..win.kernel {
        let y = match win.source(oy, ky, h) {
            Some(y) => y,
            None => continue,
        };
        for kx in 0..win.kernel {
            if let Some(x) = win.source(ox, kx, w) {
                let v = plane[[y, x]];
                if best.map_or(true, |(_, b)| v > b) {
                    best = Some(((y, x), v));
                }
            }
        }
    }

    best.map(|(pos, _)| pos)
}

pub(crate) fn max_pool(x: ArrayView4<'_, f32>, win: Window) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    let (ho, wo) = (win.output_len(h), win.output_len(w));

    Array4::from_shape_fn((n, c, ho, wo), |(b, ch, oy, ox)| {
        let plane = x.index_axis(Axis(0), b);
        let plane = plane.index_axis(Axis(0), ch);
        match pool_argmax(plane, win, (oy, ox)) {
            Some((y, x)) => plane[[y, x]],
            None => 0.0,
        }
    })
}

pub(crate) fn max_pool_grad(
    x: ArrayView4<'_, f32>,
    grad: ArrayView4<'_, f32>,
    win: Window,
) -> Array4<f32> {
    let mut out = Array4::zeros(x.dim());

    for ((b, ch, oy, ox), &g) in grad.indexed_iter() {
        let plane = x.index_axis(Axis(0), b);
        let plane = plane.index_axis(Axis(0), ch);
        if let Some((y, x)) = pool_argmax(plane, win, (oy, ox)) {
            out[[b, ch, y, x]] += g;
        }
    }

    out
}

/// Applies `v * scale[c] + shift[c]` to every channel `c`
pub(crate) fn channel_affine(x: ArrayView4<'_, f32>, scale: &[f32], shift: &[f32]) -> Array4<f32> {
    let mut out = x.to_owned();
    for (ch, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
        let (a, b) = (scale[ch], shift[ch]);
        plane.mapv_inplace(|v| v * a + b);
    }
    out
}

/// Instance normalization without affine parameters or running statistics
pub(crate) fn instance_norm(x: ArrayView4<'_, f32>, eps: f32) -> Array4<f32> {
    let mut out = x.to_owned();
    for mut image in out.outer_iter_mut() {
        for mut plane in image.outer_iter_mut() {
            let count = plane.len().max(1) as f32;
            let mean = plane.sum() / count;
            let var = plane.fold(0.0, |acc, &v| acc + (v - mean) * (v - mean)) / count;
            let inv_std = 1.0 / (var + eps).sqrt();
            plane.mapv_inplace(|v| (v - mean) * inv_std);
        }
    }
    out
}

/// Pads the spatial axes by mirroring, without repeating the edge
pub(crate) fn reflection_pad(input: ArrayView4<'_, f32>, pad: usize) -> Array4<f32> {
    let (n, c, h, w) = input.dim();
    let reflect = |i: usize, len: usize| -> usize {
        let i = i as isize - pad as isize;
        let len = len as isize;
        let r = if i < 0 {
            -i
        } else if i >= len {
            2 * len - 2 - i
        } else {
            i
        };
        r.max(0).min(len - 1) as usize
    };

    Array4::from_shape_fn((n, c, h + 2 * pad, w + 2 * pad), |(b, ch, y, x)| {
        input[[b, ch, reflect(y, h), reflect(x, w)]]
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn image(data: Array3<f32>) -> Array4<f32> {
        data.insert_axis(Axis(0))
    }

    #[test]
    fn output_len_follows_floor_division() {
        assert_eq!(Window::new(3, 1, 1).output_len(8), 8);
        assert_eq!(Window::new(2, 2, 0).output_len(5), 2);
        assert_eq!(Window::new(3, 2, 1).output_len(8), 4);
        assert_eq!(Window::new(7, 1, 0).output_len(3), 0);
    }

    #[test]
    fn conv_with_identity_kernel_copies_input() {
        let x = image(array![[[1.0, 2.0], [3.0, 4.0]]]);
        // 3x3 kernel with a 1 in the center
        let mut weight = Array2::zeros((1, 9));
        weight[[0, 4]] = 1.0;
        let bias = array![0.5];

        let y = conv2d(x.view(), &weight, Some(&bias), Window::new(3, 1, 1)).unwrap();
        assert_eq!(y, x.mapv(|v| v + 0.5));
    }

    #[test]
    fn conv_sums_windows() {
        let x = image(array![[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]]);
        let weight = Array2::from_elem((1, 4), 1.0);

        let y = conv2d(x.view(), &weight, None, Window::new(2, 1, 0)).unwrap();
        assert_eq!(y, image(array![[[12.0, 16.0], [24.0, 28.0]]]));
    }

    #[test]
    fn conv_rejects_wrong_channel_count() {
        let x = Array4::zeros((1, 2, 4, 4));
        let weight = Array2::zeros((1, 9));
        assert!(conv2d(x.view(), &weight, None, Window::new(3, 1, 1)).is_err());
    }

    #[test]
    fn conv_input_grad_is_adjoint() {
        // <conv(x), g> == <x, conv^T(g)> for any x and g
        let x = image(array![
            [[0.1, -0.4, 0.3], [0.9, 0.2, -0.7], [0.5, 0.6, -0.2]],
            [[-0.3, 0.8, 0.1], [0.4, -0.5, 0.2], [0.7, -0.1, 0.3]]
        ]);
        let weight = Array2::from_shape_fn((2, 18), |(o, i)| ((o * 18 + i) as f32 * 0.37).sin());
        let win = Window::new(3, 2, 1);

        let y = conv2d(x.view(), &weight, None, win).unwrap();
        let g = y.mapv(|v| v.cos());
        let dx = conv2d_input_grad(g.view(), &weight, win, (3, 3));

        let lhs = (&y * &g).sum();
        let rhs = (&x * &dx).sum();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-4);
    }

    #[test]
    fn transposed_conv_upsamples() {
        let x = Array4::from_elem((1, 1, 4, 4), 1.0);
        let weight = Array2::from_elem((1, 2 * 9), 0.5);
        let y = conv_transpose2d(x.view(), &weight, None, Window::new(3, 2, 1), 1).unwrap();
        assert_eq!(y.dim(), (1, 2, 8, 8));
    }

    #[test]
    fn max_pool_routes_gradient_to_max() {
        let x = image(array![[
            [1.0, 5.0, 2.0, 0.0],
            [3.0, 4.0, 8.0, 1.0],
            [0.0, 0.0, 1.0, 1.0],
            [9.0, 0.0, 1.0, 2.0]
        ]]);
        let win = Window::new(2, 2, 0);

        let y = max_pool(x.view(), win);
        assert_eq!(y, image(array![[[5.0, 8.0], [9.0, 2.0]]]));

        let g = Array4::from_elem(y.dim(), 1.0);
        let dx = max_pool_grad(x.view(), g.view(), win);
        assert_eq!(dx.sum(), 4.0);
        assert_eq!(dx[[0, 0, 0, 1]], 1.0);
        assert_eq!(dx[[0, 0, 1, 2]], 1.0);
        assert_eq!(dx[[0, 0, 3, 0]], 1.0);
        assert_eq!(dx[[0, 0, 3, 3]], 1.0);
    }

    #[test]
    fn relu_grad_masks_negative_inputs() {
        let x = image(array![[[-1.0, 2.0], [0.0, 3.0]]]);
        let g = Array4::from_elem(x.dim(), 2.0);
        assert_eq!(relu(x.view()), image(array![[[0.0, 2.0], [0.0, 3.0]]]));
        assert_eq!(
            relu_grad(x.view(), g.view()),
            image(array![[[0.0, 2.0], [0.0, 2.0]]])
        );
    }

    #[test]
    fn instance_norm_centers_each_plane() {
        let x = image(array![[[1.0, 2.0], [3.0, 4.0]], [[10.0, 10.0], [10.0, 30.0]]]);
        let y = instance_norm(x.view(), 1e-5);

        for plane in y.index_axis(Axis(0), 0).outer_iter() {
            assert_abs_diff_eq!(plane.sum(), 0.0, epsilon = 1e-4);
            let var = plane.fold(0.0, |acc, &v| acc + v * v) / plane.len() as f32;
            assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn reflection_pad_mirrors_edges() {
        let x = image(array![[[1.0, 2.0, 3.0]]]);
        let y = reflection_pad(x.view(), 1);
        assert_eq!(y.dim(), (1, 1, 3, 5));
        // A single row reflects onto itself
        assert_eq!(
            y.index_axis(Axis(0), 0).index_axis(Axis(0), 0).row(1).to_vec(),
            vec![2.0, 1.0, 2.0, 3.0, 2.0]
        );
    }

    #[test]
    fn clamp_and_diff() {
        let mut t = ImageTensor::new(image(array![[[-0.5, 0.5], [1.5, 1.0]]])).unwrap();
        t.clamp(0.0, 1.0);
        let expected = ImageTensor::new(image(array![[[0.0, 0.5], [1.0, 1.0]]])).unwrap();
        assert_eq!(t.max_abs_diff(&expected), Some(0.0));
        assert!(ImageTensor::new(Array4::zeros((2, 3, 1, 1))).is_err());
    }
}
