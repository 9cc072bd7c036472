//! Limited-memory BFGS without a line search.
//!
//! This is the formulation popularized by Torch: every call to
//! [`Lbfgs::step`] runs up to `max_iter` inner iterations using fixed step
//! sizes, and the curvature history is carried over from one call to the
//! next.

use ndarray::{Array, Dimension, Zip};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Tuning knobs, the defaults match what style transfer is usually run with
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbfgsConfig {
    /// Step size of every iteration after the very first one
    pub lr: f32,
    /// Inner iterations per step
    pub max_iter: usize,
    /// Objective evaluations per step
    pub max_eval: usize,
    /// A step ends early once the largest gradient component is this small
    pub tolerance_grad: f32,
    /// A step ends early once the objective or the iterate move less than this
    pub tolerance_change: f32,
    /// Number of curvature pairs that are remembered
    pub history_size: usize,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            lr: 1.0,
            max_iter: 20,
            max_eval: 25,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            history_size: 100,
        }
    }
}

fn dot<D: Dimension>(a: &Array<f32, D>, b: &Array<f32, D>) -> f32 {
    Zip::from(a).and(b).fold(0.0, |acc, x, y| acc + x * y)
}

fn max_abs<D: Dimension>(a: &Array<f32, D>) -> f32 {
    a.fold(0.0f32, |acc, v| acc.max(v.abs()))
}

pub struct Lbfgs<D: Dimension> {
    config: LbfgsConfig,
    direction: Option<Array<f32, D>>,
    step_size: f32,
    old_dirs: VecDeque<Array<f32, D>>,
    old_steps: VecDeque<Array<f32, D>>,
    ro: VecDeque<f32>,
    h_diag: f32,
    prev_grad: Option<Array<f32, D>>,
    iterations: usize,
    evaluations: usize,
}

impl<D: Dimension> Lbfgs<D> {
    pub fn new(config: LbfgsConfig) -> Self {
        Self {
            config,
            direction: None,
            step_size: config.lr,
            old_dirs: VecDeque::new(),
            old_steps: VecDeque::new(),
            ro: VecDeque::new(),
            h_diag: 1.0,
            prev_grad: None,
            iterations: 0,
            evaluations: 0,
        }
    }

    /// Total number of objective evaluations so far
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Total number of inner iterations so far
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Computes the next search direction from the curvature history
    fn direction(&mut self, grad: &Array<f32, D>) -> Array<f32, D> {
        let (prev_grad, prev_dir) = match (&self.prev_grad, &self.direction) {
            (Some(pg), Some(d)) if self.iterations > 1 => (pg, d),
            _ => {
                self.old_dirs.clear();
                self.old_steps.clear();
                self.ro.clear();
                self.h_diag = 1.0;
                return grad.mapv(|g| -g);
            }
        };

        let y = grad - prev_grad;
        let s = prev_dir * self.step_size;
        let ys = dot(&y, &s);

        if ys > 1e-10 {
            if self.old_dirs.len() == self.config.history_size {
                self.old_dirs.pop_front();
                self.old_steps.pop_front();
                self.ro.pop_front();
            }

            self.h_diag = ys / dot(&y, &y);
            self.old_dirs.push_back(y);
            self.old_steps.push_back(s);
            self.ro.push_back(1.0 / ys);
        }

        // Two-loop recursion
        let count = self.old_dirs.len();
        let mut alphas = vec![0.0; count];
        let mut q = grad.mapv(|g| -g);

        for i in (0..count).rev() {
            alphas[i] = dot(&self.old_steps[i], &q) * self.ro[i];
            q.scaled_add(-alphas[i], &self.old_dirs[i]);
        }

        let mut r = q * self.h_diag;
        for i in 0..count {
            let beta = dot(&self.old_dirs[i], &r) * self.ro[i];
            r.scaled_add(alphas[i] - beta, &self.old_steps[i]);
        }

        r
    }

    /// Performs a single optimization step.
    ///
    /// `closure` evaluates the objective at the iterate, which it may also
    /// modify, and returns the objective along with its gradient. The
    /// objective value from the start of the step is returned.
    pub fn step<F, E>(&mut self, x: &mut Array<f32, D>, mut closure: F) -> Result<f32, E>
    where
        F: FnMut(&mut Array<f32, D>) -> Result<(f32, Array<f32, D>), E>,
    {
        let config = self.config;

        let (orig_loss, mut grad) = closure(x)?;
        let mut loss = orig_loss;
        let mut current_evals = 1;
        self.evaluations += 1;

        if max_abs(&grad) <= config.tolerance_grad {
            return Ok(orig_loss);
        }

        let mut n_iter = 0;
        while n_iter < config.max_iter {
            n_iter += 1;
            self.iterations += 1;

            let direction = self.direction(&grad);
            let prev_loss = loss;

            self.step_size = if self.iterations == 1 {
                let l1 = grad.fold(0.0f32, |acc, g| acc + g.abs());
                (1.0f32).min(1.0 / l1) * config.lr
            } else {
                config.lr
            };

            let gtd = dot(&grad, &direction);
            self.direction = Some(direction);
            self.prev_grad = Some(grad.clone());

            if gtd > -config.tolerance_change {
                break;
            }

            if let Some(d) = &self.direction {
                x.scaled_add(self.step_size, d);
            }

            let mut optimal = false;
            if n_iter != config.max_iter {
                let (l, g) = closure(x)?;
                loss = l;
                grad = g;
                optimal = max_abs(&grad) <= config.tolerance_grad;
                current_evals += 1;
                self.evaluations += 1;
            }

            if n_iter == config.max_iter || current_evals >= config.max_eval || optimal {
                break;
            }

            let moved = self
                .direction
                .as_ref()
                .map_or(0.0, |d| max_abs(d) * self.step_size.abs());
            if moved <= config.tolerance_change {
                break;
            }

            if (loss - prev_loss).abs() < config.tolerance_change {
                break;
            }
        }

        Ok(orig_loss)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    #[test]
    fn solves_a_parabola() {
        let mut x = array![0.0f32];
        let mut lbfgs = Lbfgs::new(LbfgsConfig::default());

        let loss = lbfgs
            .step(&mut x, |x: &mut Array1<f32>| {
                let v = x[0] - 3.0;
                Ok::<_, ()>((v * v, array![2.0 * v]))
            })
            .unwrap();

        assert_abs_diff_eq!(loss, 9.0);
        assert_abs_diff_eq!(x[0], 3.0, epsilon = 1e-4);
    }

    #[test]
    fn converges_on_an_ill_conditioned_quadratic() {
        // f(x) = 0.5 * Σ a_i x_i² - b_i x_i, minimized at x_i = b_i / a_i
        let a = array![1.0f32, 10.0, 0.5, 4.0];
        let b = array![1.0f32, -2.0, 0.25, 8.0];

        let mut x = Array1::zeros(4);
        let mut lbfgs = Lbfgs::new(LbfgsConfig::default());

        for _ in 0..5 {
            lbfgs
                .step(&mut x, |x: &mut Array1<f32>| {
                    let loss = (0.5 * &a * &*x * &*x - &b * &*x).sum();
                    let grad = &a * &*x - &b;
                    Ok::<_, ()>((loss, grad))
                })
                .unwrap();
        }

        let expected = &b / &a;
        for (x, e) in x.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*x, *e, epsilon = 1e-3);
        }
    }

    #[test]
    fn respects_the_evaluation_budget() {
        let config = LbfgsConfig {
            max_iter: 3,
            ..Default::default()
        };
        let mut lbfgs = Lbfgs::new(config);
        let mut x = array![10.0f32, -4.0];
        let mut calls = 0;

        lbfgs
            .step(&mut x, |x: &mut Array1<f32>| {
                calls += 1;
                // |x|^4 is far from quadratic, so this can't finish early
                let n2 = x.dot(&*x);
                Ok::<_, ()>((n2 * n2, x.mapv(|v| 4.0 * n2 * v)))
            })
            .unwrap();

        // The final iteration doesn't re-evaluate
        assert_eq!(calls, 3);
        assert_eq!(lbfgs.evaluations(), 3);
        assert_eq!(lbfgs.iterations(), 3);
    }

    #[test]
    fn closure_errors_propagate() {
        let mut lbfgs = Lbfgs::new(LbfgsConfig::default());
        let mut x = array![1.0f32];
        let res = lbfgs.step(&mut x, |_: &mut Array1<f32>| Err::<(f32, Array1<f32>), _>("boom"));
        assert_eq!(res, Err("boom"));
    }
}
