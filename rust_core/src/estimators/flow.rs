//! Conditional affine normalizing flow.
//!
//! Each layer maps noise to data as `y = L (u ⊙ exp(s(c)) + t(c))`, where `s`
//! and `t` are affine in the context `c` and `L` is a fixed unit
//! lower-triangular mixing matrix (so `|det L| = 1`). The base distribution
//! is a standard normal. With layers applied in order during sampling, the
//! density is
//!
//! `log p(x | c) = log N(z; 0, I) - Σ_layers Σ_i s_i(c)`
//!
//! where `z` is obtained by inverting the layers in reverse order.

use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal as NormalSampler, StandardNormal};

use super::{ConditionalNet, InvertibleNet, Linear};
use crate::distributions::LN_SQRT_2PI;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct AffineLayer {
    shift: Linear,
    log_scale: Linear,
    /// Unit lower-triangular; only entries below the diagonal are read.
    mixing: Array2<f64>,
}

impl AffineLayer {
    /// `v = L^{-1} y` row by row (forward substitution).
    fn unmix(&self, y: &mut Array2<f64>) {
        let d = self.mixing.nrows();
        for mut row in y.rows_mut() {
            for i in 0..d {
                let mut acc = row[i];
                for j in 0..i {
                    acc -= self.mixing[[i, j]] * row[j];
                }
                row[i] = acc;
            }
        }
    }

    fn mix(&self, w: ArrayView2<f64>) -> Array2<f64> {
        let d = self.mixing.nrows();
        let lower = Array2::from_shape_fn((d, d), |(i, j)| match i.cmp(&j) {
            std::cmp::Ordering::Greater => self.mixing[[i, j]],
            std::cmp::Ordering::Equal => 1.0,
            std::cmp::Ordering::Less => 0.0,
        });
        w.dot(&lower.t()).as_standard_layout().into_owned()
    }
}

/// Stack of conditional affine layers over a standard-normal base.
#[derive(Debug, Clone)]
pub struct AffineFlow {
    input_dim: usize,
    context_dim: usize,
    layers: Vec<AffineLayer>,
}

impl AffineFlow {
    /// Randomly initialised flow, close to the identity map.
    pub fn new(
        input_dim: usize,
        context_dim: usize,
        num_layers: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        if input_dim == 0 || num_layers == 0 {
            return Err(Error::Validation(format!(
                "flow needs input_dim >= 1 and num_layers >= 1, got {} and {}",
                input_dim, num_layers
            )));
        }
        let mix_init = NormalSampler::new(0.0, 0.1).expect("std is finite and positive");
        let layers = (0..num_layers)
            .map(|_| AffineLayer {
                shift: Linear::random(context_dim, input_dim, rng),
                log_scale: Linear::random(context_dim, input_dim, rng),
                mixing: Array2::from_shape_fn((input_dim, input_dim), |(i, j)| {
                    if i > j {
                        mix_init.sample(rng)
                    } else {
                        0.0
                    }
                }),
            })
            .collect();
        Ok(Self { input_dim, context_dim, layers })
    }

    /// Closed-form maximum-likelihood fit of a single-layer flow, i.e. a
    /// conditional diagonal Gaussian whose mean is affine in the context.
    ///
    /// `theta` is `(n, input_dim)`, `context` is `(n, context_dim)`. The mean
    /// is the least-squares regression of `theta` on `[context, 1]`; the scale
    /// is the per-dimension residual standard deviation.
    pub fn fit_gaussian(theta: ArrayView2<f64>, context: ArrayView2<f64>) -> Result<Self> {
        let (n, d) = theta.dim();
        let c = context.ncols();
        if context.nrows() != n {
            return Err(Error::Shape(format!(
                "theta has {} rows but context has {}",
                n,
                context.nrows()
            )));
        }
        if n <= c + 1 || d == 0 {
            return Err(Error::Validation(format!(
                "need more than {} rows to fit a {}-dimensional context, got {}",
                c + 1,
                c,
                n
            )));
        }

        let design = DMatrix::from_fn(n, c + 1, |i, j| if j < c { context[[i, j]] } else { 1.0 });
        let targets = DMatrix::from_fn(n, d, |i, j| theta[[i, j]]);
        let gram = design.transpose() * &design;
        let chol = gram.cholesky().ok_or_else(|| {
            Error::Computation("context design matrix is singular".to_string())
        })?;
        let beta = chol.solve(&(design.transpose() * &targets));
        let residuals = &targets - &design * &beta;

        let weight = Array2::from_shape_fn((d, c), |(i, j)| beta[(j, i)]);
        let bias = Array1::from_shape_fn(d, |i| beta[(c, i)]);
        let mut log_std = Array1::zeros(d);
        for i in 0..d {
            let var = residuals.column(i).iter().map(|r| r * r).sum::<f64>() / n as f64;
            if !(var > 0.0) || !var.is_finite() {
                return Err(Error::Computation(format!(
                    "residual variance of dimension {} is {}",
                    i, var
                )));
            }
            log_std[i] = 0.5 * var.ln();
        }

        let layer = AffineLayer {
            shift: Linear::new(weight, bias)?,
            log_scale: Linear::new(Array2::zeros((d, c)), log_std)?,
            mixing: Array2::zeros((d, d)),
        };
        Ok(Self { input_dim: d, context_dim: c, layers: vec![layer] })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Data → noise, with the log-determinant of the inverse map.
    fn inverse(&self, inputs: ArrayView2<f64>, context: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
        let mut v = inputs.to_owned();
        let mut logdet = Array1::zeros(v.nrows());
        for layer in self.layers.iter().rev() {
            let s = layer.log_scale.forward(context);
            let t = layer.shift.forward(context);
            layer.unmix(&mut v);
            v = (&v - &t) * &s.mapv(|si| (-si).exp());
            logdet -= &s.sum_axis(Axis(1));
        }
        (v, logdet)
    }

    fn check_dims(&self, inputs: &ArrayView2<f64>, context: &ArrayView2<f64>) -> Result<()> {
        if inputs.ncols() != self.input_dim || context.ncols() != self.context_dim {
            return Err(Error::Shape(format!(
                "flow expects ({}, {}) features, got inputs {:?} and context {:?}",
                self.input_dim,
                self.context_dim,
                inputs.shape(),
                context.shape()
            )));
        }
        if inputs.nrows() != context.nrows() {
            return Err(Error::BatchMismatch { input: inputs.nrows(), condition: context.nrows() });
        }
        Ok(())
    }
}

fn standard_normal_log_prob(z: &Array2<f64>) -> Array1<f64> {
    let d = z.ncols() as f64;
    z.map_axis(Axis(1), |row| -0.5 * row.dot(&row) - d * LN_SQRT_2PI)
}

impl ConditionalNet for AffineFlow {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn context_dim(&self) -> usize {
        self.context_dim
    }

    fn log_prob(&self, inputs: ArrayView2<f64>, context: ArrayView2<f64>) -> Result<Array1<f64>> {
        self.check_dims(&inputs, &context)?;
        let (z, logdet) = self.inverse(inputs, context);
        Ok(standard_normal_log_prob(&z) + logdet)
    }

    fn sample_and_log_prob(
        &self,
        num_samples: usize,
        context: ArrayView2<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array3<f64>, Array2<f64>)> {
        if context.ncols() != self.context_dim {
            return Err(Error::Shape(format!(
                "flow expects {} context features, got {}",
                self.context_dim,
                context.ncols()
            )));
        }
        let (b, d) = (context.nrows(), self.input_dim);
        let n = num_samples * b;

        let z: Array2<f64> = Array2::from_shape_fn((n, d), |_| StandardNormal.sample(rng));
        let mut log_prob = standard_normal_log_prob(&z).into_shape_with_order((num_samples, b))?;

        // Layer parameters are computed once per context row and broadcast
        // over the sample axis.
        let mut u = z.into_shape_with_order((num_samples, b, d))?;
        for layer in &self.layers {
            let s = layer.log_scale.forward(context);
            let t = layer.shift.forward(context);
            let w = &u * &s.mapv(f64::exp) + &t;
            let mixed = layer.mix(w.to_shape((n, d))?.view());
            u = mixed.into_shape_with_order((num_samples, b, d))?;
            log_prob -= &s.sum_axis(Axis(1));
        }

        Ok((u, log_prob))
    }
}

impl InvertibleNet for AffineFlow {
    fn transform_to_noise(
        &self,
        inputs: ArrayView2<f64>,
        context: ArrayView2<f64>,
    ) -> Result<Array2<f64>> {
        self.check_dims(&inputs, &context)?;
        Ok(self.inverse(inputs, context).0)
    }
}
