//! Conditional density estimators behind one shape contract.
//!
//! Two layers:
//!
//! - [`ConditionalNet`] is the backend seam. A network only understands flat
//!   rows: inputs `(N, input_dim)` paired row-by-row with contexts
//!   `(N, context_dim)`.
//! - [`DensityEstimator`] is the public capability set. It speaks
//!   `(sample_dim, batch_dim, *event_shape)` inputs and
//!   `(batch_dim, *condition_shape)` conditions.
//!
//! [`ConditionalEstimator`] composes one network with a fixed condition shape
//! and performs all shape handling, so every backend gets identical
//! broadcasting behaviour: conditions are validated against the fixed shape
//! before any computation, flattened into context features, and tiled across
//! the sample dimension for `log_prob`.

pub mod categorical;
pub mod flow;
pub mod mdn;
pub mod mixed;

use ndarray::{Array, Array1, Array2, Array3, ArrayD, ArrayView2, ArrayViewD, Dimension, IxDyn};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal as NormalSampler};

use crate::error::{Error, Result};
use crate::shape::{broadcast_shapes, check_trailing_shape, numel};

pub use categorical::CategoricalNet;
pub use flow::AffineFlow;
pub use mdn::MixtureDensityNetwork;
pub use mixed::MixedNet;

/// Flow-based estimator.
pub type FlowEstimator = ConditionalEstimator<AffineFlow>;
/// Mixture-density estimator.
pub type MixtureEstimator = ConditionalEstimator<MixtureDensityNetwork>;
/// Discrete (categorical) mass estimator.
pub type CategoricalEstimator = ConditionalEstimator<CategoricalNet>;
/// Mixed discrete/continuous estimator.
pub type MixedEstimator = ConditionalEstimator<MixedNet>;

/// Public density-estimator contract.
pub trait DensityEstimator: Send + Sync {
    /// Fixed trailing shape of every condition.
    fn condition_shape(&self) -> &[usize];

    /// Event shape of the modelled variable.
    fn input_event_shape(&self) -> &[usize];

    /// Log-probabilities of `input` `(S, B, *event)` given `condition`
    /// `(B, *condition_shape)`. Returns `(S, B)`.
    fn log_prob(&self, input: ArrayViewD<f64>, condition: ArrayViewD<f64>) -> Result<Array2<f64>>;

    /// Training loss, the negative log-probability. Returns `(S, B)`.
    fn loss(&self, input: ArrayViewD<f64>, condition: ArrayViewD<f64>) -> Result<Array2<f64>> {
        Ok(-self.log_prob(input, condition)?)
    }

    /// Samples of shape `(*sample_shape, B, *event)`.
    fn sample(
        &self,
        sample_shape: &[usize],
        condition: ArrayViewD<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<ArrayD<f64>>;

    /// Samples `(*sample_shape, B, *event)` together with their own
    /// log-probabilities `(*sample_shape, B)`.
    fn sample_and_log_prob(
        &self,
        sample_shape: &[usize],
        condition: ArrayViewD<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)>;
}

/// Backend network operating on flat rows.
pub trait ConditionalNet: Send + Sync {
    fn input_dim(&self) -> usize;

    fn context_dim(&self) -> usize;

    /// `inputs` `(N, input_dim)`, `context` `(N, context_dim)` → `(N,)`.
    fn log_prob(&self, inputs: ArrayView2<f64>, context: ArrayView2<f64>) -> Result<Array1<f64>>;

    /// Draw `num_samples` for each context row: `((num, B, input_dim), (num, B))`.
    fn sample_and_log_prob(
        &self,
        num_samples: usize,
        context: ArrayView2<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array3<f64>, Array2<f64>)>;

    fn sample(
        &self,
        num_samples: usize,
        context: ArrayView2<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<Array3<f64>> {
        Ok(self.sample_and_log_prob(num_samples, context, rng)?.0)
    }
}

/// Networks with a tractable map back to their base distribution.
pub trait InvertibleNet: ConditionalNet {
    /// `inputs` `(N, input_dim)` → noise `(N, input_dim)`.
    fn transform_to_noise(
        &self,
        inputs: ArrayView2<f64>,
        context: ArrayView2<f64>,
    ) -> Result<Array2<f64>>;
}

/// A backend network plus the fixed shapes it is evaluated with.
#[derive(Debug, Clone)]
pub struct ConditionalEstimator<N> {
    net: N,
    input_event_shape: Vec<usize>,
    condition_shape: Vec<usize>,
}

impl<N: ConditionalNet> ConditionalEstimator<N> {
    pub fn new(net: N, input_event_shape: Vec<usize>, condition_shape: Vec<usize>) -> Result<Self> {
        if numel(&input_event_shape) != net.input_dim() {
            return Err(Error::Shape(format!(
                "input event shape {:?} has {} elements, network expects {}",
                input_event_shape,
                numel(&input_event_shape),
                net.input_dim()
            )));
        }
        if numel(&condition_shape) != net.context_dim() {
            return Err(Error::Shape(format!(
                "condition shape {:?} has {} elements, network expects {}",
                condition_shape,
                numel(&condition_shape),
                net.context_dim()
            )));
        }
        Ok(Self { net, input_event_shape, condition_shape })
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    /// Validate `(B, *condition_shape)` and flatten to `(B, context_dim)`.
    fn flat_context(&self, condition: &ArrayViewD<f64>) -> Result<Array2<f64>> {
        check_trailing_shape(condition.shape(), &self.condition_shape)?;
        if condition.ndim() != self.condition_shape.len() + 1 {
            return Err(Error::Shape(format!(
                "condition must have shape (batch_dim, *{:?}), got {:?}",
                self.condition_shape,
                condition.shape()
            )));
        }
        let batch = condition.shape()[0];
        Ok(condition.to_shape((batch, self.net.context_dim()))?.into_owned())
    }

    fn output_shape(&self, leading: &[usize], batch: usize) -> Vec<usize> {
        let mut shape = leading.to_vec();
        shape.push(batch);
        shape.extend_from_slice(&self.input_event_shape);
        shape
    }
}

impl<N: ConditionalNet> DensityEstimator for ConditionalEstimator<N> {
    fn condition_shape(&self) -> &[usize] {
        &self.condition_shape
    }

    fn input_event_shape(&self) -> &[usize] {
        &self.input_event_shape
    }

    fn log_prob(&self, input: ArrayViewD<f64>, condition: ArrayViewD<f64>) -> Result<Array2<f64>> {
        let context = self.flat_context(&condition)?;

        check_trailing_shape(input.shape(), &self.input_event_shape)?;
        if input.ndim() != self.input_event_shape.len() + 2 {
            return Err(Error::Shape(format!(
                "input must have shape (sample_dim, batch_dim, *{:?}), got {:?}",
                self.input_event_shape,
                input.shape()
            )));
        }
        let (sample_dim, batch_dim) = (input.shape()[0], input.shape()[1]);
        if context.nrows() != batch_dim {
            return Err(Error::BatchMismatch { input: batch_dim, condition: context.nrows() });
        }

        let flat = input.to_shape((sample_dim * batch_dim, self.net.input_dim()))?;
        let tiled = tile_rows(context.view(), sample_dim);
        let log_probs = self.net.log_prob(flat.view(), tiled.view())?;
        Ok(log_probs.into_shape_with_order((sample_dim, batch_dim))?)
    }

    fn sample(
        &self,
        sample_shape: &[usize],
        condition: ArrayViewD<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<ArrayD<f64>> {
        let context = self.flat_context(&condition)?;
        let samples = self.net.sample(numel(sample_shape), context.view(), rng)?;
        into_dyn_shape(samples, &self.output_shape(sample_shape, context.nrows()))
    }

    fn sample_and_log_prob(
        &self,
        sample_shape: &[usize],
        condition: ArrayViewD<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let context = self.flat_context(&condition)?;
        let batch = context.nrows();
        let (samples, log_probs) =
            self.net.sample_and_log_prob(numel(sample_shape), context.view(), rng)?;

        let mut lp_shape = sample_shape.to_vec();
        lp_shape.push(batch);
        Ok((
            into_dyn_shape(samples, &self.output_shape(sample_shape, batch))?,
            into_dyn_shape(log_probs, &lp_shape)?,
        ))
    }
}

impl<N: InvertibleNet> ConditionalEstimator<N> {
    /// Map `input` `(*batch1, *event)` to the base distribution given
    /// `condition` `(*batch2, *condition_shape)`.
    ///
    /// `batch1` and `batch2` are broadcast against each other with numpy
    /// rules; the result has shape `(*broadcast(batch1, batch2), *event)`.
    pub fn inverse_transform(
        &self,
        input: ArrayViewD<f64>,
        condition: ArrayViewD<f64>,
    ) -> Result<ArrayD<f64>> {
        check_trailing_shape(condition.shape(), &self.condition_shape)?;
        check_trailing_shape(input.shape(), &self.input_event_shape)?;

        let batch_in = &input.shape()[..input.ndim() - self.input_event_shape.len()];
        let batch_cond = &condition.shape()[..condition.ndim() - self.condition_shape.len()];
        let batch = broadcast_shapes(batch_in, batch_cond)?;

        let in_shape: Vec<usize> = batch.iter().chain(&self.input_event_shape).copied().collect();
        let cond_shape: Vec<usize> = batch.iter().chain(&self.condition_shape).copied().collect();
        let broadcast_err = || Error::Broadcast { lhs: batch_in.to_vec(), rhs: batch_cond.to_vec() };
        let input_b = input.broadcast(IxDyn(&in_shape)).ok_or_else(broadcast_err)?;
        let cond_b = condition.broadcast(IxDyn(&cond_shape)).ok_or_else(broadcast_err)?;

        let n = numel(&batch);
        let flat_in = input_b.to_shape((n, self.net.input_dim()))?;
        let flat_cond = cond_b.to_shape((n, self.net.context_dim()))?;
        let noise = self.net.transform_to_noise(flat_in.view(), flat_cond.view())?;
        into_dyn_shape(noise, &in_shape)
    }
}

/// Repeat the rows of `context` `times` times: row `r` of the result is
/// `context[r % B]`, matching the row-major flattening of `(S, B)`.
pub(crate) fn tile_rows(context: ArrayView2<f64>, times: usize) -> Array2<f64> {
    let b = context.nrows();
    Array2::from_shape_fn((times * b, context.ncols()), |(r, j)| context[[r % b, j]])
}

fn into_dyn_shape<D: Dimension>(a: Array<f64, D>, shape: &[usize]) -> Result<ArrayD<f64>> {
    let a = if a.is_standard_layout() { a } else { a.as_standard_layout().into_owned() };
    Ok(a.into_shape_with_order(IxDyn(shape))?)
}

/// Affine map from context features: `x W^T + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl Linear {
    pub fn new(weight: Array2<f64>, bias: Array1<f64>) -> Result<Self> {
        if weight.nrows() != bias.len() {
            return Err(Error::Shape(format!(
                "weight has {} output rows but bias has {} entries",
                weight.nrows(),
                bias.len()
            )));
        }
        Ok(Self { weight, bias })
    }

    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Array2::zeros((out_features, in_features)),
            bias: Array1::zeros(out_features),
        }
    }

    /// Small random weights, zero bias.
    pub fn random(in_features: usize, out_features: usize, rng: &mut ChaCha8Rng) -> Self {
        let std = 0.1 / (in_features.max(1) as f64).sqrt();
        let init = NormalSampler::new(0.0, std).expect("std is finite and positive");
        Self {
            weight: Array2::from_shape_fn((out_features, in_features), |_| init.sample(rng)),
            bias: Array1::zeros(out_features),
        }
    }

    pub fn weight(&self) -> &Array2<f64> {
        &self.weight
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Affine map of the rows of `x`. The output is always in standard
    /// layout, so callers can reshape it row-major.
    pub fn forward(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let y = x.dot(&self.weight.t()) + &self.bias;
        if y.is_standard_layout() {
            y
        } else {
            y.as_standard_layout().into_owned()
        }
    }
}

pub(crate) fn log_sum_exp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}
