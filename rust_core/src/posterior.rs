//! Posterior distributions `p(theta | x)`.
//!
//! The SBC runner only needs [`Posterior::log_prob`] and [`Posterior::sample`];
//! anything implementing them can be calibrated.

use ndarray::{Array1, Array2, ArrayView1, Axis, IxDyn};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::distributions::Prior;
use crate::error::{Error, Result};
use crate::estimators::DensityEstimator;
use crate::shape::numel;

pub trait Posterior: Send + Sync {
    /// Dimensionality of `theta`.
    fn dim(&self) -> usize;

    /// `log p(theta | x)` for a single parameter vector.
    fn log_prob(&self, theta: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<f64>;

    /// Draw `num_samples` parameter vectors given `x`, shape `(num_samples, dim)`.
    fn sample(
        &self,
        num_samples: usize,
        x: ArrayView1<f64>,
        rng: &mut ChaCha8Rng,
        show_progress_bars: bool,
    ) -> Result<Array2<f64>>;
}

/// Posterior read directly off a conditional density estimator of
/// `theta | x`, restricted to the support of the prior.
pub struct DirectPosterior<E, P> {
    estimator: E,
    prior: P,
    /// Rejection rounds before giving up on draws outside the prior support.
    pub max_sampling_rounds: usize,
}

impl<E: DensityEstimator, P: Prior> DirectPosterior<E, P> {
    pub fn new(estimator: E, prior: P) -> Result<Self> {
        if estimator.input_event_shape() != [prior.dim()] {
            return Err(Error::Shape(format!(
                "estimator event shape {:?} does not match prior dimension {}",
                estimator.input_event_shape(),
                prior.dim()
            )));
        }
        Ok(Self { estimator, prior, max_sampling_rounds: 100 })
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    /// `x` as a single-row condition `(1, *condition_shape)`.
    fn condition(&self, x: ArrayView1<f64>) -> Result<ndarray::ArrayD<f64>> {
        let cond_shape = self.estimator.condition_shape();
        if x.len() != numel(cond_shape) {
            return Err(Error::Shape(format!(
                "x has {} entries, condition shape {:?} needs {}",
                x.len(),
                cond_shape,
                numel(cond_shape)
            )));
        }
        let mut shape = vec![1];
        shape.extend_from_slice(cond_shape);
        Ok(x.to_owned().into_shape_with_order(IxDyn(&shape))?)
    }
}

impl<E: DensityEstimator, P: Prior> Posterior for DirectPosterior<E, P> {
    fn dim(&self) -> usize {
        self.prior.dim()
    }

    fn log_prob(&self, theta: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<f64> {
        if !self.prior.support_contains(theta) {
            return Ok(f64::NEG_INFINITY);
        }
        let condition = self.condition(x)?;
        let input = theta.insert_axis(Axis(0)).insert_axis(Axis(0)).into_dyn();
        let lp = self.estimator.log_prob(input, condition.view())?;
        Ok(lp[[0, 0]])
    }

    fn sample(
        &self,
        num_samples: usize,
        x: ArrayView1<f64>,
        rng: &mut ChaCha8Rng,
        show_progress_bars: bool,
    ) -> Result<Array2<f64>> {
        let condition = self.condition(x)?;
        let d = self.dim();
        let mut accepted: Vec<Array1<f64>> = Vec::with_capacity(num_samples);

        for round in 0..self.max_sampling_rounds {
            if accepted.len() >= num_samples {
                break;
            }
            let draws = self.estimator.sample(&[num_samples], condition.view(), rng)?;
            let draws = draws.into_shape_with_order((num_samples, d))?;
            let before = accepted.len();
            accepted.extend(
                draws
                    .outer_iter()
                    .filter(|row| self.prior.support_contains(*row))
                    .take(num_samples - before)
                    .map(|row| row.to_owned()),
            );
            if show_progress_bars {
                info!(
                    round,
                    accepted = accepted.len(),
                    requested = num_samples,
                    acceptance = (accepted.len() - before) as f64 / num_samples.max(1) as f64,
                    "drawing posterior samples"
                );
            }
        }

        if accepted.len() < num_samples {
            return Err(Error::Computation(format!(
                "only {} of {} posterior samples fell inside the prior support after {} rounds",
                accepted.len(),
                num_samples,
                self.max_sampling_rounds
            )));
        }

        let mut out = Array2::zeros((num_samples, d));
        for (mut row, draw) in out.outer_iter_mut().zip(&accepted) {
            row.assign(draw);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{BoxUniform, IndependentNormal};
    use crate::estimators::{AffineFlow, ConditionalEstimator, FlowEstimator};
    use ndarray::array;
    use rand::SeedableRng;

    fn flow_estimator(rng: &mut ChaCha8Rng) -> FlowEstimator {
        let net = AffineFlow::new(2, 2, 2, rng).unwrap();
        ConditionalEstimator::new(net, vec![2], vec![2]).unwrap()
    }

    #[test]
    fn test_log_prob_outside_support_is_neg_inf() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let prior = BoxUniform::new(vec![-1.0, -1.0], vec![1.0, 1.0]).unwrap();
        let post = DirectPosterior::new(flow_estimator(&mut rng), prior).unwrap();
        let x = array![0.0, 0.0];
        assert_eq!(post.log_prob(array![2.0, 0.0].view(), x.view()).unwrap(), f64::NEG_INFINITY);
        assert!(post.log_prob(array![0.2, 0.0].view(), x.view()).unwrap().is_finite());
    }

    #[test]
    fn test_samples_respect_support() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let prior = BoxUniform::new(vec![-1.0, 0.0], vec![1.0, 2.0]).unwrap();
        let post = DirectPosterior::new(flow_estimator(&mut rng), prior).unwrap();
        let s = post.sample(200, array![0.3, -0.1].view(), &mut rng, false).unwrap();
        assert_eq!(s.shape(), &[200, 2]);
        assert!(s.column(0).iter().all(|v| (-1.0..1.0).contains(v)));
        assert!(s.column(1).iter().all(|v| (0.0..2.0).contains(v)));
    }

    #[test]
    fn test_unreachable_support_errors() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        // Support far away from where the flow puts mass.
        let prior = BoxUniform::new(vec![50.0, 50.0], vec![51.0, 51.0]).unwrap();
        let mut post = DirectPosterior::new(flow_estimator(&mut rng), prior).unwrap();
        post.max_sampling_rounds = 3;
        let res = post.sample(10, array![0.0, 0.0].view(), &mut rng, false);
        assert!(matches!(res, Err(Error::Computation(_))));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let prior = IndependentNormal::standard(3).unwrap();
        assert!(DirectPosterior::new(flow_estimator(&mut rng), prior).is_err());

        let post =
            DirectPosterior::new(flow_estimator(&mut rng), IndependentNormal::standard(2).unwrap())
                .unwrap();
        let bad_x = array![0.0, 0.0, 0.0];
        assert!(matches!(
            post.log_prob(array![0.0, 0.0].view(), bad_x.view()),
            Err(Error::Shape(_))
        ));
    }
}
