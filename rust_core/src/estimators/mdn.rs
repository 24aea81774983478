//! Mixture density network with diagonal Gaussian components.
//!
//! Mixture weights, means and log standard deviations are affine in the
//! context. For `K` components over `d` input dimensions:
//!
//! `log p(x | c) = logsumexp_k [ log w_k(c) + Σ_j log N(x_j; μ_kj(c), σ_kj(c)) ]`

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::distributions::WeightedIndex;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal as NormalSampler, StandardNormal};

use super::{log_sum_exp, ConditionalNet, Linear};
use crate::distributions::LN_SQRT_2PI;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct MixtureDensityNetwork {
    input_dim: usize,
    context_dim: usize,
    num_components: usize,
    logits: Linear,
    means: Linear,
    log_stds: Linear,
}

/// Component parameters for a batch of context rows.
struct Components {
    /// `(B, K)`, normalised.
    log_weights: Array2<f64>,
    /// `(B, K, d)`
    means: Array3<f64>,
    /// `(B, K, d)`
    log_stds: Array3<f64>,
}

impl MixtureDensityNetwork {
    /// Random initialisation. Component means start spread out by a unit
    /// normal bias so components are distinguishable from the first step.
    pub fn new(
        input_dim: usize,
        context_dim: usize,
        num_components: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        if input_dim == 0 || num_components == 0 {
            return Err(Error::Validation(format!(
                "mixture needs input_dim >= 1 and num_components >= 1, got {} and {}",
                input_dim, num_components
            )));
        }
        let kd = num_components * input_dim;
        let logits = Linear::random(context_dim, num_components, rng);
        let mean_weights = Linear::random(context_dim, kd, rng);
        let spread = NormalSampler::new(0.0, 1.0).expect("unit normal is valid");
        let mean_bias = Array1::from_shape_fn(kd, |_| spread.sample(rng));
        let means = Linear::new(mean_weights.weight().clone(), mean_bias)?;
        let log_stds = Linear::random(context_dim, kd, rng);
        Ok(Self { input_dim, context_dim, num_components, logits, means, log_stds })
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    fn components(&self, context: ArrayView2<f64>) -> Result<Components> {
        let (b, k, d) = (context.nrows(), self.num_components, self.input_dim);
        let mut log_weights = self.logits.forward(context);
        for mut row in log_weights.rows_mut() {
            let norm = log_sum_exp(row.iter().copied());
            row.mapv_inplace(|v| v - norm);
        }
        Ok(Components {
            log_weights,
            means: self.means.forward(context).into_shape_with_order((b, k, d))?,
            log_stds: self.log_stds.forward(context).into_shape_with_order((b, k, d))?,
        })
    }

    fn check_context(&self, context: &ArrayView2<f64>) -> Result<()> {
        if context.ncols() != self.context_dim {
            return Err(Error::Shape(format!(
                "mixture expects {} context features, got {}",
                self.context_dim,
                context.ncols()
            )));
        }
        Ok(())
    }
}

impl Components {
    /// Mixture log-density of one input row under context row `b`.
    fn log_prob_row(&self, x: ArrayView1<f64>, b: usize) -> f64 {
        let means = self.means.index_axis(Axis(0), b);
        let log_stds = self.log_stds.index_axis(Axis(0), b);
        let per_component = self
            .log_weights
            .row(b)
            .iter()
            .zip(means.outer_iter().zip(log_stds.outer_iter()))
            .map(|(&lw, (mu, ls))| {
                lw + x
                    .iter()
                    .zip(mu.iter().zip(ls.iter()))
                    .map(|(&xi, (&m, &l))| {
                        let z = (xi - m) * (-l).exp();
                        -0.5 * z * z - l - LN_SQRT_2PI
                    })
                    .sum::<f64>()
            })
            .collect::<Vec<_>>();
        log_sum_exp(per_component.iter().copied())
    }
}

impl ConditionalNet for MixtureDensityNetwork {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn context_dim(&self) -> usize {
        self.context_dim
    }

    fn log_prob(&self, inputs: ArrayView2<f64>, context: ArrayView2<f64>) -> Result<Array1<f64>> {
        self.check_context(&context)?;
        if inputs.ncols() != self.input_dim {
            return Err(Error::Shape(format!(
                "mixture expects {} input features, got {}",
                self.input_dim,
                inputs.ncols()
            )));
        }
        if inputs.nrows() != context.nrows() {
            return Err(Error::BatchMismatch { input: inputs.nrows(), condition: context.nrows() });
        }
        let comps = self.components(context)?;
        Ok(Array1::from_iter(
            inputs.outer_iter().enumerate().map(|(r, x)| comps.log_prob_row(x, r)),
        ))
    }

    fn sample_and_log_prob(
        &self,
        num_samples: usize,
        context: ArrayView2<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array3<f64>, Array2<f64>)> {
        self.check_context(&context)?;
        let (b, d) = (context.nrows(), self.input_dim);
        let comps = self.components(context)?;
        let pickers = comps
            .log_weights
            .outer_iter()
            .map(|lw| {
                WeightedIndex::new(lw.iter().map(|v| v.exp()))
                    .map_err(|e| Error::Computation(format!("invalid mixture weights: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut samples = Array3::zeros((num_samples, b, d));
        let mut log_probs = Array2::zeros((num_samples, b));
        for i in 0..num_samples {
            for (j, picker) in pickers.iter().enumerate() {
                let k = picker.sample(rng);
                let mut row = samples.slice_mut(ndarray::s![i, j, ..]);
                for e in 0..d {
                    let z: f64 = StandardNormal.sample(rng);
                    row[e] = comps.means[[j, k, e]] + comps.log_stds[[j, k, e]].exp() * z;
                }
                log_probs[[i, j]] = comps.log_prob_row(row.view(), j);
            }
        }
        Ok((samples, log_probs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn single_component() -> MixtureDensityNetwork {
        MixtureDensityNetwork {
            input_dim: 1,
            context_dim: 1,
            num_components: 1,
            logits: Linear::zeros(1, 1),
            means: Linear::new(array![[1.0]], array![0.0]).unwrap(),
            log_stds: Linear::new(array![[0.0]], array![2.0_f64.ln()]).unwrap(),
        }
    }

    #[test]
    fn test_single_component_is_gaussian() {
        let mdn = single_component();
        // mean = context, std = 2
        let lp = mdn.log_prob(array![[3.0]].view(), array![[1.0]].view()).unwrap();
        let expected = -0.5 * 1.0 - 2.0_f64.ln() - LN_SQRT_2PI;
        assert_relative_eq!(lp[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_weights_normalised() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mdn = MixtureDensityNetwork::new(2, 3, 4, &mut rng).unwrap();
        let ctx = array![[0.1, 0.2, 0.3], [1.0, -1.0, 0.0]];
        let comps = mdn.components(ctx.view()).unwrap();
        for row in comps.log_weights.outer_iter() {
            assert_relative_eq!(row.mapv(f64::exp).sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_sample_moments_single_component() {
        let mdn = single_component();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let (s, _) = mdn.sample_and_log_prob(20_000, array![[-2.0]].view(), &mut rng).unwrap();
        let mean = s.mean().unwrap();
        let var = s.mapv(|v| (v - mean).powi(2)).mean().unwrap();
        assert!((mean + 2.0).abs() < 0.05, "mean {}", mean);
        assert!((var - 4.0).abs() < 0.15, "var {}", var);
    }

    #[test]
    fn test_scalar_context_with_batch() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mdn = MixtureDensityNetwork::new(2, 1, 3, &mut rng).unwrap();
        let ctx = Array2::from_shape_fn((10, 1), |(i, _)| i as f64 * 0.1);
        let inputs = Array2::from_shape_fn((10, 2), |(i, j)| (i + j) as f64 * 0.05);

        let lp = mdn.log_prob(inputs.view(), ctx.view()).unwrap();
        assert_eq!(lp.len(), 10);
        assert!(lp.iter().all(|v| v.is_finite()));

        let (s, lp) = mdn.sample_and_log_prob(4, ctx.view(), &mut rng).unwrap();
        assert_eq!(s.shape(), &[4, 10, 2]);
        assert_eq!(lp.shape(), &[4, 10]);
    }

    #[test]
    fn test_rejects_empty_mixture() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        assert!(MixtureDensityNetwork::new(1, 1, 0, &mut rng).is_err());
    }
}
