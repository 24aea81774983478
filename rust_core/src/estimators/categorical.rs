//! Conditional categorical mass function over `{0, …, K-1}`.
//!
//! Inputs are a single column of category indices stored as floats. Values
//! that are not a whole number in range have probability zero.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use rand::distributions::WeightedIndex;
use rand_chacha::ChaCha8Rng;
use rand_distr::Distribution;

use super::{log_sum_exp, ConditionalNet, Linear};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct CategoricalNet {
    context_dim: usize,
    logits: Linear,
}

impl CategoricalNet {
    pub fn new(context_dim: usize, num_categories: usize, rng: &mut ChaCha8Rng) -> Result<Self> {
        if num_categories < 2 {
            return Err(Error::Validation(format!(
                "categorical needs at least 2 categories, got {}",
                num_categories
            )));
        }
        Ok(Self { context_dim, logits: Linear::random(context_dim, num_categories, rng) })
    }

    /// From explicit logit weights `(K, context_dim)` and bias `(K,)`.
    pub fn from_linear(logits: Linear) -> Result<Self> {
        if logits.out_features() < 2 {
            return Err(Error::Validation("categorical needs at least 2 categories".to_string()));
        }
        Ok(Self { context_dim: logits.in_features(), logits })
    }

    pub fn num_categories(&self) -> usize {
        self.logits.out_features()
    }

    /// Normalised log-probabilities per context row, `(B, K)`.
    pub fn log_probs(&self, context: ArrayView2<f64>) -> Result<Array2<f64>> {
        if context.ncols() != self.context_dim {
            return Err(Error::Shape(format!(
                "categorical expects {} context features, got {}",
                self.context_dim,
                context.ncols()
            )));
        }
        let mut lp = self.logits.forward(context);
        for mut row in lp.rows_mut() {
            let norm = log_sum_exp(row.iter().copied());
            row.mapv_inplace(|v| v - norm);
        }
        Ok(lp)
    }

    /// Log-mass of each value in `values` under the matching row of `log_probs`.
    pub(crate) fn log_mass(values: ArrayView1<f64>, log_probs: &Array2<f64>) -> Array1<f64> {
        let k = log_probs.ncols();
        Array1::from_iter(values.iter().enumerate().map(|(r, &v)| {
            if v.fract() == 0.0 && v >= 0.0 && v < k as f64 {
                log_probs[[r, v as usize]]
            } else {
                f64::NEG_INFINITY
            }
        }))
    }

    /// One category index per context row and sample: `(num_samples, B)`.
    pub(crate) fn draw(
        log_probs: &Array2<f64>,
        num_samples: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<Array2<usize>> {
        let pickers = log_probs
            .outer_iter()
            .map(|lp| {
                WeightedIndex::new(lp.iter().map(|v| v.exp()))
                    .map_err(|e| Error::Computation(format!("invalid category weights: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut out = Array2::zeros((num_samples, pickers.len()));
        for mut row in out.rows_mut() {
            for (slot, picker) in row.iter_mut().zip(&pickers) {
                *slot = picker.sample(rng);
            }
        }
        Ok(out)
    }
}

impl ConditionalNet for CategoricalNet {
    fn input_dim(&self) -> usize {
        1
    }

    fn context_dim(&self) -> usize {
        self.context_dim
    }

    fn log_prob(&self, inputs: ArrayView2<f64>, context: ArrayView2<f64>) -> Result<Array1<f64>> {
        if inputs.ncols() != 1 {
            return Err(Error::Shape(format!(
                "categorical expects a single input column, got {}",
                inputs.ncols()
            )));
        }
        if inputs.nrows() != context.nrows() {
            return Err(Error::BatchMismatch { input: inputs.nrows(), condition: context.nrows() });
        }
        let lp = self.log_probs(context)?;
        Ok(Self::log_mass(inputs.column(0), &lp))
    }

    fn sample_and_log_prob(
        &self,
        num_samples: usize,
        context: ArrayView2<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array3<f64>, Array2<f64>)> {
        let lp = self.log_probs(context)?;
        let draws = Self::draw(&lp, num_samples, rng)?;
        let log_probs = Array2::from_shape_fn(draws.dim(), |(i, j)| lp[[j, draws[[i, j]]]]);
        let samples = draws.mapv(|k| k as f64).insert_axis(ndarray::Axis(2));
        Ok((samples, log_probs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn fixed() -> CategoricalNet {
        // logits [0, ln 3] regardless of context: p = [0.25, 0.75]
        let linear = Linear::new(Array2::zeros((2, 1)), array![0.0, 3.0_f64.ln()]).unwrap();
        CategoricalNet::from_linear(linear).unwrap()
    }

    #[test]
    fn test_log_prob_of_categories() {
        let net = fixed();
        let lp = net
            .log_prob(array![[0.0], [1.0]].view(), array![[5.0], [-5.0]].view())
            .unwrap();
        assert_relative_eq!(lp[0], 0.25_f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(lp[1], 0.75_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_out_of_support_is_neg_inf() {
        let net = fixed();
        let lp = net
            .log_prob(array![[0.5], [2.0], [-1.0]].view(), array![[0.0], [0.0], [0.0]].view())
            .unwrap();
        assert!(lp.iter().all(|v| *v == f64::NEG_INFINITY));
    }

    #[test]
    fn test_sample_frequencies() {
        let net = fixed();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let (s, lp) = net.sample_and_log_prob(10_000, array![[0.0]].view(), &mut rng).unwrap();
        assert_eq!(s.shape(), &[10_000, 1, 1]);
        let ones = s.iter().filter(|v| **v == 1.0).count() as f64 / 10_000.0;
        assert!((ones - 0.75).abs() < 0.02, "frequency {}", ones);
        assert!(lp.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_rejects_single_category() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(CategoricalNet::new(2, 1, &mut rng).is_err());
    }
}
