//! Mixed continuous/discrete estimator.
//!
//! The last input column is a category index, the leading columns are
//! continuous. The joint density factorises as
//! `p(x_c, x_d | c) = p(x_d | c) · p(x_c | c, x_d)`: a categorical head for the
//! discrete column and a flow over the continuous columns whose context is the
//! condition with the discrete value appended.

use ndarray::{concatenate, s, Array1, Array2, Array3, ArrayView2, Axis};
use rand_chacha::ChaCha8Rng;

use super::{AffineFlow, CategoricalNet, ConditionalNet};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct MixedNet {
    discrete: CategoricalNet,
    continuous: AffineFlow,
}

impl MixedNet {
    pub fn new(
        num_continuous: usize,
        context_dim: usize,
        num_categories: usize,
        num_flow_layers: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        let discrete = CategoricalNet::new(context_dim, num_categories, rng)?;
        let continuous = AffineFlow::new(num_continuous, context_dim + 1, num_flow_layers, rng)?;
        Ok(Self { discrete, continuous })
    }

    /// Compose existing heads. The flow's context must be one wider than the
    /// categorical head's.
    pub fn from_parts(discrete: CategoricalNet, continuous: AffineFlow) -> Result<Self> {
        if continuous.context_dim() != discrete.context_dim() + 1 {
            return Err(Error::Shape(format!(
                "flow context ({}) must equal categorical context ({}) plus one",
                continuous.context_dim(),
                discrete.context_dim()
            )));
        }
        Ok(Self { discrete, continuous })
    }

    pub fn num_continuous(&self) -> usize {
        self.continuous.input_dim()
    }
}

fn with_discrete(context: ArrayView2<f64>, discrete: ArrayView2<f64>) -> Result<Array2<f64>> {
    Ok(concatenate(Axis(1), &[context.view(), discrete.view()])?)
}

impl ConditionalNet for MixedNet {
    fn input_dim(&self) -> usize {
        self.continuous.input_dim() + 1
    }

    fn context_dim(&self) -> usize {
        self.discrete.context_dim()
    }

    fn log_prob(&self, inputs: ArrayView2<f64>, context: ArrayView2<f64>) -> Result<Array1<f64>> {
        if inputs.ncols() != self.input_dim() {
            return Err(Error::Shape(format!(
                "mixed estimator expects {} input features, got {}",
                self.input_dim(),
                inputs.ncols()
            )));
        }
        let d = self.num_continuous();
        let discrete = inputs.slice(s![.., d..]);
        let lp_discrete = self.discrete.log_prob(discrete, context)?;
        let augmented = with_discrete(context, discrete)?;
        let lp_continuous = self.continuous.log_prob(inputs.slice(s![.., ..d]), augmented.view())?;
        Ok(lp_discrete + lp_continuous)
    }

    fn sample_and_log_prob(
        &self,
        num_samples: usize,
        context: ArrayView2<f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array3<f64>, Array2<f64>)> {
        let b = context.nrows();
        let d = self.num_continuous();
        let (discrete, lp_discrete) = self.discrete.sample_and_log_prob(num_samples, context, rng)?;

        // Every (sample, batch) pair has its own discrete value, so the flow
        // sees one context row per pair and draws a single sample for it.
        let n = num_samples * b;
        let flat_discrete = discrete.to_shape((n, 1))?;
        let tiled = super::tile_rows(context, num_samples);
        let augmented = with_discrete(tiled.view(), flat_discrete.view())?;
        let (continuous, lp_continuous) = self.continuous.sample_and_log_prob(1, augmented.view(), rng)?;

        let continuous = continuous.into_shape_with_order((num_samples, b, d))?;
        let samples = concatenate(Axis(2), &[continuous.view(), discrete.view()])?;
        let log_probs = lp_discrete + lp_continuous.into_shape_with_order((num_samples, b))?;
        Ok((samples, log_probs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimators::Linear;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_log_prob_factorises() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let net = MixedNet::new(2, 3, 3, 2, &mut rng).unwrap();
        let x = array![[0.3, -0.2, 1.0], [1.5, 0.0, 2.0]];
        let c = array![[0.1, 0.2, 0.3], [-1.0, 0.0, 1.0]];
        let lp = net.log_prob(x.view(), c.view()).unwrap();

        let lp_d = net.discrete.log_prob(x.slice(s![.., 2..]), c.view()).unwrap();
        let aug = array![[0.1, 0.2, 0.3, 1.0], [-1.0, 0.0, 1.0, 2.0]];
        let lp_c = net.continuous.log_prob(x.slice(s![.., ..2]), aug.view()).unwrap();
        for i in 0..2 {
            assert_relative_eq!(lp[i], lp_d[i] + lp_c[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_invalid_category_has_zero_density() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let net = MixedNet::new(1, 1, 2, 1, &mut rng).unwrap();
        let lp = net.log_prob(array![[0.0, 0.5]].view(), array![[0.0]].view()).unwrap();
        assert_eq!(lp[0], f64::NEG_INFINITY);
    }

    #[test]
    fn test_samples_have_discrete_last_column() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let net = MixedNet::new(2, 1, 4, 1, &mut rng).unwrap();
        let (s, lp) = net.sample_and_log_prob(50, array![[0.0], [1.0]].view(), &mut rng).unwrap();
        assert_eq!(s.shape(), &[50, 2, 3]);
        assert_eq!(lp.shape(), &[50, 2]);
        for v in s.slice(s![.., .., 2]).iter() {
            assert!(v.fract() == 0.0 && (0.0..4.0).contains(v));
        }
    }

    #[test]
    fn test_from_parts_checks_context_width() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let cat = CategoricalNet::from_linear(Linear::zeros(2, 3)).unwrap();
        let bad = AffineFlow::new(1, 2, 1, &mut rng).unwrap();
        assert!(MixedNet::from_parts(cat.clone(), bad).is_err());
        let good = AffineFlow::new(1, 3, 1, &mut rng).unwrap();
        assert!(MixedNet::from_parts(cat, good).is_ok());
    }
}
