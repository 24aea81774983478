use std::fmt;
use std::sync::Arc;

use ndarray::{Array2, ArrayView1};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal, Uniform as UniformSampler};
use statrs::distribution::{Continuous, ContinuousCDF};

use crate::error::{Error, Result};

/// A univariate density, used as the ranking random variable in SBC.
///
/// Any distribution exposing a log-density can rank posterior draws; the SBC
/// runner only ever calls [`UnivariateDensity::log_prob`].
pub trait UnivariateDensity: Send + Sync + fmt::Debug {
    fn log_prob(&self, x: f64) -> f64;
}

/// A prior over `R^d`, sampleable and log-prob-evaluable.
pub trait Prior: Send + Sync {
    fn dim(&self) -> usize;

    /// Draw `num_samples` parameter vectors, shape `(num_samples, dim)`.
    fn sample(&self, num_samples: usize, rng: &mut ChaCha8Rng) -> Array2<f64>;

    fn log_prob(&self, theta: ArrayView1<f64>) -> f64;

    fn support_contains(&self, theta: ArrayView1<f64>) -> bool {
        self.log_prob(theta).is_finite()
    }
}

/// The default ranking variable: a zero-mean Normal with scale 10.
pub fn default_ranking_rv() -> Arc<dyn UnivariateDensity> {
    Arc::new(Normal::new(0.0, 10.0).expect("Normal(0, 10) is a valid distribution"))
}

// ── Normal ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Normal {
    inner: statrs::distribution::Normal,
}

impl Normal {
    pub fn new(loc: f64, scale: f64) -> Result<Self> {
        let inner = statrs::distribution::Normal::new(loc, scale).map_err(|e| {
            Error::Validation(format!("invalid Normal(loc={}, scale={}): {}", loc, scale, e))
        })?;
        Ok(Self { inner })
    }
}

impl UnivariateDensity for Normal {
    fn log_prob(&self, x: f64) -> f64 {
        self.inner.ln_pdf(x)
    }
}

// ── Uniform ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Uniform {
    inner: statrs::distribution::Uniform,
    low: f64,
    high: f64,
}

impl Uniform {
    pub fn new(low: f64, high: f64) -> Result<Self> {
        let inner = statrs::distribution::Uniform::new(low, high).map_err(|e| {
            Error::Validation(format!("invalid Uniform(low={}, high={}): {}", low, high, e))
        })?;
        Ok(Self { inner, low, high })
    }

    pub fn cdf(&self, x: f64) -> f64 {
        self.inner.cdf(x)
    }

    /// Draw `n` independent values.
    pub fn sample_n(&self, n: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
        let sampler = UniformSampler::new_inclusive(self.low, self.high);
        (0..n).map(|_| sampler.sample(rng)).collect()
    }
}

impl UnivariateDensity for Uniform {
    fn log_prob(&self, x: f64) -> f64 {
        self.inner.ln_pdf(x)
    }
}

// ── IndependentNormal prior (diagonal covariance) ───────────────────

#[derive(Debug, Clone)]
pub struct IndependentNormal {
    loc: Vec<f64>,
    scale: Vec<f64>,
}

impl IndependentNormal {
    pub fn new(loc: Vec<f64>, scale: Vec<f64>) -> Result<Self> {
        if loc.len() != scale.len() || loc.is_empty() {
            return Err(Error::Validation(format!(
                "loc and scale must be non-empty and of equal length, got {} and {}",
                loc.len(),
                scale.len()
            )));
        }
        if let Some(s) = scale.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(Error::Validation(format!("scale must be finite and > 0, got {}", s)));
        }
        Ok(Self { loc, scale })
    }

    /// `N(0, I)` in `dim` dimensions.
    pub fn standard(dim: usize) -> Result<Self> {
        Self::new(vec![0.0; dim], vec![1.0; dim])
    }

    pub fn loc(&self) -> &[f64] {
        &self.loc
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }
}

/// `ln(sqrt(2π))`
pub(crate) const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

impl Prior for IndependentNormal {
    fn dim(&self) -> usize {
        self.loc.len()
    }

    fn sample(&self, num_samples: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
        let d = self.dim();
        Array2::from_shape_fn((num_samples, d), |(_, j)| {
            let z: f64 = StandardNormal.sample(rng);
            self.loc[j] + self.scale[j] * z
        })
    }

    fn log_prob(&self, theta: ArrayView1<f64>) -> f64 {
        if theta.len() != self.dim() {
            return f64::NEG_INFINITY;
        }
        theta
            .iter()
            .zip(self.loc.iter().zip(self.scale.iter()))
            .map(|(&x, (&mu, &sigma))| {
                let z = (x - mu) / sigma;
                -0.5 * z * z - sigma.ln() - LN_SQRT_2PI
            })
            .sum()
    }
}

// ── BoxUniform prior ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BoxUniform {
    low: Vec<f64>,
    high: Vec<f64>,
}

impl BoxUniform {
    pub fn new(low: Vec<f64>, high: Vec<f64>) -> Result<Self> {
        if low.len() != high.len() || low.is_empty() {
            return Err(Error::Validation(format!(
                "low and high must be non-empty and of equal length, got {} and {}",
                low.len(),
                high.len()
            )));
        }
        if low.iter().zip(&high).any(|(l, h)| !(l < h) || !l.is_finite() || !h.is_finite()) {
            return Err(Error::Validation(format!(
                "BoxUniform requires finite low < high, got {:?} and {:?}",
                low, high
            )));
        }
        Ok(Self { low, high })
    }
}

impl Prior for BoxUniform {
    fn dim(&self) -> usize {
        self.low.len()
    }

    fn sample(&self, num_samples: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
        let samplers: Vec<UniformSampler<f64>> = self
            .low
            .iter()
            .zip(&self.high)
            .map(|(&l, &h)| UniformSampler::new(l, h))
            .collect();
        Array2::from_shape_fn((num_samples, self.dim()), |(_, j)| samplers[j].sample(rng))
    }

    fn log_prob(&self, theta: ArrayView1<f64>) -> f64 {
        if theta.len() != self.dim() {
            return f64::NEG_INFINITY;
        }
        let mut lp = 0.0;
        for ((&x, &l), &h) in theta.iter().zip(&self.low).zip(&self.high) {
            if !(l..h).contains(&x) {
                return f64::NEG_INFINITY;
            }
            lp -= (h - l).ln();
        }
        lp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_default_ranking_rv_matches_normal_10() {
        let rv = default_ranking_rv();
        let expected = -10.0_f64.ln() - LN_SQRT_2PI;
        assert_relative_eq!(rv.log_prob(0.0), expected, epsilon = 1e-12);
        assert!(rv.log_prob(5.0) < rv.log_prob(1.0));
    }

    #[test]
    fn test_invalid_ranking_rv() {
        assert!(Normal::new(0.0, 0.0).is_err());
        assert!(Normal::new(0.0, -1.0).is_err());
        assert!(Uniform::new(1.0, 0.0).is_err());
    }

    #[test]
    fn test_independent_normal_log_prob() {
        let prior = IndependentNormal::new(vec![0.0, 1.0], vec![1.0, 2.0]).unwrap();
        let lp = prior.log_prob(array![0.0, 1.0].view());
        assert_relative_eq!(lp, -2.0 * LN_SQRT_2PI - 2.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_independent_normal_sample_moments() {
        let prior = IndependentNormal::new(vec![3.0, -1.0], vec![0.5, 2.0]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let s = prior.sample(20_000, &mut rng);
        assert_eq!(s.shape(), &[20_000, 2]);
        let mean = s.mean_axis(ndarray::Axis(0)).unwrap();
        assert!((mean[0] - 3.0).abs() < 0.02, "mean {}", mean[0]);
        assert!((mean[1] + 1.0).abs() < 0.08, "mean {}", mean[1]);
    }

    #[test]
    fn test_box_uniform_support() {
        let prior = BoxUniform::new(vec![-2.0, -2.0], vec![2.0, 2.0]).unwrap();
        assert!(prior.support_contains(array![0.0, 1.9].view()));
        assert!(!prior.support_contains(array![0.0, 2.1].view()));
        assert_relative_eq!(prior.log_prob(array![0.0, 0.0].view()), -2.0 * 4.0_f64.ln());

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let s = prior.sample(500, &mut rng);
        assert!(s.iter().all(|v| (-2.0..2.0).contains(v)));
    }

    #[test]
    fn test_invalid_priors() {
        assert!(IndependentNormal::new(vec![0.0], vec![0.0]).is_err());
        assert!(IndependentNormal::new(vec![0.0, 1.0], vec![1.0]).is_err());
        assert!(BoxUniform::new(vec![1.0], vec![1.0]).is_err());
    }
}
