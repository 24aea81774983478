//! Simulators and helpers for generating `(theta, x)` pairs.

use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::warn;

use crate::distributions::{IndependentNormal, Prior, LN_SQRT_2PI};
use crate::error::{Error, Result};
use crate::posterior::Posterior;

/// A stochastic forward model `theta (n, d) -> x (n, x_dim)`.
///
/// Outputs may contain NaN or infinite entries; see [`handle_invalid_x`].
pub trait Simulator: Send + Sync {
    fn simulate(&self, theta: ArrayView2<f64>, rng: &mut ChaCha8Rng) -> Result<Array2<f64>>;
}

impl<F> Simulator for F
where
    F: Fn(ArrayView2<f64>, &mut ChaCha8Rng) -> Result<Array2<f64>> + Send + Sync,
{
    fn simulate(&self, theta: ArrayView2<f64>, rng: &mut ChaCha8Rng) -> Result<Array2<f64>> {
        self(theta, rng)
    }
}

/// Draw `num_simulations` parameters from the prior and simulate them in
/// chunks of `simulation_batch_size`. Returns `(theta, x)` with matching rows.
pub fn simulate_for_sbi<S, P>(
    simulator: &S,
    prior: &P,
    num_simulations: usize,
    simulation_batch_size: usize,
    rng: &mut ChaCha8Rng,
) -> Result<(Array2<f64>, Array2<f64>)>
where
    S: Simulator + ?Sized,
    P: Prior + ?Sized,
{
    if num_simulations == 0 || simulation_batch_size == 0 {
        return Err(Error::Validation(format!(
            "num_simulations and simulation_batch_size must be positive, got {} and {}",
            num_simulations, simulation_batch_size
        )));
    }
    let theta = prior.sample(num_simulations, rng);

    let mut chunks = Vec::with_capacity(num_simulations.div_ceil(simulation_batch_size));
    for start in (0..num_simulations).step_by(simulation_batch_size) {
        let end = (start + simulation_batch_size).min(num_simulations);
        let x = simulator.simulate(theta.slice(s![start..end, ..]), rng)?;
        if x.nrows() != end - start {
            return Err(Error::Simulation(format!(
                "simulator returned {} rows for a batch of {} parameters",
                x.nrows(),
                end - start
            )));
        }
        chunks.push(x);
    }
    let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
    let x = concatenate(Axis(0), &views)
        .map_err(|e| Error::Simulation(format!("simulator output widths differ: {}", e)))?;
    Ok((theta, x))
}

/// Row-wise validity of simulation outputs.
#[derive(Debug, Clone)]
pub struct InvalidData {
    /// `true` for rows that are kept.
    pub is_valid: Array1<bool>,
    /// Rows with at least one NaN.
    pub num_nans: usize,
    /// Rows with at least one infinite value.
    pub num_infs: usize,
}

impl InvalidData {
    pub fn num_valid(&self) -> usize {
        self.is_valid.iter().filter(|v| **v).count()
    }
}

/// Flag rows of `x` that contain NaN or infinite entries.
///
/// With `exclude_invalid_x` unset every row is marked valid, but the counts
/// are still reported.
pub fn handle_invalid_x(x: ArrayView2<f64>, exclude_invalid_x: bool) -> InvalidData {
    let has_nan = x.map_axis(Axis(1), |row| row.iter().any(|v| v.is_nan()));
    let has_inf = x.map_axis(Axis(1), |row| row.iter().any(|v| v.is_infinite()));
    let num_nans = has_nan.iter().filter(|v| **v).count();
    let num_infs = has_inf.iter().filter(|v| **v).count();

    let is_valid = if exclude_invalid_x {
        Array1::from_iter(has_nan.iter().zip(&has_inf).map(|(n, i)| !n && !i))
    } else {
        Array1::from_elem(x.nrows(), true)
    };

    if num_nans + num_infs > 0 {
        warn!(
            num_nans,
            num_infs,
            excluded = exclude_invalid_x,
            "found simulations with NaN or infinite outputs"
        );
    }
    InvalidData { is_valid, num_nans, num_infs }
}

/// Keep the rows of `theta` and `x` marked valid.
pub fn select_valid(
    theta: ArrayView2<f64>,
    x: ArrayView2<f64>,
    validity: &InvalidData,
) -> Result<(Array2<f64>, Array2<f64>)> {
    if theta.nrows() != x.nrows() || x.nrows() != validity.is_valid.len() {
        return Err(Error::Shape(format!(
            "theta ({} rows), x ({} rows) and validity ({}) must agree",
            theta.nrows(),
            x.nrows(),
            validity.is_valid.len()
        )));
    }
    let keep: Vec<usize> = validity
        .is_valid
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.then_some(i))
        .collect();
    Ok((theta.select(Axis(0), &keep), x.select(Axis(0), &keep)))
}

// ── Linear Gaussian model ───────────────────────────────────────────

/// `x = theta + shift + noise_std * eps`, `eps ~ N(0, I)`.
#[derive(Debug, Clone)]
pub struct LinearGaussian {
    shift: Array1<f64>,
    noise_std: f64,
}

impl LinearGaussian {
    pub fn new(shift: Vec<f64>, noise_std: f64) -> Result<Self> {
        if shift.is_empty() || !(noise_std > 0.0) || !noise_std.is_finite() {
            return Err(Error::Validation(format!(
                "linear Gaussian needs a non-empty shift and noise_std > 0, got {} dims and {}",
                shift.len(),
                noise_std
            )));
        }
        Ok(Self { shift: Array1::from(shift), noise_std })
    }

    pub fn dim(&self) -> usize {
        self.shift.len()
    }

    /// Analytic posterior under an independent normal prior.
    pub fn true_posterior(&self, prior: &IndependentNormal) -> Result<LinearGaussianPosterior> {
        if prior.dim() != self.dim() {
            return Err(Error::Shape(format!(
                "prior has {} dims, simulator has {}",
                prior.dim(),
                self.dim()
            )));
        }
        Ok(LinearGaussianPosterior {
            prior_loc: Array1::from(prior.loc().to_vec()),
            prior_scale: Array1::from(prior.scale().to_vec()),
            shift: self.shift.clone(),
            noise_var: self.noise_std * self.noise_std,
        })
    }
}

impl Simulator for LinearGaussian {
    fn simulate(&self, theta: ArrayView2<f64>, rng: &mut ChaCha8Rng) -> Result<Array2<f64>> {
        if theta.ncols() != self.dim() {
            return Err(Error::Simulation(format!(
                "linear Gaussian simulator expects {} parameters, got {}",
                self.dim(),
                theta.ncols()
            )));
        }
        Ok(Array2::from_shape_fn(theta.dim(), |(i, j)| {
            let eps: f64 = StandardNormal.sample(rng);
            theta[[i, j]] + self.shift[j] + self.noise_std * eps
        }))
    }
}

/// Closed-form Gaussian posterior of [`LinearGaussian`].
#[derive(Debug, Clone)]
pub struct LinearGaussianPosterior {
    prior_loc: Array1<f64>,
    prior_scale: Array1<f64>,
    shift: Array1<f64>,
    noise_var: f64,
}

impl LinearGaussianPosterior {
    /// Per-dimension posterior mean and standard deviation given `x`.
    pub fn mean_std(&self, x: ArrayView1<f64>) -> Result<(Array1<f64>, Array1<f64>)> {
        if x.len() != self.prior_loc.len() {
            return Err(Error::Shape(format!(
                "x has {} entries, expected {}",
                x.len(),
                self.prior_loc.len()
            )));
        }
        let prior_prec = self.prior_scale.mapv(|s| 1.0 / (s * s));
        let prec = &prior_prec + 1.0 / self.noise_var;
        let mean = (&prior_prec * &self.prior_loc + (&x - &self.shift) / self.noise_var) / &prec;
        let std = prec.mapv(|p| p.sqrt().recip());
        Ok((mean, std))
    }
}

impl Posterior for LinearGaussianPosterior {
    fn dim(&self) -> usize {
        self.prior_loc.len()
    }

    fn log_prob(&self, theta: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<f64> {
        let (mean, std) = self.mean_std(x)?;
        if theta.len() != mean.len() {
            return Err(Error::Shape(format!(
                "theta has {} entries, expected {}",
                theta.len(),
                mean.len()
            )));
        }
        Ok(theta
            .iter()
            .zip(mean.iter().zip(&std))
            .map(|(&t, (&m, &s))| {
                let z = (t - m) / s;
                -0.5 * z * z - s.ln() - LN_SQRT_2PI
            })
            .sum())
    }

    fn sample(
        &self,
        num_samples: usize,
        x: ArrayView1<f64>,
        rng: &mut ChaCha8Rng,
        _show_progress_bars: bool,
    ) -> Result<Array2<f64>> {
        let (mean, std) = self.mean_std(x)?;
        Ok(Array2::from_shape_fn((num_samples, mean.len()), |(_, j)| {
            let z: f64 = StandardNormal.sample(rng);
            mean[j] + std[j] * z
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_handle_invalid_x() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for cols in [1, 10] {
            let mut x = Array2::from_shape_fn((10, cols), |_| rng.gen::<f64>());
            x.mapv_inplace(|v| {
                if v < 0.1 {
                    f64::NAN
                } else if v > 0.9 {
                    f64::INFINITY
                } else {
                    v
                }
            });
            x.row_mut(9).fill(1.0);

            let checked = handle_invalid_x(x.view(), true);
            assert!(checked.is_valid[9]);
            for (row, ok) in x.outer_iter().zip(&checked.is_valid) {
                if *ok {
                    assert!(row.iter().all(|v| v.is_finite()));
                }
            }

            let kept = handle_invalid_x(x.view(), false);
            assert!(kept.is_valid.iter().all(|v| *v));
            assert_eq!(kept.num_nans, checked.num_nans);
        }
    }

    #[test]
    fn test_select_valid() {
        let theta = array![[1.0], [2.0], [3.0]];
        let x = array![[0.0], [f64::NAN], [1.0]];
        let validity = handle_invalid_x(x.view(), true);
        assert_eq!((validity.num_nans, validity.num_infs, validity.num_valid()), (1, 0, 2));
        let (t, xv) = select_valid(theta.view(), x.view(), &validity).unwrap();
        assert_eq!(t, array![[1.0], [3.0]]);
        assert_eq!(xv, array![[0.0], [1.0]]);
    }

    #[test]
    fn test_simulation_batch_size_does_not_change_output() {
        let prior = IndependentNormal::standard(2).unwrap();
        let sim = LinearGaussian::new(vec![-1.0, -1.0], 0.5).unwrap();
        let run = |batch| {
            let mut rng = ChaCha8Rng::seed_from_u64(5);
            simulate_for_sbi(&sim, &prior, 37, batch, &mut rng).unwrap()
        };
        let (t1, x1) = run(1000);
        let (t2, x2) = run(4);
        assert_eq!(t1, t2);
        assert_eq!(x1, x2);
        assert_eq!(x1.shape(), &[37, 2]);
    }

    #[test]
    fn test_closure_simulator_and_row_check() {
        let prior = IndependentNormal::standard(1).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let doubler = |theta: ArrayView2<f64>, _: &mut ChaCha8Rng| -> Result<Array2<f64>> {
            Ok(theta.mapv(|v| 2.0 * v))
        };
        let (theta, x) = simulate_for_sbi(&doubler, &prior, 5, 2, &mut rng).unwrap();
        assert_eq!(x, theta.mapv(|v| 2.0 * v));

        let broken = |_: ArrayView2<f64>, _: &mut ChaCha8Rng| -> Result<Array2<f64>> {
            Ok(Array2::zeros((1, 1)))
        };
        let res = simulate_for_sbi(&broken, &prior, 5, 5, &mut rng);
        assert!(matches!(res, Err(Error::Simulation(_))));
        assert!(matches!(
            simulate_for_sbi(&doubler, &prior, 0, 5, &mut rng),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_true_posterior_conjugate_update() {
        let prior = IndependentNormal::new(vec![0.0], vec![1.0]).unwrap();
        let sim = LinearGaussian::new(vec![-1.0], 1.0).unwrap();
        let post = sim.true_posterior(&prior).unwrap();
        // precision 2, mean (x - shift) / 2
        let (mean, std) = post.mean_std(array![1.0].view()).unwrap();
        assert_relative_eq!(mean[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(std[0], 0.5_f64.sqrt(), epsilon = 1e-12);

        let lp = post.log_prob(array![1.0].view(), array![1.0].view()).unwrap();
        assert_relative_eq!(lp, -(0.5_f64.sqrt()).ln() - LN_SQRT_2PI, epsilon = 1e-12);

        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let s = post.sample(20_000, array![1.0].view(), &mut rng, false).unwrap();
        assert!((s.mean().unwrap() - 1.0).abs() < 0.02);
    }
}
