use ndarray::Array2;
use numpy::{IntoPyArray, PyArray1, PyArray2, PyArrayDyn, PyReadonlyArray1, PyReadonlyArray2, PyReadonlyArrayDyn};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sbikit_core::diagnostics::{self, ChecksConfig, SbcChecks};
use sbikit_core::distributions::{IndependentNormal, Prior};
use sbikit_core::estimators::{AffineFlow, ConditionalEstimator};
use sbikit_core::metrics::{self, C2stConfig};
use sbikit_core::posterior::{DirectPosterior, Posterior};
use sbikit_core::sbc::{self, SbcConfig, SbcOutput};
use sbikit_core::shape;
use sbikit_core::simulation::{simulate_for_sbi, LinearGaussian};

fn to_py_err(e: sbikit_core::Error) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn checks_dict<'py>(py: Python<'py>, checks: &SbcChecks) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("ks_pvals", PyArray1::from_vec(py, checks.ks_pvals.clone()))?;
    dict.set_item("c2st_ranks", PyArray1::from_vec(py, checks.c2st_ranks.clone()))?;
    dict.set_item("c2st_dap", PyArray1::from_vec(py, checks.c2st_dap.clone()))?;
    dict.set_item("nltp", checks.nltp)?;
    Ok(dict)
}

/// Reshape to `(sample_dim, batch_dim, *event_shape)`.
#[pyfunction]
#[pyo3(signature = (array, event_shape, leading_is_sample=false))]
fn reshape_to_sample_batch_event<'py>(
    py: Python<'py>,
    array: PyReadonlyArrayDyn<'py, f64>,
    event_shape: Vec<usize>,
    leading_is_sample: bool,
) -> PyResult<Bound<'py, PyArrayDyn<f64>>> {
    let reshaped =
        shape::reshape_to_sample_batch_event(array.as_array().to_owned(), &event_shape, leading_is_sample)
            .map_err(to_py_err)?;
    Ok(reshaped.into_pyarray(py))
}

#[pyfunction]
#[pyo3(signature = (a, b, seed=1))]
fn c2st(a: PyReadonlyArray2<'_, f64>, b: PyReadonlyArray2<'_, f64>, seed: u64) -> PyResult<f64> {
    let config = C2stConfig { seed, ..C2stConfig::default() };
    metrics::c2st(a.as_array(), b.as_array(), &config).map_err(to_py_err)
}

#[pyfunction]
#[pyo3(signature = (ranks, log_probs, prior_samples, dap_samples, num_ranks, num_repetitions=1, seed=0))]
#[allow(clippy::too_many_arguments)]
fn sbc_checks<'py>(
    py: Python<'py>,
    ranks: PyReadonlyArray2<'py, f64>,
    log_probs: PyReadonlyArray1<'py, f64>,
    prior_samples: PyReadonlyArray2<'py, f64>,
    dap_samples: PyReadonlyArray2<'py, f64>,
    num_ranks: usize,
    num_repetitions: usize,
    seed: u64,
) -> PyResult<Bound<'py, PyDict>> {
    let config = ChecksConfig { num_repetitions, seed, ..ChecksConfig::default() };
    let checks = diagnostics::sbc_checks_with(
        ranks.as_array(),
        log_probs.as_array(),
        prior_samples.as_array(),
        dap_samples.as_array(),
        num_ranks,
        &config,
    )
    .map_err(to_py_err)?;
    checks_dict(py, &checks)
}

#[pyclass]
struct SbcResult {
    output: SbcOutput,
    prior_samples: Array2<f64>,
    num_ranks: usize,
}

impl SbcResult {
    fn compute_checks(&self, num_repetitions: usize, seed: u64) -> PyResult<SbcChecks> {
        let config = ChecksConfig { num_repetitions, seed, ..ChecksConfig::default() };
        diagnostics::sbc_checks_with(
            self.output.ranks_f64().view(),
            self.output.log_probs.view(),
            self.prior_samples.view(),
            self.output.dap_samples.view(),
            self.num_ranks,
            &config,
        )
        .map_err(to_py_err)
    }
}

#[pymethods]
impl SbcResult {
    fn ranks<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<usize>> {
        self.output.ranks.clone().into_pyarray(py)
    }

    fn log_probs<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        self.output.log_probs.clone().into_pyarray(py)
    }

    fn dap_samples<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        self.output.dap_samples.clone().into_pyarray(py)
    }

    fn prior_samples<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        self.prior_samples.clone().into_pyarray(py)
    }

    #[pyo3(signature = (num_repetitions=1, seed=0))]
    fn checks<'py>(
        &self,
        py: Python<'py>,
        num_repetitions: usize,
        seed: u64,
    ) -> PyResult<Bound<'py, PyDict>> {
        let checks = py.allow_threads(|| self.compute_checks(num_repetitions, seed))?;
        checks_dict(py, &checks)
    }

    #[pyo3(signature = (num_repetitions=1, seed=0))]
    fn report(&self, num_repetitions: usize, seed: u64) -> PyResult<String> {
        Ok(self.compute_checks(num_repetitions, seed)?.to_table())
    }

    fn __repr__(&self) -> String {
        format!(
            "sbikit SbcResult ({} trials × {} dims, L = {})",
            self.output.num_trials(),
            self.output.ranks.ncols(),
            self.num_ranks
        )
    }
}

/// SBC on the linear Gaussian model `x = theta + shift + noise_std * eps`
/// with a standard normal prior.
///
/// With `num_training_simulations == 0` the analytic posterior is
/// calibrated; otherwise a conditional Gaussian flow is fitted to that many
/// simulations and used as the posterior.
#[pyfunction]
#[pyo3(signature = (
    num_dim=2,
    shift=-1.0,
    noise_std=0.547_722_557_505_166,
    num_sbc_samples=1000,
    num_posterior_samples=100,
    sbc_batch_size=1,
    num_workers=1,
    num_training_simulations=0,
    seed=42,
    show_progress_bars=true,
))]
#[allow(clippy::too_many_arguments)]
fn run_linear_gaussian_sbc(
    py: Python<'_>,
    num_dim: usize,
    shift: f64,
    noise_std: f64,
    num_sbc_samples: usize,
    num_posterior_samples: usize,
    sbc_batch_size: usize,
    num_workers: usize,
    num_training_simulations: usize,
    seed: u64,
    show_progress_bars: bool,
) -> PyResult<SbcResult> {
    let prior = IndependentNormal::standard(num_dim).map_err(to_py_err)?;
    let simulator = LinearGaussian::new(vec![shift; num_dim], noise_std).map_err(to_py_err)?;
    let config = SbcConfig {
        num_sbc_samples,
        num_posterior_samples,
        sbc_batch_size,
        num_workers,
        show_progress_bars,
        seed,
        ..SbcConfig::default()
    };

    let run = || -> sbikit_core::Result<(SbcOutput, Array2<f64>)> {
        let posterior: Box<dyn Posterior> = if num_training_simulations == 0 {
            Box::new(simulator.true_posterior(&prior)?)
        } else {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(2));
            let (theta, x) =
                simulate_for_sbi(&simulator, &prior, num_training_simulations, 1000, &mut rng)?;
            let flow = AffineFlow::fit_gaussian(theta.view(), x.view())?;
            let estimator = ConditionalEstimator::new(flow, vec![num_dim], vec![num_dim])?;
            Box::new(DirectPosterior::new(estimator, prior.clone())?)
        };
        let output = sbc::sbc_in_batches(&prior, &simulator, posterior.as_ref(), &config)?;
        let prior_samples =
            prior.sample(num_sbc_samples, &mut ChaCha8Rng::seed_from_u64(seed.wrapping_add(1)));
        Ok((output, prior_samples))
    };
    let (output, prior_samples) = py.allow_threads(run).map_err(to_py_err)?;

    Ok(SbcResult { output, prior_samples, num_ranks: num_posterior_samples })
}

#[pymodule]
fn sbikit(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<SbcResult>()?;
    m.add_function(wrap_pyfunction!(reshape_to_sample_batch_event, m)?)?;
    m.add_function(wrap_pyfunction!(c2st, m)?)?;
    m.add_function(wrap_pyfunction!(sbc_checks, m)?)?;
    m.add_function(wrap_pyfunction!(run_linear_gaussian_sbc, m)?)?;
    Ok(())
}
