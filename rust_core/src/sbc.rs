use std::ops::Range;
use std::sync::Arc;

use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::distributions::{default_ranking_rv, Prior, UnivariateDensity};
use crate::error::{Error, Result};
use crate::posterior::Posterior;
use crate::progress::{ProgressGuard, SbcProgress};
use crate::simulation::{simulate_for_sbi, Simulator};

/// Configuration for an SBC run.
#[derive(Debug, Clone)]
pub struct SbcConfig {
    pub num_sbc_samples: usize,
    /// Posterior draws per trial (`L`); ranks lie in `[0, L]`.
    pub num_posterior_samples: usize,
    pub sbc_batch_size: usize,
    /// 1 runs sequentially, more runs batches on a dedicated thread pool.
    pub num_workers: usize,
    pub ranking_rv: Arc<dyn UnivariateDensity>,
    pub show_progress_bars: bool,
    pub simulation_batch_size: usize,
    pub seed: u64,
}

impl Default for SbcConfig {
    fn default() -> Self {
        Self {
            num_sbc_samples: 1000,
            num_posterior_samples: 100,
            sbc_batch_size: 1,
            num_workers: 1,
            ranking_rv: default_ranking_rv(),
            show_progress_bars: true,
            simulation_batch_size: 1000,
            seed: 42,
        }
    }
}

/// Where an SBC run currently is. Transitions are logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbcStage {
    NotStarted,
    Simulating,
    Batching,
    Executing { parallel: bool },
    Aggregating,
    Done,
}

fn enter(stage: SbcStage) {
    debug!(?stage, "sbc stage");
}

/// Aggregated output of an SBC run, in trial order.
#[derive(Debug, Clone, PartialEq)]
pub struct SbcOutput {
    /// `(num_trials, d)`, each entry in `[0, L]`.
    pub ranks: Array2<usize>,
    /// Posterior log-probability of each true parameter, `(num_trials,)`.
    pub log_probs: Array1<f64>,
    /// First posterior draw of each trial, `(num_trials, d)`.
    pub dap_samples: Array2<f64>,
}

impl SbcOutput {
    pub fn num_trials(&self) -> usize {
        self.ranks.nrows()
    }

    pub fn ranks_f64(&self) -> Array2<f64> {
        self.ranks.mapv(|r| r as f64)
    }

    fn concat(parts: &[SbcOutput]) -> Result<Self> {
        let ranks: Vec<_> = parts.iter().map(|p| p.ranks.view()).collect();
        let log_probs: Vec<_> = parts.iter().map(|p| p.log_probs.view()).collect();
        let daps: Vec<_> = parts.iter().map(|p| p.dap_samples.view()).collect();
        Ok(Self {
            ranks: concatenate(Axis(0), &ranks)?,
            log_probs: concatenate(Axis(0), &log_probs)?,
            dap_samples: concatenate(Axis(0), &daps)?,
        })
    }
}

/// Deterministic RNG of one trial.
///
/// Stream 0 of `seed` is used for simulation; trial `i` samples from stream
/// `i + 1`, so results do not depend on batching or worker count.
pub fn trial_rng(seed: u64, trial: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(trial as u64 + 1);
    rng
}

/// Simulate `num_sbc_samples` calibration pairs from the prior and run SBC
/// on them.
pub fn sbc_in_batches<P, S, Q>(
    prior: &P,
    simulator: &S,
    posterior: &Q,
    config: &SbcConfig,
) -> Result<SbcOutput>
where
    P: Prior + ?Sized,
    S: Simulator + ?Sized,
    Q: Posterior + ?Sized,
{
    enter(SbcStage::NotStarted);
    validate(config)?;

    enter(SbcStage::Simulating);
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let (thetas, xs) = simulate_for_sbi(
        simulator,
        prior,
        config.num_sbc_samples,
        config.simulation_batch_size,
        &mut rng,
    )?;

    run_sbc(thetas.view(), xs.view(), posterior, config)
}

/// Run SBC on pre-simulated `(theta, x)` pairs.
///
/// `config.num_sbc_samples` and `config.simulation_batch_size` are not used;
/// the number of trials is `thetas.nrows()`.
pub fn run_sbc<Q>(
    thetas: ArrayView2<f64>,
    xs: ArrayView2<f64>,
    posterior: &Q,
    config: &SbcConfig,
) -> Result<SbcOutput>
where
    Q: Posterior + ?Sized,
{
    validate(config)?;
    let num_trials = thetas.nrows();
    if num_trials == 0 || xs.nrows() != num_trials {
        return Err(Error::Validation(format!(
            "need matching, non-empty theta and x, got {} and {} rows",
            num_trials,
            xs.nrows()
        )));
    }
    if thetas.ncols() != posterior.dim() {
        return Err(Error::Shape(format!(
            "theta has {} columns, posterior has dimension {}",
            thetas.ncols(),
            posterior.dim()
        )));
    }
    if num_trials < 1000 {
        warn!(
            num_sbc_samples = num_trials,
            "SBC should use on the order of 1000 trials for reliable results"
        );
    }
    if config.num_posterior_samples < 100 {
        warn!(
            num_posterior_samples = config.num_posterior_samples,
            "ranking should use at least 100 posterior samples per trial"
        );
    }

    enter(SbcStage::Batching);
    let batches: Vec<Range<usize>> = (0..num_trials)
        .step_by(config.sbc_batch_size)
        .map(|start| start..(start + config.sbc_batch_size).min(num_trials))
        .collect();

    let parallel = config.num_workers > 1;
    enter(SbcStage::Executing { parallel });
    let progress = ProgressGuard::start(
        SbcProgress::new(num_trials, config.num_workers, config.num_posterior_samples),
        config.show_progress_bars,
    );
    let ranking_rv = config.ranking_rv.as_ref();

    let run_batch = |range: &Range<usize>, on_trial: &(dyn Fn() + Sync)| {
        debug!(start = range.start, end = range.end, "sbc batch");
        sbc_trials(
            thetas.slice(s![range.clone(), ..]),
            xs.slice(s![range.clone(), ..]),
            posterior,
            config.num_posterior_samples,
            ranking_rv,
            config.seed,
            range.start,
            on_trial,
        )
    };

    let outputs: Vec<SbcOutput> = if parallel {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .build()
            .map_err(|e| Error::Computation(format!("failed to build SBC thread pool: {}", e)))?;
        pool.install(|| {
            batches
                .par_iter()
                .map(|range| {
                    let out = run_batch(range, &|| {});
                    progress.state().add(range.len());
                    out
                })
                .collect::<Result<Vec<_>>>()
        })?
    } else {
        batches
            .iter()
            .map(|range| run_batch(range, &|| progress.state().increment()))
            .collect::<Result<Vec<_>>>()?
    };
    drop(progress);

    enter(SbcStage::Aggregating);
    let output = SbcOutput::concat(&outputs)?;
    enter(SbcStage::Done);
    Ok(output)
}

/// SBC on one batch of trials whose first trial has index `first_trial`.
///
/// For each `(theta_o, x_o)` row: the posterior log-probability of
/// `theta_o`, `num_posterior_samples` posterior draws given `x_o`, the first
/// draw as the data-averaged-posterior sample, and per dimension the number
/// of draws whose ranking log-probability is strictly below that of
/// `theta_o`.
pub fn sbc_on_batch<Q>(
    thetas: ArrayView2<f64>,
    xs: ArrayView2<f64>,
    posterior: &Q,
    num_posterior_samples: usize,
    ranking_rv: &dyn UnivariateDensity,
    seed: u64,
    first_trial: usize,
) -> Result<SbcOutput>
where
    Q: Posterior + ?Sized,
{
    if thetas.nrows() != xs.nrows() {
        return Err(Error::Validation(format!(
            "batch has {} parameters but {} observations",
            thetas.nrows(),
            xs.nrows()
        )));
    }
    if num_posterior_samples == 0 {
        return Err(Error::Validation("num_posterior_samples must be positive".to_string()));
    }
    sbc_trials(thetas, xs, posterior, num_posterior_samples, ranking_rv, seed, first_trial, &|| {})
}

#[allow(clippy::too_many_arguments)]
fn sbc_trials<Q>(
    thetas: ArrayView2<f64>,
    xs: ArrayView2<f64>,
    posterior: &Q,
    num_posterior_samples: usize,
    ranking_rv: &dyn UnivariateDensity,
    seed: u64,
    first_trial: usize,
    on_trial: &(dyn Fn() + Sync),
) -> Result<SbcOutput>
where
    Q: Posterior + ?Sized,
{
    let (n, d) = thetas.dim();
    let mut ranks = Array2::zeros((n, d));
    let mut log_probs = Array1::zeros(n);
    let mut dap_samples = Array2::zeros((n, d));

    for (idx, (theta_o, x_o)) in thetas.outer_iter().zip(xs.outer_iter()).enumerate() {
        let mut rng = trial_rng(seed, first_trial + idx);
        log_probs[idx] = posterior.log_prob(theta_o, x_o)?;

        let draws = posterior.sample(num_posterior_samples, x_o, &mut rng, false)?;
        if draws.dim() != (num_posterior_samples, d) {
            return Err(Error::Computation(format!(
                "posterior returned samples of shape {:?}, expected ({}, {})",
                draws.shape(),
                num_posterior_samples,
                d
            )));
        }
        dap_samples.row_mut(idx).assign(&draws.row(0));
        for dim in 0..d {
            ranks[[idx, dim]] = rank(ranking_rv, draws.column(dim), theta_o[dim]);
        }
        on_trial();
    }
    Ok(SbcOutput { ranks, log_probs, dap_samples })
}

/// Number of `draws` ranked strictly below `theta` under `ranking_rv`.
/// Ties do not count.
pub fn rank(ranking_rv: &dyn UnivariateDensity, draws: ArrayView1<f64>, theta: f64) -> usize {
    let reference = ranking_rv.log_prob(theta);
    draws.iter().filter(|&&v| ranking_rv.log_prob(v) < reference).count()
}

fn validate(config: &SbcConfig) -> Result<()> {
    if config.num_sbc_samples == 0
        || config.num_posterior_samples == 0
        || config.sbc_batch_size == 0
        || config.num_workers == 0
        || config.simulation_batch_size == 0
    {
        return Err(Error::Validation(format!(
            "SBC sizes must be positive: num_sbc_samples={}, num_posterior_samples={}, \
             sbc_batch_size={}, num_workers={}, simulation_batch_size={}",
            config.num_sbc_samples,
            config.num_posterior_samples,
            config.sbc_batch_size,
            config.num_workers,
            config.simulation_batch_size
        )));
    }
    Ok(())
}
