//! SBC diagnostics: rank uniformity, prior vs. data-averaged posterior, and
//! the negative log-probability of the true parameters.
//!
//! Uniform ranks and a data-averaged posterior that matches the prior are
//! both necessary for a calibrated posterior; see
//!   Talts et al. (2018) "Validating Bayesian Inference Algorithms with
//!   Simulation-Based Calibration"

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::warn;

use crate::distributions::Uniform;
use crate::error::{Error, Result};
use crate::metrics::{c2st, ks_test, C2stConfig};

/// Settings for [`sbc_checks_with`].
#[derive(Debug, Clone)]
pub struct ChecksConfig {
    /// c2st repetitions against fresh uniform draws; scores are averaged.
    pub num_repetitions: usize,
    pub c2st: C2stConfig,
    /// Seed of the reference uniform draws.
    pub seed: u64,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self { num_repetitions: 1, c2st: C2stConfig::default(), seed: 0 }
    }
}

/// Results of the SBC checks, one entry per parameter dimension.
#[derive(Debug, Clone, Serialize)]
pub struct SbcChecks {
    pub ks_pvals: Vec<f64>,
    pub c2st_ranks: Vec<f64>,
    pub c2st_dap: Vec<f64>,
    pub nltp: f64,
    pub num_trials: usize,
    pub num_ranks: usize,
}

impl SbcChecks {
    /// Render the checks as a formatted table string.
    pub fn to_table(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "SBC checks: {} trials × {} ranks",
            self.num_trials, self.num_ranks
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<10} {:>10} {:>12} {:>10}",
            "Dimension", "ks_pval", "c2st_ranks", "c2st_dap"
        ));
        lines.push("─".repeat(45));

        for (i, ((p, cr), cd)) in self
            .ks_pvals
            .iter()
            .zip(&self.c2st_ranks)
            .zip(&self.c2st_dap)
            .enumerate()
        {
            lines.push(format!("{:<10} {:>10.4} {:>12.4} {:>10.4}", i, p, cr, cd));
        }

        lines.push("─".repeat(45));
        lines.push(format!("NLTP: {:.4}", self.nltp));

        if self.ks_pvals.iter().any(|p| *p < 0.05) {
            lines.push("⚠  Some KS p-values < 0.05 — ranks are not uniform.".to_string());
        }
        if self.c2st_ranks.iter().any(|c| *c > 0.55) {
            lines.push(
                "⚠  Some rank c2st scores > 0.55 — ranks are distinguishable from uniform."
                    .to_string(),
            );
        }
        if self.c2st_dap.iter().any(|c| *c > 0.55) {
            lines.push(
                "⚠  Some DAP c2st scores > 0.55 — data-averaged posterior differs from the prior."
                    .to_string(),
            );
        }
        if self.num_trials < 100 {
            lines.push(format!(
                "⚠  Only {} trials — checks are unreliable below 100.",
                self.num_trials
            ));
        }

        lines.join("\n")
    }
}

/// Run all SBC checks with default settings.
///
/// `ranks` is `(num_trials, d)`, `log_probs` `(num_trials,)`, and the prior
/// and DAP samples are both `(num_samples, d)`.
pub fn sbc_checks(
    ranks: ArrayView2<f64>,
    log_probs: ArrayView1<f64>,
    prior_samples: ArrayView2<f64>,
    dap_samples: ArrayView2<f64>,
    num_ranks: usize,
) -> Result<SbcChecks> {
    sbc_checks_with(ranks, log_probs, prior_samples, dap_samples, num_ranks, &ChecksConfig::default())
}

pub fn sbc_checks_with(
    ranks: ArrayView2<f64>,
    log_probs: ArrayView1<f64>,
    prior_samples: ArrayView2<f64>,
    dap_samples: ArrayView2<f64>,
    num_ranks: usize,
    config: &ChecksConfig,
) -> Result<SbcChecks> {
    let num_trials = ranks.nrows();
    if num_trials == 0 || log_probs.is_empty() {
        return Err(Error::Validation("SBC checks need at least one trial".to_string()));
    }
    if num_trials < 100 {
        warn!(
            num_trials,
            "computing SBC checks with fewer than 100 trials; at least 100 are recommended"
        );
    }

    let (ks_pvals, c2st_ranks) = check_uniformity(ranks, num_ranks, config)?;
    let c2st_dap = check_prior_vs_dap(prior_samples, dap_samples, &config.c2st)?;
    let nltp = -log_probs.sum() / log_probs.len() as f64;

    Ok(SbcChecks { ks_pvals, c2st_ranks, c2st_dap, nltp, num_trials, num_ranks })
}

/// Per-dimension c2st accuracy between prior samples and DAP samples.
pub fn check_prior_vs_dap(
    prior_samples: ArrayView2<f64>,
    dap_samples: ArrayView2<f64>,
    config: &C2stConfig,
) -> Result<Vec<f64>> {
    if prior_samples.shape() != dap_samples.shape() {
        return Err(Error::Shape(format!(
            "prior samples {:?} and DAP samples {:?} must have the same shape",
            prior_samples.shape(),
            dap_samples.shape()
        )));
    }
    prior_samples
        .axis_iter(Axis(1))
        .zip(dap_samples.axis_iter(Axis(1)))
        .map(|(p, d)| c2st(p.insert_axis(Axis(1)), d.insert_axis(Axis(1)), config))
        .collect()
}

/// KS p-values and c2st scores of each rank dimension against
/// `Uniform[0, num_ranks]`.
///
/// c2st scores are averaged over `config.num_repetitions` fresh uniform
/// reference samples.
pub fn check_uniformity(
    ranks: ArrayView2<f64>,
    num_ranks: usize,
    config: &ChecksConfig,
) -> Result<(Vec<f64>, Vec<f64>)> {
    if config.num_repetitions == 0 {
        return Err(Error::Validation("num_repetitions must be positive".to_string()));
    }
    let reference = Uniform::new(0.0, num_ranks as f64)?;
    let (n, d) = ranks.dim();

    let ks_pvals = ranks
        .axis_iter(Axis(1))
        .map(|col| ks_test(col, |x| reference.cdf(x)).map(|r| r.pvalue))
        .collect::<Result<Vec<_>>>()?;

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut scores = Array2::zeros((config.num_repetitions, d));
    for rep in 0..config.num_repetitions {
        for (j, col) in ranks.axis_iter(Axis(1)).enumerate() {
            let uniform = Array2::from_shape_vec((n, 1), reference.sample_n(n, &mut rng))?;
            scores[[rep, j]] = c2st(col.insert_axis(Axis(1)), uniform.view(), &config.c2st)?;
        }
    }

    if config.num_repetitions > 1 {
        let spread = scores.std_axis(Axis(0), 1.0);
        if spread.iter().any(|s| *s > 0.05) {
            warn!(
                max_std = spread.iter().copied().fold(0.0_f64, f64::max),
                "c2st score variability is larger than 0.05; results may be unreliable"
            );
        }
    }

    let mean = scores
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::Computation("no c2st repetitions".to_string()))?;
    Ok((ks_pvals, mean.to_vec()))
}
