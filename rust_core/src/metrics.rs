//! Two-sample and goodness-of-fit tests used by the SBC checks.

use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{Error, Result};

// ── Classifier two-sample test ──────────────────────────────────────

/// Configuration for [`c2st`].
#[derive(Debug, Clone)]
pub struct C2stConfig {
    pub n_folds: usize,
    pub n_neighbors: usize,
    /// Standardise both samples with the mean/std of the first one.
    pub z_score: bool,
    pub seed: u64,
}

impl Default for C2stConfig {
    fn default() -> Self {
        Self { n_folds: 5, n_neighbors: 15, z_score: true, seed: 1 }
    }
}

/// Classifier two-sample test.
///
/// Trains a k-nearest-neighbour classifier to tell rows of `a` from rows of
/// `b` and returns its cross-validated accuracy. 0.5 means the samples are
/// indistinguishable, 1.0 means they are perfectly separable.
pub fn c2st(a: ArrayView2<f64>, b: ArrayView2<f64>, config: &C2stConfig) -> Result<f64> {
    if a.ncols() != b.ncols() || a.ncols() == 0 {
        return Err(Error::Shape(format!(
            "c2st samples must have the same non-zero width, got {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    if config.n_folds < 2 || config.n_neighbors == 0 {
        return Err(Error::Validation(format!(
            "c2st needs n_folds >= 2 and n_neighbors >= 1, got {} and {}",
            config.n_folds, config.n_neighbors
        )));
    }
    let n = a.nrows() + b.nrows();
    if a.nrows() == 0 || b.nrows() == 0 || n < config.n_folds {
        return Err(Error::Validation(format!(
            "c2st needs two non-empty samples with at least {} rows in total, got {} and {}",
            config.n_folds,
            a.nrows(),
            b.nrows()
        )));
    }

    let mut data = concatenate(Axis(0), &[a.view(), b.view()])?;
    if config.z_score {
        let mean = a.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(a.ncols()));
        let std = a.std_axis(Axis(0), 0.0).mapv(|s| if s > 0.0 { s } else { 1.0 });
        data -= &mean;
        data /= &std;
    }
    let labels: Vec<bool> = (0..n).map(|i| i >= a.nrows()).collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(config.seed));

    let mut accuracy = 0.0;
    for fold in 0..config.n_folds {
        let (mut test, mut train) = (Vec::new(), Vec::new());
        for (pos, &i) in order.iter().enumerate() {
            if pos % config.n_folds == fold {
                test.push(i);
            } else {
                train.push(i);
            }
        }
        let classifier = Knn::fit(&data, &labels, &train, config.n_neighbors);
        let correct = test
            .iter()
            .filter(|&&i| classifier.predict(data.row(i)) == labels[i])
            .count();
        accuracy += correct as f64 / test.len() as f64;
    }
    Ok(accuracy / config.n_folds as f64)
}

/// Majority-vote k-nearest-neighbour classifier over boolean labels.
///
/// Vote ties are broken by the label of the single nearest neighbour.
enum Knn {
    /// 1-D data sorted by value.
    Sorted { values: Vec<f64>, labels: Vec<bool>, k: usize },
    BruteForce { points: Array2<f64>, labels: Vec<bool>, k: usize },
}

impl Knn {
    fn fit(data: &Array2<f64>, labels: &[bool], train: &[usize], k: usize) -> Self {
        let k = k.min(train.len()).max(1);
        if data.ncols() == 1 {
            let mut pairs: Vec<(f64, bool)> = train.iter().map(|&i| (data[[i, 0]], labels[i])).collect();
            pairs.sort_by(|x, y| x.0.total_cmp(&y.0));
            let (values, labels) = pairs.into_iter().unzip();
            Knn::Sorted { values, labels, k }
        } else {
            Knn::BruteForce {
                points: data.select(Axis(0), train),
                labels: train.iter().map(|&i| labels[i]).collect(),
                k,
            }
        }
    }

    fn predict(&self, x: ArrayView1<f64>) -> bool {
        // Neighbours ordered nearest first.
        let neighbours: Vec<bool> = match self {
            Knn::Sorted { values, labels, k } => {
                let v = x[0];
                let split = values.partition_point(|&p| p < v);
                let (mut lo, mut hi) = (split, split);
                let mut out = Vec::with_capacity(*k);
                while out.len() < *k && (lo > 0 || hi < values.len()) {
                    let take_low = match (lo > 0, hi < values.len()) {
                        (true, true) => v - values[lo - 1] <= values[hi] - v,
                        (low, _) => low,
                    };
                    if take_low {
                        lo -= 1;
                        out.push(labels[lo]);
                    } else {
                        out.push(labels[hi]);
                        hi += 1;
                    }
                }
                out
            }
            Knn::BruteForce { points, labels, k } => {
                let mut dists: Vec<(f64, usize)> = points
                    .outer_iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let d2 = p.iter().zip(x.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f64>();
                        (d2, i)
                    })
                    .collect();
                let k = *k;
                if k < dists.len() {
                    dists.select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0));
                    dists.truncate(k);
                }
                dists.sort_by(|a, b| a.0.total_cmp(&b.0));
                dists.iter().map(|&(_, i)| labels[i]).collect()
            }
        };

        let votes = neighbours.iter().filter(|l| **l).count();
        let against = neighbours.len() - votes;
        match votes.cmp(&against) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => neighbours.first().copied().unwrap_or(false),
        }
    }
}

// ── Kolmogorov–Smirnov ──────────────────────────────────────────────

/// Result of a one-sample Kolmogorov–Smirnov test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KsResult {
    /// Supremum distance between the empirical and reference CDFs.
    pub statistic: f64,
    pub pvalue: f64,
}

/// Two-sided one-sample KS test of `samples` against `cdf`.
///
/// The p-value uses the asymptotic Kolmogorov distribution with Stephens'
/// small-sample correction `(sqrt(n) + 0.12 + 0.11 / sqrt(n)) * D`.
pub fn ks_test(samples: ArrayView1<f64>, cdf: impl Fn(f64) -> f64) -> Result<KsResult> {
    if samples.is_empty() {
        return Err(Error::Validation("KS test needs at least one sample".to_string()));
    }
    if samples.iter().any(|v| v.is_nan()) {
        return Err(Error::Validation("KS test samples contain NaN".to_string()));
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len() as f64;
    let statistic = sorted
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let f = cdf(x);
            ((i + 1) as f64 / n - f).max(f - i as f64 / n)
        })
        .fold(0.0_f64, f64::max);

    let sqrt_n = n.sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * statistic;
    Ok(KsResult { statistic, pvalue: kolmogorov_survival(lambda) })
}

/// `Q_KS(λ) = 2 Σ_{j≥1} (-1)^{j-1} exp(-2 j² λ²)`
fn kolmogorov_survival(lambda: f64) -> f64 {
    if lambda < 0.2 {
        return 1.0;
    }
    let a2 = -2.0 * lambda * lambda;
    let mut fac = 2.0;
    let mut sum = 0.0;
    let mut previous = 0.0_f64;
    for j in 1..=100 {
        let jf = j as f64;
        let term = fac * (a2 * jf * jf).exp();
        sum += term;
        if term.abs() <= 1e-3 * previous || term.abs() <= 1e-8 * sum {
            return sum.clamp(0.0, 1.0);
        }
        fac = -fac;
        previous = term.abs();
    }
    // Series did not converge, only possible for tiny λ.
    1.0
}
