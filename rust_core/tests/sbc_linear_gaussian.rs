use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use sbikit_core::estimators::FlowEstimator;
use sbikit_core::simulation::select_valid;
use sbikit_core::{
    handle_invalid_x, run_sbc, sbc_checks, sbc_in_batches, simulate_for_sbi, AffineFlow,
    ConditionalEstimator, DirectPosterior, IndependentNormal, LinearGaussian, Prior, SbcConfig,
    Simulator,
};

const NUM_DIM: usize = 2;
const NUM_TRIALS: usize = 1000;

fn model() -> (IndependentNormal, LinearGaussian) {
    let prior = IndependentNormal::standard(NUM_DIM).unwrap();
    let simulator = LinearGaussian::new(vec![-1.0; NUM_DIM], 0.3_f64.sqrt()).unwrap();
    (prior, simulator)
}

fn fitted_posterior(
    prior: &IndependentNormal,
    simulator: &LinearGaussian,
) -> DirectPosterior<FlowEstimator, IndependentNormal> {
    let mut rng = ChaCha8Rng::seed_from_u64(1234);
    let (theta, x) = simulate_for_sbi(simulator, prior, 5000, 1000, &mut rng).unwrap();
    let flow = AffineFlow::fit_gaussian(theta.view(), x.view()).unwrap();
    let estimator = ConditionalEstimator::new(flow, vec![NUM_DIM], vec![NUM_DIM]).unwrap();
    DirectPosterior::new(estimator, prior.clone()).unwrap()
}

fn config() -> SbcConfig {
    SbcConfig {
        num_sbc_samples: NUM_TRIALS,
        num_posterior_samples: 100,
        sbc_batch_size: 10,
        num_workers: 2,
        show_progress_bars: false,
        ..SbcConfig::default()
    }
}

#[test]
fn test_running_sbc_with_fitted_flow() {
    let (prior, simulator) = model();
    let posterior = fitted_posterior(&prior, &simulator);
    let cfg = config();

    let out = sbc_in_batches(&prior, &simulator, &posterior, &cfg).unwrap();
    assert_eq!(out.ranks.shape(), &[NUM_TRIALS, NUM_DIM]);
    assert_eq!(out.dap_samples.shape(), &[NUM_TRIALS, NUM_DIM]);
    assert_eq!(out.log_probs.len(), NUM_TRIALS);
    assert!(out.ranks.iter().all(|&r| r <= cfg.num_posterior_samples));
    assert!(out.log_probs.iter().all(|v| v.is_finite()));

    let prior_samples = prior.sample(NUM_TRIALS, &mut ChaCha8Rng::seed_from_u64(7));
    let checks = sbc_checks(
        out.ranks_f64().view(),
        out.log_probs.view(),
        prior_samples.view(),
        out.dap_samples.view(),
        cfg.num_posterior_samples,
    )
    .unwrap();
    assert_eq!(checks.ks_pvals.len(), NUM_DIM);
    assert!(checks.ks_pvals.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!(checks.c2st_ranks.iter().all(|c| (0.0..=1.0).contains(c)));
    assert!(checks.c2st_dap.iter().all(|c| *c < 0.65), "{:?}", checks.c2st_dap);
    assert!(checks.nltp.is_finite());
}

#[test]
fn test_fitted_flow_matches_analytic_posterior() {
    let (prior, simulator) = model();
    let fitted = fitted_posterior(&prior, &simulator);
    let exact = simulator.true_posterior(&prior).unwrap();
    let cfg = config();

    let fitted_out = sbc_in_batches(&prior, &simulator, &fitted, &cfg).unwrap();
    let exact_out = sbc_in_batches(&prior, &simulator, &exact, &cfg).unwrap();

    let nltp = |lp: &ndarray::Array1<f64>| -lp.mean().unwrap();
    assert!(
        (nltp(&fitted_out.log_probs) - nltp(&exact_out.log_probs)).abs() < 0.1,
        "fitted {} vs exact {}",
        nltp(&fitted_out.log_probs),
        nltp(&exact_out.log_probs)
    );

    let prior_samples = prior.sample(NUM_TRIALS, &mut ChaCha8Rng::seed_from_u64(8));
    let checks = sbc_checks(
        exact_out.ranks_f64().view(),
        exact_out.log_probs.view(),
        prior_samples.view(),
        exact_out.dap_samples.view(),
        cfg.num_posterior_samples,
    )
    .unwrap();
    assert!(checks.ks_pvals.iter().all(|p| *p > 0.001), "{:?}", checks.ks_pvals);
}

#[test]
fn test_sbc_after_dropping_invalid_simulations() {
    let (prior, simulator) = model();
    let flaky = move |theta: ArrayView2<f64>, rng: &mut ChaCha8Rng| -> sbikit_core::Result<Array2<f64>> {
        let mut x = simulator.simulate(theta, rng)?;
        for v in x.iter_mut() {
            if rng.gen::<f64>() < 0.05 {
                *v = f64::NAN;
            }
        }
        Ok(x)
    };

    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let (theta, x) = simulate_for_sbi(&flaky, &prior, 100, 1000, &mut rng).unwrap();
    let validity = handle_invalid_x(x.view(), true);
    assert!(validity.num_nans > 0);
    let (theta, x) = select_valid(theta.view(), x.view(), &validity).unwrap();
    assert_eq!(theta.nrows(), validity.num_valid());

    let (_, clean) = model();
    let posterior = clean.true_posterior(&prior).unwrap();
    let out = run_sbc(theta.view(), x.view(), &posterior, &SbcConfig {
        num_posterior_samples: 50,
        show_progress_bars: false,
        ..SbcConfig::default()
    })
    .unwrap();
    assert_eq!(out.num_trials(), validity.num_valid());
    assert!(out.ranks.iter().all(|&r| r <= 50));
}
