pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod estimators;
pub mod metrics;
pub mod posterior;
pub mod progress;
pub mod sbc;
pub mod shape;
pub mod simulation;

pub use diagnostics::{check_prior_vs_dap, check_uniformity, sbc_checks, sbc_checks_with, ChecksConfig, SbcChecks};
pub use distributions::{BoxUniform, IndependentNormal, Normal, Prior, Uniform, UnivariateDensity};
pub use error::{Error, Result};
pub use estimators::{
    AffineFlow, CategoricalNet, ConditionalEstimator, ConditionalNet, DensityEstimator, InvertibleNet,
    MixedNet, MixtureDensityNetwork,
};
pub use metrics::{c2st, ks_test, C2stConfig, KsResult};
pub use posterior::{DirectPosterior, Posterior};
pub use sbc::{run_sbc, sbc_in_batches, sbc_on_batch, SbcConfig, SbcOutput, SbcStage};
pub use shape::reshape_to_sample_batch_event;
pub use simulation::{handle_invalid_x, simulate_for_sbi, LinearGaussian, Simulator};

