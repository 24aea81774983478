//! Error types for sbikit

use thiserror::Error;

/// sbikit error type
#[derive(Error, Debug)]
pub enum Error {
    /// A tensor does not have the shape an operation requires.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Input and condition disagree on the batch dimension.
    #[error("Batch shape of condition {condition} and input {input} do not match")]
    BatchMismatch { input: usize, condition: usize },

    /// Batch shapes that cannot be broadcast against each other.
    #[error("Shapes {lhs:?} and {rhs:?} are not broadcastable")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },

    /// Invalid configuration or argument
    #[error("Validation error: {0}")]
    Validation(String),

    /// The simulator failed or returned malformed output
    #[error("Simulation error: {0}")]
    Simulation(String),

    /// Numerical failure during evaluation
    #[error("Computation error: {0}")]
    Computation(String),

    #[error(transparent)]
    Ndarray(#[from] ndarray::ShapeError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
