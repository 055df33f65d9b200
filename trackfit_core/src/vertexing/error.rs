//! Error domain of the vertexing algorithms.

use thiserror::Error;
use trackfit_env::GeometryError;

/// Failures of vertex seeding, fitting and finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum VertexingError {
    #[error("Numeric failure in calculation.")]
    NumericFailure,

    #[error("Empty input provided.")]
    EmptyInput,

    #[error("Error while finding vertex seed.")]
    SeedingError,

    #[error("Unable to converge.")]
    NotConverged,

    #[error("Unable to find element.")]
    ElementNotFound,

    #[error("No covariance provided.")]
    NoCovariance,

    #[error("Encountered non-invertible matrix.")]
    SingularMatrix,

    #[error("Encountered negative or zero variance.")]
    NonPositiveVariance,

    #[error("Encountered a matrix that is not positive definite.")]
    MatrixNotPositiveDefinite,

    #[error("Invalid input provided.")]
    InvalidInput,
}

impl VertexingError {
    /// Stable integer code of this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::NumericFailure => 1,
            Self::EmptyInput => 2,
            Self::SeedingError => 3,
            Self::NotConverged => 4,
            Self::ElementNotFound => 5,
            Self::NoCovariance => 6,
            Self::SingularMatrix => 7,
            Self::NonPositiveVariance => 8,
            Self::MatrixNotPositiveDefinite => 9,
            Self::InvalidInput => 10,
        }
    }
}

impl From<GeometryError> for VertexingError {
    fn from(_: GeometryError) -> Self {
        Self::NumericFailure
    }
}
