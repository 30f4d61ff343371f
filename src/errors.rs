use thiserror::Error;

/// Errors surfaced to the caller.
///
/// Numerical problems inside the detection pipeline (a singular Hessian, a refinement
/// that wanders off) never reach the caller; they only discard the candidate at hand.
/// The `Singular` and `SvdFailed` variants are returned by the [`matrix`](crate::matrix)
/// helpers and absorbed by the pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("a {width}x{height} base image cannot hold a single octave")]
    ImageTooSmall { width: usize, height: usize },
    #[error("at least {required} matches are needed for a fit, got {actual}")]
    InsufficientMatches { required: usize, actual: usize },
    #[error("at least {required} points are needed, got {actual}")]
    InsufficientPoints { required: usize, actual: usize },
    #[error("matrix must be square to invert, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("match refers to feature {index} of a list of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("matrix is singular")]
    Singular,
    #[error("singular value decomposition did not converge")]
    SvdFailed,
}

impl Error {
    /// Returns true for errors caused by ill-conditioned numerics rather than bad input.
    pub fn is_numerical(&self) -> bool {
        matches!(self, Error::Singular | Error::SvdFailed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
