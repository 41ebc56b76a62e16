//! See [`Error`].

use miette::Diagnostic;
use thiserror::Error;

/// Error types for this crate.
///
/// Apart from [`Error::ShapeMismatch`], [`Error::InvalidReference`] and [`Error::Shape`], all
/// variants are configuration errors: they are raised when a detector is constructed, and
/// indicate a defect in the supplied parameters rather than a transient condition.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Image shape must be square, got {height}x{width}")]
    #[diagnostic(help("non-square inputs are not supported, resize the image before inference"))]
    NonSquareImage { height: usize, width: usize },

    #[error("Scale {scale} has no anchor sizes")]
    EmptySizes { scale: usize },

    #[error("Scale {scale} has {count} anchor sizes, at most 2 are supported")]
    TooManySizes { scale: usize, count: usize },

    #[error("Anchor sizes of scale {scale} must be increasing, got {first} and {second}")]
    DecreasingSizes { scale: usize, first: f32, second: f32 },

    #[error("`{what}` must be strictly positive, got {value}")]
    NonPositive { what: &'static str, value: f64 },

    #[error("Anchor offset must be in [0, 1), got {0}")]
    InvalidOffset(f32),

    #[error("Expected {expected} entries for `{what}`, found {found}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("At least 3 feature-map scales are needed to derive anchor sizes, got {0}")]
    TooFewScales(usize),

    #[error("Anchor {index} of a cell has zero width or height")]
    DegenerateAnchor { index: usize },

    #[error("`{what}` must be in [0, 1], got {value}")]
    InvalidThreshold { what: &'static str, value: f32 },

    #[error("Tensor `{what}` has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Reference box must have a positive height and width, got {height}x{width}")]
    #[diagnostic(help("detections are expressed relative to the reference box"))]
    InvalidReference { height: f32, width: f32 },

    #[error("Failed to build array")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Failed to load configuration")]
    Config(#[from] ssd_config::Error),
}

/// Type alias for [`Result<T, Error>`].
pub type Result<T> = std::result::Result<T, Error>;
