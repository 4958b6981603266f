//! Error types for the catalog-to-spectrum pipeline.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("field requires {expected} catalog columns, got {got}")]
    ColumnCount { expected: &'static str, got: usize },

    #[error("unknown column \"{0}\"")]
    UnknownColumn(String),

    #[error("invalid values in column \"{0}\"")]
    InvalidColumn(String),

    #[error("inconsistent row length in column \"{column}\": {got} rows, expected {expected}")]
    PageColumnLength {
        column: String,
        got: usize,
        expected: usize,
    },

    #[error("row mask length {got} does not match page rows {expected}")]
    MaskLength { got: usize, expected: usize },

    #[error("no visibility map in catalog \"{0}\"")]
    NoVisibility(String),

    #[error("catalog \"{catalog}\" finished prematurely in page started at row {row}")]
    PrematureEnd { catalog: String, row: u64 },

    #[error("spin-{0} maps not supported")]
    UnsupportedSpin(i32),

    #[error("unknown weights string: {0}")]
    UnknownWeights(String),

    #[error("randomized field requires an injected random source")]
    NoRandomSource,

    #[error("per-mode weights array has {got} entries, need at least {expected}")]
    WeightsLength { got: usize, expected: usize },

    #[error("coefficient array length {0} is not a triangular alm size")]
    BadAlmSize(usize),

    #[error("bin edges must be monotonically increasing")]
    BadBinEdges,
}
