//! Error kinds produced by the pipeline.
//!
//! An empty detection result is *not* an error: decoders and stages report it as an empty list or
//! `None`, and the orchestrator turns it into a reset signal.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// A tensor or point list disagrees with the configured anchor, coordinate or landmark count.
    ///
    /// Fatal to the invocation that produced it. Data is never truncated to make it fit.
    #[error("{what}: expected {expected} values, got {actual}")]
    ConfigMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A crop rectangle with zero area (eg. a detection entirely outside of the frame).
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(&'static str),

    /// The inference backend failed. The frame is dropped.
    #[error("inference failed: {0}")]
    InferenceFailure(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn mismatch(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::ConfigMismatch {
            what,
            expected,
            actual,
        }
    }
}
