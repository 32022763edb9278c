//! Sightline: a geometric detection-to-landmark pipeline.
//!
//! Sightline turns the raw regressor and classifier tensors of SSD-style detection networks into
//! stable, correctly oriented landmark coordinates in the space of the original camera frame. The
//! same machinery drives every detector in the crate (face box, palm box, face mesh, iris, hand),
//! parameterized only by per-detector configuration.
//!
//! # Coordinate Conventions
//!
//! * Detections are produced in *normalized* coordinates: `[0, 1]` across the model input, with
//!   X pointing right and Y pointing down.
//! * Landmark networks output points in *model pixels* (eg. `0..192` for the face mesh). These are
//!   restored to *sensor pixels* (pixels of the camera frame) via a [`geometry::Transform`].
//! * Transforms compose like matrices: in `a * b`, `b` is applied first.
//!
//! # Environment Variables
//!
//! * `RUST_LOG`: overrides the log levels set up by [`init_logger!`].

use log::LevelFilter;

pub mod analysis;
pub mod config;
pub mod detection;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod landmark;
pub mod nn;
pub mod num;
pub mod pipeline;
pub mod pose;
pub mod roi;
pub mod timer;
pub mod transport;

pub use error::{Error, Result};

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("tract_core"), LevelFilter::Warn)
        .filter(Some("tract_onnx"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and Sightline will log at *trace*
/// level. Otherwise, they will log at *debug* level.
///
/// `tract` will always log at *warn* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
