use thiserror::Error;

use crate::config::ConfigError;
use crate::parallel::ParallelError;

/// Errors that prevent a bundle adjustment solve from starting.
///
/// Numerical trouble during the solve is never reported through this type: it is
/// recovered locally and tallied in the [`crate::BundleAdjustmentSummary`].
#[derive(Debug, Error, PartialEq)]
pub enum BundleAdjustmentError {
    /// The camera array is empty.
    #[error("bundle adjustment requires at least one camera")]
    EmptyCameras,

    /// The point array is empty.
    #[error("bundle adjustment requires at least one point")]
    EmptyPoints,

    /// The observation list is empty.
    #[error("bundle adjustment requires at least one observation")]
    EmptyObservations,

    /// An observation refers to a camera that does not exist.
    #[error("observation {observation} refers to camera {camera}, but only {num_cameras} cameras exist")]
    CameraIndexOutOfRange {
        /// Index of the offending observation.
        observation: usize,
        /// Camera index stored in the observation.
        camera: usize,
        /// Number of cameras supplied.
        num_cameras: usize,
    },

    /// An observation refers to a point that does not exist.
    #[error("observation {observation} refers to point {point}, but only {num_points} points exist")]
    PointIndexOutOfRange {
        /// Index of the offending observation.
        observation: usize,
        /// Point index stored in the observation.
        point: usize,
        /// Number of points supplied.
        num_points: usize,
    },

    /// A camera is not referenced by any observation.
    #[error("camera {0} has no observations")]
    UnobservedCamera(usize),

    /// A point is not referenced by any observation.
    #[error("point {0} has no observations")]
    UnobservedPoint(usize),

    /// A measurement or an initial parameter is NaN or infinite.
    #[error("non-finite input value in {0}")]
    NonFiniteInput(&'static str),

    /// The solver configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The worker pool could not be created.
    #[error(transparent)]
    Parallel(#[from] ParallelError),
}
