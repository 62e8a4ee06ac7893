#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Solver configuration.
pub mod config;

/// Error types.
pub mod error;

/// Observations grouped by camera and by point.
pub mod index;

/// Closed-form Jacobian blocks and their storage policies.
pub mod jacobian;

/// Focal and depth normalization of a scene.
pub mod normalize;

/// Bounded worker pool with deterministic reductions.
pub mod parallel;

/// Preconditioned conjugate gradients on the damped normal equations.
///
/// The normal matrix is never formed: products go through the Jacobian store
/// and the block preconditioner supplies `M^-1`.
pub mod pcg;

/// Block-diagonal preconditioner of the normal equations.
pub mod preconditioner;

/// Projection and reprojection residuals.
pub mod projection;

/// Rotation helpers.
pub mod rotation;

/// The Levenberg-Marquardt driver.
pub mod solver;

/// Cameras, points and observations.
pub mod types;

/// Parameter updates.
pub mod update;

pub use config::{
    BundleAdjustmentConfig, ConfigError, ConvergenceThresholds, DampingMode, JacobianStorage,
    LinearSolverKind,
};
pub use error::BundleAdjustmentError;
pub use projection::{mean_reprojection_error, reprojection_errors};
pub use solver::{BundleAdjuster, BundleAdjustmentSummary, TerminationReason};
pub use types::{Camera, DistortionModel, Observation, Point};
