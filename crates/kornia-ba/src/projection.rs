use glam::DVec3;

use crate::parallel::WorkerPool;
use crate::types::{Camera, DistortionModel, Observation, Point};

/// Projection of a point through a camera, without the distortion term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Point in the camera frame, `R * X + t`.
    pub camera_point: DVec3,
    /// Normalized image coordinates `X_c.xy / X_c.z`.
    pub normalized: [f64; 2],
}

impl Projection {
    /// Project `point` into `camera`.
    #[inline]
    pub fn new(camera: &Camera, point: &Point) -> Self {
        let camera_point = camera.transform(point);
        let inv_z = 1.0 / camera_point.z;
        Self {
            camera_point,
            normalized: [camera_point.x * inv_z, camera_point.y * inv_z],
        }
    }

    /// Squared radius of the normalized coordinates.
    #[inline]
    pub fn radius_squared(&self) -> f64 {
        self.normalized[0] * self.normalized[0] + self.normalized[1] * self.normalized[1]
    }
}

/// Predicted pixel position of `point` in `camera`.
///
/// For [`DistortionModel::Measurement`] the prediction is the undistorted pinhole
/// projection, distortion lives on the measurement side.
pub fn project(camera: &Camera, point: &Point, model: DistortionModel) -> [f64; 2] {
    let proj = Projection::new(camera, point);
    let k = match model {
        DistortionModel::Projection => 1.0 + camera.distortion * proj.radius_squared(),
        DistortionModel::None | DistortionModel::Measurement => 1.0,
    };
    [
        camera.focal * k * proj.normalized[0],
        camera.focal * k * proj.normalized[1],
    ]
}

/// Measurement divided by the modeled distortion, `m / (1 + d * |m|^2)`.
#[inline]
pub fn undistort_measurement(measurement: [f64; 2], distortion: f64) -> [f64; 2] {
    let r2 = measurement[0] * measurement[0] + measurement[1] * measurement[1];
    let inv = 1.0 / (1.0 + distortion * r2);
    [measurement[0] * inv, measurement[1] * inv]
}

/// Signed residual `measured - predicted` of one observation.
#[inline]
pub fn residual(
    camera: &Camera,
    point: &Point,
    measurement: [f64; 2],
    model: DistortionModel,
) -> [f64; 2] {
    let predicted = project(camera, point, model);
    let measured = match model {
        DistortionModel::Measurement => undistort_measurement(measurement, camera.distortion),
        DistortionModel::None | DistortionModel::Projection => measurement,
    };
    [measured[0] - predicted[0], measured[1] - predicted[1]]
}

/// Evaluate the residual of every observation.
///
/// # Arguments
///
/// * `pool` - Worker pool running the per-observation evaluation.
/// * `cameras` - Camera parameters.
/// * `points` - Point positions.
/// * `observations` - Observation list.
/// * `model` - Distortion model.
/// * `residuals` - Output of length `2 * observations.len()`, `[rx0, ry0, rx1, ...]`.
///
/// # Returns
///
/// The objective, the total squared norm of the residuals.
pub fn compute_residuals(
    pool: &WorkerPool,
    cameras: &[Camera],
    points: &[Point],
    observations: &[Observation],
    model: DistortionModel,
    residuals: &mut [f64],
) -> f64 {
    debug_assert_eq!(residuals.len(), 2 * observations.len());
    pool.for_each_block(residuals, 2, |i, r| {
        let obs = &observations[i];
        let e = residual(&cameras[obs.camera], &points[obs.point], obs.measurement, model);
        r[0] = e[0];
        r[1] = e[1];
    });
    pool.dot(residuals, residuals)
}

/// Euclidean reprojection error of every observation.
pub fn reprojection_errors(
    pool: &WorkerPool,
    cameras: &[Camera],
    points: &[Point],
    observations: &[Observation],
    model: DistortionModel,
) -> Vec<f64> {
    let mut errors = vec![0.0; observations.len()];
    pool.for_each_block(&mut errors, 1, |i, e| {
        let obs = &observations[i];
        let r = residual(&cameras[obs.camera], &points[obs.point], obs.measurement, model);
        e[0] = (r[0] * r[0] + r[1] * r[1]).sqrt();
    });
    errors
}

/// Mean Euclidean reprojection error over all observations.
pub fn mean_reprojection_error(
    pool: &WorkerPool,
    cameras: &[Camera],
    points: &[Point],
    observations: &[Observation],
    model: DistortionModel,
) -> f64 {
    if observations.is_empty() {
        return 0.0;
    }
    let errors = reprojection_errors(pool, cameras, points, observations, model);
    pool.sum_by(errors.len(), |i| errors[i]) / errors.len() as f64
}
