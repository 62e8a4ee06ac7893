use crate::index::ObservationIndex;
use crate::types::{Camera, DistortionModel, Observation, Point};

/// Focal length the median focal is mapped to.
pub const FOCAL_TARGET: f64 = 1.0;

/// Minimum depth of an observed point, relative to the median positive depth.
pub const DEPTH_EPSILON: f64 = 1e-3;

/// What the normalizer did to the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationReport {
    /// Factor applied to focal lengths and measurements.
    pub focal_scale: f64,
    /// Factor applied to translations and points.
    pub depth_scale: f64,
    /// Cameras moved along their optical axis to bring a point off the image plane.
    pub cameras_perturbed: usize,
    /// Distinct points that lie behind at least one camera observing them.
    pub points_behind_camera: usize,
}

/// Rescales a scene so focal lengths and depths are of order one.
///
/// Focal lengths and measurements are multiplied by `s_f`, translations and
/// points by `s_d`. The coefficient of [`DistortionModel::Measurement`] acts on
/// pixel radii and is divided by `s_f^2`; the projection model is scale free.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataNormalizer {
    focal_scale: f64,
    depth_scale: f64,
    model: DistortionModel,
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some(0.5 * (values[mid - 1] + values[mid]))
    }
}

fn usable_scale(scale: f64) -> f64 {
    if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    }
}

fn depth(camera: &Camera, point: &Point) -> f64 {
    camera.transform(point).z
}

impl DataNormalizer {
    /// A normalizer that leaves the scene unchanged.
    pub fn identity(model: DistortionModel) -> Self {
        Self {
            focal_scale: 1.0,
            depth_scale: 1.0,
            model,
        }
    }

    /// Factor applied to focal lengths and measurements.
    pub fn focal_scale(&self) -> f64 {
        self.focal_scale
    }

    /// Factor applied to translations and points.
    pub fn depth_scale(&self) -> f64 {
        self.depth_scale
    }

    /// Factor that converts a normalized objective back to pixel units.
    pub fn objective_scale(&self) -> f64 {
        1.0 / (self.focal_scale * self.focal_scale)
    }

    /// Nudge cameras off near-planar points, then rescale the scene in place.
    ///
    /// # Arguments
    ///
    /// * `cameras` - Cameras, modified in place.
    /// * `points` - Points, modified in place.
    /// * `observations` - Observations whose measurements are rescaled in place.
    /// * `index` - Observations grouped by camera and by point.
    /// * `model` - Distortion model the coefficients are interpreted under.
    /// * `rescale` - Apply the focal and depth scaling. When false only the
    ///   image plane check runs and the scales are 1.
    pub fn normalize(
        cameras: &mut [Camera],
        points: &mut [Point],
        observations: &mut [Observation],
        index: &ObservationIndex,
        model: DistortionModel,
        rescale: bool,
    ) -> (Self, NormalizationReport) {
        let mut depths: Vec<f64> = observations
            .iter()
            .map(|o| depth(&cameras[o.camera], &points[o.point]))
            .filter(|z| *z > 0.0 && z.is_finite())
            .collect();
        let epsilon = DEPTH_EPSILON * median(&mut depths).map_or(1.0, usable_scale);

        let cameras_perturbed = Self::push_off_image_plane(cameras, points, observations, index, epsilon);
        if cameras_perturbed > 0 {
            log::warn!("moved {cameras_perturbed} cameras to keep observed points off their image plane");
        }

        let points_behind_camera = (0..points.len())
            .filter(|&p| {
                index.point_observations(p).iter().any(|&i| {
                    let o = &observations[i];
                    depth(&cameras[o.camera], &points[p]) <= 0.0
                })
            })
            .count();
        if points_behind_camera > 0 {
            log::warn!("{points_behind_camera} points lie behind a camera observing them");
        }

        let (focal_scale, depth_scale) = if rescale {
            let mut depths: Vec<f64> = observations
                .iter()
                .map(|o| depth(&cameras[o.camera], &points[o.point]))
                .filter(|z| *z > 0.0 && z.is_finite())
                .collect();
            let mut focals: Vec<f64> = cameras.iter().map(|c| c.focal).collect();
            (
                median(&mut focals).map_or(1.0, |m| usable_scale(FOCAL_TARGET / m)),
                median(&mut depths).map_or(1.0, |m| usable_scale(1.0 / m)),
            )
        } else {
            (1.0, 1.0)
        };

        let normalizer = Self {
            focal_scale,
            depth_scale,
            model,
        };
        if rescale {
            normalizer.rescale(cameras, points, focal_scale, depth_scale);
            for o in observations.iter_mut() {
                o.measurement[0] *= focal_scale;
                o.measurement[1] *= focal_scale;
            }
        }
        log::debug!("normalized scene: focal scale {focal_scale:.6e}, depth scale {depth_scale:.6e}");

        let report = NormalizationReport {
            focal_scale,
            depth_scale,
            cameras_perturbed,
            points_behind_camera,
        };
        (normalizer, report)
    }

    /// Move every non-fixed camera that sees a point closer than `epsilon` to its
    /// image plane along its optical axis, so that point sits at depth `epsilon`.
    fn push_off_image_plane(
        cameras: &mut [Camera],
        points: &[Point],
        observations: &[Observation],
        index: &ObservationIndex,
        epsilon: f64,
    ) -> usize {
        let mut perturbed = 0;
        for (c, camera) in cameras.iter_mut().enumerate() {
            if camera.fixed {
                continue;
            }
            let shift = index
                .camera_observations(c)
                .iter()
                .map(|&i| depth(camera, &points[observations[i].point]))
                .filter(|z| z.abs() < epsilon)
                .map(|z| epsilon - z)
                .fold(0.0f64, f64::max);
            if shift > 0.0 {
                camera.translation[2] += shift;
                perturbed += 1;
            }
        }
        perturbed
    }

    fn rescale(&self, cameras: &mut [Camera], points: &mut [Point], focal: f64, depth: f64) {
        for camera in cameras.iter_mut() {
            camera.focal *= focal;
            for t in camera.translation.iter_mut() {
                *t *= depth;
            }
            if self.model == DistortionModel::Measurement {
                camera.distortion /= focal * focal;
            }
        }
        for point in points.iter_mut() {
            for x in point.position.iter_mut() {
                *x *= depth;
            }
        }
    }

    /// Undo [`Self::normalize`] on cameras and points.
    pub fn denormalize(&self, cameras: &mut [Camera], points: &mut [Point]) {
        if self.focal_scale == 1.0 && self.depth_scale == 1.0 {
            return;
        }
        self.rescale(cameras, points, 1.0 / self.focal_scale, 1.0 / self.depth_scale);
    }
}
