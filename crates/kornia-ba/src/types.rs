use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};

/// Number of optimized scalars per camera: `[f, tx, ty, tz, wx, wy, wz, d]`.
pub const CAMERA_PARAMS: usize = 8;

/// Number of optimized scalars per point: `[x, y, z]`.
pub const POINT_PARAMS: usize = 3;

/// Offset of the focal length in a camera parameter block.
pub(crate) const FOCAL_IDX: usize = 0;
/// Offset of the translation in a camera parameter block.
pub(crate) const TRANSLATION_IDX: usize = 1;
/// Offset of the incremental rotation in a camera parameter block.
pub(crate) const ROTATION_IDX: usize = 4;
/// Offset of the radial distortion in a camera parameter block.
pub(crate) const DISTORTION_IDX: usize = 7;

/// Radial distortion model of a camera.
///
/// The two non-trivial variants are not equivalent. They are both kept so that
/// cameras estimated under either convention can be refined without conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistortionModel {
    /// Plain pinhole projection `f * u`.
    #[default]
    None,
    /// Distortion applied to the projection on normalized coordinates:
    /// `f * (1 + d * |u|^2) * u`.
    Projection,
    /// Measurement divided by the modeled distortion in pixel units:
    /// `m / (1 + d * |m|^2)` is compared against `f * u`.
    Measurement,
}

/// A pinhole camera with a single focal length and one radial coefficient.
///
/// A world point `X` maps to camera coordinates as `R * X + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Focal length in pixels.
    pub focal: f64,
    /// World-to-camera rotation, row-major.
    pub rotation: [[f64; 3]; 3],
    /// World-to-camera translation.
    pub translation: [f64; 3],
    /// Radial distortion coefficient.
    pub distortion: f64,
    /// The model `distortion` was estimated under.
    pub distortion_model: DistortionModel,
    /// Exclude the camera from optimization.
    pub fixed: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            focal: 1.0,
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0; 3],
            distortion: 0.0,
            distortion_model: DistortionModel::None,
            fixed: false,
        }
    }
}

impl Camera {
    /// Create a camera without distortion.
    ///
    /// # Arguments
    ///
    /// * `focal` - Focal length in pixels.
    /// * `rotation` - World-to-camera rotation, row-major.
    /// * `translation` - World-to-camera translation.
    pub fn new(focal: f64, rotation: [[f64; 3]; 3], translation: [f64; 3]) -> Self {
        Self {
            focal,
            rotation,
            translation,
            ..Default::default()
        }
    }

    /// Set the radial distortion coefficient and its model.
    pub fn with_distortion(mut self, distortion: f64, model: DistortionModel) -> Self {
        self.distortion = distortion;
        self.distortion_model = model;
        self
    }

    /// Mark the camera as fixed.
    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    /// Rotation as a glam matrix.
    pub fn rotation_matrix(&self) -> DMat3 {
        // glam is column-major, the stored rows become columns and are transposed back
        DMat3::from_cols_array_2d(&self.rotation).transpose()
    }

    /// Overwrite the rotation from a glam matrix.
    pub fn set_rotation_matrix(&mut self, rotation: &DMat3) {
        self.rotation = rotation.transpose().to_cols_array_2d();
    }

    /// Translation as a glam vector.
    pub fn translation_vector(&self) -> DVec3 {
        DVec3::from_array(self.translation)
    }

    /// Transform a world point into the camera frame.
    #[inline]
    pub fn transform(&self, point: &Point) -> DVec3 {
        self.rotation_matrix() * point.vector() + self.translation_vector()
    }

    /// Camera center in world coordinates, `-R^T t`.
    pub fn center(&self) -> DVec3 {
        -(self.rotation_matrix().transpose() * self.translation_vector())
    }
}

/// A 3D point in world coordinates.
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// Position `[x, y, z]`.
    pub position: [f64; 3],
}

impl Point {
    /// Create a point from its coordinates.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: [x, y, z],
        }
    }

    /// Position as a glam vector.
    #[inline]
    pub fn vector(&self) -> DVec3 {
        DVec3::from_array(self.position)
    }
}

impl From<[f64; 3]> for Point {
    fn from(position: [f64; 3]) -> Self {
        Self { position }
    }
}

/// A 2D measurement of a point in a camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Index into the camera array.
    pub camera: usize,
    /// Index into the point array.
    pub point: usize,
    /// Measured image position, relative to the principal point.
    pub measurement: [f64; 2],
}

impl Observation {
    /// Create an observation.
    pub fn new(camera: usize, point: usize, measurement: [f64; 2]) -> Self {
        Self {
            camera,
            point,
            measurement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rotation_roundtrip() {
        let rows = [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let mut cam = Camera::new(500.0, rows, [0.1, 0.2, 0.3]);
        let r = cam.rotation_matrix();
        // row 0 of the stored matrix is the first row of glam's matrix
        assert_eq!(r.row(0), DVec3::new(0.0, -1.0, 0.0));
        cam.set_rotation_matrix(&r);
        assert_eq!(cam.rotation, rows);
    }

    #[test]
    fn test_transform_and_center() {
        let rows = [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let cam = Camera::new(500.0, rows, [1.0, 2.0, 3.0]);
        let p = Point::new(1.0, 0.0, 0.0);
        let pc = cam.transform(&p);
        assert_relative_eq!(pc.x, 1.0);
        assert_relative_eq!(pc.y, 3.0);
        assert_relative_eq!(pc.z, 3.0);

        let c = cam.center();
        let at_center = cam.transform(&Point::from(c.to_array()));
        assert!(at_center.length() < 1e-12);
    }
}
