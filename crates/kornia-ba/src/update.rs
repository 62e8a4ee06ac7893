use glam::DVec3;

use crate::jacobian::ParameterLayout;
use crate::parallel::WorkerPool;
use crate::rotation::rodrigues;
use crate::types::{
    Camera, Point, CAMERA_PARAMS, DISTORTION_IDX, FOCAL_IDX, POINT_PARAMS, ROTATION_IDX,
    TRANSLATION_IDX,
};

/// Lower bound on the focal length after an update.
pub const MIN_FOCAL: f64 = 1e-6;

/// Apply the update of one camera block.
///
/// The rotation is recomposed as `R' = exp([dw]x) * R`. The remaining
/// parameters are additive, and the focal length is floored at [`MIN_FOCAL`].
pub fn update_camera(camera: &Camera, delta: &[f64]) -> Camera {
    debug_assert_eq!(delta.len(), CAMERA_PARAMS);
    if camera.fixed {
        return *camera;
    }

    let mut out = *camera;
    if delta[FOCAL_IDX] != 0.0 {
        out.focal = (camera.focal + delta[FOCAL_IDX]).max(MIN_FOCAL);
    }
    for (i, t) in out.translation.iter_mut().enumerate() {
        *t += delta[TRANSLATION_IDX + i];
    }

    let omega = DVec3::from_slice(&delta[ROTATION_IDX..ROTATION_IDX + 3]);
    if omega != DVec3::ZERO {
        out.set_rotation_matrix(&(rodrigues(omega) * camera.rotation_matrix()));
    }

    out.distortion += delta[DISTORTION_IDX];
    out
}

/// Write `cameras + delta` and `points + delta` into the output arrays.
///
/// The inputs are left untouched, so a rejected trial simply drops the outputs.
///
/// # Arguments
///
/// * `pool` - Worker pool.
/// * `cameras` - Current cameras.
/// * `points` - Current points.
/// * `delta` - Update vector, camera segment first.
/// * `out_cameras` - Updated cameras, same length as `cameras`.
/// * `out_points` - Updated points, same length as `points`.
pub fn apply_update(
    pool: &WorkerPool,
    cameras: &[Camera],
    points: &[Point],
    delta: &[f64],
    out_cameras: &mut [Camera],
    out_points: &mut [Point],
) {
    let layout = ParameterLayout::new(cameras.len(), points.len());
    debug_assert_eq!(delta.len(), layout.len());

    pool.for_each_block(out_cameras, 1, |c, out| {
        let off = layout.camera_offset(c);
        out[0] = update_camera(&cameras[c], &delta[off..off + CAMERA_PARAMS]);
    });
    pool.for_each_block(out_points, 1, |p, out| {
        let off = layout.point_offset(p);
        let mut position = points[p].position;
        for (x, d) in position.iter_mut().zip(&delta[off..off + POINT_PARAMS]) {
            *x += d;
        }
        out[0] = Point { position };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ParallelError;
    use crate::rotation::orthonormality_error;
    use approx::assert_relative_eq;

    fn camera() -> Camera {
        let mut cam = Camera::new(1.5, [[0.0; 3]; 3], [0.1, 0.2, 3.0]);
        cam.set_rotation_matrix(&rodrigues(DVec3::new(0.3, -0.1, 0.2)));
        cam
    }

    #[test]
    fn test_zero_update_is_identity() {
        let cam = camera();
        assert_eq!(update_camera(&cam, &[0.0; CAMERA_PARAMS]), cam);
    }

    #[test]
    fn test_update_camera() {
        let cam = camera();
        let delta = [0.5, 1.0, -1.0, 0.5, 0.0, 0.0, 0.1, 0.01];
        let out = update_camera(&cam, &delta);
        assert_relative_eq!(out.focal, 2.0);
        for (t, e) in out.translation.iter().zip([1.1, -0.8, 3.5]) {
            assert_relative_eq!(*t, e, epsilon = 1e-15);
        }
        assert_relative_eq!(out.distortion, 0.01);

        let expected = rodrigues(DVec3::new(0.0, 0.0, 0.1)) * cam.rotation_matrix();
        for (a, b) in out
            .rotation_matrix()
            .to_cols_array()
            .iter()
            .zip(expected.to_cols_array().iter())
        {
            assert_relative_eq!(*a, *b, epsilon = 1e-15);
        }
        assert!(orthonormality_error(&out.rotation_matrix()) < 1e-14);
    }

    #[test]
    fn test_focal_floor() {
        let cam = camera();
        let mut delta = [0.0; CAMERA_PARAMS];
        delta[FOCAL_IDX] = -10.0;
        assert_eq!(update_camera(&cam, &delta).focal, MIN_FOCAL);
    }

    #[test]
    fn test_fixed_camera_is_untouched() {
        let cam = camera().with_fixed(true);
        let out = update_camera(&cam, &[1.0; CAMERA_PARAMS]);
        assert_eq!(out, cam);
    }

    #[test]
    fn test_apply_update() -> Result<(), ParallelError> {
        let pool = WorkerPool::new(2)?;
        let cameras = vec![camera(), camera().with_fixed(true)];
        let points = vec![Point::new(0.0, 0.0, 5.0), Point::new(1.0, 2.0, 3.0)];
        let mut delta = vec![0.0; 2 * CAMERA_PARAMS + 2 * POINT_PARAMS];
        delta[TRANSLATION_IDX] = 1.0;
        delta[CAMERA_PARAMS + TRANSLATION_IDX] = 1.0;
        delta[2 * CAMERA_PARAMS + 3..].copy_from_slice(&[0.5, -0.5, 1.0]);

        let mut out_cameras = cameras.clone();
        let mut out_points = points.clone();
        apply_update(&pool, &cameras, &points, &delta, &mut out_cameras, &mut out_points);

        assert_relative_eq!(out_cameras[0].translation[0], 1.1);
        assert_eq!(out_cameras[1], cameras[1]);
        assert_eq!(out_points[0], points[0]);
        assert_eq!(out_points[1].position, [1.5, 1.5, 4.0]);
        // the inputs are unchanged
        assert_relative_eq!(cameras[0].translation[0], 0.1);
        Ok(())
    }
}
