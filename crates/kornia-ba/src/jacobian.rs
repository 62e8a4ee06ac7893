//! Closed-form Jacobian of the reprojection residuals and its storage policies.
//!
//! The Jacobian is taken of the predicted measurement, `J = -d(residual)/d(params)`,
//! so the damped normal equations read `(J^T J + lambda * D) dx = J^T e`.

use glam::DVec3;

use crate::config::JacobianStorage;
use crate::index::ObservationIndex;
use crate::parallel::WorkerPool;
use crate::projection::Projection;
use crate::types::{
    Camera, DistortionModel, Observation, Point, CAMERA_PARAMS, DISTORTION_IDX, FOCAL_IDX,
    POINT_PARAMS, ROTATION_IDX, TRANSLATION_IDX,
};

/// Layout of the flat parameter vector: all cameras first, then all points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    /// Number of cameras.
    pub num_cameras: usize,
    /// Number of points.
    pub num_points: usize,
}

impl ParameterLayout {
    /// Create a layout.
    pub fn new(num_cameras: usize, num_points: usize) -> Self {
        Self {
            num_cameras,
            num_points,
        }
    }

    /// Length of the camera segment.
    #[inline]
    pub fn camera_len(&self) -> usize {
        self.num_cameras * CAMERA_PARAMS
    }

    /// Length of the point segment.
    #[inline]
    pub fn point_len(&self) -> usize {
        self.num_points * POINT_PARAMS
    }

    /// Total number of parameters.
    #[inline]
    pub fn len(&self) -> usize {
        self.camera_len() + self.point_len()
    }

    /// Whether the layout holds no parameters.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of a camera block.
    #[inline]
    pub fn camera_offset(&self, camera: usize) -> usize {
        camera * CAMERA_PARAMS
    }

    /// Offset of a point block.
    #[inline]
    pub fn point_offset(&self, point: usize) -> usize {
        self.camera_len() + point * POINT_PARAMS
    }
}

/// Jacobian blocks of a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObservationJacobian {
    /// 2x8 block w.r.t. the camera `[f, t, w, d]`, one row per residual.
    pub camera: [[f64; CAMERA_PARAMS]; 2],
    /// 2x3 block w.r.t. the point.
    pub point: [[f64; POINT_PARAMS]; 2],
}

impl ObservationJacobian {
    /// `Jc * xc + Jp * xp`.
    #[inline]
    pub fn apply(&self, xc: &[f64], xp: &[f64]) -> [f64; 2] {
        let mut out = [0.0; 2];
        for (r, o) in out.iter_mut().enumerate() {
            *o = dot8(&self.camera[r], xc) + dot3(&self.point[r], xp);
        }
        out
    }

    /// `Jc * xc`.
    #[inline]
    pub fn apply_camera(&self, xc: &[f64]) -> [f64; 2] {
        [dot8(&self.camera[0], xc), dot8(&self.camera[1], xc)]
    }

    /// `Jp * xp`.
    #[inline]
    pub fn apply_point(&self, xp: &[f64]) -> [f64; 2] {
        [dot3(&self.point[0], xp), dot3(&self.point[1], xp)]
    }

    /// `out += Jc^T e`.
    #[inline]
    pub fn accumulate_camera(&self, e: [f64; 2], out: &mut [f64]) {
        for (j, o) in out.iter_mut().enumerate().take(CAMERA_PARAMS) {
            *o += self.camera[0][j] * e[0] + self.camera[1][j] * e[1];
        }
    }

    /// `out += Jp^T e`.
    #[inline]
    pub fn accumulate_point(&self, e: [f64; 2], out: &mut [f64]) {
        for (j, o) in out.iter_mut().enumerate().take(POINT_PARAMS) {
            *o += self.point[0][j] * e[0] + self.point[1][j] * e[1];
        }
    }

    fn scale(&mut self, camera_scale: &[f64], point_scale: &[f64]) {
        for row in 0..2 {
            for (j, s) in camera_scale.iter().enumerate() {
                self.camera[row][j] *= s;
            }
            for (j, s) in point_scale.iter().enumerate() {
                self.point[row][j] *= s;
            }
        }
    }
}

#[inline]
fn dot8(a: &[f64; CAMERA_PARAMS], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn dot3(a: &[f64; POINT_PARAMS], b: &[f64]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Which camera parameters are optimized.
pub fn active_camera_parameters(
    camera: &Camera,
    model: DistortionModel,
    fix_intrinsics: bool,
) -> [bool; CAMERA_PARAMS] {
    if camera.fixed {
        return [false; CAMERA_PARAMS];
    }
    let mut active = [true; CAMERA_PARAMS];
    active[FOCAL_IDX] = !fix_intrinsics;
    active[DISTORTION_IDX] = !fix_intrinsics && model != DistortionModel::None;
    active
}

/// Closed-form Jacobian blocks of one observation.
///
/// # Arguments
///
/// * `camera` - Camera of the observation.
/// * `point` - Point of the observation.
/// * `measurement` - Measured image position.
/// * `model` - Distortion model.
/// * `fix_intrinsics` - Zero the focal length and distortion columns.
pub fn observation_jacobian(
    camera: &Camera,
    point: &Point,
    measurement: [f64; 2],
    model: DistortionModel,
    fix_intrinsics: bool,
) -> ObservationJacobian {
    let proj = Projection::new(camera, point);
    let pc = proj.camera_point;
    let [u, v] = proj.normalized;
    let f = camera.focal;
    let d = camera.distortion;
    let rho2 = proj.radius_squared();

    // A = d(pixel) / d(normalized), 2x2
    let (k, a) = match model {
        DistortionModel::Projection => {
            let k = 1.0 + d * rho2;
            let a = [
                [f * (k + 2.0 * d * u * u), f * 2.0 * d * u * v],
                [f * 2.0 * d * u * v, f * (k + 2.0 * d * v * v)],
            ];
            (k, a)
        }
        DistortionModel::None | DistortionModel::Measurement => (1.0, [[f, 0.0], [0.0, f]]),
    };

    // G = A * d(normalized) / d(camera point), 2x3
    let inv_z = 1.0 / pc.z;
    let p = [[inv_z, 0.0, -u * inv_z], [0.0, inv_z, -v * inv_z]];
    let mut g = [[0.0; 3]; 2];
    for (r, g_row) in g.iter_mut().enumerate() {
        for (c, g_rc) in g_row.iter_mut().enumerate() {
            *g_rc = a[r][0] * p[0][c] + a[r][1] * p[1][c];
        }
    }
    let g_times = |w: DVec3| -> [f64; 2] {
        [
            g[0][0] * w.x + g[0][1] * w.y + g[0][2] * w.z,
            g[1][0] * w.x + g[1][1] * w.y + g[1][2] * w.z,
        ]
    };

    let mut jac = ObservationJacobian::default();

    let rotation = camera.rotation_matrix();
    for c in 0..3 {
        let col = g_times(rotation.col(c));
        jac.point[0][c] = col[0];
        jac.point[1][c] = col[1];
    }

    let active = active_camera_parameters(camera, model, fix_intrinsics);
    if camera.fixed {
        return jac;
    }

    if active[FOCAL_IDX] {
        jac.camera[0][FOCAL_IDX] = k * u;
        jac.camera[1][FOCAL_IDX] = k * v;
    }

    for c in 0..3 {
        jac.camera[0][TRANSLATION_IDX + c] = g[0][c];
        jac.camera[1][TRANSLATION_IDX + c] = g[1][c];
    }

    // left increment: d(exp(w) * R * X) / dw = -[R X]x, so column c is e_c x (R X)
    let rx = rotation * point.vector();
    let axes = [DVec3::X, DVec3::Y, DVec3::Z];
    for (c, axis) in axes.iter().enumerate() {
        let col = g_times(axis.cross(rx));
        jac.camera[0][ROTATION_IDX + c] = col[0];
        jac.camera[1][ROTATION_IDX + c] = col[1];
    }

    if active[DISTORTION_IDX] {
        let (dx, dy) = match model {
            DistortionModel::Projection => (f * rho2 * u, f * rho2 * v),
            DistortionModel::Measurement => {
                let m2 = measurement[0] * measurement[0] + measurement[1] * measurement[1];
                let denom = 1.0 + d * m2;
                let s = m2 / (denom * denom);
                (measurement[0] * s, measurement[1] * s)
            }
            DistortionModel::None => (0.0, 0.0),
        };
        jac.camera[0][DISTORTION_IDX] = dx;
        jac.camera[1][DISTORTION_IDX] = dy;
    }

    jac
}

/// The point at which the Jacobian is evaluated.
#[derive(Debug, Clone, Copy)]
pub struct Linearization<'a> {
    /// Camera parameters.
    pub cameras: &'a [Camera],
    /// Point positions.
    pub points: &'a [Point],
    /// Observations.
    pub observations: &'a [Observation],
    /// Observations grouped by camera and by point.
    pub index: &'a ObservationIndex,
    /// Distortion model.
    pub model: DistortionModel,
    /// Keep focal length and distortion constant.
    pub fix_intrinsics: bool,
    /// Per-parameter column scaling, laid out like the parameter vector.
    pub scaling: Option<&'a [f64]>,
}

impl Linearization<'_> {
    /// Parameter layout.
    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout::new(self.cameras.len(), self.points.len())
    }

    /// Blocks of observation `obs`, with the column scaling applied.
    pub fn evaluate_block(&self, obs: usize) -> ObservationJacobian {
        let o = &self.observations[obs];
        let mut jac = observation_jacobian(
            &self.cameras[o.camera],
            &self.points[o.point],
            o.measurement,
            self.model,
            self.fix_intrinsics,
        );
        if let Some(scaling) = self.scaling {
            let layout = self.layout();
            let cam = layout.camera_offset(o.camera);
            let pt = layout.point_offset(o.point);
            jac.scale(
                &scaling[cam..cam + CAMERA_PARAMS],
                &scaling[pt..pt + POINT_PARAMS],
            );
        }
        jac
    }
}

/// Per-parameter Jacobian column scaling `1 / (1 + |J_col|)`.
///
/// Computed from an unscaled pass, whatever `lin.scaling` holds.
pub fn column_scaling(pool: &WorkerPool, lin: &Linearization<'_>) -> Vec<f64> {
    let unscaled = Linearization {
        scaling: None,
        ..*lin
    };
    let layout = lin.layout();
    let mut scaling = vec![0.0; layout.len()];
    let (cam_seg, pt_seg) = scaling.split_at_mut(layout.camera_len());

    pool.for_each_block(cam_seg, CAMERA_PARAMS, |c, out| {
        for &obs in lin.index.camera_observations(c) {
            let jac = unscaled.evaluate_block(obs);
            for (j, o) in out.iter_mut().enumerate() {
                *o += jac.camera[0][j] * jac.camera[0][j] + jac.camera[1][j] * jac.camera[1][j];
            }
        }
    });
    pool.for_each_block(pt_seg, POINT_PARAMS, |p, out| {
        for &obs in lin.index.point_observations(p) {
            let jac = unscaled.evaluate_block(obs);
            for (j, o) in out.iter_mut().enumerate() {
                *o += jac.point[0][j] * jac.point[0][j] + jac.point[1][j] * jac.point[1][j];
            }
        }
    });

    pool.for_each_block(&mut scaling, 1, |_, s| s[0] = 1.0 / (1.0 + s[0].sqrt()));
    scaling
}

/// Storage policy of the Jacobian between matrix-vector products.
///
/// All implementations produce bit-identical products: blocks are computed by
/// the same routine and accumulated in the same order.
pub trait JacobianStore: Send + Sync {
    /// The storage policy implemented.
    fn storage(&self) -> JacobianStorage;

    /// Evaluate the Jacobian at `lin`, replacing anything stored before.
    fn evaluate(&mut self, pool: &WorkerPool, lin: &Linearization<'_>);

    /// Blocks of observation `obs`.
    fn block(&self, lin: &Linearization<'_>, obs: usize) -> ObservationJacobian;

    /// `out = J * x`, with `out` of length `2 * num_observations`.
    fn multiply(&self, pool: &WorkerPool, lin: &Linearization<'_>, x: &[f64], out: &mut [f64]) {
        let layout = lin.layout();
        pool.for_each_block(out, 2, |i, o| {
            let obs = &lin.observations[i];
            let cam = layout.camera_offset(obs.camera);
            let pt = layout.point_offset(obs.point);
            let r = self.block(lin, i).apply(
                &x[cam..cam + CAMERA_PARAMS],
                &x[pt..pt + POINT_PARAMS],
            );
            o[0] = r[0];
            o[1] = r[1];
        });
    }

    /// `out = J^T * e`, with `out` laid out like the parameter vector.
    fn multiply_transpose(
        &self,
        pool: &WorkerPool,
        lin: &Linearization<'_>,
        e: &[f64],
        out: &mut [f64],
    ) {
        let layout = lin.layout();
        let (cam_seg, pt_seg) = out.split_at_mut(layout.camera_len());
        pool.for_each_block(cam_seg, CAMERA_PARAMS, |c, o| {
            o.fill(0.0);
            for &obs in lin.index.camera_observations(c) {
                self.block(lin, obs)
                    .accumulate_camera([e[2 * obs], e[2 * obs + 1]], o);
            }
        });
        transpose_points(self, pool, lin, e, pt_seg);
    }
}

fn transpose_points<S: JacobianStore + ?Sized>(
    store: &S,
    pool: &WorkerPool,
    lin: &Linearization<'_>,
    e: &[f64],
    pt_seg: &mut [f64],
) {
    pool.for_each_block(pt_seg, POINT_PARAMS, |p, o| {
        o.fill(0.0);
        for &obs in lin.index.point_observations(p) {
            store
                .block(lin, obs)
                .accumulate_point([e[2 * obs], e[2 * obs + 1]], o);
        }
    });
}

/// Keeps nothing, every product re-evaluates the blocks it needs.
#[derive(Debug, Default)]
pub struct ImplicitJacobian;

impl JacobianStore for ImplicitJacobian {
    fn storage(&self) -> JacobianStorage {
        JacobianStorage::Implicit
    }

    fn evaluate(&mut self, _pool: &WorkerPool, _lin: &Linearization<'_>) {}

    fn block(&self, lin: &Linearization<'_>, obs: usize) -> ObservationJacobian {
        lin.evaluate_block(obs)
    }
}

/// Keeps the blocks indexed by observation.
#[derive(Debug, Default)]
pub struct ObservationJacobians {
    blocks: Vec<ObservationJacobian>,
}

impl JacobianStore for ObservationJacobians {
    fn storage(&self) -> JacobianStorage {
        JacobianStorage::ObservationOrder
    }

    fn evaluate(&mut self, pool: &WorkerPool, lin: &Linearization<'_>) {
        self.blocks
            .resize(lin.observations.len(), ObservationJacobian::default());
        pool.for_each_block(&mut self.blocks, 1, |i, b| b[0] = lin.evaluate_block(i));
    }

    fn block(&self, _lin: &Linearization<'_>, obs: usize) -> ObservationJacobian {
        self.blocks[obs]
    }
}

/// Keeps the blocks by observation plus the camera blocks grouped by camera,
/// so `J^T e` over the camera segment streams through contiguous memory.
#[derive(Debug, Default)]
pub struct CameraSortedJacobians {
    inner: ObservationJacobians,
    camera_blocks: Vec<[[f64; CAMERA_PARAMS]; 2]>,
}

impl JacobianStore for CameraSortedJacobians {
    fn storage(&self) -> JacobianStorage {
        JacobianStorage::CameraSorted
    }

    fn evaluate(&mut self, pool: &WorkerPool, lin: &Linearization<'_>) {
        self.inner.evaluate(pool, lin);
        let order = lin.index.camera_order();
        let blocks = &self.inner.blocks;
        self.camera_blocks
            .resize(order.len(), [[0.0; CAMERA_PARAMS]; 2]);
        pool.for_each_block(&mut self.camera_blocks, 1, |k, b| {
            b[0] = blocks[order[k]].camera;
        });
    }

    fn block(&self, lin: &Linearization<'_>, obs: usize) -> ObservationJacobian {
        self.inner.block(lin, obs)
    }

    fn multiply_transpose(
        &self,
        pool: &WorkerPool,
        lin: &Linearization<'_>,
        e: &[f64],
        out: &mut [f64],
    ) {
        let layout = lin.layout();
        let order = lin.index.camera_order();
        let (cam_seg, pt_seg) = out.split_at_mut(layout.camera_len());
        pool.for_each_block(cam_seg, CAMERA_PARAMS, |c, o| {
            o.fill(0.0);
            for k in lin.index.camera_range(c) {
                let obs = order[k];
                let jac = ObservationJacobian {
                    camera: self.camera_blocks[k],
                    ..Default::default()
                };
                jac.accumulate_camera([e[2 * obs], e[2 * obs + 1]], o);
            }
        });
        transpose_points(self, pool, lin, e, pt_seg);
    }
}

/// Create the store for a storage policy.
pub fn create_store(storage: JacobianStorage) -> Box<dyn JacobianStore> {
    match storage {
        JacobianStorage::Implicit => Box::new(ImplicitJacobian),
        JacobianStorage::ObservationOrder => Box::new(ObservationJacobians::default()),
        JacobianStorage::CameraSorted => Box::new(CameraSortedJacobians::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::residual;
    use crate::rotation::rodrigues;

    fn test_camera(model: DistortionModel) -> Camera {
        let r = rodrigues(DVec3::new(0.1, -0.2, 0.05));
        let mut cam = Camera::new(1.3, [[0.0; 3]; 3], [0.2, -0.1, 3.0]);
        cam.set_rotation_matrix(&r);
        match model {
            DistortionModel::None => cam,
            DistortionModel::Projection => cam.with_distortion(-0.08, model),
            DistortionModel::Measurement => cam.with_distortion(0.05, model),
        }
    }

    fn perturbed(cam: &Camera, param: usize, h: f64) -> Camera {
        let mut c = *cam;
        match param {
            FOCAL_IDX => c.focal += h,
            1..=3 => c.translation[param - 1] += h,
            4..=6 => {
                let mut w = DVec3::ZERO;
                w[param - ROTATION_IDX] = h;
                c.set_rotation_matrix(&(rodrigues(w) * cam.rotation_matrix()));
            }
            _ => c.distortion += h,
        }
        c
    }

    fn check_against_central_differences(model: DistortionModel) {
        let cam = test_camera(model);
        let point = Point::new(0.4, -0.3, 1.5);
        let m = [0.31, -0.22];
        let jac = observation_jacobian(&cam, &point, m, model, false);
        let h = 1e-6;

        let numeric = |plus: [f64; 2], minus: [f64; 2]| {
            // J = -d(residual)/dp
            [-(plus[0] - minus[0]) / (2.0 * h), -(plus[1] - minus[1]) / (2.0 * h)]
        };

        for j in 0..CAMERA_PARAMS {
            let rp = residual(&perturbed(&cam, j, h), &point, m, model);
            let rm = residual(&perturbed(&cam, j, -h), &point, m, model);
            let n = numeric(rp, rm);
            for r in 0..2 {
                let a = jac.camera[r][j];
                let tol = 1e-4 * a.abs().max(1.0);
                assert!(
                    (a - n[r]).abs() < tol,
                    "{model:?} camera param {j} row {r}: analytic {a} numeric {}",
                    n[r]
                );
            }
        }

        for j in 0..POINT_PARAMS {
            let mut pp = point;
            let mut pm = point;
            pp.position[j] += h;
            pm.position[j] -= h;
            let n = numeric(
                residual(&cam, &pp, m, model),
                residual(&cam, &pm, m, model),
            );
            for r in 0..2 {
                let a = jac.point[r][j];
                assert!((a - n[r]).abs() < 1e-4 * a.abs().max(1.0));
            }
        }
    }

    #[test]
    fn test_jacobian_no_distortion() {
        check_against_central_differences(DistortionModel::None);
    }

    #[test]
    fn test_jacobian_projection_distortion() {
        check_against_central_differences(DistortionModel::Projection);
    }

    #[test]
    fn test_jacobian_measurement_distortion() {
        check_against_central_differences(DistortionModel::Measurement);
    }

    #[test]
    fn test_fixed_camera_block_is_zero() {
        let cam = test_camera(DistortionModel::Projection).with_fixed(true);
        let jac = observation_jacobian(
            &cam,
            &Point::new(0.1, 0.2, 1.0),
            [0.0, 0.0],
            DistortionModel::Projection,
            false,
        );
        assert_eq!(jac.camera, [[0.0; CAMERA_PARAMS]; 2]);
        assert!(jac.point[0].iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_fixed_intrinsics_columns() {
        let cam = test_camera(DistortionModel::Projection);
        let jac = observation_jacobian(
            &cam,
            &Point::new(0.1, 0.2, 1.0),
            [0.0, 0.0],
            DistortionModel::Projection,
            true,
        );
        for row in jac.camera {
            assert_eq!(row[FOCAL_IDX], 0.0);
            assert_eq!(row[DISTORTION_IDX], 0.0);
            assert!(row[TRANSLATION_IDX] != 0.0 || row[TRANSLATION_IDX + 1] != 0.0);
        }
    }

    #[test]
    fn test_storage_policies_agree() -> Result<(), Box<dyn std::error::Error>> {
        let pool = WorkerPool::new(3)?;
        let cameras = vec![
            test_camera(DistortionModel::Projection),
            Camera::new(1.1, [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]], [0.5, 0.0, 2.5])
                .with_distortion(0.01, DistortionModel::Projection),
        ];
        let points: Vec<Point> = (0..5)
            .map(|i| Point::new(0.1 * i as f64, -0.05 * i as f64, 1.0 + 0.2 * i as f64))
            .collect();
        let mut observations = Vec::new();
        for p in 0..points.len() {
            for c in (0..cameras.len()).rev() {
                observations.push(Observation::new(c, p, [0.01 * p as f64, -0.02]));
            }
        }
        let index = ObservationIndex::build(cameras.len(), points.len(), &observations)?;
        let mut lin = Linearization {
            cameras: &cameras,
            points: &points,
            observations: &observations,
            index: &index,
            model: DistortionModel::Projection,
            fix_intrinsics: false,
            scaling: None,
        };
        let scaling = column_scaling(&pool, &lin);
        assert!(scaling.iter().all(|s| *s > 0.0 && *s <= 1.0));
        lin.scaling = Some(&scaling);

        let layout = lin.layout();
        let x: Vec<f64> = (0..layout.len()).map(|i| (i as f64 * 0.7).cos()).collect();
        let e: Vec<f64> = (0..2 * observations.len())
            .map(|i| (i as f64 * 1.3).sin())
            .collect();

        let mut results = Vec::new();
        for storage in [
            JacobianStorage::Implicit,
            JacobianStorage::ObservationOrder,
            JacobianStorage::CameraSorted,
        ] {
            let mut store = create_store(storage);
            assert_eq!(store.storage(), storage);
            store.evaluate(&pool, &lin);
            let mut jx = vec![0.0; 2 * observations.len()];
            let mut jte = vec![0.0; layout.len()];
            store.multiply(&pool, &lin, &x, &mut jx);
            store.multiply_transpose(&pool, &lin, &e, &mut jte);
            results.push((jx, jte));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);

        // adjoint identity: e . (J x) == (J^T e) . x
        let (jx, jte) = &results[0];
        let lhs: f64 = e.iter().zip(jx).map(|(a, b)| a * b).sum();
        let rhs: f64 = jte.iter().zip(&x).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-10 * lhs.abs().max(1.0));
        Ok(())
    }
}
