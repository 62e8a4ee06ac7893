use glam::{DMat3, DVec3};

use crate::config::DampingMode;
use crate::jacobian::{active_camera_parameters, JacobianStore, Linearization, ParameterLayout};
use crate::parallel::WorkerPool;
use crate::types::{CAMERA_PARAMS, POINT_PARAMS};

/// Lower clamp of `diag(J^T J)` entries used for scale-invariant damping.
pub const DIAGONAL_MIN: f64 = 1e-6;
/// Upper clamp of `diag(J^T J)` entries used for scale-invariant damping.
pub const DIAGONAL_MAX: f64 = 1e32;

const CAMERA_BLOCK: usize = CAMERA_PARAMS * CAMERA_PARAMS;

/// Block-diagonal approximation of the damped normal matrix and its inverse.
///
/// [`Self::build`] accumulates the undamped `J^T J` blocks once per
/// linearization; [`Self::factorize`] adds damping and inverts every block for
/// each LM trial.
#[derive(Debug, Clone)]
pub struct BlockPreconditioner {
    layout: ParameterLayout,
    camera_hessian: Vec<[f64; CAMERA_BLOCK]>,
    point_hessian: Vec<DMat3>,
    camera_inverse: Vec<[f64; CAMERA_BLOCK]>,
    point_inverse: Vec<DMat3>,
    diagonal: Vec<f64>,
    active: Vec<bool>,
    // one flag per camera block, then one per point block
    failed: Vec<bool>,
}

impl BlockPreconditioner {
    /// Allocate the blocks for a parameter layout.
    pub fn new(layout: ParameterLayout) -> Self {
        Self {
            layout,
            camera_hessian: vec![[0.0; CAMERA_BLOCK]; layout.num_cameras],
            point_hessian: vec![DMat3::ZERO; layout.num_points],
            camera_inverse: vec![[0.0; CAMERA_BLOCK]; layout.num_cameras],
            point_inverse: vec![DMat3::ZERO; layout.num_points],
            diagonal: vec![0.0; layout.len()],
            active: vec![true; layout.len()],
            failed: vec![false; layout.num_cameras + layout.num_points],
        }
    }

    /// Accumulate `sum Jc^T Jc` per camera and `sum Jp^T Jp` per point.
    pub fn build(&mut self, pool: &WorkerPool, lin: &Linearization<'_>, store: &dyn JacobianStore) {
        let layout = self.layout;
        debug_assert_eq!(layout, lin.layout());

        pool.for_each_block(&mut self.camera_hessian, 1, |c, h| {
            let h = &mut h[0];
            h.fill(0.0);
            if lin.cameras[c].fixed {
                return;
            }
            for &obs in lin.index.camera_observations(c) {
                let jac = store.block(lin, obs);
                for row in &jac.camera {
                    for i in 0..CAMERA_PARAMS {
                        for j in 0..CAMERA_PARAMS {
                            h[i * CAMERA_PARAMS + j] += row[i] * row[j];
                        }
                    }
                }
            }
        });

        pool.for_each_block(&mut self.point_hessian, 1, |p, h| {
            let mut sum = DMat3::ZERO;
            for &obs in lin.index.point_observations(p) {
                let jac = store.block(lin, obs);
                for row in &jac.point {
                    let r = DVec3::from_array(*row);
                    sum += DMat3::from_cols(r * r.x, r * r.y, r * r.z);
                }
            }
            h[0] = sum;
        });

        let (cam_active, _) = self.active.split_at_mut(layout.camera_len());
        pool.for_each_block(cam_active, CAMERA_PARAMS, |c, a| {
            a.copy_from_slice(&active_camera_parameters(
                &lin.cameras[c],
                lin.model,
                lin.fix_intrinsics,
            ));
        });

        let camera_hessian = &self.camera_hessian;
        let point_hessian = &self.point_hessian;
        let (cam_diag, pt_diag) = self.diagonal.split_at_mut(layout.camera_len());
        pool.for_each_block(cam_diag, CAMERA_PARAMS, |c, d| {
            for (i, di) in d.iter_mut().enumerate() {
                *di = camera_hessian[c][i * CAMERA_PARAMS + i];
            }
        });
        pool.for_each_block(pt_diag, POINT_PARAMS, |p, d| {
            for (i, di) in d.iter_mut().enumerate() {
                *di = point_hessian[p].col(i)[i];
            }
        });
    }

    /// Pre-damping diagonal of `J^T J`.
    pub fn diagonal(&self) -> &[f64] {
        &self.diagonal
    }

    /// Whether each parameter is optimized.
    pub fn active(&self) -> &[bool] {
        &self.active
    }

    /// Write `lambda * D` into `out`, zero on inactive parameters.
    pub fn fill_damping(&self, mode: DampingMode, lambda: f64, out: &mut [f64]) {
        let diagonal = self.diagonal.iter().zip(&self.active);
        for (o, (d, &active)) in out.iter_mut().zip(diagonal) {
            *o = match (active, mode) {
                (false, _) => 0.0,
                (true, DampingMode::ScaleInvariant) => lambda * d.clamp(DIAGONAL_MIN, DIAGONAL_MAX),
                (true, DampingMode::Isotropic) => lambda,
            };
        }
    }

    /// Invert every damped block `H_b + diag(damping_b)`.
    ///
    /// # Arguments
    ///
    /// * `pool` - Worker pool.
    /// * `damping` - `lambda * D`, laid out like the parameter vector.
    ///
    /// # Returns
    ///
    /// The number of blocks that could not be inverted. Their inverse is zero,
    /// which freezes the parameters of that block for the current trial.
    pub fn factorize(&mut self, pool: &WorkerPool, damping: &[f64]) -> usize {
        let layout = self.layout;
        let camera_hessian = &self.camera_hessian;
        let point_hessian = &self.point_hessian;
        let active = &self.active;
        let (camera_failed, point_failed) = self.failed.split_at_mut(layout.num_cameras);

        pool.for_each_block_pair(
            &mut self.camera_inverse,
            1,
            camera_failed,
            1,
            |c, inv, failed| {
                let off = layout.camera_offset(c);
                let mask = &active[off..off + CAMERA_PARAMS];
                let mut damped = camera_hessian[c];
                for i in 0..CAMERA_PARAMS {
                    damped[i * CAMERA_PARAMS + i] += damping[off + i];
                }
                failed[0] = !invert_active_block(&damped, mask, &mut inv[0]);
            },
        );

        pool.for_each_block_pair(
            &mut self.point_inverse,
            1,
            point_failed,
            1,
            |p, inv, failed| {
                let off = layout.point_offset(p);
                let damped = point_hessian[p]
                    + DMat3::from_diagonal(DVec3::from_slice(&damping[off..off + POINT_PARAMS]));
                let inverse = invert_point_block(&damped);
                failed[0] = inverse.is_none();
                inv[0] = inverse.unwrap_or(DMat3::ZERO);
            },
        );

        let failed = self.failed.iter().filter(|f| **f).count();
        if failed > 0 {
            log::warn!("{failed} preconditioner blocks are not invertible and were disabled");
        }
        failed
    }

    /// `out = M^-1 * v` over the whole parameter vector.
    pub fn apply(&self, pool: &WorkerPool, v: &[f64], out: &mut [f64]) {
        let layout = self.layout;
        let (cam_out, pt_out) = out.split_at_mut(layout.camera_len());
        self.apply_cameras(pool, &v[..layout.camera_len()], cam_out);
        pool.for_each_block(pt_out, POINT_PARAMS, |p, o| {
            let off = layout.point_offset(p);
            let r = self.apply_point(p, &v[off..off + POINT_PARAMS]);
            o.copy_from_slice(&r);
        });
    }

    /// `out = M_c^-1 * v` over the camera segment only.
    pub fn apply_cameras(&self, pool: &WorkerPool, v: &[f64], out: &mut [f64]) {
        pool.for_each_block(out, CAMERA_PARAMS, |c, o| {
            let inv = &self.camera_inverse[c];
            let x = &v[c * CAMERA_PARAMS..(c + 1) * CAMERA_PARAMS];
            for (i, oi) in o.iter_mut().enumerate() {
                let row = &inv[i * CAMERA_PARAMS..(i + 1) * CAMERA_PARAMS];
                *oi = row.iter().zip(x).map(|(a, b)| a * b).sum();
            }
        });
    }

    /// Inverse of the damped point block times `v`.
    #[inline]
    pub fn apply_point(&self, point: usize, v: &[f64]) -> [f64; POINT_PARAMS] {
        (self.point_inverse[point] * DVec3::from_slice(v)).to_array()
    }
}

/// Invert the sub-block selected by `mask` with a Cholesky factorization.
///
/// Rows and columns outside the mask are zero in `out`. Returns `false`, with a
/// zero `out`, when the sub-block is not positive definite.
fn invert_active_block(
    a: &[f64; CAMERA_BLOCK],
    mask: &[bool],
    out: &mut [f64; CAMERA_BLOCK],
) -> bool {
    out.fill(0.0);
    let mut idx = [0usize; CAMERA_PARAMS];
    let mut n = 0;
    for i in (0..CAMERA_PARAMS).filter(|&i| mask[i]) {
        idx[n] = i;
        n += 1;
    }
    if n == 0 {
        return true;
    }

    // lower triangular factor, row-major n x n
    let mut l = [0.0; CAMERA_BLOCK];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[idx[i] * CAMERA_PARAMS + idx[j]];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return false;
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    // m = L^-1, lower triangular
    let mut m = [0.0; CAMERA_BLOCK];
    for i in 0..n {
        m[i * n + i] = 1.0 / l[i * n + i];
        for j in 0..i {
            let mut sum = 0.0;
            for k in j..i {
                sum -= l[i * n + k] * m[k * n + j];
            }
            m[i * n + j] = sum / l[i * n + i];
        }
    }

    // A^-1 = M^T M
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in i..n {
                sum += m[k * n + i] * m[k * n + j];
            }
            out[idx[i] * CAMERA_PARAMS + idx[j]] = sum;
            out[idx[j] * CAMERA_PARAMS + idx[i]] = sum;
        }
    }
    true
}

/// Inverse of a 3x3 point block.
///
/// Returns `None` when the determinant is zero, subnormal or not finite.
fn invert_point_block(m: &DMat3) -> Option<DMat3> {
    if !m.determinant().is_normal() {
        return None;
    }
    Some(m.inverse())
}
