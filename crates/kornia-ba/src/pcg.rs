use std::fmt;

use crate::config::LinearSolverKind;
use crate::jacobian::{JacobianStore, Linearization};
use crate::parallel::WorkerPool;
use crate::preconditioner::BlockPreconditioner;
use crate::types::{CAMERA_PARAMS, POINT_PARAMS};

/// Outcome class of a PCG solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcgStatus {
    /// The relative residual dropped below the tolerance.
    Converged,
    /// The iteration ceiling was reached.
    MaxIterations,
    /// No step could be taken (zero right-hand side or zero curvature).
    Degenerate,
    /// The recurrence broke down; the best iterate was returned.
    Diverged,
}

/// Result of a PCG solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcgOutcome {
    /// Outcome class.
    pub status: PcgStatus,
    /// Number of iterations run.
    pub iterations: usize,
    /// Relative residual `|r| / |r_0|` of the returned iterate.
    pub relative_residual: f64,
}

impl PcgOutcome {
    fn degenerate() -> Self {
        Self {
            status: PcgStatus::Degenerate,
            iterations: 0,
            relative_residual: 1.0,
        }
    }

    /// The exact solution of a system with a zero right-hand side.
    fn zero_step() -> Self {
        Self {
            status: PcgStatus::Converged,
            iterations: 0,
            relative_residual: 0.0,
        }
    }

    /// Whether the returned update is usable.
    pub fn has_step(&self) -> bool {
        self.status != PcgStatus::Degenerate
    }
}

/// `I` for a degenerate step, `X` for divergence, else the iteration count.
impl fmt::Display for PcgOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            PcgStatus::Degenerate => write!(f, "I"),
            PcgStatus::Diverged => write!(f, "X"),
            PcgStatus::Converged | PcgStatus::MaxIterations => write!(f, "{}", self.iterations),
        }
    }
}

/// Iteration controls of PCG.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcgSettings {
    /// Minimum iterations before the tolerance test applies.
    pub min_iterations: usize,
    /// Maximum iterations; the system size also caps it.
    pub max_iterations: usize,
    /// Relative residual tolerance.
    pub tolerance: f64,
    /// Abort when the relative residual exceeds this multiple of the best one.
    pub guard_ratio: f64,
}

impl Default for PcgSettings {
    fn default() -> Self {
        Self {
            min_iterations: 10,
            max_iterations: 100,
            tolerance: 1e-6,
            guard_ratio: 1e3,
        }
    }
}

#[derive(Debug, Default)]
struct KrylovVectors {
    r: Vec<f64>,
    z: Vec<f64>,
    p: Vec<f64>,
    q: Vec<f64>,
    best: Vec<f64>,
}

impl KrylovVectors {
    fn resize(&mut self, n: usize) {
        for v in [
            &mut self.r,
            &mut self.z,
            &mut self.p,
            &mut self.q,
            &mut self.best,
        ] {
            v.resize(n, 0.0);
        }
    }
}

/// Scratch vectors of the linear solver, allocated once per solve call and
/// reused by every LM trial.
#[derive(Debug, Default)]
pub struct PcgWorkspace {
    krylov: KrylovVectors,
    residual_space: Vec<f64>,
    point_space: Vec<f64>,
    rhs: Vec<f64>,
}

impl PcgWorkspace {
    /// Allocate the scratch for a problem size.
    pub fn new(num_parameters: usize, num_observations: usize, num_points: usize) -> Self {
        let mut ws = Self::default();
        ws.krylov.resize(num_parameters);
        ws.residual_space.resize(2 * num_observations, 0.0);
        ws.point_space.resize(POINT_PARAMS * num_points, 0.0);
        ws.rhs.resize(num_parameters, 0.0);
        ws
    }
}

/// Generic preconditioned CG recurrence on `A x = b`, starting from `x = 0`.
fn pcg<A, M>(
    pool: &WorkerPool,
    settings: &PcgSettings,
    b: &[f64],
    x: &mut [f64],
    v: &mut KrylovVectors,
    mut apply_a: A,
    apply_m: M,
) -> PcgOutcome
where
    A: FnMut(&[f64], &mut [f64]),
    M: Fn(&[f64], &mut [f64]),
{
    let n = b.len();
    v.resize(n);
    x.fill(0.0);

    let r0 = pool.norm(b);
    if r0 == 0.0 || !r0.is_finite() {
        return PcgOutcome::degenerate();
    }

    v.r.copy_from_slice(b);
    apply_m(&v.r[..], &mut v.z[..]);
    v.p.copy_from_slice(&v.z);
    let mut rz = pool.dot(&v.r, &v.z);
    if rz <= 0.0 || !rz.is_finite() {
        return PcgOutcome::degenerate();
    }

    v.best.fill(0.0);
    let mut best_rel = 1.0;
    let max_iterations = settings.max_iterations.min(n);

    for k in 0..max_iterations {
        apply_a(&v.p[..], &mut v.q[..]);
        let pq = pool.dot(&v.p, &v.q);
        let alpha = rz / pq;
        if pq <= 0.0 || !alpha.is_finite() {
            if k == 0 {
                return PcgOutcome::degenerate();
            }
            x.copy_from_slice(&v.best);
            return PcgOutcome {
                status: PcgStatus::Diverged,
                iterations: k,
                relative_residual: best_rel,
            };
        }

        pool.axpy(alpha, &v.p, x);
        pool.axpy(-alpha, &v.q, &mut v.r);
        let rel = pool.norm(&v.r) / r0;

        if !rel.is_finite() || rel > settings.guard_ratio * best_rel {
            x.copy_from_slice(&v.best);
            return PcgOutcome {
                status: PcgStatus::Diverged,
                iterations: k + 1,
                relative_residual: best_rel,
            };
        }
        if rel < best_rel {
            best_rel = rel;
            v.best.copy_from_slice(x);
        }

        if rel == 0.0 || (k + 1 >= settings.min_iterations && rel < settings.tolerance) {
            return PcgOutcome {
                status: PcgStatus::Converged,
                iterations: k + 1,
                relative_residual: rel,
            };
        }

        apply_m(&v.r[..], &mut v.z[..]);
        let rz_new = pool.dot(&v.r, &v.z);
        let beta = rz_new / rz;
        if !beta.is_finite() {
            x.copy_from_slice(&v.best);
            return PcgOutcome {
                status: PcgStatus::Diverged,
                iterations: k + 1,
                relative_residual: best_rel,
            };
        }
        pool.xpby(&v.z, beta, &mut v.p);
        rz = rz_new;
    }

    let relative_residual = pool.norm(&v.r) / r0;
    PcgOutcome {
        status: PcgStatus::MaxIterations,
        iterations: max_iterations,
        relative_residual,
    }
}

/// The damped normal equations `(J^T J + lambda * D) x = J^T e` of one LM trial.
pub struct NormalEquations<'a> {
    /// Worker pool.
    pub pool: &'a WorkerPool,
    /// Linearization point.
    pub lin: Linearization<'a>,
    /// Jacobian at the linearization point.
    pub store: &'a dyn JacobianStore,
    /// Block preconditioner, factorized with the same damping.
    pub preconditioner: &'a BlockPreconditioner,
    /// `lambda * D`, laid out like the parameter vector.
    pub damping: &'a [f64],
}

impl NormalEquations<'_> {
    /// `out = (J^T J + lambda * D) x`, using `scratch` of length `2 * num_observations`.
    pub fn apply(&self, x: &[f64], out: &mut [f64], scratch: &mut [f64]) {
        self.store.multiply(self.pool, &self.lin, x, scratch);
        self.store
            .multiply_transpose(self.pool, &self.lin, scratch, out);
        let damping = self.damping;
        self.pool.for_each_block(out, 1, |i, o| o[0] += damping[i] * x[i]);
    }

    /// Solve for the update `delta` given the gradient `J^T e`.
    pub fn solve(
        &self,
        kind: LinearSolverKind,
        gradient: &[f64],
        settings: &PcgSettings,
        ws: &mut PcgWorkspace,
        delta: &mut [f64],
    ) -> PcgOutcome {
        let outcome = match kind {
            LinearSolverKind::Full => self.solve_full(gradient, settings, ws, delta),
            LinearSolverKind::Schur => self.solve_schur(gradient, settings, ws, delta),
        };
        log::debug!(
            "pcg ({kind:?}): {outcome} iterations, relative residual {:.3e}",
            outcome.relative_residual
        );
        outcome
    }

    fn solve_full(
        &self,
        gradient: &[f64],
        settings: &PcgSettings,
        ws: &mut PcgWorkspace,
        delta: &mut [f64],
    ) -> PcgOutcome {
        let scratch = &mut ws.residual_space;
        pcg(
            self.pool,
            settings,
            gradient,
            delta,
            &mut ws.krylov,
            |x, out| self.apply(x, out, scratch),
            |v, out| self.preconditioner.apply(self.pool, v, out),
        )
    }

    /// `point_out = V^-1 * point_in` for every point.
    fn apply_point_inverse(&self, point_in: &mut [f64]) {
        let pre = self.preconditioner;
        self.pool.for_each_block(point_in, POINT_PARAMS, |p, v| {
            let w = pre.apply_point(p, v);
            v.copy_from_slice(&w);
        });
    }

    /// `point_out[p] = sum over observations of p of Jp^T e`.
    fn transpose_points(&self, e: &[f64], point_out: &mut [f64]) {
        let lin = &self.lin;
        let store = self.store;
        self.pool.for_each_block(point_out, POINT_PARAMS, |p, o| {
            o.fill(0.0);
            for &obs in lin.index.point_observations(p) {
                store
                    .block(lin, obs)
                    .accumulate_point([e[2 * obs], e[2 * obs + 1]], o);
            }
        });
    }

    /// `camera_out[c] = sum over observations of c of Jc^T e`.
    fn transpose_cameras(&self, e: &[f64], camera_out: &mut [f64]) {
        let lin = &self.lin;
        let store = self.store;
        self.pool.for_each_block(camera_out, CAMERA_PARAMS, |c, o| {
            o.fill(0.0);
            for &obs in lin.index.camera_observations(c) {
                store
                    .block(lin, obs)
                    .accumulate_camera([e[2 * obs], e[2 * obs + 1]], o);
            }
        });
    }

    /// `out = S x` with `S = (Hcc + lambda Dc) - W V^-1 W^T`.
    fn apply_schur(&self, x: &[f64], out: &mut [f64], resid: &mut [f64], points: &mut [f64]) {
        let lin = &self.lin;
        let store = self.store;
        let layout = lin.layout();

        // y = Jc x
        self.pool.for_each_block(resid, 2, |i, o| {
            let cam = layout.camera_offset(lin.observations[i].camera);
            let y = store.block(lin, i).apply_camera(&x[cam..cam + CAMERA_PARAMS]);
            o.copy_from_slice(&y);
        });

        // w = V^-1 Jp^T y
        self.transpose_points(resid, points);
        self.apply_point_inverse(points);

        // y -= Jp w
        let points_ro: &[f64] = points;
        self.pool.for_each_block(resid, 2, |i, o| {
            let p = lin.observations[i].point * POINT_PARAMS;
            let q = store
                .block(lin, i)
                .apply_point(&points_ro[p..p + POINT_PARAMS]);
            o[0] -= q[0];
            o[1] -= q[1];
        });

        self.transpose_cameras(resid, out);
        let damping = self.damping;
        self.pool
            .for_each_block(out, 1, |i, o| o[0] += damping[i] * x[i]);
    }

    fn solve_schur(
        &self,
        gradient: &[f64],
        settings: &PcgSettings,
        ws: &mut PcgWorkspace,
        delta: &mut [f64],
    ) -> PcgOutcome {
        let lin = &self.lin;
        let store = self.store;
        let layout = lin.layout();
        let cam_len = layout.camera_len();
        let (g_c, g_p) = gradient.split_at(cam_len);

        // reduced right-hand side: g_c - W V^-1 g_p
        let points = &mut ws.point_space;
        points.copy_from_slice(g_p);
        self.apply_point_inverse(points);
        let points_ro: &[f64] = points;
        self.pool.for_each_block(&mut ws.residual_space, 2, |i, o| {
            let p = lin.observations[i].point * POINT_PARAMS;
            let q = store
                .block(lin, i)
                .apply_point(&points_ro[p..p + POINT_PARAMS]);
            o.copy_from_slice(&q);
        });
        let rhs = &mut ws.rhs[..cam_len];
        self.transpose_cameras(&ws.residual_space, rhs);
        self.pool.for_each_block(rhs, 1, |i, r| r[0] = g_c[i] - r[0]);

        let (delta_c, delta_p) = delta.split_at_mut(cam_len);
        let cameras_at_rest = self.pool.norm(&ws.rhs[..cam_len]) == 0.0;
        let outcome = if cameras_at_rest {
            // dc = 0 solves the reduced system; the points still move by V^-1 g_p
            delta_c.fill(0.0);
            PcgOutcome::zero_step()
        } else {
            let resid = &mut ws.residual_space;
            let point_scratch = &mut ws.point_space;
            pcg(
                self.pool,
                settings,
                &ws.rhs[..cam_len],
                delta_c,
                &mut ws.krylov,
                |x, out| self.apply_schur(x, out, resid, point_scratch),
                |v, out| self.preconditioner.apply_cameras(self.pool, v, out),
            )
        };

        // back substitution: dp = V^-1 (g_p - W^T dc)
        let delta_c_ro: &[f64] = delta_c;
        self.pool.for_each_block(&mut ws.residual_space, 2, |i, o| {
            let cam = layout.camera_offset(lin.observations[i].camera);
            let y = store
                .block(lin, i)
                .apply_camera(&delta_c_ro[cam..cam + CAMERA_PARAMS]);
            o.copy_from_slice(&y);
        });
        self.transpose_points(&ws.residual_space, delta_p);
        self.pool
            .for_each_block(delta_p, 1, |i, d| d[0] = g_p[i] - d[0]);
        self.apply_point_inverse(delta_p);

        if cameras_at_rest {
            let point_norm = self.pool.norm(delta_p);
            if point_norm == 0.0 || !point_norm.is_finite() {
                return PcgOutcome::degenerate();
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DampingMode;
    use crate::index::ObservationIndex;
    use crate::jacobian::ObservationJacobians;
    use crate::types::{Camera, DistortionModel, Observation, Point};

    struct Scene {
        cameras: Vec<Camera>,
        points: Vec<Point>,
        observations: Vec<Observation>,
        index: ObservationIndex,
    }

    fn scene(cameras_fixed: bool) -> Scene {
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let cameras = vec![
            Camera::new(1.0, identity, [0.0, 0.0, 0.0]),
            Camera::new(1.1, identity, [-0.8, 0.1, 0.2]),
            Camera::new(0.9, identity, [0.6, -0.2, 0.1]),
        ]
        .into_iter()
        .map(|c| c.with_fixed(cameras_fixed))
        .collect::<Vec<_>>();
        let points: Vec<Point> = (0..10)
            .map(|i| {
                let t = i as f64;
                Point::new((0.7 * t).sin(), (1.3 * t).cos() * 0.5, 4.0 + 0.2 * t)
            })
            .collect();
        let mut observations = Vec::new();
        for p in 0..points.len() {
            for c in 0..cameras.len() {
                let m = [0.05 * (p as f64) - 0.1 * c as f64, 0.02 * (c * p) as f64];
                observations.push(Observation::new(c, p, m));
            }
        }
        let index = ObservationIndex::build(cameras.len(), points.len(), &observations)
            .expect("valid scene");
        Scene {
            cameras,
            points,
            observations,
            index,
        }
    }

    fn solve_with(
        kind: LinearSolverKind,
        cameras_fixed: bool,
    ) -> (Vec<f64>, Vec<f64>, PcgOutcome, Vec<f64>) {
        let s = scene(cameras_fixed);
        let pool = WorkerPool::new(2).expect("pool");
        let lin = Linearization {
            cameras: &s.cameras,
            points: &s.points,
            observations: &s.observations,
            index: &s.index,
            model: DistortionModel::None,
            fix_intrinsics: false,
            scaling: None,
        };
        let layout = lin.layout();
        let mut store = ObservationJacobians::default();
        store.evaluate(&pool, &lin);

        let e: Vec<f64> = (0..2 * s.observations.len())
            .map(|i| 0.01 * ((i as f64) * 0.9).sin())
            .collect();
        let mut gradient = vec![0.0; layout.len()];
        store.multiply_transpose(&pool, &lin, &e, &mut gradient);

        let mut pre = BlockPreconditioner::new(layout);
        pre.build(&pool, &lin, &store);
        let mut damping = vec![0.0; layout.len()];
        pre.fill_damping(DampingMode::ScaleInvariant, 1e-1, &mut damping);
        pre.factorize(&pool, &damping);

        let system = NormalEquations {
            pool: &pool,
            lin,
            store: &store,
            preconditioner: &pre,
            damping: &damping,
        };
        let settings = PcgSettings {
            min_iterations: 1,
            max_iterations: 500,
            tolerance: 1e-10,
            guard_ratio: 1e3,
        };
        let mut ws = PcgWorkspace::new(layout.len(), s.observations.len(), s.points.len());
        let mut delta = vec![0.0; layout.len()];
        let outcome = system.solve(kind, &gradient, &settings, &mut ws, &mut delta);

        let mut ax = vec![0.0; layout.len()];
        let mut scratch = vec![0.0; 2 * s.observations.len()];
        system.apply(&delta, &mut ax, &mut scratch);
        (delta, ax, outcome, gradient)
    }

    fn relative_error(a: &[f64], b: &[f64]) -> f64 {
        let diff: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
        let norm: f64 = b.iter().map(|y| y * y).sum();
        (diff / norm).sqrt()
    }

    #[test]
    fn test_full_system_solves_normal_equations() {
        let (_, ax, outcome, gradient) = solve_with(LinearSolverKind::Full, false);
        assert!(outcome.has_step());
        assert!(relative_error(&ax, &gradient) < 1e-6);
    }

    #[test]
    fn test_schur_matches_full() {
        let (full, _, full_outcome, _) = solve_with(LinearSolverKind::Full, false);
        let (schur, ax, schur_outcome, gradient) = solve_with(LinearSolverKind::Schur, false);
        assert!(full_outcome.has_step() && schur_outcome.has_step());
        assert!(relative_error(&schur, &full) < 1e-4);
        assert!(relative_error(&ax, &gradient) < 1e-6);
    }

    #[test]
    fn test_schur_with_every_camera_fixed() {
        let (full, _, full_outcome, _) = solve_with(LinearSolverKind::Full, true);
        let (schur, ax, schur_outcome, gradient) = solve_with(LinearSolverKind::Schur, true);
        assert!(full_outcome.has_step());
        assert_eq!(schur_outcome.status, PcgStatus::Converged);
        assert_eq!(schur_outcome.iterations, 0);

        let cam_len = 3 * CAMERA_PARAMS;
        assert!(schur[..cam_len].iter().all(|d| *d == 0.0));
        assert!(schur[cam_len..].iter().any(|d| *d != 0.0));
        assert!(relative_error(&schur, &full) < 1e-6);
        assert!(relative_error(&ax, &gradient) < 1e-10);
    }

    #[test]
    fn test_zero_rhs_is_degenerate() {
        let pool = WorkerPool::new(1).expect("pool");
        let mut v = KrylovVectors::default();
        let mut x = vec![1.0; 3];
        let outcome = pcg(
            &pool,
            &PcgSettings::default(),
            &[0.0; 3],
            &mut x,
            &mut v,
            |p, out| out.copy_from_slice(p),
            |r, out| out.copy_from_slice(r),
        );
        assert_eq!(outcome.status, PcgStatus::Degenerate);
        assert_eq!(outcome.to_string(), "I");
        assert_eq!(x, vec![0.0; 3]);
    }

    #[test]
    fn test_diagonal_system_converges() {
        let pool = WorkerPool::new(1).expect("pool");
        let diag = [2.0, 4.0, 8.0, 16.0];
        let b = [2.0, 4.0, 8.0, 16.0];
        let mut v = KrylovVectors::default();
        let mut x = vec![0.0; 4];
        let outcome = pcg(
            &pool,
            &PcgSettings {
                min_iterations: 0,
                ..Default::default()
            },
            &b,
            &mut x,
            &mut v,
            |p, out| {
                for i in 0..4 {
                    out[i] = diag[i] * p[i];
                }
            },
            |r, out| out.copy_from_slice(r),
        );
        assert_eq!(outcome.status, PcgStatus::Converged);
        assert!(outcome.iterations <= 4);
        for xi in x {
            assert!((xi - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_indefinite_operator_diverges() {
        let pool = WorkerPool::new(1).expect("pool");
        let mut v = KrylovVectors::default();
        let mut x = vec![0.0; 2];
        // first step is fine, the second direction has negative curvature
        let outcome = pcg(
            &pool,
            &PcgSettings {
                min_iterations: 0,
                tolerance: 0.0,
                ..Default::default()
            },
            &[1.0, 0.1],
            &mut x,
            &mut v,
            |p, out| {
                out[0] = p[0];
                out[1] = -3.0 * p[1];
            },
            |r, out| out.copy_from_slice(r),
        );
        assert_eq!(outcome.status, PcgStatus::Diverged);
        assert_eq!(outcome.to_string(), "X");
        assert!(x.iter().all(|v| v.is_finite()));
    }
}
