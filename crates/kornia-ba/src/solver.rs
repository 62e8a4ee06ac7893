use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{BundleAdjustmentConfig, DampingMode};
use crate::error::BundleAdjustmentError;
use crate::index::ObservationIndex;
use crate::jacobian::{column_scaling, create_store, Linearization, ParameterLayout};
use crate::normalize::DataNormalizer;
use crate::parallel::WorkerPool;
use crate::pcg::{NormalEquations, PcgSettings, PcgWorkspace};
use crate::preconditioner::BlockPreconditioner;
use crate::projection::compute_residuals;
use crate::types::{Camera, DistortionModel, Observation, Point};
use crate::update::apply_update;

/// Reason why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Converged: the update is small relative to the parameters.
    StepConverged,
    /// Converged: the gradient infinity norm is below tolerance.
    GradientConverged,
    /// Converged: the mean squared error is below tolerance.
    MseConverged,
    /// The LM iteration budget was used up.
    MaxIterations,
    /// The wall-clock budget was used up.
    TimeBudget,
    /// The cancellation flag was raised.
    Cancelled,
    /// A trial was rejected with damping already at its maximum.
    DampingExhausted,
    /// The objective or the gradient is not finite.
    NumericalFailure,
}

impl TerminationReason {
    /// Whether the solver stopped on a convergence test.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            Self::StepConverged | Self::GradientConverged | Self::MseConverged
        )
    }
}

/// Statistics of a bundle adjustment solve.
///
/// Errors are mean squared reprojection errors in squared pixels of the caller's units.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleAdjustmentSummary {
    /// Error before the first iteration.
    pub initial_mse: f64,
    /// Error at termination.
    pub final_mse: f64,
    /// Number of LM trials run.
    pub iterations: usize,
    /// Why the solver stopped.
    pub termination_reason: TerminationReason,
    /// Distinct points behind at least one camera that observes them.
    pub points_behind_camera: usize,
    /// Cameras moved off near-planar points before solving.
    pub cameras_perturbed: usize,
    /// Cameras whose distortion coefficient was reset to 0 because it was
    /// estimated under a different model.
    pub distortion_resets: usize,
    /// Preconditioner blocks that could not be inverted, summed over trials.
    pub degenerate_blocks: usize,
    /// Trials where PCG produced no step.
    pub degenerate_steps: usize,
    /// Accepted trials.
    pub accepted_steps: usize,
    /// Rejected trials.
    pub rejected_steps: usize,
    /// PCG iterations, summed over trials.
    pub cg_iterations: usize,
    /// Initial error followed by the error after every accepted step.
    pub objective_history: Vec<f64>,
    /// Wall-clock time of the solve.
    pub elapsed: Duration,
}

/// Sparse bundle adjustment solver.
///
/// Owns the configuration and the worker pool. Each call to [`Self::solve`]
/// owns its scratch state, so the solver can be reused across problems.
#[derive(Debug)]
pub struct BundleAdjuster {
    config: BundleAdjustmentConfig,
    pool: WorkerPool,
    cancel: Arc<AtomicBool>,
}

/// Reset distortion coefficients estimated under a different model.
fn reset_distortion(cameras: &mut [Camera], model: DistortionModel) -> usize {
    if model == DistortionModel::None {
        return 0;
    }
    let mut resets = 0;
    for camera in cameras.iter_mut() {
        if camera.distortion_model != model {
            if camera.distortion != 0.0 {
                camera.distortion = 0.0;
                resets += 1;
            }
            camera.distortion_model = model;
        }
    }
    resets
}

fn check_finite(cameras: &[Camera], points: &[Point]) -> Result<(), BundleAdjustmentError> {
    let camera_ok = |c: &Camera| {
        c.focal.is_finite()
            && c.distortion.is_finite()
            && c.translation.iter().all(|v| v.is_finite())
            && c.rotation.iter().flatten().all(|v| v.is_finite())
    };
    if !cameras.iter().all(camera_ok) {
        return Err(BundleAdjustmentError::NonFiniteInput("cameras"));
    }
    if !points.iter().flat_map(|p| p.position).all(f64::is_finite) {
        return Err(BundleAdjustmentError::NonFiniteInput("points"));
    }
    Ok(())
}

/// Norm of the additive part of the parameter vector.
fn parameter_norm(pool: &WorkerPool, cameras: &[Camera], points: &[Point]) -> f64 {
    let cameras_sq = pool.sum_by(cameras.len(), |c| {
        let cam = &cameras[c];
        cam.focal * cam.focal
            + cam.distortion * cam.distortion
            + cam.translation.iter().map(|t| t * t).sum::<f64>()
    });
    let points_sq = pool.sum_by(points.len(), |p| {
        points[p].position.iter().map(|x| x * x).sum::<f64>()
    });
    (cameras_sq + points_sq).sqrt()
}

impl BundleAdjuster {
    /// Create a solver.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or the worker pool cannot be built.
    pub fn new(config: BundleAdjustmentConfig) -> Result<Self, BundleAdjustmentError> {
        config.validate()?;
        let pool = WorkerPool::new(config.num_threads)?;
        Ok(Self {
            config,
            pool,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The solver configuration.
    pub fn config(&self) -> &BundleAdjustmentConfig {
        &self.config
    }

    /// Worker pool of the solver.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Flag that stops a running solve at the next outer iteration when set.
    ///
    /// The flag is not cleared by the solver.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Refine cameras and points in place.
    ///
    /// # Arguments
    ///
    /// * `cameras` - Cameras, overwritten with the refined values except for fixed ones.
    /// * `points` - Points, overwritten with the refined values.
    /// * `observations` - Measurements relating cameras and points.
    ///
    /// # Returns
    ///
    /// Statistics of the solve. Numerical trouble ends the solve early with a
    /// [`TerminationReason`] but never fails it.
    ///
    /// # Errors
    ///
    /// Fails when the inputs are empty, inconsistent or not finite, before any
    /// computation is done.
    pub fn solve(
        &self,
        cameras: &mut [Camera],
        points: &mut [Point],
        observations: &[Observation],
    ) -> Result<BundleAdjustmentSummary, BundleAdjustmentError> {
        let start = Instant::now();
        let config = &self.config;
        let pool = &self.pool;
        let model = config.distortion_model;

        let index = ObservationIndex::build(cameras.len(), points.len(), observations)?;
        check_finite(cameras, points)?;

        let mut cams = cameras.to_vec();
        let mut pts = points.to_vec();
        let mut obs = observations.to_vec();

        let distortion_resets = reset_distortion(&mut cams, model);
        if distortion_resets > 0 {
            log::warn!("reset the distortion of {distortion_resets} cameras estimated under another model");
        }

        let (normalizer, report) = DataNormalizer::normalize(
            &mut cams,
            &mut pts,
            &mut obs,
            &index,
            model,
            config.normalize,
        );
        let mse_scale = normalizer.objective_scale() / obs.len() as f64;

        let layout = ParameterLayout::new(cams.len(), pts.len());
        let num_residuals = 2 * obs.len();

        // scratch owned by this solve
        let mut residuals = vec![0.0; num_residuals];
        let mut trial_residuals = vec![0.0; num_residuals];
        let mut jacobian_step = vec![0.0; num_residuals];
        let mut gradient = vec![0.0; layout.len()];
        let mut unscaled_gradient = vec![0.0; layout.len()];
        let mut delta = vec![0.0; layout.len()];
        let mut damping = vec![0.0; layout.len()];
        let mut scaling: Vec<f64> = Vec::new();
        let mut trial_cams = cams.clone();
        let mut trial_pts = pts.clone();
        let mut store = create_store(config.jacobian_storage);
        let mut preconditioner = BlockPreconditioner::new(layout);
        let mut workspace = PcgWorkspace::new(layout.len(), obs.len(), pts.len());
        let settings = PcgSettings {
            min_iterations: config.min_cg_iterations,
            max_iterations: config.max_cg_iterations,
            tolerance: config.cg_tolerance,
            guard_ratio: config.cg_guard_ratio,
        };

        let mut objective = compute_residuals(pool, &cams, &pts, &obs, model, &mut residuals);
        let initial_mse = objective * mse_scale;
        let mut objective_history = vec![initial_mse];

        let mut lambda = config.initial_damping;
        let mut nu = 2.0;
        let mut damping_mode = config.damping_mode;
        let mut iterations = 0;
        let mut accepted_steps = 0;
        let mut rejected_steps = 0;
        let mut degenerate_blocks = 0;
        let mut degenerate_steps = 0;
        let mut cg_iterations = 0;
        let mut linearize = true;

        log::debug!(
            "bundle adjustment: {} cameras, {} points, {} observations, initial mse {initial_mse:.6e}",
            cams.len(),
            pts.len(),
            obs.len()
        );

        let termination_reason = loop {
            if !objective.is_finite() {
                break TerminationReason::NumericalFailure;
            }
            if self.cancel.load(Ordering::Relaxed) {
                break TerminationReason::Cancelled;
            }
            if config
                .time_budget_seconds
                .is_some_and(|budget| start.elapsed().as_secs_f64() >= budget)
            {
                break TerminationReason::TimeBudget;
            }
            if objective * mse_scale < config.thresholds.mse {
                break TerminationReason::MseConverged;
            }

            if linearize {
                if config.jacobian_scaling {
                    let unscaled = Linearization {
                        cameras: &cams,
                        points: &pts,
                        observations: &obs,
                        index: &index,
                        model,
                        fix_intrinsics: config.fix_intrinsics,
                        scaling: None,
                    };
                    scaling = column_scaling(pool, &unscaled);
                }
                let lin = Linearization {
                    cameras: &cams,
                    points: &pts,
                    observations: &obs,
                    index: &index,
                    model,
                    fix_intrinsics: config.fix_intrinsics,
                    scaling: config.jacobian_scaling.then_some(scaling.as_slice()),
                };
                store.evaluate(pool, &lin);
                store.multiply_transpose(pool, &lin, &residuals, &mut gradient);
                preconditioner.build(pool, &lin, store.as_ref());
                linearize = false;

                unscaled_gradient.copy_from_slice(&gradient);
                if config.jacobian_scaling {
                    pool.for_each_block(&mut unscaled_gradient, 1, |i, g| g[0] /= scaling[i]);
                }
                let gradient_norm = pool.inf_norm(&unscaled_gradient);
                if !gradient_norm.is_finite() {
                    break TerminationReason::NumericalFailure;
                }
                if gradient_norm <= config.thresholds.gradient_inf_norm {
                    break TerminationReason::GradientConverged;
                }
            }

            if iterations >= config.max_lm_iterations {
                break TerminationReason::MaxIterations;
            }
            iterations += 1;

            if let Some(threshold) = config.isotropic_switch_damping {
                if damping_mode == DampingMode::ScaleInvariant && lambda > threshold {
                    log::info!("damping {lambda:.3e} above {threshold:.3e}, switching to isotropic damping");
                    damping_mode = DampingMode::Isotropic;
                }
            }

            preconditioner.fill_damping(damping_mode, lambda, &mut damping);
            degenerate_blocks += preconditioner.factorize(pool, &damping);

            let lin = Linearization {
                cameras: &cams,
                points: &pts,
                observations: &obs,
                index: &index,
                model,
                fix_intrinsics: config.fix_intrinsics,
                scaling: config.jacobian_scaling.then_some(scaling.as_slice()),
            };
            let system = NormalEquations {
                pool,
                lin,
                store: store.as_ref(),
                preconditioner: &preconditioner,
                damping: &damping,
            };
            let outcome = system.solve(
                config.linear_solver,
                &gradient,
                &settings,
                &mut workspace,
                &mut delta,
            );
            cg_iterations += outcome.iterations;

            let accepted = if outcome.has_step() {
                // predicted reduction of the linear model, in the scaled space
                store.multiply(pool, &lin, &delta, &mut jacobian_step);
                let predicted =
                    2.0 * pool.dot(&delta, &gradient) - pool.dot(&jacobian_step, &jacobian_step);

                if config.jacobian_scaling {
                    pool.scale_elementwise(&scaling, &mut delta);
                }

                let step_norm = pool.norm(&delta);
                let threshold = config.thresholds.delta_norm;
                if step_norm <= threshold * (parameter_norm(pool, &cams, &pts) + threshold) {
                    log::debug!("iteration {iterations}: step norm {step_norm:.3e} below tolerance");
                    break TerminationReason::StepConverged;
                }

                apply_update(pool, &cams, &pts, &delta, &mut trial_cams, &mut trial_pts);
                let trial_objective = compute_residuals(
                    pool,
                    &trial_cams,
                    &trial_pts,
                    &obs,
                    model,
                    &mut trial_residuals,
                );

                if trial_objective.is_finite() && trial_objective < objective {
                    let rho = (objective - trial_objective) / predicted;
                    let factor = (1.0 - (2.0 * rho - 1.0).powi(3)).max(1.0 / 3.0);
                    log::debug!(
                        "iteration {iterations}: accepted, mse {:.6e} -> {:.6e}, lambda {lambda:.3e}, rho {rho:.3}, pcg {outcome}",
                        objective * mse_scale,
                        trial_objective * mse_scale,
                    );
                    lambda = (lambda * factor).clamp(config.min_damping, config.max_damping);
                    nu = 2.0;
                    std::mem::swap(&mut cams, &mut trial_cams);
                    std::mem::swap(&mut pts, &mut trial_pts);
                    std::mem::swap(&mut residuals, &mut trial_residuals);
                    objective = trial_objective;
                    objective_history.push(objective * mse_scale);
                    linearize = true;
                    true
                } else {
                    log::debug!(
                        "iteration {iterations}: rejected, trial mse {:.6e}, lambda {lambda:.3e}, pcg {outcome}",
                        trial_objective * mse_scale,
                    );
                    false
                }
            } else {
                degenerate_steps += 1;
                log::debug!("iteration {iterations}: degenerate step, lambda {lambda:.3e}");
                false
            };

            if accepted {
                accepted_steps += 1;
            } else {
                rejected_steps += 1;
                if lambda >= config.max_damping {
                    break TerminationReason::DampingExhausted;
                }
                lambda = (lambda * nu).clamp(config.min_damping, config.max_damping);
                nu *= 2.0;
            }
        };

        normalizer.denormalize(&mut cams, &mut pts);
        for (dst, src) in cameras.iter_mut().zip(&cams) {
            if !dst.fixed {
                *dst = *src;
            }
        }
        points.copy_from_slice(&pts);

        let final_mse = objective * mse_scale;
        let elapsed = start.elapsed();
        log::info!(
            "bundle adjustment finished after {iterations} iterations ({termination_reason:?}): mse {initial_mse:.6e} -> {final_mse:.6e}, elapsed {elapsed:?}"
        );

        Ok(BundleAdjustmentSummary {
            initial_mse,
            final_mse,
            iterations,
            termination_reason,
            points_behind_camera: report.points_behind_camera,
            cameras_perturbed: report.cameras_perturbed,
            distortion_resets,
            degenerate_blocks,
            degenerate_steps,
            accepted_steps,
            rejected_steps,
            cg_iterations,
            objective_history,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    const IDENTITY: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    #[test]
    fn test_reset_distortion() {
        let mut cameras = vec![
            Camera::new(1.0, IDENTITY, [0.0; 3]).with_distortion(0.1, DistortionModel::Measurement),
            Camera::new(1.0, IDENTITY, [0.0; 3]).with_distortion(0.2, DistortionModel::Projection),
            Camera::new(1.0, IDENTITY, [0.0; 3]),
        ];
        assert_eq!(reset_distortion(&mut cameras, DistortionModel::None), 0);
        assert_eq!(reset_distortion(&mut cameras, DistortionModel::Projection), 1);
        assert_eq!(cameras[0].distortion, 0.0);
        assert_eq!(cameras[1].distortion, 0.2);
        assert!(cameras
            .iter()
            .all(|c| c.distortion_model == DistortionModel::Projection));
    }

    #[test]
    fn test_invalid_config() {
        let config = BundleAdjustmentConfig::default().with_max_lm_iterations(0);
        assert_eq!(
            BundleAdjuster::new(config).err(),
            Some(BundleAdjustmentError::Config(ConfigError::ZeroLmIterations))
        );
    }

    #[test]
    fn test_non_finite_input() -> Result<(), BundleAdjustmentError> {
        let solver = BundleAdjuster::new(BundleAdjustmentConfig::default().with_num_threads(1))?;
        let mut cameras = vec![Camera::new(1.0, IDENTITY, [0.0; 3])];
        let mut points = vec![Point::new(f64::NAN, 0.0, 1.0)];
        let observations = vec![Observation::new(0, 0, [0.0, 0.0])];
        assert_eq!(
            solver.solve(&mut cameras, &mut points, &observations),
            Err(BundleAdjustmentError::NonFiniteInput("points"))
        );
        Ok(())
    }

    #[test]
    fn test_exact_scene_converges_immediately() -> Result<(), BundleAdjustmentError> {
        let solver = BundleAdjuster::new(BundleAdjustmentConfig::default().with_num_threads(1))?;
        let mut cameras = vec![Camera::new(2.0, IDENTITY, [0.0; 3])];
        let mut points = vec![Point::new(0.0, 0.0, 1.0)];
        let observations = vec![Observation::new(0, 0, [0.0, 0.0])];
        let summary = solver.solve(&mut cameras, &mut points, &observations)?;
        assert_eq!(summary.termination_reason, TerminationReason::GradientConverged);
        assert!(summary.termination_reason.is_converged());
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.initial_mse, 0.0);
        assert_eq!(summary.objective_history, vec![0.0]);
        Ok(())
    }

    #[test]
    fn test_cancelled_before_start() -> Result<(), BundleAdjustmentError> {
        let solver = BundleAdjuster::new(BundleAdjustmentConfig::default().with_num_threads(1))?;
        solver.cancel_handle().store(true, Ordering::Relaxed);
        let mut cameras = vec![Camera::new(2.0, IDENTITY, [0.0; 3])];
        let mut points = vec![Point::new(0.1, 0.0, 1.0)];
        let observations = vec![Observation::new(0, 0, [0.0, 0.0])];
        let summary = solver.solve(&mut cameras, &mut points, &observations)?;
        assert_eq!(summary.termination_reason, TerminationReason::Cancelled);
        assert_eq!(summary.iterations, 0);
        assert_eq!(points[0].position, [0.1, 0.0, 1.0]);
        Ok(())
    }
}
