use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DistortionModel;

/// Errors raised while validating or parsing a [`BundleAdjustmentConfig`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The LM iteration budget is zero.
    #[error("max_lm_iterations must be > 0")]
    ZeroLmIterations,

    /// The CG iteration bounds are inconsistent.
    #[error("min_cg_iterations ({min}) must not exceed max_cg_iterations ({max})")]
    CgIterationBounds {
        /// Minimum CG iterations.
        min: usize,
        /// Maximum CG iterations.
        max: usize,
    },

    /// The damping bounds are inconsistent.
    #[error("damping must satisfy 0 < min ({min}) <= initial ({initial}) <= max ({max})")]
    DampingBounds {
        /// Minimum damping.
        min: f64,
        /// Initial damping.
        initial: f64,
        /// Maximum damping.
        max: f64,
    },

    /// A numeric option is negative or not finite.
    #[error("{name} must be finite and non-negative, got {value}")]
    InvalidValue {
        /// Name of the option.
        name: &'static str,
        /// Offending value.
        value: f64,
    },

    /// The configuration could not be (de)serialized.
    #[error("failed to (de)serialize configuration: {0}")]
    Serialization(String),
}

/// Damping matrix `D` of the LM normal equations `(J^T J + lambda * D) x = J^T e`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DampingMode {
    /// `D = diag(J^T J)`, invariant to parameter scaling.
    #[default]
    ScaleInvariant,
    /// `D = I`.
    Isotropic,
}

/// How the Jacobian is kept between matrix-vector products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JacobianStorage {
    /// Keep nothing and recompute the blocks inside every product.
    Implicit,
    /// Keep the blocks in observation order.
    #[default]
    ObservationOrder,
    /// Keep the blocks in observation order plus the camera blocks grouped by camera.
    CameraSorted,
}

/// Formulation of the damped normal equations handed to PCG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinearSolverKind {
    /// Joint system over camera and point parameters.
    #[default]
    Full,
    /// Reduced camera system with the points eliminated.
    Schur,
}

/// Convergence thresholds of the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceThresholds {
    /// Stop when `|dx| <= delta_norm * (|x| + delta_norm)`.
    pub delta_norm: f64,
    /// Stop when `|J^T e|_inf <= gradient_inf_norm`.
    pub gradient_inf_norm: f64,
    /// Stop when the mean squared reprojection error, in squared pixels, is below this.
    pub mse: f64,
}

impl Default for ConvergenceThresholds {
    fn default() -> Self {
        Self {
            delta_norm: 1e-12,
            gradient_inf_norm: 1e-12,
            mse: 0.0,
        }
    }
}

/// Bundle adjustment solver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    /// Maximum number of LM trials, accepted or rejected.
    pub max_lm_iterations: usize,
    /// Maximum number of PCG iterations per trial.
    pub max_cg_iterations: usize,
    /// Minimum number of PCG iterations before the residual test applies.
    pub min_cg_iterations: usize,
    /// Relative residual `|r_k| / |r_0|` at which PCG stops.
    pub cg_tolerance: f64,
    /// PCG aborts when the relative residual grows past this multiple of the best one.
    pub cg_guard_ratio: f64,
    /// Initial damping.
    pub initial_damping: f64,
    /// Lower damping clamp.
    pub min_damping: f64,
    /// Upper damping clamp.
    pub max_damping: f64,
    /// Damping matrix.
    pub damping_mode: DampingMode,
    /// Switch from [`DampingMode::ScaleInvariant`] to [`DampingMode::Isotropic`] once
    /// damping exceeds this value.
    pub isotropic_switch_damping: Option<f64>,
    /// Radial distortion model to optimize.
    pub distortion_model: DistortionModel,
    /// Keep focal length and distortion constant.
    pub fix_intrinsics: bool,
    /// Rescale focal lengths and depths before solving.
    pub normalize: bool,
    /// Scale Jacobian columns by their norms.
    pub jacobian_scaling: bool,
    /// Jacobian storage policy.
    pub jacobian_storage: JacobianStorage,
    /// Normal equations formulation.
    pub linear_solver: LinearSolverKind,
    /// Wall-clock budget in seconds, `None` for unlimited.
    pub time_budget_seconds: Option<f64>,
    /// Number of worker threads, 0 uses all available cores.
    pub num_threads: usize,
    /// Outer loop convergence thresholds.
    pub thresholds: ConvergenceThresholds,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            max_lm_iterations: 50,
            max_cg_iterations: 100,
            min_cg_iterations: 10,
            cg_tolerance: 1e-6,
            cg_guard_ratio: 1e3,
            initial_damping: 1e-3,
            min_damping: 1e-10,
            max_damping: 1e10,
            damping_mode: DampingMode::ScaleInvariant,
            isotropic_switch_damping: None,
            distortion_model: DistortionModel::None,
            fix_intrinsics: false,
            normalize: true,
            jacobian_scaling: false,
            jacobian_storage: JacobianStorage::ObservationOrder,
            linear_solver: LinearSolverKind::Full,
            time_budget_seconds: None,
            num_threads: 0,
            thresholds: ConvergenceThresholds::default(),
        }
    }
}

impl BundleAdjustmentConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the LM iteration budget.
    pub fn with_max_lm_iterations(mut self, iterations: usize) -> Self {
        self.max_lm_iterations = iterations;
        self
    }

    /// Set the PCG iteration bounds.
    pub fn with_cg_iterations(mut self, min: usize, max: usize) -> Self {
        self.min_cg_iterations = min;
        self.max_cg_iterations = max;
        self
    }

    /// Set the PCG relative residual tolerance.
    pub fn with_cg_tolerance(mut self, tolerance: f64) -> Self {
        self.cg_tolerance = tolerance;
        self
    }

    /// Set the initial damping and its clamps.
    pub fn with_damping(mut self, initial: f64, min: f64, max: f64) -> Self {
        self.initial_damping = initial;
        self.min_damping = min;
        self.max_damping = max;
        self
    }

    /// Set the damping matrix.
    pub fn with_damping_mode(mut self, mode: DampingMode) -> Self {
        self.damping_mode = mode;
        self
    }

    /// Set the damping value that triggers the isotropic switch.
    pub fn with_isotropic_switch(mut self, damping: Option<f64>) -> Self {
        self.isotropic_switch_damping = damping;
        self
    }

    /// Set the distortion model.
    pub fn with_distortion_model(mut self, model: DistortionModel) -> Self {
        self.distortion_model = model;
        self
    }

    /// Keep focal length and distortion constant.
    pub fn with_fix_intrinsics(mut self, fix: bool) -> Self {
        self.fix_intrinsics = fix;
        self
    }

    /// Enable or disable data normalization.
    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    /// Enable or disable Jacobian column scaling.
    pub fn with_jacobian_scaling(mut self, scaling: bool) -> Self {
        self.jacobian_scaling = scaling;
        self
    }

    /// Set the Jacobian storage policy.
    pub fn with_jacobian_storage(mut self, storage: JacobianStorage) -> Self {
        self.jacobian_storage = storage;
        self
    }

    /// Set the normal equations formulation.
    pub fn with_linear_solver(mut self, kind: LinearSolverKind) -> Self {
        self.linear_solver = kind;
        self
    }

    /// Set the wall-clock budget.
    pub fn with_time_budget(mut self, seconds: Option<f64>) -> Self {
        self.time_budget_seconds = seconds;
        self
    }

    /// Set the number of worker threads.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the convergence thresholds.
    pub fn with_thresholds(mut self, thresholds: ConvergenceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_lm_iterations == 0 {
            return Err(ConfigError::ZeroLmIterations);
        }
        if self.min_cg_iterations > self.max_cg_iterations {
            return Err(ConfigError::CgIterationBounds {
                min: self.min_cg_iterations,
                max: self.max_cg_iterations,
            });
        }

        let damping_ok = self.min_damping > 0.0
            && self.min_damping <= self.initial_damping
            && self.initial_damping <= self.max_damping
            && self.max_damping.is_finite();
        if !damping_ok {
            return Err(ConfigError::DampingBounds {
                min: self.min_damping,
                initial: self.initial_damping,
                max: self.max_damping,
            });
        }

        let mut checked = vec![
            ("cg_tolerance", self.cg_tolerance),
            ("cg_guard_ratio", self.cg_guard_ratio),
            ("thresholds.delta_norm", self.thresholds.delta_norm),
            ("thresholds.gradient_inf_norm", self.thresholds.gradient_inf_norm),
            ("thresholds.mse", self.thresholds.mse),
        ];
        if let Some(seconds) = self.time_budget_seconds {
            checked.push(("time_budget_seconds", seconds));
        }
        if let Some(damping) = self.isotropic_switch_damping {
            checked.push(("isotropic_switch_damping", damping));
        }
        for (name, value) in checked {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue { name, value });
            }
        }

        Ok(())
    }

    /// Parse a configuration from JSON. Missing fields take their default values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to JSON.
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialization(e.to_string()))
    }
}
