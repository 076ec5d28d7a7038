//! Engine configuration.
//!
//! Every section has sensible defaults,
//! so a configuration document only needs to name the values it changes.

use crate::math::Vec3;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct EngineConfig {
    /// Length of one frame in seconds.
    pub dt: f64,
    pub gravity: Vec3,
    /// Number of substeps each frame is divided into.
    pub substep_ratio: usize,
    pub newton: NewtonConfig,
    pub line_search: LineSearchConfig,
    pub linear_solver: LinearSolverConfig,
    pub contact: ContactConfig,
    pub collision: CollisionConfig,
    /// Treat sanity check warnings as errors.
    pub strict_mode: bool,
    /// Number of frames in a row the Newton iteration may fail to converge
    /// before the engine reports an error status.
    pub max_consecutive_failures: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            gravity: Vec3::new(0.0, -9.8, 0.0),
            substep_ratio: 1,
            newton: NewtonConfig::default(),
            line_search: LineSearchConfig::default(),
            linear_solver: LinearSolverConfig::default(),
            contact: ContactConfig::default(),
            collision: CollisionConfig::default(),
            strict_mode: false,
            max_consecutive_failures: 3,
        }
    }
}

impl EngineConfig {
    /// Time step of a single substep.
    #[inline]
    pub fn substep_dt(&self) -> f64 {
        self.dt / self.substep_ratio.max(1) as f64
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct NewtonConfig {
    pub max_iter: usize,
    /// The iteration has converged when the largest displacement
    /// divided by the time step falls below this.
    pub velocity_tol: f64,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            max_iter: 32,
            velocity_tol: 0.05,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct LineSearchConfig {
    pub max_iter: usize,
    /// Step length below which backtracking gives up.
    pub min_alpha: f64,
    /// Log the energy of every line search step at debug level.
    pub report_energy: bool,
}

impl Default for LineSearchConfig {
    fn default() -> Self {
        Self {
            max_iter: 8,
            min_alpha: 1e-4,
            report_energy: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct LinearSolverConfig {
    pub max_iter: usize,
    /// Converged when the residual norm is below this fraction of the right-hand side norm.
    pub tol_rate: f64,
}

impl Default for LinearSolverConfig {
    fn default() -> Self {
        Self {
            max_iter: 1024,
            tol_rate: 1e-6,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct ContactConfig {
    pub enable: bool,
    /// Default activation distance, used by reporters without their own.
    pub d_hat: f64,
    /// Default contact stiffness.
    pub kappa: f64,
    pub eps_velocity: f64,
    /// Fraction of the starting gap between two primitives that
    /// continuous collision detection lets one step close.
    pub ccd_slackness: f64,
}

impl Default for ContactConfig {
    fn default() -> Self {
        Self {
            enable: true,
            d_hat: 0.01,
            kappa: 1e4,
            eps_velocity: 0.01,
            ccd_slackness: 0.8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct CollisionConfig {
    /// Growth factor for candidate pair buffers when they overflow.
    pub reserve_ratio: f64,
    pub initial_capacity: usize,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            reserve_ratio: 1.5,
            initial_capacity: 1024,
        }
    }
}
