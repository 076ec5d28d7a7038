//! Managers for the per-substep steps of the Newton solve:
//! predicting motion, computing gradients and Hessians,
//! and line searching along the solved direction.

use crate::{
    config::LineSearchConfig,
    engine::EngineCreateInfo,
    math::Vec3,
    system::{
        capability_trait, short_name, BuildContext, BuildError, Capability, CapabilitySet,
        CreateSystem, Subsystem, SystemCollection, SystemError,
    },
};

mod particle;
pub use particle::{ParticleJacobiPreconditioner, ParticleSystem};

//
// Prediction
//

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PredictInfo {
    pub dt: f64,
    pub gravity: Vec3,
}

/// A system with degrees of freedom that move between substeps.
pub trait DofPredictorReporter {
    /// Remember the current state and predict where inertia and gravity take it.
    fn predict(&mut self, systems: &SystemCollection, info: &PredictInfo);
    /// Derive velocities from the positions reached in this substep.
    fn compute_velocity(&mut self, systems: &SystemCollection, info: &PredictInfo);
}
capability_trait!(DofPredictorReporter);

pub struct DofPredictor {
    reporters: CapabilitySet<dyn DofPredictorReporter>,
    info: PredictInfo,
}

impl CreateSystem for DofPredictor {
    fn create(info: &EngineCreateInfo) -> Self {
        Self {
            reporters: CapabilitySet::new("DofPredictor"),
            info: PredictInfo {
                dt: info.config.substep_dt(),
                gravity: info.config.gravity,
            },
        }
    }
}

impl Subsystem for DofPredictor {
    fn build(&mut self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        Ok(())
    }
}

impl DofPredictor {
    pub fn add_reporter(
        &mut self,
        reporter: Capability<dyn DofPredictorReporter>,
    ) -> Result<usize, SystemError> {
        self.reporters.insert(reporter)
    }

    pub fn predict(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        let info = self.info;
        for reporter in self.reporters.iter() {
            systems.with_capability(reporter, |r, systems| r.predict(systems, &info))?;
        }
        Ok(())
    }

    pub fn compute_velocity(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        let info = self.info;
        for reporter in self.reporters.iter() {
            systems.with_capability(reporter, |r, systems| r.compute_velocity(systems, &info))?;
        }
        Ok(())
    }

    #[inline]
    pub fn dt(&self) -> f64 {
        self.info.dt
    }

    #[inline]
    pub fn gravity(&self) -> Vec3 {
        self.info.gravity
    }
}

//
// Gradient and Hessian
//

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradientHessianInfo {
    pub dt: f64,
}

/// A system whose energy contributes to the gradient and Hessian
/// it later assembles into the global linear system.
pub trait GradientHessianProducer {
    fn compute_gradient_hessian(
        &mut self,
        systems: &SystemCollection,
        info: &GradientHessianInfo,
    ) -> Result<(), SystemError>;
}
capability_trait!(GradientHessianProducer);

pub struct GradientHessianComputer {
    producers: CapabilitySet<dyn GradientHessianProducer>,
    dt: f64,
}

impl CreateSystem for GradientHessianComputer {
    fn create(info: &EngineCreateInfo) -> Self {
        Self {
            producers: CapabilitySet::new("GradientHessianComputer"),
            dt: info.config.substep_dt(),
        }
    }
}

impl Subsystem for GradientHessianComputer {
    fn build(&mut self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        Ok(())
    }
}

impl GradientHessianComputer {
    pub fn add_producer(
        &mut self,
        producer: Capability<dyn GradientHessianProducer>,
    ) -> Result<usize, SystemError> {
        self.producers.insert(producer)
    }

    pub fn compute(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        let _span = tracy_span!("gradient hessian", "compute");
        let info = GradientHessianInfo { dt: self.dt };
        for producer in self.producers.iter() {
            systems.with_capability(producer, |p, systems| {
                p.compute_gradient_hessian(systems, &info)
            })??;
        }
        Ok(())
    }
}

//
// Line search
//

/// A system with state the line search moves along the search direction.
pub trait LineSearchReporter {
    fn record_start_point(&mut self, systems: &SystemCollection);
    /// Move to `start + alpha * direction`.
    fn step_forward(&mut self, systems: &SystemCollection, alpha: f64);
    fn compute_energy(&mut self, systems: &mut SystemCollection) -> Result<f64, SystemError>;
}
capability_trait!(LineSearchReporter);

pub struct LineSearcher {
    reporters: CapabilitySet<dyn LineSearchReporter>,
    config: LineSearchConfig,
    energies: Vec<(&'static str, f64)>,
}

impl CreateSystem for LineSearcher {
    fn create(info: &EngineCreateInfo) -> Self {
        Self {
            reporters: CapabilitySet::new("LineSearcher"),
            config: info.config.line_search,
            energies: Vec::new(),
        }
    }
}

impl Subsystem for LineSearcher {
    fn build(&mut self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        Ok(())
    }
}

impl LineSearcher {
    pub fn add_reporter(
        &mut self,
        reporter: Capability<dyn LineSearchReporter>,
    ) -> Result<usize, SystemError> {
        self.reporters.insert(reporter)
    }

    #[inline]
    pub fn config(&self) -> &LineSearchConfig {
        &self.config
    }

    pub fn record_start_point(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        for reporter in self.reporters.iter() {
            systems.with_capability(reporter, |r, systems| r.record_start_point(systems))?;
        }
        Ok(())
    }

    pub fn step_forward(&mut self, systems: &mut SystemCollection, alpha: f64) -> Result<(), SystemError> {
        for reporter in self.reporters.iter() {
            systems.with_capability(reporter, |r, systems| r.step_forward(systems, alpha))?;
        }
        Ok(())
    }

    /// Total energy over every reporter.
    pub fn compute_energy(&mut self, systems: &mut SystemCollection) -> Result<f64, SystemError> {
        self.energies.clear();
        for reporter in self.reporters.iter() {
            let energy = systems.with_capability(reporter, |r, systems| r.compute_energy(systems))??;
            self.energies.push((short_name(systems.name(reporter.id())), energy));
        }
        let total: f64 = self.energies.iter().map(|(_, e)| e).sum();
        if self.config.report_energy {
            let parts = self
                .energies
                .iter()
                .map(|(name, e)| format!("{}: {:e}", name, e));
            log::debug!(
                "Line search energy {:e} ({})",
                total,
                itertools::join(parts, ", ")
            );
        }
        Ok(total)
    }

    /// Energy of each reporter from the last [`compute_energy`][Self::compute_energy].
    #[inline]
    pub fn energies(&self) -> &[(&'static str, f64)] {
        &self.energies
    }
}
