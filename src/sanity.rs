//! Advisory checks on the scene, run when it is initialized or rebuilt.
//!
//! Checks never stop the simulation. The engine records what they find
//! in its status collection once the frame is done.

use crate::{scene::Scene, system::SystemCollection};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SanityCheckResult {
    Success,
    Warning(String),
    Error(String),
}

impl SanityCheckResult {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, SanityCheckResult::Success)
    }
}

pub trait SanityCheck {
    fn name(&self) -> &'static str;
    fn check(&mut self, scene: &Scene, systems: &SystemCollection) -> SanityCheckResult;
}

/// Particles need a positive, finite mass for the system to be solvable.
#[derive(Debug, Default)]
pub struct ParticleMassCheck;

impl SanityCheck for ParticleMassCheck {
    fn name(&self) -> &'static str {
        "ParticleMass"
    }

    fn check(&mut self, scene: &Scene, _systems: &SystemCollection) -> SanityCheckResult {
        let bad: Vec<String> = scene
            .particles()
            .iter()
            .filter(|(_, p)| !(p.mass.is_finite() && p.mass > 0.0))
            .map(|(e, p)| format!("{:?} (mass {})", e, p.mass))
            .collect();
        if bad.is_empty() {
            SanityCheckResult::Success
        } else {
            SanityCheckResult::Error(format!(
                "particles without a positive mass: {}",
                bad.join(", ")
            ))
        }
    }
}

/// Particles should start on the free side of every half-plane.
#[derive(Debug, Default)]
pub struct HalfPlaneSeparationCheck;

impl SanityCheck for HalfPlaneSeparationCheck {
    fn name(&self) -> &'static str {
        "HalfPlaneSeparation"
    }

    fn check(&mut self, scene: &Scene, _systems: &SystemCollection) -> SanityCheckResult {
        let planes = scene.half_planes();
        let penetrating = scene
            .particles()
            .iter()
            .filter(|(_, p)| {
                planes
                    .iter()
                    .any(|(_, plane)| plane.signed_distance(p.position) - p.thickness < 0.0)
            })
            .count();
        if penetrating == 0 {
            SanityCheckResult::Success
        } else {
            SanityCheckResult::Warning(format!(
                "{} particles start inside a half-plane",
                penetrating
            ))
        }
    }
}

/// The checks an engine runs, in order.
pub struct SanityCheckerCollection {
    checks: Vec<Box<dyn SanityCheck>>,
    strict: bool,
}

impl SanityCheckerCollection {
    /// An empty collection. In strict mode warnings are reported as errors.
    pub fn new(strict: bool) -> Self {
        Self {
            checks: Vec::new(),
            strict,
        }
    }

    /// A collection with the checks for built-in scene objects.
    pub fn with_builtin_checks(strict: bool) -> Self {
        let mut checks = Self::new(strict);
        checks.add(ParticleMassCheck);
        checks.add(HalfPlaneSeparationCheck);
        checks
    }

    pub fn add(&mut self, check: impl SanityCheck + 'static) {
        self.checks.push(Box::new(check));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check, returning the ones that didn't succeed.
    pub fn check(
        &mut self,
        scene: &Scene,
        systems: &SystemCollection,
    ) -> Vec<(&'static str, SanityCheckResult)> {
        let _span = tracy_span!("sanity check", "check");
        let strict = self.strict;
        self.checks
            .iter_mut()
            .map(|c| (c.name(), c.check(scene, systems)))
            .filter(|(_, result)| !result.is_success())
            .map(|(name, result)| match result {
                SanityCheckResult::Warning(msg) if strict => (name, SanityCheckResult::Error(msg)),
                other => (name, other),
            })
            .inspect(|(name, result)| log::debug!("Sanity check {}: {:?}", name, result))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::EngineCreateInfo,
        math::Vec3,
        scene::{HalfPlane, ParticleBody},
        system::SystemRegistry,
    };

    fn scene() -> Scene {
        let mut scene = Scene::new();
        scene.add_half_plane(HalfPlane::new(Vec3::zero(), Vec3::unit_y()));
        scene.add_particle(ParticleBody::new(Vec3::new(0.0, 1.0, 0.0), 1.0));
        scene.add_particle(ParticleBody::new(Vec3::new(0.0, 0.05, 0.0), 0.0).with_thickness(0.1));
        scene.visitor().solve_pending();
        scene
    }

    #[test]
    fn reports_failures_only() {
        let scene = scene();
        let systems = SystemCollection::new(&SystemRegistry::new(), EngineCreateInfo::default());

        let mut checks = SanityCheckerCollection::with_builtin_checks(false);
        assert_eq!(checks.len(), 2);
        let results = checks.check(&scene, &systems);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "ParticleMass");
        assert!(matches!(results[0].1, SanityCheckResult::Error(_)));
        assert_eq!(results[1].0, "HalfPlaneSeparation");
        assert!(matches!(results[1].1, SanityCheckResult::Warning(_)));

        let mut strict = SanityCheckerCollection::with_builtin_checks(true);
        let results = strict.check(&scene, &systems);
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, SanityCheckResult::Error(_))));
    }

    #[test]
    fn empty_scene_passes() {
        let systems = SystemCollection::new(&SystemRegistry::new(), EngineCreateInfo::default());
        let mut checks = SanityCheckerCollection::with_builtin_checks(true);
        assert!(checks.check(&Scene::new(), &systems).is_empty());
    }
}
