//! The engine drives registered subsystems through the stages of every frame.
//!
//! One frame is `substep_ratio` substeps of implicit time integration.
//! Each substep predicts where every degree of freedom would go without
//! internal forces, then runs Newton iterations on the incremental potential
//! until the displacement per step is small enough:
//!
//! 1. contact candidates are found and contact gradients and Hessians computed,
//! 2. the global linear system is assembled and solved for a search direction,
//! 3. a line search, bounded by continuous collision detection,
//!    backtracks until the energy decreases.
//!
//! Velocities are finally recovered from the change in position.

use std::path::PathBuf;

use crate::{
    collision::GlobalCollisionFilter,
    config::EngineConfig,
    contact::GlobalContactManager,
    dynamics::{DofPredictor, GradientHessianComputer, LineSearcher},
    geometry::GlobalVertexManager,
    linear::GlobalLinearSystem,
    sanity::{SanityCheckResult, SanityCheckerCollection},
    scene::{Scene, SceneVisitor},
    status::EngineStatusCollection,
    system::{SystemCollection, SystemError, SystemRegistry, SystemSlot},
    util::statemachine::{Stage, StageError, StageMachine},
};

/// Everything an engine is created from.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct EngineCreateInfo {
    /// Directory for files the engine or its subsystems write.
    pub workspace: PathBuf,
    pub config: EngineConfig,
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    System(#[from] SystemError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("Engine halted after a fatal error")]
    Halted,
    #[error("Engine was used before its scene was initialized")]
    NotInitialized,
}

/// The interface a [`World`][crate::world::World] drives a simulation backend through.
pub trait Engine {
    /// Read the scene for the first time. Commits pending scene changes.
    fn init(&mut self, scene: SceneVisitor<'_>) -> Result<(), EngineError>;
    /// Simulate one frame, first picking up any objects created or destroyed since the last one.
    fn advance(&mut self, scene: SceneVisitor<'_>) -> Result<(), EngineError>;
    /// Finish the frame's bookkeeping.
    fn sync(&mut self) -> Result<(), EngineError>;
    /// Write simulation state back into the scene.
    fn retrieve(&mut self, scene: SceneVisitor<'_>) -> Result<(), EngineError>;
    /// Number of frames simulated so far.
    fn frame(&self) -> usize;
    fn status(&self) -> &EngineStatusCollection;
    fn status_mut(&mut self) -> &mut EngineStatusCollection;
}

/// Create an engine with every subsystem in `registry`.
///
/// All registered systems are built immediately.
/// Systems that disable themselves are logged and skipped,
/// but the core managers must all be present.
pub fn create_engine(
    info: EngineCreateInfo,
    registry: &SystemRegistry,
) -> Result<SimEngine, EngineError> {
    SimEngine::new(info, registry)
}

/// Tear down an engine. Equivalent to dropping it, with a log line.
pub fn destroy_engine(engine: impl Engine) {
    log::info!("Destroying engine after {} frames", engine.frame());
}

//
// The engine
//

pub struct SimEngine {
    systems: SystemCollection,
    stages: StageMachine,
    status: EngineStatusCollection,
    sanity: SanityCheckerCollection,
    sanity_results: Vec<(&'static str, SanityCheckResult)>,
    vertices: SystemSlot<GlobalVertexManager>,
    linear: SystemSlot<GlobalLinearSystem>,
    predictor: SystemSlot<DofPredictor>,
    computer: SystemSlot<GradientHessianComputer>,
    searcher: SystemSlot<LineSearcher>,
    contact: Option<SystemSlot<GlobalContactManager>>,
    collision: Option<SystemSlot<GlobalCollisionFilter>>,
    initialized: bool,
    halted: bool,
    consecutive_failures: usize,
}

impl SimEngine {
    fn new(info: EngineCreateInfo, registry: &SystemRegistry) -> Result<Self, EngineError> {
        let _span = tracy_span!("create engine", "new");

        let strict = info.config.strict_mode;
        let mut stages = StageMachine::new();
        stages.transition(Stage::BuildSystems)?;

        let mut systems = SystemCollection::new(registry, info);
        systems.build_all()?;
        let vertices = systems.resolve::<GlobalVertexManager>()?;
        let linear = systems.resolve::<GlobalLinearSystem>()?;
        let predictor = systems.resolve::<DofPredictor>()?;
        let computer = systems.resolve::<GradientHessianComputer>()?;
        let searcher = systems.resolve::<LineSearcher>()?;
        let contact = systems.find::<GlobalContactManager>();
        let collision = systems.find::<GlobalCollisionFilter>();
        log::debug!("{}", systems);

        Ok(Self {
            systems,
            stages,
            status: EngineStatusCollection::new(),
            sanity: SanityCheckerCollection::with_builtin_checks(strict),
            sanity_results: Vec::new(),
            vertices,
            linear,
            predictor,
            computer,
            searcher,
            contact,
            collision,
            initialized: false,
            halted: false,
            consecutive_failures: 0,
        })
    }

    #[inline]
    pub fn systems(&self) -> &SystemCollection {
        &self.systems
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        self.stages.current()
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn sanity_checks_mut(&mut self) -> &mut SanityCheckerCollection {
        &mut self.sanity
    }

    /// Run `f` unless the engine has halted, halting it if `f` fails.
    fn guarded<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        if self.halted {
            return Err(EngineError::Halted);
        }
        let ret = f(self);
        if let Err(err) = &ret {
            log::error!("Fatal engine error: {}", err);
            self.halted = true;
            let frame = self.stages.frame();
            self.status.error(frame, err.to_string());
        }
        ret
    }

    //
    // Scene hooks
    //

    fn init_systems(&mut self, scene: &mut Scene) -> Result<(), EngineError> {
        for id in self.systems.engine_aware_systems() {
            self.systems
                .with_dyn(id, |system, systems| system.init_scene(scene, systems))??;
        }
        self.init_managers(scene)
    }

    fn rebuild_systems(&mut self, scene: &mut Scene) -> Result<(), EngineError> {
        for id in self.systems.engine_aware_systems() {
            self.systems
                .with_dyn(id, |system, systems| system.rebuild_scene(scene, systems))??;
        }
        self.systems
            .with_system(self.vertices, |vm, systems| vm.rebuild(systems))??;
        self.systems
            .with_system(self.linear, |ls, systems| ls.init(systems))??;
        self.sanity_results = self.sanity.check(scene, &self.systems);
        Ok(())
    }

    fn init_managers(&mut self, scene: &Scene) -> Result<(), EngineError> {
        self.systems
            .with_system(self.vertices, |vm, systems| vm.init(systems))??;
        self.systems
            .with_system(self.linear, |ls, systems| ls.init(systems))??;
        if let Some(contact) = self.contact {
            self.systems
                .with_system(contact, |c, systems| c.update_d_hat(systems))??;
        }
        self.sanity_results = self.sanity.check(scene, &self.systems);
        Ok(())
    }

    fn write_systems(&mut self, scene: &mut Scene) -> Result<(), EngineError> {
        for id in self.systems.engine_aware_systems() {
            self.systems
                .with_dyn(id, |system, systems| system.write_scene(scene, systems))?;
        }
        Ok(())
    }

    //
    // Simulation
    //

    fn advance_frame(&mut self, mut scene: SceneVisitor<'_>) -> Result<(), EngineError> {
        let _span = tracy_span!("advance frame", "advance_frame");
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }

        if scene.has_pending() {
            self.stages.transition(Stage::RebuildScene)?;
            // keep the state of existing objects before they are re-read
            self.write_systems(scene.scene_mut())?;
            scene.solve_pending();
            self.rebuild_systems(scene.scene_mut())?;
            log::debug!("Rebuilt scene at frame {}", self.stages.frame());
        }

        let substeps = self.systems.config().substep_ratio.max(1);
        let mut converged = true;
        for _ in 0..substeps {
            converged &= self.substep()?;
        }

        let frame = self.stages.frame();
        if converged {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            let max_failures = self.systems.config().max_consecutive_failures;
            if self.consecutive_failures > max_failures {
                self.status.error(
                    frame,
                    format!(
                        "Newton iteration failed to converge in {} consecutive frames",
                        self.consecutive_failures
                    ),
                );
            } else {
                self.status
                    .warning(frame, "Newton iteration did not converge this frame");
            }
        }
        self.stages.finish_frame();
        Ok(())
    }

    /// One step of implicit integration. Returns whether Newton converged.
    fn substep(&mut self) -> Result<bool, EngineError> {
        let _span = tracy_span!("substep", "substep");
        let config = self.systems.config().clone();
        let dt = config.substep_dt();

        self.stages.transition(Stage::PredictMotion)?;
        self.systems
            .with_system(self.predictor, |p, systems| p.predict(systems))??;
        self.systems.get_mut(self.vertices)?.record_prev_positions();
        if let Some(contact) = self.contact {
            self.systems
                .with_system(contact, |c, systems| c.update_d_hat(systems))??;
        }

        let mut converged = false;
        for _ in 0..config.newton.max_iter.max(1) {
            self.stages.transition(Stage::ComputeGradientHessian)?;
            self.compute_gradient_hessian()?;

            self.stages.transition(Stage::SolveGlobalLinearSystem)?;
            let report = self
                .systems
                .with_system(self.linear, |ls, systems| ls.solve(systems))??;
            if !report.converged {
                self.status.warning(
                    self.stages.frame(),
                    format!(
                        "Linear solver stopped after {} iterations with residual {:e}",
                        report.iterations, report.residual
                    ),
                );
            }
            let max_disp = self
                .systems
                .with_system(self.vertices, |vm, systems| -> Result<f64, SystemError> {
                    vm.collect_vertex_displacements(systems)?;
                    Ok(vm.compute_axis_max_displacement())
                })??;

            self.stages.transition(Stage::LineSearch)?;
            log::trace!(
                "Newton iteration {}: max displacement {:e}",
                self.stages.newton_iter(),
                max_disp
            );
            if max_disp / dt <= config.newton.velocity_tol {
                converged = true;
                break;
            }
            self.line_search()?;
        }
        if !converged {
            log::warn!(
                "Newton iteration did not converge in {} iterations at frame {}",
                config.newton.max_iter,
                self.stages.frame()
            );
        }

        self.stages.transition(Stage::UpdateVelocity)?;
        self.systems
            .with_system(self.predictor, |p, systems| p.compute_velocity(systems))??;
        Ok(converged)
    }

    fn compute_gradient_hessian(&mut self) -> Result<(), EngineError> {
        if let Some(collision) = self.collision {
            self.systems
                .with_system(collision, |f, systems| -> Result<(), SystemError> {
                    f.detect(systems, 0.0)?;
                    f.filter_active(systems)
                })??;
        }
        if let Some(contact) = self.contact {
            self.systems
                .with_system(contact, |c, systems| c.compute_gradient_hessian(systems))??;
        }
        self.systems
            .with_system(self.computer, |c, systems| c.compute(systems))??;
        Ok(())
    }

    /// Backtracking line search along the last solution,
    /// starting from the largest collision-free step.
    fn line_search(&mut self) -> Result<(), EngineError> {
        let _span = tracy_span!("line search", "line_search");
        let mut alpha = 1.0;
        if let Some(collision) = self.collision {
            alpha = self
                .systems
                .with_system(collision, |f, systems| -> Result<f64, SystemError> {
                    f.detect(systems, 1.0)?;
                    f.filter_toi(systems, 1.0)
                })??;
        }

        let searcher = self.searcher;
        let vertices = self.vertices;
        let config = *self.systems.get(searcher)?.config();
        let e0 = self
            .systems
            .with_system(searcher, |s, systems| -> Result<f64, SystemError> {
                s.record_start_point(systems)?;
                systems.get_mut(vertices)?.record_start_point();
                s.compute_energy(systems)
            })??;

        let mut iter = 0;
        loop {
            iter += 1;
            let e = self
                .systems
                .with_system(searcher, |s, systems| -> Result<f64, SystemError> {
                    s.step_forward(systems, alpha)?;
                    systems.get_mut(vertices)?.step_forward(alpha);
                    s.compute_energy(systems)
                })??;
            if e <= e0 {
                break;
            }
            if alpha * 0.5 < config.min_alpha || iter >= config.max_iter {
                log::warn!(
                    "Line search could not decrease energy {:e} -> {:e}, keeping alpha = {:e}",
                    e0,
                    e,
                    alpha
                );
                self.status.warning(
                    self.stages.frame(),
                    format!("Line search stopped at alpha = {:e}", alpha),
                );
                break;
            }
            alpha *= 0.5;
        }
        log::trace!("Line search accepted alpha = {:e} after {} steps", alpha, iter);
        Ok(())
    }

    fn surface_sanity_results(&mut self) {
        let frame = self.stages.frame();
        for (name, result) in self.sanity_results.drain(..) {
            match result {
                SanityCheckResult::Success => (),
                SanityCheckResult::Warning(msg) => {
                    self.status.warning(frame, format!("{}: {}", name, msg))
                }
                SanityCheckResult::Error(msg) => {
                    self.status.error(frame, format!("{}: {}", name, msg))
                }
            }
        }
    }
}

impl Engine for SimEngine {
    fn init(&mut self, mut scene: SceneVisitor<'_>) -> Result<(), EngineError> {
        self.guarded(|this| {
            let _span = tracy_span!("init scene", "init");
            this.stages.transition(Stage::InitScene)?;
            scene.solve_pending();
            this.init_systems(scene.scene_mut())?;
            this.initialized = true;
            log::info!(
                "Scene initialized with {} vertices and {} degrees of freedom",
                this.systems.get(this.vertices)?.vertex_count(),
                this.systems.get(this.linear)?.dof_count()
            );
            Ok(())
        })
    }

    fn advance(&mut self, scene: SceneVisitor<'_>) -> Result<(), EngineError> {
        self.guarded(|this| this.advance_frame(scene))
    }

    fn sync(&mut self) -> Result<(), EngineError> {
        self.guarded(|this| {
            this.surface_sanity_results();
            Ok(())
        })
    }

    fn retrieve(&mut self, mut scene: SceneVisitor<'_>) -> Result<(), EngineError> {
        self.guarded(|this| this.write_systems(scene.scene_mut()))
    }

    #[inline]
    fn frame(&self) -> usize {
        self.stages.frame()
    }

    #[inline]
    fn status(&self) -> &EngineStatusCollection {
        &self.status
    }

    #[inline]
    fn status_mut(&mut self) -> &mut EngineStatusCollection {
        &mut self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builtin::register_builtin_systems,
        collision::VertexVertexFilter,
        dynamics::ParticleSystem,
        math::Vec3,
        scene::{HalfPlane, ParticleBody},
        status::StatusKind,
    };

    fn builtin_engine(config: EngineConfig) -> SimEngine {
        let mut registry = SystemRegistry::new();
        register_builtin_systems(&mut registry).unwrap();
        let info = EngineCreateInfo {
            config,
            ..Default::default()
        };
        create_engine(info, &registry).unwrap()
    }

    fn step(engine: &mut SimEngine, scene: &mut Scene) {
        engine.advance(scene.visitor()).unwrap();
        engine.sync().unwrap();
        engine.retrieve(scene.visitor()).unwrap();
    }

    /// A particle dropped onto the ground never passes through it
    /// and comes to rest within the contact activation distance.
    #[test]
    fn particle_rests_on_ground() {
        let config = EngineConfig::default();
        let d_hat = config.contact.d_hat;
        let mut engine = builtin_engine(config);
        let mut scene = Scene::new();
        scene.add_half_plane(HalfPlane::new(Vec3::zero(), Vec3::new(0.0, 1.0, 0.0)));
        let particle = scene.add_particle(ParticleBody::new(Vec3::new(0.0, 0.1, 0.0), 1.0));
        engine.init(scene.visitor()).unwrap();

        for _ in 0..100 {
            step(&mut engine, &mut scene);
            let body = *scene.world().get::<&ParticleBody>(particle).unwrap();
            assert!(body.position.y > 0.0, "fell through at {:?}", body.position);
        }

        let body = *scene.world().get::<&ParticleBody>(particle).unwrap();
        assert!(body.position.y < d_hat + 1e-3);
        assert!(body.velocity.mag() < 0.1);
        assert_eq!(engine.frame(), 100);
        assert!(!engine.status().has_errors());
    }

    /// The resting particle behaves the same when each frame is split into substeps.
    #[test]
    fn particle_rests_on_ground_with_substeps() {
        let mut config = EngineConfig::default();
        config.substep_ratio = 4;
        let d_hat = config.contact.d_hat;
        let mut engine = builtin_engine(config);
        let mut scene = Scene::new();
        scene.add_half_plane(HalfPlane::new(Vec3::zero(), Vec3::new(0.0, 1.0, 0.0)));
        let particle = scene.add_particle(ParticleBody::new(Vec3::new(0.0, 0.1, 0.0), 1.0));
        engine.init(scene.visitor()).unwrap();

        for _ in 0..100 {
            step(&mut engine, &mut scene);
            let body = *scene.world().get::<&ParticleBody>(particle).unwrap();
            assert!(body.position.y > 0.0, "fell through at {:?}", body.position);
        }

        let body = *scene.world().get::<&ParticleBody>(particle).unwrap();
        assert!(body.position.y < d_hat + 1e-3);
        assert!(body.velocity.mag() < 0.1);
        assert_eq!(engine.frame(), 100);
        assert!(!engine.status().has_errors());
    }

    /// A fast zero-thickness particle landing on another one never passes it.
    #[test]
    fn stacked_points_keep_their_order() {
        let mut engine = builtin_engine(EngineConfig::default());
        let mut scene = Scene::new();
        scene.add_half_plane(HalfPlane::new(Vec3::zero(), Vec3::new(0.0, 1.0, 0.0)));
        let below = scene.add_particle(ParticleBody::new(Vec3::new(0.0, 0.1, 0.0), 1.0));
        let above = scene.add_particle(
            ParticleBody::new(Vec3::new(0.0, 0.3, 0.0), 1.0).with_velocity(Vec3::new(0.0, -5.0, 0.0)),
        );
        engine.init(scene.visitor()).unwrap();

        for frame in 0..40 {
            step(&mut engine, &mut scene);
            let a = *scene.world().get::<&ParticleBody>(below).unwrap();
            let b = *scene.world().get::<&ParticleBody>(above).unwrap();
            assert!(a.position.y > 0.0, "frame {}: fell through at {:?}", frame, a.position);
            assert!(
                b.position.y > a.position.y,
                "frame {}: swapped order, {:?} below {:?}",
                frame,
                b.position,
                a.position
            );
        }
    }

    /// A pair close enough to be active but without a usable normal
    /// contributes no contact entries at all.
    #[test]
    fn degenerate_pair_adds_no_contact_entries() {
        let mut engine = builtin_engine(EngineConfig::default());
        let mut scene = Scene::new();
        scene.add_particle(ParticleBody::new(Vec3::new(0.0, 1.0, 0.0), 1.0));
        scene.add_particle(ParticleBody::new(Vec3::new(0.0, 1.0, 0.0), 1.0));
        engine.init(scene.visitor()).unwrap();
        step(&mut engine, &mut scene);

        let systems = engine.systems();
        let filter = systems.find::<VertexVertexFilter>().unwrap();
        assert_eq!(systems.get(filter).unwrap().active_pairs(), &[(0, 1)]);
        let contact = systems.find::<GlobalContactManager>().unwrap();
        let contact = systems.get(contact).unwrap();
        assert!(contact.gradients().is_empty());
        assert!(contact.hessians().is_empty());
    }

    /// Objects created between frames join the simulation on the next frame,
    /// and existing objects keep their state.
    #[test]
    fn rebuild_after_creating_particle() {
        let mut config = EngineConfig::default();
        config.contact.enable = false;
        let mut engine = builtin_engine(config);
        let mut scene = Scene::new();
        let first = scene.add_particle(ParticleBody::new(Vec3::new(0.0, 1.0, 0.0), 1.0));
        engine.init(scene.visitor()).unwrap();
        for _ in 0..5 {
            step(&mut engine, &mut scene);
        }
        let before = *scene.world().get::<&ParticleBody>(first).unwrap();
        assert!(before.velocity.y < 0.0);

        scene.add_particle(ParticleBody::new(Vec3::new(5.0, 1.0, 0.0), 2.0));
        step(&mut engine, &mut scene);

        let particles = engine.systems().find::<ParticleSystem>().unwrap();
        assert_eq!(engine.systems().get(particles).unwrap().len(), 2);
        let vertices = engine.systems().find::<GlobalVertexManager>().unwrap();
        assert_eq!(engine.systems().get(vertices).unwrap().vertex_count(), 2);
        let linear = engine.systems().find::<GlobalLinearSystem>().unwrap();
        assert_eq!(engine.systems().get(linear).unwrap().dof_count(), 6);

        let after = *scene.world().get::<&ParticleBody>(first).unwrap();
        assert!(after.position.y < before.position.y);
        assert!(after.velocity.y < before.velocity.y);
    }

    #[test]
    fn advance_before_init_halts() {
        let mut engine = builtin_engine(EngineConfig::default());
        let mut scene = Scene::new();
        assert!(matches!(
            engine.advance(scene.visitor()),
            Err(EngineError::NotInitialized)
        ));
        assert!(engine.is_halted());
        assert!(matches!(
            engine.init(scene.visitor()),
            Err(EngineError::Halted)
        ));
        assert_eq!(engine.status().count(StatusKind::Error), 1);
        destroy_engine(engine);
    }

    /// Sanity problems are reported through the status after the frame,
    /// without stopping the simulation.
    #[test]
    fn sanity_results_surface_on_sync() {
        let mut engine = builtin_engine(EngineConfig::default());
        let mut scene = Scene::new();
        scene.add_half_plane(HalfPlane::new(Vec3::zero(), Vec3::new(0.0, 1.0, 0.0)));
        scene.add_particle(ParticleBody::new(Vec3::new(0.0, -0.5, 0.0), 1.0));
        engine.init(scene.visitor()).unwrap();
        assert!(engine.status().is_empty());

        engine.sync().unwrap();
        assert_eq!(engine.status().count(StatusKind::Warning), 1);
        assert!(!engine.is_halted());
    }
}
