//! A scene paired with the engine that simulates it.

use crate::{
    engine::{Engine, EngineError},
    scene::Scene,
    status::EngineStatusCollection,
};

/// Owns a [`Scene`] and drives an [`Engine`] over it.
///
/// # Example
/// ```
/// # use simframe::*;
/// let mut registry = SystemRegistry::new();
/// register_builtin_systems(&mut registry)?;
/// let engine = create_engine(EngineCreateInfo::default(), &registry)?;
///
/// let mut world = World::new(engine);
/// world.scene_mut().add_particle(ParticleBody::new(Vec3::new(0.0, 1.0, 0.0), 1.0));
/// world.init()?;
/// world.advance()?;
/// world.retrieve()?;
/// assert_eq!(world.frame(), 1);
/// # Ok::<(), EngineError>(())
/// ```
pub struct World {
    scene: Scene,
    engine: Box<dyn Engine>,
}

impl World {
    pub fn new(engine: impl Engine + 'static) -> Self {
        Self::with_scene(engine, Scene::new())
    }

    pub fn with_scene(engine: impl Engine + 'static, scene: Scene) -> Self {
        World {
            scene,
            engine: Box::new(engine),
        }
    }

    #[inline]
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    #[inline]
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    #[inline]
    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Hand the scene to the engine for the first time.
    pub fn init(&mut self) -> Result<(), EngineError> {
        self.engine.init(self.scene.visitor())
    }

    /// Simulate one frame.
    pub fn advance(&mut self) -> Result<(), EngineError> {
        self.engine.advance(self.scene.visitor())?;
        self.engine.sync()
    }

    /// Copy the simulation state into the scene's components.
    pub fn retrieve(&mut self) -> Result<(), EngineError> {
        self.engine.retrieve(self.scene.visitor())
    }

    #[inline]
    pub fn frame(&self) -> usize {
        self.engine.frame()
    }

    #[inline]
    pub fn status(&self) -> &EngineStatusCollection {
        self.engine.status()
    }

    /// Take every status message recorded so far.
    pub fn drain_status(&mut self) -> Vec<crate::status::EngineStatus> {
        self.engine.status_mut().drain()
    }
}
