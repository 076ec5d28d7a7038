//! The scene an engine simulates.
//!
//! The scene is plain data in a [`hecs`] world. Engines only touch it through
//! a [`SceneVisitor`], and creations and destructions are batched
//! until [`solve_pending`][SceneVisitor::solve_pending] commits them.

use crate::math::Vec3;

/// A simulated point mass.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct ParticleBody {
    pub position: Vec3,
    pub velocity: Vec3,
    pub mass: f64,
    /// Radius of the particle for contact purposes.
    pub thickness: f64,
}

impl ParticleBody {
    pub fn new(position: Vec3, mass: f64) -> Self {
        Self {
            position,
            velocity: Vec3::zero(),
            mass,
            thickness: 0.0,
        }
    }

    #[inline]
    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    #[inline]
    pub fn with_thickness(mut self, thickness: f64) -> Self {
        self.thickness = thickness;
        self
    }
}

/// A static infinite plane. Everything on the side the normal points to is free space.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct HalfPlane {
    pub point: Vec3,
    pub normal: Vec3,
}

impl HalfPlane {
    /// Create a half-plane. The normal is normalized.
    pub fn new(point: Vec3, normal: Vec3) -> Self {
        Self {
            point,
            normal: normal.normalized(),
        }
    }

    /// Signed distance of a point from the plane, positive on the free side.
    #[inline]
    pub fn signed_distance(&self, p: Vec3) -> f64 {
        (p - self.point).dot(self.normal)
    }
}

/// Entities in a hecs world plus the changes waiting to be committed.
#[derive(Default)]
pub struct Scene {
    world: hecs::World,
    pending_create: Vec<hecs::Entity>,
    pending_destroy: Vec<hecs::Entity>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn world(&self) -> &hecs::World {
        &self.world
    }

    /// Direct access to the world.
    ///
    /// Spawning or despawning through this bypasses the pending lists,
    /// so engines won't notice the change. Use [`create`][Self::create]
    /// and [`destroy`][Self::destroy] instead.
    #[inline]
    pub fn world_mut(&mut self) -> &mut hecs::World {
        &mut self.world
    }

    /// Add an object to the scene. It becomes part of the simulation
    /// the next time pending changes are committed.
    pub fn create(&mut self, components: impl hecs::DynamicBundle) -> hecs::Entity {
        let entity = self.world.spawn(components);
        self.pending_create.push(entity);
        entity
    }

    /// Mark an object for removal the next time pending changes are committed.
    pub fn destroy(&mut self, entity: hecs::Entity) {
        if !self.pending_destroy.contains(&entity) {
            self.pending_destroy.push(entity);
        }
    }

    /// Convenience for creating a particle.
    pub fn add_particle(&mut self, particle: ParticleBody) -> hecs::Entity {
        self.create((particle,))
    }

    /// Convenience for creating a half-plane.
    pub fn add_half_plane(&mut self, plane: HalfPlane) -> hecs::Entity {
        self.create((plane,))
    }

    pub fn visitor(&mut self) -> SceneVisitor<'_> {
        SceneVisitor { scene: self }
    }

    /// All committed particles in a stable order.
    pub fn particles(&self) -> Vec<(hecs::Entity, ParticleBody)> {
        self.committed::<ParticleBody>()
    }

    /// All committed half-planes in a stable order.
    pub fn half_planes(&self) -> Vec<(hecs::Entity, HalfPlane)> {
        self.committed::<HalfPlane>()
    }

    fn committed<T: hecs::Component + Copy>(&self) -> Vec<(hecs::Entity, T)> {
        let mut items: Vec<(hecs::Entity, T)> = self
            .world
            .query::<&T>()
            .iter()
            .filter(|(e, _)| !self.pending_create.contains(e))
            .map(|(e, t)| (e, *t))
            .collect();
        items.sort_by_key(|(e, _)| e.id());
        items
    }
}

/// Read/write view of a scene handed to an engine.
pub struct SceneVisitor<'a> {
    scene: &'a mut Scene,
}

impl<'a> SceneVisitor<'a> {
    #[inline]
    pub fn scene(&self) -> &Scene {
        &*self.scene
    }

    #[inline]
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut *self.scene
    }

    #[inline]
    pub fn pending_create(&self) -> &[hecs::Entity] {
        &self.scene.pending_create
    }

    #[inline]
    pub fn pending_destroy(&self) -> &[hecs::Entity] {
        &self.scene.pending_destroy
    }

    /// Whether the set of objects changed since the last commit.
    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.scene.pending_create.is_empty() || !self.scene.pending_destroy.is_empty()
    }

    /// Commit pending creations and destructions.
    pub fn solve_pending(&mut self) {
        for entity in self.scene.pending_destroy.drain(..) {
            self.scene.world.despawn(entity).ok();
        }
        self.scene.pending_create.clear();
    }
}
