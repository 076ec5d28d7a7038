use crate::{
    scene::{HalfPlane, Scene},
    system::{BuildContext, BuildError, Subsystem, SystemCollection, SystemError},
};

/// Static implicit half-planes read from the scene.
///
/// Half-planes have no vertices, so they live here
/// instead of in the global vertex buffer.
#[derive(Debug, Default)]
pub struct HalfPlaneSystem {
    planes: Vec<HalfPlane>,
    entities: Vec<hecs::Entity>,
}

impl Subsystem for HalfPlaneSystem {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        ctx.mark_engine_aware();
        Ok(())
    }

    fn init_scene(
        &mut self,
        scene: &mut Scene,
        _systems: &mut SystemCollection,
    ) -> Result<(), SystemError> {
        let (entities, planes) = scene.half_planes().into_iter().unzip();
        self.entities = entities;
        self.planes = planes;
        log::debug!("{} half-planes in scene", self.planes.len());
        Ok(())
    }
}

impl HalfPlaneSystem {
    #[inline]
    pub fn planes(&self) -> &[HalfPlane] {
        &self.planes
    }

    #[inline]
    pub fn entities(&self) -> &[hecs::Entity] {
        &self.entities
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.planes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }
}
