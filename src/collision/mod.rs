//! Collision candidate generation.
//!
//! Filters look at the trajectories of vertices in the
//! [`GlobalVertexManager`][crate::geometry::GlobalVertexManager] buffers,
//! from the current positions along `alpha` times the current displacements.
//! Discrete filters ([`DcdFilter`]) find candidate pairs close enough to
//! interact and narrow them down to the pairs active at the current positions.
//! Continuous filters ([`CcdFilter`]) find how far along the trajectory
//! everything can move before some pair touches.

use crate::{
    contact::GlobalContactManager,
    geometry::GlobalVertexManager,
    system::{
        capability_trait, resolved, BuildContext, BuildError, Capability, CapabilitySet,
        Subsystem, SystemCollection, SystemError, SystemSlot,
    },
};

mod half_plane;
pub use half_plane::VertexHalfPlaneFilter;

mod vertex_vertex;
pub use vertex_vertex::VertexVertexFilter;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectInfo {
    /// Fraction of the current displacements the trajectory covers.
    pub alpha: f64,
    /// Contact activation distance.
    pub d_hat: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterToiInfo {
    pub alpha: f64,
    pub d_hat: f64,
    /// Fraction of the starting gap between two primitives a step is allowed to close.
    pub slackness: f64,
}

/// Fraction of `d_hat` below which continuous detection stops any further approach.
const MIN_GAP_RATIO: f64 = 0.1;

impl FilterToiInfo {
    /// The gap a pair that starts `gap0` apart may close down to in one step.
    ///
    /// Always positive for a positive `gap0`, so a step never ends with primitives touching.
    #[inline]
    pub fn target_gap(&self, gap0: f64) -> f64 {
        let floor = gap0.min(MIN_GAP_RATIO * self.d_hat);
        ((1.0 - self.slackness) * gap0).max(floor)
    }
}

/// Discrete collision detection.
pub trait DcdFilter {
    /// Find every pair whose trajectories come within `d_hat` of each other.
    fn detect(&mut self, systems: &SystemCollection, info: &DetectInfo) -> Result<(), SystemError>;

    /// Keep the candidates within `d_hat` at the current positions,
    /// marking the vertices involved in `active_vertices`.
    fn filter_active(
        &mut self,
        systems: &SystemCollection,
        info: &DetectInfo,
        active_vertices: &mut [bool],
    ) -> Result<(), SystemError>;
}
capability_trait!(DcdFilter);

/// Continuous collision detection.
pub trait CcdFilter {
    /// Largest step length no greater than `info.alpha` that keeps every
    /// candidate pair of this filter from touching.
    fn filter_toi(
        &mut self,
        systems: &SystemCollection,
        info: &FilterToiInfo,
    ) -> Result<f64, SystemError>;
}
capability_trait!(CcdFilter);

/// Drives every registered collision filter.
pub struct GlobalCollisionFilter {
    dcd_filters: CapabilitySet<dyn DcdFilter>,
    ccd_filters: CapabilitySet<dyn CcdFilter>,
    vertices: Option<SystemSlot<GlobalVertexManager>>,
    contact: Option<SystemSlot<GlobalContactManager>>,
    slackness: f64,
    active_vertices: Vec<bool>,
    tois: Vec<f64>,
}

impl Default for GlobalCollisionFilter {
    fn default() -> Self {
        Self {
            dcd_filters: CapabilitySet::new("GlobalCollisionFilter"),
            ccd_filters: CapabilitySet::new("GlobalCollisionFilter"),
            vertices: None,
            contact: None,
            slackness: 0.8,
            active_vertices: Vec::new(),
            tois: Vec::new(),
        }
    }
}

impl Subsystem for GlobalCollisionFilter {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        self.vertices = Some(ctx.require::<GlobalVertexManager>()?);
        self.contact = Some(ctx.require::<GlobalContactManager>()?);
        self.slackness = ctx.config().contact.ccd_slackness.clamp(0.0, 1.0);
        Ok(())
    }
}

impl GlobalCollisionFilter {
    pub fn add_dcd_filter(&mut self, filter: Capability<dyn DcdFilter>) -> Result<usize, SystemError> {
        self.dcd_filters.insert(filter)
    }

    pub fn add_ccd_filter(&mut self, filter: Capability<dyn CcdFilter>) -> Result<usize, SystemError> {
        self.ccd_filters.insert(filter)
    }

    fn d_hat(&self, systems: &SystemCollection) -> Result<f64, SystemError> {
        Ok(systems.get(resolved(self.contact)?)?.d_hat())
    }

    /// Run discrete detection along `alpha` times the current displacements.
    pub fn detect(&mut self, systems: &mut SystemCollection, alpha: f64) -> Result<(), SystemError> {
        let _span = tracy_span!("collision detect", "detect");
        let info = DetectInfo {
            alpha,
            d_hat: self.d_hat(systems)?,
        };
        for filter in self.dcd_filters.iter() {
            systems.with_capability(filter, |f, systems| f.detect(systems, &info))??;
        }
        Ok(())
    }

    /// Narrow the detected candidates down to currently active contacts.
    pub fn filter_active(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        let vertex_count = systems.get(resolved(self.vertices)?)?.vertex_count();
        let info = DetectInfo {
            alpha: 0.0,
            d_hat: self.d_hat(systems)?,
        };
        self.active_vertices.clear();
        self.active_vertices.resize(vertex_count, false);
        for filter in self.dcd_filters.iter() {
            let active = &mut self.active_vertices;
            systems.with_capability(filter, |f, systems| {
                f.filter_active(systems, &info, active)
            })??;
        }
        Ok(())
    }

    /// The largest collision-free step length no greater than `alpha`.
    pub fn filter_toi(&mut self, systems: &mut SystemCollection, alpha: f64) -> Result<f64, SystemError> {
        let _span = tracy_span!("collision filter toi", "filter_toi");
        let info = FilterToiInfo {
            alpha,
            d_hat: self.d_hat(systems)?,
            slackness: self.slackness,
        };
        self.tois.clear();
        for filter in self.ccd_filters.iter() {
            let toi = systems.with_capability(filter, |f, systems| f.filter_toi(systems, &info))??;
            self.tois.push(toi);
        }
        Ok(self.tois.iter().copied().fold(alpha, f64::min))
    }

    /// Which vertices have an active contact, per the last [`filter_active`][Self::filter_active].
    #[inline]
    pub fn active_vertices(&self) -> &[bool] {
        &self.active_vertices
    }

    /// Step length each CCD filter allowed in the last [`filter_toi`][Self::filter_toi].
    #[inline]
    pub fn tois(&self) -> &[f64] {
        &self.tois
    }

    #[inline]
    pub fn dcd_filter_count(&self) -> usize {
        self.dcd_filters.len()
    }

    #[inline]
    pub fn ccd_filter_count(&self) -> usize {
        self.ccd_filters.len()
    }
}

/// Register a filter with the global collision filter in both roles.
pub(crate) fn register_filter<T>(ctx: &mut BuildContext<'_>) -> Result<(), BuildError>
where
    T: DcdFilter + CcdFilter + Subsystem,
{
    let global = ctx.require::<GlobalCollisionFilter>()?;
    let this = ctx.this::<T>();
    ctx.on_built(move |systems| {
        let manager = systems.get_mut(global)?;
        manager.add_dcd_filter(Capability::<dyn DcdFilter>::of(this))?;
        manager.add_ccd_filter(Capability::<dyn CcdFilter>::of(this))?;
        Ok(())
    });
    Ok(())
}
