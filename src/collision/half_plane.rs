use super::{register_filter, CcdFilter, DcdFilter, DetectInfo, FilterToiInfo};
use crate::{
    geometry::{GlobalVertexManager, HalfPlaneSystem},
    math::Vec3,
    scene::HalfPlane,
    system::{
        resolved, BuildContext, BuildError, Subsystem, SystemCollection, SystemError, SystemSlot,
    },
    util::buffer::CandidateBuffer,
};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Finds vertices close to or moving towards half-planes.
///
/// Pairs are `(vertex index, half-plane index)`.
pub struct VertexHalfPlaneFilter {
    vertices: Option<SystemSlot<GlobalVertexManager>>,
    planes: Option<SystemSlot<HalfPlaneSystem>>,
    candidates: CandidateBuffer,
    active: Vec<(u32, u32)>,
    reallocations: usize,
}

impl Default for VertexHalfPlaneFilter {
    fn default() -> Self {
        Self {
            vertices: None,
            planes: None,
            candidates: CandidateBuffer::new(0, 1.5),
            active: Vec::new(),
            reallocations: 0,
        }
    }
}

impl Subsystem for VertexHalfPlaneFilter {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        self.vertices = Some(ctx.require::<GlobalVertexManager>()?);
        self.planes = Some(ctx.require::<HalfPlaneSystem>()?);
        register_filter::<Self>(ctx)?;
        let config = ctx.config().collision;
        self.candidates = CandidateBuffer::new(config.initial_capacity, config.reserve_ratio);
        Ok(())
    }
}

impl VertexHalfPlaneFilter {
    /// Pairs found by the last detection.
    pub fn candidates(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.candidates.iter()
    }

    #[inline]
    pub fn candidate_capacity(&self) -> usize {
        self.candidates.capacity()
    }

    /// Pairs within the activation distance at the last [`filter_active`][DcdFilter::filter_active].
    #[inline]
    pub fn active_pairs(&self) -> &[(u32, u32)] {
        &self.active
    }

    /// How many times the candidate buffer overflowed and detection was rerun.
    #[inline]
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }
}

/// Step length allowed by one vertex moving towards one plane.
fn pair_step(plane: &HalfPlane, x: Vec3, dx: Vec3, thickness: f64, info: &FilterToiInfo) -> f64 {
    let d0 = plane.signed_distance(x) - thickness;
    let d1 = plane.signed_distance(x + dx * info.alpha) - thickness;
    // already penetrating or moving away, nothing to limit
    if d0 <= 0.0 || d1 >= d0 {
        return info.alpha;
    }
    let t = (d0 - info.target_gap(d0)) / (d0 - d1);
    info.alpha * t.min(1.0)
}

impl DcdFilter for VertexHalfPlaneFilter {
    fn detect(&mut self, systems: &SystemCollection, info: &DetectInfo) -> Result<(), SystemError> {
        let vm = systems.get(resolved(self.vertices)?)?;
        let planes = systems.get(resolved(self.planes)?)?.planes();
        let (xs, dxs, thicknesses) = (vm.positions(), vm.displacements(), vm.thicknesses());
        let DetectInfo { alpha, d_hat } = *info;

        self.reallocations += self.candidates.detect(|out| {
            let visit = |i: usize| {
                let x0 = xs[i];
                let x1 = x0 + dxs[i] * alpha;
                for (j, plane) in planes.iter().enumerate() {
                    let d = plane.signed_distance(x0).min(plane.signed_distance(x1)) - thicknesses[i];
                    if d < d_hat {
                        out.push(i as u32, j as u32);
                    }
                }
            };
            #[cfg(feature = "parallel")]
            {
                (0..xs.len()).into_par_iter().for_each(visit);
            }
            #[cfg(not(feature = "parallel"))]
            {
                (0..xs.len()).for_each(visit);
            }
        });
        Ok(())
    }

    fn filter_active(
        &mut self,
        systems: &SystemCollection,
        info: &DetectInfo,
        active_vertices: &mut [bool],
    ) -> Result<(), SystemError> {
        let vm = systems.get(resolved(self.vertices)?)?;
        let planes = systems.get(resolved(self.planes)?)?.planes();
        let (xs, thicknesses) = (vm.positions(), vm.thicknesses());

        self.active.clear();
        for (i, j) in self.candidates.iter() {
            let (vi, pj) = (i as usize, j as usize);
            let d = planes[pj].signed_distance(xs[vi]) - thicknesses[vi];
            if d < info.d_hat {
                self.active.push((i, j));
                active_vertices[vi] = true;
            }
        }
        Ok(())
    }
}

impl CcdFilter for VertexHalfPlaneFilter {
    fn filter_toi(
        &mut self,
        systems: &SystemCollection,
        info: &FilterToiInfo,
    ) -> Result<f64, SystemError> {
        let vm = systems.get(resolved(self.vertices)?)?;
        let planes = systems.get(resolved(self.planes)?)?.planes();
        let (xs, dxs, thicknesses) = (vm.positions(), vm.displacements(), vm.thicknesses());
        let candidates = &self.candidates;
        let step = |k: usize| {
            candidates.get(k).map_or(info.alpha, |(i, j)| {
                let i = i as usize;
                pair_step(&planes[j as usize], xs[i], dxs[i], thicknesses[i], info)
            })
        };

        #[cfg(feature = "parallel")]
        let toi = (0..candidates.len())
            .into_par_iter()
            .map(step)
            .reduce(|| info.alpha, f64::min);
        #[cfg(not(feature = "parallel"))]
        let toi = (0..candidates.len()).map(step).fold(info.alpha, f64::min);

        Ok(toi)
    }
}
