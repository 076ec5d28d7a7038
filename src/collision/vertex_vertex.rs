use std::collections::HashMap;

use itertools::Either;

use super::{register_filter, CcdFilter, DcdFilter, DetectInfo, FilterToiInfo};
use crate::{
    geometry::GlobalVertexManager,
    math::{Aabb, Vec3},
    system::{
        resolved, BuildContext, BuildError, Subsystem, SystemCollection, SystemError, SystemSlot,
    },
    util::buffer::CandidateBuffer,
};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

type CellKey = [i64; 3];

/// Boxes spanning more cells than this along any axis skip the grid.
const MAX_CELL_SPAN: i64 = 4;

/// Uniform grid over vertex trajectory boxes.
///
/// Cells are sized after the median box, so a few fast vertices
/// don't coarsen the grid for everyone else.
/// Boxes too large for the grid are kept in a separate list
/// and tested against every other box.
struct SpatialHash {
    cell_size: f64,
    cells: HashMap<CellKey, Vec<u32>>,
    large: Vec<u32>,
    len: u32,
}

impl SpatialHash {
    fn new(boxes: &[Aabb]) -> Self {
        let mut sizes: Vec<f64> = boxes
            .iter()
            .map(|b| {
                let e = b.extents();
                e.x.max(e.y).max(e.z)
            })
            .collect();
        let cell_size = if sizes.is_empty() {
            0.0
        } else {
            let mid = sizes.len() / 2;
            *sizes.select_nth_unstable_by(mid, f64::total_cmp).1
        };
        let cell_size = if cell_size > 0.0 { cell_size } else { 1.0 };

        let mut hash = Self {
            cell_size,
            cells: HashMap::new(),
            large: Vec::new(),
            len: boxes.len() as u32,
        };
        for (i, b) in boxes.iter().enumerate() {
            if hash.is_large(b) {
                hash.large.push(i as u32);
                continue;
            }
            let (lo, hi) = (hash.cell_of(b.min), hash.cell_of(b.max));
            for x in lo[0]..=hi[0] {
                for y in lo[1]..=hi[1] {
                    for z in lo[2]..=hi[2] {
                        hash.cells.entry([x, y, z]).or_default().push(i as u32);
                    }
                }
            }
        }
        hash
    }

    #[inline]
    fn cell_of(&self, p: Vec3) -> CellKey {
        [
            (p.x / self.cell_size).floor() as i64,
            (p.y / self.cell_size).floor() as i64,
            (p.z / self.cell_size).floor() as i64,
        ]
    }

    #[inline]
    fn is_large(&self, b: &Aabb) -> bool {
        let (lo, hi) = (self.cell_of(b.min), self.cell_of(b.max));
        (0..3).any(|k| hi[k] - lo[k] >= MAX_CELL_SPAN)
    }

    /// Indices of every box that may overlap `b`, possibly with duplicates.
    fn neighbors<'a>(&'a self, b: &Aabb) -> impl Iterator<Item = u32> + 'a {
        if self.is_large(b) {
            return Either::Left(0..self.len);
        }
        let (lo, hi) = (self.cell_of(b.min), self.cell_of(b.max));
        let in_cells = (lo[0]..=hi[0])
            .flat_map(move |x| (lo[1]..=hi[1]).map(move |y| (x, y)))
            .flat_map(move |(x, y)| (lo[2]..=hi[2]).map(move |z| [x, y, z]))
            .filter_map(move |key| self.cells.get(&key))
            .flatten()
            .copied();
        Either::Right(in_cells.chain(self.large.iter().copied()))
    }
}

#[inline]
fn overlaps(a: &Aabb, b: &Aabb) -> bool {
    a.min.x <= b.max.x
        && b.min.x <= a.max.x
        && a.min.y <= b.max.y
        && b.min.y <= a.max.y
        && a.min.z <= b.max.z
        && b.min.z <= a.max.z
}

/// Finds pairs of vertices on different bodies that come close to each other,
/// using a uniform spatial hash over their trajectories.
///
/// Pairs are `(lower vertex index, higher vertex index)`.
pub struct VertexVertexFilter {
    vertices: Option<SystemSlot<GlobalVertexManager>>,
    candidates: CandidateBuffer,
    active: Vec<(u32, u32)>,
    reallocations: usize,
}

impl Default for VertexVertexFilter {
    fn default() -> Self {
        Self {
            vertices: None,
            candidates: CandidateBuffer::new(0, 1.5),
            active: Vec::new(),
            reallocations: 0,
        }
    }
}

impl Subsystem for VertexVertexFilter {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        self.vertices = Some(ctx.require::<GlobalVertexManager>()?);
        register_filter::<Self>(ctx)?;
        let config = ctx.config().collision;
        self.candidates = CandidateBuffer::new(config.initial_capacity, config.reserve_ratio);
        Ok(())
    }
}

impl VertexVertexFilter {
    pub fn candidates(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.candidates.iter()
    }

    #[inline]
    pub fn active_pairs(&self) -> &[(u32, u32)] {
        &self.active
    }

    #[inline]
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }
}

/// Step length allowed by two spheres moving relative to each other,
/// `p` and `dp` being the relative position and displacement.
fn pair_step(p: Vec3, dp: Vec3, radius: f64, info: &FilterToiInfo) -> f64 {
    let gap0 = p.mag() - radius;
    if gap0 <= 0.0 {
        return info.alpha;
    }
    let dp = dp * info.alpha;
    let a = dp.dot(dp);
    let b = 2.0 * p.dot(dp);
    // not moving or moving apart
    if a <= f64::EPSILON * p.mag_sq() || b >= 0.0 {
        return info.alpha;
    }
    // solve |p + t dp| = sep for the first t in the step
    let sep = radius + info.target_gap(gap0);
    let c = p.dot(p) - sep * sep;
    let disc = b * b - 4.0 * a * c;
    // a head-on approach of points can round to a slightly negative discriminant
    if disc < -1e-12 * b * b {
        return info.alpha;
    }
    let t = (-b - disc.max(0.0).sqrt()) / (2.0 * a);
    info.alpha * t.clamp(0.0, 1.0)
}

impl DcdFilter for VertexVertexFilter {
    fn detect(&mut self, systems: &SystemCollection, info: &DetectInfo) -> Result<(), SystemError> {
        let _span = tracy_span!("vertex-vertex detect", "detect");
        let vm = systems.get(resolved(self.vertices)?)?;
        let (xs, dxs) = (vm.positions(), vm.displacements());
        let (thicknesses, body_ids) = (vm.thicknesses(), vm.body_ids());
        let DetectInfo { alpha, d_hat } = *info;

        let boxes: Vec<Aabb> = (0..xs.len())
            .map(|i| {
                let pad = Vec3::broadcast(thicknesses[i] + 0.5 * d_hat);
                let mut b = Aabb::empty();
                b.extend(xs[i]);
                b.extend(xs[i] + dxs[i] * alpha);
                Aabb {
                    min: b.min - pad,
                    max: b.max + pad,
                }
            })
            .collect();
        let hash = SpatialHash::new(&boxes);

        self.reallocations += self.candidates.detect(|out| {
            let visit = |i: usize| {
                let mut found: Vec<u32> = hash
                    .neighbors(&boxes[i])
                    .filter(|&j| {
                        let j = j as usize;
                        j > i && body_ids[j] != body_ids[i] && overlaps(&boxes[i], &boxes[j])
                    })
                    .collect();
                found.sort_unstable();
                found.dedup();
                for j in found {
                    out.push(i as u32, j);
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
        let (xs, thicknesses) = (vm.positions(), vm.thicknesses());

        self.active.clear();
        for (i, j) in self.candidates.iter() {
            let (vi, vj) = (i as usize, j as usize);
            let d = (xs[vi] - xs[vj]).mag() - thicknesses[vi] - thicknesses[vj];
            if d < info.d_hat {
                self.active.push((i, j));
                active_vertices[vi] = true;
                active_vertices[vj] = true;
            }
        }
        Ok(())
    }
}

impl CcdFilter for VertexVertexFilter {
    fn filter_toi(
        &mut self,
        systems: &SystemCollection,
        info: &FilterToiInfo,
    ) -> Result<f64, SystemError> {
        let vm = systems.get(resolved(self.vertices)?)?;
        let (xs, dxs, thicknesses) = (vm.positions(), vm.displacements(), vm.thicknesses());
        let candidates = &self.candidates;
        let step = |k: usize| {
            candidates.get(k).map_or(info.alpha, |(i, j)| {
                let (i, j) = (i as usize, j as usize);
                pair_step(
                    xs[i] - xs[j],
                    dxs[i] - dxs[j],
                    thicknesses[i] + thicknesses[j],
                    info,
                )
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
