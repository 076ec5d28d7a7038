use std::ops::Range;

use crate::{
    engine::EngineCreateInfo,
    math::{self as m, Aabb, Vec3},
    system::{
        capability_trait, BuildContext, BuildError, Capability, CapabilitySet, CreateSystem,
        Subsystem, SystemCollection, SystemError,
    },
    util::{buffer::ReservedBuffer, offset_count::OffsetCountCollection},
};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// A system that owns vertices and reports them to the [`GlobalVertexManager`].
pub trait VertexReporter {
    /// Count phase: report how many vertices this system has.
    fn report_count(&mut self, systems: &SystemCollection, info: &mut VertexCountInfo);
    /// Attribute phase: fill in this system's segment of the global buffers.
    fn report_attributes(&mut self, systems: &SystemCollection, info: &mut VertexAttributeInfo<'_>);
    /// Write the displacement of every vertex after the linear system is solved.
    fn report_displacements(
        &mut self,
        systems: &SystemCollection,
        info: &mut VertexDisplacementInfo<'_>,
    );
}
capability_trait!(VertexReporter);

#[derive(Debug, Default)]
pub struct VertexCountInfo {
    count: usize,
}

impl VertexCountInfo {
    #[inline]
    pub fn count(&mut self, count: usize) {
        self.count = count;
    }
}

/// One reporter's segment of the global vertex attribute buffers.
pub struct VertexAttributeInfo<'a> {
    index: usize,
    offset: usize,
    positions: &'a mut [Vec3],
    rest_positions: &'a mut [Vec3],
    thicknesses: &'a mut [f64],
    contact_element_ids: &'a mut [u32],
    body_ids: &'a mut [u32],
    coindices: &'a mut [u32],
}

impl<'a> VertexAttributeInfo<'a> {
    /// The reporter's registration index.
    #[inline]
    pub fn reporter_index(&self) -> usize {
        self.index
    }

    /// Global index of the segment's first vertex.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Global index range of the segment.
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.positions.len()
    }

    #[inline]
    pub fn positions(&mut self) -> &mut [Vec3] {
        &mut *self.positions
    }

    #[inline]
    pub fn rest_positions(&mut self) -> &mut [Vec3] {
        &mut *self.rest_positions
    }

    #[inline]
    pub fn thicknesses(&mut self) -> &mut [f64] {
        &mut *self.thicknesses
    }

    /// Contact element of each vertex, used to look up contact parameters.
    #[inline]
    pub fn contact_element_ids(&mut self) -> &mut [u32] {
        &mut *self.contact_element_ids
    }

    /// Vertices with the same body id never collide with each other.
    #[inline]
    pub fn body_ids(&mut self) -> &mut [u32] {
        &mut *self.body_ids
    }

    /// Reporter-defined value per vertex, typically the reporter's local index.
    #[inline]
    pub fn coindices(&mut self) -> &mut [u32] {
        &mut *self.coindices
    }
}

/// One reporter's segment of the global displacement buffer.
pub struct VertexDisplacementInfo<'a> {
    index: usize,
    displacements: &'a mut [Vec3],
    coindices: &'a [u32],
}

impl<'a> VertexDisplacementInfo<'a> {
    #[inline]
    pub fn reporter_index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn displacements(&mut self) -> &mut [Vec3] {
        &mut *self.displacements
    }

    #[inline]
    pub fn coindices(&self) -> &[u32] {
        self.coindices
    }
}

/// Lays out the vertices of every [`VertexReporter`] in one contiguous set of buffers.
///
/// Each reporter's vertices occupy the range given by its registration index
/// in an [`OffsetCountCollection`]. The layout is derived on scene init and
/// rebuild, and stays fixed in between.
pub struct GlobalVertexManager {
    reporters: CapabilitySet<dyn VertexReporter>,
    layout: OffsetCountCollection,
    positions: ReservedBuffer<Vec3>,
    prev_positions: ReservedBuffer<Vec3>,
    rest_positions: ReservedBuffer<Vec3>,
    safe_positions: ReservedBuffer<Vec3>,
    displacements: ReservedBuffer<Vec3>,
    thicknesses: ReservedBuffer<f64>,
    contact_element_ids: ReservedBuffer<u32>,
    body_ids: ReservedBuffer<u32>,
    coindices: ReservedBuffer<u32>,
    axis_max_disp: f64,
    bounding_box: Aabb,
}

impl CreateSystem for GlobalVertexManager {
    fn create(info: &EngineCreateInfo) -> Self {
        Self::new(info.config.collision.reserve_ratio)
    }
}

impl Subsystem for GlobalVertexManager {
    fn build(&mut self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        Ok(())
    }
}

impl GlobalVertexManager {
    pub fn new(reserve_ratio: f64) -> Self {
        Self {
            reporters: CapabilitySet::new("GlobalVertexManager"),
            layout: OffsetCountCollection::new(),
            positions: ReservedBuffer::new(reserve_ratio),
            prev_positions: ReservedBuffer::new(reserve_ratio),
            rest_positions: ReservedBuffer::new(reserve_ratio),
            safe_positions: ReservedBuffer::new(reserve_ratio),
            displacements: ReservedBuffer::new(reserve_ratio),
            thicknesses: ReservedBuffer::new(reserve_ratio),
            contact_element_ids: ReservedBuffer::new(reserve_ratio),
            body_ids: ReservedBuffer::new(reserve_ratio),
            coindices: ReservedBuffer::new(reserve_ratio),
            axis_max_disp: 0.0,
            bounding_box: Aabb::empty(),
        }
    }

    /// Register a reporter, returning its stable index.
    pub fn add_reporter(
        &mut self,
        reporter: Capability<dyn VertexReporter>,
    ) -> Result<usize, SystemError> {
        self.reporters.insert(reporter)
    }

    //
    // Layout
    //

    /// Run the count and attribute phases for every reporter.
    pub fn init(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        let _span = tracy_span!("vertex manager init", "init");

        self.layout.resize(self.reporters.len());
        for (i, reporter) in self.reporters.iter().enumerate() {
            let mut info = VertexCountInfo::default();
            systems.with_capability(reporter, |r, systems| r.report_count(systems, &mut info))?;
            self.layout.counts_mut()[i] = info.count;
        }
        self.layout.scan();

        let total = self.layout.total_count();
        self.resize_buffers(total);

        for (i, reporter) in self.reporters.iter().enumerate() {
            let range = self.layout.range(i);
            let mut info = VertexAttributeInfo {
                index: i,
                offset: range.start,
                positions: &mut self.positions[range.clone()],
                rest_positions: &mut self.rest_positions[range.clone()],
                thicknesses: &mut self.thicknesses[range.clone()],
                contact_element_ids: &mut self.contact_element_ids[range.clone()],
                body_ids: &mut self.body_ids[range.clone()],
                coindices: &mut self.coindices[range],
            };
            systems.with_capability(reporter, |r, systems| {
                r.report_attributes(systems, &mut info)
            })?;
        }

        self.prev_positions.copy_from_slice(&self.positions);
        self.safe_positions.copy_from_slice(&self.positions);
        self.displacements.fill(Vec3::zero());
        self.axis_max_disp = 0.0;
        self.compute_vertex_bounding_box();

        log::debug!(
            "Vertex layout: {} vertices from {} reporters",
            total,
            self.reporters.len()
        );
        Ok(())
    }

    /// Redo the layout after the scene's topology changed.
    pub fn rebuild(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        self.init(systems)
    }

    fn resize_buffers(&mut self, len: usize) {
        let grew = self.positions.resize(len);
        self.prev_positions.resize(len);
        self.rest_positions.resize(len);
        self.safe_positions.resize(len);
        self.displacements.resize(len);
        self.thicknesses.resize(len);
        self.contact_element_ids.resize(len);
        self.body_ids.resize(len);
        self.coindices.resize(len);
        if grew {
            log::debug!(
                "Vertex buffers grown to capacity {}",
                self.positions.capacity()
            );
        }
    }

    //
    // Per-substep operations
    //

    pub fn record_prev_positions(&mut self) {
        self.prev_positions.copy_from_slice(&self.positions);
    }

    /// Remember the current positions as the start point of a line search.
    pub fn record_start_point(&mut self) {
        self.safe_positions.copy_from_slice(&self.positions);
    }

    /// Move every vertex to `safe_position + alpha * displacement`.
    pub fn step_forward(&mut self, alpha: f64) {
        let _span = tracy_span!("vertex step forward", "step_forward");

        #[cfg(feature = "parallel")]
        {
            self.positions
                .as_mut_slice()
                .par_iter_mut()
                .zip(self.safe_positions.as_slice().par_iter())
                .zip(self.displacements.as_slice().par_iter())
                .for_each(|((x, x0), dx)| *x = *x0 + *dx * alpha);
        }
        #[cfg(not(feature = "parallel"))]
        {
            for ((x, x0), dx) in self
                .positions
                .iter_mut()
                .zip(self.safe_positions.iter())
                .zip(self.displacements.iter())
            {
                *x = *x0 + *dx * alpha;
            }
        }
    }

    /// Ask every reporter for the displacements of its vertices.
    pub fn collect_vertex_displacements(
        &mut self,
        systems: &mut SystemCollection,
    ) -> Result<(), SystemError> {
        for (i, reporter) in self.reporters.iter().enumerate() {
            let range = self.layout.range(i);
            let mut info = VertexDisplacementInfo {
                index: i,
                displacements: &mut self.displacements[range.clone()],
                coindices: &self.coindices[range],
            };
            systems.with_capability(reporter, |r, systems| {
                r.report_displacements(systems, &mut info)
            })?;
        }
        Ok(())
    }

    /// Largest displacement along any coordinate axis.
    pub fn compute_axis_max_displacement(&mut self) -> f64 {
        #[cfg(feature = "parallel")]
        let max = self
            .displacements
            .as_slice()
            .par_iter()
            .map(|d| m::abs_max(*d))
            .reduce(|| 0.0, f64::max);
        #[cfg(not(feature = "parallel"))]
        let max = self
            .displacements
            .iter()
            .map(|d| m::abs_max(*d))
            .fold(0.0, f64::max);

        self.axis_max_disp = max;
        max
    }

    pub fn compute_vertex_bounding_box(&mut self) -> Aabb {
        #[cfg(feature = "parallel")]
        let bb = self
            .positions
            .as_slice()
            .par_iter()
            .fold(Aabb::empty, |mut bb, p| {
                bb.extend(*p);
                bb
            })
            .reduce(Aabb::empty, Aabb::merged);
        #[cfg(not(feature = "parallel"))]
        let bb = self.positions.iter().fold(Aabb::empty(), |mut bb, p| {
            bb.extend(*p);
            bb
        });

        self.bounding_box = bb;
        bb
    }

    //
    // Read access
    //

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn reporter_count(&self) -> usize {
        self.reporters.len()
    }

    /// Global index range of a reporter's vertices.
    pub fn reporter_range(&self, index: usize) -> Option<Range<usize>> {
        (index < self.layout.len()).then(|| self.layout.range(index))
    }

    #[inline]
    pub fn layout(&self) -> &OffsetCountCollection {
        &self.layout
    }

    #[inline]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Positions at the end of the previous time step.
    #[inline]
    pub fn prev_positions(&self) -> &[Vec3] {
        &self.prev_positions
    }

    #[inline]
    pub fn rest_positions(&self) -> &[Vec3] {
        &self.rest_positions
    }

    /// Positions at the start of the current line search.
    #[inline]
    pub fn safe_positions(&self) -> &[Vec3] {
        &self.safe_positions
    }

    /// Displacements from the last linear solve, not scaled by the step length.
    #[inline]
    pub fn displacements(&self) -> &[Vec3] {
        &self.displacements
    }

    #[inline]
    pub fn thicknesses(&self) -> &[f64] {
        &self.thicknesses
    }

    #[inline]
    pub fn contact_element_ids(&self) -> &[u32] {
        &self.contact_element_ids
    }

    #[inline]
    pub fn body_ids(&self) -> &[u32] {
        &self.body_ids
    }

    #[inline]
    pub fn coindices(&self) -> &[u32] {
        &self.coindices
    }

    /// Result of the last [`compute_axis_max_displacement`][Self::compute_axis_max_displacement].
    #[inline]
    pub fn axis_max_displacement(&self) -> f64 {
        self.axis_max_disp
    }

    /// Result of the last [`compute_vertex_bounding_box`][Self::compute_vertex_bounding_box].
    #[inline]
    pub fn vertex_bounding_box(&self) -> Aabb {
        self.bounding_box
    }
}
