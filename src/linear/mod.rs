//! The global linear system solved once per Newton iteration.
//!
//! Each [`DiagLinearSubsystem`] owns a contiguous range of degrees of freedom
//! and the diagonal block of the Hessian over it. An [`OffDiagLinearSubsystem`]
//! couples two diagonal subsystems and writes both cross blocks.
//! All blocks are written as triplets into segments of one shared buffer
//! laid out with [`OffsetCountCollection`]s, compressed to a [`CsrMatrix`],
//! and solved with preconditioned conjugate gradient.
//!
//! The system solved is `H dx = -g`, where `g` is the gradient the
//! diagonal subsystems write.

use std::ops::Range;

use crate::{
    config::LinearSolverConfig,
    engine::EngineCreateInfo,
    system::{
        capability_trait, short_name, BuildContext, BuildError, Capability, CapabilitySet,
        CreateSystem, Subsystem, SystemCollection, SystemError, SystemId,
    },
    util::{buffer::ReservedBuffer, offset_count::OffsetCountCollection},
};

mod matrix;
pub use matrix::{CsrMatrix, Triplet, TripletView};

mod solver;
pub use solver::{pcg, PcgOps, SolveReport};

/// Fatal errors in assembling the global system.
#[derive(thiserror::Error, Debug)]
pub enum AssemblyError {
    #[error("{system} refers to {diag}, which is not a registered diagonal subsystem")]
    UnknownDiagSubsystem { system: &'static str, diag: SystemId },
    #[error("{system} wrote more than the {capacity} entries it reported")]
    SegmentOverflow { system: &'static str, capacity: usize },
    #[error("{system} wrote entry ({row}, {col}) outside its {rows}x{cols} block")]
    OutOfBlock {
        system: &'static str,
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
}

//
// Subsystem roles
//

#[derive(Debug, Default)]
pub struct InitDofExtentInfo {
    dof_count: usize,
}

impl InitDofExtentInfo {
    #[inline]
    pub fn dof_count(&mut self, count: usize) {
        self.dof_count = count;
    }
}

/// Where a diagonal subsystem's degrees of freedom sit in the global system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InitDofInfo {
    pub dof_offset: usize,
    pub dof_count: usize,
}

#[derive(Debug, Default)]
pub struct DiagExtentInfo {
    hessian_count: usize,
}

impl DiagExtentInfo {
    /// Upper bound on the scalar Hessian entries the next assembly writes.
    #[inline]
    pub fn hessian_count(&mut self, count: usize) {
        self.hessian_count = count;
    }
}

pub struct DiagAssembleInfo<'a> {
    hessian: TripletView<'a>,
    gradient: &'a mut [f64],
}

impl<'a> DiagAssembleInfo<'a> {
    #[inline]
    pub fn hessian(&mut self) -> &mut TripletView<'a> {
        &mut self.hessian
    }

    /// This subsystem's slice of the gradient, zeroed before assembly.
    #[inline]
    pub fn gradient(&mut self) -> &mut [f64] {
        self.gradient
    }
}

pub struct AccuracyInfo<'a> {
    pub residual: &'a [f64],
}

pub struct SolutionInfo<'a> {
    pub solution: &'a [f64],
}

/// Owner of one diagonal block of the global system.
pub trait DiagLinearSubsystem {
    /// Report the number of degrees of freedom. Called on scene init and rebuild.
    fn report_init_extent(&mut self, systems: &SystemCollection, info: &mut InitDofExtentInfo);
    fn receive_init_dof_info(&mut self, systems: &SystemCollection, info: &InitDofInfo);
    fn report_extent(&mut self, systems: &SystemCollection, info: &mut DiagExtentInfo);
    fn assemble(
        &mut self,
        systems: &SystemCollection,
        info: &mut DiagAssembleInfo<'_>,
    ) -> Result<(), AssemblyError>;
    /// Whether the residual on this subsystem's slice is good enough.
    fn accuracy_check(&mut self, _systems: &SystemCollection, _info: &AccuracyInfo<'_>) -> bool {
        true
    }
    fn retrieve_solution(&mut self, systems: &SystemCollection, info: &SolutionInfo<'_>);
}
capability_trait!(DiagLinearSubsystem);

#[derive(Debug, Default)]
pub struct OffDiagExtentInfo {
    lr_count: usize,
    rl_count: usize,
}

impl OffDiagExtentInfo {
    #[inline]
    pub fn lr_count(&mut self, count: usize) {
        self.lr_count = count;
    }

    #[inline]
    pub fn rl_count(&mut self, count: usize) {
        self.rl_count = count;
    }
}

pub struct OffDiagAssembleInfo<'a> {
    lr: TripletView<'a>,
    rl: TripletView<'a>,
}

impl<'a> OffDiagAssembleInfo<'a> {
    /// Block with rows of the left subsystem and columns of the right one.
    #[inline]
    pub fn lr(&mut self) -> &mut TripletView<'a> {
        &mut self.lr
    }

    /// Block with rows of the right subsystem and columns of the left one.
    #[inline]
    pub fn rl(&mut self) -> &mut TripletView<'a> {
        &mut self.rl
    }
}

/// Coupling between two diagonal subsystems.
pub trait OffDiagLinearSubsystem {
    /// The diagonal subsystems coupled, left then right.
    fn depends_on(&self) -> Result<(SystemId, SystemId), SystemError>;
    fn report_extent(&mut self, systems: &SystemCollection, info: &mut OffDiagExtentInfo);
    fn assemble(
        &mut self,
        systems: &SystemCollection,
        info: &mut OffDiagAssembleInfo<'_>,
    ) -> Result<(), AssemblyError>;
}
capability_trait!(OffDiagLinearSubsystem);

pub struct PreconditionerAssembleInfo<'a> {
    pub matrix: &'a CsrMatrix,
    /// Degrees of freedom the preconditioner covers.
    pub dofs: Range<usize>,
}

/// Preconditioner over the whole system. Replaces every local preconditioner.
pub trait GlobalPreconditioner {
    fn assemble(&mut self, systems: &SystemCollection, info: &PreconditionerAssembleInfo<'_>);
    /// `z = M^-1 r`
    fn apply(&mut self, r: &[f64], z: &mut [f64]);
}
capability_trait!(GlobalPreconditioner);

/// Preconditioner over one diagonal subsystem's degrees of freedom.
pub trait LocalPreconditioner {
    /// The diagonal subsystem this applies to.
    fn target(&self) -> Result<SystemId, SystemError>;
    fn assemble(&mut self, systems: &SystemCollection, info: &PreconditionerAssembleInfo<'_>);
    /// `z = M^-1 r` on the target's slice.
    fn apply(&mut self, r: &[f64], z: &mut [f64]);
}
capability_trait!(LocalPreconditioner);

//
// Manager
//

pub struct GlobalLinearSystem {
    config: LinearSolverConfig,
    diag: CapabilitySet<dyn DiagLinearSubsystem>,
    off_diag: CapabilitySet<dyn OffDiagLinearSubsystem>,
    global_precond: Option<Capability<dyn GlobalPreconditioner>>,
    local_preconds: CapabilitySet<dyn LocalPreconditioner>,
    // diagonal subsystem indices resolved on init
    off_diag_targets: Vec<(usize, usize)>,
    local_targets: Vec<usize>,
    dof_layout: OffsetCountCollection,
    diag_layout: OffsetCountCollection,
    lr_layout: OffsetCountCollection,
    rl_layout: OffsetCountCollection,
    triplets: ReservedBuffer<Triplet>,
    gradient: ReservedBuffer<f64>,
    rhs: ReservedBuffer<f64>,
    solution: ReservedBuffer<f64>,
    matrix: CsrMatrix,
    last_report: Option<SolveReport>,
}

impl CreateSystem for GlobalLinearSystem {
    fn create(info: &EngineCreateInfo) -> Self {
        Self::new(info.config.linear_solver, info.config.collision.reserve_ratio)
    }
}

impl Subsystem for GlobalLinearSystem {
    fn build(&mut self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        Ok(())
    }
}

struct LinearOps<'a> {
    matrix: &'a CsrMatrix,
    systems: &'a mut SystemCollection,
    global: Option<Capability<dyn GlobalPreconditioner>>,
    locals: Vec<(Capability<dyn LocalPreconditioner>, Range<usize>)>,
    diags: Vec<(Capability<dyn DiagLinearSubsystem>, Range<usize>)>,
}

impl<'a> PcgOps for LinearOps<'a> {
    fn spmv(&mut self, x: &[f64], y: &mut [f64]) {
        self.matrix.spmv(x, y);
    }

    fn precondition(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), SystemError> {
        if let Some(global) = self.global {
            return self.systems.with_capability(global, |p, _| p.apply(r, z));
        }
        z.copy_from_slice(r);
        for (local, dofs) in &self.locals {
            let (r, z) = (&r[dofs.clone()], &mut z[dofs.clone()]);
            self.systems.with_capability(*local, |p, _| p.apply(r, z))?;
        }
        Ok(())
    }

    fn accurate(&mut self, r: &[f64]) -> Result<bool, SystemError> {
        for (diag, dofs) in &self.diags {
            let info = AccuracyInfo {
                residual: &r[dofs.clone()],
            };
            if !self
                .systems
                .with_capability(*diag, |d, systems| d.accuracy_check(systems, &info))?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl GlobalLinearSystem {
    pub fn new(config: LinearSolverConfig, reserve_ratio: f64) -> Self {
        Self {
            config,
            diag: CapabilitySet::new("GlobalLinearSystem"),
            off_diag: CapabilitySet::new("GlobalLinearSystem"),
            global_precond: None,
            local_preconds: CapabilitySet::new("GlobalLinearSystem"),
            off_diag_targets: Vec::new(),
            local_targets: Vec::new(),
            dof_layout: OffsetCountCollection::new(),
            diag_layout: OffsetCountCollection::new(),
            lr_layout: OffsetCountCollection::new(),
            rl_layout: OffsetCountCollection::new(),
            triplets: ReservedBuffer::new(reserve_ratio),
            gradient: ReservedBuffer::new(reserve_ratio),
            rhs: ReservedBuffer::new(reserve_ratio),
            solution: ReservedBuffer::new(reserve_ratio),
            matrix: CsrMatrix::default(),
            last_report: None,
        }
    }

    pub fn add_diag_subsystem(
        &mut self,
        subsystem: Capability<dyn DiagLinearSubsystem>,
    ) -> Result<usize, SystemError> {
        self.diag.insert(subsystem)
    }

    pub fn add_off_diag_subsystem(
        &mut self,
        subsystem: Capability<dyn OffDiagLinearSubsystem>,
    ) -> Result<usize, SystemError> {
        self.off_diag.insert(subsystem)
    }

    pub fn add_local_preconditioner(
        &mut self,
        precond: Capability<dyn LocalPreconditioner>,
    ) -> Result<usize, SystemError> {
        self.local_preconds.insert(precond)
    }

    /// Set the global preconditioner. There can only be one.
    pub fn set_global_preconditioner(
        &mut self,
        precond: Capability<dyn GlobalPreconditioner>,
    ) -> Result<(), SystemError> {
        if let Some(existing) = self.global_precond {
            return Err(SystemError::DoubleRegistration {
                manager: "GlobalLinearSystem",
                id: existing.id(),
            });
        }
        self.global_precond = Some(precond);
        Ok(())
    }

    fn diag_index(&self, id: SystemId) -> Option<usize> {
        self.diag.iter().position(|d| d.id() == id)
    }

    /// Check that every off-diagonal subsystem and local preconditioner
    /// refers to registered diagonal subsystems.
    pub fn check_dep_systems(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        self.off_diag_targets.clear();
        for off in self.off_diag.iter() {
            let (l, r) = systems.with_capability(off, |o, _| o.depends_on())??;
            let resolve = |id: SystemId| {
                self.diag_index(id).ok_or(AssemblyError::UnknownDiagSubsystem {
                    system: short_name(systems.name(off.id())),
                    diag: id,
                })
            };
            let targets = (resolve(l)?, resolve(r)?);
            self.off_diag_targets.push(targets);
        }

        self.local_targets.clear();
        for local in self.local_preconds.iter() {
            let target = systems.with_capability(local, |p, _| p.target())??;
            let index = self
                .diag_index(target)
                .ok_or(AssemblyError::UnknownDiagSubsystem {
                    system: short_name(systems.name(local.id())),
                    diag: target,
                })?;
            self.local_targets.push(index);
        }
        Ok(())
    }

    /// Lay out degrees of freedom. Called on scene init and rebuild.
    pub fn init(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        self.check_dep_systems(systems)?;

        self.dof_layout.resize(self.diag.len());
        for (i, diag) in self.diag.iter().enumerate() {
            let mut info = InitDofExtentInfo::default();
            systems.with_capability(diag, |d, systems| d.report_init_extent(systems, &mut info))?;
            self.dof_layout.counts_mut()[i] = info.dof_count;
        }
        self.dof_layout.scan();

        for (i, diag) in self.diag.iter().enumerate() {
            let (dof_offset, dof_count) = self.dof_layout.offset_count(i);
            let info = InitDofInfo {
                dof_offset,
                dof_count,
            };
            systems.with_capability(diag, |d, systems| d.receive_init_dof_info(systems, &info))?;
        }

        let n = self.dof_layout.total_count();
        self.gradient.resize(n);
        self.rhs.resize(n);
        self.solution.resize(n);
        log::debug!(
            "Linear system: {} dofs in {} diagonal and {} off-diagonal subsystems",
            n,
            self.diag.len(),
            self.off_diag.len()
        );
        Ok(())
    }

    /// Assemble and solve the system, handing each diagonal subsystem its solution slice.
    ///
    /// Hitting the iteration cap is not an error;
    /// check [`SolveReport::converged`] on the result.
    pub fn solve(&mut self, systems: &mut SystemCollection) -> Result<SolveReport, SystemError> {
        let _span = tracy_span!("global linear system", "solve");
        self.assemble(systems)?;

        let n = self.dof_count();
        self.matrix = CsrMatrix::from_triplets(n, &self.triplets);
        for (b, g) in self.rhs.iter_mut().zip(self.gradient.iter()) {
            *b = -g;
        }

        // preconditioners
        let matrix = &self.matrix;
        if let Some(global) = self.global_precond {
            let info = PreconditionerAssembleInfo { matrix, dofs: 0..n };
            systems.with_capability(global, |p, systems| p.assemble(systems, &info))?;
        }
        let mut locals = Vec::new();
        if self.global_precond.is_none() {
            for (local, &target) in self.local_preconds.iter().zip(&self.local_targets) {
                let info = PreconditionerAssembleInfo {
                    matrix,
                    dofs: self.dof_layout.range(target),
                };
                systems.with_capability(local, |p, systems| p.assemble(systems, &info))?;
                locals.push((local, info.dofs));
            }
        }

        let mut ops = LinearOps {
            matrix,
            systems: &mut *systems,
            global: self.global_precond,
            locals,
            diags: self
                .diag
                .iter()
                .enumerate()
                .map(|(i, d)| (d, self.dof_layout.range(i)))
                .collect(),
        };
        let report = pcg(
            &mut ops,
            &self.rhs,
            &mut self.solution,
            self.config.max_iter,
            self.config.tol_rate,
        )?;
        if !report.converged {
            log::warn!(
                "Linear solver stopped without converging after {} iterations (residual {:e})",
                report.iterations,
                report.residual
            );
        }

        for (i, diag) in self.diag.iter().enumerate() {
            let info = SolutionInfo {
                solution: &self.solution[self.dof_layout.range(i)],
            };
            systems.with_capability(diag, |d, systems| d.retrieve_solution(systems, &info))?;
        }
        self.last_report = Some(report);
        Ok(report)
    }

    fn assemble(&mut self, systems: &mut SystemCollection) -> Result<(), SystemError> {
        // extent
        self.diag_layout.resize(self.diag.len());
        for (i, diag) in self.diag.iter().enumerate() {
            let mut info = DiagExtentInfo::default();
            systems.with_capability(diag, |d, systems| d.report_extent(systems, &mut info))?;
            self.diag_layout.counts_mut()[i] = info.hessian_count;
        }
        self.lr_layout.resize(self.off_diag.len());
        self.rl_layout.resize(self.off_diag.len());
        for (i, off) in self.off_diag.iter().enumerate() {
            let mut info = OffDiagExtentInfo::default();
            systems.with_capability(off, |o, systems| o.report_extent(systems, &mut info))?;
            self.lr_layout.counts_mut()[i] = info.lr_count;
            self.rl_layout.counts_mut()[i] = info.rl_count;
        }
        self.diag_layout.scan();
        self.lr_layout.scan();
        self.rl_layout.scan();

        let lr_base = self.diag_layout.total_count();
        let rl_base = lr_base + self.lr_layout.total_count();
        self.triplets.resize(rl_base + self.rl_layout.total_count());
        self.triplets.fill(Triplet::default());
        self.gradient.fill(0.0);

        // diagonal blocks
        for (i, diag) in self.diag.iter().enumerate() {
            let dofs = self.dof_layout.range(i);
            let name = short_name(systems.name(diag.id()));
            let mut info = DiagAssembleInfo {
                hessian: TripletView::new(
                    name,
                    &mut self.triplets[self.diag_layout.range(i)],
                    (dofs.start, dofs.len()),
                    (dofs.start, dofs.len()),
                ),
                gradient: &mut self.gradient[dofs],
            };
            systems.with_capability(diag, |d, systems| d.assemble(systems, &mut info))??;
        }

        // off-diagonal blocks
        for (i, off) in self.off_diag.iter().enumerate() {
            let (l, r) = self.off_diag_targets[i];
            let (l, r) = (self.dof_layout.range(l), self.dof_layout.range(r));
            let name = short_name(systems.name(off.id()));
            let lr_seg = self.lr_layout.range(i);
            let rl_seg = self.rl_layout.range(i);
            let (head, rl_buf) = self.triplets.split_at_mut(rl_base);
            let lr_buf = &mut head[lr_base..];
            let mut info = OffDiagAssembleInfo {
                lr: TripletView::new(
                    name,
                    &mut lr_buf[lr_seg],
                    (l.start, l.len()),
                    (r.start, r.len()),
                ),
                rl: TripletView::new(
                    name,
                    &mut rl_buf[rl_seg],
                    (r.start, r.len()),
                    (l.start, l.len()),
                ),
            };
            systems.with_capability(off, |o, systems| o.assemble(systems, &mut info))??;
        }
        Ok(())
    }

    /// Dense copy of the last assembled matrix and right-hand side.
    pub fn dump_linear_system(&self) -> (Vec<Vec<f64>>, Vec<f64>) {
        (self.matrix.to_dense(), self.rhs.to_vec())
    }

    #[inline]
    pub fn dof_count(&self) -> usize {
        self.dof_layout.total_count()
    }

    /// Degrees of freedom of a diagonal subsystem.
    pub fn diag_dofs(&self, id: SystemId) -> Option<Range<usize>> {
        self.diag_index(id).map(|i| self.dof_layout.range(i))
    }

    #[inline]
    pub fn matrix(&self) -> &CsrMatrix {
        &self.matrix
    }

    #[inline]
    pub fn solution(&self) -> &[f64] {
        &self.solution
    }

    #[inline]
    pub fn last_report(&self) -> Option<SolveReport> {
        self.last_report
    }

    #[inline]
    pub fn has_global_preconditioner(&self) -> bool {
        self.global_precond.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{SystemRegistry, SystemSlot};
    use std::{cell::Cell, rc::Rc};

    fn register_diag<T: DiagLinearSubsystem + Subsystem>(ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let manager = ctx.require::<GlobalLinearSystem>()?;
        let this = Capability::<dyn DiagLinearSubsystem>::of(ctx.this::<T>());
        ctx.on_built(move |systems| {
            systems.get_mut(manager)?.add_diag_subsystem(this)?;
            Ok(())
        });
        Ok(())
    }

    /// A dense diagonal block.
    struct Block<const TAG: u8> {
        hessian: Vec<Vec<f64>>,
        gradient: Vec<f64>,
        dofs: InitDofInfo,
        solution: Vec<f64>,
    }

    impl<const TAG: u8> Block<TAG> {
        fn new(hessian: Vec<Vec<f64>>, gradient: Vec<f64>) -> Self {
            Self {
                hessian,
                gradient,
                dofs: InitDofInfo::default(),
                solution: Vec::new(),
            }
        }
    }

    impl<const TAG: u8> Subsystem for Block<TAG> {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            register_diag::<Self>(ctx)
        }
    }

    impl<const TAG: u8> DiagLinearSubsystem for Block<TAG> {
        fn report_init_extent(&mut self, _: &SystemCollection, info: &mut InitDofExtentInfo) {
            info.dof_count(self.gradient.len());
        }
        fn receive_init_dof_info(&mut self, _: &SystemCollection, info: &InitDofInfo) {
            self.dofs = *info;
        }
        fn report_extent(&mut self, _: &SystemCollection, info: &mut DiagExtentInfo) {
            info.hessian_count(self.gradient.len().pow(2));
        }
        fn assemble(
            &mut self,
            _: &SystemCollection,
            info: &mut DiagAssembleInfo<'_>,
        ) -> Result<(), AssemblyError> {
            for (i, row) in self.hessian.iter().enumerate() {
                for (j, v) in row.iter().enumerate() {
                    info.hessian().push(i, j, *v)?;
                }
            }
            info.gradient().copy_from_slice(&self.gradient);
            Ok(())
        }
        fn retrieve_solution(&mut self, _: &SystemCollection, info: &SolutionInfo<'_>) {
            self.solution = info.solution.to_vec();
        }
    }

    /// Dense coupling from `Block<0>` (rows) to `Block<1>` (columns).
    struct Coupling {
        block: Vec<Vec<f64>>,
        ends: Option<(SystemId, SystemId)>,
    }

    impl Subsystem for Coupling {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            let manager = ctx.require::<GlobalLinearSystem>()?;
            let l = ctx.require::<Block<0>>()?;
            let r = ctx.require::<Block<1>>()?;
            self.ends = Some((l.id(), r.id()));
            let this = Capability::<dyn OffDiagLinearSubsystem>::of(ctx.this::<Self>());
            ctx.on_built(move |systems| {
                systems.get_mut(manager)?.add_off_diag_subsystem(this)?;
                Ok(())
            });
            Ok(())
        }
    }

    impl OffDiagLinearSubsystem for Coupling {
        fn depends_on(&self) -> Result<(SystemId, SystemId), SystemError> {
            Ok(self.ends.unwrap())
        }
        fn report_extent(&mut self, _: &SystemCollection, info: &mut OffDiagExtentInfo) {
            let n = self.block.len() * self.block[0].len();
            info.lr_count(n);
            info.rl_count(n);
        }
        fn assemble(
            &mut self,
            _: &SystemCollection,
            info: &mut OffDiagAssembleInfo<'_>,
        ) -> Result<(), AssemblyError> {
            for (i, row) in self.block.iter().enumerate() {
                for (j, v) in row.iter().enumerate() {
                    info.lr().push(i, j, *v)?;
                    info.rl().push(j, i, *v)?;
                }
            }
            Ok(())
        }
    }

    /// Claims to couple `Block<0>` with the linear system itself.
    #[derive(Default)]
    struct BadCoupling {
        ends: Option<(SystemId, SystemId)>,
    }

    impl Subsystem for BadCoupling {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            let manager = ctx.require::<GlobalLinearSystem>()?;
            let l = ctx.require::<Block<0>>()?;
            self.ends = Some((l.id(), manager.id()));
            let this = Capability::<dyn OffDiagLinearSubsystem>::of(ctx.this::<Self>());
            ctx.on_built(move |systems| {
                systems.get_mut(manager)?.add_off_diag_subsystem(this)?;
                Ok(())
            });
            Ok(())
        }
    }

    impl OffDiagLinearSubsystem for BadCoupling {
        fn depends_on(&self) -> Result<(SystemId, SystemId), SystemError> {
            Ok(self.ends.unwrap())
        }
        fn report_extent(&mut self, _: &SystemCollection, _: &mut OffDiagExtentInfo) {}
        fn assemble(
            &mut self,
            _: &SystemCollection,
            _: &mut OffDiagAssembleInfo<'_>,
        ) -> Result<(), AssemblyError> {
            Ok(())
        }
    }

    /// Identity preconditioners that count how often they're applied.
    struct CountingGlobal(Rc<Cell<usize>>);
    struct CountingLocal(Rc<Cell<usize>>, Option<SystemId>);

    impl Subsystem for CountingGlobal {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            let manager = ctx.require::<GlobalLinearSystem>()?;
            let this = Capability::<dyn GlobalPreconditioner>::of(ctx.this::<Self>());
            ctx.on_built(move |systems| systems.get_mut(manager)?.set_global_preconditioner(this));
            Ok(())
        }
    }

    impl GlobalPreconditioner for CountingGlobal {
        fn assemble(&mut self, _: &SystemCollection, info: &PreconditionerAssembleInfo<'_>) {
            assert_eq!(info.dofs, 0..info.matrix.size());
        }
        fn apply(&mut self, r: &[f64], z: &mut [f64]) {
            self.0.set(self.0.get() + 1);
            z.copy_from_slice(r);
        }
    }

    impl Subsystem for CountingLocal {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            let manager = ctx.require::<GlobalLinearSystem>()?;
            self.1 = Some(ctx.require::<Block<1>>()?.id());
            let this = Capability::<dyn LocalPreconditioner>::of(ctx.this::<Self>());
            ctx.on_built(move |systems| {
                systems.get_mut(manager)?.add_local_preconditioner(this)?;
                Ok(())
            });
            Ok(())
        }
    }

    impl LocalPreconditioner for CountingLocal {
        fn target(&self) -> Result<SystemId, SystemError> {
            Ok(self.1.unwrap())
        }
        fn assemble(&mut self, _: &SystemCollection, info: &PreconditionerAssembleInfo<'_>) {
            assert_eq!(info.dofs, 3..5);
        }
        fn apply(&mut self, r: &[f64], z: &mut [f64]) {
            assert_eq!(r.len(), 2);
            self.0.set(self.0.get() + 1);
            z.copy_from_slice(r);
        }
    }

    fn l_block() -> Block<0> {
        Block::new(
            vec![
                vec![4.0, 1.0, 0.0],
                vec![1.0, 3.0, 0.5],
                vec![0.0, 0.5, 2.0],
            ],
            vec![1.0, -2.0, 0.5],
        )
    }

    fn r_block() -> Block<1> {
        Block::new(vec![vec![5.0, 1.0], vec![1.0, 2.0]], vec![0.3, 1.0])
    }

    fn coupling_block() -> Vec<Vec<f64>> {
        vec![vec![0.5, 0.0], vec![0.0, 0.3], vec![0.2, 0.1]]
    }

    /// Gaussian elimination with partial pivoting.
    fn dense_solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Vec<f64> {
        let n = b.len();
        for k in 0..n {
            let p = (k..n)
                .max_by(|&i, &j| a[i][k].abs().partial_cmp(&a[j][k].abs()).unwrap())
                .unwrap();
            a.swap(k, p);
            b.swap(k, p);
            for i in k + 1..n {
                let f = a[i][k] / a[k][k];
                for j in k..n {
                    a[i][j] -= f * a[k][j];
                }
                b[i] -= f * b[k];
            }
        }
        let mut x = vec![0.0; n];
        for k in (0..n).rev() {
            let s: f64 = (k + 1..n).map(|j| a[k][j] * x[j]).sum();
            x[k] = (b[k] - s) / a[k][k];
        }
        x
    }

    fn assert_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (a, b) in a.iter().zip(b) {
            assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
        }
    }

    fn registry(configure: impl FnOnce(&mut SystemRegistry)) -> SystemCollection {
        let mut registry = SystemRegistry::new();
        registry
            .register::<GlobalLinearSystem>()
            .unwrap()
            .register_with(|_| l_block())
            .unwrap()
            .register_with(|_| r_block())
            .unwrap();
        configure(&mut registry);

        let mut info = EngineCreateInfo::default();
        info.config.linear_solver.tol_rate = 1e-12;
        let mut systems = SystemCollection::new(&registry, info);
        systems.build_all().unwrap();
        systems
    }

    fn solve(systems: &mut SystemCollection) -> Result<SlotAndReport, SystemError> {
        let slot = systems.resolve::<GlobalLinearSystem>()?;
        let report = systems.with_system(slot, |ls, systems| {
            ls.init(systems)?;
            ls.solve(systems)
        })??;
        Ok((slot, report))
    }
    type SlotAndReport = (SystemSlot<GlobalLinearSystem>, SolveReport);

    /// Coupled 3x3 and 2x2 blocks give the same answer as a direct dense solve.
    #[test]
    fn coupled_blocks_match_dense_solve() {
        let mut systems = registry(|r| {
            r.register_with(|_| Coupling {
                block: coupling_block(),
                ends: None,
            })
            .unwrap();
        });
        let (slot, report) = solve(&mut systems).unwrap();
        assert!(report.converged);

        let mut dense = vec![vec![0.0; 5]; 5];
        for (i, row) in l_block().hessian.iter().enumerate() {
            dense[i][..3].copy_from_slice(row);
        }
        for (i, row) in r_block().hessian.iter().enumerate() {
            dense[3 + i][3..].copy_from_slice(row);
        }
        for (i, row) in coupling_block().iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                dense[i][3 + j] = *v;
                dense[3 + j][i] = *v;
            }
        }
        let rhs = vec![-1.0, 2.0, -0.5, -0.3, -1.0];

        let (assembled, assembled_rhs) = systems.get(slot).unwrap().dump_linear_system();
        assert_eq!(assembled, dense);
        assert_eq!(assembled_rhs, rhs);

        let expected = dense_solve(dense, rhs);
        let l = systems.get(systems.find::<Block<0>>().unwrap()).unwrap();
        assert_eq!(l.dofs, InitDofInfo { dof_offset: 0, dof_count: 3 });
        assert_close(&l.solution, &expected[..3]);
        let r = systems.get(systems.find::<Block<1>>().unwrap()).unwrap();
        assert_eq!(r.dofs, InitDofInfo { dof_offset: 3, dof_count: 2 });
        assert_close(&r.solution, &expected[3..]);
    }

    /// Without off-diagonal subsystems, each block is solved independently.
    #[test]
    fn block_diagonal_equivalence() {
        let mut systems = registry(|_| {});
        solve(&mut systems).unwrap();

        let l = systems.get(systems.find::<Block<0>>().unwrap()).unwrap();
        assert_close(&l.solution, &dense_solve(l_block().hessian, vec![-1.0, 2.0, -0.5]));
        let r = systems.get(systems.find::<Block<1>>().unwrap()).unwrap();
        assert_close(&r.solution, &dense_solve(r_block().hessian, vec![-0.3, -1.0]));
    }

    /// Coupling to something that isn't a diagonal subsystem is fatal.
    #[test]
    fn unknown_diag_endpoint_is_fatal() {
        let mut systems = registry(|r| {
            r.register_default::<BadCoupling>().unwrap();
        });
        let err = solve(&mut systems).unwrap_err();
        assert!(matches!(
            err,
            SystemError::Assembly(AssemblyError::UnknownDiagSubsystem {
                system: "BadCoupling",
                ..
            })
        ));
    }

    /// A global preconditioner replaces local ones, which otherwise only see their own slice.
    #[test]
    fn preconditioner_precedence() {
        let local_count = Rc::new(Cell::new(0));
        let lc = local_count.clone();
        let mut systems = registry(move |r| {
            r.register_with(move |_| CountingLocal(lc.clone(), None)).unwrap();
        });
        let (_, report) = solve(&mut systems).unwrap();
        assert!(report.converged);
        assert!(local_count.get() > 0);

        let local_count = Rc::new(Cell::new(0));
        let global_count = Rc::new(Cell::new(0));
        let (lc, gc) = (local_count.clone(), global_count.clone());
        let mut systems = registry(move |r| {
            r.register_with(move |_| CountingLocal(lc.clone(), None))
                .unwrap()
                .register_with(move |_| CountingGlobal(gc.clone()))
                .unwrap();
        });
        let (slot, report) = solve(&mut systems).unwrap();
        assert!(report.converged);
        assert!(systems.get(slot).unwrap().has_global_preconditioner());
        assert_eq!(local_count.get(), 0);
        assert!(global_count.get() > 0);
    }
}
