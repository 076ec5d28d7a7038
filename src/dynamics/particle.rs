use super::{
    DofPredictor, DofPredictorReporter, GradientHessianComputer, GradientHessianInfo,
    GradientHessianProducer, LineSearchReporter, LineSearcher, PredictInfo,
};
use crate::{
    contact::{
        ClassifiedContactInfo, ContactClassifyInfo, ContactHessian, ContactReceiver,
        GlobalContactManager, ReceiveRange,
    },
    geometry::{
        GlobalVertexManager, VertexAttributeInfo, VertexCountInfo, VertexDisplacementInfo,
        VertexReporter,
    },
    linear::{
        AssemblyError, DiagAssembleInfo, DiagExtentInfo, DiagLinearSubsystem,
        GlobalLinearSystem, InitDofExtentInfo, InitDofInfo, LocalPreconditioner,
        PreconditionerAssembleInfo, SolutionInfo,
    },
    math::Vec3,
    scene::{ParticleBody, Scene},
    system::{
        resolved, BuildContext, BuildError, Capability, Subsystem, SystemCollection, SystemError,
        SystemId, SystemSlot,
    },
};

/// Point masses moving under gravity and contact.
///
/// Each particle is one vertex and three degrees of freedom.
/// Its energy is the inertial term of the incremental potential,
/// `m / 2 |x - x_tilde|^2 / dt^2`, where `x_tilde` is the position
/// predicted from the previous velocity and gravity.
#[derive(Debug, Default)]
pub struct ParticleSystem {
    entities: Vec<hecs::Entity>,
    mass: Vec<f64>,
    thickness: Vec<f64>,
    x: Vec<Vec3>,
    v: Vec<Vec3>,
    x_prev: Vec<Vec3>,
    x_start: Vec<Vec3>,
    x_tilde: Vec<Vec3>,
    dx: Vec<Vec3>,
    inertia_gradient: Vec<Vec3>,
    contact_gradient: Vec<Vec3>,
    // contact Hessian blocks with particle-local indices
    contact_hessian: Vec<ContactHessian>,
    vertex_offset: usize,
    dofs: InitDofInfo,
    dt: f64,
}

impl Subsystem for ParticleSystem {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        ctx.mark_engine_aware();
        let vertices = ctx.require::<GlobalVertexManager>()?;
        let linear = ctx.require::<GlobalLinearSystem>()?;
        let predictor = ctx.require::<DofPredictor>()?;
        let computer = ctx.require::<GradientHessianComputer>()?;
        let searcher = ctx.require::<LineSearcher>()?;
        let contact = ctx.find::<GlobalContactManager>()?;
        self.dt = ctx.config().substep_dt();

        let this = ctx.this::<Self>();
        ctx.on_built(move |systems| {
            systems
                .get_mut(vertices)?
                .add_reporter(Capability::<dyn VertexReporter>::of(this))?;
            systems
                .get_mut(linear)?
                .add_diag_subsystem(Capability::<dyn DiagLinearSubsystem>::of(this))?;
            systems
                .get_mut(predictor)?
                .add_reporter(Capability::<dyn DofPredictorReporter>::of(this))?;
            systems
                .get_mut(computer)?
                .add_producer(Capability::<dyn GradientHessianProducer>::of(this))?;
            systems
                .get_mut(searcher)?
                .add_reporter(Capability::<dyn LineSearchReporter>::of(this))?;
            if let Some(contact) = contact {
                systems
                    .get_mut(contact)?
                    .add_receiver(Capability::<dyn ContactReceiver>::of(this))?;
            }
            Ok(())
        });
        Ok(())
    }

    fn init_scene(
        &mut self,
        scene: &mut Scene,
        _systems: &mut SystemCollection,
    ) -> Result<(), SystemError> {
        let particles = scene.particles();
        let n = particles.len();
        self.entities = particles.iter().map(|(e, _)| *e).collect();
        self.mass = particles.iter().map(|(_, p)| p.mass).collect();
        self.thickness = particles.iter().map(|(_, p)| p.thickness).collect();
        self.x = particles.iter().map(|(_, p)| p.position).collect();
        self.v = particles.iter().map(|(_, p)| p.velocity).collect();
        self.x_prev = self.x.clone();
        self.x_start = self.x.clone();
        self.x_tilde = self.x.clone();
        for buf in [
            &mut self.dx,
            &mut self.inertia_gradient,
            &mut self.contact_gradient,
        ] {
            buf.clear();
            buf.resize(n, Vec3::zero());
        }
        self.contact_hessian.clear();
        log::debug!("{} particles in scene", n);
        Ok(())
    }

    fn write_scene(&mut self, scene: &mut Scene, _systems: &SystemCollection) {
        for (i, &entity) in self.entities.iter().enumerate() {
            if let Ok(body) = scene.world_mut().query_one_mut::<&mut ParticleBody>(entity) {
                body.position = self.x[i];
                body.velocity = self.v[i];
            }
        }
    }
}

impl ParticleSystem {
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    #[inline]
    pub fn positions(&self) -> &[Vec3] {
        &self.x
    }

    #[inline]
    pub fn velocities(&self) -> &[Vec3] {
        &self.v
    }

    #[inline]
    pub fn masses(&self) -> &[f64] {
        &self.mass
    }

    /// Positions predicted for the end of the current substep without contact.
    #[inline]
    pub fn predicted_positions(&self) -> &[Vec3] {
        &self.x_tilde
    }

    /// Search direction from the last linear solve.
    #[inline]
    pub fn displacements(&self) -> &[Vec3] {
        &self.dx
    }

    #[inline]
    pub fn entities(&self) -> &[hecs::Entity] {
        &self.entities
    }

    #[inline]
    pub fn dof_info(&self) -> InitDofInfo {
        self.dofs
    }

    fn inertia(&self, i: usize) -> f64 {
        self.mass[i] / (self.dt * self.dt)
    }
}

impl VertexReporter for ParticleSystem {
    fn report_count(&mut self, _systems: &SystemCollection, info: &mut VertexCountInfo) {
        info.count(self.len());
    }

    fn report_attributes(&mut self, _systems: &SystemCollection, info: &mut VertexAttributeInfo<'_>) {
        self.vertex_offset = info.offset();
        let offset = self.vertex_offset;
        info.positions().copy_from_slice(&self.x);
        info.rest_positions().copy_from_slice(&self.x);
        info.thicknesses().copy_from_slice(&self.thickness);
        info.contact_element_ids().fill(0);
        // every particle is its own body
        for (i, id) in info.body_ids().iter_mut().enumerate() {
            *id = (offset + i) as u32;
        }
        for (i, id) in info.coindices().iter_mut().enumerate() {
            *id = i as u32;
        }
    }

    fn report_displacements(
        &mut self,
        _systems: &SystemCollection,
        info: &mut VertexDisplacementInfo<'_>,
    ) {
        info.displacements().copy_from_slice(&self.dx);
    }
}

impl DofPredictorReporter for ParticleSystem {
    fn predict(&mut self, _systems: &SystemCollection, info: &PredictInfo) {
        self.dt = info.dt;
        let dt = info.dt;
        self.x_prev.copy_from_slice(&self.x);
        for ((xt, x), v) in self.x_tilde.iter_mut().zip(&self.x).zip(&self.v) {
            *xt = *x + *v * dt + info.gravity * (dt * dt);
        }
        self.dx.fill(Vec3::zero());
    }

    fn compute_velocity(&mut self, _systems: &SystemCollection, info: &PredictInfo) {
        for ((v, x), xp) in self.v.iter_mut().zip(&self.x).zip(&self.x_prev) {
            *v = (*x - *xp) / info.dt;
        }
    }
}

impl GradientHessianProducer for ParticleSystem {
    fn compute_gradient_hessian(
        &mut self,
        _systems: &SystemCollection,
        info: &GradientHessianInfo,
    ) -> Result<(), SystemError> {
        self.dt = info.dt;
        for i in 0..self.len() {
            self.inertia_gradient[i] = (self.x[i] - self.x_tilde[i]) * self.inertia(i);
        }
        Ok(())
    }
}

impl ContactReceiver for ParticleSystem {
    fn report_range(&mut self, _systems: &SystemCollection, info: &mut ContactClassifyInfo) {
        info.range(ReceiveRange::Diagonal(
            self.vertex_offset..self.vertex_offset + self.len(),
        ));
    }

    fn receive(&mut self, _systems: &SystemCollection, info: &ClassifiedContactInfo) {
        let offset = self.vertex_offset as u32;
        self.contact_gradient.fill(Vec3::zero());
        for g in info.gradients() {
            self.contact_gradient[(g.vertex - offset) as usize] += g.gradient;
        }
        self.contact_hessian.clear();
        self.contact_hessian
            .extend(info.hessians().iter().map(|h| ContactHessian {
                i: h.i - offset,
                j: h.j - offset,
                block: h.block,
            }));
    }
}

impl DiagLinearSubsystem for ParticleSystem {
    fn report_init_extent(&mut self, _systems: &SystemCollection, info: &mut InitDofExtentInfo) {
        info.dof_count(3 * self.len());
    }

    fn receive_init_dof_info(&mut self, _systems: &SystemCollection, info: &InitDofInfo) {
        self.dofs = *info;
    }

    fn report_extent(&mut self, _systems: &SystemCollection, info: &mut DiagExtentInfo) {
        info.hessian_count(3 * self.len() + 9 * self.contact_hessian.len());
    }

    fn assemble(
        &mut self,
        _systems: &SystemCollection,
        info: &mut DiagAssembleInfo<'_>,
    ) -> Result<(), AssemblyError> {
        for i in 0..self.len() {
            let g = self.inertia_gradient[i] + self.contact_gradient[i];
            info.gradient()[3 * i..3 * i + 3].copy_from_slice(&[g.x, g.y, g.z]);
            let h = self.inertia(i);
            for k in 0..3 {
                info.hessian().push(3 * i + k, 3 * i + k, h)?;
            }
        }
        for h in &self.contact_hessian {
            info.hessian()
                .push_block3(3 * h.i as usize, 3 * h.j as usize, &h.block)?;
        }
        Ok(())
    }

    fn retrieve_solution(&mut self, _systems: &SystemCollection, info: &SolutionInfo<'_>) {
        for (dx, s) in self.dx.iter_mut().zip(info.solution.chunks_exact(3)) {
            *dx = Vec3::new(s[0], s[1], s[2]);
        }
    }
}

impl LineSearchReporter for ParticleSystem {
    fn record_start_point(&mut self, _systems: &SystemCollection) {
        self.x_start.copy_from_slice(&self.x);
    }

    fn step_forward(&mut self, _systems: &SystemCollection, alpha: f64) {
        for ((x, x0), dx) in self.x.iter_mut().zip(&self.x_start).zip(&self.dx) {
            *x = *x0 + *dx * alpha;
        }
    }

    fn compute_energy(&mut self, _systems: &mut SystemCollection) -> Result<f64, SystemError> {
        Ok((0..self.len())
            .map(|i| 0.5 * self.inertia(i) * (self.x[i] - self.x_tilde[i]).mag_sq())
            .sum())
    }
}

//
// Preconditioner
//

/// Jacobi (inverse diagonal) preconditioner on the particles' degrees of freedom.
#[derive(Debug, Default)]
pub struct ParticleJacobiPreconditioner {
    target: Option<SystemSlot<ParticleSystem>>,
    inv_diag: Vec<f64>,
}

impl Subsystem for ParticleJacobiPreconditioner {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let linear = ctx.require::<GlobalLinearSystem>()?;
        self.target = Some(ctx.require::<ParticleSystem>()?);
        let this = Capability::<dyn LocalPreconditioner>::of(ctx.this::<Self>());
        ctx.on_built(move |systems| {
            systems.get_mut(linear)?.add_local_preconditioner(this)?;
            Ok(())
        });
        Ok(())
    }
}

impl LocalPreconditioner for ParticleJacobiPreconditioner {
    fn target(&self) -> Result<SystemId, SystemError> {
        Ok(resolved(self.target)?.id())
    }

    fn assemble(&mut self, _systems: &SystemCollection, info: &PreconditionerAssembleInfo<'_>) {
        let diagonal = info.matrix.diagonal();
        self.inv_diag.clear();
        self.inv_diag.extend(
            diagonal[info.dofs.clone()]
                .iter()
                .map(|d| if d.abs() > f64::EPSILON { 1.0 / d } else { 1.0 }),
        );
    }

    fn apply(&mut self, r: &[f64], z: &mut [f64]) {
        for ((z, r), d) in z.iter_mut().zip(r).zip(&self.inv_diag) {
            *z = r * d;
        }
    }
}
