//! Contact gradients and Hessians, gathered from contact reporters
//! and handed to the systems that own the vertices involved.
//!
//! Every substep the [`GlobalContactManager`] runs the same two-phase protocol
//! as the vertex manager: reporters first declare how many gradient and Hessian
//! entries they produce, then write them into their segments of shared buffers.
//! The entries are then classified by the vertex ranges each
//! [`ContactReceiver`] claims and dispatched to it.

use std::ops::Range;

use crate::{
    dynamics::{LineSearchReporter, LineSearcher},
    engine::EngineCreateInfo,
    math::{Mat3, Vec3},
    system::{
        capability_trait, BuildContext, BuildError, Capability, CapabilitySet, CreateSystem,
        Subsystem, SystemCollection, SystemError,
    },
    util::{buffer::ReservedBuffer, offset_count::OffsetCountCollection},
};

mod penalty;
pub use penalty::{VertexHalfPlanePenalty, VertexVertexPenalty};

//
// Entries
//

/// Gradient of the contact energy with respect to one vertex.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContactGradient {
    /// Index into the global vertex buffer.
    pub vertex: u32,
    pub gradient: Vec3,
}

impl Default for ContactGradient {
    fn default() -> Self {
        Self {
            vertex: 0,
            gradient: Vec3::zero(),
        }
    }
}

/// One 3x3 block of the contact Hessian, coupling vertex `i` (rows) to vertex `j` (columns).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContactHessian {
    pub i: u32,
    pub j: u32,
    pub block: Mat3,
}

impl Default for ContactHessian {
    fn default() -> Self {
        Self {
            i: 0,
            j: 0,
            block: Mat3::new(Vec3::zero(), Vec3::zero(), Vec3::zero()),
        }
    }
}

//
// Reporter side
//

/// A system that contributes contact energy.
pub trait ContactReporter {
    /// Activation distance this reporter's potential needs.
    fn d_hat(&self) -> f64;

    /// Number of entries this reporter writes in the next assembly.
    fn report_extent(
        &mut self,
        systems: &SystemCollection,
        info: &mut ContactExtentInfo,
    ) -> Result<(), SystemError>;

    /// Fill this reporter's gradient and Hessian segments.
    /// Every slot of a segment is written, since unwritten slots would be
    /// dispatched as zero blocks on vertex 0.
    fn assemble(
        &mut self,
        systems: &SystemCollection,
        info: &mut ContactAssembleInfo<'_>,
    ) -> Result<(), SystemError>;

    /// Contact energy at the current vertex positions.
    fn compute_energy(
        &mut self,
        systems: &SystemCollection,
        info: &ContactEnergyInfo,
    ) -> Result<f64, SystemError>;
}
capability_trait!(ContactReporter);

#[derive(Debug)]
pub struct ContactExtentInfo {
    params: ContactEnergyInfo,
    gradient_count: usize,
    hessian_count: usize,
}

impl ContactExtentInfo {
    /// Parameters the following assembly will use.
    #[inline]
    pub fn params(&self) -> ContactEnergyInfo {
        self.params
    }

    #[inline]
    pub fn gradient_count(&mut self, count: usize) {
        self.gradient_count = count;
    }

    #[inline]
    pub fn hessian_count(&mut self, count: usize) {
        self.hessian_count = count;
    }
}

/// Parameters shared by every contact potential.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContactEnergyInfo {
    pub d_hat: f64,
    pub kappa: f64,
}

/// One reporter's segments of the contact gradient and Hessian buffers.
pub struct ContactAssembleInfo<'a> {
    params: ContactEnergyInfo,
    gradients: &'a mut [ContactGradient],
    hessians: &'a mut [ContactHessian],
}

impl<'a> ContactAssembleInfo<'a> {
    #[inline]
    pub fn params(&self) -> ContactEnergyInfo {
        self.params
    }

    #[inline]
    pub fn gradients(&mut self) -> &mut [ContactGradient] {
        self.gradients
    }

    #[inline]
    pub fn hessians(&mut self) -> &mut [ContactHessian] {
        self.hessians
    }
}

//
// Receiver side
//

/// Vertices a receiver wants contact entries for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveRange {
    /// Gradients of vertices in the range and Hessian blocks with both vertices in it.
    Diagonal(Range<usize>),
    /// Hessian blocks coupling a vertex in the first range to one in the second.
    OffDiagonal(Range<usize>, Range<usize>),
}

impl ReceiveRange {
    fn accepts_gradient(&self, g: &ContactGradient) -> bool {
        match self {
            ReceiveRange::Diagonal(r) => r.contains(&(g.vertex as usize)),
            ReceiveRange::OffDiagonal(..) => false,
        }
    }

    fn accepts_hessian(&self, h: &ContactHessian) -> bool {
        let (i, j) = (h.i as usize, h.j as usize);
        match self {
            ReceiveRange::Diagonal(r) => r.contains(&i) && r.contains(&j),
            ReceiveRange::OffDiagonal(l, r) => l.contains(&i) && r.contains(&j),
        }
    }
}

#[derive(Debug, Default)]
pub struct ContactClassifyInfo {
    range: Option<ReceiveRange>,
}

impl ContactClassifyInfo {
    #[inline]
    pub fn range(&mut self, range: ReceiveRange) {
        self.range = Some(range);
    }
}

/// Contact entries that fall in one receiver's range.
#[derive(Debug, Default)]
pub struct ClassifiedContactInfo {
    gradients: Vec<ContactGradient>,
    hessians: Vec<ContactHessian>,
}

impl ClassifiedContactInfo {
    #[inline]
    pub fn gradients(&self) -> &[ContactGradient] {
        &self.gradients
    }

    #[inline]
    pub fn hessians(&self) -> &[ContactHessian] {
        &self.hessians
    }
}

/// A system that consumes contact entries for the vertices it owns.
pub trait ContactReceiver {
    fn report_range(&mut self, systems: &SystemCollection, info: &mut ContactClassifyInfo);
    fn receive(&mut self, systems: &SystemCollection, info: &ClassifiedContactInfo);
}
capability_trait!(ContactReceiver);

//
// Manager
//

/// Collects contact entries from reporters and dispatches them to receivers.
pub struct GlobalContactManager {
    reporters: CapabilitySet<dyn ContactReporter>,
    receivers: CapabilitySet<dyn ContactReceiver>,
    config_d_hat: f64,
    d_hat: f64,
    kappa: f64,
    eps_velocity: f64,
    gradient_layout: OffsetCountCollection,
    hessian_layout: OffsetCountCollection,
    gradients: ReservedBuffer<ContactGradient>,
    hessians: ReservedBuffer<ContactHessian>,
    classified: Vec<ClassifiedContactInfo>,
}

impl CreateSystem for GlobalContactManager {
    fn create(info: &EngineCreateInfo) -> Self {
        let contact = info.config.contact;
        let ratio = info.config.collision.reserve_ratio;
        Self {
            reporters: CapabilitySet::new("GlobalContactManager"),
            receivers: CapabilitySet::new("GlobalContactManager"),
            config_d_hat: contact.d_hat,
            d_hat: contact.d_hat,
            kappa: contact.kappa,
            eps_velocity: contact.eps_velocity,
            gradient_layout: OffsetCountCollection::new(),
            hessian_layout: OffsetCountCollection::new(),
            gradients: ReservedBuffer::new(ratio),
            hessians: ReservedBuffer::new(ratio),
            classified: Vec::new(),
        }
    }
}

impl Subsystem for GlobalContactManager {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        if !ctx.config().contact.enable {
            return Err(BuildError::Disabled("contact is disabled in config".into()));
        }
        if let Some(searcher) = ctx.find::<LineSearcher>()? {
            let this = Capability::<dyn LineSearchReporter>::of(ctx.this::<Self>());
            ctx.on_built(move |systems| {
                systems.get_mut(searcher)?.add_reporter(this)?;
                Ok(())
            });
        }
        Ok(())
    }
}

impl GlobalContactManager {
    pub fn add_reporter(
        &mut self,
        reporter: Capability<dyn ContactReporter>,
    ) -> Result<usize, SystemError> {
        self.reporters.insert(reporter)
    }

    pub fn add_receiver(
        &mut self,
        receiver: Capability<dyn ContactReceiver>,
    ) -> Result<usize, SystemError> {
        self.receivers.insert(receiver)
    }

    /// Activation distance: the largest any reporter needs.
    /// Falls back to the configured value when nothing reports contact.
    #[inline]
    pub fn d_hat(&self) -> f64 {
        self.d_hat
    }

    #[inline]
    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    #[inline]
    pub fn eps_velocity(&self) -> f64 {
        self.eps_velocity
    }

    fn params(&self) -> ContactEnergyInfo {
        ContactEnergyInfo {
            d_hat: self.d_hat,
            kappa: self.kappa,
        }
    }

    /// Recompute [`d_hat`][Self::d_hat] from the registered reporters.
    pub fn update_d_hat(&mut self, systems: &mut SystemCollection) -> Result<f64, SystemError> {
        let mut d_hat: Option<f64> = None;
        for reporter in self.reporters.iter() {
            let r = systems.with_capability(reporter, |r, _| r.d_hat())?;
            d_hat = Some(d_hat.map_or(r, |d| d.max(r)));
        }
        self.d_hat = d_hat.unwrap_or(self.config_d_hat);
        Ok(self.d_hat)
    }

    /// Gather contact entries from every reporter and dispatch them to receivers.
    pub fn compute_gradient_hessian(
        &mut self,
        systems: &mut SystemCollection,
    ) -> Result<(), SystemError> {
        let _span = tracy_span!("contact gradient hessian", "compute_gradient_hessian");

        // extent
        let params = self.params();
        let n = self.reporters.len();
        self.gradient_layout.resize(n);
        self.hessian_layout.resize(n);
        for (i, reporter) in self.reporters.iter().enumerate() {
            let mut info = ContactExtentInfo {
                params,
                gradient_count: 0,
                hessian_count: 0,
            };
            systems.with_capability(reporter, |r, systems| r.report_extent(systems, &mut info))??;
            self.gradient_layout.counts_mut()[i] = info.gradient_count;
            self.hessian_layout.counts_mut()[i] = info.hessian_count;
        }
        self.gradient_layout.scan();
        self.hessian_layout.scan();
        self.gradients.resize(self.gradient_layout.total_count());
        self.hessians.resize(self.hessian_layout.total_count());
        self.gradients.fill(ContactGradient::default());
        self.hessians.fill(ContactHessian::default());

        // assemble
        for (i, reporter) in self.reporters.iter().enumerate() {
            let mut info = ContactAssembleInfo {
                params,
                gradients: &mut self.gradients[self.gradient_layout.range(i)],
                hessians: &mut self.hessians[self.hessian_layout.range(i)],
            };
            systems.with_capability(reporter, |r, systems| r.assemble(systems, &mut info))??;
        }

        // classify
        self.classified.clear();
        for receiver in self.receivers.iter() {
            let mut info = ContactClassifyInfo::default();
            systems.with_capability(receiver, |r, systems| r.report_range(systems, &mut info))?;
            let classified = match info.range {
                Some(range) => ClassifiedContactInfo {
                    gradients: self
                        .gradients
                        .iter()
                        .filter(|g| range.accepts_gradient(g))
                        .copied()
                        .collect(),
                    hessians: self
                        .hessians
                        .iter()
                        .filter(|h| range.accepts_hessian(h))
                        .copied()
                        .collect(),
                },
                None => ClassifiedContactInfo::default(),
            };
            self.classified.push(classified);
        }

        // dispatch
        for (receiver, info) in self.receivers.iter().zip(&self.classified) {
            systems.with_capability(receiver, |r, systems| r.receive(systems, info))?;
        }

        log::trace!(
            "Contact: {} gradients, {} hessian blocks",
            self.gradients.len(),
            self.hessians.len()
        );
        Ok(())
    }

    /// Sum of every reporter's contact energy at the current positions.
    pub fn compute_energy(&mut self, systems: &mut SystemCollection) -> Result<f64, SystemError> {
        let params = self.params();
        let mut energy = 0.0;
        for reporter in self.reporters.iter() {
            energy += systems.with_capability(reporter, |r, systems| {
                r.compute_energy(systems, &params)
            })??;
        }
        Ok(energy)
    }

    /// Gradient entries from the last assembly.
    #[inline]
    pub fn gradients(&self) -> &[ContactGradient] {
        &self.gradients
    }

    /// Hessian blocks from the last assembly.
    #[inline]
    pub fn hessians(&self) -> &[ContactHessian] {
        &self.hessians
    }

    #[inline]
    pub fn reporter_count(&self) -> usize {
        self.reporters.len()
    }

    #[inline]
    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }
}

impl LineSearchReporter for GlobalContactManager {
    fn record_start_point(&mut self, _systems: &SystemCollection) {}

    fn step_forward(&mut self, _systems: &SystemCollection, _alpha: f64) {}

    fn compute_energy(&mut self, systems: &mut SystemCollection) -> Result<f64, SystemError> {
        GlobalContactManager::compute_energy(self, systems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{SystemRegistry, SystemSlot};

    /// Reports a fixed set of entries.
    struct Fixed<const TAG: u8> {
        d_hat: f64,
        gradients: Vec<ContactGradient>,
        hessians: Vec<ContactHessian>,
    }

    impl<const TAG: u8> Subsystem for Fixed<TAG> {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            let manager = ctx.require::<GlobalContactManager>()?;
            let this = Capability::<dyn ContactReporter>::of(ctx.this::<Self>());
            ctx.on_built(move |systems| {
                systems.get_mut(manager)?.add_reporter(this)?;
                Ok(())
            });
            Ok(())
        }
    }

    impl<const TAG: u8> ContactReporter for Fixed<TAG> {
        fn d_hat(&self) -> f64 {
            self.d_hat
        }
        fn report_extent(
            &mut self,
            _: &SystemCollection,
            info: &mut ContactExtentInfo,
        ) -> Result<(), SystemError> {
            info.gradient_count(self.gradients.len());
            info.hessian_count(self.hessians.len());
            Ok(())
        }
        fn assemble(
            &mut self,
            _: &SystemCollection,
            info: &mut ContactAssembleInfo<'_>,
        ) -> Result<(), SystemError> {
            info.gradients().copy_from_slice(&self.gradients);
            info.hessians().copy_from_slice(&self.hessians);
            Ok(())
        }
        fn compute_energy(
            &mut self,
            _: &SystemCollection,
            _: &ContactEnergyInfo,
        ) -> Result<f64, SystemError> {
            Ok(self.gradients.len() as f64)
        }
    }

    /// Remembers what it received for a fixed range.
    struct Sink<const TAG: u8> {
        range: ReceiveRange,
        received: Vec<u32>,
        received_blocks: Vec<(u32, u32)>,
    }

    impl<const TAG: u8> Subsystem for Sink<TAG> {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            let manager = ctx.require::<GlobalContactManager>()?;
            let this = Capability::<dyn ContactReceiver>::of(ctx.this::<Self>());
            ctx.on_built(move |systems| {
                systems.get_mut(manager)?.add_receiver(this)?;
                Ok(())
            });
            Ok(())
        }
    }

    impl<const TAG: u8> ContactReceiver for Sink<TAG> {
        fn report_range(&mut self, _: &SystemCollection, info: &mut ContactClassifyInfo) {
            info.range(self.range.clone());
        }
        fn receive(&mut self, _: &SystemCollection, info: &ClassifiedContactInfo) {
            self.received = info.gradients().iter().map(|g| g.vertex).collect();
            self.received_blocks = info.hessians().iter().map(|h| (h.i, h.j)).collect();
        }
    }

    fn grad(vertex: u32) -> ContactGradient {
        ContactGradient {
            vertex,
            ..Default::default()
        }
    }

    fn hess(i: u32, j: u32) -> ContactHessian {
        ContactHessian {
            i,
            j,
            ..Default::default()
        }
    }

    fn setup(enable: bool) -> SystemCollection {
        let mut info = EngineCreateInfo::default();
        info.config.contact.enable = enable;
        info.config.contact.d_hat = 0.05;
        let mut registry = SystemRegistry::new();
        registry
            .register::<GlobalContactManager>()
            .unwrap()
            .register_with(|_| Fixed::<0> {
                d_hat: 0.1,
                gradients: vec![grad(0), grad(5)],
                hessians: vec![hess(0, 0), hess(0, 5), hess(5, 0)],
            })
            .unwrap()
            .register_with(|_| Fixed::<1> {
                d_hat: 0.2,
                gradients: vec![grad(6)],
                hessians: vec![hess(6, 6)],
            })
            .unwrap()
            .register_with(|_| Sink::<0> {
                range: ReceiveRange::Diagonal(0..4),
                received: Vec::new(),
                received_blocks: Vec::new(),
            })
            .unwrap()
            .register_with(|_| Sink::<1> {
                range: ReceiveRange::Diagonal(4..8),
                received: Vec::new(),
                received_blocks: Vec::new(),
            })
            .unwrap()
            .register_with(|_| Sink::<2> {
                range: ReceiveRange::OffDiagonal(0..4, 4..8),
                received: Vec::new(),
                received_blocks: Vec::new(),
            })
            .unwrap();
        let mut systems = SystemCollection::new(&registry, info);
        systems.build_all().unwrap();
        systems
    }

    fn run(systems: &mut SystemCollection) -> SystemSlot<GlobalContactManager> {
        let manager = systems.find::<GlobalContactManager>().unwrap();
        systems
            .with_system(manager, |m, systems| -> Result<(), SystemError> {
                m.update_d_hat(systems)?;
                m.compute_gradient_hessian(systems)
            })
            .unwrap()
            .unwrap();
        manager
    }

    /// Entries are laid out reporter after reporter and routed by vertex range.
    #[test]
    fn classify_and_dispatch() {
        let mut systems = setup(true);
        let manager = run(&mut systems);

        let m = systems.get(manager).unwrap();
        assert_eq!(m.d_hat(), 0.2);
        itertools::assert_equal(m.gradients().iter().map(|g| g.vertex), [0, 5, 6]);
        assert_eq!(m.hessians().len(), 4);

        let sink0 = systems.get(systems.find::<Sink<0>>().unwrap()).unwrap();
        assert_eq!(sink0.received, vec![0]);
        assert_eq!(sink0.received_blocks, vec![(0, 0)]);
        let sink1 = systems.get(systems.find::<Sink<1>>().unwrap()).unwrap();
        assert_eq!(sink1.received, vec![5, 6]);
        assert_eq!(sink1.received_blocks, vec![(6, 6)]);
        let sink2 = systems.get(systems.find::<Sink<2>>().unwrap()).unwrap();
        assert!(sink2.received.is_empty());
        assert_eq!(sink2.received_blocks, vec![(0, 5)]);

        let energy = systems
            .with_system(manager, |m, systems| m.compute_energy(systems))
            .unwrap()
            .unwrap();
        assert_eq!(energy, 3.0);
    }

    /// Disabling contact invalidates the manager and everything built on it.
    #[test]
    fn disabled_contact_cascades() {
        let mut systems = setup(false);
        assert!(systems.find::<GlobalContactManager>().is_none());
        assert!(systems.find::<Fixed<0>>().is_none());
        assert!(systems.find::<Sink<2>>().is_none());
        assert!(matches!(
            systems.resolve::<Fixed<1>>(),
            Err(SystemError::Invalid("Fixed<1>"))
        ));
    }

    /// A receiver can't be registered twice.
    #[test]
    fn double_receiver_registration() {
        let mut systems = setup(true);
        let manager = systems.find::<GlobalContactManager>().unwrap();
        let sink = systems.find::<Sink<0>>().unwrap();
        let err = systems
            .get_mut(manager)
            .unwrap()
            .add_receiver(Capability::<dyn ContactReceiver>::of(sink))
            .unwrap_err();
        assert!(matches!(err, SystemError::DoubleRegistration { .. }));
    }
}
