use std::{any::TypeId, collections::HashMap, fmt};
use thunderdome as td;

use super::{
    build::BuildContext,
    registry::{Creator, SystemRegistry},
    short_name, BuildError, Capability, Subsystem, SystemError, SystemId, SystemSlot,
};
use crate::{config::EngineConfig, engine::EngineCreateInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BuildState {
    Unvisited,
    Visiting,
    Done,
}

struct SystemEntry {
    name: &'static str,
    // None while leased out
    system: Option<Box<dyn Subsystem>>,
    state: BuildState,
    valid: bool,
    engine_aware: bool,
    dependencies: Vec<SystemId>,
    disabled_reason: Option<String>,
}

/// The subsystem instances of one engine.
///
/// Systems are stored in an arena and never removed,
/// so a [`SystemId`] stays valid for the lifetime of the collection.
/// Systems that fail to build are kept but marked invalid.
pub struct SystemCollection {
    info: EngineCreateInfo,
    creators: HashMap<TypeId, Creator>,
    creator_order: Vec<TypeId>,
    entries: td::Arena<SystemEntry>,
    by_type: HashMap<TypeId, SystemId>,
    build_order: Vec<SystemId>,
}

impl SystemCollection {
    /// Create an empty collection that instantiates systems from the given registry.
    /// Seals the registry.
    pub fn new(registry: &SystemRegistry, info: EngineCreateInfo) -> Self {
        registry.seal();
        let creators = registry.creators();
        Self {
            info,
            creator_order: creators.iter().map(|c| c.type_id).collect(),
            creators: creators.iter().map(|c| (c.type_id, c.clone())).collect(),
            entries: td::Arena::new(),
            by_type: HashMap::new(),
            build_order: Vec::new(),
        }
    }

    #[inline]
    pub fn create_info(&self) -> &EngineCreateInfo {
        &self.info
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.info.config
    }

    //
    // Instantiation and building
    //

    /// Add an already constructed system that doesn't go through the registry.
    /// It still needs to be built before it can be used.
    pub fn insert<T: Subsystem>(&mut self, system: T) -> Result<SystemSlot<T>, SystemError> {
        let type_id = TypeId::of::<T>();
        let name = std::any::type_name::<T>();
        if self.by_type.contains_key(&type_id) {
            return Err(SystemError::DuplicateInstance(short_name(name)));
        }
        Ok(SystemSlot::new(self.insert_boxed(type_id, name, Box::new(system))))
    }

    fn insert_boxed(
        &mut self,
        type_id: TypeId,
        name: &'static str,
        system: Box<dyn Subsystem>,
    ) -> SystemId {
        let id = SystemId(self.entries.insert(SystemEntry {
            name,
            system: Some(system),
            state: BuildState::Unvisited,
            valid: false,
            engine_aware: false,
            dependencies: Vec::new(),
            disabled_reason: None,
        }));
        self.by_type.insert(type_id, id);
        id
    }

    pub(super) fn can_instantiate(&self, type_id: TypeId) -> bool {
        self.by_type.contains_key(&type_id) || self.creators.contains_key(&type_id)
    }

    /// Get the instance of a type, creating it if it doesn't exist yet.
    pub(super) fn instantiate(
        &mut self,
        type_id: TypeId,
        name: &'static str,
    ) -> Result<SystemId, SystemError> {
        if let Some(id) = self.by_type.get(&type_id) {
            return Ok(*id);
        }
        let creator = self
            .creators
            .get(&type_id)
            .ok_or(SystemError::MissingCreator(short_name(name)))?;
        let create = creator.create.clone();
        let name = creator.name;
        let system = create(&self.info);
        Ok(self.insert_boxed(type_id, name, system))
    }

    /// Get the built instance of `T`, creating and building it
    /// and everything it depends on if needed.
    pub fn resolve<T: Subsystem>(&mut self) -> Result<SystemSlot<T>, SystemError> {
        let name = std::any::type_name::<T>();
        let id = self.instantiate(TypeId::of::<T>(), name)?;
        self.resolve_id(id)?;
        if self.is_valid(id) {
            Ok(SystemSlot::new(id))
        } else {
            Err(SystemError::Invalid(short_name(name)))
        }
    }

    /// Instantiate and build every registered system.
    pub fn build_all(&mut self) -> Result<(), SystemError> {
        let _span = tracy_span!("build systems", "build_all");
        for type_id in self.creator_order.clone() {
            let name = self.creators.get(&type_id).map_or("?", |c| c.name);
            let id = self.instantiate(type_id, name)?;
            self.resolve_id(id)?;
        }
        // systems inserted manually
        let unbuilt: Vec<SystemId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state != BuildState::Done)
            .map(|(idx, _)| SystemId(idx))
            .collect();
        for id in unbuilt {
            self.resolve_id(id)?;
        }
        log::debug!("{}", self);
        Ok(())
    }

    /// Build a system and its dependencies.
    ///
    /// Walks the dependency graph with an explicit stack.
    /// A system asking for an unbuilt dependency gets `BuildError::Pending`;
    /// the dependency is pushed, built, and then the dependent is built again.
    /// Asking for a system that is still on the stack is a cycle.
    fn resolve_id(&mut self, root: SystemId) -> Result<(), SystemError> {
        let mut stack = vec![root];
        while let Some(&id) = stack.last() {
            let entry = self.entry_mut(id)?;
            if entry.state == BuildState::Done {
                stack.pop();
                continue;
            }
            entry.state = BuildState::Visiting;
            let name = entry.name;
            let mut system = entry.system.take().ok_or(SystemError::Leased(short_name(name)))?;

            let mut ctx = BuildContext::new(self, id);
            let result = system.build(&mut ctx);
            let BuildContext {
                dependencies,
                commits,
                engine_aware,
                ..
            } = ctx;

            let entry = self.entry_mut(id)?;
            entry.system = Some(system);
            match result {
                Ok(()) => {
                    entry.state = BuildState::Done;
                    entry.valid = true;
                    entry.engine_aware = engine_aware;
                    entry.dependencies = dependencies;
                    self.build_order.push(id);
                    log::debug!("Built system {}", short_name(name));
                    for commit in commits {
                        commit(self)?;
                    }
                    stack.pop();
                }
                Err(BuildError::Pending(dep)) => {
                    let dep_entry = self.entry(dep)?;
                    let (dep_state, dep_name) = (dep_entry.state, dep_entry.name);
                    match dep_state {
                        BuildState::Unvisited => stack.push(dep),
                        BuildState::Visiting => {
                            let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                            let mut cycle: Vec<&'static str> = stack[start..]
                                .iter()
                                .map(|s| short_name(self.name(*s)))
                                .collect();
                            cycle.push(short_name(dep_name));
                            return Err(SystemError::Cycle(cycle));
                        }
                        BuildState::Done => {
                            // can't happen through BuildContext, but would loop forever
                            self.disable(id, format!("waited on already built system {}", dep));
                            stack.pop();
                        }
                    }
                }
                Err(BuildError::Disabled(reason)) => {
                    self.disable(id, reason);
                    stack.pop();
                }
                Err(BuildError::Fatal(err)) => return Err(err),
            }
        }
        Ok(())
    }

    fn disable(&mut self, id: SystemId, reason: String) {
        if let Some(entry) = self.entries.get_mut(id.0) {
            log::debug!("System {} is invalid: {}", short_name(entry.name), reason);
            entry.state = BuildState::Done;
            entry.valid = false;
            entry.disabled_reason = Some(reason);
        }
    }

    //
    // Queries
    //

    fn entry(&self, id: SystemId) -> Result<&SystemEntry, SystemError> {
        self.entries.get(id.0).ok_or(SystemError::UnknownSystem(id))
    }

    fn entry_mut(&mut self, id: SystemId) -> Result<&mut SystemEntry, SystemError> {
        self.entries
            .get_mut(id.0)
            .ok_or(SystemError::UnknownSystem(id))
    }

    /// Slot of the instance of `T` if it exists and was built successfully.
    pub fn find<T: Subsystem>(&self) -> Option<SystemSlot<T>> {
        let id = *self.by_type.get(&TypeId::of::<T>())?;
        self.is_valid(id).then(|| SystemSlot::new(id))
    }

    #[inline]
    pub fn is_valid(&self, id: SystemId) -> bool {
        self.entries.get(id.0).map_or(false, |e| e.valid)
    }

    #[inline]
    pub fn is_built(&self, id: SystemId) -> bool {
        self.entries
            .get(id.0)
            .map_or(false, |e| e.state == BuildState::Done)
    }

    #[inline]
    pub fn is_engine_aware(&self, id: SystemId) -> bool {
        self.entries.get(id.0).map_or(false, |e| e.engine_aware)
    }

    /// Full type name of a system, or `"?"` if it doesn't exist.
    pub fn name(&self, id: SystemId) -> &'static str {
        self.entries.get(id.0).map_or("?", |e| e.name)
    }

    /// Why a system was marked invalid, if it was.
    pub fn disabled_reason(&self, id: SystemId) -> Option<&str> {
        self.entries.get(id.0)?.disabled_reason.as_deref()
    }

    /// Systems a system required or found during its build.
    pub fn dependencies(&self, id: SystemId) -> &[SystemId] {
        self.entries
            .get(id.0)
            .map_or(&[][..], |e| e.dependencies.as_slice())
    }

    /// Valid systems in the order their builds completed,
    /// which always puts dependencies before their dependents.
    pub fn valid_systems(&self) -> impl Iterator<Item = SystemId> + '_ {
        self.build_order
            .iter()
            .copied()
            .filter(move |id| self.is_valid(*id))
    }

    /// Valid systems that asked the engine to drive their scene hooks, in build order.
    pub fn engine_aware_systems(&self) -> Vec<SystemId> {
        self.valid_systems()
            .filter(|id| self.is_engine_aware(*id))
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    //
    // Access
    //

    pub fn get<T: Subsystem>(&self, slot: SystemSlot<T>) -> Result<&T, SystemError> {
        let entry = self.entry(slot.id())?;
        if !entry.valid {
            return Err(SystemError::Invalid(short_name(entry.name)));
        }
        let system = entry
            .system
            .as_deref()
            .ok_or(SystemError::Leased(short_name(entry.name)))?;
        system
            .as_any()
            .downcast_ref::<T>()
            .ok_or(SystemError::TypeMismatch {
                expected: short_name(std::any::type_name::<T>()),
                found: short_name(entry.name),
            })
    }

    pub fn get_mut<T: Subsystem>(&mut self, slot: SystemSlot<T>) -> Result<&mut T, SystemError> {
        let entry = self.entry_mut(slot.id())?;
        if !entry.valid {
            return Err(SystemError::Invalid(short_name(entry.name)));
        }
        let name = entry.name;
        let system = entry
            .system
            .as_deref_mut()
            .ok_or(SystemError::Leased(short_name(name)))?;
        system
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or(SystemError::TypeMismatch {
                expected: short_name(std::any::type_name::<T>()),
                found: short_name(name),
            })
    }

    /// Take a system out of the collection for the duration of `f`,
    /// so it can be used mutably alongside the rest of the collection.
    ///
    /// While leased, accessing the system through the collection fails with
    /// [`SystemError::Leased`].
    pub fn with_dyn<R>(
        &mut self,
        id: SystemId,
        f: impl FnOnce(&mut dyn Subsystem, &mut SystemCollection) -> R,
    ) -> Result<R, SystemError> {
        let entry = self.entry_mut(id)?;
        if !entry.valid {
            return Err(SystemError::Invalid(short_name(entry.name)));
        }
        let mut system = entry
            .system
            .take()
            .ok_or(SystemError::Leased(short_name(entry.name)))?;
        let ret = f(system.as_mut(), self);
        if let Some(entry) = self.entries.get_mut(id.0) {
            entry.system = Some(system);
        }
        Ok(ret)
    }

    /// Lease a system with its concrete type. See [`with_dyn`][Self::with_dyn].
    pub fn with_system<T: Subsystem, R>(
        &mut self,
        slot: SystemSlot<T>,
        f: impl FnOnce(&mut T, &mut SystemCollection) -> R,
    ) -> Result<R, SystemError> {
        let name = self.name(slot.id());
        self.with_dyn(slot.id(), |system, systems| {
            match system.as_any_mut().downcast_mut::<T>() {
                Some(system) => Ok(f(system, systems)),
                None => Err(SystemError::TypeMismatch {
                    expected: short_name(std::any::type_name::<T>()),
                    found: short_name(name),
                }),
            }
        })?
    }

    /// Lease a system through one of its roles. See [`with_dyn`][Self::with_dyn].
    pub fn with_capability<C: ?Sized, R>(
        &mut self,
        cap: Capability<C>,
        f: impl FnOnce(&mut C, &mut SystemCollection) -> R,
    ) -> Result<R, SystemError> {
        let name = self.name(cap.id());
        self.with_dyn(cap.id(), |system, systems| match cap.cast(system) {
            Some(role) => Ok(f(role, systems)),
            None => Err(SystemError::TypeMismatch {
                expected: short_name(std::any::type_name::<C>()),
                found: short_name(name),
            }),
        })?
    }
}

/// Lists built systems, `>` marking engine-aware ones and `*` the rest,
/// followed by invalid systems and the reason they were disabled.
impl fmt::Display for SystemCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Built systems:")?;
        for id in self.valid_systems() {
            let mark = if self.is_engine_aware(id) { '>' } else { '*' };
            writeln!(f, "{} {}", mark, short_name(self.name(id)))?;
        }
        let mut invalid = self.entries.iter().filter(|(_, e)| !e.valid).peekable();
        if invalid.peek().is_some() {
            writeln!(f, "Invalid systems:")?;
            for (_, entry) in invalid {
                writeln!(
                    f,
                    "- {}: {}",
                    short_name(entry.name),
                    entry.disabled_reason.as_deref().unwrap_or("not built")
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    type Counter = Rc<Cell<usize>>;

    fn counter() -> Counter {
        Rc::new(Cell::new(0))
    }

    fn count_on_built(ctx: &mut BuildContext<'_>, counter: &Counter) {
        let counter = counter.clone();
        ctx.on_built(move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        });
    }

    // A depends on B and C, B depends on C

    struct A(Counter);
    impl Subsystem for A {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            ctx.require::<B>()?;
            ctx.require::<C>()?;
            count_on_built(ctx, &self.0);
            Ok(())
        }
    }

    struct B(Counter);
    impl Subsystem for B {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            ctx.require::<C>()?;
            count_on_built(ctx, &self.0);
            Ok(())
        }
    }

    struct C(Counter);
    impl Subsystem for C {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            ctx.mark_engine_aware();
            count_on_built(ctx, &self.0);
            Ok(())
        }
    }

    fn diamond_registry(a: &Counter, b: &Counter, c: &Counter) -> SystemRegistry {
        let mut registry = SystemRegistry::new();
        let (a, b, c) = (a.clone(), b.clone(), c.clone());
        registry.register_with(move |_| A(a.clone())).unwrap();
        registry.register_with(move |_| B(b.clone())).unwrap();
        registry.register_with(move |_| C(c.clone())).unwrap();
        registry
    }

    /// Every system completes its build once, dependencies first.
    #[test]
    fn builds_each_system_once() {
        let (a, b, c) = (counter(), counter(), counter());
        let registry = diamond_registry(&a, &b, &c);
        let mut systems = SystemCollection::new(&registry, EngineCreateInfo::default());
        systems.build_all().unwrap();
        // resolving again after everything is built does nothing
        let a_slot = systems.resolve::<A>().unwrap();
        systems.resolve::<C>().unwrap();

        assert_eq!((a.get(), b.get(), c.get()), (1, 1, 1));
        let order: Vec<&str> = systems
            .valid_systems()
            .map(|id| short_name(systems.name(id)))
            .collect();
        assert_eq!(order, ["C", "B", "A"]);
        assert_eq!(systems.dependencies(a_slot.id()).len(), 2);
        assert_eq!(systems.engine_aware_systems().len(), 1);
        assert!(registry.is_sealed());
    }

    /// Resolving a single system in a fresh collection builds only what it needs.
    #[test]
    fn resolve_builds_dependencies_on_demand() {
        let (a, b, c) = (counter(), counter(), counter());
        let registry = diamond_registry(&a, &b, &c);
        let mut systems = SystemCollection::new(&registry, EngineCreateInfo::default());
        systems.resolve::<B>().unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (0, 1, 1));
        assert!(systems.find::<A>().is_none());
        assert!(systems.find::<C>().is_some());
    }

    struct CycleA;
    impl Subsystem for CycleA {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            ctx.require::<CycleB>()?;
            Ok(())
        }
    }

    struct CycleB;
    impl Subsystem for CycleB {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            ctx.require::<CycleA>()?;
            Ok(())
        }
    }

    /// A -> B -> A fails with an error naming the cycle.
    #[test]
    fn cycle_is_reported() {
        let mut registry = SystemRegistry::new();
        registry.register_with(|_| CycleA).unwrap();
        registry.register_with(|_| CycleB).unwrap();
        let mut systems = SystemCollection::new(&registry, EngineCreateInfo::default());
        match systems.build_all() {
            Err(SystemError::Cycle(path)) => {
                assert_eq!(path, ["CycleA", "CycleB", "CycleA"]);
            }
            other => panic!("expected a cycle error, got {:?}", other.err()),
        }
    }

    struct NeedsMissing;
    impl Subsystem for NeedsMissing {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            ctx.require::<CycleA>()?;
            Ok(())
        }
    }

    #[test]
    fn missing_creator_is_an_error() {
        let mut registry = SystemRegistry::new();
        registry.register_with(|_| NeedsMissing).unwrap();
        let mut systems = SystemCollection::new(&registry, EngineCreateInfo::default());
        assert!(matches!(
            systems.build_all(),
            Err(SystemError::MissingCreator("CycleA"))
        ));
    }

    struct Broken;
    impl Subsystem for Broken {
        fn build(&mut self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            Err(BuildError::Disabled("not supported here".into()))
        }
    }

    struct NeedsBroken;
    impl Subsystem for NeedsBroken {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            ctx.require::<Broken>()?;
            Ok(())
        }
    }

    struct MaybeBroken(bool);
    impl Subsystem for MaybeBroken {
        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            self.0 = ctx.find::<Broken>()?.is_some();
            Ok(())
        }
    }

    /// Requiring an invalid system invalidates the requirer; finding one does not.
    #[test]
    fn invalid_systems_cascade() {
        let mut registry = SystemRegistry::new();
        registry.register_with(|_| NeedsBroken).unwrap();
        registry.register_with(|_| Broken).unwrap();
        registry.register_with(|_| MaybeBroken(true)).unwrap();
        let mut systems = SystemCollection::new(&registry, EngineCreateInfo::default());
        systems.build_all().unwrap();

        assert!(systems.find::<Broken>().is_none());
        assert!(systems.find::<NeedsBroken>().is_none());
        let maybe = systems.find::<MaybeBroken>().unwrap();
        assert!(!systems.get(maybe).unwrap().0);
        assert_eq!(systems.valid_systems().count(), 1);

        let listing = systems.to_string();
        assert!(listing.contains("* MaybeBroken"));
        assert!(listing.contains("- Broken: not supported here"));
    }

    /// A leased system can't be reached through the collection until it's returned.
    #[test]
    fn leasing() {
        let (a, b, c) = (counter(), counter(), counter());
        let registry = diamond_registry(&a, &b, &c);
        let mut systems = SystemCollection::new(&registry, EngineCreateInfo::default());
        systems.build_all().unwrap();
        let c_slot = systems.find::<C>().unwrap();
        let b_slot = systems.find::<B>().unwrap();

        let inner = systems
            .with_system(c_slot, |_c, systems| {
                let leased = matches!(systems.get(c_slot), Err(SystemError::Leased("C")));
                let other_ok = systems.get(b_slot).is_ok();
                (leased, other_ok)
            })
            .unwrap();
        assert_eq!(inner, (true, true));
        assert!(systems.get(c_slot).is_ok());
    }

    #[test]
    fn duplicate_instance_rejected() {
        let registry = SystemRegistry::new();
        let mut systems = SystemCollection::new(&registry, EngineCreateInfo::default());
        systems.insert(C(counter())).unwrap();
        assert!(matches!(
            systems.insert(C(counter())),
            Err(SystemError::DuplicateInstance("C"))
        ));
        systems.build_all().unwrap();
        assert!(systems.find::<C>().is_some());
    }
}
