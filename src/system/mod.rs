//! Subsystems, their registry, and the collection that builds them on demand.
//!
//! A subsystem is any `'static` type implementing [`Subsystem`].
//! Creators for subsystem types are registered with a [`SystemRegistry`]
//! before any engine exists. An engine owns a [`SystemCollection`],
//! which instantiates each type the first time something asks for it and
//! builds it once all the dependencies it declares are built.
//!
//! Systems refer to each other through [`SystemSlot`]s (typed ids into the
//! collection's arena) and [`Capability`] handles (ids plus a downcast to one of
//! the role traits a system implements, such as a vertex reporter).

use std::{any::Any, fmt, marker::PhantomData};
use thunderdome as td;

use crate::scene::Scene;

mod registry;
pub use registry::{CreateSystem, SystemRegistry};

mod collection;
pub use collection::SystemCollection;

mod build;
pub use build::BuildContext;

//
// Errors
//

/// Fatal errors in registering, building or accessing subsystems.
#[derive(thiserror::Error, Debug)]
pub enum SystemError {
    #[error("No creator registered for system {0}")]
    MissingCreator(&'static str),
    #[error("Cyclic dependency: {}", .0.join(" -> "))]
    Cycle(Vec<&'static str>),
    #[error("A creator for {0} is already registered")]
    DuplicateCreator(&'static str),
    #[error("Systems can't be registered after an engine has been created from the registry")]
    RegistrySealed,
    #[error("An instance of {0} already exists")]
    DuplicateInstance(&'static str),
    #[error("System {0} is already in use")]
    Leased(&'static str),
    #[error("System {0} is invalid")]
    Invalid(&'static str),
    #[error("System {found} accessed as {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("System {id} is already registered with {manager}")]
    DoubleRegistration { manager: &'static str, id: SystemId },
    #[error("System {0} does not exist")]
    UnknownSystem(SystemId),
    #[error("Dependency {0} used before it was resolved")]
    Unresolved(&'static str),
    #[error(transparent)]
    Assembly(#[from] crate::linear::AssemblyError),
}

/// Ways a [`Subsystem::build`] can end without succeeding.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// The system needs another one that hasn't been built yet.
    /// The collection builds that one and then calls `build` again.
    #[error("Waiting for system {0} to be built")]
    Pending(SystemId),
    /// The system can't work in this configuration and is marked invalid.
    /// Systems that require it become invalid as well.
    #[error("System disabled: {0}")]
    Disabled(String),
    #[error(transparent)]
    Fatal(#[from] SystemError),
}

//
// Subsystem traits
//

/// Helper trait for downcasting trait objects to concrete subsystem types.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
    #[inline]
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A pluggable unit of simulation logic.
pub trait Subsystem: AsAny {
    /// Declare dependencies and register with managers.
    ///
    /// May be called again after returning [`BuildError::Pending`],
    /// so everything done here must be repeatable.
    /// Effects on other systems go through [`BuildContext::on_built`],
    /// which only runs once the build succeeds.
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError>;

    /// Read the initial scene. Only called on engine-aware systems.
    fn init_scene(
        &mut self,
        _scene: &mut Scene,
        _systems: &mut SystemCollection,
    ) -> Result<(), SystemError> {
        Ok(())
    }

    /// Re-read the scene after objects were created or destroyed.
    fn rebuild_scene(
        &mut self,
        scene: &mut Scene,
        systems: &mut SystemCollection,
    ) -> Result<(), SystemError> {
        self.init_scene(scene, systems)
    }

    /// Write simulation state back into the scene.
    fn write_scene(&mut self, _scene: &mut Scene, _systems: &SystemCollection) {}
}

//
// Handles
//

/// Stable identifier of a subsystem instance within one collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SystemId(pub(crate) td::Index);

impl SystemId {
    /// The small integer slot this system occupies in the collection.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.0.slot()
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.slot())
    }
}

/// A [`SystemId`] that remembers the concrete type of the system.
pub struct SystemSlot<T> {
    id: SystemId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SystemSlot<T> {
    #[inline]
    pub(crate) fn new(id: SystemId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn id(&self) -> SystemId {
        self.id
    }
}

impl<T> Clone for SystemSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SystemSlot<T> {}

impl<T> PartialEq for SystemSlot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for SystemSlot<T> {}

impl<T> fmt::Debug for SystemSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemSlot<{}>({})", short_name(std::any::type_name::<T>()), self.id)
    }
}

/// Handle to one role (a trait object type `C`) of a subsystem.
///
/// Created with `Capability::<dyn Role>::of(slot)` for role traits
/// declared with the `capability_trait!` macro.
pub struct Capability<C: ?Sized> {
    id: SystemId,
    cast: fn(&mut dyn Subsystem) -> Option<&mut C>,
}

impl<C: ?Sized> Capability<C> {
    #[doc(hidden)]
    #[inline]
    pub fn from_raw(id: SystemId, cast: fn(&mut dyn Subsystem) -> Option<&mut C>) -> Self {
        Self { id, cast }
    }

    #[inline]
    pub fn id(&self) -> SystemId {
        self.id
    }

    #[inline]
    pub(crate) fn cast<'a>(&self, system: &'a mut dyn Subsystem) -> Option<&'a mut C> {
        (self.cast)(system)
    }
}

impl<C: ?Sized> Clone for Capability<C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C: ?Sized> Copy for Capability<C> {}

impl<C: ?Sized> fmt::Debug for Capability<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability<{}>({})", short_name(std::any::type_name::<C>()), self.id)
    }
}

/// Declare a role trait that subsystems can be referred to by,
/// generating `Capability::<dyn Trait>::of`.
macro_rules! capability_trait {
    ($trait:ident) => {
        impl $crate::system::Capability<dyn $trait> {
            /// Handle to the given system's implementation of this role.
            pub fn of<T: $trait + $crate::system::Subsystem>(
                slot: $crate::system::SystemSlot<T>,
            ) -> Self {
                fn cast<T: $trait + $crate::system::Subsystem>(
                    system: &mut dyn $crate::system::Subsystem,
                ) -> Option<&mut (dyn $trait + 'static)> {
                    system
                        .as_any_mut()
                        .downcast_mut::<T>()
                        .map(|t| t as &mut (dyn $trait + 'static))
                }
                Self::from_raw(slot.id(), cast::<T>)
            }
        }
    };
}
pub(crate) use capability_trait;

/// An ordered list of capability handles registered with a manager.
///
/// The position of a handle in the list is its stable registration index.
#[derive(Debug)]
pub struct CapabilitySet<C: ?Sized> {
    manager: &'static str,
    handles: Vec<Capability<C>>,
}

impl<C: ?Sized> CapabilitySet<C> {
    pub fn new(manager: &'static str) -> Self {
        Self {
            manager,
            handles: Vec::new(),
        }
    }

    /// Register a handle, returning its index.
    /// A system can only be registered once per set.
    pub fn insert(&mut self, handle: Capability<C>) -> Result<usize, SystemError> {
        if self.handles.iter().any(|h| h.id == handle.id) {
            return Err(SystemError::DoubleRegistration {
                manager: self.manager,
                id: handle.id,
            });
        }
        self.handles.push(handle);
        Ok(self.handles.len() - 1)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<Capability<C>> {
        self.handles.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability<C>> + '_ {
        self.handles.iter().copied()
    }

    /// Handles in registration order, copied out so the set can be
    /// borrowed elsewhere while iterating.
    pub fn to_vec(&self) -> Vec<Capability<C>> {
        self.handles.clone()
    }
}

/// Unwrap a slot that a system fills in during its build.
pub fn resolved<T>(slot: Option<SystemSlot<T>>) -> Result<SystemSlot<T>, SystemError> {
    slot.ok_or_else(|| SystemError::Unresolved(short_name(std::any::type_name::<T>())))
}

/// The last path segment of a type name.
pub(crate) fn short_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
