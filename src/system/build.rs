use std::any::TypeId;

use super::{short_name, BuildError, Subsystem, SystemCollection, SystemError, SystemId, SystemSlot};
use crate::{config::EngineConfig, engine::EngineCreateInfo};

pub(super) type Commit = Box<dyn FnOnce(&mut SystemCollection) -> Result<(), SystemError>>;

/// What a subsystem sees of the collection while it's being built.
pub struct BuildContext<'a> {
    pub(super) systems: &'a mut SystemCollection,
    pub(super) current: SystemId,
    pub(super) dependencies: Vec<SystemId>,
    pub(super) commits: Vec<Commit>,
    pub(super) engine_aware: bool,
}

impl<'a> BuildContext<'a> {
    pub(super) fn new(systems: &'a mut SystemCollection, current: SystemId) -> Self {
        Self {
            systems,
            current,
            dependencies: Vec::new(),
            commits: Vec::new(),
            engine_aware: false,
        }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.systems.create_info().config
    }

    #[inline]
    pub fn create_info(&self) -> &EngineCreateInfo {
        self.systems.create_info()
    }

    /// Slot of the system being built.
    ///
    /// `T` must be the type of the system calling this.
    #[inline]
    pub fn this<T: Subsystem>(&self) -> SystemSlot<T> {
        SystemSlot::new(self.current)
    }

    /// Depend on a system, failing if it doesn't exist.
    ///
    /// If the dependency turned out invalid, this system becomes invalid too.
    pub fn require<T: Subsystem>(&mut self) -> Result<SystemSlot<T>, BuildError> {
        let name = std::any::type_name::<T>();
        let id = self.systems.instantiate(TypeId::of::<T>(), name)?;
        match self.depend_on(id)? {
            Some(id) => Ok(SystemSlot::new(id)),
            None => Err(BuildError::Disabled(format!(
                "required system {} is invalid",
                short_name(name)
            ))),
        }
    }

    /// Depend on a system if it exists and is valid.
    pub fn find<T: Subsystem>(&mut self) -> Result<Option<SystemSlot<T>>, BuildError> {
        let type_id = TypeId::of::<T>();
        if !self.systems.can_instantiate(type_id) {
            return Ok(None);
        }
        let id = self
            .systems
            .instantiate(type_id, std::any::type_name::<T>())?;
        Ok(self.depend_on(id)?.map(SystemSlot::new))
    }

    fn depend_on(&mut self, id: SystemId) -> Result<Option<SystemId>, BuildError> {
        if !self.systems.is_built(id) {
            return Err(BuildError::Pending(id));
        }
        if !self.systems.is_valid(id) {
            return Ok(None);
        }
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        Ok(Some(id))
    }

    /// Let the engine drive this system's scene hooks.
    #[inline]
    pub fn mark_engine_aware(&mut self) {
        self.engine_aware = true;
    }

    /// Run something on the collection once this build has succeeded,
    /// typically registering with a manager.
    pub fn on_built(
        &mut self,
        commit: impl FnOnce(&mut SystemCollection) -> Result<(), SystemError> + 'static,
    ) {
        self.commits.push(Box::new(commit));
    }
}
