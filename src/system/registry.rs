use std::{any::TypeId, cell::Cell, rc::Rc};

use super::{short_name, Subsystem, SystemError};
use crate::engine::EngineCreateInfo;

/// Subsystems that know how to create themselves from the engine's create info.
pub trait CreateSystem: Subsystem + Sized {
    fn create(info: &EngineCreateInfo) -> Self;
}

pub(crate) type CreatorFn = Rc<dyn Fn(&EngineCreateInfo) -> Box<dyn Subsystem>>;

#[derive(Clone)]
pub(crate) struct Creator {
    pub name: &'static str,
    pub type_id: TypeId,
    pub create: CreatorFn,
}

/// The list of subsystem types an engine can instantiate.
///
/// Build one of these at startup, register every subsystem type with it,
/// and pass it to [`create_engine`][crate::engine::create_engine].
/// Once an engine has been created from a registry,
/// the registry is sealed and further registrations fail.
#[derive(Default)]
pub struct SystemRegistry {
    creators: Vec<Creator>,
    sealed: Cell<bool>,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type that implements [`CreateSystem`].
    pub fn register<T: CreateSystem>(&mut self) -> Result<&mut Self, SystemError> {
        self.register_with(T::create)
    }

    /// Register a type that is created with its `Default` implementation.
    pub fn register_default<T: Subsystem + Default>(&mut self) -> Result<&mut Self, SystemError> {
        self.register_with(|_| T::default())
    }

    /// Register a type with a custom creator function.
    pub fn register_with<T: Subsystem>(
        &mut self,
        create: impl Fn(&EngineCreateInfo) -> T + 'static,
    ) -> Result<&mut Self, SystemError> {
        let name = std::any::type_name::<T>();
        if self.sealed.get() {
            return Err(SystemError::RegistrySealed);
        }
        let type_id = TypeId::of::<T>();
        if self.creators.iter().any(|c| c.type_id == type_id) {
            return Err(SystemError::DuplicateCreator(short_name(name)));
        }
        self.creators.push(Creator {
            name,
            type_id,
            create: Rc::new(move |info| Box::new(create(info))),
        });
        Ok(self)
    }

    pub fn contains<T: Subsystem>(&self) -> bool {
        let type_id = TypeId::of::<T>();
        self.creators.iter().any(|c| c.type_id == type_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.creators.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.creators.is_empty()
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed.get()
    }

    pub(crate) fn seal(&self) {
        self.sealed.set(true);
    }

    pub(crate) fn creators(&self) -> &[Creator] {
        &self.creators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{BuildContext, BuildError};

    #[derive(Default)]
    struct Dummy;
    impl Subsystem for Dummy {
        fn build(&mut self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Other;
    impl Subsystem for Other {
        fn build(&mut self, _ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_creator_rejected() {
        let mut registry = SystemRegistry::new();
        registry.register_default::<Dummy>().unwrap();
        assert!(matches!(
            registry.register_default::<Dummy>(),
            Err(SystemError::DuplicateCreator("Dummy"))
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains::<Dummy>());
        assert!(!registry.contains::<Other>());
    }

    /// Registration closes once an engine has seen the registry.
    #[test]
    fn sealed_registry_rejects() {
        let mut registry = SystemRegistry::new();
        registry.register_default::<Dummy>().unwrap();
        registry.seal();
        assert!(matches!(
            registry.register_default::<Other>(),
            Err(SystemError::RegistrySealed)
        ));
    }
}
