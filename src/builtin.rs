//! Registration of the subsystems that ship with the crate.

use crate::{
    collision::{GlobalCollisionFilter, VertexHalfPlaneFilter, VertexVertexFilter},
    contact::{GlobalContactManager, VertexHalfPlanePenalty, VertexVertexPenalty},
    dynamics::{
        DofPredictor, GradientHessianComputer, LineSearcher, ParticleJacobiPreconditioner,
        ParticleSystem,
    },
    geometry::{GlobalVertexManager, HalfPlaneSystem},
    linear::GlobalLinearSystem,
    system::{SystemError, SystemRegistry},
};

/// Register every built-in subsystem.
///
/// Contact and collision systems disable themselves when contact is turned off
/// in the config, so the same registry works either way.
pub fn register_builtin_systems(registry: &mut SystemRegistry) -> Result<(), SystemError> {
    registry
        // managers
        .register::<GlobalVertexManager>()?
        .register::<GlobalContactManager>()?
        .register_default::<GlobalCollisionFilter>()?
        .register::<GlobalLinearSystem>()?
        .register::<DofPredictor>()?
        .register::<GradientHessianComputer>()?
        .register::<LineSearcher>()?
        // geometry and contact
        .register_default::<HalfPlaneSystem>()?
        .register_default::<VertexHalfPlaneFilter>()?
        .register_default::<VertexVertexFilter>()?
        .register_default::<VertexHalfPlanePenalty>()?
        .register_default::<VertexVertexPenalty>()?
        // bodies
        .register_default::<ParticleSystem>()?
        .register_default::<ParticleJacobiPreconditioner>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::EngineConfig, engine::EngineCreateInfo, system::SystemCollection};

    fn build(config: EngineConfig) -> SystemCollection {
        let mut registry = SystemRegistry::new();
        register_builtin_systems(&mut registry).unwrap();
        let mut systems = SystemCollection::new(
            &registry,
            EngineCreateInfo {
                config,
                ..Default::default()
            },
        );
        systems.build_all().unwrap();
        systems
    }

    #[test]
    fn registering_twice_fails() {
        let mut registry = SystemRegistry::new();
        register_builtin_systems(&mut registry).unwrap();
        assert_eq!(registry.len(), 14);
        assert!(matches!(
            register_builtin_systems(&mut registry),
            Err(SystemError::DuplicateCreator("GlobalVertexManager"))
        ));
    }

    /// Every built-in system is valid with the default config.
    #[test]
    fn all_valid_by_default() {
        let systems = build(EngineConfig::default());
        assert_eq!(systems.valid_systems().count(), 14);
        let contact = systems.find::<GlobalContactManager>().unwrap();
        assert_eq!(systems.get(contact).unwrap().reporter_count(), 2);
        assert_eq!(systems.get(contact).unwrap().receiver_count(), 1);
        let filter = systems.find::<GlobalCollisionFilter>().unwrap();
        assert_eq!(systems.get(filter).unwrap().dcd_filter_count(), 2);
        assert_eq!(systems.get(filter).unwrap().ccd_filter_count(), 2);
    }

    /// Turning contact off takes the whole contact pipeline with it
    /// but leaves the dynamics intact.
    #[test]
    fn contact_disabled() {
        let mut config = EngineConfig::default();
        config.contact.enable = false;
        let systems = build(config);
        assert!(systems.find::<GlobalContactManager>().is_none());
        assert!(systems.find::<GlobalCollisionFilter>().is_none());
        assert!(systems.find::<VertexVertexFilter>().is_none());
        assert!(systems.find::<VertexHalfPlanePenalty>().is_none());
        assert!(systems.find::<ParticleSystem>().is_some());
        assert!(systems.find::<HalfPlaneSystem>().is_some());
        assert!(systems.find::<GlobalLinearSystem>().is_some());
    }
}
