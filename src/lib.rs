//! A physically based simulation backend driven by pluggable subsystems.
//!
//! Subsystems are registered with a [`SystemRegistry`][system::SystemRegistry]
//! before an engine is created. The engine builds them on demand, resolving the
//! dependencies each one declares during its build, and then drives every frame
//! through a fixed sequence of [`Stage`][util::statemachine::Stage]s.
//! Subsystems cooperate through a handful of global managers
//! that aggregate their contributions into shared buffers:
//!
//! - [`GlobalVertexManager`][geometry::GlobalVertexManager] lays out every body's vertices
//!   in one contiguous buffer,
//! - [`GlobalCollisionFilter`][collision::GlobalCollisionFilter] turns that buffer into
//!   candidate contact pairs and time-of-impact bounds,
//! - [`GlobalContactManager`][contact::GlobalContactManager] collects contact
//!   gradients and Hessians and hands them to the systems that own the vertices,
//! - [`GlobalLinearSystem`][linear::GlobalLinearSystem] assembles and solves the
//!   global Newton system.

// profiling spans, compiled to nothing unless the `tracy` feature is enabled
macro_rules! tracy_span {
    ($name:expr, $fn_name:expr) => {
        tracy_client::Client::running()
            .map(|client| client.span_alloc(Some($name), $fn_name, file!(), line!(), 0))
    };
}

pub mod math;
pub use math::{uv, Aabb, Mat3, Vec3};

pub mod util;
pub use util::{
    buffer::{CandidateBuffer, ReservedBuffer},
    offset_count::OffsetCountCollection,
    statemachine::{Stage, StageMachine},
};

pub mod config;
pub use config::EngineConfig;

pub mod status;
pub use status::{EngineStatus, EngineStatusCollection, StatusKind};

pub mod system;
pub use system::{
    BuildContext, BuildError, Capability, CreateSystem, Subsystem, SystemCollection, SystemError,
    SystemId, SystemRegistry, SystemSlot,
};

pub mod scene;
pub use scene::{HalfPlane, ParticleBody, Scene, SceneVisitor};

pub mod geometry;
pub use geometry::{GlobalVertexManager, HalfPlaneSystem, VertexReporter};

pub mod collision;
pub use collision::{CcdFilter, DcdFilter, GlobalCollisionFilter};

pub mod contact;
pub use contact::{ContactReceiver, ContactReporter, GlobalContactManager};

pub mod linear;
pub use linear::{
    AssemblyError, DiagLinearSubsystem, GlobalLinearSystem, GlobalPreconditioner,
    LocalPreconditioner, OffDiagLinearSubsystem,
};

pub mod dynamics;
pub use dynamics::{DofPredictor, GradientHessianComputer, LineSearcher, ParticleSystem};

pub mod sanity;
pub use sanity::{SanityCheck, SanityCheckResult, SanityCheckerCollection};

pub mod engine;
pub use engine::{create_engine, destroy_engine, Engine, EngineCreateInfo, EngineError, SimEngine};

pub mod world;
pub use world::World;

pub mod builtin;
pub use builtin::register_builtin_systems;
