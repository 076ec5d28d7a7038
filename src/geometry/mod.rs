//! Global geometry shared by every body in the simulation.

mod vertex_manager;
pub use vertex_manager::{
    GlobalVertexManager, VertexAttributeInfo, VertexCountInfo, VertexDisplacementInfo,
    VertexReporter,
};

mod half_plane;
pub use half_plane::HalfPlaneSystem;
