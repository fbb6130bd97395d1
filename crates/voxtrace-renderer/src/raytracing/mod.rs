//! Ray tracing over the KHR acceleration-structure and pipeline extensions.
//!
//! Geometry registration, the two acceleration-structure levels, the
//! per-frame binding sets, and the pipeline with its shader binding table.

pub mod binding;
pub mod blas;
pub mod geometry;
pub mod pipeline;
pub mod sbt;
pub mod tlas;

pub use binding::{MaterialTexture, ResourceBindings};
pub use blas::{BlasEntry, BottomLevelBuilder, BuildReport};
pub use geometry::{GeometryDescriptor, GeometryRegistry, ProceduralVolume, TriangleMesh};
pub use pipeline::{RtPipeline, ShaderGroup, ShaderLibrary, SHADER_GROUPS};
pub use sbt::{SbtLayout, ShaderBindingTable};
pub use tlas::{InstanceRecord, TopLevelBuilder};
