//! GPU ray-traced scene rendering.
//!
//! Registered geometry is built into bottom- and top-level acceleration
//! structures, exposed to a fixed ray-tracing pipeline through per-frame
//! binding sets, and rendered by a double-buffered frame loop that survives
//! presentation-target invalidation.
//!
//! Every component talks to the GPU through [`device::RtDevice`].
//! [`vulkan::VulkanDevice`] is the real backend; [`mock::MockDevice`] runs the
//! same code headlessly.

pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod handle;
pub mod mock;
pub mod raytracing;
pub mod renderer;
pub mod resources;
pub mod vulkan;

pub use config::{RtConfig, FRAMES_IN_FLIGHT};
pub use device::RtDevice;
pub use error::{RendererError, RendererResult, RtError, RtResult};
pub use frame::{FrameOrchestrator, FrameStatus, FrameUniforms};
pub use renderer::{RayTracer, Renderer, Scene, SceneGeometry, SceneObject, TextureData};
pub use resources::{BufferId, ImageId, ResourceManager};
