//! Vulkan backend for [`RtDevice`](crate::device::RtDevice).
//!
//! Instance and device creation, surface and swapchain handling, gpu-allocator
//! backed memory, and command submission over ash with the KHR ray tracing
//! extensions.

pub mod commands;
pub mod context;
pub mod device;
pub mod memory;
pub mod surface;
pub mod swapchain;

pub use commands::CommandManager;
pub use context::VulkanContext;
pub use device::VulkanDevice;
pub use memory::{Buffer, Image, MemoryManager};
pub use surface::VulkanSurface;
pub use swapchain::Swapchain;

use ash::vk;
use std::ffi::CStr;

use crate::error::{vk_error, RtError};

/// Buffer device address and the ray tracing extensions need Vulkan 1.2.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"voxtrace";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"voxtrace";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

/// Map a failed creation call to `ResourceCreation`.
pub(crate) fn resource_err(what: &'static str) -> impl FnOnce(vk::Result) -> RtError {
    move |e| vk_error(e, |e| RtError::resource(what, format!("{:?}", e)))
}

/// Map a failed query to `Query`.
pub(crate) fn query_err(what: &'static str) -> impl FnOnce(vk::Result) -> RtError {
    move |e| vk_error(e, |e| RtError::query(what, format!("{:?}", e)))
}

/// Map a failed queue submission or wait to `Submit`.
pub(crate) fn submit_err(what: &'static str) -> impl Fn(vk::Result) -> RtError + Copy {
    move |e| vk_error(e, |e| RtError::submit(what, format!("{:?}", e)))
}
