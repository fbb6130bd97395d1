//! Swapchain: the presentation target traced frames are copied into.

use ash::vk;
use tracing::debug;

use super::{query_err, resource_err, VulkanContext, VulkanSurface};
use crate::device::{Acquire, Present, PresentTarget};
use crate::error::{vk_error, RtError, RtResult};

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain sized to the surface, falling back to `desired`.
    ///
    /// `old_swapchain` is retired into the new one and destroyed.
    pub unsafe fn new(
        ctx: &VulkanContext,
        surface: &VulkanSurface,
        desired: vk::Extent2D,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> RtResult<Self> {
        let extent = surface.get_extent(desired);

        let min_images = surface.capabilities.min_image_count;
        let max_images = if surface.capabilities.max_image_count == 0 {
            u32::MAX
        } else {
            surface.capabilities.max_image_count
        };
        let image_count = (min_images + 1).min(max_images);

        // Frames reach the swapchain by transfer only.
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(surface.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let handle = ctx
            .swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(resource_err("swapchain"))?;

        if let Some(old) = old_swapchain {
            ctx.swapchain_loader.destroy_swapchain(old, None);
        }

        let images = ctx
            .swapchain_loader
            .get_swapchain_images(handle)
            .map_err(query_err("swapchain images"))?;

        debug!(
            width = extent.width,
            height = extent.height,
            images = images.len(),
            format = ?surface.format.format,
            "swapchain created"
        );

        Ok(Self {
            handle,
            images,
            format: surface.format.format,
            extent,
        })
    }

    pub fn target(&self) -> PresentTarget {
        PresentTarget {
            images: self.images.clone(),
            format: self.format,
            extent: self.extent,
        }
    }

    pub unsafe fn acquire_next_image(&self, ctx: &VulkanContext, signal: vk::Semaphore) -> RtResult<Acquire> {
        let result = ctx
            .swapchain_loader
            .acquire_next_image(self.handle, u64::MAX, signal, vk::Fence::null());

        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::Stale),
            Err(e) => Err(vk_error(e, |e| RtError::query("swapchain image", format!("{:?}", e)))),
        }
    }

    pub unsafe fn present(&self, ctx: &VulkanContext, image_index: u32, wait: vk::Semaphore) -> RtResult<Present> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match ctx.swapchain_loader.queue_present(ctx.queue, &present_info) {
            Ok(false) => Ok(Present::Done),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::Stale),
            Err(e) => Err(vk_error(e, |e| RtError::resource("present", format!("{:?}", e)))),
        }
    }

    /// Replace the swapchain after the surface changed.
    pub unsafe fn recreate(
        &mut self,
        ctx: &VulkanContext,
        surface: &mut VulkanSurface,
        desired: vk::Extent2D,
    ) -> RtResult<()> {
        ctx.wait_idle();
        surface.refresh_capabilities(ctx)?;

        let new = Self::new(ctx, surface, desired, Some(self.handle))?;
        *self = new;

        Ok(())
    }

    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        ctx.swapchain_loader.destroy_swapchain(self.handle, None);
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}
