//! GPU memory management using gpu-allocator.
//!
//! Buffers and images are tracked by their Vulkan handle so callers only ever
//! hold the handle; the allocation stays here until the resource is destroyed.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

use super::{resource_err, VulkanContext};
use crate::device::{BufferDesc, ImageDesc, RawBuffer, RawImage};
use crate::error::{RtError, RtResult};

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// Host pointer, for buffers created in CPU-visible memory.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr() as *mut u8)
    }

    fn raw(&self) -> RawBuffer {
        RawBuffer {
            handle: self.handle,
            size: self.size,
            device_address: self.device_address,
            mapped: self.mapped_ptr().is_some(),
        }
    }
}

/// GPU image with associated memory.
pub struct Image {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Mutex<Option<Allocator>>,
    buffers: Mutex<HashMap<vk::Buffer, Buffer>>,
    images: Mutex<HashMap<vk::Image, Image>>,
    device: ash::Device,
}

impl MemoryManager {
    pub unsafe fn new(ctx: &VulkanContext) -> RtResult<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RtError::resource("allocator", e))?;

        Ok(Self {
            allocator: Mutex::new(Some(allocator)),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            device: ctx.device.clone(),
        })
    }

    fn allocate(&self, desc: &AllocationCreateDesc) -> RtResult<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| RtError::resource(desc.name, "allocator already destroyed"))?;
        allocator.allocate(desc).map_err(|e| RtError::resource(desc.name, e))
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                warn!(error = %e, "failed to free allocation");
            }
        }
    }

    /// Create a buffer with the specified usage and memory location.
    pub unsafe fn create_buffer(&self, desc: &BufferDesc) -> RtResult<RawBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(resource_err("buffer"))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = match self.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e);
            }
        };

        if let Err(e) = self
            .device
            .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_buffer(handle, None);
            self.free(allocation);
            return Err(resource_err("buffer")(e));
        }

        let device_address = if desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        let buffer = Buffer {
            handle,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            device_address,
        };
        let raw = buffer.raw();
        self.buffers.lock().insert(handle, buffer);
        Ok(raw)
    }

    /// Copy `data` into a mapped buffer at `offset`.
    pub fn write_buffer(&self, handle: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> RtResult<()> {
        let buffers = self.buffers.lock();
        let buffer = buffers
            .get(&handle)
            .ok_or_else(|| RtError::resource("buffer write", "unknown buffer"))?;

        let end = offset.checked_add(data.len() as vk::DeviceSize);
        if end.map_or(true, |end| end > buffer.size) {
            return Err(RtError::resource(
                "buffer write",
                format!("{} bytes at offset {} exceed buffer size {}", data.len(), offset, buffer.size),
            ));
        }

        let ptr = buffer
            .mapped_ptr()
            .ok_or_else(|| RtError::resource("buffer write", "buffer is not host visible"))?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Create an image with a view covering the whole resource.
    pub unsafe fn create_image(&self, desc: &ImageDesc) -> RtResult<RawImage> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = self
            .device
            .create_image(&image_info, None)
            .map_err(resource_err("image"))?;

        let requirements = self.device.get_image_memory_requirements(handle);

        let allocation = match self.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(e);
            }
        };

        if let Err(e) = self
            .device
            .bind_image_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_image(handle, None);
            self.free(allocation);
            return Err(resource_err("image")(e));
        }

        let view_type = match desc.image_type {
            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ => vk::ImageViewType::TYPE_2D,
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match self.device.create_image_view(&view_info, None) {
            Ok(view) => view,
            Err(e) => {
                self.device.destroy_image(handle, None);
                self.free(allocation);
                return Err(resource_err("image view")(e));
            }
        };

        self.images.lock().insert(
            handle,
            Image {
                handle,
                view,
                allocation: Some(allocation),
                format: desc.format,
                extent: desc.extent,
            },
        );

        Ok(RawImage { handle, view })
    }

    pub unsafe fn destroy_buffer(&self, handle: vk::Buffer) {
        let Some(buffer) = self.buffers.lock().remove(&handle) else {
            warn!(?handle, "destroying unknown buffer");
            return;
        };
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            self.free(allocation);
        }
    }

    pub unsafe fn destroy_image(&self, handle: vk::Image) {
        let Some(image) = self.images.lock().remove(&handle) else {
            warn!(?handle, "destroying unknown image");
            return;
        };
        self.device.destroy_image_view(image.view, None);
        self.device.destroy_image(image.handle, None);
        if let Some(allocation) = image.allocation {
            self.free(allocation);
        }
    }

    /// Release anything still tracked, then the allocator itself.
    ///
    /// Must run before the logical device is destroyed.
    pub unsafe fn destroy(&self) {
        let buffers: Vec<vk::Buffer> = self.buffers.lock().keys().copied().collect();
        let images: Vec<vk::Image> = self.images.lock().keys().copied().collect();
        if !buffers.is_empty() || !images.is_empty() {
            warn!(buffers = buffers.len(), images = images.len(), "releasing leaked GPU resources");
        }
        for buffer in buffers {
            self.destroy_buffer(buffer);
        }
        for image in images {
            self.destroy_image(image);
        }
        self.allocator.lock().take();
    }
}
