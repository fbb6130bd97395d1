//! Device resource manager.
//!
//! Owns the device and every buffer and image the subsystem creates. Callers
//! hold generational ids; the manager resolves them to raw handles and
//! rejects ids whose resource has been released.

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::{debug, warn};

use crate::device::{Barrier, BufferDesc, ImageDesc, RawBuffer, RtDevice};
use crate::error::{RtError, RtResult};
use crate::handle::{Handle, HandleTable};

/// A buffer owned by the resource manager.
#[derive(Debug, Clone, Copy)]
pub struct DeviceBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    pub device_address: Option<vk::DeviceAddress>,
    pub mapped: bool,
}

impl DeviceBuffer {
    /// GPU virtual address, required for structure build inputs.
    pub fn address(&self) -> RtResult<vk::DeviceAddress> {
        self.device_address
            .ok_or_else(|| RtError::resource("buffer address", "buffer was created without SHADER_DEVICE_ADDRESS"))
    }
}

impl From<RawBuffer> for DeviceBuffer {
    fn from(raw: RawBuffer) -> Self {
        Self {
            handle: raw.handle,
            size: raw.size,
            device_address: raw.device_address,
            mapped: raw.mapped,
        }
    }
}

/// An image owned by the resource manager, with its full view.
#[derive(Debug, Clone, Copy)]
pub struct DeviceImage {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

pub type BufferId = Handle<DeviceBuffer>;
pub type ImageId = Handle<DeviceImage>;

pub struct ResourceManager<D: RtDevice> {
    device: D,
    buffers: HandleTable<DeviceBuffer>,
    images: HandleTable<DeviceImage>,
}

impl<D: RtDevice> ResourceManager<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            buffers: HandleTable::new("buffer"),
            images: HandleTable::new("image"),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Give the device back. Resources still live are leaked.
    pub fn into_device(self) -> D {
        if !self.buffers.is_empty() || !self.images.is_empty() {
            warn!(
                buffers = self.buffers.len(),
                images = self.images.len(),
                "resource manager dropped with live resources"
            );
        }
        self.device
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> RtResult<BufferId> {
        let raw = self.device.create_buffer(desc)?;
        debug!(name = desc.name, size = desc.size, "buffer created");
        Ok(self.buffers.insert(raw.into()))
    }

    /// Create a buffer holding `bytes`.
    ///
    /// Host-visible buffers are written through their mapping; device-local
    /// ones are filled from a staging buffer by a one-shot copy.
    pub fn create_buffer_with_data(&mut self, desc: &BufferDesc, bytes: &[u8]) -> RtResult<BufferId> {
        let size = desc.size.max(bytes.len() as vk::DeviceSize);

        if desc.location != MemoryLocation::GpuOnly {
            let id = self.create_buffer(&BufferDesc { size, ..*desc })?;
            if let Err(e) = self.write_buffer(id, 0, bytes) {
                self.release_buffer_quietly(id);
                return Err(e);
            }
            return Ok(id);
        }

        let id = self.create_buffer(&BufferDesc {
            size,
            usage: desc.usage | vk::BufferUsageFlags::TRANSFER_DST,
            ..*desc
        })?;
        let dst = self.buffers.get(id)?.handle;

        let result = self.with_staging(desc.name, bytes, |device, staging| {
            one_shot(device, |device, cmd| {
                device.cmd_copy_buffer(cmd, staging, dst, bytes.len() as vk::DeviceSize);
                Ok(())
            })
        });

        if let Err(e) = result {
            self.release_buffer_quietly(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Host write into a mapped buffer.
    pub fn write_buffer(&self, id: BufferId, offset: vk::DeviceSize, bytes: &[u8]) -> RtResult<()> {
        let buffer = self.buffers.get(id)?;
        self.device.write_buffer(buffer.handle, offset, bytes)
    }

    pub fn buffer(&self, id: BufferId) -> RtResult<DeviceBuffer> {
        self.buffers.get(id).copied()
    }

    pub fn destroy_buffer(&mut self, id: BufferId) -> RtResult<()> {
        let buffer = self.buffers.remove(id)?;
        self.device.destroy_buffer(buffer.handle);
        Ok(())
    }

    fn release_buffer_quietly(&mut self, id: BufferId) {
        if let Err(e) = self.destroy_buffer(id) {
            warn!(error = %e, "failed to release buffer");
        }
    }

    // ========================================================================
    // Images
    // ========================================================================

    pub fn create_image(&mut self, desc: &ImageDesc) -> RtResult<ImageId> {
        let raw = self.device.create_image(desc)?;
        debug!(
            name = desc.name,
            width = desc.extent.width,
            height = desc.extent.height,
            depth = desc.extent.depth,
            "image created"
        );
        Ok(self.images.insert(DeviceImage {
            handle: raw.handle,
            view: raw.view,
            format: desc.format,
            extent: desc.extent,
        }))
    }

    /// Fill an image from `bytes` and leave it in `final_layout`.
    pub fn upload_image(&self, id: ImageId, bytes: &[u8], final_layout: vk::ImageLayout) -> RtResult<()> {
        let image = *self.images.get(id)?;

        self.with_staging("image upload", bytes, |device, staging| {
            one_shot(device, |device, cmd| {
                device.cmd_barrier(
                    cmd,
                    &Barrier::image_transition(
                        image.handle,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    ),
                );
                device.cmd_copy_buffer_to_image(cmd, staging, image.handle, image.extent);
                device.cmd_barrier(
                    cmd,
                    &Barrier::image_transition(image.handle, vk::ImageLayout::TRANSFER_DST_OPTIMAL, final_layout),
                );
                Ok(())
            })
        })
    }

    pub fn image(&self, id: ImageId) -> RtResult<DeviceImage> {
        self.images.get(id).copied()
    }

    /// False once the image has been destroyed.
    pub fn is_live_image(&self, id: ImageId) -> bool {
        self.images.contains(id)
    }

    pub fn destroy_image(&mut self, id: ImageId) -> RtResult<()> {
        let image = self.images.remove(id)?;
        self.device.destroy_image(crate::device::RawImage {
            handle: image.handle,
            view: image.view,
        });
        Ok(())
    }

    // ========================================================================
    // Samplers and command submission
    // ========================================================================

    pub fn create_sampler(&self) -> RtResult<vk::Sampler> {
        self.device.create_sampler()
    }

    pub fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.device.destroy_sampler(sampler);
    }

    /// Record into a fresh command buffer, submit it and wait for the queue.
    pub fn one_shot<R>(&self, record: impl FnOnce(&D, vk::CommandBuffer) -> RtResult<R>) -> RtResult<R> {
        one_shot(&self.device, record)
    }

    /// Run `f` with a host-visible transfer source holding `bytes`, then free it.
    fn with_staging<R>(&self, name: &str, bytes: &[u8], f: impl FnOnce(&D, vk::Buffer) -> RtResult<R>) -> RtResult<R> {
        let staging = self.device.create_buffer(&BufferDesc {
            name,
            size: (bytes.len() as vk::DeviceSize).max(1),
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
        })?;

        let result = self
            .device
            .write_buffer(staging.handle, 0, bytes)
            .and_then(|()| f(&self.device, staging.handle));

        self.device.destroy_buffer(staging.handle);
        result
    }

    // ========================================================================
    // Accounting and teardown
    // ========================================================================

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    /// Free every resource still live. Outstanding ids become stale.
    pub fn destroy_all(&mut self) {
        let buffers = self.buffers.drain();
        let images = self.images.drain();
        if !buffers.is_empty() || !images.is_empty() {
            debug!(buffers = buffers.len(), images = images.len(), "releasing remaining resources");
        }
        for buffer in buffers {
            self.device.destroy_buffer(buffer.handle);
        }
        for image in images {
            self.device.destroy_image(crate::device::RawImage {
                handle: image.handle,
                view: image.view,
            });
        }
    }
}

/// One-shot submission against a bare device.
pub fn one_shot<D: RtDevice, R>(
    device: &D,
    record: impl FnOnce(&D, vk::CommandBuffer) -> RtResult<R>,
) -> RtResult<R> {
    let cmd = device.begin_one_shot()?;
    match record(device, cmd) {
        Ok(value) => {
            device.submit_one_shot(cmd)?;
            Ok(value)
        }
        Err(e) => {
            device.abandon_one_shot(cmd);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCommand, MockDevice, MockFailure};

    fn storage_desc(name: &str, size: u64, location: MemoryLocation) -> BufferDesc<'_> {
        BufferDesc {
            name,
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location,
        }
    }

    fn image_desc() -> ImageDesc<'static> {
        ImageDesc {
            name: "volume",
            image_type: vk::ImageType::TYPE_3D,
            extent: vk::Extent3D {
                width: 2,
                height: 2,
                depth: 2,
            },
            format: vk::Format::R8_UINT,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    #[test]
    fn test_buffer_address_resolved() {
        let mut res = ResourceManager::new(MockDevice::new());
        let id = res.create_buffer(&storage_desc("a", 64, MemoryLocation::GpuOnly)).unwrap();
        let buffer = res.buffer(id).unwrap();
        assert!(buffer.address().unwrap() > 0);
        assert_eq!(res.live_buffers(), 1);
    }

    #[test]
    fn test_device_local_upload_goes_through_staging() {
        let mut res = ResourceManager::new(MockDevice::new());
        let id = res
            .create_buffer_with_data(&storage_desc("verts", 4, MemoryLocation::GpuOnly), &[9, 8, 7, 6])
            .unwrap();

        let handle = res.buffer(id).unwrap().handle;
        assert_eq!(res.device().buffer_data(handle).unwrap(), vec![9, 8, 7, 6]);
        assert_eq!(res.device().one_shot_submissions(), 1);
        // Staging buffer is gone again.
        assert_eq!(res.device().live_count("buffer"), 1);
    }

    #[test]
    fn test_host_visible_upload_is_written_directly() {
        let mut res = ResourceManager::new(MockDevice::new());
        let id = res
            .create_buffer_with_data(&storage_desc("ubo", 2, MemoryLocation::CpuToGpu), &[1, 2])
            .unwrap();
        let handle = res.buffer(id).unwrap().handle;
        assert_eq!(res.device().buffer_data(handle).unwrap(), vec![1, 2]);
        assert_eq!(res.device().one_shot_submissions(), 0);
    }

    #[test]
    fn test_failed_upload_releases_buffers() {
        let mut res = ResourceManager::new(MockDevice::new());
        res.device().fail_next(MockFailure::OneShotSubmit);
        let err = res
            .create_buffer_with_data(&storage_desc("verts", 4, MemoryLocation::GpuOnly), &[1, 2, 3, 4])
            .unwrap_err();
        assert!(matches!(err, RtError::Submit { .. }), "{err:?}");
        assert_eq!(res.live_buffers(), 0);
        assert!(res.device().live_objects().is_empty());
    }

    #[test]
    fn test_destroyed_buffer_id_is_stale() {
        let mut res = ResourceManager::new(MockDevice::new());
        let id = res.create_buffer(&storage_desc("a", 64, MemoryLocation::CpuToGpu)).unwrap();
        res.destroy_buffer(id).unwrap();
        assert!(matches!(res.write_buffer(id, 0, &[1]), Err(RtError::StaleHandle { kind: "buffer", .. })));
        assert!(res.destroy_buffer(id).is_err());
        assert!(res.device().violations().is_empty());
    }

    // ========================================================================
    // Images
    // ========================================================================

    #[test]
    fn test_upload_image_uses_one_submission_and_frees_staging() {
        let mut res = ResourceManager::new(MockDevice::new());
        let id = res.create_image(&image_desc()).unwrap();
        res.upload_image(id, &[0; 8], vk::ImageLayout::GENERAL).unwrap();

        assert!(res.is_live_image(id));
        assert_eq!(res.image(id).unwrap().extent.depth, 2);
        assert_eq!(res.device().one_shot_submissions(), 1);
        assert_eq!(res.device().live_count("buffer"), 0);
        assert!(res.device().violations().is_empty());
    }

    #[test]
    fn test_failed_recording_abandons_command_buffer() {
        let res = ResourceManager::new(MockDevice::new());
        let result: RtResult<()> = res.one_shot(|device, cmd| {
            device.cmd_barrier(cmd, &Barrier::build_to_read());
            assert!(matches!(device.recorded(cmd)[0], MockCommand::Barrier(_)));
            Err(RtError::Build("recording failed".into()))
        });
        assert!(result.is_err());
        assert_eq!(res.device().one_shot_submissions(), 0);
        assert_eq!(res.device().live_count("one_shot_cmd"), 0);
    }

    #[test]
    fn test_destroy_all_frees_everything() {
        let mut res = ResourceManager::new(MockDevice::new());
        let buffer = res.create_buffer(&storage_desc("a", 64, MemoryLocation::GpuOnly)).unwrap();
        let image = res.create_image(&image_desc()).unwrap();
        res.destroy_all();
        assert_eq!(res.live_buffers(), 0);
        assert_eq!(res.live_images(), 0);
        assert!(!res.is_live_image(image));
        assert!(res.buffer(buffer).is_err());
        assert!(res.device().live_objects().is_empty());
    }
}
