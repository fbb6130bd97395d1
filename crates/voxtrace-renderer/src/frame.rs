//! Frame orchestration.
//!
//! Frames are double buffered. Each slot owns a command buffer, a completion
//! fence, an acquire and a present semaphore, a uniform buffer with its
//! global set (set 0) and the storage image the rays are traced into. A slot
//! is reused only after its fence has been waited on.
//!
//! Per frame:
//! 1. wait for the slot's fence
//! 2. acquire a presentation image (a stale target recreates and returns)
//! 3. reset the fence, write uniforms, record and submit
//! 4. present, recreating if the target went stale
//! 5. advance to the next slot

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use tracing::{debug, info, instrument, trace, warn};

use crate::device::{
    Acquire, Barrier, BufferDesc, DescriptorWrite, FrameSubmit, ImageDesc, LayoutBinding, Present, PresentTarget,
    RtDevice,
};
use crate::error::{RtError, RtResult};
use crate::renderer::RayTracer;
use crate::resources::{BufferId, ImageId, ResourceManager};

/// Contents of the per-frame uniform buffer (set 0, binding 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    /// Column-major inverse view matrix.
    pub inv_view: [[f32; 4]; 4],
    /// Column-major inverse projection matrix.
    pub inv_proj: [[f32; 4]; 4],
    pub frame: u32,
    pub _pad: [u32; 3],
}

impl FrameUniforms {
    pub fn new(inv_view: [[f32; 4]; 4], inv_proj: [[f32; 4]; 4]) -> Self {
        Self {
            inv_view,
            inv_proj,
            frame: 0,
            _pad: [0; 3],
        }
    }
}

impl Default for FrameUniforms {
    fn default() -> Self {
        let identity = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]];
        Self::new(identity, identity)
    }
}

/// Outcome of [`FrameOrchestrator::draw_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The target was stale at acquire; it was rebuilt and nothing was submitted.
    Recreated,
    /// Zero-area surface.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

/// Layout of set 0: the frame uniforms.
pub fn create_global_set_layout<D: RtDevice>(device: &D) -> RtResult<vk::DescriptorSetLayout> {
    device.create_descriptor_set_layout(&[LayoutBinding {
        binding: 0,
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        count: 1,
        stages: vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::MISS_KHR,
    }])
}

struct FrameSlot {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    uniforms: BufferId,
    global_set: vk::DescriptorSet,
    output: ImageId,
    state: SlotState,
}

pub struct FrameOrchestrator {
    slots: Vec<FrameSlot>,
    global_pool: vk::DescriptorPool,
    target: PresentTarget,
    window_extent: vk::Extent2D,
    resize_requested: bool,
    frame: usize,
    frame_counter: u32,
}

impl FrameOrchestrator {
    pub fn new<D: RtDevice>(
        resources: &mut ResourceManager<D>,
        global_layout: vk::DescriptorSetLayout,
        frame_slots: usize,
    ) -> RtResult<Self> {
        let target = resources.device().present_target();
        let slot_count = frame_slots as u32;

        let global_pool = resources.device().create_descriptor_pool(
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: slot_count,
            }],
            slot_count,
        )?;
        let mut orchestrator = Self {
            slots: Vec::with_capacity(frame_slots),
            global_pool,
            window_extent: target.extent,
            target,
            resize_requested: false,
            frame: 0,
            frame_counter: 0,
        };

        if let Err(e) = orchestrator.create_slots(resources, global_layout, slot_count) {
            orchestrator.destroy(resources);
            return Err(e);
        }

        info!(
            slots = frame_slots,
            width = orchestrator.target.extent.width,
            height = orchestrator.target.extent.height,
            "frame orchestrator ready"
        );
        Ok(orchestrator)
    }

    fn create_slots<D: RtDevice>(
        &mut self,
        resources: &mut ResourceManager<D>,
        global_layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> RtResult<()> {
        let cmds = resources.device().allocate_command_buffers(count)?;
        let sets = resources
            .device()
            .allocate_descriptor_sets(self.global_pool, global_layout, count)?;

        for (cmd, global_set) in cmds.into_iter().zip(sets) {
            let device = resources.device();
            // Signaled so the first wait on each slot returns immediately.
            let fence = device.create_fence(true)?;
            let image_available = device.create_semaphore()?;
            let render_finished = device.create_semaphore()?;

            let uniforms = resources.create_buffer(&BufferDesc {
                name: "frame_uniforms",
                size: std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                location: MemoryLocation::CpuToGpu,
            })?;
            let uniform_buffer = resources.buffer(uniforms)?;
            resources.device().write_descriptor_set(
                global_set,
                &[DescriptorWrite::UniformBuffer {
                    binding: 0,
                    buffer: uniform_buffer.handle,
                    range: uniform_buffer.size,
                }],
            );

            let output = create_output_image(resources, &self.target)?;
            self.slots.push(FrameSlot {
                cmd,
                fence,
                image_available,
                render_finished,
                uniforms,
                global_set,
                output,
                state: SlotState::Idle,
            });
        }
        Ok(())
    }

    /// Slot the next frame records into.
    pub fn frame_index(&self) -> usize {
        self.frame
    }

    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    pub fn global_set(&self, slot: usize) -> vk::DescriptorSet {
        self.slots[slot % self.slots.len()].global_set
    }

    /// Output images by slot, in the order the binding sets expect them.
    pub fn output_images(&self) -> Vec<ImageId> {
        self.slots.iter().map(|s| s.output).collect()
    }

    pub fn target(&self) -> &PresentTarget {
        &self.target
    }

    /// Mark the surface as resized. The next frame recreates first.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        self.resize_requested = true;
        debug!(width, height, "resize requested");
    }

    pub fn resize_pending(&self) -> bool {
        self.resize_requested
    }

    /// Render and present one frame.
    pub fn draw_frame<D: RtDevice>(
        &mut self,
        resources: &mut ResourceManager<D>,
        tracer: &mut RayTracer,
        uniforms: &FrameUniforms,
    ) -> RtResult<FrameStatus> {
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            return Ok(FrameStatus::Skipped);
        }
        if self.resize_requested {
            self.recreate(resources, tracer)?;
        }

        let slot = self.frame;
        let (cmd, fence, image_available, render_finished) = {
            let s = &self.slots[slot];
            (s.cmd, s.fence, s.image_available, s.render_finished)
        };

        resources.device().wait_fence(fence)?;
        self.slots[slot].state = SlotState::Idle;

        let image_index = match resources.device_mut().acquire_next_image(image_available) {
            Ok(Acquire::Image { index, suboptimal }) => {
                if suboptimal {
                    warn!("presentation target is suboptimal");
                    self.resize_requested = true;
                }
                index
            }
            Ok(Acquire::Stale) | Err(RtError::PresentationStale) => {
                self.recreate(resources, tracer)?;
                return Ok(FrameStatus::Recreated);
            }
            Err(e) => return Err(e),
        };

        // Only reset once work is certain to be submitted, or the next wait deadlocks.
        resources.device().reset_fence(fence)?;

        let frame_uniforms = FrameUniforms {
            frame: self.frame_counter,
            ..*uniforms
        };
        resources.write_buffer(self.slots[slot].uniforms, 0, bytemuck::bytes_of(&frame_uniforms))?;

        self.slots[slot].state = SlotState::Recording;
        resources.device().begin_command_buffer(cmd)?;
        self.record(resources, tracer, slot, image_index)?;
        resources.device().end_command_buffer(cmd)?;

        resources.device().submit(&FrameSubmit {
            cmd,
            wait: image_available,
            wait_stage: vk::PipelineStageFlags::TRANSFER,
            signal: render_finished,
            fence,
        })?;
        self.slots[slot].state = SlotState::Submitted;

        let presented = resources.device_mut().present(image_index, render_finished);
        self.frame = (self.frame + 1) % self.slots.len();
        self.frame_counter = self.frame_counter.wrapping_add(1);
        trace!(slot, image_index, frame = frame_uniforms.frame, "frame submitted");

        match presented {
            Ok(Present::Done) if !self.resize_requested => {}
            Ok(Present::Done) | Ok(Present::Stale) | Err(RtError::PresentationStale) => {
                self.recreate(resources, tracer)?;
            }
            Err(e) => return Err(e),
        }
        Ok(FrameStatus::Presented)
    }

    /// Refit, trace into the slot's output image, copy it to the presentation image.
    fn record<D: RtDevice>(
        &self,
        resources: &ResourceManager<D>,
        tracer: &mut RayTracer,
        slot: usize,
        image_index: u32,
    ) -> RtResult<()> {
        let device = resources.device();
        let s = &self.slots[slot];
        let extent = self.target.extent;
        let output = resources.image(s.output)?.handle;
        let swap_image = *self
            .target
            .images
            .get(image_index as usize)
            .ok_or_else(|| RtError::resource("presentation image", format!("no image at index {image_index}")))?;

        tracer.record_pending_refit(resources, s.cmd, slot)?;

        device.cmd_barrier(
            s.cmd,
            &Barrier::image_transition(output, vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
        );
        tracer.render(device, s.cmd, slot, extent, s.global_set)?;
        device.cmd_barrier(
            s.cmd,
            &Barrier::image_transition(output, vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        );

        // Source stage matches the submission's wait stage so the transition
        // happens after the acquire semaphore.
        device.cmd_barrier(
            s.cmd,
            &Barrier::Image {
                image: swap_image,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                src_access: vk::AccessFlags::empty(),
                dst_stage: vk::PipelineStageFlags::TRANSFER,
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
            },
        );
        device.cmd_copy_image(s.cmd, output, swap_image, extent);
        device.cmd_barrier(
            s.cmd,
            &Barrier::image_transition(
                swap_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
        );
        Ok(())
    }

    /// Rebuild the presentation target and everything sized from it, then
    /// rebind. Acceleration structures and the pipeline are left alone.
    #[instrument(skip_all, fields(width = self.window_extent.width, height = self.window_extent.height))]
    pub fn recreate<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>, tracer: &mut RayTracer) -> RtResult<()> {
        resources.device().wait_idle()?;
        for slot in &mut self.slots {
            slot.state = SlotState::Idle;
        }

        let target = resources.device_mut().recreate_target(self.window_extent)?;
        for slot in &mut self.slots {
            resources.destroy_image(slot.output)?;
            slot.output = create_output_image(resources, &target)?;
        }
        self.target = target;
        tracer.update_bindings(resources, &self.output_images())?;

        self.resize_requested = false;
        info!(
            width = self.target.extent.width,
            height = self.target.extent.height,
            images = self.target.images.len(),
            "presentation target recreated"
        );
        Ok(())
    }

    /// Wait for the device and release every per-slot object.
    pub fn destroy<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>) {
        if let Err(e) = resources.device().wait_idle() {
            warn!("wait for idle before frame teardown failed: {e}");
        }
        let cmds: Vec<_> = self.slots.iter().map(|s| s.cmd).collect();
        for slot in self.slots.drain(..) {
            let device = resources.device();
            device.destroy_fence(slot.fence);
            device.destroy_semaphore(slot.image_available);
            device.destroy_semaphore(slot.render_finished);
            let _ = resources.destroy_buffer(slot.uniforms);
            let _ = resources.destroy_image(slot.output);
        }
        if !cmds.is_empty() {
            resources.device().free_command_buffers(&cmds);
        }
        if self.global_pool != vk::DescriptorPool::null() {
            resources.device().destroy_descriptor_pool(self.global_pool);
            self.global_pool = vk::DescriptorPool::null();
        }
    }
}

/// Output images share the target's format so the per-frame copy never converts.
fn create_output_image<D: RtDevice>(resources: &mut ResourceManager<D>, target: &PresentTarget) -> RtResult<ImageId> {
    resources.create_image(&ImageDesc {
        name: "rt_output",
        image_type: vk::ImageType::TYPE_2D,
        extent: vk::Extent3D {
            width: target.extent.width,
            height: target.extent.height,
            depth: 1,
        },
        format: target.format,
        usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RtConfig, FRAMES_IN_FLIGHT};
    use crate::mock::{MockCommand, MockDevice};
    use crate::renderer::test_support::{stub_shaders, two_volumes_and_cube};

    fn setup() -> (ResourceManager<MockDevice>, RayTracer, FrameOrchestrator, vk::DescriptorSetLayout) {
        let mut res = ResourceManager::new(MockDevice::new());
        let config = RtConfig::default();
        let global_layout = create_global_set_layout(res.device()).unwrap();
        let mut tracer =
            RayTracer::init(&mut res, &config, &two_volumes_and_cube(), &stub_shaders(), global_layout).unwrap();
        let frames = FrameOrchestrator::new(&mut res, global_layout, FRAMES_IN_FLIGHT).unwrap();
        tracer.update_bindings(&res, &frames.output_images()).unwrap();
        (res, tracer, frames, global_layout)
    }

    #[test]
    fn test_uniforms_layout() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 144);
        assert_eq!(FrameUniforms::default().inv_view[3][3], 1.0);
    }

    // ========================================================================
    // Frame loop
    // ========================================================================

    #[test]
    fn test_frame_index_alternates() {
        let (mut res, mut tracer, mut frames, _) = setup();
        let uniforms = FrameUniforms::default();
        for expected in [1, 0, 1, 0] {
            let status = frames.draw_frame(&mut res, &mut tracer, &uniforms).unwrap();
            assert_eq!(status, FrameStatus::Presented);
            assert_eq!(frames.frame_index(), expected);
        }
        assert_eq!(res.device().frames().len(), 4);
        assert!(res.device().violations().is_empty(), "{:?}", res.device().violations());
    }

    #[test]
    fn test_record_sequence() {
        let (mut res, mut tracer, mut frames, _) = setup();
        frames
            .draw_frame(&mut res, &mut tracer, &FrameUniforms::default())
            .unwrap();

        let frame = &res.device().frames()[0];
        let layouts: Vec<_> = frame
            .commands
            .iter()
            .filter_map(|c| match c {
                MockCommand::Barrier(Barrier::Image {
                    old_layout, new_layout, ..
                }) => Some((*old_layout, *new_layout)),
                _ => None,
            })
            .collect();
        assert_eq!(
            layouts,
            vec![
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
                (vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
            ]
        );
        let trace = frame
            .commands
            .iter()
            .position(|c| matches!(c, MockCommand::TraceRays { .. }))
            .unwrap();
        let copy = frame
            .commands
            .iter()
            .position(|c| matches!(c, MockCommand::CopyImage { .. }))
            .unwrap();
        assert!(trace < copy);
    }

    #[test]
    fn test_uniform_frame_counter_written() {
        let (mut res, mut tracer, mut frames, _) = setup();
        let uniforms = FrameUniforms::default();
        frames.draw_frame(&mut res, &mut tracer, &uniforms).unwrap();
        frames.draw_frame(&mut res, &mut tracer, &uniforms).unwrap();
        frames.draw_frame(&mut res, &mut tracer, &uniforms).unwrap();

        let buffer = res.buffer(frames.slots[0].uniforms).unwrap();
        let bytes = res.device().buffer_data(buffer.handle).unwrap();
        let written: FrameUniforms = bytemuck::pod_read_unaligned(&bytes[..144]);
        assert_eq!(written.frame, 2);
    }

    #[test]
    fn test_zero_extent_skips() {
        let (mut res, mut tracer, mut frames, _) = setup();
        frames.request_resize(0, 600);
        let status = frames
            .draw_frame(&mut res, &mut tracer, &FrameUniforms::default())
            .unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(res.device().target_recreations(), 0);
        assert!(res.device().frames().is_empty());
    }

    // ========================================================================
    // Recreate
    // ========================================================================

    #[test]
    fn test_stale_acquire_recreates_without_submitting() {
        let (mut res, mut tracer, mut frames, _) = setup();
        let before = frames.output_images();
        res.device().force_stale();

        let status = frames
            .draw_frame(&mut res, &mut tracer, &FrameUniforms::default())
            .unwrap();
        assert_eq!(status, FrameStatus::Recreated);
        assert_eq!(res.device().target_recreations(), 1);
        assert!(res.device().frames().is_empty());
        assert_eq!(frames.frame_index(), 0);

        let after = frames.output_images();
        assert!(before.iter().all(|id| !res.is_live_image(*id)));
        assert!(after.iter().all(|id| res.is_live_image(*id)));
        let bound: Vec<_> = tracer.bound_output_images().iter().flatten().copied().collect();
        assert_eq!(bound, after);
    }

    #[test]
    fn test_resize_request_resizes_outputs() {
        let (mut res, mut tracer, mut frames, _) = setup();
        frames.request_resize(1024, 768);
        frames
            .draw_frame(&mut res, &mut tracer, &FrameUniforms::default())
            .unwrap();

        assert!(!frames.resize_pending());
        assert_eq!(frames.target().extent, vk::Extent2D { width: 1024, height: 768 });
        let output = res.image(frames.output_images()[0]).unwrap();
        assert_eq!((output.extent.width, output.extent.height), (1024, 768));
        assert_eq!(res.device().dispatches()[0].extent.width, 1024);
    }

    #[test]
    fn test_output_images_match_target_format() {
        let (mut res, mut tracer, mut frames, _) = setup();
        let check = |res: &ResourceManager<MockDevice>, frames: &FrameOrchestrator| {
            for id in frames.output_images() {
                let image = res.image(id).unwrap();
                assert_eq!(image.format, frames.target().format);
            }
        };
        check(&res, &frames);

        frames.request_resize(320, 200);
        frames
            .draw_frame(&mut res, &mut tracer, &FrameUniforms::default())
            .unwrap();
        check(&res, &frames);
    }

    #[test]
    fn test_destroy_releases_slots() {
        let (mut res, mut tracer, mut frames, global_layout) = setup();
        frames
            .draw_frame(&mut res, &mut tracer, &FrameUniforms::default())
            .unwrap();
        frames.destroy(&mut res);
        tracer.destroy(&mut res).unwrap();
        res.device().destroy_descriptor_set_layout(global_layout);

        assert_eq!(res.live_buffers(), 0);
        assert_eq!(res.live_images(), 0);
        assert_eq!(res.device().live_count("fence"), 0);
        assert_eq!(res.device().live_count("semaphore"), 0);
        assert_eq!(res.device().live_count("command_buffer"), 0);
    }
}
