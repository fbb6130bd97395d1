//! Device seam.
//!
//! Everything the subsystem asks of a graphics device goes through [`RtDevice`].
//! `vulkan::VulkanDevice` implements it over ash, `mock::MockDevice` implements
//! it headlessly for tests. Handle and flag types are ash's `vk` types so the
//! components read the same against either backend.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::RtResult;

/// Device limits the subsystem depends on.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub device_name: String,
    /// Size in bytes of one shader group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of each record inside a table region.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each table region's start address.
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    /// Required alignment of acceleration-structure scratch addresses.
    pub min_scratch_offset_alignment: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// A buffer as created by the device.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    /// Set when the usage included `SHADER_DEVICE_ADDRESS`.
    pub device_address: Option<vk::DeviceAddress>,
    /// Host-visible and persistently mapped.
    pub mapped: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub image_type: vk::ImageType,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

/// An image plus its full-resource view.
#[derive(Debug, Clone, Copy)]
pub struct RawImage {
    pub handle: vk::Image,
    pub view: vk::ImageView,
}

/// Pipeline barrier recorded into a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Memory {
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    },
    Image {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    },
}

impl Barrier {
    /// Layout transition for a color image, with stages and access masks taken
    /// from the transitions this subsystem performs.
    pub fn image_transition(image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        use vk::AccessFlags as A;
        use vk::ImageLayout as L;
        use vk::PipelineStageFlags as S;

        let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) | (L::TRANSFER_DST_OPTIMAL, L::GENERAL) => (
                A::TRANSFER_WRITE,
                A::SHADER_READ,
                S::TRANSFER,
                S::RAY_TRACING_SHADER_KHR,
            ),
            (L::UNDEFINED, L::GENERAL) => (
                A::empty(),
                A::SHADER_WRITE,
                S::TOP_OF_PIPE,
                S::RAY_TRACING_SHADER_KHR,
            ),
            (L::GENERAL, L::TRANSFER_SRC_OPTIMAL) => (
                A::SHADER_WRITE,
                A::TRANSFER_READ,
                S::RAY_TRACING_SHADER_KHR,
                S::TRANSFER,
            ),
            (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR) => (
                A::TRANSFER_WRITE,
                A::empty(),
                S::TRANSFER,
                S::BOTTOM_OF_PIPE,
            ),
            _ => (
                A::MEMORY_READ | A::MEMORY_WRITE,
                A::MEMORY_READ | A::MEMORY_WRITE,
                S::ALL_COMMANDS,
                S::ALL_COMMANDS,
            ),
        };

        Barrier::Image {
            image,
            old_layout,
            new_layout,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        }
    }

    /// Structure build results become visible to later builds and to ray traversal.
    pub fn build_to_read() -> Self {
        Barrier::Memory {
            src_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            src_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        }
    }

    /// Host writes to build inputs become visible to the build, and earlier
    /// traversal of the structure finishes before it is rewritten.
    pub fn host_to_build() -> Self {
        Barrier::Memory {
            src_stage: vk::PipelineStageFlags::HOST
                | vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            src_access: vk::AccessFlags::HOST_WRITE
                | vk::AccessFlags::TRANSFER_WRITE
                | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        }
    }
}

/// Geometry input of a structure build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AccelGeometry {
    /// `R32G32B32_SFLOAT` positions with `UINT32` indices.
    Triangles {
        vertex_address: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        max_vertex: u32,
        index_address: vk::DeviceAddress,
        primitive_count: u32,
    },
    Aabbs {
        address: vk::DeviceAddress,
        stride: vk::DeviceSize,
        primitive_count: u32,
    },
    Instances {
        address: vk::DeviceAddress,
        count: u32,
    },
}

impl AccelGeometry {
    pub fn primitive_count(&self) -> u32 {
        match *self {
            AccelGeometry::Triangles { primitive_count, .. } => primitive_count,
            AccelGeometry::Aabbs { primitive_count, .. } => primitive_count,
            AccelGeometry::Instances { count, .. } => count,
        }
    }

    pub fn structure_type(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            AccelGeometry::Instances { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            _ => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        }
    }
}

/// Everything needed to size or build one structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelBuildDesc {
    pub geometry: AccelGeometry,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
}

/// Sizes reported by the device for a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelSizes {
    pub structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

/// One recorded build or refit.
#[derive(Debug, Clone, Copy)]
pub struct AccelBuild<'a> {
    pub desc: &'a AccelBuildDesc,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    /// Source structure for `UPDATE`, null for `BUILD`.
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Descriptor update for one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorWrite {
    AccelerationStructure {
        binding: u32,
        accel: vk::AccelerationStructureKHR,
    },
    StorageImages {
        binding: u32,
        views: Vec<vk::ImageView>,
        layout: vk::ImageLayout,
    },
    StorageBuffer {
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    },
    UniformBuffer {
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    },
    CombinedImageSampler {
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl DescriptorWrite {
    pub fn binding(&self) -> u32 {
        match *self {
            DescriptorWrite::AccelerationStructure { binding, .. }
            | DescriptorWrite::StorageImages { binding, .. }
            | DescriptorWrite::StorageBuffer { binding, .. }
            | DescriptorWrite::UniformBuffer { binding, .. }
            | DescriptorWrite::CombinedImageSampler { binding, .. } => binding,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
}

/// Shader group referencing stages by index; unused slots hold `vk::SHADER_UNUSED_KHR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineGroup {
    pub ty: vk::RayTracingShaderGroupTypeKHR,
    pub general: u32,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RtPipelineDesc<'a> {
    pub stages: &'a [PipelineStage],
    pub groups: &'a [PipelineGroup],
    pub layout: vk::PipelineLayout,
    pub max_recursion_depth: u32,
}

/// Strided regions passed to a ray dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// A frame submission: one command buffer between two semaphores.
#[derive(Debug, Clone, Copy)]
pub struct FrameSubmit {
    pub cmd: vk::CommandBuffer,
    pub wait: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal: vk::Semaphore,
    pub fence: vk::Fence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Present {
    Done,
    /// Presented, but the target no longer matches the surface.
    Stale,
}

/// The images frames are copied into for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentTarget {
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Graphics device used by every component.
///
/// Host-side state changes (creation, destruction, writes) take `&self`; the
/// presentation target is the only state the caller mutates through `&mut self`.
pub trait RtDevice {
    fn properties(&self) -> &DeviceProperties;

    // Memory
    fn create_buffer(&self, desc: &BufferDesc) -> RtResult<RawBuffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Host write into a mapped buffer.
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> RtResult<()>;
    fn create_image(&self, desc: &ImageDesc) -> RtResult<RawImage>;
    fn destroy_image(&self, image: RawImage);
    fn create_sampler(&self) -> RtResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Command buffers
    fn begin_one_shot(&self) -> RtResult<vk::CommandBuffer>;
    /// Submit a one-shot command buffer and block until the queue is idle.
    fn submit_one_shot(&self, cmd: vk::CommandBuffer) -> RtResult<()>;
    /// Free a one-shot command buffer without submitting it.
    fn abandon_one_shot(&self, cmd: vk::CommandBuffer);
    fn allocate_command_buffers(&self, count: u32) -> RtResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, cmds: &[vk::CommandBuffer]);
    /// Reset and begin a frame command buffer.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RtResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RtResult<()>;

    // Recording
    fn cmd_barrier(&self, cmd: vk::CommandBuffer, barrier: &Barrier);
    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize);
    fn cmd_copy_buffer_to_image(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Image, extent: vk::Extent3D);
    fn cmd_copy_image(&self, cmd: vk::CommandBuffer, src: vk::Image, dst: vk::Image, extent: vk::Extent2D);

    // Acceleration structures
    fn accel_build_sizes(&self, desc: &AccelBuildDesc) -> RtResult<AccelSizes>;
    fn create_accel(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RtResult<vk::AccelerationStructureKHR>;
    fn accel_device_address(&self, accel: vk::AccelerationStructureKHR) -> vk::DeviceAddress;
    fn destroy_accel(&self, accel: vk::AccelerationStructureKHR);
    fn cmd_build_accel(&self, cmd: vk::CommandBuffer, build: &AccelBuild);
    fn create_query_pool(&self, count: u32) -> RtResult<vk::QueryPool>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);
    fn cmd_write_compacted_size(
        &self,
        cmd: vk::CommandBuffer,
        accel: vk::AccelerationStructureKHR,
        pool: vk::QueryPool,
        query: u32,
    );
    fn read_compacted_sizes(&self, pool: vk::QueryPool, first: u32, count: u32) -> RtResult<Vec<u64>>;

    // Descriptors
    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> RtResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> RtResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> RtResult<Vec<vk::DescriptorSet>>;
    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // Pipelines
    fn create_shader_module(&self, code: &[u32]) -> RtResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout]) -> RtResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_rt_pipeline(&self, desc: &RtPipelineDesc) -> RtResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    /// All group handles of `pipeline`, concatenated in group order.
    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> RtResult<Vec<u8>>;
    fn cmd_bind_rt_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_rt_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_trace_rays(&self, cmd: vk::CommandBuffer, regions: &SbtRegions, extent: vk::Extent2D);

    // Synchronization and submission
    fn create_fence(&self, signaled: bool) -> RtResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Block until `fence` signals. No timeout.
    fn wait_fence(&self, fence: vk::Fence) -> RtResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> RtResult<()>;
    fn create_semaphore(&self) -> RtResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn submit(&self, submit: &FrameSubmit) -> RtResult<()>;

    // Presentation
    fn present_target(&self) -> PresentTarget;
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> RtResult<Acquire>;
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RtResult<Present>;
    /// Rebuild the presentation target. `extent` is the window size, used when
    /// the surface does not dictate one.
    fn recreate_target(&mut self, extent: vk::Extent2D) -> RtResult<PresentTarget>;

    fn wait_idle(&self) -> RtResult<()>;
}
