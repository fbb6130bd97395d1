//! [`RtDevice`] over ash.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{debug, info};

use super::{query_err, resource_err, CommandManager, MemoryManager, Swapchain, VulkanContext, VulkanSurface};
use crate::config::RtConfig;
use crate::device::{
    Acquire, AccelBuild, AccelBuildDesc, AccelGeometry, AccelSizes, Barrier, BufferDesc, DescriptorWrite,
    DeviceProperties, FrameSubmit, ImageDesc, LayoutBinding, Present, PresentTarget, RawBuffer, RawImage,
    RtDevice, RtPipelineDesc, SbtRegions,
};
use crate::error::{vk_error, RtError, RtResult};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// A window-backed Vulkan device with ray tracing enabled.
pub struct VulkanDevice {
    swapchain: Swapchain,
    surface: VulkanSurface,
    commands: CommandManager,
    memory: MemoryManager,
    // Dropped last: destroys the logical device and instance.
    ctx: VulkanContext,
}

impl VulkanDevice {
    /// Bring up the device and an initial swapchain of `extent`.
    ///
    /// # Safety
    /// The window behind the handles must outlive the device.
    pub unsafe fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        extent: vk::Extent2D,
        config: &RtConfig,
    ) -> RtResult<Self> {
        let ctx = VulkanContext::new(display_handle, window_handle, config.validation)?;
        let surface = VulkanSurface::new(&ctx, config.vsync)?;
        let memory = MemoryManager::new(&ctx)?;
        let mut commands = CommandManager::new(&ctx)?;
        let swapchain = match Swapchain::new(&ctx, &surface, extent, None) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                commands.destroy();
                memory.destroy();
                return Err(e);
            }
        };

        info!(
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            present_mode = ?surface.present_mode,
            "vulkan device ready"
        );

        Ok(Self {
            swapchain,
            surface,
            commands,
            memory,
            ctx,
        })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.ctx.wait_idle();
            self.swapchain.destroy(&self.ctx);
            self.commands.destroy();
            self.memory.destroy();
        }
        debug!("vulkan device destroyed");
    }
}

/// Geometry description for a build or size query.
fn geometry_info(geometry: &AccelGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    match *geometry {
        AccelGeometry::Triangles {
            vertex_address,
            vertex_stride,
            max_vertex,
            index_address,
            ..
        } => {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertex_address,
                })
                .vertex_stride(vertex_stride)
                .max_vertex(max_vertex)
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: index_address,
                });

            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        }
        AccelGeometry::Aabbs { address, stride, .. } => {
            let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                .data(vk::DeviceOrHostAddressConstKHR { device_address: address })
                .stride(stride);

            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::AABBS)
                .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        }
        AccelGeometry::Instances { address, .. } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR { device_address: address });

            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        }
    }
}

impl RtDevice for VulkanDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.ctx.properties
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    fn create_buffer(&self, desc: &BufferDesc) -> RtResult<RawBuffer> {
        unsafe { self.memory.create_buffer(desc) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.memory.destroy_buffer(buffer) }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> RtResult<()> {
        self.memory.write_buffer(buffer, offset, data)
    }

    fn create_image(&self, desc: &ImageDesc) -> RtResult<RawImage> {
        unsafe { self.memory.create_image(desc) }
    }

    fn destroy_image(&self, image: RawImage) {
        unsafe { self.memory.destroy_image(image.handle) }
    }

    fn create_sampler(&self) -> RtResult<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);

        unsafe { self.ctx.device.create_sampler(&info, None) }.map_err(resource_err("sampler"))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.ctx.device.destroy_sampler(sampler, None) }
    }

    // ------------------------------------------------------------------
    // Command buffers
    // ------------------------------------------------------------------

    fn begin_one_shot(&self) -> RtResult<vk::CommandBuffer> {
        unsafe { self.commands.begin_single_time() }
    }

    fn submit_one_shot(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        unsafe { self.commands.end_single_time(cmd) }
    }

    fn abandon_one_shot(&self, cmd: vk::CommandBuffer) {
        unsafe { self.commands.discard_single_time(cmd) }
    }

    fn allocate_command_buffers(&self, count: u32) -> RtResult<Vec<vk::CommandBuffer>> {
        unsafe { self.commands.allocate(count) }
    }

    fn free_command_buffers(&self, cmds: &[vk::CommandBuffer]) {
        unsafe { self.commands.free(cmds) }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        unsafe { self.commands.begin(cmd) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        unsafe { self.commands.end(cmd) }
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    fn cmd_barrier(&self, cmd: vk::CommandBuffer, barrier: &Barrier) {
        let device = &self.ctx.device;
        match *barrier {
            Barrier::Memory {
                src_stage,
                src_access,
                dst_stage,
                dst_access,
            } => {
                let memory = vk::MemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access);
                unsafe {
                    device.cmd_pipeline_barrier(
                        cmd,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[memory],
                        &[],
                        &[],
                    );
                }
            }
            Barrier::Image {
                image,
                old_layout,
                new_layout,
                src_stage,
                src_access,
                dst_stage,
                dst_access,
            } => {
                let image_barrier = vk::ImageMemoryBarrier::default()
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(COLOR_RANGE)
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access);
                unsafe {
                    device.cmd_pipeline_barrier(
                        cmd,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[image_barrier],
                    );
                }
            }
        }
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { self.ctx.device.cmd_copy_buffer(cmd, src, dst, &[region]) }
    }

    fn cmd_copy_buffer_to_image(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Image, extent: vk::Extent3D) {
        let region = vk::BufferImageCopy::default()
            .image_subresource(COLOR_LAYERS)
            .image_extent(extent);
        unsafe {
            self.ctx
                .device
                .cmd_copy_buffer_to_image(cmd, src, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region])
        }
    }

    fn cmd_copy_image(&self, cmd: vk::CommandBuffer, src: vk::Image, dst: vk::Image, extent: vk::Extent2D) {
        let region = vk::ImageCopy::default()
            .src_subresource(COLOR_LAYERS)
            .dst_subresource(COLOR_LAYERS)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        unsafe {
            self.ctx.device.cmd_copy_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        }
    }

    // ------------------------------------------------------------------
    // Acceleration structures
    // ------------------------------------------------------------------

    fn accel_build_sizes(&self, desc: &AccelBuildDesc) -> RtResult<AccelSizes> {
        let geometries = [geometry_info(&desc.geometry)];
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(desc.geometry.structure_type())
            .flags(desc.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.ctx.accel_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &[desc.geometry.primitive_count()],
                &mut sizes,
            );
        }

        if sizes.acceleration_structure_size == 0 {
            return Err(RtError::query("acceleration structure sizes", "device reported a zero size"));
        }

        Ok(AccelSizes {
            structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    fn create_accel(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RtResult<vk::AccelerationStructureKHR> {
        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .size(size)
            .ty(ty);

        unsafe { self.ctx.accel_loader.create_acceleration_structure(&info, None) }
            .map_err(resource_err("acceleration structure"))
    }

    fn accel_device_address(&self, accel: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel);
        unsafe { self.ctx.accel_loader.get_acceleration_structure_device_address(&info) }
    }

    fn destroy_accel(&self, accel: vk::AccelerationStructureKHR) {
        unsafe { self.ctx.accel_loader.destroy_acceleration_structure(accel, None) }
    }

    fn cmd_build_accel(&self, cmd: vk::CommandBuffer, build: &AccelBuild) {
        let geometries = [geometry_info(&build.desc.geometry)];
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(build.desc.geometry.structure_type())
            .flags(build.desc.flags)
            .mode(build.mode)
            .src_acceleration_structure(build.src)
            .dst_acceleration_structure(build.dst)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: build.scratch_address,
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(build.desc.geometry.primitive_count());

        unsafe {
            self.ctx
                .accel_loader
                .cmd_build_acceleration_structures(cmd, &[info], &[&[range]]);
        }
    }

    fn create_query_pool(&self, count: u32) -> RtResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);

        unsafe { self.ctx.device.create_query_pool(&info, None) }.map_err(resource_err("query pool"))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.ctx.device.destroy_query_pool(pool, None) }
    }

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        unsafe { self.ctx.device.cmd_reset_query_pool(cmd, pool, first, count) }
    }

    fn cmd_write_compacted_size(
        &self,
        cmd: vk::CommandBuffer,
        accel: vk::AccelerationStructureKHR,
        pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe {
            self.ctx.accel_loader.cmd_write_acceleration_structures_properties(
                cmd,
                &[accel],
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool,
                query,
            );
        }
    }

    fn read_compacted_sizes(&self, pool: vk::QueryPool, first: u32, count: u32) -> RtResult<Vec<u64>> {
        let mut sizes = vec![0u64; count as usize];
        unsafe {
            self.ctx.device.get_query_pool_results(
                pool,
                first,
                &mut sizes,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(query_err("compacted sizes"))?;
        Ok(sizes)
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> RtResult<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        unsafe { self.ctx.device.create_descriptor_set_layout(&info, None) }
            .map_err(resource_err("descriptor set layout"))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.ctx.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> RtResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(sizes)
            .max_sets(max_sets);

        unsafe { self.ctx.device.create_descriptor_pool(&info, None) }.map_err(resource_err("descriptor pool"))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.ctx.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> RtResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count as usize];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        unsafe { self.ctx.device.allocate_descriptor_sets(&info) }.map_err(resource_err("descriptor sets"))
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let device = &self.ctx.device;

        for write in writes {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.binding())
                .dst_array_element(0);

            match write {
                DescriptorWrite::AccelerationStructure { accel, .. } => {
                    let structures = [*accel];
                    let mut accel_info =
                        vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&structures);
                    // The count is not derived from the chained struct.
                    let write = base
                        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                        .descriptor_count(1)
                        .push_next(&mut accel_info);
                    unsafe { device.update_descriptor_sets(&[write], &[]) };
                }
                DescriptorWrite::StorageImages { views, layout, .. } => {
                    if views.is_empty() {
                        continue;
                    }
                    let infos: Vec<vk::DescriptorImageInfo> = views
                        .iter()
                        .map(|&view| vk::DescriptorImageInfo::default().image_view(view).image_layout(*layout))
                        .collect();
                    let write = base
                        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                        .image_info(&infos);
                    unsafe { device.update_descriptor_sets(&[write], &[]) };
                }
                DescriptorWrite::StorageBuffer { buffer, range, .. }
                | DescriptorWrite::UniformBuffer { buffer, range, .. } => {
                    let ty = if matches!(write, DescriptorWrite::StorageBuffer { .. }) {
                        vk::DescriptorType::STORAGE_BUFFER
                    } else {
                        vk::DescriptorType::UNIFORM_BUFFER
                    };
                    let infos = [vk::DescriptorBufferInfo::default()
                        .buffer(*buffer)
                        .offset(0)
                        .range(*range)];
                    let write = base.descriptor_type(ty).buffer_info(&infos);
                    unsafe { device.update_descriptor_sets(&[write], &[]) };
                }
                DescriptorWrite::CombinedImageSampler {
                    view, sampler, layout, ..
                } => {
                    let infos = [vk::DescriptorImageInfo::default()
                        .image_view(*view)
                        .sampler(*sampler)
                        .image_layout(*layout)];
                    let write = base
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(&infos);
                    unsafe { device.update_descriptor_sets(&[write], &[]) };
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    fn create_shader_module(&self, code: &[u32]) -> RtResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.ctx.device.create_shader_module(&info, None) }.map_err(resource_err("shader module"))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.ctx.device.destroy_shader_module(module, None) }
    }

    fn create_pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout]) -> RtResult<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        unsafe { self.ctx.device.create_pipeline_layout(&info, None) }.map_err(resource_err("pipeline layout"))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.ctx.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_rt_pipeline(&self, desc: &RtPipelineDesc) -> RtResult<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage)
                    .module(s.module)
                    .name(c"main")
            })
            .collect();

        let groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = desc
            .groups
            .iter()
            .map(|g| {
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(g.ty)
                    .general_shader(g.general)
                    .closest_hit_shader(g.closest_hit)
                    .any_hit_shader(g.any_hit)
                    .intersection_shader(g.intersection)
            })
            .collect();

        let info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(desc.layout);

        let pipelines = unsafe {
            self.ctx.rt_pipeline_loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[info],
                None,
            )
        }
        .map_err(|(_, e)| resource_err("ray tracing pipeline")(e))?;

        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RtError::resource("ray tracing pipeline", "driver returned no pipeline"))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.ctx.device.destroy_pipeline(pipeline, None) }
    }

    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> RtResult<Vec<u8>> {
        let size = group_count as usize * self.ctx.properties.shader_group_handle_size as usize;
        unsafe {
            self.ctx
                .rt_pipeline_loader
                .get_ray_tracing_shader_group_handles(pipeline, 0, group_count, size)
        }
        .map_err(query_err("shader group handles"))
    }

    fn cmd_bind_rt_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.ctx
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline)
        }
    }

    fn cmd_bind_rt_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.ctx.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                layout,
                first_set,
                sets,
                &[],
            )
        }
    }

    fn cmd_trace_rays(&self, cmd: vk::CommandBuffer, regions: &SbtRegions, extent: vk::Extent2D) {
        unsafe {
            self.ctx.rt_pipeline_loader.cmd_trace_rays(
                cmd,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                extent.width,
                extent.height,
                1,
            )
        }
    }

    // ------------------------------------------------------------------
    // Synchronization and submission
    // ------------------------------------------------------------------

    fn create_fence(&self, signaled: bool) -> RtResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.ctx.device.create_fence(&info, None) }.map_err(resource_err("fence"))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.ctx.device.destroy_fence(fence, None) }
    }

    fn wait_fence(&self, fence: vk::Fence) -> RtResult<()> {
        unsafe { self.ctx.device.wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(|e| vk_error(e, |e| RtError::resource("fence wait", format!("{:?}", e))))
    }

    fn reset_fence(&self, fence: vk::Fence) -> RtResult<()> {
        unsafe { self.ctx.device.reset_fences(&[fence]) }.map_err(resource_err("fence reset"))
    }

    fn create_semaphore(&self) -> RtResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe { self.ctx.device.create_semaphore(&info, None) }.map_err(resource_err("semaphore"))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.ctx.device.destroy_semaphore(semaphore, None) }
    }

    fn submit(&self, submit: &FrameSubmit) -> RtResult<()> {
        unsafe { self.commands.submit(submit) }
    }

    // ------------------------------------------------------------------
    // Presentation
    // ------------------------------------------------------------------

    fn present_target(&self) -> PresentTarget {
        self.swapchain.target()
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> RtResult<Acquire> {
        unsafe { self.swapchain.acquire_next_image(&self.ctx, signal) }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RtResult<Present> {
        unsafe { self.swapchain.present(&self.ctx, image_index, wait) }
    }

    fn recreate_target(&mut self, extent: vk::Extent2D) -> RtResult<PresentTarget> {
        unsafe { self.swapchain.recreate(&self.ctx, &mut self.surface, extent)? };
        Ok(self.swapchain.target())
    }

    fn wait_idle(&self) -> RtResult<()> {
        unsafe { self.ctx.device.device_wait_idle() }
            .map_err(|e| vk_error(e, |e| RtError::resource("device idle", format!("{:?}", e))))
    }
}
