//! Top-level acceleration structure.
//!
//! Built once from the instance list, then refit in place whenever
//! transforms change. The instance count is fixed by the first build.
//!
//! Instances live in a host-mapped buffer split into one region per frame
//! slot plus one for synchronous updates, so the host never rewrites a
//! region a pending refit may still read.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use tracing::{debug, info, instrument, trace};

use crate::device::{AccelBuild, AccelBuildDesc, AccelGeometry, Barrier, BufferDesc, RtDevice};
use crate::error::{RtError, RtResult};
use crate::raytracing::blas::BottomLevelBuilder;
use crate::raytracing::sbt::align_up;
use crate::resources::{BufferId, ResourceManager};

/// Row-major 3×4 identity.
pub const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

/// Hit group used by triangle-mesh instances.
pub const TRIANGLE_HIT_GROUP: u32 = 0;
/// Hit group used by procedural-volume instances.
pub const VOLUME_HIT_GROUP: u32 = 1;

/// Device instance layout (`VkAccelerationStructureInstanceKHR`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3×4 object-to-world transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub instance_custom_index_and_mask: u32,
    /// Hit-group offset in the low 24 bits, instance flags in the high 8.
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    /// Device address of the bottom-level structure.
    pub acceleration_structure_reference: u64,
}

impl Default for InstanceRecord {
    fn default() -> Self {
        Self {
            transform: IDENTITY_TRANSFORM,
            instance_custom_index_and_mask: 0xFF << 24,
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: 0,
        }
    }
}

impl InstanceRecord {
    pub fn new(transform: [f32; 12], custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform,
            instance_custom_index_and_mask: (0xFF << 24) | (custom_index & 0xFF_FFFF),
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: blas_address,
        }
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_custom_index_and_mask =
            (u32::from(mask) << 24) | (self.instance_custom_index_and_mask & 0xFF_FFFF);
        self
    }

    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags = (flags.as_raw() << 24) | (offset & 0xFF_FFFF);
        self
    }

    /// Procedural volume: force-opaque, volume hit group.
    pub fn volume(blas_index: u32, blas_address: vk::DeviceAddress, transform: [f32; 12]) -> Self {
        Self::new(transform, blas_index, blas_address)
            .with_sbt_offset(VOLUME_HIT_GROUP, vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE)
    }

    /// Triangle mesh: both faces hit, triangle hit group.
    pub fn triangles(blas_index: u32, blas_address: vk::DeviceAddress, transform: [f32; 12]) -> Self {
        Self::new(transform, blas_index, blas_address)
            .with_sbt_offset(TRIANGLE_HIT_GROUP, vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE)
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0xFF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & 0xFF_FFFF
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.instance_shader_binding_table_record_offset_and_flags >> 24)
    }
}

/// Convert a column-major 4×4 matrix to the row-major 3×4 instance layout.
pub fn transform_from_cols(cols: [[f32; 4]; 4]) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        for col in 0..4 {
            out[row * 4 + col] = cols[col][row];
        }
    }
    out
}

fn build_flags() -> vk::BuildAccelerationStructureFlagsKHR {
    vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
}

const RECORD_SIZE: vk::DeviceSize = std::mem::size_of::<InstanceRecord>() as vk::DeviceSize;

struct BuiltTlas {
    accel: vk::AccelerationStructureKHR,
    buffer: BufferId,
    device_address: vk::DeviceAddress,
    scratch: BufferId,
    scratch_address: vk::DeviceAddress,
    instances: BufferId,
    instance_base: vk::DeviceAddress,
    region_size: vk::DeviceSize,
    count: u32,
}

impl BuiltTlas {
    fn desc_for_region(&self, region: usize) -> AccelBuildDesc {
        AccelBuildDesc {
            geometry: AccelGeometry::Instances {
                address: self.instance_base + region as vk::DeviceSize * self.region_size,
                count: self.count,
            },
            flags: build_flags(),
        }
    }
}

pub struct TopLevelBuilder {
    instances: Vec<InstanceRecord>,
    frame_slots: usize,
    dirty: bool,
    built: Option<BuiltTlas>,
}

impl TopLevelBuilder {
    pub fn new(frame_slots: usize) -> Self {
        Self {
            instances: Vec::new(),
            frame_slots,
            dirty: false,
            built: None,
        }
    }

    /// Append an instance. Only allowed before the first build.
    pub fn add_instance(&mut self, record: InstanceRecord) -> RtResult<u32> {
        if self.built.is_some() {
            return Err(RtError::TopologyLocked);
        }
        self.instances.push(record);
        Ok(self.instances.len() as u32 - 1)
    }

    pub fn add_volume_instance(
        &mut self,
        blas: &BottomLevelBuilder,
        blas_index: u32,
        transform: [f32; 12],
    ) -> RtResult<u32> {
        let address = blas.entry(blas_index)?.device_address;
        self.add_instance(InstanceRecord::volume(blas_index, address, transform))
    }

    pub fn add_triangle_instance(
        &mut self,
        blas: &BottomLevelBuilder,
        blas_index: u32,
        transform: [f32; 12],
    ) -> RtResult<u32> {
        let address = blas.entry(blas_index)?.device_address;
        self.add_instance(InstanceRecord::triangles(blas_index, address, transform))
    }

    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    pub fn accel(&self) -> RtResult<vk::AccelerationStructureKHR> {
        self.built
            .as_ref()
            .map(|b| b.accel)
            .ok_or(RtError::NotBuilt("top-level structure"))
    }

    pub fn device_address(&self) -> RtResult<vk::DeviceAddress> {
        self.built
            .as_ref()
            .map(|b| b.device_address)
            .ok_or(RtError::NotBuilt("top-level structure"))
    }

    /// Region written by the synchronous paths (`build`, `update`).
    fn sync_region(&self) -> usize {
        self.frame_slots
    }

    /// Full build. Allocates the structure, its persistent scratch and the
    /// instance buffer, and waits for the build to finish.
    #[instrument(skip_all, fields(instances = self.instances.len()))]
    pub fn build<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        if self.built.is_some() {
            return Err(RtError::TopologyLocked);
        }

        let mut created = Vec::new();
        match self.allocate_and_build(resources, &mut created) {
            Ok(built) => {
                info!(
                    instances = built.count,
                    address = built.device_address,
                    "top-level structure built"
                );
                self.built = Some(built);
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                for id in created {
                    let _ = resources.destroy_buffer(id);
                }
                Err(e)
            }
        }
    }

    fn allocate_and_build<D: RtDevice>(
        &self,
        resources: &mut ResourceManager<D>,
        created: &mut Vec<BufferId>,
    ) -> RtResult<BuiltTlas> {
        let count = self.instances.len() as u32;
        let region_size = RECORD_SIZE * vk::DeviceSize::from(count.max(1));
        let regions = self.frame_slots as vk::DeviceSize + 1;

        let instances = resources.create_buffer(&BufferDesc {
            name: "tlas_instances",
            size: region_size * regions,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::CpuToGpu,
        })?;
        created.push(instances);
        let instance_base = resources.buffer(instances)?.address()?;

        // Sized against region 0; every region holds the same count.
        let sizing = AccelBuildDesc {
            geometry: AccelGeometry::Instances {
                address: instance_base,
                count,
            },
            flags: build_flags(),
        };
        let sizes = resources.device().accel_build_sizes(&sizing)?;

        let buffer = resources.create_buffer(&BufferDesc {
            name: "tlas",
            size: sizes.structure_size,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
        })?;
        created.push(buffer);

        let alignment = vk::DeviceSize::from(resources.device().properties().min_scratch_offset_alignment.max(1));
        let scratch = resources.create_buffer(&BufferDesc {
            name: "tlas_scratch",
            size: sizes.build_scratch_size.max(sizes.update_scratch_size) + alignment,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
        })?;
        created.push(scratch);
        let scratch_address = align_up(resources.buffer(scratch)?.address()?, alignment);

        let handle = resources.buffer(buffer)?.handle;
        let accel = resources
            .device()
            .create_accel(vk::AccelerationStructureTypeKHR::TOP_LEVEL, handle, sizes.structure_size)?;

        let built = BuiltTlas {
            accel,
            buffer,
            device_address: resources.device().accel_device_address(accel),
            scratch,
            scratch_address,
            instances,
            instance_base,
            region_size,
            count,
        };

        let region = self.sync_region();
        let result = resources
            .write_buffer(instances, region as vk::DeviceSize * region_size, bytemuck::cast_slice(&self.instances))
            .and_then(|()| {
                let desc = built.desc_for_region(region);
                resources
                    .one_shot(|device, cmd| {
                        record_build(device, cmd, &built, &desc, vk::BuildAccelerationStructureModeKHR::BUILD);
                        Ok(())
                    })
                    .map_err(RtError::into_build_failure)
            });
        if let Err(e) = result {
            resources.device().destroy_accel(accel);
            return Err(e);
        }

        Ok(built)
    }

    /// Refit in place from `instances` and wait for it.
    ///
    /// The count must match the built one; changing it needs an explicit
    /// [`rebuild`](Self::rebuild).
    pub fn update<D: RtDevice>(&mut self, resources: &ResourceManager<D>, instances: &[InstanceRecord]) -> RtResult<()> {
        let built = self.built.as_ref().ok_or(RtError::NotBuilt("top-level structure"))?;
        if instances.len() as u32 != built.count {
            return Err(RtError::InstanceCountChanged {
                built: built.count,
                requested: instances.len() as u32,
            });
        }

        self.instances.copy_from_slice(instances);
        let region = self.sync_region();
        resources.write_buffer(
            built.instances,
            region as vk::DeviceSize * built.region_size,
            bytemuck::cast_slice(&self.instances),
        )?;

        let desc = built.desc_for_region(region);
        resources
            .one_shot(|device, cmd| {
                record_build(device, cmd, built, &desc, vk::BuildAccelerationStructureModeKHR::UPDATE);
                Ok(())
            })
            .map_err(RtError::into_build_failure)?;

        self.dirty = false;
        debug!(instances = built.count, "top-level structure refit");
        Ok(())
    }

    /// Replace the instance list and rebuild from scratch.
    ///
    /// Waits for the device to go idle first. The structure handle changes,
    /// so binding sets must be rewritten afterwards.
    pub fn rebuild<D: RtDevice>(
        &mut self,
        resources: &mut ResourceManager<D>,
        instances: Vec<InstanceRecord>,
    ) -> RtResult<()> {
        resources.device().wait_idle()?;
        self.destroy(resources)?;
        self.instances = instances;
        self.build(resources)
    }

    /// Stage a transform change. It is picked up by the next
    /// [`record_pending_refit`](Self::record_pending_refit), or by `build`
    /// if the structure has not been built yet.
    pub fn set_transform(&mut self, index: u32, transform: [f32; 12]) -> RtResult<()> {
        let count = self.instances.len() as u32;
        let record = self
            .instances
            .get_mut(index as usize)
            .ok_or(RtError::InstanceIndex { index, count })?;
        record.transform = transform;
        self.dirty = self.built.is_some();
        Ok(())
    }

    pub fn has_pending_refit(&self) -> bool {
        self.dirty
    }

    /// Write staged transforms into `slot`'s instance region and record a
    /// refit into `cmd`, fenced by barriers on both sides.
    ///
    /// Returns whether anything was recorded. `slot`'s previous submission
    /// must have completed.
    pub fn record_pending_refit<D: RtDevice>(
        &mut self,
        resources: &ResourceManager<D>,
        cmd: vk::CommandBuffer,
        slot: usize,
    ) -> RtResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let built = self.built.as_ref().ok_or(RtError::NotBuilt("top-level structure"))?;
        let region = slot % self.frame_slots.max(1);
        resources.write_buffer(
            built.instances,
            region as vk::DeviceSize * built.region_size,
            bytemuck::cast_slice(&self.instances),
        )?;

        let desc = built.desc_for_region(region);
        record_build(
            resources.device(),
            cmd,
            built,
            &desc,
            vk::BuildAccelerationStructureModeKHR::UPDATE,
        );
        self.dirty = false;
        trace!(slot, "refit recorded");
        Ok(true)
    }

    pub fn destroy<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        if let Some(built) = self.built.take() {
            resources.device().destroy_accel(built.accel);
            resources.destroy_buffer(built.buffer)?;
            resources.destroy_buffer(built.scratch)?;
            resources.destroy_buffer(built.instances)?;
        }
        self.dirty = false;
        Ok(())
    }
}

/// Host writes → build → ray traversal.
fn record_build<D: RtDevice>(
    device: &D,
    cmd: vk::CommandBuffer,
    built: &BuiltTlas,
    desc: &AccelBuildDesc,
    mode: vk::BuildAccelerationStructureModeKHR,
) {
    let src = if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
        built.accel
    } else {
        vk::AccelerationStructureKHR::null()
    };
    device.cmd_barrier(cmd, &Barrier::host_to_build());
    device.cmd_build_accel(
        cmd,
        &AccelBuild {
            desc,
            mode,
            src,
            dst: built.accel,
            scratch_address: built.scratch_address,
        },
    );
    device.cmd_barrier(cmd, &Barrier::build_to_read());
}
