//! Shader binding table.

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::device::{BufferDesc, DeviceProperties, RtDevice, SbtRegions};
use crate::error::{RtError, RtResult};
use crate::raytracing::pipeline::RegionCounts;
use crate::resources::{BufferId, ResourceManager};

/// Round `value` up to a multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Placement of one region inside the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionLayout {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
    pub count: u32,
}

/// Byte layout of the table, independent of where it is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    /// Handle size rounded to the handle alignment.
    pub record_stride: u64,
    pub base_alignment: u64,
    pub raygen: RegionLayout,
    pub miss: RegionLayout,
    pub hit: RegionLayout,
    pub callable: RegionLayout,
    pub total_size: u64,
}

impl SbtLayout {
    pub fn compute(props: &DeviceProperties, counts: RegionCounts) -> Self {
        let handle_size = u64::from(props.shader_group_handle_size);
        let base_alignment = u64::from(props.shader_group_base_alignment);
        let record_stride = align_up(handle_size, u64::from(props.shader_group_handle_alignment));

        // Raygen's stride must equal its size.
        let raygen_size = align_up(record_stride, base_alignment);
        let raygen = RegionLayout {
            offset: 0,
            stride: raygen_size,
            size: raygen_size,
            count: counts.raygen,
        };

        let region = |offset: u64, count: u32| {
            if count == 0 {
                return RegionLayout {
                    offset,
                    ..RegionLayout::default()
                };
            }
            RegionLayout {
                offset,
                stride: record_stride,
                size: align_up(u64::from(count) * record_stride, base_alignment),
                count,
            }
        };
        let miss = region(raygen.offset + raygen.size, counts.miss);
        let hit = region(miss.offset + miss.size, counts.hit);
        let callable = region(hit.offset + hit.size, counts.callable);

        Self {
            handle_size,
            record_stride,
            base_alignment,
            raygen,
            miss,
            hit,
            callable,
            total_size: callable.offset + callable.size,
        }
    }

    /// Lay `handles` (one per group, in group order) out into table bytes.
    pub fn fill(&self, handles: &[u8]) -> RtResult<Vec<u8>> {
        let groups = self.raygen.count + self.miss.count + self.hit.count + self.callable.count;
        let handle_size = self.handle_size as usize;
        if handles.len() != groups as usize * handle_size {
            return Err(RtError::InvalidShaderTable(format!(
                "expected {} handle bytes for {groups} groups, got {}",
                groups as usize * handle_size,
                handles.len()
            )));
        }

        let mut bytes = vec![0u8; self.total_size as usize];
        let mut chunks = handles.chunks_exact(handle_size);
        for region in [&self.raygen, &self.miss, &self.hit, &self.callable] {
            for record in 0..region.count as u64 {
                let Some(handle) = chunks.next() else {
                    break;
                };
                let start = (region.offset + record * region.stride) as usize;
                bytes[start..start + handle_size].copy_from_slice(handle);
            }
        }
        Ok(bytes)
    }

    /// Strided regions for a table whose first byte is at `base`.
    pub fn regions(&self, base: vk::DeviceAddress) -> SbtRegions {
        let strided = |region: &RegionLayout| {
            if region.size == 0 {
                return vk::StridedDeviceAddressRegionKHR::default();
            }
            vk::StridedDeviceAddressRegionKHR {
                device_address: base + region.offset,
                stride: region.stride,
                size: region.size,
            }
        };
        SbtRegions {
            raygen: strided(&self.raygen),
            miss: strided(&self.miss),
            hit: strided(&self.hit),
            callable: strided(&self.callable),
        }
    }
}

/// Host-visible table filled once from the pipeline's group handles.
pub struct ShaderBindingTable {
    buffer: BufferId,
    layout: SbtLayout,
    regions: SbtRegions,
}

impl ShaderBindingTable {
    pub fn new<D: RtDevice>(
        resources: &mut ResourceManager<D>,
        pipeline: vk::Pipeline,
        counts: RegionCounts,
    ) -> RtResult<Self> {
        let layout = SbtLayout::compute(resources.device().properties(), counts);
        let handles = resources.device().shader_group_handles(pipeline, counts.total())?;
        let bytes = layout.fill(&handles)?;

        // Over-allocate so the table can start on a base-aligned address.
        let buffer = resources.create_buffer(&BufferDesc {
            name: "shader_binding_table",
            size: layout.total_size + layout.base_alignment,
            usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::CpuToGpu,
        })?;

        let placed = resources.buffer(buffer).and_then(|b| b.address()).and_then(|address| {
            let base = align_up(address, layout.base_alignment);
            resources.write_buffer(buffer, base - address, &bytes)?;
            Ok(base)
        });
        let base = match placed {
            Ok(base) => base,
            Err(e) => {
                let _ = resources.destroy_buffer(buffer);
                return Err(e);
            }
        };

        debug!(
            size = layout.total_size,
            stride = layout.record_stride,
            base,
            "shader binding table written"
        );
        Ok(Self {
            buffer,
            layout,
            regions: layout.regions(base),
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Record a `width × height × 1` dispatch.
    pub fn trace_rays<D: RtDevice>(&self, device: &D, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        device.cmd_trace_rays(cmd, &self.regions, extent);
    }

    pub fn destroy<D: RtDevice>(self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        resources.destroy_buffer(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn props(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> DeviceProperties {
        DeviceProperties {
            device_name: "test".into(),
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            max_ray_recursion_depth: 31,
            min_scratch_offset_alignment: 128,
        }
    }

    fn counts() -> RegionCounts {
        RegionCounts {
            raygen: 1,
            miss: 2,
            hit: 2,
            callable: 0,
        }
    }

    // ========================================================================
    // Layout
    // ========================================================================

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(17, 0), 17);
    }

    #[test]
    fn test_layout_common_device() {
        let layout = SbtLayout::compute(&props(32, 32, 64), counts());
        assert_eq!(layout.record_stride, 32);
        assert_eq!(layout.raygen.size, 64);
        assert_eq!(layout.raygen.stride, layout.raygen.size);
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.miss.size, 64);
        assert_eq!(layout.hit.offset, 128);
        assert_eq!(layout.hit.size, 64);
        assert_eq!(layout.callable.size, 0);
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn test_regions_are_alignment_multiples() {
        for (size, handle_align, base_align) in [(32, 32, 64), (16, 64, 64), (32, 16, 128), (48, 32, 256)] {
            let p = props(size, handle_align, base_align);
            let layout = SbtLayout::compute(&p, counts());
            let base = u64::from(base_align);
            for region in [layout.raygen, layout.miss, layout.hit] {
                assert_eq!(region.size % base, 0);
                assert_eq!(region.offset % base, 0);
                assert_eq!(region.stride % u64::from(handle_align), 0);
            }
            assert_eq!(layout.raygen.size, align_up(layout.record_stride, base));
        }
    }

    #[test]
    fn test_fill_places_handles_in_group_order() {
        let layout = SbtLayout::compute(&props(4, 8, 16), counts());
        let handles: Vec<u8> = (1..=5u8).flat_map(|g| [g; 4]).collect();
        let bytes = layout.fill(&handles).unwrap();

        assert_eq!(&bytes[0..4], &[1; 4]);
        assert_eq!(&bytes[16..20], &[2; 4]);
        assert_eq!(&bytes[24..28], &[3; 4]);
        assert_eq!(&bytes[32..36], &[4; 4]);
        assert_eq!(&bytes[40..44], &[5; 4]);
        assert_eq!(&bytes[4..16], &[0; 12]);
    }

    #[test]
    fn test_fill_rejects_wrong_handle_blob() {
        let layout = SbtLayout::compute(&props(32, 32, 64), counts());
        assert!(matches!(layout.fill(&[0; 31]), Err(RtError::InvalidShaderTable(_))));
    }

    #[test]
    fn test_empty_region_has_null_address() {
        let layout = SbtLayout::compute(&props(32, 32, 64), counts());
        let regions = layout.regions(0x10000);
        assert_eq!(regions.raygen.device_address, 0x10000);
        assert_eq!(regions.hit.device_address, 0x10000 + 128);
        assert_eq!(regions.callable.device_address, 0);
        assert_eq!(regions.callable.size, 0);
    }

    // ========================================================================
    // Table
    // ========================================================================

    #[test]
    fn test_table_is_base_aligned_and_filled() {
        let mut res = ResourceManager::new(MockDevice::new());
        let sbt = ShaderBindingTable::new(&mut res, vk::Pipeline::null(), counts()).unwrap();
        let regions = *sbt.regions();
        assert_eq!(regions.raygen.device_address % 64, 0);
        assert_eq!(regions.miss.device_address, regions.raygen.device_address + 64);

        let buffer = res.buffer(sbt.buffer()).unwrap();
        let data = res.device().buffer_data(buffer.handle).unwrap();
        let offset = (regions.hit.device_address - buffer.device_address.unwrap()) as usize;
        // Mock handles are filled with group index + 1; hit groups are 3 and 4.
        assert_eq!(&data[offset..offset + 32], &[4; 32]);
        assert_eq!(&data[offset + 32..offset + 64], &[5; 32]);

        sbt.destroy(&mut res).unwrap();
        assert_eq!(res.live_buffers(), 0);
    }
}
