//! Bottom-level acceleration structures.
//!
//! Descriptors are collected first and built together: sizes are queried up
//! front, one scratch buffer sized for the largest build is shared by every
//! build, and builds are submitted in batches whose cumulative structure size
//! stays under the configured limit. Each batch is waited on before the next
//! is recorded.

use std::ops::Range;

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::{debug, info, instrument, warn};

use crate::config::RtConfig;
use crate::device::{AccelBuild, AccelBuildDesc, AccelSizes, Barrier, BufferDesc, RtDevice};
use crate::error::{RtError, RtResult};
use crate::raytracing::geometry::{GeometryDescriptor, GeometryRegistry};
use crate::raytracing::sbt::align_up;
use crate::resources::{BufferId, ResourceManager};

/// A built bottom-level structure.
#[derive(Debug, Clone, Copy)]
pub struct BlasEntry {
    pub accel: vk::AccelerationStructureKHR,
    pub buffer: BufferId,
    pub device_address: vk::DeviceAddress,
    pub structure_size: vk::DeviceSize,
    /// Reported by the compacted-size query when enabled. Not acted on.
    pub compacted_size: Option<vk::DeviceSize>,
}

/// Statistics of one `build()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub batches: usize,
    pub entries: usize,
    pub scratch_size: vk::DeviceSize,
    pub structure_bytes: vk::DeviceSize,
}

pub struct BottomLevelBuilder {
    pending: Vec<AccelBuildDesc>,
    entries: Vec<BlasEntry>,
    batch_limit: vk::DeviceSize,
    query_compacted_sizes: bool,
    built: bool,
}

/// Flags every bottom-level build uses.
pub(crate) fn build_flags(query_compacted_sizes: bool) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        | vk::BuildAccelerationStructureFlagsKHR::ALLOW_DATA_ACCESS;
    if query_compacted_sizes {
        flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    flags
}

/// Split consecutive structure sizes into batches of at most `limit` bytes.
/// An entry larger than the limit gets a batch of its own.
pub fn plan_batches(sizes: &[vk::DeviceSize], limit: vk::DeviceSize) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut total: vk::DeviceSize = 0;

    for (i, &size) in sizes.iter().enumerate() {
        if i > start && total.saturating_add(size) > limit {
            batches.push(start..i);
            start = i;
            total = 0;
        }
        total = total.saturating_add(size);
    }
    if start < sizes.len() {
        batches.push(start..sizes.len());
    }
    batches
}

impl BottomLevelBuilder {
    pub fn new(config: &RtConfig) -> Self {
        Self {
            pending: Vec::new(),
            entries: Vec::new(),
            batch_limit: config.blas_batch_limit,
            query_compacted_sizes: config.query_compacted_sizes,
            built: false,
        }
    }

    /// Queue a descriptor. No GPU work happens until [`build`](Self::build).
    /// Returns the index its entry will have.
    pub fn add(&mut self, descriptor: &GeometryDescriptor) -> RtResult<u32> {
        if self.built {
            return Err(RtError::RegistryFrozen);
        }
        self.pending.push(AccelBuildDesc {
            geometry: descriptor.accel_geometry(),
            flags: build_flags(self.query_compacted_sizes),
        });
        Ok(self.pending.len() as u32 - 1)
    }

    /// Freeze `registry` and queue all of its descriptors, so entry indices
    /// match registry indices.
    pub fn add_all(&mut self, registry: &mut GeometryRegistry) -> RtResult<()> {
        registry.freeze();
        for descriptor in registry.descriptors() {
            self.add(descriptor)?;
        }
        Ok(())
    }

    /// Build every queued descriptor.
    ///
    /// The scratch buffer and query pool are released before returning,
    /// whether or not the build succeeded. Entries created before a failure
    /// stay owned by the builder and are released by [`destroy`](Self::destroy).
    #[instrument(skip_all, fields(pending = self.pending.len()))]
    pub fn build<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>) -> RtResult<BuildReport> {
        self.built = true;
        let descs = std::mem::take(&mut self.pending);
        if descs.is_empty() {
            warn!("no geometry to build");
            return Ok(BuildReport::default());
        }

        let sizes = descs
            .iter()
            .map(|desc| resources.device().accel_build_sizes(desc))
            .collect::<RtResult<Vec<AccelSizes>>>()?;

        let alignment = vk::DeviceSize::from(resources.device().properties().min_scratch_offset_alignment.max(1));
        let max_scratch = sizes.iter().map(|s| s.build_scratch_size).max().unwrap_or(0);
        let scratch_size = max_scratch + alignment;
        let scratch = resources.create_buffer(&BufferDesc {
            name: "blas_scratch",
            size: scratch_size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
        })?;

        let pool = if self.query_compacted_sizes {
            match resources.device().create_query_pool(descs.len() as u32) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    let _ = resources.destroy_buffer(scratch);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let result = resources
            .buffer(scratch)
            .and_then(|buffer| buffer.address())
            .map(|address| align_up(address, alignment))
            .and_then(|scratch_address| self.build_batches(resources, &descs, &sizes, scratch_address, pool));

        if let Some(pool) = pool {
            resources.device().destroy_query_pool(pool);
        }
        if let Err(e) = resources.destroy_buffer(scratch) {
            warn!(error = %e, "failed to release bottom-level scratch buffer");
        }

        let batches = result?;
        let report = BuildReport {
            batches,
            entries: self.entries.len(),
            scratch_size,
            structure_bytes: self.entries.iter().map(|e| e.structure_size).sum(),
        };
        info!(
            batches = report.batches,
            entries = report.entries,
            scratch_size = report.scratch_size,
            structure_bytes = report.structure_bytes,
            "bottom-level structures built"
        );
        Ok(report)
    }

    fn build_batches<D: RtDevice>(
        &mut self,
        resources: &mut ResourceManager<D>,
        descs: &[AccelBuildDesc],
        sizes: &[AccelSizes],
        scratch_address: vk::DeviceAddress,
        pool: Option<vk::QueryPool>,
    ) -> RtResult<usize> {
        let structure_sizes: Vec<vk::DeviceSize> = sizes.iter().map(|s| s.structure_size).collect();
        let batches = plan_batches(&structure_sizes, self.batch_limit);

        for (batch, range) in batches.iter().enumerate() {
            for i in range.clone() {
                let entry = Self::allocate(resources, sizes[i].structure_size)?;
                self.entries.push(entry);
            }

            let entries = &self.entries[range.clone()];
            resources.one_shot(|device, cmd| {
                if let Some(pool) = pool {
                    device.cmd_reset_query_pool(cmd, pool, range.start as u32, range.len() as u32);
                }
                for (i, entry) in range.clone().zip(entries) {
                    device.cmd_build_accel(
                        cmd,
                        &AccelBuild {
                            desc: &descs[i],
                            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                            src: vk::AccelerationStructureKHR::null(),
                            dst: entry.accel,
                            scratch_address,
                        },
                    );
                    // The next build reuses the scratch memory.
                    device.cmd_barrier(cmd, &Barrier::build_to_read());
                    if let Some(pool) = pool {
                        device.cmd_write_compacted_size(cmd, entry.accel, pool, i as u32);
                    }
                }
                Ok(())
            })
            .map_err(RtError::into_build_failure)?;

            if let Some(pool) = pool {
                let compacted = resources
                    .device()
                    .read_compacted_sizes(pool, range.start as u32, range.len() as u32)?;
                for (entry, size) in self.entries[range.clone()].iter_mut().zip(compacted) {
                    entry.compacted_size = Some(size);
                }
            }

            debug!(
                batch,
                entries = range.len(),
                bytes = structure_sizes[range.clone()].iter().sum::<vk::DeviceSize>(),
                "bottom-level batch submitted"
            );
        }

        Ok(batches.len())
    }

    fn allocate<D: RtDevice>(resources: &mut ResourceManager<D>, size: vk::DeviceSize) -> RtResult<BlasEntry> {
        let buffer = resources.create_buffer(&BufferDesc {
            name: "blas",
            size,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
        })?;
        let handle = resources.buffer(buffer)?.handle;

        let accel = match resources
            .device()
            .create_accel(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, handle, size)
        {
            Ok(accel) => accel,
            Err(e) => {
                let _ = resources.destroy_buffer(buffer);
                return Err(e);
            }
        };

        Ok(BlasEntry {
            accel,
            buffer,
            device_address: resources.device().accel_device_address(accel),
            structure_size: size,
            compacted_size: None,
        })
    }

    pub fn entries(&self) -> &[BlasEntry] {
        &self.entries
    }

    pub fn entry(&self, index: u32) -> RtResult<&BlasEntry> {
        self.entries
            .get(index as usize)
            .ok_or(RtError::NotBuilt("bottom-level structure"))
    }

    pub fn destroy<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        for entry in self.entries.drain(..) {
            resources.device().destroy_accel(entry.accel);
            resources.destroy_buffer(entry.buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockFailure};
    use crate::raytracing::geometry::TriangleMesh;

    fn config(limit: u64, queries: bool) -> RtConfig {
        RtConfig {
            blas_batch_limit: limit,
            query_compacted_sizes: queries,
            ..RtConfig::default()
        }
    }

    fn mesh(index_count: u32) -> GeometryDescriptor {
        GeometryDescriptor::Triangles(TriangleMesh {
            vertex_address: 0x1000,
            vertex_stride: 12,
            vertex_count: 8,
            index_address: 0x2000,
            index_count,
        })
    }

    // ========================================================================
    // Batch planning
    // ========================================================================

    #[test]
    fn test_plan_single_batch_under_limit() {
        assert_eq!(plan_batches(&[100, 200, 300], 1000), vec![0..3]);
    }

    #[test]
    fn test_plan_splits_at_limit() {
        assert_eq!(plan_batches(&[400, 400, 400], 1000), vec![0..2, 2..3]);
        assert_eq!(plan_batches(&[500, 500], 1000), vec![0..2]);
    }

    #[test]
    fn test_plan_oversize_entry_alone() {
        assert_eq!(plan_batches(&[100, 5000, 100], 1000), vec![0..1, 1..2, 2..3]);
        assert_eq!(plan_batches(&[5000], 1000), vec![0..1]);
        assert!(plan_batches(&[], 1000).is_empty());
    }

    #[test]
    fn test_flags() {
        let flags = build_flags(true);
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE));
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_DATA_ACCESS));
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
        assert!(!build_flags(false).contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
    }

    // ========================================================================
    // Builds
    // ========================================================================

    #[test]
    fn test_build_one_entry_per_descriptor() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut builder = BottomLevelBuilder::new(&config(256_000_000, true));
        for _ in 0..3 {
            builder.add(&mesh(12)).unwrap();
        }

        let report = builder.build(&mut res).unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.batches, 1);
        assert_eq!(res.device().one_shot_submissions(), 1);
        assert!(builder.entries().iter().all(|e| e.device_address != 0));
        assert!(builder.entries().iter().all(|e| e.compacted_size.is_some_and(|s| s > 0)));
        for entry in builder.entries() {
            assert_eq!(res.device().structure_build_counts(entry.accel), (1, 0));
        }
        assert!(res.device().violations().is_empty());
    }

    #[test]
    fn test_build_over_limit_uses_several_submissions() {
        let mut res = ResourceManager::new(MockDevice::new());
        // Each 4-triangle mesh needs 1024 bytes on the mock device.
        let mut builder = BottomLevelBuilder::new(&config(1500, true));
        for _ in 0..3 {
            builder.add(&mesh(12)).unwrap();
        }

        let report = builder.build(&mut res).unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.entries, 3);
        assert_eq!(res.device().one_shot_submissions(), 3);
        assert!(res.device().violations().is_empty());
    }

    #[test]
    fn test_scratch_and_queries_released() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut builder = BottomLevelBuilder::new(&config(256_000_000, true));
        builder.add(&mesh(12)).unwrap();
        builder.add(&mesh(36)).unwrap();
        builder.build(&mut res).unwrap();

        assert_eq!(res.live_buffers(), 2);
        assert_eq!(res.device().live_count("query_pool"), 0);
        assert_eq!(res.device().live_count("accel"), 2);
    }

    #[test]
    fn test_without_queries_no_compacted_sizes() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut builder = BottomLevelBuilder::new(&config(256_000_000, false));
        builder.add(&mesh(12)).unwrap();
        builder.build(&mut res).unwrap();
        assert_eq!(builder.entries()[0].compacted_size, None);
    }

    #[test]
    fn test_failed_submission_cleans_up_temporaries() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut builder = BottomLevelBuilder::new(&config(256_000_000, true));
        builder.add(&mesh(12)).unwrap();
        res.device().fail_next(MockFailure::OneShotSubmit);

        assert!(matches!(builder.build(&mut res), Err(RtError::Build(_))));
        assert_eq!(res.device().live_count("query_pool"), 0);
        // Only the entry's own buffer is left for destroy().
        assert_eq!(res.live_buffers(), 1);
        builder.destroy(&mut res).unwrap();
        assert!(res.device().live_objects().is_empty());
    }

    #[test]
    fn test_failed_size_query_aborts_before_allocation() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut builder = BottomLevelBuilder::new(&config(256_000_000, true));
        builder.add(&mesh(12)).unwrap();
        res.device().fail_next(MockFailure::BuildSizes);

        assert!(matches!(builder.build(&mut res), Err(RtError::Query { .. })));
        assert_eq!(res.live_buffers(), 0);
    }

    #[test]
    fn test_add_all_freezes_registry() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut registry = GeometryRegistry::new();
        registry.add_volume(&mut res, [2, 2, 2], &[1; 8]).unwrap();
        let mut builder = BottomLevelBuilder::new(&config(256_000_000, true));
        builder.add_all(&mut registry).unwrap();
        assert!(registry.is_frozen());

        builder.build(&mut res).unwrap();
        assert!(matches!(builder.add(&mesh(3)), Err(RtError::RegistryFrozen)));
        assert!(builder.entry(0).is_ok());
        assert!(builder.entry(1).is_err());
    }
}
