//! Headless [`RtDevice`] used by the tests.
//!
//! Handles and device addresses are fabricated. Host-visible and
//! transfer-destination buffers keep their bytes, so copies and instance
//! uploads can be inspected. Submitted command buffers are "executed" on the
//! spot: structure builds snapshot their instance input, dispatches snapshot
//! the descriptors they would read. Fences only signal once waited on after a
//! submission, which lets tests observe frames that are still in flight.

use std::collections::{BTreeMap, HashMap, HashSet};

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::device::{
    Acquire, AccelBuild, AccelBuildDesc, AccelGeometry, AccelSizes, Barrier, BufferDesc, DescriptorWrite,
    DeviceProperties, FrameSubmit, ImageDesc, LayoutBinding, Present, PresentTarget, RawBuffer, RawImage,
    RtDevice, RtPipelineDesc, SbtRegions,
};
use crate::error::{RtError, RtResult};
use crate::raytracing::tlas::InstanceRecord;

const ADDRESS_BASE: u64 = 0x1_0000;
const ADDRESS_ALIGN: u64 = 256;
const TARGET_IMAGE_COUNT: usize = 3;

/// Command as recorded into a mock command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    Barrier(Barrier),
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, size: u64 },
    CopyBufferToImage { src: vk::Buffer, dst: vk::Image },
    CopyImage { src: vk::Image, dst: vk::Image, extent: vk::Extent2D },
    BuildAccel {
        geometry: AccelGeometry,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        mode: vk::BuildAccelerationStructureModeKHR,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        scratch_address: u64,
    },
    ResetQueries { pool: vk::QueryPool, first: u32, count: u32 },
    WriteCompactedSize { accel: vk::AccelerationStructureKHR, pool: vk::QueryPool, query: u32 },
    BindPipeline(vk::Pipeline),
    BindDescriptorSets { first_set: u32, sets: Vec<vk::DescriptorSet> },
    TraceRays { extent: vk::Extent2D },
}

/// A ray dispatch as executed, with the storage image it wrote.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub extent: vk::Extent2D,
    pub sets: Vec<vk::DescriptorSet>,
    /// Views bound at binding 1 of the ray-tracing set when the dispatch ran.
    pub output_views: Vec<vk::ImageView>,
    /// Top-level structure bound at binding 0.
    pub accel: Option<vk::AccelerationStructureKHR>,
}

/// A frame submission as executed.
#[derive(Debug, Clone)]
pub struct SubmittedFrame {
    pub cmd: vk::CommandBuffer,
    pub commands: Vec<MockCommand>,
    pub wait: vk::Semaphore,
    pub signal: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Calls that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    CreateBuffer,
    CreateImage,
    CreateAccel,
    BuildSizes,
    /// The next one-shot submission fails.
    OneShotSubmit,
    /// The next frame submission reports device loss.
    SubmitDeviceLost,
    /// The next frame submission is rejected by the queue.
    FrameSubmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

struct MockBuffer {
    size: u64,
    address: Option<u64>,
    mapped: bool,
    data: Option<Vec<u8>>,
}

struct MockAccel {
    ty: vk::AccelerationStructureTypeKHR,
    address: u64,
    flags: Option<vk::BuildAccelerationStructureFlagsKHR>,
    geometry: Option<AccelGeometry>,
    builds: u32,
    refits: u32,
    instances: Vec<InstanceRecord>,
}

struct MockState {
    next_handle: u64,
    next_address: u64,
    live: HashMap<&'static str, HashSet<u64>>,
    buffers: HashMap<u64, MockBuffer>,
    address_ranges: BTreeMap<u64, u64>,
    image_views: HashMap<u64, u64>,
    accels: HashMap<u64, MockAccel>,
    recording: HashMap<u64, Vec<MockCommand>>,
    query_results: HashMap<u64, Vec<u64>>,
    descriptor_sets: HashMap<u64, BTreeMap<u32, DescriptorWrite>>,
    set_layouts: HashMap<u64, Vec<u32>>,
    declared_bindings: HashMap<u64, Vec<u32>>,
    fences: HashMap<u64, FenceState>,
    in_flight_cmds: HashMap<u64, u64>,
    one_shot_submissions: usize,
    frames: Vec<SubmittedFrame>,
    dispatches: Vec<DispatchRecord>,
    violations: Vec<String>,
    failure: Option<MockFailure>,
    target: PresentTarget,
    target_stale: bool,
    next_image: u32,
    target_recreations: usize,
}

impl MockState {
    fn create(&mut self, kind: &'static str) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.entry(kind).or_default().insert(raw);
        raw
    }

    fn release(&mut self, kind: &'static str, raw: u64) {
        let removed = self.live.get_mut(kind).map(|set| set.remove(&raw)).unwrap_or(false);
        if !removed {
            self.violations.push(format!("destroyed unknown {kind} {raw:#x}"));
        }
    }

    fn take_failure(&mut self, which: MockFailure) -> bool {
        if self.failure == Some(which) {
            self.failure = None;
            true
        } else {
            false
        }
    }

    fn reserve_address(&mut self, size: u64, buffer: u64) -> u64 {
        let address = self.next_address;
        self.next_address += align(size.max(1), ADDRESS_ALIGN) + ADDRESS_ALIGN;
        self.address_ranges.insert(address, buffer);
        address
    }

    /// Buffer containing `address`, with the offset into it.
    fn resolve_address(&self, address: u64) -> Option<(u64, u64)> {
        let (&start, &buffer) = self.address_ranges.range(..=address).next_back()?;
        let size = self.buffers.get(&buffer)?.size;
        (address < start + size).then_some((buffer, address - start))
    }

    fn new_target_images(&mut self) -> Vec<vk::Image> {
        (0..TARGET_IMAGE_COUNT)
            .map(|_| vk::Image::from_raw(self.create("target_image")))
            .collect()
    }

    fn execute(&mut self, commands: &[MockCommand]) {
        let mut bound_sets: Vec<vk::DescriptorSet> = Vec::new();
        for command in commands {
            match command {
                MockCommand::CopyBuffer { src, dst, size } => self.copy_buffer(*src, *dst, *size),
                MockCommand::BuildAccel {
                    geometry,
                    flags,
                    mode,
                    src,
                    dst,
                    scratch_address,
                } => self.build_accel(*geometry, *flags, *mode, *src, *dst, *scratch_address),
                MockCommand::ResetQueries { pool, first, count } => {
                    if let Some(results) = self.query_results.get_mut(&pool.as_raw()) {
                        for slot in results.iter_mut().skip(*first as usize).take(*count as usize) {
                            *slot = 0;
                        }
                    }
                }
                MockCommand::WriteCompactedSize { accel, pool, query } => {
                    let size = self
                        .accels
                        .get(&accel.as_raw())
                        .and_then(|a| a.geometry)
                        .map(|g| compacted_size(&g))
                        .unwrap_or(0);
                    match self.query_results.get_mut(&pool.as_raw()) {
                        Some(results) if (*query as usize) < results.len() => results[*query as usize] = size,
                        _ => self.violations.push(format!("query {query} outside pool {:#x}", pool.as_raw())),
                    }
                }
                MockCommand::BindDescriptorSets { first_set, sets } => {
                    let first = *first_set as usize;
                    if bound_sets.len() < first + sets.len() {
                        bound_sets.resize(first + sets.len(), vk::DescriptorSet::null());
                    }
                    bound_sets[first..first + sets.len()].copy_from_slice(sets);
                }
                MockCommand::TraceRays { extent } => {
                    let rt_set = bound_sets.get(1).copied().unwrap_or_default();
                    let writes = self.descriptor_sets.get(&rt_set.as_raw());
                    let output_views = writes
                        .and_then(|w| w.get(&1))
                        .map(|w| match w {
                            DescriptorWrite::StorageImages { views, .. } => views.clone(),
                            _ => Vec::new(),
                        })
                        .unwrap_or_default();
                    let accel = writes.and_then(|w| w.get(&0)).and_then(|w| match w {
                        DescriptorWrite::AccelerationStructure { accel, .. } => Some(*accel),
                        _ => None,
                    });
                    let declared = self.declared_bindings.get(&rt_set.as_raw()).cloned().unwrap_or_default();
                    for binding in declared {
                        if !writes.is_some_and(|w| w.contains_key(&binding)) {
                            self.violations.push(format!("dispatch reads unwritten binding {binding}"));
                        }
                    }
                    let storage_views = writes
                        .into_iter()
                        .flat_map(|w| w.values())
                        .filter_map(|w| match w {
                            DescriptorWrite::StorageImages { views, .. } => Some(views.iter().copied()),
                            _ => None,
                        })
                        .flatten()
                        .collect::<Vec<_>>();
                    for view in storage_views {
                        if !self.live.get("image_view").is_some_and(|s| s.contains(&view.as_raw())) {
                            self.violations.push(format!("dispatch reads freed image view {:#x}", view.as_raw()));
                        }
                    }
                    self.dispatches.push(DispatchRecord {
                        extent: *extent,
                        sets: bound_sets.clone(),
                        output_views,
                        accel,
                    });
                }
                MockCommand::Barrier(_)
                | MockCommand::CopyBufferToImage { .. }
                | MockCommand::CopyImage { .. }
                | MockCommand::BindPipeline(_) => {}
            }
        }
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        let bytes = self
            .buffers
            .get(&src.as_raw())
            .and_then(|b| b.data.as_ref())
            .map(|d| d[..(size as usize).min(d.len())].to_vec());
        match (bytes, self.buffers.get_mut(&dst.as_raw())) {
            (Some(bytes), Some(dst)) => {
                if let Some(data) = dst.data.as_mut() {
                    let n = bytes.len().min(data.len());
                    data[..n].copy_from_slice(&bytes[..n]);
                }
            }
            _ => self.violations.push(format!("copy between unknown buffers {:#x} -> {:#x}", src.as_raw(), dst.as_raw())),
        }
    }

    fn build_accel(
        &mut self,
        geometry: AccelGeometry,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        mode: vk::BuildAccelerationStructureModeKHR,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        scratch_address: u64,
    ) {
        if self.resolve_address(scratch_address).is_none() {
            self.violations.push(format!("build uses unbacked scratch address {scratch_address:#x}"));
        }

        let instances = match geometry {
            AccelGeometry::Instances { address, count } => self.read_instances(address, count),
            _ => Vec::new(),
        };

        if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            let ok = self.accels.get(&src.as_raw()).is_some_and(|s| {
                s.builds > 0
                    && s.flags.is_some_and(|f| f.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE))
                    && s.geometry.map(|g| g.primitive_count()) == Some(geometry.primitive_count())
            });
            if !ok {
                self.violations.push(format!("invalid refit source {:#x}", src.as_raw()));
            }
        }

        let Some(accel) = self.accels.get_mut(&dst.as_raw()) else {
            self.violations.push(format!("build into unknown structure {:#x}", dst.as_raw()));
            return;
        };
        if accel.ty != geometry.structure_type() {
            self.violations.push(format!("structure type mismatch for {:#x}", dst.as_raw()));
        }
        accel.flags = Some(flags);
        accel.geometry = Some(geometry);
        accel.instances = instances;
        if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            accel.refits += 1;
        } else {
            accel.builds += 1;
        }
    }

    fn read_instances(&mut self, address: u64, count: u32) -> Vec<InstanceRecord> {
        let size = std::mem::size_of::<InstanceRecord>();
        let Some((buffer, offset)) = self.resolve_address(address) else {
            self.violations.push(format!("instance address {address:#x} is not backed"));
            return Vec::new();
        };
        let Some(data) = self.buffers.get(&buffer).and_then(|b| b.data.as_ref()) else {
            self.violations.push("instance buffer is not host visible".to_string());
            return Vec::new();
        };
        let start = offset as usize;
        let end = start + size * count as usize;
        if end > data.len() {
            self.violations.push("instance read past end of buffer".to_string());
            return Vec::new();
        }
        data[start..end]
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned::<InstanceRecord>)
            .collect()
    }
}

/// Test double for [`RtDevice`].
pub struct MockDevice {
    props: DeviceProperties,
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_properties(DeviceProperties {
            device_name: "mock".into(),
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 31,
            min_scratch_offset_alignment: 128,
        })
    }

    pub fn with_properties(props: DeviceProperties) -> Self {
        let mut state = MockState {
            next_handle: 0,
            next_address: ADDRESS_BASE,
            live: HashMap::new(),
            buffers: HashMap::new(),
            address_ranges: BTreeMap::new(),
            image_views: HashMap::new(),
            accels: HashMap::new(),
            recording: HashMap::new(),
            query_results: HashMap::new(),
            descriptor_sets: HashMap::new(),
            set_layouts: HashMap::new(),
            declared_bindings: HashMap::new(),
            fences: HashMap::new(),
            in_flight_cmds: HashMap::new(),
            one_shot_submissions: 0,
            frames: Vec::new(),
            dispatches: Vec::new(),
            violations: Vec::new(),
            failure: None,
            target: PresentTarget {
                images: Vec::new(),
                format: vk::Format::B8G8R8A8_UNORM,
                extent: vk::Extent2D { width: 640, height: 480 },
            },
            target_stale: false,
            next_image: 0,
            target_recreations: 0,
        };
        state.target.images = state.new_target_images();
        Self {
            props,
            state: Mutex::new(state),
        }
    }

    /// Make the next matching call fail.
    pub fn fail_next(&self, failure: MockFailure) {
        self.state.lock().failure = Some(failure);
    }

    /// Invalidate the presentation target until it is recreated.
    pub fn force_stale(&self) {
        self.state.lock().target_stale = true;
    }

    pub fn one_shot_submissions(&self) -> usize {
        self.state.lock().one_shot_submissions
    }

    pub fn frames(&self) -> Vec<SubmittedFrame> {
        self.state.lock().frames.clone()
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state.lock().dispatches.clone()
    }

    /// Misuse detected so far: re-recording in-flight command buffers, bad
    /// refits, freed resources read by dispatches, double frees.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn target_recreations(&self) -> usize {
        self.state.lock().target_recreations
    }

    pub fn live_count(&self, kind: &str) -> usize {
        self.state.lock().live.get(kind).map_or(0, |s| s.len())
    }

    /// Live objects of every kind except the presentation target's images.
    pub fn live_objects(&self) -> BTreeMap<&'static str, usize> {
        self.state
            .lock()
            .live
            .iter()
            .filter(|(kind, set)| **kind != "target_image" && !set.is_empty())
            .map(|(kind, set)| (*kind, set.len()))
            .collect()
    }

    pub fn buffer_data(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.as_raw()).and_then(|b| b.data.clone())
    }

    /// Instances captured by the latest build or refit of `accel`.
    pub fn structure_instances(&self, accel: vk::AccelerationStructureKHR) -> Vec<InstanceRecord> {
        self.state
            .lock()
            .accels
            .get(&accel.as_raw())
            .map(|a| a.instances.clone())
            .unwrap_or_default()
    }

    /// `(full builds, refits)` executed for `accel`.
    pub fn structure_build_counts(&self, accel: vk::AccelerationStructureKHR) -> (u32, u32) {
        self.state
            .lock()
            .accels
            .get(&accel.as_raw())
            .map_or((0, 0), |a| (a.builds, a.refits))
    }

    pub fn structure_geometry(&self, accel: vk::AccelerationStructureKHR) -> Option<AccelGeometry> {
        self.state.lock().accels.get(&accel.as_raw()).and_then(|a| a.geometry)
    }

    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        self.state
            .lock()
            .descriptor_sets
            .get(&set.as_raw())
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_live_view(&self, view: vk::ImageView) -> bool {
        self.state
            .lock()
            .live
            .get("image_view")
            .is_some_and(|s| s.contains(&view.as_raw()))
    }

    /// Commands recorded into `cmd` since it was last begun.
    pub fn recorded(&self, cmd: vk::CommandBuffer) -> Vec<MockCommand> {
        self.state.lock().recording.get(&cmd.as_raw()).cloned().unwrap_or_default()
    }

    fn record(&self, cmd: vk::CommandBuffer, command: MockCommand) {
        let mut state = self.state.lock();
        if let Some(list) = state.recording.get_mut(&cmd.as_raw()) {
            list.push(command);
            return;
        }
        state
            .violations
            .push(format!("recording into command buffer {:#x} that was not begun", cmd.as_raw()));
    }
}

impl RtDevice for MockDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RtResult<RawBuffer> {
        let mut state = self.state.lock();
        if state.take_failure(MockFailure::CreateBuffer) {
            return Err(RtError::resource(desc.name, "ERROR_OUT_OF_DEVICE_MEMORY"));
        }
        if desc.size == 0 {
            return Err(RtError::resource(desc.name, "zero-sized buffer"));
        }

        let raw = state.create("buffer");
        let mapped = desc.location != MemoryLocation::GpuOnly;
        let keeps_data = mapped || desc.usage.contains(vk::BufferUsageFlags::TRANSFER_DST);
        let address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| state.reserve_address(desc.size, raw));
        state.buffers.insert(
            raw,
            MockBuffer {
                size: desc.size,
                address,
                mapped,
                data: keeps_data.then(|| vec![0u8; desc.size as usize]),
            },
        );

        Ok(RawBuffer {
            handle: vk::Buffer::from_raw(raw),
            size: desc.size,
            device_address: address,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.release("buffer", buffer.as_raw());
        if let Some(removed) = state.buffers.remove(&buffer.as_raw()) {
            if let Some(address) = removed.address {
                state.address_ranges.remove(&address);
            }
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> RtResult<()> {
        let mut state = self.state.lock();
        let target = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| RtError::resource("buffer write", "unknown buffer"))?;
        if !target.mapped {
            return Err(RtError::resource("buffer write", "buffer is not host visible"));
        }
        let start = offset as usize;
        let end = start + data.len();
        let bytes = target
            .data
            .as_mut()
            .filter(|d| end <= d.len())
            .ok_or_else(|| RtError::resource("buffer write", "write out of bounds"))?;
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> RtResult<RawImage> {
        let mut state = self.state.lock();
        if state.take_failure(MockFailure::CreateImage) {
            return Err(RtError::resource(desc.name, "ERROR_OUT_OF_DEVICE_MEMORY"));
        }
        let image = state.create("image");
        let view = state.create("image_view");
        state.image_views.insert(view, image);
        Ok(RawImage {
            handle: vk::Image::from_raw(image),
            view: vk::ImageView::from_raw(view),
        })
    }

    fn destroy_image(&self, image: RawImage) {
        let mut state = self.state.lock();
        state.release("image_view", image.view.as_raw());
        state.release("image", image.handle.as_raw());
        state.image_views.remove(&image.view.as_raw());
    }

    fn create_sampler(&self) -> RtResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.state.lock().create("sampler")))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().release("sampler", sampler.as_raw());
    }

    fn begin_one_shot(&self) -> RtResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let raw = state.create("one_shot_cmd");
        state.recording.insert(raw, Vec::new());
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn submit_one_shot(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        let mut state = self.state.lock();
        let commands = state.recording.remove(&cmd.as_raw()).unwrap_or_default();
        state.release("one_shot_cmd", cmd.as_raw());
        if state.take_failure(MockFailure::OneShotSubmit) {
            return Err(RtError::submit("one-shot", "ERROR_OUT_OF_DEVICE_MEMORY"));
        }
        state.one_shot_submissions += 1;
        state.execute(&commands);
        Ok(())
    }

    fn abandon_one_shot(&self, cmd: vk::CommandBuffer) {
        let mut state = self.state.lock();
        state.recording.remove(&cmd.as_raw());
        state.release("one_shot_cmd", cmd.as_raw());
    }

    fn allocate_command_buffers(&self, count: u32) -> RtResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.create("command_buffer")))
            .collect())
    }

    fn free_command_buffers(&self, cmds: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in cmds {
            state.release("command_buffer", cmd.as_raw());
            state.recording.remove(&cmd.as_raw());
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RtResult<()> {
        let mut state = self.state.lock();
        let in_flight = state
            .in_flight_cmds
            .get(&cmd.as_raw())
            .copied()
            .is_some_and(|fence| state.fences.get(&fence) == Some(&FenceState::Pending));
        if in_flight {
            state
                .violations
                .push(format!("command buffer {:#x} re-recorded while in flight", cmd.as_raw()));
            return Err(RtError::SlotInFlight(0));
        }
        state.recording.insert(cmd.as_raw(), Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> RtResult<()> {
        Ok(())
    }

    fn cmd_barrier(&self, cmd: vk::CommandBuffer, barrier: &Barrier) {
        self.record(cmd, MockCommand::Barrier(*barrier));
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        self.record(cmd, MockCommand::CopyBuffer { src, dst, size });
    }

    fn cmd_copy_buffer_to_image(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Image, _extent: vk::Extent3D) {
        self.record(cmd, MockCommand::CopyBufferToImage { src, dst });
    }

    fn cmd_copy_image(&self, cmd: vk::CommandBuffer, src: vk::Image, dst: vk::Image, extent: vk::Extent2D) {
        self.record(cmd, MockCommand::CopyImage { src, dst, extent });
    }

    fn accel_build_sizes(&self, desc: &AccelBuildDesc) -> RtResult<AccelSizes> {
        if self.state.lock().take_failure(MockFailure::BuildSizes) {
            return Err(RtError::query("acceleration structure build sizes", "ERROR_UNKNOWN"));
        }
        Ok(build_sizes(&desc.geometry))
    }

    fn create_accel(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RtResult<vk::AccelerationStructureKHR> {
        let mut state = self.state.lock();
        if state.take_failure(MockFailure::CreateAccel) {
            return Err(RtError::resource("acceleration structure", "ERROR_OUT_OF_DEVICE_MEMORY"));
        }
        let backing = state
            .buffers
            .get(&buffer.as_raw())
            .ok_or_else(|| RtError::resource("acceleration structure", "unknown backing buffer"))?;
        if backing.size < size {
            return Err(RtError::resource("acceleration structure", "backing buffer too small"));
        }
        let address = backing
            .address
            .ok_or_else(|| RtError::resource("acceleration structure", "backing buffer has no device address"))?;
        let raw = state.create("accel");
        state.accels.insert(
            raw,
            MockAccel {
                ty,
                address,
                flags: None,
                geometry: None,
                builds: 0,
                refits: 0,
                instances: Vec::new(),
            },
        );
        Ok(vk::AccelerationStructureKHR::from_raw(raw))
    }

    fn accel_device_address(&self, accel: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        self.state.lock().accels.get(&accel.as_raw()).map_or(0, |a| a.address)
    }

    fn destroy_accel(&self, accel: vk::AccelerationStructureKHR) {
        let mut state = self.state.lock();
        state.release("accel", accel.as_raw());
        state.accels.remove(&accel.as_raw());
    }

    fn cmd_build_accel(&self, cmd: vk::CommandBuffer, build: &AccelBuild) {
        self.record(
            cmd,
            MockCommand::BuildAccel {
                geometry: build.desc.geometry,
                flags: build.desc.flags,
                mode: build.mode,
                src: build.src,
                dst: build.dst,
                scratch_address: build.scratch_address,
            },
        );
    }

    fn create_query_pool(&self, count: u32) -> RtResult<vk::QueryPool> {
        let mut state = self.state.lock();
        let raw = state.create("query_pool");
        state.query_results.insert(raw, vec![0; count as usize]);
        Ok(vk::QueryPool::from_raw(raw))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        let mut state = self.state.lock();
        state.release("query_pool", pool.as_raw());
        state.query_results.remove(&pool.as_raw());
    }

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        self.record(cmd, MockCommand::ResetQueries { pool, first, count });
    }

    fn cmd_write_compacted_size(
        &self,
        cmd: vk::CommandBuffer,
        accel: vk::AccelerationStructureKHR,
        pool: vk::QueryPool,
        query: u32,
    ) {
        self.record(cmd, MockCommand::WriteCompactedSize { accel, pool, query });
    }

    fn read_compacted_sizes(&self, pool: vk::QueryPool, first: u32, count: u32) -> RtResult<Vec<u64>> {
        let state = self.state.lock();
        let results = state
            .query_results
            .get(&pool.as_raw())
            .ok_or_else(|| RtError::query("compacted sizes", "unknown query pool"))?;
        let range = first as usize..(first + count) as usize;
        results
            .get(range)
            .map(|r| r.to_vec())
            .ok_or_else(|| RtError::query("compacted sizes", "range outside pool"))
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> RtResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        for binding in bindings.iter().filter(|b| b.count == 0) {
            state
                .violations
                .push(format!("layout binding {} declares zero descriptors", binding.binding));
        }
        let raw = state.create("descriptor_set_layout");
        state.set_layouts.insert(raw, bindings.iter().map(|b| b.binding).collect());
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().release("descriptor_set_layout", layout.as_raw());
    }

    fn create_descriptor_pool(&self, _sizes: &[vk::DescriptorPoolSize], _max_sets: u32) -> RtResult<vk::DescriptorPool> {
        Ok(vk::DescriptorPool::from_raw(self.state.lock().create("descriptor_pool")))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().release("descriptor_pool", pool.as_raw());
    }

    fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> RtResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        let declared = state.set_layouts.get(&layout.as_raw()).cloned().unwrap_or_default();
        Ok((0..count)
            .map(|_| {
                state.next_handle += 1;
                let raw = state.next_handle;
                state.descriptor_sets.insert(raw, BTreeMap::new());
                state.declared_bindings.insert(raw, declared.clone());
                vk::DescriptorSet::from_raw(raw)
            })
            .collect())
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        if let Some(bindings) = state.descriptor_sets.get_mut(&set.as_raw()) {
            for write in writes {
                bindings.insert(write.binding(), write.clone());
            }
            return;
        }
        state
            .violations
            .push(format!("write to unknown descriptor set {:#x}", set.as_raw()));
    }

    fn create_shader_module(&self, code: &[u32]) -> RtResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RtError::resource("shader module", "empty SPIR-V"));
        }
        Ok(vk::ShaderModule::from_raw(self.state.lock().create("shader_module")))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state.lock().release("shader_module", module.as_raw());
    }

    fn create_pipeline_layout(&self, _set_layouts: &[vk::DescriptorSetLayout]) -> RtResult<vk::PipelineLayout> {
        Ok(vk::PipelineLayout::from_raw(self.state.lock().create("pipeline_layout")))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.lock().release("pipeline_layout", layout.as_raw());
    }

    fn create_rt_pipeline(&self, desc: &RtPipelineDesc) -> RtResult<vk::Pipeline> {
        let stage_count = desc.stages.len() as u32;
        let in_range = |index: u32| index == vk::SHADER_UNUSED_KHR || index < stage_count;
        let valid = desc
            .groups
            .iter()
            .all(|g| in_range(g.general) && in_range(g.closest_hit) && in_range(g.any_hit) && in_range(g.intersection));
        if !valid {
            return Err(RtError::resource("ray tracing pipeline", "group references missing stage"));
        }
        Ok(vk::Pipeline::from_raw(self.state.lock().create("pipeline")))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().release("pipeline", pipeline.as_raw());
    }

    fn shader_group_handles(&self, _pipeline: vk::Pipeline, group_count: u32) -> RtResult<Vec<u8>> {
        let handle_size = self.props.shader_group_handle_size as usize;
        Ok((0..group_count)
            .flat_map(|group| std::iter::repeat(group as u8 + 1).take(handle_size))
            .collect())
    }

    fn cmd_bind_rt_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(cmd, MockCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_rt_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(
            cmd,
            MockCommand::BindDescriptorSets {
                first_set,
                sets: sets.to_vec(),
            },
        );
    }

    fn cmd_trace_rays(&self, cmd: vk::CommandBuffer, _regions: &SbtRegions, extent: vk::Extent2D) {
        self.record(cmd, MockCommand::TraceRays { extent });
    }

    fn create_fence(&self, signaled: bool) -> RtResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.create("fence");
        let initial = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        state.fences.insert(raw, initial);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.release("fence", fence.as_raw());
        if state.fences.remove(&fence.as_raw()) == Some(FenceState::Pending) {
            state.violations.push(format!("fence {:#x} destroyed while pending", fence.as_raw()));
        }
    }

    fn wait_fence(&self, fence: vk::Fence) -> RtResult<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence.as_raw()).copied() {
            Some(FenceState::Pending) | Some(FenceState::Signaled) => {
                state.fences.insert(fence.as_raw(), FenceState::Signaled);
            }
            Some(FenceState::Unsignaled) => state
                .violations
                .push(format!("wait on fence {:#x} that was never submitted", fence.as_raw())),
            None => state.violations.push(format!("wait on unknown fence {:#x}", fence.as_raw())),
        }
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RtResult<()> {
        let mut state = self.state.lock();
        if state.fences.get(&fence.as_raw()) == Some(&FenceState::Pending) {
            state.violations.push(format!("fence {:#x} reset while pending", fence.as_raw()));
        }
        state.fences.insert(fence.as_raw(), FenceState::Unsignaled);
        Ok(())
    }

    fn create_semaphore(&self) -> RtResult<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.state.lock().create("semaphore")))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().release("semaphore", semaphore.as_raw());
    }

    fn submit(&self, submit: &FrameSubmit) -> RtResult<()> {
        let mut state = self.state.lock();
        if state.take_failure(MockFailure::SubmitDeviceLost) {
            return Err(RtError::DeviceLost);
        }
        if state.take_failure(MockFailure::FrameSubmit) {
            return Err(RtError::submit("frame", "ERROR_OUT_OF_HOST_MEMORY"));
        }
        if state.fences.get(&submit.fence.as_raw()) != Some(&FenceState::Unsignaled) {
            state
                .violations
                .push(format!("submit with fence {:#x} not reset", submit.fence.as_raw()));
        }
        state.fences.insert(submit.fence.as_raw(), FenceState::Pending);
        state.in_flight_cmds.insert(submit.cmd.as_raw(), submit.fence.as_raw());

        let commands = state.recording.get(&submit.cmd.as_raw()).cloned().unwrap_or_default();
        state.execute(&commands);
        state.frames.push(SubmittedFrame {
            cmd: submit.cmd,
            commands,
            wait: submit.wait,
            signal: submit.signal,
            fence: submit.fence,
        });
        Ok(())
    }

    fn present_target(&self) -> PresentTarget {
        self.state.lock().target.clone()
    }

    fn acquire_next_image(&mut self, _signal: vk::Semaphore) -> RtResult<Acquire> {
        let mut state = self.state.lock();
        if state.target_stale {
            return Ok(Acquire::Stale);
        }
        let index = state.next_image;
        state.next_image = (index + 1) % state.target.images.len() as u32;
        Ok(Acquire::Image {
            index,
            suboptimal: false,
        })
    }

    fn present(&mut self, image_index: u32, _wait: vk::Semaphore) -> RtResult<Present> {
        let mut state = self.state.lock();
        if image_index as usize >= state.target.images.len() {
            state.violations.push(format!("present of unknown image index {image_index}"));
        }
        Ok(if state.target_stale { Present::Stale } else { Present::Done })
    }

    fn recreate_target(&mut self, extent: vk::Extent2D) -> RtResult<PresentTarget> {
        let mut state = self.state.lock();
        let old = std::mem::take(&mut state.target.images);
        for image in old {
            state.release("target_image", image.as_raw());
        }
        state.target.images = state.new_target_images();
        state.target.extent = extent;
        state.target_stale = false;
        state.next_image = 0;
        state.target_recreations += 1;
        Ok(state.target.clone())
    }

    fn wait_idle(&self) -> RtResult<()> {
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if *fence == FenceState::Pending {
                *fence = FenceState::Signaled;
            }
        }
        Ok(())
    }
}

fn align(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

fn build_sizes(geometry: &AccelGeometry) -> AccelSizes {
    let primitives = u64::from(geometry.primitive_count().max(1));
    let (structure, scratch) = match geometry {
        AccelGeometry::Triangles { .. } => (primitives * 128 + 512, primitives * 64 + 256),
        AccelGeometry::Aabbs { .. } => (primitives * 64 + 512, primitives * 32 + 256),
        AccelGeometry::Instances { .. } => (primitives * 128 + 1024, primitives * 64 + 512),
    };
    AccelSizes {
        structure_size: align(structure, 256),
        build_scratch_size: align(scratch, 256),
        update_scratch_size: align(scratch / 2, 256),
    }
}

fn compacted_size(geometry: &AccelGeometry) -> u64 {
    align(build_sizes(geometry).structure_size * 3 / 4, 256)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_buffer(device: &MockDevice, size: u64) -> RawBuffer {
        device
            .create_buffer(&BufferDesc {
                name: "test",
                size,
                usage: vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::CpuToGpu,
            })
            .unwrap()
    }

    #[test]
    fn test_addresses_are_nonzero_and_distinct() {
        let device = MockDevice::new();
        let a = host_buffer(&device, 100);
        let b = host_buffer(&device, 100);
        let (a, b) = (a.device_address.unwrap(), b.device_address.unwrap());
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(a % ADDRESS_ALIGN, 0);
    }

    #[test]
    fn test_write_buffer_roundtrip() {
        let device = MockDevice::new();
        let buf = host_buffer(&device, 8);
        device.write_buffer(buf.handle, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.buffer_data(buf.handle).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(device.write_buffer(buf.handle, 6, &[0; 4]).is_err());
    }

    #[test]
    fn test_double_free_is_a_violation() {
        let device = MockDevice::new();
        let buf = host_buffer(&device, 8);
        device.destroy_buffer(buf.handle);
        device.destroy_buffer(buf.handle);
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn test_fence_signals_only_after_wait() {
        let device = MockDevice::new();
        let cmd = device.allocate_command_buffers(1).unwrap()[0];
        let fence = device.create_fence(false).unwrap();
        device.begin_command_buffer(cmd).unwrap();
        device
            .submit(&FrameSubmit {
                cmd,
                wait: vk::Semaphore::null(),
                wait_stage: vk::PipelineStageFlags::TRANSFER,
                signal: vk::Semaphore::null(),
                fence,
            })
            .unwrap();

        assert!(device.begin_command_buffer(cmd).is_err());
        device.wait_fence(fence).unwrap();
        device.reset_fence(fence).unwrap();
        assert!(device.begin_command_buffer(cmd).is_ok());
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn test_stale_target_until_recreated() {
        let mut device = MockDevice::new();
        let old = device.present_target();
        device.force_stale();
        assert_eq!(device.acquire_next_image(vk::Semaphore::null()).unwrap(), Acquire::Stale);
        let new = device.recreate_target(vk::Extent2D { width: 800, height: 600 }).unwrap();
        assert_ne!(old.images, new.images);
        assert_eq!(new.extent.width, 800);
        assert!(matches!(
            device.acquire_next_image(vk::Semaphore::null()).unwrap(),
            Acquire::Image { index: 0, .. }
        ));
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let device = MockDevice::new();
        device.fail_next(MockFailure::CreateBuffer);
        let desc = BufferDesc {
            name: "x",
            size: 4,
            usage: vk::BufferUsageFlags::empty(),
            location: MemoryLocation::GpuOnly,
        };
        assert!(device.create_buffer(&desc).is_err());
        assert!(device.create_buffer(&desc).is_ok());
    }
}
