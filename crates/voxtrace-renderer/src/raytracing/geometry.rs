//! Geometry registry.
//!
//! Append-only list of the objects the bottom-level builder turns into
//! structures. The registry freezes when the build phase starts; the
//! volume count it reports afterwards sizes the volume-image binding array.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::device::{AccelGeometry, BufferDesc, ImageDesc, RtDevice};
use crate::error::{RtError, RtResult};
use crate::resources::{BufferId, ImageId, ResourceManager};

/// Vertex positions are three packed `f32`s.
pub const POSITION_SIZE: vk::DeviceSize = 12;

/// Triangle mesh whose vertex and index data already live on the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleMesh {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_count: u32,
    pub index_address: vk::DeviceAddress,
    pub index_count: u32,
}

impl TriangleMesh {
    /// Mesh over a vertex buffer and a `u32` index buffer.
    pub fn from_buffers<D: RtDevice>(
        resources: &ResourceManager<D>,
        vertices: BufferId,
        vertex_stride: vk::DeviceSize,
        vertex_count: u32,
        indices: BufferId,
        index_count: u32,
    ) -> RtResult<Self> {
        Ok(Self {
            vertex_address: resources.buffer(vertices)?.address()?,
            vertex_stride,
            vertex_count,
            index_address: resources.buffer(indices)?.address()?,
            index_count,
        })
    }
}

/// Voxel volume intersected procedurally inside its bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProceduralVolume {
    pub aabb_address: vk::DeviceAddress,
    pub dims: [u32; 3],
    /// `R8_UINT` voxel image read by the intersection shader.
    pub image: ImageId,
    /// Element of the volume-image binding array.
    pub volume_index: u32,
}

/// One registered object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeometryDescriptor {
    Triangles(TriangleMesh),
    Volume(ProceduralVolume),
}

impl GeometryDescriptor {
    /// Build input for this object's bottom-level structure.
    pub fn accel_geometry(&self) -> AccelGeometry {
        match *self {
            GeometryDescriptor::Triangles(mesh) => AccelGeometry::Triangles {
                vertex_address: mesh.vertex_address,
                vertex_stride: mesh.vertex_stride,
                max_vertex: mesh.vertex_count.saturating_sub(1),
                index_address: mesh.index_address,
                primitive_count: mesh.index_count / 3,
            },
            GeometryDescriptor::Volume(volume) => AccelGeometry::Aabbs {
                address: volume.aabb_address,
                stride: std::mem::size_of::<Aabb>() as vk::DeviceSize,
                primitive_count: 1,
            },
        }
    }

    pub fn is_volume(&self) -> bool {
        matches!(self, GeometryDescriptor::Volume(_))
    }
}

/// Axis-aligned box in the layout the AABB build input expects.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    /// `{0, 0, 0}` to the volume's dimensions.
    pub fn from_dims(dims: [u32; 3]) -> Self {
        Self {
            min: [0.0; 3],
            max: dims.map(|d| d as f32),
        }
    }
}

pub const GEOMETRY_KIND_TRIANGLES: u32 = 0;
pub const GEOMETRY_KIND_VOLUME: u32 = 1;

/// Per-object record in the geometry-metadata buffer, indexed by the
/// instance custom index in the closest-hit shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GeometryMetadata {
    pub vertex_address: u64,
    pub index_address: u64,
    pub kind: u32,
    pub volume_index: u32,
}

impl From<&GeometryDescriptor> for GeometryMetadata {
    fn from(descriptor: &GeometryDescriptor) -> Self {
        match *descriptor {
            GeometryDescriptor::Triangles(mesh) => Self {
                vertex_address: mesh.vertex_address,
                index_address: mesh.index_address,
                kind: GEOMETRY_KIND_TRIANGLES,
                volume_index: 0,
            },
            GeometryDescriptor::Volume(volume) => Self {
                vertex_address: 0,
                index_address: 0,
                kind: GEOMETRY_KIND_VOLUME,
                volume_index: volume.volume_index,
            },
        }
    }
}

#[derive(Default)]
pub struct GeometryRegistry {
    descriptors: Vec<GeometryDescriptor>,
    frozen: bool,
    /// AABB buffers created by `add_volume`.
    aabb_buffers: Vec<BufferId>,
    volume_images: Vec<ImageId>,
    metadata: Option<BufferId>,
}

impl GeometryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a triangle mesh. Returns its index, which is also the index
    /// of its bottom-level structure.
    pub fn add_triangles(&mut self, mesh: TriangleMesh) -> RtResult<u32> {
        self.push(GeometryDescriptor::Triangles(mesh))
    }

    /// Upload a `w × h × d` voxel grid and register it as a procedural volume.
    ///
    /// `voxels` holds one byte per voxel, x fastest.
    pub fn add_volume<D: RtDevice>(
        &mut self,
        resources: &mut ResourceManager<D>,
        dims: [u32; 3],
        voxels: &[u8],
    ) -> RtResult<u32> {
        if self.frozen {
            return Err(RtError::RegistryFrozen);
        }
        let expected = dims.iter().map(|&d| d as usize).product::<usize>();
        if expected == 0 || voxels.len() != expected {
            return Err(RtError::resource(
                "volume image",
                format!("{} voxels supplied for a {}x{}x{} grid", voxels.len(), dims[0], dims[1], dims[2]),
            ));
        }

        let image = resources.create_image(&ImageDesc {
            name: "volume",
            image_type: vk::ImageType::TYPE_3D,
            extent: vk::Extent3D {
                width: dims[0],
                height: dims[1],
                depth: dims[2],
            },
            format: vk::Format::R8_UINT,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
        })?;
        if let Err(e) = resources.upload_image(image, voxels, vk::ImageLayout::GENERAL) {
            let _ = resources.destroy_image(image);
            return Err(e);
        }

        let aabb = Aabb::from_dims(dims);
        let aabb_buffer = match resources.create_buffer_with_data(
            &BufferDesc {
                name: "volume_aabb",
                size: std::mem::size_of::<Aabb>() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
            },
            bytemuck::bytes_of(&aabb),
        ) {
            Ok(id) => id,
            Err(e) => {
                let _ = resources.destroy_image(image);
                return Err(e);
            }
        };

        let aabb_address = resources.buffer(aabb_buffer)?.address()?;
        let volume_index = self.volume_images.len() as u32;
        self.aabb_buffers.push(aabb_buffer);
        self.volume_images.push(image);

        debug!(?dims, volume_index, "volume registered");
        self.push(GeometryDescriptor::Volume(ProceduralVolume {
            aabb_address,
            dims,
            image,
            volume_index,
        }))
    }

    fn push(&mut self, descriptor: GeometryDescriptor) -> RtResult<u32> {
        if self.frozen {
            return Err(RtError::RegistryFrozen);
        }
        self.descriptors.push(descriptor);
        Ok(self.descriptors.len() as u32 - 1)
    }

    /// Called when the bottom-level build phase starts. Idempotent.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn descriptors(&self) -> &[GeometryDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Size of the volume-image binding array.
    pub fn volume_count(&self) -> u32 {
        self.volume_images.len() as u32
    }

    pub fn volume_images(&self) -> &[ImageId] {
        &self.volume_images
    }

    /// Upload one [`GeometryMetadata`] record per descriptor.
    ///
    /// The buffer always holds at least one record so the storage-buffer
    /// binding has something to point at.
    pub fn create_metadata_buffer<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>) -> RtResult<BufferId> {
        if let Some(id) = self.metadata {
            return Ok(id);
        }
        let mut records: Vec<GeometryMetadata> = self.descriptors.iter().map(GeometryMetadata::from).collect();
        if records.is_empty() {
            records.push(GeometryMetadata::zeroed());
        }
        let bytes: &[u8] = bytemuck::cast_slice(&records);
        let id = resources.create_buffer_with_data(
            &BufferDesc {
                name: "geometry_metadata",
                size: bytes.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::CpuToGpu,
            },
            bytes,
        )?;
        self.metadata = Some(id);
        Ok(id)
    }

    pub fn metadata_buffer(&self) -> Option<BufferId> {
        self.metadata
    }

    /// Release the buffers and images the registry created.
    pub fn destroy<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        for id in self.aabb_buffers.drain(..).chain(self.metadata.take()) {
            resources.destroy_buffer(id)?;
        }
        for id in self.volume_images.drain(..) {
            resources.destroy_image(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn mesh() -> TriangleMesh {
        TriangleMesh {
            vertex_address: 0x1000,
            vertex_stride: POSITION_SIZE,
            vertex_count: 8,
            index_address: 0x2000,
            index_count: 12,
        }
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    #[test]
    fn test_triangle_build_input() {
        match GeometryDescriptor::Triangles(mesh()).accel_geometry() {
            AccelGeometry::Triangles {
                max_vertex,
                primitive_count,
                vertex_stride,
                ..
            } => {
                assert_eq!(max_vertex, 7);
                assert_eq!(primitive_count, 4);
                assert_eq!(vertex_stride, 12);
            }
            other => panic!("unexpected geometry {other:?}"),
        }
    }

    #[test]
    fn test_aabb_layout() {
        assert_eq!(std::mem::size_of::<Aabb>(), 24);
        let aabb = Aabb::from_dims([4, 5, 6]);
        assert_eq!(aabb.min, [0.0, 0.0, 0.0]);
        assert_eq!(aabb.max, [4.0, 5.0, 6.0]);
        assert_eq!(std::mem::size_of::<GeometryMetadata>(), 24);
    }

    // ========================================================================
    // Registry
    // ========================================================================

    #[test]
    fn test_indices_follow_registration_order() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut registry = GeometryRegistry::new();
        assert_eq!(registry.add_volume(&mut res, [2, 2, 2], &[1; 8]).unwrap(), 0);
        assert_eq!(registry.add_triangles(mesh()).unwrap(), 1);
        assert_eq!(registry.add_volume(&mut res, [1, 2, 3], &[1; 6]).unwrap(), 2);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.volume_count(), 2);
        match registry.descriptors()[2] {
            GeometryDescriptor::Volume(volume) => {
                assert_eq!(volume.volume_index, 1);
                assert_eq!(volume.dims, [1, 2, 3]);
                assert_ne!(volume.aabb_address, 0);
            }
            _ => panic!("expected a volume"),
        }
    }

    #[test]
    fn test_volume_aabb_uploaded() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut registry = GeometryRegistry::new();
        registry.add_volume(&mut res, [3, 2, 1], &[0; 6]).unwrap();

        let aabb = Aabb::from_dims([3, 2, 1]);
        let buffer = res.buffer(registry.aabb_buffers[0]).unwrap();
        assert_eq!(res.device().buffer_data(buffer.handle).unwrap(), bytemuck::bytes_of(&aabb));
    }

    #[test]
    fn test_frozen_registry_rejects_appends() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut registry = GeometryRegistry::new();
        registry.add_triangles(mesh()).unwrap();
        registry.freeze();

        assert!(matches!(registry.add_triangles(mesh()), Err(RtError::RegistryFrozen)));
        assert!(matches!(
            registry.add_volume(&mut res, [1, 1, 1], &[1]),
            Err(RtError::RegistryFrozen)
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(res.live_images(), 0);
    }

    #[test]
    fn test_voxel_count_must_match_dims() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut registry = GeometryRegistry::new();
        assert!(registry.add_volume(&mut res, [2, 2, 2], &[1; 7]).is_err());
        assert!(registry.add_volume(&mut res, [0, 2, 2], &[]).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_metadata_records_match_descriptors() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut registry = GeometryRegistry::new();
        registry.add_triangles(mesh()).unwrap();
        registry.add_volume(&mut res, [1, 1, 1], &[1]).unwrap();

        let id = registry.create_metadata_buffer(&mut res).unwrap();
        assert_eq!(registry.create_metadata_buffer(&mut res).unwrap(), id);

        let bytes = res.device().buffer_data(res.buffer(id).unwrap().handle).unwrap();
        let records: Vec<GeometryMetadata> = bytes
            .chunks_exact(std::mem::size_of::<GeometryMetadata>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].vertex_address, 0x1000);
        assert_eq!(records[0].kind, GEOMETRY_KIND_TRIANGLES);
        assert_eq!(records[1].kind, GEOMETRY_KIND_VOLUME);
    }

    #[test]
    fn test_destroy_releases_owned_resources() {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut registry = GeometryRegistry::new();
        registry.add_volume(&mut res, [2, 1, 1], &[1, 0]).unwrap();
        registry.create_metadata_buffer(&mut res).unwrap();

        registry.destroy(&mut res).unwrap();
        assert_eq!(res.live_buffers(), 0);
        assert_eq!(res.live_images(), 0);
        assert!(res.device().violations().is_empty());
    }
}
