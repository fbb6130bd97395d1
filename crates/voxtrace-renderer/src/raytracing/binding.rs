//! Per-frame binding sets for the ray-tracing shaders.
//!
//! Set 1 of the pipeline layout:
//!
//! | binding | type                   | stages            | contents                  |
//! |---------|------------------------|-------------------|---------------------------|
//! | 0       | acceleration structure | raygen, closest   | top-level structure       |
//! | 1       | storage image          | raygen            | the frame's output image  |
//! | 2       | storage buffer         | closest           | geometry metadata         |
//! | 3       | combined image sampler | closest           | material texture          |
//! | 4       | storage image array    | intersection      | voxel volumes             |

use ash::vk;
use tracing::debug;

use crate::device::{DescriptorWrite, ImageDesc, LayoutBinding, RtDevice};
use crate::error::{RtError, RtResult};
use crate::raytracing::geometry::GeometryRegistry;
use crate::raytracing::tlas::TopLevelBuilder;
use crate::resources::{ImageId, ResourceManager};

pub const BINDING_TLAS: u32 = 0;
pub const BINDING_OUTPUT: u32 = 1;
pub const BINDING_METADATA: u32 = 2;
pub const BINDING_TEXTURE: u32 = 3;
pub const BINDING_VOLUMES: u32 = 4;

/// Layout of set 1 for `volume_count` volumes.
///
/// The volume array never has zero elements; a scene without volumes binds a
/// single placeholder instead.
pub fn layout_bindings(volume_count: u32) -> [LayoutBinding; 5] {
    [
        LayoutBinding {
            binding: BINDING_TLAS,
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            count: 1,
            stages: vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        },
        LayoutBinding {
            binding: BINDING_OUTPUT,
            ty: vk::DescriptorType::STORAGE_IMAGE,
            count: 1,
            stages: vk::ShaderStageFlags::RAYGEN_KHR,
        },
        LayoutBinding {
            binding: BINDING_METADATA,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            count: 1,
            stages: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        },
        LayoutBinding {
            binding: BINDING_TEXTURE,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: 1,
            stages: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        },
        LayoutBinding {
            binding: BINDING_VOLUMES,
            ty: vk::DescriptorType::STORAGE_IMAGE,
            count: volume_count.max(1),
            stages: vk::ShaderStageFlags::INTERSECTION_KHR,
        },
    ]
}

/// Pool sizes for `sets` copies of `bindings`, without zero-sized entries.
pub fn pool_sizes(bindings: &[LayoutBinding], sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings.iter().filter(|b| b.count > 0) {
        match sizes.iter_mut().find(|s| s.ty == binding.ty) {
            Some(size) => size.descriptor_count += binding.count * sets,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.ty,
                descriptor_count: binding.count * sets,
            }),
        }
    }
    sizes
}

/// Sampled RGBA texture read by the triangle closest-hit shader.
#[derive(Debug, Clone, Copy)]
pub struct MaterialTexture {
    pub image: ImageId,
    pub sampler: vk::Sampler,
}

impl MaterialTexture {
    /// Upload `rgba` (`width × height` texels, 4 bytes each).
    pub fn create<D: RtDevice>(
        resources: &mut ResourceManager<D>,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> RtResult<Self> {
        if rgba.len() != width as usize * height as usize * 4 {
            return Err(RtError::resource(
                "material texture",
                format!("{} bytes for a {width}x{height} RGBA image", rgba.len()),
            ));
        }
        let image = resources.create_image(&ImageDesc {
            name: "material_texture",
            image_type: vk::ImageType::TYPE_2D,
            extent: vk::Extent3D { width, height, depth: 1 },
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        })?;

        let sampler = resources
            .upload_image(image, rgba, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .and_then(|()| resources.create_sampler());
        match sampler {
            Ok(sampler) => Ok(Self { image, sampler }),
            Err(e) => {
                let _ = resources.destroy_image(image);
                Err(e)
            }
        }
    }

    /// 1×1 white texture for scenes without one.
    pub fn white<D: RtDevice>(resources: &mut ResourceManager<D>) -> RtResult<Self> {
        Self::create(resources, 1, 1, &[0xFF; 4])
    }

    pub fn destroy<D: RtDevice>(self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        resources.destroy_sampler(self.sampler);
        resources.destroy_image(self.image)
    }
}

/// 1×1×1 empty volume bound at slot 4 when the registry holds no volumes.
fn create_placeholder_volume<D: RtDevice>(resources: &mut ResourceManager<D>) -> RtResult<ImageId> {
    let image = resources.create_image(&ImageDesc {
        name: "empty_volume",
        image_type: vk::ImageType::TYPE_3D,
        extent: vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        },
        format: vk::Format::R8_UINT,
        usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
    })?;
    if let Err(e) = resources.upload_image(image, &[0], vk::ImageLayout::GENERAL) {
        let _ = resources.destroy_image(image);
        return Err(e);
    }
    Ok(image)
}

/// Layout, pool and one set per frame slot.
pub struct ResourceBindings {
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    volume_count: u32,
    placeholder_volume: Option<ImageId>,
    bound_outputs: Vec<Option<ImageId>>,
}

impl ResourceBindings {
    /// Create the layout and allocate `frame_slots` sets.
    ///
    /// The volume array is sized from the registry, which must be frozen.
    /// An empty registry gets a placeholder volume owned by the bindings.
    pub fn create_layout<D: RtDevice>(
        resources: &mut ResourceManager<D>,
        registry: &GeometryRegistry,
        frame_slots: usize,
    ) -> RtResult<Self> {
        if !registry.is_frozen() {
            return Err(RtError::RegistryNotFrozen);
        }
        let volume_count = registry.volume_count();
        let placeholder_volume = match volume_count {
            0 => Some(create_placeholder_volume(resources)?),
            _ => None,
        };
        let release_placeholder = |resources: &mut ResourceManager<D>| {
            if let Some(image) = placeholder_volume {
                let _ = resources.destroy_image(image);
            }
        };

        let bindings = layout_bindings(volume_count);
        let device = resources.device();
        let layout = match device.create_descriptor_set_layout(&bindings) {
            Ok(layout) => layout,
            Err(e) => {
                release_placeholder(resources);
                return Err(e);
            }
        };

        let slots = frame_slots as u32;
        let pool = match device.create_descriptor_pool(&pool_sizes(&bindings, slots), slots) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_descriptor_set_layout(layout);
                release_placeholder(resources);
                return Err(e);
            }
        };
        let sets = match device.allocate_descriptor_sets(pool, layout, slots) {
            Ok(sets) => sets,
            Err(e) => {
                device.destroy_descriptor_pool(pool);
                device.destroy_descriptor_set_layout(layout);
                release_placeholder(resources);
                return Err(e);
            }
        };

        debug!(
            volume_count,
            placeholder = placeholder_volume.is_some(),
            sets = sets.len(),
            "ray tracing binding layout created"
        );
        Ok(Self {
            layout,
            pool,
            bound_outputs: vec![None; sets.len()],
            sets,
            volume_count,
            placeholder_volume,
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set(&self, slot: usize) -> vk::DescriptorSet {
        self.sets[slot % self.sets.len()]
    }

    /// Volumes in the registry. Zero when the placeholder is bound.
    pub fn volume_count(&self) -> u32 {
        self.volume_count
    }

    pub fn placeholder_volume(&self) -> Option<ImageId> {
        self.placeholder_volume
    }

    /// Output image each set currently references, by slot.
    pub fn bound_output_images(&self) -> &[Option<ImageId>] {
        &self.bound_outputs
    }

    /// Rewrite every set. `outputs[i]` is bound to set `i`.
    ///
    /// Every handle is checked first; a stale one fails the call before any
    /// set is touched.
    pub fn update<D: RtDevice>(
        &mut self,
        resources: &ResourceManager<D>,
        tlas: &TopLevelBuilder,
        registry: &GeometryRegistry,
        outputs: &[ImageId],
        texture: &MaterialTexture,
    ) -> RtResult<()> {
        if outputs.len() != self.sets.len() {
            return Err(RtError::resource(
                "binding sets",
                format!("{} output images for {} sets", outputs.len(), self.sets.len()),
            ));
        }

        let accel = tlas.accel()?;
        let metadata = registry
            .metadata_buffer()
            .ok_or(RtError::NotBuilt("geometry metadata buffer"))
            .and_then(|id| resources.buffer(id))?;
        let texture_view = resources.image(texture.image)?.view;
        let volume_views = registry
            .volume_images()
            .iter()
            .chain(self.placeholder_volume.as_ref())
            .map(|&id| resources.image(id).map(|image| image.view))
            .collect::<RtResult<Vec<_>>>()?;
        let output_views = outputs
            .iter()
            .map(|&id| resources.image(id).map(|image| image.view))
            .collect::<RtResult<Vec<_>>>()?;

        for (slot, (&set, view)) in self.sets.iter().zip(output_views).enumerate() {
            let writes = [
                DescriptorWrite::AccelerationStructure {
                    binding: BINDING_TLAS,
                    accel,
                },
                DescriptorWrite::StorageImages {
                    binding: BINDING_OUTPUT,
                    views: vec![view],
                    layout: vk::ImageLayout::GENERAL,
                },
                DescriptorWrite::StorageBuffer {
                    binding: BINDING_METADATA,
                    buffer: metadata.handle,
                    range: metadata.size,
                },
                DescriptorWrite::CombinedImageSampler {
                    binding: BINDING_TEXTURE,
                    view: texture_view,
                    sampler: texture.sampler,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
                DescriptorWrite::StorageImages {
                    binding: BINDING_VOLUMES,
                    views: volume_views.clone(),
                    layout: vk::ImageLayout::GENERAL,
                },
            ];
            resources.device().write_descriptor_set(set, &writes);
            self.bound_outputs[slot] = Some(outputs[slot]);
        }

        debug!(sets = self.sets.len(), "ray tracing bindings updated");
        Ok(())
    }

    pub fn destroy<D: RtDevice>(&mut self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        let device = resources.device();
        device.destroy_descriptor_pool(self.pool);
        device.destroy_descriptor_set_layout(self.layout);
        self.sets.clear();
        self.bound_outputs.clear();
        match self.placeholder_volume.take() {
            Some(image) => resources.destroy_image(image),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use crate::raytracing::tlas::InstanceRecord;

    struct Fixture {
        res: ResourceManager<MockDevice>,
        registry: GeometryRegistry,
        tlas: TopLevelBuilder,
        texture: MaterialTexture,
        outputs: Vec<ImageId>,
    }

    fn output_image(res: &mut ResourceManager<MockDevice>) -> ImageId {
        res.create_image(&ImageDesc {
            name: "output",
            image_type: vk::ImageType::TYPE_2D,
            extent: vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            format: vk::Format::B8G8R8A8_UNORM,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        })
        .unwrap()
    }

    fn fixture(volumes: usize) -> Fixture {
        let mut res = ResourceManager::new(MockDevice::new());
        let mut registry = GeometryRegistry::new();
        for _ in 0..volumes {
            registry.add_volume(&mut res, [1, 1, 1], &[1]).unwrap();
        }
        registry.freeze();
        registry.create_metadata_buffer(&mut res).unwrap();

        let mut tlas = TopLevelBuilder::new(2);
        tlas.add_instance(InstanceRecord::default()).unwrap();
        tlas.build(&mut res).unwrap();

        let texture = MaterialTexture::white(&mut res).unwrap();
        let outputs = vec![output_image(&mut res), output_image(&mut res)];
        Fixture {
            res,
            registry,
            tlas,
            texture,
            outputs,
        }
    }

    // ========================================================================
    // Layout
    // ========================================================================

    #[test]
    fn test_layout_bindings_stages() {
        let bindings = layout_bindings(3);
        assert_eq!(bindings[0].ty, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
        assert!(bindings[0].stages.contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
        assert_eq!(bindings[1].stages, vk::ShaderStageFlags::RAYGEN_KHR);
        assert_eq!(bindings[4].count, 3);
        assert_eq!(bindings[4].stages, vk::ShaderStageFlags::INTERSECTION_KHR);
    }

    #[test]
    fn test_pool_sizes_merge_types() {
        let sizes = pool_sizes(&layout_bindings(3), 2);
        let storage = sizes.iter().find(|s| s.ty == vk::DescriptorType::STORAGE_IMAGE).unwrap();
        assert_eq!(storage.descriptor_count, 8);
        assert_eq!(sizes.len(), 4);
    }

    #[test]
    fn test_empty_volume_array_keeps_one_element() {
        let bindings = layout_bindings(0);
        assert_eq!(bindings[4].count, 1);
        let sizes = pool_sizes(&bindings, 2);
        let storage = sizes.iter().find(|s| s.ty == vk::DescriptorType::STORAGE_IMAGE).unwrap();
        assert_eq!(storage.descriptor_count, 4);
    }

    #[test]
    fn test_layout_requires_frozen_registry() {
        let registry = GeometryRegistry::new();
        let mut res = ResourceManager::new(MockDevice::new());
        assert!(matches!(
            ResourceBindings::create_layout(&mut res, &registry, 2),
            Err(RtError::RegistryNotFrozen)
        ));
        assert_eq!(res.live_images(), 0);
    }

    // ========================================================================
    // Updates
    // ========================================================================

    #[test]
    fn test_update_writes_every_binding() {
        let mut f = fixture(2);
        let mut bindings = ResourceBindings::create_layout(&mut f.res, &f.registry, 2).unwrap();
        bindings
            .update(&f.res, &f.tlas, &f.registry, &f.outputs, &f.texture)
            .unwrap();

        let writes = f.res.device().descriptor_writes(bindings.set(1));
        assert_eq!(writes.len(), 5);
        let out_view = f.res.image(f.outputs[1]).unwrap().view;
        assert!(writes.contains(&DescriptorWrite::StorageImages {
            binding: BINDING_OUTPUT,
            views: vec![out_view],
            layout: vk::ImageLayout::GENERAL,
        }));
        match &writes[4] {
            DescriptorWrite::StorageImages { views, layout, .. } => {
                assert_eq!(views.len(), 2);
                assert_eq!(*layout, vk::ImageLayout::GENERAL);
            }
            other => panic!("unexpected write {other:?}"),
        }
        assert_eq!(bindings.bound_output_images(), &[Some(f.outputs[0]), Some(f.outputs[1])]);
        assert!(bindings.placeholder_volume().is_none());
        bindings.destroy(&mut f.res).unwrap();
        f.res.destroy_all();
    }

    #[test]
    fn test_no_volumes_binds_placeholder() {
        let mut f = fixture(0);
        let images_before = f.res.live_images();
        let mut bindings = ResourceBindings::create_layout(&mut f.res, &f.registry, 2).unwrap();
        assert_eq!(f.res.live_images(), images_before + 1);
        bindings
            .update(&f.res, &f.tlas, &f.registry, &f.outputs, &f.texture)
            .unwrap();
        assert_eq!(bindings.volume_count(), 0);

        let placeholder = f.res.image(bindings.placeholder_volume().unwrap()).unwrap();
        assert_eq!(placeholder.format, vk::Format::R8_UINT);
        for slot in 0..2 {
            let writes = f.res.device().descriptor_writes(bindings.set(slot));
            assert_eq!(writes.len(), 5);
            assert_eq!(
                writes[4],
                DescriptorWrite::StorageImages {
                    binding: BINDING_VOLUMES,
                    views: vec![placeholder.view],
                    layout: vk::ImageLayout::GENERAL,
                }
            );
        }

        bindings.destroy(&mut f.res).unwrap();
        assert_eq!(f.res.live_images(), images_before);
    }

    #[test]
    fn test_stale_output_rejected_without_writes() {
        let mut f = fixture(1);
        let mut bindings = ResourceBindings::create_layout(&mut f.res, &f.registry, 2).unwrap();
        let stale = f.outputs[1];
        f.res.destroy_image(stale).unwrap();

        let err = bindings
            .update(&f.res, &f.tlas, &f.registry, &f.outputs, &f.texture)
            .unwrap_err();
        assert!(matches!(err, RtError::StaleHandle { kind: "image", .. }));
        assert!(f.res.device().descriptor_writes(bindings.set(0)).is_empty());
        assert_eq!(bindings.bound_output_images(), &[None, None]);
    }

    #[test]
    fn test_output_count_must_match_sets() {
        let mut f = fixture(0);
        let mut bindings = ResourceBindings::create_layout(&mut f.res, &f.registry, 2).unwrap();
        assert!(bindings
            .update(&f.res, &f.tlas, &f.registry, &f.outputs[..1], &f.texture)
            .is_err());
    }

    #[test]
    fn test_texture_size_checked() {
        let mut res = ResourceManager::new(MockDevice::new());
        assert!(MaterialTexture::create(&mut res, 2, 2, &[0; 15]).is_err());
        assert_eq!(res.live_images(), 0);
    }
}
