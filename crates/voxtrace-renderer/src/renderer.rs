//! Ray tracer and renderer facade.
//!
//! [`RayTracer`] owns everything that outlives a resize: geometry, both
//! acceleration-structure levels, the binding sets, the pipeline and the
//! material texture. [`Renderer`] adds the device's resource manager and the
//! frame orchestrator, and is what a frame driver talks to.

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::{error, info};

use crate::config::RtConfig;
use crate::device::{BufferDesc, RtDevice};
use crate::error::{RendererError, RendererResult, RtError, RtResult};
use crate::frame::{create_global_set_layout, FrameOrchestrator, FrameStatus, FrameUniforms};
use crate::raytracing::binding::{MaterialTexture, ResourceBindings};
use crate::raytracing::blas::BottomLevelBuilder;
use crate::raytracing::geometry::{GeometryRegistry, TriangleMesh, POSITION_SIZE};
use crate::raytracing::pipeline::{RtPipeline, ShaderLibrary, SHADER_GROUPS};
use crate::raytracing::tlas::{InstanceRecord, TopLevelBuilder};
use crate::resources::{BufferId, ImageId, ResourceManager};

/// Geometry of one scene object, as handed over by the asset loader.
#[derive(Debug, Clone)]
pub enum SceneGeometry {
    /// `dims` voxels, one byte each, x fastest. Zero is empty.
    Volume { dims: [u32; 3], voxels: Vec<u8> },
    /// Indexed triangle list.
    Mesh { positions: Vec<[f32; 3]>, indices: Vec<u32> },
}

#[derive(Debug, Clone)]
pub struct SceneObject {
    pub geometry: SceneGeometry,
    /// Row-major 3×4 object-to-world transform.
    pub transform: [f32; 12],
}

/// RGBA8 material texture.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub objects: Vec<SceneObject>,
    pub texture: Option<TextureData>,
}

/// Acceleration structures, bindings and pipeline for one scene.
///
/// Object `i` of the scene becomes registry entry `i`, bottom-level entry
/// `i` and instance `i`.
pub struct RayTracer {
    registry: GeometryRegistry,
    blas: BottomLevelBuilder,
    tlas: TopLevelBuilder,
    bindings: ResourceBindings,
    pipeline: RtPipeline,
    texture: MaterialTexture,
    mesh_buffers: Vec<BufferId>,
}

/// Scene-side state, kept separate so a failed init can unwind it.
struct SceneParts {
    registry: GeometryRegistry,
    blas: BottomLevelBuilder,
    tlas: TopLevelBuilder,
    mesh_buffers: Vec<BufferId>,
}

impl SceneParts {
    fn destroy<D: RtDevice>(mut self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        self.tlas.destroy(resources)?;
        self.blas.destroy(resources)?;
        self.registry.destroy(resources)?;
        for id in self.mesh_buffers {
            resources.destroy_buffer(id)?;
        }
        Ok(())
    }
}

impl RayTracer {
    /// Upload `scene`, build both structure levels and create the pipeline.
    ///
    /// The binding sets are allocated but not written; call
    /// [`update_bindings`](Self::update_bindings) once output images exist.
    pub fn init<D: RtDevice>(
        resources: &mut ResourceManager<D>,
        config: &RtConfig,
        scene: &Scene,
        shaders: &ShaderLibrary,
        global_layout: vk::DescriptorSetLayout,
    ) -> RtResult<Self> {
        let mut parts = SceneParts {
            registry: GeometryRegistry::new(),
            blas: BottomLevelBuilder::new(config),
            tlas: TopLevelBuilder::new(config.frames_in_flight),
            mesh_buffers: Vec::new(),
        };
        if let Err(e) = build_scene(resources, scene, &mut parts) {
            let _ = parts.destroy(resources);
            return Err(e);
        }

        let bindings = match ResourceBindings::create_layout(resources, &parts.registry, config.frames_in_flight) {
            Ok(bindings) => bindings,
            Err(e) => {
                let _ = parts.destroy(resources);
                return Err(e);
            }
        };

        let texture = match &scene.texture {
            Some(t) => MaterialTexture::create(resources, t.width, t.height, &t.rgba),
            None => MaterialTexture::white(resources),
        };
        let pipeline = texture.and_then(|texture| {
            match RtPipeline::new(
                resources,
                shaders,
                SHADER_GROUPS,
                global_layout,
                bindings.layout(),
                config.max_ray_recursion_depth,
            ) {
                Ok(pipeline) => Ok((texture, pipeline)),
                Err(e) => {
                    let _ = texture.destroy(resources);
                    Err(e)
                }
            }
        });
        let (texture, pipeline) = match pipeline {
            Ok(built) => built,
            Err(e) => {
                let mut bindings = bindings;
                let _ = bindings.destroy(resources);
                let _ = parts.destroy(resources);
                return Err(e);
            }
        };

        info!(
            objects = scene.objects.len(),
            volumes = parts.registry.volume_count(),
            instances = parts.tlas.instances().len(),
            "ray tracer ready"
        );
        let SceneParts {
            registry,
            blas,
            tlas,
            mesh_buffers,
        } = parts;
        Ok(Self {
            registry,
            blas,
            tlas,
            bindings,
            pipeline,
            texture,
            mesh_buffers,
        })
    }

    /// Record the ray dispatch for `frame_index` into `cmd`.
    ///
    /// The output image must already be in `GENERAL` layout.
    pub fn render<D: RtDevice>(
        &self,
        device: &D,
        cmd: vk::CommandBuffer,
        frame_index: usize,
        extent: vk::Extent2D,
        global_set: vk::DescriptorSet,
    ) -> RtResult<()> {
        self.tlas.accel()?;
        self.pipeline
            .bind(device, cmd, global_set, self.bindings.set(frame_index));
        self.pipeline.sbt().trace_rays(device, cmd, extent);
        Ok(())
    }

    /// Point every binding set at the current output images.
    pub fn update_bindings<D: RtDevice>(&mut self, resources: &ResourceManager<D>, outputs: &[ImageId]) -> RtResult<()> {
        self.bindings
            .update(resources, &self.tlas, &self.registry, outputs, &self.texture)
    }

    pub fn bound_output_images(&self) -> &[Option<ImageId>] {
        self.bindings.bound_output_images()
    }

    /// Stage a new transform for instance `index`, applied by the next frame.
    pub fn set_instance_transform(&mut self, index: u32, transform: [f32; 12]) -> RtResult<()> {
        self.tlas.set_transform(index, transform)
    }

    /// Refit synchronously from a full instance list of unchanged length.
    pub fn update_instances<D: RtDevice>(
        &mut self,
        resources: &ResourceManager<D>,
        instances: &[InstanceRecord],
    ) -> RtResult<()> {
        self.tlas.update(resources, instances)
    }

    /// Replace the instance list, rebuild the top level and rebind.
    ///
    /// Stalls the device. Unlike [`update_instances`](Self::update_instances)
    /// the count may change. The new structure is bound next to `outputs`.
    pub fn rebuild_instances<D: RtDevice>(
        &mut self,
        resources: &mut ResourceManager<D>,
        instances: Vec<InstanceRecord>,
        outputs: &[ImageId],
    ) -> RtResult<()> {
        let count = instances.len();
        self.tlas.rebuild(resources, instances)?;
        self.update_bindings(resources, outputs)?;
        info!(instances = count, "top-level structure rebuilt");
        Ok(())
    }

    pub(crate) fn record_pending_refit<D: RtDevice>(
        &mut self,
        resources: &ResourceManager<D>,
        cmd: vk::CommandBuffer,
        slot: usize,
    ) -> RtResult<bool> {
        self.tlas.record_pending_refit(resources, cmd, slot)
    }

    pub fn registry(&self) -> &GeometryRegistry {
        &self.registry
    }

    pub fn blas(&self) -> &BottomLevelBuilder {
        &self.blas
    }

    pub fn tlas(&self) -> &TopLevelBuilder {
        &self.tlas
    }

    pub fn pipeline(&self) -> &RtPipeline {
        &self.pipeline
    }

    pub fn destroy<D: RtDevice>(mut self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        self.bindings.destroy(resources)?;
        self.pipeline.destroy(resources)?;
        self.texture.destroy(resources)?;
        SceneParts {
            registry: self.registry,
            blas: self.blas,
            tlas: self.tlas,
            mesh_buffers: self.mesh_buffers,
        }
        .destroy(resources)
    }
}

fn build_scene<D: RtDevice>(resources: &mut ResourceManager<D>, scene: &Scene, parts: &mut SceneParts) -> RtResult<()> {
    for object in &scene.objects {
        match &object.geometry {
            SceneGeometry::Volume { dims, voxels } => {
                parts.registry.add_volume(resources, *dims, voxels)?;
            }
            SceneGeometry::Mesh { positions, indices } => {
                let mesh = upload_mesh(resources, positions, indices, &mut parts.mesh_buffers)?;
                parts.registry.add_triangles(mesh)?;
            }
        }
    }

    parts.blas.add_all(&mut parts.registry)?;
    parts.blas.build(resources)?;
    parts.registry.create_metadata_buffer(resources)?;

    for (index, (object, descriptor)) in scene.objects.iter().zip(parts.registry.descriptors()).enumerate() {
        let index = index as u32;
        if descriptor.is_volume() {
            parts.tlas.add_volume_instance(&parts.blas, index, object.transform)?;
        } else {
            parts.tlas.add_triangle_instance(&parts.blas, index, object.transform)?;
        }
    }
    parts.tlas.build(resources)
}

fn upload_mesh<D: RtDevice>(
    resources: &mut ResourceManager<D>,
    positions: &[[f32; 3]],
    indices: &[u32],
    owned: &mut Vec<BufferId>,
) -> RtResult<TriangleMesh> {
    if positions.is_empty() || indices.is_empty() || indices.len() % 3 != 0 {
        return Err(RtError::resource(
            "triangle mesh",
            format!("{} vertices, {} indices", positions.len(), indices.len()),
        ));
    }
    let usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        | vk::BufferUsageFlags::STORAGE_BUFFER;

    let vertex_bytes: &[u8] = bytemuck::cast_slice(positions);
    let vertices = resources.create_buffer_with_data(
        &BufferDesc {
            name: "mesh_vertices",
            size: vertex_bytes.len() as vk::DeviceSize,
            usage,
            location: MemoryLocation::GpuOnly,
        },
        vertex_bytes,
    )?;
    owned.push(vertices);

    let index_bytes: &[u8] = bytemuck::cast_slice(indices);
    let index_buffer = resources.create_buffer_with_data(
        &BufferDesc {
            name: "mesh_indices",
            size: index_bytes.len() as vk::DeviceSize,
            usage,
            location: MemoryLocation::GpuOnly,
        },
        index_bytes,
    )?;
    owned.push(index_buffer);

    TriangleMesh::from_buffers(
        resources,
        vertices,
        POSITION_SIZE,
        positions.len() as u32,
        index_buffer,
        indices.len() as u32,
    )
}

/// The subsystem as seen by a frame driver.
pub struct Renderer<D: RtDevice> {
    resources: ResourceManager<D>,
    global_layout: vk::DescriptorSetLayout,
    tracer: RayTracer,
    frames: FrameOrchestrator,
}

impl<D: RtDevice> Renderer<D> {
    /// Validate `config` against the device, build the scene and create the
    /// frame slots. Any failure is a boot failure.
    pub fn init(device: D, config: RtConfig, scene: &Scene, shaders: &ShaderLibrary) -> RendererResult<Self> {
        let config = config.validate(device.properties()).map_err(RendererError::Boot)?;
        let mut resources = ResourceManager::new(device);

        match boot(&mut resources, &config, scene, shaders) {
            Ok((global_layout, tracer, frames)) => {
                info!(device = %resources.device().properties().device_name, "renderer initialized");
                Ok(Self {
                    resources,
                    global_layout,
                    tracer,
                    frames,
                })
            }
            Err(e) => {
                error!("renderer initialization failed: {e}");
                resources.destroy_all();
                Err(RendererError::Boot(e))
            }
        }
    }

    /// Render and present one frame.
    pub fn draw_frame(&mut self, uniforms: &FrameUniforms) -> RendererResult<FrameStatus> {
        self.frames
            .draw_frame(&mut self.resources, &mut self.tracer, uniforms)
            .map_err(RendererError::Render)
    }

    /// The window was resized. The next frame rebuilds size-dependent state.
    pub fn notify_resize(&mut self, width: u32, height: u32) {
        self.frames.request_resize(width, height);
    }

    /// Move instance `index`. Applied as a refit inside the next frame.
    pub fn set_instance_transform(&mut self, index: u32, transform: [f32; 12]) -> RendererResult<()> {
        self.tracer
            .set_instance_transform(index, transform)
            .map_err(RendererError::Render)
    }

    /// Swap in a new instance list of any length. Waits for the device.
    pub fn rebuild_instances(&mut self, instances: Vec<InstanceRecord>) -> RendererResult<()> {
        let outputs = self.frames.output_images();
        self.tracer
            .rebuild_instances(&mut self.resources, instances, &outputs)
            .map_err(RendererError::Render)
    }

    pub fn tracer(&self) -> &RayTracer {
        &self.tracer
    }

    pub fn frames(&self) -> &FrameOrchestrator {
        &self.frames
    }

    pub fn resources(&self) -> &ResourceManager<D> {
        &self.resources
    }

    pub fn device(&self) -> &D {
        self.resources.device()
    }

    /// Wait for the device, release everything and hand the device back.
    pub fn destroy(mut self) -> RendererResult<D> {
        self.frames.destroy(&mut self.resources);
        self.tracer
            .destroy(&mut self.resources)
            .map_err(RendererError::Render)?;
        self.resources
            .device()
            .destroy_descriptor_set_layout(self.global_layout);
        self.resources.destroy_all();
        info!("renderer destroyed");
        Ok(self.resources.into_device())
    }
}

fn boot<D: RtDevice>(
    resources: &mut ResourceManager<D>,
    config: &RtConfig,
    scene: &Scene,
    shaders: &ShaderLibrary,
) -> RtResult<(vk::DescriptorSetLayout, RayTracer, FrameOrchestrator)> {
    let global_layout = create_global_set_layout(resources.device())?;

    let mut tracer = match RayTracer::init(resources, config, scene, shaders, global_layout) {
        Ok(tracer) => tracer,
        Err(e) => {
            resources.device().destroy_descriptor_set_layout(global_layout);
            return Err(e);
        }
    };

    let frames = FrameOrchestrator::new(resources, global_layout, config.frames_in_flight).and_then(|mut frames| {
        match tracer.update_bindings(resources, &frames.output_images()) {
            Ok(()) => Ok(frames),
            Err(e) => {
                frames.destroy(resources);
                Err(e)
            }
        }
    });
    match frames {
        Ok(frames) => Ok((global_layout, tracer, frames)),
        Err(e) => {
            let _ = tracer.destroy(resources);
            resources.device().destroy_descriptor_set_layout(global_layout);
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::raytracing::pipeline::pipeline_layout_of;
    use crate::raytracing::tlas::IDENTITY_TRANSFORM;

    /// A library with a placeholder module for every stage of the group table.
    pub fn stub_shaders() -> ShaderLibrary {
        let mut library = ShaderLibrary::new();
        for (name, _) in pipeline_layout_of(SHADER_GROUPS).0 {
            library.insert(name, vec![0x0723_0203, 0x0001_0500]);
        }
        library
    }

    pub fn translated(x: f32, y: f32, z: f32) -> [f32; 12] {
        let mut t = IDENTITY_TRANSFORM;
        t[3] = x;
        t[7] = y;
        t[11] = z;
        t
    }

    pub fn cube() -> SceneGeometry {
        let positions = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ];
        #[rustfmt::skip]
        let indices = vec![
            0, 1, 2, 2, 3, 0,
            4, 6, 5, 6, 4, 7,
            0, 4, 5, 5, 1, 0,
            3, 2, 6, 6, 7, 3,
            0, 3, 7, 7, 4, 0,
            1, 5, 6, 6, 2, 1,
        ];
        SceneGeometry::Mesh { positions, indices }
    }

    pub fn two_volumes_and_cube() -> Scene {
        let volume = || SceneGeometry::Volume {
            dims: [2, 2, 2],
            voxels: vec![1, 0, 0, 1, 0, 1, 1, 0],
        };
        Scene {
            objects: vec![
                SceneObject {
                    geometry: volume(),
                    transform: translated(-4.0, 0.0, 0.0),
                },
                SceneObject {
                    geometry: volume(),
                    transform: translated(4.0, 0.0, 0.0),
                },
                SceneObject {
                    geometry: cube(),
                    transform: IDENTITY_TRANSFORM,
                },
            ],
            texture: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::mock::{MockDevice, MockFailure};
    use crate::raytracing::tlas::{IDENTITY_TRANSFORM, TRIANGLE_HIT_GROUP, VOLUME_HIT_GROUP};

    // ========================================================================
    // RayTracer
    // ========================================================================

    #[test]
    fn test_scene_objects_map_to_instances() {
        let mut res = ResourceManager::new(MockDevice::new());
        let layout = create_global_set_layout(res.device()).unwrap();
        let tracer = RayTracer::init(
            &mut res,
            &RtConfig::default(),
            &two_volumes_and_cube(),
            &stub_shaders(),
            layout,
        )
        .unwrap();

        assert_eq!(tracer.blas().entries().len(), 3);
        let instances = tracer.tlas().instances();
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].sbt_offset(), VOLUME_HIT_GROUP);
        assert_eq!(instances[2].sbt_offset(), TRIANGLE_HIT_GROUP);
        for (i, instance) in instances.iter().enumerate() {
            assert_eq!(instance.custom_index(), i as u32);
            assert_eq!(
                instance.acceleration_structure_reference,
                tracer.blas().entries()[i].device_address
            );
        }
        assert!(tracer.registry().is_frozen());
        assert_eq!(tracer.registry().volume_count(), 2);

        tracer.destroy(&mut res).unwrap();
        assert_eq!(res.live_buffers(), 0);
        assert_eq!(res.live_images(), 0);
    }

    #[test]
    fn test_bad_mesh_rejected_and_unwound() {
        let mut res = ResourceManager::new(MockDevice::new());
        let layout = create_global_set_layout(res.device()).unwrap();
        let scene = Scene {
            objects: vec![SceneObject {
                geometry: SceneGeometry::Mesh {
                    positions: vec![[0.0; 3]; 3],
                    indices: vec![0, 1],
                },
                transform: IDENTITY_TRANSFORM,
            }],
            texture: None,
        };
        assert!(RayTracer::init(&mut res, &RtConfig::default(), &scene, &stub_shaders(), layout).is_err());
        assert_eq!(res.live_buffers(), 0);
    }

    #[test]
    fn test_render_binds_slot_set() {
        let mut res = ResourceManager::new(MockDevice::new());
        let layout = create_global_set_layout(res.device()).unwrap();
        let tracer = RayTracer::init(
            &mut res,
            &RtConfig::default(),
            &two_volumes_and_cube(),
            &stub_shaders(),
            layout,
        )
        .unwrap();
        let cmd = res.device().allocate_command_buffers(1).unwrap()[0];
        res.device().begin_command_buffer(cmd).unwrap();
        let extent = vk::Extent2D { width: 8, height: 8 };
        tracer
            .render(res.device(), cmd, 1, extent, vk::DescriptorSet::null())
            .unwrap();

        let recorded = res.device().recorded(cmd);
        assert!(recorded.contains(&crate::mock::MockCommand::BindDescriptorSets {
            first_set: 0,
            sets: vec![vk::DescriptorSet::null(), tracer.bindings.set(1)],
        }));
        assert!(recorded.contains(&crate::mock::MockCommand::TraceRays { extent }));
    }

    // ========================================================================
    // Renderer
    // ========================================================================

    #[test]
    fn test_boot_failure_is_reported() {
        let device = MockDevice::new();
        device.fail_next(MockFailure::CreateAccel);
        let err = Renderer::init(device, RtConfig::default(), &two_volumes_and_cube(), &stub_shaders())
            .err()
            .unwrap();
        assert!(matches!(err, RendererError::Boot(RtError::ResourceCreation { .. })));
    }

    #[test]
    fn test_missing_shader_is_boot_failure() {
        let err = Renderer::init(
            MockDevice::new(),
            RtConfig::default(),
            &two_volumes_and_cube(),
            &ShaderLibrary::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err.inner(), RtError::Shader { .. }));
    }

    #[test]
    fn test_render_failure_is_reported() {
        let mut renderer =
            Renderer::init(MockDevice::new(), RtConfig::default(), &two_volumes_and_cube(), &stub_shaders()).unwrap();
        renderer.device().fail_next(MockFailure::SubmitDeviceLost);
        let err = renderer.draw_frame(&FrameUniforms::default()).unwrap_err();
        assert!(matches!(err, RendererError::Render(RtError::DeviceLost)));
    }

    #[test]
    fn test_rejected_submission_is_submit_failure() {
        let mut renderer =
            Renderer::init(MockDevice::new(), RtConfig::default(), &two_volumes_and_cube(), &stub_shaders()).unwrap();
        renderer.device().fail_next(MockFailure::FrameSubmit);
        let err = renderer.draw_frame(&FrameUniforms::default()).unwrap_err();
        assert!(matches!(err, RendererError::Render(RtError::Submit { .. })), "{err:?}");
    }

    #[test]
    fn test_rebuild_instances_rebinds_new_structure() {
        let mut renderer =
            Renderer::init(MockDevice::new(), RtConfig::default(), &two_volumes_and_cube(), &stub_shaders()).unwrap();
        renderer.draw_frame(&FrameUniforms::default()).unwrap();
        let old_accel = renderer.tracer().tlas().accel().unwrap();

        let mut instances = renderer.tracer().tlas().instances().to_vec();
        instances.truncate(2);
        instances[1].transform = translated(4.0, 0.0, 0.0);
        renderer.rebuild_instances(instances).unwrap();

        let new_accel = renderer.tracer().tlas().accel().unwrap();
        assert_ne!(new_accel, old_accel);
        assert_eq!(renderer.device().structure_instances(new_accel).len(), 2);
        for _ in 0..2 {
            renderer.draw_frame(&FrameUniforms::default()).unwrap();
        }
        let dispatches = renderer.device().dispatches();
        for dispatch in &dispatches[dispatches.len() - 2..] {
            assert_eq!(dispatch.accel, Some(new_accel));
        }
        assert!(renderer.device().violations().is_empty(), "{:?}", renderer.device().violations());

        let device = renderer.destroy().unwrap();
        assert!(device.live_objects().is_empty(), "{:?}", device.live_objects());
    }

    #[test]
    fn test_rebuild_failure_is_render_failure() {
        let mut renderer =
            Renderer::init(MockDevice::new(), RtConfig::default(), &two_volumes_and_cube(), &stub_shaders()).unwrap();
        renderer.device().fail_next(MockFailure::OneShotSubmit);
        let instances = renderer.tracer().tlas().instances().to_vec();
        let err = renderer.rebuild_instances(instances).unwrap_err();
        assert!(matches!(err, RendererError::Render(RtError::Build(_))), "{err:?}");
    }

    #[test]
    fn test_destroy_leaves_nothing_live() {
        let mut renderer =
            Renderer::init(MockDevice::new(), RtConfig::default(), &two_volumes_and_cube(), &stub_shaders()).unwrap();
        renderer.draw_frame(&FrameUniforms::default()).unwrap();
        renderer.set_instance_transform(0, translated(0.0, 2.0, 0.0)).unwrap();
        renderer.draw_frame(&FrameUniforms::default()).unwrap();

        let device = renderer.destroy().unwrap();
        assert!(device.live_objects().is_empty(), "{:?}", device.live_objects());
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }
}
