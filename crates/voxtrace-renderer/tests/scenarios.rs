//! End-to-end scenarios against the headless device.

use ash::vk;
use gpu_allocator::MemoryLocation;

use voxtrace_renderer::config::RtConfig;
use voxtrace_renderer::device::{BufferDesc, DescriptorWrite};
use voxtrace_renderer::frame::{FrameStatus, FrameUniforms};
use voxtrace_renderer::mock::{MockCommand, MockDevice};
use voxtrace_renderer::raytracing::geometry::{GeometryRegistry, TriangleMesh, POSITION_SIZE};
use voxtrace_renderer::raytracing::pipeline::{pipeline_layout_of, ShaderLibrary, SHADER_GROUPS};
use voxtrace_renderer::raytracing::tlas::{InstanceRecord, TopLevelBuilder, IDENTITY_TRANSFORM};
use voxtrace_renderer::raytracing::BottomLevelBuilder;
use voxtrace_renderer::renderer::{Renderer, Scene, SceneGeometry, SceneObject};
use voxtrace_renderer::resources::ResourceManager;

fn stub_shaders() -> ShaderLibrary {
    let mut library = ShaderLibrary::new();
    for (name, _) in pipeline_layout_of(SHADER_GROUPS).0 {
        library.insert(name, vec![0x0723_0203, 0x0001_0500]);
    }
    library
}

fn translated(x: f32, y: f32, z: f32) -> [f32; 12] {
    let mut t = IDENTITY_TRANSFORM;
    t[3] = x;
    t[7] = y;
    t[11] = z;
    t
}

fn cube_positions() -> Vec<[f32; 3]> {
    vec![
        [-1.0, -1.0, -1.0],
        [1.0, -1.0, -1.0],
        [1.0, 1.0, -1.0],
        [-1.0, 1.0, -1.0],
        [-1.0, -1.0, 1.0],
        [1.0, -1.0, 1.0],
        [1.0, 1.0, 1.0],
        [-1.0, 1.0, 1.0],
    ]
}

/// Two faces of the cube: 4 triangles, 12 indices.
fn cube_indices() -> Vec<u32> {
    vec![0, 1, 2, 2, 3, 0, 4, 6, 5, 6, 4, 7]
}

fn upload_mesh(res: &mut ResourceManager<MockDevice>, positions: &[[f32; 3]], indices: &[u32]) -> TriangleMesh {
    let usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    let vertex_bytes: &[u8] = bytemuck::cast_slice(positions);
    let vertices = res
        .create_buffer_with_data(
            &BufferDesc {
                name: "vertices",
                size: vertex_bytes.len() as u64,
                usage,
                location: MemoryLocation::GpuOnly,
            },
            vertex_bytes,
        )
        .unwrap();
    let index_bytes: &[u8] = bytemuck::cast_slice(indices);
    let index_buffer = res
        .create_buffer_with_data(
            &BufferDesc {
                name: "indices",
                size: index_bytes.len() as u64,
                usage,
                location: MemoryLocation::GpuOnly,
            },
            index_bytes,
        )
        .unwrap();
    TriangleMesh::from_buffers(
        res,
        vertices,
        POSITION_SIZE,
        positions.len() as u32,
        index_buffer,
        indices.len() as u32,
    )
    .unwrap()
}

fn small_volume() -> (Vec<u8>, [u32; 3]) {
    (vec![1, 0, 1, 0, 0, 1, 0, 1], [2, 2, 2])
}

fn demo_scene() -> Scene {
    let (voxels, dims) = small_volume();
    Scene {
        objects: vec![
            SceneObject {
                geometry: SceneGeometry::Volume {
                    dims,
                    voxels: voxels.clone(),
                },
                transform: translated(-3.0, 0.0, 0.0),
            },
            SceneObject {
                geometry: SceneGeometry::Volume { dims, voxels },
                transform: translated(3.0, 0.0, 0.0),
            },
            SceneObject {
                geometry: SceneGeometry::Mesh {
                    positions: cube_positions(),
                    indices: cube_indices(),
                },
                transform: IDENTITY_TRANSFORM,
            },
        ],
        texture: None,
    }
}

// ============================================================================
// Acceleration structures
// ============================================================================

#[test]
fn test_two_volumes_and_a_mesh() {
    let mut res = ResourceManager::new(MockDevice::new());
    let mut registry = GeometryRegistry::new();
    let (voxels, dims) = small_volume();
    registry.add_volume(&mut res, dims, &voxels).unwrap();
    registry.add_volume(&mut res, dims, &voxels).unwrap();
    let mesh = upload_mesh(&mut res, &cube_positions(), &cube_indices());
    registry.add_triangles(mesh).unwrap();

    let mut blas = BottomLevelBuilder::new(&RtConfig::default());
    blas.add_all(&mut registry).unwrap();
    let report = blas.build(&mut res).unwrap();
    assert_eq!(report.entries, 3);
    assert_eq!(blas.entries().len(), 3);
    assert!(blas.entries().iter().all(|e| e.device_address != 0));

    let mut tlas = TopLevelBuilder::new(2);
    tlas.add_volume_instance(&blas, 0, translated(-3.0, 0.0, 0.0)).unwrap();
    tlas.add_volume_instance(&blas, 1, translated(3.0, 0.0, 0.0)).unwrap();
    tlas.add_triangle_instance(&blas, 2, IDENTITY_TRANSFORM).unwrap();
    tlas.build(&mut res).unwrap();

    let built = res.device().structure_instances(tlas.accel().unwrap());
    assert_eq!(built.len(), 3);
    for instance in &built {
        let entry = &blas.entries()[instance.custom_index() as usize];
        assert_eq!(instance.acceleration_structure_reference, entry.device_address);
    }
    assert!(res.device().violations().is_empty(), "{:?}", res.device().violations());
}

#[test]
fn test_batch_limit_splits_submissions() {
    let mut res = ResourceManager::new(MockDevice::new());
    let mut registry = GeometryRegistry::new();
    let (voxels, dims) = small_volume();
    for _ in 0..4 {
        registry.add_volume(&mut res, dims, &voxels).unwrap();
    }

    let config = RtConfig {
        blas_batch_limit: 1000,
        ..RtConfig::default()
    };
    let mut blas = BottomLevelBuilder::new(&config);
    blas.add_all(&mut registry).unwrap();

    let before = res.device().one_shot_submissions();
    let report = blas.build(&mut res).unwrap();
    let submissions = res.device().one_shot_submissions() - before;

    assert!(report.batches > 1);
    assert_eq!(submissions, report.batches);
    assert_eq!(blas.entries().len(), 4);
}

#[test]
fn test_refit_twice_keeps_handle() {
    let mut res = ResourceManager::new(MockDevice::new());
    let mut tlas = TopLevelBuilder::new(2);
    tlas.add_instance(InstanceRecord::new(IDENTITY_TRANSFORM, 0, 0x1000)).unwrap();
    tlas.add_instance(InstanceRecord::new(IDENTITY_TRANSFORM, 1, 0x2000)).unwrap();
    tlas.build(&mut res).unwrap();
    let accel = tlas.accel().unwrap();

    let first = vec![
        InstanceRecord::new(translated(1.0, 0.0, 0.0), 0, 0x1000),
        InstanceRecord::new(translated(2.0, 0.0, 0.0), 1, 0x2000),
    ];
    tlas.update(&res, &first).unwrap();
    let second = vec![
        InstanceRecord::new(translated(0.0, 5.0, 0.0), 0, 0x1000),
        InstanceRecord::new(translated(0.0, 6.0, 0.0), 1, 0x2000),
    ];
    tlas.update(&res, &second).unwrap();

    assert_eq!(tlas.accel().unwrap(), accel);
    assert_eq!(res.device().structure_build_counts(accel), (1, 2));
    assert_eq!(res.device().structure_instances(accel), second);
}

// ============================================================================
// Frame loop
// ============================================================================

#[test]
fn test_slots_never_rerecorded_in_flight() {
    let mut renderer = Renderer::init(MockDevice::new(), RtConfig::default(), &demo_scene(), &stub_shaders()).unwrap();
    for frame in 0..16u32 {
        let status = renderer.draw_frame(&FrameUniforms::default()).unwrap();
        assert_eq!(status, FrameStatus::Presented);
        if frame % 3 == 0 {
            renderer
                .set_instance_transform(2, translated(0.0, frame as f32, 0.0))
                .unwrap();
        }
    }
    let device = renderer.device();
    assert_eq!(device.frames().len(), 16);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn test_transform_change_refits_inside_frame() {
    let mut renderer = Renderer::init(MockDevice::new(), RtConfig::default(), &demo_scene(), &stub_shaders()).unwrap();
    renderer.draw_frame(&FrameUniforms::default()).unwrap();
    renderer.set_instance_transform(2, translated(0.0, 4.0, 0.0)).unwrap();
    renderer.draw_frame(&FrameUniforms::default()).unwrap();

    let accel = renderer.tracer().tlas().accel().unwrap();
    let frames = renderer.device().frames();
    let build = frames[1]
        .commands
        .iter()
        .position(|c| matches!(c, MockCommand::BuildAccel { .. }))
        .unwrap();
    let trace = frames[1]
        .commands
        .iter()
        .position(|c| matches!(c, MockCommand::TraceRays { .. }))
        .unwrap();
    assert!(build < trace);
    assert!(!frames[0]
        .commands
        .iter()
        .any(|c| matches!(c, MockCommand::BuildAccel { .. })));
    assert_eq!(renderer.device().structure_instances(accel)[2].transform[7], 4.0);
}

#[test]
fn test_forced_recreate_rebinds_new_images() {
    let mut renderer = Renderer::init(MockDevice::new(), RtConfig::default(), &demo_scene(), &stub_shaders()).unwrap();
    renderer.draw_frame(&FrameUniforms::default()).unwrap();
    let old = renderer.frames().output_images();

    renderer.device().force_stale();
    assert_eq!(
        renderer.draw_frame(&FrameUniforms::default()).unwrap(),
        FrameStatus::Recreated
    );

    let new = renderer.frames().output_images();
    let bound: Vec<_> = renderer
        .tracer()
        .bound_output_images()
        .iter()
        .map(|id| id.unwrap())
        .collect();
    assert_eq!(bound, new);
    for id in &bound {
        assert!(renderer.resources().is_live_image(*id));
        assert!(!old.contains(id));
    }
}

#[test]
fn test_resize_mid_sequence() {
    let mut renderer = Renderer::init(MockDevice::new(), RtConfig::default(), &demo_scene(), &stub_shaders()).unwrap();
    renderer.draw_frame(&FrameUniforms::default()).unwrap();
    renderer.draw_frame(&FrameUniforms::default()).unwrap();

    renderer.notify_resize(800, 600);
    for _ in 0..3 {
        assert_eq!(
            renderer.draw_frame(&FrameUniforms::default()).unwrap(),
            FrameStatus::Presented
        );
    }

    let device = renderer.device();
    assert_eq!(device.target_recreations(), 1);
    let dispatches = device.dispatches();
    assert_eq!(dispatches.len(), 5);
    let current_views: Vec<_> = renderer
        .frames()
        .output_images()
        .iter()
        .map(|id| renderer.resources().image(*id).unwrap().view)
        .collect();
    for dispatch in &dispatches[2..] {
        assert_eq!(dispatch.extent, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(dispatch.output_views.len(), 1);
        assert!(current_views.contains(&dispatch.output_views[0]));
        assert!(device.is_live_view(dispatch.output_views[0]));
    }
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn test_dispatch_sees_scene_bindings() {
    let mut renderer = Renderer::init(MockDevice::new(), RtConfig::default(), &demo_scene(), &stub_shaders()).unwrap();
    renderer.draw_frame(&FrameUniforms::default()).unwrap();

    let accel = renderer.tracer().tlas().accel().unwrap();
    let dispatch = &renderer.device().dispatches()[0];
    assert_eq!(dispatch.accel, Some(accel));
    assert_eq!(dispatch.sets.len(), 2);
    assert_eq!(dispatch.sets[0], renderer.frames().global_set(0));

    let writes = renderer.device().descriptor_writes(dispatch.sets[1]);
    let volumes = writes.iter().find_map(|w| match w {
        DescriptorWrite::StorageImages { binding: 4, views, .. } => Some(views.len()),
        _ => None,
    });
    assert_eq!(volumes, Some(2));
}

#[test]
fn test_mesh_only_scene_binds_placeholder_volume() {
    let scene = Scene {
        objects: vec![SceneObject {
            geometry: SceneGeometry::Mesh {
                positions: cube_positions(),
                indices: cube_indices(),
            },
            transform: IDENTITY_TRANSFORM,
        }],
        texture: None,
    };
    let mut renderer = Renderer::init(MockDevice::new(), RtConfig::default(), &scene, &stub_shaders()).unwrap();
    assert_eq!(renderer.tracer().registry().volume_count(), 0);
    for _ in 0..2 {
        assert_eq!(
            renderer.draw_frame(&FrameUniforms::default()).unwrap(),
            FrameStatus::Presented
        );
    }

    let dispatches = renderer.device().dispatches();
    assert_eq!(dispatches.len(), 2);
    assert_ne!(dispatches[0].sets[1], dispatches[1].sets[1]);
    for dispatch in &dispatches {
        let writes = renderer.device().descriptor_writes(dispatch.sets[1]);
        assert_eq!(writes.len(), 5);
        let volumes = writes.iter().find_map(|w| match w {
            DescriptorWrite::StorageImages { binding: 4, views, .. } => Some(views.clone()),
            _ => None,
        });
        let views = volumes.unwrap();
        assert_eq!(views.len(), 1);
        assert!(renderer.device().is_live_view(views[0]));
    }
    assert!(renderer.device().violations().is_empty(), "{:?}", renderer.device().violations());

    let device = renderer.destroy().unwrap();
    assert!(device.live_objects().is_empty(), "{:?}", device.live_objects());
}

#[test]
fn test_shutdown_releases_everything() {
    let mut renderer = Renderer::init(MockDevice::new(), RtConfig::default(), &demo_scene(), &stub_shaders()).unwrap();
    renderer.draw_frame(&FrameUniforms::default()).unwrap();
    renderer.notify_resize(320, 200);
    renderer.draw_frame(&FrameUniforms::default()).unwrap();

    let device = renderer.destroy().unwrap();
    assert!(device.live_objects().is_empty(), "{:?}", device.live_objects());
}
