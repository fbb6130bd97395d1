//! Demo scene: two voxel volumes and a textured cube.

use std::path::Path;

use glam::{Mat4, Quat, Vec3};
use rayon::prelude::*;
use tracing::info;

use voxtrace_renderer::raytracing::tlas::transform_from_cols;
use voxtrace_renderer::renderer::{Scene, SceneGeometry, SceneObject, TextureData};

/// Index of the cube among the scene's instances.
pub const CUBE_INSTANCE: u32 = 2;

/// Ball of voxels, shaded by height.
pub fn sphere_volume(size: u32) -> Vec<u8> {
    let center = (size as f32 - 1.0) * 0.5;
    let radius = size as f32 * 0.45;
    fill_volume(size, |x, y, z| {
        let d = Vec3::new(x as f32 - center, y as f32 - center, z as f32 - center).length();
        if d <= radius {
            1 + (y * 6 / size) as u8
        } else {
            0
        }
    })
}

/// Rolling terrain: columns up to a height field.
pub fn terrain_volume(size: u32) -> Vec<u8> {
    let s = size as f32;
    fill_volume(size, |x, y, z| {
        let (fx, fz) = (x as f32 / s, z as f32 / s);
        let height = s * (0.35 + 0.15 * (fx * 9.0).sin() * (fz * 7.0).cos() + 0.1 * (fx * 23.0 + fz * 17.0).sin());
        if (y as f32) < height {
            if (y as f32) > height - 1.5 {
                7
            } else {
                3
            }
        } else {
            0
        }
    })
}

/// `size³` voxels, x fastest, filled one z slice per task.
fn fill_volume(size: u32, voxel: impl Fn(u32, u32, u32) -> u8 + Sync) -> Vec<u8> {
    let slice = (size * size) as usize;
    let mut voxels = vec![0u8; slice * size as usize];
    voxels.par_chunks_mut(slice).enumerate().for_each(|(z, chunk)| {
        for (i, v) in chunk.iter_mut().enumerate() {
            let x = i as u32 % size;
            let y = i as u32 / size;
            *v = voxel(x, y, z as u32);
        }
    });
    voxels
}

pub fn cube() -> SceneGeometry {
    let positions = vec![
        [-1.0, -1.0, -1.0],
        [1.0, -1.0, -1.0],
        [1.0, 1.0, -1.0],
        [-1.0, 1.0, -1.0],
        [-1.0, -1.0, 1.0],
        [1.0, -1.0, 1.0],
        [1.0, 1.0, 1.0],
        [-1.0, 1.0, 1.0],
    ];
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 2, 0, 3,
        4, 5, 6, 6, 7, 4,
        0, 1, 5, 5, 4, 0,
        3, 6, 2, 6, 3, 7,
        0, 4, 7, 7, 3, 0,
        1, 2, 6, 6, 5, 1,
    ];
    SceneGeometry::Mesh { positions, indices }
}

/// Cube transform at time `t` seconds: spinning and bobbing above the volumes.
pub fn cube_transform(t: f32) -> [f32; 12] {
    let model = Mat4::from_scale_rotation_translation(
        Vec3::splat(3.0),
        Quat::from_rotation_y(t * 0.8) * Quat::from_rotation_x(t * 0.3),
        Vec3::new(0.0, 14.0 + (t * 1.5).sin() * 2.0, 0.0),
    );
    transform_from_cols(model.to_cols_array_2d())
}

fn checkerboard(size: u32) -> TextureData {
    let rgba = (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x / 8 + y / 8) % 2 == 0 {
                [230, 230, 230, 255]
            } else {
                [200, 60, 40, 255]
            }
        })
        .collect();
    TextureData {
        width: size,
        height: size,
        rgba,
    }
}

fn load_texture(path: &Path) -> Result<TextureData, image::ImageError> {
    let image = image::open(path)?.to_rgba8();
    Ok(TextureData {
        width: image.width(),
        height: image.height(),
        rgba: image.into_raw(),
    })
}

pub fn demo_scene(volume_size: u32, texture: Option<&Path>) -> Result<Scene, image::ImageError> {
    let texture = match texture {
        Some(path) => load_texture(path)?,
        None => checkerboard(64),
    };
    let (sphere, terrain) = rayon::join(|| sphere_volume(volume_size), || terrain_volume(volume_size));
    let dims = [volume_size; 3];
    let half = volume_size as f32 * 0.5;

    let place = |x: f32| transform_from_cols(Mat4::from_translation(Vec3::new(x - half, 0.0, -half)).to_cols_array_2d());
    let objects = vec![
        SceneObject {
            geometry: SceneGeometry::Volume { dims, voxels: terrain },
            transform: place(-half - 1.0),
        },
        SceneObject {
            geometry: SceneGeometry::Volume { dims, voxels: sphere },
            transform: place(half + 1.0),
        },
        SceneObject {
            geometry: cube(),
            transform: cube_transform(0.0),
        },
    ];
    info!(volume_size, objects = objects.len(), "demo scene generated");
    Ok(Scene {
        objects,
        texture: Some(texture),
    })
}
