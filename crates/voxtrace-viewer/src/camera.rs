//! Orbit camera producing the frame uniforms.

use glam::{Mat4, Vec3};

use voxtrace_renderer::frame::FrameUniforms;

pub struct OrbitCamera {
    pub target: Vec3,
    pub distance: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub fov_y: f32,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            target: Vec3::new(0.0, 4.0, 0.0),
            distance: 40.0,
            yaw: 0.6,
            pitch: 0.35,
            fov_y: 60f32.to_radians(),
        }
    }
}

impl OrbitCamera {
    pub fn eye(&self) -> Vec3 {
        let (sy, cy) = self.yaw.sin_cos();
        let (sp, cp) = self.pitch.sin_cos();
        self.target + self.distance * Vec3::new(cp * sy, sp, cp * cy)
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye(), self.target, Vec3::Y)
    }

    /// Vulkan clip space: y down, depth 0..1.
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y, aspect.max(1e-3), 0.1, 1000.0);
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn orbit(&mut self, d_yaw: f32, d_pitch: f32) {
        self.yaw += d_yaw;
        self.pitch = (self.pitch + d_pitch).clamp(-1.5, 1.5);
    }

    pub fn zoom(&mut self, factor: f32) {
        self.distance = (self.distance * factor).clamp(2.0, 500.0);
    }

    pub fn uniforms(&self, width: u32, height: u32) -> FrameUniforms {
        let aspect = width as f32 / height.max(1) as f32;
        FrameUniforms::new(
            self.view().inverse().to_cols_array_2d(),
            self.projection(aspect).inverse().to_cols_array_2d(),
        )
    }
}
