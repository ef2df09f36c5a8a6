//! Orbiting camera and the per-frame camera uniforms.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::scene::Framing;

const FOV_Y: f32 = std::f32::consts::FRAC_PI_4;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 1000.0;

/// Camera data read by the trace shader.
///
/// The four corners are the near-plane points of the screen corners in view
/// space, ordered bottom-left, bottom-right, top-left, top-right in NDC. A
/// shader interpolates them by pixel and moves the result to world space
/// with `inverse_view`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniforms {
    pub corners: [[f32; 4]; 4],
    pub inverse_view: [[f32; 4]; 4],
}

impl CameraUniforms {
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        let inverse_projection = projection.inverse();
        let corner = |x: f32, y: f32| {
            let point = inverse_projection * Vec4::new(x, y, 0.0, 1.0);
            (point / point.w).to_array()
        };
        Self {
            corners: [corner(-1.0, -1.0), corner(1.0, -1.0), corner(-1.0, 1.0), corner(1.0, 1.0)],
            inverse_view: view.inverse().to_cols_array_2d(),
        }
    }
}

/// Vulkan projection: zero-to-one depth with y pointing down.
pub fn projection(aspect: f32) -> Mat4 {
    Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0)) * Mat4::perspective_rh(FOV_Y, aspect, Z_NEAR, Z_FAR)
}

/// A camera circling a target at constant height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbitCamera {
    pub framing: Framing,
    /// Radians per second.
    pub speed: f32,
}

impl OrbitCamera {
    pub fn new(framing: Framing) -> Self {
        Self { framing, speed: 0.2 }
    }

    pub fn eye(&self, elapsed: f32) -> Vec3 {
        let angle = elapsed * self.speed;
        let Framing {
            target,
            distance,
            height,
        } = self.framing;
        target + Vec3::new(angle.cos() * distance, height, angle.sin() * distance)
    }

    pub fn view(&self, elapsed: f32) -> Mat4 {
        Mat4::look_at_rh(self.eye(elapsed), self.framing.target, Vec3::Y)
    }

    /// Uniforms for a `width` × `height` target, `elapsed` seconds in.
    pub fn uniforms(&self, width: u32, height: u32, elapsed: f32) -> CameraUniforms {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        CameraUniforms::new(self.view(elapsed), projection(aspect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn camera() -> OrbitCamera {
        OrbitCamera::new(Framing {
            target: Vec3::new(16.0, 20.0, 16.0),
            distance: 128.0,
            height: 30.0,
        })
    }

    #[test]
    fn uniforms_are_two_matrices() {
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 128);
    }

    #[test]
    fn corners_lie_on_the_near_plane() {
        let uniforms = CameraUniforms::new(Mat4::IDENTITY, projection(16.0 / 9.0));
        for corner in uniforms.corners {
            assert_abs_diff_eq!(corner[2], -Z_NEAR, epsilon = 1e-5);
            assert_abs_diff_eq!(corner[3], 1.0, epsilon = 1e-6);
        }

        // NDC y points down, so the first row of corners is the top of the
        // view.
        let [bottom_left, bottom_right, top_left, _] = uniforms.corners;
        assert!(bottom_left[0] < 0.0 && bottom_right[0] > 0.0);
        assert!(bottom_left[1] > 0.0 && top_left[1] < 0.0);

        let half_height = Z_NEAR * (FOV_Y * 0.5).tan();
        assert_abs_diff_eq!(bottom_left[1], half_height, epsilon = 1e-5);
        assert_abs_diff_eq!(bottom_right[0], half_height * 16.0 / 9.0, epsilon = 1e-5);
    }

    #[test]
    fn inverse_view_holds_the_eye() {
        let camera = camera();
        let uniforms = camera.uniforms(1280, 720, 3.0);
        let eye = camera.eye(3.0);
        let translation = uniforms.inverse_view[3];
        assert_abs_diff_eq!(translation[0], eye.x, epsilon = 1e-3);
        assert_abs_diff_eq!(translation[1], eye.y, epsilon = 1e-3);
        assert_abs_diff_eq!(translation[2], eye.z, epsilon = 1e-3);
    }

    #[test]
    fn orbit_keeps_distance_and_height() {
        let camera = camera();
        for t in [0.0, 1.7, 12.5] {
            let offset = camera.eye(t) - camera.framing.target;
            assert_abs_diff_eq!(offset.y, 30.0, epsilon = 1e-4);
            assert_abs_diff_eq!(Vec3::new(offset.x, 0.0, offset.z).length(), 128.0, epsilon = 1e-3);
        }
        assert_abs_diff_eq!(camera.eye(0.0).x, 144.0, epsilon = 1e-4);
    }

    #[test]
    fn zero_height_target_does_not_divide_by_zero() {
        let uniforms = camera().uniforms(800, 0, 0.0);
        assert!(uniforms.corners.iter().flatten().all(|v| v.is_finite()));
    }
}
