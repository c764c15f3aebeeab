use std::f32::consts::TAU;

use nalgebra_glm as glm;
use vulkanalia::vk;

use crate::config::{CAMERA_EYE, SPIN_AXIS, SPIN_RATE_DEGREES};

/// Per-frame uniform payload. Three column-major matrices, tightly packed in
/// the order the vertex shader declares them.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct UniformBufferObject {
    pub model: glm::Mat4,
    pub view: glm::Mat4,
    pub proj: glm::Mat4,
}

impl UniformBufferObject {
    pub fn new() -> Self {
        Self { model: glm::identity(), view: glm::identity(), proj: glm::identity() }
    }

    /// The transforms `elapsed` seconds after start for the given extent.
    pub fn at(elapsed: f32, extent: vk::Extent2D, spin: &Spin, camera: &Camera) -> Self {
        Self { model: spin.model(elapsed), view: camera.view(), proj: camera.projection(extent) }
    }
}

impl Default for UniformBufferObject {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant-rate rotation about a fixed axis.
#[derive(Copy, Clone, Debug)]
pub struct Spin {
    pub axis: glm::Vec3,
    /// Radians per second.
    pub rate: f32,
}

impl Default for Spin {
    fn default() -> Self {
        Self {
            axis: glm::make_vec3(&SPIN_AXIS),
            rate: glm::radians(&glm::vec1(SPIN_RATE_DEGREES))[0],
        }
    }
}

impl Spin {
    /// Elapsed time is wrapped into [0, 2π) seconds before scaling by the
    /// rate, so long runs keep their precision.
    pub fn angle(&self, elapsed: f32) -> f32 {
        elapsed.rem_euclid(TAU) * self.rate
    }

    pub fn model(&self, elapsed: f32) -> glm::Mat4 {
        glm::rotate(&glm::identity(), self.angle(elapsed), &self.axis)
    }
}

/// A fixed eye looking at the origin.
#[derive(Copy, Clone, Debug)]
pub struct Camera {
    pub eye: glm::Vec3,
    pub target: glm::Vec3,
    pub up: glm::Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: glm::make_vec3(&CAMERA_EYE),
            target: glm::vec3(0.0, 0.0, 0.0),
            up: glm::vec3(0.0, 0.0, 1.0),
            fov_y: glm::radians(&glm::vec1(45.0))[0],
            near: 0.1,
            far: 10.0,
        }
    }
}

impl Camera {
    pub fn view(&self) -> glm::Mat4 {
        glm::look_at(&self.eye, &self.target, &self.up)
    }

    /// Right-handed, zero-to-one depth, with Y flipped for Vulkan clip space.
    pub fn projection(&self, extent: vk::Extent2D) -> glm::Mat4 {
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        let mut proj = glm::perspective_rh_zo(aspect, self.fov_y, self.near, self.far);
        proj[(1, 1)] *= -1.0;
        proj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::mem::size_of;

    const EPSILON: f32 = 1e-5;

    /// Rodrigues' formula written out by hand.
    #[rustfmt::skip]
    fn reference_rotation(axis: glm::Vec3, angle: f32) -> glm::Mat4 {
        let k = axis.normalize();
        let (s, c) = angle.sin_cos();
        let t = 1.0 - c;
        glm::mat4(
            t * k.x * k.x + c,       t * k.x * k.y - s * k.z, t * k.x * k.z + s * k.y, 0.0,
            t * k.x * k.y + s * k.z, t * k.y * k.y + c,       t * k.y * k.z - s * k.x, 0.0,
            t * k.x * k.z - s * k.y, t * k.y * k.z + s * k.x, t * k.z * k.z + c,       0.0,
            0.0,                     0.0,                     0.0,                     1.0,
        )
    }

    #[test]
    fn payload_is_three_packed_matrices() {
        assert_eq!(size_of::<UniformBufferObject>(), 3 * 16 * size_of::<f32>());
    }

    #[test]
    fn model_matches_reference_rotation() {
        let spin = Spin::default();
        for t in [0.0, 0.25, 1.0, 2.5, 3.999, 6.0] {
            let expected = reference_rotation(glm::vec3(0.0, 0.0, 1.0), t * spin.rate);
            assert_relative_eq!(spin.model(t), expected, epsilon = EPSILON);
        }
    }

    #[test]
    fn model_about_arbitrary_axis() {
        let spin = Spin { axis: glm::vec3(1.0, 2.0, -0.5), rate: 1.0 };
        for t in [0.1, 1.7, 3.0, 5.5] {
            let expected = reference_rotation(spin.axis, t);
            assert_relative_eq!(spin.model(t), expected, epsilon = EPSILON);
        }
    }

    #[test]
    fn elapsed_time_wraps_before_scaling() {
        let spin = Spin { axis: glm::vec3(0.0, 0.0, 1.0), rate: 2.0 };
        assert_relative_eq!(spin.angle(TAU + 0.5), 1.0, epsilon = EPSILON);
        assert_relative_eq!(spin.model(TAU + 0.5), spin.model(0.5), epsilon = EPSILON);
        let default_rate = Spin::default();
        assert!(default_rate.angle(1.0e4) < TAU * default_rate.rate);
    }

    #[test]
    fn model_past_one_period_uses_wrapped_time() {
        let spin = Spin::default();
        for t in [7.0, 12.5, 100.0] {
            let expected = reference_rotation(glm::vec3(0.0, 0.0, 1.0), (t % TAU) * spin.rate);
            assert_relative_eq!(spin.model(t), expected, epsilon = 1e-4);
        }
        assert_relative_eq!(spin.angle(7.0), (7.0 - TAU) * spin.rate, epsilon = EPSILON);
    }

    #[test]
    fn projection_flips_y_and_uses_aspect() {
        let camera = Camera::default();
        let proj = camera.projection(vk::Extent2D { width: 800, height: 600 });
        assert!(proj[(1, 1)] < 0.0);
        assert_relative_eq!(proj[(0, 0)] * (800.0 / 600.0), -proj[(1, 1)], epsilon = EPSILON);
    }

    #[test]
    fn view_keeps_the_origin_in_front() {
        let camera = Camera::default();
        let origin = camera.view() * glm::vec4(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(origin.x, 0.0, epsilon = EPSILON);
        assert_relative_eq!(origin.y, 0.0, epsilon = EPSILON);
        assert_relative_eq!(-origin.z, glm::length(&camera.eye), epsilon = EPSILON);
    }

    #[test]
    fn payload_combines_the_three_transforms() {
        let spin = Spin::default();
        let camera = Camera::default();
        let extent = vk::Extent2D { width: 1024, height: 768 };
        let ubo = UniformBufferObject::at(1.5, extent, &spin, &camera);
        assert_relative_eq!(ubo.model, spin.model(1.5), epsilon = EPSILON);
        assert_relative_eq!(ubo.view, camera.view(), epsilon = EPSILON);
        assert_relative_eq!(ubo.proj, camera.projection(extent), epsilon = EPSILON);
    }
}
