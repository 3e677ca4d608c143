//! Math types for PetalMix

pub use glam::{Mat3, Mat4, Quat, Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * (-Vec3::Z)
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Returns the `(at, up)` orientation pair used by the listener properties.
    pub fn orientation(&self) -> (Vec3, Vec3) {
        (self.forward(), self.up())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

#[inline]
pub fn lerpf(a: f32, b: f32, mu: f32) -> f32 {
    a + (b - a) * mu
}

#[inline]
pub fn lerpd(a: f64, b: f64, mu: f64) -> f64 {
    a + (b - a) * mu
}

/// Builds the listener's rotation from its `at`/`up` orientation vectors.
///
/// Rows are the right, up and backward basis vectors, so multiplying a world
/// direction yields listener-relative coordinates with `at` mapping to -Z.
/// Zero-length input collapses to a zero basis vector rather than NaN.
pub fn listener_rotation(at: Vec3, up: Vec3) -> Mat3 {
    let n = at.normalize_or_zero();
    let v = up.normalize_or_zero();
    let u = n.cross(v).normalize_or_zero();
    Mat3::from_cols(
        Vec3::new(u.x, v.x, -n.x),
        Vec3::new(u.y, v.y, -n.y),
        Vec3::new(u.z, v.z, -n.z),
    )
}

/// Builds the listener's world-to-view matrix from its rotation and position.
pub fn listener_matrix(position: Vec3, rotation: Mat3) -> Mat4 {
    let p = rotation * position;
    Mat4::from_cols(
        rotation.x_axis.extend(0.0),
        rotation.y_axis.extend(0.0),
        rotation.z_axis.extend(0.0),
        (-p).extend(1.0),
    )
}
