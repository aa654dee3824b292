//! Mathematical types shared between client and server.
//!
//! These are the canonical representations used in the network protocol and
//! by the character controller. Angles are radians unless a name says
//! otherwise.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Degrees-to-radians factor.
pub const DEG2RAD: f32 = std::f32::consts::PI / 180.0;

/// Radians-to-degrees factor.
pub const RAD2DEG: f32 = 180.0 / std::f32::consts::PI;

/// Linear interpolation between two scalars.
#[must_use]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// 3D Vector - position, velocity, direction
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Vec3 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
}

impl Vec3 {
    /// Creates a new Vec3
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Zero vector
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    /// Unit X vector
    pub const X: Self = Self::new(1.0, 0.0, 0.0);

    /// Unit Y vector
    pub const Y: Self = Self::new(0.0, 1.0, 0.0);

    /// Unit Z vector
    pub const Z: Self = Self::new(0.0, 0.0, 1.0);

    /// World up direction
    pub const UP: Self = Self::Y;

    /// Unit scale vector
    pub const ONE: Self = Self::new(1.0, 1.0, 1.0);

    /// Converts to array
    #[must_use]
    pub const fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    /// Creates from array
    #[must_use]
    pub const fn from_array(arr: [f32; 3]) -> Self {
        Self::new(arr[0], arr[1], arr[2])
    }

    /// Dot product
    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Cross product
    #[must_use]
    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    /// Length squared (avoids sqrt)
    #[must_use]
    pub fn length_squared(self) -> f32 {
        self.dot(self)
    }

    /// Length
    #[must_use]
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Distance to another point
    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        (self - other).length()
    }

    /// Returns the vector scaled to unit length, or ZERO if degenerate.
    #[must_use]
    pub fn normalized(self) -> Self {
        let len = self.length();
        if len < 1e-6 {
            Self::ZERO
        } else {
            self * (1.0 / len)
        }
    }

    /// Componentwise multiply
    #[must_use]
    pub fn scale_by(self, other: Self) -> Self {
        Self::new(self.x * other.x, self.y * other.y, self.z * other.z)
    }

    /// Linear interpolation toward `other`
    #[must_use]
    pub fn lerp(self, other: Self, t: f32) -> Self {
        self + (other - self) * t
    }

    /// Clamps every component to `[min, max]`.
    #[must_use]
    pub fn clamp_components(self, min: f32, max: f32) -> Self {
        Self::new(
            self.x.clamp(min, max),
            self.y.clamp(min, max),
            self.z.clamp(min, max),
        )
    }

    /// Component of `self` along unit direction `n`.
    #[must_use]
    pub fn project_onto(self, n: Self) -> Self {
        n * self.dot(n)
    }

    /// Component of `self` perpendicular to unit direction `n`.
    #[must_use]
    pub fn reject_from(self, n: Self) -> Self {
        self - self.project_onto(n)
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl std::ops::Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// 2D Vector - pointer deltas, touch sticks
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Vec2 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
}

impl Vec2 {
    /// Creates a new Vec2
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Zero vector
    pub const ZERO: Self = Self::new(0.0, 0.0);

    /// Length
    #[must_use]
    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

/// Quaternion for rotations
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Quat {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
    /// W component
    pub w: f32,
}

impl Quat {
    /// Creates a new quaternion
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Identity rotation
    pub const IDENTITY: Self = Self::new(0.0, 0.0, 0.0, 1.0);

    /// Rotation of `angle` radians around unit `axis`.
    #[must_use]
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        let half = angle * 0.5;
        let s = half.sin();
        Self::new(axis.x * s, axis.y * s, axis.z * s, half.cos())
    }

    /// Rotation of `angle` radians around the world Y axis.
    #[must_use]
    pub fn from_yaw(angle: f32) -> Self {
        Self::from_axis_angle(Vec3::Y, angle)
    }

    /// Builds a rotation from intrinsic yaw (Y), pitch (X), roll (Z) angles.
    #[must_use]
    pub fn from_euler(e: Euler) -> Self {
        Self::from_yaw(e.y) * Self::from_axis_angle(Vec3::X, e.x) * Self::from_axis_angle(Vec3::Z, e.z)
    }

    /// Shortest-arc rotation taking unit vector `from` onto unit vector `to`.
    #[must_use]
    pub fn from_rotation_arc(from: Vec3, to: Vec3) -> Self {
        let d = from.dot(to);
        if d > 0.999_999 {
            return Self::IDENTITY;
        }
        if d < -0.999_999 {
            // Opposite vectors: pick any perpendicular axis.
            let axis = if from.x.abs() < 0.9 {
                from.cross(Vec3::X).normalized()
            } else {
                from.cross(Vec3::Y).normalized()
            };
            return Self::from_axis_angle(axis, std::f32::consts::PI);
        }
        let axis = from.cross(to);
        let q = Self::new(axis.x, axis.y, axis.z, 1.0 + d);
        q.normalized()
    }

    /// Dot product
    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w
    }

    /// Normalizes to unit length; identity if degenerate.
    #[must_use]
    pub fn normalized(self) -> Self {
        let len = self.dot(self).sqrt();
        if len < 1e-6 {
            Self::IDENTITY
        } else {
            let inv = 1.0 / len;
            Self::new(self.x * inv, self.y * inv, self.z * inv, self.w * inv)
        }
    }

    /// Conjugate; the inverse for unit quaternions.
    #[must_use]
    pub const fn conjugate(self) -> Self {
        Self::new(-self.x, -self.y, -self.z, self.w)
    }

    /// Rotates a vector by this quaternion.
    #[must_use]
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let u = Vec3::new(self.x, self.y, self.z);
        let s = self.w;
        u * (2.0 * u.dot(v)) + v * (s * s - u.dot(u)) + u.cross(v) * (2.0 * s)
    }

    /// Spherical interpolation toward `other`.
    #[must_use]
    pub fn slerp(self, other: Self, t: f32) -> Self {
        let mut d = self.dot(other);
        // Take the short way around.
        let other = if d < 0.0 {
            d = -d;
            Self::new(-other.x, -other.y, -other.z, -other.w)
        } else {
            other
        };
        if d > 0.9995 {
            // Nearly parallel: nlerp is stable and cheaper.
            return Self::new(
                lerp(self.x, other.x, t),
                lerp(self.y, other.y, t),
                lerp(self.z, other.z, t),
                lerp(self.w, other.w, t),
            )
            .normalized();
        }
        let theta = d.clamp(-1.0, 1.0).acos();
        let sin_theta = theta.sin();
        let wa = ((1.0 - t) * theta).sin() / sin_theta;
        let wb = (t * theta).sin() / sin_theta;
        Self::new(
            self.x * wa + other.x * wb,
            self.y * wa + other.y * wb,
            self.z * wa + other.z * wb,
            self.w * wa + other.w * wb,
        )
    }

    /// Extracts the rotation around the world Y axis.
    #[must_use]
    pub fn yaw(self) -> f32 {
        let fwd = self.rotate(Vec3::Z);
        fwd.x.atan2(fwd.z)
    }

    /// Keeps only the yaw component of this rotation.
    #[must_use]
    pub fn yaw_only(self) -> Self {
        Self::from_yaw(self.yaw())
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl std::ops::Mul for Quat {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        )
    }
}

/// Euler angles in radians - pitch (x), yaw (y), roll (z)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Euler {
    /// Pitch around X
    pub x: f32,
    /// Yaw around Y
    pub y: f32,
    /// Roll around Z
    pub z: f32,
}

impl Euler {
    /// Creates a new Euler triple
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Converts to a quaternion
    #[must_use]
    pub fn to_quat(self) -> Quat {
        Quat::from_euler(self)
    }
}

/// Transform - position + rotation + per-axis scale
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Transform {
    /// Position
    pub position: Vec3,
    /// Rotation
    pub rotation: Quat,
    /// Per-axis scale
    pub scale: Vec3,
}

impl Transform {
    /// Creates a new transform
    #[must_use]
    pub const fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self { position, rotation, scale }
    }

    /// Identity transform
    pub const IDENTITY: Self = Self::new(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE);

    /// Transform with only a position set
    #[must_use]
    pub const fn from_position(position: Vec3) -> Self {
        Self::new(position, Quat::IDENTITY, Vec3::ONE)
    }

    /// Composes `self * child` (apply child in self's space).
    ///
    /// Shear from non-uniform scale under rotation is not representable and
    /// is dropped, matching the usual scene-graph TRS convention.
    #[must_use]
    pub fn mul(self, child: Self) -> Self {
        Self {
            position: self.position + self.rotation.rotate(child.position.scale_by(self.scale)),
            rotation: self.rotation * child.rotation,
            scale: self.scale.scale_by(child.scale),
        }
    }

    /// Inverse transform (TRS convention, per-axis scale must be non-zero).
    #[must_use]
    pub fn inverse(self) -> Self {
        let inv_scale = Vec3::new(1.0 / self.scale.x, 1.0 / self.scale.y, 1.0 / self.scale.z);
        let inv_rot = self.rotation.conjugate();
        Self {
            position: inv_rot.rotate(-self.position).scale_by(inv_scale),
            rotation: inv_rot,
            scale: inv_scale,
        }
    }

    /// Applies the transform to a point.
    #[must_use]
    pub fn transform_point(self, p: Vec3) -> Vec3 {
        self.position + self.rotation.rotate(p.scale_by(self.scale))
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Column-major 4x4 matrix, exposed to scripts alongside the TRS transform.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Mat4 {
    /// Column-major elements
    pub cols: [f32; 16],
}

impl Mat4 {
    /// Identity matrix
    pub const IDENTITY: Self = Self {
        cols: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ],
    };

    /// Builds a matrix from a TRS transform.
    #[must_use]
    pub fn from_transform(t: Transform) -> Self {
        let (x, y, z, w) = (t.rotation.x, t.rotation.y, t.rotation.z, t.rotation.w);
        let (sx, sy, sz) = (t.scale.x, t.scale.y, t.scale.z);
        let (x2, y2, z2) = (x + x, y + y, z + z);
        let (xx, xy, xz) = (x * x2, x * y2, x * z2);
        let (yy, yz, zz) = (y * y2, y * z2, z * z2);
        let (wx, wy, wz) = (w * x2, w * y2, w * z2);
        Self {
            cols: [
                (1.0 - (yy + zz)) * sx,
                (xy + wz) * sx,
                (xz - wy) * sx,
                0.0,
                (xy - wz) * sy,
                (1.0 - (xx + zz)) * sy,
                (yz + wx) * sy,
                0.0,
                (xz + wy) * sz,
                (yz - wx) * sz,
                (1.0 - (xx + yy)) * sz,
                0.0,
                t.position.x,
                t.position.y,
                t.position.z,
                1.0,
            ],
        }
    }

    /// Matrix product `self * rhs`.
    #[must_use]
    pub fn mul(self, rhs: Self) -> Self {
        let a = &self.cols;
        let b = &rhs.cols;
        let mut out = [0.0f32; 16];
        for col in 0..4 {
            for row in 0..4 {
                let mut sum = 0.0;
                for k in 0..4 {
                    sum += a[k * 4 + row] * b[col * 4 + k];
                }
                out[col * 4 + row] = sum;
            }
        }
        Self { cols: out }
    }

    /// Applies the matrix to a point (w = 1).
    #[must_use]
    pub fn transform_point(self, p: Vec3) -> Vec3 {
        let c = &self.cols;
        Vec3::new(
            c[0] * p.x + c[4] * p.y + c[8] * p.z + c[12],
            c[1] * p.x + c[5] * p.y + c[9] * p.z + c[13],
            c[2] * p.x + c[6] * p.y + c[10] * p.z + c[14],
        )
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec3_operations() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);

        let sum = a + b;
        assert_eq!(sum.x, 5.0);
        assert_eq!(sum.y, 7.0);
        assert_eq!(sum.z, 9.0);

        let dot = a.dot(b);
        assert_eq!(dot, 32.0); // 1*4 + 2*5 + 3*6

        let cross = Vec3::X.cross(Vec3::Y);
        assert!((cross - Vec3::Z).length() < 1e-6);
    }

    #[test]
    fn test_vec3_project_reject() {
        let v = Vec3::new(3.0, 4.0, 0.0);
        let n = Vec3::Y;
        let par = v.project_onto(n);
        let perp = v.reject_from(n);
        assert!((par - Vec3::new(0.0, 4.0, 0.0)).length() < 1e-6);
        assert!((perp - Vec3::new(3.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_quat_rotate() {
        let q = Quat::from_yaw(std::f32::consts::FRAC_PI_2);
        let v = q.rotate(Vec3::Z);
        assert!((v - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn test_quat_rotation_arc_aligns() {
        let from = Vec3::UP;
        let to = Vec3::new(0.3, 0.9, 0.1).normalized();
        let q = Quat::from_rotation_arc(from, to);
        assert!((q.rotate(from) - to).length() < 1e-5);
    }

    #[test]
    fn test_quat_slerp_endpoints() {
        let a = Quat::IDENTITY;
        let b = Quat::from_yaw(1.0);
        assert!((a.slerp(b, 0.0).dot(a).abs() - 1.0).abs() < 1e-5);
        assert!((a.slerp(b, 1.0).dot(b).abs() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_transform_roundtrip() {
        let t = Transform::new(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_yaw(0.7),
            Vec3::new(2.0, 2.0, 2.0),
        );
        let p = Vec3::new(0.5, -1.0, 4.0);
        let q = t.inverse().transform_point(t.transform_point(p));
        assert!((q - p).length() < 1e-4);
    }

    #[test]
    fn test_mat4_matches_transform() {
        let t = Transform::new(
            Vec3::new(-2.0, 1.0, 0.5),
            Quat::from_axis_angle(Vec3::X, 0.4),
            Vec3::new(1.0, 3.0, 1.0),
        );
        let m = Mat4::from_transform(t);
        let p = Vec3::new(1.0, 1.0, 1.0);
        assert!((m.transform_point(p) - t.transform_point(p)).length() < 1e-4);
    }
}
