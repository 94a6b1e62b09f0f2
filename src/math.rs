//! Small vector types shared by the camera and skeleton code

use bytemuck::{Pod, Zeroable};
use std::ops::{Add, Mul, Sub};

/// 2D screen-space point
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec2 {
    /// Horizontal pixel coordinate
    pub x: f32,
    /// Vertical pixel coordinate, growing downwards
    pub y: f32,
}

impl Vec2 {
    /// Construct from components
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Both components finite
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// 3D world-space vector, laid out as three packed `f32`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vec3 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
}

impl Vec3 {
    /// All zeros
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);

    /// Construct from components
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Dot product
    #[inline]
    pub fn dot(self, other: Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Cross product
    #[inline]
    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    /// Euclidean length
    #[inline]
    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Component-wise product
    #[inline]
    pub fn scale(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x * other.x, self.y * other.y, self.z * other.z)
    }

    /// All components finite
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Largest absolute component
    pub fn max_abs(&self) -> f32 {
        self.x.abs().max(self.y.abs()).max(self.z.abs())
    }

    /// Per-component comparison within `epsilon`
    pub fn approx_eq(&self, other: &Vec3, epsilon: f32) -> bool {
        (self.x - other.x).abs() <= epsilon
            && (self.y - other.y).abs() <= epsilon
            && (self.z - other.z).abs() <= epsilon
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Rotation quaternion, `(x, y, z, w)` in memory order
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Quat {
    /// Vector part, X
    pub x: f32,
    /// Vector part, Y
    pub y: f32,
    /// Vector part, Z
    pub z: f32,
    /// Scalar part
    pub w: f32,
}

impl Quat {
    /// No rotation
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Rotate `v` by this quaternion
    #[inline]
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let axis = Vec3::new(self.x, self.y, self.z);
        let t = axis.cross(v) * 2.0;
        v + t * self.w + axis.cross(t)
    }

    /// All components finite
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quat_rotation() {
        // 90 degrees about +Z
        let half = std::f32::consts::FRAC_PI_4;
        let q = Quat {
            x: 0.0,
            y: 0.0,
            z: half.sin(),
            w: half.cos(),
        };

        let rotated = q.rotate(Vec3::new(1.0, 0.0, 0.0));
        assert!(rotated.approx_eq(&Vec3::new(0.0, 1.0, 0.0), 1e-5));
        assert_eq!(Quat::IDENTITY.rotate(Vec3::new(3.0, -2.0, 1.0)), Vec3::new(3.0, -2.0, 1.0));
    }

    #[test]
    fn test_vec3_ops() {
        let a = Vec3::new(3.0, 4.0, 0.0);
        assert_eq!(a.length(), 5.0);
        assert_eq!(a.dot(Vec3::new(1.0, 1.0, 1.0)), 7.0);
        assert_eq!(a.max_abs(), 4.0);
        assert!(!Vec3::new(f32::NAN, 0.0, 0.0).is_finite());
    }
}
