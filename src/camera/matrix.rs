//! View matrices and their plausibility checks
//!
//! There is no authoritative "this matrix is live" signal in the target, so a
//! candidate is judged purely on its geometry: finite values, a basis of sane
//! magnitude and a large perspective term. Stale and default matrices sit near
//! identity with a scale term around 1.0.

use crate::config::CameraConfig;
use crate::math::Vec3;

/// Why a candidate matrix was not accepted
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum MatrixRejection {
    /// The read itself failed
    #[error("matrix could not be read")]
    Unreadable,
    /// NaN or infinity somewhere in the matrix
    #[error("non-finite component")]
    NonFinite,
    /// Every component is zero
    #[error("all components zero")]
    AllZero,
    /// Looks like a default/identity transform
    #[error("identity-like matrix")]
    IdentityLike,
    /// No basis vector has a plausible length
    #[error("basis magnitudes out of range ({right:.3}, {up:.3}, {forward:.3})")]
    BasisOutOfRange {
        /// Length of the right vector
        right: f32,
        /// Length of the up vector
        up: f32,
        /// Length of the forward vector
        forward: f32,
    },
    /// Perspective term too small to be a live camera
    #[error("scale term {0:.3} too small")]
    ScaleTooSmall(f32),
}

/// Thresholds used by [`ViewMatrix::validate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatrixLimits {
    /// Smallest plausible basis magnitude
    pub basis_min: f32,
    /// Largest plausible basis magnitude
    pub basis_max: f32,
    /// Minimum absolute scale term
    pub scale_term_min: f32,
    /// Tolerance for identity matching
    pub identity_epsilon: f32,
}

impl From<&CameraConfig> for MatrixLimits {
    fn from(config: &CameraConfig) -> Self {
        Self {
            basis_min: config.basis_magnitude_min,
            basis_max: config.basis_magnitude_max,
            scale_term_min: config.scale_term_min,
            identity_epsilon: config.identity_epsilon,
        }
    }
}

impl Default for MatrixLimits {
    fn default() -> Self {
        Self::from(&CameraConfig::default())
    }
}

/// A camera's world-to-clip transform
///
/// Rows are stored transposed from the target's column-major layout: row 0
/// holds the right vector and `M14`, row 1 up and `M24`, row 2 forward, row 3
/// the translation and the scale (perspective) term `M44`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewMatrix {
    rows: [[f32; 4]; 4],
}

impl ViewMatrix {
    /// Build from rows as described on the type
    pub const fn from_rows(rows: [[f32; 4]; 4]) -> Self {
        Self { rows }
    }

    /// Build from the 16 floats as they sit in target memory (column-major)
    pub fn from_memory(raw: [f32; 16]) -> Self {
        let mut rows = [[0.0f32; 4]; 4];
        for (row, values) in rows.iter_mut().enumerate() {
            for (column, value) in values.iter_mut().enumerate() {
                *value = raw[column * 4 + row];
            }
        }
        Self { rows }
    }

    /// Inverse of [`ViewMatrix::from_memory`]
    pub fn to_memory(&self) -> [f32; 16] {
        let mut raw = [0.0f32; 16];
        for (row, values) in self.rows.iter().enumerate() {
            for (column, value) in values.iter().enumerate() {
                raw[column * 4 + row] = *value;
            }
        }
        raw
    }

    /// All rows
    pub fn rows(&self) -> &[[f32; 4]; 4] {
        &self.rows
    }

    fn xyz(&self, row: usize) -> Vec3 {
        Vec3::new(self.rows[row][0], self.rows[row][1], self.rows[row][2])
    }

    /// Right basis vector
    pub fn right(&self) -> Vec3 {
        self.xyz(0)
    }

    /// Up basis vector
    pub fn up(&self) -> Vec3 {
        self.xyz(1)
    }

    /// Forward basis vector
    pub fn forward(&self) -> Vec3 {
        self.xyz(2)
    }

    /// Translation row
    pub fn translation(&self) -> Vec3 {
        self.xyz(3)
    }

    /// Scale / perspective term (`M44`)
    pub fn scale_term(&self) -> f32 {
        self.rows[3][3]
    }

    /// `M14`, added to the projected x
    pub fn m14(&self) -> f32 {
        self.rows[0][3]
    }

    /// `M24`, added to the projected y
    pub fn m24(&self) -> f32 {
        self.rows[1][3]
    }

    /// Every component finite
    pub fn is_finite(&self) -> bool {
        self.rows.iter().flatten().all(|v| v.is_finite())
    }

    /// Run the plausibility checks
    pub fn validate(&self, limits: &MatrixLimits) -> Result<(), MatrixRejection> {
        if !self.is_finite() {
            return Err(MatrixRejection::NonFinite);
        }

        if self.rows.iter().flatten().all(|&v| v == 0.0) {
            return Err(MatrixRejection::AllZero);
        }

        let right = self.right().length();
        let up = self.up().length();
        let forward = self.forward().length();
        let scale = self.scale_term();
        let eps = limits.identity_epsilon;

        let unit_or_zero = |m: f32| m.abs() <= eps || (m - 1.0).abs() <= eps;
        if (scale - 1.0).abs() <= eps && unit_or_zero(right) && unit_or_zero(up) && unit_or_zero(forward) {
            return Err(MatrixRejection::IdentityLike);
        }

        let plausible = |m: f32| m >= limits.basis_min && m <= limits.basis_max;
        if !(plausible(right) || plausible(up) || plausible(forward)) {
            return Err(MatrixRejection::BasisOutOfRange { right, up, forward });
        }

        if scale.abs() <= limits.scale_term_min {
            return Err(MatrixRejection::ScaleTooSmall(scale));
        }

        Ok(())
    }

    /// Translation and scale term both within `epsilon` of `other`'s
    pub fn same_pose(&self, other: &ViewMatrix, epsilon: f32) -> bool {
        self.translation().approx_eq(&other.translation(), epsilon)
            && (self.scale_term() - other.scale_term()).abs() <= epsilon
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Axis-aligned camera at the origin looking down +Z with a large w term
    pub(crate) fn live_matrix(scale: f32) -> ViewMatrix {
        ViewMatrix::from_rows([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0, scale],
        ])
    }

    #[test]
    fn test_identity_like_rejected() {
        let identity = ViewMatrix::from_rows([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        assert_eq!(identity.validate(&MatrixLimits::default()), Err(MatrixRejection::IdentityLike));
    }

    #[test]
    fn test_plausible_matrix_accepted() {
        let matrix = ViewMatrix::from_rows([
            [5.0, 0.0, 0.0, 0.0],
            [0.0, 0.4, 0.0, 0.0],
            [0.0, 0.0, 0.7, 0.0],
            [0.2, -0.3, 0.9, 80.0],
        ]);
        assert_eq!(matrix.validate(&MatrixLimits::default()), Ok(()));
        assert_eq!(live_matrix(80.0).validate(&MatrixLimits::default()), Ok(()));
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut rows = *live_matrix(80.0).rows();
        rows[2][1] = f32::NAN;
        assert_eq!(
            ViewMatrix::from_rows(rows).validate(&MatrixLimits::default()),
            Err(MatrixRejection::NonFinite)
        );

        rows[2][1] = f32::INFINITY;
        assert_eq!(
            ViewMatrix::from_rows(rows).validate(&MatrixLimits::default()),
            Err(MatrixRejection::NonFinite)
        );
    }

    #[test]
    fn test_all_zero_rejected() {
        assert_eq!(
            ViewMatrix::default().validate(&MatrixLimits::default()),
            Err(MatrixRejection::AllZero)
        );
    }

    #[test]
    fn test_small_scale_rejected() {
        let matrix = live_matrix(1.5);
        assert_eq!(
            matrix.validate(&MatrixLimits::default()),
            Err(MatrixRejection::ScaleTooSmall(1.5))
        );
    }

    #[test]
    fn test_basis_out_of_range_rejected() {
        let matrix = ViewMatrix::from_rows([
            [100.0, 0.0, 0.0, 0.0],
            [0.0, 0.001, 0.0, 0.0],
            [0.0, 0.0, 75.0, 0.0],
            [0.0, 0.0, 1.0, 80.0],
        ]);
        assert!(matches!(
            matrix.validate(&MatrixLimits::default()),
            Err(MatrixRejection::BasisOutOfRange { .. })
        ));
    }

    #[test]
    fn test_limits_are_configurable() {
        let limits = MatrixLimits {
            scale_term_min: 100.0,
            ..MatrixLimits::default()
        };
        assert!(live_matrix(80.0).validate(&limits).is_err());
    }

    #[test]
    fn test_memory_layout_round_trip() {
        let matrix = live_matrix(80.0);
        let raw = matrix.to_memory();
        // Column-major: the scale term is the last float, translation z is raw[11]
        assert_eq!(raw[15], 80.0);
        assert_eq!(raw[11], 1.0);
        assert_eq!(ViewMatrix::from_memory(raw), matrix);
    }

    #[test]
    fn test_same_pose() {
        let a = live_matrix(80.0);
        let b = live_matrix(80.00001);
        let c = live_matrix(81.0);
        assert!(a.same_pose(&b, 1e-4));
        assert!(!a.same_pose(&c, 1e-4));
    }
}
