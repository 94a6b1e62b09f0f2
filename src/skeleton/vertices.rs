//! Shared vertex buffer
//!
//! Each entity keeps its transforms in one contiguous buffer of
//! translation/rotation/scale records plus a parallel buffer of parent
//! indices. A joint's world position is its local translation carried up
//! through every ancestor.

use crate::math::{Quat, Vec3};
use crate::{Error, Result};
use bytemuck::{Pod, Zeroable};

/// One transform record as laid out in target memory
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Trs {
    /// Local translation
    pub translation: Vec3,
    _pad0: f32,
    /// Local rotation
    pub rotation: Quat,
    /// Local scale
    pub scale: Vec3,
    _pad1: f32,
}

impl Trs {
    /// Record size in target memory
    pub const SIZE: usize = std::mem::size_of::<Trs>();

    /// Build a record
    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            translation,
            _pad0: 0.0,
            rotation,
            scale,
            _pad1: 0.0,
        }
    }

    /// Pure translation
    pub fn at(translation: Vec3) -> Self {
        Self::new(translation, Quat::IDENTITY, Vec3::new(1.0, 1.0, 1.0))
    }

    /// Apply this transform to a point in its child space
    pub fn apply(&self, point: Vec3) -> Vec3 {
        self.rotation.rotate(point.scale(self.scale)) + self.translation
    }
}

impl Default for Trs {
    fn default() -> Self {
        Self::at(Vec3::ZERO)
    }
}

/// Check the first `sample` records for garbage
pub fn validate_sample(vertices: &[Trs], sample: usize, magnitude_max: f32) -> Result<()> {
    for (index, trs) in vertices.iter().take(sample).enumerate() {
        if !(trs.translation.is_finite() && trs.rotation.is_finite() && trs.scale.is_finite()) {
            return Err(Error::BufferCorrupt {
                index,
                reason: "non-finite component",
            });
        }
        if trs.translation.max_abs() > magnitude_max {
            return Err(Error::BufferCorrupt {
                index,
                reason: "implausible magnitude",
            });
        }
    }
    Ok(())
}

/// World position of `index`, walking at most `max_depth` parents
///
/// An empty `parents` slice or a negative parent ends the walk, so a flat
/// buffer reduces to direct indexing.
pub fn world_position(vertices: &[Trs], parents: &[i32], index: usize, max_depth: usize) -> Result<Vec3> {
    let trs = vertices.get(index).ok_or(Error::IndexOutOfRange {
        index,
        len: vertices.len(),
    })?;

    let mut position = trs.translation;
    let mut current = index;

    let mut hops = 0;

    loop {
        let Some(&parent) = parents.get(current) else {
            return Ok(position);
        };
        let Ok(parent) = usize::try_from(parent) else {
            return Ok(position);
        };
        if parent == current {
            return Ok(position);
        }
        if hops == max_depth {
            return Err(Error::BufferCorrupt {
                index,
                reason: "parent chain too deep",
            });
        }

        let trs = vertices.get(parent).ok_or(Error::IndexOutOfRange {
            index: parent,
            len: vertices.len(),
        })?;
        position = trs.apply(position);
        current = parent;
        hops += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        assert_eq!(Trs::SIZE, 48);
    }

    #[test]
    fn test_flat_buffer_indexes_directly() {
        let vertices = vec![Trs::at(Vec3::new(1.0, 2.0, 3.0)), Trs::at(Vec3::new(4.0, 5.0, 6.0))];
        assert_eq!(world_position(&vertices, &[], 1, 8).unwrap(), Vec3::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn test_parent_chain_composes() {
        let half = std::f32::consts::FRAC_PI_4;
        // Root rotated 90 degrees about +Z, placed at (10, 0, 0)
        let root = Trs::new(
            Vec3::new(10.0, 0.0, 0.0),
            Quat { x: 0.0, y: 0.0, z: half.sin(), w: half.cos() },
            Vec3::new(2.0, 2.0, 2.0),
        );
        let child = Trs::at(Vec3::new(1.0, 0.0, 0.0));
        let vertices = vec![root, child];
        let parents = vec![-1, 0];

        let position = world_position(&vertices, &parents, 1, 8).unwrap();
        assert!(position.approx_eq(&Vec3::new(10.0, 2.0, 0.0), 1e-4), "{:?}", position);
    }

    #[test]
    fn test_out_of_range_index() {
        let vertices = vec![Trs::default(); 4];
        assert!(matches!(
            world_position(&vertices, &[], 9, 8),
            Err(Error::IndexOutOfRange { index: 9, len: 4 })
        ));
        assert!(matches!(
            world_position(&vertices, &[-1, 7, 0, 0], 1, 8),
            Err(Error::IndexOutOfRange { index: 7, len: 4 })
        ));
    }

    #[test]
    fn test_parent_cycle_bounded() {
        let vertices = vec![Trs::default(); 2];
        assert!(matches!(
            world_position(&vertices, &[1, 0], 0, 16),
            Err(Error::BufferCorrupt { .. })
        ));
    }

    #[test]
    fn test_chain_of_exactly_max_depth() {
        // 3 -> 2 -> 1 -> 0, each step adds one unit along x
        let vertices = vec![Trs::at(Vec3::new(1.0, 0.0, 0.0)); 4];
        let parents = vec![-1, 0, 1, 2];

        let position = world_position(&vertices, &parents, 3, 3).unwrap();
        assert!(position.approx_eq(&Vec3::new(4.0, 0.0, 0.0), 1e-5), "{:?}", position);
        assert!(matches!(
            world_position(&vertices, &parents, 3, 2),
            Err(Error::BufferCorrupt { index: 3, .. })
        ));
    }

    #[test]
    fn test_sample_validation() {
        let mut vertices = vec![Trs::default(); 16];
        assert!(validate_sample(&vertices, 8, 10_000.0).is_ok());

        vertices[3].translation.y = f32::NAN;
        assert!(matches!(
            validate_sample(&vertices, 8, 10_000.0),
            Err(Error::BufferCorrupt { index: 3, .. })
        ));

        vertices[3] = Trs::at(Vec3::new(0.0, 20_000.0, 0.0));
        assert!(validate_sample(&vertices, 8, 10_000.0).is_err());

        // Outside the sample
        assert!(validate_sample(&vertices, 2, 10_000.0).is_ok());
    }
}
