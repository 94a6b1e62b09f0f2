//! Bone transform cache
//!
//! A [`Skeleton`] resolves the vertex-buffer index of every joint once, then
//! each tick ingests the entity's shared vertex buffer, derives joint world
//! positions and assembles a flat buffer of screen-space segment endpoints.
//!
//! Consecutive failures are counted; once the threshold is reached the joint
//! addresses are dropped and resolved again from the root transform on the
//! next [`Skeleton::prepare`].

mod bones;
mod vertices;

pub use bones::{Bone, REQUIRED, SEGMENTS, SEGMENT_POINTS};
pub use vertices::{validate_sample, world_position, Trs};

use crate::camera::{Projector, ScreenBounds};
use crate::config::{SkeletonConfig, SkeletonOffsets};
use crate::math::{Vec2, Vec3};
use crate::memory::{address, Memory, ScatterBatch, ScatterResults};
use crate::platform::ReadFlags;
use crate::{Error, Result};
use tracing::{debug, trace, warn};

/// Addresses resolved from the root transform
#[derive(Debug, Clone)]
struct Layout {
    joints: [Option<usize>; Bone::COUNT],
    vertices: u64,
    parents: Vec<i32>,
    count: usize,
}

impl Layout {
    fn buffer_size(&self) -> usize {
        self.count * Trs::SIZE
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedPosition {
    position: Vec3,
    generation: u64,
}

/// Per-entity joint cache
pub struct Skeleton {
    root: u64,
    offsets: SkeletonOffsets,
    config: SkeletonConfig,
    layout: Option<Layout>,
    vertices: Vec<Trs>,
    generation: u64,
    positions: [Option<CachedPosition>; Bone::COUNT],
    failures: u32,
    points: Vec<Vec2>,
}

impl Skeleton {
    /// Resolve every joint reachable from `root`
    ///
    /// Individual joints that cannot be resolved are skipped; the root joint
    /// and its hierarchy are required.
    pub fn new(memory: &Memory, root: u64, offsets: SkeletonOffsets, config: SkeletonConfig) -> Result<Self> {
        address::check(root)?;

        let mut skeleton = Self {
            root,
            offsets,
            config,
            layout: None,
            vertices: Vec::new(),
            generation: 0,
            positions: [None; Bone::COUNT],
            failures: 0,
            points: Vec::with_capacity(SEGMENT_POINTS),
        };
        skeleton.resolve(memory)?;
        Ok(skeleton)
    }

    /// Root transform address
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Whether joint addresses are currently resolved
    pub fn is_resolved(&self) -> bool {
        self.layout.is_some()
    }

    /// Consecutive failed passes
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Vertex index of `bone`, if resolved
    pub fn joint_index(&self, bone: Bone) -> Option<usize> {
        self.layout.as_ref()?.joints[bone.index()]
    }

    /// Resolve joint indices and the shared buffers from the root transform
    pub fn resolve(&mut self, memory: &Memory) -> Result<()> {
        let offsets = &self.offsets;
        let list = memory.read_pointer_chain(self.root, &offsets.bone_list)?;
        let data = list.wrapping_add(offsets.list_data);

        let slot_address = |bone: Bone| data.wrapping_add(u64::from(offsets.slot(bone)) * 8);

        // list slot -> bone transform
        let mut batch = memory.scatter(ReadFlags::CACHED);
        for bone in Bone::ALL {
            batch.prepare::<u64>(slot_address(bone));
        }
        let results = batch.execute()?;
        let transforms: Vec<Option<u64>> = Bone::ALL
            .iter()
            .map(|&bone| results.read_ptr(slot_address(bone)))
            .collect();

        // bone transform -> internal transform
        let mut batch = memory.scatter(ReadFlags::CACHED);
        for transform in transforms.iter().flatten() {
            batch.prepare::<u64>(transform.wrapping_add(offsets.transform_internal));
        }
        let results = batch.execute()?;
        let internals: Vec<Option<u64>> = transforms
            .iter()
            .map(|t| t.and_then(|t| results.read_ptr(t.wrapping_add(offsets.transform_internal))))
            .collect();

        // internal transform -> vertex index, hierarchy
        let mut batch = memory.scatter(ReadFlags::CACHED);
        for internal in internals.iter().flatten() {
            batch
                .prepare::<i32>(internal.wrapping_add(offsets.transform_index))
                .prepare::<u64>(internal.wrapping_add(offsets.hierarchy));
        }
        let results = batch.execute()?;

        let mut joints = [None; Bone::COUNT];
        for (bone, internal) in Bone::ALL.iter().zip(&internals) {
            let Some(internal) = internal else {
                trace!(?bone, "Joint transform missing");
                continue;
            };
            let index = results
                .read::<i32>(internal.wrapping_add(offsets.transform_index))
                .and_then(|i| usize::try_from(i).ok())
                .filter(|&i| i < self.config.max_vertex_count);
            joints[bone.index()] = index;
        }

        let root_internal = internals[Bone::Root.index()];
        let hierarchy = root_internal
            .and_then(|internal| results.read_ptr(internal.wrapping_add(offsets.hierarchy)))
            .filter(|_| joints[Bone::Root.index()].is_some())
            .ok_or(Error::JointUnresolved(Bone::Root))?;

        let mut batch = memory.scatter(ReadFlags::CACHED);
        batch
            .prepare::<u64>(hierarchy.wrapping_add(offsets.hierarchy_vertices))
            .prepare::<u64>(hierarchy.wrapping_add(offsets.hierarchy_parents));
        let results = batch.execute()?;

        let vertices_address = hierarchy.wrapping_add(offsets.hierarchy_vertices);
        let vertices = results
            .read::<u64>(vertices_address)
            .ok_or_else(|| Error::ReadFailure {
                address: vertices_address,
                size: 8,
                reason: "vertex buffer pointer unreadable".into(),
            })?;
        let vertices = address::check(vertices)?;

        let count = joints.iter().flatten().max().map_or(0, |&max| max + 1);

        let parents = match results.read_ptr(hierarchy.wrapping_add(offsets.hierarchy_parents)) {
            Some(parents) => memory
                .read_span::<i32>(parents, count, ReadFlags::CACHED)
                .unwrap_or_else(|e| {
                    debug!(error = %e, "Parent indices unreadable, using flat hierarchy");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let resolved = joints.iter().flatten().count();
        debug!(
            root = format_args!("{:#x}", self.root),
            joints = resolved,
            vertices = count,
            hierarchical = !parents.is_empty(),
            "Skeleton resolved"
        );

        self.layout = Some(Layout {
            joints,
            vertices,
            parents,
            count,
        });
        Ok(())
    }

    /// Queue this tick's vertex buffer read, re-resolving first if needed
    ///
    /// Returns `false` when the skeleton could not be resolved and nothing was
    /// queued.
    pub fn prepare(&mut self, memory: &Memory, batch: &mut ScatterBatch<'_>) -> bool {
        if self.layout.is_none() {
            if let Err(e) = self.resolve(memory) {
                debug!(root = format_args!("{:#x}", self.root), error = %e, "Skeleton re-resolution failed");
                return false;
            }
        }

        match &self.layout {
            Some(layout) => {
                batch.prepare_bytes(layout.vertices, layout.buffer_size());
                true
            }
            None => false,
        }
    }

    /// Take this tick's vertex buffer from a completed batch
    pub fn ingest(&mut self, results: &ScatterResults) -> Result<()> {
        let layout = self.layout.as_ref().ok_or(Error::JointUnresolved(Bone::Root))?;
        let size = layout.buffer_size();

        let bytes = results.bytes(layout.vertices, size).ok_or_else(|| Error::ReadFailure {
            address: layout.vertices,
            size,
            reason: "vertex buffer not read".into(),
        })?;

        self.ingest_vertices(bytes.chunks_exact(Trs::SIZE).map(bytemuck::pod_read_unaligned).collect())
    }

    /// Validate and accept a vertex buffer, then update joint positions
    ///
    /// A corrupt sample rejects the whole buffer and keeps the previous one.
    /// Joints that fail individually keep their last position.
    pub fn ingest_vertices(&mut self, vertices: Vec<Trs>) -> Result<()> {
        if self.layout.is_none() {
            return Err(Error::JointUnresolved(Bone::Root));
        }

        validate_sample(&vertices, self.config.sample_size, self.config.magnitude_max)?;

        self.vertices = vertices;
        self.generation += 1;

        for bone in Bone::ALL {
            if self.joint_index(bone).is_none() {
                continue;
            }
            match self.resolve_position(bone) {
                Ok(position) => {
                    self.positions[bone.index()] = Some(CachedPosition {
                        position,
                        generation: self.generation,
                    });
                }
                Err(e) => trace!(?bone, error = %e, "Joint update failed"),
            }
        }

        Ok(())
    }

    /// Read, validate and ingest the vertex buffer in its own round trip
    pub fn refresh(&mut self, memory: &Memory) -> Result<()> {
        let mut batch = memory.scatter(ReadFlags::UNCACHED);
        if !self.prepare(memory, &mut batch) {
            return Err(Error::JointUnresolved(Bone::Root));
        }
        let results = batch.execute()?;
        self.ingest(&results)
    }

    /// World position of `bone` in the current vertex buffer
    pub fn resolve_position(&self, bone: Bone) -> Result<Vec3> {
        let layout = self.layout.as_ref().ok_or(Error::JointUnresolved(bone))?;
        let index = layout.joints[bone.index()].ok_or(Error::JointUnresolved(bone))?;

        let position = world_position(&self.vertices, &layout.parents, index, self.config.max_hierarchy_depth)?;
        if !position.is_finite() || position.max_abs() > self.config.magnitude_max {
            return Err(Error::BufferCorrupt {
                index,
                reason: "implausible joint position",
            });
        }
        Ok(position)
    }

    /// Last known world position of `bone`
    pub fn joint_position(&self, bone: Bone) -> Option<Vec3> {
        self.positions[bone.index()].map(|cached| cached.position)
    }

    /// Last known world position of the root joint
    pub fn root_position(&self) -> Option<Vec3> {
        self.joint_position(Bone::Root)
    }

    /// Project the required joints and assemble the segment buffer
    ///
    /// Every required joint must have been updated by the latest ingest.
    /// Points are scaled by `scale_x` / `scale_y`. A joint behind the camera
    /// or far off screen fails the pass and counts toward re-resolution.
    pub fn update_buffer(&mut self, projector: &Projector, scale_x: f32, scale_y: f32) -> Option<&[Vec2]> {
        let generation = self.generation;
        let bounds = ScreenBounds::Tolerance(self.config.onscreen_tolerance);
        let mut screen = [Vec2::default(); Bone::COUNT];

        for bone in REQUIRED {
            let current = self.positions[bone.index()].filter(|cached| generation > 0 && cached.generation == generation);
            let Some(cached) = current else {
                trace!(?bone, "Required joint not updated this tick");
                self.record_failure();
                return None;
            };

            let Some(point) = projector.world_to_screen(cached.position, bounds) else {
                trace!(?bone, "Required joint did not project");
                self.record_failure();
                return None;
            };
            screen[bone.index()] = Vec2::new(point.x * scale_x, point.y * scale_y);
        }

        self.points.clear();
        for (from, to) in SEGMENTS {
            self.points.push(screen[from.index()]);
            self.points.push(screen[to.index()]);
        }

        self.failures = 0;
        Some(&self.points)
    }

    /// Count a failed pass, dropping the joint cache at the threshold
    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.config.failure_threshold.max(1) {
            warn!(
                root = format_args!("{:#x}", self.root),
                failures = self.failures,
                "Skeleton keeps failing, re-resolving joints"
            );
            self.invalidate();
        }
    }

    /// Drop joint addresses, buffers and cached positions
    pub fn invalidate(&mut self) {
        self.layout = None;
        self.vertices.clear();
        self.positions = [None; Bone::COUNT];
        self.points.clear();
        self.failures = 0;
    }
}

impl std::fmt::Debug for Skeleton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skeleton")
            .field("root", &format_args!("{:#x}", self.root))
            .field("resolved", &self.is_resolved())
            .field("generation", &self.generation)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::matrix::tests::live_matrix;
    use crate::camera::Viewport;
    use crate::math::Quat;
    use crate::platform::mock::MockTransport;
    use std::sync::Arc;

    pub(crate) const ROOT: u64 = 0x0060_0000;
    const LIST: u64 = 0x0061_0000;
    const TRANSFORMS: u64 = 0x0062_0000;
    const INTERNALS: u64 = 0x0063_0000;
    const HIERARCHY: u64 = 0x0064_0000;
    const VERTICES: u64 = 0x0065_0000;
    const PARENTS: u64 = 0x0066_0000;
    const ROOT_POSITION: Vec3 = Vec3::new(0.0, 0.0, 5.0);

    pub(crate) fn offsets() -> SkeletonOffsets {
        SkeletonOffsets {
            bone_list: vec![0x10],
            ..SkeletonOffsets::default()
        }
    }

    fn local_position(bone: Bone) -> Vec3 {
        let i = bone.index() as f32;
        Vec3::new((i - 12.0) * 0.1, i * 0.08, 0.0)
    }

    pub(crate) fn rig_vertices() -> Vec<Trs> {
        Bone::ALL
            .iter()
            .map(|&bone| match bone {
                Bone::Root => Trs::at(ROOT_POSITION),
                _ => Trs::at(local_position(bone)),
            })
            .collect()
    }

    /// Lay out a full rig under [`ROOT`], leaving out `missing` joints
    pub(crate) fn install_rig(transport: &MockTransport, missing: &[Bone]) {
        let offsets = offsets();
        transport.write_value(ROOT + 0x10, &LIST);
        transport.write_memory(LIST, &vec![0u8; 0x20 + 134 * 8]);

        for bone in Bone::ALL {
            if missing.contains(&bone) {
                continue;
            }
            let transform = TRANSFORMS + bone.index() as u64 * 0x100;
            let internal = INTERNALS + bone.index() as u64 * 0x100;

            transport.write_value(LIST + offsets.list_data + u64::from(bone.default_slot()) * 8, &transform);
            transport.write_value(transform + offsets.transform_internal, &internal);
            transport.write_memory(internal, &[0u8; 0x100]);
            transport.write_value(internal + offsets.transform_index, &(bone.index() as i32));
            transport.write_value(internal + offsets.hierarchy, &HIERARCHY);
        }

        transport.write_memory(HIERARCHY, &[0u8; 0x40]);
        transport.write_value(HIERARCHY + offsets.hierarchy_vertices, &VERTICES);
        transport.write_value(HIERARCHY + offsets.hierarchy_parents, &PARENTS);

        let parents: Vec<i32> = Bone::ALL
            .iter()
            .map(|&bone| if bone == Bone::Root { -1 } else { 0 })
            .collect();
        transport.write_slice(PARENTS, &parents);
        transport.write_slice(VERTICES, &rig_vertices());
    }

    fn memory(transport: &MockTransport) -> Memory {
        Memory::new(Arc::new(transport.clone()))
    }

    fn projector() -> Projector {
        Projector::new(live_matrix(80.0), Viewport::default())
    }

    #[test]
    fn test_end_to_end_segment_buffer() {
        let transport = MockTransport::new();
        install_rig(&transport, &[]);
        let memory = memory(&transport);

        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), SkeletonConfig::default()).unwrap();
        assert!(skeleton.is_resolved());
        skeleton.refresh(&memory).unwrap();

        let viewport = Viewport::default();
        let tolerance = SkeletonConfig::default().onscreen_tolerance;
        let points = skeleton.update_buffer(&projector(), 1.0, 1.0).unwrap();

        assert_eq!(points.len(), 26);
        for point in points {
            assert!(point.is_finite());
            assert!(viewport.contains(*point, tolerance), "{:?}", point);
        }
        assert_eq!(skeleton.root_position(), Some(ROOT_POSITION));
        assert_eq!(
            skeleton.joint_position(Bone::Head),
            Some(local_position(Bone::Head) + ROOT_POSITION)
        );
    }

    #[test]
    fn test_segment_order_and_scale() {
        let transport = MockTransport::new();
        install_rig(&transport, &[]);
        let memory = memory(&transport);
        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), SkeletonConfig::default()).unwrap();
        skeleton.refresh(&memory).unwrap();

        let projector = projector();
        let head = projector
            .world_to_screen(skeleton.joint_position(Bone::Head).unwrap(), ScreenBounds::Unchecked)
            .unwrap();

        let full: Vec<Vec2> = skeleton.update_buffer(&projector, 1.0, 1.0).unwrap().to_vec();
        let half = skeleton.update_buffer(&projector, 0.5, 2.0).unwrap();
        assert_eq!(full[0], head);
        assert_eq!(half[0], Vec2::new(head.x * 0.5, head.y * 2.0));
    }

    #[test]
    fn test_missing_optional_joint_tolerated() {
        let transport = MockTransport::new();
        install_rig(&transport, &[Bone::LThigh1, Bone::RUpperarm]);
        let memory = memory(&transport);

        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), SkeletonConfig::default()).unwrap();
        skeleton.refresh(&memory).unwrap();

        assert_eq!(skeleton.joint_index(Bone::LThigh1), None);
        assert_eq!(skeleton.joint_position(Bone::LThigh1), None);
        assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_some());
    }

    #[test]
    fn test_missing_required_joint_fails_pass() {
        let transport = MockTransport::new();
        install_rig(&transport, &[Bone::Head]);
        let memory = memory(&transport);

        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), SkeletonConfig::default()).unwrap();
        skeleton.refresh(&memory).unwrap();

        assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_none());
        assert_eq!(skeleton.failures(), 1);
        assert!(matches!(
            skeleton.resolve_position(Bone::Head),
            Err(Error::JointUnresolved(Bone::Head))
        ));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let transport = MockTransport::new();
        install_rig(&transport, &[Bone::Root]);

        assert!(matches!(
            Skeleton::new(&memory(&transport), ROOT, offsets(), SkeletonConfig::default()),
            Err(Error::JointUnresolved(Bone::Root))
        ));
    }

    #[test]
    fn test_short_buffer_fails_only_affected_joints() {
        let transport = MockTransport::new();
        install_rig(&transport, &[]);
        let memory = memory(&transport);
        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), SkeletonConfig::default()).unwrap();
        skeleton.refresh(&memory).unwrap();
        let head_before = skeleton.joint_position(Bone::Head).unwrap();

        // Move everything, but cut the buffer short of the head
        let mut moved = rig_vertices();
        moved[0] = Trs::at(Vec3::new(1.0, 0.0, 5.0));
        moved.truncate(Bone::Head.index());
        skeleton.ingest_vertices(moved).unwrap();

        assert!(matches!(
            skeleton.resolve_position(Bone::Head),
            Err(Error::IndexOutOfRange { index, len }) if index == Bone::Head.index() && len == Bone::Head.index()
        ));
        assert_eq!(skeleton.joint_position(Bone::Head), Some(head_before));
        assert_eq!(
            skeleton.joint_position(Bone::Pelvis),
            Some(local_position(Bone::Pelvis) + Vec3::new(1.0, 0.0, 5.0))
        );

        // The stale head keeps the pass from completing
        assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_none());
    }

    #[test]
    fn test_corrupt_buffer_rejected() {
        let transport = MockTransport::new();
        install_rig(&transport, &[]);
        let memory = memory(&transport);
        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), SkeletonConfig::default()).unwrap();
        skeleton.refresh(&memory).unwrap();

        let mut corrupt = rig_vertices();
        corrupt[2].rotation = Quat {
            x: f32::NAN,
            ..Quat::IDENTITY
        };
        transport.write_slice(VERTICES, &corrupt);

        assert!(matches!(
            skeleton.refresh(&memory),
            Err(Error::BufferCorrupt { index: 2, .. })
        ));
        // Previous tick's positions are still there
        assert_eq!(skeleton.root_position(), Some(ROOT_POSITION));
    }

    #[test]
    fn test_self_heal_after_threshold() {
        let transport = MockTransport::new();
        install_rig(&transport, &[]);
        let memory = memory(&transport);
        let config = SkeletonConfig {
            failure_threshold: 3,
            ..SkeletonConfig::default()
        };
        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), config).unwrap();

        // Nothing ingested yet, so every pass fails
        for _ in 0..2 {
            assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_none());
            assert!(skeleton.is_resolved());
        }
        assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_none());
        assert!(!skeleton.is_resolved());
        assert_eq!(skeleton.failures(), 0);

        // Re-resolved lazily on the next prepare
        let mut batch = memory.scatter(ReadFlags::UNCACHED);
        assert!(skeleton.prepare(&memory, &mut batch));
        assert!(skeleton.is_resolved());
        let results = batch.execute().unwrap();
        skeleton.ingest(&results).unwrap();
        assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_some());
    }

    fn behind_camera() -> Vec<Trs> {
        let mut behind = rig_vertices();
        behind[0] = Trs::at(Vec3::new(0.0, 0.0, -200.0));
        behind
    }

    #[test]
    fn test_behind_camera_counts_as_failure() {
        let transport = MockTransport::new();
        install_rig(&transport, &[]);
        let memory = memory(&transport);
        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), SkeletonConfig::default()).unwrap();

        skeleton.ingest_vertices(behind_camera()).unwrap();

        assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_none());
        assert_eq!(skeleton.failures(), 1);
    }

    #[test]
    fn test_projection_failures_trigger_reresolve() {
        let transport = MockTransport::new();
        install_rig(&transport, &[]);
        let memory = memory(&transport);
        let config = SkeletonConfig::default();
        let threshold = config.failure_threshold;
        let mut skeleton = Skeleton::new(&memory, ROOT, offsets(), config).unwrap();

        for pass in 1..threshold {
            skeleton.ingest_vertices(behind_camera()).unwrap();
            assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_none());
            assert_eq!(skeleton.failures(), pass);
            assert!(skeleton.is_resolved());
        }

        skeleton.ingest_vertices(behind_camera()).unwrap();
        assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_none());
        assert!(!skeleton.is_resolved());

        // Fresh memory projects again after the lazy re-resolve
        skeleton.refresh(&memory).unwrap();
        assert!(skeleton.is_resolved());
        assert!(skeleton.update_buffer(&projector(), 1.0, 1.0).is_some());
        assert_eq!(skeleton.failures(), 0);
    }
}
