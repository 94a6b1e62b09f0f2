//! Runtime configuration
//!
//! Every heuristic threshold lives in [`defaults`] and feeds the matching
//! config field, so callers and tests can recalibrate without touching logic.
//! Object layouts of the target are supplied through [`Offsets`]; nothing in
//! this crate hardcodes them.

use crate::skeleton::Bone;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default calibration constants
///
/// The matrix and vertex thresholds are tuned to one target's numeric ranges.
/// Validate them against captured data before trusting them on another build.
pub mod defaults {
    /// Hard cap on bytes moved by a single read call
    pub const MAX_READ_SIZE: usize = 0x0100_0000;
    /// Independent samples taken by a verified read
    pub const VERIFIED_READ_SAMPLES: usize = 3;
    /// Busy-wait between verified read samples, in microseconds
    pub const VERIFIED_READ_SPIN_MICROS: u64 = 25;
    /// Write + read-back attempts for verified writes
    pub const WRITE_VERIFY_ATTEMPTS: u32 = 3;

    /// Smallest basis-vector magnitude counted as plausible
    pub const BASIS_MAGNITUDE_MIN: f32 = 0.01;
    /// Largest basis-vector magnitude counted as plausible
    pub const BASIS_MAGNITUDE_MAX: f32 = 50.0;
    /// Live matrices carry a large perspective term; stale ones sit near 1.0
    pub const SCALE_TERM_MIN: f32 = 10.0;
    /// Tolerance used when matching identity-like matrices
    pub const IDENTITY_EPSILON: f32 = 0.01;
    /// Tolerance for "unchanged" translation and scale between ticks
    pub const FROZEN_EPSILON: f32 = 1e-4;
    /// Identical ticks before a camera is considered frozen
    pub const FROZEN_THRESHOLD: u32 = 50;
    /// Consecutive invalid ticks before cameras are re-resolved
    pub const INVALID_THRESHOLD: u32 = 30;
    /// Points with a smaller clip `w` are behind the camera
    pub const MIN_W: f32 = 0.098;
    /// Soft margin for on-screen checks, in screen units
    pub const ONSCREEN_TOLERANCE: f32 = 800.0;
    /// Entries scanned in the camera list
    pub const CAMERA_SCAN_LIMIT: usize = 100;
    /// Bytes read for a camera object's name
    pub const CAMERA_NAME_LENGTH: usize = 64;
    /// A matrix older than this is not "fresh"
    pub const FRESHNESS_MILLIS: u64 = 5_000;

    /// Vertex entries inspected before a buffer is accepted
    pub const VERTEX_SAMPLE_SIZE: usize = 8;
    /// Coordinates beyond this are treated as garbage
    pub const VERTEX_MAGNITUDE_MAX: f32 = 10_000.0;
    /// Consecutive skeleton failures before joint addresses are re-resolved
    pub const SKELETON_FAILURE_THRESHOLD: u32 = 10;
    /// Parent hops allowed while composing a joint position
    pub const MAX_HIERARCHY_DEPTH: usize = 128;
    /// Largest vertex buffer a skeleton will request
    pub const MAX_VERTEX_COUNT: usize = 4_096;

    /// Session loop period
    pub const TICK_INTERVAL_MILLIS: u64 = 8;
    /// Delay before the first camera discovery attempt of a session
    pub const SETTLE_DELAY_MILLIS: u64 = 5_000;
    /// Delay between the first, fast discovery retries
    pub const DISCOVERY_RETRY_MILLIS: u64 = 250;
    /// Number of fast discovery retries before backing off
    pub const DISCOVERY_FAST_ATTEMPTS: u32 = 10;
    /// Backoff cap for discovery retries
    pub const DISCOVERY_MAX_BACKOFF_MILLIS: u64 = 4_000;
    /// Fixed backoff while waiting for the process or a session
    pub const STARTUP_RETRY_MILLIS: u64 = 500;

    /// Fallback viewport width
    pub const DEFAULT_WIDTH: i32 = 1920;
    /// Fallback viewport height
    pub const DEFAULT_HEIGHT: i32 = 1080;
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Access layer limits
    pub memory: MemoryConfig,
    /// Projection engine thresholds
    pub camera: CameraConfig,
    /// Bone cache thresholds
    pub skeleton: SkeletonConfig,
    /// Worker timing
    pub session: SessionConfig,
    /// Target resolution
    pub viewport: ViewportConfig,
    /// Target object layouts
    pub offsets: Offsets,
}

impl Config {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if !(camera.basis_magnitude_min < camera.basis_magnitude_max) {
            return Err(Error::Config(format!(
                "basis magnitude range is empty ({} .. {})",
                camera.basis_magnitude_min, camera.basis_magnitude_max
            )));
        }
        if self.memory.verified_read_samples < 2 {
            return Err(Error::Config("verified reads need at least two samples".into()));
        }
        if self.session.tick_interval_millis == 0 {
            return Err(Error::Config("tick interval must be non-zero".into()));
        }
        if self.skeleton.max_vertex_count == 0 {
            return Err(Error::Config("max vertex count must be non-zero".into()));
        }
        Ok(())
    }
}

/// Access layer limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Hard cap on bytes per read call
    pub max_read_size: usize,
    /// Samples per verified read
    pub verified_read_samples: usize,
    /// Busy-wait between samples
    pub verified_read_spin_micros: u64,
    /// Attempts for verified writes
    pub write_verify_attempts: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_read_size: defaults::MAX_READ_SIZE,
            verified_read_samples: defaults::VERIFIED_READ_SAMPLES,
            verified_read_spin_micros: defaults::VERIFIED_READ_SPIN_MICROS,
            write_verify_attempts: defaults::WRITE_VERIFY_ATTEMPTS,
        }
    }
}

impl MemoryConfig {
    /// Spin delay as a [`Duration`]
    pub fn verified_read_spin(&self) -> Duration {
        Duration::from_micros(self.verified_read_spin_micros)
    }
}

/// Projection engine thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Smallest accepted basis row length
    pub basis_magnitude_min: f32,
    /// Largest accepted basis row length
    pub basis_magnitude_max: f32,
    /// Smallest accepted translation `w` term
    pub scale_term_min: f32,
    /// Distance from identity below which a matrix is rejected
    pub identity_epsilon: f32,
    /// Largest element change still counted as the same pose
    pub frozen_epsilon: f32,
    /// Identical ticks before the camera is considered frozen
    pub frozen_threshold: u32,
    /// Consecutive invalid ticks before rediscovery
    pub invalid_threshold: u32,
    /// Clip `w` below which a point is behind the camera
    pub min_w: f32,
    /// Pixels a projected point may fall outside the viewport
    pub onscreen_tolerance: f32,
    /// Most camera list entries scanned
    pub scan_limit: usize,
    /// Longest camera name read
    pub name_length: usize,
    /// Age after which a published matrix is no longer fresh
    pub freshness_millis: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            basis_magnitude_min: defaults::BASIS_MAGNITUDE_MIN,
            basis_magnitude_max: defaults::BASIS_MAGNITUDE_MAX,
            scale_term_min: defaults::SCALE_TERM_MIN,
            identity_epsilon: defaults::IDENTITY_EPSILON,
            frozen_epsilon: defaults::FROZEN_EPSILON,
            frozen_threshold: defaults::FROZEN_THRESHOLD,
            invalid_threshold: defaults::INVALID_THRESHOLD,
            min_w: defaults::MIN_W,
            onscreen_tolerance: defaults::ONSCREEN_TOLERANCE,
            scan_limit: defaults::CAMERA_SCAN_LIMIT,
            name_length: defaults::CAMERA_NAME_LENGTH,
            freshness_millis: defaults::FRESHNESS_MILLIS,
        }
    }
}

impl CameraConfig {
    /// Freshness window as a [`Duration`]
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_millis)
    }
}

/// Bone cache thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeletonConfig {
    /// Vertex records checked per ingest
    pub sample_size: usize,
    /// Largest plausible coordinate
    pub magnitude_max: f32,
    /// Failed passes before joints are resolved again
    pub failure_threshold: u32,
    /// Most parent hops walked per joint
    pub max_hierarchy_depth: usize,
    /// Largest accepted vertex index
    pub max_vertex_count: usize,
    /// Pixels a joint may fall outside the viewport
    pub onscreen_tolerance: f32,
}

impl Default for SkeletonConfig {
    fn default() -> Self {
        Self {
            sample_size: defaults::VERTEX_SAMPLE_SIZE,
            magnitude_max: defaults::VERTEX_MAGNITUDE_MAX,
            failure_threshold: defaults::SKELETON_FAILURE_THRESHOLD,
            max_hierarchy_depth: defaults::MAX_HIERARCHY_DEPTH,
            max_vertex_count: defaults::MAX_VERTEX_COUNT,
            onscreen_tolerance: defaults::ONSCREEN_TOLERANCE,
        }
    }
}

/// Worker timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Target period of the main tick
    pub tick_interval_millis: u64,
    /// Sub-tick camera polling period; `None` refreshes the camera on the main tick
    pub camera_poll_millis: Option<u64>,
    /// Wait before the first discovery of a session
    pub settle_delay_millis: u64,
    /// Delay between fast discovery retries
    pub discovery_retry_millis: u64,
    /// Retries before discovery starts backing off
    pub discovery_fast_attempts: u32,
    /// Longest discovery backoff
    pub discovery_max_backoff_millis: u64,
    /// Delay between attach and session checks
    pub startup_retry_millis: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_millis: defaults::TICK_INTERVAL_MILLIS,
            camera_poll_millis: None,
            settle_delay_millis: defaults::SETTLE_DELAY_MILLIS,
            discovery_retry_millis: defaults::DISCOVERY_RETRY_MILLIS,
            discovery_fast_attempts: defaults::DISCOVERY_FAST_ATTEMPTS,
            discovery_max_backoff_millis: defaults::DISCOVERY_MAX_BACKOFF_MILLIS,
            startup_retry_millis: defaults::STARTUP_RETRY_MILLIS,
        }
    }
}

impl SessionConfig {
    /// Tick period
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_millis)
    }

    /// Camera poll period, if polling is enabled
    pub fn camera_poll_interval(&self) -> Option<Duration> {
        self.camera_poll_millis.map(Duration::from_millis)
    }

    /// Fixed startup backoff
    pub fn startup_retry(&self) -> Duration {
        Duration::from_millis(self.startup_retry_millis)
    }

    /// Discovery retry schedule; `settle` adds the session settling delay up front
    pub fn discovery_backoff(&self, settle: bool) -> crate::task::Backoff {
        let fast = Duration::from_millis(self.discovery_retry_millis);
        let first = if settle {
            Duration::from_millis(self.settle_delay_millis)
        } else {
            Duration::ZERO
        };
        crate::task::Backoff::new(
            first,
            fast,
            self.discovery_fast_attempts,
            Duration::from_millis(self.discovery_max_backoff_millis),
        )
    }
}

/// Target resolution as supplied by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: defaults::DEFAULT_WIDTH,
            height: defaults::DEFAULT_HEIGHT,
        }
    }
}

/// Object layouts of the target build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Offsets {
    /// Camera list and camera object layout
    pub camera: CameraOffsets,
    /// Aim flag and optic zoom on the local player
    pub aim: AimOffsets,
    /// Bone list and transform layout
    pub skeleton: SkeletonOffsets,
}

/// Where cameras live and how they are laid out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOffsets {
    /// Module-relative address of the pointer to the camera list
    pub camera_list: u64,
    /// List -> items array pointer
    pub list_items: u64,
    /// List -> element count (`i32`)
    pub list_count: u64,
    /// Camera -> owning object pointer
    pub owner: u64,
    /// Owning object -> name pointer (NUL-terminated)
    pub owner_name: u64,
    /// Camera -> 4x4 view matrix
    pub view_matrix: u64,
    /// Camera -> vertical field of view, degrees (`f32`)
    pub fov: u64,
    /// Camera -> aspect ratio (`f32`)
    pub aspect: u64,
    /// Name substring of the first-person camera
    pub primary_name: String,
    /// Name substring of the optic camera
    pub secondary_name: String,
}

impl Default for CameraOffsets {
    fn default() -> Self {
        Self {
            camera_list: 0,
            list_items: 0x0,
            list_count: 0x8,
            owner: 0x30,
            owner_name: 0x60,
            view_matrix: 0xC0,
            fov: 0x100,
            aspect: 0x104,
            primary_name: "FPS Camera".into(),
            secondary_name: "Optic Camera".into(),
        }
    }
}

/// A pointer chain followed by a field offset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPath {
    /// Pointer hops applied to the base
    pub chain: Vec<u64>,
    /// Offset of the field inside the final object
    pub field: u64,
}

impl FieldPath {
    /// Path to a field directly inside the base object
    pub fn direct(field: u64) -> Self {
        Self {
            chain: Vec::new(),
            field,
        }
    }

    /// Whether the path has been configured at all
    pub fn is_configured(&self) -> bool {
        !self.chain.is_empty() || self.field != 0
    }
}

/// Aim state, relative to the local player object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AimOffsets {
    /// Path to the "is aiming" flag (`u8`)
    pub aiming: FieldPath,
    /// Path to the active optic's zoom (`f32`)
    pub optic_zoom: FieldPath,
}

/// Skeleton layouts, relative to an entity's root transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeletonOffsets {
    /// Root -> bone transform list
    pub bone_list: Vec<u64>,
    /// Offset of the first element inside the list
    pub list_data: u64,
    /// Bone transform -> internal transform pointer
    pub transform_internal: u64,
    /// Internal transform -> index into the shared vertex buffer (`i32`)
    pub transform_index: u64,
    /// Internal transform -> hierarchy pointer
    pub hierarchy: u64,
    /// Hierarchy -> vertex buffer pointer
    pub hierarchy_vertices: u64,
    /// Hierarchy -> parent index buffer pointer
    pub hierarchy_parents: u64,
    /// Bone list slot per joint; joints absent here use [`Bone::default_slot`]
    pub slots: BTreeMap<Bone, u32>,
}

impl Default for SkeletonOffsets {
    fn default() -> Self {
        Self {
            bone_list: vec![0x28, 0x28, 0x10],
            list_data: 0x20,
            transform_internal: 0x10,
            transform_index: 0x40,
            hierarchy: 0x38,
            hierarchy_vertices: 0x18,
            hierarchy_parents: 0x20,
            slots: BTreeMap::new(),
        }
    }
}

impl SkeletonOffsets {
    /// Bone list slot for `bone`
    pub fn slot(&self, bone: Bone) -> u32 {
        self.slots.get(&bone).copied().unwrap_or_else(|| bone.default_slot())
    }
}
