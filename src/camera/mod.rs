//! Projection engine
//!
//! [`CameraEngine`] is the single source of truth for "where is the camera":
//! it holds the discovered camera handles, refreshes the active camera's view
//! matrix once per tick through a scatter batch, runs the plausibility and
//! staleness checks, and publishes the result as one [`CameraState`] value.
//!
//! The published state is replaced wholesale under a short write lock, so a
//! reader never sees a matrix mixed from two ticks. The viewport lives in the
//! same value, so a projector always pairs a matrix with the viewport it was
//! published under.

pub(crate) mod discovery;
pub(crate) mod matrix;
mod projection;
mod staleness;

pub use discovery::{discover, CameraHandle, DiscoveredCameras};
pub use matrix::{MatrixLimits, MatrixRejection, ViewMatrix};
pub use projection::{Projector, ScopeCorrection, ScreenBounds, Viewport};
pub use staleness::{Recovery, StalenessTracker};

use crate::config::{AimOffsets, CameraConfig, CameraOffsets, Config};
use crate::math::{Vec2, Vec3};
use crate::memory::{address, Memory};
use crate::platform::{ModuleInfo, ReadFlags};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Camera state published after each successful refresh
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CameraState {
    /// Last accepted view matrix
    pub matrix: ViewMatrix,
    /// Camera the matrix was read from
    pub source: Option<u64>,
    /// Field of view of that camera, degrees
    pub fov: f32,
    /// Aspect ratio of that camera
    pub aspect: f32,
    /// Optic zoom while aiming, else 0
    pub zoom: f32,
    /// Aim-down-sights flag
    pub aiming: bool,
    /// Aiming through a magnified optic
    pub scoped: bool,
    /// When the matrix was accepted
    pub updated_at: Option<Instant>,
    /// Viewport projections use with this matrix
    pub viewport: Viewport,
}

/// Everything a diagnostic overlay wants to show about the camera
#[derive(Debug, Clone, PartialEq)]
pub struct CameraDebug {
    /// Matrix rows
    pub rows: [[f32; 4]; 4],
    /// Primary camera address
    pub primary: Option<u64>,
    /// Secondary camera address
    pub secondary: Option<u64>,
    /// Camera the current matrix came from
    pub source: Option<u64>,
    /// Viewport width
    pub width: f32,
    /// Viewport height
    pub height: f32,
    /// Field of view, degrees
    pub fov: f32,
    /// Aspect ratio
    pub aspect: f32,
    /// Optic zoom
    pub zoom: f32,
    /// Aim-down-sights flag
    pub aiming: bool,
    /// Scoped flag
    pub scoped: bool,
    /// Age of the matrix
    pub age: Option<Duration>,
    /// Consecutive identical ticks
    pub frozen_ticks: u32,
    /// Consecutive invalid ticks
    pub invalid_ticks: u32,
}

/// Resolved aim field addresses for the current local player
#[derive(Debug, Default)]
struct AimAddresses {
    aiming: Option<u64>,
    zoom: Option<u64>,
}

/// Camera discovery, matrix refresh and world-to-screen projection
pub struct CameraEngine {
    config: CameraConfig,
    offsets: CameraOffsets,
    aim_offsets: AimOffsets,
    limits: MatrixLimits,
    cameras: RwLock<Option<DiscoveredCameras>>,
    state: RwLock<CameraState>,
    tracker: Mutex<StalenessTracker>,
    aim: Mutex<AimAddresses>,
    local_player: AtomicU64,
    rediscover: AtomicBool,
}

impl CameraEngine {
    /// Create an engine with no cameras
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.camera.clone(),
            offsets: config.offsets.camera.clone(),
            aim_offsets: config.offsets.aim.clone(),
            limits: MatrixLimits::from(&config.camera),
            cameras: RwLock::new(None),
            state: RwLock::new(CameraState {
                viewport: Viewport::from(config.viewport),
                ..CameraState::default()
            }),
            tracker: Mutex::new(StalenessTracker::new(&config.camera)),
            aim: Mutex::new(AimAddresses::default()),
            local_player: AtomicU64::new(0),
            rediscover: AtomicBool::new(false),
        }
    }

    /// Change the target resolution; invalid sizes fall back to the default
    pub fn set_viewport(&self, width: i32, height: i32) {
        let mut state = self.state.write();
        let next = Viewport::resolve(width, height);
        if state.viewport != next {
            info!(width = next.width(), height = next.height(), "Viewport changed");
            state.viewport = next;
        }
    }

    /// Current viewport
    pub fn viewport(&self) -> Viewport {
        self.state.read().viewport
    }

    /// Set the local player object aim state is read from (0 clears it)
    pub fn set_local_player(&self, player: u64) {
        let previous = self.local_player.swap(player, Ordering::SeqCst);
        if previous != player {
            *self.aim.lock() = AimAddresses::default();
        }
    }

    /// Scan for cameras and install them; `Ok(false)` if none were found yet
    pub fn discover(&self, memory: &Memory, module: &ModuleInfo) -> Result<bool> {
        let found = discovery::discover(
            memory,
            module,
            &self.offsets,
            self.config.scan_limit,
            self.config.name_length,
        )?;

        match found {
            Some(cameras) => {
                self.install(cameras);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Install camera handles for this session
    pub fn install(&self, cameras: DiscoveredCameras) {
        info!(
            primary = format_args!("{:#x}", cameras.primary.camera),
            secondary = ?cameras.secondary.map(|s| format!("{:#x}", s.camera)),
            "Cameras installed"
        );
        self.tracker.lock().reset();
        *self.cameras.write() = Some(cameras);
        self.rediscover.store(false, Ordering::SeqCst);
    }

    /// Installed camera handles
    pub fn cameras(&self) -> Option<DiscoveredCameras> {
        *self.cameras.read()
    }

    /// Whether cameras have been discovered this session
    pub fn is_initialized(&self) -> bool {
        self.cameras.read().is_some()
    }

    /// Drop the cameras and ask the owner to discover them again
    pub fn request_rediscovery(&self, recovery: Recovery) {
        warn!(?recovery, "Camera re-resolution requested");
        *self.cameras.write() = None;
        *self.aim.lock() = AimAddresses::default();
        self.tracker.lock().reset();
        self.rediscover.store(true, Ordering::SeqCst);
    }

    /// Whether a re-resolution is pending
    pub fn needs_rediscovery(&self) -> bool {
        self.rediscover.load(Ordering::SeqCst)
    }

    /// Consume a pending re-resolution request
    pub fn take_rediscovery(&self) -> bool {
        self.rediscover.swap(false, Ordering::SeqCst)
    }

    /// Forget everything session-scoped
    pub fn reset(&self) {
        *self.cameras.write() = None;
        {
            let mut state = self.state.write();
            *state = CameraState {
                viewport: state.viewport,
                ..CameraState::default()
            };
        }
        *self.aim.lock() = AimAddresses::default();
        self.tracker.lock().reset();
        self.local_player.store(0, Ordering::SeqCst);
        self.rediscover.store(false, Ordering::SeqCst);
        debug!("Camera state reset");
    }

    fn aim_addresses(&self, memory: &Memory) -> AimAddresses {
        let player = self.local_player.load(Ordering::SeqCst);
        if !address::is_valid(player) || !self.aim_offsets.aiming.is_configured() {
            return AimAddresses::default();
        }

        let mut aim = self.aim.lock();
        if aim.aiming.is_none() {
            aim.aiming = memory.resolve_field(player, &self.aim_offsets.aiming).ok();
        }
        AimAddresses {
            aiming: aim.aiming,
            zoom: aim.zoom,
        }
    }

    fn update_zoom_address(&self, memory: &Memory, aiming: bool) {
        let mut aim = self.aim.lock();
        if !aiming {
            aim.zoom = None;
            return;
        }

        let player = self.local_player.load(Ordering::SeqCst);
        if aim.zoom.is_none() && self.aim_offsets.optic_zoom.is_configured() {
            aim.zoom = memory.resolve_field(player, &self.aim_offsets.optic_zoom).ok();
        }
    }

    fn reject(&self, rejection: MatrixRejection) -> Error {
        let recovery = self.tracker.lock().observe_invalid();
        if let Some(recovery) = recovery {
            self.request_rediscovery(recovery);
        }
        Error::MatrixInvalid(rejection)
    }

    /// Read, check and publish the active camera's matrix
    ///
    /// Does nothing until cameras are installed. Rejected or frozen matrices
    /// leave the previously published state in place and are reported as
    /// [`Error::MatrixInvalid`] / [`Error::MatrixFrozen`].
    pub fn refresh(&self, memory: &Memory) -> Result<()> {
        let Some(cameras) = self.cameras() else {
            return Ok(());
        };

        let previous = *self.state.read();
        let active = match (previous.scoped, cameras.secondary) {
            (true, Some(optic)) => optic,
            _ => cameras.primary,
        };
        let aim = self.aim_addresses(memory);

        let mut batch = memory.scatter(ReadFlags::UNCACHED);
        batch
            .prepare::<[f32; 16]>(active.view_matrix)
            .prepare::<f32>(active.fov(&self.offsets))
            .prepare::<f32>(active.aspect(&self.offsets));
        if let Some(flag) = aim.aiming {
            batch.prepare::<u8>(flag);
        }
        if let Some(zoom) = aim.zoom {
            batch.prepare::<f32>(zoom);
        }
        let results = batch.execute()?;

        let Some(raw) = results.read::<[f32; 16]>(active.view_matrix) else {
            return Err(self.reject(MatrixRejection::Unreadable));
        };
        let matrix = ViewMatrix::from_memory(raw);

        if let Err(rejection) = matrix.validate(&self.limits) {
            trace!(%rejection, "Matrix rejected");
            return Err(self.reject(rejection));
        }

        let frozen = self.tracker.lock().observe_valid(&matrix);
        if let Some(recovery) = frozen {
            self.request_rediscovery(recovery);
            let ticks = match recovery {
                Recovery::Frozen { ticks } | Recovery::Invalid { ticks } => ticks,
            };
            return Err(Error::MatrixFrozen { ticks });
        }

        let aiming = aim
            .aiming
            .and_then(|flag| results.read::<u8>(flag))
            .is_some_and(|flag| flag != 0);
        let zoom = match aim.zoom {
            Some(address) if aiming => results
                .read::<f32>(address)
                .filter(|z| z.is_finite() && *z > 0.0)
                .unwrap_or(0.0),
            _ => 0.0,
        };
        self.update_zoom_address(memory, aiming);

        let fov = results
            .read::<f32>(active.fov(&self.offsets))
            .filter(|f| f.is_finite() && *f > 0.0 && *f < 180.0)
            .unwrap_or(previous.fov);
        let aspect = results
            .read::<f32>(active.aspect(&self.offsets))
            .filter(|a| a.is_finite() && *a > 0.0)
            .unwrap_or(previous.aspect);

        let mut state = self.state.write();
        *state = CameraState {
            matrix,
            source: Some(active.camera),
            fov,
            aspect,
            zoom,
            aiming,
            scoped: aiming && zoom > 0.0,
            updated_at: Some(Instant::now()),
            viewport: state.viewport,
        };
        Ok(())
    }

    /// Copy of the published state
    pub fn snapshot(&self) -> CameraState {
        *self.state.read()
    }

    /// A projector for the published state, once a matrix has been accepted
    ///
    /// Matrix and viewport come from the same snapshot.
    pub fn projector(&self) -> Option<Projector> {
        let state = self.snapshot();
        state.updated_at?;

        let scope = state.scoped.then_some(ScopeCorrection {
            fov: state.fov,
            aspect: state.aspect,
        });

        Some(
            Projector::new(state.matrix, state.viewport)
                .with_scope(scope)
                .with_min_w(self.config.min_w),
        )
    }

    /// Project one point with the published state
    pub fn world_to_screen(&self, world: Vec3, bounds: ScreenBounds) -> Option<Vec2> {
        self.projector()?.world_to_screen(world, bounds)
    }

    /// Initialized and holding a matrix accepted within the freshness window
    pub fn is_fresh(&self) -> bool {
        self.is_initialized()
            && self
                .snapshot()
                .updated_at
                .is_some_and(|at| at.elapsed() <= self.config.freshness())
    }

    /// Aim-down-sights flag from the last refresh
    pub fn is_aiming(&self) -> bool {
        self.snapshot().aiming
    }

    /// Scoped flag from the last refresh
    pub fn is_scoped(&self) -> bool {
        self.snapshot().scoped
    }

    /// Diagnostic snapshot
    pub fn debug_snapshot(&self) -> CameraDebug {
        let state = self.snapshot();
        let cameras = self.cameras();
        let tracker = self.tracker.lock().clone();

        CameraDebug {
            rows: *state.matrix.rows(),
            primary: cameras.map(|c| c.primary.camera),
            secondary: cameras.and_then(|c| c.secondary).map(|s| s.camera),
            source: state.source,
            width: state.viewport.width(),
            height: state.viewport.height(),
            fov: state.fov,
            aspect: state.aspect,
            zoom: state.zoom,
            aiming: state.aiming,
            scoped: state.scoped,
            age: state.updated_at.map(|at| at.elapsed()),
            frozen_ticks: tracker.identical_ticks(),
            invalid_ticks: tracker.invalid_ticks(),
        }
    }
}

impl std::fmt::Debug for CameraEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraEngine")
            .field("cameras", &self.cameras())
            .field("fresh", &self.is_fresh())
            .finish_non_exhaustive()
    }
}
