//! memsight: live object-graph reader for a foreign process
//!
//! This library reconstructs selected parts of a remote process's object graph
//! from raw virtual memory and projects world-space positions onto a 2D
//! viewport, once per refresh tick.
//!
//! # Architecture
//!
//! - **Platform Layer**: Raw transports into the foreign address space (Linux, Windows)
//! - **Memory Layer**: Typed, verified and batched reads, pointer chains, process lifecycle
//! - **Camera Engine**: Camera discovery, view-matrix validation, world-to-screen projection
//! - **Skeleton**: Per-entity bone transform cache producing screen-space line segments
//! - **Session**: The primary worker driving everything above through the lifecycle

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod camera;
pub mod config;
pub mod math;
pub mod memory;
pub mod platform;
pub mod session;
pub mod skeleton;
pub mod task;

// Re-export commonly used types
pub use camera::{CameraEngine, ViewMatrix};
pub use config::Config;
pub use memory::{Lifecycle, LifecycleEvent, Memory, ScatterBatch};
pub use platform::{ReadFlags, Transport};
pub use skeleton::{Bone, Skeleton};

/// Result type used throughout the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for memsight
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Address outside the plausible user-mode range
    #[error("Invalid address 0x{0:X}")]
    InvalidAddress(u64),

    /// Transport read failed
    #[error("Memory read failed at address 0x{address:X} (size: {size}): {reason}")]
    ReadFailure {
        /// The address that failed to read
        address: u64,
        /// Requested size in bytes
        size: usize,
        /// Why the read failed
        reason: String,
    },

    /// Transport write failed
    #[error("Memory write failed at address 0x{address:X} (size: {size}): {reason}")]
    WriteFailure {
        /// The address that failed to write
        address: u64,
        /// Size of the write in bytes
        size: usize,
        /// Why the write failed
        reason: String,
    },

    /// Verified read disagreed between samples
    #[error("Torn read at 0x{address:X} (size: {size})")]
    TornRead {
        /// The address that was sampled
        address: u64,
        /// Sample size in bytes
        size: usize,
    },

    /// A pointer chain hop produced an unusable pointer
    #[error("Pointer chain broke at hop {hop} (base 0x{base:X}, offset 0x{offset:X}): got 0x{value:X}")]
    ChainResolution {
        /// Base the chain started from
        base: u64,
        /// Zero-based hop index that failed
        hop: usize,
        /// Offset applied at that hop
        offset: u64,
        /// The value read at that hop
        value: u64,
    },

    /// View matrix failed geometric plausibility checks
    #[error("View matrix rejected: {0}")]
    MatrixInvalid(camera::MatrixRejection),

    /// View matrix unchanged for too many ticks
    #[error("View matrix frozen for {ticks} ticks")]
    MatrixFrozen {
        /// Consecutive identical ticks observed
        ticks: u32,
    },

    /// Vertex buffer sample failed validation
    #[error("Vertex buffer corrupt at entry {index}: {reason}")]
    BufferCorrupt {
        /// Offending entry
        index: usize,
        /// What was wrong with it
        reason: &'static str,
    },

    /// Bone index exceeds the cached buffer
    #[error("Index {index} out of range (len {len})")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Buffer length
        len: usize,
    },

    /// Joint has no resolved vertex index
    #[error("Joint {0:?} is not resolved")]
    JointUnresolved(skeleton::Bone),

    /// The foreign process is gone
    #[error("Target process lost")]
    ProcessLost,

    /// Illegal lifecycle transition
    #[error("Invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State we were in
        from: memory::LifecycleState,
        /// State that was requested
        to: memory::LifecycleState,
    },

    /// Operation observed a cancelled restart token
    #[error("Cancelled")]
    Cancelled,

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(#[from] platform::PlatformError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error means the target process is gone for good
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProcessLost)
    }
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging for the library
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("memsight=info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();
}
