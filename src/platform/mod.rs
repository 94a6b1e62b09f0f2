//! Platform abstraction layer
//!
//! This module provides platform-independent interfaces for:
//! - Reading and writing memory of a foreign process
//! - Batched ("scatter") reads executed in one round trip
//! - Liveness checks on the attached process

use std::fmt;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::WindowsTransport;

#[cfg(unix)]
mod linux;
#[cfg(unix)]
pub use linux::LinuxTransport;

#[cfg(test)]
pub mod mock;

/// Platform-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Failed to read memory at address
    #[error("Memory read failed at 0x{address:X} (size: {size}): {reason}")]
    MemoryReadFailed {
        /// Target address
        address: u64,
        /// Bytes requested
        size: usize,
        /// Platform error text
        reason: String,
    },

    /// Failed to write memory at address
    #[error("Memory write failed at 0x{address:X} (size: {size}): {reason}")]
    MemoryWriteFailed {
        /// Target address
        address: u64,
        /// Bytes requested
        size: usize,
        /// Platform error text
        reason: String,
    },

    /// Process could not be opened
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Other(String),
}

/// Information about the module holding the tables we start from
///
/// Handed to us by whatever discovered the process; never resolved here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Base address of the module
    pub base_address: u64,
    /// Size of the module image in bytes
    pub size: u64,
    /// Name of the module
    pub name: String,
}

impl ModuleInfo {
    /// Check if an address is within the module image
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.size
    }
}

/// Per-read transport hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFlags {
    /// Whether the transport may serve this read from its page cache
    pub cached: bool,
}

impl ReadFlags {
    /// Allow cached pages
    pub const CACHED: ReadFlags = ReadFlags { cached: true };
    /// Force a fresh read from the target
    pub const UNCACHED: ReadFlags = ReadFlags { cached: false };
}

impl Default for ReadFlags {
    fn default() -> Self {
        Self::CACHED
    }
}

/// One read inside a scatter round trip
#[derive(Debug, Clone)]
pub struct ScatterEntry {
    /// Address to read from
    pub address: u64,
    /// Destination; its length is the read size
    pub buffer: Vec<u8>,
    /// Set by the transport when the read completed
    pub ok: bool,
}

impl ScatterEntry {
    /// Create an entry reading `size` bytes at `address`
    pub fn new(address: u64, size: usize) -> Self {
        Self {
            address,
            buffer: vec![0u8; size],
            ok: false,
        }
    }
}

/// Core trait for moving bytes in and out of a target process
///
/// Implementations never validate addresses beyond what the OS requires;
/// range checks happen in [`crate::memory`] before a transport is touched.
pub trait Transport: Send + Sync {
    /// Read exactly `buffer.len()` bytes at `address`
    fn read_into(&self, address: u64, buffer: &mut [u8], flags: ReadFlags) -> Result<(), PlatformError>;

    /// Write `data` at `address`
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<(), PlatformError>;

    /// Read many entries in as few round trips as the platform allows
    ///
    /// Individual failures are reported through [`ScatterEntry::ok`]; an
    /// `Err` means the whole round trip failed.
    fn read_scatter(&self, entries: &mut [ScatterEntry], flags: ReadFlags) -> Result<(), PlatformError> {
        for entry in entries.iter_mut() {
            entry.ok = self.read_into(entry.address, &mut entry.buffer, flags).is_ok();
        }
        Ok(())
    }

    /// Whether the target process still exists
    fn is_alive(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
