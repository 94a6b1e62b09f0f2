//! Remote memory access layer
//!
//! [`Memory`] wraps a [`Transport`] with typed reads and writes, verified
//! (multi-sample) reads, pointer-chain resolution and scatter batches. Every
//! address is range-checked before a transport call is issued.

pub mod address;
mod lifecycle;
mod scatter;

pub use lifecycle::{Lifecycle, LifecycleEvent, LifecycleState};
pub use scatter::{ScatterBatch, ScatterResults};

use crate::config::{FieldPath, MemoryConfig};
use crate::platform::{PlatformError, ReadFlags, Transport};
use crate::{Error, Result};
use bytemuck::Pod;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Typed access to a foreign process's address space
#[derive(Clone)]
pub struct Memory {
    transport: Arc<dyn Transport>,
    config: MemoryConfig,
}

impl Memory {
    /// Wrap a transport with default limits
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, MemoryConfig::default())
    }

    /// Wrap a transport with explicit limits
    pub fn with_config(transport: Arc<dyn Transport>, config: MemoryConfig) -> Self {
        Self { transport, config }
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Limits in effect
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Whether the target process still exists
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    fn check_size(&self, address: u64, size: usize) -> Result<()> {
        if size > self.config.max_read_size {
            return Err(Error::ReadFailure {
                address,
                size,
                reason: format!("exceeds per-call cap of {} bytes", self.config.max_read_size),
            });
        }
        Ok(())
    }

    /// Read `buffer.len()` bytes at `address` in one round trip
    pub fn read_into(&self, address: u64, buffer: &mut [u8], flags: ReadFlags) -> Result<()> {
        address::check_range(address, buffer.len())?;
        self.check_size(address, buffer.len())?;
        self.transport
            .read_into(address, buffer, flags)
            .map_err(read_failure)
    }

    /// Read `size` raw bytes
    pub fn read_bytes(&self, address: u64, size: usize, flags: ReadFlags) -> Result<Vec<u8>> {
        // Checked before allocating so an absurd size never reaches the allocator
        address::check_range(address, size)?;
        self.check_size(address, size)?;
        let mut buffer = vec![0u8; size];
        self.read_into(address, &mut buffer, flags)?;
        Ok(buffer)
    }

    /// Read a POD (Plain Old Data) value
    pub fn read_value<T: Pod>(&self, address: u64, flags: ReadFlags) -> Result<T> {
        let mut value = T::zeroed();
        self.read_into(address, bytemuck::bytes_of_mut(&mut value), flags)?;
        Ok(value)
    }

    /// Read `count` contiguous POD values
    pub fn read_span<T: Pod>(&self, address: u64, count: usize, flags: ReadFlags) -> Result<Vec<T>> {
        let element = std::mem::size_of::<T>();
        let size = count.checked_mul(element).ok_or(Error::ReadFailure {
            address,
            size: usize::MAX,
            reason: format!("{} elements of {} bytes overflows", count, element),
        })?;

        let bytes = self.read_bytes(address, size, flags)?;
        Ok(bytes.chunks_exact(element).map(bytemuck::pod_read_unaligned).collect())
    }

    /// Read a pointer and insist that it points somewhere plausible
    pub fn read_ptr(&self, address: u64, flags: ReadFlags) -> Result<u64> {
        let value: u64 = self.read_value(address, flags)?;
        address::check(value)
    }

    /// Read a value three times, uncached, and accept it only if every sample agrees
    ///
    /// Triples the cost of a read; reserve it for one-shot fields where a torn
    /// value would cascade into something worse.
    pub fn read_verified<T: Pod>(&self, address: u64) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let samples = self.config.verified_read_samples.max(2);
        let spin = self.config.verified_read_spin();

        let first = self.read_bytes(address, size, ReadFlags::UNCACHED)?;
        for sample in 1..samples {
            spin_for(spin);
            let next = self.read_bytes(address, size, ReadFlags::UNCACHED)?;
            if next != first {
                trace!(address = format_args!("{:#x}", address), sample, "Verified read disagreed");
                return Err(Error::TornRead { address, size });
            }
        }

        Ok(bytemuck::pod_read_unaligned(&first))
    }

    /// Follow `offsets` from `base`, one pointer hop per offset
    ///
    /// Stops at the first hop that yields zero or an out-of-range pointer;
    /// later hops are never attempted.
    pub fn read_pointer_chain(&self, base: u64, offsets: &[u64]) -> Result<u64> {
        let mut current = address::check(base)?;

        for (hop, &offset) in offsets.iter().enumerate() {
            let value: u64 = self.read_value(current.wrapping_add(offset), ReadFlags::CACHED)?;
            if !address::is_valid(value) {
                return Err(Error::ChainResolution {
                    base,
                    hop,
                    offset,
                    value,
                });
            }
            current = value;
        }

        Ok(current)
    }

    /// Resolve a [`FieldPath`] to the address of its field
    pub fn resolve_field(&self, base: u64, path: &FieldPath) -> Result<u64> {
        let object = self.read_pointer_chain(base, &path.chain)?;
        address::check(object.wrapping_add(path.field))
    }

    /// Read a NUL-terminated string of at most `max_length` bytes
    pub fn read_string(&self, address: u64, max_length: usize) -> Result<String> {
        let bytes = self.read_bytes(address, max_length, ReadFlags::CACHED)?;
        Ok(decode_cstr(&bytes))
    }

    /// Read a NUL-terminated UTF-16 string of at most `max_length` code units
    pub fn read_utf16_string(&self, address: u64, max_length: usize) -> Result<String> {
        let bytes = self.read_bytes(address, max_length.saturating_mul(2), ReadFlags::CACHED)?;

        let wide: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .take_while(|&c| c != 0)
            .collect();

        Ok(String::from_utf16_lossy(&wide))
    }

    /// Write a POD value
    pub fn write_value<T: Pod>(&self, address: u64, value: &T) -> Result<()> {
        let bytes = bytemuck::bytes_of(value);
        address::check_range(address, bytes.len())?;
        self.transport
            .write_bytes(address, bytes)
            .map_err(write_failure)
    }

    /// Write a POD value and read it back, retrying if the target overwrote it
    pub fn write_verified<T: Pod>(&self, address: u64, value: &T) -> Result<()> {
        let expected = bytemuck::bytes_of(value);
        let attempts = self.config.write_verify_attempts.max(1);

        for attempt in 1..=attempts {
            self.write_value(address, value)?;
            let actual = self.read_bytes(address, expected.len(), ReadFlags::UNCACHED)?;
            if actual == expected {
                return Ok(());
            }
            trace!(address = format_args!("{:#x}", address), attempt, "Write did not stick");
        }

        Err(Error::WriteFailure {
            address,
            size: expected.len(),
            reason: format!("value did not persist after {} attempts", attempts),
        })
    }

    /// Start a batch of reads executed in a single round trip
    pub fn scatter(&self, flags: ReadFlags) -> ScatterBatch<'_> {
        ScatterBatch::new(self, flags)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Decode bytes up to the first NUL, replacing invalid UTF-8
pub(crate) fn decode_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn spin_for(duration: std::time::Duration) {
    let until = Instant::now() + duration;
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

fn read_failure(error: PlatformError) -> Error {
    match error {
        PlatformError::MemoryReadFailed { address, size, reason } => Error::ReadFailure { address, size, reason },
        other => Error::Platform(other),
    }
}

fn write_failure(error: PlatformError) -> Error {
    match error {
        PlatformError::MemoryWriteFailed { address, size, reason } => Error::WriteFailure { address, size, reason },
        other => Error::Platform(other),
    }
}
