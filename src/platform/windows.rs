//! Windows platform implementation
//!
//! This module provides a Windows transport for an external process using
//! `ReadProcessMemory` / `WriteProcessMemory`.

use super::{PlatformError, ReadFlags, Transport};
use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE,
};

/// Exit code reported for processes that have not terminated
const STILL_ACTIVE: u32 = 259;

/// Windows transport implementation
pub struct WindowsTransport {
    /// Handle to the target process
    process_handle: HANDLE,
}

impl WindowsTransport {
    /// Open a transport to a specific process
    pub fn attach(process_id: u32) -> Result<Self, PlatformError> {
        let access = PROCESS_VM_READ
            | PROCESS_VM_WRITE
            | PROCESS_VM_OPERATION
            | PROCESS_QUERY_LIMITED_INFORMATION;

        // SAFETY: OpenProcess has no memory-safety preconditions.
        let process_handle = unsafe { OpenProcess(access, BOOL::from(false), process_id) }
            .map_err(|e| PlatformError::AccessDenied(format!("Failed to open process {}: {}", process_id, e)))?;

        Ok(Self { process_handle })
    }
}

impl Transport for WindowsTransport {
    fn read_into(&self, address: u64, buffer: &mut [u8], _flags: ReadFlags) -> Result<(), PlatformError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let size = buffer.len();
        let mut bytes_read = 0;

        // SAFETY: the destination is a live buffer of exactly `size` bytes.
        unsafe {
            ReadProcessMemory(
                self.process_handle,
                address as *const _,
                buffer.as_mut_ptr() as *mut _,
                size,
                Some(&mut bytes_read as *mut usize),
            )
        }
        .map_err(|e| PlatformError::MemoryReadFailed {
            address,
            size,
            reason: format!("ReadProcessMemory failed: {}", e),
        })?;

        if bytes_read != size {
            return Err(PlatformError::MemoryReadFailed {
                address,
                size,
                reason: format!("Expected to read {} bytes, got {}", size, bytes_read),
            });
        }

        Ok(())
    }

    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<(), PlatformError> {
        if data.is_empty() {
            return Ok(());
        }

        let size = data.len();
        let mut bytes_written = 0;

        // SAFETY: the source is a live buffer of exactly `size` bytes.
        unsafe {
            WriteProcessMemory(
                self.process_handle,
                address as *const _,
                data.as_ptr() as *const _,
                size,
                Some(&mut bytes_written as *mut usize),
            )
        }
        .map_err(|e| PlatformError::MemoryWriteFailed {
            address,
            size,
            reason: format!("WriteProcessMemory failed: {}", e),
        })?;

        if bytes_written != size {
            return Err(PlatformError::MemoryWriteFailed {
                address,
                size,
                reason: format!("Expected to write {} bytes, wrote {}", size, bytes_written),
            });
        }

        Ok(())
    }

    fn is_alive(&self) -> bool {
        let mut code = 0u32;
        // SAFETY: `code` outlives the call.
        unsafe { GetExitCodeProcess(self.process_handle, &mut code) }.is_ok() && code == STILL_ACTIVE
    }
}

impl Drop for WindowsTransport {
    fn drop(&mut self) {
        // SAFETY: the handle was opened by us and is closed exactly once.
        let _ = unsafe { CloseHandle(self.process_handle) };
    }
}

// The raw HANDLE is only used through thread-safe Win32 calls
unsafe impl Send for WindowsTransport {}
unsafe impl Sync for WindowsTransport {}
