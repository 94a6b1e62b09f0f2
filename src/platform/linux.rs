//! Linux platform implementation
//!
//! This module provides a Linux transport using `process_vm_readv` and
//! `process_vm_writev`, which move many iovecs in a single syscall.

use super::{PlatformError, ReadFlags, ScatterEntry, Transport};
use std::io;

/// Maximum iovecs per syscall (`IOV_MAX` on Linux)
const IOV_MAX: usize = 1024;

/// Linux transport implementation
pub struct LinuxTransport {
    /// Process ID we're reading from
    pid: libc::pid_t,
}

impl LinuxTransport {
    /// Attach to a specific process
    ///
    /// Requires ptrace access to the target (same user with a permissive
    /// `ptrace_scope`, or `CAP_SYS_PTRACE`).
    pub fn attach(pid: i32) -> Result<Self, PlatformError> {
        let transport = Self { pid };

        if !transport.is_alive() {
            return Err(PlatformError::AccessDenied(format!(
                "Process {} is not running or not accessible: {}",
                pid,
                io::Error::last_os_error()
            )));
        }

        Ok(transport)
    }

    /// Process ID of the target
    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn readv(&self, local: &[libc::iovec], remote: &[libc::iovec]) -> io::Result<usize> {
        // SAFETY: every local iovec points into a live, exclusively borrowed buffer
        // of exactly iov_len bytes; remote iovecs are only interpreted by the kernel.
        let result = unsafe {
            libc::process_vm_readv(
                self.pid,
                local.as_ptr(),
                local.len() as libc::c_ulong,
                remote.as_ptr(),
                remote.len() as libc::c_ulong,
                0,
            )
        };

        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(result as usize)
        }
    }

    /// Scatter one chunk of at most `IOV_MAX` entries
    fn read_chunk(&self, entries: &mut [ScatterEntry], flags: ReadFlags) {
        let mut local = Vec::with_capacity(entries.len());
        let mut remote = Vec::with_capacity(entries.len());

        for entry in entries.iter_mut() {
            local.push(libc::iovec {
                iov_base: entry.buffer.as_mut_ptr() as *mut libc::c_void,
                iov_len: entry.buffer.len(),
            });
            remote.push(libc::iovec {
                iov_base: entry.address as *mut libc::c_void,
                iov_len: entry.buffer.len(),
            });
        }

        // The kernel stops at the first remote iovec it cannot read; entries
        // fully covered by the returned byte count are good.
        let mut transferred = self.readv(&local, &remote).unwrap_or(0);
        let mut first_failed = entries.len();

        for (index, entry) in entries.iter_mut().enumerate() {
            let size = entry.buffer.len();
            if transferred >= size {
                transferred -= size;
                entry.ok = true;
            } else {
                first_failed = index;
                break;
            }
        }

        // Retry the remainder one by one so a single bad address does not
        // poison everything after it.
        for entry in entries.iter_mut().skip(first_failed) {
            entry.ok = self.read_into(entry.address, &mut entry.buffer, flags).is_ok();
        }
    }
}

impl Transport for LinuxTransport {
    fn read_into(&self, address: u64, buffer: &mut [u8], _flags: ReadFlags) -> Result<(), PlatformError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let size = buffer.len();
        let local = [libc::iovec {
            iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
            iov_len: size,
        }];
        let remote = [libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: size,
        }];

        let read = self.readv(&local, &remote).map_err(|e| PlatformError::MemoryReadFailed {
            address,
            size,
            reason: format!("process_vm_readv failed: {}", e),
        })?;

        if read != size {
            return Err(PlatformError::MemoryReadFailed {
                address,
                size,
                reason: format!("Expected {} bytes, got {}", size, read),
            });
        }

        Ok(())
    }

    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<(), PlatformError> {
        if data.is_empty() {
            return Ok(());
        }

        let size = data.len();
        let local = [libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: size,
        }];
        let remote = [libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: size,
        }];

        // SAFETY: the local iovec only describes `data`, which the kernel reads from.
        let written = unsafe {
            libc::process_vm_writev(self.pid, local.as_ptr(), 1, remote.as_ptr(), 1, 0)
        };

        if written < 0 {
            return Err(PlatformError::MemoryWriteFailed {
                address,
                size,
                reason: format!("process_vm_writev failed: {}", io::Error::last_os_error()),
            });
        }

        if written as usize != size {
            return Err(PlatformError::MemoryWriteFailed {
                address,
                size,
                reason: format!("Expected {} bytes, wrote {}", size, written),
            });
        }

        Ok(())
    }

    fn read_scatter(&self, entries: &mut [ScatterEntry], flags: ReadFlags) -> Result<(), PlatformError> {
        for chunk in entries.chunks_mut(IOV_MAX) {
            self.read_chunk(chunk, flags);
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        // SAFETY: signal 0 performs only the existence and permission check.
        let result = unsafe { libc::kill(self.pid, 0) };
        result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_process() -> LinuxTransport {
        LinuxTransport::attach(std::process::id() as i32).unwrap()
    }

    #[test]
    fn test_attach_self() {
        let transport = own_process();
        assert!(transport.is_alive());
        assert_eq!(transport.pid(), std::process::id() as i32);
    }

    #[test]
    fn test_read_memory() {
        let transport = own_process();

        // Read from our own memory
        let test_value: u64 = 0x1234567890ABCDEF;
        let address = &test_value as *const u64 as u64;

        let mut buffer = [0u8; 8];
        transport.read_into(address, &mut buffer, ReadFlags::UNCACHED).unwrap();
        assert_eq!(u64::from_ne_bytes(buffer), test_value);
    }

    #[test]
    fn test_scatter_isolates_bad_entries() {
        let transport = own_process();

        let first: u32 = 0xAAAA_5555;
        let second: u32 = 0x1234_5678;
        let mut entries = vec![
            ScatterEntry::new(&first as *const u32 as u64, 4),
            ScatterEntry::new(0x10, 4),
            ScatterEntry::new(&second as *const u32 as u64, 4),
        ];

        transport.read_scatter(&mut entries, ReadFlags::CACHED).unwrap();

        assert!(entries[0].ok);
        assert!(!entries[1].ok);
        assert!(entries[2].ok);
        assert_eq!(u32::from_ne_bytes(entries[2].buffer[..4].try_into().unwrap()), second);
    }
}
