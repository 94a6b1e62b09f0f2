//! Virtual address bounds
//!
//! Anything outside the user-mode range is "not a pointer" and must never be
//! handed to a transport.

use crate::{Error, Result};

/// Lowest address we accept; the first 64 KiB are never mapped
pub const MIN_ADDRESS: u64 = 0x10000;

/// Highest canonical user-mode address
pub const MAX_ADDRESS: u64 = 0x7FFF_FFFF_FFFF;

/// Whether `address` could be a real pointer into the target
#[inline]
pub fn is_valid(address: u64) -> bool {
    (MIN_ADDRESS..=MAX_ADDRESS).contains(&address)
}

/// `Ok(address)` when it lies in the plausible range
#[inline]
pub fn check(address: u64) -> Result<u64> {
    if is_valid(address) {
        Ok(address)
    } else {
        Err(Error::InvalidAddress(address))
    }
}

/// Check that `[address, address + size)` stays inside the user-mode range
#[inline]
pub fn check_range(address: u64, size: usize) -> Result<u64> {
    check(address)?;
    let last = address
        .checked_add((size as u64).saturating_sub(1))
        .ok_or(Error::InvalidAddress(address))?;
    if last > MAX_ADDRESS {
        return Err(Error::InvalidAddress(address));
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert!(!is_valid(0));
        assert!(!is_valid(0xFFFF));
        assert!(is_valid(0x10000));
        assert!(is_valid(0x7FFF_FFFF_FFFF));
        assert!(!is_valid(0x8000_0000_0000));
        assert!(!is_valid(u64::MAX));
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0x10000, 0x100).is_ok());
        assert!(check_range(0x7FFF_FFFF_FFF0, 0x10).is_ok());
        assert!(matches!(
            check_range(0x7FFF_FFFF_FFF0, 0x11),
            Err(Error::InvalidAddress(0x7FFF_FFFF_FFF0))
        ));
        assert!(matches!(check_range(0, 8), Err(Error::InvalidAddress(0))));
    }
}
