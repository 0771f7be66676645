// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Anonymous image regions

use builtin_shim::image::layout::MIN_PAGE_SIZE;
use builtin_shim::{BridgeError, PageMapper, Result};
use core::ptr::{self, NonNull};
use tracing::trace;

/// Host page size, falling back to 4 KiB if `sysconf` cannot tell
pub fn host_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size)
        .ok()
        .filter(|&size| size >= MIN_PAGE_SIZE)
        .unwrap_or(MIN_PAGE_SIZE)
}

/// Maps image regions with anonymous private `mmap`
///
/// Regions that became images are never unmapped.
#[derive(Debug, Clone, Copy)]
pub struct AnonPageMapper {
    page_size: usize,
}

impl AnonPageMapper {
    /// Create a mapper using the host page size
    pub fn new() -> Self {
        Self {
            page_size: host_page_size(),
        }
    }
}

impl Default for AnonPageMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMapper for AnonPageMapper {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_pages(&self, at: Option<usize>, len: usize) -> Result<NonNull<u8>> {
        use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, mmap};

        let hint = at.map_or(ptr::null_mut(), |addr| addr as *mut libc::c_void);
        // SAFETY: an anonymous private mapping without MAP_FIXED never
        // replaces existing mappings; the address is only a hint.
        let region = unsafe {
            mmap(
                hint,
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if region == MAP_FAILED {
            return Err(match at {
                Some(addr) => BridgeError::FixedMappingRefused(addr),
                None => BridgeError::MappingFailed(std::io::Error::last_os_error().to_string()),
            });
        }

        if let Some(addr) = at {
            if region as usize != addr {
                trace!("wanted {addr:#x}, kernel placed the region at {region:p}");
                // SAFETY: `region` is the mapping created above and nothing
                // refers to it yet.
                unsafe { libc::munmap(region, len) };
                return Err(BridgeError::FixedMappingRefused(addr));
            }
        }

        NonNull::new(region.cast::<u8>())
            .ok_or_else(|| BridgeError::MappingFailed("mmap returned null".to_string()))
    }

    fn seal_pages(&self, start: NonNull<u8>, len: usize) -> Result<()> {
        // SAFETY: `start` came from `map_pages` with the same `len`.
        let result =
            unsafe { libc::mprotect(start.as_ptr().cast::<libc::c_void>(), len, libc::PROT_READ) };
        if result != 0 {
            return Err(BridgeError::MappingFailed(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn unmap_pages(&self, start: NonNull<u8>, len: usize) {
        // SAFETY: `start` came from `map_pages` with the same `len` and the
        // caller no longer refers to it.
        if unsafe { libc::munmap(start.as_ptr().cast::<libc::c_void>(), len) } != 0 {
            trace!(
                "munmap of {start:p} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = host_page_size();
        assert!(size >= MIN_PAGE_SIZE);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_map_anywhere_is_writable() {
        let mapper = AnonPageMapper::new();
        let len = 2 * mapper.page_size();
        let region = mapper.map_pages(None, len).unwrap();
        assert_eq!(region.as_ptr() as usize % mapper.page_size(), 0);
        // SAFETY: the region is mapped read-write and unshared.
        unsafe {
            region.as_ptr().write(0x4d);
            region.as_ptr().add(len - 1).write(0x5a);
            assert_eq!(region.as_ptr().read(), 0x4d);
        }
        mapper.seal_pages(region, len).unwrap();
    }

    #[test]
    fn test_occupied_address_refused() {
        let mapper = AnonPageMapper::new();
        let len = mapper.page_size();
        let taken = mapper.map_pages(None, len).unwrap().as_ptr() as usize;
        let result = mapper.map_pages(Some(taken), len);
        assert!(matches!(result, Err(BridgeError::FixedMappingRefused(addr)) if addr == taken));
    }

    #[test]
    fn test_unmapped_region_can_be_mapped_again() {
        let mapper = AnonPageMapper::new();
        let len = mapper.page_size();
        let region = mapper.map_pages(None, len).unwrap();
        let addr = region.as_ptr() as usize;
        mapper.unmap_pages(region, len);
        let again = mapper.map_pages(Some(addr), len).unwrap();
        assert_eq!(again.as_ptr() as usize, addr);
        mapper.unmap_pages(again, len);
    }
}
