// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Segment locators, one per object format
//!
//! [`HostSegmentLocator`] names the one this build uses.

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
mod elf;
#[cfg(target_vendor = "apple")]
mod macho;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub use elf::{ElfLocator, loaded_objects};
#[cfg(target_vendor = "apple")]
pub use macho::MachOLocator;

pub use builtin_shim::segments::UnsupportedLocator;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub type HostSegmentLocator = ElfLocator;

#[cfg(target_vendor = "apple")]
pub type HostSegmentLocator = MachOLocator;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_vendor = "apple"
)))]
pub type HostSegmentLocator = UnsupportedLocator;

/// Start of the mapping of the module containing `addr`
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_vendor = "apple"
))]
pub(crate) fn module_base(addr: usize) -> builtin_shim::Result<usize> {
    let mut info = core::mem::MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: dladdr only writes to `info`.
    let found = unsafe { libc::dladdr(addr as *const libc::c_void, info.as_mut_ptr()) };
    if found == 0 {
        return Err(builtin_shim::BridgeError::SegmentsUnavailable {
            addr,
            reason: "no loaded module contains this address".to_string(),
        });
    }
    // SAFETY: dladdr filled `info` on success.
    let info = unsafe { info.assume_init() };
    Ok(info.dli_fbase as usize)
}
