// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Dynamic loader access through `dlopen`

use builtin_shim::{HostLoader, NativeHandle};
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::warn;

/// Last error reported by the dynamic loader
pub(crate) fn last_dl_error() -> String {
    // SAFETY: dlerror returns null or a NUL-terminated thread-local string.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dynamic loader error".to_string();
    }
    // SAFETY: checked non-null above.
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

/// Opens libraries with `dlopen(RTLD_NOW)`
#[derive(Debug, Default, Clone, Copy)]
pub struct DlLoader;

impl HostLoader for DlLoader {
    fn open(&self, path: &Path) -> core::result::Result<NativeHandle, String> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| format!("{}: path contains a NUL byte", path.display()))?;
        // SAFETY: `c_path` is a valid C string for the duration of the call.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(last_dl_error());
        }
        Ok(NativeHandle::new(handle as usize))
    }

    fn close(&self, handle: NativeHandle) {
        // SAFETY: handles only come from a successful `open`.
        if unsafe { libc::dlclose(handle.as_raw() as *mut libc::c_void) } != 0 {
            warn!("dlclose failed: {}", last_dl_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let result = DlLoader.open(Path::new("/nonexistent/libnothing.so"));
        assert!(result.unwrap_err().contains("libnothing"));
    }

    #[test]
    fn test_nul_in_path() {
        let path = Path::new(std::ffi::OsStr::from_bytes(b"lib\0bad.so"));
        assert!(DlLoader.open(path).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_and_close_libc() {
        let handle = DlLoader.open(Path::new("libc.so.6")).unwrap();
        assert_ne!(handle.as_raw(), 0);
        DlLoader.close(handle);
    }
}
