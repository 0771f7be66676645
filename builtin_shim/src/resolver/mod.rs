// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Windows module names to native libraries
//!
//! Translates a Windows module name into the host's shared-library filename,
//! builds candidate paths over the builtin DLL search path and opens the
//! first candidate the host loader accepts.

mod search_path;

pub use search_path::DllSearchPath;

use crate::config::{BridgeConfig, NativeNaming};
use crate::host::{HostLoader, NativeHandle};
use crate::{BridgeError, Result};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Windows module suffixes replaced by the native suffix
const MODULE_SUFFIXES: [&str; 2] = [".dll", ".exe"];

/// Resolves Windows module names against the builtin DLL search path
#[derive(Debug)]
pub struct NameResolver {
    naming: NativeNaming,
    search_path_var: String,
    exe_search_var: String,
    search_path: OnceLock<DllSearchPath>,
}

impl NameResolver {
    /// Resolver reading its search path lazily from the configured variable
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            naming: config.naming.clone(),
            search_path_var: config.search_path_var.clone(),
            exe_search_var: config.exe_search_var.clone(),
            search_path: OnceLock::new(),
        }
    }

    /// Resolver with a fixed search path; the environment is never read
    pub fn with_search_path(config: &BridgeConfig, search_path: DllSearchPath) -> Self {
        let resolver = Self::new(config);
        // A fresh OnceLock is always empty.
        let _ = resolver.search_path.set(search_path);
        resolver
    }

    /// The search path, read from the environment on first use
    pub fn search_path(&self) -> &DllSearchPath {
        self.search_path.get_or_init(|| {
            let path = DllSearchPath::from_env(&self.search_path_var);
            debug!(
                "{} gives {} search directories",
                self.search_path_var,
                path.len()
            );
            path
        })
    }

    pub fn naming(&self) -> &NativeNaming {
        &self.naming
    }

    /// Native filename for a Windows module name
    ///
    /// `foo.dll` becomes `libfoo.so` on Linux; a name without a `.dll` or
    /// `.exe` suffix (any case) keeps its stem and gains the native suffix.
    pub fn native_name(&self, windows_name: &str) -> String {
        let stem = MODULE_SUFFIXES
            .iter()
            .find_map(|suffix| strip_suffix_ignore_case(windows_name, suffix))
            .unwrap_or(windows_name);
        format!("{}{stem}{}", self.naming.prefix, self.naming.suffix)
    }

    /// Bytes needed to hold [`NameResolver::native_name`] plus a NUL terminator
    pub fn native_name_capacity(&self, windows_name: &str) -> usize {
        self.native_name(windows_name).len() + 1
    }

    /// Write the NUL-terminated native name into `buf`
    ///
    /// Returns the length without the terminator.
    pub fn encode_native_name(&self, windows_name: &str, buf: &mut [u8]) -> Result<usize> {
        let name = self.native_name(windows_name);
        let required = name.len() + 1;
        if buf.len() < required {
            return Err(BridgeError::BufferTooSmall { required });
        }
        buf[..name.len()].copy_from_slice(name.as_bytes());
        buf[name.len()] = 0;
        Ok(name.len())
    }

    fn file_name(&self, name: &str, is_native: bool) -> String {
        if is_native {
            name.to_string()
        } else {
            self.native_name(name)
        }
    }

    /// Candidate path in the `index`th search directory
    ///
    /// `name` is translated first unless `is_native`. `None` once `index`
    /// passes the last directory.
    pub fn path_at(&self, name: &str, index: usize, is_native: bool) -> Option<PathBuf> {
        self.search_path()
            .get(index)
            .map(|dir| dir.join(self.file_name(name, is_native)))
    }

    /// Worst-case bytes for any path [`NameResolver::path_at`] can produce for
    /// `name`, including a separator and a NUL terminator
    pub fn path_capacity(&self, name: &str, is_native: bool) -> usize {
        self.search_path().max_dir_len() + 1 + self.file_name(name, is_native).len() + 1
    }

    /// Open a Windows module through the search path
    ///
    /// Every search directory is tried in order, then the bare native name so
    /// the host loader can apply its own rules.
    pub fn open(&self, windows_name: &str, loader: &dyn HostLoader) -> Result<NativeHandle> {
        let native = self.native_name(windows_name);
        let candidates = self
            .search_path()
            .iter()
            .map(|dir| dir.join(&native))
            .chain(std::iter::once(PathBuf::from(&native)));
        try_candidates(windows_name, candidates, loader)
    }

    /// Open the main executable by its literal name
    ///
    /// With `search_path`, each directory of the executable search variable
    /// is tried in turn; otherwise (or with the variable unset) only the
    /// literal name is.
    pub fn open_main_executable(
        &self,
        name: &str,
        search_path: bool,
        loader: &dyn HostLoader,
    ) -> Result<NativeHandle> {
        let value = if search_path {
            std::env::var_os(&self.exe_search_var)
        } else {
            None
        };
        open_main_executable_in(name, value.as_deref(), loader)
    }
}

/// [`NameResolver::open_main_executable`] over an explicit search value
pub fn open_main_executable_in(
    name: &str,
    search_value: Option<&OsStr>,
    loader: &dyn HostLoader,
) -> Result<NativeHandle> {
    match search_value {
        Some(value) => {
            let candidates = std::env::split_paths(value)
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(|dir| dir.join(name));
            try_candidates(name, candidates, loader)
        }
        None => try_candidates(name, std::iter::once(PathBuf::from(name)), loader),
    }
}

fn try_candidates(
    name: &str,
    candidates: impl Iterator<Item = PathBuf>,
    loader: &dyn HostLoader,
) -> Result<NativeHandle> {
    let mut last_error = String::from("no candidate paths");
    for candidate in candidates {
        match loader.open(&candidate) {
            Ok(handle) => {
                debug!("opened {name} as {}", candidate.display());
                return Ok(handle);
            }
            Err(err) => {
                trace!("{}: {err}", candidate.display());
                last_error = err;
            }
        }
    }
    Err(BridgeError::LibraryNotFound {
        name: name.to_string(),
        reason: last_error,
    })
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let split = name.len().checked_sub(suffix.len())?;
    if !name.is_char_boundary(split) {
        return None;
    }
    let (stem, tail) = name.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then_some(stem)
}
