// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Builtin DLL search path

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Ordered list of directories searched for builtin libraries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DllSearchPath {
    dirs: Vec<PathBuf>,
    max_dir_len: usize,
}

impl DllSearchPath {
    /// Search path over explicit directories; empty entries are dropped
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let dirs: Vec<PathBuf> = dirs
            .into_iter()
            .map(Into::into)
            .filter(|dir| !dir.as_os_str().is_empty())
            .collect();
        let max_dir_len = dirs
            .iter()
            .map(|dir| dir.as_os_str().len())
            .max()
            .unwrap_or(0);
        Self { dirs, max_dir_len }
    }

    /// Parse a separator-delimited value such as the content of `PATH`
    pub fn parse(value: &OsStr) -> Self {
        Self::new(std::env::split_paths(value))
    }

    /// Read and parse the variable `var`; unset gives an empty path
    pub fn from_env(var: &str) -> Self {
        match std::env::var_os(var) {
            Some(value) => Self::parse(&value),
            None => Self::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Directory at `index`
    pub fn get(&self, index: usize) -> Option<&Path> {
        self.dirs.get(index).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.dirs.iter().map(PathBuf::as_path)
    }

    /// Length in bytes of the longest directory
    pub fn max_dir_len(&self) -> usize {
        self.max_dir_len
    }
}
