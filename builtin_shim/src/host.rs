// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Host collaborators
//!
//! The bridge never calls the host directly. Page mapping, the dynamic loader
//! and the virtual-view bookkeeping are reached through these traits, which
//! the platform layer implements.

use crate::Result;
use core::ptr::NonNull;
use std::path::Path;

/// Handle returned by the host loader's open primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(usize);

impl NativeHandle {
    /// Create a handle from a raw value
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Get the raw handle value
    pub const fn as_raw(&self) -> usize {
        self.0
    }
}

/// Page protection reported to the view registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Code: readable and executable
    ExecuteRead,
    /// Data: readable and writable
    ReadWrite,
}

/// Host dynamic loader
pub trait HostLoader {
    /// Open the shared library at `path`
    ///
    /// On failure returns the loader's own error message.
    fn open(&self, path: &Path) -> core::result::Result<NativeHandle, String>;

    /// Close a handle returned by [`HostLoader::open`]
    fn close(&self, handle: NativeHandle);
}

/// Source of the regions images are synthesized into
pub trait PageMapper {
    /// Host page size in bytes
    fn page_size(&self) -> usize;

    /// Map `len` bytes (a page multiple) readable and writable
    ///
    /// With `Some(addr)` the region must land exactly at `addr`; any other
    /// outcome is [`crate::BridgeError::FixedMappingRefused`].
    fn map_pages(&self, at: Option<usize>, len: usize) -> Result<NonNull<u8>>;

    /// Make a fully written region read-only
    fn seal_pages(&self, start: NonNull<u8>, len: usize) -> Result<()>;

    /// Release a region that will not become an image
    fn unmap_pages(&self, start: NonNull<u8>, len: usize);
}

/// Page-attribute bookkeeping fed with the ranges of every synthesized image
pub trait ViewRegistrar {
    /// Record that `[start, start + size)` holds module memory with `protection`
    fn register_range(&self, start: usize, size: usize, protection: Protection);
}

impl<F> ViewRegistrar for F
where
    F: Fn(usize, usize, Protection),
{
    fn register_range(&self, start: usize, size: usize, protection: Protection) {
        self(start, size, protection);
    }
}

/// Registrar that only logs the ranges it is given
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingViews;

impl ViewRegistrar for LoggingViews {
    fn register_range(&self, start: usize, size: usize, protection: Protection) {
        tracing::debug!(
            "module view {start:#x}-{:#x} {protection:?}",
            start.wrapping_add(size)
        );
    }
}
