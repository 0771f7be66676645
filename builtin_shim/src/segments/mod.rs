// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Segment discovery for already-loaded native modules
//!
//! A [`SegmentLocator`] maps an address inside a loaded module to that
//! module's code and data ranges. The host-independent halves of the ELF and
//! Mach-O strategies live in [`elf`] and [`macho`]; the platform layer feeds
//! them with what the host loader reports and picks one strategy at build
//! time.

pub mod elf;
pub mod macho;

use crate::{BridgeError, Result};

/// Round `value` down to a multiple of `page_size` (a power of two)
pub const fn page_round_down(value: usize, page_size: usize) -> usize {
    value & !(page_size - 1)
}

/// Round `value` up to a multiple of `page_size` (a power of two)
pub const fn page_round_up(value: usize, page_size: usize) -> usize {
    page_round_down(value.saturating_add(page_size - 1), page_size)
}

/// A contiguous range of module memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SegmentRange {
    /// First byte of the range
    pub start: usize,
    /// Length in bytes
    pub size: usize,
}

impl SegmentRange {
    /// The empty range
    pub const EMPTY: Self = Self { start: 0, size: 0 };

    /// Create a range from its start and size
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// One past the last byte of the range
    pub const fn end(&self) -> usize {
        self.start.saturating_add(self.size)
    }

    /// Whether the range covers no memory
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `addr` lies inside the range
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Widen the range to whole pages
    ///
    /// The empty range stays empty.
    pub const fn page_rounded(self, page_size: usize) -> Self {
        if self.is_empty() {
            return Self::EMPTY;
        }
        let start = page_round_down(self.start, page_size);
        let end = page_round_up(self.end(), page_size);
        Self {
            start,
            size: end - start,
        }
    }
}

/// Code and data ranges of one loaded module
///
/// After page rounding the two ranges may overlap on the page where code
/// ends and data begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleSegments {
    /// Read + execute memory
    pub code: SegmentRange,
    /// Read + write memory, possibly empty
    pub data: SegmentRange,
}

impl ModuleSegments {
    /// Create segments from a code and a data range
    pub const fn new(code: SegmentRange, data: SegmentRange) -> Self {
        Self { code, data }
    }

    /// Both ranges widened to whole pages
    pub const fn page_rounded(self, page_size: usize) -> Self {
        Self {
            code: self.code.page_rounded(page_size),
            data: self.data.page_rounded(page_size),
        }
    }

    /// Stand-in used when the host cannot describe the module
    ///
    /// A single page around `addr` for code and nothing for data.
    pub const fn placeholder(addr: usize, page_size: usize) -> Self {
        Self {
            code: SegmentRange::new(page_round_down(addr, page_size), page_size),
            data: SegmentRange::EMPTY,
        }
    }
}

/// Finds the code and data ranges of the module containing an address
pub trait SegmentLocator {
    /// Locate the module containing `addr`
    ///
    /// Either both ranges are produced (data possibly empty) or the call
    /// fails; there is no partial result.
    fn locate(&self, addr: usize) -> Result<ModuleSegments>;
}

/// Locator for hosts with no way to inspect loaded modules
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedLocator;

impl SegmentLocator for UnsupportedLocator {
    fn locate(&self, addr: usize) -> Result<ModuleSegments> {
        Err(BridgeError::SegmentsUnavailable {
            addr,
            reason: "segment discovery is not supported on this host".to_string(),
        })
    }
}
