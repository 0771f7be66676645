// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Mach-O hosts: `dladdr` finds the image header, its load commands give the
//! segments

use builtin_shim::segments::macho::{MachHeader64, image_header_len, segments_from_load_commands};
use builtin_shim::{ModuleSegments, Result, SegmentLocator};

use super::module_base;
use crate::mmap::host_page_size;

/// Locator walking the segment load commands of loaded images
#[derive(Debug, Clone, Copy)]
pub struct MachOLocator {
    page_size: usize,
}

impl MachOLocator {
    pub fn new() -> Self {
        Self {
            page_size: host_page_size(),
        }
    }
}

impl Default for MachOLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentLocator for MachOLocator {
    fn locate(&self, addr: usize) -> Result<ModuleSegments> {
        let header = module_base(addr)?;
        // SAFETY: dladdr reported a mapped image header at `header`.
        let fixed = unsafe {
            core::slice::from_raw_parts(header as *const u8, size_of::<MachHeader64>())
        };
        let len = image_header_len(fixed)?;
        // SAFETY: the header and its load commands are mapped together.
        let image = unsafe { core::slice::from_raw_parts(header as *const u8, len) };
        segments_from_load_commands(header, image, self.page_size)
    }
}
