// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Segment selection from ELF program headers
//!
//! The host enumerates loaded objects (on Linux through `dl_iterate_phdr`)
//! and hands them over as [`LoadedObject`]s. This module picks the object
//! that owns a module and classifies its loadable headers by permission.

use super::{ModuleSegments, SegmentRange, page_round_down};
use crate::{BridgeError, Result};

/// Loadable segment
pub const PT_LOAD: u32 = 1;

/// Segment is executable
pub const PF_X: u32 = 0x1;
/// Segment is writable
pub const PF_W: u32 = 0x2;
/// Segment is readable
pub const PF_R: u32 = 0x4;

/// The fields of one program header the bridge looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// `p_type`
    pub kind: u32,
    /// `p_flags`
    pub flags: u32,
    /// `p_vaddr`, relative to the load base for position-independent objects
    pub vaddr: usize,
    /// `p_memsz`
    pub mem_size: usize,
}

impl ProgramHeader {
    /// A `PT_LOAD` header
    pub const fn load(flags: u32, vaddr: usize, mem_size: usize) -> Self {
        Self {
            kind: PT_LOAD,
            flags,
            vaddr,
            mem_size,
        }
    }

    /// Whether this is a loadable segment
    pub const fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }

    const fn has(&self, flags: u32) -> bool {
        self.flags & flags == flags
    }
}

/// One object reported by the host's program-header iteration
#[derive(Debug, Clone, Default)]
pub struct LoadedObject {
    /// Load bias (`dlpi_addr`); zero for non-relocated executables
    pub load_base: usize,
    /// Its program headers, in table order
    pub headers: Vec<ProgramHeader>,
}

impl LoadedObject {
    /// Whether this object is the module whose mapping starts at `module_base`
    ///
    /// Objects that report a zero load base are matched through the address of
    /// their first loadable segment instead.
    pub fn is_module(&self, module_base: usize, page_size: usize) -> bool {
        if self.load_base != 0 {
            return self.load_base == module_base;
        }
        self.headers.iter().find(|h| h.is_load()).is_some_and(|first| {
            first.vaddr == module_base
                || page_round_down(first.vaddr, page_size) == page_round_down(module_base, page_size)
        })
    }

    /// Code and data ranges of this object, page-rounded
    ///
    /// Read + execute headers give the code range and read + write headers
    /// the data range. When several headers fall in the same category only
    /// the last one is kept. Returns `None` when the object has no code.
    pub fn segments(&self, page_size: usize) -> Option<ModuleSegments> {
        let mut code = None;
        let mut data = SegmentRange::EMPTY;

        for header in self.headers.iter().filter(|h| h.is_load()) {
            let range = SegmentRange::new(
                self.load_base.wrapping_add(header.vaddr),
                header.mem_size,
            );
            if header.has(PF_R | PF_X) {
                code = Some(range);
            } else if header.has(PF_R | PF_W) {
                data = range;
            }
        }

        code.map(|code| ModuleSegments::new(code, data).page_rounded(page_size))
    }
}

/// Locate the segments of the module mapped at `module_base`
///
/// `addr` is only used for error reporting.
pub fn locate_in(
    objects: &[LoadedObject],
    addr: usize,
    module_base: usize,
    page_size: usize,
) -> Result<ModuleSegments> {
    let object = objects
        .iter()
        .find(|object| object.is_module(module_base, page_size))
        .ok_or_else(|| BridgeError::SegmentsUnavailable {
            addr,
            reason: format!("no loaded object at {module_base:#x}"),
        })?;

    object
        .segments(page_size)
        .ok_or_else(|| BridgeError::SegmentsUnavailable {
            addr,
            reason: "module has no executable segment".to_string(),
        })
}
