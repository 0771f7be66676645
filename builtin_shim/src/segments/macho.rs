// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Segment selection from Mach-O load commands
//!
//! The host hands over the bytes of an image's header and load commands
//! (on Apple hosts, read in place from the address `dladdr` reports). Segments
//! are classified by their conventional names rather than by permissions.

use super::{ModuleSegments, SegmentRange};
use crate::{BridgeError, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// 64-bit Mach-O magic
pub const MH_MAGIC_64: u32 = 0xfeed_facf;

/// 64-bit segment load command
pub const LC_SEGMENT_64: u32 = 0x19;

/// Segment holding code
pub const TEXT_SEGMENT: &str = "__TEXT";

/// Segment holding writable data
pub const DATA_SEGMENT: &str = "__DATA";

/// `mach_header_64`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

/// `load_command`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
}

/// `segment_command_64`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: i32,
    pub initprot: i32,
    pub nsects: u32,
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Segment name up to the first NUL
    pub fn name(&self) -> &[u8] {
        let len = self
            .segname
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.segname.len());
        &self.segname[..len]
    }
}

fn malformed(message: impl Into<String>) -> BridgeError {
    BridgeError::MalformedLoadCommands(message.into())
}

/// Number of bytes covering the header and all load commands
///
/// `header` needs to hold at least the [`MachHeader64`].
pub fn image_header_len(header: &[u8]) -> Result<usize> {
    let (mach, _) = MachHeader64::read_from_prefix(header)
        .map_err(|_| malformed("truncated mach header"))?;
    if mach.magic != MH_MAGIC_64 {
        return Err(malformed(format!("bad magic {:#x}", mach.magic)));
    }
    Ok(size_of::<MachHeader64>() + mach.sizeofcmds as usize)
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| malformed(format!("{value:#x} does not fit an address")))
}

/// Code and data ranges of the image whose header sits at `header_addr`
///
/// `image` holds the header and load commands. Segment addresses are slid by
/// the distance between the header and the recorded text address, so images
/// that record header-relative addresses (a zero text address) land relative
/// to the header. The last segment of each name wins.
pub fn segments_from_load_commands(
    header_addr: usize,
    image: &[u8],
    page_size: usize,
) -> Result<ModuleSegments> {
    let (mach, _) = MachHeader64::read_from_prefix(image)
        .map_err(|_| malformed("truncated mach header"))?;
    if mach.magic != MH_MAGIC_64 {
        return Err(malformed(format!("bad magic {:#x}", mach.magic)));
    }

    let mut text: Option<SegmentCommand64> = None;
    let mut data: Option<SegmentCommand64> = None;
    let mut offset = size_of::<MachHeader64>();

    for index in 0..mach.ncmds {
        let rest = image
            .get(offset..)
            .ok_or_else(|| malformed(format!("load command {index} out of bounds")))?;
        let (command, _) = LoadCommand::read_from_prefix(rest)
            .map_err(|_| malformed(format!("load command {index} truncated")))?;
        let size = command.cmdsize as usize;
        if size < size_of::<LoadCommand>() || size > rest.len() {
            return Err(malformed(format!(
                "load command {index} has bad size {size}"
            )));
        }

        if command.cmd == LC_SEGMENT_64 {
            let (segment, _) = SegmentCommand64::read_from_prefix(rest)
                .map_err(|_| malformed(format!("segment command {index} truncated")))?;
            match segment.name() {
                name if name == TEXT_SEGMENT.as_bytes() => text = Some(segment),
                name if name == DATA_SEGMENT.as_bytes() => data = Some(segment),
                _ => {}
            }
        }
        offset += size;
    }

    let text = text.ok_or_else(|| BridgeError::SegmentsUnavailable {
        addr: header_addr,
        reason: format!("image has no {TEXT_SEGMENT} segment"),
    })?;
    let slide = header_addr.wrapping_sub(to_usize(text.vmaddr)?);

    let code = SegmentRange::new(
        to_usize(text.vmaddr)?.wrapping_add(slide),
        to_usize(text.vmsize)?,
    );
    let data = match data {
        Some(segment) => SegmentRange::new(
            to_usize(segment.vmaddr)?.wrapping_add(slide),
            to_usize(segment.vmsize)?,
        ),
        None => SegmentRange::EMPTY,
    };

    Ok(ModuleSegments::new(code, data).page_rounded(page_size))
}
