// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Synthesized PE images for builtin modules
//!
//! A builtin module is described by a [`ModuleTemplate`]. The
//! [`Synthesizer`] maps a region just below the module, writes a PE header
//! describing the module's real code and data ranges into it, copies the
//! template's directories after the header, and converts every address they
//! carry into a 32-bit offset from the region start.

pub mod exports;
pub mod layout;
pub mod resources;
pub mod synth;
pub mod template;
pub mod view;
mod writer;

pub use exports::ExportTables;
pub use resources::{ResourceDataEntry, ResourceDirectory, ResourceEntry, ResourceName, ResourceNode};
pub use synth::Synthesizer;
pub use template::{ImportBlock, ModuleTemplate};
pub use view::{ExportView, ResourceNodeView, ResourceTableView, ResourceView, SyntheticImage};

use crate::{BridgeError, Result};

/// Convert an absolute address to an offset from `base`
///
/// Null stays null. On 64-bit hosts the address must lie less than 4 GiB
/// above `base`; on 32-bit hosts every address has an offset, with wrapping.
pub fn to_rva(absolute: usize, base: usize) -> Result<u32> {
    if absolute == 0 {
        return Ok(0);
    }
    u32::try_from(absolute.wrapping_sub(base)).map_err(|_| BridgeError::OffsetOutOfRange {
        address: absolute,
        base,
    })
}

/// Resolve an offset stored in an image
///
/// Null resolves to `None`.
pub const fn from_rva(rva: u32, base: usize) -> Option<usize> {
    if rva == 0 {
        None
    } else {
        Some(base.wrapping_add(rva as usize))
    }
}
