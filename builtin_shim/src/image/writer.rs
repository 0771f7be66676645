// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Directory area of an image under construction
//!
//! Copies of the template's directories are laid out here before the image
//! base is known. Positions inside the area become image-relative offsets
//! directly; fields that point outside the image (into the module) are
//! recorded as fixups and resolved once a base is chosen.

use super::to_rva;
use crate::{BridgeError, Result};
use zerocopy::{Immutable, IntoBytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupWidth {
    /// A 32-bit offset field
    Rva,
    /// A pointer-sized slot holding an offset
    Slot,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    offset: usize,
    target: usize,
    width: FixupWidth,
}

#[derive(Debug)]
pub(crate) struct AreaWriter {
    origin: usize,
    bytes: Vec<u8>,
    fixups: Vec<Fixup>,
}

impl AreaWriter {
    /// Empty area placed `origin` bytes into the image
    pub(crate) fn new(origin: usize) -> Self {
        Self {
            origin,
            bytes: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Pad with zeros up to a multiple of `align`
    pub(crate) fn align(&mut self, align: usize) {
        let padded = self.bytes.len().next_multiple_of(align);
        self.bytes.resize(padded, 0);
    }

    /// Append a record, returning its position in the area
    pub(crate) fn push<T: IntoBytes + Immutable + ?Sized>(&mut self, value: &T) -> usize {
        let position = self.bytes.len();
        self.bytes.extend_from_slice(value.as_bytes());
        position
    }

    /// Append `count` zeroed items of `T`, returning their position
    pub(crate) fn reserve<T>(&mut self, count: usize) -> usize {
        let position = self.bytes.len();
        self.bytes.resize(position + count * size_of::<T>(), 0);
        position
    }

    /// Replace the bytes of a record pushed earlier
    pub(crate) fn overwrite<T: IntoBytes + Immutable + ?Sized>(&mut self, position: usize, value: &T) {
        let bytes = value.as_bytes();
        self.bytes[position..position + bytes.len()].copy_from_slice(bytes);
    }

    /// Image-relative offset of an area position
    pub(crate) fn rva(&self, position: usize) -> Result<u32> {
        let offset = self.origin + position;
        u32::try_from(offset).map_err(|_| BridgeError::ImageTooLarge(offset))
    }

    /// Have the 32-bit field at `position` hold `target - base`
    ///
    /// A null target leaves the field null.
    pub(crate) fn fixup_rva(&mut self, position: usize, target: usize) {
        self.fixup(position, target, FixupWidth::Rva);
    }

    /// Have the pointer-sized slot at `position` hold `target - base`
    pub(crate) fn fixup_slot(&mut self, position: usize, target: usize) {
        self.fixup(position, target, FixupWidth::Slot);
    }

    fn fixup(&mut self, offset: usize, target: usize, width: FixupWidth) {
        if target != 0 {
            self.fixups.push(Fixup {
                offset,
                target,
                width,
            });
        }
    }

    /// Lowest address outside the image the area refers to
    pub(crate) fn lowest_target(&self) -> Option<usize> {
        self.fixups.iter().map(|fixup| fixup.target).min()
    }

    /// The area's bytes with every fixup resolved against `base`
    pub(crate) fn resolve(&self, base: usize) -> Result<Vec<u8>> {
        let mut bytes = self.bytes.clone();
        for fixup in &self.fixups {
            let rva = to_rva(fixup.target, base)?;
            let at = fixup.offset;
            match fixup.width {
                FixupWidth::Rva => bytes[at..at + 4].copy_from_slice(&rva.to_ne_bytes()),
                FixupWidth::Slot => {
                    let slot = rva as usize;
                    bytes[at..at + size_of::<usize>()].copy_from_slice(&slot.to_ne_bytes());
                }
            }
        }
        Ok(bytes)
    }
}
