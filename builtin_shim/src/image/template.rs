// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Header template a builtin module describes itself with
//!
//! The template is a read-only blueprint. Every address in it is
//! process-absolute; synthesis copies what it needs and converts the copies
//! to image-relative offsets, so one template can back any number of images.

use super::exports::ExportTables;
use super::layout::{
    DataDirectory, FILE_DLL, FILE_EXECUTABLE_IMAGE, FILE_LARGE_ADDRESS_AWARE, HOST_MACHINE,
    SUBSYSTEM_WINDOWS_CUI,
};
use super::resources::ResourceDirectory;
use super::writer::AreaWriter;
use crate::{BridgeError, Result};

/// Flat block of pointer-sized import slots
///
/// Every slot is either null or an absolute address; the block ends with an
/// all-zero sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportBlock {
    address: usize,
    size: usize,
}

impl ImportBlock {
    /// Import block backed by `slots`
    pub fn from_slots(slots: &'static [usize]) -> Self {
        Self {
            address: slots.as_ptr() as usize,
            size: size_of_val(slots),
        }
    }

    /// Import block at an absolute address
    ///
    /// # Safety
    /// `address` must point at `size` readable bytes of `usize`-aligned slots
    /// that stay valid for the life of the process.
    pub unsafe fn from_raw(address: usize, size: usize) -> Self {
        Self { address, size }
    }

    /// Absolute address of the first slot
    pub fn address(&self) -> usize {
        self.address
    }

    /// Declared size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of whole slots covered by the declared size
    pub fn slot_count(&self) -> usize {
        self.size / size_of::<usize>()
    }

    pub(crate) fn slots(&self) -> &'static [usize] {
        if self.slot_count() == 0 {
            return &[];
        }
        // SAFETY: both constructors guarantee `slot_count` readable slots for
        // the process lifetime.
        unsafe { core::slice::from_raw_parts(self.address as *const usize, self.slot_count()) }
    }

    /// Copy the whole slots into `area`, each non-null one as an offset
    ///
    /// The directory covers exactly the copied slots; a trailing partial
    /// slot in the declared size is dropped.
    pub(crate) fn write(&self, area: &mut AreaWriter) -> Result<DataDirectory> {
        area.align(align_of::<usize>());
        let slots = self.slots();
        let start = area.reserve::<usize>(slots.len());
        for (index, &slot) in slots.iter().enumerate() {
            area.fixup_slot(start + index * size_of::<usize>(), slot);
        }
        let size = size_of_val(slots);
        Ok(DataDirectory {
            virtual_address: area.rva(start)?,
            size: u32::try_from(size).map_err(|_| BridgeError::ImageTooLarge(size))?,
        })
    }
}

/// Compiled-in description of a builtin module
#[derive(Debug, Clone)]
pub struct ModuleTemplate {
    machine: u16,
    characteristics: u16,
    subsystem: u16,
    preferred_base: usize,
    entry_point: usize,
    imports: Option<ImportBlock>,
    resources: Option<ResourceDirectory>,
    exports: Option<ExportTables>,
}

impl ModuleTemplate {
    fn with_characteristics(characteristics: u16) -> Self {
        let large_address = if cfg!(target_pointer_width = "64") {
            FILE_LARGE_ADDRESS_AWARE
        } else {
            0
        };
        Self {
            machine: HOST_MACHINE,
            characteristics: characteristics | large_address,
            subsystem: SUBSYSTEM_WINDOWS_CUI,
            preferred_base: 0,
            entry_point: 0,
            imports: None,
            resources: None,
            exports: None,
        }
    }

    /// Template for a library module
    pub fn library() -> Self {
        Self::with_characteristics(FILE_EXECUTABLE_IMAGE | FILE_DLL)
    }

    /// Template for the main executable
    pub fn main_executable() -> Self {
        Self::with_characteristics(FILE_EXECUTABLE_IMAGE)
    }

    /// Set the machine type
    pub fn with_machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Set the subsystem
    pub fn with_subsystem(mut self, subsystem: u16) -> Self {
        self.subsystem = subsystem;
        self
    }

    /// Request the image region at a fixed address (0 for near the module)
    pub fn with_preferred_base(mut self, base: usize) -> Self {
        self.preferred_base = base;
        self
    }

    /// Set the absolute entry point address (0 for none)
    pub fn with_entry_point(mut self, entry_point: usize) -> Self {
        self.entry_point = entry_point;
        self
    }

    /// Set the import block
    pub fn with_imports(mut self, imports: ImportBlock) -> Self {
        self.imports = Some(imports);
        self
    }

    /// Set the resource tree
    pub fn with_resources(mut self, resources: ResourceDirectory) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Set the export tables
    pub fn with_exports(mut self, exports: ExportTables) -> Self {
        self.exports = Some(exports);
        self
    }

    pub fn machine(&self) -> u16 {
        self.machine
    }

    pub fn characteristics(&self) -> u16 {
        self.characteristics
    }

    pub fn subsystem(&self) -> u16 {
        self.subsystem
    }

    pub fn preferred_base(&self) -> usize {
        self.preferred_base
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub fn imports(&self) -> Option<&ImportBlock> {
        self.imports.as_ref()
    }

    pub fn resources(&self) -> Option<&ResourceDirectory> {
        self.resources.as_ref()
    }

    pub fn exports(&self) -> Option<&ExportTables> {
        self.exports.as_ref()
    }

    /// Whether this template describes the main executable rather than a library
    pub fn is_main_executable(&self) -> bool {
        self.characteristics & FILE_DLL == 0
    }

    /// Address of the template itself, used to find the module it lives in
    pub fn address(&self) -> usize {
        core::ptr::from_ref(self) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_vs_main_executable() {
        assert!(!ModuleTemplate::library().is_main_executable());
        assert!(ModuleTemplate::main_executable().is_main_executable());
        assert_ne!(
            ModuleTemplate::library().characteristics() & FILE_DLL,
            0
        );
    }

    #[test]
    fn test_import_block_slot_count() {
        let slots: &'static [usize] = Box::leak(vec![1, 2, 3, 0].into_boxed_slice());
        let block = ImportBlock::from_slots(slots);
        assert_eq!(block.size(), 4 * size_of::<usize>());
        assert_eq!(block.slot_count(), 4);
        assert_eq!(block.slots(), slots);
    }

    #[test]
    fn test_partial_slot_ignored() {
        let slots: &'static [usize] = Box::leak(vec![1, 0].into_boxed_slice());
        // SAFETY: the declared size stays inside the leaked slots.
        let block = unsafe { ImportBlock::from_raw(slots.as_ptr() as usize, size_of::<usize>() + 3) };
        assert_eq!(block.slot_count(), 1);
    }

    #[test]
    fn test_import_directory_covers_whole_slots() {
        let slots: &'static [usize] = Box::leak(vec![0, 0, 0].into_boxed_slice());
        let targets = slots.as_ptr() as usize;
        let slots: &'static [usize] = Box::leak(vec![targets, 0, targets + 8].into_boxed_slice());
        // SAFETY: the declared size stays inside the leaked slots.
        let block = unsafe {
            ImportBlock::from_raw(slots.as_ptr() as usize, 2 * size_of::<usize>() + 5)
        };
        let mut area = AreaWriter::new(0x1a0);
        let directory = block.write(&mut area).unwrap();
        assert_eq!(directory.size as usize, 2 * size_of::<usize>());
        assert_eq!(directory.virtual_address, 0x1a0);

        let bytes = area.resolve(targets - 0x40).unwrap();
        assert_eq!(bytes.len(), 2 * size_of::<usize>());
        assert_eq!(bytes[..size_of::<usize>()], 0x40usize.to_ne_bytes());
        assert!(bytes[size_of::<usize>()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_builder() {
        let template = ModuleTemplate::library()
            .with_preferred_base(0x7bc0_0000)
            .with_entry_point(0x1234);
        assert_eq!(template.preferred_base(), 0x7bc0_0000);
        assert_eq!(template.entry_point(), 0x1234);
        assert!(template.imports().is_none());
        assert_eq!(template.machine(), HOST_MACHINE);
    }
}
