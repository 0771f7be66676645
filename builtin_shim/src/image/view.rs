// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Read access to synthesized images
//!
//! Everything is decoded from the image region the way a PE consumer would:
//! headers at their standard offsets, directories located through the data
//! directory table, and every stored address resolved against the base.

use super::from_rva;
use super::layout::{
    DIRECTORY_EXPORT, DIRECTORY_IMPORT, DIRECTORY_RESOURCE, DataDirectory, DosHeader,
    ExportDirectory, NtHeaders, RESOURCE_DATA_IS_DIRECTORY, RESOURCE_NAME_IS_STRING,
    ResourceDataRecord, ResourceTableEntry, ResourceTableHeader, SECTION_TABLE_OFFSET,
    SectionHeader,
};
use super::resources::ResourceName;
use crate::segments::SegmentRange;
use std::ffi::{CStr, c_char};
use zerocopy::{FromBytes, Immutable};

/// A synthesized image, identified by its region
///
/// Only [`super::Synthesizer::synthesize`] creates these. The region is
/// sealed read-only and never unmapped, so every accessor hands out
/// `'static` data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntheticImage {
    base: usize,
    len: usize,
}

impl SyntheticImage {
    pub(crate) fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Address of the region, which starts with the DOS header
    pub fn base(&self) -> usize {
        self.base
    }

    /// The whole image region: header, then directory copies
    pub fn region(&self) -> &'static [u8] {
        // SAFETY: the region was mapped with `len` bytes, fully written and
        // sealed before this image was handed out, and is never unmapped.
        unsafe { core::slice::from_raw_parts(self.base as *const u8, self.len) }
    }

    /// Resolve an offset stored in this image; null gives `None`
    pub fn resolve(&self, rva: u32) -> Option<usize> {
        from_rva(rva, self.base)
    }

    /// Region bytes from `rva` on, if `rva` falls inside the region
    fn bytes_at(&self, rva: u32) -> Option<&'static [u8]> {
        self.region().get(rva as usize..)
    }

    /// `count` records at `rva`, empty when null or outside the region
    fn array_at<T: FromBytes + Immutable>(&self, rva: u32, count: usize) -> &'static [T] {
        if rva == 0 || count == 0 {
            return &[];
        }
        self.bytes_at(rva)
            .and_then(|bytes| <[T]>::ref_from_prefix_with_elems(bytes, count).ok())
            .map(|(items, _)| items)
            .unwrap_or_default()
    }

    pub fn dos_header(&self) -> &'static DosHeader {
        // SAFETY: the region is page aligned and starts with a DOS header.
        unsafe { &*(self.base as *const DosHeader) }
    }

    pub fn nt_headers(&self) -> &'static NtHeaders {
        let offset = self.dos_header().e_lfanew as usize;
        // SAFETY: `e_lfanew` is the aligned offset of the NT headers written
        // into the same region.
        unsafe { &*((self.base + offset) as *const NtHeaders) }
    }

    /// The section table: `.text`, then `.data`
    pub fn sections(&self) -> &'static [SectionHeader] {
        let count = usize::from(self.nt_headers().file_header.number_of_sections);
        // SAFETY: the section table follows the NT headers in the same region.
        unsafe {
            core::slice::from_raw_parts(
                (self.base + SECTION_TABLE_OFFSET) as *const SectionHeader,
                count,
            )
        }
    }

    /// One data directory
    pub fn directory(&self, index: usize) -> DataDirectory {
        self.nt_headers().optional_header.data_directory[index]
    }

    /// Absolute entry point, if the module has one
    pub fn entry_point(&self) -> Option<usize> {
        self.resolve(self.nt_headers().optional_header.address_of_entry_point)
    }

    fn section_range(&self, section: &SectionHeader) -> SegmentRange {
        if section.virtual_size == 0 {
            return SegmentRange::EMPTY;
        }
        SegmentRange::new(
            self.base.wrapping_add(section.virtual_address as usize),
            section.virtual_size as usize,
        )
    }

    /// Absolute range of the code section
    pub fn code_range(&self) -> SegmentRange {
        self.section_range(&self.sections()[0])
    }

    /// Absolute range of the data section (possibly empty)
    pub fn data_range(&self) -> SegmentRange {
        self.section_range(&self.sections()[1])
    }

    /// Import slots: null or offsets from the base
    pub fn import_slots(&self) -> &'static [usize] {
        let directory = self.directory(DIRECTORY_IMPORT);
        self.array_at(
            directory.virtual_address,
            directory.size as usize / size_of::<usize>(),
        )
    }

    /// The resource directory
    pub fn resources(&self) -> Option<ResourceView> {
        let directory = self.directory(DIRECTORY_RESOURCE);
        if directory.is_empty() {
            return None;
        }
        let bytes = self
            .bytes_at(directory.virtual_address)?
            .get(..directory.size as usize)?;
        Some(ResourceView { image: *self, bytes })
    }

    /// The export directory
    pub fn exports(&self) -> Option<ExportView> {
        let directory = self.directory(DIRECTORY_EXPORT);
        if directory.is_empty() {
            return None;
        }
        let (directory, _) =
            ExportDirectory::ref_from_prefix(self.bytes_at(directory.virtual_address)?).ok()?;
        Some(ExportView {
            image: *self,
            directory,
        })
    }
}

/// Read access to the export directory of a synthesized image
#[derive(Debug, Clone, Copy)]
pub struct ExportView {
    image: SyntheticImage,
    directory: &'static ExportDirectory,
}

impl ExportView {
    pub fn directory(&self) -> &'static ExportDirectory {
        self.directory
    }

    fn c_str(&self, rva: u32) -> Option<&'static CStr> {
        self.image
            .resolve(rva)
            // SAFETY: export tables only carry null or offsets of
            // NUL-terminated strings that outlive the process.
            .map(|addr| unsafe { CStr::from_ptr(addr as *const c_char) })
    }

    /// Module name recorded in the directory
    pub fn module_name(&self) -> Option<&'static CStr> {
        self.c_str(self.directory.name)
    }

    /// Function offsets, one per declared function
    pub fn functions(&self) -> &'static [u32] {
        self.image.array_at(
            self.directory.address_of_functions,
            self.directory.number_of_functions as usize,
        )
    }

    /// Name offsets, one per declared name
    pub fn names(&self) -> &'static [u32] {
        self.image.array_at(
            self.directory.address_of_names,
            self.directory.number_of_names as usize,
        )
    }

    /// Function indices parallel to [`ExportView::names`]
    pub fn ordinals(&self) -> &'static [u16] {
        self.image.array_at(
            self.directory.address_of_name_ordinals,
            self.directory.number_of_names as usize,
        )
    }

    /// Exported name at `index`
    pub fn name(&self, index: usize) -> Option<&'static CStr> {
        self.names().get(index).and_then(|&rva| self.c_str(rva))
    }

    /// Absolute address of the function exported as `name`
    pub fn lookup(&self, name: &str) -> Option<usize> {
        let index = (0..self.names().len())
            .find(|&i| self.name(i).is_some_and(|n| n.to_bytes() == name.as_bytes()))?;
        let ordinal = usize::from(*self.ordinals().get(index)?);
        self.functions()
            .get(ordinal)
            .and_then(|&rva| self.image.resolve(rva))
    }

    /// Absolute address of the function with export ordinal `ordinal`
    pub fn lookup_ordinal(&self, ordinal: u32) -> Option<usize> {
        let index = ordinal.checked_sub(self.directory.base)? as usize;
        self.functions()
            .get(index)
            .and_then(|&rva| self.image.resolve(rva))
    }
}

/// Read access to the resource directory of a synthesized image
#[derive(Debug, Clone, Copy)]
pub struct ResourceView {
    image: SyntheticImage,
    bytes: &'static [u8],
}

/// What a resource entry leads to
#[derive(Debug, Clone, Copy)]
pub enum ResourceNodeView {
    Table(ResourceTableView),
    Data(&'static ResourceDataRecord),
}

impl ResourceView {
    /// The root table
    pub fn root(&self) -> Option<ResourceTableView> {
        self.table(0)
    }

    fn table(&self, offset: usize) -> Option<ResourceTableView> {
        let (header, rest) = ResourceTableHeader::ref_from_prefix(self.bytes.get(offset..)?).ok()?;
        let count =
            usize::from(header.number_of_named_entries) + usize::from(header.number_of_id_entries);
        let (entries, _) = <[ResourceTableEntry]>::ref_from_prefix_with_elems(rest, count).ok()?;
        Some(ResourceTableView {
            resources: *self,
            offset,
            header,
            entries,
        })
    }

    fn record(&self, offset: usize) -> Option<&'static ResourceDataRecord> {
        ResourceDataRecord::ref_from_prefix(self.bytes.get(offset..)?)
            .ok()
            .map(|(record, _)| record)
    }

    fn name(&self, offset: usize) -> Option<String> {
        let (length, rest) = u16::read_from_prefix(self.bytes.get(offset..)?).ok()?;
        let (units, _) = <[u16]>::ref_from_prefix_with_elems(rest, usize::from(length)).ok()?;
        Some(String::from_utf16_lossy(units))
    }

    /// Number of tables reachable from the root, the root included
    pub fn directory_count(&self) -> usize {
        self.root().map_or(0, |root| root.directory_count())
    }

    /// Every data record, depth first in entry order
    pub fn leaves(&self) -> Vec<&'static ResourceDataRecord> {
        let mut leaves = Vec::new();
        if let Some(root) = self.root() {
            root.collect_leaves(&mut leaves);
        }
        leaves
    }

    /// Follow `path` from the root, one entry name per level
    pub fn find(&self, path: &[ResourceName]) -> Option<ResourceNodeView> {
        let mut node = ResourceNodeView::Table(self.root()?);
        for name in path {
            let ResourceNodeView::Table(table) = node else {
                return None;
            };
            node = table.find(name)?;
        }
        Some(node)
    }

    /// The resource bytes a data record of this directory points at
    pub fn bytes(&self, record: &ResourceDataRecord) -> Option<&'static [u8]> {
        let at = core::ptr::from_ref(record).cast::<u8>();
        if !self.bytes.as_ptr_range().contains(&at) {
            return None;
        }
        let address = self.image.resolve(record.offset_to_data)?;
        // SAFETY: records in a synthesized image point at the `'static`
        // bytes the template's leaves were built from.
        Some(unsafe { core::slice::from_raw_parts(address as *const u8, record.size as usize) })
    }
}

/// One table of the resource directory
#[derive(Debug, Clone, Copy)]
pub struct ResourceTableView {
    resources: ResourceView,
    offset: usize,
    header: &'static ResourceTableHeader,
    entries: &'static [ResourceTableEntry],
}

impl ResourceTableView {
    pub fn header(&self) -> &'static ResourceTableHeader {
        self.header
    }

    /// Named entries followed by numbered entries
    pub fn entries(&self) -> &'static [ResourceTableEntry] {
        self.entries
    }

    /// Identifier of one of this table's entries
    pub fn name(&self, entry: &ResourceTableEntry) -> Option<ResourceName> {
        if entry.name & RESOURCE_NAME_IS_STRING == 0 {
            return u16::try_from(entry.name).ok().map(ResourceName::Id);
        }
        let offset = (entry.name & !RESOURCE_NAME_IS_STRING) as usize;
        self.resources.name(offset).map(ResourceName::Name)
    }

    /// What one of this table's entries leads to
    ///
    /// Sub-tables always follow their parent; an entry pointing backwards
    /// leads nowhere.
    pub fn node(&self, entry: &ResourceTableEntry) -> Option<ResourceNodeView> {
        let offset = (entry.offset_to_data & !RESOURCE_DATA_IS_DIRECTORY) as usize;
        if entry.offset_to_data & RESOURCE_DATA_IS_DIRECTORY == 0 {
            return self.resources.record(offset).map(ResourceNodeView::Data);
        }
        if offset <= self.offset {
            return None;
        }
        self.resources.table(offset).map(ResourceNodeView::Table)
    }

    /// Look up a direct child
    pub fn find(&self, name: &ResourceName) -> Option<ResourceNodeView> {
        self.entries
            .iter()
            .find(|entry| self.name(entry).as_ref() == Some(name))
            .and_then(|entry| self.node(entry))
    }

    fn directory_count(&self) -> usize {
        1 + self
            .entries
            .iter()
            .filter_map(|entry| match self.node(entry)? {
                ResourceNodeView::Table(table) => Some(table.directory_count()),
                ResourceNodeView::Data(_) => None,
            })
            .sum::<usize>()
    }

    fn collect_leaves(&self, leaves: &mut Vec<&'static ResourceDataRecord>) {
        for entry in self.entries {
            match self.node(entry) {
                Some(ResourceNodeView::Table(table)) => table.collect_leaves(leaves),
                Some(ResourceNodeView::Data(record)) => leaves.push(record),
                None => {}
            }
        }
    }
}
