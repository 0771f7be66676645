// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Resource directory tree and its image form
//!
//! A directory holds named and numbered entries, named ones first, each
//! group kept sorted the way resource lookups binary-search them. An entry
//! is either a sub-directory or a leaf pointing at the resource bytes. In a
//! template the leaf pointers are absolute; the image form is the standard
//! table/entry/data-record layout in which only the leaves' data pointers
//! are offsets from the image base.

use super::layout::{
    DataDirectory, RESOURCE_DATA_IS_DIRECTORY, RESOURCE_NAME_IS_STRING, ResourceDataRecord,
    ResourceTableEntry, ResourceTableHeader,
};
use super::writer::AreaWriter;
use crate::{BridgeError, Result};
use core::cmp::Ordering;
use core::mem::offset_of;

/// Identifier of a resource entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceName {
    /// Numeric identifier
    Id(u16),
    /// String identifier
    Name(String),
}

/// Named entries before numbered ones; names by UTF-16 code units
impl Ord for ResourceName {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Name(a), Self::Name(b)) => a.encode_utf16().cmp(b.encode_utf16()),
            (Self::Name(_), Self::Id(_)) => Ordering::Less,
            (Self::Id(_), Self::Name(_)) => Ordering::Greater,
            (Self::Id(a), Self::Id(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for ResourceName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Leaf entry describing one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDataEntry {
    address: usize,
    size: u32,
    code_page: u32,
}

impl ResourceDataEntry {
    /// Leaf pointing at `data`
    pub fn new(data: &'static [u8]) -> Result<Self> {
        let size = u32::try_from(data.len()).map_err(|_| {
            BridgeError::InvalidResources(format!("resource of {} bytes", data.len()))
        })?;
        Ok(Self {
            address: data.as_ptr() as usize,
            size,
            code_page: 0,
        })
    }

    /// Set the code page
    #[must_use]
    pub fn with_code_page(mut self, code_page: u32) -> Self {
        self.code_page = code_page;
        self
    }

    /// Absolute address of the resource bytes
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn code_page(&self) -> u32 {
        self.code_page
    }
}

/// What an entry leads to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceNode {
    Directory(ResourceDirectory),
    Data(ResourceDataEntry),
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub name: ResourceName,
    pub node: ResourceNode,
}

/// Resource directory node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    entries: Vec<ResourceEntry>,
}

impl ResourceDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry in sorted position
    #[must_use]
    pub fn with_entry(mut self, name: ResourceName, node: ResourceNode) -> Self {
        let position = self.entries.partition_point(|entry| entry.name <= name);
        self.entries.insert(position, ResourceEntry { name, node });
        self
    }

    /// Add a sub-directory
    #[must_use]
    pub fn with_directory(self, name: ResourceName, directory: ResourceDirectory) -> Self {
        self.with_entry(name, ResourceNode::Directory(directory))
    }

    /// Add a leaf
    #[must_use]
    pub fn with_data(self, name: ResourceName, data: ResourceDataEntry) -> Self {
        self.with_entry(name, ResourceNode::Data(data))
    }

    /// Named entries followed by numbered entries
    pub fn entries(&self) -> impl Iterator<Item = &ResourceEntry> {
        self.entries.iter()
    }

    /// Number of entries identified by string
    pub fn named_count(&self) -> usize {
        self.entries
            .iter()
            .take_while(|entry| matches!(entry.name, ResourceName::Name(_)))
            .count()
    }

    /// Number of entries identified by number
    pub fn id_count(&self) -> usize {
        self.entries.len() - self.named_count()
    }

    /// Look up a direct child
    pub fn find(&self, name: &ResourceName) -> Option<&ResourceNode> {
        self.entries()
            .find(|entry| &entry.name == name)
            .map(|entry| &entry.node)
    }

    /// Number of directory nodes in this tree, this one included
    pub fn directory_count(&self) -> usize {
        1 + self
            .entries()
            .map(|entry| match &entry.node {
                ResourceNode::Directory(sub) => sub.directory_count(),
                ResourceNode::Data(_) => 0,
            })
            .sum::<usize>()
    }

    /// Every leaf in the tree, depth first
    pub fn leaves(&self) -> Vec<&ResourceDataEntry> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a ResourceDataEntry>) {
        for entry in self.entries() {
            match &entry.node {
                ResourceNode::Directory(sub) => sub.collect_leaves(leaves),
                ResourceNode::Data(data) => leaves.push(data),
            }
        }
    }

    /// Lay the tree out in `area` as standard resource records
    ///
    /// Directory tables come first, breadth first, each followed by its
    /// entries; then one data record per leaf; then the entry names. Offsets
    /// between records are relative to the root table. Only each data
    /// record's pointer to the resource bytes becomes an offset from the base.
    pub(crate) fn write(&self, area: &mut AreaWriter) -> Result<DataDirectory> {
        area.align(align_of::<ResourceTableHeader>());
        let root = area.len();

        let mut tables = vec![self];
        let mut index = 0;
        while let Some(table) = tables.get(index).copied() {
            tables.extend(table.entries().filter_map(|entry| match &entry.node {
                ResourceNode::Directory(sub) => Some(sub),
                ResourceNode::Data(_) => None,
            }));
            index += 1;
        }

        let mut table_offsets = Vec::with_capacity(tables.len());
        let mut cursor = 0;
        for table in &tables {
            table_offsets.push(cursor);
            cursor += size_of::<ResourceTableHeader>()
                + table.entries.len() * size_of::<ResourceTableEntry>();
        }
        let records_start = cursor;
        let leaf_count = tables
            .iter()
            .flat_map(|table| table.entries())
            .filter(|entry| matches!(entry.node, ResourceNode::Data(_)))
            .count();
        let mut string_cursor = records_start + leaf_count * size_of::<ResourceDataRecord>();

        let mut next_table = 1;
        let mut leaves = Vec::with_capacity(leaf_count);
        let mut strings: Vec<Vec<u16>> = Vec::new();
        for table in &tables {
            area.push(&ResourceTableHeader {
                characteristics: table.characteristics,
                time_date_stamp: table.time_date_stamp,
                major_version: table.major_version,
                minor_version: table.minor_version,
                number_of_named_entries: count16(table.named_count())?,
                number_of_id_entries: count16(table.id_count())?,
            });
            for entry in table.entries() {
                let name = match &entry.name {
                    ResourceName::Id(id) => u32::from(*id),
                    ResourceName::Name(name) => {
                        let units: Vec<u16> = name.encode_utf16().collect();
                        let at = string_cursor;
                        string_cursor += size_of::<u16>() * (1 + units.len());
                        strings.push(units);
                        RESOURCE_NAME_IS_STRING | directory_offset(at)?
                    }
                };
                let offset_to_data = match &entry.node {
                    ResourceNode::Directory(_) => {
                        let at = table_offsets[next_table];
                        next_table += 1;
                        RESOURCE_DATA_IS_DIRECTORY | directory_offset(at)?
                    }
                    ResourceNode::Data(data) => {
                        let at = records_start + leaves.len() * size_of::<ResourceDataRecord>();
                        leaves.push(data);
                        directory_offset(at)?
                    }
                };
                area.push(&ResourceTableEntry {
                    name,
                    offset_to_data,
                });
            }
        }

        for leaf in leaves {
            let at = area.push(&ResourceDataRecord {
                offset_to_data: 0,
                size: leaf.size,
                code_page: leaf.code_page,
                reserved: 0,
            });
            area.fixup_rva(at + offset_of!(ResourceDataRecord, offset_to_data), leaf.address);
        }
        for units in &strings {
            area.push(&count16(units.len())?);
            area.push(&units[..]);
        }
        area.align(align_of::<ResourceTableHeader>());

        Ok(DataDirectory {
            virtual_address: area.rva(root)?,
            size: u32::try_from(area.len() - root)
                .map_err(|_| BridgeError::ImageTooLarge(area.len()))?,
        })
    }
}

/// Offset inside the resource directory, clear of the flag bit
fn directory_offset(offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .ok()
        .filter(|&offset| offset & RESOURCE_DATA_IS_DIRECTORY == 0)
        .ok_or_else(|| BridgeError::InvalidResources("resource directory too large".to_string()))
}

fn count16(count: usize) -> Result<u16> {
    u16::try_from(count)
        .map_err(|_| BridgeError::InvalidResources(format!("{count} entries or name units")))
}
