// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! In-memory layout of a synthesized image
//!
//! The records here are the standard PE ones: a DOS header, the NT headers
//! with a PE32+ optional header on 64-bit hosts (PE32 on 32-bit hosts), a
//! two-entry section table, and the export and resource directory records.
//! Every address field holds a 32-bit offset from the image base.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// DOS header magic number "MZ"
pub const DOS_SIGNATURE: u16 = 0x5A4D;

/// PE signature "PE\0\0"
pub const NT_SIGNATURE: u32 = 0x0000_4550;

/// IMAGE_FILE_MACHINE_I386
pub const MACHINE_I386: u16 = 0x014c;
/// IMAGE_FILE_MACHINE_AMD64
pub const MACHINE_AMD64: u16 = 0x8664;
/// IMAGE_FILE_MACHINE_ARM64
pub const MACHINE_ARM64: u16 = 0xaa64;
/// IMAGE_FILE_MACHINE_UNKNOWN
pub const MACHINE_UNKNOWN: u16 = 0;

/// Machine type of the host this crate was built for
pub const HOST_MACHINE: u16 = if cfg!(target_arch = "x86_64") {
    MACHINE_AMD64
} else if cfg!(target_arch = "x86") {
    MACHINE_I386
} else if cfg!(target_arch = "aarch64") {
    MACHINE_ARM64
} else {
    MACHINE_UNKNOWN
};

/// IMAGE_FILE_EXECUTABLE_IMAGE
pub const FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
/// IMAGE_FILE_LARGE_ADDRESS_AWARE
pub const FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
/// IMAGE_FILE_DLL
pub const FILE_DLL: u16 = 0x2000;

/// PE32 optional header magic
pub const PE32_MAGIC: u16 = 0x10b;
/// PE32+ optional header magic
pub const PE32_PLUS_MAGIC: u16 = 0x20b;

/// Optional header magic for the host pointer width
pub const OPTIONAL_HEADER_MAGIC: u16 = if cfg!(target_pointer_width = "64") {
    PE32_PLUS_MAGIC
} else {
    PE32_MAGIC
};

/// IMAGE_SUBSYSTEM_WINDOWS_GUI
pub const SUBSYSTEM_WINDOWS_GUI: u16 = 2;
/// IMAGE_SUBSYSTEM_WINDOWS_CUI
pub const SUBSYSTEM_WINDOWS_CUI: u16 = 3;

pub const NUMBER_OF_DIRECTORY_ENTRIES: usize = 16;
pub const DIRECTORY_EXPORT: usize = 0;
pub const DIRECTORY_IMPORT: usize = 1;
pub const DIRECTORY_RESOURCE: usize = 2;

pub const SCN_CNT_CODE: u32 = 0x0000_0020;
pub const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const SCN_MEM_READ: u32 = 0x4000_0000;
pub const SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Pointer-sized optional header field (stack sizes, image base)
#[cfg(target_pointer_width = "64")]
pub type ImageWord = u64;
/// Pointer-sized optional header field (stack sizes, image base)
#[cfg(target_pointer_width = "32")]
pub type ImageWord = u32;

/// Minimal DOS header: only the signature and the offset of the NT headers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DosHeader {
    pub e_magic: u16,
    pub _reserved: [u8; 58],
    pub e_lfanew: u32,
}

/// PE file header
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Location and size of one directory, relative to the image base
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub const EMPTY: Self = Self {
        virtual_address: 0,
        size: 0,
    };

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Optional header for the host pointer width
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OptionalHeader {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    #[cfg(target_pointer_width = "32")]
    pub base_of_data: u32,
    pub image_base: ImageWord,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: ImageWord,
    pub size_of_stack_commit: ImageWord,
    pub size_of_heap_reserve: ImageWord,
    pub size_of_heap_commit: ImageWord,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [DataDirectory; NUMBER_OF_DIRECTORY_ENTRIES],
}

/// NT headers: signature, file header, optional header
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NtHeaders {
    pub signature: u32,
    pub file_header: FileHeader,
    pub optional_header: OptionalHeader,
}

/// Section table entry
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Section name (null-terminated string)
    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// Export directory
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct ExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// Module name (C string)
    pub name: u32,
    /// First ordinal number
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    /// `number_of_functions` function offsets
    pub address_of_functions: u32,
    /// `number_of_names` name offsets (C strings)
    pub address_of_names: u32,
    /// `number_of_names` indices into the function array
    pub address_of_name_ordinals: u32,
}

/// Set in [`ResourceTableEntry::name`] when the entry is named by a string
pub const RESOURCE_NAME_IS_STRING: u32 = 0x8000_0000;
/// Set in [`ResourceTableEntry::offset_to_data`] when the entry leads to a
/// sub-directory
pub const RESOURCE_DATA_IS_DIRECTORY: u32 = 0x8000_0000;

/// Header of one resource directory table, followed by its entries
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct ResourceTableHeader {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub number_of_named_entries: u16,
    pub number_of_id_entries: u16,
}

/// Resource directory entry
///
/// Both fields hold offsets from the start of the resource directory, not
/// from the image base.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct ResourceTableEntry {
    /// Numeric id, or [`RESOURCE_NAME_IS_STRING`] plus the offset of the name
    pub name: u32,
    /// Offset of a data record, or [`RESOURCE_DATA_IS_DIRECTORY`] plus the
    /// offset of a sub-directory table
    pub offset_to_data: u32,
}

/// Resource leaf
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct ResourceDataRecord {
    /// Offset of the resource bytes from the image base
    pub offset_to_data: u32,
    pub size: u32,
    pub code_page: u32,
    pub reserved: u32,
}

/// Name of the code section
pub const TEXT_SECTION: [u8; 8] = *b".text\0\0\0";
/// Name of the data section
pub const DATA_SECTION: [u8; 8] = *b".data\0\0\0";

/// Sections in every synthesized image: code, then data
pub const SECTION_COUNT: usize = 2;

/// Offset of the NT headers in the page
pub const NT_HEADERS_OFFSET: usize = size_of::<DosHeader>();

/// Offset of the section table in the page
pub const SECTION_TABLE_OFFSET: usize = NT_HEADERS_OFFSET + size_of::<NtHeaders>();

/// Bytes of the page used by the header
pub const HEADER_SIZE: usize = SECTION_TABLE_OFFSET + SECTION_COUNT * size_of::<SectionHeader>();

/// Offset of the directory copies that follow the header
pub const DIRECTORY_AREA_OFFSET: usize = HEADER_SIZE.next_multiple_of(size_of::<usize>());

/// Smallest page size of any supported host
pub const MIN_PAGE_SIZE: usize = 0x1000;

const _: () = assert!(HEADER_SIZE <= MIN_PAGE_SIZE);
const _: () = assert!(NT_HEADERS_OFFSET % align_of::<NtHeaders>() == 0);
const _: () = assert!(SECTION_TABLE_OFFSET % align_of::<SectionHeader>() == 0);
const _: () = assert!(size_of::<DataDirectory>() == 8);
const _: () = assert!(size_of::<SectionHeader>() == 40);
const _: () = assert!(size_of::<ExportDirectory>() == 40);
