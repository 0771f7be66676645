// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! ELF hosts: `dladdr` finds the owning module, `dl_iterate_phdr` its headers

use builtin_shim::segments::elf::{LoadedObject, ProgramHeader, locate_in};
use builtin_shim::{ModuleSegments, Result, SegmentLocator};
use core::ffi::{c_int, c_void};

use super::module_base;
use crate::mmap::host_page_size;

/// Locator backed by the program headers of loaded objects
#[derive(Debug, Clone, Copy)]
pub struct ElfLocator {
    page_size: usize,
}

impl ElfLocator {
    pub fn new() -> Self {
        Self {
            page_size: host_page_size(),
        }
    }
}

impl Default for ElfLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentLocator for ElfLocator {
    fn locate(&self, addr: usize) -> Result<ModuleSegments> {
        let base = module_base(addr)?;
        locate_in(&loaded_objects(), addr, base, self.page_size)
    }
}

unsafe extern "C" fn collect_object(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> c_int {
    // SAFETY: `data` is the vector passed to dl_iterate_phdr below and `info`
    // is valid for the duration of this call.
    let (objects, info) = unsafe { (&mut *data.cast::<Vec<LoadedObject>>(), &*info) };
    let headers = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        // SAFETY: the loader reports `dlpi_phnum` headers at `dlpi_phdr`.
        unsafe { core::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) }
    };
    objects.push(LoadedObject {
        load_base: info.dlpi_addr as usize,
        headers: headers
            .iter()
            .map(|phdr| ProgramHeader {
                kind: phdr.p_type,
                flags: phdr.p_flags,
                vaddr: phdr.p_vaddr as usize,
                mem_size: phdr.p_memsz as usize,
            })
            .collect(),
    });
    0
}

/// Snapshot of every object the dynamic loader currently has mapped
pub fn loaded_objects() -> Vec<LoadedObject> {
    let mut objects: Vec<LoadedObject> = Vec::new();
    // SAFETY: the callback only touches `objects`, which outlives the call.
    unsafe {
        libc::dl_iterate_phdr(Some(collect_object), (&raw mut objects).cast::<c_void>());
    }
    objects
}
