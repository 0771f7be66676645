// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Host fakes shared by the integration tests

#![allow(dead_code)]

use builtin_shim::{
    BridgeError, HostLoader, ModuleSegments, NativeHandle, PageMapper, Protection, Result,
    SegmentLocator, SegmentRange, ViewRegistrar,
};
use std::alloc::{Layout, alloc_zeroed};
use std::ffi::CStr;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

pub const PAGE: usize = 0x1000;

const ARENA_SIZE: usize = 0x40_0000;
const ARENA_ALIGN: usize = 0x1_0000;
/// Image regions are handed out below this offset
pub const MODULE_OFFSET: usize = 0x20_0000;
pub const CODE_SIZE: usize = 0x8000;
pub const DATA_OFFSET: usize = 0x21_0000;
pub const DATA_SIZE: usize = 0x2000;
const RODATA_OFFSET: usize = 0x30_0000;

#[derive(Debug, Default)]
struct State {
    mapped: Vec<(usize, usize)>,
    sealed: Vec<(usize, usize)>,
    unmapped: Vec<(usize, usize)>,
    rodata: usize,
}

#[derive(Debug)]
struct Inner {
    start: usize,
    state: Mutex<State>,
}

/// One zeroed arena standing in for a process address space
///
/// Image regions come from the lower half, a fake module sits at
/// [`MODULE_OFFSET`] and everything a template points at is copied above
/// it, so all of an image's offsets stay small.
#[derive(Debug, Clone)]
pub struct FakeAddressSpace(Arc<Inner>);

impl Default for FakeAddressSpace {
    fn default() -> Self {
        let layout = Layout::from_size_align(ARENA_SIZE, ARENA_ALIGN).unwrap();
        // SAFETY: the layout has a nonzero size. The arena is never freed.
        let start = unsafe { alloc_zeroed(layout) } as usize;
        assert_ne!(start, 0, "arena allocation failed");
        Self(Arc::new(Inner {
            start,
            state: Mutex::default(),
        }))
    }
}

impl FakeAddressSpace {
    pub fn start(&self) -> usize {
        self.0.start
    }

    /// The fake module's code range
    pub fn code(&self) -> SegmentRange {
        SegmentRange::new(self.0.start + MODULE_OFFSET, CODE_SIZE)
    }

    /// The fake module's data range
    pub fn data(&self) -> SegmentRange {
        SegmentRange::new(self.0.start + DATA_OFFSET, DATA_SIZE)
    }

    /// Address `offset` bytes into the fake module's code
    pub fn code_address(&self, offset: usize) -> usize {
        self.code().start + offset
    }

    /// Locator reporting the fake module for every address
    pub fn locator(&self) -> FakeLocator {
        FakeLocator(Some(ModuleSegments::new(self.code(), self.data())))
    }

    /// Locator reporting the fake module without a data range
    pub fn code_only_locator(&self) -> FakeLocator {
        FakeLocator(Some(ModuleSegments::new(self.code(), SegmentRange::EMPTY)))
    }

    fn alloc(&self, size: usize, align: usize) -> *mut u8 {
        let mut state = self.0.state.lock().unwrap();
        let at = (RODATA_OFFSET + state.rodata).next_multiple_of(align);
        assert!(at + size <= ARENA_SIZE, "arena rodata exhausted");
        state.rodata = at + size - RODATA_OFFSET;
        (self.0.start + at) as *mut u8
    }

    /// Move `value` above the module for the rest of the process
    pub fn leak<T>(&self, value: T) -> &'static T {
        let slot = self.alloc(size_of::<T>(), align_of::<T>()).cast::<T>();
        // SAFETY: `slot` is aligned, inside the arena and handed out once.
        unsafe {
            slot.write(value);
            &*slot
        }
    }

    /// Copy `items` above the module
    pub fn copy<T: Copy>(&self, items: &[T]) -> &'static [T] {
        let at = self.alloc(size_of_val(items), align_of::<T>()).cast::<T>();
        // SAFETY: `at` is aligned, inside the arena and handed out once.
        unsafe {
            core::ptr::copy_nonoverlapping(items.as_ptr(), at, items.len());
            core::slice::from_raw_parts(at, items.len())
        }
    }

    /// NUL-terminated copy of `text` above the module
    pub fn c_str(&self, text: &str) -> &'static CStr {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        CStr::from_bytes_with_nul(self.copy(&bytes)).unwrap()
    }

    pub fn mapped(&self) -> Vec<(usize, usize)> {
        self.0.state.lock().unwrap().mapped.clone()
    }

    pub fn sealed(&self) -> Vec<(usize, usize)> {
        self.0.state.lock().unwrap().sealed.clone()
    }

    pub fn unmapped(&self) -> Vec<(usize, usize)> {
        self.0.state.lock().unwrap().unmapped.clone()
    }

    fn free(state: &State, start: usize, len: usize) -> bool {
        state
            .mapped
            .iter()
            .all(|&(at, size)| start + len <= at || at + size <= start)
    }
}

impl PageMapper for FakeAddressSpace {
    fn page_size(&self) -> usize {
        PAGE
    }

    fn map_pages(&self, at: Option<usize>, len: usize) -> Result<NonNull<u8>> {
        let mut state = self.0.state.lock().unwrap();
        let lower = self.0.start..self.0.start + MODULE_OFFSET;
        let chosen = match at {
            Some(addr) => (addr % PAGE == 0
                && lower.contains(&addr)
                && addr + len <= lower.end
                && Self::free(&state, addr, len))
            .then_some(addr)
            .ok_or(BridgeError::FixedMappingRefused(addr))?,
            None => lower
                .clone()
                .step_by(PAGE)
                .find(|&addr| addr + len <= lower.end && Self::free(&state, addr, len))
                .ok_or_else(|| BridgeError::MappingFailed("arena full".to_string()))?,
        };
        state.mapped.push((chosen, len));
        // SAFETY: the range lies inside the arena and no image uses it.
        unsafe { core::ptr::write_bytes(chosen as *mut u8, 0, len) };
        Ok(NonNull::new(chosen as *mut u8).unwrap())
    }

    fn seal_pages(&self, start: NonNull<u8>, len: usize) -> Result<()> {
        let addr = start.as_ptr() as usize;
        self.0.state.lock().unwrap().sealed.push((addr, len));
        Ok(())
    }

    fn unmap_pages(&self, start: NonNull<u8>, len: usize) {
        let addr = start.as_ptr() as usize;
        let mut state = self.0.state.lock().unwrap();
        state.mapped.retain(|&region| region != (addr, len));
        state.unmapped.push((addr, len));
    }
}

/// Locator answering every address with the same ranges, or failing
pub struct FakeLocator(pub Option<ModuleSegments>);

impl FakeLocator {
    pub fn failing() -> Self {
        Self(None)
    }
}

impl SegmentLocator for FakeLocator {
    fn locate(&self, addr: usize) -> Result<ModuleSegments> {
        self.0.ok_or(BridgeError::SegmentsUnavailable {
            addr,
            reason: "fake locator".to_string(),
        })
    }
}

/// Registrar remembering every range it receives
#[derive(Default, Clone)]
pub struct RecordingViews(pub Arc<Mutex<Vec<(usize, usize, Protection)>>>);

impl RecordingViews {
    pub fn ranges(&self) -> Vec<(usize, usize, Protection)> {
        self.0.lock().unwrap().clone()
    }
}

impl ViewRegistrar for RecordingViews {
    fn register_range(&self, start: usize, size: usize, protection: Protection) {
        self.0.lock().unwrap().push((start, size, protection));
    }
}

/// Loader that accepts paths under one directory
#[derive(Clone)]
pub struct DirectoryLoader {
    pub dir: &'static str,
    pub attempts: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<Mutex<Vec<NativeHandle>>>,
}

impl DirectoryLoader {
    pub fn new(dir: &'static str) -> Self {
        Self {
            dir,
            attempts: Arc::default(),
            closed: Arc::default(),
        }
    }
}

impl HostLoader for DirectoryLoader {
    fn open(&self, path: &Path) -> core::result::Result<NativeHandle, String> {
        let mut attempts = self.attempts.lock().unwrap();
        attempts.push(path.display().to_string());
        if path.starts_with(self.dir) {
            Ok(NativeHandle::new(0x5000 + attempts.len()))
        } else {
            Err(format!("{}: cannot open shared object file", path.display()))
        }
    }

    fn close(&self, handle: NativeHandle) {
        self.closed.lock().unwrap().push(handle);
    }
}
