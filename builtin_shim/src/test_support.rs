// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fake address space for unit tests
//!
//! One zeroed arena stands in for a process: image regions are handed out
//! from its lower half and a fake module occupies the middle, so every
//! offset stays small.

use crate::host::PageMapper;
use crate::segments::{ModuleSegments, SegmentLocator, SegmentRange};
use crate::{BridgeError, Result};
use std::alloc::{Layout, alloc_zeroed};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

pub(crate) const PAGE: usize = 0x1000;
const ARENA_SIZE: usize = 0x40_0000;
const ARENA_ALIGN: usize = 0x1_0000;
const MODULE_OFFSET: usize = 0x20_0000;
const CODE_SIZE: usize = 0x8000;
const DATA_OFFSET: usize = 0x21_0000;
const DATA_SIZE: usize = 0x2000;

#[derive(Debug, Default)]
struct State {
    mapped: Vec<(usize, usize)>,
}

#[derive(Debug)]
struct Inner {
    start: usize,
    state: Mutex<State>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeAddressSpace(Arc<Inner>);

impl FakeAddressSpace {
    pub(crate) fn new() -> Self {
        let layout = Layout::from_size_align(ARENA_SIZE, ARENA_ALIGN).unwrap();
        // SAFETY: the layout has a nonzero size. The arena is never freed.
        let start = unsafe { alloc_zeroed(layout) } as usize;
        assert_ne!(start, 0, "arena allocation failed");
        Self(Arc::new(Inner {
            start,
            state: Mutex::default(),
        }))
    }

    pub(crate) fn code(&self) -> SegmentRange {
        SegmentRange::new(self.0.start + MODULE_OFFSET, CODE_SIZE)
    }

    pub(crate) fn data(&self) -> SegmentRange {
        SegmentRange::new(self.0.start + DATA_OFFSET, DATA_SIZE)
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
        NonNull::new(chosen as *mut u8).ok_or_else(|| BridgeError::MappingFailed("null".into()))
    }

    fn seal_pages(&self, _start: NonNull<u8>, _len: usize) -> Result<()> {
        Ok(())
    }

    fn unmap_pages(&self, start: NonNull<u8>, len: usize) {
        let addr = start.as_ptr() as usize;
        self.0
            .state
            .lock()
            .unwrap()
            .mapped
            .retain(|&region| region != (addr, len));
    }
}

impl SegmentLocator for FakeAddressSpace {
    fn locate(&self, _addr: usize) -> Result<ModuleSegments> {
        Ok(ModuleSegments::new(self.code(), self.data()))
    }
}
