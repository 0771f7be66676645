// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Host implementations of the builtin module bridge collaborators
//!
//! This is the platform layer under `builtin_shim`: image regions come from
//! anonymous `mmap`, libraries are opened with `dlopen`, and module segments
//! are discovered through the host's dynamic loader. It also owns the
//! process-wide [`BuiltinRegistry`].

#![cfg(unix)]

pub mod dl;
pub mod locator;
pub mod mmap;

pub use dl::DlLoader;
pub use locator::HostSegmentLocator;
pub use mmap::{AnonPageMapper, host_page_size};

use builtin_shim::{BridgeConfig, BuiltinRegistry, HostServices, LoggingViews};
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

/// Host collaborators for this process
///
/// Synthesized ranges are only logged; runtimes with their own view
/// bookkeeping build [`HostServices`] with a registrar of their own.
pub fn host_services() -> HostServices {
    HostServices {
        mapper: Box::new(AnonPageMapper::new()),
        locator: Box::new(HostSegmentLocator::default()),
        views: Box::new(LoggingViews),
        loader: Box::new(DlLoader),
    }
}

static REGISTRY: LazyLock<Mutex<BuiltinRegistry>> = LazyLock::new(|| {
    Mutex::new(BuiltinRegistry::new(
        host_services(),
        &BridgeConfig::from_env(),
    ))
});

/// The process-wide builtin registry
///
/// Callbacks run while the guard is held and must not lock it again.
pub fn builtin_registry() -> MutexGuard<'static, BuiltinRegistry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}
