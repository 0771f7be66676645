// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Presents natively compiled shared libraries ("builtin modules") to a
//! Windows-compatibility runtime as if they were loaded PE images.
//!
//! The crate is host-independent. It provides:
//! - The in-memory image layout and the header template a builtin module
//!   describes itself with
//! - The image synthesizer, which places an image near its module and
//!   stores every address as a 32-bit offset from the image base
//! - Segment classification for ELF program headers and Mach-O load commands
//! - Windows-name to native-library-name translation and the DLL search path
//! - The builtin module registry that reconciles early self-registration with
//!   a later consumer callback
//!
//! Host primitives (page mapping, the dynamic loader, segment discovery) are
//! reached through the traits in [`host`] and [`segments`]; the
//! `builtin_platform_host` crate implements them with `libc`.

pub mod config;
pub mod error;
pub mod host;
pub mod image;
pub mod registry;
pub mod resolver;
pub mod segments;

#[cfg(test)]
mod test_support;

pub use config::{BridgeConfig, NativeNaming};
pub use error::{BridgeError, Result};
pub use host::{HostLoader, LoggingViews, NativeHandle, PageMapper, Protection, ViewRegistrar};
pub use image::{ModuleTemplate, Synthesizer, SyntheticImage};
pub use registry::{BuiltinRegistry, HostServices, ImageCallback, LoadedModule};
pub use resolver::{DllSearchPath, NameResolver};
pub use segments::{ModuleSegments, SegmentLocator, SegmentRange};
