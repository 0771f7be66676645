// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Error type shared by every component of the bridge

use thiserror::Error;

/// Bridge errors
///
/// Every failure here means "this module could not be bridged". None of them
/// is retried by the bridge itself.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Fixed mapping at {0:#x} refused")]
    FixedMappingRefused(usize),

    #[error("Page mapping failed: {0}")]
    MappingFailed(String),

    #[error("No segments found for address {addr:#x}: {reason}")]
    SegmentsUnavailable { addr: usize, reason: String },

    #[error("Malformed load commands: {0}")]
    MalformedLoadCommands(String),

    #[error("Builtin registry is full ({capacity} pending modules)")]
    RegistryFull { capacity: usize },

    #[error("Buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("Library {name} not found: {reason}")]
    LibraryNotFound { name: String, reason: String },

    #[error("Invalid export tables: {0}")]
    InvalidExports(String),

    #[error("Invalid resource tree: {0}")]
    InvalidResources(String),

    #[error("Address {address:#x} has no 32-bit offset from image base {base:#x}")]
    OffsetOutOfRange { address: usize, base: usize },

    #[error("Image of {0:#x} bytes does not fit 32-bit offsets")]
    ImageTooLarge(usize),
}

pub type Result<T> = core::result::Result<T, BridgeError>;
