//! Interface version management
//!
//! The descriptor grows by appending entries. Every revision keeps the layout
//! of the revisions before it, so a descriptor is usable up to the highest
//! revision whose entries fit inside its populated size.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the base interface header: size/version (padded to 8 bytes),
/// provider context, acquire and release entries
pub const BASE_DESCRIPTOR_SIZE: u16 = 32;

/// Version 1 adds allocate, free and queue entries
pub const V1_DESCRIPTOR_SIZE: u16 = BASE_DESCRIPTOR_SIZE + 3 * ENTRY_SIZE;

/// Version 2 adds the deferred request processing entry
pub const V2_DESCRIPTOR_SIZE: u16 = V1_DESCRIPTOR_SIZE + ENTRY_SIZE;

/// One pointer-sized slot per entry
const ENTRY_SIZE: u16 = 8;

/// Interface revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceVersion(pub u16);

/// Revision this workspace implements
pub const CURRENT_VERSION: InterfaceVersion = InterfaceVersion::V2;

impl InterfaceVersion {
    /// Work-item allocation, free and queue entries
    pub const V1: Self = Self(1);
    /// Adds `defer_request_processing`
    pub const V2: Self = Self(2);

    /// Known revisions, newest first
    pub const KNOWN: [Self; 2] = [Self::V2, Self::V1];

    /// Number of descriptor bytes this revision populates
    ///
    /// Unknown newer revisions are sized as the newest known revision, since
    /// that is all a consumer built today can read.
    pub const fn descriptor_size(self) -> u16 {
        match self.0 {
            0 => BASE_DESCRIPTOR_SIZE,
            1 => V1_DESCRIPTOR_SIZE,
            _ => V2_DESCRIPTOR_SIZE,
        }
    }
}

impl fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
