//! Owning device objects
//!
//! Work items are bound to the device object they were allocated for. The
//! object model itself belongs to the host; the contract only needs identity.

use std::fmt;
use std::sync::Arc;

/// A device-like object that owns work items
pub trait DeviceObject: Send + Sync + fmt::Debug {
    /// Name used in diagnostics
    fn name(&self) -> &str;
}

/// Shared reference to an owning device object
///
/// Holding the `Arc` keeps the owner alive across the queued-to-executing window.
pub type OwnerRef = Arc<dyn DeviceObject>;

/// Compare owners by identity
pub fn same_owner(a: &OwnerRef, b: &OwnerRef) -> bool {
    Arc::ptr_eq(a, b)
}
