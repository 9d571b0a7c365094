//! Error taxonomy for the deferral contract
//!
//! Recoverable conditions ([`InterfaceError`], [`DeferralError`]) are returned
//! to the immediate caller. A [`ContractViolation`] is a caller bug and is
//! raised as a panic rather than travelling through a result channel.

use crate::descriptor::InterfaceId;
use crate::types::{QueueType, WorkItemId, WorkItemState};
use crate::version::InterfaceVersion;
use thiserror::Error;

/// Discovery and negotiation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterfaceError {
    /// No provider published the requested interface
    #[error("Interface {0} not found")]
    NotFound(InterfaceId),

    /// An interface with this identifier is already published
    #[error("Interface {0} already published")]
    AlreadyPublished(InterfaceId),

    /// The provider cannot satisfy the requested size/version
    #[error(
        "Capability unavailable: requested {requested} ({requested_size} bytes), provider offers {offered} ({offered_size} bytes)"
    )]
    CapabilityUnavailable {
        requested: InterfaceVersion,
        requested_size: u16,
        offered: InterfaceVersion,
        offered_size: u16,
    },

    /// Descriptor buffer shorter than the fixed header
    #[error("Descriptor too short: needed {needed} bytes, got {available}")]
    DescriptorTooShort { needed: usize, available: usize },

    /// Interface identifier could not be parsed
    #[error("Malformed interface identifier: {0}")]
    MalformedId(String),

    /// The handle was invalidated by its final release
    #[error("Interface {0} has been invalidated")]
    Invalidated(InterfaceId),
}

/// Why the execution substrate refused a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The lane is at capacity
    Full,
    /// The lane no longer accepts work
    ShutDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}

/// Recoverable deferral failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeferralError {
    /// No work item is available; fall back to synchronous processing
    #[error("Work item allocation failed: {outstanding} of {limit} outstanding")]
    AllocationFailure { outstanding: usize, limit: usize },

    /// The lane could not accept the work item; it stays allocated
    #[error("Queue {queue_type} rejected work item {item}: {reason}")]
    QueueRejected {
        queue_type: QueueType,
        item: WorkItemId,
        reason: RejectReason,
    },
}

/// Broken contract invariants
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("double free of work item {0}")]
    DoubleFree(WorkItemId),

    #[error("work item {item} freed while {state}")]
    FreeWhileBusy {
        item: WorkItemId,
        state: WorkItemState,
    },

    #[error("work item {item} queued while {state}")]
    InvalidQueue {
        item: WorkItemId,
        state: WorkItemState,
    },

    #[error("work item {0} does not belong to this pool")]
    ForeignWorkItem(WorkItemId),

    #[error("work item {0} queued for an owner it was not allocated to")]
    OwnerMismatch(WorkItemId),

    #[error("interface {0} used after its final release")]
    UseAfterRelease(InterfaceId),

    #[error("interface {0} released more times than acquired")]
    UnbalancedRelease(InterfaceId),

    #[error("descriptor entry `{0}` is not populated")]
    UnpopulatedEntry(&'static str),
}

impl ContractViolation {
    /// Log and panic; the caller broke the contract
    #[track_caller]
    pub fn raise(self) -> ! {
        tracing::error!(violation = %self, "Contract violation");
        panic!("contract violation: {}", self)
    }
}

/// Type alias for interface results
#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FORWARD_PROGRESS_INTERFACE_ID;

    #[test]
    fn test_error_display() {
        let err = InterfaceError::CapabilityUnavailable {
            requested: InterfaceVersion::V2,
            requested_size: 64,
            offered: InterfaceVersion::V1,
            offered_size: 56,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Capability unavailable"));
        assert!(msg.contains("v2"));
        assert!(msg.contains("56 bytes"));
    }

    #[test]
    fn test_queue_rejected_display() {
        let err = DeferralError::QueueRejected {
            queue_type: QueueType::Critical,
            item: WorkItemId(7),
            reason: RejectReason::Full,
        };
        assert_eq!(
            err.to_string(),
            "Queue critical rejected work item wi#7: full"
        );
    }

    #[test]
    #[should_panic(expected = "contract violation: double free of work item wi#3")]
    fn test_raise_panics() {
        ContractViolation::DoubleFree(WorkItemId(3)).raise();
    }

    #[test]
    fn test_violation_names_interface() {
        let v = ContractViolation::UseAfterRelease(FORWARD_PROGRESS_INTERFACE_ID);
        assert!(v.to_string().contains("5c8f1d3a"));
    }
}
