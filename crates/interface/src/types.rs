//! Deferral type definitions
//!
//! Execution classes, the diagnostic origin marker, work-item identity and
//! lifecycle states, and the outcome of a deferral attempt.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution class a work item is dispatched on
///
/// Each class maps to an independent lane of worker threads, so a flood of
/// delayed work never starves critical work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Time-sensitive work that must not wait behind background processing
    Critical,
    /// Ordinary deferred processing
    #[default]
    Delayed,
    /// Reserved for the provider's own time-critical work
    HyperCritical,
}

impl QueueType {
    /// All execution classes in lane order
    pub const ALL: [QueueType; 3] = [Self::Critical, Self::Delayed, Self::HyperCritical];

    /// Stable lane index
    pub const fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::Delayed => 1,
            Self::HyperCritical => 2,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Delayed => "delayed",
            Self::HyperCritical => "hyper_critical",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who triggered a deferral
///
/// Carried through to the callback and recorded in metrics. Scheduling never
/// looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferralOrigin {
    /// The provider deferred its own work
    Provider,
    /// The consuming layer asked for the deferral
    Consumer,
}

impl fmt::Display for DeferralOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider => write!(f, "provider"),
            Self::Consumer => write!(f, "consumer"),
        }
    }
}

/// Process-unique work item identifier (diagnostics only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId(pub u64);

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wi#{}", self.0)
    }
}

/// Work item lifecycle
///
/// ```text
/// Allocated --queue--> Queued --dispatch--> Executing --return--> Completed --free--> Freed
///     |                                                                          ^
///     +------------------------------------free-----------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkItemState {
    Allocated,
    Queued,
    Executing,
    Completed,
    /// Terminal
    Freed,
}

impl WorkItemState {
    /// Whether `free` is legal from this state (outside the item's own callback)
    pub const fn is_freeable(self) -> bool {
        matches!(self, Self::Allocated | Self::Completed)
    }
}

impl fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allocated => "allocated",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Freed => "freed",
        };
        f.write_str(s)
    }
}

/// Why a request was processed on the caller's context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InlineReason {
    /// The work item pool was exhausted
    AllocationFailed,
    /// The execution lane refused the work item
    QueueRejected,
    /// The provider does not offer a usable revision of the interface
    CapabilityUnavailable,
}

/// Result of a deferral attempt; the request is processed either way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferOutcome {
    /// Queued on a worker lane under this work item
    Deferred(WorkItemId),
    /// Already processed synchronously before returning
    Inline(InlineReason),
}

impl DeferOutcome {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}
