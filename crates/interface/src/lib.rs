//! Contract vocabulary for the forward-progress deferral interface
//!
//! This crate defines the types shared between the bus provider that publishes
//! the interface and the hub controller that consumes it: the interface
//! identifier, versioning and descriptor header layout, execution classes,
//! work-item states, the in-flight request type and the error taxonomy.
//!
//! # Example
//!
//! ```
//! use interface::{CURRENT_VERSION, DescriptorHeader, InterfaceVersion};
//!
//! // A consumer built against the current revision asks for its full descriptor
//! let requested = DescriptorHeader::for_version(CURRENT_VERSION);
//!
//! // A provider that only knows version 1 answers with a shorter descriptor
//! let offered = DescriptorHeader::for_version(InterfaceVersion::V1);
//!
//! let negotiated = requested.negotiate(&offered).unwrap();
//! assert_eq!(negotiated.effective_version(), Some(InterfaceVersion::V1));
//! ```
//!
//! # Header encoding
//!
//! ```
//! use interface::{CURRENT_VERSION, DescriptorHeader};
//!
//! let header = DescriptorHeader::for_version(CURRENT_VERSION);
//! let bytes = header.encode();
//! assert_eq!(DescriptorHeader::decode(&bytes).unwrap(), header);
//! ```

pub mod descriptor;
pub mod error;
pub mod owner;
pub mod request;
pub mod types;
pub mod version;

pub use descriptor::{DescriptorHeader, FORWARD_PROGRESS_INTERFACE_ID, HEADER_LEN, InterfaceId};
pub use error::{ContractViolation, DeferralError, InterfaceError, RejectReason};
pub use owner::{DeviceObject, OwnerRef, same_owner};
pub use request::{Completion, CompletionWaiter, Request, RequestId, RequestStatus};
pub use types::{DeferOutcome, DeferralOrigin, InlineReason, QueueType, WorkItemId, WorkItemState};
pub use version::{
    BASE_DESCRIPTOR_SIZE, CURRENT_VERSION, InterfaceVersion, V1_DESCRIPTOR_SIZE,
    V2_DESCRIPTOR_SIZE,
};
