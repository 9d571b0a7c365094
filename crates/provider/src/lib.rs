//! Bus provider side of the forward-progress deferral interface
//!
//! The provider hands out work items from a bounded [`WorkItemPool`], runs
//! them on per-class worker lanes through the [`DeferralQueue`], and composes
//! the two into [`ForwardProgressFacade::defer_request_processing`]. All of it
//! is published behind a reference-counted [`CapabilityHandle`] that consumers
//! discover through the [`InterfaceRegistry`].
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_owner, create_mock_request};
//! use interface::{CURRENT_VERSION, DescriptorHeader, FORWARD_PROGRESS_INTERFACE_ID, RequestStatus};
//! use provider::{BusProvider, InterfaceRegistry, ProviderConfig};
//!
//! let registry = InterfaceRegistry::new();
//! let provider = BusProvider::new(&ProviderConfig::default()).unwrap();
//! provider.publish(&registry).unwrap();
//!
//! let descriptor = registry
//!     .query(FORWARD_PROGRESS_INTERFACE_ID, DescriptorHeader::for_version(CURRENT_VERSION))
//!     .unwrap();
//! let v2 = descriptor.v2().unwrap();
//!
//! let owner = create_mock_owner("hub0");
//! let (request, waiter) = create_mock_request(1);
//! v2.defer_request_processing(&owner, |_, request| { request.complete(RequestStatus::Success); }, request);
//! assert_eq!(waiter.blocking_wait().status, RequestStatus::Success);
//!
//! drop(descriptor);
//! provider.shutdown();
//! ```

pub mod bus;
pub mod capability;
pub mod config;
pub mod facade;
pub mod queue;
pub mod registry;
pub mod work_item;

pub use bus::BusProvider;
pub use capability::{
    CapabilityHandle, ForwardProgressInterface, InterfaceDescriptor, InterfaceReference,
    RequestRoutine, V1Interface, V2Interface,
};
pub use config::{
    FacadeSettings, LaneSettings, PoolSettings, ProviderConfig, ProviderSettings, QueueSettings,
};
pub use facade::ForwardProgressFacade;
pub use queue::{DeferralQueue, Rejected, WorkContext, WorkItemInvocation, WorkItemRoutine};
pub use registry::InterfaceRegistry;
pub use work_item::{WorkItem, WorkItemPool};
