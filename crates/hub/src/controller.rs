//! Hub controller
//!
//! Resolves the forward-progress interface once, when the controller is
//! wired to a bus, and keeps the negotiated descriptor for its lifetime.
//! Request processing is then deferred in the best way the negotiated
//! revision allows:
//!
//! - version 2: the provider's `defer_request_processing`
//! - version 1: allocate, queue, and free from inside the callback
//! - unavailable: processed on the submitting thread
//!
//! Deferral never becomes a dependency: every path that cannot defer
//! processes the request before `submit` returns.

use crate::config::HubSettings;
use common::{DeferralMetrics, DeferralStats};
use interface::{
    DeferOutcome, DeferralOrigin, DescriptorHeader, FORWARD_PROGRESS_INTERFACE_ID,
    InlineReason, OwnerRef, QueueType, Request,
};
use provider::{InterfaceDescriptor, InterfaceRegistry, WorkItem, WorkItemInvocation};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How the controller defers request processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferralMode {
    /// Provider-side facade (version 2)
    Facade,
    /// Allocate and queue composed by the hub (version 1)
    Composed,
    /// No usable capability; always process inline
    Synchronous,
}

impl fmt::Display for DeferralMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferralMode::Facade => write!(f, "facade"),
            DeferralMode::Composed => write!(f, "composed"),
            DeferralMode::Synchronous => write!(f, "synchronous"),
        }
    }
}

/// Frees a composed work item through the callback's own descriptor
/// reference, whether processing returns or panics
struct FreeOnExit {
    descriptor: InterfaceDescriptor,
    item: Option<WorkItem>,
}

impl Drop for FreeOnExit {
    fn drop(&mut self) {
        if let (Some(item), Some(v1)) = (self.item.take(), self.descriptor.v1()) {
            v1.free_work_item(item);
        }
    }
}

pub struct HubController {
    device: OwnerRef,
    descriptor: Option<InterfaceDescriptor>,
    mode: DeferralMode,
    queue: QueueType,
    metrics: Arc<DeferralMetrics>,
}

impl HubController {
    /// Wire `device` to the interface published in `registry`
    ///
    /// An unavailable interface is not an error: the controller falls back to
    /// synchronous processing.
    pub fn connect(registry: &InterfaceRegistry, device: OwnerRef, settings: &HubSettings) -> Self {
        let requested = DescriptorHeader::for_version(settings.requested_version);

        let descriptor = match registry.query(FORWARD_PROGRESS_INTERFACE_ID, requested) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                warn!(hub = device.name(), error = %e, "Forward-progress interface unavailable, processing synchronously");
                None
            }
        };

        let mode = match &descriptor {
            Some(d) if d.v2().is_some() => DeferralMode::Facade,
            Some(d) if d.v1().is_some() => DeferralMode::Composed,
            _ => DeferralMode::Synchronous,
        };

        info!(
            hub = device.name(),
            %requested,
            negotiated = ?descriptor.as_ref().map(InterfaceDescriptor::header),
            %mode,
            "Hub controller connected"
        );

        Self {
            device,
            descriptor,
            mode,
            queue: settings.queue,
            metrics: Arc::new(DeferralMetrics::new()),
        }
    }

    pub fn device(&self) -> &OwnerRef {
        &self.device
    }

    pub fn mode(&self) -> DeferralMode {
        self.mode
    }

    /// Header agreed with the provider, if any
    pub fn negotiated(&self) -> Option<DescriptorHeader> {
        self.descriptor.as_ref().map(InterfaceDescriptor::header)
    }

    /// Hub-side fallbacks; provider-side counters live with the provider
    pub fn stats(&self) -> DeferralStats {
        self.metrics.snapshot()
    }

    /// Hand `request` to `process`, deferred when possible
    ///
    /// `process` runs exactly once.
    pub fn submit<F>(&self, request: Request, process: F) -> DeferOutcome
    where
        F: FnOnce(&OwnerRef, Request) + Send + 'static,
    {
        let descriptor = match (&self.descriptor, self.mode) {
            (Some(descriptor), DeferralMode::Facade | DeferralMode::Composed) => descriptor,
            _ => {
                return self.process_inline(request, process, InlineReason::CapabilityUnavailable);
            }
        };

        if let Some(v2) = descriptor.v2() {
            return v2.defer_request_processing(&self.device, process, request);
        }
        self.submit_composed(descriptor, request, process)
    }

    fn submit_composed<F>(
        &self,
        descriptor: &InterfaceDescriptor,
        request: Request,
        process: F,
    ) -> DeferOutcome
    where
        F: FnOnce(&OwnerRef, Request) + Send + 'static,
    {
        let Some(v1) = descriptor.v1() else {
            return self.process_inline(request, process, InlineReason::CapabilityUnavailable);
        };

        let item = match v1.allocate_work_item(&self.device) {
            Ok(item) => item,
            Err(e) => {
                debug!(request = %request.id(), error = %e, "Processing request inline");
                return self.process_inline(request, process, InlineReason::AllocationFailed);
            }
        };
        let id = item.id();

        // The callback frees through its own reference so the interface
        // outlives the work item even if the hub disconnects first
        let callback_descriptor = descriptor.clone();
        let routine = move |invocation: WorkItemInvocation, (process, request): (F, Request)| {
            let _free = FreeOnExit {
                descriptor: callback_descriptor,
                item: Some(invocation.item),
            };
            process(&invocation.owner, request);
        };

        match v1.queue_work_item(
            &self.device,
            &item,
            routine,
            self.queue,
            (process, request),
            DeferralOrigin::Consumer,
        ) {
            Ok(()) => DeferOutcome::Deferred(id),
            Err(rejected) => {
                debug!(item = %id, error = %rejected.error, "Processing request inline");
                v1.free_work_item(item);
                let (process, request) = rejected.into_context();
                self.process_inline(request, process, InlineReason::QueueRejected)
            }
        }
    }

    fn process_inline<F>(&self, request: Request, process: F, reason: InlineReason) -> DeferOutcome
    where
        F: FnOnce(&OwnerRef, Request),
    {
        self.metrics.record_inline(reason);
        process(&self.device, request);
        DeferOutcome::Inline(reason)
    }

    /// Release the interface reference
    pub fn disconnect(self) {
        info!(hub = self.device.name(), "Hub controller disconnected");
    }
}

impl fmt::Debug for HubController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubController")
            .field("device", &self.device.name())
            .field("mode", &self.mode)
            .field("negotiated", &self.negotiated())
            .finish_non_exhaustive()
    }
}
