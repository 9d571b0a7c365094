//! Deferred request processing
//!
//! Composes allocate → queue → free for a single in-flight request. Deferral
//! is an optimization, never a dependency: whenever a work item cannot be
//! allocated or queued, the request is processed on the caller's context
//! before this returns.
//!
//! Ownership rule: the facade owns the work item it allocates. It is freed by
//! a guard inside the deferred routine once the callback returns, including
//! when the callback panics, and by the facade itself when queuing fails.

use crate::queue::{DeferralQueue, WorkItemInvocation};
use crate::work_item::{WorkItem, WorkItemPool};
use common::DeferralMetrics;
use interface::{DeferOutcome, DeferralOrigin, InlineReason, OwnerRef, QueueType, Request};
use std::sync::Arc;
use tracing::{debug, error};

/// Frees the work item when the deferred routine exits
struct FreeOnExit {
    pool: Arc<WorkItemPool>,
    item: Option<WorkItem>,
}

impl Drop for FreeOnExit {
    fn drop(&mut self) {
        if let Some(item) = self.item.take()
            && let Err(violation) = self.pool.try_free(item)
        {
            // Raising here could abort while unwinding from a callback panic
            error!(%violation, "Deferred request callback broke its work item");
        }
    }
}

pub struct ForwardProgressFacade {
    pool: Arc<WorkItemPool>,
    queue: Arc<DeferralQueue>,
    default_queue: QueueType,
    metrics: Arc<DeferralMetrics>,
}

impl ForwardProgressFacade {
    pub fn new(
        pool: Arc<WorkItemPool>,
        queue: Arc<DeferralQueue>,
        default_queue: QueueType,
        metrics: Arc<DeferralMetrics>,
    ) -> Self {
        Self {
            pool,
            queue,
            default_queue,
            metrics,
        }
    }

    pub fn default_queue(&self) -> QueueType {
        self.default_queue
    }

    /// Defer processing of `request` on behalf of the consuming layer
    pub fn defer_request_processing<F>(
        &self,
        owner: &OwnerRef,
        callback: F,
        request: Request,
    ) -> DeferOutcome
    where
        F: FnOnce(&OwnerRef, Request) + Send + 'static,
    {
        self.defer(owner, callback, request, DeferralOrigin::Consumer)
    }

    /// Defer processing of `request`, tagging the deferral with `origin`
    ///
    /// `callback` runs exactly once: on a lane worker when the outcome is
    /// [`DeferOutcome::Deferred`], or on this thread before returning when it
    /// is [`DeferOutcome::Inline`].
    pub fn defer<F>(
        &self,
        owner: &OwnerRef,
        callback: F,
        request: Request,
        origin: DeferralOrigin,
    ) -> DeferOutcome
    where
        F: FnOnce(&OwnerRef, Request) + Send + 'static,
    {
        let item = match self.pool.allocate(owner) {
            Ok(item) => item,
            Err(error) => {
                debug!(request = %request.id(), %error, "Processing request inline");
                return self.run_inline(owner, callback, request, InlineReason::AllocationFailed);
            }
        };
        let id = item.id();

        let pool = Arc::clone(&self.pool);
        let routine = move |invocation: WorkItemInvocation, (callback, request): (F, Request)| {
            let _free = FreeOnExit {
                pool,
                item: Some(invocation.item.clone()),
            };
            callback(&invocation.owner, request);
        };

        match self.queue.queue_with(
            owner,
            &item,
            routine,
            self.default_queue,
            (callback, request),
            origin,
        ) {
            Ok(()) => DeferOutcome::Deferred(id),
            Err(rejected) => {
                debug!(item = %id, error = %rejected.error, "Processing request inline");
                self.pool.free(item);
                let (callback, request) = rejected.into_context();
                self.run_inline(owner, callback, request, InlineReason::QueueRejected)
            }
        }
    }

    fn run_inline<F>(
        &self,
        owner: &OwnerRef,
        callback: F,
        request: Request,
        reason: InlineReason,
    ) -> DeferOutcome
    where
        F: FnOnce(&OwnerRef, Request),
    {
        self.metrics.record_inline(reason);
        callback(owner, request);
        DeferOutcome::Inline(reason)
    }
}
