//! Bus provider
//!
//! Owns the work-item pool, the deferral lanes and the facade, implements
//! [`ForwardProgressInterface`] over them and publishes the result as a
//! [`CapabilityHandle`].

use crate::capability::{CapabilityHandle, ForwardProgressInterface, RequestRoutine};
use crate::config::ProviderConfig;
use crate::facade::ForwardProgressFacade;
use crate::queue::{DeferralQueue, Rejected, WorkContext, WorkItemRoutine};
use crate::registry::InterfaceRegistry;
use crate::work_item::{WorkItem, WorkItemPool};
use common::{DeferralMetrics, DeferralStats};
use interface::{
    DeferOutcome, DeferralError, DeferralOrigin, DescriptorHeader,
    FORWARD_PROGRESS_INTERFACE_ID, InterfaceError, OwnerRef, QueueType, Request,
};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info};

pub struct BusProvider {
    name: String,
    offered: DescriptorHeader,
    pool: Arc<WorkItemPool>,
    queue: Arc<DeferralQueue>,
    facade: ForwardProgressFacade,
    metrics: Arc<DeferralMetrics>,
    /// Set while the provider holds its own reference; weak since the handle owns the provider
    published: Mutex<Option<Weak<CapabilityHandle>>>,
}

impl BusProvider {
    /// Build the pool and start the deferral lanes
    pub fn new(config: &ProviderConfig) -> common::Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| common::Error::Config(format!("{:#}", e)))?;

        let metrics = Arc::new(DeferralMetrics::new());
        let pool = Arc::new(WorkItemPool::new(
            config.pool.max_outstanding,
            Arc::clone(&metrics),
        ));
        let queue = Arc::new(DeferralQueue::new(&config.queues, Arc::clone(&metrics))?);
        let facade = ForwardProgressFacade::new(
            Arc::clone(&pool),
            Arc::clone(&queue),
            config.facade.default_queue,
            Arc::clone(&metrics),
        );
        let offered = DescriptorHeader::for_version(config.provider.version);

        info!(
            provider = %config.provider.name,
            %offered,
            pool_limit = config.pool.max_outstanding,
            default_queue = %config.facade.default_queue,
            "Bus provider started"
        );

        Ok(Arc::new(Self {
            name: config.provider.name.clone(),
            offered,
            pool,
            queue,
            facade,
            metrics,
            published: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish the forward-progress interface
    ///
    /// The handle's teardown closes the deferral lanes once the provider has
    /// retired and every consumer has released its reference. It does not wait
    /// for queued callbacks; [`shutdown`](Self::shutdown) does.
    pub fn publish(
        self: &Arc<Self>,
        registry: &InterfaceRegistry,
    ) -> Result<Arc<CapabilityHandle>, InterfaceError> {
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if published.is_some() {
            return Err(InterfaceError::AlreadyPublished(FORWARD_PROGRESS_INTERFACE_ID));
        }

        let ops: Arc<dyn ForwardProgressInterface> = Arc::clone(self) as _;
        let handle = CapabilityHandle::new(FORWARD_PROGRESS_INTERFACE_ID, ops);
        if let Err(e) = registry.publish(Arc::clone(&handle)) {
            handle.retire();
            return Err(e);
        }

        let queue = Arc::clone(&self.queue);
        handle.on_invalidate(move || queue.close());
        *published = Some(Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Drop the provider's own reference
    pub fn retire(&self) {
        let handle = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        match handle.upgrade() {
            Some(handle) => {
                info!(
                    provider = %self.name,
                    references = handle.reference_count() - 1,
                    "Retiring interface"
                );
                handle.retire();
            }
            None => debug!(provider = %self.name, "Interface already dropped"),
        }
    }

    /// Withdraw from `registry` and drop the provider's own reference
    pub fn withdraw(&self, registry: &InterfaceRegistry) {
        // Keep the registry's handle alive until the provider has retired
        let withdrawn = registry.withdraw(FORWARD_PROGRESS_INTERFACE_ID);
        self.retire();
        drop(withdrawn);
    }

    /// Defer request processing on the provider's own behalf
    pub fn defer_internal<F>(&self, owner: &OwnerRef, callback: F, request: Request) -> DeferOutcome
    where
        F: FnOnce(&OwnerRef, Request) + Send + 'static,
    {
        self.facade
            .defer(owner, callback, request, DeferralOrigin::Provider)
    }

    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    pub fn queue_depth(&self, queue_type: QueueType) -> usize {
        self.queue.depth(queue_type)
    }

    pub fn stats(&self) -> DeferralStats {
        self.metrics.snapshot()
    }

    /// Run what is queued, then stop the lanes
    pub fn shutdown(&self) {
        self.queue.shutdown();
        info!(provider = %self.name, outstanding = self.pool.outstanding(), "Bus provider stopped");
    }
}

impl ForwardProgressInterface for BusProvider {
    fn offered(&self) -> DescriptorHeader {
        self.offered
    }

    fn allocate_work_item(&self, owner: &OwnerRef) -> Result<WorkItem, DeferralError> {
        self.pool.allocate(owner)
    }

    fn free_work_item(&self, item: WorkItem) {
        self.pool.free(item);
    }

    fn queue_work_item(
        &self,
        owner: &OwnerRef,
        item: &WorkItem,
        routine: WorkItemRoutine,
        queue_type: QueueType,
        context: WorkContext,
        origin: DeferralOrigin,
    ) -> Result<(), Rejected<WorkContext>> {
        self.queue
            .queue(owner, item, routine, queue_type, context, origin)
    }

    fn defer_request_processing(
        &self,
        owner: &OwnerRef,
        routine: RequestRoutine,
        request: Request,
    ) -> DeferOutcome {
        self.facade.defer_request_processing(owner, routine, request)
    }
}

impl std::fmt::Debug for BusProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusProvider")
            .field("name", &self.name)
            .field("offered", &self.offered)
            .field("outstanding", &self.pool.outstanding())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_owner, create_mock_request};
    use interface::{CURRENT_VERSION, InterfaceVersion, RequestStatus};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = ProviderConfig::default();
        config.pool.max_outstanding = 0;
        let err = BusProvider::new(&config).unwrap_err();
        assert!(matches!(err, common::Error::Config(_)));
    }

    #[test]
    fn test_offered_version_follows_config() {
        let mut config = ProviderConfig::default();
        config.provider.version = InterfaceVersion::V1;
        let provider = BusProvider::new(&config).unwrap();
        assert_eq!(
            provider.offered(),
            DescriptorHeader::for_version(InterfaceVersion::V1)
        );
        provider.shutdown();

        let provider = BusProvider::new(&ProviderConfig::default()).unwrap();
        assert_eq!(provider.offered().version, CURRENT_VERSION);
        provider.shutdown();
    }

    #[test]
    fn test_internal_deferral_is_tagged_provider() {
        let provider = BusProvider::new(&ProviderConfig::default()).unwrap();
        let owner = create_mock_owner("root-hub");
        let (request, waiter) = create_mock_request(1);

        let outcome = provider.defer_internal(
            &owner,
            |_, request| {
                request.complete(RequestStatus::Success);
            },
            request,
        );
        assert!(outcome.is_deferred());
        waiter.blocking_wait();
        provider.shutdown();

        let stats = provider.stats();
        assert_eq!(stats.origins.provider, 1);
        assert_eq!(stats.origins.consumer, 0);
        assert_eq!(stats.executed, 1);
    }

    #[test]
    fn test_unretired_provider_is_not_leaked() {
        let registry = InterfaceRegistry::new();
        let provider = BusProvider::new(&ProviderConfig::default()).unwrap();
        let handle = provider.publish(&registry).unwrap();
        let weak = Arc::downgrade(&provider);

        drop(handle);
        drop(provider);
        assert!(weak.upgrade().is_some());

        // The registry held the last strong handle
        drop(registry);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_retire_after_handle_dropped() {
        let registry = InterfaceRegistry::new();
        let provider = BusProvider::new(&ProviderConfig::default()).unwrap();
        drop(provider.publish(&registry).unwrap());
        registry.withdraw(FORWARD_PROGRESS_INTERFACE_ID);

        provider.retire();
        let handle = provider.publish(&registry).unwrap();
        assert_eq!(handle.reference_count(), 1);
        drop(handle);

        // The registry's copy is the only one left
        provider.withdraw(&registry);
        assert!(provider.queue.is_shut_down());
        provider.shutdown();
    }

    #[test]
    fn test_final_release_does_not_wait_for_callbacks() {
        let registry = InterfaceRegistry::new();
        let provider = BusProvider::new(&ProviderConfig::default()).unwrap();
        let handle = provider.publish(&registry).unwrap();
        let descriptor = registry
            .query(
                FORWARD_PROGRESS_INTERFACE_ID,
                DescriptorHeader::for_version(CURRENT_VERSION),
            )
            .unwrap();
        provider.withdraw(&registry);

        let owner = create_mock_owner("hub0");
        let (request, waiter) = create_mock_request(1);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let outcome = descriptor.v2().unwrap().defer_request_processing(
            &owner,
            move |_, request| {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
                request.complete(RequestStatus::Success);
            },
            request,
        );
        assert!(outcome.is_deferred());
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        drop(descriptor);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!handle.is_valid());

        release_tx.send(()).unwrap();
        assert_eq!(waiter.blocking_wait().status, RequestStatus::Success);
        provider.shutdown();
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn test_last_release_closes_lanes() {
        let registry = InterfaceRegistry::new();
        let provider = BusProvider::new(&ProviderConfig::default()).unwrap();
        let handle = provider.publish(&registry).unwrap();
        let reference = handle.acquire();

        provider.withdraw(&registry);
        assert!(handle.is_valid());
        assert!(!registry.contains(FORWARD_PROGRESS_INTERFACE_ID));

        drop(reference);
        assert!(!handle.is_valid());
        assert_eq!(handle.invalidation_count(), 1);

        // Lanes are closed, so deferral degrades to inline processing
        let owner = create_mock_owner("hub0");
        let (request, _waiter) = create_mock_request(2);
        let outcome = provider.defer_internal(&owner, |_, _| {}, request);
        assert_eq!(
            outcome,
            DeferOutcome::Inline(interface::InlineReason::QueueRejected)
        );
    }
}
