//! Capability handle and version-gated interface views
//!
//! A provider publishes a [`CapabilityHandle`] that wraps its implementation
//! of [`ForwardProgressInterface`]. Consumers never reach the implementation
//! directly: they hold an [`InterfaceDescriptor`] carrying the negotiated
//! header and an [`InterfaceReference`], and ask it for a [`V1Interface`] or
//! [`V2Interface`] view. A view exists only if the negotiated size and version
//! both cover its entries, and it borrows the descriptor, so no entry can be
//! reached after the reference is released.

use crate::queue::{Rejected, WorkContext, WorkItemInvocation, WorkItemRoutine, erase, recover};
use crate::work_item::WorkItem;
use interface::{
    ContractViolation, DeferOutcome, DeferralError, DeferralOrigin, DescriptorHeader,
    InterfaceId, InterfaceVersion, OwnerRef, QueueType, Request,
};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Type-erased request processing callback
pub type RequestRoutine = Box<dyn FnOnce(&OwnerRef, Request) + Send>;

/// Hook run when a handle is invalidated
type TeardownHook = Box<dyn FnOnce() + Send>;

/// Entries a provider implements
///
/// Version 1 entries are required. `defer_request_processing` is the
/// version 2 entry; providers that only implement version 1 keep the default
/// and offer a version 1 header, so it is never reachable through a view.
pub trait ForwardProgressInterface: Send + Sync {
    /// Header describing what this implementation populates
    fn offered(&self) -> DescriptorHeader;

    fn allocate_work_item(&self, owner: &OwnerRef) -> Result<WorkItem, DeferralError>;

    fn free_work_item(&self, item: WorkItem);

    fn queue_work_item(
        &self,
        owner: &OwnerRef,
        item: &WorkItem,
        routine: WorkItemRoutine,
        queue_type: QueueType,
        context: WorkContext,
        origin: DeferralOrigin,
    ) -> Result<(), Rejected<WorkContext>>;

    fn defer_request_processing(
        &self,
        _owner: &OwnerRef,
        _routine: RequestRoutine,
        _request: Request,
    ) -> DeferOutcome {
        ContractViolation::UnpopulatedEntry("defer_request_processing").raise()
    }
}

/// Published, reference-counted interface
///
/// The count starts at one for the provider's own reference, which the
/// provider gives up with [`retire`](Self::retire). The handle is
/// invalidated exactly once, when the last reference goes.
pub struct CapabilityHandle {
    id: InterfaceId,
    offered: DescriptorHeader,
    ops: Arc<dyn ForwardProgressInterface>,
    references: AtomicUsize,
    invalidations: AtomicUsize,
    retired: AtomicBool,
    on_invalidate: Mutex<Option<TeardownHook>>,
}

impl CapabilityHandle {
    pub fn new(id: InterfaceId, ops: Arc<dyn ForwardProgressInterface>) -> Arc<Self> {
        let offered = ops.offered();
        info!(interface = %id, %offered, "Capability handle created");
        Arc::new(Self {
            id,
            offered,
            ops,
            references: AtomicUsize::new(1),
            invalidations: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            on_invalidate: Mutex::new(None),
        })
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn offered(&self) -> DescriptorHeader {
        self.offered
    }

    /// Register the provider's teardown, run once on invalidation
    pub fn on_invalidate(&self, hook: impl FnOnce() + Send + 'static) {
        *self
            .on_invalidate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Take a reference
    ///
    /// # Panics
    ///
    /// Panics if the handle was already invalidated.
    #[track_caller]
    pub fn acquire(self: &Arc<Self>) -> InterfaceReference {
        match self.try_acquire() {
            Some(reference) => reference,
            None => ContractViolation::UseAfterRelease(self.id).raise(),
        }
    }

    /// Take a reference unless the handle was already invalidated
    pub fn try_acquire(self: &Arc<Self>) -> Option<InterfaceReference> {
        self.references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .ok()
            .map(|previous| {
                debug!(interface = %self.id, references = previous + 1, "Interface acquired");
                InterfaceReference {
                    handle: Arc::clone(self),
                }
            })
    }

    /// Give up the provider's own reference
    ///
    /// # Panics
    ///
    /// Panics when called twice.
    #[track_caller]
    pub fn retire(&self) {
        if self.retired.swap(true, Ordering::AcqRel) {
            ContractViolation::UnbalancedRelease(self.id).raise();
        }
        self.release();
    }

    #[track_caller]
    fn release(&self) {
        let previous = match self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous,
            Err(_) => ContractViolation::UnbalancedRelease(self.id).raise(),
        };
        debug!(interface = %self.id, references = previous - 1, "Interface released");

        if previous == 1 {
            self.invalidate();
        }
    }

    fn invalidate(&self) {
        let count = self.invalidations.fetch_add(1, Ordering::AcqRel) + 1;
        info!(interface = %self.id, invalidations = count, "Capability handle invalidated");

        let hook = self
            .on_invalidate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_valid(&self) -> bool {
        self.references.load(Ordering::Acquire) > 0
    }

    pub fn reference_count(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    /// Times the handle reached zero references; never above one
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityHandle")
            .field("id", &self.id)
            .field("offered", &self.offered)
            .field("references", &self.reference_count())
            .finish_non_exhaustive()
    }
}

/// One counted reference to a [`CapabilityHandle`]
///
/// Cloning acquires another reference; dropping releases exactly one.
pub struct InterfaceReference {
    handle: Arc<CapabilityHandle>,
}

impl InterfaceReference {
    pub fn handle(&self) -> &Arc<CapabilityHandle> {
        &self.handle
    }

    /// Release explicitly; same as dropping
    pub fn release(self) {
        drop(self);
    }

    fn ops(&self) -> &dyn ForwardProgressInterface {
        self.handle.ops.as_ref()
    }
}

impl Clone for InterfaceReference {
    fn clone(&self) -> Self {
        self.handle.acquire()
    }
}

impl Drop for InterfaceReference {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl fmt::Debug for InterfaceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InterfaceReference")
            .field(&self.handle.id)
            .finish()
    }
}

/// Negotiated descriptor held by a consumer
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    header: DescriptorHeader,
    reference: InterfaceReference,
}

impl InterfaceDescriptor {
    /// Bind an acquired reference to the header both sides agreed on
    pub fn new(header: DescriptorHeader, reference: InterfaceReference) -> Self {
        Self { header, reference }
    }

    pub fn id(&self) -> InterfaceId {
        self.reference.handle.id
    }

    pub fn header(&self) -> DescriptorHeader {
        self.header
    }

    /// Handle this descriptor holds a reference to
    pub fn handle(&self) -> &Arc<CapabilityHandle> {
        self.reference.handle()
    }

    pub fn effective_version(&self) -> Option<InterfaceVersion> {
        self.header.effective_version()
    }

    /// Work-item entries, if the descriptor covers version 1
    pub fn v1(&self) -> Option<V1Interface<'_>> {
        self.header.covers(InterfaceVersion::V1).then(|| V1Interface {
            ops: self.reference.ops(),
        })
    }

    /// Version 2 entries, if the descriptor covers them
    ///
    /// A header claiming version 2 whose size only covers version 1 yields
    /// `None` here and `Some` from [`v1`](Self::v1).
    pub fn v2(&self) -> Option<V2Interface<'_>> {
        self.header.covers(InterfaceVersion::V2).then(|| V2Interface {
            v1: V1Interface {
                ops: self.reference.ops(),
            },
        })
    }

    pub fn release(self) {
        drop(self);
    }
}

/// Version 1 entries: allocate, queue, free
#[derive(Clone, Copy)]
pub struct V1Interface<'a> {
    ops: &'a dyn ForwardProgressInterface,
}

impl V1Interface<'_> {
    pub fn allocate_work_item(&self, owner: &OwnerRef) -> Result<WorkItem, DeferralError> {
        self.ops.allocate_work_item(owner)
    }

    #[track_caller]
    pub fn free_work_item(&self, item: WorkItem) {
        self.ops.free_work_item(item);
    }

    /// Queue `item`; a rejection hands `context` back
    #[track_caller]
    pub fn queue_work_item<T, F>(
        &self,
        owner: &OwnerRef,
        item: &WorkItem,
        callback: F,
        queue_type: QueueType,
        context: T,
        origin: DeferralOrigin,
    ) -> Result<(), Rejected<T>>
    where
        T: Send + 'static,
        F: FnOnce(WorkItemInvocation, T) + Send + 'static,
    {
        self.ops
            .queue_work_item(
                owner,
                item,
                erase(callback),
                queue_type,
                Box::new(context),
                origin,
            )
            .map_err(|rejected| rejected.map_context(recover::<T>))
    }
}

impl fmt::Debug for V1Interface<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V1Interface").finish_non_exhaustive()
    }
}

/// Version 2 entries; also dereferences to the version 1 entries
#[derive(Debug, Clone, Copy)]
pub struct V2Interface<'a> {
    v1: V1Interface<'a>,
}

impl V2Interface<'_> {
    /// Defer processing of `request`, or process it before returning
    pub fn defer_request_processing<F>(
        &self,
        owner: &OwnerRef,
        callback: F,
        request: Request,
    ) -> DeferOutcome
    where
        F: FnOnce(&OwnerRef, Request) + Send + 'static,
    {
        self.v1
            .ops
            .defer_request_processing(owner, Box::new(callback), request)
    }
}

impl<'a> Deref for V2Interface<'a> {
    type Target = V1Interface<'a>;

    fn deref(&self) -> &Self::Target {
        &self.v1
    }
}
