//! Work items and the pool that hands them out
//!
//! A [`WorkItem`] is an opaque deferred-execution token bound to one owner.
//! Its lifecycle lives in a single atomic byte, and every transition is a
//! compare-exchange from the one state it may legally leave, so the queuer,
//! the lane worker and the freeing caller never need a lock.
//!
//! The pool bounds how many tokens may be outstanding at once. Running out is
//! the expected resource-pressure case: callers fall back to processing
//! synchronously.

use common::DeferralMetrics;
use interface::{
    ContractViolation, DeferralError, OwnerRef, WorkItemId, WorkItemState, same_owner,
};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

static NEXT_WORK_ITEM_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

const ALLOCATED: u8 = 0;
const QUEUED: u8 = 1;
const EXECUTING: u8 = 2;
const COMPLETED: u8 = 3;
const FREED: u8 = 4;

const fn encode(state: WorkItemState) -> u8 {
    match state {
        WorkItemState::Allocated => ALLOCATED,
        WorkItemState::Queued => QUEUED,
        WorkItemState::Executing => EXECUTING,
        WorkItemState::Completed => COMPLETED,
        WorkItemState::Freed => FREED,
    }
}

const fn decode(raw: u8) -> WorkItemState {
    match raw {
        ALLOCATED => WorkItemState::Allocated,
        QUEUED => WorkItemState::Queued,
        EXECUTING => WorkItemState::Executing,
        COMPLETED => WorkItemState::Completed,
        _ => WorkItemState::Freed,
    }
}

thread_local! {
    /// Work item whose callback is running on this thread
    static EXECUTING_ITEM: Cell<Option<WorkItemId>> = const { Cell::new(None) };
}

/// Marks the current thread as running a work item's callback
pub(crate) struct ExecutionScope {
    previous: Option<WorkItemId>,
}

impl ExecutionScope {
    pub(crate) fn enter(id: WorkItemId) -> Self {
        let previous = EXECUTING_ITEM.with(|current| current.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        EXECUTING_ITEM.with(|current| current.set(self.previous));
    }
}

fn executing_here(id: WorkItemId) -> bool {
    EXECUTING_ITEM.with(|current| current.get() == Some(id))
}

struct WorkItemInner {
    id: WorkItemId,
    pool_id: u64,
    owner: OwnerRef,
    state: AtomicU8,
}

/// Deferred-execution token
///
/// Cloning copies the handle, not the slot: every clone observes the same
/// state, and freeing any of them frees the slot.
#[derive(Clone)]
pub struct WorkItem {
    inner: Arc<WorkItemInner>,
}

impl WorkItem {
    pub fn id(&self) -> WorkItemId {
        self.inner.id
    }

    /// Device object the item was allocated for
    pub fn owner(&self) -> &OwnerRef {
        &self.inner.owner
    }

    pub fn state(&self) -> WorkItemState {
        decode(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_owned_by(&self, owner: &OwnerRef) -> bool {
        same_owner(&self.inner.owner, owner)
    }

    /// Move from `from` to `to`, or report the state actually observed
    pub(crate) fn transition(
        &self,
        from: WorkItemState,
        to: WorkItemState,
    ) -> Result<(), WorkItemState> {
        self.inner
            .state
            .compare_exchange(encode(from), encode(to), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(decode)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Allocates and frees work items for one provider
pub struct WorkItemPool {
    id: u64,
    limit: usize,
    outstanding: AtomicUsize,
    metrics: Arc<DeferralMetrics>,
}

impl WorkItemPool {
    /// Create a pool allowing at most `limit` outstanding items
    pub fn new(limit: usize, metrics: Arc<DeferralMetrics>) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            limit,
            outstanding: AtomicUsize::new(0),
            metrics,
        }
    }

    /// Allocate a work item bound to `owner`
    ///
    /// Never blocks. Exhaustion is reported as
    /// [`DeferralError::AllocationFailure`] and is not an error condition for
    /// the caller's request: it must be processed synchronously instead.
    pub fn allocate(&self, owner: &OwnerRef) -> Result<WorkItem, DeferralError> {
        let limit = self.limit;
        if let Err(outstanding) =
            self.outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
        {
            self.metrics.record_allocation_failure();
            warn!(
                owner = owner.name(),
                outstanding, limit, "Work item pool exhausted"
            );
            return Err(DeferralError::AllocationFailure { outstanding, limit });
        }

        let item = WorkItem {
            inner: Arc::new(WorkItemInner {
                id: WorkItemId(NEXT_WORK_ITEM_ID.fetch_add(1, Ordering::Relaxed)),
                pool_id: self.id,
                owner: Arc::clone(owner),
                state: AtomicU8::new(ALLOCATED),
            }),
        };

        self.metrics.record_allocation();
        debug!(item = %item.id(), owner = owner.name(), "Allocated work item");
        Ok(item)
    }

    /// Return a work item to the pool, reporting contract violations
    ///
    /// Legal from `Allocated` (abandon without queuing) and `Completed`, and
    /// from `Executing` only on the thread running the item's own callback.
    /// On a violation the item is left untouched.
    pub fn try_free(&self, item: WorkItem) -> Result<(), ContractViolation> {
        let id = item.id();
        if item.inner.pool_id != self.id {
            return Err(ContractViolation::ForeignWorkItem(id));
        }

        loop {
            let state = item.state();
            match state {
                _ if state.is_freeable() => {}
                WorkItemState::Executing if executing_here(id) => {}
                WorkItemState::Freed => return Err(ContractViolation::DoubleFree(id)),
                _ => return Err(ContractViolation::FreeWhileBusy { item: id, state }),
            }

            // Lost a race with the lane worker; look again
            if item.transition(state, WorkItemState::Freed).is_ok() {
                break;
            }
        }

        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.metrics.record_free();
        debug!(item = %id, "Freed work item");
        Ok(())
    }

    /// Return a work item to the pool
    ///
    /// # Panics
    ///
    /// Panics on double free, on freeing a queued or executing item, and on
    /// freeing an item allocated from another pool.
    #[track_caller]
    pub fn free(&self, item: WorkItem) {
        if let Err(violation) = self.try_free(item) {
            violation.raise();
        }
    }

    /// Items allocated and not yet freed
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl fmt::Debug for WorkItemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItemPool")
            .field("id", &self.id)
            .field("limit", &self.limit)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Drop for WorkItemPool {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            warn!(outstanding, "Work item pool dropped with items still outstanding");
        }
    }
}
