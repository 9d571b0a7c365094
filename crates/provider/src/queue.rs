//! Deferral queue
//!
//! Each execution class is a lane: a bounded channel drained by a fixed set of
//! dedicated worker threads. Queuing is a non-blocking `try_send`, so it is
//! safe from any calling context and never runs the callback on the caller's
//! stack. A full or shut-down lane rejects the work item and hands the context
//! back, leaving the item `Allocated` for the caller to retry, process
//! synchronously or free.
//!
//! No ordering is promised between work items, not even within one lane: a
//! lane with several workers runs its items concurrently.

use crate::config::QueueSettings;
use crate::work_item::{ExecutionScope, WorkItem};
use async_channel::{Receiver, Sender, bounded};
use common::DeferralMetrics;
use interface::{
    ContractViolation, DeferralError, DeferralOrigin, OwnerRef, QueueType, RejectReason,
    WorkItemState,
};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Opaque caller context passed through to the callback
pub type WorkContext = Box<dyn Any + Send>;

/// Type-erased callback run on a lane worker
pub type WorkItemRoutine = Box<dyn FnOnce(WorkItemInvocation, WorkContext) + Send>;

/// What a callback receives when its work item executes
#[derive(Debug)]
pub struct WorkItemInvocation {
    /// Owner the item was queued for
    pub owner: OwnerRef,
    /// The executing item; the callback may free it
    pub item: WorkItem,
    pub queue_type: QueueType,
    /// Diagnostic only
    pub origin: DeferralOrigin,
}

/// A rejected queue request, carrying the caller's context back
pub struct Rejected<T> {
    pub error: DeferralError,
    pub context: T,
}

impl<T> Rejected<T> {
    pub fn into_context(self) -> T {
        self.context
    }

    pub fn map_context<U>(self, f: impl FnOnce(T) -> U) -> Rejected<U> {
        Rejected {
            error: self.error,
            context: f(self.context),
        }
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T> std::error::Error for Rejected<T> {}

/// Erase a typed callback into a [`WorkItemRoutine`]
pub fn erase<T, F>(callback: F) -> WorkItemRoutine
where
    T: Send + 'static,
    F: FnOnce(WorkItemInvocation, T) + Send + 'static,
{
    Box::new(move |invocation, context| callback(invocation, recover::<T>(context)))
}

/// Recover a typed context erased by [`erase`]
pub fn recover<T: 'static>(context: WorkContext) -> T {
    match context.downcast::<T>() {
        Ok(context) => *context,
        Err(_) => unreachable!("work context type is fixed when the routine is erased"),
    }
}

thread_local! {
    /// Set for the lifetime of a lane worker thread
    static LANE_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// A work item travelling through a lane
struct Dispatch {
    item: WorkItem,
    routine: WorkItemRoutine,
    context: WorkContext,
    queue_type: QueueType,
    origin: DeferralOrigin,
    queued_at: Instant,
}

struct Lane {
    tx: Sender<Dispatch>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Schedules work items onto per-class worker lanes
pub struct DeferralQueue {
    /// Indexed by `QueueType::index`
    lanes: Vec<Lane>,
    metrics: Arc<DeferralMetrics>,
}

impl DeferralQueue {
    /// Create the lanes and start their workers
    pub fn new(settings: &QueueSettings, metrics: Arc<DeferralMetrics>) -> common::Result<Self> {
        let mut lanes = Vec::with_capacity(QueueType::ALL.len());

        for queue_type in QueueType::ALL {
            let lane_settings = settings.lane(queue_type);
            let (tx, rx) = bounded(lane_settings.capacity);

            let mut workers = Vec::with_capacity(lane_settings.workers);
            for index in 0..lane_settings.workers {
                workers.push(spawn_lane_worker(
                    queue_type,
                    index,
                    rx.clone(),
                    Arc::clone(&metrics),
                )?);
            }

            info!(
                queue = %queue_type,
                workers = lane_settings.workers,
                capacity = lane_settings.capacity,
                "Deferral lane started"
            );
            lanes.push(Lane {
                tx,
                workers: Mutex::new(workers),
            });
        }

        Ok(Self { lanes, metrics })
    }

    fn lane(&self, queue_type: QueueType) -> &Lane {
        &self.lanes[queue_type.index()]
    }

    /// Queue `item` for asynchronous execution on `queue_type`
    ///
    /// Returns immediately. On success the routine runs exactly once on a lane
    /// worker, never inside this call.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not `Allocated` (it was already queued, or freed)
    /// or was allocated for a different owner.
    #[track_caller]
    pub fn queue(
        &self,
        owner: &OwnerRef,
        item: &WorkItem,
        routine: WorkItemRoutine,
        queue_type: QueueType,
        context: WorkContext,
        origin: DeferralOrigin,
    ) -> Result<(), Rejected<WorkContext>> {
        if !item.is_owned_by(owner) {
            ContractViolation::OwnerMismatch(item.id()).raise();
        }
        if let Err(state) = item.transition(WorkItemState::Allocated, WorkItemState::Queued) {
            ContractViolation::InvalidQueue {
                item: item.id(),
                state,
            }
            .raise();
        }

        let dispatch = Dispatch {
            item: item.clone(),
            routine,
            context,
            queue_type,
            origin,
            queued_at: Instant::now(),
        };

        match self.lane(queue_type).tx.try_send(dispatch) {
            Ok(()) => {
                self.metrics.record_queued(queue_type, origin);
                debug!(item = %item.id(), queue = %queue_type, %origin, "Queued work item");
                Ok(())
            }
            Err(err) => {
                let reason = if err.is_full() {
                    RejectReason::Full
                } else {
                    RejectReason::ShutDown
                };
                let dispatch = err.into_inner();

                // The dispatch never reached a worker, so the queuer still owns the state
                let _ = item.transition(WorkItemState::Queued, WorkItemState::Allocated);
                self.metrics.record_rejected();
                warn!(item = %item.id(), queue = %queue_type, %reason, "Queue rejected work item");

                Err(Rejected {
                    error: DeferralError::QueueRejected {
                        queue_type,
                        item: item.id(),
                        reason,
                    },
                    context: dispatch.context,
                })
            }
        }
    }

    /// Typed form of [`queue`](Self::queue)
    #[track_caller]
    pub fn queue_with<T, F>(
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
        self.queue(
            owner,
            item,
            erase(callback),
            queue_type,
            Box::new(context),
            origin,
        )
        .map_err(|rejected| rejected.map_context(recover::<T>))
    }

    /// Items waiting in a lane
    pub fn depth(&self, queue_type: QueueType) -> usize {
        self.lane(queue_type).tx.len()
    }

    pub fn capacity(&self, queue_type: QueueType) -> usize {
        self.lane(queue_type).tx.capacity().unwrap_or(usize::MAX)
    }

    pub fn is_shut_down(&self) -> bool {
        self.lanes.iter().all(|lane| lane.tx.is_closed())
    }

    /// Stop accepting work without waiting
    ///
    /// Items already queued still run; workers exit once their lane drains.
    pub fn close(&self) {
        for lane in &self.lanes {
            lane.tx.close();
        }
    }

    /// Close the lanes, then wait for the workers to drain them
    ///
    /// From a lane worker this only closes the lanes: a lane worker never
    /// joins another one.
    pub fn shutdown(&self) {
        self.close();
        if LANE_WORKER.with(Cell::get) {
            debug!("Deferral queue closed from a lane worker");
            return;
        }

        let mut joined = 0;
        for lane in &self.lanes {
            // Held while joining so concurrent callers wait for the drain too
            let mut workers = lane
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for worker in workers.drain(..) {
                if worker.join().is_err() {
                    error!("Deferral worker exited by panic");
                }
                joined += 1;
            }
        }
        if joined > 0 {
            info!(workers = joined, "Deferral queue shut down");
        }
    }
}

impl Drop for DeferralQueue {
    fn drop(&mut self) {
        // Workers drain what is left and exit on their own
        self.close();
    }
}

impl fmt::Debug for DeferralQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("DeferralQueue");
        for queue_type in QueueType::ALL {
            s.field(queue_type.as_str(), &self.depth(queue_type));
        }
        s.finish()
    }
}

fn spawn_lane_worker(
    queue_type: QueueType,
    index: usize,
    rx: Receiver<Dispatch>,
    metrics: Arc<DeferralMetrics>,
) -> common::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("defer-{}-{}", queue_type, index))
        .spawn(move || run_lane_worker(queue_type, rx, metrics))
        .map_err(common::Error::Io)
}

fn run_lane_worker(queue_type: QueueType, rx: Receiver<Dispatch>, metrics: Arc<DeferralMetrics>) {
    LANE_WORKER.with(|flag| flag.set(true));
    debug!(queue = %queue_type, "Deferral worker started");

    // Closed and drained ends the loop
    while let Ok(dispatch) = rx.recv_blocking() {
        execute(dispatch, &metrics);
    }

    debug!(queue = %queue_type, "Deferral worker stopped");
}

fn execute(dispatch: Dispatch, metrics: &DeferralMetrics) {
    let Dispatch {
        item,
        routine,
        context,
        queue_type,
        origin,
        queued_at,
    } = dispatch;
    let id = item.id();

    if let Err(state) = item.transition(WorkItemState::Queued, WorkItemState::Executing) {
        error!(item = %id, %state, "Dispatched work item was not queued");
        return;
    }
    metrics.record_executed(queued_at.elapsed());
    debug!(item = %id, queue = %queue_type, %origin, "Executing work item");

    let invocation = WorkItemInvocation {
        owner: Arc::clone(item.owner()),
        item: item.clone(),
        queue_type,
        origin,
    };

    // A panicking callback must not take the lane worker down with it
    let outcome = {
        let _scope = ExecutionScope::enter(id);
        panic::catch_unwind(AssertUnwindSafe(|| routine(invocation, context)))
    };
    if let Err(payload) = outcome {
        metrics.record_callback_panic();
        error!(item = %id, panic = panic_message(payload.as_ref()), "Work item callback panicked");
    }

    match item.transition(WorkItemState::Executing, WorkItemState::Completed) {
        Ok(()) => debug!(item = %id, "Work item completed"),
        Err(WorkItemState::Freed) => debug!(item = %id, "Work item freed by its callback"),
        Err(state) => error!(item = %id, %state, "Work item left executing in unexpected state"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaneSettings, QueueSettings};
    use crate::work_item::WorkItemPool;
    use common::test_utils::{create_mock_owner, wait_until};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn settings(workers: usize, capacity: usize) -> QueueSettings {
        let lane = LaneSettings { workers, capacity };
        QueueSettings {
            critical: lane.clone(),
            delayed: lane.clone(),
            hyper_critical: lane,
        }
    }

    fn fixture(workers: usize, capacity: usize) -> (DeferralQueue, WorkItemPool) {
        let metrics = Arc::new(DeferralMetrics::new());
        let queue = DeferralQueue::new(&settings(workers, capacity), Arc::clone(&metrics)).unwrap();
        let pool = WorkItemPool::new(64, metrics);
        (queue, pool)
    }

    #[test]
    fn test_callback_runs_on_lane_worker() {
        let (queue, pool) = fixture(1, 8);
        let owner = create_mock_owner("hub0");
        let item = pool.allocate(&owner).unwrap();
        let (tx, rx) = mpsc::channel();

        queue
            .queue_with(
                &owner,
                &item,
                move |invocation, context: u32| {
                    let name = std::thread::current().name().map(str::to_string);
                    tx.send((context, name, invocation.origin, invocation.item.state()))
                        .unwrap();
                },
                QueueType::Critical,
                42u32,
                DeferralOrigin::Provider,
            )
            .unwrap();

        let (context, thread, origin, state) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(context, 42);
        assert_eq!(thread.as_deref(), Some("defer-critical-0"));
        assert_eq!(origin, DeferralOrigin::Provider);
        assert_eq!(state, WorkItemState::Executing);

        assert!(wait_until(Duration::from_secs(5), || item.state()
            == WorkItemState::Completed));
        pool.free(item);
        queue.shutdown();
    }

    #[test]
    fn test_full_lane_rejects_and_returns_context() {
        let (queue, pool) = fixture(1, 1);
        let owner = create_mock_owner("hub0");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        // Park the only worker
        let blocker = pool.allocate(&owner).unwrap();
        queue
            .queue_with(
                &owner,
                &blocker,
                move |_, _: ()| {
                    started_tx.send(()).unwrap();
                    let _ = release_rx.recv();
                },
                QueueType::Delayed,
                (),
                DeferralOrigin::Consumer,
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Fill the single slot
        let filler = pool.allocate(&owner).unwrap();
        queue
            .queue_with(
                &owner,
                &filler,
                |_, _: ()| {},
                QueueType::Delayed,
                (),
                DeferralOrigin::Consumer,
            )
            .unwrap();

        let item = pool.allocate(&owner).unwrap();
        let rejected = queue
            .queue_with(
                &owner,
                &item,
                |_, _: String| {},
                QueueType::Delayed,
                "context".to_string(),
                DeferralOrigin::Consumer,
            )
            .unwrap_err();

        assert!(matches!(
            rejected.error,
            DeferralError::QueueRejected {
                reason: RejectReason::Full,
                ..
            }
        ));
        assert_eq!(rejected.into_context(), "context");
        assert_eq!(item.state(), WorkItemState::Allocated);

        // Other lanes are unaffected
        let other = pool.allocate(&owner).unwrap();
        assert!(
            queue
                .queue_with(
                    &owner,
                    &other,
                    |_, _: ()| {},
                    QueueType::Critical,
                    (),
                    DeferralOrigin::Consumer,
                )
                .is_ok()
        );

        release_tx.send(()).unwrap();
        pool.free(item);
        queue.shutdown();
    }

    #[test]
    fn test_shutdown_runs_queued_items_then_rejects() {
        let (queue, pool) = fixture(2, 64);
        let owner = create_mock_owner("hub0");
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let item = pool.allocate(&owner).unwrap();
            let runs = Arc::clone(&runs);
            queue
                .queue_with(
                    &owner,
                    &item,
                    move |_, _: ()| {
                        runs.fetch_add(1, Ordering::SeqCst);
                    },
                    QueueType::Delayed,
                    (),
                    DeferralOrigin::Consumer,
                )
                .unwrap();
        }

        queue.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 20);
        assert!(queue.is_shut_down());

        let item = pool.allocate(&owner).unwrap();
        let rejected = queue
            .queue_with(
                &owner,
                &item,
                |_, _: ()| {},
                QueueType::Delayed,
                (),
                DeferralOrigin::Consumer,
            )
            .unwrap_err();
        assert!(matches!(
            rejected.error,
            DeferralError::QueueRejected {
                reason: RejectReason::ShutDown,
                ..
            }
        ));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let metrics = Arc::new(DeferralMetrics::new());
        let queue = DeferralQueue::new(&settings(1, 8), Arc::clone(&metrics)).unwrap();
        let pool = WorkItemPool::new(8, Arc::clone(&metrics));
        let owner = create_mock_owner("hub0");

        let bad = pool.allocate(&owner).unwrap();
        queue
            .queue_with(
                &owner,
                &bad,
                |_, _: ()| panic!("callback failure"),
                QueueType::Delayed,
                (),
                DeferralOrigin::Consumer,
            )
            .unwrap();

        // The same worker keeps serving the lane
        let (tx, rx) = mpsc::channel();
        let good = pool.allocate(&owner).unwrap();
        queue
            .queue_with(
                &owner,
                &good,
                move |_, _: ()| tx.send(()).unwrap(),
                QueueType::Delayed,
                (),
                DeferralOrigin::Consumer,
            )
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || bad.state()
            == WorkItemState::Completed));
        assert_eq!(metrics.snapshot().callback_panics, 1);
        queue.shutdown();
    }

    #[test]
    #[should_panic(expected = "queued while queued")]
    fn test_requeue_is_violation() {
        let (queue, pool) = fixture(1, 8);
        let owner = create_mock_owner("hub0");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        // Park the only worker so the next item stays queued
        let blocker = pool.allocate(&owner).unwrap();
        queue
            .queue_with(
                &owner,
                &blocker,
                move |_, _: ()| {
                    started_tx.send(()).unwrap();
                    let _ = release_rx.recv();
                },
                QueueType::Delayed,
                (),
                DeferralOrigin::Consumer,
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let item = pool.allocate(&owner).unwrap();
        queue
            .queue_with(
                &owner,
                &item,
                |_, _: ()| {},
                QueueType::Delayed,
                (),
                DeferralOrigin::Consumer,
            )
            .unwrap();
        assert_eq!(item.state(), WorkItemState::Queued);

        let _release = release_tx;
        let _ = queue.queue_with(
            &owner,
            &item,
            |_, _: ()| {},
            QueueType::Delayed,
            (),
            DeferralOrigin::Consumer,
        );
    }

    #[test]
    #[should_panic(expected = "queued while freed")]
    fn test_queue_after_free_is_violation() {
        let (queue, pool) = fixture(1, 8);
        let owner = create_mock_owner("hub0");
        let item = pool.allocate(&owner).unwrap();
        pool.free(item.clone());

        let _ = queue.queue_with(
            &owner,
            &item,
            |_, _: ()| {},
            QueueType::Delayed,
            (),
            DeferralOrigin::Consumer,
        );
    }

    #[test]
    #[should_panic(expected = "not allocated to")]
    fn test_owner_mismatch_is_violation() {
        let (queue, pool) = fixture(1, 8);
        let owner = create_mock_owner("hub0");
        let other = create_mock_owner("hub1");
        let item = pool.allocate(&owner).unwrap();

        let _ = queue.queue_with(
            &other,
            &item,
            |_, _: ()| {},
            QueueType::Delayed,
            (),
            DeferralOrigin::Consumer,
        );
    }

    #[test]
    fn test_shutdown_from_two_lanes_at_once() {
        let (queue, pool) = fixture(1, 8);
        let queue = Arc::new(queue);
        let owner = create_mock_owner("hub0");
        let both = Arc::new(std::sync::Barrier::new(2));
        let (done_tx, done_rx) = mpsc::channel();

        for queue_type in [QueueType::Critical, QueueType::HyperCritical] {
            let item = pool.allocate(&owner).unwrap();
            let lanes = Arc::clone(&queue);
            let both = Arc::clone(&both);
            let done_tx = done_tx.clone();
            queue
                .queue_with(
                    &owner,
                    &item,
                    move |_, _: ()| {
                        both.wait();
                        lanes.shutdown();
                        done_tx.send(()).unwrap();
                    },
                    queue_type,
                    (),
                    DeferralOrigin::Consumer,
                )
                .unwrap();
        }

        for _ in 0..2 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(queue.is_shut_down());
        queue.shutdown();
    }

    #[test]
    fn test_close_does_not_wait_for_running_callback() {
        let (queue, pool) = fixture(1, 8);
        let owner = create_mock_owner("hub0");
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let item = pool.allocate(&owner).unwrap();
        queue
            .queue_with(
                &owner,
                &item,
                move |_, _: ()| {
                    started_tx.send(()).unwrap();
                    let _ = release_rx.recv_timeout(Duration::from_secs(5));
                },
                QueueType::Delayed,
                (),
                DeferralOrigin::Consumer,
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        queue.close();
        assert!(queue.is_shut_down());
        assert_eq!(item.state(), WorkItemState::Executing);

        release_tx.send(()).unwrap();
        queue.shutdown();
        assert_eq!(item.state(), WorkItemState::Completed);
    }
}
