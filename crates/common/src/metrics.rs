//! Deferral metrics
//!
//! Thread-safe counters for the work-item lifecycle plus a rolling window of
//! queue-to-execution latencies. Every hot-path update is a relaxed atomic
//! add; only latency samples take a lock.

use interface::{DeferralOrigin, InlineReason, QueueType};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Maximum number of latency samples kept
const ROLLING_WINDOW_SIZE: usize = 1024;

/// Samples older than this are pruned
const ROLLING_WINDOW: Duration = Duration::from_secs(10);

/// A single queue latency measurement
#[derive(Debug, Clone, Copy)]
struct LatencySample {
    latency_us: u64,
    timestamp: Instant,
}

/// Rolling statistics calculator for latency measurements
#[derive(Debug)]
struct RollingStats {
    samples: VecDeque<LatencySample>,
    window_duration: Duration,
}

impl RollingStats {
    fn new(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(ROLLING_WINDOW_SIZE),
            window_duration,
        }
    }

    fn add_sample(&mut self, latency_us: u64) {
        let now = Instant::now();
        if self.samples.len() == ROLLING_WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(LatencySample {
            latency_us,
            timestamp: now,
        });
        self.prune_old_samples(now);
    }

    fn prune_old_samples(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window_duration) else {
            return;
        };
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn stats(&self) -> LatencyStats {
        if self.samples.is_empty() {
            return LatencyStats::default();
        }
        let values = self.samples.iter().map(|s| s.latency_us);
        let sum: u64 = values.clone().sum();
        LatencyStats {
            min_us: values.clone().min().unwrap_or(0),
            max_us: values.max().unwrap_or(0),
            avg_us: sum / self.samples.len() as u64,
            sample_count: self.samples.len(),
        }
    }
}

/// Queue latency statistics snapshot
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyStats {
    /// Minimum latency in microseconds
    pub min_us: u64,
    /// Maximum latency in microseconds
    pub max_us: u64,
    /// Average latency in microseconds
    pub avg_us: u64,
    /// Number of samples in the window
    pub sample_count: usize,
}

impl LatencyStats {
    /// Format average latency for display (converts to ms)
    pub fn format_avg(&self) -> String {
        format!("{:.3} ms", self.avg_us as f64 / 1000.0)
    }

    pub fn format_max(&self) -> String {
        format!("{:.3} ms", self.max_us as f64 / 1000.0)
    }
}

/// Counters for the deferral lifecycle
#[derive(Debug)]
pub struct DeferralMetrics {
    allocations: AtomicU64,
    allocation_failures: AtomicU64,
    frees: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
    executed: AtomicU64,
    callback_panics: AtomicU64,
    inline_allocation: AtomicU64,
    inline_rejected: AtomicU64,
    inline_unavailable: AtomicU64,
    /// Indexed by `QueueType::index`
    queued_per_lane: [AtomicU64; 3],
    provider_origin: AtomicU64,
    consumer_origin: AtomicU64,
    queue_latency: RwLock<RollingStats>,
}

impl Default for DeferralMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferralMetrics {
    pub fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            callback_panics: AtomicU64::new(0),
            inline_allocation: AtomicU64::new(0),
            inline_rejected: AtomicU64::new(0),
            inline_unavailable: AtomicU64::new(0),
            queued_per_lane: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            provider_origin: AtomicU64::new(0),
            consumer_origin: AtomicU64::new(0),
            queue_latency: RwLock::new(RollingStats::new(ROLLING_WINDOW)),
        }
    }

    pub fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful queue operation
    pub fn record_queued(&self, queue_type: QueueType, origin: DeferralOrigin) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.queued_per_lane[queue_type.index()].fetch_add(1, Ordering::Relaxed);
        match origin {
            DeferralOrigin::Provider => self.provider_origin.fetch_add(1, Ordering::Relaxed),
            DeferralOrigin::Consumer => self.consumer_origin.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatched callback and how long it waited in its lane
    pub fn record_executed(&self, waited: Duration) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut stats) = self.queue_latency.write() {
            stats.add_sample(waited.as_micros() as u64);
        }
    }

    pub fn record_callback_panic(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request processed on the caller's context
    pub fn record_inline(&self, reason: InlineReason) {
        let counter = match reason {
            InlineReason::AllocationFailed => &self.inline_allocation,
            InlineReason::QueueRejected => &self.inline_rejected,
            InlineReason::CapabilityUnavailable => &self.inline_unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn inline_total(&self) -> u64 {
        self.inline_allocation.load(Ordering::Relaxed)
            + self.inline_rejected.load(Ordering::Relaxed)
            + self.inline_unavailable.load(Ordering::Relaxed)
    }

    pub fn queue_latency(&self) -> LatencyStats {
        self.queue_latency
            .read()
            .map(|stats| stats.stats())
            .unwrap_or_default()
    }

    /// Take a consistent-enough snapshot for display or serialization
    pub fn snapshot(&self) -> DeferralStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeferralStats {
            allocations: load(&self.allocations),
            allocation_failures: load(&self.allocation_failures),
            frees: load(&self.frees),
            queued: load(&self.queued),
            rejected: load(&self.rejected),
            executed: load(&self.executed),
            callback_panics: load(&self.callback_panics),
            inline: InlineStats {
                allocation_failed: load(&self.inline_allocation),
                queue_rejected: load(&self.inline_rejected),
                capability_unavailable: load(&self.inline_unavailable),
            },
            lanes: LaneStats {
                critical: load(&self.queued_per_lane[QueueType::Critical.index()]),
                delayed: load(&self.queued_per_lane[QueueType::Delayed.index()]),
                hyper_critical: load(&self.queued_per_lane[QueueType::HyperCritical.index()]),
            },
            origins: OriginStats {
                provider: load(&self.provider_origin),
                consumer: load(&self.consumer_origin),
            },
            queue_latency: self.queue_latency(),
        }
    }
}

/// Inline fallback counts by reason
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InlineStats {
    pub allocation_failed: u64,
    pub queue_rejected: u64,
    pub capability_unavailable: u64,
}

/// Queued counts per execution class
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LaneStats {
    pub critical: u64,
    pub delayed: u64,
    pub hyper_critical: u64,
}

/// Queued counts per origin
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OriginStats {
    pub provider: u64,
    pub consumer: u64,
}

/// Snapshot of deferral metrics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeferralStats {
    pub allocations: u64,
    pub allocation_failures: u64,
    pub frees: u64,
    pub queued: u64,
    pub rejected: u64,
    pub executed: u64,
    pub callback_panics: u64,
    pub inline: InlineStats,
    pub lanes: LaneStats,
    pub origins: OriginStats,
    pub queue_latency: LatencyStats,
}

impl DeferralStats {
    /// Work items allocated but not yet freed
    pub fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }

    pub fn inline_total(&self) -> u64 {
        self.inline.allocation_failed
            + self.inline.queue_rejected
            + self.inline.capability_unavailable
    }
}
