//=====================================================
// File: memory/gc.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Mark-sweep collector with a background trigger thread
// Objective: Watch outstanding bytes from a worker thread, raise a pending
//            flag past the threshold and run the cycle on the worker while
//            the mutator waits at a safe point
//=====================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::heap::{CycleReport, GcRef, Heap, HeapObject};
use crate::config::GcConfig;

/// Roots handed from the mutator to the worker and the report handed back.
#[derive(Default)]
struct Exchange {
    roots: Option<Vec<GcRef>>,
    report: Option<CycleReport>,
}

struct Shared {
    heap: Mutex<Heap>,
    pending: AtomicBool,
    shutdown: AtomicBool,
    exchange: Mutex<Exchange>,
    signal: Condvar,
    threshold: usize,
    /// Outstanding bytes that trigger the next cycle. At least `threshold`,
    /// and twice what survived the previous cycle.
    trigger: AtomicUsize,
    compact: bool,
    poll: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub cycles: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub live_objects: usize,
    pub outstanding_bytes: usize,
}

pub struct Collector {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    stats: GcStats,
}

impl Collector {
    pub fn new(config: &GcConfig) -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(Heap::new()),
            pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            exchange: Mutex::new(Exchange::default()),
            signal: Condvar::new(),
            threshold: config.threshold_bytes,
            trigger: AtomicUsize::new(config.threshold_bytes),
            compact: config.compact,
            poll: Duration::from_millis(config.poll_interval_ms.max(1)),
        });
        let worker = if config.background {
            let worker_shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name("strata-gc".into())
                .spawn(move || worker_loop(&worker_shared))
            {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(error = %err, "collector thread unavailable, collecting inline");
                    None
                }
            }
        } else {
            None
        };
        debug!(
            threshold = config.threshold_bytes,
            background = worker.is_some(),
            "collector started"
        );
        Self {
            shared,
            worker,
            stats: GcStats::default(),
        }
    }

    pub fn allocate(&self, object: HeapObject) -> (GcRef, usize) {
        let size = object.size_bytes();
        let reference = self.shared.heap.lock().allocate(object);
        (reference, size)
    }

    pub fn heap(&self) -> MutexGuard<'_, Heap> {
        self.shared.heap.lock()
    }

    /// Whether the mutator should stop at the next safe point.
    pub fn collection_pending(&self) -> bool {
        if self.has_worker() {
            self.shared.pending.load(Ordering::Acquire)
        } else {
            self.shared.heap.lock().outstanding_bytes() >= self.shared.trigger.load(Ordering::Acquire)
        }
    }

    fn has_worker(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Runs one full cycle from `roots` and blocks until it finishes.
    pub fn collect(&mut self, roots: Vec<GcRef>) -> CycleReport {
        let report = if self.has_worker() {
            self.collect_on_worker(roots)
        } else {
            self.shared.heap.lock().collect(&roots, self.shared.compact)
        };
        let heap = self.shared.heap.lock();
        self.shared.rearm(heap.outstanding_bytes());
        self.stats.cycles += 1;
        self.stats.objects_freed += report.swept.len();
        self.stats.bytes_freed += report.freed_bytes;
        self.stats.live_objects = heap.live_objects();
        self.stats.outstanding_bytes = heap.outstanding_bytes();
        debug!(
            marked = report.marked,
            swept = report.swept.len(),
            freed = report.freed_bytes,
            "collection finished"
        );
        report
    }

    fn collect_on_worker(&mut self, roots: Vec<GcRef>) -> CycleReport {
        let mut exchange = self.shared.exchange.lock();
        exchange.report = None;
        exchange.roots = Some(roots);
        self.shared.signal.notify_all();
        loop {
            if let Some(report) = exchange.report.take() {
                return report;
            }
            if !self.has_worker() {
                // The worker is gone; finish the cycle here.
                let roots = exchange.roots.take().unwrap_or_default();
                drop(exchange);
                return self.shared.heap.lock().collect(&roots, self.shared.compact);
            }
            self.shared.signal.wait_for(&mut exchange, self.shared.poll);
        }
    }

    pub fn stats(&self) -> GcStats {
        let heap = self.shared.heap.lock();
        GcStats {
            live_objects: heap.live_objects(),
            outstanding_bytes: heap.outstanding_bytes(),
            ..self.stats
        }
    }

    pub fn runs_in_background(&self) -> bool {
        self.has_worker()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.signal.notify_all();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("collector thread panicked");
            }
        }
    }
}

impl Shared {
    fn rearm(&self, survivors: usize) {
        let next = self.threshold.max(survivors.saturating_mul(2));
        self.trigger.store(next, Ordering::Release);
        self.pending.store(false, Ordering::Release);
    }
}

fn worker_loop(shared: &Shared) {
    let mut exchange = shared.exchange.lock();
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Some(roots) = exchange.roots.take() {
            drop(exchange);
            let report = shared.heap.lock().collect(&roots, shared.compact);
            trace!(swept = report.swept.len(), "worker cycle done");
            exchange = shared.exchange.lock();
            exchange.report = Some(report);
            shared.signal.notify_all();
            continue;
        }
        let outstanding = shared.heap.lock().outstanding_bytes();
        let trigger = shared.trigger.load(Ordering::Acquire);
        if outstanding >= trigger && !shared.pending.swap(true, Ordering::AcqRel) {
            trace!(outstanding, "collection requested");
        }
        shared.signal.wait_for(&mut exchange, shared.poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Value;

    fn config(background: bool, threshold_bytes: usize) -> GcConfig {
        GcConfig {
            threshold_bytes,
            background,
            poll_interval_ms: 1,
            compact: false,
        }
    }

    #[test]
    fn inline_collector_reports_pending_past_threshold() {
        let collector = Collector::new(&config(false, 64));
        assert!(!collector.collection_pending());
        collector.allocate(HeapObject::Array(vec![Value::Int(1); 8]));
        assert!(collector.collection_pending());
    }

    #[test]
    fn background_worker_raises_the_flag_and_collects() {
        let mut collector = Collector::new(&config(true, 64));
        let (kept, _) = collector.allocate(HeapObject::Cell(Value::Null));
        collector.allocate(HeapObject::Array(vec![Value::Int(1); 8]));
        let mut waited = 0;
        while !collector.collection_pending() && waited < 2000 {
            thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
        assert!(collector.collection_pending());
        let report = collector.collect(vec![kept]);
        assert_eq!(report.swept.len(), 1);
        assert!(collector.heap().contains(kept));
        assert_eq!(collector.stats().cycles, 1);
    }
}
