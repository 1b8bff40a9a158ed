//! Request classification, the four-queue set, and the worker waitlist.
//!
//! Each queue kind is a producer/consumer pair of singly-locked sub-queues;
//! enqueue always appends to the producer, dequeue drains the consumer and
//! splices the whole producer over in O(1) when the consumer runs dry.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::request::{Req, ReqKind};
use crate::svc::Lookahead;
use crate::xprt::Xprt;

/// The four request queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqQueue {
    Mount = 0,
    Call = 1,
    LowLatency = 2,
    HighLatency = 3,
}

pub(crate) const N_REQ_QUEUES: usize = 4;

const QUEUE_NAMES: [&str; N_REQ_QUEUES] = [
    "REQ_Q_MOUNT",
    "REQ_Q_CALL",
    "REQ_Q_LOW_LATENCY",
    "REQ_Q_HIGH_LATENCY",
];

/// How long a parked worker sleeps between cancellation checks.
const WAIT_TICK: Duration = Duration::from_secs(5);

struct SubQueue {
    q: Mutex<VecDeque<Arc<Req>>>,

    /// Mirrors `q.len()`, readable without the lock for the estimator.
    size: AtomicU32,
}

impl SubQueue {
    fn new() -> Self {
        Self {
            q: Mutex::new(VecDeque::new()),
            size: AtomicU32::new(0),
        }
    }
}

struct QueuePair {
    name: &'static str,
    producer: SubQueue,
    consumer: SubQueue,
}

impl QueuePair {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            producer: SubQueue::new(),
            consumer: SubQueue::new(),
        }
    }
}

mod wait_flags {
    /// Worker is parked and waiting for a handoff signal.
    pub const WAIT_SYNC: u8 = 1 << 0;
    /// Producer completed a handoff to this entry.
    pub const SYNC_DONE: u8 = 1 << 1;
}

/// Per-worker wait entry. Each worker owns exactly one, reused across parks.
pub struct WaitEntry {
    state: Mutex<u8>,
    cv: Condvar,

    /// 1 while the entry is published for handoff, else 0.
    waiters: AtomicU32,

    /// `true` iff the entry is on the waitlist. Mutated only under the
    /// waitlist lock, replacing the original's raw link-pointer probe.
    linked: AtomicBool,
}

impl WaitEntry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(0),
            cv: Condvar::new(),
            waiters: AtomicU32::new(0),
            linked: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }
}

impl Default for WaitEntry {
    fn default() -> Self {
        Self::new()
    }
}

struct WaitListInner {
    list: VecDeque<Arc<WaitEntry>>,
    waiters: u32,
}

/// Shared waitlist with exactly-one handoff per enqueue.
struct WaitList {
    inner: Mutex<WaitListInner>,
}

impl WaitList {
    fn new() -> Self {
        Self {
            inner: Mutex::new(WaitListInner {
                list: VecDeque::new(),
                waiters: 0,
            }),
        }
    }
}

/// Transports whose reads are paused for per-connection backpressure.
///
/// Populated by external collaborators; the core owns the list and its lock.
pub struct StallQueue {
    q: Mutex<Vec<Arc<Xprt>>>,
    active: AtomicBool,
    stalled: AtomicU32,
}

impl StallQueue {
    fn new() -> Self {
        Self {
            q: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            stalled: AtomicU32::new(0),
        }
    }

    /// Park a transport on the stall list.
    pub fn stall(&self, xprt: Arc<Xprt>) {
        let mut q = self.q.lock().unwrap();
        q.push(xprt);
        self.stalled.store(q.len() as u32, Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
    }

    /// Remove a transport from the stall list, returning whether it was there.
    pub fn unstall(&self, xprt: &Arc<Xprt>) -> bool {
        let mut q = self.q.lock().unwrap();
        let before = q.len();
        q.retain(|x| !Arc::ptr_eq(x, xprt));
        let found = q.len() != before;
        self.stalled.store(q.len() as u32, Ordering::Relaxed);
        if q.is_empty() {
            self.active.store(false, Ordering::Relaxed);
        }
        found
    }

    #[inline]
    pub fn stalled(&self) -> u32 {
        self.stalled.load(Ordering::Relaxed)
    }

    /// `true` while any transport is stalled.
    #[inline]
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// Shared request-queue state: the four queue pairs, the waitlist, the stall
/// list, and the dispatch counters.
pub struct ReqQueues {
    qset: [QueuePair; N_REQ_QUEUES],
    waitq: WaitList,
    stallq: StallQueue,

    /// Weighted round-robin slot counter for dequeue starts.
    slot: AtomicU32,

    enqueued: AtomicU32,
    dequeued: AtomicU32,

    /// Sampling state of the outstanding-request estimator.
    est_ctr: AtomicU32,
    est_cache: AtomicU32,
}

impl ReqQueues {
    pub fn new() -> Self {
        Self {
            qset: [
                QueuePair::new(QUEUE_NAMES[0]),
                QueuePair::new(QUEUE_NAMES[1]),
                QueuePair::new(QUEUE_NAMES[2]),
                QueuePair::new(QUEUE_NAMES[3]),
            ],
            waitq: WaitList::new(),
            stallq: StallQueue::new(),
            slot: AtomicU32::new(0),
            enqueued: AtomicU32::new(0),
            dequeued: AtomicU32::new(0),
            est_ctr: AtomicU32::new(0),
            est_cache: AtomicU32::new(0),
        }
    }

    /// Classify a request per its kind and lookahead.
    ///
    /// An empty lookahead is a codec that did not fill it; such requests
    /// default to the low-latency queue.
    fn classify(req: &Req) -> ReqQueue {
        match req.kind() {
            ReqKind::NfsRequest => {
                if req.lookahead().contains(Lookahead::MOUNT) {
                    ReqQueue::Mount
                } else if req.lookahead().high_latency() {
                    ReqQueue::HighLatency
                } else {
                    ReqQueue::LowLatency
                }
            }
            ReqKind::NfsCall => ReqQueue::Call,
            ReqKind::NineP => ReqQueue::LowLatency,
        }
    }

    /// Enqueue a request and hand it off to at most one parked worker.
    pub fn enqueue(&self, req: Arc<Req>) {
        let target = Self::classify(&req);
        let qpair = &self.qset[target as usize];

        log::trace!(
            "queue: enter xid={} lookahead={:?}",
            req.header().xid,
            req.lookahead()
        );

        // This one is real, timestamp it.
        req.stamp_queued();

        // Always append to the producer side.
        {
            let mut q = qpair.producer.q.lock().unwrap();
            q.push_back(req);
            qpair.producer.size.store(q.len() as u32, Ordering::Relaxed);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "queue: enqueued on {} (enq {} deq {})",
            qpair.name,
            self.enqueued.load(Ordering::Relaxed),
            self.dequeued.load(Ordering::Relaxed)
        );

        // Release exactly one waiter, if any is parked.
        let wqe = {
            let mut wl = self.waitq.inner.lock().unwrap();
            match wl.list.pop_front() {
                Some(wqe) => {
                    wl.waiters -= 1;
                    wqe.linked.store(false, Ordering::Relaxed);
                    wqe.waiters.store(0, Ordering::Relaxed);
                    Some(wqe)
                }
                None => None,
            }
        };
        if let Some(wqe) = wqe {
            let mut state = wqe.state.lock().unwrap();
            *state |= wait_flags::SYNC_DONE;
            if *state & wait_flags::WAIT_SYNC != 0 {
                wqe.cv.notify_one();
            }
        }
    }

    /// Pop from one queue pair, splicing the producer over when the consumer
    /// is empty. Splice locks consumer THEN producer, never the reverse.
    fn consume(&self, qpair: &QueuePair) -> Option<Arc<Req>> {
        let mut cons = qpair.consumer.q.lock().unwrap();
        if let Some(req) = cons.pop_front() {
            qpair.consumer.size.store(cons.len() as u32, Ordering::Relaxed);
            return Some(req);
        }

        {
            let mut prod = qpair.producer.q.lock().unwrap();
            if prod.is_empty() {
                return None;
            }
            // The consumer is empty here, so a tail-splice of the whole
            // producer is a plain swap, still O(1).
            mem::swap(&mut *cons, &mut *prod);
            qpair.producer.size.store(0, Ordering::Relaxed);
            log::trace!(
                "queue: spliced {} consumer qsize={}",
                qpair.name,
                cons.len()
            );
        }

        let req = cons.pop_front();
        qpair.consumer.size.store(cons.len() as u32, Ordering::Relaxed);
        req
    }

    /// Scan the four queues in rotation, starting at the shared slot.
    fn scan(&self) -> Option<Arc<Req>> {
        let slot = self.slot.fetch_add(1, Ordering::Relaxed) as usize % N_REQ_QUEUES;
        for ix in 0..N_REQ_QUEUES {
            let qpair = &self.qset[(slot + ix) % N_REQ_QUEUES];
            if let Some(req) = self.consume(qpair) {
                self.dequeued.fetch_add(1, Ordering::Relaxed);
                return Some(req);
            }
        }
        None
    }

    /// Dequeue one request, parking on `wqe` while all queues are empty.
    ///
    /// Returns `None` only when `should_break` reports cancellation; the
    /// entry is then guaranteed to be off the waitlist.
    pub fn dequeue<F>(&self, wqe: &Arc<WaitEntry>, should_break: F) -> Option<Arc<Req>>
    where
        F: Fn() -> bool,
    {
        loop {
            if let Some(req) = self.scan() {
                return Some(req);
            }

            // All four queues were empty: publish the wait entry. The entry
            // mutex is held across publication so a producer's signal cannot
            // fire before WAIT_SYNC is visible.
            debug_assert_eq!(wqe.waiters.load(Ordering::Relaxed), 0);
            let mut state = wqe.state.lock().unwrap();
            *state = wait_flags::WAIT_SYNC;
            wqe.waiters.store(1, Ordering::Relaxed);
            {
                let mut wl = self.waitq.inner.lock().unwrap();
                wl.list.push_back(Arc::clone(wqe));
                wqe.linked.store(true, Ordering::Relaxed);
                wl.waiters += 1;
            }

            while *state & wait_flags::SYNC_DONE == 0 {
                if should_break() {
                    // Cancelled while parked: unlink ourselves if the
                    // producer has not already popped the entry.
                    let mut wl = self.waitq.inner.lock().unwrap();
                    if wqe.linked.load(Ordering::Relaxed) {
                        if let Some(pos) =
                            wl.list.iter().position(|e| Arc::ptr_eq(e, wqe))
                        {
                            wl.list.remove(pos);
                        }
                        wl.waiters -= 1;
                        wqe.linked.store(false, Ordering::Relaxed);
                        wqe.waiters.store(0, Ordering::Relaxed);
                        *state = 0;
                    }
                    return None;
                }

                let (next, _timeout) = wqe.cv.wait_timeout(state, WAIT_TICK).unwrap();
                state = next;
            }

            // The signalling producer already unlinked the entry.
            *state = 0;
            drop(state);
            log::trace!("queue: wait entry wakeup");
        }
    }

    #[inline]
    pub fn enqueued_reqs(&self) -> u32 {
        self.enqueued.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dequeued_reqs(&self) -> u32 {
        self.dequeued.load(Ordering::Relaxed)
    }

    /// Estimate of requests currently queued.
    ///
    /// Recomputed only every 10th call; an observability hint, not a
    /// synchronization primitive.
    pub fn outstanding_reqs_est(&self) -> u32 {
        if self.est_ctr.fetch_add(1, Ordering::Relaxed) % 10 != 0 {
            return self.est_cache.load(Ordering::Relaxed);
        }

        let mut total = 0;
        for qpair in &self.qset {
            total += qpair.producer.size.load(Ordering::Relaxed);
            total += qpair.consumer.size.load(Ordering::Relaxed);
        }
        self.est_cache.store(total, Ordering::Relaxed);
        total
    }

    #[inline]
    pub fn stallq(&self) -> &StallQueue {
        &self.stallq
    }

    /// Snapshot of `producer.size + consumer.size` per queue.
    #[cfg(test)]
    pub(crate) fn queue_sizes(&self) -> [u32; N_REQ_QUEUES] {
        let mut sizes = [0; N_REQ_QUEUES];
        for (ix, qpair) in self.qset.iter().enumerate() {
            sizes[ix] = qpair.producer.size.load(Ordering::Relaxed)
                + qpair.consumer.size.load(Ordering::Relaxed);
        }
        sizes
    }

    /// Number of workers currently parked on the waitlist.
    #[cfg(test)]
    pub(crate) fn waiters(&self) -> u32 {
        self.waitq.inner.lock().unwrap().waiters
    }

    #[cfg(test)]
    pub(crate) fn waitlist_len(&self) -> usize {
        self.waitq.inner.lock().unwrap().list.len()
    }

    /// `(producer.size, consumer.size)` of one queue pair.
    #[cfg(test)]
    pub(crate) fn subqueue_sizes(&self, q: ReqQueue) -> (u32, u32) {
        let qpair = &self.qset[q as usize];
        (
            qpair.producer.size.load(Ordering::Relaxed),
            qpair.consumer.size.load(Ordering::Relaxed),
        )
    }
}

impl Default for ReqQueues {
    fn default() -> Self {
        Self::new()
    }
}
