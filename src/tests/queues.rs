//! Queue, classification, splice and waitlist behavior.

use super::*;
use crate::queue::{ReqQueue, ReqQueues, WaitEntry};

/// Never parks: the queues are expected to hold a request already.
fn dequeue_now(queues: &ReqQueues) -> Option<Arc<Req>> {
    let wqe = Arc::new(WaitEntry::new());
    queues.dequeue(&wqe, || true)
}

#[test]
fn mount_classification() {
    let queues = ReqQueues::new();
    queues.enqueue(test_req(1, ReqKind::NfsRequest, Lookahead::MOUNT));

    assert_eq!(queues.queue_sizes(), [1, 0, 0, 0]);

    let req = dequeue_now(&queues).unwrap();
    assert_eq!(req.header().xid, 1);
    assert_eq!(queues.queue_sizes(), [0, 0, 0, 0]);
}

#[test]
fn high_latency_classification() {
    let queues = ReqQueues::new();
    queues.enqueue(test_req(2, ReqKind::NfsRequest, Lookahead::WRITE));

    assert_eq!(queues.queue_sizes(), [0, 0, 0, 1]);
}

#[test]
fn call_and_9p_classification() {
    let queues = ReqQueues::new();
    queues.enqueue(test_req(3, ReqKind::NfsCall, Lookahead::empty()));
    queues.enqueue(test_req(4, ReqKind::NineP, Lookahead::empty()));

    assert_eq!(queues.queue_sizes(), [0, 1, 1, 0]);
}

/// A codec that leaves the lookahead empty routes to the low-latency queue.
#[test]
fn empty_lookahead_defaults_low_latency() {
    let queues = ReqQueues::new();
    queues.enqueue(test_req(5, ReqKind::NfsRequest, Lookahead::empty()));

    assert_eq!(queues.queue_sizes(), [0, 0, 1, 0]);
}

#[test]
fn splice_moves_producer_wholesale() {
    let queues = ReqQueues::new();
    for xid in 1..=5 {
        queues.enqueue(test_req(xid, ReqKind::NfsRequest, Lookahead::empty()));
    }
    assert_eq!(queues.subqueue_sizes(ReqQueue::LowLatency), (5, 0));

    // First dequeue sees an empty consumer and splices all five over.
    let first = dequeue_now(&queues).unwrap();
    assert_eq!(first.header().xid, 1);
    assert_eq!(queues.subqueue_sizes(ReqQueue::LowLatency), (0, 4));

    // Second dequeue pops without a splice.
    let second = dequeue_now(&queues).unwrap();
    assert_eq!(second.header().xid, 2);
    assert_eq!(queues.subqueue_sizes(ReqQueue::LowLatency), (0, 3));

    // Remaining requests keep insertion order.
    for expect in 3..=5 {
        assert_eq!(dequeue_now(&queues).unwrap().header().xid, expect);
    }
}

#[test]
fn conservation_and_no_duplication() {
    let queues = Arc::new(ReqQueues::new());
    const N: u32 = 200;

    let producers: Vec<_> = (0..4u32)
        .map(|t| {
            let queues = Arc::clone(&queues);
            thread::spawn(move || {
                for i in 0..N / 4 {
                    let xid = t * (N / 4) + i + 1;
                    let lookahead = match xid % 3 {
                        0 => Lookahead::MOUNT,
                        1 => Lookahead::COMMIT,
                        _ => Lookahead::empty(),
                    };
                    queues.enqueue(test_req(xid, ReqKind::NfsRequest, lookahead));
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(queues.enqueued_reqs(), N);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..N {
        let req = dequeue_now(&queues).expect("conservation violated: missing request");
        assert!(seen.insert(req.header().xid), "request dequeued twice");
    }
    assert!(dequeue_now(&queues).is_none());

    assert_eq!(queues.dequeued_reqs(), N);
    assert_eq!(queues.queue_sizes(), [0, 0, 0, 0]);
    assert_eq!(
        queues.enqueued_reqs() - queues.dequeued_reqs(),
        queues.queue_sizes().iter().sum::<u32>()
    );
}

/// Three parked workers, one enqueue: exactly one handoff.
#[test]
fn single_waiter_handoff() {
    let queues = Arc::new(ReqQueues::new());
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let queues = Arc::clone(&queues);
            let stop = Arc::clone(&stop);
            let tx = tx.clone();
            thread::spawn(move || {
                let wqe = Arc::new(WaitEntry::new());
                if let Some(req) = queues.dequeue(&wqe, || stop.load(Ordering::SeqCst)) {
                    let _ = tx.send(req.header().xid);
                }
            })
        })
        .collect();

    assert!(
        wait_for(Duration::from_secs(2), || queues.waiters() == 3),
        "workers never parked"
    );

    queues.enqueue(test_req(7, ReqKind::NfsRequest, Lookahead::empty()));

    // Exactly one worker wakes with the request.
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(queues.waiters(), 2);
    assert_eq!(queues.waitlist_len(), 2);

    // Wake the remaining workers so the join doesn't ride out a wait tick.
    stop.store(true, Ordering::SeqCst);
    queues.enqueue(test_req(8, ReqKind::NfsRequest, Lookahead::empty()));
    queues.enqueue(test_req(9, ReqKind::NfsRequest, Lookahead::empty()));
    for w in workers {
        w.join().unwrap();
    }
}

/// A worker cancelled while parked unlinks itself and leaves
/// `waiters == count(list)`.
#[test]
fn cancelled_waiter_unlinks() {
    let queues = Arc::new(ReqQueues::new());
    let stop = Arc::new(AtomicBool::new(false));

    let worker = {
        let queues = Arc::clone(&queues);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let wqe = Arc::new(WaitEntry::new());
            let out = queues.dequeue(&wqe, || stop.load(Ordering::SeqCst));
            assert!(out.is_none());
            assert_eq!(wqe.waiters(), 0);
        })
    };

    assert!(wait_for(Duration::from_secs(2), || queues.waiters() == 1));
    stop.store(true, Ordering::SeqCst);
    worker.join().unwrap();

    assert_eq!(queues.waiters(), 0);
    assert_eq!(queues.waitlist_len(), 0);
}

/// A wait entry survives a cancel and can park again.
#[test]
fn wait_entry_reusable_after_cancel() {
    let queues = Arc::new(ReqQueues::new());
    let wqe = Arc::new(WaitEntry::new());

    assert!(queues.dequeue(&wqe, || true).is_none());

    queues.enqueue(test_req(9, ReqKind::NfsRequest, Lookahead::empty()));
    let req = queues.dequeue(&wqe, || false).unwrap();
    assert_eq!(req.header().xid, 9);
}

#[test]
fn round_robin_visits_all_queues() {
    let queues = ReqQueues::new();
    queues.enqueue(test_req(1, ReqKind::NfsRequest, Lookahead::MOUNT));
    queues.enqueue(test_req(2, ReqKind::NfsCall, Lookahead::empty()));
    queues.enqueue(test_req(3, ReqKind::NfsRequest, Lookahead::empty()));
    queues.enqueue(test_req(4, ReqKind::NfsRequest, Lookahead::READ));

    let mut xids: Vec<_> = (0..4)
        .map(|_| dequeue_now(&queues).unwrap().header().xid)
        .collect();
    xids.sort_unstable();
    assert_eq!(xids, vec![1, 2, 3, 4]);
    assert_eq!(queues.queue_sizes(), [0, 0, 0, 0]);
}

#[test]
fn outstanding_estimator_samples_every_tenth_call() {
    let queues = ReqQueues::new();
    for xid in 1..=3 {
        queues.enqueue(test_req(xid, ReqKind::NfsRequest, Lookahead::empty()));
    }

    // First call recomputes.
    assert_eq!(queues.outstanding_reqs_est(), 3);

    queues.enqueue(test_req(4, ReqKind::NfsRequest, Lookahead::empty()));
    queues.enqueue(test_req(5, ReqKind::NfsRequest, Lookahead::empty()));

    // Calls 2..=10 return the cached sample.
    for _ in 0..9 {
        assert_eq!(queues.outstanding_reqs_est(), 3);
    }
    // The 11th call recomputes.
    assert_eq!(queues.outstanding_reqs_est(), 5);
}

#[test]
fn stall_queue_bookkeeping() {
    let queues = ReqQueues::new();
    let a = test_xprt();
    let b = test_xprt();

    queues.stallq().stall(Arc::clone(&a));
    queues.stallq().stall(Arc::clone(&b));
    assert_eq!(queues.stallq().stalled(), 2);

    assert!(queues.stallq().unstall(&a));
    assert!(!queues.stallq().unstall(&a));
    assert_eq!(queues.stallq().stalled(), 1);

    assert!(queues.stallq().unstall(&b));
    assert_eq!(queues.stallq().stalled(), 0);
}

#[test]
fn enqueue_stamps_request() {
    let queues = ReqQueues::new();
    queues.enqueue(test_req(11, ReqKind::NfsRequest, Lookahead::empty()));

    let req = dequeue_now(&queues).unwrap();
    assert!(req.queued_for().is_some());
}
