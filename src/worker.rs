//! Blocking worker pool.
//!
//! Workers dequeue requests and run the protocol handler resolved at decode
//! time. Shutdown is cooperative: each worker observes the stop flag at its
//! next waitlist wakeup, within one wait tick.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use quanta::Instant;

use crate::queue::{ReqQueues, WaitEntry};

/// At least this many workers stay alive regardless of idle retirement.
const MIN_WORKERS: u32 = 1;

pub(crate) struct WorkerPool {
    stop: Arc<AtomicBool>,
    live: Arc<AtomicU32>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `count` workers (at least one) over the shared queues.
    ///
    /// Idle workers above the minimum retire after `idle_expire`.
    pub fn spawn(queues: Arc<ReqQueues>, count: u32, idle_expire: Duration) -> Self {
        let count = count.max(MIN_WORKERS);
        let stop = Arc::new(AtomicBool::new(false));
        let live = Arc::new(AtomicU32::new(count));

        let mut threads = Vec::with_capacity(count as usize);
        for ix in 0..count {
            let queues = Arc::clone(&queues);
            let stop = Arc::clone(&stop);
            let live = Arc::clone(&live);
            threads.push(
                thread::Builder::new()
                    .name(format!("req-worker-{ix}"))
                    .spawn(move || worker_main(ix, queues, stop, live, idle_expire))
                    .expect("failed to spawn worker thread"),
            );
        }

        Self {
            stop,
            live,
            threads: Mutex::new(threads),
        }
    }

    /// Number of workers still running.
    pub fn live(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    /// Request cooperative stop and join every worker.
    pub fn stop_and_join(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_main(
    ix: u32,
    queues: Arc<ReqQueues>,
    stop: Arc<AtomicBool>,
    live: Arc<AtomicU32>,
    idle_expire: Duration,
) {
    log::debug!("worker {ix}: started");
    let wqe = Arc::new(WaitEntry::new());

    loop {
        let idle_since = Instant::now();
        let may_retire = !idle_expire.is_zero();
        let should_break = || {
            stop.load(Ordering::Relaxed)
                || (may_retire
                    && live.load(Ordering::Relaxed) > MIN_WORKERS
                    && idle_since.elapsed() >= idle_expire)
        };

        match queues.dequeue(&wqe, should_break) {
            Some(req) => match req.handler.clone() {
                Some(handler) => handler(&req),
                None => log::warn!(
                    "worker {ix}: dropping {} request without a handler",
                    req.proto().tag()
                ),
            },
            None => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                // Idle retirement; never let the pool fall below the minimum
                // even when several workers expire together.
                let retired = live
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n > MIN_WORKERS).then(|| n - 1)
                    })
                    .is_ok();
                if retired {
                    log::debug!("worker {ix}: idle past expiration, retiring");
                    return;
                }
            }
        }
    }

    live.fetch_sub(1, Ordering::SeqCst);
    log::debug!("worker {ix}: exiting");
}
