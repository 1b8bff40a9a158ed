//! Event channels.
//!
//! Each channel is one reactor thread around a `mio::Poll` instance. The
//! fixed low-numbered channels host listening transports; accepted TCP
//! connections are spread round-robin across the remaining worker channels.
//! Within one channel, callbacks for a single transport are serialized by
//! construction; across channels there is no ordering.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::svc::XprtStat;
use crate::type_alias::*;
use crate::xprt::{Xprt, XprtRole};

/// Channel hosting every UDP datagram listener.
pub const UDP_LISTEN_CHAN: usize = 0;
/// Channel accepting new TCP (and vsock) connections.
pub const TCP_LISTEN_CHAN: usize = 1;
/// Channel accepting new RDMA connections.
pub const RDMA_LISTEN_CHAN: usize = 2;
/// Number of dedicated listener channels.
pub const EVCHAN_SIZE: usize = 3;

/// Worker channels for accepted TCP connections. We don't really want too
/// many, relative to the number of available cores.
pub const N_TCP_EVENT_CHAN: usize = 3;

pub const N_EVENT_CHAN: usize = EVCHAN_SIZE + N_TCP_EVENT_CHAN;

/// Depth of each channel's readiness event queue.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Reactor tick; bounds command latency and idle-sweep granularity.
const POLL_TICK: Duration = Duration::from_secs(1);

const WAKER_TOKEN: Token = Token(0);

/// Readiness callbacks a channel delivers into the dispatch core.
pub(crate) trait ChanSink: Send + Sync + 'static {
    /// A rendezvous transport has pending connections.
    fn on_rendezvous(&self, chan: ChanId, xprt: &Arc<Xprt>) -> XprtStat;

    /// A datagram or connected transport has pending input.
    fn on_ready(&self, chan: ChanId, xprt: &Arc<Xprt>) -> XprtStat;
}

enum ChanCmd {
    Register(Arc<Xprt>),
    Shutdown,
}

/// One reactor channel.
pub(crate) struct EvChannel {
    id: ChanId,
    cmds: SegQueue<ChanCmd>,
    waker: Waker,

    /// Membership list of transports currently registered on this channel.
    members: DashMap<XprtId, Arc<Xprt>, ahash::RandomState>,

    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EvChannel {
    /// Create the channel and start its reactor thread.
    pub fn spawn(
        id: ChanId,
        idle_timeout: Duration,
        sink: Arc<dyn ChanSink>,
    ) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let chan = Arc::new(Self {
            id,
            cmds: SegQueue::new(),
            waker,
            members: DashMap::with_capacity_and_hasher(256, ahash::RandomState::new()),
            thread: Mutex::new(None),
        });

        let handle = thread::Builder::new()
            .name(format!("evchan-{id}"))
            .spawn({
                let chan = Arc::clone(&chan);
                move || chan.run(poll, sink, idle_timeout)
            })?;
        *chan.thread.lock().unwrap() = Some(handle);

        Ok(chan)
    }

    /// Register a transport on this channel from any thread.
    pub fn register_xprt(&self, xprt: Arc<Xprt>) {
        self.cmds.push(ChanCmd::Register(xprt));
        if let Err(e) = self.waker.wake() {
            log::warn!("evchan {}: waker failed: {e}", self.id);
        }
    }

    /// Ask the reactor to drain and exit.
    pub fn signal_shutdown(&self) {
        self.cmds.push(ChanCmd::Shutdown);
        if let Err(e) = self.waker.wake() {
            log::warn!("evchan {}: waker failed: {e}", self.id);
        }
    }

    /// Wait for the reactor thread to exit.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn add_member(&self, poll: &Poll, xprt: Arc<Xprt>) {
        let fd = xprt.fd();
        let token = Token(xprt.id() as usize);
        if let Err(e) =
            poll.registry()
                .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            log::warn!(
                "evchan {}: cannot register fd {} for transport {}: {e}",
                self.id,
                fd,
                xprt.id()
            );
            return;
        }
        log::debug!(
            "evchan {}: registered {:?} transport {} fd {}",
            self.id,
            xprt.role(),
            xprt.id(),
            fd
        );
        self.members.insert(xprt.id(), xprt);
    }

    fn drop_member(&self, poll: &Poll, xprt: &Arc<Xprt>) {
        let fd = xprt.fd();
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
        self.members.remove(&xprt.id());
        let _ = xprt.free_user_data();
    }

    /// Reactor body. Single-threaded; callbacks for one transport never
    /// overlap because only this thread delivers them.
    fn run(self: Arc<Self>, mut poll: Poll, sink: Arc<dyn ChanSink>, idle_timeout: Duration) {
        let mut events = Events::with_capacity(EVENT_QUEUE_DEPTH);
        let mut shutdown = false;

        log::debug!("evchan {}: reactor running", self.id);
        while !shutdown {
            if let Err(e) = poll.poll(&mut events, Some(POLL_TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("evchan {}: poll failed: {e}", self.id);
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }

                let Some(xprt) = self
                    .members
                    .get(&(token.0 as XprtId))
                    .map(|m| Arc::clone(m.value()))
                else {
                    continue;
                };
                xprt.touch();

                let stat = match xprt.role() {
                    XprtRole::Rendezvous => sink.on_rendezvous(self.id, &xprt),
                    XprtRole::Datagram | XprtRole::Connected => sink.on_ready(self.id, &xprt),
                };
                if stat >= XprtStat::Died {
                    log::info!(
                        "evchan {}: transport {} fd {} is {}, releasing",
                        self.id,
                        xprt.id(),
                        xprt.fd(),
                        stat
                    );
                    self.drop_member(&poll, &xprt);
                }
            }

            while let Some(cmd) = self.cmds.pop() {
                match cmd {
                    ChanCmd::Register(xprt) => self.add_member(&poll, xprt),
                    ChanCmd::Shutdown => shutdown = true,
                }
            }

            if !idle_timeout.is_zero() {
                self.sweep_idle(&poll, idle_timeout);
            }
        }

        // Drain membership so transports drop with the channel.
        let remaining: Vec<_> = self.members.iter().map(|m| Arc::clone(m.value())).collect();
        for xprt in remaining {
            self.drop_member(&poll, &xprt);
        }
        log::debug!("evchan {}: reactor exited", self.id);
    }

    /// Close connected transports that stayed silent past the idle timeout.
    fn sweep_idle(&self, poll: &Poll, idle_timeout: Duration) {
        let idle: Vec<_> = self
            .members
            .iter()
            .filter(|m| {
                m.value().role() == XprtRole::Connected
                    && m.value().idle_secs() >= idle_timeout.as_secs()
            })
            .map(|m| Arc::clone(m.value()))
            .collect();
        for xprt in idle {
            log::info!(
                "evchan {}: closing idle transport {} fd {}",
                self.id,
                xprt.id(),
                xprt.fd()
            );
            self.drop_member(poll, &xprt);
        }
    }
}
