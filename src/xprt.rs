//! Server transports.
//!
//! An [`Xprt`] is one endpoint or one accepted connection. Reference counting
//! is carried by `Arc`: requests hold a strong reference to their transport,
//! transports never hold requests, so no cycle exists.

use std::any::Any;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quanta::Instant;
use socket2::Socket;

use crate::proto::Proto;
use crate::svc::XprtStat;
use crate::type_alias::*;

static NEXT_XPRT_ID: AtomicU64 = AtomicU64::new(1);

/// Default private data attached to accepted connections. External
/// collaborators may replace it with richer state via the user-data slot.
#[derive(Debug, Default)]
pub struct XprtPrivate {
    pub flags: u32,
}

/// Address family of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XprtFamily {
    Inet4,
    Inet6,
    Vsock,
    Rdma,
}

/// Role of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XprtRole {
    /// Connectionless endpoint; every readiness event is a message.
    Datagram,

    /// Listening endpoint; every readiness event is an accepted connection.
    Rendezvous,

    /// Accepted child of a rendezvous.
    Connected,
}

/// One endpoint or accepted connection.
pub struct Xprt {
    id: XprtId,
    fd: RawFd,
    family: XprtFamily,
    role: XprtRole,
    proto: Proto,

    /// Owned socket, present for everything but RDMA endpoints (whose fd is
    /// owned by the wire library).
    sock: Option<Socket>,

    /// Rendezvous this connection was accepted from.
    parent: Option<Arc<Xprt>>,

    /// Private per-connection data slot.
    user_data: Mutex<Option<Box<dyn Any + Send>>>,

    /// Duplicate-request cache slot, filled lazily on first request.
    drc: Mutex<Option<Arc<dyn Any + Send + Sync>>>,

    /// Last time the reactor saw activity, for the idle sweep.
    last_active: Mutex<Instant>,
}

impl Xprt {
    fn new(
        fd: RawFd,
        family: XprtFamily,
        role: XprtRole,
        proto: Proto,
        sock: Option<Socket>,
        parent: Option<Arc<Xprt>>,
    ) -> Self {
        Self {
            id: NEXT_XPRT_ID.fetch_add(1, Ordering::Relaxed),
            fd,
            family,
            role,
            proto,
            sock,
            parent,
            user_data: Mutex::new(None),
            drc: Mutex::new(None),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Build a datagram endpoint over `sock`.
    pub fn datagram(sock: Socket, family: XprtFamily, proto: Proto) -> Arc<Self> {
        let fd = sock.as_raw_fd();
        Arc::new(Self::new(fd, family, XprtRole::Datagram, proto, Some(sock), None))
    }

    /// Build a listening endpoint over `sock`.
    pub fn rendezvous(sock: Socket, family: XprtFamily, proto: Proto) -> Arc<Self> {
        let fd = sock.as_raw_fd();
        Arc::new(Self::new(fd, family, XprtRole::Rendezvous, proto, Some(sock), None))
    }

    /// Build an RDMA rendezvous around a library-owned fd.
    pub fn rdma(fd: RawFd, proto: Proto) -> Arc<Self> {
        Arc::new(Self::new(fd, XprtFamily::Rdma, XprtRole::Rendezvous, proto, None, None))
    }

    /// Wrap a connection accepted from `parent`.
    pub fn connected(sock: Socket, parent: &Arc<Xprt>) -> Arc<Self> {
        let fd = sock.as_raw_fd();
        Arc::new(Self::new(
            fd,
            parent.family,
            XprtRole::Connected,
            parent.proto,
            Some(sock),
            Some(Arc::clone(parent)),
        ))
    }

    /// Accept one pending connection on a rendezvous.
    ///
    /// # Panics
    ///
    /// Panics if called on a non-rendezvous transport.
    pub fn accept(&self) -> io::Result<Socket> {
        assert_eq!(self.role, XprtRole::Rendezvous);
        let sock = self
            .sock
            .as_ref()
            .expect("rendezvous without an owned socket")
            .accept()
            .map(|(sock, _addr)| sock)?;
        sock.set_nonblocking(true)?;
        Ok(sock)
    }
}

impl Xprt {
    #[inline]
    pub fn id(&self) -> XprtId {
        self.id
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn family(&self) -> XprtFamily {
        self.family
    }

    #[inline]
    pub fn role(&self) -> XprtRole {
        self.role
    }

    #[inline]
    pub fn proto(&self) -> Proto {
        self.proto
    }

    #[inline]
    pub fn parent(&self) -> Option<&Arc<Xprt>> {
        self.parent.as_ref()
    }

    /// Borrow the owned socket, if any.
    #[inline]
    pub fn socket(&self) -> Option<&Socket> {
        self.sock.as_ref()
    }

    /// Replace the private per-connection data.
    pub fn set_user_data(&self, data: Box<dyn Any + Send>) {
        *self.user_data.lock().unwrap() = Some(data);
    }

    /// Take the private per-connection data out of the slot.
    pub fn take_user_data(&self) -> Option<Box<dyn Any + Send>> {
        self.user_data.lock().unwrap().take()
    }

    /// Install the DRC slot on first use; later calls keep the first value.
    pub fn init_drc<F>(&self, make: F) -> Arc<dyn Any + Send + Sync>
    where
        F: FnOnce() -> Arc<dyn Any + Send + Sync>,
    {
        let mut slot = self.drc.lock().unwrap();
        slot.get_or_insert_with(make).clone()
    }

    #[inline]
    pub fn drc(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.drc.lock().unwrap().clone()
    }

    /// Record reactor activity on this transport.
    pub(crate) fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    /// Seconds since the reactor last saw activity.
    pub(crate) fn idle_secs(&self) -> u64 {
        self.last_active.lock().unwrap().elapsed().as_secs()
    }

    /// Destructor hook: release the DRC slot and private data.
    ///
    /// Idempotent; the reactor runs it once when dropping the transport,
    /// teardown paths may run it again. The returned status flows back
    /// through the transport-status machinery.
    pub fn free_user_data(&self) -> XprtStat {
        // The DRC itself is owned by its external cache; dropping our Arc
        // returns this connection's hold on it.
        let _ = self.drc.lock().unwrap().take();
        let _ = self.take_user_data();
        XprtStat::Destroyed
    }
}

impl std::fmt::Debug for Xprt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xprt")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("family", &self.family)
            .field("role", &self.role)
            .field("proto", &self.proto)
            .finish()
    }
}
