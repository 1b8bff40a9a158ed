//! Contracts of the consumed RPC wire library.
//!
//! The dispatch core never parses XDR or frames bytes itself; it drives an
//! external wire library through the traits below. Production wires the real
//! library in; tests substitute scripted mocks.

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::config::RdmaAttrs;
use crate::request::Req;
use crate::type_alias::*;
use crate::xprt::Xprt;

/// Transport status as reported by the wire library after each operation.
///
/// Ordered: anything at or above [`XprtStat::Died`] means the reactor must
/// release the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum XprtStat {
    /// Nothing pending on the transport.
    Idle,
    /// More input is ready for dispatch.
    Dispatch,
    /// The peer is gone; stop servicing the transport.
    Died,
    /// The transport has been torn down.
    Destroyed,
}

impl fmt::Display for XprtStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            XprtStat::Idle => "XPRT_IDLE",
            XprtStat::Dispatch => "XPRT_DISPATCH",
            XprtStat::Died => "XPRT_DIED",
            XprtStat::Destroyed => "XPRT_DESTROYED",
        };
        f.write_str(s)
    }
}

/// Authentication verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStat {
    Ok,
    BadCred,
    RejectedCred,
    BadVerf,
    RejectedVerf,
    TooWeak,
    InvalidResponse,
    Failed,
}

impl fmt::Display for AuthStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthStat::Ok => "AUTH_OK",
            AuthStat::BadCred => "AUTH_BADCRED",
            AuthStat::RejectedCred => "AUTH_REJECTEDCRED",
            AuthStat::BadVerf => "AUTH_BADVERF",
            AuthStat::RejectedVerf => "AUTH_REJECTEDVERF",
            AuthStat::TooWeak => "AUTH_TOOWEAK",
            AuthStat::InvalidResponse => "AUTH_INVALIDRESP",
            AuthStat::Failed => "AUTH_FAILED",
        };
        f.write_str(s)
    }
}

/// Opaque per-message codec state (the XDR stream of the wire library).
///
/// Dropping it releases whatever the library allocated for the message.
pub type CodecStream = Box<dyn Any + Send>;

/// Decoded RPC call header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcHeader {
    /// Transaction id.
    pub xid: Xid,

    /// Program number.
    pub program: Program,

    /// Program version.
    pub version: Vers,

    /// Procedure number.
    pub procedure: u32,

    /// Credential flavor carried by the call.
    pub cred_flavor: u32,
}

bitflags! {
    /// Classification hints filled by the partial decoder.
    ///
    /// The codec MUST fill these before returning from `decode`; when it
    /// leaves them empty, classification falls back to the low-latency queue.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Lookahead: u32 {
        const MOUNT   = 1 << 0;
        const OPEN    = 1 << 1;
        const CLOSE   = 1 << 2;
        const READ    = 1 << 3;
        const WRITE   = 1 << 4;
        const COMMIT  = 1 << 5;
        const LAYOUT  = 1 << 6;
        const READDIR = 1 << 7;
    }
}

impl Lookahead {
    /// Return `true` if the hinted operation is expected to hold a worker
    /// for a long time.
    #[inline]
    pub fn high_latency(self) -> bool {
        self.intersects(
            Lookahead::READ | Lookahead::WRITE | Lookahead::COMMIT
                | Lookahead::LAYOUT | Lookahead::READDIR,
        )
    }
}

/// Result of asking the codec to pull one framed message off a transport.
pub enum RecvOutcome {
    /// One complete message; decode it.
    Message(CodecStream),

    /// Nothing more to read right now.
    Idle,

    /// The peer is gone; the reactor should drop the transport.
    Died,
}

/// Result of parsing the RPC call header of one message.
pub enum DecodeOutcome {
    /// Header parsed; dispatch continues with the given classification hints.
    Call(RpcHeader, Lookahead),

    /// The library consumed the message internally (malformed input,
    /// reply already emitted, ...). Carries the resulting transport status.
    Consumed(XprtStat),
}

/// Network identities understood by the portmapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetId {
    Udp4,
    Tcp4,
    Udp6,
    Tcp6,
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetId::Udp4 => "udp",
            NetId::Tcp4 => "tcp",
            NetId::Udp6 => "udp6",
            NetId::Tcp6 => "tcp6",
        };
        f.write_str(s)
    }
}

/// Parameters handed to the wire library at initialization.
#[derive(Debug, Clone, Default)]
pub struct SvcInitParams {
    pub max_connections: u32,
    /// Depth of each channel's readiness event queue.
    pub max_events: u32,
    /// Total number of event channels the core will run.
    pub channels: u32,
    pub idle_timeout_s: u32,
    pub ioq_send_max: u32,
    pub ioq_thrd_max: u32,
    /// Deferment bound for the library's decoder pool when it saturates.
    pub decoder_block_timeout_s: u32,
    pub gss_ctx_hash_partitions: u32,
    pub gss_max_ctx: u32,
    pub gss_max_gc: u32,
}

/// Errors surfaced by startup, registration and teardown paths.
#[derive(Debug, Error)]
pub enum SvcError {
    #[error("missing netconfig entry for {0}")]
    MissingNetconfig(NetId),

    #[error("wire library initialization failed: {0}")]
    Init(String),

    #[error("cannot allocate {tag}/{kind} socket: {source}")]
    SocketAlloc {
        tag: &'static str,
        kind: &'static str,
        source: io::Error,
    },

    #[error("cannot bind {tag}/{kind} socket: {source}")]
    SocketBind {
        tag: &'static str,
        kind: &'static str,
        source: io::Error,
    },

    #[error("cannot register program {program} v{vers} on {net}")]
    Register {
        program: Program,
        vers: Vers,
        net: NetId,
    },

    #[error("GSS error: {0}")]
    Gss(String),

    #[error("the wire library provides no RDMA transport")]
    RdmaUnsupported,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The wire library surface consumed by the dispatch core.
///
/// Implementations own framing, XDR, authentication mechanics and reply
/// emission. All methods are invoked from reactor threads; `Req` values are
/// exclusively owned by the calling stage at that point.
pub trait WireCodec: Send + Sync + 'static {
    /// One-time library initialization (allocator/log overrides, event
    /// management mode, channel limits).
    fn init(&self, _params: &SvcInitParams) -> Result<(), SvcError> {
        Ok(())
    }

    /// Pull the next framed message off the transport, if any.
    fn recv(&self, xprt: &Arc<Xprt>) -> RecvOutcome;

    /// Parse the RPC call header of the message carried by `req`.
    fn decode(&self, req: &mut Req) -> DecodeOutcome;

    /// Run authentication for the decoded call.
    ///
    /// Sets `no_dispatch` to `true` when the message was an internal
    /// security-context negotiation that must not reach a worker.
    fn authenticate(&self, req: &Req, no_dispatch: &mut bool) -> AuthStat;

    /// Verify the message checksum and decode the argument area.
    fn checksum(&self, req: &mut Req) -> bool;

    /// Release a decoded argument area after a checksum failure.
    fn free_args(&self, req: &mut Req);

    /// Emit an authentication-rejection reply on the request's transport.
    fn reply_auth_err(&self, req: &Req, why: AuthStat) -> XprtStat;

    /// Emit a decode-error reply on the request's transport.
    fn reply_decode_err(&self, req: &Req) -> XprtStat;

    /// Refresh the status of a transport.
    fn stat(&self, xprt: &Xprt) -> XprtStat;

    /// Create an RDMA rendezvous endpoint, returning its pollable fd.
    fn rdma_create(&self, _attrs: &RdmaAttrs) -> Result<std::os::fd::RawFd, SvcError> {
        Err(SvcError::RdmaUnsupported)
    }
}

/// Portmapper/rpcbind client used only around startup and shutdown.
pub trait Portmap: Send + Sync + 'static {
    /// Return `true` if the host has a netconfig entry for `net`.
    fn has_netconfig(&self, net: NetId) -> bool;

    fn register(&self, program: Program, vers: Vers, net: NetId) -> Result<(), SvcError>;

    fn unregister(&self, program: Program, vers: Vers, net: NetId);
}

/// GSS credential authority, consulted once at startup when configured.
pub trait GssAuthority: Send + Sync + 'static {
    fn import_principal(&self, principal: &str) -> Result<(), SvcError>;

    /// Acquire service credentials. Failure is reduced capability, not fatal.
    fn acquire_cred(&self) -> Result<(), SvcError>;
}
