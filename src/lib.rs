//! RPC dispatch and request-queueing core for an NFS-family server.
//!
//! The crate owns listening endpoints, accepts connections, decodes incoming
//! RPC messages through an external wire library, classifies them onto a
//! priority-aware multi-queue, and hands them to a pool of blocking worker
//! threads that run protocol handlers.

mod config;
mod dispatch;
mod endpoint;
mod evchan;
mod proto;
mod queue;
mod request;
mod svc;
pub mod type_alias;
mod worker;
mod xprt;

pub use self::config::{CoreConfig, CoreOptions, GssConfig, RdmaAttrs};
pub use self::dispatch::Dispatcher;
pub use self::evchan::{EVCHAN_SIZE, N_EVENT_CHAN, N_TCP_EVENT_CHAN};
pub use self::proto::{
    capability, HandlerTable, Proto, ProtoCap, ReqHandler, EXT_RQUOTAVERS, MNT_PROGRAM,
    MOUNT_V1, MOUNT_V3, NFS_PROGRAM, NFS_V2, NFS_V3, NFS_V4, NLM4_VERS, NLM_PROGRAM,
    RQUOTAVERS, RQUOTA_PROGRAM,
};
pub use self::queue::{ReqQueue, ReqQueues, StallQueue, WaitEntry};
pub use self::request::{Req, ReqKind};
pub use self::svc::{
    AuthStat, CodecStream, DecodeOutcome, GssAuthority, Lookahead, NetId, Portmap,
    RecvOutcome, RpcHeader, SvcError, SvcInitParams, WireCodec, XprtStat,
};
pub use self::xprt::{Xprt, XprtFamily, XprtPrivate, XprtRole};

#[cfg(test)]
mod tests;
