//! Protocol capability table and request handler registry.

use std::sync::Arc;

use crate::config::{CoreConfig, CoreOptions};
use crate::request::Req;
use crate::type_alias::*;

/// ONC RPC program numbers served by this core.
pub const NFS_PROGRAM: Program = 100_003;
pub const MNT_PROGRAM: Program = 100_005;
pub const NLM_PROGRAM: Program = 100_021;
pub const RQUOTA_PROGRAM: Program = 100_011;

pub const NFS_V2: Vers = 2;
pub const NFS_V3: Vers = 3;
pub const NFS_V4: Vers = 4;
pub const MOUNT_V1: Vers = 1;
pub const MOUNT_V3: Vers = 3;
pub const NLM4_VERS: Vers = 4;
pub const RQUOTAVERS: Vers = 1;
pub const EXT_RQUOTAVERS: Vers = 2;

/// Protocols with endpoints of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Nfs,
    Mnt,
    Nlm,
    Rquota,
    NfsVsock,
    NfsRdma,
}

impl Proto {
    pub const COUNT: usize = 6;

    /// The four protocols that get UDP+TCP inet endpoints.
    pub const INET: [Proto; 4] = [Proto::Nfs, Proto::Mnt, Proto::Nlm, Proto::Rquota];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn tag(self) -> &'static str {
        match self {
            Proto::Nfs => "NFS",
            Proto::Mnt => "MNT",
            Proto::Nlm => "NLM",
            Proto::Rquota => "RQUOTA",
            Proto::NfsVsock => "NFS_VSOCK",
            Proto::NfsRdma => "NFS_RDMA",
        }
    }

    /// Return `true` if this protocol should get endpoints under `cfg`.
    ///
    /// MOUNT and NLM only exist in NFSv3 environments; NLM and RQUOTA have
    /// their own enable switches; NFS itself is always on.
    pub fn enabled(self, cfg: &CoreConfig) -> bool {
        let nfsv3 = cfg.core_options.contains(CoreOptions::NFSV3);
        match self {
            Proto::Nfs => true,
            Proto::Mnt => nfsv3,
            Proto::Nlm => nfsv3 && cfg.enable_nlm,
            Proto::Rquota => cfg.enable_rquota,
            Proto::NfsVsock => cfg.core_options.contains(CoreOptions::NFS_VSOCK),
            Proto::NfsRdma => cfg.core_options.contains(CoreOptions::NFS_RDMA),
        }
    }
}

/// Per-protocol capability record: the data that differentiates the shared
/// rendezvous/process callbacks.
#[derive(Debug)]
pub struct ProtoCap {
    pub proto: Proto,
    pub tag: &'static str,
    pub program: Program,
    pub versions: &'static [Vers],
}

static CAPS: [ProtoCap; Proto::COUNT] = [
    ProtoCap {
        proto: Proto::Nfs,
        tag: "NFS",
        program: NFS_PROGRAM,
        versions: &[NFS_V3, NFS_V4],
    },
    ProtoCap {
        proto: Proto::Mnt,
        tag: "MNT",
        program: MNT_PROGRAM,
        versions: &[MOUNT_V1, MOUNT_V3],
    },
    ProtoCap {
        proto: Proto::Nlm,
        tag: "NLM",
        program: NLM_PROGRAM,
        versions: &[NLM4_VERS],
    },
    ProtoCap {
        proto: Proto::Rquota,
        tag: "RQUOTA",
        program: RQUOTA_PROGRAM,
        versions: &[RQUOTAVERS, EXT_RQUOTAVERS],
    },
    // vsock and RDMA endpoints speak plain NFS.
    ProtoCap {
        proto: Proto::NfsVsock,
        tag: "NFS_VSOCK",
        program: NFS_PROGRAM,
        versions: &[NFS_V3, NFS_V4],
    },
    ProtoCap {
        proto: Proto::NfsRdma,
        tag: "NFS_RDMA",
        program: NFS_PROGRAM,
        versions: &[NFS_V3, NFS_V4],
    },
];

/// Look up the capability record for a protocol.
#[inline]
pub fn capability(proto: Proto) -> &'static ProtoCap {
    &CAPS[proto.index()]
}

/// Protocol handler invoked by a worker thread for one dequeued request.
pub type ReqHandler = Arc<dyn Fn(&Req) + Send + Sync + 'static>;

/// Registry of protocol handlers, indexed by protocol tag.
#[derive(Default)]
pub struct HandlerTable {
    handlers: [Option<ReqHandler>; Proto::COUNT],
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for a protocol.
    pub fn set<H>(&mut self, proto: Proto, handler: H) -> &mut Self
    where
        H: Fn(&Req) + Send + Sync + 'static,
    {
        self.handlers[proto.index()] = Some(Arc::new(handler));
        self
    }

    /// Return the handler for a protocol, if installed.
    #[inline]
    pub fn get(&self, proto: Proto) -> Option<ReqHandler> {
        self.handlers[proto.index()].clone()
    }
}
