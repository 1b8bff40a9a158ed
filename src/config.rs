//! Dispatch core configuration.
//!
//! Loading these values from files is a front-end concern; the structs below
//! are the contract between that front end and the core.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::proto::Proto;

bitflags! {
    /// Core feature selection bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoreOptions: u32 {
        const NFSV3     = 1 << 0;
        const NFSV4     = 1 << 1;
        const NFS_VSOCK = 1 << 2;
        const NFS_RDMA  = 1 << 3;

        const ALL_NFS_VERS = Self::NFSV3.bits() | Self::NFSV4.bits();
    }
}

// Carried in configuration files as the raw bit value.
impl Serialize for CoreOptions {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CoreOptions {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_bits_retain(u32::deserialize(deserializer)?))
    }
}

/// GSS context cache tuning and service identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GssConfig {
    pub ctx_hash_partitions: u32,
    pub max_ctx: u32,
    pub max_gc: u32,

    /// Service principal to import at startup. `None` disables GSS setup.
    pub principal: Option<String>,
}

impl Default for GssConfig {
    fn default() -> Self {
        Self {
            ctx_hash_partitions: 13,
            max_ctx: 16384,
            max_gc: 400,
            principal: None,
        }
    }
}

/// Attributes handed to the wire library's RDMA rendezvous factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaAttrs {
    pub node: String,
    pub port: String,
    pub sq_depth: u32,
    pub max_send_sge: u32,
    pub rq_depth: u32,
    pub max_recv_sge: u32,
    pub backlog: u32,
    pub credits: u32,
    pub destroy_on_disconnect: bool,
    pub use_srq: bool,
}

impl Default for RdmaAttrs {
    fn default() -> Self {
        Self {
            node: "::".to_owned(),
            port: "20049".to_owned(),
            sq_depth: 32,
            max_send_sge: 32,
            rq_depth: 32,
            max_recv_sge: 31,
            backlog: 10,
            credits: 30,
            destroy_on_disconnect: true,
            use_srq: false,
        }
    }
}

/// Configuration of the dispatch core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Listening port per protocol. A port of 0 lets the kernel choose,
    /// which test setups rely on.
    pub nfs_port: u16,
    pub mnt_port: u16,
    pub nlm_port: u16,
    pub rquota_port: u16,

    pub max_send_buffer_size: u32,
    pub max_recv_buffer_size: u32,
    pub max_connections: u32,

    /// Seconds a connected transport may stay silent before the reactor
    /// closes it.
    pub idle_timeout_s: u32,

    /// Upper bound on the wire library's I/O queue worker threads.
    pub ioq_thrd_max: u32,

    /// Number of request worker threads to start (at least one runs).
    pub nb_workers: u32,

    pub gss: GssConfig,

    pub enable_nlm: bool,
    pub enable_rquota: bool,

    pub enable_tcp_keepalive: bool,
    pub tcp_keepcnt: u32,
    pub tcp_keepidle: u32,
    pub tcp_keepintvl: u32,

    /// Idle workers above the minimum retire after this many seconds.
    pub decoder_fridge_expiration_delay_s: u64,

    /// Deferment bound handed to the wire library's decoder pool at init;
    /// producers in this core never block on queue size.
    pub decoder_fridge_block_timeout_s: u64,

    pub core_options: CoreOptions,

    pub rdma: RdmaAttrs,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            nfs_port: 2049,
            mnt_port: 20048,
            nlm_port: 32803,
            rquota_port: 875,
            max_send_buffer_size: 1 << 20,
            max_recv_buffer_size: 1 << 20,
            max_connections: 1024,
            idle_timeout_s: 300,
            ioq_thrd_max: 200,
            nb_workers: 16,
            gss: GssConfig::default(),
            enable_nlm: true,
            enable_rquota: true,
            enable_tcp_keepalive: false,
            tcp_keepcnt: 0,
            tcp_keepidle: 0,
            tcp_keepintvl: 0,
            decoder_fridge_expiration_delay_s: 600,
            decoder_fridge_block_timeout_s: 600,
            core_options: CoreOptions::ALL_NFS_VERS,
            rdma: RdmaAttrs::default(),
        }
    }
}

impl CoreConfig {
    /// Return the configured port for a protocol.
    #[inline]
    pub fn port(&self, proto: Proto) -> u16 {
        match proto {
            Proto::Nfs | Proto::NfsVsock | Proto::NfsRdma => self.nfs_port,
            Proto::Mnt => self.mnt_port,
            Proto::Nlm => self.nlm_port,
            Proto::Rquota => self.rquota_port,
        }
    }

    /// Return `true` if any NFS protocol version is enabled.
    #[inline]
    pub fn any_nfs_vers(&self) -> bool {
        self.core_options.intersects(CoreOptions::ALL_NFS_VERS)
    }
}
