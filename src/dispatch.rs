//! The dispatcher: startup sequencing, decode and rendezvous callbacks,
//! authentication gating, portmap registration, and shutdown.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::config::{CoreConfig, CoreOptions};
use crate::endpoint::Endpoints;
use crate::evchan::{
    ChanSink, EvChannel, EVCHAN_SIZE, N_EVENT_CHAN, N_TCP_EVENT_CHAN,
};
use crate::proto::{self, capability, HandlerTable, Proto, ProtoCap};
use crate::queue::ReqQueues;
use crate::request::{Req, ReqKind};
use crate::svc::{
    AuthStat, CodecStream, DecodeOutcome, GssAuthority, NetId, Portmap, RecvOutcome,
    SvcError, SvcInitParams, WireCodec, XprtStat,
};
use crate::type_alias::*;
use crate::worker::WorkerPool;
use crate::xprt::{Xprt, XprtFamily, XprtPrivate};

/// Shared state behind every callback: configuration, collaborators, the
/// queues, and the channel set.
pub(crate) struct DispatchCore {
    cfg: CoreConfig,
    codec: Arc<dyn WireCodec>,
    portmap: Arc<dyn Portmap>,
    handlers: HandlerTable,
    queues: Arc<ReqQueues>,

    /// All event channels; listener channels occupy ids `0..EVCHAN_SIZE`.
    chans: OnceLock<Vec<Arc<EvChannel>>>,

    /// Round-robin cursor for assigning accepted connections to worker
    /// channels.
    next_tcp_chan: AtomicU32,
}

impl DispatchCore {
    fn chans(&self) -> &[Arc<EvChannel>] {
        self.chans.get().expect("channels not yet created")
    }

    /// Per-message decode callback. Allocates the request, drives header
    /// parse + authentication + classification, and never runs protocol
    /// handlers inline.
    fn decode_request(&self, xprt: &Arc<Xprt>, stream: CodecStream) -> XprtStat {
        let mut req = Req::new(ReqKind::NfsRequest, Arc::clone(xprt), stream);

        match self.codec.decode(&mut req) {
            DecodeOutcome::Consumed(stat) => {
                log::debug!(
                    "dispatch: decode on transport {} fd {} consumed input ({stat})",
                    xprt.id(),
                    xprt.fd()
                );
            }
            DecodeOutcome::Call(header, lookahead) => {
                req.header = header;
                req.lookahead = lookahead;
                log::debug!(
                    "dispatch: decoded xid={} prog={} vers={} proc={} on fd {}",
                    header.xid,
                    header.program,
                    header.version,
                    header.procedure,
                    xprt.fd()
                );
                self.process_request(req);
            }
        }

        // Refresh status before releasing our request reference.
        self.codec.stat(xprt)
    }

    /// Validate, authenticate and enqueue one decoded call.
    fn process_request(&self, mut req: Req) {
        let cap = capability(req.proto());

        log::trace!(
            "dispatch: about to authenticate prog={} vers={} proc={} xid={}",
            req.header.program,
            req.header.version,
            req.header.procedure,
            req.header.xid
        );

        if req.header.program != cap.program || !cap.versions.contains(&req.header.version) {
            log::info!(
                "dispatch: {} call for unknown program {} v{}, rejecting",
                cap.tag,
                req.header.program,
                req.header.version
            );
            self.codec.reply_decode_err(&req);
            return;
        }
        req.handler = self.handlers.get(req.proto());

        // AUTH_NONE/AUTH_UNIX leave no_dispatch false and the request
        // proceeds. Under RPCSEC_GSS, no_dispatch means the message was an
        // internal negotiation handled (and answered) by the library.
        let mut no_dispatch = false;
        let why = self.codec.authenticate(&req, &mut no_dispatch);
        if why != AuthStat::Ok {
            log::info!("dispatch: could not authenticate xid={}, rejecting with {why}", req.header.xid);
            self.codec.reply_auth_err(&req, why);
            return;
        }
        if no_dispatch {
            return;
        }

        if !self.codec.checksum(&mut req) {
            log::info!(
                "dispatch: checksum failed for prog={} vers={} proc={} xid={}",
                req.header.program,
                req.header.version,
                req.header.procedure,
                req.header.xid
            );
            self.codec.free_args(&mut req);
            self.codec.reply_decode_err(&req);
            return;
        }

        // One reference for the queue; ours drops when this frame returns,
        // after the caller re-samples the transport status.
        let req = Arc::new(req);
        self.queues.enqueue(Arc::clone(&req));
    }

    /// Pull framed messages until the codec reports the transport drained
    /// or dead.
    fn recv_loop(&self, xprt: &Arc<Xprt>) -> XprtStat {
        loop {
            match self.codec.recv(xprt) {
                RecvOutcome::Message(stream) => {
                    let stat = self.decode_request(xprt, stream);
                    if stat >= XprtStat::Died {
                        return stat;
                    }
                }
                RecvOutcome::Idle => return self.codec.stat(xprt),
                RecvOutcome::Died => return XprtStat::Died,
            }
        }
    }
}

impl ChanSink for DispatchCore {
    /// Rendezvous callout: accept pending connections, allocate their
    /// private data, and cycle them across the TCP worker channels.
    fn on_rendezvous(&self, chan: ChanId, xprt: &Arc<Xprt>) -> XprtStat {
        if xprt.family() == XprtFamily::Rdma {
            // The wire library accepts RDMA connections internally; what we
            // see here are inbound messages.
            return self.recv_loop(xprt);
        }

        loop {
            match xprt.accept() {
                Ok(sock) => {
                    let child = Xprt::connected(sock, xprt);
                    // Private data now; the DRC slot waits for the first
                    // request (shared TCP DRC for v3, per-connection for v4).
                    child.set_user_data(Box::new(XprtPrivate::default()));

                    let target = EVCHAN_SIZE
                        + (self.next_tcp_chan.fetch_add(1, Ordering::Relaxed) as usize
                            % N_TCP_EVENT_CHAN);
                    log::debug!(
                        "dispatch: {} connection fd {} accepted on chan {chan}, assigned to chan {target}",
                        xprt.proto().tag(),
                        child.fd()
                    );
                    self.chans()[target].register_xprt(child);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!(
                        "dispatch: accept failed on {} fd {}: {e}",
                        xprt.proto().tag(),
                        xprt.fd()
                    );
                    break;
                }
            }
        }

        self.codec.stat(xprt)
    }

    fn on_ready(&self, _chan: ChanId, xprt: &Arc<Xprt>) -> XprtStat {
        self.recv_loop(xprt)
    }
}

// Portmap registration.
impl DispatchCore {
    fn register_net(&self, cap: &ProtoCap, vers: Vers, net: NetId) -> Result<(), SvcError> {
        log::info!("dispatch: registering {} V{vers}/{net}", cap.tag);
        self.portmap.register(cap.program, vers, net).map_err(|_| {
            SvcError::Register {
                program: cap.program,
                vers,
                net,
            }
        })
    }

    fn register_one(&self, proto: Proto, gate: CoreOptions, vers: Vers) -> Result<(), SvcError> {
        if !self.cfg.core_options.intersects(gate) {
            return Ok(());
        }
        let cap = capability(proto);

        self.register_net(cap, vers, NetId::Udp4)?;
        if self.portmap.has_netconfig(NetId::Udp6) {
            self.register_net(cap, vers, NetId::Udp6)?;
        }

        #[cfg(not(feature = "no-tcp-register"))]
        {
            self.register_net(cap, vers, NetId::Tcp4)?;
            if self.portmap.has_netconfig(NetId::Tcp6) {
                self.register_net(cap, vers, NetId::Tcp6)?;
            }
        }

        Ok(())
    }

    /// Register every enabled (program, version) with the portmapper.
    fn register_programs(&self) -> Result<(), SvcError> {
        #[cfg(feature = "no-portmapper")]
        return Ok(());

        #[cfg(not(feature = "no-portmapper"))]
        {
            self.register_one(Proto::Nfs, CoreOptions::NFSV3, proto::NFS_V3)?;
            self.register_one(Proto::Nfs, CoreOptions::NFSV4, proto::NFS_V4)?;
            self.register_one(Proto::Mnt, CoreOptions::NFSV3, proto::MOUNT_V1)?;
            self.register_one(Proto::Mnt, CoreOptions::NFSV3, proto::MOUNT_V3)?;
            if self.cfg.enable_nlm {
                self.register_one(Proto::Nlm, CoreOptions::NFSV3, proto::NLM4_VERS)?;
            }
            if self.cfg.enable_rquota && self.cfg.any_nfs_vers() {
                self.register_one(
                    Proto::Rquota,
                    CoreOptions::ALL_NFS_VERS,
                    proto::RQUOTAVERS,
                )?;
                self.register_one(
                    Proto::Rquota,
                    CoreOptions::ALL_NFS_VERS,
                    proto::EXT_RQUOTAVERS,
                )?;
            }
            Ok(())
        }
    }

    fn unregister_span(&self, program: Program, vers_lo: Vers, vers_hi: Vers) {
        for vers in vers_lo..=vers_hi {
            self.portmap.unregister(program, vers, NetId::Udp4);
            self.portmap.unregister(program, vers, NetId::Tcp4);
            if self.portmap.has_netconfig(NetId::Udp6) {
                self.portmap.unregister(program, vers, NetId::Udp6);
            }
            if self.portmap.has_netconfig(NetId::Tcp6) {
                self.portmap.unregister(program, vers, NetId::Tcp6);
            }
        }
    }

    /// Drop every portmap entry we may have left behind, stale ones
    /// included.
    fn unregister_programs(&self) {
        if self.cfg.core_options.contains(CoreOptions::NFSV3) {
            self.unregister_span(proto::NFS_PROGRAM, proto::NFS_V2, proto::NFS_V4);
            self.unregister_span(proto::MNT_PROGRAM, proto::MOUNT_V1, proto::MOUNT_V3);
        } else {
            self.unregister_span(proto::NFS_PROGRAM, proto::NFS_V4, proto::NFS_V4);
        }
        if self.cfg.enable_nlm {
            self.unregister_span(proto::NLM_PROGRAM, 1, proto::NLM4_VERS);
        }
        if self.cfg.enable_rquota {
            self.unregister_span(
                proto::RQUOTA_PROGRAM,
                proto::RQUOTAVERS,
                proto::EXT_RQUOTAVERS,
            );
        }
    }
}

/// The dispatch core, owning endpoints, channels, queues and workers.
///
/// One instance per server process; tests build fresh ones at will.
pub struct Dispatcher {
    core: Arc<DispatchCore>,
    endpoints: Mutex<Endpoints>,
    workers: WorkerPool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Bring the dispatch core up, in order: queue state, wire library,
    /// event channels, netconfig, sockets, transports, GSS, portmap.
    ///
    /// Startup failures that leave the server unable to serve return an
    /// error; reduced-capability paths (vsock, IPv6, GSS credentials) log
    /// and continue.
    pub fn init(
        cfg: CoreConfig,
        codec: Arc<dyn WireCodec>,
        portmap: Arc<dyn Portmap>,
        gss: Option<Arc<dyn GssAuthority>>,
        handlers: HandlerTable,
    ) -> Result<Self, SvcError> {
        log::debug!("dispatch: init, core options = {:?}", cfg.core_options);

        // Queue state first, before anything can produce into it.
        let queues = Arc::new(ReqQueues::new());

        let params = SvcInitParams {
            max_connections: cfg.max_connections,
            max_events: 1024,
            channels: N_EVENT_CHAN as u32,
            idle_timeout_s: cfg.idle_timeout_s,
            ioq_send_max: cfg.max_send_buffer_size,
            ioq_thrd_max: cfg.ioq_thrd_max,
            decoder_block_timeout_s: cfg.decoder_fridge_block_timeout_s as u32,
            gss_ctx_hash_partitions: cfg.gss.ctx_hash_partitions,
            gss_max_ctx: cfg.gss.max_ctx,
            gss_max_gc: cfg.gss.max_gc,
        };
        codec.init(&params)?;

        let core = Arc::new(DispatchCore {
            cfg,
            codec,
            portmap,
            handlers,
            queues: Arc::clone(&queues),
            chans: OnceLock::new(),
            next_tcp_chan: AtomicU32::new(0),
        });

        let idle_timeout = Duration::from_secs(core.cfg.idle_timeout_s.into());
        let mut chans = Vec::with_capacity(N_EVENT_CHAN);
        for id in 0..N_EVENT_CHAN {
            let sink: Arc<dyn ChanSink> = Arc::clone(&core) as _;
            chans.push(EvChannel::spawn(id as ChanId, idle_timeout, sink)?);
        }
        core.chans
            .set(chans)
            .unwrap_or_else(|_| unreachable!("channels set twice"));

        let endpoints = match Self::bring_up(&core, gss) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                // Failed startup must not leave reactor threads behind.
                for chan in core.chans() {
                    chan.signal_shutdown();
                }
                for chan in core.chans() {
                    chan.join();
                }
                return Err(e);
            }
        };

        let workers = WorkerPool::spawn(
            queues,
            core.cfg.nb_workers,
            Duration::from_secs(core.cfg.decoder_fridge_expiration_delay_s),
        );

        Ok(Self {
            core,
            endpoints: Mutex::new(endpoints),
            workers,
        })
    }

    /// Startup steps that may fail after the event channels exist.
    fn bring_up(
        core: &Arc<DispatchCore>,
        gss: Option<Arc<dyn GssAuthority>>,
    ) -> Result<Endpoints, SvcError> {
        // Netconfig entries: v4 are mandatory, v6 reduce capability only.
        for net in [NetId::Udp4, NetId::Tcp4] {
            if !core.portmap.has_netconfig(net) {
                return Err(SvcError::MissingNetconfig(net));
            }
        }
        for net in [NetId::Udp6, NetId::Tcp6] {
            if !core.portmap.has_netconfig(net) {
                log::info!("dispatch: no netconfig entry for {net}, continuing without it");
            }
        }

        let mut endpoints = Endpoints::new();
        endpoints.allocate_sockets(&core.cfg)?;

        if core.cfg.any_nfs_vers() {
            endpoints.bind_sockets(&core.cfg)?;
            // Clear stale registrations before announcing ourselves.
            core.unregister_programs();
            endpoints.create_transports(&core.cfg, core.chans(), &*core.codec)?;
        }

        if let Some(principal) = core.cfg.gss.principal.clone() {
            let authority = gss.as_ref().ok_or_else(|| {
                SvcError::Gss(format!("principal {principal} configured but no GSS authority"))
            })?;
            authority.import_principal(&principal)?;
            log::info!("dispatch: imported GSS principal {principal}");
            if let Err(e) = authority.acquire_cred() {
                log::warn!("dispatch: cannot acquire credentials for {principal}: {e}");
            }
        }

        core.register_programs()?;

        Ok(endpoints)
    }

    #[inline]
    pub fn config(&self) -> &CoreConfig {
        &self.core.cfg
    }

    /// Shared queue state: the surfaced counters, estimator and stall list.
    #[inline]
    pub fn queues(&self) -> &Arc<ReqQueues> {
        &self.core.queues
    }

    /// Number of worker threads still running.
    pub fn worker_count(&self) -> u32 {
        self.workers.live()
    }

    /// Whether IPv6 endpoints were disabled during socket allocation.
    pub fn v6_disabled(&self) -> bool {
        self.endpoints.lock().unwrap().v6_disabled()
    }

    /// Bound address of a protocol's UDP endpoint (kernel-chosen when the
    /// configured port is 0).
    pub fn udp_local_addr(&self, proto: Proto) -> Option<std::net::SocketAddr> {
        self.endpoints.lock().unwrap().udp_local_addr(proto)
    }

    /// Bound address of a protocol's TCP endpoint.
    pub fn tcp_local_addr(&self, proto: Proto) -> Option<std::net::SocketAddr> {
        self.endpoints.lock().unwrap().tcp_local_addr(proto)
    }

    /// Enqueue a request built by an external front end (NFSv4 callbacks,
    /// the 9P server).
    pub fn enqueue(&self, req: Arc<Req>) {
        self.core.queues.enqueue(req);
    }

    /// Stop accepting and decoding: signal SHUTDOWN to every listener
    /// channel. Call once, from a shutdown thread.
    pub fn dispatch_stop(&self) {
        for chan in &self.core.chans()[..EVCHAN_SIZE] {
            chan.signal_shutdown();
        }
    }

    /// Unregister from the portmapper and close the listening sockets.
    pub fn clean(&self) {
        self.core.unregister_programs();
        self.endpoints.lock().unwrap().close_all();
    }

    /// Full teardown: stop listeners, drain worker channels, retire the
    /// worker pool, then clean up registrations and sockets.
    pub fn shutdown(self) {
        self.dispatch_stop();
        for chan in &self.core.chans()[EVCHAN_SIZE..] {
            chan.signal_shutdown();
        }
        for chan in self.core.chans() {
            chan.join();
        }
        self.workers.stop_and_join();
        self.clean();
    }
}
