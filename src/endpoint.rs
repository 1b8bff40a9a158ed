//! Endpoint manager: socket allocation, options, binding, and transport
//! creation for every enabled protocol.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::CoreConfig;
use crate::evchan::{EvChannel, RDMA_LISTEN_CHAN, TCP_LISTEN_CHAN, UDP_LISTEN_CHAN};
use crate::proto::Proto;
use crate::svc::{SvcError, WireCodec};
use crate::xprt::{Xprt, XprtFamily};

/// Return `true` if socket creation failed because the address family is
/// not available on this host.
pub(crate) fn family_unsupported(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EAFNOSUPPORT)
}

/// Sockets and listening transports per protocol.
pub(crate) struct Endpoints {
    v6_disabled: bool,

    udp_sockets: [Option<Socket>; Proto::COUNT],
    tcp_sockets: [Option<Socket>; Proto::COUNT],

    udp_xprts: [Option<Arc<Xprt>>; Proto::COUNT],
    tcp_xprts: [Option<Arc<Xprt>>; Proto::COUNT],
}

impl Endpoints {
    pub fn new() -> Self {
        Self {
            // No point probing for V6 interfaces there.
            v6_disabled: cfg!(target_os = "freebsd"),
            udp_sockets: Default::default(),
            tcp_sockets: Default::default(),
            udp_xprts: Default::default(),
            tcp_xprts: Default::default(),
        }
    }

    #[inline]
    pub fn v6_disabled(&self) -> bool {
        self.v6_disabled
    }

    #[inline]
    pub fn inet_family(&self) -> XprtFamily {
        if self.v6_disabled {
            XprtFamily::Inet4
        } else {
            XprtFamily::Inet6
        }
    }

    /// Allocate the UDP and TCP sockets for every enabled protocol.
    ///
    /// Tries IPv6 first; an `EAFNOSUPPORT` on the first attempt flips the
    /// process to IPv4 for all further allocations. A TCP failure after a
    /// successful UDP on the same family cannot be family disablement and is
    /// fatal.
    pub fn allocate_sockets(&mut self, cfg: &CoreConfig) -> Result<(), SvcError> {
        log::debug!("endpoints: allocating sockets");

        for proto in Proto::INET {
            if !proto.enabled(cfg) {
                continue;
            }
            let tag = proto.tag();

            if !self.v6_disabled {
                match Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)) {
                    Ok(sock) => {
                        self.udp_sockets[proto.index()] = Some(sock);
                        let tcp = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
                            .map_err(alloc_err(tag, "tcp6"))?;
                        self.tcp_sockets[proto.index()] = Some(tcp);
                    }
                    Err(e) if family_unsupported(&e) => {
                        self.v6_disabled = true;
                        log::warn!(
                            "endpoints: system may not have V6 interfaces configured ({e})"
                        );
                    }
                    Err(source) => {
                        return Err(SvcError::SocketAlloc {
                            tag,
                            kind: "udp6",
                            source,
                        });
                    }
                }
            }

            if self.v6_disabled {
                let udp = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
                    .map_err(alloc_err(tag, "udp"))?;
                let tcp = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
                    .map_err(alloc_err(tag, "tcp"))?;
                self.udp_sockets[proto.index()] = Some(udp);
                self.tcp_sockets[proto.index()] = Some(tcp);
            }

            self.apply_socket_options(proto, cfg)?;
            log::debug!(
                "endpoints: {} sockets allocated (udp fd {:?}, tcp fd {:?})",
                tag,
                self.udp_sockets[proto.index()].as_ref().map(raw_fd),
                self.tcp_sockets[proto.index()].as_ref().map(raw_fd)
            );
        }

        if Proto::NfsVsock.enabled(cfg) {
            // Lack of vsock support is reduced capability, not a startup
            // failure.
            if let Err(e) = self.allocate_socket_vsock() {
                log::warn!("endpoints: vsock socket create failed ({e}), continuing");
            }
        }

        Ok(())
    }

    /// SO_REUSEADDR avoids the 2MSL wait on restart; keepalive options are
    /// applied to TCP when configured; UDP sockets go non-blocking here.
    fn apply_socket_options(&self, proto: Proto, cfg: &CoreConfig) -> Result<(), SvcError> {
        let tag = proto.tag();
        let udp = self.udp_sockets[proto.index()].as_ref().expect("udp socket");
        let tcp = self.tcp_sockets[proto.index()].as_ref().expect("tcp socket");

        udp.set_reuse_address(true).map_err(alloc_err(tag, "udp"))?;
        tcp.set_reuse_address(true).map_err(alloc_err(tag, "tcp"))?;

        if cfg.enable_tcp_keepalive {
            tcp.set_keepalive(true).map_err(alloc_err(tag, "tcp"))?;
            let mut keepalive = socket2::TcpKeepalive::new();
            if cfg.tcp_keepidle > 0 {
                keepalive = keepalive.with_time(Duration::from_secs(cfg.tcp_keepidle.into()));
            }
            if cfg.tcp_keepintvl > 0 {
                keepalive =
                    keepalive.with_interval(Duration::from_secs(cfg.tcp_keepintvl.into()));
            }
            if cfg.tcp_keepcnt > 0 {
                keepalive = keepalive.with_retries(cfg.tcp_keepcnt);
            }
            tcp.set_tcp_keepalive(&keepalive)
                .map_err(alloc_err(tag, "tcp"))?;
        }

        udp.set_nonblocking(true).map_err(alloc_err(tag, "udp"))?;

        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn allocate_socket_vsock(&mut self) -> io::Result<()> {
        let sock = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        sock.set_reuse_address(true)?;
        log::debug!(
            "endpoints: {} stream fd {}",
            Proto::NfsVsock.tag(),
            raw_fd(&sock)
        );
        self.tcp_sockets[Proto::NfsVsock.index()] = Some(sock);
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn allocate_socket_vsock(&mut self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Bind every allocated socket to the wildcard address and its
    /// configured port. vsock bind failure is reduced capability; any inet
    /// bind failure is fatal.
    pub fn bind_sockets(&mut self, cfg: &CoreConfig) -> Result<(), SvcError> {
        for proto in Proto::INET {
            if !proto.enabled(cfg) {
                continue;
            }
            let tag = proto.tag();
            let port = cfg.port(proto);
            let addr: SocketAddr = if self.v6_disabled {
                (Ipv4Addr::UNSPECIFIED, port).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, port).into()
            };
            let addr = socket2::SockAddr::from(addr);

            let udp = self.udp_sockets[proto.index()].as_ref().expect("udp socket");
            udp.bind(&addr).map_err(bind_err(tag, "udp"))?;

            let tcp = self.tcp_sockets[proto.index()].as_ref().expect("tcp socket");
            tcp.bind(&addr).map_err(bind_err(tag, "tcp"))?;
        }

        if self.tcp_sockets[Proto::NfsVsock.index()].is_some() {
            if let Err(e) = self.bind_socket_vsock(cfg) {
                log::warn!("endpoints: AF_VSOCK bind failed ({e}), continuing startup");
                self.tcp_sockets[Proto::NfsVsock.index()] = None;
            }
        }

        log::info!(
            "endpoints: bind successful, v6_disabled = {}",
            self.v6_disabled
        );
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn bind_socket_vsock(&self, cfg: &CoreConfig) -> io::Result<()> {
        let sock = self.tcp_sockets[Proto::NfsVsock.index()]
            .as_ref()
            .expect("vsock socket");
        let addr = socket2::SockAddr::vsock(libc::VMADDR_CID_ANY, cfg.nfs_port.into());
        sock.bind(&addr)
    }

    #[cfg(not(target_os = "linux"))]
    fn bind_socket_vsock(&self, _cfg: &CoreConfig) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Build the listening transports and pin them on the listener channels.
    pub fn create_transports(
        &mut self,
        cfg: &CoreConfig,
        chans: &[Arc<EvChannel>],
        codec: &dyn WireCodec,
    ) -> Result<(), SvcError> {
        log::debug!("endpoints: creating server transports");
        let family = self.inet_family();

        for proto in Proto::INET {
            if !proto.enabled(cfg) {
                continue;
            }

            let udp = self.udp_sockets[proto.index()].as_ref().expect("udp socket");
            let xprt = Xprt::datagram(dup_socket(proto, "udp", udp)?, family, proto);
            chans[UDP_LISTEN_CHAN].register_xprt(Arc::clone(&xprt));
            self.udp_xprts[proto.index()] = Some(xprt);

            let tcp = self.tcp_sockets[proto.index()].as_ref().expect("tcp socket");
            tcp.listen(libc::SOMAXCONN)
                .map_err(bind_err(proto.tag(), "tcp"))?;
            let dup = dup_socket(proto, "tcp", tcp)?;
            dup.set_nonblocking(true)
                .map_err(alloc_err(proto.tag(), "tcp"))?;
            let xprt = Xprt::rendezvous(dup, family, proto);
            chans[TCP_LISTEN_CHAN].register_xprt(Arc::clone(&xprt));
            self.tcp_xprts[proto.index()] = Some(xprt);
        }

        if let Some(vsock) = self.tcp_sockets[Proto::NfsVsock.index()].as_ref() {
            let proto = Proto::NfsVsock;
            vsock
                .listen(libc::SOMAXCONN)
                .map_err(bind_err(proto.tag(), "stream"))?;
            let dup = dup_socket(proto, "stream", vsock)?;
            dup.set_nonblocking(true)
                .map_err(alloc_err(proto.tag(), "stream"))?;
            let xprt = Xprt::rendezvous(dup, XprtFamily::Vsock, proto);
            chans[TCP_LISTEN_CHAN].register_xprt(Arc::clone(&xprt));
            self.tcp_xprts[proto.index()] = Some(xprt);
        }

        if Proto::NfsRdma.enabled(cfg) {
            let fd = codec.rdma_create(&cfg.rdma)?;
            let xprt = Xprt::rdma(fd, Proto::NfsRdma);
            chans[RDMA_LISTEN_CHAN].register_xprt(Arc::clone(&xprt));
            self.tcp_xprts[Proto::NfsRdma.index()] = Some(xprt);
        }

        Ok(())
    }

    /// Local address of a protocol's UDP endpoint, once bound.
    ///
    /// Real portmap registration needs the kernel-chosen port when the
    /// configured port is 0.
    pub fn udp_local_addr(&self, proto: Proto) -> Option<SocketAddr> {
        self.udp_sockets[proto.index()]
            .as_ref()?
            .local_addr()
            .ok()?
            .as_socket()
    }

    /// Local address of a protocol's TCP endpoint, once bound.
    pub fn tcp_local_addr(&self, proto: Proto) -> Option<SocketAddr> {
        self.tcp_sockets[proto.index()]
            .as_ref()?
            .local_addr()
            .ok()?
            .as_socket()
    }

    /// Close every allocated socket. Empty slots are tolerated, so partial
    /// startups tear down cleanly.
    pub fn close_all(&mut self) {
        for slot in self
            .udp_sockets
            .iter_mut()
            .chain(self.tcp_sockets.iter_mut())
        {
            let _ = slot.take();
        }
        self.udp_xprts = Default::default();
        self.tcp_xprts = Default::default();
    }
}

#[inline]
fn raw_fd(sock: &Socket) -> i32 {
    use std::os::fd::AsRawFd;
    sock.as_raw_fd()
}

fn alloc_err(tag: &'static str, kind: &'static str) -> impl FnOnce(io::Error) -> SvcError {
    move |source| SvcError::SocketAlloc { tag, kind, source }
}

fn bind_err(tag: &'static str, kind: &'static str) -> impl FnOnce(io::Error) -> SvcError {
    move |source| SvcError::SocketBind { tag, kind, source }
}

fn dup_socket(proto: Proto, kind: &'static str, sock: &Socket) -> Result<Socket, SvcError> {
    sock.try_clone().map_err(alloc_err(proto.tag(), kind))
}
