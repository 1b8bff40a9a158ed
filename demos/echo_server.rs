//! Minimal wiring demo: a toy UDP wire "library" and an echo handler
//! running on top of the dispatch core.
//!
//! Each datagram is one message: 4 bytes of big-endian xid followed by the
//! payload. The handler echoes the payload back with the same xid.

use nfs_dispatch::*;
use std::mem::MaybeUninit;
use std::net::UdpSocket;
use std::sync::Arc;

/// One received datagram, carried through the core as the codec stream.
struct Datagram {
    xid: u32,
    payload: Vec<u8>,
    peer: socket2::SockAddr,
}

struct DemoCodec;

impl WireCodec for DemoCodec {
    fn recv(&self, xprt: &Arc<Xprt>) -> RecvOutcome {
        let Some(sock) = xprt.socket() else {
            return RecvOutcome::Died;
        };
        let mut buf = [MaybeUninit::<u8>::uninit(); 64 * 1024];
        match sock.recv_from(&mut buf) {
            Ok((len, peer)) if len >= 4 => {
                // SAFETY: the kernel initialized the first `len` bytes.
                let bytes: &[u8] =
                    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast(), len) };
                let xid = u32::from_be_bytes(bytes[..4].try_into().unwrap());
                RecvOutcome::Message(Box::new(Datagram {
                    xid,
                    payload: bytes[4..].to_vec(),
                    peer,
                }))
            }
            Ok(_) => RecvOutcome::Idle,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => RecvOutcome::Idle,
            Err(_) => RecvOutcome::Died,
        }
    }

    fn decode(&self, req: &mut Req) -> DecodeOutcome {
        let xid = req
            .with_stream(|s| s.downcast_ref::<Datagram>().map(|d| d.xid))
            .flatten()
            .unwrap_or(0);
        DecodeOutcome::Call(
            RpcHeader {
                xid,
                program: NFS_PROGRAM,
                version: NFS_V4,
                procedure: 0,
                cred_flavor: 0,
            },
            Lookahead::empty(),
        )
    }

    fn authenticate(&self, _req: &Req, no_dispatch: &mut bool) -> AuthStat {
        *no_dispatch = false;
        AuthStat::Ok
    }

    fn checksum(&self, _req: &mut Req) -> bool {
        true
    }

    fn free_args(&self, _req: &mut Req) {}

    fn reply_auth_err(&self, _req: &Req, _why: AuthStat) -> XprtStat {
        XprtStat::Idle
    }

    fn reply_decode_err(&self, _req: &Req) -> XprtStat {
        XprtStat::Idle
    }

    fn stat(&self, _xprt: &Xprt) -> XprtStat {
        XprtStat::Idle
    }
}

/// Portmapper that only pretends; the demo has no rpcbind to talk to.
struct NullPortmap;

impl Portmap for NullPortmap {
    fn has_netconfig(&self, net: NetId) -> bool {
        matches!(net, NetId::Udp4 | NetId::Tcp4)
    }

    fn register(
        &self,
        _program: type_alias::Program,
        _vers: type_alias::Vers,
        _net: NetId,
    ) -> Result<(), SvcError> {
        Ok(())
    }

    fn unregister(&self, _program: type_alias::Program, _vers: type_alias::Vers, _net: NetId) {}
}

fn main() {
    const GREETING: &[u8] = b"hello, dispatcher!";

    let mut handlers = HandlerTable::new();
    handlers.set(Proto::Nfs, |req: &Req| {
        // Echo the payload back to the sender with the original xid.
        let reply = req
            .with_stream(|s| {
                s.downcast_ref::<Datagram>().map(|d| {
                    let mut out = d.xid.to_be_bytes().to_vec();
                    out.extend_from_slice(&d.payload);
                    (out, d.peer.clone())
                })
            })
            .flatten();
        if let (Some((out, peer)), Some(sock)) = (reply, req.xprt().socket()) {
            let _ = sock.send_to(&out, &peer);
        }
    });

    let cfg = CoreConfig {
        nfs_port: 0,
        mnt_port: 0,
        nlm_port: 0,
        rquota_port: 0,
        nb_workers: 2,
        ..CoreConfig::default()
    };

    let dispatcher = Dispatcher::init(
        cfg,
        Arc::new(DemoCodec),
        Arc::new(NullPortmap),
        None,
        handlers,
    )
    .expect("dispatcher startup failed");

    let addr = dispatcher
        .udp_local_addr(Proto::Nfs)
        .expect("NFS UDP endpoint not bound");
    println!("echo server listening on {addr}");

    // Client: one round trip through reactor, queues and worker pool.
    let client = UdpSocket::bind(match addr {
        std::net::SocketAddr::V4(_) => "0.0.0.0:0",
        std::net::SocketAddr::V6(_) => "[::]:0",
    })
    .unwrap();
    let target = match addr {
        std::net::SocketAddr::V4(a) => (std::net::Ipv4Addr::LOCALHOST, a.port()).into(),
        std::net::SocketAddr::V6(a) => {
            std::net::SocketAddr::from((std::net::Ipv6Addr::LOCALHOST, a.port()))
        }
    };

    let mut msg = 7u32.to_be_bytes().to_vec();
    msg.extend_from_slice(GREETING);
    client.send_to(&msg, target).unwrap();

    let mut buf = [0u8; 1024];
    let (len, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..4], &7u32.to_be_bytes());
    assert_eq!(&buf[4..len], GREETING);
    println!("echoed {} bytes, xid 7", len - 4);

    dispatcher.shutdown();
}
