#![allow(unused_imports)]

use super::*;
use crate::type_alias::{Program, Vers, Xid};
use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::atomic::*;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use simple_logger::SimpleLogger;

mod lifecycle;
mod queues;

fn init_logging() {
    let _ = SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();
}

/// Build a throwaway datagram transport for queue-level tests.
fn test_xprt() -> Arc<Xprt> {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    Xprt::datagram(sock.into(), XprtFamily::Inet4, Proto::Nfs)
}

/// Build an already-classified request for queue-level tests.
fn test_req(xid: Xid, kind: ReqKind, lookahead: Lookahead) -> Arc<Req> {
    let mut req = Req::new(kind, test_xprt(), Box::new(()));
    req.header = RpcHeader {
        xid,
        program: NFS_PROGRAM,
        version: NFS_V4,
        procedure: 0,
        cred_flavor: 0,
    };
    req.lookahead = lookahead;
    Arc::new(req)
}

/// One message scripted through the mock codec.
#[derive(Debug, Clone)]
struct ScriptedMsg {
    header: RpcHeader,
    lookahead: Lookahead,
    auth: AuthStat,
    no_dispatch: bool,
    checksum_ok: bool,
}

impl ScriptedMsg {
    fn ok(xid: Xid) -> Self {
        Self {
            header: RpcHeader {
                xid,
                program: NFS_PROGRAM,
                version: NFS_V4,
                procedure: 1,
                cred_flavor: 1,
            },
            lookahead: Lookahead::empty(),
            auth: AuthStat::Ok,
            no_dispatch: false,
            checksum_ok: true,
        }
    }
}

/// Scripted wire library. `recv` pops pre-loaded messages per protocol, the
/// remaining entry points follow the message's script and record replies.
#[derive(Default)]
struct MockCodec {
    inbox: Mutex<HashMap<&'static str, VecDeque<ScriptedMsg>>>,
    init_params: Mutex<Option<SvcInitParams>>,
    auth_rejects: Mutex<Vec<(Xid, AuthStat)>>,
    decodes: AtomicU32,
    decode_errs: AtomicU32,
    freed_args: AtomicU32,
}

impl MockCodec {
    fn push(&self, proto: Proto, msg: ScriptedMsg) {
        self.inbox
            .lock()
            .unwrap()
            .entry(proto.tag())
            .or_default()
            .push_back(msg);
    }

    fn scripted(req: &Req) -> ScriptedMsg {
        req.with_stream(|s| s.downcast_ref::<ScriptedMsg>().cloned())
            .flatten()
            .expect("request stream is not a scripted message")
    }
}

impl WireCodec for MockCodec {
    fn init(&self, params: &SvcInitParams) -> Result<(), SvcError> {
        *self.init_params.lock().unwrap() = Some(params.clone());
        Ok(())
    }

    fn recv(&self, xprt: &Arc<Xprt>) -> RecvOutcome {
        let mut inbox = self.inbox.lock().unwrap();
        match inbox.get_mut(xprt.proto().tag()).and_then(|q| q.pop_front()) {
            Some(msg) => RecvOutcome::Message(Box::new(msg)),
            None => RecvOutcome::Idle,
        }
    }

    fn decode(&self, req: &mut Req) -> DecodeOutcome {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let msg = Self::scripted(req);
        DecodeOutcome::Call(msg.header, msg.lookahead)
    }

    fn authenticate(&self, req: &Req, no_dispatch: &mut bool) -> AuthStat {
        let msg = Self::scripted(req);
        *no_dispatch = msg.no_dispatch;
        msg.auth
    }

    fn checksum(&self, req: &mut Req) -> bool {
        let msg = Self::scripted(req);
        if msg.checksum_ok {
            req.set_arg(Box::new(()));
        }
        msg.checksum_ok
    }

    fn free_args(&self, req: &mut Req) {
        self.freed_args.fetch_add(1, Ordering::SeqCst);
        let _ = req.take_arg();
    }

    fn reply_auth_err(&self, req: &Req, why: AuthStat) -> XprtStat {
        self.auth_rejects
            .lock()
            .unwrap()
            .push((req.header().xid, why));
        XprtStat::Idle
    }

    fn reply_decode_err(&self, _req: &Req) -> XprtStat {
        self.decode_errs.fetch_add(1, Ordering::SeqCst);
        XprtStat::Idle
    }

    fn stat(&self, _xprt: &Xprt) -> XprtStat {
        XprtStat::Idle
    }
}

/// Recording portmapper.
struct MockPortmap {
    v6: bool,
    missing: Mutex<Vec<NetId>>,
    registered: Mutex<Vec<(Program, Vers, NetId)>>,
    unregistered: Mutex<Vec<(Program, Vers, NetId)>>,
}

impl MockPortmap {
    fn new(v6: bool) -> Self {
        Self {
            v6,
            missing: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
        }
    }

    fn without(self, net: NetId) -> Self {
        self.missing.lock().unwrap().push(net);
        self
    }
}

impl Portmap for MockPortmap {
    fn has_netconfig(&self, net: NetId) -> bool {
        if self.missing.lock().unwrap().contains(&net) {
            return false;
        }
        match net {
            NetId::Udp4 | NetId::Tcp4 => true,
            NetId::Udp6 | NetId::Tcp6 => self.v6,
        }
    }

    fn register(&self, program: Program, vers: Vers, net: NetId) -> Result<(), SvcError> {
        self.registered.lock().unwrap().push((program, vers, net));
        Ok(())
    }

    fn unregister(&self, program: Program, vers: Vers, net: NetId) {
        self.unregistered.lock().unwrap().push((program, vers, net));
    }
}

/// Configuration for tests: kernel-chosen ports, default options, small pool.
fn test_config() -> CoreConfig {
    CoreConfig {
        nfs_port: 0,
        mnt_port: 0,
        nlm_port: 0,
        rquota_port: 0,
        nb_workers: 2,
        idle_timeout_s: 0,
        ..CoreConfig::default()
    }
}

/// Replace a wildcard bind address with the matching loopback, keeping the
/// kernel-chosen port.
fn loopback_of(addr: std::net::SocketAddr) -> std::net::SocketAddr {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    match addr {
        SocketAddr::V4(a) => (Ipv4Addr::LOCALHOST, a.port()).into(),
        SocketAddr::V6(a) => (Ipv6Addr::LOCALHOST, a.port()).into(),
    }
}

/// Poll `cond` for up to `timeout`, sleeping briefly between attempts.
fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
