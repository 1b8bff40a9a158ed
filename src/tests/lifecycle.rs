//! Startup sequencing, registration, endpoint lifecycle and shutdown.

use super::*;
use crate::endpoint::{family_unsupported, Endpoints};
use std::io;
use std::net::TcpStream;

fn init_dispatcher(portmap: Arc<MockPortmap>) -> (Dispatcher, Arc<MockCodec>) {
    init_logging();
    let codec = Arc::new(MockCodec::default());
    let dispatcher = Dispatcher::init(
        test_config(),
        Arc::clone(&codec) as Arc<dyn WireCodec>,
        portmap as Arc<dyn Portmap>,
        None,
        HandlerTable::new(),
    )
    .expect("dispatcher init failed");
    (dispatcher, codec)
}

#[test]
fn init_passes_library_parameters() {
    let portmap = Arc::new(MockPortmap::new(true));
    let (dispatcher, codec) = init_dispatcher(Arc::clone(&portmap));

    let params = codec.init_params.lock().unwrap().clone().unwrap();
    assert_eq!(params.channels, N_EVENT_CHAN as u32);
    assert_eq!(params.max_events, 1024);
    assert_eq!(params.max_connections, dispatcher.config().max_connections);
    assert_eq!(
        u64::from(params.decoder_block_timeout_s),
        dispatcher.config().decoder_fridge_block_timeout_s
    );

    dispatcher.shutdown();
}

/// Every enabled (program, version) is registered over each available
/// netconfig, and stale entries are swept first.
#[test]
fn registration_matrix() {
    let portmap = Arc::new(MockPortmap::new(true));
    let (dispatcher, _codec) = init_dispatcher(Arc::clone(&portmap));

    let registered = portmap.registered.lock().unwrap().clone();
    // 7 (program, version) pairs over udp/tcp/udp6/tcp6.
    assert_eq!(registered.len(), 7 * 4);
    for (program, vers) in [
        (NFS_PROGRAM, NFS_V3),
        (NFS_PROGRAM, NFS_V4),
        (MNT_PROGRAM, MOUNT_V1),
        (MNT_PROGRAM, MOUNT_V3),
        (NLM_PROGRAM, NLM4_VERS),
        (RQUOTA_PROGRAM, RQUOTAVERS),
        (RQUOTA_PROGRAM, EXT_RQUOTAVERS),
    ] {
        assert!(
            registered.contains(&(program, vers, NetId::Udp4)),
            "missing registration {program} v{vers}"
        );
        assert!(registered.contains(&(program, vers, NetId::Tcp6)));
    }

    // The stale sweep runs before registration: NFS V2..V4, MOUNT V1..V3,
    // NLM 1..4, RQUOTA 1..2 across four netconfigs.
    let unregistered = portmap.unregistered.lock().unwrap().clone();
    assert_eq!(unregistered.len(), 12 * 4);
    assert!(unregistered.contains(&(NFS_PROGRAM, NFS_V2, NetId::Udp4)));

    dispatcher.shutdown();
}

#[test]
fn v4_only_registration_skips_v3_programs() {
    init_logging();
    let portmap = Arc::new(MockPortmap::new(false));
    let codec = Arc::new(MockCodec::default());
    let cfg = CoreConfig {
        core_options: CoreOptions::NFSV4,
        enable_nlm: false,
        enable_rquota: false,
        ..test_config()
    };
    let dispatcher = Dispatcher::init(
        cfg,
        codec as Arc<dyn WireCodec>,
        Arc::clone(&portmap) as Arc<dyn Portmap>,
        None,
        HandlerTable::new(),
    )
    .unwrap();

    let registered = portmap.registered.lock().unwrap().clone();
    assert!(registered.iter().all(|(program, _, _)| *program == NFS_PROGRAM));
    assert!(registered.contains(&(NFS_PROGRAM, NFS_V4, NetId::Udp4)));
    assert!(!registered.iter().any(|(_, vers, _)| *vers == NFS_V3));

    dispatcher.shutdown();
}

#[test]
fn missing_netconfig_is_fatal() {
    init_logging();
    let portmap = Arc::new(MockPortmap::new(true).without(NetId::Tcp4));
    let codec = Arc::new(MockCodec::default());
    let err = Dispatcher::init(
        test_config(),
        codec as Arc<dyn WireCodec>,
        portmap as Arc<dyn Portmap>,
        None,
        HandlerTable::new(),
    )
    .unwrap_err();

    assert!(matches!(err, SvcError::MissingNetconfig(NetId::Tcp4)));
}

/// GSS principal import happens at startup; credential acquisition failure
/// only reduces capability.
#[test]
fn gss_cred_failure_is_not_fatal() {
    init_logging();

    #[derive(Default)]
    struct FlakyGss {
        imported: Mutex<Vec<String>>,
    }
    impl GssAuthority for FlakyGss {
        fn import_principal(&self, principal: &str) -> Result<(), SvcError> {
            self.imported.lock().unwrap().push(principal.to_owned());
            Ok(())
        }
        fn acquire_cred(&self) -> Result<(), SvcError> {
            Err(SvcError::Gss("no keytab".to_owned()))
        }
    }

    let gss = Arc::new(FlakyGss::default());
    let mut cfg = test_config();
    cfg.gss.principal = Some("nfs@example.test".to_owned());

    let dispatcher = Dispatcher::init(
        cfg,
        Arc::new(MockCodec::default()) as Arc<dyn WireCodec>,
        Arc::new(MockPortmap::new(true)) as Arc<dyn Portmap>,
        Some(Arc::clone(&gss) as Arc<dyn GssAuthority>),
        HandlerTable::new(),
    )
    .unwrap();

    assert_eq!(gss.imported.lock().unwrap().as_slice(), ["nfs@example.test"]);

    dispatcher.shutdown();
}

/// S7: shutdown retires workers, stops listeners and removes portmap
/// entries.
#[test]
fn shutdown_stops_listeners_and_unregisters() {
    let portmap = Arc::new(MockPortmap::new(true));
    let (dispatcher, _codec) = init_dispatcher(Arc::clone(&portmap));

    let addr = loopback_of(dispatcher.tcp_local_addr(Proto::Nfs).unwrap());
    // A parked connection, to prove teardown copes with accepted children.
    let _client = TcpStream::connect(addr).unwrap();

    let unregistered_before = portmap.unregistered.lock().unwrap().len();
    dispatcher.shutdown();

    // Returning from shutdown proves reactors and workers joined. The
    // portmap sweep ran a second time.
    let unregistered_after = portmap.unregistered.lock().unwrap().len();
    assert_eq!(unregistered_after, unregistered_before * 2);

    // The listening socket is gone; fresh connections are refused.
    let refused = TcpStream::connect_timeout(&addr, Duration::from_millis(500));
    assert!(refused.is_err());
}

/// Spec property 6, decision level: only EAFNOSUPPORT flips to IPv4.
#[test]
fn ipv6_fallback_decision() {
    assert!(family_unsupported(&io::Error::from_raw_os_error(
        libc::EAFNOSUPPORT
    )));
    assert!(!family_unsupported(&io::Error::from_raw_os_error(
        libc::EMFILE
    )));
    assert!(!family_unsupported(&io::Error::new(
        io::ErrorKind::PermissionDenied,
        "denied"
    )));
}

/// Endpoint manager lifecycle against real sockets: allocate, bind, close.
#[test]
fn endpoints_allocate_bind_close() {
    init_logging();
    let cfg = test_config();
    let mut endpoints = Endpoints::new();

    endpoints.allocate_sockets(&cfg).unwrap();
    endpoints.bind_sockets(&cfg).unwrap();

    let udp = endpoints.udp_local_addr(Proto::Nfs).unwrap();
    let tcp = endpoints.tcp_local_addr(Proto::Nfs).unwrap();
    assert_ne!(udp.port(), 0);
    assert_ne!(tcp.port(), 0);

    // MOUNT/NLM/RQUOTA endpoints exist under the default options.
    assert!(endpoints.udp_local_addr(Proto::Mnt).is_some());
    assert!(endpoints.udp_local_addr(Proto::Nlm).is_some());
    assert!(endpoints.udp_local_addr(Proto::Rquota).is_some());

    // close_all tolerates empty slots and double invocation.
    endpoints.close_all();
    endpoints.close_all();
    assert!(endpoints.udp_local_addr(Proto::Nfs).is_none());
}

/// NFSv4-only configurations keep the MOUNT/NLM endpoints off.
#[test]
fn v4_only_skips_v3_endpoints() {
    init_logging();
    let cfg = CoreConfig {
        core_options: CoreOptions::NFSV4,
        ..test_config()
    };
    let mut endpoints = Endpoints::new();
    endpoints.allocate_sockets(&cfg).unwrap();
    endpoints.bind_sockets(&cfg).unwrap();

    assert!(endpoints.udp_local_addr(Proto::Nfs).is_some());
    assert!(endpoints.udp_local_addr(Proto::Mnt).is_none());
    assert!(endpoints.udp_local_addr(Proto::Nlm).is_none());

    endpoints.close_all();
}

/// Idle workers above the minimum retire after the fridge expiration
/// delay; the pool never drops below one.
#[test]
fn idle_workers_retire_to_minimum() {
    init_logging();
    let mut cfg = test_config();
    cfg.nb_workers = 3;
    cfg.decoder_fridge_expiration_delay_s = 1;

    let dispatcher = Dispatcher::init(
        cfg,
        Arc::new(MockCodec::default()) as Arc<dyn WireCodec>,
        Arc::new(MockPortmap::new(true)) as Arc<dyn Portmap>,
        None,
        HandlerTable::new(),
    )
    .unwrap();

    assert_eq!(dispatcher.worker_count(), 3);
    // Retirement is observed at the 5 s wait tick.
    assert!(wait_for(Duration::from_secs(8), || {
        dispatcher.worker_count() == 1
    }));

    dispatcher.shutdown();
}
