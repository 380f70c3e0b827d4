//! Global TLS state and connection lifecycle (spec.md §3, §4.11).
//!
//! `TlsState` is the single piece of mutable state this core needs; the
//! host owns one instance (there is no process-wide singleton here, unlike
//! the original global it was ported from) and passes `&mut TlsState`
//! plus `&mut dyn Reactor` into every entry point.

use std::fs;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};

use crate::cert;
use crate::config::{self, ClientMaterial, PerfMode, ServerMaterial};
use crate::engine::Conn;
use crate::error::{ConfigError, EngineError, InitError};
use crate::reactor::{HandlerId, Mask, Reactor, Token};
use crate::registry::ConnRegistry;
use crate::repeated_read::{self, RepeatedReadList};

bitflags::bitflags! {
    /// Per-connection flags (spec.md §3 connection record).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u8 {
        /// Set for connections accepted from ordinary clients — the
        /// category the rotation epoch counters (`connections_on_current`/
        /// `connections_on_previous`) track. Cluster links and outbound
        /// connections to a master are TLS-client-role or TLS-server-role
        /// the same as any other connection, but are not "clients" in the
        /// rotation-accounting sense, so `setup_on_cluster_peer` and
        /// `setup_on_outbound` leave this flag clear. See DESIGN.md.
        const IS_CLIENT = 0b0_0001;
        const BOUND_TO_OLD_CERT = 0b0_0010;
        const NEWLINE_PING_IN_PROGRESS = 0b0_0100;
        /// Replica side: the post-RDB-load `'+'` notification has already
        /// been sent and the connection has been reinitialized as a fresh
        /// client-role engine (spec.md §4.8) — subsequent entries into the
        /// renegotiation driver should drive the handshake, not resend it.
        const LOAD_NOTIFICATION_SENT = 0b0_1000;
        /// Master side: this replica link is parked waiting for the
        /// replica's post-transfer ack (`'\n'` ping or `'+'` completion)
        /// before renegotiation starts (spec.md §4.8). Lets
        /// `delete_read_handlers_for_replicas_awaiting_bgsave` find exactly
        /// these connections without a separate tracking list.
        const AWAITING_RDB_LOAD_ACK = 0b1_0000;
    }
}

/// One registered connection: its fd, its TLS engine handle, and the flags
/// spec.md §3 lists on the connection record.
pub struct Connection {
    pub fd: RawFd,
    engine: Option<Conn>,
    pub flags: ConnFlags,
    /// Tagged enqueued/not-enqueued state for the repeated-read list; see
    /// `repeated_read.rs`'s module doc for why this isn't a literal
    /// back-pointer.
    pub cached_data_node: bool,
    /// When this record was created. Certificate rotation (spec.md §4.9)
    /// compares this against the current config's creation time to tell a
    /// merely-old client (one epoch behind) from a two-generations-old one
    /// that must be disconnected during the next rotation's sweep.
    pub created_at: Instant,
    /// Master side only: last time this replica's renegotiation wait
    /// handler observed a `'\n'` liveness ping (spec.md §4.8). Informational
    /// — nothing in this crate times the link out on it.
    pub last_replica_ack: Option<Instant>,
}

impl Connection {
    pub fn new(fd: RawFd, engine: Conn, flags: ConnFlags) -> Self {
        Self { fd, engine: Some(engine), flags, cached_data_node: false, created_at: Instant::now(), last_replica_ack: None }
    }

    /// Test-only constructor for registry exercises that never touch the
    /// TLS engine.
    #[cfg(test)]
    pub fn new_for_test(fd: RawFd, flags: ConnFlags) -> Self {
        Self { fd, engine: None, flags, cached_data_node: false, created_at: Instant::now(), last_replica_ack: None }
    }

    pub fn engine(&self) -> &Conn {
        self.engine.as_ref().expect("Connection constructed without an engine handle")
    }

    pub fn engine_mut(&mut self) -> &mut Conn {
        self.engine.as_mut().expect("Connection constructed without an engine handle")
    }

    /// Drops the current TLS engine handle in favor of a freshly
    /// (re)initialized one bound to the same fd, without sending a
    /// shutdown alert on the old one — the replication renegotiation
    /// orchestrator's "cleanup-without-shutdown" step (spec.md §4.8). Since
    /// `Conn` has no separate wipe step beyond `Drop`, replacing the field
    /// is the whole operation.
    pub fn replace_engine(&mut self, new_engine: Conn) {
        self.engine = Some(new_engine);
    }
}

/// Recognized configuration options, named after spec.md §6's list of
/// recognized options exactly (`enable_ssl`, `ssl_certificate_file`, ...).
/// `registry_capacity` is the one field spec.md doesn't name directly — it
/// stands in for "max-clients + reserve" from spec.md §3, which this crate
/// takes as a pre-computed size rather than deriving from a separate
/// max-clients setting owned by the (out-of-scope) configuration loader.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub enable_ssl: bool,
    pub ssl_certificate_file: PathBuf,
    pub ssl_certificate_private_key_file: PathBuf,
    pub ssl_dh_params_file: Option<PathBuf>,
    pub ssl_cipher_prefs: Option<String>,
    pub ssl_performance_mode: PerfMode,
    pub root_ca_certs_path: Option<PathBuf>,
    pub registry_capacity: usize,
}

/// All mutable TLS-related state (spec.md §3). One instance per host
/// process; there is no hidden global here.
pub struct TlsState {
    pub enabled: bool,

    pub server_config: Option<Arc<ServerConfig>>,
    pub server_config_created_at: Instant,
    pub previous_server_config: Option<Arc<ServerConfig>>,

    pub client_config: Option<Arc<ClientConfig>>,

    pub cert_pem: Vec<u8>,
    pub cert_path: Option<PathBuf>,
    pub key_pem: Vec<u8>,
    pub key_path: Option<PathBuf>,
    pub not_before: String,
    pub not_after: String,
    pub serial: u128,

    pub expected_hostname: Option<String>,
    pub cipher_prefs: Option<String>,
    pub perf_mode: PerfMode,
    pub dh_params: Option<Vec<u8>>,
    pub trust_store_path: Option<PathBuf>,

    pub registry: ConnRegistry,
    pub repeated_reads: RepeatedReadList,
    /// Mirrors "the repeated-read drain currently has work" so a host's
    /// recurring task can skip scheduling itself while idle.
    pub repeated_reads_armed: bool,

    /// Accepted-client connections still presenting `server_config`.
    pub connections_on_current: u64,
    /// Accepted-client connections still presenting `previous_server_config`
    /// (flagged `BOUND_TO_OLD_CERT`); rotation keeps at most these two
    /// live epochs (spec.md §4.9).
    pub connections_on_previous: u64,
    pub total_repeated_reads: u64,
    pub max_repeated_read_list_len: u64,
}

/// Builds the initial TLS state from a configuration (spec.md §4.11
/// `init`): reads cert/key material from disk, builds both rustls
/// configs, and extracts the certificate's CN-adjacent fields. The
/// expected hostname used for peer verification is not a separate
/// setting — spec.md §3 is explicit that it "is always derived from the
/// same certificate as the active server configuration" — so it comes
/// from `cert::extract_cname` on this same `ssl_certificate_file`, never
/// from the caller.
pub fn init(config: TlsConfig) -> Result<TlsState, InitError> {
    let cert_pem = fs::read(&config.ssl_certificate_file).map_err(|e| {
        InitError::Config(ConfigError::BadTrustStore(format!("{}: {e}", config.ssl_certificate_file.display())))
    })?;
    let key_pem = fs::read(&config.ssl_certificate_private_key_file).map_err(|e| {
        InitError::Config(ConfigError::BadTrustStore(format!(
            "{}: {e}",
            config.ssl_certificate_private_key_file.display()
        )))
    })?;
    let dh_pem = config
        .ssl_dh_params_file
        .as_ref()
        .map(fs::read)
        .transpose()
        .map_err(|e| InitError::Config(ConfigError::BadTrustStore(e.to_string())))?;

    let validity = cert::extract_validity(&cert_pem).map_err(|e| InitError::Config(ConfigError::from(e)))?;
    let expected_hostname = cert::extract_cname(&cert_pem).map_err(|e| InitError::Config(ConfigError::from(e)))?;

    let server_config = config::build_server_config(&ServerMaterial {
        cert_chain_pem: &cert_pem,
        private_key_pem: &key_pem,
        dh_params_pem: dh_pem.as_deref(),
        cipher_prefs: config.ssl_cipher_prefs.as_deref(),
    })?;

    let client_config = config::build_client_config(&ClientMaterial {
        cert_pem: &cert_pem,
        trust_store_path: config.root_ca_certs_path.as_deref(),
        cipher_prefs: config.ssl_cipher_prefs.as_deref(),
        expected_hostname: Some(expected_hostname.clone()),
    })?;

    Ok(TlsState {
        enabled: config.enable_ssl,
        server_config: Some(server_config),
        server_config_created_at: Instant::now(),
        previous_server_config: None,
        client_config: Some(client_config),
        cert_pem,
        cert_path: Some(config.ssl_certificate_file),
        key_pem,
        key_path: Some(config.ssl_certificate_private_key_file),
        not_before: validity.not_before,
        not_after: validity.not_after,
        serial: validity.serial,
        expected_hostname: Some(expected_hostname),
        cipher_prefs: config.ssl_cipher_prefs,
        perf_mode: config.ssl_performance_mode,
        dh_params: dh_pem,
        trust_store_path: config.root_ca_certs_path,
        registry: ConnRegistry::new(config.registry_capacity),
        repeated_reads: RepeatedReadList::new(),
        repeated_reads_armed: false,
        connections_on_current: 0,
        connections_on_previous: 0,
        total_repeated_reads: 0,
        max_repeated_read_list_len: 0,
    })
}

/// Tears down all reactor registrations this core holds and disables it
/// (spec.md §4.11 `cleanup`). Every live connection is routed through
/// `cleanup_connection` (with a shutdown alert, same as any other orderly
/// teardown) so the documented per-connection path — disarm, drop from the
/// repeated-read list, `close_notify`, epoch accounting — actually runs
/// instead of being bypassed by dropping the registry wholesale. The
/// server/previous/client configs and cached cert material are then
/// released and the registry is emptied.
pub fn cleanup(state: &mut TlsState, reactor: &mut dyn Reactor) {
    let fds: Vec<RawFd> = state.registry.iter().map(|(fd, _)| fd).collect();
    for fd in fds {
        cleanup_connection(state, reactor, fd, true);
    }

    state.registry = ConnRegistry::new(0);
    state.repeated_reads = RepeatedReadList::new();
    state.repeated_reads_armed = false;

    state.server_config = None;
    state.previous_server_config = None;
    state.client_config = None;
    state.cert_pem.clear();
    state.key_pem.clear();
    state.not_before.clear();
    state.not_after.clear();
    state.serial = 0;
    state.expected_hostname = None;

    state.enabled = false;
}

/// Registers a newly accepted client connection: server-role TLS engine
/// bound to `fd`, armed on both directions for the handshake driver
/// (spec.md §4.11).
pub fn setup_on_accepted_client(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    fd: RawFd,
    handler: HandlerId,
    data: Token,
) -> Result<(), EngineError> {
    let server_config = state
        .server_config
        .clone()
        .expect("setup_on_accepted_client requires TlsState::init to have run");
    let mut conn = Conn::new_server(server_config)?;
    conn.bind_fd(fd);
    state.registry.insert(fd, Connection::new(fd, conn, ConnFlags::IS_CLIENT));
    state.connections_on_current += 1;
    reactor.arm(fd, Mask::READABLE | Mask::WRITABLE, handler, data);
    Ok(())
}

/// Registers a cluster bus link accepted from a peer: server-role TLS
/// engine, not counted against the client-epoch rotation counters.
pub fn setup_on_cluster_peer(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    fd: RawFd,
    handler: HandlerId,
    data: Token,
) -> Result<(), EngineError> {
    let server_config = state
        .server_config
        .clone()
        .expect("setup_on_cluster_peer requires TlsState::init to have run");
    let mut conn = Conn::new_server(server_config)?;
    conn.bind_fd(fd);
    state.registry.insert(fd, Connection::new(fd, conn, ConnFlags::empty()));
    reactor.arm(fd, Mask::READABLE | Mask::WRITABLE, handler, data);
    Ok(())
}

/// Registers an outbound connection this process initiated (cluster bus
/// dial-out, or a replica's connection to its master): client-role TLS
/// engine, hostname-verified against `hostname` if given.
pub fn setup_on_outbound(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    fd: RawFd,
    hostname: Option<&str>,
    handler: HandlerId,
    data: Token,
) -> Result<(), EngineError> {
    let client_config = state
        .client_config
        .clone()
        .expect("setup_on_outbound requires TlsState::init to have run");
    let server_name = ServerName::try_from(hostname.unwrap_or("").to_string())
        .map_err(|e| EngineError::protocol(e.to_string()))?;
    let mut conn = Conn::new_client(client_config, server_name)?;
    conn.bind_fd(fd);
    state.registry.insert(fd, Connection::new(fd, conn, ConnFlags::empty()));
    reactor.arm(fd, Mask::READABLE | Mask::WRITABLE, handler, data);
    Ok(())
}

/// Tears down one connection: disarms it, drops it from the repeated-read
/// list, optionally emits a TLS `close_notify` alert, removes it from the
/// registry, and retires its rotation-epoch accounting (spec.md §3, §6
/// `cleanup_connection(fd, send_shutdown_alert: bool)`).
///
/// `send_shutdown_alert` is `false` for the replication renegotiation
/// orchestrator's "cleanup without shutdown" step (spec.md §4.8), which
/// must not risk an alert racing the peer's fresh handshake; every other
/// caller — normal client/link teardown — passes `true`.
pub fn cleanup_connection(state: &mut TlsState, reactor: &mut dyn Reactor, fd: RawFd, send_shutdown_alert: bool) {
    reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
    repeated_read::remove_repeated_read(state, fd);

    if let Some(mut conn) = state.registry.remove(fd) {
        if send_shutdown_alert {
            conn.engine_mut().shutdown();
        }
        if conn.flags.contains(ConnFlags::IS_CLIENT) {
            if conn.flags.contains(ConnFlags::BOUND_TO_OLD_CERT) {
                state.connections_on_previous = state.connections_on_previous.saturating_sub(1);
            } else {
                state.connections_on_current = state.connections_on_current.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build_server_config;
    use crate::reactor::SimpleReactor;

    const TEST_CERT: &str = include_str!("../testdata/renegotiate_cert.pem");
    const TEST_KEY: &str = include_str!("../testdata/renegotiate_key.pem");

    #[test]
    fn cleanup_disarms_every_registered_fd_and_sends_shutdown_alert() {
        let mut reactor = SimpleReactor::new().expect("reactor");
        let (a, _b) = std::os::unix::net::UnixStream::pair().expect("pair");
        a.set_nonblocking(true).expect("nonblocking");
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&a);
        reactor.arm(fd, Mask::READABLE, 1, 0);

        let server_config = build_server_config(&crate::config::ServerMaterial {
            cert_chain_pem: TEST_CERT.as_bytes(),
            private_key_pem: TEST_KEY.as_bytes(),
            dh_params_pem: None,
            cipher_prefs: None,
        })
        .expect("server config");

        let mut conn = Conn::new_server(server_config.clone()).expect("server conn");
        conn.bind_fd(fd);

        let mut state = TlsState {
            enabled: true,
            server_config: Some(server_config),
            server_config_created_at: Instant::now(),
            previous_server_config: None,
            client_config: None,
            cert_pem: TEST_CERT.as_bytes().to_vec(),
            cert_path: None,
            key_pem: TEST_KEY.as_bytes().to_vec(),
            key_path: None,
            not_before: "now".to_string(),
            not_after: "later".to_string(),
            serial: 1,
            expected_hostname: Some("test.example".to_string()),
            cipher_prefs: None,
            perf_mode: PerfMode::LowLatency,
            dh_params: None,
            trust_store_path: None,
            registry: ConnRegistry::new(4096),
            repeated_reads: RepeatedReadList::new(),
            repeated_reads_armed: false,
            connections_on_current: 1,
            connections_on_previous: 0,
            total_repeated_reads: 0,
            max_repeated_read_list_len: 0,
        };
        state.registry.insert(fd, Connection::new(fd, conn, ConnFlags::IS_CLIENT));

        cleanup(&mut state, &mut reactor);

        assert_eq!(reactor.current_mask(fd), Mask::empty());
        assert!(!state.enabled);
        assert!(state.registry.is_empty());
        assert!(state.server_config.is_none());
        assert!(state.cert_pem.is_empty());
        assert!(state.expected_hostname.is_none());
    }

    #[test]
    fn cleanup_connection_without_alert_skips_shutdown() {
        let mut reactor = SimpleReactor::new().expect("reactor");
        let (a, _b) = std::os::unix::net::UnixStream::pair().expect("pair");
        a.set_nonblocking(true).expect("nonblocking");
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&a);

        let server_config = build_server_config(&crate::config::ServerMaterial {
            cert_chain_pem: TEST_CERT.as_bytes(),
            private_key_pem: TEST_KEY.as_bytes(),
            dh_params_pem: None,
            cipher_prefs: None,
        })
        .expect("server config");
        let mut conn = Conn::new_server(server_config.clone()).expect("server conn");
        conn.bind_fd(fd);

        let mut state = TlsState {
            enabled: true,
            server_config: Some(server_config),
            server_config_created_at: Instant::now(),
            previous_server_config: None,
            client_config: None,
            cert_pem: Vec::new(),
            cert_path: None,
            key_pem: Vec::new(),
            key_path: None,
            not_before: String::new(),
            not_after: String::new(),
            serial: 1,
            expected_hostname: None,
            cipher_prefs: None,
            perf_mode: PerfMode::LowLatency,
            dh_params: None,
            trust_store_path: None,
            registry: ConnRegistry::new(4096),
            repeated_reads: RepeatedReadList::new(),
            repeated_reads_armed: false,
            connections_on_current: 1,
            connections_on_previous: 0,
            total_repeated_reads: 0,
            max_repeated_read_list_len: 0,
        };
        state.registry.insert(fd, Connection::new(fd, conn, ConnFlags::IS_CLIENT));

        // Replication's cleanup-without-alert path: fd stays usable for a
        // fresh engine afterward since no close_notify was sent on the wire.
        cleanup_connection(&mut state, &mut reactor, fd, false);

        assert!(!state.registry.contains(fd));
        assert_eq!(state.connections_on_current, 0);
    }
}
