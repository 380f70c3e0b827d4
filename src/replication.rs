//! Replication renegotiation orchestrator (spec.md §4.8).
//!
//! A forked child streams the RDB snapshot to the replica directly over
//! the parent's TLS connection. That mutates the connection's send state
//! from a process the parent never observes, so by the time the child
//! exits the parent's engine handle no longer matches the wire — there is
//! no portable way to "rewind" a TLS record sequence. Both ends must tear
//! down their TLS connection object (without a shutdown alert, to avoid
//! racing alerts against the peer's next handshake) and renegotiate a
//! fresh one on the same fd.
//!
//! The master and replica each run one (different) state machine:
//!
//! - **Master**: after the forked transfer completes, wait for the
//!   replica's one-byte ack (`'\n'` ping, stay waiting; `'+'`, begin
//!   renegotiating) before touching the connection.
//! - **Replica**: once it has loaded the RDB, it writes `'+'` first (its
//!   write state is the only thing the fork corrupted; the read side is
//!   still valid for the master to observe pings), then renegotiates as
//!   the TLS client.
//!
//! Functions here are plain state transitions over `TlsState`/`Connection`,
//! the same shape as `rotation::renew` — no standalone relay object, since
//! the host already drives everything through the reactor.

use std::os::unix::io::RawFd;
use std::time::Instant;

use rustls::pki_types::ServerName;

use crate::engine::{Blocked, Conn, HandshakeStatus, IoStatus};
use crate::error::EngineError;
use crate::handshake;
use crate::logging::log_warning;
use crate::reactor::{HandlerId, Mask, Reactor, Token};
use crate::state::{ConnFlags, TlsState};

/// Master side: the forked transfer to `fd` has finished. Arms a
/// read-only handler that waits for the replica's ack and flags the
/// connection so `delete_read_handlers_for_replicas_awaiting_bgsave` can
/// find it (spec.md §4.8 "TRANSFER_DONE").
pub fn start_wait_for_replica_to_load_rdb(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    fd: RawFd,
    wait_handler: HandlerId,
    data: Token,
) {
    state.registry.get_mut(fd).flags.insert(ConnFlags::AWAITING_RDB_LOAD_ACK);
    reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
    reactor.arm(fd, Mask::READABLE, wait_handler, data);
}

/// Outcome of one invocation of the master's ack-wait handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterAckOutcome {
    /// Either nothing has arrived yet, or it was a `'\n'` liveness ping.
    StillWaiting,
    /// The replica sent `'+'`; renegotiation has started.
    Renegotiating,
    /// A protocol violation or hard I/O error; the caller tore the link down.
    TornDown,
}

/// Master side: invoked from the handler armed by
/// `start_wait_for_replica_to_load_rdb` whenever `fd` becomes readable.
/// Reads exactly one byte. `'\n'` is a liveness ping (stay waiting); `'+'`
/// starts renegotiation (spec.md §4.8); anything else, or a hard error,
/// tears the replica link down via `teardown`.
pub fn on_replica_ack_byte(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    fd: RawFd,
    renegotiate_handler: HandlerId,
    data: Token,
    mut teardown: impl FnMut(&mut TlsState, &mut dyn Reactor, RawFd),
) -> MasterAckOutcome {
    let mut byte = [0u8; 1];
    match state.registry.get_mut(fd).engine_mut().recv(&mut byte) {
        IoStatus::Bytes(1) => match byte[0] {
            b'\n' => {
                state.registry.get_mut(fd).last_replica_ack = Some(Instant::now());
                MasterAckOutcome::StillWaiting
            }
            b'+' => {
                if start_renegotiate_with_replica_after_transfer(state, reactor, fd, renegotiate_handler, data)
                    .is_err()
                {
                    teardown(state, reactor, fd);
                    return MasterAckOutcome::TornDown;
                }
                MasterAckOutcome::Renegotiating
            }
            other => {
                log_warning!("replica on fd {fd} sent unexpected post-transfer byte {other:#04x}, tearing down link");
                teardown(state, reactor, fd);
                MasterAckOutcome::TornDown
            }
        },
        IoStatus::Bytes(_) => MasterAckOutcome::StillWaiting,
        IoStatus::Blocked(_) => MasterAckOutcome::StillWaiting,
        IoStatus::Fatal(e) => {
            log_warning!("replica link on fd {fd} failed while awaiting post-transfer ack: {e}");
            teardown(state, reactor, fd);
            MasterAckOutcome::TornDown
        }
    }
}

/// Master side: the replica confirmed transfer completion. Cleans up the
/// existing TLS connection *without* a shutdown alert, installs a fresh
/// server-role engine on the same fd, and arms both directions for the
/// renegotiation handshake driver (spec.md §4.8).
pub fn start_renegotiate_with_replica_after_transfer(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    fd: RawFd,
    renegotiate_handler: HandlerId,
    data: Token,
) -> Result<(), EngineError> {
    state.registry.get_mut(fd).flags.remove(ConnFlags::AWAITING_RDB_LOAD_ACK);

    let server_config = state.server_config.clone().expect("renegotiation requires an installed server config");
    let mut conn = Conn::new_server(server_config)?;
    conn.bind_fd(fd);
    // Dropping the old engine here — not calling `shutdown` — is the
    // "cleanup without sending a shutdown alert" step: no close_notify is
    // sent, so it can never race the replica's fresh ClientHello.
    state.registry.get_mut(fd).replace_engine(conn);

    reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
    reactor.arm(fd, Mask::READABLE | Mask::WRITABLE, renegotiate_handler, data);
    Ok(())
}

/// Master side: drives one step of the renegotiation handshake armed by
/// `start_renegotiate_with_replica_after_transfer`. On completion, arms
/// `post_handler` (the normal command reader) exactly as any other
/// handshake (spec.md §4.8 "negotiation done → arm readable for the normal
/// command handler").
pub fn drive_master_renegotiation(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    fd: RawFd,
    renegotiate_handler: HandlerId,
    post_handler: HandlerId,
    data: Token,
) -> handshake::NegotiateOutcome {
    let conn = state.registry.get_mut(fd).engine_mut();
    handshake::negotiate_async(reactor, fd, conn, renegotiate_handler, Some(post_handler), Mask::READABLE, data)
}

/// Master side: disarms read interest on every replica link still parked
/// in the ack-wait state (spec.md §6). Used when a BGSAVE is abandoned or
/// restarted and those links must stop being read from until a new
/// transfer completes and re-arms them.
pub fn delete_read_handlers_for_replicas_awaiting_bgsave(state: &mut TlsState, reactor: &mut dyn Reactor) {
    let fds: Vec<RawFd> = state
        .registry
        .iter()
        .filter(|(_, conn)| conn.flags.contains(ConnFlags::AWAITING_RDB_LOAD_ACK))
        .map(|(fd, _)| fd)
        .collect();

    for fd in fds {
        reactor.disarm(fd, Mask::READABLE);
    }
}

/// Replica side: this process finished loading the RDB snapshot. Arms a
/// writable handler for the renegotiation driver (spec.md §4.8 "On
/// RDB-loaded → arm writable for sslNegotiateWithMasterAfterSocketRdbLoad").
pub fn start_renegotiate_with_master_after_rdb_load(
    reactor: &mut dyn Reactor,
    fd: RawFd,
    renegotiate_handler: HandlerId,
    data: Token,
) {
    reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
    reactor.arm(fd, Mask::WRITABLE, renegotiate_handler, data);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRenegOutcome {
    Retry,
    Done,
    Failed,
}

/// Replica side: invoked from the handler armed by
/// `start_renegotiate_with_master_after_rdb_load` each time `fd` is ready.
///
/// First entry (the `LOAD_NOTIFICATION_SENT` flag is clear): writes `'+'`
/// once over the still-valid existing connection, then cleans up without a
/// shutdown alert and reinitializes as a client-role engine with
/// `master_hostname` set for SNI/verification, and sets the flag so later
/// entries skip straight to driving the handshake. Does not arm a
/// reactor-level post-handler on completion — the finish-sync hook is
/// invoked directly, matching spec.md §4.8's "drive handshake via the
/// driver without a post-handler".
pub fn drive_replica_renegotiation(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    fd: RawFd,
    master_hostname: &str,
    renegotiate_handler: HandlerId,
    data: Token,
    mut finish_sync: impl FnMut(&mut TlsState, &mut dyn Reactor, RawFd),
) -> ReplicaRenegOutcome {
    if !state.registry.get(fd).flags.contains(ConnFlags::LOAD_NOTIFICATION_SENT) {
        match state.registry.get_mut(fd).engine_mut().send(b"+") {
            IoStatus::Bytes(n) if n > 0 => {}
            IoStatus::Bytes(_) | IoStatus::Blocked(_) => {
                reactor.disarm(fd, Mask::READABLE);
                reactor.arm(fd, Mask::WRITABLE, renegotiate_handler, data);
                return ReplicaRenegOutcome::Retry;
            }
            IoStatus::Fatal(_) => {
                reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
                return ReplicaRenegOutcome::Failed;
            }
        }

        let client_config = state.client_config.clone().expect("renegotiation requires an installed client config");
        let server_name = match ServerName::try_from(master_hostname.to_string()) {
            Ok(n) => n,
            Err(_) => {
                reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
                return ReplicaRenegOutcome::Failed;
            }
        };
        let mut conn = match Conn::new_client(client_config, server_name) {
            Ok(c) => c,
            Err(_) => {
                reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
                return ReplicaRenegOutcome::Failed;
            }
        };
        conn.bind_fd(fd);
        state.registry.get_mut(fd).replace_engine(conn);
        state.registry.get_mut(fd).flags.insert(ConnFlags::LOAD_NOTIFICATION_SENT);
    }

    match state.registry.get_mut(fd).engine_mut().handshake() {
        HandshakeStatus::Done => {
            reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
            state.registry.get_mut(fd).flags.remove(ConnFlags::LOAD_NOTIFICATION_SENT);
            finish_sync(state, reactor, fd);
            ReplicaRenegOutcome::Done
        }
        HandshakeStatus::Blocked(Blocked::OnRead) => {
            reactor.disarm(fd, Mask::WRITABLE);
            reactor.arm(fd, Mask::READABLE, renegotiate_handler, data);
            ReplicaRenegOutcome::Retry
        }
        HandshakeStatus::Blocked(Blocked::OnWrite) => {
            reactor.disarm(fd, Mask::READABLE);
            reactor.arm(fd, Mask::WRITABLE, renegotiate_handler, data);
            ReplicaRenegOutcome::Retry
        }
        HandshakeStatus::Fatal(_) => {
            reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
            ReplicaRenegOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build_client_config, build_server_config, ClientMaterial, ServerMaterial};
    use crate::reactor::SimpleReactor;
    use crate::registry::ConnRegistry;
    use crate::repeated_read::RepeatedReadList;
    use crate::state::Connection;
    use std::os::unix::io::AsRawFd;
    use std::path::PathBuf;

    // A tiny self-signed cert/key pair, CN "test.example", generated once
    // and embedded as PEM — avoids pulling a cert-generation dependency
    // into non-dev code just to exercise these state transitions.
    const TEST_CERT: &str = include_str!("../testdata/renegotiate_cert.pem");
    const TEST_KEY: &str = include_str!("../testdata/renegotiate_key.pem");

    fn bare_state(registry_capacity: usize) -> TlsState {
        let server_config = build_server_config(&ServerMaterial {
            cert_chain_pem: TEST_CERT.as_bytes(),
            private_key_pem: TEST_KEY.as_bytes(),
            dh_params_pem: None,
            cipher_prefs: None,
        })
        .expect("server config");
        let client_config = build_client_config(&ClientMaterial {
            cert_pem: TEST_CERT.as_bytes(),
            trust_store_path: None,
            cipher_prefs: None,
            expected_hostname: Some("test.example".to_string()),
        })
        .expect("client config");

        TlsState {
            enabled: true,
            server_config: Some(server_config),
            server_config_created_at: Instant::now(),
            previous_server_config: None,
            client_config: Some(client_config),
            cert_pem: TEST_CERT.as_bytes().to_vec(),
            cert_path: Some(PathBuf::new()),
            key_pem: TEST_KEY.as_bytes().to_vec(),
            key_path: Some(PathBuf::new()),
            not_before: String::new(),
            not_after: String::new(),
            serial: 1,
            expected_hostname: Some("test.example".to_string()),
            cipher_prefs: None,
            perf_mode: crate::config::PerfMode::LowLatency,
            dh_params: None,
            trust_store_path: None,
            registry: ConnRegistry::new(registry_capacity),
            repeated_reads: RepeatedReadList::new(),
            repeated_reads_armed: false,
            connections_on_current: 0,
            connections_on_previous: 0,
            total_repeated_reads: 0,
            max_repeated_read_list_len: 0,
        }
    }

    #[test]
    fn start_wait_flags_and_arms_read_only() {
        let mut state = bare_state(16);
        let mut reactor = SimpleReactor::new().expect("reactor");
        let (a, _keep) = std::os::unix::net::UnixStream::pair().expect("pair");
        let fd = a.as_raw_fd();
        state.registry.insert(fd, Connection::new_for_test(fd, ConnFlags::empty()));

        start_wait_for_replica_to_load_rdb(&mut state, &mut reactor, fd, 7, 0);

        assert!(state.registry.get(fd).flags.contains(ConnFlags::AWAITING_RDB_LOAD_ACK));
        assert_eq!(reactor.current_mask(fd), Mask::READABLE);
    }

    #[test]
    fn delete_read_handlers_only_touches_awaiting_replicas() {
        let mut state = bare_state(16);
        let mut reactor = SimpleReactor::new().expect("reactor");

        let (a, _ka) = std::os::unix::net::UnixStream::pair().expect("pair");
        let (b, _kb) = std::os::unix::net::UnixStream::pair().expect("pair");
        let awaiting_fd = a.as_raw_fd();
        let other_fd = b.as_raw_fd();

        let mut awaiting = Connection::new_for_test(awaiting_fd, ConnFlags::AWAITING_RDB_LOAD_ACK);
        awaiting.flags.insert(ConnFlags::AWAITING_RDB_LOAD_ACK);
        state.registry.insert(awaiting_fd, awaiting);
        state.registry.insert(other_fd, Connection::new_for_test(other_fd, ConnFlags::empty()));

        reactor.arm(awaiting_fd, Mask::READABLE, 1, 0);
        reactor.arm(other_fd, Mask::READABLE, 2, 0);

        delete_read_handlers_for_replicas_awaiting_bgsave(&mut state, &mut reactor);

        assert_eq!(reactor.current_mask(awaiting_fd), Mask::empty());
        assert_eq!(reactor.current_mask(other_fd), Mask::READABLE);
    }

    #[test]
    fn master_ack_ping_updates_last_ack_and_stays_waiting() {
        let mut state = bare_state(16);
        let mut reactor = SimpleReactor::new().expect("reactor");

        let server_config = state.server_config.clone().unwrap();
        let client_config = state.client_config.clone().unwrap();
        let (a, b) = std::os::unix::net::UnixStream::pair().expect("pair");
        a.set_nonblocking(true).expect("nonblocking");
        b.set_nonblocking(true).expect("nonblocking");
        let master_fd = a.as_raw_fd();
        let replica_fd = b.as_raw_fd();

        let mut master_conn = Conn::new_server(server_config).expect("server conn");
        master_conn.bind_fd(master_fd);
        let server_name = ServerName::try_from("test.example".to_string()).unwrap();
        let mut replica_conn = Conn::new_client(client_config, server_name).expect("client conn");
        replica_conn.bind_fd(replica_fd);

        for _ in 0..64 {
            let md = matches!(master_conn.handshake(), HandshakeStatus::Done);
            let rd = matches!(replica_conn.handshake(), HandshakeStatus::Done);
            if md && rd {
                break;
            }
        }
        assert!(!master_conn.has_buffered_plaintext());

        assert!(matches!(replica_conn.send(b"\n"), IoStatus::Bytes(1)));

        state.registry.insert(master_fd, Connection::new(master_fd, master_conn, ConnFlags::empty()));
        state.registry.get_mut(master_fd).flags.insert(ConnFlags::AWAITING_RDB_LOAD_ACK);

        let outcome =
            on_replica_ack_byte(&mut state, &mut reactor, master_fd, 9, 0, |_, _, _| panic!("must not tear down"));

        assert_eq!(outcome, MasterAckOutcome::StillWaiting);
        assert!(state.registry.get(master_fd).last_replica_ack.is_some());
        assert!(state.registry.get(master_fd).flags.contains(ConnFlags::AWAITING_RDB_LOAD_ACK));
    }

    #[test]
    fn master_ack_plus_starts_renegotiation() {
        let mut state = bare_state(16);
        let mut reactor = SimpleReactor::new().expect("reactor");

        let server_config = state.server_config.clone().unwrap();
        let client_config = state.client_config.clone().unwrap();
        let (a, b) = std::os::unix::net::UnixStream::pair().expect("pair");
        a.set_nonblocking(true).expect("nonblocking");
        b.set_nonblocking(true).expect("nonblocking");
        let master_fd = a.as_raw_fd();
        let replica_fd = b.as_raw_fd();

        let mut master_conn = Conn::new_server(server_config).expect("server conn");
        master_conn.bind_fd(master_fd);
        let server_name = ServerName::try_from("test.example".to_string()).unwrap();
        let mut replica_conn = Conn::new_client(client_config, server_name).expect("client conn");
        replica_conn.bind_fd(replica_fd);

        for _ in 0..64 {
            let md = matches!(master_conn.handshake(), HandshakeStatus::Done);
            let rd = matches!(replica_conn.handshake(), HandshakeStatus::Done);
            if md && rd {
                break;
            }
        }

        assert!(matches!(replica_conn.send(b"+"), IoStatus::Bytes(1)));

        state.registry.insert(master_fd, Connection::new(master_fd, master_conn, ConnFlags::empty()));
        state.registry.get_mut(master_fd).flags.insert(ConnFlags::AWAITING_RDB_LOAD_ACK);
        reactor.arm(master_fd, Mask::READABLE, 5, 0);

        let outcome =
            on_replica_ack_byte(&mut state, &mut reactor, master_fd, 9, 0, |_, _, _| panic!("must not tear down"));

        assert_eq!(outcome, MasterAckOutcome::Renegotiating);
        assert!(!state.registry.get(master_fd).flags.contains(ConnFlags::AWAITING_RDB_LOAD_ACK));
        assert_eq!(reactor.current_mask(master_fd), Mask::READABLE | Mask::WRITABLE);
        assert_eq!(reactor.get_handler(master_fd, crate::reactor::Direction::Readable), Some(9));
    }
}
