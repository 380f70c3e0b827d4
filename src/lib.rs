//! TLS integration core for a single-threaded, event-driven key-value
//! server: a reactor-driven adapter over an embedded TLS engine, covering
//! handshake negotiation, repeated-read scheduling for cached plaintext,
//! replication across a fork boundary, and certificate hot-rotation.
//!
//! Nothing here owns a socket listener or a command parser — the host
//! process supplies the reactor, accepts connections, and calls into the
//! entry points below at the right lifecycle moments (spec.md §6).

pub mod error;
pub mod logging;
pub mod reactor;
pub mod registry;

#[cfg(feature = "tls")]
pub mod cert;
#[cfg(feature = "tls")]
pub mod config;
#[cfg(feature = "tls")]
pub mod engine;
#[cfg(feature = "tls")]
pub mod handshake;
#[cfg(feature = "tls")]
pub mod io_shim;
#[cfg(feature = "tls")]
pub mod repeated_read;
#[cfg(feature = "tls")]
pub mod replication;
#[cfg(feature = "tls")]
pub mod rotation;
#[cfg(feature = "tls")]
pub mod state;

#[cfg(feature = "tls")]
pub use config::{host_matches, PerfMode};
#[cfg(feature = "tls")]
pub use engine::{Blocked, Conn, HandshakeStatus, IoStatus, Role};
#[cfg(feature = "tls")]
pub use handshake::{negotiate_async, negotiate_sync, NegotiateOutcome, NegotiateSyncError};
#[cfg(feature = "tls")]
pub use io_shim::{ping, read, strerror, write, IoError, IoOutcome};
#[cfg(feature = "tls")]
pub use replication::{
    delete_read_handlers_for_replicas_awaiting_bgsave, drive_master_renegotiation, drive_replica_renegotiation,
    on_replica_ack_byte, start_renegotiate_with_master_after_rdb_load, start_renegotiate_with_replica_after_transfer,
    start_wait_for_replica_to_load_rdb, MasterAckOutcome, ReplicaRenegOutcome,
};
#[cfg(feature = "tls")]
pub use rotation::{renew, RenewMaterial};
#[cfg(feature = "tls")]
pub use state::{
    cleanup, cleanup_connection, init, setup_on_accepted_client, setup_on_cluster_peer, setup_on_outbound,
    ConnFlags, Connection, TlsConfig, TlsState,
};

pub use reactor::{
    Direction, HandlerId, Mask, Reactor, RecurringTask, RecurringTaskId, SimpleReactor, TickResult, Token,
};
pub use registry::ConnRegistry;
