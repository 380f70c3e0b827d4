//! I/O shim (spec.md §4.6): `read`/`write`/`ping`/`strerror`, the surface
//! the command-processing loop actually calls. Dispatches to the raw fd
//! when TLS is disabled for a connection, or through `engine::Conn`
//! otherwise, normalizing both into the same would-block convention the
//! rest of the host expects.

use std::os::unix::io::RawFd;

use crate::engine::{self, IoStatus};
use crate::logging::log_warning;
use crate::repeated_read;
use crate::state::{ConnFlags, TlsState};

/// A single newline byte, used by `ping` (spec.md §4.6: "writes a bare
/// newline to probe liveness without engaging the command parser").
const NEWLINE_PING: &[u8] = b"\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    Bytes(usize),
    WouldBlock,
}

#[derive(Debug, Clone)]
pub enum IoError {
    Fatal(String),
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IoError {}

/// Reads plaintext from `fd` into `buf`. When the connection is
/// TLS-enabled and the engine reports leftover cached plaintext after this
/// read, enqueues `fd` on the repeated-read list (spec.md §4.7) so the
/// host re-invokes the read handler even without a fresh readiness edge.
pub fn read(state: &mut TlsState, fd: RawFd, buf: &mut [u8]) -> Result<IoOutcome, IoError> {
    if !state.enabled {
        return raw_read(fd, buf);
    }

    let conn = state.registry.get_mut(fd);
    let outcome = match conn.engine_mut().recv(buf) {
        IoStatus::Bytes(n) => Ok(IoOutcome::Bytes(n)),
        IoStatus::Blocked(_) => Ok(IoOutcome::WouldBlock),
        IoStatus::Fatal(e) => {
            log_warning!("TLS read on fd {fd} failed: {e}");
            Err(IoError::Fatal(e.to_string()))
        }
    };

    if outcome.is_ok() && state.registry.get(fd).engine().has_buffered_plaintext() {
        repeated_read::add_repeated_read(state, fd);
    } else {
        repeated_read::remove_repeated_read(state, fd);
    }

    outcome
}

/// Writes plaintext from `buf` to `fd`. If `ping` left a pending `"\n"`
/// unflushed (spec.md §4.6), that single byte must be resent — with the
/// same content — before any new payload goes out, since the engine
/// remembers an in-progress send and cannot have a second buffer spliced
/// in ahead of it. Only once the pending byte is confirmed flushed does
/// this function fall through to `buf`.
pub fn write(state: &mut TlsState, fd: RawFd, buf: &[u8]) -> Result<IoOutcome, IoError> {
    if !state.enabled {
        return raw_write(fd, buf);
    }

    if state.registry.get(fd).flags.contains(ConnFlags::NEWLINE_PING_IN_PROGRESS) {
        match state.registry.get_mut(fd).engine_mut().send(NEWLINE_PING) {
            IoStatus::Bytes(_) => {
                state.registry.get_mut(fd).flags.remove(ConnFlags::NEWLINE_PING_IN_PROGRESS);
            }
            IoStatus::Blocked(_) => return Ok(IoOutcome::WouldBlock),
            IoStatus::Fatal(e) => return Err(IoError::Fatal(e.to_string())),
        }
    }

    match state.registry.get_mut(fd).engine_mut().send(buf) {
        IoStatus::Bytes(n) => Ok(IoOutcome::Bytes(n)),
        IoStatus::Blocked(_) => Ok(IoOutcome::WouldBlock),
        IoStatus::Fatal(e) => Err(IoError::Fatal(e.to_string())),
    }
}

/// Sends a liveness probe: a bare newline written directly to the
/// connection, bypassing the command parser and `write`'s pending-flush
/// check (a ping *is* the pending payload, not a payload waiting behind
/// one). Spec.md §4.6: if the engine can't flush it immediately, sets
/// `NEWLINE_PING_IN_PROGRESS` so the next real `write` resends the same
/// byte first — the caller of `ping` performs a best-effort send and is
/// not expected to retry it itself.
pub fn ping(state: &mut TlsState, fd: RawFd) -> Result<IoOutcome, IoError> {
    if !state.enabled {
        return raw_write(fd, NEWLINE_PING);
    }

    let outcome = match state.registry.get_mut(fd).engine_mut().send(NEWLINE_PING) {
        IoStatus::Bytes(n) => Ok(IoOutcome::Bytes(n)),
        IoStatus::Blocked(_) => Ok(IoOutcome::WouldBlock),
        IoStatus::Fatal(e) => Err(IoError::Fatal(e.to_string())),
    };

    if matches!(outcome, Ok(IoOutcome::WouldBlock)) {
        state.registry.get_mut(fd).flags.insert(ConnFlags::NEWLINE_PING_IN_PROGRESS);
    }

    outcome
}

/// Renders an engine/io error for logging or a protocol error reply
/// (spec.md §4.6 `strerror`).
pub fn strerror(err: &IoError) -> String {
    err.to_string()
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> Result<IoOutcome, IoError> {
    match engine::read_fd(fd, buf) {
        Ok(n) => Ok(IoOutcome::Bytes(n)),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
        Err(e) => Err(IoError::Fatal(e.to_string())),
    }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> Result<IoOutcome, IoError> {
    match engine::write_fd(fd, buf) {
        Ok(n) => Ok(IoOutcome::Bytes(n)),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
        Err(e) => Err(IoError::Fatal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strerror_renders_fatal_detail() {
        let e = IoError::Fatal("boom".to_string());
        assert_eq!(strerror(&e), "boom");
    }
}
