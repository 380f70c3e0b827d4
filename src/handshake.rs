//! Handshake driver (spec.md §4.5): translates the engine's blocked status
//! into reactor interest changes, in both event-driven and synchronous
//! forms.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::engine::{Blocked, Conn, HandshakeStatus};
use crate::reactor::{Direction, HandlerId, Mask, Reactor, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiateOutcome {
    Done,
    Retry,
    Failed,
}

/// Drives one step of an asynchronous handshake (spec.md §4.5
/// `negotiate_async`). `source_handler` is armed so the reactor re-enters
/// this same function on the next readiness edge; `post_handler`/`post_mask`
/// are armed once instead, after the handshake completes.
pub fn negotiate_async(
    reactor: &mut dyn Reactor,
    fd: RawFd,
    conn: &mut Conn,
    source_handler: HandlerId,
    post_handler: Option<HandlerId>,
    post_mask: Mask,
    data: Token,
) -> NegotiateOutcome {
    match conn.handshake() {
        HandshakeStatus::Done => {
            reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
            if let Some(post) = post_handler {
                reactor.arm(fd, post_mask, post, data);
            }
            NegotiateOutcome::Done
        }
        HandshakeStatus::Blocked(Blocked::OnRead) => {
            reactor.disarm(fd, Mask::WRITABLE);
            if reactor.get_handler(fd, Direction::Readable) != Some(source_handler) {
                reactor.arm(fd, Mask::READABLE, source_handler, data);
            }
            NegotiateOutcome::Retry
        }
        HandshakeStatus::Blocked(Blocked::OnWrite) => {
            reactor.disarm(fd, Mask::READABLE);
            reactor.arm(fd, Mask::WRITABLE, source_handler, data);
            NegotiateOutcome::Retry
        }
        HandshakeStatus::Fatal(_) => {
            reactor.disarm(fd, Mask::READABLE | Mask::WRITABLE);
            NegotiateOutcome::Failed
        }
    }
}

/// Drives a handshake to completion synchronously, blocking on the
/// reactor's `wait_until_ready` primitive whenever the engine reports
/// blocked (spec.md §4.5 `negotiate_sync`). Used by replication bootstrap
/// phases that want ordered, non-multiplexed setup.
pub fn negotiate_sync(
    reactor: &dyn Reactor,
    fd: RawFd,
    conn: &mut Conn,
    timeout: Duration,
) -> Result<(), NegotiateSyncError> {
    let deadline = Instant::now() + timeout;

    loop {
        match conn.handshake() {
            HandshakeStatus::Done => return Ok(()),
            HandshakeStatus::Fatal(e) => return Err(NegotiateSyncError::Fatal(e.to_string())),
            HandshakeStatus::Blocked(blocked) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(NegotiateSyncError::Timeout);
                }
                let dir = match blocked {
                    Blocked::OnRead => Direction::Readable,
                    Blocked::OnWrite => Direction::Writable,
                };
                if let Err(e) = reactor.wait_until_ready(fd, dir, Some(remaining.as_millis() as u64)) {
                    if e.kind() == std::io::ErrorKind::TimedOut {
                        return Err(NegotiateSyncError::Timeout);
                    }
                    return Err(NegotiateSyncError::Fatal(e.to_string()));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateSyncError {
    Timeout,
    Fatal(String),
}

impl std::fmt::Display for NegotiateSyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiateSyncError::Timeout => write!(f, "handshake timed out"),
            NegotiateSyncError::Fatal(e) => write!(f, "handshake failed: {e}"),
        }
    }
}

impl std::error::Error for NegotiateSyncError {}
