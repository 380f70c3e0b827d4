//! Repeated-read scheduler (spec.md §4.7).
//!
//! A single TLS record can yield more plaintext than one `read()` call
//! delivers to the caller. Once that happens there may be no further
//! kernel readiness edge to tell the reactor to re-invoke the read
//! handler, so this scheduler drains it itself: connections with
//! undelivered plaintext are parked on an ordered list, and a recurring
//! reactor task re-invokes each one's registered read handler once per
//! event-loop iteration until the list runs dry.
//!
//! Design note (see spec.md §9 "back-pointer into a list"): rather than
//! the original's intrusive list-node pointer, `Connection::cached_data_node`
//! is the "tagged enqueued|not-enqueued" representation spec.md calls out
//! as the minimum faithful port. The list itself stays a plain `Vec<RawFd>`
//! in enqueue order; removal is a linear scan, which is fine at the sizes
//! this list actually reaches (bounded by how many connections are
//! mid-record at once, not by total connection count).

use std::os::unix::io::RawFd;

use crate::logging::log_debug;
use crate::reactor::{Direction, Reactor, TickResult};
use crate::state::TlsState;

#[derive(Default)]
pub struct RepeatedReadList {
    order: Vec<RawFd>,
}

impl RepeatedReadList {
    pub fn new() -> Self {
        Self { order: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.order.contains(&fd)
    }

    /// Enqueues `fd` if not already present. Returns `true` if this call
    /// actually inserted it (spec.md §8: "calling `addRepeatedRead` twice
    /// ... leaves the list length unchanged").
    pub fn push(&mut self, fd: RawFd) -> bool {
        if self.contains(fd) {
            return false;
        }
        self.order.push(fd);
        true
    }

    /// Removes `fd` if present. A no-op if it wasn't enqueued (spec.md §8).
    pub fn remove(&mut self, fd: RawFd) -> bool {
        if let Some(pos) = self.order.iter().position(|&x| x == fd) {
            self.order.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> Vec<RawFd> {
        self.order.clone()
    }
}

/// Enqueues `fd` for repeated reads. Mirrors spec.md §4.7: "on first
/// enqueue, arms a periodic drain." The periodic part is `run_tick`, which
/// the host invokes from its own recurring reactor task; a `'static`
/// reactor closure can't safely borrow `&mut TlsState`, so rather than
/// registering one here, `repeated_reads_armed` just tracks whether the
/// host's existing recurring registration currently has work to do — hosts
/// that want to avoid polling an idle drain can check it before scheduling.
pub fn add_repeated_read(state: &mut TlsState, fd: RawFd) {
    if !state.repeated_reads.push(fd) {
        return;
    }
    if let Some(conn) = state.registry.try_get_mut(fd) {
        conn.cached_data_node = true;
    }
    state.repeated_reads_armed = true;
}

pub fn remove_repeated_read(state: &mut TlsState, fd: RawFd) {
    if state.repeated_reads.remove(fd) {
        if let Some(conn) = state.registry.try_get_mut(fd) {
            conn.cached_data_node = false;
        }
    }
    state.repeated_reads_armed = !state.repeated_reads.is_empty();
}

/// The per-tick body (spec.md §4.7 steps 1-5): re-invoke each enqueued
/// connection's read handler once, then report whether the list still
/// has work (`NextIn(0)`) or has drained (`NoMore`), so the host's own
/// recurring-task callback knows whether to keep itself scheduled.
pub fn run_tick(
    state: &mut TlsState,
    reactor: &mut dyn Reactor,
    mut invoke_handler: impl FnMut(&mut TlsState, &mut dyn Reactor, RawFd),
) -> TickResult {
    if !state.enabled || state.repeated_reads.is_empty() {
        state.repeated_reads_armed = false;
        return TickResult::NoMore;
    }

    let snapshot = state.repeated_reads.snapshot();
    state.max_repeated_read_list_len = state.max_repeated_read_list_len.max(snapshot.len() as u64);
    log_debug!("repeated-read tick draining {} connection(s)", snapshot.len());

    for fd in snapshot {
        if reactor.get_handler(fd, Direction::Readable).is_some() {
            state.total_repeated_reads += 1;
            invoke_handler(state, reactor, fd);
        }
    }

    if state.repeated_reads.is_empty() {
        state.repeated_reads_armed = false;
        TickResult::NoMore
    } else {
        TickResult::NextIn(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_is_idempotent() {
        let mut list = RepeatedReadList::new();
        assert!(list.push(5));
        assert!(!list.push(5));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_missing_is_noop() {
        let mut list = RepeatedReadList::new();
        assert!(!list.remove(9));
    }

    #[test]
    fn snapshot_preserves_enqueue_order() {
        let mut list = RepeatedReadList::new();
        list.push(3);
        list.push(1);
        list.push(2);
        assert_eq!(list.snapshot(), vec![3, 1, 2]);
    }
}
