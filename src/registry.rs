//! Connection registry (spec.md §4.4): dense fd-indexed storage.
//!
//! Lookup failure is a programming error (the fd must have gone through
//! `insert` via one of the `setup_*` entry points), so `get`/`get_mut`
//! assert rather than return `Option`. `try_get` exists for the one caller
//! that legitimately needs to check first (the repeated-read scheduler,
//! which may race a connection's own cleanup within one tick).

use std::os::unix::io::RawFd;

use crate::error::RegistryError;
use crate::state::Connection;

pub struct ConnRegistry {
    slots: Vec<Option<Connection>>,
}

impl ConnRegistry {
    pub fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Inserts a connection at `fd`. Asserts `fd < capacity` — the host is
    /// responsible for sizing the registry before accepting connections
    /// (spec.md §4.4).
    pub fn insert(&mut self, fd: RawFd, conn: Connection) {
        let idx = fd as usize;
        assert!(idx < self.slots.len(), "fd {fd} out of registry range ({})", self.slots.len());
        self.slots[idx] = Some(conn);
    }

    /// Looks up a connection. Panics if `fd` is out of range or the slot is
    /// empty — per spec.md §7, "lookup failure is a programming error, not
    /// a runtime error."
    pub fn get(&self, fd: RawFd) -> &Connection {
        self.try_get(fd).unwrap_or_else(|| panic!("no connection registered for fd {fd}"))
    }

    pub fn get_mut(&mut self, fd: RawFd) -> &mut Connection {
        self.try_get_mut(fd).unwrap_or_else(|| panic!("no connection registered for fd {fd}"))
    }

    pub fn try_get(&self, fd: RawFd) -> Option<&Connection> {
        self.slots.get(fd as usize).and_then(|s| s.as_ref())
    }

    pub fn try_get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.slots.get_mut(fd as usize).and_then(|s| s.as_mut())
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.try_get(fd).is_some()
    }

    /// Removes and returns the connection at `fd`, if any.
    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.slots.get_mut(fd as usize).and_then(|s| s.take())
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &Connection)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|c| (fd as RawFd, c)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RawFd, &mut Connection)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_mut().map(|c| (fd as RawFd, c)))
    }

    fn highest_occupied(&self) -> Option<usize> {
        self.slots.iter().rposition(|s| s.is_some())
    }

    /// Resizes the registry. Shrinking is permitted iff no occupied slot
    /// has index ≥ `new_size` (spec.md §4.4, §8 "Registry resize"); growing
    /// and same-size resizes always succeed.
    pub fn resize(&mut self, new_size: usize) -> Result<(), RegistryError> {
        if new_size == self.slots.len() {
            return Ok(());
        }

        if new_size < self.slots.len() {
            if let Some(highest) = self.highest_occupied() {
                if highest >= new_size {
                    return Err(RegistryError::CapacityExceeded {
                        max_occupied: highest,
                        requested_size: new_size,
                    });
                }
            }
        }

        // `Vec::resize` replaces the backing allocation as needed and
        // updates `self.slots` in place — unlike the original's `realloc`
        // call, there is no separately-returned pointer that could be
        // discarded (spec.md §9 "Open question").
        self.slots.resize_with(new_size, || None);
        Ok(())
    }
}
