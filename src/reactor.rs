//! The abstract reactor contract this core consumes (spec.md §6,
//! "Consumed from the reactor").
//!
//! The real event loop lives in the host process and is out of scope; this
//! module defines the trait boundary so the rest of the crate (and its
//! tests) can be exercised without one. `EpollReactor` (Linux) /
//! `KqueueReactor` (macOS) is a small concrete implementation ported from
//! the teacher's `runtime/async/reactor.rs`, generalized from "wake a
//! `Waker`" to "invoke a registered callback", since spec.md's contract is
//! callback-based rather than `Future`-based.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

bitflags::bitflags! {
    /// Readiness interest mask. Redis's event loop calls these
    /// `AE_READABLE`/`AE_WRITABLE`; kept as a bitset since a connection can
    /// be armed for both directions at once during a handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mask: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Readable,
    Writable,
}

/// Opaque identifier for a registered callback, handed back by `arm` and
/// looked up by `get_handler`.
pub type HandlerId = usize;

/// Opaque per-fd user data, analogous to Redis's `clientData` pointer.
pub type Token = usize;

pub type RecurringTaskId = usize;

/// Return value of a recurring task body: "no more" cancels the
/// registration; any other value is the delay in milliseconds until the
/// next run (spec.md §6: "task returns \"no more\" to cancel, or an
/// integer ≥ 0 for the next interval").
pub enum TickResult {
    NoMore,
    NextIn(u64),
}

pub type RecurringTask = Box<dyn FnMut() -> TickResult>;

/// The operations this core needs from a host event loop.
pub trait Reactor {
    fn arm(&mut self, fd: RawFd, mask: Mask, handler: HandlerId, data: Token);
    fn disarm(&mut self, fd: RawFd, mask: Mask);
    fn current_mask(&self, fd: RawFd) -> Mask;
    fn get_handler(&self, fd: RawFd, dir: Direction) -> Option<HandlerId>;
    fn get_data(&self, fd: RawFd) -> Option<Token>;

    fn schedule_recurring(&mut self, interval_ms: u64, task: RecurringTask) -> RecurringTaskId;
    fn cancel_recurring(&mut self, id: RecurringTaskId);

    /// Blocks the calling thread until `fd` is ready for `dir`, or
    /// `timeout_ms` elapses. Used only by the synchronous handshake driver
    /// (spec.md §4.5 `negotiate_sync`); nothing else in this core blocks.
    fn wait_until_ready(&self, fd: RawFd, dir: Direction, timeout_ms: Option<u64>) -> io::Result<Mask>;
}

struct FdState {
    mask: Mask,
    read_handler: Option<HandlerId>,
    write_handler: Option<HandlerId>,
    data: Token,
}

struct Recurring {
    task: RecurringTask,
    next_due: Instant,
}

/// Minimal single-threaded reactor: owns an epoll/kqueue fd, a table of
/// armed fds, and a set of recurring tasks driven by the host's main loop
/// calling `poll_once`. Sufficient to exercise and unit-test §5–§8 without
/// a production event loop attached.
pub struct SimpleReactor {
    poller: Poller,
    fds: HashMap<RawFd, FdState>,
    recurring: HashMap<RecurringTaskId, Recurring>,
    next_recurring_id: RecurringTaskId,
}

impl SimpleReactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            fds: HashMap::new(),
            recurring: HashMap::new(),
            next_recurring_id: 1,
        })
    }

    /// Runs one iteration: waits (bounded by the nearest recurring-task
    /// deadline) for I/O readiness, invokes the caller-supplied `dispatch`
    /// for each ready (fd, direction, handler, data), then runs any due
    /// recurring tasks. This is the shape of one pass through Redis's
    /// `aeProcessEvents` as far as this core is concerned.
    pub fn poll_once(
        &mut self,
        mut dispatch: impl FnMut(RawFd, Direction, HandlerId, Token),
    ) -> io::Result<()> {
        let timeout_ms = self.next_recurring_deadline_ms();
        let ready = self.poller.wait(&self.fds, timeout_ms)?;

        for (fd, dir) in ready {
            if let Some(state) = self.fds.get(&fd) {
                let handler = match dir {
                    Direction::Readable => state.read_handler,
                    Direction::Writable => state.write_handler,
                };
                if let Some(handler) = handler {
                    dispatch(fd, dir, handler, state.data);
                }
            }
        }

        self.run_due_recurring();
        Ok(())
    }

    fn next_recurring_deadline_ms(&self) -> Option<i32> {
        self.recurring
            .values()
            .map(|r| r.next_due.saturating_duration_since(Instant::now()))
            .min()
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
    }

    fn run_due_recurring(&mut self) {
        let now = Instant::now();
        let due: Vec<RecurringTaskId> = self
            .recurring
            .iter()
            .filter(|(_, r)| r.next_due <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let Some(entry) = self.recurring.get_mut(&id) else { continue };
            match (entry.task)() {
                TickResult::NoMore => {
                    self.recurring.remove(&id);
                }
                TickResult::NextIn(ms) => {
                    entry.next_due = Instant::now() + Duration::from_millis(ms);
                }
            }
        }
    }
}

impl Reactor for SimpleReactor {
    fn arm(&mut self, fd: RawFd, mask: Mask, handler: HandlerId, data: Token) {
        let state = self.fds.entry(fd).or_insert_with(|| FdState {
            mask: Mask::empty(),
            read_handler: None,
            write_handler: None,
            data,
        });
        state.data = data;
        if mask.contains(Mask::READABLE) {
            state.read_handler = Some(handler);
        }
        if mask.contains(Mask::WRITABLE) {
            state.write_handler = Some(handler);
        }
        let was_registered = state.mask != Mask::empty();
        state.mask |= mask;
        if !was_registered {
            let _ = self.poller.add(fd, state.mask);
        } else {
            let _ = self.poller.modify(fd, state.mask);
        }
    }

    fn disarm(&mut self, fd: RawFd, mask: Mask) {
        if let Some(state) = self.fds.get_mut(&fd) {
            if mask.contains(Mask::READABLE) {
                state.read_handler = None;
            }
            if mask.contains(Mask::WRITABLE) {
                state.write_handler = None;
            }
            state.mask &= !mask;
            if state.mask == Mask::empty() {
                let _ = self.poller.remove(fd);
                self.fds.remove(&fd);
            } else {
                let _ = self.poller.modify(fd, state.mask);
            }
        }
    }

    fn current_mask(&self, fd: RawFd) -> Mask {
        self.fds.get(&fd).map(|s| s.mask).unwrap_or(Mask::empty())
    }

    fn get_handler(&self, fd: RawFd, dir: Direction) -> Option<HandlerId> {
        self.fds.get(&fd).and_then(|s| match dir {
            Direction::Readable => s.read_handler,
            Direction::Writable => s.write_handler,
        })
    }

    fn get_data(&self, fd: RawFd) -> Option<Token> {
        self.fds.get(&fd).map(|s| s.data)
    }

    fn schedule_recurring(&mut self, interval_ms: u64, task: RecurringTask) -> RecurringTaskId {
        let id = self.next_recurring_id;
        self.next_recurring_id += 1;
        self.recurring.insert(
            id,
            Recurring {
                task,
                next_due: Instant::now() + Duration::from_millis(interval_ms),
            },
        );
        id
    }

    fn cancel_recurring(&mut self, id: RecurringTaskId) {
        self.recurring.remove(&id);
    }

    fn wait_until_ready(&self, fd: RawFd, dir: Direction, timeout_ms: Option<u64>) -> io::Result<Mask> {
        let want = match dir {
            Direction::Readable => Mask::READABLE,
            Direction::Writable => Mask::WRITABLE,
        };
        self.poller.wait_single(fd, want, timeout_ms)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use libc::{
        epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
        EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    };

    pub struct Poller {
        epoll_fd: RawFd,
    }

    fn mask_to_events(mask: Mask) -> u32 {
        let mut events = (EPOLLERR | EPOLLHUP) as u32;
        if mask.contains(Mask::READABLE) {
            events |= EPOLLIN as u32;
        }
        if mask.contains(Mask::WRITABLE) {
            events |= EPOLLOUT as u32;
        }
        events
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let epoll_fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
            if epoll_fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { epoll_fd })
        }

        pub fn add(&self, fd: RawFd, mask: Mask) -> io::Result<()> {
            self.ctl(EPOLL_CTL_ADD, fd, mask)
        }

        pub fn modify(&self, fd: RawFd, mask: Mask) -> io::Result<()> {
            self.ctl(EPOLL_CTL_MOD, fd, mask)
        }

        pub fn remove(&self, fd: RawFd) -> io::Result<()> {
            let mut event: epoll_event = unsafe { std::mem::zeroed() };
            if unsafe { epoll_ctl(self.epoll_fd, EPOLL_CTL_DEL, fd, &mut event) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn ctl(&self, op: i32, fd: RawFd, mask: Mask) -> io::Result<()> {
            let mut event = epoll_event { events: mask_to_events(mask), u64: fd as u64 };
            if unsafe { epoll_ctl(self.epoll_fd, op, fd, &mut event) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn wait(
            &self,
            fds: &HashMap<RawFd, super::FdState>,
            timeout_ms: Option<i32>,
        ) -> io::Result<Vec<(RawFd, Direction)>> {
            let _ = fds;
            const MAX_EVENTS: usize = 1024;
            let mut events: Vec<epoll_event> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
            let n = unsafe {
                epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms.unwrap_or(-1))
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            let mut ready = Vec::with_capacity(n as usize);
            for event in events.iter().take(n as usize) {
                let fd = event.u64 as RawFd;
                if event.events as i32 & EPOLLIN != 0 {
                    ready.push((fd, Direction::Readable));
                }
                if event.events as i32 & EPOLLOUT != 0 {
                    ready.push((fd, Direction::Writable));
                }
            }
            Ok(ready)
        }

        pub fn wait_single(&self, fd: RawFd, want: Mask, timeout_ms: Option<u64>) -> io::Result<Mask> {
            self.add(fd, want).ok();
            let mut events: [epoll_event; 1] = unsafe { std::mem::zeroed() };
            let timeout = timeout_ms.map(|ms| ms.min(i32::MAX as u64) as i32).unwrap_or(-1);
            let n = unsafe { epoll_wait(self.epoll_fd, events.as_mut_ptr(), 1, timeout) };
            self.remove(fd).ok();
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "wait_until_ready timed out"));
            }
            let mut got = Mask::empty();
            if events[0].events as i32 & EPOLLIN != 0 {
                got |= Mask::READABLE;
            }
            if events[0].events as i32 & EPOLLOUT != 0 {
                got |= Mask::WRITABLE;
            }
            Ok(got)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe { libc::close(self.epoll_fd) };
        }
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::*;
    use libc::{kevent, kqueue, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE};

    pub struct Poller {
        kq: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let kq = unsafe { kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { kq })
        }

        fn change(&self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
            let event = kevent {
                ident: fd as usize,
                filter,
                flags,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            if unsafe { kevent(self.kq, &event, 1, std::ptr::null_mut(), 0, std::ptr::null()) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn add(&self, fd: RawFd, mask: Mask) -> io::Result<()> {
            if mask.contains(Mask::READABLE) {
                self.change(fd, EVFILT_READ, EV_ADD | EV_ENABLE)?;
            }
            if mask.contains(Mask::WRITABLE) {
                self.change(fd, EVFILT_WRITE, EV_ADD | EV_ENABLE)?;
            }
            Ok(())
        }

        pub fn modify(&self, fd: RawFd, mask: Mask) -> io::Result<()> {
            self.add(fd, mask)
        }

        pub fn remove(&self, fd: RawFd) -> io::Result<()> {
            let _ = self.change(fd, EVFILT_READ, EV_DELETE);
            let _ = self.change(fd, EVFILT_WRITE, EV_DELETE);
            Ok(())
        }

        pub fn wait(
            &self,
            _fds: &HashMap<RawFd, super::FdState>,
            timeout_ms: Option<i32>,
        ) -> io::Result<Vec<(RawFd, Direction)>> {
            const MAX_EVENTS: usize = 1024;
            let mut events: Vec<kevent> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
            let ts = timeout_ms.map(to_timespec);
            let ts_ptr = ts.as_ref().map(|t| t as *const _).unwrap_or(std::ptr::null());
            let n = unsafe {
                kevent(self.kq, std::ptr::null(), 0, events.as_mut_ptr(), MAX_EVENTS as i32, ts_ptr)
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            let mut ready = Vec::with_capacity(n as usize);
            for event in events.iter().take(n as usize) {
                let fd = event.ident as RawFd;
                let dir = if event.filter == EVFILT_READ { Direction::Readable } else { Direction::Writable };
                ready.push((fd, dir));
            }
            Ok(ready)
        }

        pub fn wait_single(&self, fd: RawFd, want: Mask, timeout_ms: Option<u64>) -> io::Result<Mask> {
            self.add(fd, want).ok();
            let mut events: [kevent; 1] = unsafe { std::mem::zeroed() };
            let ts = timeout_ms.map(|ms| to_timespec(ms.min(i32::MAX as u64) as i32));
            let ts_ptr = ts.as_ref().map(|t| t as *const _).unwrap_or(std::ptr::null());
            let n = unsafe { kevent(self.kq, std::ptr::null(), 0, events.as_mut_ptr(), 1, ts_ptr) };
            self.remove(fd).ok();
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "wait_until_ready timed out"));
            }
            let dir = if events[0].filter == EVFILT_READ { Mask::READABLE } else { Mask::WRITABLE };
            Ok(dir)
        }
    }

    fn to_timespec(ms: i32) -> libc::timespec {
        libc::timespec {
            tv_sec: (ms / 1000) as i64,
            tv_nsec: ((ms % 1000) * 1_000_000) as i64,
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe { libc::close(self.kq) };
        }
    }
}

use sys::Poller;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn arm_then_disarm_clears_handler() {
        let mut reactor = SimpleReactor::new().expect("reactor");
        let (a, _b) = UnixStream::pair().expect("pair");
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&a);

        reactor.arm(fd, Mask::READABLE, 7, 42);
        assert_eq!(reactor.get_handler(fd, Direction::Readable), Some(7));
        assert_eq!(reactor.get_data(fd), Some(42));

        reactor.disarm(fd, Mask::READABLE);
        assert_eq!(reactor.get_handler(fd, Direction::Readable), None);
        assert_eq!(reactor.current_mask(fd), Mask::empty());
    }

    #[test]
    fn recurring_task_cancels_on_no_more() {
        let mut reactor = SimpleReactor::new().expect("reactor");
        let ticks = std::rc::Rc::new(std::cell::Cell::new(0));
        let ticks_clone = ticks.clone();
        let id = reactor.schedule_recurring(0, Box::new(move || {
            ticks_clone.set(ticks_clone.get() + 1);
            if ticks_clone.get() >= 2 {
                TickResult::NoMore
            } else {
                TickResult::NextIn(0)
            }
        }));
        assert!(reactor.recurring.contains_key(&id));
        reactor.run_due_recurring();
        reactor.run_due_recurring();
        assert_eq!(ticks.get(), 2);
        assert!(!reactor.recurring.contains_key(&id));
    }
}
