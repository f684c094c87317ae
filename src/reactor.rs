//! Single-threaded event reactor.
//!
//! All core logic is driven from one poll loop: fd readiness, child
//! process reaping, monotonic timers and signals (via a self-pipe).
//! Callbacks never run inside the reactor; [`Reactor::poll`] returns
//! events one at a time and the caller dispatches them. Child-exit
//! events are always delivered before fd and timer events from the same
//! cycle, so a process death is recorded before anything else could
//! signal a recycled pid.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};
use tracing::{debug, warn};

use crate::service::ServiceId;

/// Raw wait status of an exited child, with the usual decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    fn from_wait(ws: &WaitStatus) -> Option<ExitStatus> {
        match ws {
            WaitStatus::Exited(_, code) => Some(ExitStatus(*code << 8)),
            WaitStatus::Signaled(_, sig, _) => Some(ExitStatus(*sig as i32)),
            _ => None,
        }
    }

    /// Whether the process exited normally.
    pub fn did_exit(&self) -> bool {
        libc::WIFEXITED(self.0)
    }

    /// Whether the process exited normally with status 0.
    pub fn did_exit_clean(&self) -> bool {
        self.0 == 0
    }

    /// Exit code, when [`Self::did_exit`].
    pub fn exit_code(&self) -> i32 {
        libc::WEXITSTATUS(self.0)
    }

    /// Whether the process was terminated by a signal.
    pub fn was_signalled(&self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    /// Terminating signal number, when [`Self::was_signalled`].
    pub fn term_signal(&self) -> i32 {
        libc::WTERMSIG(self.0)
    }

    /// The raw integer as carried in status packets.
    pub fn as_int(&self) -> i32 {
        self.0
    }
}

/// Identifies what an fd watch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchTag {
    /// The control socket listener.
    ControlListener,
    /// A control connection, by connection id.
    ControlConn(u32),
    /// A service's exec-status pipe.
    ExecStatus(ServiceId),
    /// A service's readiness pipe.
    Readiness(ServiceId),
    /// A service's captured output pipe.
    LogOutput(ServiceId),
}

/// Identifies a timer. Each process service has a single timer which is
/// armed in one role at a time (restart delay, start timeout or stop
/// timeout); the role is tracked on the service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTag {
    /// The per-service process timer.
    Process(ServiceId),
}

/// Requested readiness interest for an fd watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Wake on read readiness.
    pub read: bool,
    /// Wake on write readiness.
    pub write: bool,
}

impl Interest {
    /// Read readiness only.
    pub const READ: Interest = Interest { read: true, write: false };
    /// Write readiness only.
    pub const WRITE: Interest = Interest { read: false, write: true };
    /// Both directions.
    pub const BOTH: Interest = Interest { read: true, write: true };
    /// Registered but idle.
    pub const NONE: Interest = Interest { read: false, write: false };
}

/// One event delivered by a poll cycle.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    /// A watched child process terminated and was reaped.
    ChildExited {
        /// The service whose child exited.
        sid: ServiceId,
        /// The reaped pid.
        pid: Pid,
        /// Raw wait status.
        status: ExitStatus,
    },
    /// A watched fd became ready.
    FdReady {
        /// The watch this fd belongs to.
        tag: WatchTag,
        /// Readable (or hung up / errored).
        readable: bool,
        /// Writable.
        writable: bool,
    },
    /// A timer expired.
    Timer(TimerTag),
    /// A handled signal arrived (SIGINT, SIGTERM or SIGQUIT).
    Signal(Signal),
}

struct FdWatch {
    fd: RawFd,
    interest: Interest,
    tag: WatchTag,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    tag: TimerTag,
}

// Write end of the signal self-pipe, for the async-signal-safe handler.
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_pipe_handler(signo: libc::c_int) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// The reactor. See module documentation.
pub struct Reactor {
    watches: Vec<FdWatch>,
    timers: Vec<TimerEntry>,
    armed: HashMap<TimerTag, u64>,
    timer_seq: u64,
    child_watches: HashMap<i32, ServiceId>,
    signal_rd: OwnedFd,
    _signal_wr: OwnedFd,
    pending: VecDeque<Event>,
}

impl Reactor {
    /// Creates a reactor. Signal handlers are not installed; see
    /// [`Reactor::watch_signals`].
    pub fn new() -> io::Result<Reactor> {
        let (rd, wr) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(io::Error::from)?;
        Ok(Reactor {
            watches: Vec::new(),
            timers: Vec::new(),
            armed: HashMap::new(),
            timer_seq: 0,
            child_watches: HashMap::new(),
            signal_rd: rd,
            _signal_wr: wr,
            pending: VecDeque::new(),
        })
    }

    /// Routes the given signals through the self-pipe so they surface as
    /// [`Event::Signal`] (SIGCHLD is consumed internally to drive child
    /// reaping). Only one reactor per process may watch signals.
    pub fn watch_signals(&mut self, signals: &[Signal]) -> io::Result<()> {
        SIGNAL_PIPE_WR.store(self._signal_wr.as_raw_fd(), Ordering::Relaxed);
        let action = SigAction::new(
            SigHandler::Handler(signal_pipe_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in signals {
            unsafe {
                sigaction(*sig, &action).map_err(io::Error::from)?;
            }
        }
        Ok(())
    }

    /// Registers an fd watch. The fd is not owned by the reactor.
    pub fn add_fd_watch(&mut self, fd: RawFd, interest: Interest, tag: WatchTag) {
        debug_assert!(!self.watches.iter().any(|w| w.fd == fd));
        self.watches.push(FdWatch { fd, interest, tag });
    }

    /// Adjusts the interest set of a registered fd.
    pub fn set_fd_interest(&mut self, fd: RawFd, interest: Interest) {
        if let Some(w) = self.watches.iter_mut().find(|w| w.fd == fd) {
            w.interest = interest;
        }
    }

    /// Removes an fd watch and any undelivered events for it. Harmless
    /// if the fd is not registered.
    pub fn remove_fd_watch(&mut self, fd: RawFd) {
        let removed: Vec<WatchTag> = self
            .watches
            .iter()
            .filter(|w| w.fd == fd)
            .map(|w| w.tag)
            .collect();
        self.watches.retain(|w| w.fd != fd);
        self.pending.retain(
            |ev| !matches!(ev, Event::FdReady { tag, .. } if removed.contains(tag)),
        );
    }

    /// Watches for the termination of a child process.
    pub fn add_child_watch(&mut self, pid: Pid, sid: ServiceId) {
        self.child_watches.insert(pid.as_raw(), sid);
    }

    /// Stops watching a child. Its eventual exit is still reaped, but no
    /// event is delivered for it.
    pub fn remove_child_watch(&mut self, pid: Pid) {
        self.child_watches.remove(&pid.as_raw());
        self.pending
            .retain(|ev| !matches!(ev, Event::ChildExited { pid: p, .. } if *p == pid));
    }

    /// Arms (or re-arms) a timer relative to now.
    pub fn arm_timer(&mut self, tag: TimerTag, delay: Duration) {
        self.timer_seq += 1;
        self.armed.insert(tag, self.timer_seq);
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.timer_seq,
            tag,
        });
    }

    /// Disarms a timer. A stale entry never fires after this.
    pub fn stop_timer(&mut self, tag: TimerTag) {
        self.armed.remove(&tag);
        self.pending
            .retain(|ev| !matches!(ev, Event::Timer(t) if *t == tag));
    }

    /// Whether the given timer is currently armed.
    pub fn timer_armed(&self, tag: TimerTag) -> bool {
        self.armed.contains_key(&tag)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .iter()
            .filter(|t| self.armed.get(&t.tag) == Some(&t.seq))
            .map(|t| t.deadline)
            .min()
    }

    fn collect_expired_timers(&mut self, now: Instant, out: &mut Vec<Event>) {
        let armed = &mut self.armed;
        self.timers.retain(|t| {
            if armed.get(&t.tag) != Some(&t.seq) {
                return false;
            }
            if t.deadline <= now {
                armed.remove(&t.tag);
                out.push(Event::Timer(t.tag));
                return false;
            }
            true
        });
    }

    fn drain_signal_pipe(&mut self) -> (bool, Vec<Signal>) {
        let mut buf = [0u8; 64];
        let mut got_chld = false;
        let mut signals = Vec::new();
        loop {
            match unistd::read(self.signal_rd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &b in &buf[..n] {
                        match Signal::try_from(b as i32) {
                            Ok(Signal::SIGCHLD) => got_chld = true,
                            Ok(sig) => signals.push(sig),
                            Err(_) => {}
                        }
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        (got_chld, signals)
    }

    fn reap_children(&mut self, out: &mut Vec<Event>) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(ws) => {
                    let Some(pid) = ws.pid() else { break };
                    let Some(status) = ExitStatus::from_wait(&ws) else {
                        // Stopped/continued; not a termination.
                        continue;
                    };
                    match self.child_watches.remove(&pid.as_raw()) {
                        Some(sid) => out.push(Event::ChildExited { sid, pid, status }),
                        None => debug!("reaped unwatched child {}", pid),
                    }
                }
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!("waitpid failed: {err}");
                    break;
                }
            }
        }
    }

    /// Waits for activity and returns the next event, if any. Events
    /// gathered in one poll cycle are handed out one per call so that
    /// dispatch-time mutations (deregistered fds, stopped timers) are
    /// respected for the remainder of the batch.
    pub fn poll(&mut self, max_wait: Option<Duration>) -> io::Result<Vec<Event>> {
        if let Some(ev) = self.pending.pop_front() {
            return Ok(vec![ev]);
        }

        let now = Instant::now();
        let mut timeout = self.next_deadline().map(|d| d.saturating_duration_since(now));
        if let Some(mw) = max_wait {
            timeout = Some(timeout.map_or(mw, |t| t.min(mw)));
        }

        let mut pollfds: Vec<PollFd> = Vec::with_capacity(self.watches.len() + 1);
        pollfds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(self.signal_rd.as_raw_fd()) },
            PollFlags::POLLIN,
        ));
        let mut fd_order: Vec<usize> = Vec::with_capacity(self.watches.len());
        for (i, w) in self.watches.iter().enumerate() {
            let mut flags = PollFlags::empty();
            if w.interest.read {
                flags |= PollFlags::POLLIN;
            }
            if w.interest.write {
                flags |= PollFlags::POLLOUT;
            }
            if flags.is_empty() {
                continue;
            }
            pollfds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(w.fd) }, flags));
            fd_order.push(i);
        }

        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
        };

        match poll(&mut pollfds, poll_timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(err) => return Err(io::Error::from(err)),
        }

        let mut sig_ready = false;
        let mut fd_events: Vec<Event> = Vec::new();
        for (slot, pfd) in pollfds.iter().enumerate() {
            let revents = pfd.revents().unwrap_or_else(PollFlags::empty);
            if revents.is_empty() {
                continue;
            }
            if slot == 0 {
                sig_ready = true;
                continue;
            }
            let w = &self.watches[fd_order[slot - 1]];
            let readable = revents
                .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
            let writable = revents
                .intersects(PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR)
                && w.interest.write;
            fd_events.push(Event::FdReady { tag: w.tag, readable, writable });
        }

        let mut events: Vec<Event> = Vec::new();
        let mut signals = Vec::new();
        if sig_ready {
            let (_, sigs) = self.drain_signal_pipe();
            signals = sigs;
        }
        // Child exits first: deaths are recorded before any other event
        // could cause a signal to be sent to a recycled pid.
        if !self.child_watches.is_empty() || sig_ready {
            self.reap_children(&mut events);
        }
        events.extend(signals.into_iter().map(Event::Signal));
        self.collect_expired_timers(Instant::now(), &mut events);
        events.extend(fd_events);

        if events.is_empty() {
            return Ok(events);
        }
        let first = events.remove(0);
        self.pending.extend(events);
        Ok(vec![first])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: usize) -> ServiceId {
        ServiceId::from_index(n)
    }

    fn poll_until<F: FnMut(&Event) -> bool>(
        rx: &mut Reactor,
        total: Duration,
        mut pred: F,
    ) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            for ev in rx.poll(Some(Duration::from_millis(20))).unwrap() {
                if pred(&ev) {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn timer_fires_once() {
        let mut rx = Reactor::new().unwrap();
        rx.arm_timer(TimerTag::Process(sid(1)), Duration::from_millis(10));
        assert!(poll_until(&mut rx, Duration::from_secs(2), |ev| matches!(
            ev,
            Event::Timer(TimerTag::Process(s)) if *s == sid(1)
        )));
        assert!(!rx.timer_armed(TimerTag::Process(sid(1))));

        // A disarmed timer never fires.
        rx.arm_timer(TimerTag::Process(sid(2)), Duration::from_millis(5));
        rx.stop_timer(TimerTag::Process(sid(2)));
        std::thread::sleep(Duration::from_millis(10));
        for ev in rx.poll(Some(Duration::from_millis(1))).unwrap() {
            assert!(!matches!(ev, Event::Timer(_)));
        }
    }

    #[test]
    fn rearm_supersedes_previous_deadline() {
        let mut rx = Reactor::new().unwrap();
        rx.arm_timer(TimerTag::Process(sid(1)), Duration::from_millis(5));
        rx.arm_timer(TimerTag::Process(sid(1)), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));
        for ev in rx.poll(Some(Duration::from_millis(1))).unwrap() {
            assert!(!matches!(ev, Event::Timer(_)), "stale deadline fired");
        }
        assert!(rx.timer_armed(TimerTag::Process(sid(1))));
    }

    #[test]
    fn fd_watch_reports_readable() {
        let mut rx = Reactor::new().unwrap();
        let (rd, wr) = unistd::pipe().unwrap();
        rx.add_fd_watch(rd.as_raw_fd(), Interest::READ, WatchTag::ControlListener);
        unistd::write(&wr, b"x").unwrap();
        assert!(poll_until(&mut rx, Duration::from_secs(1), |ev| matches!(
            ev,
            Event::FdReady { tag: WatchTag::ControlListener, readable: true, .. }
        )));

        // After removal, no further events for that fd.
        rx.remove_fd_watch(rd.as_raw_fd());
        unistd::write(&wr, b"y").unwrap();
        for ev in rx.poll(Some(Duration::from_millis(10))).unwrap() {
            assert!(!matches!(ev, Event::FdReady { .. }));
        }
    }

    #[test]
    fn idle_interest_is_not_polled() {
        let mut rx = Reactor::new().unwrap();
        let (rd, wr) = unistd::pipe().unwrap();
        rx.add_fd_watch(rd.as_raw_fd(), Interest::NONE, WatchTag::ControlListener);
        unistd::write(&wr, b"x").unwrap();
        for ev in rx.poll(Some(Duration::from_millis(10))).unwrap() {
            assert!(!matches!(ev, Event::FdReady { .. }));
        }
        rx.set_fd_interest(rd.as_raw_fd(), Interest::READ);
        assert!(poll_until(&mut rx, Duration::from_secs(1), |ev| matches!(
            ev,
            Event::FdReady { .. }
        )));
    }

    #[test]
    fn child_exit_is_reaped_and_tagged() {
        let mut rx = Reactor::new().unwrap();
        match unsafe { unistd::fork() }.unwrap() {
            unistd::ForkResult::Child => unsafe { libc::_exit(7) },
            unistd::ForkResult::Parent { child } => {
                rx.add_child_watch(child, sid(3));
                assert!(poll_until(&mut rx, Duration::from_secs(5), |ev| match ev {
                    Event::ChildExited { sid: s, pid, status } => {
                        assert_eq!(*s, sid(3));
                        assert_eq!(*pid, child);
                        assert!(status.did_exit());
                        assert_eq!(status.exit_code(), 7);
                        true
                    }
                    _ => false,
                }));
            }
        }
    }
}
