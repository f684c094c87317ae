//! Process supervision for process-backed services.
//!
//! Covers the bring-up pipeline (activation socket, exec-status pipe,
//! readiness pipe, control-socket pair, output capture, fork), exec
//! outcome plumbing, pid-file adoption for self-daemonising services,
//! scripted start/stop, smooth recovery, rate-limited restart and the
//! three-role process timer.

use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{
    bind, listen, socket, socketpair, AddressFamily, Backlog, SockFlag, SockType,
    UnixAddr,
};
use nix::sys::stat::SFlag;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::constants::{LOG_BUFFER_MAX, SOCKET_BACKLOG};
use crate::error::ExecError;
use crate::proto::{ExecStage, ServiceState, StoppedReason};
use crate::reactor::{ExitStatus, Interest, Reactor, TimerTag, WatchTag};
use crate::run_child::{self, RunParams};
use crate::service::{ServiceId, ServiceSet};
use crate::settings::{LogType, ServiceKind, ServiceSettings};

/// Sliding-window accounting for automatic restarts.
///
/// `interval_start` marks the window; restarts within `interval` count
/// against `max_count`. A zero `max_count` disables the cap.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    interval: Duration,
    max_count: u32,
    interval_start: Option<Instant>,
    count: u32,
}

impl RestartTracker {
    /// Creates a tracker with the given window and cap.
    pub fn new(interval: Duration, max_count: u32) -> RestartTracker {
        RestartTracker { interval, max_count, interval_start: None, count: 0 }
    }

    /// Starts a fresh window (new service start).
    pub fn reset(&mut self, now: Instant) {
        self.interval_start = Some(now);
        self.count = 0;
    }

    /// Whether another automatic restart is allowed at `now`. Restarts
    /// outside the current window open a new one.
    pub fn check_restart_allowed(&mut self, now: Instant) -> bool {
        if self.max_count == 0 {
            return true;
        }
        match self.interval_start {
            Some(start) if now.duration_since(start) < self.interval => {
                self.count < self.max_count
            }
            _ => {
                self.interval_start = Some(now);
                self.count = 0;
                true
            }
        }
    }

    /// Records a restart within the current window.
    pub fn note_restart(&mut self) {
        self.count += 1;
    }

    /// Restarts recorded in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Outcome of reading and adopting a bgprocess pid file.
enum PidResult {
    Ok,
    /// Failed to read the file or the pid is invalid.
    Failed,
    /// Pid read successfully but the process already terminated.
    Terminated(ExitStatus),
}

/// Which of a service's two commands to launch.
#[derive(Clone, Copy, PartialEq, Eq)]
enum LaunchCmd {
    Start,
    Stop,
}

/// Live-process state for a process-backed service record.
#[derive(Debug)]
pub struct ProcState {
    pub(crate) pid: Option<Pid>,
    pub(crate) exit_status: Option<ExitStatus>,

    pub(crate) exec_fd: Option<OwnedFd>,
    pub(crate) notify_fd: Option<OwnedFd>,
    pub(crate) socket_fd: Option<OwnedFd>,
    pub(crate) log_rd_fd: Option<OwnedFd>,
    pub(crate) log_wr_fd: Option<OwnedFd>,
    pub(crate) log_buffer: Vec<u8>,

    pub(crate) waiting_for_execstat: bool,
    /// Whether the live pid is our own child (false for an adopted
    /// daemon we can signal but not reap).
    pub(crate) tracking_child: bool,
    /// The process timer is armed as a restart delay.
    pub(crate) waiting_restart_timer: bool,
    /// The process timer is armed as a start or stop timeout.
    pub(crate) waiting_stopstart_timer: bool,
    pub(crate) doing_smooth_recovery: bool,
    /// Scripted: the start script was interrupted with SIGINT.
    pub(crate) interrupting_start: bool,
    /// Scripted: the current child is the stop command.
    pub(crate) stopping_script: bool,
    /// Readiness notification received.
    pub(crate) ready: bool,

    pub(crate) last_start_time: Option<Instant>,
    pub(crate) restart_tracker: RestartTracker,
    pub(crate) exec_err: Option<ExecError>,
}

impl ProcState {
    pub(crate) fn new(settings: &ServiceSettings) -> ProcState {
        ProcState {
            pid: None,
            exit_status: None,
            exec_fd: None,
            notify_fd: None,
            socket_fd: None,
            log_rd_fd: None,
            log_wr_fd: None,
            log_buffer: Vec::new(),
            waiting_for_execstat: false,
            tracking_child: false,
            waiting_restart_timer: false,
            waiting_stopstart_timer: false,
            doing_smooth_recovery: false,
            interrupting_start: false,
            stopping_script: false,
            ready: false,
            last_start_time: None,
            restart_tracker: RestartTracker::new(
                settings.restart_interval,
                settings.max_restart_count,
            ),
            exec_err: None,
        }
    }

    pub(crate) fn update_policy(&mut self, settings: &ServiceSettings) {
        self.restart_tracker.interval = settings.restart_interval;
        self.restart_tracker.max_count = settings.max_restart_count;
    }

    pub(crate) fn close_activation_socket(&mut self) {
        self.socket_fd = None;
    }

    /// The captured output ring (LogType::Buffer).
    pub fn log_buffer(&self) -> &[u8] {
        &self.log_buffer
    }
}

/// Parses a pid file: ASCII decimal, optional trailing whitespace, must
/// fit a `pid_t`.
pub fn parse_pid_file(path: &Path) -> Result<Pid, String> {
    let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err("pid file is empty".into());
    }
    let value: u64 = trimmed.parse().map_err(|_| "pid file is not numeric".to_string())?;
    if value > libc::pid_t::MAX as u64 || value == 0 {
        return Err("pid out of range".into());
    }
    Ok(Pid::from_raw(value as libc::pid_t))
}

impl ServiceSet {
    // ------------------------------------------------------------------
    // Bring-up
    // ------------------------------------------------------------------

    /// Opens the activation socket if configured. Idempotent; returns
    /// false on failure.
    pub(crate) fn open_activation_socket(&mut self, sid: ServiceId) -> bool {
        let name = self.rec(sid).name().to_owned();
        let Some(cfg) = self.rec(sid).settings.activation_socket.clone() else {
            return true;
        };
        let Some(proc) = self.rec(sid).proc.as_ref() else {
            return true;
        };
        if proc.socket_fd.is_some() {
            return true;
        }

        match nix::sys::stat::stat(&cfg.path) {
            Ok(st) => {
                if !SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFSOCK) {
                    error!("{name}: activation socket file exists (and is not a socket)");
                    return false;
                }
            }
            Err(Errno::ENOENT) => {}
            Err(err) => {
                error!("{name}: error checking activation socket: {err}");
                return false;
            }
        }

        // Remove a stale socket file; a bind failure will surface any
        // other unlink problem.
        let _ = fs::remove_file(&cfg.path);

        let sock = match socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        ) {
            Ok(fd) => fd,
            Err(err) => {
                error!("{name}: error creating activation socket: {err}");
                return false;
            }
        };

        let addr = match UnixAddr::new(&cfg.path) {
            Ok(a) => a,
            Err(err) => {
                error!("{name}: bad activation socket path: {err}");
                return false;
            }
        };
        if let Err(err) = bind(sock.as_raw_fd(), &addr) {
            error!("{name}: error binding activation socket: {err}");
            return false;
        }

        if cfg.uid.is_some() || cfg.gid.is_some() {
            if let Err(err) = unistd::chown(&cfg.path, cfg.uid, cfg.gid) {
                error!("{name}: error setting activation socket owner/group: {err}");
                return false;
            }
        }

        let cpath = match CString::new(cfg.path.as_os_str().as_encoded_bytes()) {
            Ok(p) => p,
            Err(_) => {
                error!("{name}: bad activation socket path");
                return false;
            }
        };
        if unsafe { libc::chmod(cpath.as_ptr(), cfg.mode as libc::mode_t) } != 0 {
            error!(
                "{name}: error setting activation socket permissions: {}",
                Errno::last()
            );
            return false;
        }

        let backlog = Backlog::new(SOCKET_BACKLOG).unwrap_or(Backlog::MAXCONN);
        if let Err(err) = listen(&sock, backlog) {
            error!("{name}: error listening on activation socket: {err}");
            return false;
        }

        self.rec_mut(sid).proc.as_mut().unwrap().socket_fd = Some(sock);
        true
    }

    /// Process-kind bring-up: launch (or schedule the rate-limited
    /// re-launch of) the service process.
    pub(crate) fn proc_bring_up(&mut self, sid: ServiceId, rx: &mut Reactor) -> bool {
        let restarting = self.rec(sid).restarting;
        if restarting {
            if !self.restart_ps_process(sid, rx) {
                self.rec_mut(sid).stop_reason = StoppedReason::Terminated;
                return false;
            }
            true
        } else {
            let now = Instant::now();
            if let Some(proc) = self.rec_mut(sid).proc.as_mut() {
                proc.restart_tracker.reset(now);
            }
            let on_console = {
                let f = &self.rec(sid).settings.flags;
                f.starts_on_console || f.shares_console
            };
            let ok = self.start_ps_process(sid, LaunchCmd::Start, on_console, rx);
            if ok {
                self.arm_start_timeout(sid, rx);
            }
            ok
        }
    }

    fn arm_start_timeout(&mut self, sid: ServiceId, rx: &mut Reactor) {
        let timeout = self.rec(sid).settings.start_timeout;
        let proc = self.rec_mut(sid).proc.as_mut().unwrap();
        if !timeout.is_zero() {
            proc.waiting_stopstart_timer = true;
            rx.arm_timer(TimerTag::Process(sid), timeout);
        } else if proc.waiting_stopstart_timer {
            proc.waiting_stopstart_timer = false;
            rx.stop_timer(TimerTag::Process(sid));
        }
    }

    /// Forks and execs one of the service's commands. On success the
    /// child pid is recorded and the exec-status pipe watched.
    fn start_ps_process(
        &mut self,
        sid: ServiceId,
        which: LaunchCmd,
        on_console: bool,
        rx: &mut Reactor,
    ) -> bool {
        let name = self.rec(sid).name().to_owned();
        let settings = self.rec(sid).settings.clone();
        let command = match which {
            LaunchCmd::Start => &settings.command,
            LaunchCmd::Stop => &settings.stop_command,
        };
        if command.is_empty() {
            error!("{name}: no command configured");
            return false;
        }
        let args: Vec<CString> = match command
            .iter()
            .map(|a| CString::new(a.as_bytes()))
            .collect::<Result<_, _>>()
        {
            Ok(v) => v,
            Err(_) => {
                error!("{name}: command contains NUL byte");
                return false;
            }
        };

        // An exec-status pipe communicates exec success or failure from
        // the child: CLOEXEC means a successful exec closes it and the
        // parent sees EOF; on failure the child writes the stage and
        // errno before exiting.
        let (exec_rd, exec_wr) = match unistd::pipe2(OFlag::O_CLOEXEC) {
            Ok(p) => p,
            Err(err) => {
                error!("{name}: can't create status check pipe: {err}");
                return false;
            }
        };

        // Output pipe for captured log types, created once and kept
        // across re-launches.
        if matches!(settings.log_type, LogType::Buffer | LogType::Pipe) {
            let have_pipe = self.rec(sid).proc.as_ref().unwrap().log_wr_fd.is_some();
            if !have_pipe {
                match unistd::pipe2(OFlag::O_CLOEXEC) {
                    Ok((lrd, lwr)) => {
                        if settings.log_type == LogType::Buffer {
                            rx.add_fd_watch(
                                lrd.as_raw_fd(),
                                Interest::READ,
                                WatchTag::LogOutput(sid),
                            );
                        }
                        let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                        proc.log_rd_fd = Some(lrd);
                        proc.log_wr_fd = Some(lwr);
                    }
                    Err(err) => {
                        error!("{name}: can't create output pipe: {err}");
                        return false;
                    }
                }
            }
        }

        // Control socket pair, one end passed to the child.
        let mut cs_pair: Option<(OwnedFd, OwnedFd)> = None;
        if settings.flags.pass_control_fd {
            match socketpair(
                AddressFamily::Unix,
                SockType::Stream,
                None,
                SockFlag::SOCK_NONBLOCK,
            ) {
                Ok((ours, theirs)) => {
                    set_cloexec(ours.as_raw_fd());
                    cs_pair = Some((ours, theirs));
                }
                Err(err) => {
                    error!("{name}: can't create control socket: {err}");
                    return false;
                }
            }
        }

        // Readiness pipe: read end stays with us (CLOEXEC); the write
        // end is placed in the child at a configured fd or advertised
        // through an environment variable.
        let mut notify_pipe: Option<(OwnedFd, OwnedFd)> = None;
        if settings.has_notify() {
            match unistd::pipe2(OFlag::empty()) {
                Ok((nrd, nwr)) => {
                    set_cloexec(nrd.as_raw_fd());
                    notify_pipe = Some((nrd, nwr));
                }
                Err(err) => {
                    error!("{name}: can't create notification pipe: {err}");
                    return false;
                }
            }
        }

        rx.add_fd_watch(exec_rd.as_raw_fd(), Interest::READ, WatchTag::ExecStatus(sid));

        let socket_fd = self
            .rec(sid)
            .proc
            .as_ref()
            .unwrap()
            .socket_fd
            .as_ref()
            .map(|f| f.as_raw_fd());
        let log_wr = self
            .rec(sid)
            .proc
            .as_ref()
            .unwrap()
            .log_wr_fd
            .as_ref()
            .map(|f| f.as_raw_fd());

        let params = RunParams {
            args: &args,
            working_dir: settings.working_dir.as_deref(),
            env_file: settings.env_file.as_deref(),
            logfile: settings.logfile.as_deref(),
            on_console,
            in_foreground: on_console && !settings.flags.shares_console,
            exec_status_fd: exec_wr.as_raw_fd(),
            cs_fd: cs_pair.as_ref().map(|p| p.1.as_raw_fd()),
            socket_fd,
            notify_fd: notify_pipe.as_ref().map(|p| p.1.as_raw_fd()),
            force_notify_fd: settings.notify_fd,
            notify_var: settings.notify_var.as_deref(),
            output_fd: log_wr,
            uid: settings.run_as_uid,
            gid: settings.run_as_gid,
            unmask_sigint: settings.flags.unmask_sigint,
        };

        // The fork is performed with the child watch registered up
        // front so the reap priority rule holds from the first moment.
        let fork_res = unsafe { unistd::fork() };
        match fork_res {
            Ok(ForkResult::Child) => {
                // Child: never returns.
                run_child::run_child_proc(&params);
            }
            Ok(ForkResult::Parent { child }) => {
                drop(exec_wr);
                if let Some((ours, theirs)) = cs_pair {
                    drop(theirs);
                    self.queue_control_fd(ours);
                }
                let notify_rd = notify_pipe.map(|(nrd, nwr)| {
                    drop(nwr);
                    nrd
                });
                if let Some(nrd) = notify_rd.as_ref() {
                    rx.add_fd_watch(
                        nrd.as_raw_fd(),
                        Interest::READ,
                        WatchTag::Readiness(sid),
                    );
                }
                rx.add_child_watch(child, sid);

                debug!("{name}: forked pid {child}");
                let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                proc.pid = Some(child);
                proc.exit_status = None;
                proc.exec_fd = Some(exec_rd);
                proc.notify_fd = notify_rd;
                proc.waiting_for_execstat = true;
                proc.ready = false;
                proc.tracking_child = true;
                proc.stopping_script = which == LaunchCmd::Stop;
                proc.last_start_time = Some(Instant::now());
                true
            }
            Err(err) => {
                error!("{name}: could not fork: {err}");
                rx.remove_fd_watch(exec_rd.as_raw_fd());
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Restart / smooth recovery
    // ------------------------------------------------------------------

    /// Rate-limited process (re-)launch. Returns false if the restart
    /// cap has been exceeded; otherwise the process is launched now or
    /// the restart-delay timer is armed.
    fn restart_ps_process(&mut self, sid: ServiceId, rx: &mut Reactor) -> bool {
        let now = Instant::now();
        let name = self.rec(sid).name().to_owned();
        let (allowed, elapsed, delay) = {
            let delay = self.rec(sid).settings.restart_delay;
            let proc = self.rec_mut(sid).proc.as_mut().unwrap();
            let allowed = proc.restart_tracker.check_restart_allowed(now);
            let elapsed = proc
                .last_start_time
                .map(|t| now.duration_since(t))
                .unwrap_or(delay);
            (allowed, elapsed, delay)
        };

        if !allowed {
            error!("service {name} restarting too quickly; stopping");
            return false;
        }

        if elapsed >= delay {
            self.do_restart(sid, rx);
        } else {
            let proc = self.rec_mut(sid).proc.as_mut().unwrap();
            proc.waiting_restart_timer = true;
            rx.arm_timer(TimerTag::Process(sid), delay - elapsed);
        }
        true
    }

    /// Actually re-launches the process; we may be Starting (regular
    /// restart) or Started (smooth recovery).
    fn do_restart(&mut self, sid: ServiceId, rx: &mut Reactor) {
        {
            let proc = self.rec_mut(sid).proc.as_mut().unwrap();
            proc.waiting_restart_timer = false;
            proc.restart_tracker.note_restart();
        }

        let state = self.rec(sid).state;
        if state == ServiceState::Starting && !self.check_deps_started(sid) {
            self.rec_mut(sid).waiting_for_deps = true;
            return;
        }

        let on_console = {
            let rec = self.rec(sid);
            if state == ServiceState::Starting {
                rec.settings.flags.starts_on_console && rec.have_console
            } else {
                rec.settings.flags.runs_on_console || rec.settings.flags.shares_console
            }
        };

        if self.start_ps_process(sid, LaunchCmd::Start, on_console, rx) {
            if state == ServiceState::Starting {
                self.arm_start_timeout(sid, rx);
            }
        } else {
            self.rec_mut(sid).restarting = false;
            if state == ServiceState::Starting {
                self.failed_to_start(sid, false, rx);
            } else {
                // Smooth recovery launch failed.
                self.rec_mut(sid)
                    .proc
                    .as_mut()
                    .unwrap()
                    .doing_smooth_recovery = false;
                self.unrecoverable_stop(sid, rx);
            }
        }
    }

    /// Re-launches the process behind a Started service without
    /// changing the service's externally visible state.
    fn do_smooth_recovery(&mut self, sid: ServiceId, rx: &mut Reactor) {
        info!("service {}: smooth recovery", self.rec(sid).name());
        self.rec_mut(sid)
            .proc
            .as_mut()
            .unwrap()
            .doing_smooth_recovery = true;
        if !self.restart_ps_process(sid, rx) {
            self.rec_mut(sid)
                .proc
                .as_mut()
                .unwrap()
                .doing_smooth_recovery = false;
            self.rec_mut(sid).stop_reason = StoppedReason::Terminated;
            self.unrecoverable_stop(sid, rx);
        }
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Signals the service process (or its process group).
    fn kill_pg(&mut self, sid: ServiceId, signo: Signal) {
        let Some(pid) = self.rec(sid).pid() else {
            return;
        };
        let target = if self.rec(sid).settings.flags.signal_process_only {
            pid
        } else {
            // Signal the whole group; if the group cannot be determined
            // the process must be a group leader in another session.
            let pgid = unistd::getpgid(Some(pid)).unwrap_or(pid);
            Pid::from_raw(-pgid.as_raw())
        };
        if let Err(err) = kill(target, signo) {
            error!("service {}: can't signal process: {err}", self.rec(sid).name());
        }
    }

    /// SIGKILL escalation after a stop timeout.
    fn kill_with_fire(&mut self, sid: ServiceId) {
        if let Some(pid) = self.rec(sid).pid() {
            warn!(
                "service {} with pid {pid} exceeded allowed stop time; killing",
                self.rec(sid).name()
            );
            self.kill_pg(sid, Signal::SIGKILL);
        }
    }

    /// Bring-down for process and bgprocess services.
    pub(crate) fn proc_bring_down(&mut self, sid: ServiceId, rx: &mut Reactor) {
        let (waiting_execstat, pid, tracking) = {
            let proc = self.rec(sid).proc.as_ref().unwrap();
            (proc.waiting_for_execstat, proc.pid, proc.tracking_child)
        };
        if waiting_execstat {
            // Still waiting for the exec outcome (can occur during
            // smooth recovery); act once the status arrives.
            return;
        }
        if pid.is_some() {
            let term = self.rec(sid).settings.term_signal;
            let extra = self.rec(sid).settings.extra_term_signal;
            self.kill_pg(sid, term);
            if let Some(extra) = extra {
                self.kill_pg(sid, extra);
            }

            if self.rec(sid).kind() == ServiceKind::BgProcess && !tracking {
                // We cannot observe the exit of a process that is not
                // our child; consider it stopped once signalled.
                self.stopped(sid, rx);
            } else {
                let timeout = self.rec(sid).settings.stop_timeout;
                if !timeout.is_zero() {
                    self.rec_mut(sid)
                        .proc
                        .as_mut()
                        .unwrap()
                        .waiting_stopstart_timer = true;
                    rx.arm_timer(TimerTag::Process(sid), timeout);
                }
            }
        } else {
            // The process is already dead.
            self.stopped(sid, rx);
        }
    }

    /// Bring-down for scripted services: run the stop command.
    pub(crate) fn scripted_bring_down(&mut self, sid: ServiceId, rx: &mut Reactor) {
        if self.rec(sid).settings.stop_command.is_empty() {
            self.stopped(sid, rx);
        } else if !self.start_ps_process(sid, LaunchCmd::Stop, false, rx) {
            // Couldn't execute the stop script; assume stopped so that
            // dependencies can be stopped.
            self.stopped(sid, rx);
        } else {
            let timeout = self.rec(sid).settings.stop_timeout;
            if !timeout.is_zero() {
                self.rec_mut(sid)
                    .proc
                    .as_mut()
                    .unwrap()
                    .waiting_stopstart_timer = true;
                rx.arm_timer(TimerTag::Process(sid), timeout);
            }
        }
    }

    /// Interrupts a start in progress for a process kind. Returns true
    /// if fully interrupted, false if an interrupt signal was issued
    /// and the service is now Stopping.
    pub(crate) fn proc_interrupt_start(&mut self, sid: ServiceId, rx: &mut Reactor) -> bool {
        let has_pid = {
            let proc = self.rec_mut(sid).proc.as_mut().unwrap();
            if proc.waiting_restart_timer {
                proc.waiting_restart_timer = false;
                rx.stop_timer(TimerTag::Process(sid));
                return true;
            }
            proc.pid.is_some()
        };
        if !has_pid {
            return true;
        }

        warn!(
            "interrupting start of service {} with pid {} (with SIGINT)",
            self.rec(sid).name(),
            self.rec(sid).pid().unwrap()
        );
        self.kill_pg(sid, Signal::SIGINT);
        self.set_state(sid, ServiceState::Stopping);
        if self.rec(sid).kind() == ServiceKind::Scripted {
            self.rec_mut(sid).proc.as_mut().unwrap().interrupting_start = true;
        }

        let timeout = self.rec(sid).settings.stop_timeout;
        let proc = self.rec_mut(sid).proc.as_mut().unwrap();
        if !timeout.is_zero() {
            proc.waiting_stopstart_timer = true;
            rx.arm_timer(TimerTag::Process(sid), timeout);
        } else if proc.waiting_stopstart_timer {
            proc.waiting_stopstart_timer = false;
            rx.stop_timer(TimerTag::Process(sid));
        }
        false
    }

    /// Cleans up process-side resources when the service reaches
    /// Stopped.
    pub(crate) fn proc_cleanup_on_stop(&mut self, sid: ServiceId, rx: &mut Reactor) {
        let Some(proc) = self.rec_mut(sid).proc.as_mut() else {
            return;
        };
        if let Some(nfd) = proc.notify_fd.take() {
            rx.remove_fd_watch(nfd.as_raw_fd());
        }
        proc.ready = false;
        proc.doing_smooth_recovery = false;
        proc.interrupting_start = false;
        proc.stopping_script = false;
        if proc.waiting_stopstart_timer || proc.waiting_restart_timer {
            proc.waiting_stopstart_timer = false;
            proc.waiting_restart_timer = false;
            rx.stop_timer(TimerTag::Process(sid));
        }
    }

    /// Closes the retained output pipe (final deactivation).
    pub(crate) fn close_log_pipe(&mut self, sid: ServiceId, rx: &mut Reactor) {
        let Some(proc) = self.rec_mut(sid).proc.as_mut() else {
            return;
        };
        if let Some(lrd) = proc.log_rd_fd.take() {
            rx.remove_fd_watch(lrd.as_raw_fd());
        }
        proc.log_wr_fd = None;
    }

    // ------------------------------------------------------------------
    // Event entry points (called by the driver)
    // ------------------------------------------------------------------

    /// A watched child of this service terminated.
    pub fn handle_child_exit(
        &mut self,
        sid: ServiceId,
        status: ExitStatus,
        rx: &mut Reactor,
    ) {
        {
            let proc = self.rec_mut(sid).proc.as_mut().unwrap();
            proc.pid = None;
            proc.exit_status = Some(status);
            if proc.waiting_for_execstat {
                // No exec() outcome yet; defer processing until it
                // arrives.
                return;
            }
            if proc.waiting_stopstart_timer {
                proc.waiting_stopstart_timer = false;
                rx.stop_timer(TimerTag::Process(sid));
            }
        }
        self.handle_exit_status(sid, status, rx);
        self.process_queues(rx);
    }

    fn handle_exit_status(&mut self, sid: ServiceId, status: ExitStatus, rx: &mut Reactor) {
        match self.rec(sid).kind() {
            ServiceKind::Process => self.process_exit(sid, status, rx),
            ServiceKind::BgProcess => self.bgproc_exit(sid, status, rx),
            ServiceKind::Scripted => self.scripted_exit(sid, status, rx),
            _ => {}
        }
    }

    fn log_unexpected_status(&self, sid: ServiceId, status: ExitStatus) {
        if status.as_int() != 0 && self.rec(sid).state != ServiceState::Stopping {
            let name = self.rec(sid).name();
            if status.did_exit() {
                error!(
                    "service {name} process terminated with exit code {}",
                    status.exit_code()
                );
            } else if status.was_signalled() {
                error!(
                    "service {name} terminated due to signal {}",
                    status.term_signal()
                );
            }
        }
    }

    fn process_exit(&mut self, sid: ServiceId, status: ExitStatus, rx: &mut Reactor) {
        self.log_unexpected_status(sid, status);
        let state = self.rec(sid).state;
        let smooth = {
            let rec = self.rec(sid);
            rec.settings.smooth_recovery
                && state == ServiceState::Started
                && rec.target_state == ServiceState::Started
        };

        match state {
            ServiceState::Starting => {
                if status.did_exit_clean() {
                    self.started(sid, rx);
                } else {
                    self.rec_mut(sid).stop_reason = StoppedReason::Failed;
                    self.failed_to_start(sid, false, rx);
                }
            }
            ServiceState::Stopping => {
                // The process died because we signalled it; no status
                // logging here.
                self.stopped(sid, rx);
            }
            _ if smooth && self.restart_enabled() => {
                self.do_smooth_recovery(sid, rx);
            }
            _ => {
                self.emergency_stop(sid, rx);
            }
        }
    }

    fn bgproc_exit(&mut self, sid: ServiceId, status: ExitStatus, rx: &mut Reactor) {
        let mut status = status;
        loop {
            self.log_unexpected_status(sid, status);
            let state = self.rec(sid).state;
            let doing_recovery =
                self.rec(sid).proc.as_ref().unwrap().doing_smooth_recovery;

            if doing_recovery && state == ServiceState::Started {
                // Smooth recovery re-launch of the launcher: the pid
                // must be re-read from the file.
                self.rec_mut(sid).proc.as_mut().unwrap().doing_smooth_recovery = false;
                if !status.did_exit_clean() {
                    self.emergency_stop(sid, rx);
                    return;
                }
                match self.read_pid_file(sid, rx) {
                    PidResult::Ok => return,
                    PidResult::Failed => {
                        self.emergency_stop(sid, rx);
                        return;
                    }
                    PidResult::Terminated(st) => {
                        status = st;
                        continue;
                    }
                }
            }

            match state {
                ServiceState::Starting => {
                    if status.did_exit_clean() {
                        match self.read_pid_file(sid, rx) {
                            PidResult::Ok => self.started(sid, rx),
                            PidResult::Failed => {
                                self.rec_mut(sid).stop_reason = StoppedReason::Failed;
                                self.failed_to_start(sid, false, rx);
                            }
                            PidResult::Terminated(st) => {
                                // Daemonised, then terminated at once.
                                self.started(sid, rx);
                                status = st;
                                continue;
                            }
                        }
                    } else {
                        self.rec_mut(sid).stop_reason = StoppedReason::Failed;
                        self.failed_to_start(sid, false, rx);
                    }
                }
                ServiceState::Stopping => {
                    self.stopped(sid, rx);
                }
                _ => {
                    // Unexpected exit of the adopted daemon.
                    let smooth = {
                        let rec = self.rec(sid);
                        rec.settings.smooth_recovery
                            && rec.target_state == ServiceState::Started
                    };
                    if smooth && self.restart_enabled() {
                        self.do_smooth_recovery(sid, rx);
                    } else {
                        self.emergency_stop(sid, rx);
                    }
                }
            }
            return;
        }
    }

    fn scripted_exit(&mut self, sid: ServiceId, status: ExitStatus, rx: &mut Reactor) {
        let state = self.rec(sid).state;
        let name = self.rec(sid).name().to_owned();
        if state == ServiceState::Stopping {
            let interrupting = self.rec(sid).proc.as_ref().unwrap().interrupting_start;
            if status.did_exit_clean() {
                if interrupting {
                    // Start script cancelled; now run the stop script.
                    self.rec_mut(sid).proc.as_mut().unwrap().interrupting_start = false;
                    self.scripted_bring_down(sid, rx);
                } else {
                    self.stopped(sid, rx);
                }
            } else {
                if interrupting {
                    // We issued the interrupt; the failure is expected.
                    info!("service {name} start cancelled");
                } else if status.did_exit() {
                    warn!(
                        "service {name} stop command failed with exit code {}",
                        status.exit_code()
                    );
                } else if status.was_signalled() {
                    warn!(
                        "service {name} stop command terminated due to signal {}",
                        status.term_signal()
                    );
                }
                // Even if the stop script failed, assume stopped so
                // dependencies can be stopped.
                self.rec_mut(sid).proc.as_mut().unwrap().interrupting_start = false;
                self.stopped(sid, rx);
            }
        } else {
            // Starting.
            if status.did_exit_clean() {
                self.started(sid, rx);
            } else {
                if status.did_exit() {
                    error!(
                        "service {name} command failed with exit code {}",
                        status.exit_code()
                    );
                } else if status.was_signalled() {
                    error!(
                        "service {name} command terminated due to signal {}",
                        status.term_signal()
                    );
                }
                self.rec_mut(sid).stop_reason = StoppedReason::Failed;
                self.failed_to_start(sid, false, rx);
            }
        }
    }

    /// Exec-status pipe activity: EOF signals exec success; a payload
    /// carries the failing stage and errno from the child.
    pub fn handle_exec_status(&mut self, sid: ServiceId, rx: &mut Reactor) {
        let mut buf = [0u8; 6];
        let (read_res, _fd) = {
            let proc = self.rec_mut(sid).proc.as_mut().unwrap();
            proc.waiting_for_execstat = false;
            let fd = proc.exec_fd.take().expect("exec status watch without pipe");
            let res = unistd::read(fd.as_raw_fd(), &mut buf);
            rx.remove_fd_watch(fd.as_raw_fd());
            (res, fd)
        };

        match read_res {
            Ok(n) if n > 0 => {
                // Exec failed; the child reported the stage and errno.
                let stage = if n >= 2 {
                    ExecStage::try_from(u16::from_le_bytes([buf[0], buf[1]]))
                        .unwrap_or(ExecStage::DoExec)
                } else {
                    ExecStage::DoExec
                };
                let errno = if n >= 6 {
                    Errno::from_raw(i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]))
                } else {
                    Errno::UnknownErrno
                };
                let err = ExecError { stage, errno };
                error!("{}: execution failed: {err}", self.rec(sid).name());

                {
                    let pid = self.rec(sid).pid();
                    if let Some(pid) = pid {
                        rx.remove_child_watch(pid);
                    }
                    let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                    proc.pid = None;
                    proc.exec_err = Some(err);
                    if proc.waiting_stopstart_timer {
                        proc.waiting_stopstart_timer = false;
                        rx.stop_timer(TimerTag::Process(sid));
                    }
                }
                self.rec_mut(sid).stop_reason = StoppedReason::ExecFailed;
                self.exec_failed(sid, rx);
            }
            _ => {
                // EOF: exec succeeded.
                self.exec_succeeded(sid, rx);
                if self.rec(sid).pid().is_none() {
                    // The process completed before we saw the status.
                    let status = self.rec(sid).exit_status().unwrap_or(ExitStatus(0));
                    {
                        let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                        if proc.waiting_stopstart_timer {
                            proc.waiting_stopstart_timer = false;
                            rx.stop_timer(TimerTag::Process(sid));
                        }
                    }
                    self.handle_exit_status(sid, status, rx);
                }
            }
        }
        self.process_queues(rx);
    }

    fn exec_succeeded(&mut self, sid: ServiceId, rx: &mut Reactor) {
        match self.rec(sid).kind() {
            ServiceKind::Process => {
                // Could be a smooth recovery (already Started), or the
                // process might have been stopped during recovery.
                let state = self.rec(sid).state;
                if state == ServiceState::Starting {
                    if !self.rec(sid).settings.has_notify() {
                        self.started(sid, rx);
                    }
                    // Otherwise remain Starting until readiness.
                } else if state == ServiceState::Stopping {
                    // Smooth recovery was in flight; commence the stop.
                    if self.rec(sid).pid().is_some() && self.stop_check_dependents(sid) {
                        self.proc_bring_down(sid, rx);
                    }
                } else {
                    self.rec_mut(sid).proc.as_mut().unwrap().doing_smooth_recovery = false;
                }
            }
            // Bgprocess and scripted services progress on child exit.
            _ => {}
        }
    }

    fn exec_failed(&mut self, sid: ServiceId, rx: &mut Reactor) {
        match self.rec(sid).kind() {
            ServiceKind::Scripted => match self.rec(sid).state {
                ServiceState::Starting => self.failed_to_start(sid, false, rx),
                ServiceState::Stopping => {
                    // The stop script could not exec; better not to
                    // leave the service hanging in Stopping.
                    self.stopped(sid, rx);
                }
                _ => {}
            },
            ServiceKind::BgProcess => {
                // Only executes during startup.
                self.failed_to_start(sid, false, rx);
            }
            _ => {
                if self.rec(sid).state == ServiceState::Starting {
                    self.failed_to_start(sid, false, rx);
                } else {
                    // Process service in smooth recovery.
                    self.rec_mut(sid).proc.as_mut().unwrap().doing_smooth_recovery = false;
                    self.emergency_stop(sid, rx);
                }
            }
        }
    }

    /// Readiness-pipe activity: any data marks the service ready; EOF
    /// before readiness while Starting is a start failure.
    pub fn handle_readiness(&mut self, sid: ServiceId, rx: &mut Reactor) {
        let mut buf = [0u8; 128];
        let read_res = {
            let Some(proc) = self.rec(sid).proc.as_ref() else { return };
            let Some(nfd) = proc.notify_fd.as_ref() else { return };
            unistd::read(nfd.as_raw_fd(), &mut buf)
        };

        match read_res {
            Ok(n) if n > 0 => {
                let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                proc.ready = true;
                if let Some(nfd) = proc.notify_fd.take() {
                    rx.remove_fd_watch(nfd.as_raw_fd());
                }
                if self.rec(sid).state == ServiceState::Starting {
                    self.started(sid, rx);
                }
            }
            Ok(_) => {
                // EOF before readiness.
                let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                if let Some(nfd) = proc.notify_fd.take() {
                    rx.remove_fd_watch(nfd.as_raw_fd());
                }
                if self.rec(sid).state == ServiceState::Starting {
                    self.rec_mut(sid).stop_reason = StoppedReason::Failed;
                    self.failed_to_start(sid, false, rx);
                }
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(err) => {
                warn!("service {}: readiness pipe: {err}", self.rec(sid).name());
            }
        }
        self.process_queues(rx);
    }

    /// Captured-output pipe activity: drain into the bounded ring.
    pub fn handle_log_output(&mut self, sid: ServiceId, rx: &mut Reactor) {
        let mut buf = [0u8; 1024];
        let (read_res, fd) = {
            let Some(proc) = self.rec(sid).proc.as_ref() else { return };
            let Some(lrd) = proc.log_rd_fd.as_ref() else { return };
            (unistd::read(lrd.as_raw_fd(), &mut buf), lrd.as_raw_fd())
        };
        match read_res {
            Ok(n) if n > 0 => {
                let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                let space = LOG_BUFFER_MAX.saturating_sub(proc.log_buffer.len());
                let take = space.min(n);
                proc.log_buffer.extend_from_slice(&buf[..take]);
                if proc.log_buffer.len() >= LOG_BUFFER_MAX {
                    // Buffer full: stop draining until space frees up.
                    rx.set_fd_interest(fd, Interest::NONE);
                }
            }
            Ok(_) => {
                self.close_log_pipe(sid, rx);
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(_) => self.close_log_pipe(sid, rx),
        }
    }

    /// The per-service process timer expired; its role is derived from
    /// the current state and flags.
    pub fn handle_process_timer(&mut self, sid: ServiceId, rx: &mut Reactor) {
        if self.rec(sid).proc.is_none() {
            return;
        }
        let state = self.rec(sid).state;
        let has_pid = self.rec(sid).pid().is_some();

        if state == ServiceState::Stopping {
            self.rec_mut(sid).proc.as_mut().unwrap().waiting_stopstart_timer = false;
            self.kill_with_fire(sid);
        } else if has_pid {
            // Starting: the start timed out. Interrupt it and let the
            // stop timeout escalate from here.
            warn!(
                "service {} with pid {} exceeded allowed start time; cancelling",
                self.rec(sid).name(),
                self.rec(sid).pid().unwrap()
            );
            self.rec_mut(sid).proc.as_mut().unwrap().waiting_stopstart_timer = false;
            self.rec_mut(sid).stop_reason = StoppedReason::TimedOut;
            self.rec_mut(sid).target_state = ServiceState::Stopped;
            if self.rec(sid).start_explicit {
                self.rec_mut(sid).start_explicit = false;
                self.release(sid);
            }
            self.notify_listeners(sid, crate::proto::ServiceEvent::FailedStart);
            self.cancel_dependent_starts(sid);
            self.proc_interrupt_start(sid, rx);
        } else {
            // Starting or Started with no process: restart delay (or
            // smooth recovery delay) elapsed.
            self.do_restart(sid, rx);
        }
        self.process_queues(rx);
    }

    // ------------------------------------------------------------------
    // Pid-file adoption
    // ------------------------------------------------------------------

    /// Reads the pid file of a bgprocess service and adopts the
    /// recorded pid. When the pid is not our child it is verified with
    /// a null signal and tracked as unreapable.
    fn read_pid_file(&mut self, sid: ServiceId, rx: &mut Reactor) -> PidResult {
        let name = self.rec(sid).name().to_owned();
        let Some(path) = self.rec(sid).settings.pid_file.clone() else {
            error!("{name}: no pid file configured");
            return PidResult::Failed;
        };

        let pid = match parse_pid_file(&path) {
            Ok(pid) => pid,
            Err(err) => {
                error!("{name}: read pid file: {err}");
                return PidResult::Failed;
            }
        };

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Err(Errno::ECHILD) => {
                // Not our child; check the process exists. This test
                // races with pid recycling, an inherent limitation of
                // adopting a daemonised process.
                match kill(pid, None) {
                    Err(Errno::ESRCH) => {
                        error!("{name}: pid read from pidfile ({pid}) is not valid");
                        PidResult::Failed
                    }
                    _ => {
                        let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                        proc.pid = Some(pid);
                        proc.tracking_child = false;
                        PidResult::Ok
                    }
                }
            }
            Ok(WaitStatus::StillAlive) => {
                let proc = self.rec_mut(sid).proc.as_mut().unwrap();
                proc.pid = Some(pid);
                proc.tracking_child = true;
                rx.add_child_watch(pid, sid);
                PidResult::Ok
            }
            Ok(ws) => match ws {
                WaitStatus::Exited(_, code) => {
                    PidResult::Terminated(ExitStatus(code << 8))
                }
                WaitStatus::Signaled(_, sig, _) => {
                    PidResult::Terminated(ExitStatus(sig as i32))
                }
                _ => {
                    error!("{name}: unexpected wait status for pid {pid}");
                    PidResult::Failed
                }
            },
            Err(err) => {
                error!("{name}: pid read from pidfile ({pid}) is not valid: {err}");
                PidResult::Failed
            }
        }
    }
}

fn set_cloexec(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn restart_tracker_enforces_window_cap() {
        let mut tracker = RestartTracker::new(Duration::from_secs(10), 3);
        let t0 = Instant::now();
        tracker.reset(t0);

        for _ in 0..3 {
            assert!(tracker.check_restart_allowed(t0 + Duration::from_secs(1)));
            tracker.note_restart();
        }
        // Fourth restart within the window is refused.
        assert!(!tracker.check_restart_allowed(t0 + Duration::from_secs(2)));

        // A restart outside the window opens a new one.
        assert!(tracker.check_restart_allowed(t0 + Duration::from_secs(11)));
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn restart_tracker_zero_cap_is_unlimited() {
        let mut tracker = RestartTracker::new(Duration::from_secs(10), 0);
        let t0 = Instant::now();
        tracker.reset(t0);
        for _ in 0..100 {
            assert!(tracker.check_restart_allowed(t0));
            tracker.note_restart();
        }
    }

    #[test]
    fn pid_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.pid");

        // Empty file is a failure.
        fs::write(&path, "").unwrap();
        assert!(parse_pid_file(&path).is_err());

        // Garbage is a failure.
        fs::write(&path, "ducks").unwrap();
        assert!(parse_pid_file(&path).is_err());

        // Out-of-range is a failure.
        fs::write(&path, "99999999999999999999").unwrap();
        assert!(parse_pid_file(&path).is_err());

        // Plain decimal works, as does trailing whitespace.
        fs::write(&path, "1234").unwrap();
        assert_eq!(parse_pid_file(&path).unwrap(), Pid::from_raw(1234));
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "5678  ").unwrap();
        assert_eq!(parse_pid_file(&path).unwrap(), Pid::from_raw(5678));

        // Missing file is a failure.
        fs::remove_file(&path).unwrap();
        assert!(parse_pid_file(&path).is_err());
    }
}
