//! Resolved service settings.
//!
//! The service-description parser is an external collaborator; what the
//! core ingests is a fully-resolved [`ServiceSettings`] record. The
//! in-memory loader and the tests construct these directly.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::{Gid, Uid};

use crate::constants::{
    DEFAULT_MAX_RESTART_COUNT, DEFAULT_RESTART_DELAY, DEFAULT_RESTART_INTERVAL,
    DEFAULT_START_TIMEOUT, DEFAULT_STOP_TIMEOUT,
};
use crate::proto::DepKind;

/// Kind of a service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Groups dependencies; runs no process.
    Internal,
    /// The forked child is the service process.
    Process,
    /// The forked child daemonises and records its pid in a file.
    BgProcess,
    /// Separate start and stop commands.
    Scripted,
    /// Internal service that starts only once externally triggered.
    TriggeredInternal,
    /// Synthesised during cycle-detecting load; never startable.
    Placeholder,
}

impl ServiceKind {
    /// Whether records of this kind run a child process.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            ServiceKind::Process | ServiceKind::BgProcess | ServiceKind::Scripted
        )
    }
}

/// Start-time behaviour flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartFlags {
    /// Holds the console during startup.
    pub starts_on_console: bool,
    /// Runs in the foreground on the console for its whole lifetime.
    pub runs_on_console: bool,
    /// Uses the console without claiming exclusive foreground access.
    pub shares_console: bool,
    /// Receives a control-socket connection via inherited fd.
    pub pass_control_fd: bool,
    /// Startup completes only after readiness notification.
    pub waits_for_readiness: bool,
    /// Startup may be skipped.
    pub skippable: bool,
    /// A stop request may interrupt startup in flight.
    pub start_interruptible: bool,
    /// Leave SIGINT unmasked in the child.
    pub unmask_sigint: bool,
    /// Signal only the process, not its process group.
    pub signal_process_only: bool,
}

/// Where a service's output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogType {
    /// Discard (stdout/stderr from `/dev/null` unless on console).
    #[default]
    None,
    /// Append to the configured log file.
    Logfile,
    /// Capture into a bounded in-memory ring.
    Buffer,
    /// Leave the write end of a pipe with the child; something else reads it.
    Pipe,
}

/// Activation socket configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Path the AF_UNIX stream socket is bound at.
    pub path: PathBuf,
    /// Permission bits applied after bind.
    pub mode: u32,
    /// Owning uid, if it should be changed.
    pub uid: Option<Uid>,
    /// Owning gid, if it should be changed.
    pub gid: Option<Gid>,
}

/// A dependency declared by a service description, by target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepSpec {
    /// Name of the target service.
    pub to: String,
    /// Edge kind.
    pub kind: DepKind,
}

/// Fully-resolved settings record for one service.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Record kind.
    pub kind: ServiceKind,
    /// Start command and arguments (empty for internal kinds).
    pub command: Vec<String>,
    /// Stop command and arguments (scripted services).
    pub stop_command: Vec<String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// `NAME=value` file loaded into the child environment.
    pub env_file: Option<PathBuf>,
    /// Log file path (LogType::Logfile).
    pub logfile: Option<PathBuf>,
    /// Output disposition.
    pub log_type: LogType,
    /// Run the child as this uid.
    pub run_as_uid: Option<Uid>,
    /// Run the child as this gid.
    pub run_as_gid: Option<Gid>,
    /// Signal used to terminate the process.
    pub term_signal: Signal,
    /// Additional signal sent along with the termination signal.
    pub extra_term_signal: Option<Signal>,
    /// Pid file written by a backgrounding service's launcher.
    pub pid_file: Option<PathBuf>,
    /// Pre-bound activation socket.
    pub activation_socket: Option<SocketConfig>,
    /// Environment variable that receives the readiness fd number.
    pub notify_var: Option<String>,
    /// Fixed fd at which the readiness pipe is placed in the child.
    pub notify_fd: Option<i32>,
    /// Restart automatically on unexpected termination.
    pub auto_restart: bool,
    /// Re-launch the process without taking the service down.
    pub smooth_recovery: bool,
    /// Window over which automatic restarts are counted.
    pub restart_interval: Duration,
    /// Automatic restarts allowed within the window; 0 disables the cap.
    pub max_restart_count: u32,
    /// Minimum delay between launches.
    pub restart_delay: Duration,
    /// Start timeout; zero disables.
    pub start_timeout: Duration,
    /// Stop timeout before SIGKILL; zero disables.
    pub stop_timeout: Duration,
    /// Behaviour flags.
    pub flags: StartFlags,
    /// Declared dependencies.
    pub depends: Vec<DepSpec>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            kind: ServiceKind::Internal,
            command: Vec::new(),
            stop_command: Vec::new(),
            working_dir: None,
            env_file: None,
            logfile: None,
            log_type: LogType::None,
            run_as_uid: None,
            run_as_gid: None,
            term_signal: Signal::SIGTERM,
            extra_term_signal: None,
            pid_file: None,
            activation_socket: None,
            notify_var: None,
            notify_fd: None,
            auto_restart: false,
            smooth_recovery: false,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            max_restart_count: DEFAULT_MAX_RESTART_COUNT,
            restart_delay: DEFAULT_RESTART_DELAY,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            flags: StartFlags::default(),
            depends: Vec::new(),
        }
    }
}

impl ServiceSettings {
    /// Settings for an internal (process-less) service.
    pub fn internal() -> Self {
        ServiceSettings::default()
    }

    /// Settings for a process service with the given command line.
    pub fn process<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ServiceSettings {
            kind: ServiceKind::Process,
            command: command.into_iter().map(Into::into).collect(),
            ..ServiceSettings::default()
        }
    }

    /// Whether readiness notification is configured.
    pub fn has_notify(&self) -> bool {
        self.notify_var.is_some() || self.notify_fd.is_some()
    }

    /// Adds a dependency spec.
    pub fn with_dep(mut self, to: impl Into<String>, kind: DepKind) -> Self {
        self.depends.push(DepSpec { to: to.into(), kind });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_supervision_policy() {
        let s = ServiceSettings::default();
        assert_eq!(s.restart_interval, Duration::from_secs(10));
        assert_eq!(s.max_restart_count, 3);
        assert_eq!(s.restart_delay, Duration::from_millis(200));
        assert_eq!(s.stop_timeout, Duration::from_secs(10));
        assert_eq!(s.term_signal, Signal::SIGTERM);
        assert!(!s.auto_restart);
    }

    #[test]
    fn process_kind_runs_a_child() {
        assert!(ServiceKind::Process.has_process());
        assert!(ServiceKind::BgProcess.has_process());
        assert!(ServiceKind::Scripted.has_process());
        assert!(!ServiceKind::Internal.has_process());
        assert!(!ServiceKind::Placeholder.has_process());
    }

    #[test]
    fn with_dep_accumulates() {
        let s = ServiceSettings::internal()
            .with_dep("a", DepKind::Regular)
            .with_dep("b", DepKind::WaitsFor);
        assert_eq!(s.depends.len(), 2);
        assert_eq!(s.depends[0].to, "a");
        assert_eq!(s.depends[1].kind, DepKind::WaitsFor);
    }
}
