//! Control protocol wire contract.
//!
//! Every request begins with a 1-byte packet type; replies are a single
//! byte or a well-typed packet; information packets have a type >= 100
//! followed by a 1-byte total length. All multi-byte integers are
//! little-endian on the wire, native width where `pid_t` and `int`
//! appear. The numeric values in this module are the contract between
//! the daemon and its clients and must not be renumbered.

use strum_macros::Display;

/// Service handle: a 32-bit identifier allocated per (connection,
/// service) pair, valid only within that connection.
pub type Handle = u32;

/// Size of a service status block on the wire: state, target state, one
/// flag byte, stop reason, 2-byte exec stage, then either a `pid_t` or
/// an `int` exit status depending on whether the service is running.
pub const STATUS_BUFFER_SIZE: usize = 6 + size_of::<libc::pid_t>();

// Status block flag-byte bits.
/// Service is waiting in the console queue.
pub const SB_FLAG_WAITING_CONSOLE: u8 = 1;
/// Service currently holds the console.
pub const SB_FLAG_HAS_CONSOLE: u8 = 2;
/// Service startup was skipped.
pub const SB_FLAG_START_SKIPPED: u8 = 4;
/// Service is marked explicitly activated.
pub const SB_FLAG_MARKED_ACTIVE: u8 = 8;

/// Request packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum Request {
    /// Query protocol version.
    QueryVersion = 0,
    /// Find (but don't load) a service.
    FindService = 1,
    /// Find or load a service.
    LoadService = 2,
    /// Start a service (flags byte + handle).
    StartService = 3,
    /// Stop a service (flags byte + handle).
    StopService = 4,
    /// Re-attach a service to its started dependents.
    WakeService = 5,
    /// Clear explicit activation (flags byte + handle).
    ReleaseService = 6,
    /// Remove both pins from a service.
    UnpinService = 7,
    /// Stream status of every loaded service.
    ListServices = 8,
    /// Remove a stopped, unreferenced service from the set.
    UnloadService = 9,
    /// Shut down (1-byte shutdown type follows).
    Shutdown = 10,
    /// Add a dependency between two services.
    AddDep = 11,
    /// Remove a dependency between two services.
    RemDep = 12,
    /// Query the loader mechanism and its search directories.
    QueryLoadMech = 13,
    /// Add a dependency and activate it if the dependent is up.
    EnableService = 14,
    /// Query the name of a service by handle.
    QueryServiceName = 15,
    /// Reload a service from its description.
    ReloadService = 16,
    /// Set a variable in the daemon environment.
    SetEnv = 17,
    /// Snapshot the daemon environment.
    GetAllEnv = 18,
    /// Subscribe to environment-change events.
    ListenEnv = 19,
    /// Query the status block of one service.
    ServiceStatus = 20,
    /// Set or clear the trigger of a triggered service.
    SetTrigger = 21,
}

impl TryFrom<u8> for Request {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        use Request::*;
        Ok(match v {
            0 => QueryVersion,
            1 => FindService,
            2 => LoadService,
            3 => StartService,
            4 => StopService,
            5 => WakeService,
            6 => ReleaseService,
            7 => UnpinService,
            8 => ListServices,
            9 => UnloadService,
            10 => Shutdown,
            11 => AddDep,
            12 => RemDep,
            13 => QueryLoadMech,
            14 => EnableService,
            15 => QueryServiceName,
            16 => ReloadService,
            17 => SetEnv,
            18 => GetAllEnv,
            19 => ListenEnv,
            20 => ServiceStatus,
            21 => SetTrigger,
            other => return Err(other),
        })
    }
}

/// Reply packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum Reply {
    /// Request carried out.
    Ack = 50,
    /// Request refused.
    Nak = 51,
    /// Request was bad; the connection will be closed.
    BadReq = 52,
    /// Connection closing due to resource exhaustion.
    Oom = 53,
    /// Service description could not be loaded.
    ServiceLoadErr = 54,
    /// Service could not be started due to resource exhaustion.
    ServiceOom = 55,
    /// Service start/stop was issued.
    SsIssued = 56,
    /// Service start/stop was redundant.
    SsRedundant = 57,
    /// Protocol version information follows.
    CpVersion = 58,
    /// Service record found/loaded: state, handle, target state.
    ServiceRecord = 59,
    /// Service could not be found or loaded.
    NoService = 60,
    /// Service was already in the requested state.
    AlreadySs = 61,
    /// One service information block (ListServices stream element).
    SvcInfo = 62,
    /// End of the ListServices stream.
    ListDone = 63,
    /// Loader mechanism description follows.
    LoaderMech = 64,
    /// Affected dependents follow (gentle stop refusal).
    Dependents = 65,
    /// Service name follows.
    ServiceName = 66,
    /// Service status block follows.
    ServiceStatus = 67,
    /// Refused: the daemon is shutting down.
    ShuttingDown = 68,
    /// Refused: the service is pinned started.
    PinnedStarted = 69,
    /// Refused: the service is pinned stopped.
    PinnedStopped = 70,
    /// Environment snapshot follows.
    AllEnv = 71,
}

/// Information packet types (>= 100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum Info {
    /// A service event occurred: handle, event code, status block.
    ServiceEvent = 100,
    /// A daemon environment variable changed.
    EnvEvent = 102,
}

/// Service states as carried in status blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[repr(u8)]
pub enum ServiceState {
    /// Not running.
    Stopped = 0,
    /// Will start (or fail to start) in time.
    Starting = 1,
    /// Running.
    Started = 2,
    /// Will stop in time.
    Stopping = 3,
}

/// Target (desired) states are restricted to Stopped/Started.
pub type TargetState = ServiceState;

/// Events delivered to service listeners and control clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ServiceEvent {
    /// Service reached the Started state.
    Started = 0,
    /// Service reached the Stopped state.
    Stopped = 1,
    /// Service failed to start (possibly due to a failed dependency).
    FailedStart = 2,
    /// A pending start was cancelled by a stop request.
    StartCancelled = 3,
    /// A pending stop was cancelled by a start request.
    StopCancelled = 4,
}

/// Dependency edge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum DepKind {
    /// Hard dependency: dependent cannot be up unless the dependency is;
    /// the dependency stopping forces the dependent down.
    Regular = 0,
    /// Dependency starts in parallel; its failure or stop does not
    /// affect the dependent.
    Soft = 1,
    /// As Soft, but the dependent waits for the dependency to start or
    /// fail before completing its own startup.
    WaitsFor = 2,
    /// Dependency must start successfully; once started it becomes soft.
    Milestone = 3,
    /// Ordering only: the edge source starts before the target.
    Before = 4,
    /// Ordering only: the edge source starts after the target.
    After = 5,
}

impl DepKind {
    /// Whether this edge acquires (holds active) its target while the
    /// source is active. Before/After impose ordering only.
    pub fn acquires(self) -> bool {
        !matches!(self, DepKind::Before | DepKind::After)
    }

    /// Whether the source waits for the target to start before
    /// completing its own startup.
    pub fn waits(self) -> bool {
        matches!(self, DepKind::Regular | DepKind::Milestone | DepKind::WaitsFor)
    }
}

impl TryFrom<u8> for DepKind {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            0 => DepKind::Regular,
            1 => DepKind::Soft,
            2 => DepKind::WaitsFor,
            3 => DepKind::Milestone,
            4 => DepKind::Before,
            5 => DepKind::After,
            other => return Err(other),
        })
    }
}

/// Shutdown kinds accepted by the Shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ShutdownType {
    /// Stop services but remain running (single-user hand-back).
    Remain = 0,
    /// Halt the system without powering down.
    Halt = 1,
    /// Power off the system.
    Poweroff = 2,
    /// Reboot the system.
    Reboot = 3,
}

impl TryFrom<u8> for ShutdownType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            0 => ShutdownType::Remain,
            1 => ShutdownType::Halt,
            2 => ShutdownType::Poweroff,
            3 => ShutdownType::Reboot,
            other => return Err(other),
        })
    }
}

/// Why a service most recently stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum StoppedReason {
    /// Normal stop (dependency release or explicit request).
    Normal = 0,
    /// A dependency failed to start.
    DepFailed = 1,
    /// The service itself failed to start.
    Failed = 2,
    /// The child-side exec failed; stage and errno are recorded.
    ExecFailed = 3,
    /// Startup exceeded the start timeout.
    TimedOut = 4,
    /// The process terminated unexpectedly.
    Terminated = 5,
}

/// Which step of child-side setup failed when exec could not be reached.
///
/// The stage is written to the exec-status pipe together with the errno
/// and is surfaced in status blocks when the stop reason is ExecFailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u16)]
pub enum ExecStage {
    /// Shuffling inherited file descriptors into place.
    ArrangeFds = 0,
    /// Reading the service environment file.
    ReadEnvFile = 1,
    /// Exporting the readiness-fd environment variable.
    SetNotifyFdVar = 2,
    /// Installing the activation socket at its fixed fd.
    SetupActivationSocket = 3,
    /// Installing the passed control socket.
    SetupControlSocket = 4,
    /// Changing to the service working directory.
    ChangeDir = 5,
    /// Opening stdin/stdout/stderr.
    SetupStdInOutErr = 6,
    /// Dropping to the configured uid/gid.
    SetUidGid = 7,
    /// The exec call itself.
    DoExec = 8,
}

impl TryFrom<u16> for ExecStage {
    type Error = u16;

    fn try_from(v: u16) -> Result<Self, u16> {
        use ExecStage::*;
        Ok(match v {
            0 => ArrangeFds,
            1 => ReadEnvFile,
            2 => SetNotifyFdVar,
            3 => SetupActivationSocket,
            4 => SetupControlSocket,
            5 => ChangeDir,
            6 => SetupStdInOutErr,
            7 => SetUidGid,
            8 => DoExec,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_round_trip() {
        for v in 0u8..=21 {
            let req = Request::try_from(v).expect("assigned request code");
            assert_eq!(req as u8, v);
        }
        assert!(Request::try_from(22).is_err());
        assert!(Request::try_from(255).is_err());
    }

    #[test]
    fn reply_codes_are_stable() {
        assert_eq!(Reply::Ack as u8, 50);
        assert_eq!(Reply::Nak as u8, 51);
        assert_eq!(Reply::BadReq as u8, 52);
        assert_eq!(Reply::Oom as u8, 53);
        assert_eq!(Reply::CpVersion as u8, 58);
        assert_eq!(Reply::ServiceRecord as u8, 59);
        assert_eq!(Reply::NoService as u8, 60);
        assert_eq!(Reply::AlreadySs as u8, 61);
        assert_eq!(Reply::ListDone as u8, 63);
        assert_eq!(Info::ServiceEvent as u8, 100);
    }

    #[test]
    fn dep_kind_properties() {
        assert!(DepKind::Regular.acquires() && DepKind::Regular.waits());
        assert!(DepKind::Soft.acquires() && !DepKind::Soft.waits());
        assert!(DepKind::WaitsFor.waits());
        assert!(DepKind::Milestone.waits());
        assert!(!DepKind::Before.acquires());
        assert!(!DepKind::After.acquires());
    }

    #[test]
    fn shutdown_type_rejects_unknown() {
        assert_eq!(ShutdownType::try_from(3), Ok(ShutdownType::Reboot));
        assert!(ShutdownType::try_from(4).is_err());
    }
}
