//! Service records and the dependency graph.
//!
//! Services have both a current state and a target (desired) state. The
//! target can be Stopped or Started; the current state additionally
//! passes through Starting and Stopping. A service may be pinned in
//! either the Started or Stopped state; a pin prevents, but never
//! causes, a transition.
//!
//! Each service carries an activation count (`required_by`): one for
//! each dependent holding an acquire on it, plus one if it was
//! explicitly started. When the count rises from zero the service is
//! wanted; when it falls to zero the target state becomes Stopped.
//! A service can also be force-stopped, in which case the stop cannot
//! be cancelled by re-activation until the service reaches Stopped.
//!
//! Transitions run in two phases to avoid unbounded recursion across
//! the graph. In the propagation phase, acquire/release messages and
//! start/stop/failure requests flow along edges; pending work is flag
//! bits on the record drained through the propagation queue. In the
//! execution phase, records advance their current state (fork a
//! process, send a signal, reach Started/Stopped) through the
//! transition queue. The set drains propagations to exhaustion, then
//! transitions, repeating until both queues are empty; starting never
//! causes another service to stop (except through start failure, which
//! stops the failed subtree permanently), so the drain terminates.

mod proc;
mod set;

pub use proc::{ProcState, RestartTracker};
pub use set::{EmittedEvent, ServiceSet};

use std::collections::BTreeSet;

use crate::error::ExecError;
use crate::proto::{DepKind, ServiceEvent, ServiceState, StoppedReason};
use crate::settings::{ServiceKind, ServiceSettings};

/// Stable index of a service record within its [`ServiceSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(u32);

impl ServiceId {
    /// Builds an id from a raw index (test support and arena internals).
    pub fn from_index(idx: usize) -> ServiceId {
        ServiceId(idx as u32)
    }

    /// The raw index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable index of a dependency edge within its [`ServiceSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(u32);

impl EdgeId {
    fn from_index(idx: usize) -> EdgeId {
        EdgeId(idx as u32)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a control connection listening for service events.
pub type ConnId = u32;

/// One dependency edge. The edge is the single source of truth for the
/// acquire and waiting flags; records refer to edges by id from both
/// ends.
#[derive(Debug)]
pub struct DepEdge {
    /// The dependent service.
    pub from: ServiceId,
    /// The dependency target.
    pub to: ServiceId,
    /// Edge kind.
    pub kind: DepKind,
    /// Whether `from` currently holds an acquire on `to`.
    pub holding_acq: bool,
    /// Whether `from` is waiting for `to` to start.
    pub waiting_on: bool,
}

/// One node of the service graph.
#[derive(Debug)]
pub struct ServiceRecord {
    pub(crate) name: String,
    pub(crate) settings: ServiceSettings,

    pub(crate) state: ServiceState,
    pub(crate) target_state: ServiceState,

    pub(crate) pinned_started: bool,
    pub(crate) pinned_stopped: bool,

    /// Dependents holding an acquire, plus one for explicit activation.
    pub(crate) required_by: u32,
    pub(crate) start_explicit: bool,
    pub(crate) force_stop: bool,

    // Pending propagation flag bits, drained via the propagation queue.
    pub(crate) prop_require: bool,
    pub(crate) prop_release: bool,
    pub(crate) prop_failure: bool,
    pub(crate) prop_start: bool,
    pub(crate) prop_stop: bool,

    /// Automatic re-start underway (unexpected termination).
    pub(crate) restarting: bool,
    /// Explicit restart requested via the control protocol.
    pub(crate) restart_requested: bool,

    /// While Starting: waiting for dependencies, the console, a restart
    /// delay or a trigger.
    pub(crate) waiting_for_deps: bool,

    // Queue membership slots; each record appears in a queue at most once.
    pub(crate) in_prop_queue: bool,
    pub(crate) in_transition_queue: bool,
    pub(crate) in_console_queue: bool,

    pub(crate) have_console: bool,
    pub(crate) start_skipped: bool,
    pub(crate) stop_reason: StoppedReason,

    /// Trigger state for TriggeredInternal services.
    pub(crate) triggered: bool,

    pub(crate) listeners: BTreeSet<ConnId>,

    pub(crate) depends_on: Vec<EdgeId>,
    pub(crate) dependents: Vec<EdgeId>,

    /// Live-process state; present for process kinds.
    pub(crate) proc: Option<ProcState>,
}

impl ServiceRecord {
    pub(crate) fn new(name: String, settings: ServiceSettings) -> ServiceRecord {
        let proc = settings.kind.has_process().then(|| ProcState::new(&settings));
        ServiceRecord {
            name,
            settings,
            state: ServiceState::Stopped,
            target_state: ServiceState::Stopped,
            pinned_started: false,
            pinned_stopped: false,
            required_by: 0,
            start_explicit: false,
            force_stop: false,
            prop_require: false,
            prop_release: false,
            prop_failure: false,
            prop_start: false,
            prop_stop: false,
            restarting: false,
            restart_requested: false,
            waiting_for_deps: false,
            in_prop_queue: false,
            in_transition_queue: false,
            in_console_queue: false,
            have_console: false,
            start_skipped: false,
            stop_reason: StoppedReason::Normal,
            triggered: false,
            listeners: BTreeSet::new(),
            depends_on: Vec::new(),
            dependents: Vec::new(),
            proc,
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record kind.
    pub fn kind(&self) -> ServiceKind {
        self.settings.kind
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Target (desired) state.
    pub fn target_state(&self) -> ServiceState {
        self.target_state
    }

    /// Whether the service was explicitly activated.
    pub fn is_explicitly_activated(&self) -> bool {
        self.start_explicit
    }

    /// Current activation count.
    pub fn activation_count(&self) -> u32 {
        self.required_by
    }

    /// Whether the service is pinned in the started state.
    pub fn is_start_pinned(&self) -> bool {
        self.pinned_started
    }

    /// Whether the service is pinned in the stopped state.
    pub fn is_stop_pinned(&self) -> bool {
        self.pinned_stopped
    }

    /// Why the service most recently stopped.
    pub fn stop_reason(&self) -> StoppedReason {
        self.stop_reason
    }

    /// Whether the service currently holds the console.
    pub fn has_console(&self) -> bool {
        self.have_console
    }

    /// Whether the service is waiting in the console queue.
    pub fn is_waiting_for_console(&self) -> bool {
        self.in_console_queue
    }

    /// Whether startup was skipped.
    pub fn was_start_skipped(&self) -> bool {
        self.start_skipped
    }

    /// Resolved settings.
    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Pid of the live child, if any.
    pub fn pid(&self) -> Option<nix::unistd::Pid> {
        self.proc.as_ref().and_then(|p| p.pid)
    }

    /// Exit status of the most recently reaped child.
    pub fn exit_status(&self) -> Option<crate::reactor::ExitStatus> {
        self.proc.as_ref().and_then(|p| p.exit_status)
    }

    /// Details of the most recent exec failure.
    pub fn exec_err(&self) -> Option<ExecError> {
        self.proc.as_ref().and_then(|p| p.exec_err)
    }

    /// Control connections listening on this record.
    pub fn listeners(&self) -> &BTreeSet<ConnId> {
        &self.listeners
    }

    /// Dependency edge ids (outgoing).
    pub fn depends_on(&self) -> &[EdgeId] {
        &self.depends_on
    }

    /// Dependent edge ids (incoming).
    pub fn dependents(&self) -> &[EdgeId] {
        &self.dependents
    }

    /// Whether the service, fundamentally, counts as stopped for
    /// dependents wanting to stop: fully stopped, or still harmlessly
    /// waiting to start.
    pub(crate) fn is_stopped_for_dependents(&self) -> bool {
        self.state == ServiceState::Stopped
            || (self.state == ServiceState::Starting && self.waiting_for_deps)
    }

    /// Whether a stop in progress can be flipped straight back to
    /// Started (it is still only waiting for dependents).
    pub(crate) fn can_interrupt_stop(&self) -> bool {
        self.waiting_for_deps && !self.force_stop
    }

    pub(crate) fn notify(&self, out: &mut Vec<EmittedEvent>, sid: ServiceId, event: ServiceEvent) {
        for &conn in &self.listeners {
            out.push(EmittedEvent { conn, sid, event });
        }
    }
}
