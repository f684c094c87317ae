//! The service set: membership, queues, console arbitration and the
//! two-phase state machine.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::error::LoadError;
use crate::logging;
use crate::proto::{DepKind, ServiceEvent, ServiceState, ShutdownType, StoppedReason};
use crate::reactor::Reactor;
use crate::service::{ConnId, DepEdge, EdgeId, ServiceId, ServiceRecord};
use crate::settings::{ServiceKind, ServiceSettings};

/// A service event captured for one listening control connection.
///
/// Listener callbacks may themselves mutate the graph (a closing
/// connection removes itself from listener sets), so events are
/// snapshotted at emission time and delivered by the driver after
/// queue processing; delivery tolerates connections that have since
/// gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmittedEvent {
    /// The listening connection.
    pub conn: ConnId,
    /// The service the event occurred on.
    pub sid: ServiceId,
    /// The event.
    pub event: ServiceEvent,
}

/// A set of interdependent service records.
pub struct ServiceSet {
    records: Vec<Option<ServiceRecord>>,
    edges: Vec<Option<DepEdge>>,

    /// Services not currently in the Stopped state.
    active_count: u32,
    restart_enabled: bool,
    shutdown_type: Option<ShutdownType>,

    prop_queue: VecDeque<ServiceId>,
    transition_queue: VecDeque<ServiceId>,

    console_holder: Option<ServiceId>,
    console_queue: VecDeque<ServiceId>,

    events: Vec<EmittedEvent>,

    /// Server ends of control-socket pairs created for children with
    /// the pass-control-fd flag; the driver hands these to the control
    /// server.
    pending_cs_fds: Vec<std::os::fd::OwnedFd>,
}

impl Default for ServiceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceSet {
    /// Creates an empty set.
    pub fn new() -> ServiceSet {
        ServiceSet {
            records: Vec::new(),
            edges: Vec::new(),
            active_count: 0,
            restart_enabled: true,
            shutdown_type: None,
            prop_queue: VecDeque::new(),
            transition_queue: VecDeque::new(),
            console_holder: None,
            console_queue: VecDeque::new(),
            events: Vec::new(),
            pending_cs_fds: Vec::new(),
        }
    }

    /// Queues a control-socket fd for the control server to adopt.
    pub(crate) fn queue_control_fd(&mut self, fd: std::os::fd::OwnedFd) {
        self.pending_cs_fds.push(fd);
    }

    /// Takes the control-socket fds created since the last call.
    pub fn take_pending_control_fds(&mut self) -> Vec<std::os::fd::OwnedFd> {
        std::mem::take(&mut self.pending_cs_fds)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Locates a record by name.
    pub fn find(&self, name: &str) -> Option<ServiceId> {
        self.records.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|r| r.name == name)
                .map(|_| ServiceId::from_index(i))
        })
    }

    /// Adds a record built from resolved settings. Dependencies are
    /// linked separately via [`ServiceSet::add_dep`].
    pub fn add_service(&mut self, name: &str, settings: ServiceSettings) -> ServiceId {
        let record = ServiceRecord::new(name.to_owned(), settings);
        if let Some(free) = self.records.iter().position(Option::is_none) {
            self.records[free] = Some(record);
            ServiceId::from_index(free)
        } else {
            self.records.push(Some(record));
            ServiceId::from_index(self.records.len() - 1)
        }
    }

    /// Removes a stopped record with no remaining dependents. The
    /// record's own dependency edges are unlinked.
    pub fn remove_service(&mut self, sid: ServiceId) -> Result<(), &'static str> {
        {
            let rec = self.rec(sid);
            if rec.state != ServiceState::Stopped {
                return Err("service is not stopped");
            }
            if !rec.dependents.is_empty() {
                return Err("service has dependents");
            }
        }
        self.unlink_dependencies(sid);
        self.console_queue.retain(|&s| s != sid);
        self.records[sid.index()] = None;
        Ok(())
    }

    /// Fills in the real settings of a record created as a placeholder
    /// during loading.
    pub fn promote_placeholder(&mut self, sid: ServiceId, settings: ServiceSettings) {
        let rec = self.rec_mut(sid);
        debug_assert_eq!(rec.settings.kind, ServiceKind::Placeholder);
        rec.proc = settings
            .kind
            .has_process()
            .then(|| crate::service::ProcState::new(&settings));
        rec.settings = settings;
    }

    /// Replaces a stopped record with a fresh one of (possibly) another
    /// kind, rewriting dependents' back-edges to point at the
    /// replacement. The caller links the new record's own dependencies.
    pub fn replace_record(
        &mut self,
        old: ServiceId,
        settings: ServiceSettings,
    ) -> Result<ServiceId, LoadError> {
        if self.rec(old).state != ServiceState::Stopped {
            return Err(LoadError::Description {
                service: self.rec(old).name.clone(),
                detail: "service must be stopped to be replaced".into(),
                line: None,
            });
        }
        let name = self.rec(old).name.clone();
        let new = self.add_service(&name, settings);
        let back_edges = std::mem::take(&mut self.rec_mut(old).dependents);
        for eid in &back_edges {
            self.edge_mut(*eid).to = new;
        }
        self.rec_mut(new).dependents = back_edges;
        self.unlink_dependencies(old);
        self.console_queue.retain(|&s| s != old);
        self.records[old.index()] = None;
        Ok(new)
    }

    /// Unlinks all outgoing edges of `sid` (used on removal and on
    /// reload-replacement).
    pub(crate) fn unlink_dependencies(&mut self, sid: ServiceId) {
        let out_edges = std::mem::take(&mut self.rec_mut(sid).depends_on);
        for eid in out_edges {
            let to = self.edge(eid).to;
            self.rec_mut(to).dependents.retain(|&e| e != eid);
            self.edges[eid.index()] = None;
        }
    }

    /// All live service ids, in insertion order.
    pub fn ids(&self) -> Vec<ServiceId> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| ServiceId::from_index(i)))
            .collect()
    }

    /// Borrows a record.
    pub fn rec(&self, sid: ServiceId) -> &ServiceRecord {
        self.records[sid.index()].as_ref().expect("live service id")
    }

    /// Borrows a record mutably.
    pub(crate) fn rec_mut(&mut self, sid: ServiceId) -> &mut ServiceRecord {
        self.records[sid.index()].as_mut().expect("live service id")
    }

    /// Whether the id refers to a live record.
    pub fn contains(&self, sid: ServiceId) -> bool {
        self.records
            .get(sid.index())
            .is_some_and(Option::is_some)
    }

    /// Borrows an edge.
    pub fn edge(&self, eid: EdgeId) -> &DepEdge {
        self.edges[eid.index()].as_ref().expect("live edge id")
    }

    pub(crate) fn edge_mut(&mut self, eid: EdgeId) -> &mut DepEdge {
        self.edges[eid.index()].as_mut().expect("live edge id")
    }

    // ------------------------------------------------------------------
    // Dependency edges
    // ------------------------------------------------------------------

    /// Finds an existing edge between two services of the given kind.
    pub fn find_dep(&self, from: ServiceId, to: ServiceId, kind: DepKind) -> Option<EdgeId> {
        self.rec(from)
            .depends_on
            .iter()
            .copied()
            .find(|&eid| {
                let e = self.edge(eid);
                e.to == to && e.kind == kind
            })
    }

    /// Creates a dependency edge. The caller is responsible for cycle
    /// checking ([`ServiceSet::would_create_cycle`]).
    pub fn add_dep(&mut self, from: ServiceId, to: ServiceId, kind: DepKind) -> EdgeId {
        let edge = DepEdge { from, to, kind, holding_acq: false, waiting_on: false };
        let eid = if let Some(free) = self.edges.iter().position(Option::is_none) {
            self.edges[free] = Some(edge);
            EdgeId::from_index(free)
        } else {
            self.edges.push(Some(edge));
            EdgeId::from_index(self.edges.len() - 1)
        };
        self.rec_mut(from).depends_on.push(eid);
        self.rec_mut(to).dependents.push(eid);
        eid
    }

    /// Removes a dependency edge, releasing any held acquire.
    pub fn rm_dep(&mut self, from: ServiceId, to: ServiceId, kind: DepKind) -> bool {
        let Some(eid) = self.find_dep(from, to, kind) else {
            return false;
        };
        let held = self.edge(eid).holding_acq;
        self.rec_mut(from).depends_on.retain(|&e| e != eid);
        self.rec_mut(to).dependents.retain(|&e| e != eid);
        self.edges[eid.index()] = None;
        if held {
            self.release(to);
        }
        true
    }

    /// Depth-first search over acquiring edges: would an edge
    /// `from -> to` introduce a cycle? Ordering-only edges are not
    /// traversed.
    pub fn would_create_cycle(&self, from: ServiceId, to: ServiceId) -> bool {
        let mut marks = std::collections::HashSet::new();
        let mut queue = vec![to];
        while let Some(sid) = queue.pop() {
            for &eid in &self.rec(sid).depends_on {
                let edge = self.edge(eid);
                if !edge.kind.acquires() {
                    continue;
                }
                if edge.to == from {
                    return true;
                }
                if marks.insert(edge.to) {
                    queue.push(edge.to);
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    pub(crate) fn add_prop_queue(&mut self, sid: ServiceId) {
        let rec = self.rec_mut(sid);
        if !rec.in_prop_queue {
            rec.in_prop_queue = true;
            self.prop_queue.push_back(sid);
        }
    }

    pub(crate) fn add_transition_queue(&mut self, sid: ServiceId) {
        let rec = self.rec_mut(sid);
        if !rec.in_transition_queue {
            rec.in_transition_queue = true;
            self.transition_queue.push_back(sid);
        }
    }

    /// Processes the propagation and transition queues until both are
    /// empty. Any operation that manipulates the queues must be
    /// followed by a call to this before control returns to the
    /// reactor.
    pub fn process_queues(&mut self, rx: &mut Reactor) {
        while !self.prop_queue.is_empty() || !self.transition_queue.is_empty() {
            while let Some(sid) = self.prop_queue.pop_front() {
                self.rec_mut(sid).in_prop_queue = false;
                self.do_propagation(sid, rx);
            }
            while let Some(sid) = self.transition_queue.pop_front() {
                self.rec_mut(sid).in_transition_queue = false;
                self.execute_transition(sid, rx);
            }
        }
    }

    /// Takes the service events emitted since the last call.
    pub fn take_events(&mut self) -> Vec<EmittedEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn notify_listeners(&mut self, sid: ServiceId, event: ServiceEvent) {
        let rec = self.rec(sid);
        let mut out = Vec::new();
        rec.notify(&mut out, sid, event);
        self.events.extend(out);
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Registers a control connection as listener on a record.
    pub fn add_listener(&mut self, sid: ServiceId, conn: ConnId) {
        self.rec_mut(sid).listeners.insert(conn);
    }

    /// Removes a listener from one record.
    pub fn remove_listener(&mut self, sid: ServiceId, conn: ConnId) {
        self.rec_mut(sid).listeners.remove(&conn);
    }

    /// Removes a listener from every record (connection closed).
    pub fn remove_listener_all(&mut self, conn: ConnId) {
        for slot in self.records.iter_mut().flatten() {
            slot.listeners.remove(&conn);
        }
        self.events.retain(|ev| ev.conn != conn);
    }

    // ------------------------------------------------------------------
    // Activity and shutdown
    // ------------------------------------------------------------------

    /// Number of services not in the Stopped state.
    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    /// Whether automatic restarts are currently allowed.
    pub fn restart_enabled(&self) -> bool {
        self.restart_enabled
    }

    /// Enables or disables automatic restarts globally.
    pub fn set_restart_enabled(&mut self, enabled: bool) {
        self.restart_enabled = enabled;
    }

    /// Whether a shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_type.is_some()
    }

    /// The shutdown kind chosen, once a shutdown was initiated.
    pub fn shutdown_type(&self) -> Option<ShutdownType> {
        self.shutdown_type
    }

    /// Resumes normal service management after a Remain shutdown.
    pub fn reset_shutdown(&mut self) {
        self.shutdown_type = None;
        self.restart_enabled = true;
    }

    /// Stops every service in preparation for the given shutdown kind:
    /// automatic restart is disabled, all pins are removed, all
    /// services are released and stopped, and the queues drained.
    pub fn stop_all_services(&mut self, kind: ShutdownType, rx: &mut Reactor) {
        info!("stopping all services ({kind})");
        self.restart_enabled = false;
        self.shutdown_type = Some(kind);
        for sid in self.ids() {
            self.stop(sid, false, rx);
            self.unpin(sid, rx);
        }
        self.process_queues(rx);
    }

    pub(crate) fn set_state(&mut self, sid: ServiceId, state: ServiceState) {
        let rec = self.rec_mut(sid);
        let old = rec.state;
        rec.state = state;
        if old == ServiceState::Stopped && state != ServiceState::Stopped {
            self.active_count += 1;
        } else if old != ServiceState::Stopped && state == ServiceState::Stopped {
            self.active_count -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Console arbitration
    // ------------------------------------------------------------------

    /// Attempts to take the console for `sid`. On refusal the service
    /// is appended to the console queue and will receive
    /// `acquired_console` when its turn comes.
    pub(crate) fn try_acquire_console(&mut self, sid: ServiceId) -> bool {
        if self.console_holder.is_none() && self.console_queue.is_empty() {
            self.console_holder = Some(sid);
            self.rec_mut(sid).have_console = true;
            logging::enable_console_log(false);
            true
        } else {
            let rec = self.rec_mut(sid);
            if !rec.in_console_queue {
                rec.in_console_queue = true;
                self.console_queue.push_back(sid);
            }
            false
        }
    }

    /// Releases the console held by `sid` and hands it to the next
    /// queued service, or back to the logger.
    pub(crate) fn release_console(&mut self, sid: ServiceId, rx: &mut Reactor) {
        debug_assert_eq!(self.console_holder, Some(sid));
        self.rec_mut(sid).have_console = false;
        self.console_holder = None;
        if let Some(next) = self.console_queue.pop_front() {
            let rec = self.rec_mut(next);
            rec.in_console_queue = false;
            rec.have_console = true;
            self.console_holder = Some(next);
            self.acquired_console(next, rx);
        } else {
            logging::enable_console_log(true);
        }
    }

    pub(crate) fn unqueue_console(&mut self, sid: ServiceId) {
        if self.rec(sid).in_console_queue {
            self.rec_mut(sid).in_console_queue = false;
            self.console_queue.retain(|&s| s != sid);
        }
    }

    fn acquired_console(&mut self, sid: ServiceId, rx: &mut Reactor) {
        if self.rec(sid).state != ServiceState::Starting {
            // We got the console but no longer want it.
            self.release_console(sid, rx);
        } else if self.check_deps_started(sid) {
            self.all_deps_started(sid, true, rx);
        } else {
            // We got the console but can't use it yet.
            self.release_console(sid, rx);
        }
    }

    /// The current console holder, if any.
    pub fn console_holder(&self) -> Option<ServiceId> {
        self.console_holder
    }

    // ------------------------------------------------------------------
    // Acquire / release
    // ------------------------------------------------------------------

    pub(crate) fn require(&mut self, sid: ServiceId) {
        let rec = self.rec_mut(sid);
        rec.required_by += 1;
        if rec.required_by == 1 {
            rec.prop_require = !rec.prop_release;
            rec.prop_release = false;
            self.add_prop_queue(sid);
        }
    }

    pub(crate) fn release(&mut self, sid: ServiceId) {
        let rec = self.rec_mut(sid);
        debug_assert!(rec.required_by > 0);
        rec.required_by -= 1;
        if rec.required_by == 0 {
            rec.target_state = ServiceState::Stopped;
            // No release needs to be issued if the require was still
            // pending.
            rec.prop_release = !rec.prop_require;
            rec.prop_require = false;
            let stopped = rec.state == ServiceState::Stopped;
            self.add_prop_queue(sid);
            if !stopped {
                self.add_transition_queue_for_stop(sid);
            }
        }
    }

    fn add_transition_queue_for_stop(&mut self, sid: ServiceId) {
        // Deferred via prop_stop so that release cascades settle in the
        // propagation phase first.
        self.rec_mut(sid).prop_stop = true;
        self.add_prop_queue(sid);
    }

    pub(crate) fn release_dependencies(&mut self, sid: ServiceId) {
        let edges = self.rec(sid).depends_on.clone();
        for eid in edges {
            let edge = self.edge_mut(eid);
            if edge.holding_acq {
                edge.holding_acq = false;
                let to = edge.to;
                self.release(to);
            }
        }
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Starts the service, optionally marking it explicitly activated.
    /// The caller must drain the queues afterwards.
    pub fn start(&mut self, sid: ServiceId, activate: bool) {
        {
            let explicit = self.rec(sid).start_explicit;
            if activate && !explicit {
                self.rec_mut(sid).start_explicit = true;
                self.require(sid);
            }
        }

        let rec = self.rec(sid);
        if rec.target_state == ServiceState::Started && rec.state != ServiceState::Stopped
        {
            return;
        }

        self.rec_mut(sid).target_state = ServiceState::Started;

        if self.rec(sid).pinned_stopped {
            // The start is recorded in the target state and resumes on
            // unpin.
            return;
        }

        let state = self.rec(sid).state;
        if state != ServiceState::Stopped {
            // Already starting, or stopping and we must wait for that
            // to complete unless the stop is interruptible.
            if state != ServiceState::Stopping || !self.rec(sid).can_interrupt_stop() {
                return;
            }
            // The stop was only waiting for dependents; those are in
            // turn waiting for us, so everyone flips back to Starting.
            self.notify_listeners(sid, ServiceEvent::StopCancelled);
        }

        self.set_state(sid, ServiceState::Starting);
        self.rec_mut(sid).waiting_for_deps = true;
        self.rec_mut(sid).stop_reason = StoppedReason::Normal;

        if self.start_check_dependencies(sid) {
            self.add_transition_queue(sid);
        }
    }

    /// Activates a single dependency edge on behalf of its dependent
    /// (WakeService, EnableService).
    pub fn start_dep(&mut self, eid: EdgeId) {
        let edge = self.edge_mut(eid);
        if edge.holding_acq {
            return;
        }
        edge.holding_acq = true;
        let to = edge.to;
        self.require(to);
        self.rec_mut(to).prop_start = true;
        self.add_prop_queue(to);
    }

    fn start_check_dependencies(&mut self, sid: ServiceId) -> bool {
        let mut all_started = true;
        let edges = self.rec(sid).depends_on.clone();
        for eid in edges {
            let (to, kind) = {
                let e = self.edge(eid);
                (e.to, e.kind)
            };
            let to_state = self.rec(to).state;
            match kind {
                DepKind::Before => {
                    // We start before the target; nothing to wait for.
                }
                DepKind::After => {
                    // Ordering only: wait while the target is itself
                    // activating, but do not make it start.
                    if to_state == ServiceState::Starting {
                        self.edge_mut(eid).waiting_on = true;
                        all_started = false;
                    }
                }
                _ => {
                    if to_state != ServiceState::Started {
                        if to_state != ServiceState::Starting {
                            self.rec_mut(to).prop_start = true;
                            self.add_prop_queue(to);
                        }
                        if kind.waits() {
                            self.edge_mut(eid).waiting_on = true;
                            all_started = false;
                        }
                    }
                }
            }
        }
        all_started && !self.blocked_by_before(sid)
    }

    pub(crate) fn check_deps_started(&self, sid: ServiceId) -> bool {
        let rec = self.rec(sid);
        for &eid in &rec.depends_on {
            let e = self.edge(eid);
            if e.waiting_on {
                return false;
            }
            if e.kind == DepKind::After {
                // Live ordering check; the target may have begun
                // activating after our initial dependency scan.
                let to = self.rec(e.to);
                if to.state == ServiceState::Starting
                    && to.target_state == ServiceState::Started
                {
                    return false;
                }
            }
        }
        !self.blocked_by_before(sid)
    }

    /// Whether a service ordered before this one is still activating.
    fn blocked_by_before(&self, sid: ServiceId) -> bool {
        self.rec(sid).dependents.iter().any(|&eid| {
            let e = self.edge(eid);
            if e.kind != DepKind::Before {
                return false;
            }
            let from = self.rec(e.from);
            from.state == ServiceState::Starting
                && from.target_state == ServiceState::Started
        })
    }

    /// Clears the waiting flag on every outgoing edge; the start cycle
    /// they belonged to is over.
    fn clear_dependency_waits(&mut self, sid: ServiceId) {
        let edges = self.rec(sid).depends_on.clone();
        for eid in edges {
            self.edge_mut(eid).waiting_on = false;
        }
    }

    /// A dependency of this service reached the Started state (or an
    /// ordering constraint cleared).
    pub(crate) fn dependency_started(&mut self, sid: ServiceId) {
        let rec = self.rec(sid);
        if (rec.state == ServiceState::Starting || rec.state == ServiceState::Started)
            && rec.waiting_for_deps
        {
            self.add_transition_queue(sid);
        }
    }

    /// All gates passed: claim the console if needed, then bring the
    /// service up.
    pub(crate) fn all_deps_started(
        &mut self,
        sid: ServiceId,
        mut have_console: bool,
        rx: &mut Reactor,
    ) {
        if self.rec(sid).settings.flags.starts_on_console && !have_console {
            if self.try_acquire_console(sid) {
                have_console = true;
            } else {
                self.rec_mut(sid).waiting_for_deps = true;
                return;
            }
        }
        debug_assert!(have_console || !self.rec(sid).settings.flags.starts_on_console);

        // A pending restart delay must elapse before launching again.
        if self
            .rec(sid)
            .proc
            .as_ref()
            .is_some_and(|p| p.waiting_restart_timer)
        {
            self.rec_mut(sid).waiting_for_deps = true;
            return;
        }

        self.rec_mut(sid).waiting_for_deps = false;

        if !self.open_activation_socket(sid) {
            self.rec_mut(sid).stop_reason = StoppedReason::Failed;
            self.failed_to_start(sid, false, rx);
            return;
        }

        if !self.bring_up(sid, rx) {
            self.failed_to_start(sid, false, rx);
        }
    }

    // ------------------------------------------------------------------
    // Propagation and transition
    // ------------------------------------------------------------------

    fn do_propagation(&mut self, sid: ServiceId, rx: &mut Reactor) {
        if self.rec(sid).prop_require {
            // Need to acquire all our dependencies.
            let edges = self.rec(sid).depends_on.clone();
            for eid in edges {
                let (to, acquires) = {
                    let e = self.edge(eid);
                    (e.to, e.kind.acquires())
                };
                if acquires {
                    self.require(to);
                    self.edge_mut(eid).holding_acq = true;
                }
            }
            self.rec_mut(sid).prop_require = false;
        }

        if self.rec(sid).prop_release {
            self.release_dependencies(sid);
            self.rec_mut(sid).prop_release = false;
        }

        if self.rec(sid).prop_failure {
            self.rec_mut(sid).prop_failure = false;
            self.rec_mut(sid).stop_reason = StoppedReason::DepFailed;
            self.failed_to_start(sid, true, rx);
        }

        if self.rec(sid).prop_start {
            self.rec_mut(sid).prop_start = false;
            self.start(sid, false);
        }

        if self.rec(sid).prop_stop {
            self.rec_mut(sid).prop_stop = false;
            self.do_stop(sid, rx);
        }
    }

    fn execute_transition(&mut self, sid: ServiceId, rx: &mut Reactor) {
        let state = self.rec(sid).state;
        match state {
            ServiceState::Starting => {
                if self.check_deps_started(sid) {
                    self.all_deps_started(sid, self.rec(sid).have_console, rx);
                }
            }
            ServiceState::Stopping => {
                if self.stop_check_dependents(sid) {
                    self.bring_down(sid, rx);
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Started / failed
    // ------------------------------------------------------------------

    /// The service reached the Started state.
    pub(crate) fn started(&mut self, sid: ServiceId, rx: &mut Reactor) {
        // The startup is over; a pending start timeout no longer
        // applies.
        if let Some(proc) = self.rec_mut(sid).proc.as_mut() {
            if proc.waiting_stopstart_timer {
                proc.waiting_stopstart_timer = false;
                rx.stop_timer(crate::reactor::TimerTag::Process(sid));
            }
        }

        {
            let rec = self.rec(sid);
            if rec.have_console
                && rec.settings.flags.starts_on_console
                && !rec.settings.flags.runs_on_console
            {
                self.release_console(sid, rx);
            }
        }

        logging::log_service_started(self.rec(sid).name());
        self.set_state(sid, ServiceState::Started);
        self.rec_mut(sid).restarting = false;
        self.notify_listeners(sid, ServiceEvent::Started);

        let rec = self.rec(sid);
        if rec.force_stop || rec.target_state == ServiceState::Stopped {
            // Re-targeted during startup; stop immediately.
            self.do_stop(sid, rx);
            return;
        }

        self.wake_dependents_after_start(sid);
    }

    fn wake_dependents_after_start(&mut self, sid: ServiceId) {
        let dependents = self.rec(sid).dependents.clone();
        for eid in dependents {
            let from = {
                let e = self.edge_mut(eid);
                e.waiting_on = false;
                e.from
            };
            self.dependency_started(from);
        }
        self.poke_before_targets(sid);
    }

    /// Re-queues services ordered after this one (Before edges out of
    /// `sid`) once it settles.
    fn poke_before_targets(&mut self, sid: ServiceId) {
        let edges = self.rec(sid).depends_on.clone();
        for eid in edges {
            let e = self.edge(eid);
            if e.kind != DepKind::Before {
                continue;
            }
            let to = e.to;
            if self.rec(to).state == ServiceState::Starting {
                self.add_transition_queue(to);
            }
        }
    }

    /// The service failed to start. `dep_failed` records whether the
    /// failure is due to a dependency failing.
    pub(crate) fn failed_to_start(&mut self, sid: ServiceId, dep_failed: bool, rx: &mut Reactor) {
        {
            let rec = self.rec(sid);
            if !dep_failed && rec.have_console {
                self.release_console(sid, rx);
            }
        }

        logging::log_service_failed(self.rec(sid).name());
        if self.rec(sid).stop_reason == StoppedReason::Normal {
            self.rec_mut(sid).stop_reason = StoppedReason::Failed;
        }
        self.set_state(sid, ServiceState::Stopped);
        self.rec_mut(sid).target_state = ServiceState::Stopped;
        self.rec_mut(sid).waiting_for_deps = false;
        self.rec_mut(sid).restarting = false;
        self.rec_mut(sid).restart_requested = false;
        self.clear_dependency_waits(sid);

        if self.rec(sid).start_explicit {
            self.rec_mut(sid).start_explicit = false;
            self.release(sid);
        }
        self.notify_listeners(sid, ServiceEvent::FailedStart);

        // Held acquires on our own dependencies are released through
        // the activation count reaching zero (prop_release).
        self.cancel_dependent_starts(sid);
        self.poke_before_targets(sid);
        self.became_inactive(sid);
    }

    /// Cancels the starts of dependents: hard dependents fail in turn,
    /// soft dependents are released and signalled to continue.
    pub(crate) fn cancel_dependent_starts(&mut self, sid: ServiceId) {
        let dependents = self.rec(sid).dependents.clone();
        for eid in dependents {
            let (from, kind, waiting, holding) = {
                let e = self.edge(eid);
                (e.from, e.kind, e.waiting_on, e.holding_acq)
            };
            match kind {
                DepKind::Regular | DepKind::Milestone
                    if self.rec(from).state == ServiceState::Starting =>
                {
                    self.rec_mut(from).prop_failure = true;
                    self.add_prop_queue(from);
                }
                DepKind::Before | DepKind::After => {
                    if waiting {
                        self.edge_mut(eid).waiting_on = false;
                        self.dependency_started(from);
                    }
                }
                _ => {
                    // Waits-for/soft dependents (and milestone edges
                    // whose dependent is already up): the dependency is
                    // "ready or failed", release and continue.
                    if waiting {
                        self.edge_mut(eid).waiting_on = false;
                        self.dependency_started(from);
                    }
                    if holding {
                        self.edge_mut(eid).holding_acq = false;
                        self.release(sid);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    /// Stops the service: clears explicit activation and, with
    /// `bring_down`, actively takes the service down.
    pub fn stop(&mut self, sid: ServiceId, bring_down: bool, rx: &mut Reactor) {
        if self.rec(sid).start_explicit {
            self.rec_mut(sid).start_explicit = false;
            self.release(sid);
        }
        if bring_down {
            self.do_stop(sid, rx);
        }
    }

    /// Marks this service force-stopped: its stop can no longer be
    /// cancelled by re-activation, and the force propagates to regular
    /// dependents as they are stopped.
    pub fn forced_stop(&mut self, sid: ServiceId) {
        if self.rec(sid).state != ServiceState::Stopped {
            self.rec_mut(sid).force_stop = true;
            self.add_transition_queue(sid);
        }
    }

    pub(crate) fn do_stop(&mut self, sid: ServiceId, rx: &mut Reactor) {
        if self.rec(sid).pinned_started {
            // The stop is recorded in the target state and resumes on
            // unpin.
            return;
        }

        {
            let rec = self.rec(sid);
            if rec.start_explicit
                && !rec.restart_requested
                && !(rec.settings.auto_restart && self.restart_enabled)
            {
                self.rec_mut(sid).start_explicit = false;
                self.release(sid);
                if self.rec(sid).required_by == 0 {
                    // The release already queued the stop.
                    return;
                }
            }
        }

        let state = self.rec(sid).state;
        if state != ServiceState::Started {
            if state == ServiceState::Starting {
                if !self.can_interrupt_start(sid) {
                    // We have to continue starting, but dependents must
                    // not think they are still waiting to start.
                    self.stop_dependents(sid);
                    return;
                }
                self.notify_listeners(sid, ServiceEvent::StartCancelled);
                if self.rec(sid).settings.flags.skippable {
                    self.rec_mut(sid).start_skipped = true;
                }
                if !self.interrupt_start(sid, rx) {
                    // Interrupt is in progress (signal sent); the state
                    // is already Stopping.
                    self.stop_dependents(sid);
                    return;
                }
                // Start fully interrupted; fall through to stop now.
            } else {
                // Already stopping or stopped.
                return;
            }
        }

        self.set_state(sid, ServiceState::Stopping);
        self.rec_mut(sid).waiting_for_deps = true;
        if self.stop_dependents(sid) {
            self.add_transition_queue(sid);
        }
    }

    pub(crate) fn stop_check_dependents(&self, sid: ServiceId) -> bool {
        self.rec(sid).dependents.iter().all(|&eid| {
            let e = self.edge(eid);
            e.kind != DepKind::Regular || self.rec(e.from).is_stopped_for_dependents()
        })
    }

    /// Issues a stop to all regular dependents; returns whether they
    /// are all already stopped.
    pub(crate) fn stop_dependents(&mut self, sid: ServiceId) -> bool {
        let force = self.rec(sid).force_stop;
        self.stop_dependents_inner(sid, force)
    }

    /// As [`ServiceSet::stop_dependents`], but propagates a forced stop
    /// regardless of this record's own force flag (emergency stop).
    pub(crate) fn stop_dependents_forced(&mut self, sid: ServiceId) -> bool {
        self.stop_dependents_inner(sid, true)
    }

    fn stop_dependents_inner(&mut self, sid: ServiceId, force: bool) -> bool {
        let mut all_stopped = true;
        let dependents = self.rec(sid).dependents.clone();
        for eid in dependents {
            let (from, kind) = {
                let e = self.edge(eid);
                (e.from, e.kind)
            };
            if kind != DepKind::Regular {
                continue;
            }
            if !self.rec(from).is_stopped_for_dependents() {
                all_stopped = false;
            }
            if force {
                self.forced_stop(from);
            }
            self.rec_mut(from).prop_stop = true;
            self.add_prop_queue(from);
        }
        all_stopped
    }

    /// A dependent of this service reached the Stopped state.
    pub(crate) fn dependent_stopped(&mut self, sid: ServiceId) {
        let rec = self.rec(sid);
        if rec.state == ServiceState::Stopping && rec.waiting_for_deps {
            self.add_transition_queue(sid);
        }
    }

    /// The service has actually stopped; dependents have stopped
    /// already unless this stop is due to unexpected termination.
    pub(crate) fn stopped(&mut self, sid: ServiceId, rx: &mut Reactor) {
        if self.rec(sid).have_console {
            self.release_console(sid, rx);
        }

        self.proc_cleanup_on_stop(sid, rx);

        // Break soft acquisitions from dependents now: a non-regular
        // dependent does not hold us active across our stop.
        let dependents = self.rec(sid).dependents.clone();
        for eid in dependents {
            let (kind, holding) = {
                let e = self.edge(eid);
                (e.kind, e.holding_acq)
            };
            if kind != DepKind::Regular && holding {
                self.edge_mut(eid).holding_acq = false;
                self.release(sid);
            }
        }

        let will_restart = {
            let rec = self.rec(sid);
            let auto = rec.restarting
                || (rec.settings.auto_restart && rec.target_state == ServiceState::Started);
            if rec.restart_requested {
                rec.required_by > 0 && self.restart_enabled
            } else {
                rec.target_state == ServiceState::Started
                    && auto
                    && self.restart_enabled
                    && !rec.force_stop
            }
        };

        // Signal dependencies in case they are waiting for us to stop.
        let edges = self.rec(sid).depends_on.clone();
        for eid in edges {
            let to = self.edge(eid).to;
            self.dependent_stopped(to);
        }
        self.clear_dependency_waits(sid);

        self.set_state(sid, ServiceState::Stopped);
        self.rec_mut(sid).waiting_for_deps = false;
        self.rec_mut(sid).force_stop = false;

        if will_restart {
            let rec = self.rec_mut(sid);
            rec.restarting = true;
            rec.restart_requested = false;
            self.start(sid, false);
        } else {
            self.rec_mut(sid).restarting = false;
            self.rec_mut(sid).restart_requested = false;
            if self.rec(sid).start_explicit {
                self.rec_mut(sid).start_explicit = false;
                self.release(sid);
            }
            self.deactivate_process_resources(sid, rx);
        }

        logging::log_service_stopped(self.rec(sid).name());
        self.notify_listeners(sid, ServiceEvent::Stopped);
        self.poke_before_targets(sid);
    }

    fn became_inactive(&mut self, sid: ServiceId) {
        if let Some(proc) = self.rec_mut(sid).proc.as_mut() {
            proc.close_activation_socket();
        }
    }

    /// Releases per-process resources that do not survive deactivation.
    fn deactivate_process_resources(&mut self, sid: ServiceId, rx: &mut Reactor) {
        self.close_log_pipe(sid, rx);
        self.became_inactive(sid);
    }

    /// Unexpected termination with no recovery possible for dependents:
    /// regular dependents are forced down along with this service.
    pub(crate) fn emergency_stop(&mut self, sid: ServiceId, rx: &mut Reactor) {
        {
            let rec = self.rec(sid);
            let auto = rec.settings.auto_restart && self.restart_enabled;
            if !auto && rec.start_explicit {
                self.rec_mut(sid).start_explicit = false;
                self.release(sid);
            }
        }
        self.rec_mut(sid).stop_reason = StoppedReason::Terminated;
        self.stop_dependents_forced(sid);
        self.stopped(sid, rx);
    }

    /// The service cannot be recovered (restart rate limit exceeded or
    /// recovery launch failed): stop it and its dependents for good.
    pub(crate) fn unrecoverable_stop(&mut self, sid: ServiceId, rx: &mut Reactor) {
        logging::log_service_failed(self.rec(sid).name());
        {
            let rec = self.rec_mut(sid);
            rec.target_state = ServiceState::Stopped;
            rec.force_stop = true;
            rec.restarting = false;
            if rec.stop_reason == StoppedReason::Normal {
                rec.stop_reason = StoppedReason::Terminated;
            }
        }
        if self.rec(sid).start_explicit {
            self.rec_mut(sid).start_explicit = false;
            self.release(sid);
        }
        self.do_stop(sid, rx);
    }

    /// Atomic restart of a started service. Only permitted while the
    /// service is Started and held active; dependents are not torn
    /// down (the control layer refuses a restart that would affect
    /// dependents before it reaches here).
    pub fn restart(&mut self, sid: ServiceId) -> bool {
        let rec = self.rec(sid);
        if rec.state != ServiceState::Started || rec.required_by == 0 {
            return false;
        }
        let rec = self.rec_mut(sid);
        rec.restart_requested = true;
        rec.stop_reason = StoppedReason::Normal;
        self.set_state(sid, ServiceState::Stopping);
        self.rec_mut(sid).waiting_for_deps = true;
        if self.stop_check_dependents(sid) {
            self.add_transition_queue(sid);
        }
        true
    }

    // ------------------------------------------------------------------
    // Start interruption
    // ------------------------------------------------------------------

    pub(crate) fn can_interrupt_start(&self, sid: ServiceId) -> bool {
        let rec = self.rec(sid);
        rec.waiting_for_deps
            || rec.settings.flags.start_interruptible
            || rec.proc.as_ref().is_some_and(|p| p.waiting_restart_timer)
    }

    /// Interrupts a start in progress. Returns true if the start was
    /// fully interrupted (the service can go straight to Stopped);
    /// false if an interrupt was issued and the service is now
    /// Stopping, waiting for the process to die.
    pub(crate) fn interrupt_start(&mut self, sid: ServiceId, rx: &mut Reactor) -> bool {
        self.unqueue_console(sid);
        if self.rec(sid).proc.is_some() {
            self.proc_interrupt_start(sid, rx)
        } else {
            true
        }
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    /// Pins the service in the started state (once reached).
    pub fn pin_start(&mut self, sid: ServiceId) {
        self.rec_mut(sid).pinned_started = true;
    }

    /// Pins the service in the stopped state (once reached).
    pub fn pin_stop(&mut self, sid: ServiceId) {
        self.rec_mut(sid).pinned_stopped = true;
    }

    /// Removes both pins and re-evaluates the target state.
    pub fn unpin(&mut self, sid: ServiceId, rx: &mut Reactor) {
        if self.rec(sid).pinned_started {
            self.rec_mut(sid).pinned_started = false;
            let rec = self.rec(sid);
            if rec.target_state == ServiceState::Stopped || rec.force_stop {
                self.do_stop(sid, rx);
            }
        }
        if self.rec(sid).pinned_stopped {
            self.rec_mut(sid).pinned_stopped = false;
            if self.rec(sid).target_state == ServiceState::Started {
                self.start(sid, false);
            }
        }
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Sets or clears the trigger of a TriggeredInternal service.
    /// Returns false for other kinds.
    pub fn set_trigger(&mut self, sid: ServiceId, value: bool) -> bool {
        if self.rec(sid).kind() != ServiceKind::TriggeredInternal {
            return false;
        }
        self.rec_mut(sid).triggered = value;
        if value && self.rec(sid).state == ServiceState::Starting {
            self.add_transition_queue(sid);
        }
        true
    }

    // ------------------------------------------------------------------
    // Bring-up dispatch
    // ------------------------------------------------------------------

    /// Kind-specific bring-up. Returns false on immediate failure; on
    /// success the record will reach Started via `started()`, possibly
    /// asynchronously.
    fn bring_up(&mut self, sid: ServiceId, rx: &mut Reactor) -> bool {
        match self.rec(sid).kind() {
            ServiceKind::Internal => {
                self.started(sid, rx);
                true
            }
            ServiceKind::TriggeredInternal => {
                if self.rec(sid).triggered {
                    self.started(sid, rx);
                } else {
                    // Park in Starting until triggered; still counts as
                    // waiting so a stop can interrupt it.
                    self.rec_mut(sid).waiting_for_deps = true;
                    debug!("service {} waiting for trigger", self.rec(sid).name());
                }
                true
            }
            ServiceKind::Placeholder => false,
            ServiceKind::Process | ServiceKind::BgProcess | ServiceKind::Scripted => {
                self.proc_bring_up(sid, rx)
            }
        }
    }

    /// Kind-specific bring-down, called when all regular dependents
    /// have stopped.
    fn bring_down(&mut self, sid: ServiceId, rx: &mut Reactor) {
        self.rec_mut(sid).waiting_for_deps = false;
        match self.rec(sid).kind() {
            ServiceKind::Process | ServiceKind::BgProcess => {
                self.proc_bring_down(sid, rx);
            }
            ServiceKind::Scripted => {
                self.scripted_bring_down(sid, rx);
            }
            _ => self.stopped(sid, rx),
        }
    }

    // ------------------------------------------------------------------
    // Settings update (reload support)
    // ------------------------------------------------------------------

    /// Applies new settings to an existing record. A stopped record
    /// accepts any settings of the same kind (dependency relinking is
    /// the loader's job); a started record accepts only changes that do
    /// not affect the running process' identity.
    pub fn update_settings(
        &mut self,
        sid: ServiceId,
        settings: ServiceSettings,
    ) -> Result<(), LoadError> {
        let rec = self.rec(sid);
        let name = rec.name.clone();
        if rec.settings.kind != settings.kind {
            return Err(LoadError::Description {
                service: name,
                detail: "service type cannot change on reload".into(),
                line: None,
            });
        }
        match rec.state {
            ServiceState::Stopped => {
                let rec = self.rec_mut(sid);
                rec.proc = settings
                    .kind
                    .has_process()
                    .then(|| crate::service::ProcState::new(&settings));
                rec.settings = settings;
                Ok(())
            }
            ServiceState::Started => {
                if rec.settings.command != settings.command {
                    return Err(LoadError::Description {
                        service: name,
                        detail: "command cannot change while started".into(),
                        line: None,
                    });
                }
                let rec = self.rec_mut(sid);
                if let Some(proc) = rec.proc.as_mut() {
                    proc.update_policy(&settings);
                }
                rec.settings = settings;
                Ok(())
            }
            _ => Err(LoadError::Description {
                service: name,
                detail: "service is transitioning; try again later".into(),
                line: None,
            }),
        }
    }
}
