//! Daemon driver: owns the reactor, the service set, the control
//! server and the loader, and dispatches reactor events until a
//! shutdown completes.

use std::io;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{error, info, warn};

use crate::control::{ControlServer, CtlCtx};
use crate::error::LoadError;
use crate::load::ServiceLoader;
use crate::proto::ShutdownType;
use crate::reactor::{Event, Reactor, TimerTag, WatchTag};
use crate::service::ServiceSet;

/// The assembled daemon.
pub struct Daemon {
    set: ServiceSet,
    reactor: Reactor,
    control: ControlServer,
    loader: Box<dyn ServiceLoader>,
    system_init: bool,
}

impl Daemon {
    /// Builds a daemon around the given loader. `system_init` selects
    /// the pid-1 signal semantics.
    pub fn new(loader: Box<dyn ServiceLoader>, system_init: bool) -> io::Result<Daemon> {
        Ok(Daemon {
            set: ServiceSet::new(),
            reactor: Reactor::new()?,
            control: ControlServer::new(),
            loader,
            system_init,
        })
    }

    /// The service set (for assembly and tests).
    pub fn set_mut(&mut self) -> &mut ServiceSet {
        &mut self.set
    }

    /// The reactor (for assembly and tests).
    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    /// The control server.
    pub fn control_mut(&mut self) -> &mut ControlServer {
        &mut self.control
    }

    /// Routes SIGINT/SIGTERM/SIGQUIT (and SIGCHLD internally) through
    /// the reactor.
    pub fn setup_signals(&mut self) -> io::Result<()> {
        self.reactor.watch_signals(&[
            Signal::SIGCHLD,
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGQUIT,
        ])
    }

    /// Opens the control socket at `path`.
    pub fn open_control_socket(&mut self, path: &std::path::Path) -> Result<(), crate::error::ControlError> {
        self.control
            .open_socket(path, self.system_init, &mut self.reactor)
    }

    /// Loads and activates a service by name.
    pub fn start_service_by_name(&mut self, name: &str) -> Result<(), LoadError> {
        let sid = self.loader.load(&mut self.set, name)?;
        self.set.start(sid, true);
        self.set.process_queues(&mut self.reactor);
        self.flush();
        Ok(())
    }

    /// The service set and reactor together (operations that mutate the
    /// graph need both).
    pub fn graph(&mut self) -> (&mut ServiceSet, &mut Reactor) {
        (&mut self.set, &mut self.reactor)
    }

    /// Runs one reactor cycle, dispatching whatever events arrive
    /// within `max_wait`.
    pub fn step(&mut self, max_wait: Duration) -> io::Result<()> {
        let events = self.reactor.poll(Some(max_wait))?;
        for ev in events {
            self.dispatch(ev);
            self.flush();
        }
        Ok(())
    }

    /// Drives the reactor until every service has stopped under an
    /// initiated shutdown; returns the chosen shutdown kind.
    pub fn run(&mut self) -> io::Result<ShutdownType> {
        loop {
            self.step(Duration::from_secs(60))?;
            if self.set.is_shutting_down() && self.set.active_count() == 0 {
                let kind = self.set.shutdown_type().unwrap_or(ShutdownType::Halt);
                info!("all services stopped; shutdown type {kind}");
                self.control.close_socket(&mut self.reactor);
                return Ok(kind);
            }
        }
    }

    fn dispatch(&mut self, ev: Event) {
        match ev {
            Event::ChildExited { sid, status, .. } => {
                if self.set.contains(sid) {
                    self.set.handle_child_exit(sid, status, &mut self.reactor);
                }
            }
            Event::Timer(TimerTag::Process(sid)) => {
                if self.set.contains(sid) {
                    self.set.handle_process_timer(sid, &mut self.reactor);
                }
            }
            Event::FdReady { tag, readable, writable } => match tag {
                WatchTag::ControlListener => {
                    self.control.accept_ready(&mut self.reactor);
                }
                WatchTag::ControlConn(id) => {
                    let mut ctx = CtlCtx {
                        set: &mut self.set,
                        rx: &mut self.reactor,
                        loader: self.loader.as_mut(),
                    };
                    self.control.conn_event(id, readable, writable, &mut ctx);
                }
                WatchTag::ExecStatus(sid) => {
                    if self.set.contains(sid) {
                        self.set.handle_exec_status(sid, &mut self.reactor);
                    }
                }
                WatchTag::Readiness(sid) => {
                    if self.set.contains(sid) {
                        self.set.handle_readiness(sid, &mut self.reactor);
                    }
                }
                WatchTag::LogOutput(sid) => {
                    if self.set.contains(sid) {
                        self.set.handle_log_output(sid, &mut self.reactor);
                    }
                }
            },
            Event::Signal(sig) => self.handle_signal(sig),
        }
    }

    /// Delivers emitted service events and adopts control-socket fds
    /// created for children.
    fn flush(&mut self) {
        loop {
            let events = self.set.take_events();
            let cs_fds = self.set.take_pending_control_fds();
            if events.is_empty() && cs_fds.is_empty() {
                break;
            }
            for fd in cs_fds {
                self.control.add_connection(fd, &mut self.reactor);
            }
            self.control
                .dispatch_events(events, &mut self.set, &mut self.reactor);
        }
    }

    fn handle_signal(&mut self, sig: Signal) {
        match sig {
            Signal::SIGINT => {
                if self.system_init {
                    warn!("SIGINT received; commencing reboot sequence");
                    self.set
                        .stop_all_services(ShutdownType::Reboot, &mut self.reactor);
                } else {
                    self.set
                        .stop_all_services(ShutdownType::Halt, &mut self.reactor);
                }
            }
            Signal::SIGTERM => {
                self.set
                    .stop_all_services(ShutdownType::Halt, &mut self.reactor);
            }
            Signal::SIGQUIT => {
                if self.system_init {
                    // Exec the external shutdown helper so that pid 1
                    // does not keep an inode open.
                    exec_shutdown_helper();
                    error!("could not exec shutdown helper");
                } else {
                    self.set
                        .stop_all_services(ShutdownType::Halt, &mut self.reactor);
                }
            }
            _ => {}
        }
    }
}

fn exec_shutdown_helper() {
    use std::ffi::CString;
    let Ok(helper) = CString::new(crate::constants::SHUTDOWN_HELPER_PATH) else {
        return;
    };
    let args = [helper.clone()];
    let _ = nix::unistd::execv(&helper, &args);
}
