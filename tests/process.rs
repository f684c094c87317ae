//! Process supervision, exercised with real children.
//!
//! Every test takes a shared lock: child reaping uses `waitpid(-1)`,
//! so two reactors in one test binary would steal each other's
//! children.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use ordinit::daemon::Daemon;
use ordinit::load::MemoryLoader;
use ordinit::proto::{ExecStage, ServiceState, ShutdownType, StoppedReason};
use ordinit::settings::{ServiceKind, ServiceSettings};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn drive_until<F>(daemon: &mut Daemon, total: Duration, mut cond: F) -> bool
where
    F: FnMut(&mut Daemon) -> bool,
{
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if cond(daemon) {
            return true;
        }
        daemon.step(Duration::from_millis(20)).unwrap();
    }
    cond(daemon)
}

fn state_of(daemon: &mut Daemon, name: &str) -> ServiceState {
    let sid = daemon.set_mut().find(name).unwrap();
    daemon.set_mut().rec(sid).state()
}

#[test]
fn process_service_starts_and_stops() {
    let _guard = serial();
    let mut loader = MemoryLoader::new();
    loader.insert(
        "sleeper",
        ServiceSettings {
            restart_delay: Duration::from_millis(1),
            ..ServiceSettings::process(["/bin/sleep", "30"])
        },
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("sleeper").unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "sleeper") == ServiceState::Started
    }));
    let sid = daemon.set_mut().find("sleeper").unwrap();
    let pid = daemon.set_mut().rec(sid).pid().expect("live pid");
    assert!(kill(pid, None).is_ok(), "service process not running");

    {
        let (set, rx) = daemon.graph();
        set.stop(sid, true, rx);
        set.forced_stop(sid);
        set.process_queues(rx);
    }
    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "sleeper") == ServiceState::Stopped
    }));
    assert_eq!(daemon.set_mut().active_count(), 0);
}

#[test]
fn scripted_service_uses_both_commands() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("stopped");
    let mut loader = MemoryLoader::new();
    loader.insert(
        "script",
        ServiceSettings {
            kind: ServiceKind::Scripted,
            command: vec!["/bin/sh".into(), "-c".into(), "exit 0".into()],
            stop_command: vec![
                "/bin/sh".into(),
                "-c".into(),
                format!("touch {}", marker.display()),
            ],
            ..ServiceSettings::default()
        },
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("script").unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "script") == ServiceState::Started
    }));

    let sid = daemon.set_mut().find("script").unwrap();
    {
        let (set, rx) = daemon.graph();
        set.stop(sid, true, rx);
        set.process_queues(rx);
    }
    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "script") == ServiceState::Stopped
    }));
    assert!(marker.exists(), "stop command did not run");
}

#[test]
fn smooth_recovery_relaunches_without_stopping() {
    let _guard = serial();
    let mut loader = MemoryLoader::new();
    loader.insert(
        "recover",
        ServiceSettings {
            smooth_recovery: true,
            auto_restart: true,
            restart_delay: Duration::from_millis(1),
            ..ServiceSettings::process(["/bin/sleep", "30"])
        },
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("recover").unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "recover") == ServiceState::Started
    }));
    let sid = daemon.set_mut().find("recover").unwrap();
    let first_pid = daemon.set_mut().rec(sid).pid().unwrap();

    kill(first_pid, Signal::SIGKILL).unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        let rec = d.set_mut().rec(sid);
        rec.pid().is_some_and(|p| p != first_pid)
    }));

    // The service never left the started state and nothing recorded a
    // stop.
    let rec = daemon.set_mut().rec(sid);
    assert_eq!(rec.state(), ServiceState::Started);
    assert_eq!(rec.stop_reason(), StoppedReason::Normal);

    let (set, rx) = daemon.graph();
    set.stop_all_services(ShutdownType::Halt, rx);
    drive_until(&mut daemon, Duration::from_secs(5), |d| {
        d.set_mut().active_count() == 0
    });
}

#[test]
fn crash_loop_hits_restart_limit() {
    let _guard = serial();
    let mut loader = MemoryLoader::new();
    loader.insert(
        "flappy",
        ServiceSettings {
            auto_restart: true,
            restart_delay: Duration::from_millis(1),
            restart_interval: Duration::from_secs(10),
            max_restart_count: 3,
            ..ServiceSettings::process(["/bin/true"])
        },
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("flappy").unwrap();

    // The process exits immediately each time; after the allowed
    // automatic restarts the service is stopped for good.
    assert!(drive_until(&mut daemon, Duration::from_secs(10), |d| {
        state_of(d, "flappy") == ServiceState::Stopped
    }));
    let sid = daemon.set_mut().find("flappy").unwrap();
    assert_eq!(daemon.set_mut().rec(sid).stop_reason(), StoppedReason::Terminated);
    assert_eq!(daemon.set_mut().active_count(), 0);
}

#[test]
fn bgprocess_adopts_pid_from_file() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("d.pid");
    let mut loader = MemoryLoader::new();
    loader.insert(
        "bg",
        ServiceSettings {
            kind: ServiceKind::BgProcess,
            command: vec![
                "/bin/sh".into(),
                "-c".into(),
                format!("sleep 30 & echo $! > {}", pid_file.display()),
            ],
            pid_file: Some(pid_file.clone()),
            ..ServiceSettings::default()
        },
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("bg").unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "bg") == ServiceState::Started
    }));

    let sid = daemon.set_mut().find("bg").unwrap();
    let recorded = daemon.set_mut().rec(sid).pid().expect("adopted pid");
    let file_pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(recorded.as_raw(), file_pid);
    assert!(kill(recorded, None).is_ok(), "daemonised process not running");

    {
        let (set, rx) = daemon.graph();
        set.stop(sid, true, rx);
        set.forced_stop(sid);
        set.process_queues(rx);
    }
    // The adopted process is not our child, so the stop completes as
    // soon as it has been signalled.
    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "bg") == ServiceState::Stopped
    }));
}

#[test]
fn bgprocess_empty_pid_file_fails_start() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("empty.pid");
    let mut loader = MemoryLoader::new();
    loader.insert(
        "bg-empty",
        ServiceSettings {
            kind: ServiceKind::BgProcess,
            command: vec![
                "/bin/sh".into(),
                "-c".into(),
                format!(": > {}", pid_file.display()),
            ],
            pid_file: Some(pid_file),
            ..ServiceSettings::default()
        },
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("bg-empty").unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "bg-empty") == ServiceState::Stopped
    }));
    let sid = daemon.set_mut().find("bg-empty").unwrap();
    assert_eq!(daemon.set_mut().rec(sid).stop_reason(), StoppedReason::Failed);
}

#[test]
fn exec_failure_is_reported_with_stage() {
    let _guard = serial();
    let mut loader = MemoryLoader::new();
    loader.insert(
        "noexec",
        ServiceSettings::process(["/nonexistent/binary/ordinit-test"]),
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("noexec").unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "noexec") == ServiceState::Stopped
    }));
    let sid = daemon.set_mut().find("noexec").unwrap();
    let rec = daemon.set_mut().rec(sid);
    assert_eq!(rec.stop_reason(), StoppedReason::ExecFailed);
    let err = rec.exec_err().expect("exec error recorded");
    assert_eq!(err.stage, ExecStage::DoExec);
    assert_eq!(err.errno, nix::errno::Errno::ENOENT);
}

#[test]
fn start_timeout_interrupts_stuck_startup() {
    let _guard = serial();
    let mut loader = MemoryLoader::new();
    loader.insert(
        "stuck",
        ServiceSettings {
            // Declares readiness notification but never notifies.
            notify_var: Some("READY_FD".into()),
            start_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            ..ServiceSettings::process(["/bin/sleep", "30"])
        },
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("stuck").unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(10), |d| {
        state_of(d, "stuck") == ServiceState::Stopped
    }));
    let sid = daemon.set_mut().find("stuck").unwrap();
    assert_eq!(daemon.set_mut().rec(sid).stop_reason(), StoppedReason::TimedOut);
    assert_eq!(daemon.set_mut().active_count(), 0);
}

#[test]
fn readiness_notification_completes_startup() {
    let _guard = serial();
    let mut loader = MemoryLoader::new();
    loader.insert(
        "notify",
        ServiceSettings {
            notify_var: Some("READY_FD".into()),
            ..ServiceSettings::process([
                "/bin/sh",
                "-c",
                r#"eval "echo ready >&$READY_FD"; exec sleep 30"#,
            ])
        },
    );
    let mut daemon = Daemon::new(Box::new(loader), false).unwrap();
    daemon.start_service_by_name("notify").unwrap();

    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "notify") == ServiceState::Started
    }));

    let sid = daemon.set_mut().find("notify").unwrap();
    {
        let (set, rx) = daemon.graph();
        set.stop(sid, true, rx);
        set.forced_stop(sid);
        set.process_queues(rx);
    }
    assert!(drive_until(&mut daemon, Duration::from_secs(5), |d| {
        state_of(d, "notify") == ServiceState::Stopped
    }));
}
