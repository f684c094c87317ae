use std::error::Error;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ordinit::daemon::Daemon;
use ordinit::load::MemoryLoader;
use ordinit::logging::GatedStderr;
use ordinit::proto::ShutdownType;
use ordinit::runtime::{self, RuntimeMode};
use ordinit::settings::ServiceSettings;

/// Dependency-managing service supervisor and init.
#[derive(Debug, Parser)]
#[command(name = "ordinit", version, about)]
struct Args {
    /// Run as the system service manager.
    #[arg(long, short = 's')]
    system: bool,

    /// Path to the control socket.
    #[arg(long, short = 'p', value_name = "PATH")]
    socket_path: Option<String>,

    /// Log level filter (overrides RUST_LOG).
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Services to activate at startup.
    services: Vec<String>,
}

fn init_logging(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(GatedStderr)
        .try_init();
}

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args);

    let is_pid1 = std::process::id() == 1;
    let system_init = args.system || is_pid1;
    let mode = if system_init { RuntimeMode::System } else { RuntimeMode::User };

    // Terminal access control signals: never allow the manager to be
    // suspended by writing to a terminal another process owns.
    unsafe {
        libc::signal(libc::SIGTSTP, libc::SIG_IGN);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
    }

    // The description parser is an external collaborator; it populates
    // the loader with resolved settings. A bare daemon still carries a
    // boot target so the system instance comes up coherently.
    let mut loader = MemoryLoader::new();
    loader.insert("boot", ServiceSettings::internal());

    let mut daemon = Daemon::new(Box::new(loader), system_init)?;
    daemon.setup_signals()?;

    let socket_path = runtime::control_socket_path(mode, args.socket_path.as_deref())
        .ok_or("no usable control socket path")?;
    if let Err(err) = daemon.open_control_socket(&socket_path) {
        if system_init {
            // A read-only filesystem at boot is survivable; the socket
            // can be opened later once / is remounted.
            warn!("could not open control socket: {err}");
        } else {
            return Err(err.into());
        }
    }

    let mut to_start = args.services.clone();
    if to_start.is_empty() {
        to_start.push("boot".to_owned());
    }
    for name in &to_start {
        if let Err(err) = daemon.start_service_by_name(name) {
            error!("cannot start service '{name}': {err}");
        }
    }

    loop {
        let kind = daemon.run()?;
        if !is_pid1 {
            info!("exiting ({kind})");
            return Ok(ExitCode::SUCCESS);
        }
        match kind {
            ShutdownType::Remain => {
                // Hand-back from single-user operation: resume service
                // management.
                daemon.set_mut().reset_shutdown();
                for name in &to_start {
                    if let Err(err) = daemon.start_service_by_name(name) {
                        error!("cannot start service '{name}': {err}");
                    }
                }
            }
            kind => {
                // Pid 1 must not exit: hand off to the external
                // shutdown machinery for the final reboot/halt/poweroff
                // syscall.
                info!("handing off for {kind}");
                hand_off_shutdown();
                // If the hand-off failed there is nothing left but to
                // keep reaping.
                error!("shutdown hand-off failed; continuing to reap children");
                daemon.set_mut().reset_shutdown();
            }
        }
    }
}

fn hand_off_shutdown() {
    use std::ffi::CString;
    if let Ok(helper) = CString::new(ordinit::constants::SHUTDOWN_HELPER_PATH) {
        let args = [helper.clone()];
        let _ = nix::unistd::execv(&helper, &args);
    }
}
