//! Service lifecycle log helpers and the console-log gate.
//!
//! The full two-stream log subsystem is an external collaborator; the
//! core logs through `tracing` and exposes a single gate that
//! suppresses console output while a foreground service owns the
//! console.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

static CONSOLE_LOG_ENABLED: AtomicBool = AtomicBool::new(true);

/// Enables or disables log output to the controlling terminal. Called
/// by the console arbiter when a service takes or releases the console.
pub fn enable_console_log(enabled: bool) {
    CONSOLE_LOG_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether console log output is currently allowed.
pub fn console_log_enabled() -> bool {
    CONSOLE_LOG_ENABLED.load(Ordering::Relaxed)
}

/// Stderr writer that drops output while a service holds the console.
/// Install via `tracing_subscriber`'s `with_writer`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GatedStderr;

impl Write for GatedStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if console_log_enabled() {
            io::stderr().write(buf)
        } else {
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for GatedStderr {
    type Writer = GatedStderr;

    fn make_writer(&'a self) -> Self::Writer {
        GatedStderr
    }
}

/// Logs a service start.
pub fn log_service_started(name: &str) {
    info!("service {name} started");
}

/// Logs a service stop.
pub fn log_service_stopped(name: &str) {
    info!("service {name} stopped");
}

/// Logs a failed service start.
pub fn log_service_failed(name: &str) {
    error!("service {name} failed to start");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_gate_round_trip() {
        enable_console_log(false);
        assert!(!console_log_enabled());
        enable_console_log(true);
        assert!(console_log_enabled());
    }
}
