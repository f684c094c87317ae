//! Child-side process setup.
//!
//! Runs in the forked child between `fork` and `execvp`: file
//! descriptor shuffling, activation-socket placement, environment
//! setup, working directory, stdio, session and console handling, and
//! privilege dropping. On any failure the failing stage and errno are
//! written to the exec-status pipe and the child exits with status 0;
//! the parent distinguishes success (pipe EOF via CLOEXEC) from
//! failure (payload).
//!
//! The daemon is single-threaded, so allocating after fork is safe
//! here; raw libc calls are still used for the signal- and
//! fd-sensitive steps.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;

use nix::unistd::{Gid, Uid};

use crate::constants::{
    ACTIVATION_SOCKET_FD, ENV_CONTROL_SOCKET_FD, ENV_LISTEN_FDS, ENV_LISTEN_PID,
};
use crate::proto::ExecStage;

/// Parameters for executing a service process.
pub struct RunParams<'a> {
    /// Program and arguments; `args[0]` is the executable.
    pub args: &'a [CString],
    /// Working directory, if configured.
    pub working_dir: Option<&'a Path>,
    /// `NAME=value` environment file, if configured.
    pub env_file: Option<&'a Path>,
    /// Log file for stdout/stderr (LogType::Logfile).
    pub logfile: Option<&'a Path>,
    /// Whether the child uses the console for its stdio.
    pub on_console: bool,
    /// If on the console: whether the child runs as the foreground job.
    pub in_foreground: bool,
    /// Write end of the exec-status pipe.
    pub exec_status_fd: RawFd,
    /// Control-socket fd for the child, if passed.
    pub cs_fd: Option<RawFd>,
    /// Pre-opened activation socket, if configured.
    pub socket_fd: Option<RawFd>,
    /// Write end of the readiness pipe, if configured.
    pub notify_fd: Option<RawFd>,
    /// Fixed fd number the readiness fd must be moved to.
    pub force_notify_fd: Option<i32>,
    /// Environment variable receiving the readiness fd number.
    pub notify_var: Option<&'a str>,
    /// Write end of the output-capture pipe, if configured.
    pub output_fd: Option<RawFd>,
    /// Uid to run as.
    pub uid: Option<Uid>,
    /// Gid to run as.
    pub gid: Option<Gid>,
    /// Leave SIGINT unmasked even on the console.
    pub unmask_sigint: bool,
}

fn fail(wpipefd: RawFd, stage: ExecStage) -> ! {
    let errno = unsafe { *libc::__errno_location() };
    let mut buf = [0u8; 6];
    buf[..2].copy_from_slice(&(stage as u16).to_le_bytes());
    buf[2..].copy_from_slice(&errno.to_le_bytes());
    unsafe {
        libc::write(wpipefd, buf.as_ptr() as *const libc::c_void, buf.len());
        libc::_exit(0);
    }
}

fn setenv_c(name: &str, value: &str) -> Result<(), ()> {
    let name = CString::new(name).map_err(|_| ())?;
    let value = CString::new(value).map_err(|_| ())?;
    let r = unsafe { libc::setenv(name.as_ptr(), value.as_ptr(), 1) };
    if r == 0 { Ok(()) } else { Err(()) }
}

fn path_cstring(path: &Path) -> Result<CString, ()> {
    CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| ())
}

/// Executes the service process; never returns.
pub fn run_child_proc(params: &RunParams<'_>) -> ! {
    let mut wpipefd = params.exec_status_fd;

    // If the console has no session leader yet we must become one, or
    // control inputs such as ^C will have no effect.
    let do_set_ctty = unsafe { libc::tcgetsid(0) } == -1;

    // Block everything while fds are shuffled, then restore a mask with
    // the job-control signals unblocked before exec.
    let mut all_set: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut restore_set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigfillset(&mut all_set);
        libc::sigprocmask(libc::SIG_SETMASK, &all_set, &mut restore_set);
        libc::sigdelset(&mut restore_set, libc::SIGCHLD);
        libc::sigdelset(&mut restore_set, libc::SIGTERM);
        libc::sigdelset(&mut restore_set, libc::SIGQUIT);
        if !params.on_console || params.unmask_sigint {
            libc::sigdelset(&mut restore_set, libc::SIGINT);
        }
    }

    // ---- arrange file descriptors -------------------------------------
    let minfd: RawFd = if params.socket_fd.is_some() {
        ACTIVATION_SOCKET_FD + 1
    } else {
        ACTIVATION_SOCKET_FD
    };

    if wpipefd < minfd {
        wpipefd = unsafe { libc::fcntl(wpipefd, libc::F_DUPFD_CLOEXEC, minfd) };
        if wpipefd == -1 {
            unsafe { libc::_exit(0) };
        }
    }

    let mut cs_fd = params.cs_fd;
    if let Some(fd) = cs_fd {
        if fd < minfd {
            let moved = unsafe { libc::fcntl(fd, libc::F_DUPFD, minfd) };
            if moved == -1 {
                fail(wpipefd, ExecStage::ArrangeFds);
            }
            cs_fd = Some(moved);
        }
    }

    let mut notify_fd = params.notify_fd;
    if let Some(fd) = notify_fd {
        if fd < minfd {
            let moved = unsafe { libc::fcntl(fd, libc::F_DUPFD, minfd) };
            if moved == -1 {
                fail(wpipefd, ExecStage::ArrangeFds);
            }
            notify_fd = Some(moved);
        }
    }

    // ---- activation socket at its fixed fd ----------------------------
    if let Some(sfd) = params.socket_fd {
        unsafe {
            if libc::dup2(sfd, ACTIVATION_SOCKET_FD) == -1 {
                fail(wpipefd, ExecStage::SetupActivationSocket);
            }
            if sfd != ACTIVATION_SOCKET_FD {
                libc::close(sfd);
            }
        }
        if setenv_c(ENV_LISTEN_FDS, "1").is_err() {
            fail(wpipefd, ExecStage::SetupActivationSocket);
        }
        let pid = unsafe { libc::getpid() };
        if setenv_c(ENV_LISTEN_PID, &pid.to_string()).is_err() {
            fail(wpipefd, ExecStage::SetupActivationSocket);
        }
    }

    // ---- control socket ------------------------------------------------
    if let Some(fd) = cs_fd {
        if setenv_c(ENV_CONTROL_SOCKET_FD, &fd.to_string()).is_err() {
            fail(wpipefd, ExecStage::SetupControlSocket);
        }
    }

    // ---- readiness fd ---------------------------------------------------
    if let Some(nfd) = notify_fd {
        let final_fd = match params.force_notify_fd {
            Some(forced) if forced != nfd => {
                unsafe {
                    if libc::dup2(nfd, forced) == -1 {
                        fail(wpipefd, ExecStage::SetNotifyFdVar);
                    }
                    libc::close(nfd);
                }
                forced
            }
            _ => nfd,
        };
        if let Some(var) = params.notify_var {
            if setenv_c(var, &final_fd.to_string()).is_err() {
                fail(wpipefd, ExecStage::SetNotifyFdVar);
            }
        }
    }

    // ---- environment file -----------------------------------------------
    if let Some(env_file) = params.env_file {
        match std::fs::read_to_string(env_file) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((name, value)) = line.split_once('=') {
                        if setenv_c(name.trim(), value).is_err() {
                            fail(wpipefd, ExecStage::ReadEnvFile);
                        }
                    }
                }
            }
            Err(_) => fail(wpipefd, ExecStage::ReadEnvFile),
        }
    }

    // ---- working directory ----------------------------------------------
    if let Some(dir) = params.working_dir {
        let Ok(cdir) = path_cstring(dir) else {
            fail(wpipefd, ExecStage::ChangeDir);
        };
        if unsafe { libc::chdir(cdir.as_ptr()) } != 0 {
            fail(wpipefd, ExecStage::ChangeDir);
        }
    }

    // ---- stdio and session ----------------------------------------------
    if !params.on_console {
        unsafe {
            libc::close(0);
            libc::close(1);
            libc::close(2);
            let devnull = CString::new("/dev/null").unwrap();
            if libc::open(devnull.as_ptr(), libc::O_RDONLY) != 0 {
                fail(wpipefd, ExecStage::SetupStdInOutErr);
            }
            match params.output_fd {
                Some(ofd) => {
                    if libc::dup2(ofd, 1) != 1 || libc::dup2(ofd, 2) != 2 {
                        fail(wpipefd, ExecStage::SetupStdInOutErr);
                    }
                }
                None => {
                    let logpath = match params.logfile {
                        Some(p) => match path_cstring(p) {
                            Ok(c) => c,
                            Err(_) => fail(wpipefd, ExecStage::SetupStdInOutErr),
                        },
                        None => devnull.clone(),
                    };
                    if libc::open(
                        logpath.as_ptr(),
                        libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
                        (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                    ) != 1
                    {
                        fail(wpipefd, ExecStage::SetupStdInOutErr);
                    }
                    if libc::dup2(1, 2) != 2 {
                        fail(wpipefd, ExecStage::SetupStdInOutErr);
                    }
                }
            }
            // A new session lets the service be signalled as a process
            // group without tying it to our controlling terminal.
            libc::setsid();
        }
    } else {
        unsafe {
            if do_set_ctty {
                // Disable suspend (^Z), become session leader and claim
                // the terminal.
                libc::signal(libc::SIGTSTP, libc::SIG_IGN);
                libc::setsid();
                libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0);
            }
            libc::setpgid(0, 0);
            if params.in_foreground {
                libc::tcsetpgrp(0, libc::getpgrp());
            }
        }
    }

    // ---- uid / gid --------------------------------------------------------
    if let Some(gid) = params.gid {
        if unsafe { libc::setgid(gid.as_raw()) } != 0 {
            fail(wpipefd, ExecStage::SetUidGid);
        }
    }
    if let Some(uid) = params.uid {
        if unsafe { libc::setuid(uid.as_raw()) } != 0 {
            fail(wpipefd, ExecStage::SetUidGid);
        }
    }

    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, &restore_set, std::ptr::null_mut());
    }

    // ---- exec -------------------------------------------------------------
    let mut argv: Vec<*const libc::c_char> =
        params.args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    unsafe {
        libc::execvp(argv[0], argv.as_ptr());
    }
    fail(wpipefd, ExecStage::DoExec);
}
