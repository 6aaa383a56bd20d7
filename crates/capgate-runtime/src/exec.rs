//! Running jobs inside the namespaces of a running process.

use std::collections::BTreeMap;

use capgate_common::error::{Error, Result};
use capgate_common::types::ContainerId;

/// Namespaces a job joins, as named under `/proc/<pid>/ns`.
pub const JOINED_NAMESPACES: [&str; 4] = ["net", "mnt", "uts", "ipc"];

/// Runs a shell command line in the container with exactly `env` as its
/// environment, and returns its exit status.
///
/// Uses `nsenter` to enter the target's mount, UTS, IPC, network and PID
/// namespaces.
///
/// # Errors
///
/// Returns an error if `nsenter` cannot be found or started.
#[cfg(target_os = "linux")]
pub fn run_command(
    container: &ContainerId,
    pid: u32,
    env: &BTreeMap<String, String>,
    command: &str,
) -> Result<i32> {
    tracing::info!(id = %container, pid, command, "exec into container");

    let nsenter = which::which("nsenter").map_err(|e| Error::Exec {
        container: container.clone(),
        message: format!("nsenter: {e}"),
    })?;
    let status = std::process::Command::new(&nsenter)
        .args([
            "--target",
            &pid.to_string(),
            "--mount",
            "--uts",
            "--ipc",
            "--net",
            "--pid",
            "--",
            "/bin/sh",
            "-c",
            command,
        ])
        .env_clear()
        .envs(env)
        .status()
        .map_err(|e| Error::io(&nsenter, e))?;
    Ok(exit_code(status))
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error. Namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn run_command(
    _container: &ContainerId,
    _pid: u32,
    _env: &BTreeMap<String, String>,
    _command: &str,
) -> Result<i32> {
    Err(Error::Unsupported {
        operation: "nsenter",
    })
}

/// Runs `job` in a forked child that joined the target's network, mount,
/// UTS and IPC namespaces, and returns the child's exit status.
///
/// The namespace files are opened before forking so that a missing
/// process fails here rather than in the child.
///
/// # Errors
///
/// Returns an error if a namespace file cannot be opened, or if `fork(2)`
/// or `waitpid(2)` fails.
#[cfg(target_os = "linux")]
pub fn run_function(pid: u32, job: Box<dyn FnOnce() -> i32 + Send>) -> Result<i32> {
    use nix::sched::{CloneFlags, setns};
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    let mut namespaces = Vec::with_capacity(JOINED_NAMESPACES.len());
    for name in JOINED_NAMESPACES {
        let path = format!("/proc/{pid}/ns/{name}");
        let file = std::fs::File::open(&path).map_err(|e| Error::io(&path, e))?;
        namespaces.push(file);
    }

    // SAFETY: the child only calls setns, runs the job, and leaves through
    // _exit without returning into the parent's stack.
    match unsafe { fork() }.map_err(|e| Error::io("fork", e.into()))? {
        ForkResult::Child => {
            let joined = namespaces
                .iter()
                .all(|ns| setns(ns, CloneFlags::empty()).is_ok());
            let code = if joined { job() } else { 127 };
            // SAFETY: _exit skips atexit handlers and destructors shared
            // with the parent.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            drop(namespaces);
            tracing::debug!(pid, child = child.as_raw(), "function job started");
            match waitpid(child, None).map_err(|e| Error::io("waitpid", e.into()))? {
                WaitStatus::Exited(_, code) => Ok(code),
                WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
                other => {
                    tracing::warn!(status = ?other, "unexpected job status");
                    Ok(-1)
                }
            }
        }
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error. Namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn run_function(_pid: u32, _job: Box<dyn FnOnce() -> i32 + Send>) -> Result<i32> {
    Err(Error::Unsupported { operation: "setns" })
}

#[cfg(target_os = "linux")]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}
