//! Pid file handling and stopping a running scheduler.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

const TERM_RETRIES: usize = 10;
const TERM_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum StopError {
    #[error("reading pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pid file {0} does not hold a process id")]
    InvalidPid(PathBuf),
    #[error("not permitted to signal process {0}")]
    Permission(i32),
    #[error("signalling process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Terminated,
    Killed,
}

pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

pub fn remove_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed pid file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove pid file"),
    }
}

/// `None` when there is no pid file.
pub fn read_pid_file(path: &Path) -> Result<Option<i32>, StopError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StopError::PidFile {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match text.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => Err(StopError::InvalidPid(path.to_path_buf())),
    }
}

/// Send `sig` to `pid`. `Ok(false)` means no such process.
fn send(pid: i32, sig: libc::c_int) -> Result<bool, StopError> {
    let result = unsafe { libc::kill(pid, sig) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => Err(StopError::Permission(pid)),
        _ => Err(StopError::Signal { pid, source: err }),
    }
}

fn alive(pid: i32) -> Result<bool, StopError> {
    send(pid, 0)
}

/// Stop the process recorded in `pid_path`.
///
/// SIGTERM is repeated every 250ms, up to ten times, while the process
/// lives; SIGKILL follows. `kill` skips straight to SIGKILL.
pub async fn stop(pid_path: &Path, kill: bool) -> Result<StopOutcome, StopError> {
    let Some(pid) = read_pid_file(pid_path)? else {
        info!(path = %pid_path.display(), "no pid file, nothing to stop");
        return Ok(StopOutcome::NotRunning);
    };
    let outcome = stop_pid(pid, kill).await?;
    if outcome == StopOutcome::NotRunning {
        remove_pid_file(pid_path);
    }
    Ok(outcome)
}

pub async fn stop_pid(pid: i32, kill: bool) -> Result<StopOutcome, StopError> {
    if !kill {
        if !send(pid, libc::SIGTERM)? {
            return Ok(StopOutcome::NotRunning);
        }
        for _ in 0..TERM_RETRIES {
            tokio::time::sleep(TERM_INTERVAL).await;
            if !alive(pid)? {
                info!(pid, "process terminated");
                return Ok(StopOutcome::Terminated);
            }
            send(pid, libc::SIGTERM)?;
        }
        warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    }
    if !send(pid, libc::SIGKILL)? {
        return Ok(if kill {
            StopOutcome::NotRunning
        } else {
            StopOutcome::Terminated
        });
    }
    info!(pid, "process killed");
    Ok(StopOutcome::Killed)
}
