// src/server/process.rs
use crate::error::{Error, Result};
use crate::registry::ServerDefinition;
use async_process::{Child, Command, Stdio};
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures_lite::stream::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one process lifetime of a server.
///
/// A new `RunId` is minted on every spawn, so exit notifications and probe
/// results can be matched to the process they were about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A freshly spawned server process.
pub(crate) struct SpawnedProcess {
    pub pid: u32,
    pub child: Child,
}

/// Spawn the process described by `definition`.
///
/// stdin is closed; stdout and stderr are forwarded line by line to
/// `tracing` under the `server_output` target.
pub(crate) fn spawn(definition: &ServerDefinition) -> std::io::Result<SpawnedProcess> {
    let mut command = Command::new(&definition.command);
    command.args(&definition.args);

    for (key, value) in &definition.env {
        command.env(key, value);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        forward_output(definition.name.clone(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(definition.name.clone(), "stderr", stderr);
    }

    Ok(SpawnedProcess { pid, child })
}

fn forward_output<R>(server: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => tracing::info!(target: "server_output", server = %server, stream, "{}", line),
                Err(e) => {
                    tracing::debug!(server = %server, stream, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    });
}

/// Ask the process to exit (SIGTERM). A process that is already gone is not an error.
pub(crate) fn terminate(pid: u32) -> Result<()> {
    send_signal(pid, Signal::SIGTERM)
}

/// Kill the process outright (SIGKILL). A process that is already gone is not an error.
pub(crate) fn kill(pid: u32) -> Result<()> {
    send_signal(pid, Signal::SIGKILL)
}

/// Whether a process with this pid currently exists and has not exited.
///
/// An exited child that has not been reaped yet still accepts signal 0, so
/// zombies are filtered out where `/proc` is available.
pub(crate) fn is_alive(pid: u32) -> bool {
    match to_pid(pid) {
        Ok(raw) => signal::kill(raw, None).is_ok() && !is_zombie(pid),
        Err(_) => false,
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Format is "pid (comm) state ...", and comm may itself contain ')'.
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    match signal::kill(to_pid(pid)?, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Signal(format!(
            "Failed to send {} to pid {}: {}",
            sig.as_str(), pid, e
        ))),
    }
}

fn to_pid(pid: u32) -> Result<Pid> {
    let raw = i32::try_from(pid)
        .map_err(|_| Error::Signal(format!("Pid {} is out of range", pid)))?;
    if raw <= 0 {
        return Err(Error::Signal(format!("Refusing to signal pid {}", pid)));
    }
    Ok(Pid::from_raw(raw))
}
