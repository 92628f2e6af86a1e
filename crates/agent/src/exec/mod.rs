//! Process execution engine.
//!
//! Runs a program without a shell and streams its output over a session:
//! stdout lines as they arrive, then the stderr lines spooled to a scratch
//! file meanwhile. The child is killed and reaped if the peer goes away
//! first.

pub mod script;

use std::io::{self, SeekFrom};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use protocol::{TerminalStatus, EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::session::{ChannelError, Session, SessionReceiver, SessionSender};

pub use script::run_script;

/// Creates the commands the engine runs.
pub trait ProcessLauncher: Send + Sync {
    /// Build a command running `program` with `args`.
    fn command(&self, program: &str, args: &[String]) -> Command;
}

/// Launches programs directly on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut command = Command::new(program);
        command.args(args);
        command
    }
}

/// Run `program` with `args` and stream its output over the session.
pub async fn execute(
    session: &mut Session,
    launcher: &dyn ProcessLauncher,
    program: &str,
    args: &[String],
) -> TerminalStatus {
    let (sender, receiver) = session.halves();

    let mut command = launcher.command(program, args);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::info!(program = %program, args = ?args, "Executing command");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(program = %program, error = %e, "Failed to start command");
            let _ = sender
                .send_text(format!("failed to start {}: {}", program, e))
                .await;
            return spawn_failure_status(program, &e);
        }
    };

    let stdout = child.stdout.take();
    if stdout.is_none() {
        tracing::warn!("Command stdout pipe unavailable");
    }
    let stderr = child.stderr.take();
    if stderr.is_none() {
        tracing::warn!("Command stderr pipe unavailable");
    }

    let disconnected = CancellationToken::new();
    let finished = CancellationToken::new();

    let work = async {
        let outcome = tokio::join!(
            wait_or_kill(&mut child, &disconnected),
            relay_output(sender, stdout, stderr, &disconnected),
        );
        finished.cancel();
        outcome
    };
    let ((status, relayed), ()) =
        tokio::join!(work, watch_disconnect(receiver, &disconnected, &finished));

    if let Err(e) = relayed {
        tracing::debug!(error = %e, "Output relay stopped early");
    }

    match status {
        Ok(status) => {
            let status = exit_status(status);
            if !status.is_success() {
                tracing::warn!(program = %program, status = %status, "Command exited with non-zero status");
            }
            status
        }
        Err(e) => TerminalStatus::InternalError(format!("failed to wait for {}: {}", program, e)),
    }
}

/// Map a spawn failure to the status reported to the caller.
fn spawn_failure_status(program: &str, error: &io::Error) -> TerminalStatus {
    match error.kind() {
        io::ErrorKind::NotFound => TerminalStatus::Exited(EXIT_NOT_FOUND),
        io::ErrorKind::PermissionDenied => TerminalStatus::Exited(EXIT_NOT_EXECUTABLE),
        _ => TerminalStatus::InternalError(format!("failed to start {}: {}", program, error)),
    }
}

/// Normalize an OS exit status; signal deaths become `128 + signal`.
fn exit_status(status: ExitStatus) -> TerminalStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => TerminalStatus::from_exit_code(code),
        (None, Some(signal)) => TerminalStatus::from_signal(signal),
        (None, None) => TerminalStatus::from_exit_code(-1),
    }
}

async fn wait_or_kill(child: &mut Child, disconnected: &CancellationToken) -> io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        _ = disconnected.cancelled() => {
            tracing::info!(pid = ?child.id(), "Peer disconnected, killing process");
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Kill failed, process may have exited");
            }
            child.wait().await
        }
    }
}

/// Forward stdout lines as they arrive, then the stderr lines spooled
/// meanwhile.
async fn relay_output(
    sender: &mut SessionSender,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    disconnected: &CancellationToken,
) -> Result<(), ChannelError> {
    let forward_stdout = async {
        let Some(stdout) = stdout else {
            return Ok(());
        };
        let mut reader = BufReader::new(stdout);
        loop {
            let line = tokio::select! {
                line = next_line(&mut reader) => line,
                _ = disconnected.cancelled() => return Err(ChannelError::Closed),
            };
            let Some(line) = line else {
                return Ok(());
            };
            if let Err(e) = sender.send_line(line).await {
                disconnected.cancel();
                return Err(e);
            }
        }
    };
    let collect_stderr = async {
        match stderr {
            Some(stderr) => spool(stderr).await.map(Some),
            None => Ok(None),
        }
    };

    let (forwarded, spooled) = tokio::join!(forward_stdout, collect_stderr);
    forwarded?;

    let spooled = match spooled {
        Ok(Some(spooled)) => spooled,
        Ok(None) => return Ok(()),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to spool stderr");
            return Ok(());
        }
    };

    let mut reader = BufReader::new(spooled);
    while let Some(line) = next_line(&mut reader).await {
        if let Err(e) = sender.send_line(line).await {
            disconnected.cancel();
            return Err(e);
        }
    }
    Ok(())
}

/// Copy `reader` to an anonymous scratch file and rewind it.
///
/// The file is unlinked on creation, so dropping it frees the space.
async fn spool<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<File> {
    let mut file = File::from_std(tempfile::tempfile()?);
    let bytes = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    file.seek(SeekFrom::Start(0)).await?;
    tracing::debug!(bytes, "Spooled stderr");
    Ok(file)
}

/// Read one line without its `\n` or `\r\n` terminator. `None` at end of
/// stream or on a read error.
async fn next_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Option<Vec<u8>> {
    let mut line = Vec::new();
    match reader.read_until(b'\n', &mut line).await {
        Ok(0) => None,
        Ok(_) => {
            strip_line_ending(&mut line);
            Some(line)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Output read failed");
            None
        }
    }
}

fn strip_line_ending(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

/// Watch the inbound side of an output-only channel and signal when the
/// peer goes away. Stops once `finished` fires.
async fn watch_disconnect(
    receiver: &mut SessionReceiver,
    disconnected: &CancellationToken,
    finished: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = finished.cancelled() => return,
            message = receiver.recv() => match message {
                Ok(Some(_)) => tracing::debug!("Ignoring inbound message"),
                Ok(None) => {
                    tracing::debug!("Peer closed the channel");
                    disconnected.cancel();
                    return;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Channel read failed");
                    disconnected.cancel();
                    return;
                }
            },
        }
    }
}
