//! Interactive pseudo-terminal bridge.
//!
//! Attaches a program to a PTY and relays bytes both ways between the PTY
//! and a [`Session`]. Blocking PTY reads and writes run on two dedicated
//! threads connected to the async side by bounded channels; a blocking
//! waiter reaps the program so its exit ends the bridge even while a
//! descendant keeps the terminal open.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use protocol::{TerminalStatus, EXIT_NOT_FOUND};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use super::{Session, SessionReceiver, SessionSender};

/// Initial terminal width.
pub const DEFAULT_COLS: u16 = 80;

/// Initial terminal height.
pub const DEFAULT_ROWS: u16 = 24;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 1024;

/// Capacity of the channels between the PTY threads and the session.
const RELAY_CAPACITY: usize = 64;

/// How long the reader thread waits for output before checking whether the
/// bridge is gone.
const READ_POLL_MS: u16 = 100;

/// How long output written just before exit is still forwarded.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// How long a hung-up program gets before it is killed outright.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Errors that can occur while running a PTY.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The program is not on `PATH`.
    #[error("{0}: command not found")]
    NotFound(String),

    /// Failed to allocate the PTY or start the program.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to wait for the program.
    #[error("failed to wait for PTY process: {0}")]
    WaitFailed(String),
}

type SharedMaster = Mutex<Box<dyn MasterPty + Send>>;

type WaitHandle = tokio::task::JoinHandle<std::io::Result<ExitStatus>>;

/// A program running on a freshly allocated PTY.
pub struct PtyProcess {
    master: SharedMaster,
    child: Box<dyn Child + Send + Sync>,
    terminal: File,
    writer: Box<dyn Write + Send>,
    pid: Option<u32>,
}

/// Look up `entrypoint` the way a shell would.
pub fn resolve_entrypoint(entrypoint: &str) -> Result<PathBuf, PtyError> {
    which::which(entrypoint).map_err(|_| PtyError::NotFound(entrypoint.to_string()))
}

impl PtyProcess {
    /// Spawns `program` on a new PTY of the given size.
    ///
    /// The program inherits the agent's environment and working directory.
    pub fn spawn(program: &Path, cols: u16, rows: u16) -> Result<Self, PtyError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        if let Ok(dir) = std::env::current_dir() {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let terminal = clone_terminal(pair.master.as_ref())?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let pid = child.process_id();

        Ok(Self {
            master: Mutex::new(pair.master),
            child,
            terminal,
            writer,
            pid,
        })
    }

    /// Returns the process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resizes the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        resize_master(&self.master, cols, rows)
    }
}

/// Duplicate the master side into a file the reader thread owns outright.
fn clone_terminal(master: &(dyn MasterPty + Send)) -> Result<File, PtyError> {
    let fd = master
        .as_raw_fd()
        .ok_or_else(|| PtyError::SpawnFailed("PTY has no file descriptor".to_string()))?;
    // SAFETY: `fd` belongs to `master`, which is alive for this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let owned = fd
        .try_clone_to_owned()
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    Ok(File::from(owned))
}

fn resize_master(master: &SharedMaster, cols: u16, rows: u16) -> Result<(), PtyError> {
    let master = master
        .lock()
        .map_err(|_| PtyError::ResizeFailed("PTY handle lock poisoned".to_string()))?;
    master
        .resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| PtyError::ResizeFailed(e.to_string()))
}

/// Attach `entrypoint` to a PTY and bridge it to the session until the
/// program exits or either relay ends.
pub async fn attach_interactive(session: &mut Session, entrypoint: &str) -> TerminalStatus {
    let (sender, receiver) = session.halves();

    let program = match resolve_entrypoint(entrypoint) {
        Ok(program) => program,
        Err(e) => {
            tracing::warn!(entrypoint = %entrypoint, "Entrypoint not found");
            let _ = sender.send_text(e.to_string()).await;
            return TerminalStatus::Exited(EXIT_NOT_FOUND);
        }
    };

    let process = match PtyProcess::spawn(&program, DEFAULT_COLS, DEFAULT_ROWS) {
        Ok(process) => process,
        Err(e) => {
            tracing::error!(entrypoint = %entrypoint, error = %e, "Failed to start PTY");
            let _ = sender.send_text(e.to_string()).await;
            return TerminalStatus::InternalError(e.to_string());
        }
    };
    tracing::info!(entrypoint = %entrypoint, pid = ?process.pid(), "PTY attached");

    let PtyProcess {
        master,
        child,
        terminal,
        writer,
        pid,
    } = process;

    let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(RELAY_CAPACITY);
    let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(RELAY_CAPACITY);
    spawn_writer_thread(writer, input_rx);
    spawn_reader_thread(terminal, output_tx);

    let mut killer = child.clone_killer();
    let mut exited = reap(child);

    let waited = tokio::select! {
        _ = relay_input(receiver, input_tx) => {
            tracing::debug!("Input relay finished");
            None
        }
        _ = relay_output(sender, &mut output_rx) => {
            tracing::debug!("Output relay finished");
            None
        }
        _ = relay_resizes(&master) => None,
        waited = &mut exited => {
            tracing::debug!("PTY process exited");
            Some(waited)
        }
    };

    let waited = match waited {
        Some(waited) => {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, relay_output(sender, &mut output_rx))
                .await;
            waited
        }
        None => terminate(killer.as_mut(), pid, &mut exited).await,
    };
    // Closing the relay stops the reader thread and releases its descriptor.
    drop(output_rx);

    let status = match waited {
        Ok(Ok(status)) => TerminalStatus::Exited(u8::try_from(status.exit_code()).unwrap_or(u8::MAX)),
        Ok(Err(e)) => TerminalStatus::InternalError(PtyError::WaitFailed(e.to_string()).to_string()),
        Err(e) => TerminalStatus::InternalError(format!("PTY wait task failed: {}", e)),
    };
    tracing::info!(status = %status, "PTY process finished");
    status
}

/// Wait for the program on a blocking thread.
fn reap(mut child: Box<dyn Child + Send + Sync>) -> WaitHandle {
    tokio::task::spawn_blocking(move || child.wait())
}

/// Hang up the program, then kill it if it is still running after
/// [`KILL_GRACE`], and return its reaped status.
async fn terminate(
    killer: &mut (dyn ChildKiller + Send + Sync),
    pid: Option<u32>,
    exited: &mut WaitHandle,
) -> Result<std::io::Result<ExitStatus>, tokio::task::JoinError> {
    if let Err(e) = killer.kill() {
        tracing::debug!(error = %e, "Hangup failed, process may have exited");
    }

    match tokio::time::timeout(KILL_GRACE, &mut *exited).await {
        Ok(waited) => waited,
        Err(_) => {
            tracing::warn!(pid = ?pid, "PTY process ignored hangup, killing");
            if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    tracing::debug!(error = %e, "Kill failed");
                }
            }
            exited.await
        }
    }
}

/// Read the terminal until it closes or the output relay is dropped.
///
/// Polls with a timeout so the thread notices a dropped relay even while a
/// descendant keeps the terminal open and silent.
fn spawn_reader_thread(mut terminal: File, output_tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        while !output_tx.is_closed() {
            let ready = {
                let mut fds = [PollFd::new(terminal.as_fd(), PollFlags::POLLIN)];
                poll(&mut fds, PollTimeout::from(READ_POLL_MS))
            };
            match ready {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "PTY poll failed");
                    break;
                }
            }

            match terminal.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO once the last slave handle is gone.
                    tracing::debug!(error = %e, "PTY read ended");
                    break;
                }
            }
        }
    })
}

fn spawn_writer_thread(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                tracing::debug!(error = %e, "PTY write failed");
                break;
            }
        }
    });
}

async fn relay_input(receiver: &mut SessionReceiver, input_tx: mpsc::Sender<Vec<u8>>) {
    loop {
        match receiver.recv().await {
            Ok(Some(data)) => {
                if input_tx.send(data).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Channel read failed");
                break;
            }
        }
    }
}

async fn relay_output(sender: &mut SessionSender, output_rx: &mut mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = output_rx.recv().await {
        if let Err(e) = sender.send_binary(chunk).await {
            tracing::debug!(error = %e, "Channel write failed");
            break;
        }
    }
}

/// Apply the agent's own terminal size once, then on every SIGWINCH.
///
/// Never completes; the bridge drops it at teardown.
async fn relay_resizes(master: &SharedMaster) {
    match signal(SignalKind::window_change()) {
        Ok(mut winch) => loop {
            apply_host_size(master);
            if winch.recv().await.is_none() {
                break;
            }
        },
        Err(e) => tracing::debug!(error = %e, "Window size notifications unavailable"),
    }
    std::future::pending::<()>().await
}

fn apply_host_size(master: &SharedMaster) {
    // Fails when the agent has no controlling terminal.
    let Ok((cols, rows)) = crossterm::terminal::size() else {
        return;
    };
    match resize_master(master, cols, rows) {
        Ok(()) => tracing::debug!(cols, rows, "Resized PTY"),
        Err(e) => tracing::warn!(error = %e, "Failed to resize PTY"),
    }
}
