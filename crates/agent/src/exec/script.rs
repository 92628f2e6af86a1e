//! Script channel: receive a script body, then run it with an interpreter.

use protocol::TerminalStatus;

use super::{execute, ProcessLauncher};
use crate::session::Session;

/// Prefix of scratch files holding received scripts.
const SCRIPT_PREFIX: &str = "script_";

/// Receive a script into a scratch file and run
/// `interpreter + [scratch path] + args`.
///
/// The scratch file is removed when this returns.
pub async fn run_script(
    session: &mut Session,
    launcher: &dyn ProcessLauncher,
    interpreter: &[String],
    args: &[String],
) -> TerminalStatus {
    let Some((program, prefix)) = interpreter.split_first() else {
        return TerminalStatus::InternalError("no interpreter configured".to_string());
    };

    if args.is_empty() {
        tracing::debug!("Script requested without args");
        if let Err(e) = session
            .sender()
            .send_text("No args specified, running script without arguments")
            .await
        {
            tracing::debug!(error = %e, "Failed to send warning");
        }
    }

    let scratch = match tempfile::Builder::new().prefix(SCRIPT_PREFIX).tempfile() {
        Ok(scratch) => scratch,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create script file");
            return TerminalStatus::InternalError(format!("failed to create script file: {}", e));
        }
    };

    let file = match scratch.reopen() {
        Ok(file) => file,
        Err(e) => {
            return TerminalStatus::InternalError(format!("failed to open script file: {}", e));
        }
    };
    let mut file = tokio::fs::File::from_std(file);

    match session.receiver().copy_payload_to(&mut file).await {
        Ok(bytes) => tracing::debug!(bytes, path = ?scratch.path(), "Script received"),
        Err(e) => {
            tracing::warn!(error = %e, "Script transfer failed");
            return TerminalStatus::InternalError(e.to_string());
        }
    }
    drop(file);

    let mut argv = prefix.to_vec();
    argv.push(scratch.path().to_string_lossy().into_owned());
    argv.extend_from_slice(args);

    execute(session, launcher, program, &argv).await
}
