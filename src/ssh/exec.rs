//! Remote command execution.
//!
//! Commands run non-interactively; stdout and stderr are captured as one
//! combined stream in arrival order.

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Sig};

use crate::error::{FleetError, Result};
use crate::ssh::client::ClientHandler;

/// Combined output of a remote process plus how it ended.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Interleaved stdout and stderr.
    pub output: String,

    /// Why the process counts as failed, if it does.
    pub error: Option<String>,
}

impl CommandOutput {
    /// Render as log text: output and error, each newline-terminated when present.
    pub fn into_log(self) -> String {
        compose_log(&self.output, self.error.as_deref())
    }
}

/// Build the log text for one command.
pub fn compose_log(output: &str, error: Option<&str>) -> String {
    let mut log = String::new();

    if !output.is_empty() {
        log.push_str(output);
        log.push('\n');
    }
    if let Some(error) = error {
        log.push_str(error);
        log.push('\n');
    }

    log
}

/// Execute a command on the remote host and fold its result into log text.
///
/// Only a failure to open the session or send the request is an `Err`; a
/// failing command is reported in the returned text.
pub async fn exec_command(session: &Handle<ClientHandler>, command: &str) -> Result<String> {
    let mut channel = open_session(session).await?;

    if let Err(e) = channel.exec(true, command.as_bytes()).await {
        let _ = channel.close().await;
        return Err(FleetError::Exec(format!("Failed to execute command: {}", e)));
    }

    let output = drain_output(&mut channel).await;
    let _ = channel.close().await;

    if let Some(error) = &output.error {
        tracing::debug!("Command `{}` failed: {}", command, error);
    }

    Ok(output.into_log())
}

pub(crate) async fn open_session(session: &Handle<ClientHandler>) -> Result<Channel<Msg>> {
    session
        .channel_open_session()
        .await
        .map_err(|e| FleetError::Session(format!("Failed to open channel: {}", e)))
}

/// Read a channel until the server closes it.
pub(crate) async fn drain_output(channel: &mut Channel<Msg>) -> CommandOutput {
    let mut output = Vec::new();
    let mut exit = ExitState::Missing;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                output.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExtendedData { data, .. }) => {
                output.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit = ExitState::Status(exit_status);
            }
            Some(ChannelMsg::ExitSignal {
                signal_name,
                error_message,
                ..
            }) => {
                exit = ExitState::Signal(signal_label(&signal_name), error_message);
            }
            // Exit status may still follow EOF
            Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }

    CommandOutput {
        output: String::from_utf8_lossy(&output).into_owned(),
        error: exit.into_error(),
    }
}

/// Bare signal name as sent on the wire, e.g. `TERM` or `XCPU`.
fn signal_label(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

enum ExitState {
    Missing,
    Status(u32),
    Signal(String, String),
}

impl ExitState {
    fn into_error(self) -> Option<String> {
        match self {
            ExitState::Status(0) => None,
            ExitState::Status(code) => Some(format!("Process exited with status {}", code)),
            ExitState::Signal(name, reason) if reason.is_empty() => {
                Some(format!("Process exited from signal {}", name))
            }
            ExitState::Signal(name, reason) => Some(format!(
                "Process exited from signal {}. Reason was: {}",
                name, reason
            )),
            ExitState::Missing => Some(
                "wait: remote command exited without exit status or exit signal".to_string(),
            ),
        }
    }
}
