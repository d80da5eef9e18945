//! Extensions for running external commands and capturing their output

use std::process::{Command, Stdio};

use tracing::trace;

/// A command that could not be run, failed, or printed something unexpected
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be started
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },
    /// The program exited unsuccessfully
    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        /// Command line
        command: String,
        /// Exit status, as printed
        status: String,
        /// Captured standard error, trimmed
        stderr: String,
    },
    /// Standard output was not what the caller expected
    #[error("unexpected output from {command}: {reason}")]
    InvalidOutput {
        /// Command line
        command: String,
        /// Parse failure
        reason: String,
    },
}

/// Render a command line for messages
pub fn describe(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Helpers for [`Command`]
pub trait CommandRunExt {
    /// Run to completion and return standard output.
    ///
    /// Standard error is captured and included in the error on failure.
    fn run_capture(&mut self) -> Result<String, CommandError>;

    /// Run to completion and parse standard output as JSON
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, CommandError>;
}

impl CommandRunExt for Command {
    fn run_capture(&mut self) -> Result<String, CommandError> {
        let command = describe(self);
        trace!("exec: {command}");
        let program = self.get_program().to_string_lossy().into_owned();
        let out = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| CommandError::Spawn { program, source })?;
        if !out.status.success() {
            return Err(CommandError::Failed {
                command,
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            });
        }
        String::from_utf8(out.stdout).map_err(|e| CommandError::InvalidOutput {
            command,
            reason: e.to_string(),
        })
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, CommandError> {
        let stdout = self.run_capture()?;
        serde_json::from_str(&stdout).map_err(|e| CommandError::InvalidOutput {
            command: describe(self),
            reason: e.to_string(),
        })
    }
}
