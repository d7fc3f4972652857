//! Remote command execution over a multiplexed SSH connection.
//!
//! Everything the bootstrap sequence does on the remote host is built from
//! [`RemoteExecutor`]: run one command, optionally streaming bytes into its
//! standard input, and wait for the result. The [`SshConnection`] adapter
//! provides that primitive by driving the system `ssh` client through a
//! `ControlMaster` socket, and every local process goes through a
//! [`CommandRunner`] so tests can script the outcomes.

use std::sync::Arc;

use thiserror::Error;

mod runner;
mod ssh;

pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use ssh::{SshConnection, SshSettings};

/// Exit status `ssh` reports when the transport itself failed.
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Output captured from a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit status reported by the remote command, if any.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Returns `true` when the remote command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Pseudo-terminal parameters for an interactive remote session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PtyRequest {
    /// Terminal type identifier advertised to the remote host.
    pub term: String,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
}

impl PtyRequest {
    /// Width used when the local terminal size is unavailable.
    pub const DEFAULT_COLS: u16 = 80;
    /// Height used when the local terminal size is unavailable.
    pub const DEFAULT_ROWS: u16 = 24;

    /// Builds a request from an optional `(cols, rows)` size, falling back to
    /// 80x24.
    #[must_use]
    pub fn new(term: impl Into<String>, size: Option<(u16, u16)>) -> Self {
        let (cols, rows) = size
            .filter(|&(cols, rows)| cols > 0 && rows > 0)
            .unwrap_or((Self::DEFAULT_COLS, Self::DEFAULT_ROWS));
        Self {
            term: term.into(),
            cols,
            rows,
        }
    }
}

/// Errors raised while executing local or remote commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when a local process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when streaming input into a command fails.
    #[error("failed to stream input to {program}: {message}")]
    Input {
        /// Program whose standard input failed.
        program: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the SSH connection cannot be established.
    #[error("failed to connect to {target}: {stderr}")]
    Connect {
        /// `user@host` the connection targeted.
        target: String,
        /// Stderr reported by the SSH client.
        stderr: String,
    },
    /// Raised when the SSH transport fails after the connection was opened.
    #[error("ssh transport failure: {stderr}")]
    Transport {
        /// Stderr reported by the SSH client.
        stderr: String,
    },
    /// Raised when a remote command exits with a non-zero status.
    #[error("remote command `{command}` exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Remote command that failed.
        command: String,
        /// Exit status reported by the remote side.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when a command is issued after the connection was closed.
    #[error("connection already closed")]
    Closed,
}

impl ExecError {
    /// Builds a [`ExecError::CommandFailure`] from a remote command output.
    #[must_use]
    pub fn command_failure(command: &str, output: RemoteCommandOutput) -> Self {
        let status_text = output
            .exit_code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Self::CommandFailure {
            command: command.to_owned(),
            status: output.exit_code,
            status_text,
            stderr: output.stderr,
        }
    }
}

/// Runs commands on the remote host.
pub trait RemoteExecutor {
    /// Runs `command` through the remote user's shell, streaming `stdin` into
    /// it when provided, and waits for it to finish.
    ///
    /// A non-zero remote exit status is reported in the output, not as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when the command cannot be started or the
    /// transport fails.
    fn execute(&self, command: &str, stdin: Option<&[u8]>)
    -> Result<RemoteCommandOutput, ExecError>;

    /// Starts an interactive session attached to the local standard streams
    /// and blocks until the remote process exits. `None` starts the login
    /// shell.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when the session cannot be started or the
    /// transport fails.
    fn run_interactive(
        &self,
        pty: &PtyRequest,
        command: Option<&str>,
    ) -> Result<Option<i32>, ExecError>;

    /// Like [`RemoteExecutor::execute`], but treats a non-zero exit status as
    /// [`ExecError::CommandFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] on transport failures and non-zero exits.
    fn execute_checked(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<RemoteCommandOutput, ExecError> {
        let output = self.execute(command, stdin)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(ExecError::command_failure(command, output))
        }
    }
}

impl<T: RemoteExecutor + ?Sized> RemoteExecutor for &T {
    fn execute(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<RemoteCommandOutput, ExecError> {
        (**self).execute(command, stdin)
    }

    fn run_interactive(
        &self,
        pty: &PtyRequest,
        command: Option<&str>,
    ) -> Result<Option<i32>, ExecError> {
        (**self).run_interactive(pty, command)
    }
}

impl<T: RemoteExecutor + ?Sized> RemoteExecutor for Arc<T> {
    fn execute(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<RemoteCommandOutput, ExecError> {
        (**self).execute(command, stdin)
    }

    fn run_interactive(
        &self,
        pty: &PtyRequest,
        command: Option<&str>,
    ) -> Result<Option<i32>, ExecError> {
        (**self).run_interactive(pty, command)
    }
}

/// Wraps a remote shell command so it runs detached from the invoking shell:
/// no job-control entry, standard streams redirected away, and immune to the
/// hangup sent when the session ends.
///
/// `command` is inserted verbatim; callers escape its arguments.
#[must_use]
pub fn detached(command: &str) -> String {
    format!("(nohup {command} </dev/null >/dev/null 2>&1 &)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some((120, 40)), 120, 40)]
    #[case(None, 80, 24)]
    #[case(Some((0, 0)), 80, 24)]
    fn pty_request_falls_back_to_default_size(
        #[case] size: Option<(u16, u16)>,
        #[case] cols: u16,
        #[case] rows: u16,
    ) {
        let pty = PtyRequest::new("xterm", size);
        assert_eq!((pty.cols, pty.rows), (cols, rows));
        assert_eq!(pty.term, "xterm");
    }

    #[test]
    fn detached_redirects_streams_and_backgrounds() {
        let command = detached("/tmp/sshrc/ssh-mon.bash \"$SSH_TTY\"");
        assert_eq!(
            command,
            "(nohup /tmp/sshrc/ssh-mon.bash \"$SSH_TTY\" </dev/null >/dev/null 2>&1 &)"
        );
    }

    #[test]
    fn command_failure_reports_status_text() {
        let err = ExecError::command_failure(
            "false",
            RemoteCommandOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::from("boom"),
            },
        );
        assert_eq!(
            err.to_string(),
            "remote command `false` exited with status unknown: boom"
        );
    }
}
