//! Interactive remote session attached to the local terminal.

use std::io;

use thiserror::Error;

use crate::compose::monitor_launch;
use crate::exec::{ExecError, PtyRequest, RemoteExecutor};
use crate::shell::ShellVariant;
use crate::util::quote_path;
use crate::workspace::RemoteWorkspace;

/// Terminal type advertised when none is configured.
pub const DEFAULT_TERM: &str = "xterm";

/// Local terminal operations the session driver depends on.
pub trait TerminalProvider {
    /// Returns the terminal size as `(cols, rows)`, if known.
    fn size(&self) -> Option<(u16, u16)>;

    /// Switches the terminal into raw mode.
    ///
    /// # Errors
    ///
    /// Returns the underlying error when the terminal rejects the change.
    fn enable_raw_mode(&self) -> io::Result<()>;

    /// Restores cooked mode.
    ///
    /// # Errors
    ///
    /// Returns the underlying error when the terminal rejects the change.
    fn disable_raw_mode(&self) -> io::Result<()>;
}

/// [`TerminalProvider`] backed by `crossterm`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrosstermTerminal;

impl TerminalProvider for CrosstermTerminal {
    fn size(&self) -> Option<(u16, u16)> {
        crossterm::terminal::size().ok()
    }

    fn enable_raw_mode(&self) -> io::Result<()> {
        crossterm::terminal::enable_raw_mode()
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        crossterm::terminal::disable_raw_mode()
    }
}

#[must_use = "RawModeGuard must be held for the duration of the session"]
struct RawModeGuard<'a, T: TerminalProvider> {
    terminal: &'a T,
    active: bool,
}

impl<'a, T: TerminalProvider> RawModeGuard<'a, T> {
    fn enter(terminal: &'a T) -> Self {
        let active = match terminal.enable_raw_mode() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "raw mode unavailable; continuing in cooked mode");
                false
            }
        };
        Self { terminal, active }
    }
}

impl<T: TerminalProvider> Drop for RawModeGuard<'_, T> {
    fn drop(&mut self) {
        if self.active
            && let Err(err) = self.terminal.disable_raw_mode()
        {
            tracing::warn!(error = %err, "failed to restore terminal mode");
        }
    }
}

/// Errors raised by the interactive session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Raised when the transport fails to start or carry the session.
    #[error("interactive session failed: {0}")]
    Transport(#[from] ExecError),
}

/// Result of an interactive session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionOutcome {
    /// Exit status of the remote process, if one was reported.
    pub exit_code: Option<i32>,
    /// Whether the composed configuration was used.
    pub used_composed_config: bool,
}

/// Returns the remote command that starts `variant` with the composed
/// configuration.
#[must_use]
pub fn launch_command(variant: ShellVariant, workspace: &RemoteWorkspace) -> String {
    match variant {
        ShellVariant::Bash => format!(
            "exec bash --rcfile {} -i",
            quote_path(&workspace.composed_config(variant))
        ),
        ShellVariant::Zsh => format!(
            "exec env ZDOTDIR={} zsh -i",
            quote_path(&workspace.zdotdir())
        ),
    }
}

/// Returns the remote command for a session without a composed
/// configuration: start the monitor, then hand over to the login shell.
#[must_use]
pub fn plain_launch_command(workspace: &RemoteWorkspace) -> String {
    format!("{}exec \"$SHELL\" -l", monitor_launch(workspace))
}

/// Runs the interactive shell on the remote host.
#[derive(Debug)]
pub struct SessionDriver<'a, E: RemoteExecutor, T: TerminalProvider> {
    executor: &'a E,
    terminal: &'a T,
    workspace: &'a RemoteWorkspace,
    term: &'a str,
}

impl<'a, E: RemoteExecutor, T: TerminalProvider> SessionDriver<'a, E, T> {
    /// Creates a driver for `workspace` using `term` as terminal type.
    #[must_use]
    pub const fn new(
        executor: &'a E,
        terminal: &'a T,
        workspace: &'a RemoteWorkspace,
        term: &'a str,
    ) -> Self {
        Self {
            executor,
            terminal,
            workspace,
            term,
        }
    }

    /// Starts the session and blocks until the remote process exits.
    ///
    /// Any remote exit status is a clean outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] on transport failures.
    pub fn run(
        &self,
        variant: ShellVariant,
        use_composed_config: bool,
    ) -> Result<SessionOutcome, SessionError> {
        let pty = PtyRequest::new(self.term, self.terminal.size());
        let command = if use_composed_config {
            launch_command(variant, self.workspace)
        } else {
            plain_launch_command(self.workspace)
        };
        tracing::info!(
            cols = pty.cols,
            rows = pty.rows,
            term = %pty.term,
            composed = use_composed_config,
            "starting interactive session"
        );

        let exit_code = {
            let _raw = RawModeGuard::enter(self.terminal);
            self.executor.run_interactive(&pty, Some(command.as_str()))?
        };

        tracing::info!(exit_code = ?exit_code, "interactive session ended");
        Ok(SessionOutcome {
            exit_code,
            used_composed_config: use_composed_config,
        })
    }
}
