//! Remote shell variants and default-shell detection.

use std::fmt;

use crate::exec::RemoteExecutor;

/// Shell family the composed configuration targets.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ShellVariant {
    /// GNU bash, the default when detection is inconclusive.
    #[default]
    Bash,
    /// Z shell.
    Zsh,
}

/// Suffix appended to an original configuration file to form its backup.
pub const BACKUP_SUFFIX: &str = ".sshrc_backup";

impl ShellVariant {
    /// Every supported variant, in restoration order.
    pub const ALL: [Self; 2] = [Self::Bash, Self::Zsh];

    /// Returns the shell's executable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
        }
    }

    /// Returns the user's own configuration file name, relative to `$HOME`.
    #[must_use]
    pub const fn rc_file_name(self) -> &'static str {
        match self {
            Self::Bash => ".bashrc",
            Self::Zsh => ".zshrc",
        }
    }

    /// Returns the original configuration path as a shell expression.
    #[must_use]
    pub fn original_rc(self) -> String {
        format!("$HOME/{}", self.rc_file_name())
    }

    /// Returns the backup file name, relative to `$HOME`.
    #[must_use]
    pub fn backup_file_name(self) -> String {
        format!("{}{BACKUP_SUFFIX}", self.rc_file_name())
    }

    /// Returns the composed configuration file name inside the workspace.
    #[must_use]
    pub const fn composed_file_name(self) -> &'static str {
        match self {
            Self::Bash => ".sshrc_bashrc",
            Self::Zsh => ".sshrc_zshrc",
        }
    }

    /// Classifies the output of `echo "$SHELL"`.
    ///
    /// zsh is checked first so a path such as `/opt/bash-tools/zsh` resolves
    /// to zsh. Anything unrecognised yields the default variant.
    #[must_use]
    pub fn classify(shell_path: &str) -> Self {
        if shell_path.contains("zsh") {
            Self::Zsh
        } else if shell_path.contains("bash") {
            Self::Bash
        } else {
            Self::default()
        }
    }
}

impl fmt::Display for ShellVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Queries the remote login shell.
#[derive(Debug)]
pub struct ShellDetector<'a, E: RemoteExecutor> {
    executor: &'a E,
}

impl<'a, E: RemoteExecutor> ShellDetector<'a, E> {
    const QUERY: &'static str = "echo \"$SHELL\"";

    /// Creates a detector that runs its query through `executor`.
    #[must_use]
    pub const fn new(executor: &'a E) -> Self {
        Self { executor }
    }

    /// Detects the remote default shell.
    ///
    /// Detection never fails: execution errors and non-zero exits fall back
    /// to [`ShellVariant::default`].
    #[must_use]
    pub fn detect(&self) -> ShellVariant {
        match self.executor.execute(Self::QUERY, None) {
            Ok(output) if output.is_success() => {
                let shell = output.stdout.trim();
                let variant = ShellVariant::classify(shell);
                tracing::debug!(shell, %variant, "detected remote shell");
                variant
            }
            Ok(output) => {
                tracing::warn!(
                    status = ?output.exit_code,
                    "shell query failed; assuming {}",
                    ShellVariant::default()
                );
                ShellVariant::default()
            }
            Err(err) => {
                tracing::warn!(error = %err, "shell query failed; assuming {}", ShellVariant::default());
                ShellVariant::default()
            }
        }
    }
}
