//! Builds the temporary shell configuration sourced by the remote session.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::deploy::{DeployError, EXECUTABLE_MODE, FileDeployer};
use crate::exec::{RemoteExecutor, detached};
use crate::shell::ShellVariant;
use crate::util::{quote_path, read_local_file};
use crate::workspace::RemoteWorkspace;

/// Marker line that starts the fragment copied from a local configuration.
pub const HELPERS_MARKER: &str = "# HELPERS";

/// Errors raised while materialising a composed configuration.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// Raised when a configuration file cannot be written remotely.
    #[error("failed to write shell configuration: {0}")]
    Deploy(#[from] DeployError),
}

/// Returns every line of `text` from the first one containing `marker`,
/// compared case-insensitively, through the end. Lines are kept verbatim.
///
/// Returns `None` when no line carries the marker.
#[must_use]
pub fn extract_fragment(text: &str, marker: &str) -> Option<String> {
    let needle = marker.to_lowercase();
    let mut lines = text.split_inclusive('\n');
    let first = lines.find(|line| line.to_lowercase().contains(&needle))?;

    let mut fragment = String::from(first);
    fragment.extend(lines);
    if !fragment.ends_with('\n') {
        fragment.push('\n');
    }
    Some(fragment)
}

/// Shell configuration composed for one session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComposedConfig {
    /// Shell family the configuration targets.
    pub variant: ShellVariant,
    /// The user's own configuration, as a shell expression.
    pub original_rc: String,
    /// Fragment copied from the local configuration, if any.
    pub fragment: Option<String>,
    /// Names of the helpers deployed for the session.
    pub helpers: Vec<String>,
    /// Remote path of the composed file.
    pub path: Utf8PathBuf,
}

impl ComposedConfig {
    /// Renders the configuration file for `workspace`.
    #[must_use]
    pub fn render(&self, workspace: &RemoteWorkspace) -> String {
        let helpers_dir = quote_path(&workspace.helpers_dir());
        let glob = match self.variant {
            ShellVariant::Bash => "*",
            ShellVariant::Zsh => "*(N)",
        };

        let mut out = format!(
            "# sshrc session configuration for {variant}; removed when the session ends.\n\
             if [ -f \"{rc}\" ]; then\n    . \"{rc}\"\nfi\n\n",
            variant = self.variant,
            rc = self.original_rc,
        );

        if let Some(ref fragment) = self.fragment {
            out.push_str(fragment);
            out.push('\n');
        }

        out.push_str(&format!(
            concat!(
                "export PATH={dir}:\"$PATH\"\n",
                "for sshrc_helper in {dir}/{glob}; do\n",
                "    if [ -f \"$sshrc_helper\" ] && [ -x \"$sshrc_helper\" ]; then\n",
                "        . \"$sshrc_helper\" 2>/dev/null || true\n",
                "    fi\n",
                "done\n",
                "unset sshrc_helper\n\n"
            ),
            dir = helpers_dir,
            glob = glob,
        ));

        out.push_str(&monitor_launch(workspace));
        out
    }
}

/// Renders the shell snippet that starts the session monitor for the current
/// terminal, at most once per terminal.
#[must_use]
pub fn monitor_launch(workspace: &RemoteWorkspace) -> String {
    let launch = detached(&format!(
        "{} \"$sshrc_tty\"",
        quote_path(&workspace.monitor_script())
    ));
    // The noclobber redirect creates the lock atomically.
    format!(
        concat!(
            "sshrc_tty=\"${{SSH_TTY:-$(tty 2>/dev/null || true)}}\"\n",
            "case \"$sshrc_tty\" in\n",
            "    /dev/*)\n",
            "        sshrc_lock={lock}\"$(basename \"$sshrc_tty\")\"\n",
            "        if ( set -C; : > \"$sshrc_lock\" ) 2>/dev/null; then\n",
            "            {launch}\n",
            "        fi\n",
            "        ;;\n",
            "esac\n",
            "unset sshrc_tty sshrc_lock\n"
        ),
        lock = quote_path(&workspace.lock_prefix()),
        launch = launch,
    )
}

/// Renders the zsh startup shim that hands over to the composed file.
#[must_use]
pub fn render_zsh_shim(composed: &Utf8Path) -> String {
    format!(
        "# sshrc zsh startup shim\nunset ZDOTDIR\n. {}\n",
        quote_path(composed)
    )
}

/// Composes and writes session configuration files.
#[derive(Debug)]
pub struct EnvironmentComposer<'a, E: RemoteExecutor> {
    executor: &'a E,
    workspace: &'a RemoteWorkspace,
}

impl<'a, E: RemoteExecutor> EnvironmentComposer<'a, E> {
    /// Creates a composer writing into `workspace` through `executor`.
    #[must_use]
    pub const fn new(executor: &'a E, workspace: &'a RemoteWorkspace) -> Self {
        Self {
            executor,
            workspace,
        }
    }

    /// Composes the configuration for `variant`.
    ///
    /// A fragment source that cannot be read, or that carries no
    /// [`HELPERS_MARKER`], contributes nothing.
    #[must_use]
    pub fn compose(
        &self,
        variant: ShellVariant,
        helpers: &[String],
        fragment_source: Option<&Utf8Path>,
    ) -> ComposedConfig {
        let fragment = fragment_source.and_then(|path| match read_local_file(path) {
            Ok(text) => {
                let extracted = extract_fragment(&text, HELPERS_MARKER);
                if extracted.is_none() {
                    tracing::info!(path = %path, "marker '{HELPERS_MARKER}' not found; nothing added from local rc");
                }
                extracted
            }
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "local rc unreadable; nothing added");
                None
            }
        });

        ComposedConfig {
            variant,
            original_rc: variant.original_rc(),
            fragment,
            helpers: helpers.to_vec(),
            path: self.workspace.composed_config(variant),
        }
    }

    /// Writes `config` to the workspace, plus the zsh startup shim for zsh.
    ///
    /// Existing files are overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::Deploy`] when a remote write fails.
    pub fn materialize(&self, config: &ComposedConfig) -> Result<(), ComposeError> {
        let deployer = FileDeployer::new(self.executor);
        let rendered = config.render(self.workspace);
        deployer.deploy(&config.path, rendered.as_bytes(), EXECUTABLE_MODE)?;

        if config.variant == ShellVariant::Zsh {
            let shim = render_zsh_shim(&config.path);
            deployer.deploy(&self.workspace.zsh_shim(), shim.as_bytes(), EXECUTABLE_MODE)?;
        }

        tracing::info!(path = %config.path, variant = %config.variant, "composed shell configuration written");
        Ok(())
    }
}
