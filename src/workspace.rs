//! Layout of the temporary remote workspace.
//!
//! Every artefact the client deploys lives beneath a single root directory so
//! the monitor can remove all of it with one recursive delete.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::shell::ShellVariant;

/// Default remote workspace root.
pub const DEFAULT_WORKSPACE_ROOT: &str = "/tmp/sshrc";

const MONITOR_SCRIPT_NAME: &str = "ssh-mon.bash";
const HELPERS_DIR_NAME: &str = "helpers";
const ZDOTDIR_NAME: &str = "zdotdir";
const LOCK_PREFIX: &str = ".monitor_";

/// Errors raised when validating workspace paths and names.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WorkspaceError {
    /// Raised when the workspace root is relative.
    #[error("workspace root must be an absolute path, got '{0}'")]
    RelativeRoot(String),
    /// Raised when the workspace root would be the filesystem root.
    #[error("workspace root must not be '/'")]
    FilesystemRoot,
    /// Raised when a helper name cannot be used as a single path component.
    #[error("invalid helper name '{0}': expected a plain file name")]
    InvalidHelperName(String),
}

/// Remote directory holding the monitor, helpers, composed configurations and
/// session locks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteWorkspace {
    root: Utf8PathBuf,
}

impl RemoteWorkspace {
    /// Creates a workspace rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] when `root` is relative or is `/`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Result<Self, WorkspaceError> {
        let raw: Utf8PathBuf = root.into();
        if !raw.is_absolute() {
            return Err(WorkspaceError::RelativeRoot(raw.into_string()));
        }

        let normalized: Utf8PathBuf = raw.components().collect();
        if normalized.parent().is_none() {
            return Err(WorkspaceError::FilesystemRoot);
        }

        Ok(Self { root: normalized })
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the path of the monitoring script.
    #[must_use]
    pub fn monitor_script(&self) -> Utf8PathBuf {
        self.root.join(MONITOR_SCRIPT_NAME)
    }

    /// Returns the directory holding deployed helpers.
    #[must_use]
    pub fn helpers_dir(&self) -> Utf8PathBuf {
        self.root.join(HELPERS_DIR_NAME)
    }

    /// Returns the remote path for the helper called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::InvalidHelperName`] when `name` is empty,
    /// contains `/`, or is `.` or `..`.
    pub fn helper(&self, name: &str) -> Result<Utf8PathBuf, WorkspaceError> {
        validate_helper_name(name)?;
        Ok(self.helpers_dir().join(name))
    }

    /// Returns the composed configuration path for `variant`.
    #[must_use]
    pub fn composed_config(&self, variant: ShellVariant) -> Utf8PathBuf {
        self.root.join(variant.composed_file_name())
    }

    /// Returns the directory exported as `ZDOTDIR` for zsh sessions.
    #[must_use]
    pub fn zdotdir(&self) -> Utf8PathBuf {
        self.root.join(ZDOTDIR_NAME)
    }

    /// Returns the zsh startup shim inside [`RemoteWorkspace::zdotdir`].
    #[must_use]
    pub fn zsh_shim(&self) -> Utf8PathBuf {
        self.zdotdir().join(".zshrc")
    }

    /// Returns the lock marker for the terminal whose basename is `tty_basename`.
    #[must_use]
    pub fn lock_for(&self, tty_basename: &str) -> Utf8PathBuf {
        self.root.join(format!("{LOCK_PREFIX}{tty_basename}"))
    }

    /// Returns the lock marker prefix, joined to the root, for use in shell
    /// code that appends the basename at run time.
    #[must_use]
    pub fn lock_prefix(&self) -> Utf8PathBuf {
        self.root.join(LOCK_PREFIX)
    }
}

impl Default for RemoteWorkspace {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from(DEFAULT_WORKSPACE_ROOT),
        }
    }
}

/// Checks that `name` is usable as a single path component.
///
/// # Errors
///
/// Returns [`WorkspaceError::InvalidHelperName`] for empty names, names with
/// `/`, and the `.`/`..` directory entries.
pub fn validate_helper_name(name: &str) -> Result<(), WorkspaceError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(WorkspaceError::InvalidHelperName(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn default_layout_matches_remote_contract() {
        let workspace = RemoteWorkspace::default();

        assert_eq!(workspace.monitor_script(), "/tmp/sshrc/ssh-mon.bash");
        assert_eq!(workspace.helpers_dir(), "/tmp/sshrc/helpers");
        assert_eq!(
            workspace.composed_config(ShellVariant::Bash),
            "/tmp/sshrc/.sshrc_bashrc"
        );
        assert_eq!(
            workspace.composed_config(ShellVariant::Zsh),
            "/tmp/sshrc/.sshrc_zshrc"
        );
        assert_eq!(workspace.zsh_shim(), "/tmp/sshrc/zdotdir/.zshrc");
        assert_eq!(workspace.lock_for("3"), "/tmp/sshrc/.monitor_3");
    }

    #[rstest]
    fn trailing_separators_are_normalised() {
        let workspace = RemoteWorkspace::new("/var/tmp/work/").expect("valid root");
        assert_eq!(workspace.root().as_str(), "/var/tmp/work");
        assert_eq!(workspace.lock_prefix(), "/var/tmp/work/.monitor_");
    }

    #[rstest]
    #[case("relative/dir", WorkspaceError::RelativeRoot(String::from("relative/dir")))]
    #[case("/", WorkspaceError::FilesystemRoot)]
    #[case("//", WorkspaceError::FilesystemRoot)]
    fn invalid_roots_are_rejected(#[case] root: &str, #[case] expected: WorkspaceError) {
        assert_eq!(RemoteWorkspace::new(root), Err(expected));
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("..")]
    #[case("nested/a.sh")]
    fn invalid_helper_names_are_rejected(#[case] name: &str) {
        let workspace = RemoteWorkspace::default();
        assert_eq!(
            workspace.helper(name),
            Err(WorkspaceError::InvalidHelperName(name.to_owned()))
        );
    }

    #[rstest]
    fn helper_paths_live_under_helpers_dir() {
        let workspace = RemoteWorkspace::default();
        assert_eq!(
            workspace.helper("a.sh").expect("valid name"),
            "/tmp/sshrc/helpers/a.sh"
        );
    }
}
