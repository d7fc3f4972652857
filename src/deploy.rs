//! Materialises local byte buffers as executable files on the remote host.
//!
//! Helpers are read from a local directory snapshot in one pass, before any
//! remote write, and then deployed one command per file. There is no
//! transaction: a failure part-way through reports the files already written.

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::exec::{ExecError, RemoteExecutor};
use crate::util::quote_path;
use crate::workspace::{RemoteWorkspace, WorkspaceError, validate_helper_name};

/// Permission bits applied to every deployed file.
pub const EXECUTABLE_MODE: u32 = 0o755;

/// A helper script read from the local helpers directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HelperFile {
    /// File name, used unchanged as the remote file name.
    pub name: String,
    /// File content, deployed verbatim.
    pub content: Vec<u8>,
}

/// Errors raised while reading or deploying files.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Raised when the helpers directory does not exist.
    #[error("helpers directory does not exist: {path}")]
    MissingHelpersDir {
        /// Directory that was requested.
        path: Utf8PathBuf,
    },
    /// Raised when a local file or directory cannot be read.
    #[error("failed to read {path}: {message}")]
    LocalRead {
        /// Local path that failed.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a helper name cannot be used as a remote file name.
    #[error(transparent)]
    InvalidName(#[from] WorkspaceError),
    /// Raised when a deployment target has no parent directory.
    #[error("deployment target has no parent directory: {path}")]
    InvalidTarget {
        /// Rejected remote path.
        path: Utf8PathBuf,
    },
    /// Raised when the remote write command fails.
    #[error("failed to deploy {path}: {source}")]
    Remote {
        /// Remote path being written.
        path: Utf8PathBuf,
        /// Underlying execution error.
        #[source]
        source: ExecError,
    },
    /// Raised when a batch stops after some files were already written.
    #[error("failed to deploy {failed} after {count} file(s) were written: {source}", count = .deployed.len())]
    Partial {
        /// Remote path that could not be written.
        failed: Utf8PathBuf,
        /// Remote paths written before the failure, in deployment order.
        deployed: Vec<Utf8PathBuf>,
        /// Underlying execution error.
        #[source]
        source: ExecError,
    },
}

impl DeployError {
    /// Returns the remote paths written before a batch failed.
    #[must_use]
    pub fn deployed(&self) -> &[Utf8PathBuf] {
        match self {
            Self::Partial { deployed, .. } => deployed,
            _ => &[],
        }
    }
}

/// Reads every regular file directly inside `dir`, sorted by name.
///
/// Subdirectories and other non-file entries are skipped; symbolic links are
/// followed and kept when they resolve to a regular file.
///
/// # Errors
///
/// Returns [`DeployError::MissingHelpersDir`] when `dir` does not exist,
/// [`DeployError::LocalRead`] when it or any file in it cannot be read, and
/// [`DeployError::InvalidName`] for names that are not valid UTF-8 file names.
pub fn discover_helpers(dir: &Utf8Path) -> Result<Vec<HelperFile>, DeployError> {
    let handle = Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            DeployError::MissingHelpersDir {
                path: dir.to_owned(),
            }
        } else {
            local_read(dir, &err)
        }
    })?;

    let mut names = Vec::new();
    for item in handle.entries().map_err(|err| local_read(dir, &err))? {
        let entry = item.map_err(|err| local_read(dir, &err))?;
        let name = entry.file_name().map_err(|err| local_read(dir, &err))?;
        if is_regular_file(&handle, &name) {
            validate_helper_name(&name)?;
            names.push(name);
        } else {
            tracing::debug!(dir = %dir, entry = %name, "skipping non-file helper entry");
        }
    }
    names.sort();

    let mut helpers = Vec::with_capacity(names.len());
    for name in names {
        let content = handle
            .read(&name)
            .map_err(|err| local_read(&dir.join(&name), &err))?;
        helpers.push(HelperFile { name, content });
    }
    Ok(helpers)
}

fn is_regular_file(dir: &Dir, name: &str) -> bool {
    // `metadata` follows symbolic links that stay inside the directory.
    dir.metadata(name)
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

fn local_read(path: &Utf8Path, err: &std::io::Error) -> DeployError {
    DeployError::LocalRead {
        path: path.to_owned(),
        message: err.to_string(),
    }
}

/// Writes files to the remote host through a [`RemoteExecutor`].
#[derive(Debug)]
pub struct FileDeployer<'a, E: RemoteExecutor> {
    executor: &'a E,
}

impl<'a, E: RemoteExecutor> FileDeployer<'a, E> {
    /// Creates a deployer writing through `executor`.
    #[must_use]
    pub const fn new(executor: &'a E) -> Self {
        Self { executor }
    }

    /// Writes `content` to `path`, creating parent directories and applying
    /// `mode`. An existing file is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidTarget`] when `path` has no parent and
    /// [`DeployError::Remote`] when the remote command fails.
    pub fn deploy(&self, path: &Utf8Path, content: &[u8], mode: u32) -> Result<(), DeployError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .ok_or_else(|| DeployError::InvalidTarget {
                path: path.to_owned(),
            })?;

        let quoted = quote_path(path);
        let command = format!(
            "mkdir -p {} && cat > {quoted} && chmod {mode:o} {quoted}",
            quote_path(parent)
        );

        tracing::debug!(path = %path, bytes = content.len(), "deploying remote file");
        self.executor
            .execute_checked(&command, Some(content))
            .map(|_| ())
            .map_err(|source| DeployError::Remote {
                path: path.to_owned(),
                source,
            })
    }

    /// Deploys each helper into the workspace helpers directory, in order.
    ///
    /// All names are validated before the first remote write.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidName`] for unusable names and
    /// [`DeployError::Partial`] when a write fails, carrying the paths that
    /// were already written.
    pub fn deploy_helpers(
        &self,
        workspace: &RemoteWorkspace,
        helpers: &[HelperFile],
    ) -> Result<Vec<Utf8PathBuf>, DeployError> {
        let targets = helpers
            .iter()
            .map(|helper| workspace.helper(&helper.name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut deployed = Vec::with_capacity(helpers.len());
        for (helper, target) in helpers.iter().zip(targets) {
            match self.deploy(&target, &helper.content, EXECUTABLE_MODE) {
                Ok(()) => deployed.push(target),
                Err(DeployError::Remote { path, source }) => {
                    return Err(DeployError::Partial {
                        failed: path,
                        deployed,
                        source,
                    });
                }
                Err(other) => return Err(other),
            }
        }

        Ok(deployed)
    }
}
