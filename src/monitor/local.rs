//! [`HostProbe`] for the host the monitor runs on.

use std::ffi::OsString;
use std::io::{self, ErrorKind};

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

use super::{HostProbe, RestoreAction, is_shell_command};
use crate::exec::CommandRunner;

/// Queries the local process table through `ps` and restores files through
/// directory capabilities.
#[derive(Clone, Debug, Default)]
pub struct LocalHost<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> LocalHost<R> {
    /// Creates a probe that runs `ps` through `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }
}

/// Returns `true` when a `ps -o tty=,comm=` listing shows a shell on
/// `tty_name`.
#[must_use]
pub fn listing_has_shell(listing: &str, tty_name: &str) -> bool {
    listing.lines().any(|line| {
        let mut fields = line.split_whitespace();
        matches!(
            (fields.next(), fields.next()),
            (Some(tty), Some(command)) if tty == tty_name && is_shell_command(command)
        )
    })
}

fn split_parent(path: &Utf8Path) -> io::Result<(Dir, &str)> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("path has no file name: {path}"),
        )
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, name))
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl<R: CommandRunner> HostProbe for LocalHost<R> {
    fn device_exists(&self, device: &Utf8Path) -> bool {
        split_parent(device)
            .map(|(dir, name)| dir.exists(name))
            .unwrap_or(false)
    }

    fn shell_attached(&self, tty_name: &str, user: &str) -> bool {
        let args = [
            OsString::from("-u"),
            OsString::from(user),
            OsString::from("-o"),
            OsString::from("tty=,comm="),
        ];
        match self.runner.run("ps", &args) {
            // `ps -u` exits non-zero when the user owns no process at all.
            Ok(output) => listing_has_shell(&output.stdout, tty_name),
            Err(err) => {
                // Without a process table only the device check can end the
                // session.
                tracing::warn!(error = %err, "cannot list processes");
                true
            }
        }
    }

    fn perform(&self, action: &RestoreAction) -> io::Result<()> {
        match action {
            RestoreAction::RestoreBackup { backup, original } => {
                let (from_dir, from_name) = match split_parent(backup) {
                    Ok(parts) => parts,
                    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                    Err(err) => return Err(err),
                };
                if !from_dir.exists(from_name) {
                    return Ok(());
                }
                let (to_dir, to_name) = split_parent(original)?;
                from_dir.rename(from_name, &to_dir, to_name)
            }
            RestoreAction::RemoveWorkspace { root } => {
                let (dir, name) = match split_parent(root) {
                    Ok(parts) => parts,
                    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                    Err(err) => return Err(err),
                };
                ignore_missing(dir.remove_dir_all(name))
            }
        }
    }
}
