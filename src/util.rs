//! Small helpers shared by the client and the monitor.

use std::borrow::Cow;
use std::io::{self, ErrorKind};

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;

/// Expands a leading `~/` to the current user's home directory.
///
/// Paths without the prefix, and every path when `HOME` is unset, are
/// returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Shell-escapes a remote path for inclusion in a command line.
#[must_use]
pub fn quote_path(path: &Utf8Path) -> String {
    escape(Cow::Borrowed(path.as_str())).into_owned()
}

/// Reads a local file through a directory capability opened on its parent.
///
/// Relative paths resolve against the working directory.
///
/// # Errors
///
/// Returns the underlying I/O error when the parent directory or the file
/// cannot be opened or read.
pub fn read_local_file(path: &Utf8Path) -> io::Result<String> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("path has no file name: {path}"),
        )
    })?;
    let dir_path = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));

    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())?;
    dir.read_to_string(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn expand_tilde_expands_home_prefix() {
        let home = std::env::var("HOME").expect("HOME should be set");
        assert_eq!(expand_tilde("~/.ssh/id_rsa"), format!("{home}/.ssh/id_rsa"));
    }

    #[rstest]
    #[case("/absolute/path/to/key")]
    #[case("relative/path/to/key")]
    #[case("~user/key")]
    fn expand_tilde_leaves_other_paths_unchanged(#[case] path: &str) {
        assert_eq!(expand_tilde(path), path);
    }

    #[rstest]
    fn read_local_file_reads_absolute_paths() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("rc");
        std::fs::write(&path, "export A=1\n").expect("write rc");
        let utf8 = camino::Utf8PathBuf::from_path_buf(path).expect("utf8 path");

        assert_eq!(read_local_file(&utf8).expect("read rc"), "export A=1\n");
    }

    #[rstest]
    fn read_local_file_reports_missing_files() {
        let err = read_local_file(Utf8Path::new("/definitely/not/here.rc"))
            .expect_err("missing file should fail");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[rstest]
    #[case("/tmp/sshrc/helpers", "/tmp/sshrc/helpers")]
    #[case("/tmp/my dir/a.sh", "'/tmp/my dir/a.sh'")]
    fn quote_path_escapes_only_when_needed(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(quote_path(Utf8Path::new(raw)), expected);
    }
}
