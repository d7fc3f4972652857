//! Integration tests for layered configuration loading.

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::*;
use sshrc::SshrcConfig;
use sshrc::config::ConfigError;
use sshrc::test_support::EnvGuard;
use tempfile::TempDir;

#[fixture]
fn config_dir() -> (TempDir, Utf8PathBuf) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    (tmp, root)
}

#[rstest]
#[tokio::test]
async fn defaults_apply_without_sources(config_dir: (TempDir, Utf8PathBuf)) {
    let (_tmp, root) = config_dir;
    let missing = root.join("absent.toml");
    let _guard = EnvGuard::set_vars(&[
        ("SSHRC_CONFIG_PATH", ""),
        ("SSHRC_SSH_PORT", ""),
        ("SSHRC_SSH_USER", ""),
        ("SSHRC_WORKSPACE_ROOT", ""),
        ("XDG_CONFIG_HOME", missing.as_str()),
    ])
    .await;

    let config = SshrcConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("defaults should load: {err}"));

    assert_eq!(config.ssh_port, 22);
    assert_eq!(config.ssh_user, "root");
    assert_eq!(config.workspace_root, "/tmp/sshrc");
    assert_eq!(config.monitor_log_file, "/var/log/ssh-monitor.log");
    assert_eq!(config.term, "xterm");
    assert_eq!(config.validate(), Ok(()));
}

#[rstest]
#[tokio::test]
async fn environment_overrides_defaults(config_dir: (TempDir, Utf8PathBuf)) {
    let (_tmp, root) = config_dir;
    let missing = root.join("absent.toml");
    let _guard = EnvGuard::set_vars(&[
        ("SSHRC_CONFIG_PATH", ""),
        ("SSHRC_SSH_PORT", "2200"),
        ("SSHRC_SSH_USER", "deploy"),
        ("SSHRC_WORKSPACE_ROOT", "/var/tmp/sshrc"),
        ("XDG_CONFIG_HOME", missing.as_str()),
    ])
    .await;

    let config = SshrcConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("environment should load: {err}"));

    assert_eq!(config.ssh_port, 2200);
    assert_eq!(config.ssh_user, "deploy");
    let workspace = config
        .workspace()
        .unwrap_or_else(|err| panic!("workspace should resolve: {err}"));
    assert_eq!(workspace.monitor_script().as_str(), "/var/tmp/sshrc/ssh-mon.bash");
}

#[rstest]
#[tokio::test]
async fn config_file_named_by_environment_is_loaded(config_dir: (TempDir, Utf8PathBuf)) {
    let (_tmp, root) = config_dir;
    let dir = Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"));
    dir.write(
        "sshrc.toml",
        "ssh_user = \"ops\"\nmonitor_poll_interval_secs = 5\nhelpers_dir = \"/srv/helpers\"\n",
    )
    .unwrap_or_else(|err| panic!("write config: {err}"));
    let path = root.join("sshrc.toml");
    let _guard = EnvGuard::set_vars(&[
        ("SSHRC_CONFIG_PATH", path.as_str()),
        ("SSHRC_SSH_PORT", ""),
        ("SSHRC_SSH_USER", ""),
        ("SSHRC_WORKSPACE_ROOT", ""),
    ])
    .await;

    let config = SshrcConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config file should load: {err}"));

    assert_eq!(config.ssh_user, "ops");
    assert_eq!(config.monitor_poll_interval_secs, 5);
    assert_eq!(
        config.helpers_dir(),
        (Utf8PathBuf::from("/srv/helpers"), true)
    );
}

#[rstest]
#[tokio::test]
async fn identity_file_expands_tilde(config_dir: (TempDir, Utf8PathBuf)) {
    let (_tmp, root) = config_dir;
    let _guard = EnvGuard::set_vars(&[("HOME", root.as_str())]).await;

    let config = SshrcConfig {
        ssh_identity_file: Some(String::from("~/.ssh/id_ed25519")),
        ..base_config()
    };

    assert_eq!(
        config.ssh_settings("example.net").identity_file,
        Some(format!("{root}/.ssh/id_ed25519"))
    );
}

#[test]
fn validation_errors_are_actionable() {
    let config = SshrcConfig {
        control_persist_secs: 0,
        ..base_config()
    };

    let error = config.validate().expect_err("zero lifetime should fail");
    let ConfigError::Invalid(ref message) = error else {
        panic!("expected Invalid error, got {error:?}");
    };
    assert!(
        message.contains("SSHRC_CONTROL_PERSIST_SECS"),
        "error should mention env var: {message}"
    );
    assert!(
        message.contains("control_persist_secs to sshrc.toml"),
        "error should mention TOML key: {message}"
    );
}

fn base_config() -> SshrcConfig {
    SshrcConfig {
        ssh_bin: String::from("ssh"),
        ssh_port: 22,
        ssh_user: String::from("root"),
        ssh_identity_file: None,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        connect_timeout_secs: 10,
        control_persist_secs: 30,
        workspace_root: String::from("/tmp/sshrc"),
        helpers_dir: None,
        monitor_poll_interval_secs: 2,
        monitor_log_file: String::from("/var/log/ssh-monitor.log"),
        term: String::from("xterm"),
    }
}
