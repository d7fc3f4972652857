//! Configuration loading via `ortho-config`.
//!
//! [`SshrcConfig`] merges defaults, `sshrc.toml` configuration files and
//! `SSHRC_*` environment variables. Command-line flags are applied on top by
//! the binary.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::exec::SshSettings;
use crate::monitor::{DEFAULT_LOG_FILE, MonitorScript};
use crate::session::DEFAULT_TERM;
use crate::util::expand_tilde;
use crate::workspace::{DEFAULT_WORKSPACE_ROOT, RemoteWorkspace};

/// Identity file used when none is configured.
pub const DEFAULT_IDENTITY_FILE: &str = "~/.ssh/id_rsa";

/// Helpers directory used when none is configured.
pub const DEFAULT_HELPERS_DIR: &str = "./helpers";

/// Client and remote-side settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SSHRC",
    discovery(
        app_name = "sshrc",
        env_var = "SSHRC_CONFIG_PATH",
        config_file_name = "sshrc.toml",
        dotfile_name = ".sshrc.toml",
        project_file_name = "sshrc.toml"
    )
)]
pub struct SshrcConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Private key used for authentication. Supports tilde expansion;
    /// defaults to `~/.ssh/id_rsa`.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Upper bound on connection establishment, in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// How long the control master lingers once unused, in seconds.
    #[ortho_config(default = 30)]
    pub control_persist_secs: u64,
    /// Remote workspace root.
    #[ortho_config(default = DEFAULT_WORKSPACE_ROOT.to_owned())]
    pub workspace_root: String,
    /// Local helpers directory. When unset, `./helpers` is used if present.
    pub helpers_dir: Option<String>,
    /// Interval between monitor polls, in seconds.
    #[ortho_config(default = 2)]
    pub monitor_poll_interval_secs: u64,
    /// Remote log file the monitor appends to.
    #[ortho_config(default = DEFAULT_LOG_FILE.to_owned())]
    pub monitor_log_file: String,
    /// Terminal type advertised for the session.
    #[ortho_config(default = DEFAULT_TERM.to_owned())]
    pub term: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            toml_key,
        }
    }

    fn guidance(&self) -> String {
        format!(
            "set SSHRC_{} or add {} to sshrc.toml",
            self.toml_key.to_uppercase(),
            self.toml_key
        )
    }
}

impl SshrcConfig {
    /// Loads configuration using defaults, configuration files, and
    /// environment variables without parsing the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("sshrc")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_text(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    fn require_optional_text(
        value: Option<&str>,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        value.map_or(Ok(()), |text| Self::require_text(text, metadata))
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that provide each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values and
    /// [`ConfigError::Invalid`] for zero ports or durations and unusable
    /// workspace roots.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_text(
            &self.ssh_bin,
            &FieldMetadata::new("ssh executable", "ssh_bin"),
        )?;
        Self::require_text(&self.ssh_user, &FieldMetadata::new("SSH user", "ssh_user"))?;
        Self::require_optional_text(
            self.ssh_identity_file.as_deref(),
            &FieldMetadata::new("SSH identity file", "ssh_identity_file"),
        )?;
        Self::require_positive(
            u64::from(self.ssh_port),
            &FieldMetadata::new("SSH port", "ssh_port"),
        )?;
        Self::require_positive(
            self.connect_timeout_secs,
            &FieldMetadata::new("connection timeout", "connect_timeout_secs"),
        )?;
        Self::require_positive(
            self.control_persist_secs,
            &FieldMetadata::new("control master lifetime", "control_persist_secs"),
        )?;
        Self::require_text(
            &self.workspace_root,
            &FieldMetadata::new("remote workspace root", "workspace_root"),
        )?;
        self.workspace()?;
        Self::require_optional_text(
            self.helpers_dir.as_deref(),
            &FieldMetadata::new("helpers directory", "helpers_dir"),
        )?;
        Self::require_positive(
            self.monitor_poll_interval_secs,
            &FieldMetadata::new("monitor poll interval", "monitor_poll_interval_secs"),
        )?;
        Self::require_text(
            &self.monitor_log_file,
            &FieldMetadata::new("monitor log file", "monitor_log_file"),
        )?;
        Self::require_text(&self.term, &FieldMetadata::new("terminal type", "term"))?;
        Ok(())
    }

    /// Returns the remote workspace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the root is relative or `/`.
    pub fn workspace(&self) -> Result<RemoteWorkspace, ConfigError> {
        RemoteWorkspace::new(self.workspace_root.trim()).map_err(|err| {
            ConfigError::Invalid(format!(
                "{err}: {}",
                FieldMetadata::new("remote workspace root", "workspace_root").guidance()
            ))
        })
    }

    /// Returns the identity file with `~` expanded, falling back to
    /// [`DEFAULT_IDENTITY_FILE`].
    #[must_use]
    pub fn identity_file(&self) -> String {
        expand_tilde(
            self.ssh_identity_file
                .as_deref()
                .unwrap_or(DEFAULT_IDENTITY_FILE),
        )
    }

    /// Returns the local helpers directory and whether it was set explicitly.
    #[must_use]
    pub fn helpers_dir(&self) -> (Utf8PathBuf, bool) {
        self.helpers_dir.as_deref().map_or_else(
            || (Utf8PathBuf::from(DEFAULT_HELPERS_DIR), false),
            |dir| (Utf8PathBuf::from(expand_tilde(dir)), true),
        )
    }

    /// Builds the `ssh` client settings for `host`.
    #[must_use]
    pub fn ssh_settings(&self, host: &str) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            host: host.to_owned(),
            port: self.ssh_port,
            user: self.ssh_user.clone(),
            identity_file: Some(self.identity_file()),
            batch_mode: self.ssh_batch_mode,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            control_persist: Duration::from_secs(self.control_persist_secs),
        }
    }

    /// Builds the monitor script deployed into `workspace`.
    #[must_use]
    pub fn monitor_script(&self, workspace: RemoteWorkspace) -> MonitorScript {
        MonitorScript::new(workspace)
            .with_log_file(self.monitor_log_file.as_str())
            .with_poll_interval(Duration::from_secs(self.monitor_poll_interval_secs))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
