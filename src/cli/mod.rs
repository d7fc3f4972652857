//! Command-line interface definitions for the `sshrc` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `sshrc` binary.
///
/// Flags override values loaded from `sshrc.toml` and `SSHRC_*` variables.
#[derive(Debug, Parser)]
#[command(
    name = "sshrc",
    version,
    about = "Connect over SSH with temporary helper scripts and shell configuration that clean themselves up",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Remote host name or address.
    #[arg(short = 'H', long, value_name = "HOST")]
    pub(crate) host: String,
    /// Remote SSH port [default: 22].
    #[arg(short, long, value_name = "PORT")]
    pub(crate) port: Option<u16>,
    /// Remote user [default: root].
    #[arg(short, long, value_name = "USER")]
    pub(crate) user: Option<String>,
    /// Private key used for authentication [default: ~/.ssh/id_rsa].
    #[arg(short, long, value_name = "PATH")]
    pub(crate) key: Option<String>,
    /// Local directory whose files are deployed as helpers [default: ./helpers].
    ///
    /// When given explicitly the directory must exist. The implicit default
    /// falls back to a plain session when it is missing or empty.
    #[arg(short = 'd', long = "helpers", value_name = "DIR")]
    pub(crate) helpers: Option<String>,
    /// Deploy only the session monitor and open a plain shell.
    #[arg(short, long)]
    pub(crate) monitor_only: bool,
    /// Local rc file; lines from its `# HELPERS` marker onward are added to
    /// the remote configuration.
    #[arg(long, value_name = "PATH")]
    pub(crate) local_rc: Option<String>,
    /// Log debug details of every step.
    #[arg(short, long)]
    pub(crate) verbose: bool,
}
