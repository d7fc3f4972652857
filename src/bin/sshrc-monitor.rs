//! Native session monitor for sshrc.
//!
//! Watches a terminal device until the session ends, then restores shell
//! configuration backups and removes the sshrc workspace.

use std::env;
use std::process;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use sshrc::monitor::{DEFAULT_LOG_FILE, LocalHost, Monitor, MonitorSettings, SystemClock};
use sshrc::telemetry::init_file_tracing;
use sshrc::workspace::{DEFAULT_WORKSPACE_ROOT, RemoteWorkspace};
use sshrc::ProcessCommandRunner;

#[derive(Debug, Parser)]
#[command(
    name = "sshrc-monitor",
    version,
    about = "Restore the host once an sshrc session's terminal goes away"
)]
struct Cli {
    /// Terminal device to watch [default: $SSH_TTY].
    #[arg(value_name = "TTY")]
    tty: Option<String>,
    /// Workspace removed when the session ends.
    #[arg(long, default_value = DEFAULT_WORKSPACE_ROOT)]
    workspace: String,
    /// Seconds between two polls.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_secs: u64,
    /// File receiving the monitor log.
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: String,
    /// Home directory holding the shell configuration files.
    #[arg(long, env = "HOME", hide_env_values = true)]
    home: String,
    /// User whose shells are tracked.
    #[arg(long, env = "USER", hide_env_values = true)]
    user: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let telemetry = init_file_tracing("info", &Utf8PathBuf::from(&cli.log_file));

    let exit_code = run(cli).await;

    drop(telemetry);
    process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let workspace = match RemoteWorkspace::new(cli.workspace.as_str()) {
        Ok(workspace) => workspace,
        Err(err) => {
            tracing::error!("{err}");
            return 1;
        }
    };
    let settings = MonitorSettings {
        workspace,
        home: Utf8PathBuf::from(cli.home),
        user: cli.user,
        poll_interval: Duration::from_secs(cli.poll_interval_secs),
    };

    let ssh_tty = env::var("SSH_TTY").ok();
    let mut monitor = Monitor::new(settings, LocalHost::new(ProcessCommandRunner), SystemClock);
    // The monitor logs its own start, end and failure lines.
    match monitor.run(cli.tty.as_deref(), ssh_tty.as_deref()).await {
        Ok(end) => {
            if end.restore_failures > 0 {
                tracing::warn!(failures = end.restore_failures, "some restoration steps failed");
            }
            0
        }
        Err(_) => 1,
    }
}
