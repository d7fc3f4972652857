//! Binary entry point for the sshrc CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;

use sshrc::telemetry::init_tracing;
use sshrc::util::expand_tilde;
use sshrc::{
    BootstrapOptions, ConfigError, CrosstermTerminal, ExecError, Orchestrator, OrchestratorError,
    ProcessCommandRunner, SessionOutcome, SshConnection, SshrcConfig,
};

mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("connection failed: {0}")]
    Connect(#[from] ExecError),
    #[error(transparent)]
    Session(#[from] OrchestratorError),
    #[error("interrupted; connection closed")]
    Interrupted,
    #[error("background task failed: {0}")]
    Task(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let telemetry = init_tracing(if cli.verbose { "debug" } else { "info" });

    let exit_code = match run(&cli).await {
        Ok(outcome) => {
            tracing::debug!(
                exit_code = ?outcome.exit_code,
                composed = outcome.used_composed_config,
                "session finished"
            );
            0
        }
        Err(err) => {
            report_error(&err);
            1
        }
    };

    drop(telemetry);
    process::exit(exit_code);
}

async fn run(cli: &Cli) -> Result<SessionOutcome, CliError> {
    let mut config = SshrcConfig::load_without_cli_args()?;
    apply_overrides(&mut config, cli);
    config.validate()?;

    let workspace = config.workspace()?;
    let monitor = config.monitor_script(workspace.clone());
    let options = bootstrap_options(&config, cli);
    let settings = config.ssh_settings(&cli.host);
    let term = config.term;

    tracing::info!(remote = %settings.target(), port = settings.port, "connecting");
    let opening = tokio::task::spawn_blocking(move || {
        SshConnection::open(settings, ProcessCommandRunner)
    });
    let connection = tokio::select! {
        joined = opening => {
            let opened = joined.map_err(|err| CliError::Task(err.to_string()))?;
            Arc::new(opened?)
        }
        _ = tokio::signal::ctrl_c() => return Err(CliError::Interrupted),
    };
    tracing::info!(control_path = %connection.control_path(), "connection established");

    let session = {
        let shared = Arc::clone(&connection);
        tokio::task::spawn_blocking(move || {
            let terminal = CrosstermTerminal;
            Orchestrator::new(&*shared, &terminal, &workspace, &monitor, &term).run(&options)
        })
    };

    let result = tokio::select! {
        joined = session => match joined {
            Ok(outcome) => outcome.map_err(CliError::from),
            Err(err) => Err(CliError::Task(err.to_string())),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received; closing connection");
            Err(CliError::Interrupted)
        }
    };

    connection.close();
    result
}

fn apply_overrides(config: &mut SshrcConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.ssh_port = port;
    }
    if let Some(user) = &cli.user {
        config.ssh_user.clone_from(user);
    }
    if let Some(key) = &cli.key {
        config.ssh_identity_file = Some(key.clone());
    }
    if let Some(helpers) = &cli.helpers {
        config.helpers_dir = Some(helpers.clone());
    }
}

fn bootstrap_options(config: &SshrcConfig, cli: &Cli) -> BootstrapOptions {
    let (helpers_dir, require_helpers) = config.helpers_dir();
    BootstrapOptions {
        helpers_dir,
        require_helpers,
        local_rc: cli
            .local_rc
            .as_deref()
            .map(|path| Utf8PathBuf::from(expand_tilde(path))),
        monitor_only: cli.monitor_only,
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
