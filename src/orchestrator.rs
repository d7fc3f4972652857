//! Orchestrates the bootstrap sequence and the interactive session.
//!
//! The sequence is strictly ordered: deploy the monitor, deploy the helpers,
//! detect the remote shell, compose its configuration, then attach the
//! terminal. Any step that leaves nothing to compose falls back to a plain
//! login shell.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::compose::{ComposeError, EnvironmentComposer};
use crate::deploy::{DeployError, EXECUTABLE_MODE, FileDeployer, discover_helpers};
use crate::exec::RemoteExecutor;
use crate::monitor::MonitorScript;
use crate::session::{SessionDriver, SessionError, SessionOutcome, TerminalProvider};
use crate::shell::{ShellDetector, ShellVariant};
use crate::workspace::RemoteWorkspace;

/// What the bootstrap sequence should deploy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapOptions {
    /// Local directory holding the helpers.
    pub helpers_dir: Utf8PathBuf,
    /// Whether a missing helpers directory is an error rather than a reason
    /// to open a plain session.
    pub require_helpers: bool,
    /// Local rc file contributing a fragment to the composed configuration.
    pub local_rc: Option<Utf8PathBuf>,
    /// Deploy only the monitor and open a plain session.
    pub monitor_only: bool,
}

/// Session chosen by [`Orchestrator::prepare`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionPlan {
    /// Start the shell with the composed configuration.
    Composed {
        /// Detected shell variant.
        variant: ShellVariant,
        /// Remote path of the composed configuration.
        config_path: Utf8PathBuf,
        /// Remote paths of the deployed helpers.
        helpers: Vec<Utf8PathBuf>,
    },
    /// Start the plain login shell.
    Plain,
}

/// Errors that abort the bootstrap sequence or the session.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Raised when the monitoring script cannot be deployed.
    #[error("failed to deploy session monitor: {0}")]
    Monitor(#[source] DeployError),
    /// Raised when helpers cannot be read or deployed.
    #[error("failed to deploy helpers: {0}")]
    Helpers(#[source] DeployError),
    /// Raised when the composed configuration cannot be written.
    #[error(transparent)]
    Compose(#[from] ComposeError),
    /// Raised when the interactive session fails.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Drives one connection from bootstrap to the end of the session.
#[derive(Debug)]
pub struct Orchestrator<'a, E: RemoteExecutor, T: TerminalProvider> {
    executor: &'a E,
    terminal: &'a T,
    workspace: &'a RemoteWorkspace,
    monitor: &'a MonitorScript,
    term: &'a str,
}

impl<'a, E: RemoteExecutor, T: TerminalProvider> Orchestrator<'a, E, T> {
    /// Creates an orchestrator deploying into `workspace`.
    #[must_use]
    pub const fn new(
        executor: &'a E,
        terminal: &'a T,
        workspace: &'a RemoteWorkspace,
        monitor: &'a MonitorScript,
        term: &'a str,
    ) -> Self {
        Self {
            executor,
            terminal,
            workspace,
            monitor,
            term,
        }
    }

    /// Runs the bootstrap sequence and returns the session to start.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when a deployment fails, including a
    /// partial helper deployment, or when an explicitly requested helpers
    /// directory is missing.
    pub fn prepare(&self, options: &BootstrapOptions) -> Result<SessionPlan, OrchestratorError> {
        let deployer = FileDeployer::new(self.executor);

        let monitor_path = self.workspace.monitor_script();
        tracing::info!(path = %monitor_path, "deploying session monitor");
        deployer
            .deploy(
                &monitor_path,
                self.monitor.render().as_bytes(),
                EXECUTABLE_MODE,
            )
            .map_err(OrchestratorError::Monitor)?;

        if options.monitor_only {
            tracing::info!("monitor-only mode; skipping helpers");
            return Ok(SessionPlan::Plain);
        }

        let helper_files = match discover_helpers(&options.helpers_dir) {
            Ok(files) => files,
            Err(DeployError::MissingHelpersDir { path }) if !options.require_helpers => {
                tracing::info!(dir = %path, "no helpers directory; starting plain session");
                return Ok(SessionPlan::Plain);
            }
            Err(err) => return Err(OrchestratorError::Helpers(err)),
        };
        if helper_files.is_empty() {
            tracing::info!(dir = %options.helpers_dir, "no helper files found; starting plain session");
            return Ok(SessionPlan::Plain);
        }

        tracing::info!(count = helper_files.len(), dir = %options.helpers_dir, "deploying helpers");
        let helpers = deployer
            .deploy_helpers(self.workspace, &helper_files)
            .map_err(|err| {
                if !err.deployed().is_empty() {
                    tracing::error!(deployed = ?err.deployed(), "helper deployment stopped part-way");
                }
                OrchestratorError::Helpers(err)
            })?;
        for path in &helpers {
            tracing::debug!(path = %path, "helper deployed");
        }

        let variant = ShellDetector::new(self.executor).detect();
        tracing::info!(%variant, "composing shell configuration");

        let names: Vec<String> = helper_files.into_iter().map(|file| file.name).collect();
        let composer = EnvironmentComposer::new(self.executor, self.workspace);
        let config = composer.compose(variant, &names, options.local_rc.as_deref());
        composer.materialize(&config)?;

        Ok(SessionPlan::Composed {
            variant,
            config_path: config.path,
            helpers,
        })
    }

    /// Runs the bootstrap sequence, then the interactive session.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when bootstrapping or the session fails.
    pub fn run(&self, options: &BootstrapOptions) -> Result<SessionOutcome, OrchestratorError> {
        let plan = self.prepare(options)?;
        let driver = SessionDriver::new(self.executor, self.terminal, self.workspace, self.term);
        let outcome = match plan {
            SessionPlan::Composed { variant, .. } => driver.run(variant, true)?,
            SessionPlan::Plain => driver.run(ShellVariant::default(), false)?,
        };
        Ok(outcome)
    }
}
