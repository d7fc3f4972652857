//! Core library for the sshrc session tool.
//!
//! The crate connects to a remote host over SSH, deploys helper scripts and
//! a composed shell configuration into a temporary workspace, and leaves a
//! detached monitor behind that restores the host once the session ends
//! (connect → deploy → compose → interactive session → cleanup).

pub mod compose;
pub mod config;
pub mod deploy;
pub mod exec;
pub mod monitor;
pub mod orchestrator;
pub mod session;
pub mod shell;
pub mod telemetry;
pub mod test_support;
pub mod util;
pub mod workspace;

pub use compose::{ComposeError, ComposedConfig, EnvironmentComposer, HELPERS_MARKER};
pub use config::{ConfigError, SshrcConfig};
pub use deploy::{DeployError, FileDeployer, HelperFile, discover_helpers};
pub use exec::{
    CommandOutput, CommandRunner, ExecError, ProcessCommandRunner, PtyRequest,
    RemoteCommandOutput, RemoteExecutor, SshConnection, SshSettings,
};
pub use monitor::{
    LocalHost, Monitor, MonitorError, MonitorScript, MonitorSettings, SessionEnd, SystemClock,
};
pub use orchestrator::{BootstrapOptions, Orchestrator, OrchestratorError, SessionPlan};
pub use session::{CrosstermTerminal, SessionDriver, SessionError, SessionOutcome};
pub use shell::{ShellDetector, ShellVariant};
pub use workspace::{RemoteWorkspace, WorkspaceError};
