//! Session monitor: detects the end of a terminal session and restores the
//! remote host.
//!
//! The monitor runs detached on the remote host, independently of the client.
//! It polls until the owning terminal disappears or no shell is left on it,
//! then restores every shell configuration backup and removes the workspace.
//! It ships in two forms that follow the same state machine: the
//! [`MonitorScript`] rendered as bash and deployed by the client, and the
//! native [`Monitor`] driven by the `sshrc-monitor` binary.
//!
//! ```text
//! Starting -> Polling -> TtyGone     -> Restoring -> Done
//!     |               \-> NoShellLeft -/
//!     \-> Failed
//! ```

use std::fmt;
use std::io;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::shell::ShellVariant;
use crate::workspace::RemoteWorkspace;

mod local;
mod script;

pub use local::LocalHost;
pub use script::MonitorScript;

/// Interval between two polls of the session state.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Log file the monitor appends to.
pub const DEFAULT_LOG_FILE: &str = "/var/log/ssh-monitor.log";

/// Process names counted as an attached shell.
pub const KNOWN_SHELLS: [&str; 3] = ["bash", "sh", "zsh"];

/// Returns `true` when `command` names a known shell, optionally with the
/// `-` prefix of a login shell.
#[must_use]
pub fn is_shell_command(command: &str) -> bool {
    let name = command.strip_prefix('-').unwrap_or(command);
    KNOWN_SHELLS.contains(&name)
}

/// Formats an elapsed duration as `Hh Mm Ss`, dropping leading zero units.
#[must_use]
pub fn format_duration(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total.div_euclid(3600);
    let minutes = total.rem_euclid(3600).div_euclid(60);
    let seconds = total.rem_euclid(60);

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Lifecycle phases of the monitor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorPhase {
    /// Resolving the terminal device.
    Starting,
    /// Waiting for the session to end.
    Polling,
    /// The terminal device disappeared.
    TtyGone,
    /// No shell process is left on the terminal.
    NoShellLeft,
    /// Reverting changes on the host.
    Restoring,
    /// Finished successfully.
    Done,
    /// Stopped before monitoring began.
    Failed,
}

/// Why the monitored session was considered finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndReason {
    /// The terminal device node no longer exists.
    TtyGone,
    /// No shell owned by the user runs on the terminal.
    NoShellLeft,
}

impl EndReason {
    const fn phase(self) -> MonitorPhase {
        match self {
            Self::TtyGone => MonitorPhase::TtyGone,
            Self::NoShellLeft => MonitorPhase::NoShellLeft,
        }
    }
}

/// Working data of a running monitor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MonitorState {
    /// Terminal device path, e.g. `/dev/pts/3`.
    pub device: Utf8PathBuf,
    /// Device path relative to `/dev`, as reported by `ps`.
    pub tty_name: String,
    /// User whose shells are tracked.
    pub user: String,
    /// When monitoring began.
    pub started: SystemTime,
}

/// Outcome of a completed monitoring run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionEnd {
    /// Why the session was considered finished.
    pub reason: EndReason,
    /// Terminal device that was monitored.
    pub device: Utf8PathBuf,
    /// Time between the start of monitoring and detection of the end.
    pub duration: Duration,
    /// Number of restoration actions that failed.
    pub restore_failures: usize,
}

impl SessionEnd {
    /// Returns the single log line describing the end of the session.
    #[must_use]
    pub fn summary(&self) -> String {
        let detail = match self.reason {
            EndReason::TtyGone => format!("TTY device {} no longer exists", self.device),
            EndReason::NoShellLeft => format!("No shell process found on TTY {}", self.device),
        };
        format!(
            "SSH session ended - {detail} (Duration: {})",
            format_duration(self.duration)
        )
    }
}

/// A single best-effort restoration step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RestoreAction {
    /// Move a configuration backup back over the original; a missing backup
    /// is a no-op.
    RestoreBackup {
        /// Backup written before the session.
        backup: Utf8PathBuf,
        /// Configuration file the backup replaces.
        original: Utf8PathBuf,
    },
    /// Recursively remove the workspace.
    RemoveWorkspace {
        /// Workspace root.
        root: Utf8PathBuf,
    },
}

impl fmt::Display for RestoreAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestoreBackup { backup, original } => write!(f, "restore {backup} -> {original}"),
            Self::RemoveWorkspace { root } => write!(f, "remove {root}"),
        }
    }
}

/// Host queries and mutations the monitor depends on.
pub trait HostProbe {
    /// Returns `true` while the terminal device node exists.
    fn device_exists(&self, device: &Utf8Path) -> bool;

    /// Returns `true` while a shell owned by `user` runs on `tty_name`.
    fn shell_attached(&self, tty_name: &str, user: &str) -> bool;

    /// Performs one restoration step.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the step fails.
    fn perform(&self, action: &RestoreAction) -> io::Result<()>;
}

/// Source of wall-clock time.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> SystemTime;
}

/// [`Clock`] backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Errors that stop the monitor before it starts polling.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MonitorError {
    /// Raised when neither an explicit device nor `SSH_TTY` is available.
    #[error("No TTY specified and SSH_TTY not set")]
    NoDevice,
}

/// Static configuration of a monitor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MonitorSettings {
    /// Workspace removed once the session ends.
    pub workspace: RemoteWorkspace,
    /// Home directory holding the shell configuration files.
    pub home: Utf8PathBuf,
    /// User whose shells are tracked.
    pub user: String,
    /// Interval between polls.
    pub poll_interval: Duration,
}

impl MonitorSettings {
    /// Returns the restoration steps, one per shell variant followed by the
    /// workspace removal.
    #[must_use]
    pub fn restore_plan(&self) -> Vec<RestoreAction> {
        let mut plan: Vec<RestoreAction> = ShellVariant::ALL
            .iter()
            .map(|variant| RestoreAction::RestoreBackup {
                backup: self.home.join(variant.backup_file_name()),
                original: self.home.join(variant.rc_file_name()),
            })
            .collect();
        plan.push(RestoreAction::RemoveWorkspace {
            root: self.workspace.root().to_owned(),
        });
        plan
    }
}

/// Native implementation of the monitor state machine.
#[derive(Debug)]
pub struct Monitor<P: HostProbe, C: Clock> {
    settings: MonitorSettings,
    probe: P,
    clock: C,
    history: Vec<MonitorPhase>,
}

impl<P: HostProbe, C: Clock> Monitor<P, C> {
    /// Creates a monitor that has not yet started.
    #[must_use]
    pub const fn new(settings: MonitorSettings, probe: P, clock: C) -> Self {
        Self {
            settings,
            probe,
            clock,
            history: Vec::new(),
        }
    }

    /// Returns the phases visited so far, in order.
    #[must_use]
    pub fn history(&self) -> &[MonitorPhase] {
        &self.history
    }

    /// Resolves the terminal device from the explicit argument, falling back
    /// to `ssh_tty`. Blank values count as absent.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::NoDevice`] when neither is set.
    pub fn start(
        &mut self,
        explicit: Option<&str>,
        ssh_tty: Option<&str>,
    ) -> Result<MonitorState, MonitorError> {
        self.history.push(MonitorPhase::Starting);
        let Some(device) = explicit
            .filter(|value| !value.trim().is_empty())
            .or_else(|| ssh_tty.filter(|value| !value.trim().is_empty()))
        else {
            self.history.push(MonitorPhase::Failed);
            tracing::error!("{}", MonitorError::NoDevice);
            return Err(MonitorError::NoDevice);
        };

        let tty_name = device.strip_prefix("/dev/").unwrap_or(device).to_owned();
        let state = MonitorState {
            device: Utf8PathBuf::from(device),
            tty_name,
            user: self.settings.user.clone(),
            started: self.clock.now(),
        };
        tracing::info!(
            "Started monitoring SSH session for user {} on TTY {}",
            state.user,
            state.device
        );
        Ok(state)
    }

    /// Runs the monitor to completion: start, poll, restore.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::NoDevice`] when no terminal device is known;
    /// nothing is restored in that case.
    pub async fn run(
        &mut self,
        explicit: Option<&str>,
        ssh_tty: Option<&str>,
    ) -> Result<SessionEnd, MonitorError> {
        let state = self.start(explicit, ssh_tty)?;
        let reason = self.poll(&state).await;
        self.history.push(reason.phase());

        let duration = self
            .clock
            .now()
            .duration_since(state.started)
            .unwrap_or_default();
        let restore_failures = self.restore();

        let end = SessionEnd {
            reason,
            device: state.device,
            duration,
            restore_failures,
        };
        tracing::info!("{}", end.summary());
        self.history.push(MonitorPhase::Done);
        Ok(end)
    }

    async fn poll(&mut self, state: &MonitorState) -> EndReason {
        self.history.push(MonitorPhase::Polling);
        loop {
            if !self.probe.device_exists(&state.device) {
                return EndReason::TtyGone;
            }
            if !self.probe.shell_attached(&state.tty_name, &state.user) {
                return EndReason::NoShellLeft;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    fn restore(&mut self) -> usize {
        self.history.push(MonitorPhase::Restoring);
        let mut failures = 0;
        for action in self.settings.restore_plan() {
            match self.probe.perform(&action) {
                Ok(()) => tracing::debug!(%action, "restoration step done"),
                Err(err) => {
                    failures += 1;
                    tracing::warn!(%action, error = %err, "restoration step failed");
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::cell::RefCell;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeHost {
        device_checks: RefCell<VecDeque<bool>>,
        shell_checks: RefCell<VecDeque<bool>>,
        failing: Option<Utf8PathBuf>,
        performed: RefCell<Vec<RestoreAction>>,
    }

    impl FakeHost {
        fn with_checks(device: &[bool], shell: &[bool]) -> Self {
            Self {
                device_checks: RefCell::new(device.iter().copied().collect()),
                shell_checks: RefCell::new(shell.iter().copied().collect()),
                ..Self::default()
            }
        }
    }

    impl HostProbe for &FakeHost {
        fn device_exists(&self, _device: &Utf8Path) -> bool {
            self.device_checks.borrow_mut().pop_front().unwrap_or(false)
        }

        fn shell_attached(&self, _tty_name: &str, _user: &str) -> bool {
            self.shell_checks.borrow_mut().pop_front().unwrap_or(false)
        }

        fn perform(&self, action: &RestoreAction) -> io::Result<()> {
            self.performed.borrow_mut().push(action.clone());
            let fails = match action {
                RestoreAction::RestoreBackup { backup, .. } => self.failing.as_ref() == Some(backup),
                RestoreAction::RemoveWorkspace { root } => self.failing.as_ref() == Some(root),
            };
            if fails {
                return Err(io::Error::other("permission denied"));
            }
            Ok(())
        }
    }

    struct SteppingClock {
        times: RefCell<VecDeque<SystemTime>>,
    }

    impl SteppingClock {
        fn new(offsets: &[u64]) -> Self {
            Self {
                times: RefCell::new(
                    offsets
                        .iter()
                        .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(*secs))
                        .collect(),
                ),
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> SystemTime {
            let mut times = self.times.borrow_mut();
            if times.len() > 1 {
                times.pop_front().unwrap_or(SystemTime::UNIX_EPOCH)
            } else {
                times.front().copied().unwrap_or(SystemTime::UNIX_EPOCH)
            }
        }
    }

    #[fixture]
    fn settings() -> MonitorSettings {
        MonitorSettings {
            workspace: RemoteWorkspace::default(),
            home: Utf8PathBuf::from("/home/alice"),
            user: String::from("alice"),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[rstest]
    #[case(0, "0s")]
    #[case(59, "59s")]
    #[case(61, "1m 1s")]
    #[case(3600, "1h 0m 0s")]
    #[case(3723, "1h 2m 3s")]
    fn durations_drop_leading_zero_units(#[case] secs: u64, #[case] expected: &str) {
        assert_eq!(format_duration(Duration::from_secs(secs)), expected);
    }

    #[rstest]
    #[case("bash", true)]
    #[case("-bash", true)]
    #[case("-zsh", true)]
    #[case("sh", true)]
    #[case("sshd", false)]
    #[case("fish", false)]
    fn shell_commands_are_recognised(#[case] command: &str, #[case] expected: bool) {
        assert_eq!(is_shell_command(command), expected);
    }

    #[rstest]
    #[tokio::test]
    async fn device_removal_ends_session_and_restores(settings: MonitorSettings) {
        let host = FakeHost::with_checks(&[true, true, false], &[true, true]);
        let clock = SteppingClock::new(&[100, 165]);
        let mut monitor = Monitor::new(settings, &host, clock);

        let end = monitor
            .run(Some("/dev/pts/3"), None)
            .await
            .expect("monitor should finish");

        assert_eq!(end.reason, EndReason::TtyGone);
        assert_eq!(end.duration, Duration::from_secs(65));
        assert_eq!(end.restore_failures, 0);
        assert_eq!(
            end.summary(),
            "SSH session ended - TTY device /dev/pts/3 no longer exists (Duration: 1m 5s)"
        );
        assert_eq!(
            monitor.history(),
            [
                MonitorPhase::Starting,
                MonitorPhase::Polling,
                MonitorPhase::TtyGone,
                MonitorPhase::Restoring,
                MonitorPhase::Done,
            ]
        );
        assert_eq!(
            *host.performed.borrow(),
            vec![
                RestoreAction::RestoreBackup {
                    backup: Utf8PathBuf::from("/home/alice/.bashrc.sshrc_backup"),
                    original: Utf8PathBuf::from("/home/alice/.bashrc"),
                },
                RestoreAction::RestoreBackup {
                    backup: Utf8PathBuf::from("/home/alice/.zshrc.sshrc_backup"),
                    original: Utf8PathBuf::from("/home/alice/.zshrc"),
                },
                RestoreAction::RemoveWorkspace {
                    root: Utf8PathBuf::from("/tmp/sshrc"),
                },
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn missing_shell_ends_session(settings: MonitorSettings) {
        let host = FakeHost::with_checks(&[true, true], &[true, false]);
        let mut monitor = Monitor::new(settings, &host, SteppingClock::new(&[0]));

        let end = monitor
            .run(None, Some("/dev/pts/7"))
            .await
            .expect("monitor should finish");

        assert_eq!(end.reason, EndReason::NoShellLeft);
        assert_eq!(end.device, "/dev/pts/7");
        assert!(monitor.history().contains(&MonitorPhase::NoShellLeft));
    }

    #[rstest]
    #[tokio::test]
    async fn failed_restoration_steps_do_not_block_later_ones(settings: MonitorSettings) {
        let host = FakeHost {
            failing: Some(Utf8PathBuf::from("/home/alice/.bashrc.sshrc_backup")),
            ..FakeHost::default()
        };
        let mut monitor = Monitor::new(settings, &host, SteppingClock::new(&[0]));

        let end = monitor
            .run(Some("/dev/pts/1"), None)
            .await
            .expect("monitor should finish");

        assert_eq!(end.restore_failures, 1);
        assert_eq!(host.performed.borrow().len(), 3);
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some(""), Some("  "))]
    #[tokio::test]
    async fn missing_device_fails_without_restoring(
        settings: MonitorSettings,
        #[case] explicit: Option<&str>,
        #[case] ssh_tty: Option<&str>,
    ) {
        let host = FakeHost::default();
        let mut monitor = Monitor::new(settings, &host, SystemClock);

        let err = monitor
            .run(explicit, ssh_tty)
            .await
            .expect_err("no device should fail");

        assert_eq!(err, MonitorError::NoDevice);
        assert_eq!(
            monitor.history(),
            [MonitorPhase::Starting, MonitorPhase::Failed]
        );
        assert!(host.performed.borrow().is_empty());
    }

    #[rstest]
    fn start_derives_tty_name(settings: MonitorSettings) {
        let host = FakeHost::default();
        let mut monitor = Monitor::new(settings, &host, SystemClock);

        let state = monitor
            .start(Some("/dev/pts/12"), Some("/dev/pts/1"))
            .expect("explicit device wins");

        assert_eq!(state.tty_name, "pts/12");
        assert_eq!(state.user, "alice");
    }
}
