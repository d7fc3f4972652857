//! `ssh` client adapter multiplexing every remote command over one
//! `ControlMaster` connection.

use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use super::{
    CommandOutput, CommandRunner, ExecError, PtyRequest, RemoteCommandOutput, RemoteExecutor,
    SSH_TRANSPORT_FAILURE,
};
use crate::util::expand_tilde;

/// Connection settings for the system `ssh` client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Remote host name or address.
    pub host: String,
    /// Remote SSH port.
    pub port: u16,
    /// Remote user to log in as.
    pub user: String,
    /// Private key used for authentication; `~/` is expanded.
    pub identity_file: Option<String>,
    /// Whether to disable interactive password prompts.
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; blank leaves the client default.
    pub known_hosts_file: String,
    /// Upper bound on connection establishment.
    pub connect_timeout: Duration,
    /// How long the master lingers once no session uses it.
    pub control_persist: Duration,
}

impl SshSettings {
    /// Returns the `user@host` destination.
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn common_options(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(self.port.to_string())];

        if let Some(ref identity_file) = self.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.connect_timeout.as_secs().max(1)
        )));
        args
    }
}

/// An authenticated, multiplexed SSH connection.
///
/// Opening the connection starts a backgrounded master process; every
/// execution then reuses its control socket. The connection is closed exactly
/// once, either explicitly through [`SshConnection::close`] or on drop.
#[derive(Debug)]
pub struct SshConnection<R: CommandRunner> {
    settings: SshSettings,
    runner: R,
    control_path: Utf8PathBuf,
    closed: AtomicBool,
}

impl<R: CommandRunner> SshConnection<R> {
    /// Authenticates against the remote host and starts the control master.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if `ssh` cannot be started and
    /// [`ExecError::Connect`] if the connection or authentication fails.
    pub fn open(settings: SshSettings, runner: R) -> Result<Self, ExecError> {
        let control_path = default_control_path();
        Self::open_with_control_path(settings, runner, control_path)
    }

    /// Like [`SshConnection::open`], with an explicit local control socket.
    ///
    /// # Errors
    ///
    /// See [`SshConnection::open`].
    pub fn open_with_control_path(
        settings: SshSettings,
        runner: R,
        control_path: Utf8PathBuf,
    ) -> Result<Self, ExecError> {
        let connection = Self {
            settings,
            runner,
            control_path,
            closed: AtomicBool::new(false),
        };

        let args = connection.master_args();
        tracing::debug!(remote = %connection.settings.target(), control_path = %connection.control_path, "opening ssh control master");
        let output = connection.runner.run(&connection.settings.ssh_bin, &args)?;
        if !output.is_success() {
            // Nothing to tear down: the master never came up.
            connection.closed.store(true, Ordering::SeqCst);
            return Err(ExecError::Connect {
                target: connection.settings.target(),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        Ok(connection)
    }

    /// Returns the settings the connection was opened with.
    #[must_use]
    pub const fn settings(&self) -> &SshSettings {
        &self.settings
    }

    /// Returns the local control socket path.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    /// Returns `true` once the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the control master. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let args = vec![
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-O"),
            OsString::from("exit"),
            OsString::from(self.settings.target()),
        ];
        match self.runner.run(&self.settings.ssh_bin, &args) {
            Ok(output) if output.is_success() => {
                tracing::debug!(remote = %self.settings.target(), "ssh control master stopped");
            }
            Ok(output) => {
                tracing::debug!(stderr = %output.stderr.trim(), "ssh control master already gone");
            }
            Err(err) => tracing::warn!(error = %err, "failed to stop ssh control master"),
        }
    }

    /// Asks the control master whether it is still running.
    ///
    /// A remote shell may itself exit 255, so a 255 from an attached session
    /// is only a transport fault once the master has gone away.
    fn master_alive(&self) -> bool {
        let args = vec![
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-O"),
            OsString::from("check"),
            OsString::from(self.settings.target()),
        ];
        match self.runner.run(&self.settings.ssh_bin, &args) {
            Ok(output) => output.is_success(),
            Err(err) => {
                tracing::debug!(error = %err, "ssh control master check failed");
                false
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ExecError> {
        if self.is_closed() {
            return Err(ExecError::Closed);
        }
        Ok(())
    }

    fn master_args(&self) -> Vec<OsString> {
        let mut args = self.settings.common_options();
        args.extend([
            OsString::from("-M"),
            OsString::from("-N"),
            OsString::from("-f"),
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-o"),
            OsString::from(format!(
                "ControlPersist={}s",
                self.settings.control_persist.as_secs().max(1)
            )),
            OsString::from(self.settings.target()),
        ]);
        args
    }

    fn session_args(&self, tty: bool) -> Vec<OsString> {
        let mut args = self.settings.common_options();
        args.extend([
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-o"),
            OsString::from("ControlMaster=no"),
            OsString::from(if tty { "-tt" } else { "-T" }),
            OsString::from(self.settings.target()),
        ]);
        args
    }

    fn remote_output(output: CommandOutput) -> Result<RemoteCommandOutput, ExecError> {
        if output.code == Some(SSH_TRANSPORT_FAILURE) {
            return Err(ExecError::Transport {
                stderr: output.stderr.trim().to_owned(),
            });
        }

        Ok(RemoteCommandOutput {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

impl<R: CommandRunner> RemoteExecutor for SshConnection<R> {
    fn execute(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<RemoteCommandOutput, ExecError> {
        self.ensure_open()?;
        let mut args = self.session_args(false);
        args.push(OsString::from(command));

        let output = match stdin {
            Some(input) => self
                .runner
                .run_with_input(&self.settings.ssh_bin, &args, input)?,
            None => self.runner.run(&self.settings.ssh_bin, &args)?,
        };
        Self::remote_output(output)
    }

    fn run_interactive(
        &self,
        pty: &PtyRequest,
        command: Option<&str>,
    ) -> Result<Option<i32>, ExecError> {
        self.ensure_open()?;
        let mut args = self.session_args(true);
        // The window size is set remotely because ssh sends 0x0 when local
        // stdin is not a terminal.
        let remote_command = command.unwrap_or(LOGIN_SHELL);
        args.push(OsString::from(format!(
            "stty rows {} cols {} 2>/dev/null; {remote_command}",
            pty.rows, pty.cols
        )));

        // ssh advertises the local TERM in its pty request.
        let env = [("TERM", pty.term.as_str())];
        let code = self
            .runner
            .run_attached(&self.settings.ssh_bin, &args, &env)?;
        if code == Some(SSH_TRANSPORT_FAILURE) && !self.master_alive() {
            return Err(ExecError::Transport {
                stderr: String::from("interactive session lost its connection"),
            });
        }
        Ok(code)
    }
}

impl<R: CommandRunner> Drop for SshConnection<R> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remote command for sessions without a composed configuration.
const LOGIN_SHELL: &str = "exec \"$SHELL\" -l";

fn default_control_path() -> Utf8PathBuf {
    let name = format!("sshrc-{}.sock", Uuid::new_v4().simple());
    let temp = std::env::temp_dir();
    Utf8PathBuf::from_path_buf(temp)
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
        .join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};

    #[fixture]
    fn settings() -> SshSettings {
        SshSettings {
            ssh_bin: String::from("ssh"),
            host: String::from("example.net"),
            port: 2222,
            user: String::from("deploy"),
            identity_file: Some(String::from("/keys/id_rsa")),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            connect_timeout: Duration::from_secs(10),
            control_persist: Duration::from_secs(30),
        }
    }

    fn open(settings: SshSettings, runner: &ScriptedRunner) -> SshConnection<ScriptedRunner> {
        runner.push_success();
        SshConnection::open_with_control_path(
            settings,
            runner.clone(),
            Utf8PathBuf::from("/tmp/ctl.sock"),
        )
        .expect("master should start")
    }

    #[rstest]
    fn open_starts_backgrounded_master(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);

        let invocations = runner.invocations();
        let master = invocations.first().expect("master invocation");
        assert_eq!(master.program, "ssh");
        assert_eq!(
            master.command_string(),
            concat!(
                "ssh -p 2222 -i /keys/id_rsa -o BatchMode=yes -o StrictHostKeyChecking=no ",
                "-o UserKnownHostsFile=/dev/null -o ConnectTimeout=10 -M -N -f ",
                "-S /tmp/ctl.sock -o ControlPersist=30s deploy@example.net"
            )
        );
        assert!(!connection.is_closed());
        runner.push_success();
    }

    #[rstest]
    fn open_failure_reports_connect_error(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(255), "", "Permission denied (publickey).\n");

        let err = SshConnection::open_with_control_path(
            settings,
            runner.clone(),
            Utf8PathBuf::from("/tmp/ctl.sock"),
        )
        .expect_err("authentication failure should surface");

        assert_eq!(
            err,
            ExecError::Connect {
                target: String::from("deploy@example.net"),
                stderr: String::from("Permission denied (publickey)."),
            }
        );
        assert_eq!(runner.invocations().len(), 1, "no exit request after failure");
    }

    #[rstest]
    fn execute_reuses_control_socket_and_streams_input(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_output(Some(0), "ok", "");

        let output = connection
            .execute("cat > /tmp/sshrc/x", Some(b"payload"))
            .expect("command should run");

        assert_eq!(output.stdout, "ok");
        let invocations = runner.invocations();
        let exec = invocations.get(1).expect("execution invocation");
        let rendered = exec.command_string();
        assert!(rendered.contains("-S /tmp/ctl.sock -o ControlMaster=no -T deploy@example.net"));
        assert!(rendered.ends_with("cat > /tmp/sshrc/x"));
        assert_eq!(exec.stdin.as_deref(), Some(b"payload".as_slice()));
        runner.push_success();
    }

    #[rstest]
    fn exit_status_255_is_a_transport_fault(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_output(Some(255), "", "Connection reset by peer\n");

        let err = connection
            .execute("true", None)
            .expect_err("transport failure should surface");

        assert_eq!(
            err,
            ExecError::Transport {
                stderr: String::from("Connection reset by peer"),
            }
        );
        runner.push_success();
    }

    #[rstest]
    fn non_zero_exit_is_reported_in_output(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_output(Some(1), "", "no such file");

        let output = connection.execute("false", None).expect("output");
        assert_eq!(output.exit_code, Some(1));

        runner.push_output(Some(1), "", "no such file");
        let err = connection
            .execute_checked("false", None)
            .expect_err("checked execution should fail");
        assert!(matches!(err, ExecError::CommandFailure { status: Some(1), .. }));
        runner.push_success();
    }

    #[rstest]
    fn interactive_session_requests_tty_and_term(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_exit_code(130);

        let pty = PtyRequest::new("xterm-256color", Some((132, 43)));
        let code = connection
            .run_interactive(&pty, Some("exec bash -i"))
            .expect("session should run");

        assert_eq!(code, Some(130));
        let invocations = runner.invocations();
        let session = invocations.get(1).expect("session invocation");
        let rendered = session.command_string();
        assert!(rendered.contains("-tt deploy@example.net"));
        assert!(rendered.ends_with("stty rows 43 cols 132 2>/dev/null; exec bash -i"));
        assert_eq!(
            session.env,
            vec![(String::from("TERM"), String::from("xterm-256color"))]
        );
        runner.push_success();
    }

    #[rstest]
    fn plain_session_still_sets_window_size(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_exit_code(0);

        let pty = PtyRequest::new("xterm", None);
        let code = connection
            .run_interactive(&pty, None)
            .expect("session should run");

        assert_eq!(code, Some(0));
        let invocations = runner.invocations();
        let session = invocations.get(1).expect("session invocation");
        let last = session.args.last().expect("remote command");
        assert_eq!(
            last.to_string_lossy(),
            "stty rows 24 cols 80 2>/dev/null; exec \"$SHELL\" -l"
        );
        runner.push_success();
    }

    #[rstest]
    fn remote_exit_255_with_live_master_is_clean(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_exit_code(255);
        runner.push_success();

        let pty = PtyRequest::new("xterm", None);
        let code = connection
            .run_interactive(&pty, Some("exec bash -i"))
            .expect("a shell exiting 255 is a clean outcome");

        assert_eq!(code, Some(255));
        let invocations = runner.invocations();
        let check = invocations.get(2).expect("master check invocation");
        assert_eq!(
            check.command_string(),
            "ssh -S /tmp/ctl.sock -O check deploy@example.net"
        );
        runner.push_success();
    }

    #[rstest]
    fn exit_255_with_dead_master_is_a_transport_fault(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_exit_code(255);
        runner.push_output(Some(255), "", "Control socket connect: No such file\n");

        let pty = PtyRequest::new("xterm", None);
        let err = connection
            .run_interactive(&pty, Some("exec bash -i"))
            .expect_err("lost connection should surface");

        assert!(matches!(err, ExecError::Transport { .. }));
        runner.push_success();
    }

    #[rstest]
    fn close_runs_exit_once(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_success();

        connection.close();
        connection.close();
        drop(connection);

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 2);
        let exit = invocations.get(1).expect("exit invocation");
        assert_eq!(
            exit.command_string(),
            "ssh -S /tmp/ctl.sock -O exit deploy@example.net"
        );
    }

    #[rstest]
    fn commands_after_close_are_rejected(settings: SshSettings) {
        let runner = ScriptedRunner::new();
        let connection = open(settings, &runner);
        runner.push_success();
        connection.close();

        assert_eq!(connection.execute("true", None), Err(ExecError::Closed));
    }
}
