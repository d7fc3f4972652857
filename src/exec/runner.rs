//! Local process abstraction used to drive the `ssh` client.

use std::ffi::OsString;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use super::ExecError;

/// Result of running a local command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over local command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError>;

    /// Runs `program` while streaming `input` into its standard input.
    ///
    /// Standard input is closed once `input` has been written, or as soon as
    /// writing fails, so the child always observes end-of-input.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started and
    /// [`ExecError::Input`] if the input could not be delivered to a command
    /// that otherwise reported success.
    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        input: &[u8],
    ) -> Result<CommandOutput, ExecError>;

    /// Runs `program` attached to the current standard streams and returns its
    /// exit code once it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started.
    fn run_attached(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(&str, &str)],
    ) -> Result<Option<i32>, ExecError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    fn spawn_error(program: &str, err: &std::io::Error) -> ExecError {
        ExecError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        }
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| Self::spawn_error(program, &err))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        input: &[u8],
    ) -> Result<CommandOutput, ExecError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Self::spawn_error(program, &err))?;

        let stdin = child.stdin.take().ok_or_else(|| ExecError::Input {
            program: program.to_owned(),
            message: String::from("standard input was not captured"),
        })?;

        let (write_result, waited) = thread::scope(|scope| {
            // The pipe is moved into the writer and dropped when it returns,
            // closing the child's stdin on success and failure alike.
            let writer = scope.spawn(move || {
                let mut pipe = stdin;
                pipe.write_all(input)
            });
            let output = child.wait_with_output();
            (writer.join(), output)
        });

        let output = waited.map_err(|err| Self::spawn_error(program, &err))?;
        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        let write_failure = match write_result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(String::from("input writer panicked")),
        };

        match write_failure {
            Some(message) if result.is_success() => Err(ExecError::Input {
                program: program.to_owned(),
                message,
            }),
            Some(message) => {
                tracing::debug!(program, %message, "input stream closed early by failing command");
                Ok(result)
            }
            None => Ok(result),
        }
    }

    fn run_attached(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(&str, &str)],
    ) -> Result<Option<i32>, ExecError> {
        let status = Command::new(program)
            .args(args)
            .envs(env.iter().copied())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|err| Self::spawn_error(program, &err))?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sh(script: &str) -> Vec<OsString> {
        vec![OsString::from("-c"), OsString::from(script)]
    }

    #[rstest]
    fn run_captures_output_and_exit_code() {
        let output = ProcessCommandRunner
            .run("sh", &sh("printf out && printf err 1>&2; exit 7"))
            .expect("command should execute");

        assert_eq!(output.code, Some(7));
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
    }

    #[rstest]
    fn run_with_input_streams_bytes_to_stdin() {
        let output = ProcessCommandRunner
            .run_with_input("sh", &sh("cat"), b"line one\nline two\n")
            .expect("command should execute");

        assert!(output.is_success());
        assert_eq!(output.stdout, "line one\nline two\n");
    }

    #[rstest]
    fn run_with_input_closes_stdin_so_reader_terminates() {
        let output = ProcessCommandRunner
            .run_with_input("sh", &sh("wc -c"), b"12345")
            .expect("command should execute");

        assert_eq!(output.stdout.trim(), "5");
    }

    #[rstest]
    fn run_with_input_reports_failure_status_when_command_ignores_input() {
        let payload = vec![b'x'; 1 << 20];
        let output = ProcessCommandRunner
            .run_with_input("sh", &sh("exit 3"), &payload)
            .expect("failing command should still produce output");

        assert_eq!(output.code, Some(3));
    }

    #[rstest]
    fn missing_binary_returns_spawn_error() {
        let result = ProcessCommandRunner.run("definitely-not-a-real-binary-xyz", &[]);

        match result {
            Err(ExecError::Spawn { .. }) => {}
            other => panic!("expected ExecError::Spawn, got {other:?}"),
        }
    }
}
