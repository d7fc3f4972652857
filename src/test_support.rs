//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::rc::Rc;

use tokio::sync::{Mutex, MutexGuard};

use crate::exec::{
    CommandOutput, CommandRunner, ExecError, PtyRequest, RemoteCommandOutput, RemoteExecutor,
};
use crate::session::TerminalProvider;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share their queue and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes streamed to standard input, if any.
    pub stdin: Option<Vec<u8>>,
    /// Extra environment variables for attached runs.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn record(
        &self,
        program: &str,
        args: &[OsString],
        stdin: Option<&[u8]>,
        env: &[(&str, &str)],
    ) -> Result<CommandOutput, ExecError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            stdin: stdin.map(<[u8]>::to_vec),
            env: env
                .iter()
                .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                .collect(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| ExecError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        self.record(program, args, None, &[])
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        input: &[u8],
    ) -> Result<CommandOutput, ExecError> {
        self.record(program, args, Some(input), &[])
    }

    fn run_attached(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(&str, &str)],
    ) -> Result<Option<i32>, ExecError> {
        self.record(program, args, None, env).map(|output| output.code)
    }
}

/// A file written through [`RecordingRemote`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFile {
    /// Bytes streamed into the file.
    pub content: Vec<u8>,
    /// Mode applied with `chmod`, if the command carried one.
    pub mode: Option<u32>,
}

/// One interactive session requested through [`RecordingRemote`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InteractiveCall {
    /// Pseudo-terminal parameters.
    pub pty: PtyRequest,
    /// Remote command, `None` for the login shell.
    pub command: Option<String>,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    outcome: Result<RemoteCommandOutput, ExecError>,
}

#[derive(Debug, Default)]
struct RemoteState {
    executions: Vec<(String, Option<Vec<u8>>)>,
    rules: Vec<Rule>,
    files: BTreeMap<String, RemoteFile>,
    interactive: Vec<InteractiveCall>,
    interactive_outcome: Option<Result<Option<i32>, ExecError>>,
}

/// In-memory [`RemoteExecutor`] that records every command.
///
/// Commands matching a registered pattern (by substring, first match wins)
/// return the scripted outcome. Other commands succeed; deployment commands
/// of the form `mkdir -p D && cat > P && chmod M P` additionally store their
/// input as a file at `P`, so the remote filesystem can be inspected.
#[derive(Debug, Default)]
pub struct RecordingRemote {
    state: RefCell<RemoteState>,
}

impl RecordingRemote {
    /// Creates a remote with no scripted outcomes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands containing `pattern` with the given status and stdout.
    pub fn respond_to(&self, pattern: &str, exit_code: Option<i32>, stdout: &str) {
        self.state.borrow_mut().rules.push(Rule {
            pattern: pattern.to_owned(),
            outcome: Ok(RemoteCommandOutput {
                exit_code,
                stdout: stdout.to_owned(),
                stderr: String::new(),
            }),
        });
    }

    /// Fails commands containing `pattern` with `error`.
    pub fn fail_on(&self, pattern: &str, error: ExecError) {
        self.state.borrow_mut().rules.push(Rule {
            pattern: pattern.to_owned(),
            outcome: Err(error),
        });
    }

    /// Sets the exit status reported by interactive sessions.
    pub fn interactive_exit(&self, code: Option<i32>) {
        self.state.borrow_mut().interactive_outcome = Some(Ok(code));
    }

    /// Makes interactive sessions fail with `error`.
    pub fn fail_interactive(&self, error: ExecError) {
        self.state.borrow_mut().interactive_outcome = Some(Err(error));
    }

    /// Returns every executed command, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state
            .borrow()
            .executions
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    /// Returns every executed command with the bytes streamed into it.
    #[must_use]
    pub fn executions(&self) -> Vec<(String, Option<Vec<u8>>)> {
        self.state.borrow().executions.clone()
    }

    /// Returns every interactive session request, in order.
    #[must_use]
    pub fn interactive_calls(&self) -> Vec<InteractiveCall> {
        self.state.borrow().interactive.clone()
    }

    /// Returns the files written so far, keyed by remote path.
    #[must_use]
    pub fn files(&self) -> BTreeMap<String, RemoteFile> {
        self.state.borrow().files.clone()
    }

    /// Returns the file written at `path`, if any.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<RemoteFile> {
        self.state.borrow().files.get(path).cloned()
    }

    fn record_deployment(state: &mut RemoteState, command: &str, stdin: Option<&[u8]>) {
        let Some((_, rest)) = command.split_once(" && cat > ") else {
            return;
        };
        let (target, mode) = match rest.split_once(" && chmod ") {
            Some((target, chmod)) => (
                target,
                chmod
                    .split_whitespace()
                    .next()
                    .and_then(|mode| u32::from_str_radix(mode, 8).ok()),
            ),
            None => (rest, None),
        };
        state.files.insert(
            unquote(target),
            RemoteFile {
                content: stdin.map(<[u8]>::to_vec).unwrap_or_default(),
                mode,
            },
        );
    }
}

fn unquote(word: &str) -> String {
    word.strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
        .map_or_else(|| word.to_owned(), |inner| inner.replace("'\\''", "'"))
}

impl RemoteExecutor for RecordingRemote {
    fn execute(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<RemoteCommandOutput, ExecError> {
        let mut state = self.state.borrow_mut();
        state
            .executions
            .push((command.to_owned(), stdin.map(<[u8]>::to_vec)));

        if let Some(rule) = state
            .rules
            .iter()
            .find(|rule| command.contains(&rule.pattern))
        {
            return rule.outcome.clone();
        }

        Self::record_deployment(&mut state, command, stdin);
        Ok(RemoteCommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn run_interactive(
        &self,
        pty: &PtyRequest,
        command: Option<&str>,
    ) -> Result<Option<i32>, ExecError> {
        let mut state = self.state.borrow_mut();
        state.interactive.push(InteractiveCall {
            pty: pty.clone(),
            command: command.map(str::to_owned),
        });
        state.interactive_outcome.clone().unwrap_or(Ok(Some(0)))
    }
}

/// [`TerminalProvider`] fake recording raw-mode transitions.
#[derive(Debug, Default)]
pub struct FakeTerminal {
    size: Option<(u16, u16)>,
    raw_mode_fails: bool,
    transitions: RefCell<Vec<&'static str>>,
}

impl FakeTerminal {
    /// Creates a terminal reporting `cols` x `rows`.
    #[must_use]
    pub fn with_size(cols: u16, rows: u16) -> Self {
        Self {
            size: Some((cols, rows)),
            ..Self::default()
        }
    }

    /// Creates a terminal that refuses raw mode, as when stdin is a pipe.
    #[must_use]
    pub fn without_raw_mode() -> Self {
        Self {
            raw_mode_fails: true,
            ..Self::default()
        }
    }

    /// Returns the recorded transitions, `"raw"` or `"cooked"`.
    #[must_use]
    pub fn transitions(&self) -> Vec<&'static str> {
        self.transitions.borrow().clone()
    }
}

impl TerminalProvider for FakeTerminal {
    fn size(&self) -> Option<(u16, u16)> {
        self.size
    }

    fn enable_raw_mode(&self) -> io::Result<()> {
        if self.raw_mode_fails {
            return Err(io::Error::other("not a terminal"));
        }
        self.transitions.borrow_mut().push("raw");
        Ok(())
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        self.transitions.borrow_mut().push("cooked");
        Ok(())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    /// An empty value removes the variable instead.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                if value.is_empty() {
                    env::remove_var(key);
                } else {
                    env::set_var(key, value);
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
