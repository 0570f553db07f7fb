//! Privileged command execution.
//!
//! Every side effect that needs root on the host (iproute2, SPDK RPCs,
//! mount, user management) goes through an [`Executor`]. The storage and
//! network code only decides *what* to run; [`SystemExecutor`] runs it and
//! [`RecordingExecutor`] records it for tests.

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::io::Write;
use std::process::Stdio;

/// A command line plus optional standard input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    secret_args: Vec<usize>,
}

impl Cmd {
    /// Start building a command for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            secret_args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an argument that is masked in logs and errors.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Append borrowed arguments.
    pub fn argv(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    /// Feed `input` on standard input.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Feed `value` as JSON on standard input.
    pub fn stdin_json<T: serde::Serialize>(self, value: &T) -> Result<Self> {
        let input = serde_json::to_string(value)?;
        Ok(self.stdin(input))
    }

    /// Program to execute.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, without the program.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Standard input, if any.
    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// Shell-quoted rendering used in logs and errors.
    ///
    /// Secret arguments are rendered as `<redacted>`.
    pub fn command_line(&self) -> String {
        let args = self.args.iter().enumerate().map(|(i, arg)| {
            if self.secret_args.contains(&i) {
                "<redacted>".to_string()
            } else {
                quote(arg)
            }
        });
        std::iter::once(quote(&self.program))
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command_line())
    }
}

fn quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Runs commands synchronously.
pub trait Executor {
    /// Run `cmd` to completion and return its stdout.
    ///
    /// Non-zero exit yields [`Error::CommandFailed`].
    fn run(&self, cmd: &Cmd) -> Result<String>;
}

/// Executes commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn run(&self, cmd: &Cmd) -> Result<String> {
        let line = cmd.command_line();
        tracing::debug!(command = %line, "running");

        let mut command = std::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command
            .spawn()
            .map_err(|e| Error::command_failed(&line, -1, e.to_string()))?;

        // Feed stdin while stdout and stderr drain.
        let pipe = child.stdin.take();
        let (output, written) = std::thread::scope(|scope| {
            let writer = cmd
                .stdin
                .as_deref()
                .zip(pipe)
                .map(|(input, mut pipe)| scope.spawn(move || pipe.write_all(input.as_bytes())));
            let output = child.wait_with_output();
            let written = match writer.map(|w| w.join()) {
                None | Some(Ok(Ok(()))) => Ok(()),
                Some(Ok(Err(e))) => Err(e.to_string()),
                Some(Err(_)) => Err("stdin writer panicked".to_string()),
            };
            (output, written)
        });
        let output = output.map_err(|e| Error::command_failed(&line, -1, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            tracing::warn!(command = %line, exit_code, stderr = %stderr, "command failed");
            return Err(Error::command_failed(line, exit_code, stderr));
        }
        written.map_err(|e| Error::command_failed(&line, -1, format!("write stdin: {}", e)))?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Turn an "already absent" failure into success.
///
/// Any other error is returned unchanged.
pub fn ignore_absent(result: Result<String>, patterns: &[&str]) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_absent(patterns) => {
            tracing::debug!(error = %e, "resource already absent");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Stdout(String),
    Fail { exit_code: i32, stderr: String },
}

/// Records commands instead of running them.
///
/// Commands succeed with empty output unless a scripted reply matches a
/// substring of their command line; the first matching rule wins.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    calls: RefCell<Vec<Cmd>>,
    rules: Vec<(String, Reply)>,
}

impl RecordingExecutor {
    /// Create an executor that accepts every command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail commands whose command line contains `pattern`.
    pub fn fail_when(
        mut self,
        pattern: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        self.rules.push((
            pattern.into(),
            Reply::Fail {
                exit_code,
                stderr: stderr.into(),
            },
        ));
        self
    }

    /// Answer commands whose command line contains `pattern` with `stdout`.
    pub fn respond_when(mut self, pattern: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.rules.push((pattern.into(), Reply::Stdout(stdout.into())));
        self
    }

    /// Every command seen so far, in order.
    pub fn calls(&self) -> Vec<Cmd> {
        self.calls.borrow().clone()
    }

    /// Command lines of every command seen so far.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(Cmd::command_line).collect()
    }

    /// Command lines containing `needle`.
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.command_lines()
            .into_iter()
            .filter(|line| line.contains(needle))
            .collect()
    }

    /// Forget recorded commands, keeping the rules.
    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }
}

impl Executor for RecordingExecutor {
    fn run(&self, cmd: &Cmd) -> Result<String> {
        let line = cmd.command_line();
        self.calls.borrow_mut().push(cmd.clone());

        let reply = self
            .rules
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            None => Ok(String::new()),
            Some(Reply::Stdout(out)) => Ok(out),
            Some(Reply::Fail { exit_code, stderr }) => {
                Err(Error::command_failed(line, exit_code, stderr))
            }
        }
    }
}
