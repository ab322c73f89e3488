//! Command execution layer
//!
//! Single place where external processes are spawned:
//! - Takes a program, arguments and extra environment
//! - Captures real exit code, stdout, stderr, duration
//! - Returns structured results WITHOUT interpretation
//!
//! "Program not found" is reported separately from a non-zero exit, because
//! adapters treat a missing binary as "not installed" rather than a failure.

use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::process::Command;
use std::time::Instant;
use tracing::debug;

/// Maximum output length to capture per stream
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Result of a command that actually ran
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Full command line, for diagnostics
    pub command_line: String,
    /// Exit code (None when killed by a signal)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short failure description: last stderr line, or stdout, or the exit code
    pub fn failure_summary(&self) -> String {
        let last_line = |s: &str| {
            s.lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        };
        let detail = last_line(&self.stderr)
            .or_else(|| last_line(&self.stdout))
            .unwrap_or_else(|| "no output".to_string());
        match self.exit_code {
            Some(code) => format!("`{}` exited with {}: {}", self.command_line, code, detail),
            None => format!("`{}` was terminated by a signal: {}", self.command_line, detail),
        }
    }
}

/// The command could not be started at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Program does not exist on this host
    NotFound { program: String },
    /// Any other spawn failure (permissions, resource limits)
    Spawn { program: String, message: String },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NotFound { program } => write!(f, "{} not found", program),
            CommandError::Spawn { program, message } => {
                write!(f, "failed to run {}: {}", program, message)
            }
        }
    }
}

/// Trait for executing external programs.
///
/// Adapters only talk to the host through this seam, so they can be tested
/// against a [`ScriptedRunner`].
pub trait CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<CommandOutput, CommandError>;
}

/// Production runner: spawns the program directly (no shell).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<CommandOutput, CommandError> {
        let command_line = render_command_line(program, args);
        debug!("Executing: {}", command_line);
        let start = Instant::now();

        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in env {
            command.env(key, value);
        }

        let output = command.output().map_err(|e| match e.kind() {
            ErrorKind::NotFound => CommandError::NotFound {
                program: program.to_string(),
            },
            _ => CommandError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            },
        })?;

        let result = CommandOutput {
            command_line,
            exit_code: output.status.code(),
            stdout: truncate_output(&output.stdout),
            stderr: truncate_output(&output.stderr),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            "  exit={:?} duration={}ms",
            result.exit_code, result.duration_ms
        );
        Ok(result)
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let slice = if bytes.len() > MAX_OUTPUT_BYTES {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    String::from_utf8_lossy(slice).to_string()
}

pub fn render_command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Scripted response for [`ScriptedRunner`]
#[derive(Debug, Clone)]
pub enum Scripted {
    Exit { code: i32, stdout: String, stderr: String },
    NotFound,
}

impl Scripted {
    pub fn ok(stdout: &str) -> Self {
        Scripted::Exit {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Scripted::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Test double: answers commands by longest matching command-line prefix and
/// records every command it was asked to run.
///
/// A prefix can be queued several times; queued answers are consumed in order
/// and the last one is sticky.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: RefCell<Vec<(String, VecDeque<Scripted>)>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, prefix: &str, response: Scripted) -> Self {
        {
            let mut script = self.script.borrow_mut();
            if let Some((_, queue)) = script.iter_mut().find(|(p, _)| p == prefix) {
                queue.push_back(response);
            } else {
                script.push((prefix.to_string(), VecDeque::from([response])));
            }
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        _env: &[(&str, &str)],
    ) -> Result<CommandOutput, CommandError> {
        let command_line = render_command_line(program, args);
        self.calls.borrow_mut().push(command_line.clone());

        let mut script = self.script.borrow_mut();
        let entry = script
            .iter_mut()
            .filter(|(prefix, _)| command_line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());

        let response = match entry {
            Some((_, queue)) if queue.len() > 1 => queue.pop_front(),
            Some((_, queue)) => queue.front().cloned(),
            None => None,
        };

        match response {
            Some(Scripted::Exit { code, stdout, stderr }) => Ok(CommandOutput {
                command_line,
                exit_code: Some(code),
                stdout,
                stderr,
                duration_ms: 0,
            }),
            Some(Scripted::NotFound) | None => Err(CommandError::NotFound {
                program: program.to_string(),
            }),
        }
    }
}
