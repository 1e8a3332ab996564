// SPDX-License-Identifier: GPL-3.0-only

//! Command execution seam
//!
//! Every external tool goes through the `Runner` trait so the engine can be
//! exercised without root and without the tools installed. `SystemRunner`
//! is the real thing; `ScriptedRunner` replays canned output in tests.

use std::collections::VecDeque;
use std::process::Command;
use std::sync::Mutex;

use crate::{Result, SysError};

/// Captured output of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait Runner: Send + Sync {
    /// Run `program` with `args`, capturing output. A non-zero exit is an
    /// `Err`; callers that tolerate failure match on `ToolFailed`.
    fn run(&self, program: &str, args: &[&str]) -> Result<ToolOutput>;

    /// Like `run` but feeding `input` on stdin (cryptsetup passphrases).
    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<ToolOutput>;
}

/// Shells out via `std::process::Command`.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }

    fn finish(program: &str, output: std::process::Output) -> Result<ToolOutput> {
        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(SysError::ToolFailed {
                program: program.to_string(),
                status,
                stderr,
            });
        }
        Ok(ToolOutput {
            status,
            stdout,
            stderr,
        })
    }
}

impl Runner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<ToolOutput> {
        if which::which(program).is_err() {
            return Err(SysError::ToolMissing(program.to_string()));
        }
        tracing::debug!(program, ?args, "running");
        let output = Command::new(program).args(args).output()?;
        Self::finish(program, output)
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<ToolOutput> {
        use std::io::Write;
        use std::process::Stdio;

        if which::which(program).is_err() {
            return Err(SysError::ToolMissing(program.to_string()));
        }
        tracing::debug!(program, ?args, "running with stdin");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        Self::finish(program, output)
    }
}

/// One expected invocation for `ScriptedRunner`.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    /// Program name to match, or empty to match anything.
    pub program: String,
    pub output: ToolOutput,
}

/// Replays a script of canned outputs and records every argv it saw.
/// When the script runs dry, further calls succeed with empty output, so
/// tests only script the calls they care about.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<ScriptedCall>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        ScriptedRunner::default()
    }

    pub fn expect(&self, program: &str, stdout: &str) {
        self.script.lock().unwrap().push_back(ScriptedCall {
            program: program.to_string(),
            output: ToolOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        });
    }

    pub fn expect_failure(&self, program: &str, status: i32, stderr: &str) {
        self.script.lock().unwrap().push_back(ScriptedCall {
            program: program.to_string(),
            output: ToolOutput {
                status,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        });
    }

    /// Every argv vector seen so far, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// True iff some recorded call ran `program` with all of `wanted` among
    /// its arguments.
    pub fn saw(&self, program: &str, wanted: &[&str]) -> bool {
        self.calls().iter().any(|argv| {
            argv.first().map(String::as_str) == Some(program)
                && wanted.iter().all(|w| argv.iter().any(|a| a == w))
        })
    }

    fn next(&self, program: &str, args: &[&str]) -> Result<ToolOutput> {
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        self.calls.lock().unwrap().push(argv);

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(call) => {
                if !call.program.is_empty() && call.program != program {
                    return Err(SysError::OperationFailed(format!(
                        "scripted {} but engine ran {}",
                        call.program, program
                    )));
                }
                if call.output.status != 0 {
                    return Err(SysError::ToolFailed {
                        program: program.to_string(),
                        status: call.output.status,
                        stderr: call.output.stderr,
                    });
                }
                Ok(call.output)
            }
            None => Ok(ToolOutput::default()),
        }
    }
}

impl Runner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<ToolOutput> {
        self.next(program, args)
    }

    fn run_with_input(&self, program: &str, args: &[&str], _input: &str) -> Result<ToolOutput> {
        self.next(program, args)
    }
}
