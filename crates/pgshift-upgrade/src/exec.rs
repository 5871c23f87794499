//! Commands that must run with elevated privileges or as the database user.
//!
//! The orchestrator only describes what to run ([`CommandPlan`]); a
//! [`PrivilegedExecutor`] decides how. Production uses [`ShellExecutor`],
//! tests record plans instead of running them.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

/// One program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandStep {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }
}

impl fmt::Display for CommandStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// `<wrapper> <user> <program> <args…>`, e.g. `su-exec postgres initdb -D …`.
#[must_use]
pub fn as_user(wrapper: &str, user: &str, step: CommandStep) -> CommandStep {
    CommandStep::new(wrapper)
        .arg(user)
        .arg(step.program)
        .args(step.args)
}

/// Ordered steps, run until the first failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandPlan {
    steps: Vec<CommandStep>,
    dir: Option<PathBuf>,
}

impl CommandPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step(mut self, step: CommandStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Run every step with `dir` as working directory.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn steps(&self) -> &[CommandStep] {
        &self.steps
    }

    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

#[derive(Debug, Error)]
pub enum ExecFailure {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {}", describe_code(*code))]
    NonZeroExit { command: String, code: Option<i32> },

    #[error("I/O error while capturing command output: {0}")]
    Io(#[from] io::Error),
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}"))
}

/// Runs a [`CommandPlan`], appending everything the steps print to `out`.
pub trait PrivilegedExecutor {
    fn run(&self, plan: &CommandPlan, out: &mut dyn Write) -> Result<(), ExecFailure>;
}

/// Runs steps as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl PrivilegedExecutor for ShellExecutor {
    fn run(&self, plan: &CommandPlan, out: &mut dyn Write) -> Result<(), ExecFailure> {
        for step in plan.steps() {
            tracing::debug!(command = %step, dir = ?plan.dir(), "running");
            let mut cmd = Command::new(&step.program);
            cmd.args(&step.args).stdin(Stdio::null());
            if let Some(dir) = plan.dir() {
                cmd.current_dir(dir);
            }
            let output = cmd.output().map_err(|source| ExecFailure::Launch {
                command: step.to_string(),
                source,
            })?;
            out.write_all(&output.stdout)?;
            out.write_all(&output.stderr)?;
            if !output.status.success() {
                return Err(ExecFailure::NonZeroExit {
                    command: step.to_string(),
                    code: output.status.code(),
                });
            }
        }
        out.flush()?;
        Ok(())
    }
}
