//! [`ContainerRuntime`] backed by the `docker` command-line client.
//!
//! Talking to the daemon through the CLI keeps us compatible with whatever
//! API version the host's daemon speaks, at the cost of parsing text output.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use crate::{
    ContainerMounts, ContainerRuntime, ContainerSpec, ExitStatus, RuntimeError, RuntimeResult,
};

/// Maximum stderr kept in a [`RuntimeError::CommandFailed`].
const STDERR_LIMIT: usize = 2000;

/// Docker CLI backend.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn describe(&self, args: &[String]) -> String {
        let mut command = self.bin.clone();
        for arg in args.iter().take(2) {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }

    /// Run to completion and return trimmed stdout.
    fn capture(&self, args: &[String]) -> RuntimeResult<String> {
        tracing::debug!(command = %self.describe(args), "docker");
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RuntimeError::Launch {
                bin: self.bin.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: self.describe(args),
                code: output.status.code().unwrap_or(-1),
                stderr: truncate(&String::from_utf8_lossy(&output.stderr), STDERR_LIMIT),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run to completion, copying stdout into `out` as it arrives and
    /// stderr after stdout closes.
    fn stream(&self, args: &[String], out: &mut dyn Write) -> RuntimeResult<()> {
        tracing::debug!(command = %self.describe(args), "docker (streaming)");
        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Launch {
                bin: self.bin.clone(),
                source,
            })?;

        // Drain stderr on its own thread so a chatty stream cannot fill the
        // pipe while we block on stdout.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, out).map(|_| ()),
            None => Ok(()),
        };
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let status = child.wait()?;
        copied?;
        out.write_all(&stderr)?;
        out.flush()?;

        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: self.describe(args),
                code: status.code().unwrap_or(-1),
                stderr: truncate(&String::from_utf8_lossy(&stderr), STDERR_LIMIT),
            });
        }
        Ok(())
    }
}

/// Arguments for `docker create`.
#[must_use]
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--workdir".to_string(),
        spec.working_dir.display().to_string(),
    ];
    for bind in &spec.binds {
        args.push("--volume".to_string());
        args.push(bind.to_string());
    }
    args.push(spec.image.clone());
    args
}

/// Parse the exit code printed by `docker wait`.
pub fn parse_wait_output(stdout: &str) -> RuntimeResult<ExitStatus> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .and_then(|line| line.parse::<i64>().ok())
        .map(ExitStatus)
        .ok_or_else(|| RuntimeError::UnexpectedOutput {
            command: "docker wait".into(),
            detail: format!("expected an exit code, got {stdout:?}"),
        })
}

impl ContainerRuntime for DockerCli {
    fn pull_image(&self, image: &str, out: &mut dyn Write) -> RuntimeResult<()> {
        self.stream(&["pull".to_string(), image.to_string()], out)
    }

    fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let args = create_args(spec);
        let id = self.capture(&args)?;
        if id.is_empty() {
            return Err(RuntimeError::UnexpectedOutput {
                command: self.describe(&args),
                detail: "empty container id".into(),
            });
        }
        Ok(id)
    }

    fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.capture(&["start".to_string(), id.to_string()])
            .map(|_| ())
    }

    fn wait_container(&self, id: &str) -> RuntimeResult<ExitStatus> {
        let stdout = self.capture(&["wait".to_string(), id.to_string()])?;
        parse_wait_output(&stdout)
    }

    fn fetch_logs(&self, id: &str, out: &mut dyn Write) -> RuntimeResult<()> {
        self.stream(&["logs".to_string(), id.to_string()], out)
    }

    fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerMounts> {
        let stdout = self.capture(&[
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            id.to_string(),
        ])?;
        crate::parse_inspect(&stdout)
    }
}

fn truncate(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut end = max;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
