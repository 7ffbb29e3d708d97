//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::{Read, Seek, Write};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Maximum amount of stderr we carry along in an error message.
const MAX_STDERR_BYTES: u64 = 1024;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr into the error
    /// message if it exits unsuccessfully.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, writing `input` to its stdin, and return
    /// its stdout as a string.
    fn run_with_stdin(&mut self, input: &[u8]) -> Result<String>;

    /// Render the program and its arguments as a shell-quoted string.
    fn to_string_pretty(&self) -> String;
}

/// Read the last (up to) [`MAX_STDERR_BYTES`] of a captured stderr file.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    let len = f.metadata().map(|m| m.len()).unwrap_or_default();
    let start = len.saturating_sub(MAX_STDERR_BYTES);
    if f.seek(std::io::SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    let _ = f.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).trim().to_string()
}

fn check_status(cmd: &Command, status: std::process::ExitStatus, stderr: String) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let program = cmd.get_program().to_string_lossy();
    if stderr.is_empty() {
        anyhow::bail!("Subprocess {program} failed: {status}")
    }
    anyhow::bail!("Subprocess {program} failed: {status}\n{stderr}")
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile().context("Allocating stderr tempfile")?;
        self.stderr(stderr.try_clone()?);
        let status = self
            .status()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        check_status(self, status, last_utf8_content_from_file(stderr))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let stderr = tempfile::tempfile().context("Allocating stderr tempfile")?;
        self.stdout(Stdio::piped());
        self.stderr(stderr.try_clone()?);
        let output = self
            .output()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        check_status(self, output.status, last_utf8_content_from_file(stderr))?;
        String::from_utf8(output.stdout).context("Parsing subprocess output as UTF-8")
    }

    fn run_with_stdin(&mut self, input: &[u8]) -> Result<String> {
        let stderr = tempfile::tempfile().context("Allocating stderr tempfile")?;
        self.stdin(Stdio::piped());
        self.stdout(Stdio::piped());
        self.stderr(stderr.try_clone()?);
        let mut child = self
            .spawn()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow::anyhow!("Missing stdin for child process"))?;
            stdin.write_all(input).context("Writing subprocess stdin")?;
            // Dropping closes the pipe so the child sees EOF
        }
        let output = child.wait_with_output().context("Waiting for subprocess")?;
        check_status(self, output.status, last_utf8_content_from_file(stderr))?;
        String::from_utf8(output.stdout).context("Parsing subprocess output as UTF-8")
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                shlex::try_quote(&arg)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| arg.into_owned())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
