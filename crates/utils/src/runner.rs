//! The external command execution capability.
//!
//! Everything that shells out to a system tool (partitioning, filesystem
//! creation, bootloader installation, veritysetup, ...) does so through a
//! `&dyn CommandRunner`, so that the whole image-assembly core can be driven
//! against a [`ScriptedRunner`] in tests instead of a real block device.

use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::CommandRunExt;

/// Executes external commands.
pub trait CommandRunner: std::fmt::Debug + Send + Sync {
    /// Run the command to completion, returning its stdout.
    fn run(&self, cmd: &mut Command) -> Result<String>;

    /// Run the command to completion, discarding its stdout.
    fn run_silent(&self, cmd: &mut Command) -> Result<()>;

    /// Run the command with the provided data on stdin, returning its stdout.
    fn run_with_input(&self, cmd: &mut Command, input: &[u8]) -> Result<String>;
}

impl dyn CommandRunner + '_ {
    /// Run the command and parse its stdout as JSON.
    pub fn run_and_parse_json<T: serde::de::DeserializeOwned>(
        &self,
        cmd: &mut Command,
    ) -> Result<T> {
        let stdout = self.run(cmd)?;
        serde_json::from_str(&stdout).context("Parsing subprocess output as JSON")
    }
}

/// Runs commands on the host for real.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, cmd: &mut Command) -> Result<String> {
        cmd.log_debug().run_get_string()
    }

    fn run_silent(&self, cmd: &mut Command) -> Result<()> {
        cmd.log_debug().run_capture_stderr()
    }

    fn run_with_input(&self, cmd: &mut Command, input: &[u8]) -> Result<String> {
        cmd.log_debug().run_with_stdin(input)
    }
}

/// A single recorded invocation made through a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The program and its arguments, joined by spaces
    pub cmdline: String,
    /// Data that was passed on stdin, if any
    pub stdin: Option<String>,
}

#[derive(Debug)]
enum Response {
    Stdout(String),
    Failure(String),
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    response: Response,
}

/// A fake [`CommandRunner`] which never executes anything.
///
/// Each rule is a substring matched against the command line (program and
/// arguments joined by single spaces, unquoted);
/// the first registered rule that matches determines the result.  Commands
/// that match no rule fail, which makes "this must not run any tool" easy
/// to assert.  Every invocation is recorded, including rejected ones.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    /// Create a runner with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to commands containing `pattern` with the given stdout.
    pub fn on(mut self, pattern: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            response: Response::Stdout(stdout.into()),
        });
        self
    }

    /// Fail commands containing `pattern` with the given message.
    pub fn fail_on(mut self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            response: Response::Failure(message.into()),
        });
        self
    }

    /// All invocations made so far, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// The command lines of all invocations made so far, in order.
    pub fn cmdlines(&self) -> Vec<String> {
        self.invocations().into_iter().map(|i| i.cmdline).collect()
    }

    /// Number of invocations whose command line contains `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|i| i.cmdline.contains(pattern))
            .count()
    }

    fn respond(&self, cmd: &Command, stdin: Option<&[u8]>) -> Result<String> {
        let cmdline = std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push(Invocation {
                cmdline: cmdline.clone(),
                stdin: stdin.map(|s| String::from_utf8_lossy(s).into_owned()),
            });
        }
        let rule = self
            .rules
            .iter()
            .find(|r| cmdline.contains(r.pattern.as_str()))
            .ok_or_else(|| anyhow::anyhow!("Unexpected command: {cmdline}"))?;
        match &rule.response {
            Response::Stdout(s) => Ok(s.clone()),
            Response::Failure(msg) => Err(anyhow::anyhow!("Subprocess failed: {msg}")),
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, cmd: &mut Command) -> Result<String> {
        self.respond(cmd, None)
    }

    fn run_silent(&self, cmd: &mut Command) -> Result<()> {
        self.respond(cmd, None).map(|_| ())
    }

    fn run_with_input(&self, cmd: &mut Command, input: &[u8]) -> Result<String> {
        self.respond(cmd, Some(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_first_match_wins() {
        let runner = ScriptedRunner::new()
            .on("blkid -s UUID", "abcd\n")
            .on("blkid", "fallback\n");
        let r: &dyn CommandRunner = &runner;
        let out = r
            .run(Command::new("blkid").args(["-s", "UUID", "/dev/loop0p1"]))
            .unwrap();
        assert_eq!(out, "abcd\n");
        let out = r
            .run(Command::new("blkid").args(["-s", "PARTUUID", "/dev/loop0p1"]))
            .unwrap();
        assert_eq!(out, "fallback\n");
        assert_eq!(runner.count_matching("blkid"), 2);
    }

    #[test]
    fn scripted_unexpected_and_failure() {
        let runner = ScriptedRunner::new().fail_on("veritysetup", "no such device");
        let r: &dyn CommandRunner = &runner;
        let e = r.run_silent(&mut Command::new("veritysetup")).unwrap_err();
        assert!(e.to_string().contains("no such device"));
        let e = r.run_silent(&mut Command::new("grub2-install")).unwrap_err();
        assert!(e.to_string().contains("Unexpected command: grub2-install"));
        similar_asserts::assert_eq!(
            runner.cmdlines(),
            vec!["veritysetup".to_string(), "grub2-install".to_string()]
        );
    }

    #[test]
    fn scripted_records_stdin_and_json() {
        let runner = ScriptedRunner::new().on("lsblk", r#"{"a": 1}"#).on("sfdisk", "");
        let r: &dyn CommandRunner = &runner;
        r.run_with_input(&mut Command::new("sfdisk"), b"label: gpt\n")
            .unwrap();
        let v: serde_json::Value = r.run_and_parse_json(&mut Command::new("lsblk")).unwrap();
        assert_eq!(v["a"], 1);
        let invocations = runner.invocations();
        assert_eq!(invocations[0].stdin.as_deref(), Some("label: gpt\n"));
        assert_eq!(invocations[1].stdin, None);
    }
}
