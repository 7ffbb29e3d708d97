//! Assembling unified kernel images.

use std::process::Command;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use imagecraft_utils::CommandRunner;

use crate::error::Error;

/// Secure Boot signing material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeys {
    /// Private key
    pub key: Utf8PathBuf,
    /// Certificate
    pub cert: Utf8PathBuf,
}

/// Inputs of a unified kernel image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UkiInputs<'a> {
    /// The kernel image
    pub kernel: &'a Utf8Path,
    /// The initramfs
    pub initrd: &'a Utf8Path,
    /// A file holding the rendered kernel command line
    pub cmdline_file: &'a Utf8Path,
    /// Where to write the image
    pub output: &'a Utf8Path,
    /// Sign the image if set
    pub signing: Option<&'a SigningKeys>,
    /// Scratch directory for the assembly tool
    pub tmpdir: Option<&'a Utf8Path>,
}

fn ukify_command(inputs: &UkiInputs) -> Command {
    let mut cmd = Command::new("ukify");
    cmd.arg("build")
        .arg(format!("--linux={}", inputs.kernel))
        .arg(format!("--initrd={}", inputs.initrd))
        .arg(format!("--cmdline=@{}", inputs.cmdline_file));
    if let Some(keys) = inputs.signing {
        cmd.arg(format!("--secureboot-private-key={}", keys.key))
            .arg(format!("--secureboot-certificate={}", keys.cert));
    }
    cmd.arg(format!("--output={}", inputs.output));
    if let Some(tmpdir) = inputs.tmpdir {
        cmd.env("TMPDIR", tmpdir);
    }
    cmd
}

/// Build a unified kernel image combining kernel, initramfs and command line.
#[context("Building unified kernel image {}", inputs.output)]
pub fn build_uki(runner: &dyn CommandRunner, inputs: &UkiInputs) -> Result<()> {
    if let Some(parent) = inputs.output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    runner
        .run_silent(&mut ukify_command(inputs))
        .map_err(|e| e.context(Error::UkiBuildFailed))?;
    tracing::info!("Built {}", inputs.output);
    Ok(())
}
