//! Locating the kernel and initramfs in an install root.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config::KernelConfig;
use crate::error::Error;

const VMLINUZ_PREFIX: &str = "vmlinuz-";
const RESCUE_PREFIX: &str = "vmlinuz-0-rescue-";

/// The kernel and initramfs to boot, relative to the install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArtifacts {
    /// The kernel image, e.g. `boot/vmlinuz-6.6.1`
    pub kernel: Utf8PathBuf,
    /// The initramfs, e.g. `boot/initramfs-6.6.1.img`
    pub initrd: Utf8PathBuf,
}

impl KernelArtifacts {
    /// The kernel version, if the kernel file name carries one.
    pub fn version(&self) -> Option<&str> {
        self.kernel.file_name()?.strip_prefix(VMLINUZ_PREFIX)
    }
}

fn require(root: &Utf8Path, rel: &Utf8Path) -> Result<Utf8PathBuf> {
    let rel = rel.strip_prefix("/").unwrap_or(rel);
    if !root.join(rel).try_exists()? {
        return Err(Error::KernelNotFound(format!("{rel} does not exist")).into());
    }
    Ok(rel.to_owned())
}

/// Find the kernel and initramfs to boot.
///
/// Explicitly configured paths must exist; otherwise the newest
/// `/boot/vmlinuz-<version>` is used (rescue kernels are skipped), together
/// with its `initramfs-<version>.img` or `initrd.img-<version>`.
#[context("Locating kernel in {root}")]
pub fn find_kernel(root: &Utf8Path, cfg: &KernelConfig) -> Result<KernelArtifacts> {
    let kernel = match cfg.image.as_deref() {
        Some(p) => require(root, p)?,
        None => newest_kernel(root)?,
    };
    let initrd = match cfg.initrd.as_deref() {
        Some(p) => require(root, p)?,
        None => {
            let version = kernel
                .file_name()
                .and_then(|n| n.strip_prefix(VMLINUZ_PREFIX))
                .ok_or_else(|| {
                    Error::KernelNotFound(format!("cannot derive a version from {kernel}"))
                })?;
            initrd_for(root, version)?
        }
    };
    tracing::debug!("Using kernel {kernel} with initramfs {initrd}");
    Ok(KernelArtifacts { kernel, initrd })
}

/// A run of digits or of other characters within a version string.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum VersionPart<'a> {
    Number(u64),
    Text(&'a str),
}

/// Split a version into runs so that numeric runs compare as numbers:
/// `6.10` sorts after `6.9`.
fn version_parts(v: &str) -> Vec<VersionPart<'_>> {
    let mut parts = Vec::new();
    let mut rest = v;
    while let Some(c) = rest.chars().next() {
        let digits = c.is_ascii_digit();
        let len = rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(len);
        let part = match run.parse() {
            Ok(n) if digits => VersionPart::Number(n),
            _ => VersionPart::Text(run),
        };
        parts.push(part);
        rest = tail;
    }
    parts
}

fn newest_kernel(root: &Utf8Path) -> Result<Utf8PathBuf> {
    let bootdir = root.join("boot");
    let mut kernels = Vec::new();
    if bootdir.try_exists()? {
        for entry in bootdir.read_dir_utf8().with_context(|| format!("Reading {bootdir}"))? {
            let entry = entry?;
            let name = entry.file_name();
            if name.starts_with(VMLINUZ_PREFIX) && !name.starts_with(RESCUE_PREFIX) {
                kernels.push(name.to_string());
            }
        }
    }
    kernels.sort_by(|a, b| version_parts(a).cmp(&version_parts(b)));
    let newest = kernels
        .pop()
        .ok_or_else(|| Error::KernelNotFound("no /boot/vmlinuz-* found".into()))?;
    Ok(Utf8Path::new("boot").join(newest))
}

fn initrd_for(root: &Utf8Path, version: &str) -> Result<Utf8PathBuf> {
    for name in [
        format!("initramfs-{version}.img"),
        format!("initrd.img-{version}"),
    ] {
        let rel = Utf8Path::new("boot").join(name);
        if root.join(&rel).try_exists()? {
            return Ok(rel);
        }
    }
    Err(Error::KernelNotFound(format!("no initramfs for kernel {version}")).into())
}
