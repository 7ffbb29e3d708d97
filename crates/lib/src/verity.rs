//! dm-verity provisioning of the root filesystem.

use std::process::Command;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use imagecraft_utils::{CommandRunner, ResultExt};

use crate::error::Error;
use crate::kernel_cmdline::{Cmdline, ROOTHASH};
use crate::mount::MountStack;

/// The device-mapper node of the verity-protected root.
pub const VERITY_ROOT_DEVICE: &str = "/dev/mapper/root";

/// Stands in for the root hash until the hash tree has been computed.
pub const ROOT_HASH_PLACEHOLDER: &str = "ROOTHASH-PLACEHOLDER";

/// The outcome of formatting a verity hash tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityResult {
    /// The root hash, lowercase hex
    pub root_hash: String,
    /// The hash algorithm used
    pub hash_algorithm: String,
    /// The protected data device
    pub data_device: Utf8PathBuf,
    /// The device holding the hash tree
    pub hash_device: Utf8PathBuf,
}

/// Find the root hash in the output of `veritysetup format`.
pub fn parse_root_hash(output: &str) -> Option<&str> {
    output.lines().find_map(|l| {
        l.trim()
            .strip_prefix("Root hash:")
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

/// Compute the hash tree of `data` into `hash`, and return the root hash.
#[context("Formatting verity hash tree for {data} on {hash}")]
pub fn get_verity_root_hash(
    runner: &dyn CommandRunner,
    data: &Utf8Path,
    hash: &Utf8Path,
    hash_algorithm: &str,
) -> Result<VerityResult> {
    let out = runner
        .run(
            Command::new("veritysetup")
                .arg("format")
                .arg(format!("--hash={hash_algorithm}"))
                .args([data, hash]),
        )
        .map_err(|e| Error::VerityFormatFailed(format!("{e:#}")))?;
    let root_hash = parse_root_hash(&out)
        .ok_or_else(|| Error::VerityFormatFailed("no root hash in veritysetup output".into()))?;
    hex::decode(root_hash)
        .map_err(|e| Error::VerityFormatFailed(format!("invalid root hash {root_hash:?}: {e}")))?;
    tracing::info!("Root hash of {data}: {root_hash}");
    Ok(VerityResult {
        root_hash: root_hash.to_ascii_lowercase(),
        hash_algorithm: hash_algorithm.to_string(),
        data_device: data.to_owned(),
        hash_device: hash.to_owned(),
    })
}

/// Kernel arguments having systemd set up the verity root device.
pub fn systemd_verity_args(root_hash: &str, data_partuuid: &str, hash_partuuid: &str) -> Cmdline {
    Cmdline::from(
        format!(
            "systemd.verity=1 {ROOTHASH}={root_hash} \
             systemd.verity_root_data=PARTUUID={data_partuuid} \
             systemd.verity_root_hash=PARTUUID={hash_partuuid}"
        )
        .as_str(),
    )
}

fn roothash_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"(^|[\s"'])roothash=([^\s"']*)"#).unwrap())
}

/// The value of the first `roothash=` argument in `text`.
pub fn extract_root_hash(text: &str) -> Option<&str> {
    roothash_regex()
        .captures(text)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

/// Replace the value of every `roothash=` argument in `text`, leaving
/// everything else byte-for-byte intact.
///
/// Returns `None` if `text` has no `roothash=` argument.  Reinserting the
/// value returned by [`extract_root_hash`] reproduces the input.
pub fn substitute_root_hash(text: &str, root_hash: &str) -> Option<String> {
    let regex = roothash_regex();
    if !regex.is_match(text) {
        return None;
    }
    let out = regex.replace_all(text, |c: &regex::Captures| {
        format!("{}{ROOTHASH}={root_hash}", &c[1])
    });
    Some(out.into_owned())
}

/// Substitute the root hash into a file in place; a file without a
/// `roothash=` argument is an error.
#[context("Substituting root hash in {path}")]
pub fn substitute_root_hash_in_file(path: &Utf8Path, root_hash: &str) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let updated = substitute_root_hash(&text, root_hash)
        .ok_or_else(|| anyhow::anyhow!("No {ROOTHASH}= argument found"))?;
    std::fs::write(path, updated).with_context(|| format!("Writing {path}"))?;
    Ok(())
}

/// Transient tmpfs mounts over `/tmp` and the ESP's `/tmp` in an install
/// root, used while assembling a unified kernel image.
#[derive(Debug)]
pub struct ScratchMounts<'r>(MountStack<'r>);

impl<'r> ScratchMounts<'r> {
    /// The scratch mount targets of an install root.
    pub fn targets(root: &Utf8Path) -> [Utf8PathBuf; 2] {
        [root.join("tmp"), root.join("boot/efi/tmp")]
    }

    /// Mount tmpfs on each scratch target of `root`.
    ///
    /// On failure, everything attempted so far is unmounted again.
    #[context("Mounting scratch space in {root}")]
    pub fn mount(runner: &'r dyn CommandRunner, root: &Utf8Path) -> Result<Self> {
        let mut stack = MountStack::new(runner);
        for target in Self::targets(root) {
            if let Err(e) = stack.mount(&["-t", "tmpfs"], "tmpfs", &target) {
                return Err(e).compose_cleanup(stack.unmount_all());
            }
        }
        Ok(Self(stack))
    }

    /// Unmount all scratch mounts.
    pub fn unmount(self) -> Result<()> {
        self.0.unmount_all()
    }
}

/// Run `f` with scratch mounts in `root`, unmounting them on every path.
pub fn with_scratch_mounts<T>(
    runner: &dyn CommandRunner,
    root: &Utf8Path,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let mounts = ScratchMounts::mount(runner, root)?;
    let r = f();
    r.compose_cleanup(mounts.unmount())
}
