//! Loop devices backed by image files.

use std::process::Command;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use imagecraft_utils::CommandRunner;

use crate::BlockdevError;

/// Environment variable which enables direct I/O on attached loop devices.
pub const DIRECT_IO_ENV: &str = "IMAGECRAFT_DIRECT_IO";

fn direct_io() -> &'static str {
    match std::env::var(DIRECT_IO_ENV) {
        Ok(val) if val == "on" => "on",
        _ => "off",
    }
}

/// A loop device attached to an image file, with partition scanning enabled.
///
/// The device is detached exactly once: either explicitly through
/// [`LoopbackDevice::close`], or on a best-effort basis when dropped.
#[derive(Debug)]
pub struct LoopbackDevice<'r> {
    dev: Option<Utf8PathBuf>,
    runner: &'r dyn CommandRunner,
}

impl<'r> LoopbackDevice<'r> {
    /// Attach a new loop device to the provided image file.
    #[context("Attaching loop device to {path}")]
    pub fn new(runner: &'r dyn CommandRunner, path: &Utf8Path) -> Result<Self> {
        let dev = runner.run(
            Command::new("losetup")
                .args([
                    "--show",
                    format!("--direct-io={}", direct_io()).as_str(),
                    "-P",
                    "--find",
                ])
                .arg(path),
        )?;
        let dev = dev.trim();
        if dev.is_empty() {
            anyhow::bail!("losetup did not report a device");
        }
        let dev = Utf8PathBuf::from(dev);
        tracing::debug!("Allocated loopback {dev}");
        Ok(Self {
            dev: Some(dev),
            runner,
        })
    }

    /// The path to the loop device.
    pub fn path(&self) -> &Utf8Path {
        // The option is only taken when closing, which consumes or drops us
        self.dev.as_deref().unwrap_or(Utf8Path::new(""))
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<()> {
        let Some(dev) = self.dev.take() else {
            tracing::trace!("loopback device already deallocated");
            return Ok(());
        };
        detach(self.runner, &dev)
    }

    /// Consume this device, detaching it.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for LoopbackDevice<'_> {
    fn drop(&mut self) {
        // Best effort to detach if we're dropped without invoking `close`
        if let Err(e) = self.impl_close() {
            tracing::warn!("{e:#}");
        }
    }
}

fn is_attached(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<bool> {
    let out = runner.run(Command::new("losetup").args([
        "--list",
        "--noheadings",
        "--output",
        "NAME",
    ]))?;
    Ok(out.lines().any(|l| l.trim() == dev.as_str()))
}

/// Detach a loop device.
///
/// Detaching a device which is no longer attached succeeds, so this is
/// safe to call from several cleanup paths.
#[context("Detaching {dev}")]
pub fn detach(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<()> {
    let Err(e) = runner.run_silent(Command::new("losetup").args(["-d", dev.as_str()])) else {
        tracing::debug!("Detached loopback {dev}");
        return Ok(());
    };
    match is_attached(runner, dev) {
        Ok(false) => {
            tracing::debug!("{dev} was already detached");
            Ok(())
        }
        _ => Err(BlockdevError::DetachFailed {
            device: dev.to_string(),
            reason: format!("{e:#}"),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagecraft_utils::ScriptedRunner;

    #[test]
    fn test_attach_close() -> Result<()> {
        let runner = ScriptedRunner::new()
            .on("losetup --show", "/dev/loop3\n")
            .on("losetup -d /dev/loop3", "");
        let dev = LoopbackDevice::new(&runner, "/var/tmp/disk.img".into())?;
        assert_eq!(dev.path().as_str(), "/dev/loop3");
        dev.close()?;
        assert_eq!(runner.count_matching("losetup -d"), 1);
        let cmdlines = runner.cmdlines();
        assert_eq!(
            cmdlines[0],
            "losetup --show --direct-io=off -P --find /var/tmp/disk.img"
        );
        Ok(())
    }

    #[test]
    fn test_drop_detaches_once() -> Result<()> {
        let runner = ScriptedRunner::new()
            .on("losetup --show", "/dev/loop3\n")
            .on("losetup -d /dev/loop3", "");
        {
            let _dev = LoopbackDevice::new(&runner, "/var/tmp/disk.img".into())?;
        }
        assert_eq!(runner.count_matching("losetup -d"), 1);
        Ok(())
    }

    #[test]
    fn test_attach_failure() {
        let runner = ScriptedRunner::new().fail_on("losetup --show", "no free loop devices");
        assert!(LoopbackDevice::new(&runner, "/var/tmp/disk.img".into()).is_err());
    }

    #[test]
    fn test_detach_idempotent() -> Result<()> {
        let runner = ScriptedRunner::new()
            .fail_on("losetup -d", "No such device or address")
            .on("losetup --list", "/dev/loop0\n/dev/loop1\n");
        detach(&runner, "/dev/loop7".into())?;
        let e = detach(&runner, "/dev/loop1".into()).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<BlockdevError>(),
            Some(BlockdevError::DetachFailed { .. })
        ));
        Ok(())
    }
}
