//! Stacks of mounts that are torn down in reverse order.

use std::ffi::OsStr;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use imagecraft_utils::{CommandRunner, ResultExt};

/// Mounts made through a [`CommandRunner`], unmounted in reverse order when
/// the stack is torn down or dropped.
#[derive(Debug)]
pub struct MountStack<'r> {
    runner: &'r dyn CommandRunner,
    // Targets in mount order, and whether mounting them succeeded
    mounts: Vec<(Utf8PathBuf, bool)>,
}

impl<'r> MountStack<'r> {
    /// An empty stack.
    pub fn new(runner: &'r dyn CommandRunner) -> Self {
        Self {
            runner,
            mounts: Vec::new(),
        }
    }

    /// Run `mount <options> <source> <target>`, creating `target` first.
    ///
    /// A failed mount stays on the stack: teardown still attempts to
    /// unmount it, and only logs if that fails too.
    pub fn mount(
        &mut self,
        options: &[&str],
        source: impl AsRef<OsStr>,
        target: &Utf8Path,
    ) -> Result<()> {
        let res = std::fs::create_dir_all(target)
            .with_context(|| format!("Creating {target}"))
            .and_then(|()| {
                self.runner.run_silent(
                    Command::new("mount")
                        .args(options)
                        .arg(source.as_ref())
                        .arg(target),
                )
            });
        self.mounts.push((target.to_owned(), res.is_ok()));
        res.with_context(|| format!("Mounting {target}"))
    }

    fn impl_unmount(&mut self) -> Result<()> {
        let mut result = Ok(());
        while let Some((target, mounted)) = self.mounts.pop() {
            let r = self
                .runner
                .run_silent(Command::new("umount").arg(&target))
                .with_context(|| format!("Unmounting {target}"));
            match r {
                Err(e) if !mounted => tracing::debug!("{e:#}"),
                r => result = result.compose_cleanup(r),
            }
        }
        result
    }

    /// Unmount everything, most recent first.  Every target is attempted
    /// even if an earlier unmount fails.
    pub fn unmount_all(mut self) -> Result<()> {
        self.impl_unmount()
    }
}

impl Drop for MountStack<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.impl_unmount() {
            tracing::warn!("{e:#}");
        }
    }
}
