//! Raw disk images: creating and attaching them, mounting their partitions,
//! and the whole assembly pipeline.
//!
//! A loop device attached here is detached exactly once on every path.  On
//! failure it is detached before the image file is removed, and cleanup
//! failures are composed onto the original error.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use imagecraft_blockdev::LoopbackDevice;
use imagecraft_utils::{CommandRunner, ResultExt};

use crate::bootloader::install_bootloader;
use crate::config::{BuildContext, DiskSpec, PartitionSpec};
use crate::disk::disk_partitions_create;
use crate::mount::MountStack;
use crate::mountpoint::DeviceMap;
use crate::verity::VerityResult;

/// Remove an image file; one that does not exist is already removed.
fn remove_image(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        r => r.with_context(|| format!("Removing {path}")),
    }
}

/// Create `path` with `size` bytes allocated.
fn allocate(path: &Utf8Path, size: u64) -> Result<()> {
    let f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Creating {path}"))?;
    match rustix::fs::fallocate(&f, rustix::fs::FallocateFlags::empty(), 0, size) {
        Ok(()) => Ok(()),
        Err(e) if e == rustix::io::Errno::OPNOTSUPP => {
            tracing::debug!("fallocate unsupported for {path}, creating a sparse file");
            f.set_len(size).context("Extending image")
        }
        Err(e) => Err(e).context("fallocate"),
    }
}

/// Create the raw image of `disk` at `path`, attach it to a loop device
/// and partition it.
///
/// Any existing file at `path` is replaced.  On failure, the loop device is
/// detached and the file removed again.
#[context("Creating raw image {path}")]
pub fn create_raw_image_loopdev<'r>(
    runner: &'r dyn CommandRunner,
    path: &Utf8Path,
    disk: &DiskSpec,
) -> Result<(LoopbackDevice<'r>, DeviceMap)> {
    let size = disk.size_bytes()?;
    if path.try_exists()? {
        tracing::debug!("Removing stale {path}");
        remove_image(path)?;
    }
    if let Err(e) = allocate(path, size) {
        return Err(e).compose_cleanup(remove_image(path));
    }
    let loopdev = match LoopbackDevice::new(runner, path) {
        Ok(d) => d,
        Err(e) => return Err(e).compose_cleanup(remove_image(path)),
    };
    let r = disk_partitions_create(
        runner,
        loopdev.path(),
        &disk.partitions,
        disk.partition_table_type,
    )
    .and_then(|nodes| DeviceMap::from_partitions(&disk.partitions, nodes));
    match r {
        Ok(map) => {
            tracing::info!("Created {path} on {}", loopdev.path());
            Ok((loopdev, map))
        }
        Err(e) => Err(e)
            .compose_cleanup(loop_setup_delete(loopdev))
            .compose_cleanup(remove_image(path)),
    }
}

/// Detach a loop device created by [`create_raw_image_loopdev`].
pub fn loop_setup_delete(dev: LoopbackDevice) -> Result<()> {
    dev.close()
}

fn mount_depth(mount_point: &str) -> usize {
    Utf8Path::new(mount_point).components().count()
}

/// The partitions of an image mounted under a directory, shallowest mount
/// point first.  They are unmounted in reverse order.
#[derive(Debug)]
pub struct InstallRoot<'r> {
    path: Utf8PathBuf,
    mounts: MountStack<'r>,
}

impl<'r> InstallRoot<'r> {
    /// Mount every mounted partition of `disk` below `path`.
    #[context("Mounting install root {path}")]
    pub fn mount(
        runner: &'r dyn CommandRunner,
        path: &Utf8Path,
        disk: &DiskSpec,
        map: &DeviceMap,
    ) -> Result<Self> {
        let mut parts: Vec<&PartitionSpec> =
            disk.partitions.iter().filter(|p| p.is_mounted()).collect();
        parts.sort_by_key(|p| mount_depth(&p.mount_point));
        let mut mounts = MountStack::new(runner);
        for p in parts {
            let r = map
                .get(&p.id)
                .ok_or_else(|| anyhow::anyhow!("No device for partition {}", p.id))
                .and_then(|dev| {
                    let target = path.join(p.mount_point.trim_start_matches('/'));
                    let options = if p.mount_options.is_empty() {
                        vec![]
                    } else {
                        vec!["-o", p.mount_options.as_str()]
                    };
                    mounts.mount(&options, dev, &target)
                });
            if let Err(e) = r {
                return Err(e).compose_cleanup(mounts.unmount_all());
            }
        }
        Ok(Self {
            path: path.to_owned(),
            mounts,
        })
    }

    /// The install root.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Unmount all partitions.
    pub fn unmount(self) -> Result<()> {
        self.mounts.unmount_all()
    }
}

/// Fills a mounted install root with the operating system to boot.
pub trait RootPopulator {
    /// Populate `root`.
    fn populate(&self, runner: &dyn CommandRunner, root: &Utf8Path) -> Result<()>;
}

impl<F> RootPopulator for F
where
    F: Fn(&dyn CommandRunner, &Utf8Path) -> Result<()>,
{
    fn populate(&self, runner: &dyn CommandRunner, root: &Utf8Path) -> Result<()> {
        self(runner, root)
    }
}

/// Populates an install root with a copy of a directory tree.
#[derive(Debug, Clone)]
pub struct CopyTree(pub Utf8PathBuf);

impl RootPopulator for CopyTree {
    #[context("Copying {} into {root}", self.0)]
    fn populate(&self, runner: &dyn CommandRunner, root: &Utf8Path) -> Result<()> {
        runner.run_silent(
            Command::new("cp")
                .arg("-a")
                .arg(self.0.join("."))
                .arg(root),
        )
    }
}

fn populate_and_install(
    ctx: &BuildContext,
    runner: &dyn CommandRunner,
    map: &DeviceMap,
    install_root: &Utf8Path,
    populator: &dyn RootPopulator,
) -> Result<Option<VerityResult>> {
    let root = InstallRoot::mount(runner, install_root, &ctx.disk, map)?;
    let r = populator
        .populate(runner, root.path())
        .context("Populating install root")
        .and_then(|()| install_bootloader(ctx, runner, map, root.path()));
    r.compose_cleanup(root.unmount())
}

/// Assemble a bootable disk image at `image_path`.
///
/// The image is partitioned and mounted at `install_root`, filled by
/// `populator`, and made bootable.  On failure the image file is removed.
#[context("Building image {image_path}")]
pub fn build_image(
    ctx: &BuildContext,
    runner: &dyn CommandRunner,
    image_path: &Utf8Path,
    install_root: &Utf8Path,
    populator: &dyn RootPopulator,
) -> Result<Option<VerityResult>> {
    ctx.validate()?;
    let (loopdev, map) = create_raw_image_loopdev(runner, image_path, &ctx.disk)?;
    let r = populate_and_install(ctx, runner, &map, install_root, populator)
        .compose_cleanup(loop_setup_delete(loopdev));
    match r {
        Ok(v) => {
            tracing::info!("Built {image_path}");
            Ok(v)
        }
        Err(e) => Err(e).compose_cleanup(remove_image(image_path)),
    }
}
