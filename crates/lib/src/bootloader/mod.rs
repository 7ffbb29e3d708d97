//! Bootloader installation into a populated install root.
//!
//! The combination of boot type and provider is resolved into a [`BootPlan`]
//! up front; unsupported combinations are rejected before any external tool
//! runs.  Both providers share the [`BootConfig`] derived from the disk
//! layout: partition identifiers, and the normalized kernel command line.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::prelude::CapStdExtDirExt;
use fn_error_context::context;

use imagecraft_blockdev as blockdev;
use imagecraft_utils::{CommandRunner, ResultExt};

use crate::config::{BootType, BuildContext, BOOT_MOUNT_POINT};
use crate::error::Error;
use crate::kernel_cmdline::{with_root, Cmdline, ROOTHASH};
use crate::mount::MountStack;
use crate::mountpoint::{self, DeviceMap};
use crate::template::Values;
use crate::verity::{self, VerityResult, ROOT_HASH_PLACEHOLDER, VERITY_ROOT_DEVICE};

mod grub;
mod systemd_boot;

/// A bootloader implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// GRUB 2, under either of its names
    Grub,
    /// systemd-boot
    SystemdBoot,
}

impl Provider {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "grub" | "grub2" => Some(Self::Grub),
            "systemd-boot" => Some(Self::SystemdBoot),
            _ => None,
        }
    }

    /// Parse a provider name.
    pub fn parse(name: &str) -> Result<Self> {
        Self::from_name(name)
            .ok_or_else(|| Error::UnsupportedBootloaderProvider(name.to_string()).into())
    }
}

/// Why a boot type and provider combination cannot be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The provider name is not one we know
    UnsupportedProvider(String),
    /// systemd-boot only boots from EFI
    SystemdBootRequiresEfi,
}

impl From<Rejection> for Error {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::UnsupportedProvider(name) => Error::UnsupportedBootloaderProvider(name),
            Rejection::SystemdBootRequiresEfi => Error::SystemdBootRequiresEfi,
        }
    }
}

/// What installing the bootloader will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPlan {
    /// GRUB for EFI firmware
    GrubEfi,
    /// GRUB for BIOS firmware; not implemented
    GrubLegacy,
    /// systemd-boot for EFI firmware
    SystemdBootEfi,
    /// Not installable
    Rejected(Rejection),
}

impl BootPlan {
    /// Select the plan for a boot type and provider name.
    pub fn select(boot_type: BootType, provider: &str) -> Self {
        let Some(p) = Provider::from_name(provider) else {
            return Self::Rejected(Rejection::UnsupportedProvider(provider.to_string()));
        };
        match (p, boot_type) {
            (Provider::Grub, BootType::Efi) => Self::GrubEfi,
            (Provider::Grub, BootType::Legacy) => Self::GrubLegacy,
            (Provider::SystemdBoot, BootType::Efi) => Self::SystemdBootEfi,
            (Provider::SystemdBoot, BootType::Legacy) => {
                Self::Rejected(Rejection::SystemdBootRequiresEfi)
            }
        }
    }
}

/// The dm-verity hash partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashPartition {
    /// The partition device
    pub device: Utf8PathBuf,
    /// Its partition UUID
    pub partuuid: String,
}

/// Boot configuration derived from the disk layout, shared by all providers.
#[derive(Debug)]
pub struct BootConfig<'a> {
    /// The build context
    pub ctx: &'a BuildContext,
    /// Where the root filesystem is mounted
    pub install_root: &'a Utf8Path,
    root_dir: Dir,
    /// The device of the root filesystem
    pub root_device: Utf8PathBuf,
    /// Filesystem UUID of the root filesystem
    pub root_uuid: String,
    /// Partition UUID of the root partition
    pub root_partuuid: String,
    /// Filesystem UUID of the filesystem holding `/boot`
    pub boot_uuid: String,
    /// Whether `/boot` is a partition of its own
    pub separate_boot: bool,
    /// The hash partition, when the root filesystem is verity-protected
    pub hash: Option<HashPartition>,
    /// Value of the `root=` kernel argument
    pub root_arg: String,
    /// The full kernel command line; with verity, the root hash is
    /// [`ROOT_HASH_PLACEHOLDER`] until it has been computed
    pub cmdline: Cmdline,
}

impl<'a> BootConfig<'a> {
    /// Derive the boot configuration for `plan`.
    ///
    /// Everything that needs no external tool (the hash partition, layout
    /// requirements) is checked before any partition is queried.
    #[context("Resolving boot configuration")]
    pub fn resolve(
        ctx: &'a BuildContext,
        runner: &dyn CommandRunner,
        map: &DeviceMap,
        root_device: &Utf8Path,
        install_root: &'a Utf8Path,
        plan: &BootPlan,
    ) -> Result<Self> {
        let disk = &ctx.disk;
        let hash_device = if ctx.system.immutability.enabled {
            Some(mountpoint::hash_device(disk, map)?.to_owned())
        } else {
            None
        };
        let boot_device = mountpoint::device_for_mount_point(disk, map, BOOT_MOUNT_POINT);
        if hash_device.is_some() && *plan == BootPlan::GrubEfi && boot_device.is_none() {
            return Err(Error::VerityRequiresSeparateBoot.into());
        }
        let root_dir = Dir::open_ambient_dir(install_root, cap_std::ambient_authority())
            .with_context(|| format!("Opening {install_root}"))?;

        let root_uuid = blockdev::uuid_of(runner, root_device)
            .map_err(|e| e.context(Error::UuidRetrievalFailed(root_device.to_owned())))?;
        let root_partuuid = blockdev::partuuid_of(runner, root_device)
            .map_err(|e| e.context(Error::PartUuidRetrievalFailed(root_device.to_owned())))?;
        let boot_uuid = match boot_device {
            Some(dev) => blockdev::uuid_of(runner, dev)
                .map_err(|e| e.context(Error::UuidRetrievalFailed(dev.to_owned())))?,
            None => root_uuid.clone(),
        };
        // The hash partition carries no filesystem until it is formatted,
        // so it is only known by its partition UUID.
        let hash = hash_device
            .map(|device| -> Result<HashPartition> {
                let partuuid = blockdev::partuuid_of(runner, &device)
                    .map_err(|e| e.context(Error::HashPartitionUuidFailed(device.clone())))?;
                Ok(HashPartition { device, partuuid })
            })
            .transpose()?;

        let root_arg = match &hash {
            Some(_) => VERITY_ROOT_DEVICE.to_string(),
            None => format!("PARTUUID={root_partuuid}"),
        };
        let mut cmdline = with_root(&ctx.system.kernel.cmdline, &root_arg);
        if let Some(h) = &hash {
            cmdline.remove_all(ROOTHASH);
            cmdline.extend(verity::systemd_verity_args(
                ROOT_HASH_PLACEHOLDER,
                &root_partuuid,
                &h.partuuid,
            ));
        }
        tracing::debug!("Kernel command line: {cmdline}");

        Ok(Self {
            ctx,
            install_root,
            root_dir,
            root_device: root_device.to_owned(),
            root_uuid,
            root_partuuid,
            boot_uuid,
            separate_boot: boot_device.is_some(),
            hash,
            root_arg,
            cmdline,
        })
    }

    /// Placeholder values common to all boot templates.
    pub fn template_values(&self) -> Values<'static> {
        let systemd_verity = self
            .hash
            .as_ref()
            .map(|h| {
                verity::systemd_verity_args(ROOT_HASH_PLACEHOLDER, &self.root_partuuid, &h.partuuid)
                    .to_string()
            })
            .unwrap_or_default();
        let root_hash = if self.hash.is_some() {
            ROOT_HASH_PLACEHOLDER
        } else {
            ""
        };
        // GRUB's prefix is relative to the filesystem holding /boot
        let boot_prefix = if self.separate_boot { "" } else { "/boot" };
        [
            ("BootUUID", self.boot_uuid.clone()),
            ("CryptoMountCommand", String::new()),
            ("PrefixPath", "/grub2".to_string()),
            ("ExtraCommandLine", self.cmdline.to_string()),
            ("Hostname", self.ctx.system.hostname.clone()),
            ("BootPrefix", boot_prefix.to_string()),
            ("RootPartition", self.root_arg.clone()),
            ("SystemdVerity", systemd_verity),
            ("RootHash", root_hash.to_string()),
        ]
        .into_iter()
        .collect()
    }

    fn ensure_parent(&self, rel: &Utf8Path) -> Result<()> {
        if let Some(parent) = rel.parent().filter(|p| !p.as_str().is_empty()) {
            self.root_dir
                .create_dir_all(parent)
                .with_context(|| format!("Creating {parent}"))?;
        }
        Ok(())
    }

    /// Atomically write `contents` to `rel` in the install root, creating
    /// parent directories.
    pub fn write(&self, rel: impl AsRef<Utf8Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let rel = rel.as_ref();
        self.ensure_parent(rel)?;
        self.root_dir
            .atomic_write(rel, contents)
            .with_context(|| format!("Writing {rel}"))
    }

    /// Copy a file within the install root.
    pub fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        self.ensure_parent(to)?;
        self.root_dir
            .copy(from, &self.root_dir, to)
            .with_context(|| format!("Copying {from} to {to}"))?;
        Ok(())
    }

    /// Compute the verity hash tree of the root filesystem.
    ///
    /// The root filesystem is remounted read-only first, which flushes
    /// outstanding writes; nothing may modify it afterwards.
    #[context("Provisioning verity for {}", self.root_device)]
    pub fn provision_verity(
        &self,
        runner: &dyn CommandRunner,
        hash: &HashPartition,
    ) -> Result<VerityResult> {
        runner
            .run_silent(
                Command::new("mount")
                    .args(["-o", "remount,ro"])
                    .arg(self.install_root),
            )
            .context("Remounting root read-only")?;
        verity::get_verity_root_hash(
            runner,
            &self.root_device,
            &hash.device,
            &self.ctx.system.immutability.hash_algorithm,
        )
    }
}

/// Run `f` with the host's `/dev`, `/proc` and `/sys` bind mounted into
/// `root`, as tools run through `chroot` expect.
pub(crate) fn with_host_mounts<T>(
    runner: &dyn CommandRunner,
    root: &Utf8Path,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let mut stack = MountStack::new(runner);
    let r = ["dev", "proc", "sys"]
        .into_iter()
        .try_for_each(|d| stack.mount(&["--bind"], format!("/{d}"), &root.join(d)))
        .and_then(|()| f());
    r.compose_cleanup(stack.unmount_all())
}

/// Install the configured bootloader into `install_root`, where the root
/// filesystem of the image is mounted along with its other partitions.
///
/// With immutability enabled, the root filesystem is remounted read-only
/// and its verity hash tree computed; the result is returned.
#[context("Installing bootloader")]
pub fn install_bootloader(
    ctx: &BuildContext,
    runner: &dyn CommandRunner,
    map: &DeviceMap,
    install_root: &Utf8Path,
) -> Result<Option<VerityResult>> {
    let root_device = mountpoint::root_device(&ctx.disk, map)?;
    let bootloader = &ctx.system.bootloader;
    let plan = BootPlan::select(bootloader.boot_type, &bootloader.provider);
    tracing::info!("Installing bootloader: {plan:?}");
    let resolve = || BootConfig::resolve(ctx, runner, map, root_device, install_root, &plan);
    match &plan {
        BootPlan::GrubEfi => grub::install(&resolve()?, runner),
        BootPlan::SystemdBootEfi => systemd_boot::install(&resolve()?, runner),
        BootPlan::GrubLegacy => Err(Error::LegacyModeNotImplemented.into()),
        BootPlan::Rejected(r) => Err(Error::from(r.clone()).into()),
    }
}


#[cfg(test)]
mod tests {
    use super::fixture::*;
    use super::*;
    use imagecraft_utils::ScriptedRunner;

    #[test]
    fn test_select() {
        use BootType::*;
        assert_eq!(BootPlan::select(Efi, "grub"), BootPlan::GrubEfi);
        assert_eq!(BootPlan::select(Efi, "grub2"), BootPlan::GrubEfi);
        assert_eq!(BootPlan::select(Legacy, "grub"), BootPlan::GrubLegacy);
        assert_eq!(BootPlan::select(Efi, "systemd-boot"), BootPlan::SystemdBootEfi);
        assert_eq!(
            BootPlan::select(Legacy, "systemd-boot"),
            BootPlan::Rejected(Rejection::SystemdBootRequiresEfi)
        );
        assert_eq!(
            BootPlan::select(Efi, "lilo"),
            BootPlan::Rejected(Rejection::UnsupportedProvider("lilo".into()))
        );
        assert!(Provider::parse("GRUB").is_err());
    }

    #[test]
    fn test_rejections_run_no_tools() -> Result<()> {
        let f = basic()?;
        for (boot_type, provider) in [
            (BootType::Efi, "lilo"),
            (BootType::Legacy, "lilo"),
            (BootType::Legacy, "systemd-boot"),
            (BootType::Legacy, "grub"),
            (BootType::Legacy, "grub2"),
        ] {
            let mut ctx = f.ctx.clone();
            ctx.system.bootloader.boot_type = boot_type;
            ctx.system.bootloader.provider = provider.into();
            let runner = ScriptedRunner::new();
            let e = install_bootloader(&ctx, &runner, &f.map, &f.root).unwrap_err();
            let expected_kind = match crate::error::kind(&e) {
                Some(Error::UnsupportedBootloaderProvider(p)) => p == provider,
                Some(Error::SystemdBootRequiresEfi) => provider == "systemd-boot",
                Some(Error::LegacyModeNotImplemented) => provider.starts_with("grub"),
                _ => false,
            };
            assert!(expected_kind, "{boot_type}/{provider}: {e:#}");
            assert!(runner.invocations().is_empty(), "{boot_type}/{provider}");
        }
        Ok(())
    }

    #[test]
    fn test_root_not_found_for_every_provider() -> Result<()> {
        let f = basic()?;
        let mut map = DeviceMap::default();
        map.insert("esp", "/dev/loop0p1");
        for provider in ["grub", "systemd-boot", "lilo"] {
            let mut ctx = f.ctx.clone();
            ctx.system.bootloader.provider = provider.into();
            let runner = ScriptedRunner::new();
            let e = install_bootloader(&ctx, &runner, &map, &f.root).unwrap_err();
            assert!(
                matches!(crate::error::kind(&e), Some(Error::RootPartitionNotFound)),
                "{provider}: {e:#}"
            );
            assert!(runner.invocations().is_empty());
        }
        Ok(())
    }

    #[test]
    fn test_resolve_plain() -> Result<()> {
        let mut f = basic()?;
        f.ctx.system.kernel.cmdline = "root=/dev/sda2 console=ttyS0 root=LABEL=r quiet".into();
        let runner = blkid(ScriptedRunner::new());
        let root = f.map.get("root").unwrap().to_owned();
        let cfg = BootConfig::resolve(&f.ctx, &runner, &f.map, &root, &f.root, &BootPlan::GrubEfi)?;
        assert_eq!(cfg.root_uuid, "uuid-2");
        assert_eq!(cfg.root_partuuid, "partuuid-2");
        // No /boot partition: boot lives on the root filesystem
        assert_eq!(cfg.boot_uuid, "uuid-2");
        assert!(!cfg.separate_boot);
        assert!(cfg.hash.is_none());
        assert_eq!(
            cfg.cmdline.to_string(),
            "console=ttyS0 quiet root=PARTUUID=partuuid-2"
        );
        let values = cfg.template_values();
        assert_eq!(values["BootPrefix"], "/boot");
        assert_eq!(values["SystemdVerity"], "");
        assert_eq!(values["RootPartition"], "PARTUUID=partuuid-2");
        Ok(())
    }

    #[test]
    fn test_resolve_verity() -> Result<()> {
        let f = verity()?;
        let runner = blkid(ScriptedRunner::new());
        let root = f.map.get("root").unwrap().to_owned();
        let cfg = BootConfig::resolve(&f.ctx, &runner, &f.map, &root, &f.root, &BootPlan::GrubEfi)?;
        assert_eq!(cfg.boot_uuid, "uuid-2");
        assert!(cfg.separate_boot);
        let hash = cfg.hash.as_ref().unwrap();
        assert_eq!(hash.device.as_str(), "/dev/loop0p4");
        assert_eq!(hash.partuuid, "partuuid-4");
        assert_eq!(
            cfg.cmdline.to_string(),
            "console=ttyS0 quiet root=/dev/mapper/root systemd.verity=1 \
             roothash=ROOTHASH-PLACEHOLDER systemd.verity_root_data=PARTUUID=partuuid-3 \
             systemd.verity_root_hash=PARTUUID=partuuid-4"
        );
        assert_eq!(cfg.template_values()["BootPrefix"], "");
        // The raw hash partition has no filesystem UUID to query
        assert_eq!(runner.count_matching("-s UUID -o value /dev/loop0p4"), 0);
        Ok(())
    }

    #[test]
    fn test_hash_partition_missing() -> Result<()> {
        let mut f = basic()?;
        f.ctx.system.immutability.enabled = true;
        for provider in ["grub", "systemd-boot"] {
            let mut ctx = f.ctx.clone();
            ctx.system.bootloader.provider = provider.into();
            let runner = blkid(ScriptedRunner::new());
            let e = install_bootloader(&ctx, &runner, &f.map, &f.root).unwrap_err();
            assert!(
                matches!(crate::error::kind(&e), Some(Error::VerityHashPartitionNotFound)),
                "{e:#}"
            );
            assert!(runner.invocations().is_empty());
        }

        // A hash partition that is mounted does not count
        let mut f = verity()?;
        f.ctx.disk.partitions[3].mount_point = "/var".into();
        let runner = blkid(ScriptedRunner::new());
        let e = install_bootloader(&f.ctx, &runner, &f.map, &f.root).unwrap_err();
        assert!(matches!(
            crate::error::kind(&e),
            Some(Error::VerityHashPartitionNotFound)
        ));
        Ok(())
    }

    #[test]
    fn test_grub_verity_requires_boot() -> Result<()> {
        let mut f = verity()?;
        f.ctx.disk.partitions.remove(1);
        f.map = DeviceMap::default();
        f.map.insert("esp", "/dev/loop0p1");
        f.map.insert("root", "/dev/loop0p3");
        f.map.insert("hash", "/dev/loop0p4");
        let runner = blkid(ScriptedRunner::new());
        let e = install_bootloader(&f.ctx, &runner, &f.map, &f.root).unwrap_err();
        assert!(matches!(
            crate::error::kind(&e),
            Some(Error::VerityRequiresSeparateBoot)
        ));
        assert!(runner.invocations().is_empty());
        Ok(())
    }

    #[test]
    fn test_uuid_failures() -> Result<()> {
        let f = basic()?;
        let runner = blkid(ScriptedRunner::new().fail_on("-s UUID -o value /dev/loop0p2", "EIO"));
        let e = install_bootloader(&f.ctx, &runner, &f.map, &f.root).unwrap_err();
        match crate::error::kind(&e) {
            Some(Error::UuidRetrievalFailed(dev)) => assert_eq!(dev.as_str(), "/dev/loop0p2"),
            o => panic!("unexpected {o:?}: {e:#}"),
        }
        // Not retried
        assert_eq!(runner.count_matching("-s UUID"), 1);

        let runner = blkid(ScriptedRunner::new().on("-s PARTUUID -o value /dev/loop0p2", ""));
        let e = install_bootloader(&f.ctx, &runner, &f.map, &f.root).unwrap_err();
        assert!(matches!(
            crate::error::kind(&e),
            Some(Error::PartUuidRetrievalFailed(_))
        ));

        let f = verity()?;
        let runner = blkid(ScriptedRunner::new().fail_on("PARTUUID -o value /dev/loop0p4", "EIO"));
        let e = install_bootloader(&f.ctx, &runner, &f.map, &f.root).unwrap_err();
        assert!(matches!(
            crate::error::kind(&e),
            Some(Error::HashPartitionUuidFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn test_host_mounts() -> Result<()> {
        let f = basic()?;
        let runner = ScriptedRunner::new().on("mount", "");
        with_host_mounts(&runner, &f.root, || Ok(()))?;
        assert_eq!(runner.count_matching("mount --bind"), 3);
        assert_eq!(runner.count_matching("umount"), 3);

        let runner = ScriptedRunner::new().on("mount", "");
        let e = with_host_mounts(&runner, &f.root, || -> Result<()> { anyhow::bail!("boom") })
            .unwrap_err();
        assert_eq!(e.to_string(), "boom");
        assert_eq!(runner.count_matching("umount"), 3);
        Ok(())
    }
}
