//! The build context: disk layout and system configuration.
//!
//! A [`BuildContext`] is loaded once (from TOML, or JSON) and then passed by
//! reference into every stage of image assembly.

use std::collections::{BTreeSet, HashSet};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::bootloader::Provider;
use crate::error::Error;
use crate::partition_types;
use crate::uki::SigningKeys;

/// The id reserved for the dm-verity hash partition.
pub const HASH_PARTITION_ID: &str = "hash";

/// Mount point sentinel for partitions that are never mounted.
pub const UNMOUNTED: &str = "none";

/// The root mount point.
pub const ROOT_MOUNT_POINT: &str = "/";

/// The boot mount point.
pub const BOOT_MOUNT_POINT: &str = "/boot";

/// The kind of partition table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    /// GUID partition table
    #[default]
    Gpt,
    /// Master boot record
    Mbr,
}

impl std::fmt::Display for PartitionTableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PartitionTableType::Gpt => "gpt",
            PartitionTableType::Mbr => "mbr",
        };
        f.write_str(s)
    }
}

/// Markers that can be set on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionFlag {
    /// Bootable (MBR) or legacy BIOS bootable (GPT)
    Boot,
    /// EFI system partition
    Esp,
    /// Hidden from the firmware (GPT only)
    Hidden,
}

/// A partition, as authored by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSpec {
    /// Stable key, unique within a disk
    pub id: String,
    /// Partition name; written as the GPT partition name
    #[serde(default)]
    pub name: String,
    /// Semantic role, e.g. `esp`, `linux`, `linux-root-amd64`
    #[serde(rename = "type", default)]
    pub part_type: String,
    /// Explicit GPT type GUID, overriding `type`
    #[serde(default)]
    pub type_guid: Option<String>,
    /// Filesystem to create; empty for none
    #[serde(default)]
    pub fs_type: String,
    /// Absolute start offset
    pub start: String,
    /// Absolute end offset, or `"0"` for the rest of the disk
    pub end: String,
    /// Mount point; `""` or `"none"` for unmounted partitions
    #[serde(default)]
    pub mount_point: String,
    /// Options passed to `mount -o`
    #[serde(default)]
    pub mount_options: String,
    /// Partition flags
    #[serde(default)]
    pub flags: BTreeSet<PartitionFlag>,
}

impl PartitionSpec {
    /// Whether this partition is mounted into the install root.
    pub fn is_mounted(&self) -> bool {
        is_mount_point(&self.mount_point)
    }

    /// Whether this partition carries `flag`.
    pub fn has_flag(&self, flag: PartitionFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Whether `s` names a real mount point rather than one of the "unmounted"
/// sentinels.
pub(crate) fn is_mount_point(s: &str) -> bool {
    !(s.is_empty() || s == UNMOUNTED)
}

/// A disk and its partition layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiskSpec {
    /// Disk name
    #[serde(default)]
    pub name: String,
    /// Partition table type
    #[serde(default)]
    pub partition_table_type: PartitionTableType,
    /// Partitions, in on-disk order
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
    /// Total size of the disk image
    pub size: String,
}

impl DiskSpec {
    /// The image size in bytes.
    pub fn size_bytes(&self) -> Result<u64> {
        imagecraft_blockdev::parse_size(&self.size)
            .with_context(|| format!("Parsing size of disk {}", self.name))
    }

    /// Look up a partition by id.
    pub fn partition(&self, id: &str) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.id == id)
    }

    /// Look up the partition mounted at `mount_point`.
    pub fn partition_at(&self, mount_point: &str) -> Option<&PartitionSpec> {
        if !is_mount_point(mount_point) {
            return None;
        }
        self.partitions.iter().find(|p| p.mount_point == mount_point)
    }
}

/// Firmware boot type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootType {
    /// UEFI
    #[default]
    Efi,
    /// BIOS
    Legacy,
}

impl std::fmt::Display for BootType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BootType::Efi => "efi",
            BootType::Legacy => "legacy",
        };
        f.write_str(s)
    }
}

/// Bootloader selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootloaderConfig {
    /// Firmware boot type
    #[serde(default)]
    pub boot_type: BootType,
    /// One of `grub`, `grub2` or `systemd-boot`
    pub provider: String,
}

/// Kernel options.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KernelConfig {
    /// Extra kernel command line
    #[serde(default)]
    pub cmdline: String,
    /// Kernel image, relative to the install root; discovered in `/boot` if unset
    #[serde(default)]
    pub image: Option<Utf8PathBuf>,
    /// Initramfs, relative to the install root; discovered in `/boot` if unset
    #[serde(default)]
    pub initrd: Option<Utf8PathBuf>,
}

fn default_hash_algorithm() -> String {
    "sha256".to_string()
}

/// dm-verity protection of the root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImmutabilityConfig {
    /// Whether the root filesystem is verity-protected
    #[serde(default)]
    pub enabled: bool,
    /// Hash algorithm passed to the verity format tool
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
    /// Secure Boot key used to sign the unified kernel image
    #[serde(default)]
    pub signing_key: Option<Utf8PathBuf>,
    /// Certificate matching `signing-key`
    #[serde(default)]
    pub signing_cert: Option<Utf8PathBuf>,
}

impl Default for ImmutabilityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hash_algorithm: default_hash_algorithm(),
            signing_key: None,
            signing_cert: None,
        }
    }
}

impl ImmutabilityConfig {
    /// The unified kernel image signing material, when both the key and the
    /// certificate are configured.
    pub fn signing_keys(&self) -> Option<SigningKeys> {
        Some(SigningKeys {
            key: self.signing_key.clone()?,
            cert: self.signing_cert.clone()?,
        })
    }
}

/// Configuration of the installed system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemConfig {
    /// Hostname rendered into boot configuration
    #[serde(default)]
    pub hostname: String,
    /// Bootloader selection
    pub bootloader: BootloaderConfig,
    /// Kernel options
    #[serde(default)]
    pub kernel: KernelConfig,
    /// Root filesystem integrity
    #[serde(default)]
    pub immutability: ImmutabilityConfig,
}

/// Everything needed to assemble one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildContext {
    /// The disk layout
    pub disk: DiskSpec,
    /// The system configuration
    pub system: SystemConfig,
    /// Directory whose files override the built-in boot templates
    #[serde(default)]
    pub assets_dir: Option<Utf8PathBuf>,
}

impl BuildContext {
    /// Parse a build context from TOML.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("Parsing build context")
    }

    /// Load a build context from a file; `.json` files are parsed as JSON,
    /// anything else as TOML.
    #[context("Loading build context from {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        if path.extension() == Some("json") {
            serde_json::from_str(&buf).context("Parsing build context")
        } else {
            Self::from_toml_str(&buf)
        }
    }

    /// Check the partition layout and system configuration for consistency.
    ///
    /// This runs before any destructive device operation.
    #[context("Validating build context")]
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { Error::InvalidConfig(msg).into() };
        let disk = &self.disk;
        disk.size_bytes()?;
        if disk.partitions.is_empty() {
            return Err(invalid("no partitions defined".into()));
        }
        if disk.partition_table_type == PartitionTableType::Mbr && disk.partitions.len() > 4 {
            return Err(invalid(format!(
                "MBR supports at most 4 primary partitions, found {}",
                disk.partitions.len()
            )));
        }
        let mut ids = HashSet::new();
        let mut mount_points = HashSet::new();
        let last = disk.partitions.len() - 1;
        for (i, p) in disk.partitions.iter().enumerate() {
            if p.id.is_empty() {
                return Err(invalid(format!("partition {i} has an empty id")));
            }
            if !ids.insert(p.id.as_str()) {
                return Err(invalid(format!("duplicate partition id {:?}", p.id)));
            }
            if p.is_mounted() && !mount_points.insert(p.mount_point.as_str()) {
                return Err(invalid(format!("duplicate mount point {:?}", p.mount_point)));
            }
            if p.is_mounted() && !p.mount_point.starts_with('/') {
                return Err(invalid(format!(
                    "mount point {:?} of {} is not absolute",
                    p.mount_point, p.id
                )));
            }
            imagecraft_blockdev::parse_size(&p.start)
                .with_context(|| format!("Parsing start of partition {}", p.id))?;
            match imagecraft_blockdev::Extent::parse_end(&p.end)
                .with_context(|| format!("Parsing end of partition {}", p.id))?
            {
                imagecraft_blockdev::Extent::RestOfDisk if i != last => {
                    return Err(invalid(format!(
                        "only the last partition may extend to the end of the disk, not {}",
                        p.id
                    )));
                }
                _ => {}
            }
            partition_types::resolve(p, disk.partition_table_type)?;
            crate::disk::check_fs_type(&p.fs_type)?;
        }
        if disk.partition_at(ROOT_MOUNT_POINT).is_none() {
            return Err(Error::RootPartitionNotFound.into());
        }

        let provider = Provider::parse(&self.system.bootloader.provider);
        let immutability = &self.system.immutability;
        if immutability.signing_key.is_some() != immutability.signing_cert.is_some() {
            return Err(invalid("signing-key and signing-cert must be set together".into()));
        }
        if immutability.enabled {
            match disk.partition(HASH_PARTITION_ID) {
                Some(p) if !p.is_mounted() => {}
                _ => return Err(Error::VerityHashPartitionNotFound.into()),
            }
            if matches!(provider, Ok(Provider::Grub))
                && disk.partition_at(BOOT_MOUNT_POINT).is_none()
            {
                return Err(Error::VerityRequiresSeparateBoot.into());
            }
        }
        provider?;
        Ok(())
    }
}
