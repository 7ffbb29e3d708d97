//! Writing a partition table and creating filesystems.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use imagecraft_blockdev::{Extent, Geometry};
use imagecraft_utils::CommandRunner;

use crate::config::{PartitionFlag, PartitionSpec, PartitionTableType};
use crate::error::Error;
use crate::partition_types;

/// GPT attribute bit which hides a partition from the firmware.
const GPT_ATTR_HIDDEN: &str = "GUID:62";

/// Where a partition with a start of zero begins: the first usable offset
/// that partitioning tools default to, past the label.
const FIRST_USABLE_OFFSET: u64 = 1024 * 1024;

/// A partition with its offsets resolved to sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    /// First sector
    pub start: u64,
    /// Length in sectors; `None` extends to the end of the disk
    pub size: Option<u64>,
    /// GPT type GUID or MBR type code
    pub type_id: String,
    /// GPT partition name
    pub name: String,
    /// MBR active flag
    pub bootable: bool,
    /// GPT attribute flags
    pub attrs: Vec<&'static str>,
}

fn plan_one(
    geometry: &Geometry,
    table: PartitionTableType,
    spec: &PartitionSpec,
) -> Result<PlannedPartition> {
    let sector = geometry.logical_sector_size;
    let start_bytes = match imagecraft_blockdev::parse_size(&spec.start)? {
        0 => FIRST_USABLE_OFFSET,
        n => n,
    };
    let start = geometry.align_sector_up(start_bytes / sector);
    let size = match Extent::parse_end(&spec.end)? {
        Extent::RestOfDisk => None,
        Extent::Bytes(end_bytes) => {
            let end = end_bytes / sector;
            if end <= start {
                return Err(Error::InvalidConfig(format!(
                    "partition {} ends at sector {end}, before its aligned start {start}",
                    spec.id
                ))
                .into());
            }
            Some(end - start)
        }
    };
    let type_id = partition_types::resolve(spec, table)?;
    let (bootable, attrs) = match table {
        PartitionTableType::Mbr => (spec.has_flag(PartitionFlag::Boot), Vec::new()),
        PartitionTableType::Gpt => {
            let mut attrs = Vec::new();
            if spec.has_flag(PartitionFlag::Boot) {
                attrs.push("LegacyBIOSBootable");
            }
            if spec.has_flag(PartitionFlag::Hidden) {
                attrs.push(GPT_ATTR_HIDDEN);
            }
            (false, attrs)
        }
    };
    Ok(PlannedPartition {
        start,
        size,
        type_id,
        name: spec.name.clone(),
        bootable,
        attrs,
    })
}

/// Resolve every partition to aligned sector offsets.
///
/// Partition starts are rounded up to the physical block size, never down.
/// A start of zero is placed at the first usable offset (1 MiB), so that
/// explicit sizes are computed from where the partition really begins.
/// This performs no I/O, so an invalid layout is rejected before anything
/// is written.
pub fn plan_partitions(
    geometry: &Geometry,
    table: PartitionTableType,
    partitions: &[PartitionSpec],
) -> Result<Vec<PlannedPartition>> {
    partitions
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            plan_one(geometry, table, spec).context(Error::PartitionFailed {
                index,
                id: spec.id.clone(),
            })
        })
        .collect()
}

/// Render the `sfdisk` script creating `planned` on a fresh label.
pub fn sfdisk_script(
    geometry: &Geometry,
    table: PartitionTableType,
    planned: &[PlannedPartition],
) -> String {
    let label = match table {
        PartitionTableType::Gpt => "gpt",
        PartitionTableType::Mbr => "dos",
    };
    let mut script = format!(
        "label: {label}\nunit: sectors\nsector-size: {}\n\n",
        geometry.logical_sector_size
    );
    for p in planned {
        let mut fields = vec![format!("start={}", p.start)];
        if let Some(size) = p.size {
            fields.push(format!("size={size}"));
        }
        fields.push(format!("type={}", p.type_id));
        if table == PartitionTableType::Gpt && !p.name.is_empty() {
            fields.push(format!("name=\"{}\"", p.name.replace('"', "")));
        }
        if !p.attrs.is_empty() {
            fields.push(format!("attrs=\"{}\"", p.attrs.join(" ")));
        }
        if p.bootable {
            fields.push("bootable".into());
        }
        script.push_str(&fields.join(", "));
        script.push('\n');
    }
    script
}

/// The filesystem types we can create.
const FS_TYPES: &[&str] = &[
    "vfat", "fat32", "ext2", "ext3", "ext4", "xfs", "btrfs", "swap",
];

/// Check that `fs_type` is empty or a filesystem we can create.
pub(crate) fn check_fs_type(fs_type: &str) -> Result<()> {
    if fs_type.is_empty() || FS_TYPES.contains(&fs_type) {
        return Ok(());
    }
    Err(Error::InvalidConfig(format!("unsupported filesystem type {fs_type:?}")).into())
}

fn mkfs_command(fs_type: &str, dev: &Utf8Path) -> Result<Option<Command>> {
    let mut cmd = match fs_type {
        "" => return Ok(None),
        "vfat" | "fat32" => {
            let mut c = Command::new("mkfs.vfat");
            c.args(["-F", "32"]);
            c
        }
        "ext2" | "ext3" | "ext4" => {
            let mut c = Command::new(format!("mkfs.{fs_type}"));
            c.arg("-F");
            c
        }
        "xfs" | "btrfs" => {
            let mut c = Command::new(format!("mkfs.{fs_type}"));
            c.arg("-f");
            c
        }
        "swap" => Command::new("mkswap"),
        o => {
            return Err(Error::InvalidConfig(format!("unsupported filesystem type {o:?}")).into())
        }
    };
    cmd.arg(dev);
    Ok(Some(cmd))
}

/// Create the filesystem requested by `spec` on `dev`; a partition with
/// no filesystem type is left alone.
#[context("Creating filesystem on {dev}")]
pub fn create_filesystem(
    runner: &dyn CommandRunner,
    dev: &Utf8Path,
    spec: &PartitionSpec,
) -> Result<()> {
    let Some(mut cmd) = mkfs_command(&spec.fs_type, dev)? else {
        tracing::debug!("No filesystem requested for {}", spec.id);
        return Ok(());
    };
    runner.run_silent(&mut cmd)
}

/// Partition `device` and create filesystems on the new partitions.
///
/// Returns the partition device paths in layout order.  This is not
/// transactional: on failure the device is left partially modified, and the
/// caller decides whether to wipe it or abandon the build.
#[context("Partitioning {device}")]
pub fn disk_partitions_create(
    runner: &dyn CommandRunner,
    device: &Utf8Path,
    partitions: &[PartitionSpec],
    table: PartitionTableType,
) -> Result<Vec<Utf8PathBuf>> {
    let geometry = imagecraft_blockdev::geometry(runner, device)?;
    tracing::debug!("{device}: {geometry:?}");
    let planned = plan_partitions(&geometry, table, partitions)?;
    let script = sfdisk_script(&geometry, table, &planned);
    tracing::debug!("Partitioning {device}:\n{script}");
    runner
        .run_with_input(
            Command::new("sfdisk").args(["--wipe", "always"]).arg(device),
            script.as_bytes(),
        )
        .context("Writing partition table")?;
    runner
        .run_silent(Command::new("partx").arg("-u").arg(device))
        .context("Rereading partition table")?;

    let created = imagecraft_blockdev::partitions_of(runner, device)?;
    if created.partitions.len() != partitions.len() {
        anyhow::bail!(
            "Expected {} partitions on {device}, found {}",
            partitions.len(),
            created.partitions.len()
        );
    }
    let nodes: Vec<Utf8PathBuf> = created
        .partitions
        .iter()
        .map(|p| p.path().to_owned())
        .collect();
    for (index, (spec, node)) in partitions.iter().zip(&nodes).enumerate() {
        create_filesystem(runner, node, spec).context(Error::PartitionFailed {
            index,
            id: spec.id.clone(),
        })?;
    }
    tracing::info!("Created {} partitions on {device}", nodes.len());
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagecraft_utils::ScriptedRunner;

    const LSBLK_1G: &str = r#"{"blockdevices": [{"name": "loop0", "path": "/dev/loop0",
        "size": 1073741824, "log-sec": 512, "phy-sec": 4096}]}"#;

    fn geometry() -> Geometry {
        Geometry {
            logical_sector_size: 512,
            physical_block_size: 4096,
        }
    }

    fn spec(id: &str, part_type: &str, fs_type: &str, start: &str, end: &str) -> PartitionSpec {
        PartitionSpec {
            id: id.into(),
            name: id.into(),
            part_type: part_type.into(),
            type_guid: None,
            fs_type: fs_type.into(),
            start: start.into(),
            end: end.into(),
            mount_point: String::new(),
            mount_options: String::new(),
            flags: Default::default(),
        }
    }

    fn sfdisk_json(nodes: &[&str]) -> String {
        let parts: Vec<_> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                serde_json::json!({
                    "node": n,
                    "start": 2048 * (i + 1),
                    "size": 2048,
                    "type": partition_types::LINUX_DATA_GUID,
                })
            })
            .collect();
        serde_json::json!({
            "partitiontable": {
                "label": "gpt",
                "id": "A67AA901-2C72-4818-B098-7F1CAC127279",
                "device": "/dev/loop0",
                "sectorsize": 512,
                "partitions": parts,
            }
        })
        .to_string()
    }

    #[test]
    fn test_alignment() {
        let mut p = spec("a", "linux", "", "512B", "1MiB");
        let planned = plan_partitions(&geometry(), PartitionTableType::Gpt, &[p.clone()]).unwrap();
        // Sector 1 is rounded up to the first 4096-byte aligned sector
        assert_eq!(planned[0].start, 8);
        assert_eq!(planned[0].size, Some(2048 - 8));

        p.start = "1MiB".into();
        p.end = "0".into();
        let planned = plan_partitions(&geometry(), PartitionTableType::Gpt, &[p]).unwrap();
        assert_eq!(planned[0].start, 2048);
        assert_eq!(planned[0].size, None);
    }

    #[test]
    fn test_zero_start_does_not_overlap() {
        let parts = [
            spec("esp", "esp", "vfat", "0", "100MiB"),
            spec("root", "linux", "ext4", "100MiB", "0"),
        ];
        let planned = plan_partitions(&geometry(), PartitionTableType::Gpt, &parts).unwrap();
        assert_eq!(planned[0].start, 2048);
        assert_eq!(planned[0].size, Some(204800 - 2048));
        let first_end = planned[0].start + planned[0].size.unwrap();
        assert!(first_end <= planned[1].start);
        let script = sfdisk_script(&geometry(), PartitionTableType::Gpt, &planned);
        assert!(script.contains("start=2048, size=202752, "), "{script}");

        // A 4K-native disk starts at the same byte offset
        let native = Geometry {
            logical_sector_size: 4096,
            physical_block_size: 4096,
        };
        let planned = plan_partitions(&native, PartitionTableType::Gpt, &parts).unwrap();
        assert_eq!(planned[0].start, 256);
        assert_eq!(planned[0].size, Some(25600 - 256));

        // An explicit end inside the first usable MiB leaves no room
        let parts = [spec("tiny", "linux", "", "0", "512KiB")];
        assert!(plan_partitions(&geometry(), PartitionTableType::Gpt, &parts).is_err());
    }

    #[test]
    fn test_plan_errors() {
        let parts = [
            spec("esp", "esp", "vfat", "1MiB", "100MiB"),
            spec("root", "floppy", "ext4", "100MiB", "0"),
        ];
        let e = plan_partitions(&geometry(), PartitionTableType::Gpt, &parts).unwrap_err();
        match crate::error::kind(&e) {
            Some(Error::PartitionFailed { index, id }) => {
                assert_eq!(*index, 1);
                assert_eq!(id, "root");
            }
            o => panic!("unexpected error {o:?}: {e:#}"),
        }
        let msg = format!("{e:#}");
        assert!(msg.contains("floppy"), "{msg}");

        let parts = [spec("esp", "esp", "vfat", "100MiB", "1MiB")];
        assert!(plan_partitions(&geometry(), PartitionTableType::Gpt, &parts).is_err());
    }

    #[test]
    fn test_sfdisk_script() {
        let mut esp = spec("esp", "esp", "vfat", "1MiB", "100MiB");
        esp.flags.insert(PartitionFlag::Esp);
        esp.flags.insert(PartitionFlag::Boot);
        let mut root = spec("root", "linux-root-amd64", "ext4", "100MiB", "0");
        root.flags.insert(PartitionFlag::Hidden);
        let parts = [esp, root];
        let planned = plan_partitions(&geometry(), PartitionTableType::Gpt, &parts).unwrap();
        similar_asserts::assert_eq!(
            sfdisk_script(&geometry(), PartitionTableType::Gpt, &planned),
            indoc::indoc! { "
            label: gpt
            unit: sectors
            sector-size: 512

            start=2048, size=202752, type=C12A7328-F81F-11D2-BA4B-00A0C93EC93B, name=\"esp\", \
            attrs=\"LegacyBIOSBootable\"
            start=204800, type=4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709, name=\"root\", \
            attrs=\"GUID:62\"
            " }
        );

        let planned = plan_partitions(&geometry(), PartitionTableType::Mbr, &parts).unwrap();
        similar_asserts::assert_eq!(
            sfdisk_script(&geometry(), PartitionTableType::Mbr, &planned),
            indoc::indoc! { r#"
            label: dos
            unit: sectors
            sector-size: 512

            start=2048, size=202752, type=ef, bootable
            start=204800, type=83
            "# }
        );
    }

    #[test]
    fn test_disk_partitions_create() -> Result<()> {
        let runner = ScriptedRunner::new()
            .on("lsblk", LSBLK_1G)
            .on("sfdisk --wipe always /dev/loop0", "")
            .on("partx -u /dev/loop0", "")
            .on("sfdisk -J /dev/loop0", sfdisk_json(&["/dev/loop0p1", "/dev/loop0p2"]))
            .on("mkfs", "");
        let parts = [
            spec("boot", "linux", "ext4", "1MiB", "100MiB"),
            spec("root", "linux", "xfs", "100MiB", "0"),
        ];
        let nodes =
            disk_partitions_create(&runner, "/dev/loop0".into(), &parts, PartitionTableType::Gpt)?;
        let nodes: Vec<_> = nodes.iter().map(|n| n.as_str()).collect();
        assert_eq!(nodes, ["/dev/loop0p1", "/dev/loop0p2"]);

        let invocations = runner.invocations();
        let script = invocations
            .iter()
            .find_map(|i| i.stdin.as_deref())
            .unwrap();
        let lines: Vec<_> = script.lines().filter(|l| l.contains("type=")).collect();
        assert_eq!(lines.len(), 2);
        // The last partition spans to the end of the disk
        assert!(!lines[1].contains("size="), "{}", lines[1]);
        similar_asserts::assert_eq!(
            runner.cmdlines()[4..].to_vec(),
            vec![
                "mkfs.ext4 -F /dev/loop0p1".to_string(),
                "mkfs.xfs -f /dev/loop0p2".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_invalid_layout_writes_nothing() {
        let runner = ScriptedRunner::new().on("lsblk", LSBLK_1G);
        let parts = [spec("root", "linux", "ext4", "1MiB", "bogus")];
        assert!(
            disk_partitions_create(&runner, "/dev/loop0".into(), &parts, PartitionTableType::Gpt)
                .is_err()
        );
        assert_eq!(runner.count_matching("sfdisk"), 0);
    }

    #[test]
    fn test_mkfs_failure_names_partition() {
        let runner = ScriptedRunner::new()
            .on("lsblk", LSBLK_1G)
            .on("sfdisk --wipe", "")
            .on("partx", "")
            .on("sfdisk -J", sfdisk_json(&["/dev/loop0p1", "/dev/loop0p2"]))
            .on("mkfs.vfat", "")
            .fail_on("mkswap", "device busy");
        let parts = [
            spec("esp", "esp", "vfat", "1MiB", "100MiB"),
            spec("swap", "swap", "swap", "100MiB", "0"),
        ];
        let e =
            disk_partitions_create(&runner, "/dev/loop0".into(), &parts, PartitionTableType::Gpt)
                .unwrap_err();
        assert!(matches!(
            crate::error::kind(&e),
            Some(Error::PartitionFailed { index: 1, .. })
        ));
        assert_eq!(runner.count_matching("mkfs.vfat -F 32 /dev/loop0p1"), 1);
    }

    #[test]
    fn test_partition_count_mismatch() {
        let runner = ScriptedRunner::new()
            .on("lsblk", LSBLK_1G)
            .on("sfdisk --wipe", "")
            .on("partx", "")
            .on("sfdisk -J", sfdisk_json(&["/dev/loop0p1"]));
        let parts = [
            spec("a", "linux", "", "1MiB", "100MiB"),
            spec("b", "linux", "", "100MiB", "0"),
        ];
        assert!(
            disk_partitions_create(&runner, "/dev/loop0".into(), &parts, PartitionTableType::Gpt)
                .is_err()
        );
    }
}
