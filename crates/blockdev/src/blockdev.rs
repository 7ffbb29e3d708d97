//! Block device inspection and manipulation.
//!
//! All queries shell out to util-linux tools (`lsblk`, `blkid`, `sfdisk`,
//! `losetup`) through an injected [`CommandRunner`].

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use imagecraft_utils::CommandRunner;

mod loopback;
pub use loopback::*;
mod size;
pub use size::*;

/// Named failures of this crate; these are carried inside [`anyhow::Error`]
/// and can be recovered with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum BlockdevError {
    /// The numeric part of a size string could not be parsed
    #[error("Invalid size format: {0:?}")]
    InvalidSizeFormat(String),
    /// The unit of a size string is not recognized
    #[error("Invalid size suffix {suffix:?} in {input:?}")]
    InvalidSizeSuffix {
        /// The full input
        input: String,
        /// The unrecognized unit
        suffix: String,
    },
    /// A device query tool failed, printed unexpected output, or did not
    /// report the requested device
    #[error("Querying {device} failed: {reason}")]
    DeviceQueryFailed {
        /// The queried device
        device: String,
        /// Why the query failed
        reason: String,
    },
    /// Detaching a loop device failed
    #[error("Detaching loop device {device} failed: {reason}")]
    DetachFailed {
        /// The loop device
        device: String,
        /// Why the detach failed
        reason: String,
    },
}

fn query_failed(device: impl AsRef<str>, reason: impl std::fmt::Display) -> anyhow::Error {
    BlockdevError::DeviceQueryFailed {
        device: device.as_ref().to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Kernel name, e.g. `loop0p1`
    pub name: String,
    /// Device type, e.g. `disk`, `loop`, `part`
    #[serde(rename = "type")]
    pub devtype: Option<String>,
    /// Size in bytes
    pub size: u64,
    /// Logical sector size
    #[serde(rename = "log-sec")]
    pub log_sec: Option<u64>,
    /// Physical block size
    #[serde(rename = "phy-sec")]
    pub phy_sec: Option<u64>,
    /// Partition label
    pub partlabel: Option<String>,
    /// Partition type GUID or MBR code
    pub parttype: Option<String>,
    /// Partition UUID
    pub partuuid: Option<String>,
    /// Child devices, e.g. partitions
    pub children: Option<Vec<Device>>,

    // Filesystem-related properties
    /// Filesystem label
    pub label: Option<String>,
    /// Filesystem UUID
    pub uuid: Option<String>,
    /// Filesystem type
    pub fstype: Option<String>,
    /// Full device path
    pub path: Option<String>,
}

impl Device {
    /// The device node; older `lsblk` lacks PATH, so we fall back to `/dev/<name>`.
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }
}

/// Logical and physical sector sizes of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// The logical ("hardware") sector size: the unit of partition offsets
    pub logical_sector_size: u64,
    /// The physical block size: partition starts are aligned to this
    pub physical_block_size: u64,
}

impl Geometry {
    /// Number of logical sectors per physical block, never zero.
    pub fn sectors_per_block(&self) -> u64 {
        (self.physical_block_size / self.logical_sector_size).max(1)
    }

    /// Round a sector offset up to the first physical-block-aligned sector.
    pub fn align_sector_up(&self, sector: u64) -> u64 {
        align_up(sector, self.sectors_per_block())
    }
}

fn lsblk_json(runner: &dyn CommandRunner, dev: &Utf8Path, cmd: &mut Command) -> Result<Device> {
    let devs: DevicesOutput = runner
        .run_and_parse_json(cmd)
        .map_err(|e| query_failed(dev, format!("{e:#}")))?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| query_failed(dev, "no device output from lsblk"))
}

/// Query a device and (recursively) its partitions.
#[context("Listing device {dev}")]
pub fn list_dev(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<Device> {
    lsblk_json(
        runner,
        dev,
        Command::new("lsblk").args(["-J", "-b", "-O"]).arg(dev),
    )
}

/// Enumerate the partitions of a device.
#[context("Listing partitions of {dev}")]
pub fn list_partitions(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<Vec<Device>> {
    let dev = list_dev(runner, dev)?;
    Ok(dev.children.unwrap_or_default())
}

/// Query the logical sector and physical block size of a device.
#[context("Querying geometry of {dev}")]
pub fn geometry(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<Geometry> {
    let d = lsblk_json(
        runner,
        dev,
        Command::new("lsblk")
            .args(["-J", "-b", "-d", "-o", "NAME,PATH,SIZE,LOG-SEC,PHY-SEC"])
            .arg(dev),
    )?;
    let logical_sector_size = d
        .log_sec
        .filter(|v| *v > 0)
        .ok_or_else(|| query_failed(dev, "missing logical sector size"))?;
    let physical_block_size = d
        .phy_sec
        .filter(|v| *v > 0)
        .ok_or_else(|| query_failed(dev, "missing physical block size"))?;
    Ok(Geometry {
        logical_sector_size,
        physical_block_size,
    })
}

/// The logical ("hardware") sector size of a device.
pub fn logical_sector_size(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<u64> {
    geometry(runner, dev).map(|g| g.logical_sector_size)
}

/// The physical block size of a device.
pub fn physical_block_size(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<u64> {
    geometry(runner, dev).map(|g| g.physical_block_size)
}

fn blkid_tag(runner: &dyn CommandRunner, dev: &Utf8Path, tag: &str) -> Result<String> {
    // Bypass the blkid cache; the devices we query were usually just created.
    let out = runner
        .run(
            Command::new("blkid")
                .args(["-c", "/dev/null", "-s", tag, "-o", "value"])
                .arg(dev),
        )
        .map_err(|e| query_failed(dev, format!("{e:#}")))?;
    let v = out.trim();
    if v.is_empty() {
        return Err(query_failed(dev, format!("no {tag} reported by blkid")));
    }
    Ok(v.to_string())
}

/// The filesystem UUID of a partition.
#[context("Querying UUID of {dev}")]
pub fn uuid_of(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<String> {
    blkid_tag(runner, dev, "UUID")
}

/// The partition UUID of a partition.
#[context("Querying PARTUUID of {dev}")]
pub fn partuuid_of(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<String> {
    blkid_tag(runner, dev, "PARTUUID")
}

/// The partition label of a partition.
#[context("Querying PARTLABEL of {dev}")]
pub fn partlabel_of(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<String> {
    blkid_tag(runner, dev, "PARTLABEL")
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// A partition as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct Partition {
    /// Device node
    pub node: String,
    /// Start, in sectors
    pub start: u64,
    /// Size, in sectors
    pub size: u64,
    /// Type GUID or MBR code
    #[serde(rename = "type")]
    pub parttype: String,
    /// Partition UUID (GPT only)
    pub uuid: Option<String>,
    /// Partition name (GPT only)
    pub name: Option<String>,
}

/// The kind of partition table.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// MBR
    Dos,
    /// GPT
    Gpt,
    /// Anything else
    Unknown(String),
}

/// A partition table as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    /// The kind of table
    pub label: PartitionType,
    /// Disk identifier
    pub id: String,
    /// The device node
    pub device: String,
    /// Sector size the offsets are expressed in
    pub sectorsize: Option<u64>,
    /// Partitions, in table order
    pub partitions: Vec<Partition>,
}

impl Partition {
    /// The device node of this partition.
    pub fn path(&self) -> &Utf8Path {
        self.node.as_str().into()
    }
}

/// Read back the partition table of a device.
#[context("Listing partitions of {dev}")]
pub fn partitions_of(runner: &dyn CommandRunner, dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = runner
        .run_and_parse_json(Command::new("sfdisk").arg("-J").arg(dev))
        .map_err(|e| query_failed(dev, format!("{e:#}")))?;
    Ok(o.partitiontable)
}

/// The device node of partition number `partno` (starting at 1) of `dev`.
///
/// Devices whose name ends in a digit (loop, nvme, mmcblk) use a `p` separator.
pub fn partition_node(dev: &Utf8Path, partno: u32) -> Utf8PathBuf {
    let sep = if dev.as_str().ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    format!("{dev}{sep}{partno}").into()
}

/// Report whether the number of in-flight I/O requests on a device changed
/// between two samples of its kernel I/O statistics, `interval` apart.
///
/// This never waits beyond a single interval; callers which need quiescence
/// (e.g. before detaching a loop device) poll it in their own loop.
#[context("Probing I/O activity of {dev}")]
pub fn io_busy(dev: &Utf8Path, interval: Duration) -> Result<bool> {
    let name = dev
        .file_name()
        .ok_or_else(|| query_failed(dev, "not a device path"))?;
    io_busy_at(
        Utf8Path::new(&format!("/sys/class/block/{name}/stat")),
        interval,
    )
}

// Index of the "in_flight" field of /sys/class/block/<dev>/stat
const STAT_IN_FLIGHT: usize = 8;

/// Implementation of [`io_busy`] reading the given statistics file.
pub fn io_busy_at(stat_path: &Utf8Path, interval: Duration) -> Result<bool> {
    let read = || -> Result<u64> {
        let content =
            std::fs::read_to_string(stat_path).map_err(|e| query_failed(stat_path, e))?;
        let field = content
            .split_whitespace()
            .nth(STAT_IN_FLIGHT)
            .ok_or_else(|| query_failed(stat_path, "truncated I/O statistics"))?;
        field.parse::<u64>().context("Parsing I/O statistics")
    };
    let before = read()?;
    std::thread::sleep(interval);
    let after = read()?;
    let busy = before != after;
    tracing::trace!("{stat_path}: busy={busy}");
    Ok(busy)
}

#[cfg(test)]
mod test {
    use super::*;
    use imagecraft_utils::ScriptedRunner;

    #[test]
    fn test_parse_lsblk() {
        let fixture = include_str!("../tests/fixtures/lsblk.json");
        let devs: DevicesOutput = serde_json::from_str(&fixture).unwrap();
        let dev = devs.blockdevices.into_iter().next().unwrap();
        let children = dev.children.as_deref().unwrap();
        assert_eq!(children.len(), 3);
        let first_child = &children[0];
        assert_eq!(
            first_child.parttype.as_deref().unwrap(),
            "c12a7328-f81f-11d2-ba4b-00a0c93ec93b"
        );
        assert_eq!(
            first_child.partuuid.as_deref().unwrap(),
            "3979e399-262f-4666-aabc-7ab5d3add2f0"
        );
        assert_eq!(children[2].path(), "/dev/loop0p3");
    }

    #[test]
    fn test_list_partitions() {
        let runner = ScriptedRunner::new().on(
            "lsblk -J -b -O /dev/loop0",
            include_str!("../tests/fixtures/lsblk.json"),
        );
        let parts = list_partitions(&runner, "/dev/loop0".into()).unwrap();
        let names: Vec<_> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["loop0p1", "loop0p2", "loop0p3"]);
        assert_eq!(parts[1].fstype.as_deref(), Some("ext4"));
    }

    #[test]
    fn test_geometry() {
        let runner = ScriptedRunner::new().on(
            "lsblk",
            indoc::indoc! { r#"
            {
               "blockdevices": [
                  {"name": "loop0", "path": "/dev/loop0", "size": 1073741824,
                   "log-sec": 512, "phy-sec": 4096}
               ]
            }
            "# },
        );
        let g = geometry(&runner, "/dev/loop0".into()).unwrap();
        assert_eq!(g.logical_sector_size, 512);
        assert_eq!(g.physical_block_size, 4096);
        assert_eq!(g.sectors_per_block(), 8);
        assert_eq!(g.align_sector_up(1), 8);
        assert_eq!(g.align_sector_up(2048), 2048);
    }

    fn expect_query_failed(e: anyhow::Error) {
        assert!(
            matches!(
                e.downcast_ref::<BlockdevError>(),
                Some(BlockdevError::DeviceQueryFailed { .. })
            ),
            "{e:#}"
        );
    }

    #[test]
    fn test_geometry_failures() {
        // Tool error
        let runner = ScriptedRunner::new().fail_on("lsblk", "not a block device");
        expect_query_failed(geometry(&runner, "/dev/loop9".into()).unwrap_err());
        // Not JSON
        let runner = ScriptedRunner::new().on("lsblk", "NAME LOG-SEC\nloop0 512\n");
        expect_query_failed(geometry(&runner, "/dev/loop0".into()).unwrap_err());
        // Device absent from the result set
        let runner = ScriptedRunner::new().on("lsblk", r#"{"blockdevices": []}"#);
        expect_query_failed(geometry(&runner, "/dev/loop0".into()).unwrap_err());
    }

    #[test]
    fn test_blkid() {
        let runner = ScriptedRunner::new()
            .on("-s UUID -o value /dev/loop0p2", "f00dfeed-1234\n")
            .on("-s PARTUUID -o value /dev/loop0p2", "abcd-01\n")
            .on("-s PARTLABEL", "\n");
        let dev = Utf8Path::new("/dev/loop0p2");
        assert_eq!(uuid_of(&runner, dev).unwrap(), "f00dfeed-1234");
        assert_eq!(partuuid_of(&runner, dev).unwrap(), "abcd-01");
        // Empty output means the tag is absent
        expect_query_failed(partlabel_of(&runner, dev).unwrap_err());
    }

    #[test]
    fn test_parse_sfdisk() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
            "partitiontable": {
               "label": "gpt",
               "id": "A67AA901-2C72-4818-B098-7F1CAC127279",
               "device": "/dev/loop0",
               "unit": "sectors",
               "firstlba": 34,
               "lastlba": 2097118,
               "sectorsize": 512,
               "partitions": [
                  {
                     "node": "/dev/loop0p1",
                     "start": 2048,
                     "size": 202752,
                     "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
                     "uuid": "58A4C5F0-BD12-424C-B563-195AC65A25DD",
                     "name": "esp"
                  },{
                     "node": "/dev/loop0p2",
                     "start": 204800,
                     "size": 1892319,
                     "type": "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709",
                     "uuid": "F51ABB0D-DA16-4A21-83CB-37F4C805AAA0",
                     "name": "root"
                  }
               ]
            }
         }
        "# };
        let runner = ScriptedRunner::new().on("sfdisk -J /dev/loop0", fixture);
        let table = partitions_of(&runner, "/dev/loop0".into())?;
        assert_eq!(table.label, PartitionType::Gpt);
        assert_eq!(table.device, "/dev/loop0");
        let paths: Vec<_> = table.partitions.iter().map(|p| p.path().as_str()).collect();
        assert_eq!(paths, ["/dev/loop0p1", "/dev/loop0p2"]);
        assert_eq!(table.partitions[1].size, 1892319);
        // Output that is not JSON is a query failure
        let runner = ScriptedRunner::new().on("sfdisk -J", "Disk /dev/loop0: 1 GiB");
        expect_query_failed(partitions_of(&runner, "/dev/loop0".into()).unwrap_err());
        Ok(())
    }

    #[test]
    fn test_partition_node() {
        assert_eq!(partition_node("/dev/loop0".into(), 1), "/dev/loop0p1");
        assert_eq!(partition_node("/dev/nvme0n1".into(), 3), "/dev/nvme0n1p3");
        assert_eq!(partition_node("/dev/sda".into(), 2), "/dev/sda2");
    }

    #[test]
    fn test_io_busy() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().join("stat"))?;
        std::fs::write(&path, "  100 0 800 10 0 0 0 0 0 12 10\n")?;
        assert!(!io_busy_at(&path, Duration::from_millis(1))?);
        std::fs::write(&path, "garbage 0 0 0 0 0 0 0 x 0 0\n")?;
        assert!(io_busy_at(&path, Duration::from_millis(1)).is_err());
        expect_query_failed(
            io_busy_at(&path.with_file_name("missing"), Duration::from_millis(1)).unwrap_err(),
        );
        Ok(())
    }

    #[test]
    fn test_io_busy_in_flight_only() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().join("stat"))?;
        std::fs::write(&path, "100 0 800 10 0 0 0 0 3 12 10\n")?;
        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                // Completed-I/O counters moved but nothing is in flight
                std::fs::write(&path, "180 0 900 20 0 0 0 0 3 14 12\n")
            })
        };
        assert!(!io_busy_at(&path, Duration::from_millis(300))?);
        writer.join().unwrap()?;

        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                std::fs::write(&path, "180 0 900 20 0 0 0 0 0 14 12\n")
            })
        };
        assert!(io_busy_at(&path, Duration::from_millis(300))?);
        writer.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn test_io_busy_truncated() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().join("stat"))?;
        std::fs::write(&path, "100 0 800\n")?;
        expect_query_failed(io_busy_at(&path, Duration::from_millis(1)).unwrap_err());
        Ok(())
    }
}
