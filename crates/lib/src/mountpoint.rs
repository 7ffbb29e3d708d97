//! Mapping logical partitions to the devices created for them.

use std::collections::BTreeMap;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{DiskSpec, PartitionSpec, HASH_PARTITION_ID, ROOT_MOUNT_POINT};
use crate::error::Error;

/// The block device created for each partition id of a disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceMap(BTreeMap<String, Utf8PathBuf>);

impl DeviceMap {
    /// Correlate partition devices, in layout order, with their specs.
    pub fn from_partitions(specs: &[PartitionSpec], devices: Vec<Utf8PathBuf>) -> Result<Self> {
        if specs.len() != devices.len() {
            anyhow::bail!(
                "Have {} partition devices for {} partitions",
                devices.len(),
                specs.len()
            );
        }
        Ok(Self(
            specs
                .iter()
                .map(|s| s.id.clone())
                .zip(devices)
                .collect(),
        ))
    }

    /// The device of partition `id`.
    pub fn get(&self, id: &str) -> Option<&Utf8Path> {
        self.0.get(id).map(|p| p.as_path())
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, id: impl Into<String>, device: impl Into<Utf8PathBuf>) {
        self.0.insert(id.into(), device.into());
    }
}

/// Find the device backing `mount_point`.
///
/// Returns `None` when no partition is mounted there, when that partition
/// has no device, or when `mount_point` is one of the "unmounted" sentinels.
pub fn device_for_mount_point<'a>(
    disk: &DiskSpec,
    map: &'a DeviceMap,
    mount_point: &str,
) -> Option<&'a Utf8Path> {
    disk.partition_at(mount_point)
        .and_then(|p| map.get(&p.id))
}

/// The device backing `/`.
pub fn root_device<'a>(disk: &DiskSpec, map: &'a DeviceMap) -> Result<&'a Utf8Path> {
    device_for_mount_point(disk, map, ROOT_MOUNT_POINT)
        .ok_or_else(|| Error::RootPartitionNotFound.into())
}

/// The device of the dm-verity hash partition: the partition with the
/// reserved id, which must not be mounted.
pub fn hash_device<'a>(disk: &DiskSpec, map: &'a DeviceMap) -> Result<&'a Utf8Path> {
    disk.partition(HASH_PARTITION_ID)
        .filter(|p| !p.is_mounted())
        .and_then(|p| map.get(&p.id))
        .ok_or_else(|| Error::VerityHashPartitionNotFound.into())
}
