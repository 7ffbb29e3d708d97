//! Mapping of semantic partition types to GPT type GUIDs and MBR type codes.
//!
//! GUIDs are from the Discoverable Partitions Specification
//! <https://uapi-group.org/specifications/specs/discoverable_partitions_specification/>
//! plus the few well-known non-Linux ones.

use anyhow::Result;

use crate::config::{PartitionFlag, PartitionSpec, PartitionTableType};
use crate::error::Error;

/// EFI system partition
pub const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// BIOS boot partition, holding GRUB's core image on GPT disks
pub const BIOS_BOOT_GUID: &str = "21686148-6449-6E6F-744E-656564454649";
/// Generic Linux filesystem data
pub const LINUX_DATA_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

/// MBR code of the EFI system partition
pub const ESP_MBR_CODE: &str = "ef";

const GPT_TYPES: &[(&str, &str)] = &[
    ("esp", ESP_GUID),
    ("bios", BIOS_BOOT_GUID),
    ("linux", LINUX_DATA_GUID),
    ("xbootldr", "BC13C2FF-59E6-4262-A352-B275FD6F7172"),
    ("swap", "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F"),
    ("home", "933AC7E1-2EB4-4F13-B844-0E14E2AEF915"),
    ("srv", "3B8F8425-20E0-4F3B-907F-1A25A76F98E8"),
    ("var", "4D21B016-B534-45C2-A9FB-5C16E091FD2D"),
    ("tmp", "7EC6F557-3BC5-4ACA-B293-16EF5DF639D1"),
    ("linux-root-amd64", "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709"),
    ("linux-root-arm64", "B921B045-1DF0-41C3-AF44-4C6F280D3FAE"),
    ("linux-root-verity-amd64", "2C7357ED-EBD2-46D9-AEC1-23D437EC2BF5"),
    ("linux-root-verity-arm64", "DF3300CE-D69F-4C92-978C-9BFB0F38D820"),
    ("linux-usr-amd64", "8484680C-9521-48C6-9C11-B0720656F69E"),
    ("linux-usr-verity-amd64", "77FF5F63-E7B6-4633-ACF4-1565B864C0E6"),
];

/// The GPT type GUID of a semantic partition type.
pub fn gpt_type_guid(part_type: &str) -> Option<&'static str> {
    GPT_TYPES
        .iter()
        .find(|(name, _)| *name == part_type)
        .map(|(_, guid)| *guid)
}

/// The MBR type code of a semantic partition type.
pub fn mbr_type_code(part_type: &str) -> Option<&'static str> {
    match part_type {
        "esp" => Some(ESP_MBR_CODE),
        "swap" => Some("82"),
        "linux" | "home" | "srv" | "var" | "tmp" | "xbootldr" => Some("83"),
        t if t.starts_with("linux-") => Some("83"),
        _ => None,
    }
}

/// Resolve the type identifier written into the partition table for `spec`.
///
/// An explicit `type-guid` wins on GPT, then the `esp` flag, then the
/// semantic type.
pub fn resolve(spec: &PartitionSpec, table: PartitionTableType) -> Result<String> {
    let is_esp = spec.has_flag(PartitionFlag::Esp);
    let r = match table {
        PartitionTableType::Gpt => match spec.type_guid.as_deref() {
            Some(guid) if !guid.is_empty() => Some(guid.to_ascii_uppercase()),
            _ if is_esp => Some(ESP_GUID.to_string()),
            _ => gpt_type_guid(&spec.part_type).map(ToOwned::to_owned),
        },
        PartitionTableType::Mbr if is_esp => Some(ESP_MBR_CODE.to_string()),
        PartitionTableType::Mbr => mbr_type_code(&spec.part_type).map(ToOwned::to_owned),
    };
    r.ok_or_else(|| {
        Error::UnknownPartitionType {
            name: spec.part_type.clone(),
            table,
        }
        .into()
    })
}
