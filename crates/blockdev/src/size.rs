//! Human-readable size strings.
//!
//! A size is either a bare integer, which is a count of MiB, or a number
//! followed by one of the units `B`, `KB`, `MB`, `GB` (powers of 1000) or
//! `KiB`, `MiB`, `GiB` (powers of 1024).  The number may carry a fractional
//! part, which is what [`format_size`] emits.

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

use crate::BlockdevError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// The string used in a partition's `end` to mean "the rest of the disk".
pub const REST_OF_DISK: &str = "0";

fn unit_multiplier(unit: &str) -> Option<u64> {
    let v = match unit {
        // A bare number is a count of MiB
        "" => MIB,
        "B" => 1,
        "KB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "KiB" => KIB,
        "MiB" => MIB,
        "GiB" => GIB,
        _ => return None,
    };
    Some(v)
}

/// Parse a size string into a count of bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX
        .get_or_init(|| Regex::new(r"^\s*([0-9]+)(?:\.([0-9]{1,18}))?\s*([A-Za-z]*)\s*$").unwrap());
    let invalid = || BlockdevError::InvalidSizeFormat(s.to_string());
    let caps = regex.captures(s).ok_or_else(invalid)?;
    let unit = caps.get(3).map_or("", |m| m.as_str());
    let mul = unit_multiplier(unit).ok_or_else(|| BlockdevError::InvalidSizeSuffix {
        input: s.to_string(),
        suffix: unit.to_string(),
    })?;
    let whole: u128 = caps[1].parse().map_err(|_| invalid())?;
    let mut bytes = whole.checked_mul(mul as u128).ok_or_else(invalid)?;
    if let Some(frac) = caps.get(2) {
        let digits = frac.as_str();
        let numerator: u128 = digits.parse().map_err(|_| invalid())?;
        let denominator = 10u128.pow(digits.len() as u32);
        // Fractions of a byte are truncated
        bytes += numerator * mul as u128 / denominator;
    }
    u64::try_from(bytes).map_err(|_| invalid().into())
}

/// A partition boundary: an absolute byte offset, or the end of the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// Absolute offset from the start of the disk, in bytes
    Bytes(u64),
    /// Everything up to the end of the disk
    RestOfDisk,
}

impl Extent {
    /// Parse a partition `end`; the [`REST_OF_DISK`] sentinel never reaches
    /// size arithmetic.
    pub fn parse_end(s: &str) -> Result<Self> {
        if s.trim() == REST_OF_DISK {
            return Ok(Self::RestOfDisk);
        }
        parse_size(s).map(Self::Bytes)
    }
}

/// Format a byte count using binary units with two decimals.
///
/// The largest unit that represents the value exactly at two decimals is
/// chosen, so that parsing the result yields the same byte count.
pub fn format_size(bytes: u64) -> String {
    let hundredths = bytes as u128 * 100;
    let (unit, mul) = [("GiB", GIB), ("MiB", MIB), ("KiB", KIB)]
        .into_iter()
        .find(|(_, mul)| hundredths % (*mul as u128) == 0)
        .unwrap_or(("B", 1));
    let v = hundredths / mul as u128;
    format!("{}.{:02}{unit}", v / 100, v % 100)
}

/// Round `value` up to the nearest multiple of `align`.
///
/// An alignment of zero leaves the value unchanged.
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}
