//! BLE UUID helpers.
//!
//! Service filters and characteristic lookups accept the short forms used in
//! the Bluetooth assigned numbers (`"FFF0"`, `"180A"`) as well as full
//! 128-bit UUIDs.

use uuid::Uuid;

use crate::error::{Error, Result};

/// The Bluetooth SIG base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
const BASE: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;
const BASE_MASK: u128 = 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;

/// Expand a 16-bit assigned number into a full UUID.
pub const fn from_short(short: u16) -> Uuid {
    from_short32(short as u32)
}

/// Expand a 32-bit assigned number into a full UUID.
pub const fn from_short32(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BASE)
}

/// Return the 16-bit form of a UUID derived from the base UUID, if it has one.
pub fn to_short(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_MASK != BASE {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Parse a UUID string in 16-bit, 32-bit, or 128-bit form.
///
/// # Errors
///
/// Returns [`Error::Configuration`] when the string is not a valid UUID.
///
/// # Example
///
/// ```
/// use ble_central::ble::uuids::{from_short, parse_uuid};
///
/// assert_eq!(parse_uuid("FFF0").unwrap(), from_short(0xFFF0));
/// ```
pub fn parse_uuid(value: &str) -> Result<Uuid> {
    let trimmed = value.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    // from_str_radix alone would take a leading sign.
    let is_hex = hex.bytes().all(|b| b.is_ascii_hexdigit());
    let parsed = match hex.len() {
        4 if is_hex => u16::from_str_radix(hex, 16).ok().map(from_short),
        8 if is_hex => u32::from_str_radix(hex, 16).ok().map(from_short32),
        4 | 8 => None,
        _ => Uuid::parse_str(hex).ok(),
    };

    parsed.ok_or_else(|| Error::configuration("service_uuid", value))
}
