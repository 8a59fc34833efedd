//! Utility functions for the ble-central crate.

/// Normalize a hardware address for use as a cache key.
///
/// Trims whitespace, upper-cases hex digits, and accepts `-` as a separator.
///
/// # Example
///
/// ```
/// use ble_central::utils::normalize_address;
///
/// assert_eq!(normalize_address(" aa-bb-cc-dd-ee-ff "), "AA:BB:CC:DD:EE:FF");
/// ```
pub fn normalize_address(address: &str) -> String {
    address.trim().replace('-', ":").to_uppercase()
}

/// Format a byte slice as space separated hex, truncated to `max` bytes.
///
/// # Example
///
/// ```
/// use ble_central::utils::hex_preview;
///
/// assert_eq!(hex_preview(&[0x01, 0xAB, 0xFF], 2), "01 AB ..");
/// ```
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let mut out = data
        .iter()
        .take(max)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > max {
        out.push_str(" ..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("aa:bb:cc:dd:ee:ff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_address("AA:BB"), "AA:BB");
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[], 4), "");
        assert_eq!(hex_preview(&[0x41, 0x54, 0x5A], 8), "41 54 5A");
    }
}
