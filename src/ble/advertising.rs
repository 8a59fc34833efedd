//! Advertising data parsing.
//!
//! Decodes the AD structures a peripheral broadcasts before a connection is
//! made. Each structure is `length | type | value`, where `length` covers the
//! type byte and the value.

use bytes::Bytes;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ble::uuids::{from_short, from_short32};
use crate::error::{Error, Result};

/// AD type identifiers from the Bluetooth assigned numbers.
mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_UUID16: u8 = 0x02;
    pub const COMPLETE_UUID16: u8 = 0x03;
    pub const INCOMPLETE_UUID32: u8 = 0x04;
    pub const COMPLETE_UUID32: u8 = 0x05;
    pub const INCOMPLETE_UUID128: u8 = 0x06;
    pub const COMPLETE_UUID128: u8 = 0x07;
    pub const SHORT_NAME: u8 = 0x08;
    pub const COMPLETE_NAME: u8 = 0x09;
    pub const TX_POWER: u8 = 0x0A;
    pub const SERVICE_DATA_UUID16: u8 = 0x16;
    pub const SERVICE_DATA_UUID32: u8 = 0x20;
    pub const SERVICE_DATA_UUID128: u8 = 0x21;
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

/// Parsed advertisement payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementData {
    /// Advertised local name (complete name preferred over shortened).
    pub local_name: Option<String>,
    /// Advertised service UUIDs, in the order they appeared.
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Bytes>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Bytes>,
    /// Advertised transmit power level in dBm.
    pub tx_power: Option<i16>,
    /// Whether the advertisement is connectable, when the native stack reports it.
    pub connectable: Option<bool>,
    /// Raw advertising flags byte.
    pub flags: Option<u8>,
}

impl AdvertisementData {
    /// LE General Discoverable Mode flag.
    pub fn is_general_discoverable(&self) -> bool {
        self.flags.map(|f| f & 0x02 != 0).unwrap_or(false)
    }

    /// Parse raw advertisement bytes.
    ///
    /// A zero length byte terminates the significant part of the payload;
    /// the remainder is padding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidData`] if a structure runs past the end of the
    /// buffer or a fixed-size field has the wrong length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut ad = Self::default();
        let mut short_name = None;
        let mut offset = 0;

        while offset < data.len() {
            let length = data[offset] as usize;
            if length == 0 {
                break;
            }

            let end = offset + 1 + length;
            if end > data.len() {
                return Err(Error::InvalidData {
                    context: format!(
                        "AD structure at offset {} claims {} bytes, only {} remain",
                        offset,
                        length,
                        data.len() - offset - 1
                    ),
                });
            }

            let kind = data[offset + 1];
            let value = &data[offset + 2..end];

            match kind {
                ad_type::FLAGS => ad.flags = value.first().copied(),
                ad_type::INCOMPLETE_UUID16 | ad_type::COMPLETE_UUID16 => {
                    for chunk in exact_chunks(value, 2, "16-bit UUID list")? {
                        ad.service_uuids
                            .push(from_short(u16::from_le_bytes([chunk[0], chunk[1]])));
                    }
                }
                ad_type::INCOMPLETE_UUID32 | ad_type::COMPLETE_UUID32 => {
                    for chunk in exact_chunks(value, 4, "32-bit UUID list")? {
                        ad.service_uuids.push(from_short32(u32::from_le_bytes([
                            chunk[0], chunk[1], chunk[2], chunk[3],
                        ])));
                    }
                }
                ad_type::INCOMPLETE_UUID128 | ad_type::COMPLETE_UUID128 => {
                    for chunk in exact_chunks(value, 16, "128-bit UUID list")? {
                        ad.service_uuids.push(uuid128_le(chunk));
                    }
                }
                ad_type::SHORT_NAME => {
                    short_name = Some(String::from_utf8_lossy(value).into_owned());
                }
                ad_type::COMPLETE_NAME => {
                    ad.local_name = Some(String::from_utf8_lossy(value).into_owned());
                }
                ad_type::TX_POWER => {
                    let level = value.first().ok_or_else(|| Error::InvalidData {
                        context: "empty tx power level".to_string(),
                    })?;
                    ad.tx_power = Some(i16::from(*level as i8));
                }
                ad_type::SERVICE_DATA_UUID16 => {
                    let (uuid, rest) = split_service_data(value, 2)?;
                    ad.service_data
                        .insert(from_short(u16::from_le_bytes([uuid[0], uuid[1]])), rest);
                }
                ad_type::SERVICE_DATA_UUID32 => {
                    let (uuid, rest) = split_service_data(value, 4)?;
                    let short = u32::from_le_bytes([uuid[0], uuid[1], uuid[2], uuid[3]]);
                    ad.service_data.insert(from_short32(short), rest);
                }
                ad_type::SERVICE_DATA_UUID128 => {
                    let (uuid, rest) = split_service_data(value, 16)?;
                    ad.service_data.insert(uuid128_le(uuid), rest);
                }
                ad_type::MANUFACTURER_DATA => {
                    if value.len() < 2 {
                        return Err(Error::InvalidData {
                            context: "manufacturer data shorter than company id".to_string(),
                        });
                    }
                    let company = u16::from_le_bytes([value[0], value[1]]);
                    ad.manufacturer_data
                        .insert(company, Bytes::copy_from_slice(&value[2..]));
                }
                _ => {}
            }

            offset = end;
        }

        if ad.local_name.is_none() {
            ad.local_name = short_name;
        }

        Ok(ad)
    }

    /// Check if the advertisement lists the given service.
    pub fn advertises_service(&self, uuid: &Uuid) -> bool {
        self.service_uuids.contains(uuid) || self.service_data.contains_key(uuid)
    }

    /// Check if the advertisement lists at least one of the given services.
    ///
    /// An empty filter matches every advertisement.
    pub fn matches_any(&self, services: &[Uuid]) -> bool {
        services.is_empty() || services.iter().any(|s| self.advertises_service(s))
    }
}

fn exact_chunks<'a>(
    value: &'a [u8],
    size: usize,
    what: &str,
) -> Result<std::slice::ChunksExact<'a, u8>> {
    if value.len() % size != 0 {
        return Err(Error::InvalidData {
            context: format!("{} has {} bytes, not a multiple of {}", what, value.len(), size),
        });
    }
    Ok(value.chunks_exact(size))
}

fn split_service_data(value: &[u8], uuid_len: usize) -> Result<(&[u8], Bytes)> {
    if value.len() < uuid_len {
        return Err(Error::InvalidData {
            context: format!("service data shorter than its {}-byte UUID", uuid_len),
        });
    }
    let (uuid, rest) = value.split_at(uuid_len);
    Ok((uuid, Bytes::copy_from_slice(rest)))
}

/// 128-bit UUIDs are transmitted little-endian.
fn uuid128_le(bytes: &[u8]) -> Uuid {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(bytes);
    buf.reverse();
    Uuid::from_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_payload() -> Vec<u8> {
        vec![
            0x02, 0x01, 0x06, // flags: LE general discoverable, BR/EDR not supported
            0x03, 0x03, 0xF0, 0xFF, // complete 16-bit uuids: FFF0
            0x08, 0x09, b'V', b'E', b'E', b'P', b'E', b'K', // complete name
            0x02, 0x0A, 0xF4, // tx power -12 dBm
            0x05, 0xFF, 0x4C, 0x00, 0x01, 0x02, // manufacturer 0x004C
            0x04, 0x16, 0x0F, 0x18, 0x64, // service data battery (0x180F) = 100
            0x00, 0x00, 0x00, // padding
        ]
    }

    #[test]
    fn test_parse_full_payload() {
        let ad = AdvertisementData::parse(&sample_payload()).unwrap();

        assert_eq!(ad.local_name.as_deref(), Some("VEEPEAK"));
        assert_eq!(ad.service_uuids, vec![from_short(0xFFF0)]);
        assert_eq!(ad.tx_power, Some(-12));
        assert_eq!(ad.flags, Some(0x06));
        assert!(ad.is_general_discoverable());
        assert_eq!(
            ad.manufacturer_data.get(&0x004C).map(|b| b.as_ref()),
            Some(&[0x01, 0x02][..])
        );
        assert_eq!(
            ad.service_data.get(&from_short(0x180F)).map(|b| b.as_ref()),
            Some(&[0x64][..])
        );
        assert_eq!(ad.connectable, None);
    }

    #[test]
    fn test_short_name_used_when_no_complete_name() {
        let ad = AdvertisementData::parse(&[0x04, 0x08, b'O', b'B', b'D']).unwrap();
        assert_eq!(ad.local_name.as_deref(), Some("OBD"));

        let ad = AdvertisementData::parse(&[
            0x04, 0x08, b'O', b'B', b'D', 0x05, 0x09, b'O', b'B', b'D', b'2',
        ])
        .unwrap();
        assert_eq!(ad.local_name.as_deref(), Some("OBD2"));
    }

    #[test]
    fn test_parse_128_bit_uuid_little_endian() {
        let uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
        let mut payload = vec![0x11, 0x07];
        let mut le = *uuid.as_bytes();
        le.reverse();
        payload.extend_from_slice(&le);

        let ad = AdvertisementData::parse(&payload).unwrap();
        assert_eq!(ad.service_uuids, vec![uuid]);
    }

    #[test]
    fn test_truncated_structure_is_invalid() {
        let err = AdvertisementData::parse(&[0x05, 0x09, b'A', b'B']).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
    }

    #[test]
    fn test_misaligned_uuid_list_is_invalid() {
        let err = AdvertisementData::parse(&[0x04, 0x03, 0xF0, 0xFF, 0x01]).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
    }

    #[test]
    fn test_empty_payload() {
        let ad = AdvertisementData::parse(&[]).unwrap();
        assert_eq!(ad, AdvertisementData::default());
    }

    #[test]
    fn test_matches_any() {
        let ad = AdvertisementData::parse(&sample_payload()).unwrap();
        assert!(ad.matches_any(&[]));
        assert!(ad.matches_any(&[from_short(0x1234), from_short(0xFFF0)]));
        assert!(ad.matches_any(&[from_short(0x180F)]));
        assert!(!ad.matches_any(&[from_short(0x1234)]));
    }
}
