//! Interface identification and descriptor header layout
//!
//! The descriptor starts with a fixed little-endian header:
//!
//! | offset | field     | type |
//! |--------|-----------|------|
//! | 0      | `size`    | u16  |
//! | 2      | `version` | u16  |
//!
//! `size` is the number of descriptor bytes the provider actually populated.
//! Consumers never use an entry that lies past `size`, whatever `version` says.

use crate::error::InterfaceError;
use crate::version::{BASE_DESCRIPTOR_SIZE, InterfaceVersion};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::str::FromStr;

/// Encoded header length in bytes
pub const HEADER_LEN: usize = 4;

/// Globally unique 128-bit interface identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(u128);

/// Identifier of the forward-progress deferral interface
pub const FORWARD_PROGRESS_INTERFACE_ID: InterfaceId =
    InterfaceId::from_u128(0x5c8f_1d3a_6b2e_4e71_9a0d_3f4b_8c2e_17a6);

impl InterfaceId {
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xffff_ffff_ffff
        )
    }
}

impl FromStr for InterfaceId {
    type Err = InterfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        let hex: String = trimmed.chars().filter(|c| *c != '-').collect();

        if hex.len() != 32 {
            return Err(InterfaceError::MalformedId(s.to_string()));
        }

        u128::from_str_radix(&hex, 16)
            .map(Self)
            .map_err(|_| InterfaceError::MalformedId(s.to_string()))
    }
}

/// Size/version header carried by every descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeader {
    /// Populated descriptor length in bytes
    pub size: u16,
    /// Interface revision
    pub version: InterfaceVersion,
}

impl DescriptorHeader {
    /// Header describing a fully populated descriptor of `version`
    pub const fn for_version(version: InterfaceVersion) -> Self {
        Self {
            size: version.descriptor_size(),
            version,
        }
    }

    /// Encode the header in its little-endian wire layout
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u16(&mut buf[0..2], self.size);
        LittleEndian::write_u16(&mut buf[2..4], self.version.0);
        buf
    }

    /// Decode a header, reading nothing past the first [`HEADER_LEN`] bytes
    pub fn decode(buf: &[u8]) -> Result<Self, InterfaceError> {
        if buf.len() < HEADER_LEN {
            return Err(InterfaceError::DescriptorTooShort {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }

        Ok(Self {
            size: LittleEndian::read_u16(&buf[0..2]),
            version: InterfaceVersion(LittleEndian::read_u16(&buf[2..4])),
        })
    }

    /// Highest known revision whose entries all fit inside `size`
    ///
    /// Returns `None` when not even version 1 is covered.
    pub fn effective_version(&self) -> Option<InterfaceVersion> {
        InterfaceVersion::KNOWN
            .into_iter()
            .find(|v| *v <= self.version && v.descriptor_size() <= self.size)
    }

    /// Whether every entry of `version` can be used through this descriptor
    pub fn covers(&self, version: InterfaceVersion) -> bool {
        self.effective_version().is_some_and(|v| v >= version)
    }

    /// Whether the base header (context, acquire, release) is populated
    pub fn has_base(&self) -> bool {
        self.size >= BASE_DESCRIPTOR_SIZE
    }

    /// Agree on the descriptor both sides can use
    ///
    /// `self` is what the consumer asked for, `offered` what the provider
    /// implements. The result never exceeds either side.
    pub fn negotiate(&self, offered: &DescriptorHeader) -> Option<DescriptorHeader> {
        let negotiated = DescriptorHeader {
            size: self.size.min(offered.size),
            version: self.version.min(offered.version),
        };
        negotiated.effective_version().map(|_| negotiated)
    }
}

impl fmt::Display for DescriptorHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.version, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{CURRENT_VERSION, V1_DESCRIPTOR_SIZE, V2_DESCRIPTOR_SIZE};

    #[test]
    fn test_interface_id_display_and_parse() {
        let text = FORWARD_PROGRESS_INTERFACE_ID.to_string();
        assert_eq!(text, "5c8f1d3a-6b2e-4e71-9a0d-3f4b8c2e17a6");

        let parsed: InterfaceId = text.parse().unwrap();
        assert_eq!(parsed, FORWARD_PROGRESS_INTERFACE_ID);

        let braced: InterfaceId = "{5C8F1D3A-6B2E-4E71-9A0D-3F4B8C2E17A6}".parse().unwrap();
        assert_eq!(braced, FORWARD_PROGRESS_INTERFACE_ID);
    }

    #[test]
    fn test_interface_id_rejects_malformed() {
        assert!("5c8f1d3a-6b2e".parse::<InterfaceId>().is_err());
        assert!("zz8f1d3a-6b2e-4e71-9a0d-3f4b8c2e17a6".parse::<InterfaceId>().is_err());
    }

    #[test]
    fn test_header_encoding_is_little_endian() {
        let header = DescriptorHeader::for_version(CURRENT_VERSION);
        assert_eq!(header.encode(), [64, 0, 2, 0]);
    }

    #[test]
    fn test_decode_short_buffer() {
        let err = DescriptorHeader::decode(&[56, 0, 1]).unwrap_err();
        assert!(matches!(
            err,
            InterfaceError::DescriptorTooShort {
                needed: 4,
                available: 3
            }
        ));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let header = DescriptorHeader::decode(&[56, 0, 1, 0, 0xff, 0xff]).unwrap();
        assert_eq!(header.size, V1_DESCRIPTOR_SIZE);
        assert_eq!(header.version, InterfaceVersion::V1);
    }

    #[test]
    fn test_truncated_descriptor_degrades_to_v1() {
        // Claims version 2 but only populated the version 1 entries
        let header = DescriptorHeader {
            size: V1_DESCRIPTOR_SIZE,
            version: InterfaceVersion::V2,
        };
        assert_eq!(header.effective_version(), Some(InterfaceVersion::V1));
        assert!(header.covers(InterfaceVersion::V1));
        assert!(!header.covers(InterfaceVersion::V2));
    }

    #[test]
    fn test_newer_version_degrades_to_known() {
        let header = DescriptorHeader {
            size: V2_DESCRIPTOR_SIZE + 16,
            version: InterfaceVersion(5),
        };
        assert_eq!(header.effective_version(), Some(InterfaceVersion::V2));
    }

    #[test]
    fn test_base_only_descriptor_has_no_version() {
        let header = DescriptorHeader {
            size: BASE_DESCRIPTOR_SIZE,
            version: InterfaceVersion::V2,
        };
        assert!(header.has_base());
        assert_eq!(header.effective_version(), None);
    }

    #[test]
    fn test_negotiate_takes_minimum() {
        let requested = DescriptorHeader::for_version(InterfaceVersion::V2);
        let offered = DescriptorHeader::for_version(InterfaceVersion::V1);

        let negotiated = requested.negotiate(&offered).unwrap();
        assert_eq!(negotiated.size, V1_DESCRIPTOR_SIZE);
        assert_eq!(negotiated.version, InterfaceVersion::V1);

        // Symmetric when the consumer is the older side
        let negotiated = offered.negotiate(&requested).unwrap();
        assert_eq!(negotiated.version, InterfaceVersion::V1);
    }

    #[test]
    fn test_negotiate_fails_below_v1() {
        let requested = DescriptorHeader {
            size: BASE_DESCRIPTOR_SIZE,
            version: InterfaceVersion::V1,
        };
        let offered = DescriptorHeader::for_version(CURRENT_VERSION);
        assert!(requested.negotiate(&offered).is_none());
    }
}
