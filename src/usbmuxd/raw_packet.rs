//! usbmuxd wire framing
//!
//! Every message is a 16 byte little endian header `{length, version,
//! message, tag}` followed by an XML plist body. `length` covers the header.

use tracing::warn;

use crate::{DeviceError, util::plist_to_xml_bytes};

pub(crate) const HEADER_LEN: usize = 16;

#[derive(Debug)]
pub(crate) struct RawPacket {
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

/// The fields of a received header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawHeader {
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl RawPacket {
    pub fn new(plist: plist::Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            version,
            message,
            tag,
            plist,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, DeviceError> {
        let body = plist_to_xml_bytes(&self.plist)?;
        let size = (HEADER_LEN + body.len()) as u32;

        let mut packet = Vec::with_capacity(size as usize);
        packet.extend_from_slice(&size.to_le_bytes());
        packet.extend_from_slice(&self.version.to_le_bytes());
        packet.extend_from_slice(&self.message.to_le_bytes());
        packet.extend_from_slice(&self.tag.to_le_bytes());
        packet.extend_from_slice(&body);
        Ok(packet)
    }
}

impl RawHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, DeviceError> {
        let field = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let header = Self {
            size: field(0),
            version: field(4),
            message: field(8),
            tag: field(12),
        };
        if (header.size as usize) < HEADER_LEN {
            warn!("usbmuxd header claims {} bytes", header.size);
            return Err(DeviceError::PacketSizeMismatch);
        }
        Ok(header)
    }

    /// Length of the plist body following the header
    pub fn body_len(&self) -> usize {
        self.size as usize - HEADER_LEN
    }
}
