use tracing::debug;

use crate::{DeviceConnection, DeviceError};

use super::opcode::AfcOpcode;

/// Fixed header in front of every AFC packet, all fields little endian
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AfcPacketHeader {
    pub magic: u64,
    /// Header, header payload and payload
    pub entire_len: u64,
    /// Header and header payload
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;
    /// Largest packet accepted from the device
    pub const MAX_LEN: u64 = 64 * 1024 * 1024;

    pub fn serialize(&self) -> Vec<u8> {
        [
            self.magic,
            self.entire_len,
            self.header_payload_len,
            self.packet_num,
            self.operation as u64,
        ]
        .iter()
        .flat_map(|f| f.to_le_bytes())
        .collect()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DeviceError> {
        if bytes.len() < Self::LEN as usize {
            return Err(DeviceError::NotEnoughBytes(bytes.len(), Self::LEN as usize));
        }
        let field = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };

        if field(0) != super::MAGIC {
            return Err(DeviceError::InvalidAfcMagic);
        }
        let operation = AfcOpcode::try_from(field(4)).map_err(|op| {
            debug!("Unknown AFC opcode {op:#x}");
            DeviceError::UnknownAfcOpcode
        })?;
        let header = Self {
            magic: field(0),
            entire_len: field(1),
            header_payload_len: field(2),
            packet_num: field(3),
            operation,
        };
        if header.header_payload_len < Self::LEN
            || header.entire_len < header.header_payload_len
            || header.entire_len > Self::MAX_LEN
        {
            debug!(
                "Rejecting AFC header with lengths {}/{}",
                header.entire_len, header.header_payload_len
            );
            return Err(DeviceError::PacketSizeMismatch);
        }
        Ok(header)
    }
}

impl AfcPacket {
    /// Builds a request, filling in the magic and both lengths
    pub fn new(
        operation: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        let header_payload_len = AfcPacketHeader::LEN + header_payload.len() as u64;
        Self {
            header: AfcPacketHeader {
                magic: super::MAGIC,
                entire_len: header_payload_len + payload.len() as u64,
                header_payload_len,
                packet_num,
                operation,
            },
            header_payload,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = self.header.serialize();
        res.extend_from_slice(&self.header_payload);
        res.extend_from_slice(&self.payload);
        res
    }

    pub async fn read(reader: &mut DeviceConnection) -> Result<Self, DeviceError> {
        let header = reader.read_raw(AfcPacketHeader::LEN as usize).await?;
        let header = AfcPacketHeader::parse(&header)?;
        debug!("afc header: {header:?}");

        let header_payload = reader
            .read_raw((header.header_payload_len - AfcPacketHeader::LEN) as usize)
            .await?;
        let payload_len = (header.entire_len - header.header_payload_len) as usize;
        let payload = if payload_len == 0 {
            Vec::new()
        } else {
            reader.read_raw(payload_len).await?
        };

        Ok(Self {
            header,
            header_payload,
            payload,
        })
    }

    /// First little endian u64 of the header payload
    pub fn header_u64(&self) -> Result<u64, DeviceError> {
        self.header_payload
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or(DeviceError::UnexpectedResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let packet = AfcPacket::new(AfcOpcode::ReadDir, 7, b"/DCIM".to_vec(), vec![1, 2]);
        let bytes = packet.serialize();
        assert_eq!(&bytes[..8], b"CFA6LPAA");
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 47);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 45);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 7);
        assert_eq!(u64::from_le_bytes(bytes[32..40].try_into().unwrap()), 3);
        assert_eq!(AfcPacketHeader::parse(&bytes).unwrap(), packet.header);
    }

    #[test]
    fn header_rejects_garbage() {
        let mut bytes = AfcPacket::new(AfcOpcode::Status, 0, vec![], vec![]).serialize();
        assert!(matches!(
            AfcPacketHeader::parse(&bytes[..20]),
            Err(DeviceError::NotEnoughBytes(20, 40))
        ));

        bytes[32] = 0x7f;
        assert!(matches!(
            AfcPacketHeader::parse(&bytes),
            Err(DeviceError::UnknownAfcOpcode)
        ));

        bytes[0] = b'X';
        assert!(matches!(
            AfcPacketHeader::parse(&bytes),
            Err(DeviceError::InvalidAfcMagic)
        ));
    }

    #[test]
    fn header_rejects_oversized_lengths() {
        let mut header = AfcPacket::new(AfcOpcode::Data, 0, vec![], vec![]).header;
        header.entire_len = u64::MAX;
        assert!(matches!(
            AfcPacketHeader::parse(&header.serialize()),
            Err(DeviceError::PacketSizeMismatch)
        ));

        header.entire_len = AfcPacketHeader::MAX_LEN;
        assert!(AfcPacketHeader::parse(&header.serialize()).is_ok());

        header.entire_len = 40;
        header.header_payload_len = 41;
        assert!(matches!(
            AfcPacketHeader::parse(&header.serialize()),
            Err(DeviceError::PacketSizeMismatch)
        ));
    }
}
