//! IPv4, IPv6 and TCP codecs for the software stack
//!
//! Only what a client talking to one peer over a reliable tunnel needs:
//! no fragments, no IP options on send, no TCP options on send.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use tracing::debug;

pub const PROTOCOL_TCP: u8 = 6;
const DEFAULT_TTL: u8 = 64;

/// Result of trying to cut one packet off the front of a byte buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpParseResult<T> {
    Ok { packet: T, bytes_consumed: usize },
    /// The buffer holds a prefix of a packet
    NotEnough,
    /// The buffer does not start with a packet of this version
    Invalid,
}

/// One's complement sum folded to 16 bits
fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub ttl: u8,
    pub protocol: u8,
    pub header_checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: Vec<u8>,
}

impl Ipv4Packet {
    const MIN_HEADER_LEN: usize = 20;

    pub fn parse(buf: &[u8]) -> IpParseResult<Self> {
        if buf.len() < Self::MIN_HEADER_LEN {
            return IpParseResult::NotEnough;
        }
        if buf[0] >> 4 != 4 {
            return IpParseResult::Invalid;
        }
        let header_len = (buf[0] & 0x0F) as usize * 4;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if header_len < Self::MIN_HEADER_LEN || total_len < header_len {
            return IpParseResult::Invalid;
        }
        if buf.len() < total_len {
            return IpParseResult::NotEnough;
        }

        IpParseResult::Ok {
            packet: Self {
                ttl: buf[8],
                protocol: buf[9],
                header_checksum: u16::from_be_bytes([buf[10], buf[11]]),
                source: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
                destination: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
                payload: buf[header_len..total_len].to_vec(),
            },
            bytes_consumed: total_len,
        }
    }

    pub fn create(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
    ) -> io::Result<Vec<u8>> {
        let total_len = u16::try_from(Self::MIN_HEADER_LEN + payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "IPv4 payload too large"))?;

        let mut packet = Vec::with_capacity(total_len as usize);
        packet.push(0x45); // version 4, 5 words
        packet.push(0);
        packet.extend_from_slice(&total_len.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0x40, 0]); // id, don't fragment
        packet.push(DEFAULT_TTL);
        packet.push(protocol);
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&source.octets());
        packet.extend_from_slice(&destination.octets());

        let checksum = !(ones_complement_sum(0, &packet) as u16);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());
        packet.extend_from_slice(payload);
        Ok(packet)
    }

    /// Whether the header checksum of a raw packet verifies
    pub fn checksum_valid(buf: &[u8]) -> bool {
        let header_len = match buf.first() {
            Some(b) => (b & 0x0F) as usize * 4,
            None => return false,
        };
        match buf.get(..header_len) {
            Some(header) => ones_complement_sum(0, header) == 0xFFFF,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub payload: Vec<u8>,
}

impl Ipv6Packet {
    const HEADER_LEN: usize = 40;

    pub fn parse(buf: &[u8]) -> IpParseResult<Self> {
        if buf.len() < Self::HEADER_LEN {
            return IpParseResult::NotEnough;
        }
        if buf[0] >> 4 != 6 {
            return IpParseResult::Invalid;
        }
        let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let total_len = Self::HEADER_LEN + payload_len;
        if buf.len() < total_len {
            return IpParseResult::NotEnough;
        }

        let addr = |at: usize| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[at..at + 16]);
            Ipv6Addr::from(octets)
        };

        IpParseResult::Ok {
            packet: Self {
                next_header: buf[6],
                hop_limit: buf[7],
                source: addr(8),
                destination: addr(24),
                payload: buf[Self::HEADER_LEN..total_len].to_vec(),
            },
            bytes_consumed: total_len,
        }
    }

    pub fn create(
        source: Ipv6Addr,
        destination: Ipv6Addr,
        next_header: u8,
        payload: &[u8],
    ) -> io::Result<Vec<u8>> {
        let payload_len = u16::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "IPv6 payload too large"))?;

        let mut packet = Vec::with_capacity(Self::HEADER_LEN + payload.len());
        packet.extend_from_slice(&[6 << 4, 0, 0, 0]); // version, no class or flow label
        packet.extend_from_slice(&payload_len.to_be_bytes());
        packet.push(next_header);
        packet.push(DEFAULT_TTL);
        packet.extend_from_slice(&source.octets());
        packet.extend_from_slice(&destination.octets());
        packet.extend_from_slice(payload);
        Ok(packet)
    }
}

/// Cuts one IP packet of either version off the front of `buf`
pub fn parse_ip(buf: &[u8]) -> IpParseResult<(IpAddr, IpAddr, u8, Vec<u8>)> {
    match buf.first().map(|b| b >> 4) {
        None => IpParseResult::NotEnough,
        Some(4) => match Ipv4Packet::parse(buf) {
            IpParseResult::Ok {
                packet,
                bytes_consumed,
            } => IpParseResult::Ok {
                packet: (
                    packet.source.into(),
                    packet.destination.into(),
                    packet.protocol,
                    packet.payload,
                ),
                bytes_consumed,
            },
            IpParseResult::NotEnough => IpParseResult::NotEnough,
            IpParseResult::Invalid => IpParseResult::Invalid,
        },
        Some(6) => match Ipv6Packet::parse(buf) {
            IpParseResult::Ok {
                packet,
                bytes_consumed,
            } => IpParseResult::Ok {
                packet: (
                    packet.source.into(),
                    packet.destination.into(),
                    packet.next_header,
                    packet.payload,
                ),
                bytes_consumed,
            },
            IpParseResult::NotEnough => IpParseResult::NotEnough,
            IpParseResult::Invalid => IpParseResult::Invalid,
        },
        Some(v) => {
            debug!("Got an IP packet with version {v}");
            IpParseResult::Invalid
        }
    }
}

/// Wraps a transport payload in an IP header matching the address family
pub fn ip_wrap(source: IpAddr, destination: IpAddr, protocol: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
    match (source, destination) {
        (IpAddr::V4(s), IpAddr::V4(d)) => Ipv4Packet::create(s, d, protocol, payload),
        (IpAddr::V6(s), IpAddr::V6(d)) => Ipv6Packet::create(s, d, protocol, payload),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "source and destination IP versions differ",
        )),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags {
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

impl TcpFlags {
    const FIN: u8 = 0x01;
    const SYN: u8 = 0x02;
    const RST: u8 = 0x04;
    const PSH: u8 = 0x08;
    const ACK: u8 = 0x10;
    const URG: u8 = 0x20;

    pub fn from_byte(flags: u8) -> Self {
        Self {
            urg: flags & Self::URG != 0,
            ack: flags & Self::ACK != 0,
            psh: flags & Self::PSH != 0,
            rst: flags & Self::RST != 0,
            syn: flags & Self::SYN != 0,
            fin: flags & Self::FIN != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        [
            (self.urg, Self::URG),
            (self.ack, Self::ACK),
            (self.psh, Self::PSH),
            (self.rst, Self::RST),
            (self.syn, Self::SYN),
            (self.fin, Self::FIN),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }

    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }
}

/// A parsed TCP segment
#[derive(Clone, PartialEq, Eq)]
pub struct TcpPacket {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl TcpPacket {
    const HEADER_LEN: usize = 20;

    pub fn parse(packet: &[u8]) -> io::Result<Self> {
        if packet.len() < Self::HEADER_LEN {
            debug!("Got a truncated TCP header");
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Not enough bytes for TCP header",
            ));
        }
        let data_offset = (packet[12] >> 4) as usize * 4;
        if data_offset < Self::HEADER_LEN || data_offset > packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "TCP data offset out of range",
            ));
        }

        Ok(Self {
            source_port: u16::from_be_bytes([packet[0], packet[1]]),
            destination_port: u16::from_be_bytes([packet[2], packet[3]]),
            sequence_number: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            acknowledgment_number: u32::from_be_bytes([
                packet[8], packet[9], packet[10], packet[11],
            ]),
            flags: TcpFlags::from_byte(packet[13]),
            window_size: u16::from_be_bytes([packet[14], packet[15]]),
            checksum: u16::from_be_bytes([packet[16], packet[17]]),
            // options are skipped
            payload: packet[data_offset..].to_vec(),
        })
    }

    /// Serializes a segment, computing the checksum over the pseudo header
    ///
    /// # Errors
    /// `InvalidInput` when the addresses are of different families
    pub fn create(&self, source_ip: IpAddr, destination_ip: IpAddr) -> io::Result<Vec<u8>> {
        let mut packet = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        packet.extend_from_slice(&self.source_port.to_be_bytes());
        packet.extend_from_slice(&self.destination_port.to_be_bytes());
        packet.extend_from_slice(&self.sequence_number.to_be_bytes());
        packet.extend_from_slice(&self.acknowledgment_number.to_be_bytes());
        packet.push(((Self::HEADER_LEN / 4) as u8) << 4);
        packet.push(self.flags.to_byte());
        packet.extend_from_slice(&self.window_size.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
        packet.extend_from_slice(&self.payload);

        let pseudo = match (source_ip, destination_ip) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let mut p = Vec::with_capacity(12);
                p.extend_from_slice(&s.octets());
                p.extend_from_slice(&d.octets());
                p.extend_from_slice(&[0, PROTOCOL_TCP]);
                p.extend_from_slice(&(packet.len() as u16).to_be_bytes());
                p
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                let mut p = Vec::with_capacity(40);
                p.extend_from_slice(&s.octets());
                p.extend_from_slice(&d.octets());
                p.extend_from_slice(&(packet.len() as u32).to_be_bytes());
                p.extend_from_slice(&[0, 0, 0, PROTOCOL_TCP]);
                p
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "source and destination IP versions differ",
                ));
            }
        };

        let sum = ones_complement_sum(ones_complement_sum(0, &pseudo), &packet);
        packet[16..18].copy_from_slice(&(!(sum as u16)).to_be_bytes());
        Ok(packet)
    }

    /// Whether a raw segment's checksum verifies against the given addresses
    pub fn checksum_valid(raw: &[u8], source_ip: IpAddr, destination_ip: IpAddr) -> bool {
        let pseudo = match (source_ip, destination_ip) {
            (IpAddr::V4(s), IpAddr::V4(d)) => [
                &s.octets()[..],
                &d.octets()[..],
                &[0, PROTOCOL_TCP],
                &(raw.len() as u16).to_be_bytes()[..],
            ]
            .concat(),
            (IpAddr::V6(s), IpAddr::V6(d)) => [
                &s.octets()[..],
                &d.octets()[..],
                &(raw.len() as u32).to_be_bytes()[..],
                &[0, 0, 0, PROTOCOL_TCP],
            ]
            .concat(),
            _ => return false,
        };
        ones_complement_sum(ones_complement_sum(0, &pseudo), raw) == 0xFFFF
    }
}

impl std::fmt::Debug for TcpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPacket")
            .field("source_port", &self.source_port)
            .field("destination_port", &self.destination_port)
            .field("sequence_number", &self.sequence_number)
            .field("acknowledgment_number", &self.acknowledgment_number)
            .field("flags", &self.flags)
            .field("window_size", &self.window_size)
            .field("payload len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(payload: &[u8]) -> TcpPacket {
        TcpPacket {
            source_port: 1234,
            destination_port: 5678,
            sequence_number: 420,
            acknowledgment_number: 6969,
            flags: TcpFlags {
                psh: true,
                ack: true,
                ..Default::default()
            },
            window_size: 5555,
            checksum: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn ipv4_checksum_verifies() {
        let bytes = Ipv4Packet::create(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            PROTOCOL_TCP,
            &[1, 2, 3, 4, 5],
        )
        .unwrap();
        assert!(Ipv4Packet::checksum_valid(&bytes));

        match Ipv4Packet::parse(&bytes) {
            IpParseResult::Ok {
                packet,
                bytes_consumed,
            } => {
                assert_eq!(bytes_consumed, 25);
                assert_eq!(packet.payload, vec![1, 2, 3, 4, 5]);
                assert_eq!(packet.destination, Ipv4Addr::new(10, 0, 0, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ipv6_partial_and_concatenated() {
        let a = Ipv6Packet::create(Ipv6Addr::LOCALHOST, Ipv6Addr::UNSPECIFIED, 6, &[9; 10]).unwrap();
        let b = Ipv6Packet::create(Ipv6Addr::UNSPECIFIED, Ipv6Addr::LOCALHOST, 6, &[]).unwrap();

        assert_eq!(Ipv6Packet::parse(&a[..45]), IpParseResult::NotEnough);

        let both = [a.clone(), b].concat();
        match parse_ip(&both) {
            IpParseResult::Ok {
                packet: (src, _, proto, payload),
                bytes_consumed,
            } => {
                assert_eq!(bytes_consumed, a.len());
                assert_eq!(src, IpAddr::V6(Ipv6Addr::LOCALHOST));
                assert_eq!(proto, PROTOCOL_TCP);
                assert_eq!(payload, vec![9; 10]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse_ip(&[0x50; 40]), IpParseResult::Invalid);
    }

    #[test]
    fn tcp_checksum_both_families() {
        for (s, d) in [
            (
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
            ),
            (
                IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
                IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2)),
            ),
        ] {
            // odd length exercises the padding byte
            let raw = segment(&[1, 2, 3, 4, 5]).create(s, d).unwrap();
            assert!(TcpPacket::checksum_valid(&raw, s, d));

            let parsed = TcpPacket::parse(&raw).unwrap();
            assert_eq!(parsed.sequence_number, 420);
            assert_eq!(parsed.flags, segment(&[]).flags);
            assert_eq!(parsed.payload, vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn tcp_mixed_families_rejected() {
        let err = segment(&[])
            .create(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn flags_byte() {
        let flags = TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        };
        assert_eq!(flags.to_byte(), 0x12);
        assert_eq!(TcpFlags::from_byte(0x12), flags);
    }
}
