//! The device end of a tunnel: a tiny TCP responder speaking raw IPv6

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv6Addr},
    sync::{Arc, Mutex},
};

use devicelink::tcp::packets::{
    IpParseResult, PROTOCOL_TCP, TcpFlags, TcpPacket, ip_wrap, parse_ip,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const HOST_IP: IpAddr = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2));
pub const PEER_IP: IpAddr = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
pub const MTU: usize = 1280;
/// MTU minus the IPv6 and TCP headers
pub const MSS: usize = 1220;

/// Echoes everything it receives
pub const ECHO_PORT: u16 = 7;
/// Swallows data and closes its side once it receives `bye`
pub const CLOSING_PORT: u16 = 9;

#[derive(Debug, Default)]
pub struct PeerStats {
    pub syns: Vec<u16>,
    /// Payload length of every data segment from the host
    pub segments: Vec<usize>,
    /// Host ports that sent FIN
    pub fins: Vec<u16>,
    pub bad_checksums: usize,
}

struct Conn {
    seq: u32,
    ack: u32,
}

struct Peer {
    stream: DuplexStream,
    conns: HashMap<(u16, u16), Conn>,
    stats: Arc<Mutex<PeerStats>>,
}

impl Peer {
    async fn send(&mut self, host_port: u16, peer_port: u16, flags: TcpFlags, payload: &[u8]) {
        let (seq, ack) = match self.conns.get(&(host_port, peer_port)) {
            Some(c) => (c.seq, c.ack),
            None => (0, 0),
        };
        let segment = TcpPacket {
            source_port: peer_port,
            destination_port: host_port,
            sequence_number: seq,
            acknowledgment_number: ack,
            flags,
            window_size: u16::MAX,
            checksum: 0,
            payload: payload.to_vec(),
        };
        let tcp = segment.create(PEER_IP, HOST_IP).unwrap();
        let ip = ip_wrap(PEER_IP, HOST_IP, PROTOCOL_TCP, &tcp).unwrap();
        self.stream.write_all(&ip).await.unwrap();
        if let Some(c) = self.conns.get_mut(&(host_port, peer_port)) {
            c.seq = c.seq.wrapping_add(payload.len() as u32);
            if flags.syn || flags.fin {
                c.seq = c.seq.wrapping_add(1);
            }
        }
    }

    async fn handle(&mut self, raw: &[u8]) {
        if !TcpPacket::checksum_valid(raw, HOST_IP, PEER_IP) {
            self.stats.lock().unwrap().bad_checksums += 1;
        }
        let packet = TcpPacket::parse(raw).unwrap();
        let key = (packet.source_port, packet.destination_port);
        let ack = TcpFlags::ack();

        if packet.flags.syn {
            self.stats.lock().unwrap().syns.push(packet.source_port);
            if key.1 != ECHO_PORT && key.1 != CLOSING_PORT {
                let rst = TcpFlags {
                    rst: true,
                    ack: true,
                    ..Default::default()
                };
                self.send(key.0, key.1, rst, &[]).await;
                return;
            }
            self.conns.insert(
                key,
                Conn {
                    seq: 5000,
                    ack: packet.sequence_number.wrapping_add(1),
                },
            );
            let syn_ack = TcpFlags {
                syn: true,
                ack: true,
                ..Default::default()
            };
            self.send(key.0, key.1, syn_ack, &[]).await;
            return;
        }

        if !packet.payload.is_empty() {
            self.stats.lock().unwrap().segments.push(packet.payload.len());
            if let Some(c) = self.conns.get_mut(&key) {
                c.ack = c.ack.wrapping_add(packet.payload.len() as u32);
            }
            self.send(key.0, key.1, ack, &[]).await;
            match key.1 {
                ECHO_PORT => {
                    for chunk in packet.payload.chunks(MSS) {
                        let psh = TcpFlags {
                            psh: true,
                            ack: true,
                            ..Default::default()
                        };
                        self.send(key.0, key.1, psh, chunk).await;
                    }
                }
                _ if packet.payload == b"bye" => {
                    let fin = TcpFlags {
                        fin: true,
                        ack: true,
                        ..Default::default()
                    };
                    self.send(key.0, key.1, fin, &[]).await;
                }
                _ => {}
            }
        }

        if packet.flags.fin {
            self.stats.lock().unwrap().fins.push(packet.source_port);
            if let Some(c) = self.conns.get_mut(&key) {
                c.ack = c.ack.wrapping_add(1);
            }
            self.send(key.0, key.1, ack, &[]).await;
            self.conns.remove(&key);
        }
    }
}

/// Runs the peer until the host side of the tunnel closes
pub fn spawn(stream: DuplexStream) -> Arc<Mutex<PeerStats>> {
    let stats = Arc::new(Mutex::new(PeerStats::default()));
    let mut peer = Peer {
        stream,
        conns: HashMap::new(),
        stats: stats.clone(),
    };
    tokio::spawn(async move {
        let mut incoming = Vec::new();
        let mut buf = vec![0u8; 65535];
        loop {
            let n = match peer.stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            incoming.extend_from_slice(&buf[..n]);
            while let IpParseResult::Ok {
                packet: (source, destination, protocol, payload),
                bytes_consumed,
            } = parse_ip(&incoming)
            {
                incoming.drain(..bytes_consumed);
                assert_eq!((source, destination), (HOST_IP, PEER_IP));
                assert_eq!(protocol, PROTOCOL_TCP);
                peer.handle(&payload).await;
            }
        }
    });
    stats
}

/// Reads the next IPv6 packet the host sent and returns its TCP segment
pub async fn read_segment(stream: &mut DuplexStream) -> TcpPacket {
    let mut header = [0u8; 40];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0] >> 4, 6);
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    TcpPacket::parse(&payload).unwrap()
}

/// Sends one raw segment from the peer, bypassing the responder
pub async fn inject(
    stream: &mut DuplexStream,
    source: IpAddr,
    destination: IpAddr,
    segment: TcpPacket,
) {
    let tcp = segment.create(source, destination).unwrap();
    let ip = ip_wrap(source, destination, PROTOCOL_TCP, &tcp).unwrap();
    stream.write_all(&ip).await.unwrap();
}
