//! A small TCP stack multiplexing many connections over one tunnel
//!
//! The tunnel is assumed to be reliable and ordered, so there is no
//! retransmission, no congestion control and no window management.
//! Connections are keyed by the local (host) port.
//!
//! The adapter is not shareable. Wrap it in an [`super::handle::AdapterHandle`]
//! to use it from several tasks.

use std::{collections::HashMap, io, net::IpAddr, path::Path, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, trace, warn};

use crate::ReadWrite;

use super::packets::{IpParseResult, PROTOCOL_TCP, TcpFlags, TcpPacket, ip_wrap, parse_ip};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// SYN sent, waiting for SYN-ACK
    Connecting,
    Connected,
    /// Terminal; `UnexpectedEof` means the peer sent FIN
    Error(io::ErrorKind),
}

#[derive(Debug)]
struct ConnectionState {
    peer_port: u16,
    seq: u32,
    ack: u32,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    status: ConnectionStatus,
}

#[derive(Debug)]
pub struct Adapter {
    peer: Box<dyn ReadWrite>,
    host_ip: IpAddr,
    peer_ip: IpAddr,
    mss: usize,
    connections: HashMap<u16, ConnectionState>,
    /// Tunnel bytes not yet cut into IP packets
    incoming: Vec<u8>,
    pcap: Option<Arc<Mutex<tokio::fs::File>>>,
}

impl Adapter {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
    const WINDOW_SIZE: u16 = u16::MAX;
    const READ_CHUNK: usize = 65535;
    const MIN_MSS: usize = 64;

    /// Creates an adapter over a tunnel carrying raw IP packets
    ///
    /// `mtu` bounds the size of every IP packet the adapter sends.
    pub fn new(peer: Box<dyn ReadWrite>, host_ip: IpAddr, peer_ip: IpAddr, mtu: usize) -> Self {
        let ip_header = match host_ip {
            IpAddr::V4(_) => 20,
            IpAddr::V6(_) => 40,
        };
        let mss = mtu.saturating_sub(ip_header + 20).max(Self::MIN_MSS);
        debug!("Adapter {host_ip} -> {peer_ip} with MSS {mss}");
        Self {
            peer,
            host_ip,
            peer_ip,
            mss,
            connections: HashMap::new(),
            incoming: Vec::new(),
            pcap: None,
        }
    }

    /// Logs every packet sent and received to a libpcap file
    pub async fn pcap(&mut self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;

        // https://wiki.wireshark.org/Development/LibpcapFileFormat
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&0xa1b2c3d4_u32.to_le_bytes());
        header.extend_from_slice(&2_u16.to_le_bytes());
        header.extend_from_slice(&4_u16.to_le_bytes());
        header.extend_from_slice(&0_i32.to_le_bytes()); // timezone
        header.extend_from_slice(&0_u32.to_le_bytes()); // accuracy
        header.extend_from_slice(&(u16::MAX as u32).to_le_bytes()); // snaplen
        header.extend_from_slice(&101_u32.to_le_bytes()); // raw IP
        file.write_all(&header).await?;
        file.flush().await?;

        self.pcap = Some(Arc::new(Mutex::new(file)));
        Ok(())
    }

    fn free_port(&self) -> u16 {
        loop {
            let port = rand::random_range(49152..=u16::MAX);
            if !self.connections.contains_key(&port) {
                return port;
            }
        }
    }

    /// Opens a connection to `port` on the peer and returns the host port
    ///
    /// Packets for other connections that arrive during the handshake are
    /// processed normally.
    pub async fn connect(&mut self, port: u16) -> io::Result<u16> {
        let host_port = self.free_port();
        self.connections.insert(
            host_port,
            ConnectionState {
                peer_port: port,
                seq: rand::random(),
                ack: 0,
                read_buffer: Vec::new(),
                write_buffer: Vec::new(),
                status: ConnectionStatus::Connecting,
            },
        );

        let syn = TcpFlags {
            syn: true,
            ..Default::default()
        };
        let res = match self.send_segment(host_port, syn, &[]).await {
            Ok(()) => tokio::time::timeout(Self::CONNECT_TIMEOUT, self.await_handshake(host_port))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no SYN-ACK from peer",
                    ))
                }),
            Err(e) => Err(e),
        };

        match res {
            Ok(()) => {
                debug!("Connected host port {host_port} to peer port {port}");
                Ok(host_port)
            }
            Err(e) => {
                self.connections.remove(&host_port);
                Err(e)
            }
        }
    }

    async fn await_handshake(&mut self, host_port: u16) -> io::Result<()> {
        loop {
            match self.get_status(host_port)? {
                ConnectionStatus::Connecting => self.process_tcp_packet().await?,
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Error(kind) => {
                    return Err(io::Error::new(kind, "connection rejected by peer"));
                }
            }
        }
    }

    /// Queues `data` on a connection. Nothing is sent until [`Self::write_buffer_flush`].
    pub fn queue_send(&mut self, data: &[u8], host_port: u16) -> io::Result<()> {
        let state = self.state_mut(host_port)?;
        match state.status {
            ConnectionStatus::Connected => {
                state.write_buffer.extend_from_slice(data);
                Ok(())
            }
            ConnectionStatus::Connecting => Err(io::ErrorKind::NotConnected.into()),
            ConnectionStatus::Error(kind) => Err(kind.into()),
        }
    }

    /// Sends every queued byte on every connection
    pub async fn write_buffer_flush(&mut self) -> io::Result<()> {
        let ports = self
            .connections
            .iter()
            .filter(|(_, s)| !s.write_buffer.is_empty())
            .map(|(p, _)| *p)
            .collect::<Vec<_>>();
        for port in ports {
            self.flush_connection(port).await?;
        }
        Ok(())
    }

    async fn flush_connection(&mut self, host_port: u16) -> io::Result<()> {
        let buffer = std::mem::take(&mut self.state_mut(host_port)?.write_buffer);
        let flags = TcpFlags {
            psh: true,
            ack: true,
            ..Default::default()
        };
        for chunk in buffer.chunks(self.mss) {
            self.send_segment(host_port, flags, chunk).await?;
            let state = self.state_mut(host_port)?;
            state.seq = state.seq.wrapping_add(chunk.len() as u32);
        }
        Ok(())
    }

    /// Reads whatever the tunnel has available into the reassembly buffer
    ///
    /// Cancel safe: a single read on the tunnel is the only await point.
    pub async fn fill_read_buffer(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; Self::READ_CHUNK];
        let n = self.peer.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tunnel closed",
            ));
        }
        self.incoming.extend_from_slice(&buf[..n]);
        Ok(())
    }

    /// Processes every complete IP packet in the reassembly buffer
    pub async fn handle_buffered_packets(&mut self) -> io::Result<()> {
        loop {
            let (source, destination, protocol, payload, consumed) = match parse_ip(&self.incoming)
            {
                IpParseResult::Ok {
                    packet: (s, d, p, payload),
                    bytes_consumed,
                } => (s, d, p, payload, bytes_consumed),
                IpParseResult::NotEnough => return Ok(()),
                IpParseResult::Invalid => {
                    self.incoming.clear();
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "tunnel is not carrying IP packets",
                    ));
                }
            };
            let raw = self.incoming.drain(..consumed).collect::<Vec<u8>>();
            self.log_packet(&raw).await;

            if protocol != PROTOCOL_TCP {
                trace!("Ignoring IP packet with protocol {protocol}");
                continue;
            }
            if source != self.peer_ip || destination != self.host_ip {
                warn!("Ignoring packet {source} -> {destination}");
                continue;
            }
            match TcpPacket::parse(&payload) {
                Ok(packet) => self.handle_tcp(packet).await?,
                Err(e) => warn!("Dropping malformed TCP segment: {e}"),
            }
        }
    }

    /// Reads from the tunnel and processes what arrived
    pub async fn process_tcp_packet(&mut self) -> io::Result<()> {
        self.fill_read_buffer().await?;
        self.handle_buffered_packets().await
    }

    async fn handle_tcp(&mut self, packet: TcpPacket) -> io::Result<()> {
        trace!("Received {packet:?}");
        let host_port = packet.destination_port;
        let state = match self.connections.get_mut(&host_port) {
            Some(s) if s.peer_port == packet.source_port => s,
            _ => {
                trace!("No connection for host port {host_port}");
                return Ok(());
            }
        };

        match state.status {
            ConnectionStatus::Connecting => {
                if packet.flags.rst {
                    state.status = ConnectionStatus::Error(io::ErrorKind::ConnectionRefused);
                } else if packet.flags.syn && packet.flags.ack {
                    state.ack = packet.sequence_number.wrapping_add(1);
                    state.seq = state.seq.wrapping_add(1);
                    state.status = ConnectionStatus::Connected;
                    self.send_segment(host_port, TcpFlags::ack(), &[]).await?;
                }
                Ok(())
            }
            ConnectionStatus::Connected => {
                if packet.flags.rst {
                    debug!("Peer reset host port {host_port}");
                    state.status = ConnectionStatus::Error(io::ErrorKind::ConnectionReset);
                    return Ok(());
                }

                // signed distance from the next byte we expect
                let offset = packet.sequence_number.wrapping_sub(state.ack) as i32;
                let mut needs_ack = false;
                if !packet.payload.is_empty() {
                    if offset == 0 {
                        state.read_buffer.extend_from_slice(&packet.payload);
                        state.ack = state.ack.wrapping_add(packet.payload.len() as u32);
                    } else {
                        debug!("Out of order segment on {host_port} (offset {offset}), re-acking");
                    }
                    needs_ack = true;
                }
                if packet.flags.fin && offset == 0 {
                    state.ack = state.ack.wrapping_add(1);
                    state.status = ConnectionStatus::Error(io::ErrorKind::UnexpectedEof);
                    needs_ack = true;
                }
                if needs_ack {
                    self.send_segment(host_port, TcpFlags::ack(), &[]).await?;
                }
                Ok(())
            }
            ConnectionStatus::Error(_) => Ok(()),
        }
    }

    /// Takes everything received on a connection so far
    pub fn uncache_all(&mut self, host_port: u16) -> io::Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.state_mut(host_port)?.read_buffer))
    }

    pub fn get_status(&self, host_port: u16) -> io::Result<ConnectionStatus> {
        self.connections
            .get(&host_port)
            .map(|s| s.status)
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }

    /// Ports of every connection currently in the table
    pub fn host_ports(&self) -> Vec<u16> {
        self.connections.keys().copied().collect()
    }

    /// Flushes and closes one connection, then forgets it
    ///
    /// Does not wait for the peer's FIN. A connection the peer already
    /// finished gets our FIN too.
    pub async fn close(&mut self, host_port: u16) -> io::Result<()> {
        let connected = matches!(
            self.get_status(host_port)?,
            ConnectionStatus::Connected | ConnectionStatus::Error(io::ErrorKind::UnexpectedEof)
        );
        let res = if connected {
            match self.flush_connection(host_port).await {
                Ok(()) => {
                    let fin = TcpFlags {
                        fin: true,
                        ack: true,
                        ..Default::default()
                    };
                    self.send_segment(host_port, fin, &[]).await
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };
        self.connections.remove(&host_port);
        debug!("Closed host port {host_port}");
        res
    }

    /// Shuts the tunnel down
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.connections.clear();
        self.peer.shutdown().await
    }

    fn state_mut(&mut self, host_port: u16) -> io::Result<&mut ConnectionState> {
        self.connections
            .get_mut(&host_port)
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }

    async fn send_segment(&mut self, host_port: u16, flags: TcpFlags, payload: &[u8]) -> io::Result<()> {
        let state = self.state_mut(host_port)?;
        let segment = TcpPacket {
            source_port: host_port,
            destination_port: state.peer_port,
            sequence_number: state.seq,
            acknowledgment_number: if flags.ack { state.ack } else { 0 },
            flags,
            window_size: Self::WINDOW_SIZE,
            checksum: 0,
            payload: payload.to_vec(),
        };
        trace!("Sending {segment:?}");
        let tcp = segment.create(self.host_ip, self.peer_ip)?;
        let ip = ip_wrap(self.host_ip, self.peer_ip, PROTOCOL_TCP, &tcp)?;

        self.log_packet(&ip).await;
        self.peer.write_all(&ip).await?;
        self.peer.flush().await
    }

    async fn log_packet(&self, packet: &[u8]) {
        if let Some(file) = &self.pcap {
            super::log_packet(file, packet).await;
        }
    }
}
