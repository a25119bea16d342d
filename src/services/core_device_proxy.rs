//! CoreDeviceProxy
//!
//! Starts a layer 3 tunnel to the device. After a JSON handshake framed as
//! CDTunnel packets, the connection carries raw IP packets in both
//! directions; the software TCP stack in [`crate::tcp`] drives it.

use std::{borrow::Cow, io::Write};

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{DeviceConnection, DeviceError, DeviceService};

/// Handshake framing: magic, u16 big endian body length, JSON body
#[derive(Debug, PartialEq)]
pub struct CDTunnelPacket {
    body: Vec<u8>,
}

impl CDTunnelPacket {
    const MAGIC: &'static [u8] = b"CDTunnel";
    const HEADER_LEN: usize = Self::MAGIC.len() + 2;

    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn parse(input: &[u8]) -> Result<Self, DeviceError> {
        let body_length = Self::body_len(input)?;
        match input.get(Self::HEADER_LEN..Self::HEADER_LEN + body_length) {
            Some(body) => Ok(Self {
                body: body.to_vec(),
            }),
            None => Err(DeviceError::PacketSizeMismatch),
        }
    }

    /// Validates the header and returns the announced body length
    fn body_len(header: &[u8]) -> Result<usize, DeviceError> {
        if header.len() < Self::HEADER_LEN {
            return Err(DeviceError::CdtunnelPacketTooShort);
        }
        if &header[..Self::MAGIC.len()] != Self::MAGIC {
            return Err(DeviceError::CdtunnelPacketInvalidMagic);
        }
        Ok(u16::from_be_bytes([header[Self::MAGIC.len()], header[Self::MAGIC.len() + 1]]) as usize)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, DeviceError> {
        let len = u16::try_from(self.body.len()).map_err(|_| DeviceError::InvalidArgument)?;
        let mut output = Vec::with_capacity(Self::HEADER_LEN + self.body.len());
        output.write_all(Self::MAGIC)?;
        output.write_u16::<BigEndian>(len)?;
        output.write_all(&self.body)?;
        Ok(output)
    }
}

#[derive(Serialize)]
struct HandshakeRequest {
    #[serde(rename = "type")]
    packet_type: &'static str,
    mtu: u32,
}

/// Addressing the device assigned to our end of the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientParameters {
    pub mtu: u16,
    pub address: String,
    pub netmask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(rename = "clientParameters")]
    pub client_parameters: ClientParameters,
    #[serde(rename = "serverAddress")]
    pub server_address: String,
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(rename = "serverRSDPort")]
    pub server_rsd_port: u16,
}

/// An established tunnel control channel
#[derive(Debug)]
pub struct CoreDeviceProxy {
    pub connection: DeviceConnection,
    pub handshake: HandshakeResponse,
    pub mtu: u32,
}

impl DeviceService for CoreDeviceProxy {
    fn service_name() -> Cow<'static, str> {
        Cow::Borrowed("com.apple.internal.devicecompute.CoreDeviceProxy")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, DeviceError> {
        Self::new(connection).await
    }
}

impl CoreDeviceProxy {
    pub const DEFAULT_MTU: u32 = 16000;

    /// Performs the tunnel handshake on an already started service connection
    pub async fn new(mut connection: DeviceConnection) -> Result<Self, DeviceError> {
        let req = HandshakeRequest {
            packet_type: "clientHandshakeRequest",
            mtu: Self::DEFAULT_MTU,
        };
        let req = CDTunnelPacket::new(serde_json::to_vec(&req)?).serialize()?;
        connection.send_raw(&req).await?;

        let header = connection.read_raw(CDTunnelPacket::HEADER_LEN).await?;
        let len = CDTunnelPacket::body_len(&header)?;
        let body = connection.read_raw(len).await?;
        let handshake = serde_json::from_slice::<HandshakeResponse>(&body)?;
        debug!(
            "Tunnel up: we are {}, device is {}, RSD on {}",
            handshake.client_parameters.address,
            handshake.server_address,
            handshake.server_rsd_port
        );

        let mtu = match handshake.client_parameters.mtu {
            0 => Self::DEFAULT_MTU,
            m => m as u32,
        };
        Ok(Self {
            connection,
            handshake,
            mtu,
        })
    }

    /// Port of the RSD service inside the tunnel
    pub fn server_rsd_port(&self) -> u16 {
        self.handshake.server_rsd_port
    }

    /// Sends one raw IP packet
    pub async fn send(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.connection.send_raw(data).await
    }

    /// Receives up to one negotiated MTU of raw IP bytes
    pub async fn recv(&mut self) -> Result<Vec<u8>, DeviceError> {
        self.connection.read_any(self.mtu).await
    }

    /// Hands the tunnel to a software TCP stack
    #[cfg(feature = "tunnel_tcp_stack")]
    pub fn create_software_tunnel(self) -> Result<crate::tcp::adapter::Adapter, DeviceError> {
        let host_ip = self
            .handshake
            .client_parameters
            .address
            .parse::<std::net::IpAddr>()?;
        let peer_ip = self.handshake.server_address.parse::<std::net::IpAddr>()?;
        let mtu = self.handshake.client_parameters.mtu as usize;
        Ok(crate::tcp::adapter::Adapter::new(
            self.connection.into_socket()?,
            host_ip,
            peer_ip,
            mtu,
        ))
    }

    /// Hands the tunnel to a software TCP stack running in its own task
    ///
    /// The proxy is consumed; every stream is opened through the returned handle.
    #[cfg(feature = "tunnel_tcp_stack")]
    pub fn create_tcp_adapter(self) -> Result<crate::tcp::handle::AdapterHandle, DeviceError> {
        Ok(crate::tcp::handle::AdapterHandle::new(
            self.create_software_tunnel()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn recv_is_bounded_by_negotiated_mtu() {
        let (client, mut device) = tokio::io::duplex(1 << 16);
        let response = br#"{"clientParameters":{"mtu":1280,"address":"fd00::2","netmask":"ffff:ffff:ffff:ffff::"},"serverAddress":"fd00::1","type":"serverHandshakeResponse","serverRSDPort":58783}"#;
        device
            .write_all(&CDTunnelPacket::new(response.to_vec()).serialize().unwrap())
            .await
            .unwrap();
        device.write_all(&[0x60; 3000]).await.unwrap();

        let mut proxy = CoreDeviceProxy::new(DeviceConnection::new(Box::new(client), "test"))
            .await
            .unwrap();
        assert_eq!(proxy.mtu, 1280);
        assert_eq!(proxy.server_rsd_port(), 58783);
        assert_eq!(proxy.recv().await.unwrap().len(), 1280);

        let mut header = [0u8; CDTunnelPacket::HEADER_LEN];
        device.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..8], b"CDTunnel");
    }

    #[test]
    fn packet_framing() {
        let packet = CDTunnelPacket::new(br#"{"a":1}"#.to_vec());
        let bytes = packet.serialize().unwrap();
        assert_eq!(&bytes[..8], b"CDTunnel");
        assert_eq!(&bytes[8..10], &[0, 7]);
        assert_eq!(CDTunnelPacket::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn packet_errors() {
        assert!(matches!(
            CDTunnelPacket::parse(b"CDTun"),
            Err(DeviceError::CdtunnelPacketTooShort)
        ));
        assert!(matches!(
            CDTunnelPacket::parse(b"XXTunnel\0\0"),
            Err(DeviceError::CdtunnelPacketInvalidMagic)
        ));
        assert!(matches!(
            CDTunnelPacket::parse(b"CDTunnel\0\x05abc"),
            Err(DeviceError::PacketSizeMismatch)
        ));
    }

    #[tokio::test]
    async fn handshake() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut header = [0u8; 10];
            server.read_exact(&mut header).await.unwrap();
            let len = u16::from_be_bytes([header[8], header[9]]) as usize;
            let mut body = vec![0; len];
            server.read_exact(&mut body).await.unwrap();
            let req: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(req["type"], "clientHandshakeRequest");
            assert_eq!(req["mtu"], 16000);

            let res = serde_json::json!({
                "clientParameters": {"mtu": 1280, "address": "fd00::2", "netmask": "ffff:ffff:ffff:ffff::"},
                "serverAddress": "fd00::1",
                "type": "serverHandshakeResponse",
                "serverRSDPort": 58783,
            });
            let bytes = CDTunnelPacket::new(serde_json::to_vec(&res).unwrap())
                .serialize()
                .unwrap();
            server.write_all(&bytes).await.unwrap();
        });

        let proxy = CoreDeviceProxy::new(DeviceConnection::new(Box::new(client), "test"))
            .await
            .unwrap();
        assert_eq!(proxy.server_rsd_port(), 58783);
        assert_eq!(proxy.handshake.client_parameters.mtu, 1280);
    }
}
