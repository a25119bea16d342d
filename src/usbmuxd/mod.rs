//! usbmuxd client
//!
//! usbmuxd lists attached devices, stores their pairing records and turns a
//! daemon connection into a raw stream to a device port.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    DeviceConnection, DeviceError, ReadWrite, pairing_file::PairingFile,
    provider::UsbmuxdProvider,
};

mod des;
mod raw_packet;

use raw_packet::{HEADER_LEN, RawHeader, RawPacket};

/// How a device is attached to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    /// Paired over the network at the given address
    Network(IpAddr),
    Unknown(String),
}

/// A device known to usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
}

/// An open connection to the daemon
#[derive(Debug)]
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

/// Address of the usbmuxd daemon
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    /// Environment variable overriding the daemon address
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    /// Opens a raw stream to the daemon
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, DeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, DeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads the daemon address from `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => Self::parse(&var),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Parses an address the way `USBMUXD_SOCKET_ADDRESS` is written
    ///
    /// `host:port` selects TCP; anything else is a unix socket path.
    pub fn parse(var: &str) -> Result<Self, AddrParseError> {
        #[cfg(unix)]
        if !var.contains(':') {
            return Ok(Self::UnixSocket(var.to_string()));
        }
        Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

impl UsbmuxdConnection {
    pub const BINARY_PLIST_VERSION: u32 = 0;
    pub const XML_PLIST_VERSION: u32 = 1;

    pub const RESULT_MESSAGE_TYPE: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    /// Connects to the daemon at its default address
    pub async fn default() -> Result<Self, DeviceError> {
        UsbmuxdAddr::default().connect(0).await
    }

    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Lists attached devices
    ///
    /// Entries the daemon describes incompletely are skipped.
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), "devicelink".into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;

        let devs = res
            .device_list
            .into_iter()
            .filter_map(|x| match UsbmuxdDevice::try_from(x) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("Skipping malformed device entry: {e}");
                    None
                }
            })
            .collect();

        Ok(devs)
    }

    /// Finds an attached device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, DeviceError> {
        let devices = self.get_devices().await?;
        devices
            .into_iter()
            .find(|x| x.udid == udid)
            .ok_or(DeviceError::DeviceNotFound)
    }

    /// Reads the pairing record stored for `udid`
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, DeviceError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            _ => Err(DeviceError::NotFound),
        }
    }

    /// Reads the host's system BUID
    pub async fn get_buid(&mut self) -> Result<String, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Turns this daemon connection into a stream to `port` on the device
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - Device port in host byte order
    /// * `label` - Label for the resulting connection
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<DeviceConnection, DeviceError> {
        debug!("Connecting to device {device_id} on port {port}");
        let port = port.to_be();

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.into());
        self.write_plist(req).await?;
        match self
            .read_plist()
            .await?
            .get("Number")
            .and_then(|x| x.as_unsigned_integer())
        {
            Some(0) => Ok(DeviceConnection::new(self.socket, label)),
            Some(1) => Err(DeviceError::UsbBadCommand),
            Some(2) => Err(DeviceError::UsbBadDevice),
            Some(3) => Err(DeviceError::UsbConnectionRefused),
            Some(6) => Err(DeviceError::UsbBadVersion),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), DeviceError> {
        let raw = RawPacket::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        )
        .serialize()?;

        self.socket.write_all(&raw).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let mut header_buffer = [0; HEADER_LEN];
        self.socket.read_exact(&mut header_buffer).await?;
        let header = RawHeader::parse(&header_buffer)?;
        debug!("Reading {} bytes from muxer", header.body_len());

        let mut body_buffer = vec![0; header.body_len()];
        self.socket.read_exact(&mut body_buffer).await?;

        let res = plist::from_bytes(&body_buffer)?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));

        Ok(res)
    }
}

impl UsbmuxdDevice {
    /// Creates a provider that reaches this device through `addr`
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}
