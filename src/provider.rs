//! Providers: where device connections come from
//!
//! A [`DeviceProvider`] knows how to reach a device port (directly over the
//! network, or through usbmuxd) and where the pairing record lives. An
//! [`RsdProvider`] opens streams to service ports inside a tunnel.

use std::{future::Future, pin::Pin};

#[cfg(feature = "tcp")]
use std::net::{IpAddr, SocketAddr};

#[cfg(feature = "tcp")]
use tokio::net::TcpStream;

use crate::{DeviceConnection, DeviceError, ReadWrite, pairing_file::PairingFile};

#[cfg(feature = "usbmuxd")]
use crate::usbmuxd::UsbmuxdAddr;

/// A source of connections to one device
pub trait DeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    /// Opens a raw connection to `port` on the device
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<DeviceConnection, DeviceError>> + Send>>;

    fn label(&self) -> &str;

    /// Loads the pairing record used to secure sessions with this device
    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, DeviceError>> + Send>>;
}

/// Opens streams to service ports reachable through a tunnel
pub trait RsdProvider: Unpin + Send + Sync + std::fmt::Debug {
    fn connect_to_service_port(
        &mut self,
        port: u16,
    ) -> impl Future<Output = Result<Box<dyn ReadWrite>, DeviceError>> + Send;
}

/// Reaches a device directly over the network
#[cfg(feature = "tcp")]
#[derive(Debug, Clone)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub pairing_file: PairingFile,
    pub label: String,
}

#[cfg(feature = "tcp")]
impl TcpProvider {
    pub fn new(addr: IpAddr, pairing_file: PairingFile, label: impl Into<String>) -> Self {
        Self {
            addr,
            pairing_file,
            label: label.into(),
        }
    }
}

#[cfg(feature = "tcp")]
impl DeviceProvider for TcpProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<DeviceConnection, DeviceError>> + Send>> {
        let addr = self.addr;
        let label = self.label.clone();
        Box::pin(async move {
            let socket_addr = SocketAddr::new(addr, port);
            let stream = TcpStream::connect(socket_addr).await?;
            Ok(DeviceConnection::new(Box::new(stream), label))
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, DeviceError>> + Send>> {
        let pairing_file = self.pairing_file.clone();
        Box::pin(async move { Ok(pairing_file) })
    }
}

/// Reaches a device through the usbmuxd daemon
///
/// Every call opens a fresh connection to the daemon, since a usbmuxd
/// connection turns into the device stream once `Connect` succeeds.
#[cfg(feature = "usbmuxd")]
#[derive(Debug, Clone)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

#[cfg(feature = "usbmuxd")]
impl DeviceProvider for UsbmuxdProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<DeviceConnection, DeviceError>> + Send>> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let device_id = self.device_id;
        let label = self.label.clone();

        Box::pin(async move {
            let usbmuxd = addr.connect(tag).await?;
            usbmuxd.connect_to_device(device_id, port, &label).await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, DeviceError>> + Send>> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let udid = self.udid.clone();

        Box::pin(async move {
            let mut usbmuxd = addr.connect(tag).await?;
            usbmuxd.get_pair_record(&udid).await
        })
    }
}
