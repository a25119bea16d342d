//! Deserialization of usbmuxd device listings

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    DeviceError,
    usbmuxd::{Connection, UsbmuxdDevice},
};

#[derive(Deserialize)]
pub(crate) struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

/// Reads the IPv6 address stored at offset 8 of a sockaddr_in6
fn ipv6_at(addr: &[u8]) -> Option<Ipv6Addr> {
    let octets: [u8; 16] = addr.get(8..24)?.try_into().ok()?;
    Some(Ipv6Addr::from(octets))
}

/// Decodes the raw sockaddr usbmuxd reports for network devices
fn parse_sockaddr(addr: &[u8]) -> Result<Connection, DeviceError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(DeviceError::UnexpectedResponse);
    }

    Ok(match (addr[0], addr[1]) {
        // sockaddr_in as sent by older daemons: family in the first byte
        (0x02, _) => Connection::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        (0x1E, _) | (0x1C, 0x1E) => match ipv6_at(addr) {
            Some(ip) => Connection::Network(IpAddr::V6(ip)),
            None => {
                warn!("IPv6 sockaddr too short (len {})", addr.len());
                return Err(DeviceError::UnexpectedResponse);
            }
        },
        (0x1C, family) => {
            warn!("Expected IPv6 family (0x1E) but got {family:02X} for length 0x1C");
            Connection::Unknown(format!("Network {family:02X}"))
        }
        (family, _) => {
            warn!("Unknown IP address protocol: {family:02X}");
            Connection::Unknown(format!("Network {family:02X}"))
        }
    })
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = DeviceError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "Network" => match dev.properties.network_address {
                Some(addr) => parse_sockaddr(addr.as_ref())?,
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(DeviceError::UnexpectedResponse);
                }
            },
            "USB" => Connection::Usb,
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_sockaddr() {
        let addr = [0x02, 0, 0, 0, 192, 168, 1, 20];
        assert_eq!(
            parse_sockaddr(&addr).unwrap(),
            Connection::Network(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        );
    }

    #[test]
    fn ipv6_sockaddr() {
        let mut addr = vec![0x1C, 0x1E, 0, 0, 0, 0, 0, 0];
        addr.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        addr.extend_from_slice(&[0; 4]);
        assert_eq!(
            parse_sockaddr(&addr).unwrap(),
            Connection::Network(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert!(parse_sockaddr(&addr[..12]).is_err());
    }
}
