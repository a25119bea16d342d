//! Pairing records
//!
//! A pairing record holds the host certificate and key the device trusts,
//! plus the identifiers lockdownd checks when a session starts.

use std::path::Path;

use base64::Engine;
use plist::Data;
use rustls::pki_types::{CertificateDer, pem::PemObject};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::DeviceError;

/// A parsed pairing record
///
/// Certificates are kept in DER form, private keys as the PEM text stored
/// in the record.
#[derive(Clone, Debug, PartialEq)]
pub struct PairingFile {
    /// Device's certificate
    pub device_certificate: CertificateDer<'static>,
    /// Host's private key, PEM encoded
    pub host_private_key: Vec<u8>,
    /// Host's certificate presented during the TLS handshake
    pub host_certificate: CertificateDer<'static>,
    /// Root CA's private key, PEM encoded
    pub root_private_key: Vec<u8>,
    /// Root CA's certificate
    pub root_certificate: CertificateDer<'static>,
    pub system_buid: String,
    pub host_id: String,
    /// Escrow bag allowing for access while locked
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_private_key: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(
        rename = "WiFiMACAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pairing record from disk
    ///
    /// # Errors
    /// `Socket` if the file cannot be read, `InvalidPairingFile` if it cannot be parsed
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pairing record from XML or binary plist bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceError> {
        let raw = match plist::from_bytes::<RawPairingFile>(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to parse pairing file: {e:?}");
                return Err(DeviceError::InvalidPairingFile(e.to_string()));
            }
        };
        raw.try_into()
    }

    /// Parses a pairing record from an already decoded plist value
    ///
    /// This is the shape usbmuxd returns inside its `PairRecordData` reply.
    pub fn from_value(v: &plist::Value) -> Result<Self, DeviceError> {
        let raw: RawPairingFile = plist::from_value(v)
            .map_err(|e| DeviceError::InvalidPairingFile(e.to_string()))?;
        raw.try_into()
    }

    /// Serializes the record as an XML plist
    ///
    /// Certificates are written back as PEM so the output parses again.
    pub fn serialize(&self) -> Result<Vec<u8>, DeviceError> {
        let raw = RawPairingFile::from(self);
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }
}

fn cert_from_pem(name: &str, pem: Data) -> Result<CertificateDer<'static>, DeviceError> {
    CertificateDer::from_pem_slice(pem.as_ref())
        .map_err(|e| DeviceError::InvalidPairingFile(format!("{name}: {e}")))
}

fn cert_to_pem(cert: &CertificateDer<'_>) -> Data {
    let encoded = base64::engine::general_purpose::STANDARD.encode(cert.as_ref());
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    // base64 output is ascii, so splitting on bytes stays on char boundaries
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    Data::new(pem.into_bytes())
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = DeviceError;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: cert_from_pem("DeviceCertificate", value.device_certificate)?,
            host_private_key: value.host_private_key.into(),
            host_certificate: cert_from_pem("HostCertificate", value.host_certificate)?,
            root_private_key: value.root_private_key.into(),
            root_certificate: cert_from_pem("RootCertificate", value.root_certificate)?,
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        })
    }
}

impl From<&PairingFile> for RawPairingFile {
    fn from(value: &PairingFile) -> Self {
        Self {
            device_certificate: cert_to_pem(&value.device_certificate),
            host_private_key: Data::new(value.host_private_key.clone()),
            host_certificate: cert_to_pem(&value.host_certificate),
            root_private_key: Data::new(value.root_private_key.clone()),
            root_certificate: cert_to_pem(&value.root_certificate),
            system_buid: value.system_buid.clone(),
            host_id: value.host_id.clone(),
            escrow_bag: value.escrow_bag.clone().map(Data::new),
            wifi_mac_address: value.wifi_mac_address.clone(),
            udid: value.udid.clone(),
        }
    }
}
