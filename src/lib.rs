#![doc = include_str!("../README.md")]

#[cfg(not(any(feature = "aws-lc", feature = "ring")))]
compile_error!("enable either the `aws-lc` or the `ring` feature to select a TLS backend");

pub mod pairing_file;
pub mod provider;
#[cfg(feature = "tunnel_tcp_stack")]
pub mod tcp;
mod tls;
#[cfg(feature = "usbmuxd")]
pub mod usbmuxd;
mod util;
#[cfg(feature = "xpc")]
pub mod xpc;

pub mod services;
pub use services::*;

#[cfg(feature = "xpc")]
pub use xpc::RemoteXpcClient;

use provider::DeviceProvider;
#[cfg(feature = "rsd")]
use provider::RsdProvider;
use rustls::pki_types::ServerName;
use std::{borrow::Cow, io, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

pub use util::{pretty_print_dictionary, pretty_print_plist};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream, UnixStream and DuplexStream implement this trait, as does
/// the adapter's `StreamHandle`.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// A typed service started through lockdownd.
///
/// Implementors only provide the service name and how to wrap an established
/// connection; the default `connect` performs the lockdown negotiation.
pub trait DeviceService: Sized {
    /// Returns the service name as advertised by the device
    fn service_name() -> Cow<'static, str>;

    /// Wraps an already started (and, if required, secured) service connection
    fn from_stream(
        connection: DeviceConnection,
    ) -> impl std::future::Future<Output = Result<Self, DeviceError>> + Send;

    /// Establishes a connection to this service
    ///
    /// Connects to lockdownd, starts a session with the provider's pairing file,
    /// asks lockdownd to start the service, connects to the returned port and
    /// upgrades it to TLS when the device requests it.
    fn connect(
        provider: &dyn DeviceProvider,
    ) -> impl std::future::Future<Output = Result<Self, DeviceError>> + Send {
        async move {
            let pairing_file = provider.get_pairing_file().await?;
            let mut lockdown = lockdown::LockdownClient::connect(provider).await?;
            let legacy = lockdown.is_legacy().await;
            lockdown.start_session(&pairing_file, legacy).await?;

            let (port, ssl) = lockdown.start_service(Self::service_name()).await?;
            let mut connection = provider.connect(port).await?;
            if ssl {
                connection.start_session(&pairing_file, legacy).await?;
            }
            Self::from_stream(connection).await
        }
    }
}

/// A typed service reached through the RSD service directory of a tunnel.
#[cfg(feature = "rsd")]
pub trait RsdService: Sized {
    /// Returns the name the service is advertised under in the directory
    fn rsd_service_name() -> Cow<'static, str>;

    /// Wraps a freshly opened stream to the service port
    fn from_stream(
        stream: Box<dyn ReadWrite>,
    ) -> impl std::future::Future<Output = Result<Self, DeviceError>> + Send;

    /// Looks the service up in `directory` and connects to it through `provider`
    fn connect_rsd(
        provider: &mut impl RsdProvider,
        directory: &rsd::RsdHandshake,
    ) -> impl std::future::Future<Output = Result<Self, DeviceError>> + Send
    where
        Self: Send,
    {
        directory.connect(provider)
    }
}

/// Main handle for communicating with a device over one transport
///
/// A connection starts out raw, may be upgraded to TLS once with
/// [`DeviceConnection::start_session`], and is unusable after
/// [`DeviceConnection::close`] or a failed upgrade.
#[derive(Debug)]
pub struct DeviceConnection {
    socket: Option<Box<dyn ReadWrite>>,
    label: String,
}

impl DeviceConnection {
    /// Largest plist frame accepted from the device
    pub const MAX_PLIST_LEN: u32 = 64 * 1024 * 1024;

    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Label sent to the device with lockdown requests
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the connection still owns a usable transport
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Queries the device type
    ///
    /// # Returns
    /// The type string reported by the service, e.g. `com.apple.mobile.lockdown`
    pub async fn get_type(&mut self) -> Result<String, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "QueryType".into());
        self.send_plist(plist::Value::Dictionary(req)).await?;
        let message = self.read_plist().await?;
        match message.get("Type").and_then(|x| x.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Performs the RSD check-in that tunnel services expect before their own protocol
    ///
    /// The device answers with an `RSDCheckin` echo followed by a `StartService`
    /// notification; anything else is rejected.
    pub async fn checkin(&mut self) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("ProtocolVersion".into(), "2".into());
        req.insert("Request".into(), "RSDCheckin".into());
        self.send_plist(plist::Value::Dictionary(req)).await?;

        for expected in ["RSDCheckin", "StartService"] {
            let res = self.read_plist().await?;
            match res.get("Request").and_then(|x| x.as_string()) {
                Some(r) if r == expected => {}
                other => {
                    warn!("Expected {expected} during checkin, got {other:?}");
                    return Err(DeviceError::UnexpectedResponse);
                }
            }
        }
        Ok(())
    }

    fn socket(&mut self) -> Result<&mut Box<dyn ReadWrite>, DeviceError> {
        self.socket
            .as_mut()
            .ok_or(DeviceError::NoEstablishedConnection)
    }

    /// Sends an XML plist, prefixed by its big endian u32 length
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), DeviceError> {
        debug!("Sending plist: {}", pretty_print_plist(&message));
        let mut buf = Vec::new();
        message.to_writer_xml(&mut buf)?;
        self.send_framed(&buf).await
    }

    /// Sends a binary plist, prefixed by its big endian u32 length
    pub async fn send_bplist(&mut self, message: plist::Value) -> Result<(), DeviceError> {
        debug!("Sending bplist: {}", pretty_print_plist(&message));
        let mut buf = Vec::new();
        message.to_writer_binary(&mut buf)?;
        self.send_framed(&buf).await
    }

    async fn send_framed(&mut self, body: &[u8]) -> Result<(), DeviceError> {
        let socket = self.socket()?;
        socket.write_all(&(body.len() as u32).to_be_bytes()).await?;
        socket.write_all(body).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Sends raw bytes to the device
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), DeviceError> {
        let socket = self.socket()?;
        for (i, part) in message.chunks(1024 * 64).enumerate() {
            trace!("Writing chunk {i} of {} bytes", part.len());
            socket.write_all(part).await?;
        }
        socket.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes from the device
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, DeviceError> {
        let socket = self.socket()?;
        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads up to `max_size` bytes from the device
    ///
    /// Returns an empty vector once the device has closed its side.
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, DeviceError> {
        let socket = self.socket()?;
        let mut buf = vec![0; max_size as usize];
        let len = socket.read(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Reads a length prefixed plist dictionary
    ///
    /// # Errors
    /// A reply carrying an `Error` key is turned into the matching typed error.
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let socket = self.socket()?;
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        if len > Self::MAX_PLIST_LEN {
            warn!("Device announced a {len} byte plist");
            return Err(DeviceError::PacketSizeMismatch);
        }
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        let res: plist::Dictionary = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));

        if let Some(e) = res.get("Error").and_then(|e| e.as_string()) {
            return Err(DeviceError::from_device_error_type(e, &res)
                .unwrap_or_else(|| DeviceError::UnknownErrorType(e.to_string())));
        }
        Ok(res)
    }

    /// Upgrades the connection to TLS using the pairing credentials
    ///
    /// The raw transport is consumed by the attempt: if anything fails, the
    /// connection is left without a socket and every later call returns
    /// [`DeviceError::NoEstablishedConnection`].
    ///
    /// # Arguments
    /// * `pairing_file` - Host certificate and key presented to the device
    /// * `legacy` - Restrict the handshake to TLS 1.2 for older devices
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
        legacy: bool,
    ) -> Result<(), DeviceError> {
        let socket = self
            .socket
            .take()
            .ok_or(DeviceError::NoEstablishedConnection)?;

        let config = tls::create_client_config(pairing_file, legacy)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let server_name =
            ServerName::try_from("Device").map_err(|_| DeviceError::InvalidArgument)?;

        let socket = connector
            .connect(server_name, socket)
            .await
            .map_err(DeviceError::HandshakeFailed)?;
        debug!("TLS session established (legacy: {legacy})");

        self.socket = Some(Box::new(socket));
        Ok(())
    }

    /// Shuts the transport down. Every later operation fails.
    pub async fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown().await?;
        }
        Ok(())
    }

    /// Gives up the transport, e.g. to hand it to the tunnel adapter
    pub fn into_socket(mut self) -> Result<Box<dyn ReadWrite>, DeviceError> {
        self.socket
            .take()
            .ok_or(DeviceError::NoEstablishedConnection)
    }
}

/// Coarse classification of every [`DeviceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect refused, timed out, reset, or the transport is gone
    Transport,
    /// TLS or pairing related failure
    Handshake,
    /// The peer sent something we did not expect
    Protocol,
    NotFound,
    PermissionDenied,
    /// Disk full, out of slots, out of memory
    ResourceExhausted,
    AlreadyExists,
    InvalidArgument,
    Other,
}

/// Error type for all device communication failures
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error) = -2,
    #[error("TLS error")]
    Rustls(#[from] rustls::Error) = -3,
    #[error("TLS handshake failed")]
    HandshakeFailed(#[source] io::Error) = -4,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -5,
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error) = -6,
    #[error("unexpected response from device")]
    UnexpectedResponse = -7,
    #[error("this request was prohibited")]
    GetProhibited = -8,
    #[error("no SSL session is active")]
    SessionInactive = -9,
    #[error("device does not have pairing file")]
    InvalidHostID = -10,
    #[error("no established connection")]
    NoEstablishedConnection = -11,
    #[error("device went to sleep")]
    HeartbeatSleepyTime = -12,
    #[error("heartbeat timeout")]
    HeartbeatTimeout = -13,
    #[error("not found")]
    NotFound = -14,
    #[error("service not found")]
    ServiceNotFound = -15,
    #[error("CDTunnel packet too short")]
    CdtunnelPacketTooShort = -16,
    #[error("CDTunnel packet invalid magic")]
    CdtunnelPacketInvalidMagic = -17,
    #[error("proclaimed packet size does not match actual size")]
    PacketSizeMismatch = -18,

    #[cfg(feature = "core_device_proxy")]
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error) = -19,

    #[error("device not found")]
    DeviceNotFound = -20,
    #[error("device locked")]
    DeviceLocked = -21,
    #[error("device refused connection")]
    UsbConnectionRefused = -22,
    #[error("bad command")]
    UsbBadCommand = -23,
    #[error("bad device")]
    UsbBadDevice = -24,
    #[error("usb bad version")]
    UsbBadVersion = -25,

    #[error("invalid pairing file: {0}")]
    InvalidPairingFile(String) = -26,
    #[error("the requested service does not exist")]
    InvalidService = -27,
    #[error("the requested value does not exist")]
    MissingValue = -28,

    #[cfg(feature = "misagent")]
    #[error("misagent operation failed with status {0}")]
    MisagentFailure(i64) = -31,

    #[cfg(feature = "installation_proxy")]
    #[error("installation proxy operation failed: {0}")]
    InstallationProxyOperationFailed(String) = -32,

    #[cfg(feature = "afc")]
    #[error("afc error: {0}")]
    Afc(#[from] afc::errors::AfcError) = -33,
    #[cfg(feature = "afc")]
    #[error("unknown afc opcode")]
    UnknownAfcOpcode = -34,
    #[cfg(feature = "afc")]
    #[error("invalid afc magic")]
    InvalidAfcMagic = -35,
    #[cfg(feature = "afc")]
    #[error("missing file attribute")]
    AfcMissingAttribute = -36,

    #[error("internal error: {0}")]
    InternalError(String) = -39,

    #[cfg(feature = "xpc")]
    #[error("unknown http frame type")]
    UnknownFrame(u8) = -40,
    #[cfg(feature = "xpc")]
    #[error("unknown http setting type")]
    UnknownHttpSetting(u16) = -41,
    #[cfg(feature = "xpc")]
    #[error("unknown XPC type")]
    UnknownXpcType(u32) = -43,
    #[cfg(feature = "xpc")]
    #[error("malformed XPC message")]
    MalformedXpc = -44,
    #[cfg(feature = "xpc")]
    #[error("invalid XPC magic")]
    InvalidXpcMagic = -45,
    #[cfg(feature = "xpc")]
    #[error("unexpected XPC version")]
    UnexpectedXpcVersion = -46,
    #[cfg(feature = "xpc")]
    #[error("invalid C string")]
    InvalidCString = -47,
    #[cfg(feature = "xpc")]
    #[error("stream reset")]
    HttpStreamReset = -48,
    #[cfg(feature = "xpc")]
    #[error("go away packet received")]
    HttpGoAway(String) = -49,

    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError) = -53,
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize) = -55,
    #[error("invalid argument passed")]
    InvalidArgument = -57,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String) = -59,
}

impl DeviceError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Returns
    /// `None` if the string is not a known lockdown error
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" | "SetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" | "PasswordProtected" => Some(Self::DeviceLocked),
            "InvalidService" => Some(Self::InvalidService),
            "MissingValue" => Some(Self::MissingValue),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Some(Self::InternalError(detailed_error))
            }
            _ => None,
        }
    }

    /// The stable numeric code of this error
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::Socket(_) => -1,
            DeviceError::PemParseFailed(_) => -2,
            DeviceError::Rustls(_) => -3,
            DeviceError::HandshakeFailed(_) => -4,
            DeviceError::Plist(_) => -5,
            DeviceError::Utf8(_) => -6,
            DeviceError::UnexpectedResponse => -7,
            DeviceError::GetProhibited => -8,
            DeviceError::SessionInactive => -9,
            DeviceError::InvalidHostID => -10,
            DeviceError::NoEstablishedConnection => -11,
            DeviceError::HeartbeatSleepyTime => -12,
            DeviceError::HeartbeatTimeout => -13,
            DeviceError::NotFound => -14,
            DeviceError::ServiceNotFound => -15,
            DeviceError::CdtunnelPacketTooShort => -16,
            DeviceError::CdtunnelPacketInvalidMagic => -17,
            DeviceError::PacketSizeMismatch => -18,
            #[cfg(feature = "core_device_proxy")]
            DeviceError::Json(_) => -19,
            DeviceError::DeviceNotFound => -20,
            DeviceError::DeviceLocked => -21,
            DeviceError::UsbConnectionRefused => -22,
            DeviceError::UsbBadCommand => -23,
            DeviceError::UsbBadDevice => -24,
            DeviceError::UsbBadVersion => -25,
            DeviceError::InvalidPairingFile(_) => -26,
            DeviceError::InvalidService => -27,
            DeviceError::MissingValue => -28,
            #[cfg(feature = "misagent")]
            DeviceError::MisagentFailure(_) => -31,
            #[cfg(feature = "installation_proxy")]
            DeviceError::InstallationProxyOperationFailed(_) => -32,
            #[cfg(feature = "afc")]
            DeviceError::Afc(_) => -33,
            #[cfg(feature = "afc")]
            DeviceError::UnknownAfcOpcode => -34,
            #[cfg(feature = "afc")]
            DeviceError::InvalidAfcMagic => -35,
            #[cfg(feature = "afc")]
            DeviceError::AfcMissingAttribute => -36,
            DeviceError::InternalError(_) => -39,
            #[cfg(feature = "xpc")]
            DeviceError::UnknownFrame(_) => -40,
            #[cfg(feature = "xpc")]
            DeviceError::UnknownHttpSetting(_) => -41,
            #[cfg(feature = "xpc")]
            DeviceError::UnknownXpcType(_) => -43,
            #[cfg(feature = "xpc")]
            DeviceError::MalformedXpc => -44,
            #[cfg(feature = "xpc")]
            DeviceError::InvalidXpcMagic => -45,
            #[cfg(feature = "xpc")]
            DeviceError::UnexpectedXpcVersion => -46,
            #[cfg(feature = "xpc")]
            DeviceError::InvalidCString => -47,
            #[cfg(feature = "xpc")]
            DeviceError::HttpStreamReset => -48,
            #[cfg(feature = "xpc")]
            DeviceError::HttpGoAway(_) => -49,
            DeviceError::AddrParseError(_) => -53,
            DeviceError::NotEnoughBytes(_, _) => -55,
            DeviceError::InvalidArgument => -57,
            DeviceError::UnknownErrorType(_) => -59,
        }
    }

    /// Classifies the error so callers can pick a recovery policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Socket(e) => match e.kind() {
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
                io::ErrorKind::InvalidData => ErrorKind::Protocol,
                _ => ErrorKind::Transport,
            },
            DeviceError::NoEstablishedConnection
            | DeviceError::HeartbeatSleepyTime
            | DeviceError::HeartbeatTimeout
            | DeviceError::UsbConnectionRefused
            | DeviceError::UsbBadDevice => ErrorKind::Transport,
            #[cfg(feature = "xpc")]
            DeviceError::HttpStreamReset | DeviceError::HttpGoAway(_) => ErrorKind::Transport,

            DeviceError::PemParseFailed(_)
            | DeviceError::Rustls(_)
            | DeviceError::HandshakeFailed(_)
            | DeviceError::SessionInactive
            | DeviceError::InvalidHostID => ErrorKind::Handshake,

            DeviceError::NotFound
            | DeviceError::ServiceNotFound
            | DeviceError::DeviceNotFound
            | DeviceError::InvalidService
            | DeviceError::MissingValue => ErrorKind::NotFound,

            DeviceError::GetProhibited | DeviceError::DeviceLocked => {
                ErrorKind::PermissionDenied
            }

            DeviceError::InvalidArgument | DeviceError::AddrParseError(_) => {
                ErrorKind::InvalidArgument
            }

            #[cfg(feature = "afc")]
            DeviceError::Afc(e) => e.kind(),

            #[cfg(feature = "misagent")]
            DeviceError::MisagentFailure(_) => ErrorKind::Other,
            #[cfg(feature = "installation_proxy")]
            DeviceError::InstallationProxyOperationFailed(_) => ErrorKind::Other,
            DeviceError::InternalError(_) => ErrorKind::Other,

            _ => ErrorKind::Protocol,
        }
    }
}

/// Plain data form of a [`DeviceError`]: a numeric code and a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: i32,
    pub message: String,
}

impl From<&DeviceError> for ProtocolError {
    fn from(err: &DeviceError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<DeviceError> for ProtocolError {
    fn from(err: DeviceError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_connection_rejects_everything() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut conn = DeviceConnection::new(Box::new(client), "test");
        assert!(conn.is_connected());
        conn.close().await.unwrap();
        assert!(!conn.is_connected());

        assert!(matches!(
            conn.get_type().await,
            Err(DeviceError::NoEstablishedConnection)
        ));
        assert!(matches!(
            conn.send_raw(b"hi").await,
            Err(DeviceError::NoEstablishedConnection)
        ));
        assert!(matches!(
            conn.read_raw(4).await,
            Err(DeviceError::NoEstablishedConnection)
        ));
        // closing twice is harmless
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_plist_frame_is_rejected() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = DeviceConnection::new(Box::new(client), "test");
        server.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            conn.read_plist().await,
            Err(DeviceError::PacketSizeMismatch)
        ));
    }

    #[test]
    fn codes_and_kinds() {
        let e = DeviceError::NoEstablishedConnection;
        assert_eq!(e.code(), -11);
        assert_eq!(e.kind(), ErrorKind::Transport);

        let p = ProtocolError::from(DeviceError::ServiceNotFound);
        assert_eq!(p.code, -15);
        assert_eq!(p.message, "service not found");

        let io_missing = DeviceError::Socket(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(io_missing.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn device_error_strings() {
        let ctx = plist::Dictionary::new();
        assert!(matches!(
            DeviceError::from_device_error_type("InvalidService", &ctx),
            Some(DeviceError::InvalidService)
        ));
        assert!(DeviceError::from_device_error_type("SomethingNew", &ctx).is_none());
    }
}
