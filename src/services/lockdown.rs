//! lockdownd client
//!
//! lockdownd answers on a fixed port, hands out device values and starts
//! the other services on request.

use std::borrow::Cow;

use plist::Value;
use tracing::{debug, error, warn};

use crate::{DeviceConnection, DeviceError, DeviceService, pairing_file, provider::DeviceProvider};

/// Client for the lockdownd service
#[derive(Debug)]
pub struct LockdownClient {
    pub connection: DeviceConnection,
}

impl DeviceService for LockdownClient {
    fn service_name() -> Cow<'static, str> {
        Cow::Borrowed("com.apple.mobile.lockdown")
    }

    /// lockdownd is not started through itself, so this only dials its port
    async fn connect(provider: &dyn DeviceProvider) -> Result<Self, DeviceError> {
        let connection = provider.connect(Self::LOCKDOWND_PORT).await?;
        Ok(Self::new(connection))
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

impl LockdownClient {
    pub const LOCKDOWND_PORT: u16 = 62078;

    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    fn request(&self, request: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), request.into());
        req
    }

    /// Reads a value from the device
    ///
    /// # Arguments
    /// * `key` - The value to read, or `None` for the whole domain
    /// * `domain` - Optional domain, e.g. `com.apple.disk_usage`
    ///
    /// # Example
    /// ```rust,no_run
    /// # async fn f(client: &mut devicelink::lockdown::LockdownClient) -> Result<(), devicelink::DeviceError> {
    /// let version = client.get_value(Some("ProductVersion"), None).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, DeviceError> {
        let mut req = self.request("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let mut message = self.connection.read_plist().await?;
        match message.remove("Value") {
            Some(m) => Ok(m),
            None => Err(DeviceError::MissingValue),
        }
    }

    /// Writes a value on the device
    pub async fn set_value(
        &mut self,
        key: impl Into<String>,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), DeviceError> {
        let mut req = self.request("SetValue");
        req.insert("Key".into(), key.into().into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        self.connection.read_plist().await?;
        Ok(())
    }

    /// Whether the device predates TLS 1.3 support
    ///
    /// Devices whose `ProductVersion` major is below 5 only negotiate TLS 1.2.
    /// An unreadable version is treated as modern.
    pub async fn is_legacy(&mut self) -> bool {
        let version = match self.get_value(Some("ProductVersion"), None).await {
            Ok(Value::String(v)) => v,
            Ok(other) => {
                warn!("ProductVersion is not a string: {other:?}");
                return false;
            }
            Err(e) => {
                warn!("Unable to read ProductVersion: {e}");
                return false;
            }
        };
        let major = version
            .split('.')
            .next()
            .and_then(|m| m.parse::<u32>().ok())
            .unwrap_or(u32::MAX);
        debug!("Device runs {version}");
        major < 5
    }

    /// Starts a TLS session with the device
    ///
    /// lockdownd must answer `EnableSessionSSL`; the connection is then
    /// upgraded in place.
    ///
    /// # Errors
    /// A failed upgrade leaves the client without a connection.
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
        legacy: bool,
    ) -> Result<(), DeviceError> {
        if !self.connection.is_connected() {
            return Err(DeviceError::NoEstablishedConnection);
        }

        let mut req = self.request("StartSession");
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let response = self.connection.read_plist().await?;
        match response.get("EnableSessionSSL") {
            Some(Value::Boolean(true)) => {}
            other => {
                warn!("StartSession did not enable SSL: {other:?}");
                return Err(DeviceError::UnexpectedResponse);
            }
        }

        self.connection.start_session(pairing_file, legacy).await
    }

    /// Asks lockdownd to start a service
    ///
    /// # Returns
    /// The port the service listens on, and whether it expects TLS
    ///
    /// # Errors
    /// `InvalidService` when the device does not know the service
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<(u16, bool), DeviceError> {
        let identifier = identifier.into();
        let mut req = self.request("StartService");
        req.insert("Service".into(), identifier.into());
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let response = self.connection.read_plist().await?;

        // absent over USB
        let ssl = response
            .get("EnableServiceSSL")
            .and_then(|x| x.as_boolean())
            .unwrap_or(false);

        match response.get("Port").and_then(|x| x.as_unsigned_integer()) {
            Some(port) => match u16::try_from(port) {
                Ok(port) => Ok((port, ssl)),
                Err(_) => {
                    error!("Port {port} is out of range");
                    Err(DeviceError::UnexpectedResponse)
                }
            },
            None => {
                error!("Response didn't contain an integer port");
                Err(DeviceError::UnexpectedResponse)
            }
        }
    }
}

impl From<DeviceConnection> for LockdownClient {
    fn from(value: DeviceConnection) -> Self {
        Self::new(value)
    }
}
