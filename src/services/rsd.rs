//! Remote Service Discovery
//!
//! The first service reachable inside a tunnel. It answers a RemoteXPC
//! handshake with the directory of every service the device exposes.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    DeviceError, ReadWrite, RemoteXpcClient,
    provider::RsdProvider,
    xpc::{Dictionary, XpcObject},
};

/// One entry of the service directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RsdService {
    /// Entitlement the client needs to use the service
    pub entitlement: String,
    pub port: u16,
    pub uses_remote_xpc: bool,
    pub features: Option<Vec<String>>,
    pub service_version: Option<i64>,
}

impl RsdService {
    /// The advertised version, or -1 when the device did not report one
    pub fn version(&self) -> i64 {
        self.service_version.unwrap_or(-1)
    }

    fn parse(name: &str, service: &Dictionary) -> Option<Self> {
        let entitlement = match service.get("Entitlement").and_then(|x| x.as_string()) {
            Some(e) => e.to_string(),
            None => {
                warn!("Service {name} did not contain an entitlement string");
                return None;
            }
        };
        // ports are advertised as decimal strings
        let port = match service
            .get("Port")
            .and_then(|x| x.as_unsigned_integer())
            .and_then(|x| u16::try_from(x).ok())
        {
            Some(p) => p,
            None => {
                warn!("Service {name} did not contain a valid port");
                return None;
            }
        };

        let properties = service.get("Properties").and_then(|x| x.as_dictionary());
        let property = |key: &str| properties.and_then(|p| p.get(key));

        let uses_remote_xpc = property("UsesRemoteXPC")
            .and_then(|x| x.as_bool())
            .unwrap_or(false);
        let features = property("Features").and_then(|x| x.as_array()).map(|f| {
            f.iter()
                .filter_map(|x| x.as_string())
                .map(|x| x.to_string())
                .collect::<Vec<String>>()
        });
        let service_version = property("ServiceVersion").and_then(|x| x.as_signed_integer());

        Some(Self {
            entitlement,
            port,
            uses_remote_xpc,
            features,
            service_version,
        })
    }
}

/// The service directory returned by the RSD handshake
#[derive(Debug, Clone)]
pub struct RsdHandshake {
    pub services: HashMap<String, RsdService>,
    pub protocol_version: usize,
    pub properties: HashMap<String, plist::Value>,
    pub uuid: String,
}

impl RsdHandshake {
    /// Well known port of the RSD service inside a tunnel
    pub const RSD_PORT: u16 = 58783;

    /// Performs the RemoteXPC handshake on `socket` and parses the directory
    ///
    /// Malformed service entries are skipped with a warning. A directory
    /// without protocol version, UUID or properties is rejected.
    pub async fn new(socket: impl ReadWrite) -> Result<Self, DeviceError> {
        let mut xpc_client = RemoteXpcClient::new(socket).await?;
        xpc_client.do_handshake().await?;
        let data = xpc_client.recv_root().await?;
        Self::from_xpc(&data)
    }

    fn from_xpc(data: &XpcObject) -> Result<Self, DeviceError> {
        let data = data.as_dictionary().ok_or(DeviceError::UnexpectedResponse)?;
        let services_dict = data
            .get("Services")
            .and_then(|x| x.as_dictionary())
            .ok_or(DeviceError::UnexpectedResponse)?;

        let mut services = HashMap::new();
        for (name, service) in services_dict {
            let parsed = match service.as_dictionary() {
                Some(s) => RsdService::parse(name, s),
                None => {
                    warn!("Service {name} is not a dictionary");
                    None
                }
            };
            if let Some(s) = parsed {
                services.insert(name.clone(), s);
            }
        }

        let protocol_version = data
            .get("MessagingProtocolVersion")
            .and_then(|x| x.as_unsigned_integer())
            .ok_or(DeviceError::UnexpectedResponse)? as usize;

        let uuid = data
            .get("UUID")
            .and_then(|x| x.as_string())
            .ok_or(DeviceError::UnexpectedResponse)?
            .to_string();

        let properties = data
            .get("Properties")
            .and_then(|x| x.as_dictionary())
            .ok_or(DeviceError::UnexpectedResponse)?
            .iter()
            .map(|(name, prop)| (name.to_owned(), prop.to_plist()))
            .collect();

        debug!(
            "RSD directory {uuid} lists {} services (protocol {protocol_version})",
            services.len()
        );
        Ok(Self {
            services,
            protocol_version,
            properties,
            uuid,
        })
    }

    pub fn service_available(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Looks up a service by name
    ///
    /// # Errors
    /// `ServiceNotFound` when the directory has no such entry
    pub fn get_service_info(&self, name: &str) -> Result<&RsdService, DeviceError> {
        self.services.get(name).ok_or(DeviceError::ServiceNotFound)
    }

    /// Connects to the typed service `T` through `provider`
    pub async fn connect<T>(&self, provider: &mut impl RsdProvider) -> Result<T, DeviceError>
    where
        T: crate::RsdService,
    {
        let service_name = T::rsd_service_name();
        let service = self.get_service_info(&service_name)?;

        debug!(
            "Connecting to RSD service {service_name} on port {}",
            service.port
        );
        let stream = provider.connect_to_service_port(service.port).await?;
        T::from_stream(stream).await
    }
}
