//! Provisioning profile management

use std::borrow::Cow;

use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::{DeviceConnection, DeviceError, DeviceService, pretty_print_dictionary};

#[derive(Debug)]
pub struct MisagentClient {
    pub connection: DeviceConnection,
}

impl DeviceService for MisagentClient {
    fn service_name() -> Cow<'static, str> {
        Cow::Borrowed("com.apple.misagent")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

impl MisagentClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    async fn request(
        &mut self,
        message_type: &str,
        extra: Vec<(&'static str, Value)>,
    ) -> Result<Dictionary, DeviceError> {
        let mut req = Dictionary::new();
        req.insert("MessageType".into(), message_type.into());
        req.insert("ProfileType".into(), "Provisioning".into());
        for (k, v) in extra {
            req.insert(k.into(), v);
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let res = self.connection.read_plist().await?;
        debug!("misagent {message_type}: {}", pretty_print_dictionary(&res));
        match res.get("Status").and_then(|x| x.as_signed_integer()) {
            Some(0) => Ok(res),
            Some(status) => {
                warn!("misagent {message_type} failed with status {status}");
                Err(DeviceError::MisagentFailure(status))
            }
            None => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Installs a provisioning profile (the raw `.mobileprovision` bytes)
    pub async fn install(&mut self, profile: Vec<u8>) -> Result<(), DeviceError> {
        self.request("Install", vec![("Profile", Value::Data(profile))])
            .await?;
        Ok(())
    }

    /// Removes the profile with the given UUID
    pub async fn remove(&mut self, profile_id: &str) -> Result<(), DeviceError> {
        self.request("Remove", vec![("ProfileID", profile_id.into())])
            .await?;
        Ok(())
    }

    /// Copies installed profiles; `all` includes the ones the system installed
    pub async fn copy(&mut self, all: bool) -> Result<Vec<Vec<u8>>, DeviceError> {
        let message_type = if all { "CopyAll" } else { "Copy" };
        let mut res = self.request(message_type, Vec::new()).await?;

        let payload = match res.remove("Payload") {
            Some(Value::Array(p)) => p,
            Some(_) => return Err(DeviceError::UnexpectedResponse),
            None => return Ok(Vec::new()),
        };
        Ok(payload
            .into_iter()
            .filter_map(|p| match p {
                Value::Data(d) => Some(d),
                other => {
                    warn!("Skipping non data profile {other:?}");
                    None
                }
            })
            .collect())
    }
}
