//! Installation proxy
//!
//! Queries, installs and removes apps. Long running commands report
//! progress as a stream of [`InstallProgress`] events.

use std::{borrow::Cow, collections::HashMap, pin::Pin};

use futures::{Stream, StreamExt};
use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::{DeviceConnection, DeviceError, DeviceService};

#[derive(Debug)]
pub struct InstallationProxyClient {
    pub connection: DeviceConnection,
}

/// One step of an install, upgrade or uninstall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallProgress {
    Percent(u64),
    Complete,
}

pub type ProgressStream<'a> =
    Pin<Box<dyn Stream<Item = Result<InstallProgress, DeviceError>> + Send + 'a>>;

impl DeviceService for InstallationProxyClient {
    fn service_name() -> Cow<'static, str> {
        Cow::Borrowed("com.apple.mobile.installation_proxy")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

fn command(name: &str, options: Option<Value>) -> Dictionary {
    let mut req = Dictionary::new();
    req.insert("Command".into(), name.into());
    req.insert(
        "ClientOptions".into(),
        options.unwrap_or_else(|| Value::Dictionary(Dictionary::new())),
    );
    req
}

impl InstallationProxyClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Looks up installed apps, keyed by bundle identifier
    ///
    /// `application_type` is `User`, `System`, `Any`...; `None` means `Any`.
    pub async fn get_apps(
        &mut self,
        application_type: Option<&str>,
        bundle_identifiers: Option<Vec<String>>,
    ) -> Result<HashMap<String, Value>, DeviceError> {
        let mut options = Dictionary::new();
        options.insert(
            "ApplicationType".into(),
            application_type.unwrap_or("Any").into(),
        );
        if let Some(ids) = bundle_identifiers {
            options.insert(
                "BundleIDs".into(),
                Value::Array(ids.into_iter().map(Value::String).collect()),
            );
        }
        let req = command("Lookup", Some(Value::Dictionary(options)));
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let mut res = self.connection.read_plist().await?;
        match res.remove("LookupResult") {
            Some(Value::Dictionary(apps)) => Ok(apps.into_iter().collect()),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Lists apps, collecting every chunk the device sends
    pub async fn browse(&mut self, options: Option<Value>) -> Result<Vec<Value>, DeviceError> {
        self.connection
            .send_plist(Value::Dictionary(command("Browse", options)))
            .await?;

        let mut values = Vec::new();
        loop {
            let mut res = self.connection.read_plist().await?;
            if let Some(e) = res.remove("ErrorDescription").and_then(|x| x.into_string()) {
                return Err(DeviceError::InstallationProxyOperationFailed(e));
            }
            match res.remove("CurrentList").and_then(|x| x.into_array()) {
                Some(list) => values.extend(list),
                None => {
                    if res.get("Status").and_then(|x| x.as_string()) != Some("Complete") {
                        warn!("Browse reply without CurrentList");
                    }
                    break;
                }
            }
            if res.get("Status").and_then(|x| x.as_string()) == Some("Complete") {
                break;
            }
        }
        debug!("Browse returned {} apps", values.len());
        Ok(values)
    }

    /// Installs the package at `package_path` (relative to the AFC root)
    pub async fn install(
        &mut self,
        package_path: impl Into<String>,
        options: Option<Value>,
    ) -> Result<(), DeviceError> {
        drain(self.install_with_progress(package_path, options)).await
    }

    pub fn install_with_progress(
        &mut self,
        package_path: impl Into<String>,
        options: Option<Value>,
    ) -> ProgressStream<'_> {
        let mut req = command("Install", options);
        req.insert("PackagePath".into(), Value::String(package_path.into()));
        self.run_with_progress(req)
    }

    pub async fn upgrade(
        &mut self,
        package_path: impl Into<String>,
        options: Option<Value>,
    ) -> Result<(), DeviceError> {
        drain(self.upgrade_with_progress(package_path, options)).await
    }

    pub fn upgrade_with_progress(
        &mut self,
        package_path: impl Into<String>,
        options: Option<Value>,
    ) -> ProgressStream<'_> {
        let mut req = command("Upgrade", options);
        req.insert("PackagePath".into(), Value::String(package_path.into()));
        self.run_with_progress(req)
    }

    pub async fn uninstall(
        &mut self,
        bundle_id: impl Into<String>,
        options: Option<Value>,
    ) -> Result<(), DeviceError> {
        drain(self.uninstall_with_progress(bundle_id, options)).await
    }

    pub fn uninstall_with_progress(
        &mut self,
        bundle_id: impl Into<String>,
        options: Option<Value>,
    ) -> ProgressStream<'_> {
        let mut req = command("Uninstall", options);
        req.insert("ApplicationIdentifier".into(), Value::String(bundle_id.into()));
        self.run_with_progress(req)
    }

    /// Sends `req` when first polled, then yields progress until completion
    fn run_with_progress(&mut self, req: Dictionary) -> ProgressStream<'_> {
        Box::pin(async_stream::try_stream! {
            self.connection.send_plist(Value::Dictionary(req)).await?;
            loop {
                let mut res = self.connection.read_plist().await?;

                if let Some(e) = res.remove("ErrorDescription").and_then(|x| x.into_string()) {
                    Err(DeviceError::InstallationProxyOperationFailed(e))?;
                }
                if let Some(p) = res
                    .remove("PercentComplete")
                    .and_then(|x| x.as_unsigned_integer())
                {
                    yield InstallProgress::Percent(p);
                }
                if res.get("Status").and_then(|x| x.as_string()) == Some("Complete") {
                    yield InstallProgress::Complete;
                    break;
                }
            }
        })
    }
}

async fn drain(mut progress: ProgressStream<'_>) -> Result<(), DeviceError> {
    while let Some(p) = progress.next().await {
        p?;
    }
    Ok(())
}
