//! Heartbeat keep-alive
//!
//! The device closes service connections when nobody answers its "Marco"
//! messages. [`HeartbeatClient::spawn`] answers them in a background task
//! for as long as the returned [`Heartbeat`] lives.

use std::{borrow::Cow, time::Instant};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::{DeviceConnection, DeviceError, DeviceService, ProtocolError};

#[derive(Debug)]
pub struct HeartbeatClient {
    pub connection: DeviceConnection,
}

impl DeviceService for HeartbeatClient {
    fn service_name() -> Cow<'static, str> {
        Cow::Borrowed("com.apple.mobile.heartbeat")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

impl HeartbeatClient {
    /// Interval assumed until the device announces its own
    pub const DEFAULT_INTERVAL: u64 = 15;
    /// Extra seconds granted on top of the interval before giving up
    pub const GRACE: u64 = 5;

    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Waits up to `timeout_secs` for a Marco and returns the announced interval
    ///
    /// # Errors
    /// `HeartbeatTimeout` when nothing arrives in time, `HeartbeatSleepyTime`
    /// when the device is going to sleep
    pub async fn get_marco(&mut self, timeout_secs: u64) -> Result<u64, DeviceError> {
        let rec = tokio::select! {
            rec = self.connection.read_plist() => rec?,
            _ = tokio::time::sleep(std::time::Duration::from_secs(timeout_secs)) => {
                return Err(DeviceError::HeartbeatTimeout)
            }
        };

        if let Some(interval) = rec.get("Interval") {
            return interval
                .as_unsigned_integer()
                .ok_or(DeviceError::UnexpectedResponse);
        }
        match rec.get("Command").and_then(|x| x.as_string()) {
            Some("SleepyTime") => Err(DeviceError::HeartbeatSleepyTime),
            other => {
                warn!("Unexpected heartbeat message: {other:?}");
                Err(DeviceError::UnexpectedResponse)
            }
        }
    }

    pub async fn send_polo(&mut self) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Polo".into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await
    }

    /// Answers every Marco from a background task
    ///
    /// The task ends with the first error; the handle then reports it from
    /// [`Heartbeat::state`] and [`Heartbeat::wait`].
    pub fn spawn(mut self) -> Heartbeat {
        let (tx, rx) = watch::channel(HeartbeatState {
            last_beat: None,
            interval: Self::DEFAULT_INTERVAL,
            beats: 0,
            error: None,
        });

        let task = tokio::spawn(async move {
            let mut interval = Self::DEFAULT_INTERVAL;
            loop {
                let beat = match self.get_marco(interval + Self::GRACE).await {
                    Ok(i) => {
                        interval = i;
                        self.send_polo().await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = beat {
                    debug!("Heartbeat stopped: {e}");
                    tx.send_modify(|s| s.error = Some(ProtocolError::from(&e)));
                    return e;
                }
                tx.send_modify(|s| {
                    s.last_beat = Some(Instant::now());
                    s.interval = interval;
                    s.beats += 1;
                });
            }
        });

        Heartbeat {
            state: rx,
            task: Some(task),
        }
    }
}

/// Snapshot of a running keep-alive
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    pub last_beat: Option<Instant>,
    /// Seconds between Marcos, as last announced by the device
    pub interval: u64,
    pub beats: u64,
    /// Set once the keep-alive has died
    pub error: Option<ProtocolError>,
}

/// Owner of a keep-alive task. Dropping it stops the task.
#[derive(Debug)]
pub struct Heartbeat {
    state: watch::Receiver<HeartbeatState>,
    task: Option<JoinHandle<DeviceError>>,
}

impl Heartbeat {
    pub fn state(&self) -> HeartbeatState {
        self.state.borrow().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Resolves once the state changes, e.g. after the next beat
    pub async fn changed(&mut self) -> HeartbeatState {
        if self.state.changed().await.is_err() {
            debug!("Heartbeat task is gone");
        }
        self.state()
    }

    pub fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Waits for the keep-alive to die and returns why
    pub async fn wait(mut self) -> DeviceError {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(e) => e,
                Err(e) => DeviceError::InternalError(format!("heartbeat task failed: {e}")),
            },
            None => DeviceError::InternalError("heartbeat already cancelled".into()),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
