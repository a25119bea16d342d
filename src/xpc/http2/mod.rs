//! Minimal HTTP/2 client: enough to carry RemoteXPC on two streams

use std::collections::{HashMap, VecDeque};

use frame::HttpFrame;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{DeviceError, ReadWrite};

pub mod frame;
pub use frame::Setting;

const HTTP2_MAGIC: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Owns the transport and queues DATA payloads per stream
#[derive(Debug)]
pub struct Http2Client<R: ReadWrite> {
    inner: R,
    cache: HashMap<u32, VecDeque<Vec<u8>>>,
}

impl<R: ReadWrite> Http2Client<R> {
    /// Writes the connection preface
    pub async fn new(mut inner: R) -> Result<Self, DeviceError> {
        inner.write_all(HTTP2_MAGIC).await?;
        inner.flush().await?;
        Ok(Self {
            inner,
            cache: HashMap::new(),
        })
    }

    async fn write_frame(&mut self, frame: impl HttpFrame) -> Result<(), DeviceError> {
        self.inner.write_all(&frame.serialize()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn set_settings(
        &mut self,
        settings: Vec<Setting>,
        stream_id: u32,
    ) -> Result<(), DeviceError> {
        self.write_frame(frame::SettingsFrame {
            settings,
            stream_id,
            flags: 0,
        })
        .await
    }

    pub async fn window_update(
        &mut self,
        increment_size: u32,
        stream_id: u32,
    ) -> Result<(), DeviceError> {
        self.write_frame(frame::WindowUpdateFrame {
            increment_size,
            stream_id,
        })
        .await
    }

    pub async fn open_stream(&mut self, stream_id: u32) -> Result<(), DeviceError> {
        self.cache.entry(stream_id).or_default();
        self.write_frame(frame::HeadersFrame { stream_id }).await
    }

    pub async fn send(&mut self, payload: Vec<u8>, stream_id: u32) -> Result<(), DeviceError> {
        self.write_frame(frame::DataFrame { stream_id, payload })
            .await
    }

    /// Returns the next DATA payload for `stream_id`
    ///
    /// Payloads for other streams are queued for later reads. Peer SETTINGS
    /// and PINGs are acknowledged along the way.
    pub async fn read(&mut self, stream_id: u32) -> Result<Vec<u8>, DeviceError> {
        if let Some(d) = self
            .cache
            .get_mut(&stream_id)
            .and_then(|c| c.pop_front())
        {
            return Ok(d);
        }

        loop {
            match frame::Frame::next(&mut self.inner).await? {
                frame::Frame::Settings(settings) => {
                    if !settings.is_ack() {
                        debug!("Peer settings: {:?}", settings.settings);
                        self.write_frame(frame::SettingsFrame::ack()).await?;
                    }
                }
                frame::Frame::Ping(ping) => {
                    if ping.flags & 0x1 == 0 {
                        self.write_frame(frame::PingFrame {
                            flags: 0x1,
                            payload: ping.payload,
                        })
                        .await?;
                    }
                }
                frame::Frame::Data(data) => {
                    debug!(
                        "Got data frame for {} with {} bytes",
                        data.stream_id,
                        data.payload.len()
                    );

                    // device initiated streams need their window refilled
                    if data.stream_id % 2 == 0 && !data.payload.is_empty() {
                        let len = data.payload.len() as u32;
                        self.window_update(len, 0).await?;
                        self.window_update(len, data.stream_id).await?;
                    }
                    if data.stream_id == stream_id {
                        return Ok(data.payload);
                    }
                    if !self.cache.contains_key(&data.stream_id) {
                        // devices sometimes send before the stream is opened
                        warn!("Received data for unopened stream {}", data.stream_id);
                    }
                    self.cache
                        .entry(data.stream_id)
                        .or_default()
                        .push_back(data.payload);
                }
                _ => {}
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
