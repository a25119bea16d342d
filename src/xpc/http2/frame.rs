//! The subset of HTTP/2 framing RemoteXPC uses

use tokio::io::AsyncReadExt;
use tracing::{trace, warn};

use crate::{DeviceError, ReadWrite};

const FRAME_HEADER_LEN: usize = 9;

const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const PRIORITY: u8 = 0x2;
const RST_STREAM: u8 = 0x3;
const SETTINGS: u8 = 0x4;
const PING: u8 = 0x6;
const GOAWAY: u8 = 0x7;
const WINDOW_UPDATE: u8 = 0x8;

const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

pub trait HttpFrame {
    fn serialize(&self) -> Vec<u8>;
}

fn frame_bytes(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u32).to_be_bytes();
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&len[1..]);
    out.push(frame_type);
    out.push(flags);
    out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
    EnableConnectProtocol(bool),
}

impl Setting {
    fn id_value(&self) -> (u16, u32) {
        match *self {
            Setting::HeaderTableSize(v) => (0x1, v),
            Setting::EnablePush(v) => (0x2, v as u32),
            Setting::MaxConcurrentStreams(v) => (0x3, v),
            Setting::InitialWindowSize(v) => (0x4, v),
            Setting::MaxFrameSize(v) => (0x5, v),
            Setting::MaxHeaderListSize(v) => (0x6, v),
            Setting::EnableConnectProtocol(v) => (0x8, v as u32),
        }
    }

    fn parse(id: u16, value: u32) -> Result<Self, DeviceError> {
        Ok(match id {
            0x1 => Setting::HeaderTableSize(value),
            0x2 => Setting::EnablePush(value != 0),
            0x3 => Setting::MaxConcurrentStreams(value),
            0x4 => Setting::InitialWindowSize(value),
            0x5 => Setting::MaxFrameSize(value),
            0x6 => Setting::MaxHeaderListSize(value),
            0x8 => Setting::EnableConnectProtocol(value != 0),
            _ => return Err(DeviceError::UnknownHttpSetting(id)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub settings: Vec<Setting>,
    pub stream_id: u32,
    pub flags: u8,
}

impl SettingsFrame {
    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            stream_id: 0,
            flags: FLAG_ACK,
        }
    }
}

impl HttpFrame for SettingsFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.settings.len() * 6);
        for setting in &self.settings {
            let (id, value) = setting.id_value();
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        frame_bytes(SETTINGS, self.flags, self.stream_id, &payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub increment_size: u32,
    pub stream_id: u32,
}

impl HttpFrame for WindowUpdateFrame {
    fn serialize(&self) -> Vec<u8> {
        frame_bytes(
            WINDOW_UPDATE,
            0,
            self.stream_id,
            &(self.increment_size & 0x7fff_ffff).to_be_bytes(),
        )
    }
}

/// Opens a stream. RemoteXPC sends no header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: u32,
}

impl HttpFrame for HeadersFrame {
    fn serialize(&self) -> Vec<u8> {
        frame_bytes(HEADERS, FLAG_END_HEADERS, self.stream_id, &[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl HttpFrame for DataFrame {
    fn serialize(&self) -> Vec<u8> {
        frame_bytes(DATA, 0, self.stream_id, &self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFrame {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl HttpFrame for PingFrame {
    fn serialize(&self) -> Vec<u8> {
        frame_bytes(PING, self.flags, 0, &self.payload)
    }
}

/// Frames the client has to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Settings(SettingsFrame),
    Data(DataFrame),
    Headers(HeadersFrame),
    WindowUpdate(WindowUpdateFrame),
    Ping(PingFrame),
    Priority,
}

impl Frame {
    /// Reads exactly one frame
    ///
    /// # Errors
    /// RST_STREAM and GOAWAY are surfaced as errors.
    pub async fn next(socket: &mut impl ReadWrite) -> Result<Self, DeviceError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        socket.read_exact(&mut header).await?;
        let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        let frame_type = header[3];
        let flags = header[4];
        let stream_id =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;

        let mut payload = vec![0u8; len];
        socket.read_exact(&mut payload).await?;
        trace!("HTTP/2 frame type {frame_type} on stream {stream_id}, {len} bytes");

        Ok(match frame_type {
            DATA => Frame::Data(DataFrame { stream_id, payload }),
            HEADERS => Frame::Headers(HeadersFrame { stream_id }),
            PRIORITY => Frame::Priority,
            RST_STREAM => {
                warn!("Stream {stream_id} was reset");
                return Err(DeviceError::HttpStreamReset);
            }
            SETTINGS => {
                let mut settings = Vec::with_capacity(payload.len() / 6);
                for chunk in payload.chunks_exact(6) {
                    let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                    let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                    match Setting::parse(id, value) {
                        Ok(s) => settings.push(s),
                        // unknown settings must be ignored
                        Err(e) => warn!("{e}"),
                    }
                }
                Frame::Settings(SettingsFrame {
                    settings,
                    stream_id,
                    flags,
                })
            }
            PING => Frame::Ping(PingFrame { flags, payload }),
            GOAWAY => {
                let debug_data = payload.get(8..).unwrap_or_default();
                let msg = String::from_utf8_lossy(debug_data).to_string();
                warn!("Peer sent GOAWAY: {msg}");
                return Err(DeviceError::HttpGoAway(msg));
            }
            WINDOW_UPDATE => {
                let increment = match payload.get(..4) {
                    Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]) & 0x7fff_ffff,
                    None => return Err(DeviceError::NotEnoughBytes(payload.len(), 4)),
                };
                Frame::WindowUpdate(WindowUpdateFrame {
                    increment_size: increment,
                    stream_id,
                })
            }
            other => return Err(DeviceError::UnknownFrame(other)),
        })
    }
}
