//! RemoteXPC: XPC messages carried over HTTP/2
//!
//! The root stream (1) carries requests and the directory, the reply stream
//! (3) is opened during the handshake and used by the device for replies.

use tracing::{debug, trace};

use crate::{DeviceError, ReadWrite};

mod format;
pub mod http2;

pub use format::{Dictionary, XpcFlags, XpcMessage, XpcObject};

const ROOT_CHANNEL: u32 = 1;
const REPLY_CHANNEL: u32 = 3;

/// A RemoteXPC client over one transport
#[derive(Debug)]
pub struct RemoteXpcClient<R: ReadWrite> {
    h2_client: http2::Http2Client<R>,
    root_id: u64,
    reply_id: u64,
    pending: Vec<u8>,
}

impl<R: ReadWrite> RemoteXpcClient<R> {
    pub const MAX_CONCURRENT_STREAMS: u32 = 100;
    pub const INITIAL_WINDOW_SIZE: u32 = 1048576;
    pub const WINDOW_INCREMENT: u32 = 983041;

    /// Sends the HTTP/2 preface. Call [`Self::do_handshake`] before anything else.
    pub async fn new(socket: R) -> Result<Self, DeviceError> {
        Ok(Self {
            h2_client: http2::Http2Client::new(socket).await?,
            root_id: 1,
            reply_id: 1,
            pending: Vec::new(),
        })
    }

    /// Configures the HTTP/2 connection and opens both XPC streams
    pub async fn do_handshake(&mut self) -> Result<(), DeviceError> {
        self.h2_client
            .set_settings(
                vec![
                    http2::Setting::MaxConcurrentStreams(Self::MAX_CONCURRENT_STREAMS),
                    http2::Setting::InitialWindowSize(Self::INITIAL_WINDOW_SIZE),
                ],
                0,
            )
            .await?;
        self.h2_client
            .window_update(Self::WINDOW_INCREMENT, 0)
            .await?;
        self.h2_client.open_stream(ROOT_CHANNEL).await?;

        self.send_root(XpcMessage::new(
            XpcFlags::ALWAYS_SET,
            Some(XpcObject::Dictionary(Dictionary::new())),
            self.root_id,
        ))
        .await?;

        self.send_root(XpcMessage::new(XpcFlags(0x201), None, self.root_id))
            .await?;

        self.h2_client.open_stream(REPLY_CHANNEL).await?;
        self.send_reply(XpcMessage::new(
            XpcFlags::INIT_HANDSHAKE | XpcFlags::ALWAYS_SET,
            None,
            self.reply_id,
        ))
        .await?;

        debug!("RemoteXPC handshake sent");
        Ok(())
    }

    async fn send_root(&mut self, msg: XpcMessage) -> Result<(), DeviceError> {
        trace!("Sending on root: {msg:?}");
        self.h2_client.send(msg.encode(), ROOT_CHANNEL).await?;
        self.root_id += 1;
        Ok(())
    }

    async fn send_reply(&mut self, msg: XpcMessage) -> Result<(), DeviceError> {
        trace!("Sending on reply: {msg:?}");
        self.h2_client.send(msg.encode(), REPLY_CHANNEL).await?;
        self.reply_id += 1;
        Ok(())
    }

    /// Sends an object on the root stream
    pub async fn send_object(
        &mut self,
        message: impl Into<XpcObject>,
        expect_reply: bool,
    ) -> Result<(), DeviceError> {
        let mut flags = XpcFlags::ALWAYS_SET;
        if expect_reply {
            flags |= XpcFlags::WANTING_REPLY;
        }
        let msg = XpcMessage::new(flags | XpcFlags::DATA, Some(message.into()), self.root_id);
        self.send_root(msg).await
    }

    /// Receives the next root message that carries a body
    ///
    /// A message can span several DATA frames; bodiless messages (handshake
    /// acknowledgements) are skipped.
    pub async fn recv_root(&mut self) -> Result<XpcObject, DeviceError> {
        loop {
            let complete = XpcMessage::frame_len(&self.pending)
                .filter(|len| self.pending.len() >= *len);
            let len = match complete {
                Some(len) => len,
                None => {
                    let chunk = self.h2_client.read(ROOT_CHANNEL).await?;
                    self.pending.extend_from_slice(&chunk);
                    continue;
                }
            };

            let msg = XpcMessage::decode(&self.pending[..len])?;
            self.pending.drain(..len);
            match msg.message {
                Some(obj) => return Ok(obj),
                None => trace!("Skipping bodiless message {:?}", msg.flags),
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.h2_client.into_inner()
    }
}
