use std::io::SeekFrom;

use tracing::warn;

use crate::DeviceError;

use super::opcode::AfcOpcode;

/// Largest read or write sent in one packet
pub const MAX_TRANSFER: u64 = 64 * 1024;

/// An open file on the device
///
/// Call [`Self::close`] when done. A dropped handle leaves the descriptor
/// open until [`super::AfcClient::close`].
#[derive(Debug)]
pub struct FileDescriptor<'a> {
    client: &'a mut super::AfcClient,
    fd: u64,
    path: String,
    closed: bool,
}

impl<'a> FileDescriptor<'a> {
    pub(crate) fn new(client: &'a mut super::AfcClient, fd: u64, path: String) -> Self {
        Self {
            client,
            fd,
            path,
            closed: false,
        }
    }

    pub fn fd(&self) -> u64 {
        self.fd
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads at most `max_len` bytes; fewer (or none) at the end of the file
    pub async fn read(&mut self, max_len: usize) -> Result<Vec<u8>, DeviceError> {
        let len = (max_len as u64).min(MAX_TRANSFER);
        let mut header_payload = self.fd.to_le_bytes().to_vec();
        header_payload.extend_from_slice(&len.to_le_bytes());
        let res = self
            .client
            .request(AfcOpcode::Read, header_payload, Vec::new())
            .await?;
        Ok(res.payload)
    }

    /// Reads from the current position to the end of the file
    pub async fn read_entire(&mut self) -> Result<Vec<u8>, DeviceError> {
        let mut collected = Vec::new();
        loop {
            let chunk = self.read(MAX_TRANSFER as usize).await?;
            if chunk.is_empty() {
                return Ok(collected);
            }
            collected.extend_from_slice(&chunk);
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        for chunk in bytes.chunks(MAX_TRANSFER as usize) {
            self.client
                .request(AfcOpcode::Write, self.fd.to_le_bytes().to_vec(), chunk.to_vec())
                .await?;
        }
        Ok(())
    }

    /// Moves the cursor and returns the new position
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, DeviceError> {
        let (whence, offset) = match pos {
            SeekFrom::Start(off) => {
                let off = i64::try_from(off).map_err(|_| DeviceError::InvalidArgument)?;
                (0u64, off)
            }
            SeekFrom::Current(off) => (1, off),
            SeekFrom::End(off) => (2, off),
        };

        let mut header_payload = self.fd.to_le_bytes().to_vec();
        header_payload.extend_from_slice(&whence.to_le_bytes());
        header_payload.extend_from_slice(&offset.to_le_bytes());
        self.client
            .request(AfcOpcode::FileSeek, header_payload, Vec::new())
            .await?;

        self.tell().await
    }

    /// Current cursor position
    pub async fn tell(&mut self) -> Result<u64, DeviceError> {
        let res = self
            .client
            .request(AfcOpcode::FileTell, self.fd.to_le_bytes().to_vec(), Vec::new())
            .await?;
        res.header_u64()
    }

    pub async fn close(mut self) -> Result<(), DeviceError> {
        self.closed = true;
        self.client.close_fd(self.fd).await
    }
}

impl Drop for FileDescriptor<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "AFC descriptor {} ({}) dropped without close",
                self.fd, self.path
            );
        }
    }
}
