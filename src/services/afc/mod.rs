//! Apple File Conduit
//!
//! File system access to the media partition (or, through house arrest, an
//! app container). Every request is one AFC packet and gets exactly one reply.
//!
//! Open files are tracked by the client. A [`FileDescriptor`] borrows the
//! client mutably, so the client cannot be used or closed while a handle is
//! alive. A handle dropped without [`FileDescriptor::close`] stays open on the
//! device until [`AfcClient::close`] closes it.

use std::collections::{HashMap, HashSet};

use errors::AfcError;
use file::FileDescriptor;
use opcode::{AfcFopenMode, AfcOpcode, LinkType};
use packet::AfcPacket;
use tracing::{debug, error, warn};

use crate::{DeviceConnection, DeviceError, DeviceService};

pub mod errors;
pub mod file;
pub mod opcode;
pub mod packet;

/// "CFA6LPAA" read as a little endian u64
pub const MAGIC: u64 = 0x4141504c36414643;

#[derive(Debug)]
pub struct AfcClient {
    pub connection: DeviceConnection,
    package_number: u64,
    open_files: HashSet<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub size: usize,
    pub blocks: usize,
    pub creation: chrono::NaiveDateTime,
    pub modified: chrono::NaiveDateTime,
    pub st_nlink: String,
    /// `S_IFREG`, `S_IFDIR`, `S_IFLNK`...
    pub st_ifmt: String,
    pub st_link_target: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub block_size: usize,
}

impl DeviceService for AfcClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("com.apple.afc")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

#[cfg(feature = "rsd")]
impl crate::RsdService for AfcClient {
    fn rsd_service_name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("com.apple.afc.shim.remote")
    }

    async fn from_stream(stream: Box<dyn crate::ReadWrite>) -> Result<Self, DeviceError> {
        let mut connection = DeviceConnection::new(stream, "devicelink-afc");
        connection.checkin().await?;
        Ok(Self::new(connection))
    }
}

/// Splits a NUL separated payload into its non empty strings
fn nul_strings(payload: &[u8]) -> Vec<String> {
    payload
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Key/value pairs from a NUL separated payload
fn nul_pairs(payload: &[u8]) -> HashMap<String, String> {
    nul_strings(payload)
        .chunks_exact(2)
        .map(|kv| (kv[0].clone(), kv[1].clone()))
        .collect()
}

fn take_parsed<T: std::str::FromStr>(
    kvs: &mut HashMap<String, String>,
    key: &str,
) -> Result<T, DeviceError> {
    kvs.remove(key)
        .and_then(|x| x.parse::<T>().ok())
        .ok_or_else(|| {
            warn!("AFC reply is missing {key}");
            DeviceError::AfcMissingAttribute
        })
}

fn nul_terminated(parts: &[&str]) -> Vec<u8> {
    let mut res = Vec::new();
    for p in parts {
        res.extend_from_slice(p.as_bytes());
        res.push(0);
    }
    res
}

impl AfcClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            package_number: 0,
            open_files: HashSet::new(),
        }
    }

    /// Number of descriptors opened through this client and not closed yet
    pub fn open_file_count(&self) -> usize {
        self.open_files.len()
    }

    /// Sends one request and reads its reply, mapping Status errors
    pub(crate) async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, DeviceError> {
        let packet = AfcPacket::new(operation, self.package_number, header_payload, payload);
        self.package_number += 1;
        self.send(packet).await?;
        self.read().await
    }

    /// Lists a directory without the `.` and `..` entries
    pub async fn list_dir(&mut self, path: impl AsRef<str>) -> Result<Vec<String>, DeviceError> {
        let res = self
            .request(AfcOpcode::ReadDir, path.as_ref().as_bytes().to_vec(), Vec::new())
            .await?;
        Ok(nul_strings(&res.payload)
            .into_iter()
            .filter(|s| s != "." && s != "..")
            .collect())
    }

    pub async fn mk_dir(&mut self, path: impl AsRef<str>) -> Result<(), DeviceError> {
        self.request(AfcOpcode::MakeDir, path.as_ref().as_bytes().to_vec(), Vec::new())
            .await?;
        Ok(())
    }

    pub async fn get_file_info(&mut self, path: impl AsRef<str>) -> Result<FileInfo, DeviceError> {
        let res = self
            .request(
                AfcOpcode::GetFileInfo,
                path.as_ref().as_bytes().to_vec(),
                Vec::new(),
            )
            .await?;
        let mut kvs = nul_pairs(&res.payload);

        let size = take_parsed(&mut kvs, "st_size")?;
        let blocks = take_parsed(&mut kvs, "st_blocks")?;
        // timestamps are nanoseconds since the epoch
        let creation = chrono::DateTime::from_timestamp_nanos(take_parsed(&mut kvs, "st_birthtime")?)
            .naive_utc();
        let modified =
            chrono::DateTime::from_timestamp_nanos(take_parsed(&mut kvs, "st_mtime")?).naive_utc();
        let st_nlink = take_parsed(&mut kvs, "st_nlink")?;
        let st_ifmt = take_parsed(&mut kvs, "st_ifmt")?;
        let st_link_target = kvs.remove("st_link_target");

        if !kvs.is_empty() {
            debug!("Unused file info keys: {kvs:?}");
        }

        Ok(FileInfo {
            size,
            blocks,
            creation,
            modified,
            st_nlink,
            st_ifmt,
            st_link_target,
        })
    }

    pub async fn get_device_info(&mut self) -> Result<DeviceInfo, DeviceError> {
        let res = self
            .request(AfcOpcode::GetDevInfo, Vec::new(), Vec::new())
            .await?;
        let mut kvs = nul_pairs(&res.payload);

        let info = DeviceInfo {
            model: take_parsed(&mut kvs, "Model")?,
            total_bytes: take_parsed(&mut kvs, "FSTotalBytes")?,
            free_bytes: take_parsed(&mut kvs, "FSFreeBytes")?,
            block_size: take_parsed(&mut kvs, "FSBlockSize")?,
        };
        if !kvs.is_empty() {
            debug!("Unused device info keys: {kvs:?}");
        }
        Ok(info)
    }

    /// Removes a file or an empty directory
    pub async fn remove(&mut self, path: impl AsRef<str>) -> Result<(), DeviceError> {
        self.request(
            AfcOpcode::RemovePath,
            path.as_ref().as_bytes().to_vec(),
            Vec::new(),
        )
        .await?;
        Ok(())
    }

    /// Removes a path and everything below it
    pub async fn remove_all(&mut self, path: impl AsRef<str>) -> Result<(), DeviceError> {
        self.request(
            AfcOpcode::RemovePathAndContents,
            path.as_ref().as_bytes().to_vec(),
            Vec::new(),
        )
        .await?;
        Ok(())
    }

    /// Opens a file. The descriptor stays registered until it is closed.
    pub async fn open(
        &mut self,
        path: impl Into<String>,
        mode: AfcFopenMode,
    ) -> Result<FileDescriptor<'_>, DeviceError> {
        let path = path.into();
        let mut header_payload = (mode as u64).to_le_bytes().to_vec();
        header_payload.extend_from_slice(path.as_bytes());
        header_payload.push(0);

        let res = self
            .request(AfcOpcode::FileOpen, header_payload, Vec::new())
            .await?;
        let fd = res.header_u64()?;
        debug!("Opened {path} as fd {fd}");
        self.open_files.insert(fd);
        Ok(FileDescriptor::new(self, fd, path))
    }

    /// Creates a link at `source` pointing to `target`
    pub async fn link(
        &mut self,
        target: impl AsRef<str>,
        source: impl AsRef<str>,
        kind: LinkType,
    ) -> Result<(), DeviceError> {
        let mut header_payload = (kind as u64).to_le_bytes().to_vec();
        header_payload.extend(nul_terminated(&[target.as_ref(), source.as_ref()]));
        self.request(AfcOpcode::MakeLink, header_payload, Vec::new())
            .await?;
        Ok(())
    }

    pub async fn rename(
        &mut self,
        source: impl AsRef<str>,
        target: impl AsRef<str>,
    ) -> Result<(), DeviceError> {
        let header_payload = nul_terminated(&[source.as_ref(), target.as_ref()]);
        self.request(AfcOpcode::RenamePath, header_payload, Vec::new())
            .await?;
        Ok(())
    }

    pub(crate) async fn close_fd(&mut self, fd: u64) -> Result<(), DeviceError> {
        let res = self
            .request(AfcOpcode::FileClose, fd.to_le_bytes().to_vec(), Vec::new())
            .await;
        // the device forgets the descriptor even when it reports an error
        self.open_files.remove(&fd);
        res.map(|_| ())
    }

    /// Closes every descriptor still open and then the connection
    ///
    /// Returns how many descriptors had been left open. Each is logged, as a
    /// descriptor that outlives its handle is a bug in the caller.
    pub async fn close(mut self) -> Result<usize, DeviceError> {
        let leaked = self.open_files.iter().copied().collect::<Vec<_>>();
        for fd in &leaked {
            warn!("Closing AFC descriptor {fd} that was never closed");
            self.close_fd(*fd).await?;
        }
        self.connection.close().await?;
        Ok(leaked.len())
    }

    /// Reads a reply, turning a non success Status into an error
    pub async fn read(&mut self) -> Result<AfcPacket, DeviceError> {
        let res = AfcPacket::read(&mut self.connection).await?;
        if res.header.operation == AfcOpcode::Status {
            let code = match res.header_u64() {
                Ok(c) => c,
                Err(e) => {
                    error!("AFC returned a status without a code");
                    return Err(e);
                }
            };
            let e = AfcError::from(code);
            if e != AfcError::Success {
                debug!("AFC status {code}: {e}");
                return Err(DeviceError::Afc(e));
            }
        }
        Ok(res)
    }

    pub async fn send(&mut self, packet: AfcPacket) -> Result<(), DeviceError> {
        debug!("Sending afc {:?}", packet.header);
        self.connection.send_raw(&packet.serialize()).await
    }
}

impl Drop for AfcClient {
    fn drop(&mut self) {
        if !self.open_files.is_empty() {
            error!(
                "AFC client dropped with {} open descriptors: {:?}",
                self.open_files.len(),
                self.open_files
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_helpers() {
        assert_eq!(nul_strings(b".\0..\0a\0\0b\0"), vec![".", "..", "a", "b"]);
        let kvs = nul_pairs(b"Model\0iPhone\0FSBlockSize\04096\0");
        assert_eq!(kvs.get("FSBlockSize").map(String::as_str), Some("4096"));
        assert_eq!(nul_terminated(&["a", "bc"]), b"a\0bc\0".to_vec());
    }
}
