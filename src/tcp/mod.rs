//! Software TCP/IP over a CoreDeviceProxy tunnel

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

use crate::{DeviceError, ReadWrite, provider::RsdProvider};

pub mod adapter;
pub mod handle;
pub mod packets;

/// Appends one record to a libpcap capture
pub(crate) async fn log_packet(file: &Arc<tokio::sync::Mutex<tokio::fs::File>>, packet: &[u8]) {
    trace!("Logging {} byte packet", packet.len());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut record = Vec::with_capacity(16 + packet.len());
    record.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
    record.extend_from_slice(&now.subsec_micros().to_le_bytes());
    record.extend_from_slice(&(packet.len() as u32).to_le_bytes()); // captured
    record.extend_from_slice(&(packet.len() as u32).to_le_bytes()); // on the wire
    record.extend_from_slice(packet);

    let mut file = file.lock().await;
    let res = match file.write_all(&record).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = res {
        warn!("Failed to write pcap record: {e}");
    }
}

impl RsdProvider for handle::AdapterHandle {
    async fn connect_to_service_port(
        &mut self,
        port: u16,
    ) -> Result<Box<dyn ReadWrite>, DeviceError> {
        let s = self.connect(port).await?;
        Ok(Box::new(s))
    }
}
