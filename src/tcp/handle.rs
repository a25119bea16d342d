//! Actor wrapper around [`Adapter`]
//!
//! One spawned task owns the adapter. [`AdapterHandle`] and every
//! [`StreamHandle`] talk to it over channels, so streams can live in
//! different tasks and outlive the borrow of any single owner.

use std::{collections::HashMap, io, path::PathBuf, sync::Mutex, task::Poll};

use crossfire::{AsyncRx, MTx, Tx, mpsc, spsc, stream::AsyncStream};
use futures::{StreamExt, stream::FuturesUnordered};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::oneshot,
    time::timeout,
};
use tracing::{debug, trace, warn};

use super::adapter::{Adapter, ConnectionStatus};

/// Received chunks for one stream; an empty chunk marks end of stream
type Inbound = Result<Vec<u8>, io::Error>;

type ConnectToPortRes = oneshot::Sender<Result<(u16, AsyncRx<Inbound>), io::Error>>;

enum HandleMessage {
    ConnectToPort {
        target: u16,
        res: ConnectToPortRes,
    },
    Close {
        host_port: u16,
    },
    Send {
        host_port: u16,
        data: Vec<u8>,
        res: oneshot::Sender<Result<(), io::Error>>,
    },
    Pcap {
        path: PathBuf,
        res: oneshot::Sender<Result<(), io::Error>>,
    },
    Shutdown {
        res: oneshot::Sender<()>,
    },
}

fn adapter_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "adapter closed")
}

/// Pushes received bytes and terminal states out to the streams
async fn dispatch(adapter: &mut Adapter, handles: &mut HashMap<u16, Tx<Inbound>>) {
    let mut finished = Vec::new();
    for (&hp, tx) in handles.iter() {
        match adapter.uncache_all(hp) {
            Ok(buf) if !buf.is_empty() => {
                if tx.send(Ok(buf)).is_err() {
                    finished.push(hp);
                    continue;
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(e));
                finished.push(hp);
                continue;
            }
        }

        if let Ok(ConnectionStatus::Error(kind)) = adapter.get_status(hp) {
            let _ = match kind {
                io::ErrorKind::UnexpectedEof => tx.send(Ok(Vec::new())),
                kind => tx.send(Err(kind.into())),
            };
            finished.push(hp);
        }
    }
    for hp in finished {
        handles.remove(&hp);
        let _ = adapter.close(hp).await;
    }
}

#[derive(Debug)]
pub struct AdapterHandle {
    sender: MTx<HandleMessage>,
}

impl AdapterHandle {
    /// Outlasts the adapter's own handshake timeout so its answer is not lost
    pub const CONNECT_TIMEOUT: std::time::Duration =
        std::time::Duration::from_secs(Adapter::CONNECT_TIMEOUT.as_secs() + 2);

    /// Moves `adapter` into a new task. Must be called within a tokio runtime.
    pub fn new(mut adapter: Adapter) -> Self {
        let (tx, rx) = mpsc::unbounded_async();
        tokio::spawn(async move {
            let mut handles: HashMap<u16, Tx<Inbound>> = HashMap::new();
            let mut shutdown_ack = None;

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let msg = match msg {
                            Ok(m) => m,
                            // every handle is gone
                            Err(_) => break,
                        };
                        match msg {
                            HandleMessage::ConnectToPort { target, res } => {
                                let connect_response = match adapter.connect(target).await {
                                    Ok(c) => {
                                        let (ptx, prx) = spsc::unbounded_async();
                                        handles.insert(c, ptx);
                                        Ok((c, prx))
                                    }
                                    Err(e) => Err(e),
                                };
                                if let Err(Ok((c, _))) = res.send(connect_response) {
                                    debug!("Connect caller went away, closing host port {c}");
                                    handles.remove(&c);
                                    adapter.close(c).await.ok();
                                }
                            }
                            HandleMessage::Close { host_port } => {
                                if handles.remove(&host_port).is_some() {
                                    adapter.close(host_port).await.ok();
                                }
                            }
                            HandleMessage::Send { host_port, data, res } => {
                                let response = match adapter.queue_send(&data, host_port) {
                                    Ok(()) => adapter.write_buffer_flush().await,
                                    Err(e) => Err(e),
                                };
                                res.send(response).ok();
                            }
                            HandleMessage::Pcap { path, res } => {
                                res.send(adapter.pcap(path).await).ok();
                            }
                            HandleMessage::Shutdown { res } => {
                                shutdown_ack = Some(res);
                                break;
                            }
                        }
                        dispatch(&mut adapter, &mut handles).await;
                    }

                    r = adapter.fill_read_buffer() => {
                        let r = match r {
                            Ok(()) => adapter.handle_buffered_packets().await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = r {
                            warn!("Tunnel failed: {e}");
                            for (_, tx) in handles.drain() {
                                let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string())));
                            }
                            break;
                        }
                        dispatch(&mut adapter, &mut handles).await;
                    }
                }
            }

            for hp in adapter.host_ports() {
                adapter.close(hp).await.ok();
            }
            // dropping the senders fails every live stream
            handles.clear();
            if let Err(e) = adapter.shutdown().await {
                debug!("Tunnel shutdown: {e}");
            }
            debug!("Adapter task finished");
            if let Some(res) = shutdown_ack {
                res.send(()).ok();
            }
        });

        Self { sender: tx }
    }

    /// Opens a stream to `port` on the device
    pub async fn connect(&mut self, port: u16) -> Result<StreamHandle, io::Error> {
        let (res_tx, res_rx) = oneshot::channel();
        self.sender
            .send(HandleMessage::ConnectToPort {
                target: port,
                res: res_tx,
            })
            .map_err(|_| adapter_closed())?;

        match timeout(Self::CONNECT_TIMEOUT, res_rx).await {
            Ok(Ok(r)) => {
                let (host_port, recv_channel) = r?;
                Ok(StreamHandle {
                    host_port,
                    recv_channel: Mutex::new(recv_channel.into_stream()),
                    send_channel: self.sender.clone(),
                    read_buffer: Vec::new(),
                    pending_writes: FuturesUnordered::new(),
                    eof: false,
                })
            }
            Ok(Err(_)) => Err(adapter_closed()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }

    /// Starts capturing tunnel traffic to a pcap file
    pub async fn pcap(&mut self, path: impl Into<PathBuf>) -> Result<(), io::Error> {
        let (res_tx, res_rx) = oneshot::channel();
        self.sender
            .send(HandleMessage::Pcap {
                path: path.into(),
                res: res_tx,
            })
            .map_err(|_| adapter_closed())?;
        res_rx.await.map_err(|_| adapter_closed())?
    }

    /// Stops the adapter task and shuts the tunnel down
    ///
    /// Every stream still alive fails with `BrokenPipe` afterwards.
    pub async fn close(self) -> Result<(), io::Error> {
        let (res_tx, res_rx) = oneshot::channel();
        self.sender
            .send(HandleMessage::Shutdown { res: res_tx })
            .map_err(|_| adapter_closed())?;
        res_rx.await.map_err(|_| adapter_closed())
    }
}

/// One TCP connection through an [`AdapterHandle`]
///
/// There is no half close. Once the peer sends FIN, reads return end of
/// stream, our FIN goes out and later writes fail with `NotConnected`.
#[derive(Debug)]
pub struct StreamHandle {
    host_port: u16,
    // only locked from poll_read; exists to make the stream Sync
    recv_channel: Mutex<AsyncStream<Inbound>>,
    send_channel: MTx<HandleMessage>,

    read_buffer: Vec<u8>,
    pending_writes: FuturesUnordered<oneshot::Receiver<Result<(), io::Error>>>,
    eof: bool,
}

impl StreamHandle {
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Sends `data` and waits until it is on the tunnel
    pub async fn send(&mut self, data: &[u8]) -> Result<(), io::Error> {
        self.write_all(data).await?;
        self.flush().await
    }

    /// Receives up to `max_len` bytes; an empty result means the peer closed
    pub async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, io::Error> {
        let mut buf = vec![0u8; max_len];
        let n = self.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn close(&mut self) {
        let _ = self.send_channel.send(HandleMessage::Close {
            host_port: self.host_port,
        });
    }
}

impl AsyncRead for StreamHandle {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            let n = buf.remaining().min(self.read_buffer.len());
            buf.put_slice(&self.read_buffer[..n]);
            self.read_buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }
        if self.eof {
            return Poll::Ready(Ok(()));
        }

        let polled = match self.recv_channel.lock() {
            Ok(mut stream) => stream.poll_item(cx),
            Err(_) => {
                return Poll::Ready(Err(io::Error::other("stream receiver poisoned")));
            }
        };
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(Err(adapter_closed())),
            Poll::Ready(Some(Ok(data))) => {
                if data.is_empty() {
                    trace!("Host port {} reached end of stream", self.host_port);
                    self.eof = true;
                    return Poll::Ready(Ok(()));
                }
                let n = buf.remaining().min(data.len());
                buf.put_slice(&data[..n]);
                self.read_buffer.extend_from_slice(&data[n..]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for StreamHandle {
    /// Hands `buf` to the adapter task; completion is observed by flushing
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        trace!("Queueing {} bytes on {}", buf.len(), self.host_port);
        let (tx, rx) = oneshot::channel();
        self.send_channel
            .send(HandleMessage::Send {
                host_port: self.host_port,
                data: buf.to_vec(),
                res: tx,
            })
            .map_err(|_| adapter_closed())?;
        self.pending_writes.push(rx);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        while let Poll::Ready(next) = self.pending_writes.poll_next_unpin(cx) {
            match next {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => return Poll::Ready(Err(e)),
                Some(Err(_)) => return Poll::Ready(Err(adapter_closed())),
                None => break,
            }
        }
        if self.pending_writes.is_empty() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}
