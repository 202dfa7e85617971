/*
    transport.rs - Moving encoded frames between client and service

    A transport carries one encoded request and returns the encoded
    response. Two implementations:
    - ChannelTransport: in-process, mpsc + oneshot into a CatalogService
    - TcpTransport: length-prefixed frames over a TCP stream

    TCP framing is a 4-byte big-endian length prefix followed by the frame
    bytes. Frames above the configured maximum are rejected before the body
    is read.
*/

use super::service::CatalogService;
use crate::datastore::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// Default maximum frame size (4 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[async_trait]
pub trait CatalogTransport: Send + Sync {
    /// Send one encoded request and wait for its encoded response
    async fn round_trip(&self, frame: Vec<u8>) -> StoreResult<Vec<u8>>;
}

type Envelope = (Vec<u8>, oneshot::Sender<Vec<u8>>);

/// In-process transport feeding a shared CatalogService
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelTransport {
    /// Spawn the dispatch task; requests are served concurrently
    pub fn spawn(service: Arc<CatalogService>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(256);
        tokio::spawn(async move {
            while let Some((frame, reply_tx)) = rx.recv().await {
                let service = service.clone();
                tokio::spawn(async move {
                    let response = service.handle_frame(&frame).await;
                    // Caller may have been cancelled
                    let _ = reply_tx.send(response);
                });
            }
            debug!("Channel transport closed");
        });
        ChannelTransport { tx }
    }
}

#[async_trait]
impl CatalogTransport for ChannelTransport {
    async fn round_trip(&self, frame: Vec<u8>) -> StoreResult<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((frame, reply_tx))
            .await
            .map_err(|_| StoreError::Transport("catalog service is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| StoreError::Transport("catalog service dropped the request".to_string()))
    }
}

/// TCP transport with one lazily (re)established connection
///
/// The stream is taken out of the slot for the duration of a call and only
/// put back after a complete exchange, so a failed or cancelled call never
/// leaves a half-read stream behind.
pub struct TcpTransport {
    addr: String,
    max_frame_size: usize,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpTransport {
            addr: addr.into(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stream: Mutex::new(None),
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Connect eagerly so configuration errors surface early
    pub async fn connect(addr: impl Into<String>) -> StoreResult<Self> {
        let transport = Self::new(addr);
        let stream = transport.dial().await?;
        *transport.stream.lock().await = Some(stream);
        Ok(transport)
    }

    async fn dial(&self) -> StoreResult<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            StoreError::Transport(format!("Failed to connect to {}: {}", self.addr, e))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| StoreError::Transport(format!("Failed to configure socket: {}", e)))?;
        Ok(stream)
    }
}

#[async_trait]
impl CatalogTransport for TcpTransport {
    async fn round_trip(&self, frame: Vec<u8>) -> StoreResult<Vec<u8>> {
        let mut slot = self.stream.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.dial().await?,
        };

        write_frame(&mut stream, &frame, self.max_frame_size).await?;
        let response = match read_frame(&mut stream, self.max_frame_size).await? {
            Some(response) => response,
            None => {
                warn!(addr = %self.addr, "Catalog closed the connection mid-request");
                return Err(StoreError::Transport(
                    "connection closed before response".to_string(),
                ));
            }
        };

        *slot = Some(stream);
        Ok(response)
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8], max_frame_size: usize) -> StoreResult<()>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > max_frame_size {
        return Err(StoreError::Transport(format!(
            "Frame too large: {} bytes (max {})",
            bytes.len(),
            max_frame_size
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| StoreError::Transport(format!("Failed to write length: {}", e)))?;
    writer
        .write_all(bytes)
        .await
        .map_err(|e| StoreError::Transport(format!("Failed to write data: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| StoreError::Transport(format!("Failed to flush: {}", e)))?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean EOF before the prefix
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> StoreResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(StoreError::Transport(format!("Failed to read length: {}", e))),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(StoreError::Transport(format!(
            "Frame too large: {} bytes (max {})",
            len, max_frame_size
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| StoreError::Transport(format!("Failed to read data: {}", e)))?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello", 64).await.unwrap();
        let frame = read_frame(&mut b, 64).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[0u8; 100], 1024).await.unwrap();
        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut a, _b) = tokio::io::duplex(1024);
        assert!(write_frame(&mut a, &[0u8; 100], 64).await.is_err());
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tcp_transport_reports_refused_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(addr.to_string());
        let err = transport.round_trip(b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }
}
