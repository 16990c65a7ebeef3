//! TCP link to one reader.
//!
//! The inventory session only needs a narrow surface from the link, captured by
//! the [`Connection`] trait. [`TcpConnection`] is the real implementation: a
//! background task pumps received chunks into a channel until the socket dies.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 4096;
const CHANNEL_DEPTH: usize = 64;

/// Reader endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Link level failures
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Peer closed the socket or it was closed locally
    #[error("connection closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Orderly shutdown rather than a fault
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// What the inventory session needs from a reader link.
///
/// `packets` and `errors` hand over the receiving ends for the current link
/// once; both channels close when the link terminates.
#[async_trait]
pub trait Connection: Send {
    /// Open a link, tearing down any previous one first
    async fn connect(&mut self, endpoint: &Endpoint, timeout: Duration)
    -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;

    async fn send_raw(&mut self, data: &[u8], timeout: Duration) -> Result<(), ConnectionError>;

    async fn disconnect(&mut self) -> Result<(), ConnectionError>;

    fn packets(&mut self) -> Option<mpsc::Receiver<Bytes>>;

    fn errors(&mut self) -> Option<mpsc::Receiver<ConnectionError>>;
}

/// [`Connection`] over a plain TCP socket
#[derive(Default)]
pub struct TcpConnection {
    endpoint: Option<Endpoint>,
    writer: Option<OwnedWriteHalf>,
    reader_task: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
    packet_rx: Option<mpsc::Receiver<Bytes>>,
    error_rx: Option<mpsc::Receiver<ConnectionError>>,
}

impl TcpConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint of the current link, if any
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    fn teardown(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        self.packet_rx = None;
        self.error_rx = None;
        self.endpoint = None;
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        if self.writer.is_some() {
            debug!("replacing link to {:?}", self.endpoint);
            self.teardown();
        }

        let address = endpoint.address();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout(timeout)),
        };
        stream.set_nodelay(true)?;
        info!("connected to {}", address);

        let (reader, writer) = stream.into_split();
        let (packet_tx, packet_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (error_tx, error_rx) = mpsc::channel(4);
        let alive = Arc::new(AtomicBool::new(true));

        self.reader_task = Some(tokio::spawn(read_loop(
            reader,
            packet_tx,
            error_tx,
            Arc::clone(&alive),
        )));
        self.alive = alive;
        self.writer = Some(writer);
        self.packet_rx = Some(packet_rx);
        self.error_rx = Some(error_rx);
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some() && self.alive.load(Ordering::SeqCst)
    }

    async fn send_raw(&mut self, data: &[u8], timeout: Duration) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(ConnectionError::NotConnected)?;
        debug!("tx {:02X?}", data);
        match tokio::time::timeout(timeout, writer.write_all(data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        let Some(mut writer) = self.writer.take() else {
            self.teardown();
            return Ok(());
        };
        let result = writer.shutdown().await;
        if let Some(endpoint) = &self.endpoint {
            info!("disconnected from {}", endpoint);
        }
        self.teardown();
        match result.map_err(ConnectionError::from) {
            Err(e) if !e.is_closed() => Err(e),
            _ => Ok(()),
        }
    }

    fn packets(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.packet_rx.take()
    }

    fn errors(&mut self) -> Option<mpsc::Receiver<ConnectionError>> {
        self.error_rx.take()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Forward socket chunks until EOF or an error. Dropping both senders on exit
/// closes the channels.
async fn read_loop(
    mut reader: OwnedReadHalf,
    packet_tx: mpsc::Sender<Bytes>,
    error_tx: mpsc::Sender<ConnectionError>,
    alive: Arc<AtomicBool>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let failure = loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break ConnectionError::Closed,
            Ok(n) => {
                debug!("rx {} bytes", n);
                if packet_tx.send(buf.split().freeze()).await.is_err() {
                    // Nobody listening any more
                    break ConnectionError::Closed;
                }
            }
            Err(e) => break ConnectionError::Io(e),
        }
    };

    alive.store(false, Ordering::SeqCst);
    if !failure.is_closed() {
        warn!("reader link failed: {}", failure);
    }
    let _ = error_tx.send(failure).await;
}
