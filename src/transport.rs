use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Byte pipe to a reader, used for request/response exchanges such as probing.
/// Implement this trait for different transports (TCP socket, in-memory mock, ...)
#[async_trait]
pub trait ReaderTransport: Send {
    /// Error type for transport operations
    type Error: std::fmt::Debug + Send;

    /// Write data to the transport
    async fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Read available data, waiting at most `timeout`.
    ///
    /// `Ok(0)` means nothing arrived in time; errors mean the pipe is unusable.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error>;

    /// Drop whatever is already buffered on the input side
    async fn clear_input(&mut self) -> Result<(), Self::Error>;
}

#[async_trait]
impl ReaderTransport for TcpStream {
    type Error = io::Error;

    async fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        self.write_all(data).await?;
        Ok(data.len())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        match tokio::time::timeout(timeout, AsyncReadExt::read(self, buf)).await {
            Ok(Ok(0)) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }

    async fn clear_input(&mut self) -> Result<(), Self::Error> {
        let mut scratch = [0u8; 256];
        loop {
            match self.try_read(&mut scratch) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
