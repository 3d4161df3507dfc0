// TCP stream connection to the archiver
//
// TCP delivers a byte stream, not messages: a single receive may return part
// of a sample frame or several frames at once. `StreamConnection` keeps every
// byte it has received but not yet handed out in `pending`, so callers can ask
// for exact lengths and never lose data across calls.

use crate::streaming::types::{StreamError, StreamResult};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Largest single receive
pub const RECV_CHUNK: usize = 64 * 1024;

pub struct StreamConnection<S> {
    stream: S,
    pending: BytesMut,
    scratch: Vec<u8>,
    peer: String,
}

impl StreamConnection<TcpStream> {
    /// Opens a TCP connection, failing with `Connect` on refusal or timeout.
    pub async fn connect<A>(address: A, timeout: Duration) -> StreamResult<Self>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let peer = address.to_string();
        log::debug!("Connecting to archiver at {}", peer);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(StreamError::Connect(format!(
                    "TCP connection to {} failed: {}",
                    peer, e
                )))
            }
            Err(_) => {
                return Err(StreamError::Connect(format!(
                    "TCP connection to {} timed out after {:?}",
                    peer, timeout
                )))
            }
        };
        stream.set_nodelay(true)?;

        Ok(Self::with_peer(stream, peer))
    }
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already connected stream.
    pub fn new(stream: S) -> Self {
        Self::with_peer(stream, "stream".to_string())
    }

    fn with_peer(stream: S, peer: String) -> Self {
        Self {
            stream,
            pending: BytesMut::with_capacity(RECV_CHUNK),
            scratch: vec![0u8; RECV_CHUNK],
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Bytes received but not yet consumed
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub async fn send(&mut self, bytes: &[u8]) -> StreamResult<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// One receive of up to `RECV_CHUNK` bytes appended to `pending`.
    async fn recv_chunk(&mut self, timeout: Duration) -> StreamResult<usize> {
        let count = tokio::time::timeout(timeout, self.stream.read(&mut self.scratch))
            .await
            .map_err(|_| StreamError::Timeout(timeout))??;
        if count == 0 {
            return Err(StreamError::Eof);
        }
        self.pending.extend_from_slice(&self.scratch[..count]);
        Ok(count)
    }

    /// Returns exactly `n` bytes, keeping any excess for the next call.
    pub async fn recv_exact(&mut self, n: usize, timeout: Duration) -> StreamResult<Bytes> {
        while self.pending.len() < n {
            self.recv_chunk(timeout).await?;
        }
        Ok(self.pending.split_to(n).freeze())
    }

    /// Returns the bytes up to and including the next newline.
    pub async fn recv_line(&mut self, timeout: Duration) -> StreamResult<Bytes> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.pending[scanned..].iter().position(|&b| b == b'\n') {
                return Ok(self.pending.split_to(scanned + pos + 1).freeze());
            }
            scanned = self.pending.len();
            self.recv_chunk(timeout).await?;
        }
    }

    /// Returns everything until the peer closes the connection.
    pub async fn recv_to_end(&mut self, timeout: Duration) -> StreamResult<Bytes> {
        loop {
            match self.recv_chunk(timeout).await {
                Ok(_) => continue,
                Err(StreamError::Eof) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.pending.split().freeze())
    }

    /// Shuts down the write side; errors are irrelevant at this point.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            log::debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }
}
