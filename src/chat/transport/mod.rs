//! Transport layer for chat connections.
//!
//! Frames are `[u32 big-endian length][JSON envelope]`. This module holds the
//! framing helpers, the async [`MessageTransport`] trait and [`Framed`], which
//! implements it over any split reader/writer pair.

mod tcp;

pub use tcp::{TcpConnection, TcpListener};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ErrorKind,
};

use crate::chat::config::DEFAULT_MAX_FRAME_LEN;
use crate::chat::error::ChatError;
use crate::chat::protocol::{from_bytes, to_bytes};

/// Trait for bidirectional async message transport.
#[async_trait]
pub trait MessageTransport: Send {
    /// Send one message as a single frame.
    async fn send<M: Serialize + Sync>(&mut self, message: &M) -> Result<(), ChatError>;

    /// Receive the next message, or `None` if the peer closed cleanly.
    async fn receive<M: DeserializeOwned + Send>(&mut self) -> Result<Option<M>, ChatError>;

    /// Flush and shut down the write side.
    async fn close(&mut self) -> Result<(), ChatError>;

    /// Peer address as a string, for logging.
    fn peer_addr(&self) -> String;
}

/// Write a length-prefixed frame and flush it.
pub async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ChatError> {
    let len = u32::try_from(data.len()).map_err(|_| ChatError::FrameTooLarge {
        len: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` if the stream ends cleanly on a frame boundary. A stream
/// that ends inside the prefix or the body yields
/// [`ChatError::TruncatedMessage`]; partial data is discarded. Zero-length
/// frames are keepalives and are skipped.
pub async fn read_length_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>, ChatError> {
    loop {
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            let n = reader.read(&mut len_bytes[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(ChatError::TruncatedMessage)
                };
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len == 0 {
            continue;
        }
        if len > max_len {
            return Err(ChatError::FrameTooLarge { len, max: max_len });
        }

        let mut data = vec![0u8; len];
        match reader.read_exact(&mut data).await {
            Ok(_) => return Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(ChatError::TruncatedMessage)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read half of a framed stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    /// Wrap a reader with the default frame size limit.
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_len(reader, DEFAULT_MAX_FRAME_LEN)
    }

    /// Wrap a reader with an explicit frame size limit.
    pub fn with_max_frame_len(reader: R, max_frame_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame_len,
        }
    }

    /// Read and decode the next message.
    pub async fn next<M: DeserializeOwned>(&mut self) -> Result<Option<M>, ChatError> {
        match read_length_prefixed(&mut self.inner, self.max_frame_len).await? {
            Some(data) => from_bytes(&data).map(Some),
            None => Ok(None),
        }
    }
}

/// Write half of a framed stream.
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
        }
    }

    /// Encode and write one message.
    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<(), ChatError> {
        let data = to_bytes(message)?;
        write_length_prefixed(&mut self.inner, &data).await
    }

    /// Unwrap the underlying writer. Every `send` flushes, so nothing is lost.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }

    /// Flush and shut down the underlying writer.
    pub async fn shutdown(&mut self) -> Result<(), ChatError> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A framed, bidirectional connection over a reader/writer pair.
pub struct Framed<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    peer_addr: String,
}

impl<R, W> Framed<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, peer_addr: impl Into<String>) -> Self {
        Self::with_max_frame_len(reader, writer, peer_addr, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(
        reader: R,
        writer: W,
        peer_addr: impl Into<String>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            reader: FrameReader::with_max_frame_len(reader, max_frame_len),
            writer: FrameWriter::new(writer),
            peer_addr: peer_addr.into(),
        }
    }

    /// Split into independently owned halves.
    pub fn into_parts(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl<R, W> MessageTransport for Framed<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send<M: Serialize + Sync>(&mut self, message: &M) -> Result<(), ChatError> {
        self.writer.send(message).await
    }

    async fn receive<M: DeserializeOwned + Send>(&mut self) -> Result<Option<M>, ChatError> {
        self.reader.next().await
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.shutdown().await
    }

    fn peer_addr(&self) -> String {
        self.peer_addr.clone()
    }
}
