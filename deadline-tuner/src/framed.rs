//! Length-prefixed message framing over TCP.
//!
//! Wire format of one frame:
//!
//! ```text
//!  0               4
//!  +---------------+---------------------------+
//!  | len (u32, BE) | payload (len bytes)       |
//!  +---------------+---------------------------+
//! ```
//!
//! [`FramedTcp`] is the client-side [`Transport`]; [`serve_echo`] is the
//! matching server that sends every frame straight back.
//!
//! A send or receive dropped half-way (deadline expiry) leaves the byte
//! stream in an unknown position.  The transport notices this on the next
//! send and reconnects before writing, so one expired attempt does not
//! poison every attempt after it.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::DEFAULT_MAX_PAYLOAD;
use crate::transport::{TransferError, Transport};

/// Reject a payload that cannot be sent as one frame.
fn check_frame_len(len: usize, max: usize) -> Result<(), TransferError> {
    if len > max || len > u32::MAX as usize {
        return Err(TransferError::FrameTooLarge { len, max });
    }
    Ok(())
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: usize) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    check_frame_len(payload.len(), max)?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.  A clean EOF before the length prefix is
/// [`TransferError::Closed`].
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(TransferError::Closed),
        Err(e) => return Err(e.into()),
    };
    if len > max {
        return Err(TransferError::FrameTooLarge { len, max });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Client transport
// ---------------------------------------------------------------------------

/// Framed client connection.
#[derive(Debug)]
pub struct FramedTcp {
    stream: Option<TcpStream>,
    /// Where to reconnect after the stream falls out of sync.
    /// `None` for streams handed in via [`FramedTcp::from_stream`].
    peer: Option<SocketAddr>,
    max_frame: usize,
    /// Cleared when a send starts, set again once its reply has been read.
    in_sync: bool,
    reconnects: u64,
}

impl FramedTcp {
    /// Connect to `peer`.
    pub async fn connect(peer: SocketAddr) -> Result<Self, TransferError> {
        let stream = TcpStream::connect(peer).await?;
        stream.set_nodelay(true)?;
        log::debug!("[framed] connected to {peer}");
        Ok(Self {
            stream: Some(stream),
            peer: Some(peer),
            max_frame: DEFAULT_MAX_PAYLOAD,
            in_sync: true,
            reconnects: 0,
        })
    }

    /// Wrap an already-connected stream.  Such a transport cannot reconnect.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            peer: None,
            max_frame: DEFAULT_MAX_PAYLOAD,
            in_sync: true,
            reconnects: 0,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// How many times the stream was replaced after falling out of sync.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    async fn resync(&mut self) -> Result<(), TransferError> {
        // Drop the desynchronised stream first; the server sees EOF.
        self.stream = None;
        let peer = self.peer.ok_or(TransferError::Closed)?;
        let stream = TcpStream::connect(peer).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.in_sync = true;
        self.reconnects += 1;
        log::debug!("[framed] stream out of sync; reconnected to {peer} (#{})", self.reconnects);
        Ok(())
    }
}

impl Transport for FramedTcp {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransferError> {
        let max = self.max_frame;
        // A rejected frame never touches the stream, so it stays in sync.
        check_frame_len(payload.len(), max)?;
        if !self.in_sync {
            self.resync().await?;
        }
        let stream = self.stream.as_mut().ok_or(TransferError::Closed)?;
        self.in_sync = false;
        write_frame(stream, payload, max).await
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransferError> {
        let max = self.max_frame;
        let stream = self.stream.as_mut().ok_or(TransferError::Closed)?;
        let frame = read_frame(stream, max).await?;
        self.in_sync = true;
        Ok(frame)
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Echo server
// ---------------------------------------------------------------------------

/// Accept connections forever, echoing every frame back on each one.
///
/// Each connection runs on its own task and ends when the peer closes it or
/// sends a malformed frame.
pub async fn serve_echo(listener: TcpListener, max_frame: usize) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        log::info!("[server] accepted {peer}");
        tokio::spawn(async move {
            match echo_connection(stream, max_frame).await {
                Ok(frames) => log::info!("[server] {peer} closed after {frames} frame(s)"),
                Err(e) => log::warn!("[server] {peer} dropped: {e}"),
            }
        });
    }
}

async fn echo_connection(mut stream: TcpStream, max_frame: usize) -> Result<u64, TransferError> {
    stream.set_nodelay(true)?;
    let (mut rd, mut wr) = stream.split();
    let mut frames = 0u64;
    loop {
        let frame = match read_frame(&mut rd, max_frame).await {
            Ok(frame) => frame,
            Err(TransferError::Closed) => return Ok(frames),
            Err(e) => return Err(e),
        };
        write_frame(&mut wr, &frame, max_frame).await?;
        frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_layout_is_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc", 16).await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, b'a', b'b', b'c']);

        let mut rd: &[u8] = &buf;
        assert_eq!(read_frame(&mut rd, 16).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn oversized_frames_rejected_both_ways() {
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &[0u8; 8], 4).await.unwrap_err();
        assert!(matches!(err, TransferError::FrameTooLarge { len: 8, max: 4 }));
        assert!(buf.is_empty());

        let raw = [0u8, 0, 0, 9, 1, 2, 3];
        let mut rd: &[u8] = &raw;
        let err = read_frame(&mut rd, 4).await.unwrap_err();
        assert!(matches!(err, TransferError::FrameTooLarge { len: 9, max: 4 }));
    }

    #[tokio::test]
    async fn eof_before_prefix_is_closed() {
        let mut rd: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut rd, 4).await,
            Err(TransferError::Closed)
        ));
    }
}
