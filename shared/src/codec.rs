//! Length-prefixed framing for [`Message`] over a byte stream.
//!
//! Every frame is a 4-byte big-endian payload length followed by the bincode
//! encoding of one message. TCP hands us an arbitrary split of that stream, so
//! readers either await whole frames ([`read_message`]) or feed raw chunks into
//! a [`FrameBuffer`] and pull complete messages out of it.

use crate::Message;
use bincode::Options;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 4;
/// Largest payload a peer may announce.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the peer sent bytes we refuse, as opposed to the transport failing.
    pub fn is_peer_fault(&self) -> bool {
        !matches!(self, ProtocolError::ConnectionLost(_))
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .with_limit(MAX_FRAME_LEN as u64)
}

/// Encodes one message into a complete frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = wire_options()
        .serialize(message)
        .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes exactly one frame. Anything short of, or beyond, a single complete
/// frame is malformed.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedMessage(format!(
            "truncated header: {} of {} bytes",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let len = parse_header(&bytes[..HEADER_LEN])?;
    let body = &bytes[HEADER_LEN..];

    if body.len() < len {
        return Err(ProtocolError::MalformedMessage(format!(
            "truncated payload: {} of {} bytes",
            body.len(),
            len
        )));
    }
    if body.len() > len {
        return Err(ProtocolError::MalformedMessage(format!(
            "{} trailing bytes after frame",
            body.len() - len
        )));
    }

    decode_payload(body)
}

fn parse_header(header: &[u8]) -> Result<usize, ProtocolError> {
    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(&header[..HEADER_LEN]);
    let len = u32::from_be_bytes(raw) as usize;

    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

fn decode_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    let message: Message = wire_options()
        .deserialize(payload)
        .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
    message.validate()?;
    Ok(message)
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed as a frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pops the next complete message, or `Ok(None)` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = parse_header(&self.buf[..HEADER_LEN])?;
        let end = HEADER_LEN + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let message = decode_payload(&self.buf[HEADER_LEN..end]);
        self.buf.drain(..end);
        message.map(Some)
    }
}

/// Reads one message. Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
///
/// A stream that ends inside a frame is a `ConnectionLost`, since more bytes
/// could never arrive. A truncated frame already in memory is rejected by
/// [`decode`] as `MalformedMessage`.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;

    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::ConnectionLost(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside a frame header",
            )));
        }
        filled += n;
    }

    let len = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    decode_payload(&payload).map(Some)
}

/// Writes an already encoded frame.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    write_frame(writer, &frame).await
}
