//! Draft-76 framing.
//!
//! Once the handshake completes, every text message travels as a single
//! frame: a `0x00` byte, the UTF-8 payload, then a `0xFF` terminator. There
//! is no length prefix and no escaping, so a payload can never contain
//! `0xFF`. The server closes a connection by sending `0xFF 0x00`.
//!
//! # Examples
//!
//! ```
//! use hixie_core::frame::{self, Frame};
//!
//! # async fn example() -> hixie_core::Result<()> {
//! let wire = frame::encode("Hello");
//! assert_eq!(&wire[..], b"\x00Hello\xff");
//!
//! let mut reader = &wire[..];
//! let decoded = frame::decode_one(&mut reader, 1024).await?;
//! assert_eq!(decoded, Frame::Text("Hello".to_string()));
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Lead byte of a text frame.
pub const TEXT_START: u8 = 0x00;

/// Terminator of a text frame.
pub const TEXT_END: u8 = 0xFF;

/// The two-byte sequence a server sends to close the connection.
pub const CLOSE_FRAME: [u8; 2] = [0xFF, 0x00];

/// One unit of protocol data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete text message.
    Text(String),

    /// A frame starting with anything other than `0x00`. This includes the
    /// `0xFF` that opens a client close request.
    UnsupportedLeadByte(u8),

    /// The close sequence. Only ever produced locally, never decoded.
    Close,

    /// The peer closed the stream.
    Disconnected,
}

impl Frame {
    /// Returns the bytes that put this frame on the wire.
    ///
    /// An unsupported lead byte encodes as itself, which is how the server
    /// acknowledges it. `Disconnected` has no wire form.
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Text(text) => encode(text),
            Frame::UnsupportedLeadByte(byte) => Bytes::copy_from_slice(&[*byte]),
            Frame::Close => Bytes::from_static(&CLOSE_FRAME),
            Frame::Disconnected => Bytes::new(),
        }
    }

    /// Returns the payload of a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Encodes `text` as a single text frame.
///
/// A `0xFF` can never appear inside valid UTF-8, so the output is always
/// unambiguous.
pub fn encode(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 2);
    buf.put_u8(TEXT_START);
    buf.put_slice(text.as_bytes());
    buf.put_u8(TEXT_END);
    buf.freeze()
}

/// Reads exactly one frame from `reader`.
///
/// A stream that ends before the first byte, or in the middle of a text
/// frame, yields [`Frame::Disconnected`].
///
/// # Errors
///
/// - [`Error::FrameTooLarge`] if the payload grows past `max_len` bytes
/// - [`Error::InvalidUtf8`] if the payload is not UTF-8
/// - [`Error::Io`] for any socket failure
pub async fn decode_one<R>(reader: &mut R, max_len: usize) -> Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let lead = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(Frame::Disconnected);
        }
        Err(e) => return Err(e.into()),
    };

    if lead != TEXT_START {
        return Ok(Frame::UnsupportedLeadByte(lead));
    }

    let mut payload = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(Frame::Disconnected);
        }

        let end = available.iter().position(|&b| b == TEXT_END);
        let chunk = &available[..end.unwrap_or(available.len())];
        if payload.len() + chunk.len() > max_len {
            return Err(Error::FrameTooLarge { limit: max_len });
        }
        payload.extend_from_slice(chunk);

        let consumed = end.map_or(chunk.len(), |i| i + 1);
        reader.consume(consumed);

        if end.is_some() {
            break;
        }
    }

    String::from_utf8(payload)
        .map(Frame::Text)
        .map_err(|_| Error::InvalidUtf8)
}
