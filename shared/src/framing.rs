//! Agent ↔ collector framing.
//!
//! The link is a single duplex byte stream carrying typed frames:
//!
//! ```text
//!   ┌─────────┬──────────────┬─────────────────┐
//!   │ op (u8) │ len (u32 BE) │ payload (len B) │
//!   └─────────┴──────────────┴─────────────────┘
//! ```
//!
//! `Text` carries JSON events (agent → collector) or commands
//! (collector → agent). `Binary` carries one fixed-size event record.
//! `Ping`/`Pong` are the liveness probe and its answer.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Orderly shutdown with a human-readable reason.
    Close(String),
}

impl Frame {
    fn opcode(&self) -> u8 {
        match self {
            Frame::Text(_) => OP_TEXT,
            Frame::Binary(_) => OP_BINARY,
            Frame::Ping(_) => OP_PING,
            Frame::Pong(_) => OP_PONG,
            Frame::Close(_) => OP_CLOSE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Frame::Text(s) | Frame::Close(s) => s.as_bytes(),
            Frame::Binary(b) | Frame::Ping(b) | Frame::Pong(b) => b,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the stream")]
    Closed,

    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("text frame is not UTF-8: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => FrameError::Closed,
            _ => FrameError::Io(e),
        }
    }
}

/// Read exactly one frame. Oversized frames are refused before allocating.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 5];
    reader.read_exact(&mut head).await?;
    let op = head[0];
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(match op {
        OP_TEXT => Frame::Text(String::from_utf8(payload)?),
        OP_BINARY => Frame::Binary(payload),
        OP_PING => Frame::Ping(payload),
        OP_PONG => Frame::Pong(payload),
        OP_CLOSE => Frame::Close(String::from_utf8_lossy(&payload).into_owned()),
        other => return Err(FrameError::UnknownOpcode(other)),
    })
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = frame.payload();
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut head = [0u8; 5];
    head[0] = frame.opcode();
    head[1..].copy_from_slice(&len.to_be_bytes());

    writer.write_all(&head).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
