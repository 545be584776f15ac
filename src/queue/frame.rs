//! Wire framing for the request queue. All integers are big-endian.
//!
//! ```text
//! client->server handshake:  [i64 nodeId]
//! request frame:            [u32 seqno][u32 len][len bytes payload]
//! ack frame:                [u32 seqno][u8 ok][u32 msgLen][utf8 msg]
//! ```
//!
//! `ok` is 1 for success (then `msgLen` is 0) or 0 for a failure carrying
//! a descriptive message.

use std::io::{Read, Write};

use thiserror::Error;

/// Upper bound on a request payload; a frame claiming more is corrupt.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Upper bound on an ack failure message.
pub const MAX_ACK_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request payload too large: max {max} got {got}")]
    PayloadTooLarge { max: usize, got: usize },
    #[error("ack message too large: max {max} got {got}")]
    AckMessageTooLarge { max: usize, got: usize },
    #[error("ack message is not valid utf-8")]
    AckMessageInvalid,
}

/// An acknowledgement for one request. `failure` carries the peer-side
/// failure message, if the request's execution failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub seqno: u32,
    pub failure: Option<String>,
}

pub fn write_handshake(writer: &mut impl Write, node_id: i64) -> Result<(), FrameError> {
    writer.write_all(&node_id.to_be_bytes())?;
    writer.flush()?;
    Ok(())
}

pub fn read_handshake(reader: &mut impl Read) -> Result<i64, FrameError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

pub fn write_request(
    writer: &mut impl Write,
    seqno: u32,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD_BYTES,
            got: payload.len(),
        });
    }
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&seqno.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads the next request frame. Returns `None` on a clean end of stream
/// at a frame boundary.
pub fn read_request(reader: &mut impl Read) -> Result<Option<(u32, Vec<u8>)>, FrameError> {
    let mut header = [0u8; 8];
    if !read_full(reader, &mut header)? {
        return Ok(None);
    }
    let seqno = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_PAYLOAD_BYTES {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD_BYTES,
            got: len,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some((seqno, payload)))
}

pub fn write_ack(writer: &mut impl Write, ack: &Ack) -> Result<(), FrameError> {
    let message = ack.failure.as_deref().unwrap_or("");
    if message.len() > MAX_ACK_MESSAGE_BYTES {
        return Err(FrameError::AckMessageTooLarge {
            max: MAX_ACK_MESSAGE_BYTES,
            got: message.len(),
        });
    }
    let mut frame = Vec::with_capacity(9 + message.len());
    frame.extend_from_slice(&ack.seqno.to_be_bytes());
    frame.push(if ack.failure.is_none() { 1 } else { 0 });
    frame.extend_from_slice(&(message.len() as u32).to_be_bytes());
    frame.extend_from_slice(message.as_bytes());
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads the next ack frame. Returns `None` on a clean end of stream at a
/// frame boundary.
pub fn read_ack(reader: &mut impl Read) -> Result<Option<Ack>, FrameError> {
    let mut header = [0u8; 9];
    if !read_full(reader, &mut header)? {
        return Ok(None);
    }
    let seqno = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let ok = header[4] == 1;
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_ACK_MESSAGE_BYTES {
        return Err(FrameError::AckMessageTooLarge {
            max: MAX_ACK_MESSAGE_BYTES,
            got: len,
        });
    }
    let mut message = vec![0u8; len];
    reader.read_exact(&mut message)?;
    let failure = if ok {
        None
    } else {
        Some(String::from_utf8(message).map_err(|_| FrameError::AckMessageInvalid)?)
    };
    Ok(Some(Ack { seqno, failure }))
}

/// Fills `buf`, returning `false` if the stream was already at a clean
/// end. An end of stream mid-buffer is an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, FrameError> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "frame truncated",
            )
            .into());
        }
        read += n;
    }
    Ok(true)
}
